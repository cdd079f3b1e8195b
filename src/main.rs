use std::sync::Arc;

use anyhow::{Context, Result};
use axum::serve;
use tokio::net::TcpListener;
use tracing::{info, warn};
use zjuer_bot::{
    chat::ChatTokenizer,
    config::AppConfig,
    handler::AppState,
    logging::init_logging,
    markov::MarkovChain,
    router::{build_tera, create_router}
};

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();
    info!("初始化服务中...");

    let config = AppConfig::load_from_env()?;

    // 初始化模板引擎
    let tera = build_tera().context("构建模板失败")?;

    // 读取马尔可夫链快照, 读不出来就从空模型开始
    let mut chain = MarkovChain::new(config.markov.order);
    match chain.load(&config.markov.snapshot) {
        Ok(true) => info!(order = chain.order(), contexts = chain.context_count(), "已载入马尔可夫链快照"),
        Ok(false) => info!(order = chain.order(), "没有马尔可夫链快照, 使用空模型"),
        Err(e) => warn!(error = %e, "马尔可夫链快照无法读取, 使用空模型")
    }

    // 加载分词词典比较慢, 放到阻塞线程里
    let tokenizer = tokio::task::spawn_blocking(ChatTokenizer::new).await.context("分词器初始化失败")?;

    let addr = config.server.bind;
    let state = AppState::new(tera, config, chain, tokenizer);
    let app = create_router(Arc::clone(&state));

    // 绑定地址到 TCP 监听器
    let listener = TcpListener::bind(addr).await.with_context(|| format!("无法绑定到地址 {}", addr))?;
    info!("命令服务运行于 http://{}", addr);

    serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await
        .context("服务运行失败")?;

    // 退出前保存一次模型
    let snapshot = &state.config.markov.snapshot;
    if let Err(e) = state.markov.read().await.persist(snapshot).await {
        warn!(error = %e, "退出时保存马尔可夫链失败");
    }
    info!("服务已停止");

    Ok(())
}
