// 纯路由层
use crate::handler::{
    SharedState, echo_handler, exams_handler, gpa_handler, grades_handler, observe_handler, say_handler
};

use anyhow::{Context, Result};
use axum::{routing::{get, post}, Router};
use rust_embed::RustEmbed;
use tera::Tera;

// 回复模板打包进可执行文件
// folder 路径是相对于 Cargo.toml 文件的
#[derive(RustEmbed)]
#[folder = "templates/"]
struct Asset;

/// 把嵌入的模板全部注册到 Tera
pub fn build_tera() -> Result<Tera> {
    let mut tera = Tera::default();

    for file_path in Asset::iter() {
        if let Some(embedded_file) = Asset::get(&file_path) {
            let content = std::str::from_utf8(embedded_file.data.as_ref())?;
            tera.add_raw_template(&file_path, content).with_context(|| format!("导入模板失败: {}", file_path))?;
        }
    }

    Ok(tera)
}

pub fn create_router(state: SharedState) -> Router {
    Router::new()
        .route("/gpa", post(gpa_handler))       // 绩点
        .route("/grades", post(grades_handler)) // 各科成绩
        .route("/exams", post(exams_handler))   // 考试安排
        .route("/observe", post(observe_handler))   // 学习群消息
        .route("/say", get(say_handler))        // 随机说话
        .route("/echo", post(echo_handler))     // 复读
        .with_state(state)
}
