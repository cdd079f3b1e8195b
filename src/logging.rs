// 日志初始化
use tracing_subscriber::{EnvFilter, fmt, fmt::time::ChronoLocal};

pub const DEFAULT_FILTER: &str = "zjuer_bot=debug,info";

// 本地时间, 精确到微秒
const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.6f";

/// 可以用 RUST_LOG 覆盖默认的过滤规则
pub fn init_logging() {
    fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
        )
        .with_timer(ChronoLocal::new(TIME_FORMAT.to_string()))
        .init();
}
