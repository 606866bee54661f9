//! 日志初始化模块
//!
//! 为推送与会议子系统提供统一的 tracing 日志初始化能力。

use tracing_subscriber::{EnvFilter, fmt};

/// 从配置初始化日志系统
///
/// 优先使用环境变量 `RUST_LOG`，如果没有则使用配置文件的日志级别。
/// 重复初始化（如测试中）会被忽略。
pub fn init_tracing_from_config(logging_config: Option<&crate::config::LoggingConfig>) {
    let env_filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => {
            let level_str = logging_config.map(|c| c.level.as_str()).unwrap_or("debug");
            EnvFilter::new(level_str)
        }
    };

    let default_config = crate::config::LoggingConfig::default();
    let config = logging_config.unwrap_or(&default_config);

    let result = fmt::Subscriber::builder()
        .with_target(config.with_target)
        .with_thread_ids(config.with_thread_ids)
        .with_file(config.with_file)
        .with_line_number(config.with_line_number)
        .with_env_filter(env_filter)
        .try_init();

    if result.is_err() {
        tracing::debug!("tracing subscriber already initialized, skipping");
    }
}
