//! 日志初始化
//!
//! 默认 `info`，可通过 `RUST_LOG` 覆盖。

use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// 安装全局 subscriber
///
/// 已经安装过时返回 `false`（测试中多次调用不会 panic）。
pub fn init_tracing(format: LogFormat) -> bool {
    let filter = EnvFilter::from_default_env().add_directive(LevelFilter::INFO.into());
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let result = match format {
        LogFormat::Pretty => builder.try_init(),
        LogFormat::Json => builder.json().try_init(),
    };
    result.is_ok()
}
