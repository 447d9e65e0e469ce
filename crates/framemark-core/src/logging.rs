//! 日志初始化
//!
//! 宿主进程调用一次 `init_tracing` 安装全局订阅者；重复调用同一级别是幂等的。

use std::sync::OnceLock;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

static INSTALLED_LEVEL: OnceLock<Level> = OnceLock::new();

/// 解析日志级别（不区分大小写）
pub fn parse_level(level: &str) -> Result<Level, String> {
    level
        .trim()
        .parse::<Level>()
        .map_err(|_| format!("unsupported log level `{level}`"))
}

/// 安装全局 `FmtSubscriber`
///
/// 级别无效、已用其他级别初始化、或已有其他全局订阅者时返回错误信息，不会 panic。
pub fn init_tracing(level: &str) -> Result<(), String> {
    let level = parse_level(level)?;

    if let Some(installed) = INSTALLED_LEVEL.get() {
        if *installed == level {
            return Ok(());
        }
        return Err(format!(
            "tracing already initialized with level `{installed}`; refusing to switch to `{level}`"
        ));
    }

    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| format!("failed to install tracing subscriber: {e}"))?;
    let _ = INSTALLED_LEVEL.set(level);

    tracing::info!("Tracing initialized at level {}", level);
    Ok(())
}
