use std::env;

use log::LevelFilter;
use once_cell::sync::OnceCell;

static INSTALLED: OnceCell<LevelFilter> = OnceCell::new();

/// Filter directives from `BITALINO_LOG`, falling back to `RUST_LOG`.
fn env_directives() -> Option<String> {
    env::var("BITALINO_LOG")
        .or_else(|_| env::var("RUST_LOG"))
        .ok()
        .filter(|v| !v.trim().is_empty())
}

/// Global level implied by the environment (`info` when unset).
pub fn env_level() -> LevelFilter {
    parse_level(env_directives().as_deref()).unwrap_or(LevelFilter::Info)
}

/// Parse a plain level name; module directives such as `bitalino_acq=debug`
/// are not levels and yield `None`.
pub fn parse_level(input: Option<&str>) -> Option<LevelFilter> {
    input.and_then(|s| s.trim().parse::<LevelFilter>().ok())
}

/// Initialize stderr logging for binaries based on `BITALINO_LOG`/`RUST_LOG`.
///
/// Safe to call multiple times; returns the level installed by the first call.
/// If the host application already set a logger, that logger is left alone.
pub fn init_rust_logging() -> LevelFilter {
    *INSTALLED.get_or_init(|| {
        let directives = env_directives().unwrap_or_else(|| "info".to_string());
        let installed = env_logger::Builder::new()
            .parse_filters(&directives)
            .format_timestamp_millis()
            .format_module_path(true)
            .format_target(true)
            .try_init();
        if installed.is_err() {
            log::debug!("logger already installed, keeping it");
        }
        env_level()
    })
}
