use crate::domains::export::types::{ExportConfig, ExportResult};
use once_cell::sync::OnceCell;

static EXPORT_CONFIG: OnceCell<ExportConfig> = OnceCell::new();

/// Initialize `env_logger`, defaulting `RUST_LOG` to `debug` in debug builds
/// and `info` otherwise. Safe to call more than once.
pub fn init_logging() {
    if std::env::var("RUST_LOG").is_err() {
        #[cfg(debug_assertions)]
        std::env::set_var("RUST_LOG", "debug");
        #[cfg(not(debug_assertions))]
        std::env::set_var("RUST_LOG", "info");
    }

    // Initialize env_logger if not already initialized
    let _ = env_logger::try_init();
}

/// Process-wide default configuration, read from the environment on first use
pub fn export_config() -> ExportResult<&'static ExportConfig> {
    EXPORT_CONFIG.get_or_try_init(|| {
        let config = ExportConfig::from_env()?;
        log::debug!("Loaded export configuration: {:?}", config);
        Ok(config)
    })
}

/// Whether the process-wide configuration has been loaded
pub fn is_initialized() -> bool {
    EXPORT_CONFIG.get().is_some()
}
