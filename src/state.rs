use crate::config::AppConfig;
use crate::error::ProxyError;
use crate::transport::HttpTransport;

/// Shared application state accessible to all handlers.
///
/// Immutable after startup; handlers only read it.
#[derive(Debug)]
pub struct AppState {
    pub config: AppConfig,
    pub transport: HttpTransport,
}

impl AppState {
    #[must_use]
    pub fn new(config: AppConfig, transport: HttpTransport) -> Self {
        Self { config, transport }
    }

    /// Build the transport from `config` and wrap both.
    ///
    /// # Errors
    ///
    /// Propagates [`HttpTransport::new`] failures.
    pub fn from_config(config: AppConfig) -> Result<Self, ProxyError> {
        let transport = HttpTransport::new(&config.server, &config.upstream)?;
        Ok(Self::new(config, transport))
    }
}
