use thiserror::Error;

/// Error kinds surfaced across the dispatch core. Not every variant is fatal to
/// the event that raised it; see the propagation policy on each call site.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("message filtered out: {0}")]
    FilteredOut(String),

    #[error("provider {provider} is rate limited")]
    RateLimited { provider: String },

    #[error("provider {provider} network error: {source}")]
    ProviderNetwork {
        provider: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("provider {provider} returned a fatal error: {message}")]
    ProviderFatal { provider: String, message: String },

    #[error("no avatar slot available")]
    NoSlotAvailable,

    #[error("queue overflow, message dropped")]
    QueueOverflow,

    #[error("cancelled by moderation action")]
    ModerationCancel,

    #[error("chat source authentication expired")]
    AuthExpired,
}

impl DispatchError {
    /// Whether the hybrid provider router should attempt a fallback voice for this error.
    pub fn triggers_fallback(&self) -> bool {
        matches!(
            self,
            DispatchError::RateLimited { .. }
                | DispatchError::ProviderNetwork { .. }
                | DispatchError::ProviderFatal { .. }
        )
    }
}
