use std::path::PathBuf;

/// Central error type for mixd.
#[derive(Debug, thiserror::Error)]
pub enum MixError {
    #[error("config error: {0}")]
    Config(String),

    #[error("config file not found: {0}")]
    ConfigNotFound(PathBuf),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    /// The serial port exists but is occupied or access was denied.
    /// Terminal: another monitor or mixd instance owns the port.
    #[error("serial port {port} is busy or access denied")]
    TransportBusy { port: String },

    /// The configured port or URL does not exist or is unreachable.
    /// Recoverable: the supervisor may fall back to the other transport.
    #[error("transport endpoint missing: {endpoint}")]
    TransportMissing { endpoint: String },

    /// Mid-stream failure on an established connection. Triggers reconnect.
    #[error("transport I/O error: {0}")]
    TransportIo(String),

    /// A volume/mute call reported the underlying session as stale.
    #[error("session refresh required: {0}")]
    SessionRefreshRequired(String),

    #[error("session backend error: {0}")]
    SessionBackend(String),

    #[error("relay server error: {0}")]
    Relay(String),

    #[error("executable not found: {app}")]
    ExecutableNotFound { app: String },

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("execution failed: {0}")]
    ExecutionFailed(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("keystroke synthesis unavailable: {0}")]
    KeystrokeUnavailable(String),

    #[error("action cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("watcher error: {0}")]
    Watcher(String),
}

impl MixError {
    /// True for errors the user should see as a notification rather than
    /// only a log line.
    pub fn is_user_facing(&self) -> bool {
        matches!(
            self,
            Self::ExecutableNotFound { .. }
                | Self::Timeout(_)
                | Self::ExecutionFailed(_)
                | Self::PermissionDenied(_)
                | Self::KeystrokeUnavailable(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, MixError>;
