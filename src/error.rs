//! Top-level error types for the gateway, and the classification the
//! dispatcher and supervisor use to decide retry/log/surface behavior.

/// Crate-wide result type alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error enum wrapping domain-specific errors.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Policy(#[from] PolicyError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Configuration loading errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to load config from {path}: {message}")]
    Load { path: String, message: String },

    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("missing required config key: {0}")]
    MissingKey(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Access-policy evaluation errors (spec.md §4.2).
#[derive(Debug, thiserror::Error)]
pub enum PolicyError {
    #[error("sender not allowed for {chat_type} on {channel}")]
    Denied { channel: String, chat_type: String },

    #[error("dm policy is disabled for {channel}")]
    DmDisabled { channel: String },

    #[error("group policy is disabled for {channel}")]
    GroupDisabled { channel: String },

    #[error("unauthorized control command in group")]
    UnauthorizedCommand,
}

/// Session / pairing store errors (spec.md I2, §4.5).
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("optimistic concurrency conflict: expected hash {expected}, found {actual}")]
    Conflict { expected: String, actual: String },

    #[error("store not found at {0}")]
    NotFound(String),

    #[error("failed to read store: {0}")]
    Read(String),

    #[error("failed to write store: {0}")]
    Write(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Agent dispatch and reply-formatting errors.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("agent stream error: {0}")]
    StreamError(String),

    #[error("agent route could not be resolved for channel={channel} account={account_id}")]
    RouteUnresolved { channel: String, account_id: String },

    #[error("delivery failed after retry: {0}")]
    DeliveryFailed(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Channel plugin / transport errors.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("channel {0} not registered")]
    NotRegistered(String),

    #[error("account {account_id} not configured for channel {channel}")]
    AccountNotConfigured { channel: String, account_id: String },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("credential resolution failed: {0}")]
    Credentials(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// The six error kinds of spec.md §7, used to decide how an error
/// propagates (retry silently, drop, surface to the user, kill the account).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Network hiccup, transport 5xx, stream interrupt. Retried at the layer
    /// that owns the operation; never surfaced to the user.
    Transient,
    /// Sender not allowed, dmPolicy=disabled, unauthorized command. Logged
    /// at verbose, no reply sent.
    PolicyDrop,
    /// Session store CAS failure. Retried up to 5x; on exhaustion the
    /// inbound is still delivered to the agent but the session update is
    /// dropped with a warning.
    Conflict,
    /// Malformed envelope, unparseable config. The single message is
    /// dropped with an error log; the account keeps running.
    PermanentValidation,
    /// Invalid credentials, repeated transport auth failure. Surfaces via
    /// `RuntimeStatus.lastError`; the account task exits.
    Fatal,
    /// The agent returned an error. The final payload carries the error
    /// marker and `abortedLastRun=true` is set.
    UserSurface,
}

/// Classifies an `Error` into one of the six propagation kinds of spec.md §7.
pub trait Classify {
    fn kind(&self) -> ErrorKind;
}

impl Classify for Error {
    fn kind(&self) -> ErrorKind {
        match self {
            Error::Policy(_) => ErrorKind::PolicyDrop,
            Error::Store(StoreError::Conflict { .. }) => ErrorKind::Conflict,
            Error::Store(_) => ErrorKind::PermanentValidation,
            Error::Config(_) => ErrorKind::Fatal,
            Error::Channel(ChannelError::Credentials(_)) => ErrorKind::Fatal,
            Error::Channel(ChannelError::Transport(_)) => ErrorKind::Transient,
            Error::Channel(_) => ErrorKind::PermanentValidation,
            Error::Dispatch(DispatchError::StreamError(_)) => ErrorKind::UserSurface,
            Error::Dispatch(_) => ErrorKind::PermanentValidation,
            Error::Io(_) => ErrorKind::Transient,
            Error::Other(_) => ErrorKind::PermanentValidation,
        }
    }
}
