use thiserror::Error;

/// A single send was rejected. Never retried by the session.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeliveryError {
    #[error("session is not connected")]
    NotConnected,
    #[error("invalid recipient: {0}")]
    InvalidRecipient(String),
    #[error("rate limited by the server")]
    RateLimited,
    #[error("send timed out")]
    Timeout,
    #[error("send rejected: {0}")]
    Rejected(String),
}

/// Opening a transport connection failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectError {
    /// The transport cannot work with the configuration it was given.
    /// Fatal: retrying will not help.
    #[error("transport misconfigured: {0}")]
    Configuration(String),
    /// Network-level failure; worth another attempt later.
    #[error("transport unavailable: {0}")]
    Unavailable(String),
}

/// Authenticated teardown did not complete; the session state is unknown.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LogoutError {
    #[error("no active session")]
    NotConnected,
    #[error("logout failed: {0}")]
    Failed(String),
}
