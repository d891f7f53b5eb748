use thiserror::Error;

/// Errors surfaced by construction, registration, and startup.
///
/// Runtime delivery failures are never reported through this type: `send` and
/// `connect` are fire-and-forget and log instead.
#[derive(Error, Debug)]
pub enum Error {
    /// A construction parameter failed validation.
    #[error("invalid configuration: {0}")]
    Config(String),
    /// The category name is empty, too long, reserved, or contains a '.'.
    #[error("invalid category name: {0:?}")]
    InvalidCategoryName(String),
    /// The command name is empty or too long.
    #[error("invalid command name: {0:?}")]
    InvalidCommandName(String),
    /// A command or alias referenced a category that was never added.
    #[error("unknown category: {0:?}")]
    UnknownCategory(String),
    /// The category or command was already registered.
    #[error("duplicate registration: {0:?}")]
    Duplicate(String),
    /// Categories, commands, and aliases are immutable once started.
    #[error("instance already started")]
    AlreadyStarted,
    /// The proxy is quitting; no new control connections are handed out.
    #[error("instance shutting down")]
    ShuttingDown,
    /// Underlying transport error.
    #[error("transport error: {0}")]
    Transport(#[from] zmq::Error),
    /// Control-channel payload could not be encoded or decoded.
    #[error("control encoding error: {0}")]
    Encoding(#[from] serde_bencode::Error),
}
