//! Core type definitions and protocol constants.

use std::time::Duration;

/// A 32-byte x25519 public key identifying a peer on the wire.
pub type Pubkey = [u8; 32];

/// Maximum length of a category name.
pub const MAX_CATEGORY_LENGTH: usize = 50;
/// Maximum length of a command name.
pub const MAX_COMMAND_LENGTH: usize = 200;

/// Keep-alive applied when a `send()` has to establish a new outbound
/// connection on its own. Call `connect()` first for a longer window.
pub const DEFAULT_SEND_KEEP_ALIVE: Duration = Duration::from_secs(30);

/// Default keep-alive for an explicit `connect()`.
pub const DEFAULT_CONNECT_KEEP_ALIVE: Duration = Duration::from_secs(5 * 60);

/// Authentication levels for connections and command categories.
///
/// `Denied` is not a level a stored peer can hold; it is only returned by the
/// allow-connection callback to refuse a handshake outright.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum AuthLevel {
    /// Refuse the connection. Never recorded in the peer table.
    Denied,
    /// No authentication; any curve-handshaked connection qualifies.
    None,
    /// Authenticated peer (a logged-in client or a configured public node).
    Basic,
    /// Administrative access, e.g. for shutdown or sensitive queries.
    Admin,
}

/// Access requirements for a command category.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Access {
    /// Minimum auth level a remote needs to invoke commands in the category.
    pub auth: AuthLevel,
    /// Only remotes authenticated as active service nodes may invoke.
    pub remote_sn: bool,
    /// The local node must itself be service-node capable.
    pub local_sn: bool,
}

impl Default for AuthLevel {
    fn default() -> Self {
        AuthLevel::None
    }
}

/// Outcome of the allow-connection callback for an inbound handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Allow {
    /// Initial auth level granted to the connection.
    pub auth: AuthLevel,
    /// Whether the remote is an active service node.
    pub service_node: bool,
}

impl Allow {
    /// Refuse the connection.
    #[must_use]
    pub const fn denied() -> Self {
        Allow {
            auth: AuthLevel::Denied,
            service_node: false,
        }
    }

    /// Admit the connection at the given level.
    #[must_use]
    pub const fn new(auth: AuthLevel, service_node: bool) -> Self {
        Allow { auth, service_node }
    }

    pub(crate) fn is_denied(self) -> bool {
        self.auth == AuthLevel::Denied
    }
}

/// Verbosity threshold for the instance's log output.
///
/// Events below the threshold are skipped before reaching the `tracing`
/// subscriber. The level is read with relaxed ordering; a change may take a
/// moment to be visible on other threads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    /// Per-frame chatter.
    Trace,
    /// Connection and dispatch details.
    Debug,
    /// Lifecycle events (binds, shutdown).
    Info,
    /// Dropped messages, denied commands, misconfiguration.
    Warn,
    /// Failures that disable part of the instance.
    Error,
}

impl LogLevel {
    pub(crate) fn from_u8(v: u8) -> LogLevel {
        match v {
            0 => LogLevel::Trace,
            1 => LogLevel::Debug,
            2 => LogLevel::Info,
            3 => LogLevel::Warn,
            _ => LogLevel::Error,
        }
    }
}
