//! Construction parameters and instance tunables.

use crate::error::Error;
use crate::message::Message;
use crate::types::{Allow, AuthLevel, Pubkey};
use std::sync::Arc;
use std::time::Duration;

/// Decides whether an inbound handshake may proceed and at what auth level.
/// Called once per handshake with the remote's IP and verified public key.
pub type AllowFn = Box<dyn Fn(&str, &Pubkey) -> Allow + Send + 'static>;

/// Resolves a peer public key to a connect address (e.g. `tcp://1.2.3.4:5678`)
/// when an outbound connection has to be established. Called at most once per
/// establishment; `None` drops the pending send.
pub type LookupFn = Box<dyn Fn(&Pubkey) -> Option<String> + Send + 'static>;

/// A registered command handler, invoked on a worker thread.
pub type CommandFn = Arc<dyn Fn(&mut Message<'_>) + Send + Sync + 'static>;

/// Construction parameters for a [`CurveMq`](crate::CurveMq) instance.
///
/// Fields are public; fill in what you need and leave the rest at
/// [`Config::default`]. Validation happens at construction.
pub struct Config {
    /// Local x25519 public key (32 bytes), or empty to generate an ephemeral
    /// keypair. Must be set together with `privkey`.
    pub pubkey: Vec<u8>,
    /// Local x25519 secret key (32 bytes), or empty.
    pub privkey: Vec<u8>,
    /// Whether this node is service-node capable (required for categories
    /// with a local-SN access policy). Requires an explicit keypair.
    pub service_node: bool,
    /// Transport URIs to listen on, e.g. `tcp://*:7800`. Empty means
    /// outbound-only.
    pub bind: Vec<String>,
    /// Address lookup for outbound establishment. Without one, sends to
    /// unconnected peers need an explicit hint.
    pub peer_lookup: Option<LookupFn>,
    /// Handshake admission policy. Defaults to admitting everyone at
    /// [`AuthLevel::None`].
    pub allow_connection: Option<AllowFn>,
    /// Upper bound on general-purpose worker threads. `0` means the detected
    /// hardware parallelism. Categories with reserved threads may add more.
    pub general_workers: usize,
    /// How long an outbound connection may spend in the curve handshake
    /// before the transport abandons it.
    pub handshake_time: Duration,
    /// Receive-size cap per message; a remote exceeding it is disconnected
    /// by the transport. `-1` disables the cap.
    pub max_msg_size: i64,
    /// Maximum time spent flushing a socket's pending messages on close.
    pub close_linger: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            pubkey: Vec::new(),
            privkey: Vec::new(),
            service_node: false,
            bind: Vec::new(),
            peer_lookup: None,
            allow_connection: None,
            general_workers: 0,
            handshake_time: Duration::from_secs(10),
            max_msg_size: 1024 * 1024,
            close_linger: Duration::from_secs(5),
        }
    }
}

impl Config {
    /// Validates field combinations before any socket is created.
    pub fn validate(&self) -> Result<(), Error> {
        match (self.pubkey.len(), self.privkey.len()) {
            (0, 0) => {
                if self.service_node {
                    return Err(Error::Config(
                        "service_node mode requires an explicit keypair".into(),
                    ));
                }
            }
            (32, 32) => {}
            _ => {
                return Err(Error::Config(
                    "pubkey and privkey must both be 32 bytes or both empty".into(),
                ))
            }
        }
        if self.max_msg_size < -1 {
            return Err(Error::Config("max_msg_size must be >= -1".into()));
        }
        for addr in &self.bind {
            if addr.is_empty() {
                return Err(Error::Config("empty bind address".into()));
            }
        }
        Ok(())
    }

    pub(crate) fn effective_general_workers(&self) -> usize {
        if self.general_workers > 0 {
            self.general_workers
        } else {
            std::thread::available_parallelism()
                .map(std::num::NonZeroUsize::get)
                .unwrap_or(1)
        }
    }

    pub(crate) fn default_allow() -> AllowFn {
        Box::new(|_ip, _pubkey| Allow::new(AuthLevel::None, false))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn service_node_without_keys_is_rejected() {
        let config = Config {
            service_node: true,
            ..Config::default()
        };
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn half_keypair_is_rejected() {
        let config = Config {
            pubkey: vec![1u8; 32],
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn wrong_length_keys_are_rejected() {
        let config = Config {
            pubkey: vec![1u8; 31],
            privkey: vec![2u8; 31],
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn full_keypair_is_accepted() {
        let config = Config {
            pubkey: vec![1u8; 32],
            privkey: vec![2u8; 32],
            service_node: true,
            ..Config::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn empty_bind_address_is_rejected() {
        let config = Config {
            bind: vec![String::new()],
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn general_workers_falls_back_to_parallelism() {
        let config = Config::default();
        assert!(config.effective_general_workers() >= 1);
        let config = Config {
            general_workers: 3,
            ..Config::default()
        };
        assert_eq!(config.effective_general_workers(), 3);
    }
}
