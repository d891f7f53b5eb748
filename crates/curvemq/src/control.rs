//! Control-channel message encoding.
//!
//! Application threads talk to the proxy with `[command, dict]` multiparts on
//! an in-process socket; the dict is bencoded. Field names and the key set
//! match the wire layout described in the module docs: `pubkey`, `send`
//! (command name followed by data parts), and the optional `hint`,
//! `incoming`, `keep-alive`, and `optional` flags.

use crate::error::Error;
use crate::types::Pubkey;
use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;
use std::time::Duration;

pub(crate) const CTRL_SEND: &[u8] = b"SEND";
pub(crate) const CTRL_REPLY: &[u8] = b"REPLY";
pub(crate) const CTRL_CONNECT: &[u8] = b"CONNECT";
pub(crate) const CTRL_DISCONNECT: &[u8] = b"DISCONNECT";
pub(crate) const CTRL_QUIT: &[u8] = b"QUIT";

/// Options modifying a single [`send`](crate::CurveMq::send).
///
/// Start from `SendOptions::default()` and chain what you need:
///
/// ```
/// use curvemq::SendOptions;
/// use std::time::Duration;
///
/// let opts = SendOptions::default()
///     .hint("tcp://127.0.0.1:7800")
///     .keep_alive(Duration::from_secs(60));
/// ```
#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    pub(crate) hint: Option<String>,
    pub(crate) optional: bool,
    pub(crate) incoming: bool,
    pub(crate) keep_alive: Option<Duration>,
}

impl SendOptions {
    /// Connect address to use if a new outbound connection is needed,
    /// sparing a peer-lookup call.
    #[must_use]
    pub fn hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    /// Deliver only if a connection with the peer already exists; never
    /// establish one for this message.
    #[must_use]
    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    /// Deliver only over an existing incoming connection from the peer.
    #[must_use]
    pub fn incoming(mut self) -> Self {
        self.incoming = true;
        self
    }

    /// Raise the outbound connection's idle expiry to at least this value.
    #[must_use]
    pub fn keep_alive(mut self, keep_alive: Duration) -> Self {
        self.keep_alive = Some(keep_alive);
        self
    }
}

/// Body of a SEND or REPLY control message.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct SendParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub incoming: Option<i64>,
    #[serde(
        rename = "keep-alive",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub keep_alive: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub optional: Option<i64>,
    #[serde(with = "serde_bytes")]
    pub pubkey: Vec<u8>,
    /// Command name followed by the data parts.
    pub send: Vec<ByteBuf>,
}

impl SendParams {
    pub fn new(
        pubkey: &Pubkey,
        command: &str,
        parts: impl IntoIterator<Item = Vec<u8>>,
        options: &SendOptions,
    ) -> Self {
        let mut send = Vec::with_capacity(1);
        send.push(ByteBuf::from(command.as_bytes().to_vec()));
        send.extend(parts.into_iter().map(ByteBuf::from));
        SendParams {
            hint: options.hint.clone(),
            incoming: options.incoming.then_some(1),
            keep_alive: options.keep_alive.map(|d| d.as_millis() as i64),
            optional: options.optional.then_some(1),
            pubkey: pubkey.to_vec(),
            send,
        }
    }

    pub fn keep_alive_duration(&self) -> Option<Duration> {
        self.keep_alive
            .filter(|ms| *ms >= 0)
            .map(|ms| Duration::from_millis(ms as u64))
    }
}

/// Body of a CONNECT control message.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub(crate) struct ConnectParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
    #[serde(rename = "keep-alive")]
    pub keep_alive: i64,
    #[serde(with = "serde_bytes")]
    pub pubkey: Vec<u8>,
}

/// Body of a DISCONNECT control message.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub(crate) struct DisconnectParams {
    #[serde(with = "serde_bytes")]
    pub pubkey: Vec<u8>,
}

/// Bencodes a control-message body.
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, Error> {
    Ok(serde_bencode::to_bytes(value)?)
}

/// Decodes a bencoded control-message body.
pub fn decode<'de, T: Deserialize<'de>>(bytes: &'de [u8]) -> Result<T, Error> {
    Ok(serde_bencode::from_bytes(bytes)?)
}

/// Reads a `pubkey` field that must be exactly 32 bytes.
pub(crate) fn parse_pubkey(bytes: &[u8]) -> Option<Pubkey> {
    bytes.try_into().ok()
}
