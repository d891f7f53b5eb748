//! The borrowed view of an incoming command handed to callbacks.

use crate::control::SendOptions;
use crate::types::Pubkey;
use crate::Core;

/// An incoming command as seen by a registered callback.
///
/// The view borrows the worker's current job; use it freely inside the
/// callback but copy out anything that must outlive it.
pub struct Message<'a> {
    /// The originator's public key.
    pub pubkey: Pubkey,
    /// Whether the originator authenticated as an active service node.
    /// Checked at handshake time, not per message.
    pub service_node: bool,
    /// The command's data parts, in wire order.
    pub data: Vec<&'a [u8]>,
    core: &'a Core,
}

impl<'a> Message<'a> {
    pub(crate) fn new(
        core: &'a Core,
        pubkey: Pubkey,
        service_node: bool,
        data: Vec<&'a [u8]>,
    ) -> Self {
        Message {
            pubkey,
            service_node,
            data,
            core,
        }
    }

    /// Queues a reply to the originator.
    ///
    /// For a service-node originator this is a strong reply: the proxy will
    /// re-establish an outbound connection if the peer is gone. For anyone
    /// else the reply rides the peer's existing incoming connection and is
    /// dropped if that connection has closed.
    pub fn reply<P, I>(&self, command: &str, parts: I)
    where
        I: IntoIterator<Item = P>,
        P: Into<Vec<u8>>,
    {
        let parts: Vec<Vec<u8>> = parts.into_iter().map(Into::into).collect();
        if self.service_node {
            self.core
                .queue_send(false, &self.pubkey, command, parts, &SendOptions::default());
        } else {
            self.core
                .queue_send(true, &self.pubkey, command, parts, &SendOptions::default());
        }
    }
}
