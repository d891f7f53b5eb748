//! The proxy thread: sole owner of every transport socket and all per-peer
//! state.
//!
//! One loop iteration polls the control socket, the workers socket, the ZAP
//! socket, the listener, and every outgoing socket, then drains them in a
//! fixed order (ZAP first so handshake decisions land before application
//! data) and finally sweeps idle outgoing connections. Nothing outside this
//! thread touches the peer table, the outgoing slots, or the worker pool.

use crate::config::{AllowFn, LookupFn};
use crate::control::{self, ConnectParams, DisconnectParams, SendParams};
use crate::control::{CTRL_CONNECT, CTRL_DISCONNECT, CTRL_QUIT, CTRL_REPLY, CTRL_SEND};
use crate::peers::{PeerTable, RoutePlan};
use crate::registry::{Lookup, Registry};
use crate::types::{LogLevel, Pubkey, DEFAULT_SEND_KEEP_ALIVE};
use crate::worker::{Job, Pool};
use crate::zap;
use crate::Core;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Remote-initiated close of its connection into us. Handled in the proxy
/// without a worker; bypasses access checks (the frame still passed ZAP).
const BUILTIN_BYE: &[u8] = b"BYE";

pub(crate) struct ProxySockets {
    pub control: zmq::Socket,
    pub workers: zmq::Socket,
    pub zap: zmq::Socket,
    pub listener: Option<zmq::Socket>,
}

pub(crate) struct ProxyConfig {
    pub allow: AllowFn,
    pub lookup: Option<LookupFn>,
    pub general_workers: usize,
    pub handshake_time: Duration,
    pub max_msg_size: i64,
    pub close_linger: Duration,
}

pub(crate) struct Proxy {
    core: Arc<Core>,
    registry: Arc<Registry>,
    pool: Pool,
    peers: PeerTable,
    /// Outgoing sockets with their owning pubkeys, addressed by slot index.
    remotes: Vec<(Pubkey, zmq::Socket)>,
    control: zmq::Socket,
    workers: zmq::Socket,
    zap: zmq::Socket,
    listener: Option<zmq::Socket>,
    /// Handshake decisions recorded at ZAP time, joined with the first frame
    /// from each authenticated route. Entries outlive peer-table entries: a
    /// connection can keep delivering frames after BYE or idle expiry dropped
    /// the peer, and those frames must still authenticate.
    verified: HashMap<Pubkey, crate::types::Allow>,
    allow: AllowFn,
    lookup: Option<LookupFn>,
    handshake_time: Duration,
    max_msg_size: i64,
    close_linger: Duration,
    shutting_down: bool,
}

impl Proxy {
    pub fn new(
        core: Arc<Core>,
        registry: Arc<Registry>,
        sockets: ProxySockets,
        config: ProxyConfig,
    ) -> Self {
        let pool = Pool::new(
            Arc::clone(&core),
            Arc::clone(&registry),
            config.general_workers,
        );
        Proxy {
            core,
            registry,
            pool,
            peers: PeerTable::default(),
            remotes: Vec::new(),
            control: sockets.control,
            workers: sockets.workers,
            zap: sockets.zap,
            listener: sockets.listener,
            verified: HashMap::new(),
            allow: config.allow,
            lookup: config.lookup,
            handshake_time: config.handshake_time,
            max_msg_size: config.max_msg_size,
            close_linger: config.close_linger,
            shutting_down: false,
        }
    }

    pub fn run(mut self) {
        info!("proxy thread running");
        loop {
            let timeout = self.poll_timeout_ms();
            let polled = {
                let mut items = Vec::with_capacity(4 + self.remotes.len());
                items.push(self.control.as_poll_item(zmq::POLLIN));
                items.push(self.workers.as_poll_item(zmq::POLLIN));
                items.push(self.zap.as_poll_item(zmq::POLLIN));
                if let Some(listener) = &self.listener {
                    items.push(listener.as_poll_item(zmq::POLLIN));
                }
                for (_, sock) in &self.remotes {
                    items.push(sock.as_poll_item(zmq::POLLIN));
                }
                zmq::poll(&mut items, timeout)
            };
            match polled {
                Ok(_) => {}
                Err(zmq::Error::EINTR) => continue,
                Err(e) => {
                    error!("proxy poll failed: {e}");
                    break;
                }
            }
            self.process_zap();
            if self.process_control() {
                break;
            }
            self.process_workers();
            self.process_listener();
            self.process_remotes();
            self.expire_idle();
        }
        self.finish();
    }

    /// Sleep in poll until something is readable or the earliest idle-expiry
    /// deadline passes.
    fn poll_timeout_ms(&self) -> i64 {
        match self.peers.next_idle_deadline() {
            None => -1,
            Some(deadline) => {
                let left = deadline.saturating_duration_since(Instant::now());
                (left.as_millis().min(i64::MAX as u128 - 1) as i64) + 1
            }
        }
    }

    fn process_zap(&mut self) {
        loop {
            let parts = match self.zap.recv_multipart(zmq::DONTWAIT) {
                Ok(parts) => parts,
                Err(zmq::Error::EAGAIN) => break,
                Err(e) => {
                    warn!("zap receive failed: {e}");
                    break;
                }
            };
            let outcome = zap::evaluate(&parts, &self.allow);
            if let Some((pubkey, allow)) = outcome.admitted {
                if self.core.log_on(LogLevel::Debug) {
                    debug!(
                        pubkey = %hex::encode(pubkey),
                        auth = ?allow.auth,
                        service_node = allow.service_node,
                        "incoming connection allowed"
                    );
                }
                self.verified.insert(pubkey, allow);
            } else if let Some(pubkey) = outcome.denied {
                if self.core.log_on(LogLevel::Debug) {
                    debug!(pubkey = %hex::encode(pubkey), "incoming connection denied");
                }
            }
            if let Err(e) = self.zap.send_multipart(outcome.reply, 0) {
                warn!("zap reply failed: {e}");
            }
        }
    }

    /// Drains the control socket. Returns true once QUIT arrives; anything
    /// still queued behind it is dropped by shutdown.
    fn process_control(&mut self) -> bool {
        loop {
            let parts = match self.control.recv_multipart(zmq::DONTWAIT) {
                Ok(parts) => parts,
                Err(zmq::Error::EAGAIN) => return false,
                Err(e) => {
                    warn!("control receive failed: {e}");
                    return false;
                }
            };
            if parts.len() < 2 {
                warn!("short control message");
                continue;
            }
            let data = parts.get(2).map_or(&[][..], Vec::as_slice);
            match parts[1].as_slice() {
                CTRL_SEND => self.handle_send(data, false),
                CTRL_REPLY => self.handle_send(data, true),
                CTRL_CONNECT => self.handle_connect(data),
                CTRL_DISCONNECT => self.handle_disconnect(data),
                CTRL_QUIT => {
                    info!("proxy received QUIT");
                    self.core.set_shutting_down();
                    self.shutting_down = true;
                    return true;
                }
                other => {
                    warn!(command = %String::from_utf8_lossy(other), "unknown control command");
                }
            }
        }
    }

    fn process_workers(&mut self) {
        loop {
            let parts = match self.workers.recv_multipart(zmq::DONTWAIT) {
                Ok(parts) => parts,
                Err(zmq::Error::EAGAIN) => break,
                Err(e) => {
                    warn!("workers receive failed: {e}");
                    break;
                }
            };
            self.pool
                .worker_event(&parts, &self.workers, self.shutting_down);
        }
    }

    fn process_listener(&mut self) {
        let batches = {
            let Some(listener) = &self.listener else {
                return;
            };
            let mut batches = Vec::new();
            loop {
                match recv_parts(listener) {
                    Ok(Some(parts)) => batches.push(parts),
                    Ok(None) => break,
                    Err(e) => {
                        warn!("listener receive failed: {e}");
                        break;
                    }
                }
            }
            batches
        };
        for mut parts in batches {
            self.inbound_from_listener(&mut parts);
        }
    }

    fn inbound_from_listener(&mut self, parts: &mut [zmq::Message]) {
        if parts.len() < 2 {
            warn!("short frame on listener");
            return;
        }
        // The ZAP reply set the connection's user id to the verified pubkey.
        let Some(user_id) = parts[0].gets("User-Id").map(ToOwned::to_owned) else {
            warn!("listener frame without authenticated identity");
            return;
        };
        let Some(pubkey) = hex::decode(&user_id)
            .ok()
            .and_then(|b| control::parse_pubkey(&b))
        else {
            warn!(user_id = %user_id, "listener frame with malformed identity");
            return;
        };
        let route = parts[0].to_vec();

        if let Some(allow) = self.verified.get(&pubkey).copied() {
            self.peers.record_incoming(pubkey, route, allow);
        } else if let Some(peer) = self.peers.get_mut(&pubkey) {
            peer.incoming = Some(route);
            peer.touch();
        } else {
            warn!(pubkey = %hex::encode(pubkey), "frame from unverified route");
            return;
        }

        if &parts[1][..] == BUILTIN_BYE {
            if self.core.log_on(LogLevel::Debug) {
                debug!(pubkey = %hex::encode(pubkey), "peer said BYE, dropping incoming route");
            }
            self.peers.clear_incoming(&pubkey);
            return;
        }

        let Ok(command) = std::str::from_utf8(&parts[1]) else {
            warn!("non-utf8 command name");
            return;
        };
        let data: Vec<Vec<u8>> = parts[2..].iter().map(|m| m.to_vec()).collect();
        self.dispatch_command(pubkey, command, data);
    }

    fn process_remotes(&mut self) {
        let mut batches: Vec<(Pubkey, Vec<Vec<u8>>)> = Vec::new();
        for (pubkey, sock) in &self.remotes {
            loop {
                match sock.recv_multipart(zmq::DONTWAIT) {
                    Ok(parts) => batches.push((*pubkey, parts)),
                    Err(zmq::Error::EAGAIN) => break,
                    Err(e) => {
                        warn!(pubkey = %hex::encode(pubkey), "outgoing socket receive failed: {e}");
                        break;
                    }
                }
            }
        }
        for (pubkey, parts) in batches {
            self.inbound_from_remote(pubkey, parts);
        }
    }

    fn inbound_from_remote(&mut self, pubkey: Pubkey, parts: Vec<Vec<u8>>) {
        if parts.is_empty() {
            return;
        }
        if let Some(peer) = self.peers.get_mut(&pubkey) {
            peer.touch();
        }
        let Ok(command) = std::str::from_utf8(&parts[0]) else {
            warn!("non-utf8 command name");
            return;
        };
        let command = command.to_owned();
        let data: Vec<Vec<u8>> = parts.into_iter().skip(1).collect();
        self.dispatch_command(pubkey, &command, data);
    }

    fn dispatch_command(&mut self, pubkey: Pubkey, command: &str, data: Vec<Vec<u8>>) {
        let Some((auth, service_node)) = self
            .peers
            .get(&pubkey)
            .map(|p| (p.auth_level, p.service_node))
        else {
            warn!(pubkey = %hex::encode(pubkey), "command from peer not in table");
            return;
        };
        match self.registry.resolve(command) {
            Lookup::Found(resolved) => {
                if let Err(denial) =
                    resolved
                        .category
                        .check_access(auth, service_node, self.core.local_sn())
                {
                    warn!(
                        command,
                        pubkey = %hex::encode(pubkey),
                        denial = ?denial,
                        "command access denied"
                    );
                    return;
                }
                let job = Job {
                    category: resolved.category_name.to_owned(),
                    command: resolved.command_name.to_owned(),
                    pubkey,
                    service_node,
                    parts: data,
                };
                self.pool.dispatch(job, &self.workers);
            }
            Lookup::NoSeparator | Lookup::UnknownCategory | Lookup::UnknownCommand => {
                warn!(command, pubkey = %hex::encode(pubkey), "unknown command");
            }
        }
    }

    fn handle_send(&mut self, data: &[u8], incoming_only: bool) {
        let params: SendParams = match control::decode(data) {
            Ok(params) => params,
            Err(e) => {
                warn!("malformed SEND control message: {e}");
                return;
            }
        };
        let Some(pubkey) = control::parse_pubkey(&params.pubkey) else {
            warn!("SEND with malformed pubkey");
            return;
        };
        if params.send.is_empty() {
            warn!("SEND without a command");
            return;
        }
        let incoming_only = incoming_only || params.incoming.is_some();
        let optional = params.optional.is_some();
        let hint = params.hint.as_deref().unwrap_or("");
        let keep_alive = params
            .keep_alive_duration()
            .unwrap_or(DEFAULT_SEND_KEEP_ALIVE);

        match self.proxy_connect(&pubkey, hint, optional, incoming_only, keep_alive) {
            RoutePlan::None => {}
            plan => self.emit(&pubkey, plan, &params.send),
        }
    }

    fn handle_connect(&mut self, data: &[u8]) {
        let params: ConnectParams = match control::decode(data) {
            Ok(params) => params,
            Err(e) => {
                warn!("malformed CONNECT control message: {e}");
                return;
            }
        };
        let Some(pubkey) = control::parse_pubkey(&params.pubkey) else {
            warn!("CONNECT with malformed pubkey");
            return;
        };
        let keep_alive = Duration::from_millis(params.keep_alive.max(0) as u64);
        let hint = params.hint.as_deref().unwrap_or("");
        let _ = self.proxy_connect(&pubkey, hint, false, false, keep_alive);
    }

    fn handle_disconnect(&mut self, data: &[u8]) {
        let params: DisconnectParams = match control::decode(data) {
            Ok(params) => params,
            Err(e) => {
                warn!("malformed DISCONNECT control message: {e}");
                return;
            }
        };
        if let Some(pubkey) = control::parse_pubkey(&params.pubkey) {
            if self.core.log_on(LogLevel::Debug) {
                debug!(pubkey = %hex::encode(pubkey), "disconnecting outgoing connection");
            }
            self.close_outgoing(&pubkey);
        }
    }

    /// The connection cache: reuses an existing route, or establishes a new
    /// outbound when allowed. Idempotent; the caller writes the frames.
    fn proxy_connect(
        &mut self,
        pubkey: &Pubkey,
        hint: &str,
        optional: bool,
        incoming_only: bool,
        keep_alive: Duration,
    ) -> RoutePlan {
        match self.peers.route_for(pubkey, incoming_only) {
            RoutePlan::Incoming(route) => {
                if let Some(peer) = self.peers.get_mut(pubkey) {
                    peer.touch();
                }
                return RoutePlan::Incoming(route);
            }
            RoutePlan::Outgoing(slot) => {
                if let Some(peer) = self.peers.get_mut(pubkey) {
                    if keep_alive > peer.idle_expiry {
                        peer.idle_expiry = keep_alive;
                    }
                    peer.touch();
                }
                return RoutePlan::Outgoing(slot);
            }
            RoutePlan::None => {}
        }
        if incoming_only {
            if self.core.log_on(LogLevel::Debug) {
                debug!(pubkey = %hex::encode(pubkey), "no incoming route, dropping reply");
            }
            return RoutePlan::None;
        }
        if optional {
            if self.core.log_on(LogLevel::Debug) {
                debug!(pubkey = %hex::encode(pubkey), "optional send with no connection, dropping");
            }
            return RoutePlan::None;
        }
        let addr = if hint.is_empty() {
            match &self.lookup {
                Some(lookup) => lookup(pubkey).unwrap_or_default(),
                None => String::new(),
            }
        } else {
            hint.to_owned()
        };
        if addr.is_empty() {
            warn!(pubkey = %hex::encode(pubkey), "no address known for peer, dropping");
            return RoutePlan::None;
        }
        match self.open_remote(pubkey, &addr, keep_alive) {
            Ok(slot) => RoutePlan::Outgoing(slot),
            Err(e) => {
                warn!(pubkey = %hex::encode(pubkey), addr = %addr, "outbound connect failed: {e}");
                RoutePlan::None
            }
        }
    }

    fn open_remote(
        &mut self,
        pubkey: &Pubkey,
        addr: &str,
        keep_alive: Duration,
    ) -> Result<usize, zmq::Error> {
        let sock = self.core.context().socket(zmq::DEALER)?;
        sock.set_curve_publickey(self.core.pubkey())?;
        sock.set_curve_secretkey(self.core.privkey())?;
        sock.set_curve_serverkey(pubkey)?;
        sock.set_maxmsgsize(self.max_msg_size)?;
        sock.set_handshake_ivl(duration_ms(self.handshake_time))?;
        sock.set_linger(duration_ms(self.close_linger))?;
        sock.connect(addr)?;
        let slot = self.remotes.len();
        self.remotes.push((*pubkey, sock));
        self.peers.record_outgoing(*pubkey, slot, keep_alive);
        if self.core.log_on(LogLevel::Debug) {
            debug!(pubkey = %hex::encode(pubkey), addr = %addr, slot, "established outgoing connection");
        }
        Ok(slot)
    }

    fn emit(&mut self, pubkey: &Pubkey, plan: RoutePlan, parts: &[serde_bytes::ByteBuf]) {
        let result = match &plan {
            RoutePlan::Incoming(route) => {
                let Some(listener) = &self.listener else {
                    warn!("incoming route recorded without a listener");
                    return;
                };
                let mut frames: Vec<Vec<u8>> = Vec::with_capacity(1 + parts.len());
                frames.push(route.clone());
                frames.extend(parts.iter().map(|p| p.to_vec()));
                listener.send_multipart(frames, zmq::DONTWAIT)
            }
            RoutePlan::Outgoing(slot) => match self.remotes.get(*slot) {
                Some((_, sock)) => {
                    let frames: Vec<Vec<u8>> = parts.iter().map(|p| p.to_vec()).collect();
                    sock.send_multipart(frames, zmq::DONTWAIT)
                }
                None => {
                    error!(slot, "outgoing slot out of range");
                    return;
                }
            },
            RoutePlan::None => return,
        };
        match result {
            Ok(()) => {
                if let Some(peer) = self.peers.get_mut(pubkey) {
                    peer.touch();
                }
            }
            Err(zmq::Error::EHOSTUNREACH) => {
                // The incoming route died between bookkeeping and emission.
                if self.core.log_on(LogLevel::Debug) {
                    debug!(pubkey = %hex::encode(pubkey), "route gone, dropping frame");
                }
                if matches!(plan, RoutePlan::Incoming(_)) {
                    self.peers.clear_incoming(pubkey);
                }
            }
            Err(zmq::Error::EAGAIN) => {
                warn!(pubkey = %hex::encode(pubkey), "send queue full, dropping frame");
            }
            Err(e) => {
                warn!(pubkey = %hex::encode(pubkey), "send failed, dropping frame: {e}");
            }
        }
    }

    fn close_outgoing(&mut self, pubkey: &Pubkey) {
        let Some(slot) = self.peers.clear_outgoing(pubkey) else {
            return;
        };
        if slot < self.remotes.len() {
            // Linger was configured at creation; dropping flushes and closes.
            let (_, sock) = self.remotes.remove(slot);
            drop(sock);
        } else {
            error!(slot, "peer referenced an out-of-range outgoing slot");
        }
        self.peers.slot_removed(slot);
    }

    fn expire_idle(&mut self) {
        let now = Instant::now();
        for pubkey in self.peers.idle_expired(now) {
            if self.core.log_on(LogLevel::Debug) {
                debug!(pubkey = %hex::encode(pubkey), "closing idle outgoing connection");
            }
            self.close_outgoing(&pubkey);
        }
    }

    /// Orderly shutdown: every worker gets a QUIT (stragglers as soon as
    /// their READY arrives), threads are joined, sockets close on drop with
    /// their configured linger.
    fn finish(mut self) {
        self.core.set_shutting_down();
        self.pool.broadcast_quit(&self.workers);
        let deadline = Instant::now() + Duration::from_secs(5);
        while self.pool.quits_outstanding() && Instant::now() < deadline {
            let readable = {
                let mut items = [self.workers.as_poll_item(zmq::POLLIN)];
                matches!(zmq::poll(&mut items, 50), Ok(n) if n > 0)
            };
            if readable {
                self.process_workers();
            }
            self.pool.broadcast_quit(&self.workers);
        }
        self.pool.join_all();
        info!(
            workers = self.pool.spawned(),
            peers = self.peers.len(),
            "proxy stopped"
        );
    }
}

fn duration_ms(d: Duration) -> i32 {
    d.as_millis().min(i32::MAX as u128) as i32
}

/// Receives one full multipart message without blocking, keeping the
/// `zmq::Message` objects so connection metadata stays readable.
fn recv_parts(sock: &zmq::Socket) -> Result<Option<Vec<zmq::Message>>, zmq::Error> {
    let first = match sock.recv_msg(zmq::DONTWAIT) {
        Ok(msg) => msg,
        Err(zmq::Error::EAGAIN) => return Ok(None),
        Err(e) => return Err(e),
    };
    let mut more = first.get_more();
    let mut parts = vec![first];
    while more {
        let msg = sock.recv_msg(0)?;
        more = msg.get_more();
        parts.push(msg);
    }
    Ok(Some(parts))
}
