//! Authenticated, encrypted message passing between service nodes.
//!
//! One [`CurveMq`] instance per process: it listens for curve-authenticated
//! peer connections (optionally), dials peers by their 32-byte x25519 public
//! key, and dispatches registered commands to a worker thread pool. A single
//! proxy thread owns every transport socket; application threads interact
//! through an in-process control channel and never block on the network.
//!
//! ```no_run
//! use curvemq::{Access, Config, CurveMq};
//!
//! let mut node = CurveMq::new(Config {
//!     bind: vec!["tcp://127.0.0.1:7800".into()],
//!     ..Config::default()
//! })?;
//! node.add_category("rpc", Access::default(), 0, 200)?;
//! node.add_command("rpc", "ping", |msg| {
//!     msg.reply("rpc.pong", ["pong".as_bytes()]);
//! })?;
//! node.start()?;
//! # Ok::<(), curvemq::Error>(())
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod control;
mod error;
mod message;
mod peers;
mod proxy;
mod registry;
mod types;
mod worker;
mod zap;

pub use config::{AllowFn, CommandFn, Config, LookupFn};
pub use control::SendOptions;

#[doc(hidden)]
pub mod internal {
    //! Unstable wire internals, exposed for the benchmark harness only.
    pub use crate::control::{decode, encode, SendParams};
}
pub use error::Error;
pub use message::Message;
pub use types::{
    Access, Allow, AuthLevel, LogLevel, Pubkey, DEFAULT_CONNECT_KEEP_ALIVE,
    DEFAULT_SEND_KEEP_ALIVE, MAX_CATEGORY_LENGTH, MAX_COMMAND_LENGTH,
};

use crate::config::{AllowFn as AllowCallback, LookupFn as LookupCallback};
use crate::control::{ConnectParams, DisconnectParams, SendParams};
use crate::control::{CTRL_CONNECT, CTRL_DISCONNECT, CTRL_QUIT, CTRL_REPLY, CTRL_SEND};
use crate::proxy::{Proxy, ProxyConfig, ProxySockets};
use crate::registry::Registry;
use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::{debug, error, warn};

static NEXT_OBJECT_ID: AtomicUsize = AtomicUsize::new(1);

thread_local! {
    /// Per-thread control sockets, keyed by instance id. Created lazily on
    /// the first send from a thread; dropped with the thread.
    static CONTROL_SOCKETS: RefCell<HashMap<usize, zmq::Socket>> =
        RefCell::new(HashMap::new());
}

/// State shared between the public handle, the proxy thread, and workers.
pub(crate) struct Core {
    context: zmq::Context,
    object_id: usize,
    pubkey: Pubkey,
    privkey: Pubkey,
    local_sn: bool,
    log_level: AtomicU8,
    /// The one cross-thread bit: set by the proxy on QUIT so no further
    /// control sockets are handed out.
    shutting_down: Mutex<bool>,
}

impl Core {
    fn new(context: zmq::Context, pubkey: Pubkey, privkey: Pubkey, local_sn: bool) -> Self {
        Core {
            context,
            object_id: NEXT_OBJECT_ID.fetch_add(1, Ordering::Relaxed),
            pubkey,
            privkey,
            local_sn,
            log_level: AtomicU8::new(LogLevel::Warn as u8),
            shutting_down: Mutex::new(false),
        }
    }

    pub(crate) fn context(&self) -> &zmq::Context {
        &self.context
    }

    pub(crate) fn pubkey(&self) -> &Pubkey {
        &self.pubkey
    }

    pub(crate) fn privkey(&self) -> &Pubkey {
        &self.privkey
    }

    pub(crate) fn local_sn(&self) -> bool {
        self.local_sn
    }

    fn control_endpoint(&self) -> String {
        format!("inproc://curvemq-{}-control", self.object_id)
    }

    pub(crate) fn workers_endpoint(&self) -> String {
        format!("inproc://curvemq-{}-workers", self.object_id)
    }

    /// Whether events at `level` should be emitted. Relaxed reads: a level
    /// change may take a moment to reach other threads.
    pub(crate) fn log_on(&self, level: LogLevel) -> bool {
        LogLevel::from_u8(self.log_level.load(Ordering::Relaxed)) <= level
    }

    pub(crate) fn set_shutting_down(&self) {
        let mut guard = self
            .shutting_down
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        *guard = true;
    }

    /// Sends one `[command, data?]` message to the proxy over this thread's
    /// control socket, creating the socket on first use.
    fn send_control(&self, command: &[u8], data: Option<&[u8]>) -> Result<(), Error> {
        CONTROL_SOCKETS.with(|cell| {
            let mut sockets = cell.borrow_mut();
            if !sockets.contains_key(&self.object_id) {
                {
                    let guard = self
                        .shutting_down
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner);
                    if *guard {
                        return Err(Error::ShuttingDown);
                    }
                }
                let sock = self.context.socket(zmq::DEALER)?;
                sock.set_linger(0)?;
                sock.connect(&self.control_endpoint())?;
                sockets.insert(self.object_id, sock);
            }
            let Some(sock) = sockets.get(&self.object_id) else {
                return Err(Error::ShuttingDown);
            };
            match data {
                Some(data) => sock.send_multipart([command, data], 0)?,
                None => sock.send(command, 0)?,
            }
            Ok(())
        })
    }

    /// Fire-and-forget SEND/REPLY: failures are logged, never returned.
    pub(crate) fn queue_send(
        &self,
        reply: bool,
        pubkey: &Pubkey,
        command: &str,
        parts: Vec<Vec<u8>>,
        options: &SendOptions,
    ) {
        let params = SendParams::new(pubkey, command, parts, options);
        let command_frame = if reply { CTRL_REPLY } else { CTRL_SEND };
        let queued = control::encode(&params)
            .and_then(|data| self.send_control(command_frame, Some(&data)));
        match queued {
            Ok(()) => {}
            Err(Error::ShuttingDown) => {
                if self.log_on(LogLevel::Debug) {
                    debug!("send discarded, instance shutting down");
                }
            }
            Err(e) => warn!("failed to queue send: {e}"),
        }
    }

    #[cfg(test)]
    pub(crate) fn for_tests() -> Core {
        Core::new(zmq::Context::new(), [0u8; 32], [0u8; 32], false)
    }
}

/// Everything configured before `start()`, handed to the proxy thread whole.
struct PreStart {
    registry: Registry,
    bind: Vec<String>,
    allow: AllowCallback,
    lookup: Option<LookupCallback>,
    general_workers: usize,
    handshake_time: Duration,
    max_msg_size: i64,
    close_linger: Duration,
    control: zmq::Socket,
}

/// An embedded message-passing node.
///
/// Construct with [`CurveMq::new`], register categories and commands, then
/// call [`CurveMq::start`]. Registration is rejected after start; `send` and
/// `connect` are asynchronous and never block on the network.
///
/// Dropping the instance tells the proxy to quit, waits for the workers to
/// finish their current jobs, and joins the proxy thread.
pub struct CurveMq {
    core: Arc<Core>,
    pre_start: Mutex<Option<PreStart>>,
    proxy_thread: Option<std::thread::JoinHandle<()>>,
    listen_endpoints: Vec<String>,
}

impl CurveMq {
    /// Validates the configuration and creates an instance. An ephemeral
    /// curve keypair is generated when none was supplied.
    pub fn new(config: Config) -> Result<Self, Error> {
        config.validate()?;
        let context = zmq::Context::new();
        let (pubkey, privkey) = if config.pubkey.is_empty() {
            let keypair = zmq::CurveKeyPair::new()?;
            (keypair.public_key, keypair.secret_key)
        } else {
            let pubkey = control::parse_pubkey(&config.pubkey)
                .ok_or_else(|| Error::Config("pubkey must be 32 bytes".into()))?;
            let privkey = control::parse_pubkey(&config.privkey)
                .ok_or_else(|| Error::Config("privkey must be 32 bytes".into()))?;
            (pubkey, privkey)
        };
        let core = Arc::new(Core::new(context, pubkey, privkey, config.service_node));

        let control_sock = core.context().socket(zmq::ROUTER)?;
        control_sock.set_linger(0)?;
        control_sock.bind(&core.control_endpoint())?;

        let general_workers = config.effective_general_workers();
        Ok(CurveMq {
            core,
            pre_start: Mutex::new(Some(PreStart {
                registry: Registry::default(),
                bind: config.bind,
                allow: config.allow_connection.unwrap_or_else(Config::default_allow),
                lookup: config.peer_lookup,
                general_workers,
                handshake_time: config.handshake_time,
                max_msg_size: config.max_msg_size,
                close_linger: config.close_linger,
                control: control_sock,
            })),
            proxy_thread: None,
            listen_endpoints: Vec::new(),
        })
    }

    fn with_setup<R>(
        &mut self,
        f: impl FnOnce(&mut PreStart) -> Result<R, Error>,
    ) -> Result<R, Error> {
        let mut guard = self
            .pre_start
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        match guard.as_mut() {
            Some(setup) => f(setup),
            None => Err(Error::AlreadyStarted),
        }
    }

    /// Adds a command category. Pre-start only.
    ///
    /// `reserved_threads` guarantees the category that many workers beyond
    /// the general pool; `max_queue` bounds its pending commands (`-1` for
    /// unbounded, `0` to queue nothing).
    pub fn add_category(
        &mut self,
        name: &str,
        access: Access,
        reserved_threads: usize,
        max_queue: i32,
    ) -> Result<(), Error> {
        self.with_setup(|setup| setup.registry.add_category(name, access, reserved_threads, max_queue))
    }

    /// Registers a command in an existing category. Pre-start only.
    pub fn add_command(
        &mut self,
        category: &str,
        name: &str,
        callback: impl Fn(&mut Message<'_>) + Send + Sync + 'static,
    ) -> Result<(), Error> {
        let callback: CommandFn = Arc::new(callback);
        self.with_setup(|setup| setup.registry.add_command(category, name, callback))
    }

    /// Adds a wire-name alias; access follows the target. Pre-start only.
    pub fn add_command_alias(&mut self, from: &str, to: &str) -> Result<(), Error> {
        self.with_setup(|setup| setup.registry.add_alias(from, to))
    }

    /// Binds the configured listen addresses and launches the proxy thread.
    pub fn start(&mut self) -> Result<(), Error> {
        let setup = self
            .pre_start
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or(Error::AlreadyStarted)?;

        let context = self.core.context();

        let zap_sock = context.socket(zmq::REP)?;
        zap_sock.set_linger(0)?;
        zap_sock.bind(zap::ZAP_ENDPOINT)?;

        let workers = context.socket(zmq::ROUTER)?;
        workers.set_linger(0)?;
        workers.set_router_mandatory(true)?;
        workers.bind(&self.core.workers_endpoint())?;

        let listener = if setup.bind.is_empty() {
            None
        } else {
            let listener = context.socket(zmq::ROUTER)?;
            listener.set_curve_server(true)?;
            listener.set_curve_secretkey(self.core.privkey())?;
            listener.set_zap_domain("curvemq")?;
            listener.set_maxmsgsize(setup.max_msg_size)?;
            listener.set_router_mandatory(true)?;
            listener.set_linger(setup.close_linger.as_millis().min(i32::MAX as u128) as i32)?;
            let mut endpoints = Vec::with_capacity(setup.bind.len());
            for addr in &setup.bind {
                listener.bind(addr)?;
                if let Ok(Ok(endpoint)) = listener.get_last_endpoint() {
                    endpoints.push(endpoint);
                }
            }
            self.listen_endpoints = endpoints;
            Some(listener)
        };

        let proxy = Proxy::new(
            Arc::clone(&self.core),
            Arc::new(setup.registry),
            ProxySockets {
                control: setup.control,
                workers,
                zap: zap_sock,
                listener,
            },
            ProxyConfig {
                allow: setup.allow,
                lookup: setup.lookup,
                general_workers: setup.general_workers,
                handshake_time: setup.handshake_time,
                max_msg_size: setup.max_msg_size,
                close_linger: setup.close_linger,
            },
        );
        let handle = std::thread::Builder::new()
            .name("curvemq-proxy".to_owned())
            .spawn(move || proxy.run())
            .map_err(|e| Error::Config(format!("failed to spawn proxy thread: {e}")))?;
        self.proxy_thread = Some(handle);
        Ok(())
    }

    /// Queues a command for the peer, connecting first if necessary.
    ///
    /// Fire-and-forget: delivery problems are logged, never reported. A
    /// connection established here uses the short
    /// [`DEFAULT_SEND_KEEP_ALIVE`]; `connect` first for a longer-lived link.
    pub fn send<P, I>(&self, pubkey: &Pubkey, command: &str, parts: I, options: SendOptions)
    where
        I: IntoIterator<Item = P>,
        P: Into<Vec<u8>>,
    {
        let parts: Vec<Vec<u8>> = parts.into_iter().map(Into::into).collect();
        self.core.queue_send(false, pubkey, command, parts, &options);
    }

    /// Asks the proxy to establish (or refresh) an outbound connection.
    ///
    /// An existing connection's idle window is raised to `keep_alive` if that
    /// is longer. `hint` skips the peer-lookup call for a fresh connection.
    pub fn connect(&self, pubkey: &Pubkey, keep_alive: Duration, hint: Option<&str>) {
        let params = ConnectParams {
            hint: hint.map(str::to_owned),
            keep_alive: keep_alive.as_millis().min(i64::MAX as u128) as i64,
            pubkey: pubkey.to_vec(),
        };
        let queued = control::encode(&params)
            .and_then(|data| self.core.send_control(CTRL_CONNECT, Some(&data)));
        if let Err(e) = queued {
            warn!("failed to queue connect: {e}");
        }
    }

    /// Asks the proxy to drop our outbound connection to the peer, if any.
    pub fn disconnect(&self, pubkey: &Pubkey) {
        let params = DisconnectParams {
            pubkey: pubkey.to_vec(),
        };
        let queued = control::encode(&params)
            .and_then(|data| self.core.send_control(CTRL_DISCONNECT, Some(&data)));
        if let Err(e) = queued {
            warn!("failed to queue disconnect: {e}");
        }
    }

    /// Current log threshold.
    pub fn log_level(&self) -> LogLevel {
        LogLevel::from_u8(self.core.log_level.load(Ordering::Relaxed))
    }

    /// Sets the log threshold for this instance's event emission.
    pub fn set_log_level(&self, level: LogLevel) {
        self.core.log_level.store(level as u8, Ordering::Relaxed);
    }

    /// The local public key (generated at construction if none was given).
    pub fn pubkey(&self) -> &Pubkey {
        self.core.pubkey()
    }

    /// The local secret key.
    pub fn privkey(&self) -> &Pubkey {
        self.core.privkey()
    }

    /// Resolved listen endpoints, available after `start()`. Wildcard ports
    /// in the bind addresses appear here with their assigned values.
    pub fn listen_endpoints(&self) -> &[String] {
        &self.listen_endpoints
    }
}

impl Drop for CurveMq {
    fn drop(&mut self) {
        if let Some(handle) = self.proxy_thread.take() {
            if let Err(e) = self.core.send_control(CTRL_QUIT, None) {
                error!("failed to deliver QUIT to proxy: {e}");
            }
            if handle.join().is_err() {
                error!("proxy thread panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registration_is_rejected_after_start_is_consumed() {
        let mut node = CurveMq::new(Config::default()).unwrap();
        node.add_category("rpc", Access::default(), 0, 200).unwrap();
        // Simulate a started instance by taking the pre-start state.
        node.pre_start
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        assert!(matches!(
            node.add_category("late", Access::default(), 0, 200),
            Err(Error::AlreadyStarted)
        ));
        assert!(matches!(
            node.add_command("rpc", "ping", |_msg| {}),
            Err(Error::AlreadyStarted)
        ));
        assert!(matches!(
            node.add_command_alias("a.b", "rpc.ping"),
            Err(Error::AlreadyStarted)
        ));
    }

    #[test]
    fn ephemeral_keypair_is_generated() {
        let node = CurveMq::new(Config::default()).unwrap();
        assert_ne!(node.pubkey(), &[0u8; 32]);
    }

    #[test]
    fn explicit_keypair_is_kept() {
        let node = CurveMq::new(Config {
            pubkey: vec![7u8; 32],
            privkey: vec![9u8; 32],
            ..Config::default()
        })
        .unwrap();
        assert_eq!(node.pubkey(), &[7u8; 32]);
        assert_eq!(node.privkey(), &[9u8; 32]);
    }

    #[test]
    fn log_level_round_trips() {
        let node = CurveMq::new(Config::default()).unwrap();
        assert_eq!(node.log_level(), LogLevel::Warn);
        node.set_log_level(LogLevel::Trace);
        assert_eq!(node.log_level(), LogLevel::Trace);
        assert!(node.core.log_on(LogLevel::Debug));
        node.set_log_level(LogLevel::Error);
        assert!(!node.core.log_on(LogLevel::Debug));
    }
}
