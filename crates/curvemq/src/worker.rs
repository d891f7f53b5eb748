//! The worker pool: lazy thread spawning, reserved/general capacity
//! accounting, per-category pending queues, and the worker thread loop.
//!
//! The proxy owns the pool and the workers ROUTER socket. A worker announces
//! itself with READY once its socket is up, receives one RUN message per job,
//! and reports RAN when the callback returns. Capacity accounting and queue
//! bounds live entirely on the proxy side.

use crate::message::Message;
use crate::registry::Registry;
use crate::types::{LogLevel, Pubkey};
use crate::Core;
use std::collections::{HashMap, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, error, warn};

pub(crate) const WORKER_READY: &[u8] = b"READY";
pub(crate) const WORKER_RUN: &[u8] = b"RUN";
pub(crate) const WORKER_RAN: &[u8] = b"RAN";
pub(crate) const WORKER_QUIT: &[u8] = b"QUIT";

/// A parsed command waiting for (or assigned to) a worker.
pub(crate) struct Job {
    pub category: String,
    pub command: String,
    pub pubkey: Pubkey,
    pub service_node: bool,
    pub parts: Vec<Vec<u8>>,
}

/// Where a just-parsed command goes, given current capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Placement {
    /// Capacity is available now.
    Run,
    /// Queue behind the category's pending jobs.
    Queue,
    /// Pending queue is at its bound; the new message is dropped.
    DropQueueFull,
    /// The category queues nothing (`max_queue == 0`).
    DropNoQueue,
}

struct WorkerSlot {
    thread: Option<JoinHandle<()>>,
    routing_id: Vec<u8>,
    /// Category of the assigned job; the completion decrement uses this.
    busy: Option<String>,
    /// Job held until the worker's READY arrives.
    stash: Option<Job>,
    started: bool,
    quit_sent: bool,
}

struct CatState {
    reserved: usize,
    max_queue: i32,
    active: usize,
    pending: VecDeque<Job>,
}

pub(crate) struct Pool {
    core: Arc<Core>,
    registry: Arc<Registry>,
    workers: Vec<WorkerSlot>,
    idle: Vec<usize>,
    cats: HashMap<String, CatState>,
    cat_order: Vec<String>,
    rr_next: usize,
    general_workers: usize,
    max_workers: usize,
}

impl Pool {
    pub fn new(core: Arc<Core>, registry: Arc<Registry>, general_workers: usize) -> Self {
        let mut cats = HashMap::new();
        let mut cat_order = Vec::new();
        for (name, reserved, max_queue) in registry.scheduler_params() {
            cats.insert(
                name.to_owned(),
                CatState {
                    reserved,
                    max_queue,
                    active: 0,
                    pending: VecDeque::new(),
                },
            );
            cat_order.push(name.to_owned());
        }
        cat_order.sort();
        let max_workers = general_workers + registry.reserved_total();
        Pool {
            core,
            registry,
            workers: Vec::new(),
            idle: Vec::new(),
            cats,
            cat_order,
            rr_next: 0,
            general_workers,
            max_workers,
        }
    }

    /// Workers busy beyond their category's reservation, i.e. general-pool
    /// capacity currently consumed.
    fn general_active(&self) -> usize {
        self.cats
            .values()
            .map(|c| c.active.saturating_sub(c.reserved))
            .sum()
    }

    /// A job in `category` may start iff it fits a reserved slot or the
    /// general pool has room.
    fn can_run(&self, category: &str) -> bool {
        let Some(st) = self.cats.get(category) else {
            return false;
        };
        st.active < st.reserved || self.general_active() < self.general_workers
    }

    fn placement(&self, category: &str) -> Placement {
        if self.can_run(category) {
            return Placement::Run;
        }
        let Some(st) = self.cats.get(category) else {
            return Placement::DropNoQueue;
        };
        if st.max_queue == 0 {
            Placement::DropNoQueue
        } else if st.max_queue > 0 && st.pending.len() >= st.max_queue as usize {
            Placement::DropQueueFull
        } else {
            Placement::Queue
        }
    }

    /// Routes a parsed command to a worker, the category queue, or the floor.
    pub fn dispatch(&mut self, job: Job, sock: &zmq::Socket) {
        match self.placement(&job.category) {
            Placement::Run => self.run_now(job, sock),
            Placement::Queue => {
                if let Some(st) = self.cats.get_mut(&job.category) {
                    st.pending.push_back(job);
                }
            }
            Placement::DropQueueFull => {
                warn!(
                    category = %job.category,
                    command = %job.command,
                    "pending queue full, dropping command"
                );
            }
            Placement::DropNoQueue => {
                if self.core.log_on(LogLevel::Debug) {
                    debug!(
                        category = %job.category,
                        command = %job.command,
                        "no worker free and category queues nothing, dropping"
                    );
                }
            }
        }
    }

    fn run_now(&mut self, job: Job, sock: &zmq::Socket) {
        if let Some(st) = self.cats.get_mut(&job.category) {
            st.active += 1;
        }
        if let Some(i) = self.idle.pop() {
            self.assign(i, job, sock);
        } else if self.workers.len() < self.max_workers {
            self.spawn_worker(job);
        } else if let Some(st) = self.cats.get_mut(&job.category) {
            // Capacity said yes but every worker slot is taken; requeue at
            // the front so ordering within the category is kept.
            st.active -= 1;
            st.pending.push_front(job);
        }
    }

    fn assign(&mut self, index: usize, job: Job, sock: &zmq::Socket) {
        let Some(worker) = self.workers.get_mut(index) else {
            return;
        };
        let mut frames: Vec<Vec<u8>> = Vec::with_capacity(6 + job.parts.len());
        frames.push(worker.routing_id.clone());
        frames.push(WORKER_RUN.to_vec());
        frames.push(job.category.clone().into_bytes());
        frames.push(job.command.clone().into_bytes());
        frames.push(job.pubkey.to_vec());
        frames.push(vec![u8::from(job.service_node)]);
        frames.extend(job.parts.iter().cloned());
        match sock.send_multipart(frames, 0) {
            Ok(()) => {
                worker.busy = Some(job.category);
            }
            Err(e) => {
                error!(worker = index, "failed to hand job to worker: {e}");
                worker.busy = None;
                if let Some(st) = self.cats.get_mut(&job.category) {
                    st.active = st.active.saturating_sub(1);
                }
                self.idle.push(index);
            }
        }
    }

    fn spawn_worker(&mut self, job: Job) {
        let index = self.workers.len();
        let routing_id = format!("w{index}").into_bytes();
        let core = Arc::clone(&self.core);
        let registry = Arc::clone(&self.registry);
        let builder = std::thread::Builder::new().name(format!("curvemq-worker-{index}"));
        match builder.spawn(move || worker_loop(index, &core, &registry)) {
            Ok(thread) => {
                if self.core.log_on(LogLevel::Debug) {
                    debug!(worker = index, category = %job.category, "spawned worker");
                }
                self.workers.push(WorkerSlot {
                    thread: Some(thread),
                    routing_id,
                    busy: Some(job.category.clone()),
                    stash: Some(job),
                    started: false,
                    quit_sent: false,
                });
            }
            Err(e) => {
                error!("failed to spawn worker thread: {e}");
                if let Some(st) = self.cats.get_mut(&job.category) {
                    st.active = st.active.saturating_sub(1);
                }
            }
        }
    }

    /// Handles a READY or RAN notification arriving on the workers socket.
    pub fn worker_event(&mut self, parts: &[Vec<u8>], sock: &zmq::Socket, shutting_down: bool) {
        if parts.len() < 2 {
            warn!("short worker notification");
            return;
        }
        let Some(index) = self.workers.iter().position(|w| w.routing_id == parts[0]) else {
            warn!("notification from unknown worker routing id");
            return;
        };
        match parts[1].as_slice() {
            WORKER_READY => {
                self.workers[index].started = true;
                if shutting_down {
                    if send_quit(sock, &self.workers[index].routing_id) {
                        self.workers[index].quit_sent = true;
                    }
                    return;
                }
                match self.workers[index].stash.take() {
                    Some(job) => self.assign(index, job, sock),
                    None => self.idle.push(index),
                }
            }
            WORKER_RAN => {
                let finished = self.workers[index].busy.take();
                if let Some(cat) = &finished {
                    if let Some(st) = self.cats.get_mut(cat) {
                        st.active = st.active.saturating_sub(1);
                    }
                }
                if !shutting_down {
                    self.feed_worker(index, finished.as_deref(), sock);
                }
            }
            other => {
                warn!(verb = %String::from_utf8_lossy(other), "unexpected worker notification");
            }
        }
    }

    /// Gives a now-free worker its next job: the category it just finished
    /// first (warm caches), then the rest round-robin.
    fn feed_worker(&mut self, index: usize, finished: Option<&str>, sock: &zmq::Socket) {
        if let Some(cat) = finished {
            let cat = cat.to_owned();
            if self.try_dequeue(&cat, index, sock) {
                return;
            }
        }
        let n = self.cat_order.len();
        for k in 0..n {
            let cat = self.cat_order[(self.rr_next + k) % n].clone();
            if self.try_dequeue(&cat, index, sock) {
                self.rr_next = (self.rr_next + k + 1) % n;
                return;
            }
        }
        self.idle.push(index);
    }

    fn try_dequeue(&mut self, category: &str, index: usize, sock: &zmq::Socket) -> bool {
        let has_pending = self
            .cats
            .get(category)
            .is_some_and(|st| !st.pending.is_empty());
        if !has_pending || !self.can_run(category) {
            return false;
        }
        let Some(job) = self
            .cats
            .get_mut(category)
            .and_then(|st| st.pending.pop_front())
        else {
            return false;
        };
        if let Some(st) = self.cats.get_mut(category) {
            st.active += 1;
        }
        self.assign(index, job, sock);
        true
    }

    /// Tells every started worker to quit. Call repeatedly until
    /// [`Pool::quits_outstanding`] clears; workers that have not finished
    /// connecting get their QUIT when READY arrives.
    pub fn broadcast_quit(&mut self, sock: &zmq::Socket) {
        for worker in &mut self.workers {
            let finished = worker
                .thread
                .as_ref()
                .map_or(true, |t| t.is_finished());
            if worker.quit_sent || finished {
                continue;
            }
            if worker.started && send_quit(sock, &worker.routing_id) {
                worker.quit_sent = true;
            }
        }
    }

    pub fn quits_outstanding(&self) -> bool {
        self.workers.iter().any(|w| {
            !w.quit_sent
                && w.thread
                    .as_ref()
                    .is_some_and(|t| !t.is_finished())
        })
    }

    pub fn join_all(&mut self) {
        for worker in &mut self.workers {
            if let Some(thread) = worker.thread.take() {
                if thread.join().is_err() {
                    error!("worker thread terminated abnormally");
                }
            }
        }
    }

    pub fn spawned(&self) -> usize {
        self.workers.len()
    }
}

fn send_quit(sock: &zmq::Socket, routing_id: &[u8]) -> bool {
    sock.send_multipart([routing_id.to_vec(), WORKER_QUIT.to_vec()], 0)
        .is_ok()
}

/// One worker thread: receive a job, run the callback, report back.
fn worker_loop(index: usize, core: &Arc<Core>, registry: &Arc<Registry>) {
    let routing_id = format!("w{index}");
    let run = || -> Result<(), zmq::Error> {
        let sock = core.context().socket(zmq::DEALER)?;
        sock.set_identity(routing_id.as_bytes())?;
        sock.connect(&core.workers_endpoint())?;
        sock.send(WORKER_READY, 0)?;
        loop {
            let parts = sock.recv_multipart(0)?;
            match parts.first().map(Vec::as_slice) {
                Some(WORKER_QUIT) => return Ok(()),
                Some(WORKER_RUN) if parts.len() >= 6 => {
                    run_job(core, registry, &parts);
                    sock.send(WORKER_RAN, 0)?;
                }
                _ => warn!(worker = index, "malformed worker instruction"),
            }
        }
    };
    match run() {
        Ok(()) | Err(zmq::Error::ETERM) => {}
        Err(e) => error!(worker = index, "worker loop failed: {e}"),
    }
}

fn run_job(core: &Arc<Core>, registry: &Arc<Registry>, parts: &[Vec<u8>]) {
    let (Ok(category), Ok(command)) = (
        std::str::from_utf8(&parts[2]),
        std::str::from_utf8(&parts[3]),
    ) else {
        warn!("job with non-utf8 command name");
        return;
    };
    let Some(pubkey) = crate::control::parse_pubkey(&parts[4]) else {
        warn!("job with malformed pubkey");
        return;
    };
    let service_node = parts[5].first() == Some(&1);
    let Some(callback) = registry.callback(category, command) else {
        // The proxy only dispatches resolved commands; this is a bug guard.
        warn!(category, command, "job for unregistered command");
        return;
    };
    let data: Vec<&[u8]> = parts[6..].iter().map(Vec::as_slice).collect();
    let mut message = Message::new(core, pubkey, service_node, data);
    let callback = Arc::clone(callback);
    if catch_unwind(AssertUnwindSafe(move || callback(&mut message))).is_err() {
        warn!(category, command, "command callback panicked");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bare_pool(general: usize, cats: &[(&str, usize, i32)]) -> Pool {
        let mut registry = Registry::default();
        for (name, reserved, max_queue) in cats {
            registry
                .add_category(name, crate::types::Access::default(), *reserved, *max_queue)
                .unwrap();
        }
        let core = crate::Core::for_tests();
        Pool::new(Arc::new(core), Arc::new(registry), general)
    }

    fn fake_job(category: &str) -> Job {
        Job {
            category: category.to_owned(),
            command: "x".to_owned(),
            pubkey: [0u8; 32],
            service_node: false,
            parts: Vec::new(),
        }
    }

    fn force_active(pool: &mut Pool, category: &str, active: usize) {
        pool.cats.get_mut(category).unwrap().active = active;
    }

    #[test]
    fn max_workers_is_general_plus_reserved() {
        let pool = bare_pool(4, &[("a", 2, 200), ("b", 3, 200)]);
        assert_eq!(pool.max_workers, 9);
    }

    #[test]
    fn reserved_slot_admits_even_when_general_pool_is_full() {
        let mut pool = bare_pool(1, &[("a", 2, 200), ("b", 0, 200)]);
        // b consumes the single general worker.
        force_active(&mut pool, "b", 1);
        assert_eq!(pool.general_active(), 1);
        assert!(pool.can_run("a"));
        force_active(&mut pool, "a", 2);
        // a's reservation exhausted and no general room left.
        assert!(!pool.can_run("a"));
    }

    #[test]
    fn category_beyond_reservation_competes_for_general_capacity() {
        let mut pool = bare_pool(2, &[("a", 1, 200)]);
        force_active(&mut pool, "a", 1);
        // One past the reservation: uses general slot 1 of 2.
        assert!(pool.can_run("a"));
        force_active(&mut pool, "a", 3);
        assert_eq!(pool.general_active(), 2);
        assert!(!pool.can_run("a"));
    }

    #[test]
    fn placement_honors_queue_bounds() {
        let mut pool = bare_pool(0, &[("zero", 0, 0), ("one", 0, 1), ("inf", 0, -1)]);
        assert_eq!(pool.placement("zero"), Placement::DropNoQueue);

        assert_eq!(pool.placement("one"), Placement::Queue);
        pool.cats
            .get_mut("one")
            .unwrap()
            .pending
            .push_back(fake_job("one"));
        assert_eq!(pool.placement("one"), Placement::DropQueueFull);

        for _ in 0..1000 {
            pool.cats
                .get_mut("inf")
                .unwrap()
                .pending
                .push_back(fake_job("inf"));
        }
        assert_eq!(pool.placement("inf"), Placement::Queue);
    }

    #[test]
    fn placement_runs_when_capacity_exists() {
        let pool = bare_pool(1, &[("a", 0, 200)]);
        assert_eq!(pool.placement("a"), Placement::Run);
    }

    #[test]
    fn unknown_category_never_runs() {
        let pool = bare_pool(4, &[("a", 0, 200)]);
        assert!(!pool.can_run("nope"));
    }
}
