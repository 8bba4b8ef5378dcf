// src/server.rs
use crate::config::{ServerConfig, TriggerMode};
use crate::conn::{ConnSlot, Connection, WriteStatus};
use crate::credentials::CredentialStore;
use crate::error::EtudeResult;
use crate::metrics::ServerMetrics;
use crate::syscalls::{
    self, EPOLLERR, EPOLLHUP, EPOLLIN, EPOLLOUT, EPOLLRDHUP, Epoll, Events, Socket,
};
use crate::timer::DeadlineTimer;
use crate::worker::WorkerPool;
use std::collections::HashMap;
use std::io;
use std::net::SocketAddrV4;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::time::Duration;

const LISTENER_TOKEN: u64 = u64::MAX;
const WAKE_TOKEN: u64 = u64::MAX - 1;
const MAX_EVENTS: usize = 1024;

const BUSY_MESSAGE: &[u8] = b"Server busy!";

/// What a finished task wants done with its connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Next {
    Read,
    Write,
    Close,
}

#[derive(Debug, Clone, Copy)]
enum TaskKind {
    Read,
    Write,
}

/// State shared between the event loop, workers and timer callbacks.
struct Shared {
    epoll: Epoll,
    conn_events: u32,
    static_root: PathBuf,
    store: Arc<dyn CredentialStore>,
    metrics: Arc<ServerMetrics>,
    /// Tokens of closed connections, reclaimed by the loop.
    closed_tx: Sender<u64>,
}

impl Shared {
    fn run_task(&self, slot: &Arc<ConnSlot>, kind: TaskKind) {
        if !slot.begin_dispatch() {
            self.metrics.inc_handoff_violation();
            tracing::error!(token = slot.token(), "connection dispatched while busy");
        }

        let next = catch_unwind(AssertUnwindSafe(|| {
            let mut conn = slot.lock();
            match kind {
                TaskKind::Read => self.on_read(&mut conn),
                TaskKind::Write => self.on_write(&mut conn),
            }
        }))
        .unwrap_or_else(|_| {
            tracing::error!(token = slot.token(), "connection task panicked");
            Next::Close
        });

        slot.end_dispatch();
        self.complete(slot, next);
    }

    fn on_read(&self, conn: &mut Connection) -> Next {
        match conn.read() {
            Ok(0) => Next::Close,
            Ok(_) => self.on_process(conn),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => self.on_process(conn),
            Err(e) => {
                tracing::debug!(error = %e, "read failed");
                Next::Close
            }
        }
    }

    fn on_process(&self, conn: &mut Connection) -> Next {
        if conn.process(&self.static_root, self.store.as_ref()) {
            self.metrics.inc_req();
            Next::Write
        } else {
            Next::Read
        }
    }

    fn on_write(&self, conn: &mut Connection) -> Next {
        let before = conn.to_write_bytes();
        let result = conn.write();
        self.metrics.add_bytes(before - conn.to_write_bytes());

        match result {
            Ok(WriteStatus::Drained) if conn.is_keep_alive() => self.on_process(conn),
            Ok(WriteStatus::Drained) => Next::Close,
            Ok(WriteStatus::Pending) => Next::Write,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Next::Write,
            Err(e) => {
                tracing::debug!(error = %e, "write failed");
                Next::Close
            }
        }
    }

    /// Hand the connection back to the multiplexer, exactly once per task.
    fn complete(&self, slot: &Arc<ConnSlot>, next: Next) {
        if slot.is_closed() {
            return;
        }
        let interest = match next {
            Next::Read => self.conn_events | EPOLLIN,
            Next::Write => self.conn_events | EPOLLOUT,
            Next::Close => {
                self.disconnect(slot);
                return;
            }
        };
        if let Err(e) = self.epoll.modify(slot.fd(), slot.token(), interest) {
            tracing::warn!(token = slot.token(), error = %e, "re-arm failed");
            self.disconnect(slot);
        }
    }

    /// Close a connection from any thread. Returns false if it was already
    /// closed.
    fn disconnect(&self, slot: &Arc<ConnSlot>) -> bool {
        if !slot.close() {
            return false;
        }
        if let Err(e) = self.epoll.unregister(slot.fd()) {
            tracing::warn!(token = slot.token(), error = %e, "unregister failed");
        }
        // A worker mid-task keeps the state until it lets go of the slot.
        if let Some(mut conn) = slot.try_lock() {
            conn.release();
        }
        self.metrics.dec_conn();
        tracing::info!(
            token = slot.token(),
            peer = %slot.peer(),
            active = self.metrics.active(),
            "client quit"
        );
        let _ = self.closed_tx.send(slot.token());
        true
    }
}

/// Stops a running [`Server`] from another thread.
#[derive(Clone)]
pub struct ShutdownHandle {
    flag: Arc<AtomicBool>,
    wake: Arc<Socket>,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        self.flag.store(true, Ordering::Release);
        syscalls::notify_pipe(self.wake.fd());
    }

    pub fn is_shutdown(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}

/// Readiness-driven HTTP server.
///
/// One thread runs the epoll loop: it accepts clients, tracks idle
/// deadlines and hands ready connections to the worker pool. Connection
/// sockets are one-shot, so each is owned by at most one worker until that
/// worker re-arms it.
pub struct Server {
    trigger: TriggerMode,
    idle_timeout: Option<Duration>,
    max_connections: usize,
    max_request_bytes: usize,
    listener: Socket,
    local_addr: SocketAddrV4,
    wake_rx: Socket,
    shutdown: ShutdownHandle,
    shared: Arc<Shared>,
    pool: WorkerPool,
    timer: DeadlineTimer<u64>,
    conns: HashMap<u64, Arc<ConnSlot>>,
    closed_rx: Receiver<u64>,
    next_token: u64,
}

impl Server {
    /// Bind the listener, start the workers and set up the multiplexer.
    pub fn new(config: ServerConfig, store: Arc<dyn CredentialStore>) -> EtudeResult<Self> {
        let config = config.validated()?;
        let trigger = config.trigger();

        let listener = syscalls::create_listen_socket(config.port, config.graceful_linger)?;
        let local_addr = syscalls::local_addr(listener.fd())?;
        let epoll = Epoll::new()?;
        epoll.register(listener.fd(), LISTENER_TOKEN, trigger.listen_events() | EPOLLIN)?;

        let (wake_rx, wake_tx) = syscalls::create_pipe()?;
        epoll.register(wake_rx.fd(), WAKE_TOKEN, EPOLLIN)?;

        if !config.static_root.is_dir() {
            tracing::warn!(root = %config.static_root.display(), "static root is not a directory");
        }

        let pool = WorkerPool::new(config.worker_threads, config.pin_workers)?;
        let (closed_tx, closed_rx) = mpsc::channel();

        tracing::info!(
            port = local_addr.port(),
            linger = config.graceful_linger,
            listen_mode = trigger.listen_label(),
            conn_mode = trigger.conn_label(),
            root = %config.static_root.display(),
            workers = pool.size(),
            credential_pool = config.credential_pool_size,
            idle_timeout_ms = config.idle_timeout_ms,
            "server init"
        );

        Ok(Self {
            trigger,
            idle_timeout: config.idle_timeout(),
            max_connections: config.max_connections,
            max_request_bytes: config.max_request_bytes,
            listener,
            local_addr,
            wake_rx,
            shutdown: ShutdownHandle {
                flag: Arc::new(AtomicBool::new(false)),
                wake: Arc::new(wake_tx),
            },
            shared: Arc::new(Shared {
                epoll,
                conn_events: trigger.conn_events(),
                static_root: config.static_root,
                store,
                metrics: Arc::new(ServerMetrics::new()),
                closed_tx,
            }),
            pool,
            timer: DeadlineTimer::new(),
            conns: HashMap::new(),
            closed_rx,
            next_token: 0,
        })
    }

    pub fn local_addr(&self) -> SocketAddrV4 {
        self.local_addr
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    pub fn metrics(&self) -> Arc<ServerMetrics> {
        self.shared.metrics.clone()
    }

    /// Run the event loop until [`ShutdownHandle::shutdown`] is called.
    pub fn run(mut self) -> EtudeResult<()> {
        let mut events = Events::with_capacity(MAX_EVENTS);
        tracing::info!(addr = %self.local_addr, "server start");

        while !self.shutdown.is_shutdown() {
            self.reap_closed();
            let timeout = match self.idle_timeout {
                Some(_) => self.timer.next_deadline_ms(),
                None => -1,
            };

            if let Err(e) = self.shared.epoll.wait(&mut events, timeout) {
                tracing::error!(error = %e, "epoll wait failed");
                self.stop();
                return Err(e.into());
            }

            for (token, mask) in events.iter() {
                match token {
                    LISTENER_TOKEN => self.accept_clients(),
                    WAKE_TOKEN => syscalls::drain_pipe(self.wake_rx.fd()),
                    _ => self.dispatch(token, mask),
                }
            }
        }

        self.stop();
        Ok(())
    }

    fn accept_clients(&mut self) {
        loop {
            match syscalls::accept_connection(self.listener.fd()) {
                Ok(Some((socket, peer))) => {
                    if self.shared.metrics.active() >= self.max_connections {
                        let _ = syscalls::send_vectored(socket.fd(), &[BUSY_MESSAGE]);
                        self.shared.metrics.inc_rejected();
                        tracing::warn!(peer = %peer, "clients full, connection refused");
                    } else {
                        self.add_client(socket, peer);
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(error = %e, "accept failed");
                    break;
                }
            }
            if !self.trigger.listen_edge {
                break;
            }
        }
    }

    fn add_client(&mut self, socket: Socket, peer: SocketAddrV4) {
        let token = self.next_token;
        self.next_token += 1;
        let slot = Arc::new(ConnSlot::new(
            token,
            socket,
            peer,
            self.trigger.conn_edge,
            self.max_request_bytes,
        ));

        if let Err(e) =
            self.shared
                .epoll
                .register(slot.fd(), token, self.shared.conn_events | EPOLLIN)
        {
            tracing::warn!(peer = %peer, error = %e, "register failed");
            return;
        }

        if let Some(timeout) = self.idle_timeout {
            let shared = self.shared.clone();
            let idle = slot.clone();
            self.timer.add(token, timeout, move || {
                if shared.disconnect(&idle) {
                    shared.metrics.inc_evicted();
                    tracing::debug!(token = idle.token(), "idle connection evicted");
                }
            });
        }

        self.shared.metrics.inc_conn();
        self.conns.insert(token, slot);
        tracing::info!(
            token,
            peer = %peer,
            active = self.shared.metrics.active(),
            "client joined"
        );
    }

    fn dispatch(&mut self, token: u64, mask: u32) {
        let Some(slot) = self.conns.get(&token).cloned() else {
            return;
        };
        if slot.is_closed() {
            return;
        }

        if mask & (EPOLLRDHUP | EPOLLHUP | EPOLLERR) != 0 {
            self.shared.disconnect(&slot);
        } else if mask & EPOLLIN != 0 {
            self.extend_deadline(token);
            self.submit(slot, TaskKind::Read);
        } else if mask & EPOLLOUT != 0 {
            self.extend_deadline(token);
            self.submit(slot, TaskKind::Write);
        } else {
            tracing::error!(token, mask, "unexpected event");
        }
    }

    fn extend_deadline(&mut self, token: u64) {
        if let Some(timeout) = self.idle_timeout {
            if self.timer.contains(token) {
                self.timer.adjust(token, timeout);
            }
        }
    }

    fn submit(&self, slot: Arc<ConnSlot>, kind: TaskKind) {
        let shared = self.shared.clone();
        let task_slot = slot.clone();
        if let Err(e) = self.pool.submit(move || shared.run_task(&task_slot, kind)) {
            tracing::warn!(token = slot.token(), error = %e, "task rejected");
            self.shared.disconnect(&slot);
        }
    }

    /// Drop table entries and timers of connections closed since the last
    /// iteration.
    fn reap_closed(&mut self) {
        while let Ok(token) = self.closed_rx.try_recv() {
            self.timer.cancel(token);
            self.conns.remove(&token);
        }
    }

    fn stop(&mut self) {
        tracing::info!(active = self.shared.metrics.active(), "server shutting down");
        self.pool.shutdown();

        for slot in self.conns.values() {
            self.shared.disconnect(slot);
        }
        self.reap_closed();
        self.timer.clear();
        self.conns.clear();
        let _ = self.shared.epoll.unregister(self.listener.fd());

        let snap = self.shared.metrics.snapshot();
        tracing::info!(
            requests = snap.req_count,
            bytes_sent = snap.bytes_sent,
            rejected = snap.rejected_conns,
            idle_evictions = snap.idle_evictions,
            handoff_violations = snap.handoff_violations,
            "server stopped"
        );
    }
}
