// src/server.rs
//
// Readiness loop. The loop thread owns the connection table; a connection is
// moved into a worker job and only comes back through the completion channel,
// so the loop and a worker never run the same connection at once.
use crate::config::ServerConfig;
use crate::conn::{Conn, ServeContext, Verdict};
use crate::error::{EtudeError, EtudeResult};
use crate::metrics::ServerMetrics;
use crate::pool::{Job, ThreadPool};
use crate::resource::DocumentRoot;
use crate::slab::{ConnId, ConnectionSlab};
use crate::syscalls::{
    self, CONN_READ, CONN_WRITE, EV_CLOSED, EV_READ, EV_WRITE, Epoll, LEVEL_READ, Waker,
    epoll_event,
};
use crossbeam_channel::{Receiver, Sender};
use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::os::fd::AsRawFd;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

const LISTENER_TOKEN: u64 = u64::MAX;
const WAKER_TOKEN: u64 = u64::MAX - 1;
const MAX_EVENTS: usize = 1024;
const LISTEN_BACKLOG: i32 = 1024;
/// Upper bound on how long a shutdown request goes unnoticed.
const WAIT_TIMEOUT_MS: i32 = 100;

/// A connection handed back by a worker, with what to do next.
pub struct Completion {
    id: ConnId,
    conn: Box<Conn>,
    verdict: Verdict,
}

/// Worker-side end of the completion channel.
#[derive(Clone)]
struct CompletionSender {
    tx: Sender<Completion>,
    waker: Arc<Waker>,
}

impl CompletionSender {
    fn send(&self, completion: Completion) {
        // The receiver only goes away once the loop has exited; the connection
        // is then dropped here, which closes its socket.
        if self.tx.send(completion).is_ok() {
            self.waker.wake();
        }
    }
}

/// Pool job owning one connection for the duration of its processing.
pub struct ConnJob {
    id: ConnId,
    conn: Option<Box<Conn>>,
    ctx: Arc<ServeContext>,
    done: CompletionSender,
}

impl ConnJob {
    /// Takes the connection back out of a job that was never run.
    fn into_conn(mut self) -> Option<Box<Conn>> {
        self.conn.take()
    }
}

impl Job for ConnJob {
    fn run(mut self) {
        let Some(conn) = self.conn.as_mut() else {
            return;
        };
        let verdict = conn.process(&self.ctx);
        if let Some(conn) = self.conn.take() {
            self.done.send(Completion { id: self.id, conn, verdict });
        }
    }
}

impl Drop for ConnJob {
    // Still holding the connection here means `process` panicked or the job was
    // discarded; hand it back so the loop can free the slot.
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.done.send(Completion {
                id: self.id,
                conn,
                verdict: Verdict::Close,
            });
        }
    }
}

/// Server context: everything the loop owns, created by `bind`, torn down by `run`.
pub struct Server {
    config: ServerConfig,
    listener: TcpListener,
    epoll: Epoll,
    waker: Arc<Waker>,
    slab: ConnectionSlab<Conn>,
    pool: ThreadPool<ConnJob>,
    ctx: Arc<ServeContext>,
    done_tx: Sender<Completion>,
    done_rx: Receiver<Completion>,
}

impl Server {
    pub fn bind(config: ServerConfig) -> EtudeResult<Self> {
        config.validate()?;
        let addr = config.socket_addr()?;

        let listener = TcpListener::from(syscalls::create_listen_socket(&addr, LISTEN_BACKLOG)?);
        let epoll = Epoll::new()?;
        let waker = Arc::new(Waker::new()?);
        epoll.add(listener.as_raw_fd(), LISTENER_TOKEN, LEVEL_READ)?;
        epoll.add(waker.read_fd(), WAKER_TOKEN, LEVEL_READ)?;

        let pool = ThreadPool::new(config.workers, config.queue_capacity)?;
        let (done_tx, done_rx) = crossbeam_channel::unbounded();
        let ctx = Arc::new(ServeContext {
            root: DocumentRoot::new(config.document_root.clone()),
            metrics: Arc::new(ServerMetrics::new()),
        });

        Ok(Self {
            slab: ConnectionSlab::new(config.max_connections),
            config,
            listener,
            epoll,
            waker,
            pool,
            ctx,
            done_tx,
            done_rx,
        })
    }

    pub fn local_addr(&self) -> EtudeResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn metrics(&self) -> Arc<ServerMetrics> {
        Arc::clone(&self.ctx.metrics)
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Runs the readiness loop until `shutdown` is set, then closes every
    /// connection and stops the worker pool.
    pub fn run(mut self, shutdown: Arc<AtomicBool>) -> EtudeResult<()> {
        info!(
            "Serving {} on {} with {} workers",
            self.ctx.root.path().display(),
            self.local_addr()?,
            self.pool.threads()
        );
        let reporter = self.spawn_metrics_reporter(&shutdown);

        let mut events = vec![epoll_event { events: 0, u64: 0 }; MAX_EVENTS];
        let mut result = Ok(());
        while !shutdown.load(Ordering::Acquire) {
            let n = match self.epoll.wait(&mut events, WAIT_TIMEOUT_MS) {
                Ok(n) => n,
                Err(e) => {
                    error!("epoll_wait failed: {}", e);
                    result = Err(e);
                    break;
                }
            };

            for ev in &events[..n] {
                let token = ev.u64;
                let flags = ev.events;
                match token {
                    LISTENER_TOKEN => self.accept_all(),
                    WAKER_TOKEN => self.waker.drain(),
                    _ => self.on_conn_event(ConnId::from_token(token), flags),
                }
            }
            self.collect_completions();
        }

        self.teardown();
        if let Some(handle) = reporter {
            let _ = handle.join();
        }
        info!("etude server shut down");
        result
    }

    fn accept_all(&mut self) {
        loop {
            let (stream, peer) = match self.listener.accept() {
                Ok(accepted) => accepted,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!("accept failed: {}", e);
                    return;
                }
            };

            if self.slab.is_full() {
                warn!("Connection limit {} reached, refusing {}", self.slab.capacity(), peer);
                continue;
            }
            if let Err(e) = stream.set_nonblocking(true) {
                warn!("set_nonblocking failed for {}: {}", peer, e);
                continue;
            }
            self.register(stream, peer);
        }
    }

    fn register(&mut self, stream: TcpStream, peer: SocketAddr) {
        let fd = stream.as_raw_fd();
        let Some(id) = self.slab.allocate(fd, Box::new(Conn::new(stream, peer))) else {
            return;
        };
        if let Err(e) = self.epoll.add(fd, id.token(), CONN_READ) {
            warn!("epoll add failed for {}: {}", peer, e);
            self.slab.free(id);
            return;
        }
        let live = self.ctx.metrics.inc_conn();
        info!("New connection: {}\tConnection Num: {}", peer, live);
    }

    fn on_conn_event(&mut self, id: ConnId, flags: u32) {
        // Events for stale ids or connections a worker holds are ignored.
        if self.slab.get_mut(id).is_none() {
            return;
        }

        // A hang-up closes the connection even if a full request is buffered.
        if flags & EV_CLOSED != 0 {
            self.close(id);
        } else if flags & EV_READ != 0 {
            let received = match self.slab.get_mut(id) {
                Some(conn) => conn.receive(),
                None => return,
            };
            match received {
                Ok(_) => self.dispatch(id),
                Err(e) => {
                    debug!("read ended: {}", e);
                    self.close(id);
                }
            }
        } else if flags & EV_WRITE != 0 {
            let verdict = match self.slab.get_mut(id) {
                Some(conn) => conn.flush(&self.ctx.metrics),
                None => return,
            };
            self.apply(id, verdict);
        }
    }

    /// Moves the connection into a worker job.
    fn dispatch(&mut self, id: ConnId) {
        let Some(conn) = self.slab.check_out(id) else {
            return;
        };
        let job = ConnJob {
            id,
            conn: Some(conn),
            ctx: Arc::clone(&self.ctx),
            done: CompletionSender {
                tx: self.done_tx.clone(),
                waker: Arc::clone(&self.waker),
            },
        };

        if let Err(rejected) = self.pool.submit(job) {
            // Overload policy: close the connection without a response.
            self.ctx.metrics.inc_rejected();
            if rejected.is_full() {
                warn!("Worker queue full ({}), dropping connection", self.pool.capacity());
            } else {
                warn!("Worker pool closed, dropping connection");
            }
            if let Some(conn) = rejected.into_inner().into_conn() {
                let _ = self.slab.check_in(id, conn);
            }
            self.close(id);
        }
    }

    fn collect_completions(&mut self) {
        while let Ok(Completion { id, conn, verdict }) = self.done_rx.try_recv() {
            match self.slab.check_in(id, conn) {
                Ok(()) => self.apply(id, verdict),
                Err(stale) => {
                    warn!("Discarding completion for stale connection {:?}", id);
                    drop(stale);
                }
            }
        }
    }

    /// Re-arms the one-shot registration or closes, as the connection asked.
    fn apply(&mut self, id: ConnId, verdict: Verdict) {
        let interest = match verdict {
            Verdict::Read => CONN_READ,
            Verdict::Write => CONN_WRITE,
            Verdict::Close => return self.close(id),
        };
        let Some(fd) = self.slab.fd(id) else {
            return;
        };
        if let Err(e) = self.epoll.modify(fd, id.token(), interest) {
            warn!("epoll modify failed: {}", e);
            self.close(id);
        }
    }

    fn close(&mut self, id: ConnId) {
        let Some((fd, conn)) = self.slab.free(id) else {
            return;
        };
        let _ = self.epoll.delete(fd);
        let peer = conn.peer();
        // Dropping the connection closes the socket and any file mapping.
        drop(conn);
        let live = self.ctx.metrics.dec_conn();
        info!("Disconnection: {}\tConnection Num: {}", peer, live);
    }

    fn teardown(self) {
        let Server {
            pool,
            mut slab,
            ctx,
            done_rx,
            ..
        } = self;
        // Let queued jobs finish so their connections come back, then drop all.
        pool.shutdown();
        while let Ok(Completion { id, conn, .. }) = done_rx.try_recv() {
            let _ = slab.check_in(id, conn);
        }
        let dropped = slab.clear();
        for _ in 0..dropped {
            ctx.metrics.dec_conn();
        }
        debug!("Closed {} connections on shutdown", dropped);
    }

    fn spawn_metrics_reporter(&self, shutdown: &Arc<AtomicBool>) -> Option<JoinHandle<()>> {
        let interval = Duration::from_secs(self.config.metrics_interval_secs);
        if interval.is_zero() {
            return None;
        }
        let metrics = Arc::clone(&self.ctx.metrics);
        let shutdown = Arc::clone(shutdown);
        thread::Builder::new()
            .name("etude-metrics".to_string())
            .spawn(move || {
                let mut last = Instant::now();
                while !shutdown.load(Ordering::Acquire) {
                    thread::sleep(Duration::from_millis(WAIT_TIMEOUT_MS as u64));
                    if last.elapsed() < interval {
                        continue;
                    }
                    last = Instant::now();
                    let s = metrics.snapshot();
                    info!(
                        "[Metrics] Active Connections: {} | Total Requests: {} | Bytes Sent: {} | Rejected: {}",
                        s.active_conns, s.req_count, s.bytes_sent, s.rejected
                    );
                }
            })
            .map_err(|e| warn!("metrics reporter not started: {}", EtudeError::PoolSpawn(e)))
            .ok()
    }
}
