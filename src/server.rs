//! Connection listener.
//!
//! One connection at a time: a session runs to completion before the next
//! `accept`. The accept loop checks a shutdown flag between connections, and
//! requesting shutdown also closes the connection being served so an idle
//! peer cannot hold the listener open.

use anyhow::{anyhow, Context, Result};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::ready::ReadySignal;
use crate::session::{Processor, Session, SessionOutcome, SessionProfile, SessionReport};

const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub addr: String,
    pub profile: SessionProfile,
    pub read_timeout: Option<Duration>,
    pub write_timeout: Option<Duration>,
    /// Stop listening when a peer sends `EXIT`.
    pub stop_on_exit: bool,
    /// Stop listening after the first session that reaches ready.
    pub stop_after_ready: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: "0.0.0.0:8050".to_string(),
            profile: SessionProfile::default(),
            read_timeout: None,
            write_timeout: None,
            stop_on_exit: true,
            stop_after_ready: false,
        }
    }
}

/// Shutdown request shared between a listener and whoever stops it.
///
/// Cloneable and usable from a signal handler. The connection being served is
/// shut down when a request arrives, which ends its blocking reads.
#[derive(Clone, Debug, Default)]
pub struct ShutdownHandle {
    inner: Arc<ShutdownState>,
}

#[derive(Debug, Default)]
struct ShutdownState {
    requested: AtomicBool,
    active: Mutex<Option<TcpStream>>,
}

impl ShutdownHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self) {
        let active = self.active();
        self.inner.requested.store(true, Ordering::SeqCst);
        if let Some(stream) = active.as_ref() {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }

    pub fn is_requested(&self) -> bool {
        self.inner.requested.load(Ordering::SeqCst)
    }

    fn track(&self, stream: &TcpStream) -> std::io::Result<()> {
        let clone = stream.try_clone()?;
        let mut active = self.active();
        if self.is_requested() {
            let _ = clone.shutdown(Shutdown::Both);
        }
        *active = Some(clone);
        Ok(())
    }

    fn untrack(&self) {
        self.active().take();
    }

    fn active(&self) -> MutexGuard<'_, Option<TcpStream>> {
        self.inner
            .active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// Counters for one listening cycle.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ServeStats {
    pub sessions: u64,
    pub ready_sessions: u64,
    pub failed_sessions: u64,
}

#[derive(Debug)]
pub struct RelayHandle {
    pub addr: SocketAddr,
    ready: ReadySignal,
    shutdown: ShutdownHandle,
    join: Option<JoinHandle<Result<ServeStats>>>,
}

impl RelayHandle {
    pub fn ready_signal(&self) -> &ReadySignal {
        &self.ready
    }

    /// Request shutdown and wait for the listener thread.
    pub fn stop(mut self) -> Result<ServeStats> {
        self.shutdown.request();
        self.join_thread()
    }

    /// Wait for the listener to stop on its own (after `EXIT` or a ready
    /// hand-off with `stop_after_ready`).
    pub fn wait(mut self) -> Result<ServeStats> {
        self.join_thread()
    }

    fn join_thread(&mut self) -> Result<ServeStats> {
        match self.join.take() {
            Some(join) => join
                .join()
                .map_err(|_| anyhow!("relay listener thread panicked"))?,
            None => Ok(ServeStats::default()),
        }
    }
}

pub struct RelayServer<P> {
    cfg: ServerConfig,
    processor: P,
    ready: ReadySignal,
    shutdown: ShutdownHandle,
}

impl<P: Processor> RelayServer<P> {
    pub fn new(cfg: ServerConfig, processor: P) -> Self {
        Self {
            cfg,
            processor,
            ready: ReadySignal::new(),
            shutdown: ShutdownHandle::new(),
        }
    }

    /// Share an existing signal instead of a private one.
    pub fn with_ready_signal(mut self, ready: ReadySignal) -> Self {
        self.ready = ready;
        self
    }

    /// Share an existing shutdown handle, e.g. one held by a signal handler.
    pub fn with_shutdown(mut self, shutdown: ShutdownHandle) -> Self {
        self.shutdown = shutdown;
        self
    }

    /// Serve on the calling thread until shutdown is requested or the
    /// configured stop condition is met.
    pub fn run(mut self) -> Result<ServeStats> {
        let listener = bind(&self.cfg.addr)?;
        log::info!("relay listening on {}", listener.local_addr()?);
        self.ready.arm();
        serve(
            listener,
            &self.cfg,
            &mut self.processor,
            &self.ready,
            &self.shutdown,
        )
    }
}

impl<P: Processor + Send + 'static> RelayServer<P> {
    /// Bind and serve on a background thread.
    pub fn spawn(self) -> Result<RelayHandle> {
        let listener = bind(&self.cfg.addr)?;
        let addr = listener.local_addr()?;
        log::info!("relay listening on {}", addr);
        self.ready.arm();

        let shutdown = self.shutdown.clone();
        let shutdown_thread = self.shutdown;
        let ready = self.ready.clone();
        let cfg = self.cfg;
        let mut processor = self.processor;
        let join = std::thread::spawn(move || {
            let result = serve(listener, &cfg, &mut processor, &ready, &shutdown_thread);
            if let Err(err) = &result {
                log::error!("relay listener stopped: {}", err);
            }
            result
        });

        Ok(RelayHandle {
            addr,
            ready: self.ready,
            shutdown,
            join: Some(join),
        })
    }
}

fn bind(addr: &str) -> Result<TcpListener> {
    let addr: SocketAddr = addr
        .parse()
        .with_context(|| format!("invalid listen address '{}'", addr))?;
    let listener = TcpListener::bind(addr).with_context(|| format!("bind {}", addr))?;
    listener.set_nonblocking(true)?;
    Ok(listener)
}

fn serve<P: Processor + ?Sized>(
    listener: TcpListener,
    cfg: &ServerConfig,
    processor: &mut P,
    ready: &ReadySignal,
    shutdown: &ShutdownHandle,
) -> Result<ServeStats> {
    let mut stats = ServeStats::default();
    loop {
        if shutdown.is_requested() {
            log::info!("relay listener shutting down");
            break;
        }
        match listener.accept() {
            Ok((stream, peer)) => {
                stats.sessions += 1;
                if let Err(err) = shutdown.track(&stream) {
                    log::warn!("cannot track connection with {}: {}", peer, err);
                }
                let result = handle_connection(stream, peer, cfg, processor, ready);
                shutdown.untrack();
                match result {
                    Ok(report) => {
                        if report.outcome == SessionOutcome::Ready {
                            stats.ready_sessions += 1;
                            if cfg.stop_after_ready {
                                log::info!("ready hand-off done; relay listener stopping");
                                break;
                            }
                        }
                        if report.outcome == SessionOutcome::Exit && cfg.stop_on_exit {
                            log::info!("client requested exit; relay listener stopping");
                            break;
                        }
                    }
                    Err(err) => {
                        stats.failed_sessions += 1;
                        log::error!("session with {} failed: {}", peer, err);
                    }
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(ACCEPT_POLL_INTERVAL);
                continue;
            }
            Err(err) => return Err(err.into()),
        }
    }
    Ok(stats)
}

fn handle_connection<P: Processor + ?Sized>(
    stream: TcpStream,
    peer: SocketAddr,
    cfg: &ServerConfig,
    processor: &mut P,
    ready: &ReadySignal,
) -> Result<SessionReport> {
    log::info!("connection established with {}", peer);
    stream.set_nonblocking(false)?;
    stream.set_read_timeout(cfg.read_timeout)?;
    stream.set_write_timeout(cfg.write_timeout)?;
    stream.set_nodelay(true)?;

    let report = Session::new(&stream, &cfg.profile, &mut *processor)
        .run()
        .with_context(|| format!("session with {}", peer))?;
    log::info!(
        "session with {} ended: {:?} (commands={}, frames={}, failed transfers={})",
        peer,
        report.outcome,
        report.commands,
        report.frames_processed,
        report.transfer_failures.len()
    );

    if report.outcome == SessionOutcome::Ready {
        processor.on_ready(&report.files);
        if !ready.notify(report.files.clone()) {
            log::debug!("ready signal already set for this cycle");
        }
    }
    Ok(report)
}
