//! Stateful TCP sessions to the primary quote servers.
//!
//! A `TdxSession` owns one socket and, optionally, a heartbeat thread that
//! pings the server while the session sits idle. Sessions must be closed
//! explicitly (or dropped); `close` stops and joins the heartbeat thread
//! before shutting the socket down.

use super::provider::{DataError, DateRange, RawBar};
use super::wire::{self, Command, SecurityEntry};
use crate::domain::Exchange;
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// One connection to a quote server.
pub trait QuoteSession: Send {
    fn daily_bars(
        &mut self,
        exchange: Exchange,
        code: &str,
        range: DateRange,
    ) -> Result<Vec<RawBar>, DataError>;

    fn security_list(&mut self, exchange: Exchange) -> Result<Vec<SecurityEntry>, DataError>;

    fn heartbeat(&mut self) -> Result<(), DataError>;

    /// Release the connection. Idempotent.
    fn close(&mut self) -> Result<(), DataError>;

    fn is_closed(&self) -> bool;
}

/// Opens sessions for the pool.
pub trait SessionFactory: Send + Sync {
    fn connect(&self, worker: usize) -> Result<Box<dyn QuoteSession>, DataError>;
}

/// Connection settings for [`TdxSession`].
#[derive(Debug, Clone)]
pub struct TdxConfig {
    /// `host:port` endpoints, tried in order.
    pub servers: Vec<String>,
    /// Connect, read and write timeout.
    pub timeout: Duration,
    /// Idle ping interval; `None` disables the heartbeat thread.
    pub heartbeat: Option<Duration>,
}

impl Default for TdxConfig {
    fn default() -> Self {
        Self {
            servers: Vec::new(),
            timeout: Duration::from_secs(10),
            heartbeat: Some(Duration::from_secs(15)),
        }
    }
}

struct Conn {
    stream: TcpStream,
    seq: u32,
    last_used: Instant,
}

impl Conn {
    fn call(&mut self, command: Command, body: &[u8]) -> Result<Vec<u8>, DataError> {
        self.seq = self.seq.wrapping_add(1);
        let seq = self.seq;
        wire::write_request(&mut self.stream, seq, command, body)?;
        let reply = wire::read_response(&mut self.stream, seq, command);
        self.last_used = Instant::now();
        reply
    }
}

struct Shared {
    conn: Mutex<Conn>,
    /// Set when the heartbeat thread saw the stream break.
    broken: AtomicBool,
}

struct Heartbeat {
    stop: Sender<()>,
    handle: JoinHandle<()>,
}

pub struct TdxSession {
    shared: Arc<Shared>,
    heartbeat: Option<Heartbeat>,
    server: String,
    closed: bool,
}

impl TdxSession {
    /// Connect to the first reachable server in `config.servers`.
    pub fn connect(config: &TdxConfig) -> Result<Self, DataError> {
        let mut last_error = None;
        for server in &config.servers {
            match open_stream(server, config.timeout) {
                Ok(stream) => {
                    debug!(server = %server, "quote session connected");
                    return Ok(Self::from_stream(stream, server.clone(), config.heartbeat));
                }
                Err(e) => {
                    warn!(server = %server, error = %e, "quote server unreachable");
                    last_error = Some(e);
                }
            }
        }
        if let Some(e) = &last_error {
            debug!(error = %e, "all quote servers failed");
        }
        Err(DataError::NoServerReachable {
            tried: config.servers.len(),
        })
    }

    fn from_stream(stream: TcpStream, server: String, heartbeat: Option<Duration>) -> Self {
        let shared = Arc::new(Shared {
            conn: Mutex::new(Conn {
                stream,
                seq: 0,
                last_used: Instant::now(),
            }),
            broken: AtomicBool::new(false),
        });
        let heartbeat = heartbeat
            .filter(|d| !d.is_zero())
            .map(|interval| spawn_heartbeat(Arc::clone(&shared), interval));
        Self {
            shared,
            heartbeat,
            server,
            closed: false,
        }
    }

    pub fn server(&self) -> &str {
        &self.server
    }

    fn call(&mut self, command: Command, body: &[u8]) -> Result<Vec<u8>, DataError> {
        if self.closed {
            return Err(DataError::SessionClosed);
        }
        if self.shared.broken.load(Ordering::SeqCst) {
            return Err(DataError::Protocol("connection lost during heartbeat".into()));
        }
        let mut conn = self
            .shared
            .conn
            .lock()
            .map_err(|_| DataError::SessionClosed)?;
        conn.call(command, body)
    }
}

impl QuoteSession for TdxSession {
    fn daily_bars(
        &mut self,
        exchange: Exchange,
        code: &str,
        range: DateRange,
    ) -> Result<Vec<RawBar>, DataError> {
        let body = wire::encode_daily_bars_body(exchange, code, range.start, range.end)?;
        let reply = self.call(Command::DailyBars, &body)?;
        wire::decode_daily_bars(&reply)
    }

    fn security_list(&mut self, exchange: Exchange) -> Result<Vec<SecurityEntry>, DataError> {
        let reply = self.call(Command::SecurityList, &wire::encode_security_list_body(exchange))?;
        wire::decode_security_list(&reply)
    }

    fn heartbeat(&mut self) -> Result<(), DataError> {
        self.call(Command::Heartbeat, &[]).map(|_| ())
    }

    fn close(&mut self) -> Result<(), DataError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        if let Some(hb) = self.heartbeat.take() {
            drop(hb.stop);
            if hb.handle.join().is_err() {
                warn!(server = %self.server, "heartbeat thread panicked");
            }
        }

        let conn = self
            .shared
            .conn
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        match conn.stream.shutdown(Shutdown::Both) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotConnected => Ok(()),
            Err(e) => Err(DataError::NetworkUnreachable(format!(
                "shutdown of {} failed: {e}",
                self.server
            ))),
        }
    }

    fn is_closed(&self) -> bool {
        self.closed
    }
}

impl Drop for TdxSession {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!(server = %self.server, error = %e, "session close on drop failed");
        }
    }
}

/// Opens [`TdxSession`]s from a fixed configuration.
#[derive(Debug, Clone)]
pub struct TdxSessionFactory {
    config: TdxConfig,
}

impl TdxSessionFactory {
    pub fn new(config: TdxConfig) -> Self {
        Self { config }
    }
}

impl SessionFactory for TdxSessionFactory {
    fn connect(&self, worker: usize) -> Result<Box<dyn QuoteSession>, DataError> {
        let session = TdxSession::connect(&self.config)?;
        debug!(worker, server = %session.server(), "worker session opened");
        Ok(Box::new(session))
    }
}

fn open_stream(server: &str, timeout: Duration) -> Result<TcpStream, DataError> {
    let addrs = server
        .to_socket_addrs()
        .map_err(|e| DataError::NetworkUnreachable(format!("{server}: {e}")))?;

    let mut last_error = DataError::NetworkUnreachable(format!("{server}: no addresses"));
    for addr in addrs {
        match TcpStream::connect_timeout(&addr, timeout) {
            Ok(stream) => {
                let configure = stream
                    .set_read_timeout(Some(timeout))
                    .and_then(|_| stream.set_write_timeout(Some(timeout)))
                    .and_then(|_| stream.set_nodelay(true));
                return configure.map(|_| stream).map_err(|e| DataError::from_io(&e));
            }
            Err(e) => last_error = DataError::from_io(&e),
        }
    }
    Err(last_error)
}

fn spawn_heartbeat(shared: Arc<Shared>, interval: Duration) -> Heartbeat {
    let (stop, rx) = mpsc::channel::<()>();
    let handle = std::thread::spawn(move || loop {
        match rx.recv_timeout(interval) {
            Err(RecvTimeoutError::Timeout) => {}
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
        }
        let Ok(mut conn) = shared.conn.lock() else {
            break;
        };
        if conn.last_used.elapsed() < interval {
            continue;
        }
        if let Err(e) = conn.call(Command::Heartbeat, &[]) {
            debug!(error = %e, "heartbeat failed");
            shared.broken.store(true, Ordering::SeqCst);
            break;
        }
    });
    Heartbeat { stop, handle }
}
