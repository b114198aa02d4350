//! Client side of the helper protocol
//!
//! [`HelperClient::launch`] starts `brood-helper`, waits for it to connect
//! back to a private socket and validates its hello. The resulting
//! connection is the *main channel*:
//!
//! - helper → engine: a continuous stream of exit notifications, consumed by
//!   one background reader thread ([`HelperClient::start_notification_reader`])
//! - engine → helper: "new subchannel" messages carrying one socket each
//!
//! Requests (spawn, signal) never travel on the main channel. Each one
//! leases a *subchannel* (one end of a socket pair whose other end was handed
//! to the helper) from a bounded pool, performs a single request/response
//! exchange and returns the lease.
//!
//! Pooled subchannels are kept as plain std sockets and only registered with
//! the tokio reactor for the duration of a lease, so the client is not tied
//! to the runtime that happened to create it.

use crate::fdpass;
use crate::wire::{
    Command, ExitNotification, Header, NotificationDecoder, ReleaseRequest, Response,
    SignalRequest, SpawnRequest, HELPER_HELLO, MAIN_ADD_SUBCHANNEL, RESPONSE_LEN, STDIO_FD_COUNT,
};
use crate::{IpcError, Result};
use std::io::{self, Read};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, RawFd};
use std::os::unix::net::{UnixListener, UnixStream as StdUnixStream};
use std::path::{Path, PathBuf};
use std::process::{Child, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt, Interest};
use tokio::net::UnixStream;
use tokio::sync::{Semaphore, SemaphorePermit};
use tracing::{debug, error, info, warn};

/// Receives exit notifications from the background reader
pub trait ExitSink: Send + Sync {
    /// A child of the helper exited
    fn on_exit(&self, notification: ExitNotification);

    /// The main channel closed; no further notifications will arrive
    fn on_helper_lost(&self);
}

/// Settings for launching the helper
#[derive(Debug, Clone)]
pub struct HelperConfig {
    /// Path of the `brood-helper` executable
    pub helper_path: PathBuf,
    /// Maximum number of concurrently leased subchannels
    pub max_subchannels: usize,
    /// How long to wait for the helper to connect and say hello
    pub handshake_timeout: Duration,
}

impl HelperConfig {
    /// Defaults for `helper_path`: pool size from available parallelism and
    /// a five second handshake timeout
    pub fn new(helper_path: impl Into<PathBuf>) -> Self {
        Self {
            helper_path: helper_path.into(),
            max_subchannels: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            handshake_timeout: Duration::from_secs(5),
        }
    }
}

/// Connection to a running helper process
#[derive(Debug)]
pub struct HelperClient {
    main_writer: Mutex<StdUnixStream>,
    main_reader: Mutex<Option<StdUnixStream>>,
    pool: SubchannelPool,
    crashed: Arc<AtomicBool>,
    closing: Arc<AtomicBool>,
    helper: Mutex<Child>,
}

impl HelperClient {
    /// Launch the helper and complete the handshake
    ///
    /// # Errors
    ///
    /// Returns `LaunchFailed` if the helper cannot be started,
    /// `HelperCrashed` if it exits before connecting, `Timeout` if it does
    /// not connect in time and `HandshakeFailed` on a bad hello.
    pub fn launch(config: &HelperConfig) -> Result<Self> {
        if config.max_subchannels == 0 {
            return Err(IpcError::LaunchFailed(
                "max_subchannels must be greater than 0".to_string(),
            ));
        }

        let socket_path = std::env::temp_dir().join(format!(
            "brood-{}-{}.sock",
            std::process::id(),
            uuid::Uuid::new_v4().simple()
        ));
        let listener = UnixListener::bind(&socket_path).map_err(|e| {
            IpcError::ConnectionFailed(format!("Failed to bind {:?}: {}", socket_path, e))
        })?;
        let _cleanup = SocketFileGuard(&socket_path);

        debug!("Launching helper {:?}", config.helper_path);
        let mut helper = std::process::Command::new(&config.helper_path)
            .arg(&socket_path)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .spawn()
            .map_err(|e| {
                IpcError::LaunchFailed(format!(
                    "Failed to start {:?}: {}",
                    config.helper_path, e
                ))
            })?;

        let stream = match accept_with_deadline(&listener, &mut helper, config.handshake_timeout)
            .and_then(|stream| handshake(stream, config.handshake_timeout))
        {
            Ok(stream) => stream,
            Err(e) => {
                let _ = helper.kill();
                let _ = helper.wait();
                return Err(e);
            }
        };

        let main_writer = stream
            .try_clone()
            .map_err(|e| IpcError::ConnectionFailed(e.to_string()))?;
        info!(
            "Helper {} connected ({} subchannels)",
            helper.id(),
            config.max_subchannels
        );

        Ok(Self {
            main_writer: Mutex::new(main_writer),
            main_reader: Mutex::new(Some(stream)),
            pool: SubchannelPool::new(config.max_subchannels),
            crashed: Arc::new(AtomicBool::new(false)),
            closing: Arc::new(AtomicBool::new(false)),
            helper: Mutex::new(helper),
        })
    }

    /// Process id of the helper
    pub fn helper_pid(&self) -> u32 {
        lock(&self.helper).id()
    }

    /// Whether the helper has been observed dead
    pub fn is_crashed(&self) -> bool {
        self.crashed.load(Ordering::SeqCst)
    }

    /// Maximum number of concurrently leased subchannels
    pub fn max_subchannels(&self) -> usize {
        self.pool.capacity
    }

    /// Start the dedicated thread that reads exit notifications off the main
    /// channel and forwards them to `sink`. Can only be called once.
    pub fn start_notification_reader(&self, sink: Arc<dyn ExitSink>) -> Result<()> {
        let reader = lock(&self.main_reader)
            .take()
            .ok_or_else(|| IpcError::ProtocolError("notification reader already started".into()))?;
        let crashed = Arc::clone(&self.crashed);
        let closing = Arc::clone(&self.closing);

        std::thread::Builder::new()
            .name("brood-exit-reader".to_string())
            .spawn(move || read_notifications(reader, sink, crashed, closing))
            .map_err(|e| IpcError::LaunchFailed(format!("Failed to start reader thread: {e}")))?;
        Ok(())
    }

    /// Ask the helper to create a process.
    ///
    /// `stdio` are the child's stdin, stdout and stderr; they are duplicated
    /// into the helper and remain owned by the caller.
    ///
    /// Returns the child's pid.
    pub async fn spawn(&self, request: &SpawnRequest, stdio: [BorrowedFd<'_>; STDIO_FD_COUNT]) -> Result<i32> {
        let payload = request.encode()?;
        let header = Header::new(Command::SpawnProcess, payload.len())?;
        let fds: [RawFd; STDIO_FD_COUNT] = stdio.map(|fd| fd.as_raw_fd());

        let response = self.exchange(header, &fds, &payload).await?;
        let pid = response.into_result()?;
        debug!("Helper spawned token {} as pid {}", request.token, pid);
        Ok(pid)
    }

    /// Ask the helper to deliver a signal to the process created for `token`
    pub async fn signal(&self, token: u64, signal: schema::Signal) -> Result<()> {
        let payload = SignalRequest {
            token,
            signal: signal.as_u32(),
        }
        .encode();
        let header = Header::new(Command::SignalProcess, payload.len())?;
        let response = self.exchange(header, &[], &payload).await?;
        response.into_result().map(|_| ())
    }

    /// Tell the helper it may forget `token`; later signals for it are no-ops
    pub async fn release(&self, token: u64) -> Result<()> {
        let payload = ReleaseRequest { token }.encode();
        let header = Header::new(Command::ReleaseProcess, payload.len())?;
        let response = self.exchange(header, &[], &payload).await?;
        response.into_result().map(|_| ())
    }

    async fn exchange(&self, header: Header, fds: &[RawFd], payload: &[u8]) -> Result<Response> {
        if self.is_crashed() {
            return Err(IpcError::HelperCrashed("helper is no longer running".into()));
        }
        let mut lease = self.pool.acquire(self).await?;
        let result = lease.round_trip(header, fds, payload).await;
        match &result {
            Ok(_) => lease.release(),
            Err(e) => {
                if e.is_helper_crashed() {
                    self.crashed.store(true, Ordering::SeqCst);
                }
                // Never return a subchannel in an unknown state to the pool
                warn!("Discarding subchannel after error: {}", e);
            }
        }
        result
    }

    fn open_subchannel(&self) -> Result<StdUnixStream> {
        let (local, remote) = StdUnixStream::pair()
            .map_err(|e| IpcError::ConnectionFailed(format!("socketpair failed: {e}")))?;
        let writer = lock(&self.main_writer);
        let sent = fdpass::send_with_fds(
            writer.as_fd(),
            &MAIN_ADD_SUBCHANNEL.to_ne_bytes(),
            &[remote.as_raw_fd()],
        )
        .map_err(|e| classify_io("new subchannel", e))?;
        if sent != MAIN_ADD_SUBCHANNEL.to_ne_bytes().len() {
            return Err(IpcError::SendFailed("short write on main channel".into()));
        }
        // The helper now holds its own copy; ours must go so that the
        // helper's death shows up as EOF on `local`
        drop(remote);
        Ok(local)
    }
}

impl Drop for HelperClient {
    fn drop(&mut self) {
        self.closing.store(true, Ordering::SeqCst);
        // Closing the main channel makes the helper exit
        if let Ok(writer) = self.main_writer.lock() {
            let _ = writer.shutdown(std::net::Shutdown::Both);
        }
        if let Ok(mut helper) = self.helper.lock() {
            let _ = helper.wait();
        }
    }
}

fn read_notifications(
    mut reader: StdUnixStream,
    sink: Arc<dyn ExitSink>,
    crashed: Arc<AtomicBool>,
    closing: Arc<AtomicBool>,
) {
    let mut decoder = NotificationDecoder::new();
    let mut buf = [0u8; 4096];
    loop {
        match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                for notification in decoder.feed(&buf[..n]) {
                    sink.on_exit(notification);
                }
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                debug!("Main channel read failed: {}", e);
                break;
            }
        }
    }

    crashed.store(true, Ordering::SeqCst);
    if closing.load(Ordering::SeqCst) {
        debug!("Helper main channel closed");
    } else {
        error!("Helper main channel closed unexpectedly; helper is gone");
    }
    sink.on_helper_lost();
}

fn accept_with_deadline(
    listener: &UnixListener,
    helper: &mut Child,
    timeout: Duration,
) -> Result<StdUnixStream> {
    listener
        .set_nonblocking(true)
        .map_err(|e| IpcError::ConnectionFailed(e.to_string()))?;
    let deadline = Instant::now() + timeout;
    loop {
        match listener.accept() {
            Ok((stream, _)) => {
                stream
                    .set_nonblocking(false)
                    .map_err(|e| IpcError::ConnectionFailed(e.to_string()))?;
                return Ok(stream);
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => return Err(IpcError::ConnectionFailed(e.to_string())),
        }
        if let Ok(Some(status)) = helper.try_wait() {
            return Err(IpcError::HelperCrashed(format!(
                "helper exited before connecting: {status}"
            )));
        }
        if Instant::now() >= deadline {
            return Err(IpcError::Timeout(format!(
                "helper did not connect within {timeout:?}"
            )));
        }
        std::thread::sleep(Duration::from_millis(5));
    }
}

fn handshake(mut stream: StdUnixStream, timeout: Duration) -> Result<StdUnixStream> {
    stream
        .set_read_timeout(Some(timeout))
        .map_err(|e| IpcError::ConnectionFailed(e.to_string()))?;
    let mut hello = [0u8; HELPER_HELLO.len()];
    stream.read_exact(&mut hello).map_err(|e| match e.kind() {
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => {
            IpcError::Timeout("helper did not send hello".into())
        }
        _ => IpcError::HandshakeFailed(e.to_string()),
    })?;
    if hello != HELPER_HELLO {
        return Err(IpcError::HandshakeFailed(format!(
            "unexpected hello {hello:02x?}"
        )));
    }
    stream
        .set_read_timeout(None)
        .map_err(|e| IpcError::ConnectionFailed(e.to_string()))?;
    Ok(stream)
}

/// Bounded pool of idle subchannels
#[derive(Debug)]
struct SubchannelPool {
    permits: Semaphore,
    idle: Mutex<Vec<StdUnixStream>>,
    capacity: usize,
}

impl SubchannelPool {
    fn new(capacity: usize) -> Self {
        Self {
            permits: Semaphore::new(capacity),
            idle: Mutex::new(Vec::with_capacity(capacity)),
            capacity,
        }
    }

    /// Wait (without spinning) for a free slot, then reuse an idle
    /// subchannel or open a new one
    async fn acquire<'a>(&'a self, client: &HelperClient) -> Result<SubchannelLease<'a>> {
        let permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| IpcError::ProtocolError("subchannel pool closed".into()))?;
        let idle = lock(&self.idle).pop();
        let std_stream = match idle {
            Some(stream) => stream,
            None => client.open_subchannel()?,
        };
        std_stream
            .set_nonblocking(true)
            .map_err(|e| IpcError::ConnectionFailed(e.to_string()))?;
        let stream = UnixStream::from_std(std_stream)
            .map_err(|e| IpcError::ConnectionFailed(e.to_string()))?;
        Ok(SubchannelLease {
            stream: Some(stream),
            pool: self,
            _permit: permit,
        })
    }
}

/// Exclusive use of one subchannel for one request/response cycle
struct SubchannelLease<'a> {
    stream: Option<UnixStream>,
    pool: &'a SubchannelPool,
    _permit: SemaphorePermit<'a>,
}

impl SubchannelLease<'_> {
    async fn round_trip(&mut self, header: Header, fds: &[RawFd], payload: &[u8]) -> Result<Response> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| IpcError::ProtocolError("lease already released".into()))?;

        let header_bytes = header.to_bytes();
        let sent = stream
            .async_io(Interest::WRITABLE, || {
                fdpass::send_with_fds(stream.as_fd(), &header_bytes, fds)
            })
            .await
            .map_err(|e| classify_io("request header", e))?;
        if sent != header_bytes.len() {
            return Err(IpcError::SendFailed(format!(
                "short header write ({sent} of {} bytes)",
                header_bytes.len()
            )));
        }

        stream
            .write_all(payload)
            .await
            .map_err(|e| classify_io("request payload", e))?;

        let mut reply = [0u8; RESPONSE_LEN];
        stream
            .read_exact(&mut reply)
            .await
            .map_err(|e| classify_io("response", e))?;
        Ok(Response::from_bytes(reply))
    }

    /// Put the subchannel back into the pool
    fn release(mut self) {
        if let Some(stream) = self.stream.take() {
            match stream.into_std() {
                Ok(std_stream) => lock(&self.pool.idle).push(std_stream),
                Err(e) => warn!("Failed to return subchannel to pool: {}", e),
            }
        }
    }
}

fn classify_io(what: &str, e: io::Error) -> IpcError {
    match e.kind() {
        io::ErrorKind::UnexpectedEof
        | io::ErrorKind::BrokenPipe
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::NotConnected => {
            IpcError::HelperCrashed(format!("{what}: {e}"))
        }
        _ => IpcError::SendFailed(format!("{what}: {e}")),
    }
}

struct SocketFileGuard<'a>(&'a Path);

impl Drop for SocketFileGuard<'_> {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(self.0);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
