//! Binary wire format spoken between the engine and `brood-helper`
//!
//! Every request on a subchannel is a fixed 8-byte header followed by a
//! payload:
//!
//! ```text
//! +----------------+----------------+=================+
//! | command: u32   | payload_len:u32|  payload bytes  |
//! +----------------+----------------+=================+
//! ```
//!
//! The header travels in its own `sendmsg` together with any descriptors
//! (SCM_RIGHTS); the payload follows in a second write without descriptors.
//! The reply is always `(error: i32, pid: i32)`.
//!
//! The main channel carries 16-byte exit notifications from the helper and
//! 4-byte "new subchannel" messages (plus one descriptor) from the engine.
//!
//! All integers are native-endian: both peers always run on the same host.

use crate::{IpcError, Result};

/// Hello sent by the helper right after it connects back
pub const HELPER_HELLO: [u8; 4] = [0x62, 0x72, 0x64, 0x01];

/// Size of a request header
pub const HEADER_LEN: usize = 8;

/// Size of a reply
pub const RESPONSE_LEN: usize = 8;

/// Size of one exit notification record
pub const NOTIFICATION_LEN: usize = 16;

/// Size of a main-channel control message
pub const MAIN_MESSAGE_LEN: usize = 4;

/// Main-channel tag announcing a new subchannel descriptor
pub const MAIN_ADD_SUBCHANNEL: u32 = 0;

/// Largest payload the helper accepts
pub const MAX_PAYLOAD_LEN: usize = 1024 * 1024;

/// Number of descriptors attached to a spawn request (stdin, stdout, stderr)
pub const STDIO_FD_COUNT: usize = 3;

/// Spawn flag: start the child in a new session so it can be signalled
/// as a group without touching the caller's terminal
pub const SPAWN_FLAG_NEW_SESSION: u32 = 1 << 0;

/// Reply error: the request could not be decoded
pub const ERR_MALFORMED_REQUEST: i32 = -1;
/// Reply error: the payload exceeds [`MAX_PAYLOAD_LEN`]
pub const ERR_OVERSIZED_REQUEST: i32 = -2;
/// Reply error: unknown command tag
pub const ERR_UNKNOWN_COMMAND: i32 = -3;
/// Reply error: wrong number of descriptors attached
pub const ERR_BAD_DESCRIPTORS: i32 = -4;

/// Request command tags
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Command {
    /// Create a process
    SpawnProcess = 0,
    /// Deliver a signal to a previously created process
    SignalProcess = 1,
    /// Forget the process group recorded for a token
    ReleaseProcess = 2,
}

impl Command {
    /// Parse a raw command tag
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            0 => Some(Command::SpawnProcess),
            1 => Some(Command::SignalProcess),
            2 => Some(Command::ReleaseProcess),
            _ => None,
        }
    }
}

/// Fixed request header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Raw command tag; see [`Command`]
    pub command: u32,
    /// Number of payload bytes following the header
    pub payload_len: u32,
}

impl Header {
    /// Header for `command` with a payload of `payload_len` bytes
    pub fn new(command: Command, payload_len: usize) -> Result<Self> {
        if payload_len > MAX_PAYLOAD_LEN {
            return Err(IpcError::ProtocolError(format!(
                "Request payload of {payload_len} bytes exceeds maximum of {MAX_PAYLOAD_LEN} bytes"
            )));
        }
        Ok(Self {
            command: command as u32,
            payload_len: payload_len as u32,
        })
    }

    /// Encode to wire bytes
    pub fn to_bytes(self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        out[..4].copy_from_slice(&self.command.to_ne_bytes());
        out[4..].copy_from_slice(&self.payload_len.to_ne_bytes());
        out
    }

    /// Decode from wire bytes
    pub fn from_bytes(bytes: [u8; HEADER_LEN]) -> Self {
        Self {
            command: u32::from_ne_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            payload_len: u32::from_ne_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
        }
    }
}

/// Payload of a [`Command::SpawnProcess`] request.
///
/// Strings are raw bytes without NUL; the encoder appends the terminator.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SpawnRequest {
    /// Correlation token for the exit notification
    pub token: u64,
    /// `SPAWN_FLAG_*` bits
    pub flags: u32,
    /// Working directory, `None` to inherit the helper's
    pub working_directory: Option<Vec<u8>>,
    /// Resolved executable path
    pub file_name: Vec<u8>,
    /// Full argument vector including `argv[0]`
    pub argv: Vec<Vec<u8>>,
    /// `name=value` environment entries
    pub env: Vec<Vec<u8>>,
}

impl SpawnRequest {
    /// Encode the payload
    ///
    /// # Errors
    ///
    /// Returns a protocol error if a string contains an interior NUL or the
    /// payload would exceed [`MAX_PAYLOAD_LEN`].
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut w = Writer::default();
        w.put_u64(self.token);
        w.put_u32(self.flags);
        w.put_str(self.working_directory.as_deref().unwrap_or_default())?;
        w.put_str(&self.file_name)?;
        w.put_u32(self.argv.len() as u32);
        for arg in &self.argv {
            w.put_str(arg)?;
        }
        w.put_u32(self.env.len() as u32);
        for entry in &self.env {
            w.put_str(entry)?;
        }
        w.finish()
    }

    /// Decode a payload
    pub fn decode(payload: &[u8]) -> Result<Self> {
        let mut r = Reader::new(payload);
        let token = r.get_u64()?;
        let flags = r.get_u32()?;
        let working_directory = Some(r.get_str()?).filter(|d| !d.is_empty());
        let file_name = r.get_str()?;
        let argc = r.get_u32()? as usize;
        let mut argv = Vec::with_capacity(argc.min(1024));
        for _ in 0..argc {
            argv.push(r.get_str()?);
        }
        let envc = r.get_u32()? as usize;
        let mut env = Vec::with_capacity(envc.min(1024));
        for _ in 0..envc {
            env.push(r.get_str()?);
        }
        r.expect_end()?;
        if file_name.is_empty() {
            return Err(IpcError::ProtocolError("empty executable path".to_string()));
        }
        Ok(Self {
            token,
            flags,
            working_directory,
            file_name,
            argv,
            env,
        })
    }
}

/// Payload of a [`Command::SignalProcess`] request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignalRequest {
    /// Token of the target process
    pub token: u64,
    /// Wire value of a [`schema::Signal`]
    pub signal: u32,
}

impl SignalRequest {
    /// Encoded payload length
    pub const LEN: usize = 12;

    /// Encode the payload
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::LEN);
        out.extend_from_slice(&self.token.to_ne_bytes());
        out.extend_from_slice(&self.signal.to_ne_bytes());
        out
    }

    /// Decode a payload
    pub fn decode(payload: &[u8]) -> Result<Self> {
        let mut r = Reader::new(payload);
        let token = r.get_u64()?;
        let signal = r.get_u32()?;
        r.expect_end()?;
        Ok(Self { token, signal })
    }
}

/// Payload of a [`Command::ReleaseProcess`] request
///
/// The helper keeps signalling a token's process group after the lead
/// process exits, until the engine releases the token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReleaseRequest {
    /// Token of the released process
    pub token: u64,
}

impl ReleaseRequest {
    /// Encoded payload length
    pub const LEN: usize = 8;

    /// Encode the payload
    pub fn encode(&self) -> Vec<u8> {
        self.token.to_ne_bytes().to_vec()
    }

    /// Decode a payload
    pub fn decode(payload: &[u8]) -> Result<Self> {
        let mut r = Reader::new(payload);
        let token = r.get_u64()?;
        r.expect_end()?;
        Ok(Self { token })
    }
}

/// Reply to any request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Response {
    /// `0` success, `> 0` native errno, `< 0` protocol error
    pub error: i32,
    /// Process id on a successful spawn, otherwise 0
    pub pid: i32,
}

impl Response {
    /// Successful reply
    pub fn ok(pid: i32) -> Self {
        Self { error: 0, pid }
    }

    /// Failed reply
    pub fn err(error: i32) -> Self {
        Self { error, pid: 0 }
    }

    /// Encode to wire bytes
    pub fn to_bytes(self) -> [u8; RESPONSE_LEN] {
        let mut out = [0u8; RESPONSE_LEN];
        out[..4].copy_from_slice(&self.error.to_ne_bytes());
        out[4..].copy_from_slice(&self.pid.to_ne_bytes());
        out
    }

    /// Decode from wire bytes
    pub fn from_bytes(bytes: [u8; RESPONSE_LEN]) -> Self {
        Self {
            error: i32::from_ne_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            pid: i32::from_ne_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
        }
    }

    /// Interpret the error word
    pub fn into_result(self) -> Result<i32> {
        match self.error {
            0 => Ok(self.pid),
            errno if errno > 0 => Err(IpcError::native(errno)),
            code => Err(IpcError::ProtocolError(format!(
                "helper rejected request with code {code}"
            ))),
        }
    }
}

/// One exit notification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitNotification {
    /// Token of the process that exited
    pub token: u64,
    /// Its process id
    pub pid: i32,
    /// Exit code, or `128 + signal` when killed by a signal
    pub status: i32,
}

impl ExitNotification {
    /// Encode to wire bytes
    pub fn to_bytes(self) -> [u8; NOTIFICATION_LEN] {
        let mut out = [0u8; NOTIFICATION_LEN];
        out[..8].copy_from_slice(&(self.token as i64).to_ne_bytes());
        out[8..12].copy_from_slice(&self.pid.to_ne_bytes());
        out[12..].copy_from_slice(&self.status.to_ne_bytes());
        out
    }

    /// Decode from exactly [`NOTIFICATION_LEN`] bytes
    pub fn from_bytes(bytes: &[u8; NOTIFICATION_LEN]) -> Self {
        let mut token = [0u8; 8];
        token.copy_from_slice(&bytes[..8]);
        Self {
            token: i64::from_ne_bytes(token) as u64,
            pid: i32::from_ne_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]),
            status: i32::from_ne_bytes([bytes[12], bytes[13], bytes[14], bytes[15]]),
        }
    }
}

/// Splits a byte stream into exit notifications.
///
/// Reads from a socket do not respect record boundaries; a trailing partial
/// record is kept and completed by the next [`feed`](Self::feed).
#[derive(Debug, Default)]
pub struct NotificationDecoder {
    pending: Vec<u8>,
}

impl NotificationDecoder {
    /// Create an empty decoder
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed newly read bytes, returning every record completed by them
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<ExitNotification> {
        self.pending.extend_from_slice(bytes);
        let complete = self.pending.len() / NOTIFICATION_LEN * NOTIFICATION_LEN;
        let records = self.pending[..complete]
            .chunks_exact(NOTIFICATION_LEN)
            .map(|chunk| {
                let mut record = [0u8; NOTIFICATION_LEN];
                record.copy_from_slice(chunk);
                ExitNotification::from_bytes(&record)
            })
            .collect();
        self.pending.drain(..complete);
        records
    }

    /// Bytes of an incomplete record carried over to the next read
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

#[derive(Default)]
struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    fn put_u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_ne_bytes());
    }

    fn put_u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_ne_bytes());
    }

    // u32 length including the terminator, bytes, NUL. Empty is a bare 0.
    fn put_str(&mut self, s: &[u8]) -> Result<()> {
        if s.contains(&0) {
            return Err(IpcError::ProtocolError(
                "string contains an interior NUL byte".to_string(),
            ));
        }
        if s.is_empty() {
            self.put_u32(0);
            return Ok(());
        }
        self.put_u32(s.len() as u32 + 1);
        self.buf.extend_from_slice(s);
        self.buf.push(0);
        Ok(())
    }

    fn finish(self) -> Result<Vec<u8>> {
        if self.buf.len() > MAX_PAYLOAD_LEN {
            return Err(IpcError::ProtocolError(format!(
                "Request payload of {} bytes exceeds maximum of {MAX_PAYLOAD_LEN} bytes",
                self.buf.len()
            )));
        }
        Ok(self.buf)
    }
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|end| *end <= self.buf.len())
            .ok_or_else(|| IpcError::ProtocolError("truncated payload".to_string()))?;
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn get_u32(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_ne_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn get_u64(&mut self) -> Result<u64> {
        let b = self.take(8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(b);
        Ok(u64::from_ne_bytes(raw))
    }

    fn get_str(&mut self) -> Result<Vec<u8>> {
        let len = self.get_u32()? as usize;
        if len == 0 {
            return Ok(Vec::new());
        }
        let raw = self.take(len)?;
        match raw.split_last() {
            Some((0, body)) if !body.contains(&0) => Ok(body.to_vec()),
            _ => Err(IpcError::ProtocolError(
                "string is not NUL-terminated".to_string(),
            )),
        }
    }

    fn expect_end(&self) -> Result<()> {
        if self.pos == self.buf.len() {
            Ok(())
        } else {
            Err(IpcError::ProtocolError(format!(
                "{} trailing bytes after payload",
                self.buf.len() - self.pos
            )))
        }
    }
}
