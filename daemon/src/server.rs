//! Main channel and subchannel handling
//!
//! The main channel only carries new subchannels (client to helper) and exit
//! notifications (helper to client). Every subchannel gets its own thread
//! serving one request at a time:
//!
//! ```text
//! client                                helper
//!   header (8 bytes) + stdio fds  ──►
//!   payload                       ──►
//!                                 ◄──   response (error, pid)
//! ```

use crate::children::ChildTable;
use crate::{reaper, HelperError, Result};
use brood_core::process::exec::{ChildSetup, PreparedCommand, SessionMode};
use brood_core::process::platform::is_wsl1;
use ipc::fdpass::recv_exact_with_fds;
use ipc::wire::{
    Command, Header, ReleaseRequest, Response, SignalRequest, SpawnRequest,
    ERR_BAD_DESCRIPTORS, ERR_MALFORMED_REQUEST, ERR_OVERSIZED_REQUEST, ERR_UNKNOWN_COMMAND,
    HEADER_LEN, HELPER_HELLO, MAIN_ADD_SUBCHANNEL, MAIN_MESSAGE_LEN, MAX_PAYLOAD_LEN,
    SPAWN_FLAG_NEW_SESSION, STDIO_FD_COUNT,
};
use nix::errno::Errno;
use nix::sys::signal::{killpg, Signal as NixSignal};
use nix::unistd::Pid;
use schema::Signal;
use std::io::{self, Write};
use std::os::fd::{AsFd, AsRawFd, OwnedFd};
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Connect to the client at `socket_path` and serve it until it goes away
pub fn run(socket_path: &Path) -> Result<()> {
    let mut main = UnixStream::connect(socket_path).map_err(|e| {
        HelperError::ConnectionError(format!("connecting to {}: {e}", socket_path.display()))
    })?;
    main.write_all(&HELPER_HELLO)?;
    info!("Connected to {}", socket_path.display());

    let table = Arc::new(ChildTable::default());
    let notifier = main.try_clone()?;
    let reaper_table = Arc::clone(&table);
    std::thread::Builder::new()
        .name("reaper".to_string())
        .spawn(move || {
            if let Err(e) = reaper::run(reaper_table, notifier) {
                warn!("Reaper stopped: {}", e);
            }
        })?;

    serve_main(&main, &table)
}

/// Receive subchannels until the main channel reaches EOF
fn serve_main(main: &UnixStream, table: &Arc<ChildTable>) -> Result<()> {
    let mut next_id = 0usize;
    loop {
        let mut tag = [0u8; MAIN_MESSAGE_LEN];
        let fds = match recv_exact_with_fds(main.as_fd(), &mut tag) {
            Ok(fds) => fds,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                info!("Main channel closed, exiting");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };
        let tag = u32::from_ne_bytes(tag);
        if tag != MAIN_ADD_SUBCHANNEL {
            return Err(HelperError::ProtocolError(format!(
                "unknown main channel message {tag}"
            )));
        }

        let mut fds = fds.into_iter();
        let Some(fd) = fds.next() else {
            return Err(HelperError::ProtocolError(
                "new subchannel message without a descriptor".to_string(),
            ));
        };
        let extra = fds.count();
        if extra > 0 {
            warn!("Closed {} unexpected descriptors on the main channel", extra);
        }

        let id = next_id;
        next_id += 1;
        let stream = UnixStream::from(fd);
        let table = Arc::clone(table);
        std::thread::Builder::new()
            .name(format!("subchannel-{id}"))
            .spawn(move || match serve_subchannel(stream, &table) {
                Ok(()) => debug!("Subchannel {} closed", id),
                Err(e) => warn!("Subchannel {} failed: {}", id, e),
            })?;
        debug!("Subchannel {} opened", id);
    }
}

/// Serve requests on one subchannel until the client closes it
pub fn serve_subchannel(mut stream: UnixStream, table: &ChildTable) -> Result<()> {
    loop {
        let mut header = [0u8; HEADER_LEN];
        let stdio = match recv_exact_with_fds(stream.as_fd(), &mut header) {
            Ok(fds) => fds,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        let header = Header::from_bytes(header);

        let payload_len = header.payload_len as usize;
        if payload_len > MAX_PAYLOAD_LEN {
            // The payload cannot be skipped safely; give up on the channel
            stream.write_all(&Response::err(ERR_OVERSIZED_REQUEST).to_bytes())?;
            return Err(HelperError::ProtocolError(format!(
                "payload of {payload_len} bytes exceeds {MAX_PAYLOAD_LEN}"
            )));
        }

        let mut payload = vec![0u8; payload_len];
        let late_fds = recv_exact_with_fds(stream.as_fd(), &mut payload)?;
        let response = if late_fds.is_empty() {
            handle_request(header, stdio, &payload, table)
        } else if is_wsl1() {
            // WSL1 re-delivers descriptors already received with the header
            debug!("Dropping {} duplicated descriptors", late_fds.len());
            drop(late_fds);
            handle_request(header, stdio, &payload, table)
        } else {
            warn!(
                "{} descriptors arrived with the payload instead of the header",
                late_fds.len()
            );
            Response::err(ERR_BAD_DESCRIPTORS)
        };
        stream.write_all(&response.to_bytes())?;
    }
}

/// Execute one decoded request
pub fn handle_request(
    header: Header,
    fds: Vec<OwnedFd>,
    payload: &[u8],
    table: &ChildTable,
) -> Response {
    match Command::from_u32(header.command) {
        Some(Command::SpawnProcess) => {
            let Ok(stdio) = <[OwnedFd; STDIO_FD_COUNT]>::try_from(fds) else {
                return Response::err(ERR_BAD_DESCRIPTORS);
            };
            match SpawnRequest::decode(payload) {
                Ok(request) => spawn(&request, &stdio, table),
                Err(e) => {
                    warn!("Malformed spawn request: {}", e);
                    Response::err(ERR_MALFORMED_REQUEST)
                }
            }
        }
        Some(Command::SignalProcess) => {
            if !fds.is_empty() {
                return Response::err(ERR_BAD_DESCRIPTORS);
            }
            match SignalRequest::decode(payload) {
                Ok(request) => signal(request, table),
                Err(e) => {
                    warn!("Malformed signal request: {}", e);
                    Response::err(ERR_MALFORMED_REQUEST)
                }
            }
        }
        Some(Command::ReleaseProcess) => {
            if !fds.is_empty() {
                return Response::err(ERR_BAD_DESCRIPTORS);
            }
            match ReleaseRequest::decode(payload) {
                Ok(request) => {
                    let pid = table.release(request.token);
                    debug!("Released token {} (group {:?})", request.token, pid);
                    Response::ok(pid.unwrap_or(0))
                }
                Err(e) => {
                    warn!("Malformed release request: {}", e);
                    Response::err(ERR_MALFORMED_REQUEST)
                }
            }
        }
        None => {
            warn!("Unknown command {}", header.command);
            Response::err(ERR_UNKNOWN_COMMAND)
        }
    }
}

fn spawn(request: &SpawnRequest, stdio: &[OwnedFd; STDIO_FD_COUNT], table: &ChildTable) -> Response {
    let command = match PreparedCommand::new(
        &request.file_name,
        request.argv.iter().cloned(),
        request.env.iter().cloned(),
        request.working_directory.as_deref(),
    ) {
        Ok(command) => command,
        Err(errno) => return Response::err(errno as i32),
    };
    let setup = ChildSetup {
        stdio: [
            stdio[0].as_raw_fd(),
            stdio[1].as_raw_fd(),
            stdio[2].as_raw_fd(),
        ],
        session: if request.flags & SPAWN_FLAG_NEW_SESSION != 0 {
            SessionMode::NewSession
        } else {
            SessionMode::NewProcessGroup
        },
        close_after_dup: Vec::new(),
    };
    match table.spawn(request.token, &command, &setup) {
        Ok(pid) => Response::ok(pid),
        Err(errno) => {
            debug!(
                "Spawning {:?} failed: {}",
                String::from_utf8_lossy(&request.file_name),
                errno
            );
            Response::err(errno as i32)
        }
    }
}

fn signal(request: SignalRequest, table: &ChildTable) -> Response {
    let signal = match Signal::from_u32(request.signal) {
        Some(Signal::Interrupt) => NixSignal::SIGINT,
        Some(Signal::Termination) => NixSignal::SIGTERM,
        Some(Signal::Kill) => NixSignal::SIGKILL,
        None => return Response::err(ERR_MALFORMED_REQUEST),
    };
    let Some(pid) = table.pid_of(request.token) else {
        // Released, or reaped with nothing left in its group
        debug!("Signal for finished token {}", request.token);
        return Response::ok(0);
    };
    match killpg(Pid::from_raw(pid), signal) {
        Ok(()) | Err(Errno::ESRCH) => {
            debug!("Sent {} to process group {}", signal, pid);
            Response::ok(pid)
        }
        Err(e) => {
            warn!("Failed to send {} to process group {}: {}", signal, pid, e);
            Response::err(e as i32)
        }
    }
}
