//! Error mapping guide:
//! - Framing problems are `ProtocolError`; everything a single session can fail with is
//!   `StreamError`.
//! - `NailgunError` is what callers of the client and executor see; it names the
//!   server address when a connection is involved.
//! - Map a missing executable to exit code 127, cancellation to 130, everything else to 1.
use std::io;
use std::time::Duration;

use thiserror::Error;

use crate::protocol::ChunkType;

/// Map an io::Error to a process exit code:
/// - 127 for NotFound (command not found)
/// - 1 for all other errors
pub fn exit_code_for_io_error(e: &io::Error) -> u8 {
    if e.kind() == io::ErrorKind::NotFound {
        127
    } else {
        1
    }
}

/// Errors in the framing of the Nailgun protocol itself.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("invalid chunk type: {0:#04x}")]
    InvalidChunkType(u8),

    #[error("failed to read nailgun chunk {what}: expected {expected} bytes before socket shutdown, instead received {received}")]
    Truncated {
        what: &'static str,
        expected: usize,
        received: usize,
    },

    #[error("received unexpected chunk {chunk_type} -> {payload:?}")]
    UnexpectedChunk {
        chunk_type: ChunkType,
        payload: String,
    },

    #[error("received non-request chunk {0} before header was fully received")]
    IncompleteRequest(ChunkType),

    #[error("malformed environment chunk (missing '='): {0:?}")]
    MalformedEnvironment(String),

    #[error("exit chunk payload is not an integer: {0:?}")]
    InvalidExitCode(String),

    #[error("chunk payload of {0} bytes does not fit the 4-byte length prefix")]
    PayloadTooLarge(usize),
}

/// Raised by the chunk reader when an armed deadline passes before the next chunk arrives.
#[derive(Debug, Error)]
#[error("iterating over bytes from nailgun timed out (overtime: {overtime:?})")]
pub struct ProcessStreamTimeout {
    pub overtime: Duration,
}

/// Everything a single request/response exchange can fail with.
#[derive(Debug, Error)]
pub enum StreamError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("transport error: {0}")]
    Transport(#[from] io::Error),

    #[error(transparent)]
    Timeout(#[from] ProcessStreamTimeout),

    /// Caller-supplied reason armed through `set_exit_timeout`; always surfaced after cleanup.
    #[error("{0}")]
    Cancelled(String),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EndpointParseError {
    #[error("expected 4 ':'-separated fields (exe:fingerprint:pid:port), got {0} in {1:?}")]
    FieldCount(usize, String),

    #[error("invalid {field} {value:?} in endpoint {raw:?}: must be a positive integer")]
    InvalidNumber {
        field: &'static str,
        value: String,
        raw: String,
    },
}

/// Errors surfaced by `NailgunClient` and `NailgunExecutor`.
#[derive(Debug, Error)]
pub enum NailgunError {
    #[error("problem connecting to nailgun server at {address}: {source}")]
    Connection {
        address: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to determine the working directory for the nailgun run: {source}")]
    WorkingDirectory {
        #[source]
        source: io::Error,
    },

    #[error("problem executing command on nailgun server at {address}: {source}")]
    Execution {
        address: String,
        #[source]
        source: StreamError,
    },

    #[error("nailgun run at {address} was cancelled: {reason}")]
    Cancelled { address: String, reason: String },

    #[error("failed to spawn nailgun server {command:?}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },

    #[error("nailgun server failed to start: {message}\nstartup log:\n{log}")]
    Startup { message: String, log: String },

    #[error("failed to inspect the process table: {0}")]
    ProcessTable(#[source] io::Error),

    #[error("failed to take the nailgun spawn lock at {path}: {source}")]
    Lock {
        path: String,
        #[source]
        source: io::Error,
    },
}

/// Convert NailgunError to a process exit code (parity with io::Error mapping).
pub fn exit_code_for_nailgun_error(e: &NailgunError) -> u8 {
    match e {
        NailgunError::Spawn { source, .. } => exit_code_for_io_error(source),
        NailgunError::Cancelled { .. } => 130,
        _ => 1,
    }
}
