/*!
Nailgun wire protocol: chunk framing, request encoding and chunk iteration.

A chunk is a 5-byte header followed by an optional payload:
- bytes 0..4: payload length as a big-endian u32
- byte 4: the chunk type

A connection carries one exchange:
1) client sends zero or more ARGUMENT and ENVIRONMENT chunks, then exactly one
   WORKING_DIR chunk and exactly one COMMAND chunk (the server starts on COMMAND);
2) server may send START_READING_INPUT, after which the client streams STDIN chunks
   and finally one STDIN_EOF;
3) server streams STDOUT/STDERR chunks and ends with exactly one EXIT chunk whose
   payload is the ASCII decimal exit status.
*/
use std::collections::BTreeMap;
use std::fmt;
use std::io::{self, Read, Write};
use std::time::Instant;

use crate::errors::{ProcessStreamTimeout, ProtocolError, StreamError};

pub const HEADER_BYTES: usize = 5;

/// Separator between key and value in ENVIRONMENT chunks.
pub const ENVIRON_SEP: char = '=';

const TTY_PATH_ENV_PREFIX: &str = "NAILGUN_TTY_PATH_";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChunkType {
    Argument,
    Environment,
    WorkingDir,
    Command,
    Stdin,
    Stdout,
    Stderr,
    StartReadingInput,
    StdinEof,
    Exit,
}

impl ChunkType {
    pub const REQUEST_TYPES: [ChunkType; 4] = [
        ChunkType::Argument,
        ChunkType::Environment,
        ChunkType::WorkingDir,
        ChunkType::Command,
    ];

    pub fn as_byte(self) -> u8 {
        match self {
            ChunkType::Argument => b'A',
            ChunkType::Environment => b'E',
            ChunkType::WorkingDir => b'D',
            ChunkType::Command => b'C',
            ChunkType::Stdin => b'0',
            ChunkType::Stdout => b'1',
            ChunkType::Stderr => b'2',
            ChunkType::StartReadingInput => b'S',
            ChunkType::StdinEof => b'.',
            ChunkType::Exit => b'X',
        }
    }

    pub fn from_byte(b: u8) -> Option<ChunkType> {
        let t = match b {
            b'A' => ChunkType::Argument,
            b'E' => ChunkType::Environment,
            b'D' => ChunkType::WorkingDir,
            b'C' => ChunkType::Command,
            b'0' => ChunkType::Stdin,
            b'1' => ChunkType::Stdout,
            b'2' => ChunkType::Stderr,
            b'S' => ChunkType::StartReadingInput,
            b'.' => ChunkType::StdinEof,
            b'X' => ChunkType::Exit,
            _ => return None,
        };
        Some(t)
    }

    pub fn is_request(self) -> bool {
        Self::REQUEST_TYPES.contains(&self)
    }
}

impl fmt::Display for ChunkType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ChunkType::Argument => "ARGUMENT",
            ChunkType::Environment => "ENVIRONMENT",
            ChunkType::WorkingDir => "WORKING_DIR",
            ChunkType::Command => "COMMAND",
            ChunkType::Stdin => "STDIN",
            ChunkType::Stdout => "STDOUT",
            ChunkType::Stderr => "STDERR",
            ChunkType::StartReadingInput => "START_READING_INPUT",
            ChunkType::StdinEof => "STDIN_EOF",
            ChunkType::Exit => "EXIT",
        };
        write!(f, "{name}({:?})", self.as_byte() as char)
    }
}

/// Consulted by the chunk reader before every chunk and on every read-timeout tick.
pub trait TimeoutProvider {
    fn deadline(&self) -> Option<Instant>;
}

/// Never times out.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoTimeout;

impl TimeoutProvider for NoTimeout {
    fn deadline(&self) -> Option<Instant> {
        None
    }
}

/// Build a single chunk (header + payload).
pub fn construct_chunk(chunk_type: ChunkType, payload: &[u8]) -> Result<Vec<u8>, ProtocolError> {
    let len = u32::try_from(payload.len())
        .map_err(|_| ProtocolError::PayloadTooLarge(payload.len()))?;
    let mut chunk = Vec::with_capacity(HEADER_BYTES + payload.len());
    chunk.extend_from_slice(&len.to_be_bytes());
    chunk.push(chunk_type.as_byte());
    chunk.extend_from_slice(payload);
    Ok(chunk)
}

/// Write a single chunk and flush.
pub fn write_chunk<W: Write + ?Sized>(
    w: &mut W,
    chunk_type: ChunkType,
    payload: &[u8],
) -> Result<(), StreamError> {
    let chunk = construct_chunk(chunk_type, payload)?;
    w.write_all(&chunk)?;
    w.flush()?;
    Ok(())
}

/// Send the request phase: arguments, environment, working directory, then command.
pub fn send_request<W: Write + ?Sized>(
    w: &mut W,
    working_dir: &str,
    command: &str,
    arguments: &[String],
    environment: &BTreeMap<String, String>,
) -> Result<(), StreamError> {
    for argument in arguments {
        write_chunk(w, ChunkType::Argument, argument.as_bytes())?;
    }
    for (key, value) in environment {
        let entry = format!("{key}{ENVIRON_SEP}{value}");
        write_chunk(w, ChunkType::Environment, entry.as_bytes())?;
    }
    write_chunk(w, ChunkType::WorkingDir, working_dir.as_bytes())?;
    write_chunk(w, ChunkType::Command, command.as_bytes())?;
    Ok(())
}

fn is_read_timeout(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
    )
}

fn check_deadline<T: TimeoutProvider + ?Sized>(timeout: &T) -> Result<(), StreamError> {
    if let Some(deadline) = timeout.deadline() {
        let now = Instant::now();
        if now >= deadline {
            return Err(ProcessStreamTimeout {
                overtime: now - deadline,
            }
            .into());
        }
    }
    Ok(())
}

/// Fill `buf` completely. Read timeouts on the underlying source are polling ticks: the
/// deadline is re-checked and the read resumes where it left off.
fn read_full<R: Read + ?Sized, T: TimeoutProvider + ?Sized>(
    r: &mut R,
    buf: &mut [u8],
    timeout: &T,
    what: &'static str,
) -> Result<(), StreamError> {
    let mut filled = 0;
    while filled < buf.len() {
        match r.read(&mut buf[filled..]) {
            Ok(0) => {
                return Err(ProtocolError::Truncated {
                    what,
                    expected: buf.len(),
                    received: filled,
                }
                .into())
            }
            Ok(n) => filled += n,
            Err(e) if is_read_timeout(&e) => check_deadline(timeout)?,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

/// Read a single chunk. The chunk type is validated only after the payload has been
/// drained so a bad type never leaves a stale payload in the stream.
pub fn read_chunk<R: Read + ?Sized, T: TimeoutProvider + ?Sized>(
    r: &mut R,
    timeout: &T,
) -> Result<(ChunkType, Vec<u8>), StreamError> {
    check_deadline(timeout)?;

    let mut header = [0u8; HEADER_BYTES];
    read_full(r, &mut header, timeout, "header")?;
    let len = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize;

    let mut payload = vec![0u8; len];
    read_full(r, &mut payload, timeout, "payload")?;

    let chunk_type =
        ChunkType::from_byte(header[4]).ok_or(ProtocolError::InvalidChunkType(header[4]))?;
    Ok((chunk_type, payload))
}

/// Iterator over chunks until (and including) an EXIT chunk, or the first error.
pub struct Chunks<'a, R: ?Sized, T: ?Sized> {
    reader: &'a mut R,
    timeout: &'a T,
    done: bool,
}

impl<R: Read + ?Sized, T: TimeoutProvider + ?Sized> Iterator for Chunks<'_, R, T> {
    type Item = Result<(ChunkType, Vec<u8>), StreamError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let item = read_chunk(&mut *self.reader, self.timeout);
        match &item {
            Ok((ChunkType::Exit, _)) | Err(_) => self.done = true,
            Ok(_) => {}
        }
        Some(item)
    }
}

pub fn iter_chunks<'a, R: Read + ?Sized, T: TimeoutProvider + ?Sized>(
    reader: &'a mut R,
    timeout: &'a T,
) -> Chunks<'a, R, T> {
    Chunks {
        reader,
        timeout,
        done: false,
    }
}

/// The request phase as seen by a server.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Request {
    pub working_dir: String,
    pub command: String,
    pub arguments: Vec<String>,
    pub environment: BTreeMap<String, String>,
}

/// Parse the request phase from a client. WORKING_DIR and COMMAND are required; ARGUMENT
/// and ENVIRONMENT chunks are aggregated. Any other chunk before the header is complete
/// is a protocol error.
pub fn parse_request<R: Read + ?Sized>(r: &mut R) -> Result<Request, StreamError> {
    let mut working_dir: Option<String> = None;
    let mut command: Option<String> = None;
    let mut req = Request::default();

    while working_dir.is_none() || command.is_none() {
        let (chunk_type, payload) = read_chunk(r, &NoTimeout)?;
        let text = String::from_utf8_lossy(&payload).into_owned();
        match chunk_type {
            ChunkType::Argument => req.arguments.push(text),
            ChunkType::Environment => {
                let (key, value) = text
                    .split_once(ENVIRON_SEP)
                    .ok_or_else(|| ProtocolError::MalformedEnvironment(text.clone()))?;
                req.environment.insert(key.to_string(), value.to_string());
            }
            ChunkType::WorkingDir => working_dir = Some(text),
            ChunkType::Command => command = Some(text),
            other => return Err(ProtocolError::IncompleteRequest(other).into()),
        }
    }

    req.working_dir = working_dir.unwrap_or_default();
    req.command = command.unwrap_or_default();
    Ok(req)
}

pub fn send_start_reading_input<W: Write + ?Sized>(w: &mut W) -> Result<(), StreamError> {
    write_chunk(w, ChunkType::StartReadingInput, b"")
}

pub fn send_stdout<W: Write + ?Sized>(w: &mut W, payload: &[u8]) -> Result<(), StreamError> {
    write_chunk(w, ChunkType::Stdout, payload)
}

pub fn send_stderr<W: Write + ?Sized>(w: &mut W, payload: &[u8]) -> Result<(), StreamError> {
    write_chunk(w, ChunkType::Stderr, payload)
}

pub fn send_exit_with_code<W: Write + ?Sized>(w: &mut W, code: i32) -> Result<(), StreamError> {
    write_chunk(w, ChunkType::Exit, encode_exit_code(code).as_bytes())
}

pub fn encode_exit_code(code: i32) -> String {
    code.to_string()
}

pub fn decode_exit_code(payload: &[u8]) -> Result<i32, ProtocolError> {
    let text = String::from_utf8_lossy(payload);
    text.trim()
        .parse::<i32>()
        .map_err(|_| ProtocolError::InvalidExitCode(text.into_owned()))
}

pub fn tty_path_env(fd: u8) -> String {
    format!("{TTY_PATH_ENV_PREFIX}{fd}")
}

/// Nailgun tty capability variables for whichever of this process's stdio fds are terminals.
#[cfg(unix)]
pub fn ttynames_to_env() -> BTreeMap<String, String> {
    use nix::unistd::ttyname;

    let mut env = BTreeMap::new();
    if atty::is(atty::Stream::Stdin) {
        if let Ok(p) = ttyname(io::stdin()) {
            env.insert(tty_path_env(0), p.display().to_string());
        }
    }
    if atty::is(atty::Stream::Stdout) {
        if let Ok(p) = ttyname(io::stdout()) {
            env.insert(tty_path_env(1), p.display().to_string());
        }
    }
    if atty::is(atty::Stream::Stderr) {
        if let Ok(p) = ttyname(io::stderr()) {
            env.insert(tty_path_env(2), p.display().to_string());
        }
    }
    env
}

#[cfg(not(unix))]
pub fn ttynames_to_env() -> BTreeMap<String, String> {
    BTreeMap::new()
}

/// Remote tty paths for (stdin, stdout, stderr), or None where the client was not a tty.
pub fn ttynames_from_env(env: &BTreeMap<String, String>) -> [Option<String>; 3] {
    [0u8, 1, 2].map(|fd| env.get(&tty_path_env(fd)).cloned())
}
