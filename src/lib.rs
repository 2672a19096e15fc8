/*!
nailgun-runner: run JVM main classes through a warm, per-workspace Nailgun server.

Layers, bottom up:
- `protocol`: chunk framing and request encoding shared by client and server sides.
- `client`: one connection per invocation; a session relays stdio and honors exit deadlines.
- `executor`: finds, reuses, replaces and spawns servers, and hands back clients.

The crate root re-exports the public surface with `pub use`.
*/

pub mod client;
pub mod config;
pub mod errors;
pub mod executor;
pub mod lock;
pub mod protocol;
pub mod telemetry;
pub mod util;

pub use client::{
    interop_env, shared_input, ClientCanceller, ExitTimeoutToken, NailgunClient, NailgunSession,
    NailgunStdio, PolledFd, SharedInput, StreamRelay, DEFAULT_NG_HOST, DEFAULT_NG_PORT,
    FILE_SEPARATOR_ENV, PATH_SEPARATOR_ENV,
};
pub use config::{detect_jvm_version, parse_java_version, resolve_java, ExecutorConfig};
pub use errors::{
    exit_code_for_io_error, exit_code_for_nailgun_error, EndpointParseError, NailgunError,
    ProcessStreamTimeout, ProtocolError, StreamError,
};
pub use executor::{
    fingerprint_data, plan_reuse, Decision, DetachedLauncher, Endpoint, EndpointResolver,
    LaunchSpec, Launcher, NailgunExecutor, ProcTable, ProcessControl, ProcessSnapshot,
    ProcessTable, ServerRequest, SignalControl,
};
pub use lock::SpawnLock;
pub use protocol::{
    construct_chunk, iter_chunks, parse_request, read_chunk, send_exit_with_code, send_request,
    send_start_reading_input, send_stderr, send_stdout, ttynames_from_env, ttynames_to_env,
    write_chunk, ChunkType, NoTimeout, Request, TimeoutProvider,
};
pub use telemetry::telemetry_init;
pub use util::{shell_join, split_classpath};
