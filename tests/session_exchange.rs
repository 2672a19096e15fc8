mod support;

use std::collections::BTreeMap;
use std::io::{self, Read};
use std::net::TcpListener;
use std::path::Path;
use std::time::{Duration, Instant};

use nailgun_runner::{
    read_chunk, send_exit_with_code, send_start_reading_input, send_stderr, send_stdout,
    write_chunk, ChunkType, NailgunClient, NailgunError, NoTimeout, ProtocolError, StreamError,
    FILE_SEPARATOR_ENV, PATH_SEPARATOR_ENV,
};
use support::{captured_stdio, strings, FakeServer};

#[test]
fn test_execute_relays_stdout_and_exit_code() {
    let server = FakeServer::start(|sock, _req| {
        send_stdout(sock, b"hello\n").unwrap();
        send_exit_with_code(sock, 0).unwrap();
    });
    let (stdio, out, err) = captured_stdio(None);
    let mut client = NailgunClient::new("127.0.0.1", server.port, stdio);

    let code = client
        .execute("org.example.Main", &[], &BTreeMap::new(), Some(Path::new("/work")))
        .expect("execute");

    assert_eq!(code, 0);
    assert_eq!(out.contents(), "hello\n");
    assert_eq!(err.contents(), "");

    let req = server.join();
    assert_eq!(req.command, "org.example.Main");
    assert_eq!(req.working_dir, "/work");
}

#[test]
fn test_request_carries_args_env_and_interop_vars() {
    let server = FakeServer::start(|sock, _req| {
        send_stderr(sock, b"warn: x\n").unwrap();
        send_stdout(sock, b"a").unwrap();
        send_stdout(sock, b"b").unwrap();
        send_exit_with_code(sock, 3).unwrap();
    });
    let (stdio, out, err) = captured_stdio(None);
    let mut client = NailgunClient::new("127.0.0.1", server.port, stdio).with_workdir("/ws");

    let mut env = BTreeMap::new();
    env.insert("FOO".to_string(), "bar=baz".to_string());
    env.insert(FILE_SEPARATOR_ENV.to_string(), "\\".to_string());
    let code = client
        .execute("Main", &strings(&["-x", "two words"]), &env, None)
        .expect("execute");

    assert_eq!(code, 3);
    assert_eq!(out.contents(), "ab");
    assert_eq!(err.contents(), "warn: x\n");

    let req = server.join();
    assert_eq!(req.arguments, strings(&["-x", "two words"]));
    assert_eq!(req.working_dir, "/ws");
    assert_eq!(req.environment.get("FOO").map(String::as_str), Some("bar=baz"));
    assert_eq!(
        req.environment.get(PATH_SEPARATOR_ENV).map(String::as_str),
        Some(":")
    );
    // Caller-supplied values win over the interop defaults.
    assert_eq!(
        req.environment.get(FILE_SEPARATOR_ENV).map(String::as_str),
        Some("\\")
    );
}

#[test]
fn test_stdin_is_relayed_after_start_reading_input() {
    let server = FakeServer::start(|sock, _req| {
        send_start_reading_input(sock).unwrap();
        let mut seen = Vec::new();
        loop {
            let (t, payload) = read_chunk(sock, &NoTimeout).unwrap();
            match t {
                ChunkType::Stdin => seen.extend(payload),
                ChunkType::StdinEof => break,
                other => panic!("unexpected {other}"),
            }
        }
        send_stdout(sock, &seen).unwrap();
        send_exit_with_code(sock, 0).unwrap();
    });
    let (stdio, out, _err) = captured_stdio(Some(b"ping"));
    let mut client = NailgunClient::new("127.0.0.1", server.port, stdio);

    let code = client
        .execute("Cat", &[], &BTreeMap::new(), Some(Path::new("/")))
        .expect("execute");
    assert_eq!(code, 0);
    assert_eq!(out.contents(), "ping");
    server.join();
}

#[test]
fn test_start_reading_input_without_stdin_sends_nothing() {
    let server = FakeServer::start(|sock, _req| {
        send_start_reading_input(sock).unwrap();
        send_start_reading_input(sock).unwrap();
        sock.set_read_timeout(Some(Duration::from_millis(200))).unwrap();
        let mut buf = [0u8; 1];
        let idle = matches!(
            sock.read(&mut buf),
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut)
        );
        let report: &[u8] = if idle { b"no input" } else { b"input arrived" };
        send_stdout(sock, report).unwrap();
        send_exit_with_code(sock, 0).unwrap();
    });
    let (stdio, out, _err) = captured_stdio(None);
    let mut client = NailgunClient::new("127.0.0.1", server.port, stdio);

    let code = client
        .execute("Main", &[], &BTreeMap::new(), Some(Path::new("/")))
        .expect("execute");
    assert_eq!(code, 0);
    assert_eq!(out.contents(), "no input");
    server.join();
}

#[test]
fn test_unexpected_response_chunk_is_an_execution_error() {
    let server = FakeServer::start(|sock, _req| {
        write_chunk(sock, ChunkType::Command, b"bogus").unwrap();
    });
    let (stdio, _out, _err) = captured_stdio(None);
    let mut client = NailgunClient::new("127.0.0.1", server.port, stdio);

    let err = client
        .execute("Main", &[], &BTreeMap::new(), Some(Path::new("/")))
        .expect_err("should fail");
    match &err {
        NailgunError::Execution {
            address,
            source: StreamError::Protocol(ProtocolError::UnexpectedChunk { chunk_type, payload }),
        } => {
            assert_eq!(address, &format!("127.0.0.1:{}", server.port));
            assert_eq!(*chunk_type, ChunkType::Command);
            assert_eq!(payload, "bogus");
        }
        other => panic!("unexpected error {other:?}"),
    }
    server.join();
}

#[test]
fn test_server_closing_early_is_truncation() {
    let server = FakeServer::start(|sock, _req| {
        send_stdout(sock, b"partial").unwrap();
    });
    let (stdio, out, _err) = captured_stdio(None);
    let mut client = NailgunClient::new("127.0.0.1", server.port, stdio);

    let err = client
        .execute("Main", &[], &BTreeMap::new(), Some(Path::new("/")))
        .expect_err("should fail");
    server.join();
    assert!(
        matches!(
            err,
            NailgunError::Execution {
                source: StreamError::Protocol(ProtocolError::Truncated { .. }),
                ..
            }
        ),
        "unexpected error {err:?}"
    );
    assert_eq!(out.contents(), "partial");
}

#[test]
fn test_caller_reason_beats_timeout_and_cleans_up() {
    let server = FakeServer::start(|sock, _req| {
        // Hold the connection open until the client goes away.
        let mut buf = [0u8; 64];
        while matches!(sock.read(&mut buf), Ok(n) if n > 0) {}
    });
    let (stdio, _out, _err) = captured_stdio(None);
    let mut client = NailgunClient::new("127.0.0.1", server.port, stdio);
    let canceller = client.canceller();

    let trigger = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(300));
        canceller.set_exit_timeout(Duration::ZERO, "stopped by test");
    });

    let started = Instant::now();
    let err = client
        .execute("Sleepy", &[], &BTreeMap::new(), Some(Path::new("/")))
        .expect_err("should be cancelled");
    trigger.join().unwrap();

    match err {
        NailgunError::Cancelled { reason, address } => {
            assert_eq!(reason, "stopped by test");
            assert!(address.ends_with(&server.port.to_string()));
        }
        other => panic!("unexpected error {other:?}"),
    }
    assert!(started.elapsed() < Duration::from_secs(5));
    // The server saw the socket close.
    server.join();

    // The client stays usable and is idle again.
    client.set_exit_timeout(Duration::ZERO, "nothing running");
}

#[test]
fn test_connection_refused_names_the_address() {
    let port = {
        let l = TcpListener::bind("127.0.0.1:0").unwrap();
        l.local_addr().unwrap().port()
    };
    let (stdio, _out, _err) = captured_stdio(None);
    let mut client = NailgunClient::new("127.0.0.1", port, stdio)
        .with_connect_timeout(Duration::from_secs(1));

    let err = client
        .execute("Main", &[], &BTreeMap::new(), None)
        .expect_err("nothing listening");
    match &err {
        NailgunError::Connection { address, .. } => {
            assert_eq!(address, &format!("127.0.0.1:{port}"))
        }
        other => panic!("unexpected error {other:?}"),
    }
    assert!(err.to_string().contains(&port.to_string()));
}
