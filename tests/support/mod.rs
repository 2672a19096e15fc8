/*!
Test support helpers shared across integration tests.

- FakeServer: one-shot loopback Nailgun server driven by a script closure
- SharedSink: cloneable in-memory writer for capturing relayed stdout/stderr
- FakeTable / FakeControl / FakeLauncher: in-memory process table, signals and spawner
*/

use std::collections::HashSet;
use std::io::{self, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use nailgun_runner::{
    parse_request, LaunchSpec, Launcher, NailgunError, NailgunStdio, ProcessControl,
    ProcessSnapshot, ProcessTable, Request,
};

/// Loopback server that accepts one connection, parses the request and hands the socket
/// to a script.
pub struct FakeServer {
    pub port: u16,
    handle: Option<JoinHandle<Request>>,
}

#[allow(dead_code)]
impl FakeServer {
    pub fn start<F>(script: F) -> FakeServer
    where
        F: FnOnce(&mut TcpStream, &Request) + Send + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind fake server");
        let port = listener.local_addr().expect("local addr").port();
        let handle = std::thread::spawn(move || {
            let (mut sock, _) = listener.accept().expect("accept");
            let request = parse_request(&mut sock).expect("parse request");
            script(&mut sock, &request);
            request
        });
        FakeServer {
            port,
            handle: Some(handle),
        }
    }

    /// Wait for the script to finish and return the request the server saw.
    pub fn join(mut self) -> Request {
        self.handle
            .take()
            .expect("joined once")
            .join()
            .expect("fake server thread panicked")
    }
}

#[derive(Clone, Default)]
pub struct SharedSink(pub Arc<Mutex<Vec<u8>>>);

#[allow(dead_code)]
impl SharedSink {
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }
}

impl Write for SharedSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }
    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Stdio capturing stdout/stderr into sinks, with optional canned stdin.
#[allow(dead_code)]
pub fn captured_stdio(stdin: Option<&[u8]>) -> (NailgunStdio, SharedSink, SharedSink) {
    let out = SharedSink::default();
    let err = SharedSink::default();
    let input: Option<Box<dyn io::Read + Send>> =
        stdin.map(|b| Box::new(io::Cursor::new(b.to_vec())) as Box<dyn io::Read + Send>);
    let stdio = NailgunStdio::new(input, Box::new(out.clone()), Box::new(err.clone()));
    (stdio, out, err)
}

#[allow(dead_code)]
pub fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

#[derive(Clone, Default)]
pub struct FakeTable {
    pub procs: Arc<Mutex<Vec<(ProcessSnapshot, Vec<u16>)>>>,
}

#[allow(dead_code)]
impl FakeTable {
    pub fn add(&self, pid: u32, name: &str, cmdline: Vec<String>, ports: Vec<u16>) {
        self.procs.lock().unwrap().push((
            ProcessSnapshot {
                pid,
                name: name.to_string(),
                cmdline,
            },
            ports,
        ));
    }

    pub fn remove(&self, pid: u32) {
        self.procs.lock().unwrap().retain(|(p, _)| p.pid != pid);
    }
}

impl ProcessTable for FakeTable {
    fn snapshot(&self) -> io::Result<Vec<ProcessSnapshot>> {
        Ok(self.procs.lock().unwrap().iter().map(|(p, _)| p.clone()).collect())
    }

    fn listening_ports(&self, pid: u32) -> io::Result<Vec<u16>> {
        Ok(self
            .procs
            .lock()
            .unwrap()
            .iter()
            .find(|(p, _)| p.pid == pid)
            .map(|(_, ports)| ports.clone())
            .unwrap_or_default())
    }
}

#[derive(Clone, Default)]
pub struct FakeControl {
    pub alive: Arc<Mutex<HashSet<u32>>>,
    pub killed: Arc<Mutex<Vec<u32>>>,
    pub table: FakeTable,
}

#[allow(dead_code)]
impl FakeControl {
    pub fn new(table: &FakeTable) -> Self {
        FakeControl {
            table: table.clone(),
            ..Default::default()
        }
    }

    pub fn set_alive(&self, pid: u32) {
        self.alive.lock().unwrap().insert(pid);
    }

    pub fn killed(&self) -> Vec<u32> {
        self.killed.lock().unwrap().clone()
    }
}

impl ProcessControl for FakeControl {
    fn is_alive(&self, pid: u32) -> bool {
        self.alive.lock().unwrap().contains(&pid)
    }

    fn kill(&self, pid: u32) -> io::Result<()> {
        self.alive.lock().unwrap().remove(&pid);
        self.table.remove(pid);
        self.killed.lock().unwrap().push(pid);
        Ok(())
    }
}

/// "Spawns" a server by registering it in the fake table with the launch command line,
/// listening on `port` as `pid`.
#[derive(Clone)]
pub struct FakeLauncher {
    pub table: FakeTable,
    pub control: FakeControl,
    pub pid: u32,
    pub port: u16,
    pub launched: Arc<Mutex<Vec<LaunchSpec>>>,
}

#[allow(dead_code)]
impl FakeLauncher {
    pub fn new(table: &FakeTable, control: &FakeControl, pid: u32, port: u16) -> Self {
        FakeLauncher {
            table: table.clone(),
            control: control.clone(),
            pid,
            port,
            launched: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn launches(&self) -> Vec<LaunchSpec> {
        self.launched.lock().unwrap().clone()
    }
}

impl Launcher for FakeLauncher {
    fn launch(&self, spec: &LaunchSpec) -> Result<u16, NailgunError> {
        self.launched.lock().unwrap().push(spec.clone());
        self.table
            .add(self.pid, "java", spec.command_line(), vec![self.port]);
        self.control.set_alive(self.pid);
        Ok(self.port)
    }
}
