mod support;

use std::io;
use std::net::TcpListener;
use std::path::{Path, PathBuf};
use std::time::Duration;

use nailgun_runner::executor::{buildroot_tag, fingerprint_tag, owner_tag};
use nailgun_runner::{
    EndpointResolver, ExecutorConfig, LaunchSpec, Launcher, NailgunError, NailgunExecutor,
    ServerRequest, SpawnLock,
};
use support::{captured_stdio, strings, FakeControl, FakeLauncher, FakeTable};

const BUILDROOT: &str = "/src/repo";

fn config() -> ExecutorConfig {
    ExecutorConfig {
        java: PathBuf::from("java"),
        connect_timeout: Duration::from_secs(1),
        connect_attempts: 2,
        connect_retry_sleep: Duration::from_millis(10),
        ..ExecutorConfig::default()
    }
}

fn request() -> ServerRequest {
    ServerRequest {
        jvm_options: strings(&["-Xmx1g"]),
        classpath: strings(&["tool.jar", "nailgun.jar"]),
        jvm_version: "17.0.9".to_string(),
    }
}

fn server_cmdline(buildroot: &str, workdir: &Path, fingerprint: Option<&str>) -> Vec<String> {
    let mut cmd = vec![
        "java".to_string(),
        buildroot_tag(Path::new(buildroot)),
        owner_tag(workdir),
    ];
    if let Some(fp) = fingerprint {
        cmd.push(fingerprint_tag(fp));
    }
    cmd.extend(strings(&["-cp", "nailgun.jar", "com.martiansoftware.nailgun.NGServer", ":0"]));
    cmd
}

struct Fixture {
    _td: tempfile::TempDir,
    workdir: PathBuf,
    table: FakeTable,
    control: FakeControl,
    launcher: FakeLauncher,
    // Stands in for the freshly spawned server.
    _new_server: TcpListener,
}

impl Fixture {
    fn new() -> Fixture {
        let td = tempfile::tempdir().expect("tmpdir");
        let workdir = td.path().join(".nailgun");
        let table = FakeTable::default();
        let control = FakeControl::new(&table);
        let new_server = TcpListener::bind("127.0.0.1:0").expect("bind");
        let port = new_server.local_addr().unwrap().port();
        let launcher = FakeLauncher::new(&table, &control, 200, port);
        Fixture {
            _td: td,
            workdir,
            table,
            control,
            launcher,
            _new_server: new_server,
        }
    }

    fn new_port(&self) -> u16 {
        self.launcher.port
    }

    fn executor(&self) -> NailgunExecutor<FakeTable, FakeControl, FakeLauncher> {
        NailgunExecutor::with_parts(
            BUILDROOT,
            &self.workdir,
            config(),
            self.table.clone(),
            self.control.clone(),
            self.launcher.clone(),
        )
    }
}

#[test]
fn test_spawns_when_nothing_is_running() {
    let fx = Fixture::new();
    let (stdio, _out, _err) = captured_stdio(None);
    let client = fx.executor().get_client(&request(), stdio).expect("client");

    assert_eq!(client.port(), fx.new_port());
    assert_eq!(client.remote_pid(), Some(200));

    let launches = fx.launcher.launches();
    assert_eq!(launches.len(), 1);
    let spec = &launches[0];
    assert_eq!(spec.workdir, fx.workdir);
    assert_eq!(
        spec.tags,
        vec![
            buildroot_tag(Path::new(BUILDROOT)),
            owner_tag(&fx.workdir),
            fingerprint_tag(&request().fingerprint()),
        ]
    );
    assert_eq!(spec.jvm_options, strings(&["-Xmx1g"]));
    assert!(fx.control.killed().is_empty());
    assert!(fx.workdir.join("nailgun.lock").exists());
}

#[test]
fn test_waits_for_a_held_spawn_lock() {
    let fx = Fixture::new();
    let held = SpawnLock::acquire(&fx.workdir).expect("hold lock");
    let executor = fx.executor();

    std::thread::scope(|s| {
        let waiter = s.spawn(|| {
            let (stdio, _out, _err) = captured_stdio(None);
            executor.get_client(&request(), stdio).map(|c| c.port())
        });
        std::thread::sleep(Duration::from_millis(200));
        assert!(!waiter.is_finished());
        assert!(fx.launcher.launches().is_empty());

        drop(held);
        let port = waiter.join().expect("waiter thread").expect("client");
        assert_eq!(port, fx.new_port());
    });
    assert_eq!(fx.launcher.launches().len(), 1);
}

#[test]
fn test_reuses_live_server_with_matching_fingerprint() {
    let fx = Fixture::new();
    let existing = TcpListener::bind("127.0.0.1:0").unwrap();
    let existing_port = existing.local_addr().unwrap().port();
    let fp = request().fingerprint();
    fx.table.add(
        100,
        "java",
        server_cmdline(BUILDROOT, &fx.workdir, Some(&fp)),
        vec![existing_port],
    );
    fx.control.set_alive(100);

    let (stdio, _out, _err) = captured_stdio(None);
    let client = fx.executor().get_client(&request(), stdio).expect("client");

    assert_eq!(client.port(), existing_port);
    assert_eq!(client.remote_pid(), Some(100));
    assert!(fx.launcher.launches().is_empty());
    assert!(fx.control.killed().is_empty());
}

#[test]
fn test_replaces_live_server_with_other_fingerprint() {
    let fx = Fixture::new();
    fx.table.add(
        100,
        "java",
        server_cmdline(BUILDROOT, &fx.workdir, Some("0ld")),
        vec![40000],
    );
    fx.control.set_alive(100);

    let (stdio, _out, _err) = captured_stdio(None);
    let client = fx.executor().get_client(&request(), stdio).expect("client");

    assert_eq!(fx.control.killed(), vec![100]);
    assert_eq!(fx.launcher.launches().len(), 1);
    assert_eq!(client.port(), fx.new_port());
    assert_eq!(client.remote_pid(), Some(200));
}

#[test]
fn test_dead_pid_spawns_without_touching_stale_port() {
    let fx = Fixture::new();
    let stale = TcpListener::bind("127.0.0.1:0").unwrap();
    stale.set_nonblocking(true).unwrap();
    let stale_port = stale.local_addr().unwrap().port();
    let fp = request().fingerprint();
    // Still in the table (TOCTOU) but no longer alive.
    fx.table.add(
        100,
        "java",
        server_cmdline(BUILDROOT, &fx.workdir, Some(&fp)),
        vec![stale_port],
    );

    let (stdio, _out, _err) = captured_stdio(None);
    let client = fx.executor().get_client(&request(), stdio).expect("client");

    assert_eq!(fx.launcher.launches().len(), 1);
    assert_eq!(client.port(), fx.new_port());
    assert_eq!(client.remote_pid(), Some(200));
    assert!(fx.control.killed().is_empty());
    match stale.accept() {
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
        other => panic!("stale port was contacted: {other:?}"),
    }
}

/// Reports a port but never registers a server in the table.
struct SilentLauncher(u16);

impl Launcher for SilentLauncher {
    fn launch(&self, _spec: &LaunchSpec) -> Result<u16, NailgunError> {
        Ok(self.0)
    }
}

#[test]
fn test_spawned_server_must_identify_itself() {
    let fx = Fixture::new();
    let executor = NailgunExecutor::with_parts(
        BUILDROOT,
        &fx.workdir,
        config(),
        fx.table.clone(),
        fx.control.clone(),
        SilentLauncher(fx.new_port()),
    );
    let (stdio, _out, _err) = captured_stdio(None);
    let err = executor.get_client(&request(), stdio).expect_err("should fail");
    match err {
        NailgunError::Startup { message, .. } => {
            assert!(message.contains("not discoverable"), "{message}")
        }
        other => panic!("unexpected error {other:?}"),
    }
}

#[test]
fn test_unreachable_port_fails_after_attempt_budget() {
    let fx = Fixture::new();
    let closed = {
        let l = TcpListener::bind("127.0.0.1:0").unwrap();
        l.local_addr().unwrap().port()
    };
    let err = fx.executor().ensure_connectable(closed).expect_err("nothing listening");
    match err {
        NailgunError::Startup { message, .. } => {
            assert!(message.contains("after 2 attempts"), "{message}")
        }
        other => panic!("unexpected error {other:?}"),
    }
}

fn populated(workdir: &Path) -> FakeTable {
    let table = FakeTable::default();
    table.add(1, "java", server_cmdline(BUILDROOT, workdir, Some("a")), vec![5001]);
    table.add(
        2,
        "java",
        server_cmdline(BUILDROOT, Path::new("/elsewhere"), Some("b")),
        vec![5002],
    );
    table.add(
        3,
        "java",
        server_cmdline("/other/repo", workdir, Some("c")),
        vec![5003],
    );
    table.add(4, "python", server_cmdline(BUILDROOT, workdir, Some("d")), vec![5004]);
    table
}

type FakeExecutor = NailgunExecutor<FakeTable, FakeControl, FakeLauncher>;

fn kill_with(workdir: &Path, f: impl Fn(&FakeExecutor) -> Vec<u32>) -> Vec<u32> {
    let table = populated(workdir);
    let control = FakeControl::new(&table);
    let launcher = FakeLauncher::new(&table, &control, 9, 9);
    let executor =
        NailgunExecutor::with_parts(BUILDROOT, workdir, config(), table, control.clone(), launcher);
    let mut pids = f(&executor);
    pids.sort_unstable();
    assert_eq!(control.killed().len(), pids.len());
    pids
}

#[test]
fn test_kill_and_killall_scopes() {
    let workdir = Path::new("/src/repo/.nailgun");
    assert_eq!(kill_with(workdir, |e| e.kill().unwrap()), vec![1]);
    assert_eq!(kill_with(workdir, |e| e.killall(false).unwrap()), vec![1, 2]);
    assert_eq!(kill_with(workdir, |e| e.killall(true).unwrap()), vec![1, 2, 3]);
}

#[test]
fn test_resolver_requires_fingerprint_and_port() {
    let workdir = Path::new("/src/repo/.nailgun");
    let table = FakeTable::default();
    table.add(10, "java", server_cmdline(BUILDROOT, workdir, None), vec![6000]);
    table.add(11, "java", server_cmdline(BUILDROOT, workdir, Some("ff")), vec![]);
    let resolver = EndpointResolver::new(table.clone(), Path::new(BUILDROOT));
    assert_eq!(resolver.find(workdir).unwrap(), None);
    assert_eq!(resolver.find_owned(workdir).unwrap().len(), 2);

    table.add(12, "java", server_cmdline(BUILDROOT, workdir, Some("ff")), vec![6002, 7000]);
    let found = resolver.find(workdir).unwrap().expect("usable server");
    assert_eq!(found.to_string(), "java:ff:12:6002");
    // Owned by a different workspace.
    assert_eq!(resolver.find(Path::new("/src/repo/other")).unwrap(), None);
}
