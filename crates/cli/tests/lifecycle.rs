//! End-to-end tests driving the real `toolhub` binary.

use std::net::TcpListener;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use mcp::ErrorKind;
use runtime::{
    Capability, ConnectOptions, EntryPoint, Registry, RegistryToolHost, ServerStatus, Supervisor,
    SupervisorOptions, ToolCall, ToolHost, ToolServerSpec,
};
use serde_json::json;
use tempfile::TempDir;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

const BIN: &str = env!("CARGO_BIN_EXE_toolhub");

struct Fixture {
    dir: TempDir,
    config: PathBuf,
    registry: PathBuf,
}

impl Fixture {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let registry = dir.path().join("server_config.txt");
        let database = dir.path().join("sales.db");

        let conn = rusqlite::Connection::open(&database).unwrap();
        conn.execute_batch(
            "CREATE TABLE sales (ID TEXT PRIMARY KEY, City TEXT, Quantity INTEGER);
             INSERT INTO sales VALUES ('S1', 'Tokyo', 3), ('S2', 'Osaka', 5);",
        )
        .unwrap();

        // Port 1 refuses connections, so weather calls fail fast and offline.
        // Built-in servers launched by the binary start scanning at a free
        // port instead of 8001.
        let config = dir.path().join("toolhub.toml");
        let base_port = free_port();
        let toml = format!(
            "registry = {registry:?}\n\
             [supervisor]\nready_timeout_secs = 20\ngrace_period_secs = 2\nbase_port = {base_port}\n\
             [weather]\napi_base = \"http://127.0.0.1:1/weather\"\napi_key = \"test\"\n\
             [sql]\ndatabase = {database:?}\n\
             [translator]\napi_base = \"http://127.0.0.1:1\"\napi_key = \"test\"\n",
        );
        std::fs::write(&config, toml).unwrap();

        Self {
            dir,
            config,
            registry,
        }
    }

    fn spec(&self, name: &str, capability: Capability) -> ToolServerSpec {
        let entry = EntryPoint::new(BIN)
            .arg("--config")
            .arg(self.config.to_string_lossy())
            .arg("serve")
            .arg(capability.as_str());
        ToolServerSpec::new(name, capability, free_port(), entry)
    }

    fn supervisor(&self) -> Supervisor {
        let options = SupervisorOptions {
            ready_timeout: Duration::from_secs(20),
            grace_period: Duration::from_secs(2),
            ..SupervisorOptions::default()
        };
        Supervisor::new(Registry::new(&self.registry), options)
    }

    fn toolhub(&self) -> Command {
        let mut command = Command::new(BIN);
        command
            .current_dir(self.dir.path())
            .arg("--config")
            .arg(&self.config)
            .env_remove("OPENWEATHER_API_KEY")
            .env_remove("OPENAI_API_KEY");
        command
    }
}

fn free_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

fn quick_connect() -> ConnectOptions {
    ConnectOptions {
        connect_timeout: Duration::from_secs(2),
        call_timeout: Duration::from_secs(20),
        attempts: 3,
        retry_delay: Duration::from_millis(200),
    }
}

fn registry_ports(path: &Path) -> Vec<(String, u16)> {
    Registry::new(path)
        .read()
        .unwrap()
        .into_iter()
        .map(|(name, endpoint)| (name, endpoint.port))
        .collect()
}

#[tokio::test]
async fn launch_discover_invoke_and_stop() {
    let fixture = Fixture::new();
    let specs = vec![
        fixture.spec("weather", Capability::Weather),
        fixture.spec("sql_query", Capability::Sql),
        fixture.spec("ppt_translator", Capability::PptTranslate),
    ];
    let mut supervisor = fixture.supervisor();

    let records = supervisor.start_all(&specs).await.unwrap();
    for record in &records {
        assert_eq!(record.status, ServerStatus::Running, "{record:?}");
        assert!(record.pid.is_some());
    }

    let mut expected: Vec<(String, u16)> = records
        .iter()
        .map(|r| (r.name.clone(), r.assigned_port.unwrap()))
        .collect();
    expected.sort();
    assert_eq!(registry_ports(&fixture.registry), expected);

    let (host, unreachable) =
        RegistryToolHost::from_registry(&Registry::new(&fixture.registry), &quick_connect())
            .await
            .unwrap();
    assert!(unreachable.is_empty());
    for server in ["weather", "sql_query", "ppt_translator"] {
        assert!(
            host.specs().iter().any(|s| s.server == server),
            "no tools discovered on {server}"
        );
    }

    // Argument validation happens before the capability runs.
    let result = host
        .execute(&ToolCall::new("1", "query_weather", json!({})))
        .await
        .unwrap();
    assert_eq!(result.error_kind, Some(ErrorKind::InvalidArguments));

    // The weather API is unreachable; the server answers with an error.
    let result = host
        .execute(&ToolCall::new("2", "query_weather", json!({"city": "Taipei"})))
        .await
        .unwrap();
    assert_eq!(result.error_kind, Some(ErrorKind::CapabilityExecution));

    // And keeps serving afterwards.
    let result = host
        .execute(&ToolCall::new(
            "3",
            "query_database",
            json!({"query": "SELECT City, Quantity FROM sales ORDER BY ID"}),
        ))
        .await
        .unwrap();
    assert!(result.success, "{:?}", result.message);
    let payload = result.payload.unwrap();
    assert_eq!(payload["row_count"], json!(2));
    assert!(payload["table"].as_str().unwrap().ends_with("Total 2 records"));

    let stopped = supervisor.stop_all().await;
    assert_eq!(stopped.len(), 3);
    assert!(stopped.iter().all(|r| r.status == ServerStatus::Stopped));
    assert!(supervisor.stop_all().await.is_empty());

    // Stopped servers no longer answer.
    let (host, unreachable) = RegistryToolHost::from_registry(
        &Registry::new(&fixture.registry),
        &ConnectOptions {
            attempts: 1,
            ..quick_connect()
        },
    )
    .await
    .unwrap();
    assert!(host.is_empty());
    assert_eq!(unreachable.len(), 3);
}

#[tokio::test]
async fn one_failed_launch_leaves_the_rest_registered() {
    let fixture = Fixture::new();
    let broken = ToolServerSpec::new(
        "broken",
        Capability::Weather,
        free_port(),
        EntryPoint::new(fixture.dir.path().join("no-such-binary")),
    );
    let specs = vec![
        fixture.spec("sql_query", Capability::Sql),
        broken,
        fixture.spec("ppt_translator", Capability::PptTranslate),
    ];
    let mut supervisor = fixture.supervisor();

    let records = supervisor.start_all(&specs).await.unwrap();
    let statuses: Vec<_> = records.iter().map(|r| r.status).collect();
    assert_eq!(
        statuses,
        [ServerStatus::Running, ServerStatus::Failed, ServerStatus::Running]
    );

    let names: Vec<_> = registry_ports(&fixture.registry)
        .into_iter()
        .map(|(name, _)| name)
        .collect();
    assert_eq!(names, ["ppt_translator", "sql_query"]);

    supervisor.stop_all().await;
}

#[tokio::test]
async fn client_reports_missing_registry() {
    let fixture = Fixture::new();
    let output = fixture
        .toolhub()
        .arg("client")
        .stdin(Stdio::null())
        .output()
        .await
        .unwrap();
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("Start the servers first"), "{stderr}");
}

#[tokio::test]
async fn client_and_status_commands_talk_to_servers() {
    let fixture = Fixture::new();
    let mut supervisor = fixture.supervisor();
    supervisor
        .start_all(&[fixture.spec("sql_query", Capability::Sql)])
        .await
        .unwrap();

    let status = fixture.toolhub().arg("status").output().await.unwrap();
    assert!(status.status.success());
    let stdout = String::from_utf8_lossy(&status.stdout);
    assert!(stdout.contains("sql_query"), "{stdout}");
    assert!(stdout.contains("query_database"), "{stdout}");

    let mut client = fixture
        .toolhub()
        .arg("client")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .unwrap();
    let mut stdin = client.stdin.take().unwrap();
    stdin
        .write_all(b"tools\ncall query_database {\"query\": \"SELECT COUNT(*) AS n FROM sales\"}\nread database://schema\nquit\n")
        .await
        .unwrap();
    drop(stdin);

    let output = client.wait_with_output().await.unwrap();
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("query_database (sql_query)"), "{stdout}");
    assert!(stdout.contains("Total 1 records"), "{stdout}");
    assert!(stdout.contains("Table: sales"), "{stdout}");

    supervisor.stop_all().await;
}

/// Pids of the servers marked running in a launcher status table.
fn running_pids(table: &str) -> Vec<i32> {
    table
        .lines()
        .filter_map(|line| {
            let columns: Vec<_> = line.split_whitespace().collect();
            match columns.as_slice() {
                [_, "running", _, pid, ..] => pid.parse().ok(),
                _ => None,
            }
        })
        .collect()
}

/// Pid from a `server spawned ... pid=N` log line.
fn spawned_pid(line: &str) -> Option<i32> {
    if !line.contains("server spawned") {
        return None;
    }
    let rest = &line[line.find("pid=")? + "pid=".len()..];
    let digits: String = rest.chars().take_while(char::is_ascii_digit).collect();
    digits.parse().ok()
}

/// Wait until `pid` no longer exists. A killed child may linger briefly as a
/// zombie until it is reaped.
#[cfg(unix)]
async fn assert_gone(pid: i32) {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    for _ in 0..50 {
        if kill(Pid::from_raw(pid), None).is_err() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("server process {pid} outlived the launcher");
}

#[cfg(unix)]
fn send(child: &tokio::process::Child, signal: nix::sys::signal::Signal) {
    let pid = child.id().unwrap() as i32;
    nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), signal).unwrap();
}

#[cfg(unix)]
#[tokio::test]
async fn sigterm_stops_servers_and_removes_registry() {
    use tokio::io::{AsyncBufReadExt, BufReader};

    let fixture = Fixture::new();
    let mut launcher = fixture
        .toolhub()
        .arg("servers")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .unwrap();

    let mut lines = BufReader::new(launcher.stdout.take().unwrap()).lines();
    let mut table = String::new();
    let ready = tokio::time::timeout(Duration::from_secs(60), async {
        while let Some(line) = lines.next_line().await.unwrap() {
            if line.starts_with("Press Ctrl+C") {
                return true;
            }
            table.push_str(&line);
            table.push('\n');
        }
        false
    })
    .await
    .unwrap();
    assert!(ready, "launcher exited early:\n{table}");

    let pids = running_pids(&table);
    assert_eq!(pids.len(), 3, "{table}");
    assert_eq!(registry_ports(&fixture.registry).len(), 3);

    send(&launcher, nix::sys::signal::Signal::SIGTERM);
    let status = tokio::time::timeout(Duration::from_secs(30), launcher.wait())
        .await
        .unwrap()
        .unwrap();
    assert!(status.success());

    let mut rest = String::new();
    while let Some(line) = lines.next_line().await.unwrap() {
        rest.push_str(&line);
    }
    assert!(rest.contains("Stopped 3 server(s)."), "{rest}");
    assert!(!fixture.registry.exists());
    for pid in pids {
        assert_gone(pid).await;
    }
}

#[cfg(unix)]
#[tokio::test]
async fn interrupt_during_launch_leaves_no_servers() {
    use tokio::io::{AsyncBufReadExt, BufReader};

    let fixture = Fixture::new();
    let mut launcher = fixture
        .toolhub()
        .arg("servers")
        .env("RUST_LOG", "info")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()
        .unwrap();

    let mut lines = BufReader::new(launcher.stderr.take().unwrap()).lines();
    let first = tokio::time::timeout(Duration::from_secs(60), async {
        while let Some(line) = lines.next_line().await.unwrap() {
            if let Some(pid) = spawned_pid(&line) {
                return Some(pid);
            }
        }
        None
    })
    .await
    .unwrap()
    .expect("no server was spawned");

    // Interrupt right after the first spawn, while it is still starting.
    send(&launcher, nix::sys::signal::Signal::SIGINT);

    let mut pids = vec![first];
    let drain = tokio::spawn(async move {
        let mut later = Vec::new();
        while let Ok(Some(line)) = lines.next_line().await {
            later.extend(spawned_pid(&line));
        }
        later
    });

    let status = tokio::time::timeout(Duration::from_secs(30), launcher.wait())
        .await
        .unwrap()
        .unwrap();
    assert!(status.success());
    // Servers inherit the launcher's stderr; the pipe only closes once all
    // of them are gone.
    let later = tokio::time::timeout(Duration::from_secs(30), drain)
        .await
        .expect("a server still holds the launcher's stderr")
        .unwrap();
    pids.extend(later);

    assert!(!fixture.registry.exists());
    for pid in pids {
        assert_gone(pid).await;
    }
}

#[tokio::test]
async fn both_mode_stops_servers_when_client_quits() {
    let fixture = Fixture::new();
    let mut both = fixture
        .toolhub()
        .arg("both")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .unwrap();

    let mut stdin = both.stdin.take().unwrap();
    stdin.write_all(b"tools\nquit\n").await.unwrap();
    drop(stdin);

    let output = tokio::time::timeout(Duration::from_secs(60), both.wait_with_output())
        .await
        .unwrap()
        .unwrap();
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(output.status.success(), "{stdout}");
    assert_eq!(running_pids(&stdout).len(), 3, "{stdout}");
    assert!(stdout.contains("query_database (sql_query)"), "{stdout}");
    assert!(stdout.contains("Stopped 3 server(s)."), "{stdout}");
    assert!(!fixture.registry.exists());

    #[cfg(unix)]
    for pid in running_pids(&stdout) {
        assert_gone(pid).await;
    }
}

#[test]
fn status_table_and_log_parsing() {
    let table = "SERVER  STATUS  PORT  PID  DETAIL\n\
                 weather  running  8001  4242\n\
                 sql_query  failed  -  -  exited";
    assert_eq!(running_pids(table), [4242]);
    assert_eq!(
        spawned_pid("INFO runtime::supervisor: server spawned server=weather port=8001 pid=77"),
        Some(77)
    );
    assert_eq!(spawned_pid("INFO server ready pid=77"), None);
}
