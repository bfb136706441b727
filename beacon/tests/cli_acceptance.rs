use beacon_core::queue::MessageQueue;
use beacon_core::Database;
use std::ffi::OsString;
use std::fs;
use std::io::{BufRead, BufReader};
use std::path::PathBuf;
use std::process::{Command, Output, Stdio};
use tempfile::TempDir;

struct CliTestEnv {
    _temp_dir: TempDir,
    home: PathBuf,
    xdg_data: PathBuf,
    xdg_config: PathBuf,
    xdg_state: PathBuf,
    xdg_runtime: PathBuf,
}

impl CliTestEnv {
    fn new() -> Self {
        let temp_dir = TempDir::new().expect("failed to create temp dir");
        let base = temp_dir.path().to_path_buf();
        let home = base.join("home");
        let xdg_data = base.join("xdg-data");
        let xdg_config = base.join("xdg-config");
        let xdg_state = base.join("xdg-state");
        let xdg_runtime = base.join("xdg-runtime");

        fs::create_dir_all(&home).expect("failed to create HOME");
        fs::create_dir_all(&xdg_data).expect("failed to create XDG_DATA_HOME");
        fs::create_dir_all(&xdg_config).expect("failed to create XDG_CONFIG_HOME");
        fs::create_dir_all(&xdg_state).expect("failed to create XDG_STATE_HOME");
        fs::create_dir_all(&xdg_runtime).expect("failed to create XDG_RUNTIME_DIR");

        Self {
            _temp_dir: temp_dir,
            home,
            xdg_data,
            xdg_config,
            xdg_state,
            xdg_runtime,
        }
    }

    /// Environment whose delivery runs without network IO
    fn with_test_mode(mode: &str) -> Self {
        let env = Self::new();
        env.write_config(&format!(
            "[delivery]\nupdate_interval_ms = 20\ncheck_server_interval_ms = 100\ntest_mode = \"{mode}\"\n"
        ));
        env
    }

    fn write_config(&self, contents: &str) {
        let dir = self.xdg_config.join("beacon");
        fs::create_dir_all(&dir).expect("failed to create config dir");
        fs::write(dir.join("config.toml"), contents).expect("failed to write config");
    }

    fn db_path(&self) -> PathBuf {
        self.xdg_data.join("beacon/beacon.db")
    }

    fn stored_messages(&self) -> usize {
        let db = Database::open(&self.db_path()).expect("failed to open db");
        db.migrate().expect("failed to migrate db");
        MessageQueue::new().load(&db)
    }
}

fn command(env: &CliTestEnv, bin_name: &str, args: &[&str]) -> Command {
    let bin_path = match bin_name {
        "beacon" => PathBuf::from(assert_cmd::cargo::cargo_bin!("beacon")),
        "beacon-deliver" => PathBuf::from(assert_cmd::cargo::cargo_bin!("beacon-deliver")),
        _ => panic!("unsupported binary in test harness: {bin_name}"),
    };

    let mut command = Command::new(bin_path);
    command
        .args(args)
        .env("HOME", &env.home)
        .env("XDG_DATA_HOME", &env.xdg_data)
        .env("XDG_CONFIG_HOME", &env.xdg_config)
        .env("XDG_STATE_HOME", &env.xdg_state)
        .env("XDG_RUNTIME_DIR", &env.xdg_runtime)
        .env_remove("RUST_LOG");
    command
}

fn run_bin(env: &CliTestEnv, bin_name: &str, args: &[&str]) -> Output {
    command(env, bin_name, args)
        .output()
        .unwrap_or_else(|e| panic!("failed to execute {bin_name}: {e}"))
}

fn render(bin_name: &str, args: &[&str], output: &Output) -> String {
    let rendered_args = args
        .iter()
        .map(|arg| OsString::from(arg).to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join(" ");
    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    format!(
        "{bin_name} {rendered_args}\nstatus: {}\nstdout:\n{}\nstderr:\n{}",
        output.status, stdout, stderr
    )
}

fn assert_success(bin_name: &str, args: &[&str], output: &Output) {
    if !output.status.success() {
        panic!("command failed: {}", render(bin_name, args, output));
    }
}

fn run_ok(env: &CliTestEnv, bin_name: &str, args: &[&str]) -> String {
    let output = run_bin(env, bin_name, args);
    assert_success(bin_name, args, &output);
    String::from_utf8_lossy(&output.stdout).into_owned()
}

#[test]
fn status_on_fresh_install_assigns_install_id() {
    let env = CliTestEnv::new();

    let stdout = run_ok(&env, "beacon", &["status"]);
    assert!(stdout.contains("Pending:         0"), "got:\n{stdout}");
    assert!(stdout.contains("Collector:       Not ready"));
    assert!(stdout.contains("install"), "expected install id, got:\n{stdout}");

    let first = run_ok(&env, "beacon", &["id", "list"]);
    let second = run_ok(&env, "beacon", &["id", "list"]);
    assert_eq!(first, second, "install id must be stable across runs");
}

#[test]
fn track_queues_events_durably() {
    let env = CliTestEnv::new();

    run_ok(&env, "beacon", &["track", "milestone", "level", "3"]);
    run_ok(&env, "beacon", &["track", "revenue", "4.99", "usd"]);
    let stdout = run_ok(&env, "beacon", &["track", "country", "de"]);
    assert!(stdout.contains("3 pending"), "got:\n{stdout}");
    assert_eq!(env.stored_messages(), 3);

    let stdout = run_ok(&env, "beacon", &["status", "--pending"]);
    assert!(stdout.contains("Pending:         3"));
    assert!(stdout.contains("\"currency\": \"USD\""), "got:\n{stdout}");
    assert!(stdout.contains("\"country\": \"DE\""));
}

#[test]
fn track_rejects_invalid_arguments() {
    let env = CliTestEnv::new();

    let args = ["track", "country", "germany"];
    let output = run_bin(&env, "beacon", &args);
    assert!(
        !output.status.success(),
        "expected failure: {}",
        render("beacon", &args, &output)
    );
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("nothing queued"), "got:\n{stderr}");

    let stdout = run_ok(&env, "beacon", &["status"]);
    assert!(stdout.contains("Pending:         0"));
}

#[test]
fn id_set_patches_queued_messages() {
    let env = CliTestEnv::new();

    run_ok(&env, "beacon", &["track", "tutorial", "intro"]);
    let stdout = run_ok(&env, "beacon", &["id", "set", "custom", "user-42"]);
    assert!(stdout.contains("custom = user-42"));

    let stdout = run_ok(&env, "beacon", &["status", "--pending"]);
    assert!(stdout.contains("\"custom\": \"user-42\""), "got:\n{stdout}");

    run_ok(&env, "beacon", &["id", "clear", "custom"]);
    let stdout = run_ok(&env, "beacon", &["id", "list"]);
    assert!(!stdout.contains("user-42"));

    let args = ["id", "set", "myspace", "x"];
    let output = run_bin(&env, "beacon", &args);
    assert!(!output.status.success(), "{}", render("beacon", &args, &output));
}

#[test]
fn clear_drops_pending_messages() {
    let env = CliTestEnv::new();

    run_ok(&env, "beacon", &["track", "tutorial", "intro"]);
    run_ok(&env, "beacon", &["track", "tutorial", "outro"]);
    let stdout = run_ok(&env, "beacon", &["clear"]);
    assert!(stdout.contains("Dropped 2 pending messages"));
    assert_eq!(env.stored_messages(), 0);
}

#[test]
fn deliver_drains_queue_with_simulated_server() {
    let env = CliTestEnv::with_test_mode("simulate_server");

    for step in ["one", "two", "three"] {
        run_ok(&env, "beacon", &["track", "tutorial", step]);
    }

    let stdout = run_ok(&env, "beacon-deliver", &["--timeout-ms", "5000"]);
    assert!(stdout.contains("Delivery complete"), "got:\n{stdout}");
    assert!(stdout.contains("Messages delivered: 3"), "got:\n{stdout}");
    assert_eq!(env.stored_messages(), 0);

    let stdout = run_ok(&env, "beacon-deliver", &[]);
    assert!(stdout.contains("Nothing to deliver."));
}

#[test]
fn deliver_keeps_queue_when_offline() {
    let env = CliTestEnv::with_test_mode("simulate_offline");

    run_ok(&env, "beacon", &["track", "milestone", "boss", "defeated"]);
    run_ok(&env, "beacon", &["track", "milestone", "credits", "rolled"]);

    let args = ["--timeout-ms", "400"];
    let output = run_bin(&env, "beacon-deliver", &args);
    assert!(
        !output.status.success(),
        "expected failure: {}",
        render("beacon-deliver", &args, &output)
    );
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("2 messages still pending"), "got:\n{stderr}");
    assert!(stderr.contains("server unavailable"));

    assert_eq!(env.stored_messages(), 2);
}

#[test]
fn deliver_without_collector_does_nothing() {
    let env = CliTestEnv::new();
    run_ok(&env, "beacon", &["track", "tutorial", "intro"]);

    let stdout = run_ok(&env, "beacon-deliver", &[]);
    assert!(stdout.contains("Collector is not configured"));
    assert_eq!(env.stored_messages(), 1);
}

#[test]
fn running_deliver_owns_the_queue() {
    let env = CliTestEnv::with_test_mode("simulate_offline");
    run_ok(&env, "beacon", &["track", "tutorial", "intro"]);

    let mut watcher = command(&env, "beacon-deliver", &["--watch"])
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("failed to spawn beacon-deliver");
    let stdout = watcher.stdout.take().expect("watcher stdout");
    let mut lines = BufReader::new(stdout).lines();
    loop {
        let line = lines
            .next()
            .expect("beacon-deliver exited before watching")
            .expect("failed to read watcher output");
        if line.contains("Watch mode active") {
            break;
        }
    }

    let args = ["track", "tutorial", "outro"];
    let output = run_bin(&env, "beacon", &args);
    assert!(
        !output.status.success(),
        "expected refusal: {}",
        render("beacon", &args, &output)
    );
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("refusing to modify the queue"), "got:\n{stderr}");

    let output = run_bin(&env, "beacon", &["clear"]);
    assert!(!output.status.success());

    let output = run_bin(&env, "beacon-deliver", &[]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("owns the queue"), "got:\n{stderr}");

    let stdout = run_ok(&env, "beacon", &["status"]);
    assert!(stdout.contains("Pending:         1"), "got:\n{stdout}");

    watcher.kill().expect("failed to stop beacon-deliver");
    watcher.wait().expect("failed to reap beacon-deliver");

    run_ok(&env, "beacon", &["track", "tutorial", "outro"]);
    assert_eq!(env.stored_messages(), 2);
}
