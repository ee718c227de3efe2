//! End-to-end integration tests for the proxy harness
//!
//! These tests verify the complete test workflow by:
//! 1. Starting `proxy-server` on an ephemeral port
//! 2. Running `proxy-client` against it
//! 3. Checking the client's exit code and the server's shutdown

use std::env;
use std::fs;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};

use proxy_harness::common::parse_listen_address;

/// Test context with paths, the server process and cleanup
struct TestContext {
    /// Temporary directory for this test
    temp_dir: PathBuf,
    /// Path to the client binary
    client_bin: PathBuf,
    /// Path to the server binary
    server_bin: PathBuf,
    /// Directory holding Test.yaml
    schema_dir: PathBuf,
    /// Running server, if any
    server: Option<Child>,
}

impl TestContext {
    /// Create a new test context
    fn new(test_name: &str) -> Self {
        let temp_dir = env::temp_dir().join("proxy-harness-tests").join(test_name);

        // Clean up any previous test artifacts
        let _ = fs::remove_dir_all(&temp_dir);
        fs::create_dir_all(&temp_dir).expect("Failed to create temp dir");

        let schema_dir = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("schema");

        Self {
            temp_dir,
            client_bin: PathBuf::from(env!("CARGO_BIN_EXE_proxy-client")),
            server_bin: PathBuf::from(env!("CARGO_BIN_EXE_proxy-server")),
            schema_dir,
            server: None,
        }
    }

    /// Start the server on an ephemeral port and return its proxy string
    fn start_server(&mut self) -> String {
        let log_file = self.temp_dir.join("server.log");
        self.spawn_server(Some(&log_file))
    }

    /// Start the server logging to stderr only
    fn start_server_without_log_file(&mut self) -> String {
        self.spawn_server(None)
    }

    fn spawn_server(&mut self, log_file: Option<&Path>) -> String {
        let mut command = Command::new(&self.server_bin);
        command.args([
            "--endpoints",
            "tcp -h 127.0.0.1 -p 0 -t 10000",
            "--schema",
            self.schema_dir.join("Test.yaml").to_str().unwrap(),
        ]);
        if let Some(path) = log_file {
            command.args(["--log-file", path.to_str().unwrap()]);
        }

        let mut child = command
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .expect("Failed to start server");

        let stdout = child.stdout.take().expect("Server stdout not captured");
        self.server = Some(child);

        let mut reader = BufReader::new(stdout);
        let mut line = String::new();
        loop {
            line.clear();
            let read = reader.read_line(&mut line).expect("Failed to read server output");
            assert!(read > 0, "Server exited before listening");
            if let Some(endpoint) = parse_listen_address(&line) {
                return format!("test:{endpoint}");
            }
        }
    }

    /// Wait for the server to exit on its own
    fn wait_server(&mut self, timeout: Duration) -> Option<ExitStatus> {
        let child = self.server.as_mut()?;
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if let Some(status) = child.try_wait().expect("Failed to poll server") {
                self.server = None;
                return Some(status);
            }
            std::thread::sleep(Duration::from_millis(50));
        }
        None
    }

    /// Write a file into the test directory
    fn write_file(&self, name: &str, content: &str) -> PathBuf {
        let path = self.temp_dir.join(name);
        fs::write(&path, content).expect("Failed to write test file");
        path
    }

    /// Run the client with the repository's interface definitions
    fn run_client(&self, args: &[&str]) -> ClientOutput {
        let schema_arg = format!("--Test.SchemaDir={}", self.schema_dir.display());
        let mut all_args = vec![schema_arg.as_str()];
        all_args.extend_from_slice(args);
        self.run_client_raw(&all_args)
    }

    fn run_client_raw(&self, args: &[&str]) -> ClientOutput {
        let output = Command::new(&self.client_bin)
            .args(args)
            .current_dir(&self.temp_dir)
            .env_remove("RPC_CONFIG")
            .env("NO_COLOR", "1")
            .output()
            .expect("Failed to run client");

        ClientOutput {
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            code: output.status.code(),
        }
    }
}

impl Drop for TestContext {
    fn drop(&mut self) {
        if let Some(mut server) = self.server.take() {
            let _ = server.kill();
            let _ = server.wait();
        }

        // Set PRESERVE_PROXY_TEST_ARTIFACTS=1 to keep logs for debugging
        let preserve = env::var("PRESERVE_PROXY_TEST_ARTIFACTS")
            .unwrap_or_default()
            .to_ascii_lowercase();
        if !(preserve == "1" || preserve == "true" || preserve == "yes") {
            let _ = fs::remove_dir_all(&self.temp_dir);
        }
    }
}

/// Output from a client run
#[derive(Debug)]
struct ClientOutput {
    stdout: String,
    stderr: String,
    code: Option<i32>,
}

// ============== Tests ==============

#[test]
fn test_client_against_server() {
    let mut ctx = TestContext::new("client_against_server");
    let proxy = ctx.start_server();

    let output = ctx.run_client(&[&format!("--Test.Proxy={proxy}")]);
    assert_eq!(
        output.code,
        Some(0),
        "Client failed:\nstdout: {}\nstderr: {}",
        output.stdout,
        output.stderr
    );
    for section in ["stringToProxy", "checked cast", "oneway", "connection caching"] {
        assert!(
            output.stdout.contains(&format!("testing {section}... ")),
            "Missing section '{section}' in output: {}",
            output.stdout
        );
    }

    // The suite's final shutdown request stops the server
    let status = ctx
        .wait_server(Duration::from_secs(10))
        .expect("Server did not shut down");
    assert!(status.success());
}

#[test]
fn test_server_logging_to_stderr_only() {
    let mut ctx = TestContext::new("server_stderr_logging");
    let proxy = ctx.start_server_without_log_file();

    let output = ctx.run_client(&[&format!("--Test.Proxy={proxy}")]);
    assert_eq!(output.code, Some(0), "Client failed: {}", output.stderr);

    let status = ctx
        .wait_server(Duration::from_secs(10))
        .expect("Server did not shut down");
    assert!(status.success());
    assert!(!ctx.temp_dir.join("server.log").exists());
}

#[test]
fn test_properties_from_config_file() {
    let mut ctx = TestContext::new("config_file");
    let proxy = ctx.start_server();
    let config = ctx.write_file(
        "client.toml",
        &format!("[Test]\nProxy = \"{proxy}\"\n\n[Rpc.Warn]\nConnections = 1\n"),
    );

    let output = ctx.run_client(&[&format!("--Rpc.Config={}", config.display())]);
    assert_eq!(output.code, Some(0), "Client failed: {}", output.stderr);
    assert!(ctx.wait_server(Duration::from_secs(10)).is_some());
}

#[test]
fn test_unreachable_server_exits_1() {
    let ctx = TestContext::new("unreachable_server");
    let output = ctx.run_client(&["--Test.Proxy=test:tcp -h 127.0.0.1 -p 1 -t 2000"]);

    assert_eq!(output.code, Some(1));
    assert!(
        output.stderr.contains("error during test execution"),
        "Expected an execution error: {}",
        output.stderr
    );
}

#[test]
fn test_invalid_property_exits_1() {
    let ctx = TestContext::new("invalid_property");
    let output = ctx.run_client(&["--Rpc.MessageSizeMax=huge"]);

    assert_eq!(output.code, Some(1));
    assert!(
        output.stderr.contains("error during bootstrap"),
        "Expected a bootstrap error: {}",
        output.stderr
    );
    assert!(!output.stdout.contains("testing"));
}

#[test]
fn test_missing_config_file_exits_1() {
    let ctx = TestContext::new("missing_config");
    let missing = ctx.temp_dir.join("missing.toml");
    let output = ctx.run_client(&[&format!("--Rpc.Config={}", missing.display())]);

    assert_eq!(output.code, Some(1));
    assert!(output.stderr.contains("error during bootstrap"));
}

#[test]
fn test_malformed_schema_exits_1() {
    let ctx = TestContext::new("malformed_schema");
    ctx.write_file(
        "Test.yaml",
        "module: Test\ninterfaces:\n  - name: A\n    bases: [Missing]\n",
    );

    let schema_arg = format!("--Test.SchemaDir={}", ctx.temp_dir.display());
    let output = ctx.run_client_raw(&[&schema_arg]);

    assert_eq!(output.code, Some(1));
    assert!(
        output.stderr.contains("Invalid interface definition"),
        "Expected a schema error: {}",
        output.stderr
    );
}
