//! Process sandbox under timeouts and cancellation.

#![cfg(unix)]

use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};

use planrun::core::cancel::CancelToken;
use planrun::io::sandbox::{ProcessSandbox, Sandbox, SandboxError, SandboxRequest};

fn sandbox() -> ProcessSandbox {
    ProcessSandbox::new(vec!["sh".to_string()], "main.sh", 64 * 1024)
}

fn request(workspace: &Path, code: &str, timeout_secs: u64) -> SandboxRequest {
    SandboxRequest {
        code: code.to_string(),
        workspace: workspace.to_path_buf(),
        data_dir: None,
        memory_mb: 512,
        network_disabled: false,
        timeout: Duration::from_secs(timeout_secs),
    }
}

#[test]
fn infinite_loop_is_stopped_and_sandbox_stays_usable() {
    let temp = tempfile::tempdir().expect("tempdir");
    let sandbox = sandbox();

    let started = Instant::now();
    let result = sandbox
        .run(&request(temp.path(), "while :; do :; done\n", 2), &CancelToken::new())
        .expect("run");
    let elapsed = started.elapsed();

    assert!(result.timed_out);
    assert!(!result.succeeded(false));
    assert!(elapsed >= Duration::from_secs(2));
    assert!(elapsed < Duration::from_secs(7), "took {elapsed:?}");
    assert!(result.failure_report().contains("Timed out"));

    let next = sandbox
        .run(&request(temp.path(), "echo still here\n", 5), &CancelToken::new())
        .expect("second run");
    assert!(next.succeeded(false));
    assert_eq!(next.stdout, "still here\n");
}

#[test]
fn background_children_do_not_outlive_the_timeout() {
    let temp = tempfile::tempdir().expect("tempdir");
    let started = Instant::now();
    let result = sandbox()
        .run(
            &request(temp.path(), "sleep 60 &\nsleep 60\n", 1),
            &CancelToken::new(),
        )
        .expect("run");

    assert!(result.timed_out);
    assert!(started.elapsed() < Duration::from_secs(6));
}

#[test]
fn cancellation_stops_a_running_snippet() {
    let temp = tempfile::tempdir().expect("tempdir");
    let cancel = CancelToken::new();
    let trigger = cancel.clone();
    let handle = thread::spawn(move || {
        thread::sleep(Duration::from_millis(300));
        trigger.cancel();
    });

    let started = Instant::now();
    let result = sandbox()
        .run(&request(temp.path(), "sleep 60\n", 30), &cancel)
        .expect("run");
    handle.join().expect("join");

    assert!(result.cancelled);
    assert!(!result.timed_out);
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[test]
fn missing_interpreter_is_a_launch_error() {
    let temp = tempfile::tempdir().expect("tempdir");
    let sandbox = ProcessSandbox::new(
        vec!["planrun-no-such-interpreter".to_string()],
        "main.py",
        1024,
    );
    let err = sandbox
        .run(&request(temp.path(), "print(1)", 5), &CancelToken::new())
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<SandboxError>(),
        Some(SandboxError::Launch { .. })
    ));
}

#[test]
fn workspaces_are_isolated_per_request() {
    let temp = tempfile::tempdir().expect("tempdir");
    let a = temp.path().join("nodes").join("a");
    let b = temp.path().join("nodes").join("b");
    let sandbox = sandbox();

    let first = sandbox
        .run(&request(&a, "echo 1 > out.txt\n", 5), &CancelToken::new())
        .expect("run a");
    let second = sandbox
        .run(&request(&b, "ls\n", 5), &CancelToken::new())
        .expect("run b");

    assert_eq!(first.generated_files, vec![Path::new("out.txt").to_path_buf()]);
    assert!(second.generated_files.is_empty());
    assert_eq!(second.stdout, "");
}
