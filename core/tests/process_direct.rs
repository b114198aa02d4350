//! Integration tests for the direct spawn strategy
//!
//! These tests run real programs (`/bin/sh`, `/bin/cat`, `sleep`) and
//! verify that the engine:
//! - Wires pipes, files and the null device to the child's stdio
//! - Builds the child's environment and working directory
//! - Kills whole process trees
//! - Delivers interrupt and termination to isolated children
//! - Waits for many children concurrently

#![cfg(target_os = "linux")]
#![allow(unused_crate_dependencies)]

use brood_core::{
    CancellationToken, CoreError, Engine, EngineConfig, ProcessFlags, ProcessOptions, Redirection,
    SpawnStrategyKind,
};
use std::ffi::OsString;
use std::os::unix::ffi::OsStringExt;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};

fn engine() -> Engine {
    let config = EngineConfig {
        strategy: SpawnStrategyKind::Direct,
        ..EngineConfig::default()
    };
    Engine::new(&config).expect("direct engine")
}

const SLEEP: &str = "/bin/sleep";

fn sh(script: &str) -> ProcessOptions {
    ProcessOptions::new("/bin/sh").args(["-c", script])
}

/// Whether `pid` no longer runs (gone, or a zombie awaiting its reaper)
fn is_gone(pid: i32) -> bool {
    match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
        Err(_) => true,
        Ok(stat) => stat
            .rsplit_once(')')
            .map(|(_, rest)| rest.trim_start().starts_with('Z'))
            .unwrap_or(false),
    }
}

fn wait_until_gone(pid: i32, limit: Duration) -> bool {
    let start = Instant::now();
    while start.elapsed() < limit {
        if is_gone(pid) {
            return true;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    is_gone(pid)
}

#[tokio::test]
async fn test_pipe_round_trip() {
    let mut child = engine()
        .start(
            &ProcessOptions::new("/bin/cat")
                .stdin(Redirection::Pipe)
                .stdout(Redirection::Pipe),
        )
        .await
        .expect("spawn cat");

    let mut stdin = child.take_stdin().expect("stdin pipe");
    let mut stdout = child.take_stdout().expect("stdout pipe");
    assert!(child.take_stdin().is_none());

    stdin.write_all(b"hello through cat\n").await.unwrap();
    drop(stdin);

    let mut output = Vec::new();
    stdout.read_to_end(&mut output).await.unwrap();
    assert_eq!(output, b"hello through cat\n");
    assert_eq!(child.wait().await.unwrap(), 0);
}

#[tokio::test]
async fn test_separate_stdout_and_stderr_pipes() {
    let mut child = engine()
        .start(
            &sh("echo out; echo err >&2; exit 3")
                .stdout(Redirection::Pipe)
                .stderr(Redirection::Pipe),
        )
        .await
        .unwrap();

    let mut out = String::new();
    let mut err = String::new();
    child.take_stdout().unwrap().read_to_string(&mut out).await.unwrap();
    child.take_stderr().unwrap().read_to_string(&mut err).await.unwrap();
    assert_eq!(out, "out\n");
    assert_eq!(err, "err\n");
    assert_eq!(child.wait().await.unwrap(), 3);
    assert_eq!(child.exit_code().unwrap(), 3);
}

#[tokio::test]
async fn test_same_file_append() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("log.txt");
    std::fs::write(&path, "start\n").unwrap();

    let child = engine()
        .start(
            &sh("echo out; echo err >&2")
                .stdout(Redirection::append(&path))
                .stderr(Redirection::append(&path)),
        )
        .await
        .unwrap();
    assert_eq!(child.wait().await.unwrap(), 0);

    let contents = std::fs::read_to_string(&path).unwrap();
    assert!(contents.starts_with("start\n"));
    assert!(contents.contains("out\n"));
    assert!(contents.contains("err\n"));
}

#[tokio::test]
async fn test_mixed_append_modes_rejected_before_spawn() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("never-created.txt");

    let err = engine()
        .start(
            &sh("echo hi")
                .stdout(Redirection::file(&path))
                .stderr(Redirection::append(&path)),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::ValidationError(_)));
    assert!(!path.exists());
}

#[tokio::test]
async fn test_file_truncates_and_null_discards() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("out.txt");
    std::fs::write(&path, "old contents that are longer\n").unwrap();

    let child = engine()
        .start(
            &sh("echo new; echo dropped >&2")
                .stdout(Redirection::file(&path))
                .stderr(Redirection::Null),
        )
        .await
        .unwrap();
    assert_eq!(child.wait().await.unwrap(), 0);
    assert_eq!(std::fs::read_to_string(&path).unwrap(), "new\n");
}

#[tokio::test]
async fn test_environment_and_working_directory() {
    let dir = tempfile::tempdir().unwrap();
    let mut child = engine()
        .start(
            &sh("echo \"$FOO:$HOME:$(pwd)\"")
                .flags(ProcessFlags::DISABLE_ENVIRONMENT_INHERITANCE)
                .env("FOO", "bar")
                .working_directory(dir.path())
                .stdout(Redirection::Pipe),
        )
        .await
        .unwrap();

    let mut out = String::new();
    child.take_stdout().unwrap().read_to_string(&mut out).await.unwrap();
    let expected_dir = dir.path().canonicalize().unwrap();
    assert_eq!(out, format!("bar::{}\n", expected_dir.display()));
    assert_eq!(child.wait().await.unwrap(), 0);
}

#[tokio::test]
async fn test_missing_program_reports_errno() {
    let err = engine()
        .start(&ProcessOptions::new("/definitely/not/here"))
        .await
        .unwrap_err();
    assert_eq!(err.errno(), Some(libc::ENOENT));
    assert!(!err.is_helper_crashed());
}

#[tokio::test]
async fn test_missing_working_directory_reports_errno() {
    let err = engine()
        .start(&ProcessOptions::new("/bin/true").working_directory("/definitely/not/here"))
        .await
        .unwrap_err();
    assert_eq!(err.errno(), Some(libc::ENOENT));
}

#[tokio::test]
async fn test_signal_exit_code() {
    let child = engine().start(&sh("kill -9 $$")).await.unwrap();
    assert_eq!(child.wait().await.unwrap(), 137);
}

#[tokio::test]
async fn test_kill_reaches_whole_tree() {
    let mut child = engine()
        .start(&sh("sleep 30 & echo $!; wait").stdout(Redirection::Pipe))
        .await
        .unwrap();

    let mut lines = BufReader::new(child.take_stdout().unwrap()).lines();
    let grandchild: i32 = lines
        .next_line()
        .await
        .unwrap()
        .expect("grandchild pid")
        .trim()
        .parse()
        .unwrap();
    assert!(!is_gone(grandchild));

    child.kill().await.unwrap();
    assert_eq!(child.wait().await.unwrap(), 137);
    assert!(wait_until_gone(grandchild, Duration::from_secs(5)));

    // Killing an exited process is not an error
    child.kill().await.unwrap();
}

#[tokio::test]
async fn test_kill_after_lead_exit_reaches_leftovers() {
    let mut child = engine()
        .start(&sh("sleep 30 & echo $!").stdout(Redirection::Pipe))
        .await
        .unwrap();

    let mut lines = BufReader::new(child.take_stdout().unwrap()).lines();
    let grandchild: i32 = lines
        .next_line()
        .await
        .unwrap()
        .expect("grandchild pid")
        .trim()
        .parse()
        .unwrap();
    assert_eq!(child.wait().await.unwrap(), 0);
    assert!(!is_gone(grandchild));

    child.kill().await.unwrap();
    assert!(wait_until_gone(grandchild, Duration::from_secs(5)));
    assert_eq!(child.exit_code().unwrap(), 0);
}

#[tokio::test]
async fn test_kill_after_wait_is_harmless() {
    let child = engine().start(&ProcessOptions::new("/bin/true")).await.unwrap();
    assert_eq!(child.wait().await.unwrap(), 0);
    child.kill().await.unwrap();
    child.kill().await.unwrap();
    assert_eq!(child.exit_code().unwrap(), 0);
}

#[tokio::test]
async fn test_non_utf8_environment_inherited() {
    std::env::set_var("BROOD_LATIN1", OsString::from_vec(b"caf\xe9".to_vec()));
    let mut child = engine()
        .start(&sh("printf '%s' \"${BROOD_LATIN1-UNSET}\"").stdout(Redirection::Pipe))
        .await
        .unwrap();
    let mut out = Vec::new();
    child.take_stdout().unwrap().read_to_end(&mut out).await.unwrap();
    assert_eq!(child.wait().await.unwrap(), 0);
    assert_eq!(out, b"caf\xe9");
}

#[tokio::test]
async fn test_interrupt_isolated_child() {
    let mut child = engine()
        .start(
            &sh("trap 'exit 42' INT; echo ready; while :; do sleep 0.1; done")
                .stdout(Redirection::Pipe),
        )
        .await
        .unwrap();
    assert!(child.can_signal());

    let mut lines = BufReader::new(child.take_stdout().unwrap()).lines();
    assert_eq!(lines.next_line().await.unwrap().as_deref(), Some("ready"));

    child.signal_interrupt().await.unwrap();
    let exited = child
        .wait_for_exit_async(Some(Duration::from_secs(10)), &CancellationToken::new())
        .await
        .unwrap();
    assert!(exited);
    assert_eq!(child.exit_code().unwrap(), 42);
}

#[tokio::test]
async fn test_termination_hangs_up_isolated_child() {
    let mut child = engine()
        .start(&sh("echo ready; sleep 30").stdout(Redirection::Pipe))
        .await
        .unwrap();

    let mut lines = BufReader::new(child.take_stdout().unwrap()).lines();
    assert_eq!(lines.next_line().await.unwrap().as_deref(), Some("ready"));

    child.signal_termination().await.unwrap();
    let exited = child
        .wait_for_exit_async(Some(Duration::from_secs(10)), &CancellationToken::new())
        .await
        .unwrap();
    assert!(exited);
    assert_ne!(child.exit_code().unwrap(), 0);

    // No terminal left to signal through
    assert!(child.signal_interrupt().await.is_err());
}

#[tokio::test]
async fn test_attached_child_rejects_interrupt() {
    let child = engine()
        .start(&ProcessOptions::new("sleep").arg("30").flags(ProcessFlags::ATTACH_TO_CURRENT_CONSOLE))
        .await;
    // Bare names are not searched on PATH
    assert!(child.is_err());

    let child = engine()
        .start(
            &ProcessOptions::new(SLEEP)
                .arg("30")
                .flags(ProcessFlags::ATTACH_TO_CURRENT_CONSOLE),
        )
        .await
        .unwrap();
    assert!(!child.can_signal());
    let err = child.signal_interrupt().await.unwrap_err();
    assert!(matches!(err, CoreError::InvalidState(_)));
    child.kill().await.unwrap();
    assert_eq!(child.wait().await.unwrap(), 137);
}

#[tokio::test]
async fn test_wait_timeout_and_cancel() {
    let child = engine()
        .start(&ProcessOptions::new(SLEEP).arg("30"))
        .await
        .unwrap();

    let timed_out = child
        .wait_for_exit_async(Some(Duration::from_millis(100)), &CancellationToken::new())
        .await
        .unwrap();
    assert!(!timed_out);
    assert!(!child.has_exited().unwrap());
    assert!(child.exit_code().is_err());

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });
    let err = child.wait_for_exit_async(None, &cancel).await.unwrap_err();
    assert!(matches!(err, CoreError::Canceled));

    child.kill().await.unwrap();
    assert_eq!(child.wait().await.unwrap(), 137);
}

#[tokio::test]
async fn test_exited_child_waits_without_registering() {
    let engine = engine();
    let child = engine.start(&ProcessOptions::new("/bin/true")).await.unwrap();
    assert!(child.wait_for_exit(Some(Duration::from_secs(5))).unwrap());
    assert_eq!(child.exit_code().unwrap(), 0);

    let cancel = CancellationToken::new();
    cancel.cancel();
    assert!(child.wait_for_exit_async(None, &cancel).await.unwrap());
    assert_eq!(engine.scheduler().registrations(), 0);
}

#[tokio::test]
async fn test_drop_kills_child() {
    let child = engine()
        .start(
            &ProcessOptions::new(SLEEP)
                .arg("30")
                .flags(ProcessFlags::ENABLE_HANDLE_EXPORT),
        )
        .await
        .unwrap();
    let handles = child.raw_handles().unwrap();
    assert_eq!(handles.pid, handles.pgid);
    assert!(handles.pidfd.is_some());

    drop(child);
    assert!(wait_until_gone(handles.pid, Duration::from_secs(5)));
}

#[tokio::test]
async fn test_disable_kill_on_dispose() {
    let child = engine()
        .start(
            &ProcessOptions::new(SLEEP)
                .arg("30")
                .flags(ProcessFlags::DISABLE_KILL_ON_DISPOSE),
        )
        .await
        .unwrap();
    let pid = child.pid();
    assert!(child.raw_handles().is_err());

    drop(child);
    std::thread::sleep(Duration::from_millis(200));
    assert!(!is_gone(pid));
    nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), nix::sys::signal::Signal::SIGKILL)
        .unwrap();
    assert!(wait_until_gone(pid, Duration::from_secs(5)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_many_concurrent_children() {
    let engine = engine();
    let start = Instant::now();
    let mut tasks = Vec::new();
    for _ in 0..128 {
        let engine = engine.clone();
        tasks.push(tokio::spawn(async move {
            let child = engine.start(&ProcessOptions::new(SLEEP).arg("2")).await?;
            let exited = child
                .wait_for_exit_async(Some(Duration::from_secs(10)), &CancellationToken::new())
                .await?;
            Ok::<_, CoreError>((exited, child.exit_code()?))
        }));
    }
    for task in tasks {
        assert_eq!(task.await.unwrap().unwrap(), (true, 0));
    }
    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_secs(2), "finished in {elapsed:?}");
    assert!(elapsed < Duration::from_secs(4), "waits took {elapsed:?}");
    assert_eq!(engine.scheduler().registrations(), 0);
}
