//! End-to-end tests of the helper strategy: engine, client and the real
//! `brood-helper` binary

#![cfg(unix)]
#![allow(unused_crate_dependencies)]

use brood_core::engine::Strategy;
use brood_core::{
    CancellationToken, CoreError, Engine, EngineConfig, ProcessFlags, ProcessOptions, Redirection,
    SpawnStrategyKind,
};
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};

fn helper_engine() -> Engine {
    let config = EngineConfig {
        strategy: SpawnStrategyKind::Helper,
        helper_path: Some(PathBuf::from(env!("CARGO_BIN_EXE_brood-helper"))),
        max_subchannels: Some(4),
        ..EngineConfig::default()
    };
    Engine::new(&config).expect("helper engine")
}

fn sh(script: &str) -> ProcessOptions {
    ProcessOptions::new("/bin/sh").args(["-c", script])
}

fn is_gone(pid: i32) -> bool {
    match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
        Err(_) => true,
        Ok(stat) => stat
            .rsplit_once(')')
            .map(|(_, rest)| rest.trim_start().starts_with('Z'))
            .unwrap_or(false),
    }
}

#[tokio::test]
async fn test_pipe_round_trip() {
    let engine = helper_engine();
    assert_eq!(engine.strategy_kind(), SpawnStrategyKind::Helper);

    let mut child = engine
        .start(
            &ProcessOptions::new("/bin/cat")
                .stdin(Redirection::Pipe)
                .stdout(Redirection::Pipe),
        )
        .await
        .unwrap();
    assert!(child.pid() > 0);

    let mut stdin = child.take_stdin().unwrap();
    stdin.write_all(b"via helper").await.unwrap();
    drop(stdin);

    let mut out = Vec::new();
    child.take_stdout().unwrap().read_to_end(&mut out).await.unwrap();
    assert_eq!(out, b"via helper");
    assert_eq!(child.wait().await.unwrap(), 0);
}

#[tokio::test]
async fn test_environment_and_exit_code() {
    let engine = helper_engine();
    let mut child = engine
        .start(
            &sh("echo \"$GREETING\"; exit 5")
                .base_environment(Vec::new())
                .env("GREETING", "hello")
                .stdout(Redirection::Pipe),
        )
        .await
        .unwrap();

    let mut out = String::new();
    child.take_stdout().unwrap().read_to_string(&mut out).await.unwrap();
    assert_eq!(out, "hello\n");
    assert_eq!(child.wait().await.unwrap(), 5);
}

#[tokio::test]
async fn test_same_file_append() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("both.log");
    std::fs::write(&path, "first\n").unwrap();

    let engine = helper_engine();
    let child = engine
        .start(
            &sh("echo out; echo err >&2")
                .stdout(Redirection::append(&path))
                .stderr(Redirection::append(&path)),
        )
        .await
        .unwrap();
    assert_eq!(child.wait().await.unwrap(), 0);

    let contents = std::fs::read_to_string(&path).unwrap();
    assert!(contents.starts_with("first\n"));
    assert!(contents.contains("out\n"));
    assert!(contents.contains("err\n"));
}

#[tokio::test]
async fn test_mixed_modes_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("mixed.log");

    let err = helper_engine()
        .start(
            &sh("true")
                .stdout(Redirection::append(&path))
                .stderr(Redirection::file(&path)),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::ValidationError(_)));
    assert!(!path.exists());
}

#[tokio::test]
async fn test_spawn_failure_is_not_a_crash() {
    let engine = helper_engine();
    let err = engine
        .start(&ProcessOptions::new("/definitely/not/here"))
        .await
        .unwrap_err();
    assert_eq!(err.errno(), Some(2));
    assert!(!err.is_helper_crashed());

    // The helper keeps serving
    let child = engine.start(&ProcessOptions::new("/bin/true")).await.unwrap();
    assert_eq!(child.wait().await.unwrap(), 0);
}

#[tokio::test]
async fn test_kill_reaches_whole_tree() {
    let engine = helper_engine();
    let mut child = engine
        .start(&sh("sleep 30 & echo $!; wait").stdout(Redirection::Pipe))
        .await
        .unwrap();

    let mut lines = BufReader::new(child.take_stdout().unwrap()).lines();
    let grandchild: i32 = lines.next_line().await.unwrap().unwrap().trim().parse().unwrap();

    child.kill().await.unwrap();
    assert_eq!(child.wait().await.unwrap(), 137);

    let start = Instant::now();
    while !is_gone(grandchild) && start.elapsed() < Duration::from_secs(5) {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(is_gone(grandchild));
    child.kill().await.unwrap();
}

#[tokio::test]
async fn test_interrupt_and_termination() {
    let engine = helper_engine();

    let mut child = engine
        .start(
            &sh("trap 'exit 42' INT; echo ready; while :; do sleep 0.1; done")
                .stdout(Redirection::Pipe),
        )
        .await
        .unwrap();
    let mut lines = BufReader::new(child.take_stdout().unwrap()).lines();
    assert_eq!(lines.next_line().await.unwrap().as_deref(), Some("ready"));
    child.signal_interrupt().await.unwrap();
    assert_eq!(child.wait().await.unwrap(), 42);

    let mut child = engine
        .start(&sh("echo ready; sleep 30").stdout(Redirection::Pipe))
        .await
        .unwrap();
    let mut lines = BufReader::new(child.take_stdout().unwrap()).lines();
    assert_eq!(lines.next_line().await.unwrap().as_deref(), Some("ready"));
    child.signal_termination().await.unwrap();
    assert_eq!(child.wait().await.unwrap(), 143);
    assert!(child.signal_interrupt().await.is_err());
}

#[tokio::test]
async fn test_attached_child_cannot_be_interrupted() {
    let child = helper_engine()
        .start(
            &ProcessOptions::new("/bin/sleep")
                .arg("30")
                .flags(ProcessFlags::ATTACH_TO_CURRENT_CONSOLE | ProcessFlags::ENABLE_HANDLE_EXPORT),
        )
        .await
        .unwrap();
    assert!(!child.can_signal());
    assert!(matches!(
        child.signal_termination().await,
        Err(CoreError::InvalidState(_))
    ));

    let handles = child.raw_handles().unwrap();
    assert_eq!(handles.pid, child.pid());
    assert_eq!(handles.pidfd, None);

    child.kill().await.unwrap();
    assert_eq!(child.wait().await.unwrap(), 137);
}

#[tokio::test]
async fn test_wait_cancel_then_exit() {
    let engine = helper_engine();
    let child = engine
        .start(&ProcessOptions::new("/bin/sleep").arg("30"))
        .await
        .unwrap();

    assert!(!child
        .wait_for_exit_async(Some(Duration::from_millis(50)), &CancellationToken::new())
        .await
        .unwrap());

    let cancel = CancellationToken::new();
    cancel.cancel();
    assert!(matches!(
        child.wait_for_exit_async(None, &cancel).await,
        Err(CoreError::Canceled)
    ));

    child.kill().await.unwrap();
    assert!(child.wait_for_exit(Some(Duration::from_secs(10))).unwrap());
    assert_eq!(child.exit_code().unwrap(), 137);
    assert_eq!(engine.scheduler().registrations(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_many_concurrent_children() {
    let engine = helper_engine();
    let start = Instant::now();

    let mut tasks = Vec::new();
    for _ in 0..128 {
        let engine = engine.clone();
        tasks.push(tokio::spawn(async move {
            let child = engine
                .start(&ProcessOptions::new("/bin/sleep").arg("2"))
                .await?;
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
    assert!(elapsed < Duration::from_secs(5), "waits took {elapsed:?}");
    assert_eq!(engine.scheduler().registrations(), 0);

    let Strategy::Helper(backend) = engine.strategy() else {
        panic!("expected helper strategy");
    };
    assert!(backend.table().is_empty());
}

async fn grandchild_of(child: &mut brood_core::ChildProcess) -> i32 {
    let mut lines = BufReader::new(child.take_stdout().unwrap()).lines();
    lines
        .next_line()
        .await
        .unwrap()
        .expect("grandchild pid")
        .trim()
        .parse()
        .unwrap()
}

async fn wait_until_gone(pid: i32) -> bool {
    let start = Instant::now();
    while start.elapsed() < Duration::from_secs(5) {
        if is_gone(pid) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

#[tokio::test]
async fn test_kill_after_lead_exit_reaches_leftovers() {
    let engine = helper_engine();
    let mut child = engine
        .start(&sh("sleep 30 & echo $!").stdout(Redirection::Pipe))
        .await
        .unwrap();
    let grandchild = grandchild_of(&mut child).await;
    assert_eq!(child.wait().await.unwrap(), 0);
    assert!(!is_gone(grandchild));

    child.kill().await.unwrap();
    assert!(wait_until_gone(grandchild).await);
    child.kill().await.unwrap();
}

#[tokio::test]
async fn test_drop_after_lead_exit_kills_leftovers() {
    let engine = helper_engine();
    let mut child = engine
        .start(&sh("sleep 30 & echo $!").stdout(Redirection::Pipe))
        .await
        .unwrap();
    let grandchild = grandchild_of(&mut child).await;
    assert_eq!(child.wait().await.unwrap(), 0);
    assert!(!is_gone(grandchild));

    drop(child);
    assert!(wait_until_gone(grandchild).await);
}

#[tokio::test]
async fn test_helper_crash_fails_pending_waits() {
    let engine = helper_engine();
    let Strategy::Helper(backend) = engine.strategy() else {
        panic!("expected helper strategy");
    };
    let child = engine
        .start(&ProcessOptions::new("/bin/sleep").arg("2"))
        .await
        .unwrap();

    nix::sys::signal::kill(
        nix::unistd::Pid::from_raw(backend.helper_pid() as i32),
        nix::sys::signal::Signal::SIGKILL,
    )
    .unwrap();

    let err = tokio::time::timeout(Duration::from_secs(6), child.wait())
        .await
        .expect("wait hung after helper crash")
        .unwrap_err();
    assert!(err.is_helper_crashed());
    assert!(backend.table().is_empty());

    // Later waits and queries fail immediately
    let err = tokio::time::timeout(
        Duration::from_secs(1),
        child.wait_for_exit_async(None, &CancellationToken::new()),
    )
    .await
    .expect("second wait hung")
    .unwrap_err();
    assert!(err.is_helper_crashed());
    assert!(child.wait_for_exit(None).unwrap_err().is_helper_crashed());
    assert!(child.has_exited().unwrap_err().is_helper_crashed());
    assert!(child.exit_code().unwrap_err().is_helper_crashed());
    assert_eq!(engine.scheduler().registrations(), 0);
}

#[tokio::test]
async fn test_helper_crash_is_reported() {
    let engine = helper_engine();
    let Strategy::Helper(backend) = engine.strategy() else {
        panic!("expected helper strategy");
    };

    // Warm up one subchannel
    let child = engine.start(&ProcessOptions::new("/bin/true")).await.unwrap();
    assert_eq!(child.wait().await.unwrap(), 0);

    nix::sys::signal::kill(
        nix::unistd::Pid::from_raw(backend.helper_pid() as i32),
        nix::sys::signal::Signal::SIGKILL,
    )
    .unwrap();

    let start = Instant::now();
    while !backend.is_crashed() && start.elapsed() < Duration::from_secs(5) {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(backend.is_crashed());
    assert!(backend.table().is_helper_lost());

    let err = engine
        .start(&ProcessOptions::new("/bin/true"))
        .await
        .unwrap_err();
    assert!(err.is_helper_crashed());
}
