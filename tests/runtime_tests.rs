//! Tests for the runtime lifecycle.
//!
//! Drives [`Runtime`] against an in-memory engine: state machine guards,
//! the status poll loop, stop/clean-up races, standard I/O and usage
//! accounting.

mod common;

use common::{FakeEngine, fast_tunables, init_tracing};
use futures::TryStreamExt;
use std::sync::Arc;
use std::time::Duration;
use taskbox::{
    Encoding, Error, HostConfig, NativeHypervisor, Runtime, RuntimeEvent, RuntimePayload,
    RuntimeStatus, StatsSample,
};
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

fn runtime_with(engine: &Arc<FakeEngine>, payload: RuntimePayload) -> Runtime {
    init_tracing();
    Runtime::new(
        payload,
        HostConfig {
            cpuset_cpus: "0-1".to_string(),
            memory_bytes: 1024 * 1024 * 1024,
            binds: Vec::new(),
            published_ports: vec![8080],
        },
        engine.clone(),
        Arc::new(NativeHypervisor::new()),
        fast_tunables(),
    )
}

fn runtime(engine: &Arc<FakeEngine>) -> Runtime {
    runtime_with(
        engine,
        RuntimePayload::new("taskbox/base", "latest").with_command(["sh", "-c", "cat"]),
    )
}

async fn running(engine: &Arc<FakeEngine>) -> Runtime {
    let rt = runtime(engine);
    rt.prepare().await.unwrap();
    rt.start().await.unwrap();
    rt
}

// =============================================================================
// Identity and Guards
// =============================================================================

#[tokio::test]
async fn test_id_unset_until_prepared_then_stable() {
    let engine = FakeEngine::new();
    let rt = runtime(&engine);

    assert_eq!(rt.id(), None);
    assert_eq!(rt.status(), RuntimeStatus::Created);
    assert!(rt.name().starts_with(taskbox::CONTAINER_NAME_PREFIX));

    rt.prepare().await.unwrap();
    let id = rt.id().map(str::to_string);
    assert!(id.is_some());
    assert_eq!(rt.status(), RuntimeStatus::Prepared);

    rt.start().await.unwrap();
    rt.stop().await.unwrap();
    rt.clean_up().await.unwrap();
    assert_eq!(rt.id().map(str::to_string), id);
}

#[tokio::test]
async fn test_container_config_from_payload() {
    let engine = FakeEngine::new();
    let rt = runtime_with(
        &engine,
        RuntimePayload::new("taskbox/blender", "3.6")
            .with_command(["render", "--frame", "1"])
            .with_env("SEED", "42")
            .with_user("nobody")
            .with_work_dir("/work"),
    );
    rt.prepare().await.unwrap();

    let created = engine.created();
    assert_eq!(created.len(), 1);
    let config = &created[0];
    assert_eq!(config.name, rt.name());
    assert_eq!(config.image, "taskbox/blender:3.6");
    assert_eq!(config.command, vec!["render", "--frame", "1"]);
    assert_eq!(config.env.get("SEED").map(String::as_str), Some("42"));
    assert_eq!(config.user.as_deref(), Some("nobody"));
    assert_eq!(config.working_dir.as_deref(), Some("/work"));
    assert_eq!(config.host.cpuset_cpus, "0-1");
}

#[tokio::test]
async fn test_invalid_transitions_leave_status_unchanged() {
    let engine = FakeEngine::new();
    let rt = runtime(&engine);

    let err = rt.start().await.unwrap_err();
    assert!(matches!(err, Error::InvalidState { .. }));
    assert_eq!(rt.status(), RuntimeStatus::Created);

    assert!(matches!(rt.stop().await, Err(Error::InvalidState { .. })));
    assert!(matches!(rt.clean_up().await, Err(Error::InvalidState { .. })));
    assert_eq!(rt.status(), RuntimeStatus::Created);

    rt.prepare().await.unwrap();
    assert!(matches!(rt.prepare().await, Err(Error::InvalidState { .. })));
    assert!(matches!(rt.clean_up().await, Err(Error::InvalidState { .. })));
    assert_eq!(rt.status(), RuntimeStatus::Prepared);
    assert_eq!(engine.calls("create"), 1);
}

#[tokio::test]
async fn test_prepare_failure_moves_to_failure() {
    let engine = FakeEngine::new();
    engine.fail_on("create");
    let rt = runtime(&engine);
    let mut events = rt.subscribe();

    assert!(rt.prepare().await.is_err());
    assert_eq!(rt.status(), RuntimeStatus::Failure);
    assert_eq!(rt.id(), None);
    assert!(matches!(
        events.recv().await.unwrap(),
        RuntimeEvent::ErrorOccurred(msg) if msg.starts_with("prepare")
    ));

    // Nothing was created, so clean-up has nothing to remove.
    rt.clean_up().await.unwrap();
    assert_eq!(engine.calls("remove"), 0);
}

#[tokio::test]
async fn test_attach_failure_removes_container() {
    let engine = FakeEngine::new();
    engine.fail_on("attach");
    let rt = runtime(&engine);

    assert!(rt.prepare().await.is_err());
    assert_eq!(rt.status(), RuntimeStatus::Failure);
    assert_eq!(engine.calls("remove"), 1);
    assert_eq!(engine.live_containers(), 0);
}

#[tokio::test]
async fn test_start_failure_moves_to_failure() {
    let engine = FakeEngine::new();
    engine.fail_on("start");
    let rt = runtime(&engine);
    rt.prepare().await.unwrap();

    assert!(rt.start().await.is_err());
    assert_eq!(rt.status(), RuntimeStatus::Failure);

    rt.stop().await.unwrap();
    rt.clean_up().await.unwrap();
    assert_eq!(engine.live_containers(), 0);
}

// =============================================================================
// Status Poll Loop
// =============================================================================

#[tokio::test]
async fn test_clean_exit_reaches_stopped() {
    let engine = FakeEngine::new();
    let rt = running(&engine).await;
    let mut events = rt.subscribe();
    assert_eq!(rt.status(), RuntimeStatus::Running);

    engine.exit(rt.id().unwrap(), 0);
    let status = timeout(WAIT, rt.wait_until_terminated()).await.unwrap();

    assert_eq!(status, RuntimeStatus::Stopped);
    assert_eq!(events.recv().await.unwrap(), RuntimeEvent::Stopped);
}

#[tokio::test]
async fn test_nonzero_exit_reaches_failure() {
    let engine = FakeEngine::new();
    let rt = running(&engine).await;
    let mut events = rt.subscribe();

    engine.exit(rt.id().unwrap(), 3);
    let status = timeout(WAIT, rt.wait_until_terminated()).await.unwrap();

    assert_eq!(status, RuntimeStatus::Failure);
    match events.recv().await.unwrap() {
        RuntimeEvent::ErrorOccurred(msg) => assert!(msg.contains("code 3"), "{msg}"),
        other => panic!("unexpected event {other:?}"),
    }
}

#[tokio::test]
async fn test_inspect_error_while_running_fails() {
    let engine = FakeEngine::new();
    let rt = running(&engine).await;

    engine.fail_on("inspect");
    let status = timeout(WAIT, rt.wait_until_terminated()).await.unwrap();
    assert_eq!(status, RuntimeStatus::Failure);
}

// =============================================================================
// Stop and Clean-Up
// =============================================================================

#[tokio::test]
async fn test_stop_is_not_a_failure() {
    let engine = FakeEngine::new();
    let rt = running(&engine).await;
    let mut events = rt.subscribe();

    rt.stop().await.unwrap();
    assert_eq!(rt.status(), RuntimeStatus::Stopped);
    assert_eq!(engine.calls("stop"), 1);
    assert_eq!(events.recv().await.unwrap(), RuntimeEvent::Stopped);

    // Give a late poll a chance to observe exit code 137.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(rt.status(), RuntimeStatus::Stopped);
}

#[tokio::test]
async fn test_stop_then_clean_up_closes_and_removes_once() {
    let engine = FakeEngine::new();
    let rt = running(&engine).await;
    let mut events = rt.subscribe();

    rt.stop().await.unwrap();
    rt.stop().await.unwrap();
    assert_eq!(engine.calls("stop"), 1);

    rt.clean_up().await.unwrap();
    assert_eq!(rt.status(), RuntimeStatus::CleaningUp);
    assert!(matches!(rt.clean_up().await, Err(Error::InvalidState { .. })));

    assert_eq!(engine.calls("remove"), 1);
    assert_eq!(engine.stdin_shutdowns(), 1);
    assert_eq!(engine.live_containers(), 0);

    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    assert_eq!(seen, vec![RuntimeEvent::Stopped, RuntimeEvent::TornDown]);
}

#[tokio::test]
async fn test_exit_racing_stop_and_clean_up() {
    let engine = FakeEngine::new();
    let rt = running(&engine).await;

    engine.exit(rt.id().unwrap(), 0);
    timeout(WAIT, rt.wait_until_terminated()).await.unwrap();

    rt.stop().await.unwrap();
    rt.clean_up().await.unwrap();

    assert_eq!(engine.calls("stop"), 0);
    assert_eq!(engine.calls("remove"), 1);
    assert_eq!(engine.stdin_shutdowns(), 1);
}

#[tokio::test]
async fn test_stop_error_moves_to_failure() {
    let engine = FakeEngine::new();
    let rt = running(&engine).await;

    engine.fail_on("stop");
    assert!(rt.stop().await.is_err());
    assert_eq!(rt.status(), RuntimeStatus::Failure);
    assert_eq!(engine.stdin_shutdowns(), 1);

    rt.clean_up().await.unwrap();
    assert_eq!(engine.calls("remove"), 1);
}

#[tokio::test]
async fn test_remove_error_moves_to_failure_and_can_retry() {
    let engine = FakeEngine::new();
    let rt = running(&engine).await;
    rt.stop().await.unwrap();

    engine.fail_on("remove");
    assert!(rt.clean_up().await.is_err());
    assert_eq!(rt.status(), RuntimeStatus::Failure);

    assert!(rt.clean_up().await.is_err());
    assert_eq!(engine.calls("remove"), 2);
}

// =============================================================================
// Standard I/O
// =============================================================================

#[tokio::test]
async fn test_stdin_write_and_close_on_stop() {
    let engine = FakeEngine::new();
    let rt = runtime(&engine);

    assert!(matches!(rt.stdin(Encoding::Utf8), Err(Error::InvalidState { .. })));

    rt.prepare().await.unwrap();
    let stdin = rt.stdin(Encoding::Latin1).unwrap();
    stdin.write("café\n").await.unwrap();

    rt.start().await.unwrap();
    stdin.write_bytes(b"more\n").await.unwrap();
    assert_eq!(engine.stdin_data(), b"caf\xe9\nmore\n".to_vec());

    rt.stop().await.unwrap();
    assert!(matches!(
        stdin.write("late").await,
        Err(Error::InvalidState { .. })
    ));
    assert!(matches!(rt.stdin(Encoding::Utf8), Err(Error::InvalidState { .. })));
    assert_eq!(engine.stdin_shutdowns(), 1);
}

#[tokio::test]
async fn test_explicit_stdin_close() {
    let engine = FakeEngine::new();
    let rt = running(&engine).await;

    let stdin = rt.stdin(Encoding::Utf8).unwrap();
    let clone = stdin.clone();
    stdin.close().await.unwrap();

    assert!(matches!(clone.write("x").await, Err(Error::StdinClosed(_))));

    rt.stop().await.unwrap();
    assert_eq!(engine.stdin_shutdowns(), 1);
}

#[tokio::test]
async fn test_output_lines_after_stop() {
    let engine = FakeEngine::new();
    engine.set_output(b"line one\r\nline two\n", b"oops\n");
    let rt = running(&engine).await;
    rt.stop().await.unwrap();

    let out: Vec<String> = rt
        .stdout(Encoding::Utf8)
        .await
        .unwrap()
        .try_collect()
        .await
        .unwrap();
    assert_eq!(out, vec!["line one", "line two"]);

    let err: Vec<String> = rt
        .stderr(Encoding::Utf8)
        .await
        .unwrap()
        .try_collect()
        .await
        .unwrap();
    assert_eq!(err, vec!["oops"]);
}

#[tokio::test]
async fn test_output_follows_while_running_then_buffers() {
    let engine = FakeEngine::new();
    engine.set_output(b"first\nsecond\n", b"");
    let rt = running(&engine).await;

    let mut live = rt.stdout(Encoding::Utf8).await.unwrap();
    let wait = Duration::from_secs(1);
    assert_eq!(
        timeout(wait, live.try_next()).await.unwrap().unwrap().as_deref(),
        Some("first")
    );
    assert_eq!(
        timeout(wait, live.try_next()).await.unwrap().unwrap().as_deref(),
        Some("second")
    );
    assert_eq!(engine.log_follows(), vec![true]);

    // The live stream stays open until the container exits.
    assert!(timeout(Duration::from_millis(50), live.try_next()).await.is_err());

    rt.stop().await.unwrap();
    assert_eq!(timeout(wait, live.try_next()).await.unwrap().unwrap(), None);

    let after: Vec<String> = rt
        .stdout(Encoding::Utf8)
        .await
        .unwrap()
        .try_collect()
        .await
        .unwrap();
    assert_eq!(after, vec!["first", "second"]);
    assert_eq!(engine.log_follows(), vec![true, false]);
}

#[tokio::test]
async fn test_output_requires_container() {
    let engine = FakeEngine::new();
    let rt = runtime(&engine);
    assert!(matches!(
        rt.stdout(Encoding::Utf8).await,
        Err(Error::InvalidState { .. })
    ));
}

#[tokio::test]
async fn test_port_mapping_through_native_hypervisor() {
    let engine = FakeEngine::new();
    let rt = running(&engine).await;

    let (host, port) = rt.get_port_mapping(8080).await.unwrap();
    assert_eq!(host, "127.0.0.1");
    assert_eq!(port, 48080);

    assert!(rt.get_port_mapping(9999).await.is_err());
}

// =============================================================================
// Usage Counters
// =============================================================================

fn sample(cpu: u64, memory: u64) -> StatsSample {
    StatsSample {
        cpu_total_ns: cpu,
        cpu_kernel_ns: cpu / 4,
        cpu_user_ns: cpu / 2,
        memory_bytes: memory,
    }
}

#[tokio::test]
async fn test_usage_counters_monotonic() {
    let engine = FakeEngine::new();
    engine.set_stats(vec![
        sample(1_000, 100),
        sample(2_000, 300),
        sample(3_000, 200),
        StatsSample::default(),
    ]);
    let rt = running(&engine).await;

    let mut last_max = 0;
    for _ in 0..20 {
        tokio::time::sleep(Duration::from_millis(5)).await;
        let counters = rt.usage_counter_values();
        assert!(counters.ram_max_bytes >= last_max);
        last_max = counters.ram_max_bytes;
    }

    rt.stop().await.unwrap();
    let counters = rt.usage_counter_values();
    assert_eq!(counters.ram_max_bytes, 300);
    assert_eq!(counters.ram_avg_bytes, 200);
    assert_eq!(counters.cpu_total_ns, 3_000);
    assert_eq!(counters.cpu_user_ns, 1_500);

    // The clock is frozen once the runtime stopped.
    let frozen = counters.clock_ms;
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(rt.usage_counter_values().clock_ms, frozen);
}
