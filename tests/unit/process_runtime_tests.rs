#![cfg(unix)]

use muster::config::stack::{Launch, ServiceSpec};
use muster::runtime::{ProcessExit, ProcessRuntime, ServiceRuntime};
use std::time::Duration;
use tokio::time::timeout;

fn command(name: &str, line: &str) -> ServiceSpec {
    ServiceSpec::new(name, Launch::Command(line.to_string()))
}

#[tokio::test]
async fn reports_exit_codes() {
    let runtime = ProcessRuntime::default();
    runtime
        .start(&command("job", "exit 7"))
        .await
        .expect("spawn job");

    let exit = timeout(Duration::from_secs(5), runtime.wait_exit("job"))
        .await
        .expect("job exits");
    assert_eq!(exit, ProcessExit::with_code(7));
    assert!(!runtime.is_running("job").await);
}

#[tokio::test]
async fn stop_terminates_a_long_running_service() {
    let runtime = ProcessRuntime::default();
    runtime
        .start(&command("sleeper", "sleep 30"))
        .await
        .expect("spawn sleeper");
    assert!(runtime.is_running("sleeper").await);

    timeout(Duration::from_secs(5), runtime.stop("sleeper"))
        .await
        .expect("stop completes")
        .expect("stop succeeds");

    assert!(!runtime.is_running("sleeper").await);
    let exit = runtime.wait_exit("sleeper").await;
    assert!(!exit.success());
}

#[tokio::test]
async fn refuses_to_start_a_running_service_twice() {
    let runtime = ProcessRuntime::default();
    let spec = command("sleeper", "sleep 30");
    runtime.start(&spec).await.expect("first start");
    assert!(runtime.start(&spec).await.is_err());
    runtime.stop("sleeper").await.expect("stop");

    runtime.start(&spec).await.expect("restart after stop");
    runtime.stop("sleeper").await.expect("stop");
}

#[tokio::test]
async fn passes_environment_and_working_dir() {
    let dir = tempfile::tempdir().expect("temp dir");
    let mut spec = command("writer", "printf '%s' \"$GREETING\" > out.txt");
    spec.environment
        .insert("GREETING".to_string(), "hello".to_string());
    spec.working_dir = Some(dir.path().to_path_buf());

    let runtime = ProcessRuntime::default();
    runtime.start(&spec).await.expect("spawn writer");
    let exit = timeout(Duration::from_secs(5), runtime.wait_exit("writer"))
        .await
        .expect("writer exits");
    assert!(exit.success());

    let written = std::fs::read_to_string(dir.path().join("out.txt")).expect("output file");
    assert_eq!(written, "hello");
}

#[tokio::test]
async fn unknown_services_are_harmless() {
    let runtime = ProcessRuntime::default();
    runtime.stop("ghost").await.expect("stop is a no-op");
    assert!(!runtime.is_running("ghost").await);
    assert_eq!(runtime.wait_exit("ghost").await, ProcessExit::signalled());
}

#[tokio::test]
async fn missing_container_cli_fails_to_start() {
    let runtime = ProcessRuntime::new("muster-no-such-container-cli");
    let spec = ServiceSpec::new("db", Launch::Image("postgres:16".to_string()));
    let err = runtime.start(&spec).await.expect_err("cli is missing");
    assert!(err.to_string().contains("failed to spawn image `postgres:16`"));
}

#[cfg(target_os = "linux")]
fn process_gone(pid: &str) -> bool {
    // Orphans may linger as zombies when nothing reaps them.
    match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
        Ok(stat) => stat
            .rsplit_once(") ")
            .is_some_and(|(_, rest)| rest.starts_with('Z')),
        Err(_) => true,
    }
}

#[cfg(target_os = "linux")]
#[tokio::test]
async fn stop_reaches_processes_forked_by_the_shell() {
    let dir = tempfile::tempdir().expect("temp dir");
    let mut spec = command("forker", "sleep 30 & echo $! > child.pid; wait");
    spec.working_dir = Some(dir.path().to_path_buf());

    let runtime = ProcessRuntime::default();
    runtime.start(&spec).await.expect("spawn forker");

    let pid_file = dir.path().join("child.pid");
    let pid = timeout(Duration::from_secs(5), async {
        loop {
            if let Ok(pid) = std::fs::read_to_string(&pid_file) {
                if !pid.trim().is_empty() {
                    return pid.trim().to_string();
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("background child recorded");
    assert!(!process_gone(&pid));

    timeout(Duration::from_secs(5), runtime.stop("forker"))
        .await
        .expect("stop completes")
        .expect("stop succeeds");

    timeout(Duration::from_secs(5), async {
        while !process_gone(&pid) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("background child terminated with its shell");
}
