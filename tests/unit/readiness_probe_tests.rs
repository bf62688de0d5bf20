#[path = "../support/mod.rs"]
mod support;

use httpmock::prelude::*;
use muster::config::stack::{ProbeCheck, ProbeSpec};
use muster::readiness::{ProbeError, ProbeOutcome, ProbeRunner, Prober, SystemProber};
use std::time::{Duration, Instant};
use support::mocks::MockProber;
use tokio_util::sync::CancellationToken;

fn probe(retries: u32, interval: Duration) -> ProbeSpec {
    let mut spec = support::fast_probe(retries);
    spec.interval = interval;
    spec
}

#[tokio::test]
async fn passes_on_first_successful_attempt() {
    let prober = MockProber::default();
    let spec = probe(3, Duration::from_millis(5));

    let outcome = ProbeRunner::new("db", &spec, &prober)
        .run(&CancellationToken::new())
        .await;

    assert_eq!(outcome, ProbeOutcome::Healthy { attempts: 1 });
    assert_eq!(prober.attempts("db"), 1);
}

#[tokio::test]
async fn recovers_after_failed_attempts() {
    let prober = MockProber::default();
    prober.script(
        "db",
        [
            Err(ProbeError::Connect("connection refused".to_string())),
            Err(ProbeError::Connect("connection refused".to_string())),
        ],
    );
    let spec = probe(3, Duration::from_millis(5));

    let outcome = ProbeRunner::new("db", &spec, &prober)
        .run(&CancellationToken::new())
        .await;

    assert_eq!(outcome, ProbeOutcome::Healthy { attempts: 3 });
}

#[tokio::test]
async fn fails_after_exactly_retries_attempts() {
    let prober = MockProber::default();
    prober.fail_always("db");
    let spec = probe(4, Duration::from_millis(5));

    let outcome = ProbeRunner::new("db", &spec, &prober)
        .run(&CancellationToken::new())
        .await;

    assert_eq!(
        outcome,
        ProbeOutcome::Failed {
            attempts: 4,
            last_error: ProbeError::CommandFailed("exit code 1".to_string()),
        }
    );
    assert_eq!(prober.attempts("db"), 4);
}

#[tokio::test]
async fn no_interval_is_slept_after_the_final_attempt() {
    let prober = MockProber::default();
    prober.fail_always("db");
    let spec = probe(1, Duration::from_secs(5));

    let started = Instant::now();
    let outcome = ProbeRunner::new("db", &spec, &prober)
        .run(&CancellationToken::new())
        .await;

    assert!(matches!(outcome, ProbeOutcome::Failed { attempts: 1, .. }));
    assert!(started.elapsed() < Duration::from_secs(2));
}

#[tokio::test]
async fn slow_attempts_time_out() {
    let prober = MockProber::default();
    prober.delay("db", Duration::from_secs(2));
    let mut spec = probe(2, Duration::from_millis(5));
    spec.timeout = Duration::from_millis(20);

    let outcome = ProbeRunner::new("db", &spec, &prober)
        .run(&CancellationToken::new())
        .await;

    assert_eq!(
        outcome,
        ProbeOutcome::Failed {
            attempts: 2,
            last_error: ProbeError::TimedOut {
                after: Duration::from_millis(20),
            },
        }
    );
}

#[tokio::test]
async fn cancellation_interrupts_the_interval() {
    let prober = MockProber::default();
    prober.fail_always("db");
    let spec = probe(5, Duration::from_secs(30));
    let cancel = CancellationToken::new();

    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let outcome = ProbeRunner::new("db", &spec, &prober).run(&cancel).await;
    assert_eq!(outcome, ProbeOutcome::Cancelled { attempts: 1 });
}

#[tokio::test]
async fn start_period_delays_the_first_attempt() {
    let prober = MockProber::default();
    let mut spec = probe(1, Duration::from_millis(5));
    spec.start_period = Duration::from_millis(60);

    let started = Instant::now();
    let outcome = ProbeRunner::new("db", &spec, &prober)
        .run(&CancellationToken::new())
        .await;

    assert_eq!(outcome, ProbeOutcome::Healthy { attempts: 1 });
    assert!(started.elapsed() >= Duration::from_millis(60));
}

#[tokio::test]
async fn http_probe_accepts_success_and_rejects_other_statuses() {
    let server = MockServer::start_async().await;
    let healthy = server
        .mock_async(|when, then| {
            when.method(GET).path("/health");
            then.status(200);
        })
        .await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/broken");
            then.status(503);
        })
        .await;

    let prober = SystemProber::new().expect("probe client");
    let ok = ProbeCheck::Http {
        url: server.url("/health"),
        expected_status: None,
    };
    let broken = ProbeCheck::Http {
        url: server.url("/broken"),
        expected_status: None,
    };

    assert_eq!(prober.check("api", &ok).await, Ok(()));
    assert_eq!(
        prober.check("api", &broken).await,
        Err(ProbeError::UnexpectedStatus { status: 503 })
    );
    healthy.assert_hits_async(1).await;
}

#[tokio::test]
async fn http_probe_honours_expected_status() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/ping");
            then.status(204);
        })
        .await;

    let prober = SystemProber::new().expect("probe client");
    let exact = ProbeCheck::Http {
        url: server.url("/ping"),
        expected_status: Some(204),
    };
    let mismatch = ProbeCheck::Http {
        url: server.url("/ping"),
        expected_status: Some(200),
    };

    assert_eq!(prober.check("api", &exact).await, Ok(()));
    assert_eq!(
        prober.check("api", &mismatch).await,
        Err(ProbeError::UnexpectedStatus { status: 204 })
    );
}

#[tokio::test]
async fn tcp_probe_needs_a_listener() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let address = listener.local_addr().expect("local addr").to_string();
    let prober = SystemProber::new().expect("probe client");

    assert_eq!(
        prober
            .check(
                "db",
                &ProbeCheck::Tcp {
                    address: address.clone()
                }
            )
            .await,
        Ok(())
    );

    drop(listener);
    assert!(matches!(
        prober.check("db", &ProbeCheck::Tcp { address }).await,
        Err(ProbeError::Connect(_))
    ));
}

#[tokio::test]
async fn command_probe_uses_exit_status() {
    let prober = SystemProber::new().expect("probe client");
    assert_eq!(
        prober
            .check("db", &ProbeCheck::Command("exit 0".to_string()))
            .await,
        Ok(())
    );
    assert_eq!(
        prober
            .check("db", &ProbeCheck::Command("exit 3".to_string()))
            .await,
        Err(ProbeError::CommandFailed("exit code 3".to_string()))
    );
    assert_eq!(
        prober
            .check(
                "db",
                &ProbeCheck::Command("test \"$MUSTER_SERVICE\" = db".to_string())
            )
            .await,
        Ok(())
    );
}
