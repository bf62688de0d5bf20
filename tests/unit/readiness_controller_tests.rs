use muster::config::stack::{DependencyCondition, Launch, ServiceSpec};
use muster::readiness::{
    CoordinationError, DependencyWait, ReadinessController, ServiceState, StackState, StartGate,
};
use muster::registry::ServiceRegistry;
use std::time::Duration;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

fn controller() -> ReadinessController {
    let registry = ServiceRegistry::from_services([
        ServiceSpec::new("db", Launch::Command("true".to_string())),
        ServiceSpec::new("cache", Launch::Command("true".to_string())),
        ServiceSpec::new("api", Launch::Command("true".to_string()))
            .with_dependency("db", DependencyCondition::Healthy)
            .with_dependency("cache", DependencyCondition::Started),
    ])
    .expect("registry");
    ReadinessController::from_registry(&registry)
}

async fn bring_up(controller: &ReadinessController, service: &str) {
    for state in [
        ServiceState::Starting,
        ServiceState::ProbingHealth,
        ServiceState::Healthy,
    ] {
        controller
            .set_state(service, state, None)
            .await
            .expect("transition");
    }
}

#[tokio::test]
async fn starting_is_refused_while_dependencies_are_unmet() {
    let controller = controller();
    let err = controller
        .set_state("api", ServiceState::Starting, None)
        .await
        .expect_err("db is still pending");

    assert_eq!(
        err,
        CoordinationError::DependencyUnmet {
            service: "api".to_string(),
            dependency: "db".to_string(),
            condition: DependencyCondition::Healthy,
            actual: ServiceState::Pending,
        }
    );
    assert_eq!(
        controller.service_state("api").await,
        Some(ServiceState::Pending)
    );
}

#[tokio::test]
async fn started_condition_accepts_a_probing_dependency() {
    let controller = controller();
    bring_up(&controller, "db").await;
    controller
        .set_state("cache", ServiceState::Starting, None)
        .await
        .expect("cache starts");
    controller
        .set_state("cache", ServiceState::ProbingHealth, None)
        .await
        .expect("cache probes");

    assert!(controller.unmet_dependencies("api").await.is_empty());
    assert_eq!(
        controller.try_begin_start("api").await,
        Ok(StartGate::Started)
    );
    assert_eq!(
        controller.service_state("api").await,
        Some(ServiceState::Starting)
    );
}

#[tokio::test]
async fn try_begin_start_reports_every_unmet_dependency() {
    let controller = controller();
    match controller.try_begin_start("api").await {
        Ok(StartGate::Blocked(unmet)) => {
            let names: Vec<_> = unmet.iter().map(|dep| dep.dependency.as_str()).collect();
            assert_eq!(names, vec!["db", "cache"]);
        }
        other => panic!("expected blocked gate, got {other:?}"),
    }
}

#[tokio::test]
async fn waiter_wakes_once_dependencies_are_satisfied() {
    let controller = controller();
    let cancel = CancellationToken::new();

    let waiter = {
        let controller = controller.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { controller.wait_for_dependencies("api", &cancel).await })
    };

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!waiter.is_finished());

    bring_up(&controller, "db").await;
    controller
        .set_state("cache", ServiceState::Starting, None)
        .await
        .expect("cache starts");

    let outcome = timeout(Duration::from_secs(1), waiter)
        .await
        .expect("waiter finishes")
        .expect("join");
    assert_eq!(outcome, DependencyWait::Satisfied);
}

#[tokio::test]
async fn waiter_gives_up_when_a_dependency_stops() {
    let controller = controller();
    controller
        .set_state("db", ServiceState::Stopped, Some("stopped by operator".to_string()))
        .await
        .expect("db stops");

    let cancel = CancellationToken::new();
    assert_eq!(
        controller.wait_for_dependencies("api", &cancel).await,
        DependencyWait::DependencyStopped("db".to_string())
    );
}

#[tokio::test]
async fn waiter_honours_cancellation() {
    let controller = controller();
    let cancel = CancellationToken::new();
    cancel.cancel();
    assert_eq!(
        controller.wait_for_dependencies("api", &cancel).await,
        DependencyWait::Cancelled
    );
}

#[tokio::test]
async fn subscribers_observe_transitions() {
    let controller = controller();
    let mut rx = controller.subscribe("db").expect("db is registered");
    assert_eq!(*rx.borrow(), ServiceState::Pending);

    controller
        .set_state("db", ServiceState::Starting, None)
        .await
        .expect("db starts");
    rx.changed().await.expect("sender alive");
    assert_eq!(*rx.borrow(), ServiceState::Starting);
    assert!(controller.subscribe("ghost").is_none());
}

#[tokio::test]
async fn snapshot_reports_states_unmet_and_stack_health() {
    let controller = controller();
    bring_up(&controller, "db").await;

    let snapshot = controller.status_snapshot().await;
    assert_eq!(snapshot.stack_state, StackState::Starting);

    let api = snapshot
        .services
        .iter()
        .find(|service| service.name == "api")
        .expect("api in snapshot");
    assert_eq!(api.state, ServiceState::Pending);
    assert_eq!(api.dependencies, vec!["db", "cache"]);
    assert_eq!(api.unmet, vec!["cache"]);

    bring_up(&controller, "cache").await;
    bring_up(&controller, "api").await;
    assert_eq!(controller.stack_state().await, StackState::Healthy);
}

#[tokio::test]
async fn cached_snapshot_is_reused_within_ttl() {
    let controller = controller();
    let first = controller.cached_snapshot(Duration::from_secs(60)).await;
    bring_up(&controller, "db").await;
    let second = controller.cached_snapshot(Duration::from_secs(60)).await;

    let db_state = |snapshot: &muster::readiness::StackSnapshot| {
        snapshot
            .services
            .iter()
            .find(|service| service.name == "db")
            .map(|service| service.state)
    };
    assert_eq!(db_state(&first), Some(ServiceState::Pending));
    assert_eq!(db_state(&second), Some(ServiceState::Pending));

    let fresh = controller.cached_snapshot(Duration::ZERO).await;
    assert_eq!(db_state(&fresh), Some(ServiceState::Healthy));
}

#[tokio::test]
async fn stop_all_moves_everything_to_stopped() {
    let controller = controller();
    bring_up(&controller, "db").await;
    controller.stop_all("stack shutdown").await;

    assert_eq!(controller.stack_state().await, StackState::Stopped);
    let history = controller.history().await;
    assert!(history
        .iter()
        .filter(|record| record.to == ServiceState::Stopped)
        .all(|record| record.reason.as_deref() == Some("stack shutdown")));
    assert_eq!(
        controller.dependents_by_service().get("db"),
        Some(&vec!["api".to_string()])
    );
}
