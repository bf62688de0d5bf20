use muster::config::stack::DependencyCondition;
use muster::readiness::{ServiceState, ServiceStateMachine, StackState, TransitionError};

fn machine(names: &[&str]) -> ServiceStateMachine {
    ServiceStateMachine::new(names.iter().map(|name| name.to_string()))
}

fn drive(machine: &mut ServiceStateMachine, service: &str, states: &[ServiceState]) {
    for state in states {
        machine
            .set_state(service, *state, None)
            .unwrap_or_else(|err| panic!("{service} -> {state}: {err}"));
    }
}

#[test]
fn services_start_pending() {
    let machine = machine(&["db", "api"]);
    assert_eq!(machine.state("db"), Some(ServiceState::Pending));
    assert_eq!(machine.state("api"), Some(ServiceState::Pending));
    assert_eq!(machine.state("ghost"), None);
    assert_eq!(machine.stack_state(), StackState::Starting);
}

#[test]
fn full_lifecycle_is_recorded_in_sequence() {
    let mut machine = machine(&["db"]);
    drive(
        &mut machine,
        "db",
        &[
            ServiceState::WaitingOnDependencies,
            ServiceState::Starting,
            ServiceState::ProbingHealth,
            ServiceState::Healthy,
        ],
    );

    let history = machine.history();
    assert_eq!(history.len(), 4);
    assert_eq!(history[0].from, ServiceState::Pending);
    assert_eq!(history[3].to, ServiceState::Healthy);
    assert!(history
        .windows(2)
        .all(|pair| pair[0].sequence < pair[1].sequence));
    assert_eq!(machine.stack_state(), StackState::Healthy);
}

#[test]
fn history_keeps_only_the_latest_transitions() {
    let mut machine = machine(&["db"]).with_history_limit(3);
    drive(
        &mut machine,
        "db",
        &[
            ServiceState::Starting,
            ServiceState::ProbingHealth,
            ServiceState::Healthy,
            ServiceState::Failed,
            ServiceState::Starting,
        ],
    );

    let history = machine.history();
    let sequences: Vec<u64> = history.iter().map(|record| record.sequence).collect();
    assert_eq!(sequences, vec![2, 3, 4]);
    assert_eq!(history[0].to, ServiceState::Healthy);
    assert_eq!(machine.restarts("db"), Some(1));
}

#[test]
fn invalid_transition_is_rejected_and_state_kept() {
    let mut machine = machine(&["db"]);
    let err = machine
        .set_state("db", ServiceState::Healthy, None)
        .expect_err("pending cannot jump to healthy");
    assert_eq!(
        err,
        TransitionError::InvalidTransition {
            service: "db".to_string(),
            from: ServiceState::Pending,
            to: ServiceState::Healthy,
        }
    );
    assert_eq!(machine.state("db"), Some(ServiceState::Pending));
    assert!(machine.history().is_empty());
}

#[test]
fn unknown_service_is_rejected() {
    let mut machine = machine(&["db"]);
    assert_eq!(
        machine.set_state("ghost", ServiceState::Starting, None),
        Err(TransitionError::ServiceUnknown {
            service: "ghost".to_string(),
        })
    );
}

#[test]
fn stopped_is_terminal() {
    let mut machine = machine(&["db"]);
    drive(&mut machine, "db", &[ServiceState::Stopped]);
    assert!(ServiceState::Stopped.is_terminal());
    assert!(machine
        .set_state("db", ServiceState::Starting, None)
        .is_err());
    assert_eq!(machine.stack_state(), StackState::Stopped);
}

#[test]
fn restarts_count_failed_to_starting() {
    let mut machine = machine(&["db"]);
    drive(
        &mut machine,
        "db",
        &[
            ServiceState::Starting,
            ServiceState::Failed,
            ServiceState::Starting,
            ServiceState::ProbingHealth,
            ServiceState::Failed,
            ServiceState::WaitingOnDependencies,
        ],
    );
    assert_eq!(machine.restarts("db"), Some(2));
}

#[test]
fn repeated_state_only_refreshes_reason() {
    let mut machine = machine(&["db"]);
    drive(&mut machine, "db", &[ServiceState::WaitingOnDependencies]);
    machine
        .set_state(
            "db",
            ServiceState::WaitingOnDependencies,
            Some("waiting on cache".to_string()),
        )
        .expect("same state is accepted");
    assert_eq!(machine.reason("db"), Some("waiting on cache"));
    assert_eq!(machine.history().len(), 1);
}

#[test]
fn failed_service_degrades_stack() {
    let mut machine = machine(&["db", "api"]);
    drive(
        &mut machine,
        "db",
        &[
            ServiceState::Starting,
            ServiceState::ProbingHealth,
            ServiceState::Healthy,
        ],
    );
    drive(&mut machine, "api", &[ServiceState::Starting, ServiceState::Failed]);
    assert_eq!(machine.stack_state(), StackState::Degraded);
}

#[test]
fn stop_all_reports_every_moved_service() {
    let mut machine = machine(&["db", "api", "web"]);
    drive(&mut machine, "db", &[ServiceState::Starting]);
    drive(&mut machine, "web", &[ServiceState::Stopped]);

    let moved = machine.stop_all("stack shutdown");
    assert_eq!(
        moved,
        vec![
            ("api".to_string(), ServiceState::Pending),
            ("db".to_string(), ServiceState::Starting),
        ]
    );
    assert_eq!(machine.stack_state(), StackState::Stopped);
    assert_eq!(machine.reason("db"), Some("stack shutdown"));
}

#[test]
fn conditions_accept_the_right_states() {
    assert!(ServiceState::Healthy.satisfies(DependencyCondition::Healthy));
    assert!(!ServiceState::ProbingHealth.satisfies(DependencyCondition::Healthy));
    assert!(ServiceState::Starting.satisfies(DependencyCondition::Started));
    assert!(ServiceState::ProbingHealth.satisfies(DependencyCondition::Started));
    assert!(!ServiceState::Failed.satisfies(DependencyCondition::Started));
    assert!(!ServiceState::Pending.satisfies(DependencyCondition::Started));
}

#[test]
fn states_render_in_upper_snake_case() {
    assert_eq!(
        ServiceState::WaitingOnDependencies.to_string(),
        "WAITING_ON_DEPENDENCIES"
    );
    assert_eq!(ServiceState::ProbingHealth.as_str(), "PROBING_HEALTH");
    assert_eq!(StackState::Degraded.as_str(), "DEGRADED");
}
