use muster::config::stack::{
    DependencyCondition, JitterMode, Launch, ProbeCheck, RestartPolicy, StackConfig,
    StackConfigError, DEFAULT_PROBE_RETRIES,
};
use muster::config::MusterConfig;
use std::io::Write;
use std::time::Duration;

const FULL_STACK: &str = r#"
api_version: v1
app:
  max_parallel_starts: 2
  start_timeout: 45s
  readiness_cache: 500ms
  container_cli: podman
  restart:
    max_restarts: 3
    window: 2m
    base_backoff: 500ms
    max_backoff: 20s
    jitter: equal
services:
  - name: postgres
    image: postgres:16
    environment:
      POSTGRES_PASSWORD: secret
      POSTGRES_PORT: 5432
    probe:
      command: pg_isready -U postgres
      interval: 2s
      timeout: 1s
      retries: 10
      start_period: 5s
    restart: on-failure
  - name: backend
    command: ./target/debug/backend --port 8080
    working_dir: ./backend
    depends_on:
      - postgres
      - name: cache
        condition: started
    probe:
      http: http://127.0.0.1:8080/health
      expected_status: 204
    restart: always
    stop_timeout: 20s
  - name: cache
    image: redis:7
    probe:
      tcp: 127.0.0.1:6379
management:
  port: 9400
  ready: {}
  status:
    path: stack/status
  control: true
"#;

fn parse(yaml: &str) -> Result<StackConfig, StackConfigError> {
    StackConfig::from_reader(yaml.as_bytes())
}

fn validation_messages(yaml: &str) -> Vec<String> {
    match parse(yaml) {
        Err(StackConfigError::Invalid(err)) => err.messages().to_vec(),
        other => panic!("expected validation failure, got {other:?}"),
    }
}

#[test]
fn parses_a_complete_stack() {
    let config = parse(FULL_STACK).expect("stack must parse");

    assert_eq!(config.app.max_parallel_starts, 2);
    assert_eq!(config.app.start_timeout, Duration::from_secs(45));
    assert_eq!(config.app.readiness_cache, Duration::from_millis(500));
    assert_eq!(config.app.container_cli, "podman");
    assert_eq!(config.app.restart.max_restarts, Some(3));
    assert_eq!(config.app.restart.window, Duration::from_secs(120));
    assert_eq!(config.app.restart.jitter, JitterMode::Equal);

    let postgres = config.service("postgres").expect("postgres");
    assert_eq!(postgres.launch, Launch::Image("postgres:16".to_string()));
    assert_eq!(
        postgres.environment.get("POSTGRES_PORT").map(String::as_str),
        Some("5432")
    );
    assert_eq!(postgres.restart, RestartPolicy::OnFailure);
    let probe = postgres.probe.as_ref().expect("postgres probe");
    assert_eq!(
        probe.check,
        ProbeCheck::Command("pg_isready -U postgres".to_string())
    );
    assert_eq!(probe.interval, Duration::from_secs(2));
    assert_eq!(probe.retries, 10);
    assert_eq!(probe.start_period, Duration::from_secs(5));

    let backend = config.service("backend").expect("backend");
    assert_eq!(backend.depends_on.len(), 2);
    assert_eq!(backend.depends_on[0].name, "postgres");
    assert_eq!(backend.depends_on[0].condition, DependencyCondition::Healthy);
    assert_eq!(backend.depends_on[1].condition, DependencyCondition::Started);
    assert_eq!(backend.stop_timeout, Some(Duration::from_secs(20)));
    assert_eq!(
        backend.probe.as_ref().map(|probe| &probe.check),
        Some(&ProbeCheck::Http {
            url: "http://127.0.0.1:8080/health".to_string(),
            expected_status: Some(204),
        })
    );

    let cache = config.service("cache").expect("cache");
    let cache_probe = cache.probe.as_ref().expect("cache probe");
    assert_eq!(cache_probe.retries, DEFAULT_PROBE_RETRIES);
    assert_eq!(cache.restart, RestartPolicy::Never);

    let management = config.management.as_ref().expect("management");
    assert_eq!(management.host, "127.0.0.1");
    assert_eq!(management.port, 9400);
    assert_eq!(
        management.ready.as_ref().map(|endpoint| endpoint.path.as_str()),
        Some("/ready")
    );
    assert_eq!(
        management.status.as_ref().map(|endpoint| endpoint.path.as_str()),
        Some("/stack/status")
    );
    assert!(management.control);
}

#[test]
fn defaults_apply_when_app_section_is_missing() {
    let config = parse(
        r#"
api_version: v1
services:
  - name: solo
    command: sleep 60
"#,
    )
    .expect("minimal stack parses");

    assert_eq!(config.app.max_parallel_starts, 4);
    assert_eq!(config.app.restart.max_restarts, Some(5));
    assert_eq!(config.app.restart.jitter, JitterMode::Full);
    assert!(config.management.is_none());
    assert!(config.services[0].probe.is_none());
}

#[test]
fn unlimited_restarts_are_accepted() {
    let config = parse(
        r#"
api_version: v1
app:
  restart:
    max_restarts: unlimited
services:
  - name: solo
    command: sleep 60
"#,
    )
    .expect("stack parses");
    assert_eq!(config.app.restart.max_restarts, None);
}

#[test]
fn collects_every_validation_error() {
    let messages = validation_messages(
        r#"
api_version: v1
services:
  - name: both
    command: run
    image: img
  - name: neither
  - name: api
    command: run
    depends_on: [ghost, api]
    restart: sometimes
    probe:
      http: localhost/health
      retries: 0
  - name: api
    command: run
"#,
    );

    let expect = |needle: &str| {
        assert!(
            messages.iter().any(|message| message.contains(needle)),
            "missing `{needle}` in {messages:#?}"
        );
    };
    expect("service `both` must set exactly one of `command` or `image` (got both)");
    expect("service `neither` must set exactly one of `command` or `image`");
    expect("service `api` depends on unknown service `ghost`");
    expect("service `api` cannot depend on itself");
    expect("restart must be one of");
    expect("http must be an absolute http(s) URL");
    expect("retries must be at least 1");
    expect("service `api` is declared more than once");
}

#[test]
fn rejects_missing_api_version_and_unknown_keys() {
    let messages = validation_messages(
        r#"
services: []
volumes: {}
"#,
    );
    assert!(messages.iter().any(|msg| msg.contains("api_version is required")));
    assert!(messages
        .iter()
        .any(|msg| msg.contains("unknown top-level key \"volumes\"")));
}

#[test]
fn rejects_invalid_durations() {
    let messages = validation_messages(
        r#"
api_version: v1
app:
  start_timeout: soon
  restart:
    base_backoff: 1m
    max_backoff: 10s
services:
  - name: solo
    command: run
    probe:
      tcp: localhost
      interval: 0s
"#,
    );
    assert!(messages
        .iter()
        .any(|msg| msg.contains("app.start_timeout must be a valid duration")));
    assert!(messages
        .iter()
        .any(|msg| msg.contains("must not exceed app.restart.max_backoff")));
    assert!(messages
        .iter()
        .any(|msg| msg.contains("tcp must be a `host:port` address")));
    assert!(messages
        .iter()
        .any(|msg| msg.contains("probe interval must be greater than zero")));
}

#[test]
fn malformed_yaml_is_a_parse_error() {
    assert!(matches!(
        parse("api_version: v1\nservices: [unclosed"),
        Err(StackConfigError::Parse(_))
    ));
}

#[test]
fn loads_from_a_file_on_disk() {
    let mut file = tempfile::NamedTempFile::new().expect("temp file");
    file.write_all(FULL_STACK.as_bytes()).expect("write stack");

    let config = StackConfig::from_path(file.path()).expect("stack loads from disk");
    assert_eq!(config.services.len(), 3);

    let missing = file.path().with_extension("missing");
    assert!(matches!(
        StackConfig::from_path(missing),
        Err(StackConfigError::Io(_))
    ));
}

#[test]
fn process_overrides_replace_parallelism() {
    let mut config = parse(FULL_STACK).expect("stack must parse");
    let overrides = MusterConfig {
        stack_path: None,
        max_parallel_starts: Some(8),
        detach: false,
    };
    overrides.apply_overrides(&mut config);
    assert_eq!(config.app.max_parallel_starts, 8);

    MusterConfig {
        max_parallel_starts: Some(0),
        ..MusterConfig::default()
    }
    .apply_overrides(&mut config);
    assert_eq!(config.app.max_parallel_starts, 8);
}
