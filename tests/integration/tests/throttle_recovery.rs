//! End-to-end throttling recovery: retry, fallback, cost guard, cancel.

#![cfg(unix)]

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use vigil_ledger::UsageReport;
use vigil_supervisor::{
    CommandLauncher, SupervisorConfig, SupervisorEvent, TaskRequest, TaskStage, TaskStatus,
    TaskSupervisor,
};

use std::os::unix::fs::PermissionsExt;

fn write_script(dir: &Path, body: &str) -> PathBuf {
    let script = dir.join("mock-agent.sh");
    let content = format!("#!/bin/sh\nset -u\n{body}\n");
    std::fs::write(&script, content).expect("write script");
    let mut perms = std::fs::metadata(&script)
        .expect("script metadata")
        .permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&script, perms).expect("chmod script");
    script
}

fn capturing_supervisor(
    script: &Path,
    state_file: &Path,
    config: SupervisorConfig,
) -> (TaskSupervisor, Arc<Mutex<Vec<SupervisorEvent>>>) {
    let mut launcher = CommandLauncher::new(script);
    launcher.env.insert(
        "VIGIL_STATE_FILE".to_string(),
        state_file.display().to_string(),
    );
    let mut supervisor = TaskSupervisor::new(config, Arc::new(launcher), None);
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    supervisor.add_event_handler(Arc::new(move |event: &SupervisorEvent| {
        sink.lock().expect("event lock").push(event.clone());
    }));
    (supervisor, events)
}

fn fast_retry_config() -> SupervisorConfig {
    SupervisorConfig {
        max_rate_limit_retries: 3,
        retry_base_delay_ms: 10,
        retry_max_delay_ms: 50,
        retry_jitter_fraction: 0.0,
        ..SupervisorConfig::default()
    }
}

fn request(task_id: &str, prompt: &str) -> TaskRequest {
    TaskRequest {
        task_id: task_id.to_string(),
        prompt: prompt.to_string(),
        resume_session: None,
        workdir: None,
    }
}

const RATE_LIMITED_AGENT: &str = r#"
count=$(cat "$VIGIL_STATE_FILE" 2>/dev/null || echo 0)
count=$((count + 1))
echo "$count" > "$VIGIL_STATE_FILE"
echo "$VIGIL_MODEL" >> "$VIGIL_STATE_FILE.models"
if [ "$count" -le 4 ]; then
  printf '{"type":"step_start","session_id":"sess-rl"}\n'
  printf '{"type":"error","session_id":"sess-rl","message":"anthropic: 429 Too Many Requests, retry-after: 0"}\n'
else
  printf "%s" "$VIGIL_PROMPT" > "$VIGIL_STATE_FILE.prompt"
  printf '{"type":"step_start","session_id":"sess-rl"}\n'
  printf '{"type":"tool_use","session_id":"sess-rl","name":"complete_task","arguments":{"status":"success","summary":"recovered on fallback","original_request_summary":"uploader"}}\n'
  printf '{"type":"step_finish","session_id":"sess-rl","reason":"stop","usage":{"input":20,"output":9},"cost":0.002}\n'
fi
"#;

#[tokio::test]
async fn integration_retries_exhaust_then_fallback_carries_original_prompt() {
    let dir = tempfile::tempdir().expect("tempdir");
    let script = write_script(dir.path(), RATE_LIMITED_AGENT);
    let state = dir.path().join("state");
    let config = SupervisorConfig {
        fallback_model: Some("backup-large".to_string()),
        fallback_provider: Some("openai".to_string()),
        usage_dir: Some(dir.path().join("usage")),
        ..fast_retry_config()
    };
    let (mut supervisor, events) = capturing_supervisor(&script, &state, config);

    let outcome = supervisor
        .run(request("task-rl", "Refactor the uploader retry logic"))
        .await;
    assert_eq!(outcome.status, TaskStatus::Success);
    assert_eq!(
        outcome.completion.expect("completion").summary,
        "recovered on fallback"
    );

    let invocations = std::fs::read_to_string(&state).expect("counter");
    assert_eq!(invocations.trim(), "5", "primary + 3 retries + fallback");

    let models = std::fs::read_to_string(state.with_extension("models")).expect("models");
    let models: Vec<&str> = models.lines().collect();
    assert_eq!(models.len(), 5);
    assert!(models[..4]
        .iter()
        .all(|model| *model == SupervisorConfig::default().primary_model));
    assert_eq!(models[4], "backup-large");

    let prompt = std::fs::read_to_string(state.with_extension("prompt")).expect("prompt");
    assert!(
        prompt.contains("Refactor the uploader retry logic"),
        "fallback brief must carry the original request"
    );

    let events = events.lock().expect("event lock");
    assert!(events
        .iter()
        .any(|event| matches!(event, SupervisorEvent::Stage { stage: TaskStage::RetryExhausted })));
    assert!(events.iter().any(|event| matches!(
        event,
        SupervisorEvent::FallbackStarted { to_model, .. } if to_model == "backup-large"
    )));
    assert!(events.iter().any(|event| matches!(
        event,
        SupervisorEvent::FallbackCompleted { model } if model == "backup-large"
    )));

    // The persisted report tags the recovered work with the fallback phase.
    let report_path = dir.path().join("usage/usage-task-rl.json");
    let raw = std::fs::read_to_string(report_path).expect("usage report");
    let report: UsageReport = serde_json::from_str(&raw).expect("parse report");
    assert_eq!(report.session_id.as_deref(), Some("sess-rl"));
    assert_eq!(report.entries.len(), 1);
    assert_eq!(report.entries[0].phase.as_str(), "fallback");
}

#[tokio::test]
async fn integration_retries_exhaust_without_fallback_is_an_error() {
    let dir = tempfile::tempdir().expect("tempdir");
    let script = write_script(dir.path(), RATE_LIMITED_AGENT);
    let state = dir.path().join("state");
    let (mut supervisor, events) = capturing_supervisor(&script, &state, fast_retry_config());

    let outcome = supervisor.run(request("task-norb", "no fallback configured")).await;
    assert_eq!(outcome.status, TaskStatus::Error);
    assert!(outcome
        .error
        .expect("error recorded")
        .contains("no fallback model is configured"));

    let invocations = std::fs::read_to_string(&state).expect("counter");
    assert_eq!(invocations.trim(), "4", "primary + 3 retries, no fallback run");
    assert!(events
        .lock()
        .expect("event lock")
        .iter()
        .any(|event| matches!(event, SupervisorEvent::Stage { stage: TaskStage::RetryExhausted })));
}

#[tokio::test]
async fn integration_cost_limit_trips_internal_cancellation() {
    let dir = tempfile::tempdir().expect("tempdir");
    let script = write_script(
        dir.path(),
        r#"
printf '{"type":"step_start","session_id":"sess-cost"}\n'
printf '{"type":"tool_use","session_id":"sess-cost","name":"bash","arguments":{"command":"true"}}\n'
printf '{"type":"step_finish","session_id":"sess-cost","reason":"tool_use","usage":{"input":100,"output":50},"cost":0.4}\n'
printf '{"type":"step_finish","session_id":"sess-cost","reason":"tool_use","usage":{"input":100,"output":50},"cost":0.4}\n'
sleep 30
"#,
    );
    let state = dir.path().join("state");
    let config = SupervisorConfig {
        max_cost_usd: 0.5,
        usage_dir: Some(dir.path().join("usage")),
        ..SupervisorConfig::default()
    };
    let (mut supervisor, events) = capturing_supervisor(&script, &state, config);

    let started = std::time::Instant::now();
    let outcome = supervisor.run(request("task-cost", "burn tokens")).await;
    assert_eq!(outcome.status, TaskStatus::Interrupted);
    assert!(
        started.elapsed() < std::time::Duration::from_secs(10),
        "cost trip must kill the subprocess, not wait it out"
    );

    let events = events.lock().expect("event lock");
    assert!(events
        .iter()
        .any(|event| matches!(event, SupervisorEvent::TokenLimitWarning { .. })));
    assert!(events
        .iter()
        .any(|event| matches!(event, SupervisorEvent::TokenLimitReached { .. })));

    // Both steps made it into the persisted report despite the teardown.
    let raw = std::fs::read_to_string(dir.path().join("usage/usage-task-cost.json"))
        .expect("usage report");
    let report: UsageReport = serde_json::from_str(&raw).expect("parse report");
    assert_eq!(report.entries.len(), 2);
}

#[tokio::test]
async fn integration_cancel_kills_the_agent_and_persists_usage() {
    let dir = tempfile::tempdir().expect("tempdir");
    let script = write_script(
        dir.path(),
        r#"
printf '{"type":"step_start","session_id":"sess-cancel"}\n'
printf '{"type":"step_finish","session_id":"sess-cancel","reason":"tool_use","usage":{"input":30,"output":10},"cost":0.003}\n'
sleep 30
"#,
    );
    let state = dir.path().join("state");
    let config = SupervisorConfig {
        usage_dir: Some(dir.path().join("usage")),
        ..SupervisorConfig::default()
    };
    let (mut supervisor, _events) = capturing_supervisor(&script, &state, config);
    let handle = supervisor.handle();

    tokio::spawn(async move {
        tokio::time::sleep(std::time::Duration::from_millis(300)).await;
        handle.cancel();
    });

    let started = std::time::Instant::now();
    let outcome = supervisor.run(request("task-cancel", "long running task")).await;
    assert_eq!(outcome.status, TaskStatus::Interrupted);
    assert!(started.elapsed() < std::time::Duration::from_secs(10));

    let raw = std::fs::read_to_string(dir.path().join("usage/usage-task-cancel.json"))
        .expect("usage report written before teardown");
    let report: UsageReport = serde_json::from_str(&raw).expect("parse report");
    assert_eq!(report.task_id, "task-cancel");
    assert_eq!(report.entries.len(), 1);
}

#[tokio::test]
async fn integration_auth_failures_in_logs_pass_through_as_events() {
    let dir = tempfile::tempdir().expect("tempdir");
    let script = write_script(
        dir.path(),
        r#"
printf 'anthropic: 401 Unauthorized, invalid api key\n'
printf '{"type":"step_start","session_id":"sess-auth"}\n'
printf '{"type":"text","session_id":"sess-auth","text":"cannot reach the model"}\n'
printf '{"type":"step_finish","session_id":"sess-auth","reason":"stop","usage":{"input":1,"output":1},"cost":0.0}\n'
"#,
    );
    let state = dir.path().join("state");
    let (mut supervisor, events) =
        capturing_supervisor(&script, &state, SupervisorConfig::default());

    let outcome = supervisor.run(request("task-auth", "anything")).await;
    assert_eq!(outcome.status, TaskStatus::Success);

    let events = events.lock().expect("event lock");
    assert!(events.iter().any(|event| matches!(
        event,
        SupervisorEvent::AuthError { message } if message.contains("401")
    )));
}
