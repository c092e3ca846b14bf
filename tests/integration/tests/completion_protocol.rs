//! End-to-end completion-protocol checks against script-mocked agents.

#![cfg(unix)]

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use vigil_supervisor::{
    CommandLauncher, SupervisorConfig, SupervisorEvent, TaskRequest, TaskStatus, TaskSupervisor,
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

fn request(task_id: &str, prompt: &str) -> TaskRequest {
    TaskRequest {
        task_id: task_id.to_string(),
        prompt: prompt.to_string(),
        resume_session: None,
        workdir: None,
    }
}

#[tokio::test]
async fn integration_conversational_stop_resolves_done_without_continuation() {
    let dir = tempfile::tempdir().expect("tempdir");
    let script = write_script(
        dir.path(),
        r#"
printf '{"type":"step_start","session_id":"sess-conv"}\n'
printf '{"type":"text","session_id":"sess-conv","text":"A trait object is a fat pointer."}\n'
printf '{"type":"step_finish","session_id":"sess-conv","reason":"stop","usage":{"input":12,"output":8},"cost":0.001}\n'
"#,
    );
    let state = dir.path().join("state");
    let (mut supervisor, _events) =
        capturing_supervisor(&script, &state, SupervisorConfig::default());

    let outcome = supervisor.run(request("task-conv", "what is a trait object?")).await;
    assert_eq!(outcome.status, TaskStatus::Success);
    assert!(outcome.completion.is_none());
    assert_eq!(outcome.session_id.as_deref(), Some("sess-conv"));
    assert_eq!(outcome.totals.steps, 1);
    assert!(!state.exists(), "conversational agent never re-invoked");
}

#[tokio::test]
async fn integration_tool_stop_without_signal_runs_one_continuation_on_same_session() {
    let dir = tempfile::tempdir().expect("tempdir");
    let script = write_script(
        dir.path(),
        r#"
count=$(cat "$VIGIL_STATE_FILE" 2>/dev/null || echo 0)
count=$((count + 1))
echo "$count" > "$VIGIL_STATE_FILE"
echo "${VIGIL_RESUME_SESSION:-none}" >> "$VIGIL_STATE_FILE.sessions"
if [ "$count" -eq 1 ]; then
  printf '{"type":"step_start","session_id":"sess-cont"}\n'
  printf '{"type":"tool_use","session_id":"sess-cont","name":"edit_file","arguments":{"path":"src/lib.rs"}}\n'
  printf '{"type":"step_finish","session_id":"sess-cont","reason":"stop","usage":{"input":10,"output":4},"cost":0.001}\n'
else
  printf '{"type":"step_start","session_id":"sess-cont"}\n'
  printf '{"type":"tool_use","session_id":"sess-cont","name":"complete_task","arguments":{"status":"success","summary":"edits landed","original_request_summary":"touch lib"}}\n'
  printf '{"type":"step_finish","session_id":"sess-cont","reason":"stop","usage":{"input":10,"output":4},"cost":0.001}\n'
fi
"#,
    );
    let state = dir.path().join("state");
    let (mut supervisor, _events) =
        capturing_supervisor(&script, &state, SupervisorConfig::default());

    let outcome = supervisor.run(request("task-cont", "touch lib")).await;
    assert_eq!(outcome.status, TaskStatus::Success);
    let completion = outcome.completion.expect("completion recorded");
    assert_eq!(completion.summary, "edits landed");

    let invocations = std::fs::read_to_string(&state).expect("counter");
    assert_eq!(invocations.trim(), "2");
    let sessions = std::fs::read_to_string(state.with_extension("sessions")).expect("sessions");
    let sessions: Vec<&str> = sessions.lines().collect();
    assert_eq!(sessions, ["none", "sess-cont"], "continuation resumed the session");
}

#[tokio::test]
async fn regression_success_signal_survives_nonzero_exit() {
    let dir = tempfile::tempdir().expect("tempdir");
    let script = write_script(
        dir.path(),
        r#"
printf '{"type":"step_start","session_id":"sess-exit"}\n'
printf '{"type":"tool_use","session_id":"sess-exit","name":"complete_task","arguments":{"status":"success","summary":"all done","original_request_summary":"task"}}\n'
printf '{"type":"step_finish","session_id":"sess-exit","reason":"stop","usage":{"input":5,"output":2},"cost":0.0005}\n'
exit 3
"#,
    );
    let state = dir.path().join("state");
    let (mut supervisor, _events) =
        capturing_supervisor(&script, &state, SupervisorConfig::default());

    let outcome = supervisor.run(request("task-exit", "finish then die")).await;
    assert_eq!(outcome.status, TaskStatus::Success);
    assert!(outcome.error.is_none());
}

#[tokio::test]
async fn regression_signalless_nonzero_exit_is_a_task_failure() {
    let dir = tempfile::tempdir().expect("tempdir");
    let script = write_script(
        dir.path(),
        r#"
printf '{"type":"step_start","session_id":"sess-crash"}\n'
printf 'agent crashed while indexing\n'
exit 7
"#,
    );
    let state = dir.path().join("state");
    let (mut supervisor, _events) =
        capturing_supervisor(&script, &state, SupervisorConfig::default());

    let outcome = supervisor.run(request("task-crash", "index the repo")).await;
    assert_eq!(outcome.status, TaskStatus::Error);
    assert!(outcome
        .error
        .expect("error recorded")
        .contains("before signaling completion"));
}

#[tokio::test]
async fn integration_step_finish_split_across_writes_emits_exactly_one_message() {
    let dir = tempfile::tempdir().expect("tempdir");
    let script = write_script(
        dir.path(),
        r#"
printf '{"type":"step_start","session_id":"sess-split"}\n'
printf '{"type":"step_finish","session_id":"sess-split","reason":"st'
sleep 1
printf 'op","usage":{"input":5,"output":2},"cost":0.0005}\n'
"#,
    );
    let state = dir.path().join("state");
    let (mut supervisor, events) =
        capturing_supervisor(&script, &state, SupervisorConfig::default());

    let outcome = supervisor.run(request("task-split", "split feed")).await;
    assert_eq!(outcome.status, TaskStatus::Success);

    let step_finishes = events
        .lock()
        .expect("event lock")
        .iter()
        .filter(|event| {
            matches!(
                event,
                SupervisorEvent::Message { message } if message.kind() == "step_finish"
            )
        })
        .count();
    assert_eq!(step_finishes, 1);
    assert_eq!(outcome.totals.steps, 1);
}

#[tokio::test]
async fn regression_watchdog_forces_completion_of_a_stuck_continuation() {
    let dir = tempfile::tempdir().expect("tempdir");
    let script = write_script(
        dir.path(),
        r#"
count=$(cat "$VIGIL_STATE_FILE" 2>/dev/null || echo 0)
count=$((count + 1))
echo "$count" > "$VIGIL_STATE_FILE"
if [ "$count" -eq 1 ]; then
  printf '{"type":"tool_use","session_id":"sess-stuck","name":"bash","arguments":{"command":"true"}}\n'
  printf '{"type":"step_finish","session_id":"sess-stuck","reason":"stop","usage":{"input":4,"output":1},"cost":0.0001}\n'
else
  sleep 30
fi
"#,
    );
    let state = dir.path().join("state");
    let config = SupervisorConfig {
        continuation_watchdog_ms: 300,
        ..SupervisorConfig::default()
    };
    let (mut supervisor, _events) = capturing_supervisor(&script, &state, config);

    let started = std::time::Instant::now();
    let outcome = supervisor.run(request("task-stuck", "get stuck")).await;
    assert_eq!(outcome.status, TaskStatus::Success);
    assert!(
        started.elapsed() < std::time::Duration::from_secs(10),
        "watchdog must not wait out the stuck continuation"
    );
}

#[tokio::test]
async fn integration_interrupt_soft_stops_and_reaches_the_agent() {
    let dir = tempfile::tempdir().expect("tempdir");
    let script = write_script(
        dir.path(),
        r#"
printf '{"type":"step_start","session_id":"sess-int"}\n'
printf '{"type":"tool_use","session_id":"sess-int","name":"bash","arguments":{"command":"sleep 1"}}\n'
read control_line
echo "$control_line" > "$VIGIL_STATE_FILE.control"
printf '{"type":"step_finish","session_id":"sess-int","reason":"stop","usage":{"input":3,"output":1},"cost":0.0001}\n'
"#,
    );
    let state = dir.path().join("state");
    let (mut supervisor, _events) =
        capturing_supervisor(&script, &state, SupervisorConfig::default());
    let handle = supervisor.handle();

    tokio::spawn(async move {
        tokio::time::sleep(std::time::Duration::from_millis(300)).await;
        handle.interrupt();
    });

    let outcome = supervisor.run(request("task-int", "long crawl")).await;
    assert_eq!(outcome.status, TaskStatus::Interrupted);

    let control = std::fs::read_to_string(state.with_extension("control")).expect("control line");
    assert!(control.contains("interrupt"));
}

#[tokio::test]
async fn integration_agent_question_is_answered_over_stdin() {
    let dir = tempfile::tempdir().expect("tempdir");
    let script = write_script(
        dir.path(),
        r#"
printf '{"type":"step_start","session_id":"sess-ask"}\n'
printf '{"type":"text","session_id":"sess-ask","text":"Overwrite the existing migration? (yes/no)"}\n'
read answer
echo "$answer" > "$VIGIL_STATE_FILE.answer"
printf '{"type":"tool_use","session_id":"sess-ask","name":"complete_task","arguments":{"status":"success","summary":"migration rewritten","original_request_summary":"migrate"}}\n'
printf '{"type":"step_finish","session_id":"sess-ask","reason":"stop","usage":{"input":6,"output":2},"cost":0.0002}\n'
"#,
    );
    let state = dir.path().join("state");
    let (mut supervisor, _events) =
        capturing_supervisor(&script, &state, SupervisorConfig::default());
    let handle = supervisor.handle();

    tokio::spawn(async move {
        tokio::time::sleep(std::time::Duration::from_millis(300)).await;
        handle.respond("yes");
    });

    let outcome = supervisor.run(request("task-ask", "migrate the schema")).await;
    assert_eq!(outcome.status, TaskStatus::Success);
    let answer = std::fs::read_to_string(state.with_extension("answer")).expect("answer");
    assert_eq!(answer.trim(), "yes");
}
