#![cfg(unix)]

use std::fs;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use looper::core::types::{ExecutionMode, ExitReason, SessionState};
use looper::io::agent::{Agent, OutputObserver, OutputStream};
use looper::io::config::{LoopConfig, WatcherConfig};
use looper::io::process::{AgentCommand, AgentProcessHandle};
use looper::io::prompt::TemplatePrompts;
use looper::io::stop::StopSignal;
use looper::scheduler::IterationScheduler;
use looper::test_support::TestWorkspace;
use tokio_util::sync::CancellationToken;

const COUNTING_AGENT: &str = r#"
cat > /dev/null
count=$(cat .looper/count 2>/dev/null || echo 0)
count=$((count + 1))
echo "$count" > .looper/count
echo "iteration $count"
if [ "$count" -ge 2 ]; then complete=true; else complete=false; fi
printf '{"complete":%s,"progress":{"completed":%s,"total":2}}' "$complete" "$count" > .looper/status.json
"#;

fn shell_config(script: &str) -> LoopConfig {
    let mut cfg = LoopConfig {
        mode: ExecutionMode::Incremental,
        max_iterations: 5,
        termination_grace_ms: 300,
        watcher: WatcherConfig {
            enabled: false,
            ..WatcherConfig::default()
        },
        ..LoopConfig::default()
    };
    cfg.agent.command = vec!["sh".to_string(), "-c".to_string(), script.to_string()];
    cfg.agent.system_prompt_flag = String::new();
    cfg
}

fn build(
    ws: &TestWorkspace,
    cfg: LoopConfig,
) -> IterationScheduler<AgentProcessHandle, TemplatePrompts> {
    let agent = AgentProcessHandle::new(AgentCommand::from_config(&cfg, ws.root()));
    let stop = StopSignal::new(&ws.paths.stop_path, cfg.stop_key).without_keyboard();
    IterationScheduler::new(
        agent,
        TemplatePrompts::new().expect("templates"),
        cfg,
        ws.paths.clone(),
    )
    .expect("scheduler")
    .with_stop_signal(stop)
}

#[tokio::test]
async fn shell_agent_drives_session_to_completion() {
    let ws = TestWorkspace::new();
    let lines = Arc::new(Mutex::new(Vec::new()));
    let sink = lines.clone();
    let observer: OutputObserver = Arc::new(move |stream: OutputStream, line: &str| {
        if stream == OutputStream::Stdout {
            sink.lock().expect("lines").push(line.to_string());
        }
    });
    let mut scheduler = build(&ws, shell_config(COUNTING_AGENT)).with_output_observer(observer);

    let outcome = scheduler.run().await.expect("session");

    assert_eq!(outcome.reason, ExitReason::Completed);
    assert_eq!(outcome.state, SessionState::Completed);
    assert_eq!(outcome.iterations, 2);
    assert_eq!(
        lines.lock().expect("lines").as_slice(),
        ["iteration 1", "iteration 2"]
    );
    let log = fs::read_to_string(
        ws.paths
            .iteration_dir(&outcome.session_id, 1)
            .join("agent.log"),
    )
    .expect("agent log");
    assert!(log.contains("iteration 1"));
}

#[tokio::test]
async fn failing_agent_uses_whole_budget() {
    let ws = TestWorkspace::new();
    let mut cfg = shell_config("cat > /dev/null; echo broken >&2; exit 3");
    cfg.max_iterations = 2;
    let mut scheduler = build(&ws, cfg);

    let outcome = scheduler.run().await.expect("session");

    assert_eq!(outcome.reason, ExitReason::BudgetExhausted { iterations: 2 });
    let meta = fs::read_to_string(
        ws.paths
            .iteration_dir(&outcome.session_id, 2)
            .join("meta.json"),
    )
    .expect("meta");
    let meta: serde_json::Value = serde_json::from_str(&meta).expect("meta json");
    assert_eq!(meta["exit_code"], 3);
}

#[tokio::test]
async fn missing_binary_is_fatal() {
    let ws = TestWorkspace::new();
    let mut cfg = shell_config("unused");
    cfg.agent.command = vec!["looper-test-no-such-binary".to_string()];
    let mut scheduler = build(&ws, cfg);

    let outcome = scheduler.run().await.expect("session");

    assert!(matches!(outcome.reason, ExitReason::Fatal { .. }));
    assert_eq!(outcome.state, SessionState::Errored);
    assert_eq!(scheduler.status_store().read_count(), 0);
}

#[tokio::test]
async fn interrupt_kills_running_child() {
    let ws = TestWorkspace::new();
    let interrupt = CancellationToken::new();
    let mut scheduler =
        build(&ws, shell_config("cat > /dev/null; sleep 30")).with_interrupt(interrupt.clone());

    let canceller = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        interrupt.cancel();
    });
    let started = Instant::now();
    let outcome = scheduler.run().await.expect("session");
    canceller.await.expect("canceller");

    assert_eq!(outcome.reason, ExitReason::Interrupted);
    assert!(started.elapsed() < Duration::from_secs(10));
    assert!(!scheduler.agent().is_running());
}
