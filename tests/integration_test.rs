// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
/// End-to-end orchestration scenarios: a real git repository, a scripted
/// fake assistant, a recording chat double, and the full service wiring
/// (store → sessions → runner → tracker → approval gate).
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;

use televibe_config::Config;
use televibe_orchestrator::Orchestrator;
use televibe_protocol::parse_stream_events;
use televibe_session::register_project;
use televibe_store::{Job, JobStatus, SessionState, Store};
use televibe_tracker::{ChatApi, ChatError, Keyboard, TrackerConfig};

const CHAT_ID: i64 = 7;

// ── Chat double ───────────────────────────────────────────────────────────────

#[derive(Default)]
struct MockChat {
    next_id: AtomicI64,
    sent: Mutex<Vec<(i64, String)>>,
    edits: Mutex<Vec<(i64, i64, String)>>,
    replies: Mutex<Vec<(i64, i64, String)>>,
}

#[async_trait]
impl ChatApi for MockChat {
    async fn send_message(
        &self,
        chat_id: i64,
        text: &str,
        _keyboard: Option<&Keyboard>,
    ) -> Result<i64, ChatError> {
        let id = 100 + self.next_id.fetch_add(1, Ordering::SeqCst);
        self.sent.lock().await.push((chat_id, text.to_string()));
        Ok(id)
    }

    async fn edit_message(
        &self,
        chat_id: i64,
        message_id: i64,
        text: &str,
        _keyboard: Option<&Keyboard>,
    ) -> Result<(), ChatError> {
        self.edits
            .lock()
            .await
            .push((chat_id, message_id, text.to_string()));
        Ok(())
    }

    async fn reply_to_message(
        &self,
        chat_id: i64,
        parent_message_id: i64,
        text: &str,
    ) -> Result<i64, ChatError> {
        self.replies
            .lock()
            .await
            .push((chat_id, parent_message_id, text.to_string()));
        Ok(100 + self.next_id.fetch_add(1, Ordering::SeqCst))
    }
}

// ── Harness ───────────────────────────────────────────────────────────────────

struct Harness {
    _root: tempfile::TempDir,
    orchestrator: Orchestrator,
    chat: Arc<MockChat>,
}

impl Harness {
    fn store(&self) -> &Arc<Store> {
        &self.orchestrator.store
    }

    async fn run_instruction(&self, session_id: &str, text: &str) -> Job {
        self.orchestrator
            .run_instruction(CHAT_ID, session_id, text)
            .await
            .unwrap()
    }

    async fn wait_terminal(&self, job_id: &str) -> Job {
        for _ in 0..300 {
            let job = self.store().get_job(job_id).await.unwrap().unwrap();
            if job.status.is_terminal() {
                // Give the completion hand-off a beat to post the reply.
                tokio::time::sleep(Duration::from_millis(150)).await;
                return job;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("job {job_id} never terminalized");
    }

    async fn wait_job_status(&self, job_id: &str, status: JobStatus) {
        for _ in 0..300 {
            let job = self.store().get_job(job_id).await.unwrap().unwrap();
            if job.status == status {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("job {job_id} never reached {status}");
    }

    async fn session_state(&self, session_id: &str) -> SessionState {
        self.store()
            .get_session(session_id)
            .await
            .unwrap()
            .unwrap()
            .state
    }
}

fn init_repo(dir: &Path) {
    let run = |args: &[&str]| {
        let status = Command::new("git")
            .args(args)
            .current_dir(dir)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .unwrap();
        assert!(status.success(), "git {args:?} failed");
    };
    run(&["init", "-b", "main"]);
    run(&["config", "user.email", "test@example.com"]);
    run(&["config", "user.name", "Test"]);
    std::fs::write(dir.join("README.md"), "# demo\n").unwrap();
    run(&["add", "."]);
    run(&["commit", "-m", "init"]);
}

fn write_script(dir: &Path, body: &str) -> PathBuf {
    let path = dir.join("fake-claude");
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }
    path
}

/// Full harness: temp root, one registered git project named `demo`, and a
/// fake assistant running `script_body`.
async fn harness(script_body: &str) -> Harness {
    let root = tempfile::tempdir().unwrap();
    let repo_dir = root.path().join("repos").join("demo");
    std::fs::create_dir_all(&repo_dir).unwrap();
    init_repo(&repo_dir);

    let script = write_script(root.path(), script_body);
    let config = Arc::new(Config {
        root: root.path().to_path_buf(),
        claude_bin: script.display().to_string(),
        ..Config::default()
    });
    config.ensure_dirs().unwrap();

    let store = Arc::new(Store::connect(&config.db_path()).unwrap());
    register_project(&store, &repo_dir, Some("Demo"), Some("demo"))
        .await
        .unwrap();

    let chat = Arc::new(MockChat::default());
    let tracker_config = TrackerConfig {
        update_interval_ms: 10,
        ..TrackerConfig::default()
    };
    let orchestrator = Orchestrator::new(config, store, chat.clone(), tracker_config);

    Harness {
        _root: root,
        orchestrator,
        chat,
    }
}

const HAPPY_SCRIPT: &str = r#"
echo '{"type":"system","subtype":"init","tools":["Read","Bash"],"cwd":"."}'
echo '{"type":"assistant","message":{"content":[{"type":"text","text":"Hello!"}]}}'
echo '{"type":"result","subtype":"success","num_turns":1,"duration_ms":42,"usage":{"input_tokens":10,"output_tokens":3}}'
exit 0"#;

// ── Scenario 1: create session, run instruction, succeed ──────────────────────

#[tokio::test]
async fn create_session_run_instruction_succeed() {
    let h = harness(HAPPY_SCRIPT).await;

    let session = h
        .orchestrator
        .sessions
        .create_session("demo", None, None)
        .await
        .unwrap();
    assert_eq!(session.session_id, "S1");

    let job = h.run_instruction("S1", "print hello").await;
    let done = h.wait_terminal(&job.job_id).await;

    assert_eq!(done.status, JobStatus::Done);
    assert!(done.result_summary.as_deref().unwrap().contains("Hello!"));
    assert!(done.started_at.unwrap() <= done.finished_at.unwrap());

    assert_eq!(h.session_state("S1").await, SessionState::Idle);
    let session = h.store().get_session("S1").await.unwrap().unwrap();
    assert!(session.last_summary.unwrap().contains("Hello!"));

    // Tracker message ended on the done footer; a completion reply followed.
    let edits = h.chat.edits.lock().await;
    let final_edit = &edits.last().unwrap().2;
    assert!(final_edit.contains("✅ *Done*"));
    assert!(final_edit.contains("Hello!"));

    let replies = h.chat.replies.lock().await;
    assert_eq!(replies.len(), 1);
    assert!(replies[0].2.contains("Job Completed"));
}

// ── Scenario 2: cancel mid-run ────────────────────────────────────────────────

#[tokio::test]
async fn cancel_mid_run_posts_cancelled_reply() {
    let script = r#"
echo '{"type":"assistant","message":{"content":[{"type":"tool_use","id":"t1","name":"Bash","input":{"command":"ls"}}]}}'
echo '{"type":"assistant","message":{"content":[{"type":"tool_use","id":"t2","name":"Read","input":{"file_path":"a.rs"}}]}}'
sleep 30"#;
    let h = harness(script).await;
    h.orchestrator
        .sessions
        .create_session("demo", None, None)
        .await
        .unwrap();

    let job = h.run_instruction("S1", "run forever").await;

    // Wait until both tool events reached the tracker.
    for _ in 0..200 {
        let buffered = h
            .orchestrator
            .tracker
            .tracker(&job.job_id)
            .await
            .map(|s| s.events.len())
            .unwrap_or(0);
        if buffered >= 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    h.orchestrator.executor.cancel(&job.job_id).await.unwrap();
    let canceled = h.wait_terminal(&job.job_id).await;
    assert_eq!(canceled.status, JobStatus::Canceled);
    assert_eq!(h.session_state("S1").await, SessionState::Idle);

    let edits = h.chat.edits.lock().await;
    assert!(edits.last().unwrap().2.contains("⏹️ *Cancelled*"));
    let replies = h.chat.replies.lock().await;
    assert!(replies[0].2.contains("Job Cancelled"));
}

// ── Scenario 3 & 4: approval approve / deny ───────────────────────────────────

const APPROVAL_SCRIPT: &str = r#"
echo '{"type":"control_request","request":{"subtype":"can_use_tool","tool_name":"Bash","input":{"command":"rm -rf build"}}}'
read reply
case "$reply" in
  *allow*)
    echo '{"type":"assistant","message":{"content":[{"type":"text","text":"cleaned"}]}}'
    echo '{"type":"result","subtype":"success","num_turns":1}'
    exit 0
    ;;
  *)
    exit 1
    ;;
esac"#;

#[tokio::test]
async fn approval_approve_resumes_to_done() {
    let h = harness(APPROVAL_SCRIPT).await;
    h.orchestrator
        .sessions
        .create_session("demo", None, None)
        .await
        .unwrap();
    let job = h.run_instruction("S1", "clean the build dir").await;

    h.wait_job_status(&job.job_id, JobStatus::WaitingApproval).await;
    assert_eq!(h.session_state("S1").await, SessionState::Blocked);

    // Exactly one pending approval references the job, and its prompt was
    // posted to the chat with a stored locator.
    let pending = h.orchestrator.gate.pending(Some("S1")).await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].job_id, job.job_id);
    {
        let sent = h.chat.sent.lock().await;
        assert!(sent.iter().any(|(_, text)| text.contains("Approval Required")));
    }
    let stored = h
        .store()
        .get_approval(&pending[0].approval_id)
        .await
        .unwrap()
        .unwrap();
    assert!(stored.message_id.is_some());

    h.orchestrator
        .gate
        .approve(&pending[0].approval_id, "user")
        .await
        .unwrap();

    let done = h.wait_terminal(&job.job_id).await;
    assert_eq!(done.status, JobStatus::Done);
    assert_eq!(h.session_state("S1").await, SessionState::Idle);

    let approval = h
        .store()
        .get_approval(&pending[0].approval_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(approval.resolved_by.as_deref(), Some("user"));
}

#[tokio::test]
async fn approval_deny_cancels_with_reason() {
    let h = harness(APPROVAL_SCRIPT).await;
    h.orchestrator
        .sessions
        .create_session("demo", None, None)
        .await
        .unwrap();
    let job = h.run_instruction("S1", "clean the build dir").await;

    h.wait_job_status(&job.job_id, JobStatus::WaitingApproval).await;
    let pending = h.orchestrator.gate.pending(None).await.unwrap();
    assert_eq!(pending.len(), 1);

    h.orchestrator
        .gate
        .deny(&pending[0].approval_id, "user", Some("no"))
        .await
        .unwrap();

    let canceled = h.wait_terminal(&job.job_id).await;
    assert_eq!(canceled.status, JobStatus::Canceled);
    assert_eq!(canceled.error.as_deref(), Some("Denied by user: no"));
    assert_eq!(h.session_state("S1").await, SessionState::Idle);
}

// ── Scenario 5: second submit refused ─────────────────────────────────────────

#[tokio::test]
async fn second_submit_refused_while_running() {
    let h = harness("sleep 10").await;
    h.orchestrator
        .sessions
        .create_session("demo", None, None)
        .await
        .unwrap();
    let job = h.run_instruction("S1", "first").await;
    h.wait_job_status(&job.job_id, JobStatus::Running).await;

    let err = h
        .orchestrator
        .executor
        .submit("S1", "other")
        .await
        .unwrap_err();
    assert!(matches!(err, televibe_runner::RunnerError::Busy { .. }));

    // Job state unchanged, no second row.
    let jobs = h.store().list_jobs_by_session("S1", 10).await.unwrap();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].status, JobStatus::Running);

    h.orchestrator.executor.cancel(&job.job_id).await.unwrap();
    h.wait_terminal(&job.job_id).await;
}

// ── Scenario 6: filtered rendering ────────────────────────────────────────────

#[tokio::test]
async fn filtered_rendering_shows_speech_only() {
    let h = harness(HAPPY_SCRIPT).await;
    h.orchestrator
        .tracker
        .set_chat_config(
            CHAT_ID,
            TrackerConfig {
                show_tool_start: false,
                show_ai_speech: true,
                update_interval_ms: 10,
                ..TrackerConfig::default()
            },
        )
        .await;
    h.orchestrator
        .tracker
        .create_tracker(CHAT_ID, "job1", "S1", "Demo", "filter test")
        .await
        .unwrap();

    let tool_line = r#"{"type":"assistant","message":{"content":[{"type":"tool_use","id":"t1","name":"Bash","input":{"command":"ls"}}]}}"#;
    let speech_line = r#"{"type":"assistant","message":{"content":[{"type":"text","text":"done"}]}}"#;
    for line in [tool_line, speech_line] {
        for event in parse_stream_events(line, Some("job1")) {
            h.orchestrator.tracker.add_event("job1", &event).await;
        }
    }

    let edits = h.chat.edits.lock().await;
    let rendered = &edits.last().unwrap().2;
    let speech_lines: Vec<&str> = rendered
        .lines()
        .filter(|l| l.starts_with("💬"))
        .collect();
    assert_eq!(speech_lines.len(), 1);
    assert!(speech_lines[0].contains("done"));
    assert!(!rendered.contains("🔨"));
}

// ── Session close with history ────────────────────────────────────────────────

#[tokio::test]
async fn close_session_after_job_removes_worktree() {
    let h = harness(HAPPY_SCRIPT).await;
    let session = h
        .orchestrator
        .sessions
        .create_session("demo", None, None)
        .await
        .unwrap();
    let job = h.run_instruction("S1", "hello").await;
    h.wait_terminal(&job.job_id).await;

    h.orchestrator.close_session("S1", false).await.unwrap();
    assert!(!Path::new(&session.workspace_path).exists());
    assert!(h.store().get_session("S1").await.unwrap().is_none());
}

// ── Force close cancels the running job ───────────────────────────────────────

#[tokio::test]
async fn force_close_cancels_running_job() {
    let h = harness("sleep 30").await;
    h.orchestrator
        .sessions
        .create_session("demo", None, None)
        .await
        .unwrap();
    let job = h.run_instruction("S1", "long job").await;
    h.wait_job_status(&job.job_id, JobStatus::Running).await;

    h.orchestrator.close_session("S1", true).await.unwrap();
    assert!(h.store().get_session("S1").await.unwrap().is_none());

    let job = h.store().get_job(&job.job_id).await.unwrap();
    // The job row cascades away with its session; if it survived long
    // enough to be read it must be canceled.
    if let Some(job) = job {
        assert_eq!(job.status, JobStatus::Canceled);
    }
}

// ── Stored tracker preferences ────────────────────────────────────────────────

#[tokio::test]
async fn tracker_config_loads_from_stored_preferences() {
    let h = harness(HAPPY_SCRIPT).await;
    h.store().set_tracker_preset(CHAT_ID, "speech").await.unwrap();
    h.store()
        .update_tracker_config(CHAT_ID, "show_cost", serde_json::Value::Bool(true))
        .await
        .unwrap();

    h.orchestrator.refresh_tracker_config(CHAT_ID).await.unwrap();

    let config = h.orchestrator.tracker.get_chat_config(CHAT_ID).await;
    // The speech preset hides tool starts; the stored override wins on cost.
    assert!(!config.show_tool_start);
    assert!(config.show_cost);
}
