// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info, warn};

use televibe_config::Config;
use televibe_protocol::{
    control_response, parse_control_request, parse_stream_events, ControlRequest, EventKind,
    SessionEvent,
};
use televibe_session::enrich_instruction;
use televibe_store::{
    short_id, ApprovalState, Job, JobStatus, SessionState, Store,
};

use crate::bridge::{ApprovalBridge, ApprovalDecision};
use crate::error::RunnerError;
use crate::progress::JobProgress;
use crate::sink::JobSink;

/// Minimum spacing between progress callbacks to the sink.
const PROGRESS_INTERVAL: Duration = Duration::from_secs(3);

/// Grace between SIGTERM and SIGKILL when terminating the child.
const TERMINATE_GRACE: Duration = Duration::from_secs(5);

/// Trailing text events folded into the result summary, and its size cap.
const SUMMARY_LINES: usize = 5;
const SUMMARY_MAX_CHARS: usize = 500;

/// Executes assistant jobs: one child process per job, at most one job per
/// session, bounded globally by `max_concurrent_jobs`.
///
/// `submit` returns immediately with the queued job; the execution task runs
/// concurrently and reports through the [`JobSink`].
#[derive(Clone)]
pub struct JobExecutor {
    config: Arc<Config>,
    store: Arc<Store>,
    sink: Arc<dyn JobSink>,
    bridge: Arc<ApprovalBridge>,
    running: Arc<Mutex<HashMap<String, mpsc::Sender<()>>>>,
    progress: Arc<Mutex<HashMap<String, JobProgress>>>,
}

impl JobExecutor {
    pub fn new(
        config: Arc<Config>,
        store: Arc<Store>,
        sink: Arc<dyn JobSink>,
        bridge: Arc<ApprovalBridge>,
    ) -> Self {
        Self {
            config,
            store,
            sink,
            bridge,
            running: Arc::new(Mutex::new(HashMap::new())),
            progress: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn bridge(&self) -> &Arc<ApprovalBridge> {
        &self.bridge
    }

    /// Submit one instruction to a session.
    ///
    /// Refused with `Busy` while the session has a non-terminal job and with
    /// `Capacity` when the global cap is reached; a job either starts
    /// immediately or is refused; there is no dispatch queue.  The returned
    /// job is in `queued`; the spawned task transitions it to `running`.
    pub async fn submit(&self, session_id: &str, instruction: &str) -> Result<Job, RunnerError> {
        let mut session = self
            .store
            .get_session(session_id)
            .await?
            .ok_or_else(|| RunnerError::not_found("session", session_id))?;

        if session.state != SessionState::Idle {
            return Err(RunnerError::Busy {
                session_id: session_id.to_string(),
                job_id: session.current_job_id.clone(),
            });
        }
        if let Some(current) = &session.current_job_id {
            if let Some(job) = self.store.get_job(current).await? {
                if !job.status.is_terminal() {
                    return Err(RunnerError::Busy {
                        session_id: session_id.to_string(),
                        job_id: Some(job.job_id),
                    });
                }
            }
        }

        {
            let running = self.running.lock().await;
            if running.len() >= self.config.max_concurrent_jobs {
                return Err(RunnerError::Capacity {
                    running: running.len(),
                    max: self.config.max_concurrent_jobs,
                });
            }
        }

        let project = self
            .store
            .get_project(&session.project_id)
            .await?
            .ok_or_else(|| RunnerError::not_found("project", session.project_id.clone()))?;
        let enriched = enrich_instruction(instruction, &session, &project);

        let job_id = short_id();
        let timestamp = Utc::now().format("%Y%m%d_%H%M%S");
        let log_path = self.config.logs_dir().join(format!("{job_id}_{timestamp}.log"));
        std::fs::create_dir_all(self.config.logs_dir())?;

        let mut job = Job::new(&job_id, session_id, &session.project_id, enriched, instruction);
        job.log_path = Some(log_path.display().to_string());
        self.store.create_job(&job).await?;

        session.state = SessionState::Running;
        session.current_job_id = Some(job_id.clone());
        self.store.update_session(&mut session).await?;

        // Register the cancel channel before the task starts so a cancel
        // issued against the queued job is never lost.
        let (cancel_tx, cancel_rx) = mpsc::channel(1);
        self.running.lock().await.insert(job_id.clone(), cancel_tx);

        info!(job_id, session_id, "job submitted");

        let executor = self.clone();
        let task_job = job.clone();
        tokio::spawn(async move {
            executor.execute(task_job, cancel_rx).await;
        });

        Ok(job)
    }

    /// Cancel a non-terminal job: terminate-then-kill its child, transition
    /// the job to canceled and the session back to idle.  A terminal job is
    /// an error and its timestamps are left untouched.
    pub async fn cancel(&self, job_id: &str) -> Result<(), RunnerError> {
        let job = self
            .store
            .get_job(job_id)
            .await?
            .ok_or_else(|| RunnerError::not_found("job", job_id))?;
        if job.status.is_terminal() {
            return Err(RunnerError::Terminal {
                job_id: job_id.to_string(),
                status: job.status,
            });
        }

        let sender = self.running.lock().await.get(job_id).cloned();
        match sender {
            Some(tx) => {
                // Wake the job task; it terminates the child and finalizes.
                let _ = tx.try_send(());
                // A job suspended on an approval is woken through the bridge.
                self.bridge.abandon(job_id).await;
                Ok(())
            }
            None => {
                // No in-flight task (e.g. a row orphaned by a restart):
                // terminalize directly.
                let mut job = job;
                job.status = JobStatus::Canceled;
                job.error = Some("Job was cancelled".to_string());
                job.finished_at = Some(Utc::now());
                self.store.update_job(&job).await?;
                self.release_session(&job).await;
                Ok(())
            }
        }
    }

    /// Current in-memory progress for a running job.
    pub async fn progress(&self, job_id: &str) -> Option<JobProgress> {
        self.progress.lock().await.get(job_id).cloned()
    }

    pub async fn running_job_ids(&self) -> Vec<String> {
        self.running.lock().await.keys().cloned().collect()
    }

    // ── Execution task ────────────────────────────────────────────────────────

    async fn execute(self, mut job: Job, cancel_rx: mpsc::Receiver<()>) {
        self.run_to_completion(&mut job, cancel_rx).await;

        // Finalization runs unconditionally, cancellation included.
        job.finished_at = Some(Utc::now());
        if let Err(e) = self.store.update_job(&job).await {
            error!(job_id = %job.job_id, error = %e, "failed to persist job result");
        }
        self.release_session(&job).await;
        self.running.lock().await.remove(&job.job_id);
        self.progress.lock().await.remove(&job.job_id);
        self.sink.on_complete(&job).await;
        info!(job_id = %job.job_id, status = %job.status, "job completed");
    }

    async fn run_to_completion(&self, job: &mut Job, mut cancel_rx: mpsc::Receiver<()>) {
        let workspace = match self.store.get_session(&job.session_id).await {
            Ok(Some(session)) => PathBuf::from(session.workspace_path),
            Ok(None) => {
                job.status = JobStatus::Failed;
                job.error = Some("Session not found".to_string());
                return;
            }
            Err(e) => {
                job.status = JobStatus::Failed;
                job.error = Some(e.to_string());
                return;
            }
        };
        if !workspace.exists() {
            job.status = JobStatus::Failed;
            job.error = Some(format!("Workspace does not exist: {}", workspace.display()));
            return;
        }

        job.status = JobStatus::Running;
        job.started_at = Some(Utc::now());
        if let Err(e) = self.store.update_job(job).await {
            job.status = JobStatus::Failed;
            job.error = Some(e.to_string());
            return;
        }

        let mut progress = JobProgress::new(&job.job_id);
        progress.status = "running".to_string();
        self.progress
            .lock()
            .await
            .insert(job.job_id.clone(), progress.clone());

        // ── Spawn the assistant child ─────────────────────────────────────────
        let mut cmd = Command::new(&self.config.claude_bin);
        cmd.arg("-p")
            .arg(&job.instruction)
            .args(["--output-format", "stream-json"]);
        cmd.current_dir(&workspace);
        // Minimal environment: search path, home, and the entrypoint marker.
        cmd.env_clear();
        cmd.env(
            "PATH",
            std::env::var("PATH").unwrap_or_else(|_| "/usr/local/bin:/usr/bin:/bin".to_string()),
        );
        if let Some(home) = dirs::home_dir() {
            cmd.env("HOME", home);
        }
        cmd.env("CLAUDE_CODE_ENTRYPOINT", "televibe");
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                job.status = JobStatus::Failed;
                job.error = Some(format!("Failed to start assistant: {e}"));
                return;
            }
        };
        let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
            job.status = JobStatus::Failed;
            job.error = Some("Failed to capture assistant output".to_string());
            let _ = child.kill().await;
            return;
        };
        let mut stdin = child.stdin.take();

        let mut log_file = job.log_path.as_ref().and_then(|path| {
            std::fs::File::create(path)
                .map_err(|e| warn!(job_id = %job.job_id, error = %e, "cannot open job log"))
                .ok()
        });

        let mut out_lines = BufReader::new(stdout).lines();
        let mut err_lines = BufReader::new(stderr).lines();
        let mut stdout_done = false;
        let mut stderr_done = false;

        let start = Instant::now();
        let mut last_progress: Option<Instant> = None;
        let mut summary_lines: Vec<String> = Vec::new();
        let mut files_changed: Vec<String> = Vec::new();
        let mut canceled = false;
        let mut denial: Option<String> = None;

        // ── Event pump ────────────────────────────────────────────────────────
        // The line-read suspension points keep the task cancelable: a cancel
        // signal interrupts promptly and the finalizer in execute() runs.
        while !(stdout_done && stderr_done) {
            let control = tokio::select! {
                biased;

                _ = cancel_rx.recv() => {
                    canceled = true;
                    break;
                }

                line = out_lines.next_line(), if !stdout_done => {
                    match line {
                        Ok(Some(line)) => {
                            self.process_line(
                                job, &line, &mut log_file, &mut progress, start,
                                &mut last_progress, &mut summary_lines, &mut files_changed,
                            )
                            .await
                        }
                        Ok(None) => {
                            stdout_done = true;
                            None
                        }
                        Err(e) => {
                            warn!(job_id = %job.job_id, error = %e, "stdout read failed");
                            stdout_done = true;
                            None
                        }
                    }
                }

                line = err_lines.next_line(), if !stderr_done => {
                    match line {
                        Ok(Some(line)) => {
                            self.process_line(
                                job, &line, &mut log_file, &mut progress, start,
                                &mut last_progress, &mut summary_lines, &mut files_changed,
                            )
                            .await
                        }
                        Ok(None) => {
                            stderr_done = true;
                            None
                        }
                        Err(e) => {
                            warn!(job_id = %job.job_id, error = %e, "stderr read failed");
                            stderr_done = true;
                            None
                        }
                    }
                }
            };

            // ── Approval interlock ────────────────────────────────────────────
            // The child blocks on its stdin until the control response
            // arrives, so it cannot advance past the privileged action.
            if let Some(request) = control {
                match self.await_approval(job, &request, &mut stdin, &mut cancel_rx).await {
                    ApprovalOutcome::Approved => {}
                    ApprovalOutcome::Denied(err) => {
                        denial = Some(err);
                        break;
                    }
                    ApprovalOutcome::Canceled => {
                        canceled = true;
                        break;
                    }
                }
            }
        }

        // ── Terminalize ───────────────────────────────────────────────────────
        if canceled || denial.is_some() {
            terminate_child(&mut child).await;
            job.status = JobStatus::Canceled;
            job.error = Some(denial.unwrap_or_else(|| "Job was cancelled".to_string()));
            progress.status = "cancelled".to_string();
        } else {
            drop(stdin.take());
            match child.wait().await {
                Ok(status) if status.success() => {
                    job.status = JobStatus::Done;
                    let tail: Vec<&str> = summary_lines
                        .iter()
                        .rev()
                        .take(SUMMARY_LINES)
                        .map(String::as_str)
                        .collect();
                    let summary: String = tail
                        .into_iter()
                        .rev()
                        .collect::<Vec<_>>()
                        .join("\n")
                        .chars()
                        .take(SUMMARY_MAX_CHARS)
                        .collect();
                    job.result_summary = Some(summary);
                    progress.status = "done".to_string();
                }
                Ok(status) => {
                    let code = status.code().unwrap_or(-1);
                    job.status = JobStatus::Failed;
                    job.error = Some(format!("Process exited with code {code}"));
                    progress.status = "failed".to_string();
                    progress.error = job.error.clone();
                }
                Err(e) => {
                    job.status = JobStatus::Failed;
                    job.error = Some(format!("Failed to reap assistant: {e}"));
                    progress.status = "failed".to_string();
                }
            }
        }

        job.files_changed = if files_changed.is_empty() {
            None
        } else {
            Some(files_changed)
        };

        progress.elapsed_seconds = start.elapsed().as_secs();
        self.sink.on_progress(&job.job_id, &progress).await;
    }

    /// Mirror one output line to the log, feed the parsers, fold events into
    /// progress.  Returns a control request when the line opens the approval
    /// side channel.
    #[allow(clippy::too_many_arguments)]
    async fn process_line(
        &self,
        job: &mut Job,
        line: &str,
        log_file: &mut Option<std::fs::File>,
        progress: &mut JobProgress,
        start: Instant,
        last_progress: &mut Option<Instant>,
        summary_lines: &mut Vec<String>,
        files_changed: &mut Vec<String>,
    ) -> Option<ControlRequest> {
        if let Some(file) = log_file {
            let _ = writeln!(file, "{line}");
            let _ = file.flush();
        }

        if let Some(request) = parse_control_request(line) {
            return Some(request);
        }

        progress.elapsed_seconds = start.elapsed().as_secs();

        let events = parse_stream_events(line, Some(&job.job_id));
        if events.is_empty() {
            // Plain text output still contributes to the result summary.
            let trimmed = line.trim();
            if !trimmed.is_empty() && serde_json::from_str::<serde_json::Value>(line).is_err() {
                summary_lines.push(trimmed.chars().take(200).collect());
            }
            return None;
        }

        for event in &events {
            self.sink.on_event(&job.job_id, event).await;
            fold_event(event, progress, summary_lines, files_changed);
        }

        self.progress
            .lock()
            .await
            .insert(job.job_id.clone(), progress.clone());

        if last_progress.map_or(true, |t| t.elapsed() >= PROGRESS_INTERVAL) {
            self.sink.on_progress(&job.job_id, progress).await;
            *last_progress = Some(Instant::now());
        }

        None
    }

    /// Suspend the job on a privileged-action request until the approval
    /// bridge resolves or the job is canceled.
    async fn await_approval(
        &self,
        job: &mut Job,
        request: &ControlRequest,
        stdin: &mut Option<ChildStdin>,
        cancel_rx: &mut mpsc::Receiver<()>,
    ) -> ApprovalOutcome {
        job.status = JobStatus::WaitingApproval;
        job.approval_required = true;
        if let Err(e) = self.store.update_job(job).await {
            warn!(job_id = %job.job_id, error = %e, "failed to persist waiting-approval");
        }
        let _ = self
            .store
            .update_session_state(&job.session_id, SessionState::Blocked)
            .await;

        let decision_rx = self.bridge.register(&job.job_id).await;
        self.sink.on_approval_needed(&job.job_id, request).await;
        debug!(job_id = %job.job_id, tool = %request.tool_name, "awaiting approval");

        let decision = tokio::select! {
            biased;
            _ = cancel_rx.recv() => {
                self.bridge.abandon(&job.job_id).await;
                return ApprovalOutcome::Canceled;
            }
            decision = decision_rx => decision,
        };

        match decision {
            Ok(ApprovalDecision::Allow { by }) => {
                debug!(job_id = %job.job_id, by, "approval granted, resuming child");
                if let Some(stdin) = stdin.as_mut() {
                    let line = control_response(true) + "\n";
                    let _ = stdin.write_all(line.as_bytes()).await;
                    let _ = stdin.flush().await;
                }
                job.status = JobStatus::Running;
                job.approval_state = Some(ApprovalState::Approved);
                if let Err(e) = self.store.update_job(job).await {
                    warn!(job_id = %job.job_id, error = %e, "failed to persist resume");
                }
                let _ = self
                    .store
                    .update_session_state(&job.session_id, SessionState::Running)
                    .await;
                ApprovalOutcome::Approved
            }
            Ok(decision @ ApprovalDecision::Deny { .. }) => {
                if let Some(stdin) = stdin.as_mut() {
                    let line = control_response(false) + "\n";
                    let _ = stdin.write_all(line.as_bytes()).await;
                    let _ = stdin.flush().await;
                }
                job.approval_state = Some(ApprovalState::Denied);
                ApprovalOutcome::Denied(
                    decision
                        .denial_error()
                        .unwrap_or_else(|| "Denied".to_string()),
                )
            }
            // Waiter dropped without a decision: the job was canceled while
            // suspended.
            Err(_) => ApprovalOutcome::Canceled,
        }
    }

    /// Flip the session back to idle and copy the result summary.
    async fn release_session(&self, job: &Job) {
        match self.store.get_session(&job.session_id).await {
            Ok(Some(mut session)) => {
                session.state = SessionState::Idle;
                session.current_job_id = None;
                session.last_summary = job.result_summary.clone();
                if let Err(e) = self.store.update_session(&mut session).await {
                    error!(job_id = %job.job_id, error = %e, "failed to release session");
                }
            }
            Ok(None) => {}
            Err(e) => error!(job_id = %job.job_id, error = %e, "failed to load session"),
        }
    }
}

enum ApprovalOutcome {
    Approved,
    Denied(String),
    Canceled,
}

/// Fold one typed event into the aggregate progress.
fn fold_event(
    event: &SessionEvent,
    progress: &mut JobProgress,
    summary_lines: &mut Vec<String>,
    files_changed: &mut Vec<String>,
) {
    match &event.kind {
        EventKind::Speech { text } if !text.is_empty() => {
            summary_lines.push(text.chars().take(200).collect());
            progress.message_count += 1;
            progress.last_message = Some(text.chars().take(100).collect());
        }
        EventKind::ToolStart { tool_name, .. } => {
            progress.tool_count += 1;
            progress.current_tool = Some(tool_name.clone());
            if matches!(tool_name.as_str(), "Write" | "Edit" | "MultiEdit") {
                if let Some(path) = event.file_path() {
                    if !files_changed.iter().any(|f| f == path) {
                        files_changed.push(path.to_string());
                    }
                    if !progress.files_touched.iter().any(|f| f == path) {
                        progress.files_touched.push(path.to_string());
                    }
                }
            }
        }
        EventKind::ToolResult { .. } => {
            progress.current_tool = None;
        }
        _ => {}
    }
}

/// SIGTERM, bounded grace, then SIGKILL.  The job transitions regardless of
/// whether signal delivery succeeded.
async fn terminate_child(child: &mut Child) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        unsafe {
            libc::kill(pid as i32, libc::SIGTERM);
        }
        if tokio::time::timeout(TERMINATE_GRACE, child.wait()).await.is_ok() {
            return;
        }
    }
    let _ = child.kill().await;
}

// ── Log retrieval ─────────────────────────────────────────────────────────────

/// Tail of a job's raw event log.
#[derive(Debug, Clone)]
pub struct JobLogs {
    pub job_id: String,
    pub status: JobStatus,
    pub log_path: Option<String>,
    pub lines: String,
}

/// Read the last `tail` lines of a job's log file.
pub async fn job_logs(store: &Store, job_id: &str, tail: usize) -> Result<JobLogs, RunnerError> {
    let job = store
        .get_job(job_id)
        .await?
        .ok_or_else(|| RunnerError::not_found("job", job_id))?;

    let mut lines = String::new();
    if let Some(path) = &job.log_path {
        if let Ok(content) = std::fs::read_to_string(path) {
            let all: Vec<&str> = content.trim_end().lines().collect();
            let keep = all.len().saturating_sub(tail);
            lines = all[keep..].join("\n");
        }
    }

    Ok(JobLogs {
        job_id: job.job_id,
        status: job.status,
        log_path: job.log_path,
        lines,
    })
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    use televibe_store::{Project, Session};

    use crate::sink::NullSink;

    /// Write an executable shell script standing in for the assistant CLI.
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

    struct Fixture {
        _root: tempfile::TempDir,
        store: Arc<Store>,
        executor: JobExecutor,
    }

    /// Store with project `demo` + session `S1` whose workspace is a plain
    /// temp directory, and an executor whose assistant is `script_body`.
    async fn fixture(script_body: &str, max_jobs: usize) -> Fixture {
        let root = tempfile::tempdir().unwrap();
        let script = write_script(root.path(), script_body);

        let config = Arc::new(Config {
            root: root.path().to_path_buf(),
            claude_bin: script.display().to_string(),
            max_concurrent_jobs: max_jobs,
            ..Config::default()
        });
        config.ensure_dirs().unwrap();

        let store = Arc::new(Store::connect_in_memory().unwrap());
        store
            .create_project(&Project::new("demo", "Demo", "/repos/demo"))
            .await
            .unwrap();

        for sid in ["S1", "S2"] {
            let ws = root.path().join("ws").join(sid);
            std::fs::create_dir_all(&ws).unwrap();
            let session = Session::new(sid, "demo", ws.display().to_string(), format!("televibe/{sid}"));
            store.create_session(&session).await.unwrap();
        }

        let executor = JobExecutor::new(
            config,
            store.clone(),
            Arc::new(NullSink),
            Arc::new(ApprovalBridge::new()),
        );
        Fixture {
            _root: root,
            store,
            executor,
        }
    }

    /// Poll until the job reaches a terminal status.
    async fn wait_terminal(store: &Store, job_id: &str) -> Job {
        for _ in 0..200 {
            let job = store.get_job(job_id).await.unwrap().unwrap();
            if job.status.is_terminal() {
                return job;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("job {job_id} never terminalized");
    }

    async fn wait_status(store: &Store, job_id: &str, status: JobStatus) {
        for _ in 0..200 {
            let job = store.get_job(job_id).await.unwrap().unwrap();
            if job.status == status {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("job {job_id} never reached {status}");
    }

    const HAPPY_SCRIPT: &str = r#"
echo '{"type":"system","subtype":"init","tools":["Bash"],"cwd":"."}'
echo '{"type":"assistant","message":{"content":[{"type":"text","text":"Hello!"}]}}'
echo '{"type":"result","subtype":"success","num_turns":1,"duration_ms":5,"usage":{"input_tokens":10,"output_tokens":2}}'
exit 0"#;

    // ── Happy path ────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn successful_job_reaches_done_and_releases_session() {
        let f = fixture(HAPPY_SCRIPT, 3).await;

        let job = f.executor.submit("S1", "print hello").await.unwrap();
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.raw_input, "print hello");
        assert!(job.instruction.contains("# TeleVibe Session Context"));

        let done = wait_terminal(&f.store, &job.job_id).await;
        assert_eq!(done.status, JobStatus::Done);
        assert!(done.result_summary.unwrap().contains("Hello!"));
        assert!(done.started_at.unwrap() <= done.finished_at.unwrap());

        let session = f.store.get_session("S1").await.unwrap().unwrap();
        assert_eq!(session.state, SessionState::Idle);
        assert!(session.current_job_id.is_none());
        assert!(session.last_summary.unwrap().contains("Hello!"));
    }

    #[tokio::test]
    async fn job_log_mirrors_raw_lines() {
        let f = fixture(HAPPY_SCRIPT, 3).await;
        let job = f.executor.submit("S1", "hi").await.unwrap();
        wait_terminal(&f.store, &job.job_id).await;

        let logs = job_logs(&f.store, &job.job_id, 50).await.unwrap();
        assert!(logs.lines.contains(r#""type":"system""#));
        assert!(logs.lines.contains("Hello!"));
    }

    // ── Failure path ──────────────────────────────────────────────────────────

    #[tokio::test]
    async fn nonzero_exit_fails_with_code() {
        let f = fixture("exit 3", 3).await;
        let job = f.executor.submit("S1", "boom").await.unwrap();

        let failed = wait_terminal(&f.store, &job.job_id).await;
        assert_eq!(failed.status, JobStatus::Failed);
        assert_eq!(failed.error.as_deref(), Some("Process exited with code 3"));

        let session = f.store.get_session("S1").await.unwrap().unwrap();
        assert_eq!(session.state, SessionState::Idle);
    }

    // ── Busy / capacity ───────────────────────────────────────────────────────

    #[tokio::test]
    async fn second_submit_on_busy_session_is_refused() {
        let f = fixture("sleep 5", 3).await;
        let job = f.executor.submit("S1", "first").await.unwrap();

        let err = f.executor.submit("S1", "second").await.unwrap_err();
        assert!(matches!(err, RunnerError::Busy { .. }));

        // The running job is untouched and no second row exists.
        assert_eq!(f.store.list_jobs_by_session("S1", 10).await.unwrap().len(), 1);
        f.executor.cancel(&job.job_id).await.unwrap();
        wait_terminal(&f.store, &job.job_id).await;
    }

    #[tokio::test]
    async fn global_capacity_is_enforced() {
        let f = fixture("sleep 5", 1).await;
        let job = f.executor.submit("S1", "first").await.unwrap();

        let err = f.executor.submit("S2", "second").await.unwrap_err();
        assert!(matches!(err, RunnerError::Capacity { running: 1, max: 1 }));

        f.executor.cancel(&job.job_id).await.unwrap();
        wait_terminal(&f.store, &job.job_id).await;
    }

    // ── Cancellation ──────────────────────────────────────────────────────────

    #[tokio::test]
    async fn cancel_terminates_child_and_releases_session() {
        let f = fixture("sleep 30", 3).await;
        let job = f.executor.submit("S1", "long").await.unwrap();
        wait_status(&f.store, &job.job_id, JobStatus::Running).await;

        f.executor.cancel(&job.job_id).await.unwrap();
        let canceled = wait_terminal(&f.store, &job.job_id).await;
        assert_eq!(canceled.status, JobStatus::Canceled);
        assert_eq!(canceled.error.as_deref(), Some("Job was cancelled"));

        let session = f.store.get_session("S1").await.unwrap().unwrap();
        assert_eq!(session.state, SessionState::Idle);
    }

    #[tokio::test]
    async fn cancel_terminal_job_is_an_error_and_keeps_timestamps() {
        let f = fixture(HAPPY_SCRIPT, 3).await;
        let job = f.executor.submit("S1", "hi").await.unwrap();
        let done = wait_terminal(&f.store, &job.job_id).await;

        let err = f.executor.cancel(&job.job_id).await.unwrap_err();
        assert!(matches!(err, RunnerError::Terminal { .. }));

        let after = f.store.get_job(&job.job_id).await.unwrap().unwrap();
        assert_eq!(after.finished_at, done.finished_at);
    }

    // ── Approval interlock ────────────────────────────────────────────────────

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
    async fn approval_allow_resumes_child_to_done() {
        let f = fixture(APPROVAL_SCRIPT, 3).await;
        let job = f.executor.submit("S1", "clean build").await.unwrap();

        wait_status(&f.store, &job.job_id, JobStatus::WaitingApproval).await;
        let session = f.store.get_session("S1").await.unwrap().unwrap();
        assert_eq!(session.state, SessionState::Blocked);

        assert!(
            f.executor
                .bridge()
                .resolve(&job.job_id, ApprovalDecision::Allow { by: "user".into() })
                .await
        );

        let done = wait_terminal(&f.store, &job.job_id).await;
        assert_eq!(done.status, JobStatus::Done);
        assert_eq!(done.approval_state, Some(ApprovalState::Approved));
        assert!(done.result_summary.unwrap().contains("cleaned"));

        let session = f.store.get_session("S1").await.unwrap().unwrap();
        assert_eq!(session.state, SessionState::Idle);
    }

    #[tokio::test]
    async fn approval_deny_cancels_with_denial_error() {
        let f = fixture(APPROVAL_SCRIPT, 3).await;
        let job = f.executor.submit("S1", "clean build").await.unwrap();
        wait_status(&f.store, &job.job_id, JobStatus::WaitingApproval).await;

        f.executor
            .bridge()
            .resolve(
                &job.job_id,
                ApprovalDecision::Deny {
                    by: "user".into(),
                    reason: Some("no".into()),
                },
            )
            .await;

        let canceled = wait_terminal(&f.store, &job.job_id).await;
        assert_eq!(canceled.status, JobStatus::Canceled);
        assert_eq!(canceled.error.as_deref(), Some("Denied by user: no"));
        assert_eq!(canceled.approval_state, Some(ApprovalState::Denied));

        let session = f.store.get_session("S1").await.unwrap().unwrap();
        assert_eq!(session.state, SessionState::Idle);
    }

    #[tokio::test]
    async fn cancel_while_waiting_approval_cancels_job() {
        let f = fixture(APPROVAL_SCRIPT, 3).await;
        let job = f.executor.submit("S1", "clean build").await.unwrap();
        wait_status(&f.store, &job.job_id, JobStatus::WaitingApproval).await;

        f.executor.cancel(&job.job_id).await.unwrap();
        let canceled = wait_terminal(&f.store, &job.job_id).await;
        assert_eq!(canceled.status, JobStatus::Canceled);
    }

    // ── Progress ──────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn progress_tracks_files_from_edit_tools() {
        let script = r#"
echo '{"type":"assistant","message":{"content":[{"type":"tool_use","id":"t1","name":"Edit","input":{"file_path":"src/a.rs"}}]}}'
echo '{"type":"assistant","message":{"content":[{"type":"tool_use","id":"t2","name":"Edit","input":{"file_path":"src/a.rs"}}]}}'
echo '{"type":"result","subtype":"success"}'
exit 0"#;
        let f = fixture(script, 3).await;
        let job = f.executor.submit("S1", "edit").await.unwrap();

        let done = wait_terminal(&f.store, &job.job_id).await;
        // Duplicate edits of one file count once.
        assert_eq!(done.files_changed.unwrap(), vec!["src/a.rs"]);
    }
}
