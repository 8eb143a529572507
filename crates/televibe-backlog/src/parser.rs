// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::path::Path;

use serde_yaml::Value;
use walkdir::WalkDir;

use televibe_store::{Task, TaskPriority, TaskStatus};

/// Split YAML front-matter from markdown body.  The front-matter must start
/// at the very first line with `---` and close with `---` on its own line;
/// anything else (including invalid YAML) falls through as plain body.
pub fn parse_front_matter(content: &str) -> (Option<serde_yaml::Mapping>, &str) {
    let Some(rest) = content.strip_prefix("---\n") else {
        return (None, content);
    };
    let Some(end) = rest.find("\n---\n").map(|i| (i, "\n---\n".len())).or_else(|| {
        rest.find("\n---")
            .filter(|&i| rest[i + 4..].is_empty())
            .map(|i| (i, "\n---".len()))
    }) else {
        return (None, content);
    };
    let (yaml_end, delim_len) = end;

    let yaml_src = &rest[..yaml_end];
    let body = rest[yaml_end + delim_len..].trim_start_matches('\n');

    match serde_yaml::from_str::<Value>(yaml_src) {
        Ok(Value::Mapping(map)) => (Some(map), body),
        _ => (None, content),
    }
}

fn get_str(map: &serde_yaml::Mapping, key: &str) -> Option<String> {
    match map.get(key)? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Task id from front-matter, then a `T-…` filename prefix, then a bare
/// numeric prefix.  `None` when no convention matches.
fn extract_task_id(filename: &str, front_matter: Option<&serde_yaml::Mapping>) -> Option<String> {
    if let Some(id) = front_matter.and_then(|m| get_str(m, "id")) {
        return Some(id);
    }

    let stem = filename;
    if stem.starts_with('T') {
        let digits: String = stem[1..]
            .trim_start_matches('-')
            .chars()
            .take_while(char::is_ascii_digit)
            .collect();
        if !digits.is_empty() {
            return Some(format!("T-{digits}"));
        }
    }
    let digits: String = stem.chars().take_while(char::is_ascii_digit).collect();
    if !digits.is_empty() {
        return Some(format!("T-{digits}"));
    }
    None
}

/// Title from front-matter, then the first `# ` heading, finally a
/// prettified filename.
fn extract_title(filename: &str, front_matter: Option<&serde_yaml::Mapping>, body: &str) -> String {
    if let Some(title) = front_matter.and_then(|m| get_str(m, "title")) {
        return title;
    }

    for line in body.lines() {
        if let Some(heading) = line.trim().strip_prefix("# ") {
            return heading.trim().to_string();
        }
    }

    let stem = Path::new(filename)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(filename);
    // Strip a task-id prefix like "T-001-" or "001-".
    let stem = stem
        .trim_start_matches('T')
        .trim_start_matches('-')
        .trim_start_matches(|c: char| c.is_ascii_digit())
        .trim_start_matches('-');
    stem.replace(['-', '_'], " ").trim().to_string()
}

/// Lenient status parse; unknown values default to todo.
fn parse_status(value: Option<&str>) -> TaskStatus {
    match value.map(|v| v.trim().to_lowercase()).as_deref() {
        Some("in_progress" | "in-progress" | "inprogress" | "wip" | "working") => {
            TaskStatus::InProgress
        }
        Some("blocked" | "on-hold" | "waiting") => TaskStatus::Blocked,
        Some("review" | "needs_review" | "needs-review") => TaskStatus::NeedsReview,
        Some("done" | "completed" | "closed" | "finished") => TaskStatus::Done,
        _ => TaskStatus::Todo,
    }
}

/// Lenient priority parse; unknown values default to medium.
fn parse_priority(value: Option<&str>) -> TaskPriority {
    match value.map(|v| v.trim().to_lowercase()).as_deref() {
        Some("low" | "p3" | "minor") => TaskPriority::Low,
        Some("high" | "important" | "p1") => TaskPriority::High,
        Some("critical" | "urgent" | "p0" | "blocker") => TaskPriority::Critical,
        _ => TaskPriority::Medium,
    }
}

/// Tags may be a YAML list or a comma/space separated string.
fn parse_tags(value: Option<&Value>) -> Vec<String> {
    match value {
        Some(Value::Sequence(seq)) => seq
            .iter()
            .filter_map(|v| v.as_str())
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect(),
        Some(Value::String(s)) => {
            let sep = if s.contains(',') { ',' } else { ' ' };
            s.split(sep)
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        }
        _ => Vec::new(),
    }
}

/// Parse one markdown file into a [`Task`].  Returns `None` when the file
/// cannot be read; every readable file produces a task (ids are synthesized
/// from a filename hash as the last resort).
pub fn parse_task_file(path: &Path, project_id: &str) -> Option<Task> {
    let content = std::fs::read_to_string(path).ok()?;
    let filename = path.file_name()?.to_str()?;

    let (front_matter, body) = parse_front_matter(&content);
    let fm = front_matter.as_ref();

    let task_id = extract_task_id(filename, fm).unwrap_or_else(|| {
        let mut hasher = DefaultHasher::new();
        filename.hash(&mut hasher);
        format!("T-{:04}", hasher.finish() % 10_000)
    });

    let title = extract_title(filename, fm, body);

    // First non-heading paragraph becomes the description.
    let description = body
        .split("\n\n")
        .map(str::trim)
        .find(|p| !p.is_empty() && !p.starts_with('#'))
        .map(|p| p.chars().take(500).collect::<String>());

    let mut task = Task::new(task_id, project_id, title);
    task.description = description;
    task.status = parse_status(fm.and_then(|m| get_str(m, "status")).as_deref());
    task.priority = parse_priority(fm.and_then(|m| get_str(m, "priority")).as_deref());
    task.epic = fm.and_then(|m| get_str(m, "epic"));
    task.assignee = fm.and_then(|m| get_str(m, "assignee"));
    task.branch = fm.and_then(|m| get_str(m, "branch"));
    task.session_id = fm.and_then(|m| get_str(m, "session_id"));
    task.tags = parse_tags(fm.and_then(|m| m.get("tags")));
    Some(task)
}

/// Scan a backlog directory for task files.  README and index files are
/// skipped; unreadable files are ignored.
pub fn scan_backlog_dir(backlog_path: &Path, project_id: &str, recursive: bool) -> Vec<Task> {
    if !backlog_path.is_dir() {
        return Vec::new();
    }

    let max_depth = if recursive { usize::MAX } else { 1 };
    let mut tasks: Vec<Task> = WalkDir::new(backlog_path)
        .max_depth(max_depth)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file())
        .filter(|e| e.path().extension().is_some_and(|ext| ext == "md"))
        .filter(|e| {
            let name = e.file_name().to_string_lossy().to_lowercase();
            name != "readme.md" && name != "index.md"
        })
        .filter_map(|e| parse_task_file(e.path(), project_id))
        .collect();
    tasks.sort_by(|a, b| a.task_id.cmp(&b.task_id));
    tasks
}

/// Serialize a task back to markdown with YAML front-matter.  Keys are
/// emitted in a stable order so parse → serialize → parse is lossless for
/// the front-matter keys and the title.
pub fn task_to_markdown(task: &Task) -> String {
    let mut fm = serde_yaml::Mapping::new();
    let mut put = |key: &str, value: Value| {
        fm.insert(Value::String(key.to_string()), value);
    };
    put("id", Value::String(task.task_id.clone()));
    put("status", Value::String(task.status.as_str().to_string()));
    put("priority", Value::String(task.priority.as_str().to_string()));
    if let Some(epic) = &task.epic {
        put("epic", Value::String(epic.clone()));
    }
    if let Some(assignee) = &task.assignee {
        put("assignee", Value::String(assignee.clone()));
    }
    if !task.tags.is_empty() {
        put(
            "tags",
            Value::Sequence(task.tags.iter().cloned().map(Value::String).collect()),
        );
    }
    if let Some(branch) = &task.branch {
        put("branch", Value::String(branch.clone()));
    }
    if let Some(session_id) = &task.session_id {
        put("session_id", Value::String(session_id.clone()));
    }

    let yaml = serde_yaml::to_string(&Value::Mapping(fm)).unwrap_or_default();
    let mut md = format!("---\n{yaml}---\n\n# {}\n", task.title);
    if let Some(description) = &task.description {
        md.push_str(&format!("\n{description}\n"));
    }
    md
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn write_task(dir: &Path, name: &str, content: &str) -> std::path::PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, content).unwrap();
        path
    }

    // ── Front-matter splitting ────────────────────────────────────────────────

    #[test]
    fn front_matter_is_split_from_body() {
        let (fm, body) = parse_front_matter("---\nid: T-1\n---\n\n# Title\nbody\n");
        assert_eq!(get_str(&fm.unwrap(), "id").as_deref(), Some("T-1"));
        assert!(body.starts_with("# Title"));
    }

    #[test]
    fn missing_front_matter_returns_whole_content() {
        let (fm, body) = parse_front_matter("# Just a heading\n");
        assert!(fm.is_none());
        assert_eq!(body, "# Just a heading\n");
    }

    #[test]
    fn invalid_yaml_front_matter_is_treated_as_body() {
        let content = "---\n: : :\n---\nbody";
        let (fm, body) = parse_front_matter(content);
        assert!(fm.is_none());
        assert_eq!(body, content);
    }

    // ── Field extraction ──────────────────────────────────────────────────────

    #[test]
    fn task_id_prefers_front_matter_then_filename() {
        let mut fm = serde_yaml::Mapping::new();
        fm.insert("id".into(), "T-42".into());
        assert_eq!(extract_task_id("x.md", Some(&fm)), Some("T-42".into()));
        assert_eq!(extract_task_id("T-001-fix.md", None), Some("T-001".into()));
        assert_eq!(extract_task_id("007-bond.md", None), Some("T-007".into()));
        assert_eq!(extract_task_id("notes.md", None), None);
    }

    #[test]
    fn title_falls_back_to_heading_then_filename() {
        assert_eq!(extract_title("x.md", None, "# Fix the auth flow\n"), "Fix the auth flow");
        assert_eq!(extract_title("T-001-fix-auth.md", None, "no heading"), "fix auth");
    }

    #[test]
    fn status_synonyms_are_recognised() {
        assert_eq!(parse_status(Some("WIP")), TaskStatus::InProgress);
        assert_eq!(parse_status(Some("needs-review")), TaskStatus::NeedsReview);
        assert_eq!(parse_status(Some("completed")), TaskStatus::Done);
        assert_eq!(parse_status(Some("unknown")), TaskStatus::Todo);
        assert_eq!(parse_status(None), TaskStatus::Todo);
    }

    #[test]
    fn priority_synonyms_are_recognised() {
        assert_eq!(parse_priority(Some("p0")), TaskPriority::Critical);
        assert_eq!(parse_priority(Some("important")), TaskPriority::High);
        assert_eq!(parse_priority(Some("minor")), TaskPriority::Low);
        assert_eq!(parse_priority(None), TaskPriority::Medium);
    }

    #[test]
    fn tags_accept_list_and_comma_string() {
        let list: Value = serde_yaml::from_str("[api, auth]").unwrap();
        assert_eq!(parse_tags(Some(&list)), vec!["api", "auth"]);
        let string = Value::String("api, auth".into());
        assert_eq!(parse_tags(Some(&string)), vec!["api", "auth"]);
        assert!(parse_tags(None).is_empty());
    }

    // ── File parsing ──────────────────────────────────────────────────────────

    #[test]
    fn full_task_file_parses() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_task(
            dir.path(),
            "T-010-login.md",
            "---\nstatus: in-progress\npriority: high\nepic: auth\ntags: [api, auth]\n---\n\n\
             # Implement login\n\nAdd the login endpoint.\n",
        );

        let task = parse_task_file(&path, "demo").unwrap();
        assert_eq!(task.task_id, "T-010");
        assert_eq!(task.title, "Implement login");
        assert_eq!(task.status, TaskStatus::InProgress);
        assert_eq!(task.priority, TaskPriority::High);
        assert_eq!(task.epic.as_deref(), Some("auth"));
        assert_eq!(task.tags, vec!["api", "auth"]);
        assert_eq!(task.description.as_deref(), Some("Add the login endpoint."));
    }

    #[test]
    fn scan_skips_readme_and_non_markdown() {
        let dir = tempfile::tempdir().unwrap();
        write_task(dir.path(), "T-001-a.md", "# A\n");
        write_task(dir.path(), "T-002-b.md", "# B\n");
        write_task(dir.path(), "README.md", "# Not a task\n");
        write_task(dir.path(), "notes.txt", "not markdown");

        let tasks = scan_backlog_dir(dir.path(), "demo", true);
        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks[0].task_id, "T-001");
    }

    #[test]
    fn scan_missing_directory_is_empty() {
        assert!(scan_backlog_dir(Path::new("/no/such/dir"), "demo", true).is_empty());
    }

    // ── Round-trip ────────────────────────────────────────────────────────────

    #[test]
    fn markdown_round_trip_preserves_front_matter_and_title() {
        let dir = tempfile::tempdir().unwrap();
        let mut task = Task::new("T-123", "demo", "Round trip");
        task.status = TaskStatus::NeedsReview;
        task.priority = TaskPriority::Critical;
        task.epic = Some("quality".into());
        task.assignee = Some("sam".into());
        task.tags = vec!["alpha".into(), "beta".into()];
        task.branch = Some("televibe/S4".into());
        task.session_id = Some("S4".into());
        task.description = Some("The body paragraph.".into());

        let md = task_to_markdown(&task);
        let path = write_task(dir.path(), "T-123-round-trip.md", &md);
        let parsed = parse_task_file(&path, "demo").unwrap();

        assert_eq!(parsed.task_id, task.task_id);
        assert_eq!(parsed.title, task.title);
        assert_eq!(parsed.status, task.status);
        assert_eq!(parsed.priority, task.priority);
        assert_eq!(parsed.epic, task.epic);
        assert_eq!(parsed.assignee, task.assignee);
        assert_eq!(parsed.tags, task.tags);
        assert_eq!(parsed.branch, task.branch);
        assert_eq!(parsed.session_id, task.session_id);
        assert_eq!(parsed.description, task.description);
    }
}
