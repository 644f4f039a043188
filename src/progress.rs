//! CLI progress reporting.
//!
//! Commands that upload files or wait on tasks report what is happening
//! on **stderr** so stdout stays parseable for scripts. Reporters are
//! chosen by [`ProgressMode`]: human-readable lines, one JSON object per
//! line, or nothing.

use std::io::Write;

use easy_dataset_core::models::Task;

/// A single progress event.
#[derive(Clone, Debug)]
pub enum ProgressEvent {
    /// A file was stored (or matched an existing upload).
    Uploaded {
        file_name: String,
        file_id: String,
        duplicate: bool,
    },
    /// A file was skipped during a directory upload.
    Skipped { path: String, reason: String },
    /// Periodic snapshot of a task being waited on.
    Task {
        task_id: String,
        task_type: String,
        status: String,
        completed: u64,
        total: u64,
    },
}

impl ProgressEvent {
    pub fn from_task(task: &Task) -> Self {
        ProgressEvent::Task {
            task_id: task.id.clone(),
            task_type: task.task_type.as_str().to_string(),
            status: task.status.as_str().to_string(),
            completed: task.completed_units,
            total: task.total_units,
        }
    }
}

/// Reports progress. Implementations write to stderr (human or JSON).
pub trait ProgressReporter: Send + Sync {
    fn report(&self, event: ProgressEvent);
}

/// Human-friendly lines: `task 1a2b…  question_generation  running  12 / 40 units`.
pub struct StderrProgress;

impl ProgressReporter for StderrProgress {
    fn report(&self, event: ProgressEvent) {
        let line = match &event {
            ProgressEvent::Uploaded {
                file_name,
                file_id,
                duplicate,
            } => {
                let note = if *duplicate { "  (already uploaded)" } else { "" };
                format!("upload {}  -> {}{}\n", file_name, file_id, note)
            }
            ProgressEvent::Skipped { path, reason } => {
                format!("skip {}  {}\n", path, reason)
            }
            ProgressEvent::Task {
                task_id,
                task_type,
                status,
                completed,
                total,
            } => format!(
                "task {}  {}  {}  {} / {} units\n",
                short_id(task_id),
                task_type,
                status,
                format_number(*completed),
                format_number(*total)
            ),
        };
        let mut err = std::io::stderr().lock();
        let _ = err.write_all(line.as_bytes());
        let _ = err.flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl ProgressReporter for JsonProgress {
    fn report(&self, event: ProgressEvent) {
        let obj = match &event {
            ProgressEvent::Uploaded {
                file_name,
                file_id,
                duplicate,
            } => serde_json::json!({
                "event": "uploaded",
                "file_name": file_name,
                "file_id": file_id,
                "duplicate": duplicate
            }),
            ProgressEvent::Skipped { path, reason } => serde_json::json!({
                "event": "skipped",
                "path": path,
                "reason": reason
            }),
            ProgressEvent::Task {
                task_id,
                task_type,
                status,
                completed,
                total,
            } => serde_json::json!({
                "event": "progress",
                "task_id": task_id,
                "task_type": task_type,
                "status": status,
                "n": completed,
                "total": total
            }),
        };
        if let Ok(line) = serde_json::to_string(&obj) {
            let mut err = std::io::stderr().lock();
            let _ = writeln!(err, "{}", line);
            let _ = err.flush();
        }
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl ProgressReporter for NoProgress {
    fn report(&self, _event: ProgressEvent) {}
}

fn short_id(id: &str) -> &str {
    id.get(..8).unwrap_or(id)
}

fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + (s.len() - 1) / 3);
    for (i, c) in s.chars().rev().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(c);
    }
    result.chars().rev().collect()
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq, clap::ValueEnum)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Default: human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    pub fn reporter(&self) -> Box<dyn ProgressReporter> {
        match self {
            ProgressMode::Off => Box::new(NoProgress),
            ProgressMode::Human => Box::new(StderrProgress),
            ProgressMode::Json => Box::new(JsonProgress),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_number_comma() {
        assert_eq!(format_number(0), "0");
        assert_eq!(format_number(999), "999");
        assert_eq!(format_number(1000), "1,000");
        assert_eq!(format_number(1_234_567), "1,234,567");
    }

    #[test]
    fn short_id_handles_short_input() {
        assert_eq!(short_id("abc"), "abc");
        assert_eq!(short_id("0123456789abcdef"), "01234567");
    }
}
