//! Ingestion progress reporting.
//!
//! Directory tasks report how many of their files have been decided so a
//! caller can show "processed / total". Progress is emitted on **stderr** so
//! stdout remains parseable for scripts.

use std::io::Write;
use std::sync::{Arc, Mutex};

/// A single progress event for one knowledge item.
#[derive(Clone, Debug)]
pub enum IngestProgressEvent {
    /// Directory listed and diffed; `n` files needed no work.
    Planned { item: String, n: u64, total: u64 },
    /// `n` of `total` files decided.
    Processing { item: String, n: u64, total: u64 },
}

impl IngestProgressEvent {
    pub fn percent(&self) -> u64 {
        let (n, total) = match self {
            IngestProgressEvent::Planned { n, total, .. }
            | IngestProgressEvent::Processing { n, total, .. } => (*n, *total),
        };
        if total == 0 {
            100
        } else {
            n.min(total) * 100 / total
        }
    }
}

/// Reports ingestion progress. Implementations write to stderr (human or JSON).
pub trait IngestProgressReporter: Send + Sync {
    fn report(&self, event: IngestProgressEvent);
}

/// Human-friendly progress on stderr: "add directory:/docs  processing  12 / 40 files (30%)".
pub struct StderrProgress;

impl IngestProgressReporter for StderrProgress {
    fn report(&self, event: IngestProgressEvent) {
        let percent = event.percent();
        let line = match &event {
            IngestProgressEvent::Planned { item, n, total } => format!(
                "add {}  planned  {} / {} files unchanged\n",
                item,
                format_number(*n),
                format_number(*total)
            ),
            IngestProgressEvent::Processing { item, n, total } => format!(
                "add {}  processing  {} / {} files ({}%)\n",
                item,
                format_number(*n),
                format_number(*total),
                percent
            ),
        };
        let _ = std::io::stderr().lock().write_all(line.as_bytes());
        let _ = std::io::stderr().lock().flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl IngestProgressReporter for JsonProgress {
    fn report(&self, event: IngestProgressEvent) {
        let percent = event.percent();
        let obj = match &event {
            IngestProgressEvent::Planned { item, n, total } => serde_json::json!({
                "event": "progress",
                "item": item,
                "phase": "planned",
                "n": n,
                "total": total,
                "percent": percent
            }),
            IngestProgressEvent::Processing { item, n, total } => serde_json::json!({
                "event": "progress",
                "item": item,
                "phase": "processing",
                "n": n,
                "total": total,
                "percent": percent
            }),
        };
        if let Ok(line) = serde_json::to_string(&obj) {
            let _ = writeln!(std::io::stderr().lock(), "{}", line);
            let _ = std::io::stderr().lock().flush();
        }
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl IngestProgressReporter for NoProgress {
    fn report(&self, _event: IngestProgressEvent) {}
}

/// Shared counter for one directory task. Increments and reports under one
/// lock so concurrent items never publish a smaller count after a larger one.
pub struct DirectoryProgress {
    item: String,
    total: u64,
    done: Mutex<u64>,
    reporter: Arc<dyn IngestProgressReporter>,
}

impl DirectoryProgress {
    pub fn new(
        item: String,
        total: u64,
        already_done: u64,
        reporter: Arc<dyn IngestProgressReporter>,
    ) -> Self {
        reporter.report(IngestProgressEvent::Planned {
            item: item.clone(),
            n: already_done,
            total,
        });
        Self {
            item,
            total,
            done: Mutex::new(already_done),
            reporter,
        }
    }

    pub fn file_done(&self) {
        let Ok(mut done) = self.done.lock() else {
            return;
        };
        *done += 1;
        self.reporter.report(IngestProgressEvent::Processing {
            item: self.item.clone(),
            n: *done,
            total: self.total,
        });
    }
}

fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + (s.len() - 1) / 3);
    let chars: Vec<char> = s.chars().rev().collect();
    for (i, c) in chars.iter().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(*c);
    }
    result.chars().rev().collect()
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
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

    pub fn reporter(&self) -> Arc<dyn IngestProgressReporter> {
        match self {
            ProgressMode::Off => Arc::new(NoProgress),
            ProgressMode::Human => Arc::new(StderrProgress),
            ProgressMode::Json => Arc::new(JsonProgress),
        }
    }
}
