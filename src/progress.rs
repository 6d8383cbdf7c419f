//! Sync progress reporting.
//!
//! Reports observable progress during `fdx sync` so users see how many
//! stored documents were loaded, how far hashing has come, and how many
//! mutations are left to apply. Progress is emitted on **stderr** so stdout
//! remains parseable for scripts.

use serde::Serialize;
use std::io::Write;

/// Phase of a reconciliation run.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncPhase {
    /// Reading persisted documents.
    Loading,
    /// Walking and hashing the index root.
    Scanning,
    /// Persisting upserts, links, deletions and markers.
    Applying,
}

impl SyncPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncPhase::Loading => "loading",
            SyncPhase::Scanning => "scanning",
            SyncPhase::Applying => "applying",
        }
    }
}

/// A single progress event: `n` of `total` units done in `phase`.
#[derive(Clone, Debug, Serialize)]
pub struct SyncProgressEvent {
    pub phase: SyncPhase,
    pub n: u64,
    pub total: u64,
}

/// Reports sync progress. Implementations write to stderr (human or JSON).
pub trait SyncProgressReporter: Send + Sync {
    /// Emit a progress event. Called from the reconciliation engine.
    fn report(&self, event: SyncProgressEvent);
}

/// Human-friendly progress on stderr: "sync  scanning  1,234 / 5,000 files".
pub struct StderrProgress;

impl SyncProgressReporter for StderrProgress {
    fn report(&self, event: SyncProgressEvent) {
        let unit = match event.phase {
            SyncPhase::Loading => "documents",
            SyncPhase::Scanning => "files",
            SyncPhase::Applying => "changes",
        };
        let mut err = std::io::stderr().lock();
        let _ = writeln!(
            err,
            "sync  {:<8}  {} / {} {}",
            event.phase.as_str(),
            format_number(event.n),
            format_number(event.total),
            unit
        );
        let _ = err.flush();
    }
}

#[derive(Serialize)]
struct JsonLine<'a> {
    event: &'static str,
    #[serde(flatten)]
    progress: &'a SyncProgressEvent,
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl SyncProgressReporter for JsonProgress {
    fn report(&self, event: SyncProgressEvent) {
        let line = JsonLine {
            event: "progress",
            progress: &event,
        };
        if let Ok(line) = serde_json::to_string(&line) {
            let mut err = std::io::stderr().lock();
            let _ = writeln!(err, "{}", line);
            let _ = err.flush();
        }
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl SyncProgressReporter for NoProgress {
    fn report(&self, _event: SyncProgressEvent) {}
}

/// `1234567` → `"1,234,567"`.
pub fn format_number(n: u64) -> String {
    let digits = n.to_string();
    let lead = digits.len() % 3;
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, d) in digits.char_indices() {
        if i > 0 && (i + 3 - lead) % 3 == 0 {
            out.push(',');
        }
        out.push(d);
    }
    out
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

    /// Parse the `--progress` flag value.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "off" => Some(ProgressMode::Off),
            "human" => Some(ProgressMode::Human),
            "json" => Some(ProgressMode::Json),
            _ => None,
        }
    }

    /// Build a reporter for this mode.
    pub fn reporter(&self) -> Box<dyn SyncProgressReporter> {
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
    fn json_line_flattens_the_event() {
        let event = SyncProgressEvent {
            phase: SyncPhase::Scanning,
            n: 3,
            total: 10,
        };
        let line = serde_json::to_value(JsonLine {
            event: "progress",
            progress: &event,
        })
        .unwrap();
        assert_eq!(
            line,
            serde_json::json!({"event": "progress", "phase": "scanning", "n": 3, "total": 10})
        );
    }

    #[test]
    fn progress_flag_values() {
        assert_eq!(ProgressMode::parse("json"), Some(ProgressMode::Json));
        assert_eq!(ProgressMode::parse("off"), Some(ProgressMode::Off));
        assert_eq!(ProgressMode::parse("loud"), None);
    }
}
