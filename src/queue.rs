//! Queue keys and the records that travel through them.
//!
//! Per module there are four lists:
//!
//! ```text
//! <prefix>:<module>:check              waiting for should_process
//! <prefix>:<module>:check:processing   claimed by a worker
//! <prefix>:<module>:run                waiting for process
//! <prefix>:<module>:run:processing     claimed by a worker
//! ```
//!
//! plus one shared deadline set (`<prefix>:timeouts`) and one shared
//! completion list (`<prefix>:done`).

use anyhow::{Context, Result};
use filedex_core::models::{Document, ModuleOutput};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct QueueKeys {
    prefix: String,
}

impl QueueKeys {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn check(&self, module: &str) -> String {
        format!("{}:{}:check", self.prefix, module)
    }

    pub fn check_processing(&self, module: &str) -> String {
        format!("{}:{}:check:processing", self.prefix, module)
    }

    pub fn run(&self, module: &str) -> String {
        format!("{}:{}:run", self.prefix, module)
    }

    pub fn run_processing(&self, module: &str) -> String {
        format!("{}:{}:run:processing", self.prefix, module)
    }

    /// All four lists of `module`, in pipeline-state order.
    pub fn module_lists(&self, module: &str) -> [String; 4] {
        [
            self.check(module),
            self.check_processing(module),
            self.run(module),
            self.run_processing(module),
        ]
    }

    pub fn timeouts(&self) -> String {
        format!("{}:timeouts", self.prefix)
    }

    pub fn done(&self) -> String {
        format!("{}:done", self.prefix)
    }

    pub fn group_members(&self, group: &str) -> String {
        format!("{}:group:{}:members", self.prefix, group)
    }

    pub fn group_alive(&self, group: &str, worker_id: &str) -> String {
        format!("{}:group:{}:alive:{}", self.prefix, group, worker_id)
    }
}

/// One unit of module work.
///
/// The nonce makes every enqueued job's serialized form unique, so list
/// removals and deadline records always address exactly one job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub nonce: String,
    pub module: String,
    pub document: Document,
    /// Only this worker may handle the job.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<String>,
}

impl Job {
    pub fn new(module: &str, document: Document, worker_id: Option<String>) -> Self {
        Self {
            nonce: Uuid::new_v4().to_string(),
            module: module.to_string(),
            document,
            worker_id,
        }
    }

    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(raw: &str) -> Result<Self> {
        serde_json::from_str(raw).context("Malformed job payload")
    }
}

/// Member of the shared deadline set: where a claimed job came from and
/// where it is parked while a worker holds it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeoutEntry {
    pub origin: String,
    pub processing: String,
    pub job: String,
}

impl TimeoutEntry {
    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(raw: &str) -> Result<Self> {
        serde_json::from_str(raw).context("Malformed timeout entry")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Outcome {
    /// `should_process` declined; the document is done with this module.
    Skipped,
    Processed { output: ModuleOutput },
    Failed { error: String },
}

/// A completion pushed to `<prefix>:done` by a worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DoneRecord {
    pub job_id: String,
    pub module: String,
    pub document_id: String,
    #[serde(flatten)]
    pub outcome: Outcome,
}

impl DoneRecord {
    pub fn new(job: &Job, outcome: Outcome) -> Self {
        Self {
            job_id: job.nonce.clone(),
            module: job.module.clone(),
            document_id: job.document.id.clone(),
            outcome,
        }
    }

    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(raw: &str) -> Result<Self> {
        serde_json::from_str(raw).context("Malformed done record")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_layout() {
        let keys = QueueKeys::new("fx");
        assert_eq!(keys.check("text"), "fx:text:check");
        assert_eq!(keys.run_processing("text"), "fx:text:run:processing");
        assert_eq!(keys.timeouts(), "fx:timeouts");
        assert_eq!(keys.group_alive("gpu", "w1"), "fx:group:gpu:alive:w1");
    }

    #[test]
    fn identical_documents_make_distinct_jobs() {
        let doc = Document::new("abc", 1);
        let a = Job::new("text", doc.clone(), None).encode().unwrap();
        let b = Job::new("text", doc, None).encode().unwrap();
        assert_ne!(a, b);
        assert_eq!(Job::decode(&a).unwrap().document.id, "abc");
    }

    #[test]
    fn done_record_wire_format() {
        let job = Job::new("text", Document::new("abc", 1), None);
        let raw = DoneRecord::new(
            &job,
            Outcome::Failed {
                error: "boom".into(),
            },
        )
        .encode()
        .unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(value["status"], "failed");
        assert_eq!(value["error"], "boom");
        assert_eq!(value["document_id"], "abc");

        let skipped = DoneRecord::new(&job, Outcome::Skipped).encode().unwrap();
        assert!(matches!(
            DoneRecord::decode(&skipped).unwrap().outcome,
            Outcome::Skipped
        ));
    }
}
