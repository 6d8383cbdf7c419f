//! Ordered module pipeline and `next` pointer transitions.
//!
//! The pipeline is a fixed, ordered list of module names taken from
//! configuration. A document visits modules strictly in that order; its
//! `next` field names the module it is waiting on, or is empty once every
//! module has run (or while the document is offline).

use serde::{Deserialize, Serialize};

use crate::models::Document;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pipeline {
    modules: Vec<String>,
}

impl Pipeline {
    pub fn new<I, S>(modules: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            modules: modules.into_iter().map(Into::into).collect(),
        }
    }

    pub fn modules(&self) -> &[String] {
        &self.modules
    }

    pub fn contains(&self, module: &str) -> bool {
        self.modules.iter().any(|m| m == module)
    }

    pub fn position(&self, module: &str) -> Option<usize> {
        self.modules.iter().position(|m| m == module)
    }

    /// First module, in order, that `doc` has not completed yet.
    pub fn first_pending(&self, doc: &Document) -> String {
        self.modules
            .iter()
            .find(|m| !doc.modules_done.contains(*m))
            .cloned()
            .unwrap_or_default()
    }

    /// The module after `module` that `doc` has not completed, or `""`.
    pub fn next_after(&self, module: &str, doc: &Document) -> String {
        let Some(pos) = self.position(module) else {
            return self.first_pending(doc);
        };
        self.modules[pos + 1..]
            .iter()
            .find(|m| !doc.modules_done.contains(*m))
            .cloned()
            .unwrap_or_default()
    }

    /// Compute `next` for a document during reconciliation.
    ///
    /// Offline documents cannot be processed and get `""`. An in-flight
    /// pointer that still names a configured, unfinished module is kept so
    /// queued work is not restarted from the first stage.
    pub fn assign_next(&self, doc: &Document, previous_next: &str) -> String {
        if doc.offline {
            return String::new();
        }
        if !previous_next.is_empty()
            && self.contains(previous_next)
            && !doc.modules_done.contains(previous_next)
        {
            return previous_next.to_string();
        }
        self.first_pending(doc)
    }
}
