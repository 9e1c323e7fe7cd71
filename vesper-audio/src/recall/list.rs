use std::sync::Arc;

use vesper_types::RecallKey;

use super::{Recall, RecallLevel};
use crate::recall_id::RecyclingContext;

/// The recalls attached to one node, templates and instances alike.
///
/// Owners keep the list behind their own lock and hand out clones of the
/// entries; stages run on those clones after the lock is released.
#[derive(Debug, Default)]
pub struct RecallList {
    recalls: Vec<Arc<Recall>>,
}

impl RecallList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.recalls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.recalls.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Recall>> {
        self.recalls.iter()
    }

    pub fn to_vec(&self) -> Vec<Arc<Recall>> {
        self.recalls.clone()
    }

    pub fn push(&mut self, recall: Arc<Recall>) {
        if !self.recalls.iter().any(|r| Arc::ptr_eq(r, &recall)) {
            self.recalls.push(recall);
        }
    }

    pub fn remove(&mut self, recall: &Recall) -> bool {
        let before = self.recalls.len();
        self.recalls.retain(|r| !std::ptr::eq(r.as_ref(), recall));
        before != self.recalls.len()
    }

    pub fn templates(&self) -> impl Iterator<Item = &Arc<Recall>> {
        self.recalls.iter().filter(|r| r.is_template())
    }

    /// Templates working on `level`, in insertion order.
    pub fn templates_at(&self, level: RecallLevel) -> Vec<Arc<Recall>> {
        self.templates()
            .filter(|r| r.level() == level)
            .cloned()
            .collect()
    }

    pub fn find_template(&self, name: &str) -> Option<Arc<Recall>> {
        self.templates().find(|r| r.name() == name).cloned()
    }

    pub fn find_by_key(&self, key: RecallKey) -> Option<Arc<Recall>> {
        self.recalls.iter().find(|r| r.key() == key).cloned()
    }

    /// Instances bound to `context`.
    pub fn find_by_context(&self, context: &RecyclingContext) -> Vec<Arc<Recall>> {
        self.recalls
            .iter()
            .filter(|r| !r.is_template() && r.matches_context(context))
            .cloned()
            .collect()
    }

    pub fn find_by_effect(&self, filename: &str, effect: &str) -> Option<Arc<Recall>> {
        self.recalls
            .iter()
            .find(|r| {
                r.effect()
                    .map(|(f, e)| f == filename && e == effect)
                    .unwrap_or(false)
            })
            .cloned()
    }

    /// Whether every instance bound to `context` has finished. A context
    /// without instances counts as finished.
    pub fn is_done(&self, context: &RecyclingContext) -> bool {
        self.recalls
            .iter()
            .filter(|r| !r.is_template() && r.matches_context(context))
            .all(|r| r.is_done())
    }

    /// Drop finished instances. Returns how many were removed.
    pub fn gc(&mut self) -> usize {
        let before = self.recalls.len();
        self.recalls.retain(|r| r.is_template() || !r.is_done());
        before - self.recalls.len()
    }
}
