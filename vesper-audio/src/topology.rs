//! The channel graph as the staging engine sees it.
//!
//! A [`ChannelNode`] owns one recycling, the recalls attached to the channel
//! (templates plus running instances), the voices started on it and the
//! notes scheduled for it. Input channels hang below their output channel;
//! their voices run in child contexts of the output's voice.

use std::sync::{Arc, Mutex};

use vesper_types::{AudioId, ChannelId, Note, SoundScope};

use crate::lock;
use crate::recall::{Recall, RecallList};
use crate::recall_id::{RecallId, RecyclingContext};
use crate::recycling::Recycling;

#[derive(Default)]
struct ChannelInner {
    recalls: RecallList,
    voices: Vec<Arc<RecallId>>,
    notes: Vec<(SoundScope, Note)>,
    children: Vec<Arc<ChannelNode>>,
}

pub struct ChannelNode {
    id: ChannelId,
    recycling: Arc<Recycling>,
    inner: Mutex<ChannelInner>,
}

impl std::fmt::Debug for ChannelNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelNode")
            .field("id", &self.id)
            .field("recycling", &self.recycling.id())
            .finish()
    }
}

impl ChannelNode {
    pub fn new(id: ChannelId, recycling: Arc<Recycling>) -> Arc<Self> {
        Arc::new(Self {
            id,
            recycling,
            inner: Mutex::new(ChannelInner::default()),
        })
    }

    pub fn id(&self) -> ChannelId {
        self.id
    }

    pub fn recycling(&self) -> &Arc<Recycling> {
        &self.recycling
    }

    /// Attach a template. Instances are rejected; they are created by
    /// starting voices.
    pub fn add_template(&self, template: Arc<Recall>) -> bool {
        if !template.is_template() {
            log::error!(
                target: "audio::staging",
                "channel {}: recall {} is not a template",
                self.id,
                template.key()
            );
            return false;
        }
        lock(&self.inner).recalls.push(template);
        true
    }

    pub(crate) fn push_recalls(&self, recalls: impl IntoIterator<Item = Arc<Recall>>) {
        let mut inner = lock(&self.inner);
        for recall in recalls {
            inner.recalls.push(recall);
        }
    }

    /// Snapshot of every recall attached here.
    pub fn recalls(&self) -> Vec<Arc<Recall>> {
        lock(&self.inner).recalls.to_vec()
    }

    /// Append every recall attached here to `out`.
    pub fn collect_recalls(&self, out: &mut Vec<Arc<Recall>>) {
        out.extend(lock(&self.inner).recalls.iter().cloned());
    }

    pub fn templates(&self) -> Vec<Arc<Recall>> {
        lock(&self.inner).recalls.templates().cloned().collect()
    }

    pub fn recall_count(&self) -> usize {
        lock(&self.inner).recalls.len()
    }

    /// Whether every recall bound to `context` has finished.
    pub fn is_done(&self, context: &RecyclingContext) -> bool {
        lock(&self.inner).recalls.is_done(context)
    }

    /// Drop finished instances.
    pub fn gc(&self) -> usize {
        lock(&self.inner).recalls.gc()
    }

    pub(crate) fn add_voice(&self, recall_id: Arc<RecallId>) {
        lock(&self.inner).voices.push(recall_id);
    }

    pub(crate) fn remove_voice(&self, recall_id: &RecallId) -> bool {
        let mut inner = lock(&self.inner);
        let before = inner.voices.len();
        inner.voices.retain(|v| !std::ptr::eq(v.as_ref(), recall_id));
        before != inner.voices.len()
    }

    /// Voices currently running on this channel.
    pub fn voices(&self) -> Vec<Arc<RecallId>> {
        lock(&self.inner).voices.clone()
    }

    pub fn voices_in(&self, scope: SoundScope) -> Vec<Arc<RecallId>> {
        let mut out = Vec::new();
        self.collect_voices_in(scope, &mut out);
        out
    }

    /// Append the voices running in `scope` to `out`.
    pub fn collect_voices_in(&self, scope: SoundScope, out: &mut Vec<Arc<RecallId>>) {
        out.extend(
            lock(&self.inner)
                .voices
                .iter()
                .filter(|v| v.scope() == scope)
                .cloned(),
        );
    }

    /// Schedule `note` to start a voice in `scope` once the play position
    /// reaches `note.x0`.
    pub fn schedule_note(&self, scope: SoundScope, note: Note) {
        lock(&self.inner).notes.push((scope, note));
    }

    pub fn clear_notes(&self) {
        lock(&self.inner).notes.clear();
    }

    /// Notes of `scope` starting exactly at `position`.
    pub fn notes_starting_at(&self, scope: SoundScope, position: u64) -> Vec<Note> {
        lock(&self.inner)
            .notes
            .iter()
            .filter(|(s, n)| *s == scope && n.x0 == position)
            .map(|(_, n)| *n)
            .collect()
    }

    /// Hang `child` below this channel. The child's recycling gets this
    /// channel's recycling as parent.
    pub fn add_child(self: &Arc<Self>, child: &Arc<ChannelNode>) {
        if Arc::ptr_eq(self, child) {
            log::error!(target: "audio::staging", "channel {} cannot feed itself", self.id);
            return;
        }
        child.recycling.set_parent(Some(&self.recycling));
        let mut inner = lock(&self.inner);
        if !inner.children.iter().any(|c| Arc::ptr_eq(c, child)) {
            inner.children.push(child.clone());
        }
    }

    pub fn children(&self) -> Vec<Arc<ChannelNode>> {
        lock(&self.inner).children.clone()
    }

    /// This channel followed by every channel below it, breadth first.
    pub fn subtree(self: &Arc<Self>) -> Vec<Arc<ChannelNode>> {
        let mut out = Vec::new();
        self.collect_subtree(&mut out);
        out
    }

    /// Append this channel and every channel below it to `out`, breadth
    /// first. Only one channel is locked at a time.
    pub fn collect_subtree(self: &Arc<Self>, out: &mut Vec<Arc<ChannelNode>>) {
        let start = out.len();
        out.push(self.clone());
        let mut next = start;
        while next < out.len() {
            let node = out[next].clone();
            let inner = lock(&node.inner);
            for child in &inner.children {
                if !out[start..].iter().any(|c| Arc::ptr_eq(c, child)) {
                    out.push(child.clone());
                }
            }
            drop(inner);
            next += 1;
        }
    }
}

/// An audio object: the channels it renders to.
pub struct AudioNode {
    id: AudioId,
    outputs: Mutex<Vec<Arc<ChannelNode>>>,
}

impl std::fmt::Debug for AudioNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioNode").field("id", &self.id).finish()
    }
}

impl AudioNode {
    pub fn new(id: AudioId) -> Arc<Self> {
        Arc::new(Self {
            id,
            outputs: Mutex::new(Vec::new()),
        })
    }

    pub fn id(&self) -> AudioId {
        self.id
    }

    pub fn add_output(&self, channel: Arc<ChannelNode>) {
        let mut outputs = lock(&self.outputs);
        if !outputs.iter().any(|c| Arc::ptr_eq(c, &channel)) {
            outputs.push(channel);
        }
    }

    pub fn outputs(&self) -> Vec<Arc<ChannelNode>> {
        lock(&self.outputs).clone()
    }

    pub fn output_at(&self, index: usize) -> Option<Arc<ChannelNode>> {
        lock(&self.outputs).get(index).cloned()
    }
}
