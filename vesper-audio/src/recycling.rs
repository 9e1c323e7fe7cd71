//! Recycling nodes: the per-channel owners of audio signal instances.
//!
//! The tree shape belongs to the external channel graph. A recycling only
//! mirrors it through weak `parent`/`next`/`prev` links, so dropping the
//! owning graph drops the nodes.
//!
//! Every method takes the node's own lock, copies what it needs and releases
//! the lock before touching any other object.

use std::sync::{Arc, Mutex, Weak};

use crossbeam_channel::{Receiver, Sender};
use vesper_types::{RecyclingId, SignalId, SoundcardFormat};

use crate::audio_signal::AudioSignal;
use crate::recall_id::RecyclingContext;
use crate::{lock, next_id};

/// Change notification delivered to subscribers such as level meters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecyclingEvent {
    Added { recycling: RecyclingId, signal: SignalId },
    Removed { recycling: RecyclingId, signal: SignalId },
}

#[derive(Default)]
struct RecyclingInner {
    parent: Weak<Recycling>,
    next: Weak<Recycling>,
    prev: Weak<Recycling>,
    signals: Vec<Arc<AudioSignal>>,
    subscribers: Vec<Sender<RecyclingEvent>>,
}

pub struct Recycling {
    id: RecyclingId,
    inner: Mutex<RecyclingInner>,
}

impl std::fmt::Debug for Recycling {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Recycling").field("id", &self.id).finish()
    }
}

impl Recycling {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            id: RecyclingId::new(next_id()),
            inner: Mutex::new(RecyclingInner::default()),
        })
    }

    /// A recycling owning a silent template of `length` buffers.
    pub fn with_template(
        samplerate: u32,
        buffer_size: usize,
        format: SoundcardFormat,
        length: usize,
    ) -> Arc<Self> {
        let recycling = Self::new();
        recycling.add_audio_signal(Arc::new(AudioSignal::new_template(
            samplerate,
            buffer_size,
            format,
            length,
        )));
        recycling
    }

    pub fn id(&self) -> RecyclingId {
        self.id
    }

    pub fn parent(&self) -> Option<Arc<Recycling>> {
        lock(&self.inner).parent.upgrade()
    }

    pub fn set_parent(&self, parent: Option<&Arc<Recycling>>) {
        lock(&self.inner).parent = parent.map(Arc::downgrade).unwrap_or_default();
    }

    pub fn next(&self) -> Option<Arc<Recycling>> {
        lock(&self.inner).next.upgrade()
    }

    pub fn prev(&self) -> Option<Arc<Recycling>> {
        lock(&self.inner).prev.upgrade()
    }

    /// Link two siblings. Each side is locked on its own.
    pub fn link(prev: &Arc<Recycling>, next: &Arc<Recycling>) {
        lock(&prev.inner).next = Arc::downgrade(next);
        lock(&next.inner).prev = Arc::downgrade(prev);
    }

    /// Chain `nodes` in order as siblings.
    pub fn link_chain(nodes: &[Arc<Recycling>]) {
        for pair in nodes.windows(2) {
            Self::link(&pair[0], &pair[1]);
        }
    }

    /// Receive add/remove notifications for this node.
    pub fn subscribe(&self) -> Receiver<RecyclingEvent> {
        let (tx, rx) = crossbeam_channel::unbounded();
        lock(&self.inner).subscribers.push(tx);
        rx
    }

    fn notify(&self, event: RecyclingEvent) {
        // Unbounded sends never block; disconnected subscribers are dropped.
        lock(&self.inner)
            .subscribers
            .retain(|tx| tx.send(event).is_ok());
    }

    /// Add a signal unless it is already present.
    pub fn add_audio_signal(&self, signal: Arc<AudioSignal>) {
        let signal_id = signal.id();
        {
            let mut inner = lock(&self.inner);
            if inner.signals.iter().any(|s| Arc::ptr_eq(s, &signal)) {
                return;
            }
            inner.signals.push(signal);
        }
        log::trace!(target: "audio::recycling", "recycling {} + signal {}", self.id, signal_id);
        self.notify(RecyclingEvent::Added {
            recycling: self.id,
            signal: signal_id,
        });
    }

    pub fn remove_audio_signal(&self, signal: &AudioSignal) -> bool {
        let removed = {
            let mut inner = lock(&self.inner);
            let before = inner.signals.len();
            inner.signals.retain(|s| !std::ptr::eq(s.as_ref(), signal));
            before != inner.signals.len()
        };
        if removed {
            log::trace!(target: "audio::recycling", "recycling {} - signal {}", self.id, signal.id());
            self.notify(RecyclingEvent::Removed {
                recycling: self.id,
                signal: signal.id(),
            });
        }
        removed
    }

    pub fn audio_signals(&self) -> Vec<Arc<AudioSignal>> {
        lock(&self.inner).signals.clone()
    }

    /// Append the signals held here to `out`. Reusing `out` across calls
    /// keeps this free of allocations once it has grown to fit.
    pub fn collect_audio_signals(&self, out: &mut Vec<Arc<AudioSignal>>) {
        out.extend(lock(&self.inner).signals.iter().cloned());
    }

    pub fn signal_count(&self) -> usize {
        lock(&self.inner).signals.len()
    }

    pub fn template(&self) -> Option<Arc<AudioSignal>> {
        lock(&self.inner)
            .signals
            .iter()
            .find(|s| s.is_template())
            .cloned()
    }

    pub fn find_by_context(&self, context: &RecyclingContext) -> Vec<Arc<AudioSignal>> {
        AudioSignal::find_by_context(&self.audio_signals(), context)
    }

    pub fn find_stream_current(&self, context: &RecyclingContext) -> Option<Arc<AudioSignal>> {
        AudioSignal::find_stream_current(&self.audio_signals(), context)
    }

    /// Whether an instance bound to `context` still plays here.
    pub fn is_active(&self, context: &RecyclingContext) -> bool {
        AudioSignal::is_active_in(&self.audio_signals(), context)
    }

    /// Shape `instance` after this recycling's template.
    /// Without a template the instance is resized to zero.
    pub fn create_with_defaults(&self, instance: &AudioSignal, delay: f64, attack: usize) {
        match self.template() {
            Some(template) => instance.apply_defaults(&template.snapshot(), delay, attack),
            None => {
                log::debug!(target: "audio::recycling", "recycling {} has no template", self.id);
                let mut state = instance.lock();
                state.delay = delay;
                state.attack = attack;
                state.resize(0);
            }
        }
    }

    /// Synthesize `frame_count` frames into `instance` from the template,
    /// tiling its loop region.
    pub fn create_with_frame_count(
        &self,
        instance: &AudioSignal,
        frame_count: u64,
        delay: f64,
        attack: usize,
    ) {
        match self.template() {
            Some(template) => {
                instance.apply_frame_count(&template.snapshot(), frame_count, delay, attack)
            }
            None => {
                log::debug!(target: "audio::recycling", "recycling {} has no template", self.id);
                instance.lock().resize(0);
            }
        }
    }

    /// Iterate `start` and its `next` siblings up to and including `end`.
    pub fn chain(start: &Arc<Recycling>, end: Option<&Arc<Recycling>>) -> Vec<Arc<Recycling>> {
        let mut out = Vec::new();
        let mut current = Some(start.clone());
        while let Some(node) = current {
            let is_end = end.map(|e| Arc::ptr_eq(e, &node)).unwrap_or(false);
            current = if is_end { None } else { node.next() };
            out.push(node);
            if current.as_ref().map(|c| Arc::ptr_eq(c, start)).unwrap_or(false) {
                break;
            }
        }
        out
    }

    /// Position of `target` in the sibling chain from `start` to `end`.
    pub fn position(
        start: &Arc<Recycling>,
        end: Option<&Arc<Recycling>>,
        target: &Recycling,
    ) -> Option<usize> {
        Self::chain(start, end)
            .iter()
            .position(|r| std::ptr::eq(r.as_ref(), target))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recall_id::RecallId;
    use vesper_types::SoundScope;

    #[test]
    fn add_remove_emit_notifications() {
        let recycling = Recycling::new();
        let rx = recycling.subscribe();
        let signal = Arc::new(AudioSignal::new(44100, 64, SoundcardFormat::Float));

        recycling.add_audio_signal(signal.clone());
        recycling.add_audio_signal(signal.clone());
        assert_eq!(recycling.signal_count(), 1);
        assert!(recycling.remove_audio_signal(&signal));
        assert!(!recycling.remove_audio_signal(&signal));

        let events: Vec<_> = rx.try_iter().collect();
        assert_eq!(
            events,
            vec![
                RecyclingEvent::Added { recycling: recycling.id(), signal: signal.id() },
                RecyclingEvent::Removed { recycling: recycling.id(), signal: signal.id() },
            ]
        );
    }

    #[test]
    fn dropped_subscriber_is_pruned() {
        let recycling = Recycling::new();
        drop(recycling.subscribe());
        let kept = recycling.subscribe();
        recycling.add_audio_signal(Arc::new(AudioSignal::new(44100, 64, SoundcardFormat::Float)));
        assert_eq!(kept.try_iter().count(), 1);
        assert_eq!(lock(&recycling.inner).subscribers.len(), 1);
    }

    #[test]
    fn links_are_weak() {
        let a = Recycling::new();
        let b = Recycling::new();
        Recycling::link(&a, &b);
        b.set_parent(Some(&a));
        assert!(Arc::ptr_eq(&a.next().unwrap(), &b));
        assert!(Arc::ptr_eq(&b.prev().unwrap(), &a));
        drop(a);
        assert!(b.prev().is_none());
        assert!(b.parent().is_none());
    }

    #[test]
    fn chain_and_position() {
        let nodes: Vec<_> = (0..4).map(|_| Recycling::new()).collect();
        Recycling::link_chain(&nodes);
        assert_eq!(Recycling::chain(&nodes[0], None).len(), 4);
        assert_eq!(Recycling::chain(&nodes[1], Some(&nodes[2])).len(), 2);
        assert_eq!(Recycling::position(&nodes[0], None, &nodes[3]), Some(3));
        assert_eq!(Recycling::position(&nodes[1], Some(&nodes[2]), &nodes[3]), None);
    }

    #[test]
    fn create_without_template_resizes_to_zero() {
        let recycling = Recycling::new();
        let instance = AudioSignal::new(44100, 64, SoundcardFormat::Float);
        instance.lock().resize(4);
        recycling.create_with_defaults(&instance, 0.0, 0);
        assert_eq!(instance.length(), 0);
    }

    #[test]
    fn template_with_empty_buffers_resizes_to_zero() {
        let recycling = Recycling::with_template(44100, 0, SoundcardFormat::Float, 2);
        let instance = Arc::new(AudioSignal::new(44100, 0, SoundcardFormat::Float));
        recycling.create_with_frame_count(&instance, 32, 0.5, 3);
        assert_eq!(instance.length(), 0);
        assert!(!instance.is_active());

        instance.feed(&recycling.template().unwrap(), 64);
        assert_eq!(instance.length(), 0);

        instance.lock().resize(2);
        recycling.create_with_defaults(&instance, 0.0, 0);
        assert_eq!(instance.length(), 0);
    }

    #[test]
    fn find_and_activity_by_context() {
        let recycling = Recycling::with_template(44100, 16, SoundcardFormat::Float, 2);
        let context = RecyclingContext::new(1);
        let other = RecyclingContext::new(1);
        let id = RecallId::new(SoundScope::Playback, context.clone());

        let instance = Arc::new(AudioSignal::new(44100, 16, SoundcardFormat::Float));
        recycling.create_with_frame_count(&instance, 32, 0.0, 0);
        instance.set_recall_id(Some(id));
        recycling.add_audio_signal(instance.clone());

        assert_eq!(recycling.find_by_context(&context).len(), 1);
        assert!(recycling.find_by_context(&other).is_empty());
        assert!(recycling.is_active(&context));
        assert!(recycling.find_stream_current(&other).is_none());
        instance.advance();
        let current = recycling.find_stream_current(&context).unwrap();
        assert!(Arc::ptr_eq(&current, &instance));
        instance.advance();
        assert!(!recycling.is_active(&context));
        assert!(recycling.find_stream_current(&context).is_none());
    }
}
