//! The staging engine: runs the staging program over a channel's recall
//! trees once per tick.
//!
//! Voices are gathered from the channel and every channel below it and
//! sorted by context depth, then the program runs stage by stage across all
//! of them. A child context therefore never reaches a stage before its
//! parent context did within the same tick.
//!
//! The lists a tick works on live in scratch buffers that are cleared and
//! reused, so once they have grown to fit a steady set of voices a tick
//! under [`StagingPolicy::RealtimeSafe`] does not allocate.

use std::sync::{Arc, Mutex};

use vesper_types::{Note, ScopeSelection, SoundScope, StagingProgram, StagingStage};

use crate::audio_signal::AudioSignal;
use crate::lock;
use crate::recall::{Recall, RecallFlags, RecallKind, RecallLevel, StageTick};
use crate::recall_id::{RecallId, RecallIdFlags, RecyclingContext};
use crate::topology::{AudioNode, ChannelNode};

/// How voices are started and skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StagingPolicy {
    /// Never start voices; voices without a sounding note are skipped.
    RealtimeSafe,
    /// Start voices at their note's `x0` and let them run out.
    NonRealtime,
}

/// Counts from one tick of one channel subtree.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub started: usize,
    pub ran: usize,
    pub skipped: usize,
    pub finished: usize,
}

impl TickReport {
    fn merge(&mut self, other: TickReport) {
        self.started += other.started;
        self.ran += other.ran;
        self.skipped += other.skipped;
        self.finished += other.finished;
    }
}

pub struct StagingEngine {
    program: StagingProgram,
    policy: StagingPolicy,
    /// Idle scratch buffers, one per tick running concurrently.
    scratch: Mutex<Vec<TickScratch>>,
}

impl std::fmt::Debug for StagingEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StagingEngine")
            .field("program", &self.program)
            .field("policy", &self.policy)
            .finish()
    }
}

impl Clone for StagingEngine {
    fn clone(&self) -> Self {
        Self::new(self.program.clone(), self.policy)
    }
}

struct Voice {
    node: Arc<ChannelNode>,
    recall_id: Arc<RecallId>,
    depth: usize,
    /// Discovery order; keeps the depth sort deterministic.
    order: usize,
}

#[derive(Default)]
struct TickScratch {
    nodes: Vec<Arc<ChannelNode>>,
    ids: Vec<Arc<RecallId>>,
    voices: Vec<Voice>,
    recalls: Vec<Arc<Recall>>,
    roots: Vec<Arc<Recall>>,
    signals: Vec<Arc<AudioSignal>>,
}

impl TickScratch {
    /// Drop the references but keep the capacity.
    fn clear(&mut self) {
        self.nodes.clear();
        self.ids.clear();
        self.voices.clear();
        self.recalls.clear();
        self.roots.clear();
        self.signals.clear();
    }
}

impl StagingEngine {
    pub fn new(program: StagingProgram, policy: StagingPolicy) -> Self {
        Self {
            program,
            policy,
            scratch: Mutex::new(Vec::new()),
        }
    }

    pub fn program(&self) -> &StagingProgram {
        &self.program
    }

    pub fn policy(&self) -> StagingPolicy {
        self.policy
    }

    /// Start a voice on `channel` and, in child contexts, on every channel
    /// below it.
    ///
    /// The voice gets an audio signal synthesized from the recycling's
    /// template (sized to the note when one is given) and an instance of
    /// every template recall on the channel. Signal recalls become children
    /// of the recycling recall, which becomes a child of the channel recall;
    /// parents finish once their last child did.
    pub fn start_voice(
        &self,
        channel: &Arc<ChannelNode>,
        scope: SoundScope,
        note: Option<Note>,
        parent: Option<&Arc<RecyclingContext>>,
    ) -> Arc<RecallId> {
        let recycling = channel.recycling().clone();
        let context = RecyclingContext::with_recycling(std::slice::from_ref(&recycling));
        if let Some(parent) = parent {
            parent.add_child(&context);
        }
        let recall_id = RecallId::new(scope, context.clone());

        let signal = match recycling.template() {
            Some(template) => {
                let shape = template.snapshot();
                let instance = Arc::new(AudioSignal::new(
                    shape.samplerate,
                    shape.buffer_size,
                    shape.format,
                ));
                match note {
                    Some(note) => {
                        let frames = note.duration() * shape.buffer_size as u64;
                        recycling.create_with_frame_count(&instance, frames, 0.0, 0);
                        instance.lock().add_note(note);
                    }
                    None => recycling.create_with_defaults(&instance, 0.0, 0),
                }
                instance.set_recall_id(Some(recall_id.clone()));
                recycling.add_audio_signal(instance.clone());
                Some(instance)
            }
            None => {
                log::debug!(
                    target: "audio::staging",
                    "channel {} has no template signal",
                    channel.id()
                );
                None
            }
        };

        let templates = channel.templates();
        let mut channel_level = Vec::new();
        let mut recycling_level = Vec::new();
        let mut signal_level = Vec::new();
        for template in &templates {
            let kind = match template.level() {
                RecallLevel::Channel => RecallKind::Channel(channel.id()),
                RecallLevel::Recycling => RecallKind::Recycling(recycling.clone()),
                RecallLevel::AudioSignal => match &signal {
                    Some(signal) => RecallKind::AudioSignal(signal.clone()),
                    None => continue,
                },
            };
            let Some(instance) = template.duplicate(&recall_id, kind) else {
                continue;
            };
            match instance.level() {
                RecallLevel::Channel => channel_level.push(instance),
                RecallLevel::Recycling => recycling_level.push(instance),
                RecallLevel::AudioSignal => signal_level.push(instance),
            }
        }

        adopt(channel_level.first(), &recycling_level);
        let signal_parent = recycling_level.first().or(channel_level.first());
        adopt(signal_parent, &signal_level);

        channel.push_recalls(
            channel_level
                .into_iter()
                .chain(recycling_level)
                .chain(signal_level),
        );
        channel.add_voice(recall_id.clone());
        log::debug!(
            target: "audio::staging",
            "voice started on channel {} ({}, context {})",
            channel.id(),
            scope,
            context.id()
        );

        for child in channel.children() {
            self.start_voice(&child, scope, note, Some(&context));
        }
        recall_id
    }

    /// Advance `channel` and everything below it by one tick.
    pub fn run_channel(
        &self,
        channel: &Arc<ChannelNode>,
        selection: ScopeSelection,
        position: u64,
    ) -> TickReport {
        let mut report = TickReport::default();
        for &scope in selection.scopes() {
            report.merge(self.run_scope(channel, scope, position));
        }
        report
    }

    /// Advance every output channel of `audio` by one tick.
    pub fn run_audio(&self, audio: &AudioNode, selection: ScopeSelection, position: u64) -> TickReport {
        let mut report = TickReport::default();
        let mut index = 0;
        while let Some(channel) = audio.output_at(index) {
            report.merge(self.run_channel(&channel, selection, position));
            index += 1;
        }
        report
    }

    fn run_scope(&self, channel: &Arc<ChannelNode>, scope: SoundScope, position: u64) -> TickReport {
        let mut scratch = lock(&self.scratch).pop().unwrap_or_default();
        let report = self.run_scope_with(channel, scope, position, &mut scratch);
        scratch.clear();
        lock(&self.scratch).push(scratch);
        report
    }

    fn run_scope_with(
        &self,
        channel: &Arc<ChannelNode>,
        scope: SoundScope,
        position: u64,
        scratch: &mut TickScratch,
    ) -> TickReport {
        let mut report = TickReport::default();

        if self.policy == StagingPolicy::NonRealtime {
            for note in channel.notes_starting_at(scope, position) {
                self.start_voice(channel, scope, Some(note), None);
                report.started += 1;
            }
        }

        channel.collect_subtree(&mut scratch.nodes);
        for node in &scratch.nodes {
            scratch.ids.clear();
            node.collect_voices_in(scope, &mut scratch.ids);
            for recall_id in scratch.ids.drain(..) {
                scratch.voices.push(Voice {
                    node: node.clone(),
                    depth: recall_id.context().depth(),
                    order: scratch.voices.len(),
                    recall_id,
                });
            }
        }
        scratch.voices.sort_unstable_by_key(|voice| (voice.depth, voice.order));

        for voice in &scratch.voices {
            if self.policy == StagingPolicy::RealtimeSafe
                && !voice_sounds(voice, position, &mut scratch.signals)
            {
                report.skipped += 1;
                continue;
            }
            voice.recall_id.unset_flags(
                RecallIdFlags::PRE_SYNC_ASYNC_DONE
                    | RecallIdFlags::INTER_SYNC_ASYNC_DONE
                    | RecallIdFlags::POST_SYNC_ASYNC_DONE,
            );
            scratch.recalls.clear();
            voice.node.collect_recalls(&mut scratch.recalls);
            for recall in scratch.recalls.drain(..) {
                if recall.parent().is_none() && recall.matches_context(voice.recall_id.context()) {
                    scratch.roots.push(recall);
                }
            }
            report.ran += 1;
        }

        let tick = StageTick::new(scope, position, self.policy == StagingPolicy::RealtimeSafe);
        for &stage in self.program.stages() {
            for root in &scratch.roots {
                root.run_stage(stage, tick);
            }
            let synced = match stage {
                StagingStage::RunPre => RecallIdFlags::PRE_SYNC_ASYNC_DONE,
                StagingStage::RunInter => RecallIdFlags::INTER_SYNC_ASYNC_DONE,
                StagingStage::RunPost => RecallIdFlags::POST_SYNC_ASYNC_DONE,
                _ => continue,
            };
            for root in &scratch.roots {
                if let Some(id) = root.recall_id() {
                    id.set_flags(synced);
                }
            }
        }

        // Children finish before parents, so walk the deepest voices first.
        for voice in scratch.voices.iter().rev() {
            if finish_voice(voice) {
                report.finished += 1;
            }
        }
        for node in &scratch.nodes {
            node.gc();
        }
        report
    }
}

impl Default for StagingEngine {
    fn default() -> Self {
        Self::new(StagingProgram::default(), StagingPolicy::NonRealtime)
    }
}

/// Make every recall in `children` a child of `parent`.
fn adopt(parent: Option<&Arc<Recall>>, children: &[Arc<Recall>]) {
    let Some(parent) = parent else {
        return;
    };
    if children.is_empty() {
        return;
    }
    parent.set_flags(RecallFlags::PROPAGATE_DONE);
    for child in children {
        parent.add_child(child);
    }
}

/// Whether the voice has a signal with a note sounding at `position`.
/// Voices without signals are driven by their recalls alone.
fn voice_sounds(voice: &Voice, position: u64, signals: &mut Vec<Arc<AudioSignal>>) -> bool {
    let context = voice.recall_id.context();
    signals.clear();
    voice.node.recycling().collect_audio_signals(signals);
    let mut bound = false;
    let mut sounding = false;
    for signal in signals.iter().filter(|signal| signal.belongs_to(context)) {
        bound = true;
        let state = signal.lock();
        if !state.is_exhausted() && state.has_active_note(position) {
            sounding = true;
            break;
        }
    }
    signals.clear();
    !bound || sounding
}

/// Retire a voice whose recalls all finished: mark its id done, remove its
/// signals and detach its context. Child contexts must be retired first.
fn finish_voice(voice: &Voice) -> bool {
    let context = voice.recall_id.context();
    if !voice.node.is_done(context) || context.has_children() {
        return false;
    }

    voice.recall_id.set_flags(RecallIdFlags::DONE);
    let recycling = voice.node.recycling();
    for signal in recycling.find_by_context(context) {
        recycling.remove_audio_signal(&signal);
    }
    if let Some(parent) = context.parent() {
        parent.remove_child(context);
    }
    voice.node.remove_voice(&voice.recall_id);
    log::debug!(
        target: "audio::staging",
        "voice finished on channel {} (context {})",
        voice.node.id(),
        context.id()
    );
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recall::{NoopHandler, SignalPlayback};
    use crate::recycling::Recycling;
    use vesper_types::{ChannelId, SoundcardFormat};

    fn channel_with_playback(id: u32, length: usize) -> Arc<ChannelNode> {
        let recycling = Recycling::with_template(44100, 4, SoundcardFormat::Float, length);
        let node = ChannelNode::new(ChannelId::new(id), recycling);
        node.add_template(Recall::new_template(
            "playback",
            RecallLevel::AudioSignal,
            Box::new(SignalPlayback),
        ));
        node.add_template(Recall::new_template(
            "channel",
            RecallLevel::Channel,
            Box::new(NoopHandler),
        ));
        node
    }

    #[test]
    fn voice_builds_a_recall_tree() {
        let engine = StagingEngine::default();
        let node = channel_with_playback(0, 2);
        let id = engine.start_voice(&node, SoundScope::Playback, None, None);

        let instances: Vec<_> = node.recalls().into_iter().filter(|r| !r.is_template()).collect();
        assert_eq!(instances.len(), 2);
        let root = instances.iter().find(|r| r.level() == RecallLevel::Channel).unwrap();
        assert_eq!(root.children().len(), 1);
        assert!(root.flags().contains(RecallFlags::PROPAGATE_DONE));
        assert_eq!(node.recycling().find_by_context(id.context()).len(), 1);
    }

    #[test]
    fn note_voice_runs_out_and_is_collected() {
        let engine = StagingEngine::default();
        let node = channel_with_playback(0, 2);
        node.schedule_note(SoundScope::Playback, Note::new(1, 4, 60));

        let report = engine.run_channel(&node, ScopeSelection::One(SoundScope::Playback), 0);
        assert_eq!(report.started, 0);

        let report = engine.run_channel(&node, ScopeSelection::One(SoundScope::Playback), 1);
        assert_eq!(report.started, 1);
        assert_eq!(node.voices().len(), 1);
        let id = node.voices()[0].clone();

        engine.run_channel(&node, ScopeSelection::One(SoundScope::Playback), 2);
        let report = engine.run_channel(&node, ScopeSelection::One(SoundScope::Playback), 3);
        assert_eq!(report.finished, 1);
        assert!(id.is_done());
        assert!(node.voices().is_empty());
        assert_eq!(node.recall_count(), 2);
        assert_eq!(node.recycling().signal_count(), 1);
    }

    #[test]
    fn realtime_policy_skips_silent_voices() {
        let engine = StagingEngine::new(StagingProgram::default(), StagingPolicy::RealtimeSafe);
        let node = channel_with_playback(0, 8);
        node.schedule_note(SoundScope::Playback, Note::new(0, 8, 60));
        engine.start_voice(&node, SoundScope::Playback, Some(Note::new(4, 8, 60)), None);

        let report = engine.run_channel(&node, ScopeSelection::One(SoundScope::Playback), 0);
        assert_eq!(report.started, 0);
        assert_eq!(report.skipped, 1);
        let report = engine.run_channel(&node, ScopeSelection::One(SoundScope::Playback), 4);
        assert_eq!(report.ran, 1);
    }

    #[test]
    fn child_channels_get_child_contexts() {
        let engine = StagingEngine::default();
        let out = channel_with_playback(0, 2);
        let input = channel_with_playback(1, 2);
        out.add_child(&input);

        let id = engine.start_voice(&out, SoundScope::Sequencer, None, None);
        let child = input.voices()[0].clone();
        assert!(Arc::ptr_eq(&child.context().parent().unwrap(), id.context()));
        assert_eq!(child.context().depth(), 1);

        for position in 0..4 {
            engine.run_channel(&out, ScopeSelection::All, position);
        }
        assert!(out.voices().is_empty());
        assert!(input.voices().is_empty());
    }
}
