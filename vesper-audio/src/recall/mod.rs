//! Recalls: staged processing units attached to a channel, a recycling or an
//! audio signal.
//!
//! A template recall is configured once per node and never runs. When a
//! voice starts, the template is duplicated into an instance bound to the
//! voice's [`RecallId`]; the instance walks the stage machine
//! `Initial -> InitPre -> InitInter -> InitPost -> {RunPre, RunInter, RunPost}* -> Done`
//! and is dropped by its owning [`RecallList`] once done.
//!
//! Stage callbacks live in a [`RecallHandler`]. The handler is taken out of
//! its slot while it runs, so no recall lock is held during computation.

mod handler;
mod list;

pub use handler::{Flow, NoopHandler, RecallHandler, SignalPlayback, StageContext, StageTick};
pub use list::RecallList;

use std::sync::{Arc, Mutex, Weak};

use vesper_types::{ChannelId, RecallKey, SoundScope, StagingStage};

use crate::audio_signal::AudioSignal;
use crate::port::Port;
use crate::recall_id::{RecallId, RecyclingContext};
use crate::recycling::Recycling;
use crate::{flag_set, lock, next_id};

flag_set!(
    RecallFlags {
        /// Configuration only; duplicated into instances, never run.
        TEMPLATE = 0;
        PERSISTENT = 1;
        PERSISTENT_PLAYBACK = 2;
        PERSISTENT_SEQUENCER = 3;
        PERSISTENT_NOTATION = 4;
        PLAYBACK = 5;
        SEQUENCER = 6;
        NOTATION = 7;
        /// Finish once the last child finished.
        PROPAGATE_DONE = 8;
        INITIAL_RUN = 9;
        RUN_INITIALIZED = 10;
        HAS_OUTPUT_PORT = 11;
    }
);

impl RecallFlags {
    pub const SCOPES: RecallFlags = RecallFlags::PLAYBACK
        .union(RecallFlags::SEQUENCER)
        .union(RecallFlags::NOTATION);

    pub const PERSISTENCE: RecallFlags = RecallFlags::PERSISTENT
        .union(RecallFlags::PERSISTENT_PLAYBACK)
        .union(RecallFlags::PERSISTENT_SEQUENCER)
        .union(RecallFlags::PERSISTENT_NOTATION);

    /// Flags every child takes over from its parent.
    pub const INHERITED: RecallFlags = RecallFlags::SCOPES
        .union(RecallFlags::PROPAGATE_DONE)
        .union(RecallFlags::INITIAL_RUN);

    pub fn for_scope(scope: SoundScope) -> RecallFlags {
        match scope {
            SoundScope::Playback => RecallFlags::PLAYBACK,
            SoundScope::Sequencer => RecallFlags::SEQUENCER,
            SoundScope::Notation => RecallFlags::NOTATION,
            SoundScope::Wave | SoundScope::Midi => RecallFlags::NONE,
        }
    }

    /// Whether these flags keep a recall from finishing.
    fn blocks_done(self) -> bool {
        self.intersects(RecallFlags::TEMPLATE | RecallFlags::PERSISTENT)
            || (self.contains(RecallFlags::PERSISTENT_PLAYBACK)
                && self.contains(RecallFlags::PLAYBACK))
            || (self.contains(RecallFlags::PERSISTENT_SEQUENCER)
                && self.contains(RecallFlags::SEQUENCER))
            || (self.contains(RecallFlags::PERSISTENT_NOTATION)
                && self.contains(RecallFlags::NOTATION))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RecallStage {
    Initial,
    InitPre,
    InitInter,
    InitPost,
    RunPre,
    RunInter,
    RunPost,
    Done,
}

impl RecallStage {
    fn after(stage: StagingStage) -> Option<RecallStage> {
        match stage {
            StagingStage::InitPre => Some(RecallStage::InitPre),
            StagingStage::InitInter => Some(RecallStage::InitInter),
            StagingStage::InitPost => Some(RecallStage::InitPost),
            StagingStage::RunPre => Some(RecallStage::RunPre),
            StagingStage::RunInter => Some(RecallStage::RunInter),
            StagingStage::RunPost => Some(RecallStage::RunPost),
            StagingStage::Automate => None,
        }
    }
}

/// The tree level a recall works on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecallLevel {
    Channel,
    Recycling,
    AudioSignal,
}

/// What a recall is bound to.
#[derive(Debug, Clone)]
pub enum RecallKind {
    Template(RecallLevel),
    Channel(ChannelId),
    Recycling(Arc<Recycling>),
    AudioSignal(Arc<AudioSignal>),
}

impl RecallKind {
    pub fn level(&self) -> RecallLevel {
        match self {
            RecallKind::Template(level) => *level,
            RecallKind::Channel(_) => RecallLevel::Channel,
            RecallKind::Recycling(_) => RecallLevel::Recycling,
            RecallKind::AudioSignal(_) => RecallLevel::AudioSignal,
        }
    }

    pub fn is_template(&self) -> bool {
        matches!(self, RecallKind::Template(_))
    }
}

struct RecallState {
    flags: RecallFlags,
    stage: RecallStage,
    recall_id: Option<Arc<RecallId>>,
    parent: Weak<Recall>,
    children: Vec<Arc<Recall>>,
    cancel_requested: bool,
    /// `done()` ran while the handler was out of its slot.
    pending_done: bool,
    dependencies: Vec<RecallKey>,
    ports: Vec<Arc<Port>>,
    /// Plugin `(filename, effect)` this recall hosts.
    effect: Option<(String, String)>,
}

pub struct Recall {
    key: RecallKey,
    name: String,
    kind: RecallKind,
    state: Mutex<RecallState>,
    handler: Mutex<Option<Box<dyn RecallHandler>>>,
}

impl std::fmt::Debug for Recall {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Recall")
            .field("key", &self.key)
            .field("name", &self.name)
            .field("level", &self.kind.level())
            .finish()
    }
}

impl Recall {
    fn build(
        name: &str,
        kind: RecallKind,
        flags: RecallFlags,
        handler: Box<dyn RecallHandler>,
    ) -> Self {
        Self {
            key: RecallKey::new(next_id()),
            name: name.to_string(),
            kind,
            state: Mutex::new(RecallState {
                flags,
                stage: RecallStage::Initial,
                recall_id: None,
                parent: Weak::new(),
                children: Vec::new(),
                cancel_requested: false,
                pending_done: false,
                dependencies: Vec::new(),
                ports: Vec::new(),
                effect: None,
            }),
            handler: Mutex::new(Some(handler)),
        }
    }

    pub fn new_template(
        name: &str,
        level: RecallLevel,
        handler: Box<dyn RecallHandler>,
    ) -> Arc<Self> {
        Arc::new(Self::build(
            name,
            RecallKind::Template(level),
            RecallFlags::TEMPLATE,
            handler,
        ))
    }

    /// An instance created directly, without a template.
    pub fn new_instance(
        name: &str,
        kind: RecallKind,
        recall_id: Option<Arc<RecallId>>,
        handler: Box<dyn RecallHandler>,
    ) -> Arc<Self> {
        let flags = recall_id
            .as_ref()
            .map(|id| RecallFlags::for_scope(id.scope()))
            .unwrap_or_default();
        let recall = Self::build(name, kind, flags, handler);
        lock(&recall.state).recall_id = recall_id;
        Arc::new(recall)
    }

    pub fn key(&self) -> RecallKey {
        self.key
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> &RecallKind {
        &self.kind
    }

    pub fn level(&self) -> RecallLevel {
        self.kind.level()
    }

    pub fn is_template(&self) -> bool {
        self.kind.is_template()
    }

    pub fn audio_signal(&self) -> Option<&Arc<AudioSignal>> {
        match &self.kind {
            RecallKind::AudioSignal(signal) => Some(signal),
            _ => None,
        }
    }

    pub fn recycling(&self) -> Option<&Arc<Recycling>> {
        match &self.kind {
            RecallKind::Recycling(recycling) => Some(recycling),
            _ => None,
        }
    }

    pub fn flags(&self) -> RecallFlags {
        lock(&self.state).flags
    }

    pub fn stage(&self) -> RecallStage {
        lock(&self.state).stage
    }

    pub fn is_done(&self) -> bool {
        self.stage() == RecallStage::Done
    }

    pub fn recall_id(&self) -> Option<Arc<RecallId>> {
        lock(&self.state).recall_id.clone()
    }

    pub fn scope(&self) -> Option<SoundScope> {
        self.recall_id().map(|id| id.scope())
    }

    pub fn matches_context(&self, context: &RecyclingContext) -> bool {
        self.recall_id()
            .map(|id| id.matches_context(context))
            .unwrap_or(false)
    }

    pub fn parent(&self) -> Option<Arc<Recall>> {
        lock(&self.state).parent.upgrade()
    }

    pub fn children(&self) -> Vec<Arc<Recall>> {
        lock(&self.state).children.clone()
    }

    fn child_at(&self, index: usize) -> Option<Arc<Recall>> {
        lock(&self.state).children.get(index).cloned()
    }

    /// Snapshot of the recall's ports.
    pub fn ports(&self) -> Vec<Arc<Port>> {
        lock(&self.state).ports.clone()
    }

    pub fn port_at(&self, index: usize) -> Option<Arc<Port>> {
        lock(&self.state).ports.get(index).cloned()
    }

    pub fn set_ports(&self, ports: Vec<Arc<Port>>) {
        lock(&self.state).ports = ports;
    }

    pub fn add_port(&self, port: Arc<Port>) {
        lock(&self.state).ports.push(port);
    }

    pub fn find_port(&self, specifier: &str) -> Option<Arc<Port>> {
        Port::find_specifier(&self.ports(), specifier)
    }

    pub fn dependencies(&self) -> Vec<RecallKey> {
        lock(&self.state).dependencies.clone()
    }

    pub fn add_dependency(&self, key: RecallKey) {
        let mut state = lock(&self.state);
        if !state.dependencies.contains(&key) {
            state.dependencies.push(key);
        }
    }

    pub fn effect(&self) -> Option<(String, String)> {
        lock(&self.state).effect.clone()
    }

    pub fn set_effect(&self, filename: &str, effect: &str) {
        lock(&self.state).effect = Some((filename.to_string(), effect.to_string()));
    }

    /// Insert `flags` here and pass the inheritable part down the tree.
    /// Recycling-level children do not take over persistence.
    pub fn set_flags(&self, flags: RecallFlags) {
        let children = {
            let mut state = lock(&self.state);
            state.flags.insert(flags);
            state.children.clone()
        };
        for child in children {
            let mut inherited = flags & RecallFlags::INHERITED;
            if child.level() != RecallLevel::Recycling {
                inherited.insert(flags & RecallFlags::PERSISTENCE);
            }
            if !inherited.is_empty() {
                child.set_flags(inherited);
            }
        }
    }

    pub fn unset_flags(&self, flags: RecallFlags) {
        lock(&self.state).flags.remove(flags);
    }

    /// Attach `child`; it inherits this recall's flags.
    pub fn add_child(self: &Arc<Self>, child: &Arc<Recall>) {
        if Arc::ptr_eq(self, child) {
            log::error!(target: "audio::recall", "recall {} cannot be its own child", self.key);
            return;
        }
        lock(&child.state).parent = Arc::downgrade(self);
        let flags = {
            let mut state = lock(&self.state);
            if !state.children.iter().any(|c| Arc::ptr_eq(c, child)) {
                state.children.push(child.clone());
            }
            state.flags
        };
        let mut inherited = flags & RecallFlags::INHERITED;
        if child.level() != RecallLevel::Recycling {
            inherited.insert(flags & RecallFlags::PERSISTENCE);
        }
        child.set_flags(inherited);
    }

    /// Detach `child`. Losing the last child finishes a `PROPAGATE_DONE`
    /// recall that is not persistent.
    pub fn remove_child(self: &Arc<Self>, child: &Recall) -> bool {
        let (removed, propagate) = {
            let mut state = lock(&self.state);
            let before = state.children.len();
            state.children.retain(|c| !std::ptr::eq(c.as_ref(), child));
            let removed = before != state.children.len();
            let propagate = removed
                && state.children.is_empty()
                && state.flags.contains(RecallFlags::PROPAGATE_DONE)
                && !state.flags.contains(RecallFlags::PERSISTENT);
            (removed, propagate)
        };
        if removed {
            lock(&child.state).parent = Weak::new();
        }
        if propagate {
            self.done();
        }
        removed
    }

    /// Request cancellation of this recall and its children. The request is
    /// honoured at the start of the next `RunPre`.
    pub fn cancel(&self) {
        let children = {
            let mut state = lock(&self.state);
            if state.flags.contains(RecallFlags::TEMPLATE) {
                return;
            }
            state.cancel_requested = true;
            state.children.clone()
        };
        for child in children {
            child.cancel();
        }
    }

    pub fn cancel_requested(&self) -> bool {
        lock(&self.state).cancel_requested
    }

    /// Clear persistence and finish.
    pub fn stop_persistent(self: &Arc<Self>) -> bool {
        self.unset_flags(RecallFlags::PERSISTENCE);
        self.done()
    }

    /// Finish this recall: release handler resources, finish the children and
    /// detach from the parent. Returns whether anything happened; templates,
    /// persistent and already finished recalls are left alone.
    pub fn done(self: &Arc<Self>) -> bool {
        let (children, parent) = {
            let mut state = lock(&self.state);
            if state.stage == RecallStage::Done || state.flags.blocks_done() {
                return false;
            }
            state.stage = RecallStage::Done;
            (std::mem::take(&mut state.children), state.parent.upgrade())
        };
        log::debug!(target: "audio::recall", "recall {} ({}) done", self.key, self.name);

        if self.with_handler(|handler| handler.done(self)).is_none() {
            // Called from inside a callback; the handler is released once it
            // is back in its slot.
            lock(&self.state).pending_done = true;
        }
        for child in &children {
            child.done();
        }
        if let Some(parent) = parent {
            parent.remove_child(self);
        }
        true
    }

    /// Create an instance of this template bound to `recall_id`.
    ///
    /// `kind` must be an instance of the template's level. Anything else is
    /// rejected with an error log.
    pub fn duplicate(&self, recall_id: &Arc<RecallId>, kind: RecallKind) -> Option<Arc<Recall>> {
        let RecallKind::Template(level) = self.kind else {
            log::error!(target: "audio::recall", "recall {} is not a template", self.key);
            return None;
        };
        if kind.is_template() || kind.level() != level {
            log::error!(
                target: "audio::recall",
                "recall {} expects a {:?} instance, got {:?}",
                self.key,
                level,
                kind.level()
            );
            return None;
        }

        let Some(handler) = self.with_handler(|handler| handler.duplicate()) else {
            log::error!(target: "audio::recall", "recall {} handler is busy", self.key);
            return None;
        };
        let (mut flags, dependencies, ports, effect) = {
            let state = lock(&self.state);
            (
                state.flags,
                state.dependencies.clone(),
                state.ports.clone(),
                state.effect.clone(),
            )
        };
        flags.remove(RecallFlags::TEMPLATE);
        flags.insert(RecallFlags::for_scope(recall_id.scope()));

        let instance = Self::build(&self.name, kind, flags, handler);
        {
            let mut state = lock(&instance.state);
            state.recall_id = Some(recall_id.clone());
            state.dependencies = dependencies;
            state.ports = ports;
            state.effect = effect;
        }
        Some(Arc::new(instance))
    }

    /// Run `stage` on this recall, then on its children.
    ///
    /// Children are visited even when this recall rejects the stage, so a
    /// subtree never falls behind its root within one tick.
    pub fn run_stage(self: &Arc<Self>, stage: StagingStage, tick: StageTick) {
        self.run_own_stage(stage, tick);
        let mut index = 0;
        while let Some(child) = self.child_at(index) {
            child.run_stage(stage, tick);
            // A finished child detaches itself and its next sibling moves up.
            if self
                .child_at(index)
                .is_some_and(|current| Arc::ptr_eq(&current, &child))
            {
                index += 1;
            }
        }
    }

    fn run_own_stage(self: &Arc<Self>, stage: StagingStage, tick: StageTick) {
        let (flags, current) = {
            let state = lock(&self.state);
            (state.flags, state.stage)
        };
        if flags.contains(RecallFlags::TEMPLATE) || current == RecallStage::Done {
            return;
        }

        if stage.is_init() {
            self.init_until(stage, tick);
            return;
        }

        if !flags.contains(RecallFlags::RUN_INITIALIZED) {
            self.init_until(StagingStage::InitPost, tick);
            if !self.flags().contains(RecallFlags::RUN_INITIALIZED) {
                return;
            }
        }

        if stage == StagingStage::RunPre && self.take_cancel_request() {
            self.with_handler(|handler| handler.cancel(self));
            if self.flags().intersects(RecallFlags::PERSISTENCE) {
                self.stop_persistent();
            } else {
                self.done();
            }
            return;
        }

        let flow = self.invoke(stage, tick);
        if let Some(next) = RecallStage::after(stage) {
            let mut state = lock(&self.state);
            if state.stage != RecallStage::Done {
                state.stage = next;
            }
            if stage == StagingStage::RunPost {
                state.flags.remove(RecallFlags::INITIAL_RUN);
            }
        }
        if flow == Flow::Done {
            self.done();
        }
    }

    /// Run the outstanding init stages up to and including `target`, in order.
    fn init_until(self: &Arc<Self>, target: StagingStage, tick: StageTick) {
        for step in [
            StagingStage::InitPre,
            StagingStage::InitInter,
            StagingStage::InitPost,
        ] {
            let Some(reached) = RecallStage::after(step) else {
                continue;
            };
            if self.stage() >= reached {
                if step == target {
                    break;
                }
                continue;
            }

            let mut flow = Flow::Continue;
            if step == StagingStage::InitPre {
                flow = self.invoke_resolve_dependencies(tick);
            }
            if flow == Flow::Continue {
                flow = self.invoke(step, tick);
            }
            {
                let mut state = lock(&self.state);
                if state.stage == RecallStage::Done {
                    return;
                }
                state.stage = reached;
                if step == StagingStage::InitPost {
                    state
                        .flags
                        .insert(RecallFlags::RUN_INITIALIZED | RecallFlags::INITIAL_RUN);
                }
            }
            if flow == Flow::Done {
                self.done();
                return;
            }
            if step == target {
                break;
            }
        }
    }

    fn take_cancel_request(&self) -> bool {
        std::mem::take(&mut lock(&self.state).cancel_requested)
    }

    fn invoke_resolve_dependencies(&self, tick: StageTick) -> Flow {
        let ctx = StageContext { recall: self, tick };
        self.with_handler(|handler| handler.resolve_dependencies(&ctx))
            .unwrap_or(Flow::Continue)
    }

    fn invoke(&self, stage: StagingStage, tick: StageTick) -> Flow {
        let ctx = StageContext { recall: self, tick };
        self.with_handler(|handler| match stage {
            StagingStage::InitPre => handler.run_init_pre(&ctx),
            StagingStage::InitInter => handler.run_init_inter(&ctx),
            StagingStage::InitPost => handler.run_init_post(&ctx),
            StagingStage::Automate => handler.automate(&ctx),
            StagingStage::RunPre => handler.run_pre(&ctx),
            StagingStage::RunInter => handler.run_inter(&ctx),
            StagingStage::RunPost => handler.run_post(&ctx),
        })
        .unwrap_or(Flow::Continue)
    }

    /// Run `f` with the handler taken out of its slot. Returns `None` when
    /// the handler is already running further up the stack.
    ///
    /// A `done()` that arrived while `f` ran is delivered to the handler
    /// before it goes back.
    fn with_handler<R>(&self, f: impl FnOnce(&mut dyn RecallHandler) -> R) -> Option<R> {
        let mut handler = lock(&self.handler).take()?;
        let result = f(handler.as_mut());
        if std::mem::take(&mut lock(&self.state).pending_done) {
            handler.done(self);
        }
        *lock(&self.handler) = Some(handler);
        Some(result)
    }
}
