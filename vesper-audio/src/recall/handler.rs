use vesper_types::SoundScope;

use super::Recall;

/// What the staging engine should do after a stage callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    /// Finish the recall; `done()` runs right after the callback returns.
    Done,
}

/// Per-tick parameters handed to every stage callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageTick {
    pub scope: SoundScope,
    /// Play position in ticks.
    pub position: u64,
    pub realtime_safe: bool,
}

impl StageTick {
    pub fn new(scope: SoundScope, position: u64, realtime_safe: bool) -> Self {
        Self {
            scope,
            position,
            realtime_safe,
        }
    }
}

pub struct StageContext<'a> {
    pub recall: &'a Recall,
    pub tick: StageTick,
}

/// Stage callbacks of one recall. Every callback has a no-op default.
///
/// Callbacks run with no recall lock held. They may lock ports and signals
/// one at a time but must not call back into stage execution of their own
/// recall. Finishing is signalled with [`Flow::Done`]; a callback that calls
/// `Recall::done` directly still gets its `done` once it has returned.
pub trait RecallHandler: Send {
    /// Runs before `run_init_pre`.
    fn resolve_dependencies(&mut self, _ctx: &StageContext<'_>) -> Flow {
        Flow::Continue
    }

    fn run_init_pre(&mut self, _ctx: &StageContext<'_>) -> Flow {
        Flow::Continue
    }

    fn run_init_inter(&mut self, _ctx: &StageContext<'_>) -> Flow {
        Flow::Continue
    }

    fn run_init_post(&mut self, _ctx: &StageContext<'_>) -> Flow {
        Flow::Continue
    }

    /// Apply automation lanes to the recall's ports at the play position.
    fn automate(&mut self, ctx: &StageContext<'_>) -> Flow {
        let mut index = 0;
        while let Some(port) = ctx.recall.port_at(index) {
            port.automate(ctx.tick.position);
            index += 1;
        }
        Flow::Continue
    }

    fn run_pre(&mut self, _ctx: &StageContext<'_>) -> Flow {
        Flow::Continue
    }

    fn run_inter(&mut self, _ctx: &StageContext<'_>) -> Flow {
        Flow::Continue
    }

    fn run_post(&mut self, _ctx: &StageContext<'_>) -> Flow {
        Flow::Continue
    }

    /// A cancel request was observed at `RunPre`.
    fn cancel(&mut self, _recall: &Recall) {}

    /// Release resources. Called once, when the recall finishes.
    fn done(&mut self, _recall: &Recall) {}

    /// A fresh handler for an instance duplicated from a template.
    fn duplicate(&self) -> Box<dyn RecallHandler>;
}

/// Handler without behaviour beyond the defaults.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopHandler;

impl RecallHandler for NoopHandler {
    fn duplicate(&self) -> Box<dyn RecallHandler> {
        Box::new(NoopHandler)
    }
}

/// Drives an audio signal's cursor: one buffer per tick.
///
/// Finishes the recall when the stream is exhausted or the signal's notes
/// have all ended.
#[derive(Debug, Clone, Copy, Default)]
pub struct SignalPlayback;

impl RecallHandler for SignalPlayback {
    fn run_pre(&mut self, ctx: &StageContext<'_>) -> Flow {
        let Some(signal) = ctx.recall.audio_signal() else {
            log::error!(
                target: "audio::recall",
                "signal playback on {:?} recall {}",
                ctx.recall.level(),
                ctx.recall.key()
            );
            return Flow::Done;
        };
        let state = signal.lock();
        let ended = !state.notes.is_empty()
            && state.notes.iter().all(|n| n.is_ended_at(ctx.tick.position));
        if state.is_exhausted() || ended {
            Flow::Done
        } else {
            Flow::Continue
        }
    }

    fn run_post(&mut self, ctx: &StageContext<'_>) -> Flow {
        match ctx.recall.audio_signal() {
            Some(signal) if signal.advance() => Flow::Continue,
            _ => Flow::Done,
        }
    }

    fn duplicate(&self) -> Box<dyn RecallHandler> {
        Box::new(SignalPlayback)
    }
}
