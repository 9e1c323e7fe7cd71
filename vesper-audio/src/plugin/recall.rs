use std::sync::Arc;

use vesper_types::{MidiEvent, SoundcardFormat};

use super::{AdapterRole, PluginAdapter};
use crate::buffer::AudioBuffer;
use crate::port::Port;
use crate::recall::{Flow, Recall, RecallHandler, StageContext};

/// Runs a plugin adapter over the recall's audio signal, one buffer per tick.
///
/// The plugin is loaded during `InitPre`; a resolution failure finishes the
/// recall without touching audio. Instruments receive note-on and note-off
/// events derived from the signal's notes at the play position.
pub struct PluginRun {
    adapter: PluginAdapter,
    ports: Vec<Arc<Port>>,
    controls: Vec<f32>,
    scratch: AudioBuffer,
    events: Vec<MidiEvent>,
}

impl PluginRun {
    pub fn new(adapter: PluginAdapter) -> Self {
        Self {
            adapter,
            ports: Vec::new(),
            controls: Vec::new(),
            scratch: AudioBuffer::new(SoundcardFormat::Float, 0),
            events: Vec::new(),
        }
    }

    pub fn adapter(&self) -> &PluginAdapter {
        &self.adapter
    }
}

impl RecallHandler for PluginRun {
    fn run_init_pre(&mut self, ctx: &StageContext<'_>) -> Flow {
        if self.adapter.load_plugin().is_err() {
            return Flow::Done;
        }
        match self.adapter.load_ports() {
            Ok(ports) => {
                ctx.recall.set_ports(ports.clone());
                ctx.recall
                    .set_effect(self.adapter.filename(), self.adapter.effect());
                self.controls.reserve(ports.len());
                self.ports = ports;
                Flow::Continue
            }
            Err(err) => {
                log::warn!(target: "audio::plugin", "{}: {}", ctx.recall.name(), err);
                Flow::Done
            }
        }
    }

    fn run_pre(&mut self, ctx: &StageContext<'_>) -> Flow {
        let Some(signal) = ctx.recall.audio_signal() else {
            log::error!(
                target: "audio::plugin",
                "plugin recall {} is not bound to an audio signal",
                ctx.recall.key()
            );
            return Flow::Done;
        };
        let state = signal.lock();
        if state.is_exhausted() || !state.has_active_note(ctx.tick.position) {
            return Flow::Done;
        }
        if self.adapter.role() == AdapterRole::Instrument {
            self.events.clear();
            for note in &state.notes {
                let key = note.y.min(127) as u8;
                if note.x0 == ctx.tick.position {
                    self.events.push(MidiEvent::note_on(0, key, note.velocity));
                }
                if note.x1 == ctx.tick.position + 1 {
                    self.events.push(MidiEvent::note_off(0, key));
                }
            }
        }
        Flow::Continue
    }

    fn run_inter(&mut self, ctx: &StageContext<'_>) -> Flow {
        let Some(signal) = ctx.recall.audio_signal() else {
            return Flow::Done;
        };
        let scope = ctx.tick.scope;

        {
            let state = signal.lock();
            let Some(current) = state.current() else {
                return Flow::Done;
            };
            if self.scratch.format() != current.format() || self.scratch.len() != current.len() {
                self.scratch = AudioBuffer::new(current.format(), current.len());
            }
            self.scratch.copy_from(0, current, 0, current.len());
        }

        for event in self.events.drain(..) {
            self.adapter.queue_event(scope, event);
        }
        PluginAdapter::read_controls(&self.ports, &mut self.controls);
        if !self.adapter.run(scope, &mut self.scratch, &mut self.controls) {
            return Flow::Continue;
        }
        PluginAdapter::store_outputs(&self.ports, &self.controls);

        let mut state = signal.lock();
        if let Some(current) = state.current_mut() {
            current.copy_from(0, &self.scratch, 0, self.scratch.len());
        }
        Flow::Continue
    }

    fn done(&mut self, _recall: &Recall) {
        self.adapter.unload();
    }

    fn duplicate(&self) -> Box<dyn RecallHandler> {
        Box::new(PluginRun::new(self.adapter.duplicate()))
    }
}
