//! Recording plugin doubles for tests.
//!
//! [`TestPlugin`] describes an in-process plugin whose handles record every
//! native call into a shared log. [`StaticPluginRegistry`] serves registered
//! test plugins through the [`PluginRegistry`] seam.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use vesper_types::{
    MidiEvent, MidiEventKind, PluginFormat, PluginKind, PortDescriptor, PortDirection, ProgramInfo,
};

use super::{PluginDescriptor, PluginError, PluginHandle, PluginRegistry, PluginResult};
use crate::lock;

/// A native call recorded by [`TestPluginHandle`].
#[derive(Debug, Clone, PartialEq)]
pub enum PluginOp {
    Instantiate { instance: usize, samplerate: u32 },
    Connect { instance: usize, port: usize },
    Activate { instance: usize },
    Run { instance: usize, frames: usize },
    RunSynth { instance: usize, frames: usize, events: Vec<MidiEvent> },
    SelectProgram { instance: usize, bank: u32, program: u32 },
    SetParameter { instance: usize, index: usize, value: f32 },
    Deactivate { instance: usize },
    Cleanup { instance: usize },
}

pub type OpLog = Arc<Mutex<Vec<PluginOp>>>;

/// An in-process plugin.
///
/// Audio outputs carry the first audio input scaled by the `gain` control.
/// Without audio inputs the plugin is a synth that outputs `gain` while a
/// note is held. A `level` output control reports the output peak.
/// Selecting a program writes the program number into the `gain` slot.
pub struct TestPlugin {
    filename: String,
    effect: String,
    format: PluginFormat,
    kind: PluginKind,
    ports: Vec<PortDescriptor>,
    programs: Vec<ProgramInfo>,
    ops: OpLog,
    instances: Arc<AtomicUsize>,
    fail_instantiate: bool,
}

impl TestPlugin {
    pub fn new(filename: &str, effect: &str, kind: PluginKind, ports: Vec<PortDescriptor>) -> Self {
        Self {
            filename: filename.to_string(),
            effect: effect.to_string(),
            format: PluginFormat::Ladspa,
            kind,
            ports,
            programs: Vec::new(),
            ops: Arc::new(Mutex::new(Vec::new())),
            instances: Arc::new(AtomicUsize::new(0)),
            fail_instantiate: false,
        }
    }

    pub fn with_format(mut self, format: PluginFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_programs(mut self, programs: Vec<ProgramInfo>) -> Self {
        self.programs = programs;
        self
    }

    pub fn with_ops(mut self, ops: OpLog) -> Self {
        self.ops = ops;
        self
    }

    /// Every instantiation fails.
    pub fn failing(mut self) -> Self {
        self.fail_instantiate = true;
        self
    }

    pub fn ops(&self) -> Vec<PluginOp> {
        lock(&self.ops).clone()
    }

    /// Live handles: instantiated and not yet cleaned up.
    pub fn live_instances(&self) -> usize {
        self.instances.load(Ordering::SeqCst)
    }
}

/// Mono gain effect: `in`, `out`, `gain` (0..=2), `level` (output).
pub fn gain_plugin(filename: &str, effect: &str) -> TestPlugin {
    TestPlugin::new(
        filename,
        effect,
        PluginKind::Effect,
        vec![
            PortDescriptor::audio(0, "in", PortDirection::Input),
            PortDescriptor::audio(1, "out", PortDirection::Output),
            PortDescriptor::control_input(2, "gain", 0.0, 2.0, 1.0),
            PortDescriptor::control_input(3, "level", 0.0, 1.0, 0.0)
                .with_direction(PortDirection::Output),
        ],
    )
}

/// Note-driven synth: `out`, `gain` (0..=1).
pub fn synth_plugin(filename: &str, effect: &str) -> TestPlugin {
    TestPlugin::new(
        filename,
        effect,
        PluginKind::Instrument,
        vec![
            PortDescriptor::audio(0, "out", PortDirection::Output),
            PortDescriptor::control_input(1, "gain", 0.0, 1.0, 0.5),
        ],
    )
    .with_format(PluginFormat::Dssi)
}

impl PluginDescriptor for TestPlugin {
    fn format(&self) -> PluginFormat {
        self.format
    }

    fn kind(&self) -> PluginKind {
        self.kind
    }

    fn filename(&self) -> &str {
        &self.filename
    }

    fn effect(&self) -> &str {
        &self.effect
    }

    fn ports(&self) -> &[PortDescriptor] {
        &self.ports
    }

    fn programs(&self) -> Vec<ProgramInfo> {
        self.programs.clone()
    }

    fn instantiate(&self, samplerate: u32) -> PluginResult<Box<dyn PluginHandle>> {
        if self.fail_instantiate {
            return Err(PluginError::InstantiationFailed {
                effect: self.effect.clone(),
                reason: "test plugin set to fail".to_string(),
            });
        }
        let instance = self.instances.fetch_add(1, Ordering::SeqCst);
        lock(&self.ops).push(PluginOp::Instantiate {
            instance,
            samplerate,
        });
        let slots = self.ports.iter().map(|p| p.index + 1).max().unwrap_or(0);
        Ok(Box::new(TestPluginHandle {
            instance,
            ports: self.ports.clone(),
            bound: vec![std::ptr::null_mut(); slots],
            held: Vec::new(),
            ops: self.ops.clone(),
            instances: self.instances.clone(),
            cleaned_up: false,
        }))
    }
}

pub struct TestPluginHandle {
    instance: usize,
    ports: Vec<PortDescriptor>,
    bound: Vec<*mut f32>,
    held: Vec<u8>,
    ops: OpLog,
    instances: Arc<AtomicUsize>,
    cleaned_up: bool,
}

// SAFETY: the bound pointers are only dereferenced from `run`, which the
// owning adapter calls under its own lock.
unsafe impl Send for TestPluginHandle {}

impl TestPluginHandle {
    fn record(&self, op: PluginOp) {
        lock(&self.ops).push(op);
    }

    fn slot(&self, name: &str) -> Option<*mut f32> {
        self.ports
            .iter()
            .find(|p| p.is_control() && p.name == name)
            .and_then(|p| self.bound.get(p.index).copied())
            .filter(|ptr| !ptr.is_null())
    }

    fn process(&mut self, frames: usize) {
        // SAFETY: the adapter binds every port to an array of at least
        // `frames` samples (controls to a single value) before running.
        unsafe {
            let gain = match self.slot("gain") {
                Some(slot) => *slot,
                None => 1.0,
            };
            let input = self
                .ports
                .iter()
                .find(|p| p.is_audio() && p.is_input())
                .map(|p| self.bound[p.index])
                .filter(|ptr| !ptr.is_null());
            let mut peak = 0.0f32;
            for port in self.ports.iter().filter(|p| p.is_audio() && p.is_output()) {
                let out = self.bound[port.index];
                if out.is_null() {
                    continue;
                }
                let out = std::slice::from_raw_parts_mut(out, frames);
                match input {
                    Some(input) => {
                        let input = std::slice::from_raw_parts(input, frames);
                        for (o, i) in out.iter_mut().zip(input) {
                            *o = i * gain;
                        }
                    }
                    None => {
                        let value = if self.held.is_empty() { 0.0 } else { gain };
                        out.fill(value);
                    }
                }
                peak = out.iter().fold(peak, |acc, s| acc.max(s.abs()));
            }
            if let Some(level) = self.slot("level") {
                *level = peak;
            }
        }
    }
}

impl PluginHandle for TestPluginHandle {
    unsafe fn connect_port(&mut self, index: usize, data: *mut f32) {
        if let Some(slot) = self.bound.get_mut(index) {
            *slot = data;
        }
        self.record(PluginOp::Connect {
            instance: self.instance,
            port: index,
        });
    }

    fn activate(&mut self) {
        self.record(PluginOp::Activate {
            instance: self.instance,
        });
    }

    fn run(&mut self, frames: usize) {
        self.record(PluginOp::Run {
            instance: self.instance,
            frames,
        });
        self.process(frames);
    }

    fn run_synth(&mut self, frames: usize, events: &[MidiEvent]) {
        self.record(PluginOp::RunSynth {
            instance: self.instance,
            frames,
            events: events.to_vec(),
        });
        for event in events {
            match event.kind {
                MidiEventKind::NoteOn { key, .. } => self.held.push(key),
                MidiEventKind::NoteOff { key } => self.held.retain(|k| *k != key),
            }
        }
        self.process(frames);
    }

    fn select_program(&mut self, bank: u32, program: u32) {
        self.record(PluginOp::SelectProgram {
            instance: self.instance,
            bank,
            program,
        });
        if let Some(gain) = self.slot("gain") {
            // SAFETY: control slots point into the adapter's port data.
            unsafe { *gain = program as f32 };
        }
    }

    fn set_parameter(&mut self, index: usize, value: f32) {
        self.record(PluginOp::SetParameter {
            instance: self.instance,
            index,
            value,
        });
    }

    fn deactivate(&mut self) {
        self.record(PluginOp::Deactivate {
            instance: self.instance,
        });
    }

    fn cleanup(&mut self) {
        if self.cleaned_up {
            return;
        }
        self.cleaned_up = true;
        self.bound.iter_mut().for_each(|p| *p = std::ptr::null_mut());
        self.instances.fetch_sub(1, Ordering::SeqCst);
        self.record(PluginOp::Cleanup {
            instance: self.instance,
        });
    }
}

/// Registry over a fixed set of [`TestPlugin`]s sharing one op log.
#[derive(Default)]
pub struct StaticPluginRegistry {
    plugins: Mutex<Vec<Arc<TestPlugin>>>,
    ops: OpLog,
    resolves: AtomicUsize,
}

impl StaticPluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `plugin`; its handles record into this registry's log.
    pub fn register(&self, plugin: TestPlugin) -> Arc<TestPlugin> {
        let plugin = Arc::new(plugin.with_ops(self.ops.clone()));
        lock(&self.plugins).push(plugin.clone());
        plugin
    }

    pub fn ops(&self) -> Vec<PluginOp> {
        lock(&self.ops).clone()
    }

    pub fn clear_ops(&self) {
        lock(&self.ops).clear();
    }

    pub fn resolve_count(&self) -> usize {
        self.resolves.load(Ordering::SeqCst)
    }
}

impl PluginRegistry for StaticPluginRegistry {
    fn resolve(
        &self,
        format: PluginFormat,
        filename: &str,
        effect: &str,
    ) -> PluginResult<Arc<dyn PluginDescriptor>> {
        self.resolves.fetch_add(1, Ordering::SeqCst);
        lock(&self.plugins)
            .iter()
            .find(|p| p.format == format && p.filename == filename && p.effect == effect)
            .map(|p| p.clone() as Arc<dyn PluginDescriptor>)
            .ok_or_else(|| PluginError::DescriptorNotFound {
                filename: filename.to_string(),
                effect: effect.to_string(),
            })
    }
}

/// Registry that resolves nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullRegistry;

impl PluginRegistry for NullRegistry {
    fn resolve(
        &self,
        _format: PluginFormat,
        filename: &str,
        effect: &str,
    ) -> PluginResult<Arc<dyn PluginDescriptor>> {
        Err(PluginError::DescriptorNotFound {
            filename: filename.to_string(),
            effect: effect.to_string(),
        })
    }
}
