//! The plugin adapter: one native handle per sound scope, bound zero-copy
//! into adapter-owned float arrays.
//!
//! Lifecycle is `Unloaded -> Loaded -> PortsLoaded -> Unloaded`. Buffer size
//! and samplerate changes go through a [`ResetGuard`] that unloads under the
//! adapter lock and reloads when dropped.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use vesper_types::{MidiEvent, PluginFormat, PluginKind, PortDescriptor, PortHints, SoundScope};

use super::{PluginDescriptor, PluginError, PluginHandle, PluginRegistry, PluginResult};
use crate::buffer::{interleaved_to_planar, planar_to_interleaved, AudioBuffer};
use crate::conversion::Conversion;
use crate::lock;
use crate::port::{Port, PortFlags, PortValue};

/// Which processing path the adapter serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterRole {
    /// Audio effects; instruments are rejected.
    Effect,
    /// Note-driven instruments; plain effects are rejected.
    Instrument,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum AdapterPhase {
    Unloaded,
    Loaded,
    PortsLoaded,
}

/// A queued parameter change, applied before the next process call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ParamChange {
    pub index: usize,
    pub value: f32,
}

#[derive(Clone)]
struct ControlBinding {
    index: usize,
    port: Arc<Port>,
    output: bool,
    hints: PortHints,
    lower: f32,
    upper: f32,
}

#[derive(Default)]
struct ScopeData {
    handle: Option<Box<dyn PluginHandle>>,
    /// Planar input, one `buffer_size` plane per audio input.
    input: Vec<f32>,
    output: Vec<f32>,
    /// Control values, indexed by native port index.
    port_data: Vec<f32>,
    saved: Vec<f32>,
    events: Vec<MidiEvent>,
    params: Vec<ParamChange>,
    active: bool,
}

impl ScopeData {
    /// Deactivate and clean up the handle, then free the arrays it was bound to.
    fn release(&mut self) -> bool {
        let released = match self.handle.take() {
            Some(mut handle) => {
                if self.active {
                    handle.deactivate();
                }
                handle.cleanup();
                true
            }
            None => false,
        };
        self.active = false;
        self.input = Vec::new();
        self.output = Vec::new();
        self.port_data = Vec::new();
        self.saved = Vec::new();
        self.events.clear();
        self.params.clear();
        released
    }
}

struct AdapterState {
    phase: AdapterPhase,
    descriptor: Option<Arc<dyn PluginDescriptor>>,
    samplerate: u32,
    buffer_size: usize,
    ports: Option<Vec<Arc<Port>>>,
    controls: Vec<ControlBinding>,
    input_indices: Vec<usize>,
    output_indices: Vec<usize>,
    scopes: [ScopeData; SoundScope::COUNT],
    program: Option<(u32, u32)>,
    pending_program: Option<(u32, u32)>,
}

pub struct PluginAdapter {
    registry: Arc<dyn PluginRegistry>,
    format: PluginFormat,
    role: AdapterRole,
    filename: String,
    effect: String,
    state: Mutex<AdapterState>,
}

impl std::fmt::Debug for PluginAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginAdapter")
            .field("format", &self.format)
            .field("filename", &self.filename)
            .field("effect", &self.effect)
            .finish()
    }
}

impl PluginAdapter {
    pub fn new(
        registry: Arc<dyn PluginRegistry>,
        format: PluginFormat,
        role: AdapterRole,
        filename: &str,
        effect: &str,
        samplerate: u32,
        buffer_size: usize,
    ) -> Self {
        Self {
            registry,
            format,
            role,
            filename: filename.to_string(),
            effect: effect.to_string(),
            state: Mutex::new(AdapterState {
                phase: AdapterPhase::Unloaded,
                descriptor: None,
                samplerate,
                buffer_size: buffer_size.max(1),
                ports: None,
                controls: Vec::new(),
                input_indices: Vec::new(),
                output_indices: Vec::new(),
                scopes: std::array::from_fn(|_| ScopeData::default()),
                program: None,
                pending_program: None,
            }),
        }
    }

    pub fn format(&self) -> PluginFormat {
        self.format
    }

    pub fn role(&self) -> AdapterRole {
        self.role
    }

    pub fn filename(&self) -> &str {
        &self.filename
    }

    pub fn effect(&self) -> &str {
        &self.effect
    }

    pub fn phase(&self) -> AdapterPhase {
        lock(&self.state).phase
    }

    pub fn samplerate(&self) -> u32 {
        lock(&self.state).samplerate
    }

    pub fn buffer_size(&self) -> usize {
        lock(&self.state).buffer_size
    }

    /// Control ports, empty until `load_ports` ran.
    pub fn ports(&self) -> Vec<Arc<Port>> {
        lock(&self.state).ports.clone().unwrap_or_default()
    }

    pub fn input_count(&self) -> usize {
        lock(&self.state).input_indices.len()
    }

    pub fn output_count(&self) -> usize {
        lock(&self.state).output_indices.len()
    }

    /// Lengths of the input and output float arrays of `scope`.
    pub fn scope_buffer_lens(&self, scope: SoundScope) -> (usize, usize) {
        let state = lock(&self.state);
        let data = &state.scopes[scope.index()];
        (data.input.len(), data.output.len())
    }

    pub fn has_handle(&self, scope: SoundScope) -> bool {
        lock(&self.state).scopes[scope.index()].handle.is_some()
    }

    /// Resolve the descriptor through the registry. Already loaded adapters
    /// return right away. Failures are logged and leave the adapter unloaded.
    pub fn load_plugin(&self) -> PluginResult<()> {
        if lock(&self.state).phase != AdapterPhase::Unloaded {
            return Ok(());
        }

        let descriptor = self
            .registry
            .resolve(self.format, &self.filename, &self.effect)
            .map_err(|err| {
                log::warn!(target: "audio::plugin", "{}", err);
                err
            })?;

        let rejected = match (self.role, descriptor.kind()) {
            (AdapterRole::Effect, PluginKind::Instrument) => Some(PluginError::InstrumentNotAllowed {
                effect: self.effect.clone(),
            }),
            (AdapterRole::Instrument, PluginKind::Effect) => Some(PluginError::EffectNotAllowed {
                effect: self.effect.clone(),
            }),
            _ => None,
        };
        if let Some(err) = rejected {
            log::warn!(target: "audio::plugin", "{}", err);
            return Err(err);
        }

        let mut state = lock(&self.state);
        if state.phase == AdapterPhase::Unloaded {
            state.descriptor = Some(descriptor);
            state.phase = AdapterPhase::Loaded;
            log::debug!(
                target: "audio::plugin",
                "loaded {} {} from {}",
                self.format,
                self.effect,
                self.filename
            );
        }
        Ok(())
    }

    /// Create the control ports, allocate the per-scope arrays and
    /// instantiate, bind and activate one handle per scope.
    pub fn load_ports(&self) -> PluginResult<Vec<Arc<Port>>> {
        let mut state = lock(&self.state);
        match state.phase {
            AdapterPhase::PortsLoaded => {}
            AdapterPhase::Unloaded => {
                return Err(PluginError::NotLoaded {
                    effect: self.effect.clone(),
                })
            }
            AdapterPhase::Loaded => self.load_ports_locked(&mut state)?,
        }
        Ok(state.ports.clone().unwrap_or_default())
    }

    fn load_ports_locked(&self, state: &mut AdapterState) -> PluginResult<()> {
        let Some(descriptor) = state.descriptor.clone() else {
            return Err(PluginError::NotLoaded {
                effect: self.effect.clone(),
            });
        };
        let table = descriptor.ports();

        if state.ports.is_none() {
            let (ports, controls) = self.create_ports(table, state.samplerate);
            state.ports = Some(ports);
            state.controls = controls;
        }
        state.input_indices = table
            .iter()
            .filter(|p| p.is_audio() && p.is_input())
            .map(|p| p.index)
            .collect();
        state.output_indices = table
            .iter()
            .filter(|p| p.is_audio() && p.is_output())
            .map(|p| p.index)
            .collect();
        if table.is_empty() {
            log::warn!(target: "audio::plugin", "{} has an empty port table", self.effect);
        }

        let buffer_size = state.buffer_size;
        let slots = table.iter().map(|p| p.index + 1).max().unwrap_or(0);
        let input_len = state.input_indices.len() * buffer_size;
        let output_len = state.output_indices.len() * buffer_size;

        for scope in SoundScope::ALL {
            let data = &mut state.scopes[scope.index()];
            data.input = vec![0.0; input_len];
            data.output = vec![0.0; output_len];
            data.port_data = vec![0.0; slots];
            data.saved = vec![0.0; slots];
            for port in table.iter().filter(|p| p.is_control()) {
                data.port_data[port.index] = port.default;
            }

            match descriptor.instantiate(state.samplerate) {
                Ok(handle) => data.handle = Some(handle),
                Err(err) => {
                    log::warn!(target: "audio::plugin", "{} ({}): {}", self.effect, scope, err);
                    for data in state.scopes.iter_mut() {
                        data.release();
                    }
                    return Err(err);
                }
            }
            bind_and_activate(
                data,
                table,
                &state.input_indices,
                &state.output_indices,
                buffer_size,
            );
        }

        state.phase = AdapterPhase::PortsLoaded;
        state.pending_program = state.program;
        Ok(())
    }

    fn create_ports(
        &self,
        table: &[PortDescriptor],
        samplerate: u32,
    ) -> (Vec<Arc<Port>>, Vec<ControlBinding>) {
        let controls: Vec<&PortDescriptor> = table.iter().filter(|p| p.is_control()).collect();
        let count = controls.len();
        let mut ports = Vec::with_capacity(count);
        let mut bindings = Vec::with_capacity(count);

        for (k, desc) in controls.into_iter().enumerate() {
            let conversion = Conversion::from_hints(desc.hints, desc.lower, desc.upper, samplerate);
            let mut flags = PortFlags::NONE;
            if conversion.is_some() {
                flags.insert(PortFlags::CONVERT_ALWAYS);
            }
            if desc.is_output() {
                flags.insert(PortFlags::IS_OUTPUT);
            }
            if matches!(self.format, PluginFormat::Ladspa | PluginFormat::Dssi) {
                flags.insert(PortFlags::USE_LADSPA_FLOAT);
            }
            if !desc.hints.contains(PortHints::BOUNDED_BELOW)
                && !desc.hints.contains(PortHints::BOUNDED_ABOVE)
            {
                flags.insert(PortFlags::INFINITE_RANGE);
            }

            let port = Arc::new(
                Port::new(
                    &self.effect,
                    &desc.name,
                    &format!("{}/{}", k + 1, count),
                    PortValue::Float(desc.default),
                )
                .with_flags(flags)
                .with_conversion(conversion),
            );
            bindings.push(ControlBinding {
                index: desc.index,
                port: port.clone(),
                output: desc.is_output(),
                hints: desc.hints,
                lower: desc.lower,
                upper: desc.upper,
            });
            ports.push(port);
        }
        (ports, bindings)
    }

    /// Copy the current value of every control port into `values`, in port
    /// order. `values` is reused across ticks.
    pub fn read_controls(ports: &[Arc<Port>], values: &mut Vec<f32>) {
        values.clear();
        values.extend(ports.iter().map(|p| p.read_f32()));
    }

    /// Write the output-port entries of `values` back to their ports.
    pub fn store_outputs(ports: &[Arc<Port>], values: &[f32]) {
        for (port, value) in ports.iter().zip(values) {
            if port.is_output() {
                port.write_f32(*value);
            }
        }
    }

    /// Process one buffer for `scope`.
    ///
    /// `controls` holds one value per control port, as filled by
    /// [`read_controls`](Self::read_controls); output controls are written
    /// back into it. The mono source feeds every input plane and the first
    /// output plane overwrites it. Without audio outputs the source is left
    /// as it was. Returns `false` when nothing ran.
    pub fn run(&self, scope: SoundScope, buffer: &mut AudioBuffer, controls: &mut [f32]) -> bool {
        let mut state = lock(&self.state);
        if state.phase != AdapterPhase::PortsLoaded {
            return false;
        }
        let buffer_size = state.buffer_size;
        let inputs = state.input_indices.len();
        let outputs = state.output_indices.len();
        let program = state.pending_program.take();
        let role = self.role;

        let AdapterState {
            controls: bindings,
            scopes,
            ..
        } = &mut *state;
        let data = &mut scopes[scope.index()];
        let Some(handle) = data.handle.as_mut() else {
            log::trace!(target: "audio::plugin", "{} has no {} handle", self.effect, scope);
            return false;
        };

        for (binding, value) in bindings.iter().zip(controls.iter()) {
            if !binding.output {
                data.port_data[binding.index] = *value;
            }
        }

        if let Some((bank, number)) = program {
            data.saved.copy_from_slice(&data.port_data);
            handle.select_program(bank, number);
            data.port_data.copy_from_slice(&data.saved);
        }
        for change in data.params.drain(..) {
            handle.set_parameter(change.index, change.value);
        }

        data.input.fill(0.0);
        data.output.fill(0.0);
        let frames = buffer_size.min(buffer.len());
        for plane in data.input.chunks_mut(buffer_size).take(inputs) {
            interleaved_to_planar(buffer, 1, plane, 1, frames);
        }

        if role == AdapterRole::Instrument || !data.events.is_empty() {
            handle.run_synth(buffer_size, &data.events);
            data.events.clear();
        } else {
            handle.run(buffer_size);
        }

        if outputs > 0 {
            planar_to_interleaved(&data.output[..buffer_size], 1, buffer, 1, frames);
        }
        for (binding, value) in bindings.iter().zip(controls.iter_mut()) {
            if binding.output {
                *value = data.port_data[binding.index];
            }
        }
        true
    }

    /// Read ports, run and store outputs in one call.
    pub fn process(&self, scope: SoundScope, buffer: &mut AudioBuffer) -> bool {
        let ports = self.ports();
        let mut values = Vec::with_capacity(ports.len());
        Self::read_controls(&ports, &mut values);
        let ran = self.run(scope, buffer, &mut values);
        if ran {
            Self::store_outputs(&ports, &values);
        }
        ran
    }

    pub fn queue_event(&self, scope: SoundScope, event: MidiEvent) {
        lock(&self.state).scopes[scope.index()].events.push(event);
    }

    pub fn queue_param(&self, scope: SoundScope, change: ParamChange) {
        lock(&self.state).scopes[scope.index()].params.push(change);
    }

    /// Select a bank/program; applied before the next process call of every
    /// scope that runs afterwards.
    pub fn select_program(&self, bank: u32, program: u32) {
        let mut state = lock(&self.state);
        state.program = Some((bank, program));
        state.pending_program = Some((bank, program));
    }

    pub fn current_program(&self) -> Option<(u32, u32)> {
        lock(&self.state).program
    }

    /// Deactivate and clean up every handle. Returns `false` when the
    /// adapter was not loaded, so teardown happens exactly once.
    pub fn unload(&self) -> bool {
        let mut state = lock(&self.state);
        let unloaded = unload_locked(&mut state);
        if unloaded {
            state.descriptor = None;
            log::debug!(target: "audio::plugin", "unloaded {}", self.effect);
        }
        unloaded
    }

    /// Unload under the adapter lock. The returned guard accepts new sizes
    /// and restores the previous phase when dropped.
    pub fn begin_reset(&self) -> ResetGuard<'_> {
        let mut state = lock(&self.state);
        let restore = state.phase;
        unload_locked(&mut state);
        ResetGuard {
            adapter: self,
            state,
            restore,
        }
    }

    /// Apply a new buffer size and samplerate, reloading when loaded.
    pub fn reset(&self, buffer_size: usize, samplerate: u32) {
        {
            let mut guard = self.begin_reset();
            guard.set_buffer_size(buffer_size);
            guard.set_samplerate(samplerate);
        }

        let controls = lock(&self.state).controls.clone();
        for binding in controls {
            binding.port.set_conversion(Conversion::from_hints(
                binding.hints,
                binding.lower,
                binding.upper,
                samplerate,
            ));
        }
    }

    /// A fresh, unloaded adapter for the same effect and sizes.
    pub fn duplicate(&self) -> PluginAdapter {
        let (samplerate, buffer_size) = {
            let state = lock(&self.state);
            (state.samplerate, state.buffer_size)
        };
        PluginAdapter::new(
            self.registry.clone(),
            self.format,
            self.role,
            &self.filename,
            &self.effect,
            samplerate,
            buffer_size,
        )
    }
}

impl Drop for PluginAdapter {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        unload_locked(state);
    }
}

fn unload_locked(state: &mut AdapterState) -> bool {
    if state.phase == AdapterPhase::Unloaded {
        return false;
    }
    for data in state.scopes.iter_mut() {
        data.release();
    }
    state.phase = AdapterPhase::Unloaded;
    true
}

fn bind_and_activate(
    data: &mut ScopeData,
    table: &[PortDescriptor],
    inputs: &[usize],
    outputs: &[usize],
    buffer_size: usize,
) {
    let Some(handle) = data.handle.as_mut() else {
        return;
    };
    // SAFETY: the arrays were sized above and are not resized until the
    // handle is released.
    unsafe {
        for port in table.iter().filter(|p| p.is_control()) {
            handle.connect_port(port.index, data.port_data.as_mut_ptr().wrapping_add(port.index));
        }
        for (plane, &index) in inputs.iter().enumerate() {
            handle.connect_port(index, data.input.as_mut_ptr().wrapping_add(plane * buffer_size));
        }
        for (plane, &index) in outputs.iter().enumerate() {
            handle.connect_port(index, data.output.as_mut_ptr().wrapping_add(plane * buffer_size));
        }
    }
    handle.activate();
    data.active = true;
}

/// Holds the adapter lock across a buffer-size or samplerate change.
pub struct ResetGuard<'a> {
    adapter: &'a PluginAdapter,
    state: MutexGuard<'a, AdapterState>,
    restore: AdapterPhase,
}

impl ResetGuard<'_> {
    pub fn set_buffer_size(&mut self, buffer_size: usize) {
        self.state.buffer_size = buffer_size.max(1);
    }

    pub fn set_samplerate(&mut self, samplerate: u32) {
        self.state.samplerate = samplerate;
    }

    /// Phase the adapter returns to when the guard drops.
    pub fn restores(&self) -> AdapterPhase {
        self.restore
    }
}

impl Drop for ResetGuard<'_> {
    fn drop(&mut self) {
        if self.restore == AdapterPhase::Unloaded || self.state.descriptor.is_none() {
            return;
        }
        self.state.phase = AdapterPhase::Loaded;
        if self.restore == AdapterPhase::PortsLoaded {
            if let Err(err) = self.adapter.load_ports_locked(&mut self.state) {
                log::warn!(target: "audio::plugin", "reload of {} failed: {}", self.adapter.effect, err);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::test_support::{gain_plugin, PluginOp, StaticPluginRegistry};
    use vesper_types::SoundcardFormat;

    fn adapter(role: AdapterRole) -> (PluginAdapter, Arc<StaticPluginRegistry>) {
        let registry = Arc::new(StaticPluginRegistry::new());
        registry.register(gain_plugin("gain.so", "gain"));
        let adapter = PluginAdapter::new(
            registry.clone(),
            PluginFormat::Ladspa,
            role,
            "gain.so",
            "gain",
            44100,
            8,
        );
        (adapter, registry)
    }

    #[test]
    fn load_is_idempotent() {
        let (adapter, registry) = adapter(AdapterRole::Effect);
        adapter.load_plugin().unwrap();
        adapter.load_plugin().unwrap();
        assert_eq!(registry.resolve_count(), 1);
        assert_eq!(adapter.phase(), AdapterPhase::Loaded);
    }

    #[test]
    fn load_ports_requires_load() {
        let (adapter, _) = adapter(AdapterRole::Effect);
        assert!(matches!(
            adapter.load_ports(),
            Err(PluginError::NotLoaded { .. })
        ));
    }

    #[test]
    fn run_applies_gain_and_copies_back() {
        let (adapter, _) = adapter(AdapterRole::Effect);
        adapter.load_plugin().unwrap();
        let ports = adapter.load_ports().unwrap();
        Port::find_specifier(&ports, "gain")
            .unwrap()
            .safe_write(PortValue::Float(0.5));

        let mut buffer = AudioBuffer::new(SoundcardFormat::Float, 8);
        for i in 0..8 {
            buffer.set_sample(i, 0.5);
        }
        assert!(adapter.process(SoundScope::Playback, &mut buffer));
        assert!((buffer.sample(3) - 0.25).abs() < 1e-6);

        let level = Port::find_specifier(&ports, "level").unwrap();
        assert!((level.read_f32() - 0.25).abs() < 1e-6);
    }

    #[test]
    fn run_before_ports_is_a_noop() {
        let (adapter, _) = adapter(AdapterRole::Effect);
        let mut buffer = AudioBuffer::new(SoundcardFormat::Float, 8);
        buffer.set_sample(0, 0.5);
        assert!(!adapter.process(SoundScope::Playback, &mut buffer));
        assert_eq!(buffer.sample(0), 0.5);
    }

    #[test]
    fn unload_happens_once() {
        let (adapter, registry) = adapter(AdapterRole::Effect);
        adapter.load_plugin().unwrap();
        adapter.load_ports().unwrap();
        assert!(adapter.unload());
        assert!(!adapter.unload());
        let cleanups = registry.ops().iter().filter(|op| matches!(op, PluginOp::Cleanup { .. })).count();
        assert_eq!(cleanups, SoundScope::COUNT);
    }

    #[test]
    fn reset_reallocates_for_the_new_buffer_size() {
        let (adapter, registry) = adapter(AdapterRole::Effect);
        adapter.load_plugin().unwrap();
        adapter.load_ports().unwrap();
        let ports = adapter.ports();

        adapter.reset(32, 48000);
        assert_eq!(adapter.phase(), AdapterPhase::PortsLoaded);
        assert_eq!(adapter.scope_buffer_lens(SoundScope::Midi), (32, 32));
        assert!(Arc::ptr_eq(&ports[0], &adapter.ports()[0]));
        let instantiations = registry
            .ops()
            .iter()
            .filter(|op| matches!(op, PluginOp::Instantiate { samplerate: 48000, .. }))
            .count();
        assert_eq!(instantiations, SoundScope::COUNT);
    }

    #[test]
    fn reset_before_load_only_records_sizes() {
        let (adapter, registry) = adapter(AdapterRole::Effect);
        adapter.reset(64, 22050);
        assert_eq!(adapter.phase(), AdapterPhase::Unloaded);
        assert_eq!(adapter.buffer_size(), 64);
        assert!(registry.ops().is_empty());
    }

    #[test]
    fn duplicate_is_unloaded() {
        let (adapter, _) = adapter(AdapterRole::Effect);
        adapter.load_plugin().unwrap();
        let copy = adapter.duplicate();
        assert_eq!(copy.phase(), AdapterPhase::Unloaded);
        assert_eq!(copy.effect(), "gain");
    }
}
