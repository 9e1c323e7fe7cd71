//! Native plugin hosting.
//!
//! A [`PluginRegistry`] resolves `(format, filename, effect)` to a
//! [`PluginDescriptor`]; a descriptor instantiates [`PluginHandle`]s. The
//! [`PluginAdapter`] owns one handle per sound scope and binds the native
//! port pointers straight into its own float arrays. The registry is passed
//! in at construction, so tests swap in [`test_support`] doubles.

mod adapter;
mod error;
pub mod native;
mod recall;
pub mod test_support;

pub use adapter::{AdapterPhase, AdapterRole, ParamChange, PluginAdapter, ResetGuard};
pub use error::{PluginError, PluginResult};
pub use recall::PluginRun;

use std::sync::Arc;

use vesper_types::{MidiEvent, PluginFormat, PluginKind, PortDescriptor, ProgramInfo};

/// Static description of one effect inside a plugin library.
pub trait PluginDescriptor: Send + Sync {
    fn format(&self) -> PluginFormat;
    fn kind(&self) -> PluginKind;
    fn filename(&self) -> &str;
    fn effect(&self) -> &str;
    fn ports(&self) -> &[PortDescriptor];

    fn programs(&self) -> Vec<ProgramInfo> {
        Vec::new()
    }

    fn instantiate(&self, samplerate: u32) -> PluginResult<Box<dyn PluginHandle>>;
}

/// One live native plugin instance.
pub trait PluginHandle: Send {
    /// Bind native port `index` to `data`.
    ///
    /// # Safety
    ///
    /// `data` must stay valid, and must not move, until the port is bound
    /// again or the handle is cleaned up. The caller must not hold Rust
    /// references into the pointed-to memory while `run` executes.
    unsafe fn connect_port(&mut self, index: usize, data: *mut f32);

    fn activate(&mut self);

    fn run(&mut self, frames: usize);

    /// Process with note events. Effects ignore the events.
    fn run_synth(&mut self, frames: usize, events: &[MidiEvent]) {
        let _ = events;
        self.run(frames);
    }

    fn select_program(&mut self, _bank: u32, _program: u32) {}

    /// Apply a queued parameter change ahead of processing.
    fn set_parameter(&mut self, _index: usize, _value: f32) {}

    fn deactivate(&mut self);

    fn cleanup(&mut self);
}

/// Resolves plugin descriptors by file and effect name.
pub trait PluginRegistry: Send + Sync {
    fn resolve(
        &self,
        format: PluginFormat,
        filename: &str,
        effect: &str,
    ) -> PluginResult<Arc<dyn PluginDescriptor>>;
}
