use std::ffi::{c_char, c_int, c_ulong, c_void};
use std::path::Path;
use std::sync::Arc;

use libloading::Library;
use vesper_types::{
    MidiEvent, MidiEventKind, PluginFormat, PluginKind, PortDescriptor, ProgramInfo,
};

use super::ladspa::{port_table, LadspaHandle, RawLadspaDescriptor};
use super::{c_string, open_library};
use crate::plugin::{PluginDescriptor, PluginError, PluginHandle, PluginResult};

#[repr(C)]
struct RawProgramDescriptor {
    bank: c_ulong,
    program: c_ulong,
    name: *const c_char,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
struct SeqNote {
    channel: u8,
    note: u8,
    velocity: u8,
    off_velocity: u8,
    duration: u32,
}

/// ALSA sequencer event, as consumed by `run_synth`. Only note events are
/// produced; `time[0]` carries the frame offset inside the buffer.
#[allow(dead_code)]
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct SeqEvent {
    kind: u8,
    flags: u8,
    tag: u8,
    queue: u8,
    time: [u32; 2],
    source: [u8; 2],
    dest: [u8; 2],
    note: SeqNote,
    reserved: [u8; 4],
}

const _: () = assert!(std::mem::size_of::<SeqEvent>() == 28);

const SEQ_EVENT_NOTEON: u8 = 6;
const SEQ_EVENT_NOTEOFF: u8 = 7;

impl SeqEvent {
    fn from_midi(event: &MidiEvent) -> Self {
        let (kind, key, velocity) = match event.kind {
            MidiEventKind::NoteOn { key, velocity } => (SEQ_EVENT_NOTEON, key, velocity),
            MidiEventKind::NoteOff { key } => (SEQ_EVENT_NOTEOFF, key, 0),
        };
        Self {
            kind,
            time: [event.frame, 0],
            note: SeqNote {
                channel: event.channel,
                note: key,
                velocity,
                ..SeqNote::default()
            },
            ..Self::default()
        }
    }
}

type SynthFn = unsafe extern "C" fn(*mut c_void, c_ulong, *mut SeqEvent, c_ulong);
type MultipleSynthsFn =
    unsafe extern "C" fn(c_ulong, *mut *mut c_void, c_ulong, *mut *mut SeqEvent, *mut c_ulong);

#[allow(dead_code)]
#[repr(C)]
struct RawDssiDescriptor {
    api_version: c_int,
    ladspa: *const RawLadspaDescriptor,
    configure: Option<unsafe extern "C" fn(*mut c_void, *const c_char, *const c_char) -> *mut c_char>,
    get_program: Option<unsafe extern "C" fn(*mut c_void, c_ulong) -> *const RawProgramDescriptor>,
    select_program: Option<unsafe extern "C" fn(*mut c_void, c_ulong, c_ulong)>,
    get_midi_controller_for_port: Option<unsafe extern "C" fn(*mut c_void, c_ulong) -> c_int>,
    run_synth: Option<SynthFn>,
    run_synth_adding: Option<SynthFn>,
    run_multiple_synths: Option<MultipleSynthsFn>,
    run_multiple_synths_adding: Option<MultipleSynthsFn>,
}

type DescriptorFn = unsafe extern "C" fn(c_ulong) -> *const RawDssiDescriptor;

fn descriptors(library: &Library, path: &Path) -> PluginResult<Vec<*const RawDssiDescriptor>> {
    // SAFETY: `dssi_descriptor` has this signature in every DSSI library.
    let entry = unsafe { library.get::<DescriptorFn>(b"dssi_descriptor") }.map_err(|_| {
        PluginError::SymbolMissing {
            path: path.to_path_buf(),
            symbol: "dssi_descriptor".to_string(),
        }
    })?;
    let mut found = Vec::new();
    for index in 0.. {
        // SAFETY: null past the last descriptor.
        let raw = unsafe { entry(index) };
        if raw.is_null() {
            break;
        }
        // SAFETY: non-null descriptors are valid.
        if unsafe { (*raw).ladspa.is_null() } {
            continue;
        }
        found.push(raw);
    }
    Ok(found)
}

/// # Safety
///
/// `raw` must come from [`descriptors`].
unsafe fn label(raw: *const RawDssiDescriptor) -> String {
    c_string((*(*raw).ladspa).label)
}

/// One synth or effect of a DSSI library, selected by its LADSPA label.
pub struct DssiPlugin {
    library: Arc<Library>,
    raw: *const RawDssiDescriptor,
    filename: String,
    effect: String,
    ports: Vec<PortDescriptor>,
}

// SAFETY: the descriptor is immutable static data of `library`.
unsafe impl Send for DssiPlugin {}
unsafe impl Sync for DssiPlugin {}

impl DssiPlugin {
    pub fn open(path: &Path, effect: &str) -> PluginResult<Self> {
        Self::from_library(open_library(path)?, path, effect)
    }

    pub fn from_library(library: Arc<Library>, path: &Path, effect: &str) -> PluginResult<Self> {
        let raw = descriptors(&library, path)?
            .into_iter()
            // SAFETY: pointers come straight from the descriptor table.
            .find(|raw| unsafe { label(*raw) } == effect)
            .ok_or_else(|| PluginError::DescriptorNotFound {
                filename: path.display().to_string(),
                effect: effect.to_string(),
            })?;
        // SAFETY: the wrapped LADSPA descriptor was checked to be non-null.
        let ports = unsafe { port_table(&*(*raw).ladspa) };
        Ok(Self {
            library,
            raw,
            filename: path.display().to_string(),
            effect: effect.to_string(),
            ports,
        })
    }

    pub fn labels(library: &Library, path: &Path) -> PluginResult<Vec<String>> {
        Ok(descriptors(library, path)?
            .into_iter()
            // SAFETY: pointers come straight from the descriptor table.
            .map(|raw| unsafe { label(raw) })
            .collect())
    }

    fn descriptor(&self) -> &RawDssiDescriptor {
        // SAFETY: valid while `library` is loaded.
        unsafe { &*self.raw }
    }

    fn new_handle(&self, samplerate: u32) -> PluginResult<DssiHandle> {
        let descriptor = self.descriptor();
        // SAFETY: the LADSPA descriptor belongs to `library`.
        let inner = unsafe { LadspaHandle::new(self.library.clone(), descriptor.ladspa, samplerate) }
            .ok_or_else(|| PluginError::InstantiationFailed {
                effect: self.effect.clone(),
                reason: "instantiate returned null".to_string(),
            })?;
        Ok(DssiHandle {
            inner,
            select_program: descriptor.select_program,
            run_synth: descriptor.run_synth,
            events: Vec::new(),
        })
    }
}

impl PluginDescriptor for DssiPlugin {
    fn format(&self) -> PluginFormat {
        PluginFormat::Dssi
    }

    fn kind(&self) -> PluginKind {
        let descriptor = self.descriptor();
        if descriptor.run_synth.is_some() || descriptor.run_multiple_synths.is_some() {
            PluginKind::Instrument
        } else {
            PluginKind::Effect
        }
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

    /// Programs are only reported by live instances, so a throwaway instance
    /// is created for the query.
    fn programs(&self) -> Vec<ProgramInfo> {
        let Some(get_program) = self.descriptor().get_program else {
            return Vec::new();
        };
        let mut handle = match self.new_handle(44100) {
            Ok(handle) => handle,
            Err(err) => {
                log::warn!(target: "audio::plugin", "{}", err);
                return Vec::new();
            }
        };

        let mut programs = Vec::new();
        for index in 0.. {
            // SAFETY: the instance is live; null ends the list.
            let program = unsafe { get_program(handle.inner.instance, index) };
            if program.is_null() {
                break;
            }
            // SAFETY: non-null entries stay valid until the next call.
            let info = unsafe {
                ProgramInfo {
                    bank: (*program).bank as u32,
                    program: (*program).program as u32,
                    name: c_string((*program).name),
                }
            };
            programs.push(info);
        }
        handle.cleanup();
        programs
    }

    fn instantiate(&self, samplerate: u32) -> PluginResult<Box<dyn PluginHandle>> {
        Ok(Box::new(self.new_handle(samplerate)?))
    }
}

/// A live DSSI instance: a LADSPA instance plus the synth entry points.
pub struct DssiHandle {
    inner: LadspaHandle,
    select_program: Option<unsafe extern "C" fn(*mut c_void, c_ulong, c_ulong)>,
    run_synth: Option<SynthFn>,
    events: Vec<SeqEvent>,
}

impl PluginHandle for DssiHandle {
    unsafe fn connect_port(&mut self, index: usize, data: *mut f32) {
        self.inner.connect_port(index, data);
    }

    fn activate(&mut self) {
        self.inner.activate();
    }

    fn run(&mut self, frames: usize) {
        self.run_synth(frames, &[]);
    }

    fn run_synth(&mut self, frames: usize, events: &[MidiEvent]) {
        let Some(run_synth) = self.run_synth else {
            self.inner.run(frames);
            return;
        };
        self.events.clear();
        self.events.extend(events.iter().map(SeqEvent::from_midi));
        // SAFETY: the adapter bound every port; `events` outlives the call.
        unsafe {
            run_synth(
                self.inner.instance,
                frames as c_ulong,
                self.events.as_mut_ptr(),
                self.events.len() as c_ulong,
            )
        };
    }

    fn select_program(&mut self, bank: u32, program: u32) {
        if let Some(select) = self.select_program {
            // SAFETY: the instance is live until cleanup.
            unsafe { select(self.inner.instance, bank as c_ulong, program as c_ulong) };
        }
    }

    fn deactivate(&mut self) {
        self.inner.deactivate();
    }

    fn cleanup(&mut self) {
        self.inner.cleanup();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn note_events_map_to_sequencer_events() {
        let on = SeqEvent::from_midi(&MidiEvent::note_on(12, 60, 100));
        assert_eq!(on.kind, SEQ_EVENT_NOTEON);
        assert_eq!(on.time[0], 12);
        assert_eq!((on.note.note, on.note.velocity), (60, 100));

        let off = SeqEvent::from_midi(&MidiEvent::note_off(0, 60));
        assert_eq!(off.kind, SEQ_EVENT_NOTEOFF);
        assert_eq!(off.note.velocity, 0);
    }
}
