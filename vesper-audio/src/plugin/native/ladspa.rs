use std::ffi::{c_char, c_int, c_ulong, c_void};
use std::path::Path;
use std::sync::Arc;

use libloading::Library;
use vesper_types::{PluginFormat, PluginKind, PortDescriptor, PortDirection, PortKind};

use super::{
    c_string, hint_default, open_library, port_hints, PORT_AUDIO, PORT_CONTROL, PORT_INPUT,
    PORT_OUTPUT,
};
use crate::plugin::{PluginDescriptor, PluginError, PluginHandle, PluginResult};

#[repr(C)]
pub(crate) struct RawRangeHint {
    pub hint_descriptor: c_int,
    pub lower_bound: f32,
    pub upper_bound: f32,
}

#[allow(dead_code)]
#[repr(C)]
pub(crate) struct RawLadspaDescriptor {
    pub unique_id: c_ulong,
    pub label: *const c_char,
    pub properties: c_int,
    pub name: *const c_char,
    pub maker: *const c_char,
    pub copyright: *const c_char,
    pub port_count: c_ulong,
    pub port_descriptors: *const c_int,
    pub port_names: *const *const c_char,
    pub port_range_hints: *const RawRangeHint,
    pub implementation_data: *mut c_void,
    pub instantiate: Option<unsafe extern "C" fn(*const RawLadspaDescriptor, c_ulong) -> *mut c_void>,
    pub connect_port: Option<unsafe extern "C" fn(*mut c_void, c_ulong, *mut f32)>,
    pub activate: Option<unsafe extern "C" fn(*mut c_void)>,
    pub run: Option<unsafe extern "C" fn(*mut c_void, c_ulong)>,
    pub run_adding: Option<unsafe extern "C" fn(*mut c_void, c_ulong)>,
    pub set_run_adding_gain: Option<unsafe extern "C" fn(*mut c_void, f32)>,
    pub deactivate: Option<unsafe extern "C" fn(*mut c_void)>,
    pub cleanup: Option<unsafe extern "C" fn(*mut c_void)>,
}

type DescriptorFn = unsafe extern "C" fn(c_ulong) -> *const RawLadspaDescriptor;

const ENTRY_POINT: &[u8] = b"ladspa_descriptor";

/// Walk the descriptor table of `library`.
fn descriptors(library: &Library, path: &Path) -> PluginResult<Vec<*const RawLadspaDescriptor>> {
    // SAFETY: `ladspa_descriptor` has this signature in every LADSPA library.
    let entry = unsafe { library.get::<DescriptorFn>(ENTRY_POINT) }.map_err(|_| {
        PluginError::SymbolMissing {
            path: path.to_path_buf(),
            symbol: "ladspa_descriptor".to_string(),
        }
    })?;
    let mut found = Vec::new();
    for index in 0.. {
        // SAFETY: the entry point returns null past the last descriptor.
        let raw = unsafe { entry(index) };
        if raw.is_null() {
            break;
        }
        found.push(raw);
    }
    Ok(found)
}

/// Build the port table of a native descriptor.
///
/// # Safety
///
/// `raw` must point to a valid descriptor whose arrays hold `port_count`
/// entries.
pub(crate) unsafe fn port_table(raw: &RawLadspaDescriptor) -> Vec<PortDescriptor> {
    let count = raw.port_count as usize;
    if count == 0 || raw.port_descriptors.is_null() {
        return Vec::new();
    }
    let kinds = std::slice::from_raw_parts(raw.port_descriptors, count);
    let names = if raw.port_names.is_null() {
        None
    } else {
        Some(std::slice::from_raw_parts(raw.port_names, count))
    };
    let hints = if raw.port_range_hints.is_null() {
        None
    } else {
        Some(std::slice::from_raw_parts(raw.port_range_hints, count))
    };

    let mut table = Vec::with_capacity(count);
    for (index, &bits) in kinds.iter().enumerate() {
        let kind = if bits & PORT_CONTROL != 0 {
            PortKind::Control
        } else if bits & PORT_AUDIO != 0 {
            PortKind::Audio
        } else {
            log::warn!(target: "audio::plugin", "port {} has no kind bits ({:#x})", index, bits);
            continue;
        };
        let direction = if bits & PORT_OUTPUT != 0 && bits & PORT_INPUT == 0 {
            PortDirection::Output
        } else {
            PortDirection::Input
        };
        let name = names
            .map(|names| c_string(names[index]))
            .unwrap_or_else(|| format!("port {}", index));
        let (hint, lower, upper) = hints
            .map(|h| (h[index].hint_descriptor, h[index].lower_bound, h[index].upper_bound))
            .unwrap_or((0, 0.0, 0.0));

        table.push(PortDescriptor {
            index,
            name,
            direction,
            kind,
            hints: port_hints(hint),
            lower,
            upper,
            default: if kind == PortKind::Control {
                hint_default(hint, lower, upper)
            } else {
                0.0
            },
        });
    }
    table
}

/// One effect of a LADSPA library, selected by its label.
pub struct LadspaPlugin {
    library: Arc<Library>,
    raw: *const RawLadspaDescriptor,
    filename: String,
    effect: String,
    name: String,
    ports: Vec<PortDescriptor>,
}

// SAFETY: the descriptor is immutable static data of `library`, which this
// value keeps loaded.
unsafe impl Send for LadspaPlugin {}
unsafe impl Sync for LadspaPlugin {}

impl LadspaPlugin {
    pub fn open(path: &Path, effect: &str) -> PluginResult<Self> {
        Self::from_library(open_library(path)?, path, effect)
    }

    /// Look up `effect` by label in an already opened library.
    pub fn from_library(library: Arc<Library>, path: &Path, effect: &str) -> PluginResult<Self> {
        let raw = descriptors(&library, path)?
            .into_iter()
            // SAFETY: pointers come straight from the descriptor table.
            .find(|raw| unsafe { c_string((**raw).label) } == effect)
            .ok_or_else(|| PluginError::DescriptorNotFound {
                filename: path.display().to_string(),
                effect: effect.to_string(),
            })?;
        // SAFETY: as above; the table outlives `library`'s handle.
        let (name, ports) = unsafe { (c_string((*raw).name), port_table(&*raw)) };
        Ok(Self {
            library,
            raw,
            filename: path.display().to_string(),
            effect: effect.to_string(),
            name,
            ports,
        })
    }

    /// Labels of every effect in the library.
    pub fn labels(library: &Library, path: &Path) -> PluginResult<Vec<String>> {
        Ok(descriptors(library, path)?
            .into_iter()
            // SAFETY: pointers come straight from the descriptor table.
            .map(|raw| unsafe { c_string((*raw).label) })
            .collect())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn unique_id(&self) -> u64 {
        // SAFETY: `raw` is valid while `library` is loaded.
        unsafe { (*self.raw).unique_id as u64 }
    }
}

impl PluginDescriptor for LadspaPlugin {
    fn format(&self) -> PluginFormat {
        PluginFormat::Ladspa
    }

    fn kind(&self) -> PluginKind {
        PluginKind::Effect
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

    fn instantiate(&self, samplerate: u32) -> PluginResult<Box<dyn PluginHandle>> {
        // SAFETY: `raw` is valid while `library` is loaded.
        let handle = unsafe { LadspaHandle::new(self.library.clone(), self.raw, samplerate) }
            .ok_or_else(|| PluginError::InstantiationFailed {
                effect: self.effect.clone(),
                reason: "instantiate returned null".to_string(),
            })?;
        Ok(Box::new(handle))
    }
}

/// A live LADSPA instance.
pub struct LadspaHandle {
    _library: Arc<Library>,
    raw: *const RawLadspaDescriptor,
    pub(crate) instance: *mut c_void,
    cleaned_up: bool,
}

// SAFETY: LADSPA instances may move between threads; the adapter serializes
// every call on one instance.
unsafe impl Send for LadspaHandle {}

impl LadspaHandle {
    /// # Safety
    ///
    /// `raw` must be a descriptor of `library`.
    pub(crate) unsafe fn new(
        library: Arc<Library>,
        raw: *const RawLadspaDescriptor,
        samplerate: u32,
    ) -> Option<Self> {
        let instantiate = (*raw).instantiate?;
        let instance = instantiate(raw, samplerate as c_ulong);
        if instance.is_null() {
            return None;
        }
        Some(Self {
            _library: library,
            raw,
            instance,
            cleaned_up: false,
        })
    }

    fn descriptor(&self) -> &RawLadspaDescriptor {
        // SAFETY: `raw` is valid while `_library` is loaded.
        unsafe { &*self.raw }
    }
}

impl PluginHandle for LadspaHandle {
    unsafe fn connect_port(&mut self, index: usize, data: *mut f32) {
        if let Some(connect) = self.descriptor().connect_port {
            connect(self.instance, index as c_ulong, data);
        }
    }

    fn activate(&mut self) {
        if let Some(activate) = self.descriptor().activate {
            // SAFETY: `instance` is live until cleanup.
            unsafe { activate(self.instance) };
        }
    }

    fn run(&mut self, frames: usize) {
        if let Some(run) = self.descriptor().run {
            // SAFETY: the adapter bound every port before running.
            unsafe { run(self.instance, frames as c_ulong) };
        }
    }

    fn deactivate(&mut self) {
        if let Some(deactivate) = self.descriptor().deactivate {
            // SAFETY: `instance` is live until cleanup.
            unsafe { deactivate(self.instance) };
        }
    }

    fn cleanup(&mut self) {
        if self.cleaned_up {
            return;
        }
        self.cleaned_up = true;
        if let Some(cleanup) = self.descriptor().cleanup {
            // SAFETY: called once; `instance` is not used afterwards.
            unsafe { cleanup(self.instance) };
        }
        self.instance = std::ptr::null_mut();
    }
}

impl Drop for LadspaHandle {
    fn drop(&mut self) {
        self.cleanup();
    }
}
