//! Loaders for plugins that live in shared libraries.
//!
//! Both LADSPA and DSSI expose a C descriptor table through an indexed entry
//! point; the library is kept alive by every descriptor and handle created
//! from it. VST3 modules are only opened to list their classes.

mod dssi;
mod ladspa;
pub mod vst3;

pub use dssi::{DssiHandle, DssiPlugin};
pub use ladspa::{LadspaHandle, LadspaPlugin};

use std::ffi::{c_char, c_int, CStr};
use std::path::Path;
use std::sync::Arc;

use libloading::Library;
use vesper_types::PortHints;

use super::{PluginError, PluginResult};

/// Open a plugin library.
pub fn open_library(path: &Path) -> PluginResult<Arc<Library>> {
    // SAFETY: loading runs the library's initializers; plugin libraries are
    // trusted the same way the host trusts any plugin code it runs.
    let library = unsafe { Library::new(path) }.map_err(|err| PluginError::LibraryLoad {
        path: path.to_path_buf(),
        reason: err.to_string(),
    })?;
    Ok(Arc::new(library))
}

/// Copy a C string owned by the plugin. Null reads as empty.
///
/// # Safety
///
/// `ptr` must be null or point to a NUL-terminated string.
pub(crate) unsafe fn c_string(ptr: *const c_char) -> String {
    if ptr.is_null() {
        return String::new();
    }
    CStr::from_ptr(ptr).to_string_lossy().into_owned()
}

const PORT_INPUT: c_int = 0x1;
const PORT_OUTPUT: c_int = 0x2;
const PORT_CONTROL: c_int = 0x4;
const PORT_AUDIO: c_int = 0x8;

const HINT_MASK: c_int = 0x3F;
const DEFAULT_MASK: c_int = 0x3C0;
const DEFAULT_MINIMUM: c_int = 0x40;
const DEFAULT_LOW: c_int = 0x80;
const DEFAULT_MIDDLE: c_int = 0xC0;
const DEFAULT_HIGH: c_int = 0x100;
const DEFAULT_MAXIMUM: c_int = 0x140;
const DEFAULT_0: c_int = 0x200;
const DEFAULT_1: c_int = 0x240;
const DEFAULT_100: c_int = 0x280;
const DEFAULT_440: c_int = 0x2C0;

/// The range hint bits of a native hint descriptor.
fn port_hints(hint: c_int) -> PortHints {
    PortHints::from_bits((hint & HINT_MASK) as u32)
}

/// Default value encoded in a native hint descriptor.
///
/// Bounds are given in plugin units. `LOW`, `MIDDLE` and `HIGH` interpolate
/// between them, geometrically for logarithmic ports with positive bounds.
fn hint_default(hint: c_int, lower: f32, upper: f32) -> f32 {
    let logarithmic =
        port_hints(hint).contains(PortHints::LOGARITHMIC) && lower > 0.0 && upper > 0.0;
    let mix = |weight: f32| {
        if logarithmic {
            (lower.ln() * (1.0 - weight) + upper.ln() * weight).exp()
        } else {
            lower * (1.0 - weight) + upper * weight
        }
    };

    match hint & DEFAULT_MASK {
        DEFAULT_MINIMUM => lower,
        DEFAULT_LOW => mix(0.25),
        DEFAULT_MIDDLE => mix(0.5),
        DEFAULT_HIGH => mix(0.75),
        DEFAULT_MAXIMUM => upper,
        DEFAULT_0 => 0.0,
        DEFAULT_1 => 1.0,
        DEFAULT_100 => 100.0,
        DEFAULT_440 => 440.0,
        _ => {
            let hints = port_hints(hint);
            let mut value = 0.0f32;
            if hints.contains(PortHints::BOUNDED_BELOW) {
                value = value.max(lower);
            }
            if hints.contains(PortHints::BOUNDED_ABOVE) {
                value = value.min(upper);
            }
            value
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_follow_the_hint_descriptor() {
        assert_eq!(hint_default(DEFAULT_MINIMUM, 2.0, 10.0), 2.0);
        assert_eq!(hint_default(DEFAULT_MIDDLE, 2.0, 10.0), 6.0);
        assert_eq!(hint_default(DEFAULT_HIGH, 0.0, 4.0), 3.0);
        assert_eq!(hint_default(DEFAULT_440, 0.0, 1.0), 440.0);
    }

    #[test]
    fn logarithmic_defaults_interpolate_geometrically() {
        let hint = DEFAULT_MIDDLE | 0x10;
        let value = hint_default(hint, 1.0, 100.0);
        assert!((value - 10.0).abs() < 1e-3);

        // Non-positive bounds fall back to linear.
        assert_eq!(hint_default(hint, 0.0, 100.0), 50.0);
    }

    #[test]
    fn missing_default_stays_in_bounds() {
        assert_eq!(hint_default(0x1, 3.0, 8.0), 3.0);
        assert_eq!(hint_default(0x2, -8.0, -3.0), -3.0);
        assert_eq!(hint_default(0, 3.0, 8.0), 0.0);
    }

    #[test]
    fn open_reports_missing_libraries() {
        let err = open_library(Path::new("/nonexistent/vesper-missing.so")).unwrap_err();
        assert!(matches!(err, PluginError::LibraryLoad { .. }));
    }
}
