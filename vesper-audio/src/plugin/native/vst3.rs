//! VST3 modules: bundle layout and the factory's class list.
//!
//! Only discovery lives here. Running a VST3 processor needs a host context;
//! such descriptors are injected into the registry instead.

use std::ffi::{c_char, c_void};
use std::path::{Path, PathBuf};

use libloading::{Library, Symbol};
use ::vst3::ComPtr;
use ::vst3::Steinberg::{kResultOk, IPluginFactory, IPluginFactoryTrait, PClassInfo};

use crate::plugin::{PluginError, PluginResult};

/// Category prefix of the classes that process audio.
const AUDIO_MODULE_CLASS: &str = "Audio Module Class";

/// Whether `path` names a `.vst3` bundle or module file.
pub fn is_bundle(path: &Path) -> bool {
    path.extension().map(|ext| ext == "vst3").unwrap_or(false)
}

/// The loadable binary inside a `.vst3` bundle. A bundle that is a plain
/// file is its own binary.
///
/// Layouts:
/// - macOS: `Contents/MacOS/<name>`
/// - Linux: `Contents/x86_64-linux/<name>.so` or `Contents/aarch64-linux/`
/// - Windows: `Contents/x86_64-win/<name>.vst3` or `Contents/arm64-win/`
pub fn bundle_binary(bundle: &Path) -> PluginResult<PathBuf> {
    if bundle.is_file() {
        return Ok(bundle.to_path_buf());
    }
    let contents = bundle.join("Contents");

    #[cfg(target_os = "macos")]
    {
        let dir = contents.join("MacOS");
        if let Some(stem) = bundle.file_stem() {
            let named = dir.join(stem);
            if named.is_file() {
                return Ok(named);
            }
        }
        if let Some(binary) = first_file(&dir, None) {
            return Ok(binary);
        }
    }

    #[cfg(target_os = "windows")]
    for arch in ["x86_64-win", "arm64-win"] {
        if let Some(binary) = first_file(&contents.join(arch), Some("vst3")) {
            return Ok(binary);
        }
    }

    #[cfg(not(any(target_os = "macos", target_os = "windows")))]
    for arch in ["x86_64-linux", "aarch64-linux"] {
        if let Some(binary) = first_file(&contents.join(arch), Some("so")) {
            return Ok(binary);
        }
    }

    Err(PluginError::LibraryLoad {
        path: bundle.to_path_buf(),
        reason: "no binary for this platform in the bundle".to_string(),
    })
}

/// First file in `dir` by name, optionally with `extension`.
fn first_file(dir: &Path, extension: Option<&str>) -> Option<PathBuf> {
    std::fs::read_dir(dir)
        .ok()?
        .flatten()
        .map(|entry| entry.path())
        .filter(|path| path.is_file())
        .filter(|path| match extension {
            Some(wanted) => path.extension().map(|ext| ext == wanted).unwrap_or(false),
            None => true,
        })
        .min()
}

/// Names of the audio processor classes exported by the module in `library`,
/// loaded from `bundle`.
///
/// macOS modules expect a `CFBundle` in `bundleEntry` before the factory may
/// be queried; there the bundle name stands in for its single class.
pub fn audio_classes(library: &Library, bundle: &Path) -> PluginResult<Vec<String>> {
    #[cfg(target_os = "macos")]
    {
        let _ = library;
        Ok(bundle
            .file_stem()
            .map(|stem| vec![stem.to_string_lossy().into_owned()])
            .unwrap_or_default())
    }

    #[cfg(not(target_os = "macos"))]
    {
        module_entry(library);
        let classes = factory_classes(library, bundle);
        module_exit(library);
        classes
    }
}

#[cfg(not(target_os = "macos"))]
fn factory_classes(library: &Library, bundle: &Path) -> PluginResult<Vec<String>> {
    type GetFactoryFn = unsafe extern "system" fn() -> *mut c_void;
    // SAFETY: `GetPluginFactory` has this signature in every VST3 module.
    let get_factory: Symbol<GetFactoryFn> =
        unsafe { library.get(b"GetPluginFactory\0") }.map_err(|_| PluginError::SymbolMissing {
            path: bundle.to_path_buf(),
            symbol: "GetPluginFactory".to_string(),
        })?;

    // SAFETY: the symbol was resolved from a loaded module.
    let raw = unsafe { get_factory() };
    // SAFETY: a non-null factory pointer is an owned `IPluginFactory` reference.
    let factory = unsafe { ComPtr::from_raw(raw as *mut IPluginFactory) }.ok_or_else(|| {
        PluginError::InstantiationFailed {
            effect: bundle.display().to_string(),
            reason: "GetPluginFactory returned null".to_string(),
        }
    })?;

    // SAFETY: plain factory queries on a live factory.
    let count = unsafe { factory.countClasses() };
    let mut classes = Vec::new();
    for index in 0..count {
        // SAFETY: `PClassInfo` is plain data; zeroed is a valid empty value.
        let mut info: PClassInfo = unsafe { std::mem::zeroed() };
        // SAFETY: `info` outlives the call.
        if unsafe { factory.getClassInfo(index, &mut info) } != kResultOk {
            continue;
        }
        if char8_string(&info.category).starts_with(AUDIO_MODULE_CLASS) {
            classes.push(char8_string(&info.name));
        }
    }
    log::debug!(
        target: "audio::plugin",
        "{}: {} classes, {} audio",
        bundle.display(),
        count,
        classes.len()
    );
    Ok(classes)
}

#[cfg(target_os = "linux")]
fn module_entry(library: &Library) {
    type ModuleEntryFn = unsafe extern "C" fn(handle: *mut c_void) -> bool;
    // SAFETY: optional entry point with this signature; the handle is unused
    // by the modules that export it.
    if let Ok(entry) = unsafe { library.get::<ModuleEntryFn>(b"ModuleEntry\0") } {
        unsafe { entry(std::ptr::null_mut()) };
    }
}

#[cfg(target_os = "linux")]
fn module_exit(library: &Library) {
    type ModuleExitFn = unsafe extern "C" fn() -> bool;
    // SAFETY: optional exit point paired with `ModuleEntry`.
    if let Ok(exit) = unsafe { library.get::<ModuleExitFn>(b"ModuleExit\0") } {
        unsafe { exit() };
    }
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
fn module_entry(_library: &Library) {}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
fn module_exit(_library: &Library) {}

/// A NUL-terminated `char8` array as a string.
fn char8_string(chars: &[c_char]) -> String {
    let len = chars.iter().position(|&c| c == 0).unwrap_or(chars.len());
    let bytes: Vec<u8> = chars[..len].iter().map(|&c| c as u8).collect();
    String::from_utf8_lossy(&bytes).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn char8_strings_stop_at_nul() {
        let mut raw = [0 as c_char; 8];
        for (slot, byte) in raw.iter_mut().zip(b"Gain") {
            *slot = *byte as c_char;
        }
        assert_eq!(char8_string(&raw), "Gain");
        assert_eq!(char8_string(&[b'a' as c_char, b'b' as c_char]), "ab");
    }

    #[test]
    fn plain_module_files_are_their_own_binary() {
        let dir = tempfile::tempdir().unwrap();
        let module = dir.path().join("Gain.vst3");
        std::fs::write(&module, b"").unwrap();

        assert!(is_bundle(&module));
        assert!(!is_bundle(&dir.path().join("gain.so")));
        assert_eq!(bundle_binary(&module).unwrap(), module);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn linux_bundles_resolve_to_their_shared_object() {
        let dir = tempfile::tempdir().unwrap();
        let arch = dir.path().join("Synth.vst3/Contents/aarch64-linux");
        std::fs::create_dir_all(&arch).unwrap();
        std::fs::write(arch.join("notes.txt"), b"").unwrap();
        std::fs::write(arch.join("Synth.so"), b"").unwrap();

        let bundle = dir.path().join("Synth.vst3");
        assert_eq!(bundle_binary(&bundle).unwrap(), arch.join("Synth.so"));
        assert!(matches!(
            bundle_binary(&dir.path().join("Empty.vst3")),
            Err(PluginError::LibraryLoad { .. })
        ));
    }
}
