//! Plugin search directories.
//!
//! Order: directories from the config, then the format's environment
//! variable, then the user directory, then the system directories.

use std::path::{Path, PathBuf};

use vesper_audio::plugin::native::vst3;
use vesper_types::PluginFormat;

use crate::config::EngineConfig;

pub fn ladspa_search_paths(extra: &[PathBuf]) -> Vec<PathBuf> {
    unix_search_paths(extra, "LADSPA_PATH", ".ladspa", "ladspa")
}

pub fn dssi_search_paths(extra: &[PathBuf]) -> Vec<PathBuf> {
    unix_search_paths(extra, "DSSI_PATH", ".dssi", "dssi")
}

/// Platform VST3 directories, after `extra`.
pub fn vst3_search_paths(extra: &[PathBuf]) -> Vec<PathBuf> {
    let mut paths = extra.to_vec();

    #[cfg(target_os = "macos")]
    {
        if let Some(home) = dirs::home_dir() {
            paths.push(home.join("Library/Audio/Plug-Ins/VST3"));
        }
        paths.push(PathBuf::from("/Library/Audio/Plug-Ins/VST3"));
    }

    #[cfg(target_os = "windows")]
    {
        if let Some(common) = std::env::var_os("CommonProgramFiles") {
            paths.push(PathBuf::from(common).join("VST3"));
        }
    }

    #[cfg(not(any(target_os = "macos", target_os = "windows")))]
    {
        if let Some(home) = dirs::home_dir() {
            paths.push(home.join(".vst3"));
        }
        paths.push(PathBuf::from("/usr/lib/vst3"));
        paths.push(PathBuf::from("/usr/local/lib/vst3"));
    }

    dedup(paths)
}

/// Search directories for `format` as configured.
pub fn search_paths(config: &EngineConfig, format: PluginFormat) -> Vec<PathBuf> {
    match format {
        PluginFormat::Ladspa => ladspa_search_paths(config.ladspa_path()),
        PluginFormat::Dssi => dssi_search_paths(config.dssi_path()),
        PluginFormat::Vst3 => vst3_search_paths(config.vst3_path()),
    }
}

/// Locate `filename` in `dirs`. Absolute paths are taken as they are.
pub fn find_plugin_file(dirs: &[PathBuf], filename: &str) -> Option<PathBuf> {
    let direct = Path::new(filename);
    if direct.is_absolute() {
        return direct.is_file().then(|| direct.to_path_buf());
    }
    dirs.iter()
        .map(|dir| dir.join(filename))
        .find(|candidate| candidate.is_file())
}

/// Shared libraries directly inside `dir`, sorted by name.
pub fn shared_libraries(dir: &Path) -> Vec<PathBuf> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut found: Vec<PathBuf> = entries
        .flatten()
        .map(|entry| entry.path())
        .filter(|path| path.is_file())
        .filter(|path| {
            path.extension()
                .map(|ext| ext == std::env::consts::DLL_EXTENSION)
                .unwrap_or(false)
        })
        .collect();
    found.sort();
    found
}

/// VST3 bundles directly inside `dir`, sorted by name. Bundles are
/// directories on most hosts but single module files are accepted too.
pub fn vst3_bundles(dir: &Path) -> Vec<PathBuf> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut found: Vec<PathBuf> = entries
        .flatten()
        .map(|entry| entry.path())
        .filter(|path| vst3::is_bundle(path))
        .collect();
    found.sort();
    found
}

fn unix_search_paths(extra: &[PathBuf], env: &str, user_dir: &str, lib_dir: &str) -> Vec<PathBuf> {
    let mut paths = extra.to_vec();
    if let Some(value) = std::env::var_os(env) {
        paths.extend(std::env::split_paths(&value).filter(|p| !p.as_os_str().is_empty()));
    }
    if let Some(home) = dirs::home_dir() {
        paths.push(home.join(user_dir));
    }
    paths.push(PathBuf::from("/usr/lib").join(lib_dir));
    paths.push(PathBuf::from("/usr/local/lib").join(lib_dir));
    dedup(paths)
}

fn dedup(paths: Vec<PathBuf>) -> Vec<PathBuf> {
    let mut out: Vec<PathBuf> = Vec::with_capacity(paths.len());
    for path in paths {
        if !out.contains(&path) {
            out.push(path);
        }
    }
    out
}
