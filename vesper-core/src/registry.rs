//! Resolves plugin descriptors from shared libraries on the search path.
//!
//! Libraries are opened once and shared by every descriptor taken from
//! them. VST3 bundles on the VST3 path are discovered by asking their
//! factories for audio classes, but VST3 descriptors are only available
//! when injected with [`NativePluginRegistry::insert`].

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use libloading::Library;
use vesper_audio::plugin::native::{open_library, vst3, DssiPlugin, LadspaPlugin};
use vesper_audio::plugin::{PluginDescriptor, PluginError, PluginRegistry, PluginResult};
use vesper_types::PluginFormat;

use crate::config::EngineConfig;
use crate::paths;

/// One effect found while scanning the search path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredPlugin {
    pub format: PluginFormat,
    pub path: PathBuf,
    pub effect: String,
}

type DescriptorKey = (PluginFormat, String, String);

pub struct NativePluginRegistry {
    ladspa_path: Vec<PathBuf>,
    dssi_path: Vec<PathBuf>,
    vst3_path: Vec<PathBuf>,
    libraries: Mutex<HashMap<PathBuf, Arc<Library>>>,
    descriptors: Mutex<HashMap<DescriptorKey, Arc<dyn PluginDescriptor>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl NativePluginRegistry {
    pub fn new(ladspa_path: Vec<PathBuf>, dssi_path: Vec<PathBuf>, vst3_path: Vec<PathBuf>) -> Self {
        Self {
            ladspa_path,
            dssi_path,
            vst3_path,
            libraries: Mutex::new(HashMap::new()),
            descriptors: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(
            paths::search_paths(config, PluginFormat::Ladspa),
            paths::search_paths(config, PluginFormat::Dssi),
            paths::search_paths(config, PluginFormat::Vst3),
        )
    }

    pub fn search_path(&self, format: PluginFormat) -> &[PathBuf] {
        match format {
            PluginFormat::Ladspa => &self.ladspa_path,
            PluginFormat::Dssi => &self.dssi_path,
            PluginFormat::Vst3 => &self.vst3_path,
        }
    }

    /// Serve `descriptor` for its `(format, filename, effect)` from now on.
    pub fn insert(&self, descriptor: Arc<dyn PluginDescriptor>) {
        let key = (
            descriptor.format(),
            descriptor.filename().to_string(),
            descriptor.effect().to_string(),
        );
        lock(&self.descriptors).insert(key, descriptor);
    }

    pub fn cached_descriptors(&self) -> usize {
        lock(&self.descriptors).len()
    }

    pub fn open_libraries(&self) -> usize {
        lock(&self.libraries).len()
    }

    fn library(&self, path: &Path) -> PluginResult<Arc<Library>> {
        if let Some(library) = lock(&self.libraries).get(path) {
            return Ok(library.clone());
        }
        let library = open_library(path)?;
        log::debug!(target: "core::registry", "opened {}", path.display());
        let mut libraries = lock(&self.libraries);
        Ok(libraries
            .entry(path.to_path_buf())
            .or_insert(library)
            .clone())
    }

    fn locate(&self, format: PluginFormat, filename: &str) -> PluginResult<PathBuf> {
        paths::find_plugin_file(self.search_path(format), filename).ok_or_else(|| {
            PluginError::LibraryLoad {
                path: PathBuf::from(filename),
                reason: format!("not found in the {} search path", format),
            }
        })
    }

    /// Effects exported by the library or VST3 bundle at `path`.
    fn effects_in(&self, format: PluginFormat, path: &Path) -> PluginResult<Vec<String>> {
        match format {
            PluginFormat::Ladspa => LadspaPlugin::labels(&*self.library(path)?, path),
            PluginFormat::Dssi => DssiPlugin::labels(&*self.library(path)?, path),
            PluginFormat::Vst3 => {
                let binary = vst3::bundle_binary(path)?;
                vst3::audio_classes(&*self.library(&binary)?, path)
            }
        }
    }

    /// Every effect of `format` on the search path. Unloadable libraries and
    /// bundles are logged and skipped.
    pub fn discover(&self, format: PluginFormat) -> Vec<DiscoveredPlugin> {
        let mut found = Vec::new();
        for dir in self.search_path(format) {
            let candidates = match format {
                PluginFormat::Vst3 => paths::vst3_bundles(dir),
                PluginFormat::Ladspa | PluginFormat::Dssi => paths::shared_libraries(dir),
            };
            for path in candidates {
                match self.effects_in(format, &path) {
                    Ok(labels) => found.extend(labels.into_iter().map(|effect| DiscoveredPlugin {
                        format,
                        path: path.clone(),
                        effect,
                    })),
                    Err(e) => log::debug!(target: "core::registry", "skipping {}: {}", path.display(), e),
                }
            }
        }
        log::info!(target: "core::registry", "found {} {} effects", found.len(), format);
        found
    }
}

impl PluginRegistry for NativePluginRegistry {
    fn resolve(
        &self,
        format: PluginFormat,
        filename: &str,
        effect: &str,
    ) -> PluginResult<Arc<dyn PluginDescriptor>> {
        let key = (format, filename.to_string(), effect.to_string());
        if let Some(descriptor) = lock(&self.descriptors).get(&key) {
            return Ok(descriptor.clone());
        }

        let descriptor: Arc<dyn PluginDescriptor> = match format {
            PluginFormat::Ladspa => {
                let path = self.locate(format, filename)?;
                let library = self.library(&path)?;
                Arc::new(LadspaPlugin::from_library(library, &path, effect)?)
            }
            PluginFormat::Dssi => {
                let path = self.locate(format, filename)?;
                let library = self.library(&path)?;
                Arc::new(DssiPlugin::from_library(library, &path, effect)?)
            }
            PluginFormat::Vst3 => {
                return Err(PluginError::Unsupported {
                    format: format.to_string(),
                    reason: format!(
                        "{} in {} can be discovered but needs a registered descriptor to run",
                        effect, filename
                    ),
                })
            }
        };

        log::debug!(target: "core::registry", "resolved {} {} from {}", format, effect, filename);
        lock(&self.descriptors).insert(key, descriptor.clone());
        Ok(descriptor)
    }
}
