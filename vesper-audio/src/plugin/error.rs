//! Errors raised while resolving, loading and instantiating native plugins.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PluginError {
    #[error("failed to load plugin library '{path}': {reason}")]
    LibraryLoad { path: PathBuf, reason: String },

    #[error("symbol '{symbol}' missing from '{path}'")]
    SymbolMissing { path: PathBuf, symbol: String },

    #[error("effect '{effect}' not found in '{filename}'")]
    DescriptorNotFound { filename: String, effect: String },

    /// Instruments cannot be hosted by the audio effect path.
    #[error("'{effect}' is an instrument and cannot run as an effect")]
    InstrumentNotAllowed { effect: String },

    #[error("'{effect}' is an effect and cannot run as an instrument")]
    EffectNotAllowed { effect: String },

    #[error("failed to instantiate '{effect}': {reason}")]
    InstantiationFailed { effect: String, reason: String },

    #[error("plugin '{effect}' is not loaded")]
    NotLoaded { effect: String },

    #[error("{format} plugins are not supported: {reason}")]
    Unsupported { format: String, reason: String },
}

pub type PluginResult<T> = Result<T, PluginError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_names_the_effect() {
        let err = PluginError::DescriptorNotFound {
            filename: "/usr/lib/ladspa/amp.so".to_string(),
            effect: "amp_mono".to_string(),
        };
        assert!(err.to_string().contains("amp_mono"));
        assert!(err.to_string().contains("amp.so"));

        let err = PluginError::LibraryLoad {
            path: PathBuf::from("/nope.so"),
            reason: "no such file".to_string(),
        };
        assert!(err.to_string().contains("/nope.so"));
    }
}
