//! # vesper-types
//!
//! Plain data shared by the recall engine and the services around it:
//! identifiers, sound scopes, sample formats, notes, plugin port tables and
//! staging programs. Nothing in here locks or spawns.

mod format;
mod note;
mod plugin;
mod port;
mod scope;
mod staging;

pub use format::SoundcardFormat;
pub use note::Note;
pub use plugin::{MidiEvent, MidiEventKind, PluginFormat, PluginKind, ProgramInfo};
pub use port::{PortDescriptor, PortDirection, PortHints, PortKind};
pub use scope::{ScopeSelection, SoundScope};
pub use staging::{StagingProgram, StagingStage};

macro_rules! id_newtype {
    ($(#[$meta:meta])* $name:ident($inner:ty)) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name($inner);

        impl $name {
            pub fn new(id: $inner) -> Self {
                Self(id)
            }
            pub fn get(self) -> $inner {
                self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

id_newtype!(
    /// Identifier of one AudioSignal (template or voice instance).
    SignalId(u64)
);
id_newtype!(
    /// Identifier of a Recycling node.
    RecyclingId(u64)
);
id_newtype!(
    /// Identifier of a RecyclingContext.
    ContextId(u64)
);
id_newtype!(
    /// Identifier of a Recall, stable across its lifetime.
    RecallKey(u64)
);
id_newtype!(
    /// Identifier of a channel in the external topology.
    ChannelId(u32)
);
id_newtype!(
    /// Identifier of an audio (machine) in the external topology.
    AudioId(u32)
);
