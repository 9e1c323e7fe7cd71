//! Recall execution engine.
//!
//! Buffered audio signals live in a tree of recyclings, recalls are staged
//! against that tree once per tick, plugin adapters bridge native effect and
//! instrument ABIs into the recall stages, and one tick thread per channel or
//! audio runs the staging program in lock-step with the audio loop.

/// Declare a `u32` bit-set newtype with named constants.
macro_rules! flag_set {
    ($(#[$meta:meta])* $name:ident { $($(#[$fmeta:meta])* $flag:ident = $bit:expr;)* }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
        pub struct $name(u32);

        impl $name {
            pub const NONE: $name = $name(0);
            $($(#[$fmeta])* pub const $flag: $name = $name(1 << $bit);)*

            pub const fn bits(self) -> u32 {
                self.0
            }

            pub const fn union(self, other: $name) -> $name {
                $name(self.0 | other.0)
            }

            pub fn contains(self, other: $name) -> bool {
                self.0 & other.0 == other.0
            }

            pub fn intersects(self, other: $name) -> bool {
                self.0 & other.0 != 0
            }

            pub fn insert(&mut self, other: $name) {
                self.0 |= other.0;
            }

            pub fn remove(&mut self, other: $name) {
                self.0 &= !other.0;
            }

            pub fn is_empty(self) -> bool {
                self.0 == 0
            }
        }

        impl std::ops::BitOr for $name {
            type Output = $name;
            fn bitor(self, rhs: $name) -> $name {
                $name(self.0 | rhs.0)
            }
        }

        impl std::ops::BitAnd for $name {
            type Output = $name;
            fn bitand(self, rhs: $name) -> $name {
                $name(self.0 & rhs.0)
            }
        }
    };
}

pub(crate) use flag_set;

pub mod audio_signal;
pub mod buffer;
pub mod channel_thread;
pub mod conversion;
pub mod plugin;
pub mod port;
pub mod recall;
pub mod recall_id;
pub mod recycling;
pub mod scheduler;
pub mod staging;
pub mod telemetry;
pub mod topology;

pub use audio_signal::{AudioSignal, SignalState};
pub use buffer::AudioBuffer;
pub use channel_thread::{AudioThread, AudioWork, ChannelThread, ChannelWork, TickThread, TickWork};
pub use port::{Port, PortFlags, PortValue};
pub use recall::{Recall, RecallFlags, RecallHandler, RecallKind, RecallLevel, RecallList};
pub use recall_id::{RecallId, RecyclingContext};
pub use recycling::{Recycling, RecyclingEvent};
pub use scheduler::AudioLoop;
pub use staging::{StagingEngine, StagingPolicy, TickReport};
pub use topology::{AudioNode, ChannelNode};

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Lock a per-object mutex, ignoring poisoning.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique raw id for signals, recyclings, contexts and recalls.
pub(crate) fn next_id() -> u64 {
    NEXT_ID.fetch_add(1, Ordering::Relaxed)
}
