use serde::{Deserialize, Serialize};

/// A note driving one voice. `x0`/`x1` are play positions in ticks,
/// `y` is the key.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Note {
    pub x0: u64,
    pub x1: u64,
    pub y: u32,
    pub velocity: u8,
    /// Held note whose voice keeps growing while it is active.
    pub feed: bool,
}

impl Note {
    pub fn new(x0: u64, x1: u64, y: u32) -> Self {
        Self {
            x0,
            x1,
            y,
            velocity: 100,
            feed: false,
        }
    }

    /// Whether the note sounds at `position` (half-open `[x0, x1)`).
    pub fn is_active_at(&self, position: u64) -> bool {
        self.x0 <= position && position < self.x1
    }

    pub fn is_ended_at(&self, position: u64) -> bool {
        position >= self.x1
    }

    pub fn duration(&self) -> u64 {
        self.x1.saturating_sub(self.x0)
    }
}
