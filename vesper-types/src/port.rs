use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PortDirection {
    Input,
    Output,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PortKind {
    Control,
    Audio,
}

/// Range hints attached to a plugin port, composed as a bit set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PortHints(u32);

impl PortHints {
    pub const NONE: PortHints = PortHints(0);
    pub const BOUNDED_BELOW: PortHints = PortHints(1 << 0);
    pub const BOUNDED_ABOVE: PortHints = PortHints(1 << 1);
    pub const TOGGLED: PortHints = PortHints(1 << 2);
    pub const SAMPLE_RATE: PortHints = PortHints(1 << 3);
    pub const LOGARITHMIC: PortHints = PortHints(1 << 4);
    pub const INTEGER: PortHints = PortHints(1 << 5);

    pub fn from_bits(bits: u32) -> Self {
        PortHints(bits)
    }

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn contains(self, other: PortHints) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl std::ops::BitOr for PortHints {
    type Output = PortHints;
    fn bitor(self, rhs: PortHints) -> PortHints {
        PortHints(self.0 | rhs.0)
    }
}

impl std::ops::BitOrAssign for PortHints {
    fn bitor_assign(&mut self, rhs: PortHints) {
        self.0 |= rhs.0;
    }
}

/// One entry of a plugin's port table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortDescriptor {
    /// Index in the native port table; used for `connect_port`.
    pub index: usize,
    pub name: String,
    pub direction: PortDirection,
    pub kind: PortKind,
    pub hints: PortHints,
    pub lower: f32,
    pub upper: f32,
    pub default: f32,
}

impl PortDescriptor {
    pub fn control_input(index: usize, name: &str, lower: f32, upper: f32, default: f32) -> Self {
        Self {
            index,
            name: name.to_string(),
            direction: PortDirection::Input,
            kind: PortKind::Control,
            hints: PortHints::BOUNDED_BELOW | PortHints::BOUNDED_ABOVE,
            lower,
            upper,
            default,
        }
    }

    pub fn audio(index: usize, name: &str, direction: PortDirection) -> Self {
        Self {
            index,
            name: name.to_string(),
            direction,
            kind: PortKind::Audio,
            hints: PortHints::NONE,
            lower: 0.0,
            upper: 0.0,
            default: 0.0,
        }
    }

    pub fn with_hints(mut self, hints: PortHints) -> Self {
        self.hints = hints;
        self
    }

    pub fn with_direction(mut self, direction: PortDirection) -> Self {
        self.direction = direction;
        self
    }

    pub fn is_control(&self) -> bool {
        self.kind == PortKind::Control
    }

    pub fn is_audio(&self) -> bool {
        self.kind == PortKind::Audio
    }

    pub fn is_input(&self) -> bool {
        self.direction == PortDirection::Input
    }

    pub fn is_output(&self) -> bool {
        self.direction == PortDirection::Output
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hints_compose_as_a_set() {
        let mut hints = PortHints::BOUNDED_BELOW | PortHints::LOGARITHMIC;
        assert!(hints.contains(PortHints::BOUNDED_BELOW));
        assert!(!hints.contains(PortHints::BOUNDED_ABOVE));
        hints |= PortHints::SAMPLE_RATE;
        assert!(hints.contains(PortHints::SAMPLE_RATE | PortHints::LOGARITHMIC));
        assert!(PortHints::NONE.is_empty());
    }

    #[test]
    fn descriptor_builders() {
        let gain = PortDescriptor::control_input(0, "gain", 0.0, 2.0, 1.0);
        assert!(gain.is_control() && gain.is_input());
        let out = PortDescriptor::audio(2, "out", PortDirection::Output);
        assert!(out.is_audio() && out.is_output());
    }
}
