//! Unit conversion between automation values and plugin port values.

use vesper_types::PortHints;

use crate::flag_set;

flag_set!(
    ConversionFlags {
        BOUNDED_BELOW = 0;
        BOUNDED_ABOVE = 1;
        SAMPLERATE = 2;
        LOGARITHMIC = 3;
    }
);

/// Forward conversion maps a value into plugin units: `exp` for logarithmic
/// ports, then samplerate scaling, then clamping to the bounds. Reverse
/// conversion undoes the steps in the opposite order.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Conversion {
    pub flags: ConversionFlags,
    /// Bounds in plugin units.
    pub lower: f64,
    pub upper: f64,
    pub samplerate: u32,
}

impl Conversion {
    pub fn new(flags: ConversionFlags, lower: f64, upper: f64, samplerate: u32) -> Self {
        Self {
            flags,
            lower,
            upper,
            samplerate,
        }
    }

    /// Derive a conversion from a port's range hints, or `None` when no hint
    /// calls for one. Bounds of samplerate ports are scaled into plugin units.
    pub fn from_hints(hints: PortHints, lower: f32, upper: f32, samplerate: u32) -> Option<Self> {
        let mut flags = ConversionFlags::NONE;
        if hints.contains(PortHints::BOUNDED_BELOW) {
            flags.insert(ConversionFlags::BOUNDED_BELOW);
        }
        if hints.contains(PortHints::BOUNDED_ABOVE) {
            flags.insert(ConversionFlags::BOUNDED_ABOVE);
        }
        if hints.contains(PortHints::SAMPLE_RATE) {
            flags.insert(ConversionFlags::SAMPLERATE);
        }
        if hints.contains(PortHints::LOGARITHMIC) {
            flags.insert(ConversionFlags::LOGARITHMIC);
        }
        if flags.is_empty() {
            return None;
        }

        let scale = if flags.contains(ConversionFlags::SAMPLERATE) {
            samplerate as f64
        } else {
            1.0
        };
        Some(Self::new(
            flags,
            lower as f64 * scale,
            upper as f64 * scale,
            samplerate,
        ))
    }

    fn clamp(&self, mut value: f64) -> f64 {
        if self.flags.contains(ConversionFlags::BOUNDED_BELOW) && value < self.lower {
            value = self.lower;
        }
        if self.flags.contains(ConversionFlags::BOUNDED_ABOVE) && value > self.upper {
            value = self.upper;
        }
        value
    }

    pub fn convert(&self, value: f64, reverse: bool) -> f64 {
        if reverse {
            let mut v = self.clamp(value);
            if self.flags.contains(ConversionFlags::SAMPLERATE) && self.samplerate != 0 {
                v /= self.samplerate as f64;
            }
            if self.flags.contains(ConversionFlags::LOGARITHMIC) {
                v = v.max(f64::MIN_POSITIVE).ln();
            }
            v
        } else {
            let mut v = value;
            if self.flags.contains(ConversionFlags::LOGARITHMIC) {
                v = v.exp();
            }
            if self.flags.contains(ConversionFlags::SAMPLERATE) {
                v *= self.samplerate as f64;
            }
            self.clamp(v)
        }
    }
}
