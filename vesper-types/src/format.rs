use serde::{Deserialize, Serialize};

/// Sample format of an AudioSignal buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum SoundcardFormat {
    Signed8,
    #[default]
    Signed16,
    Signed24,
    Signed32,
    Signed64,
    Float,
    Double,
}

impl SoundcardFormat {
    /// Bits per sample as stored.
    pub fn bits(self) -> u32 {
        match self {
            SoundcardFormat::Signed8 => 8,
            SoundcardFormat::Signed16 => 16,
            SoundcardFormat::Signed24 => 24,
            SoundcardFormat::Signed32 => 32,
            SoundcardFormat::Signed64 => 64,
            SoundcardFormat::Float => 32,
            SoundcardFormat::Double => 64,
        }
    }

    pub fn is_float(self) -> bool {
        matches!(self, SoundcardFormat::Float | SoundcardFormat::Double)
    }

    /// Full-scale value used to normalize integer samples into `[-1.0, 1.0]`.
    pub fn full_scale(self) -> f64 {
        match self {
            SoundcardFormat::Signed8 => i8::MAX as f64,
            SoundcardFormat::Signed16 => i16::MAX as f64,
            SoundcardFormat::Signed24 => 8_388_607.0,
            SoundcardFormat::Signed32 => i32::MAX as f64,
            SoundcardFormat::Signed64 => i64::MAX as f64,
            SoundcardFormat::Float | SoundcardFormat::Double => 1.0,
        }
    }

    /// Parse the short names used in configuration files.
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_lowercase().as_str() {
            "s8" | "signed8" => Some(SoundcardFormat::Signed8),
            "s16" | "signed16" => Some(SoundcardFormat::Signed16),
            "s24" | "signed24" => Some(SoundcardFormat::Signed24),
            "s32" | "signed32" => Some(SoundcardFormat::Signed32),
            "s64" | "signed64" => Some(SoundcardFormat::Signed64),
            "float" | "f32" => Some(SoundcardFormat::Float),
            "double" | "f64" => Some(SoundcardFormat::Double),
            _ => None,
        }
    }
}
