//! Typed PCM buffers and the conversions between them.
//!
//! An [`AudioBuffer`] stores one chunk of an AudioSignal stream in its native
//! sample format. Cross-format copies go through a normalized `f64` sample so
//! integer formats of any width map onto `[-1.0, 1.0]`.

use vesper_types::SoundcardFormat;

/// One fixed-size chunk of samples in a concrete format.
#[derive(Debug, Clone, PartialEq)]
pub enum AudioBuffer {
    S8(Vec<i8>),
    S16(Vec<i16>),
    /// 24-bit samples stored right-aligned in `i32`.
    S24(Vec<i32>),
    S32(Vec<i32>),
    S64(Vec<i64>),
    Float(Vec<f32>),
    Double(Vec<f64>),
}

trait Sample: Copy + Default {
    fn to_f64(self) -> f64;
    fn from_f64(v: f64) -> Self;
}

macro_rules! int_sample {
    ($($t:ty),*) => {
        $(impl Sample for $t {
            fn to_f64(self) -> f64 {
                self as f64
            }
            fn from_f64(v: f64) -> Self {
                v.round() as $t
            }
        })*
    };
}

int_sample!(i8, i16, i32, i64);

impl Sample for f32 {
    fn to_f64(self) -> f64 {
        self as f64
    }
    fn from_f64(v: f64) -> Self {
        v as f32
    }
}

impl Sample for f64 {
    fn to_f64(self) -> f64 {
        self
    }
    fn from_f64(v: f64) -> Self {
        v
    }
}

macro_rules! dispatch {
    ($buf:expr, $v:ident => $body:expr) => {
        match $buf {
            AudioBuffer::S8($v) => $body,
            AudioBuffer::S16($v) => $body,
            AudioBuffer::S24($v) => $body,
            AudioBuffer::S32($v) => $body,
            AudioBuffer::S64($v) => $body,
            AudioBuffer::Float($v) => $body,
            AudioBuffer::Double($v) => $body,
        }
    };
}

fn write_norm<T: Sample>(slot: &mut T, v: f64, scale: f64) {
    *slot = T::from_f64(v.clamp(-1.0, 1.0) * scale);
}

impl AudioBuffer {
    /// A zeroed buffer of `len` samples.
    pub fn new(format: SoundcardFormat, len: usize) -> Self {
        match format {
            SoundcardFormat::Signed8 => AudioBuffer::S8(vec![0; len]),
            SoundcardFormat::Signed16 => AudioBuffer::S16(vec![0; len]),
            SoundcardFormat::Signed24 => AudioBuffer::S24(vec![0; len]),
            SoundcardFormat::Signed32 => AudioBuffer::S32(vec![0; len]),
            SoundcardFormat::Signed64 => AudioBuffer::S64(vec![0; len]),
            SoundcardFormat::Float => AudioBuffer::Float(vec![0.0; len]),
            SoundcardFormat::Double => AudioBuffer::Double(vec![0.0; len]),
        }
    }

    pub fn format(&self) -> SoundcardFormat {
        match self {
            AudioBuffer::S8(_) => SoundcardFormat::Signed8,
            AudioBuffer::S16(_) => SoundcardFormat::Signed16,
            AudioBuffer::S24(_) => SoundcardFormat::Signed24,
            AudioBuffer::S32(_) => SoundcardFormat::Signed32,
            AudioBuffer::S64(_) => SoundcardFormat::Signed64,
            AudioBuffer::Float(_) => SoundcardFormat::Float,
            AudioBuffer::Double(_) => SoundcardFormat::Double,
        }
    }

    pub fn len(&self) -> usize {
        dispatch!(self, v => v.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Zero every sample in place.
    pub fn clear(&mut self) {
        dispatch!(self, v => v.iter_mut().for_each(|s| *s = Default::default()))
    }

    /// Grow with silence or truncate.
    pub fn resize(&mut self, len: usize) {
        dispatch!(self, v => v.resize(len, Default::default()))
    }

    /// Sample `i` normalized to `[-1.0, 1.0]`. Out of range reads are silence.
    pub fn sample(&self, i: usize) -> f64 {
        let scale = self.format().full_scale();
        dispatch!(self, v => v.get(i).map(|s| s.to_f64() / scale).unwrap_or(0.0))
    }

    /// Write a normalized sample, clamping to full scale.
    pub fn set_sample(&mut self, i: usize, value: f64) {
        let scale = self.format().full_scale();
        dispatch!(self, v => {
            if let Some(slot) = v.get_mut(i) {
                write_norm(slot, value, scale);
            }
        })
    }

    /// Copy `count` samples from `src[src_offset..]` into `self[dst_offset..]`,
    /// converting when the formats differ. The count is clipped to both bounds.
    pub fn copy_from(&mut self, dst_offset: usize, src: &AudioBuffer, src_offset: usize, count: usize) {
        let count = count
            .min(self.len().saturating_sub(dst_offset))
            .min(src.len().saturating_sub(src_offset));
        if count == 0 {
            return;
        }

        macro_rules! same_format {
            ($($variant:ident),*) => {
                match (&mut *self, src) {
                    $((AudioBuffer::$variant(d), AudioBuffer::$variant(s)) => {
                        d[dst_offset..dst_offset + count]
                            .copy_from_slice(&s[src_offset..src_offset + count]);
                        return;
                    })*
                    _ => {}
                }
            };
        }
        same_format!(S8, S16, S24, S32, S64, Float, Double);

        for k in 0..count {
            let value = src.sample(src_offset + k);
            self.set_sample(dst_offset + k, value);
        }
    }

    /// A copy of this buffer in another format.
    pub fn converted(&self, format: SoundcardFormat) -> AudioBuffer {
        if format == self.format() {
            return self.clone();
        }
        let mut out = AudioBuffer::new(format, self.len());
        out.copy_from(0, self, 0, self.len());
        out
    }

    /// Whether every sample is zero.
    pub fn is_silent(&self) -> bool {
        dispatch!(self, v => v.iter().all(|s| s.to_f64() == 0.0))
    }
}

/// Copy interleaved frames from `src` into a planar `f32` block where
/// channel `c` occupies `dst[c * frames..(c + 1) * frames]`.
///
/// Channels present on only one side are left untouched.
pub fn interleaved_to_planar(
    src: &AudioBuffer,
    src_channels: usize,
    dst: &mut [f32],
    dst_channels: usize,
    frames: usize,
) {
    let channels = src_channels.min(dst_channels);
    for c in 0..channels {
        let plane = &mut dst[c * frames..(c + 1) * frames];
        for (f, out) in plane.iter_mut().enumerate() {
            *out = src.sample(f * src_channels + c) as f32;
        }
    }
}

/// Copy a planar `f32` block back into interleaved `dst`, overwriting it.
/// Planes beyond `dst_channels` are discarded.
pub fn planar_to_interleaved(
    src: &[f32],
    src_channels: usize,
    dst: &mut AudioBuffer,
    dst_channels: usize,
    frames: usize,
) {
    let channels = src_channels.min(dst_channels);
    for c in 0..channels {
        let plane = &src[c * frames..(c + 1) * frames];
        for (f, value) in plane.iter().enumerate() {
            dst.set_sample(f * dst_channels + c, *value as f64);
        }
    }
}
