//! Sample types and working sample representations

use std::fmt;

use bytemuck::{Pod, Zeroable};

/// Interleaved working representation of a device session.
///
/// A session converts every hardware channel into exactly one of these
/// before handing audio to the application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum SampleFormat {
    Int16,
    Int24,
    Int32,
    Float32,
    Float64,
}

impl SampleFormat {
    pub const ALL: [SampleFormat; 5] = [
        Self::Int16,
        Self::Int24,
        Self::Int32,
        Self::Float32,
        Self::Float64,
    ];

    #[inline]
    pub fn bits_per_sample(self) -> u32 {
        match self {
            Self::Int16 => 16,
            Self::Int24 => 24,
            Self::Int32 | Self::Float32 => 32,
            Self::Float64 => 64,
        }
    }

    #[inline]
    pub fn bytes_per_sample(self) -> usize {
        self.bits_per_sample() as usize / 8
    }

    #[inline]
    pub fn is_float(self) -> bool {
        matches!(self, Self::Float32 | Self::Float64)
    }
}

impl Default for SampleFormat {
    fn default() -> Self {
        Self::Float32
    }
}

impl fmt::Display for SampleFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Int16 => "int16",
            Self::Int24 => "int24",
            Self::Int32 => "int32",
            Self::Float32 => "float32",
            Self::Float64 => "float64",
        };
        f.write_str(name)
    }
}

/// Packed 24-bit signed integer in host byte order.
///
/// Three bytes, no padding, so a slice of these has the same memory layout
/// as a native-endian 24-bit hardware buffer.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, Pod, Zeroable)]
#[repr(C)]
pub struct Int24(pub [u8; 3]);

impl Int24 {
    pub const MIN: i32 = -(1 << 23);
    pub const MAX: i32 = (1 << 23) - 1;
    pub const ZERO: Self = Self([0; 3]);

    /// Build from an `i32`, saturating values outside the 24-bit range.
    #[inline]
    pub fn new(value: i32) -> Self {
        let v = value.clamp(Self::MIN, Self::MAX);
        let b = v.to_ne_bytes();
        if cfg!(target_endian = "little") {
            Self([b[0], b[1], b[2]])
        } else {
            Self([b[1], b[2], b[3]])
        }
    }

    /// Sign-extended value.
    #[inline]
    pub fn get(self) -> i32 {
        let [a, b, c] = self.0;
        let raw = if cfg!(target_endian = "little") {
            i32::from_le_bytes([0, a, b, c])
        } else {
            i32::from_be_bytes([a, b, c, 0])
        };
        raw >> 8
    }
}

impl fmt::Debug for Int24 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Int24({})", self.get())
    }
}

impl From<Int24> for i32 {
    fn from(value: Int24) -> Self {
        value.get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_int24_roundtrip() {
        for v in [0, 1, -1, 1234567, -1234567, Int24::MAX, Int24::MIN] {
            assert_eq!(Int24::new(v).get(), v);
        }
    }

    #[test]
    fn test_int24_saturates() {
        assert_eq!(Int24::new(i32::MAX).get(), Int24::MAX);
        assert_eq!(Int24::new(i32::MIN).get(), Int24::MIN);
        assert_eq!(Int24::new(1 << 24).get(), Int24::MAX);
    }

    #[test]
    fn test_int24_layout() {
        assert_eq!(std::mem::size_of::<Int24>(), 3);
        assert_eq!(std::mem::align_of::<Int24>(), 1);
        assert_eq!(Int24::ZERO.get(), 0);
    }

    #[test]
    fn test_sample_format_sizes() {
        assert_eq!(SampleFormat::Int16.bytes_per_sample(), 2);
        assert_eq!(SampleFormat::Int24.bytes_per_sample(), 3);
        assert_eq!(SampleFormat::Int32.bytes_per_sample(), 4);
        assert_eq!(SampleFormat::Float32.bytes_per_sample(), 4);
        assert_eq!(SampleFormat::Float64.bytes_per_sample(), 8);
        assert!(SampleFormat::Float64.is_float());
        assert!(!SampleFormat::Int24.is_float());
        assert_eq!(SampleFormat::Int24.to_string(), "int24");
    }
}
