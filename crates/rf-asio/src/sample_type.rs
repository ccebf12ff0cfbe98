//! Hardware sample types
//!
//! Every ASIO channel reports one of these. The numeric ids match the ASIO SDK
//! so drivers can hand them through unchanged.

use std::fmt;

use rf_core::SampleFormat;

// ═══════════════════════════════════════════════════════════════════════════════
// ASIO SAMPLE TYPE
// ═══════════════════════════════════════════════════════════════════════════════

/// ASIO sample type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum AsioSampleType {
    Int16MSB = 0,
    Int24MSB = 1,
    Int32MSB = 2,
    Float32MSB = 3,
    Float64MSB = 4,
    Int32MSB16 = 8,
    Int32MSB18 = 9,
    Int32MSB20 = 10,
    Int32MSB24 = 11,
    Int16LSB = 16,
    Int24LSB = 17,
    Int32LSB = 18,
    Float32LSB = 19,
    Float64LSB = 20,
    Int32LSB16 = 24,
    Int32LSB18 = 25,
    Int32LSB20 = 26,
    Int32LSB24 = 27,
}

/// Static properties of a sample type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SampleTraits {
    pub is_float: bool,
    pub is_be: bool,
    pub valid_bits: u32,
    pub size_bytes: usize,
}

impl AsioSampleType {
    pub const ALL: [AsioSampleType; 18] = [
        Self::Int16MSB,
        Self::Int24MSB,
        Self::Int32MSB,
        Self::Float32MSB,
        Self::Float64MSB,
        Self::Int32MSB16,
        Self::Int32MSB18,
        Self::Int32MSB20,
        Self::Int32MSB24,
        Self::Int16LSB,
        Self::Int24LSB,
        Self::Int32LSB,
        Self::Float32LSB,
        Self::Float64LSB,
        Self::Int32LSB16,
        Self::Int32LSB18,
        Self::Int32LSB20,
        Self::Int32LSB24,
    ];

    pub fn from_raw(raw: i32) -> Option<Self> {
        Self::ALL.into_iter().find(|t| *t as i32 == raw)
    }

    #[inline]
    pub fn raw(self) -> i32 {
        self as i32
    }

    pub fn traits(self) -> SampleTraits {
        use AsioSampleType::*;
        let (is_float, valid_bits, size_bytes) = match self {
            Int16MSB | Int16LSB => (false, 16, 2),
            Int24MSB | Int24LSB => (false, 24, 3),
            Int32MSB | Int32LSB => (false, 32, 4),
            Float32MSB | Float32LSB => (true, 32, 4),
            Float64MSB | Float64LSB => (true, 64, 8),
            Int32MSB16 | Int32LSB16 => (false, 16, 4),
            Int32MSB18 | Int32LSB18 => (false, 18, 4),
            Int32MSB20 | Int32LSB20 => (false, 20, 4),
            Int32MSB24 | Int32LSB24 => (false, 24, 4),
        };
        SampleTraits {
            is_float,
            is_be: (self as i32) < 16,
            valid_bits,
            size_bytes,
        }
    }

    #[inline]
    pub fn is_float(self) -> bool {
        self.traits().is_float
    }

    #[inline]
    pub fn is_be(self) -> bool {
        self.traits().is_be
    }

    #[inline]
    pub fn valid_bits(self) -> u32 {
        self.traits().valid_bits
    }

    #[inline]
    pub fn size_bytes(self) -> usize {
        self.traits().size_bytes
    }

    /// Byte order matches the host.
    #[inline]
    pub fn is_native(self) -> bool {
        self.is_be() == cfg!(target_endian = "big")
    }

    /// The host-order hardware type whose memory layout equals `format`.
    pub fn native(format: SampleFormat) -> Self {
        let le = cfg!(target_endian = "little");
        match (format, le) {
            (SampleFormat::Int16, true) => Self::Int16LSB,
            (SampleFormat::Int16, false) => Self::Int16MSB,
            (SampleFormat::Int24, true) => Self::Int24LSB,
            (SampleFormat::Int24, false) => Self::Int24MSB,
            (SampleFormat::Int32, true) => Self::Int32LSB,
            (SampleFormat::Int32, false) => Self::Int32MSB,
            (SampleFormat::Float32, true) => Self::Float32LSB,
            (SampleFormat::Float32, false) => Self::Float32MSB,
            (SampleFormat::Float64, true) => Self::Float64LSB,
            (SampleFormat::Float64, false) => Self::Float64MSB,
        }
    }
}

impl fmt::Display for AsioSampleType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}({})", self, self.raw())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// HARDWARE SAMPLE CODEC
// ═══════════════════════════════════════════════════════════════════════════════

/// One decoded hardware sample.
///
/// Integers are left-aligned to 32 bits so every integer width shares one
/// scale; floats are widened to f64.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum HwSample {
    Int(i32),
    Float(f64),
}

const INT32_SCALE: f64 = 2147483648.0;

impl HwSample {
    /// Integer view, saturating float input.
    #[inline]
    pub fn to_int(self) -> i32 {
        match self {
            Self::Int(v) => v,
            Self::Float(f) => saturate_round_i32(f * INT32_SCALE),
        }
    }

    #[inline]
    pub fn to_float(self) -> f64 {
        match self {
            Self::Int(v) => v as f64 / INT32_SCALE,
            Self::Float(f) => f,
        }
    }
}

/// Round and clamp into `i32`. NaN maps to zero.
#[inline]
pub fn saturate_round_i32(value: f64) -> i32 {
    if value.is_nan() {
        return 0;
    }
    value.round().clamp(i32::MIN as f64, i32::MAX as f64) as i32
}

#[inline]
fn read_bytes<const N: usize>(data: &[u8], be: bool) -> [u8; N] {
    let mut bytes = [0u8; N];
    bytes.copy_from_slice(&data[..N]);
    if be {
        bytes.reverse();
    }
    // little-endian from here on
    bytes
}

#[inline]
fn write_bytes<const N: usize>(mut bytes: [u8; N], be: bool, output: &mut [u8]) {
    if be {
        bytes.reverse();
    }
    output[..N].copy_from_slice(&bytes);
}

/// Decode one sample of `sample_type` from the start of `data`.
#[inline]
pub fn decode_sample(data: &[u8], sample_type: AsioSampleType) -> HwSample {
    let t = sample_type.traits();
    match t.size_bytes {
        2 => HwSample::Int((i16::from_le_bytes(read_bytes::<2>(data, t.is_be)) as i32) << 16),
        3 => {
            let [a, b, c] = read_bytes::<3>(data, t.is_be);
            HwSample::Int(i32::from_le_bytes([0, a, b, c]))
        }
        4 if t.is_float => HwSample::Float(f32::from_le_bytes(read_bytes::<4>(data, t.is_be)) as f64),
        4 => {
            let raw = i32::from_le_bytes(read_bytes::<4>(data, t.is_be));
            if t.valid_bits >= 32 {
                return HwSample::Int(raw);
            }
            // out-of-range container bits saturate
            let limit = 1i32 << (t.valid_bits - 1);
            HwSample::Int(raw.clamp(-limit, limit - 1) << (32 - t.valid_bits))
        }
        _ => HwSample::Float(f64::from_le_bytes(read_bytes::<8>(data, t.is_be))),
    }
}

/// Encode one sample as `sample_type` into the start of `output`.
#[inline]
pub fn encode_sample(value: HwSample, sample_type: AsioSampleType, output: &mut [u8]) {
    let t = sample_type.traits();
    if t.is_float {
        let f = value.to_float();
        if t.size_bytes == 4 {
            write_bytes((f as f32).to_le_bytes(), t.is_be, output);
        } else {
            write_bytes(f.to_le_bytes(), t.is_be, output);
        }
        return;
    }
    let v = value.to_int();
    match t.size_bytes {
        2 => write_bytes(((v >> 16) as i16).to_le_bytes(), t.is_be, output),
        3 => {
            let [_, a, b, c] = v.to_le_bytes();
            write_bytes([a, b, c], t.is_be, output);
        }
        _ => write_bytes((v >> (32 - t.valid_bits)).to_le_bytes(), t.is_be, output),
    }
}
