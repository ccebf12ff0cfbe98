//! Conversion between hardware channel buffers and interleaved working buffers
//!
//! A hardware buffer holds one channel, `frames` samples of its native
//! [`AsioSampleType`]. A working buffer holds all channels of one direction
//! interleaved, in the session's unified [`SampleFormat`].

use bytemuck::Pod;
use rf_core::{Int24, SampleFormat};

use crate::sample_type::{AsioSampleType, HwSample, decode_sample, encode_sample, saturate_round_i32};
use crate::source::{Interleaved, InterleavedMut};

/// A sample in one of the five unified working representations.
pub trait WorkingSample: Pod + Copy + Default + Send + 'static {
    const FORMAT: SampleFormat;

    fn from_hw(value: HwSample) -> Self;
    fn to_hw(self) -> HwSample;

    fn interleaved(buffer: &[Self]) -> Interleaved<'_>;
    fn interleaved_mut(buffer: &mut [Self]) -> InterleavedMut<'_>;

    /// Hardware type with the same memory layout, eligible for a raw copy.
    #[inline]
    fn native_type() -> AsioSampleType {
        AsioSampleType::native(Self::FORMAT)
    }
}

impl WorkingSample for i16 {
    const FORMAT: SampleFormat = SampleFormat::Int16;

    #[inline]
    fn from_hw(value: HwSample) -> Self {
        (value.to_int() >> 16) as i16
    }

    #[inline]
    fn to_hw(self) -> HwSample {
        HwSample::Int((self as i32) << 16)
    }

    fn interleaved(buffer: &[Self]) -> Interleaved<'_> {
        Interleaved::Int16(buffer)
    }

    fn interleaved_mut(buffer: &mut [Self]) -> InterleavedMut<'_> {
        InterleavedMut::Int16(buffer)
    }
}

impl WorkingSample for Int24 {
    const FORMAT: SampleFormat = SampleFormat::Int24;

    #[inline]
    fn from_hw(value: HwSample) -> Self {
        Int24::new(value.to_int() >> 8)
    }

    #[inline]
    fn to_hw(self) -> HwSample {
        HwSample::Int(self.get() << 8)
    }

    fn interleaved(buffer: &[Self]) -> Interleaved<'_> {
        Interleaved::Int24(buffer)
    }

    fn interleaved_mut(buffer: &mut [Self]) -> InterleavedMut<'_> {
        InterleavedMut::Int24(buffer)
    }
}

impl WorkingSample for i32 {
    const FORMAT: SampleFormat = SampleFormat::Int32;

    #[inline]
    fn from_hw(value: HwSample) -> Self {
        value.to_int()
    }

    #[inline]
    fn to_hw(self) -> HwSample {
        HwSample::Int(self)
    }

    fn interleaved(buffer: &[Self]) -> Interleaved<'_> {
        Interleaved::Int32(buffer)
    }

    fn interleaved_mut(buffer: &mut [Self]) -> InterleavedMut<'_> {
        InterleavedMut::Int32(buffer)
    }
}

impl WorkingSample for f32 {
    const FORMAT: SampleFormat = SampleFormat::Float32;

    #[inline]
    fn from_hw(value: HwSample) -> Self {
        value.to_float() as f32
    }

    #[inline]
    fn to_hw(self) -> HwSample {
        HwSample::Float(self as f64)
    }

    fn interleaved(buffer: &[Self]) -> Interleaved<'_> {
        Interleaved::Float32(buffer)
    }

    fn interleaved_mut(buffer: &mut [Self]) -> InterleavedMut<'_> {
        InterleavedMut::Float32(buffer)
    }
}

impl WorkingSample for f64 {
    const FORMAT: SampleFormat = SampleFormat::Float64;

    #[inline]
    fn from_hw(value: HwSample) -> Self {
        value.to_float()
    }

    #[inline]
    fn to_hw(self) -> HwSample {
        HwSample::Float(self)
    }

    fn interleaved(buffer: &[Self]) -> Interleaved<'_> {
        Interleaved::Float64(buffer)
    }

    fn interleaved_mut(buffer: &mut [Self]) -> InterleavedMut<'_> {
        InterleavedMut::Float64(buffer)
    }
}

/// Normalize a float working sample to a left-aligned integer, saturating.
#[inline]
pub fn float_to_int32(value: f64) -> i32 {
    saturate_round_i32(value * 2147483648.0)
}

// ═══════════════════════════════════════════════════════════════════════════════
// CHANNEL CONVERSION
// ═══════════════════════════════════════════════════════════════════════════════

/// Deinterleave-free copy of one hardware channel into column `channel` of an
/// interleaved working buffer with `channels` columns.
pub fn convert_from_hw<S: WorkingSample>(
    dst: &mut [S],
    channel: usize,
    channels: usize,
    sample_type: AsioSampleType,
    src: &[u8],
    frames: usize,
) {
    let size = sample_type.size_bytes();
    debug_assert!(src.len() >= frames * size);
    debug_assert!(dst.len() >= frames * channels);
    let raw = sample_type == S::native_type();
    for (frame, bytes) in src.chunks_exact(size).take(frames).enumerate() {
        dst[frame * channels + channel] = if raw {
            bytemuck::pod_read_unaligned(bytes)
        } else {
            S::from_hw(decode_sample(bytes, sample_type))
        };
    }
}

/// Copy column `channel` of an interleaved working buffer into one hardware
/// channel of type `sample_type`.
pub fn convert_to_hw<S: WorkingSample>(
    dst: &mut [u8],
    sample_type: AsioSampleType,
    src: &[S],
    channel: usize,
    channels: usize,
    frames: usize,
) {
    let size = sample_type.size_bytes();
    debug_assert!(dst.len() >= frames * size);
    debug_assert!(src.len() >= frames * channels);
    let raw = sample_type == S::native_type();
    for (frame, bytes) in dst.chunks_exact_mut(size).take(frames).enumerate() {
        let sample = src[frame * channels + channel];
        if raw {
            bytes.copy_from_slice(bytemuck::bytes_of(&sample));
        } else {
            encode_sample(sample.to_hw(), sample_type, bytes);
        }
    }
}

/// Silence in every supported hardware type is all-zero bytes.
#[inline]
pub fn clear_hw_buffer(dst: &mut [u8]) {
    dst.fill(0);
}
