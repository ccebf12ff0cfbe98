//! Buffer size and sample format negotiation

use rf_core::SampleFormat;

use crate::driver::AsioBufferSizes;
use crate::sample_type::AsioSampleType;

/// Frames per buffer half for a requested latency. Double buffering splits the
/// latency across two halves.
pub fn target_buffer_frames(latency_seconds: f64, sample_rate: u32) -> i64 {
    let frames = (latency_seconds * sample_rate as f64 / 2.0).round();
    if frames.is_nan() {
        return 0;
    }
    frames.clamp(i32::MIN as f64, i32::MAX as f64) as i64
}

/// Pick the buffer length for `target` frames under the driver's constraints.
///
/// Drivers report self-contradictory constraints often enough that every
/// branch below is reachable in the field. Where a step scan is involved the
/// result is the largest allowed size not exceeding the clamped target.
pub fn negotiate_buffer_length(sizes: &AsioBufferSizes, target: i64) -> i64 {
    let min = sizes.min as i64;
    let max = sizes.max as i64;
    let preferred = sizes.preferred as i64;
    let granularity = sizes.granularity as i64;

    if min <= 0 || max <= 0 || min > max {
        // limits make no sense
        if preferred > 0 { preferred } else { target }
    } else if granularity < -1 {
        target.clamp(min, max)
    } else if granularity == -1 && (min.count_ones() != 1 || max.count_ones() != 1) {
        // power-of-two steps claimed, but the limits are not powers of two
        let clamped = target.clamp(min, max);
        let mut result = clamped;
        let mut size = 1i64;
        while size <= max && size <= clamped {
            if size >= min {
                result = size;
            }
            size *= 2;
        }
        result
    } else if granularity == -1 {
        let clamped = target.clamp(min, max);
        let mut result = clamped;
        let mut size = min;
        while size <= max && size <= clamped {
            result = size;
            size *= 2;
        }
        result
    } else if granularity > 0 {
        let clamped = target.clamp(min, max);
        let mut result = clamped;
        let mut size = min;
        while size <= max && size <= clamped {
            result = size;
            size += granularity;
        }
        result
    } else if preferred > 0 {
        preferred
    } else if target >= max {
        max
    } else {
        min
    }
}

/// Unified working format for a set of channel sample types.
///
/// Each rule must hold for every channel. An empty set yields Int16.
pub fn select_format(types: &[AsioSampleType]) -> SampleFormat {
    let mut all_int = true;
    let mut all_int16_valid_bits = true;
    let mut all_native_int24 = true;
    let mut all_float32 = true;
    for t in types.iter().map(|t| t.traits()) {
        let is_int24 = !t.is_float && t.size_bytes == 3 && t.valid_bits == 24;
        let is_native = t.is_be == cfg!(target_endian = "big");
        if t.is_float {
            all_int = false;
        }
        if t.is_float || t.valid_bits != 16 {
            all_int16_valid_bits = false;
        }
        if !(is_int24 && is_native) {
            all_native_int24 = false;
        }
        if !(t.is_float && t.valid_bits == 32) {
            all_float32 = false;
        }
    }
    if all_int16_valid_bits {
        SampleFormat::Int16
    } else if all_native_int24 {
        SampleFormat::Int24
    } else if all_int {
        SampleFormat::Int32
    } else if all_float32 {
        SampleFormat::Float32
    } else {
        SampleFormat::Float64
    }
}
