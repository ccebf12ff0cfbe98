//! Output latency and per-period stream synchronisation

use crate::driver::{DriverTime, time_flags};

/// Effective output latency in seconds.
///
/// The driver's figure excludes the buffer the application is currently
/// filling, so one buffer length is added. A report shorter than one buffer
/// is unusable and replaced by two buffer lengths.
pub fn output_latency_seconds(reported_output: i64, buffer_len: i64, sample_rate: u32) -> f64 {
    if sample_rate == 0 {
        return 0.0;
    }
    let rate = sample_rate as f64;
    if reported_output >= buffer_len {
        (reported_output + buffer_len) as f64 / rate
    } else {
        2.0 * buffer_len as f64 / rate
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct StreamPosition {
    pub frames: i64,
    pub seconds: f64,
}

impl StreamPosition {
    pub fn from_frames(frames: i64, sample_rate: u32) -> Self {
        let seconds = if sample_rate > 0 {
            frames as f64 / sample_rate as f64
        } else {
            0.0
        };
        Self { frames, seconds }
    }
}

/// Synchronisation record for one buffer period.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct TimeInfo {
    pub sync_point_stream_frames: i64,
    pub sync_point_system_timestamp_ns: u64,
    pub speed: f64,
    pub render_position_before: StreamPosition,
    pub render_position_after: StreamPosition,
    pub latency: f64,
}

/// Stream counters at the start of a period.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct StreamClock {
    pub total_frames_written: i64,
    pub stream_position_offset: i64,
    pub buffer_len: i64,
    pub sample_rate: u32,
    pub latency: f64,
}

/// Build the period's time info. Driver timestamps are trusted only when both
/// sample position and system time are flagged valid; otherwise the position
/// is estimated from the frame counter and `now_ns`.
pub fn synchronize(driver: Option<&DriverTime>, clock: &StreamClock, now_ns: impl FnOnce() -> u64) -> TimeInfo {
    let trusted = driver.filter(|t| {
        t.has(time_flags::SAMPLE_POSITION_VALID) && t.has(time_flags::SYSTEM_TIME_VALID)
    });
    let (frames, timestamp, speed) = match trusted {
        Some(t) => {
            let mut speed = 1.0;
            if t.has(time_flags::SPEED_VALID) && t.speed > 0.0 {
                speed = t.speed;
            } else if t.has(time_flags::SAMPLE_RATE_VALID) && t.sample_rate > 0.0 && clock.sample_rate > 0 {
                speed *= t.sample_rate / clock.sample_rate as f64;
            }
            (t.sample_position - clock.stream_position_offset, t.system_time_ns, speed)
        }
        None => {
            let latency_ns = (clock.latency * 1_000_000_000.0).round().max(0.0) as u64;
            (
                clock.total_frames_written + clock.buffer_len - clock.stream_position_offset,
                now_ns().saturating_add(latency_ns),
                1.0,
            )
        }
    };
    let before = clock.total_frames_written - clock.stream_position_offset;
    TimeInfo {
        sync_point_stream_frames: frames,
        sync_point_system_timestamp_ns: timestamp,
        speed,
        render_position_before: StreamPosition::from_frames(before, clock.sample_rate),
        render_position_after: StreamPosition::from_frames(before + clock.buffer_len, clock.sample_rate),
        latency: clock.latency,
    }
}
