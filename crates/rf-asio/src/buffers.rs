//! Per-session buffers: channel bindings and interleaved working buffers

use rf_core::{Int24, SampleFormat};

use crate::convert::WorkingSample;
use crate::driver::{BufferIndex, HwBuffer};
use crate::sample_type::AsioSampleType;

/// One active channel bound to its two driver buffer halves.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelBinding {
    pub is_input: bool,
    pub channel: i32,
    pub sample_type: AsioSampleType,
    pub name: String,
    pub buffers: [HwBuffer; 2],
}

impl ChannelBinding {
    #[inline]
    pub fn half(&self, index: BufferIndex) -> &HwBuffer {
        &self.buffers[index & 1]
    }
}

/// Output and input interleaved buffers of one working representation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SampleBufferPair<S> {
    pub output: Vec<S>,
    pub input: Vec<S>,
}

impl<S: WorkingSample> SampleBufferPair<S> {
    fn resize(&mut self, frames: usize, outputs: usize, inputs: usize) {
        self.output = vec![S::default(); frames * outputs];
        self.input = vec![S::default(); frames * inputs];
    }

    fn clear(&mut self) {
        self.output = Vec::new();
        self.input = Vec::new();
    }

    fn is_empty(&self) -> bool {
        self.output.is_empty() && self.input.is_empty()
    }
}

/// One buffer pair per working representation; at most one is populated.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WorkingBuffers {
    pub int16: SampleBufferPair<i16>,
    pub int24: SampleBufferPair<Int24>,
    pub int32: SampleBufferPair<i32>,
    pub float32: SampleBufferPair<f32>,
    pub float64: SampleBufferPair<f64>,
    format: Option<SampleFormat>,
}

impl WorkingBuffers {
    /// Drop everything and size the pair for `format`.
    pub fn allocate(&mut self, format: SampleFormat, frames: usize, outputs: usize, inputs: usize) {
        self.clear();
        match format {
            SampleFormat::Int16 => self.int16.resize(frames, outputs, inputs),
            SampleFormat::Int24 => self.int24.resize(frames, outputs, inputs),
            SampleFormat::Int32 => self.int32.resize(frames, outputs, inputs),
            SampleFormat::Float32 => self.float32.resize(frames, outputs, inputs),
            SampleFormat::Float64 => self.float64.resize(frames, outputs, inputs),
        }
        self.format = Some(format);
    }

    pub fn clear(&mut self) {
        self.int16.clear();
        self.int24.clear();
        self.int32.clear();
        self.float32.clear();
        self.float64.clear();
        self.format = None;
    }

    #[inline]
    pub fn format(&self) -> Option<SampleFormat> {
        self.format
    }

    /// Formats whose pair currently holds any samples.
    pub fn populated(&self) -> Vec<SampleFormat> {
        let mut formats = Vec::new();
        if !self.int16.is_empty() {
            formats.push(SampleFormat::Int16);
        }
        if !self.int24.is_empty() {
            formats.push(SampleFormat::Int24);
        }
        if !self.int32.is_empty() {
            formats.push(SampleFormat::Int32);
        }
        if !self.float32.is_empty() {
            formats.push(SampleFormat::Float32);
        }
        if !self.float64.is_empty() {
            formats.push(SampleFormat::Float64);
        }
        formats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_exactly_one_pair() {
        let mut buffers = WorkingBuffers::default();
        buffers.allocate(SampleFormat::Int16, 256, 4, 2);
        assert_eq!(buffers.populated(), vec![SampleFormat::Int16]);
        assert_eq!(buffers.int16.output.len(), 1024);
        assert_eq!(buffers.int16.input.len(), 512);

        buffers.allocate(SampleFormat::Float64, 64, 2, 0);
        assert_eq!(buffers.populated(), vec![SampleFormat::Float64]);
        assert_eq!(buffers.format(), Some(SampleFormat::Float64));
        assert!(buffers.float64.input.is_empty());

        buffers.clear();
        assert!(buffers.populated().is_empty());
        assert_eq!(buffers.format(), None);
    }
}
