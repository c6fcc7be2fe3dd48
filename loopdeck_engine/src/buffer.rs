use std::sync::Arc;

use loopdeck_shared::{SampleId, SampleProvenance};

/// Decoded planar PCM.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioBuffer {
    pub sample_rate: u32,
    /// One `Vec` per channel, all the same length.
    pub channels: Vec<Vec<f32>>,
}

impl AudioBuffer {
    pub fn new(channels: Vec<Vec<f32>>, sample_rate: u32) -> Self {
        Self {
            sample_rate,
            channels,
        }
    }

    pub fn silent(channel_count: usize, frames: usize, sample_rate: u32) -> Self {
        Self {
            sample_rate,
            channels: vec![vec![0.0; frames]; channel_count],
        }
    }

    /// Splits interleaved samples into channels. A trailing partial frame is dropped.
    pub fn from_interleaved(data: &[f32], channel_count: usize, sample_rate: u32) -> Self {
        let channel_count = channel_count.max(1);
        let frames = data.len() / channel_count;
        let mut channels = vec![Vec::with_capacity(frames); channel_count];
        for frame in data.chunks_exact(channel_count) {
            for (ch, &s) in frame.iter().enumerate() {
                channels[ch].push(s);
            }
        }
        Self {
            sample_rate,
            channels,
        }
    }

    pub fn interleaved(&self) -> Vec<f32> {
        let frames = self.frames();
        let mut out = Vec::with_capacity(frames * self.channel_count());
        for i in 0..frames {
            for ch in &self.channels {
                out.push(ch[i]);
            }
        }
        out
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    pub fn frames(&self) -> usize {
        self.channels.first().map_or(0, Vec::len)
    }

    pub fn duration_seconds(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.frames() as f64 / self.sample_rate as f64
    }

    /// Frame range `[start, end]` inclusive, clamped to the buffer.
    pub fn slice_frames(&self, start: usize, end_inclusive: usize) -> Self {
        let frames = self.frames();
        if frames == 0 || start >= frames {
            return Self::silent(self.channel_count(), 0, self.sample_rate);
        }
        let end = end_inclusive.min(frames - 1) + 1;
        Self {
            sample_rate: self.sample_rate,
            channels: self.channels.iter().map(|ch| ch[start..end].to_vec()).collect(),
        }
    }

    pub fn peak(&self) -> f32 {
        self.channels
            .iter()
            .flatten()
            .fold(0.0f32, |max, &s| max.max(s.abs()))
    }
}

/// An immutable, decoded sample shared read-only by the scheduler.
#[derive(Debug, Clone)]
pub struct Sample {
    pub id: SampleId,
    pub filename: String,
    pub provenance: SampleProvenance,
    pub buffer: Arc<AudioBuffer>,
}

impl Sample {
    pub fn new(
        id: SampleId,
        filename: impl Into<String>,
        provenance: SampleProvenance,
        buffer: AudioBuffer,
    ) -> Self {
        Self {
            id,
            filename: filename.into(),
            provenance,
            buffer: Arc::new(buffer),
        }
    }

    pub fn duration_seconds(&self) -> f64 {
        self.buffer.duration_seconds()
    }
}
