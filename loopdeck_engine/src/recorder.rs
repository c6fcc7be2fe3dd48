//! Microphone capture: `Idle -> Recording -> Decoding -> Idle`.
//!
//! The platform callback pushes interleaved f32 into a ringbuf queue; the
//! owner calls [`Recorder::poll`] to drain it into chunks and refresh the
//! level meter. Stopping concatenates the chunks, trims silence, and hands
//! back a [`Sample`].

use std::any::Any;

use loopdeck_shared::{SampleId, SampleProvenance};
use ringbuf::HeapCons;
use ringbuf::traits::{Consumer, Observer};
use serde::{Deserialize, Serialize};

use crate::buffer::{AudioBuffer, Sample};
use crate::error::RecorderError;

/// Silence-trim parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrimConfig {
    /// Absolute amplitude at or above which a frame counts as sound.
    pub threshold: f32,
    /// Consecutive loud frames needed to mark an edge.
    pub min_sound_frames: usize,
}

impl Default for TrimConfig {
    fn default() -> Self {
        Self {
            threshold: 0.01,
            min_sound_frames: 16,
        }
    }
}

/// Trim leading and trailing silence.
///
/// The kept span runs from the start of the first run of `min_sound_frames`
/// loud frames to the end of the last such run, inclusive. A frame is loud
/// when any channel reaches `threshold`. Without a qualifying run the buffer
/// comes back unchanged.
pub fn trim_silence(buffer: &AudioBuffer, config: &TrimConfig) -> AudioBuffer {
    let frames = buffer.frames();
    let run = config.min_sound_frames.max(1);
    if frames < run {
        return buffer.clone();
    }

    let loud = |i: usize| buffer.channels.iter().any(|ch| ch[i].abs() >= config.threshold);

    let mut first = None;
    let mut streak = 0;
    for i in 0..frames {
        streak = if loud(i) { streak + 1 } else { 0 };
        if streak == run {
            first = Some(i + 1 - run);
            break;
        }
    }

    let mut last = None;
    streak = 0;
    for i in (0..frames).rev() {
        streak = if loud(i) { streak + 1 } else { 0 };
        if streak == run {
            last = Some(i + run - 1);
            break;
        }
    }

    match (first, last) {
        (Some(first), Some(last)) if first <= last => buffer.slice_frames(first, last),
        _ => buffer.clone(),
    }
}

/// Latest meter values, both in `0..=1`.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LevelReading {
    pub peak: f32,
    pub rms: f32,
}

/// Windowed peak/RMS over incoming capture frames.
#[derive(Debug, Clone)]
pub struct LevelMeter {
    window_frames: usize,
    frames_seen: usize,
    peak: f32,
    sum_squares: f64,
    reading: LevelReading,
}

impl LevelMeter {
    pub fn new(window_frames: usize) -> Self {
        Self {
            window_frames: window_frames.max(1),
            frames_seen: 0,
            peak: 0.0,
            sum_squares: 0.0,
            reading: LevelReading::default(),
        }
    }

    pub fn reset(&mut self) {
        self.frames_seen = 0;
        self.peak = 0.0;
        self.sum_squares = 0.0;
        self.reading = LevelReading::default();
    }

    /// Feed interleaved samples. Each frame contributes its loudest channel.
    pub fn feed(&mut self, interleaved: &[f32], channels: usize) {
        for frame in interleaved.chunks_exact(channels.max(1)) {
            let level = frame.iter().fold(0.0f32, |m, s| m.max(s.abs())).min(1.0);
            self.peak = self.peak.max(level);
            self.sum_squares += (level as f64) * (level as f64);
            self.frames_seen += 1;

            if self.frames_seen == self.window_frames {
                self.reading = LevelReading {
                    peak: self.peak,
                    rms: (self.sum_squares / self.window_frames as f64).sqrt() as f32,
                };
                self.frames_seen = 0;
                self.peak = 0.0;
                self.sum_squares = 0.0;
            }
        }
    }

    pub fn reading(&self) -> LevelReading {
        self.reading
    }
}

/// An open capture: the consumer side of the device queue plus its format.
pub struct CaptureStream {
    pub consumer: HeapCons<f32>,
    pub channels: usize,
    pub sample_rate: u32,
    /// Platform handle that must outlive the session; dropping it ends capture.
    pub keepalive: Option<Box<dyn Any + Send>>,
}

/// Something that can hand out a live capture stream.
pub trait CaptureDevice {
    fn open(&mut self, queue_capacity: usize) -> Result<CaptureStream, RecorderError>;
}

pub enum RecorderState {
    Idle,
    Recording { chunks: Vec<Vec<f32>>, stream: CaptureStream },
    Decoding,
}

pub struct Recorder {
    state: RecorderState,
    trim: TrimConfig,
    meter: LevelMeter,
    queue_capacity: usize,
}

impl Recorder {
    pub fn new(trim: TrimConfig, meter_window: usize, queue_capacity: usize) -> Self {
        Self {
            state: RecorderState::Idle,
            trim,
            meter: LevelMeter::new(meter_window),
            queue_capacity: queue_capacity.max(1),
        }
    }

    pub fn state(&self) -> &RecorderState {
        &self.state
    }

    pub fn is_recording(&self) -> bool {
        matches!(self.state, RecorderState::Recording { .. })
    }

    pub fn trim_config(&self) -> TrimConfig {
        self.trim
    }

    pub fn set_trim_config(&mut self, trim: TrimConfig) {
        self.trim = trim;
    }

    pub fn level(&self) -> LevelReading {
        self.meter.reading()
    }

    pub fn start_recording(&mut self, device: &mut dyn CaptureDevice) -> Result<(), RecorderError> {
        if !matches!(self.state, RecorderState::Idle) {
            return Err(RecorderError::AlreadyRecording);
        }
        let stream = device.open(self.queue_capacity).inspect_err(|e| {
            log::warn!("[Recorder] Could not start: {}", e);
        })?;
        log::info!(
            "[Recorder] Started ({} ch @ {} Hz)",
            stream.channels,
            stream.sample_rate
        );
        self.meter.reset();
        self.state = RecorderState::Recording {
            chunks: Vec::new(),
            stream,
        };
        Ok(())
    }

    /// Drain whatever the device has queued. Returns the frames taken.
    pub fn poll(&mut self) -> usize {
        let RecorderState::Recording { chunks, stream } = &mut self.state else {
            return 0;
        };
        let mut chunk = Vec::with_capacity(stream.consumer.occupied_len());
        while let Some(sample) = stream.consumer.try_pop() {
            chunk.push(sample);
        }
        if chunk.is_empty() {
            return 0;
        }
        self.meter.feed(&chunk, stream.channels);
        let frames = chunk.len() / stream.channels.max(1);
        chunks.push(chunk);
        frames
    }

    /// Finish the session and turn it into a trimmed sample.
    pub fn stop_recording(&mut self) -> Result<Sample, RecorderError> {
        if !self.is_recording() {
            return Err(RecorderError::NotRecording);
        }
        self.poll();

        let RecorderState::Recording { chunks, stream } =
            std::mem::replace(&mut self.state, RecorderState::Decoding)
        else {
            return Err(RecorderError::NotRecording);
        };
        let CaptureStream {
            channels,
            sample_rate,
            keepalive,
            ..
        } = stream;
        drop(keepalive);

        let interleaved = chunks.concat();
        let result = if interleaved.is_empty() {
            Err(RecorderError::Empty)
        } else {
            let raw = AudioBuffer::from_interleaved(&interleaved, channels.max(1), sample_rate);
            let trimmed = trim_silence(&raw, &self.trim);
            log::info!(
                "[Recorder] Stopped: {} frames captured, {} kept, peak {:.4}",
                raw.frames(),
                trimmed.frames(),
                trimmed.peak()
            );
            let id = SampleId::new();
            Ok(Sample::new(
                id,
                format!("recording-{}.wav", id),
                SampleProvenance::Recording,
                trimmed,
            ))
        };

        self.meter.reset();
        self.state = RecorderState::Idle;
        result
    }

    /// Throw the current session away. Returns false when idle.
    pub fn cancel(&mut self) -> bool {
        if !self.is_recording() {
            return false;
        }
        self.state = RecorderState::Idle;
        self.meter.reset();
        log::info!("[Recorder] Cancelled");
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_silence_is_returned_unchanged() {
        let buf = AudioBuffer::silent(2, 2000, 8_000);
        assert_eq!(trim_silence(&buf, &TrimConfig::default()), buf);
    }

    #[test]
    fn single_loud_sample_trims_to_it() {
        let mut data = vec![0.0; 2000];
        data[1000] = 0.8;
        let buf = AudioBuffer::new(vec![data], 8_000);
        let cfg = TrimConfig {
            threshold: 0.5,
            min_sound_frames: 1,
        };
        let out = trim_silence(&buf, &cfg);
        assert_eq!(out.frames(), 1);
        assert_eq!(out.channels[0][0], 0.8);
    }

    #[test]
    fn short_blips_do_not_count_as_sound() {
        let mut left = vec![0.0; 100];
        let mut right = vec![0.0; 100];
        left[5] = 1.0; // lone click
        for s in &mut right[20..30] {
            *s = -0.5;
        }
        for s in &mut left[60..70] {
            *s = 0.5;
        }
        let buf = AudioBuffer::new(vec![left, right], 8_000);
        let cfg = TrimConfig {
            threshold: 0.1,
            min_sound_frames: 4,
        };
        let out = trim_silence(&buf, &cfg);
        assert_eq!(out.frames(), 50);
        assert_eq!(out.channels[1][0], -0.5);
        assert_eq!(out.channels[0][49], 0.5);
    }

    #[test]
    fn meter_publishes_per_window() {
        let mut meter = LevelMeter::new(4);
        meter.feed(&[0.5, -0.5, 0.5, -0.5], 1);
        let r = meter.reading();
        assert!((r.peak - 0.5).abs() < 1e-6);
        assert!((r.rms - 0.5).abs() < 1e-6);
        meter.feed(&[0.0, 0.0], 1);
        assert_eq!(meter.reading(), r, "partial window keeps last reading");
        meter.feed(&[2.0, 0.0, 0.0, 0.0], 2);
        assert_eq!(meter.reading().peak, 1.0);
    }
}
