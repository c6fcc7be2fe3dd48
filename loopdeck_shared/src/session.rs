use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::{
    PersistedPcm, SampleId, SampleProvenance, HIGH_PASS_OPEN_HZ, LOW_PASS_OPEN_HZ, MAX_BEATS_PER_LOOP, MAX_BPM,
    MIN_BEATS_PER_LOOP, MIN_BPM,
};

/// Global tempo settings for a session.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LoopSettings {
    pub bpm: f32,
    pub beats_per_loop: u32,
}

impl Default for LoopSettings {
    fn default() -> Self {
        Self {
            bpm: 120.0,
            beats_per_loop: 4,
        }
    }
}

impl LoopSettings {
    /// Builds settings with both fields clamped into the supported ranges.
    pub fn new(bpm: f32, beats_per_loop: u32) -> Self {
        Self {
            bpm: bpm.clamp(MIN_BPM, MAX_BPM),
            beats_per_loop: beats_per_loop.clamp(MIN_BEATS_PER_LOOP, MAX_BEATS_PER_LOOP),
        }
    }

    pub fn clamped(self) -> Self {
        Self::new(self.bpm, self.beats_per_loop)
    }

    /// Seconds in one loop cycle: `(60 / bpm) * beats_per_loop`.
    pub fn loop_duration(&self) -> f64 {
        (60.0 / self.bpm as f64) * self.beats_per_loop as f64
    }
}

/// A sample assigned to a track at a fractional offset within the loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlacedSample {
    pub sample_id: SampleId,
    pub filename: String,
    /// Track ids start at 1.
    pub track_id: u32,
    /// Offset within one cycle in `[0, 1)`. `None` means unplaced.
    pub x_pos: Option<f64>,
}

impl PlacedSample {
    pub fn new(sample_id: SampleId, filename: impl Into<String>, track_id: u32, x_pos: f64) -> Self {
        Self {
            sample_id,
            filename: filename.into(),
            track_id,
            x_pos: Some(x_pos),
        }
    }

    /// The offset when the sample is placed and schedulable.
    pub fn offset(&self) -> Option<f64> {
        match self.x_pos {
            Some(x) if x.is_finite() && (0.0..1.0).contains(&x) && self.track_id >= 1 => Some(x),
            _ => None,
        }
    }

    pub fn move_to(&mut self, x_pos: f64) {
        self.x_pos = Some(x_pos.clamp(0.0, 1.0 - f64::EPSILON));
    }
}

/// Mixer state of a single track.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrackAudioState {
    pub gain: f32,
    pub pan: f32,
    pub low_pass_hz: f32,
    pub high_pass_hz: f32,
    pub low_pass_bypassed: bool,
    pub high_pass_bypassed: bool,
}

impl Default for TrackAudioState {
    fn default() -> Self {
        Self {
            gain: 1.0,
            pan: 0.0,
            low_pass_hz: LOW_PASS_OPEN_HZ,
            high_pass_hz: HIGH_PASS_OPEN_HZ,
            low_pass_bypassed: false,
            high_pass_bypassed: false,
        }
    }
}

/// A recorded sample kept inside a saved session as raw PCM.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedRecording {
    pub sample_id: SampleId,
    pub filename: String,
    pub pcm: PersistedPcm,
}

/// A file or remote sample the session uses. Only its origin is saved; the
/// audio is loaded again under the same id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedSource {
    pub sample_id: SampleId,
    pub filename: String,
    pub provenance: SampleProvenance,
}

/// Everything needed to save and reload a session.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub bpm: f32,
    pub beats_per_loop: u32,
    #[serde(default)]
    pub tracks: BTreeMap<u32, TrackAudioState>,
    pub placed_samples: Vec<PlacedSample>,
    #[serde(default)]
    pub recordings: Vec<PersistedRecording>,
    #[serde(default)]
    pub sources: Vec<PersistedSource>,
}

impl SessionSnapshot {
    pub fn settings(&self) -> LoopSettings {
        LoopSettings::new(self.bpm, self.beats_per_loop)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loop_duration_follows_tempo() {
        assert_eq!(LoopSettings::new(120.0, 4).loop_duration(), 2.0);
        assert_eq!(LoopSettings::new(60.0, 16).loop_duration(), 16.0);
        assert_eq!(LoopSettings::new(200.0, 4).loop_duration(), 1.2);
    }

    #[test]
    fn settings_are_clamped() {
        let s = LoopSettings::new(500.0, 2);
        assert_eq!(s.bpm, MAX_BPM);
        assert_eq!(s.beats_per_loop, MIN_BEATS_PER_LOOP);
        let s = LoopSettings::new(10.0, 64);
        assert_eq!(s.bpm, MIN_BPM);
        assert_eq!(s.beats_per_loop, MAX_BEATS_PER_LOOP);
    }

    #[test]
    fn unplaced_and_out_of_range_have_no_offset() {
        let mut p = PlacedSample::new(SampleId::new(), "kick.wav", 1, 0.25);
        assert_eq!(p.offset(), Some(0.25));
        p.x_pos = None;
        assert_eq!(p.offset(), None);
        p.x_pos = Some(1.0);
        assert_eq!(p.offset(), None);
        p.x_pos = Some(0.5);
        p.track_id = 0;
        assert_eq!(p.offset(), None);
    }

    #[test]
    fn snapshot_json_keeps_tracks() {
        let mut snap = SessionSnapshot {
            bpm: 90.0,
            beats_per_loop: 8,
            ..Default::default()
        };
        snap.tracks.insert(2, TrackAudioState { gain: 0.5, ..Default::default() });
        let snare = SampleId::new();
        snap.placed_samples.push(PlacedSample::new(snare, "snare.wav", 2, 0.5));
        snap.sources.push(PersistedSource {
            sample_id: snare,
            filename: "snare.wav".into(),
            provenance: SampleProvenance::Static {
                path: "kit/snare.wav".into(),
            },
        });

        let json = serde_json::to_string(&snap).unwrap();
        let back: SessionSnapshot = serde_json::from_str(&json).unwrap();
        assert_eq!(back, snap);
        assert_eq!(back.settings().loop_duration(), (60.0 / 90.0) * 8.0);
    }
}
