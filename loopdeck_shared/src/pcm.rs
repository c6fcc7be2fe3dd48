use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};

use crate::SessionError;

/// Raw planar PCM as stored in a session file.
///
/// Each channel is the little-endian bytes of its `f32` samples, base64 encoded,
/// so a recording reloads bit-exact without passing through a lossy container.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedPcm {
    pub sample_rate: u32,
    pub frame_count: usize,
    pub channels: Vec<String>,
}

impl PersistedPcm {
    pub fn from_channels(channels: &[Vec<f32>], sample_rate: u32) -> Self {
        let frame_count = channels.first().map_or(0, Vec::len);
        let channels = channels
            .iter()
            .map(|ch| {
                let bytes: Vec<u8> = ch.iter().flat_map(|s| s.to_le_bytes()).collect();
                STANDARD.encode(bytes)
            })
            .collect();

        Self {
            sample_rate,
            frame_count,
            channels,
        }
    }

    pub fn to_channels(&self) -> Result<Vec<Vec<f32>>, SessionError> {
        if self.channels.is_empty() {
            return Err(SessionError::NoChannels);
        }

        let mut out = Vec::with_capacity(self.channels.len());
        for (channel, encoded) in self.channels.iter().enumerate() {
            let bytes = STANDARD
                .decode(encoded)
                .map_err(|source| SessionError::Base64 { channel, source })?;
            if bytes.len() % 4 != 0 {
                return Err(SessionError::Truncated(channel));
            }
            let samples: Vec<f32> = bytes
                .chunks_exact(4)
                .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
                .collect();
            if samples.len() != self.frame_count {
                return Err(SessionError::FrameCountMismatch {
                    channel,
                    expected: self.frame_count,
                    found: samples.len(),
                });
            }
            out.push(samples);
        }
        Ok(out)
    }
}
