//! Encoding recordings for storage and handing them to an upload target.

use std::io::Cursor;
use std::path::{Path, PathBuf};

use hound::{SampleFormat, WavSpec, WavWriter};

use crate::buffer::AudioBuffer;
use crate::error::{EngineError, EngineResult};

/// Serialize PCM as a RIFF/WAVE payload: 16-bit signed little-endian,
/// interleaved, with the buffer's sample rate and channel count copied verbatim.
pub fn encode_wav(buffer: &AudioBuffer) -> EngineResult<Vec<u8>> {
    let spec = WavSpec {
        channels: buffer.channel_count().max(1) as u16,
        sample_rate: buffer.sample_rate,
        bits_per_sample: 16,
        sample_format: SampleFormat::Int,
    };

    let mut cursor = Cursor::new(Vec::with_capacity(44 + buffer.frames() * buffer.channel_count() * 2));
    {
        let mut writer = WavWriter::new(&mut cursor, spec)?;
        let scale = i16::MAX as f32;
        for i in 0..buffer.frames() {
            for ch in &buffer.channels {
                let quantized = (ch[i] * scale).round().clamp(-(scale + 1.0), scale) as i16;
                writer.write_sample(quantized)?;
            }
        }
        writer.finalize()?;
    }
    Ok(cursor.into_inner())
}

/// Remote storage for encoded recordings. Success or failure is all the engine
/// looks at.
pub trait Uploader {
    fn upload(&self, key: &str, payload: &[u8]) -> Result<(), String>;
}

/// Encode `buffer` and hand it to `uploader` under `key`.
pub fn upload_recording(uploader: &dyn Uploader, key: &str, buffer: &AudioBuffer) -> EngineResult<usize> {
    let payload = encode_wav(buffer)?;
    uploader.upload(key, &payload).map_err(|reason| EngineError::Upload {
        key: key.to_string(),
        reason,
    })?;
    log::info!("[Export] Uploaded {} ({} bytes)", key, payload.len());
    Ok(payload.len())
}

/// Writes payloads as files under a directory, one per key.
pub struct DirectoryUploader {
    root: PathBuf,
}

impl DirectoryUploader {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn path_for(&self, key: &str) -> PathBuf {
        let safe = key.replace(['/', '\\', ':', '*', '?', '"', '<', '>', '|'], "_");
        self.root.join(safe)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl Uploader for DirectoryUploader {
    fn upload(&self, key: &str, payload: &[u8]) -> Result<(), String> {
        std::fs::create_dir_all(&self.root).map_err(|e| e.to_string())?;
        std::fs::write(self.path_for(key), payload).map_err(|e| e.to_string())
    }
}
