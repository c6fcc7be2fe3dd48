//! WAV decoding into context-rate PCM.

use std::io::{Cursor, Read};
use std::path::Path;

use crate::buffer::AudioBuffer;
use crate::error::{EngineError, EngineResult};
use crate::resampler::LoopResampler;

fn decode_reader<R: Read>(reader: hound::WavReader<R>) -> EngineResult<AudioBuffer> {
    let spec = reader.spec();
    if spec.channels == 0 {
        return Err(EngineError::Decode("WAV declares zero channels".into()));
    }

    let samples: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Float => reader.into_samples::<f32>().collect::<Result<Vec<_>, _>>()?,
        hound::SampleFormat::Int => {
            let max_val = 2.0_f32.powi(spec.bits_per_sample as i32 - 1);
            reader
                .into_samples::<i32>()
                .map(|s| s.map(|x| x as f32 / max_val))
                .collect::<Result<Vec<_>, _>>()?
        }
    };

    Ok(AudioBuffer::from_interleaved(&samples, spec.channels as usize, spec.sample_rate))
}

/// Decode WAV bytes at their native rate.
pub fn decode_wav(bytes: &[u8]) -> EngineResult<AudioBuffer> {
    decode_reader(hound::WavReader::new(Cursor::new(bytes))?)
}

pub fn decode_wav_file(path: &Path) -> EngineResult<AudioBuffer> {
    decode_reader(hound::WavReader::open(path)?)
}

/// Decode and convert to the playback rate, the way a browser's decoder hands
/// back buffers already at the context rate.
pub fn decode_for_context(bytes: &[u8], context_rate: u32) -> EngineResult<AudioBuffer> {
    let decoded = decode_wav(bytes)?;
    LoopResampler::resample(&decoded, context_rate)
}

pub fn decode_file_for_context(path: &Path, context_rate: u32) -> EngineResult<AudioBuffer> {
    let decoded = decode_wav_file(path)?;
    LoopResampler::resample(&decoded, context_rate)
}
