use rubato::{Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction};

use crate::buffer::AudioBuffer;
use crate::error::{EngineError, EngineResult};

pub struct LoopResampler;

impl LoopResampler {
    /// Converts `input` to `target_rate` with sinc interpolation.
    /// The output is aligned (resampler delay removed) and sized to
    /// `round(frames * target / source)`.
    pub fn resample(input: &AudioBuffer, target_rate: u32) -> EngineResult<AudioBuffer> {
        if input.sample_rate == target_rate || input.frames() == 0 {
            return Ok(AudioBuffer::new(input.channels.clone(), target_rate));
        }
        if input.sample_rate == 0 || target_rate == 0 {
            return Err(EngineError::Resample("sample rate must be positive".into()));
        }

        let ratio = target_rate as f64 / input.sample_rate as f64;
        let channels = input.channel_count();
        let chunk_size = 1024;

        let params = SincInterpolationParameters {
            sinc_len: 256,
            f_cutoff: 0.95,
            interpolation: SincInterpolationType::Linear,
            oversampling_factor: 128,
            window: WindowFunction::BlackmanHarris2,
        };

        let mut resampler = SincFixedIn::<f32>::new(ratio, 1.0, params, chunk_size, channels)
            .map_err(|e| EngineError::Resample(e.to_string()))?;

        let expected = (input.frames() as f64 * ratio).round() as usize;
        let delay = resampler.output_delay();
        let mut output: Vec<Vec<f32>> = vec![Vec::with_capacity(expected + delay + chunk_size); channels];

        let mut pos = 0;
        // Keep feeding (zero padded past the end) until the delayed tail is out.
        while output[0].len() < expected + delay {
            let waves: Vec<Vec<f32>> = input
                .channels
                .iter()
                .map(|ch| {
                    let end = (pos + chunk_size).min(ch.len());
                    let mut chunk = if pos < ch.len() { ch[pos..end].to_vec() } else { Vec::new() };
                    chunk.resize(chunk_size, 0.0);
                    chunk
                })
                .collect();

            let out_waves = resampler
                .process(&waves, None)
                .map_err(|e| EngineError::Resample(e.to_string()))?;
            for (dst, src) in output.iter_mut().zip(out_waves) {
                dst.extend_from_slice(&src);
            }
            pos += chunk_size;
        }

        let channels = output
            .into_iter()
            .map(|ch| ch[delay..delay + expected].to_vec())
            .collect();
        Ok(AudioBuffer::new(channels, target_rate))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_rate_is_passthrough() {
        let buf = AudioBuffer::new(vec![vec![0.1, 0.2, 0.3]], 44_100);
        let out = LoopResampler::resample(&buf, 44_100).unwrap();
        assert_eq!(out, buf);
    }

    #[test]
    fn length_and_rate_follow_ratio() {
        let frames = 4_410;
        let tone: Vec<f32> = (0..frames)
            .map(|i| (i as f32 * 440.0 * std::f32::consts::TAU / 44_100.0).sin() * 0.5)
            .collect();
        let buf = AudioBuffer::new(vec![tone.clone(), tone], 44_100);
        let out = LoopResampler::resample(&buf, 48_000).unwrap();
        assert_eq!(out.sample_rate, 48_000);
        assert_eq!(out.channel_count(), 2);
        assert_eq!(out.frames(), 4_800);
        let peak = out.peak();
        assert!(peak > 0.4 && peak < 0.6, "peak {peak}");
    }
}
