//! Output device driver. The engine is moved into the cpal callback and is
//! only reached through [`EngineCommand`]s from then on.

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use crossbeam_channel::{Receiver, Sender};

use crate::assets::SharedPool;
use crate::commands::EngineCommand;
use crate::config::EngineConfig;
use crate::engine::LoopEngine;
use crate::transport::LoopBoundary;

pub struct OutputHandle {
    _stream: cpal::Stream,
    pub sample_rate: u32,
    pub channels: usize,
}

/// Open the default output device and start rendering.
///
/// Loop boundaries are forwarded on `boundary_tx`; a full or closed channel
/// drops them.
pub fn start_output(
    config: &EngineConfig,
    pool: SharedPool,
    command_rx: Receiver<EngineCommand>,
    boundary_tx: Sender<LoopBoundary>,
) -> anyhow::Result<OutputHandle> {
    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or(anyhow::anyhow!("No output device available"))?;
    let supported = device.default_output_config()?;

    let sample_rate = supported.sample_rate();
    let channels = supported.channels() as usize;
    let sample_format = supported.sample_format();

    if let cpal::SupportedBufferSize::Range { min, max } = supported.buffer_size() {
        log::debug!("[Output] Device buffer range: {}-{}", min, max);
    }

    let mut stream_config: cpal::StreamConfig = supported.into();
    stream_config.buffer_size = cpal::BufferSize::Fixed(config.block_size);
    log::info!("[Output] Using config: {:?}", stream_config);

    let mut engine = LoopEngine::new(sample_rate, config, pool);
    // Loop buffers are never built inside the callback.
    engine.set_background_builds(true);
    engine.set_loop_listener(Box::new(move |boundary| {
        let _ = boundary_tx.try_send(boundary);
    }));

    let err_fn = |err: cpal::StreamError| {
        let s = err.to_string();
        if !s.contains("underrun") && !s.contains("overrun") {
            log::warn!("[Output] Stream error: {}", s);
        }
    };

    let stream = match sample_format {
        cpal::SampleFormat::F32 => device.build_output_stream(
            &stream_config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                while let Ok(cmd) = command_rx.try_recv() {
                    engine.handle_command(cmd);
                }
                engine.render(data, channels);
            },
            err_fn,
            None,
        )?,
        other => return Err(anyhow::anyhow!("Unsupported sample format {:?}", other)),
    };

    stream.play()?;

    Ok(OutputHandle {
        _stream: stream,
        sample_rate,
        channels,
    })
}
