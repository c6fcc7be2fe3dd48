//! Default-input capture through cpal.
//!
//! The cpal stream is built and held on its own thread; the recorder only
//! sees the ringbuf consumer and a stop handle that ends that thread when
//! dropped.

use std::thread;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use crossbeam_channel::{bounded, Sender};
use ringbuf::traits::{Producer, Split};
use ringbuf::{HeapProd, HeapRb};

use crate::error::RecorderError;
use crate::recorder::{CaptureDevice, CaptureStream};

#[derive(Debug, Default)]
pub struct CpalCapture;

impl CpalCapture {
    pub fn new() -> Self {
        Self
    }
}

fn classify(message: String) -> RecorderError {
    let lower = message.to_lowercase();
    if lower.contains("permission") || lower.contains("denied") || lower.contains("not authorized") {
        RecorderError::PermissionDenied
    } else {
        RecorderError::CaptureUnavailable(message)
    }
}

fn build_input_stream(mut producer: HeapProd<f32>) -> Result<(cpal::Stream, usize, u32), RecorderError> {
    let host = cpal::default_host();
    let device = host
        .default_input_device()
        .ok_or_else(|| RecorderError::CaptureUnavailable("no default input device".into()))?;
    let config = device.default_input_config().map_err(|e| classify(e.to_string()))?;

    if config.sample_format() != cpal::SampleFormat::F32 {
        return Err(RecorderError::CaptureUnavailable(format!(
            "unsupported input format {:?}",
            config.sample_format()
        )));
    }

    let channels = config.channels() as usize;
    let sample_rate = config.sample_rate();
    let stream_config: cpal::StreamConfig = config.into();

    let err_fn = |err: cpal::StreamError| {
        let s = err.to_string();
        if !s.contains("overrun") {
            log::warn!("[Capture] Stream error: {}", s);
        }
    };

    let stream = device
        .build_input_stream(
            &stream_config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                // A full queue drops the newest audio; the reader catches up on its next poll.
                let _ = producer.push_slice(data);
            },
            err_fn,
            None,
        )
        .map_err(|e| classify(e.to_string()))?;
    stream.play().map_err(|e| classify(e.to_string()))?;

    Ok((stream, channels, sample_rate))
}

impl CaptureDevice for CpalCapture {
    fn open(&mut self, queue_capacity: usize) -> Result<CaptureStream, RecorderError> {
        let (producer, consumer) = HeapRb::<f32>::new(queue_capacity).split();
        let (ready_tx, ready_rx) = bounded::<Result<(usize, u32), RecorderError>>(1);
        let (stop_tx, stop_rx) = bounded::<()>(1);

        thread::Builder::new()
            .name("loopdeck-capture".into())
            .spawn(move || match build_input_stream(producer) {
                Ok((stream, channels, sample_rate)) => {
                    let _ = ready_tx.send(Ok((channels, sample_rate)));
                    // Runs until the stop handle is dropped.
                    let _ = stop_rx.recv();
                    drop(stream);
                    log::debug!("[Capture] Input stream closed");
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                }
            })
            .map_err(|e| RecorderError::CaptureUnavailable(e.to_string()))?;

        let (channels, sample_rate) = ready_rx
            .recv()
            .map_err(|_| RecorderError::CaptureUnavailable("capture thread exited".into()))??;

        let stop: Sender<()> = stop_tx;
        Ok(CaptureStream {
            consumer,
            channels,
            sample_rate,
            keepalive: Some(Box::new(stop)),
        })
    }
}
