//! Tone playback on the default output device via cpal.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use cpal::StreamConfig;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use tracing::{debug, error};

use crate::delivery::sensory::Tone;
use crate::error::{NotifyError, NotifyResult};

pub const TONE_SAMPLE_RATE: u32 = 48_000;

/// Samples handed to the output callback, with a cursor.
struct PlaybackBuffer {
    samples: Vec<f32>,
    position: usize,
    finished: bool,
}

impl PlaybackBuffer {
    fn new(samples: Vec<f32>) -> Self {
        Self {
            samples,
            position: 0,
            finished: false,
        }
    }

    /// Copy the next samples into `data`, padding with silence once exhausted.
    fn fill(&mut self, data: &mut [f32]) {
        for sample in data.iter_mut() {
            if self.position < self.samples.len() {
                *sample = self.samples[self.position];
                self.position += 1;
            } else {
                *sample = 0.0;
                self.finished = true;
            }
        }
    }
}

/// Play `tone` to completion. Blocks the calling thread.
pub fn play_blocking(tone: &Tone) -> NotifyResult<()> {
    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or_else(|| NotifyError::ChannelUnsupported("no default output device".into()))?;

    let stream_config = StreamConfig {
        channels: 1,
        sample_rate: TONE_SAMPLE_RATE,
        buffer_size: cpal::BufferSize::Default,
    };

    let buffer = Arc::new(Mutex::new(PlaybackBuffer::new(tone.render(TONE_SAMPLE_RATE))));
    let callback_buffer = Arc::clone(&buffer);
    let stream = device
        .build_output_stream(
            &stream_config,
            move |data: &mut [f32], _info: &cpal::OutputCallbackInfo| {
                callback_buffer
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .fill(data);
            },
            move |err| {
                error!(error = %err, "audio output stream error");
            },
            None,
        )
        .map_err(|err| NotifyError::RenderFailure(format!("failed to build output stream: {err}")))?;
    stream
        .play()
        .map_err(|err| NotifyError::RenderFailure(format!("failed to start output stream: {err}")))?;

    // Give up one second past the tone's length.
    let deadline = Duration::from_secs_f32(tone.duration_secs) + Duration::from_secs(1);
    let step = Duration::from_millis(10);
    let mut waited = Duration::ZERO;
    while waited < deadline {
        std::thread::sleep(step);
        waited += step;
        if buffer.lock().unwrap_or_else(PoisonError::into_inner).finished {
            break;
        }
    }

    drop(stream);
    debug!(duration_secs = tone.duration_secs, "alert tone played");
    Ok(())
}

/// Play `tone` on its own thread; `fallback` runs there if the device cannot play it.
pub fn play_detached(
    tone: Tone,
    fallback: impl FnOnce() + Send + 'static,
) -> NotifyResult<()> {
    std::thread::Builder::new()
        .name("due-notify-tone".into())
        .spawn(move || {
            if let Err(err) = play_blocking(&tone) {
                debug!(error = %err, "speaker unavailable, falling back");
                fallback();
            }
        })
        .map(|_| ())
        .map_err(|err| NotifyError::RenderFailure(format!("failed to start tone thread: {err}")))
}
