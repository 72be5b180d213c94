//! Microphone capture via cpal
//!
//! Captured PCM is resampled to 48 kHz mono and kept in a ring buffer,
//! frame by frame, for the encoder in front of the outgoing audio track.

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, SampleFormat, Stream, StreamConfig, SupportedStreamConfigRange};
use parking_lot::Mutex;
use ringbuf::{traits::*, HeapRb};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;

// ============================================================================
// CONSTANTS
// ============================================================================

/// Sample rate of the outgoing audio track
pub const SAMPLE_RATE: u32 = 48000;

/// Mono for voice
pub const CHANNELS: u16 = 1;

/// 20ms @ 48kHz
pub const FRAME_SIZE: usize = 960;

const RING_BUFFER_SIZE: usize = FRAME_SIZE * 10;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum AudioError {
    #[error("No audio input device found")]
    NoInputDevice,

    #[error("Unsupported audio configuration: {0}")]
    UnsupportedConfig(String),

    #[error("Failed to build audio stream: {0}")]
    StreamBuildError(String),

    #[error("Failed to start audio stream: {0}")]
    StreamPlayError(String),
}

// ============================================================================
// MICROPHONE CAPTURE
// ============================================================================

/// Open microphone stream. Dropping it releases the device.
pub struct MicrophoneCapture {
    _stream: Stream,
    capture_buffer: Arc<Mutex<HeapRb<f32>>>,
    input_level: Arc<Mutex<f32>>,
}

// cpal streams are not Send; the capture is only ever moved between
// threads as a whole and dropped once
unsafe impl Send for MicrophoneCapture {}

impl MicrophoneCapture {
    /// Opens the default input device. While `enabled` is false the level
    /// meter keeps running but no samples are buffered.
    pub fn open(enabled: Arc<AtomicBool>) -> Result<Self, AudioError> {
        let host = cpal::default_host();
        let device = host.default_input_device().ok_or(AudioError::NoInputDevice)?;
        let config = Self::find_best_input_config(&device)?;

        tracing::info!(
            "Starting audio capture: {} Hz, {} channels",
            config.sample_rate.0,
            config.channels
        );

        let capture_buffer = Arc::new(Mutex::new(HeapRb::new(RING_BUFFER_SIZE)));
        let input_level = Arc::new(Mutex::new(0.0));

        let buffer = Arc::clone(&capture_buffer);
        let level = Arc::clone(&input_level);
        let source_rate = config.sample_rate.0;
        let channels = config.channels as usize;

        let stream = device
            .build_input_stream(
                &config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    if data.is_empty() {
                        return;
                    }
                    let rms = (data.iter().map(|s| s * s).sum::<f32>() / data.len() as f32).sqrt();
                    *level.lock() = rms.min(1.0);

                    if !enabled.load(Ordering::Relaxed) {
                        return;
                    }

                    let mono = downmix(data, channels);
                    let samples = resample_linear(&mono, source_rate, SAMPLE_RATE);
                    let mut buffer = buffer.lock();
                    for sample in samples {
                        let _ = buffer.try_push(sample);
                    }
                },
                |err| {
                    tracing::error!("Audio capture error: {}", err);
                },
                None,
            )
            .map_err(|e| AudioError::StreamBuildError(e.to_string()))?;

        stream
            .play()
            .map_err(|e| AudioError::StreamPlayError(e.to_string()))?;

        Ok(Self {
            _stream: stream,
            capture_buffer,
            input_level,
        })
    }

    /// Next 20ms frame, once enough samples are buffered
    pub fn read_frame(&self) -> Option<Vec<f32>> {
        let mut buffer = self.capture_buffer.lock();
        if buffer.occupied_len() < FRAME_SIZE {
            return None;
        }
        Some((0..FRAME_SIZE).filter_map(|_| buffer.try_pop()).collect())
    }

    /// RMS input level (0.0 - 1.0)
    pub fn level(&self) -> f32 {
        *self.input_level.lock()
    }

    fn find_best_input_config(device: &Device) -> Result<StreamConfig, AudioError> {
        let configs = device
            .supported_input_configs()
            .map_err(|e| AudioError::UnsupportedConfig(e.to_string()))?;

        select_best_config(configs.collect())
    }
}

impl std::fmt::Debug for MicrophoneCapture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MicrophoneCapture")
            .field("level", &self.level())
            .finish()
    }
}

/// Averages interleaved channels into one
fn downmix(data: &[f32], channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return data.to_vec();
    }
    data.chunks(channels)
        .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
        .collect()
}

fn resample_linear(data: &[f32], source_rate: u32, target_rate: u32) -> Vec<f32> {
    if source_rate == target_rate {
        return data.to_vec();
    }
    let ratio = target_rate as f32 / source_rate as f32;
    let new_len = (data.len() as f32 * ratio) as usize;
    (0..new_len)
        .map(|i| {
            let src_idx = i as f32 / ratio;
            let idx = src_idx as usize;
            let frac = src_idx - idx as f32;
            let s1 = data.get(idx).copied().unwrap_or(0.0);
            let s2 = data.get(idx + 1).copied().unwrap_or(s1);
            s1 + (s2 - s1) * frac
        })
        .collect()
}

/// 48kHz F32 if offered, then any F32 range, then whatever comes first
fn select_best_config(
    configs: Vec<SupportedStreamConfigRange>,
) -> Result<StreamConfig, AudioError> {
    let target_rate = cpal::SampleRate(SAMPLE_RATE);
    let covers_target = |c: &SupportedStreamConfigRange| {
        c.min_sample_rate() <= target_rate && c.max_sample_rate() >= target_rate
    };

    if let Some(config) = configs
        .iter()
        .find(|c| covers_target(*c) && c.sample_format() == SampleFormat::F32)
    {
        return Ok(config.clone().with_sample_rate(target_rate).into());
    }

    if let Some(config) = configs.iter().find(|c| c.sample_format() == SampleFormat::F32) {
        return Ok(config.clone().with_max_sample_rate().into());
    }

    configs
        .first()
        .map(|c| c.clone().with_max_sample_rate().into())
        .ok_or_else(|| {
            AudioError::UnsupportedConfig("No suitable audio configuration found".to_string())
        })
}
