//! Audio output backends.
//!
//! A backend receives an [`EngineSpec`], builds the engine once it knows the
//! device's sample rate, and calls it for every block. [`CpalOutput`] plays
//! through the default output device; [`OfflineOutput`] hands the blocks to
//! the caller, for rendering to a file and for tests.

use crate::engine::{EngineSpec, SonificationEngine};
use crate::error::DeviceError;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{FromSample, Sample, SizedSample};
use log::{info, warn};
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, PoisonError,
    },
    time::Instant,
};

/// Sample rate and channel count of an opened output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutputFormat {
    /// Frames per second
    pub sample_rate: u32,
    /// Interleaved channels per frame
    pub channels: u16,
}

/// Where a backend reports that its stream died.
///
/// Raised from the backend's error callback. The pending error is taken by
/// whoever aborts the session; the tripped flag stays set until the output
/// has been reopened.
#[derive(Debug, Default)]
pub struct DeviceFault {
    raised: AtomicBool,
    tripped: AtomicBool,
    error: Mutex<Option<DeviceError>>,
}

impl DeviceFault {
    /// Records `error`. The first error wins until it is taken.
    pub fn raise(&self, error: DeviceError) {
        let mut slot = self.error.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_none() {
            *slot = Some(error);
        }
        self.tripped.store(true, Ordering::Release);
        self.raised.store(true, Ordering::Release);
    }

    /// Takes the pending error, if any.
    pub fn take(&self) -> Option<DeviceError> {
        if !self.raised.swap(false, Ordering::AcqRel) {
            return None;
        }
        self.error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// Whether the stream has failed since the last [`DeviceFault::reset`].
    pub fn has_tripped(&self) -> bool {
        self.tripped.load(Ordering::Acquire)
    }

    /// Clears everything, for a freshly opened stream.
    pub fn reset(&self) {
        self.error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        self.raised.store(false, Ordering::Release);
        self.tripped.store(false, Ordering::Release);
    }
}

/// Something that can play what a [`SonificationEngine`] renders.
pub trait AudioOutput {
    /// Opens the output and starts pulling blocks from a new engine.
    /// Errors after this returns are reported through `fault`.
    fn open(
        &mut self,
        spec: EngineSpec,
        fault: Arc<DeviceFault>,
    ) -> Result<OutputFormat, DeviceError>;

    /// Whether a stream is currently open.
    fn is_open(&self) -> bool;

    /// Stops and releases the stream.
    fn close(&mut self);
}

/// Plays through the host's default output device.
pub struct CpalOutput {
    block_frames: u32,
    stream: Option<cpal::Stream>,
}

impl CpalOutput {
    /// An output that asks the device for blocks of `block_frames` frames,
    /// falling back to the device's own block size if that is refused.
    pub fn new(block_frames: u32) -> Self {
        Self {
            block_frames,
            stream: None,
        }
    }
}

impl AudioOutput for CpalOutput {
    fn open(
        &mut self,
        spec: EngineSpec,
        fault: Arc<DeviceFault>,
    ) -> Result<OutputFormat, DeviceError> {
        self.close();

        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .ok_or(DeviceError::NoOutputDevice)?;
        let supported = device
            .default_output_config()
            .map_err(|e| DeviceError::DefaultConfig(e.to_string()))?;
        let sample_format = supported.sample_format();
        let base: cpal::StreamConfig = supported.into();
        let format = OutputFormat {
            sample_rate: base.sample_rate.0,
            channels: base.channels,
        };

        let attempt = |buffer_size| {
            let config = cpal::StreamConfig {
                buffer_size,
                ..base.clone()
            };
            let engine = spec.clone().build(format.sample_rate);
            build_for_format(&device, &config, sample_format, engine, Arc::clone(&fault))
        };
        let stream = match attempt(cpal::BufferSize::Fixed(self.block_frames)) {
            Ok(stream) => stream,
            Err(DeviceError::BuildStream(reason)) => {
                warn!(
                    "Device refused {}-frame blocks ({}), using its default",
                    self.block_frames, reason
                );
                attempt(cpal::BufferSize::Default)?
            }
            Err(e) => return Err(e),
        };
        stream
            .play()
            .map_err(|e| DeviceError::PlayStream(e.to_string()))?;

        info!(
            "Audio output open: {} Hz, {} channel(s), {}",
            format.sample_rate, format.channels, sample_format
        );
        self.stream = Some(stream);
        Ok(format)
    }

    fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    fn close(&mut self) {
        if self.stream.take().is_some() {
            info!("Audio output closed");
        }
    }
}

fn build_for_format(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    sample_format: cpal::SampleFormat,
    engine: SonificationEngine,
    fault: Arc<DeviceFault>,
) -> Result<cpal::Stream, DeviceError> {
    match sample_format {
        cpal::SampleFormat::F32 => build_stream::<f32>(device, config, engine, fault),
        cpal::SampleFormat::I16 => build_stream::<i16>(device, config, engine, fault),
        cpal::SampleFormat::U16 => build_stream::<u16>(device, config, engine, fault),
        other => Err(DeviceError::UnsupportedSampleFormat(other.to_string())),
    }
}

// Frames rendered per pass; device blocks larger than this are rendered in pieces
const SCRATCH_FRAMES: usize = 4096;

fn build_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    mut engine: SonificationEngine,
    fault: Arc<DeviceFault>,
) -> Result<cpal::Stream, DeviceError>
where
    T: SizedSample + FromSample<f32>,
{
    let channels = (config.channels as usize).max(1);
    let mut scratch = vec![0.0f32; SCRATCH_FRAMES * channels];

    device
        .build_output_stream(
            config,
            move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                let now = Instant::now();
                for chunk in data.chunks_mut(scratch.len()) {
                    let rendered = &mut scratch[..chunk.len()];
                    engine.render(rendered, channels, now);
                    for (out, &sample) in chunk.iter_mut().zip(rendered.iter()) {
                        *out = T::from_sample(sample);
                    }
                }
            },
            move |err| fault.raise(DeviceError::StreamLost(err.to_string())),
            None,
        )
        .map_err(|e| DeviceError::BuildStream(e.to_string()))
}

/// An output driven by the caller, one block at a time.
pub struct OfflineOutput {
    format: OutputFormat,
    available: bool,
    engine: Option<SonificationEngine>,
    fault: Option<Arc<DeviceFault>>,
    seed: Option<u64>,
}

impl OfflineOutput {
    /// An output with the given format.
    pub fn new(format: OutputFormat) -> Self {
        Self {
            format,
            available: true,
            engine: None,
            fault: None,
            seed: None,
        }
    }

    /// Seeds the engine's noise source for reproducible output.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// An output whose `open` always fails, like a machine with no sound card.
    pub fn unavailable(format: OutputFormat) -> Self {
        Self {
            available: false,
            ..Self::new(format)
        }
    }

    /// The format blocks are rendered in.
    pub fn format(&self) -> OutputFormat {
        self.format
    }

    /// Renders one interleaved block at `now`. Returns `false`, leaving `out`
    /// silent, when the output is not open.
    pub fn render(&mut self, out: &mut [f32], now: Instant) -> bool {
        match self.engine.as_mut() {
            Some(engine) => {
                engine.render(out, self.format.channels as usize, now);
                true
            }
            None => {
                out.fill(0.0);
                false
            }
        }
    }

    /// The running engine, if open.
    pub fn engine(&self) -> Option<&SonificationEngine> {
        self.engine.as_ref()
    }

    /// Simulates the device disappearing mid-stream.
    pub fn lose(&mut self, reason: &str) {
        if let Some(fault) = self.fault.take() {
            fault.raise(DeviceError::StreamLost(reason.to_string()));
        }
        self.engine = None;
    }
}

impl AudioOutput for OfflineOutput {
    fn open(
        &mut self,
        spec: EngineSpec,
        fault: Arc<DeviceFault>,
    ) -> Result<OutputFormat, DeviceError> {
        if !self.available {
            return Err(DeviceError::NoOutputDevice);
        }
        let engine = match self.seed {
            Some(seed) => SonificationEngine::with_seed(
                self.format.sample_rate,
                spec.tuning,
                spec.force,
                spec.arm,
                seed,
            ),
            None => spec.build(self.format.sample_rate),
        };
        self.engine = Some(engine);
        self.fault = Some(fault);
        Ok(self.format)
    }

    fn is_open(&self) -> bool {
        self.engine.is_some()
    }

    fn close(&mut self) {
        self.engine = None;
        self.fault = None;
    }
}
