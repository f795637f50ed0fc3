//! Headless sessions: a simulated lifter pulls on a simulated load cell while
//! the real protocol machine and engine run on a virtual clock, and the audio
//! goes to a WAV file instead of a device.

use crate::config::SessionFile;
use crate::error::SessionError;
use crate::force::ForceSample;
use crate::output::{OfflineOutput, OutputFormat};
use crate::protocol::ProtocolState;
use crate::session::SessionController;
use hound::{SampleFormat, WavSpec, WavWriter};
use log::info;
use rand::{rngs::SmallRng, Rng, SeedableRng};
use std::{
    f32::consts::TAU,
    io::{Seek, Write},
    path::Path,
    time::{Duration, Instant},
};

/// A stretch of session time during which the sensor says nothing.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Dropout {
    /// Offset from the start of the session
    pub start: Duration,
    /// How long the sensor stays quiet
    pub length: Duration,
}

impl Dropout {
    fn covers(&self, t: Duration) -> bool {
        t >= self.start && t < self.start.saturating_add(self.length)
    }
}

/// How to run an offline session.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RenderPlan {
    /// Output sample rate
    pub sample_rate: u32,
    /// Output channels
    pub channels: u16,
    /// Frames rendered per block
    pub block_frames: usize,
    /// Simulated sensor readings per second
    pub sensor_rate_hz: f32,
    /// Optional sensor silence
    pub dropout: Option<Dropout>,
    /// Seed for the lifter's tremor and the engine's noise
    pub seed: u64,
}

impl Default for RenderPlan {
    fn default() -> Self {
        Self {
            sample_rate: 48_000,
            channels: 1,
            block_frames: 200,
            sensor_rate_hz: 80.0,
            dropout: None,
            seed: 0,
        }
    }
}

/// What an offline session did.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderSummary {
    /// Frames written per channel
    pub frames: u64,
    /// Sets finished
    pub completed_sets: u32,
    /// Every state entered, with its offset into the session
    pub transitions: Vec<(Duration, ProtocolState)>,
}

impl RenderSummary {
    /// Length of the rendered audio.
    pub fn duration(&self, sample_rate: u32) -> Duration {
        frames_to_duration(self.frames, sample_rate)
    }
}

/// Somebody pulling on the load cell: reaches for the target when a work
/// interval starts, holds it with a slow wobble and a little tremor, and lets
/// go otherwise.
#[derive(Debug)]
pub struct SimulatedLifter {
    target: f32,
    wobble: f32,
    reach: Duration,
    working_since: Option<Duration>,
    rng: SmallRng,
}

impl SimulatedLifter {
    /// A lifter aiming for `target`, drifting up to `wobble` either side.
    pub fn new(target: f32, wobble: f32, seed: u64) -> Self {
        Self {
            target,
            wobble,
            reach: Duration::from_millis(400),
            working_since: None,
            rng: SmallRng::seed_from_u64(seed),
        }
    }

    /// Load at session time `t` in protocol state `state`.
    pub fn load(&mut self, state: ProtocolState, t: Duration) -> f32 {
        let tremor = self.rng.gen_range(-0.05f32..0.05);
        if !state.is_armed() {
            self.working_since = None;
            return tremor.abs();
        }

        let since = t.saturating_sub(*self.working_since.get_or_insert(t));
        let reach = (since.as_secs_f32() / self.reach.as_secs_f32()).min(1.0);
        let drift = (since.as_secs_f32() * 0.7 * TAU).sin() * self.wobble;
        reach * (self.target + drift) + tremor
    }
}

fn frames_to_duration(frames: u64, sample_rate: u32) -> Duration {
    Duration::from_nanos((frames as u128 * 1_000_000_000 / sample_rate.max(1) as u128) as u64)
}

/// Runs one whole session from `file` and writes its audio to `path`.
pub fn render_session(
    file: SessionFile,
    plan: &RenderPlan,
    path: impl AsRef<Path>,
) -> Result<RenderSummary, SessionError> {
    let spec = wav_spec(plan);
    let writer = WavWriter::create(path.as_ref(), spec)?;
    let summary = render_into(file, plan, writer)?;
    info!(
        "Rendered {:.1} s to {}",
        summary.duration(plan.sample_rate).as_secs_f32(),
        path.as_ref().display()
    );
    Ok(summary)
}

fn wav_spec(plan: &RenderPlan) -> WavSpec {
    WavSpec {
        channels: plan.channels.max(1),
        sample_rate: plan.sample_rate,
        bits_per_sample: 32,
        sample_format: SampleFormat::Float,
    }
}

/// Runs one whole session from `file` into an open WAV writer.
pub fn render_into<W>(
    file: SessionFile,
    plan: &RenderPlan,
    mut writer: WavWriter<W>,
) -> Result<RenderSummary, SessionError>
where
    W: Write + Seek,
{
    let format = OutputFormat {
        sample_rate: plan.sample_rate,
        channels: plan.channels.max(1),
    };
    let tick = file.tuning.tick;
    let sample_period = Duration::from_secs_f32(1.0 / plan.sensor_rate_hz.max(1.0));
    // Trailing second lets the last release finish
    let limit = file
        .protocol
        .total_duration()
        .saturating_add(Duration::from_secs(1));

    let mut controller =
        SessionController::new(file, OfflineOutput::new(format).with_seed(plan.seed))?;
    let mut lifter = SimulatedLifter::new(
        file.sonification.target_load,
        file.sonification.tolerance * 0.8,
        plan.seed,
    );
    let force = controller.force_cell();

    let t0 = Instant::now();
    controller.start_at(t0)?;
    let mut transitions = vec![(Duration::ZERO, ProtocolState::Countdown)];

    let block_frames = plan.block_frames.max(1);
    let mut block = vec![0.0; block_frames * format.channels as usize];
    let mut frames = 0u64;
    let mut next_tick = tick;
    let mut next_reading = Duration::ZERO;
    let mut state = ProtocolState::Countdown;
    let mut finished_at = None;

    loop {
        let elapsed = frames_to_duration(frames, plan.sample_rate);

        while next_tick <= elapsed {
            for entered in controller.tick_at(t0 + next_tick) {
                transitions.push((next_tick, entered));
            }
            state = controller.status_at(t0 + next_tick).state;
            next_tick += tick;
        }

        while next_reading <= elapsed {
            let load = lifter.load(state, next_reading);
            let quiet = plan.dropout.map_or(false, |d| d.covers(next_reading));
            if !quiet {
                let micros = next_reading.as_micros() as u32;
                force.ingest_at(ForceSample::new(micros, load), t0 + next_reading);
            }
            next_reading += sample_period;
        }

        controller.output_mut().render(&mut block, t0 + elapsed);
        for &sample in &block {
            writer.write_sample(sample)?;
        }
        frames += block_frames as u64;

        if !state.is_active() {
            // One more block after the end so the release reaches silence
            match finished_at {
                Some(_) => break,
                None => finished_at = Some(elapsed),
            }
        }
        if elapsed >= limit {
            break;
        }
    }

    writer.finalize()?;
    let completed_sets = controller.status_at(t0 + next_tick).completed_sets;
    controller.shutdown();
    Ok(RenderSummary {
        frames,
        completed_sets,
        transitions,
    })
}
