//! The sonification engine: turns the newest force reading and the published
//! arm state into blocks of PCM.
//!
//! A block is rendered in four steps:
//!
//! 1. Read the arm state and the newest sample. Disarmed, or armed with a
//!    sensor that has gone quiet for longer than the staleness threshold,
//!    means the target is silence.
//! 2. Otherwise the tone sits at its full level and the noise level follows
//!    the configured [`NoiseCurve`](crate::config::NoiseCurve) of the
//!    normalised error, scaled by the noise ceiling.
//! 3. Both gains chase their targets sample by sample: a one-pole filter
//!    while armed, a linear ramp of fixed length towards silence otherwise,
//!    so silence is reached exactly and on time.
//! 4. The sine oscillator's phase keeps running across blocks and mode
//!    changes. Tone and noise are summed and soft-clipped with `tanh`.
//!
//! Rendering never locks, allocates, or logs.

use crate::arm::ArmCell;
use crate::config::EngineTuning;
use crate::force::ForceCell;
use rand::{rngs::SmallRng, Rng, SeedableRng};
use std::{f64::consts::TAU, sync::Arc, time::Instant};

/// The inputs an output backend needs to build an engine once it knows the
/// device's sample rate.
#[derive(Debug, Clone)]
pub struct EngineSpec {
    /// Aesthetic constants
    pub tuning: EngineTuning,
    /// Newest force reading
    pub force: Arc<ForceCell>,
    /// Protocol gate
    pub arm: Arc<ArmCell>,
}

impl EngineSpec {
    /// Builds an engine rendering at `sample_rate`.
    pub fn build(self, sample_rate: u32) -> SonificationEngine {
        SonificationEngine::new(sample_rate, self.tuning, self.force, self.arm)
    }
}

/// Current smoothed gains, for inspection.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Levels {
    /// Applied tone amplitude
    pub tone: f32,
    /// Applied noise amplitude
    pub noise: f32,
}

impl Levels {
    /// Both gains are exactly zero.
    pub fn is_silent(&self) -> bool {
        self.tone == 0.0 && self.noise == 0.0
    }
}

/// Continuous synthesis state carried from block to block.
#[derive(Debug, Clone, Copy, Default)]
struct AudioState {
    // Oscillator phase in cycles, kept in [0, 1)
    phase: f64,
    levels: Levels,
    // Frames left in the current release, 0 when not releasing
    release_left: usize,
    release_step: Levels,
}

/// Renders feedback audio.
pub struct SonificationEngine {
    force: Arc<ForceCell>,
    arm: Arc<ArmCell>,
    tuning: EngineTuning,
    sample_rate: u32,
    state: AudioState,
    rng: SmallRng,
    phase_step: f64,
    smoothing_coef: f32,
    release_frames: usize,
}

impl SonificationEngine {
    /// An engine rendering at `sample_rate` with a randomly seeded noise source.
    pub fn new(
        sample_rate: u32,
        tuning: EngineTuning,
        force: Arc<ForceCell>,
        arm: Arc<ArmCell>,
    ) -> Self {
        Self::with_rng(sample_rate, tuning, force, arm, SmallRng::from_entropy())
    }

    /// Same as [`SonificationEngine::new`] with a reproducible noise source.
    pub fn with_seed(
        sample_rate: u32,
        tuning: EngineTuning,
        force: Arc<ForceCell>,
        arm: Arc<ArmCell>,
        seed: u64,
    ) -> Self {
        Self::with_rng(sample_rate, tuning, force, arm, SmallRng::seed_from_u64(seed))
    }

    fn with_rng(
        sample_rate: u32,
        tuning: EngineTuning,
        force: Arc<ForceCell>,
        arm: Arc<ArmCell>,
        rng: SmallRng,
    ) -> Self {
        let fs = sample_rate.max(1) as f32;
        let smoothing_coef = 1.0 - (-1.0 / (tuning.smoothing.as_secs_f32() * fs)).exp();
        let release_frames = (tuning.release.as_secs_f32() * fs).ceil().max(1.0) as usize;
        Self {
            force,
            arm,
            sample_rate,
            state: AudioState::default(),
            rng,
            phase_step: tuning.pitch_hz as f64 / sample_rate.max(1) as f64,
            smoothing_coef,
            release_frames,
            tuning,
        }
    }

    /// Output sample rate.
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Gains applied to the last rendered sample.
    pub fn levels(&self) -> Levels {
        self.state.levels
    }

    /// Number of frames the gains take to fall to silence.
    pub fn release_frames(&self) -> usize {
        self.release_frames
    }

    /// Gains the engine should be heading for at `now`, `None` for silence.
    fn target_levels(&self, now: Instant) -> Option<Levels> {
        let arm = self.arm.snapshot();
        if !arm.armed || self.force.is_stale_at(now, self.tuning.stale_after) {
            return None;
        }
        let sample = self.force.latest()?;
        let error = arm.config.error(sample.load_newtons);
        Some(Levels {
            tone: self.tuning.tone_level,
            noise: self.tuning.noise_curve.level(error) * self.tuning.noise_ceiling,
        })
    }

    /// Fills an interleaved buffer of `channels` channels, writing the same
    /// signal to every channel of a frame.
    pub fn render(&mut self, out: &mut [f32], channels: usize, now: Instant) {
        let channels = channels.max(1);
        let frames = out.len() / channels;
        let target = self.target_levels(now);

        if target.is_none() && self.state.levels.is_silent() {
            out.fill(0.0);
            self.state.phase = (self.state.phase + self.phase_step * frames as f64).fract();
            return;
        }

        for frame in out.chunks_mut(channels) {
            let state = &mut self.state;
            match target {
                Some(target) => {
                    state.release_left = 0;
                    state.levels.tone += (target.tone - state.levels.tone) * self.smoothing_coef;
                    state.levels.noise += (target.noise - state.levels.noise) * self.smoothing_coef;
                }
                None => {
                    if state.release_left == 0 {
                        let n = self.release_frames as f32;
                        state.release_left = self.release_frames;
                        state.release_step = Levels {
                            tone: state.levels.tone / n,
                            noise: state.levels.noise / n,
                        };
                    }
                    state.release_left -= 1;
                    if state.release_left == 0 {
                        state.levels = Levels::default();
                    } else {
                        state.levels.tone -= state.release_step.tone;
                        state.levels.noise -= state.release_step.noise;
                    }
                }
            }
            let levels = state.levels;

            let tone = (self.state.phase * TAU).sin() as f32 * levels.tone;
            let noise = if levels.noise > 0.0 {
                self.rng.gen_range(-1.0f32..1.0) * levels.noise
            } else {
                0.0
            };
            frame.fill((tone + noise).tanh());

            self.state.phase += self.phase_step;
            if self.state.phase >= 1.0 {
                self.state.phase -= 1.0;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{NoiseCurve, SonificationConfig};
    use crate::force::ForceSample;
    use std::time::Duration;

    const RATE: u32 = 48_000;

    struct Rig {
        force: Arc<ForceCell>,
        arm: Arc<ArmCell>,
        engine: SonificationEngine,
        t0: Instant,
    }

    fn rig_with(tuning: EngineTuning) -> Rig {
        let force = Arc::new(ForceCell::new());
        let arm = Arc::new(ArmCell::new(SonificationConfig::default()));
        let engine =
            SonificationEngine::with_seed(RATE, tuning, Arc::clone(&force), Arc::clone(&arm), 7);
        Rig {
            force,
            arm,
            engine,
            t0: Instant::now(),
        }
    }

    fn rig() -> Rig {
        rig_with(EngineTuning::default())
    }

    fn window() -> SonificationConfig {
        SonificationConfig {
            target_load: 20.0,
            tolerance: 2.0,
        }
    }

    impl Rig {
        fn hold(&self, load: f32) {
            self.force.ingest_at(ForceSample::new(0, load), self.t0);
        }

        /// Renders `seconds` of mono audio at t0 and returns it.
        fn settle(&mut self, seconds: f32) -> Vec<f32> {
            let mut buf = vec![0.0; (RATE as f32 * seconds) as usize];
            self.engine.render(&mut buf, 1, self.t0);
            buf
        }
    }

    #[test]
    fn disarmed_is_exact_silence() {
        let mut rig = rig();
        rig.hold(35.0);
        let out = rig.settle(0.1);
        assert!(out.iter().all(|&s| s == 0.0));
        assert!(rig.engine.levels().is_silent());
    }

    #[test]
    fn on_target_is_pure_tone() {
        let mut rig = rig();
        rig.arm.arm(window(), 1);
        for load in [20.0, 21.0, 18.5, 21.99] {
            rig.hold(load);
            rig.settle(0.5);
            let levels = rig.engine.levels();
            assert_eq!(levels.noise, 0.0, "noise at load {load}");
            assert!((levels.tone - 0.2).abs() < 1e-4, "tone at load {load}");
        }
    }

    #[test]
    fn leaving_the_band_is_noisy() {
        let mut rig = rig();
        rig.arm.arm(window(), 1);
        for load in [22.0, 18.0] {
            rig.hold(load);
            rig.settle(0.5);
            let levels = rig.engine.levels();
            assert!((levels.noise - 0.25).abs() < 1e-4, "noise at load {load}");
            assert!((levels.tone - 0.2).abs() < 1e-4);
        }
    }

    #[test]
    fn far_off_target_hits_the_ceiling() {
        let mut rig = rig();
        rig.arm.arm(window(), 1);
        for load in [24.0, 26.0, 10.0, 100.0] {
            rig.hold(load);
            rig.settle(0.5);
            let levels = rig.engine.levels();
            assert!((levels.noise - 0.5).abs() < 1e-4, "noise at load {load}");
            assert!((levels.tone - 0.2).abs() < 1e-4);
        }
    }

    #[test]
    fn noise_grows_with_error() {
        let mut rig = rig();
        rig.arm.arm(window(), 1);
        let mut last = 0.0;
        for step in 0..=8 {
            rig.hold(22.0 + step as f32 * 0.25);
            rig.settle(0.5);
            let noise = rig.engine.levels().noise;
            assert!(noise + 1e-5 >= last, "noise dropped at step {step}");
            last = noise;
        }
        assert!((last - 0.5).abs() < 1e-4);
    }

    #[test]
    fn proportional_curve_is_noisy_at_the_boundary() {
        let mut rig = rig_with(EngineTuning {
            noise_curve: NoiseCurve::Proportional,
            ..Default::default()
        });
        rig.arm.arm(window(), 1);

        rig.hold(20.0);
        rig.settle(0.5);
        assert_eq!(rig.engine.levels().noise, 0.0);

        rig.hold(21.0);
        rig.settle(0.5);
        assert!((rig.engine.levels().noise - 0.25).abs() < 1e-4);

        rig.hold(22.0);
        rig.settle(0.5);
        assert!((rig.engine.levels().noise - 0.5).abs() < 1e-4);
    }

    #[test]
    fn disarm_ramps_to_silence_on_time() {
        let mut rig = rig();
        rig.arm.arm(window(), 1);
        rig.hold(30.0);
        rig.settle(0.5);

        rig.arm.disarm();
        let frames = rig.engine.release_frames();
        assert_eq!(frames, 240);
        let mut buf = vec![0.0; frames];
        let mut previous = rig.engine.levels();
        for sample in buf.chunks_mut(1) {
            rig.engine.render(sample, 1, rig.t0);
            let now = rig.engine.levels();
            assert!(previous.tone - now.tone <= 0.2 / 240.0 + 1e-6);
            assert!(previous.noise - now.noise <= 0.5 / 240.0 + 1e-6);
            assert!(sample[0].abs() <= 1.0);
            previous = now;
        }
        assert!(rig.engine.levels().is_silent());

        let after = rig.settle(0.01);
        assert!(after.iter().all(|&s| s == 0.0));
    }

    #[test]
    fn stale_sensor_is_silenced() {
        let mut rig = rig();
        rig.arm.arm(window(), 1);
        rig.hold(20.0);
        rig.settle(0.2);
        assert!(rig.engine.levels().tone > 0.19);

        let later = rig.t0 + Duration::from_millis(600);
        let mut buf = vec![0.0; 480];
        rig.engine.render(&mut buf, 1, later);
        assert!(rig.engine.levels().is_silent());

        // Fresh samples bring the tone back
        rig.force.ingest_at(ForceSample::new(1, 20.0), later);
        rig.engine.render(&mut buf, 1, later);
        assert!(rig.engine.levels().tone > 0.0);
    }

    #[test]
    fn armed_without_any_sample_is_silent() {
        let mut rig = rig();
        rig.arm.arm(window(), 1);
        let out = rig.settle(0.05);
        assert!(out.iter().all(|&s| s == 0.0));
    }

    #[test]
    fn output_is_in_range() {
        let mut rig = rig_with(EngineTuning {
            tone_level: 1.0,
            noise_ceiling: 1.0,
            ..Default::default()
        });
        rig.arm.arm(window(), 1);
        rig.hold(200.0);
        let out = rig.settle(0.5);
        assert!(out.iter().all(|s| (-1.0..=1.0).contains(s)));
        assert!(out.iter().any(|&s| s != 0.0));
    }

    #[test]
    fn block_size_does_not_change_the_signal() {
        let mut whole = rig();
        let mut split = rig();
        for r in [&whole, &split] {
            r.arm.arm(window(), 1);
            r.hold(23.0);
        }

        let mut a = vec![0.0; 1024];
        whole.engine.render(&mut a, 1, whole.t0);

        let mut b = vec![0.0; 1024];
        for block in b.chunks_mut(200) {
            split.engine.render(block, 1, split.t0);
        }
        assert_eq!(a, b);
    }

    #[test]
    fn channels_carry_the_same_signal() {
        let mut rig = rig();
        rig.arm.arm(window(), 1);
        rig.hold(20.0);
        let mut buf = vec![0.0; 2 * 512];
        rig.engine.render(&mut buf, 2, rig.t0);
        for frame in buf.chunks(2) {
            assert_eq!(frame[0], frame[1]);
        }
        assert!(buf.iter().any(|&s| s != 0.0));
    }
}
