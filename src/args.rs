//! Command line definitions.

use crate::config::SessionFile;
use crate::error::SessionError;
use crate::render::{Dropout, RenderPlan};
use clap::{Args, Parser, Subcommand, ValueEnum};
use std::{path::PathBuf, time::Duration};

/// Isometric training with audio feedback
#[derive(Debug, Parser, Clone)]
#[clap(version, about)]
pub struct ForcetoneArgs {
    #[command(subcommand)]
    /// Live session or offline render
    pub command: CommandTask,

    #[command(flatten)]
    /// Session settings shared by every command
    pub session: SessionArgs,
}

/// Session settings. Anything given here overrides the session file.
#[derive(Debug, Args, Clone, Default)]
pub struct SessionArgs {
    /// RON session file to start from
    #[arg(short = 'c', long = "config", global = true)]
    pub config: Option<PathBuf>,

    /// Seconds of work per set
    #[arg(long, global = true)]
    pub work: Option<f64>,

    /// Seconds of rest after each set
    #[arg(long, global = true)]
    pub rest: Option<f64>,

    /// Number of sets
    #[arg(long, global = true)]
    pub sets: Option<u32>,

    /// Seconds of countdown before the first set
    #[arg(long, global = true)]
    pub countdown: Option<f64>,

    /// Load to hold
    #[arg(short = 't', long, global = true)]
    pub target: Option<f32>,

    /// Allowed distance from the target before noise starts
    #[arg(long, global = true)]
    pub tolerance: Option<f32>,

    /// Reference tone frequency in Hz
    #[arg(long, global = true)]
    pub pitch: Option<f32>,
}

/// What to do with the session.
#[derive(Debug, Subcommand, Clone)]
pub enum CommandTask {
    /// Train live with the audio device and a terminal dashboard
    #[command(about)]
    Run(RunCommand),

    /// Simulate a whole session and write its audio to a WAV file
    #[command(about)]
    Render(RenderCommand),
}

/// Where live force readings come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Source {
    /// Synthetic readings, steered from the dashboard
    Dummy,
    /// Raw notification frames piped in on stdin
    Stdin,
}

/// Options of a live session.
#[derive(Debug, Args, Clone)]
pub struct RunCommand {
    /// Force source
    #[arg(short, long, value_enum, default_value_t = Source::Dummy)]
    pub source: Source,

    /// Seconds of unloaded readings to soft-tare against, 0 to skip
    #[arg(long, default_value_t = 0.0)]
    pub tare: f64,

    /// Frames per audio block to ask the device for
    #[arg(short, long, default_value_t = 200)]
    pub block: u32,

    /// Load the dummy sensor starts at
    #[arg(long, default_value_t = 0.0)]
    pub start_load: f32,

    /// File or pipe where device commands for the stdin source are written
    #[arg(long, value_name = "PATH")]
    pub commands: Option<PathBuf>,
}

/// Options of an offline render.
#[derive(Debug, Args, Clone)]
pub struct RenderCommand {
    /// WAV file to write
    #[arg(short = 'o', long = "out")]
    pub outfile: PathBuf,

    /// Sample rate of the file
    #[arg(short = 'r', long = "rate", default_value_t = 48_000)]
    pub sample_rate: u32,

    /// Channels in the file
    #[arg(long, default_value_t = 1)]
    pub channels: u16,

    /// Seconds into the session the sensor goes quiet
    #[arg(long, requires = "dropout_length")]
    pub dropout_at: Option<f64>,

    /// Seconds the sensor stays quiet
    #[arg(long, requires = "dropout_at")]
    pub dropout_length: Option<f64>,

    /// Seed for the simulated lifter and the noise
    #[arg(long, default_value_t = 0)]
    pub seed: u64,
}

// None for negative, NaN and anything too long to represent
fn seconds(secs: f64) -> Option<Duration> {
    Duration::try_from_secs_f64(secs).ok()
}

impl SessionArgs {
    /// The session file, if one was named, with every given option applied.
    ///
    /// Durations that are negative, not numbers, or too long to represent turn
    /// into zero so that the controller rejects them with a proper
    /// configuration error.
    pub fn resolve(&self) -> Result<SessionFile, SessionError> {
        let mut file = match &self.config {
            Some(path) => SessionFile::load(path)?,
            None => SessionFile::default(),
        };
        let duration = |secs: f64| seconds(secs).unwrap_or(Duration::ZERO);

        if let Some(work) = self.work {
            file.protocol.work_duration = duration(work);
        }
        if let Some(rest) = self.rest {
            file.protocol.rest_duration = duration(rest);
        }
        if let Some(sets) = self.sets {
            file.protocol.set_count = sets;
        }
        if let Some(countdown) = self.countdown {
            file.protocol.countdown_duration = duration(countdown);
        }
        if let Some(target) = self.target {
            file.sonification.target_load = target;
        }
        if let Some(tolerance) = self.tolerance {
            file.sonification.tolerance = tolerance;
        }
        if let Some(pitch) = self.pitch {
            file.tuning.pitch_hz = pitch;
        }
        Ok(file)
    }
}

impl RunCommand {
    /// Soft-tare window, if one was asked for and is representable.
    pub fn tare_window(&self) -> Option<Duration> {
        seconds(self.tare).filter(|w| !w.is_zero())
    }
}

impl RenderCommand {
    /// Offline render settings.
    pub fn plan(&self) -> RenderPlan {
        let dropout = match (
            self.dropout_at.and_then(seconds),
            self.dropout_length.and_then(seconds),
        ) {
            (Some(start), Some(length)) => Some(Dropout { start, length }),
            _ => None,
        };
        RenderPlan {
            sample_rate: self.sample_rate,
            channels: self.channels,
            dropout,
            seed: self.seed,
            ..RenderPlan::default()
        }
    }
}
