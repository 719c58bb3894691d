use std::{ffi::OsString, path::PathBuf, time::Duration};

use anyhow::Result;
use clap::{Args, Parser, Subcommand, ValueEnum};

use crate::{
    error::ConfigError,
    pipeline::{CaptureBackend, EngineBackend},
};

pub const DEFAULT_HOST: &str = "localhost";
pub const DEFAULT_PORT: u16 = 8667;
pub const DEFAULT_FREQUENCY_HZ: f64 = 2000.0;

#[derive(Parser, Debug)]
#[command(
    name = "facestream",
    about = "Streams live facial blendshape weights to a WebSocket client"
)]
pub struct Cli {
    #[command(flatten)]
    pub server: ServerArgs,

    #[command(flatten)]
    pub producer: ProducerArgs,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Run the WebSocket server and its producer (the default).
    Serve,
    /// Run only the producer, writing one JSON array per line to stdout.
    #[command(hide = true)]
    Produce,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Isolation {
    /// Producer in a child process, samples piped over stdout.
    Process,
    /// Producer on a dedicated thread inside the server process.
    Thread,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    Synthetic,
    Camera,
}

#[derive(Args, Debug, Clone)]
pub struct ServerArgs {
    /// Address to listen on.
    #[arg(long, env = "FACESTREAM_HOST", default_value = DEFAULT_HOST)]
    pub host: String,

    /// Port to listen on.
    #[arg(long, env = "FACESTREAM_PORT", default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Delivery cadence in Hz.
    #[arg(long, env = "FACESTREAM_FREQUENCY", default_value_t = DEFAULT_FREQUENCY_HZ)]
    pub frequency: f64,

    /// Where the producer runs.
    #[arg(long, value_enum, default_value_t = Isolation::Process)]
    pub isolation: Isolation,
}

impl ServerArgs {
    pub fn delivery_interval(&self) -> Result<Duration, ConfigError> {
        delivery_interval(self.frequency)
    }
}

/// `1 / frequency`, rejecting frequencies that give no usable period.
pub fn delivery_interval(frequency: f64) -> Result<Duration, ConfigError> {
    if !frequency.is_finite() || frequency <= 0.0 {
        return Err(ConfigError::InvalidFrequency(frequency));
    }
    // Very high frequencies round to a zero period, which no timer accepts.
    Duration::try_from_secs_f64(1.0 / frequency)
        .ok()
        .filter(|period| !period.is_zero())
        .ok_or(ConfigError::InvalidFrequency(frequency))
}

#[derive(Args, Debug, Clone)]
pub struct ProducerArgs {
    /// Frame source feeding the face engine.
    #[arg(long, value_enum, default_value_t = SourceKind::Synthetic)]
    pub source: SourceKind,

    /// Camera device index (with `--source camera`).
    #[arg(long, default_value_t = 0)]
    pub camera_index: u32,

    /// Frame rate of the synthetic source.
    #[arg(long, default_value_t = 30)]
    pub source_fps: u32,

    /// Face engine: `placeholder`, or `ort` when built with `engine-ort`.
    #[arg(long, default_value = "placeholder")]
    pub engine: String,

    /// Model file for the `ort` engine.
    #[arg(long)]
    pub model: Option<PathBuf>,
}

impl ProducerArgs {
    pub fn capture_backend(&self) -> Result<CaptureBackend> {
        match self.source {
            SourceKind::Synthetic => {
                if self.source_fps == 0 {
                    return Err(ConfigError::InvalidSourceFps.into());
                }
                Ok(CaptureBackend::Synthetic {
                    width: 64,
                    height: 48,
                    fps: self.source_fps,
                })
            }
            #[cfg(feature = "camera-nokhwa")]
            SourceKind::Camera => Ok(CaptureBackend::Camera {
                index: self.camera_index,
            }),
            #[cfg(not(feature = "camera-nokhwa"))]
            SourceKind::Camera => Err(anyhow::anyhow!(
                "camera capture needs the `camera-nokhwa` feature"
            )),
        }
    }

    pub fn engine_backend(&self) -> Result<EngineBackend> {
        EngineBackend::from_name(&self.engine, self.model.clone())
    }

    /// Arguments that make a child `facestream` run the same producer.
    pub fn to_child_args(&self) -> Vec<OsString> {
        let source = match self.source {
            SourceKind::Synthetic => "synthetic",
            SourceKind::Camera => "camera",
        };

        let mut args: Vec<OsString> = vec![
            "--source".into(),
            source.into(),
            "--camera-index".into(),
            self.camera_index.to_string().into(),
            "--source-fps".into(),
            self.source_fps.to_string().into(),
            "--engine".into(),
            self.engine.clone().into(),
        ];
        if let Some(model) = &self.model {
            args.push("--model".into());
            args.push(model.clone().into_os_string());
        }
        args.push("produce".into());
        args
    }
}
