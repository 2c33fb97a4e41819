mod amf;
mod av1;
mod avc;
mod command;
mod form;
mod process;
mod progress;

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use command::*;
pub use form::*;
pub use process::*;
pub use progress::*;

/// Resolutions offered by default, first one is the default.
pub const RESOLUTION_PRESETS: &[Resolution] = &[
    Resolution {
        width: 2560,
        height: 1440,
    },
    Resolution {
        width: 1920,
        height: 1080,
    },
];

/// Fastest to slowest, mapped onto each encoder's own preset names.
pub const MAX_PRESET: u8 = 16;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FormError {
    #[error("Please provide input and output files.")]
    MissingPaths,
    #[error("invalid resolution {0:?}, expected WIDTHxHEIGHT")]
    InvalidResolution(String),
    #[error("preset {0} is out of range (0-16)")]
    PresetOutOfRange(u8),
}

/// Output frame size, passed to the `scale` filter as `WxH`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Default for Resolution {
    fn default() -> Self {
        RESOLUTION_PRESETS[0]
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

impl FromStr for Resolution {
    type Err = FormError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || FormError::InvalidResolution(s.to_owned());
        let (w, h) = s.trim().split_once(['x', 'X']).ok_or_else(invalid)?;
        let width: u32 = w.parse().map_err(|_| invalid())?;
        let height: u32 = h.parse().map_err(|_| invalid())?;
        if width == 0 || height == 0 {
            return Err(invalid());
        }
        Ok(Self { width, height })
    }
}

impl TryFrom<String> for Resolution {
    type Error = FormError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Resolution> for String {
    fn from(value: Resolution) -> Self {
        value.to_string()
    }
}

/// How the encoder spends bits: a bitrate budget or a constant quality.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum RateControl {
    Bitrate {
        #[serde(default = "default_bitrate")]
        bitrate: String,
        #[serde(default = "default_max_bitrate")]
        max_bitrate: String,
        #[serde(default = "default_bufsize")]
        bufsize: String,
    },
    Quality {
        #[serde(default = "default_quality")]
        quality: u8,
    },
}

fn default_bitrate() -> String {
    "8M".to_owned()
}

fn default_max_bitrate() -> String {
    "10M".to_owned()
}

fn default_bufsize() -> String {
    "16M".to_owned()
}

fn default_quality() -> u8 {
    23
}

impl Default for RateControl {
    fn default() -> Self {
        Self::Bitrate {
            bitrate: default_bitrate(),
            max_bitrate: default_max_bitrate(),
            bufsize: default_bufsize(),
        }
    }
}

/// Video encoders the form can pick from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
pub enum EncoderKind {
    #[default]
    #[serde(rename = "h264_amf")]
    #[value(name = "h264_amf")]
    H264Amf,
    #[serde(rename = "libx264")]
    #[value(name = "libx264")]
    LibX264,
    #[serde(rename = "libsvtav1")]
    #[value(name = "libsvtav1")]
    SvtAv1,
}

impl EncoderKind {
    pub fn encoder(self) -> Box<dyn Encoder> {
        match self {
            Self::H264Amf => Box::new(amf::H264Amf),
            Self::LibX264 => Box::new(avc::LibX264),
            Self::SvtAv1 => Box::new(av1::SvtAv1),
        }
    }
}

/// Generate encoder arguments for ffmpeg
pub trait Encoder {
    fn codec(&self) -> &'static str;
    fn rate_control(&self, rate: &RateControl, ff: &mut CommandLine);
    fn get_preset(&self, preset: u8) -> String;

    fn preset(&self, preset: u8, ff: &mut CommandLine) {
        ff.arg("-preset").arg(self.get_preset(preset));
    }
}

/// Bitrate mode is the same triple for every encoder we drive.
fn bitrate_args(bitrate: &str, max_bitrate: &str, bufsize: &str, ff: &mut CommandLine) {
    ff.arg("-b:v")
        .arg(bitrate)
        .arg("-maxrate")
        .arg(max_bitrate)
        .arg("-bufsize")
        .arg(bufsize);
}
