use serde::{Deserialize, Serialize};

use super::{CommandLine, EncoderKind, FormError, RateControl, Resolution, MAX_PRESET};

/// Everything needed to turn one input file into one ffmpeg invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobForm {
    pub input: String,
    pub output: String,
    #[serde(default)]
    pub resolution: Resolution,
    #[serde(default)]
    pub encoder: EncoderKind,
    #[serde(default)]
    pub rate: RateControl,
    #[serde(default)]
    pub preset: Option<u8>,
    /// Pass `-y` so an existing output is replaced instead of prompting.
    #[serde(default)]
    pub overwrite: bool,
}

impl JobForm {
    pub fn new(input: impl Into<String>, output: impl Into<String>) -> Self {
        Self {
            input: input.into(),
            output: output.into(),
            resolution: Resolution::default(),
            encoder: EncoderKind::default(),
            rate: RateControl::default(),
            preset: None,
            overwrite: false,
        }
    }

    pub fn validate(&self) -> Result<(), FormError> {
        if self.input.trim().is_empty() || self.output.trim().is_empty() {
            return Err(FormError::MissingPaths);
        }
        if let Some(preset) = self.preset {
            if preset > MAX_PRESET {
                return Err(FormError::PresetOutOfRange(preset));
            }
        }
        Ok(())
    }
}

/// Build the ffmpeg invocation for a form.
///
/// `<ffmpeg> [-y] -i <input> -vf scale=WxH -c:v <codec> <rate control> [preset] <output>`
pub fn build_command(ffmpeg: &str, form: &JobForm) -> Result<CommandLine, FormError> {
    form.validate()?;
    let encoder = form.encoder.encoder();

    let mut ff = CommandLine::new(ffmpeg);
    if form.overwrite {
        ff.arg("-y");
    }
    ff.arg("-i")
        .arg(&form.input)
        .arg("-vf")
        .arg(format!("scale={}", form.resolution))
        .arg("-c:v")
        .arg(encoder.codec());
    encoder.rate_control(&form.rate, &mut ff);
    if let Some(preset) = form.preset {
        encoder.preset(preset, &mut ff);
    }
    ff.arg(&form.output);

    Ok(ff)
}
