use super::{bitrate_args, CommandLine, Encoder, RateControl, MAX_PRESET};

pub struct SvtAv1;

impl Encoder for SvtAv1 {
    fn codec(&self) -> &'static str {
        "libsvtav1"
    }

    fn rate_control(&self, rate: &RateControl, ff: &mut CommandLine) {
        match rate {
            RateControl::Bitrate {
                bitrate,
                max_bitrate,
                bufsize,
            } => bitrate_args(bitrate, max_bitrate, bufsize, ff),
            RateControl::Quality { quality } => {
                ff.arg("-crf").arg(quality.to_string());
            }
        }
    }

    fn get_preset(&self, preset: u8) -> String {
        // svt-av1 counts the other way: 0 is slowest, 13 fastest
        (MAX_PRESET - preset.min(MAX_PRESET)).min(13).to_string()
    }
}
