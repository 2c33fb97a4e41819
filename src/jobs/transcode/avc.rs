use super::{bitrate_args, CommandLine, Encoder, RateControl};

pub struct LibX264;

impl Encoder for LibX264 {
    fn codec(&self) -> &'static str {
        "libx264"
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
        match preset {
            0..=1 => "ultrafast",
            2..=3 => "superfast",
            4..=5 => "veryfast",
            6 => "faster",
            7 => "fast",
            8 => "medium",
            9..=11 => "slow",
            12..=13 => "slower",
            14..=16 => "veryslow",
            _ => "medium",
        }
        .to_string()
    }
}
