use super::{bitrate_args, CommandLine, Encoder, RateControl};

/// AMD's hardware H.264 encoder.
pub struct H264Amf;

impl Encoder for H264Amf {
    fn codec(&self) -> &'static str {
        "h264_amf"
    }

    fn rate_control(&self, rate: &RateControl, ff: &mut CommandLine) {
        match rate {
            RateControl::Bitrate {
                bitrate,
                max_bitrate,
                bufsize,
            } => bitrate_args(bitrate, max_bitrate, bufsize, ff),
            RateControl::Quality { quality } => {
                // constant QP on every frame type
                let q = quality.to_string();
                ff.arg("-rc")
                    .arg("cqp")
                    .arg("-qp_i")
                    .arg(&q)
                    .arg("-qp_p")
                    .arg(&q)
                    .arg("-qp_b")
                    .arg(&q);
            }
        }
    }

    fn get_preset(&self, preset: u8) -> String {
        match preset {
            0..=5 => "speed",
            6..=10 => "balanced",
            _ => "quality",
        }
        .to_string()
    }

    fn preset(&self, preset: u8, ff: &mut CommandLine) {
        // AMF calls its presets "quality"
        ff.arg("-quality").arg(self.get_preset(preset));
    }
}
