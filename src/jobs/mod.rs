use serde::{Deserialize, Serialize};

pub mod probe;
pub mod transcode;

/// Output when running ffprobe -v error -print_format json -show_streams <video>
#[derive(Serialize, Deserialize, Debug, Default)]
pub struct FfProbeStreamsOutput {
    pub streams: Option<Vec<Stream>>,
}

#[derive(Serialize, Deserialize, Debug, Default, Clone)]
pub struct Stream {
    pub index: Option<i64>,
    pub codec_name: Option<String>,
    pub codec_type: Option<CodecType>,
    pub width: Option<i64>,
    pub height: Option<i64>,
    pub r_frame_rate: Option<String>,
    pub avg_frame_rate: Option<String>,
    pub nb_frames: Option<String>,
    pub duration: Option<String>,
    pub tags: Option<Tags>,
}

#[derive(Serialize, Deserialize, PartialEq, Debug, Copy, Clone)]
#[serde(rename_all = "snake_case")]
pub enum CodecType {
    Attachment,
    Audio,
    Data,
    Subtitle,
    Video,
    #[serde(other)]
    Unknown,
}

/// Matroska statistics tags. mkvmerge writes `NAME-eng`, ffmpeg remuxes may carry both.
#[derive(Serialize, Deserialize, Debug, Default, Clone)]
pub struct Tags {
    #[serde(rename = "DURATION")]
    pub duration: Option<String>,
    #[serde(rename = "DURATION-eng")]
    pub duration_eng: Option<String>,
    #[serde(rename = "NUMBER_OF_FRAMES")]
    pub number_of_frames: Option<String>,
    #[serde(rename = "NUMBER_OF_FRAMES-eng")]
    pub number_of_frames_eng: Option<String>,
    pub language: Option<String>,
    pub title: Option<String>,
}

impl Tags {
    pub fn duration(&self) -> Option<&str> {
        self.duration.as_deref().or(self.duration_eng.as_deref())
    }

    pub fn number_of_frames(&self) -> Option<&str> {
        self.number_of_frames
            .as_deref()
            .or(self.number_of_frames_eng.as_deref())
    }
}
