use std::{path::Path, process::Stdio};

use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, instrument};

use super::{CodecType, FfProbeStreamsOutput, Stream};

#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("failed to run {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{program} exited with {status}: {stderr}")]
    Failed {
        program: String,
        status: std::process::ExitStatus,
        stderr: String,
    },
    #[error("could not parse ffprobe output: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("No video stream found")]
    NoVideoStream,
}

/// What the progress scraper needs to know about a job's input.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct VideoInfo {
    pub frame_count: Option<u64>,
    pub duration: Option<f64>,
    pub width: Option<i64>,
    pub height: Option<i64>,
}

#[instrument(skip(ffprobe))]
pub async fn probe_video(ffprobe: &str, path: &Path) -> Result<VideoInfo, ProbeError> {
    let probe = Command::new(ffprobe)
        .args(["-v", "error", "-print_format", "json", "-show_streams"])
        .arg(path)
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(|source| ProbeError::Spawn {
            program: ffprobe.to_owned(),
            source,
        })?;

    if !probe.status.success() {
        return Err(ProbeError::Failed {
            program: ffprobe.to_owned(),
            status: probe.status,
            stderr: String::from_utf8_lossy(&probe.stderr).trim().to_owned(),
        });
    }

    let output: FfProbeStreamsOutput = serde_json::from_slice(&probe.stdout)?;
    let info = video_info(&output)?;
    debug!("probed {}: {:?}", path.display(), info);
    Ok(info)
}

/// Pick the first video stream and work out its frame count.
pub fn video_info(output: &FfProbeStreamsOutput) -> Result<VideoInfo, ProbeError> {
    let stream = output
        .streams
        .iter()
        .flatten()
        .find(|s| s.codec_type == Some(CodecType::Video))
        .ok_or(ProbeError::NoVideoStream)?;

    let duration = stream_duration(stream);
    Ok(VideoInfo {
        frame_count: frame_count(stream, duration),
        duration,
        width: stream.width,
        height: stream.height,
    })
}

fn frame_count(stream: &Stream, duration: Option<f64>) -> Option<u64> {
    // mp4 carries nb_frames, mkv only the statistics tag
    let counted = stream
        .nb_frames
        .as_deref()
        .and_then(|n| n.parse::<u64>().ok())
        .or_else(|| {
            stream
                .tags
                .as_ref()?
                .number_of_frames()?
                .parse::<u64>()
                .ok()
        })
        .filter(|n| *n > 0);

    counted.or_else(|| {
        let fps = stream
            .avg_frame_rate
            .as_deref()
            .and_then(parse_rate)
            .or_else(|| stream.r_frame_rate.as_deref().and_then(parse_rate))?;
        let estimate = (duration? * fps).round();
        (estimate >= 1.0).then_some(estimate as u64)
    })
}

fn stream_duration(stream: &Stream) -> Option<f64> {
    stream
        .duration
        .as_deref()
        .and_then(|d| d.parse::<f64>().ok())
        .or_else(|| parse_timestamp(stream.tags.as_ref()?.duration()?))
}

/// Parse an ffprobe rate like `30000/1001` or `25`.
pub fn parse_rate(rate: &str) -> Option<f64> {
    let fps = match rate.split_once('/') {
        Some((top, bottom)) => {
            let top: f64 = top.parse().ok()?;
            let bottom: f64 = bottom.parse().ok()?;
            if bottom == 0.0 {
                return None;
            }
            top / bottom
        }
        None => rate.parse().ok()?,
    };
    (fps > 0.0).then_some(fps)
}

/// Parse a Matroska `HH:MM:SS.nnnnnnnnn` duration into seconds.
fn parse_timestamp(ts: &str) -> Option<f64> {
    let mut parts = ts.splitn(3, ':');
    let hours: f64 = parts.next()?.parse().ok()?;
    let minutes: f64 = parts.next()?.parse().ok()?;
    let seconds: f64 = parts.next()?.parse().ok()?;
    Some(hours * 3600.0 + minutes * 60.0 + seconds)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(json: &str) -> FfProbeStreamsOutput {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn prefers_nb_frames() {
        let out = parse(
            r#"{"streams":[
                {"index":0,"codec_type":"audio","duration":"10.0"},
                {"index":1,"codec_type":"video","nb_frames":"240","duration":"10.010000",
                 "avg_frame_rate":"24000/1001","width":1920,"height":1080}
            ]}"#,
        );
        let info = video_info(&out).unwrap();
        assert_eq!(info.frame_count, Some(240));
        assert_eq!(info.duration, Some(10.01));
        assert_eq!(info.height, Some(1080));
    }

    #[test]
    fn falls_back_to_matroska_tags() {
        let out = parse(
            r#"{"streams":[{"codec_type":"video","avg_frame_rate":"25/1",
                "tags":{"NUMBER_OF_FRAMES-eng":"1500","DURATION-eng":"00:01:00.000000000"}}]}"#,
        );
        let info = video_info(&out).unwrap();
        assert_eq!(info.frame_count, Some(1500));
        assert_eq!(info.duration, Some(60.0));
    }

    #[test]
    fn tags_in_both_spellings() {
        let out = parse(
            r#"{"streams":[{"codec_type":"video","nb_frames":"240",
                "tags":{"DURATION":"00:00:10.000000000","DURATION-eng":"00:00:10.000000000",
                        "NUMBER_OF_FRAMES":"250","NUMBER_OF_FRAMES-eng":"250"}}]}"#,
        );
        let info = video_info(&out).unwrap();
        assert_eq!(info.frame_count, Some(240));
        assert_eq!(info.duration, Some(10.0));

        let out = parse(
            r#"{"streams":[{"codec_type":"video",
                "tags":{"NUMBER_OF_FRAMES":"250","NUMBER_OF_FRAMES-eng":"251"}}]}"#,
        );
        assert_eq!(video_info(&out).unwrap().frame_count, Some(250));
    }

    #[test]
    fn estimates_from_duration_and_rate() {
        let out = parse(
            r#"{"streams":[{"codec_type":"video","avg_frame_rate":"30000/1001",
                "tags":{"DURATION":"00:00:10.010000000"}}]}"#,
        );
        assert_eq!(video_info(&out).unwrap().frame_count, Some(300));
    }

    #[test]
    fn unknown_frame_count_is_none() {
        let out = parse(r#"{"streams":[{"codec_type":"video","avg_frame_rate":"0/0"}]}"#);
        assert_eq!(video_info(&out).unwrap().frame_count, None);
    }

    #[test]
    fn missing_video_stream_is_an_error() {
        let out = parse(r#"{"streams":[{"codec_type":"audio"},{"codec_type":"data"}]}"#);
        assert!(matches!(video_info(&out), Err(ProbeError::NoVideoStream)));

        let empty = parse("{}");
        assert!(matches!(video_info(&empty), Err(ProbeError::NoVideoStream)));
    }

    #[test]
    fn rates() {
        assert_eq!(parse_rate("25"), Some(25.0));
        assert_eq!(parse_rate("50/2"), Some(25.0));
        assert_eq!(parse_rate("0/0"), None);
        assert_eq!(parse_rate("abc"), None);
    }

    #[tokio::test]
    async fn missing_probe_binary_is_a_spawn_error() {
        let err = probe_video("ffqueue-no-such-ffprobe", Path::new("in.mp4"))
            .await
            .unwrap_err();
        assert!(matches!(err, ProbeError::Spawn { .. }));
    }
}
