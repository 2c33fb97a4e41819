#![cfg(unix)]

use std::{fs, os::unix::fs::PermissionsExt, path::Path};

use ffqueue::{
    config::Settings,
    jobs::transcode::{JobForm, TranscodeJob},
    services::{
        db::Database,
        job::{DrainSummary, JobsService, QueueStatus, State},
    },
};

const FAKE_FFPROBE: &str = r#"#!/bin/sh
case "$*" in
  *missing*) echo "missing.mkv: No such file or directory" >&2; exit 1 ;;
esac
echo '{"streams":[{"index":0,"codec_type":"audio"},{"index":1,"codec_type":"video","nb_frames":"100"}]}'
"#;

const FAKE_FFMPEG: &str = r#"#!/bin/sh
for last; do :; done
printf 'ffmpeg version stand-in\n' >&2
printf 'frame=   50 fps=25 q=28.0\r' >&2
echo "stdout noise"
case "$last" in
  *bad*) printf 'Conversion failed!\n' >&2; exit 1 ;;
esac
printf 'frame=  100 fps=25 q=28.0\r' >&2
: > "$last"
"#;

fn script(dir: &Path, name: &str, body: &str) -> String {
    let path = dir.join(name);
    fs::write(&path, body).unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    path.to_string_lossy().into_owned()
}

#[tokio::test(flavor = "multi_thread")]
async fn drains_queue_with_stand_in_tools() {
    let dir = tempfile::tempdir().unwrap();
    let settings = Settings {
        db_path: dir.path().join("queue.db"),
        ffmpeg: script(dir.path(), "ffmpeg", FAKE_FFMPEG),
        ffprobe: script(dir.path(), "ffprobe", FAKE_FFPROBE),
        ..Settings::default()
    };
    let db = Database::new(&settings.db_path).unwrap();
    let jobs = JobsService::new(State::new(db, settings.clone()));

    let out = |name: &str| dir.path().join(name).to_string_lossy().into_owned();
    let forms = [
        JobForm::new("first.mkv", out("first out.mp4")),
        JobForm::new("missing.mkv", out("second.mp4")),
        JobForm::new("third.mkv", out("bad.mp4")),
        JobForm::new("fourth.mkv", out("fourth.mp4")),
    ];
    for form in &forms {
        let job = TranscodeJob::from_form(&settings.ffmpeg, form).unwrap();
        jobs.enqueue(job).await.unwrap();
    }

    let summary = jobs.drain().await.unwrap();
    assert_eq!(
        summary,
        DrainSummary {
            completed: 2,
            failed: 2
        }
    );

    let rows = jobs.list().await.unwrap();
    let states: Vec<&str> = rows.iter().map(|r| r.state.as_str()).collect();
    assert_eq!(states, ["completed", "failed", "failed", "completed"]);

    assert!(dir.path().join("first out.mp4").exists());
    assert!(dir.path().join("fourth.mp4").exists());
    assert!(!dir.path().join("bad.mp4").exists());

    let output = |i: usize| -> serde_json::Value {
        serde_json::from_str(rows[i].output.as_deref().unwrap()).unwrap()
    };
    let first = output(0);
    assert_eq!(first["frames"], 100);
    assert_eq!(first["progress"], 100.0);
    assert_eq!(first["status"], "progress = 100.0% frame=  100 fps=25 q=28.0");
    assert_eq!(first["exit_code"], 0);

    let probe_failure = output(1)["error"].as_str().unwrap().to_owned();
    assert!(probe_failure.contains("could not probe missing.mkv"), "{}", probe_failure);

    let ffmpeg_failure = output(2)["error"].as_str().unwrap().to_owned();
    assert!(ffmpeg_failure.contains("Conversion failed!"), "{}", ffmpeg_failure);

    assert_eq!(
        jobs.status().await.unwrap(),
        QueueStatus::Finished {
            completed: 2,
            failed: 2
        }
    );
}
