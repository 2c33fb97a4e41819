use std::{path::PathBuf, process::Stdio};

use anyhow::{bail, Context, Error};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::{
    io::{AsyncBufReadExt, AsyncReadExt, BufReader},
    process::ChildStdout,
};
use tracing::{debug, info, warn};

use super::{build_command, CommandLine, FormError, JobForm, ProgressScraper, Status};
use crate::{
    jobs::probe::{probe_video, ProbeError},
    services::job::{Job, JobCtx, State},
};

const STDERR_CHUNK: usize = 4096;

/// One queued ffmpeg run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranscodeJob {
    input: PathBuf,
    output: PathBuf,
    command: CommandLine,
}

impl TranscodeJob {
    pub fn new(input: PathBuf, output: PathBuf, command: CommandLine) -> Self {
        Self {
            input,
            output,
            command,
        }
    }

    pub fn from_form(ffmpeg: &str, form: &JobForm) -> Result<Self, FormError> {
        let command = build_command(ffmpeg, form)?;
        Ok(Self::new(
            PathBuf::from(&form.input),
            PathBuf::from(&form.output),
            command,
        ))
    }

    pub fn command(&self) -> &CommandLine {
        &self.command
    }

    /// The output file name, which is how a job is referred to in logs.
    pub fn name(&self) -> String {
        self.output
            .file_name()
            .unwrap_or(self.output.as_os_str())
            .to_string_lossy()
            .into_owned()
    }

    async fn frame_count(&self, state: &State) -> Result<Option<u64>, Error> {
        match probe_video(&state.settings.ffprobe, &self.input).await {
            Ok(info) => {
                if info.frame_count.is_none() {
                    debug!("frame count of {} is unknown", self.input.display());
                }
                Ok(info.frame_count)
            }
            Err(err @ ProbeError::Spawn { .. }) => {
                // no ffprobe only costs us the percentage
                warn!("{}, progress will not be shown", err);
                Ok(None)
            }
            Err(err) => {
                Err(err).with_context(|| format!("could not probe {}", self.input.display()))
            }
        }
    }
}

#[async_trait]
#[typetag::serde]
impl Job for TranscodeJob {
    async fn run(&self, state: &State, jctx: JobCtx) -> Result<serde_json::Value, Error> {
        let frames = self.frame_count(state).await?;

        info!("starting {}", self.command);
        let mut ff = self.command.to_command();
        ff.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        let mut child = ff
            .spawn()
            .with_context(|| format!("failed to start {}", self.command.program))?;

        let stdout = child
            .stdout
            .take()
            .context("Could not get stdout from child ffmpeg")?;
        let mut stderr = child
            .stderr
            .take()
            .context("Could not get stderr from child ffmpeg")?;
        let stdout_task = tokio::spawn(log_stdout(stdout));

        let mut scraper = ProgressScraper::new(frames);
        let mut buf = [0u8; STDERR_CHUNK];
        loop {
            let n = stderr.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            if let Some(status) = scraper.feed(&buf[..n]) {
                report(state, &jctx, &status).await;
            }
        }
        if let Some(status) = scraper.finish() {
            report(state, &jctx, &status).await;
        }

        let exit = child.wait().await?;
        let _ = stdout_task.await;
        info!("{} finished.", self.name());

        let last = scraper.last().cloned();
        if !exit.success() {
            bail!(
                "{} exited with {}: {}",
                self.command.program,
                exit,
                last.map(|s| s.line).unwrap_or_default()
            );
        }

        Ok(json!({
            "output": self.output,
            "frames": frames,
            "progress": last.as_ref().and_then(|s| s.percent),
            "status": last.map(|s| s.to_string()),
            "exit_code": exit.code(),
        }))
    }

    fn describe(&self) -> String {
        self.command.to_string()
    }
}

/// Status updates are best effort, ffmpeg keeps running if the row can't be written.
async fn report(state: &State, jctx: &JobCtx, status: &Status) {
    info!("Status: {}", status);
    let update = json!({
        "status": status.to_string(),
        "frame": status.frame,
        "progress": status.percent,
    });
    if let Err(err) = jctx.update(state, &update).await {
        warn!("could not update status of job {}: {:#}", jctx.id, err);
    }
}

async fn log_stdout(stdout: ChildStdout) {
    let mut lines = BufReader::new(stdout).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => debug!("STDOUT: {}", line),
            Ok(None) => break,
            Err(err) => {
                debug!("could not read child stdout: {}", err);
                break;
            }
        }
    }
}
