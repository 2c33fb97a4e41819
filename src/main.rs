use std::path::PathBuf;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use tracing::{debug, info};
use tracing_subscriber::FmtSubscriber;

use ffqueue::{
    api,
    config::Settings,
    helpers,
    jobs::transcode::{EncoderKind, JobForm, RateControl, Resolution, TranscodeJob},
    services::{
        db::Database,
        job::{JobsService, QueueStatus, State},
    },
};

/// Queue up ffmpeg transcodes and run them one after another.
#[derive(Parser, Debug)]
#[command(name = "ffqueue", version, about)]
struct Cli {
    /// Queue database (overrides FFQUEUE_DB)
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// ffmpeg binary (overrides FFMPEG_PATH)
    #[arg(long, global = true)]
    ffmpeg: Option<String>,

    /// ffprobe binary (overrides FFPROBE_PATH)
    #[arg(long, global = true)]
    ffprobe: Option<String>,

    /// More logging, repeat for trace output
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Add a transcode to the back of the queue
    Add(AddArgs),
    /// Show every job in the queue
    List,
    /// Run queued jobs in order until the queue is empty
    Run,
    /// Print the status line
    Status,
    /// Remove completed and failed jobs
    Clear,
    /// Serve the queue over HTTP
    Serve {
        /// Address to listen on (overrides FFQUEUE_LISTEN)
        #[arg(long)]
        listen: Option<String>,
    },
}

#[derive(Args, Debug)]
struct AddArgs {
    #[arg(short, long)]
    input: String,

    #[arg(short, long)]
    output: String,

    /// Output size as WIDTHxHEIGHT, e.g. 1920x1080
    #[arg(short, long, default_value_t = Resolution::default())]
    resolution: Resolution,

    #[arg(short, long, value_enum, default_value_t = EncoderKind::default())]
    encoder: EncoderKind,

    /// Target bitrate
    #[arg(long, default_value = "8M", conflicts_with = "quality")]
    bitrate: String,

    #[arg(long, default_value = "10M", conflicts_with = "quality")]
    max_bitrate: String,

    #[arg(long, default_value = "16M", conflicts_with = "quality")]
    bufsize: String,

    /// Encode at a constant quality instead of a bitrate
    #[arg(short, long, num_args = 0..=1, default_missing_value = "23")]
    quality: Option<u8>,

    /// 0 (fastest) to 16 (slowest)
    #[arg(short, long, value_parser = clap::value_parser!(u8).range(0..=16))]
    preset: Option<u8>,

    /// Overwrite the output if it exists
    #[arg(short = 'y', long)]
    overwrite: bool,
}

impl AddArgs {
    fn into_form(self) -> JobForm {
        let rate = match self.quality {
            Some(quality) => RateControl::Quality { quality },
            None => RateControl::Bitrate {
                bitrate: self.bitrate,
                max_bitrate: self.max_bitrate,
                bufsize: self.bufsize,
            },
        };
        JobForm {
            input: self.input,
            output: self.output,
            resolution: self.resolution,
            encoder: self.encoder,
            rate,
            preset: self.preset,
            overwrite: self.overwrite,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => tracing::Level::INFO,
        1 => tracing::Level::DEBUG,
        _ => tracing::Level::TRACE,
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("setting default subscriber failed")?;

    let mut settings = Settings::from_env()?;
    if let Some(db) = cli.db {
        settings.db_path = db;
    }
    if let Some(ffmpeg) = cli.ffmpeg {
        settings.ffmpeg = ffmpeg;
    }
    if let Some(ffprobe) = cli.ffprobe {
        settings.ffprobe = ffprobe;
    }
    if let Cmd::Serve {
        listen: Some(listen),
    } = &cli.command
    {
        settings.listen = listen.clone();
    }
    debug!("settings: {:?}", settings);

    let db = Database::new(&settings.db_path)?;
    let jobs = JobsService::new(State::new(db, settings));

    match cli.command {
        Cmd::Add(args) => {
            let form = args.into_form();
            let job = TranscodeJob::from_form(&jobs.state().settings.ffmpeg, &form)
                .map_err(|err| anyhow::anyhow!("Status: {}", err))?;
            let command = job.command().to_string();
            let (_, id) = jobs.enqueue(job).await?;
            println!("{}\t{}", id, command);
        }
        Cmd::List => {
            for row in jobs.list().await? {
                let command = row.describe().unwrap_or_else(|| row.job_type.clone());
                println!("{}\t{}\t{}", row.id, row.state, command);
            }
        }
        Cmd::Run => {
            let status = jobs.status().await?;
            if matches!(status, QueueStatus::Empty | QueueStatus::Finished { .. }) {
                println!("Status: {}", QueueStatus::Empty);
                return Ok(());
            }
            let summary = jobs.drain().await?;
            info!(
                "{} completed, {} failed",
                summary.completed, summary.failed
            );
            println!("Status: {}", jobs.status().await?);
        }
        Cmd::Status => println!("Status: {}", jobs.status().await?),
        Cmd::Clear => println!("removed {} finished jobs", jobs.clear_finished().await?),
        Cmd::Serve { .. } => serve(jobs).await?,
    }

    Ok(())
}

async fn serve(jobs: std::sync::Arc<JobsService>) -> anyhow::Result<()> {
    let mut closer = helpers::Closer::new();
    jobs.spawn_worker(&mut closer);

    let listen = jobs.state().settings.listen.clone();
    let app = api::router(jobs);
    let listener = tokio::net::TcpListener::bind(&listen)
        .await
        .with_context(|| format!("could not listen on {}", listen))?;
    info!("listening on {}", listen);

    axum::serve(listener, app)
        .with_graceful_shutdown(helpers::do_shutdown())
        .await?;

    closer.close().await;
    Ok(())
}
