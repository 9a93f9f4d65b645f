use std::{path::PathBuf, str::FromStr, sync::Arc};

use clap::Parser;
use instalive_rs::{
    config::{Direction, DownloaderConfig},
    store::LocalStorage,
    util,
    worker::{Session, WorkerError},
};
use tokio_util::sync::CancellationToken;

/// Segments kept by `--debug`.
const DEBUG_SEGMENT_CAP: usize = 30;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Action {
    All,
    Live,
    Video,
    Audio,
    Merge,
    Check,
    Manual,
    Info,
    Import(PathBuf),
}

impl FromStr for Action {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(path) = s.strip_prefix("import:") {
            return Ok(Action::Import(PathBuf::from(path)));
        }
        Ok(match s {
            "all" => Action::All,
            "live" => Action::Live,
            "video" => Action::Video,
            "audio" => Action::Audio,
            "merge" => Action::Merge,
            "check" => Action::Check,
            "manual" => Action::Manual,
            "info" => Action::Info,
            _ => {
                return Err(format!(
                    "unknown action {:?}, expected one of all, live, video, audio, merge, check, manual, info, import:<path>",
                    s
                ))
            }
        })
    }
}

fn parse_range(s: &str) -> Result<(i64, i64), String> {
    let (start, end) = s
        .split_once('-')
        .ok_or_else(|| format!("expected START-END, got {:?}", s))?;
    let start = start.trim().parse().map_err(|e| format!("bad start: {}", e))?;
    let end = end.trim().parse().map_err(|e| format!("bad end: {}", e))?;
    Ok((start, end))
}

/// Download a live DASH stream, including the segments from before you
/// started watching.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// URL of the DASH manifest
    url: String,

    /// all, live, video, audio, merge, check, manual, info or import:<path>
    #[arg(short, long, default_value = "all")]
    action: Action,

    /// Directory to save segments and output to
    #[arg(short, long, default_value = ".")]
    dir: PathBuf,

    /// Stop the backfill after a handful of segments
    #[arg(long)]
    debug: bool,

    /// Video quality, e.g. "pst" or "abr"; highest bandwidth by default
    #[arg(short, long)]
    quality: Option<String>,

    /// Segment id to start the backfill from
    #[arg(short, long)]
    time: Option<i64>,

    /// Id range for the manual action, START-END inclusive
    #[arg(long, value_parser = parse_range)]
    range: Option<(i64, i64)>,

    /// Walk towards newer segments instead of older ones
    #[arg(long)]
    forward: bool,
}

impl Args {
    fn config(&self) -> DownloaderConfig {
        DownloaderConfig {
            save_dir: self.dir.clone(),
            quality: self.quality.clone(),
            last_id: self.time,
            direction: if self.forward {
                Direction::Forward
            } else {
                Direction::Backward
            },
            debug_segment_cap: self.debug.then_some(DEBUG_SEGMENT_CAP),
            manual_range: self.range,
            ..DownloaderConfig::default()
        }
    }
}

async fn run(session: &Session, action: &Action, token: &CancellationToken) -> Result<(), WorkerError> {
    match action {
        Action::All => {
            session.run_all(token).await?;
        }
        Action::Live => {
            session.save_manifest().await?;
            session.live(token).await?;
        }
        Action::Video => {
            session.save_manifest().await?;
            session.download_init().await?;
            session.backfill(token).await?;
        }
        Action::Audio => {
            session.download_audio(token).await?;
        }
        Action::Merge => session.merge().await?,
        Action::Check => {
            session.check().await?;
        }
        Action::Manual => {
            session.manual(session.config.manual_range, token).await?;
        }
        Action::Info => {
            let info = serde_json::to_string_pretty(&session.info()).unwrap_or_default();
            println!("{}", info);
        }
        Action::Import(path) => {
            session.import(path).await?;
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let config = args.config();

    let client = util::HttpClient::new(config.http_retries).expect("Could not create HttpClient");

    let token = CancellationToken::new();
    let interrupt = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            println!();
            log::warn!("Interrupted by user");
            interrupt.cancel();
        }
    });

    let session = match Session::prepare(&args.url, Arc::new(client), Arc::new(LocalStorage), config).await {
        Ok(session) => session,
        Err(e) => {
            log::error!("Setup failed: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = run(&session, &args.action, &token).await {
        log::error!("{:?} failed: {}", args.action, e);
        std::process::exit(1);
    }

    log::info!("Done");
}
