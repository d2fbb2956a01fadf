use std::fs;
use std::fs::File;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use clap::{ArgAction, Args, Parser, Subcommand, ValueHint};
use sonde_playback::driver::{self, Command as DriverCommand};
use sonde_playback::stream::lookback_origin;
use sonde_playback::{
    synthetic, Credentials, EngineConfig, FetchPage, FetchQuery, HttpSource, Observation,
    ObservationSource, PlaybackWindow, SeriesSummary, Session, StreamEngine, StreamError,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "Sonde telemetry replay CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Poll the observation source and replay the series as JSON frames
    Replay(ReplayArgs),
    /// Fetch observations from a cursor and write them as CSV
    Fetch(FetchArgs),
    /// Write a synthetic ascent as CSV
    Synth(SynthArgs),
}

#[derive(Args, Debug)]
struct CommonArgs {
    /// Engine configuration JSON (missing fields keep their defaults)
    #[arg(long, value_hint = ValueHint::FilePath)]
    config: Option<PathBuf>,

    /// Observation endpoint URL
    #[arg(long, value_hint = ValueHint::Url)]
    url: Option<String>,

    /// Client id (falls back to SONDE_CLIENT_ID)
    #[arg(long)]
    client_id: Option<String>,

    /// API key (falls back to SONDE_API_KEY)
    #[arg(long)]
    api_key: Option<String>,

    /// Restrict requests to one mission
    #[arg(long)]
    mission: Option<String>,

    /// Hours of history to request on the first poll
    #[arg(long)]
    lookback_hours: Option<f64>,

    /// Enable verbose logging
    #[arg(short, long, action = ArgAction::SetTrue)]
    verbose: bool,
}

#[derive(Parser, Debug)]
struct ReplayArgs {
    #[command(flatten)]
    common: CommonArgs,

    /// Skip the live source and replay synthetic data
    #[arg(long, action = ArgAction::SetTrue)]
    offline: bool,

    /// Playback speed factor
    #[arg(long, default_value_t = 1.0)]
    speed: f64,

    /// Stop after this many frames
    #[arg(long)]
    frames: Option<usize>,

    /// Window start, hours after the first observation
    #[arg(long, default_value_t = 0.0)]
    start_hour: f64,

    /// Window length in hours (default: to the end)
    #[arg(long)]
    duration_hours: Option<f64>,
}

#[derive(Parser, Debug)]
struct FetchArgs {
    #[command(flatten)]
    common: CommonArgs,

    /// Cursor start as Unix seconds or RFC 3339 (default: now - lookback)
    #[arg(long)]
    since: Option<String>,

    /// Maximum number of requests to issue
    #[arg(long, default_value_t = 1)]
    pages: usize,

    /// Output CSV path (`-` for stdout)
    #[arg(short, long, default_value = "-", value_hint = ValueHint::FilePath)]
    output: PathBuf,
}

#[derive(Parser, Debug)]
struct SynthArgs {
    #[command(flatten)]
    common: CommonArgs,

    /// Number of samples (default from configuration)
    #[arg(long)]
    count: Option<usize>,

    /// First sample time as Unix seconds or RFC 3339 (default: now - lookback)
    #[arg(long)]
    origin: Option<String>,

    /// Output CSV path (`-` for stdout)
    #[arg(short, long, default_value = "-", value_hint = ValueHint::FilePath)]
    output: PathBuf,
}

/// Stand-in source for `--offline`: every poll fails, so the engine falls
/// back to synthetic data through its normal degraded path.
struct Offline;

impl ObservationSource for Offline {
    fn fetch(&self, _query: &FetchQuery) -> Result<FetchPage, StreamError> {
        Err(StreamError::SourceUnavailable("offline mode".into()))
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let verbose = match &cli.command {
        Command::Replay(args) => args.common.verbose,
        Command::Fetch(args) => args.common.verbose,
        Command::Synth(args) => args.common.verbose,
    };
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init();

    match cli.command {
        Command::Replay(args) => handle_replay(args),
        Command::Fetch(args) => handle_fetch(args),
        Command::Synth(args) => handle_synth(args),
    }
}

fn handle_replay(args: ReplayArgs) -> Result<()> {
    let mut config = load_config(&args.common)?;
    let source: Arc<dyn ObservationSource> = if args.offline {
        config.fallback_to_synthetic = true;
        Arc::new(Offline)
    } else {
        let http = HttpSource::from_config(&config)
            .context("cannot query the live source; pass --offline to replay synthetic data")?;
        info!(url = http.url(), "replaying live source");
        Arc::new(http)
    };

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to start async runtime")?;
    runtime.block_on(replay(config, source, args))
}

async fn replay(
    config: EngineConfig,
    source: Arc<dyn ObservationSource>,
    args: ReplayArgs,
) -> Result<()> {
    let mut session = Session::new(&config);
    session.set_window(PlaybackWindow::new(args.start_hour, args.duration_hours));
    session.set_speed(args.speed);

    let (mut controller, channels) = driver::channel(session.snapshot());
    let task = tokio::spawn(driver::run(session, source, config, channels));
    controller
        .commands
        .send(DriverCommand::Play)
        .map_err(|_| anyhow!("session driver exited before playback started"))?;

    let stdout = io::stdout();
    let mut out = stdout.lock();
    let mut emitted = 0usize;
    loop {
        tokio::select! {
            frame = controller.frames.recv() => {
                let Some(frame) = frame else { break };
                serde_json::to_writer(&mut out, &frame).context("failed to encode frame")?;
                writeln!(out)?;
                out.flush()?;
                emitted += 1;
                if args.frames.is_some_and(|limit| emitted >= limit) {
                    break;
                }
                let slice_len = controller.snapshots.borrow().slice_len;
                if frame.index + 1 >= slice_len {
                    info!(frames = emitted, "reached end of window");
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted");
                break;
            }
        }
    }

    if controller.commands.send(DriverCommand::Shutdown).is_err() {
        warn!("session driver already stopped");
    }
    let session = task.await.context("session driver panicked")?;
    let snapshot = session.snapshot();
    info!(
        frames = emitted,
        status = ?snapshot.status,
        degraded = snapshot.degraded,
        series = snapshot.series_len,
        "replay finished"
    );
    if let Some(message) = snapshot.error_message {
        warn!("{}", message);
    }
    Ok(())
}

fn handle_fetch(args: FetchArgs) -> Result<()> {
    let config = load_config(&args.common)?;
    let source = HttpSource::from_config(&config).context("cannot query the live source")?;
    let origin = match args.since.as_deref() {
        Some(text) => parse_instant(text)?,
        None => lookback_origin(Utc::now(), config.lookback_hours),
    };

    let mut engine = StreamEngine::with_origin(&config, origin);
    let limit = config.effective_batch_limit();
    for page in 0..args.pages.max(1) {
        let batch = engine
            .fetch_next(&source)
            .with_context(|| format!("request {} to {} failed", page + 1, source.url()))?;
        let received = batch.len();
        engine.ingest(batch);
        if received < limit {
            break;
        }
    }

    let series = engine.series();
    if args.output.as_os_str() == "-" {
        write_series_stdout(series)?;
    } else {
        write_series_csv(series, &args.output)?;
        info!(path = %args.output.display(), "wrote observations");
    }
    log_summary(SeriesSummary::from_slice(series).as_ref());
    info!(cursor = engine.cursor(), "next request would start here");
    Ok(())
}

fn handle_synth(args: SynthArgs) -> Result<()> {
    let config = load_config(&args.common)?;
    let origin = match args.origin.as_deref() {
        Some(text) => parse_instant(text)?,
        None => lookback_origin(Utc::now(), config.lookback_hours),
    };
    let count = args.count.unwrap_or(config.synthetic_count);
    if count == 0 {
        return Err(anyhow!("--count must be at least 1"));
    }

    let series = synthetic::generate(origin, count);
    if args.output.as_os_str() == "-" {
        write_series_stdout(&series)?;
    } else {
        write_series_csv(&series, &args.output)?;
        info!(path = %args.output.display(), "wrote synthetic series");
    }
    log_summary(SeriesSummary::from_slice(&series).as_ref());
    Ok(())
}

fn load_config(common: &CommonArgs) -> Result<EngineConfig> {
    let mut config = match &common.config {
        Some(path) => {
            let text = fs::read_to_string(path)
                .with_context(|| format!("failed to read config {}", path.display()))?;
            serde_json::from_str::<EngineConfig>(&text)
                .with_context(|| format!("{} is not a valid engine config", path.display()))?
        }
        None => EngineConfig::default(),
    };

    if let Some(url) = &common.url {
        config.source_url = url.clone();
    }
    if let Some(mission) = &common.mission {
        config.mission_filter = Some(mission.clone());
    }
    if let Some(hours) = common.lookback_hours {
        config.lookback_hours = hours;
    }
    config.credentials = match (&common.client_id, &common.api_key) {
        (Some(client_id), Some(api_key)) => Some(Credentials::new(client_id, api_key)),
        (None, None) => Credentials::from_env(),
        _ => return Err(anyhow!("--client-id and --api-key must be given together")),
    };
    config.validate().context("invalid engine configuration")?;
    Ok(config)
}

fn parse_instant(text: &str) -> Result<DateTime<Utc>> {
    let trimmed = text.trim();
    if let Ok(secs) = trimmed.parse::<i64>() {
        return DateTime::from_timestamp(secs, 0)
            .ok_or_else(|| anyhow!("timestamp {} is out of range", secs));
    }
    DateTime::parse_from_rfc3339(trimmed)
        .map(|parsed| parsed.with_timezone(&Utc))
        .with_context(|| format!("invalid time '{}': expected Unix seconds or RFC 3339", trimmed))
}

fn write_series_stdout(series: &[Observation]) -> Result<()> {
    let stdout = io::stdout();
    let handle = stdout.lock();
    let mut writer = csv::Writer::from_writer(handle);
    write_series_rows(series, &mut writer)
}

fn write_series_csv(series: &[Observation], path: &Path) -> Result<()> {
    let file =
        File::create(path).with_context(|| format!("failed to create {}", path.display()))?;
    let mut writer = csv::Writer::from_writer(file);
    write_series_rows(series, &mut writer)
}

fn write_series_rows<W: Write>(series: &[Observation], writer: &mut csv::Writer<W>) -> Result<()> {
    writer.write_record([
        "id",
        "mission_id",
        "timestamp",
        "altitude_m",
        "temperature_c",
        "humidity_pct",
        "wind_u_mps",
        "wind_v_mps",
        "wind_speed_mps",
    ])?;

    for obs in series {
        writer.write_record([
            obs.id().to_string(),
            obs.mission_id().to_string(),
            obs.timestamp().to_string(),
            format!("{:.1}", obs.altitude()),
            format!("{:.2}", obs.temperature()),
            format!("{:.1}", obs.humidity()),
            format!("{:.3}", obs.wind_u()),
            format!("{:.3}", obs.wind_v()),
            format!("{:.3}", obs.wind_speed()),
        ])?;
    }

    writer.flush()?;
    Ok(())
}

fn log_summary(summary: Option<&SeriesSummary>) {
    let Some(summary) = summary else {
        warn!("no observations");
        return;
    };
    info!(
        count = summary.count,
        first = %summary.first,
        last = %summary.last,
        span_hours = summary.span_seconds() / 3600.0,
        "series summary"
    );
    info!(
        "altitude {:.0}..{:.0} m, temperature {:.1}..{:.1} C, peak wind {:.1} m/s",
        summary.altitude_range_m.0,
        summary.altitude_range_m.1,
        summary.temperature_range_c.0,
        summary.temperature_range_c.1,
        summary.peak_wind_speed_mps
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_unix_seconds_and_rfc3339() {
        let from_secs = parse_instant("1700000000").unwrap();
        let from_text = parse_instant("2023-11-14T22:13:20Z").unwrap();
        assert_eq!(from_secs, from_text);
        assert!(parse_instant("yesterday").is_err());
    }

    #[test]
    fn csv_rows_carry_derived_wind_speed() {
        let series = synthetic::generate(parse_instant("1700000000").unwrap(), 3);
        let mut writer = csv::Writer::from_writer(Vec::new());
        write_series_rows(&series, &mut writer).unwrap();
        let bytes = writer.into_inner().unwrap();
        let text = String::from_utf8(bytes).unwrap();
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines.len(), 4);
        assert!(lines[0].ends_with("wind_speed_mps"));
        assert!(lines[1].contains("synthetic"));
    }

    #[test]
    fn cli_overrides_config_file_values() {
        let cli = Cli::parse_from([
            "sonde-playback",
            "fetch",
            "--mission",
            "W-7",
            "--lookback-hours",
            "6",
            "--client-id",
            "c",
            "--api-key",
            "k",
        ]);
        let Command::Fetch(args) = cli.command else {
            panic!("expected fetch");
        };
        let config = load_config(&args.common).unwrap();
        assert_eq!(config.mission_filter.as_deref(), Some("W-7"));
        assert_eq!(config.lookback_hours, 6.0);
        assert_eq!(config.credentials, Some(Credentials::new("c", "k")));
    }

    #[test]
    fn lone_credential_flag_is_rejected() {
        let cli = Cli::parse_from(["sonde-playback", "synth", "--api-key", "k"]);
        let Command::Synth(args) = cli.command else {
            panic!("expected synth");
        };
        assert!(load_config(&args.common).is_err());
    }
}
