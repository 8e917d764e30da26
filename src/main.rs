//! lamco-selection-sync - Clipboard selection synchronization
//!
//! Entry point for the command-line tool. Validates configuration and runs
//! a loopback self-test: two engines over in-memory clipboards, wired to
//! each other, copy on one side and paste on the other.

use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use lamco_selection_sync::clipboard::{
    spawn_forwarder, ChannelSender, ClipboardEngine, EngineConfig, ForwardEncoding, InMemoryClipboard,
};
use lamco_selection_sync::config::Config;

const LOG_FILE_PREFIX: &str = "lamco-selection-sync.log";

/// Command-line arguments for lamco-selection-sync
#[derive(Parser, Debug)]
#[command(name = "lamco-selection-sync")]
#[command(version, about = "Clipboard selection synchronization", long_about = None)]
pub struct Args {
    /// Configuration file path (built-in defaults when omitted)
    #[arg(short, long, env = "LAMCO_SELECTION_SYNC_CONFIG")]
    pub config: Option<String>,

    /// Validate the configuration and exit
    #[arg(long)]
    pub check_config: bool,

    /// Selection used by the self-test
    #[arg(long, default_value = "CLIPBOARD")]
    pub selection: String,

    /// Text copied by the self-test
    #[arg(long, default_value = "hello")]
    pub text: String,

    /// Verbose logging (can be specified multiple times)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Log format (json|pretty|compact)
    #[arg(long, default_value = "pretty")]
    pub log_format: String,

    /// Write logs to file (in addition to stdout)
    #[arg(long)]
    pub log_file: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::default_config()?,
    };

    let _guard = init_logging(&args, &config)?;

    info!("════════════════════════════════════════════════════════");
    info!("  lamco-selection-sync v{}", env!("CARGO_PKG_VERSION"));
    info!("  Profile: {}", if cfg!(debug_assertions) { "debug" } else { "release" });
    info!("════════════════════════════════════════════════════════");

    let engine_config = config.clipboard.to_engine_config()?;
    info!("Configuration loaded successfully");
    debug!("Config: {:?}", config);

    if args.check_config {
        info!(
            "Configuration OK: selections {:?}, send={}, receive={}",
            engine_config.local_selections, engine_config.can_send, engine_config.can_receive
        );
        let effective = toml::to_string_pretty(&config).context("Failed to serialize config")?;
        println!("{}", effective);
        return Ok(());
    }

    run_loopback(engine_config, &args.selection, &args.text).await
}

/// Copy `text` into `selection` of one engine and paste it from the other
async fn run_loopback(mut engine_config: EngineConfig, selection: &str, text: &str) -> Result<()> {
    if engine_config.translation.take().is_some() {
        warn!("Self-test runs both sides with the same selection names, ignoring clipboard translation");
        engine_config.remote_selections.clear();
    }
    if !engine_config.local_selections.iter().any(|s| s == selection) {
        anyhow::bail!("Selection {} is not configured", selection);
    }
    let wait = engine_config.remote_timeout + Duration::from_secs(1);

    let source = InMemoryClipboard::new(engine_config.local_selections.clone());
    let sink = InMemoryClipboard::new(engine_config.local_selections.clone());

    let (to_sink, from_source) = ChannelSender::new();
    let (to_source, from_sink) = ChannelSender::new();
    let mut source_engine = ClipboardEngine::start(engine_config.clone(), Arc::new(to_sink), &source).await?;
    let mut sink_engine = ClipboardEngine::start(engine_config, Arc::new(to_source), &sink).await?;

    let forwarders = [
        spawn_forwarder(from_source, sink_engine.handle(), ForwardEncoding::Json),
        spawn_forwarder(from_sink, source_engine.handle(), ForwardEncoding::Wire),
    ];

    // both sides announce target lists, as negotiated peers would
    source_engine.handle().set_want_targets(true)?;
    sink_engine.handle().set_want_targets(true)?;

    let source_backend = source.backend(selection).context("source selection missing")?;
    let sink_backend = sink.backend(selection).context("sink selection missing")?;

    info!("Self-test: copying {:?} into {}", text, selection);
    source_backend.copy_text(text);

    let claimed = tokio::time::timeout(wait, async {
        while !sink_backend.is_owned() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;

    let result = match claimed {
        Err(_) => Err(anyhow::anyhow!("Peer never claimed {} (check direction)", selection)),
        Ok(()) => {
            info!("Peer claimed {}: {:?}", selection, sink_backend.advertised_targets());
            match sink_backend.paste("UTF8_STRING").await {
                Some(data) if data.as_bytes() == Some(text.as_bytes()) => Ok(()),
                Some(data) => Err(anyhow::anyhow!("Pasted {:?}, expected {:?}", data, text)),
                None => Err(anyhow::anyhow!("Paste of {} returned no data", selection)),
            }
        }
    };

    match sink_engine.handle().info().await {
        Ok(info) => debug!("Sink engine: {}", serde_json::to_string(&info).unwrap_or_default()),
        Err(e) => warn!("Failed to query engine info: {}", e),
    }

    source_engine.shutdown().await?;
    sink_engine.shutdown().await?;
    for forwarder in forwarders {
        forwarder.abort();
    }

    result?;
    info!("Self-test passed");
    Ok(())
}

fn init_logging(args: &Args, config: &Config) -> Result<Option<WorkerGuard>> {
    use std::fs::File;

    let log_level = match args.verbose {
        0 => config.logging.level.as_str(),
        1 => "debug",
        _ => "trace",
    };

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(format!(
            "lamco_selection_sync={level},lamco_clipboard_core={level},warn",
            level = log_level
        ))
    });

    // --log-file wins over the configured log directory
    let mut guard = None;
    let file_writer = if let Some(log_file_path) = &args.log_file {
        let file = File::create(log_file_path).context(format!("Failed to create log file: {}", log_file_path))?;
        Some(BoxMakeWriter::new(file))
    } else if let Some(log_dir) = &config.logging.log_dir {
        let appender = tracing_appender::rolling::daily(log_dir, LOG_FILE_PREFIX);
        let (writer, worker) = tracing_appender::non_blocking(appender);
        guard = Some(worker);
        Some(BoxMakeWriter::new(writer))
    } else {
        None
    };
    let logs_to_file = file_writer.is_some();

    match args.log_format.as_str() {
        "json" => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stdout))
                .with(file_writer.map(|w| tracing_subscriber::fmt::layer().json().with_writer(w).with_ansi(false)))
                .init();
        }
        "compact" => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().compact().with_writer(std::io::stdout))
                .with(file_writer.map(|w| tracing_subscriber::fmt::layer().compact().with_writer(w).with_ansi(false)))
                .init();
        }
        _ => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().pretty().with_writer(std::io::stdout))
                .with(file_writer.map(|w| tracing_subscriber::fmt::layer().with_writer(w).with_ansi(false)))
                .init();
        }
    }

    if logs_to_file {
        info!("Logging to file");
    }

    Ok(guard)
}
