use anyhow::Result;
use clap::{Parser, ValueEnum};
use simplelog::{Config, LevelFilter, WriteLogger};
use std::fs::File;
use std::path::PathBuf;
use std::sync::Arc;

use chat_yapper_core::app_state::AppState;
use chat_yapper_core::chat_adapters::twitch::TwitchAdapter;
use chat_yapper_core::chat_adapters::youtube::YouTubeAdapter;
use chat_yapper_core::orchestrator::DispatchOrchestrator;
use chat_yapper_core::{api_rest, chat_adapters, config};

#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, ValueEnum, Debug)]
#[value(rename_all = "lower")]
enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Chat-to-speech overlay dispatch core", long_about = None)]
struct Args {
    /// Override the logging level set in the persisted config.
    #[arg(long, value_name = "LEVEL")]
    log_level: Option<LogLevel>,

    /// Override the WebSocket bind port set in the persisted config.
    #[arg(long, value_name = "PORT")]
    ws_port: Option<u16>,

    /// Override the REST/Swagger bind port set in the persisted config.
    #[arg(long, value_name = "PORT")]
    rest_port: Option<u16>,

    /// Path to the log file written by this process.
    #[arg(long, value_name = "PATH", default_value = "chat-yapper-core.log")]
    log_file: PathBuf,

    /// Print the resolved config file path and exit.
    #[arg(long)]
    print_config_path: bool,
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.print_config_path {
        println!("{}", config::config_file_path()?.display());
        return Ok(());
    }

    let mut settings = config::load_settings()?;
    if let Some(port) = args.ws_port {
        settings.ws_port = port;
    }
    if let Some(port) = args.rest_port {
        settings.rest_port = port;
    }
    let log_level = args.log_level.map(cli_to_level_filter).unwrap_or_else(|| str_to_level_filter(&settings.log_level));

    WriteLogger::init(log_level, Config::default(), File::create(&args.log_file)?)?;
    log::info!("starting dispatch core (ws_port={}, rest_port={})", settings.ws_port, settings.rest_port);

    let app_state = AppState::build(&settings).await?;

    let api_handle = api_rest::start_servers(Arc::clone(&app_state), settings.rest_port, settings.ws_port);

    let (event_tx, mut event_rx) = chat_adapters::event_channel();

    if let Some(twitch) = settings.twitch.clone() {
        let adapter = TwitchAdapter::new(twitch.oauth_token, twitch.nickname, twitch.channel, Arc::clone(&app_state.broadcast));
        let tx = event_tx.clone();
        tokio::spawn(async move {
            adapter.run(tx).await;
        });
    } else {
        log::info!("no twitch credentials configured, skipping twitch adapter");
    }

    if let Some(youtube) = settings.youtube.clone() {
        let adapter = YouTubeAdapter::new(youtube.api_key, youtube.video_id);
        let tx = event_tx.clone();
        tokio::spawn(async move {
            adapter.run(tx).await;
        });
    } else {
        log::info!("no youtube credentials configured, skipping youtube adapter");
    }
    drop(event_tx);

    let orchestrator: Arc<DispatchOrchestrator> = Arc::clone(&app_state.orchestrator);
    let ingress_task = tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            orchestrator.handle_event(event).await;
        }
    });

    tokio::signal::ctrl_c().await?;
    log::info!("shutdown signal received, stopping...");
    ingress_task.abort();
    drop(api_handle);

    Ok(())
}

fn cli_to_level_filter(level: LogLevel) -> LevelFilter {
    match level {
        LogLevel::Error => LevelFilter::Error,
        LogLevel::Warn => LevelFilter::Warn,
        LogLevel::Info => LevelFilter::Info,
        LogLevel::Debug => LevelFilter::Debug,
        LogLevel::Trace => LevelFilter::Trace,
    }
}

fn str_to_level_filter(level: &str) -> LevelFilter {
    match level.to_lowercase().as_str() {
        "error" => LevelFilter::Error,
        "warn" => LevelFilter::Warn,
        "debug" => LevelFilter::Debug,
        "trace" => LevelFilter::Trace,
        _ => LevelFilter::Info,
    }
}
