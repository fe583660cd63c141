//! CLI binary for dawn-voice.

use clap::Parser;
use dawn_voice::asr::{ChunkingManager, stub_engine_for};
use dawn_voice::audio::capture::CpalCapture;
use dawn_voice::audio::playback::CpalPlayback;
use dawn_voice::config::PipelineMode as ConfigPipelineMode;
use dawn_voice::dispatcher::{CommandDispatcher, CommandTable, DeviceRegistry};
use dawn_voice::input_queue::InputQueue;
use dawn_voice::lifecycle::Lifecycle;
use dawn_voice::llm::api::ApiLlm;
use dawn_voice::metrics::Metrics;
use dawn_voice::tts::{CpalPlaybackSink, TtsGateway};
use dawn_voice::vad::VadGate;
use dawn_voice::{Pipeline, SpeechConfig};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::Instant;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// dawn-voice: a local voice-assistant daemon.
#[derive(Parser)]
#[command(name = "dawn-voice", version, about)]
struct Cli {
    /// Path to a TOML configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Input (capture) device name; overrides config.
    #[arg(long)]
    capture: Option<String>,

    /// Output (playback) device name; overrides config.
    #[arg(long)]
    playback: Option<String>,

    /// Disable barge-in (speaking over TTS playback).
    #[arg(long)]
    no_bargein: bool,

    /// Log level, forwarded to `tracing_subscriber`'s `EnvFilter`; falls
    /// back to `RUST_LOG`, then `info`.
    #[arg(long)]
    log_level: Option<String>,

    /// List available input/output devices and exit, without starting the
    /// pipeline.
    #[arg(long)]
    list_devices: bool,

    /// Directory for `chat_history_*.json` / `dawn_stats_*.json`; overrides
    /// the config file and platform default.
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// The command table only; unmatched text is dropped, no LLM call.
    #[arg(long, conflicts_with_all = ["llm_commands", "llm_only"])]
    commands_only: bool,

    /// The command table first, falling through to the LLM on no match.
    #[arg(long, conflicts_with_all = ["commands_only", "llm_only"])]
    llm_commands: bool,

    /// Every recognized utterance goes straight to the LLM.
    #[arg(long, conflicts_with_all = ["commands_only", "llm_commands"])]
    llm_only: bool,
}

impl Cli {
    fn pipeline_mode(&self) -> Option<ConfigPipelineMode> {
        if self.commands_only {
            Some(ConfigPipelineMode::DirectOnly)
        } else if self.llm_commands {
            Some(ConfigPipelineMode::DirectFirst)
        } else if self.llm_only {
            Some(ConfigPipelineMode::LlmOnly)
        } else {
            None
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(match &cli.log_level {
            Some(level) => EnvFilter::new(level),
            None => EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("dawn_voice=info,cpal=warn")),
        })
        .init();

    if cli.list_devices {
        for name in CpalCapture::list_input_devices()? {
            println!("input: {name}");
        }
        for name in CpalPlayback::list_output_devices()? {
            println!("output: {name}");
        }
        return Ok(());
    }

    let mut config = match &cli.config {
        Some(path) => match SpeechConfig::from_file(path) {
            Ok(config) => config,
            Err(e) => {
                error!("failed to load config from {}: {e}", path.display());
                std::process::exit(1);
            }
        },
        None => SpeechConfig::default(),
    };

    if let Some(device) = cli.capture {
        config.audio.input_device = Some(device);
    }
    if let Some(device) = cli.playback {
        config.audio.output_device = Some(device);
    }
    if cli.no_bargein {
        config.barge_in.enabled = false;
    }
    if let Some(dir) = cli.data_dir {
        config.data.data_dir = dir;
    }
    if let Some(mode) = cli.pipeline_mode() {
        config.pipeline.mode = mode;
    }

    if let Err(e) = run(config).await {
        error!("fatal error during initialization: {e}");
        std::process::exit(1);
    }
    Ok(())
}

async fn run(config: SpeechConfig) -> anyhow::Result<()> {
    info!("dawn-voice v{} starting", env!("CARGO_PKG_VERSION"));

    let ring = Arc::new(dawn_voice::ring_buffer::RingBuffer::new(&config.ring_buffer));
    let vad = VadGate::new(&config.vad, config.audio.input_sample_rate)?;
    let asr_engine = stub_engine_for(&config.stt, config.audio.input_sample_rate);
    let asr = ChunkingManager::new(asr_engine, &config.stt);
    let input_queue = Arc::new(InputQueue::new());

    let llm = Arc::new(ApiLlm::new(&config.llm)?);
    let metrics = Arc::new(Metrics::new());

    let playback_sink: Arc<dyn dawn_voice::tts::PlaybackSink> =
        match CpalPlaybackSink::new(&config.audio) {
            Ok(sink) => Arc::new(sink),
            Err(e) => {
                warn!("no playback device available ({e}); TTS audio will be discarded");
                Arc::new(dawn_voice::tts::NullPlaybackSink)
            }
        };
    let tts_engine = Arc::new(dawn_voice::tts::StubTtsEngine::new(config.tts.sample_rate));
    let tts = TtsGateway::new(tts_engine, playback_sink, Arc::clone(&metrics));

    let dispatcher = match &config.command_table.table_path {
        Some(path) => match CommandTable::from_file(path) {
            Ok(table) => Some(CommandDispatcher::new(
                table,
                DeviceRegistry::new(),
                config.command_table.max_recursion,
            )),
            Err(e) => {
                warn!("failed to load command table from {}: {e}", path.display());
                None
            }
        },
        None => None,
    };

    let cancel_llm = Arc::new(AtomicBool::new(false));
    let quit = Arc::new(AtomicBool::new(false));

    let lifecycle = Lifecycle::new(Arc::clone(&quit), Arc::clone(&cancel_llm));
    lifecycle.install_sigint_handler();

    let capture = CpalCapture::new(&config.audio)?;
    let capture_ring = Arc::clone(&ring);
    let capture_cancel = lifecycle.capture_cancel_token();
    tokio::spawn(async move {
        if let Err(e) = capture.run(capture_ring, capture_cancel).await {
            error!("capture worker stopped: {e}");
        }
    });

    let mut pipeline = Pipeline::new(
        &config,
        ring,
        vad,
        asr,
        input_queue,
        llm,
        Arc::clone(&tts),
        dispatcher,
        None,
        Arc::clone(&metrics),
        Arc::clone(&cancel_llm),
        Arc::clone(&quit),
    );

    info!("listening");
    while !pipeline.should_quit() {
        pipeline.tick(Instant::now()).await?;
    }

    let conversation = pipeline.conversation_snapshot();
    lifecycle
        .shutdown(
            pipeline.llm_worker_mut(),
            &tts,
            conversation,
            &metrics,
            &config.data.data_dir,
        )
        .await?;

    Ok(())
}
