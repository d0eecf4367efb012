//! speechd-voices - speak or export text with a cached voice
//!
//! Without `--voice` it lists every voice the configured backends know.

use clap::{CommandFactory, Parser};
use speechd_voices::backends::VoiceFilter;
use speechd_voices::config_loader::Settings;
use speechd_voices::registry::VoiceRegistry;
use speechd_voices::{CallContext, VoiceError};
use std::error::Error;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncReadExt, BufReader};
use tracing::{error, info, warn};

const EXAMPLES: &str = "Examples:
    speechd-voices --voice Xiaoxiao Hello world
    speechd-voices -v Jenny -f story.txt
    speechd-voices -v Jenny -o hello.mp3 Hello";

/// Speak text with a cached text-to-speech voice
#[derive(Parser)]
#[command(name = "speechd-voices")]
#[command(author = "StarTuz")]
#[command(version)]
#[command(about = "Speak or export text with a cached text-to-speech voice", long_about = None)]
#[command(after_help = EXAMPLES)]
struct Cli {
    /// Voice name; omit to list voices
    #[arg(short, long)]
    voice: Option<String>,

    /// Only list voices with this exact language tag (e.g. zh-CN)
    #[arg(short, long)]
    language: Option<String>,

    /// Write the audio to this file instead of playing it
    #[arg(short, long)]
    out: Option<PathBuf>,

    /// Read text from a file, or `-` for stdin
    #[arg(short, long)]
    file: Option<PathBuf>,

    /// Extra config file merged over the defaults
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Deadline in seconds for synthesizing and playing each line
    #[arg(short, long)]
    timeout: Option<u64>,

    /// Text to speak
    text: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let settings = Settings::load(cli.config.as_deref())?;
    let registry = VoiceRegistry::from_settings(&settings)?;

    let root = CallContext::new();
    let interrupt = root.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupted");
            interrupt.cancel();
        }
    });

    let Some(name) = cli.voice.as_deref() else {
        let filter = match cli.language.clone() {
            Some(language) => VoiceFilter::Language(language),
            None => VoiceFilter::All,
        };
        print_voices(&root, &registry, &filter).await?;
        if cli.language.is_none() {
            Cli::command().print_help()?;
        }
        return Ok(());
    };

    let voice = match registry.find(&root, name).await {
        Ok(voice) => voice,
        Err(err @ VoiceError::NotFound(_)) => {
            error!("{err}");
            std::process::exit(1);
        }
        Err(err) => return Err(err.into()),
    };
    info!(voice = %voice, backend = voice.backend_id(), "using voice");

    let timeout = cli
        .timeout
        .map(Duration::from_secs)
        .or(settings.request_timeout());

    let input = open_input(cli.file.as_deref(), &cli.text).await?;
    match cli.out {
        Some(out) => {
            let mut text = String::new();
            let mut input = input;
            root.run(async { Ok(input.read_to_string(&mut text).await?) })
                .await?;
            let text = text.trim();
            if text.is_empty() {
                warn!("nothing to save");
                return Ok(());
            }
            let ctx = match timeout {
                Some(timeout) => root.child().with_timeout(timeout),
                None => root.child(),
            };
            voice.save_to(&ctx, text, &out).await?;
        }
        None => {
            let report = voice.speak_lines(&root, input, timeout).await?;
            let stats = registry.cache().stats();
            info!(
                spoken = report.spoken,
                failed = report.failed,
                cache_hits = stats.hits,
                syntheses = stats.syntheses,
                "done"
            );
        }
    }
    Ok(())
}

async fn print_voices(
    ctx: &CallContext,
    registry: &VoiceRegistry,
    filter: &VoiceFilter,
) -> Result<(), VoiceError> {
    let mut lines: Vec<String> = registry
        .list(ctx, filter)
        .await?
        .iter()
        .map(|v| format!("{} - {}:\t{}", v.language(), v.name(), v.detail()))
        .collect();
    lines.sort();
    for line in lines {
        println!("{line}");
    }
    Ok(())
}

/// Literal arguments win, then `--file` (`-` meaning stdin), then stdin.
async fn open_input(
    file: Option<&Path>,
    text: &[String],
) -> std::io::Result<Box<dyn AsyncBufRead + Unpin + Send>> {
    if !text.is_empty() {
        let mut joined = text.join(" ");
        joined.push('\n');
        return Ok(Box::new(Cursor::new(joined.into_bytes())));
    }
    match file {
        Some(path) if path != Path::new("-") => {
            let file = tokio::fs::File::open(path).await?;
            Ok(Box::new(BufReader::new(file)))
        }
        _ => Ok(Box::new(BufReader::new(tokio::io::stdin()))),
    }
}
