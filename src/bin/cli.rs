//! Command-line demo for llama-session.
//!
//! Drives the full setup/predict pipeline against the scripted mock backend.

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use llama_runtime::{LogTelemetry, MockEngine};
use llama_session::model_utils::{model_type, validate_model};
use llama_session::{PredictionEvent, Session, SessionParams, SessionState};

/// llama-session: serialized prediction sessions
#[derive(Parser)]
#[command(name = "llama-session", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, ValueEnum)]
enum Preset {
    Llama,
    Alpaca,
    Gpt4all,
}

#[derive(Subcommand)]
enum Command {
    /// Run one prediction and stream the tokens to stdout.
    Generate {
        /// Input prompt text.
        #[arg(short, long)]
        prompt: String,

        /// Parameter preset.
        #[arg(long, value_enum, default_value_t = Preset::Llama)]
        preset: Preset,

        /// JSON parameter file; overrides the preset.
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Model path handed to the loader.
        #[arg(short, long, default_value = "models/mock.bin")]
        model: String,

        /// Maximum number of tokens to generate (negative for no limit).
        #[arg(long, allow_negative_numbers = true)]
        max_tokens: Option<i32>,

        /// Stop when the output ends with this text. Repeatable.
        #[arg(long)]
        antiprompt: Vec<String>,

        /// Text the mock backend replies with.
        #[arg(long, default_value = "Hello, world!")]
        reply: String,
    },

    /// Report the size class of a model file.
    Inspect {
        #[arg(short, long)]
        model: PathBuf,
    },
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let result = match cli.command {
        Command::Generate {
            prompt,
            preset,
            config,
            model,
            max_tokens,
            antiprompt,
            reply,
        } => generate(prompt, preset, config, model, max_tokens, antiprompt, reply),
        Command::Inspect { model } => inspect(model),
    };

    if let Err(e) = result {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}

fn generate(
    prompt: String,
    preset: Preset,
    config: Option<PathBuf>,
    model: String,
    max_tokens: Option<i32>,
    antiprompts: Vec<String>,
    reply: String,
) -> llama_session::Result<()> {
    let mut params = match config {
        Some(path) => SessionParams::from_json_file(&path)?,
        None => match preset {
            Preset::Llama => SessionParams::llama(model),
            Preset::Alpaca => SessionParams::alpaca(model),
            Preset::Gpt4all => SessionParams::gpt4all(model),
        },
    };
    if let Some(limit) = max_tokens {
        params.token_limit = limit;
    }
    params.antiprompts.extend(antiprompts);

    let engine = MockEngine::new().with_reply_text(&reply);
    let telemetry = Arc::new(LogTelemetry::new());
    let session = Session::new(Arc::new(engine), params)?.with_telemetry(telemetry.clone());

    let mut stdout = std::io::stdout();
    for event in session.predict(prompt)? {
        match event {
            PredictionEvent::Started => {}
            PredictionEvent::Token(piece) => {
                print!("{piece}");
                let _ = stdout.flush();
            }
            PredictionEvent::Completed => println!(),
            PredictionEvent::Cancelled => println!("\n[cancelled]"),
            PredictionEvent::Failed(err) => return Err(err),
        }
    }

    if let SessionState::Error(err) = session.state() {
        return Err(err);
    }
    if let Some(metrics) = telemetry.last_metrics() {
        eprintln!(
            "{} tokens, {:.1} tok/s, ttft {:.1} ms",
            metrics.generated_tokens, metrics.tokens_per_sec, metrics.ttft_ms
        );
    }
    Ok(())
}

fn inspect(model: PathBuf) -> llama_session::Result<()> {
    let engine = MockEngine::new();
    let kind = model_type(&engine, &model)?;
    println!("Model:  {}", model.display());
    println!("Type:   {kind}");
    match validate_model(&engine, &model) {
        Ok(_) => println!("Status: valid"),
        Err(e) => println!("Status: {e}"),
    }
    Ok(())
}
