use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use mapsmith_contracts::ProviderConfigInput;
use mapsmith_engine::{EngineConfig, GenerationCoordinator, ImagePayload};
use serde::Serialize;
use serde_json::Value;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "mapsmith", version, about = "Structural map generation and cache")]
struct Cli {
    /// Overrides MAPSMITH_CACHE_DIR.
    #[arg(long, global = true)]
    cache_dir: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Return the cached map pack for an image, generating it if needed.
    Ensure(EnsureArgs),
    /// Read or update per-image map settings.
    #[command(subcommand)]
    Settings(SettingsCommand),
    /// List providers with a cached pack for a fingerprint.
    Providers(FingerprintArgs),
    /// Print the cache key of an image.
    Fingerprint(ImageArgs),
}

#[derive(Debug, Parser)]
struct EnsureArgs {
    #[arg(long)]
    image: PathBuf,
    /// `local` or `remote`.
    #[arg(long)]
    provider: Option<String>,
    #[arg(long)]
    allow_fallback: Option<bool>,
    #[arg(long)]
    model: Option<String>,
    #[arg(long, allow_negative_numbers = true)]
    max_retries: Option<i64>,
}

#[derive(Debug, Subcommand)]
enum SettingsCommand {
    Get(FingerprintArgs),
    Update(SettingsUpdateArgs),
}

#[derive(Debug, Parser)]
struct FingerprintArgs {
    #[arg(long)]
    fingerprint: String,
}

#[derive(Debug, Parser)]
struct SettingsUpdateArgs {
    #[arg(long)]
    fingerprint: String,
    /// Partial settings document, e.g. `{"maps":{"depth":{"strength":0.3}}}`.
    #[arg(long)]
    json: String,
}

#[derive(Debug, Parser)]
struct ImageArgs {
    #[arg(long)]
    image: PathBuf,
}

fn main() {
    init_tracing();
    match run() {
        Ok(()) => {}
        Err(err) => {
            eprintln!("mapsmith error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Fingerprint(args) => print_fingerprint(&args),
        command => {
            let coordinator = build_coordinator(cli.cache_dir.as_deref())?;
            run_with(&coordinator, command)
        }
    }
}

fn run_with(coordinator: &GenerationCoordinator, command: Command) -> Result<()> {
    match command {
        Command::Ensure(args) => {
            let image = read_image(&args.image)?;
            let pack = coordinator.ensure(&image, &provider_input(&args))?;
            print_json(&pack)
        }
        Command::Settings(SettingsCommand::Get(args)) => {
            print_json(&coordinator.get_settings(&args.fingerprint)?)
        }
        Command::Settings(SettingsCommand::Update(args)) => {
            let partial: Value =
                serde_json::from_str(&args.json).context("--json is not valid JSON")?;
            print_json(&coordinator.update_settings(&args.fingerprint, &partial)?)
        }
        Command::Providers(args) => print_json(&coordinator.list_providers(&args.fingerprint)?),
        Command::Fingerprint(args) => print_fingerprint(&args),
    }
}

fn print_fingerprint(args: &ImageArgs) -> Result<()> {
    let image = read_image(&args.image)?;
    print_json(&serde_json::json!({ "fingerprint": image.fingerprint() }))
}

fn build_coordinator(cache_dir: Option<&Path>) -> Result<GenerationCoordinator> {
    let mut config = EngineConfig::from_env().context("invalid environment configuration")?;
    if let Some(cache_dir) = cache_dir {
        config.cache_dir = cache_dir.to_path_buf();
    }
    tracing::debug!(
        cache_dir = %config.cache_dir.display(),
        worker = %config.worker_command,
        "engine configured"
    );
    Ok(config.build_coordinator()?)
}

fn provider_input(args: &EnsureArgs) -> ProviderConfigInput {
    ProviderConfigInput {
        provider: args.provider.clone(),
        allow_fallback: args.allow_fallback,
        model_id: args.model.clone(),
        max_retries: args.max_retries,
    }
}

/// Raw image bytes, or a file holding a `data:` URL.
fn read_image(path: &Path) -> Result<ImagePayload> {
    let bytes = fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    if bytes.starts_with(b"data:") {
        let text = String::from_utf8(bytes)
            .with_context(|| format!("{} is not a UTF-8 data URL", path.display()))?;
        return Ok(ImagePayload::from_data_url(&text)?);
    }
    Ok(ImagePayload::from_bytes(bytes)?)
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
