//! tessera CLI entry point.
//!
//! - `tessera run`: start an engine pool and print the text of each image
//! - `tessera precompile`: compile a guest module ahead of time into a `.cwasm`

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use tokio::task::JoinSet;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tessera_common::ConfigFile;
use tessera_core::module::PRECOMPILED_EXTENSION;
use tessera_core::{
    ExtractOptions, GuestModule, LoadOptions, OutputKind, OutputRedirection, WasmEngine,
};
use tessera_pool::{EnginePool, PoolConfig, SubmitOptions};

#[derive(Debug, Parser)]
#[command(name = "tessera", version, about = "Pooled, sandboxed OCR engine clients")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Recognize the text of one or more images.
    Run(RunArgs),
    /// Compile a guest module into a `.cwasm` for faster startup.
    Precompile(PrecompileArgs),
}

#[derive(Debug, Args)]
struct RunArgs {
    /// Guest engine module (`.wasm` or `.cwasm`).
    #[arg(long, env = "TESSERA_GUEST")]
    guest: Option<PathBuf>,

    /// Trained model data.
    #[arg(long, env = "TESSERA_MODEL")]
    model: Option<PathBuf>,

    /// TOML configuration file.
    #[arg(long, env = "TESSERA_CONFIG")]
    config: Option<PathBuf>,

    /// Model language tag.
    #[arg(long)]
    language: Option<String>,

    /// Number of engine clients.
    #[arg(long)]
    workers: Option<usize>,

    /// Emit hOCR instead of plain text.
    #[arg(long)]
    hocr: bool,

    /// Strip underlines before recognition.
    #[arg(long)]
    remove_underlines: bool,

    /// Give up on an image after this many seconds.
    #[arg(long)]
    timeout_secs: Option<u64>,

    /// Images to recognize.
    #[arg(required = true)]
    images: Vec<PathBuf>,
}

#[derive(Debug, Args)]
struct PrecompileArgs {
    /// Guest engine module to compile.
    #[arg(long)]
    guest: PathBuf,

    /// Output path. Defaults to the guest path with a `.cwasm` extension.
    #[arg(long)]
    output: Option<PathBuf>,

    /// TOML configuration file; its engine settings must match the ones
    /// used to load the output.
    #[arg(long, env = "TESSERA_CONFIG")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,tessera=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    match Cli::parse().command {
        Command::Run(args) => run(args).await,
        Command::Precompile(args) => precompile(&args),
    }
}

fn load_config(path: Option<&Path>) -> anyhow::Result<ConfigFile> {
    match path {
        Some(path) => ConfigFile::from_file(path)
            .with_context(|| format!("Failed to load config '{}'", path.display())),
        None => Ok(ConfigFile::default()),
    }
}

async fn run(args: RunArgs) -> anyhow::Result<()> {
    let file = load_config(args.config.as_deref())?;

    let guest = args
        .guest
        .or_else(|| file.guest.path.as_ref().map(PathBuf::from))
        .context("No guest module. Pass --guest or set [guest] path in the config")?;
    let model_path = args
        .model
        .or_else(|| file.model.path.as_ref().map(PathBuf::from))
        .context("No trained model. Pass --model or set [model] path in the config")?;

    let mut model = file.model.config;
    if let Some(language) = args.language {
        model.language = language;
    }
    let workers = args.workers.unwrap_or(file.pool.workers);

    let engine = WasmEngine::new(&file.runtime.engine).context("Failed to create engine")?;
    let module = GuestModule::from_file(&engine, &guest)
        .with_context(|| format!("Failed to load guest module '{}'", guest.display()))?;
    let training_data = tokio::fs::read(&model_path)
        .await
        .with_context(|| format!("Failed to read model '{}'", model_path.display()))?;

    info!(
        guest = %guest.display(),
        model = %model_path.display(),
        workers,
        "Configuration loaded"
    );

    let config = PoolConfig {
        model,
        output: OutputRedirection::from_config(&file.runtime.sandbox),
        sandbox: file.runtime.sandbox,
        startup_timeout: Some(file.pool.startup_timeout()),
        ..PoolConfig::new(module, training_data)
    };
    let pool = Arc::new(
        EnginePool::new(workers, config)
            .await
            .context("Failed to start engine pool")?,
    );

    let extract = ExtractOptions {
        output: if args.hocr {
            OutputKind::Hocr
        } else {
            OutputKind::Text
        },
        load: LoadOptions {
            remove_underlines: args.remove_underlines,
        },
        progress: None,
    };
    let timeout = args.timeout_secs.map(Duration::from_secs);

    let mut tasks = JoinSet::new();
    for (index, image) in args.images.into_iter().enumerate() {
        let pool = Arc::clone(&pool);
        let mut options = SubmitOptions::default().with_extract(extract.clone());
        if let Some(timeout) = timeout {
            options = options.with_timeout(timeout);
        }
        tasks.spawn(async move {
            let result = recognize(&pool, &image, options).await;
            (index, image, result)
        });
    }

    let mut results = Vec::with_capacity(tasks.len());
    while let Some(joined) = tasks.join_next().await {
        results.push(joined.context("Recognition task panicked")?);
    }
    results.sort_by_key(|(index, _, _)| *index);

    let total = results.len();
    let mut failed = 0usize;
    for (_, image, result) in results {
        match result {
            Ok(text) => {
                println!("==> {} <==", image.display());
                println!("{text}");
            }
            Err(e) => {
                failed += 1;
                error!(
                    image = %image.display(),
                    error = %format_args!("{e:#}"),
                    "Recognition failed"
                );
            }
        }
    }

    pool.close().await.context("Failed to close engine pool")?;

    if failed > 0 {
        anyhow::bail!("{failed} of {total} images failed");
    }
    Ok(())
}

async fn recognize(
    pool: &EnginePool,
    image: &Path,
    options: SubmitOptions,
) -> anyhow::Result<String> {
    let file = tokio::fs::File::open(image)
        .await
        .with_context(|| format!("Failed to open image '{}'", image.display()))?
        .into_std()
        .await;
    Ok(pool.submit(file, options).await?)
}

fn precompile(args: &PrecompileArgs) -> anyhow::Result<()> {
    let file = load_config(args.config.as_deref())?;
    let output = args
        .output
        .clone()
        .unwrap_or_else(|| args.guest.with_extension(PRECOMPILED_EXTENSION));

    let engine = WasmEngine::new(&file.runtime.engine).context("Failed to create engine")?;
    let bytes = std::fs::read(&args.guest)
        .with_context(|| format!("Failed to read guest module '{}'", args.guest.display()))?;
    let module =
        GuestModule::from_bytes(&engine, &bytes).context("Failed to compile guest module")?;
    let serialized = module.serialize().context("Failed to serialize guest module")?;

    std::fs::write(&output, &serialized)
        .with_context(|| format!("Failed to write '{}'", output.display()))?;

    info!(
        output = %output.display(),
        bytes_len = serialized.len(),
        "Guest module precompiled"
    );
    Ok(())
}
