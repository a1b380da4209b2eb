// src/main.rs

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::collections::BTreeMap;
use std::path::PathBuf;
use stratum::{
    BuildConfig, CliObserver, ConfigOverrides, ImageBuilder, LayerCache,
};

#[derive(Parser)]
#[command(name = "stratum")]
#[command(author, version, about = "Daemonless OCI image builder with registry push", long_about = None)]
struct Cli {
    /// Verbose output with debug-level logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build an OCI image from a project directory
    Build {
        /// Path to a stratum.toml config file
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Image reference to build (e.g. ghcr.io/user/app:v1)
        #[arg(short, long)]
        tag: Option<String>,
        /// Base image to layer on (e.g. python:3.11-slim)
        #[arg(short, long)]
        base_image: Option<String>,
        /// Project context directory
        #[arg(long, default_value = ".")]
        context: PathBuf,
        /// OCI layout output directory
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Target platform (e.g. linux/amd64, linux/arm64)
        #[arg(long)]
        platform: Option<String>,
        /// Environment variables (KEY=VALUE, repeatable)
        #[arg(short, long = "env", value_name = "KEY=VALUE")]
        env: Vec<String>,
        /// Image labels (KEY=VALUE, repeatable)
        #[arg(short, long = "label", value_name = "KEY=VALUE")]
        labels: Vec<String>,
        /// Include dependencies from a venv or requirements file
        #[arg(long)]
        include_deps: bool,
        /// Requirements file for the dependency layer
        #[arg(long)]
        requirements: Option<String>,
        /// Disable layer caching, force a full rebuild
        #[arg(long)]
        no_cache: bool,
        /// Custom cache directory (default: ~/.stratum/cache)
        #[arg(long)]
        cache_dir: Option<PathBuf>,
        /// Disable reproducible tar emission
        #[arg(long)]
        no_reproducible: bool,
        /// Log the build plan without building
        #[arg(long)]
        dry_run: bool,
        /// Push the image to its registry after the build
        #[arg(long)]
        push: bool,
        /// Push destination, overriding the build tag
        #[arg(long)]
        destination: Option<String>,
        /// Registry username (or REGISTRY_USERNAME)
        #[arg(short, long)]
        username: Option<String>,
        /// Registry password or token (or REGISTRY_PASSWORD / REGISTRY_TOKEN)
        #[arg(short, long)]
        password: Option<String>,
    },
    /// Manage the layer cache
    Cache {
        #[command(subcommand)]
        command: CacheCommands,
    },
}

#[derive(Subcommand)]
enum CacheCommands {
    /// Remove all cached layers
    Clear {
        /// Cache directory (default: ~/.stratum/cache)
        #[arg(long)]
        cache_dir: Option<PathBuf>,
    },
    /// Show cache usage
    Stats {
        /// Cache directory (default: ~/.stratum/cache)
        #[arg(long)]
        cache_dir: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .init();

    match cli.command {
        Commands::Build {
            config,
            tag,
            base_image,
            context,
            output,
            platform,
            env,
            labels,
            include_deps,
            requirements,
            no_cache,
            cache_dir,
            no_reproducible,
            dry_run,
            push,
            destination,
            username,
            password,
        } => {
            let overrides = ConfigOverrides {
                tag,
                base_image,
                context_dir: Some(context),
                env: Some(parse_key_values(&env)?),
                labels: Some(parse_key_values(&labels)?),
                output_dir: output,
                use_cache: no_cache.then_some(false),
                cache_dir,
                include_deps: include_deps.then_some(true),
                requirements_file: requirements,
                platform,
                reproducible: no_reproducible.then_some(false),
                dry_run: dry_run.then_some(true),
                ..Default::default()
            };

            let mut build_config = match config {
                Some(path) => BuildConfig::from_file(&path)?,
                None => BuildConfig::default(),
            };
            build_config.apply_overrides(overrides);

            let mut builder =
                ImageBuilder::new(build_config).with_observer(Box::new(CliObserver::new()));
            let tag = builder.build()?;
            println!("Built: {tag}");

            if push {
                let pushed =
                    builder.push(destination.as_deref(), username.as_deref(), password.as_deref())?;
                println!("Pushed: {pushed}");
            }
        }
        Commands::Cache { command } => match command {
            CacheCommands::Clear { cache_dir } => {
                let mut cache = open_cache(cache_dir)?;
                cache.clear()?;
                println!("Cache cleared");
            }
            CacheCommands::Stats { cache_dir } => {
                let cache = open_cache(cache_dir)?;
                let stats = cache.stats();
                println!("Entries:  {}", stats.entries);
                println!(
                    "Size:     {:.1} MB / {:.1} MB ({:.1}%)",
                    stats.total_bytes as f64 / (1024.0 * 1024.0),
                    stats.max_bytes as f64 / (1024.0 * 1024.0),
                    stats.usage_percent
                );
            }
        },
    }

    Ok(())
}

/// Parse repeated KEY=VALUE arguments into a map
fn parse_key_values(pairs: &[String]) -> Result<BTreeMap<String, String>> {
    let mut map = BTreeMap::new();
    for pair in pairs {
        let (key, value) = pair
            .split_once('=')
            .ok_or_else(|| anyhow::anyhow!("expected KEY=VALUE, got {pair:?}"))?;
        map.insert(key.to_string(), value.to_string());
    }
    Ok(map)
}

fn open_cache(cache_dir: Option<PathBuf>) -> Result<LayerCache> {
    let dir = cache_dir
        .or_else(|| dirs::home_dir().map(|home| home.join(".stratum").join("cache")))
        .ok_or_else(|| anyhow::anyhow!("no cache directory available"))?;
    Ok(LayerCache::open(
        &dir,
        stratum::config::DEFAULT_MAX_CACHE_SIZE_MB,
    )?)
}
