//! Cached Downloader CLI
//!
//! Fetches a single artifact through the download cache and writes it to a
//! local path.

use anyhow::{anyhow, Context, Result};
use std::env;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};
use url::Url;

use cached_downloader::{
    CacheTransformer, CachedDownloader, DownloaderConfig, NoopTransformer, TarTransformer,
};

/// CLI command
#[derive(Debug)]
enum Command {
    /// Fetch one artifact
    Fetch {
        url: Url,
        output: PathBuf,
        cache_key: String,
        normalize_archive: bool,
        config: Option<PathBuf>,
    },
    /// Show help
    Help,
}

fn print_help() {
    eprintln!(
        r#"Cached Downloader - HTTP download cache with conditional revalidation

USAGE:
    cached-downloader fetch <url> <output> [--key <cache_key>] [--tar] [--config <file>]
    cached-downloader help

COMMANDS:
    fetch   Download <url> through the cache and write the artifact to <output>
    help    Show this help message

OPTIONS:
    --key <cache_key>   Cache the artifact under this key (default: uncached)
    --tar               Normalize tar, tar.gz and zip archives into a plain tar
    --config <file>     JSON configuration file

ENVIRONMENT:
    CACHED_DOWNLOADER_CACHE_DIR              Cache directory (wiped on startup)
    CACHED_DOWNLOADER_TMP_DIR                Scratch directory for downloads
    CACHED_DOWNLOADER_MAX_SIZE               Cache capacity in bytes
    CACHED_DOWNLOADER_TIMEOUT_SECS           Per-request timeout
    CACHED_DOWNLOADER_MAX_CONCURRENT         Simultaneous downloads
    CACHED_DOWNLOADER_SKIP_SSL_VERIFICATION  Accept invalid certificates (true/false)
    RUST_LOG                                 Log filter (trace, debug, info, warn, error)
"#
    );
}

fn parse_args() -> Result<Command> {
    let args: Vec<String> = env::args().collect();

    if args.len() < 2 {
        return Ok(Command::Help);
    }

    match args[1].as_str() {
        "fetch" => {
            if args.len() < 4 {
                return Err(anyhow!(
                    "Usage: cached-downloader fetch <url> <output> [--key <cache_key>] [--tar] [--config <file>]"
                ));
            }
            let url = Url::parse(&args[2]).with_context(|| format!("Invalid URL: {}", args[2]))?;
            let output = PathBuf::from(&args[3]);

            let mut cache_key = String::new();
            let mut normalize_archive = false;
            let mut config = None;

            let mut rest = args[4..].iter();
            while let Some(arg) = rest.next() {
                match arg.as_str() {
                    "--key" => {
                        cache_key = rest
                            .next()
                            .ok_or_else(|| anyhow!("--key requires a value"))?
                            .clone();
                    }
                    "--tar" => normalize_archive = true,
                    "--config" => {
                        config = Some(PathBuf::from(
                            rest.next()
                                .ok_or_else(|| anyhow!("--config requires a value"))?,
                        ));
                    }
                    other => return Err(anyhow!("Unknown option: {}", other)),
                }
            }

            Ok(Command::Fetch {
                url,
                output,
                cache_key,
                normalize_archive,
                config,
            })
        }
        "help" | "--help" | "-h" => Ok(Command::Help),
        _ => {
            eprintln!("Unknown command: {}", args[1]);
            Ok(Command::Help)
        }
    }
}

fn load_config(path: Option<&PathBuf>) -> Result<DownloaderConfig> {
    let config = match path {
        Some(path) => DownloaderConfig::from_file(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => DownloaderConfig::default(),
    };
    Ok(config.with_env_overrides()?)
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = FmtSubscriber::builder().with_env_filter(filter).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    // Parse command
    let command = match parse_args() {
        Ok(cmd) => cmd,
        Err(e) => {
            eprintln!("Error: {}", e);
            print_help();
            std::process::exit(1);
        }
    };

    match command {
        Command::Fetch {
            url,
            output,
            cache_key,
            normalize_archive,
            config,
        } => {
            let config = load_config(config.as_ref())?;
            let downloader = CachedDownloader::new(&config).context("Failed to start downloader")?;

            let transformer: Arc<dyn CacheTransformer> = if normalize_archive {
                Arc::new(TarTransformer)
            } else {
                Arc::new(NoopTransformer)
            };

            // Cancel the fetch on Ctrl+C
            let cancel = CancellationToken::new();
            let signal_token = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("Received interrupt, cancelling download...");
                    signal_token.cancel();
                }
            });

            info!(url = %url, key = %cache_key, "Fetching artifact...");

            let outcome = match downloader.fetch(&url, &cache_key, transformer, &cancel).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    error!(url = %url, error = %e, "Fetch failed");
                    return Err(e.into());
                }
            };

            // The cache directory is wiped on startup, so a single run always downloads
            let (mut file, _) = outcome.into_parts();

            let mut out = tokio::fs::File::create(&output)
                .await
                .with_context(|| format!("Failed to create {}", output.display()))?;
            let written = tokio::io::copy(&mut file, &mut out).await?;
            out.flush().await?;
            file.close()?;

            println!("Downloaded artifact: {} bytes -> {}", written, output.display());

            downloader.cache().log_metrics();
        }
        Command::Help => {
            print_help();
        }
    }

    Ok(())
}
