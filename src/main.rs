use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use undertow::config::Config;
use undertow::cover::CoverResolver;
use undertow::gateway::SourceGateway;
use undertow::proxy::ProxyCircuitBreaker;
use undertow::resolver::{ResolveOptions, ResolverCache};
use undertow::service::{HttpLookupService, HttpStreamExtractor, ReqwestFetcher};
use undertow::track::Track;

#[derive(Parser)]
#[command(name = "undertow")]
#[command(about = "Resolve library tracks to playable streams", long_about = None)]
struct Cli {
    /// Configuration file (defaults to the user config directory)
    #[arg(short, long, global = true, env = "UNDERTOW_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Resolve a track to a stream URL
    Resolve {
        /// Track title
        name: String,
        /// Artist name, repeatable
        #[arg(short, long = "artist")]
        artists: Vec<String>,
        /// Skip the lookup and use this stream id
        #[arg(long)]
        video_id: Option<String>,
        #[arg(long)]
        duration_ms: Option<u64>,
        /// Ignore cached streams
        #[arg(long)]
        refresh: bool,
    },
    /// Find cover art for a track or playlist
    Cover {
        name: String,
        #[arg(short, long)]
        artist: Option<String>,
        /// Search playlist covers instead of track covers
        #[arg(long)]
        playlist: bool,
    },
    /// Show the configuration
    Config {
        /// Print the config file path only
        #[arg(long)]
        path: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "undertow=info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };

    match cli.command {
        Commands::Resolve {
            name,
            artists,
            video_id,
            duration_ms,
            refresh,
        } => {
            let artists: Vec<&str> = artists.iter().map(String::as_str).collect();
            let mut track = Track::new(&name, &artists);
            track.video_id = video_id;
            track.duration_ms = duration_ms;
            resolve(&config, track, refresh).await?;
        }
        Commands::Cover {
            name,
            artist,
            playlist,
        } => {
            cover(&config, &name, artist.as_deref(), playlist).await?;
        }
        Commands::Config { path } => {
            if path {
                let path = match cli.config {
                    Some(path) => path,
                    None => Config::config_path()?,
                };
                println!("{}", path.display());
            } else {
                print!(
                    "{}",
                    toml::to_string_pretty(&config).context("Failed to serialize config")?
                );
            }
        }
    }

    Ok(())
}

fn http_client(config: &Config) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(Duration::from_millis(config.services.request_timeout_ms))
        .build()
        .context("Failed to build HTTP client")
}

async fn resolve(config: &Config, mut track: Track, refresh: bool) -> Result<()> {
    let client = http_client(config)?;
    let timeout = Duration::from_millis(config.services.request_timeout_ms);
    let gateway = SourceGateway::new(
        Arc::new(HttpLookupService::new(
            client.clone(),
            &config.services.lookup_url,
            timeout,
        )),
        Arc::new(HttpStreamExtractor::new(
            client.clone(),
            &config.services.extraction_url,
            timeout,
        )),
        Arc::new(ReqwestFetcher::new(client)),
        config,
    );
    let resolver = ResolverCache::new(
        Arc::new(gateway),
        Duration::from_secs(config.cache.resolution_ttl_secs),
        config.cache.capacity,
    );

    let options = if refresh {
        ResolveOptions::refresh()
    } else {
        ResolveOptions::default()
    };
    let result = resolver
        .get_or_create(&mut track, 0, options)
        .await
        .with_context(|| format!("No playable stream for \"{}\"", track.name))?;

    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}

async fn cover(config: &Config, name: &str, artist: Option<&str>, playlist: bool) -> Result<()> {
    let fetcher = Arc::new(ReqwestFetcher::new(http_client(config)?));
    let breaker = Arc::new(ProxyCircuitBreaker::new(fetcher, config.proxies.clone()));
    let covers = CoverResolver::new(breaker, config);

    if playlist {
        match covers.playlist_cover(name).await {
            Some(url) => println!("{}", url),
            None => anyhow::bail!("No cover for playlist \"{}\"", name),
        }
    } else {
        println!("{}", covers.track_cover(name, artist.unwrap_or_default()).await);
    }
    Ok(())
}
