use crate::server::{self, AppState};
use crate::utils::{format_bytes, format_duration};
use crate::{
    install_prometheus, BlobStore, CacheKey, ChromeLauncher, Config, ConfigError, MemoryBlobStore,
    Metrics, PoolSettings, PooledRenderer, RateLimiter, RenderRequest, RendererPool,
    S3BlobStore, ScreenshotQuery, ScreenshotService, StorageBackend, StorageConfig,
    IDLE_ENGINE_TTL,
};
use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "screenshot-server")]
#[command(about = "Web page screenshot service with object-storage caching")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    #[arg(long, global = true, help = "Configuration file path (JSON)")]
    pub config: Option<PathBuf>,

    #[arg(long, global = true, help = "Listen port")]
    pub port: Option<u16>,

    #[arg(long, global = true, help = "Maximum concurrent browser engines")]
    pub pool_size: Option<usize>,

    #[arg(long, global = true, help = "Chrome executable path")]
    pub chrome_path: Option<String>,

    #[arg(long, global = true, help = "Enable verbose logging")]
    pub verbose: bool,
}

/// Raw screenshot parameters, validated exactly like the HTTP query.
#[derive(Args, Debug, Clone)]
pub struct ShotArgs {
    #[arg(short, long, help = "URL to screenshot")]
    pub url: String,

    #[arg(long, help = "Viewport width")]
    pub width: Option<String>,

    #[arg(long, help = "Viewport height")]
    pub height: Option<String>,

    #[arg(long, help = "JPEG quality (1-100)")]
    pub quality: Option<String>,

    #[arg(long, help = "Viewport as WIDTHxHEIGHT, overrides width/height")]
    pub size: Option<String>,
}

impl From<ShotArgs> for ScreenshotQuery {
    fn from(args: ShotArgs) -> Self {
        Self {
            url: Some(args.url),
            width: args.width,
            height: args.height,
            quality: args.quality,
            size: args.size,
        }
    }
}

#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Run the HTTP screenshot service (default)
    Serve,

    /// Take one screenshot through the cache and write it to disk
    Capture {
        #[command(flatten)]
        shot: ShotArgs,

        #[arg(short, long, help = "Output file path")]
        output: PathBuf,

        #[arg(long, help = "Skip the configured store and render directly")]
        no_store: bool,
    },

    /// Print the cache key a request maps to
    Key {
        #[command(flatten)]
        shot: ShotArgs,
    },

    /// Validate a configuration file
    Validate {
        #[arg(short, long, help = "Configuration file to validate")]
        config: PathBuf,
    },
}

impl Cli {
    /// Defaults, then the config file, then environment, then flags.
    pub fn load_config(&self) -> Result<Config, ConfigError> {
        let mut config = match &self.config {
            Some(path) => Config::from_file(path)?,
            None => Config::default(),
        };
        config.apply_env()?;

        if let Some(port) = self.port {
            config.server.port = port;
        }
        if let Some(pool_size) = self.pool_size {
            config.renderer.pool_size = pool_size;
        }
        if let Some(chrome_path) = &self.chrome_path {
            config.renderer.chrome_path = Some(chrome_path.clone());
        }

        config.validate()?;
        Ok(config)
    }
}

pub struct CliRunner {
    args: Cli,
}

impl CliRunner {
    pub fn new(args: Cli) -> Self {
        Self { args }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        match self.args.command.clone().unwrap_or(Commands::Serve) {
            Commands::Serve => {
                let config = self.args.load_config()?;
                run_server(config).await
            }
            Commands::Capture {
                shot,
                output,
                no_store,
            } => {
                let mut config = self.args.load_config()?;
                if no_store {
                    config.storage.backend = StorageBackend::Memory;
                }
                run_capture(config, shot.into(), output).await
            }
            Commands::Key { shot } => run_key(shot.into()),
            Commands::Validate { config } => validate_config(config),
        }
    }
}

pub async fn build_store(config: &StorageConfig) -> Arc<dyn BlobStore> {
    match config.backend {
        StorageBackend::S3 => {
            info!("Using S3 store, bucket {}", config.bucket);
            Arc::new(S3BlobStore::new(config).await)
        }
        StorageBackend::Memory => {
            warn!("Using in-memory store; cached screenshots are lost on restart");
            Arc::new(MemoryBlobStore::new())
        }
    }
}

async fn run_server(config: Config) -> anyhow::Result<()> {
    info!("Starting screenshot-server v{}", env!("CARGO_PKG_VERSION"));
    info!(
        "Renderer pool: {} engines, {} kept idle",
        config.renderer.pool_size, config.renderer.max_idle
    );

    let prometheus = if config.metrics.enabled {
        Some(install_prometheus().context("Failed to install metrics recorder")?)
    } else {
        None
    };
    let metrics = Arc::new(Metrics::new());

    let store = build_store(&config.storage).await;
    let pool = Arc::new(RendererPool::new(
        ChromeLauncher::new(config.renderer.clone()),
        PoolSettings::from(&config.renderer),
        metrics.clone(),
    ));
    let renderer = Arc::new(PooledRenderer::from_config(pool.clone(), &config.renderer));
    let service = Arc::new(ScreenshotService::new(store, renderer, metrics.clone()));

    let mut state = AppState::new(service);
    let mut limiter = None;
    if config.rate_limit.enabled {
        let rate_limiter = Arc::new(RateLimiter::from_config(&config.rate_limit, metrics.clone()).await);
        info!(
            "Rate limiting {} requests per {} per client ({} counters)",
            config.rate_limit.max_requests,
            format_duration(config.rate_limit.window),
            rate_limiter.store_name()
        );
        state = state.with_rate_limiter(rate_limiter.clone());
        limiter = Some(rate_limiter);
    }
    if let Some(handle) = prometheus {
        state = state.with_prometheus(handle);
    }

    let maintenance = {
        let pool = pool.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(60));
            loop {
                ticker.tick().await;
                let swept = pool.sweep_idle(IDLE_ENGINE_TTL).await;
                let pruned = limiter.as_ref().map(|l| l.prune()).unwrap_or(0);
                if swept > 0 || pruned > 0 {
                    info!("Maintenance: closed {} idle engines, pruned {} rate-limit clients", swept, pruned);
                }
            }
        })
    };

    let host: std::net::IpAddr = config
        .server
        .host
        .parse()
        .with_context(|| format!("Invalid listen host {}", config.server.host))?;
    let addr = SocketAddr::new(host, config.server.port);

    let result = server::serve(addr, server::router(state), server::shutdown_signal()).await;

    maintenance.abort();
    pool.shutdown().await;
    info!("Server shutdown complete");

    result.context("HTTP server failed")
}

async fn run_capture(config: Config, query: ScreenshotQuery, output: PathBuf) -> anyhow::Result<()> {
    let metrics = Arc::new(Metrics::noop());
    let store = build_store(&config.storage).await;
    let pool = Arc::new(RendererPool::new(
        ChromeLauncher::new(config.renderer.clone()),
        PoolSettings {
            max_active: 1,
            max_idle: 0,
            max_uses: 1,
        },
        metrics.clone(),
    ));
    let renderer = Arc::new(PooledRenderer::from_config(pool.clone(), &config.renderer));
    let service = ScreenshotService::new(store, renderer, metrics);

    let started = Instant::now();
    let result = service.screenshot(&query).await;
    pool.shutdown().await;

    let mut screenshot = result?;
    let persist = screenshot.persist.take();
    let source = screenshot.source;
    let key = screenshot.key.clone();
    let bytes = screenshot.into_bytes().await?;

    if let Some(persist) = persist {
        persist.await.context("Store write task failed")?;
    }

    tokio::fs::write(&output, &bytes)
        .await
        .with_context(|| format!("Failed to write {}", output.display()))?;

    println!("Key:    {}", key);
    println!("Cache:  {}", source.as_header());
    println!("Size:   {}", format_bytes(bytes.len()));
    println!("Time:   {}", format_duration(started.elapsed()));
    println!("Output: {}", output.display());
    Ok(())
}

fn run_key(query: ScreenshotQuery) -> anyhow::Result<()> {
    let request = RenderRequest::from_query(&query)?;
    println!("{}", CacheKey::for_request(&request));
    Ok(())
}

fn validate_config(path: PathBuf) -> anyhow::Result<()> {
    println!("Validating configuration: {}", path.display());

    let config = Config::from_file(&path)?;
    config.validate()?;

    println!("Configuration is valid:");
    println!("  Listen: {}:{}", config.server.host, config.server.port);
    println!("  Storage: {:?} (bucket {:?})", config.storage.backend, config.storage.bucket);
    println!(
        "  Renderer: {} engines, navigation timeout {}",
        config.renderer.pool_size,
        format_duration(config.renderer.navigation_timeout)
    );
    println!(
        "  Rate limit: {} ({} per {})",
        if config.rate_limit.enabled { "on" } else { "off" },
        config.rate_limit.max_requests,
        format_duration(config.rate_limit.window)
    );

    Ok(())
}

pub fn setup_logging(verbose: bool) -> anyhow::Result<()> {
    let default_filter = if verbose {
        "screenshot_server=debug,tower_http=debug"
    } else {
        "screenshot_server=info,tower_http=info"
    };

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter.into()))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .try_init()
        .context("Failed to initialise logging")?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_to_serve() {
        let cli = Cli::parse_from(["screenshot-server"]);
        assert!(cli.command.is_none());
        assert!(!cli.verbose);
    }

    #[test]
    fn test_parse_capture() {
        let cli = Cli::parse_from([
            "screenshot-server",
            "capture",
            "--url",
            "https://example.com",
            "--size",
            "800x600",
            "--output",
            "shot.jpg",
            "--no-store",
            "--verbose",
        ]);
        assert!(cli.verbose);
        match cli.command {
            Some(Commands::Capture { shot, output, no_store }) => {
                assert_eq!(shot.url, "https://example.com");
                assert_eq!(shot.size.as_deref(), Some("800x600"));
                assert_eq!(output, PathBuf::from("shot.jpg"));
                assert!(no_store);

                let request = RenderRequest::from_query(&shot.into()).unwrap();
                assert_eq!((request.width(), request.height()), (800, 600));
            }
            _ => panic!("expected capture command"),
        }
    }

    #[test]
    fn test_flag_overrides_apply_last() {
        let cli = Cli::parse_from([
            "screenshot-server",
            "--port",
            "8081",
            "--pool-size",
            "3",
            "key",
            "--url",
            "https://example.com",
        ]);
        let mut config = Config::default();
        config.storage.backend = StorageBackend::Memory;
        let path = std::env::temp_dir().join(format!("screenshot-server-cli-{}.json", uuid::Uuid::new_v4()));
        std::fs::write(&path, serde_json::to_string(&config).unwrap()).unwrap();

        let cli = Cli {
            config: Some(path.clone()),
            ..cli
        };
        let loaded = cli.load_config();
        std::fs::remove_file(&path).ok();

        let loaded = loaded.unwrap();
        assert_eq!(loaded.server.port, 8081);
        assert_eq!(loaded.renderer.pool_size, 3);
    }
}
