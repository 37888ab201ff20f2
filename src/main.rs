//! geotunnel - CLI entry point
//!
//! Acts as the host application's lifecycle manager: acquires a tunnel,
//! hands out its endpoint and always shuts the engine down on exit.

// Use mimalloc as global allocator
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use geotunnel::config::{TunnelConfigBuilder, SUBSCRIPTION_URL_ENV};
use geotunnel::outbound::{self, classify_link};
use geotunnel::provider::SubscriptionFetcher;
use geotunnel::{Settings, TunnelManager, VERSION};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Endpoint probed by `check` when no URL is given
const DEFAULT_CHECK_URL: &str = "https://www.gstatic.com/generate_204";

#[derive(Parser, Debug)]
#[command(name = "geotunnel")]
#[command(version = VERSION)]
#[command(about = "Local tunnel supervisor for subscription-based proxies")]
struct Args {
    /// Path to settings file
    #[arg(short = 'c', long = "config")]
    config: Option<PathBuf>,

    /// Subscription URL (overrides settings)
    #[arg(long = "subscription-url", env = SUBSCRIPTION_URL_ENV)]
    subscription_url: Option<String>,

    /// Local SOCKS port (overrides settings)
    #[arg(long = "socks-port")]
    socks_port: Option<u16>,

    /// Debug logging, including engine output
    #[arg(short = 'v', long = "verbose")]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Bring a tunnel up and hold it until Ctrl-C
    Proxy,
    /// Fetch one URL through the tunnel (or directly when none is available)
    Check {
        #[arg(long, default_value = DEFAULT_CHECK_URL)]
        url: String,
    },
    /// List subscription candidates
    Candidates,
    /// Decode one link and print the engine configuration
    Decode { link: String },
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(num_cpus::get().clamp(2, 4))
        .enable_all()
        .thread_name("geotunnel-worker")
        .build()?;

    runtime.block_on(async_main(args))
}

async fn async_main(args: Args) -> anyhow::Result<()> {
    let level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(format!("geotunnel={}", level).parse()?)
                .add_directive(format!("engine={}", level).parse()?),
        )
        .init();

    let mut settings = Settings::load_or_default(args.config.as_ref())
        .await
        .context("failed to load settings")?;
    if let Some(url) = args.subscription_url {
        settings.subscription_url = url;
    }
    if let Some(port) = args.socks_port {
        settings.socks_port = port;
    }
    settings.validate()?;

    info!("geotunnel v{}", VERSION);

    match args.command {
        Command::Proxy => run_proxy(&settings).await,
        Command::Check { url } => run_check(&settings, &url).await,
        Command::Candidates => run_candidates(&settings).await,
        Command::Decode { link } => run_decode(&settings, &link),
    }
}

/// Wait for Ctrl-C, or SIGTERM from a service manager on unix
async fn shutdown_signal() -> std::io::Result<&'static str> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut terminate = signal(SignalKind::terminate())?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => result.map(|_| "interrupt"),
            _ = terminate.recv() => Ok("terminate"),
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.map(|_| "interrupt")
    }
}

async fn run_proxy(settings: &Settings) -> anyhow::Result<()> {
    let manager = TunnelManager::from_settings(settings);

    let endpoint = tokio::select! {
        endpoint = manager.get_proxy() => endpoint,
        signal = shutdown_signal() => {
            info!("Received {} signal", signal?);
            manager.shutdown().await;
            return Ok(());
        }
    };

    match endpoint {
        Some(endpoint) => {
            println!("{}", endpoint);
            info!("Tunnel ready, press Ctrl-C to stop");
            info!("Received {} signal", shutdown_signal().await?);
        }
        None => println!("no proxy"),
    }

    manager.shutdown().await;
    Ok(())
}

async fn run_check(settings: &Settings, url: &str) -> anyhow::Result<()> {
    let manager = TunnelManager::from_settings(settings);

    let result = tokio::select! {
        result = check_through(&manager, url) => result,
        signal = shutdown_signal() => {
            signal.map(|name| info!("Received {} signal", name)).map_err(Into::into)
        }
    };

    manager.shutdown().await;
    result
}

async fn check_through<C, S>(manager: &TunnelManager<C, S>, url: &str) -> anyhow::Result<()>
where
    C: geotunnel::provider::CandidateSource,
    S: geotunnel::supervisor::EngineSupervisor,
{
    let mut builder = reqwest::Client::builder().timeout(Duration::from_secs(15));
    match manager.get_proxy().await {
        Some(endpoint) => {
            info!("Using proxy {}", endpoint);
            builder = builder.proxy(endpoint.to_reqwest_proxy()?);
        }
        None => warn!("No proxy available, connecting directly"),
    }

    let resp = builder.build()?.get(url).send().await?;
    println!("{} {}", resp.status(), url);
    Ok(())
}

async fn run_candidates(settings: &Settings) -> anyhow::Result<()> {
    let fetcher = SubscriptionFetcher::from_settings(settings);
    let (links, origin) = fetcher.fetch_with_origin().await;
    info!("{} candidate(s) from {}", links.len(), origin);

    for link in links {
        let tier = classify_link(&link)
            .map(|scheme| format!("{:<6} {:<11}", scheme, scheme.tier()))
            .unwrap_or_default();
        println!("{} {}", tier, link);
    }
    Ok(())
}

fn run_decode(settings: &Settings, link: &str) -> anyhow::Result<()> {
    let outbound = outbound::decode(link)?;
    info!("Decoded {}", outbound);

    let config = TunnelConfigBuilder::from_settings(settings).build(&outbound);
    println!("{}", config.to_json()?);
    Ok(())
}
