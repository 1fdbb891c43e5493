use clap::Parser;
use pac_engine::{ConfigLoader, ConfigValidator, PacResolver, PacSource};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing_subscriber::{filter::LevelFilter, EnvFilter};

mod http_connect;
mod server;
mod signals;

#[derive(Parser, Debug)]
#[command(name = "pacproxy")]
#[command(about = "Local HTTP proxy that routes each request as a PAC script decides")]
#[command(version)]
struct Args {
    /// PAC script: inline JavaScript, http(s) URL or file path
    #[arg(short = 'c', long = "pac")]
    pac: Option<String>,

    /// Address to listen on
    #[arg(short = 'l', long)]
    listen: Option<String>,

    /// Configuration file path
    #[arg(long)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(long, short = 'v')]
    verbose: bool,
}

fn init_logging(verbose: bool) {
    let level = if verbose {
        LevelFilter::DEBUG
    } else {
        LevelFilter::INFO
    };

    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(level.into())
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .try_init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(args.verbose);

    let mut config = ConfigLoader::load_or_default(args.config)?;
    if let Some(pac) = args.pac {
        config.pac.source = pac;
    }
    if let Some(listen) = args.listen {
        config.server.listen = listen;
    }
    ConfigValidator::validate(&config)?;

    let resolver = Arc::new(PacResolver::with_options(config.resolver_options())?);
    let source = PacSource::detect(&config.pac.source);
    let text = source.fetch().await?;
    resolver.load_from(&text, source)?;

    signals::spawn(resolver.clone())?;

    let listener = TcpListener::bind(&config.server.listen).await?;
    tracing::info!("Listening on {}", listener.local_addr()?);

    server::run(listener, resolver).await
}
