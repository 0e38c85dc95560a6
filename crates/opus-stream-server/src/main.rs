mod api;
mod config;
mod openapi;
mod startup;
mod state;
mod ws;

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

pub(crate) const VERSION: &str = concat!(
    env!("CARGO_PKG_VERSION"),
    " (",
    env!("GIT_SHA"),
    ", ",
    env!("BUILD_DATE"),
    ")"
);

#[derive(Parser, Debug)]
#[command(name = "opus-stream-server", version = VERSION)]
pub(crate) struct Args {
    /// HTTP bind address, e.g. 127.0.0.1:42069
    #[arg(long)]
    bind: Option<SocketAddr>,

    /// Source audio file streamed to every client
    #[arg(long)]
    asset: Option<PathBuf>,

    /// Directory served at `/` (player page)
    #[arg(long)]
    static_dir: Option<PathBuf>,

    /// Optional server config file (TOML)
    #[arg(long)]
    config: Option<PathBuf>,
}

#[actix_web::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("info,actix_web=info,opus_stream_server=info,opus_stream_core=info")
        }))
        .init();

    startup::run(args).await
}
