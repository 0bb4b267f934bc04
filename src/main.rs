use anyhow::Result;
use clap::Parser;
use market_data_relay::cli::{self, Cli};
use market_data_relay::relay;
use market_data_relay::tail;

#[tokio::main]
async fn main() -> Result<()> {
    match Cli::parse().command() {
        cli::Command::Serve(args) => relay::run_with_config(args.into()).await,
        cli::Command::Tail(args) => tail::run(args).await,
    }
}
