use clap::{Parser, Subcommand};

use crate::relay::ServeArgs;
use crate::tail::TailArgs;

#[derive(Debug, Parser)]
#[command(author, version, about = "Live quote relay with an in-memory HTTP cache")]
pub struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

impl Cli {
    pub fn command(self) -> Command {
        self.command.unwrap_or_default()
    }
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the feed supervisor, refresh loop and HTTP API
    Serve(ServeArgs),
    /// Stream simulated quotes to stdout without starting the API
    Tail(TailArgs),
}

impl Default for Command {
    fn default() -> Self {
        Command::Serve(ServeArgs::default())
    }
}
