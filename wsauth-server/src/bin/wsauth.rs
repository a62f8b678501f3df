//! wsauth server runner. Run as a command-line tool.

use clap::{Parser, Subcommand};
use std::process::ExitCode;
use wsauth_server::serve::ServeCommand;

#[derive(Debug, Parser)]
#[command(version, about)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
#[command(about)]
pub enum Command {
    /// Run the authentication server.
    Serve(ServeCommand),
}

impl Command {
    /// Name of the subcommand as typed on the command line.
    fn name(&self) -> &'static str {
        match self {
            Command::Serve(_) => "serve",
        }
    }

    async fn run(self) -> miette::Result<()> {
        match self {
            Command::Serve(serve_cmd) => wsauth_server::serve::serve(serve_cmd).await,
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let command = Args::parse().command;
    let name = command.name();

    match command.run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Failed to run `wsauth {name}`:\n{e:?}");
            ExitCode::FAILURE
        }
    }
}
