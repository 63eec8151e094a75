//! CLI entry points for the `rq` binary.

use std::ffi::OsString;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use serde_json::json;

use crate::config::Config;
use crate::reactive::Store;
use crate::server::{Action, ActionMap, Mutation, Query};

#[derive(Debug, Parser)]
#[command(name = "rq", about = "Reactive query server", version)]
pub struct Cli {
    /// Increase log verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the server with the built-in demo endpoint.
    Serve {
        /// Listen address override, e.g. 127.0.0.1:4600
        #[arg(long)]
        listen: Option<String>,
    },
}

pub fn parse_from<I, T>(args: I) -> Cli
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    Cli::parse_from(args)
}

pub fn run(cli: Cli) -> crate::Result<()> {
    match cli.command {
        Command::Serve { listen } => {
            let mut config = Config::default();
            match crate::config::load() {
                Ok(loaded) => config = loaded,
                Err(err) => tracing::debug!("using default config: {err}"),
            }
            if let Some(listen) = listen {
                config.listen_addr = listen;
            }
            crate::server::run(config, demo_endpoint())
        }
    }
}

/// A small self-contained endpoint: a shared counter with a live view.
fn demo_endpoint() -> crate::server::EndpointFactory {
    let counter = Store::new(0i64);
    Arc::new(move || {
        let mut actions = ActionMap::new();
        actions.insert(
            "counter".to_string(),
            Action::Query(Query::from_store(counter.clone())),
        );
        let bump = counter.clone();
        actions.insert(
            "increment".to_string(),
            Action::Mutation(Mutation::new(move |_| {
                bump.mutate(|prev| prev + 1);
                Ok(json!(bump.get()))
            })),
        );
        actions.insert(
            "echo".to_string(),
            Action::Query(Query::immediate(|params| Ok(params))),
        );
        actions
    })
}
