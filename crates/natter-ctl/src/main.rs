//! natter-ctl — interactive natter chat client.

use std::sync::Arc;

use anyhow::{Context as _, Result};
use tokio::io::{AsyncBufReadExt, BufReader};

use natter_core::{MessageType, NatterConfig};
use natter_services::{
    Client, ClientSettings, DisplayHandler, Env, FileTransfer, PingHandler, Registry,
    SessionSettings,
};

mod cmd;

use cmd::run::{Flow, Runner};
use cmd::{Command, ParseError};

fn print_usage() {
    println!("Usage: natter-ctl [--server <addr>]");
    println!();
    println!("Type `list -all` once connected to see the available commands.");
}

fn server_override() -> Result<Option<String>> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let mut server = None;
    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--server" => {
                i += 1;
                server = Some(args.get(i).context("--server requires an address")?.clone());
            }
            "help" | "--help" | "-h" => {
                print_usage();
                std::process::exit(0);
            }
            other => {
                eprintln!("Unknown argument: {other}");
                eprintln!();
                print_usage();
                std::process::exit(1);
            }
        }
        i += 1;
    }
    Ok(server)
}

async fn read_commands(runner: Runner) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            _ = runner.ctx.closed() => break,
            line = lines.next_line() => line,
        };
        let line = match line {
            Ok(Some(line)) => line,
            Ok(None) => {
                runner.ctx.close().await;
                break;
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to read stdin");
                break;
            }
        };
        let command = match line.parse::<Command>() {
            Ok(command) => command,
            Err(ParseError::Empty) => continue,
            Err(e) => {
                println!("{e}");
                continue;
            }
        };
        match runner.execute(command).await {
            Ok(Flow::Continue) => {}
            Ok(Flow::Exit) => break,
            Err(e) => println!("{e:#}"),
        }
    }
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let mut config = NatterConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        NatterConfig::default()
    });
    if let Some(addr) = server_override()? {
        config.client.server_addr = addr;
    }

    let registry = Registry::new();
    registry.add_handler(MessageType::Ping.code(), Arc::new(PingHandler))?;
    registry.add_handler(
        MessageType::Display.code(),
        Arc::new(DisplayHandler::new(|text| println!("{text}"))),
    )?;

    let settings = ClientSettings::from_config(
        &config.client,
        SessionSettings::from_config(&config.wire),
    );
    let client = Client::dial(&config.client.server_addr, registry.clone(), settings)
        .await
        .with_context(|| format!("failed to connect to {}", config.client.server_addr))?;

    let transfers = Arc::new(FileTransfer::new(client.outbound(), &config.transfer));
    registry.add_handler(MessageType::FileTransfer.code(), transfers.clone())?;

    let runner = Runner {
        outbound: client.outbound(),
        transfers,
        ctx: client.context(),
    };
    let input = tokio::spawn(read_commands(runner));

    client.start().await;
    input.abort();
    Ok(())
}
