mod client;
mod transport;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use client::{Client, ClientConfig};
use cmdbroker_shared::{limits, CommandRequest, CommandResult};
use serde_json::json;
use std::time::Duration;

use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "cmdbroker", about = "Send commands to a cmdbroker server")]
struct Cli {
    /// Server address
    #[arg(short, long, default_value_t = format!("127.0.0.1:{}", limits::DEFAULT_PORT))]
    server: String,

    /// Seconds to wait for each reply
    #[arg(long, default_value_t = limits::DEFAULT_REPLY_TIMEOUT.as_secs())]
    timeout: u64,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run an allow-listed program on the server
    Os {
        name: String,
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        params: Vec<String>,
    },
    /// Evaluate an arithmetic expression
    Compute { expression: String },
    /// Send a payload verbatim, even if it is not valid JSON
    Raw { payload: String },
    /// Fire `count` compute requests at once, one connection each, and check
    /// every reply matches its own request
    Burst {
        count: usize,
        #[arg(long, default_value_t = 0)]
        expression_base: u32,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let cli = Cli::parse();
    let config = ClientConfig {
        server: cli.server,
        reply_timeout: Duration::from_secs(cli.timeout),
        ..Default::default()
    };

    match cli.command {
        Command::Os { name, params } => {
            let result = request(&config, &CommandRequest::os(name, params)).await?;
            print_result(&result)
        }
        Command::Compute { expression } => {
            let result = request(&config, &CommandRequest::compute(expression)).await?;
            print_result(&result)
        }
        Command::Raw { payload } => {
            let mut client = Client::connect(&config).await?;
            let result = client.send_raw(payload.as_bytes()).await?;
            client.close().await?;
            print_result(&result)
        }
        Command::Burst { count, expression_base } => burst(&config, count, expression_base).await,
    }
}

async fn request(config: &ClientConfig, request: &CommandRequest) -> Result<CommandResult> {
    let mut client = Client::connect(config).await?;
    let result = client.send_command(request).await?;
    client.close().await?;
    Ok(result)
}

fn print_result(result: &CommandResult) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(result)?);
    Ok(())
}

/// Concurrent callers, each expecting the answer to its own expression
async fn burst(config: &ClientConfig, count: usize, base: u32) -> Result<()> {
    info!("Sending {} concurrent requests to {}", count, config.server);

    let requests = (0..count).map(|i| {
        let operand = i64::from(base) + i as i64;
        async move {
            let expected = json!(operand * 2 + 1);
            let result = request(config, &CommandRequest::compute(format!("{} * 2 + 1", operand))).await;
            (i, expected, result)
        }
    });

    let mut mismatched = 0;
    let mut failed = 0;
    for (i, expected, result) in futures::future::join_all(requests).await {
        match result {
            Ok(result) if result.field("result") == Some(&expected) => {}
            Ok(result) => {
                mismatched += 1;
                warn!("Request {} expected {} but got {:?}", i, expected, result);
            }
            Err(e) => {
                failed += 1;
                error!("Request {} failed: {:#}", i, e);
            }
        }
    }

    info!(
        "{} ok, {} mismatched, {} failed",
        count - mismatched - failed,
        mismatched,
        failed
    );
    if mismatched > 0 {
        bail!("{} replies did not match their request", mismatched);
    }
    if failed > 0 {
        bail!("{} requests failed", failed);
    }
    Ok(())
}
