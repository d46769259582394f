//! A runnable demo node: connects to a broker, registers an `Echo`
//! command, and either serves (`recv-until-close`, until Ctrl-C) or sends
//! one request (`echo`) before exiting. Gated behind the `cli` feature —
//! the library itself has no CLI dependency.

use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use serde_json::{json, Map, Value};
use swarmbus::broker::redis::{RedisBrokerAdapter, RedisConfig};
use swarmbus::command::{BoxFuture, Command, CommandType, Outcome};
use swarmbus::node::{Node, RecvUntilCloseOptions};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "swarmbus-node", about = "Demo node for the swarmbus command bus")]
struct Cli {
    /// Redis (or Redis-protocol-compatible) broker URL
    #[arg(long, default_value = "redis://127.0.0.1/")]
    url: String,

    /// Broker namespace this node's identity/heartbeat keys live under
    #[arg(long, default_value = "swarmbus")]
    namespace: String,

    #[command(subcommand)]
    command: Action,
}

#[derive(Subcommand)]
enum Action {
    /// Join the bus, register Echo, and serve incoming commands forever
    Serve,
    /// Join the bus, send an Echo to a destination, print the response, exit
    Echo {
        /// Destination node id or channel name
        destination: String,
        /// Message to echo
        message: String,
    },
}

#[derive(Debug, Clone)]
struct Echo {
    msg: String,
}

impl Command for Echo {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn encode_fields(&self) -> Map<String, Value> {
        let mut m = Map::new();
        m.insert("msg".to_string(), Value::String(self.msg.clone()));
        m
    }

    fn execute<'a>(&'a self, _ctx: &'a Node) -> BoxFuture<'a, Outcome> {
        Box::pin(async move { Outcome::from(Value::String(self.msg.to_uppercase())) })
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

impl CommandType for Echo {
    const NAME: &'static str = "echo";

    fn decode_fields(mut fields: Map<String, Value>) -> Result<Self, swarmbus::CodecError> {
        let msg = match fields.remove("msg") {
            Some(Value::String(s)) => s,
            _ => return Err(swarmbus::CodecError::InvalidFormat("echo.msg missing".into())),
        };
        Ok(Echo { msg })
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let mut config = RedisConfig::default();
    config.url = cli.url;
    config.namespace = cli.namespace;

    let adapter = match RedisBrokerAdapter::new(config) {
        Ok(a) => Arc::new(a),
        Err(e) => {
            eprintln!("swarmbus-node: {e}");
            std::process::exit(1);
        }
    };

    let node = match Node::new(adapter) {
        Ok(n) => n,
        Err(e) => {
            eprintln!("swarmbus-node: {e}");
            std::process::exit(1);
        }
    };

    if let Err(e) = node.register_cmd::<Echo>(None) {
        eprintln!("swarmbus-node: failed to register Echo: {e}");
        std::process::exit(1);
    }

    if let Err(e) = node.connect().await {
        eprintln!("swarmbus-node: connect failed: {e}");
        std::process::exit(1);
    }

    match cli.command {
        Action::Serve => {
            tracing::info!(nid = %node.nid(), "serving");
            let shutdown_node = node.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::info!("ctrl-c received, closing node");
                    let _ = shutdown_node.close().await;
                }
            });
            if let Err(e) = node.recv_until_close(RecvUntilCloseOptions::default()).await {
                eprintln!("swarmbus-node: recv loop exited: {e}");
                std::process::exit(1);
            }
        }
        Action::Echo { destination, message } => {
            let cmd = Echo { msg: message };
            let handler = match node
                .send(&cmd, &[destination], None, Some(Duration::from_secs(2)))
                .await
            {
                Ok(h) => h,
                Err(e) => {
                    eprintln!("swarmbus-node: send failed: {e}");
                    std::process::exit(1);
                }
            };
            while !handler.is_finalized() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            println!("{}", json!(handler.snapshot()));
            let _ = node.close().await;
        }
    }
}
