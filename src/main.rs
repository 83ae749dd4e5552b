//! FanMQ - Redundant MQTT publish/subscribe client
//!
//! Usage:
//!   fanmq [OPTIONS] <COMMAND>
//!
//! Commands:
//!   publish    Publish one message through every configured broker
//!   subscribe  Print messages from every configured broker until Ctrl+C
//!   check      Load the configuration and broker list, print the client name
//!
//! Options:
//!   -c, --config <FILE>    Configuration file path
//!   -l, --log-level        Log level (error, warn, info, debug, trace)
//!   -h, --help             Print help
//!
//! The broker list is read as JSON from `PUB_SUB_CONFIGS` (see
//! `pub_sub.env_var`). `RUST_LOG` overrides the log level when set.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use fanmq::config::Config;
use fanmq::pubsub::{
    create_redundant_client_from_env, ContentType, PubSubClient, PubSubPayload, SubscribeCallback,
};

/// Time given to connection tasks to send DISCONNECT before exiting
const SHUTDOWN_GRACE: Duration = Duration::from_millis(200);

/// Log level for CLI
#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogLevel {
    /// Only errors
    Error,
    /// Warnings and errors
    Warn,
    /// Informational messages
    Info,
    /// Debug messages
    Debug,
    /// Trace messages (very verbose)
    Trace,
}

impl LogLevel {
    fn as_str(self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

/// FanMQ - Redundant MQTT publish/subscribe client
#[derive(Parser, Debug)]
#[command(name = "fanmq")]
#[command(author = "FanMQ Contributors")]
#[command(version)]
#[command(about = "Publish and subscribe through several MQTT brokers at once")]
struct Args {
    /// Configuration file path (TOML format)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short, long, value_enum)]
    log_level: Option<LogLevel>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Publish one message
    Publish {
        /// Topic name
        #[arg(short, long)]
        topic: String,
        /// Message payload
        #[arg(short, long)]
        message: String,
        /// Payload encoding: json, deflate or binary
        #[arg(long, default_value = "json")]
        content_type: ContentType,
    },
    /// Print received messages until Ctrl+C
    Subscribe {
        /// Topic filter, may be repeated
        #[arg(short, long = "topic", required = true)]
        topics: Vec<String>,
    },
    /// Validate configuration and print the client's unique name
    Check,
}

fn init_logging(level: &str) -> Result<(), Box<dyn std::error::Error>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => Config::load(path),
        None => Config::from_env(),
    };
    let config = match config {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Error loading configuration: {}", e);
            std::process::exit(1);
        }
    };

    // CLI overrides config
    let level = args
        .log_level
        .map(|l| l.as_str().to_string())
        .unwrap_or_else(|| config.log.level.clone());
    init_logging(&level)?;

    if let Some(path) = &args.config {
        info!("Loaded configuration from {:?}", path);
    }

    let client = match create_redundant_client_from_env(&config) {
        Ok(Some(client)) => client,
        Ok(None) => {
            println!(
                "No broker list in '{}'; redundant pub/sub is disabled",
                config.pub_sub.env_var
            );
            return Ok(());
        }
        Err(e) => {
            eprintln!("Error loading broker list: {}", e);
            std::process::exit(1);
        }
    };

    let result = match args.command {
        Command::Publish {
            topic,
            message,
            content_type,
        } => {
            let payload = PubSubPayload::new(topic, message.into_bytes());
            client.publish(&[payload], content_type).await.map(|()| {
                println!("Published through {}", client.unique_name());
            })
        }
        Command::Subscribe { topics } => {
            let on_message: SubscribeCallback = Arc::new(|topic, payload| {
                println!("{}: {}", topic, String::from_utf8_lossy(&payload));
            });
            match client.subscribe(&topics, on_message).await {
                Ok(()) => {
                    info!("Subscribed to {:?}, press Ctrl+C to stop", topics);
                    tokio::signal::ctrl_c().await?;
                    if let Err(e) = client.unsubscribe(&topics).await {
                        warn!("Unsubscribe failed: {}", e);
                    }
                    Ok(())
                }
                Err(e) => Err(e),
            }
        }
        Command::Check => {
            println!("{}", client.unique_name());
            for member in client.members() {
                println!("  {}", member.name());
            }
            Ok(())
        }
    };

    client.stop();
    tokio::time::sleep(SHUTDOWN_GRACE).await;

    result.map_err(|e| e.into())
}
