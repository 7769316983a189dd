//! sqs-listener: consume a queue with one of the container presets.
//!
//! Messages are logged and deleted. Configuration comes from the environment
//! (and `.env`), see `sqs_listener_core::Config`.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::info;

use sqs_listener::processor::{
    DecoratingMessageProcessor, FnMessageProcessor, MessageProcessingDecorator, MessageProcessor,
};
use sqs_listener::properties::{StaticAutoVisibilityExtenderProperties, DEFAULT_VISIBILITY_BUFFER};
use sqs_listener::{container_from_config, AutoVisibilityExtender, Message, QueueClient, SqsQueueClient};
use sqs_listener_core::{Config, ConfigError, ListenerKind};

/// Visibility timeout assumed for extension when the queue's is not configured.
const FALLBACK_VISIBILITY_TIMEOUT: Duration = Duration::from_secs(30);

// ── CLI ─────────────────────────────────────────────────────────────

/// Queue listener worker.
#[derive(Parser, Debug)]
#[command(name = "sqs-listener", version, about)]
struct Cli {
    /// Configuration profile (prefix for environment variables, empty for none).
    #[arg(long, env = "LISTENER_PROFILE", default_value = "")]
    profile: String,

    /// Override the container preset: batching, prefetching or fifo.
    #[arg(long)]
    kind: Option<ListenerKind>,

    /// Seconds to wait for the container to stop after Ctrl-C.
    #[arg(long, default_value_t = 300)]
    shutdown_timeout: u64,

    /// Print the effective configuration as JSON, without secrets, and exit.
    #[arg(long)]
    print_config: bool,
}

fn logging_processor() -> Arc<dyn MessageProcessor> {
    Arc::new(FnMessageProcessor::new(|message: Message| async move {
        info!(
            message_id = %message.id,
            group = message.group_id().unwrap_or("-"),
            receive_count = message.receive_count(),
            bytes = message.body.len(),
            "Received message"
        );
        Ok(())
    }))
}

// ── main ────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    sqs_listener_core::config::load_dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let mut config = Config::for_profile(&cli.profile)?;
    if let Some(kind) = cli.kind {
        config.listener.kind = kind;
    }
    if cli.print_config {
        println!("{}", serde_json::to_string_pretty(&config.redacted_summary())?);
        return Ok(());
    }
    if !config.queue.is_configured() {
        return Err(ConfigError::Missing("QUEUE_URL".to_string()).into());
    }
    config.log_summary();

    let client: Arc<dyn QueueClient> = Arc::new(SqsQueueClient::new(&config.aws, &config.queue).await?);

    let mut processor = logging_processor();
    if config.listener.auto_extend_max_processing_secs > 0 {
        let visibility_timeout = match config.queue.visibility_timeout_secs {
            0 => FALLBACK_VISIBILITY_TIMEOUT,
            secs => Duration::from_secs(u64::from(secs)),
        };
        let extender = AutoVisibilityExtender::new(
            Arc::clone(&client),
            Arc::new(StaticAutoVisibilityExtenderProperties {
                visibility_timeout,
                max_duration: Duration::from_secs(config.listener.auto_extend_max_processing_secs),
                buffer_duration: DEFAULT_VISIBILITY_BUFFER,
            }),
        )?;
        info!(
            max_processing_secs = config.listener.auto_extend_max_processing_secs,
            "Auto visibility extension enabled"
        );
        let decorators: Vec<Arc<dyn MessageProcessingDecorator>> = vec![Arc::new(extender)];
        processor = Arc::new(DecoratingMessageProcessor::new(
            config.listener.identifier.clone(),
            decorators,
            processor,
        ));
    }

    let container = container_from_config(&config.listener, &config.queue, client, processor)?;
    container.start()?;
    info!(
        listener = %container.identifier(),
        kind = %config.listener.kind,
        "sqs-listener running, press Ctrl-C to stop"
    );

    tokio::signal::ctrl_c().await?;
    info!("Ctrl-C received, shutting down");

    if container
        .stop_with_timeout(Duration::from_secs(cli.shutdown_timeout))
        .await
    {
        info!("sqs-listener exited cleanly");
    } else {
        tracing::warn!("sqs-listener shutdown timed out");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_print_config_flag() {
        let cli = Cli::try_parse_from(["sqs-listener", "--print-config", "--kind", "fifo"]).unwrap();
        assert!(cli.print_config);
        assert_eq!(cli.kind, Some(ListenerKind::Fifo));

        let cli = Cli::try_parse_from(["sqs-listener"]).unwrap();
        assert!(!cli.print_config);
        assert_eq!(cli.shutdown_timeout, 300);
    }
}
