use anyhow::Result;
use clap::Parser;

use fanout_client::{BusConfig, EventBus, RunMode, TransportOptions};

/// Subscribe to a fanout event stream and print matching events as
/// JSON lines until interrupted.
#[derive(Parser, Debug)]
#[command(name = "fanout", about = "Tail events from a shared upstream stream")]
struct Args {
    /// SSE endpoint to subscribe to
    #[arg(long, default_value = "http://127.0.0.1:3117/events")]
    url: String,

    /// Event name to listen for (repeatable)
    #[arg(long = "event", required = true)]
    events: Vec<String>,

    /// Run mode: development, test, or production
    #[arg(long, default_value = "production")]
    run_mode: RunMode,

    /// Use the shared broker even in test mode
    #[arg(long)]
    force_shared: bool,

    /// Mirror stream transitions to the diagnostic log
    #[arg(long)]
    test_mode: bool,

    /// Event name whose last payload is replayed to late joiners
    /// (repeatable)
    #[arg(long = "replay", default_value = "version")]
    replay_events: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let mut config = BusConfig::new(args.url.clone());
    config.transport = TransportOptions {
        run_mode: args.run_mode,
        force_shared: args.force_shared,
        ..Default::default()
    };
    config.is_test_mode = args.test_mode;
    config.replay_events = args.replay_events.clone();

    let mut bus = EventBus::start(config).await?;
    tracing::info!(url = %args.url, transport = ?bus.transport(), "bus started");

    let mut subscriptions = Vec::new();
    for name in &args.events {
        let event = name.clone();
        let subscription = bus
            .add_event_listener(name, move |data| {
                println!("{}", serde_json::json!({ "event": event, "data": data }));
            })
            .await?;
        subscriptions.push(subscription);
    }
    tracing::info!(events = args.events.len(), "listening");

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");
    drop(subscriptions);
    bus.close().await;
    Ok(())
}
