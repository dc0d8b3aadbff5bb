//! Parkline demo hub.
//!
//! Creates a few topics, parks simulated clients on them and broadcasts JSON
//! ticks until the message budget is spent or the process is interrupted.
//!
//! # Usage
//!
//! ```bash
//! parkline --topics 2 --subscribers 3 --transport long-polling --interval-ms 500
//! ```
//!
//! Environment variables can also be used:
//! - `PARKLINE_TRANSPORT`: long-polling, streaming, sse or websocket
//! - `PARKLINE_MESSAGES`: broadcasts before exit (0 = until Ctrl+C)
//! - `PARKLINE_LOG_FORMAT`: text or json
//! - `RUST_LOG`: Log level (trace, debug, info, warn, error)

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::Context;
use futures::future::join_all;
use parkline::observability::metrics::init_metrics_with_endpoint;
use parkline::observability::tracing::init_tracing;
use parkline::{
    Broadcaster, BroadcasterConfig, BroadcasterFactory, ChannelSink, Config, Event,
    ExpiryScheduler, Frame, ListenerFn, Resource, TokioScheduler,
};
use serde_json::{json, Value};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio_util::sync::CancellationToken;

/// Print startup banner with version and configuration.
fn print_banner(config: &Config) {
    let version = env!("CARGO_PKG_VERSION");
    eprintln!(
        r#"
  Parkline v{} - suspendable push hub

  Configuration:
    Topics:       {}
    Subscribers:  {} per topic
    Transport:    {}
    Interval:     {}ms
    Messages:     {}
    Log Level:    {}

  Press Ctrl+C to shutdown gracefully.
"#,
        version,
        config.topics,
        config.subscribers,
        config.transport,
        config.interval_ms,
        if config.messages == 0 {
            "unlimited".to_string()
        } else {
            config.messages.to_string()
        },
        config.log_level
    );
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
}

/// Wait for SIGTERM or SIGINT (Ctrl+C), then cancel `shutdown`.
async fn watch_signals(shutdown: CancellationToken) {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {
                        tracing::info!("Received SIGINT (Ctrl+C), initiating shutdown...");
                    }
                    _ = sigterm.recv() => {
                        tracing::info!("Received SIGTERM, initiating shutdown...");
                    }
                    () = shutdown.cancelled() => return,
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "SIGTERM handler unavailable, listening for Ctrl+C only");
                tokio::select! {
                    _ = ctrl_c => tracing::info!("Received Ctrl+C, initiating shutdown..."),
                    () = shutdown.cancelled() => return,
                }
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::select! {
            _ = ctrl_c => tracing::info!("Received Ctrl+C, initiating shutdown..."),
            () = shutdown.cancelled() => return,
        }
    }

    shutdown.cancel();
}

/// Connection task of one simulated client.
async fn run_client(
    name: String,
    resource: Resource<Value>,
    broadcaster: Broadcaster<Value>,
    mut frames: UnboundedReceiver<Frame>,
    timeout: Duration,
    shutdown: CancellationToken,
) {
    let mut received = 0usize;
    loop {
        let frame = tokio::select! {
            () = shutdown.cancelled() => break,
            frame = frames.recv() => frame,
        };
        match frame {
            Some(Frame::Data(bytes)) => {
                received += 1;
                tracing::debug!(
                    client = %name,
                    payload = %String::from_utf8_lossy(&bytes),
                    "Frame received"
                );
            }
            Some(Frame::Flush) => {}
            Some(Frame::Close) => {
                if !resource.is_resuming() {
                    tracing::info!(client = %name, state = %resource.state(), "Connection closed");
                    break;
                }
                // re-poll: park again and catch up on anything missed meanwhile
                match broadcaster.resuspend(&resource, timeout) {
                    Ok(0) => {}
                    Ok(replayed) => tracing::debug!(client = %name, replayed, "Caught up after poll"),
                    Err(e) => {
                        tracing::debug!(client = %name, error = %e, "Poll ended");
                        break;
                    }
                }
            }
            None => break,
        }
    }

    if let Err(e) = resource.cancel() {
        tracing::trace!(client = %name, error = %e, "Cancel after shutdown");
    }
    tracing::info!(client = %name, received, "Client finished");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse configuration from CLI arguments and environment
    let config = Config::parse_args();

    init_tracing(&config.log_level, config.log_format);
    init_metrics_with_endpoint(config.otel_endpoint.as_deref());

    print_banner(&config);

    let shutdown = CancellationToken::new();
    tokio::spawn(watch_signals(shutdown.clone()));

    let scheduler: Arc<dyn ExpiryScheduler> =
        Arc::new(TokioScheduler::current().context("expiry scheduler")?);
    let factory = BroadcasterFactory::<Value>::new(BroadcasterConfig::from(&config));
    let timeout = config.suspend_timeout();

    let mut resources = Vec::new();
    let mut clients = Vec::new();
    for t in 0..config.topics {
        let topic = format!("topic-{t}");
        let broadcaster = factory.get_or_create(&topic);

        for c in 0..config.subscribers {
            let name = format!("{topic}/client-{c}");
            let (sink, frames) = ChannelSink::<Value>::new();
            let resource =
                Resource::<Value>::new(config.transport, Arc::new(sink), Arc::clone(&scheduler));

            let audit = name.clone();
            resource.add_listener(ListenerFn::arc("audit", move |ev: &Event<Value>| {
                if ev.is_resumed_on_timeout() {
                    tracing::info!(client = %audit, "Client poll expired");
                }
                Ok(())
            }))?;
            resource
                .suspend(timeout)
                .with_context(|| format!("suspending {name}"))?;
            broadcaster
                .subscribe(&resource)
                .with_context(|| format!("subscribing {name}"))?;

            clients.push(tokio::spawn(run_client(
                name,
                resource.clone(),
                broadcaster.clone(),
                frames,
                timeout,
                shutdown.clone(),
            )));
            resources.push(resource);
        }
    }
    tracing::info!(
        topics = factory.len(),
        clients = resources.len(),
        transport = %config.transport,
        "Hub started"
    );

    let mut ticker = tokio::time::interval(config.interval());
    let mut seq = 0u64;
    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }
        seq += 1;

        for topic in factory.ids() {
            let Some(broadcaster) = factory.lookup(&topic) else {
                continue;
            };
            let message = json!({ "topic": topic, "seq": seq, "at_ms": now_millis() });
            match broadcaster.broadcast(message) {
                Ok(outcome) => tracing::info!(
                    topic = %topic,
                    seq,
                    resumed = outcome.resumed,
                    skipped = outcome.skipped,
                    failed = outcome.failures.len(),
                    "Broadcast"
                ),
                Err(e) => tracing::warn!(topic = %topic, error = %e, "Broadcast rejected"),
            }
        }

        if config.messages > 0 && seq >= config.messages {
            tracing::info!(seq, "Message budget spent");
            break;
        }
    }

    shutdown.cancel();
    for resource in &resources {
        resource.destroy();
    }
    factory.destroy_all();
    for result in join_all(clients).await {
        if let Err(e) = result {
            tracing::warn!(error = %e, "Client task failed");
        }
    }

    tracing::info!("Parkline shutdown complete");
    Ok(())
}
