// src/main.rs
use anyhow::{anyhow, Result};
use std::path::Path;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use rmq_channels::config;
use rmq_channels::rabbitmq::{Broker, MemoryBroker};
use rmq_channels::{BrokerEndpoint, ChannelConfig, ChannelManager, ManagerSettings, MessageQueue, Role};

const EXCHANGE: &str = "test_exchange";
const ROUTING_KEY: &str = "test_routing_key";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    match args.first().map(String::as_str) {
        Some("init-config") => {
            let path = args.get(1).map(String::as_str).unwrap_or("rmq-channels.json");
            return config::create_default_config_file(Path::new(path));
        }
        Some("memory") => {
            info!("Running against the in-process broker");
            let manager = ChannelManager::with_broker(MemoryBroker::new(), ManagerSettings::default());
            return round_trip(manager, BrokerEndpoint::default()).await;
        }
        Some(other) => return Err(anyhow!("unknown command '{}', expected 'init-config' or 'memory'", other)),
        None => {}
    }

    let (endpoint, settings) = match config::find_config_file() {
        Some(path) => {
            let loaded = config::load_config_from(&path)?;
            (loaded.connection, loaded.manager)
        }
        None => (BrokerEndpoint::from_env()?, ManagerSettings::default()),
    };
    info!("Using broker at {}", endpoint);

    round_trip(ChannelManager::new(settings), endpoint).await
}

/// Register a receiver and a sender on the same channel, push a few messages
/// through the broker and check they come back in order.
async fn round_trip<B: Broker>(mut manager: ChannelManager<B>, endpoint: BrokerEndpoint) -> Result<()> {
    let send_queue = MessageQueue::new();
    let recv_queue = MessageQueue::new();

    info!("Registering receiver and sender...");
    let receiver_registered = manager.register(
        Role::Recv,
        ChannelConfig::new(endpoint.clone(), EXCHANGE, ROUTING_KEY).with_queue(recv_queue.clone()),
    );
    let sender_registered = manager.register(
        Role::Send,
        ChannelConfig::new(endpoint, EXCHANGE, ROUTING_KEY).with_queue(send_queue.clone()),
    );
    if !receiver_registered || !sender_registered {
        return Err(anyhow!("Failed to register receiver or sender"));
    }

    manager.run();

    // Give the receiver time to bind its queue before anything is published
    tokio::time::sleep(Duration::from_secs(2)).await;

    let test_messages: Vec<&[u8]> = vec![
        &b"Hello, RabbitMQ!"[..],
        &b"This is message 2"[..],
        &b"Message number 3"[..],
        &b"Final test message"[..],
    ];
    for (i, message) in test_messages.iter().enumerate() {
        info!("Putting message {} into send queue", i + 1);
        send_queue.push(message.to_vec())?;
    }

    let mut received = Vec::new();
    let collect = async {
        for i in 0..test_messages.len() {
            match recv_queue.pop_timeout(Duration::from_secs(5)).await {
                Some(message) => received.push(message),
                None => {
                    warn!("Timeout waiting for message {}", i + 1);
                    break;
                }
            }
        }
    };
    tokio::select! {
        _ = collect => {}
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                error!("Failed to listen for Ctrl+C: {}", e);
            }
            warn!("Interrupted, stopping early");
        }
    }

    let mut all_matched = received.len() == test_messages.len();
    for (sent, got) in test_messages.iter().zip(received.iter()) {
        if *sent == got.as_slice() {
            info!("Message verified: {}", String::from_utf8_lossy(sent));
        } else {
            all_matched = false;
            error!(
                "Message mismatch: sent {}, received {}",
                String::from_utf8_lossy(sent),
                String::from_utf8_lossy(got)
            );
        }
    }

    info!("Stopping channel manager...");
    manager.shutdown().await;

    if all_matched {
        info!("All messages successfully sent and received!");
        Ok(())
    } else {
        Err(anyhow!(
            "Only {} out of {} messages received intact",
            received.len(),
            test_messages.len()
        ))
    }
}
