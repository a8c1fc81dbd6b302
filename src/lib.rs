// src/lib.rs
//! Resilient multi-channel RabbitMQ client manager.
//!
//! Register any number of sender and receiver channels against a broker, run
//! each one on its own task, and let the workers reconnect on their own until
//! [`ChannelManager::shutdown`] is called.
//!
//! ```no_run
//! use rmq_channels::{BrokerEndpoint, ChannelConfig, ChannelManager, ManagerSettings, MessageQueue, Role};
//!
//! # async fn demo() {
//! let endpoint = BrokerEndpoint::default();
//! let outbound = MessageQueue::new();
//! let inbound = MessageQueue::new();
//!
//! let mut manager = ChannelManager::new(ManagerSettings::default());
//! manager.register(
//!     Role::Recv,
//!     ChannelConfig::new(endpoint.clone(), "orders", "order.created").with_queue(inbound.clone()),
//! );
//! manager.register(
//!     Role::Send,
//!     ChannelConfig::new(endpoint, "orders", "order.created").with_queue(outbound.clone()),
//! );
//! manager.run();
//!
//! outbound.push(b"hello".to_vec()).ok();
//! let _received = inbound.pop_timeout(std::time::Duration::from_secs(5)).await;
//! manager.shutdown().await;
//! # }
//! ```

pub mod config;
pub mod env;
pub mod messaging;
pub mod rabbitmq;

pub use config::ManagerSettings;
pub use env::BrokerEndpoint;
pub use messaging::queue::MessageQueue;
pub use messaging::types::{ChannelId, Role};
pub use rabbitmq::channel_manager::{ChannelConfig, ChannelEntry, ChannelManager, ChannelRegistry};
pub use rabbitmq::errors::{RabbitMQError, Result};
pub use rabbitmq::worker::WorkerState;
