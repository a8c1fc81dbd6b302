// src/rabbitmq/mod.rs
// RabbitMQ side of the channel manager

// RabbitMQ-specific errors
pub mod errors;
pub mod amqp_client;      // Broker collaborator traits
pub mod connection;       // lapin-backed broker
pub mod memory;           // in-process broker for tests and local runs
pub mod channel_manager;
pub mod worker;

// Re-export specific items to simplify imports elsewhere
pub use amqp_client::{Broker, BrokerConnection, ConsumerHandle};
pub use channel_manager::{ChannelConfig, ChannelManager, ChannelRegistry};
pub use connection::LapinBroker;
pub use errors::{RabbitMQError, Result};
pub use memory::MemoryBroker;
