// src/messaging/types.rs
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::rabbitmq::errors::RabbitMQError;

/// Direction of a registered channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Drains the channel's queue onto the broker.
    Send,
    /// Feeds broker deliveries into the channel's queue.
    #[serde(rename = "receive", alias = "recv")]
    Recv,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Send => f.write_str("send"),
            Role::Recv => f.write_str("receive"),
        }
    }
}

impl FromStr for Role {
    type Err = RabbitMQError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "send" => Ok(Role::Send),
            "receive" | "recv" => Ok(Role::Recv),
            other => Err(RabbitMQError::ConfigError(format!("unknown channel role '{}'", other))),
        }
    }
}

/// Identity of a logical channel: exchange name plus routing key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChannelId {
    pub exchange: String,
    pub routing_key: String,
}

impl ChannelId {
    pub fn new(exchange: impl Into<String>, routing_key: impl Into<String>) -> Self {
        Self {
            exchange: exchange.into(),
            routing_key: routing_key.into(),
        }
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.exchange, self.routing_key)
    }
}
