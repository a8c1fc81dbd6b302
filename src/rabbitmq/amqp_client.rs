// src/rabbitmq/amqp_client.rs

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::errors::Result;
use crate::env::BrokerEndpoint;

/// Something the workers can open broker connections against.
#[async_trait]
pub trait Broker: Send + Sync + 'static {
    type Connection: BrokerConnection;

    /// Open a fresh connection (and channel) to `endpoint`.
    async fn connect(&self, endpoint: &BrokerEndpoint) -> Result<Self::Connection>;
}

/// One live broker connection, owned by exactly one worker.
#[async_trait]
pub trait BrokerConnection: Send + 'static {
    /// Declare `exchange`; `exchange_type` is handed to the broker unvalidated.
    async fn declare_exchange(&mut self, exchange: &str, exchange_type: &str) -> Result<()>;

    async fn publish(&mut self, exchange: &str, routing_key: &str, body: &[u8]) -> Result<()>;

    /// Declare an exclusive, server-named queue and return its name.
    async fn declare_queue(&mut self) -> Result<String>;

    async fn bind_queue(&mut self, queue: &str, exchange: &str, routing_key: &str) -> Result<()>;

    /// Deliver every message arriving on `queue` to `on_message`, acknowledging
    /// each one once the callback returns.
    ///
    /// Blocks until `handle` is stopped (`Ok`) or the connection fails (`Err`).
    async fn consume(
        &mut self,
        queue: &str,
        handle: &ConsumerHandle,
        on_message: &mut (dyn FnMut(Vec<u8>) + Send),
    ) -> Result<()>;

    async fn close(self) -> Result<()>;
}

/// Lets another task ask a running `consume` call to return.
#[derive(Debug, Clone, Default)]
pub struct ConsumerHandle {
    token: CancellationToken,
}

impl ConsumerHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop_consuming(&self) {
        self.token.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once [`stop_consuming`](Self::stop_consuming) has been called.
    pub async fn stopped(&self) {
        self.token.cancelled().await
    }
}
