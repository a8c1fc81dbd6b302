// src/rabbitmq/memory.rs
//! In-process stand-in for a RabbitMQ server.
//!
//! Routes messages between exchanges and exclusive queues the way the real
//! broker does for `direct`, `fanout`, `topic` and `headers` exchanges, and lets
//! tests inject the failures the workers have to survive: refused connects, a
//! broker that is down, a broker that never answers, and dropped connections.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use super::amqp_client::{Broker, BrokerConnection, ConsumerHandle};
use super::errors::{RabbitMQError, Result};
use crate::env::BrokerEndpoint;

#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

#[derive(Default)]
struct BrokerState {
    exchanges: HashMap<String, String>,
    queues: HashMap<String, MemoryQueue>,
    refuse_connects: usize,
    unavailable: bool,
    stalled: bool,
    connect_attempts: usize,
    published: usize,
    link: CancellationToken,
}

struct MemoryQueue {
    bindings: Vec<(String, String)>,
    sender: mpsc::UnboundedSender<Vec<u8>>,
    receiver: Option<mpsc::UnboundedReceiver<Vec<u8>>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, BrokerState> {
        lock(&self.state)
    }

    /// Refuse the next `count` connection attempts.
    pub fn refuse_next_connects(&self, count: usize) {
        self.state().refuse_connects = count;
    }

    /// Refuse every connection attempt until switched back.
    pub fn set_available(&self, available: bool) {
        self.state().unavailable = !available;
    }

    /// Make connection attempts hang forever, like a black-holed host.
    pub fn set_stalled(&self, stalled: bool) {
        self.state().stalled = stalled;
    }

    /// Break every open connection; new ones can still be opened.
    pub fn drop_connections(&self) {
        let mut state = self.state();
        state.link.cancel();
        state.link = CancellationToken::new();
    }

    pub fn connect_attempts(&self) -> usize {
        self.state().connect_attempts
    }

    pub fn published_count(&self) -> usize {
        self.state().published
    }

    pub fn queue_count(&self) -> usize {
        self.state().queues.len()
    }
}

fn lock(state: &Mutex<BrokerState>) -> MutexGuard<'_, BrokerState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

#[async_trait]
impl Broker for MemoryBroker {
    type Connection = MemoryConnection;

    async fn connect(&self, endpoint: &BrokerEndpoint) -> Result<MemoryConnection> {
        let stalled = {
            let mut state = self.state();
            state.connect_attempts += 1;
            state.stalled
        };
        if stalled {
            std::future::pending::<()>().await;
        }

        let mut state = self.state();
        if state.unavailable {
            return Err(RabbitMQError::ConnectionError(format!("{} is unreachable", endpoint)));
        }
        if state.refuse_connects > 0 {
            state.refuse_connects -= 1;
            return Err(RabbitMQError::ConnectionError(format!("connection refused by {}", endpoint)));
        }

        Ok(MemoryConnection {
            state: self.state.clone(),
            link: state.link.clone(),
            exclusive: Vec::new(),
        })
    }
}

pub struct MemoryConnection {
    state: Arc<Mutex<BrokerState>>,
    link: CancellationToken,
    exclusive: Vec<String>,
}

impl MemoryConnection {
    fn ensure_open(&self) -> Result<()> {
        if self.link.is_cancelled() {
            return Err(RabbitMQError::ConnectionError("connection reset by peer".to_string()));
        }
        Ok(())
    }
}

/// AMQP topic matching: `*` is exactly one word, `#` is zero or more.
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    fn matches(pattern: &[&str], key: &[&str]) -> bool {
        match pattern.split_first() {
            None => key.is_empty(),
            Some((&"#", rest)) => (0..=key.len()).any(|skip| matches(rest, &key[skip..])),
            Some((&word, rest)) => match key.split_first() {
                Some((&head, tail)) => (word == "*" || word == head) && matches(rest, tail),
                None => false,
            },
        }
    }

    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    matches(&pattern, &key)
}

fn routes(exchange_type: &str, binding_key: &str, routing_key: &str) -> bool {
    match exchange_type {
        "fanout" | "headers" => true,
        "topic" => topic_matches(binding_key, routing_key),
        _ => binding_key == routing_key,
    }
}

#[async_trait]
impl BrokerConnection for MemoryConnection {
    async fn declare_exchange(&mut self, exchange: &str, exchange_type: &str) -> Result<()> {
        self.ensure_open()?;
        let mut state = lock(&self.state);
        match state.exchanges.get(exchange).cloned() {
            Some(existing) if existing != exchange_type => Err(RabbitMQError::ChannelError(format!(
                "PRECONDITION_FAILED - inequivalent arg 'type' for exchange '{}': received '{}' but current is '{}'",
                exchange, exchange_type, existing
            ))),
            Some(_) => Ok(()),
            None => {
                state.exchanges.insert(exchange.to_string(), exchange_type.to_string());
                Ok(())
            }
        }
    }

    async fn publish(&mut self, exchange: &str, routing_key: &str, body: &[u8]) -> Result<()> {
        self.ensure_open()?;
        let mut state = lock(&self.state);
        let exchange_type = state.exchanges.get(exchange).cloned().ok_or_else(|| {
            RabbitMQError::ChannelError(format!("NOT_FOUND - no exchange '{}'", exchange))
        })?;

        for (name, queue) in state.queues.iter() {
            let bound = queue
                .bindings
                .iter()
                .any(|(ex, key)| ex == exchange && routes(&exchange_type, key, routing_key));
            if bound && queue.sender.send(body.to_vec()).is_err() {
                debug!("Queue '{}' dropped a message", name);
            }
        }
        state.published += 1;
        Ok(())
    }

    async fn declare_queue(&mut self) -> Result<String> {
        self.ensure_open()?;
        let name = format!("amq.gen-{}", Uuid::new_v4().simple());
        let (sender, receiver) = mpsc::unbounded_channel();
        lock(&self.state).queues.insert(
            name.clone(),
            MemoryQueue {
                bindings: Vec::new(),
                sender,
                receiver: Some(receiver),
            },
        );
        self.exclusive.push(name.clone());
        Ok(name)
    }

    async fn bind_queue(&mut self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        self.ensure_open()?;
        let mut state = lock(&self.state);
        if !state.exchanges.contains_key(exchange) {
            return Err(RabbitMQError::ChannelError(format!("NOT_FOUND - no exchange '{}'", exchange)));
        }
        let entry = state
            .queues
            .get_mut(queue)
            .ok_or_else(|| RabbitMQError::ChannelError(format!("NOT_FOUND - no queue '{}'", queue)))?;
        entry.bindings.push((exchange.to_string(), routing_key.to_string()));
        Ok(())
    }

    async fn consume(
        &mut self,
        queue: &str,
        handle: &ConsumerHandle,
        on_message: &mut (dyn FnMut(Vec<u8>) + Send),
    ) -> Result<()> {
        self.ensure_open()?;
        let mut receiver = lock(&self.state)
            .queues
            .get_mut(queue)
            .ok_or_else(|| RabbitMQError::ConsumeError(format!("NOT_FOUND - no queue '{}'", queue)))?
            .receiver
            .take()
            .ok_or_else(|| {
                RabbitMQError::ConsumeError(format!("ACCESS_REFUSED - queue '{}' already has a consumer", queue))
            })?;

        let outcome = loop {
            tokio::select! {
                _ = handle.stopped() => break Ok(()),
                _ = self.link.cancelled() => {
                    break Err(RabbitMQError::ConnectionError("connection reset by peer".to_string()))
                }
                message = receiver.recv() => match message {
                    Some(body) => on_message(body),
                    None => break Err(RabbitMQError::ConsumeError(format!("queue '{}' was deleted", queue))),
                },
            }
        };

        if let Some(entry) = lock(&self.state).queues.get_mut(queue) {
            entry.receiver = Some(receiver);
        }
        outcome
    }

    async fn close(self) -> Result<()> {
        // Exclusive queues go away in Drop.
        Ok(())
    }
}

impl Drop for MemoryConnection {
    fn drop(&mut self) {
        let mut state = lock(&self.state);
        for name in self.exclusive.drain(..) {
            state.queues.remove(&name);
        }
    }
}
