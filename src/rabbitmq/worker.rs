// src/rabbitmq/worker.rs
// Per-channel connect / publish-or-consume / retry loops

use std::fmt;
use std::sync::Arc;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::amqp_client::{Broker, BrokerConnection, ConsumerHandle};
use super::channel_manager::ChannelEntry;
use super::errors::Result;
use crate::config::ManagerSettings;

/// Where a worker currently is in its connection lifecycle.
///
/// `Disconnected → Connecting → Active → (Error → WaitRetry → Connecting)* → Terminated`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkerState {
    Disconnected,
    Connecting,
    /// Publishing (sender) or consuming (receiver).
    Active,
    Error,
    WaitRetry,
    /// Only reached after the shutdown signal was observed.
    Terminated,
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WorkerState::Disconnected => "disconnected",
            WorkerState::Connecting => "connecting",
            WorkerState::Active => "active",
            WorkerState::Error => "error",
            WorkerState::WaitRetry => "wait-retry",
            WorkerState::Terminated => "terminated",
        };
        f.write_str(name)
    }
}

pub(crate) struct Worker<B: Broker> {
    pub(crate) broker: Arc<B>,
    pub(crate) channel: Arc<ChannelEntry>,
    pub(crate) settings: ManagerSettings,
    pub(crate) shutdown: CancellationToken,
    pub(crate) state: watch::Sender<WorkerState>,
    /// Receivers trip this once their queue is bound and they go active.
    pub(crate) bound: Option<CancellationToken>,
    /// Senders hold back their first message until these receivers are bound.
    pub(crate) wait_for: Vec<CancellationToken>,
}

impl<B: Broker> Worker<B> {
    fn set_state(&self, state: WorkerState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!(channel = %self.channel.id(), from = %previous, to = %state, "worker state changed");
        }
    }

    /// Sleep for the retry backoff. Returns `false` if shutdown fired meanwhile.
    async fn wait_retry(&self) -> bool {
        self.set_state(WorkerState::WaitRetry);
        tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => false,
            _ = tokio::time::sleep(self.settings.retry_backoff()) => true,
        }
    }

    /// Wait until every receiver in `wait_for` has bound its queue, at most
    /// `shutdown_timeout`. Returns `false` if shutdown fired meanwhile.
    async fn wait_for_receivers(&self) -> bool {
        if self.wait_for.is_empty() {
            return true;
        }
        let all_bound = futures::future::join_all(self.wait_for.iter().map(|bound| bound.cancelled()));
        tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => false,
            waited = tokio::time::timeout(self.settings.shutdown_timeout(), all_bound) => {
                if waited.is_err() {
                    warn!(channel = %self.channel.id(), "[RabbitMQ] receivers not bound in time, sending anyway");
                }
                true
            }
        }
    }

    /// Drain the outbound queue onto the broker, one connection per message.
    pub(crate) async fn run_sender(self) {
        let id = self.channel.id().clone();
        let queue = self.channel.queue().clone();
        info!(channel = %id, "[RabbitMQ] sender started");

        if !self.wait_for_receivers().await {
            self.set_state(WorkerState::Terminated);
            info!(channel = %id, "[RabbitMQ] sender stopped");
            return;
        }

        loop {
            self.set_state(WorkerState::Disconnected);
            let next = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                message = queue.pop_timeout(self.settings.poll_interval()) => message,
            };
            let Some(body) = next else {
                continue;
            };

            match self.publish_once(&body).await {
                Ok(()) => info!(channel = %id, bytes = body.len(), "[RabbitMQ] data sent"),
                Err(e) => {
                    error!(channel = %id, transient = e.is_transient(), "[RabbitMQ] publish failed: {}", e);
                    if self.shutdown.is_cancelled() {
                        break;
                    }
                    self.set_state(WorkerState::Error);
                    if let Err(requeue_err) = queue.push_front(body) {
                        error!(channel = %id, "[RabbitMQ] message dropped, requeue failed: {}", requeue_err);
                    }
                    if !self.wait_retry().await {
                        break;
                    }
                }
            }
        }

        self.set_state(WorkerState::Terminated);
        info!(channel = %id, "[RabbitMQ] sender stopped");
    }

    async fn publish_once(&self, body: &[u8]) -> Result<()> {
        let exchange = self.channel.exchange_name();

        self.set_state(WorkerState::Connecting);
        let mut connection = self.broker.connect(self.channel.endpoint()).await?;
        self.set_state(WorkerState::Active);

        let published = async {
            connection
                .declare_exchange(exchange, self.channel.exchange_type())
                .await?;
            connection
                .publish(exchange, self.channel.routing_key(), body)
                .await
        }
        .await;

        match published {
            Ok(()) => {
                // The broker already has the message; a failed close must not trigger a resend.
                if let Err(e) = connection.close().await {
                    warn!(channel = %self.channel.id(), "[RabbitMQ] close after publish failed: {}", e);
                }
                Ok(())
            }
            Err(e) => {
                if let Err(close_err) = connection.close().await {
                    debug!(channel = %self.channel.id(), "close after failed publish: {}", close_err);
                }
                Err(e)
            }
        }
    }

    /// Feed broker deliveries into the inbound queue, reconnecting until shutdown.
    pub(crate) async fn run_receiver(self) {
        let id = self.channel.id().clone();

        while !self.shutdown.is_cancelled() {
            info!(channel = %id, "[RabbitMQ] receiver starting...");
            let result = self.receive_session().await;
            if self.shutdown.is_cancelled() {
                break;
            }

            self.set_state(WorkerState::Error);
            match result {
                Ok(()) => warn!(channel = %id, "[RabbitMQ] consumer stopped unexpectedly"),
                Err(e) => error!(channel = %id, transient = e.is_transient(), "[RabbitMQ] receiver failed: {}", e),
            }
            info!(channel = %id, "[RabbitMQ] receiver restart...");
            if !self.wait_retry().await {
                break;
            }
        }

        self.set_state(WorkerState::Terminated);
        info!(channel = %id, "[RabbitMQ] receiver stopped");
    }

    async fn receive_session(&self) -> Result<()> {
        self.set_state(WorkerState::Connecting);
        let mut connection = self.broker.connect(self.channel.endpoint()).await?;

        let result = self.consume_on(&mut connection).await;
        self.channel.clear_active();

        if let Err(e) = connection.close().await {
            debug!(channel = %self.channel.id(), "close after consume: {}", e);
        }
        result
    }

    async fn consume_on(&self, connection: &mut B::Connection) -> Result<()> {
        let exchange = self.channel.exchange_name();
        connection
            .declare_exchange(exchange, self.channel.exchange_type())
            .await?;
        let queue_name = connection.declare_queue().await?;
        connection
            .bind_queue(&queue_name, exchange, self.channel.routing_key())
            .await?;

        let handle = ConsumerHandle::new();
        self.channel.set_active(handle.clone());
        // Shutdown may have scanned the active handles before we stored ours.
        if self.shutdown.is_cancelled() {
            return Ok(());
        }
        self.set_state(WorkerState::Active);
        if let Some(bound) = &self.bound {
            bound.cancel();
        }
        info!(channel = %self.channel.id(), queue = %queue_name, "[RabbitMQ] receiver consuming");

        let id = self.channel.id().clone();
        let inbound = self.channel.queue().clone();
        let mut on_message = move |body: Vec<u8>| {
            info!(channel = %id, bytes = body.len(), "[RabbitMQ] data received");
            if let Err(e) = inbound.push(body) {
                error!(channel = %id, "[RabbitMQ] failed to hand message to local queue: {}", e);
            }
        };

        connection.consume(&queue_name, &handle, &mut on_message).await
    }
}
