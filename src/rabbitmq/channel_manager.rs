// src/rabbitmq/channel_manager.rs
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::amqp_client::{Broker, ConsumerHandle};
use super::connection::LapinBroker;
use super::worker::{Worker, WorkerState};
use crate::config::ManagerSettings;
use crate::env::BrokerEndpoint;
use crate::messaging::queue::MessageQueue;
use crate::messaging::types::{ChannelId, Role};

/// Caller-side description of one logical channel, handed to `register`.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    pub endpoint: BrokerEndpoint,
    pub exchange_name: String,
    /// Passed to the broker as-is (`direct`, `fanout`, `topic`, ...).
    pub exchange_type: String,
    pub routing_key: String,
    /// Outbound queue for senders, inbound queue for receivers.
    pub queue: Option<MessageQueue>,
}

impl ChannelConfig {
    pub fn new(
        endpoint: BrokerEndpoint,
        exchange_name: impl Into<String>,
        routing_key: impl Into<String>,
    ) -> Self {
        Self {
            endpoint,
            exchange_name: exchange_name.into(),
            exchange_type: "direct".to_string(),
            routing_key: routing_key.into(),
            queue: None,
        }
    }

    pub fn with_exchange_type(mut self, exchange_type: impl Into<String>) -> Self {
        self.exchange_type = exchange_type.into();
        self
    }

    pub fn with_queue(mut self, queue: MessageQueue) -> Self {
        self.queue = Some(queue);
        self
    }

    pub fn id(&self) -> ChannelId {
        ChannelId::new(self.exchange_name.clone(), self.routing_key.clone())
    }
}

/// A validated, registered channel as the workers see it.
#[derive(Debug)]
pub struct ChannelEntry {
    id: ChannelId,
    endpoint: BrokerEndpoint,
    exchange_type: String,
    queue: MessageQueue,
    active: Mutex<Option<ConsumerHandle>>,
}

impl ChannelEntry {
    fn from_config(config: ChannelConfig) -> Option<Self> {
        let queue = config.queue?;
        if config.exchange_name.is_empty() || config.routing_key.is_empty() {
            return None;
        }
        Some(Self {
            id: ChannelId::new(config.exchange_name, config.routing_key),
            endpoint: config.endpoint,
            exchange_type: config.exchange_type,
            queue,
            active: Mutex::new(None),
        })
    }

    pub fn id(&self) -> &ChannelId {
        &self.id
    }

    pub fn endpoint(&self) -> &BrokerEndpoint {
        &self.endpoint
    }

    pub fn exchange_name(&self) -> &str {
        &self.id.exchange
    }

    pub fn exchange_type(&self) -> &str {
        &self.exchange_type
    }

    pub fn routing_key(&self) -> &str {
        &self.id.routing_key
    }

    pub fn queue(&self) -> &MessageQueue {
        &self.queue
    }

    fn active(&self) -> MutexGuard<'_, Option<ConsumerHandle>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn set_active(&self, handle: ConsumerHandle) {
        *self.active() = Some(handle);
    }

    pub(crate) fn clear_active(&self) {
        self.active().take();
    }

    /// Whether a receiver worker is currently attached to the broker.
    pub fn is_consuming(&self) -> bool {
        self.active().is_some()
    }

    /// Ask the live consumer, if any, to return. Returns whether one was running.
    pub fn stop_consuming(&self) -> bool {
        match self.active().as_ref() {
            Some(handle) => {
                handle.stop_consuming();
                true
            }
            None => false,
        }
    }
}

/// Registered senders and receivers, keyed by channel identity.
#[derive(Debug, Default)]
pub struct ChannelRegistry {
    senders: BTreeMap<ChannelId, Arc<ChannelEntry>>,
    receivers: BTreeMap<ChannelId, Arc<ChannelEntry>>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self, role: Role) -> &BTreeMap<ChannelId, Arc<ChannelEntry>> {
        match role {
            Role::Send => &self.senders,
            Role::Recv => &self.receivers,
        }
    }

    /// Add a channel. Returns `false` without touching the registry when the
    /// config has no queue, an empty exchange name or routing key, or when the
    /// identity is already registered for `role`.
    pub fn register(&mut self, role: Role, config: ChannelConfig) -> bool {
        let id = config.id();
        let Some(entry) = ChannelEntry::from_config(config) else {
            debug!(channel = %id, %role, "rejected incomplete channel config");
            return false;
        };

        let entries = match role {
            Role::Send => &mut self.senders,
            Role::Recv => &mut self.receivers,
        };
        if entries.contains_key(&id) {
            debug!(channel = %id, %role, "channel already registered");
            return false;
        }
        entries.insert(id, Arc::new(entry));
        true
    }

    pub fn get(&self, role: Role, id: &ChannelId) -> Option<&Arc<ChannelEntry>> {
        self.entries(role).get(id)
    }

    pub fn senders(&self) -> impl Iterator<Item = &Arc<ChannelEntry>> {
        self.senders.values()
    }

    pub fn receivers(&self) -> impl Iterator<Item = &Arc<ChannelEntry>> {
        self.receivers.values()
    }

    pub fn len(&self, role: Role) -> usize {
        self.entries(role).len()
    }

    pub fn is_empty(&self) -> bool {
        self.senders.is_empty() && self.receivers.is_empty()
    }
}

struct WorkerHandle {
    role: Role,
    channel: Arc<ChannelEntry>,
    state: watch::Receiver<WorkerState>,
    task: Option<JoinHandle<()>>,
}

/// Runs one worker per registered channel and stops them all on `shutdown`.
pub struct ChannelManager<B: Broker = LapinBroker> {
    broker: Arc<B>,
    settings: ManagerSettings,
    registry: ChannelRegistry,
    shutdown: CancellationToken,
    workers: Vec<WorkerHandle>,
}

impl ChannelManager<LapinBroker> {
    pub fn new(settings: ManagerSettings) -> Self {
        Self::with_broker(LapinBroker::new(), settings)
    }
}

impl<B: Broker> ChannelManager<B> {
    pub fn with_broker(broker: B, settings: ManagerSettings) -> Self {
        debug!(
            retry_backoff_ms = settings.retry_backoff_ms,
            shutdown_timeout_ms = settings.shutdown_timeout_ms,
            poll_interval_ms = settings.poll_interval_ms,
            "Creating channel manager"
        );

        Self {
            broker: Arc::new(broker),
            settings,
            registry: ChannelRegistry::new(),
            shutdown: CancellationToken::new(),
            workers: Vec::new(),
        }
    }

    /// See [`ChannelRegistry::register`].
    pub fn register(&mut self, role: Role, config: ChannelConfig) -> bool {
        self.registry.register(role, config)
    }

    pub fn registry(&self) -> &ChannelRegistry {
        &self.registry
    }

    pub fn settings(&self) -> &ManagerSettings {
        &self.settings
    }

    /// Spawn a worker task for every receiver, then every sender.
    ///
    /// Senders publish nothing until every receiver started here has bound its
    /// queue once (or `shutdown_timeout` has passed), so messages queued before
    /// `run` are not published to an exchange nobody listens on yet.
    ///
    /// Must be called from inside a Tokio runtime, and only once: a second call
    /// starts a duplicate worker for each channel.
    pub fn run(&mut self) {
        let receivers: Vec<_> = self.registry.receivers().cloned().collect();
        let senders: Vec<_> = self.registry.senders().cloned().collect();

        let mut bound = Vec::with_capacity(receivers.len());
        for channel in receivers {
            let token = CancellationToken::new();
            bound.push(token.clone());
            self.spawn_worker(Role::Recv, channel, Some(token), Vec::new());
        }
        for channel in senders {
            self.spawn_worker(Role::Send, channel, None, bound.clone());
        }
    }

    fn spawn_worker(
        &mut self,
        role: Role,
        channel: Arc<ChannelEntry>,
        bound: Option<CancellationToken>,
        wait_for: Vec<CancellationToken>,
    ) {
        info!(channel = %channel.id(), exchange_type = channel.exchange_type(), "[RabbitMQ] start {}", role);

        let (state_tx, state_rx) = watch::channel(WorkerState::Disconnected);
        let worker = Worker {
            broker: self.broker.clone(),
            channel: channel.clone(),
            settings: self.settings.clone(),
            shutdown: self.shutdown.clone(),
            state: state_tx,
            bound,
            wait_for,
        };
        let task = match role {
            Role::Send => tokio::spawn(worker.run_sender()),
            Role::Recv => tokio::spawn(worker.run_receiver()),
        };

        self.workers.push(WorkerHandle {
            role,
            channel,
            state: state_rx,
            task: Some(task),
        });
    }

    /// Signal every worker to stop and wait for them, at most
    /// `shutdown_timeout` in total. Workers still running afterwards are
    /// logged and left to finish on their own.
    pub async fn shutdown(&mut self) {
        info!("[RabbitMQ] Initiating graceful shutdown...");
        self.shutdown.cancel();

        for receiver in self.registry.receivers() {
            if receiver.stop_consuming() {
                debug!(channel = %receiver.id(), "stop consuming requested");
            }
        }

        let deadline = Instant::now() + self.settings.shutdown_timeout();
        for worker in self.workers.iter_mut() {
            let Some(task) = worker.task.take() else {
                continue;
            };
            match tokio::time::timeout_at(deadline, task).await {
                Ok(Ok(())) => debug!(channel = %worker.channel.id(), role = %worker.role, "worker stopped"),
                Ok(Err(e)) => error!(channel = %worker.channel.id(), role = %worker.role, "[RabbitMQ] worker failed: {}", e),
                Err(_) => warn!(
                    channel = %worker.channel.id(),
                    role = %worker.role,
                    "[RabbitMQ] worker did not stop within timeout"
                ),
            }
        }

        info!("[RabbitMQ] Graceful shutdown completed");
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Current lifecycle state of every spawned worker.
    pub fn states(&self) -> Vec<(Role, ChannelId, WorkerState)> {
        self.workers
            .iter()
            .map(|w| (w.role, w.channel.id().clone(), *w.state.borrow()))
            .collect()
    }

    /// State of the first worker spawned for `(role, id)`.
    pub fn state(&self, role: Role, id: &ChannelId) -> Option<WorkerState> {
        self.workers
            .iter()
            .find(|w| w.role == role && w.channel.id() == id)
            .map(|w| *w.state.borrow())
    }
}

impl<B: Broker> Drop for ChannelManager<B> {
    fn drop(&mut self) {
        // Detached workers must not outlive the manager's signal.
        self.shutdown.cancel();
        for receiver in self.registry.receivers() {
            receiver.stop_consuming();
        }
    }
}
