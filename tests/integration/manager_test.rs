// End-to-end behaviour of the channel manager against the in-process broker.

use std::time::{Duration, Instant};

use rmq_channels::rabbitmq::{Broker, BrokerConnection, MemoryBroker};
use rmq_channels::{
    BrokerEndpoint, ChannelConfig, ChannelId, ChannelManager, ManagerSettings, MessageQueue, Role,
    WorkerState,
};

fn test_settings() -> ManagerSettings {
    ManagerSettings::default()
        .with_retry_backoff(Duration::from_millis(50))
        .with_shutdown_timeout(Duration::from_millis(500))
        .with_poll_interval(Duration::from_millis(10))
}

fn channel(exchange: &str, routing_key: &str, queue: &MessageQueue) -> ChannelConfig {
    ChannelConfig::new(BrokerEndpoint::default(), exchange, routing_key).with_queue(queue.clone())
}

async fn wait_until<F: Fn() -> bool>(timeout: Duration, condition: F) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}

async fn wait_for_receivers<B: Broker>(manager: &ChannelManager<B>) {
    let ready = wait_until(Duration::from_secs(2), || {
        manager
            .states()
            .iter()
            .filter(|(role, _, _)| *role == Role::Recv)
            .all(|(_, _, state)| *state == WorkerState::Active)
    })
    .await;
    assert!(ready, "receivers never became active: {:?}", manager.states());
}

async fn collect(queue: &MessageQueue, count: usize, timeout: Duration) -> Vec<Vec<u8>> {
    let mut received = Vec::new();
    for _ in 0..count {
        match queue.pop_timeout(timeout).await {
            Some(message) => received.push(message),
            None => break,
        }
    }
    received
}

#[tokio::test]
async fn test_registration_is_idempotent() {
    let mut manager = ChannelManager::with_broker(MemoryBroker::new(), test_settings());
    let queue = MessageQueue::new();

    assert!(manager.register(Role::Send, channel("orders", "order.created", &queue)));
    assert!(!manager.register(Role::Send, channel("orders", "order.created", &MessageQueue::new())));
    assert_eq!(manager.registry().len(Role::Send), 1);

    let id = ChannelId::new("orders", "order.created");
    let entry = manager.registry().get(Role::Send, &id).unwrap();
    queue.push("mine").unwrap();
    assert_eq!(entry.queue().len(), 1);
}

#[tokio::test]
async fn test_invalid_registrations_leave_registry_unchanged() {
    let mut manager = ChannelManager::with_broker(MemoryBroker::new(), test_settings());
    let queue = MessageQueue::new();

    assert!(!manager.register(Role::Recv, channel("", "rk", &queue)));
    assert!(!manager.register(Role::Recv, channel("ex", "", &queue)));
    assert!(!manager.register(Role::Send, ChannelConfig::new(BrokerEndpoint::default(), "ex", "rk")));
    assert!("sideways".parse::<Role>().is_err());
    assert!(manager.registry().is_empty());
}

#[tokio::test]
async fn test_single_channel_delivery_is_fifo() {
    let broker = MemoryBroker::new();
    let inbound = MessageQueue::new();
    let outbound = MessageQueue::new();

    let mut receivers = ChannelManager::with_broker(broker.clone(), test_settings());
    receivers.register(Role::Recv, channel("orders", "order.created", &inbound));
    receivers.run();
    wait_for_receivers(&receivers).await;

    for message in ["m1", "m2", "m3", "m4"] {
        outbound.push(message).unwrap();
    }
    let mut senders = ChannelManager::with_broker(broker.clone(), test_settings());
    senders.register(Role::Send, channel("orders", "order.created", &outbound));
    senders.run();

    let received = collect(&inbound, 4, Duration::from_secs(2)).await;
    assert_eq!(
        received,
        vec![b"m1".to_vec(), b"m2".to_vec(), b"m3".to_vec(), b"m4".to_vec()]
    );

    senders.shutdown().await;
    receivers.shutdown().await;
}

#[tokio::test]
async fn test_reconnect_and_deliver_exactly_once() {
    let broker = MemoryBroker::new();
    let inbound = MessageQueue::new();
    let outbound = MessageQueue::new();

    let mut receivers = ChannelManager::with_broker(broker.clone(), test_settings());
    receivers.register(Role::Recv, channel("orders", "order.created", &inbound));
    receivers.run();
    wait_for_receivers(&receivers).await;

    outbound.push("survives the outage").unwrap();
    broker.refuse_next_connects(1);
    let attempts_before = broker.connect_attempts();

    let mut senders = ChannelManager::with_broker(broker.clone(), test_settings());
    senders.register(Role::Send, channel("orders", "order.created", &outbound));
    let started = Instant::now();
    senders.run();

    let received = inbound.pop_timeout(Duration::from_secs(2)).await;
    assert_eq!(received.unwrap(), b"survives the outage");
    // Delivered only after the fixed backoff.
    assert!(started.elapsed() >= Duration::from_millis(50));
    assert_eq!(broker.connect_attempts() - attempts_before, 2);

    // And only once.
    assert!(inbound.pop_timeout(Duration::from_millis(100)).await.is_none());
    assert_eq!(broker.published_count(), 1);

    senders.shutdown().await;
    receivers.shutdown().await;
}

#[tokio::test]
async fn test_receiver_recovers_from_dropped_connection() {
    let broker = MemoryBroker::new();
    let inbound = MessageQueue::new();
    let outbound = MessageQueue::new();

    let mut manager = ChannelManager::with_broker(broker.clone(), test_settings());
    manager.register(Role::Recv, channel("events", "audit", &inbound));
    manager.register(Role::Send, channel("events", "audit", &outbound));
    manager.run();
    wait_for_receivers(&manager).await;

    broker.drop_connections();
    assert!(
        wait_until(Duration::from_secs(2), || broker.connect_attempts() >= 2
            && manager.state(Role::Recv, &ChannelId::new("events", "audit")) == Some(WorkerState::Active))
        .await
    );

    outbound.push("after the blip").unwrap();
    let received = inbound.pop_timeout(Duration::from_secs(2)).await;
    assert_eq!(received.unwrap(), b"after the blip");

    manager.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_is_bounded_when_broker_is_down() {
    let broker = MemoryBroker::new();
    broker.set_available(false);

    let mut manager = ChannelManager::with_broker(broker.clone(), test_settings());
    for i in 0..5 {
        let queue = MessageQueue::new();
        queue.push("stuck").unwrap();
        manager.register(Role::Send, channel("ex", &format!("rk{}", i), &queue));
        manager.register(Role::Recv, channel("ex", &format!("rk{}", i), &MessageQueue::new()));
    }
    manager.run();
    assert!(wait_until(Duration::from_secs(2), || broker.connect_attempts() >= 10).await);

    let started = Instant::now();
    manager.shutdown().await;
    assert!(started.elapsed() < Duration::from_millis(500) + Duration::from_millis(250));

    for (_, _, state) in manager.states() {
        assert_eq!(state, WorkerState::Terminated);
    }
}

#[tokio::test]
async fn test_shutdown_gives_up_on_hung_workers() {
    let broker = MemoryBroker::new();
    broker.set_stalled(true);

    let mut manager = ChannelManager::with_broker(broker.clone(), test_settings());
    manager.register(Role::Recv, channel("ex", "rk", &MessageQueue::new()));
    manager.run();
    assert!(wait_until(Duration::from_secs(2), || broker.connect_attempts() == 1).await);

    let started = Instant::now();
    manager.shutdown().await;
    let elapsed = started.elapsed();

    // The worker is parked in connect; shutdown waits out the timeout and returns anyway.
    assert!(elapsed >= Duration::from_millis(450));
    assert!(elapsed < Duration::from_millis(500) + Duration::from_millis(250));
    assert_eq!(
        manager.state(Role::Recv, &ChannelId::new("ex", "rk")),
        Some(WorkerState::Connecting)
    );
}

#[tokio::test]
async fn test_no_cross_talk_between_channels() {
    let broker = MemoryBroker::new();
    let mut manager = ChannelManager::with_broker(broker.clone(), test_settings());

    let identities = [("orders", "order.created"), ("orders", "order.cancelled"), ("billing", "order.created")];
    let mut queues = Vec::new();
    for (exchange, routing_key) in identities {
        let inbound = MessageQueue::new();
        let outbound = MessageQueue::new();
        manager.register(Role::Recv, channel(exchange, routing_key, &inbound));
        manager.register(Role::Send, channel(exchange, routing_key, &outbound));
        queues.push((format!("{}/{}", exchange, routing_key), inbound, outbound));
    }
    manager.run();
    wait_for_receivers(&manager).await;

    for (tag, _, outbound) in &queues {
        for n in 0..3 {
            outbound.push(format!("{}#{}", tag, n)).unwrap();
        }
    }

    for (tag, inbound, _) in &queues {
        let received = collect(inbound, 3, Duration::from_secs(2)).await;
        assert_eq!(received.len(), 3, "channel {} missed messages", tag);
        for (n, message) in received.iter().enumerate() {
            assert_eq!(String::from_utf8_lossy(message), format!("{}#{}", tag, n));
        }
    }
    tokio::time::sleep(Duration::from_millis(50)).await;
    for (tag, inbound, _) in &queues {
        assert!(inbound.is_empty(), "channel {} got foreign messages", tag);
    }

    manager.shutdown().await;
}

#[tokio::test]
async fn test_topic_exchange_fans_out_by_pattern() {
    let broker = MemoryBroker::new();
    let wildcard = MessageQueue::new();
    let exact = MessageQueue::new();
    let outbound = MessageQueue::new();

    let mut manager = ChannelManager::with_broker(broker.clone(), test_settings());
    manager.register(Role::Recv, channel("events", "order.*", &wildcard).with_exchange_type("topic"));
    manager.register(Role::Recv, channel("events", "order.created", &exact).with_exchange_type("topic"));
    manager.register(Role::Send, channel("events", "order.created", &outbound).with_exchange_type("topic"));
    manager.run();
    wait_for_receivers(&manager).await;

    outbound.push("fan").unwrap();
    assert_eq!(wildcard.pop_timeout(Duration::from_secs(2)).await.unwrap(), b"fan");
    assert_eq!(exact.pop_timeout(Duration::from_secs(2)).await.unwrap(), b"fan");

    manager.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_orders_scenario() {
    let broker = MemoryBroker::new();
    let inbound = MessageQueue::new();
    let outbound = MessageQueue::new();

    let mut manager = ChannelManager::with_broker(broker.clone(), test_settings());
    assert!(manager.register(Role::Send, channel("orders", "order.created", &outbound)));
    assert!(manager.register(Role::Recv, channel("orders", "order.created", &inbound)));

    let messages = [
        b"order-1001".to_vec(),
        b"order-1002".to_vec(),
        b"order-1003".to_vec(),
        b"order-1004".to_vec(),
    ];
    for message in &messages {
        outbound.push(message.clone()).unwrap();
    }
    manager.run();

    let received = collect(&inbound, 4, Duration::from_secs(5)).await;
    assert_eq!(received, messages.to_vec());

    let started = Instant::now();
    manager.shutdown().await;
    assert!(started.elapsed() < Duration::from_millis(500) + Duration::from_millis(250));

    // Nothing moves once the workers are gone.
    outbound.push("too late").unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(inbound.is_empty());
    assert_eq!(outbound.len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_messages_queued_before_run_are_never_lost() {
    for round in 0..50 {
        let broker = MemoryBroker::new();
        let inbound = MessageQueue::new();
        let outbound = MessageQueue::new();

        let mut manager = ChannelManager::with_broker(broker.clone(), test_settings());
        manager.register(Role::Send, channel("orders", "order.created", &outbound));
        manager.register(Role::Recv, channel("orders", "order.created", &inbound));
        for message in ["m1", "m2", "m3", "m4"] {
            outbound.push(message).unwrap();
        }
        manager.run();

        let received = collect(&inbound, 4, Duration::from_secs(2)).await;
        manager.shutdown().await;
        assert_eq!(
            received,
            vec![b"m1".to_vec(), b"m2".to_vec(), b"m3".to_vec(), b"m4".to_vec()],
            "round {} lost messages",
            round
        );
    }
}

#[tokio::test]
async fn test_senders_start_when_receivers_never_bind() {
    let broker = MemoryBroker::new();
    broker.set_stalled(true);
    let outbound = MessageQueue::new();
    outbound.push("waiting").unwrap();

    let mut manager = ChannelManager::with_broker(
        broker.clone(),
        test_settings().with_shutdown_timeout(Duration::from_millis(100)),
    );
    manager.register(Role::Recv, channel("orders", "order.created", &MessageQueue::new()));
    manager.register(Role::Send, channel("orders", "order.created", &outbound));
    manager.run();

    // Only the receiver has tried to connect while the sender holds back.
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(broker.connect_attempts(), 1);

    // After the wait runs out the sender tries anyway.
    assert!(wait_until(Duration::from_secs(2), || broker.connect_attempts() == 2).await);
    manager.shutdown().await;
}

#[tokio::test]
async fn test_publish_requires_declared_exchange() {
    let broker = MemoryBroker::new();
    let mut conn = broker.connect(&BrokerEndpoint::default()).await.unwrap();
    assert!(conn.publish("orders", "order.created", b"x").await.is_err());
    conn.declare_exchange("orders", "direct").await.unwrap();
    conn.publish("orders", "order.created", b"x").await.unwrap();
    assert_eq!(broker.published_count(), 1);
}
