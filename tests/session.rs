use rabbitmq_session::{
    memory::InMemoryBroker, BrokerError, BrokerSession, Configs, DeliveryState, ErrorKind,
};
use serde_json::{json, Value};

const EXCHANGE: &str = "orders.direct";
const QUEUE: &str = "orders.q";
const ROUTING_KEY: &str = "orders.new";

async fn bound_session(broker: &InMemoryBroker) -> BrokerSession {
    let mut session = BrokerSession::new(broker.transport(), "orders-api");
    session.bind(EXCHANGE, QUEUE, ROUTING_KEY).await.unwrap();
    session
}

#[tokio::test]
async fn explicit_credentials_round_trip() {
    let cfg = Configs::explicit("localhost", 5672, "guest", "guest").app_name("orders-api");
    let broker = InMemoryBroker::new();
    let mut session = BrokerSession::new(broker.transport(), &cfg.app.name);

    session.bind(EXCHANGE, QUEUE, ROUTING_KEY).await.unwrap();
    let sent = session.produce(br#"{"id":42}"#.to_vec()).await.unwrap();
    let received = session.consume().await.unwrap().unwrap();

    assert_eq!(received.version(), Some("1.0.0"));
    assert_eq!(received.producer(), Some("orders-api"));
    assert_eq!(received.json::<Value>().unwrap(), json!({"id": 42}));
    assert_eq!(received.id(), sent.id());
    assert_eq!(received.timestamp(), sent.timestamp());
    assert_eq!(received.routing_key(), ROUTING_KEY);
    assert!(!received.is_redelivered());

    session.ack(&received).await.unwrap();
    assert_eq!(broker.ready_count(QUEUE).unwrap(), 0);
}

#[tokio::test]
async fn binding_twice_converges() {
    let broker = InMemoryBroker::new();
    let mut session = bound_session(&broker).await;

    session.bind(EXCHANGE, QUEUE, ROUTING_KEY).await.unwrap();

    assert_eq!(broker.exchange_count().unwrap(), 1);
    assert_eq!(broker.queue_count().unwrap(), 1);
    assert_eq!(broker.binding_count().unwrap(), 1);

    session.produce_json(&json!({"id": 1})).await.unwrap();
    assert_eq!(broker.ready_count(QUEUE).unwrap(), 1);
}

#[tokio::test]
async fn payloads_survive_the_round_trip() {
    let broker = InMemoryBroker::new();
    let session = bound_session(&broker).await;

    let payloads: Vec<Vec<u8>> = vec![
        Vec::new(),
        br#"{"id":42,"items":["a","b"]}"#.to_vec(),
        "{\"name\":\"caf\u{e9}\"}".as_bytes().to_vec(),
        vec![0, 159, 146, 150],
    ];

    for payload in &payloads {
        session.produce(payload.clone()).await.unwrap();
    }

    for payload in &payloads {
        let envelope = session.consume().await.unwrap().unwrap();
        assert_eq!(envelope.payload(), payload.as_slice());
        session.ack(&envelope).await.unwrap();
    }
}

#[tokio::test]
async fn second_ack_fails() {
    let broker = InMemoryBroker::new();
    let session = bound_session(&broker).await;
    session.produce_json(&json!({"id": 7})).await.unwrap();

    let envelope = session.consume().await.unwrap().unwrap();
    session.ack(&envelope).await.unwrap();

    let err = session.ack(&envelope).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Ack);
}

#[tokio::test]
async fn ack_from_another_session_fails() {
    let broker = InMemoryBroker::new();
    let producer = bound_session(&broker).await;
    let consumer = bound_session(&broker).await;
    producer.produce_json(&json!({"id": 7})).await.unwrap();

    let envelope = consumer.consume().await.unwrap().unwrap();

    assert!(matches!(
        producer.ack(&envelope).await,
        Err(BrokerError::AckError(_))
    ));
    assert_eq!(producer.delivery_state(&envelope).await, None);
    consumer.ack(&envelope).await.unwrap();
}

#[tokio::test]
async fn empty_queue_yields_nothing() {
    let broker = InMemoryBroker::new();
    let session = bound_session(&broker).await;

    assert!(session.consume().await.unwrap().is_none());
}

#[tokio::test]
async fn produce_before_bind_sends_nothing() {
    let broker = InMemoryBroker::new();
    let session = BrokerSession::new(broker.transport(), "orders-api");

    let err = session.produce(br#"{"id":42}"#.to_vec()).await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Publish);
    assert_eq!(broker.published_count(), 0);
}

#[tokio::test]
async fn empty_binding_names_are_rejected() {
    let broker = InMemoryBroker::new();
    let mut session = BrokerSession::new(broker.transport(), "orders-api");

    let err = session.bind(EXCHANGE, "", ROUTING_KEY).await.unwrap_err();

    assert_eq!(err, BrokerError::InvalidBinding("queue"));
    assert_eq!(broker.exchange_count().unwrap(), 0);
}

#[tokio::test]
async fn incompatible_existing_queue_is_a_topology_error() {
    let broker = InMemoryBroker::new();
    let transport = broker.transport();
    rabbitmq_session::Transport::declare_queue(
        &transport,
        &rabbitmq_session::queue::QueueDefinition::new(QUEUE).exclusive(),
    )
    .await
    .unwrap();

    let mut session = BrokerSession::new(transport, "orders-api");
    let err = session.bind(EXCHANGE, QUEUE, ROUTING_KEY).await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Topology);
    assert!(session.binding().is_none());
}

#[tokio::test]
async fn rebinding_moves_the_session_to_the_new_key() {
    let broker = InMemoryBroker::new();
    let mut session = bound_session(&broker).await;

    session
        .bind(EXCHANGE, "orders.cancelled.q", "orders.cancelled")
        .await
        .unwrap();
    session.produce_json(&json!({"id": 3})).await.unwrap();

    assert_eq!(broker.ready_count(QUEUE).unwrap(), 0);
    assert_eq!(broker.ready_count("orders.cancelled.q").unwrap(), 1);
    assert!(broker.has_binding(EXCHANGE, QUEUE, ROUTING_KEY).unwrap());
}

#[tokio::test]
async fn closing_with_unacked_deliveries_requeues_them() {
    let broker = InMemoryBroker::new();
    let session = bound_session(&broker).await;
    session.produce_json(&json!({"id": 9})).await.unwrap();

    let envelope = session.consume().await.unwrap().unwrap();
    assert_eq!(
        session.delivery_state(&envelope).await,
        Some(DeliveryState::Delivered)
    );
    session.close().await.unwrap();

    let next = bound_session(&broker).await;
    let again = next.consume().await.unwrap().unwrap();

    assert!(again.is_redelivered());
    assert_eq!(again.id(), envelope.id());
    next.ack(&again).await.unwrap();
}

#[tokio::test]
async fn nack_with_requeue_redelivers() {
    let broker = InMemoryBroker::new();
    let session = bound_session(&broker).await;
    session.produce_json(&json!({"id": 5})).await.unwrap();

    let first = session.consume().await.unwrap().unwrap();
    session.nack(&first, true).await.unwrap();

    let second = session.consume().await.unwrap().unwrap();
    assert!(second.is_redelivered());
    assert_ne!(first.delivery(), second.delivery());

    session.nack(&second, false).await.unwrap();
    assert!(session.consume().await.unwrap().is_none());
}

#[tokio::test]
#[ignore = "requires a RabbitMQ broker on localhost:5672"]
async fn live_broker_round_trip() {
    let cfg = Configs::explicit("localhost", 5672, "guest", "guest").app_name("orders-api");
    let mut session = BrokerSession::connect(&cfg).await.unwrap();
    session.bind(EXCHANGE, QUEUE, ROUTING_KEY).await.unwrap();

    session.produce_json(&json!({"id": 42})).await.unwrap();

    let mut received = None;
    for _ in 0..20 {
        received = session.consume().await.unwrap();
        if received.is_some() {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    }
    let envelope = received.expect("message should arrive");

    assert_eq!(envelope.version(), Some("1.0.0"));
    session.ack(&envelope).await.unwrap();
    session.close().await.unwrap();
}
