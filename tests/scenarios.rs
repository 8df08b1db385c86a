// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

use futures_util::StreamExt;
use lapin::{
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
        BasicQosOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
    },
    types::{AMQPValue, FieldTable, LongString, ShortString},
    BasicProperties,
};
use rabbitmq_engine::{
    AmqpError, Broker, BrokerEngine, Channel, Confirmation, Connection, ConnectionConfig,
    ConnectionState, Consumer, ExchangeKind,
};
use std::{
    collections::{BTreeSet, HashMap},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::time::timeout;

async fn open(broker: &Broker) -> (Connection, Channel) {
    let conn = broker
        .open_connection(ConnectionConfig::default())
        .await
        .unwrap();
    let channel = conn.create_channel().await.unwrap();
    (conn, channel)
}

async fn declare_queue(channel: &Channel, queue: &str) {
    channel
        .queue_declare(queue, QueueDeclareOptions::default(), FieldTable::default())
        .await
        .unwrap();
}

async fn declare_exchange(channel: &Channel, exchange: &str, kind: ExchangeKind) {
    channel
        .exchange_declare(
            exchange,
            kind,
            ExchangeDeclareOptions::default(),
            FieldTable::default(),
        )
        .await
        .unwrap();
}

async fn bind(channel: &Channel, queue: &str, exchange: &str, key: &str) {
    channel
        .queue_bind(
            queue,
            exchange,
            key,
            QueueBindOptions::default(),
            FieldTable::default(),
        )
        .await
        .unwrap();
}

async fn publish(channel: &Channel, exchange: &str, key: &str, body: &str) -> bool {
    channel
        .basic_publish(
            exchange,
            key,
            BasicPublishOptions::default(),
            body.as_bytes(),
            BasicProperties::default(),
        )
        .await
        .unwrap()
        .is_routed()
}

async fn consume(channel: &Channel, queue: &str, tag: &str) -> Consumer {
    channel
        .basic_consume(
            queue,
            tag,
            BasicConsumeOptions::default(),
            FieldTable::default(),
        )
        .await
        .unwrap()
}

async fn next_body(consumer: &mut Consumer) -> Vec<u8> {
    timeout(Duration::from_secs(1), consumer.next())
        .await
        .expect("delivery expected")
        .expect("consumer stream ended")
        .data
}

async fn message_count(channel: &Channel, queue: &str) -> u32 {
    channel
        .queue_declare(
            queue,
            QueueDeclareOptions {
                passive: true,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await
        .unwrap()
        .message_count
}

#[tokio::test]
async fn topic_binding_routes_matching_keys_only() {
    let broker = Broker::new();
    let (_conn, channel) = open(&broker).await;

    declare_queue(&channel, "Q").await;
    declare_exchange(&channel, "E", ExchangeKind::Topic).await;
    bind(&channel, "Q", "E", "orders.*").await;

    assert!(publish(&channel, "E", "orders.created", "order").await);
    assert_eq!(message_count(&channel, "Q").await, 1);

    assert!(!publish(&channel, "E", "billing.created", "bill").await);
    assert_eq!(message_count(&channel, "Q").await, 1);

    let delivery = channel
        .basic_get("Q", Default::default())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(delivery.routing_key, "orders.created");
    assert_eq!(message_count(&channel, "Q").await, 0);
}

#[tokio::test]
async fn fanout_reaches_exactly_the_bound_queues() {
    let broker = Broker::new();
    let (_conn, channel) = open(&broker).await;

    for queue in ["a", "b", "unbound"] {
        declare_queue(&channel, queue).await;
    }
    declare_exchange(&channel, "broadcast", ExchangeKind::Fanout).await;
    bind(&channel, "a", "broadcast", "ignored").await;
    bind(&channel, "b", "broadcast", "").await;

    let routed = broker.topology().route("broadcast", "any.key", None).unwrap();
    assert_eq!(routed, BTreeSet::from(["a".to_owned(), "b".to_owned()]));

    publish(&channel, "broadcast", "whatever", "x").await;
    assert_eq!(message_count(&channel, "a").await, 1);
    assert_eq!(message_count(&channel, "b").await, 1);
    assert_eq!(message_count(&channel, "unbound").await, 0);
}

#[tokio::test]
async fn headers_exchange_matches_on_headers() {
    let broker = Broker::new();
    let (_conn, channel) = open(&broker).await;

    declare_queue(&channel, "reports").await;
    declare_exchange(&channel, "by-headers", ExchangeKind::Headers).await;

    let mut args = FieldTable::default();
    args.insert(
        ShortString::from("x-match"),
        AMQPValue::LongString(LongString::from("any")),
    );
    args.insert(
        ShortString::from("format"),
        AMQPValue::LongString(LongString::from("pdf")),
    );
    channel
        .queue_bind("reports", "by-headers", "", QueueBindOptions::default(), args)
        .await
        .unwrap();

    let mut headers = FieldTable::default();
    headers.insert(
        ShortString::from("format"),
        AMQPValue::LongString(LongString::from("pdf")),
    );
    let confirm = channel
        .basic_publish(
            "by-headers",
            "",
            BasicPublishOptions::default(),
            b"report",
            BasicProperties::default().with_headers(headers),
        )
        .await
        .unwrap();

    assert!(confirm.is_routed());
    assert!(!publish(&channel, "by-headers", "", "no headers").await);
    assert_eq!(message_count(&channel, "reports").await, 1);
}

#[tokio::test]
async fn redeclaring_identical_queue_leaves_one_entry() {
    let broker = Broker::new();
    let (_conn, channel) = open(&broker).await;

    declare_queue(&channel, "jobs").await;
    declare_queue(&channel, "jobs").await;

    assert_eq!(
        broker.topology().queue_names(),
        BTreeSet::from(["jobs".to_owned()])
    );

    let conflict = channel
        .queue_declare(
            "jobs",
            QueueDeclareOptions {
                durable: true,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await;
    assert!(matches!(conflict, Err(AmqpError::TopologyConflict(_))));
}

#[tokio::test]
async fn unbinding_an_absent_binding_is_a_noop() {
    let broker = Broker::new();
    let (_conn, channel) = open(&broker).await;

    declare_queue(&channel, "q").await;
    declare_exchange(&channel, "e", ExchangeKind::Direct).await;

    channel
        .queue_unbind("q", "e", "never-bound", FieldTable::default())
        .await
        .unwrap();

    assert!(matches!(
        channel
            .queue_unbind("q", "missing", "k", FieldTable::default())
            .await,
        Err(AmqpError::NotFound(_))
    ));
}

#[tokio::test]
async fn two_consumers_with_prefetch_one_get_one_message_each() {
    let broker = Broker::new();
    let (_conn, channel) = open(&broker).await;
    declare_queue(&channel, "Q").await;
    channel
        .basic_qos(1, BasicQosOptions::default())
        .await
        .unwrap();

    let mut first = consume(&channel, "Q", "first").await;
    let mut second = consume(&channel, "Q", "second").await;

    publish(&channel, "", "Q", "1").await;
    publish(&channel, "", "Q", "2").await;

    let a = next_body(&mut first).await;
    let b = next_body(&mut second).await;
    let mut bodies = vec![a, b];
    bodies.sort();

    assert_eq!(bodies, vec![b"1".to_vec(), b"2".to_vec()]);
    assert_eq!(message_count(&channel, "Q").await, 0);
}

#[tokio::test]
async fn prefetch_limit_is_never_exceeded() {
    let broker = Broker::new();
    let (_conn, channel) = open(&broker).await;
    declare_queue(&channel, "Q").await;
    channel
        .basic_qos(2, BasicQosOptions::default())
        .await
        .unwrap();

    let mut consumer = consume(&channel, "Q", "c").await;
    for i in 0..10 {
        publish(&channel, "", "Q", &i.to_string()).await;
        assert!(channel.unacked_count() <= 2);
    }

    let mut received = 0;
    while received < 10 {
        let delivery = timeout(Duration::from_secs(1), consumer.next())
            .await
            .unwrap()
            .unwrap();
        assert!(channel.unacked_count() <= 2);
        delivery.ack(BasicAckOptions::default()).await.unwrap();
        received += 1;
    }

    assert_eq!(message_count(&channel, "Q").await, 0);
}

#[tokio::test]
async fn nacked_message_is_redelivered_before_later_messages() {
    let broker = Broker::new();
    let (_conn, channel) = open(&broker).await;
    declare_queue(&channel, "Q").await;
    channel
        .basic_qos(1, BasicQosOptions::default())
        .await
        .unwrap();

    let mut consumer = consume(&channel, "Q", "c").await;
    publish(&channel, "", "Q", "first").await;
    publish(&channel, "", "Q", "second").await;

    let delivery = timeout(Duration::from_secs(1), consumer.next())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(delivery.data, b"first".to_vec());

    delivery
        .nack(BasicNackOptions {
            multiple: false,
            requeue: true,
        })
        .await
        .unwrap();

    let again = timeout(Duration::from_secs(1), consumer.next())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(again.data, b"first".to_vec());
    assert!(again.redelivered);
    again.ack(BasicAckOptions::default()).await.unwrap();

    assert_eq!(next_body(&mut consumer).await, b"second".to_vec());
}

#[tokio::test]
async fn nack_without_requeue_discards() {
    let broker = Broker::new();
    let (_conn, channel) = open(&broker).await;
    declare_queue(&channel, "Q").await;

    let mut consumer = consume(&channel, "Q", "c").await;
    publish(&channel, "", "Q", "poison").await;

    let delivery = consumer.next().await.unwrap();
    delivery
        .nack(BasicNackOptions {
            multiple: false,
            requeue: false,
        })
        .await
        .unwrap();

    assert_eq!(channel.unacked_count(), 0);
    assert_eq!(message_count(&channel, "Q").await, 0);
}

#[tokio::test]
async fn closing_a_channel_requeues_unacked_messages_for_other_consumers() {
    let broker = Broker::new();
    let (conn, channel) = open(&broker).await;
    declare_queue(&channel, "Q").await;

    let mut consumer = consume(&channel, "Q", "c").await;
    publish(&channel, "", "Q", "A").await;
    publish(&channel, "", "Q", "B").await;

    let a = consumer.next().await.unwrap();
    let b = consumer.next().await.unwrap();
    assert_eq!(b.data, b"B".to_vec());
    a.ack(BasicAckOptions::default()).await.unwrap();

    channel.close().await.unwrap();
    assert!(consumer.next().await.is_none());
    assert_eq!(message_count(&conn.create_channel().await.unwrap(), "Q").await, 1);

    let other = conn.create_channel().await.unwrap();
    let mut other_consumer = consume(&other, "Q", "other").await;
    let redelivered = other_consumer.next().await.unwrap();

    assert_eq!(redelivered.data, b"B".to_vec());
    assert!(redelivered.redelivered);
    assert_eq!(
        b.ack(BasicAckOptions::default()).await,
        Err(AmqpError::ChannelClosed)
    );
}

#[tokio::test]
async fn mandatory_publish_without_binding_is_unroutable() {
    let broker = Broker::new();
    let (_conn, channel) = open(&broker).await;
    declare_exchange(&channel, "E", ExchangeKind::Direct).await;

    let result = channel
        .basic_publish(
            "E",
            "nobody",
            BasicPublishOptions {
                mandatory: true,
                immediate: false,
            },
            b"lost",
            BasicProperties::default(),
        )
        .await;

    assert_eq!(
        result.unwrap_err(),
        AmqpError::Unroutable {
            exchange: "E".to_owned(),
            routing_key: "nobody".to_owned(),
        }
    );
    assert!(!publish(&channel, "E", "nobody", "dropped").await);
}

#[tokio::test]
async fn publishing_to_a_missing_exchange_is_not_found() {
    let broker = Broker::new();
    let (_conn, channel) = open(&broker).await;

    let result = channel
        .basic_publish(
            "missing",
            "k",
            BasicPublishOptions::default(),
            b"x",
            BasicProperties::default(),
        )
        .await;

    assert!(matches!(result, Err(AmqpError::NotFound(_))));
}

#[tokio::test]
async fn exclusive_consumer_conflicts_are_refused() {
    let broker = Broker::new();
    let (_conn, channel) = open(&broker).await;
    declare_queue(&channel, "Q").await;

    let _shared = consume(&channel, "Q", "shared").await;
    let exclusive = channel
        .basic_consume(
            "Q",
            "exclusive",
            BasicConsumeOptions {
                exclusive: true,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await;

    assert!(matches!(exclusive, Err(AmqpError::AccessRefused(_))));
}

#[tokio::test]
async fn exclusive_queue_is_refused_to_other_connections() {
    let broker = Broker::new();
    let (owner, channel) = open(&broker).await;
    let (_other, other_channel) = open(&broker).await;

    channel
        .queue_declare(
            "private",
            QueueDeclareOptions {
                exclusive: true,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await
        .unwrap();

    let refused = other_channel
        .basic_consume(
            "private",
            "",
            BasicConsumeOptions::default(),
            FieldTable::default(),
        )
        .await;
    assert!(matches!(refused, Err(AmqpError::AccessRefused(_))));

    owner.close().await.unwrap();
    assert!(broker.topology().queue_info("private").is_err());
}

#[tokio::test]
async fn confirm_channel_resolves_publishes() {
    let broker = Broker::new();
    let conn = broker
        .open_connection(ConnectionConfig::default())
        .await
        .unwrap();
    let channel = conn.create_confirm_channel().await.unwrap();
    declare_queue(&channel, "Q").await;

    let confirm = channel
        .send_to_queue("Q", b"payload", BasicProperties::default())
        .await
        .unwrap();

    assert_eq!(confirm.sequence(), Some(1));
    assert_eq!(confirm.await.unwrap(), Confirmation::Ack);
    channel.wait_for_confirms().await.unwrap();
}

#[tokio::test]
async fn closed_connection_refuses_new_channels() {
    let broker = Broker::new();
    let (conn, channel) = open(&broker).await;
    let mut state = conn.subscribe();

    conn.close().await.unwrap();
    state
        .wait_for(|state| *state == ConnectionState::Closed)
        .await
        .unwrap();

    assert_eq!(
        conn.create_channel().await.unwrap_err(),
        AmqpError::ConnectionClosed
    );
    assert!(!channel.is_open());
    assert_eq!(
        publish_error(&channel).await,
        AmqpError::ChannelClosed
    );
}

async fn publish_error(channel: &Channel) -> AmqpError {
    channel
        .basic_publish(
            "",
            "Q",
            BasicPublishOptions::default(),
            b"x",
            BasicProperties::default(),
        )
        .await
        .unwrap_err()
}

#[tokio::test]
async fn deleting_a_queue_discards_ready_and_in_flight_messages() {
    let broker = Broker::new();
    let (_conn, channel) = open(&broker).await;
    declare_queue(&channel, "Q").await;
    channel
        .basic_qos(1, BasicQosOptions::default())
        .await
        .unwrap();

    let mut consumer = consume(&channel, "Q", "c").await;
    publish(&channel, "", "Q", "in-flight").await;
    publish(&channel, "", "Q", "ready").await;
    let delivery = consumer.next().await.unwrap();

    let discarded = channel
        .queue_delete("Q", Default::default())
        .await
        .unwrap();

    assert_eq!(discarded, 1);
    assert_eq!(channel.unacked_count(), 0);
    assert!(consumer.next().await.is_none());
    assert_eq!(
        delivery.ack(BasicAckOptions::default()).await,
        Err(AmqpError::InvalidDeliveryTag(delivery.delivery_tag))
    );
    assert!(broker.topology().queue_info("Q").is_err());
}

fn parse_job(body: &[u8]) -> (usize, usize) {
    let body = std::str::from_utf8(body).unwrap();
    let (publisher, seq) = body.split_once('-').unwrap();
    (publisher.parse().unwrap(), seq.parse().unwrap())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_publishers_and_consumers_settle_every_message_once() {
    const PUBLISHERS: usize = 4;
    const PER_PUBLISHER: usize = 50;
    const CONSUMERS: usize = 3;
    const PREFETCH: u16 = 2;
    let total = PUBLISHERS * PER_PUBLISHER;

    let broker = Broker::new();
    let (conn, channel) = open(&broker).await;
    declare_queue(&channel, "work").await;
    declare_queue(&channel, "audit").await;
    declare_exchange(&channel, "jobs", ExchangeKind::Fanout).await;
    bind(&channel, "work", "jobs", "").await;
    bind(&channel, "audit", "jobs", "").await;

    let acked = Arc::new(AtomicUsize::new(0));
    let mut worker_channels = Vec::new();
    let mut workers = Vec::new();

    for i in 0..CONSUMERS {
        let worker = conn.create_channel().await.unwrap();
        worker
            .basic_qos(PREFETCH, BasicQosOptions::default())
            .await
            .unwrap();
        let mut consumer = consume(&worker, "work", &format!("worker-{i}")).await;
        let acked = acked.clone();
        let channel = worker.clone();

        workers.push(tokio::spawn(async move {
            let mut settled = Vec::new();
            let mut last_fresh: HashMap<usize, usize> = HashMap::new();

            while let Some(delivery) = consumer.next().await {
                assert!(channel.unacked_count() <= usize::from(PREFETCH));
                let (publisher, seq) = parse_job(&delivery.data);

                if delivery.redelivered {
                    delivery.ack(BasicAckOptions::default()).await.unwrap();
                } else {
                    if let Some(previous) = last_fresh.insert(publisher, seq) {
                        assert!(previous < seq, "{publisher}-{seq} arrived after {previous}");
                    }

                    if seq % 7 == 0 {
                        delivery
                            .nack(BasicNackOptions {
                                multiple: false,
                                requeue: true,
                            })
                            .await
                            .unwrap();
                        continue;
                    }
                    delivery.ack(BasicAckOptions::default()).await.unwrap();
                }

                settled.push((publisher, seq));
                acked.fetch_add(1, Ordering::SeqCst);
            }

            settled
        }));
        worker_channels.push(worker);
    }

    let publishers: Vec<_> = (0..PUBLISHERS)
        .map(|publisher| {
            let conn = conn.clone();
            tokio::spawn(async move {
                let channel = conn.create_channel().await.unwrap();
                for seq in 0..PER_PUBLISHER {
                    assert!(publish(&channel, "jobs", "", &format!("{publisher}-{seq}")).await);
                }
            })
        })
        .collect();
    for publisher in publishers {
        publisher.await.unwrap();
    }

    timeout(Duration::from_secs(10), async {
        while acked.load(Ordering::SeqCst) < total {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("every message acknowledged");

    for worker in &worker_channels {
        worker.close().await.unwrap();
    }

    let mut settled = Vec::new();
    for worker in workers {
        settled.extend(worker.await.unwrap());
    }
    settled.sort_unstable();

    let expected: Vec<(usize, usize)> = (0..PUBLISHERS)
        .flat_map(|publisher| (0..PER_PUBLISHER).map(move |seq| (publisher, seq)))
        .collect();
    assert_eq!(settled, expected);
    assert_eq!(message_count(&channel, "work").await, 0);
    assert_eq!(message_count(&channel, "audit").await, total as u32);
}
