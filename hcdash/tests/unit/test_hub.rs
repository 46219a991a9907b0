//! Hub integration tests

use std::sync::Arc;
use std::time::Duration;

use hcdash::hub::{Delivery, Hub, HubOptions};

fn hub(queue_capacity: usize) -> Hub<u64> {
    Hub::new(HubOptions { queue_capacity })
}

#[test]
fn test_recv_pending_until_publish() {
    let hub = hub(4);
    let subscription = hub.subscribe("docker-stats");
    let publisher = hub.publisher("docker-stats");

    let mut recv = tokio_test::task::spawn(subscription.recv());
    tokio_test::assert_pending!(recv.poll());

    publisher.publish(1);
    assert!(recv.is_woken());
    match tokio_test::assert_ready!(recv.poll()) {
        Delivery::Message(msg) => assert_eq!(*msg, 1),
        Delivery::Closed => panic!("unexpected close"),
    }
}

#[tokio::test]
async fn test_recv_wakes_on_publish_from_another_task() {
    let hub = hub(16);
    let subscription = hub.subscribe("docker-stats");
    let publisher = hub.publisher("docker-stats");

    let handle = tokio::spawn(async move {
        tokio::task::yield_now().await;
        publisher.publish(7);
        publisher
    });

    match subscription.recv().await {
        Delivery::Message(msg) => assert_eq!(*msg, 7),
        Delivery::Closed => panic!("unexpected close"),
    }
    drop(handle.await.unwrap());
}

#[tokio::test]
async fn test_slow_subscriber_drops_oldest_and_counts() {
    let hub = hub(4);
    let slow = hub.subscribe("k8s-metrics:prod");
    let fast = hub.subscribe("k8s-metrics:prod");
    let publisher = hub.publisher("k8s-metrics:prod");

    let mut fast_seen = Vec::new();
    for i in 0..10 {
        assert_eq!(publisher.publish(i), 2);
        if let Some(Delivery::Message(msg)) = fast.try_recv() {
            fast_seen.push(*msg);
        }
    }

    // The fast subscriber kept up and lost nothing
    assert_eq!(fast_seen, (0..10).collect::<Vec<_>>());
    assert_eq!(fast.dropped(), 0);

    // The slow one only keeps the newest messages, in order
    let mut slow_seen = Vec::new();
    while let Some(Delivery::Message(msg)) = slow.try_recv() {
        slow_seen.push(*msg);
    }
    assert_eq!(slow_seen, vec![6, 7, 8, 9]);
    assert_eq!(slow.dropped(), 6);
}

#[tokio::test]
async fn test_close_delivers_pending_then_sentinel() {
    let hub = hub(16);
    let subscription = hub.subscribe("deploy:job-1");
    let publisher = hub.publisher("deploy:job-1");

    publisher.publish(1);
    publisher.publish(2);
    assert_eq!(publisher.close(), 1);
    assert_eq!(publisher.publish(3), 0);

    let mut seen = Vec::new();
    loop {
        match subscription.recv().await {
            Delivery::Message(msg) => seen.push(*msg),
            Delivery::Closed => break,
        }
    }
    assert_eq!(seen, vec![1, 2]);

    // A late subscriber to a closed topic gets the sentinel straight away
    let late = hub.subscribe("deploy:job-1");
    assert!(late.recv().await.is_closed());
}

#[tokio::test]
async fn test_topic_retires_after_last_handle() {
    let hub = hub(16);
    let publisher = hub.publisher("logs:docker:web");
    let subscription = hub.subscribe("logs:docker:web");
    assert!(hub.stats("logs:docker:web").is_some());

    drop(publisher);
    assert_eq!(hub.subscriber_count("logs:docker:web"), 1);

    drop(subscription);
    assert!(hub.stats("logs:docker:web").is_none());
    assert!(hub.topics().is_empty());
}

#[tokio::test]
async fn test_exclusive_publisher_is_released_on_drop() {
    let hub = hub(16);
    let _subscription = hub.subscribe("logs:docker:web");

    let first = hub.try_publisher("logs:docker:web").unwrap();
    assert!(hub.try_publisher("logs:docker:web").is_none());

    drop(first);
    assert!(hub.try_publisher("logs:docker:web").is_some());
}

#[tokio::test(start_paused = true)]
async fn test_reap_spares_touched_subscribers() {
    let hub = hub(16);
    let quiet = hub.subscribe("docker-stats");
    let chatty = hub.subscribe("docker-stats");

    tokio::time::advance(Duration::from_secs(60)).await;
    chatty.touch();
    tokio::time::advance(Duration::from_secs(60)).await;

    assert_eq!(hub.reap_idle(Duration::from_secs(90)), 1);
    assert!(quiet.recv().await.is_closed());
    assert_eq!(hub.subscriber_count("docker-stats"), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_producers_keep_per_producer_order() {
    let hub = Arc::new(hub(10_000));
    let subscription = hub.subscribe("docker-stats");

    let mut handles = Vec::new();
    for producer in 0..4u64 {
        let hub = hub.clone();
        handles.push(tokio::spawn(async move {
            let publisher = hub.publisher("docker-stats");
            for seq in 0..500u64 {
                publisher.publish(producer * 1_000_000 + seq);
                if seq % 50 == 0 {
                    tokio::task::yield_now().await;
                }
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    let mut last = [None::<u64>; 4];
    let mut total = 0;
    while let Some(Delivery::Message(msg)) = subscription.try_recv() {
        let producer = (*msg / 1_000_000) as usize;
        let seq = *msg % 1_000_000;
        if let Some(prev) = last[producer] {
            assert!(seq > prev, "producer {producer} reordered");
        }
        last[producer] = Some(seq);
        total += 1;
    }
    assert_eq!(total, 2000);
    assert_eq!(subscription.dropped(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_churn_while_publishing() {
    let hub = Arc::new(hub(8));
    let publisher = hub.publisher("k8s-metrics:prod");

    let churn: Vec<_> = (0..8)
        .map(|_| {
            let hub = hub.clone();
            tokio::spawn(async move {
                for _ in 0..100 {
                    let subscription = hub.subscribe("k8s-metrics:prod");
                    let _ = subscription.try_recv();
                    drop(subscription);
                    tokio::task::yield_now().await;
                }
            })
        })
        .collect();

    for i in 0..1000 {
        publisher.publish(i);
    }
    for handle in churn {
        handle.await.unwrap();
    }

    assert_eq!(publisher.subscriber_count(), 0);
    drop(publisher);
    assert!(hub.stats("k8s-metrics:prod").is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_topics_retire_and_reappear_under_contention() {
    let hub = Arc::new(hub(4));

    let workers: Vec<_> = (0..8u64)
        .map(|n| {
            let hub = hub.clone();
            tokio::spawn(async move {
                for i in 0..200u64 {
                    let topic = format!("logs:docker:c{}", (n + i) % 5);
                    let subscription = hub.subscribe(&topic);
                    hub.publish(&topic, i);
                    let _ = subscription.try_recv();
                    drop(subscription);
                    tokio::task::yield_now().await;
                }
            })
        })
        .collect();
    for worker in workers {
        worker.await.unwrap();
    }

    assert!(hub.topics().is_empty());
}
