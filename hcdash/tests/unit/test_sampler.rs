//! Background worker tests: sampler, janitor and log pumps

use std::time::Duration;

use hcdash::errors::ServiceError;
use hcdash::events::{Event, EventHub};
use hcdash::hub::topics::{LogSource, Topics};
use hcdash::hub::{Delivery, HubOptions};
use hcdash::services::fake::{container, Fault};
use hcdash::services::FakeServices;
use hcdash::workers::{janitor, log_tail, sampler};
use tokio::sync::oneshot;

fn fakes() -> FakeServices {
    let fakes = FakeServices::new(&["prod"]);
    fakes.docker.insert(container("web", "nginx", "1.25"));
    fakes
}

#[tokio::test(start_paused = true)]
async fn test_sampler_publishes_every_interval_until_shutdown() {
    let fakes = fakes();
    let hub = EventHub::new(HubOptions::default());
    let stats = hub.subscribe(Topics::DOCKER_STATS);
    let metrics = hub.subscribe(&Topics::k8s_metrics("prod"));

    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let services = fakes.services();
    let worker_hub = hub.clone();
    let handle = tokio::spawn(async move {
        sampler::run(
            &sampler::Options::default(),
            &services,
            &worker_hub,
            tokio::time::sleep,
            Box::pin(async move {
                let _ = shutdown_rx.await;
            }),
        )
        .await;
    });

    tokio::time::sleep(Duration::from_millis(6_500)).await;
    shutdown_tx.send(()).unwrap();
    handle.await.unwrap();

    assert_eq!(stats.pending(), 3);
    assert_eq!(metrics.pending(), 3);
    match stats.try_recv() {
        Some(Delivery::Message(event)) => assert!(matches!(event.as_ref(), Event::DockerStats(_))),
        _ => panic!("expected a stats snapshot"),
    }
}

#[tokio::test(start_paused = true)]
async fn test_sampler_finishes_inflight_tick_within_grace() {
    let fakes = fakes();
    fakes
        .kubernetes
        .faults
        .set("cluster_metrics:prod", Fault::delay(Duration::from_millis(500)));
    let hub = EventHub::new(HubOptions::default());
    let metrics = hub.subscribe(&Topics::k8s_metrics("prod"));

    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let services = fakes.services();
    let worker_hub = hub.clone();
    let handle = tokio::spawn(async move {
        sampler::run(
            &sampler::Options::default(),
            &services,
            &worker_hub,
            tokio::time::sleep,
            Box::pin(async move {
                let _ = shutdown_rx.await;
            }),
        )
        .await;
    });

    // Shut down while the first tick waits on the slow cluster
    tokio::time::sleep(Duration::from_millis(2_100)).await;
    shutdown_tx.send(()).unwrap();
    handle.await.unwrap();

    assert_eq!(metrics.pending(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_sampler_survives_a_dead_source() {
    let fakes = fakes();
    fakes.docker.faults.set(
        "container_stats",
        Fault::fail(ServiceError::Connectivity("daemon down".to_string())),
    );
    let hub = EventHub::new(HubOptions::default());
    let stats = hub.subscribe(Topics::DOCKER_STATS);
    let metrics = hub.subscribe(&Topics::k8s_metrics("prod"));

    for _ in 0..3 {
        sampler::sample_once(&sampler::Options::default(), &fakes.services(), &hub).await;
    }
    assert_eq!(stats.pending(), 0);
    assert_eq!(metrics.pending(), 3);
    assert_eq!(fakes.docker.faults.count("container_stats"), 3);
}

#[tokio::test(start_paused = true)]
async fn test_janitor_reaps_silent_subscribers() {
    let hub = EventHub::new(HubOptions::default());
    let silent = hub.subscribe(Topics::DOCKER_STATS);

    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let worker_hub = hub.clone();
    let handle = tokio::spawn(async move {
        janitor::run(
            &janitor::Options {
                interval: Duration::from_secs(10),
                idle_timeout: Duration::from_secs(30),
            },
            &worker_hub,
            tokio::time::sleep,
            Box::pin(async move {
                let _ = shutdown_rx.await;
            }),
        )
        .await;
    });

    assert!(silent.recv().await.is_closed());
    assert_eq!(hub.subscriber_count(Topics::DOCKER_STATS), 0);

    shutdown_tx.send(()).unwrap();
    handle.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_log_pump_is_shared_and_stops_when_unobserved() {
    let fakes = fakes();
    let hub = EventHub::new(HubOptions::default());
    let source = LogSource::Pod {
        cluster: "prod".to_string(),
        namespace: "default".to_string(),
        pod: "app-0".to_string(),
    };
    let topic = Topics::logs(&source);
    let options = log_tail::Options::default();

    let subscription = hub.subscribe(&topic);
    let pump = log_tail::ensure_pump(&options, &fakes.services(), &hub, source.clone()).unwrap();
    // A second observer reuses the running pump
    assert!(log_tail::ensure_pump(&options, &fakes.services(), &hub, source).is_none());

    match subscription.recv().await {
        Delivery::Message(event) => match event.as_ref() {
            Event::Log(line) => assert_eq!(line.line, "app-0 started"),
            other => panic!("unexpected event {other:?}"),
        },
        Delivery::Closed => panic!("closed before the first line"),
    }

    // The fake pod log ends after one line, which closes the topic
    assert!(subscription.recv().await.is_closed());
    pump.await.unwrap();
}
