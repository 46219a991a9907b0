//! HTTP route tests against the in-memory collaborators

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use axum::Router;
use hcdash::app::options::AppOptions;
use hcdash::app::state::AppState;
use hcdash::deploy::admission::AdmissionOptions;
use hcdash::deploy::orchestrator::OrchestratorOptions;
use hcdash::errors::ServiceError;
use hcdash::server::serve::router;
use hcdash::server::state::ServerState;
use hcdash::services::fake::{container, Fault};
use hcdash::services::FakeServices;
use serde_json::{json, Value};
use tokio::sync::watch;
use tower::ServiceExt;

struct TestApp {
    fakes: FakeServices,
    router: Router,
    app: Arc<AppState>,
    shutdown: watch::Sender<bool>,
}

fn test_app(options: AppOptions) -> TestApp {
    let fakes = FakeServices::new(&["prod"]);
    fakes.docker.insert(container("web", "nginx", "1.25"));
    fakes.docker.insert(container("api", "node", "20"));

    let app = Arc::new(AppState::with_services(
        "0.0.0-test".to_string(),
        fakes.services(),
        None,
        &options,
    ));
    let (shutdown, shutdown_rx) = watch::channel(false);
    let state = ServerState::new(
        app.clone(),
        options.server.clone(),
        options.log_tail.clone(),
        shutdown_rx,
    );
    TestApp {
        fakes,
        router: router(Arc::new(state)),
        app,
        shutdown,
    }
}

async fn send(router: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let request = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(body) => request
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => request.body(Body::empty()).unwrap(),
    };

    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let json = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, json)
}

fn deploy_body(container: &str) -> Value {
    json!({ "container_id": container, "cluster": "prod" })
}

#[tokio::test]
async fn test_health_ready_version() {
    let t = test_app(AppOptions::default());

    let (status, body) = send(&t.router, Method::GET, "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["version"], "0.0.0-test");

    let (status, body) = send(&t.router, Method::GET, "/ready", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["ready"], true);
    assert_eq!(body["max_deployments"], 5);
    assert_eq!(body["clusters"], 1);

    let (status, body) = send(&t.router, Method::GET, "/version", None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["version"].is_string());

    t.shutdown.send(true).unwrap();
    let (status, body) = send(&t.router, Method::GET, "/ready", None).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["ready"], false);
}

#[tokio::test]
async fn test_docker_routes() {
    let t = test_app(AppOptions::default());

    let (status, body) = send(&t.router, Method::GET, "/api/docker/containers", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["total"], 2);
    assert_eq!(body["items"][0]["name"], "api");

    let (status, body) = send(&t.router, Method::GET, "/api/docker/containers/web", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["image"], "nginx");

    let (status, body) = send(&t.router, Method::POST, "/api/docker/containers/web/restart", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);

    let (status, _) = send(
        &t.router,
        Method::DELETE,
        "/api/docker/containers/api?force=true",
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = send(&t.router, Method::GET, "/api/docker/containers/api", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["code"], "NOT_FOUND");
}

#[tokio::test]
async fn test_collaborator_failure_keeps_its_kind() {
    let t = test_app(AppOptions::default());
    t.fakes.docker.faults.set(
        "list_containers",
        Fault::fail(ServiceError::Connectivity("Cannot connect to the Docker daemon".to_string())),
    );

    let (status, body) = send(&t.router, Method::GET, "/api/docker/containers", None).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["error"]["code"], "UPSTREAM_UNAVAILABLE");
    assert_eq!(body["error"]["details"]["kind"], "connectivity");
}

#[tokio::test]
async fn test_kubernetes_routes() {
    let t = test_app(AppOptions::default());

    let (status, body) = send(&t.router, Method::GET, "/api/k8s/clusters", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["items"][0]["name"], "prod");

    let (status, body) = send(&t.router, Method::GET, "/api/k8s/prod/pods?namespace=web", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["items"][0]["namespace"], "web");

    let (status, body) = send(&t.router, Method::GET, "/api/k8s/staging/pods", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["code"], "NOT_FOUND");

    let (status, _) = send(
        &t.router,
        Method::POST,
        "/api/k8s/prod/default/deployments/web/scale",
        Some(json!({ "replicas": 3 })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(t.fakes.kubernetes.faults.count("scale_deployment"), 1);

    let (status, _) = send(
        &t.router,
        Method::POST,
        "/api/k8s/prod/default/pods/app-0/restart",
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_deploy_submit_and_duplicate() {
    let t = test_app(AppOptions::default());
    // Keep the first job busy in analyzing
    t.fakes
        .docker
        .faults
        .set("get_container", Fault::delay(Duration::from_secs(60)));

    let (status, body) = send(
        &t.router,
        Method::POST,
        "/api/deploy/docker-to-k8s",
        Some(deploy_body("web")),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["status"], "submitted");
    let deploy_id = body["deploy_id"].as_str().unwrap().to_string();
    assert_eq!(body["stream"], format!("/ws/deploy/{}/status", deploy_id));

    let (status, body) = send(
        &t.router,
        Method::POST,
        "/api/deploy/docker-to-k8s",
        Some(deploy_body("web")),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"]["code"], "DUPLICATE_TARGET");
    assert_eq!(body["error"]["details"]["existing_deploy_id"], deploy_id);

    let (status, body) = send(
        &t.router,
        Method::GET,
        &format!("/api/deploy/{}/status", deploy_id),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["target"]["namespace"], "default");
    assert_eq!(body["steps"].as_array().unwrap().len(), 3);

    let (status, body) = send(&t.router, Method::GET, "/api/deploy/active", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["total"], 1);

    let (status, body) = send(
        &t.router,
        Method::POST,
        &format!("/api/deploy/{}/cancel", deploy_id),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["cancelled"], true);
}

#[tokio::test]
async fn test_deploy_capacity_exceeded() {
    let options = AppOptions {
        orchestrator: OrchestratorOptions {
            admission: AdmissionOptions { max_active: 1 },
            ..Default::default()
        },
        ..Default::default()
    };
    let t = test_app(options);
    t.fakes
        .docker
        .faults
        .set("get_container", Fault::delay(Duration::from_secs(60)));

    let (status, _) = send(
        &t.router,
        Method::POST,
        "/api/deploy/docker-to-k8s",
        Some(deploy_body("web")),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);

    let (status, body) = send(
        &t.router,
        Method::POST,
        "/api/deploy/docker-to-k8s",
        Some(deploy_body("api")),
    )
    .await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(body["error"]["code"], "CAPACITY_EXCEEDED");
    assert_eq!(body["error"]["details"]["limit"], 1);
}

#[tokio::test]
async fn test_deploy_validation_and_unknown_ids() {
    let t = test_app(AppOptions::default());

    let (status, body) = send(
        &t.router,
        Method::POST,
        "/api/deploy/docker-to-k8s",
        Some(json!({ "container_id": " ", "cluster": "prod" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "BAD_REQUEST");

    let (status, body) = send(&t.router, Method::GET, "/api/deploy/nope/status", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["code"], "NOT_FOUND");

    let (status, _) = send(&t.router, Method::POST, "/api/deploy/nope/cancel", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_finished_deploy_shows_in_history() {
    let t = test_app(AppOptions::default());

    let (status, body) = send(
        &t.router,
        Method::POST,
        "/api/deploy/docker-to-k8s",
        Some(deploy_body("web")),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let deploy_id = body["deploy_id"].as_str().unwrap().to_string();

    while t.app.orchestrator.active_count() > 0 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let (status, body) = send(&t.router, Method::GET, "/api/deploy/history?limit=10", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["total"], 1);
    assert_eq!(body["items"][0]["id"], deploy_id);
    assert_eq!(body["items"][0]["result"], "success");

    // Cancelling a finished job is not an error, it just does nothing
    let (status, body) = send(
        &t.router,
        Method::POST,
        &format!("/api/deploy/{}/cancel", deploy_id),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["cancelled"], false);
}

#[tokio::test]
async fn test_config_routes_hide_secrets() {
    let t = test_app(AppOptions::default());

    let (status, body) = send(&t.router, Method::GET, "/api/config/ai", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["provider"], "template");
    assert_eq!(body["api_key_configured"], false);
    assert!(body.get("api_key").is_none());

    let (status, body) = send(&t.router, Method::GET, "/api/config/clusters", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["total"], 1);
}

#[tokio::test]
async fn test_ws_routes_reject_unknown_targets() {
    let t = test_app(AppOptions::default());

    // Plain GETs without an upgrade are refused before any subscription
    let (status, _) = send(&t.router, Method::GET, "/ws/deploy/nope/status", None).await;
    assert!(status.is_client_error());
    let (status, _) = send(&t.router, Method::GET, "/ws/k8s/staging/metrics", None).await;
    assert!(status.is_client_error());
    assert!(t.app.hub.topics().is_empty());
}

#[tokio::test]
async fn test_ws_stream_cap() {
    let mut options = AppOptions::default();
    options.server.max_connections = 1;
    let t = test_app(options);

    // A refused upgrade hands its slot back
    for _ in 0..2 {
        let (status, _) = send(&t.router, Method::GET, "/ws/docker/stats", None).await;
        assert!(status.is_client_error());
    }

    let mut options = AppOptions::default();
    options.server.max_connections = 0;
    let t = test_app(options);

    let (status, body) = send(&t.router, Method::GET, "/ws/docker/stats", None).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["error"]["code"], "TOO_MANY_STREAMS");
    assert_eq!(body["error"]["details"]["limit"], 0);

    let (status, _) = send(&t.router, Method::GET, "/ws/deploy/nope/status", None).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert!(t.app.hub.topics().is_empty());
}
