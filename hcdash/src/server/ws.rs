//! Live update streams over WebSocket
//!
//! Every endpoint subscribes to its hub topic before the upgrade completes,
//! then forwards deliveries as JSON text frames. A frame carries the event
//! plus the subscriber's drop counter; the terminal sentinel becomes a final
//! `closed` frame. The server pings on the configured interval and any
//! inbound frame (pongs included) counts as liveness. Each open stream holds
//! a [`StreamPermit`]; once they run out new streams get 503.

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        FromRequestParts, Path, State,
    },
    http::request::Parts,
    response::{IntoResponse, Response},
};
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::sync::{watch, OwnedSemaphorePermit};
use tracing::{debug, warn};

use crate::deploy::job::{JobId, JobSnapshot};
use crate::deploy::orchestrator::Watch;
use crate::events::{ClosedFrame, Event, StreamFrame};
use crate::hub::queue::Delivery;
use crate::hub::topics::{LogSource, Topics};
use crate::hub::Subscription;
use crate::server::error::{ApiError, ApiResult};
use crate::server::handlers::require_cluster;
use crate::server::state::ServerState;
use crate::workers::log_tail;

/// First frame of a deploy stream
#[derive(Debug, Serialize)]
struct SnapshotFrame<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    dropped: u64,
    #[serde(flatten)]
    snapshot: &'a JobSnapshot,
}

impl<'a> SnapshotFrame<'a> {
    fn new(snapshot: &'a JobSnapshot) -> Self {
        Self {
            kind: "snapshot",
            dropped: 0,
            snapshot,
        }
    }
}

/// One slot of the live stream cap, held until the stream ends.
/// Extracted before the upgrade so a full server answers 503 up front.
pub struct StreamPermit {
    _permit: OwnedSemaphorePermit,
}

impl FromRequestParts<Arc<ServerState>> for StreamPermit {
    type Rejection = ApiError;

    async fn from_request_parts(
        _parts: &mut Parts,
        state: &Arc<ServerState>,
    ) -> Result<Self, Self::Rejection> {
        state
            .streams
            .clone()
            .try_acquire_owned()
            .map(|permit| StreamPermit { _permit: permit })
            .map_err(|_| {
                warn!(
                    "Rejecting live stream, {} already open",
                    state.options.max_connections
                );
                ApiError::TooManyStreams {
                    limit: state.options.max_connections,
                }
            })
    }
}

pub async fn docker_stats_ws(
    permit: StreamPermit,
    ws: WebSocketUpgrade,
    State(state): State<Arc<ServerState>>,
) -> impl IntoResponse {
    let subscription = state.app.hub.subscribe(Topics::DOCKER_STATS);
    ws.on_upgrade(move |socket| forward(socket, state, subscription, None, permit))
}

pub async fn k8s_metrics_ws(
    permit: StreamPermit,
    ws: WebSocketUpgrade,
    State(state): State<Arc<ServerState>>,
    Path(cluster): Path<String>,
) -> ApiResult<Response> {
    require_cluster(&state, &cluster)?;
    let subscription = state.app.hub.subscribe(&Topics::k8s_metrics(&cluster));
    Ok(ws
        .on_upgrade(move |socket| forward(socket, state, subscription, None, permit))
        .into_response())
}

pub async fn container_logs_ws(
    permit: StreamPermit,
    ws: WebSocketUpgrade,
    State(state): State<Arc<ServerState>>,
    Path(container): Path<String>,
) -> impl IntoResponse {
    let source = LogSource::Container { container };
    let subscription = subscribe_logs(&state, source);
    ws.on_upgrade(move |socket| forward(socket, state, subscription, None, permit))
}

pub async fn pod_logs_ws(
    permit: StreamPermit,
    ws: WebSocketUpgrade,
    State(state): State<Arc<ServerState>>,
    Path((cluster, namespace, pod)): Path<(String, String, String)>,
) -> ApiResult<Response> {
    require_cluster(&state, &cluster)?;
    let source = LogSource::Pod {
        cluster,
        namespace,
        pod,
    };
    let subscription = subscribe_logs(&state, source);
    Ok(ws
        .on_upgrade(move |socket| forward(socket, state, subscription, None, permit))
        .into_response())
}

/// Snapshot first, then every event newer than it
pub async fn deploy_status_ws(
    permit: StreamPermit,
    ws: WebSocketUpgrade,
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
) -> ApiResult<Response> {
    let id = JobId::from(id);
    let watch = state
        .app
        .orchestrator
        .watch(&id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("deployment {}", id)))?;

    let response = match watch {
        Watch::Live {
            snapshot,
            subscription,
        } => ws.on_upgrade(move |mut socket| async move {
            if send_json(&mut socket, &SnapshotFrame::new(&snapshot)).await {
                forward(socket, state, subscription, Some(snapshot.revision), permit).await;
            }
        }),
        Watch::Finished(snapshot) => ws.on_upgrade(move |mut socket| async move {
            let topic = Topics::deploy(snapshot.deploy_id.as_str());
            if send_json(&mut socket, &SnapshotFrame::new(&snapshot)).await {
                send_json(&mut socket, &ClosedFrame::new(&topic, 0)).await;
            }
            let _ = socket.close().await;
            drop(permit);
        }),
    };
    Ok(response)
}

/// Subscribe first so the pump never sees an empty topic and quits
fn subscribe_logs(state: &ServerState, source: LogSource) -> Subscription<Event> {
    let subscription = state.app.hub.subscribe(&Topics::logs(&source));
    if log_tail::ensure_pump(
        &state.log_tail,
        &state.app.services,
        &state.app.hub,
        source,
    )
    .is_some()
    {
        debug!("Started log pump for {}", subscription.topic());
    }
    subscription
}

async fn send_json<T: Serialize>(socket: &mut WebSocket, frame: &T) -> bool {
    let text = match serde_json::to_string(frame) {
        Ok(text) => text,
        Err(e) => {
            warn!("Failed to serialize stream frame: {}", e);
            return true;
        }
    };
    socket.send(Message::Text(text.into())).await.is_ok()
}

/// Resolves once the server starts draining
async fn draining(mut shutdown: watch::Receiver<bool>) {
    if shutdown.wait_for(|s| *s).await.is_err() {
        std::future::pending::<()>().await;
    }
}

async fn forward(
    socket: WebSocket,
    state: Arc<ServerState>,
    subscription: Subscription<Event>,
    after_revision: Option<u64>,
    _permit: StreamPermit,
) {
    let topic = subscription.topic().to_string();
    debug!("Stream opened on {}", topic);

    let (mut sink, mut inbound) = socket.split();
    let mut ping = tokio::time::interval(state.options.ping_interval);
    ping.tick().await;
    let shutdown = draining(state.shutdown.clone());
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            delivery = subscription.recv() => {
                let event = match delivery {
                    Delivery::Message(event) => event,
                    Delivery::Closed => {
                        let frame = ClosedFrame::new(&topic, subscription.dropped());
                        if let Ok(text) = serde_json::to_string(&frame) {
                            let _ = sink.send(Message::Text(text.into())).await;
                        }
                        break;
                    }
                };
                if let (Some(after), Event::DeployStatus(status)) = (after_revision, event.as_ref()) {
                    if status.revision <= after {
                        continue;
                    }
                }
                let frame = StreamFrame {
                    dropped: subscription.dropped(),
                    event: event.as_ref(),
                };
                let text = match serde_json::to_string(&frame) {
                    Ok(text) => text,
                    Err(e) => {
                        warn!("Failed to serialize event on {}: {}", topic, e);
                        continue;
                    }
                };
                if sink.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
            message = inbound.next() => {
                match message {
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => subscription.touch(),
                }
            }
            _ = ping.tick() => {
                if sink.send(Message::Ping(Default::default())).await.is_err() {
                    break;
                }
            }
            _ = &mut shutdown => {
                debug!("Server draining, closing stream on {}", topic);
                break;
            }
        }
    }

    let _ = sink.close().await;
    subscription.unsubscribe();
    debug!("Stream closed on {}", topic);
}
