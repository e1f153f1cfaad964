//! Public HTTP and WebSocket API
//!
//! Routes:
//! - `GET  /` welcome
//! - `GET  /ws/spots` live status changes
//! - `GET  /api/v1/navigation/route?target_spot_id=&start_row=&start_col=`
//! - `POST /api/v1/navigation/assign?org_id=`
//! - `POST /api/v1/navigation/release?spot_id=`
//! - `GET  /api/v1/analytics/occupancy?org_id=`
//! - `GET  /api/v1/zones/:id`
//!
//! `org_id` is optional and defaults to the first organization in the layout.

use crate::domain::layout::{Layout, Organization};
use crate::domain::types::{GridPos, OrgId, Region, SpotId, SpotStatus, StatusChangeEvent, ZoneId};
use crate::infra::metrics::Metrics;
use crate::services::analytics::{occupancy_summary, OccupancySummary};
use crate::services::assignment::{assign_and_reserve, assign_spot, release_reservation};
use crate::services::event_bus::EventBus;
use crate::services::navigation::{plan_route, RouteError};
use crate::services::status_store::StatusStore;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

#[derive(Clone)]
pub struct AppState {
    pub layout: Arc<Layout>,
    pub store: Arc<StatusStore>,
    pub bus: EventBus,
    pub metrics: Arc<Metrics>,
    pub reserve_on_assign: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    Unprocessable(String),
    #[error("{0}")]
    Conflict(String),
}

impl From<RouteError> for ApiError {
    fn from(e: RouteError) -> Self {
        match e {
            RouteError::UnknownSpot(_) => ApiError::NotFound("Spot not found".to_string()),
            RouteError::UnknownZone(_) => ApiError::NotFound("Zone not found".to_string()),
            RouteError::InvalidGrid { .. } => ApiError::Unprocessable(e.to_string()),
            RouteError::StartOutOfBounds { .. } => ApiError::BadRequest(e.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Unprocessable(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
        };
        (status, Json(json!({ "detail": self.to_string() }))).into_response()
    }
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(welcome))
        .route("/ws/spots", get(websocket_handler))
        .route("/api/v1/navigation/route", get(route_handler))
        .route("/api/v1/navigation/assign", post(assign_handler))
        .route("/api/v1/navigation/release", post(release_handler))
        .route("/api/v1/analytics/occupancy", get(occupancy_handler))
        .route("/api/v1/zones/:id", get(zone_handler))
        .with_state(state)
}

/// Serve the API until shutdown is signalled
pub async fn serve(
    listener: TcpListener,
    state: AppState,
    mut shutdown: watch::Receiver<bool>,
) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!(addr = %addr, "api_server_started");
    }
    axum::serve(listener, create_router(state))
        .with_graceful_shutdown(async move {
            while shutdown.changed().await.is_ok() {
                if *shutdown.borrow() {
                    break;
                }
            }
            info!("api_server_shutdown");
        })
        .await
}

async fn welcome() -> Json<serde_json::Value> {
    Json(json!({ "message": "Welcome to the CloudPark API" }))
}

#[derive(Debug, Deserialize)]
pub struct OrgQuery {
    pub org_id: Option<i64>,
}

fn resolve_org(layout: &Layout, org_id: Option<i64>) -> Result<&Organization, ApiError> {
    let org = match org_id {
        Some(id) => layout.organization(OrgId(id)),
        None => layout.organizations().first(),
    };
    org.ok_or_else(|| ApiError::NotFound("Organization not found".to_string()))
}

#[derive(Debug, Deserialize)]
pub struct RouteQuery {
    pub target_spot_id: i64,
    pub start_row: i64,
    pub start_col: i64,
}

async fn route_handler(
    State(state): State<AppState>,
    Query(q): Query<RouteQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let route = plan_route(&state.layout, SpotId(q.target_spot_id), q.start_row, q.start_col)
        .inspect_err(|e| debug!(spot_id = %q.target_spot_id, error = %e, "route_rejected"))?;
    state.metrics.record_route(route.is_some());

    match route {
        Some(route) => {
            debug!(spot_id = %q.target_spot_id, steps = route.instructions.len(), "route_planned");
            Ok(Json(json!({ "path": route.path, "instructions": route.instructions })))
        }
        None => {
            info!(spot_id = %q.target_spot_id, row = q.start_row, col = q.start_col, "route_no_path");
            Ok(Json(json!({ "error": "no path" })))
        }
    }
}

async fn assign_handler(
    State(state): State<AppState>,
    Query(q): Query<OrgQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let org = resolve_org(&state.layout, q.org_id)?;
    let assignment = if state.reserve_on_assign {
        assign_and_reserve(&state.layout, org, &state.store, &state.bus)
    } else {
        assign_spot(&state.layout, org, &state.store)
    };
    state.metrics.record_assignment(assignment.is_some());

    let Some(a) = assignment else {
        info!(org_id = %org.id, "assignment_no_free_spot");
        return Err(ApiError::NotFound("No free spots available".to_string()));
    };
    Ok(Json(json!({
        "spot_id": a.spot_id,
        "spot_name": a.spot_name,
        "zone_name": a.zone_name,
        "message": "Spot assigned successfully",
    })))
}

#[derive(Debug, Deserialize)]
pub struct ReleaseQuery {
    pub spot_id: i64,
}

async fn release_handler(
    State(state): State<AppState>,
    Query(q): Query<ReleaseQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let spot = state
        .layout
        .spot(SpotId(q.spot_id))
        .ok_or_else(|| ApiError::NotFound("Spot not found".to_string()))?;
    if !release_reservation(&state.store, &state.bus, spot.id) {
        return Err(ApiError::Conflict("Spot is not reserved".to_string()));
    }
    Ok(Json(json!({ "spot_id": spot.id, "message": "Reservation released" })))
}

async fn occupancy_handler(
    State(state): State<AppState>,
    Query(q): Query<OrgQuery>,
) -> Result<Json<OccupancySummary>, ApiError> {
    let org = resolve_org(&state.layout, q.org_id)?;
    Ok(Json(occupancy_summary(&state.layout, org, &state.store)))
}

#[derive(Debug, Serialize)]
struct SpotView {
    id: SpotId,
    name: String,
    #[serde(flatten)]
    region: Region,
    anchor: GridPos,
    status: SpotStatus,
}

#[derive(Debug, Serialize)]
struct ZoneView<'a> {
    id: ZoneId,
    organization_id: OrgId,
    name: &'a str,
    grid: Option<&'a Vec<Vec<i64>>>,
    spots: Vec<SpotView>,
}

async fn zone_handler(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Response, ApiError> {
    let zone = state
        .layout
        .zone(ZoneId(id))
        .ok_or_else(|| ApiError::NotFound("Zone not found".to_string()))?;
    let spots = state
        .layout
        .zone_spots(zone)
        .map(|s| SpotView {
            id: s.id,
            name: s.name.clone(),
            region: s.region,
            anchor: s.anchor,
            status: state.store.status_or(s.id, s.status),
        })
        .collect();
    let view = ZoneView {
        id: zone.id,
        organization_id: zone.organization_id,
        name: &zone.name,
        grid: zone.grid.as_ref(),
        spots,
    };
    Ok(Json(view).into_response())
}

// ========================================
// WebSocket
// ========================================

/// Wire shape of a live update
#[derive(Debug, Serialize)]
struct LiveUpdate {
    spot_id: SpotId,
    status: SpotStatus,
}

fn live_message(event: &StatusChangeEvent) -> Option<String> {
    serde_json::to_string(&LiveUpdate { spot_id: event.spot_id, status: event.status }).ok()
}

/// Reply to a client text frame, if any
fn client_reply(text: &str) -> Option<String> {
    (text.trim() == "ping").then(|| json!({ "type": "pong" }).to_string())
}

async fn websocket_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_websocket(socket, state))
}

async fn handle_websocket(socket: WebSocket, state: AppState) {
    let (mut sender, mut receiver) = socket.split();
    let mut sub = state.bus.subscribe("websocket");
    let conn_id = sub.id();
    let (reply_tx, mut reply_rx) = mpsc::channel::<String>(8);

    info!(connection_id = %conn_id, "websocket_connected");

    // Single writer: bus events and pong replies share the sink
    let mut send_task = tokio::spawn(async move {
        loop {
            let text = tokio::select! {
                event = sub.recv() => match event {
                    Some(event) => match live_message(&event) {
                        Some(text) => text,
                        None => continue,
                    },
                    None => {
                        warn!(connection_id = %conn_id, "websocket_subscriber_dropped");
                        break;
                    }
                },
                reply = reply_rx.recv() => match reply {
                    Some(text) => text,
                    None => break,
                },
            };
            if sender.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
        let _ = sender.close().await;
    });

    let mut recv_task = tokio::spawn(async move {
        while let Some(result) = receiver.next().await {
            match result {
                Ok(Message::Text(text)) => {
                    if let Some(reply) = client_reply(&text) {
                        if reply_tx.send(reply).await.is_err() {
                            break;
                        }
                    }
                }
                Ok(Message::Close(_)) => break,
                Err(e) => {
                    debug!(connection_id = %conn_id, error = %e, "websocket_error");
                    break;
                }
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    info!(connection_id = %conn_id, "websocket_disconnected");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;

    const LAYOUT: &str = r#"
        [[organizations]]
        id = 1
        name = "Acme"

        [[zones]]
        id = 10
        organization_id = 1
        name = "Level 1"
        grid = [
            [0, 0, 0],
            [0, 1, 0],
            [0, 0, 2],
        ]

        [[zones]]
        id = 11
        organization_id = 1
        name = "Broken"
        grid = [[0, 0], [0]]

        [[spots]]
        id = 100
        zone_id = 10
        name = "A1"
        x1 = 2
        y1 = 2
        x2 = 50
        y2 = 40

        [[spots]]
        id = 110
        zone_id = 11
        name = "X1"
        x1 = 0
        y1 = 0
        x2 = 10
        y2 = 10
    "#;

    fn state(reserve_on_assign: bool) -> AppState {
        let metrics = Arc::new(Metrics::new());
        AppState {
            layout: Arc::new(Layout::from_toml_str(LAYOUT).unwrap()),
            store: Arc::new(StatusStore::new()),
            bus: EventBus::new(16, metrics.clone()),
            metrics,
            reserve_on_assign,
        }
    }

    async fn start(state: AppState) -> (SocketAddr, watch::Sender<bool>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = watch::channel(false);
        tokio::spawn(serve(listener, state, rx));
        (addr, tx)
    }

    #[test]
    fn test_client_reply() {
        assert_eq!(client_reply("ping").as_deref(), Some(r#"{"type":"pong"}"#));
        assert_eq!(client_reply("hello"), None);
    }

    #[test]
    fn test_live_message_shape() {
        let event = StatusChangeEvent::new(SpotId(4), SpotStatus::Occupied)
            .with_plate(Some("KA01AB1234".into()));
        let v: serde_json::Value = serde_json::from_str(&live_message(&event).unwrap()).unwrap();
        assert_eq!(v, json!({ "spot_id": 4, "status": "occupied" }));
    }

    #[test]
    fn test_route_error_status_codes() {
        let status = |e: RouteError| ApiError::from(e).into_response().status();
        assert_eq!(status(RouteError::UnknownSpot(SpotId(1))), StatusCode::NOT_FOUND);
        assert_eq!(
            status(RouteError::StartOutOfBounds { row: -1, col: 0, rows: 1, cols: 1 }),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status(RouteError::InvalidGrid {
                zone_id: ZoneId(1),
                source: crate::domain::grid::GridError::Missing
            }),
            StatusCode::UNPROCESSABLE_ENTITY
        );
    }

    #[tokio::test]
    async fn test_route_endpoint() {
        let (addr, _tx) = start(state(false)).await;
        let client = reqwest::Client::new();

        let body: serde_json::Value = client
            .get(format!(
                "http://{addr}/api/v1/navigation/route?target_spot_id=100&start_row=0&start_col=0"
            ))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        let path = body["path"].as_array().unwrap();
        assert_eq!(path.first().unwrap(), &json!([0, 0]));
        assert_eq!(path.last().unwrap(), &json!([2, 2]));
        assert_eq!(body["instructions"].as_array().unwrap().len(), path.len() - 1);

        let resp = client
            .get(format!(
                "http://{addr}/api/v1/navigation/route?target_spot_id=110&start_row=0&start_col=0"
            ))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::UNPROCESSABLE_ENTITY);

        let resp = client
            .get(format!(
                "http://{addr}/api/v1/navigation/route?target_spot_id=999&start_row=0&start_col=0"
            ))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_route_no_path() {
        let state = state(false);
        // Wall off the target cell (2, 2) from (0, 0)
        let layout = Layout::from_toml_str(&LAYOUT.replace(
            "[0, 1, 0],\n            [0, 0, 2],",
            "[0, 1, 1],\n            [0, 1, 2],",
        ))
        .unwrap();
        let state = AppState { layout: Arc::new(layout), ..state };
        let metrics = state.metrics.clone();
        let (addr, _tx) = start(state).await;

        let body: serde_json::Value = reqwest::get(format!(
            "http://{addr}/api/v1/navigation/route?target_spot_id=100&start_row=0&start_col=0"
        ))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
        assert_eq!(body, json!({ "error": "no path" }));
        assert_eq!(metrics.report().route_no_path_total, 1);
    }

    #[tokio::test]
    async fn test_assign_endpoint() {
        let state = state(false);
        let store = state.store.clone();
        let (addr, _tx) = start(state).await;
        let client = reqwest::Client::new();
        let url = format!("http://{addr}/api/v1/navigation/assign?org_id=1");

        let body: serde_json::Value = client.post(&url).send().await.unwrap().json().await.unwrap();
        assert_eq!(body["spot_id"], 100);
        assert_eq!(body["spot_name"], "A1");
        assert_eq!(body["zone_name"], "Level 1");
        assert_eq!(body["message"], "Spot assigned successfully");

        store.set(SpotId(100), SpotStatus::Occupied);
        store.set(SpotId(110), SpotStatus::Occupied);
        let resp = client.post(&url).send().await.unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::NOT_FOUND);
        let body: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(body["detail"], "No free spots available");

        let resp = client
            .post(format!("http://{addr}/api/v1/navigation/assign?org_id=42"))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_assign_with_reservation() {
        let state = state(true);
        let store = state.store.clone();
        let (addr, _tx) = start(state).await;
        let client = reqwest::Client::new();
        let url = format!("http://{addr}/api/v1/navigation/assign");

        let first: serde_json::Value = client.post(&url).send().await.unwrap().json().await.unwrap();
        let second: serde_json::Value =
            client.post(&url).send().await.unwrap().json().await.unwrap();
        assert_eq!(first["spot_id"], 100);
        assert_eq!(second["spot_id"], 110);
        assert_eq!(store.get(SpotId(100)), Some(SpotStatus::Reserved));

        let release = |id: i64| {
            client.post(format!("http://{addr}/api/v1/navigation/release?spot_id={id}")).send()
        };
        assert_eq!(release(100).await.unwrap().status(), reqwest::StatusCode::OK);
        assert_eq!(store.get(SpotId(100)), Some(SpotStatus::Free));
        assert_eq!(release(100).await.unwrap().status(), reqwest::StatusCode::CONFLICT);
        assert_eq!(release(999).await.unwrap().status(), reqwest::StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_occupancy_and_zone_endpoints() {
        let state = state(false);
        state.store.set(SpotId(100), SpotStatus::Occupied);
        let (addr, _tx) = start(state).await;

        let body: serde_json::Value =
            reqwest::get(format!("http://{addr}/api/v1/analytics/occupancy"))
                .await
                .unwrap()
                .json()
                .await
                .unwrap();
        assert_eq!(body["total_spots"], 2);
        assert_eq!(body["occupied_spots"], 1);
        assert_eq!(body["free_spots"], 1);
        assert_eq!(body["occupancy_rate"], 50.0);

        let zone: serde_json::Value = reqwest::get(format!("http://{addr}/api/v1/zones/10"))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(zone["name"], "Level 1");
        assert_eq!(zone["spots"][0]["status"], "occupied");
        assert_eq!(zone["spots"][0]["anchor"], json!([2, 2]));

        let resp = reqwest::get(format!("http://{addr}/api/v1/zones/99")).await.unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::NOT_FOUND);
    }

    async fn wait_for_subscribers(bus: &EventBus, expected: usize) {
        for _ in 0..200 {
            if bus.subscriber_count() == expected {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        panic!("subscriber count stuck at {}, wanted {expected}", bus.subscriber_count());
    }

    async fn next_text<S, E>(ws: &mut S) -> String
    where
        S: futures::Stream<Item = Result<tokio_tungstenite::tungstenite::Message, E>> + Unpin,
        E: std::fmt::Debug,
    {
        use tokio_tungstenite::tungstenite::Message as WsMessage;
        let deadline = std::time::Duration::from_secs(5);
        loop {
            let msg = tokio::time::timeout(deadline, ws.next()).await.unwrap().unwrap().unwrap();
            if let WsMessage::Text(text) = msg {
                return text;
            }
        }
    }

    #[tokio::test]
    async fn test_websocket_live_feed() {
        use tokio_tungstenite::tungstenite::Message as WsMessage;

        let state = state(false);
        let bus = state.bus.clone();
        let (addr, _tx) = start(state).await;
        let url = format!("ws://{addr}/ws/spots");

        let (mut a, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
        let (mut b, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
        wait_for_subscribers(&bus, 2).await;

        // One listener leaving must not affect the other
        b.close(None).await.unwrap();
        wait_for_subscribers(&bus, 1).await;

        bus.publish(
            StatusChangeEvent::new(SpotId(100), SpotStatus::Occupied)
                .with_plate(Some("KA01AB1234".into())),
        );
        assert_eq!(next_text(&mut a).await, r#"{"spot_id":100,"status":"occupied"}"#);

        a.send(WsMessage::Text("ping".into())).await.unwrap();
        assert_eq!(next_text(&mut a).await, r#"{"type":"pong"}"#);

        a.close(None).await.unwrap();
        wait_for_subscribers(&bus, 0).await;
    }
}
