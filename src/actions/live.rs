// WebSocket endpoint for live race viewing.
//
// Clients authenticate with a bearer token in the query string, get the
// race_config handshake, then drive their viewport with viewport_update
// messages. All pushes come from the race hub; this handler only shuttles
// frames between the hub's channel and the socket.

use axum::{
    extract::{
        Path, Query, State,
        ws::{Message, WebSocket},
    },
    http::StatusCode,
    response::{IntoResponse, Response},
};
use axum::extract::ws::WebSocketUpgrade;
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::auth::authorize_for_race;
use crate::live_hub::{ClientMessage, ServerMessage};
use crate::races_repo::RacesRepository;
use crate::web::AppState;

use super::json_error;

/// WebSocket idle limit; protocol pings go out at a third of this.
const WS_IDLE_TIMEOUT: Duration = Duration::from_secs(90);
const WS_PING_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Deserialize)]
pub struct LiveWsParams {
    pub token: String,
    pub client_id: Option<String>,
}

/// GET /ws/live/{race_id}?token=…&client_id=…
pub async fn live_race_websocket(
    ws: WebSocketUpgrade,
    Path(race_id): Path<Uuid>,
    Query(params): Query<LiveWsParams>,
    State(state): State<AppState>,
) -> Response {
    let claims = match authorize_for_race(
        &params.token,
        &state.settings.jwt_secret,
        &race_id.to_string(),
    ) {
        Ok(claims) => claims,
        Err(e) => {
            debug!("Rejected live WS connection: {:#}", e);
            return json_error(StatusCode::UNAUTHORIZED, "Invalid token").into_response();
        }
    };

    let races_repo = RacesRepository::new(state.read_pool.clone());
    let race = match races_repo.get_by_id(race_id).await {
        Ok(Some(race)) => race,
        Ok(None) => {
            return json_error(StatusCode::NOT_FOUND, "Unknown race").into_response();
        }
        Err(e) => {
            warn!("Race lookup failed: {:#}", e);
            return json_error(StatusCode::INTERNAL_SERVER_ERROR, "Race lookup failed")
                .into_response();
        }
    };

    let pilot_id = claims.pilot_id;
    let client_id = params
        .client_id
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    ws.on_upgrade(move |socket| handle_live_socket(socket, state, race, pilot_id, client_id))
}

async fn handle_live_socket(
    socket: WebSocket,
    state: AppState,
    race: crate::races::Race,
    pilot_id: String,
    client_id: String,
) {
    metrics::gauge!("websocket_connections").increment(1.0);

    let hub = state.hub_registry.hub_for(race);
    let (handle, rx) = hub.register(&client_id, Some(pilot_id));

    // Handshake first, before any tick traffic.
    handle.send_reliable(hub.race_config_message()).await;

    let (mut sender, mut receiver) = socket.split();
    let shutdown = state.shutdown.clone();

    let write_task = tokio::spawn(async move {
        let mut ping = tokio::time::interval(WS_PING_INTERVAL);
        ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    let _ = sender
                        .send(Message::Close(Some(axum::extract::ws::CloseFrame {
                            code: axum::extract::ws::close_code::AWAY,
                            reason: "server shutting down".into(),
                        })))
                        .await;
                    break;
                }
                _ = ping.tick() => {
                    if sender.send(Message::Ping(Vec::new().into())).await.is_err() {
                        break;
                    }
                }
                msg = rx.recv_async() => {
                    let Ok(msg) = msg else { break };
                    let json = match serde_json::to_string(&msg) {
                        Ok(json) => json,
                        Err(e) => {
                            warn!("Failed to serialize server message: {}", e);
                            continue;
                        }
                    };
                    if sender.send(Message::Text(json.into())).await.is_err() {
                        break;
                    }
                    metrics::counter!("websocket_messages_sent").increment(1);
                }
            }
        }
    });

    let read_hub = hub.clone();
    let read_client_id = client_id.clone();
    let read_handle = handle.clone();
    let read_task = tokio::spawn(async move {
        loop {
            let msg = match tokio::time::timeout(WS_IDLE_TIMEOUT, receiver.next()).await {
                Ok(Some(Ok(msg))) => msg,
                Ok(Some(Err(e))) => {
                    // Abrupt resets are routine for browsers on mobile.
                    debug!("Live WS read error: {}", e);
                    break;
                }
                Ok(None) => break,
                Err(_) => {
                    info!(client_id = %read_client_id, "Closing idle live WS connection");
                    break;
                }
            };

            match msg {
                Message::Text(text) => match serde_json::from_str::<ClientMessage>(&text) {
                    Ok(ClientMessage::ViewportUpdate { tiles }) => {
                        read_hub.update_viewport(&read_client_id, &tiles);
                        read_hub.send_catchup(&read_client_id).await;
                    }
                    Ok(ClientMessage::RequestInitialData { zoom, bbox }) => {
                        read_hub.send_tiles(&read_client_id, zoom, bbox).await;
                    }
                    Ok(ClientMessage::Ping) => {
                        read_handle
                            .send_reliable(ServerMessage::Pong {
                                timestamp: Utc::now(),
                            })
                            .await;
                    }
                    Ok(ClientMessage::GetStats) => {
                        read_handle
                            .send_reliable(read_hub.stats_message(&read_client_id))
                            .await;
                    }
                    Err(e) => {
                        debug!("Unparseable client message [{}]: {}", text, e);
                    }
                },
                Message::Close(_) => break,
                // Pings are answered by the protocol layer; pongs just prove
                // liveness, which the timeout above already measures.
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = write_task => {}
        _ = read_task => {}
    }

    hub.unregister(&client_id);
    metrics::gauge!("websocket_connections").decrement(1.0);
}
