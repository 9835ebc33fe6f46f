use std::time::{Duration, Instant};

use axum::{
    extract::ws::{Message, WebSocket, WebSocketUpgrade},
    extract::State,
    response::IntoResponse,
};
use chrono::Utc;
use futures::{SinkExt, StreamExt};

use super::AppState;
use crate::telemetry::{Telemetry, FRAME_INTERVAL_MS};

pub async fn telemetry_ws(State(state): State<AppState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| stream_frames(state.telemetry, socket))
}

async fn stream_frames(telemetry: Telemetry, socket: WebSocket) {
    let (mut sender, mut receiver) = socket.split();
    let started = Instant::now();
    let mut ticker = tokio::time::interval(Duration::from_millis(FRAME_INTERVAL_MS));

    tracing::debug!("telemetry client connected");
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let unix_ts = Utc::now().timestamp_micros() as f64 / 1_000_000.0;
                let frame = telemetry.frame(started.elapsed().as_secs_f64(), unix_ts);
                let text = match serde_json::to_string(&frame) {
                    Ok(text) => text,
                    Err(err) => {
                        tracing::warn!(error = %err, "failed to encode telemetry frame");
                        continue;
                    }
                };
                if sender.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
            incoming = receiver.next() => match incoming {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }
    tracing::debug!("telemetry client disconnected");
}
