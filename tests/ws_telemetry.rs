use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use futures::StreamExt;
use scr_ldx::schema::FormRegistry;
use scr_ldx::server::{self, AppState};
use scr_ldx::storage;
use scr_ldx::telemetry::{Telemetry, TelemetryFrame};
use scr_ldx::watcher::LdxWatcher;
use scr_ldx::Config;
use tempfile::TempDir;
use tokio::sync::oneshot;
use tokio::time::{sleep, timeout};
use tokio_tungstenite::tungstenite::Message;

fn reserve_port() -> std::io::Result<u16> {
    let listener = std::net::TcpListener::bind(("127.0.0.1", 0))?;
    let port = listener.local_addr()?.port();
    drop(listener);
    Ok(port)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn telemetry_frames_stream_over_websocket() -> Result<()> {
    let dir = TempDir::new()?;
    let config = Config {
        data_dir: dir.path().to_path_buf(),
        forms_dir: dir.path().join("forms"),
        ..Config::default()
    };
    let db = storage::open(&config.database_path())?;
    let forms = Arc::new(FormRegistry::default());
    let watcher = Arc::new(LdxWatcher::new(
        db.clone(),
        forms.clone(),
        None,
        "ldx",
        Duration::from_secs(5),
    ));
    let state = AppState::new(db, forms, watcher, Telemetry::simulated(), Arc::new(config));

    let port = reserve_port()?;
    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let server = tokio::spawn(server::serve(state, port, async {
        let _ = stop_rx.await;
    }));
    sleep(Duration::from_millis(200)).await;

    let url = format!("ws://127.0.0.1:{port}/ws/telemetry");
    let (mut ws, _) = tokio_tungstenite::connect_async(url).await?;

    let mut frames = Vec::new();
    timeout(Duration::from_secs(3), async {
        while frames.len() < 2 {
            match ws.next().await {
                Some(Ok(Message::Text(text))) => {
                    frames.push(serde_json::from_str::<TelemetryFrame>(text.as_str())?);
                }
                Some(Ok(_)) => {}
                Some(Err(err)) => return Err(anyhow!(err)),
                None => return Err(anyhow!("socket closed early")),
            }
        }
        Ok(())
    })
    .await??;

    for frame in &frames {
        assert_eq!(frame.source, "simulated");
        assert_eq!(frame.channels.len(), 15);
        assert!(frame.channels.contains_key("speed"));
    }
    assert!(frames[1].timestamp >= frames[0].timestamp);

    ws.close(None).await?;
    let _ = stop_tx.send(());
    timeout(Duration::from_secs(3), server).await???;
    Ok(())
}
