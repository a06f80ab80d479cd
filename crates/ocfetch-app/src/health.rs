//! Health check server.
//!
//! A small axum app with `/health`, `/status`, and `/heartbeat`, all
//! returning 200 with a JSON body. Deployed next to scheduled fetch jobs
//! so the platform can probe liveness between runs.

use axum::routing::get;
use axum::{Json, Router};
use serde_json::{json, Value};
use tower_http::trace::TraceLayer;
use tracing::info;

fn now() -> String {
    chrono::Utc::now().to_rfc3339()
}

async fn health() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "service": "ocfetch",
        "timestamp": now(),
    }))
}

async fn status() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "service": "ocfetch",
        "version": env!("CARGO_PKG_VERSION"),
        "timestamp": now(),
    }))
}

async fn heartbeat() -> Json<Value> {
    Json(json!({
        "status": "alive",
        "timestamp": now(),
    }))
}

/// Build the health router.
#[must_use]
pub fn router() -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/status", get(status))
        .route("/heartbeat", get(heartbeat))
        .layer(TraceLayer::new_for_http())
}

/// Bind and serve until the process is stopped.
///
/// # Errors
///
/// Returns an error when the address cannot be bound.
pub async fn serve(host: &str, port: u16) -> anyhow::Result<()> {
    let addr = format!("{host}:{port}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(addr = %addr, endpoints = ?["/health", "/status", "/heartbeat"], "health server listening");
    axum::serve(listener, router()).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn endpoints_answer_200_with_json() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            axum::serve(listener, router()).await.ok();
        });

        for (path, expected_status) in [
            ("/health", "healthy"),
            ("/status", "ok"),
            ("/heartbeat", "alive"),
        ] {
            let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
            tokio::io::AsyncWriteExt::write_all(
                &mut stream,
                format!("GET {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
                    .as_bytes(),
            )
            .await
            .unwrap();
            let mut response = Vec::new();
            tokio::io::AsyncReadExt::read_to_end(&mut stream, &mut response)
                .await
                .unwrap();
            let response = String::from_utf8_lossy(&response);
            assert!(response.starts_with("HTTP/1.1 200"), "{path}: {response}");
            assert!(response.contains(expected_status), "{path}: {response}");
        }

        server.abort();
    }
}
