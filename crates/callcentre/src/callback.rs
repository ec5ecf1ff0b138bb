//! Phone-home callback listener
//!
//! Instances `POST /phone` with `{"machine_id": N}` once they boot. The
//! listener decodes the index and forwards it to the control loop; it does
//! not know which indices are valid.

use axum::body::Bytes;
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Extension, Router};
use serde::Deserialize;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Capacity of the callback channel
pub const CALLBACK_CHANNEL_CAPACITY: usize = 1024;

/// How long shutdown waits for in-flight requests
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Body sent by an instance when it phones home
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct PhoneHome {
    pub machine_id: usize,
}

/// Build the callback router
pub fn build_router(tx: mpsc::Sender<usize>) -> Router {
    Router::new()
        .route("/phone", post(phone_handler))
        .layer(Extension(tx))
}

/// Malformed bodies are logged and dropped; the caller always gets a 200.
async fn phone_handler(Extension(tx): Extension<mpsc::Sender<usize>>, body: Bytes) -> StatusCode {
    match serde_json::from_slice::<PhoneHome>(&body) {
        Ok(msg) => {
            debug!(index = msg.machine_id, "Received callback");
            if tx.send(msg.machine_id).await.is_err() {
                warn!(index = msg.machine_id, "Callback arrived after the run ended; dropped");
            }
        }
        Err(e) => {
            warn!(
                error = %e,
                body = %String::from_utf8_lossy(&body),
                "Received bad callback data"
            );
        }
    }
    StatusCode::OK
}

/// A running callback listener
pub struct CallbackListener {
    local_addr: SocketAddr,
    shutdown: CancellationToken,
    handle: JoinHandle<()>,
}

impl CallbackListener {
    /// Bind `addr` and start serving callbacks into `tx`
    pub async fn bind(addr: SocketAddr, tx: mpsc::Sender<usize>) -> std::io::Result<Self> {
        let listener = tokio::net::TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let shutdown = CancellationToken::new();

        let app = build_router(tx);
        let token = shutdown.clone();
        let handle = tokio::spawn(async move {
            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async move { token.cancelled().await })
                .await;
            if let Err(e) = result {
                error!(error = %e, "Callback listener failed");
            }
        });

        info!(addr = %local_addr, "Callback listener started");
        Ok(Self {
            local_addr,
            shutdown,
            handle,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting callbacks and wait briefly for in-flight requests
    pub async fn shutdown(mut self) {
        self.shutdown.cancel();
        if tokio::time::timeout(SHUTDOWN_GRACE, &mut self.handle)
            .await
            .is_err()
        {
            warn!("Callback listener did not stop in time; aborting");
            self.handle.abort();
        }
        debug!("Callback listener stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::util::ServiceExt;

    fn post_phone(body: &'static str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/phone")
            .header("content-type", "application/json")
            .body(Body::from(body))
            .unwrap()
    }

    #[tokio::test]
    async fn test_valid_callback_is_forwarded() {
        let (tx, mut rx) = mpsc::channel(4);
        let app = build_router(tx);

        let response = app.oneshot(post_phone(r#"{"machine_id": 7}"#)).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(rx.try_recv().unwrap(), 7);
    }

    #[tokio::test]
    async fn test_extra_fields_are_tolerated() {
        let (tx, mut rx) = mpsc::channel(4);
        let app = build_router(tx);

        let response = app
            .oneshot(post_phone(r#"{"machine_id": 2, "hostname": "callhome-2"}"#))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(rx.try_recv().unwrap(), 2);
    }

    #[tokio::test]
    async fn test_malformed_bodies_are_dropped() {
        let (tx, mut rx) = mpsc::channel(4);

        for body in [r#"{"bad":1}"#, r#"{"machine_id": -1}"#, "not json", ""] {
            let response = build_router(tx.clone())
                .oneshot(post_phone(body))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }

        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_wrong_method_and_route() {
        let (tx, _rx) = mpsc::channel(4);

        let response = build_router(tx.clone())
            .oneshot(Request::builder().uri("/phone").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);

        let response = build_router(tx)
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/elsewhere")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_closed_receiver_still_answers_ok() {
        let (tx, rx) = mpsc::channel(4);
        drop(rx);

        let response = build_router(tx)
            .oneshot(post_phone(r#"{"machine_id": 1}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_listener_serves_over_tcp_and_shuts_down() {
        let (tx, mut rx) = mpsc::channel(4);
        let listener = CallbackListener::bind("127.0.0.1:0".parse().unwrap(), tx)
            .await
            .unwrap();
        let url = format!("http://{}/phone", listener.local_addr());

        let response = reqwest::Client::new()
            .post(&url)
            .json(&serde_json::json!({"machine_id": 4}))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::OK);
        assert_eq!(rx.recv().await, Some(4));

        listener.shutdown().await;
        assert!(reqwest::Client::new().post(&url).send().await.is_err());
    }
}
