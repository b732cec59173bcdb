use axum::{
    Json, Router,
    extract::{State, rejection::JsonRejection},
    routing::{get, post},
};
use tokio::sync::watch;

use crate::{
    backend::{
        BackendStatus,
        client::{BackendClient, ChatReply, ChatRequest},
        history::{ChatHistory, HistorySnapshot},
    },
    error::{ApiError, ApiResult},
};

#[derive(Clone)]
pub struct BackendState {
    status: watch::Receiver<BackendStatus>,
    client: BackendClient,
    history: ChatHistory,
}

pub fn routes(
    status: watch::Receiver<BackendStatus>,
    client: BackendClient,
    history: ChatHistory,
) -> Router {
    Router::new()
        .route("/api/backend/status", get(status_snapshot))
        .route("/api/backend/ready", get(wait_ready))
        .route("/api/chat", post(chat))
        .route("/api/chat/history", get(chat_history))
        .with_state(BackendState {
            status,
            client,
            history,
        })
}

async fn status_snapshot(State(state): State<BackendState>) -> Json<BackendStatus> {
    Json(state.status.borrow().clone())
}

/// Long-poll form of the one-shot "backend ready" signal.
async fn wait_ready(State(state): State<BackendState>) -> ApiResult<Json<BackendStatus>> {
    let mut status = state.status.clone();
    let settled = status
        .wait_for(|s| *s != BackendStatus::Starting)
        .await
        .map_err(|_| ApiError::Internal("backend monitor stopped".to_string()))?
        .clone();

    match settled {
        BackendStatus::Failed { reason } => Err(ApiError::Unavailable(reason)),
        ready => Ok(Json(ready)),
    }
}

async fn chat(
    State(state): State<BackendState>,
    payload: Result<Json<ChatRequest>, JsonRejection>,
) -> ApiResult<Json<ChatReply>> {
    let Json(request) =
        payload.map_err(|rejection| ApiError::InvalidRequest(rejection.body_text()))?;
    if request.message.trim().is_empty() {
        return Err(ApiError::InvalidRequest("message is required".to_string()));
    }
    if *state.status.borrow() != BackendStatus::Ready {
        return Err(ApiError::BackendNotReady);
    }

    let reply = state.client.ask(&request.message).await?;
    state
        .history
        .record_exchange(&request.message, &reply.response)
        .await;
    Ok(Json(reply))
}

async fn chat_history(State(state): State<BackendState>) -> Json<HistorySnapshot> {
    Json(state.history.snapshot().await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        backend::{history::HISTORY_CAPACITY, readiness::tests::fast_config},
        config::{BackendConfig, LaunchMode},
    };
    use axum::{
        body::Body,
        http::{Request, StatusCode, header},
        response::Response,
    };
    use std::{path::PathBuf, time::Duration};
    use tower::ServiceExt;

    async fn rag_server() -> String {
        let app = Router::new().route(
            "/rag",
            post(|Json(req): Json<ChatRequest>| async move {
                Json(ChatReply {
                    response: format!("echo: {}", req.message),
                })
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        format!("http://{addr}")
    }

    fn client(base_url: String) -> BackendClient {
        BackendClient::new(&BackendConfig {
            launch: LaunchMode::Packaged {
                executable: PathBuf::from("unused"),
            },
            base_url,
            health_path: "/health".to_string(),
            readiness: fast_config(Some(1)),
        })
        .unwrap()
    }

    fn app(status: watch::Receiver<BackendStatus>, base_url: &str) -> Router {
        routes(status, client(base_url.to_string()), ChatHistory::new(HISTORY_CAPACITY))
    }

    fn chat_request(message: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/api/chat")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(serde_json::json!({ "message": message }).to_string()))
            .unwrap()
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn ready_long_poll_resolves_when_status_settles() {
        let (tx, rx) = watch::channel(BackendStatus::Starting);
        let app = app(rx, "http://127.0.0.1:9");

        let pending = tokio::spawn(
            app.oneshot(Request::get("/api/backend/ready").body(Body::empty()).unwrap()),
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!pending.is_finished());

        tx.send_replace(BackendStatus::Ready);
        let response = pending.await.unwrap().unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await, serde_json::json!({ "status": "ready" }));
    }

    #[tokio::test]
    async fn failed_backend_is_visible() {
        let (_tx, rx) = watch::channel(BackendStatus::Failed {
            reason: "backend did not become healthy after 60 probes".to_string(),
        });
        let app = app(rx, "http://127.0.0.1:9");

        let response = app
            .clone()
            .oneshot(Request::get("/api/backend/ready").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        let response = app
            .oneshot(Request::get("/api/backend/status").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(
            body_json(response).await,
            serde_json::json!({
                "status": "failed",
                "reason": "backend did not become healthy after 60 probes"
            })
        );
    }

    #[tokio::test]
    async fn chat_is_refused_until_ready() {
        let (_tx, rx) = watch::channel(BackendStatus::Starting);
        let response = app(rx, "http://127.0.0.1:9")
            .oneshot(chat_request("hello"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn chat_is_relayed_to_backend() {
        let base = rag_server().await;
        let (_tx, rx) = watch::channel(BackendStatus::Ready);
        let app = app(rx, &base);
        let response = app
            .clone()
            .oneshot(chat_request("what is a pointer?"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            body_json(response).await,
            serde_json::json!({ "response": "echo: what is a pointer?" })
        );

        let response = app
            .oneshot(Request::get("/api/chat/history").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let history = body_json(response).await;
        let texts: Vec<_> = history["history"]
            .as_array()
            .unwrap()
            .iter()
            .map(|m| (m["user"].as_str().unwrap(), m["text"].as_str().unwrap()))
            .collect();
        assert_eq!(
            texts,
            [("You", "what is a pointer?"), ("AI Bot", "echo: what is a pointer?")]
        );
    }

    #[tokio::test]
    async fn failed_relay_is_not_recorded() {
        let (_tx, rx) = watch::channel(BackendStatus::Starting);
        let app = app(rx, "http://127.0.0.1:9");
        let response = app.clone().oneshot(chat_request("hello")).await.unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        let response = app
            .oneshot(Request::get("/api/chat/history").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(body_json(response).await, serde_json::json!({ "history": [] }));
    }

    #[tokio::test]
    async fn relay_failure_is_bad_gateway() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let (_tx, rx) = watch::channel(BackendStatus::Ready);
        let response = app(rx, &format!("http://{addr}"))
            .oneshot(chat_request("hello"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }
}
