//! HTTP routes for the login exchange.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{State, rejection::JsonRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::post,
};
use botlink_core::{PendingLoginStore, SessionStore};
use serde::Deserialize;
use serde_json::json;

use crate::exchange::{ExchangeError, LoginExchange};

#[derive(Debug, Deserialize)]
struct BeginBody {
    user: String,
}

#[derive(Debug, Deserialize)]
struct CompleteBody {
    user: String,
    nonce: String,
    code: String,
}

impl IntoResponse for ExchangeError {
    fn into_response(self) -> Response {
        if let Self::Storage(e) = &self {
            tracing::error!("Login exchange storage failure: {e}");
        }
        let status =
            StatusCode::from_u16(self.status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(json!({ "error": self.public_message() }))).into_response()
    }
}

/// Routes `POST /login/begin` and `POST /login/complete`.
pub fn routes<S>(exchange: Arc<LoginExchange<S>>) -> Router
where
    S: PendingLoginStore + SessionStore + 'static,
{
    Router::new()
        .route("/login/begin", post(begin::<S>))
        .route("/login/complete", post(complete::<S>))
        .with_state(exchange)
}

async fn begin<S>(
    State(exchange): State<Arc<LoginExchange<S>>>,
    body: Result<Json<BeginBody>, JsonRejection>,
) -> Response
where
    S: PendingLoginStore + SessionStore + 'static,
{
    let Ok(Json(body)) = body else {
        return ExchangeError::Validation.into_response();
    };
    match exchange.begin(&body.user).await {
        Ok(begun) => Json(begun).into_response(),
        Err(e) => e.into_response(),
    }
}

async fn complete<S>(
    State(exchange): State<Arc<LoginExchange<S>>>,
    body: Result<Json<CompleteBody>, JsonRejection>,
) -> Response
where
    S: PendingLoginStore + SessionStore + 'static,
{
    let Ok(Json(body)) = body else {
        return ExchangeError::Validation.into_response();
    };
    match exchange.complete(&body.user, &body.nonce, &body.code).await {
        Ok(done) => Json(done).into_response(),
        Err(e) => e.into_response(),
    }
}

#[cfg(test)]
mod tests {
    use axum::{
        body::{Body, to_bytes},
        http::{Request, header::CONTENT_TYPE},
    };
    use botlink_core::now_millis;
    use serde_json::Value;
    use tower::ServiceExt;

    use super::*;
    use crate::exchange::tests::bridged;

    async fn post_json(app: Router, path: &str, body: &str) -> (StatusCode, Value) {
        let response = app
            .oneshot(
                Request::post(path)
                    .header(CONTENT_TYPE, "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn test_login_over_http() {
        let (exchange, store) = bridged();
        let app = routes(Arc::new(exchange));

        let (status, begun) = post_json(app.clone(), "/login/begin", r#"{"user":"alice"}"#).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(begun["success"], true);
        let (nonce, code) = (begun["nonce"].as_str().unwrap(), begun["code"].as_str().unwrap());

        let complete = json!({ "user": "alice", "nonce": nonce, "code": code }).to_string();
        let (status, body) = post_json(app.clone(), "/login/complete", &complete).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "This code is not yet valid.");

        let login = store
            .find_unconfirmed("ALICE", code, now_millis())
            .await
            .unwrap()
            .unwrap();
        store.confirm(login.id).await.unwrap();

        let (status, body) = post_json(app.clone(), "/login/complete", &complete).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["user"], "ALICE");
        assert!(body["token"].as_str().is_some());

        let (status, body) = post_json(app, "/login/complete", &complete).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "The provided login info could not be found.");
    }

    #[tokio::test]
    async fn test_bad_bodies_are_400() {
        let (exchange, _) = bridged();
        let app = routes(Arc::new(exchange));

        for (path, body) in [
            ("/login/begin", "not json"),
            ("/login/begin", r#"{"user":42}"#),
            ("/login/begin", r#"{"user":""}"#),
            ("/login/complete", r#"{"user":"alice","nonce":"n"}"#),
        ] {
            let (status, body) = post_json(app.clone(), path, body).await;
            assert_eq!(status, StatusCode::BAD_REQUEST, "{path}");
            assert_eq!(body["error"], "Invalid request body");
        }
    }

    #[tokio::test]
    async fn test_unknown_user_is_404() {
        let (exchange, _) = bridged();
        let app = routes(Arc::new(exchange));
        let (status, body) = post_json(app, "/login/begin", r#"{"user":"mallory"}"#).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "user not found");
    }
}
