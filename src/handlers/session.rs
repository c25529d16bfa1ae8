//! HTTP control of the voice session.

use crate::{error::AppError, state::AppState};
use actix_web::{web, HttpResponse};
use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::json;
use tokio_stream::wrappers::WatchStream;
use tracing::warn;

#[derive(Debug, Deserialize)]
pub struct TextRequest {
    pub text: String,
}

pub async fn session_status(state: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "is_active": state.controller.is_active(),
        "session": state.controller.snapshot()
    }))
}

pub async fn start_session(state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    let session = state.controller.start().await?;

    Ok(HttpResponse::Ok().json(json!({
        "status": "success",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "session": session
    })))
}

pub async fn stop_session(state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    let session = state.controller.stop().await;

    Ok(HttpResponse::Ok().json(json!({
        "status": "success",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "session": session
    })))
}

pub async fn send_text(
    state: web::Data<AppState>,
    body: web::Json<TextRequest>,
) -> Result<HttpResponse, AppError> {
    let text = body.into_inner().text;
    if text.trim().is_empty() {
        return Err(AppError::BadRequest("text must not be empty".to_string()));
    }

    state.controller.send_text(text).await?;

    Ok(HttpResponse::Accepted().json(json!({
        "status": "queued",
        "timestamp": chrono::Utc::now().to_rfc3339()
    })))
}

/// Server-sent events: one `data:` line per snapshot change, starting with the current one.
pub async fn session_events(state: web::Data<AppState>) -> HttpResponse {
    let stream = WatchStream::new(state.controller.subscribe()).map(|snapshot| {
        let payload = serde_json::to_string(&snapshot).unwrap_or_else(|e| {
            warn!(error = %e, "Failed to serialize session snapshot");
            "{}".to_string()
        });
        Ok::<_, actix_web::Error>(web::Bytes::from(format!("data: {}\n\n", payload)))
    });

    HttpResponse::Ok()
        .content_type("text/event-stream")
        .insert_header(("Cache-Control", "no-cache"))
        .streaming(stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::session::{SessionController, ToolRegistry};
    use crate::testing::{FakeBackend, FakeConnector};
    use actix_web::http::StatusCode;
    use actix_web::{test, App};
    use serde_json::Value;
    use std::sync::Arc;

    fn app_state(backend: &FakeBackend) -> AppState {
        let config = AppConfig::default();
        let controller = SessionController::new(
            config.clone(),
            Arc::new(backend.clone()),
            Arc::new(FakeConnector::new()),
            ToolRegistry::nurse(),
        );
        AppState::new(config, Arc::new(controller))
    }

    macro_rules! session_app {
        ($state:expr) => {
            test::init_service(
                App::new()
                    .app_data(web::Data::new($state))
                    .route("/session", web::get().to(session_status))
                    .route("/session/start", web::post().to(start_session))
                    .route("/session/stop", web::post().to(stop_session))
                    .route("/session/text", web::post().to(send_text)),
            )
            .await
        };
    }

    #[actix_web::test]
    async fn test_start_and_stop() {
        let backend = FakeBackend::new();
        let app = session_app!(app_state(&backend));

        let req = test::TestRequest::post().uri("/session/start").to_request();
        let body: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["session"]["state"], "connecting");

        let req = test::TestRequest::get().uri("/session").to_request();
        let body: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["is_active"], true);

        let req = test::TestRequest::post().uri("/session/stop").to_request();
        let body: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["session"]["state"], "closed");
        assert!(!backend.microphone_held());
    }

    #[actix_web::test]
    async fn test_denied_microphone_is_forbidden() {
        let backend = FakeBackend::new();
        backend.deny_microphone();
        let app = session_app!(app_state(&backend));

        let req = test::TestRequest::post().uri("/session/start").to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);

        let req = test::TestRequest::get().uri("/session").to_request();
        let body: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["session"]["state"], "failed");
        assert!(body["session"]["last_error"].as_str().unwrap().contains("Permission denied"));
    }

    #[actix_web::test]
    async fn test_text_requires_live_session() {
        let backend = FakeBackend::new();
        let app = session_app!(app_state(&backend));

        let req = test::TestRequest::post()
            .uri("/session/text")
            .set_json(json!({ "text": "hello" }))
            .to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::CONFLICT);

        let req = test::TestRequest::post()
            .uri("/session/text")
            .set_json(json!({ "text": "   " }))
            .to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::BAD_REQUEST);
    }
}
