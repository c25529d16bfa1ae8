use crate::{error::AppError, state::AppState};
use actix_web::{web, HttpResponse};
use serde_json::{json, Value};

/// Placeholder the config endpoints show instead of the API key.
const REDACTED: &str = "********";

pub async fn get_config(state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    let config = state.get_config().await;

    Ok(HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "config": config.redacted()
    })))
}

pub async fn update_config(
    state: web::Data<AppState>,
    body: web::Json<Value>,
) -> Result<HttpResponse, AppError> {
    let mut patch = body.into_inner();

    // A config fetched from GET and sent back unchanged must not overwrite the key
    if let Some(service) = patch.get_mut("service").and_then(Value::as_object_mut) {
        if service.get("api_key").and_then(Value::as_str) == Some(REDACTED) {
            service.remove("api_key");
        }
    }

    let mut current_config = state.get_config().await;
    current_config
        .update_from_json(&serde_json::to_string(&patch)?)
        .map_err(|e| AppError::ValidationError(e.to_string()))?;

    state.update_config(current_config.clone()).await;

    Ok(HttpResponse::Ok().json(json!({
        "status": "success",
        "message": "Configuration updated; applies to the next voice session",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "updated_config": current_config.redacted()
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::session::{SessionController, ToolRegistry};
    use crate::testing::{FakeBackend, FakeConnector};
    use actix_web::http::StatusCode;
    use actix_web::{test, App};
    use std::sync::Arc;

    fn app_state() -> AppState {
        let mut config = AppConfig::default();
        config.service.api_key = "secret-key".to_string();
        let controller = SessionController::new(
            config.clone(),
            Arc::new(FakeBackend::new()),
            Arc::new(FakeConnector::new()),
            ToolRegistry::nurse(),
        );
        AppState::new(config, Arc::new(controller))
    }

    #[actix_web::test]
    async fn test_redacted_key_survives_round_trip() {
        let state = app_state();
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state.clone()))
                .route("/config", web::get().to(get_config))
                .route("/config", web::put().to(update_config)),
        )
        .await;

        let req = test::TestRequest::get().uri("/config").to_request();
        let body: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["config"]["service"]["api_key"], REDACTED);

        let mut fetched = body["config"].clone();
        fetched["session"]["opening_trigger"] = json!("Hello");
        let req = test::TestRequest::put().uri("/config").set_json(&fetched).to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::OK);

        let config = state.get_config().await;
        assert_eq!(config.service.api_key, "secret-key");
        assert_eq!(config.session.opening_trigger, "Hello");
    }

    #[actix_web::test]
    async fn test_invalid_update_rejected() {
        let state = app_state();
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state.clone()))
                .route("/config", web::put().to(update_config)),
        )
        .await;

        let req = test::TestRequest::put()
            .uri("/config")
            .set_json(json!({ "capture": { "block_size": 0 } }))
            .to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::BAD_REQUEST);
        assert_eq!(state.get_config().await.capture.block_size, 4096);
    }
}
