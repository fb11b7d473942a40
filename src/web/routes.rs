use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::{
    cors::{Any, CorsLayer},
    services::ServeDir,
    trace::TraceLayer,
};
use tracing::info;

use super::handlers;
use crate::auth::auth_middleware;
use crate::state::AppState;

/// Create the main application router
pub fn create_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let system_routes = Router::new()
        .route("/ping", get(handlers::ping))
        .route("/info", get(handlers::system_info))
        .route("/channels", get(handlers::list_channels));

    let camera_routes = Router::new()
        .route("/cameras", get(handlers::cameras::list_cameras))
        .route("/cameras/scan", post(handlers::cameras::scan_cameras))
        .route("/cameras/resolve", get(handlers::cameras::resolve_camera))
        .route(
            "/cameras/preferred",
            post(handlers::cameras::set_preferred_camera),
        );

    let webrtc_routes = Router::new()
        .route("/webrtc/offer", post(handlers::webrtc::webrtc_offer))
        .route(
            "/webrtc/offer/playback",
            post(handlers::webrtc::webrtc_offer_playback),
        )
        .route("/webrtc/close", post(handlers::webrtc::webrtc_close))
        .route("/webrtc/sessions", get(handlers::webrtc::webrtc_sessions));

    let media_routes = Router::new()
        .route("/recordings", get(handlers::media::get_recordings))
        .route("/playback-url", get(handlers::media::get_playback_url))
        .route("/snapshot/:channel", get(handlers::media::get_snapshot))
        .route("/test-connection", get(handlers::media::test_connection));

    let api_routes = Router::new()
        .merge(system_routes)
        .merge(camera_routes)
        .merge(webrtc_routes)
        .merge(media_routes)
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ));

    let mut router = Router::new().nest("/api", api_routes);

    if let Some(dir) = state.config.get().server.static_dir.clone() {
        info!("Serving static files from {}", dir);
        router = router.fallback_service(ServeDir::new(dir));
    }

    router
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AppConfig, ConfigStore};
    use crate::discovery::TcpProbe;
    use crate::rtsp::testing::FakeDialer;
    use serde_json::{json, Value};
    use tokio::net::TcpListener;
    use tokio_util::sync::CancellationToken;

    async fn serve(config: AppConfig) -> (String, Arc<AppState>) {
        let store = Arc::new(ConfigStore::in_memory(config));
        let state = AppState::new(
            store,
            Arc::new(TcpProbe),
            Arc::new(FakeDialer::default()),
            CancellationToken::new(),
        )
        .unwrap();
        let app = create_router(state.clone());

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{}/api", addr), state)
    }

    #[tokio::test]
    async fn test_ping_and_channels() {
        let (base, _state) = serve(AppConfig::default()).await;
        let client = reqwest::Client::new();

        let ping: Value = client
            .get(format!("{}/ping", base))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(ping["status"], "ok");

        let channels: Value = client
            .get(format!("{}/channels", base))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(channels.as_array().unwrap().len(), 9);
    }

    #[tokio::test]
    async fn test_playback_url_uses_fallback_camera() {
        let (base, _state) = serve(AppConfig::default()).await;
        let body: Value = reqwest::Client::new()
            .get(format!(
                "{}/playback-url?channel=101&start=2024-01-31T08:00:00Z",
                base
            ))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(
            body["url"],
            "rtsp://192.168.8.5:554/Streaming/tracks/101?starttime=20240131T080000Z&endtime=20240131T090000Z"
        );
        assert!(body["stream_key"].as_str().unwrap().starts_with("playback_"));
    }

    #[tokio::test]
    async fn test_malformed_scan_body_is_bad_request() {
        let (base, _state) = serve(AppConfig::default()).await;
        let response = reqwest::Client::new()
            .post(format!("{}/cameras/scan", base))
            .header("content-type", "application/json")
            .body("{\"subnet\": ")
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_recordings_rejects_bad_date() {
        let (base, _state) = serve(AppConfig::default()).await;
        let response = reqwest::Client::new()
            .get(format!("{}/recordings?channel=101&start=2024/01/31", base))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_invalid_offer_is_bad_request() {
        let (base, state) = serve(AppConfig::default()).await;
        let response = reqwest::Client::new()
            .post(format!("{}/webrtc/offer?channel=201", base))
            .json(&json!({"type": "offer", "sdp": "garbage"}))
            .send()
            .await
            .unwrap();

        assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);
        let body: Value = response.json().await.unwrap();
        assert_eq!(body["success"], false);
        assert!(state.sessions.get("201").is_none());
        state.shutdown_relay().await;
    }

    #[tokio::test]
    async fn test_unknown_channel_and_session() {
        let (base, _state) = serve(AppConfig::default()).await;
        let client = reqwest::Client::new();

        let response = client
            .post(format!("{}/webrtc/offer?channel=999", base))
            .json(&json!({"type": "offer", "sdp": "v=0"}))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::NOT_FOUND);

        let response = client
            .post(format!("{}/webrtc/close", base))
            .json(&json!({"stream_key": "201"}))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_preferred_camera_is_persisted() {
        let (base, state) = serve(AppConfig::default()).await;
        let response = reqwest::Client::new()
            .post(format!("{}/cameras/preferred", base))
            .json(&json!({"camera_ip": "10.0.0.6"}))
            .send()
            .await
            .unwrap();
        assert!(response.status().is_success());
        assert_eq!(state.config.get().discovery.preferred_ips, vec!["10.0.0.6"]);
    }

    #[tokio::test]
    async fn test_basic_auth_when_enabled() {
        let mut config = AppConfig::default();
        config.auth.enabled = true;
        let (base, _state) = serve(config).await;
        let client = reqwest::Client::new();

        // ping stays public
        let response = client.get(format!("{}/ping", base)).send().await.unwrap();
        assert!(response.status().is_success());

        let response = client
            .get(format!("{}/channels", base))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::UNAUTHORIZED);

        let response = client
            .get(format!("{}/channels", base))
            .basic_auth("admin", Some("password"))
            .send()
            .await
            .unwrap();
        assert!(response.status().is_success());
    }
}
