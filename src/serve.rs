//! HTTP control surface.
//!
//! Every control route answers both GET and POST so it can be driven from a
//! browser address bar as well as from scripts.

use crate::config::ServeConfig;
use crate::signals::Shutdown;
use crate::supervisor::{ControlError, StatusReport, Supervisor};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::get,
    Json, Router,
};
use std::sync::Arc;
use tower_http::cors::CorsLayer;

type Reply = Result<Json<serde_json::Value>, (StatusCode, Json<serde_json::Value>)>;

pub fn router(supervisor: Arc<Supervisor>) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/status", get(status))
        .route("/restart/{name}", get(restart).post(restart))
        .route("/stop/{name}", get(stop).post(stop))
        .route("/disable/{name}", get(disable).post(disable))
        .route("/enable/{name}", get(enable).post(enable))
        .layer(CorsLayer::permissive())
        .with_state(supervisor)
}

/// Bind the listener up front so a taken port fails startup.
pub async fn bind(config: &ServeConfig) -> std::io::Result<tokio::net::TcpListener> {
    let addr = format!("{}:{}", config.bind, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("serve listening on {}", listener.local_addr()?);
    Ok(listener)
}

/// Serve until `shutdown` fires.
pub async fn run(
    listener: tokio::net::TcpListener,
    app: Router,
    mut shutdown: Shutdown,
) -> std::io::Result<()> {
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.wait().await })
        .await
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({"ok": true}))
}

async fn status(State(supervisor): State<Arc<Supervisor>>) -> Json<StatusReport> {
    Json(supervisor.status_report().await)
}

async fn restart(State(supervisor): State<Arc<Supervisor>>, Path(name): Path<String>) -> Reply {
    reply(supervisor.restart(&name))
}

async fn stop(State(supervisor): State<Arc<Supervisor>>, Path(name): Path<String>) -> Reply {
    reply(supervisor.stop(&name))
}

async fn disable(State(supervisor): State<Arc<Supervisor>>, Path(name): Path<String>) -> Reply {
    reply(supervisor.disable(&name))
}

async fn enable(State(supervisor): State<Arc<Supervisor>>, Path(name): Path<String>) -> Reply {
    reply(supervisor.enable(&name))
}

fn reply(result: Result<(), ControlError>) -> Reply {
    match result {
        Ok(()) => Ok(Json(serde_json::json!({"ok": true}))),
        Err(e @ ControlError::UnknownBot(_)) => Err((
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({"error": e.to_string()})),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::BotStatus;
    use crate::testutil::{script_bot, test_supervisor, wait_until, PID_LOGGING_SLEEPER};
    use axum::body::Body;
    use axum::http::{Method, Request};
    use std::time::Duration;
    use tower::ServiceExt;

    async fn call(app: &Router, method: Method, uri: &str) -> (StatusCode, serde_json::Value) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::empty())
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn test_health() {
        let dir = tempfile::tempdir().unwrap();
        let app = router(Arc::new(test_supervisor(dir.path(), &[])));

        let (code, body) = call(&app, Method::GET, "/api/health").await;
        assert_eq!(code, StatusCode::OK);
        assert_eq!(body, serde_json::json!({"ok": true}));
    }

    #[tokio::test]
    async fn test_status_lists_bots() {
        let dir = tempfile::tempdir().unwrap();
        let sleeper = script_bot(dir.path(), "sleeper", PID_LOGGING_SLEEPER);
        let sup = Arc::new(test_supervisor(dir.path(), &[&sleeper]));
        sup.start();
        assert!(
            wait_until(Duration::from_secs(5), || {
                sup.registry().process_handle("sleeper").is_some()
            })
            .await
        );
        let app = router(Arc::clone(&sup));

        let (code, body) = call(&app, Method::GET, "/status").await;
        assert_eq!(code, StatusCode::OK);
        let row = &body["bots"]["sleeper"];
        assert_eq!(row["status"], "ON");
        assert_eq!(row["uptime"], "1m 30s");
        assert_eq!(row["errors"], serde_json::json!([]));
        assert_eq!(body["host"]["hostname"], "test-host");
        assert!(body["system_info"].as_str().unwrap().contains("CPU: 10.0%"));

        sup.shutdown().await;
    }

    #[tokio::test]
    async fn test_control_routes_accept_get_and_post() {
        let dir = tempfile::tempdir().unwrap();
        let sleeper = script_bot(dir.path(), "sleeper", PID_LOGGING_SLEEPER);
        let sup = Arc::new(test_supervisor(dir.path(), &[&sleeper]));
        let app = router(Arc::clone(&sup));

        let (code, body) = call(&app, Method::POST, "/disable/sleeper").await;
        assert_eq!(code, StatusCode::OK);
        assert_eq!(body, serde_json::json!({"ok": true}));
        assert!(sup.disabled().contains("sleeper"));
        assert_eq!(sup.registry().status("sleeper"), Some(BotStatus::Offline));

        let (code, _) = call(&app, Method::GET, "/enable/sleeper").await;
        assert_eq!(code, StatusCode::OK);
        assert!(!sup.disabled().contains("sleeper"));
        assert!(sup.registry().is_monitored("sleeper"));

        let (code, _) = call(&app, Method::GET, "/restart/sleeper").await;
        assert_eq!(code, StatusCode::OK);
        let (code, _) = call(&app, Method::POST, "/stop/sleeper").await;
        assert_eq!(code, StatusCode::OK);

        sup.shutdown().await;
    }

    #[tokio::test]
    async fn test_unknown_bot_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let sup = Arc::new(test_supervisor(dir.path(), &[]));
        let app = router(Arc::clone(&sup));

        for action in ["restart", "stop", "disable", "enable"] {
            let (code, body) = call(&app, Method::GET, &format!("/{action}/ghost")).await;
            assert_eq!(code, StatusCode::NOT_FOUND);
            assert_eq!(body, serde_json::json!({"error": "unknown bot 'ghost'"}));
        }
        assert!(!sup.disabled().contains("ghost"));
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let sup = Arc::new(test_supervisor(dir.path(), &[]));
        let listener = bind(&ServeConfig {
            bind: "127.0.0.1".to_string(),
            port: 0,
        })
        .await
        .unwrap();

        let server = tokio::spawn(run(
            listener,
            router(Arc::clone(&sup)),
            sup.shutdown_signal(),
        ));
        sup.shutdown().await;

        tokio::time::timeout(Duration::from_secs(5), server)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }
}
