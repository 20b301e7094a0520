//! API routes

use axum::{
    middleware,
    routing::{delete, get, post, put},
    Router,
};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::auth::{admin_auth, scheduler_auth, AppState};
use crate::handlers::{analytics, batches, events, health, queue, trigger};

/// Create the API router
pub fn create_router(state: AppState) -> Router {
    let state = Arc::new(state);

    // Health check routes (no auth required)
    let health_routes = Router::new()
        .route("/", get(health::health))
        .route("/ready", get(health::readiness))
        .with_state(state.clone());

    // Scheduler routes
    let trigger_routes = Router::new()
        .route("/poll", post(trigger::poll))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            scheduler_auth,
        ));

    // Webhook routes (authenticated per request when a secret is configured)
    let event_routes = Router::new().route("/ingest", post(events::ingest));

    // Admin routes
    let admin_routes = Router::new()
        .route("/trigger", get(trigger::get_state))
        .route("/trigger/reset", post(trigger::reset))
        .route("/queue", post(queue::enqueue).get(queue::list_requests))
        .route("/queue/stats", get(queue::stats))
        .route("/queue/retry", put(queue::retry))
        .route("/queue/cleanup", delete(queue::cleanup))
        .route("/queue/process", post(queue::process))
        .route("/batches", post(batches::dispatch).get(batches::recent))
        .route("/batches/:id", get(batches::get_batch))
        .route("/batches/:id/requeue", post(batches::requeue))
        .route("/analytics", get(analytics::summary))
        .route("/analytics/daily", get(analytics::daily))
        .route("/analytics/categories", get(analytics::categories))
        .layer(middleware::from_fn_with_state(state.clone(), admin_auth));

    let api_v1 = Router::new()
        .nest("/trigger", trigger_routes)
        .nest("/events", event_routes)
        .nest("/admin", admin_routes)
        .with_state(state);

    // Combine all routes
    Router::new()
        .nest("/health", health_routes)
        .nest("/api/v1", api_v1)
        .layer(TraceLayer::new_for_http())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{hash_api_key, sign_webhook};
    use axum::http::{HeaderName, HeaderValue, StatusCode};
    use axum_test::{TestRequest, TestServer};
    use chrono::{Duration, Utc};
    use partyline_common::config::Config;
    use partyline_core::transport::LogTransport;
    use partyline_core::{Deliverer, MiniJinjaRenderer};
    use partyline_storage::models::SeedCelebration;
    use partyline_storage::Store;
    use pretty_assertions::assert_eq;
    use serde_json::{json, Value};

    const ADMIN_KEY: &str = "pl_admin_test_key";

    fn config(extra_auth: &str) -> Config {
        Config::from_toml(&format!(
            r#"
            [database]
            backend = "memory"

            [auth]
            admin_key_hash = "{}"
            {}
            "#,
            hash_api_key(ADMIN_KEY),
            extra_auth
        ))
        .unwrap()
    }

    fn server_with(store: Store, config: &Config) -> TestServer {
        let deliverer = Arc::new(
            Deliverer::new(
                Arc::new(MiniJinjaRenderer::new().unwrap()),
                Arc::new(LogTransport::new()),
            )
            .with_default("site_url", config.server.site_url.as_str()),
        );
        TestServer::new(create_router(AppState::build(store, deliverer, config))).unwrap()
    }

    fn admin(request: TestRequest) -> TestRequest {
        request.add_header(
            HeaderName::from_static("authorization"),
            HeaderValue::from_str(&format!("Bearer {}", ADMIN_KEY)).unwrap(),
        )
    }

    async fn seed_past_celebration(store: &Store) {
        let now = Utc::now();
        store
            .celebration
            .seed(
                SeedCelebration {
                    instant: now - Duration::minutes(1),
                    timezone: "Europe/Paris".to_string(),
                    celebrant_email: "star@example.com".to_string(),
                    celebrant_name: Some("Camille".to_string()),
                },
                now,
            )
            .await
            .unwrap();
        store
            .contributors
            .add("friend@example.com", true)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_health() {
        let server = server_with(Store::memory(), &config(""));
        server.get("/health").await.assert_status_ok();

        let ready = server.get("/health/ready").await;
        ready.assert_status_ok();
        assert_eq!(ready.json::<Value>()["store"], "memory");
    }

    #[tokio::test]
    async fn test_admin_routes_require_key() {
        let server = server_with(Store::memory(), &config(""));

        let response = server.get("/api/v1/admin/queue/stats").await;
        response.assert_status(StatusCode::UNAUTHORIZED);
        assert_eq!(response.json::<Value>()["error"], "unauthorized");

        let wrong = server
            .get("/api/v1/admin/queue/stats")
            .add_header(
                HeaderName::from_static("authorization"),
                HeaderValue::from_static("Bearer nope"),
            )
            .await;
        wrong.assert_status(StatusCode::UNAUTHORIZED);

        let ok = admin(server.get("/api/v1/admin/queue/stats")).await;
        ok.assert_status_ok();
        assert_eq!(ok.json::<Value>()["total"], 0);
    }

    #[tokio::test]
    async fn test_poll_fires_once() {
        let store = Store::memory();
        seed_past_celebration(&store).await;
        let server = server_with(store, &config(""));

        let first = server.post("/api/v1/trigger/poll").await;
        first.assert_status_ok();
        let body = first.json::<Value>();
        assert_eq!(body["fired"], true);
        assert_eq!(body["batches"].as_array().unwrap().len(), 2);

        let second = server.post("/api/v1/trigger/poll").await.json::<Value>();
        assert_eq!(second["fired"], false);
        assert_eq!(second["status"], "already_fired");

        let state = admin(server.get("/api/v1/admin/trigger")).await.json::<Value>();
        assert_eq!(state["already_fired"], true);

        let reset = admin(server.post("/api/v1/admin/trigger/reset"))
            .await
            .json::<Value>();
        assert_eq!(reset["already_fired"], false);
    }

    #[tokio::test]
    async fn test_poll_requires_scheduler_secret_when_configured() {
        let store = Store::memory();
        seed_past_celebration(&store).await;
        let server = server_with(
            store,
            &config(&format!(
                "scheduler_secret_hash = \"{}\"",
                hash_api_key("cron-secret")
            )),
        );

        server
            .post("/api/v1/trigger/poll")
            .await
            .assert_status(StatusCode::UNAUTHORIZED);

        let response = server
            .post("/api/v1/trigger/poll")
            .add_header(
                HeaderName::from_static("authorization"),
                HeaderValue::from_static("Bearer cron-secret"),
            )
            .await;
        response.assert_status_ok();
        assert_eq!(response.json::<Value>()["fired"], true);
    }

    #[tokio::test]
    async fn test_enqueue_and_process() {
        let server = server_with(Store::memory(), &config(""));

        let created = admin(server.post("/api/v1/admin/queue"))
            .json(&json!({
                "recipient": "Guest@Example.com",
                "template_id": "thank_you",
                "template_data": { "celebrant_name": "Camille" },
                "priority": "high"
            }))
            .await;
        created.assert_status(StatusCode::CREATED);
        let request = created.json::<Value>();
        assert_eq!(request["recipient"], "guest@example.com");
        assert_eq!(request["status"], "pending");

        let processed = admin(server.post("/api/v1/admin/queue/process"))
            .await
            .json::<Value>();
        assert_eq!(processed["processed"], 1);
        assert_eq!(processed["outcomes"][0]["status"], "sent");

        let stats = admin(server.get("/api/v1/admin/queue/stats"))
            .await
            .json::<Value>();
        assert_eq!(stats["sent"], 1);

        let invalid = admin(server.post("/api/v1/admin/queue"))
            .json(&json!({ "recipient": "not-an-address" }))
            .await;
        invalid.assert_status(StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(invalid.json::<Value>()["error"], "validation_error");

        let cleanup = admin(server.delete("/api/v1/admin/queue/cleanup"))
            .add_query_param("older_than_days", 0)
            .await;
        cleanup.assert_status(StatusCode::UNPROCESSABLE_ENTITY);

        let huge = admin(server.delete("/api/v1/admin/queue/cleanup"))
            .add_query_param("older_than_days", 100_000_000_i64)
            .await;
        huge.assert_status(StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[tokio::test]
    async fn test_send_now_and_audit() {
        let server = server_with(Store::memory(), &config(""));

        let created = admin(server.post("/api/v1/admin/batches"))
            .json(&json!({
                "batch_type": "thank_you",
                "recipients": ["a@example.com", "A@example.com", "b@example.com"],
                "template_data": { "celebrant_name": "Camille" }
            }))
            .await;
        created.assert_status(StatusCode::CREATED);
        let batch = created.json::<Value>();
        assert_eq!(batch["status"], "completed");
        assert_eq!(batch["recipients"].as_array().unwrap().len(), 2);

        let id = batch["id"].as_str().unwrap().to_string();
        admin(server.get(&format!("/api/v1/admin/batches/{}", id)))
            .await
            .assert_status_ok();

        let requeued = admin(server.post(&format!("/api/v1/admin/batches/{}/requeue", id)))
            .await
            .json::<Value>();
        assert_eq!(requeued["requeued"].as_array().unwrap().len(), 0);

        let recent = admin(server.get("/api/v1/admin/batches"))
            .await
            .json::<Value>();
        assert_eq!(recent["count"], 1);

        admin(server.get(&format!("/api/v1/admin/batches/{}", uuid::Uuid::new_v4())))
            .await
            .assert_status(StatusCode::NOT_FOUND);

        admin(server.post("/api/v1/admin/batches"))
            .json(&json!({ "batch_type": "thank_you", "recipients": [] }))
            .await
            .assert_status(StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[tokio::test]
    async fn test_ingest_and_analytics() {
        let server = server_with(Store::memory(), &config(""));
        let at = Utc::now().to_rfc3339();
        let body = json!([
            { "event_id": "e1", "event_type": "delivery", "recipient": "a@example.com", "occurred_at": at, "category": "thank_you" },
            { "event_id": "e2", "event_type": "open", "recipient": "a@example.com", "occurred_at": at, "category": "thank_you" },
            { "event_id": "e3", "event_type": "bounce", "recipient": "b@example.com", "occurred_at": at, "category": "thank_you" },
            { "event_type": "delivery" }
        ]);

        let response = server
            .post("/api/v1/events/ingest")
            .text(body.to_string())
            .await;
        response.assert_status_ok();
        let report = response.json::<Value>();
        assert_eq!(report["accepted"], 3);
        assert_eq!(report["rejected"], 1);

        server
            .post("/api/v1/events/ingest")
            .text("[{\"event\": ")
            .await
            .assert_status(StatusCode::BAD_REQUEST);

        let summary = admin(server.get("/api/v1/admin/analytics"))
            .add_query_param("type", "thank_you")
            .add_query_param("range", "7d")
            .await
            .json::<Value>();
        assert_eq!(summary["delivered"], 1);
        assert_eq!(summary["bounced"], 1);
        assert_eq!(summary["deliveryRate"], 0.5);
        assert_eq!(summary["openRate"], 1.0);

        let categories = admin(server.get("/api/v1/admin/analytics/categories"))
            .await
            .json::<Value>();
        assert_eq!(categories[0]["category"], "thank_you");

        let daily = admin(server.get("/api/v1/admin/analytics/daily"))
            .await
            .json::<Value>();
        assert_eq!(daily.as_array().unwrap().len(), 1);

        admin(server.get("/api/v1/admin/analytics"))
            .add_query_param("range", "1y")
            .await
            .assert_status(StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[tokio::test]
    async fn test_ingest_checks_webhook_signature() {
        let server = server_with(
            Store::memory(),
            &config("webhook_secret = \"hook-secret\""),
        );
        let body = json!({
            "event": "open",
            "email": "a@example.com",
            "time": 1793642700
        })
        .to_string();

        server
            .post("/api/v1/events/ingest")
            .text(body.clone())
            .await
            .assert_status(StatusCode::UNAUTHORIZED);

        let signature = sign_webhook("hook-secret", body.as_bytes()).unwrap();
        let signed = server
            .post("/api/v1/events/ingest")
            .add_header(
                HeaderName::from_static("x-partyline-signature"),
                HeaderValue::from_str(&signature).unwrap(),
            )
            .text(body.clone())
            .await;
        signed.assert_status_ok();
        assert_eq!(signed.json::<Value>()["inserted"], 1);

        let by_token = server
            .post("/api/v1/events/ingest")
            .add_query_param("token", "hook-secret")
            .text(body)
            .await;
        by_token.assert_status_ok();
        assert_eq!(by_token.json::<Value>()["duplicates"], 1);
    }
}
