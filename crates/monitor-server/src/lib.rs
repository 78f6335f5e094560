//! Live metrics service: the refresh loop, the metrics store, subscriber
//! fan-out and the HTTP/WebSocket surface in front of them.

pub mod fanout;
pub mod refresh;
pub mod routes;
pub mod state;
pub mod store;
pub mod ws;

use std::sync::Arc;

use anyhow::Context;
use axum::Router;
use monitor_core::{AppConfig, RecordSource};
use tokio::task::JoinHandle;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

pub use fanout::{ClientMessage, Fanout, ServerMessage};
pub use refresh::{RefreshLoop, RefreshState, RefreshTrigger};
pub use state::ServiceContext;
pub use store::{MetricsStore, Published};

/// Build the axum Router with all routes and middleware.
pub fn build_router(ctx: ServiceContext) -> Router {
    let cors = ctx.config.server.cors;

    let mut app = Router::new()
        .merge(routes::health_routes())
        .merge(routes::metrics_routes())
        .merge(routes::live_routes())
        .with_state(ctx);

    app = app.layer(TraceLayer::new_for_http());

    if cors {
        app = app.layer(CorsLayer::permissive());
    }

    app
}

/// A running refresh loop bound to its context.
pub struct MonitorService {
    ctx: ServiceContext,
    refresh: JoinHandle<()>,
}

impl MonitorService {
    /// Start the refresh loop in the background. The first pass runs immediately.
    pub fn spawn(ctx: ServiceContext, source: Arc<dyn RecordSource>) -> Self {
        let refresh = tokio::spawn(RefreshLoop::new(ctx.clone(), source).run());
        Self { ctx, refresh }
    }

    pub fn context(&self) -> &ServiceContext {
        &self.ctx
    }

    /// Cancel the loop, disconnect all clients and wait for the source to be released.
    pub async fn stop(self) {
        info!("Stopping monitor service");
        self.ctx.shutdown.cancel();
        self.ctx.fanout.close_all();
        if let Err(e) = self.refresh.await {
            warn!(error = %e, "Refresh loop ended abnormally");
        }
    }
}

/// Run a single collect/aggregate pass without starting the service.
pub async fn snapshot_once(
    config: AppConfig,
    source: Arc<dyn RecordSource>,
) -> anyhow::Result<Arc<Published>> {
    config.validate()?;
    source
        .connect()
        .await
        .with_context(|| format!("record source '{}' unavailable", source.name()))?;

    let ctx = ServiceContext::new(config);
    let result = RefreshLoop::new(ctx, source.clone())
        .refresh_once(RefreshTrigger::Manual)
        .await;
    source.close().await;
    Ok(result?)
}

/// Start the HTTP server and the refresh loop; returns after Ctrl-C.
pub async fn serve(config: AppConfig, source: Arc<dyn RecordSource>) -> anyhow::Result<()> {
    config.validate()?;
    // An unreachable source at startup is a configuration error.
    source
        .connect()
        .await
        .with_context(|| format!("record source '{}' unavailable at startup", source.name()))?;

    let ctx = ServiceContext::new(config);
    let router = build_router(ctx.clone());

    let addr = format!("{}:{}", ctx.config.server.host, ctx.config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    info!("Starting server on {}", addr);

    let service = MonitorService::spawn(ctx.clone(), source);

    let shutdown = ctx.shutdown.clone();
    let result = axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => info!("Received Ctrl-C, shutting down"),
                _ = shutdown.cancelled() => {}
            }
            // Live channels watch the token and hang up.
            shutdown.cancel();
        })
        .await;

    service.stop().await;
    result?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use chrono::Utc;
    use monitor_analytics::{AggregationInput, Aggregator};
    use monitor_core::{
        Granularity, InteractionRecord, MemorySource, MonitorEventType, Role, SessionRecord,
    };
    use std::time::Duration;
    use tower::ServiceExt;

    fn test_context() -> ServiceContext {
        ServiceContext::new(AppConfig::default())
    }

    fn publish_empty(ctx: &ServiceContext) {
        let snapshot = Aggregator::default().aggregate(
            &AggregationInput::default(),
            ctx.store.granularity(),
            Utc::now(),
        );
        ctx.store.publish(snapshot);
    }

    async fn body_json(resp: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn post_scale(scale: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/api/time-scale")
            .header("content-type", "application/json")
            .body(Body::from(format!(r#"{{"scale":"{}"}}"#, scale)))
            .unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let ctx = test_context();
        let resp = build_router(ctx).oneshot(get("/health")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let json = body_json(resp).await;
        assert_eq!(json["status"], "ok");
        assert_eq!(json["refresh_state"], "idle");
        assert_eq!(json["clients"], 0);
        assert!(json["last_publish"].is_null());
    }

    #[tokio::test]
    async fn test_metrics_unavailable_until_first_publish() {
        let ctx = test_context();
        let resp = build_router(ctx.clone())
            .oneshot(get("/api/metrics"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);

        publish_empty(&ctx);
        let resp = build_router(ctx).oneshot(get("/api/metrics")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        assert_eq!(json["sequence"], 1);
        assert_eq!(json["snapshot"]["scale"], "day");
    }

    #[tokio::test]
    async fn test_dashboard_payload() {
        let ctx = test_context();
        publish_empty(&ctx);
        let resp = build_router(ctx).oneshot(get("/api/dashboard")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        assert_eq!(json["time_scale"], "day");
        assert_eq!(json["summary"]["total_sessions"], 0);
        assert_eq!(json["user"]["hours"].as_array().unwrap().len(), 24);
    }

    #[tokio::test]
    async fn test_time_scale_endpoint() {
        let ctx = test_context();

        let resp = build_router(ctx.clone())
            .oneshot(post_scale("hour"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::ACCEPTED);
        assert_eq!(ctx.store.granularity(), Granularity::Hour);

        let resp = build_router(ctx.clone())
            .oneshot(post_scale("month"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let json = body_json(resp).await;
        assert!(json["error"].as_str().unwrap().contains("month"));
        assert_eq!(ctx.store.granularity(), Granularity::Hour);
    }

    #[tokio::test]
    async fn test_service_stop_closes_clients() {
        let ctx = test_context();
        let mut published = ctx
            .events
            .subscribe_filtered(vec![MonitorEventType::SnapshotPublished]);
        let source = Arc::new(MemorySource::with_records(
            vec![SessionRecord::new("s1", true)],
            vec![InteractionRecord::new("s1", Role::User, Utc::now())],
        ));
        source.connect().await.unwrap();

        let service = MonitorService::spawn(ctx.clone(), source.clone());
        published.recv().await.unwrap();
        let mut client = ctx.fanout.register();

        tokio::time::timeout(Duration::from_secs(5), service.stop())
            .await
            .expect("service should stop");

        assert!(client.updates.recv().await.is_none());
        assert_eq!(ctx.refresh_state(), RefreshState::Stopped);
        assert_eq!(source.state(), monitor_core::ConnectionState::Disconnected);
        assert_eq!(ctx.store.sequence(), 1);
    }

    #[tokio::test]
    async fn test_snapshot_once() {
        let source = Arc::new(MemorySource::with_records(
            vec![SessionRecord::new("s1", false)],
            vec![
                InteractionRecord::new("s1", Role::User, Utc::now()),
                InteractionRecord::new("s1", Role::Assistant, Utc::now())
                    .with_processing_time(80.0),
            ],
        ));
        let published = snapshot_once(AppConfig::default(), source.clone())
            .await
            .unwrap();
        assert_eq!(published.snapshot.usage.user_messages, 1);
        assert_eq!(published.snapshot.performance.processing_time.avg, 80.0);
        assert_eq!(source.state(), monitor_core::ConnectionState::Disconnected);

        source.set_available(false);
        assert!(snapshot_once(AppConfig::default(), source).await.is_err());
    }
}
