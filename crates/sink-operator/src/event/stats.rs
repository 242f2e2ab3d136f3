use std::{future::Future, net::SocketAddr, sync::Arc};

use axum::{Json, Router, extract::State, routing::get};
use snafu::{ResultExt, Snafu};
use tokio::net::TcpListener;

use super::{EventController, Forwarder, ForwarderStats};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to bind stats listener to {addr}"))]
    Bind {
        source: std::io::Error,
        addr: SocketAddr,
    },

    #[snafu(display("failed to serve stats"))]
    Serve { source: std::io::Error },
}

/// Exposes the forwarding counters at `/debug/vars`.
pub fn stats_router<F>(controller: Arc<EventController<F>>) -> Router
where
    F: Forwarder + 'static,
{
    Router::new()
        .route("/debug/vars", get(vars::<F>))
        .with_state(controller)
}

async fn vars<F>(State(controller): State<Arc<EventController<F>>>) -> Json<ForwarderStats>
where
    F: Forwarder + 'static,
{
    Json(controller.stats())
}

pub async fn serve_stats(
    port: u16,
    router: Router,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<(), Error> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await.context(BindSnafu { addr })?;

    tracing::info!(%addr, "serving event forwarder stats");
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await
        .context(ServeSnafu)
}

#[cfg(test)]
mod tests {
    use axum::{
        body::{Body, to_bytes},
        http::{Request, StatusCode},
    };
    use tower::ServiceExt;

    use super::*;
    use crate::{event::tests::FakeForwarder, watch::WatchEvent};

    #[tokio::test]
    async fn serves_counters_as_json() {
        let controller = Arc::new(EventController::new(FakeForwarder::default()));
        controller
            .handle(WatchEvent::Added(crate::event::tests::event("started")))
            .await;

        let response = stats_router(controller)
            .oneshot(
                Request::builder()
                    .uri("/debug/vars")
                    .body(Body::empty())
                    .expect("valid request"),
            )
            .await
            .expect("infallible router");

        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body readable");
        let stats: serde_json::Value = serde_json::from_slice(&body).expect("JSON body");
        assert_eq!(stats["eventcontroller_forwarder_received_count"], 1);
        assert_eq!(stats["eventcontroller_forwarder_sent_count"], 1);
        assert_eq!(stats["eventcontroller_forwarder_failed_count"], 0);
    }

    #[tokio::test]
    async fn unknown_paths_are_not_found() {
        let controller = Arc::new(EventController::new(FakeForwarder::default()));

        let response = stats_router(controller)
            .oneshot(
                Request::builder()
                    .uri("/metrics")
                    .body(Body::empty())
                    .expect("valid request"),
            )
            .await
            .expect("infallible router");

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
