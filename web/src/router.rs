use crate::{
    controller::{health_check_controller, ingest_controller, stream_controller},
    AppState,
};
use axum::{routing::get, Extension, Router};
use sse::Source;

/// Builds the application router: the health check plus one sub-router per
/// configured source prefix.
pub fn define_routes(app_state: AppState) -> Router {
    let mut router = Router::new().merge(health_routes());

    if let Some(prefix) = app_state.config.pubsub_prefix() {
        let source = Source::ephemeral(app_state.broker());
        router = router.merge(source_routes(prefix, source, app_state.clone()));
    }

    if let Some(prefix) = app_state.config.stream_prefix() {
        let source = Source::durable(app_state.broker());
        router = router.merge(source_routes(prefix, source, app_state.clone()));
    }

    router
}

fn health_routes() -> Router {
    Router::new().route("/health", get(health_check_controller::health_check))
}

/// `GET <prefix>/<name>` streams, `POST <prefix>/<name>` ingests. `<name>` is
/// exactly one path segment. Any other method on the path is answered with
/// 405 by the method router.
fn source_routes(prefix: &str, source: Source, app_state: AppState) -> Router {
    Router::new()
        .route(
            &format!("{prefix}/:name"),
            get(stream_controller::stream).post(ingest_controller::ingest),
        )
        .layer(Extension(source))
        .with_state(app_state)
}
