use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::extract::{Path, RawQuery, State};
use axum::http::header;
use axum::response::IntoResponse;
use axum::response::sse::{KeepAlive, Sse};
use axum::routing::get;
use futures::StreamExt;
use tracing::{info, warn};

use cadgate_core::{
    Assembly, BuildRequest, BuildTarget, DEFAULT_ALLOWED_GROUPS, Fingerprint, parse_query_pairs,
};
use cadgate_engine::{ProgressUpdate, SingleflightCache, SubmitError};

use crate::backend::BuildBackend;
use crate::stream::{EventFrame, EventStream, ObserverQueue};

/// Gateway tunables, fed from the CLI.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Progress frames buffered per observer before the oldest is dropped.
    pub progress_queue_capacity: usize,
    /// SSE keep-alive cadence; a dead transport surfaces within one tick.
    pub disconnect_poll_interval: Duration,
    /// Legal parameter group prefixes.
    pub allowed_groups: Vec<String>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            progress_queue_capacity: 64,
            disconnect_poll_interval: Duration::from_millis(200),
            allowed_groups: DEFAULT_ALLOWED_GROUPS.iter().map(|s| s.to_string()).collect(),
        }
    }
}

/// Shared router state: one singleflight cache for all three operations, so
/// a new request for any operation preempts whatever build is running.
#[derive(Clone)]
pub struct AppState {
    pub cache: SingleflightCache<Fingerprint, serde_json::Value>,
    pub backend: Arc<dyn BuildBackend>,
    pub config: Arc<GatewayConfig>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/visualize/{assembly}/stream", get(visualize))
        .route("/cncOverview/stream", get(cnc_overview))
        .route("/dimensionTables/stream", get(dimension_tables))
        .with_state(state)
}

async fn visualize(
    State(state): State<AppState>,
    Path(assembly): Path<String>,
    RawQuery(query): RawQuery,
) -> impl IntoResponse {
    let target = Assembly::parse(&assembly)
        .map(BuildTarget::Visualize)
        .ok_or_else(|| format!("unknown assembly {assembly:?}"));
    serve_stream(state, target, query)
}

async fn cnc_overview(State(state): State<AppState>, RawQuery(query): RawQuery) -> impl IntoResponse {
    serve_stream(state, Ok(BuildTarget::CncOverview), query)
}

async fn dimension_tables(
    State(state): State<AppState>,
    RawQuery(query): RawQuery,
) -> impl IntoResponse {
    serve_stream(state, Ok(BuildTarget::DimensionTables), query)
}

/// Attach one observer: canonicalize, submit to the cache off the async
/// runtime, and stream frames back until the terminal one.
fn serve_stream(
    state: AppState,
    target: Result<BuildTarget, String>,
    query: Option<String>,
) -> impl IntoResponse {
    let queue = ObserverQueue::new(state.config.progress_queue_capacity);
    let stream = EventStream::new(queue.clone());

    match build_request(target, query.as_deref(), &state.config.allowed_groups) {
        Ok(request) => {
            let fingerprint = request.fingerprint();
            info!(operation = request.target.operation(), %fingerprint, "observer attached");

            let worker = state.backend.worker(&request);
            let cache = state.cache.clone();
            let listener_queue = queue.clone();
            let terminal_queue = queue.clone();
            // submit blocks until this observer's build reaches a terminal
            // state, possibly minutes; keep it off the async runtime.
            tokio::task::spawn_blocking(move || {
                let outcome = cache.submit(
                    fingerprint,
                    worker,
                    Some(move |update: &ProgressUpdate| {
                        listener_queue.push_progress(update.clone())
                    }),
                );
                terminal_queue.finish(match outcome {
                    Ok(result) => EventFrame::Complete(result),
                    Err(SubmitError::Cancelled) => EventFrame::Cancelled {
                        message: "build superseded by a newer request".to_string(),
                    },
                    Err(SubmitError::Worker(error)) => EventFrame::Error { error },
                });
            });
        }
        Err(error) => {
            warn!(%error, "rejecting request");
            queue.finish(EventFrame::Error { error });
        }
    }

    let events = stream.map(|frame| Ok::<_, Infallible>(frame.into_event()));
    let sse = Sse::new(events).keep_alive(
        KeepAlive::new()
            .interval(state.config.disconnect_poll_interval)
            .text("keep-alive"),
    );
    ([(header::CACHE_CONTROL, "no-cache")], sse)
}

fn build_request(
    target: Result<BuildTarget, String>,
    query: Option<&str>,
    allowed_groups: &[String],
) -> Result<BuildRequest, String> {
    let target = target?;
    let pairs: Vec<(String, String)> = url::form_urlencoded::parse(query.unwrap_or("").as_bytes())
        .map(|(key, value)| (key.into_owned(), value.into_owned()))
        .collect();
    let params = parse_query_pairs(
        pairs.iter().map(|(key, value)| (key.as_str(), value.as_str())),
        allowed_groups,
    )
    .map_err(|err| err.to_string())?;
    Ok(BuildRequest { target, params })
}
