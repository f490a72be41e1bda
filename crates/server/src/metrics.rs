use std::collections::BTreeMap;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::Serialize;
use tas_core::{NodeMetric, NodeMetrics};
use tracing::debug;

use crate::health::AppState;

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct MetricWriteResponse {
    pub metric: String,
    pub nodes: usize,
}

/// Replaces the samples of one metric with `{"<node>": <value>, ...}`,
/// timestamped now.
pub async fn write_metric(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(values): Json<BTreeMap<String, f64>>,
) -> (StatusCode, Json<MetricWriteResponse>) {
    let samples: NodeMetrics =
        values.into_iter().map(|(node, value)| (node, NodeMetric::now(value))).collect();
    let nodes = samples.len();
    state.cache.write_metric(name.clone(), samples);

    debug!(event_name = "system.metrics.written", metric = %name, nodes, "metric samples written");
    (StatusCode::OK, Json(MetricWriteResponse { metric: name, nodes }))
}
