use crate::pipeline::types::RunProgress;
use axum::{extract::State, Json};
use std::sync::Arc;

pub async fn get_progress(State(progress): State<Arc<RunProgress>>) -> Json<serde_json::Value> {
    Json(progress.to_progress_json())
}

pub async fn health() -> &'static str {
    "ok"
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AcceleratorId;
    use std::sync::atomic::Ordering;

    #[tokio::test]
    async fn test_progress_snapshot() {
        let progress = Arc::new(RunProgress::default());
        progress.total_units.store(8, Ordering::Relaxed);
        progress.failed_units.store(1, Ordering::Relaxed);
        progress.update_accelerator(AcceleratorId(1), |a| {
            a.queued = 3;
            a.in_flight = 2;
        });

        let Json(body) = get_progress(State(progress)).await;
        assert_eq!(body["units"]["total"], 8);
        assert_eq!(body["units"]["failed"], 1);
        assert_eq!(body["accelerators"]["gpu1"]["queued"], 3);
        assert_eq!(body["is_active"], true);
        assert_eq!(health().await, "ok");
    }
}
