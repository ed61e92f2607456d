use crate::engine::job_log_path;
use crate::job::JobId;
use crate::state::SharedState;
use axum::{
    body::Body,
    extract::{Path, State},
    http::{header, Response, StatusCode},
};
use std::path::PathBuf;
use std::time::Duration;
use tokio::fs::File;
use tokio_util::io::ReaderStream;
use tracing::{debug, error};

/// Serves the persisted record of a finished job from the logs directory.
pub async fn serve_job_log(
    State(state): State<SharedState>,
    Path(id): Path<u64>,
) -> Result<Response<Body>, (StatusCode, String)> {
    let id = JobId(id);
    let path = job_log_path(&PathBuf::from(&state.config.server.logs_dir), id);

    // The record is written in the background right after the job ends
    let just_finished = state
        .supervisor
        .get(id)
        .is_some_and(|job| job.state.is_terminal());
    if just_finished {
        for i in 0..5 {
            if tokio::fs::try_exists(&path).await.unwrap_or(false) {
                break;
            }
            if i == 0 {
                debug!("Waiting for job log: {:?}", path);
            }
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
    }

    let file = File::open(&path)
        .await
        .map_err(|_| (StatusCode::NOT_FOUND, format!("No log for job {}", id)))?;

    let content_type = mime_guess::from_path(&path)
        .first()
        .map(|mime| mime.to_string())
        .unwrap_or_else(|| "text/plain; charset=utf-8".to_string());

    let body = Body::from_stream(ReaderStream::new(file));
    Response::builder()
        .header(header::CONTENT_TYPE, content_type)
        .body(body)
        .map_err(|e| {
            error!("Failed to build log response: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        })
}
