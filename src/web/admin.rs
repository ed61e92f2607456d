use crate::bot::OutboundMessage;
use crate::error::SubmitError;
use crate::job::{ChatId, JobId, JobState, StreamJob, StreamRequest};
use crate::registry::JobFilter;
use crate::state::SharedState;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{info, warn};

type ApiError = (StatusCode, Json<Value>);

/// Maps a submission error onto a status code and a JSON body.
fn api_error(err: SubmitError) -> ApiError {
    let (code, body) = match &err {
        SubmitError::Validation(v) => (
            StatusCode::BAD_REQUEST,
            json!({ "error": err.to_string(), "field": v.field }),
        ),
        SubmitError::CapacityExceeded { limit } => (
            StatusCode::TOO_MANY_REQUESTS,
            json!({ "error": err.to_string(), "limit": limit }),
        ),
        SubmitError::NotFound(_) => (StatusCode::NOT_FOUND, json!({ "error": err.to_string() })),
        SubmitError::Unavailable => (
            StatusCode::SERVICE_UNAVAILABLE,
            json!({ "error": err.to_string() }),
        ),
    };
    (code, Json(body))
}

/// 获取系统状态 API
/// 返回主机的内存和负载信息，以及任务计数
pub async fn sys_status(State(state): State<SharedState>) -> Json<Value> {
    let mem = sys_info::mem_info().map(|m| (m.total, m.avail)).unwrap_or((0, 0));
    let load = sys_info::loadavg().map(|l| l.one).unwrap_or(0.0);
    let stats = state.supervisor.registry().stats();

    Json(json!({
        "mem_total": mem.0 / 1024, // MB
        "mem_avail": mem.1 / 1024, // MB
        "load_avg": load,
        "uptime_seconds": state.started_at.elapsed().as_secs(),
        "jobs": {
            "pending": stats.pending,
            "running": stats.running,
            "total": stats.total,
            "max_concurrent": state.config.supervisor.max_concurrent,
            "max_queue": state.config.supervisor.max_queue,
        },
    }))
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub state: Option<String>,
    pub chat_id: Option<ChatId>,
}

/// 获取任务列表 API，支持按状态过滤
pub async fn list_jobs(
    State(state): State<SharedState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Value>, ApiError> {
    let job_state = match query.state.as_deref() {
        None | Some("") => None,
        Some(raw) => Some(raw.parse::<JobState>().map_err(|e| {
            (StatusCode::BAD_REQUEST, Json(json!({ "error": e.to_string() })))
        })?),
    };
    let filter = JobFilter {
        state: job_state,
        requested_by: query.chat_id,
    };

    let listing = state.supervisor.list(filter);
    let jobs: Vec<&StreamJob> = listing.iter().collect();
    Ok(Json(json!({ "count": jobs.len(), "jobs": jobs })))
}

pub async fn get_job(
    State(state): State<SharedState>,
    Path(id): Path<u64>,
) -> Result<Json<StreamJob>, ApiError> {
    state
        .supervisor
        .get(JobId(id))
        .map(Json)
        .ok_or_else(|| api_error(SubmitError::NotFound(JobId(id))))
}

/// 提交任务 API
/// 校验通过后返回 201 和 Pending 状态的任务
pub async fn submit_job(
    State(state): State<SharedState>,
    Json(request): Json<StreamRequest>,
) -> Result<(StatusCode, Json<StreamJob>), ApiError> {
    match state.supervisor.submit(request) {
        Ok(job) => Ok((StatusCode::CREATED, Json(job))),
        Err(e) => {
            warn!("Rejected job submission: {}", e);
            Err(api_error(e))
        }
    }
}

/// 取消任务 API，重复取消不会报错
pub async fn cancel_job(
    State(state): State<SharedState>,
    Path(id): Path<u64>,
) -> Result<Json<Value>, ApiError> {
    let id = JobId(id);
    let outcome = state.supervisor.cancel(id).await.map_err(api_error)?;
    info!("Cancel requested for job [{}]: {:?}", id, outcome);
    Ok(Json(json!({ "id": id, "result": outcome })))
}

#[derive(Debug, Deserialize)]
pub struct BotCommandBody {
    pub chat_id: ChatId,
    pub text: String,
}

/// Entry point for the chat transport: one inbound message, one reply.
pub async fn bot_command(
    State(state): State<SharedState>,
    Json(body): Json<BotCommandBody>,
) -> Json<Value> {
    info!("Chat [{}] -> {}", body.chat_id, body.text);
    let reply = state.bot.handle(body.chat_id, &body.text).await;
    Json(json!({ "chat_id": body.chat_id, "reply": reply }))
}

/// Hands queued notifications to the transport. Each message is returned once.
pub async fn bot_outbox(State(state): State<SharedState>) -> Json<Vec<OutboundMessage>> {
    Json(state.drain_outbound())
}
