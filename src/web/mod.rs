pub mod admin;
pub mod health;
pub mod logs;

use crate::state::SharedState;
use axum::{
    routing::{get, post},
    Router,
};

/// 注册HTTP路由
pub fn router(state: SharedState) -> Router {
    Router::new()
        .route("/", get(health::health_handler)) // 健康检查
        .route("/sys/status", get(admin::sys_status)) // 系统状态
        .route("/jobs", get(admin::list_jobs).post(admin::submit_job))
        .route("/jobs/:id", get(admin::get_job))
        .route("/jobs/:id/cancel", post(admin::cancel_job))
        .route("/jobs/:id/log", get(logs::serve_job_log))
        .route("/bot/command", post(admin::bot_command)) // 聊天指令入口
        .route("/bot/outbox", get(admin::bot_outbox))
        .with_state(state)
}
