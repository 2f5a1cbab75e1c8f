use crate::types::{GradingTarget, RegradeRequest, RegradeResult};
use redis::{AsyncCommands, RedisResult};

/// Redis key semantics shared by the worker, the CLI and the storage layer.
/// Keys are deterministic so every process agrees on where things live.

pub const QUEUE_PREFIX: &str = "autograder:queue";
pub const RESULT_PREFIX: &str = "autograder:result";
pub const SUBMISSIONS_PREFIX: &str = "autograder:submissions";
pub const COURSE_USERS_PREFIX: &str = "autograder:course-users";

/// Regrade results live for a day
pub const RESULT_TTL_SECS: u64 = 86400;

pub fn regrade_queue_name() -> String {
    format!("{}:regrade", QUEUE_PREFIX)
}

pub fn regrade_result_key(request_id: &uuid::Uuid) -> String {
    format!("{}:regrade:{}", RESULT_PREFIX, request_id)
}

/// List of stored submissions for one target, oldest first
pub fn submissions_key(target: &GradingTarget) -> String {
    format!(
        "{}:{}:{}:{}",
        SUBMISSIONS_PREFIX, target.course, target.assignment, target.user
    )
}

/// Hash of user -> role for one course
pub fn course_users_key(course: &str) -> String {
    format!("{}:{}", COURSE_USERS_PREFIX, course)
}

fn serialization_error(e: serde_json::Error) -> redis::RedisError {
    redis::RedisError::from((redis::ErrorKind::TypeError, "serialization error", e.to_string()))
}

/// Push a regrade request, FIFO via RPUSH
pub async fn push_regrade_request(
    conn: &mut redis::aio::ConnectionManager,
    request: &RegradeRequest,
) -> RedisResult<()> {
    let payload = serde_json::to_string(request).map_err(serialization_error)?;
    conn.rpush(regrade_queue_name(), payload).await
}

/// Pop a regrade request
/// Uses BLPOP with timeout so the worker can notice shutdown
pub async fn pop_regrade_request(
    conn: &mut redis::aio::ConnectionManager,
    timeout_seconds: f64,
) -> RedisResult<Option<RegradeRequest>> {
    let result: Option<(String, String)> = conn.blpop(regrade_queue_name(), timeout_seconds).await?;

    match result {
        Some((_key, payload)) => {
            let request = serde_json::from_str(&payload).map_err(serialization_error)?;
            Ok(Some(request))
        }
        None => Ok(None),
    }
}

pub async fn store_regrade_result(
    conn: &mut redis::aio::ConnectionManager,
    result: &RegradeResult,
) -> RedisResult<()> {
    let key = regrade_result_key(&result.request_id);
    let payload = serde_json::to_string(result).map_err(serialization_error)?;
    conn.set_ex(&key, payload, RESULT_TTL_SECS).await
}

pub async fn get_regrade_result(
    conn: &mut redis::aio::ConnectionManager,
    request_id: &uuid::Uuid,
) -> RedisResult<Option<RegradeResult>> {
    let payload: Option<String> = conn.get(regrade_result_key(request_id)).await?;

    match payload {
        Some(data) => Ok(Some(serde_json::from_str(&data).map_err(serialization_error)?)),
        None => Ok(None),
    }
}
