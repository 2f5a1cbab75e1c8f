use crate::store::{latest_since, select_users, SubmissionStore, KNOWN_ROLES};
use anyhow::{bail, Context};
use async_trait::async_trait;
use autograder_common::redis::{course_users_key, submissions_key};
use autograder_common::types::{Assignment, GradingTarget, SubmissionHistoryItem, SubmissionRecord};
use base64::{engine::general_purpose, Engine as _};
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Wire form of a submission record. The archive travels base64 encoded so
/// the whole record stays a single JSON string per list entry.
#[derive(Serialize, Deserialize)]
struct StoredRecord {
    #[serde(flatten)]
    record: SubmissionRecord,
    input_files: String,
}

impl StoredRecord {
    fn encode(record: SubmissionRecord) -> anyhow::Result<String> {
        let input_files = general_purpose::STANDARD.encode(&record.input_files_gzip);
        Ok(serde_json::to_string(&StoredRecord { record, input_files })?)
    }

    fn decode(payload: &str) -> anyhow::Result<SubmissionRecord> {
        let stored: StoredRecord =
            serde_json::from_str(payload).context("Malformed stored submission")?;
        let mut record = stored.record;
        record.input_files_gzip = general_purpose::STANDARD
            .decode(stored.input_files)
            .context("Malformed submission archive encoding")?;
        Ok(record)
    }
}

/// Redis-backed store. One list per grading target, oldest submission first,
/// plus one hash per course mapping user to role.
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
}

impl RedisStore {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }

    pub async fn connect(redis_url: &str) -> anyhow::Result<Self> {
        let client = redis::Client::open(redis_url).context("Invalid Redis URL")?;
        let conn = ConnectionManager::new(client)
            .await
            .context("Failed to connect to Redis")?;
        Ok(Self::new(conn))
    }

    async fn load_records(&self, target: &GradingTarget) -> anyhow::Result<Vec<SubmissionRecord>> {
        let mut conn = self.conn.clone();
        let payloads: Vec<String> = conn.lrange(submissions_key(target), 0, -1).await?;
        payloads.iter().map(|p| StoredRecord::decode(p)).collect()
    }
}

#[async_trait]
impl SubmissionStore for RedisStore {
    async fn get_most_recent_submission(
        &self,
        target: &GradingTarget,
    ) -> anyhow::Result<Option<SubmissionRecord>> {
        let mut conn = self.conn.clone();
        let payload: Option<String> = conn.lindex(submissions_key(target), -1).await?;
        payload.map(|p| StoredRecord::decode(&p)).transpose()
    }

    async fn get_recent_submission_survey(
        &self,
        assignment: &Assignment,
        users: &[String],
        after: DateTime<Utc>,
    ) -> anyhow::Result<HashMap<String, Option<SubmissionHistoryItem>>> {
        let mut survey = HashMap::new();
        for user in users {
            let records = self.load_records(&assignment.target(user)).await?;
            if let Some(item) = latest_since(&records, after) {
                survey.insert(user.clone(), Some(item));
            }
        }
        Ok(survey)
    }

    async fn save_submission(&self, record: SubmissionRecord) -> anyhow::Result<()> {
        let target = GradingTarget::new(
            &record.info.course_id,
            &record.info.assignment_id,
            &record.info.user,
        );
        let payload = StoredRecord::encode(record)?;

        let mut conn = self.conn.clone();
        let _: () = conn.rpush(submissions_key(&target), payload).await?;
        Ok(())
    }

    async fn get_submission_times_since(
        &self,
        target: &GradingTarget,
        since: DateTime<Utc>,
    ) -> anyhow::Result<Vec<DateTime<Utc>>> {
        let mut times: Vec<_> = self
            .load_records(target)
            .await?
            .into_iter()
            .map(|r| r.info.grading_start_time)
            .filter(|t| *t >= since)
            .collect();
        times.sort();
        Ok(times)
    }

    async fn resolve_course_users(
        &self,
        course: &str,
        selectors: &[String],
    ) -> anyhow::Result<Vec<String>> {
        let mut conn = self.conn.clone();
        let roster: HashMap<String, String> = conn.hgetall(course_users_key(course)).await?;
        Ok(select_users(&roster, selectors))
    }

    async fn set_course_user(&self, course: &str, user: &str, role: &str) -> anyhow::Result<()> {
        if !KNOWN_ROLES.contains(&role) {
            bail!("Unknown course role '{}'", role);
        }

        let mut conn = self.conn.clone();
        let _: () = conn.hset(course_users_key(course), user, role).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use autograder_common::types::{GradingInfo, SubmissionSummary};

    #[test]
    fn test_stored_record_keeps_archive() {
        let now = Utc::now();
        let info = GradingInfo {
            id: "course101::hw0::alice::1".to_string(),
            short_id: "1".to_string(),
            course_id: "course101".to_string(),
            assignment_id: "hw0".to_string(),
            user: "alice".to_string(),
            message: "msg".to_string(),
            max_points: 2.0,
            score: 1.0,
            grading_start_time: now,
            grading_end_time: now,
            proxy_user: Some("admin@test.com".to_string()),
        };
        let record = SubmissionRecord {
            summary: SubmissionSummary {
                id: info.id.clone(),
                message: "msg".to_string(),
                max_points: 2.0,
                score: 1.0,
                question_count: 2,
            },
            info,
            input_files_gzip: vec![0x1f, 0x8b, 0, 255],
            recorded_at: now,
        };

        let payload = StoredRecord::encode(record.clone()).unwrap();
        assert!(payload.contains("\"input_files\""));
        assert_eq!(StoredRecord::decode(&payload).unwrap(), record);
    }

    #[test]
    fn test_stored_record_rejects_bad_archive() {
        let payload = r#"{"info": {}, "input_files": "***"}"#;
        assert!(StoredRecord::decode(payload).is_err());
    }
}
