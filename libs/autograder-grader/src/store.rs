//! Submission storage.
//!
//! The grader and the regrade driver only see [`SubmissionStore`]. The worker
//! wires in [`RedisStore`](crate::redis_store::RedisStore); tests and the CLI
//! use [`MemoryStore`].

use async_trait::async_trait;
use autograder_common::types::{Assignment, GradingTarget, SubmissionHistoryItem, SubmissionRecord};
use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, HashMap};
use std::sync::{PoisonError, RwLock};

/// Selector that matches every user enrolled in a course
pub const ALL_USERS: &str = "*";

pub const KNOWN_ROLES: &[&str] = &["owner", "admin", "grader", "student", "other"];

#[async_trait]
pub trait SubmissionStore: Send + Sync {
    /// Latest graded submission for the target, archive included
    async fn get_most_recent_submission(
        &self,
        target: &GradingTarget,
    ) -> anyhow::Result<Option<SubmissionRecord>>;

    /// For each user, their latest submission recorded at or after `after`.
    /// Users without such a submission are absent from the map.
    async fn get_recent_submission_survey(
        &self,
        assignment: &Assignment,
        users: &[String],
        after: DateTime<Utc>,
    ) -> anyhow::Result<HashMap<String, Option<SubmissionHistoryItem>>>;

    async fn save_submission(&self, record: SubmissionRecord) -> anyhow::Result<()>;

    /// Grading start times of the target's submissions since `since`, oldest first
    async fn get_submission_times_since(
        &self,
        target: &GradingTarget,
        since: DateTime<Utc>,
    ) -> anyhow::Result<Vec<DateTime<Utc>>>;

    /// Expand role names, emails and `*` into a sorted, de-duplicated list of
    /// enrolled users. Emails not enrolled in the course are dropped.
    async fn resolve_course_users(
        &self,
        course: &str,
        selectors: &[String],
    ) -> anyhow::Result<Vec<String>>;

    async fn set_course_user(&self, course: &str, user: &str, role: &str) -> anyhow::Result<()>;
}

/// Shared selector expansion over a user -> role map
pub(crate) fn select_users(roster: &HashMap<String, String>, selectors: &[String]) -> Vec<String> {
    let mut selected = BTreeSet::new();

    for selector in selectors {
        let selector = selector.trim();
        if selector == ALL_USERS {
            selected.extend(roster.keys().cloned());
        } else if KNOWN_ROLES.contains(&selector) {
            selected.extend(
                roster
                    .iter()
                    .filter(|(_, role)| role.as_str() == selector)
                    .map(|(user, _)| user.clone()),
            );
        } else if roster.contains_key(selector) {
            selected.insert(selector.to_string());
        }
    }

    selected.into_iter().collect()
}

pub(crate) fn latest_since(
    records: &[SubmissionRecord],
    after: DateTime<Utc>,
) -> Option<SubmissionHistoryItem> {
    records
        .iter()
        .filter(|r| r.recorded_at >= after)
        .max_by_key(|r| r.recorded_at)
        .map(|r| r.info.to_history_item())
}

/// Process-local store
#[derive(Debug, Default)]
pub struct MemoryStore {
    submissions: RwLock<HashMap<GradingTarget, Vec<SubmissionRecord>>>,
    course_users: RwLock<HashMap<String, HashMap<String, String>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn submission_count(&self, target: &GradingTarget) -> usize {
        self.submissions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(target)
            .map_or(0, Vec::len)
    }
}

#[async_trait]
impl SubmissionStore for MemoryStore {
    async fn get_most_recent_submission(
        &self,
        target: &GradingTarget,
    ) -> anyhow::Result<Option<SubmissionRecord>> {
        let submissions = self.submissions.read().unwrap_or_else(PoisonError::into_inner);
        Ok(submissions.get(target).and_then(|records| records.last().cloned()))
    }

    async fn get_recent_submission_survey(
        &self,
        assignment: &Assignment,
        users: &[String],
        after: DateTime<Utc>,
    ) -> anyhow::Result<HashMap<String, Option<SubmissionHistoryItem>>> {
        let submissions = self.submissions.read().unwrap_or_else(PoisonError::into_inner);

        let mut survey = HashMap::new();
        for user in users {
            let item = submissions
                .get(&assignment.target(user))
                .and_then(|records| latest_since(records, after));
            if let Some(item) = item {
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
        self.submissions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(target)
            .or_default()
            .push(record);
        Ok(())
    }

    async fn get_submission_times_since(
        &self,
        target: &GradingTarget,
        since: DateTime<Utc>,
    ) -> anyhow::Result<Vec<DateTime<Utc>>> {
        let submissions = self.submissions.read().unwrap_or_else(PoisonError::into_inner);
        let mut times: Vec<_> = submissions
            .get(target)
            .map(|records| {
                records
                    .iter()
                    .map(|r| r.info.grading_start_time)
                    .filter(|t| *t >= since)
                    .collect()
            })
            .unwrap_or_default();
        times.sort();
        Ok(times)
    }

    async fn resolve_course_users(
        &self,
        course: &str,
        selectors: &[String],
    ) -> anyhow::Result<Vec<String>> {
        let course_users = self.course_users.read().unwrap_or_else(PoisonError::into_inner);
        Ok(course_users
            .get(course)
            .map(|roster| select_users(roster, selectors))
            .unwrap_or_default())
    }

    async fn set_course_user(&self, course: &str, user: &str, role: &str) -> anyhow::Result<()> {
        if !KNOWN_ROLES.contains(&role) {
            anyhow::bail!("Unknown course role '{}'", role);
        }

        self.course_users
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(course.to_string())
            .or_default()
            .insert(user.to_string(), role.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use autograder_common::types::{GradingInfo, SubmissionSummary};
    use chrono::Duration;

    fn assignment() -> Assignment {
        serde_json::from_str(r#"{"id": "hw0", "course_id": "course101", "image": "img"}"#).unwrap()
    }

    fn record(user: &str, short_id: &str, at: DateTime<Utc>) -> SubmissionRecord {
        let info = GradingInfo {
            id: format!("course101::hw0::{}::{}", user, short_id),
            short_id: short_id.to_string(),
            course_id: "course101".to_string(),
            assignment_id: "hw0".to_string(),
            user: user.to_string(),
            message: String::new(),
            max_points: 1.0,
            score: 1.0,
            grading_start_time: at,
            grading_end_time: at,
            proxy_user: None,
        };
        SubmissionRecord {
            summary: SubmissionSummary {
                id: info.id.clone(),
                message: String::new(),
                max_points: 1.0,
                score: 1.0,
                question_count: 1,
            },
            info,
            input_files_gzip: vec![1, 2, 3],
            recorded_at: at,
        }
    }

    #[tokio::test]
    async fn test_most_recent_submission() {
        let store = MemoryStore::new();
        let target = assignment().target("alice");
        assert!(store.get_most_recent_submission(&target).await.unwrap().is_none());

        let now = Utc::now();
        store.save_submission(record("alice", "1", now - Duration::minutes(5))).await.unwrap();
        store.save_submission(record("alice", "2", now)).await.unwrap();

        let latest = store.get_most_recent_submission(&target).await.unwrap().unwrap();
        assert_eq!(latest.info.short_id, "2");
        assert_eq!(latest.input_files_gzip, vec![1, 2, 3]);
        assert_eq!(store.submission_count(&target), 2);
    }

    #[tokio::test]
    async fn test_survey_honors_after() {
        let store = MemoryStore::new();
        let now = Utc::now();
        store.save_submission(record("alice", "old", now - Duration::hours(2))).await.unwrap();
        store.save_submission(record("bob", "new", now)).await.unwrap();

        let users = vec!["alice".to_string(), "bob".to_string(), "carol".to_string()];
        let survey = store
            .get_recent_submission_survey(&assignment(), &users, now - Duration::hours(1))
            .await
            .unwrap();

        assert_eq!(survey.len(), 1);
        assert_eq!(survey["bob"].as_ref().unwrap().short_id, "new");
    }

    #[tokio::test]
    async fn test_submission_times_window() {
        let store = MemoryStore::new();
        let now = Utc::now();
        for minutes in [30, 20, 10] {
            store
                .save_submission(record("alice", &minutes.to_string(), now - Duration::minutes(minutes)))
                .await
                .unwrap();
        }

        let times = store
            .get_submission_times_since(&assignment().target("alice"), now - Duration::minutes(25))
            .await
            .unwrap();
        assert_eq!(times, vec![now - Duration::minutes(20), now - Duration::minutes(10)]);
    }

    #[tokio::test]
    async fn test_resolve_course_users() {
        let store = MemoryStore::new();
        store.set_course_user("course101", "student@test.com", "student").await.unwrap();
        store.set_course_user("course101", "other@test.com", "student").await.unwrap();
        store.set_course_user("course101", "admin@test.com", "admin").await.unwrap();
        store.set_course_user("course202", "elsewhere@test.com", "student").await.unwrap();
        assert!(store.set_course_user("course101", "x@test.com", "wizard").await.is_err());

        let students = store
            .resolve_course_users("course101", &["student".to_string()])
            .await
            .unwrap();
        assert_eq!(students, vec!["other@test.com", "student@test.com"]);

        let mixed = store
            .resolve_course_users(
                "course101",
                &["admin@test.com".to_string(), "nobody@test.com".to_string(), "admin".to_string()],
            )
            .await
            .unwrap();
        assert_eq!(mixed, vec!["admin@test.com"]);

        let everyone = store.resolve_course_users("course101", &[ALL_USERS.to_string()]).await.unwrap();
        assert_eq!(everyone.len(), 3);

        assert!(store.resolve_course_users("missing", &[ALL_USERS.to_string()]).await.unwrap().is_empty());
    }
}
