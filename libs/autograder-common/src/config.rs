use std::env;
use std::path::PathBuf;

/// Application configuration
/// Provides defaults with environment variable overrides
#[derive(Debug, Clone)]
pub struct Config {
    pub redis_url: String,
    pub work_dir: PathBuf,
    pub temp_dir: PathBuf,
    /// Upper bound on concurrent sandbox runs inside one course regrade
    pub regrade_course_pool_size: usize,
    /// Grade with a direct child process instead of a container
    pub docker_disable: bool,
    /// Stage submissions in throwaway temp dirs instead of the work dir
    pub no_store: bool,
    /// Keep temp dirs around for inspection
    pub debug: bool,
    pub grading_timeout_ms: u64,
    pub max_output_bytes: usize,
    pub queue_timeout_secs: f64,
}

impl Config {
    pub fn from_env() -> Self {
        let work_dir = env::var("WORK_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/tmp/autograder"));

        let temp_dir = env::var("TEMP_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| work_dir.join("temp"));

        Self {
            redis_url: env::var("REDIS_URL")
                .unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string()),
            work_dir,
            temp_dir,
            regrade_course_pool_size: parse_var("REGRADE_COURSE_POOL_SIZE").unwrap_or(2),
            docker_disable: flag("DOCKER_DISABLE"),
            no_store: flag("NO_STORE"),
            debug: flag("DEBUG"),
            grading_timeout_ms: parse_var("GRADING_TIMEOUT_MS").unwrap_or(60_000),
            max_output_bytes: parse_var("MAX_OUTPUT_BYTES").unwrap_or(1024 * 1024),
            queue_timeout_secs: parse_var("WORKER_QUEUE_TIMEOUT_SECS").unwrap_or(5.0),
        }
    }

    pub fn new() -> Self {
        Self::from_env()
    }

    /// Root of the persistent submission directories
    pub fn submissions_dir(&self) -> PathBuf {
        self.work_dir.join("submissions")
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_var<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

fn flag(key: &str) -> bool {
    env::var(key)
        .map(|v| matches!(v.trim().to_lowercase().as_str(), "1" | "true" | "yes"))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = Config::default();
        assert!(config.regrade_course_pool_size >= 1 || env::var("REGRADE_COURSE_POOL_SIZE").is_ok());
        assert!(config.temp_dir.starts_with(&config.work_dir) || env::var("TEMP_DIR").is_ok());
        assert_eq!(config.submissions_dir(), config.work_dir.join("submissions"));
    }

    #[test]
    fn test_flag_parsing() {
        assert!(!flag("AUTOGRADER_TEST_FLAG_THAT_IS_NEVER_SET"));
        assert_eq!(parse_var::<u64>("AUTOGRADER_TEST_VAR_THAT_IS_NEVER_SET"), None);
    }
}
