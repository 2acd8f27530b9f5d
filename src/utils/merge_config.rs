// src/utils/merge_config.rs
use log::info;
use std::env;
use std::str::FromStr;

/// Category sentinels, worker/polling knobs and pool sizes, read from the
/// environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeConfig {
    /// Category a record has before anyone triaged it.
    pub unset_category: String,
    /// Category written onto a duplicate once it has been merged away.
    pub merged_category: String,
    pub poll_attempts: u32,
    pub poll_delay_ms: u64,
    pub worker_batch_size: usize,
    pub worker_idle_secs: u64,
    /// A `processing` job claimed longer ago than this is considered
    /// abandoned and may be reclaimed or resubmitted.
    pub claim_timeout_secs: u64,
    /// Attempts for recording a job's final state after the merge ran.
    pub write_retry_attempts: u32,
    pub write_retry_delay_ms: u64,
    pub db_pool_max_size: u32,
    pub db_pool_min_idle: u32,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            unset_category: "Inbox".to_string(),
            merged_category: "Skip".to_string(),
            poll_attempts: 5,
            poll_delay_ms: 2000,
            worker_batch_size: 20,
            worker_idle_secs: 5,
            claim_timeout_secs: 600,
            write_retry_attempts: 3,
            write_retry_delay_ms: 500,
            db_pool_max_size: 16,
            db_pool_min_idle: 1,
        }
    }
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn env_text_or(key: &str, default: String) -> String {
    env::var(key)
        .ok()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or(default)
}

impl MergeConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            unset_category: env_text_or("MERGE_UNSET_CATEGORY", defaults.unset_category),
            merged_category: env_text_or("MERGE_MERGED_CATEGORY", defaults.merged_category),
            poll_attempts: env_or("MERGE_POLL_ATTEMPTS", defaults.poll_attempts),
            poll_delay_ms: env_or("MERGE_POLL_DELAY_MS", defaults.poll_delay_ms),
            worker_batch_size: env_or("MERGE_WORKER_BATCH_SIZE", defaults.worker_batch_size),
            worker_idle_secs: env_or("MERGE_WORKER_IDLE_SECS", defaults.worker_idle_secs),
            claim_timeout_secs: env_or("MERGE_CLAIM_TIMEOUT_SECS", defaults.claim_timeout_secs),
            write_retry_attempts: env_or(
                "MERGE_WRITE_RETRY_ATTEMPTS",
                defaults.write_retry_attempts,
            ),
            write_retry_delay_ms: env_or(
                "MERGE_WRITE_RETRY_DELAY_MS",
                defaults.write_retry_delay_ms,
            ),
            db_pool_max_size: env_or("DB_POOL_MAX_SIZE", defaults.db_pool_max_size),
            db_pool_min_idle: env_or("DB_POOL_MIN_IDLE", defaults.db_pool_min_idle),
        }
    }

    pub fn log_config(&self) {
        info!("Merge configuration:");
        info!("  Unset category: '{}'", self.unset_category);
        info!("  Merged category: '{}'", self.merged_category);
        info!(
            "  Job polling: {} attempts every {}ms",
            self.poll_attempts, self.poll_delay_ms
        );
        info!(
            "  Worker: batch size {}, idle {}s, claim timeout {}s",
            self.worker_batch_size, self.worker_idle_secs, self.claim_timeout_secs
        );
        info!(
            "  Final-state writes: {} attempts every {}ms",
            self.write_retry_attempts, self.write_retry_delay_ms
        );
        info!(
            "  DB pool: max {}, min idle {}",
            self.db_pool_max_size, self.db_pool_min_idle
        );
    }

    pub fn is_unset_category(&self, category: &str) -> bool {
        category.trim().eq_ignore_ascii_case(&self.unset_category)
    }

    pub fn is_merged_category(&self, category: &str) -> bool {
        category.trim().eq_ignore_ascii_case(&self.merged_category)
    }

    pub fn claim_timeout(&self) -> chrono::Duration {
        let secs = i64::try_from(self.claim_timeout_secs)
            .unwrap_or(i64::MAX)
            .min(i64::MAX / 1000 - 1);
        chrono::Duration::seconds(secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_sentinels() {
        let config = MergeConfig::default();
        assert!(config.is_unset_category("inbox"));
        assert!(config.is_merged_category(" Skip "));
        assert!(!config.is_merged_category("Inbox"));
        assert_eq!(config.poll_attempts, 5);
        assert_eq!(config.poll_delay_ms, 2000);
    }

    #[test]
    fn test_claim_timeout() {
        let config = MergeConfig {
            claim_timeout_secs: 90,
            ..MergeConfig::default()
        };
        assert_eq!(config.claim_timeout(), chrono::Duration::seconds(90));
    }
}
