// src/utils/logging.rs - Logging helpers for search and merge operations
use log::{info, warn};
use std::time::Instant;

use crate::models::matching::MatchReason;

/// What a `MergeLogger` is reporting on; picks the bracketed prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOperation {
    Search(MatchReason),
    Plan,
    Submit,
    Execute,
    Worker,
    Scan,
}

#[derive(Clone)]
pub struct MergeLogger {
    operation_name: &'static str,
    operation_emoji: &'static str,
    start_time: Instant,
}

impl MergeLogger {
    pub fn new(operation: MergeOperation) -> Self {
        let (operation_name, operation_emoji) = match operation {
            MergeOperation::Search(MatchReason::NameSimilarity) => ("NAME", "👤"),
            MergeOperation::Search(MatchReason::SharedEmail) => ("EMAIL", "📧"),
            MergeOperation::Search(MatchReason::SharedPhone) => ("PHONE", "📞"),
            MergeOperation::Search(MatchReason::SharedLinkedin) => ("LINKEDIN", "🔗"),
            MergeOperation::Search(MatchReason::SharedWebsite) => ("WEBSITE", "🌐"),
            MergeOperation::Search(MatchReason::SharedDomain) => ("DOMAIN", "🌐"),
            MergeOperation::Plan => ("PLAN", "📝"),
            MergeOperation::Submit => ("SUBMIT", "📨"),
            MergeOperation::Execute => ("MERGE", "🔀"),
            MergeOperation::Worker => ("WORKER", "⚙️"),
            MergeOperation::Scan => ("SCAN", "🔍"),
        };

        Self {
            operation_name,
            operation_emoji,
            start_time: Instant::now(),
        }
    }

    pub fn log_start(&self, subject: &str) {
        info!(
            "[{}] {} 🚀 Starting {} for {}",
            self.operation_name,
            self.operation_emoji,
            self.operation_name.to_lowercase(),
            subject
        );
    }

    pub fn log_phase(&self, phase: &str, details: Option<&str>) {
        let elapsed = self.start_time.elapsed();
        let msg = if let Some(details) = details {
            format!(
                "[{}] {} 🔄 Phase: {} - {} [+{:.1}s]",
                self.operation_name,
                self.operation_emoji,
                phase,
                details,
                elapsed.as_secs_f32()
            )
        } else {
            format!(
                "[{}] {} 🔄 Phase: {} [+{:.1}s]",
                self.operation_name,
                self.operation_emoji,
                phase,
                elapsed.as_secs_f32()
            )
        };
        info!("{}", msg);
    }

    pub fn log_data_loaded(&self, count: usize, data_type: &str) {
        info!(
            "[{}] {} 📊 Found {} {} records",
            self.operation_name, self.operation_emoji, count, data_type
        );
    }

    pub fn log_filtering_results(&self, fetched: usize, kept: usize) {
        let percent_kept = if fetched > 0 {
            (kept as f64 / fetched as f64) * 100.0
        } else {
            0.0
        };
        info!(
            "[{}] {} 🎯 Candidate filtering: {} fetched → {} kept ({:.1}% kept)",
            self.operation_name, self.operation_emoji, fetched, kept, percent_kept
        );
    }

    pub fn log_relation_applied(&self, relation: &str, added: usize, removed: usize) {
        info!(
            "[{}] {} 🔗 {}: +{} / -{} associations",
            self.operation_name, self.operation_emoji, relation, added, removed
        );
    }

    pub fn log_completion(&self, summary: &str) {
        let duration = self.start_time.elapsed();
        info!(
            "[{}] {} ✅ COMPLETED: {} in {:.2?}",
            self.operation_name, self.operation_emoji, summary, duration
        );
    }

    pub fn log_warning(&self, message: &str) {
        warn!(
            "[{}] {} ⚠️  {}",
            self.operation_name, self.operation_emoji, message
        );
    }

    pub fn log_error(&self, message: &str) {
        log::error!(
            "[{}] {} ❌ {}",
            self.operation_name, self.operation_emoji, message
        );
    }
}
