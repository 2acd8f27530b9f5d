// src/models/matching.rs
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::MergeError;
use crate::models::core::Entity;

/// Why a record was proposed as a duplicate. Doubles as the search strategy
/// a caller asks the candidate finder to run.
///
/// Name, email and phone are the interactive strategies. LinkedIn, website
/// and domain are exact-identifier lookups used mostly by bulk scans.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchReason {
    NameSimilarity,
    SharedEmail,
    SharedPhone,
    SharedLinkedin,
    /// Companies only.
    SharedWebsite,
    /// Companies only; compares `company_domains` rows.
    SharedDomain,
}

pub type SearchStrategy = MatchReason;

impl MatchReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            MatchReason::NameSimilarity => "name_similarity",
            MatchReason::SharedEmail => "shared_email",
            MatchReason::SharedPhone => "shared_phone",
            MatchReason::SharedLinkedin => "shared_linkedin",
            MatchReason::SharedWebsite => "shared_website",
            MatchReason::SharedDomain => "shared_domain",
        }
    }
}

impl fmt::Display for MatchReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MatchReason {
    type Err = MergeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "name" | "name_similarity" => Ok(MatchReason::NameSimilarity),
            "email" | "shared_email" => Ok(MatchReason::SharedEmail),
            "phone" | "mobile" | "shared_phone" => Ok(MatchReason::SharedPhone),
            "linkedin" | "shared_linkedin" => Ok(MatchReason::SharedLinkedin),
            "website" | "shared_website" => Ok(MatchReason::SharedWebsite),
            "domain" | "shared_domain" => Ok(MatchReason::SharedDomain),
            other => Err(MergeError::ValidationError(format!(
                "unknown search strategy '{}'",
                other
            ))),
        }
    }
}

/// A possible duplicate of a source entity. Never persisted.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Candidate {
    pub entity: Entity,
    pub reason: MatchReason,
    /// Name similarity in [0, 1]; 1.0 for every exact-value match.
    pub score: f64,
    /// The shared value (email, phone, URL, domain) that produced the match.
    pub matched_value: Option<String>,
}

impl Candidate {
    pub fn by_name(entity: Entity, score: f64) -> Self {
        Self {
            entity,
            reason: MatchReason::NameSimilarity,
            score,
            matched_value: None,
        }
    }

    pub fn by_contact_point(entity: Entity, reason: MatchReason, value: String) -> Self {
        Self {
            entity,
            reason,
            score: 1.0,
            matched_value: Some(value),
        }
    }
}
