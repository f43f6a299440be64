use serde::{Deserialize, Serialize};

/// Placeholder used when a field could not be extracted from a posting.
pub const UNAVAILABLE: &str = "Not Available";

/// A saved search configuration (`is_template` true) or a point-in-time
/// run derived from one (`is_template` false). Multi-valued filters are
/// stored comma-separated, mirroring the columns.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchTemplate {
    pub id: i64,
    pub keywords: String,
    pub locations: String,
    pub distance_km: Option<u32>,
    pub date_posted: Option<String>, // "past month", "past week", "past 24 hours"
    pub exp_level: Option<String>,
    pub job_type: Option<String>,
    pub pages: u32,
    pub is_template: bool,
    pub last_run: Option<String>,
    pub created_at: String,
}

impl SearchTemplate {
    pub fn locations(&self) -> Vec<String> {
        split_csv(&self.locations)
    }

    pub fn exp_levels(&self) -> Vec<String> {
        self.exp_level.as_deref().map(split_csv).unwrap_or_default()
    }

    pub fn job_types(&self) -> Vec<String> {
        self.job_type.as_deref().map(split_csv).unwrap_or_default()
    }
}

fn split_csv(s: &str) -> Vec<String> {
    s.split(',')
        .map(|part| part.trim().to_string())
        .filter(|part| !part.is_empty())
        .collect()
}

/// One job listing as discovered from the source, before scoring.
/// Items without a resolvable application link are discarded upstream,
/// so the link is always present here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawPosting {
    pub title: String,
    pub company: String,
    pub location: String,
    pub description: String,
    pub application_link: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reasoning {
    pub strengths: String,
    pub concerns: String,
    pub summary: String,
}

/// Per-criterion suitability scores (0-100) plus structured reasoning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScoreResult {
    pub skillset: u8,
    pub academic: u8,
    pub experience: u8,
    pub professional: u8,
    pub language: u8,
    pub preference: u8,
    pub overall: u8,
    pub reasoning: Reasoning,
}

/// A scored posting as stored in the database. `application_link` is
/// unique across the whole store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedJob {
    pub id: i64,
    pub title: String,
    pub company: String,
    pub location: String,
    pub description: String,
    pub application_link: String,
    pub matching_score: f64,
    pub score_details: Option<String>,
    pub search_run_id: Option<i64>,
    pub scraped_at: String,
}

/// The candidate's CV and preference statement. Read-only for the
/// duration of a run; each worker loads it once at startup.
#[derive(Debug, Clone, Default)]
pub struct CandidateProfile {
    pub cv_text: String,
    pub preferences_text: String,
}

impl CandidateProfile {
    pub fn is_empty(&self) -> bool {
        self.cv_text.trim().is_empty() || self.preferences_text.trim().is_empty()
    }
}
