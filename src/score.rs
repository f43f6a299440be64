use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::models::{RawPosting, Reasoning, ScoreResult};

pub const DEFAULT_SCORER_URL: &str = "http://localhost:11434";
pub const DEFAULT_MODEL: &str = "llama-3.2-3b-instruct";

/// External scoring capability. One implementation per transport; each
/// worker holds its own long-lived instance.
pub trait Scorer: Send {
    fn score(&self, posting: &RawPosting, cv: &str, preferences: &str) -> Result<ScoreResult>;
}

/// Fixed score used when no candidate profile has been captured. Every
/// criterion gets 80 and the reasoning is explicitly flagged, so default
/// rows are distinguishable from real assessments.
pub fn missing_profile_score() -> ScoreResult {
    ScoreResult {
        skillset: 80,
        academic: 80,
        experience: 80,
        professional: 80,
        language: 80,
        preference: 80,
        overall: 80,
        reasoning: Reasoning {
            strengths: "Not evaluated".to_string(),
            concerns: "Not evaluated".to_string(),
            summary: "Default score - no candidate profile available.".to_string(),
        },
    }
}

const SYSTEM_PROMPT: &str = "\
Your task is to rate how well job postings fit a provided CV and preference statement.
Your rating scale is:
0 = Critical mismatch, 25 = Poor match, 50 = Acceptable, 75 = Good match, 100 = Excellent match
Make small adjustments of +/-5-10 points if needed

THE CRITERIA:
1. Skillset Match: Does the applicant possess the required technical/soft skills,
or could they acquire them quickly given their background?

2. Academic Requirements: Are degree requirements, field of study, and grade
thresholds (if specified) met?

3. Experience Level: Is the applicant appropriately qualified (not under or
over-qualified) for the seniority level?

4. Professional Experience: Does the applicant have relevant industry/domain
experience and comparable role experience?

5. Language Requirements: What languages does the applicant speak? What languages are required by the job posting?
Can they read the job description?

6. Preference Alignment: Does the role, company, location, and work style match
the applicant's stated preferences?

7. Overall Assessment: Considering all factors, how successful and satisfied
would the applicant likely be in this role?

Respond with a JSON object with integer fields skillset, academic, experience,
professional, language, preference, overall (each 0-100) and a reasoning object
with string fields strengths, concerns, summary.";

#[derive(Debug, Serialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    format_type: String,
}

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    temperature: f32,
    response_format: ResponseFormat,
}

#[derive(Debug, Deserialize)]
struct ChatResponseMessage {
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

/// Client for an OpenAI-compatible completion endpoint (llama.cpp, Ollama
/// and friends). Constructed once per worker and reused for every posting
/// so connection setup is amortized across the run.
pub struct HttpScorer {
    client: reqwest::blocking::Client,
    base_url: String,
    model: String,
}

impl HttpScorer {
    pub fn new(base_url: &str, model: &str) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(300))
            .build()
            .context("Failed to build scoring HTTP client")?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
        })
    }
}

impl Scorer for HttpScorer {
    fn score(&self, posting: &RawPosting, cv: &str, preferences: &str) -> Result<ScoreResult> {
        let request = ChatRequest {
            model: self.model.clone(),
            messages: vec![
                ChatMessage {
                    role: "system".to_string(),
                    content: SYSTEM_PROMPT.to_string(),
                },
                ChatMessage {
                    role: "user".to_string(),
                    content: build_user_message(posting, cv, preferences),
                },
            ],
            temperature: 0.0,
            response_format: ResponseFormat {
                format_type: "json_object".to_string(),
            },
        };

        let response = self
            .client
            .post(format!("{}/v1/chat/completions", self.base_url))
            .header("Authorization", "Bearer dummy-key")
            .json(&request)
            .send()
            .context("Failed to send request to scoring endpoint")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().unwrap_or_default();
            return Err(anyhow!("Scoring request failed with status {status}: {body}"));
        }

        let parsed: ChatResponse = response
            .json()
            .context("Failed to parse scoring endpoint response")?;
        let content = parsed
            .choices
            .first()
            .map(|choice| choice.message.content.as_str())
            .ok_or_else(|| anyhow!("No choices in scoring response"))?;

        parse_score(content)
    }
}

fn build_user_message(posting: &RawPosting, cv: &str, preferences: &str) -> String {
    format!(
        "# CV:\n{cv}\n\n# PREFERENCES:\n{preferences}\n\n# JOB DETAILS\nTITLE: {}\nCOMPANY: {}\nDESCRIPTION: {}",
        posting.title, posting.company, posting.description
    )
}

/// Parse the model's JSON answer. Tolerates markdown code fences and
/// leading prose, which smaller models produce even in JSON mode.
pub fn parse_score(content: &str) -> Result<ScoreResult> {
    let start = content
        .find('{')
        .ok_or_else(|| anyhow!("No JSON object in scoring response"))?;
    let end = content
        .rfind('}')
        .ok_or_else(|| anyhow!("Unterminated JSON object in scoring response"))?;
    if end < start {
        return Err(anyhow!("Malformed JSON object in scoring response"));
    }
    serde_json::from_str(&content[start..=end]).context("Scoring response did not match the expected schema")
}
