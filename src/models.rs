use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use crate::error::{PipelineError, Result};

/// Input for a new search. Validated by `Store::create_search`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SearchParams {
    pub keyword: String,
    pub location: String,
    pub experience_min: Option<f64>,
    pub experience_max: Option<f64>,
    pub job_type: Option<String>,
}

impl SearchParams {
    pub fn new(keyword: impl Into<String>, location: impl Into<String>) -> Self {
        Self {
            keyword: keyword.into(),
            location: location.into(),
            ..Default::default()
        }
    }

    pub fn with_experience(mut self, min: Option<f64>, max: Option<f64>) -> Self {
        self.experience_min = min;
        self.experience_max = max;
        self
    }

    pub fn with_job_type(mut self, job_type: impl Into<String>) -> Self {
        self.job_type = Some(job_type.into());
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.keyword.trim().is_empty() {
            return Err(PipelineError::Validation("keyword must not be empty".into()));
        }
        if self.location.trim().is_empty() {
            return Err(PipelineError::Validation("location must not be empty".into()));
        }
        for (label, bound) in [("minimum", self.experience_min), ("maximum", self.experience_max)] {
            if let Some(value) = bound {
                if !value.is_finite() || value < 0.0 {
                    return Err(PipelineError::Validation(format!(
                        "{} experience must be a non-negative number, got {}",
                        label, value
                    )));
                }
            }
        }
        if let (Some(min), Some(max)) = (self.experience_min, self.experience_max) {
            if min > max {
                return Err(PipelineError::Validation(format!(
                    "minimum experience {} exceeds maximum {}",
                    min, max
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchQuery {
    pub id: i64,
    pub keyword: String,
    pub location: String,
    pub experience_min: Option<f64>,
    pub experience_max: Option<f64>,
    pub job_type: Option<String>,
    pub next_page: u32, // pagination cursor
    pub closed: bool,
    pub created_at: String,
}

/// One candidate as seen on the portal. Every field but `name` may be absent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CandidateRecord {
    pub source_id: Option<String>,
    pub name: String,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub experience_years: Option<f64>,
    pub current_company: Option<String>,
    pub current_designation: Option<String>,
    pub skills: BTreeSet<String>,
    pub location: Option<String>,
    pub profile_url: Option<String>,
    pub salary: Option<String>,
    pub posted_date: Option<String>,
}

impl CandidateRecord {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Key deciding whether two sightings are the same person within a search.
    ///
    /// Portal id first, then the normalized email, then phone digits, then
    /// name and company for records that carry no contact details at all.
    /// The store also matches on email or phone alone, so a later sighting
    /// that adds a phone still finds the email-keyed row.
    pub fn identity_key(&self) -> String {
        if let Some(id) = self.source_id.as_deref().map(str::trim).filter(|id| !id.is_empty()) {
            return format!("src:{}", id);
        }
        if let Some(email) = self.normalized_email() {
            return format!("email:{}", email);
        }
        if let Some(phone) = self.normalized_phone() {
            return format!("phone:{}", phone);
        }

        let name = self.name.split_whitespace().collect::<Vec<_>>().join(" ");
        let company = self
            .current_company
            .as_deref()
            .map(|c| c.trim().to_lowercase())
            .unwrap_or_default();
        format!("name:{}|{}", name.to_lowercase(), company)
    }

    pub fn normalized_email(&self) -> Option<String> {
        self.email
            .as_deref()
            .map(|e| e.trim().to_lowercase())
            .filter(|e| !e.is_empty())
    }

    /// Digits only, so `+91 98765-43210` and `+91-9876543210` agree.
    pub fn normalized_phone(&self) -> Option<String> {
        let digits: String = self
            .phone
            .as_deref()?
            .chars()
            .filter(|c| c.is_ascii_digit())
            .collect();
        (!digits.is_empty()).then_some(digits)
    }

    /// Merge a new sighting into a stored record: stored values win, gaps are
    /// backfilled. Returns true if anything changed.
    pub fn backfill(&self, existing: &mut CandidateRecord) -> bool {
        let mut changed = false;
        changed |= fill(&mut existing.source_id, &self.source_id);
        changed |= fill(&mut existing.email, &self.email);
        changed |= fill(&mut existing.phone, &self.phone);
        changed |= fill(&mut existing.experience_years, &self.experience_years);
        changed |= fill(&mut existing.current_company, &self.current_company);
        changed |= fill(&mut existing.current_designation, &self.current_designation);
        changed |= fill(&mut existing.location, &self.location);
        changed |= fill(&mut existing.profile_url, &self.profile_url);
        changed |= fill(&mut existing.salary, &self.salary);
        changed |= fill(&mut existing.posted_date, &self.posted_date);
        if existing.skills.is_empty() && !self.skills.is_empty() {
            existing.skills = self.skills.clone();
            changed = true;
        }
        changed
    }
}

fn fill<T: Clone>(slot: &mut Option<T>, incoming: &Option<T>) -> bool {
    if slot.is_none() && incoming.is_some() {
        *slot = incoming.clone();
        true
    } else {
        false
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CandidateStatus {
    pub contacted: bool,
    pub interested: Option<bool>,
    pub interview_scheduled: bool,
    pub comments: Option<String>,
    pub last_updated: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub id: i64,
    pub search_id: i64,
    pub identity_key: String,
    #[serde(flatten)]
    pub profile: CandidateRecord,
    pub status: CandidateStatus,
    pub scraped_at: String,
}

/// Partial status update. Only `Some` fields are applied.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatusPatch {
    pub contacted: Option<bool>,
    pub interested: Option<bool>,
    pub interview_scheduled: Option<bool>,
    pub comments: Option<String>,
    /// Permits clearing `contacted` / `interview_scheduled` once set.
    #[serde(default)]
    pub override_clear: bool,
}

impl StatusPatch {
    pub fn is_empty(&self) -> bool {
        self.contacted.is_none()
            && self.interested.is_none()
            && self.interview_scheduled.is_none()
            && self.comments.is_none()
    }

    pub fn apply_to(&self, status: &mut CandidateStatus) -> Result<()> {
        if !self.override_clear {
            if status.contacted && self.contacted == Some(false) {
                return Err(PipelineError::Validation(
                    "refusing to clear `contacted` without override".into(),
                ));
            }
            if status.interview_scheduled && self.interview_scheduled == Some(false) {
                return Err(PipelineError::Validation(
                    "refusing to clear `interview_scheduled` without override".into(),
                ));
            }
        }
        if let Some(contacted) = self.contacted {
            status.contacted = contacted;
        }
        if let Some(interested) = self.interested {
            status.interested = Some(interested);
        }
        if let Some(scheduled) = self.interview_scheduled {
            status.interview_scheduled = scheduled;
        }
        if let Some(comments) = &self.comments {
            status.comments = Some(comments.clone());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WebhookTool {
    N8n,
    Make,
    Custom,
}

impl WebhookTool {
    pub fn as_str(self) -> &'static str {
        match self {
            WebhookTool::N8n => "n8n",
            WebhookTool::Make => "make",
            WebhookTool::Custom => "custom",
        }
    }
}

impl fmt::Display for WebhookTool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WebhookTool {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "n8n" => Ok(WebhookTool::N8n),
            "make" | "make.com" => Ok(WebhookTool::Make),
            "custom" => Ok(WebhookTool::Custom),
            other => Err(PipelineError::Validation(format!(
                "unknown webhook tool '{}'. Available: n8n, make, custom",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallStatus {
    Pending,
    Completed,
    Failed,
}

impl CallStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            CallStatus::Pending => "pending",
            CallStatus::Completed => "completed",
            CallStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, CallStatus::Pending)
    }
}

impl FromStr for CallStatus {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(CallStatus::Pending),
            "completed" => Ok(CallStatus::Completed),
            "failed" => Ok(CallStatus::Failed),
            other => Err(PipelineError::Validation(format!("unknown call status '{}'", other))),
        }
    }
}

/// What moved a call out of `pending`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Resolution {
    /// A verified callback from the automation tool.
    Callback,
    /// The outbound request never got through.
    Dispatch,
    /// The expiry sweep.
    Timeout,
}

impl Resolution {
    pub fn as_str(self) -> &'static str {
        match self {
            Resolution::Callback => "callback",
            Resolution::Dispatch => "dispatch",
            Resolution::Timeout => "timeout",
        }
    }
}

impl FromStr for Resolution {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "callback" => Ok(Resolution::Callback),
            "dispatch" => Ok(Resolution::Dispatch),
            "timeout" => Ok(Resolution::Timeout),
            other => Err(PipelineError::Validation(format!("unknown resolution '{}'", other))),
        }
    }
}

/// One webhook dispatch attempt. Rows are only ever appended or resolved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallLog {
    pub id: i64,
    pub candidate_id: i64,
    pub tool: WebhookTool,
    pub script: String,
    pub dispatched_at: String,
    pub status: CallStatus,
    pub response: Option<String>,
    pub correlation_token: String,
    pub resolved_at: Option<String>,
    pub resolved_by: Option<Resolution>,
}

/// Outcome reported by an automation tool for one call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallbackResult {
    pub call_status: CallStatus,
    pub interested: Option<bool>,
    pub contacted: Option<bool>,
    pub response: Option<String>,
}

impl CallbackResult {
    /// Stable digest used to recognise a replayed callback.
    pub fn fingerprint(&self) -> String {
        let canonical = serde_json::to_string(self).unwrap_or_default();
        hex::encode(Sha256::digest(canonical.as_bytes()))
    }
}

/// Criteria for `Store::search_candidates`. Unset fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CandidateQuery {
    pub search_id: Option<i64>,
    /// Every skill must appear, case-insensitively.
    pub skills: Vec<String>,
    /// Substring of the candidate's location, case-insensitive.
    pub location: Option<String>,
    pub min_experience: Option<f64>,
}

impl CandidateQuery {
    pub fn is_empty(&self) -> bool {
        self.search_id.is_none()
            && self.skills.iter().all(|s| s.trim().is_empty())
            && self.location.as_deref().is_none_or(|l| l.trim().is_empty())
            && self.min_experience.is_none()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct InsertSummary {
    pub inserted: usize,
    pub deduped: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Statistics {
    pub total: i64,
    pub contacted: i64,
    pub interested: i64,
    pub interview_scheduled: i64,
}
