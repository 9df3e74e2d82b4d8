//! Wire-format data model for the mailbox store (§3, §6).

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const MESSAGE_TTL_HOURS: i64 = 48;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Pending,
    Approved,
    InProgress,
    Read,
    Completed,
    Failed,
    Expired,
}

impl Status {
    /// §4.A status machine: allowed targets for this source status.
    pub fn allowed_targets(self) -> &'static [Status] {
        match self {
            Status::Pending => &[Status::Approved, Status::Failed],
            Status::Approved => &[Status::InProgress, Status::Failed],
            Status::InProgress => &[Status::Completed, Status::Failed],
            Status::Read => &[Status::InProgress],
            Status::Completed => &[],
            Status::Failed => &[Status::Pending],
            Status::Expired => &[],
        }
    }

    pub fn can_transition_to(self, target: Status) -> bool {
        self.allowed_targets().contains(&target)
    }

    /// §4.A "Check semantics": the default (non-`includeTerminal`) view.
    pub fn is_actionable(self) -> bool {
        matches!(self, Status::Pending | Status::Approved | Status::InProgress)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    Normal,
    High,
    Urgent,
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Normal
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutingMode {
    Direct,
    Cowork,
}

impl Default for RoutingMode {
    fn default() -> Self {
        RoutingMode::Direct
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControlType {
    #[serde(rename = "REPLY_SKIP")]
    ReplySkip,
    #[serde(rename = "ANNOUNCE_SKIP")]
    AnnounceSkip,
    #[serde(rename = "CONVERSATION_END")]
    ConversationEnd,
}

impl ControlType {
    /// Exact-match (case-insensitive, trimmed) against the task text, per
    /// §4.A "Send semantics" step 4.
    pub fn detect(task: &str) -> Option<ControlType> {
        match task.trim().to_uppercase().as_str() {
            "REPLY_SKIP" => Some(ControlType::ReplySkip),
            "ANNOUNCE_SKIP" => Some(ControlType::AnnounceSkip),
            "CONVERSATION_END" => Some(ControlType::ConversationEnd),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileRef {
    pub name: String,
    /// Inlined payload, or `None` when this references a blob by id.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blob_id: Option<String>,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub file_type: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub to: String,
    pub from: String,
    pub timestamp: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub status: Status,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub read_at: Option<DateTime<Utc>>,
    pub task: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    #[serde(default)]
    pub files: Vec<FileRef>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversation_excerpt: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority: Option<Priority>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
    pub routing: RoutingMode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub routed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub destination: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cowork_status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    pub thread_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply_count: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_control_message: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub control_type: Option<ControlType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thread_status: Option<String>,
}

impl Message {
    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }

    pub fn has_project_metadata(&self) -> bool {
        self.project.is_some() || self.project_name.is_some()
    }
}

/// Inputs accepted by `MailboxStore::send` (§4.A "Send semantics").
#[derive(Debug, Clone, Default)]
pub struct SendRequest {
    pub to: String,
    pub from: String,
    pub task: String,
    pub context: Option<String>,
    pub files: Vec<FileRef>,
    pub project_name: Option<String>,
    pub conversation_excerpt: Option<String>,
    pub project: Option<String>,
    pub priority: Option<Priority>,
    pub tags: Option<Vec<String>>,
    pub routing: RoutingMode,
    pub destination: Option<String>,
    pub reply_to: Option<String>,
    /// Caller override — unconditionally forces `pending` (§4.B).
    pub require_approval: bool,
}

pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}

pub fn expires_at_from(created_at: DateTime<Utc>) -> DateTime<Utc> {
    created_at + Duration::hours(MESSAGE_TTL_HOURS)
}

/// Normalize an inbox path: strip leading slashes, lowercase (§4.A step 1).
pub fn normalize_path(path: &str) -> String {
    path.trim_start_matches('/').to_lowercase()
}

/// §4.A "Path validation": split on `/`, reject empties; 1-3 segments
/// allowed with project metadata, 2-3 without.
pub fn validate_path(path: &str, has_project_metadata: bool) -> anyhow::Result<Vec<String>> {
    let segments: Vec<String> = path.split('/').map(str::to_string).collect();

    if segments.iter().any(|s| s.is_empty()) {
        return Err(anyhow::anyhow!("inbox path '{path}' contains empty segments"));
    }

    let min = if has_project_metadata { 1 } else { 2 };
    if segments.len() < min || segments.len() > 3 {
        return Err(anyhow::anyhow!(
            "inbox path '{path}' must have {}-3 segments{}",
            min,
            if has_project_metadata { "" } else { " (or 1 with project metadata)" }
        ));
    }

    Ok(segments)
}

/// Root platform of an inbox path or agent identifier, e.g. `claude/web`
/// -> `claude`.
pub fn root_platform(path: &str) -> &str {
    path.split('/').next().unwrap_or(path)
}
