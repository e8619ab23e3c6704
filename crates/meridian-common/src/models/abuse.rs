//! Abuse & Blocking model — per-user block lists and reports for admin review.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

/// A block is one-directional: only the blocker's view is filtered.
/// Symmetric enforcement is explicitly not required.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockedUser {
    pub blocker: Uuid,
    pub blocked: Uuid,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportStatus {
    Pending,
    UnderReview,
    Resolved,
    Dismissed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AbuseReport {
    pub id: Uuid,
    pub reporter: Uuid,
    pub reported: Uuid,
    pub description: String,
    pub photos: Vec<String>,
    pub status: ReportStatus,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
pub struct BlockRequest {
    pub user_id: Uuid,
}

#[derive(Debug, Deserialize, Validate)]
pub struct ReportRequest {
    pub reported: Uuid,
    #[validate(length(min = 1, max = 2000))]
    pub description: String,
    #[validate(length(max = 10))]
    pub photos: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct ResolveReportRequest {
    pub status: ReportStatus,
}
