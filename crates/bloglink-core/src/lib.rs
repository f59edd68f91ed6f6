//! Core domain model for the blog link graph: sites, link edges, external
//! candidates and the URL normalizer every other crate keys on.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod normalize;

pub use normalize::{domain_of, homepage_of, normalize, normalize_with_base, NormalizeError};

pub const CRATE_NAME: &str = "bloglink-core";

pub type SiteId = i64;
pub type CandidateId = i64;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown {kind} value `{value}`")]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}

/// Where on the discovering site an outbound link was observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkKind {
    Homepage,
    FriendPage,
}

impl LinkKind {
    pub fn as_str(self) -> &'static str {
        match self {
            LinkKind::Homepage => "homepage",
            LinkKind::FriendPage => "friend_page",
        }
    }
}

impl fmt::Display for LinkKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LinkKind {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "homepage" => Ok(LinkKind::Homepage),
            "friend_page" => Ok(LinkKind::FriendPage),
            other => Err(UnknownVariant {
                kind: "link kind",
                value: other.to_string(),
            }),
        }
    }
}

/// Processing state of an external candidate.
///
/// `Unprocessed -> Processing -> {Processed, Failed}`. `Processing` is a soft
/// lock held by exactly one worker; `Processed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CandidateState {
    Unprocessed,
    Processing,
    Processed,
    Failed,
}

impl CandidateState {
    pub const ALL: [CandidateState; 4] = [
        CandidateState::Unprocessed,
        CandidateState::Processing,
        CandidateState::Processed,
        CandidateState::Failed,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            CandidateState::Unprocessed => "unprocessed",
            CandidateState::Processing => "processing",
            CandidateState::Processed => "processed",
            CandidateState::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, CandidateState::Processed)
    }
}

impl fmt::Display for CandidateState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CandidateState {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "unprocessed" => Ok(CandidateState::Unprocessed),
            "processing" => Ok(CandidateState::Processing),
            "processed" => Ok(CandidateState::Processed),
            "failed" => Ok(CandidateState::Failed),
            other => Err(UnknownVariant {
                kind: "candidate state",
                value: other.to_string(),
            }),
        }
    }
}

/// A known blog node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Site {
    pub id: SiteId,
    pub name: String,
    pub url: String,
    pub domain: String,
    pub reviewed: bool,
    pub created_at: DateTime<Utc>,
}

/// Directed friendship link between two known sites.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkEdge {
    pub id: i64,
    pub source_site_id: SiteId,
    pub target_site_id: SiteId,
    pub kind: LinkKind,
    pub page_url: String,
    pub created_at: DateTime<Utc>,
}

/// Outbound link whose target has not been judged yet. Unique by `domain`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalCandidate {
    pub id: CandidateId,
    pub url: String,
    pub domain: String,
    pub discovered_from_site_id: SiteId,
    pub discovered_on_page: String,
    pub kind: LinkKind,
    pub state: CandidateState,
    pub claimed_by: Option<String>,
    /// Set while `Processing`; doubles as the "stuck since" marker.
    pub claimed_at: Option<DateTime<Utc>>,
    pub attempts: i32,
    pub last_error: Option<String>,
    pub verdict_is_blog: Option<bool>,
    pub evidence_sha256: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Raw (name, URL) pair as produced by a source adapter, before normalization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawSiteEntry {
    pub name: String,
    pub url: String,
}

/// An outbound link observed on a known site's page.
///
/// Both the link extractor and external rescans enter the graph through this
/// shape; `target_url` is always canonical.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Discovery {
    pub source_site_id: SiteId,
    pub target_url: String,
    pub target_domain: String,
    pub kind: LinkKind,
    pub page_url: String,
}

impl Discovery {
    pub fn new(
        source_site_id: SiteId,
        raw_target: &str,
        kind: LinkKind,
        page_url: &str,
    ) -> Result<Self, NormalizeError> {
        let target_url = normalize(raw_target)?;
        let target_domain = domain_of(&target_url)?;
        Ok(Self {
            source_site_id,
            target_url,
            target_domain,
            kind,
            page_url: normalize(page_url)?,
        })
    }
}
