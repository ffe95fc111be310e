//! Core domain model for shoal: tracked entities, ingestion cursors,
//! normalized content records, and failure events.

use std::fmt;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

pub const CRATE_NAME: &str = "shoal-core";

/// A paginated feed kind tracked per owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Feed {
    NewContent,
    Interactions,
    Posts,
    Comments,
}

impl Feed {
    pub const ALL: [Feed; 4] = [
        Feed::NewContent,
        Feed::Interactions,
        Feed::Posts,
        Feed::Comments,
    ];

    /// Directory segment used in remote document paths and as the persisted label.
    pub fn dir_name(&self) -> &'static str {
        match self {
            Feed::NewContent => "newcontent",
            Feed::Interactions => "interactions",
            Feed::Posts => "posts",
            Feed::Comments => "comments",
        }
    }

    pub fn from_dir_name(label: &str) -> Option<Feed> {
        Feed::ALL.into_iter().find(|feed| feed.dir_name() == label)
    }

    /// The kind assigned to records ingested from this feed.
    pub fn entry_kind(&self) -> EntryKind {
        match self {
            Feed::NewContent => EntryKind::NewContent,
            Feed::Interactions => EntryKind::Interaction,
            Feed::Posts => EntryKind::Post,
            Feed::Comments => EntryKind::Comment,
        }
    }
}

impl fmt::Display for Feed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.dir_name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryKind {
    NewContent,
    Interaction,
    Post,
    Comment,
}

impl EntryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryKind::NewContent => "NEWCONTENT",
            EntryKind::Interaction => "INTERACTION",
            EntryKind::Post => "POST",
            EntryKind::Comment => "COMMENT",
        }
    }
}

/// An (owner identity, feed) pair tracked for ingestion.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Entity {
    pub owner: String,
    pub feed: Feed,
}

impl Entity {
    pub fn new(owner: impl Into<String>, feed: Feed) -> Self {
        Self {
            owner: owner.into(),
            feed,
        }
    }
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.owner, self.feed)
    }
}

/// Durable bookmark marking how far an entity's feed has been consumed.
///
/// `last_page` is the page the cursor sits in; `last_offset` is the number of
/// entries consumed from that page. Fingerprints cache the content identity of
/// the index and current page for conditional refetch. The default state means
/// nothing has been consumed yet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct CursorState {
    pub last_page: u64,
    pub last_offset: u64,
    pub empty_runs: u32,
    pub index_fingerprint: String,
    pub page_fingerprint: String,
}

/// The persisted ingestion unit, written once and never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentRecord {
    pub id: Uuid,
    pub entry_kind: EntryKind,
    pub owner: String,
    pub feed: Feed,
    pub content_ref: String,
    pub metadata: JsonValue,
    pub created_at: DateTime<Utc>,
    pub ingested_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventKind {
    FeedScanFailed,
    DiscoveryFailed,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::FeedScanFailed => "FEED_SCAN_FAILED",
            EventKind::DiscoveryFailed => "DISCOVERY_FAILED",
        }
    }
}

/// Persisted observability record for a per-entity failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureEvent {
    pub id: Uuid,
    pub kind: EventKind,
    pub owner: String,
    pub feed: Option<Feed>,
    pub error: String,
    pub created_at: DateTime<Utc>,
}

impl FailureEvent {
    pub fn feed_scan(entity: &Entity, error: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind: EventKind::FeedScanFailed,
            owner: entity.owner.clone(),
            feed: Some(entity.feed),
            error: error.into(),
            created_at: Utc::now(),
        }
    }

    pub fn discovery(owner: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind: EventKind::DiscoveryFailed,
            owner: owner.into(),
            feed: None,
            error: error.into(),
            created_at: Utc::now(),
        }
    }
}

/// Probability that a dormant entity is scanned this run.
///
/// Always 1 for freshly-active entities, strictly decreasing with the number
/// of consecutive scans that found nothing, never reaching zero so dormant
/// entities are still re-checked eventually.
pub fn scan_probability(empty_runs: u32) -> f64 {
    1.0 / (1.0 + f64::from(empty_runs))
}

/// One draw against [`scan_probability`].
pub fn should_scan(empty_runs: u32) -> bool {
    empty_runs == 0 || rand::thread_rng().gen::<f64>() < scan_probability(empty_runs)
}
