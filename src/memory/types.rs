//! Core memory type definitions.
//!
//! Defines [`MemoryRecord`] (a row of the store), [`ListOrder`] and
//! [`ListFilter`] (read-path options), and the reserved namespace tags used
//! for priority routing.

use serde::{Deserialize, Serialize};

/// Reserved namespace tags. Namespaces are free-form strings; these are the
/// ones the priority retriever and the session tooling know about.
pub mod namespaces {
    pub const CORE_IDENTITY: &str = "core_identity";
    pub const INGESTED: &str = "ingested";
    pub const LOGICAL_WOLF: &str = "logical-wolf";
    pub const SESSION_RECOVERY: &str = "session_recovery";
    pub const IMPORTED: &str = "imported";
    pub const SYSTEM_ANNOUNCEMENTS: &str = "system_announcements";
    pub const SCRIPTY: &str = "scripty";
}

/// Metadata key carrying the ranker's 1–5 importance score.
/// Polarity: 1 = critical, 5 = minimal.
pub const SENTIMENT_LEVEL_KEY: &str = "sentiment_level";

/// Metadata key recording a permanent embedding failure ("oversize" or
/// "encoding"). Rows carrying it are skipped by the librarian until their
/// content changes.
pub const EMBEDDING_ERROR_KEY: &str = "embedding_error";

/// Metadata key set when the ranking provider failed and the default level
/// was applied.
pub const RANK_ERROR_KEY: &str = "rank_error";

/// A memory record, matching the `memories` table schema.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryRecord {
    /// Monotone integer primary key, assigned at insert.
    pub id: i64,
    /// Tenant/owner; may be a logical agent name.
    pub user_id: String,
    /// Full text content. `None` marks a tombstone.
    pub content: Option<String>,
    /// Arbitrary JSON metadata (e.g. `{"sentiment_level": 2}`).
    pub metadata: Option<serde_json::Value>,
    /// Short free-form tag (e.g. `"general"`, `"decision"`).
    pub memory_type: String,
    /// Short tag used for priority routing.
    pub namespace: String,
    /// RFC 3339 creation timestamp (UTC).
    pub created_at: String,
    /// RFC 3339 last-modification timestamp (UTC).
    pub updated_at: String,
}

impl MemoryRecord {
    /// The ranker's importance score, when present and in domain.
    pub fn sentiment_level(&self) -> Option<i64> {
        self.metadata
            .as_ref()
            .and_then(|m| m.get(SENTIMENT_LEVEL_KEY))
            .and_then(|v| v.as_i64())
            .filter(|n| (1..=5).contains(n))
    }
}

/// Sort order for list queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ListOrder {
    CreatedAt,
    Id,
}

impl ListOrder {
    pub fn as_sql(&self) -> &'static str {
        match self {
            Self::CreatedAt => "created_at",
            Self::Id => "id",
        }
    }
}

impl std::str::FromStr for ListOrder {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created_at" => Ok(Self::CreatedAt),
            "id" => Ok(Self::Id),
            _ => Err(format!("unknown list order: {s}")),
        }
    }
}

/// Options for [`crate::memory::store::list_memories`].
#[derive(Debug, Clone)]
pub struct ListFilter {
    pub namespace: Option<String>,
    /// Only rows with `created_at >= since` (RFC 3339).
    pub since: Option<String>,
    pub limit: usize,
    pub order: ListOrder,
}

impl Default for ListFilter {
    fn default() -> Self {
        Self {
            namespace: None,
            since: None,
            limit: 50,
            order: ListOrder::CreatedAt,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sentiment_level_parses_in_domain() {
        let mut rec = MemoryRecord {
            id: 1,
            user_id: "u".into(),
            content: Some("x".into()),
            metadata: Some(serde_json::json!({"sentiment_level": 2})),
            memory_type: "general".into(),
            namespace: "imported".into(),
            created_at: "2026-01-01T00:00:00Z".into(),
            updated_at: "2026-01-01T00:00:00Z".into(),
        };
        assert_eq!(rec.sentiment_level(), Some(2));

        rec.metadata = Some(serde_json::json!({"sentiment_level": 9}));
        assert_eq!(rec.sentiment_level(), None);

        rec.metadata = None;
        assert_eq!(rec.sentiment_level(), None);
    }

    #[test]
    fn list_order_round_trips() {
        assert_eq!("created_at".parse::<ListOrder>().unwrap(), ListOrder::CreatedAt);
        assert_eq!("id".parse::<ListOrder>().unwrap(), ListOrder::Id);
        assert!("recency".parse::<ListOrder>().is_err());
    }
}
