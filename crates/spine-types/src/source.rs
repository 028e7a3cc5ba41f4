use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A registered external source a Capture attempt reads from (§3
/// `Source`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Source {
    pub name: String,
    pub uri_template: String,
    pub domain: String,
}

/// One attempt to fetch from a source (§3 `SourceFetch`). A sighting of the
/// source document; the Capture Service records every sighting while
/// storing the underlying record once (Glossary "Sighting").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceFetch {
    pub source_name: String,
    pub fetched_at: DateTime<Utc>,
    pub content_hash: Option<String>,
    pub etag: Option<String>,
    pub last_modified: Option<DateTime<Utc>>,
    pub status: String,
}

/// Optional byte cache keyed by `content_hash` so repeated fetches of an
/// unchanged source document skip re-download (§3 `SourceCache`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceCache {
    pub content_hash: String,
    pub byte_len: u64,
    pub cached_at: DateTime<Utc>,
}
