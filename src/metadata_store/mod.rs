// Metadata Store Backends
// Two implementations of the MetadataStore contract: an in-memory store for
// tests and embedded development, and a Postgres store for production. Both
// keep multi-row methods atomic.

mod memory;
mod postgres;

pub use memory::MemoryMetadataStore;
pub use postgres::{create_pg_store, PgMetadataStore};

use anyhow::Result;
use std::sync::Arc;

use crate::contracts::MetadataStore;

/// Build the configured metadata store: Postgres when a database URL is
/// present, in-memory otherwise.
pub async fn create_metadata_store(
    database_url: Option<&str>,
) -> Result<Arc<dyn MetadataStore>> {
    match database_url {
        Some(url) => Ok(create_pg_store(url).await?),
        None => Ok(Arc::new(MemoryMetadataStore::new())),
    }
}

/// Derive the auto-title for a session from its first user message:
/// the first 20 characters, with an ellipsis when truncated.
pub(crate) fn auto_title(content: &str) -> String {
    let trimmed = content.trim();
    let mut title: String = trimmed.chars().take(20).collect();
    if trimmed.chars().count() > 20 {
        title.push_str("...");
    }
    title
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auto_title() {
        assert_eq!(auto_title("short"), "short");
        assert_eq!(
            auto_title("a question that is definitely longer than twenty chars"),
            "a question that is d..."
        );
        assert_eq!(auto_title("  padded  "), "padded");
    }
}
