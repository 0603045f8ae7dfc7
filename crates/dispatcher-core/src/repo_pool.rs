//! The Repo Pool Manager external interface (SPEC_FULL.md §2A, §6).

use std::collections::HashMap;

use async_trait::async_trait;

use crate::types::Slot;

#[async_trait]
pub trait RepoPool: Send + Sync {
    async fn allocate_slot(
        &self,
        repo_name: &str,
        metadata: Option<HashMap<String, String>>,
    ) -> anyhow::Result<Option<Slot>>;

    /// Release a slot. Implementations must be idempotent: releasing an
    /// already-released or unknown slot id is not an error (SPEC_FULL.md
    /// §4.9 relies on this for the event/slot-release ordering choice).
    async fn release_slot(&self, slot_id: &str, cleanup: bool) -> anyhow::Result<()>;
}
