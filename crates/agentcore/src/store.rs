//! Persistence collaborators: where graph definitions come from and where
//! run snapshots go.

use crate::context::ContextSnapshot;
use crate::run::ExecutionId;
use crate::StoreError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;

/// Source of raw graph JSON, keyed by agent.
#[async_trait]
pub trait GraphDefinitionSource: Send + Sync {
    async fn load_by_agent_id(&self, agent_id: &str) -> Result<String, StoreError>;
}

/// Storage of run snapshots. Saved at suspension and at run end.
#[async_trait]
pub trait ContextStore: Send + Sync {
    async fn load(&self, execution_id: ExecutionId) -> Result<Option<ContextSnapshot>, StoreError>;

    async fn save(&self, execution_id: ExecutionId, snapshot: &ContextSnapshot) -> Result<(), StoreError>;

    /// Most recent finished run of a conversation, used to seed the next run.
    async fn latest_for_conversation(
        &self,
        _conversation_id: &str,
    ) -> Result<Option<ContextSnapshot>, StoreError> {
        Ok(None)
    }
}

fn newest_finished<'a>(
    snapshots: impl Iterator<Item = &'a ContextSnapshot>,
    conversation_id: &str,
) -> Option<&'a ContextSnapshot> {
    snapshots
        .filter(|s| s.conversation_id == conversation_id && s.status.is_terminal())
        .max_by_key(|s| s.updated_at)
}

/// Graph definitions held in memory.
#[derive(Default)]
pub struct InMemoryGraphSource {
    definitions: RwLock<HashMap<String, String>>,
}

impl InMemoryGraphSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, agent_id: impl Into<String>, graph_json: impl Into<String>) {
        self.definitions
            .write()
            .await
            .insert(agent_id.into(), graph_json.into());
    }
}

#[async_trait]
impl GraphDefinitionSource for InMemoryGraphSource {
    async fn load_by_agent_id(&self, agent_id: &str) -> Result<String, StoreError> {
        self.definitions
            .read()
            .await
            .get(agent_id)
            .cloned()
            .ok_or_else(|| StoreError::AgentNotFound(agent_id.to_string()))
    }
}

/// Reads `<dir>/<agent_id>.json`.
pub struct DirectoryGraphSource {
    dir: PathBuf,
}

impl DirectoryGraphSource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Agent ids found in the directory.
    pub fn list_agents(&self) -> Result<Vec<String>, StoreError> {
        let mut agents = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension() == Some("json".as_ref()) {
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    agents.push(stem.to_string());
                }
            }
        }
        agents.sort();
        Ok(agents)
    }
}

#[async_trait]
impl GraphDefinitionSource for DirectoryGraphSource {
    async fn load_by_agent_id(&self, agent_id: &str) -> Result<String, StoreError> {
        if !is_safe_file_stem(agent_id) {
            return Err(StoreError::AgentNotFound(agent_id.to_string()));
        }
        let path = self.dir.join(format!("{}.json", agent_id));
        match tokio::fs::read_to_string(&path).await {
            Ok(json) => Ok(json),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StoreError::AgentNotFound(agent_id.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }
}

fn is_safe_file_stem(id: &str) -> bool {
    !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
        && !id.starts_with('.')
}

/// Snapshots held in memory; lost on restart.
#[derive(Default)]
pub struct InMemoryContextStore {
    snapshots: RwLock<HashMap<ExecutionId, ContextSnapshot>>,
}

impl InMemoryContextStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.snapshots.read().await.len()
    }
}

#[async_trait]
impl ContextStore for InMemoryContextStore {
    async fn load(&self, execution_id: ExecutionId) -> Result<Option<ContextSnapshot>, StoreError> {
        Ok(self.snapshots.read().await.get(&execution_id).cloned())
    }

    async fn save(&self, execution_id: ExecutionId, snapshot: &ContextSnapshot) -> Result<(), StoreError> {
        self.snapshots
            .write()
            .await
            .insert(execution_id, snapshot.clone());
        Ok(())
    }

    async fn latest_for_conversation(
        &self,
        conversation_id: &str,
    ) -> Result<Option<ContextSnapshot>, StoreError> {
        let snapshots = self.snapshots.read().await;
        Ok(newest_finished(snapshots.values(), conversation_id).cloned())
    }
}

/// One JSON file per execution under a directory. Survives restarts, so a
/// run suspended for review can be resumed by another process.
pub struct FileContextStore {
    dir: PathBuf,
}

impl FileContextStore {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, execution_id: ExecutionId) -> PathBuf {
        self.dir.join(format!("{}.json", execution_id))
    }

    async fn read_all(&self) -> Result<Vec<ContextSnapshot>, StoreError> {
        let mut snapshots = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension() != Some("json".as_ref()) {
                continue;
            }
            let raw = tokio::fs::read_to_string(&path).await?;
            match serde_json::from_str::<ContextSnapshot>(&raw) {
                Ok(snapshot) => snapshots.push(snapshot),
                Err(e) => tracing::warn!(path = %path.display(), error = %e, "Skipping unreadable snapshot"),
            }
        }
        Ok(snapshots)
    }
}

#[async_trait]
impl ContextStore for FileContextStore {
    async fn load(&self, execution_id: ExecutionId) -> Result<Option<ContextSnapshot>, StoreError> {
        match tokio::fs::read_to_string(self.path_for(execution_id)).await {
            Ok(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn save(&self, execution_id: ExecutionId, snapshot: &ContextSnapshot) -> Result<(), StoreError> {
        let json = serde_json::to_vec_pretty(snapshot)?;
        let path = self.path_for(execution_id);
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn latest_for_conversation(
        &self,
        conversation_id: &str,
    ) -> Result<Option<ContextSnapshot>, StoreError> {
        let snapshots = self.read_all().await?;
        Ok(newest_finished(snapshots.iter(), conversation_id).cloned())
    }
}
