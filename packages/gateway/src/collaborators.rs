//! Interfaces to the services this subsystem consumes but does not
//! own: message persistence, memory search, usage/audit sinks, and
//! skill packages. All are simple create/read calls with no
//! transactional coupling back into the gateway.
//!
//! In-memory implementations ship here; they back the standalone
//! server and the test suite.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::RwLock;

use exec_gateway_error::GatewayError;

const MAX_INLINE_SKILL_FILE_BYTES: u64 = 64 * 1024;

#[derive(Debug, Clone, Serialize)]
pub struct StoredMessage {
    pub session_id: String,
    pub kind: String,
    pub content: Value,
    pub metadata: Value,
}

/// Session/message persistence.
#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn append_message(
        &self,
        session_id: &str,
        kind: &str,
        content: Value,
        metadata: Value,
    ) -> Result<(), GatewayError>;

    async fn session_messages(&self, session_id: &str) -> Result<Vec<StoredMessage>, GatewayError>;
}

#[derive(Debug, Clone, Serialize)]
pub struct MemoryHit {
    pub id: String,
    pub text: String,
    pub score: f32,
}

/// Memory/semantic search. Implementations embed the query and rank
/// by vector similarity; when embedding generation is unavailable
/// they fall back to substring search over the same corpus.
#[async_trait]
pub trait MemoryIndex: Send + Sync {
    async fn search(
        &self,
        user_id: &str,
        query: &str,
        limit: usize,
    ) -> Result<Vec<MemoryHit>, GatewayError>;
}

#[async_trait]
pub trait UsageSink: Send + Sync {
    async fn record_usage(
        &self,
        user_id: &str,
        org_id: &str,
        session_id: &str,
        input_tokens: u64,
        output_tokens: u64,
        cost_usd: Option<f64>,
        model: Option<&str>,
    ) -> Result<(), GatewayError>;
}

#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, user_id: &str, action: &str, detail: Value)
        -> Result<(), GatewayError>;
}

/// Skill package lookup plus evolved-skill persistence.
#[async_trait]
pub trait SkillStore: Send + Sync {
    async fn package_dir(&self, skill_id: &str) -> Result<Option<PathBuf>, GatewayError>;

    async fn save_evolved(
        &self,
        user_id: &str,
        session_id: &str,
        name: &str,
        instructions: &str,
        metadata: Value,
    ) -> Result<(), GatewayError>;
}

/// Bundle of collaborator handles injected into the server state.
#[derive(Clone)]
pub struct Collaborators {
    pub messages: Arc<dyn MessageStore>,
    pub memory: Arc<dyn MemoryIndex>,
    pub usage: Arc<dyn UsageSink>,
    pub audit: Arc<dyn AuditSink>,
    pub skills: Arc<dyn SkillStore>,
}

impl std::fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collaborators").finish_non_exhaustive()
    }
}

impl Collaborators {
    pub fn in_memory() -> Self {
        Self {
            messages: Arc::new(InMemoryMessageStore::default()),
            memory: Arc::new(InMemoryMemoryIndex::default()),
            usage: Arc::new(RecordingUsageSink::default()),
            audit: Arc::new(RecordingAuditSink::default()),
            skills: Arc::new(InMemorySkillStore::default()),
        }
    }
}

// ---------------------------------------------------------------------------
// In-memory implementations
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct InMemoryMessageStore {
    sessions: RwLock<HashMap<String, Vec<StoredMessage>>>,
}

#[async_trait]
impl MessageStore for InMemoryMessageStore {
    async fn append_message(
        &self,
        session_id: &str,
        kind: &str,
        content: Value,
        metadata: Value,
    ) -> Result<(), GatewayError> {
        let mut sessions = self.sessions.write().await;
        sessions
            .entry(session_id.to_string())
            .or_default()
            .push(StoredMessage {
                session_id: session_id.to_string(),
                kind: kind.to_string(),
                content,
                metadata,
            });
        Ok(())
    }

    async fn session_messages(&self, session_id: &str) -> Result<Vec<StoredMessage>, GatewayError> {
        let sessions = self.sessions.read().await;
        Ok(sessions.get(session_id).cloned().unwrap_or_default())
    }
}

#[derive(Debug, Clone)]
struct MemoryEntry {
    id: String,
    text: String,
    embedding: Option<Vec<f32>>,
}

pub type QueryEmbedder = Box<dyn Fn(&str) -> Option<Vec<f32>> + Send + Sync>;

/// Corpus with optional precomputed embeddings. Vector similarity is
/// used when both the query embedder and entry embeddings are
/// available; otherwise substring matching over the same corpus.
#[derive(Default)]
pub struct InMemoryMemoryIndex {
    entries: RwLock<Vec<MemoryEntry>>,
    embedder: Option<QueryEmbedder>,
}

impl InMemoryMemoryIndex {
    pub fn with_embedder(embedder: QueryEmbedder) -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
            embedder: Some(embedder),
        }
    }

    pub async fn add_entry(&self, id: &str, text: &str, embedding: Option<Vec<f32>>) {
        self.entries.write().await.push(MemoryEntry {
            id: id.to_string(),
            text: text.to_string(),
            embedding,
        });
    }
}

#[async_trait]
impl MemoryIndex for InMemoryMemoryIndex {
    async fn search(
        &self,
        _user_id: &str,
        query: &str,
        limit: usize,
    ) -> Result<Vec<MemoryHit>, GatewayError> {
        let entries = self.entries.read().await;
        let query_embedding = self.embedder.as_ref().and_then(|embed| embed(query));

        let mut hits: Vec<MemoryHit> = match query_embedding {
            Some(query_vec) => entries
                .iter()
                .filter_map(|entry| {
                    let embedding = entry.embedding.as_ref()?;
                    Some(MemoryHit {
                        id: entry.id.clone(),
                        text: entry.text.clone(),
                        score: cosine_similarity(&query_vec, embedding),
                    })
                })
                .collect(),
            None => {
                let needle = query.to_lowercase();
                entries
                    .iter()
                    .filter(|entry| entry.text.to_lowercase().contains(&needle))
                    .map(|entry| MemoryHit {
                        id: entry.id.clone(),
                        text: entry.text.clone(),
                        score: 1.0,
                    })
                    .collect()
            }
        };

        hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        hits.truncate(limit);
        Ok(hits)
    }
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

#[derive(Debug, Clone, Serialize)]
pub struct UsageRecord {
    pub user_id: String,
    pub org_id: String,
    pub session_id: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost_usd: Option<f64>,
    pub model: Option<String>,
}

#[derive(Debug, Default)]
pub struct RecordingUsageSink {
    pub records: RwLock<Vec<UsageRecord>>,
}

#[async_trait]
impl UsageSink for RecordingUsageSink {
    async fn record_usage(
        &self,
        user_id: &str,
        org_id: &str,
        session_id: &str,
        input_tokens: u64,
        output_tokens: u64,
        cost_usd: Option<f64>,
        model: Option<&str>,
    ) -> Result<(), GatewayError> {
        self.records.write().await.push(UsageRecord {
            user_id: user_id.to_string(),
            org_id: org_id.to_string(),
            session_id: session_id.to_string(),
            input_tokens,
            output_tokens,
            cost_usd,
            model: model.map(ToOwned::to_owned),
        });
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AuditRecord {
    pub user_id: String,
    pub action: String,
    pub detail: Value,
}

#[derive(Debug, Default)]
pub struct RecordingAuditSink {
    pub records: RwLock<Vec<AuditRecord>>,
}

#[async_trait]
impl AuditSink for RecordingAuditSink {
    async fn record(
        &self,
        user_id: &str,
        action: &str,
        detail: Value,
    ) -> Result<(), GatewayError> {
        self.records.write().await.push(AuditRecord {
            user_id: user_id.to_string(),
            action: action.to_string(),
            detail,
        });
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct EvolvedSkill {
    pub user_id: String,
    pub session_id: String,
    pub name: String,
    pub instructions: String,
    pub metadata: Value,
}

#[derive(Debug, Default)]
pub struct InMemorySkillStore {
    packages: RwLock<HashMap<String, PathBuf>>,
    pub evolved: RwLock<Vec<EvolvedSkill>>,
}

impl InMemorySkillStore {
    pub async fn register_package(&self, skill_id: &str, dir: PathBuf) {
        self.packages
            .write()
            .await
            .insert(skill_id.to_string(), dir);
    }
}

#[async_trait]
impl SkillStore for InMemorySkillStore {
    async fn package_dir(&self, skill_id: &str) -> Result<Option<PathBuf>, GatewayError> {
        Ok(self.packages.read().await.get(skill_id).cloned())
    }

    async fn save_evolved(
        &self,
        user_id: &str,
        session_id: &str,
        name: &str,
        instructions: &str,
        metadata: Value,
    ) -> Result<(), GatewayError> {
        self.evolved.write().await.push(EvolvedSkill {
            user_id: user_id.to_string(),
            session_id: session_id.to_string(),
            name: name.to_string(),
            instructions: instructions.to_string(),
            metadata,
        });
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Skill package reading
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct SkillFile {
    pub path: String,
    pub size: u64,
    /// Inlined for small utf-8 files; `None` for binaries or files
    /// over the inline limit.
    pub content: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SkillPackage {
    pub skill_id: String,
    pub files: Vec<SkillFile>,
}

/// Walk a skill package directory and return its file listing plus
/// contents of small text files. Used by the execution plane to pull
/// skill instructions it does not already have cached.
pub async fn read_skill_package(
    skill_id: &str,
    dir: &Path,
) -> Result<SkillPackage, GatewayError> {
    let mut files = Vec::new();
    let mut pending = vec![dir.to_path_buf()];

    while let Some(current) = pending.pop() {
        let mut entries =
            tokio::fs::read_dir(&current)
                .await
                .map_err(|err| GatewayError::StreamError {
                    message: format!("skill package read failed: {err}"),
                })?;
        while let Some(entry) =
            entries
                .next_entry()
                .await
                .map_err(|err| GatewayError::StreamError {
                    message: format!("skill package read failed: {err}"),
                })?
        {
            let path = entry.path();
            if path.is_dir() {
                pending.push(path);
                continue;
            }
            let size = entry
                .metadata()
                .await
                .map(|meta| meta.len())
                .unwrap_or_default();
            let content = if size <= MAX_INLINE_SKILL_FILE_BYTES {
                tokio::fs::read_to_string(&path).await.ok()
            } else {
                None
            };
            let relative = path
                .strip_prefix(dir)
                .unwrap_or(&path)
                .to_string_lossy()
                .to_string();
            files.push(SkillFile {
                path: relative,
                size,
                content,
            });
        }
    }

    files.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(SkillPackage {
        skill_id: skill_id.to_string(),
        files,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn memory_search_falls_back_to_substring() {
        let index = InMemoryMemoryIndex::default();
        index.add_entry("m1", "the borrow checker", None).await;
        index.add_entry("m2", "garbage collection", None).await;

        let hits = index.search("u1", "BORROW", 10).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, "m1");
    }

    #[tokio::test]
    async fn memory_search_ranks_by_similarity_when_embedded() {
        let index = InMemoryMemoryIndex::with_embedder(Box::new(|_| Some(vec![1.0, 0.0])));
        index.add_entry("near", "a", Some(vec![0.9, 0.1])).await;
        index.add_entry("far", "b", Some(vec![0.0, 1.0])).await;
        index.add_entry("no-embedding", "c", None).await;

        let hits = index.search("u1", "anything", 2).await.unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].id, "near");
        assert!(hits[0].score > hits[1].score);
    }

    #[tokio::test]
    async fn skill_package_inlines_small_text_files() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join("SKILL.md"), "do the thing")
            .await
            .unwrap();
        tokio::fs::create_dir(dir.path().join("scripts")).await.unwrap();
        tokio::fs::write(dir.path().join("scripts").join("run.sh"), "#!/bin/sh\n")
            .await
            .unwrap();

        let package = read_skill_package("sk-1", dir.path()).await.unwrap();
        assert_eq!(package.files.len(), 2);
        assert_eq!(package.files[0].path, "SKILL.md");
        assert_eq!(package.files[0].content.as_deref(), Some("do the thing"));
    }

    #[tokio::test]
    async fn message_store_round_trip() {
        let store = InMemoryMessageStore::default();
        store
            .append_message("s1", "message", json!({"text": "hi"}), json!({}))
            .await
            .unwrap();
        let messages = store.session_messages("s1").await.unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].kind, "message");
    }
}
