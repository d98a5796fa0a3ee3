// In-memory metadata store.
// One RwLock over the whole state makes every composite method a natural
// unit of work: it either applies entirely or returns early with nothing
// mutated. Backs tests and embedded development mode.

use anyhow::{anyhow, bail, ensure, Result};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::contracts::{
    AssistantTurn, KnowledgeUpdate, MetadataStore, NewChunkRow, NewDocument, NewKnowledge,
    NewSession, NewUser, ReconcileReport, SessionUpdate,
};
use crate::errors::INTERRUPTED_MESSAGE;
use crate::models::{
    ChatSession, ChunkRow, DocStatus, Document, Experiment, ExperimentStatus, Knowledge,
    KnowledgeStatus, Membership, Message, MessageRole, MetricScores, Role, Testset, TestsetStatus,
    User, DEFAULT_SESSION_TITLE,
};

use super::auto_title;

#[derive(Default)]
struct Inner {
    next_id: i64,
    users: HashMap<i64, User>,
    knowledges: HashMap<i64, Knowledge>,
    memberships: Vec<Membership>,
    documents: HashMap<i64, Document>,
    chunks: HashMap<i64, ChunkRow>,
    sessions: HashMap<Uuid, ChatSession>,
    messages: HashMap<i64, Message>,
    testsets: HashMap<i64, Testset>,
    experiments: HashMap<i64, Experiment>,
}

impl Inner {
    fn alloc_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }
}

pub struct MemoryMetadataStore {
    inner: RwLock<Inner>,
}

impl MemoryMetadataStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
        }
    }
}

impl Default for MemoryMetadataStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MetadataStore for MemoryMetadataStore {
    async fn create_user(&self, user: NewUser) -> Result<User> {
        let mut inner = self.inner.write().await;
        ensure!(
            !inner.users.values().any(|u| u.email == user.email),
            "email already registered: {}",
            user.email
        );
        let now = Utc::now();
        let id = inner.alloc_id();
        let user = User {
            id,
            email: user.email,
            hashed_password: user.hashed_password,
            full_name: user.full_name,
            is_active: true,
            is_superuser: false,
            plan: user.plan,
            daily_request_cap: user.daily_request_cap,
            daily_token_cap: user.daily_token_cap,
            created_at: now,
            updated_at: now,
        };
        inner.users.insert(id, user.clone());
        Ok(user)
    }

    async fn get_user(&self, user_id: i64) -> Result<Option<User>> {
        Ok(self.inner.read().await.users.get(&user_id).cloned())
    }

    async fn get_user_by_email(&self, email: &str) -> Result<Option<User>> {
        Ok(self
            .inner
            .read()
            .await
            .users
            .values()
            .find(|u| u.email == email)
            .cloned())
    }

    async fn create_knowledge(&self, kb: NewKnowledge, owner_id: i64) -> Result<Knowledge> {
        let mut inner = self.inner.write().await;
        ensure!(
            !inner.knowledges.values().any(|k| k.name == kb.name),
            "knowledge base name already exists: {}",
            kb.name
        );
        let now = Utc::now();
        let id = inner.alloc_id();
        let knowledge = Knowledge {
            id,
            name: kb.name,
            description: kb.description,
            embed_model: kb.embed_model,
            chunk_size: kb.chunk_size,
            chunk_overlap: kb.chunk_overlap,
            status: KnowledgeStatus::Normal,
            created_at: now,
            updated_at: now,
        };
        inner.knowledges.insert(id, knowledge.clone());
        inner.memberships.push(Membership {
            user_id: owner_id,
            knowledge_id: id,
            role: Role::Owner,
        });
        Ok(knowledge)
    }

    async fn get_knowledge(&self, knowledge_id: i64) -> Result<Option<Knowledge>> {
        Ok(self.inner.read().await.knowledges.get(&knowledge_id).cloned())
    }

    async fn list_knowledge_for_user(&self, user_id: i64) -> Result<Vec<Knowledge>> {
        let inner = self.inner.read().await;
        let mut kbs: Vec<Knowledge> = inner
            .memberships
            .iter()
            .filter(|m| m.user_id == user_id)
            .filter_map(|m| inner.knowledges.get(&m.knowledge_id).cloned())
            .collect();
        kbs.sort_by_key(|k| k.id);
        Ok(kbs)
    }

    async fn update_knowledge(
        &self,
        knowledge_id: i64,
        update: KnowledgeUpdate,
    ) -> Result<Knowledge> {
        let mut inner = self.inner.write().await;
        let kb = inner
            .knowledges
            .get_mut(&knowledge_id)
            .ok_or_else(|| anyhow!("knowledge base {knowledge_id} not found"))?;
        if let Some(name) = update.name {
            kb.name = name;
        }
        if let Some(description) = update.description {
            kb.description = description;
        }
        kb.updated_at = Utc::now();
        Ok(kb.clone())
    }

    async fn set_knowledge_status(
        &self,
        knowledge_id: i64,
        status: KnowledgeStatus,
    ) -> Result<()> {
        let mut inner = self.inner.write().await;
        let kb = inner
            .knowledges
            .get_mut(&knowledge_id)
            .ok_or_else(|| anyhow!("knowledge base {knowledge_id} not found"))?;
        kb.status = status;
        kb.updated_at = Utc::now();
        Ok(())
    }

    async fn delete_knowledge_row(&self, knowledge_id: i64) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner.knowledges.remove(&knowledge_id);
        inner.memberships.retain(|m| m.knowledge_id != knowledge_id);
        Ok(())
    }

    async fn upsert_membership(&self, membership: Membership) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner.memberships.retain(|m| {
            !(m.user_id == membership.user_id && m.knowledge_id == membership.knowledge_id)
        });
        inner.memberships.push(membership);
        Ok(())
    }

    async fn remove_membership(&self, user_id: i64, knowledge_id: i64) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner
            .memberships
            .retain(|m| !(m.user_id == user_id && m.knowledge_id == knowledge_id));
        Ok(())
    }

    async fn get_role(&self, user_id: i64, knowledge_id: i64) -> Result<Option<Role>> {
        Ok(self
            .inner
            .read()
            .await
            .memberships
            .iter()
            .find(|m| m.user_id == user_id && m.knowledge_id == knowledge_id)
            .map(|m| m.role))
    }

    async fn list_members(&self, knowledge_id: i64) -> Result<Vec<Membership>> {
        Ok(self
            .inner
            .read()
            .await
            .memberships
            .iter()
            .filter(|m| m.knowledge_id == knowledge_id)
            .cloned()
            .collect())
    }

    async fn create_document(&self, doc: NewDocument) -> Result<Document> {
        let mut inner = self.inner.write().await;
        ensure!(
            inner.knowledges.contains_key(&doc.knowledge_id),
            "knowledge base {} not found",
            doc.knowledge_id
        );
        let now = Utc::now();
        let id = inner.alloc_id();
        let document = Document {
            id,
            knowledge_id: doc.knowledge_id,
            filename: doc.filename,
            blob_path: doc.blob_path,
            content_hash: doc.content_hash,
            status: DocStatus::Pending,
            error_message: None,
            meta_info: HashMap::new(),
            created_at: now,
            updated_at: now,
        };
        inner.documents.insert(id, document.clone());
        Ok(document)
    }

    async fn get_document(&self, doc_id: i64) -> Result<Option<Document>> {
        Ok(self.inner.read().await.documents.get(&doc_id).cloned())
    }

    async fn list_documents(&self, knowledge_id: i64) -> Result<Vec<Document>> {
        let inner = self.inner.read().await;
        let mut docs: Vec<Document> = inner
            .documents
            .values()
            .filter(|d| d.knowledge_id == knowledge_id)
            .cloned()
            .collect();
        docs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(docs)
    }

    async fn mark_document_processing(&self, doc_id: i64) -> Result<(Document, Knowledge)> {
        let mut inner = self.inner.write().await;
        let knowledge_id = {
            let doc = inner
                .documents
                .get(&doc_id)
                .ok_or_else(|| anyhow!("document {doc_id} not found"))?;
            if !doc.status.can_transition_to(DocStatus::Processing) {
                bail!("document {doc_id} is {:?}, not processable", doc.status);
            }
            doc.knowledge_id
        };
        let knowledge = inner
            .knowledges
            .get(&knowledge_id)
            .cloned()
            .ok_or_else(|| anyhow!("knowledge base {knowledge_id} not found"))?;

        let doc = inner.documents.get_mut(&doc_id).expect("checked above");
        doc.status = DocStatus::Processing;
        doc.error_message = None;
        doc.updated_at = Utc::now();
        Ok((doc.clone(), knowledge))
    }

    async fn complete_document(&self, doc_id: i64, chunks: Vec<NewChunkRow>) -> Result<()> {
        let mut inner = self.inner.write().await;
        {
            let doc = inner
                .documents
                .get(&doc_id)
                .ok_or_else(|| anyhow!("document {doc_id} not found"))?;
            ensure!(
                doc.status == DocStatus::Processing,
                "document {doc_id} is {:?}, expected PROCESSING",
                doc.status
            );
        }

        // Replace any chunk rows from a prior attempt.
        inner.chunks.retain(|_, c| c.document_id != doc_id);
        for chunk in chunks {
            let id = inner.alloc_id();
            inner.chunks.insert(
                id,
                ChunkRow {
                    id,
                    document_id: doc_id,
                    index_entry_id: chunk.index_entry_id,
                    chunk_index: chunk.chunk_index,
                    content: chunk.content,
                    page_number: chunk.page_number,
                },
            );
        }

        let doc = inner.documents.get_mut(&doc_id).expect("checked above");
        doc.status = DocStatus::Completed;
        doc.error_message = None;
        doc.updated_at = Utc::now();
        Ok(())
    }

    async fn fail_document(&self, doc_id: i64, error: &str) -> Result<()> {
        let mut inner = self.inner.write().await;
        let doc = inner
            .documents
            .get_mut(&doc_id)
            .ok_or_else(|| anyhow!("document {doc_id} not found"))?;
        doc.status = DocStatus::Failed;
        doc.error_message = Some(error.to_string());
        doc.updated_at = Utc::now();
        Ok(())
    }

    async fn delete_document_row(&self, doc_id: i64) -> Result<()> {
        let mut inner = self.inner.write().await;
        ensure!(
            inner.documents.remove(&doc_id).is_some(),
            "document {doc_id} not found"
        );
        inner.chunks.retain(|_, c| c.document_id != doc_id);
        Ok(())
    }

    async fn list_chunks(&self, doc_id: i64) -> Result<Vec<ChunkRow>> {
        let inner = self.inner.read().await;
        let mut chunks: Vec<ChunkRow> = inner
            .chunks
            .values()
            .filter(|c| c.document_id == doc_id)
            .cloned()
            .collect();
        chunks.sort_by_key(|c| c.chunk_index);
        Ok(chunks)
    }

    async fn count_chunks(&self, doc_id: i64) -> Result<usize> {
        Ok(self
            .inner
            .read()
            .await
            .chunks
            .values()
            .filter(|c| c.document_id == doc_id)
            .count())
    }

    async fn create_session(&self, session: NewSession) -> Result<ChatSession> {
        let mut inner = self.inner.write().await;
        ensure!(
            inner.knowledges.contains_key(&session.knowledge_id),
            "knowledge base {} not found",
            session.knowledge_id
        );
        let now = Utc::now();
        let chat = ChatSession {
            id: Uuid::new_v4(),
            user_id: session.user_id,
            knowledge_id: session.knowledge_id,
            knowledge_ids: vec![session.knowledge_id],
            title: session.title,
            icon: session.icon,
            top_k: session.top_k,
            is_deleted: false,
            created_at: now,
            updated_at: now,
        };
        inner.sessions.insert(chat.id, chat.clone());
        Ok(chat)
    }

    async fn get_session(&self, session_id: Uuid, user_id: i64) -> Result<Option<ChatSession>> {
        Ok(self
            .inner
            .read()
            .await
            .sessions
            .get(&session_id)
            .filter(|s| s.user_id == user_id && !s.is_deleted)
            .cloned())
    }

    async fn list_sessions(
        &self,
        user_id: i64,
        skip: usize,
        limit: usize,
    ) -> Result<Vec<ChatSession>> {
        let inner = self.inner.read().await;
        let mut sessions: Vec<ChatSession> = inner
            .sessions
            .values()
            .filter(|s| s.user_id == user_id && !s.is_deleted)
            .cloned()
            .collect();
        sessions.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(sessions.into_iter().skip(skip).take(limit).collect())
    }

    async fn update_session(
        &self,
        session_id: Uuid,
        user_id: i64,
        update: SessionUpdate,
    ) -> Result<ChatSession> {
        let mut inner = self.inner.write().await;
        let session = inner
            .sessions
            .get_mut(&session_id)
            .filter(|s| s.user_id == user_id && !s.is_deleted)
            .ok_or_else(|| anyhow!("session {session_id} not found"))?;

        if let Some(title) = update.title {
            session.title = title;
        }
        if let Some(icon) = update.icon {
            session.icon = icon;
        }
        if let Some(top_k) = update.top_k {
            session.top_k = top_k;
        }
        if let Some(knowledge_ids) = update.knowledge_ids {
            if knowledge_ids.is_empty() {
                // Never leave a session without a searchable set.
                session.knowledge_ids = vec![session.knowledge_id];
            } else {
                if !knowledge_ids.contains(&session.knowledge_id) {
                    session.knowledge_id = knowledge_ids[0];
                }
                session.knowledge_ids = knowledge_ids;
            }
        }
        session.updated_at = Utc::now();
        Ok(session.clone())
    }

    async fn soft_delete_session(&self, session_id: Uuid, user_id: i64) -> Result<()> {
        let mut inner = self.inner.write().await;
        let session = inner
            .sessions
            .get_mut(&session_id)
            .filter(|s| s.user_id == user_id)
            .ok_or_else(|| anyhow!("session {session_id} not found"))?;
        session.is_deleted = true;
        session.updated_at = Utc::now();
        Ok(())
    }

    async fn recent_messages(&self, session_id: Uuid, limit: usize) -> Result<Vec<Message>> {
        let inner = self.inner.read().await;
        let mut messages: Vec<Message> = inner
            .messages
            .values()
            .filter(|m| m.session_id == session_id)
            .cloned()
            .collect();
        // Newest first, truncate to the window, then back to oldest-first.
        messages.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        messages.truncate(limit);
        messages.reverse();
        Ok(messages)
    }

    async fn append_turn(
        &self,
        session_id: Uuid,
        user_content: &str,
        assistant: AssistantTurn,
    ) -> Result<()> {
        let mut inner = self.inner.write().await;
        ensure!(
            inner.sessions.contains_key(&session_id),
            "session {session_id} not found"
        );

        let now = Utc::now();
        let user_id = inner.alloc_id();
        inner.messages.insert(
            user_id,
            Message {
                id: user_id,
                session_id,
                role: MessageRole::User,
                content: user_content.to_string(),
                sources: Vec::new(),
                token_usage: 0,
                partial: false,
                created_at: now,
            },
        );
        let assistant_id = inner.alloc_id();
        inner.messages.insert(
            assistant_id,
            Message {
                id: assistant_id,
                session_id,
                role: MessageRole::Assistant,
                content: assistant.content,
                sources: assistant.sources,
                token_usage: assistant.usage.total(),
                partial: assistant.partial,
                created_at: now,
            },
        );

        let session = inner.sessions.get_mut(&session_id).expect("checked above");
        if session.title == DEFAULT_SESSION_TITLE {
            session.title = auto_title(user_content);
        }
        session.updated_at = now;
        Ok(())
    }

    async fn create_testset(&self, name: &str) -> Result<Testset> {
        let mut inner = self.inner.write().await;
        let id = inner.alloc_id();
        let testset = Testset {
            id,
            name: name.to_string(),
            blob_path: None,
            status: TestsetStatus::Pending,
            error_message: None,
            created_at: Utc::now(),
        };
        inner.testsets.insert(id, testset.clone());
        Ok(testset)
    }

    async fn get_testset(&self, testset_id: i64) -> Result<Option<Testset>> {
        Ok(self.inner.read().await.testsets.get(&testset_id).cloned())
    }

    async fn list_testsets(&self) -> Result<Vec<Testset>> {
        let inner = self.inner.read().await;
        let mut testsets: Vec<Testset> = inner.testsets.values().cloned().collect();
        testsets.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(testsets)
    }

    async fn mark_testset_generating(&self, testset_id: i64) -> Result<()> {
        let mut inner = self.inner.write().await;
        let testset = inner
            .testsets
            .get_mut(&testset_id)
            .ok_or_else(|| anyhow!("testset {testset_id} not found"))?;
        testset.status = TestsetStatus::Generating;
        Ok(())
    }

    async fn complete_testset(&self, testset_id: i64, blob_path: &str) -> Result<()> {
        let mut inner = self.inner.write().await;
        let testset = inner
            .testsets
            .get_mut(&testset_id)
            .ok_or_else(|| anyhow!("testset {testset_id} not found"))?;
        testset.status = TestsetStatus::Completed;
        testset.blob_path = Some(blob_path.to_string());
        testset.error_message = None;
        Ok(())
    }

    async fn fail_testset(&self, testset_id: i64, error: &str) -> Result<()> {
        let mut inner = self.inner.write().await;
        let testset = inner
            .testsets
            .get_mut(&testset_id)
            .ok_or_else(|| anyhow!("testset {testset_id} not found"))?;
        testset.status = TestsetStatus::Failed;
        testset.error_message = Some(error.to_string());
        Ok(())
    }

    async fn delete_testset_row(&self, testset_id: i64) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner.testsets.remove(&testset_id);
        Ok(())
    }

    async fn create_experiment(
        &self,
        knowledge_id: i64,
        testset_id: i64,
        params: serde_json::Value,
    ) -> Result<Experiment> {
        let mut inner = self.inner.write().await;
        ensure!(
            inner.knowledges.contains_key(&knowledge_id),
            "knowledge base {knowledge_id} not found"
        );
        ensure!(
            inner.testsets.contains_key(&testset_id),
            "testset {testset_id} not found"
        );
        let id = inner.alloc_id();
        let params = match params {
            serde_json::Value::Object(map) => map.into_iter().collect(),
            _ => HashMap::new(),
        };
        let experiment = Experiment {
            id,
            knowledge_id,
            testset_id,
            params,
            scores: None,
            status: ExperimentStatus::Pending,
            error_message: None,
            created_at: Utc::now(),
        };
        inner.experiments.insert(id, experiment.clone());
        Ok(experiment)
    }

    async fn get_experiment(&self, experiment_id: i64) -> Result<Option<Experiment>> {
        Ok(self
            .inner
            .read()
            .await
            .experiments
            .get(&experiment_id)
            .cloned())
    }

    async fn list_experiments(&self, knowledge_id: Option<i64>) -> Result<Vec<Experiment>> {
        let inner = self.inner.read().await;
        let mut experiments: Vec<Experiment> = inner
            .experiments
            .values()
            .filter(|e| knowledge_id.map(|id| e.knowledge_id == id).unwrap_or(true))
            .cloned()
            .collect();
        experiments.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(experiments)
    }

    async fn mark_experiment_running(&self, experiment_id: i64) -> Result<()> {
        let mut inner = self.inner.write().await;
        let experiment = inner
            .experiments
            .get_mut(&experiment_id)
            .ok_or_else(|| anyhow!("experiment {experiment_id} not found"))?;
        experiment.status = ExperimentStatus::Running;
        Ok(())
    }

    async fn complete_experiment(
        &self,
        experiment_id: i64,
        scores: MetricScores,
    ) -> Result<()> {
        let mut inner = self.inner.write().await;
        let experiment = inner
            .experiments
            .get_mut(&experiment_id)
            .ok_or_else(|| anyhow!("experiment {experiment_id} not found"))?;
        experiment.status = ExperimentStatus::Completed;
        experiment.scores = Some(scores);
        experiment.error_message = None;
        Ok(())
    }

    async fn fail_experiment(&self, experiment_id: i64, error: &str) -> Result<()> {
        let mut inner = self.inner.write().await;
        let experiment = inner
            .experiments
            .get_mut(&experiment_id)
            .ok_or_else(|| anyhow!("experiment {experiment_id} not found"))?;
        experiment.status = ExperimentStatus::Failed;
        experiment.error_message = Some(error.to_string());
        Ok(())
    }

    async fn delete_experiment_row(&self, experiment_id: i64) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner.experiments.remove(&experiment_id);
        Ok(())
    }

    async fn delete_experiments_by_knowledge(&self, knowledge_id: i64) -> Result<Vec<i64>> {
        let mut inner = self.inner.write().await;
        let doomed: Vec<i64> = inner
            .experiments
            .values()
            .filter(|e| e.knowledge_id == knowledge_id)
            .map(|e| e.id)
            .collect();
        for id in &doomed {
            inner.experiments.remove(id);
        }
        Ok(doomed)
    }

    async fn reset_interrupted(&self) -> Result<ReconcileReport> {
        let mut inner = self.inner.write().await;
        let mut report = ReconcileReport::default();

        for doc in inner.documents.values_mut() {
            if doc.status == DocStatus::Processing {
                doc.status = DocStatus::Failed;
                doc.error_message = Some(INTERRUPTED_MESSAGE.to_string());
                doc.updated_at = Utc::now();
                report.documents += 1;
            }
        }
        for testset in inner.testsets.values_mut() {
            if testset.status == TestsetStatus::Generating {
                testset.status = TestsetStatus::Failed;
                testset.error_message = Some(INTERRUPTED_MESSAGE.to_string());
                report.testsets += 1;
            }
        }
        for experiment in inner.experiments.values_mut() {
            if experiment.status == ExperimentStatus::Running {
                experiment.status = ExperimentStatus::Failed;
                experiment.error_message = Some(INTERRUPTED_MESSAGE.to_string());
                report.experiments += 1;
            }
        }
        for kb in inner.knowledges.values_mut() {
            if kb.status == KnowledgeStatus::Deleting {
                kb.status = KnowledgeStatus::Failed;
                kb.updated_at = Utc::now();
                report.knowledges += 1;
            }
        }

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TokenUsage;

    async fn seeded_store() -> Result<(MemoryMetadataStore, User, Knowledge)> {
        let store = MemoryMetadataStore::new();
        let user = store
            .create_user(NewUser {
                email: "owner@example.com".into(),
                hashed_password: "hash".into(),
                full_name: None,
                plan: "free".into(),
                daily_request_cap: 200,
                daily_token_cap: 500_000,
            })
            .await?;
        let kb = store
            .create_knowledge(
                NewKnowledge {
                    name: "docs".into(),
                    description: None,
                    embed_model: "deterministic".into(),
                    chunk_size: 500,
                    chunk_overlap: 50,
                },
                user.id,
            )
            .await?;
        Ok((store, user, kb))
    }

    #[tokio::test]
    async fn test_owner_membership_created_with_kb() -> Result<()> {
        let (store, user, kb) = seeded_store().await?;
        assert_eq!(store.get_role(user.id, kb.id).await?, Some(Role::Owner));
        assert_eq!(store.list_knowledge_for_user(user.id).await?.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_document_lifecycle() -> Result<()> {
        let (store, _, kb) = seeded_store().await?;
        let doc = store
            .create_document(NewDocument {
                knowledge_id: kb.id,
                filename: "a.txt".into(),
                blob_path: "1/x_a.txt".into(),
                content_hash: None,
            })
            .await?;
        assert_eq!(doc.status, DocStatus::Pending);

        let (marked, knowledge) = store.mark_document_processing(doc.id).await?;
        assert_eq!(marked.status, DocStatus::Processing);
        assert_eq!(knowledge.id, kb.id);

        // COMPLETED documents cannot be re-marked.
        store
            .complete_document(
                doc.id,
                vec![NewChunkRow {
                    index_entry_id: "e1".into(),
                    chunk_index: 0,
                    content: "chunk".into(),
                    page_number: None,
                }],
            )
            .await?;
        assert!(store.mark_document_processing(doc.id).await.is_err());
        assert_eq!(store.count_chunks(doc.id).await?, 1);

        store.delete_document_row(doc.id).await?;
        assert!(store.get_document(doc.id).await?.is_none());
        assert_eq!(store.count_chunks(doc.id).await?, 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_failed_document_can_reprocess() -> Result<()> {
        let (store, _, kb) = seeded_store().await?;
        let doc = store
            .create_document(NewDocument {
                knowledge_id: kb.id,
                filename: "a.txt".into(),
                blob_path: "1/y_a.txt".into(),
                content_hash: None,
            })
            .await?;
        store.mark_document_processing(doc.id).await?;
        store.fail_document(doc.id, "embed failed").await?;

        let (marked, _) = store.mark_document_processing(doc.id).await?;
        assert_eq!(marked.status, DocStatus::Processing);
        assert!(marked.error_message.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn test_append_turn_auto_title_and_window() -> Result<()> {
        let (store, user, kb) = seeded_store().await?;
        let session = store
            .create_session(NewSession {
                user_id: user.id,
                knowledge_id: kb.id,
                title: DEFAULT_SESSION_TITLE.into(),
                icon: "message-square".into(),
                top_k: 5,
            })
            .await?;
        assert_eq!(session.knowledge_ids, vec![kb.id]);

        store
            .append_turn(
                session.id,
                "what is the mysql port number please",
                AssistantTurn {
                    content: "3306".into(),
                    sources: Vec::new(),
                    usage: TokenUsage {
                        input_tokens: 10,
                        output_tokens: 2,
                    },
                    partial: false,
                },
            )
            .await?;

        let updated = store.get_session(session.id, user.id).await?.unwrap();
        assert_eq!(updated.title, "what is the mysql po...");

        let messages = store.recent_messages(session.id, 20).await?;
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, MessageRole::User);
        assert_eq!(messages[1].role, MessageRole::Assistant);
        assert_eq!(messages[1].token_usage, 12);
        Ok(())
    }

    #[tokio::test]
    async fn test_session_update_keeps_primary_invariant() -> Result<()> {
        let (store, user, kb) = seeded_store().await?;
        let kb2 = store
            .create_knowledge(
                NewKnowledge {
                    name: "more-docs".into(),
                    description: None,
                    embed_model: "deterministic".into(),
                    chunk_size: 500,
                    chunk_overlap: 50,
                },
                user.id,
            )
            .await?;
        let session = store
            .create_session(NewSession {
                user_id: user.id,
                knowledge_id: kb.id,
                title: DEFAULT_SESSION_TITLE.into(),
                icon: "i".into(),
                top_k: 5,
            })
            .await?;

        // Empty list falls back to the primary.
        let updated = store
            .update_session(
                session.id,
                user.id,
                SessionUpdate {
                    knowledge_ids: Some(Vec::new()),
                    ..Default::default()
                },
            )
            .await?;
        assert_eq!(updated.knowledge_ids, vec![kb.id]);

        // A list without the old primary promotes its first element.
        let updated = store
            .update_session(
                session.id,
                user.id,
                SessionUpdate {
                    knowledge_ids: Some(vec![kb2.id]),
                    ..Default::default()
                },
            )
            .await?;
        assert_eq!(updated.knowledge_id, kb2.id);
        assert!(updated.knowledge_ids.contains(&updated.knowledge_id));
        Ok(())
    }

    #[tokio::test]
    async fn test_reset_interrupted() -> Result<()> {
        let (store, _, kb) = seeded_store().await?;
        let doc = store
            .create_document(NewDocument {
                knowledge_id: kb.id,
                filename: "a.txt".into(),
                blob_path: "1/z_a.txt".into(),
                content_hash: None,
            })
            .await?;
        store.mark_document_processing(doc.id).await?;

        let testset = store.create_testset("eval-1").await?;
        store.mark_testset_generating(testset.id).await?;
        let experiment = store
            .create_experiment(kb.id, testset.id, serde_json::json!({}))
            .await?;
        store.mark_experiment_running(experiment.id).await?;
        store
            .set_knowledge_status(kb.id, KnowledgeStatus::Deleting)
            .await?;

        let report = store.reset_interrupted().await?;
        assert_eq!(report.total(), 4);

        let doc = store.get_document(doc.id).await?.unwrap();
        assert_eq!(doc.status, DocStatus::Failed);
        assert!(doc.error_message.unwrap().contains("interrupted"));
        assert_eq!(
            store.get_testset(testset.id).await?.unwrap().status,
            TestsetStatus::Failed
        );
        assert_eq!(
            store.get_experiment(experiment.id).await?.unwrap().status,
            ExperimentStatus::Failed
        );
        assert_eq!(
            store.get_knowledge(kb.id).await?.unwrap().status,
            KnowledgeStatus::Failed
        );
        Ok(())
    }
}
