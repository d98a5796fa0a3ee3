// Postgres metadata store.
// sqlx-backed implementation of the MetadataStore contract. Multi-row
// methods run inside transactions; everything else is a single statement.
// The schema bootstraps idempotently at pool creation.

use anyhow::{anyhow, bail, ensure, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use uuid::Uuid;

use crate::contracts::{
    AssistantTurn, KnowledgeUpdate, MetadataStore, NewChunkRow, NewDocument, NewKnowledge,
    NewSession, NewUser, ReconcileReport, SessionUpdate,
};
use crate::errors::INTERRUPTED_MESSAGE;
use crate::models::{
    ChatSession, ChunkRow, DocStatus, Document, Experiment, Knowledge, KnowledgeStatus,
    Membership, Message, MessageRole, MessageSource, MetricScores, Role, Testset, TokenUsage,
    User, DEFAULT_SESSION_TITLE,
};

use super::auto_title;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS users (
    id BIGSERIAL PRIMARY KEY,
    email TEXT NOT NULL UNIQUE,
    hashed_password TEXT NOT NULL,
    full_name TEXT,
    is_active BOOLEAN NOT NULL DEFAULT TRUE,
    is_superuser BOOLEAN NOT NULL DEFAULT FALSE,
    plan TEXT NOT NULL DEFAULT 'free',
    daily_request_cap BIGINT NOT NULL,
    daily_token_cap BIGINT NOT NULL,
    created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
    updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
);

CREATE TABLE IF NOT EXISTS knowledges (
    id BIGSERIAL PRIMARY KEY,
    name TEXT NOT NULL UNIQUE,
    description TEXT,
    embed_model TEXT NOT NULL,
    chunk_size BIGINT NOT NULL,
    chunk_overlap BIGINT NOT NULL,
    status TEXT NOT NULL DEFAULT 'NORMAL',
    created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
    updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
);

CREATE TABLE IF NOT EXISTS memberships (
    user_id BIGINT NOT NULL REFERENCES users(id),
    knowledge_id BIGINT NOT NULL REFERENCES knowledges(id),
    role TEXT NOT NULL,
    PRIMARY KEY (user_id, knowledge_id)
);

CREATE TABLE IF NOT EXISTS documents (
    id BIGSERIAL PRIMARY KEY,
    knowledge_id BIGINT NOT NULL REFERENCES knowledges(id),
    filename TEXT NOT NULL,
    blob_path TEXT NOT NULL UNIQUE,
    content_hash TEXT,
    status TEXT NOT NULL DEFAULT 'PENDING',
    error_message TEXT,
    meta_info JSONB NOT NULL DEFAULT '{}',
    created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
    updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
);
CREATE INDEX IF NOT EXISTS idx_documents_knowledge ON documents(knowledge_id);
CREATE INDEX IF NOT EXISTS idx_documents_status ON documents(status);

CREATE TABLE IF NOT EXISTS chunks (
    id BIGSERIAL PRIMARY KEY,
    document_id BIGINT NOT NULL REFERENCES documents(id) ON DELETE CASCADE,
    index_entry_id TEXT NOT NULL,
    chunk_index BIGINT NOT NULL,
    content TEXT NOT NULL,
    page_number BIGINT
);
CREATE INDEX IF NOT EXISTS idx_chunks_document ON chunks(document_id);

CREATE TABLE IF NOT EXISTS chat_sessions (
    id UUID PRIMARY KEY,
    user_id BIGINT NOT NULL REFERENCES users(id),
    knowledge_id BIGINT NOT NULL,
    knowledge_ids JSONB NOT NULL DEFAULT '[]',
    title TEXT NOT NULL,
    icon TEXT NOT NULL,
    top_k BIGINT NOT NULL,
    is_deleted BOOLEAN NOT NULL DEFAULT FALSE,
    created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
    updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
);
CREATE INDEX IF NOT EXISTS idx_sessions_user ON chat_sessions(user_id);

CREATE TABLE IF NOT EXISTS messages (
    id BIGSERIAL PRIMARY KEY,
    session_id UUID NOT NULL REFERENCES chat_sessions(id),
    role TEXT NOT NULL,
    content TEXT NOT NULL,
    sources JSONB NOT NULL DEFAULT '[]',
    token_usage BIGINT NOT NULL DEFAULT 0,
    partial BOOLEAN NOT NULL DEFAULT FALSE,
    created_at TIMESTAMPTZ NOT NULL DEFAULT now()
);
CREATE INDEX IF NOT EXISTS idx_messages_session ON messages(session_id);

CREATE TABLE IF NOT EXISTS testsets (
    id BIGSERIAL PRIMARY KEY,
    name TEXT NOT NULL,
    blob_path TEXT,
    status TEXT NOT NULL DEFAULT 'PENDING',
    error_message TEXT,
    created_at TIMESTAMPTZ NOT NULL DEFAULT now()
);

CREATE TABLE IF NOT EXISTS experiments (
    id BIGSERIAL PRIMARY KEY,
    knowledge_id BIGINT NOT NULL,
    testset_id BIGINT NOT NULL,
    params JSONB NOT NULL DEFAULT '{}',
    scores JSONB,
    status TEXT NOT NULL DEFAULT 'PENDING',
    error_message TEXT,
    created_at TIMESTAMPTZ NOT NULL DEFAULT now()
);
CREATE INDEX IF NOT EXISTS idx_experiments_knowledge ON experiments(knowledge_id);
"#;

fn json_to<T: serde::de::DeserializeOwned + Default>(value: serde_json::Value) -> T {
    serde_json::from_value(value).unwrap_or_default()
}

fn status_str<T: serde::Serialize>(status: &T) -> String {
    serde_json::to_value(status)
        .ok()
        .and_then(|v| v.as_str().map(String::from))
        .unwrap_or_default()
}

fn parse_status<T: serde::de::DeserializeOwned>(raw: &str) -> Result<T> {
    serde_json::from_value(serde_json::Value::String(raw.to_string()))
        .map_err(|e| anyhow!("invalid status {raw}: {e}"))
}

fn row_to_user(row: &PgRow) -> Result<User> {
    Ok(User {
        id: row.try_get("id")?,
        email: row.try_get("email")?,
        hashed_password: row.try_get("hashed_password")?,
        full_name: row.try_get("full_name")?,
        is_active: row.try_get("is_active")?,
        is_superuser: row.try_get("is_superuser")?,
        plan: row.try_get("plan")?,
        daily_request_cap: row.try_get("daily_request_cap")?,
        daily_token_cap: row.try_get("daily_token_cap")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn row_to_knowledge(row: &PgRow) -> Result<Knowledge> {
    Ok(Knowledge {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        description: row.try_get("description")?,
        embed_model: row.try_get("embed_model")?,
        chunk_size: row.try_get::<i64, _>("chunk_size")? as usize,
        chunk_overlap: row.try_get::<i64, _>("chunk_overlap")? as usize,
        status: parse_status(row.try_get::<String, _>("status")?.as_str())?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn row_to_document(row: &PgRow) -> Result<Document> {
    Ok(Document {
        id: row.try_get("id")?,
        knowledge_id: row.try_get("knowledge_id")?,
        filename: row.try_get("filename")?,
        blob_path: row.try_get("blob_path")?,
        content_hash: row.try_get("content_hash")?,
        status: parse_status(row.try_get::<String, _>("status")?.as_str())?,
        error_message: row.try_get("error_message")?,
        meta_info: json_to(row.try_get::<serde_json::Value, _>("meta_info")?),
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn row_to_chunk(row: &PgRow) -> Result<ChunkRow> {
    Ok(ChunkRow {
        id: row.try_get("id")?,
        document_id: row.try_get("document_id")?,
        index_entry_id: row.try_get("index_entry_id")?,
        chunk_index: row.try_get::<i64, _>("chunk_index")? as usize,
        content: row.try_get("content")?,
        page_number: row
            .try_get::<Option<i64>, _>("page_number")?
            .map(|p| p as u32),
    })
}

fn row_to_session(row: &PgRow) -> Result<ChatSession> {
    Ok(ChatSession {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        knowledge_id: row.try_get("knowledge_id")?,
        knowledge_ids: json_to(row.try_get::<serde_json::Value, _>("knowledge_ids")?),
        title: row.try_get("title")?,
        icon: row.try_get("icon")?,
        top_k: row.try_get::<i64, _>("top_k")? as usize,
        is_deleted: row.try_get("is_deleted")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn row_to_message(row: &PgRow) -> Result<Message> {
    let role: String = row.try_get("role")?;
    Ok(Message {
        id: row.try_get("id")?,
        session_id: row.try_get("session_id")?,
        role: parse_status::<MessageRole>(&role)?,
        content: row.try_get("content")?,
        sources: json_to::<Vec<MessageSource>>(row.try_get::<serde_json::Value, _>("sources")?),
        token_usage: row.try_get::<i64, _>("token_usage")? as u64,
        partial: row.try_get("partial")?,
        created_at: row.try_get("created_at")?,
    })
}

fn row_to_testset(row: &PgRow) -> Result<Testset> {
    Ok(Testset {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        blob_path: row.try_get("blob_path")?,
        status: parse_status(row.try_get::<String, _>("status")?.as_str())?,
        error_message: row.try_get("error_message")?,
        created_at: row.try_get("created_at")?,
    })
}

fn row_to_experiment(row: &PgRow) -> Result<Experiment> {
    Ok(Experiment {
        id: row.try_get("id")?,
        knowledge_id: row.try_get("knowledge_id")?,
        testset_id: row.try_get("testset_id")?,
        params: json_to::<HashMap<String, serde_json::Value>>(
            row.try_get::<serde_json::Value, _>("params")?,
        ),
        scores: row
            .try_get::<Option<serde_json::Value>, _>("scores")?
            .and_then(|v| serde_json::from_value::<MetricScores>(v).ok()),
        status: parse_status(row.try_get::<String, _>("status")?.as_str())?,
        error_message: row.try_get("error_message")?,
        created_at: row.try_get("created_at")?,
    })
}

pub struct PgMetadataStore {
    pool: PgPool,
}

impl PgMetadataStore {
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .acquire_timeout(Duration::from_secs(10))
            .connect(database_url)
            .await
            .context("Failed to connect to Postgres")?;

        sqlx::raw_sql(SCHEMA)
            .execute(&pool)
            .await
            .context("Schema bootstrap failed")?;

        info!("Postgres metadata store ready");
        Ok(Self { pool })
    }
}

#[async_trait]
impl MetadataStore for PgMetadataStore {
    async fn create_user(&self, user: NewUser) -> Result<User> {
        let row = sqlx::query(
            "INSERT INTO users (email, hashed_password, full_name, plan, daily_request_cap, daily_token_cap)
             VALUES ($1, $2, $3, $4, $5, $6) RETURNING *",
        )
        .bind(&user.email)
        .bind(&user.hashed_password)
        .bind(&user.full_name)
        .bind(&user.plan)
        .bind(user.daily_request_cap)
        .bind(user.daily_token_cap)
        .fetch_one(&self.pool)
        .await
        .context("user insert failed")?;
        row_to_user(&row)
    }

    async fn get_user(&self, user_id: i64) -> Result<Option<User>> {
        let row = sqlx::query("SELECT * FROM users WHERE id = $1")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_user).transpose()
    }

    async fn get_user_by_email(&self, email: &str) -> Result<Option<User>> {
        let row = sqlx::query("SELECT * FROM users WHERE email = $1")
            .bind(email)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_user).transpose()
    }

    async fn create_knowledge(&self, kb: NewKnowledge, owner_id: i64) -> Result<Knowledge> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query(
            "INSERT INTO knowledges (name, description, embed_model, chunk_size, chunk_overlap)
             VALUES ($1, $2, $3, $4, $5) RETURNING *",
        )
        .bind(&kb.name)
        .bind(&kb.description)
        .bind(&kb.embed_model)
        .bind(kb.chunk_size as i64)
        .bind(kb.chunk_overlap as i64)
        .fetch_one(&mut *tx)
        .await?;
        let knowledge = row_to_knowledge(&row)?;

        sqlx::query("INSERT INTO memberships (user_id, knowledge_id, role) VALUES ($1, $2, $3)")
            .bind(owner_id)
            .bind(knowledge.id)
            .bind(status_str(&Role::Owner))
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(knowledge)
    }

    async fn get_knowledge(&self, knowledge_id: i64) -> Result<Option<Knowledge>> {
        let row = sqlx::query("SELECT * FROM knowledges WHERE id = $1")
            .bind(knowledge_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_knowledge).transpose()
    }

    async fn list_knowledge_for_user(&self, user_id: i64) -> Result<Vec<Knowledge>> {
        let rows = sqlx::query(
            "SELECT k.* FROM knowledges k
             JOIN memberships m ON m.knowledge_id = k.id
             WHERE m.user_id = $1 ORDER BY k.id",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_knowledge).collect()
    }

    async fn update_knowledge(
        &self,
        knowledge_id: i64,
        update: KnowledgeUpdate,
    ) -> Result<Knowledge> {
        let row = sqlx::query(
            "UPDATE knowledges SET
                name = COALESCE($2, name),
                description = CASE WHEN $3 THEN $4 ELSE description END,
                updated_at = now()
             WHERE id = $1 RETURNING *",
        )
        .bind(knowledge_id)
        .bind(&update.name)
        .bind(update.description.is_some())
        .bind(update.description.flatten())
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| anyhow!("knowledge base {knowledge_id} not found"))?;
        row_to_knowledge(&row)
    }

    async fn set_knowledge_status(
        &self,
        knowledge_id: i64,
        status: KnowledgeStatus,
    ) -> Result<()> {
        let result =
            sqlx::query("UPDATE knowledges SET status = $2, updated_at = now() WHERE id = $1")
                .bind(knowledge_id)
                .bind(status_str(&status))
                .execute(&self.pool)
                .await?;
        ensure!(
            result.rows_affected() == 1,
            "knowledge base {knowledge_id} not found"
        );
        Ok(())
    }

    async fn delete_knowledge_row(&self, knowledge_id: i64) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM memberships WHERE knowledge_id = $1")
            .bind(knowledge_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM knowledges WHERE id = $1")
            .bind(knowledge_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn upsert_membership(&self, membership: Membership) -> Result<()> {
        sqlx::query(
            "INSERT INTO memberships (user_id, knowledge_id, role) VALUES ($1, $2, $3)
             ON CONFLICT (user_id, knowledge_id) DO UPDATE SET role = EXCLUDED.role",
        )
        .bind(membership.user_id)
        .bind(membership.knowledge_id)
        .bind(status_str(&membership.role))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn remove_membership(&self, user_id: i64, knowledge_id: i64) -> Result<()> {
        sqlx::query("DELETE FROM memberships WHERE user_id = $1 AND knowledge_id = $2")
            .bind(user_id)
            .bind(knowledge_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get_role(&self, user_id: i64, knowledge_id: i64) -> Result<Option<Role>> {
        let row = sqlx::query(
            "SELECT role FROM memberships WHERE user_id = $1 AND knowledge_id = $2",
        )
        .bind(user_id)
        .bind(knowledge_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| parse_status::<Role>(r.try_get::<String, _>("role")?.as_str()))
            .transpose()
    }

    async fn list_members(&self, knowledge_id: i64) -> Result<Vec<Membership>> {
        let rows = sqlx::query("SELECT * FROM memberships WHERE knowledge_id = $1")
            .bind(knowledge_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|r| {
                Ok(Membership {
                    user_id: r.try_get("user_id")?,
                    knowledge_id: r.try_get("knowledge_id")?,
                    role: parse_status(r.try_get::<String, _>("role")?.as_str())?,
                })
            })
            .collect()
    }

    async fn create_document(&self, doc: NewDocument) -> Result<Document> {
        let row = sqlx::query(
            "INSERT INTO documents (knowledge_id, filename, blob_path, content_hash)
             VALUES ($1, $2, $3, $4) RETURNING *",
        )
        .bind(doc.knowledge_id)
        .bind(&doc.filename)
        .bind(&doc.blob_path)
        .bind(&doc.content_hash)
        .fetch_one(&self.pool)
        .await
        .context("document insert failed")?;
        row_to_document(&row)
    }

    async fn get_document(&self, doc_id: i64) -> Result<Option<Document>> {
        let row = sqlx::query("SELECT * FROM documents WHERE id = $1")
            .bind(doc_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_document).transpose()
    }

    async fn list_documents(&self, knowledge_id: i64) -> Result<Vec<Document>> {
        let rows = sqlx::query(
            "SELECT * FROM documents WHERE knowledge_id = $1 ORDER BY created_at DESC",
        )
        .bind(knowledge_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_document).collect()
    }

    async fn mark_document_processing(&self, doc_id: i64) -> Result<(Document, Knowledge)> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query("SELECT * FROM documents WHERE id = $1 FOR UPDATE")
            .bind(doc_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| anyhow!("document {doc_id} not found"))?;
        let doc = row_to_document(&row)?;
        if !doc.status.can_transition_to(DocStatus::Processing) {
            bail!("document {doc_id} is {:?}, not processable", doc.status);
        }

        let kb_row = sqlx::query("SELECT * FROM knowledges WHERE id = $1")
            .bind(doc.knowledge_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| anyhow!("knowledge base {} not found", doc.knowledge_id))?;
        let knowledge = row_to_knowledge(&kb_row)?;

        let updated = sqlx::query(
            "UPDATE documents SET status = 'PROCESSING', error_message = NULL, updated_at = now()
             WHERE id = $1 RETURNING *",
        )
        .bind(doc_id)
        .fetch_one(&mut *tx)
        .await?;
        let doc = row_to_document(&updated)?;

        // Commit releases the connection before any long-running work.
        tx.commit().await?;
        Ok((doc, knowledge))
    }

    async fn complete_document(&self, doc_id: i64, chunks: Vec<NewChunkRow>) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let status: Option<String> =
            sqlx::query_scalar("SELECT status FROM documents WHERE id = $1 FOR UPDATE")
                .bind(doc_id)
                .fetch_optional(&mut *tx)
                .await?;
        match status.as_deref() {
            Some("PROCESSING") => {}
            Some(other) => bail!("document {doc_id} is {other}, expected PROCESSING"),
            None => bail!("document {doc_id} not found"),
        }

        sqlx::query("DELETE FROM chunks WHERE document_id = $1")
            .bind(doc_id)
            .execute(&mut *tx)
            .await?;
        for chunk in &chunks {
            sqlx::query(
                "INSERT INTO chunks (document_id, index_entry_id, chunk_index, content, page_number)
                 VALUES ($1, $2, $3, $4, $5)",
            )
            .bind(doc_id)
            .bind(&chunk.index_entry_id)
            .bind(chunk.chunk_index as i64)
            .bind(&chunk.content)
            .bind(chunk.page_number.map(|p| p as i64))
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query(
            "UPDATE documents SET status = 'COMPLETED', error_message = NULL, updated_at = now()
             WHERE id = $1",
        )
        .bind(doc_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn fail_document(&self, doc_id: i64, error: &str) -> Result<()> {
        let result = sqlx::query(
            "UPDATE documents SET status = 'FAILED', error_message = $2, updated_at = now()
             WHERE id = $1",
        )
        .bind(doc_id)
        .bind(error)
        .execute(&self.pool)
        .await?;
        ensure!(result.rows_affected() == 1, "document {doc_id} not found");
        Ok(())
    }

    async fn delete_document_row(&self, doc_id: i64) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM chunks WHERE document_id = $1")
            .bind(doc_id)
            .execute(&mut *tx)
            .await?;
        let result = sqlx::query("DELETE FROM documents WHERE id = $1")
            .bind(doc_id)
            .execute(&mut *tx)
            .await?;
        ensure!(result.rows_affected() == 1, "document {doc_id} not found");
        tx.commit().await?;
        Ok(())
    }

    async fn list_chunks(&self, doc_id: i64) -> Result<Vec<ChunkRow>> {
        let rows =
            sqlx::query("SELECT * FROM chunks WHERE document_id = $1 ORDER BY chunk_index")
                .bind(doc_id)
                .fetch_all(&self.pool)
                .await?;
        rows.iter().map(row_to_chunk).collect()
    }

    async fn count_chunks(&self, doc_id: i64) -> Result<usize> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunks WHERE document_id = $1")
            .bind(doc_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(count as usize)
    }

    async fn create_session(&self, session: NewSession) -> Result<ChatSession> {
        let id = Uuid::new_v4();
        let row = sqlx::query(
            "INSERT INTO chat_sessions (id, user_id, knowledge_id, knowledge_ids, title, icon, top_k)
             VALUES ($1, $2, $3, $4, $5, $6, $7) RETURNING *",
        )
        .bind(id)
        .bind(session.user_id)
        .bind(session.knowledge_id)
        .bind(serde_json::json!([session.knowledge_id]))
        .bind(&session.title)
        .bind(&session.icon)
        .bind(session.top_k as i64)
        .fetch_one(&self.pool)
        .await?;
        row_to_session(&row)
    }

    async fn get_session(&self, session_id: Uuid, user_id: i64) -> Result<Option<ChatSession>> {
        let row = sqlx::query(
            "SELECT * FROM chat_sessions
             WHERE id = $1 AND user_id = $2 AND is_deleted = FALSE",
        )
        .bind(session_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_session).transpose()
    }

    async fn list_sessions(
        &self,
        user_id: i64,
        skip: usize,
        limit: usize,
    ) -> Result<Vec<ChatSession>> {
        let rows = sqlx::query(
            "SELECT * FROM chat_sessions
             WHERE user_id = $1 AND is_deleted = FALSE
             ORDER BY updated_at DESC OFFSET $2 LIMIT $3",
        )
        .bind(user_id)
        .bind(skip as i64)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_session).collect()
    }

    async fn update_session(
        &self,
        session_id: Uuid,
        user_id: i64,
        update: SessionUpdate,
    ) -> Result<ChatSession> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query(
            "SELECT * FROM chat_sessions
             WHERE id = $1 AND user_id = $2 AND is_deleted = FALSE FOR UPDATE",
        )
        .bind(session_id)
        .bind(user_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| anyhow!("session {session_id} not found"))?;
        let mut session = row_to_session(&row)?;

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
                session.knowledge_ids = vec![session.knowledge_id];
            } else {
                if !knowledge_ids.contains(&session.knowledge_id) {
                    session.knowledge_id = knowledge_ids[0];
                }
                session.knowledge_ids = knowledge_ids;
            }
        }

        let updated = sqlx::query(
            "UPDATE chat_sessions SET title = $2, icon = $3, top_k = $4,
                knowledge_id = $5, knowledge_ids = $6, updated_at = now()
             WHERE id = $1 RETURNING *",
        )
        .bind(session_id)
        .bind(&session.title)
        .bind(&session.icon)
        .bind(session.top_k as i64)
        .bind(session.knowledge_id)
        .bind(serde_json::to_value(&session.knowledge_ids)?)
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;
        row_to_session(&updated)
    }

    async fn soft_delete_session(&self, session_id: Uuid, user_id: i64) -> Result<()> {
        let result = sqlx::query(
            "UPDATE chat_sessions SET is_deleted = TRUE, updated_at = now()
             WHERE id = $1 AND user_id = $2",
        )
        .bind(session_id)
        .bind(user_id)
        .execute(&self.pool)
        .await?;
        ensure!(result.rows_affected() == 1, "session {session_id} not found");
        Ok(())
    }

    async fn recent_messages(&self, session_id: Uuid, limit: usize) -> Result<Vec<Message>> {
        let rows = sqlx::query(
            "SELECT * FROM messages WHERE session_id = $1
             ORDER BY created_at DESC, id DESC LIMIT $2",
        )
        .bind(session_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        let mut messages: Vec<Message> = rows.iter().map(row_to_message).collect::<Result<_>>()?;
        messages.reverse();
        Ok(messages)
    }

    async fn append_turn(
        &self,
        session_id: Uuid,
        user_content: &str,
        assistant: AssistantTurn,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let title: Option<String> = sqlx::query_scalar(
            "SELECT title FROM chat_sessions WHERE id = $1 FOR UPDATE",
        )
        .bind(session_id)
        .fetch_optional(&mut *tx)
        .await?;
        let title = title.ok_or_else(|| anyhow!("session {session_id} not found"))?;

        let now: DateTime<Utc> = Utc::now();
        sqlx::query(
            "INSERT INTO messages (session_id, role, content, sources, token_usage, partial, created_at)
             VALUES ($1, 'user', $2, '[]', 0, FALSE, $3)",
        )
        .bind(session_id)
        .bind(user_content)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        let usage: TokenUsage = assistant.usage;
        sqlx::query(
            "INSERT INTO messages (session_id, role, content, sources, token_usage, partial, created_at)
             VALUES ($1, 'assistant', $2, $3, $4, $5, $6)",
        )
        .bind(session_id)
        .bind(&assistant.content)
        .bind(serde_json::to_value(&assistant.sources)?)
        .bind(usage.total() as i64)
        .bind(assistant.partial)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        let new_title = if title == DEFAULT_SESSION_TITLE {
            auto_title(user_content)
        } else {
            title
        };
        sqlx::query("UPDATE chat_sessions SET title = $2, updated_at = $3 WHERE id = $1")
            .bind(session_id)
            .bind(&new_title)
            .bind(now)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn create_testset(&self, name: &str) -> Result<Testset> {
        let row = sqlx::query("INSERT INTO testsets (name) VALUES ($1) RETURNING *")
            .bind(name)
            .fetch_one(&self.pool)
            .await?;
        row_to_testset(&row)
    }

    async fn get_testset(&self, testset_id: i64) -> Result<Option<Testset>> {
        let row = sqlx::query("SELECT * FROM testsets WHERE id = $1")
            .bind(testset_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_testset).transpose()
    }

    async fn list_testsets(&self) -> Result<Vec<Testset>> {
        let rows = sqlx::query("SELECT * FROM testsets ORDER BY created_at DESC")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_testset).collect()
    }

    async fn mark_testset_generating(&self, testset_id: i64) -> Result<()> {
        let result = sqlx::query("UPDATE testsets SET status = 'GENERATING' WHERE id = $1")
            .bind(testset_id)
            .execute(&self.pool)
            .await?;
        ensure!(result.rows_affected() == 1, "testset {testset_id} not found");
        Ok(())
    }

    async fn complete_testset(&self, testset_id: i64, blob_path: &str) -> Result<()> {
        let result = sqlx::query(
            "UPDATE testsets SET status = 'COMPLETED', blob_path = $2, error_message = NULL
             WHERE id = $1",
        )
        .bind(testset_id)
        .bind(blob_path)
        .execute(&self.pool)
        .await?;
        ensure!(result.rows_affected() == 1, "testset {testset_id} not found");
        Ok(())
    }

    async fn fail_testset(&self, testset_id: i64, error: &str) -> Result<()> {
        let result = sqlx::query(
            "UPDATE testsets SET status = 'FAILED', error_message = $2 WHERE id = $1",
        )
        .bind(testset_id)
        .bind(error)
        .execute(&self.pool)
        .await?;
        ensure!(result.rows_affected() == 1, "testset {testset_id} not found");
        Ok(())
    }

    async fn delete_testset_row(&self, testset_id: i64) -> Result<()> {
        sqlx::query("DELETE FROM testsets WHERE id = $1")
            .bind(testset_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn create_experiment(
        &self,
        knowledge_id: i64,
        testset_id: i64,
        params: serde_json::Value,
    ) -> Result<Experiment> {
        let row = sqlx::query(
            "INSERT INTO experiments (knowledge_id, testset_id, params)
             VALUES ($1, $2, $3) RETURNING *",
        )
        .bind(knowledge_id)
        .bind(testset_id)
        .bind(params)
        .fetch_one(&self.pool)
        .await?;
        row_to_experiment(&row)
    }

    async fn get_experiment(&self, experiment_id: i64) -> Result<Option<Experiment>> {
        let row = sqlx::query("SELECT * FROM experiments WHERE id = $1")
            .bind(experiment_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_experiment).transpose()
    }

    async fn list_experiments(&self, knowledge_id: Option<i64>) -> Result<Vec<Experiment>> {
        let rows = sqlx::query(
            "SELECT * FROM experiments
             WHERE ($1::BIGINT IS NULL OR knowledge_id = $1)
             ORDER BY created_at DESC",
        )
        .bind(knowledge_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_experiment).collect()
    }

    async fn mark_experiment_running(&self, experiment_id: i64) -> Result<()> {
        let result = sqlx::query("UPDATE experiments SET status = 'RUNNING' WHERE id = $1")
            .bind(experiment_id)
            .execute(&self.pool)
            .await?;
        ensure!(
            result.rows_affected() == 1,
            "experiment {experiment_id} not found"
        );
        Ok(())
    }

    async fn complete_experiment(
        &self,
        experiment_id: i64,
        scores: MetricScores,
    ) -> Result<()> {
        let result = sqlx::query(
            "UPDATE experiments SET status = 'COMPLETED', scores = $2, error_message = NULL
             WHERE id = $1",
        )
        .bind(experiment_id)
        .bind(serde_json::to_value(scores)?)
        .execute(&self.pool)
        .await?;
        ensure!(
            result.rows_affected() == 1,
            "experiment {experiment_id} not found"
        );
        Ok(())
    }

    async fn fail_experiment(&self, experiment_id: i64, error: &str) -> Result<()> {
        let result = sqlx::query(
            "UPDATE experiments SET status = 'FAILED', error_message = $2 WHERE id = $1",
        )
        .bind(experiment_id)
        .bind(error)
        .execute(&self.pool)
        .await?;
        ensure!(
            result.rows_affected() == 1,
            "experiment {experiment_id} not found"
        );
        Ok(())
    }

    async fn delete_experiment_row(&self, experiment_id: i64) -> Result<()> {
        sqlx::query("DELETE FROM experiments WHERE id = $1")
            .bind(experiment_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn delete_experiments_by_knowledge(&self, knowledge_id: i64) -> Result<Vec<i64>> {
        let rows = sqlx::query(
            "DELETE FROM experiments WHERE knowledge_id = $1 RETURNING id",
        )
        .bind(knowledge_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|r| r.try_get::<i64, _>("id").map_err(Into::into))
            .collect()
    }

    async fn reset_interrupted(&self) -> Result<ReconcileReport> {
        let mut tx = self.pool.begin().await?;

        let documents = sqlx::query(
            "UPDATE documents SET status = 'FAILED', error_message = $1, updated_at = now()
             WHERE status = 'PROCESSING'",
        )
        .bind(INTERRUPTED_MESSAGE)
        .execute(&mut *tx)
        .await?
        .rows_affected() as usize;

        let testsets = sqlx::query(
            "UPDATE testsets SET status = 'FAILED', error_message = $1
             WHERE status = 'GENERATING'",
        )
        .bind(INTERRUPTED_MESSAGE)
        .execute(&mut *tx)
        .await?
        .rows_affected() as usize;

        let experiments = sqlx::query(
            "UPDATE experiments SET status = 'FAILED', error_message = $1
             WHERE status = 'RUNNING'",
        )
        .bind(INTERRUPTED_MESSAGE)
        .execute(&mut *tx)
        .await?
        .rows_affected() as usize;

        let knowledges = sqlx::query(
            "UPDATE knowledges SET status = 'FAILED', updated_at = now()
             WHERE status = 'DELETING'",
        )
        .execute(&mut *tx)
        .await?
        .rows_affected() as usize;

        // One commit covers all four families.
        tx.commit().await?;
        Ok(ReconcileReport {
            documents,
            testsets,
            experiments,
            knowledges,
        })
    }
}

/// Production factory for the Postgres metadata store.
pub async fn create_pg_store(database_url: &str) -> Result<Arc<PgMetadataStore>> {
    Ok(Arc::new(PgMetadataStore::connect(database_url).await?))
}
