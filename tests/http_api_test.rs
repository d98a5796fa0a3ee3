// API surface tests driven through the router: auth handshake, knowledge
// CRUD with role enforcement, upload side effects, and error mapping.

use anyhow::Result;
use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tempfile::TempDir;
use tower::ServiceExt;

use ragdb::{create_server, Engine, JobQueue, MetadataStore, Settings};

const BOUNDARY: &str = "ragdb-test-boundary";

async fn build_app() -> Result<(TempDir, axum::Router, Engine)> {
    let dir = TempDir::new()?;
    let engine = Engine::build(Settings::for_tests(dir.path())).await?;
    let app = create_server(engine.state.clone());
    Ok((dir, app, engine))
}

async fn body_json(response: axum::response::Response) -> Result<Value> {
    let bytes = response.into_body().collect().await?.to_bytes();
    Ok(serde_json::from_slice(&bytes)?)
}

fn json_request(method: &str, uri: &str, token: Option<&str>, body: Value) -> Request<Body> {
    let mut builder = Request::builder()
        .method(method)
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json");
    if let Some(token) = token {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

fn multipart_upload(uri: &str, token: &str, filename: &str, content: &str) -> Request<Body> {
    let body = format!(
        "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"{filename}\"\r\nContent-Type: application/octet-stream\r\n\r\n{content}\r\n--{BOUNDARY}--\r\n"
    );
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(
            header::CONTENT_TYPE,
            format!("multipart/form-data; boundary={BOUNDARY}"),
        )
        .header(header::AUTHORIZATION, format!("Bearer {token}"))
        .body(Body::from(body))
        .unwrap()
}

/// Register a user and return a bearer token for them.
async fn register_and_login(app: &axum::Router, email: &str) -> Result<String> {
    let response = app
        .clone()
        .oneshot(json_request(
            "POST",
            "/auth/register",
            None,
            json!({"email": email, "password": "hunter22", "full_name": "Tester"}),
        ))
        .await?;
    assert_eq!(response.status(), StatusCode::OK);

    let form = format!("username={email}&password=hunter22");
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/auth/access-token")
                .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
                .body(Body::from(form))
                .unwrap(),
        )
        .await?;
    assert_eq!(response.status(), StatusCode::OK);
    let token_body = body_json(response).await?;
    assert_eq!(token_body["token_type"], "bearer");
    Ok(token_body["access_token"].as_str().unwrap().to_string())
}

#[tokio::test]
async fn test_metrics_endpoint_reports_operation_counters() -> Result<()> {
    let (_dir, app, _engine) = build_app().await?;

    let response = app
        .oneshot(
            Request::builder()
                .method("GET")
                .uri("/metrics")
                .body(Body::empty())
                .unwrap(),
        )
        .await?;
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await?;
    assert!(body["operations"]["total"].is_u64());
    assert!(body["operations"]["retrievals"].is_u64());
    assert!(body["operations"]["jobs"].is_u64());
    assert!(body["timestamp"].is_string());
    Ok(())
}

#[tokio::test]
async fn test_missing_token_is_401() -> Result<()> {
    let (_dir, app, _engine) = build_app().await?;

    let response = app
        .oneshot(json_request("POST", "/auth/test-token", None, json!({})))
        .await?;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let body = body_json(response).await?;
    assert_eq!(body["error"], "AUTH_INVALID");
    Ok(())
}

#[tokio::test]
async fn test_auth_handshake_and_test_token() -> Result<()> {
    let (_dir, app, _engine) = build_app().await?;
    let token = register_and_login(&app, "alice@example.com").await?;

    let response = app
        .oneshot(json_request(
            "POST",
            "/auth/test-token",
            Some(&token),
            json!({}),
        ))
        .await?;
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await?;
    assert_eq!(body["email"], "alice@example.com");
    assert!(body.get("hashed_password").is_none());
    Ok(())
}

#[tokio::test]
async fn test_bad_password_is_401() -> Result<()> {
    let (_dir, app, _engine) = build_app().await?;
    register_and_login(&app, "bob@example.com").await?;

    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/auth/access-token")
                .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
                .body(Body::from("username=bob@example.com&password=wrong"))
                .unwrap(),
        )
        .await?;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    Ok(())
}

#[tokio::test]
async fn test_knowledge_crud_and_tenancy() -> Result<()> {
    let (_dir, app, _engine) = build_app().await?;
    let owner = register_and_login(&app, "owner@example.com").await?;
    let outsider = register_and_login(&app, "outsider@example.com").await?;

    let response = app
        .clone()
        .oneshot(json_request(
            "POST",
            "/knowledge/knowledges",
            Some(&owner),
            json!({"name": "handbook"}),
        ))
        .await?;
    assert_eq!(response.status(), StatusCode::OK);
    let kb = body_json(response).await?;
    let kb_id = kb["id"].as_i64().unwrap();
    assert_eq!(kb["status"], "NORMAL");

    // The owner sees it; an outsider gets 404, not 403, to avoid leaking
    // which ids exist.
    let response = app
        .clone()
        .oneshot(json_request(
            "GET",
            &format!("/knowledge/knowledges/{kb_id}"),
            Some(&owner),
            json!({}),
        ))
        .await?;
    assert_eq!(response.status(), StatusCode::OK);

    let response = app
        .clone()
        .oneshot(json_request(
            "GET",
            &format!("/knowledge/knowledges/{kb_id}"),
            Some(&outsider),
            json!({}),
        ))
        .await?;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = app
        .clone()
        .oneshot(json_request(
            "GET",
            "/knowledge/knowledges",
            Some(&outsider),
            json!({}),
        ))
        .await?;
    let list = body_json(response).await?;
    assert_eq!(list.as_array().unwrap().len(), 0);
    Ok(())
}

#[tokio::test]
async fn test_upload_inserts_pending_and_enqueues() -> Result<()> {
    let (_dir, app, engine) = build_app().await?;
    let token = register_and_login(&app, "uploader@example.com").await?;

    let response = app
        .clone()
        .oneshot(json_request(
            "POST",
            "/knowledge/knowledges",
            Some(&token),
            json!({"name": "uploads"}),
        ))
        .await?;
    let kb_id = body_json(response).await?["id"].as_i64().unwrap();

    let response = app
        .clone()
        .oneshot(multipart_upload(
            &format!("/knowledge/{kb_id}/upload"),
            &token,
            "notes.txt",
            "MySQL port is 3306",
        ))
        .await?;
    assert_eq!(response.status(), StatusCode::OK);
    let doc_id = body_json(response).await?["doc_id"].as_i64().unwrap();

    // Row is PENDING and pollable.
    let response = app
        .clone()
        .oneshot(json_request(
            "GET",
            &format!("/knowledge/documents/{doc_id}"),
            Some(&token),
            json!({}),
        ))
        .await?;
    assert_eq!(response.status(), StatusCode::OK);
    let doc = body_json(response).await?;
    assert_eq!(doc["status"], "PENDING");
    assert!(doc["blob_path"].as_str().unwrap().ends_with("_notes.txt"));

    // The job landed on the default queue (txt is not structure-aware).
    let job = engine
        .state
        .queue
        .dequeue("default", std::time::Duration::from_secs(60))
        .await?
        .expect("process_document enqueued");
    assert_eq!(job.function, "process_document");
    assert_eq!(job.args["doc_id"], doc_id);
    Ok(())
}

#[tokio::test]
async fn test_upload_to_deleting_kb_is_409() -> Result<()> {
    let (_dir, app, engine) = build_app().await?;
    let token = register_and_login(&app, "conflict@example.com").await?;

    let response = app
        .clone()
        .oneshot(json_request(
            "POST",
            "/knowledge/knowledges",
            Some(&token),
            json!({"name": "doomed"}),
        ))
        .await?;
    let kb_id = body_json(response).await?["id"].as_i64().unwrap();

    engine
        .state
        .store
        .set_knowledge_status(kb_id, ragdb::KnowledgeStatus::Deleting)
        .await?;

    let response = app
        .clone()
        .oneshot(multipart_upload(
            &format!("/knowledge/{kb_id}/upload"),
            &token,
            "late.txt",
            "too late",
        ))
        .await?;
    assert_eq!(response.status(), StatusCode::CONFLICT);
    let body = body_json(response).await?;
    assert_eq!(body["error"], "CONFLICT_STATE");
    Ok(())
}

#[tokio::test]
async fn test_delete_knowledge_flips_status_and_enqueues() -> Result<()> {
    let (_dir, app, engine) = build_app().await?;
    let token = register_and_login(&app, "deleter@example.com").await?;

    let response = app
        .clone()
        .oneshot(json_request(
            "POST",
            "/knowledge/knowledges",
            Some(&token),
            json!({"name": "to-remove"}),
        ))
        .await?;
    let kb_id = body_json(response).await?["id"].as_i64().unwrap();

    let response = app
        .clone()
        .oneshot(json_request(
            "DELETE",
            &format!("/knowledge/knowledges/{kb_id}"),
            Some(&token),
            json!({}),
        ))
        .await?;
    assert_eq!(response.status(), StatusCode::OK);

    let kb = engine.state.store.get_knowledge(kb_id).await?.unwrap();
    assert_eq!(kb.status, ragdb::KnowledgeStatus::Deleting);

    let job = engine
        .state
        .queue
        .dequeue("default", std::time::Duration::from_secs(60))
        .await?
        .expect("delete job enqueued");
    assert_eq!(job.function, "delete_knowledge");
    Ok(())
}

#[tokio::test]
async fn test_session_roundtrip() -> Result<()> {
    let (_dir, app, _engine) = build_app().await?;
    let token = register_and_login(&app, "chatter@example.com").await?;

    let response = app
        .clone()
        .oneshot(json_request(
            "POST",
            "/knowledge/knowledges",
            Some(&token),
            json!({"name": "chat-kb"}),
        ))
        .await?;
    let kb_id = body_json(response).await?["id"].as_i64().unwrap();

    let response = app
        .clone()
        .oneshot(json_request(
            "POST",
            "/chat/sessions",
            Some(&token),
            json!({"knowledge_id": kb_id}),
        ))
        .await?;
    assert_eq!(response.status(), StatusCode::OK);
    let session = body_json(response).await?;
    let session_id = session["id"].as_str().unwrap().to_string();
    assert_eq!(session["title"], "New Chat");
    assert_eq!(session["knowledge_ids"], json!([kb_id]));

    // Rename and widen top_k.
    let response = app
        .clone()
        .oneshot(json_request(
            "PUT",
            &format!("/chat/sessions/{session_id}"),
            Some(&token),
            json!({"title": "Ops questions", "top_k": 8}),
        ))
        .await?;
    assert_eq!(response.status(), StatusCode::OK);
    let updated = body_json(response).await?;
    assert_eq!(updated["title"], "Ops questions");
    assert_eq!(updated["top_k"], 8);

    // Soft delete hides it from the listing.
    let response = app
        .clone()
        .oneshot(json_request(
            "DELETE",
            &format!("/chat/sessions/{session_id}"),
            Some(&token),
            json!({}),
        ))
        .await?;
    assert_eq!(response.status(), StatusCode::OK);

    let response = app
        .clone()
        .oneshot(json_request("GET", "/chat/sessions", Some(&token), json!({})))
        .await?;
    let sessions = body_json(response).await?;
    assert_eq!(sessions.as_array().unwrap().len(), 0);
    Ok(())
}
