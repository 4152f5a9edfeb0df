//! Defines routes for the resumable upload protocol.
//!
//! ## Structure
//! - **Session endpoints**
//!   - `POST /uploads`                       : init a session
//!   - `GET  /uploads/{id}`                  : ledger-derived status
//!   - `PUT  /uploads/{id}/chunks/{index}`   : record one chunk (raw body)
//!   - `POST /uploads/{id}/finalize`         : finalize into a file record
//!   - `GET  /uploads/{id}/file`             : file created by a finalized session
//!
//! - **Catalog endpoints**
//!   - `POST /folders`                       : create a destination folder

use crate::{
    handlers::{
        health_handlers::{healthz, readyz},
        upload_handlers::{
            create_folder, finalize_upload, finalized_file, init_upload, upload_chunk,
            upload_status,
        },
    },
    services::upload_service::UploadService,
};
use axum::{
    Router,
    extract::DefaultBodyLimit,
    routing::{get, post, put},
};

/// Build the router carrying `UploadService` as shared state.
///
/// Chunk bodies may be up to `max_chunk_bytes`; axum's default 2 MiB limit
/// would reject ordinary chunk sizes.
pub fn routes(max_chunk_bytes: usize) -> Router<UploadService> {
    Router::new()
        // health endpoints (mounted at root)
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        // Session routes
        .route("/uploads", post(init_upload))
        .route("/uploads/{id}", get(upload_status))
        .route(
            "/uploads/{id}/chunks/{index}",
            put(upload_chunk).layer(DefaultBodyLimit::max(max_chunk_bytes)),
        )
        .route("/uploads/{id}/finalize", post(finalize_upload))
        .route("/uploads/{id}/file", get(finalized_file))
        // Catalog routes
        .route("/folders", post(create_folder))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        db,
        services::{
            append_store::testing::MemoryAppendStore, catalog::SqliteCatalog,
            registry::SessionPolicy,
        },
    };
    use axum::{
        body::{Body, to_bytes},
        http::{Request, StatusCode},
    };
    use serde_json::{Value, json};
    use std::{sync::Arc, time::Duration};
    use tower::ServiceExt;

    async fn app() -> Router {
        let db = db::memory_pool().await;
        let catalog = Arc::new(SqliteCatalog::new(db.clone()));
        let policy = SessionPolicy {
            min_chunk_size: 1,
            ..SessionPolicy::default()
        };
        let service = UploadService::new(
            db,
            Arc::new(MemoryAppendStore::default()),
            catalog,
            policy,
            Duration::from_secs(5),
        );
        routes(1024).with_state(service)
    }

    fn request(method: &str, uri: &str, principal: Option<&str>, body: Body) -> Request<Body> {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(principal) = principal {
            builder = builder.header("x-principal-id", principal);
        }
        builder.body(body).unwrap()
    }

    fn json_request(method: &str, uri: &str, principal: &str, value: Value) -> Request<Body> {
        let mut req = request(method, uri, Some(principal), Body::from(value.to_string()));
        req.headers_mut()
            .insert("content-type", "application/json".parse().unwrap());
        req
    }

    async fn send(app: &Router, req: Request<Body>) -> (StatusCode, Value) {
        let response = app.clone().oneshot(req).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    async fn open_session(app: &Router, total_size: u64) -> String {
        let (status, body) = send(
            app,
            json_request(
                "POST",
                "/uploads",
                "alice",
                json!({
                    "fileName": "notes.txt",
                    "mimeType": "text/plain",
                    "totalSize": total_size,
                    "chunkSize": 4
                }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["chunkSize"], 4);
        body["sessionId"].as_str().unwrap().to_string()
    }

    #[tokio::test]
    async fn liveness_probe() {
        let app = app().await;
        let (status, body) = send(&app, request("GET", "/healthz", None, Body::empty())).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");

        let (status, _) = send(&app, request("GET", "/readyz", None, Body::empty())).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn missing_principal_is_unauthenticated() {
        let app = app().await;
        let (status, body) = send(
            &app,
            request("POST", "/uploads", None, Body::from("{}")),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["code"], "unauthenticated");
    }

    #[tokio::test]
    async fn chunked_upload_round_trip() {
        let app = app().await;
        let id = open_session(&app, 10).await;

        for (index, chunk) in [(2, "89"), (0, "0123"), (1, "4567")] {
            let (status, ack) = send(
                &app,
                request(
                    "PUT",
                    &format!("/uploads/{id}/chunks/{index}"),
                    Some("alice"),
                    Body::from(chunk),
                ),
            )
            .await;
            assert_eq!(status, StatusCode::OK, "{ack}");
            assert_eq!(ack["chunkIndex"], index);
        }

        let (status, progress) = send(
            &app,
            request("GET", &format!("/uploads/{id}"), Some("alice"), Body::empty()),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(progress["isComplete"], true);
        assert_eq!(progress["uploadedIndices"], json!([0, 1, 2]));

        let (status, file) = send(
            &app,
            request("POST", &format!("/uploads/{id}/finalize"), Some("alice"), Body::empty()),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(file["sizeBytes"], 10);
        assert_eq!(file["name"], "notes.txt");

        // the session is gone, the file is still reachable by session id
        let (status, _) = send(
            &app,
            request("POST", &format!("/uploads/{id}/finalize"), Some("alice"), Body::empty()),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, found) = send(
            &app,
            request("GET", &format!("/uploads/{id}/file"), Some("alice"), Body::empty()),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(found["fileId"], file["fileId"]);
    }

    #[tokio::test]
    async fn incomplete_finalize_lists_missing_chunks() {
        let app = app().await;
        let id = open_session(&app, 12).await;
        send(
            &app,
            request(
                "PUT",
                &format!("/uploads/{id}/chunks/1"),
                Some("alice"),
                Body::from("4567"),
            ),
        )
        .await;

        let (status, body) = send(
            &app,
            request("POST", &format!("/uploads/{id}/finalize"), Some("alice"), Body::empty()),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["code"], "incomplete_upload");
        assert_eq!(body["missingChunks"], json!([0, 2]));
    }

    #[tokio::test]
    async fn other_principal_is_forbidden() {
        let app = app().await;
        let id = open_session(&app, 4).await;
        let (status, body) = send(
            &app,
            request("GET", &format!("/uploads/{id}"), Some("mallory"), Body::empty()),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["code"], "forbidden");
    }

    #[tokio::test]
    async fn oversized_chunk_body_is_rejected() {
        let app = app().await;
        let id = open_session(&app, 4).await;
        let (status, _) = send(
            &app,
            request(
                "PUT",
                &format!("/uploads/{id}/chunks/0"),
                Some("alice"),
                Body::from(vec![0u8; 2048]),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
    }
}
