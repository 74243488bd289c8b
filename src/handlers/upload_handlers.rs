//! HTTP handlers for uploads and stored assets.
//! Upload bodies are handed to the `Dispatcher`; assets are streamed from
//! disk without buffering.

use crate::{
    errors::AppError,
    models::{
        file::{FileRecord, FileType},
        smile::{NewSmile, SmileRecord},
    },
    services::{content_store::AssetKind, hasher},
    state::AppState,
};
use axum::{
    Json,
    body::Body,
    extract::{ConnectInfo, Multipart, Path, State, multipart::MultipartError},
    http::{HeaderValue, StatusCode, header},
    response::Response,
};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{io, net::SocketAddr};
use tokio_util::io::ReaderStream;

#[derive(Debug, Serialize)]
pub struct UploadResponse {
    pub token: String,
    pub expires_at: DateTime<Utc>,
    pub file: FileRecord,
}

/// `POST /api/upload` - multipart field `file`.
pub async fn upload_file(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    mut multipart: Multipart,
) -> Result<Json<UploadResponse>, AppError> {
    let mut data = None;
    while let Some(field) = multipart.next_field().await.map_err(multipart_error)? {
        if field.name() == Some("file") {
            data = Some(field.bytes().await.map_err(multipart_error)?);
            break;
        }
    }
    let data = data.ok_or_else(|| AppError::bad_request("missing `file` field"))?;

    let size = data.len() as u64;
    let (file, token) = state
        .dispatcher
        .submit_file(peer.ip().to_string(), source(data), size)
        .await?;

    Ok(Json(UploadResponse {
        token: token.token,
        expires_at: token.expires_at,
        file,
    }))
}

#[derive(Debug, Deserialize)]
pub struct ClaimRequest {
    pub token: String,
}

#[derive(Debug, Serialize)]
pub struct ClaimResponse {
    pub post_id: i64,
    pub sha1: String,
}

/// `POST /api/posts/{post_id}/files` - redeem a claim token for a post.
pub async fn claim_file(
    State(state): State<AppState>,
    Path(post_id): Path<i64>,
    Json(req): Json<ClaimRequest>,
) -> Result<Json<ClaimResponse>, AppError> {
    let sha1 = state.tokens.claim(req.token.trim(), post_id).await?;
    tracing::info!(post_id, digest = %sha1, "file attached to post");
    Ok(Json(ClaimResponse { post_id, sha1 }))
}

/// `POST /api/smiles/{board}` - multipart fields `name`, `alias` (repeatable),
/// `readonly` and `file`.
pub async fn upload_smile(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Path(board): Path<String>,
    mut multipart: Multipart,
) -> Result<Json<SmileRecord>, AppError> {
    let mut smile = NewSmile {
        board,
        ..NewSmile::default()
    };
    let mut data = None;

    while let Some(field) = multipart.next_field().await.map_err(multipart_error)? {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "name" => smile.name = field.text().await.map_err(multipart_error)?.trim().to_string(),
            "alias" => {
                let alias = field.text().await.map_err(multipart_error)?;
                if !alias.trim().is_empty() {
                    smile.aliases.push(alias.trim().to_string());
                }
            }
            "readonly" => {
                smile.readonly = matches!(
                    field.text().await.map_err(multipart_error)?.as_str(),
                    "1" | "true" | "on"
                )
            }
            "file" => data = Some(field.bytes().await.map_err(multipart_error)?),
            _ => {}
        }
    }

    if smile.name.is_empty() {
        return Err(AppError::bad_request("missing smile name"));
    }
    let data = data.ok_or_else(|| AppError::bad_request("missing `file` field"))?;

    let size = data.len() as u64;
    let record = state
        .dispatcher
        .submit_smile(peer.ip().to_string(), source(data), size, smile)
        .await?;
    Ok(Json(record))
}

/// `GET /assets/{kind}/{file}` - stream a stored asset.
pub async fn serve_asset(
    State(state): State<AppState>,
    Path((kind, file)): Path<(String, String)>,
) -> Result<Response, AppError> {
    let (kind, digest, file_type) =
        parse_asset_path(&kind, &file).ok_or_else(|| AppError::not_found("asset not found"))?;

    let handle = match state
        .store
        .assets
        .open(kind, digest, file_type.extension())
        .await
    {
        Ok(handle) => handle,
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            return Err(AppError::not_found("asset not found"));
        }
        Err(err) => {
            tracing::error!(error = %err, "failed to open asset");
            return Err(AppError::internal("failed to open asset"));
        }
    };

    let mut response = Response::new(Body::from_stream(ReaderStream::new(handle)));
    *response.status_mut() = StatusCode::OK;
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static(file_type.mime()),
    );
    // Content-addressed, so never changes.
    headers.insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static("public, max-age=31536000, immutable"),
    );
    Ok(response)
}

fn source(data: Bytes) -> crate::services::pipeline::ByteSource {
    Box::new(io::Cursor::new(data))
}

fn multipart_error(err: MultipartError) -> AppError {
    AppError::new(err.status(), err.body_text())
}

/// Split `{kind}/{digest}.{ext}` into its parts, rejecting anything malformed.
fn parse_asset_path<'a>(kind: &str, file: &'a str) -> Option<(AssetKind, &'a str, FileType)> {
    let kind = AssetKind::from_dir(kind)?;
    let (digest, ext) = file.split_once('.')?;
    if !hasher::is_digest(digest) {
        return None;
    }
    Some((kind, digest, FileType::from_extension(ext)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::dispatcher::{Dispatcher, UploadLimits};
    use crate::services::media_store::StoreError;
    use crate::services::pipeline::tests::{FakeThumbnailer, harness};
    use std::sync::Arc;

    const DIGEST: &str = "2aae6c35c94fcfb415dbe95f408b9ce91ee846ed";

    #[test]
    fn asset_paths_are_parsed() {
        let file = format!("{}.jpg", DIGEST);
        let (kind, digest, file_type) = parse_asset_path("thumb", &file).unwrap();
        assert_eq!(kind, AssetKind::Thumb);
        assert_eq!(digest, DIGEST);
        assert_eq!(file_type, FileType::Jpeg);
    }

    #[test]
    fn malformed_asset_paths_are_rejected() {
        assert!(parse_asset_path("secrets", &format!("{}.png", DIGEST)).is_none());
        assert!(parse_asset_path("src", &format!("{}.exe", DIGEST)).is_none());
        assert!(parse_asset_path("src", "../../etc/passwd.png").is_none());
        assert!(parse_asset_path("src", DIGEST).is_none());
    }

    #[tokio::test]
    async fn uploaded_file_is_claimed_once() {
        let h = harness().await;
        let pipeline = Arc::new(h.pipeline(Arc::new(FakeThumbnailer::ok())));
        let limits = UploadLimits {
            max_file_bytes: 1 << 20,
            max_smile_bytes: 1 << 10,
        };
        let state = AppState {
            dispatcher: Dispatcher::start(1, limits, pipeline),
            store: h.store.clone(),
            tokens: h.tokens.clone(),
        };
        sqlx::query("INSERT INTO posts (id, board, time) VALUES (3, 'a', 0)")
            .execute(&h.store.db)
            .await
            .unwrap();

        let (file, token) = state
            .dispatcher
            .submit_file("tester", source(Bytes::from_static(b"attach me")), 9)
            .await
            .unwrap();

        let Json(claimed) = claim_file(
            State(state.clone()),
            Path(3),
            Json(ClaimRequest {
                token: token.token.clone(),
            }),
        )
        .await
        .unwrap();
        assert_eq!(claimed.post_id, 3);
        assert_eq!(claimed.sha1, file.sha1);

        let err = claim_file(State(state), Path(3), Json(ClaimRequest { token: token.token }))
            .await
            .unwrap_err();
        assert_eq!(err.status, StatusCode::NOT_FOUND);
        assert_eq!(err.message, StoreError::TokenNotFound.to_string());
    }
}
