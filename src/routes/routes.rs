//! Defines routes for uploads, stored assets and health checks.
//!
//! ## Structure
//! - **Uploads**
//!   - `POST /api/upload`          - upload a file, returns its record and a claim token
//!   - `POST /api/smiles/{board}`  - upload a smile sprite for a board
//!   - `POST /api/posts/{post_id}/files` - attach an uploaded file to a post by claim token
//!
//! - **Assets**
//!   - `GET  /assets/{kind}/{file}` - stream `src`, `thumb`, `blur` or `smile` assets
//!
//! - **Health**
//!   - `GET  /healthz`, `GET /readyz`

use crate::{
    handlers::{
        health_handlers::{healthz, readyz},
        upload_handlers::{claim_file, serve_asset, upload_file, upload_smile},
    },
    state::AppState,
};
use axum::{
    Router,
    extract::DefaultBodyLimit,
    routing::{get, post},
};

/// Multipart framing on top of the file itself.
const MULTIPART_OVERHEAD: usize = 64 * 1024;

/// Build the router. Request bodies are capped just above `max_upload_bytes`
/// so oversized uploads are refused before they are buffered.
pub fn routes(max_upload_bytes: u64) -> Router<AppState> {
    let body_limit = usize::try_from(max_upload_bytes)
        .unwrap_or(usize::MAX)
        .saturating_add(MULTIPART_OVERHEAD);

    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/api/upload", post(upload_file))
        .route("/api/smiles/{board}", post(upload_smile))
        .route("/api/posts/{post_id}/files", post(claim_file))
        .route("/assets/{kind}/{file}", get(serve_asset))
        .layer(DefaultBodyLimit::max(body_limit))
}
