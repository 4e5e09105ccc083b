//! Image proxy for engine outputs.
//!
//! Image references sent to relay clients point here so the browser
//! never talks to the engine directly.

use axum::extract::{Query, State};
use axum::http::header;
use axum::response::{IntoResponse, Response};
use comfyrelay_comfyui::history::ImageRef;
use serde::Deserialize;

use crate::error::{AppError, AppResult};
use crate::state::AppState;

/// Query parameters of `GET /api/v1/view`.
#[derive(Debug, Deserialize)]
pub struct ViewQuery {
    pub filename: String,
    #[serde(default)]
    pub subfolder: String,
    #[serde(rename = "type", default = "default_kind")]
    pub kind: String,
}

fn default_kind() -> String {
    "output".to_string()
}

/// GET /api/v1/view -- stream one engine image back to the client.
pub async fn view_image(
    State(state): State<AppState>,
    Query(query): Query<ViewQuery>,
) -> AppResult<Response> {
    if query.filename.is_empty() || query.filename.contains("..") {
        return Err(AppError::BadRequest(format!(
            "Invalid filename '{}'",
            query.filename
        )));
    }
    if query.subfolder.contains("..") {
        return Err(AppError::BadRequest(format!(
            "Invalid subfolder '{}'",
            query.subfolder
        )));
    }

    let image = ImageRef {
        filename: query.filename,
        subfolder: query.subfolder,
        kind: query.kind,
    };

    let viewed = state.engine.view(&image).await?;
    let content_type = viewed
        .content_type
        .unwrap_or_else(|| "application/octet-stream".to_string());

    Ok(([(header::CONTENT_TYPE, content_type)], viewed.bytes).into_response())
}
