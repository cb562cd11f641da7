//! Collection REST routes.
//!
//! ```text
//! GET    /api/{collection}       full snapshot
//! POST   /api/{collection}       create
//! GET    /api/{collection}/{id}  one record
//! PUT    /api/{collection}/{id}  partial update
//! DELETE /api/{collection}/{id}  delete
//! ```

use axum::{
    extract::{Path, State},
    http::HeaderMap,
    routing::get,
    Json, Router,
};
use serde_json::Value;
use till_sync_engine::RequestContext;

use crate::auth::AuthUser;
use crate::error::{AppError, Result};
use crate::handlers::{self, ApiResponse};
use crate::AppState;

const IDEMPOTENCY_HEADER: &str = "idempotency-key";

/// Create collection routes.
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/api/{collection}", get(list_handler).post(create_handler))
        .route(
            "/api/{collection}/{id}",
            get(get_handler).put(update_handler).delete(delete_handler),
        )
}

fn request_context(auth: &AuthUser, headers: &HeaderMap) -> Result<RequestContext> {
    let ctx = RequestContext::new(auth.actor.clone());
    match headers.get(IDEMPOTENCY_HEADER) {
        None => Ok(ctx),
        Some(value) => {
            let key = value
                .to_str()
                .map_err(|_| AppError::BadRequest("invalid Idempotency-Key header".into()))?;
            Ok(ctx.with_idempotency_key(key))
        }
    }
}

/// GET /api/{collection}
async fn list_handler(
    State(state): State<AppState>,
    _auth: AuthUser,
    Path(collection): Path<String>,
) -> Result<Json<ApiResponse<Vec<Value>>>> {
    let records = handlers::list_collection(&state.pool, &state.schema, &collection).await?;
    Ok(Json(ApiResponse::ok(records)))
}

/// GET /api/{collection}/{id}
async fn get_handler(
    State(state): State<AppState>,
    _auth: AuthUser,
    Path((collection, id)): Path<(String, String)>,
) -> Result<Json<ApiResponse<Value>>> {
    let record = handlers::fetch_record(&state.pool, &state.schema, &collection, &id).await?;
    Ok(Json(ApiResponse::ok(record)))
}

/// POST /api/{collection}
async fn create_handler(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(collection): Path<String>,
    headers: HeaderMap,
    Json(payload): Json<Value>,
) -> Result<Json<ApiResponse<Value>>> {
    let ctx = request_context(&auth, &headers)?;
    let record =
        handlers::create_record(&state.pool, &state.schema, &collection, payload, &ctx).await?;
    Ok(Json(ApiResponse::ok(record)))
}

/// PUT /api/{collection}/{id}
async fn update_handler(
    State(state): State<AppState>,
    auth: AuthUser,
    Path((collection, id)): Path<(String, String)>,
    Json(patch): Json<Value>,
) -> Result<Json<ApiResponse<Value>>> {
    let ctx = RequestContext::new(auth.actor);
    let record =
        handlers::update_record(&state.pool, &state.schema, &collection, &id, patch, &ctx).await?;
    Ok(Json(ApiResponse::ok(record)))
}

/// DELETE /api/{collection}/{id}
async fn delete_handler(
    State(state): State<AppState>,
    _auth: AuthUser,
    Path((collection, id)): Path<(String, String)>,
) -> Result<Json<ApiResponse<Value>>> {
    let deleted = handlers::delete_record(&state.pool, &state.schema, &collection, &id).await?;
    Ok(Json(ApiResponse::ok(deleted)))
}
