use axum::{
    Json,
    extract::{Extension, Path},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use std::sync::Arc;

use super::protocol::{
    AckResponse, ArrayInfo, CreateArrayRequest, ElementResponse, ErrorResponse, SetElementRequest,
    SyncResponse,
};
use crate::dsm::cache::CacheStats;
use crate::dsm::error::DsmError;
use crate::dsm::manager::MemoryManager;
use crate::dsm::types::{ArrayId, ElementKind, ElementValue};
use crate::membership::service::MembershipService;
use crate::membership::types::Node;

/// An engine error rendered as an HTTP response.
#[derive(Debug)]
pub struct ApiError(pub DsmError);

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match &self.0 {
            DsmError::Conflict { .. } => StatusCode::CONFLICT,
            DsmError::ArrayNotFound(_) | DsmError::LeaseNotFound(_) | DsmError::NoOwner { .. } => {
                StatusCode::NOT_FOUND
            }
            DsmError::Expired { .. } => StatusCode::GONE,
            DsmError::OutOfBounds { .. }
            | DsmError::IndexOutOfBounds { .. }
            | DsmError::ArrayTooLarge { .. }
            | DsmError::ElementMismatch { .. } => StatusCode::BAD_REQUEST,
            DsmError::Unreachable { .. } | DsmError::PageSizeMismatch { .. } => {
                StatusCode::BAD_GATEWAY
            }
            DsmError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            DsmError::Cancelled => StatusCode::SERVICE_UNAVAILABLE,
            DsmError::Protocol(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<DsmError> for ApiError {
    fn from(err: DsmError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!("Request failed: {}", self.0);
        } else {
            tracing::debug!("Request rejected: {}", self.0);
        }
        let body = ErrorResponse {
            error: self.0.to_string(),
            retryable: self.0.is_retryable(),
        };
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<(StatusCode, Json<T>), ApiError>;

pub async fn handle_create_array(
    Extension(manager): Extension<Arc<MemoryManager>>,
    Json(req): Json<CreateArrayRequest>,
) -> ApiResult<ArrayInfo> {
    let array = manager.create_array(req.length, req.element).await?;
    Ok((StatusCode::CREATED, Json(ArrayInfo::from(array.as_ref()))))
}

pub async fn handle_get_array(
    Extension(manager): Extension<Arc<MemoryManager>>,
    Path(id): Path<String>,
) -> ApiResult<ArrayInfo> {
    let array = manager.get_array(&ArrayId(id))?;
    Ok((StatusCode::OK, Json(ArrayInfo::from(array.as_ref()))))
}

pub async fn handle_delete_array(
    Extension(manager): Extension<Arc<MemoryManager>>,
    Path(id): Path<String>,
) -> ApiResult<AckResponse> {
    manager.delete_array(&ArrayId(id)).await?;
    Ok((StatusCode::OK, Json(AckResponse { success: true })))
}

pub async fn handle_get_element(
    Extension(manager): Extension<Arc<MemoryManager>>,
    Path((id, index)): Path<(String, u64)>,
) -> ApiResult<ElementResponse> {
    let id = ArrayId(id);
    let array = manager.get_array(&id)?;
    let cancel = manager.child_token();

    let value = match array.element {
        ElementKind::Int64 => {
            ElementValue::Int64(manager.get_element::<i64>(&id, index, &cancel).await?)
        }
        ElementKind::Float32 => {
            ElementValue::Float32(manager.get_element::<f32>(&id, index, &cancel).await?)
        }
    };

    Ok((
        StatusCode::OK,
        Json(ElementResponse {
            array: id,
            index,
            value,
        }),
    ))
}

pub async fn handle_set_element(
    Extension(manager): Extension<Arc<MemoryManager>>,
    Path((id, index)): Path<(String, u64)>,
    Json(req): Json<SetElementRequest>,
) -> ApiResult<AckResponse> {
    let id = ArrayId(id);
    let array = manager.get_array(&id)?;
    let cancel = manager.child_token();

    match (array.element, req.value) {
        (ElementKind::Int64, ElementValue::Int64(v)) => {
            manager.set_element(&id, index, v, &cancel).await?
        }
        (ElementKind::Float32, ElementValue::Float32(v)) => {
            manager.set_element(&id, index, v, &cancel).await?
        }
        // JSON does not distinguish `2` from `2.0`
        (ElementKind::Float32, ElementValue::Int64(v)) => {
            manager.set_element(&id, index, v as f32, &cancel).await?
        }
        (expected, value) => {
            return Err(DsmError::ElementMismatch {
                array: id,
                expected,
                actual: value.kind(),
            }
            .into());
        }
    }

    Ok((StatusCode::OK, Json(AckResponse { success: true })))
}

pub async fn handle_sync(
    Extension(manager): Extension<Arc<MemoryManager>>,
    Path(id): Path<String>,
) -> ApiResult<SyncResponse> {
    let id = ArrayId(id);
    let version = manager.sync(&id, &manager.child_token()).await?;
    Ok((StatusCode::OK, Json(SyncResponse { array: id, version })))
}

pub async fn handle_close(
    Extension(manager): Extension<Arc<MemoryManager>>,
    Path(id): Path<String>,
) -> ApiResult<AckResponse> {
    manager.close_array(&ArrayId(id)).await?;
    Ok((StatusCode::OK, Json(AckResponse { success: true })))
}

pub async fn handle_cache_stats(
    Extension(manager): Extension<Arc<MemoryManager>>,
) -> (StatusCode, Json<CacheStats>) {
    (StatusCode::OK, Json(manager.cache_stats()))
}

pub async fn handle_cluster_members(
    Extension(membership): Extension<Arc<MembershipService>>,
) -> (StatusCode, Json<Vec<Node>>) {
    (StatusCode::OK, Json(membership.get_alive_members()))
}
