//! HTTP API Tests
//!
//! Handlers are invoked directly with their extractors, against engines
//! joined by the in-memory transport.

#[cfg(test)]
mod tests {
    use crate::api::handlers::*;
    use crate::api::protocol::*;
    use crate::config::DsmConfig;
    use crate::dsm::array::SyncPhase;
    use crate::dsm::error::DsmError;
    use crate::dsm::manager::MemoryManager;
    use crate::dsm::types::{ArrayId, ElementKind, ElementValue, LeaseType};
    use crate::membership::types::NodeId;
    use crate::transport::memory::MemoryNetwork;
    use axum::Json;
    use axum::extract::{Extension, Path};
    use axum::http::StatusCode;
    use axum::response::IntoResponse;
    use std::sync::Arc;

    fn engine(network: &Arc<MemoryNetwork>, name: &str) -> Arc<MemoryManager> {
        let (transport, listener) = network.attach(NodeId::from(name));
        let manager = MemoryManager::new(
            transport,
            DsmConfig {
                page_size: 64,
                ..DsmConfig::default()
            },
        );
        listener.serve(manager.clone());
        manager
    }

    async fn create(manager: &Arc<MemoryManager>, length: u64, element: ElementKind) -> ArrayInfo {
        let (status, Json(info)) = handle_create_array(
            Extension(manager.clone()),
            Json(CreateArrayRequest { length, element }),
        )
        .await
        .unwrap();
        assert_eq!(status, StatusCode::CREATED);
        info
    }

    async fn set(
        manager: &Arc<MemoryManager>,
        id: &ArrayId,
        index: u64,
        value: ElementValue,
    ) -> Result<StatusCode, ApiError> {
        handle_set_element(
            Extension(manager.clone()),
            Path((id.0.clone(), index)),
            Json(SetElementRequest { value }),
        )
        .await
        .map(|(status, _)| status)
    }

    async fn get(manager: &Arc<MemoryManager>, id: &ArrayId, index: u64) -> ElementValue {
        let (_, Json(response)) =
            handle_get_element(Extension(manager.clone()), Path((id.0.clone(), index)))
                .await
                .unwrap();
        response.value
    }

    // ============================================================
    // DTOs
    // ============================================================

    #[test]
    fn test_create_request_defaults_to_int64() {
        let req: CreateArrayRequest = serde_json::from_str(r#"{"length": 10}"#).unwrap();
        assert_eq!(req.element, ElementKind::Int64);

        let req: CreateArrayRequest =
            serde_json::from_str(r#"{"length": 10, "element": "Float32"}"#).unwrap();
        assert_eq!(req.element, ElementKind::Float32);
    }

    #[test]
    fn test_element_values_are_bare_numbers() {
        let int: SetElementRequest = serde_json::from_str(r#"{"value": 7}"#).unwrap();
        assert_eq!(int.value, ElementValue::Int64(7));

        let float: SetElementRequest = serde_json::from_str(r#"{"value": 2.5}"#).unwrap();
        assert_eq!(float.value, ElementValue::Float32(2.5));
    }

    // ============================================================
    // STATUS MAPPING
    // ============================================================

    #[test]
    fn test_errors_map_to_status_codes() {
        let array = ArrayId::from("arr");
        let node = NodeId::from("b");
        let cases = vec![
            (
                DsmError::Conflict {
                    array: array.clone(),
                    page: 0,
                    held: LeaseType::Write,
                    holder: node.clone(),
                },
                StatusCode::CONFLICT,
            ),
            (DsmError::ArrayNotFound(array.clone()), StatusCode::NOT_FOUND),
            (
                DsmError::IndexOutOfBounds {
                    array: array.clone(),
                    index: 9,
                    length: 9,
                },
                StatusCode::BAD_REQUEST,
            ),
            (
                DsmError::Timeout {
                    node: node.clone(),
                    after_ms: 10,
                },
                StatusCode::GATEWAY_TIMEOUT,
            ),
            (DsmError::Cancelled, StatusCode::SERVICE_UNAVAILABLE),
            (
                DsmError::ArrayTooLarge {
                    length: u64::MAX,
                    width: 8,
                    page_size: 64,
                    max_pages: u32::MAX,
                },
                StatusCode::BAD_REQUEST,
            ),
        ];

        for (err, expected) in cases {
            assert_eq!(ApiError(err).status(), expected);
        }
    }

    #[test]
    fn test_error_response_carries_status() {
        let response = ApiError(DsmError::ArrayNotFound(ArrayId::from("missing"))).into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    // ============================================================
    // HANDLERS
    // ============================================================

    #[tokio::test]
    async fn test_array_lifecycle_over_http() {
        // ARRANGE
        let network = MemoryNetwork::new();
        let a = engine(&network, "a");

        // ACT
        let info = create(&a, 20, ElementKind::Int64).await;

        // ASSERT
        assert_eq!(info.num_pages, 3);
        assert_eq!(info.version, 1);
        assert_eq!(info.home, NodeId::from("a"));

        let (status, Json(fetched)) = handle_get_array(Extension(a.clone()), Path(info.id.0.clone()))
            .await
            .unwrap();
        assert_eq!(status, StatusCode::OK);
        assert_eq!(fetched, info);

        handle_delete_array(Extension(a.clone()), Path(info.id.0.clone()))
            .await
            .unwrap();
        let missing = handle_get_array(Extension(a.clone()), Path(info.id.0.clone()))
            .await
            .unwrap_err();
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_set_sync_get_across_nodes() {
        // ARRANGE
        let network = MemoryNetwork::new();
        let a = engine(&network, "a");
        let b = engine(&network, "b");
        let info = create(&a, 20, ElementKind::Int64).await;

        // ACT
        assert_eq!(
            set(&a, &info.id, 4, ElementValue::Int64(12)).await.unwrap(),
            StatusCode::OK
        );
        let (_, Json(synced)) = handle_sync(Extension(a.clone()), Path(info.id.0.clone()))
            .await
            .unwrap();

        // ASSERT
        assert_eq!(synced.version, 2);
        assert_eq!(get(&b, &info.id, 4).await, ElementValue::Int64(12));
        assert_eq!(get(&b, &info.id, 5).await, ElementValue::Int64(0));

        let (_, Json(stats)) = handle_cache_stats(Extension(b.clone())).await;
        assert_eq!(stats.size, 1);

        let (_, Json(on_a)) = handle_get_array(Extension(a.clone()), Path(info.id.0.clone()))
            .await
            .unwrap();
        assert_eq!(on_a.phase, SyncPhase::Synced);
    }

    #[tokio::test]
    async fn test_float_arrays_accept_integer_values() {
        let network = MemoryNetwork::new();
        let a = engine(&network, "a");
        let info = create(&a, 8, ElementKind::Float32).await;

        set(&a, &info.id, 0, ElementValue::Int64(2)).await.unwrap();
        set(&a, &info.id, 1, ElementValue::Float32(0.5)).await.unwrap();

        assert_eq!(get(&a, &info.id, 0).await, ElementValue::Float32(2.0));
        assert_eq!(get(&a, &info.id, 1).await, ElementValue::Float32(0.5));
    }

    #[tokio::test]
    async fn test_invalid_writes_are_bad_requests() {
        let network = MemoryNetwork::new();
        let a = engine(&network, "a");
        let info = create(&a, 8, ElementKind::Int64).await;

        let mismatch = set(&a, &info.id, 0, ElementValue::Float32(0.5))
            .await
            .unwrap_err();
        assert_eq!(mismatch.status(), StatusCode::BAD_REQUEST);

        let out_of_range = set(&a, &info.id, 8, ElementValue::Int64(1))
            .await
            .unwrap_err();
        assert_eq!(out_of_range.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_conflicting_write_is_retryable_conflict() {
        // ARRANGE
        let network = MemoryNetwork::new();
        let a = engine(&network, "a");
        let b = engine(&network, "b");
        let info = create(&a, 8, ElementKind::Int64).await;
        set(&b, &info.id, 0, ElementValue::Int64(1)).await.unwrap();

        // ACT
        let err = set(&a, &info.id, 1, ElementValue::Int64(2))
            .await
            .unwrap_err();

        // ASSERT
        assert_eq!(err.status(), StatusCode::CONFLICT);
        assert!(err.0.is_retryable());

        // Closing on b releases its lease
        let (status, Json(ack)) = handle_close(Extension(b.clone()), Path(info.id.0.clone()))
            .await
            .unwrap();
        assert_eq!(status, StatusCode::OK);
        assert!(ack.success);
        assert!(set(&a, &info.id, 1, ElementValue::Int64(2)).await.is_ok());
    }

    #[tokio::test]
    async fn test_create_beyond_addressable_pages_is_bad_request() {
        let network = MemoryNetwork::new();
        let a = engine(&network, "a");

        let err = handle_create_array(
            Extension(a.clone()),
            Json(CreateArrayRequest {
                length: ((1u64 << 32) + 1) * 8,
                element: ElementKind::Int64,
            }),
        )
        .await
        .unwrap_err();

        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
        assert!(!err.0.is_retryable());
    }
}
