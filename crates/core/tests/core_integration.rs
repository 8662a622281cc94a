//! core 공개 API 통합 테스트
//!
//! - 설정 빌더/검증 조합 테스트
//! - 플러그인 레지스트리 스테이징 → 승격 흐름 테스트
//! - 인메모리 카운터 스토어 계약 테스트

use std::sync::Arc;

use rulehub_core::config::{EngineConfig, EngineConfigBuilder};
use rulehub_core::error::{ConfigError, HubError};
use rulehub_core::event::{Event, HIT_RULE_KEY, Value, append_hit_rule_id};
use rulehub_core::plugin::{Plugin, PluginLookup, PluginRegistry};
use rulehub_core::store::{CounterStore, MemoryCounterStore};

// =============================================================================
// 설정
// =============================================================================

#[test]
fn default_engine_config_is_valid() {
    EngineConfig::default().validate().expect("default config should validate");
}

#[test]
fn builder_overrides_survive_validation() {
    let config = EngineConfigBuilder::new()
        .regex_cache_size(256)
        .local_cache_max_bytes(4 * 1024 * 1024)
        .pool_queue_capacity(512)
        .pool_bounds(2, 16)
        .test_mode(true)
        .build()
        .expect("config should build");

    assert_eq!(config.regex_compiled_cache_size, 256);
    assert_eq!(config.regex_result_cache_size, 256);
    assert_eq!(config.local_cache_max_bytes, 4 * 1024 * 1024);
    assert_eq!(config.pool_queue_capacity, 512);
    assert_eq!(config.pool_floor, Some(2));
    assert_eq!(config.pool_ceiling, Some(16));
    assert!(config.test_mode);
}

#[test]
fn invalid_config_surfaces_field_name() {
    let err = EngineConfigBuilder::new().pool_queue_capacity(0).build().unwrap_err();
    let ConfigError::InvalidValue { field, .. } = &err else {
        panic!("expected InvalidValue, got {err}");
    };
    assert_eq!(field, "pool_queue_capacity");

    // HubError로의 변환 확인
    let hub: HubError = err.into();
    assert!(matches!(hub, HubError::Config(_)));
}

// =============================================================================
// 이벤트 문서
// =============================================================================

#[test]
fn event_documents_roundtrip_through_json() {
    let json = r#"{"user":"alice","conn":{"ports":[22,443]},"ok":true}"#;
    let event: Event = serde_json::from_str(json).expect("event should parse");

    assert_eq!(event["user"], Value::String("alice".to_owned()));
    assert_eq!(event["ok"], Value::Bool(true));

    let serialized = serde_json::to_string(&event).expect("event should serialize");
    let reparsed: Event = serde_json::from_str(&serialized).expect("roundtrip");
    assert_eq!(event, reparsed);
}

#[test]
fn hit_rule_ids_accumulate_without_duplicates() {
    let mut event = Event::new();
    append_hit_rule_id(&mut event, "rs.r1");
    append_hit_rule_id(&mut event, "rs.r2");
    append_hit_rule_id(&mut event, "rs.r1");

    assert_eq!(event[HIT_RULE_KEY], Value::String("rs.r1,rs.r2".to_owned()));
}

// =============================================================================
// 플러그인 레지스트리
// =============================================================================

#[test]
fn staging_to_promotion_flow() {
    let registry = PluginRegistry::new();
    registry
        .register_staged(Plugin::new_bool("is_internal", vec![], |args| {
            let ip = args.first().map(Value::projected).unwrap_or_default();
            Ok(ip.starts_with("10."))
        }))
        .expect("staged registration should succeed");

    // 승격 전에는 확정 조회에 보이지 않습니다.
    assert!(registry.get("is_internal").is_none());
    assert!(matches!(registry.lookup("is_internal"), PluginLookup::Staged));

    registry.promote("is_internal").expect("promotion should succeed");
    let plugin = registry.get("is_internal").expect("promoted plugin visible");

    let result = plugin
        .call_bool(&[Value::String("10.0.0.7".to_owned())])
        .expect("call should succeed");
    assert!(result);
}

// =============================================================================
// 인메모리 카운터 스토어
// =============================================================================

#[tokio::test]
async fn memory_store_honors_contract() {
    let store: Arc<dyn CounterStore> = Arc::new(MemoryCounterStore::new());

    assert!(store.set_if_absent("c", 1, 60).await.unwrap());
    assert!(!store.set_if_absent("c", 9, 60).await.unwrap());
    assert_eq!(store.incr_by("c", 4).await.unwrap(), 5);

    store.set("group_a", 2, 60).await.unwrap();
    store.set("group_b", 3, 60).await.unwrap();
    let keys = store.keys_matching("group_").await.unwrap();
    assert_eq!(keys.len(), 2);

    store.del("group_a").await.unwrap();
    assert_eq!(store.keys_matching("group_").await.unwrap(), vec!["group_b".to_owned()]);
}
