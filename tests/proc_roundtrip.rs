//! End-to-end procedure scenarios: the crate's own client against the
//! crate's own hyper-served server, plus a canned raw server for fault
//! injection (5xx bursts, timeouts).

mod common;

use common::{
    catalog, say_deserializer, serve, spawn_canned_server, Canned, SayInput,
};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use strand_rpc::config::{RetryConfig, TimeoutConfig};
use strand_rpc::error::{category, code};
use strand_rpc::{RpcClient, RpcServer, TypedContext};

fn retry(max_attempts: u32, initial_ms: u64, multiplier: f64) -> RetryConfig {
    RetryConfig {
        max_attempts,
        initial_delay: Duration::from_millis(initial_ms),
        max_delay: Duration::ZERO,
        delay_multiplier: multiplier,
        jitter: 0.0,
    }
}

async fn echo_server() -> String {
    let server = Arc::new(RpcServer::new(catalog()));
    server
        .register_proc("Echo", "Say", say_deserializer, |tc: TypedContext<SayInput>| async move {
            Ok(json!({ "text": tc.input.text }))
        })
        .unwrap();
    let addr = serve(server).await;
    common::base_url(addr)
}

#[tokio::test]
async fn echo_roundtrip() {
    let base = echo_server().await;
    let client = RpcClient::new(&base, catalog()).unwrap();

    let output = client
        .proc("Echo", "Say")
        .execute(json!({"text": "hi"}))
        .await
        .unwrap();
    assert_eq!(output, json!({"text": "hi"}));

    // the typed wrapper path
    let typed: SayInput = client
        .proc("Echo", "Say")
        .execute_typed(SayInput { text: "hello".into() })
        .await
        .unwrap();
    assert_eq!(typed, SayInput { text: "hello".into() });
}

#[tokio::test]
async fn missing_required_field_comes_back_typed() {
    let base = echo_server().await;
    let client = RpcClient::new(&base, catalog()).unwrap();

    let err = client
        .proc("Echo", "Say")
        .execute(json!({}))
        .await
        .unwrap_err();
    assert_eq!(err.message, "field text is required");
    assert!(err.is_category(category::VALIDATION));
    assert!(err.is_code(code::MISSING_REQUIRED_FIELD));
}

#[tokio::test]
async fn typed_decode_failure_names_the_operation() {
    let base = echo_server().await;
    let client = RpcClient::new(&base, catalog()).unwrap();

    #[derive(Debug, serde::Deserialize)]
    struct WrongShape {
        #[allow(dead_code)]
        count: u64,
    }
    let err = client
        .proc("Echo", "Say")
        .execute_typed::<_, WrongShape>(json!({"text": "hi"}))
        .await
        .unwrap_err();
    assert!(err.message.starts_with("failed to decode Say output:"));
}

#[tokio::test]
async fn retry_on_5xx_until_success() {
    common::init_tracing();
    let canned = spawn_canned_server(vec![
        Canned::Status(500),
        Canned::Status(500),
        Canned::Json(r#"{"ok":true,"output":{}}"#.into()),
    ])
    .await;
    let client = RpcClient::new(&canned.base_url(), catalog()).unwrap();

    let started = Instant::now();
    let output = client
        .proc("Echo", "Say")
        .retry(retry(3, 10, 2.0))
        .execute(json!({"text": "x"}))
        .await
        .unwrap();
    let elapsed = started.elapsed();

    assert_eq!(output, json!({}));
    assert_eq!(canned.served(), 3);
    // backoff slept 10ms then 20ms with zero jitter
    assert!(elapsed >= Duration::from_millis(30), "elapsed {elapsed:?}");
    assert!(elapsed < Duration::from_secs(2), "elapsed {elapsed:?}");
}

#[tokio::test]
async fn retry_exhaustion_returns_the_last_error() {
    let canned = spawn_canned_server(vec![Canned::Status(502), Canned::Status(502)]).await;
    let client = RpcClient::new(&canned.base_url(), catalog()).unwrap();

    let err = client
        .proc("Echo", "Say")
        .retry(retry(2, 0, 1.0))
        .execute(json!({"text": "x"}))
        .await
        .unwrap_err();

    assert_eq!(canned.served(), 2);
    assert!(err.is_category(category::HTTP));
    assert!(err.is_code(code::BAD_STATUS));
    assert_eq!(err.details.unwrap()["status"], json!(502));
}

#[tokio::test]
async fn non_5xx_status_is_fatal() {
    let canned = spawn_canned_server(vec![Canned::Status(404), Canned::Status(404)]).await;
    let client = RpcClient::new(&canned.base_url(), catalog()).unwrap();

    let err = client
        .proc("Echo", "Say")
        .retry(retry(3, 0, 1.0))
        .execute(json!({"text": "x"}))
        .await
        .unwrap_err();

    // no second attempt for a client-class status
    assert_eq!(canned.served(), 1);
    assert!(err.is_code(code::BAD_STATUS));
}

#[tokio::test]
async fn per_attempt_timeout_is_reported_as_timeout_error() {
    let server = Arc::new(RpcServer::new(catalog()));
    server
        .register_proc("Echo", "Say", say_deserializer, |tc: TypedContext<SayInput>| async move {
            tokio::time::sleep(Duration::from_millis(500)).await;
            Ok(json!({ "text": tc.input.text }))
        })
        .unwrap();
    let base = common::base_url(serve(server).await);
    let client = RpcClient::new(&base, catalog()).unwrap();

    let err = client
        .proc("Echo", "Say")
        .timeout(TimeoutConfig::new(Duration::from_millis(50)))
        .execute(json!({"text": "x"}))
        .await
        .unwrap_err();
    assert!(err.is_category(category::TIMEOUT));
    assert!(err.is_code(code::REQUEST_TIMEOUT));
}

#[tokio::test]
async fn invalid_envelope_from_server_is_a_protocol_error() {
    let canned = spawn_canned_server(vec![Canned::Json(r#"{"ok":true}"#.into())]).await;
    let client = RpcClient::new(&canned.base_url(), catalog()).unwrap();

    let err = client
        .proc("Echo", "Say")
        .execute(json!({"text": "x"}))
        .await
        .unwrap_err();
    assert!(err.is_category(category::PROTOCOL));
}

#[tokio::test]
async fn providers_apply_in_tier_order_on_the_wire() {
    let canned = spawn_canned_server(vec![Canned::Json(r#"{"ok":true,"output":{}}"#.into())]).await;
    let client = RpcClient::new(&canned.base_url(), catalog()).unwrap();

    client.use_global_provider(|| {
        Ok(vec![
            ("x-trace".into(), "global".into()),
            ("x-tier".into(), "global".into()),
        ])
    });
    client.use_rpc_provider("Echo", || Ok(vec![("x-tier".into(), "rpc".into())]));

    client
        .proc("Echo", "Say")
        .header("x-tier", "operation")
        .execute(json!({"text": "x"}))
        .await
        .unwrap();

    let head = canned.request_heads().remove(0).to_ascii_lowercase();
    assert!(head.contains("x-trace: global"));
    // operation tier overrides rpc which overrides global
    assert!(head.contains("x-tier: operation"));
    assert!(!head.contains("x-tier: rpc"));
    assert!(head.contains("content-type: application/json"));
    assert!(head.contains("accept: application/json"));
}

#[tokio::test]
async fn provider_error_aborts_without_retry() {
    let canned = spawn_canned_server(vec![Canned::Json(r#"{"ok":true,"output":{}}"#.into())]).await;
    let client = RpcClient::new(&canned.base_url(), catalog()).unwrap();
    client.use_global_provider(|| Err(strand_rpc::Error::new("token expired")));

    let err = client
        .proc("Echo", "Say")
        .retry(retry(5, 0, 1.0))
        .execute(json!({"text": "x"}))
        .await
        .unwrap_err();
    assert_eq!(err.message, "token expired");
    assert_eq!(canned.served(), 0);
}

#[tokio::test]
async fn interceptors_wrap_the_whole_attempt_loop() {
    let canned = spawn_canned_server(vec![
        Canned::Status(500),
        Canned::Json(r#"{"ok":true,"output":{}}"#.into()),
    ])
    .await;
    let client = RpcClient::new(&canned.base_url(), catalog()).unwrap();

    let invocations = Arc::new(AtomicUsize::new(0));
    {
        let invocations = invocations.clone();
        client.use_global_interceptor(move |info, next| {
            let invocations = invocations.clone();
            async move {
                invocations.fetch_add(1, Ordering::SeqCst);
                assert_eq!(info.op.to_string(), "Echo.Say");
                next(info).await
            }
        });
    }

    client
        .proc("Echo", "Say")
        .retry(retry(2, 0, 1.0))
        .execute(json!({"text": "x"}))
        .await
        .unwrap();

    // two transport attempts, one interceptor pass
    assert_eq!(canned.served(), 2);
    assert_eq!(invocations.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn interceptor_can_short_circuit() {
    let canned = spawn_canned_server(vec![Canned::Json(r#"{"ok":true,"output":{}}"#.into())]).await;
    let client = RpcClient::new(&canned.base_url(), catalog()).unwrap();
    client.use_global_interceptor(|_info, _next| async {
        Ok(Value::String("from-interceptor".into()))
    });

    let output = client
        .proc("Echo", "Say")
        .execute(json!({"text": "x"}))
        .await
        .unwrap();
    assert_eq!(output, json!("from-interceptor"));
    assert_eq!(canned.served(), 0);
}

#[tokio::test]
async fn config_precedence_uses_the_tightest_scope() {
    // rpc-level retry says 3 attempts; the canned server fails twice first
    let canned = spawn_canned_server(vec![
        Canned::Status(500),
        Canned::Status(500),
        Canned::Json(r#"{"ok":true,"output":{}}"#.into()),
    ])
    .await;
    let client = RpcClient::new(&canned.base_url(), catalog()).unwrap();
    client.set_global_retry(retry(1, 0, 1.0));
    client.set_rpc_retry("Echo", retry(3, 0, 1.0));

    client
        .proc("Echo", "Say")
        .execute(json!({"text": "x"}))
        .await
        .unwrap();
    assert_eq!(canned.served(), 3);
}
