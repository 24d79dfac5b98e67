//! Fetching, linking and caching of components.

mod common;

use common::{app_origin, config, constant, forward, plugin_url, Harness};
use serde_json::json;
use supervisor::host_api::http::HttpResponse;
use supervisor::{ErrorKind, FunctionCallArgs, SupervisorError};

async fn ping(h: &Harness, service: &str) -> Result<serde_json::Value, SupervisorError> {
    h.supervisor
        .function_call(&app_origin("myapp"), FunctionCallArgs::new(service, "api", "ping", vec![]))
        .await
}

fn with_import(import: &str) -> String {
    format!(
        r#"(module
  {import}
  (memory (export "memory") 1)
  (func (export "api::ping") (param i32 i32 i32 i32) (result i32)
    (i32.const 0)))"#
    )
}

#[tokio::test]
async fn imports_outside_the_supported_surface_fail_to_link() {
    let h = Harness::new(config());
    let cases = [
        ("unknown-op", r#"(import "host:common/api" "teleport" (func (param i32 i32) (result i64)))"#),
        ("bad-sig", r#"(import "host:common/api" "dbGet" (func (param i32) (result i32)))"#),
        ("bad-wasi", r#"(import "wasi_snapshot_preview1" "path_open" (func (param i32) (result i32)))"#),
        ("no-namespace", r#"(import "env" "abort" (func))"#),
        (
            "reserved-target",
            r#"(import "supervisor:plugin/permissions" "accept" (func (param i32 i32 i32 i32) (result i32)))"#,
        ),
        (
            "bad-proxy-sig",
            r#"(import "tokens:plugin/api" "balance" (func (param i32 i32) (result i64)))"#,
        ),
    ];
    for (service, import) in cases {
        h.publish(service, "plugin", &with_import(import));
        let err = ping(&h, service).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Link, "{service}: {err}");
    }
}

#[tokio::test]
async fn unusable_modules_fail_to_instantiate() {
    let h = Harness::new(config());
    h.http
        .route(&plugin_url("garbage", "plugin"), HttpResponse::ok("definitely not wasm"));
    h.publish(
        "amnesiac",
        "plugin",
        r#"(module (func (export "api::ping") (param i32 i32 i32 i32) (result i32) (i32.const 0)))"#,
    );
    h.publish(
        "doomed",
        "plugin",
        r#"(module
  (memory (export "memory") 1)
  (func $start unreachable)
  (start $start)
  (func (export "api::ping") (param i32 i32 i32 i32) (result i32) (i32.const 0)))"#,
    );

    for service in ["garbage", "amnesiac", "doomed"] {
        let err = ping(&h, service).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Instantiate, "{service}: {err}");
    }
    assert!(h.supervisor.loaded_plugins().is_empty());
}

#[tokio::test]
async fn unavailable_plugins_are_not_found_and_retried() {
    let h = Harness::new(config());
    h.http.route(
        &plugin_url("down", "plugin"),
        HttpResponse {
            status: 503,
            headers: Vec::new(),
            body: Vec::new(),
        },
    );
    assert_eq!(ping(&h, "down").await.unwrap_err().kind(), ErrorKind::NotFound);
    assert_eq!(ping(&h, "late").await.unwrap_err().kind(), ErrorKind::NotFound);

    h.publish("late", "plugin", &constant("api::ping", "1"));
    assert_eq!(ping(&h, "late").await.unwrap(), json!(1));
    assert_eq!(h.http.request_count(&plugin_url("late", "plugin")), 2);
}

#[tokio::test]
async fn concurrent_first_calls_share_one_load() {
    let h = Harness::new(config());
    h.publish("popular", "plugin", &constant("api::ping", r#""pong""#));

    let calls: Vec<_> = (0..8)
        .map(|_| {
            let supervisor = h.supervisor.clone();
            tokio::spawn(async move {
                supervisor
                    .function_call(
                        &app_origin("myapp"),
                        FunctionCallArgs::new("popular", "api", "ping", vec![]),
                    )
                    .await
            })
        })
        .collect();
    for call in calls {
        assert_eq!(call.await.unwrap().unwrap(), json!("pong"));
    }
    assert_eq!(h.http.request_count(&plugin_url("popular", "plugin")), 1);
}

#[tokio::test]
async fn preload_follows_dependencies_and_system_plugins() {
    let mut config = config();
    config.system_plugins = vec!["sys".into()];
    let h = Harness::new(config);
    h.publish("alpha", "plugin", &forward("api::ping", "beta:plugin", "api", "ping"));
    h.publish("beta", "plugin", &forward("api::ping", "gamma:plugin", "api", "ping"));
    h.publish("gamma", "plugin", &constant("api::ping", "3"));
    h.publish("sys", "plugin", &constant("api::ping", "0"));

    let loaded = h
        .supervisor
        .preload_plugins(&app_origin("myapp"), &["alpha".to_string()])
        .await
        .unwrap();
    let mut names: Vec<String> = loaded.iter().map(|id| id.to_string()).collect();
    names.sort();
    assert_eq!(names, ["alpha:plugin", "beta:plugin", "gamma:plugin", "sys:plugin"]);

    // Calls after a preload reuse the instances.
    assert_eq!(ping(&h, "alpha").await.unwrap(), json!({"Ok": {"Ok": 3}}));
    for service in ["alpha", "beta", "gamma", "sys"] {
        assert_eq!(h.http.request_count(&plugin_url(service, "plugin")), 1);
    }
}

#[tokio::test]
async fn preload_reports_failures_after_loading_the_rest() {
    let h = Harness::new(config());
    h.publish("alpha", "plugin", &constant("api::ping", "1"));

    let err = h
        .supervisor
        .preload_plugins(&app_origin("myapp"), &["missing".to_string(), "alpha".to_string()])
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
    assert_eq!(h.supervisor.loaded_plugins().len(), 1);
}

#[tokio::test]
async fn reserved_namespaces_are_never_fetched() {
    let h = Harness::new(config());

    let loaded = h
        .supervisor
        .preload_plugins(&app_origin("myapp"), &["host:common".to_string(), "wasi".to_string()])
        .await
        .unwrap();
    assert!(loaded.is_empty());

    for service in ["host", "wasi"] {
        assert_eq!(ping(&h, service).await.unwrap_err().kind(), ErrorKind::NotFound);
    }
    assert!(h.http.requests().is_empty());
}

#[tokio::test]
async fn reset_drops_cached_instances() {
    let h = Harness::new(config());
    h.publish("counter", "plugin", &constant("api::ping", "1"));

    ping(&h, "counter").await.unwrap();
    h.supervisor.reset();
    assert!(h.supervisor.loaded_plugins().is_empty());
    ping(&h, "counter").await.unwrap();
    assert_eq!(h.http.request_count(&plugin_url("counter", "plugin")), 2);
}
