//! Routing, loading and error reporting of top-level and nested calls.

mod common;

use common::{app_origin, config, constant, echo, failing, forward, host_calls, plugin_url, trapping, Harness};
use serde_json::json;
use supervisor::{ErrorKind, FunctionCallArgs, SupervisorConfig};

#[tokio::test]
async fn ungated_call_loads_lazily_without_prompting() {
    let mut h = Harness::new(config());
    h.publish("accounts", "plugin", &constant("api::login", r#"{"user":"alice"}"#));
    assert!(h.supervisor.loaded_plugins().is_empty());
    assert_eq!(h.http.request_count(&plugin_url("accounts", "plugin")), 0);

    let args = FunctionCallArgs::new("accounts", "api", "login", vec![json!("alice")]);
    let result = h
        .supervisor
        .function_call(&app_origin("myapp"), args.clone())
        .await
        .unwrap();
    assert_eq!(result, json!({"user": "alice"}));

    let again = h.supervisor.function_call(&app_origin("myapp"), args).await.unwrap();
    assert_eq!(again, result);
    assert_eq!(h.http.request_count(&plugin_url("accounts", "plugin")), 1);
    assert_eq!(h.supervisor.loaded_plugins().len(), 1);

    assert!(h.prompts.try_recv().is_err());
    assert_eq!(h.supervisor.pending_request().unwrap(), None);
}

#[tokio::test]
async fn params_reach_the_export() {
    let h = Harness::new(config());
    h.publish("tokens", "plugin", &echo("transfer::credit"));

    let result = h
        .supervisor
        .function_call(
            &app_origin("wallet"),
            FunctionCallArgs::new("tokens", "transfer", "credit", vec![json!("bob"), json!(12)]),
        )
        .await
        .unwrap();
    assert_eq!(result, json!(["bob", 12]));
}

#[tokio::test]
async fn malformed_calls_are_rejected_before_loading() {
    let h = Harness::new(config());
    let origin = app_origin("myapp");

    let bad_service = h
        .supervisor
        .function_call(&origin, FunctionCallArgs::new("Bad_Service", "api", "x", vec![]))
        .await
        .unwrap_err();
    assert_eq!(bad_service.kind(), ErrorKind::Validation);

    let mut not_array = FunctionCallArgs::new("accounts", "api", "login", vec![]);
    not_array.params = json!({"user": "alice"});
    let err = h.supervisor.function_call(&origin, not_array).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);

    assert!(h.http.requests().is_empty());
}

#[tokio::test]
async fn missing_plugins_and_exports_are_not_found() {
    let h = Harness::new(config());
    h.publish("accounts", "plugin", &constant("api::login", "true"));
    let origin = app_origin("myapp");

    let err = h
        .supervisor
        .function_call(&origin, FunctionCallArgs::new("nowhere", "api", "x", vec![]))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);

    let err = h
        .supervisor
        .function_call(&origin, FunctionCallArgs::new("accounts", "api", "logout", vec![]))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn trap_is_reported_and_instance_stays_usable() {
    let h = Harness::new(config());
    h.publish("flaky", "plugin", &trapping("api::boom"));
    let origin = app_origin("myapp");

    let err = h
        .supervisor
        .function_call(&origin, FunctionCallArgs::new("flaky", "api", "boom", vec![]))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Trap);

    let ok = h
        .supervisor
        .function_call(&origin, FunctionCallArgs::new("flaky", "ok", "ping", vec![]))
        .await
        .unwrap();
    assert_eq!(ok, json!("pong"));
}

#[tokio::test]
async fn bad_component_output_is_a_plugin_error() {
    let h = Harness::new(config());
    h.publish("broken", "plugin", &failing("api::fail"));
    h.publish("garbled", "plugin", &constant("api::get", "not json"));
    let origin = app_origin("myapp");

    let err = h
        .supervisor
        .function_call(&origin, FunctionCallArgs::new("broken", "api", "fail", vec![]))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Plugin);

    let err = h
        .supervisor
        .function_call(&origin, FunctionCallArgs::new("garbled", "api", "get", vec![]))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Plugin);
}

#[tokio::test]
async fn reentering_a_running_service_is_a_cycle() {
    let h = Harness::new(config());
    h.publish("alpha", "plugin", &forward("api::run", "beta:plugin", "api", "run"));
    h.publish("beta", "plugin", &forward("api::run", "alpha:plugin", "api", "run"));

    let result = h
        .supervisor
        .function_call(&app_origin("myapp"), FunctionCallArgs::new("alpha", "api", "run", vec![]))
        .await
        .unwrap();

    // alpha sees beta's output, which is beta's failed call back into alpha.
    assert_eq!(
        result,
        json!({"Ok": {"Err": {"message": "alpha -> beta -> alpha", "kind": "cyclic_call"}}})
    );
}

#[tokio::test]
async fn nested_calls_are_attributed_to_the_calling_service() {
    let h = Harness::new(config());
    h.publish("alpha", "plugin", &forward("api::run", "beta:plugin", "api", "stack"));
    h.publish(
        "beta",
        "plugin",
        &host_calls(&[
            ("api::stack", "getServiceStack", ""),
            ("api::remember", "dbSet", r#"{"key":"seen","value":true}"#),
        ]),
    );

    let result = h
        .supervisor
        .function_call(&app_origin("myapp"), FunctionCallArgs::new("alpha", "api", "run", vec![]))
        .await
        .unwrap();
    assert_eq!(result, json!({"Ok": {"Ok": ["alpha", "beta"]}}));

    let stored = h
        .supervisor
        .function_call(&app_origin("myapp"), FunctionCallArgs::new("beta", "api", "remember", vec![]))
        .await
        .unwrap();
    assert_eq!(stored, json!({"Ok": null}));
    assert!(h.has_storage_key("test-chain:beta:seen"));
}

#[tokio::test]
async fn aliases_redirect_to_the_implementing_plugin() {
    let mut config = config();
    config
        .plugin_aliases
        .insert("accounts:smart-auth".into(), "auth-sig:plugin".into());
    let h = Harness::new(config);
    h.publish("auth-sig", "plugin", &constant("auth::check", "true"));

    let result = h
        .supervisor
        .function_call(
            &app_origin("myapp"),
            FunctionCallArgs::new("accounts", "auth", "check", vec![]).with_plugin("smart-auth"),
        )
        .await
        .unwrap();
    assert_eq!(result, json!(true));
    assert_eq!(h.http.request_count(&plugin_url("auth-sig", "plugin")), 1);
    assert_eq!(h.http.request_count(&plugin_url("accounts", "smart-auth")), 0);
}

#[tokio::test]
async fn homepage_origin_calls_as_homepage() {
    let h = Harness::new(config());
    h.publish("viewer", "plugin", &host_calls(&[("api::app", "getActiveApp", "")]));

    let result = h
        .supervisor
        .function_call("https://psibase.test", FunctionCallArgs::new("viewer", "api", "app", vec![]))
        .await
        .unwrap();
    assert_eq!(
        result,
        json!({"Ok": {"app": "homepage", "origin": "https://psibase.test"}})
    );
}

#[tokio::test]
async fn component_errors_name_their_producer() {
    let h = Harness::new(config());
    h.publish("flaky", "plugin", &trapping("api::boom"));
    h.publish("alpha", "plugin", &forward("api::run", "beta:plugin", "api", "run"));
    h.publish("beta", "plugin", &failing("api::run"));
    let origin = app_origin("myapp");

    let err = h
        .supervisor
        .function_call(&origin, FunctionCallArgs::new("flaky", "api", "boom", vec![]))
        .await
        .unwrap_err();
    assert_eq!(err.producer(), Some("flaky"));
    assert_eq!(err.to_payload().producer.as_deref(), Some("flaky"));

    let result = h
        .supervisor
        .function_call(&origin, FunctionCallArgs::new("alpha", "api", "run", vec![]))
        .await
        .unwrap();
    assert_eq!(result["Err"]["kind"], "plugin");
    assert_eq!(result["Err"]["producer"], "beta");

    // Errors raised by the Supervisor itself carry no producer.
    let err = h
        .supervisor
        .function_call(&origin, FunctionCallArgs::new("nowhere", "api", "x", vec![]))
        .await
        .unwrap_err();
    assert_eq!(err.producer(), None);
}

fn transact_config() -> SupervisorConfig {
    let mut config = config();
    config.transact_plugin = Some("transact:plugin".into());
    config
}

fn publish_transact(h: &Harness) {
    h.publish(
        "transact",
        "plugin",
        &host_calls(&[
            ("admin::startTx", "dbSet", r#"{"key":"started","value":true}"#),
            ("admin::finishTx", "dbSet", r#"{"key":"finished","value":true}"#),
        ]),
    );
}

#[tokio::test]
async fn top_level_calls_run_inside_a_transaction() {
    let h = Harness::new(transact_config());
    publish_transact(&h);
    h.publish("accounts", "plugin", &constant("api::login", r#""alice""#));

    let result = h
        .supervisor
        .function_call(&app_origin("myapp"), FunctionCallArgs::new("accounts", "api", "login", vec![]))
        .await
        .unwrap();
    assert_eq!(result, json!("alice"));
    assert!(h.has_storage_key("test-chain:transact:started"));
    assert!(h.has_storage_key("test-chain:transact:finished"));
}

#[tokio::test]
async fn failed_call_leaves_the_transaction_unfinished() {
    let h = Harness::new(transact_config());
    publish_transact(&h);
    h.publish("broken", "plugin", &failing("api::fail"));

    let err = h
        .supervisor
        .function_call(&app_origin("myapp"), FunctionCallArgs::new("broken", "api", "fail", vec![]))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Plugin);
    assert!(h.has_storage_key("test-chain:transact:started"));
    assert!(!h.has_storage_key("test-chain:transact:finished"));
}

#[tokio::test]
async fn missing_transaction_plugin_fails_the_call() {
    let h = Harness::new(transact_config());
    h.publish("accounts", "plugin", &constant("api::login", r#""alice""#));

    let err = h
        .supervisor
        .function_call(&app_origin("myapp"), FunctionCallArgs::new("accounts", "api", "login", vec![]))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
    assert_eq!(h.http.request_count(&plugin_url("accounts", "plugin")), 0);
}
