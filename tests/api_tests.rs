mod common;

use std::time::{Duration, Instant};

use reqwest::StatusCode;
use serde_json::{json, Value};

use scriptgate::models::HttpMethod;
use scriptgate::store::EndpointStore;

// ── Health & auth ───────────────────────────────────────────────

#[tokio::test]
async fn health_returns_ok() {
    let app = common::spawn_app().await;

    let resp = app.client.get(app.url("/health")).send().await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.text().await.unwrap(), "ok");
}

#[tokio::test]
async fn dispatch_requires_token() {
    let app = common::spawn_app().await;
    app.create_endpoint(HttpMethod::Get, "/ping", "response.body = { pong: true }");

    let resp = app.client.get(app.url("/api/ping")).send().await.unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"], "Missing authentication token");
}

#[tokio::test]
async fn bad_token_is_rejected() {
    let app = common::spawn_app().await;

    let resp = app
        .client
        .post(app.url("/api/execute"))
        .bearer_auth("not-a-token")
        .json(&json!({ "code": "1" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn cookie_token_is_accepted() {
    let app = common::spawn_app().await;
    app.create_endpoint(HttpMethod::Get, "/ping", "response.body = { pong: true }");

    let resp = app
        .client
        .get(app.url("/api/ping"))
        .header("cookie", format!("access_token={}", app.token))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
}

// ── Dynamic dispatch ────────────────────────────────────────────

#[tokio::test]
async fn get_endpoint_returns_script_body() {
    let app = common::spawn_app().await;
    app.create_endpoint(HttpMethod::Get, "/ping", "response.body = { pong: true }");

    let (status, text) = app.get_auth("/api/ping").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(text, r#"{"pong":true}"#);
}

#[tokio::test]
async fn post_endpoint_echoes_request_body() {
    let app = common::spawn_app().await;
    app.create_endpoint(HttpMethod::Post, "/echo", "response.body = request.body");

    let (body, status) = app.post_auth("/api/echo", &json!({ "x": 1 })).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({ "x": 1 }));
}

#[tokio::test]
async fn method_is_part_of_the_route() {
    let app = common::spawn_app().await;
    app.create_endpoint(HttpMethod::Post, "/echo", "response.body = request.body");

    let (body, status) = app.get_json("/api/echo").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body, json!({ "error": "Endpoint not found" }));
}

#[tokio::test]
async fn unknown_path_is_not_found() {
    let app = common::spawn_app().await;

    let (body, status) = app.get_json("/api/nothing/here").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "Endpoint not found");
}

#[tokio::test]
async fn nested_paths_resolve() {
    let app = common::spawn_app().await;
    app.create_endpoint(HttpMethod::Get, "users/list/", "response.body = [1, 2]");

    let (body, status) = app.get_json("/api/users/list").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!([1, 2]));
}

#[tokio::test]
async fn script_sees_query_and_safe_headers() {
    let app = common::spawn_app().await;
    app.create_endpoint(
        HttpMethod::Get,
        "/inspect",
        "response.body = {\n  method: request.method,\n  name: request.query.name,\n  custom: request.headers['x-custom'],\n  auth: request.headers.authorization === undefined,\n};",
    );

    let resp = app
        .client
        .get(app.url("/api/inspect?name=ada"))
        .bearer_auth(&app.token)
        .header("x-custom", "yes")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(
        body,
        json!({ "method": "GET", "name": "ada", "custom": "yes", "auth": true })
    );
}

#[tokio::test]
async fn form_bodies_are_parsed() {
    let app = common::spawn_app().await;
    app.create_endpoint(HttpMethod::Post, "/form", "response.body = request.body");

    let resp = app
        .client
        .post(app.url("/api/form"))
        .bearer_auth(&app.token)
        .form(&[("name", "ada"), ("lang", "js")])
        .send()
        .await
        .unwrap();
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body, json!({ "name": "ada", "lang": "js" }));
}

#[tokio::test]
async fn script_controls_status_and_headers() {
    let app = common::spawn_app().await;
    app.create_endpoint(
        HttpMethod::Post,
        "/create",
        "response.status = 201;\nresponse.headers['x-made-by'] = 'script';\nresponse.body = 'created';",
    );

    let resp = app
        .client
        .post(app.url("/api/create"))
        .bearer_auth(&app.token)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::CREATED);
    assert_eq!(resp.headers()["x-made-by"], "script");
    assert_eq!(resp.text().await.unwrap(), "created");
}

#[tokio::test]
async fn request_object_is_read_only() {
    let app = common::spawn_app().await;
    app.create_endpoint(
        HttpMethod::Get,
        "/frozen",
        "request.query.name = 'changed';\nresponse.body = request.query;",
    );

    let (body, status) = app.get_json("/api/frozen?name=orig").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({ "name": "orig" }));

    app.create_endpoint(
        HttpMethod::Get,
        "/frozen-strict",
        "'use strict';\nrequest.query.name = 'changed';",
    );
    let (body, status) = app.get_json("/api/frozen-strict?name=orig").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let error = body["error"].as_str().unwrap();
    assert!(error.starts_with("Error at line 2: TypeError"), "{error}");
}

#[tokio::test]
async fn output_envelope_when_no_body() {
    let app = common::spawn_app().await;
    app.create_endpoint(HttpMethod::Get, "/log", "console.log('hello', { a: 1 });\nconsole.warn('careful');");
    app.create_endpoint(HttpMethod::Get, "/quiet", "const x = 1;");

    let (body, status) = app.get_json("/api/log").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        body,
        json!({ "success": true, "output": "hello {\"a\":1}", "error": null })
    );

    let (body, _) = app.get_json("/api/quiet").await;
    assert_eq!(body["output"], "Script executed successfully (no output)");
}

#[tokio::test]
async fn invalid_status_is_a_script_failure() {
    let app = common::spawn_app().await;
    app.create_endpoint(HttpMethod::Get, "/bad", "response.status = 5000;\nresponse.body = 'x';");

    let (body, status) = app.get_json("/api/bad").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["success"], false);
    assert!(body["error"]
        .as_str()
        .unwrap()
        .starts_with("Error: Invalid response status: 5000"));
}

// ── Failures & diagnostics ──────────────────────────────────────

#[tokio::test]
async fn disallowed_module_fails_dispatch() {
    let app = common::spawn_app().await;
    app.create_endpoint(HttpMethod::Get, "/mod", "require('not-a-real-module')");

    let (body, status) = app.get_json("/api/mod").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["success"], false);
    assert_eq!(body["output"], Value::Null);
    assert!(body["error"]
        .as_str()
        .unwrap()
        .contains("Module 'not-a-real-module' is not allowed for import"));
}

#[tokio::test]
async fn thrown_error_points_at_its_line() {
    let app = common::spawn_app().await;
    app.create_endpoint(
        HttpMethod::Get,
        "/throws",
        "const a = 1;\nconst b = 2;\nthrow new Error('bad thing');\nconst c = 3;",
    );

    let (body, status) = app.get_json("/api/throws").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let error = body["error"].as_str().unwrap();
    assert!(error.starts_with("Error at line 3: bad thing\n\n"), "{error}");
    assert!(error.contains("> 3 | throw new Error('bad thing');"), "{error}");
    assert!(error.contains("  1 | const a = 1;"), "{error}");
    assert!(!error.contains("sandbox:"), "{error}");
}

#[tokio::test]
async fn typed_errors_keep_their_name() {
    let app = common::spawn_app().await;
    app.create_endpoint(HttpMethod::Get, "/undef", "const x = 1;\nmissingFunction();");

    let (body, _) = app.get_json("/api/undef").await;
    let error = body["error"].as_str().unwrap();
    assert!(
        error.starts_with("Error at line 2: ReferenceError: missingFunction is not defined"),
        "{error}"
    );
}

#[tokio::test]
async fn syntax_error_fails_with_diagnostic() {
    let app = common::spawn_app().await;
    app.create_endpoint(HttpMethod::Get, "/syntax", "const a = ;");

    let (body, status) = app.get_json("/api/syntax").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let error = body["error"].as_str().unwrap();
    assert!(error.contains("SyntaxError"), "{error}");
    assert!(error.contains("const a = ;"), "{error}");
}

#[tokio::test]
async fn infinite_loop_times_out() {
    let app = common::spawn_app_with(|config| {
        config.sandbox.exec_timeout = Duration::from_millis(500);
    })
    .await;
    app.create_endpoint(HttpMethod::Get, "/spin", "let n = 0;\nwhile (true) { n++; }");

    let started = Instant::now();
    let (body, status) = app.get_json("/api/spin").await;
    assert!(started.elapsed() < Duration::from_secs(4));

    assert_eq!(status, StatusCode::BAD_REQUEST);
    let error = body["error"].as_str().unwrap();
    assert!(
        error.starts_with("Error: Script execution timed out after 500ms\n\n"),
        "{error}"
    );
    assert!(error.contains("1 | let n = 0;"), "{error}");
    assert!(error.contains("2 | while (true) { n++; }"), "{error}");
}

#[tokio::test]
async fn server_keeps_serving_after_timeout() {
    let app = common::spawn_app_with(|config| {
        config.sandbox.exec_timeout = Duration::from_millis(300);
    })
    .await;
    app.create_endpoint(HttpMethod::Get, "/spin", "for (;;) {}");
    app.create_endpoint(HttpMethod::Get, "/ping", "response.body = { pong: true }");

    let (_, status) = app.get_json("/api/spin").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (body, status) = app.get_json("/api/ping").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({ "pong": true }));
}

// ── Isolation ───────────────────────────────────────────────────

#[tokio::test]
async fn runs_share_no_state() {
    let app = common::spawn_app().await;
    app.create_endpoint(
        HttpMethod::Get,
        "/a",
        "globalThis.leaked = 42;\nresponse.status = 202;\nresponse.headers['x-a'] = '1';\nconsole.log('from a');\nresponse.body = 'a';",
    );
    app.create_endpoint(
        HttpMethod::Get,
        "/b",
        "response.body = {\n  leaked: typeof leaked,\n  status: response.status,\n  headers: response.headers,\n};",
    );

    let (status, _) = app.get_auth("/api/a").await;
    assert_eq!(status, StatusCode::ACCEPTED);

    let (body, status) = app.get_json("/api/b").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({ "leaked": "undefined", "status": 200, "headers": {} }));

    let b = app
        .store
        .find_endpoint(HttpMethod::Get, "/b")
        .await
        .unwrap()
        .unwrap();
    let log = b.log_entries();
    assert_eq!(log.len(), 1);
    assert!(!log[0].console.contains("from a"));
}

#[tokio::test]
async fn host_objects_are_hidden() {
    let app = common::spawn_app().await;

    let (body, _) = app
        .execute("return [typeof Deno, typeof __bootstrap, Object.keys(process.env).length].join(',');")
        .await;
    assert_eq!(body["returnValue"], "undefined,undefined,0");
}

// ── Variable bundles ────────────────────────────────────────────

#[tokio::test]
async fn bundle_lines_run_before_endpoint_code() {
    let app = common::spawn_app().await;
    let bundle = app.create_bundle(
        "greetings",
        &["const greeting = 'hi';", "const target = greeting + ' there';"],
    );
    let endpoint = app.create_endpoint_with_bundle(
        HttpMethod::Get,
        "/greet",
        "response.body = target;",
        &bundle,
        false,
    );

    let (status, text) = app.get_auth("/api/greet").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(text, "hi there");

    let stored = app.store.get_endpoint(endpoint.id).await.unwrap().unwrap();
    assert_eq!(stored.code, "response.body = target;");
}

#[tokio::test]
async fn production_code_inlines_bundle_on_request() {
    let app = common::spawn_app().await;
    let bundle = app.create_bundle("vars", &["const limit = 10;"]);
    let inlined = app.create_endpoint_with_bundle(HttpMethod::Get, "/inlined", "response.body = limit;", &bundle, true);
    let separate = app.create_endpoint_with_bundle(HttpMethod::Get, "/separate", "response.body = limit;", &bundle, false);

    let (body, status) = app
        .get_json(&format!("/manage/endpoints/{}/production", inlined.id))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        body,
        json!({ "code": "const limit = 10;\nresponse.body = limit;", "inlined": true })
    );

    let (body, _) = app
        .get_json(&format!("/manage/endpoints/{}/production", separate.id))
        .await;
    assert_eq!(body, json!({ "code": "response.body = limit;", "inlined": false }));
}

// ── Execution log ───────────────────────────────────────────────

#[tokio::test]
async fn every_run_is_logged_and_log_clears() {
    let app = common::spawn_app().await;
    let endpoint = app.create_endpoint(
        HttpMethod::Post,
        "/count",
        "console.log('seen', request.body.n);\nif (request.body.n > 1) throw new Error('too many');\nresponse.body = 'ok';",
    );

    app.post_auth("/api/count", &json!({ "n": 1 })).await;
    let (_, status) = app.post_auth("/api/count", &json!({ "n": 2 })).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let logs_path = format!("/manage/endpoints/{}/logs", endpoint.id);
    let (body, status) = app.get_json(&logs_path).await;
    assert_eq!(status, StatusCode::OK);
    let entries = body.as_array().unwrap();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0]["success"], true);
    assert_eq!(entries[0]["output"], "seen 1");
    assert_eq!(entries[1]["success"], false);
    assert_eq!(entries[1]["output"], "seen 2");
    let request: Value = serde_json::from_str(entries[0]["request"].as_str().unwrap()).unwrap();
    assert_eq!(request["body"], json!({ "n": 1 }));

    assert_eq!(app.delete_auth(&logs_path).await, StatusCode::NO_CONTENT);
    let (body, _) = app.get_json(&logs_path).await;
    assert_eq!(body, json!([]));
}

#[tokio::test]
async fn logs_of_missing_endpoint_are_not_found() {
    let app = common::spawn_app().await;
    let path = format!("/manage/endpoints/{}/logs", uuid::Uuid::new_v4());

    let (body, status) = app.get_json(&path).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "Endpoint not found");
    assert_eq!(app.delete_auth(&path).await, StatusCode::NOT_FOUND);
}

// ── Ad-hoc execution ────────────────────────────────────────────

#[tokio::test]
async fn execute_swallows_thrown_errors() {
    let app = common::spawn_app().await;

    let (body, status) = app.execute("throw new Error('boom')").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert_eq!(body["error"], Value::Null);
    assert!(body["consoleOutput"]
        .as_str()
        .unwrap()
        .contains("Error in execution: boom"));
}

#[tokio::test]
async fn execute_supports_await_and_return() {
    let app = common::spawn_app().await;

    let (body, status) = app
        .execute("console.log('start');\nawait new Promise((r) => setTimeout(r, 20));\nconsole.warn('done');\nreturn { ok: true };")
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["output"], "start");
    assert_eq!(body["consoleOutput"], "start\n[warn] done");
    assert_eq!(body["returnValue"], r#"{"ok":true}"#);
}

#[tokio::test]
async fn late_output_after_settle_window_is_lost() {
    let app = common::spawn_app().await;

    let (body, status) = app
        .execute("setTimeout(() => console.log('soon'), 10);\nsetTimeout(() => console.log('too late'), 5000);")
        .await;
    assert_eq!(status, StatusCode::OK);
    let console = body["consoleOutput"].as_str().unwrap();
    assert!(console.contains("soon"), "{console}");
    assert!(!console.contains("too late"), "{console}");
}

#[tokio::test]
async fn execute_syntax_error_is_reported() {
    let app = common::spawn_app().await;

    let (body, status) = app.execute("const = 1;").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["success"], false);
    assert!(body["error"].as_str().unwrap().contains("SyntaxError"));
}

#[tokio::test]
async fn malformed_execute_body_is_server_error() {
    let app = common::spawn_app().await;

    let resp = app
        .client
        .post(app.url("/api/execute"))
        .bearer_auth(&app.token)
        .header("content-type", "application/json")
        .body("{not json")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["success"], false);
    assert!(body["error"].as_str().unwrap().starts_with("Server Error: "));
}

#[tokio::test]
async fn standard_profile_includes_fetch() {
    let app = common::spawn_app().await;

    let (body, _) = app.execute("return typeof require('fetch');").await;
    assert_eq!(body["returnValue"], "function");
}

#[tokio::test]
async fn fs_is_rooted_in_sandbox_directory() {
    let app = common::spawn_app().await;

    let (body, _) = app
        .execute("const fs = require('fs');\nfs.mkdirSync('notes', { recursive: true });\nfs.writeFileSync('notes/a.txt', 'hello');\nreturn fs.readFileSync('/notes/a.txt', 'utf8');")
        .await;
    assert_eq!(body["returnValue"], "hello");
    let written = std::fs::read_to_string(app.fs_root.path().join("notes/a.txt")).unwrap();
    assert_eq!(written, "hello");

    let (body, _) = app
        .execute("require('fs').readFileSync('../../etc/passwd', 'utf8');")
        .await;
    assert!(body["consoleOutput"]
        .as_str()
        .unwrap()
        .contains("escapes the sandbox directory"));
}

// ── Public execution ────────────────────────────────────────────

#[tokio::test]
async fn public_preflight() {
    let app = common::spawn_app().await;

    let resp = app
        .client
        .request(reqwest::Method::OPTIONS, app.url("/api/public/execute"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NO_CONTENT);
    assert_eq!(resp.headers()["access-control-allow-origin"], "*");
    assert_eq!(resp.headers()["access-control-allow-methods"], "POST, OPTIONS");
    assert_eq!(resp.headers()["access-control-allow-headers"], "Content-Type");
    assert!(resp.text().await.unwrap().is_empty());
}

#[tokio::test]
async fn public_execute_needs_no_token_and_allows_any_origin() {
    let app = common::spawn_app().await;

    let resp = app.public_execute("console.log(1 + 1);").await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.headers()["access-control-allow-origin"], "*");
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["output"], "2");
}

#[tokio::test]
async fn public_profile_denies_fetch() {
    let app = common::spawn_app().await;

    let resp = app.public_execute("require('fetch');").await;
    assert_eq!(resp.status(), StatusCode::OK);
    let body: Value = resp.json().await.unwrap();
    assert!(body["consoleOutput"]
        .as_str()
        .unwrap()
        .contains("Module 'fetch' is not allowed for import"));

    let resp = app.public_execute("return typeof require('zlib').gzipSync;").await;
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["returnValue"], "function");
}

#[tokio::test]
async fn public_errors_carry_cors_header() {
    let app = common::spawn_app().await;

    let resp = app
        .client
        .post(app.url("/api/public/execute"))
        .header("content-type", "application/json")
        .body("nope")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(resp.headers()["access-control-allow-origin"], "*");
}

#[tokio::test]
async fn public_execute_is_rate_limited() {
    let app = common::spawn_app_with(|config| {
        config.public_rate_limit = 1;
    })
    .await;

    let resp = app.public_execute("1").await;
    assert_eq!(resp.status(), StatusCode::OK);

    let resp = app.public_execute("1").await;
    assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(resp.headers()["access-control-allow-origin"], "*");
    assert!(resp.headers().contains_key("retry-after"));
}
