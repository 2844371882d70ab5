use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use reqwest::{Client, StatusCode};
use serde_json::{json, Value};
use tempfile::TempDir;

use scriptgate::auth::jwt::{self, Claims};
use scriptgate::config::{Config, SandboxConfig};
use scriptgate::models::{Endpoint, HttpMethod, NewEndpoint, VariableBundle};
use scriptgate::store::MemoryStore;

pub const JWT_SECRET: &str = "test-jwt-secret-that-is-long-enough";

/// A running test server backed by an in-memory store.
pub struct TestApp {
    pub addr: SocketAddr,
    pub store: Arc<MemoryStore>,
    pub client: Client,
    pub token: String,
    pub fs_root: TempDir,
}

#[allow(dead_code)]
impl TestApp {
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub fn create_endpoint(&self, method: HttpMethod, path: &str, code: &str) -> Endpoint {
        self.store
            .insert_endpoint(NewEndpoint::new(method, path, code))
            .expect("create endpoint failed")
    }

    pub fn create_endpoint_with_bundle(
        &self,
        method: HttpMethod,
        path: &str,
        code: &str,
        bundle: &VariableBundle,
        inline: bool,
    ) -> Endpoint {
        self.store
            .insert_endpoint(NewEndpoint::new(method, path, code).with_variables(bundle.id, inline))
            .expect("create endpoint failed")
    }

    pub fn create_bundle(&self, title: &str, lines: &[&str]) -> VariableBundle {
        self.store
            .insert_bundle(title, lines.iter().map(|l| l.to_string()).collect())
    }

    /// Authenticated GET, returns (status, raw body).
    pub async fn get_auth(&self, path: &str) -> (StatusCode, String) {
        let resp = self
            .client
            .get(self.url(path))
            .bearer_auth(&self.token)
            .send()
            .await
            .expect("get request failed");
        let status = resp.status();
        (status, resp.text().await.unwrap_or_default())
    }

    /// Authenticated GET, body parsed as JSON.
    pub async fn get_json(&self, path: &str) -> (Value, StatusCode) {
        let (status, text) = self.get_auth(path).await;
        (serde_json::from_str(&text).unwrap_or(json!(null)), status)
    }

    /// Authenticated POST with a JSON body.
    pub async fn post_auth(&self, path: &str, body: &Value) -> (Value, StatusCode) {
        let resp = self
            .client
            .post(self.url(path))
            .bearer_auth(&self.token)
            .json(body)
            .send()
            .await
            .expect("post request failed");
        let status = resp.status();
        let body: Value = resp.json().await.unwrap_or(json!(null));
        (body, status)
    }

    pub async fn delete_auth(&self, path: &str) -> StatusCode {
        self.client
            .delete(self.url(path))
            .bearer_auth(&self.token)
            .send()
            .await
            .expect("delete request failed")
            .status()
    }

    /// `POST /api/execute` with `{ code }`.
    pub async fn execute(&self, code: &str) -> (Value, StatusCode) {
        self.post_auth("/api/execute", &json!({ "code": code })).await
    }

    /// `POST /api/public/execute` with `{ code }`, no token.
    pub async fn public_execute(&self, code: &str) -> reqwest::Response {
        self.client
            .post(self.url("/api/public/execute"))
            .json(&json!({ "code": code }))
            .send()
            .await
            .expect("public execute failed")
    }
}

pub fn test_config(fs_root: &TempDir) -> Config {
    Config {
        database_url: None,
        jwt_secret: JWT_SECRET.to_string(),
        host: "127.0.0.1".parse().unwrap(),
        port: 0, // unused, we bind to random port
        max_body_size: 1_048_576,
        trusted_proxies: vec![],
        log_level: "warn".to_string(),
        sandbox: SandboxConfig {
            exec_timeout: Duration::from_secs(3),
            settle_window: Duration::from_millis(500),
            max_heap_mb: 64,
            fs_root: fs_root.path().to_path_buf(),
            fetch_origins: "*".to_string(),
        },
        public_rate_limit: 30,
        public_rate_window_secs: 60,
    }
}

/// Spawn a test app with default test settings.
pub async fn spawn_app() -> TestApp {
    spawn_app_with(|_| {}).await
}

/// Spawn a test app, letting the caller adjust the config first.
pub async fn spawn_app_with(adjust: impl FnOnce(&mut Config)) -> TestApp {
    let fs_root = tempfile::tempdir().expect("Failed to create sandbox root");
    let mut config = test_config(&fs_root);
    adjust(&mut config);

    let store = Arc::new(MemoryStore::new());
    let app = scriptgate::build_app(config, store.clone()).expect("Failed to build app");

    // Bind to random port
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind to random port");
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .expect("Server failed");
    });

    let client = Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .unwrap();

    let token = jwt::encode_token(&Claims::new("tester", chrono::Duration::minutes(10)), JWT_SECRET)
        .expect("Failed to mint token");

    TestApp {
        addr,
        store,
        client,
        token,
        fs_root,
    }
}
