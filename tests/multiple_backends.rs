//! Secret store selection with multiple backends enabled.

mod common;

use axum::http::StatusCode;
use common::{project_header, TestApp, PROJECT_A, PROJECT_B};
use keystash::config::{NamedStoreConfig, SecretString, StoreSectionConfig};
use keystash::AppConfig;
use serde_json::{json, Value};
use sqlx::Row;

fn two_store_config() -> AppConfig {
    let mut config = AppConfig::default();
    config.secretstore.enable_multiple_secret_stores = true;
    config.secretstore.stores_lookup_suffix = vec!["software".into(), "hsm".into()];
    config.secret_stores = vec![
        NamedStoreConfig {
            name: "software".into(),
            section: StoreSectionConfig {
                secret_store_plugin: "store_crypto".into(),
                crypto_plugin: Some("simple_crypto".into()),
                global_default: true,
            },
        },
        NamedStoreConfig {
            name: "hsm".into(),
            section: StoreSectionConfig {
                secret_store_plugin: "store_crypto".into(),
                crypto_plugin: Some("p11_crypto".into()),
                global_default: false,
            },
        },
    ];
    config.p11_crypto_plugin.login = Some(SecretString::new("12345678"));
    config.p11_crypto_plugin.mkek_label = Some("keystash_mkek".into());
    config.p11_crypto_plugin.hmac_label = Some("keystash_hmac".into());
    config.p11_crypto_plugin.generate_master_keys = true;
    config
}

async fn kek_plugins(app: &TestApp) -> Vec<String> {
    sqlx::query("SELECT plugin_name FROM kek_data ORDER BY plugin_name")
        .fetch_all(&app.db.pool)
        .await
        .unwrap()
        .iter()
        .map(|row| row.get::<String, _>("plugin_name"))
        .collect()
}

#[tokio::test]
async fn configured_stores_are_listed() {
    let app = TestApp::with_config(two_store_config()).await;
    let (name, value) = project_header(PROJECT_A);

    let listed = app.server.get("/v1/secret-stores").add_header(name.clone(), value.clone()).await;
    assert_eq!(listed.status_code(), StatusCode::OK);
    let body: Value = listed.json();
    assert_eq!(body["total"], 2);

    let default = app
        .server
        .get("/v1/secret-stores/global-default")
        .add_header(name.clone(), value.clone())
        .await;
    let body: Value = default.json();
    assert_eq!(body["name"], "software");
    assert_eq!(body["crypto_plugin"], "simple_crypto");

    let preferred =
        app.server.get("/v1/secret-stores/preferred").add_header(name, value).await;
    assert_eq!(preferred.status_code(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn preferred_store_routes_new_secrets() {
    let app = TestApp::with_config(two_store_config()).await;
    let (name, value) = project_header(PROJECT_A);

    let listed: Value =
        app.server.get("/v1/secret-stores").add_header(name.clone(), value.clone()).await.json();
    let hsm_ref = listed["secret_stores"]
        .as_array()
        .unwrap()
        .iter()
        .find(|s| s["name"] == "hsm")
        .and_then(|s| s["secret_store_ref"].as_str())
        .unwrap()
        .to_string();

    let set = app
        .server
        .post(&format!("{}/preferred", hsm_ref))
        .add_header(name.clone(), value.clone())
        .await;
    assert_eq!(set.status_code(), StatusCode::NO_CONTENT);

    let preferred: Value = app
        .server
        .get("/v1/secret-stores/preferred")
        .add_header(name.clone(), value.clone())
        .await
        .json();
    assert_eq!(preferred["name"], "hsm");

    let created = app
        .server
        .post("/v1/secrets")
        .add_header(name.clone(), value.clone())
        .json(&json!({ "payload": "in the hsm", "payload_content_type": "text/plain" }))
        .await;
    assert_eq!(created.status_code(), StatusCode::CREATED);
    assert_eq!(kek_plugins(&app).await, vec!["p11_crypto".to_string()]);

    let secret_ref = created.json::<Value>()["secret_ref"].as_str().unwrap().to_string();
    let payload = app
        .server
        .get(&format!("{}/payload", secret_ref))
        .add_header(name.clone(), value.clone())
        .await;
    assert_eq!(payload.text(), "in the hsm");

    // project B still falls back to the global default
    let other = project_header(PROJECT_B);
    let created = app
        .server
        .post("/v1/secrets")
        .add_header(other.0, other.1)
        .json(&json!({ "payload": "in software", "payload_content_type": "text/plain" }))
        .await;
    assert_eq!(created.status_code(), StatusCode::CREATED);
    assert_eq!(
        kek_plugins(&app).await,
        vec!["p11_crypto".to_string(), "simple_crypto".to_string()]
    );

    let unset = app
        .server
        .delete(&format!("{}/preferred", hsm_ref))
        .add_header(name.clone(), value.clone())
        .await;
    assert_eq!(unset.status_code(), StatusCode::NO_CONTENT);

    let again = app
        .server
        .delete(&format!("{}/preferred", hsm_ref))
        .add_header(name, value)
        .await;
    assert_eq!(again.status_code(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn unknown_store_is_not_found() {
    let app = TestApp::with_config(two_store_config()).await;
    let (name, value) = project_header(PROJECT_A);
    let response = app
        .server
        .post("/v1/secret-stores/no-such-store/preferred")
        .add_header(name, value)
        .await;
    assert_eq!(response.status_code(), StatusCode::NOT_FOUND);
}
