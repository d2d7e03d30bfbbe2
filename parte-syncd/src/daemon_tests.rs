use super::*;
use serde_json::json;
use tempfile::tempdir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn config_for(db_path: PathBuf, remote_url: Option<String>) -> DaemonConfig {
    DaemonConfig {
        remote_url,
        api_key: Some("anon-key".to_string()),
        access_token: None,
        db_path,
        pull_interval: Duration::from_secs(DEFAULT_PULL_SECS),
        push_interval: Duration::from_secs(DEFAULT_PUSH_SECS),
        max_retries: 3,
        backoff_base: Duration::from_millis(DEFAULT_BACKOFF_BASE_MS),
        backoff_max: Duration::from_millis(DEFAULT_BACKOFF_MAX_MS),
        seed_on_start: true,
    }
}

async fn engine_for(server: &MockServer) -> SyncEngine {
    let config = config_for(PathBuf::from("unused.db"), Some(server.uri()));
    let store = LocalStore::new("sqlite::memory:").await.unwrap();
    SyncEngine::new(config.remote().unwrap(), store, config.engine_config())
}

#[test]
fn expands_tilde_to_home_db_path() {
    let home = PathBuf::from("/tmp/home-user");
    assert_eq!(
        expand_with_home("~/parte/offline.db", &home),
        PathBuf::from("/tmp/home-user/parte/offline.db")
    );
    assert_eq!(expand_with_home("~", &home), home);
    assert_eq!(
        expand_with_home("/var/lib/parte.db", &home),
        PathBuf::from("/var/lib/parte.db")
    );
}

#[test]
fn intervals_fall_back_to_default() {
    assert_eq!(read_u64_env("NO_SUCH_ENV_FOR_TEST", 42), 42);
    assert_eq!(parse_u64(Some(" 15 "), 30), 15);
    assert_eq!(parse_u64(Some("0"), 30), 30);
    assert_eq!(parse_u64(Some("soon"), 30), 30);
}

#[test]
fn seeding_is_enabled_by_default() {
    assert!(read_bool_env("NO_SUCH_BOOL_ENV_FOR_TEST", true));
    assert!(parse_bool(Some("Yes"), false));
    assert!(!parse_bool(Some("off"), true));
}

#[test]
fn engine_config_uses_configured_backoff() {
    let mut config = config_for(PathBuf::from("x.db"), None);
    config.max_retries = 5;
    config.backoff_base = Duration::from_millis(200);
    config.backoff_max = Duration::from_secs(5);

    let engine_config = config.engine_config();

    assert_eq!(engine_config.max_retries, 5);
    assert_eq!(
        engine_config.backoff,
        Backoff::new(Duration::from_millis(200), Duration::from_secs(5), true)
    );
}

#[test]
fn remote_requires_url_and_key() {
    let config = config_for(PathBuf::from("x.db"), None);
    let err = config.remote().err().unwrap();
    assert!(err.to_string().contains("PARTE_REMOTE_URL"));

    let mut config = config_for(PathBuf::from("x.db"), Some("http://127.0.0.1:9".into()));
    config.api_key = None;
    let err = config.remote().err().unwrap();
    assert!(err.to_string().contains("PARTE_API_KEY"));
}

#[tokio::test]
async fn open_store_creates_missing_directories() {
    let dir = tempdir().unwrap();
    let db_path = dir.path().join("nested/sua-parte/offline.db");
    let config = config_for(db_path.clone(), None);

    let store = config.open_store().await.unwrap();
    assert!(store.list_ops().await.unwrap().is_empty());
    store.close().await;

    assert!(db_path.exists());
}

#[tokio::test]
async fn seeds_only_an_empty_store() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/rest/v1/estudantes"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            { "id": "e1", "nome": "Ana", "updated_at": "2024-01-01T00:00:00Z" }
        ])))
        .expect(1)
        .mount(&server)
        .await;
    for table in ["programas", "designacoes"] {
        Mock::given(method("GET"))
            .and(path(format!("/rest/v1/{table}")))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
            .expect(1)
            .mount(&server)
            .await;
    }
    let engine = engine_for(&server).await;

    let reports = seed_if_empty(&engine).await.unwrap().unwrap();
    assert_eq!(reports.len(), EntityType::ALL.len());
    assert_eq!(reports[0].applied, 1);

    assert!(seed_if_empty(&engine).await.unwrap().is_none());
}

#[tokio::test]
async fn loops_keep_going_until_cancelled() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;
    let engine = engine_for(&server).await;

    assert!(pull_once(&engine).await);
    assert!(push_once(&engine).await);

    engine.cancellation_token().cancel();
    assert!(!pull_once(&engine).await);
    assert!(!push_once(&engine).await);
}
