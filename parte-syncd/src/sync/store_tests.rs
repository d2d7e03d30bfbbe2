use super::*;
use serde_json::json;
use tempfile::tempdir;

async fn make_store() -> LocalStore {
    LocalStore::new("sqlite::memory:").await.unwrap()
}

fn record(entity: EntityType, id: &str, payload: Value, micros: i64) -> Record {
    Record {
        entity_type: entity,
        id: id.to_string(),
        payload: payload.as_object().cloned().unwrap(),
        updated_at: from_micros(micros).unwrap(),
        deleted_at: None,
        revision: Some(1),
    }
}

#[tokio::test]
async fn put_many_and_get_round_trip() {
    let store = make_store().await;
    let ana = record(EntityType::Estudantes, "e1", json!({ "nome": "Ana" }), 1_000);
    let bia = record(EntityType::Estudantes, "e2", json!({ "nome": "Bia" }), 2_000);

    store
        .put_many(EntityType::Estudantes, &[bia.clone(), ana.clone()])
        .await
        .unwrap();

    assert_eq!(
        store.get(EntityType::Estudantes, "e1").await.unwrap(),
        Some(ana.clone())
    );
    let all = store.get_all(EntityType::Estudantes).await.unwrap();
    assert_eq!(all, vec![ana, bia]);
    assert!(store.get_all(EntityType::Programas).await.unwrap().is_empty());
}

#[tokio::test]
async fn put_many_is_idempotent() {
    let store = make_store().await;
    let batch = vec![
        record(EntityType::Programas, "p1", json!({ "semana": "1" }), 10),
        record(EntityType::Programas, "p2", json!({ "semana": "2" }), 20),
    ];

    store.put_many(EntityType::Programas, &batch).await.unwrap();
    let first = store.get_all(EntityType::Programas).await.unwrap();
    store.put_many(EntityType::Programas, &batch).await.unwrap();
    let second = store.get_all(EntityType::Programas).await.unwrap();

    assert_eq!(first, second);
    assert_eq!(second.len(), 2);
}

#[tokio::test]
async fn put_many_overwrites_and_keeps_tombstones() {
    let store = make_store().await;
    let mut item = record(EntityType::Estudantes, "e1", json!({ "nome": "Ana" }), 10);
    store
        .put_many(EntityType::Estudantes, &[item.clone()])
        .await
        .unwrap();

    item.deleted_at = Some(from_micros(20).unwrap());
    item.updated_at = from_micros(20).unwrap();
    item.revision = Some(2);
    store
        .put_many(EntityType::Estudantes, &[item.clone()])
        .await
        .unwrap();

    let stored = store.get(EntityType::Estudantes, "e1").await.unwrap().unwrap();
    assert!(stored.is_tombstone());
    assert_eq!(stored.revision, Some(2));
    assert_eq!(store.get_all(EntityType::Estudantes).await.unwrap().len(), 1);
}

#[tokio::test]
async fn put_many_rolls_back_whole_batch_on_mismatch() {
    let store = make_store().await;
    let batch = vec![
        record(EntityType::Estudantes, "e1", json!({}), 10),
        record(EntityType::Programas, "p1", json!({}), 20),
    ];

    let err = store
        .put_many(EntityType::Estudantes, &batch)
        .await
        .unwrap_err();

    assert!(matches!(err, StoreError::EntityMismatch { .. }));
    assert!(store.get_all(EntityType::Estudantes).await.unwrap().is_empty());
}

#[tokio::test]
async fn list_by_field_and_programa_index_agree() {
    let store = make_store().await;
    let batch = vec![
        record(
            EntityType::Designacoes,
            "d1",
            json!({ "programa_id": "p1", "parte": 3 }),
            10,
        ),
        record(
            EntityType::Designacoes,
            "d2",
            json!({ "programa_id": "p2", "parte": 4 }),
            20,
        ),
        record(
            EntityType::Designacoes,
            "d3",
            json!({ "programa_id": "p1", "parte": 5 }),
            30,
        ),
    ];
    store
        .put_many(EntityType::Designacoes, &batch)
        .await
        .unwrap();

    let by_field = store
        .list_by_field(EntityType::Designacoes, "programa_id", "p1")
        .await
        .unwrap();
    let by_index = store.designacoes_for_programa("p1").await.unwrap();

    let ids: Vec<_> = by_field.iter().map(|r| r.id.as_str()).collect();
    assert_eq!(ids, vec!["d1", "d3"]);
    assert_eq!(by_field, by_index);
}

#[tokio::test]
async fn list_by_field_rejects_path_injection() {
    let store = make_store().await;
    let err = store
        .list_by_field(EntityType::Designacoes, "a') OR 1=1 --", "x")
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::InvalidField(_)));
}

#[tokio::test]
async fn open_creates_database_on_disk() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("nested").join("offline.db");

    {
        let store = LocalStore::open(&path).await.unwrap();
        store
            .put_many(
                EntityType::Programas,
                &[record(EntityType::Programas, "p1", json!({}), 5)],
            )
            .await
            .unwrap();
        store.close().await;
    }

    let reopened = LocalStore::open(&path).await.unwrap();
    assert!(path.exists());
    assert!(
        reopened
            .get(EntityType::Programas, "p1")
            .await
            .unwrap()
            .is_some()
    );
}

#[test]
fn temporary_ids_are_prefixed_and_unique() {
    let first = new_temporary_id();
    let second = new_temporary_id();
    assert!(is_temporary_id(&first));
    assert_ne!(first, second);
    assert!(!is_temporary_id("9b2f"));
}

#[test]
fn entity_types_round_trip_through_names() {
    for entity in EntityType::ALL {
        assert_eq!(EntityType::parse(entity.as_str()).unwrap(), entity);
    }
    assert!(matches!(
        EntityType::parse("publicadores"),
        Err(StoreError::InvalidEntityType(_))
    ));
}

#[test]
fn now_is_truncated_to_micros() {
    let now = now_utc();
    assert_eq!(from_micros(to_micros(now)).unwrap(), now);
}
