use super::*;
use serde_json::json;

async fn make_store() -> LocalStore {
    LocalStore::new("sqlite::memory:").await.unwrap()
}

fn new_op(entity: EntityType, kind: OperationKind, entity_id: &str) -> NewOperation {
    NewOperation {
        entity_type: entity,
        kind,
        entity_id: entity_id.to_string(),
        payload: json!({ "nome": entity_id }).as_object().cloned().unwrap(),
        revision: None,
    }
}

fn local_record(entity: EntityType, id: &str, payload: Value) -> Record {
    Record {
        entity_type: entity,
        id: id.to_string(),
        payload: payload.as_object().cloned().unwrap(),
        updated_at: now_utc(),
        deleted_at: None,
        revision: None,
    }
}

#[tokio::test]
async fn pending_ops_come_back_in_enqueue_order() {
    let store = make_store().await;
    let first = store
        .enqueue_op(&new_op(EntityType::Programas, OperationKind::Create, "p1"))
        .await
        .unwrap();
    let second = store
        .enqueue_op(&new_op(EntityType::Estudantes, OperationKind::Update, "e1"))
        .await
        .unwrap();
    let third = store
        .enqueue_op(&new_op(EntityType::Programas, OperationKind::Delete, "p1"))
        .await
        .unwrap();

    let pending = store.list_pending_ops().await.unwrap();
    let ids: Vec<_> = pending.iter().map(|op| op.id).collect();
    assert_eq!(ids, vec![first, second, third]);
    assert!(pending.iter().all(|op| op.status == OperationStatus::Pending));
    assert_eq!(pending[2].kind, OperationKind::Delete);
}

#[tokio::test]
async fn retryable_failures_exhaust_into_failed() {
    let store = make_store().await;
    let id = store
        .enqueue_op(&new_op(EntityType::Estudantes, OperationKind::Update, "e1"))
        .await
        .unwrap();

    for attempt in 1..=2u32 {
        let status = store
            .mark_op(id, MarkOutcome::Retryable { retry_at: None }, Some("timeout"))
            .await
            .unwrap();
        assert_eq!(status, OperationStatus::Pending);
        let op = store.get_op(id).await.unwrap().unwrap();
        assert_eq!(op.retry_count, attempt);
    }

    let status = store
        .mark_op(id, MarkOutcome::Retryable { retry_at: None }, Some("timeout"))
        .await
        .unwrap();
    assert_eq!(status, OperationStatus::Failed);

    let op = store.get_op(id).await.unwrap().unwrap();
    assert_eq!(op.retry_count, 3);
    assert_eq!(op.last_error.as_deref(), Some("timeout"));
    assert!(store.list_pending_ops().await.unwrap().is_empty());
}

#[tokio::test]
async fn configured_retry_budget_is_honoured() {
    let store = make_store().await.with_max_retries(1);
    let id = store
        .enqueue_op(&new_op(EntityType::Estudantes, OperationKind::Update, "e1"))
        .await
        .unwrap();

    let status = store
        .mark_op(id, MarkOutcome::Retryable { retry_at: None }, None)
        .await
        .unwrap();
    assert_eq!(status, OperationStatus::Failed);
}

#[tokio::test]
async fn retryable_failure_records_retry_at() {
    let store = make_store().await;
    let id = store
        .enqueue_op(&new_op(EntityType::Programas, OperationKind::Create, "p1"))
        .await
        .unwrap();
    let retry_at = now_utc() + time::Duration::seconds(30);

    store
        .mark_op(id, MarkOutcome::Retryable { retry_at: Some(retry_at) }, None)
        .await
        .unwrap();

    let op = store.get_op(id).await.unwrap().unwrap();
    assert_eq!(op.retry_at, Some(retry_at));
    assert!(!op.is_ready(now_utc()));
    assert!(op.is_ready(retry_at));
}

#[tokio::test]
async fn permanent_and_conflict_keep_retry_count() {
    let store = make_store().await;
    let failed = store
        .enqueue_op(&new_op(EntityType::Programas, OperationKind::Create, "p1"))
        .await
        .unwrap();
    let conflicted = store
        .enqueue_op(&new_op(EntityType::Programas, OperationKind::Update, "p2"))
        .await
        .unwrap();

    assert_eq!(
        store
            .mark_op(failed, MarkOutcome::Permanent, Some("invalid"))
            .await
            .unwrap(),
        OperationStatus::Failed
    );
    assert_eq!(
        store
            .mark_op(conflicted, MarkOutcome::Conflict, Some("stale"))
            .await
            .unwrap(),
        OperationStatus::Conflict
    );

    let ops = store.list_ops().await.unwrap();
    assert!(ops.iter().all(|op| op.retry_count == 0));
    let status = store.outbox_status().await.unwrap();
    assert_eq!(status.pending_count, 0);
    assert_eq!(status.failed_count, 1);
    assert_eq!(status.conflict_count, 1);
    assert!(status.last_activity_time.is_some());
}

#[tokio::test]
async fn marking_unknown_operation_fails() {
    let store = make_store().await;
    let err = store
        .mark_op(99, MarkOutcome::Synced, None)
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::MissingOperation(99)));
}

#[tokio::test]
async fn empty_outbox_status_has_no_activity() {
    let store = make_store().await;
    assert_eq!(store.outbox_status().await.unwrap(), OutboxStatus::default());
}

#[tokio::test]
async fn requeue_failed_resets_budget() {
    let store = make_store().await;
    let id = store
        .enqueue_op(&new_op(EntityType::Designacoes, OperationKind::Update, "d1"))
        .await
        .unwrap();
    store
        .mark_op(id, MarkOutcome::Permanent, Some("rejected"))
        .await
        .unwrap();

    assert!(store.requeue_failed(id).await.unwrap());
    assert!(!store.requeue_failed(id).await.unwrap());

    let op = store.get_op(id).await.unwrap().unwrap();
    assert_eq!(op.status, OperationStatus::Pending);
    assert_eq!(op.retry_count, 0);
}

#[tokio::test]
async fn local_mutation_writes_record_and_operation_together() {
    let store = make_store().await;
    let record = local_record(EntityType::Estudantes, "tmp-1", json!({ "nome": "Ana" }));
    let op = NewOperation {
        entity_type: EntityType::Estudantes,
        kind: OperationKind::Create,
        entity_id: "tmp-1".to_string(),
        payload: record.payload.clone(),
        revision: None,
    };

    let queue_id = store.apply_local_mutation(&record, &op).await.unwrap();

    let stored = store.get_op(queue_id).await.unwrap().unwrap();
    assert_eq!(stored.enqueued_at, record.updated_at);
    assert_eq!(
        store.get(EntityType::Estudantes, "tmp-1").await.unwrap(),
        Some(record)
    );
    assert_eq!(
        store.pending_entity_ids(EntityType::Estudantes).await.unwrap(),
        HashSet::from(["tmp-1".to_string()])
    );
}

#[tokio::test]
async fn settle_replaces_temporary_record_with_server_copy() {
    let store = make_store().await;
    let record = local_record(EntityType::Programas, "tmp-a", json!({ "semana": "1" }));
    let queue_id = store
        .apply_local_mutation(
            &record,
            &new_op(EntityType::Programas, OperationKind::Create, "tmp-a"),
        )
        .await
        .unwrap();
    let op = store.get_op(queue_id).await.unwrap().unwrap();
    let mut server = local_record(EntityType::Programas, "srv-a", json!({ "semana": "1" }));
    server.revision = Some(1);

    let rebased = store.settle_op(&op, &server).await.unwrap();

    assert_eq!(rebased, 0);
    assert!(store.get(EntityType::Programas, "tmp-a").await.unwrap().is_none());
    assert_eq!(
        store.get(EntityType::Programas, "srv-a").await.unwrap(),
        Some(server)
    );
    assert_eq!(
        store.get_op(queue_id).await.unwrap().unwrap().status,
        OperationStatus::Synced
    );
}

#[tokio::test]
async fn settle_rebases_later_operations_and_keeps_local_edits() {
    let store = make_store().await;
    let created = local_record(EntityType::Estudantes, "tmp-b", json!({ "nome": "Ana" }));
    let create_id = store
        .apply_local_mutation(
            &created,
            &new_op(EntityType::Estudantes, OperationKind::Create, "tmp-b"),
        )
        .await
        .unwrap();
    let edited = local_record(EntityType::Estudantes, "tmp-b", json!({ "nome": "Ana Maria" }));
    let update_id = store
        .apply_local_mutation(
            &edited,
            &new_op(EntityType::Estudantes, OperationKind::Update, "tmp-b"),
        )
        .await
        .unwrap();

    let create = store.get_op(create_id).await.unwrap().unwrap();
    let mut server = local_record(EntityType::Estudantes, "srv-b", json!({ "nome": "Ana" }));
    server.revision = Some(1);
    let rebased = store.settle_op(&create, &server).await.unwrap();

    assert_eq!(rebased, 1);
    let update = store.get_op(update_id).await.unwrap().unwrap();
    assert_eq!(update.entity_id, "srv-b");
    assert_eq!(update.revision, Some(1));
    let local = store
        .get(EntityType::Estudantes, "srv-b")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(local.payload["nome"], "Ana Maria");
    assert_eq!(local.revision, Some(1));
    assert_eq!(
        store.get_op(create_id).await.unwrap().unwrap().entity_id,
        "tmp-b"
    );
}

#[tokio::test]
async fn remap_only_touches_pending_operations() {
    let store = make_store().await;
    let synced = store
        .enqueue_op(&new_op(EntityType::Programas, OperationKind::Update, "tmp-c"))
        .await
        .unwrap();
    store.mark_op(synced, MarkOutcome::Synced, None).await.unwrap();
    let pending = store
        .enqueue_op(&new_op(EntityType::Programas, OperationKind::Update, "tmp-c"))
        .await
        .unwrap();

    let remapped = store
        .remap_entity_id(EntityType::Programas, "tmp-c", "srv-c")
        .await
        .unwrap();

    assert_eq!(remapped, 1);
    assert_eq!(
        store.get_op(synced).await.unwrap().unwrap().entity_id,
        "tmp-c"
    );
    assert_eq!(
        store.get_op(pending).await.unwrap().unwrap().entity_id,
        "srv-c"
    );
}

#[tokio::test]
async fn rejection_restores_remote_copy_once_no_edit_is_pending() {
    let store = make_store().await;
    let local = local_record(EntityType::Programas, "p1", json!({ "semana": "local" }));
    let first = store
        .apply_local_mutation(&local, &new_op(EntityType::Programas, OperationKind::Update, "p1"))
        .await
        .unwrap();
    let second = store
        .enqueue_op(&new_op(EntityType::Programas, OperationKind::Update, "p1"))
        .await
        .unwrap();
    let remote = Record {
        revision: Some(6),
        ..local_record(EntityType::Programas, "p1", json!({ "semana": "remota" }))
    };

    let first_op = store.get_op(first).await.unwrap().unwrap();
    let status = store
        .reject_op(&first_op, MarkOutcome::Conflict, Some("stale"), Some(&remote))
        .await
        .unwrap();
    assert_eq!(status, OperationStatus::Conflict);
    let kept = store.get(EntityType::Programas, "p1").await.unwrap().unwrap();
    assert_eq!(kept.payload["semana"], "local");

    let second_op = store.get_op(second).await.unwrap().unwrap();
    let status = store
        .reject_op(&second_op, MarkOutcome::Permanent, Some("invalid"), Some(&remote))
        .await
        .unwrap();
    assert_eq!(status, OperationStatus::Failed);
    assert_eq!(
        store.get(EntityType::Programas, "p1").await.unwrap().unwrap(),
        remote
    );
}

#[tokio::test]
async fn retryable_rejection_keeps_local_copy() {
    let store = make_store().await;
    let local = local_record(EntityType::Estudantes, "e1", json!({ "nome": "local" }));
    let queue_id = store
        .apply_local_mutation(&local, &new_op(EntityType::Estudantes, OperationKind::Update, "e1"))
        .await
        .unwrap();
    let op = store.get_op(queue_id).await.unwrap().unwrap();
    let remote = local_record(EntityType::Estudantes, "e1", json!({ "nome": "remota" }));

    let status = store
        .reject_op(
            &op,
            MarkOutcome::Retryable { retry_at: None },
            Some("timeout"),
            Some(&remote),
        )
        .await
        .unwrap();
    assert_eq!(status, OperationStatus::Pending);
    assert_eq!(store.get(EntityType::Estudantes, "e1").await.unwrap().unwrap(), local);

    let other = local_record(EntityType::Estudantes, "e2", json!({ "nome": "outra" }));
    let err = store
        .reject_op(&op, MarkOutcome::Permanent, Some("invalid"), Some(&other))
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::EntityMismatch { .. }));
    // The failed mark rolled back with the transaction.
    let op = store.get_op(queue_id).await.unwrap().unwrap();
    assert_eq!(op.status, OperationStatus::Pending);
    assert_eq!(op.retry_count, 1);
}
