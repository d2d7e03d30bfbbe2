    use async_trait::async_trait;
    use std::collections::{HashMap, VecDeque};
    use std::sync::Mutex as StdMutex;

    /// In-memory remote that records every call and can be told to fail the
    /// next call carrying a given label (`insert:<nome>`, `update:<id>`, ...).
    #[derive(Default)]
    struct FakeRemote {
        state: StdMutex<FakeState>,
    }

    #[derive(Default)]
    struct FakeState {
        rows: HashMap<(EntityType, String), Record>,
        calls: Vec<String>,
        failures: HashMap<String, VecDeque<RemoteError>>,
        next_id: u32,
    }

    impl FakeRemote {
        fn fail_next(&self, label: &str, err: RemoteError) {
            self.state
                .lock()
                .unwrap()
                .failures
                .entry(label.to_string())
                .or_default()
                .push_back(err);
        }

        fn seed(&self, record: Record) {
            self.state
                .lock()
                .unwrap()
                .rows
                .insert((record.entity_type, record.id.clone()), record);
        }

        fn calls(&self) -> Vec<String> {
            self.state.lock().unwrap().calls.clone()
        }

        fn row(&self, entity: EntityType, id: &str) -> Option<Record> {
            self.state
                .lock()
                .unwrap()
                .rows
                .get(&(entity, id.to_string()))
                .cloned()
        }

        fn begin(&self, label: String) -> Result<std::sync::MutexGuard<'_, FakeState>, RemoteError> {
            let mut state = self.state.lock().unwrap();
            state.calls.push(label.clone());
            if let Some(err) = state
                .failures
                .get_mut(&label)
                .and_then(|queue| queue.pop_front())
            {
                return Err(err);
            }
            Ok(state)
        }
    }

    #[async_trait]
    impl RemoteAdapter for FakeRemote {
        async fn list(
            &self,
            entity: EntityType,
            since: OffsetDateTime,
        ) -> Result<Vec<Record>, RemoteError> {
            let state = self.begin(format!("list:{entity}"))?;
            let mut rows: Vec<_> = state
                .rows
                .values()
                .filter(|row| row.entity_type == entity && row.updated_at > since)
                .cloned()
                .collect();
            rows.sort_by(|a, b| (a.updated_at, &a.id).cmp(&(b.updated_at, &b.id)));
            Ok(rows)
        }

        async fn fetch(&self, entity: EntityType, id: &str) -> Result<Option<Record>, RemoteError> {
            let state = self.begin(format!("fetch:{id}"))?;
            Ok(state.rows.get(&(entity, id.to_string())).cloned())
        }

        async fn insert(
            &self,
            entity: EntityType,
            payload: &Map<String, Value>,
        ) -> Result<Record, RemoteError> {
            let label = payload
                .get("nome")
                .and_then(Value::as_str)
                .unwrap_or("?")
                .to_string();
            let mut state = self.begin(format!("insert:{label}"))?;
            state.next_id += 1;
            let record = Record {
                entity_type: entity,
                id: format!("srv-{}", state.next_id),
                payload: payload.clone(),
                updated_at: now_utc(),
                deleted_at: None,
                revision: Some(1),
            };
            state
                .rows
                .insert((entity, record.id.clone()), record.clone());
            Ok(record)
        }

        async fn update(
            &self,
            entity: EntityType,
            id: &str,
            payload: &Map<String, Value>,
            expected_revision: Option<i64>,
        ) -> Result<Record, RemoteError> {
            let mut state = self.begin(format!("update:{id}"))?;
            let Some(row) = state.rows.get_mut(&(entity, id.to_string())) else {
                return Err(RemoteError::Permanent(format!("{id} not found")));
            };
            if expected_revision.is_some() && row.revision != expected_revision {
                return Err(RemoteError::Conflict {
                    entity_id: id.to_string(),
                    local_revision: expected_revision,
                    remote_revision: row.revision,
                });
            }
            row.payload = payload.clone();
            row.revision = row.revision.map(|revision| revision + 1);
            row.updated_at = now_utc();
            Ok(row.clone())
        }

        async fn soft_delete(
            &self,
            entity: EntityType,
            id: &str,
            at: OffsetDateTime,
        ) -> Result<Record, RemoteError> {
            let mut state = self.begin(format!("delete:{id}"))?;
            let Some(row) = state.rows.get_mut(&(entity, id.to_string())) else {
                return Err(RemoteError::Permanent(format!("{id} not found")));
            };
            row.deleted_at = Some(at);
            row.revision = row.revision.map(|revision| revision + 1);
            row.updated_at = now_utc();
            Ok(row.clone())
        }
    }

    async fn fake_engine(remote: FakeRemote) -> SyncEngine<FakeRemote> {
        let store = LocalStore::new("sqlite::memory:").await.unwrap();
        SyncEngine::new(remote, store, test_config())
    }

    #[tokio::test]
    async fn edits_to_one_record_reach_remote_in_order() {
        let engine = fake_engine(FakeRemote::default()).await;
        let temp_id = engine
            .create_local(EntityType::Estudantes, fields(json!({ "nome": "Ana" })))
            .await
            .unwrap();
        engine
            .update_local(
                EntityType::Estudantes,
                &temp_id,
                fields(json!({ "nome": "Ana B" })),
            )
            .await
            .unwrap();
        engine
            .update_local(
                EntityType::Estudantes,
                &temp_id,
                fields(json!({ "nome": "Ana C" })),
            )
            .await
            .unwrap();

        let result = engine.sync().await.unwrap();

        assert_eq!(result.synced_count, 3);
        assert_eq!(result.conflict_count, 0);
        assert!(result.errors.is_empty());
        assert_eq!(
            engine.remote.calls(),
            vec![
                "insert:Ana",
                "fetch:srv-1",
                "update:srv-1",
                "fetch:srv-1",
                "update:srv-1"
            ]
        );
        let remote = engine.remote.row(EntityType::Estudantes, "srv-1").unwrap();
        assert_eq!(remote.payload["nome"], "Ana C");
        assert_eq!(remote.revision, Some(3));
        let local = engine
            .store()
            .get(EntityType::Estudantes, "srv-1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(local, remote);
        assert!(
            engine
                .store()
                .get(EntityType::Estudantes, &temp_id)
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn transient_failure_holds_later_operations_on_same_record() {
        let remote = FakeRemote::default();
        remote.fail_next("insert:Ana", RemoteError::transient("connection reset"));
        let engine = fake_engine(remote).await;
        let ana = engine
            .create_local(EntityType::Estudantes, fields(json!({ "nome": "Ana" })))
            .await
            .unwrap();
        engine
            .update_local(
                EntityType::Estudantes,
                &ana,
                fields(json!({ "nome": "Ana B" })),
            )
            .await
            .unwrap();
        engine
            .create_local(EntityType::Estudantes, fields(json!({ "nome": "Bia" })))
            .await
            .unwrap();

        let first = engine.sync().await.unwrap();

        assert_eq!(first.synced_count, 1);
        assert_eq!(first.errors.len(), 1);
        assert_eq!(first.errors[0].status, OperationStatus::Pending);
        assert_eq!(engine.remote.calls(), vec!["insert:Ana", "insert:Bia"]);
        assert_eq!(engine.outbox_status().await.unwrap().pending_count, 2);

        let second = engine.sync().await.unwrap();

        assert_eq!(second.synced_count, 2);
        assert_eq!(second.id_remaps.len(), 1);
        assert_eq!(second.id_remaps[0].temporary_id, ana);
        assert_eq!(
            engine.remote.calls()[2..],
            ["insert:Ana", "fetch:srv-2", "update:srv-2"]
        );
        assert_eq!(
            engine
                .remote
                .row(EntityType::Estudantes, "srv-2")
                .unwrap()
                .payload["nome"],
            "Ana B"
        );
    }

    #[tokio::test]
    async fn conflicted_record_is_restored_by_next_pull() {
        let remote = FakeRemote::default();
        remote.seed(Record {
            entity_type: EntityType::Programas,
            id: "p1".to_string(),
            payload: fields(json!({ "semana": "remota" })),
            updated_at: ts("2024-08-02T00:00:00Z"),
            deleted_at: None,
            revision: Some(6),
        });
        let engine = fake_engine(remote).await;
        engine
            .store()
            .put_many(
                EntityType::Programas,
                &[Record {
                    entity_type: EntityType::Programas,
                    id: "p1".to_string(),
                    payload: fields(json!({ "semana": "antiga" })),
                    updated_at: ts("2024-08-01T00:00:00Z"),
                    deleted_at: None,
                    revision: Some(5),
                }],
            )
            .await
            .unwrap();
        engine
            .update_local(
                EntityType::Programas,
                "p1",
                fields(json!({ "semana": "local" })),
            )
            .await
            .unwrap();

        let result = engine.sync().await.unwrap();
        assert_eq!(result.conflict_count, 1);
        assert_eq!(
            engine.remote.row(EntityType::Programas, "p1").unwrap().payload["semana"],
            "remota"
        );

        let report = engine.pull(EntityType::Programas).await.unwrap();
        assert_eq!(report.applied, 1);
        let local = engine
            .store()
            .get(EntityType::Programas, "p1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(local.payload["semana"], "remota");
        assert_eq!(local.revision, Some(6));
    }

    #[tokio::test]
    async fn deleting_an_unsynced_record_follows_its_create() {
        let engine = fake_engine(FakeRemote::default()).await;
        let temp_id = engine
            .create_local(EntityType::Designacoes, fields(json!({ "nome": "parte 3" })))
            .await
            .unwrap();
        engine
            .delete_local(EntityType::Designacoes, &temp_id)
            .await
            .unwrap();

        let result = engine.sync().await.unwrap();

        assert_eq!(result.synced_count, 2);
        assert_eq!(
            engine.remote.calls(),
            vec!["insert:parte 3", "delete:srv-1"]
        );
        assert!(
            engine
                .remote
                .row(EntityType::Designacoes, "srv-1")
                .unwrap()
                .is_tombstone()
        );
        let local = engine
            .store()
            .get(EntityType::Designacoes, "srv-1")
            .await
            .unwrap()
            .unwrap();
        assert!(local.is_tombstone());
    }

    #[tokio::test]
    async fn requeued_failure_is_pushed_again() {
        let remote = FakeRemote::default();
        remote.fail_next(
            "insert:Ana",
            RemoteError::Permanent("violates check".to_string()),
        );
        let engine = fake_engine(remote).await;
        engine
            .create_local(EntityType::Estudantes, fields(json!({ "nome": "Ana" })))
            .await
            .unwrap();

        let first = engine.sync().await.unwrap();
        assert_eq!(first.failed_count, 1);
        let queue_id = first.errors[0].operation_id;

        assert!(engine.requeue_failed(queue_id).await.unwrap());
        let second = engine.sync().await.unwrap();

        assert_eq!(second.synced_count, 1);
        assert_eq!(engine.outbox_status().await.unwrap().failed_count, 0);
    }

    #[tokio::test]
    async fn cancelled_engine_leaves_operations_pending() {
        let engine = fake_engine(FakeRemote::default()).await;
        engine
            .create_local(EntityType::Programas, fields(json!({ "nome": "x" })))
            .await
            .unwrap();
        engine.cancellation_token().cancel();

        assert!(matches!(engine.sync().await, Err(EngineError::Cancelled)));
        assert!(matches!(
            engine.download_incremental().await,
            Err(EngineError::Cancelled)
        ));
        assert!(engine.remote.calls().is_empty());
        assert_eq!(engine.outbox_status().await.unwrap().pending_count, 1);
    }

    #[tokio::test]
    async fn overlapping_cycles_are_rejected() {
        let engine = fake_engine(FakeRemote::default()).await;
        let _running = engine.cycle.try_lock().unwrap();

        assert!(matches!(
            engine.sync().await,
            Err(EngineError::SyncInProgress)
        ));
        assert!(matches!(
            engine.pull(EntityType::Programas).await,
            Err(EngineError::SyncInProgress)
        ));
        assert!(matches!(
            engine.download_full(&EntityType::ALL).await,
            Err(EngineError::SyncInProgress)
        ));
        // Local mutations never wait for the cycle.
        engine
            .create_local(EntityType::Programas, fields(json!({ "semana": "1" })))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn mutations_on_unknown_records_fail() {
        let engine = fake_engine(FakeRemote::default()).await;

        let update = engine
            .update_local(EntityType::Estudantes, "nope", Map::new())
            .await
            .unwrap_err();
        let delete = engine
            .delete_local(EntityType::Estudantes, "nope")
            .await
            .unwrap_err();

        assert!(matches!(update, EngineError::MissingRecord { .. }));
        assert!(matches!(delete, EngineError::MissingRecord { .. }));
        assert!(engine.list_outbox().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn local_create_is_visible_before_sync() {
        let engine = fake_engine(FakeRemote::default()).await;

        let temp_id = engine
            .create_local(
                EntityType::Estudantes,
                fields(json!({ "id": "forged", "revision": 9, "nome": "Ana" })),
            )
            .await
            .unwrap();

        let local = engine.list_local(EntityType::Estudantes).await.unwrap();
        assert_eq!(local.len(), 1);
        assert_eq!(local[0].id, temp_id);
        assert_eq!(local[0].payload, fields(json!({ "nome": "Ana" })));
        assert_eq!(local[0].revision, None);
        let ops = engine.list_outbox().await.unwrap();
        assert_eq!(ops[0].kind, OperationKind::Create);
        assert_eq!(ops[0].status, OperationStatus::Pending);
    }

    fn programa(semana: &str, updated_at: &str, revision: Option<i64>) -> Record {
        Record {
            entity_type: EntityType::Programas,
            id: "p1".to_string(),
            payload: fields(json!({ "semana": semana })),
            updated_at: ts(updated_at),
            deleted_at: None,
            revision,
        }
    }

    #[tokio::test]
    async fn conflict_after_skipped_pull_restores_remote_copy() {
        let remote = FakeRemote::default();
        remote.seed(programa("remota", "2024-08-02T00:00:00Z", Some(6)));
        let engine = fake_engine(remote).await;
        engine
            .store()
            .put_many(
                EntityType::Programas,
                &[programa("antiga", "2024-08-01T00:00:00Z", Some(5))],
            )
            .await
            .unwrap();
        engine
            .update_local(
                EntityType::Programas,
                "p1",
                fields(json!({ "semana": "local" })),
            )
            .await
            .unwrap();

        let pulled = engine.pull(EntityType::Programas).await.unwrap();
        assert_eq!((pulled.applied, pulled.skipped), (0, 1));
        let result = engine.sync().await.unwrap();
        assert_eq!(result.conflict_count, 1);

        let local = engine
            .store()
            .get(EntityType::Programas, "p1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(local, engine.remote.row(EntityType::Programas, "p1").unwrap());
        assert_eq!(engine.pull(EntityType::Programas).await.unwrap().fetched, 0);

        engine
            .update_local(
                EntityType::Programas,
                "p1",
                fields(json!({ "semana": "de novo" })),
            )
            .await
            .unwrap();
        let retried = engine.sync().await.unwrap();

        assert_eq!(retried.synced_count, 1);
        assert_eq!(retried.conflict_count, 0);
        let remote = engine.remote.row(EntityType::Programas, "p1").unwrap();
        assert_eq!(remote.payload["semana"], "de novo");
        assert_eq!(remote.revision, Some(7));
    }

    #[tokio::test]
    async fn permanent_failure_after_skipped_pull_restores_remote_copy() {
        let remote = FakeRemote::default();
        remote.seed(programa("remota", "2024-08-02T00:00:00Z", None));
        remote.fail_next(
            "update:p1",
            RemoteError::Permanent("violates check".to_string()),
        );
        let engine = fake_engine(remote).await;
        engine
            .store()
            .put_many(
                EntityType::Programas,
                &[programa("antiga", "2024-08-01T00:00:00Z", None)],
            )
            .await
            .unwrap();
        engine
            .update_local(
                EntityType::Programas,
                "p1",
                fields(json!({ "semana": "local" })),
            )
            .await
            .unwrap();

        assert_eq!(engine.pull(EntityType::Programas).await.unwrap().skipped, 1);
        let result = engine.sync().await.unwrap();

        assert_eq!(result.failed_count, 1);
        assert_eq!(
            engine.remote.calls(),
            vec!["list:programas", "update:p1", "fetch:p1"]
        );
        let local = engine
            .store()
            .get(EntityType::Programas, "p1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(local.payload["semana"], "remota");
        assert_eq!(local.updated_at, ts("2024-08-02T00:00:00Z"));
        // The refused payload stays inspectable.
        let ops = engine.list_outbox().await.unwrap();
        assert_eq!(ops[0].status, OperationStatus::Failed);
        assert_eq!(ops[0].payload["semana"], "local");
    }

    #[tokio::test]
    async fn pending_edit_is_not_overwritten_by_refused_sibling() {
        let remote = FakeRemote::default();
        remote.seed(programa("remota", "2024-08-02T00:00:00Z", Some(6)));
        remote.fail_next(
            "delete:p1",
            RemoteError::transient("connection reset"),
        );
        let engine = fake_engine(remote).await;
        engine
            .store()
            .put_many(
                EntityType::Programas,
                &[programa("antiga", "2024-08-01T00:00:00Z", Some(6))],
            )
            .await
            .unwrap();
        engine
            .update_local(
                EntityType::Programas,
                "p1",
                fields(json!({ "semana": "local" })),
            )
            .await
            .unwrap();
        engine.remote.fail_next(
            "update:p1",
            RemoteError::Permanent("violates check".to_string()),
        );
        engine
            .delete_local(EntityType::Programas, "p1")
            .await
            .unwrap();

        let result = engine.sync().await.unwrap();

        assert_eq!(result.failed_count, 1);
        assert_eq!(engine.outbox_status().await.unwrap().pending_count, 1);
        let local = engine
            .store()
            .get(EntityType::Programas, "p1")
            .await
            .unwrap()
            .unwrap();
        assert!(local.is_tombstone());
    }

    #[tokio::test]
    async fn huge_retry_after_is_capped() {
        let remote = FakeRemote::default();
        remote.fail_next(
            "insert:Ana",
            RemoteError::Transient {
                message: "slow down".to_string(),
                retry_after: Some(u64::MAX / 2),
            },
        );
        let engine = fake_engine(remote).await;
        engine
            .create_local(EntityType::Estudantes, fields(json!({ "nome": "Ana" })))
            .await
            .unwrap();

        let before = now_utc();
        let result = engine.sync().await.unwrap();

        assert_eq!(result.errors[0].status, OperationStatus::Pending);
        let ops = engine.list_outbox().await.unwrap();
        let retry_at = ops[0].retry_at.unwrap();
        assert!(retry_at > before);
        assert!(retry_at <= now_utc() + crate::sync::backoff::MAX_RETRY_WAIT);
    }
