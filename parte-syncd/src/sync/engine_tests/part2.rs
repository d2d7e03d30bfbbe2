    async fn seed(engine: &SyncEngine, record: Record) {
        engine
            .store()
            .put_many(record.entity_type, &[record])
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn two_offline_creates_sync_to_server_ids() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/rest/v1/estudantes"))
            .and(body_json(json!({ "nome": "Ana" })))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!([
                { "id": "srv-1", "nome": "Ana", "updated_at": "2024-05-01T00:00:00Z", "revision": 1 }
            ])))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/rest/v1/estudantes"))
            .and(body_json(json!({ "nome": "Bia" })))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!([
                { "id": "srv-2", "nome": "Bia", "updated_at": "2024-05-01T00:00:01Z", "revision": 1 }
            ])))
            .expect(1)
            .mount(&server)
            .await;
        let engine = make_engine(&server).await;

        let ana = engine
            .create_local(EntityType::Estudantes, fields(json!({ "nome": "Ana" })))
            .await
            .unwrap();
        let bia = engine
            .create_local(EntityType::Estudantes, fields(json!({ "nome": "Bia" })))
            .await
            .unwrap();
        assert!(is_temporary_id(&ana));
        assert_eq!(engine.outbox_status().await.unwrap().pending_count, 2);

        let result = engine.sync().await.unwrap();

        assert_eq!(result.synced_count, 2);
        assert!(result.errors.is_empty());
        assert_eq!(
            result.id_remaps,
            vec![
                IdRemap {
                    entity_type: EntityType::Estudantes,
                    temporary_id: ana,
                    server_id: "srv-1".to_string(),
                },
                IdRemap {
                    entity_type: EntityType::Estudantes,
                    temporary_id: bia,
                    server_id: "srv-2".to_string(),
                },
            ]
        );
        let status = engine.outbox_status().await.unwrap();
        assert_eq!(status.pending_count, 0);
        assert_eq!(status.failed_count, 0);
        let local = engine.list_local(EntityType::Estudantes).await.unwrap();
        let ids: Vec<_> = local.iter().map(|record| record.id.as_str()).collect();
        assert_eq!(ids, vec!["srv-1", "srv-2"]);
        assert!(local.iter().all(|record| !record.is_temporary()));
    }

    #[tokio::test]
    async fn stale_revision_is_flagged_as_conflict() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/rest/v1/programas"))
            .and(query_param("id", "eq.p1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                { "id": "p1", "semana": "9", "updated_at": "2024-06-02T00:00:00Z", "revision": 6 }
            ])))
            .mount(&server)
            .await;
        Mock::given(method("PATCH"))
            .and(path("/rest/v1/programas"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
            .expect(0)
            .mount(&server)
            .await;
        let engine = make_engine(&server).await;
        seed(
            &engine,
            Record {
                entity_type: EntityType::Programas,
                id: "p1".to_string(),
                payload: fields(json!({ "semana": "1" })),
                updated_at: ts("2024-06-01T00:00:00Z"),
                deleted_at: None,
                revision: Some(5),
            },
        )
        .await;
        let queue_id = engine
            .update_local(EntityType::Programas, "p1", fields(json!({ "semana": "2" })))
            .await
            .unwrap();

        let result = engine.sync().await.unwrap();

        assert_eq!(result.synced_count, 0);
        assert_eq!(result.conflict_count, 1);
        assert_eq!(result.errors.len(), 1);
        assert_eq!(result.errors[0].operation_id, queue_id);
        assert_eq!(result.errors[0].kind, FailureKind::Conflict);
        assert_eq!(result.errors[0].status, OperationStatus::Conflict);
        let op = engine.store().get_op(queue_id).await.unwrap().unwrap();
        assert_eq!(op.status, OperationStatus::Conflict);
        assert_eq!(op.retry_count, 0);

        let again = engine.sync().await.unwrap();
        assert_eq!(again, SyncResult::default());
        assert_eq!(engine.outbox_status().await.unwrap().conflict_count, 1);
    }

    #[tokio::test]
    async fn matching_revision_updates_and_refreshes_local_copy() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/rest/v1/programas"))
            .and(query_param("id", "eq.p1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                { "id": "p1", "semana": "1", "updated_at": "2024-06-01T00:00:00Z", "revision": 5 }
            ])))
            .mount(&server)
            .await;
        Mock::given(method("PATCH"))
            .and(path("/rest/v1/programas"))
            .and(query_param("id", "eq.p1"))
            .and(query_param("revision", "eq.5"))
            .and(body_json(json!({ "semana": "2" })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                { "id": "p1", "semana": "2", "updated_at": "2024-06-03T00:00:00Z", "revision": 6 }
            ])))
            .expect(1)
            .mount(&server)
            .await;
        let engine = make_engine(&server).await;
        seed(
            &engine,
            Record {
                entity_type: EntityType::Programas,
                id: "p1".to_string(),
                payload: fields(json!({ "semana": "1" })),
                updated_at: ts("2024-06-01T00:00:00Z"),
                deleted_at: None,
                revision: Some(5),
            },
        )
        .await;
        engine
            .update_local(EntityType::Programas, "p1", fields(json!({ "semana": "2" })))
            .await
            .unwrap();

        let result = engine.sync().await.unwrap();

        assert_eq!(result.synced_count, 1);
        let local = engine
            .store()
            .get(EntityType::Programas, "p1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(local.revision, Some(6));
        assert_eq!(local.updated_at, ts("2024-06-03T00:00:00Z"));
        assert_eq!(local.payload["semana"], "2");
    }

    #[tokio::test]
    async fn delete_sends_tombstone_stamped_at_enqueue_time() {
        let server = MockServer::start().await;
        let engine = make_engine(&server).await;
        seed(
            &engine,
            Record {
                entity_type: EntityType::Designacoes,
                id: "d1".to_string(),
                payload: fields(json!({ "programa_id": "p1" })),
                updated_at: ts("2024-07-01T00:00:00Z"),
                deleted_at: None,
                revision: Some(2),
            },
        )
        .await;
        let queue_id = engine
            .delete_local(EntityType::Designacoes, "d1")
            .await
            .unwrap();
        let op = engine.store().get_op(queue_id).await.unwrap().unwrap();
        let local = engine
            .store()
            .get(EntityType::Designacoes, "d1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(local.deleted_at, Some(op.enqueued_at));

        let deleted_at = parte_core::format_timestamp(op.enqueued_at).unwrap();
        Mock::given(method("PATCH"))
            .and(path("/rest/v1/designacoes"))
            .and(query_param("id", "eq.d1"))
            .and(body_json(json!({ "deleted_at": deleted_at })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {
                    "id": "d1",
                    "programa_id": "p1",
                    "updated_at": "2024-07-02T00:00:00Z",
                    "deleted_at": deleted_at,
                    "revision": 3
                }
            ])))
            .expect(1)
            .mount(&server)
            .await;

        let result = engine.sync().await.unwrap();

        assert_eq!(result.synced_count, 1);
        let local = engine
            .store()
            .get(EntityType::Designacoes, "d1")
            .await
            .unwrap()
            .unwrap();
        assert!(local.is_tombstone());
        assert_eq!(local.revision, Some(3));
    }

    #[tokio::test]
    async fn transient_failures_exhaust_after_three_attempts() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/rest/v1/programas"))
            .respond_with(ResponseTemplate::new(503))
            .expect(3)
            .mount(&server)
            .await;
        let engine = make_engine(&server).await;
        let temp_id = engine
            .create_local(EntityType::Programas, fields(json!({ "semana": "1" })))
            .await
            .unwrap();

        for _ in 0..2 {
            let result = engine.sync().await.unwrap();
            assert_eq!(result.failed_count, 0);
            assert_eq!(result.errors.len(), 1);
            assert_eq!(result.errors[0].kind, FailureKind::Transient);
            assert_eq!(result.errors[0].status, OperationStatus::Pending);
        }
        let third = engine.sync().await.unwrap();
        assert_eq!(third.failed_count, 1);
        assert_eq!(third.errors[0].status, OperationStatus::Failed);

        let fourth = engine.sync().await.unwrap();
        assert_eq!(fourth, SyncResult::default());

        let status = engine.outbox_status().await.unwrap();
        assert_eq!(status.pending_count, 0);
        assert_eq!(status.failed_count, 1);
        let ops = engine.list_outbox().await.unwrap();
        assert_eq!(ops[0].retry_count, 3);
        assert!(ops[0].last_error.is_some());
        // The optimistic copy stays until someone resolves the failure.
        assert!(
            engine
                .store()
                .get(EntityType::Programas, &temp_id)
                .await
                .unwrap()
                .is_some()
        );
    }

    #[tokio::test]
    async fn validation_errors_fail_without_retry() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/rest/v1/estudantes"))
            .respond_with(
                ResponseTemplate::new(400).set_body_string(r#"{"message":"violates check"}"#),
            )
            .expect(1)
            .mount(&server)
            .await;
        let engine = make_engine(&server).await;
        let temp_id = engine
            .create_local(EntityType::Estudantes, fields(json!({ "nome": "" })))
            .await
            .unwrap();
        engine
            .update_local(
                EntityType::Estudantes,
                &temp_id,
                fields(json!({ "nome": "Ana" })),
            )
            .await
            .unwrap();

        let result = engine.sync().await.unwrap();

        // The update never reaches the network: its record was never created.
        assert_eq!(result.failed_count, 2);
        assert!(
            result
                .errors
                .iter()
                .all(|error| error.kind == FailureKind::Permanent)
        );
        let ops = engine.list_outbox().await.unwrap();
        assert!(ops.iter().all(|op| op.retry_count == 0));
        assert_eq!(engine.sync().await.unwrap(), SyncResult::default());
    }

    #[tokio::test]
    async fn rate_limited_operation_waits_for_retry_after() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/rest/v1/programas"))
            .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "120"))
            .expect(1)
            .mount(&server)
            .await;
        let engine = make_engine(&server).await;
        engine
            .create_local(EntityType::Programas, fields(json!({ "semana": "3" })))
            .await
            .unwrap();

        let first = engine.sync().await.unwrap();
        assert_eq!(first.errors[0].kind, FailureKind::Transient);
        let ops = engine.list_outbox().await.unwrap();
        let op = &ops[0];
        assert_eq!(op.status, OperationStatus::Pending);
        assert!(op.retry_at.is_some_and(|at| at > now_utc()));

        let second = engine.sync().await.unwrap();
        assert_eq!(second, SyncResult::default());
        assert_eq!(engine.outbox_status().await.unwrap().pending_count, 1);
    }
