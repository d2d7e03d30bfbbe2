    const EPOCH: &str = "1970-01-01T00:00:00Z";

    async fn mount_rows(server: &MockServer, table: &str, since: &str, rows: Value) {
        Mock::given(method("GET"))
            .and(path(format!("/rest/v1/{table}")))
            .and(query_param("updated_at", format!("gt.{since}")))
            .respond_with(ResponseTemplate::new(200).set_body_json(rows))
            .mount(server)
            .await;
    }

    fn seeded(entity: EntityType, id: &str, payload: Value, revision: i64) -> Record {
        Record {
            entity_type: entity,
            id: id.to_string(),
            payload: fields(payload),
            updated_at: ts("2024-01-01T00:00:00Z"),
            deleted_at: None,
            revision: Some(revision),
        }
    }

    #[tokio::test]
    async fn pull_applies_remote_records_and_advances_cursor() {
        let server = MockServer::start().await;
        mount_rows(
            &server,
            "estudantes",
            EPOCH,
            json!([
                { "id": "e1", "nome": "Ana", "updated_at": "2024-01-01T00:00:00Z", "revision": 1 },
                {
                    "id": "e2",
                    "nome": "Bia",
                    "updated_at": "2024-01-02T00:00:00Z",
                    "deleted_at": "2024-01-02T00:00:00Z",
                    "revision": 4
                }
            ]),
        )
        .await;
        let engine = make_engine(&server).await;

        let report = engine.pull(EntityType::Estudantes).await.unwrap();

        assert_eq!(report.fetched, 2);
        assert_eq!(report.applied, 2);
        assert_eq!(report.watermark, ts("2024-01-02T00:00:00Z"));
        let local = engine.list_local(EntityType::Estudantes).await.unwrap();
        let ids: Vec<_> = local.iter().map(|record| record.id.as_str()).collect();
        assert_eq!(ids, vec!["e1", "e2"]);
        assert_eq!(local[0].payload["nome"], "Ana");
        assert!(local[1].is_tombstone());
        assert_eq!(
            engine.store().get_cursor(EntityType::Estudantes).await.unwrap(),
            ts("2024-01-02T00:00:00Z")
        );
    }

    #[tokio::test]
    async fn second_pull_starts_at_watermark_and_changes_nothing() {
        let server = MockServer::start().await;
        mount_rows(
            &server,
            "programas",
            EPOCH,
            json!([{ "id": "p1", "semana": "1", "updated_at": "2024-02-01T10:00:00Z" }]),
        )
        .await;
        mount_rows(&server, "programas", "2024-02-01T10:00:00Z", json!([])).await;
        let engine = make_engine(&server).await;

        engine.pull(EntityType::Programas).await.unwrap();
        let before = engine.list_local(EntityType::Programas).await.unwrap();
        let report = engine.pull(EntityType::Programas).await.unwrap();

        assert_eq!(report.fetched, 0);
        assert_eq!(report.watermark, ts("2024-02-01T10:00:00Z"));
        assert_eq!(engine.list_local(EntityType::Programas).await.unwrap(), before);
    }

    #[tokio::test]
    async fn repeating_a_pull_batch_is_idempotent() {
        let server = MockServer::start().await;
        mount_rows(
            &server,
            "designacoes",
            EPOCH,
            json!([
                { "id": "d1", "programa_id": "p1", "updated_at": "2024-03-01T00:00:00Z", "revision": 1 },
                { "id": "d2", "programa_id": "p1", "updated_at": "2024-03-02T00:00:00Z", "revision": 1 }
            ]),
        )
        .await;
        let engine = make_engine(&server).await;

        engine
            .download_full(&[EntityType::Designacoes])
            .await
            .unwrap();
        let first = engine.list_local(EntityType::Designacoes).await.unwrap();
        let first_cursors = engine.cursors().await.unwrap();
        engine
            .download_full(&[EntityType::Designacoes])
            .await
            .unwrap();

        assert_eq!(engine.list_local(EntityType::Designacoes).await.unwrap(), first);
        let cursors = engine.cursors().await.unwrap();
        assert_eq!(cursors[0].watermark, first_cursors[0].watermark);
        assert_eq!(engine.designacoes_for_programa("p1").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn pull_keeps_records_with_pending_local_changes() {
        let server = MockServer::start().await;
        mount_rows(
            &server,
            "estudantes",
            EPOCH,
            json!([
                { "id": "e1", "nome": "Ana Remota", "updated_at": "2024-04-02T00:00:00Z", "revision": 2 },
                { "id": "e2", "nome": "Bia", "updated_at": "2024-04-01T00:00:00Z", "revision": 1 }
            ]),
        )
        .await;
        let engine = make_engine(&server).await;
        engine
            .store()
            .put_many(
                EntityType::Estudantes,
                &[seeded(EntityType::Estudantes, "e1", json!({ "nome": "Ana" }), 1)],
            )
            .await
            .unwrap();
        engine
            .update_local(
                EntityType::Estudantes,
                "e1",
                fields(json!({ "nome": "Ana Local" })),
            )
            .await
            .unwrap();

        let report = engine.pull(EntityType::Estudantes).await.unwrap();

        assert_eq!(report.applied, 1);
        assert_eq!(report.skipped, 1);
        let e1 = engine
            .store()
            .get(EntityType::Estudantes, "e1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(e1.payload["nome"], "Ana Local");
        assert!(
            engine
                .store()
                .get(EntityType::Estudantes, "e2")
                .await
                .unwrap()
                .is_some()
        );
        // Skipped records still count towards the watermark.
        assert_eq!(report.watermark, ts("2024-04-02T00:00:00Z"));
    }

    #[tokio::test]
    async fn full_download_ignores_but_never_lowers_cursor() {
        let server = MockServer::start().await;
        mount_rows(
            &server,
            "programas",
            EPOCH,
            json!([{ "id": "p1", "semana": "1", "updated_at": "2024-01-01T00:00:00Z" }]),
        )
        .await;
        let engine = make_engine(&server).await;
        let later = ts("2025-01-01T00:00:00Z");
        engine
            .store()
            .set_cursor(EntityType::Programas, later)
            .await
            .unwrap();

        let reports = engine
            .download_full(&[EntityType::Programas])
            .await
            .unwrap();

        assert_eq!(reports[0].applied, 1);
        assert_eq!(reports[0].watermark, later);
        assert_eq!(
            engine.store().get_cursor(EntityType::Programas).await.unwrap(),
            later
        );
    }

    #[tokio::test]
    async fn incremental_download_covers_every_entity_type() {
        let server = MockServer::start().await;
        mount_rows(
            &server,
            "estudantes",
            EPOCH,
            json!([{ "id": "e1", "nome": "Ana", "updated_at": "2024-01-01T00:00:00Z" }]),
        )
        .await;
        mount_rows(&server, "programas", EPOCH, json!([])).await;
        mount_rows(
            &server,
            "designacoes",
            EPOCH,
            json!([{ "id": "d1", "programa_id": "p9", "updated_at": "2024-01-03T00:00:00Z" }]),
        )
        .await;
        let engine = make_engine(&server).await;

        let reports = engine.download_incremental().await.unwrap();

        let applied: Vec<_> = reports
            .iter()
            .map(|report| (report.entity_type, report.applied))
            .collect();
        assert_eq!(
            applied,
            vec![
                (EntityType::Estudantes, 1),
                (EntityType::Programas, 0),
                (EntityType::Designacoes, 1)
            ]
        );
        assert_eq!(engine.cursors().await.unwrap().len(), 2);
        assert_eq!(
            engine.designacoes_for_programa("p9").await.unwrap()[0].id,
            "d1"
        );
    }

    #[tokio::test]
    async fn failed_pull_leaves_cursor_untouched() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/rest/v1/estudantes"))
            .respond_with(ResponseTemplate::new(502))
            .mount(&server)
            .await;
        let engine = make_engine(&server).await;

        let err = engine.pull(EntityType::Estudantes).await.unwrap_err();

        assert!(matches!(
            err,
            EngineError::Remote(RemoteError::Transient { .. })
        ));
        assert_eq!(
            engine.store().get_cursor(EntityType::Estudantes).await.unwrap(),
            OffsetDateTime::UNIX_EPOCH
        );
        assert!(engine.cursors().await.unwrap().is_empty());
    }
