impl<R: RemoteAdapter> SyncEngine<R> {
    /// Pulls remote changes for one entity type since its cursor.
    pub async fn pull(&self, entity: EntityType) -> Result<PullReport, EngineError> {
        let _cycle = self.begin_cycle()?;
        self.check_cancelled()?;
        let since = self.store.get_cursor(entity).await?;
        self.pull_since(entity, since).await
    }

    /// Pulls every entity type since its own cursor.
    pub async fn download_incremental(&self) -> Result<Vec<PullReport>, EngineError> {
        let _cycle = self.begin_cycle()?;
        let mut reports = Vec::with_capacity(EntityType::ALL.len());
        for entity in EntityType::ALL {
            self.check_cancelled()?;
            let since = self.store.get_cursor(entity).await?;
            reports.push(self.pull_since(entity, since).await?);
        }
        Ok(reports)
    }

    /// Seeds the given entity types from scratch, ignoring their cursors.
    pub async fn download_full(
        &self,
        entities: &[EntityType],
    ) -> Result<Vec<PullReport>, EngineError> {
        let _cycle = self.begin_cycle()?;
        let mut reports = Vec::with_capacity(entities.len());
        for entity in entities {
            self.check_cancelled()?;
            reports.push(self.pull_since(*entity, OffsetDateTime::UNIX_EPOCH).await?);
        }
        info!(
            entities = reports.len(),
            records = reports.iter().map(|report| report.applied).sum::<usize>(),
            "full download finished"
        );
        Ok(reports)
    }

    async fn pull_since(
        &self,
        entity: EntityType,
        since: OffsetDateTime,
    ) -> Result<PullReport, EngineError> {
        let records = self.remote.list(entity, since).await?;
        let fetched = records.len();
        let Some(newest) = records.iter().map(|record| record.updated_at).max() else {
            debug!(entity = %entity, "no remote changes");
            return Ok(PullReport {
                entity_type: entity,
                fetched: 0,
                applied: 0,
                skipped: 0,
                watermark: self.store.get_cursor(entity).await?,
            });
        };

        // Unconfirmed local edits win until their own push settles them.
        let pending = self.store.pending_entity_ids(entity).await?;
        let (skipped, apply): (Vec<_>, Vec<_>) = records
            .into_iter()
            .partition(|record| pending.contains(&record.id));
        self.store.put_many(entity, &apply).await?;
        let watermark = self.store.set_cursor(entity, newest).await?;

        info!(
            entity = %entity,
            applied = apply.len(),
            skipped = skipped.len(),
            "pulled remote changes"
        );
        Ok(PullReport {
            entity_type: entity,
            fetched,
            applied: apply.len(),
            skipped: skipped.len(),
            watermark,
        })
    }
}
