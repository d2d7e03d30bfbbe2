impl<R: RemoteAdapter> SyncEngine<R> {
    /// Drains the outbox once, oldest operation first. Per-operation failures
    /// are recorded and reported; only store failures and cancellation end
    /// the cycle early.
    pub async fn sync(&self) -> Result<SyncResult, EngineError> {
        let _cycle = self.begin_cycle()?;
        self.check_cancelled()?;
        let queued = self.store.list_pending_ops().await?;
        let started = now_utc();
        let mut result = SyncResult::default();
        // Records with an operation left behind this cycle; their later
        // operations must wait too.
        let mut held: HashSet<(EntityType, String)> = HashSet::new();

        for queued_op in queued {
            self.check_cancelled()?;
            // Earlier settles may have re-keyed or rebased this operation.
            let Some(op) = self.store.get_op(queued_op.id).await? else {
                continue;
            };
            if op.status != OperationStatus::Pending {
                continue;
            }
            let key = (op.entity_type, op.entity_id.clone());
            if held.contains(&key) {
                debug!(queue_id = op.id, entity = %op.entity_type, id = %op.entity_id, "held behind earlier operation");
                continue;
            }
            if !op.is_ready(started) {
                debug!(queue_id = op.id, entity = %op.entity_type, "waiting for retry time");
                held.insert(key);
                continue;
            }

            match self.push_operation(&op).await? {
                PushOutcome::Synced => result.synced_count += 1,
                PushOutcome::Created(remap) => {
                    result.synced_count += 1;
                    result.id_remaps.push(remap);
                }
                PushOutcome::Rejected(Rejection { error: err, remote }) => {
                    let status = self.record_failure(&op, &err, remote).await?;
                    match status {
                        OperationStatus::Pending => {
                            held.insert(key);
                        }
                        OperationStatus::Failed => result.failed_count += 1,
                        OperationStatus::Conflict => result.conflict_count += 1,
                        OperationStatus::Synced => {}
                    }
                    result.errors.push(OperationError {
                        operation_id: op.id,
                        entity_type: op.entity_type,
                        entity_id: op.entity_id.clone(),
                        kind: FailureKind::from(&err),
                        error: err.to_string(),
                        status,
                    });
                }
            }
        }

        if result.synced_count > 0 || !result.errors.is_empty() {
            info!(
                synced = result.synced_count,
                failed = result.failed_count,
                conflicts = result.conflict_count,
                errors = result.errors.len(),
                "outbox drained"
            );
        }
        Ok(result)
    }

    async fn push_operation(&self, op: &OutboxOperation) -> Result<PushOutcome, EngineError> {
        let pushed = match op.kind {
            OperationKind::Create => self
                .remote
                .insert(op.entity_type, &op.payload)
                .await
                .map_err(Rejection::from),
            OperationKind::Update => self.push_update(op).await,
            OperationKind::Delete => self.push_delete(op).await.map_err(Rejection::from),
        };
        let server = match pushed {
            Ok(server) => server,
            Err(err) => return Ok(PushOutcome::Rejected(err)),
        };

        let rebased = self.store.settle_op(op, &server).await?;
        debug!(
            queue_id = op.id,
            entity = %op.entity_type,
            id = %server.id,
            kind = op.kind.as_str(),
            rebased,
            "operation synced"
        );
        if op.kind == OperationKind::Create && server.id != op.entity_id {
            return Ok(PushOutcome::Created(IdRemap {
                entity_type: op.entity_type,
                temporary_id: op.entity_id.clone(),
                server_id: server.id,
            }));
        }
        Ok(PushOutcome::Synced)
    }

    async fn push_update(&self, op: &OutboxOperation) -> Result<Record, Rejection> {
        ensure_confirmed(op)?;
        if let Some(captured) = op.revision {
            let current = self
                .remote
                .fetch(op.entity_type, &op.entity_id)
                .await?
                .ok_or_else(|| missing_remotely(op))?;
            if let RevisionCheck::Reject { local, remote } =
                check_revision(Some(captured), current.revision)
            {
                return Err(Rejection {
                    error: RemoteError::Conflict {
                        entity_id: op.entity_id.clone(),
                        local_revision: Some(local),
                        remote_revision: Some(remote),
                    },
                    remote: Some(current),
                });
            }
        }
        Ok(self
            .remote
            .update(op.entity_type, &op.entity_id, &op.payload, op.revision)
            .await?)
    }

    async fn push_delete(&self, op: &OutboxOperation) -> Result<Record, RemoteError> {
        ensure_confirmed(op)?;
        self.remote
            .soft_delete(op.entity_type, &op.entity_id, op.enqueued_at)
            .await
    }

    /// Marks a refused operation. Once it leaves the queue the local copy is
    /// brought back in line with the remote, so a later mutation captures the
    /// current revision.
    async fn record_failure(
        &self,
        op: &OutboxOperation,
        err: &RemoteError,
        remote: Option<Record>,
    ) -> Result<OperationStatus, EngineError> {
        let outcome = match err {
            RemoteError::Transient { retry_after, .. } => MarkOutcome::Retryable {
                retry_at: self
                    .backoff
                    .retry_at(now_utc(), op.retry_count, *retry_after),
            },
            RemoteError::Conflict { .. } => MarkOutcome::Conflict,
            RemoteError::Permanent(_) => MarkOutcome::Permanent,
        };
        let leaves_queue = match outcome {
            MarkOutcome::Retryable { .. } => op.retry_count + 1 >= self.store.max_retries(),
            _ => true,
        };
        let remote = match remote {
            Some(remote) => Some(remote),
            None if leaves_queue => self.remote_copy(op).await,
            None => None,
        };
        let message = err.to_string();
        let status = self
            .store
            .reject_op(op, outcome, Some(&message), remote.as_ref())
            .await?;
        warn!(
            queue_id = op.id,
            entity = %op.entity_type,
            id = %op.entity_id,
            attempt = op.retry_count + 1,
            status = status.as_str(),
            error = %message,
            "operation not applied"
        );
        Ok(status)
    }

    /// Best-effort read of the record behind a refused update or delete.
    async fn remote_copy(&self, op: &OutboxOperation) -> Option<Record> {
        if op.kind == OperationKind::Create || is_temporary_id(&op.entity_id) {
            return None;
        }
        match self.remote.fetch(op.entity_type, &op.entity_id).await {
            Ok(copy) => copy,
            Err(err) => {
                debug!(queue_id = op.id, id = %op.entity_id, error = %err, "could not refresh refused record");
                None
            }
        }
    }
}

/// Updates and deletes need the server id; a temporary id here means the
/// create never went through.
fn ensure_confirmed(op: &OutboxOperation) -> Result<(), RemoteError> {
    if is_temporary_id(&op.entity_id) {
        return Err(RemoteError::Permanent(format!(
            "{}/{} was never created remotely",
            op.entity_type, op.entity_id
        )));
    }
    Ok(())
}

fn missing_remotely(op: &OutboxOperation) -> RemoteError {
    RemoteError::Permanent(format!(
        "{}/{} does not exist remotely",
        op.entity_type, op.entity_id
    ))
}
