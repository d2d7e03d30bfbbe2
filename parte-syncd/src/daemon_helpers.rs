/// Seeds every entity type on a store that has never been pulled.
async fn seed_if_empty<R: RemoteAdapter>(
    engine: &SyncEngine<R>,
) -> Result<Option<Vec<PullReport>>, EngineError> {
    if !engine.cursors().await?.is_empty() {
        return Ok(None);
    }
    engine.download_full(&EntityType::ALL).await.map(Some)
}

/// Runs one incremental pull. Returns false once the engine is cancelled.
async fn pull_once<R: RemoteAdapter>(engine: &SyncEngine<R>) -> bool {
    match engine.download_incremental().await {
        Ok(reports) => {
            log_pull(&reports);
            true
        }
        Err(EngineError::Cancelled) => false,
        Err(EngineError::SyncInProgress) => {
            debug!("pull skipped, another cycle is running");
            true
        }
        Err(err) => {
            warn!(error = %err, "incremental pull failed");
            true
        }
    }
}

/// Drains the outbox once. Returns false once the engine is cancelled.
async fn push_once<R: RemoteAdapter>(engine: &SyncEngine<R>) -> bool {
    match engine.sync().await {
        Ok(result) => {
            log_push(&result);
            true
        }
        Err(EngineError::Cancelled) => false,
        Err(EngineError::SyncInProgress) => {
            debug!("push skipped, another cycle is running");
            true
        }
        Err(err) => {
            warn!(error = %err, "outbox drain failed");
            true
        }
    }
}

fn log_pull(reports: &[PullReport]) {
    let applied: usize = reports.iter().map(|report| report.applied).sum();
    let skipped: usize = reports.iter().map(|report| report.skipped).sum();
    debug!(entities = reports.len(), applied, skipped, "pull finished");
}

fn log_push(result: &SyncResult) {
    for remap in &result.id_remaps {
        debug!(
            entity = %remap.entity_type,
            temporary_id = %remap.temporary_id,
            server_id = %remap.server_id,
            "temporary id replaced"
        );
    }
    if result.conflict_count > 0 {
        warn!(
            conflicts = result.conflict_count,
            "operations rejected by newer remote revisions"
        );
    }
}

fn expand_with_home(value: &str, home: &Path) -> PathBuf {
    if value == "~" {
        return home.to_path_buf();
    }
    if let Some(rest) = value.strip_prefix("~/") {
        return home.join(rest);
    }
    PathBuf::from(value)
}

fn non_empty_env(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn read_u64_env(name: &str, default: u64) -> u64 {
    parse_u64(std::env::var(name).ok().as_deref(), default)
}

fn read_bool_env(name: &str, default: bool) -> bool {
    parse_bool(std::env::var(name).ok().as_deref(), default)
}

fn parse_u64(value: Option<&str>, default: u64) -> u64 {
    value
        .and_then(|value| value.trim().parse::<u64>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(default)
}

fn parse_bool(value: Option<&str>, default: bool) -> bool {
    value
        .map(|value| {
            matches!(
                value.trim().to_ascii_lowercase().as_str(),
                "1" | "true" | "yes" | "on"
            )
        })
        .unwrap_or(default)
}
