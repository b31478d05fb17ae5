use dfs_meta::{
    DfsError, DfsResult, IndexedLog, NameConfig, NameService, NodeRecordStore, SqliteNodeStore,
};
use log::{error, info, warn};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::runtime::Runtime;

pub const DEFAULT_NAME_CONFIG_PATH: &str = "/etc/dfs/name.json";

#[derive(Debug, Clone, PartialEq)]
pub struct NameDaemonRunOptions {
    pub config_path: PathBuf,
}

pub fn read_json_config<T: DeserializeOwned>(path: &Path) -> DfsResult<T> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| DfsError::IoError(format!("read {} failed: {}", path.display(), e)))?;
    serde_json::from_str::<T>(&content)
        .map_err(|e| DfsError::DecodeError(format!("parse {} failed: {}", path.display(), e)))
}

pub fn load_name_config(path: &Path) -> DfsResult<NameConfig> {
    let config: NameConfig = read_json_config(path)?;
    if config.block_size == 0 {
        return Err(DfsError::InvalidParam(format!(
            "{}: block_size must be positive",
            path.display()
        )));
    }
    Ok(config)
}

/// Build the service objects; nothing is served and nothing is recovered yet.
pub fn init_name_service(config: &NameConfig) -> DfsResult<Arc<NameService>> {
    std::fs::create_dir_all(&config.data_path).map_err(|e| {
        DfsError::IoError(format!(
            "create data path {} failed: {}",
            config.data_path.display(),
            e
        ))
    })?;
    let db_path = config.node_db_path();
    let store: Arc<dyn NodeRecordStore> =
        Arc::new(SqliteNodeStore::new(db_path.to_string_lossy().to_string())?);
    Ok(Arc::new(NameService::new(config.clone(), store)?))
}

/// Accept data nodes, recover the namespace, then run until `shutdown` resolves and fold the
/// journal into a final snapshot.
pub async fn serve_name_node<F>(
    svc: Arc<NameService>,
    listener: TcpListener,
    shutdown: F,
) -> DfsResult<()>
where
    F: Future<Output = ()>,
{
    let sweeper = svc.spawn_lock_sweeper();
    // heartbeats keep flowing while recovery runs
    let membership = tokio::spawn(svc.membership().serve(listener));

    let result = match svc.recover().await {
        Ok(stats) => {
            info!(
                "name node ready: snapshot {} journal {} skipped {}",
                stats.snapshot_records, stats.journal_records, stats.skipped_records
            );
            shutdown.await;
            info!("name node shutting down");
            svc.checkpoint().map(|_| ())
        }
        Err(e) => {
            error!("name node recovery failed: {}", e);
            Err(e)
        }
    };

    membership.abort();
    sweeper.abort();
    result
}

pub fn run_name_daemon(config: NameConfig) -> DfsResult<()> {
    let runtime = Runtime::new().map_err(|e| DfsError::Internal(e.to_string()))?;
    runtime.block_on(async move {
        let svc = init_name_service(&config)?;
        let listener = TcpListener::bind(config.listen_addr()).await.map_err(|e| {
            DfsError::IoError(format!("bind {} failed: {}", config.listen_addr(), e))
        })?;
        info!(
            "name node at {}, data_path={}",
            config.listen_addr(),
            config.data_path.display()
        );
        serve_name_node(svc, listener, async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("wait for ctrl-c failed: {}", e);
            }
        })
        .await
    })
}

/// Record `seq` (1-based) of a journal or snapshot file.
pub fn inspect_log(path: &Path, seq: usize) -> DfsResult<Option<Value>> {
    let mut log = IndexedLog::new(path);
    let count = log.build_index()?;
    info!("inspect: {} holds {} records", path.display(), count);
    log.read_at::<Value>(seq)
}
