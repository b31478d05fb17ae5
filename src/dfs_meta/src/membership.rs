// 数据节点成员管理：register/heartbeat协议、存活定时器、在线节点目录
// 每个数据节点保持一条长连接，消息是按行分隔的json

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::node_store::NodeRecordStore;
use crate::task_queue::{Task, TaskQueue};
use crate::{lock_or_recover, new_token, DfsError, DfsResult};

const DEFAULT_HEARTBEAT_TIMEOUT_SECS: f64 = 30.0;

/// Read-only view of the node set, used by placement and by the namespace tree.
pub trait NodeDirectory: Send + Sync {
    /// Numeric ids of nodes with a live connection.
    fn live_node_ids(&self) -> Vec<u64>;
    /// Live nodes eligible for new data.
    fn usable_node_ids(&self, exclude_full: bool) -> Vec<u64>;
    /// Every node ever registered, live or not.
    fn known_node_ids(&self) -> Vec<u64>;
}

fn default_heartbeat_timeout() -> f64 {
    DEFAULT_HEARTBEAT_TIMEOUT_SECS
}

/// Attributes a data node reports about itself on register and heartbeat.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    #[serde(default)]
    pub http_host: String,
    #[serde(default)]
    pub http_port: u16,
    /// Seconds without a heartbeat before the node is dropped.
    #[serde(default = "default_heartbeat_timeout")]
    pub heartbeat_timeout: f64,
    #[serde(default)]
    pub storage_full: bool,
    #[serde(default)]
    pub task_queue_full: bool,
    #[serde(flatten)]
    pub extra: HashMap<String, Value>,
}

impl Default for NodeInfo {
    fn default() -> Self {
        Self {
            node_id: None,
            http_host: String::new(),
            http_port: 0,
            heartbeat_timeout: DEFAULT_HEARTBEAT_TIMEOUT_SECS,
            storage_full: false,
            task_queue_full: false,
            extra: HashMap::new(),
        }
    }
}

impl NodeInfo {
    fn heartbeat_duration(&self) -> Duration {
        Duration::try_from_secs_f64(self.heartbeat_timeout)
            .ok()
            .filter(|d| !d.is_zero())
            .unwrap_or(Duration::from_secs_f64(DEFAULT_HEARTBEAT_TIMEOUT_SECS))
    }

    fn fix_host(&mut self, peer_ip: &str) {
        if self.http_host == "0.0.0.0" || self.http_host.is_empty() {
            self.http_host = peer_ip.to_string();
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeAddr {
    #[serde(rename = "http_host")]
    pub host: String,
    #[serde(rename = "http_port")]
    pub port: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Success,
    Failure,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplyStatus {
    pub status: Status,
    pub message: String,
}

impl ReplyStatus {
    pub fn success() -> Self {
        Self {
            status: Status::Success,
            message: "success".to_string(),
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            status: Status::Failure,
            message: message.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == Status::Success
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterReply {
    pub status: Status,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatReply {
    pub status: Status,
    pub message: String,
    /// Other live nodes, keyed by numeric id.
    #[serde(default)]
    pub data_nodes: BTreeMap<u64, NodeAddr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task: Option<Task>,
}

impl HeartbeatReply {
    fn failure(message: String) -> Self {
        Self {
            status: Status::Failure,
            message,
            data_nodes: BTreeMap::new(),
            task: None,
        }
    }
}

/// Messages sent by a data node, `{"command": ..., "data": {...}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", content = "data", rename_all = "snake_case")]
pub enum NodeMessage {
    Register(NodeInfo),
    Heartbeat(NodeInfo),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", content = "data", rename_all = "snake_case")]
pub enum NodeReply {
    Register(RegisterReply),
    Heartbeat(HeartbeatReply),
    Error(ReplyStatus),
}

impl NodeReply {
    pub fn is_success(&self) -> bool {
        match self {
            NodeReply::Register(r) => r.status == Status::Success,
            NodeReply::Heartbeat(r) => r.status == Status::Success,
            NodeReply::Error(r) => r.is_success(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connected,
    Registered(u64),
    Closed,
}

/// Per-connection protocol state.
pub struct NodeSession {
    conn_id: u64,
    peer_ip: String,
    state: SessionState,
    closed: Arc<Notify>,
}

impl NodeSession {
    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_closed(&self) -> bool {
        self.state == SessionState::Closed
    }

    pub fn node(&self) -> Option<u64> {
        match self.state {
            SessionState::Registered(id) => Some(id),
            _ => None,
        }
    }

    /// Resolves once the liveness timer or a newer connection evicts this session.
    pub fn closed_signal(&self) -> Arc<Notify> {
        self.closed.clone()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterNode {
    pub id: u64,
    pub node_id: String,
    pub info: NodeInfo,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClusterInfo {
    pub number_of_nodes: usize,
    pub number_of_online_nodes: usize,
    pub number_of_offline_nodes: usize,
    pub online_nodes: Vec<ClusterNode>,
    pub offline_nodes: Vec<ClusterNode>,
}

struct LiveNode {
    node_id: String,
    info: NodeInfo,
    conn_id: u64,
    timer: Option<JoinHandle<()>>,
    closed: Arc<Notify>,
}

impl LiveNode {
    fn stop_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

#[derive(Default)]
struct MembershipInner {
    live: HashMap<u64, LiveNode>,
    known: BTreeSet<u64>,
}

/// Tracks registered data nodes and which of them are currently alive.
pub struct Membership {
    store: Arc<dyn NodeRecordStore>,
    tasks: Arc<TaskQueue>,
    inner: Mutex<MembershipInner>,
    next_conn: AtomicU64,
}

impl Membership {
    pub fn new(store: Arc<dyn NodeRecordStore>, tasks: Arc<TaskQueue>) -> DfsResult<Arc<Self>> {
        let known: BTreeSet<u64> = store.list()?.into_iter().map(|r| r.id).collect();
        info!("membership: loaded {} known data nodes", known.len());
        Ok(Arc::new(Self {
            store,
            tasks,
            inner: Mutex::new(MembershipInner {
                live: HashMap::new(),
                known,
            }),
            next_conn: AtomicU64::new(1),
        }))
    }

    fn inner(&self) -> MutexGuard<'_, MembershipInner> {
        lock_or_recover(&self.inner, "membership")
    }

    pub fn open_session(&self, peer_ip: impl Into<String>) -> NodeSession {
        NodeSession {
            conn_id: self.next_conn.fetch_add(1, Ordering::Relaxed),
            peer_ip: peer_ip.into(),
            state: SessionState::Connected,
            closed: Arc::new(Notify::new()),
        }
    }

    /// Decode one line and dispatch it. Undecodable input gets an error reply but keeps
    /// the connection.
    pub fn handle_line(self: &Arc<Self>, session: &mut NodeSession, line: &str) -> NodeReply {
        match serde_json::from_str::<NodeMessage>(line) {
            Ok(msg) => self.handle_message(session, msg),
            Err(e) => {
                warn!("membership: invalid message from {}: {}", session.peer_ip, e);
                NodeReply::Error(ReplyStatus::failure("Unknown Command!"))
            }
        }
    }

    pub fn handle_message(self: &Arc<Self>, session: &mut NodeSession, msg: NodeMessage) -> NodeReply {
        match msg {
            NodeMessage::Register(info) => self.register(session, info),
            NodeMessage::Heartbeat(info) => self.heartbeat(session, info),
        }
    }

    pub fn register(self: &Arc<Self>, session: &mut NodeSession, mut info: NodeInfo) -> NodeReply {
        info.fix_host(&session.peer_ip);
        let (id, node_id) = match self.resolve_record(&mut info) {
            Ok(v) => v,
            Err(e) => {
                warn!("membership: refuse register from {}: {}", session.peer_ip, e);
                session.state = SessionState::Closed;
                return NodeReply::Register(RegisterReply {
                    status: Status::Failure,
                    message: e.to_string(),
                    node_id: None,
                    id: None,
                });
            }
        };

        let timer = self.spawn_timer(id, session.conn_id, info.heartbeat_duration());
        let superseded = {
            let mut inner = self.inner();
            inner.known.insert(id);
            inner.live.insert(
                id,
                LiveNode {
                    node_id: node_id.clone(),
                    info,
                    conn_id: session.conn_id,
                    timer: Some(timer),
                    closed: session.closed.clone(),
                },
            )
        };
        if let Some(mut old) = superseded {
            old.stop_timer();
            if old.conn_id != session.conn_id {
                info!("membership: node {} reconnected, drop previous connection", id);
                old.closed.notify_one();
            }
        }

        session.state = SessionState::Registered(id);
        info!(
            "membership: node {} registered as {} from {}",
            node_id, id, session.peer_ip
        );
        NodeReply::Register(RegisterReply {
            status: Status::Success,
            message: "success".to_string(),
            node_id: Some(node_id),
            id: Some(id),
        })
    }

    /// Find or create the persisted record; returns (numeric id, opaque id).
    fn resolve_record(&self, info: &mut NodeInfo) -> DfsResult<(u64, String)> {
        let presented = info.node_id.clone().filter(|s| !s.is_empty());
        let node_id = match presented {
            Some(node_id) => node_id,
            None => {
                let node_id = new_token();
                info.node_id = Some(node_id.clone());
                let id = self
                    .store
                    .add(&node_id, info)
                    .map_err(|e| DfsError::RegistrationFailed(e.to_string()))?;
                return Ok((id, node_id));
            }
        };

        let record = self
            .store
            .get(&node_id)
            .map_err(|e| DfsError::RegistrationFailed(format!("lookup {}: {}", node_id, e)))?;
        let id = match record {
            Some(record) => {
                self.store
                    .update(&node_id, info)
                    .map_err(|e| DfsError::RegistrationFailed(e.to_string()))?;
                record.id
            }
            None => {
                debug!("membership: unknown node id {}, create record", node_id);
                self.store
                    .add(&node_id, info)
                    .map_err(|e| DfsError::RegistrationFailed(e.to_string()))?
            }
        };
        Ok((id, node_id))
    }

    pub fn heartbeat(self: &Arc<Self>, session: &mut NodeSession, mut info: NodeInfo) -> NodeReply {
        info.fix_host(&session.peer_ip);
        let Some(id) = session.node() else {
            return self.refuse(session, &info);
        };

        let withhold_task = info.task_queue_full;
        let data_nodes = {
            let mut inner = self.inner();
            let owned = matches!(inner.live.get(&id), Some(node) if node.conn_id == session.conn_id);
            if !owned {
                drop(inner);
                return self.refuse(session, &info);
            }
            if let Some(node) = inner.live.get_mut(&id) {
                node.stop_timer();
                node.timer = Some(self.spawn_timer(id, session.conn_id, info.heartbeat_duration()));
                info.node_id = Some(node.node_id.clone());
                node.info = info;
            }
            Self::directory(&inner, Some(id))
        };

        let task = if withhold_task { None } else { self.tasks.pop(id) };
        if let Some(task) = &task {
            debug!("membership: deliver task to node {}: {:?}", id, task);
        }
        NodeReply::Heartbeat(HeartbeatReply {
            status: Status::Success,
            message: "success".to_string(),
            data_nodes,
            task,
        })
    }

    fn refuse(&self, session: &mut NodeSession, info: &NodeInfo) -> NodeReply {
        let node_id = info.node_id.clone().unwrap_or_default();
        warn!(
            "membership: refuse heartbeat from {} node_id: {}",
            session.peer_ip, node_id
        );
        session.state = SessionState::Closed;
        NodeReply::Heartbeat(HeartbeatReply::failure(format!(
            "invalid node_id: {}",
            node_id
        )))
    }

    fn spawn_timer(self: &Arc<Self>, id: u64, conn_id: u64, timeout: Duration) -> JoinHandle<()> {
        let membership: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(membership) = membership.upgrade() {
                membership.expire(id, conn_id);
            }
        })
    }

    /// Liveness timer fired. Queued tasks for the node stay where they are.
    fn expire(&self, id: u64, conn_id: u64) {
        let removed = {
            let mut inner = self.inner();
            match inner.live.get(&id) {
                Some(node) if node.conn_id == conn_id => inner.live.remove(&id),
                _ => None,
            }
        };
        if let Some(node) = removed {
            warn!(
                "membership: node {} node_id: {} heartbeat timeout",
                id, node.node_id
            );
            node.closed.notify_one();
        }
    }

    /// Connection ended; drop the live entry if it still belongs to this session.
    pub fn close_session(&self, session: &mut NodeSession) {
        if let SessionState::Registered(id) = session.state {
            let removed = {
                let mut inner = self.inner();
                match inner.live.get(&id) {
                    Some(node) if node.conn_id == session.conn_id => inner.live.remove(&id),
                    _ => None,
                }
            };
            if let Some(mut node) = removed {
                node.stop_timer();
                info!("membership: node {} ({}) closed", id, session.peer_ip);
            }
        }
        session.state = SessionState::Closed;
    }

    fn directory(inner: &MembershipInner, exclude: Option<u64>) -> BTreeMap<u64, NodeAddr> {
        inner
            .live
            .iter()
            .filter(|(id, _)| Some(**id) != exclude)
            .map(|(id, node)| {
                (
                    *id,
                    NodeAddr {
                        host: node.info.http_host.clone(),
                        port: node.info.http_port,
                    },
                )
            })
            .collect()
    }

    /// Addresses of every live node.
    pub fn live_nodes(&self) -> BTreeMap<u64, NodeAddr> {
        Self::directory(&self.inner(), None)
    }

    pub fn cluster_info(&self) -> DfsResult<ClusterInfo> {
        let records = self.store.list()?;
        let (mut online_nodes, live_ids) = {
            let inner = self.inner();
            let online: Vec<ClusterNode> = inner
                .live
                .iter()
                .map(|(id, node)| ClusterNode {
                    id: *id,
                    node_id: node.node_id.clone(),
                    info: node.info.clone(),
                })
                .collect();
            let ids: BTreeSet<u64> = inner.live.keys().copied().collect();
            (online, ids)
        };
        online_nodes.sort_by_key(|n| n.id);
        let offline_nodes: Vec<ClusterNode> = records
            .into_iter()
            .filter(|r| !live_ids.contains(&r.id))
            .map(|r| ClusterNode {
                id: r.id,
                node_id: r.node_id,
                info: r.info,
            })
            .collect();

        Ok(ClusterInfo {
            number_of_nodes: online_nodes.len() + offline_nodes.len(),
            number_of_online_nodes: online_nodes.len(),
            number_of_offline_nodes: offline_nodes.len(),
            online_nodes,
            offline_nodes,
        })
    }

    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> DfsResult<()> {
        info!("membership: listening on {:?}", listener.local_addr()?);
        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(v) => v,
                Err(e) => {
                    warn!("membership: accept failed: {}", e);
                    continue;
                }
            };
            debug!("membership: incoming connection from {}", peer);
            let membership = self.clone();
            tokio::spawn(async move {
                membership.handle_connection(stream, peer).await;
            });
        }
    }

    pub async fn handle_connection(self: Arc<Self>, stream: TcpStream, peer: SocketAddr) {
        let (reader, mut writer) = stream.into_split();
        let mut lines = BufReader::new(reader).lines();
        let mut session = self.open_session(peer.ip().to_string());
        let closed = session.closed_signal();

        loop {
            let line = tokio::select! {
                _ = closed.notified() => {
                    debug!("membership: evict connection {}", peer);
                    break;
                }
                line = lines.next_line() => line,
            };
            let line = match line {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(e) => {
                    warn!("membership: read from {} failed: {}", peer, e);
                    break;
                }
            };
            if line.trim().is_empty() {
                continue;
            }

            let reply = self.handle_line(&mut session, &line);
            let mut payload = match serde_json::to_vec(&reply) {
                Ok(payload) => payload,
                Err(e) => {
                    warn!("membership: encode reply failed: {}", e);
                    break;
                }
            };
            payload.push(b'\n');
            if let Err(e) = writer.write_all(&payload).await {
                warn!("membership: write to {} failed: {}", peer, e);
                break;
            }
            if session.is_closed() {
                break;
            }
        }
        self.close_session(&mut session);
    }
}

impl NodeDirectory for Membership {
    fn live_node_ids(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self.inner().live.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    fn usable_node_ids(&self, exclude_full: bool) -> Vec<u64> {
        let mut ids: Vec<u64> = self
            .inner()
            .live
            .iter()
            .filter(|(_, node)| !exclude_full || !node.info.storage_full)
            .map(|(id, _)| *id)
            .collect();
        ids.sort_unstable();
        ids
    }

    fn known_node_ids(&self) -> Vec<u64> {
        self.inner().known.iter().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node_store::{NodeRecord, SqliteNodeStore};
    use tokio::time::sleep;

    fn node_info(node_id: Option<&str>, port: u16, timeout: f64) -> NodeInfo {
        NodeInfo {
            node_id: node_id.map(|s| s.to_string()),
            http_host: "0.0.0.0".to_string(),
            http_port: port,
            heartbeat_timeout: timeout,
            ..NodeInfo::default()
        }
    }

    fn membership() -> (Arc<Membership>, Arc<TaskQueue>, Arc<SqliteNodeStore>) {
        let store = Arc::new(SqliteNodeStore::open_in_memory().unwrap());
        let tasks = Arc::new(TaskQueue::new());
        let m = Membership::new(store.clone(), tasks.clone()).unwrap();
        (m, tasks, store)
    }

    fn registered(m: &Arc<Membership>, port: u16, timeout: f64) -> (NodeSession, u64, String) {
        let mut session = m.open_session("10.1.1.1");
        let reply = m.register(&mut session, node_info(None, port, timeout));
        let NodeReply::Register(reply) = reply else {
            panic!("unexpected reply");
        };
        assert_eq!(reply.status, Status::Success);
        (session, reply.id.unwrap(), reply.node_id.unwrap())
    }

    struct BrokenStore;

    impl NodeRecordStore for BrokenStore {
        fn add(&self, _: &str, _: &NodeInfo) -> DfsResult<u64> {
            Err(DfsError::DbError("disk gone".to_string()))
        }
        fn update(&self, _: &str, _: &NodeInfo) -> DfsResult<()> {
            Err(DfsError::DbError("disk gone".to_string()))
        }
        fn get(&self, _: &str) -> DfsResult<Option<NodeRecord>> {
            Err(DfsError::DbError("disk gone".to_string()))
        }
        fn list(&self) -> DfsResult<Vec<NodeRecord>> {
            Ok(Vec::new())
        }
        fn delete(&self, _: &str) -> DfsResult<bool> {
            Ok(false)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_register_mints_id_and_fixes_host() {
        let (m, _, store) = membership();
        let (session, id, node_id) = registered(&m, 8001, 30.0);

        assert_eq!(session.state(), SessionState::Registered(id));
        assert_eq!(node_id.len(), 32);
        let record = store.get(&node_id).unwrap().unwrap();
        assert_eq!(record.id, id);
        assert_eq!(record.info.http_host, "10.1.1.1");
        assert_eq!(m.live_node_ids(), vec![id]);
        assert_eq!(m.live_nodes()[&id].host, "10.1.1.1");
    }

    #[tokio::test(start_paused = true)]
    async fn test_reregister_keeps_numeric_id() {
        let (m, _, store) = membership();
        let (mut session, id, node_id) = registered(&m, 8001, 30.0);
        m.close_session(&mut session);
        assert!(m.live_node_ids().is_empty());

        // a fresh process sees the same store
        let m2 = Membership::new(store.clone(), Arc::new(TaskQueue::new())).unwrap();
        assert_eq!(m2.known_node_ids(), vec![id]);
        let mut session = m2.open_session("10.1.1.2");
        let reply = m2.register(&mut session, node_info(Some(&node_id), 9001, 30.0));
        let NodeReply::Register(reply) = reply else {
            panic!("unexpected reply");
        };
        assert_eq!(reply.id, Some(id));
        assert_eq!(store.get(&node_id).unwrap().unwrap().info.http_port, 9001);
    }

    #[tokio::test(start_paused = true)]
    async fn test_register_store_failure_is_terminal() {
        let m = Membership::new(Arc::new(BrokenStore), Arc::new(TaskQueue::new())).unwrap();
        let mut session = m.open_session("10.1.1.1");
        let reply = m.register(&mut session, node_info(Some("abc"), 8001, 30.0));
        assert!(!reply.is_success());
        assert!(session.is_closed());
        assert!(m.live_node_ids().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_before_register_is_refused() {
        let (m, _, _) = membership();
        let mut session = m.open_session("10.1.1.1");
        let reply = m.heartbeat(&mut session, node_info(Some("abc"), 8001, 30.0));
        let NodeReply::Heartbeat(reply) = reply else {
            panic!("unexpected reply");
        };
        assert_eq!(reply.status, Status::Failure);
        assert_eq!(reply.message, "invalid node_id: abc");
        assert!(session.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_directory_and_single_task() {
        let (m, tasks, _) = membership();
        let (mut a, id_a, node_a) = registered(&m, 8001, 30.0);
        let (_b, id_b, _) = registered(&m, 8002, 30.0);
        tasks.push(id_a, Task::delete_file("f1"));
        tasks.push(id_a, Task::delete_file("f2"));

        let reply = m.heartbeat(&mut a, node_info(Some(&node_a), 8001, 30.0));
        let NodeReply::Heartbeat(reply) = reply else {
            panic!("unexpected reply");
        };
        assert_eq!(reply.status, Status::Success);
        assert_eq!(reply.data_nodes.keys().copied().collect::<Vec<_>>(), vec![id_b]);
        assert_eq!(reply.data_nodes[&id_b].port, 8002);
        assert_eq!(reply.task, Some(Task::delete_file("f1")));
        assert_eq!(tasks.pending(id_a), 1);

        let mut full = node_info(Some(&node_a), 8001, 30.0);
        full.task_queue_full = true;
        let NodeReply::Heartbeat(reply) = m.heartbeat(&mut a, full) else {
            panic!("unexpected reply");
        };
        assert_eq!(reply.status, Status::Success);
        assert!(reply.task.is_none());
        assert_eq!(tasks.pending(id_a), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_storage_full_excluded_from_usable() {
        let (m, _, _) = membership();
        let (mut a, id_a, node_a) = registered(&m, 8001, 30.0);
        let (_b, id_b, _) = registered(&m, 8002, 30.0);

        let mut info = node_info(Some(&node_a), 8001, 30.0);
        info.storage_full = true;
        m.heartbeat(&mut a, info);
        assert_eq!(m.usable_node_ids(true), vec![id_b]);
        let mut all = vec![id_a, id_b];
        all.sort();
        assert_eq!(m.usable_node_ids(false), all);
    }

    #[tokio::test(start_paused = true)]
    async fn test_liveness_timer_expires_and_keeps_tasks() {
        let (m, tasks, _) = membership();
        let (mut a, id_a, node_a) = registered(&m, 8001, 5.0);
        let (mut b, id_b, node_b) = registered(&m, 8002, 5.0);
        tasks.push(id_a, Task::delete_file("f"));

        // b keeps heartbeating, a goes silent
        sleep(Duration::from_secs(4)).await;
        assert!(m.heartbeat(&mut b, node_info(Some(&node_b), 8002, 5.0)).is_success());
        sleep(Duration::from_secs(2)).await;

        assert_eq!(m.live_node_ids(), vec![id_b]);
        let NodeReply::Heartbeat(reply) = m.heartbeat(&mut b, node_info(Some(&node_b), 8002, 5.0))
        else {
            panic!("unexpected reply");
        };
        assert!(!reply.data_nodes.contains_key(&id_a));
        assert_eq!(tasks.pending(id_a), 1);
        assert!(m.known_node_ids().contains(&id_a));

        // the expired session cannot heartbeat any more
        assert!(!m.heartbeat(&mut a, node_info(Some(&node_a), 8001, 5.0)).is_success());
        assert!(a.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_supersedes_old_connection() {
        let (m, _, _) = membership();
        let (old, id, node_id) = registered(&m, 8001, 5.0);
        let signal = old.closed_signal();

        let mut fresh = m.open_session("10.1.1.1");
        assert!(m.register(&mut fresh, node_info(Some(&node_id), 8001, 5.0)).is_success());
        assert_eq!(fresh.node(), Some(id));
        // the old connection is told to go away
        tokio::time::timeout(Duration::from_millis(10), signal.notified())
            .await
            .unwrap();

        // the old timer must not evict the new connection
        sleep(Duration::from_secs(3)).await;
        assert!(m.heartbeat(&mut fresh, node_info(Some(&node_id), 8001, 5.0)).is_success());
        sleep(Duration::from_secs(3)).await;
        assert_eq!(m.live_node_ids(), vec![id]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cluster_info() {
        let (m, _, _) = membership();
        let (mut a, id_a, _) = registered(&m, 8001, 30.0);
        let (_b, id_b, _) = registered(&m, 8002, 30.0);
        m.close_session(&mut a);

        let info = m.cluster_info().unwrap();
        assert_eq!(info.number_of_nodes, 2);
        assert_eq!(info.number_of_online_nodes, 1);
        assert_eq!(info.number_of_offline_nodes, 1);
        assert_eq!(info.online_nodes[0].id, id_b);
        assert_eq!(info.offline_nodes[0].id, id_a);
    }

    #[test]
    fn test_message_wire_format() {
        let msg: NodeMessage = serde_json::from_str(
            r#"{"command":"heartbeat","data":{"node_id":"n1","http_host":"h","http_port":1,"heartbeat_timeout":10,"rack":"r1"}}"#,
        )
        .unwrap();
        let NodeMessage::Heartbeat(info) = msg else {
            panic!("unexpected message");
        };
        assert_eq!(info.node_id.as_deref(), Some("n1"));
        assert_eq!(info.heartbeat_timeout, 10.0);
        assert_eq!(info.extra["rack"], "r1");

        let reply = NodeReply::Heartbeat(HeartbeatReply {
            status: Status::Success,
            message: "success".to_string(),
            data_nodes: BTreeMap::from([(
                2,
                NodeAddr {
                    host: "h2".to_string(),
                    port: 2,
                },
            )]),
            task: Some(Task::delete_file("f")),
        });
        let value = serde_json::to_value(&reply).unwrap();
        assert_eq!(
            value,
            serde_json::json!({
                "command": "heartbeat",
                "data": {
                    "status": "success",
                    "message": "success",
                    "data_nodes": {"2": {"http_host": "h2", "http_port": 2}},
                    "task": {"command": "delete", "name": "f"}
                }
            })
        );
        let back: NodeReply = serde_json::from_value(value).unwrap();
        assert_eq!(back, reply);
    }

    #[tokio::test]
    async fn test_tcp_session() {
        let (m, tasks, _) = membership();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(m.clone().serve(listener));

        let stream = TcpStream::connect(addr).await.unwrap();
        let (reader, mut writer) = stream.into_split();
        let mut lines = BufReader::new(reader).lines();

        writer
            .write_all(b"{\"command\":\"register\",\"data\":{\"http_host\":\"0.0.0.0\",\"http_port\":8001}}\n")
            .await
            .unwrap();
        let reply: NodeReply = serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
        let NodeReply::Register(reply) = reply else {
            panic!("unexpected reply");
        };
        let id = reply.id.unwrap();
        assert_eq!(m.live_nodes()[&id].host, "127.0.0.1");
        tasks.push(id, Task::delete_file("f"));

        let heartbeat = serde_json::to_string(&NodeMessage::Heartbeat(NodeInfo {
            node_id: reply.node_id.clone(),
            http_host: "0.0.0.0".to_string(),
            http_port: 8001,
            ..NodeInfo::default()
        }))
        .unwrap();
        writer.write_all(format!("{}\n", heartbeat).as_bytes()).await.unwrap();
        let reply: NodeReply = serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
        let NodeReply::Heartbeat(reply) = reply else {
            panic!("unexpected reply");
        };
        assert_eq!(reply.task, Some(Task::delete_file("f")));

        writer.write_all(b"garbage\n").await.unwrap();
        let reply: NodeReply = serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
        assert!(matches!(reply, NodeReply::Error(_)));

        drop(writer);
        drop(lines);
        for _ in 0..50 {
            if m.live_node_ids().is_empty() {
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }
        assert!(m.live_node_ids().is_empty());
        server.abort();
    }
}
