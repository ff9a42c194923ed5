//! Kernel bridge backed by the DLM's configfs and sysfs interfaces.
//!
//! Lockspace members are published as node directories under
//! `<configfs>/spaces/<ls>/nodes/<nodeid>`; the lockspace is stopped and
//! started through `<sysfs>/<ls>/control`, and join/leave completion is
//! acknowledged through `<sysfs>/<ls>/event_done`.

use std::collections::{BTreeSet, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use tracing::{debug, error, info, warn};

use dlm_proto::constants::{DEFAULT_NODE_WEIGHT, SYSFS_CONTROL_START, SYSFS_CONTROL_STOP};
use dlm_proto::error::{DlmError, DlmResult};
use dlm_proto::message::ResourceImage;
use dlm_proto::node::NodeId;

use super::plock_dev::PlockWriter;
use super::{KernelBridge, PlockReply};

pub struct ConfigfsBridge {
    configfs_root: PathBuf,
    sysfs_root: PathBuf,
    plock_dev: Option<PlockWriter>,
    /// Lockspaces whose join has been acknowledged to the kernel.
    joined: Mutex<HashSet<String>>,
    /// Nodes with a comms entry, as of the last membership update.
    comms: Mutex<BTreeSet<NodeId>>,
}

/// Numeric entries of a configfs directory; a missing directory is empty.
async fn read_node_ids(path: &Path) -> DlmResult<BTreeSet<NodeId>> {
    let mut nodes = BTreeSet::new();
    let mut dir = match tokio::fs::read_dir(path).await {
        Ok(dir) => dir,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(nodes),
        Err(e) => {
            error!("read {} failed: {}", path.display(), e);
            return Err(DlmError::Bridge);
        }
    };
    while let Some(entry) = dir.next_entry().await? {
        if let Some(id) = entry.file_name().to_str().and_then(|s| s.parse().ok()) {
            nodes.insert(id);
        }
    }
    Ok(nodes)
}

async fn write_value(path: &Path, value: &str) -> DlmResult<()> {
    tokio::fs::write(path, value).await.map_err(|e| {
        error!("write {} to {} failed: {}", value, path.display(), e);
        DlmError::Bridge
    })
}

async fn remove_node_dir(path: &Path) -> DlmResult<()> {
    // configfs removes attribute files with the directory; plain
    // file systems need them removed first.
    if tokio::fs::remove_dir(path).await.is_ok() {
        return Ok(());
    }
    tokio::fs::remove_dir_all(path).await.map_err(|e| {
        error!("rmdir {} failed: {}", path.display(), e);
        DlmError::Bridge
    })
}

impl ConfigfsBridge {
    pub fn new(configfs_root: PathBuf, sysfs_root: PathBuf, plock_dev: Option<PlockWriter>) -> Self {
        Self {
            configfs_root,
            sysfs_root,
            plock_dev,
            joined: Mutex::new(HashSet::new()),
            comms: Mutex::new(BTreeSet::new()),
        }
    }

    fn space_dir(&self, ls: &str) -> PathBuf {
        self.configfs_root.join("spaces").join(ls)
    }

    fn nodes_dir(&self, ls: &str) -> PathBuf {
        self.space_dir(ls).join("nodes")
    }

    fn sysfs_file(&self, ls: &str, name: &str) -> PathBuf {
        self.sysfs_root.join(ls).join(name)
    }

    async fn configured_nodes(&self, ls: &str) -> DlmResult<BTreeSet<NodeId>> {
        read_node_ids(&self.nodes_dir(ls)).await
    }

    async fn refresh_comms(&self) -> DlmResult<()> {
        let comms = read_node_ids(&self.configfs_root.join("comms")).await?;
        *self.comms.lock().map_err(|_| DlmError::Bridge)? = comms;
        Ok(())
    }

    async fn add_node(&self, ls: &str, nodeid: NodeId) -> DlmResult<()> {
        let dir = self.nodes_dir(ls).join(nodeid.to_string());
        tokio::fs::create_dir_all(&dir).await.map_err(|e| {
            error!("mkdir {} failed: {}", dir.display(), e);
            DlmError::Bridge
        })?;
        write_value(&dir.join("nodeid"), &nodeid.to_string()).await?;
        write_value(&dir.join("weight"), &self.get_weight(nodeid).to_string()).await
    }

    async fn remove_lockspace(&self, ls: &str) -> DlmResult<()> {
        for nodeid in self.configured_nodes(ls).await? {
            remove_node_dir(&self.nodes_dir(ls).join(nodeid.to_string())).await?;
        }
        let space = self.space_dir(ls);
        if tokio::fs::metadata(&space).await.is_ok() {
            remove_node_dir(&space).await?;
        }
        let was_joined = self.joined.lock().map_err(|_| DlmError::Bridge)?.remove(ls);
        if was_joined && tokio::fs::metadata(self.sysfs_root.join(ls)).await.is_ok() {
            write_value(&self.sysfs_file(ls, "event_done"), "0").await?;
        }
        info!("{} removed from kernel", ls);
        Ok(())
    }

    fn is_joined(&self, ls: &str) -> DlmResult<bool> {
        Ok(self.joined.lock().map_err(|_| DlmError::Bridge)?.contains(ls))
    }
}

#[async_trait]
impl KernelBridge for ConfigfsBridge {
    fn name(&self) -> &str {
        "configfs"
    }

    async fn apply_membership(
        &self,
        ls: &str,
        global_id: u32,
        members: &[NodeId],
        renew: &[NodeId],
    ) -> DlmResult<()> {
        if members.is_empty() {
            return self.remove_lockspace(ls).await;
        }

        self.refresh_comms().await?;
        let current = self.configured_nodes(ls).await?;
        let wanted: BTreeSet<NodeId> = members.iter().copied().collect();

        for &nodeid in current.difference(&wanted) {
            debug!("{} remove node {}", ls, nodeid);
            remove_node_dir(&self.nodes_dir(ls).join(nodeid.to_string())).await?;
        }
        for &nodeid in renew.iter().filter(|n| current.contains(n)) {
            debug!("{} renew node {}", ls, nodeid);
            remove_node_dir(&self.nodes_dir(ls).join(nodeid.to_string())).await?;
            self.add_node(ls, nodeid).await?;
        }
        for &nodeid in wanted.difference(&current) {
            debug!("{} add node {}", ls, nodeid);
            if !self.is_cluster_member(nodeid) {
                warn!("{} node {} has no comms configuration", ls, nodeid);
            }
            self.add_node(ls, nodeid).await?;
        }

        if !self.is_joined(ls)? {
            write_value(&self.sysfs_file(ls, "id"), &global_id.to_string()).await?;
        }
        Ok(())
    }

    async fn apply_plock_state(&self, ls: &str, resources: &[ResourceImage]) -> DlmResult<()> {
        // Plock state lives entirely in user space.
        debug!("{} plock state installed: {} resources", ls, resources.len());
        Ok(())
    }

    async fn notify_started(&self, ls: &str, change_seq: u32) -> DlmResult<()> {
        write_value(&self.sysfs_file(ls, "control"), &SYSFS_CONTROL_START.to_string()).await?;
        let first = self.joined.lock().map_err(|_| DlmError::Bridge)?.insert(ls.to_string());
        if first {
            write_value(&self.sysfs_file(ls, "event_done"), "0").await?;
            info!("{} join complete", ls);
        }
        debug!("{} kernel started for change {}", ls, change_seq);
        Ok(())
    }

    async fn notify_stopped(&self, ls: &str) -> DlmResult<()> {
        write_value(&self.sysfs_file(ls, "control"), &SYSFS_CONTROL_STOP.to_string()).await
    }

    async fn plock_result(&self, ls: &str, reply: &PlockReply) -> DlmResult<()> {
        match &self.plock_dev {
            Some(dev) => dev.write_reply(reply).await,
            None => {
                debug!("{} no plock device for reply", ls);
                Ok(())
            }
        }
    }

    fn get_weight(&self, _nodeid: NodeId) -> u32 {
        DEFAULT_NODE_WEIGHT
    }

    fn is_cluster_member(&self, nodeid: NodeId) -> bool {
        self.comms.lock().map_or(false, |c| c.contains(&nodeid))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (tempfile::TempDir, ConfigfsBridge) {
        let dir = tempfile::tempdir().unwrap();
        let configfs = dir.path().join("config");
        let sysfs = dir.path().join("sys");
        std::fs::create_dir_all(configfs.join("comms/2")).unwrap();
        std::fs::create_dir_all(sysfs.join("gfs0")).unwrap();
        let bridge = ConfigfsBridge::new(configfs, sysfs, None);
        (dir, bridge)
    }

    fn read(dir: &tempfile::TempDir, rel: &str) -> String {
        std::fs::read_to_string(dir.path().join(rel)).unwrap()
    }

    #[tokio::test]
    async fn test_membership_dirs() {
        let (dir, bridge) = setup();
        bridge.apply_membership("gfs0", 77, &[1, 2], &[]).await.unwrap();
        assert_eq!(read(&dir, "config/spaces/gfs0/nodes/2/nodeid"), "2");
        assert_eq!(read(&dir, "config/spaces/gfs0/nodes/1/weight"), "1");
        assert_eq!(read(&dir, "sys/gfs0/id"), "77");

        bridge.apply_membership("gfs0", 77, &[2, 3], &[]).await.unwrap();
        assert_eq!(
            bridge.configured_nodes("gfs0").await.unwrap(),
            [2, 3].into_iter().collect()
        );
    }

    #[tokio::test]
    async fn test_renew_recreates_node() {
        let (dir, bridge) = setup();
        bridge.apply_membership("gfs0", 77, &[1, 2], &[]).await.unwrap();
        std::fs::write(dir.path().join("config/spaces/gfs0/nodes/2/marker"), "x").unwrap();
        bridge.apply_membership("gfs0", 77, &[1, 2], &[2]).await.unwrap();
        assert!(!dir.path().join("config/spaces/gfs0/nodes/2/marker").exists());
        assert_eq!(read(&dir, "config/spaces/gfs0/nodes/2/nodeid"), "2");
    }

    #[tokio::test]
    async fn test_start_stop_and_leave() {
        let (dir, bridge) = setup();
        bridge.apply_membership("gfs0", 77, &[1], &[]).await.unwrap();
        bridge.notify_stopped("gfs0").await.unwrap();
        assert_eq!(read(&dir, "sys/gfs0/control"), "0");
        bridge.notify_started("gfs0", 1).await.unwrap();
        assert_eq!(read(&dir, "sys/gfs0/control"), "1");
        assert_eq!(read(&dir, "sys/gfs0/event_done"), "0");

        std::fs::remove_file(dir.path().join("sys/gfs0/event_done")).unwrap();
        bridge.notify_started("gfs0", 2).await.unwrap();
        assert!(!dir.path().join("sys/gfs0/event_done").exists());

        bridge.apply_membership("gfs0", 77, &[], &[]).await.unwrap();
        assert!(!dir.path().join("config/spaces/gfs0").exists());
        assert_eq!(read(&dir, "sys/gfs0/event_done"), "0");
    }

    #[tokio::test]
    async fn test_missing_sysfs_is_bridge_error() {
        let (_dir, bridge) = setup();
        assert_eq!(bridge.notify_stopped("nope").await, Err(DlmError::Bridge));
    }

    #[tokio::test]
    async fn test_cluster_member() {
        let (dir, bridge) = setup();
        assert!(!bridge.is_cluster_member(2));
        bridge.apply_membership("gfs0", 77, &[1, 2], &[]).await.unwrap();
        assert!(bridge.is_cluster_member(2));
        assert!(!bridge.is_cluster_member(3));

        std::fs::create_dir_all(dir.path().join("config/comms/3")).unwrap();
        bridge.apply_membership("gfs0", 77, &[1, 2, 3], &[]).await.unwrap();
        assert!(bridge.is_cluster_member(3));
    }
}
