use std::path::PathBuf;

use e2e_util::{random_num, random_string, Cli, E2eResult, JsonEdit};
use serde_json::json;
use tracing::{debug, info};

use crate::cluster::delete_best_effort;
use crate::consts::{ISCSI_INITIATOR_NAME, ISCSI_PORT, ISCSI_TARGET_IQN};

/// Volume source written under `spec`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PvKind {
    #[default]
    Csi,
    Nfs,
    Iscsi,
    /// iSCSI with CHAP discovery and session authentication.
    IscsiChap,
}

#[derive(Debug, Clone)]
pub struct PersistentVolume {
    pub name: String,
    pub template: PathBuf,
    pub access_mode: String,
    pub capacity: String,
    pub driver: String,
    pub volume_handle: String,
    pub reclaim_policy: String,
    pub sc_name: String,
    pub volume_mode: String,
    pub kind: PvKind,
    pub nfs_server_ip: String,
    pub iscsi_server_ip: String,
    pub iscsi_portals: Vec<String>,
    pub secret_name: String,
}

impl Default for PersistentVolume {
    fn default() -> Self {
        Self::new()
    }
}

impl PersistentVolume {
    #[must_use]
    pub fn new() -> Self {
        Self {
            name: format!("manual-pv-{}", random_string()),
            template: PathBuf::from("csi-pv-template.yaml"),
            access_mode: "ReadWriteOnce".to_string(),
            capacity: format!("{}Gi", random_num(1, 10)),
            driver: "csi.vsphere.vmware.com".to_string(),
            volume_handle: String::new(),
            reclaim_policy: "Delete".to_string(),
            sc_name: "slow".to_string(),
            volume_mode: "Filesystem".to_string(),
            kind: PvKind::Csi,
            nfs_server_ip: String::new(),
            iscsi_server_ip: String::new(),
            iscsi_portals: Vec::new(),
            secret_name: String::new(),
        }
    }

    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    #[must_use]
    pub fn with_template(mut self, template: impl Into<PathBuf>) -> Self {
        self.template = template.into();
        self
    }

    #[must_use]
    pub fn with_access_mode(mut self, mode: impl Into<String>) -> Self {
        self.access_mode = mode.into();
        self
    }

    #[must_use]
    pub fn with_capacity(mut self, capacity: impl Into<String>) -> Self {
        self.capacity = capacity.into();
        self
    }

    #[must_use]
    pub fn with_driver(mut self, driver: impl Into<String>) -> Self {
        self.driver = driver.into();
        self
    }

    #[must_use]
    pub fn with_volume_handle(mut self, handle: impl Into<String>) -> Self {
        self.volume_handle = handle.into();
        self
    }

    #[must_use]
    pub fn with_reclaim_policy(mut self, policy: impl Into<String>) -> Self {
        self.reclaim_policy = policy.into();
        self
    }

    #[must_use]
    pub fn with_storage_class(mut self, sc_name: impl Into<String>) -> Self {
        self.sc_name = sc_name.into();
        self
    }

    #[must_use]
    pub fn with_volume_mode(mut self, mode: impl Into<String>) -> Self {
        self.volume_mode = mode.into();
        self
    }

    #[must_use]
    pub fn with_kind(mut self, kind: PvKind) -> Self {
        self.kind = kind;
        self
    }

    #[must_use]
    pub fn with_nfs_server_ip(mut self, ip: impl Into<String>) -> Self {
        self.nfs_server_ip = ip.into();
        self
    }

    #[must_use]
    pub fn with_iscsi_server_ip(mut self, ip: impl Into<String>) -> Self {
        self.iscsi_server_ip = ip.into();
        self
    }

    #[must_use]
    pub fn with_iscsi_portals(mut self, portals: Vec<String>) -> Self {
        self.iscsi_portals = portals;
        self
    }

    #[must_use]
    pub fn with_secret_name(mut self, name: impl Into<String>) -> Self {
        self.secret_name = name.into();
        self
    }

    /// The `spec` edit describing the volume source.
    #[must_use]
    pub fn volume_source_edit(&self) -> JsonEdit {
        let target_portal = format!("{}:{ISCSI_PORT}", self.iscsi_server_ip);
        let source = match self.kind {
            PvKind::Nfs => json!({
                "nfs": { "path": "/", "server": self.nfs_server_ip }
            }),
            PvKind::Iscsi => json!({
                "iscsi": {
                    "targetPortal": target_portal,
                    "iqn": ISCSI_TARGET_IQN,
                    "lun": 0,
                    "iscsiInterface": "default",
                    "fsType": "ext4",
                    "readOnly": false,
                    "initiatorName": ISCSI_INITIATOR_NAME,
                    "portals": self.iscsi_portals,
                }
            }),
            PvKind::IscsiChap => json!({
                "iscsi": {
                    "targetPortal": target_portal,
                    "iqn": ISCSI_TARGET_IQN,
                    "lun": 0,
                    "iscsiInterface": "default",
                    "fsType": "ext4",
                    "readOnly": false,
                    "initiatorName": ISCSI_INITIATOR_NAME,
                    "portals": self.iscsi_portals,
                    "chapAuthDiscovery": true,
                    "chapAuthSession": true,
                    "secretRef": { "name": self.secret_name },
                }
            }),
            PvKind::Csi => json!({
                "csi": { "driver": self.driver, "volumeHandle": self.volume_handle }
            }),
        };
        JsonEdit::set("items.0.spec.", source)
    }

    pub async fn create(&self, cli: &Cli) -> E2eResult<()> {
        self.create_with_edits(cli, Vec::new()).await
    }

    /// PVs are cluster scoped, so they are always created as admin.
    pub async fn create_with_edits(&self, cli: &Cli, mut edits: Vec<JsonEdit>) -> E2eResult<()> {
        edits.push(self.volume_source_edit());
        cli.as_admin()
            .apply_template(
                &self.template,
                &[
                    ("NAME", self.name.as_str()),
                    ("ACCESSMODE", self.access_mode.as_str()),
                    ("CAPACITY", self.capacity.as_str()),
                    ("RECLAIMPOLICY", self.reclaim_policy.as_str()),
                    ("SCNAME", self.sc_name.as_str()),
                    ("VOLUMEMODE", self.volume_mode.as_str()),
                ],
                &edits,
            )
            .await?;
        info!(
            pv = %self.name,
            kind = ?self.kind,
            capacity = %self.capacity,
            "Created persistent volume"
        );
        Ok(())
    }

    pub async fn create_with_volume_attributes_class(&self, cli: &Cli, vac: &str) -> E2eResult<()> {
        self.create_with_edits(
            cli,
            vec![JsonEdit::set(
                "items.0.spec.",
                json!({ "volumeAttributesClassName": vac }),
            )],
        )
        .await
    }

    pub async fn delete_as_admin(&self, cli: &Cli) {
        delete_best_effort(cli, "pv", &self.name, "").await;
    }

    pub async fn get_status(&self, cli: &Cli) -> E2eResult<String> {
        let status = cli
            .as_admin()
            .without_namespace()
            .run("get")
            .args(["pv", &self.name, "-o=jsonpath={.status.phase}"])
            .output()
            .await?;
        debug!(pv = %self.name, status = %status, "PV status");
        Ok(status)
    }
}

/// `spec.volumeAttributesClassName` of a PV.
pub async fn get_volume_attributes_class_from_pv(cli: &Cli, pv_name: &str) -> E2eResult<String> {
    let vac = cli
        .as_admin()
        .without_namespace()
        .run("get")
        .args(["pv", pv_name, "-o=jsonpath={.spec.volumeAttributesClassName}"])
        .output()
        .await?;
    info!(pv = pv_name, vac = %vac, "PV volume attributes class");
    Ok(vac)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_iscsi_chap_source() {
        let pv = PersistentVolume::new()
            .with_kind(PvKind::IscsiChap)
            .with_iscsi_server_ip("172.30.10.20")
            .with_secret_name("chap-secret");
        let JsonEdit::Set { path, values } = pv.volume_source_edit() else {
            panic!("expected a set edit");
        };
        assert_eq!(path, "items.0.spec.");
        assert_eq!(values["iscsi"]["targetPortal"], "172.30.10.20:3260");
        assert_eq!(values["iscsi"]["iqn"], ISCSI_TARGET_IQN);
        assert_eq!(values["iscsi"]["chapAuthSession"], true);
        assert_eq!(values["iscsi"]["secretRef"]["name"], "chap-secret");
    }

    #[test]
    fn test_nfs_source() {
        let pv = PersistentVolume::new()
            .with_kind(PvKind::Nfs)
            .with_nfs_server_ip("10.0.0.5");
        let JsonEdit::Set { values, .. } = pv.volume_source_edit() else {
            panic!("expected a set edit");
        };
        assert_eq!(values, json!({"nfs": {"path": "/", "server": "10.0.0.5"}}));
    }

    #[test]
    fn test_default_capacity_in_range() {
        let pv = PersistentVolume::new();
        let size: i64 = pv.capacity.trim_end_matches("Gi").parse().unwrap();
        assert!((1..=10).contains(&size));
        assert!(pv.name.starts_with("manual-pv-"));
    }
}
