//! Subsystem settings: image and data paths, target naming, command timeouts and stall thresholds.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::stall::StallConfig;

/// Settings for the image store, the target daemon and stall detection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IscsiConfig {
    /// Directory holding `<name>.img` backing files.
    pub images_dir: PathBuf,
    /// Directory for persisted records.
    pub data_dir: PathBuf,
    /// IQN prefix; targets are named `<prefix>:<image>`.
    pub iqn_prefix: String,
    /// Address clients use to reach the target daemon.
    pub boot_server_ip: String,
    /// iSCSI service port.
    pub iscsi_port: u16,
    /// Path of the tgtadm binary.
    pub tgtadm_path: String,
    /// Path of the ss binary.
    pub ss_path: String,
    /// Timeout applied to every external command.
    pub command_timeout_secs: u64,
    /// Seconds without byte growth before a session is reported stalled.
    pub stall_threshold_secs: u64,
    /// Minimum seconds between progress log events per device.
    pub progress_log_interval_secs: u64,
    /// Initiator mask bound to every new target.
    pub initiator_address: String,
    /// Upper bound accepted by create.
    pub max_image_size_gb: u64,
}

impl Default for IscsiConfig {
    fn default() -> Self {
        Self {
            images_dir: PathBuf::from("/iscsi-images"),
            data_dir: PathBuf::from("/data"),
            iqn_prefix: String::from("iqn.2024-01.local.netboot"),
            boot_server_ip: String::from("192.168.1.50"),
            iscsi_port: 3260,
            tgtadm_path: String::from("tgtadm"),
            ss_path: String::from("ss"),
            command_timeout_secs: 10,
            stall_threshold_secs: 180,
            progress_log_interval_secs: 60,
            initiator_address: String::from("ALL"),
            max_image_size_gb: 2048,
        }
    }
}

impl IscsiConfig {
    /// Config rooted at a single directory, used by tests and local runs.
    pub fn with_root(root: &Path) -> Self {
        Self {
            images_dir: root.join("images"),
            data_dir: root.join("data"),
            ..Self::default()
        }
    }

    /// Applies `BOOT_SERVER_IP`, `IMAGES_PATH` and `DATA_PATH` overrides.
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(ip) = lookup("BOOT_SERVER_IP").filter(|v| !v.is_empty()) {
            self.boot_server_ip = ip;
        }
        if let Some(path) = lookup("IMAGES_PATH").filter(|v| !v.is_empty()) {
            self.images_dir = PathBuf::from(path);
        }
        if let Some(path) = lookup("DATA_PATH").filter(|v| !v.is_empty()) {
            self.data_dir = PathBuf::from(path);
        }
    }

    /// Timeout for a single external command.
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs.max(1))
    }

    /// Stall detector thresholds.
    pub fn stall_config(&self) -> StallConfig {
        StallConfig {
            stall_threshold_secs: self.stall_threshold_secs,
            progress_log_interval_secs: self.progress_log_interval_secs,
        }
    }

    /// IQN for an image name.
    pub fn target_name_for(&self, image_name: &str) -> String {
        format!("{}:{}", self.iqn_prefix, image_name)
    }

    /// Backing file path for an image name.
    pub fn image_path(&self, image_name: &str) -> PathBuf {
        self.images_dir.join(format!("{}.img", image_name))
    }

    /// iPXE sanboot URL for a target.
    pub fn san_url(&self, target_name: &str) -> String {
        format!("iscsi:{}::::{}", self.boot_server_ip, target_name)
    }
}
