//! Persisted records: images, devices, per-device transfer state and boot log entries.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{IscsiError, IscsiResult};
use crate::stall::StallTracker;

/// Size unit used for image allocation (GiB).
pub const BYTES_PER_GB: u64 = 1024 * 1024 * 1024;

/// Maximum accepted image name length.
pub const MAX_IMAGE_NAME_LEN: usize = 128;

/// Registration state of an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageStatus {
    /// Registered with the daemon and not linked to a device.
    Available,
    /// Registered and linked to exactly one device.
    Linked,
    /// Persisted, but the daemon registration could not be restored.
    Unregistered,
}

/// A backing image file exposed as an iSCSI target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Image {
    /// Record key; always equal to `name`.
    pub id: String,
    /// Logical image name.
    pub name: String,
    /// Size in GiB.
    pub size_gb: u64,
    /// IQN of the target exposing this image.
    pub target_name: String,
    /// Daemon-local target id at the time of the last registration.
    pub target_id: Option<u32>,
    /// Backing file path.
    pub file_path: PathBuf,
    /// MAC address of the linked device.
    pub assigned_to: Option<String>,
    /// Registration state.
    pub status: ImageStatus,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Source image name, for images produced by a copy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub copied_from: Option<String>,
}

impl Image {
    /// True if the image is linked to a device.
    pub fn is_linked(&self) -> bool {
        self.assigned_to.is_some()
    }
}

/// Hardware class of a network-booting device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    /// Raspberry Pi.
    Raspi,
    /// 32-bit x86 PC.
    X86,
    /// 64-bit x86 PC.
    X64,
}

impl std::str::FromStr for DeviceType {
    type Err = IscsiError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "raspi" => Ok(DeviceType::Raspi),
            "x86" => Ok(DeviceType::X86),
            "x64" => Ok(DeviceType::X64),
            other => Err(IscsiError::InvalidArgument(format!(
                "unknown device type: {}",
                other
            ))),
        }
    }
}

fn default_kernel_set() -> String {
    "default".to_string()
}

/// A physical device identified by its MAC address.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    /// Normalized MAC address.
    pub mac: String,
    /// Hardware class.
    pub device_type: DeviceType,
    /// Display name.
    pub name: String,
    /// Linked image, if any.
    pub image_id: Option<String>,
    /// Whether the device may boot.
    pub enabled: bool,
    /// Kernel set used when booting without an image.
    #[serde(default = "default_kernel_set")]
    pub kernel_set: String,
    /// Registration time.
    pub created_at: DateTime<Utc>,
}

impl Device {
    /// Minimal record for a device first seen through a link.
    pub fn minimal(mac: &str) -> Self {
        Self {
            mac: mac.to_string(),
            device_type: DeviceType::X64,
            name: mac.to_string(),
            image_id: None,
            enabled: true,
            kernel_set: default_kernel_set(),
            created_at: Utc::now(),
        }
    }
}

/// Partial device profile update; `None` fields are left unchanged.
///
/// The linked image is not part of the profile and only changes through
/// link and unlink.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceUpdate {
    /// New display name.
    pub name: Option<String>,
    /// New hardware class.
    pub device_type: Option<DeviceType>,
    /// Allow or block booting.
    pub enabled: Option<bool>,
    /// New kernel set.
    pub kernel_set: Option<String>,
}

impl DeviceUpdate {
    /// Applies the set fields to `device`; blank names and kernel sets are rejected.
    pub fn apply(&self, device: &mut Device) -> IscsiResult<()> {
        let name = non_blank(self.name.as_deref(), "name")?;
        let kernel_set = non_blank(self.kernel_set.as_deref(), "kernel_set")?;
        if let Some(name) = name {
            device.name = name;
        }
        if let Some(kernel_set) = kernel_set {
            device.kernel_set = kernel_set;
        }
        if let Some(device_type) = self.device_type {
            device.device_type = device_type;
        }
        if let Some(enabled) = self.enabled {
            device.enabled = enabled;
        }
        Ok(())
    }
}

fn non_blank(value: Option<&str>, field: &str) -> IscsiResult<Option<String>> {
    match value.map(str::trim) {
        Some("") => Err(IscsiError::InvalidArgument(format!("{} must not be empty", field))),
        other => Ok(other.map(str::to_string)),
    }
}

/// Per-device install session counters and stall tracking.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferState {
    /// Normalized MAC address.
    pub mac: String,
    /// Identifier of the current install session.
    pub session_id: String,
    /// Bytes served over HTTP (installer media).
    pub http_tx_bytes: u64,
    /// HTTP requests served.
    pub http_requests: u64,
    /// Last attributed iSCSI bytes sent by the server.
    pub iscsi_tx_bytes: u64,
    /// Last attributed iSCSI bytes received by the server.
    #[serde(default)]
    pub iscsi_rx_bytes: u64,
    /// Telemetry polls that observed an active session.
    pub iscsi_requests: u64,
    /// Last HTTP path served.
    pub last_path: Option<String>,
    /// Last remote address seen for this device.
    pub last_remote_ip: Option<String>,
    /// Start of the current session.
    pub session_started_at: DateTime<Utc>,
    /// Stall detector memory.
    #[serde(flatten)]
    pub stall: StallTracker,
}

impl TransferState {
    /// Fresh state for a new install session.
    pub fn new_session(mac: &str) -> Self {
        Self {
            mac: mac.to_string(),
            session_id: uuid::Uuid::new_v4().to_string(),
            http_tx_bytes: 0,
            http_requests: 0,
            iscsi_tx_bytes: 0,
            iscsi_rx_bytes: 0,
            iscsi_requests: 0,
            last_path: None,
            last_remote_ip: None,
            session_started_at: Utc::now(),
            stall: StallTracker::default(),
        }
    }
}

/// A boot or management event recorded for operator diagnosis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BootLogEntry {
    /// Event time.
    pub timestamp: DateTime<Utc>,
    /// Device MAC, or a caller tag such as `webui`.
    pub mac: String,
    /// Event name.
    pub event: String,
    /// Free-text details.
    pub details: String,
    /// Remote address, if known.
    #[serde(default)]
    pub ip: String,
}

impl BootLogEntry {
    /// New entry stamped with the current time.
    pub fn new(mac: &str, event: &str, details: impl Into<String>, ip: &str) -> Self {
        Self {
            timestamp: Utc::now(),
            mac: mac.to_string(),
            event: event.to_string(),
            details: details.into(),
            ip: ip.to_string(),
        }
    }
}

/// Normalizes a MAC address to lowercase colon-separated form.
///
/// Accepts `:` or `-` separators, or twelve bare hex digits.
pub fn normalize_mac(mac: &str) -> IscsiResult<String> {
    let hex: String = mac
        .trim()
        .chars()
        .filter(|c| *c != ':' && *c != '-')
        .collect();
    if hex.len() != 12 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(IscsiError::InvalidArgument(format!(
            "invalid MAC address: {}",
            mac
        )));
    }
    let hex = hex.to_ascii_lowercase();
    let parts: Vec<&str> = (0..6).map(|i| &hex[i * 2..i * 2 + 2]).collect();
    Ok(parts.join(":"))
}

/// Validates an image name for use as a file stem and IQN suffix.
pub fn validate_image_name(name: &str) -> IscsiResult<()> {
    if name.is_empty() || name.len() > MAX_IMAGE_NAME_LEN {
        return Err(IscsiError::InvalidArgument(format!(
            "image name must be 1-{} characters",
            MAX_IMAGE_NAME_LEN
        )));
    }
    if name.starts_with('.') || name.starts_with('-') {
        return Err(IscsiError::InvalidArgument(format!(
            "image name must not start with '.' or '-': {}",
            name
        )));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
    {
        return Err(IscsiError::InvalidArgument(format!(
            "image name may only contain letters, digits, '-', '_' and '.': {}",
            name
        )));
    }
    Ok(())
}

/// Converts a byte length to whole GiB, rounding up.
pub fn bytes_to_gb_ceil(bytes: u64) -> u64 {
    bytes.div_ceil(BYTES_PER_GB)
}
