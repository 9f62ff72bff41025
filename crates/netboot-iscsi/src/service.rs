//! Facade exposing the iSCSI subsystem as non-failing calls.
//!
//! Every public operation returns an [`OperationResult`]; errors are
//! converted at this boundary and never propagate to the caller.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::IscsiConfig;
use crate::error::{ErrorKind, IscsiError, IscsiResult};
use crate::lifecycle::ImageLifecycle;
use crate::linkage::{DeviceLinkage, LinkOutcome};
use crate::locks::NameLocks;
use crate::model::{
    normalize_mac, BootLogEntry, Device, DeviceType, DeviceUpdate, Image, ImageStatus, TransferState,
};
use crate::registrar::{RestoreOutcome, TargetRegistrar};
use crate::runner::CommandRunner;
use crate::stall::{transition, Observation, StallEvent, StallState};
use crate::store::RecordStore;
use crate::telemetry::{ConnectionEstimate, ConnectionTelemetry};

/// Boot log tag for events not tied to a device.
pub const SYSTEM_LOG_TAG: &str = "system";

/// Structured result of a facade call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(bound(deserialize = "T: Deserialize<'de>"))]
pub struct OperationResult<T> {
    /// True if the operation succeeded.
    pub success: bool,
    /// Error text, verbatim for operator diagnosis.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Stable error classification.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    /// Payload on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
}

impl<T> OperationResult<T> {
    /// A successful result.
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            error: None,
            error_kind: None,
            data: Some(data),
        }
    }

    /// A failed result.
    pub fn err(error: &IscsiError) -> Self {
        Self {
            success: false,
            error: Some(error.to_string()),
            error_kind: Some(error.kind()),
            data: None,
        }
    }

    /// Transforms the payload, keeping the outcome and error untouched.
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> OperationResult<U> {
        OperationResult {
            success: self.success,
            error: self.error,
            error_kind: self.error_kind,
            data: self.data.map(f),
        }
    }
}

impl<T> From<IscsiResult<T>> for OperationResult<T> {
    fn from(result: IscsiResult<T>) -> Self {
        match result {
            Ok(data) => Self::ok(data),
            Err(e) => {
                if e.is_user_facing() {
                    info!(kind = ?e.kind(), "operation rejected: {}", e);
                } else {
                    warn!(kind = ?e.kind(), "operation failed: {}", e);
                }
                Self::err(&e)
            }
        }
    }
}

/// Telemetry for one image plus the stall detector's view of its device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageMetrics {
    /// Image name.
    pub image: String,
    /// Target IQN.
    pub target_name: String,
    /// Linked device, if any.
    pub assigned_to: Option<String>,
    /// Connection estimate.
    pub connection: ConnectionEstimate,
    /// Stall state of the linked device.
    pub stall_state: Option<StallState>,
    /// Seconds since the last byte growth.
    pub stall_seconds: Option<u64>,
    /// Events emitted by this poll.
    pub events: Vec<StallEvent>,
    /// Updated transfer state of the linked device.
    pub transfer: Option<TransferState>,
}

/// What a booting device should do.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum CheckIn {
    /// Boot from the linked iSCSI image.
    BootImage {
        /// Image name.
        image: String,
        /// Target IQN.
        target_name: String,
        /// iPXE sanboot URL.
        san_url: String,
    },
    /// Known device without an image: boot its default profile.
    BootDefault {
        /// Registered device type.
        device_type: DeviceType,
        /// Kernel set to serve.
        kernel_set: String,
    },
    /// Unknown device: present the interactive menu.
    ShowMenu,
}

/// Entry point for image lifecycle, linkage, telemetry and device records.
pub struct IscsiService {
    config: Arc<IscsiConfig>,
    store: Arc<dyn RecordStore>,
    registrar: Arc<TargetRegistrar>,
    lifecycle: ImageLifecycle,
    linkage: DeviceLinkage,
    telemetry: ConnectionTelemetry,
    locks: Arc<NameLocks>,
}

impl IscsiService {
    /// Wires the subsystem over a command runner and a record store.
    pub fn new(
        config: IscsiConfig,
        runner: Arc<dyn CommandRunner>,
        store: Arc<dyn RecordStore>,
    ) -> Self {
        let config = Arc::new(config);
        let locks = Arc::new(NameLocks::new());
        let registrar = Arc::new(TargetRegistrar::new(runner.clone(), config.clone()));
        let lifecycle = ImageLifecycle::new(
            config.clone(),
            store.clone(),
            registrar.clone(),
            locks.clone(),
        );
        let linkage = DeviceLinkage::new(config.clone(), store.clone(), locks.clone());
        let telemetry = ConnectionTelemetry::new(registrar.clone(), runner, config.clone());
        Self {
            config,
            store,
            registrar,
            lifecycle,
            linkage,
            telemetry,
            locks,
        }
    }

    /// Active configuration.
    pub fn config(&self) -> &IscsiConfig {
        &self.config
    }

    fn log_event(&self, mac: &str, event: &str, details: impl Into<String>, ip: &str) {
        if let Err(e) = self
            .store
            .append_boot_log(BootLogEntry::new(mac, event, details, ip))
        {
            warn!(mac, event, "could not append boot log: {}", e);
        }
    }

    /// Re-registers all persisted images and records the outcome on each.
    pub async fn restore_all(&self) -> OperationResult<Vec<RestoreOutcome>> {
        self.restore_all_inner().await.into()
    }

    async fn restore_all_inner(&self) -> IscsiResult<Vec<RestoreOutcome>> {
        let _linkage = self.locks.lock_linkage().await;
        let images = self.store.list_images()?;
        let outcomes = self.registrar.restore_all(&images).await;

        for (image, outcome) in images.iter().zip(&outcomes) {
            let mut updated = image.clone();
            match outcome {
                RestoreOutcome::Restored { target_id, .. } => {
                    updated.target_id = Some(*target_id);
                    updated.status = if image.is_linked() {
                        ImageStatus::Linked
                    } else {
                        ImageStatus::Available
                    };
                }
                RestoreOutcome::MissingFile { .. } | RestoreOutcome::Failed { .. } => {
                    updated.target_id = None;
                    if image.is_linked() {
                        warn!(image = %image.name, "linked image could not be restored");
                    } else {
                        updated.status = ImageStatus::Unregistered;
                    }
                }
            }
            if &updated != image {
                self.store.put_image(&updated)?;
            }
        }

        let restored = outcomes
            .iter()
            .filter(|o| matches!(o, RestoreOutcome::Restored { .. }))
            .count();
        self.log_event(
            SYSTEM_LOG_TAG,
            "iscsi_restore",
            format!("restored {} of {} targets", restored, outcomes.len()),
            "",
        );
        Ok(outcomes)
    }

    /// Creates a sparse image of `size_gb` and registers its target.
    pub async fn create_image(&self, name: &str, size_gb: u64) -> OperationResult<Image> {
        let result = self.lifecycle.create(name, size_gb).await;
        if let Ok(image) = &result {
            self.log_event(
                SYSTEM_LOG_TAG,
                "iscsi_create",
                format!("created {} ({} GB)", image.name, image.size_gb),
                "",
            );
        }
        result.into()
    }

    /// Deletes an image; missing parts are ignored.
    pub async fn delete_image(&self, name: &str) -> OperationResult<()> {
        let result = self.lifecycle.delete(name).await;
        if result.is_ok() {
            self.log_event(SYSTEM_LOG_TAG, "iscsi_delete", format!("deleted {}", name), "");
        }
        result.into()
    }

    /// Sparse-copies an image under a new name.
    pub async fn copy_image(&self, source: &str, dest: &str) -> OperationResult<Image> {
        let result = self.lifecycle.copy(source, dest).await;
        if result.is_ok() {
            self.log_event(
                SYSTEM_LOG_TAG,
                "iscsi_copy",
                format!("copied {} to {}", source, dest),
                "",
            );
        }
        result.into()
    }

    /// Renames an image, keeping its link.
    pub async fn rename_image(&self, source: &str, dest: &str) -> OperationResult<Image> {
        let result = self.lifecycle.rename(source, dest).await;
        if result.is_ok() {
            self.log_event(
                SYSTEM_LOG_TAG,
                "iscsi_rename",
                format!("renamed {} to {}", source, dest),
                "",
            );
        }
        result.into()
    }

    /// Links an image to a device.
    pub async fn link_device(&self, image: &str, mac: &str) -> OperationResult<LinkOutcome> {
        let result = self.linkage.link(image, mac).await;
        if let Ok(outcome) = &result {
            if !outcome.already_linked {
                self.log_event(&outcome.mac, "iscsi_link", format!("linked to {}", image), "");
            }
        }
        result.into()
    }

    /// Clears a device's link; succeeds if there was none.
    pub async fn unlink_device(&self, mac: &str) -> OperationResult<Option<String>> {
        let result = self.linkage.unlink(mac).await;
        if let Ok(Some(image)) = &result {
            let mac = normalize_mac(mac).unwrap_or_else(|_| mac.to_string());
            self.log_event(&mac, "iscsi_unlink", format!("unlinked from {}", image), "");
        }
        result.into()
    }

    /// All images, sorted by name.
    pub fn list_images(&self) -> OperationResult<Vec<Image>> {
        self.store
            .list_images()
            .map(|mut images| {
                images.sort_by(|a, b| a.name.cmp(&b.name));
                images
            })
            .into()
    }

    /// One image by name.
    pub fn get_image(&self, name: &str) -> OperationResult<Image> {
        self.store
            .get_image(name)
            .and_then(|image| image.ok_or_else(|| IscsiError::image_not_found(name)))
            .into()
    }

    /// The image linked to `mac`, if any.
    pub fn image_for_device(&self, mac: &str) -> OperationResult<Option<Image>> {
        self.linkage.image_for_device(mac).into()
    }

    /// Connection estimate for an image, fed through the stall detector of its device.
    pub async fn get_image_connection_metrics(&self, image_id: &str) -> OperationResult<ImageMetrics> {
        self.metrics_at(image_id, Utc::now()).await.into()
    }

    /// As [`Self::get_image_connection_metrics`] with an explicit poll time.
    pub async fn get_image_connection_metrics_at(
        &self,
        image_id: &str,
        at: DateTime<Utc>,
    ) -> OperationResult<ImageMetrics> {
        self.metrics_at(image_id, at).await.into()
    }

    async fn metrics_at(&self, image_id: &str, at: DateTime<Utc>) -> IscsiResult<ImageMetrics> {
        let image = self
            .store
            .get_image(image_id)?
            .ok_or_else(|| IscsiError::image_not_found(image_id))?;
        let connection = self.telemetry.estimate(&image).await;

        let mut metrics = ImageMetrics {
            image: image.name.clone(),
            target_name: image.target_name.clone(),
            assigned_to: image.assigned_to.clone(),
            connection,
            stall_state: None,
            stall_seconds: None,
            events: Vec::new(),
            transfer: None,
        };
        let Some(mac) = image.assigned_to.clone() else {
            return Ok(metrics);
        };

        let connection = &metrics.connection;
        let observation = Observation {
            active: connection.active,
            confidence: connection.attribution_confidence,
            total_bytes: connection.total_bytes(),
            at,
        };
        let stall_config = self.config.stall_config();
        let mut events = Vec::new();
        let mut stall_seconds = None;
        let state = self.store.update_transfer(&mac, &mut |state| {
            let outcome = transition(&state.stall, &observation, &stall_config);
            state.stall = outcome.tracker;
            if connection.active {
                state.iscsi_requests = state.iscsi_requests.saturating_add(1);
                if let [ip] = connection.remote_ips.as_slice() {
                    state.last_remote_ip = Some(ip.to_string());
                }
            }
            if let Some(counters) = connection.bytes().actionable() {
                state.iscsi_tx_bytes = counters.tx_bytes;
                state.iscsi_rx_bytes = counters.rx_bytes;
            }
            events = outcome.events;
            stall_seconds = outcome.stall_seconds;
        })?;

        let ip = state.last_remote_ip.clone().unwrap_or_default();
        for event in &events {
            self.emit_stall_event(&mac, &image.name, event, &ip);
        }

        metrics.stall_state = Some(state.stall.stall_state);
        metrics.stall_seconds = stall_seconds;
        metrics.events = events;
        metrics.transfer = Some(state);
        Ok(metrics)
    }

    fn emit_stall_event(&self, mac: &str, image: &str, event: &StallEvent, ip: &str) {
        match event {
            StallEvent::Progress {
                delta_bytes,
                total_bytes,
            } => {
                info!(mac, image, delta_bytes, total_bytes, "iscsi transfer progress");
                self.log_event(
                    mac,
                    "iscsi_progress",
                    format!("+{} bytes, {} total", delta_bytes, total_bytes),
                    ip,
                );
            }
            StallEvent::Stalled {
                stall_seconds,
                total_bytes,
            } => {
                warn!(mac, image, stall_seconds, total_bytes, "iscsi transfer stalled");
                self.log_event(
                    mac,
                    "iscsi_stalled",
                    format!("no progress for {}s at {} bytes", stall_seconds, total_bytes),
                    ip,
                );
            }
            StallEvent::Resumed {
                stalled_seconds,
                total_bytes,
            } => {
                info!(mac, image, stalled_seconds, total_bytes, "iscsi transfer resumed");
                self.log_event(
                    mac,
                    "iscsi_resumed",
                    format!("resumed after {}s at {} bytes", stalled_seconds, total_bytes),
                    ip,
                );
            }
        }
    }

    /// Starts a fresh install session for `mac`.
    pub fn reset_device_transfer(&self, mac: &str) -> OperationResult<TransferState> {
        normalize_mac(mac)
            .and_then(|mac| {
                let fresh = TransferState::new_session(&mac);
                let state = self
                    .store
                    .update_transfer(&mac, &mut |state| *state = fresh.clone())?;
                self.log_event(&mac, "transfer_reset", format!("session {}", state.session_id), "");
                Ok(state)
            })
            .into()
    }

    /// Current transfer state of `mac`.
    pub fn get_device_transfer(&self, mac: &str) -> OperationResult<TransferState> {
        normalize_mac(mac)
            .and_then(|mac| {
                self.store.get_transfer(&mac)?.ok_or(IscsiError::NotFound {
                    what: "transfer state",
                    name: mac,
                })
            })
            .into()
    }

    /// Adds HTTP bytes served to `mac` to its transfer counters.
    pub fn record_http_transfer(
        &self,
        mac: &str,
        bytes: u64,
        path: &str,
        remote_ip: &str,
    ) -> OperationResult<TransferState> {
        normalize_mac(mac)
            .and_then(|mac| {
                self.store.update_transfer(&mac, &mut |state| {
                    state.http_tx_bytes = state.http_tx_bytes.saturating_add(bytes);
                    state.http_requests = state.http_requests.saturating_add(1);
                    state.last_path = Some(path.to_string());
                    if !remote_ip.is_empty() {
                        state.last_remote_ip = Some(remote_ip.to_string());
                    }
                })
            })
            .into()
    }

    /// Registers a device explicitly.
    pub fn register_device(
        &self,
        mac: &str,
        device_type: DeviceType,
        name: &str,
    ) -> OperationResult<Device> {
        normalize_mac(mac)
            .and_then(|mac| {
                if self.store.get_device(&mac)?.is_some() {
                    return Err(IscsiError::AlreadyExists {
                        what: "device",
                        name: mac,
                    });
                }
                let mut device = Device::minimal(&mac);
                device.device_type = device_type;
                if !name.trim().is_empty() {
                    device.name = name.trim().to_string();
                }
                self.store.put_device(&device)?;
                self.log_event(&mac, "device_registered", format!("{:?} {}", device_type, device.name), "");
                Ok(device)
            })
            .into()
    }

    /// One device by MAC.
    pub fn get_device(&self, mac: &str) -> OperationResult<Device> {
        normalize_mac(mac)
            .and_then(|mac| {
                self.store.get_device(&mac)?.ok_or(IscsiError::NotFound {
                    what: "device",
                    name: mac,
                })
            })
            .into()
    }

    /// Changes a device's name, type, enabled flag or kernel set.
    pub async fn update_device(&self, mac: &str, update: &DeviceUpdate) -> OperationResult<Device> {
        let result = self.linkage.update_device(mac, update).await;
        if let Ok(device) = &result {
            self.log_event(
                &device.mac,
                "device_updated",
                format!("{:?} {} enabled={}", device.device_type, device.name, device.enabled),
                "",
            );
        }
        result.into()
    }

    /// Unlinks and removes a device; returns the image it released.
    pub async fn delete_device(&self, mac: &str) -> OperationResult<Option<String>> {
        let result = self.linkage.remove_device(mac).await;
        if let Ok(released) = &result {
            let mac = normalize_mac(mac).unwrap_or_else(|_| mac.to_string());
            let details = match released {
                Some(image) => format!("removed, released {}", image),
                None => "removed".to_string(),
            };
            self.log_event(&mac, "device_deleted", details, "");
        }
        result.into()
    }

    /// All devices, sorted by MAC.
    pub fn list_devices(&self) -> OperationResult<Vec<Device>> {
        self.store.list_devices().into()
    }

    /// Decides how a booting device proceeds and logs the check-in.
    pub fn check_in(&self, mac: &str, ip: &str) -> OperationResult<CheckIn> {
        normalize_mac(mac)
            .and_then(|mac| {
                let decision = match self.store.get_device(&mac)? {
                    None => CheckIn::ShowMenu,
                    Some(device) => match self.linkage.image_for_device(&mac)? {
                        Some(image) if device.enabled && image.target_id.is_some() => {
                            CheckIn::BootImage {
                                san_url: self.config.san_url(&image.target_name),
                                image: image.name,
                                target_name: image.target_name,
                            }
                        }
                        _ => CheckIn::BootDefault {
                            device_type: device.device_type,
                            kernel_set: device.kernel_set,
                        },
                    },
                };
                let details = match &decision {
                    CheckIn::BootImage { image, .. } => format!("boot iscsi image {}", image),
                    CheckIn::BootDefault { device_type, .. } => format!("boot default {:?}", device_type),
                    CheckIn::ShowMenu => "unknown device, showing menu".to_string(),
                };
                self.log_event(&mac, "check_in", details, ip);
                Ok(decision)
            })
            .into()
    }

    /// Appends a boot log entry; MACs are normalized when they parse.
    pub fn add_boot_log(
        &self,
        mac: &str,
        event: &str,
        details: &str,
        ip: &str,
    ) -> OperationResult<BootLogEntry> {
        if event.trim().is_empty() {
            return OperationResult::err(&IscsiError::InvalidArgument(
                "event must not be empty".to_string(),
            ));
        }
        let mac = normalize_mac(mac).unwrap_or_else(|_| mac.to_string());
        let entry = BootLogEntry::new(&mac, event, details, ip);
        self.store
            .append_boot_log(entry.clone())
            .map(|_| entry)
            .into()
    }

    /// Newest-first boot log entries, optionally for one MAC.
    pub fn boot_logs(&self, mac: Option<&str>, limit: usize) -> OperationResult<Vec<BootLogEntry>> {
        let mac = mac.map(|m| normalize_mac(m).unwrap_or_else(|_| m.to_string()));
        self.store.boot_logs(mac.as_deref(), limit).into()
    }
}
