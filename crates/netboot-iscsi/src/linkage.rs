//! One-to-one device/image linkage.
//!
//! The functions here are the only writers of `Image::assigned_to` and
//! `Device::image_id`. Callers hold the linkage lock from [`NameLocks`]
//! while any of them run.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::IscsiConfig;
use crate::error::{IscsiError, IscsiResult};
use crate::locks::NameLocks;
use crate::model::{normalize_mac, validate_image_name, Device, DeviceUpdate, Image, ImageStatus};
use crate::store::RecordStore;

/// What a caller needs to build a boot URL after linking.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkOutcome {
    /// Linked image.
    pub image: String,
    /// Normalized MAC.
    pub mac: String,
    /// Target IQN.
    pub target_name: String,
    /// Address of the target daemon.
    pub boot_server_ip: String,
    /// iPXE sanboot URL.
    pub san_url: String,
    /// True if the link already existed.
    pub already_linked: bool,
}

/// Clears the assignment of `image` and the matching device pointer.
///
/// Caller holds the linkage lock.
pub(crate) fn release_locked(store: &dyn RecordStore, image: &Image) -> IscsiResult<Image> {
    let mut released = image.clone();
    released.assigned_to = None;
    if released.status == ImageStatus::Linked {
        released.status = ImageStatus::Available;
    }
    store.put_image(&released)?;

    if let Some(mac) = &image.assigned_to {
        if let Some(mut device) = store.get_device(mac)? {
            if device.image_id.as_deref() == Some(image.id.as_str()) {
                device.image_id = None;
                store.put_device(&device)?;
            }
        }
        info!(image = %image.id, mac = %mac, "released device link");
    }
    Ok(released)
}

/// Points the device `mac` at `image_id`, creating a minimal device if needed.
///
/// Caller holds the linkage lock.
pub(crate) fn retarget_locked(store: &dyn RecordStore, mac: &str, image_id: &str) -> IscsiResult<()> {
    let mut device = store
        .get_device(mac)?
        .unwrap_or_else(|| Device::minimal(mac));
    device.image_id = Some(image_id.to_string());
    store.put_device(&device)
}

/// Links and unlinks devices to images.
pub struct DeviceLinkage {
    config: Arc<IscsiConfig>,
    store: Arc<dyn RecordStore>,
    locks: Arc<NameLocks>,
}

impl DeviceLinkage {
    /// Create a linkage manager over shared components.
    pub fn new(config: Arc<IscsiConfig>, store: Arc<dyn RecordStore>, locks: Arc<NameLocks>) -> Self {
        Self { config, store, locks }
    }

    fn outcome(&self, image: &Image, mac: &str, already_linked: bool) -> LinkOutcome {
        LinkOutcome {
            image: image.name.clone(),
            mac: mac.to_string(),
            target_name: image.target_name.clone(),
            boot_server_ip: self.config.boot_server_ip.clone(),
            san_url: self.config.san_url(&image.target_name),
            already_linked,
        }
    }

    /// Assigns `image_name` to `mac`.
    ///
    /// Linking the same pair again is a no-op. Fails with `AlreadyAssigned`
    /// if the image belongs to another device or the device to another image.
    pub async fn link(&self, image_name: &str, mac: &str) -> IscsiResult<LinkOutcome> {
        validate_image_name(image_name)?;
        let mac = normalize_mac(mac)?;
        let _linkage = self.locks.lock_linkage().await;
        let _guard = self.locks.lock(image_name).await;

        let mut image = self
            .store
            .get_image(image_name)?
            .ok_or_else(|| IscsiError::image_not_found(image_name))?;

        match image.assigned_to.as_deref() {
            Some(current) if current == mac => {
                // Repair a device pointer lost to an interrupted write.
                let device = self.store.get_device(&mac)?;
                if device.and_then(|d| d.image_id).as_deref() != Some(image.id.as_str()) {
                    retarget_locked(self.store.as_ref(), &mac, &image.id)?;
                }
                return Ok(self.outcome(&image, &mac, true));
            }
            Some(current) => {
                return Err(IscsiError::AlreadyAssigned {
                    image: image.name.clone(),
                    mac: current.to_string(),
                });
            }
            None => {}
        }

        if image.status == ImageStatus::Unregistered {
            return Err(IscsiError::InvalidArgument(format!(
                "image {} has no registered target",
                image.name
            )));
        }

        if let Some(other) = self
            .store
            .list_images()?
            .into_iter()
            .find(|i| i.id != image.id && i.assigned_to.as_deref() == Some(mac.as_str()))
        {
            return Err(IscsiError::AlreadyAssigned {
                image: other.name,
                mac,
            });
        }

        let previous = image.clone();
        image.assigned_to = Some(mac.clone());
        image.status = ImageStatus::Linked;
        self.store.put_image(&image)?;

        if let Err(e) = retarget_locked(self.store.as_ref(), &mac, &image.id) {
            warn!(image = image_name, mac = %mac, "device update failed, reverting link: {}", e);
            if let Err(undo) = self.store.put_image(&previous) {
                warn!(image = image_name, "could not revert image record: {}", undo);
            }
            return Err(e);
        }

        info!(image = image_name, mac = %mac, "linked device");
        Ok(self.outcome(&image, &mac, false))
    }

    /// Clears the link held by `mac`; returns the image that was unlinked.
    pub async fn unlink(&self, mac: &str) -> IscsiResult<Option<String>> {
        let mac = normalize_mac(mac)?;
        let _linkage = self.locks.lock_linkage().await;

        let linked = self
            .store
            .list_images()?
            .into_iter()
            .find(|i| i.assigned_to.as_deref() == Some(mac.as_str()));

        match linked {
            Some(image) => {
                let _guard = self.locks.lock(&image.id).await;
                release_locked(self.store.as_ref(), &image)?;
                Ok(Some(image.id))
            }
            None => {
                if let Some(mut device) = self.store.get_device(&mac)? {
                    if device.image_id.take().is_some() {
                        warn!(mac = %mac, "cleared stale device image pointer");
                        self.store.put_device(&device)?;
                    }
                }
                Ok(None)
            }
        }
    }

    /// Changes a device's profile fields; the linked image is untouched.
    pub async fn update_device(&self, mac: &str, update: &DeviceUpdate) -> IscsiResult<Device> {
        let mac = normalize_mac(mac)?;
        let _linkage = self.locks.lock_linkage().await;

        let mut device = self
            .store
            .get_device(&mac)?
            .ok_or(IscsiError::NotFound {
                what: "device",
                name: mac.clone(),
            })?;
        update.apply(&mut device)?;
        self.store.put_device(&device)?;
        info!(mac = %mac, enabled = device.enabled, "updated device");
        Ok(device)
    }

    /// Unlinks and removes a device; returns the image it released.
    ///
    /// Transfer state is kept.
    pub async fn remove_device(&self, mac: &str) -> IscsiResult<Option<String>> {
        let mac = normalize_mac(mac)?;
        let _linkage = self.locks.lock_linkage().await;

        if self.store.get_device(&mac)?.is_none() {
            return Err(IscsiError::NotFound {
                what: "device",
                name: mac,
            });
        }

        let linked = self
            .store
            .list_images()?
            .into_iter()
            .find(|i| i.assigned_to.as_deref() == Some(mac.as_str()));
        let released = match linked {
            Some(image) => {
                let _guard = self.locks.lock(&image.id).await;
                release_locked(self.store.as_ref(), &image)?;
                Some(image.id)
            }
            None => None,
        };

        self.store.remove_device(&mac)?;
        info!(mac = %mac, released = ?released, "removed device");
        Ok(released)
    }

    /// The image currently linked to `mac`.
    pub fn image_for_device(&self, mac: &str) -> IscsiResult<Option<Image>> {
        let mac = normalize_mac(mac)?;
        Ok(self
            .store
            .list_images()?
            .into_iter()
            .find(|i| i.assigned_to.as_deref() == Some(mac.as_str())))
    }
}
