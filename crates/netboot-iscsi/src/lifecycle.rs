//! Image create, delete, copy and rename.
//!
//! The persisted [`Image`] record is written only after the backing file
//! and the daemon registration it describes exist. Every operation undoes
//! its own partial side effects before returning an error.

use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, error, info, warn};

use crate::config::IscsiConfig;
use crate::error::{IscsiError, IscsiResult};
use crate::linkage::{release_locked, retarget_locked};
use crate::locks::NameLocks;
use crate::model::{bytes_to_gb_ceil, validate_image_name, Image, ImageStatus, BYTES_PER_GB};
use crate::registrar::{LunDeviceType, TargetRegistrar};
use crate::store::RecordStore;

const COPY_CHUNK: usize = 1024 * 1024;

/// Reads until `buf` is full or EOF; returns the bytes read.
fn read_full(src: &mut impl Read, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match src.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Copies `src` to a new file at `dst`, seeking over all-zero chunks so
/// the destination stays sparse. Returns the copied length.
fn sparse_copy(src: &Path, dst: &Path) -> std::io::Result<u64> {
    let mut input = std::fs::File::open(src)?;
    let mut output = std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(dst)?;

    let mut buf = vec![0u8; COPY_CHUNK];
    let mut total: u64 = 0;
    loop {
        let n = read_full(&mut input, &mut buf)?;
        if n == 0 {
            break;
        }
        let chunk = &buf[..n];
        if chunk.iter().all(|b| *b == 0) {
            output.seek(SeekFrom::Current(n as i64))?;
        } else {
            output.write_all(chunk)?;
        }
        total += n as u64;
    }
    // A trailing hole is only materialized by set_len.
    output.set_len(total)?;
    output.sync_all()?;
    Ok(total)
}

async fn file_exists(path: &Path) -> IscsiResult<bool> {
    tokio::fs::try_exists(path)
        .await
        .map_err(|e| IscsiError::fs(format!("checking {}", path.display()), e))
}

async fn remove_file_if_present(path: &Path) -> IscsiResult<bool> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(IscsiError::fs(format!("removing {}", path.display()), e)),
    }
}

async fn discard_file(path: &Path) {
    if let Err(e) = remove_file_if_present(path).await {
        error!(path = %path.display(), "rollback could not remove file: {}", e);
    }
}

/// Owns image names, their backing files and target registrations.
pub struct ImageLifecycle {
    config: Arc<IscsiConfig>,
    store: Arc<dyn RecordStore>,
    registrar: Arc<TargetRegistrar>,
    locks: Arc<NameLocks>,
}

impl ImageLifecycle {
    /// Create a lifecycle manager over shared components.
    pub fn new(
        config: Arc<IscsiConfig>,
        store: Arc<dyn RecordStore>,
        registrar: Arc<TargetRegistrar>,
        locks: Arc<NameLocks>,
    ) -> Self {
        Self {
            config,
            store,
            registrar,
            locks,
        }
    }

    fn check_size(&self, size_gb: u64) -> IscsiResult<()> {
        if size_gb == 0 || size_gb > self.config.max_image_size_gb {
            return Err(IscsiError::InvalidArgument(format!(
                "size must be between 1 and {} GB, got {}",
                self.config.max_image_size_gb, size_gb
            )));
        }
        Ok(())
    }

    async fn ensure_images_dir(&self) -> IscsiResult<()> {
        tokio::fs::create_dir_all(&self.config.images_dir)
            .await
            .map_err(|e| {
                IscsiError::fs(
                    format!("creating {}", self.config.images_dir.display()),
                    e,
                )
            })
    }

    async fn ensure_free(&self, name: &str) -> IscsiResult<PathBuf> {
        if self.store.get_image(name)?.is_some() {
            return Err(IscsiError::image_exists(name));
        }
        let path = self.config.image_path(name);
        if file_exists(&path).await? {
            return Err(IscsiError::image_exists(name));
        }
        Ok(path)
    }

    async fn register_or_discard(&self, target_name: &str, path: &Path) -> IscsiResult<u32> {
        match self
            .registrar
            .register(target_name, path, LunDeviceType::Disk)
            .await
        {
            Ok(target) => Ok(target.target_id),
            Err(e) => {
                warn!(path = %path.display(), "registration failed, removing backing file: {}", e);
                discard_file(path).await;
                Err(e)
            }
        }
    }

    async fn persist_or_undo(&self, image: &Image) -> IscsiResult<()> {
        if let Err(e) = self.store.put_image(image) {
            warn!(image = %image.name, "persisting record failed, undoing registration: {}", e);
            if let Err(undo) = self.registrar.deregister_by_name(&image.target_name).await {
                error!(image = %image.name, "rollback could not deregister target: {}", undo);
            }
            discard_file(&image.file_path).await;
            return Err(e);
        }
        Ok(())
    }

    /// Allocates a sparse `size_gb` image, registers it and persists it.
    pub async fn create(&self, name: &str, size_gb: u64) -> IscsiResult<Image> {
        validate_image_name(name)?;
        self.check_size(size_gb)?;
        let _guard = self.locks.lock(name).await;

        let path = self.ensure_free(name).await?;
        self.ensure_images_dir().await?;

        let file = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::AlreadyExists => IscsiError::image_exists(name),
                _ => IscsiError::fs(format!("creating {}", path.display()), e),
            })?;
        let allocated = file.set_len(size_gb * BYTES_PER_GB).await;
        drop(file);
        if let Err(e) = allocated {
            discard_file(&path).await;
            return Err(IscsiError::fs(format!("allocating {}", path.display()), e));
        }
        debug!(image = name, size_gb, path = %path.display(), "allocated sparse image");

        let target_name = self.config.target_name_for(name);
        let target_id = self.register_or_discard(&target_name, &path).await?;

        let image = Image {
            id: name.to_string(),
            name: name.to_string(),
            size_gb,
            target_name,
            target_id: Some(target_id),
            file_path: path,
            assigned_to: None,
            status: ImageStatus::Available,
            created_at: Utc::now(),
            copied_from: None,
        };
        self.persist_or_undo(&image).await?;

        info!(image = name, size_gb, tid = target_id, "created image");
        Ok(image)
    }

    /// Deregisters, unlinks, removes the file and drops the record.
    ///
    /// Parts that are already gone are skipped, so deleting twice succeeds.
    pub async fn delete(&self, name: &str) -> IscsiResult<()> {
        validate_image_name(name)?;
        let _linkage = self.locks.lock_linkage().await;
        let _guard = self.locks.lock(name).await;

        let record = self.store.get_image(name)?;
        let target_name = record
            .as_ref()
            .map(|r| r.target_name.clone())
            .unwrap_or_else(|| self.config.target_name_for(name));
        let path = record
            .as_ref()
            .map(|r| r.file_path.clone())
            .unwrap_or_else(|| self.config.image_path(name));

        let removed_tid = self.registrar.deregister_by_name(&target_name).await?;

        let record = match record {
            Some(image) if image.is_linked() => Some(release_locked(self.store.as_ref(), &image)?),
            other => other,
        };

        if let Err(e) = remove_file_if_present(&path).await {
            if let Some(mut image) = record {
                image.status = ImageStatus::Unregistered;
                image.target_id = None;
                if let Err(store_err) = self.store.put_image(&image) {
                    error!(image = name, "could not mark image unregistered: {}", store_err);
                }
            }
            return Err(e);
        }

        let removed_record = self.store.remove_image(name)?;
        info!(
            image = name,
            tid = ?removed_tid,
            removed_record,
            "deleted image"
        );
        Ok(())
    }

    /// Sparse-copies `source` to a new image `dest`.
    ///
    /// The new size is derived from the copied file length, rounded up to
    /// whole GB.
    pub async fn copy(&self, source: &str, dest: &str) -> IscsiResult<Image> {
        validate_image_name(source)?;
        validate_image_name(dest)?;
        if source == dest {
            return Err(IscsiError::InvalidArgument(
                "source and destination names are equal".to_string(),
            ));
        }
        let _guards = self.locks.lock_pair(source, dest).await;

        let src = self
            .store
            .get_image(source)?
            .ok_or_else(|| IscsiError::image_not_found(source))?;
        if !file_exists(&src.file_path).await? {
            return Err(IscsiError::NotFound {
                what: "backing file",
                name: src.file_path.display().to_string(),
            });
        }
        let dest_path = self.ensure_free(dest).await?;
        self.ensure_images_dir().await?;

        let (from, to) = (src.file_path.clone(), dest_path.clone());
        let copied = tokio::task::spawn_blocking(move || sparse_copy(&from, &to))
            .await
            .map_err(|e| IscsiError::FileSystemError(format!("copy task failed: {}", e)))?;
        let bytes = match copied {
            Ok(bytes) => bytes,
            // Lost a race on create_new; the file is not ours to remove.
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                return Err(IscsiError::image_exists(dest));
            }
            Err(e) => {
                let err = IscsiError::fs(format!("copying to {}", dest_path.display()), e);
                warn!(source, dest, "copy failed, removing partial file: {}", err);
                discard_file(&dest_path).await;
                return Err(err);
            }
        };
        debug!(source, dest, bytes, "copied backing file");

        let target_name = self.config.target_name_for(dest);
        let target_id = self.register_or_discard(&target_name, &dest_path).await?;

        let image = Image {
            id: dest.to_string(),
            name: dest.to_string(),
            size_gb: bytes_to_gb_ceil(bytes),
            target_name,
            target_id: Some(target_id),
            file_path: dest_path,
            assigned_to: None,
            status: ImageStatus::Available,
            created_at: Utc::now(),
            copied_from: Some(source.to_string()),
        };
        self.persist_or_undo(&image).await?;

        info!(source, dest, size_gb = image.size_gb, tid = target_id, "copied image");
        Ok(image)
    }

    /// Renames `source` to `dest`, moving its file, target and link.
    ///
    /// A failure after the file has moved puts the file back and
    /// re-registers the old target before the error is returned.
    pub async fn rename(&self, source: &str, dest: &str) -> IscsiResult<Image> {
        validate_image_name(source)?;
        validate_image_name(dest)?;
        if source == dest {
            return Err(IscsiError::InvalidArgument(
                "source and destination names are equal".to_string(),
            ));
        }
        let _linkage = self.locks.lock_linkage().await;
        let _guards = self.locks.lock_pair(source, dest).await;

        let src = self
            .store
            .get_image(source)?
            .ok_or_else(|| IscsiError::image_not_found(source))?;
        if !file_exists(&src.file_path).await? {
            return Err(IscsiError::NotFound {
                what: "backing file",
                name: src.file_path.display().to_string(),
            });
        }
        let dest_path = self.ensure_free(dest).await?;

        self.registrar.deregister_by_name(&src.target_name).await?;

        if let Err(e) = tokio::fs::rename(&src.file_path, &dest_path).await {
            let err = IscsiError::fs(
                format!(
                    "renaming {} to {}",
                    src.file_path.display(),
                    dest_path.display()
                ),
                e,
            );
            warn!(source, dest, "file rename failed, restoring old target: {}", err);
            self.reregister_source(&src).await;
            return Err(err);
        }

        let target_name = self.config.target_name_for(dest);
        let target_id = match self
            .registrar
            .register(&target_name, &dest_path, LunDeviceType::Disk)
            .await
        {
            Ok(target) => target.target_id,
            Err(e) => {
                warn!(source, dest, "registration under new name failed, rolling back: {}", e);
                self.undo_rename(&src, &dest_path, None).await;
                return Err(e);
            }
        };

        let image = Image {
            id: dest.to_string(),
            name: dest.to_string(),
            target_name: target_name.clone(),
            target_id: Some(target_id),
            file_path: dest_path.clone(),
            status: if src.is_linked() {
                ImageStatus::Linked
            } else {
                ImageStatus::Available
            },
            ..src.clone()
        };

        if let Err(e) = self.migrate_record(&src, &image) {
            warn!(source, dest, "record migration failed, rolling back: {}", e);
            self.undo_rename(&src, &dest_path, Some(&target_name)).await;
            return Err(e);
        }

        info!(source, dest, tid = target_id, linked = image.is_linked(), "renamed image");
        Ok(image)
    }

    /// Writes the new record, retargets the device, then drops the old record.
    fn migrate_record(&self, src: &Image, image: &Image) -> IscsiResult<()> {
        let store = self.store.as_ref();
        store.put_image(image)?;

        if let Some(mac) = &src.assigned_to {
            if let Err(e) = retarget_locked(store, mac, &image.id) {
                if let Err(undo) = store.remove_image(&image.id) {
                    error!(image = %image.id, "rollback could not remove new record: {}", undo);
                }
                return Err(e);
            }
        }

        if let Err(e) = store.remove_image(&src.id) {
            if let Some(mac) = &src.assigned_to {
                if let Err(undo) = retarget_locked(store, mac, &src.id) {
                    error!(mac = %mac, "rollback could not retarget device: {}", undo);
                }
            }
            if let Err(undo) = store.remove_image(&image.id) {
                error!(image = %image.id, "rollback could not remove new record: {}", undo);
            }
            return Err(e);
        }
        Ok(())
    }

    async fn undo_rename(&self, src: &Image, moved_to: &Path, new_target: Option<&str>) {
        if let Some(target) = new_target {
            if let Err(e) = self.registrar.deregister_by_name(target).await {
                error!(target, "rollback could not deregister new target: {}", e);
            }
        }
        if let Err(e) = tokio::fs::rename(moved_to, &src.file_path).await {
            error!(
                from = %moved_to.display(),
                to = %src.file_path.display(),
                "rollback could not move file back: {}",
                e
            );
            return;
        }
        self.reregister_source(src).await;
    }

    async fn reregister_source(&self, src: &Image) {
        match self
            .registrar
            .register(&src.target_name, &src.file_path, LunDeviceType::Disk)
            .await
        {
            Ok(target) if Some(target.target_id) != src.target_id => {
                let mut restored = src.clone();
                restored.target_id = Some(target.target_id);
                if let Err(e) = self.store.put_image(&restored) {
                    error!(image = %src.name, "rollback could not record new target id: {}", e);
                }
            }
            Ok(_) => {}
            Err(e) => {
                error!(image = %src.name, "rollback could not re-register target: {}", e);
                let mut orphan = src.clone();
                orphan.target_id = None;
                if !orphan.is_linked() {
                    orphan.status = ImageStatus::Unregistered;
                }
                if let Err(e) = self.store.put_image(&orphan) {
                    error!(image = %src.name, "rollback could not mark image unregistered: {}", e);
                }
            }
        }
    }
}
