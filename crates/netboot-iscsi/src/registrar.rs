//! Target registration on the block-target daemon (`tgtd` via `tgtadm`).
//!
//! Target ids are never cached locally. Every allocation and lookup reads
//! the daemon's own listing, so the registrar stays correct across process
//! and daemon restarts. Allocation is serialized behind a single lock so two
//! concurrent registrations cannot pick the same id.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, error, info, warn};

use crate::config::IscsiConfig;
use crate::error::{DaemonStep, IscsiError, IscsiResult};
use crate::model::Image;
use crate::parse::{parse_target_listing, TargetStatus};
use crate::runner::{CommandOutput, CommandRunner, ProcessError};

/// LUN used for the backing file; LUN 0 is the daemon's controller.
pub const BACKING_LUN: u32 = 1;

/// SCSI device type presented for the logical unit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LunDeviceType {
    /// Read-write disk.
    #[default]
    Disk,
    /// CD-ROM, for installer media.
    Cd,
}

impl LunDeviceType {
    fn as_arg(&self) -> &'static str {
        match self {
            LunDeviceType::Disk => "disk",
            LunDeviceType::Cd => "cd",
        }
    }
}

/// A target that is registered and bound.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisteredTarget {
    /// Daemon-local id.
    pub target_id: u32,
    /// Target IQN.
    pub target_name: String,
    /// True if an existing registration was adopted instead of created.
    pub reused: bool,
}

/// Per-image result of [`TargetRegistrar::restore_all`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RestoreOutcome {
    /// The image is registered under `target_id`.
    Restored {
        /// Image name.
        name: String,
        /// Live target id.
        target_id: u32,
    },
    /// The backing file is gone; the image was skipped.
    MissingFile {
        /// Image name.
        name: String,
        /// Expected backing file.
        path: PathBuf,
    },
    /// Registration failed.
    Failed {
        /// Image name.
        name: String,
        /// Error text.
        error: String,
    },
}

fn is_missing_target(err: &ProcessError) -> bool {
    let text = err.output_text().to_ascii_lowercase();
    text.contains("can't find the target")
        || text.contains("cannot find the target")
        || text.contains("no such target")
        || text.contains("not found")
}

/// Creates, looks up and deletes targets on the daemon.
pub struct TargetRegistrar {
    runner: Arc<dyn CommandRunner>,
    config: Arc<IscsiConfig>,
    alloc_lock: AsyncMutex<()>,
}

impl TargetRegistrar {
    /// Create a registrar issuing commands through `runner`.
    pub fn new(runner: Arc<dyn CommandRunner>, config: Arc<IscsiConfig>) -> Self {
        Self {
            runner,
            config,
            alloc_lock: AsyncMutex::new(()),
        }
    }

    async fn tgtadm_raw(&self, args: &[&str]) -> Result<CommandOutput, ProcessError> {
        let mut full = vec!["--lld".to_string(), "iscsi".to_string()];
        full.extend(args.iter().map(|a| a.to_string()));
        self.runner
            .run(&self.config.tgtadm_path, &full, self.config.command_timeout())
            .await
    }

    async fn tgtadm(&self, step: DaemonStep, args: &[&str]) -> IscsiResult<CommandOutput> {
        self.tgtadm_raw(args)
            .await
            .map_err(|e| IscsiError::daemon(step, e))
    }

    /// Reads and parses the daemon's full target listing.
    pub async fn show_targets(&self) -> IscsiResult<Vec<TargetStatus>> {
        let output = self
            .tgtadm(DaemonStep::ShowTargets, &["--mode", "target", "--op", "show"])
            .await?;
        let targets = parse_target_listing(&output.stdout);
        debug!(count = targets.len(), "parsed daemon target listing");
        Ok(targets)
    }

    /// Looks up the live id of a target by IQN.
    pub async fn find_id_by_name(&self, target_name: &str) -> IscsiResult<Option<u32>> {
        Ok(self
            .show_targets()
            .await?
            .into_iter()
            .find(|t| t.target_name == target_name)
            .map(|t| t.target_id))
    }

    /// Registers `backing_file` as LUN 1 of a new target named `target_name`.
    ///
    /// An existing target with the same name and backing file is adopted.
    /// A same-named target pointing elsewhere is deleted and recreated. On a
    /// partial failure the half-created target is deleted before the first
    /// error is returned.
    pub async fn register(
        &self,
        target_name: &str,
        backing_file: &Path,
        device_type: LunDeviceType,
    ) -> IscsiResult<RegisteredTarget> {
        let _alloc = self.alloc_lock.lock().await;
        let listing = self.show_targets().await?;

        if let Some(existing) = listing.iter().find(|t| t.target_name == target_name) {
            if existing.backing_stores.iter().any(|p| p == backing_file) {
                info!(
                    target = target_name,
                    tid = existing.target_id,
                    "adopting existing target registration"
                );
                return Ok(RegisteredTarget {
                    target_id: existing.target_id,
                    target_name: target_name.to_string(),
                    reused: true,
                });
            }
            warn!(
                target = target_name,
                tid = existing.target_id,
                "stale target registration with different backing store, recreating"
            );
            self.deregister(existing.target_id).await?;
        }

        let target_id = listing.iter().map(|t| t.target_id).max().unwrap_or(0) + 1;
        let tid = target_id.to_string();
        let lun = BACKING_LUN.to_string();
        let backing = backing_file.to_string_lossy().to_string();

        self.tgtadm(
            DaemonStep::NewTarget,
            &["--mode", "target", "--op", "new", "--tid", &tid, "--targetname", target_name],
        )
        .await?;

        let attach = self
            .tgtadm(
                DaemonStep::NewLogicalUnit,
                &[
                    "--mode",
                    "logicalunit",
                    "--op",
                    "new",
                    "--tid",
                    &tid,
                    "--lun",
                    &lun,
                    "--backing-store",
                    &backing,
                    "--device-type",
                    device_type.as_arg(),
                ],
            )
            .await;
        if let Err(e) = attach {
            self.cleanup_partial(target_id).await;
            return Err(e);
        }

        let bind = self
            .tgtadm(
                DaemonStep::BindInitiators,
                &[
                    "--mode",
                    "target",
                    "--op",
                    "bind",
                    "--tid",
                    &tid,
                    "--initiator-address",
                    &self.config.initiator_address,
                ],
            )
            .await;
        if let Err(e) = bind {
            self.cleanup_partial(target_id).await;
            return Err(e);
        }

        info!(target = target_name, tid = target_id, backing = %backing, "registered target");
        Ok(RegisteredTarget {
            target_id,
            target_name: target_name.to_string(),
            reused: false,
        })
    }

    async fn cleanup_partial(&self, target_id: u32) {
        if let Err(e) = self.deregister(target_id).await {
            error!(tid = target_id, "cleanup of partially created target failed: {}", e);
        } else {
            warn!(tid = target_id, "removed partially created target");
        }
    }

    /// Force-deletes a target; a missing target is not an error.
    pub async fn deregister(&self, target_id: u32) -> IscsiResult<()> {
        let tid = target_id.to_string();
        match self
            .tgtadm_raw(&["--mode", "target", "--op", "delete", "--force", "--tid", &tid])
            .await
        {
            Ok(_) => {
                debug!(tid = target_id, "deleted target");
                Ok(())
            }
            Err(e) if is_missing_target(&e) => {
                debug!(tid = target_id, "target already absent");
                Ok(())
            }
            Err(e) => Err(IscsiError::daemon(DaemonStep::DeleteTarget, e)),
        }
    }

    /// Resolves a target by IQN and deletes it; returns the id that was removed.
    pub async fn deregister_by_name(&self, target_name: &str) -> IscsiResult<Option<u32>> {
        match self.find_id_by_name(target_name).await? {
            Some(target_id) => {
                self.deregister(target_id).await?;
                Ok(Some(target_id))
            }
            None => Ok(None),
        }
    }

    /// Re-registers every image whose backing file still exists.
    ///
    /// Called once at startup, since the daemon keeps no durable state.
    pub async fn restore_all(&self, images: &[Image]) -> Vec<RestoreOutcome> {
        let mut outcomes = Vec::with_capacity(images.len());
        for image in images {
            let exists = tokio::fs::try_exists(&image.file_path).await.unwrap_or(false);
            if !exists {
                warn!(
                    image = %image.name,
                    path = %image.file_path.display(),
                    "backing file missing, skipping target restore"
                );
                outcomes.push(RestoreOutcome::MissingFile {
                    name: image.name.clone(),
                    path: image.file_path.clone(),
                });
                continue;
            }
            match self
                .register(&image.target_name, &image.file_path, LunDeviceType::Disk)
                .await
            {
                Ok(target) => outcomes.push(RestoreOutcome::Restored {
                    name: image.name.clone(),
                    target_id: target.target_id,
                }),
                Err(e) => {
                    warn!(image = %image.name, "target restore failed: {}", e);
                    outcomes.push(RestoreOutcome::Failed {
                        name: image.name.clone(),
                        error: e.to_string(),
                    });
                }
            }
        }
        info!(count = outcomes.len(), "target restore finished");
        outcomes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::{FakeOp, FakeTargetDaemon};
    use crate::model::ImageStatus;
    use chrono::Utc;
    use tempfile::TempDir;

    fn registrar(daemon: &Arc<FakeTargetDaemon>) -> TargetRegistrar {
        TargetRegistrar::new(daemon.clone(), Arc::new(IscsiConfig::default()))
    }

    #[tokio::test]
    async fn test_register_allocates_sequential_ids() {
        let daemon = Arc::new(FakeTargetDaemon::new());
        let reg = registrar(&daemon);

        let a = reg
            .register("iqn.t:a", Path::new("/img/a.img"), LunDeviceType::Disk)
            .await
            .unwrap();
        let b = reg
            .register("iqn.t:b", Path::new("/img/b.img"), LunDeviceType::Disk)
            .await
            .unwrap();
        assert_eq!(a.target_id, 1);
        assert_eq!(b.target_id, 2);
        assert!(!a.reused);
        assert!(daemon.is_bound("iqn.t:a"));
        assert_eq!(reg.find_id_by_name("iqn.t:b").await.unwrap(), Some(2));
    }

    #[tokio::test]
    async fn test_ids_come_from_daemon_not_local_state() {
        let daemon = Arc::new(FakeTargetDaemon::new());
        daemon.preload_target(41, "iqn.other:x", "/img/x.img");
        let reg = registrar(&daemon);
        let t = reg
            .register("iqn.t:a", Path::new("/img/a.img"), LunDeviceType::Disk)
            .await
            .unwrap();
        assert_eq!(t.target_id, 42);
    }

    #[tokio::test]
    async fn test_register_adopts_existing_target() {
        let daemon = Arc::new(FakeTargetDaemon::new());
        daemon.preload_target(5, "iqn.t:a", "/img/a.img");
        let reg = registrar(&daemon);
        let t = reg
            .register("iqn.t:a", Path::new("/img/a.img"), LunDeviceType::Disk)
            .await
            .unwrap();
        assert_eq!(t.target_id, 5);
        assert!(t.reused);
        assert_eq!(daemon.target_count(), 1);
    }

    #[tokio::test]
    async fn test_register_replaces_stale_target() {
        let daemon = Arc::new(FakeTargetDaemon::new());
        daemon.preload_target(5, "iqn.t:a", "/img/old.img");
        let reg = registrar(&daemon);
        let t = reg
            .register("iqn.t:a", Path::new("/img/a.img"), LunDeviceType::Disk)
            .await
            .unwrap();
        assert!(!t.reused);
        assert_eq!(daemon.target_count(), 1);
        assert_eq!(
            daemon.backing_store("iqn.t:a"),
            Some(PathBuf::from("/img/a.img"))
        );
    }

    #[tokio::test]
    async fn test_partial_failure_cleans_up_and_reports_step() {
        let daemon = Arc::new(FakeTargetDaemon::new());
        daemon.fail_next(FakeOp::Bind, None);
        let reg = registrar(&daemon);
        let err = reg
            .register("iqn.t:a", Path::new("/img/a.img"), LunDeviceType::Disk)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            IscsiError::DaemonCommandFailed {
                step: DaemonStep::BindInitiators,
                ..
            }
        ));
        assert_eq!(daemon.target_count(), 0);
    }

    #[tokio::test]
    async fn test_logical_unit_failure_cleans_up() {
        let daemon = Arc::new(FakeTargetDaemon::new());
        daemon.fail_next(FakeOp::NewLogicalUnit, None);
        let reg = registrar(&daemon);
        let err = reg
            .register("iqn.t:a", Path::new("/img/a.img"), LunDeviceType::Cd)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            IscsiError::DaemonCommandFailed {
                step: DaemonStep::NewLogicalUnit,
                ..
            }
        ));
        assert_eq!(daemon.target_count(), 0);
    }

    #[tokio::test]
    async fn test_timeout_is_recoverable_error() {
        let daemon = Arc::new(FakeTargetDaemon::new());
        daemon.timeout_next(FakeOp::Show);
        let reg = registrar(&daemon);
        let err = reg.show_targets().await.unwrap_err();
        assert!(err.is_retryable());
        assert!(err.to_string().contains("timed out"));
    }

    #[tokio::test]
    async fn test_deregister_tolerates_missing() {
        let daemon = Arc::new(FakeTargetDaemon::new());
        let reg = registrar(&daemon);
        reg.deregister(99).await.unwrap();
        assert_eq!(reg.deregister_by_name("iqn.t:none").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_deregister_propagates_other_failures() {
        let daemon = Arc::new(FakeTargetDaemon::new());
        daemon.preload_target(1, "iqn.t:a", "/img/a.img");
        daemon.fail_next(FakeOp::Delete, None);
        let reg = registrar(&daemon);
        let err = reg.deregister(1).await.unwrap_err();
        assert!(matches!(
            err,
            IscsiError::DaemonCommandFailed {
                step: DaemonStep::DeleteTarget,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_restore_all_skips_missing_files() {
        let dir = TempDir::new().unwrap();
        let present = dir.path().join("present.img");
        std::fs::write(&present, b"").unwrap();

        let mk = |name: &str, path: PathBuf| Image {
            id: name.to_string(),
            name: name.to_string(),
            size_gb: 1,
            target_name: format!("iqn.t:{}", name),
            target_id: Some(7),
            file_path: path,
            assigned_to: None,
            status: ImageStatus::Available,
            created_at: Utc::now(),
            copied_from: None,
        };
        let images = vec![
            mk("present", present.clone()),
            mk("gone", dir.path().join("gone.img")),
        ];

        let daemon = Arc::new(FakeTargetDaemon::new());
        let reg = registrar(&daemon);
        let outcomes = reg.restore_all(&images).await;

        assert_eq!(
            outcomes[0],
            RestoreOutcome::Restored {
                name: "present".to_string(),
                target_id: 1
            }
        );
        assert!(matches!(outcomes[1], RestoreOutcome::MissingFile { .. }));
        assert_eq!(daemon.target_count(), 1);

        // Running again adopts the live registration.
        let again = reg.restore_all(&images[..1]).await;
        assert_eq!(again, outcomes[..1].to_vec());
        assert_eq!(daemon.target_count(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_registers_get_distinct_ids() {
        let daemon = Arc::new(FakeTargetDaemon::new());
        let reg = Arc::new(registrar(&daemon));
        let mut handles = Vec::new();
        for i in 0..8 {
            let reg = reg.clone();
            handles.push(tokio::spawn(async move {
                reg.register(
                    &format!("iqn.t:{}", i),
                    Path::new(&format!("/img/{}.img", i)),
                    LunDeviceType::Disk,
                )
                .await
                .unwrap()
                .target_id
            }));
        }
        let mut ids = Vec::new();
        for h in handles {
            ids.push(h.await.unwrap());
        }
        ids.sort_unstable();
        assert_eq!(ids, (1..=8).collect::<Vec<u32>>());
    }
}
