use std::{
    fs,
    path::{Path, PathBuf},
};

use log::{debug, error, info, warn};
use part::{BlockDevice, Filesystem, ResolvedPartitions, LAYOUT, LSBLK_ARGS, MKLABEL_ARGS};
use temp_dir::TempDir;
use types::ImxBootstrapError;

use crate::host::{print_command, Host, ToolCommand};

const BOOT_MOUNT_DIR: &str = "boot";
const ROOTFS_MOUNT_DIR: &str = "rootfs";

/// Device path of the partition `num` of `dev`, following the kernel naming
/// rules. Only used to print what a dry run would do.
fn partition_path(dev: &Path, num: usize) -> PathBuf {
    let name = dev.to_string_lossy();

    if name.ends_with(|c: char| c.is_ascii_digit()) {
        PathBuf::from(format!("{name}p{num}"))
    } else {
        PathBuf::from(format!("{name}{num}"))
    }
}

#[derive(Debug)]
struct MountedPartition {
    dev: PathBuf,
    mnt: PathBuf,
}

/// The boot and root partitions of our target, mounted under a temporary
/// directory for as long as this lives
pub(crate) struct MountedDevice<'a> {
    host: &'a dyn Host,
    parts: Vec<MountedPartition>,
    dir: Option<TempDir>,
}

impl MountedDevice<'_> {
    fn root(&self) -> Result<&Path, ImxBootstrapError> {
        self.dir
            .as_ref()
            .map(TempDir::path)
            .ok_or_else(|| ImxBootstrapError::Custom(String::from("Mount directory is gone")))
    }

    fn mount(
        &mut self,
        dev: &Path,
        name: &str,
        filesystem: Filesystem,
    ) -> Result<(), ImxBootstrapError> {
        let mnt = self.root()?.join(name);
        fs::create_dir_all(&mnt)?;

        self.host.mount(dev, &mnt, filesystem)?;

        debug!("{} ({filesystem}) mounted on {}", dev.display(), mnt.display());
        self.parts.push(MountedPartition {
            dev: dev.to_path_buf(),
            mnt,
        });

        Ok(())
    }

    pub(crate) fn boot_dir(&self) -> Result<PathBuf, ImxBootstrapError> {
        Ok(self.root()?.join(BOOT_MOUNT_DIR))
    }

    pub(crate) fn rootfs_dir(&self) -> Result<PathBuf, ImxBootstrapError> {
        Ok(self.root()?.join(ROOTFS_MOUNT_DIR))
    }
}

impl Drop for MountedDevice<'_> {
    fn drop(&mut self) {
        let mut clean = true;

        while let Some(part) = self.parts.pop() {
            debug!(
                "Unmounting {} from {}",
                part.dev.display(),
                part.mnt.display()
            );

            if let Err(e) = self.host.unmount(&part.mnt) {
                error!("Couldn't unmount {}: {e}", part.dev.display());
                clean = false;
            }
        }

        if let Some(dir) = self.dir.take() {
            if clean {
                drop(dir);
            } else {
                // Removing the directory would erase whatever is still mounted
                warn!("Leaving {} behind", dir.path().display());
                #[allow(clippy::mem_forget)]
                core::mem::forget(dir);
            }
        }
    }
}

/// Finds, or creates, the boot and root partitions of a device
pub(crate) struct PartitionManager<'a> {
    host: &'a dyn Host,
    dry_run: bool,
}

impl<'a> PartitionManager<'a> {
    pub(crate) fn new(host: &'a dyn Host, dry_run: bool) -> Self {
        Self { host, dry_run }
    }

    fn list(&self, dev: &Path) -> Result<BlockDevice, ImxBootstrapError> {
        let output = self
            .host
            .output(&ToolCommand::new("lsblk").args(LSBLK_ARGS).arg(dev))?;

        part::parse_lsblk(&output)?
            .into_iter()
            .next()
            .ok_or_else(|| {
                ImxBootstrapError::Custom(format!("lsblk didn't report {}", dev.display()))
            })
    }

    fn parted(dev: &Path) -> ToolCommand {
        ToolCommand::new("parted").arg("-s").arg(dev)
    }

    fn settle() -> ToolCommand {
        ToolCommand::new("udevadm").arg("settle")
    }

    fn partitioning_commands(dev: &Path) -> Vec<ToolCommand> {
        let mut commands = vec![Self::parted(dev).args(MKLABEL_ARGS)];
        commands.extend(LAYOUT.iter().map(|p| Self::parted(dev).args(p.mkpart_args())));
        commands.push(Self::settle());

        commands
    }

    fn format_command(dev: &Path, idx: usize) -> Option<ToolCommand> {
        let spec = LAYOUT.get(idx)?;
        let (program, args) = spec.fs.mkfs_command(spec.label, dev);

        Some(ToolCommand::new(program).args(args))
    }

    fn create(&self, dev: &Path) -> Result<(), ImxBootstrapError> {
        info!("Creating a new partition table on {}", dev.display());

        for cmd in Self::partitioning_commands(dev) {
            self.host.run(&cmd)?;
        }

        let device = self.list(dev)?;
        if device.children.len() < LAYOUT.len() {
            return Err(ImxBootstrapError::Custom(format!(
                "Expected {} partitions on {}, found {}",
                LAYOUT.len(),
                dev.display(),
                device.children.len()
            )));
        }

        for (idx, part) in device.children.iter().take(LAYOUT.len()).enumerate() {
            if let Some(cmd) = Self::format_command(&part.path, idx) {
                self.host.run(&cmd)?;
            }
        }

        self.host.run(&Self::settle())
    }

    /// Returns the boot and root partitions of `dev`, creating them if either
    /// is missing. Returns `None` if the operator declined, or if we only
    /// print what we would have done.
    pub(crate) fn resolve(
        &self,
        dev: &Path,
    ) -> Result<Option<ResolvedPartitions>, ImxBootstrapError> {
        let device = self.list(dev)?;

        if let Some(parts) = device.resolve() {
            info!(
                "Found boot partition {} and root partition {}",
                parts.boot.display(),
                parts.rootfs.display()
            );

            return Ok((!self.dry_run).then_some(parts));
        }

        info!("{} lacks a BOOT or rootfs partition", dev.display());

        if self.dry_run {
            for cmd in Self::partitioning_commands(dev) {
                print_command(&cmd)?;
            }

            for idx in 0..LAYOUT.len() {
                if let Some(cmd) = Self::format_command(&partition_path(dev, idx + 1), idx) {
                    print_command(&cmd)?;
                }
            }

            return Ok(None);
        }

        if !self.host.confirm(&format!(
            "All data on {} will be lost. Create new partitions?",
            dev.display()
        ))? {
            info!("Partitioning cancelled");
            return Ok(None);
        }

        self.create(dev)?;

        self.list(dev)?.resolve().map(Some).ok_or_else(|| {
            ImxBootstrapError::Custom(format!(
                "Couldn't find the BOOT and rootfs partitions on {} after creating them",
                dev.display()
            ))
        })
    }

    /// Mounts both partitions. They are unmounted when the returned guard is
    /// dropped, whatever happens in between.
    pub(crate) fn mount(
        &self,
        parts: &ResolvedPartitions,
    ) -> Result<MountedDevice<'a>, ImxBootstrapError> {
        let mut device = MountedDevice {
            host: self.host,
            parts: Vec::with_capacity(2),
            dir: Some(TempDir::new()?),
        };

        device.mount(&parts.boot, BOOT_MOUNT_DIR, Filesystem::Fat32)?;
        device.mount(&parts.rootfs, ROOTFS_MOUNT_DIR, Filesystem::Ext4)?;

        Ok(device)
    }
}
