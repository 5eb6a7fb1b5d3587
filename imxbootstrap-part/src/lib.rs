#![doc = include_str!("../README.md")]

use core::fmt;
use std::{
    ffi::OsString,
    path::{Path, PathBuf},
};

use log::debug;
use serde::Deserialize;
#[cfg(test)]
use test_log as _;

/// One mebibyte, in bytes
pub const MIB: u64 = 1 << 20;

/// Offset of the composite boot image on the raw device, in bytes
pub const BOOT_IMAGE_OFFSET: u64 = 32 << 10;

/// Block size used when writing the composite boot image
pub const BOOT_IMAGE_BLOCK_SIZE: u64 = 1 << 10;

/// Any partition whose label starts with this prefix is a boot partition
pub const BOOT_LABEL_PREFIX: &str = "BOOT";

/// Label given to the boot partition we create
pub const BOOT_LABEL: &str = "BOOT";

/// Label of the root filesystem partition
pub const ROOTFS_LABEL: &str = "rootfs";

/// Arguments given to `lsblk` to list a device and its partitions
pub const LSBLK_ARGS: [&str; 4] = ["--json", "--paths", "--output", "PATH,LABEL,FSTYPE"];

/// Filesystems we know how to create on the boot media
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Filesystem {
    /// FAT32, holding the kernel and device trees
    Fat32,

    /// EXT4, holding the root filesystem
    Ext4,
}

impl Filesystem {
    /// Returns the filesystem type name `parted` expects
    #[must_use]
    pub fn parted_name(self) -> &'static str {
        match self {
            Self::Fat32 => "fat32",
            Self::Ext4 => "ext4",
        }
    }

    /// Returns the filesystem type name the kernel expects at mount time
    #[must_use]
    pub fn mount_name(self) -> &'static str {
        match self {
            Self::Fat32 => "vfat",
            Self::Ext4 => "ext4",
        }
    }

    /// Returns the program and the arguments formatting `dev` with this
    /// filesystem and the given label
    #[must_use]
    pub fn mkfs_command(self, label: &str, dev: &Path) -> (&'static str, Vec<OsString>) {
        let mut args: Vec<OsString> = match self {
            Self::Fat32 => vec!["-F".into(), "32".into(), "-n".into(), label.into()],
            Self::Ext4 => vec!["-F".into(), "-L".into(), label.into()],
        };
        args.push(dev.as_os_str().to_owned());

        let program = match self {
            Self::Fat32 => "mkfs.vfat",
            Self::Ext4 => "mkfs.ext4",
        };

        (program, args)
    }
}

impl fmt::Display for Filesystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.mount_name())
    }
}

/// Start or end of a partition
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Boundary {
    /// Absolute offset from the start of the device, in bytes. Always a
    /// multiple of [`MIB`].
    Offset(u64),

    /// The last usable byte of the device
    End,
}

impl Boundary {
    /// Returns the representation `parted` expects
    #[must_use]
    pub fn to_parted_string(self) -> String {
        match self {
            Self::Offset(bytes) => format!("{}MiB", bytes / MIB),
            Self::End => String::from("100%"),
        }
    }
}

/// Description of a partition we create
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PartitionSpec {
    /// Filesystem Label
    pub label: &'static str,

    /// Filesystem created on the partition
    pub fs: Filesystem,

    /// Partition Start
    pub start: Boundary,

    /// Partition End
    pub end: Boundary,
}

impl PartitionSpec {
    /// Returns the `parted` arguments creating this partition
    #[must_use]
    pub fn mkpart_args(&self) -> [String; 5] {
        [
            String::from("mkpart"),
            String::from("primary"),
            String::from(self.fs.parted_name()),
            self.start.to_parted_string(),
            self.end.to_parted_string(),
        ]
    }
}

/// Arguments given to `parted` to write a new, empty, MBR partition table
pub const MKLABEL_ARGS: [&str; 2] = ["mklabel", "msdos"];

/// The layout of the boot media, in on-disk order
pub const LAYOUT: [PartitionSpec; 2] = [
    PartitionSpec {
        label: BOOT_LABEL,
        fs: Filesystem::Fat32,
        start: Boundary::Offset(MIB),
        end: Boundary::Offset(256 * MIB),
    },
    PartitionSpec {
        label: ROOTFS_LABEL,
        fs: Filesystem::Ext4,
        start: Boundary::Offset(256 * MIB),
        end: Boundary::End,
    },
];

/// Returns how many bytes of boot image fit between its offset and the first
/// partition
#[must_use]
pub fn boot_image_capacity() -> u64 {
    match LAYOUT[0].start {
        Boundary::Offset(start) => start.saturating_sub(BOOT_IMAGE_OFFSET),
        Boundary::End => 0,
    }
}

/// A block device, or a partition, as reported by `lsblk`
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
pub struct BlockDevice {
    /// Device File Path
    pub path: PathBuf,

    /// Filesystem Label, if any
    #[serde(default)]
    pub label: Option<String>,

    /// Filesystem Type, if any
    #[serde(default)]
    pub fstype: Option<String>,

    /// Partitions of this device
    #[serde(default)]
    pub children: Vec<BlockDevice>,
}

#[derive(Debug, Deserialize)]
struct LsblkOutput {
    #[serde(rename = "blockdevices")]
    devices: Vec<BlockDevice>,
}

/// Parses the JSON output of `lsblk` run with [`LSBLK_ARGS`]
///
/// # Errors
///
/// If the output isn't valid `lsblk` JSON.
pub fn parse_lsblk(output: &[u8]) -> Result<Vec<BlockDevice>, serde_json::Error> {
    let res: LsblkOutput = serde_json::from_slice(output)?;

    debug!("lsblk reported {} device(s)", res.devices.len());

    Ok(res.devices)
}

/// The partitions of a device we read and write during a flash
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ResolvedPartitions {
    /// Boot Partition Device
    pub boot: PathBuf,

    /// Root Filesystem Partition Device
    pub rootfs: PathBuf,
}

impl BlockDevice {
    /// Returns the first partition whose label starts with [`BOOT_LABEL_PREFIX`]
    #[must_use]
    pub fn boot_partition(&self) -> Option<&Self> {
        self.children.iter().find(|p| {
            p.label
                .as_deref()
                .is_some_and(|l| l.starts_with(BOOT_LABEL_PREFIX))
        })
    }

    /// Returns the first partition labelled [`ROOTFS_LABEL`]
    #[must_use]
    pub fn rootfs_partition(&self) -> Option<&Self> {
        self.children
            .iter()
            .find(|p| p.label.as_deref() == Some(ROOTFS_LABEL))
    }

    /// Returns both partitions, if both can be found
    #[must_use]
    pub fn resolve(&self) -> Option<ResolvedPartitions> {
        let boot = self.boot_partition()?;
        debug!("Boot partition is {}", boot.path.display());

        let rootfs = self.rootfs_partition()?;
        debug!("Root partition is {}", rootfs.path.display());

        Some(ResolvedPartitions {
            boot: boot.path.clone(),
            rootfs: rootfs.path.clone(),
        })
    }
}
