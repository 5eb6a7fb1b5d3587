use std::{ffi::OsString, fs, path::Path};

use log::{info, warn};
use part::{BOOT_IMAGE_BLOCK_SIZE, BOOT_IMAGE_OFFSET};
use types::ImxBootstrapError;

use crate::{
    host::{print_command, Host, ToolCommand},
    pipeline::Outcome,
};

fn key_value(key: &str, path: &Path) -> OsString {
    let mut arg = OsString::from(key);
    arg.push("=");
    arg.push(path);
    arg
}

/// Writes the composite boot image to the raw device, ahead of the first
/// partition
pub(crate) struct ImageWriter<'a> {
    host: &'a dyn Host,
    dry_run: bool,
}

impl<'a> ImageWriter<'a> {
    pub(crate) fn new(host: &'a dyn Host, dry_run: bool) -> Self {
        Self { host, dry_run }
    }

    fn dd(image: &Path, dev: &Path) -> ToolCommand {
        ToolCommand::new("dd")
            .arg(key_value("if", image))
            .arg(key_value("of", dev))
            .arg(format!("bs={}k", BOOT_IMAGE_BLOCK_SIZE >> 10))
            .arg(format!("seek={}", BOOT_IMAGE_OFFSET / BOOT_IMAGE_BLOCK_SIZE))
            .arg("conv=fsync")
    }

    /// Checks the image can be written to `dev`, without touching either
    pub(crate) fn check(&self, image: &Path, dev: &Path) -> Result<(), ImxBootstrapError> {
        let metadata = match fs::metadata(image) {
            Ok(metadata) if metadata.is_file() => metadata,
            _ => return Err(ImxBootstrapError::MissingArtifact(image.to_path_buf())),
        };

        if !self.host.is_block_device(dev)? {
            return Err(ImxBootstrapError::Config(format!(
                "{} isn't a block device",
                dev.display()
            )));
        }

        let capacity = part::boot_image_capacity();
        if metadata.len() > capacity {
            warn!(
                "{} is {} bytes long and will overflow into the first partition ({capacity} bytes available)",
                image.display(),
                metadata.len()
            );
        }

        Ok(())
    }

    pub(crate) fn write(&self, image: &Path, dev: &Path) -> Result<Outcome, ImxBootstrapError> {
        self.check(image, dev)?;

        let cmd = Self::dd(image, dev);

        if self.dry_run {
            print_command(&cmd)?;
            return Ok(Outcome::Done);
        }

        if !self.host.confirm(&format!(
            "{} will be written to {}. Continue?",
            image.display(),
            dev.display()
        ))? {
            info!("Flashing cancelled");
            return Ok(Outcome::Cancelled);
        }

        self.host.run(&cmd)?;
        self.host.run(&ToolCommand::new("sync"))?;

        info!("Boot image written to {}", dev.display());
        Ok(Outcome::Done)
    }
}
