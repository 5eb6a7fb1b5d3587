use std::{
    ffi::OsString,
    fs, io,
    path::{Path, PathBuf},
};

use log::{debug, info, warn};
use types::ImxBootstrapError;

use crate::{
    config::{BuildConfig, DtsSelection},
    host::{Host, ToolCommand},
};

/// Kernel image names we recognize, in the order we look for them
pub(crate) const KERNEL_IMAGE_NAMES: [&str; 4] = ["Image.gz", "Image", "zImage", "uImage"];

/// U-Boot outputs consumed by imx-mkimage
pub(crate) const UBOOT_SPL: &str = "spl/u-boot-spl.bin";
pub(crate) const UBOOT_NODTB: &str = "u-boot-nodtb.bin";
pub(crate) const UBOOT_BIN: &str = "u-boot.bin";
pub(crate) const UBOOT_MKIMAGE: &str = "tools/mkimage";

/// Name of the composite boot image produced by imx-mkimage
pub(crate) const BOOT_IMAGE_NAME: &str = "flash.bin";

const DDR_FIRMWARE_DIR: &str = "firmware/ddr/synopsys";
const DDR_FIRMWARE_PREFIX: &str = "lpddr4";

/// Which variables a make invocation needs to find its toolchain
#[derive(Clone, Copy, Debug)]
enum Toolchain {
    /// The kernel wants both `ARCH` and `CROSS_COMPILE`
    Kernel,

    /// U-Boot and ATF derive the architecture from their configuration
    Cross,

    /// imx-mkimage only builds host tools
    Host,
}

/// Returns the kernel images present in the kernel tree
pub(crate) fn kernel_images(config: &BuildConfig) -> Vec<PathBuf> {
    let boot_dir = config
        .kernel_dir()
        .join("arch")
        .join(config.arch.as_kernel_str())
        .join("boot");

    KERNEL_IMAGE_NAMES
        .iter()
        .map(|name| boot_dir.join(name))
        .filter(|path| path.is_file())
        .collect()
}

/// Returns the DDR training blobs extracted from the firmware package
pub(crate) fn ddr_firmware_blobs(config: &BuildConfig) -> Result<Vec<PathBuf>, ImxBootstrapError> {
    let dir = config.firmware_extract_dir().join(DDR_FIRMWARE_DIR);

    let mut blobs = match fs::read_dir(&dir) {
        Ok(entries) => entries
            .map(|res| res.map(|e| e.path()))
            .collect::<Result<Vec<_>, io::Error>>()?,
        Err(e) if e.kind() == io::ErrorKind::NotFound => Vec::new(),
        Err(e) => return Err(e.into()),
    };

    blobs.retain(|path| {
        path.file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.starts_with(DDR_FIRMWARE_PREFIX) && n.ends_with(".bin"))
    });
    blobs.sort();

    Ok(blobs)
}

fn require(path: &Path) -> Result<(), ImxBootstrapError> {
    if !path.exists() {
        return Err(ImxBootstrapError::MissingArtifact(path.to_path_buf()));
    }

    debug!("Found {}", path.display());
    Ok(())
}

fn is_non_empty_dir(path: &Path) -> Result<bool, ImxBootstrapError> {
    match fs::read_dir(path) {
        Ok(mut entries) => Ok(entries.next().is_some()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

/// Runs the upstream build systems, one stage at a time
pub(crate) struct StageRunner<'a> {
    config: &'a BuildConfig,
    host: &'a dyn Host,
}

impl<'a> StageRunner<'a> {
    pub(crate) fn new(config: &'a BuildConfig, host: &'a dyn Host) -> Self {
        Self { config, host }
    }

    fn make(&self, dir: &Path, toolchain: Toolchain) -> ToolCommand {
        let mut cmd = ToolCommand::new("make").current_dir(dir);

        if let Toolchain::Kernel = toolchain {
            cmd = cmd.env("ARCH", self.config.arch.as_kernel_str());
        }

        if let Toolchain::Kernel | Toolchain::Cross = toolchain {
            cmd = cmd.env("CROSS_COMPILE", &self.config.cross_compile);
        }

        if self.config.verbose {
            cmd = cmd.arg("V=1");
        }

        cmd
    }

    fn jobs(&self) -> String {
        format!("-j{}", self.host.cpu_count())
    }

    /// Configures and builds the kernel. Returns the kernel images found.
    pub(crate) fn kernel(&self) -> Result<Vec<PathBuf>, ImxBootstrapError> {
        let dir = self.config.kernel_dir();
        info!("Building the kernel in {}", dir.display());

        if self.config.clean {
            info!("Cleaning the kernel tree");
            self.host
                .run(&self.make(&dir, Toolchain::Kernel).arg("mrproper"))?;
        }

        self.host.run(
            &self
                .make(&dir, Toolchain::Kernel)
                .arg(&self.config.defconfig),
        )?;
        self.host
            .run(&self.make(&dir, Toolchain::Kernel).arg(self.jobs()))?;

        let images = kernel_images(self.config);
        if images.is_empty() {
            return Err(ImxBootstrapError::MissingArtifact(
                dir.join("arch")
                    .join(self.config.arch.as_kernel_str())
                    .join("boot")
                    .join(KERNEL_IMAGE_NAMES[1]),
            ));
        }

        Ok(images)
    }

    /// Builds the device trees selected in our configuration
    pub(crate) fn device_trees(&self) -> Result<(), ImxBootstrapError> {
        let dir = self.config.kernel_dir();
        let dtb_dir = self.config.dtb_dir();

        match &self.config.custom_dts {
            DtsSelection::All => {
                info!("Building all device trees");

                self.host.run(
                    &self
                        .make(&dir, Toolchain::Kernel)
                        .args([self.jobs().as_str(), "dtbs"]),
                )?;
            }
            DtsSelection::Named(names) => {
                for name in names {
                    require(&dtb_dir.join(format!("{name}.dts")))?;
                }

                for name in names {
                    info!("Building device tree {name}");

                    self.host.run(
                        &self
                            .make(&dir, Toolchain::Kernel)
                            .arg(format!("{}/{name}.dtb", self.config.dts_vendor)),
                    )?;

                    require(&dtb_dir.join(format!("{name}.dtb")))?;
                }
            }
        }

        if !is_non_empty_dir(&dtb_dir)? {
            return Err(ImxBootstrapError::MissingArtifact(dtb_dir));
        }

        Ok(())
    }

    /// Installs the kernel modules into `staging`, recreated from scratch
    pub(crate) fn modules(&self, staging: &Path) -> Result<(), ImxBootstrapError> {
        info!("Installing kernel modules into {}", staging.display());

        if staging.exists() {
            debug!("Removing previous staging directory");
            fs::remove_dir_all(staging)?;
        }
        fs::create_dir_all(staging)?;

        let mut install_path = OsString::from("INSTALL_MOD_PATH=");
        install_path.push(staging);

        self.host.run(
            &self
                .make(&self.config.kernel_dir(), Toolchain::Kernel)
                .arg("modules_install")
                .arg(install_path),
        )?;

        require(&staging.join("lib/modules"))
    }

    /// Configures and builds U-Boot
    pub(crate) fn uboot(&self) -> Result<(), ImxBootstrapError> {
        let dir = self.config.uboot_dir();
        info!("Building U-Boot in {}", dir.display());

        self.host.run(
            &self
                .make(&dir, Toolchain::Cross)
                .arg(&self.config.uboot_defconfig),
        )?;
        self.host
            .run(&self.make(&dir, Toolchain::Cross).arg(self.jobs()))?;

        for output in [UBOOT_BIN, UBOOT_SPL, UBOOT_NODTB, UBOOT_MKIMAGE] {
            require(&dir.join(output))?;
        }

        require(&self.uboot_dtb())
    }

    pub(crate) fn uboot_dtb(&self) -> PathBuf {
        self.config
            .uboot_dir()
            .join("arch/arm/dts")
            .join(&self.config.uboot_dtb)
    }

    /// Builds the BL31 stage of the ARM Trusted Firmware
    pub(crate) fn atf(&self) -> Result<PathBuf, ImxBootstrapError> {
        let dir = self.config.atf_dir();
        info!("Building ATF in {}", dir.display());

        self.host.run(
            &self
                .make(&dir, Toolchain::Cross)
                .arg(format!("PLAT={}", self.config.atf_platform))
                .arg("bl31"),
        )?;

        let bl31 = self.bl31();
        require(&bl31)?;

        Ok(bl31)
    }

    pub(crate) fn bl31(&self) -> PathBuf {
        self.config
            .atf_dir()
            .join("build")
            .join(&self.config.atf_platform)
            .join("release/bl31.bin")
    }

    /// Downloads and extracts the DDR training firmware
    pub(crate) fn firmware(&self) -> Result<Vec<PathBuf>, ImxBootstrapError> {
        let dir = self.config.firmware_dir();
        let archive = dir.join(self.config.firmware_archive_name());
        let extract_dir = self.config.firmware_extract_dir();

        fs::create_dir_all(&dir)?;

        if extract_dir.exists() && ddr_firmware_blobs(self.config)?.is_empty() {
            warn!(
                "{} lacks the DDR firmware, extracting it again",
                extract_dir.display()
            );
            fs::remove_dir_all(&extract_dir)?;
        }

        if extract_dir.exists() {
            debug!(
                "Firmware already extracted in {}, skipping",
                extract_dir.display()
            );
        } else {
            info!("Fetching DDR firmware from {}", self.config.firmware_url);

            self.host.run(
                &ToolCommand::new("wget")
                    .args(["-nc", "-P"])
                    .arg(&dir)
                    .arg(&self.config.firmware_url),
            )?;
            require(&archive)?;

            self.host.run(
                &ToolCommand::new("sh")
                    .current_dir(&dir)
                    .arg(&archive)
                    .arg("--auto-accept"),
            )?;
        }

        let blobs = ddr_firmware_blobs(self.config)?;
        if blobs.is_empty() {
            return Err(ImxBootstrapError::MissingArtifact(
                extract_dir.join(DDR_FIRMWARE_DIR),
            ));
        }

        Ok(blobs)
    }

    /// Composes the boot image. Its inputs must have been staged already.
    pub(crate) fn image(&self) -> Result<PathBuf, ImxBootstrapError> {
        let dir = self.config.mkimage_dir();
        info!("Composing {BOOT_IMAGE_NAME} in {}", dir.display());

        self.host.run(
            &self
                .make(&dir, Toolchain::Host)
                .arg(format!("SOC={}", self.config.mkimage_soc))
                .arg(format!("dtbs={}", self.config.uboot_dtb))
                .arg("CC=gcc")
                .arg(&self.config.mkimage_target),
        )?;

        let image = self.config.mkimage_soc_dir().join(BOOT_IMAGE_NAME);
        require(&image)?;

        Ok(image)
    }
}
