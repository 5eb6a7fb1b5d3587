use core::{fmt, str::FromStr};
use std::{
    fs, io,
    path::{Path, PathBuf},
};

use anyhow::{bail, Context as _};
use log::{debug, info};
use types::ImxBootstrapError;

use crate::{
    config::{BuildConfig, Repository},
    deps::{self, DependencyChecker},
    host::{print_command, Host, ToolCommand},
    partition::PartitionManager,
    repo::RepositorySync,
    stage::StageRunner,
    stager::{self, ArtifactStager},
    writer::ImageWriter,
};

/// How a pipeline, or one of its steps, ended when it didn't fail
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum Outcome {
    Done,

    /// The operator declined a destructive operation
    Cancelled,
}

/// Trees removed by a `clean:` target
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum CleanTarget {
    Uboot,
    Atf,
    Image,
    All,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum BuildTarget {
    Kernel,
    Dts,
    Uboot,
    Atf,
    Image,
    Build,
    Flash,
    Clean(CleanTarget),
}

impl FromStr for BuildTarget {
    type Err = ImxBootstrapError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "kernel" => Self::Kernel,
            "dts" => Self::Dts,
            "uboot" => Self::Uboot,
            "atf" => Self::Atf,
            "image" => Self::Image,
            "build" | "all" => Self::Build,
            "flash" => Self::Flash,
            "clean:uboot" => Self::Clean(CleanTarget::Uboot),
            "clean:atf" => Self::Clean(CleanTarget::Atf),
            "clean:image" => Self::Clean(CleanTarget::Image),
            "clean:all" => Self::Clean(CleanTarget::All),
            _ => {
                return Err(ImxBootstrapError::Config(format!(
                    "Unknown build target: {s}"
                )))
            }
        })
    }
}

impl fmt::Display for BuildTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Kernel => "kernel",
            Self::Dts => "dts",
            Self::Uboot => "uboot",
            Self::Atf => "atf",
            Self::Image => "image",
            Self::Build => "build",
            Self::Flash => "flash",
            Self::Clean(CleanTarget::Uboot) => "clean:uboot",
            Self::Clean(CleanTarget::Atf) => "clean:atf",
            Self::Clean(CleanTarget::Image) => "clean:image",
            Self::Clean(CleanTarget::All) => "clean:all",
        };

        f.write_str(name)
    }
}

impl BuildTarget {
    fn builds(self) -> bool {
        !matches!(self, Self::Flash | Self::Clean(_))
    }
}

/// Runs the steps of a build target, in order, stopping at the first failure
pub(crate) struct Pipeline<'a> {
    config: &'a BuildConfig,
    host: &'a dyn Host,
}

impl<'a> Pipeline<'a> {
    pub(crate) fn new(config: &'a BuildConfig, host: &'a dyn Host) -> Self {
        Self { config, host }
    }

    fn runner(&self) -> StageRunner<'a> {
        StageRunner::new(self.config, self.host)
    }

    fn stager(&self) -> ArtifactStager<'a> {
        ArtifactStager::new(self.config, self.host)
    }

    fn sync(&self, name: &str, repo: &Repository, dest: &Path) -> anyhow::Result<()> {
        RepositorySync::new(self.host)
            .sync(repo, dest)
            .with_context(|| format!("Couldn't sync the {name} repository ({})", repo.url))
    }

    fn flash_device(&self) -> anyhow::Result<&'a Path> {
        let config: &'a BuildConfig = self.config;

        match config.flash_device.as_deref() {
            Some(dev) => Ok(dev),
            None => bail!(ImxBootstrapError::Config(String::from(
                "Flash device required, use --flash-device"
            ))),
        }
    }

    /// Checks we will be able to flash, before doing anything else
    fn check_flash_device(&self) -> anyhow::Result<&'a Path> {
        let dev = self.flash_device()?;

        if !self.config.dry_run && !self.host.is_root() {
            bail!(ImxBootstrapError::Config(String::from(
                "Flashing a device requires root privileges"
            )));
        }

        if !self.host.is_block_device(dev)? {
            bail!(ImxBootstrapError::Config(format!(
                "{} isn't a block device",
                dev.display()
            )));
        }

        Ok(dev)
    }

    pub(crate) fn run(&self, target: BuildTarget) -> anyhow::Result<Outcome> {
        info!("Running the {target} target");

        let flashes = target == BuildTarget::Flash
            || (target == BuildTarget::Build && self.config.flash_device.is_some());

        if flashes {
            self.check_flash_device()?;
        }

        let mut tools = Vec::new();
        if target.builds() {
            tools.extend(deps::build_tools(&self.config.cross_compile));
        }

        if flashes {
            tools.extend(deps::flash_tools());
        }

        if !tools.is_empty() {
            DependencyChecker::new(self.host)
                .ensure(&tools)
                .context("Dependency check failed")?;
        }

        match target {
            BuildTarget::Kernel => {
                self.sync("kernel", &self.config.kernel, &self.config.kernel_dir())?;
                self.kernel()?;
            }
            BuildTarget::Dts => {
                self.sync("kernel", &self.config.kernel, &self.config.kernel_dir())?;
                self.device_trees()?;
            }
            BuildTarget::Uboot => {
                self.sync("U-Boot", &self.config.uboot, &self.config.uboot_dir())?;
                self.runner().uboot().context("U-Boot build failed")?;
            }
            BuildTarget::Atf => {
                self.sync("ATF", &self.config.atf, &self.config.atf_dir())?;
                self.runner().atf().context("ATF build failed")?;
            }
            BuildTarget::Image => self.image()?,
            BuildTarget::Build => return self.build(),
            BuildTarget::Flash => return self.flash(),
            BuildTarget::Clean(what) => self.clean(what)?,
        }

        Ok(Outcome::Done)
    }

    fn kernel(&self) -> anyhow::Result<()> {
        self.runner().kernel().context("Kernel build failed")?;
        self.stager()
            .stage_kernel()
            .context("Couldn't stage the kernel images")?;

        Ok(())
    }

    fn device_trees(&self) -> anyhow::Result<()> {
        self.runner()
            .device_trees()
            .context("Device tree build failed")?;
        self.stager()
            .stage_dtbs()
            .context("Couldn't stage the device trees")?;

        Ok(())
    }

    fn modules(&self) -> anyhow::Result<()> {
        self.runner()
            .modules(&self.config.modules_staging_dir())
            .context("Kernel modules installation failed")?;
        self.stager()
            .stage_modules()
            .context("Couldn't stage the kernel modules")?;

        Ok(())
    }

    fn image(&self) -> anyhow::Result<()> {
        self.sync("U-Boot", &self.config.uboot, &self.config.uboot_dir())?;
        self.sync("ATF", &self.config.atf, &self.config.atf_dir())?;
        self.sync("imx-mkimage", &self.config.mkimage, &self.config.mkimage_dir())?;

        let runner = self.runner();
        runner.uboot().context("U-Boot build failed")?;
        runner.atf().context("ATF build failed")?;
        let blobs = runner
            .firmware()
            .context("Couldn't retrieve the DDR firmware")?;

        let stager = self.stager();
        stager
            .stage_mkimage_inputs(&blobs)
            .context("Couldn't stage the imx-mkimage inputs")?;

        let image = runner.image().context("Boot image composition failed")?;
        stager
            .stage_boot_image(&image)
            .context("Couldn't stage the boot image")?;

        Ok(())
    }

    fn build(&self) -> anyhow::Result<Outcome> {
        self.sync("kernel", &self.config.kernel, &self.config.kernel_dir())?;
        self.kernel()?;
        self.device_trees()?;
        self.modules()?;
        self.image()?;

        if self.config.flash_device.is_none() {
            info!("No flash device given, skipping flashing");
            return Ok(Outcome::Done);
        }

        self.flash()
    }

    fn flash(&self) -> anyhow::Result<Outcome> {
        let dev = self.check_flash_device()?;
        let stager = self.stager();
        let image = stager.boot_image();

        let writer = ImageWriter::new(self.host, self.config.dry_run);
        writer
            .check(&image, dev)
            .with_context(|| format!("Can't write {} to {}", image.display(), dev.display()))?;

        let manager = PartitionManager::new(self.host, self.config.dry_run);
        let parts = manager
            .resolve(dev)
            .with_context(|| format!("Couldn't set up the partitions of {}", dev.display()))?;

        if self.config.dry_run {
            writer.write(&image, dev)?;
            return Ok(Outcome::Done);
        }

        let Some(parts) = parts else {
            return Ok(Outcome::Cancelled);
        };

        let outcome = writer
            .write(&image, dev)
            .with_context(|| format!("Couldn't write the boot image to {}", dev.display()))?;

        if outcome == Outcome::Cancelled {
            return Ok(outcome);
        }

        let mounted = manager
            .mount(&parts)
            .with_context(|| format!("Couldn't mount the partitions of {}", dev.display()))?;

        let boot = mounted.boot_dir()?;
        let rootfs = mounted.rootfs_dir()?;
        let everything = |_: &Path| true;

        info!("Copying the kernel and device trees to {}", parts.boot.display());
        stager::copy_tree(&stager.kernel_dir(), &boot, &everything)
            .context("Couldn't copy the kernel to the boot partition")?;
        stager::copy_tree(&stager.selected_dtbs_dir(), &boot, &everything)
            .context("Couldn't copy the device trees to the boot partition")?;

        info!("Copying the kernel modules to {}", parts.rootfs.display());
        stager::copy_tree(&stager.modules_dir(), &rootfs, &everything)
            .context("Couldn't copy the kernel modules to the root partition")?;

        self.host.run(&ToolCommand::new("sync"))?;
        drop(mounted);

        info!("{} flashed successfully", dev.display());
        Ok(Outcome::Done)
    }

    fn clean_dirs(&self, what: CleanTarget) -> Vec<PathBuf> {
        let config = self.config;

        match what {
            CleanTarget::Uboot => vec![config.uboot_dir()],
            CleanTarget::Atf => vec![config.atf_dir()],
            CleanTarget::Image => vec![config.mkimage_dir(), config.firmware_dir()],
            CleanTarget::All => vec![
                config.kernel_dir(),
                config.uboot_dir(),
                config.atf_dir(),
                config.mkimage_dir(),
                config.firmware_dir(),
                config.modules_staging_dir(),
                config.output_dir.clone(),
            ],
        }
    }

    fn clean(&self, what: CleanTarget) -> anyhow::Result<()> {
        for dir in self.clean_dirs(what) {
            if self.config.dry_run {
                print_command(&ToolCommand::new("rm").arg("-rf").arg(&dir))?;
                continue;
            }

            match fs::remove_dir_all(&dir) {
                Ok(()) => info!("Removed {}", dir.display()),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    debug!("{} doesn't exist, nothing to remove", dir.display());
                }
                Err(e) => {
                    return Err(e).with_context(|| format!("Couldn't remove {}", dir.display()))
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use core::str::FromStr as _;
    use std::{fs, path::Path};

    use tempfile::TempDir;
    use test_log::test;
    use types::ImxBootstrapError;

    use super::{BuildTarget, CleanTarget, Outcome, Pipeline};
    use crate::{
        config::{tests::config_in, BuildConfig},
        host::{testing::RecordingHost, ToolCommand},
    };

    const BLANK: &str = r#"{"blockdevices": [{"path": "/dev/sdb", "label": null, "fstype": null}]}"#;

    const UNFORMATTED: &str = r#"
    {
        "blockdevices": [
            {
                "path": "/dev/sdb",
                "children": [
                    { "path": "/dev/sdb1", "label": null, "fstype": null },
                    { "path": "/dev/sdb2", "label": null, "fstype": null }
                ]
            }
        ]
    }
    "#;

    const FORMATTED: &str = r#"
    {
        "blockdevices": [
            {
                "path": "/dev/sdb",
                "children": [
                    { "path": "/dev/sdb1", "label": "BOOT-IMX", "fstype": "vfat" },
                    { "path": "/dev/sdb2", "label": "rootfs", "fstype": "ext4" }
                ]
            }
        ]
    }
    "#;

    fn touch(path: &Path) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, b"").unwrap();
    }

    /// Creates what each upstream build system would have produced
    fn fake_builds(
        config: &BuildConfig,
    ) -> impl Fn(&ToolCommand) -> Result<(), ImxBootstrapError> + 'static {
        let kernel = config.kernel_dir();
        let kernel_image = kernel.join("arch/arm64/boot/Image");
        let dtb = config.dtb_dir().join("imx8mp-evk.dtb");
        let staging = config.modules_staging_dir();
        let uboot = config.uboot_dir();
        let atf = config.atf_dir();
        let bl31 = atf.join("build/imx8mp/release/bl31.bin");
        let firmware = config.firmware_dir();
        let ddr = config
            .firmware_extract_dir()
            .join("firmware/ddr/synopsys/lpddr4_pmu_train_1d_imem.bin");
        let mkimage = config.mkimage_dir();
        let boot_image = config.mkimage_soc_dir().join("flash.bin");

        move |cmd| {
            let argv = cmd.argv();

            match cmd.program().to_str().unwrap() {
                "wget" => touch(&firmware.join("firmware-imx-8.21.bin")),
                "sh" => touch(&ddr),
                "make" if cmd.cwd() == Some(kernel.as_path()) => {
                    if argv.iter().any(|a| a == "modules_install") {
                        touch(&staging.join("lib/modules/6.6.52/modules.dep"));
                    } else {
                        touch(&kernel_image);
                        touch(&dtb);
                    }
                }
                "make" if cmd.cwd() == Some(uboot.as_path()) => {
                    for output in [
                        "u-boot.bin",
                        "u-boot-nodtb.bin",
                        "spl/u-boot-spl.bin",
                        "tools/mkimage",
                        "arch/arm/dts/imx8mp-evk.dtb",
                    ] {
                        touch(&uboot.join(output));
                    }
                }
                "make" if cmd.cwd() == Some(atf.as_path()) => touch(&bl31),
                "make" if cmd.cwd() == Some(mkimage.as_path()) => touch(&boot_image),
                _ => {}
            }

            Ok(())
        }
    }

    #[test]
    fn target_names() {
        assert_eq!(BuildTarget::from_str("all").unwrap(), BuildTarget::Build);
        assert_eq!(BuildTarget::from_str("build").unwrap(), BuildTarget::Build);
        assert_eq!(
            BuildTarget::from_str("clean:image").unwrap(),
            BuildTarget::Clean(CleanTarget::Image)
        );
        assert_eq!(
            BuildTarget::Clean(CleanTarget::Atf).to_string(),
            "clean:atf"
        );
        assert!(BuildTarget::from_str("clean:kernel").is_err());
        assert!(BuildTarget::from_str("rootfs").is_err());
    }

    #[test]
    fn flash_requires_a_device() {
        let tmp = TempDir::new().unwrap();
        let config = config_in(tmp.path());
        let host = RecordingHost::new().without_tools(&["dd"]);

        let err = Pipeline::new(&config, &host)
            .run(BuildTarget::Flash)
            .unwrap_err();

        assert!(matches!(
            err.downcast_ref::<ImxBootstrapError>(),
            Some(ImxBootstrapError::Config(msg)) if msg.contains("device required")
        ));
        assert!(host.commands.borrow().is_empty());
        assert!(host.prompts.borrow().is_empty());
        assert!(!config.output_dir.exists());
    }

    #[test]
    fn dts_on_fresh_tree() {
        let tmp = TempDir::new().unwrap();
        let config = config_in(tmp.path());
        let host = RecordingHost::new();

        let err = Pipeline::new(&config, &host)
            .run(BuildTarget::Dts)
            .unwrap_err();

        assert!(matches!(
            err.downcast_ref::<ImxBootstrapError>(),
            Some(ImxBootstrapError::MissingArtifact(dir)) if *dir == config.dtb_dir()
        ));

        let argvs = host.argvs();
        assert_eq!(host.programs(), ["git", "make"]);
        assert_eq!(argvs[0][1], "clone");
        assert_eq!(argvs[1][1..], ["-j4", "dtbs"]);
    }

    #[test]
    fn flash_existing_partitions() {
        let tmp = TempDir::new().unwrap();
        let mut config = config_in(tmp.path());
        let dev = Path::new("/dev/sdb");
        config.flash_device = Some(dev.to_path_buf());

        let output = &config.output_dir;
        fs::create_dir_all(output.join("kernel")).unwrap();
        fs::create_dir_all(output.join("dtbs")).unwrap();
        fs::create_dir_all(output.join("modules/lib/modules/6.6.52")).unwrap();
        fs::write(output.join("flash.bin"), b"boot image").unwrap();
        fs::write(output.join("kernel/Image"), b"kernel").unwrap();
        fs::write(output.join("dtbs/imx8mp-evk.dtb"), b"dtb").unwrap();
        fs::write(output.join("modules/lib/modules/6.6.52/modules.dep"), b"").unwrap();

        let host = RecordingHost::new()
            .with_block_device(dev)
            .with_output(FORMATTED);

        let outcome = Pipeline::new(&config, &host)
            .run(BuildTarget::Flash)
            .unwrap();

        assert_eq!(outcome, Outcome::Done);
        assert_eq!(host.programs(), ["lsblk", "dd", "sync", "sync"]);
        assert_eq!(host.mounts.borrow().len(), 2);
        assert_eq!(host.unmounts.borrow().len(), 2);
        assert_eq!(host.mounts.borrow()[0].0, Path::new("/dev/sdb1"));
    }

    #[test]
    fn flash_requires_root() {
        let tmp = TempDir::new().unwrap();
        let mut config = config_in(tmp.path());
        config.flash_device = Some(Path::new("/dev/sdb").to_path_buf());
        let host = RecordingHost::new().unprivileged();

        let res = Pipeline::new(&config, &host).run(BuildTarget::Flash);

        assert!(res.is_err());
        assert!(host.commands.borrow().is_empty());
    }

    #[test]
    fn flash_cancelled() {
        let tmp = TempDir::new().unwrap();
        let mut config = config_in(tmp.path());
        let dev = Path::new("/dev/sdb");
        config.flash_device = Some(dev.to_path_buf());
        fs::create_dir_all(&config.output_dir).unwrap();
        fs::write(config.output_dir.join("flash.bin"), b"boot image").unwrap();
        let host = RecordingHost::new()
            .answering(false)
            .with_block_device(dev)
            .with_output(FORMATTED);

        let outcome = Pipeline::new(&config, &host)
            .run(BuildTarget::Flash)
            .unwrap();

        assert_eq!(outcome, Outcome::Cancelled);
        assert_eq!(host.programs(), ["lsblk"]);
        assert_eq!(host.prompts.borrow().len(), 1);
        assert!(host.mounts.borrow().is_empty());
    }

    #[test]
    fn declined_partitioning_never_writes() {
        let tmp = TempDir::new().unwrap();
        let mut config = config_in(tmp.path());
        let dev = Path::new("/dev/sdb");
        config.flash_device = Some(dev.to_path_buf());
        fs::create_dir_all(&config.output_dir).unwrap();
        fs::write(config.output_dir.join("flash.bin"), b"boot image").unwrap();
        let host = RecordingHost::new()
            .answering(false)
            .with_block_device(dev)
            .with_output(BLANK);

        let outcome = Pipeline::new(&config, &host)
            .run(BuildTarget::Flash)
            .unwrap();

        assert_eq!(outcome, Outcome::Cancelled);
        assert_eq!(host.programs(), ["lsblk"]);
        assert_eq!(host.prompts.borrow().len(), 1);
    }

    #[test]
    fn failed_partitioning_never_writes() {
        let tmp = TempDir::new().unwrap();
        let mut config = config_in(tmp.path());
        let dev = Path::new("/dev/sdb");
        config.flash_device = Some(dev.to_path_buf());
        fs::create_dir_all(&config.output_dir).unwrap();
        fs::write(config.output_dir.join("flash.bin"), b"boot image").unwrap();

        // The partitions never get their labels
        let host = RecordingHost::new()
            .with_block_device(dev)
            .with_output(BLANK)
            .with_output(UNFORMATTED)
            .with_output(UNFORMATTED);

        let res = Pipeline::new(&config, &host).run(BuildTarget::Flash);

        assert!(res.is_err());
        assert!(host.programs().contains(&String::from("parted")));
        assert!(!host.programs().contains(&String::from("dd")));
        assert!(host.mounts.borrow().is_empty());
    }

    #[test]
    fn flash_dry_run() {
        let tmp = TempDir::new().unwrap();
        let mut config = config_in(tmp.path());
        let dev = Path::new("/dev/sdb");
        config.flash_device = Some(dev.to_path_buf());
        config.dry_run = true;
        fs::create_dir_all(&config.output_dir).unwrap();
        fs::write(config.output_dir.join("flash.bin"), b"boot image").unwrap();
        let host = RecordingHost::new()
            .unprivileged()
            .with_block_device(dev)
            .with_output(FORMATTED);

        let outcome = Pipeline::new(&config, &host)
            .run(BuildTarget::Flash)
            .unwrap();

        assert_eq!(outcome, Outcome::Done);
        assert_eq!(host.programs(), ["lsblk"]);
        assert!(host.prompts.borrow().is_empty());
        assert!(host.mounts.borrow().is_empty());
    }

    #[test]
    fn build_checks_the_device_before_building() {
        let tmp = TempDir::new().unwrap();
        let mut config = config_in(tmp.path());
        config.flash_device = Some(Path::new("/dev/sdb").to_path_buf());

        let host = RecordingHost::new();
        let err = Pipeline::new(&config, &host)
            .run(BuildTarget::Build)
            .unwrap_err();

        assert!(matches!(
            err.downcast_ref::<ImxBootstrapError>(),
            Some(ImxBootstrapError::Config(msg)) if msg.contains("isn't a block device")
        ));
        assert!(host.commands.borrow().is_empty());

        let host = RecordingHost::new()
            .unprivileged()
            .with_block_device(Path::new("/dev/sdb"));
        let err = Pipeline::new(&config, &host)
            .run(BuildTarget::Build)
            .unwrap_err();

        assert!(matches!(
            err.downcast_ref::<ImxBootstrapError>(),
            Some(ImxBootstrapError::Config(msg)) if msg.contains("root")
        ));
        assert!(host.commands.borrow().is_empty());
        assert!(!config.output_dir.exists());
    }

    #[test]
    fn kernel_target() {
        let tmp = TempDir::new().unwrap();
        let config = config_in(tmp.path());
        let host = RecordingHost::new().with_hook(fake_builds(&config));

        let outcome = Pipeline::new(&config, &host)
            .run(BuildTarget::Kernel)
            .unwrap();

        assert_eq!(outcome, Outcome::Done);
        assert_eq!(
            host.argvs(),
            [
                vec![
                    String::from("git"),
                    String::from("clone"),
                    String::from("--branch"),
                    String::from("lf-6.6.y"),
                    String::from("https://github.com/nxp-imx/linux-imx.git"),
                    config.kernel_dir().display().to_string(),
                ],
                vec![String::from("make"), String::from("imx_v8_defconfig")],
                vec![String::from("make"), String::from("-j4")],
            ]
        );
        assert!(config.output_dir.join("kernel/Image").is_file());
    }

    #[test]
    fn image_target() {
        let tmp = TempDir::new().unwrap();
        let config = config_in(tmp.path());
        let host = RecordingHost::new().with_hook(fake_builds(&config));

        Pipeline::new(&config, &host)
            .run(BuildTarget::Image)
            .unwrap();

        let argvs = host.argvs();
        assert_eq!(
            host.programs(),
            ["git", "git", "git", "make", "make", "make", "wget", "sh", "make"]
        );
        assert!(argvs[0].contains(&config.uboot_dir().display().to_string()));
        assert!(argvs[1].contains(&config.atf_dir().display().to_string()));
        assert!(argvs[2].contains(&config.mkimage_dir().display().to_string()));
        assert_eq!(argvs[3][1..], ["imx8mp_evk_defconfig"]);
        assert_eq!(argvs[4][1..], ["-j4"]);
        assert_eq!(argvs[5][1..], ["PLAT=imx8mp", "bl31"]);
        assert_eq!(argvs[7].last().unwrap(), "--auto-accept");
        assert_eq!(
            argvs[8][1..],
            ["SOC=iMX8MP", "dtbs=imx8mp-evk.dtb", "CC=gcc", "flash_evk"]
        );

        let soc_dir = config.mkimage_soc_dir();
        for input in [
            "u-boot-spl.bin",
            "u-boot-nodtb.bin",
            "imx8mp-evk.dtb",
            "bl31.bin",
            "lpddr4_pmu_train_1d_imem.bin",
        ] {
            assert!(soc_dir.join(input).is_file(), "{input} wasn't staged");
        }
        assert!(config.output_dir.join("flash.bin").is_file());
    }

    #[test]
    fn build_without_device() {
        let tmp = TempDir::new().unwrap();
        let config = config_in(tmp.path());
        let host = RecordingHost::new().with_hook(fake_builds(&config));

        let outcome = Pipeline::new(&config, &host)
            .run(BuildTarget::Build)
            .unwrap();

        assert_eq!(outcome, Outcome::Done);

        let argvs = host.argvs();
        assert_eq!(
            host.programs(),
            [
                "git", "make", "make", "make", "make", "git", "git", "git", "make", "make", "make",
                "wget", "sh", "make"
            ]
        );
        assert_eq!(argvs[1][1..], ["imx_v8_defconfig"]);
        assert_eq!(argvs[2][1..], ["-j4"]);
        assert_eq!(argvs[3][1..], ["-j4", "dtbs"]);
        assert_eq!(argvs[4][1], "modules_install");
        assert_eq!(argvs[8][1..], ["imx8mp_evk_defconfig"]);
        assert!(host.prompts.borrow().is_empty());
        assert!(host.mounts.borrow().is_empty());

        let output = &config.output_dir;
        assert!(output.join("kernel/Image").is_file());
        assert!(output.join("dtbs/imx8mp-evk.dtb").is_file());
        assert!(output.join("modules/lib/modules/6.6.52/modules.dep").is_file());
        assert!(output.join("flash.bin").is_file());
    }

    #[test]
    fn clean_image() {
        let tmp = TempDir::new().unwrap();
        let config = config_in(tmp.path());
        fs::create_dir_all(config.mkimage_dir().join("iMX8M")).unwrap();
        fs::create_dir_all(config.uboot_dir()).unwrap();

        Pipeline::new(&config, &RecordingHost::new())
            .run(BuildTarget::Clean(CleanTarget::Image))
            .unwrap();

        assert!(!config.mkimage_dir().exists());
        assert!(config.uboot_dir().exists());
    }

    #[test]
    fn clean_dry_run_keeps_trees() {
        let tmp = TempDir::new().unwrap();
        let mut config = config_in(tmp.path());
        config.dry_run = true;
        fs::create_dir_all(config.kernel_dir()).unwrap();

        Pipeline::new(&config, &RecordingHost::new())
            .run(BuildTarget::Clean(CleanTarget::All))
            .unwrap();

        assert!(config.kernel_dir().exists());
    }
}
