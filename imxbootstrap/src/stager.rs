use std::{
    fs, io,
    os::unix::fs as unix_fs,
    path::{Path, PathBuf},
};

use log::{debug, info, trace};
use types::ImxBootstrapError;
use walkdir::WalkDir;

use crate::{
    config::{BuildConfig, DtsSelection},
    host::Host,
    stage::{self, BOOT_IMAGE_NAME, UBOOT_NODTB, UBOOT_SPL},
};

const OUTPUT_KERNEL_DIR: &str = "kernel";
const OUTPUT_DTBS_DIR: &str = "dtbs";
const OUTPUT_MODULES_DIR: &str = "modules";
const CUSTOM_DTBS_DIR: &str = "custom";

/// Name imx-mkimage expects for the U-Boot `mkimage` tool
const MKIMAGE_UBOOT: &str = "mkimage_uboot";

fn copy_file(src: &Path, dst: &Path) -> Result<(), ImxBootstrapError> {
    if !src.is_file() {
        return Err(ImxBootstrapError::MissingArtifact(src.to_path_buf()));
    }

    trace!("Copying {} to {}", src.display(), dst.display());

    fs::copy(src, dst)?;
    Ok(())
}

/// Recursively copies the files of `src` accepted by `filter` into `dst`,
/// recreating symbolic links instead of following them. Returns the number of
/// files copied.
pub(crate) fn copy_tree(
    src: &Path,
    dst: &Path,
    filter: &dyn Fn(&Path) -> bool,
) -> Result<usize, ImxBootstrapError> {
    fs::create_dir_all(dst)?;

    let mut copied = 0;
    for entry in WalkDir::new(src) {
        let entry = entry.map_err(io::Error::from)?;
        let path = entry.path();
        let rel = path.strip_prefix(src).map_err(|e| {
            ImxBootstrapError::Custom(format!("{} isn't in {}: {e}", path.display(), src.display()))
        })?;

        if rel.as_os_str().is_empty() {
            continue;
        }

        let target = dst.join(rel);
        let file_type = entry.file_type();

        if file_type.is_dir() {
            fs::create_dir_all(&target)?;
        } else if file_type.is_symlink() {
            let link = fs::read_link(path)?;

            trace!("Recreating link {} -> {}", target.display(), link.display());

            match fs::remove_file(&target) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
            unix_fs::symlink(link, &target)?;
        } else if filter(path) {
            copy_file(path, &target)?;
            copied += 1;
        }
    }

    Ok(copied)
}

fn is_device_tree_blob(path: &Path) -> bool {
    path.extension()
        .is_some_and(|ext| ext == "dtb" || ext == "dtbo")
}

fn recreate_dir(dir: &Path) -> Result<(), ImxBootstrapError> {
    if dir.exists() {
        fs::remove_dir_all(dir)?;
    }

    fs::create_dir_all(dir)?;
    Ok(())
}

/// Moves the outputs of one stage to where the next one, or the operator,
/// expects them
pub(crate) struct ArtifactStager<'a> {
    config: &'a BuildConfig,
    host: &'a dyn Host,
}

impl<'a> ArtifactStager<'a> {
    pub(crate) fn new(config: &'a BuildConfig, host: &'a dyn Host) -> Self {
        Self { config, host }
    }

    pub(crate) fn kernel_dir(&self) -> PathBuf {
        self.config.output_dir.join(OUTPUT_KERNEL_DIR)
    }

    pub(crate) fn dtbs_dir(&self) -> PathBuf {
        self.config.output_dir.join(OUTPUT_DTBS_DIR)
    }

    /// Directory holding the device trees we selected, once staged
    pub(crate) fn selected_dtbs_dir(&self) -> PathBuf {
        match &self.config.custom_dts {
            DtsSelection::All => self.dtbs_dir(),
            DtsSelection::Named(_) => self.dtbs_dir().join(CUSTOM_DTBS_DIR),
        }
    }

    pub(crate) fn modules_dir(&self) -> PathBuf {
        self.config.output_dir.join(OUTPUT_MODULES_DIR)
    }

    pub(crate) fn boot_image(&self) -> PathBuf {
        self.config.output_dir.join(BOOT_IMAGE_NAME)
    }

    /// Creates our output tree, or checks we can write to the existing one
    pub(crate) fn prepare_output(&self) -> Result<(), ImxBootstrapError> {
        let output = &self.config.output_dir;

        if output.exists() {
            if !output.is_dir() {
                return Err(ImxBootstrapError::Config(format!(
                    "Output path {} isn't a directory",
                    output.display()
                )));
            }

            if !self.host.is_writable(output) {
                return Err(ImxBootstrapError::Config(format!(
                    "Output directory {} isn't writable",
                    output.display()
                )));
            }
        } else {
            debug!("Creating output directory {}", output.display());
        }

        for dir in [self.kernel_dir(), self.dtbs_dir(), self.modules_dir()] {
            fs::create_dir_all(dir)?;
        }

        Ok(())
    }

    /// Copies every kernel image we recognize to the output tree
    pub(crate) fn stage_kernel(&self) -> Result<Vec<PathBuf>, ImxBootstrapError> {
        self.prepare_output()?;

        let images = stage::kernel_images(self.config);
        if images.is_empty() {
            return Err(ImxBootstrapError::MissingArtifact(self.config.kernel_dir()));
        }

        let mut staged = Vec::with_capacity(images.len());
        for image in images {
            let Some(name) = image.file_name() else {
                continue;
            };

            let target = self.kernel_dir().join(name);
            copy_file(&image, &target)?;
            staged.push(target);
        }

        info!("Staged {} kernel image(s)", staged.len());
        Ok(staged)
    }

    /// Copies the selected device tree blobs to the output tree
    pub(crate) fn stage_dtbs(&self) -> Result<(), ImxBootstrapError> {
        self.prepare_output()?;

        let dtb_dir = self.config.dtb_dir();

        match &self.config.custom_dts {
            DtsSelection::All => {
                let dtbs = self.dtbs_dir();
                recreate_dir(&dtbs)?;

                let count = copy_tree(&dtb_dir, &dtbs, &is_device_tree_blob)?;
                info!("Staged {count} device tree blob(s)");
            }
            DtsSelection::Named(names) => {
                let custom = self.selected_dtbs_dir();
                recreate_dir(&custom)?;

                for name in names {
                    let blob = format!("{name}.dtb");
                    copy_file(&dtb_dir.join(&blob), &custom.join(&blob))?;
                }

                info!("Staged {} custom device tree blob(s)", names.len());
            }
        }

        Ok(())
    }

    /// Copies the installed modules tree to the output tree
    pub(crate) fn stage_modules(&self) -> Result<(), ImxBootstrapError> {
        self.prepare_output()?;

        let modules = self.modules_dir();
        recreate_dir(&modules)?;

        let count = copy_tree(&self.config.modules_staging_dir(), &modules, &|_: &Path| true)?;
        info!("Staged {count} module file(s)");

        Ok(())
    }

    /// Gathers the bootloader, firmware and DDR blobs where imx-mkimage
    /// expects them
    pub(crate) fn stage_mkimage_inputs(
        &self,
        ddr_blobs: &[PathBuf],
    ) -> Result<(), ImxBootstrapError> {
        let soc_dir = self.config.mkimage_soc_dir();
        let uboot = self.config.uboot_dir();
        let runner = stage::StageRunner::new(self.config, self.host);

        info!("Staging imx-mkimage inputs into {}", soc_dir.display());
        fs::create_dir_all(&soc_dir)?;

        copy_file(&uboot.join(UBOOT_SPL), &soc_dir.join("u-boot-spl.bin"))?;
        copy_file(&uboot.join(UBOOT_NODTB), &soc_dir.join(UBOOT_NODTB))?;
        copy_file(&runner.uboot_dtb(), &soc_dir.join(&self.config.uboot_dtb))?;
        copy_file(&uboot.join(stage::UBOOT_MKIMAGE), &soc_dir.join(MKIMAGE_UBOOT))?;
        copy_file(&runner.bl31(), &soc_dir.join("bl31.bin"))?;

        for blob in ddr_blobs {
            let Some(name) = blob.file_name() else {
                continue;
            };

            copy_file(blob, &soc_dir.join(name))?;
        }

        Ok(())
    }

    /// Copies the composite boot image to the output tree
    pub(crate) fn stage_boot_image(&self, image: &Path) -> Result<PathBuf, ImxBootstrapError> {
        self.prepare_output()?;

        let target = self.boot_image();
        copy_file(image, &target)?;

        info!("Boot image available at {}", target.display());
        Ok(target)
    }
}

#[cfg(test)]
mod tests {
    use std::{fs, os::unix::fs as unix_fs, path::Path};

    use tempfile::TempDir;
    use test_log::test;
    use types::ImxBootstrapError;

    use super::ArtifactStager;
    use crate::{config::tests::config_in, host::testing::RecordingHost};

    fn touch(path: &Path) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, path.display().to_string()).unwrap();
    }

    #[test]
    fn read_only_output_is_rejected() {
        let tmp = TempDir::new().unwrap();
        let config = config_in(tmp.path());
        fs::create_dir_all(&config.output_dir).unwrap();

        let host = RecordingHost::new().with_read_only(&config.output_dir);
        let res = ArtifactStager::new(&config, &host).prepare_output();

        assert!(matches!(res, Err(ImxBootstrapError::Config(_))));
    }

    #[test]
    fn output_tree_is_created() {
        let tmp = TempDir::new().unwrap();
        let config = config_in(tmp.path());
        let host = RecordingHost::new();

        ArtifactStager::new(&config, &host).prepare_output().unwrap();

        for dir in ["kernel", "dtbs", "modules"] {
            assert!(config.output_dir.join(dir).is_dir());
        }
    }

    #[test]
    fn every_kernel_image_is_staged() {
        let tmp = TempDir::new().unwrap();
        let config = config_in(tmp.path());
        let boot = config.kernel_dir().join("arch/arm64/boot");
        touch(&boot.join("Image"));
        touch(&boot.join("Image.gz"));
        touch(&boot.join("vmlinux.bin"));

        let host = RecordingHost::new();
        let stager = ArtifactStager::new(&config, &host);
        let staged = stager.stage_kernel().unwrap();

        assert_eq!(
            staged,
            [
                stager.kernel_dir().join("Image.gz"),
                stager.kernel_dir().join("Image")
            ]
        );
        assert!(!stager.kernel_dir().join("vmlinux.bin").exists());
    }

    #[test]
    fn all_dtbs_are_staged() {
        let tmp = TempDir::new().unwrap();
        let config = config_in(tmp.path());
        let dtb_dir = config.dtb_dir();
        touch(&dtb_dir.join("imx8mp-evk.dtb"));
        touch(&dtb_dir.join("imx8mp-evk.dts"));
        touch(&dtb_dir.join("overlays/imx8mp-evk-lcd.dtbo"));

        let host = RecordingHost::new();
        let stager = ArtifactStager::new(&config, &host);
        stager.stage_dtbs().unwrap();

        assert!(stager.dtbs_dir().join("imx8mp-evk.dtb").exists());
        assert!(stager.dtbs_dir().join("overlays/imx8mp-evk-lcd.dtbo").exists());
        assert!(!stager.dtbs_dir().join("imx8mp-evk.dts").exists());
    }

    #[test]
    fn named_dtbs_go_to_a_fresh_directory() {
        let tmp = TempDir::new().unwrap();
        let mut config = config_in(tmp.path());
        config.custom_dts = "foo,bar".parse().unwrap();

        let dtb_dir = config.dtb_dir();
        touch(&dtb_dir.join("foo.dtb"));
        touch(&dtb_dir.join("bar.dtb"));
        touch(&dtb_dir.join("baz.dtb"));

        let host = RecordingHost::new();
        let stager = ArtifactStager::new(&config, &host);
        let custom = stager.dtbs_dir().join("custom");
        touch(&custom.join("stale.dtb"));

        stager.stage_dtbs().unwrap();

        let mut staged: Vec<String> = fs::read_dir(&custom)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        staged.sort();

        assert_eq!(staged, ["bar.dtb", "foo.dtb"]);
    }

    #[test]
    fn all_dtbs_replace_previous_selection() {
        let tmp = TempDir::new().unwrap();
        let mut config = config_in(tmp.path());
        config.custom_dts = "foo".parse().unwrap();

        let dtb_dir = config.dtb_dir();
        touch(&dtb_dir.join("foo.dtb"));

        let host = RecordingHost::new();
        ArtifactStager::new(&config, &host).stage_dtbs().unwrap();
        touch(&config.output_dir.join("dtbs/removed-board.dtb"));

        config.custom_dts = "all".parse().unwrap();
        let stager = ArtifactStager::new(&config, &host);
        stager.stage_dtbs().unwrap();

        let selected = stager.selected_dtbs_dir();
        assert_eq!(selected, stager.dtbs_dir());
        assert!(selected.join("foo.dtb").is_file());
        assert!(!selected.join("custom").exists());
        assert!(!selected.join("removed-board.dtb").exists());
    }

    #[test]
    fn modules_keep_symlinks() {
        let tmp = TempDir::new().unwrap();
        let config = config_in(tmp.path());
        let staging = config.modules_staging_dir();
        let version = staging.join("lib/modules/6.6.52");
        touch(&version.join("kernel/drivers/foo.ko"));
        touch(&version.join("modules.dep"));
        unix_fs::symlink(config.kernel_dir(), version.join("build")).unwrap();

        let host = RecordingHost::new();
        let stager = ArtifactStager::new(&config, &host);
        stager.stage_modules().unwrap();

        let staged = stager.modules_dir().join("lib/modules/6.6.52");
        assert!(staged.join("kernel/drivers/foo.ko").is_file());
        assert!(staged.join("modules.dep").is_file());
        assert_eq!(fs::read_link(staged.join("build")).unwrap(), config.kernel_dir());
    }

    #[test]
    fn mkimage_inputs() {
        let tmp = TempDir::new().unwrap();
        let config = config_in(tmp.path());
        let uboot = config.uboot_dir();
        touch(&uboot.join("spl/u-boot-spl.bin"));
        touch(&uboot.join("u-boot-nodtb.bin"));
        touch(&uboot.join("arch/arm/dts/imx8mp-evk.dtb"));
        touch(&uboot.join("tools/mkimage"));
        touch(&config.atf_dir().join("build/imx8mp/release/bl31.bin"));

        let blob = config
            .firmware_extract_dir()
            .join("firmware/ddr/synopsys/lpddr4_pmu_train_1d_imem.bin");
        touch(&blob);

        let host = RecordingHost::new();
        ArtifactStager::new(&config, &host)
            .stage_mkimage_inputs(&[blob])
            .unwrap();

        let soc_dir = config.mkimage_soc_dir();
        for name in [
            "u-boot-spl.bin",
            "u-boot-nodtb.bin",
            "imx8mp-evk.dtb",
            "mkimage_uboot",
            "bl31.bin",
            "lpddr4_pmu_train_1d_imem.bin",
        ] {
            assert!(soc_dir.join(name).is_file(), "{name} wasn't staged");
        }
    }

    #[test]
    fn mkimage_inputs_missing_bl31() {
        let tmp = TempDir::new().unwrap();
        let config = config_in(tmp.path());
        let uboot = config.uboot_dir();
        touch(&uboot.join("spl/u-boot-spl.bin"));
        touch(&uboot.join("u-boot-nodtb.bin"));
        touch(&uboot.join("arch/arm/dts/imx8mp-evk.dtb"));
        touch(&uboot.join("tools/mkimage"));

        let host = RecordingHost::new();
        let res = ArtifactStager::new(&config, &host).stage_mkimage_inputs(&[]);

        assert!(matches!(res, Err(ImxBootstrapError::MissingArtifact(p)) if p.ends_with("bl31.bin")));
    }
}
