use core::str::FromStr;
use std::{
    fs,
    path::{Path, PathBuf},
};

use log::debug;
use serde::Deserialize;
use types::{Architecture, ImxBootstrapError};

pub(crate) const DEFAULT_KERNEL_REPO: &str = "https://github.com/nxp-imx/linux-imx.git";
pub(crate) const DEFAULT_KERNEL_BRANCH: &str = "lf-6.6.y";
pub(crate) const DEFAULT_UBOOT_REPO: &str = "https://github.com/nxp-imx/uboot-imx.git";
pub(crate) const DEFAULT_UBOOT_BRANCH: &str = "lf_v2024.04";
pub(crate) const DEFAULT_ATF_REPO: &str = "https://github.com/nxp-imx/imx-atf.git";
pub(crate) const DEFAULT_ATF_BRANCH: &str = "lf_v2.10";
pub(crate) const DEFAULT_MKIMAGE_REPO: &str = "https://github.com/nxp-imx/imx-mkimage.git";
pub(crate) const DEFAULT_MKIMAGE_BRANCH: &str = "lf-6.6.52_2.2.0";
pub(crate) const DEFAULT_FIRMWARE_URL: &str =
    "https://www.nxp.com/lgfiles/NMG/MAD/YOCTO/firmware-imx-8.21.bin";

const DEFAULT_DEFCONFIG: &str = "imx_v8_defconfig";
const DEFAULT_UBOOT_DEFCONFIG: &str = "imx8mp_evk_defconfig";
const DEFAULT_UBOOT_DTB: &str = "imx8mp-evk.dtb";
const DEFAULT_ATF_PLATFORM: &str = "imx8mp";
const DEFAULT_MKIMAGE_SOC: &str = "iMX8MP";
const DEFAULT_MKIMAGE_TARGET: &str = "flash_evk";
const DEFAULT_DTS_VENDOR: &str = "freescale";

const KERNEL_TREE_DIR: &str = "linux-imx";
const UBOOT_TREE_DIR: &str = "uboot-imx";
const ATF_TREE_DIR: &str = "imx-atf";
const MKIMAGE_TREE_DIR: &str = "imx-mkimage";
const FIRMWARE_DIR: &str = "firmware";
const MODULES_STAGING_DIR: &str = "modules-staging";
const OUTPUT_DIR: &str = "output";
const LOG_FILE: &str = "imxbootstrap.log";

/// An upstream git repository and the branch we build
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct Repository {
    pub(crate) url: String,
    pub(crate) branch: String,
}

impl Repository {
    fn new(url: Option<String>, default_url: &str, branch: Option<String>, default_branch: &str) -> Self {
        Self {
            url: url.unwrap_or_else(|| default_url.to_owned()),
            branch: branch.unwrap_or_else(|| default_branch.to_owned()),
        }
    }
}

/// Which device trees to build
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub(crate) enum DtsSelection {
    /// Every device tree the kernel's `dtbs` target produces
    #[default]
    All,

    /// Only these device trees, by base name
    Named(Vec<String>),
}

impl FromStr for DtsSelection {
    type Err = ImxBootstrapError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();

        if s == "all" {
            return Ok(Self::All);
        }

        let names = s
            .split(',')
            .map(|name| {
                let name = name.trim();
                let name = name
                    .strip_suffix(".dts")
                    .or_else(|| name.strip_suffix(".dtb"))
                    .unwrap_or(name);

                if name.is_empty() {
                    return Err(ImxBootstrapError::Config(format!(
                        "Invalid device tree list: {s:?}"
                    )));
                }

                Ok(name.to_owned())
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self::Named(names))
    }
}

/// Key/value environment file. Every key is optional and overrides our
/// default.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "SCREAMING_SNAKE_CASE")]
pub(crate) struct EnvFile {
    kernel_repo: Option<String>,
    kernel_branch: Option<String>,
    uboot_repo: Option<String>,
    uboot_branch: Option<String>,
    atf_repo: Option<String>,
    atf_branch: Option<String>,
    mkimage_repo: Option<String>,
    mkimage_branch: Option<String>,
    firmware_url: Option<String>,
    arch: Option<String>,
    cross_compile: Option<String>,
    defconfig: Option<String>,
    uboot_defconfig: Option<String>,
    uboot_dtb: Option<String>,
    atf_platform: Option<String>,
    mkimage_soc: Option<String>,
    mkimage_target: Option<String>,
    dts_vendor: Option<String>,
    custom_dts: Option<String>,
    output_dir: Option<PathBuf>,
    flash_device: Option<PathBuf>,
}

impl EnvFile {
    pub(crate) fn from_path(path: &Path) -> Result<Self, ImxBootstrapError> {
        debug!("Loading environment file {}", path.display());

        let content = fs::read_to_string(path)?;
        Self::from_str(&content)
    }
}

impl FromStr for EnvFile {
    type Err = ImxBootstrapError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(toml::from_str(s)?)
    }
}

/// Values given on the command line. They take precedence over everything
/// else.
#[derive(Debug, Default)]
pub(crate) struct Overrides {
    pub(crate) workdir: PathBuf,
    pub(crate) branch: Option<String>,
    pub(crate) arch: Option<Architecture>,
    pub(crate) custom_dts: Option<String>,
    pub(crate) flash_device: Option<PathBuf>,
    pub(crate) log_file: Option<PathBuf>,
    pub(crate) clean: bool,
    pub(crate) verbose: bool,
    pub(crate) dry_run: bool,
}

/// Our whole configuration, built once and never modified
#[derive(Clone, Debug)]
#[allow(clippy::struct_excessive_bools)]
pub(crate) struct BuildConfig {
    pub(crate) workdir: PathBuf,
    pub(crate) kernel: Repository,
    pub(crate) uboot: Repository,
    pub(crate) atf: Repository,
    pub(crate) mkimage: Repository,
    pub(crate) firmware_url: String,
    pub(crate) arch: Architecture,
    pub(crate) cross_compile: String,
    pub(crate) defconfig: String,
    pub(crate) uboot_defconfig: String,
    pub(crate) uboot_dtb: String,
    pub(crate) atf_platform: String,
    pub(crate) mkimage_soc: String,
    pub(crate) mkimage_target: String,
    pub(crate) dts_vendor: String,
    pub(crate) custom_dts: DtsSelection,
    pub(crate) output_dir: PathBuf,
    pub(crate) flash_device: Option<PathBuf>,
    pub(crate) log_file: PathBuf,
    pub(crate) clean: bool,
    pub(crate) verbose: bool,
    pub(crate) dry_run: bool,
}

/// Where we log when no log file is given on the command line
pub(crate) fn default_log_file(workdir: &Path) -> PathBuf {
    workdir.join(LOG_FILE)
}

impl BuildConfig {
    /// Merges our defaults, the environment file and the command line, in
    /// increasing order of precedence.
    pub(crate) fn new(env: EnvFile, cli: Overrides) -> Result<Self, ImxBootstrapError> {
        if cli.workdir.as_os_str().is_empty() {
            return Err(ImxBootstrapError::Config(String::from(
                "A work directory is required",
            )));
        }

        let workdir = cli.workdir;

        let arch = match (cli.arch, env.arch) {
            (Some(arch), _) => arch,
            (None, Some(name)) => Architecture::from_kernel_str(&name)?,
            (None, None) => Architecture::default(),
        };

        let custom_dts = cli
            .custom_dts
            .or(env.custom_dts)
            .map(|s| DtsSelection::from_str(&s))
            .transpose()?
            .unwrap_or_default();

        let output_dir = env
            .output_dir
            .map_or_else(|| workdir.join(OUTPUT_DIR), |dir| workdir.join(dir));

        let log_file = cli.log_file.unwrap_or_else(|| default_log_file(&workdir));

        let config = Self {
            kernel: Repository::new(
                env.kernel_repo,
                DEFAULT_KERNEL_REPO,
                cli.branch.or(env.kernel_branch),
                DEFAULT_KERNEL_BRANCH,
            ),
            uboot: Repository::new(
                env.uboot_repo,
                DEFAULT_UBOOT_REPO,
                env.uboot_branch,
                DEFAULT_UBOOT_BRANCH,
            ),
            atf: Repository::new(env.atf_repo, DEFAULT_ATF_REPO, env.atf_branch, DEFAULT_ATF_BRANCH),
            mkimage: Repository::new(
                env.mkimage_repo,
                DEFAULT_MKIMAGE_REPO,
                env.mkimage_branch,
                DEFAULT_MKIMAGE_BRANCH,
            ),
            firmware_url: env
                .firmware_url
                .unwrap_or_else(|| DEFAULT_FIRMWARE_URL.to_owned()),
            arch,
            cross_compile: env
                .cross_compile
                .unwrap_or_else(|| arch.default_cross_compile().to_owned()),
            defconfig: env.defconfig.unwrap_or_else(|| DEFAULT_DEFCONFIG.to_owned()),
            uboot_defconfig: env
                .uboot_defconfig
                .unwrap_or_else(|| DEFAULT_UBOOT_DEFCONFIG.to_owned()),
            uboot_dtb: env.uboot_dtb.unwrap_or_else(|| DEFAULT_UBOOT_DTB.to_owned()),
            atf_platform: env
                .atf_platform
                .unwrap_or_else(|| DEFAULT_ATF_PLATFORM.to_owned()),
            mkimage_soc: env
                .mkimage_soc
                .unwrap_or_else(|| DEFAULT_MKIMAGE_SOC.to_owned()),
            mkimage_target: env
                .mkimage_target
                .unwrap_or_else(|| DEFAULT_MKIMAGE_TARGET.to_owned()),
            dts_vendor: env.dts_vendor.unwrap_or_else(|| DEFAULT_DTS_VENDOR.to_owned()),
            custom_dts,
            output_dir,
            flash_device: cli.flash_device.or(env.flash_device),
            log_file,
            clean: cli.clean,
            verbose: cli.verbose,
            dry_run: cli.dry_run,
            workdir,
        };

        debug!("Configuration: {config:#?}");

        Ok(config)
    }

    pub(crate) fn kernel_dir(&self) -> PathBuf {
        self.workdir.join(KERNEL_TREE_DIR)
    }

    pub(crate) fn uboot_dir(&self) -> PathBuf {
        self.workdir.join(UBOOT_TREE_DIR)
    }

    pub(crate) fn atf_dir(&self) -> PathBuf {
        self.workdir.join(ATF_TREE_DIR)
    }

    pub(crate) fn mkimage_dir(&self) -> PathBuf {
        self.workdir.join(MKIMAGE_TREE_DIR)
    }

    pub(crate) fn firmware_dir(&self) -> PathBuf {
        self.workdir.join(FIRMWARE_DIR)
    }

    pub(crate) fn modules_staging_dir(&self) -> PathBuf {
        self.workdir.join(MODULES_STAGING_DIR)
    }

    /// Name of the firmware self-extractor, as found at the end of its URL
    pub(crate) fn firmware_archive_name(&self) -> &str {
        self.firmware_url
            .rsplit('/')
            .next()
            .unwrap_or(&self.firmware_url)
    }

    /// Directory the firmware self-extractor unpacks itself into
    pub(crate) fn firmware_extract_dir(&self) -> PathBuf {
        let name = self.firmware_archive_name();

        self.firmware_dir()
            .join(name.strip_suffix(".bin").unwrap_or(name))
    }

    /// Kernel build directory holding the device trees of our vendor
    pub(crate) fn dtb_dir(&self) -> PathBuf {
        self.kernel_dir()
            .join("arch")
            .join(self.arch.as_kernel_str())
            .join("boot/dts")
            .join(&self.dts_vendor)
    }

    /// Directory the mkimage tool reads its inputs from
    pub(crate) fn mkimage_soc_dir(&self) -> PathBuf {
        self.mkimage_dir().join("iMX8M")
    }
}
