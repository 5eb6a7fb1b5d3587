use std::collections::BTreeSet;

use log::{debug, info, warn};
use types::ImxBootstrapError;

use crate::host::{Host, ToolCommand};

/// Tools every build needs, the cross-compiler aside
const BUILD_TOOLS: [&str; 5] = ["git", "make", "gcc", "wget", "sh"];

/// Tools needed to flash a device
const FLASH_TOOLS: [&str; 7] = [
    "dd",
    "sync",
    "parted",
    "mkfs.vfat",
    "mkfs.ext4",
    "lsblk",
    "udevadm",
];

const PACKAGES: [(&str, &str); 11] = [
    ("dd", "coreutils"),
    ("gcc", "gcc"),
    ("git", "git"),
    ("lsblk", "util-linux"),
    ("make", "make"),
    ("mkfs.ext4", "e2fsprogs"),
    ("mkfs.vfat", "dosfstools"),
    ("parted", "parted"),
    ("sh", "dash"),
    ("sync", "coreutils"),
    ("udevadm", "udev"),
];

/// Returns the tools needed to build, given our cross-compiler prefix
pub(crate) fn build_tools(cross_compile: &str) -> Vec<String> {
    BUILD_TOOLS
        .iter()
        .map(|t| (*t).to_owned())
        .chain(core::iter::once(format!("{cross_compile}gcc")))
        .collect()
}

pub(crate) fn flash_tools() -> Vec<String> {
    FLASH_TOOLS.iter().map(|t| (*t).to_owned()).collect()
}

/// Returns the Debian package shipping `tool`
pub(crate) fn package_for(tool: &str) -> String {
    if let Some((_, pkg)) = PACKAGES.iter().find(|(name, _)| *name == tool) {
        return (*pkg).to_owned();
    }

    // aarch64-linux-gnu-gcc is shipped by gcc-aarch64-linux-gnu
    if let Some(prefix) = tool.strip_suffix("-gcc") {
        return format!("gcc-{prefix}");
    }

    tool.to_owned()
}

/// Makes sure the programs we delegate to are installed
pub(crate) struct DependencyChecker<'a> {
    host: &'a dyn Host,
}

impl<'a> DependencyChecker<'a> {
    pub(crate) fn new(host: &'a dyn Host) -> Self {
        Self { host }
    }

    fn missing<'t>(&self, tools: &'t [String]) -> Vec<&'t str> {
        tools
            .iter()
            .map(String::as_str)
            .filter(|t| !self.host.has_tool(t))
            .collect()
    }

    /// Checks that every tool is available, offering to install the missing
    /// ones.
    pub(crate) fn ensure(&self, tools: &[String]) -> Result<(), ImxBootstrapError> {
        let missing = self.missing(tools);
        if missing.is_empty() {
            debug!("All required tools are available");
            return Ok(());
        }

        warn!("Missing tools: {}", missing.join(", "));

        let packages: BTreeSet<String> = missing.iter().map(|t| package_for(t)).collect();
        let packages: Vec<String> = packages.into_iter().collect();

        if !self.host.confirm(&format!(
            "Install {} with apt-get?",
            packages.join(" ")
        ))? {
            return Err(ImxBootstrapError::Config(format!(
                "Required tools are missing: {}",
                missing.join(", ")
            )));
        }

        let install = if self.host.is_root() {
            ToolCommand::new("apt-get")
        } else {
            ToolCommand::new("sudo").arg("apt-get")
        };

        info!("Installing {}", packages.join(" "));
        self.host
            .run(&install.args(["install", "-y"]).args(&packages))?;

        let still_missing = self.missing(tools);
        if !still_missing.is_empty() {
            return Err(ImxBootstrapError::Config(format!(
                "Required tools are still missing after installation: {}",
                still_missing.join(", ")
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use test_log::test;
    use types::ImxBootstrapError;

    use super::{build_tools, flash_tools, package_for, DependencyChecker};
    use crate::host::testing::RecordingHost;

    #[test]
    fn packages() {
        assert_eq!(package_for("mkfs.vfat"), "dosfstools");
        assert_eq!(package_for("aarch64-linux-gnu-gcc"), "gcc-aarch64-linux-gnu");
        assert_eq!(package_for("wget"), "wget");
    }

    #[test]
    fn build_tools_include_cross_compiler() {
        assert!(build_tools("arm-linux-gnueabihf-")
            .contains(&String::from("arm-linux-gnueabihf-gcc")));
    }

    #[test]
    fn nothing_missing() {
        let host = RecordingHost::new();

        DependencyChecker::new(&host).ensure(&flash_tools()).unwrap();

        assert!(host.commands.borrow().is_empty());
        assert!(host.prompts.borrow().is_empty());
    }

    #[test]
    fn install_missing_tools() {
        let host = RecordingHost::new()
            .unprivileged()
            .without_tools(&["parted", "mkfs.vfat", "dd", "sync"]);

        DependencyChecker::new(&host).ensure(&flash_tools()).unwrap();

        assert_eq!(host.prompts.borrow().len(), 1);
        assert_eq!(
            host.argvs(),
            [vec![
                "sudo",
                "apt-get",
                "install",
                "-y",
                "coreutils",
                "dosfstools",
                "parted"
            ]]
        );
    }

    #[test]
    fn declined_installation() {
        let host = RecordingHost::new()
            .answering(false)
            .without_tools(&["git"]);

        let res = DependencyChecker::new(&host).ensure(&build_tools("aarch64-linux-gnu-"));

        assert!(matches!(res, Err(ImxBootstrapError::Config(_))));
        assert!(host.commands.borrow().is_empty());
    }
}
