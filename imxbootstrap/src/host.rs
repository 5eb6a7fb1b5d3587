use core::fmt;
use std::{
    ffi::{OsStr, OsString},
    fs,
    io::{self, BufRead as _, Write as _},
    num::NonZeroUsize,
    os::unix::fs::FileTypeExt as _,
    path::{Path, PathBuf},
    process::Command,
    thread,
};

use log::{debug, info, trace};
use nix::unistd::{self, AccessFlags, Uid};
use part::Filesystem;
use sys_mount::{FilesystemType, Mount, UnmountFlags};
use types::ImxBootstrapError;

/// An external program invocation, kept as data so it can be logged, printed
/// in dry-run mode, or recorded.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct ToolCommand {
    program: OsString,
    args: Vec<OsString>,
    envs: Vec<(OsString, OsString)>,
    cwd: Option<PathBuf>,
}

impl ToolCommand {
    pub(crate) fn new(program: impl AsRef<OsStr>) -> Self {
        Self {
            program: program.as_ref().to_owned(),
            args: Vec::new(),
            envs: Vec::new(),
            cwd: None,
        }
    }

    #[must_use]
    pub(crate) fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.args.push(arg.as_ref().to_owned());
        self
    }

    #[must_use]
    pub(crate) fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.args
            .extend(args.into_iter().map(|a| a.as_ref().to_owned()));
        self
    }

    #[must_use]
    pub(crate) fn env(mut self, key: impl AsRef<OsStr>, val: impl AsRef<OsStr>) -> Self {
        self.envs
            .push((key.as_ref().to_owned(), val.as_ref().to_owned()));
        self
    }

    #[must_use]
    pub(crate) fn current_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.cwd = Some(dir.as_ref().to_path_buf());
        self
    }

    pub(crate) fn program(&self) -> &OsStr {
        &self.program
    }

    pub(crate) fn cwd(&self) -> Option<&Path> {
        self.cwd.as_deref()
    }

    /// Program name followed by its arguments, lossily converted to UTF-8
    pub(crate) fn argv(&self) -> Vec<String> {
        core::iter::once(&self.program)
            .chain(self.args.iter())
            .map(|a| a.to_string_lossy().into_owned())
            .collect()
    }

    pub(crate) fn env_value(&self, key: &str) -> Option<&OsStr> {
        self.envs
            .iter()
            .rev()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_os_str())
    }

    fn to_command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command.args(&self.args);
        command.envs(self.envs.iter().map(|(k, v)| (k, v)));

        if let Some(dir) = &self.cwd {
            command.current_dir(dir);
        }

        command
    }
}

fn shell_quote(s: &str) -> String {
    let plain = !s.is_empty()
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || "_@%+=:,./-".contains(c));

    if plain {
        return s.to_owned();
    }

    format!("'{}'", s.replace('\'', r"'\''"))
}

impl fmt::Display for ToolCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(dir) = &self.cwd {
            write!(f, "cd {} && ", shell_quote(&dir.to_string_lossy()))?;
        }

        for (key, val) in &self.envs {
            write!(
                f,
                "{}={} ",
                key.to_string_lossy(),
                shell_quote(&val.to_string_lossy())
            )?;
        }

        let argv = self.argv();
        let quoted: Vec<String> = argv.iter().map(|a| shell_quote(a)).collect();
        f.write_str(&quoted.join(" "))
    }
}

/// Everything that touches the machine we run on besides plain file copies.
pub(crate) trait Host {
    /// Runs a command to completion, its output going to our terminal
    fn run(&self, cmd: &ToolCommand) -> Result<(), ImxBootstrapError>;

    /// Runs a command to completion and returns its standard output
    fn output(&self, cmd: &ToolCommand) -> Result<Vec<u8>, ImxBootstrapError>;

    /// Whether `name` can be found in the `PATH`
    fn has_tool(&self, name: &str) -> bool;

    fn is_block_device(&self, path: &Path) -> Result<bool, ImxBootstrapError>;

    fn is_writable(&self, path: &Path) -> bool;

    fn is_root(&self) -> bool;

    /// Asks the operator a yes/no question. Anything but an explicit yes is a
    /// no.
    fn confirm(&self, question: &str) -> Result<bool, ImxBootstrapError>;

    fn mount(&self, dev: &Path, target: &Path, fs: Filesystem) -> Result<(), ImxBootstrapError>;

    fn unmount(&self, target: &Path) -> Result<(), ImxBootstrapError>;

    fn cpu_count(&self) -> usize;
}

/// Prints a command we would have run, for dry runs
pub(crate) fn print_command(cmd: &ToolCommand) -> Result<(), ImxBootstrapError> {
    writeln!(io::stdout().lock(), "{cmd}")?;
    Ok(())
}

pub(crate) fn is_affirmative(answer: &str) -> bool {
    matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes")
}

/// The machine we're running on
#[derive(Debug, Default)]
pub(crate) struct LocalHost;

impl Host for LocalHost {
    fn run(&self, cmd: &ToolCommand) -> Result<(), ImxBootstrapError> {
        info!("Running: {cmd}");

        let status = cmd
            .to_command()
            .status()
            .map_err(|e| ImxBootstrapError::Command {
                command: cmd.to_string(),
                status: format!("couldn't be started: {e}"),
            })?;

        trace!("Command exited with {status}");

        if !status.success() {
            return Err(ImxBootstrapError::Command {
                command: cmd.to_string(),
                status: status.to_string(),
            });
        }

        Ok(())
    }

    fn output(&self, cmd: &ToolCommand) -> Result<Vec<u8>, ImxBootstrapError> {
        info!("Running: {cmd}");

        let output = cmd
            .to_command()
            .output()
            .map_err(|e| ImxBootstrapError::Command {
                command: cmd.to_string(),
                status: format!("couldn't be started: {e}"),
            })?;

        if !output.status.success() {
            return Err(ImxBootstrapError::Command {
                command: cmd.to_string(),
                status: format!(
                    "{}: {}",
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            });
        }

        Ok(output.stdout)
    }

    fn has_tool(&self, name: &str) -> bool {
        match which::which(name) {
            Ok(path) => {
                trace!("Found {name} at {}", path.display());
                true
            }
            Err(e) => {
                debug!("{name} not found: {e}");
                false
            }
        }
    }

    fn is_block_device(&self, path: &Path) -> Result<bool, ImxBootstrapError> {
        match fs::metadata(path) {
            Ok(metadata) => Ok(metadata.file_type().is_block_device()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn is_writable(&self, path: &Path) -> bool {
        unistd::access(path, AccessFlags::W_OK).is_ok()
    }

    fn is_root(&self) -> bool {
        Uid::effective().is_root()
    }

    fn confirm(&self, question: &str) -> Result<bool, ImxBootstrapError> {
        let mut stderr = io::stderr().lock();
        write!(stderr, "{question} [y/N] ")?;
        stderr.flush()?;

        let mut answer = String::new();
        io::stdin().lock().read_line(&mut answer)?;

        debug!("Operator answered {:?}", answer.trim());

        Ok(is_affirmative(&answer))
    }

    fn mount(&self, dev: &Path, target: &Path, fs: Filesystem) -> Result<(), ImxBootstrapError> {
        debug!("Mounting {} on {}", dev.display(), target.display());

        let _mount: Mount = Mount::builder()
            .fstype(FilesystemType::Manual(fs.mount_name()))
            .mount(dev, target)?;

        trace!("Mount Successful");
        Ok(())
    }

    fn unmount(&self, target: &Path) -> Result<(), ImxBootstrapError> {
        debug!("Unmounting {}", target.display());

        sys_mount::unmount(target, UnmountFlags::DETACH)?;
        Ok(())
    }

    fn cpu_count(&self) -> usize {
        thread::available_parallelism().map_or(1, NonZeroUsize::get)
    }
}
