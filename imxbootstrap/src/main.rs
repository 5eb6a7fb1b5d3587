#![allow(clippy::multiple_crate_versions)]
#![doc = include_str!("../../README.md")]

use std::{
    fs::{self, File},
    io::{self, Write},
    path::{Path, PathBuf},
    process::ExitCode,
};

use anyhow::{bail, Context as _};
use clap::{error::ErrorKind, Parser};
use env_logger::Target;
use jiff::Zoned;
use log::{debug, info, LevelFilter};
use types::Architecture;

mod config;
mod deps;
mod host;
mod partition;
mod pipeline;
mod repo;
mod stage;
mod stager;
mod writer;

use crate::{
    config::{BuildConfig, EnvFile, Overrides},
    host::LocalHost,
    pipeline::{BuildTarget, Outcome, Pipeline},
};

#[derive(Debug, Parser)]
#[command(version, about = "i.MX Boot Stack Build and Flashing Utility")]
struct Cli {
    #[arg(short, long, help = "Work Directory")]
    workdir: PathBuf,

    #[arg(short, long, help = "Kernel Branch")]
    branch: Option<String>,

    #[arg(
        short = 'd',
        long,
        help = "Device Trees to build: all, or a comma-separated list of names"
    )]
    custom_dts: Option<String>,

    #[arg(short, long, help = "Clean the kernel tree before building")]
    clean: bool,

    #[arg(short, long, visible_alias = "device", help = "Device to flash")]
    flash_device: Option<PathBuf>,

    #[arg(short = 'n', long, help = "Print destructive commands instead of running them")]
    dry_run: bool,

    #[arg(short, long, help = "Verbose Output")]
    verbose: bool,

    #[arg(
        short = 't',
        long,
        default_value = "build",
        help = "Build Target: kernel, dts, uboot, atf, image, build, all, flash, clean:{uboot,atf,image,all}"
    )]
    build_target: BuildTarget,

    #[arg(short, long, help = "Environment File")]
    env_file: Option<PathBuf>,

    #[arg(short, long, help = "Log File [default: <WORKDIR>/imxbootstrap.log]")]
    log_file: Option<PathBuf>,

    #[arg(short, long, help = "Architecture")]
    arch: Option<Architecture>,

    #[arg(long, help = "Root Filesystem Tarball")]
    rootfs: Option<PathBuf>,
}

impl Cli {
    /// Where to log, known before the rest of the configuration is loaded
    fn log_file(&self) -> PathBuf {
        self.log_file
            .clone()
            .unwrap_or_else(|| config::default_log_file(&self.workdir))
    }
}

/// Sends our log records both to the terminal and to the log file
struct LogTee {
    file: File,
}

impl Write for LogTee {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        io::stderr().write_all(buf)?;
        self.file.write_all(buf)?;

        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        io::stderr().flush()?;
        self.file.flush()
    }
}

fn init_logger(log_file: &Path, verbose: bool) -> Result<(), anyhow::Error> {
    if let Some(parent) = log_file.parent() {
        fs::create_dir_all(parent)?;
    }

    let file = File::options()
        .create(true)
        .append(true)
        .open(log_file)
        .with_context(|| format!("Couldn't open log file {}", log_file.display()))?;

    env_logger::Builder::new()
        .filter_level(if verbose {
            LevelFilter::Debug
        } else {
            LevelFilter::Info
        })
        .parse_default_env()
        .target(Target::Pipe(Box::new(LogTee { file })))
        .format(|buf, record| {
            writeln!(
                buf,
                "[{} {:<5} {}] {}",
                Zoned::now().strftime("%Y-%m-%d %H:%M:%S"),
                record.level(),
                record.target(),
                record.args()
            )
        })
        .try_init()?;

    Ok(())
}

fn main() -> Result<ExitCode, anyhow::Error> {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) if e.kind() == ErrorKind::DisplayVersion => {
            e.print()?;
            return Ok(ExitCode::SUCCESS);
        }
        Err(e) => {
            e.print()?;
            return Ok(ExitCode::FAILURE);
        }
    };

    let log_file = cli.log_file();
    init_logger(&log_file, cli.verbose)?;

    info!(
        "Running {} {}",
        env!("CARGO_CRATE_NAME"),
        env!("CARGO_PKG_VERSION")
    );
    debug!("Logging to {}", log_file.display());

    if let Some(rootfs) = &cli.rootfs {
        bail!(
            "Flashing a root filesystem ({}) isn't implemented",
            rootfs.display()
        );
    }

    let env = match &cli.env_file {
        Some(path) => EnvFile::from_path(path)
            .with_context(|| format!("Couldn't load environment file {}", path.display()))?,
        None => EnvFile::default(),
    };

    let target = cli.build_target;
    let config = BuildConfig::new(
        env,
        Overrides {
            workdir: cli.workdir,
            branch: cli.branch,
            arch: cli.arch,
            custom_dts: cli.custom_dts,
            flash_device: cli.flash_device,
            log_file: Some(log_file),
            clean: cli.clean,
            verbose: cli.verbose,
            dry_run: cli.dry_run,
        },
    )
    .context("Invalid configuration")?;

    match Pipeline::new(&config, &LocalHost).run(target)? {
        Outcome::Done => info!("Target {target} completed"),
        Outcome::Cancelled => info!("Target {target} cancelled"),
    }

    Ok(ExitCode::SUCCESS)
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use clap::Parser as _;
    use test_log::test;

    use super::Cli;

    #[test]
    fn log_file_defaults_to_the_workdir() {
        let cli =
            Cli::try_parse_from(["imxbootstrap", "-w", "/work", "-e", "/missing.env"]).unwrap();

        assert_eq!(cli.log_file(), PathBuf::from("/work/imxbootstrap.log"));
    }

    #[test]
    fn log_file_from_the_command_line() {
        let cli =
            Cli::try_parse_from(["imxbootstrap", "-w", "/work", "-l", "/var/log/imx.log"]).unwrap();

        assert_eq!(cli.log_file(), PathBuf::from("/var/log/imx.log"));
    }
}
