use std::{fs, io, path::Path};

use log::{debug, info};
use types::ImxBootstrapError;

use crate::{
    config::Repository,
    host::{Host, ToolCommand},
};

#[derive(Debug, Eq, PartialEq)]
enum TreeState {
    Missing,
    Empty,
    Checkout,
    Foreign,
}

fn tree_state(dest: &Path) -> Result<TreeState, ImxBootstrapError> {
    let mut entries = match fs::read_dir(dest) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(TreeState::Missing),
        Err(e) => return Err(e.into()),
    };

    if dest.join(".git").exists() {
        return Ok(TreeState::Checkout);
    }

    if entries.next().is_none() {
        return Ok(TreeState::Empty);
    }

    Ok(TreeState::Foreign)
}

/// Keeps local clones of our upstream repositories at the branch we build
pub(crate) struct RepositorySync<'a> {
    host: &'a dyn Host,
}

impl<'a> RepositorySync<'a> {
    pub(crate) fn new(host: &'a dyn Host) -> Self {
        Self { host }
    }

    /// Makes sure `dest` holds a checkout of `repo` at the tip of its branch.
    ///
    /// A directory that exists, isn't empty, and isn't a git checkout is never
    /// touched and is reported as an error.
    pub(crate) fn sync(&self, repo: &Repository, dest: &Path) -> Result<(), ImxBootstrapError> {
        let state = tree_state(dest)?;
        debug!("{} is in state {:?}", dest.display(), state);

        match state {
            TreeState::Missing => {
                if let Some(parent) = dest.parent() {
                    fs::create_dir_all(parent)?;
                }

                self.fresh_clone(repo, dest)
            }
            TreeState::Empty => self.fresh_clone(repo, dest),
            TreeState::Checkout => self.update(repo, dest),
            TreeState::Foreign => Err(ImxBootstrapError::Config(format!(
                "{} exists but isn't a git checkout, refusing to use it for {}",
                dest.display(),
                repo.url
            ))),
        }
    }

    fn fresh_clone(&self, repo: &Repository, dest: &Path) -> Result<(), ImxBootstrapError> {
        info!(
            "Cloning {} (branch {}) into {}",
            repo.url,
            repo.branch,
            dest.display()
        );

        self.host.run(
            &ToolCommand::new("git")
                .args(["clone", "--branch", repo.branch.as_str(), repo.url.as_str()])
                .arg(dest),
        )
    }

    fn update(&self, repo: &Repository, dest: &Path) -> Result<(), ImxBootstrapError> {
        info!(
            "Updating {} to the tip of {}",
            dest.display(),
            repo.branch
        );

        let git = || ToolCommand::new("git").arg("-C").arg(dest);

        self.host.run(&git().args(["fetch", "origin"]))?;
        self.host.run(&git().args(["checkout", repo.branch.as_str()]))?;
        self.host
            .run(&git().args(["pull", "--ff-only", "origin", repo.branch.as_str()]))
    }
}
