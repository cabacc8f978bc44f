//! Git-backed retriever and branch detection
//!
//! Shells out to the `git` CLI rather than linking a git implementation,
//! the same way the rest of the tool drives external programs.

use super::{BranchAware, FetchRequest, Retriever, VersionCheck};
use crate::context::BuildContext;
use crate::error::{PipelibError, PipelibResult};
use crate::fsutil::{remove_path, validate_relative};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output, Stdio};
use tracing::{debug, info};

fn default_git() -> String {
    "git".to_string()
}

/// Fetches libraries from a git remote with shallow clones
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GitRetriever {
    /// Clone URL
    pub remote: String,

    /// Subdirectory of the repository that holds the library
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub library_path: Option<String>,

    /// git executable
    #[serde(default = "default_git")]
    pub git: String,
}

impl GitRetriever {
    pub fn new(remote: impl Into<String>) -> Self {
        Self {
            remote: remote.into(),
            library_path: None,
            git: default_git(),
        }
    }

    /// Commit checked out in `checkout`
    fn head_revision(&self, checkout: &Path) -> PipelibResult<String> {
        let output = self.exec(&["rev-parse", "HEAD"], Some(checkout))?;
        if !output.status.success() {
            return Err(PipelibError::command_exec(
                format!("{} rev-parse HEAD", self.git),
                String::from_utf8_lossy(&output.stderr).trim(),
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    /// Execute a git command and return the output
    fn exec(&self, args: &[&str], cwd: Option<&Path>) -> PipelibResult<Output> {
        debug!("Executing: {} {:?}", self.git, args);

        let mut command = Command::new(&self.git);
        command
            .args(args)
            .env("GIT_TERMINAL_PROMPT", "0")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = cwd {
            command.current_dir(dir);
        }

        command
            .output()
            .map_err(|e| PipelibError::command_failed(format!("{} {:?}", self.git, args), e))
    }
}

/// Whether `ls-remote` output lists `version` as a branch or tag by its
/// full name. The ref pattern also matches suffixes such as
/// `refs/heads/release/main`, which `clone --branch main` cannot use.
fn advertises_ref(ls_remote: &str, version: &str) -> bool {
    let branch = format!("refs/heads/{}", version);
    let tag = format!("refs/tags/{}", version);
    let peeled = format!("refs/tags/{}^{{}}", version);
    ls_remote
        .lines()
        .filter_map(|line| line.split_whitespace().nth(1))
        .any(|name| name == branch || name == tag || name == peeled)
}

/// Abbreviated or full commit ids cannot be checked with `ls-remote`
fn looks_like_commit(version: &str) -> bool {
    (7..=40).contains(&version.len()) && version.chars().all(|c| c.is_ascii_hexdigit())
}

impl Retriever for GitRetriever {
    fn fetch(&self, request: &FetchRequest<'_>, ctx: &BuildContext) -> PipelibResult<()> {
        if let Some(sub) = &self.library_path {
            validate_relative(sub)?;
        }

        let checkout = checkout_dir_for(request.destination);
        remove_path(&checkout)?;
        let checkout_str = checkout.to_string_lossy().into_owned();

        info!("Cloning {}@{} from {}", request.name, request.version, self.remote);
        let output = self.exec(
            &[
                "clone",
                "--quiet",
                "--depth",
                "1",
                "--branch",
                request.version,
                "--",
                &self.remote,
                &checkout_str,
            ],
            None,
        )?;

        if !output.status.success() {
            remove_path(&checkout)?;
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(PipelibError::fetch(request.name, stderr.trim().to_string()));
        }

        if request.changelog {
            let revision = self.head_revision(&checkout);
            if revision.is_err() {
                remove_path(&checkout)?;
            }
            let revision = revision?;
            info!("Library {}@{} is at {}", request.name, request.version, revision);
            ctx.trace.record(format!(
                "Fetched {}@{} at revision {}",
                request.name, request.version, revision
            ));
        }

        let result =
            publish_checkout(&checkout, self.library_path.as_deref(), request.destination);
        remove_path(&checkout)?;
        result
    }

    fn validate_version(&self, _name: &str, version: &str, _ctx: &BuildContext) -> VersionCheck {
        let args = ["ls-remote", "--heads", "--tags", &self.remote, version];
        let output = match self.exec(&args, None) {
            Ok(output) => output,
            Err(e) => return VersionCheck::Error(e.to_string()),
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return VersionCheck::Error(stderr.trim().to_string());
        }

        if advertises_ref(&String::from_utf8_lossy(&output.stdout), version) {
            VersionCheck::Ok
        } else if looks_like_commit(version) {
            VersionCheck::Warning(format!(
                "cannot confirm that {} is a commit in {}",
                version, self.remote
            ))
        } else {
            VersionCheck::Error(format!("no branch or tag named {} in {}", version, self.remote))
        }
    }

    fn sub_path(&self) -> Option<&str> {
        self.library_path.as_deref()
    }

    fn kind(&self) -> &'static str {
        "git"
    }
}

/// Scratch checkout location next to the final destination
fn checkout_dir_for(destination: &Path) -> PathBuf {
    let name = destination
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    destination.with_file_name(format!(".{}.checkout-{}", name, uuid::Uuid::new_v4()))
}

/// Move the library part of a checkout to `destination`, without `.git`
fn publish_checkout(
    checkout: &Path,
    library_path: Option<&str>,
    destination: &Path,
) -> PipelibResult<()> {
    remove_path(&checkout.join(".git"))?;
    let source = match library_path {
        Some(sub) => checkout.join(sub),
        None => checkout.to_path_buf(),
    };
    if !source.is_dir() {
        return Err(PipelibError::IntegrityError(format!(
            "library path {} missing from checkout",
            library_path.unwrap_or(".")
        )));
    }
    fs::rename(&source, destination).map_err(|e| {
        PipelibError::io(
            format!("moving {} to {}", source.display(), destination.display()),
            e,
        )
    })
}

/// Branch detection from a git working copy
#[derive(Debug, Clone)]
pub struct GitWorkspace {
    path: PathBuf,
    git: String,
}

impl GitWorkspace {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            git: default_git(),
        }
    }
}

impl BranchAware for GitWorkspace {
    fn current_branch(&self, _ctx: &BuildContext) -> Option<String> {
        let output = Command::new(&self.git)
            .args(["rev-parse", "--abbrev-ref", "HEAD"])
            .current_dir(&self.path)
            .stdin(Stdio::null())
            .stderr(Stdio::null())
            .output()
            .ok()?;
        if !output.status.success() {
            return None;
        }
        let branch = String::from_utf8_lossy(&output.stdout).trim().to_string();
        // Detached checkouts report "HEAD"
        if branch.is_empty() || branch == "HEAD" {
            None
        } else {
            Some(branch)
        }
    }
}
