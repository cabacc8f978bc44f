//! Retriever for libraries laid out on local disk as `<root>/<version>/`

use super::{FetchRequest, Retriever, VersionCheck};
use crate::context::BuildContext;
use crate::error::{PipelibError, PipelibResult};
use crate::fsutil::{copy_dir, validate_relative};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::debug;

/// Serves library versions from directories under a local root
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryRetriever {
    /// Directory holding one subdirectory per version
    pub root: PathBuf,

    /// Subdirectory of each version that holds the library
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub library_path: Option<String>,
}

impl DirectoryRetriever {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            library_path: None,
        }
    }

    pub fn with_library_path(mut self, path: impl Into<String>) -> Self {
        self.library_path = Some(path.into());
        self
    }

    /// Directory holding `version`, after rejecting traversal attempts
    fn version_dir(&self, version: &str) -> PipelibResult<PathBuf> {
        validate_relative(version)?;
        let mut dir = self.root.join(version);
        if let Some(sub) = &self.library_path {
            validate_relative(sub)?;
            dir = dir.join(sub);
        }
        Ok(dir)
    }
}

impl Retriever for DirectoryRetriever {
    fn fetch(&self, request: &FetchRequest<'_>, _ctx: &BuildContext) -> PipelibResult<()> {
        let source = self.version_dir(request.version)?;
        if !source.is_dir() {
            debug!("No version directory at {}", source.display());
            return Err(PipelibError::VersionNotFound {
                library: request.name.to_string(),
                version: request.version.to_string(),
            });
        }

        debug!(
            "Copying library {}@{} from {}",
            request.name,
            request.version,
            source.display()
        );
        copy_dir(&source, request.destination)
    }

    fn validate_version(&self, _name: &str, version: &str, _ctx: &BuildContext) -> VersionCheck {
        match self.version_dir(version) {
            Ok(dir) if dir.is_dir() => VersionCheck::Ok,
            Ok(dir) => VersionCheck::Error(format!("no version directory at {}", dir.display())),
            Err(e) => VersionCheck::Error(e.to_string()),
        }
    }

    fn sub_path(&self) -> Option<&str> {
        self.library_path.as_deref()
    }

    fn kind(&self) -> &'static str {
        "directory"
    }
}
