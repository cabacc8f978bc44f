//! Library configuration, references and per-build records
//!
//! Libraries are configured by providers (the global configuration, a
//! folder, ...). Each provider has a trust level that every library it
//! supplies inherits; the provider id becomes the library's source
//! descriptor and is part of its cache identity.

mod policy;
mod record;
mod reference;

pub use policy::CachingPolicy;
pub use record::{LibrariesRecord, ResolvedLibraryRecord, RECORD_FILE};
pub use reference::LibraryReference;

use crate::config::schema::{LibraryConfig, ProviderConfig};
use crate::retriever::Retriever;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

fn default_true() -> bool {
    true
}

/// Version override and loading flags of one library
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LibraryFlags {
    /// Literal versions may replace the default
    #[serde(default = "default_true")]
    pub allow_override: bool,

    /// `${BRANCH_NAME}` resolves to the build's branch
    pub allow_branch_name_placeholder: bool,

    /// `${env.NAME}` resolves to a build environment variable
    pub allow_env_var_placeholder: bool,

    /// Pull-request branches fall back to CHANGE_BRANCH, then CHANGE_TARGET
    pub allow_branch_name_pr_fallback: bool,

    /// Library changes show up in the consuming build's changelog
    #[serde(default = "default_true")]
    pub include_changelog: bool,

    /// Loaded into every build without being referenced
    pub implicit: bool,
}

impl Default for LibraryFlags {
    fn default() -> Self {
        Self {
            allow_override: true,
            allow_branch_name_placeholder: false,
            allow_env_var_placeholder: false,
            allow_branch_name_pr_fallback: false,
            include_changelog: true,
            implicit: false,
        }
    }
}

/// A configured library
#[derive(Debug, Clone)]
pub struct LibraryConfiguration {
    pub name: String,
    pub default_version: Option<String>,
    pub retriever: Arc<dyn Retriever>,
    pub flags: LibraryFlags,
    /// `None` disables the shared cache for this library
    pub caching: Option<CachingPolicy>,
}

impl LibraryConfiguration {
    pub fn new(name: impl Into<String>, retriever: Arc<dyn Retriever>) -> Self {
        Self {
            name: name.into(),
            default_version: None,
            retriever,
            flags: LibraryFlags::default(),
            caching: None,
        }
    }

    pub fn with_default_version(mut self, version: impl Into<String>) -> Self {
        self.default_version = Some(version.into());
        self
    }

    pub fn with_flags(mut self, flags: LibraryFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn with_caching(mut self, policy: CachingPolicy) -> Self {
        self.caching = Some(policy);
        self
    }

    pub fn from_config(config: &LibraryConfig) -> Self {
        Self {
            name: config.name.clone(),
            default_version: config.default_version.clone().filter(|v| !v.is_empty()),
            retriever: Arc::new(config.retriever.clone()),
            flags: config.flags,
            caching: config.caching.clone(),
        }
    }
}

/// A configuration provider and the libraries it supplies
#[derive(Debug, Clone)]
pub struct LibraryProvider {
    /// Source descriptor recorded on every library from this provider
    pub id: String,
    /// Whether this provider's libraries run outside the sandbox
    pub trusted: bool,
    pub libraries: Vec<LibraryConfiguration>,
}

impl LibraryProvider {
    pub fn new(id: impl Into<String>, trusted: bool) -> Self {
        Self {
            id: id.into(),
            trusted,
            libraries: Vec::new(),
        }
    }

    pub fn with_library(mut self, library: LibraryConfiguration) -> Self {
        self.libraries.push(library);
        self
    }

    pub fn from_config(config: &ProviderConfig) -> Self {
        Self {
            id: config.id.clone(),
            trusted: config.trusted,
            libraries: config
                .libraries
                .iter()
                .map(LibraryConfiguration::from_config)
                .collect(),
        }
    }
}

/// Providers in search order; the first provider defining a name wins
#[derive(Debug, Clone, Default)]
pub struct LibraryCatalog {
    providers: Vec<LibraryProvider>,
}

impl LibraryCatalog {
    pub fn new(providers: Vec<LibraryProvider>) -> Self {
        Self { providers }
    }

    pub fn from_config(providers: &[ProviderConfig]) -> Self {
        Self::new(providers.iter().map(LibraryProvider::from_config).collect())
    }

    pub fn providers(&self) -> &[LibraryProvider] {
        &self.providers
    }

    /// Find the library configuration for `name`
    pub fn find(&self, name: &str) -> Option<(&LibraryProvider, &LibraryConfiguration)> {
        self.providers.iter().find_map(|provider| {
            provider
                .libraries
                .iter()
                .find(|library| library.name == name)
                .map(|library| (provider, library))
        })
    }

    /// Implicit libraries, honouring provider precedence per name
    pub fn implicit(&self) -> Vec<(&LibraryProvider, &LibraryConfiguration)> {
        let mut found: Vec<(&LibraryProvider, &LibraryConfiguration)> = Vec::new();
        for provider in &self.providers {
            for library in &provider.libraries {
                if found.iter().any(|(_, l)| l.name == library.name) {
                    continue;
                }
                if let Some((p, l)) = self.find(&library.name) {
                    if l.flags.implicit {
                        found.push((p, l));
                    }
                }
            }
        }
        found
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retriever::{DirectoryRetriever, LibraryRetriever};

    fn library(name: &str, implicit: bool) -> LibraryConfiguration {
        let retriever = Arc::new(LibraryRetriever::Directory(DirectoryRetriever::new("/libs")));
        LibraryConfiguration::new(name, retriever).with_flags(LibraryFlags {
            implicit,
            ..LibraryFlags::default()
        })
    }

    #[test]
    fn flags_default_allow_override() {
        let flags = LibraryFlags::default();
        assert!(flags.allow_override);
        assert!(flags.include_changelog);
        assert!(!flags.allow_branch_name_placeholder);
    }

    #[test]
    fn first_provider_wins() {
        let catalog = LibraryCatalog::new(vec![
            LibraryProvider::new("folder:team", false).with_library(library("utils", false)),
            LibraryProvider::new("global", true).with_library(library("utils", false)),
        ]);
        let (provider, _) = catalog.find("utils").unwrap();
        assert_eq!(provider.id, "folder:team");
        assert!(!provider.trusted);
        assert!(catalog.find("missing").is_none());
    }

    #[test]
    fn implicit_libraries_respect_shadowing() {
        let catalog = LibraryCatalog::new(vec![
            LibraryProvider::new("folder:team", false).with_library(library("utils", false)),
            LibraryProvider::new("global", true)
                .with_library(library("utils", true))
                .with_library(library("notify", true)),
        ]);
        let implicit: Vec<_> = catalog.implicit().iter().map(|(_, l)| l.name.clone()).collect();
        assert_eq!(implicit, vec!["notify".to_string()]);
    }
}
