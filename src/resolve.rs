//! Version resolution
//!
//! Turns the version token a build wrote (possibly absent, possibly a
//! placeholder) into one concrete version, following the library's
//! override flags. First matching rule wins:
//!
//! | Token | Requires | Result |
//! |-------|----------|--------|
//! | absent | | default version |
//! | literal | `allow_override`, or equal to the default | the literal |
//! | `${env.NAME}` | `allow_env_var_placeholder` | validated variable value, else default |
//! | `${BRANCH_NAME}` | `allow_branch_name_placeholder` | validated branch, PR fallback, default |
//!
//! Anything else is a policy violation. Only a version the retriever
//! reports as [`VersionCheck::Ok`] is accepted from a placeholder.

use crate::context::BuildContext;
use crate::error::{PipelibError, PipelibResult};
use crate::library::LibraryConfiguration;
use crate::retriever::VersionCheck;
use tracing::warn;

/// Placeholder replaced by the build's branch
pub const BRANCH_PLACEHOLDER: &str = "${BRANCH_NAME}";

const ENV_PLACEHOLDER_PREFIX: &str = "${env.";
const PLACEHOLDER_SUFFIX: &str = "}";

/// Environment variable holding the build's branch
pub const BRANCH_NAME_VAR: &str = "BRANCH_NAME";
/// Source branch of a pull request
pub const CHANGE_BRANCH_VAR: &str = "CHANGE_BRANCH";
/// Target branch of a pull request
pub const CHANGE_TARGET_VAR: &str = "CHANGE_TARGET";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Token<'a> {
    Literal(&'a str),
    Env(&'a str),
    Branch,
}

impl<'a> Token<'a> {
    fn classify(raw: &'a str) -> Self {
        if raw == BRANCH_PLACEHOLDER {
            return Self::Branch;
        }
        raw.strip_prefix(ENV_PLACEHOLDER_PREFIX)
            .and_then(|rest| rest.strip_suffix(PLACEHOLDER_SUFFIX))
            .filter(|name| is_variable_name(name))
            .map_or(Self::Literal(raw), Self::Env)
    }
}

fn is_variable_name(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// `PR-` followed by digits
fn is_pull_request(branch: &str) -> bool {
    branch
        .strip_prefix("PR-")
        .is_some_and(|n| !n.is_empty() && n.chars().all(|c| c.is_ascii_digit()))
}

/// Resolves version tokens for one configured library
#[derive(Debug, Clone, Copy)]
pub struct VersionResolver<'a> {
    library: &'a LibraryConfiguration,
}

impl<'a> VersionResolver<'a> {
    pub fn new(library: &'a LibraryConfiguration) -> Self {
        Self { library }
    }

    /// Resolve `token` to a concrete version
    pub fn resolve(&self, token: Option<&str>, ctx: &BuildContext) -> PipelibResult<String> {
        let name = &self.library.name;
        let flags = &self.library.flags;

        let Some(raw) = token else {
            return match &self.library.default_version {
                Some(default) => {
                    ctx.trace.record(format!(
                        "No version given for {}; using default {}",
                        name, default
                    ));
                    Ok(default.clone())
                }
                None => Err(PipelibError::NoVersionSpecified {
                    library: name.clone(),
                }),
            };
        };

        match Token::classify(raw) {
            Token::Literal(version) => {
                if flags.allow_override {
                    ctx.trace
                        .record(format!("Using version {} of {} as requested", version, name));
                    return Ok(version.to_string());
                }
                if self.library.default_version.as_deref() == Some(version) {
                    ctx.trace.record(format!(
                        "Requested version {} of {} is the default",
                        version, name
                    ));
                    return Ok(version.to_string());
                }
                Err(self.violation(
                    ctx,
                    format!("version {} requested but override not permitted", version),
                ))
            }
            Token::Env(var) => {
                if !flags.allow_env_var_placeholder {
                    return Err(
                        self.violation(ctx, "environment variable placeholders are not permitted")
                    );
                }
                self.resolve_env(var, ctx)
            }
            Token::Branch => {
                if !flags.allow_branch_name_placeholder {
                    return Err(self.violation(ctx, "branch name placeholder is not permitted"));
                }
                self.resolve_branch(ctx)
            }
        }
    }

    fn resolve_env(&self, var: &str, ctx: &BuildContext) -> PipelibResult<String> {
        let Some(value) = ctx.env_var(var) else {
            return self.fall_back(ctx, format!("environment variable {} is not set", var));
        };
        ctx.trace.record(format!(
            "Environment variable {} of {} is {}",
            var, self.library.name, value
        ));
        if self.validate(value, ctx) {
            return Ok(value.to_string());
        }
        self.fall_back(
            ctx,
            format!("environment variable {} names unknown version {}", var, value),
        )
    }

    fn resolve_branch(&self, ctx: &BuildContext) -> PipelibResult<String> {
        let Some(branch) = self.current_branch(ctx) else {
            return self.fall_back(ctx, "could not determine the build's branch".to_string());
        };
        if self.validate(&branch, ctx) {
            return Ok(branch);
        }

        if self.library.flags.allow_branch_name_pr_fallback && is_pull_request(&branch) {
            for var in [CHANGE_BRANCH_VAR, CHANGE_TARGET_VAR] {
                let Some(candidate) = ctx.env_var(var) else {
                    ctx.trace.record(format!("{} is not set", var));
                    continue;
                };
                ctx.trace.record(format!(
                    "Pull request {}: trying {}={}",
                    branch, var, candidate
                ));
                if self.validate(candidate, ctx) {
                    return Ok(candidate.to_string());
                }
            }
        }

        self.fall_back(ctx, format!("branch {} is not a valid version", branch))
    }

    /// First non-empty branch from job metadata, `BRANCH_NAME`, then the
    /// source-control collaborator
    fn current_branch(&self, ctx: &BuildContext) -> Option<String> {
        if let Some(branch) = ctx.job_branch.as_deref().filter(|b| !b.is_empty()) {
            ctx.trace.record(format!("Branch {} from job metadata", branch));
            return Some(branch.to_string());
        }
        if let Some(branch) = ctx.env_var(BRANCH_NAME_VAR) {
            ctx.trace
                .record(format!("Branch {} from {}", branch, BRANCH_NAME_VAR));
            return Some(branch.to_string());
        }
        let source = ctx.branch_source.as_ref()?;
        let branch = source.current_branch(ctx).filter(|b| !b.is_empty())?;
        ctx.trace
            .record(format!("Branch {} from source control", branch));
        Some(branch)
    }

    fn validate(&self, version: &str, ctx: &BuildContext) -> bool {
        let check = self
            .library
            .retriever
            .validate_version(&self.library.name, version, ctx);
        ctx.trace.record(format!(
            "Validating {}@{}: {}",
            self.library.name, version, check
        ));
        check == VersionCheck::Ok
    }

    fn fall_back(&self, ctx: &BuildContext, reason: String) -> PipelibResult<String> {
        match &self.library.default_version {
            Some(default) => {
                warn!(
                    "{} for library {}; using default version {}",
                    reason, self.library.name, default
                );
                ctx.trace
                    .record(format!("{}; falling back to default {}", reason, default));
                Ok(default.clone())
            }
            None => Err(PipelibError::ResolutionFailure {
                library: self.library.name.clone(),
                reason,
            }),
        }
    }

    fn violation(&self, ctx: &BuildContext, reason: impl Into<String>) -> PipelibError {
        let reason = reason.into();
        ctx.trace
            .record(format!("Rejected {}: {}", self.library.name, reason));
        PipelibError::PolicyViolation {
            library: self.library.name.clone(),
            reason,
        }
    }
}
