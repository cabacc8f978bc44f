//! Per-build context handed to resolvers and retrievers

use crate::cancel::CancelToken;
use crate::retriever::BranchAware;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// Collects resolution decisions for a build when tracing is requested.
///
/// Every line is also emitted at debug level, whether or not the sink
/// is enabled.
#[derive(Debug, Clone, Default)]
pub struct TraceSink {
    lines: Option<Arc<Mutex<Vec<String>>>>,
}

impl TraceSink {
    /// A sink that keeps every recorded line
    pub fn enabled() -> Self {
        Self {
            lines: Some(Arc::new(Mutex::new(Vec::new()))),
        }
    }

    /// A sink that only forwards to the log
    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn is_enabled(&self) -> bool {
        self.lines.is_some()
    }

    /// Record one decision line
    pub fn record(&self, line: impl Into<String>) {
        let line = line.into();
        debug!("{}", line);
        if let Some(lines) = &self.lines {
            lines.lock().push(line);
        }
    }

    /// Snapshot of the recorded lines
    pub fn lines(&self) -> Vec<String> {
        self.lines
            .as_ref()
            .map(|lines| lines.lock().clone())
            .unwrap_or_default()
    }
}

/// Everything a build contributes to resolving its libraries
#[derive(Clone, Default)]
pub struct BuildContext {
    /// Build environment variables
    pub env: HashMap<String, String>,
    /// Branch attached to the job itself (multibranch metadata)
    pub job_branch: Option<String>,
    /// Optional source-control collaborator that knows the current branch
    pub branch_source: Option<Arc<dyn BranchAware>>,
    /// Decision trace
    pub trace: TraceSink,
    /// Build cancellation
    pub cancel: CancelToken,
}

impl BuildContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_job_branch(mut self, branch: impl Into<String>) -> Self {
        self.job_branch = Some(branch.into());
        self
    }

    pub fn with_branch_source(mut self, source: Arc<dyn BranchAware>) -> Self {
        self.branch_source = Some(source);
        self
    }

    pub fn with_trace(mut self, trace: TraceSink) -> Self {
        self.trace = trace;
        self
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Look up a non-empty environment variable
    pub fn env_var(&self, name: &str) -> Option<&str> {
        self.env
            .get(name)
            .map(String::as_str)
            .filter(|value| !value.is_empty())
    }
}

impl fmt::Debug for BuildContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BuildContext")
            .field("env", &self.env.keys().collect::<Vec<_>>())
            .field("job_branch", &self.job_branch)
            .field("branch_source", &self.branch_source.is_some())
            .field("trace", &self.trace.is_enabled())
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}
