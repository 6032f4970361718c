//! Typed error hierarchy for pipewright.
//!
//! `WorkflowError` is what callers of the orchestrator and the query surface
//! see. Every variant carries the instance id it concerns (when one is known)
//! and a human-readable cause. Plumbing below the orchestrator works in
//! `anyhow::Result` and is folded into `Database` or `Other` at the boundary.

use std::path::PathBuf;

use thiserror::Error;

fn id_label(instance_id: &Option<String>) -> &str {
    instance_id.as_deref().unwrap_or("-")
}

#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("Validation failed for instance {}: {message}", id_label(.instance_id))]
    Validation {
        instance_id: Option<String>,
        message: String,
    },

    #[error("Resource conflict for instance {}: {message}", id_label(.instance_id))]
    ResourceConflict {
        instance_id: Option<String>,
        message: String,
    },

    #[error("{what} not found for instance {}", id_label(.instance_id))]
    NotFound {
        instance_id: Option<String>,
        what: String,
    },

    #[error(
        "Merge of {branch} for instance {} has unresolved conflicts in {} file(s): {}",
        id_label(.instance_id),
        .conflicts.len(),
        .conflicts.join(", ")
    )]
    Integration {
        instance_id: Option<String>,
        branch: String,
        conflicts: Vec<String>,
    },

    #[error("Transient IO error for instance {} at {path}: {source}", id_label(.instance_id))]
    TransientIo {
        instance_id: Option<String>,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Database error: {0:#}")]
    Database(#[source] anyhow::Error),

    #[error("Lock poisoned")]
    LockPoisoned,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl WorkflowError {
    pub fn validation(instance_id: Option<&str>, message: impl Into<String>) -> Self {
        Self::Validation {
            instance_id: instance_id.map(str::to_string),
            message: message.into(),
        }
    }

    pub fn conflict(instance_id: &str, message: impl Into<String>) -> Self {
        Self::ResourceConflict {
            instance_id: Some(instance_id.to_string()),
            message: message.into(),
        }
    }

    pub fn not_found(instance_id: &str, what: impl Into<String>) -> Self {
        Self::NotFound {
            instance_id: Some(instance_id.to_string()),
            what: what.into(),
        }
    }

    /// Stable machine-readable name used in API error bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation { .. } => "validation",
            Self::ResourceConflict { .. } => "resource_conflict",
            Self::NotFound { .. } => "not_found",
            Self::Integration { .. } => "integration",
            Self::TransientIo { .. } => "transient_io",
            Self::Database(_) => "database",
            Self::LockPoisoned => "lock_poisoned",
            Self::Other(_) => "internal",
        }
    }

    pub fn instance_id(&self) -> Option<&str> {
        match self {
            Self::Validation { instance_id, .. }
            | Self::ResourceConflict { instance_id, .. }
            | Self::NotFound { instance_id, .. }
            | Self::Integration { instance_id, .. }
            | Self::TransientIo { instance_id, .. } => instance_id.as_deref(),
            Self::Database(_) | Self::LockPoisoned | Self::Other(_) => None,
        }
    }

    /// Attach an instance id to an error that was raised without one.
    pub fn for_instance(mut self, id: &str) -> Self {
        match &mut self {
            Self::Validation { instance_id, .. }
            | Self::ResourceConflict { instance_id, .. }
            | Self::NotFound { instance_id, .. }
            | Self::Integration { instance_id, .. }
            | Self::TransientIo { instance_id, .. } => {
                if instance_id.is_none() {
                    *instance_id = Some(id.to_string());
                }
            }
            Self::Database(_) | Self::LockPoisoned | Self::Other(_) => {}
        }
        self
    }
}

pub type WorkflowResult<T> = Result<T, WorkflowError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_error_carries_instance_and_cause() {
        let err = WorkflowError::validation(Some("wf-1"), "stage 'deploy' is not in recipe");
        assert_eq!(err.instance_id(), Some("wf-1"));
        assert_eq!(err.kind(), "validation");
        let text = err.to_string();
        assert!(text.contains("wf-1"));
        assert!(text.contains("deploy"));
    }

    #[test]
    fn validation_error_without_instance_renders_placeholder() {
        let err = WorkflowError::validation(None, "missing instance id");
        assert_eq!(err.instance_id(), None);
        assert!(err.to_string().contains("instance -"));
    }

    #[test]
    fn integration_error_lists_conflicts() {
        let err = WorkflowError::Integration {
            instance_id: Some("wf-9".into()),
            branch: "pipewright/wf-9".into(),
            conflicts: vec!["src/lib.rs".into(), "README.md".into()],
        };
        let text = err.to_string();
        assert!(text.contains("2 file(s)"));
        assert!(text.contains("src/lib.rs, README.md"));
        assert_eq!(err.kind(), "integration");
    }

    #[test]
    fn transient_io_carries_path() {
        let err = WorkflowError::TransientIo {
            instance_id: Some("wf-2".into()),
            path: PathBuf::from("/tmp/raw_output.jsonl"),
            source: std::io::Error::new(std::io::ErrorKind::WouldBlock, "busy"),
        };
        match &err {
            WorkflowError::TransientIo { path, source, .. } => {
                assert_eq!(path, &PathBuf::from("/tmp/raw_output.jsonl"));
                assert_eq!(source.kind(), std::io::ErrorKind::WouldBlock);
            }
            _ => panic!("Expected TransientIo"),
        }
    }

    #[test]
    fn for_instance_fills_missing_id_only() {
        let err = WorkflowError::validation(None, "bad").for_instance("wf-3");
        assert_eq!(err.instance_id(), Some("wf-3"));

        let err = WorkflowError::not_found("wf-4", "Instance").for_instance("wf-5");
        assert_eq!(err.instance_id(), Some("wf-4"));
    }

    #[test]
    fn other_converts_from_anyhow() {
        let err: WorkflowError = anyhow::anyhow!("boom").into();
        assert!(matches!(err, WorkflowError::Other(_)));
        assert_eq!(err.kind(), "internal");
    }

    #[test]
    fn all_variants_implement_std_error() {
        fn assert_std_error<E: std::error::Error>(_: &E) {}
        assert_std_error(&WorkflowError::LockPoisoned);
        assert_std_error(&WorkflowError::conflict("wf", "busy"));
    }
}
