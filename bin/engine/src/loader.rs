//! Loads workflow definitions from a directory of JSON files.

use std::fmt;
use std::path::{Path, PathBuf};
use stepweave_workflow::{FunctionRegistry, Workflow, WorkflowRegistry};
use tracing::{debug, info};

/// Errors from loading workflow definitions.
#[derive(Debug)]
pub enum LoadError {
    /// The directory could not be read.
    ReadDir { path: PathBuf, details: String },
    /// A definition file could not be read.
    ReadFile { path: PathBuf, details: String },
    /// A definition file is not a valid workflow.
    Parse { path: PathBuf, details: String },
    /// A workflow failed validation or clashes with another.
    Register { path: PathBuf, details: String },
}

impl fmt::Display for LoadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ReadDir { path, details } => {
                write!(f, "cannot read workflows dir '{}': {details}", path.display())
            }
            Self::ReadFile { path, details } => {
                write!(f, "cannot read '{}': {details}", path.display())
            }
            Self::Parse { path, details } => {
                write!(f, "invalid definition in '{}': {details}", path.display())
            }
            Self::Register { path, details } => {
                write!(f, "cannot register '{}': {details}", path.display())
            }
        }
    }
}

impl std::error::Error for LoadError {}

/// Reads every `*.json` file in `dir`, in file name order, and registers it.
///
/// # Errors
///
/// Returns an error naming the first file that cannot be read, parsed or
/// registered.
pub fn load_workflows(
    dir: &Path,
    functions: &FunctionRegistry,
) -> stepweave_core::Result<WorkflowRegistry, LoadError> {
    let mut paths: Vec<PathBuf> = std::fs::read_dir(dir)
        .map_err(|e| LoadError::ReadDir {
            path: dir.to_path_buf(),
            details: e.to_string(),
        })?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.extension().is_some_and(|ext| ext == "json"))
        .collect();
    paths.sort();

    let mut registry = WorkflowRegistry::new();
    for path in paths {
        let bytes = std::fs::read(&path).map_err(|e| LoadError::ReadFile {
            path: path.clone(),
            details: e.to_string(),
        })?;
        let workflow = Workflow::from_json_bytes(&bytes).map_err(|e| LoadError::Parse {
            path: path.clone(),
            details: e.to_string(),
        })?;
        let name = workflow.name.clone();
        registry
            .register(workflow, functions)
            .map_err(|report| LoadError::Register {
                path: path.clone(),
                details: report.to_string(),
            })?;
        debug!(workflow = %name, path = %path.display(), "loaded workflow");
    }

    info!(workflows = registry.len(), dir = %dir.display(), "workflow definitions loaded");
    Ok(registry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use stepweave_workflow::register_flow_control;

    fn functions() -> FunctionRegistry {
        let mut functions = FunctionRegistry::new();
        register_flow_control(&mut functions);
        functions
    }

    const BRANCHING: &str = r#"{
        "name": "branching",
        "description": "Routes on a trigger flag",
        "graph": {
            "check": {
                "nodeId": "ifCondition",
                "input": { "condition": { "$ref": "trigger", "path": "flag" } },
                "next": { "true": "yes", "false": "no" }
            },
            "yes": { "nodeId": "merge", "input": { "answer": "yes" } },
            "no": { "nodeId": "merge", "input": { "answer": "no" } }
        }
    }"#;

    #[test]
    fn loads_json_definitions_and_ignores_other_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("branching.json"), BRANCHING).unwrap();
        std::fs::write(dir.path().join("README.md"), "# not a workflow").unwrap();

        let registry = load_workflows(dir.path(), &functions()).unwrap();
        assert_eq!(registry.names(), vec!["branching"]);
        let registered = registry.get("branching").unwrap();
        assert_eq!(
            registered.workflow.description.as_deref(),
            Some("Routes on a trigger flag")
        );
        assert_eq!(registered.workflow.graph.len(), 3);
    }

    #[test]
    fn reports_the_offending_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("broken.json"), "{ not json").unwrap();

        let err = load_workflows(dir.path(), &functions()).unwrap_err();
        assert!(err.to_string().contains("broken.json"));
    }

    #[test]
    fn rejects_invalid_graphs() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("unknown.json"),
            r#"{ "name": "unknown", "graph": { "a": { "nodeId": "doesNotExist" } } }"#,
        )
        .unwrap();

        let err = load_workflows(dir.path(), &functions()).unwrap_err();
        let message = err.to_string();
        assert!(message.contains("cannot register"));
        assert!(message.contains("doesNotExist"));
    }

    #[test]
    fn missing_dir_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_workflows(&dir.path().join("absent"), &functions()).unwrap_err();
        assert!(err.to_string().contains("cannot read workflows dir"));
    }
}
