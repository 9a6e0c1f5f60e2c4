//! Resource project description and the build lock.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProjectError {
    #[error("cannot read project file \"{path}\": {source}")]
    Read {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("project file \"{path}\" is malformed: {reason}")]
    Malformed { path: String, reason: String },
    #[error("workspace is locked by \"{0}\" (another build in progress?)")]
    Locked(String),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// Declares where a project keeps its plugins and build workspace.
/// Stored as readable data next to the project sources.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct ResourceProject {
    pub workspace_directory: String,
    pub plugin_directory_name: String,
    pub plugins: Vec<String>,
}

impl ResourceProject {
    pub fn load(path: &Path) -> Result<Self, ProjectError> {
        let text = fs::read_to_string(path).map_err(|source| ProjectError::Read {
            path: path.display().to_string(),
            source,
        })?;
        ron::from_str(&text).map_err(|error| ProjectError::Malformed {
            path: path.display().to_string(),
            reason: error.to_string(),
        })
    }

    pub fn save(&self, path: &Path) -> Result<(), ProjectError> {
        let text = ron::ser::to_string_pretty(self, ron::ser::PrettyConfig::default())
            .map_err(|error| ProjectError::Malformed {
                path: path.display().to_string(),
                reason: error.to_string(),
            })?;
        fs::write(path, text)?;
        Ok(())
    }
}

/// Holds `<workspace>.build_lock` for the duration of a build; the file
/// is removed when the guard drops.
pub struct BuildLock {
    path: PathBuf,
}

impl BuildLock {
    pub fn acquire(workspace: &Path) -> Result<Self, ProjectError> {
        let path = workspace.with_extension("build_lock");
        match fs::OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(_) => Ok(BuildLock { path }),
            Err(error) if error.kind() == io::ErrorKind::AlreadyExists => {
                Err(ProjectError::Locked(path.display().to_string()))
            }
            Err(error) => Err(error.into()),
        }
    }
}

impl Drop for BuildLock {
    fn drop(&mut self) {
        if let Err(error) = fs::remove_file(&self.path) {
            log::warn!(
                target: "resource",
                "failed to remove build lock \"{}\": {}",
                self.path.display(),
                error
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn project_round_trip() {
        let directory = tempfile::tempdir().unwrap();
        let path = directory.path().join("project.rd");

        let project = ResourceProject {
            workspace_directory: "workspace".to_owned(),
            plugin_directory_name: "plugins".to_owned(),
            plugins: vec!["core".to_owned(), "game".to_owned()],
        };
        project.save(&path).unwrap();

        let loaded = ResourceProject::load(&path).unwrap();
        assert_eq!(loaded.workspace_directory, "workspace");
        assert_eq!(loaded.plugins, vec!["core", "game"]);
    }

    #[test]
    fn build_lock_is_exclusive_and_removed() {
        let directory = tempfile::tempdir().unwrap();
        let workspace = directory.path().join("workspace");

        let lock = BuildLock::acquire(&workspace).unwrap();
        assert!(matches!(
            BuildLock::acquire(&workspace),
            Err(ProjectError::Locked(_))
        ));
        drop(lock);
        assert!(BuildLock::acquire(&workspace).is_ok());
    }
}
