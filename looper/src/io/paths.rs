//! Canonical paths within `.looper/` for a task working directory.

use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct LooperPaths {
    pub root: PathBuf,
    pub looper_dir: PathBuf,
    pub state_dir: PathBuf,
    pub iterations_dir: PathBuf,
    pub config_path: PathBuf,
    pub instructions_path: PathBuf,
    pub status_path: PathBuf,
    pub status_schema_path: PathBuf,
    pub stop_path: PathBuf,
    pub verification_report_path: PathBuf,
    pub session_path: PathBuf,
}

impl LooperPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let looper_dir = root.join(".looper");
        let state_dir = looper_dir.join("state");
        Self {
            root: root.clone(),
            looper_dir: looper_dir.clone(),
            state_dir: state_dir.clone(),
            iterations_dir: looper_dir.join("iterations"),
            config_path: looper_dir.join("config.toml"),
            instructions_path: looper_dir.join("INSTRUCTIONS.md"),
            status_path: looper_dir.join("status.json"),
            status_schema_path: looper_dir.join("status.schema.json"),
            stop_path: looper_dir.join("STOP"),
            verification_report_path: looper_dir.join("verification.md"),
            session_path: state_dir.join("session.json"),
        }
    }

    /// Directory for one invocation's logs.
    pub fn iteration_dir(&self, session_id: &str, iter: u32) -> PathBuf {
        self.iterations_dir.join(session_id).join(iter.to_string())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paths_are_stable() {
        let paths = LooperPaths::new("/work");
        assert_eq!(paths.status_path, Path::new("/work/.looper/status.json"));
        assert_eq!(paths.stop_path, Path::new("/work/.looper/STOP"));
        assert_eq!(
            paths.session_path,
            Path::new("/work/.looper/state/session.json")
        );
        assert_eq!(
            paths.iteration_dir("s-1", 4),
            Path::new("/work/.looper/iterations/s-1/4")
        );
    }
}
