//! Scaffolding for `.looper/` in a task working directory.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use tracing::debug;

use crate::io::config::{LoopConfig, write_config};
use crate::io::paths::LooperPaths;
use crate::io::status_store::STATUS_SCHEMA;

/// Options for `init_looper`.
#[derive(Debug, Clone)]
pub struct InitOptions {
    /// Overwrite looper-owned files. Task instructions are never overwritten.
    pub force: bool,
}

/// Create `.looper/` scaffolding in `root`.
///
/// Fails if `.looper/` already exists unless `options.force` is set.
pub fn init_looper(root: &Path, options: &InitOptions) -> Result<LooperPaths> {
    let paths = LooperPaths::new(root);
    if paths.looper_dir.exists() && !paths.looper_dir.is_dir() {
        return Err(anyhow!("looper init: .looper exists but is not a directory"));
    }
    if paths.looper_dir.exists() && !options.force {
        return Err(anyhow!(
            "looper init: .looper already exists (use --force to overwrite)"
        ));
    }

    create_dir(&paths.looper_dir)?;
    create_dir(&paths.state_dir)?;
    create_dir(&paths.iterations_dir)?;

    write_file(&paths.looper_dir.join(".gitignore"), LOOPER_GITIGNORE)?;
    write_config(&paths.config_path, &LoopConfig::default())?;
    write_file(&paths.status_schema_path, STATUS_SCHEMA)?;
    if paths.instructions_path.exists() {
        debug!(path = %paths.instructions_path.display(), "keeping existing instructions");
    } else {
        write_file(&paths.instructions_path, INSTRUCTIONS_PLACEHOLDER)?;
    }

    Ok(paths)
}

fn create_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path).with_context(|| format!("create directory {}", path.display()))
}

fn write_file(path: &Path, contents: &str) -> Result<()> {
    fs::write(path, contents).with_context(|| format!("write file {}", path.display()))
}

const INSTRUCTIONS_PLACEHOLDER: &str =
    "# Instructions\n\nDescribe the task the agent should complete, and how to tell it is done.\n";
const LOOPER_GITIGNORE: &str = "state/\niterations/\nSTOP\nverification.md\n";

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::config::load_config;

    #[test]
    fn init_creates_expected_layout() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = init_looper(temp.path(), &InitOptions { force: false }).expect("init");

        assert!(paths.state_dir.is_dir());
        assert!(paths.iterations_dir.is_dir());
        assert!(paths.instructions_path.is_file());
        assert!(!paths.status_path.exists());
        assert!(!paths.stop_path.exists());
        assert_eq!(
            load_config(&paths.config_path).expect("config"),
            LoopConfig::default()
        );
        let schema = fs::read_to_string(&paths.status_schema_path).expect("schema");
        assert_eq!(schema, STATUS_SCHEMA);
    }

    #[test]
    fn init_requires_force_when_present() {
        let temp = tempfile::tempdir().expect("tempdir");
        init_looper(temp.path(), &InitOptions { force: false }).expect("init");
        let err = init_looper(temp.path(), &InitOptions { force: false }).unwrap_err();
        assert!(err.to_string().contains("already exists"));
    }

    #[test]
    fn force_keeps_existing_instructions() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = init_looper(temp.path(), &InitOptions { force: false }).expect("init");
        fs::write(&paths.instructions_path, "Refactor the parser.\n").expect("write");
        fs::write(&paths.config_path, "max_iterations = 3\n").expect("write");

        init_looper(temp.path(), &InitOptions { force: true }).expect("reinit");
        assert_eq!(
            fs::read_to_string(&paths.instructions_path).expect("read"),
            "Refactor the parser.\n"
        );
        assert_eq!(
            load_config(&paths.config_path).expect("config").max_iterations,
            25
        );
    }
}
