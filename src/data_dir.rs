use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

#[derive(Debug, Clone)]
pub struct DataDir {
    root: PathBuf,
}

impl DataDir {
    /// Resolve the data directory from, in order of priority:
    /// 1. An explicit path (from --data-dir)
    /// 2. The PATHDEX_DATA_DIR environment variable
    /// 3. The XDG data directory (~/.local/share/pathdex/)
    pub fn resolve(explicit: Option<&Path>) -> Result<Self> {
        let root = if let Some(path) = explicit {
            path.to_path_buf()
        } else if let Ok(val) = std::env::var("PATHDEX_DATA_DIR") {
            PathBuf::from(val)
        } else {
            xdg::BaseDirectories::with_prefix("pathdex")
                .get_data_home()
                .ok_or_else(|| {
                    Error::Config(
                        "could not determine XDG data home directory".into(),
                    )
                })?
        };

        std::fs::create_dir_all(&root)
            .map_err(|_| Error::DataDir(root.clone()))?;

        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn settings_file(&self) -> PathBuf {
        self.root.join("settings.json")
    }

    /// Shard-groups flagged for an integrity check on next startup.
    pub fn integrity_file(&self) -> PathBuf {
        self.root.join("databaseIntegrityCheck.json")
    }

    /// Creation date of each disk dataset.
    pub fn create_time_file(&self) -> PathBuf {
        self.root.join("databaseCreateTime.json")
    }

    /// The live dataset.
    pub fn dataset_dir(&self) -> Result<PathBuf> {
        self.ensure("data")
    }

    /// Where a rebuild keeps the copy it serves from.
    pub fn snapshot_dir(&self) -> Result<PathBuf> {
        self.ensure("tmp")
    }

    fn ensure(&self, name: &str) -> Result<PathBuf> {
        let path = self.root.join(name);
        std::fs::create_dir_all(&path)
            .map_err(|_| Error::DataDir(path.clone()))?;
        Ok(path)
    }
}
