use anyhow::{anyhow, Context, Result};
use bevy::utils::HashMap;
use std::{fs, path::PathBuf};

/// Resolves the source names stored in the feeder properties to bytes.
pub trait DataSource: Send + Sync {
    fn read(&self, path: &str) -> Result<Vec<u8>>;
}

/// Reads sources relative to a root directory.
#[derive(Clone, Debug)]
pub struct FileDataSource {
    root: PathBuf,
}

impl FileDataSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl DataSource for FileDataSource {
    fn read(&self, path: &str) -> Result<Vec<u8>> {
        let path = self.root.join(path);
        fs::read(&path).with_context(|| format!("Failed to read {}.", path.display()))
    }
}

/// Serves sources from memory, for generated terrain and tests.
#[derive(Clone, Debug, Default)]
pub struct MemoryDataSource {
    files: HashMap<String, Vec<u8>>,
}

impl MemoryDataSource {
    pub fn insert(&mut self, path: impl Into<String>, bytes: Vec<u8>) {
        self.files.insert(path.into(), bytes);
    }

    pub fn with(mut self, path: impl Into<String>, bytes: Vec<u8>) -> Self {
        self.insert(path, bytes);
        self
    }
}

impl DataSource for MemoryDataSource {
    fn read(&self, path: &str) -> Result<Vec<u8>> {
        self.files
            .get(path)
            .cloned()
            .ok_or_else(|| anyhow!("No source named `{path}`."))
    }
}
