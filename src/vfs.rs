//! Virtual File Store
//!
//! Files the engine does not ship with. The store outlives every engine
//! instance; each new instance is seeded from it.

use serde::{Deserialize, Serialize};

use crate::protocol::base64_bytes;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VirtualFile {
    /// Unique key within the store
    pub name: String,
    /// Location inside the engine filesystem
    #[serde(default)]
    pub path: String,
    #[serde(with = "base64_bytes")]
    pub content: Vec<u8>,
}

impl VirtualFile {
    pub fn new(name: impl Into<String>, path: impl Into<String>, content: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            content: content.into(),
        }
    }

    /// Directory part of `path`, if any
    pub fn parent_dir(&self) -> Option<&str> {
        let trimmed = self.path.trim_end_matches('/');
        match trimmed.rfind('/') {
            Some(0) | None => None,
            Some(idx) => Some(&trimmed[..idx]),
        }
    }
}

/// Insertion-ordered, last-write-wins collection of virtual files
#[derive(Debug, Clone, Default)]
pub struct VirtualFileStore {
    files: Vec<VirtualFile>,
}

impl VirtualFileStore {
    pub fn new() -> Self {
        Self { files: Vec::new() }
    }

    /// Store `file` under `key`, replacing any entry with that name.
    ///
    /// `key` becomes the file's name whatever the payload said. A file
    /// without a path takes `key` as its path.
    pub fn write(&mut self, key: &str, mut file: VirtualFile) {
        self.files.retain(|f| f.name != key);
        file.name = key.to_string();
        if file.path.is_empty() {
            file.path = key.to_string();
        }
        self.files.push(file);
    }

    pub fn read(&self, key: &str) -> Option<&VirtualFile> {
        self.files.iter().find(|f| f.name == key)
    }

    /// Remove by name. Absent names are ignored.
    pub fn unlink(&mut self, key: &str) {
        self.files.retain(|f| f.name != key);
    }

    pub fn iter(&self) -> impl Iterator<Item = &VirtualFile> {
        self.files.iter()
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}
