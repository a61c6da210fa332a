//! Engine Abstraction
//!
//! An [`Engine`] hands out single-use [`EngineInstance`]s. Every instance
//! owns a private [`MemoryFs`] and reports its console output through a
//! [`LogSink`].

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use thiserror::Error;

use crate::protocol::CompileLog;

/// Fault raised by the engine or its filesystem
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{0}")]
pub struct EngineFault(pub String);

impl EngineFault {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Shared stdout/stderr buffers for the running job
#[derive(Debug, Clone, Default)]
pub struct LogSink {
    inner: Arc<Mutex<CompileLog>>,
}

impl LogSink {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, CompileLog> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn out(&self, line: impl Into<String>) {
        self.lock().std_out.push(line.into());
    }

    pub fn err(&self, line: impl Into<String>) {
        self.lock().std_err.push(line.into());
    }

    pub fn reset(&self) {
        let mut log = self.lock();
        log.std_out.clear();
        log.std_err.clear();
    }

    pub fn snapshot(&self) -> CompileLog {
        self.lock().clone()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Dir,
    File,
}

#[derive(Debug, Clone)]
enum Node {
    Dir,
    File(Vec<u8>),
}

/// Engine-private filesystem rooted at `/`.
///
/// Relative paths resolve against the root. `mkdir` fails on existing
/// paths and missing parents.
#[derive(Debug, Clone)]
pub struct MemoryFs {
    nodes: BTreeMap<String, Node>,
}

impl MemoryFs {
    pub fn new() -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert("/".to_string(), Node::Dir);
        Self { nodes }
    }

    pub fn normalize(path: &str) -> String {
        let mut parts: Vec<&str> = Vec::new();
        for part in path.split('/') {
            match part {
                "" | "." => {}
                ".." => {
                    parts.pop();
                }
                other => parts.push(other),
            }
        }
        format!("/{}", parts.join("/"))
    }

    fn parent_of(normalized: &str) -> Option<&str> {
        if normalized == "/" {
            return None;
        }
        match normalized.rfind('/') {
            Some(0) => Some("/"),
            Some(idx) => Some(&normalized[..idx]),
            None => None,
        }
    }

    fn require_parent_dir(&self, normalized: &str, original: &str) -> Result<(), EngineFault> {
        let Some(parent) = Self::parent_of(normalized) else {
            return Ok(());
        };
        match self.nodes.get(parent) {
            Some(Node::Dir) => Ok(()),
            Some(Node::File(_)) => Err(EngineFault(format!("ENOTDIR: not a directory '{}'", original))),
            None => Err(EngineFault(format!("ENOENT: no such file or directory '{}'", original))),
        }
    }

    pub fn stat(&self, path: &str) -> Result<NodeKind, EngineFault> {
        match self.nodes.get(&Self::normalize(path)) {
            Some(Node::Dir) => Ok(NodeKind::Dir),
            Some(Node::File(_)) => Ok(NodeKind::File),
            None => Err(EngineFault(format!("ENOENT: no such file or directory '{}'", path))),
        }
    }

    pub fn mkdir(&mut self, path: &str) -> Result<(), EngineFault> {
        let normalized = Self::normalize(path);
        if self.nodes.contains_key(&normalized) {
            return Err(EngineFault(format!("EEXIST: file already exists '{}'", path)));
        }
        self.require_parent_dir(&normalized, path)?;
        self.nodes.insert(normalized, Node::Dir);
        Ok(())
    }

    pub fn write_file(&mut self, path: &str, data: &[u8]) -> Result<(), EngineFault> {
        let normalized = Self::normalize(path);
        if let Some(Node::Dir) = self.nodes.get(&normalized) {
            return Err(EngineFault(format!("EISDIR: illegal operation on a directory '{}'", path)));
        }
        self.require_parent_dir(&normalized, path)?;
        self.nodes.insert(normalized, Node::File(data.to_vec()));
        Ok(())
    }

    pub fn read_file(&self, path: &str) -> Result<Vec<u8>, EngineFault> {
        match self.nodes.get(&Self::normalize(path)) {
            Some(Node::File(data)) => Ok(data.clone()),
            Some(Node::Dir) => Err(EngineFault(format!("EISDIR: illegal operation on a directory '{}'", path))),
            None => Err(EngineFault(format!("ENOENT: no such file or directory '{}'", path))),
        }
    }

    /// All nodes in path order; directories carry no data
    pub fn entries(&self) -> impl Iterator<Item = (&str, Option<&[u8]>)> {
        self.nodes.iter().map(|(path, node)| match node {
            Node::Dir => (path.as_str(), None),
            Node::File(data) => (path.as_str(), Some(data.as_slice())),
        })
    }
}

impl Default for MemoryFs {
    fn default() -> Self {
        Self::new()
    }
}

/// One single-use engine instantiation
pub trait EngineInstance {
    fn fs(&mut self) -> &mut MemoryFs;

    /// Run the engine's entry point; returns its exit code
    fn call_main(&mut self, args: &[String]) -> Result<i32, EngineFault>;
}

pub trait Engine: Send {
    fn name(&self) -> &str;

    fn instantiate(&self, log: LogSink) -> Result<Box<dyn EngineInstance>, EngineFault>;
}

type MainFn = dyn Fn(&mut MemoryFs, &[String], &LogSink) -> Result<i32, EngineFault> + Send + Sync;

/// Engine whose entry point is a Rust closure
pub struct ScriptedEngine {
    main: Arc<MainFn>,
    instantiations: Arc<AtomicUsize>,
}

impl ScriptedEngine {
    pub fn new<F>(main: F) -> Self
    where
        F: Fn(&mut MemoryFs, &[String], &LogSink) -> Result<i32, EngineFault> + Send + Sync + 'static,
    {
        Self {
            main: Arc::new(main),
            instantiations: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Counter shared with every clone of this engine
    pub fn instantiation_counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.instantiations)
    }
}

struct ScriptedInstance {
    main: Arc<MainFn>,
    fs: MemoryFs,
    log: LogSink,
}

impl EngineInstance for ScriptedInstance {
    fn fs(&mut self) -> &mut MemoryFs {
        &mut self.fs
    }

    fn call_main(&mut self, args: &[String]) -> Result<i32, EngineFault> {
        (self.main)(&mut self.fs, args, &self.log)
    }
}

impl Engine for ScriptedEngine {
    fn name(&self) -> &str {
        "scripted"
    }

    fn instantiate(&self, log: LogSink) -> Result<Box<dyn EngineInstance>, EngineFault> {
        self.instantiations.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(ScriptedInstance {
            main: Arc::clone(&self.main),
            fs: MemoryFs::new(),
            log,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize() {
        assert_eq!(MemoryFs::normalize("fonts"), "/fonts");
        assert_eq!(MemoryFs::normalize("/a//b/./c"), "/a/b/c");
        assert_eq!(MemoryFs::normalize("/a/../b"), "/b");
        assert_eq!(MemoryFs::normalize(""), "/");
    }

    #[test]
    fn test_mkdir_requires_parent() {
        let mut fs = MemoryFs::new();
        assert!(fs.mkdir("/a/b").is_err());
        fs.mkdir("/a").unwrap();
        fs.mkdir("/a/b").unwrap();
        assert_eq!(fs.stat("a/b").unwrap(), NodeKind::Dir);
    }

    #[test]
    fn test_mkdir_twice_faults() {
        let mut fs = MemoryFs::new();
        fs.mkdir("/fonts").unwrap();
        let err = fs.mkdir("fonts").unwrap_err();
        assert!(err.0.starts_with("EEXIST"));
    }

    #[test]
    fn test_write_and_read() {
        let mut fs = MemoryFs::new();
        assert!(fs.write_file("/missing/x.scad", b"x").is_err());
        fs.write_file("x.scad", b"cube();").unwrap();
        assert_eq!(fs.read_file("/x.scad").unwrap(), b"cube();");
        assert!(fs.read_file("/").is_err());
        assert!(fs.read_file("/nope").is_err());
    }

    #[test]
    fn test_log_sink_reset() {
        let sink = LogSink::new();
        let shared = sink.clone();
        shared.out("hello");
        shared.err("oops");
        assert_eq!(sink.snapshot().std_out, vec!["hello"]);
        sink.reset();
        assert!(sink.snapshot().std_err.is_empty());
    }
}
