//! Compiler Invocation Wrapper
//!
//! Every compile job gets a FRESH engine instance. Reusing an instance
//! across jobs corrupts engine state, so only the static asset bytes are
//! cached, never the instance itself.
//!
//! Job lifecycle: `Idle -> Instantiated -> Executed -> Succeeded | Failed`.

use std::sync::Arc;
use std::time::Instant;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::assets::{AssetCache, AssetFetchError, AssetSource, STATIC_ASSETS};
use crate::engine::{Engine, EngineInstance, LogSink, MemoryFs};
use crate::field::KeycapModel;
use crate::protocol::{CompileLog, CompileResult, FsPayload};
use crate::vfs::{VirtualFile, VirtualFileStore};

pub const INPUT_PATH: &str = "/input.scad";
pub const OUTPUT_PATH: &str = "/out.stl";
pub const FONTS_DIR: &str = "fonts";
pub const FONTS_CONF_PATH: &str = "/fonts/fonts.conf";
pub const FONT_PATH: &str = "fonts/Inter-Noto-Regular.ttf";

pub const FONTS_CONF: &str = r#"<?xml version="1.0"?>
<!DOCTYPE fontconfig SYSTEM "fonts.dtd">
<fontconfig>
</fontconfig>
"#;

pub const EXPORT_PARAMS: &[&str] = &[
    "--export-format=binstl",
    "--enable=manifold",
    "--enable=fast-csg",
    "--enable=lazy-union",
];

pub const PREVIEW_PARAMS: &[&str] = &[
    "--export-format=binstl",
    "--enable=manifold",
    "--enable=fast-csg",
    "--enable=lazy-union",
    "--enable=roof",
];

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("{0}")]
    Compile(String),

    #[error("{0}")]
    OutputRead(String),

    #[error("Asset fetch failed: {0}")]
    AssetFetch(#[from] AssetFetchError),

    #[error("Engine filesystem error: {0}")]
    Filesystem(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Idle,
    Instantiated,
    Executed,
    Succeeded,
    Failed,
}

pub struct CompilerWrapper {
    engine: Box<dyn Engine>,
    assets: Arc<dyn AssetSource>,
    cache: &'static AssetCache,
    files: VirtualFileStore,
    log: LogSink,
    state: JobState,
}

impl CompilerWrapper {
    pub fn new(engine: Box<dyn Engine>, assets: Arc<dyn AssetSource>) -> Self {
        Self::with_cache(engine, assets, &STATIC_ASSETS)
    }

    /// Use a cache other than the process-wide one
    pub fn with_cache(engine: Box<dyn Engine>, assets: Arc<dyn AssetSource>, cache: &'static AssetCache) -> Self {
        Self {
            engine,
            assets,
            cache,
            files: VirtualFileStore::new(),
            log: LogSink::new(),
            state: JobState::Idle,
        }
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    pub fn files(&self) -> &VirtualFileStore {
        &self.files
    }

    /// Console output of the most recent compile job, failed or not
    pub fn last_log(&self) -> CompileLog {
        self.log.snapshot()
    }

    /// Create and seed a fresh engine instance
    fn instantiate(&mut self) -> Result<Box<dyn EngineInstance>, EngineError> {
        let mut instance = self
            .engine
            .instantiate(self.log.clone())
            .map_err(|e| EngineError::Compile(format!("OpenSCAD failed to start: {}", e)))?;
        self.state = JobState::Instantiated;

        let assets = self.cache.get_or_fetch(self.assets.as_ref())?;
        let fs = instance.fs();

        create_directory_recursive(fs, FONTS_DIR)?;
        write(fs, FONTS_CONF_PATH, FONTS_CONF.as_bytes())?;
        write(fs, FONT_PATH, &assets.font)?;
        for model in KeycapModel::all() {
            write(fs, model.shape_path(), assets.shape(model))?;
        }

        for file in self.files.iter() {
            if let Some(dir) = file.parent_dir() {
                if !file_exists(fs, dir) {
                    create_directory_recursive(fs, dir)?;
                }
            }
            write(fs, &file.path, &file.content)?;
        }

        debug!(
            engine = self.engine.name(),
            virtual_files = self.files.len(),
            "Engine instance provisioned"
        );
        Ok(instance)
    }

    pub fn export_file(&mut self, code: &str) -> Result<CompileResult, EngineError> {
        self.execute_openscad(code, EXPORT_PARAMS)
    }

    pub fn preview(&mut self, code: &str) -> Result<CompileResult, EngineError> {
        self.execute_openscad(code, PREVIEW_PARAMS)
    }

    /// Single execution path shared by export and preview.
    ///
    /// A nonzero exit code is a normal result with no output, not an error.
    pub fn execute_openscad(&mut self, code: &str, parameters: &[&str]) -> Result<CompileResult, EngineError> {
        let start = Instant::now();
        self.log.reset();
        self.state = JobState::Idle;

        let result = self.run(code, parameters, start);
        if result.is_err() {
            self.state = JobState::Failed;
        }
        result
    }

    fn run(&mut self, code: &str, parameters: &[&str], start: Instant) -> Result<CompileResult, EngineError> {
        let mut instance = self.instantiate()?;
        write(instance.fs(), INPUT_PATH, code.as_bytes())?;

        let mut args: Vec<String> = vec![INPUT_PATH.to_string(), "-o".to_string(), OUTPUT_PATH.to_string()];
        args.extend(parameters.iter().map(|p| p.to_string()));

        let exit_code = instance
            .call_main(&args)
            .map_err(|e| EngineError::Compile(format!("OpenSCAD exited with an error: {}", e)))?;
        self.state = JobState::Executed;

        let output = if exit_code == 0 {
            let bytes = instance
                .fs()
                .read_file(OUTPUT_PATH)
                .map_err(|e| EngineError::OutputRead(format!("OpenSCAD cannot read created file: {}", e)))?;
            Some(bytes)
        } else {
            None
        };

        let duration = start.elapsed().as_millis() as u64;
        self.state = if output.is_some() { JobState::Succeeded } else { JobState::Failed };

        if exit_code == 0 {
            info!(duration_ms = duration, "OpenSCAD run succeeded");
        } else {
            warn!(exit_code, duration_ms = duration, "OpenSCAD run failed");
        }

        Ok(CompileResult {
            log: self.log.snapshot(),
            output,
            exit_code,
            duration,
        })
    }

    /// Last write wins; the engine sees the file from the next job on
    pub fn write_file(&mut self, path: &str, content: VirtualFile) {
        debug!(path, bytes = content.content.len(), "Virtual file written");
        self.files.write(path, content);
    }

    pub fn read_file(&self, path: &str) -> FsPayload {
        FsPayload {
            path: path.to_string(),
            content: self.files.read(path).cloned(),
        }
    }

    pub fn unlink_file(&mut self, path: &str) {
        debug!(path, "Virtual file unlinked");
        self.files.unlink(path);
    }
}

/// Stat-style existence check
pub fn file_exists(fs: &MemoryFs, path: &str) -> bool {
    fs.stat(path).is_ok()
}

/// Create every missing directory along `path`; existing ones are skipped
pub fn create_directory_recursive(fs: &mut MemoryFs, path: &str) -> Result<(), EngineError> {
    let mut current = String::new();
    for part in path.split('/').filter(|p| !p.is_empty()) {
        current.push('/');
        current.push_str(part);

        if !file_exists(fs, &current) {
            fs.mkdir(&current).map_err(|e| EngineError::Filesystem(e.to_string()))?;
        }
    }
    Ok(())
}

fn write(fs: &mut MemoryFs, path: &str, data: &[u8]) -> Result<(), EngineError> {
    fs.write_file(path, data)
        .map_err(|e| EngineError::Filesystem(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assets::{MemoryAssetSource, FONT_ASSET};
    use crate::engine::{EngineFault, NodeKind, ScriptedEngine};
    use std::sync::atomic::Ordering;

    fn source() -> Arc<dyn AssetSource> {
        Arc::new(
            MemoryAssetSource::new()
                .with(FONT_ASSET, b"font".to_vec())
                .with("Cap_U.stl", b"u".to_vec())
                .with("Cap_O.stl", b"o".to_vec())
                .with("Cap_Flat.stl", b"flat".to_vec()),
        )
    }

    fn echo_engine() -> ScriptedEngine {
        ScriptedEngine::new(|fs, args, log| {
            let code = fs.read_file(&args[0])?;
            log.out(format!("args: {}", args.join(" ")));
            if code.starts_with(b"fail") {
                log.err("ERROR: Parser error");
                return Ok(1);
            }
            if code.starts_with(b"throw") {
                return Err(EngineFault::new("42"));
            }
            if code.starts_with(b"silent") {
                return Ok(0);
            }
            fs.write_file(&args[2], &code)?;
            Ok(0)
        })
    }

    #[test]
    fn test_export_returns_output() {
        static CACHE: AssetCache = AssetCache::new();
        let mut wrapper = CompilerWrapper::with_cache(Box::new(echo_engine()), source(), &CACHE);

        let result = wrapper.export_file("cube(1);").unwrap();
        assert_eq!(result.exit_code, 0);
        assert_eq!(result.output.as_deref(), Some(&b"cube(1);"[..]));
        assert_eq!(wrapper.state(), JobState::Succeeded);
        assert!(result.log.std_out[0].ends_with("--enable=lazy-union"));
    }

    #[test]
    fn test_preview_adds_roof() {
        static CACHE: AssetCache = AssetCache::new();
        let mut wrapper = CompilerWrapper::with_cache(Box::new(echo_engine()), source(), &CACHE);

        let result = wrapper.preview("sphere();").unwrap();
        assert!(result.log.std_out[0].ends_with("--enable=roof"));
    }

    #[test]
    fn test_nonzero_exit_is_not_error() {
        static CACHE: AssetCache = AssetCache::new();
        let mut wrapper = CompilerWrapper::with_cache(Box::new(echo_engine()), source(), &CACHE);

        let result = wrapper.export_file("fail").unwrap();
        assert_eq!(result.exit_code, 1);
        assert!(result.output.is_none());
        assert_eq!(result.log.std_err, vec!["ERROR: Parser error"]);
        assert_eq!(wrapper.state(), JobState::Failed);
    }

    #[test]
    fn test_engine_fault_becomes_compile_error() {
        static CACHE: AssetCache = AssetCache::new();
        let mut wrapper = CompilerWrapper::with_cache(Box::new(echo_engine()), source(), &CACHE);

        let err = wrapper.export_file("throw").unwrap_err();
        assert!(matches!(err, EngineError::Compile(_)));
        assert_eq!(err.to_string(), "OpenSCAD exited with an error: 42");
        assert_eq!(wrapper.last_log().std_out, vec!["args: /input.scad -o /out.stl --export-format=binstl --enable=manifold --enable=fast-csg --enable=lazy-union"]);
    }

    #[test]
    fn test_missing_output_becomes_read_error() {
        static CACHE: AssetCache = AssetCache::new();
        let mut wrapper = CompilerWrapper::with_cache(Box::new(echo_engine()), source(), &CACHE);

        let err = wrapper.export_file("silent").unwrap_err();
        assert!(matches!(err, EngineError::OutputRead(_)));
        assert!(err.to_string().starts_with("OpenSCAD cannot read created file"));
    }

    #[test]
    fn test_fresh_instance_per_job_and_log_reset() {
        static CACHE: AssetCache = AssetCache::new();
        let engine = echo_engine();
        let counter = engine.instantiation_counter();
        let mut wrapper = CompilerWrapper::with_cache(Box::new(engine), source(), &CACHE);

        wrapper.export_file("a").unwrap();
        let second = wrapper.export_file("b").unwrap();

        assert_eq!(counter.load(Ordering::SeqCst), 2);
        assert_eq!(second.log.std_out.len(), 1);
    }

    #[test]
    fn test_instance_seeded_with_assets_and_virtual_files() {
        static CACHE: AssetCache = AssetCache::new();
        let engine = ScriptedEngine::new(|fs, args, _log| {
            for path in ["/fonts/fonts.conf", "/fonts/Inter-Noto-Regular.ttf", "/Cap_U.stl", "/Cap_O.stl", "/Cap_Flat.stl", "/lib/deep/util.scad"] {
                if fs.stat(path)? != NodeKind::File {
                    return Ok(3);
                }
            }
            let util = fs.read_file("/lib/deep/util.scad")?;
            fs.write_file(&args[2], &util)?;
            Ok(0)
        });
        let mut wrapper = CompilerWrapper::with_cache(Box::new(engine), source(), &CACHE);
        wrapper.write_file("util.scad", VirtualFile::new("util.scad", "lib/deep/util.scad", b"module u(){}".to_vec()));

        let result = wrapper.export_file("include <lib/deep/util.scad>").unwrap();
        assert_eq!(result.exit_code, 0);
        assert_eq!(result.output.unwrap(), b"module u(){}");
    }

    #[test]
    fn test_directory_provisioning_idempotent() {
        let mut fs = MemoryFs::new();
        create_directory_recursive(&mut fs, "a/b/c").unwrap();
        create_directory_recursive(&mut fs, "a/b/c").unwrap();
        create_directory_recursive(&mut fs, "/a/b/d").unwrap();
        assert_eq!(fs.stat("/a/b/d").unwrap(), NodeKind::Dir);
    }

    #[test]
    fn test_fs_bridge_ops() {
        static CACHE: AssetCache = AssetCache::new();
        let mut wrapper = CompilerWrapper::with_cache(Box::new(echo_engine()), source(), &CACHE);

        wrapper.write_file("x", VirtualFile::new("x", "x.scad", b"1".to_vec()));
        wrapper.write_file("x", VirtualFile::new("x", "x.scad", b"2".to_vec()));
        assert_eq!(wrapper.read_file("x").content.unwrap().content, b"2");

        wrapper.unlink_file("x");
        wrapper.unlink_file("x");
        assert!(wrapper.read_file("x").content.is_none());
    }

    #[test]
    fn test_asset_fetch_failure_surfaces() {
        static CACHE: AssetCache = AssetCache::new();
        let empty: Arc<dyn AssetSource> = Arc::new(MemoryAssetSource::new());
        let mut wrapper = CompilerWrapper::with_cache(Box::new(echo_engine()), empty, &CACHE);

        let err = wrapper.export_file("cube();").unwrap_err();
        assert!(matches!(err, EngineError::AssetFetch(_)));
    }
}
