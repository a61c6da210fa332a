//! OpenSCAD Executable Engine
//!
//! Each instance materialises its private filesystem into a scratch
//! directory, runs the executable there, then pulls the `-o` targets back.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use tracing::debug;

use crate::engine::{Engine, EngineFault, EngineInstance, LogSink, MemoryFs};
use crate::wrapper::{FONTS_CONF_PATH, FONTS_DIR};

pub struct OpenscadBinary {
    program: PathBuf,
}

impl OpenscadBinary {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self { program: program.into() }
    }
}

impl Engine for OpenscadBinary {
    fn name(&self) -> &str {
        "openscad"
    }

    fn instantiate(&self, log: LogSink) -> Result<Box<dyn EngineInstance>, EngineFault> {
        Ok(Box::new(OpenscadProcess {
            program: self.program.clone(),
            fs: MemoryFs::new(),
            log,
        }))
    }
}

struct OpenscadProcess {
    program: PathBuf,
    fs: MemoryFs,
    log: LogSink,
}

/// Host path for an engine path under `root`
fn host_path(root: &Path, engine_path: &str) -> PathBuf {
    root.join(MemoryFs::normalize(engine_path).trim_start_matches('/'))
}

fn io_fault(context: &str, e: std::io::Error) -> EngineFault {
    EngineFault(format!("{}: {}", context, e))
}

impl OpenscadProcess {
    fn materialize(&self, root: &Path) -> Result<(), EngineFault> {
        for (path, data) in self.fs.entries() {
            let target = host_path(root, path);
            match data {
                None => fs::create_dir_all(&target).map_err(|e| io_fault(path, e))?,
                Some(bytes) => fs::write(&target, bytes).map_err(|e| io_fault(path, e))?,
            }
        }
        Ok(())
    }

    /// Engine paths are absolute; rewrite them into the scratch root
    fn map_args(root: &Path, args: &[String]) -> Vec<String> {
        args.iter()
            .map(|arg| {
                if arg.starts_with('/') {
                    host_path(root, arg).display().to_string()
                } else {
                    arg.clone()
                }
            })
            .collect()
    }

    /// Fonts are registered from the scratch `fonts` dir, not the system
    fn command(&self, root: &Path, args: &[String]) -> Command {
        let mut command = Command::new(&self.program);
        command
            .args(Self::map_args(root, args))
            .current_dir(root)
            .env("OPENSCAD_FONT_PATH", host_path(root, FONTS_DIR))
            .env("FONTCONFIG_FILE", host_path(root, FONTS_CONF_PATH))
            .env("OPENSCADPATH", root);
        command
    }

    fn output_targets(args: &[String]) -> Vec<String> {
        args.windows(2)
            .filter(|pair| pair[0] == "-o")
            .map(|pair| pair[1].clone())
            .collect()
    }
}

impl EngineInstance for OpenscadProcess {
    fn fs(&mut self) -> &mut MemoryFs {
        &mut self.fs
    }

    fn call_main(&mut self, args: &[String]) -> Result<i32, EngineFault> {
        let scratch = tempfile::tempdir().map_err(|e| io_fault("scratch directory", e))?;
        let root = scratch.path();
        self.materialize(root)?;

        let mut command = self.command(root, args);
        debug!(program = %self.program.display(), args = ?command.get_args().collect::<Vec<_>>(), "Spawning OpenSCAD");

        let output = command
            .output()
            .map_err(|e| io_fault(&self.program.display().to_string(), e))?;

        for line in String::from_utf8_lossy(&output.stdout).lines() {
            self.log.out(line);
        }
        for line in String::from_utf8_lossy(&output.stderr).lines() {
            self.log.err(line);
        }

        let code = output
            .status
            .code()
            .ok_or_else(|| EngineFault::new("terminated by signal"))?;

        for target in Self::output_targets(args) {
            if let Ok(bytes) = fs::read(host_path(root, &target)) {
                self.fs.write_file(&target, &bytes)?;
            }
        }

        Ok(code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_args_rewrites_absolute_paths() {
        let root = Path::new("/tmp/scratch");
        let args = vec!["/input.scad".to_string(), "-o".to_string(), "/out.stl".to_string(), "--enable=roof".to_string()];
        let mapped = OpenscadProcess::map_args(root, &args);
        assert_eq!(mapped[0], "/tmp/scratch/input.scad");
        assert_eq!(mapped[1], "-o");
        assert_eq!(mapped[2], "/tmp/scratch/out.stl");
        assert_eq!(mapped[3], "--enable=roof");
    }

    #[test]
    fn test_output_targets() {
        let args = vec!["/in.scad".to_string(), "-o".to_string(), "/out.stl".to_string()];
        assert_eq!(OpenscadProcess::output_targets(&args), vec!["/out.stl"]);
    }

    #[test]
    fn test_materialize_writes_tree() {
        let mut process = OpenscadProcess {
            program: PathBuf::from("openscad"),
            fs: MemoryFs::new(),
            log: LogSink::new(),
        };
        process.fs.mkdir("/fonts").unwrap();
        process.fs.write_file("/fonts/fonts.conf", b"<fontconfig/>").unwrap();
        process.fs.write_file("/input.scad", b"cube();").unwrap();

        let dir = tempfile::tempdir().unwrap();
        process.materialize(dir.path()).unwrap();

        assert_eq!(fs::read(dir.path().join("input.scad")).unwrap(), b"cube();");
        assert!(dir.path().join("fonts/fonts.conf").is_file());
    }

    #[test]
    fn test_command_points_at_scratch_fonts() {
        let process = OpenscadProcess {
            program: PathBuf::from("openscad"),
            fs: MemoryFs::new(),
            log: LogSink::new(),
        };
        let root = Path::new("/tmp/scratch");
        let args = vec!["/input.scad".to_string(), "-o".to_string(), "/out.stl".to_string()];
        let command = process.command(root, &args);

        let env: Vec<(String, String)> = command
            .get_envs()
            .filter_map(|(k, v)| Some((k.to_string_lossy().into_owned(), v?.to_string_lossy().into_owned())))
            .collect();
        assert!(env.contains(&("OPENSCAD_FONT_PATH".to_string(), "/tmp/scratch/fonts".to_string())));
        assert!(env.contains(&("FONTCONFIG_FILE".to_string(), "/tmp/scratch/fonts/fonts.conf".to_string())));
        assert_eq!(command.get_current_dir(), Some(root));
        assert_eq!(command.get_args().next().unwrap(), "/tmp/scratch/input.scad");
    }

    #[test]
    fn test_missing_program_is_fault() {
        let engine = OpenscadBinary::new("/nonexistent/openscad-binary");
        let mut instance = engine.instantiate(LogSink::new()).unwrap();
        instance.fs().write_file("/input.scad", b"cube();").unwrap();

        let args = vec!["/input.scad".to_string(), "-o".to_string(), "/out.stl".to_string()];
        assert!(instance.call_main(&args).is_err());
    }
}
