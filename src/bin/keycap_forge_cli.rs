//! Keycap Forge CLI
//!
//! Commands: export, preview, layout-check
//! Outputs JSON to stdout, logs to stderr
//! Returns 1 on usage/config errors, 2 on compile/export failure

use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::info;

use keycap_forge::{
    field::load_layout,
    hashing::compute_layout_hash,
    logging::init_logging,
    worker::ChannelTransport,
    AssetSource, BatchExporter, CompilerWrapper, DirAssetSource, ExportSummary, ForgeConfig,
    GeometryProvider, OpenscadBinary, VirtualFile,
};

#[derive(Parser)]
#[command(name = "keycap-forge")]
#[command(about = "Keycap Forge - batch compiler for parametric keycap meshes")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to the JSON config file
    #[arg(short, long, default_value = "keycap-forge.json")]
    config: PathBuf,

    /// Directory holding the font, base shapes and script template
    #[arg(short, long)]
    assets_dir: Option<PathBuf>,

    /// OpenSCAD executable
    #[arg(long)]
    openscad: Option<PathBuf>,

    /// trace, debug, info, warn or error
    #[arg(long)]
    log_level: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Compile every field of a layout
    Export {
        /// Layout file (versioned or legacy array)
        #[arg(short, long)]
        layout: PathBuf,

        /// Output file or directory
        #[arg(short, long)]
        out: Option<PathBuf>,

        /// Extra files made visible to the engine
        #[arg(short, long)]
        include: Vec<PathBuf>,
    },

    /// Render one script with the preview profile
    Preview {
        /// Script file
        #[arg(short, long)]
        scad: PathBuf,

        /// Where to write the preview mesh
        #[arg(short, long)]
        out: Option<PathBuf>,

        /// Extra files made visible to the engine
        #[arg(short, long)]
        include: Vec<PathBuf>,
    },

    /// Load a layout and report its shape
    LayoutCheck {
        #[arg(short, long)]
        layout: PathBuf,
    },
}

fn emit(value: &Value) {
    println!("{:#}", value);
}

fn fail(code: u8, error: impl std::fmt::Display) -> ExitCode {
    emit(&json!({ "success": false, "error": error.to_string() }));
    ExitCode::from(code)
}

fn start_provider(config: &ForgeConfig, source: Arc<dyn AssetSource>) -> Result<GeometryProvider<ChannelTransport>, String> {
    let engine = OpenscadBinary::new(&config.openscad_binary);
    let wrapper = CompilerWrapper::new(Box::new(engine), source);
    GeometryProvider::spawn(wrapper).map_err(|e| e.to_string())
}

fn include_files(provider: &GeometryProvider<ChannelTransport>, paths: &[PathBuf]) -> Result<(), String> {
    for path in paths {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .ok_or_else(|| format!("Not a file: {}", path.display()))?;
        let bytes = fs::read(path).map_err(|e| format!("Failed to read {}: {}", path.display(), e))?;
        provider
            .write_file(&name, VirtualFile::new(name.as_str(), name.as_str(), bytes))
            .map_err(|e| e.to_string())?;
    }
    Ok(())
}

/// `out` may name a directory, a file, or nothing (current directory)
fn resolve_output(out: Option<&Path>, file_name: &str) -> PathBuf {
    match out {
        Some(path) if path.is_dir() => path.join(file_name),
        Some(path) => path.to_path_buf(),
        None => PathBuf::from(file_name),
    }
}

fn run_export(config: &ForgeConfig, layout: &Path, out: Option<&Path>, include: &[PathBuf]) -> ExitCode {
    let document = match load_layout(layout) {
        Ok(d) => d,
        Err(e) => return fail(1, e),
    };

    let source: Arc<dyn AssetSource> = Arc::new(DirAssetSource::new(&config.assets_dir));
    let provider = match start_provider(config, Arc::clone(&source)) {
        Ok(p) => p,
        Err(e) => return fail(1, e),
    };
    if let Err(e) = include_files(&provider, include) {
        return fail(1, e);
    }

    let batch = BatchExporter::new(source, config.export_options());
    let result = batch.export_all(&provider, &document.fields, |progress| {
        info!(
            completed = progress.completed,
            total = progress.total,
            percent = progress.percent(),
            "Export progress"
        );
    });

    let output = match result {
        Ok(output) => output,
        Err(e) => {
            emit(&json!({
                "success": false,
                "error": e.to_string(),
                "log": provider.log(),
            }));
            return ExitCode::from(2);
        }
    };

    let path = resolve_output(out, output.file_name());
    if let Err(e) = fs::write(&path, output.bytes()) {
        return fail(1, format!("Failed to write {}: {}", path.display(), e));
    }

    let summary = match ExportSummary::new(&document.fields, &output) {
        Ok(s) => s,
        Err(e) => return fail(1, e),
    };
    emit(&json!({
        "success": true,
        "path": path.display().to_string(),
        "summary": summary,
    }));
    ExitCode::SUCCESS
}

fn run_preview(config: &ForgeConfig, scad: &Path, out: Option<&Path>, include: &[PathBuf]) -> ExitCode {
    let code = match fs::read_to_string(scad) {
        Ok(c) => c,
        Err(e) => return fail(1, format!("Failed to read {}: {}", scad.display(), e)),
    };

    let source: Arc<dyn AssetSource> = Arc::new(DirAssetSource::new(&config.assets_dir));
    let provider = match start_provider(config, source) {
        Ok(p) => p,
        Err(e) => return fail(1, e),
    };
    if let Err(e) = include_files(&provider, include) {
        return fail(1, e);
    }

    let mesh = match provider.preview(&code) {
        Ok(mesh) => mesh,
        Err(e) => {
            emit(&json!({ "success": false, "error": e.to_string(), "log": provider.log() }));
            return ExitCode::from(2);
        }
    };

    let Some(mesh) = mesh else {
        emit(&json!({ "success": false, "log": provider.log() }));
        return ExitCode::from(2);
    };

    let path = resolve_output(out, &mesh.name);
    if let Err(e) = fs::write(&path, &mesh.bytes) {
        return fail(1, format!("Failed to write {}: {}", path.display(), e));
    }
    emit(&json!({
        "success": true,
        "path": path.display().to_string(),
        "bytes": mesh.bytes.len(),
        "log": provider.log(),
    }));
    ExitCode::SUCCESS
}

fn run_layout_check(layout: &Path) -> ExitCode {
    let document = match load_layout(layout) {
        Ok(d) => d,
        Err(e) => return fail(1, e),
    };
    let hash = match compute_layout_hash(&document.fields) {
        Ok(h) => h,
        Err(e) => return fail(1, e),
    };
    emit(&json!({
        "success": true,
        "schemaVersion": document.schema_version,
        "fields": document.fields.len(),
        "layoutHash": hash,
    }));
    ExitCode::SUCCESS
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let mut config = match ForgeConfig::load(&cli.config) {
        Ok(c) => c,
        Err(e) => return fail(1, e),
    };
    if let Some(dir) = cli.assets_dir {
        config.assets_dir = dir;
    }
    if let Some(bin) = cli.openscad {
        config.openscad_binary = bin;
    }
    if let Some(level) = cli.log_level {
        config.log_level = level;
    }

    if let Err(e) = init_logging(&config.log_level) {
        return fail(1, e);
    }

    match cli.command {
        Commands::Export { layout, out, include } => run_export(&config, &layout, out.as_deref(), &include),
        Commands::Preview { scad, out, include } => run_preview(&config, &scad, out.as_deref(), &include),
        Commands::LayoutCheck { layout } => run_layout_check(&layout),
    }
}
