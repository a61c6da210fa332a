//! Batch Export Pipeline
//!
//! One export job per field, strictly in list order: field `i + 1` is not
//! submitted until field `i` has produced its mesh. One artifact is
//! emitted as-is; two or more are bundled into a zip archive.

use std::collections::HashSet;
use std::io::{Cursor, Write};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::assets::{AssetFetchError, AssetSource, TemplateCache, DEFAULT_TEMPLATE_NAME, SCRIPT_TEMPLATE};
use crate::dispatcher::JobError;
use crate::field::Field;
use crate::hashing::{compute_layout_hash, sha256_hex};
use crate::provider::MeshExporter;
use crate::templating::{artifact_filename, render_field_script};

pub const DEFAULT_ARCHIVE_NAME: &str = "keycaps.zip";

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("No fields to export")]
    EmptyBatch,

    #[error("Script template unavailable: {0}")]
    TemplateFetch(#[from] AssetFetchError),

    #[error("Field {index} failed after {completed} exported: {source}")]
    Job {
        index: usize,
        completed: usize,
        #[source]
        source: JobError,
    },

    #[error("Field {index} produced no mesh after {completed} exported")]
    MissingOutput { index: usize, completed: usize },

    #[error("Archive error: {0}")]
    Archive(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportedArtifact {
    pub name: String,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExportOutput {
    Single(ExportedArtifact),
    Archive {
        name: String,
        bytes: Vec<u8>,
        entries: Vec<ExportedArtifact>,
    },
}

impl ExportOutput {
    pub fn file_name(&self) -> &str {
        match self {
            ExportOutput::Single(artifact) => &artifact.name,
            ExportOutput::Archive { name, .. } => name,
        }
    }

    pub fn bytes(&self) -> &[u8] {
        match self {
            ExportOutput::Single(artifact) => &artifact.bytes,
            ExportOutput::Archive { bytes, .. } => bytes,
        }
    }

    pub fn entries(&self) -> &[ExportedArtifact] {
        match self {
            ExportOutput::Single(artifact) => std::slice::from_ref(artifact),
            ExportOutput::Archive { entries, .. } => entries,
        }
    }

    pub fn is_archive(&self) -> bool {
        matches!(self, ExportOutput::Archive { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    pub completed: usize,
    pub total: usize,
}

impl Progress {
    pub fn fraction(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        self.completed as f64 / self.total as f64
    }

    pub fn percent(&self) -> u32 {
        (self.fraction() * 100.0).round() as u32
    }
}

#[derive(Debug, Clone)]
pub struct ExportOptions {
    pub template_name: String,
    pub archive_name: String,
}

impl Default for ExportOptions {
    fn default() -> Self {
        Self {
            template_name: DEFAULT_TEMPLATE_NAME.to_string(),
            archive_name: DEFAULT_ARCHIVE_NAME.to_string(),
        }
    }
}

pub struct BatchExporter {
    source: Arc<dyn AssetSource>,
    options: ExportOptions,
    template_cache: &'static TemplateCache,
}

impl BatchExporter {
    pub fn new(source: Arc<dyn AssetSource>, options: ExportOptions) -> Self {
        Self::with_cache(source, options, &SCRIPT_TEMPLATE)
    }

    pub fn with_cache(source: Arc<dyn AssetSource>, options: ExportOptions, template_cache: &'static TemplateCache) -> Self {
        Self {
            source,
            options,
            template_cache,
        }
    }

    /// Export every field in order, reporting `(i + 1) / n` after each.
    ///
    /// The first failing field aborts the batch; artifacts already produced
    /// are discarded.
    pub fn export_all<E, P>(&self, exporter: &E, fields: &[Field], mut on_progress: P) -> Result<ExportOutput, ExportError>
    where
        E: MeshExporter + ?Sized,
        P: FnMut(Progress),
    {
        if fields.is_empty() {
            return Err(ExportError::EmptyBatch);
        }

        let template = self
            .template_cache
            .get_or_fetch(self.source.as_ref(), &self.options.template_name)?;

        let start = Instant::now();
        let total = fields.len();
        let mut artifacts = Vec::with_capacity(total);

        for (index, field) in fields.iter().enumerate() {
            let code = render_field_script(&template, field);
            let name = artifact_filename(field);
            debug!(index, name = %name, "Exporting field");

            let mesh = match exporter.exec_export(&code) {
                Ok(Some(mesh)) => mesh,
                Ok(None) => {
                    warn!(index, name = %name, "Field produced no mesh");
                    return Err(ExportError::MissingOutput {
                        index,
                        completed: artifacts.len(),
                    });
                }
                Err(source) => {
                    warn!(index, name = %name, error = %source, "Field export failed");
                    return Err(ExportError::Job {
                        index,
                        completed: artifacts.len(),
                        source,
                    });
                }
            };

            artifacts.push(ExportedArtifact { name, bytes: mesh.bytes });
            on_progress(Progress {
                completed: index + 1,
                total,
            });
        }

        info!(
            count = artifacts.len(),
            duration_ms = start.elapsed().as_millis() as u64,
            "Batch export completed"
        );
        package(artifacts, &self.options.archive_name)
    }
}

/// One artifact passes through; anything else becomes an archive
pub fn package(artifacts: Vec<ExportedArtifact>, archive_name: &str) -> Result<ExportOutput, ExportError> {
    match <[ExportedArtifact; 1]>::try_from(artifacts) {
        Ok([only]) => Ok(ExportOutput::Single(only)),
        Err(artifacts) => {
            let entries = dedupe_names(artifacts);
            let bytes = build_archive(&entries)?;
            Ok(ExportOutput::Archive {
                name: archive_name.to_string(),
                bytes,
                entries,
            })
        }
    }
}

/// Suffix repeated names with `_2`, `_3`, ... before the extension
fn dedupe_names(artifacts: Vec<ExportedArtifact>) -> Vec<ExportedArtifact> {
    let mut seen = HashSet::new();
    artifacts
        .into_iter()
        .map(|mut artifact| {
            if !seen.contains(&artifact.name) {
                seen.insert(artifact.name.clone());
                return artifact;
            }

            let (stem, ext) = match artifact.name.rfind('.') {
                Some(idx) => (artifact.name[..idx].to_string(), artifact.name[idx..].to_string()),
                None => (artifact.name.clone(), String::new()),
            };
            let mut n = 2;
            let mut candidate = format!("{}_{}{}", stem, n, ext);
            while seen.contains(&candidate) {
                n += 1;
                candidate = format!("{}_{}{}", stem, n, ext);
            }
            seen.insert(candidate.clone());
            artifact.name = candidate;
            artifact
        })
        .collect()
}

fn archive_error(e: impl std::fmt::Display) -> ExportError {
    ExportError::Archive(e.to_string())
}

pub fn build_archive(entries: &[ExportedArtifact]) -> Result<Vec<u8>, ExportError> {
    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
    let options = FileOptions::default().compression_method(CompressionMethod::Deflated);

    for entry in entries {
        writer.start_file(entry.name.as_str(), options).map_err(archive_error)?;
        writer.write_all(&entry.bytes).map_err(archive_error)?;
    }

    let cursor = writer.finish().map_err(archive_error)?;
    Ok(cursor.into_inner())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactDigest {
    pub name: String,
    pub size: usize,
    pub sha256: String,
}

impl ArtifactDigest {
    fn of(name: &str, bytes: &[u8]) -> Self {
        Self {
            name: name.to_string(),
            size: bytes.len(),
            sha256: sha256_hex(bytes),
        }
    }
}

/// Machine-readable record of one export run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportSummary {
    pub batch_id: String,
    pub created_at: DateTime<Utc>,
    pub layout_hash: String,
    pub output: ArtifactDigest,
    pub entries: Vec<ArtifactDigest>,
}

impl ExportSummary {
    pub fn new(fields: &[Field], output: &ExportOutput) -> Result<Self, serde_json::Error> {
        Ok(Self {
            batch_id: Uuid::new_v4().to_string(),
            created_at: Utc::now(),
            layout_hash: compute_layout_hash(fields)?,
            output: ArtifactDigest::of(output.file_name(), output.bytes()),
            entries: output
                .entries()
                .iter()
                .map(|e| ArtifactDigest::of(&e.name, &e.bytes))
                .collect(),
        })
    }
}
