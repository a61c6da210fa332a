//! Field Descriptors - One Keycap Per Field
//!
//! A layout is an ordered list of fields. Position in the list is the only
//! identity a field has.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

pub const LAYOUT_SCHEMA_VERSION: &str = "1.0.0";

#[derive(Debug, Error)]
pub enum LayoutError {
    #[error("Failed to read layout {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("Failed to write layout {path}: {source}")]
    Write {
        path: String,
        source: std::io::Error,
    },

    #[error("Invalid layout document: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid schema version: {0}")]
    InvalidVersion(String),

    #[error("Layout schema {found} is not supported (supported: {supported})")]
    UnsupportedVersion { found: String, supported: String },

    #[error("Invalid {field} code {code} in legacy layout entry {index}")]
    LegacyCode {
        index: usize,
        field: &'static str,
        code: u8,
    },
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum KeycapKind {
    /// Up to three corner labels
    #[default]
    General,
    /// One rotated label in the middle
    Centered,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum KeycapModel {
    #[default]
    Normal,
    Pit,
    Flat,
}

impl KeycapModel {
    /// Base shape imported by the script for this model
    pub fn shape_path(self) -> &'static str {
        match self {
            KeycapModel::Normal => "Cap_U.stl",
            KeycapModel::Pit => "Cap_O.stl",
            KeycapModel::Flat => "Cap_Flat.stl",
        }
    }

    /// Short tag used in exported filenames
    pub fn tag(self) -> &'static str {
        match self {
            KeycapModel::Normal => "U",
            KeycapModel::Pit => "O",
            KeycapModel::Flat => "F",
        }
    }

    pub fn all() -> [KeycapModel; 3] {
        [KeycapModel::Normal, KeycapModel::Pit, KeycapModel::Flat]
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Field {
    #[serde(default)]
    pub main: String,
    #[serde(default)]
    pub shift: String,
    #[serde(default, rename = "fn")]
    pub fn_label: String,
    #[serde(default)]
    pub center: String,
    #[serde(default)]
    pub angle: i32,
    #[serde(default, rename = "type")]
    pub kind: KeycapKind,
    #[serde(default)]
    pub need_bump: bool,
    #[serde(default)]
    pub model: KeycapModel,
}

impl Field {
    pub fn general(main: &str, shift: &str, fn_label: &str) -> Self {
        Self {
            main: main.to_string(),
            shift: shift.to_string(),
            fn_label: fn_label.to_string(),
            ..Self::default()
        }
    }

    pub fn centered(center: &str, angle: i32) -> Self {
        Self {
            center: center.to_string(),
            angle,
            kind: KeycapKind::Centered,
            ..Self::default()
        }
    }

    pub fn with_model(mut self, model: KeycapModel) -> Self {
        self.model = model;
        self
    }

    pub fn with_bump(mut self, need_bump: bool) -> Self {
        self.need_bump = need_bump;
        self
    }
}

/// Versioned on-disk form of a layout
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LayoutDocument {
    pub schema_version: String,
    pub fields: Vec<Field>,
}

impl LayoutDocument {
    pub fn new(fields: Vec<Field>) -> Self {
        Self {
            schema_version: LAYOUT_SCHEMA_VERSION.to_string(),
            fields,
        }
    }
}

/// Editor export format: a bare array with numeric enum codes
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LegacyField {
    #[serde(default)]
    main: String,
    #[serde(default)]
    shift: String,
    #[serde(default, rename = "fn")]
    fn_label: String,
    #[serde(default)]
    center: String,
    #[serde(default)]
    angle: i32,
    #[serde(default, rename = "type")]
    kind: u8,
    #[serde(default)]
    need_bump: bool,
    #[serde(default)]
    model: u8,
}

impl LegacyField {
    fn upgrade(self, index: usize) -> Result<Field, LayoutError> {
        let kind = match self.kind {
            0 => KeycapKind::General,
            1 => KeycapKind::Centered,
            code => return Err(LayoutError::LegacyCode { index, field: "type", code }),
        };
        let model = match self.model {
            0 => KeycapModel::Normal,
            1 => KeycapModel::Pit,
            2 => KeycapModel::Flat,
            code => return Err(LayoutError::LegacyCode { index, field: "model", code }),
        };
        Ok(Field {
            main: self.main,
            shift: self.shift,
            fn_label: self.fn_label,
            center: self.center,
            angle: self.angle,
            kind,
            need_bump: self.need_bump,
            model,
        })
    }
}

/// Parse a layout from text, accepting the versioned and the legacy form
pub fn parse_layout(text: &str) -> Result<LayoutDocument, LayoutError> {
    let value: serde_json::Value = serde_json::from_str(text)?;

    if value.is_array() {
        let legacy: Vec<LegacyField> = serde_json::from_value(value)?;
        let fields = legacy
            .into_iter()
            .enumerate()
            .map(|(index, field)| field.upgrade(index))
            .collect::<Result<Vec<_>, _>>()?;
        return Ok(LayoutDocument::new(fields));
    }

    let document: LayoutDocument = serde_json::from_value(value)?;
    check_schema_version(&document.schema_version)?;
    Ok(document)
}

fn check_schema_version(found: &str) -> Result<(), LayoutError> {
    let found_ver = semver::Version::parse(found)
        .map_err(|e| LayoutError::InvalidVersion(format!("{}: {}", found, e)))?;
    let supported = semver::Version::parse(LAYOUT_SCHEMA_VERSION)
        .map_err(|e| LayoutError::InvalidVersion(e.to_string()))?;

    if found_ver.major != supported.major || found_ver > supported {
        return Err(LayoutError::UnsupportedVersion {
            found: found.to_string(),
            supported: LAYOUT_SCHEMA_VERSION.to_string(),
        });
    }
    Ok(())
}

pub fn load_layout(path: &Path) -> Result<LayoutDocument, LayoutError> {
    let text = fs::read_to_string(path).map_err(|source| LayoutError::Read {
        path: path.display().to_string(),
        source,
    })?;
    parse_layout(&text)
}

/// Always writes the versioned form
pub fn save_layout(path: &Path, fields: &[Field]) -> Result<(), LayoutError> {
    let document = LayoutDocument::new(fields.to_vec());
    let text = serde_json::to_string_pretty(&document)?;
    fs::write(path, text).map_err(|source| LayoutError::Write {
        path: path.display().to_string(),
        source,
    })
}
