//! Keycap Forge Core - Batch Keycap Mesh Compiler
//!
//! # Guarantees
//! 1. One fresh engine instance per job
//! 2. Static assets load once per process
//! 3. Virtual files persist across jobs until unlinked
//! 4. One job in flight per dispatcher
//! 5. Artifacts come out in field order

pub mod field;
pub mod templating;
pub mod vfs;
pub mod assets;
pub mod engine;
pub mod openscad;
pub mod wrapper;
pub mod protocol;
pub mod worker;
pub mod dispatcher;
pub mod provider;
pub mod pipeline;
pub mod hashing;
pub mod config;
pub mod logging;

pub use field::{Field, KeycapKind, KeycapModel, LayoutDocument};
pub use vfs::{VirtualFile, VirtualFileStore};
pub use assets::{AssetFetchError, AssetSource, DirAssetSource};
pub use engine::{Engine, EngineInstance, ScriptedEngine};
pub use openscad::OpenscadBinary;
pub use wrapper::{CompilerWrapper, EngineError};
pub use protocol::{CompileResult, JobMessage, JobResponse, JobType, TransportError};
pub use dispatcher::{Dispatcher, JobError};
pub use provider::{GeometryProvider, MeshExporter, MeshFile};
pub use pipeline::{BatchExporter, ExportError, ExportOutput, ExportSummary, Progress};
pub use config::ForgeConfig;

pub const ENGINE_VERSION: &str = env!("CARGO_PKG_VERSION");
