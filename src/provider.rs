//! Geometry Provider
//!
//! Process-wide state for the interactive surface: busy flags, the running
//! log, and the latest preview mesh. All work is delegated to the
//! dispatcher.

use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::dispatcher::{Dispatcher, JobError};
use crate::protocol::{CompileResult, JobType};
use crate::vfs::VirtualFile;
use crate::worker::{ChannelTransport, Transport};
use crate::wrapper::CompilerWrapper;

pub const OUTPUT_FILE_NAME: &str = "output.stl";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MeshFile {
    pub name: String,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, Default)]
pub struct ProviderState {
    pub is_exporting: bool,
    pub is_rendering: bool,
    /// Append-only until reset
    pub log: Vec<String>,
    pub preview_file: Option<MeshFile>,
}

/// Anything that can turn script text into one exported mesh
pub trait MeshExporter {
    fn exec_export(&self, code: &str) -> Result<Option<MeshFile>, JobError>;
}

pub struct GeometryProvider<T: Transport> {
    dispatcher: Mutex<Dispatcher<T>>,
    state: Mutex<ProviderState>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Clears a busy flag when dropped, including on error paths
struct BusyFlag<'a> {
    state: &'a Mutex<ProviderState>,
    flag: fn(&mut ProviderState) -> &mut bool,
}

impl<'a> BusyFlag<'a> {
    fn raise(state: &'a Mutex<ProviderState>, flag: fn(&mut ProviderState) -> &mut bool) -> Self {
        *flag(&mut lock(state)) = true;
        Self { state, flag }
    }
}

impl Drop for BusyFlag<'_> {
    fn drop(&mut self) {
        *(self.flag)(&mut lock(self.state)) = false;
    }
}

fn exporting(state: &mut ProviderState) -> &mut bool {
    &mut state.is_exporting
}

fn rendering(state: &mut ProviderState) -> &mut bool {
    &mut state.is_rendering
}

impl GeometryProvider<ChannelTransport> {
    pub fn spawn(wrapper: CompilerWrapper) -> Result<Self, JobError> {
        Ok(Self::new(Dispatcher::spawn(wrapper)?))
    }
}

impl<T: Transport> GeometryProvider<T> {
    pub fn new(dispatcher: Dispatcher<T>) -> Self {
        Self {
            dispatcher: Mutex::new(dispatcher),
            state: Mutex::new(ProviderState::default()),
        }
    }

    /// Log lines are kept whether or not the job succeeds
    fn run(&self, job_type: JobType, code: &str) -> Result<CompileResult, JobError> {
        let outcome = lock(&self.dispatcher).compile(job_type, code);
        let log = match &outcome {
            Ok(result) => Some(&result.log),
            Err(err) => err.log(),
        };
        if let Some(log) = log {
            lock(&self.state).log.extend(log.lines().cloned());
        }
        outcome
    }

    pub fn preview(&self, code: &str) -> Result<Option<MeshFile>, JobError> {
        let _busy = BusyFlag::raise(&self.state, rendering);
        let result = self.run(JobType::Preview, code)?;

        let file = result.output.map(|bytes| MeshFile {
            name: OUTPUT_FILE_NAME.to_string(),
            bytes,
        });
        if let Some(file) = &file {
            lock(&self.state).preview_file = Some(file.clone());
        }
        Ok(file)
    }

    pub fn write_file(&self, path: &str, file: VirtualFile) -> Result<(), JobError> {
        lock(&self.dispatcher).write_file(path, file)
    }

    pub fn read_file(&self, path: &str) -> Result<Option<VirtualFile>, JobError> {
        lock(&self.dispatcher).read_file(path)
    }

    pub fn unlink_file(&self, path: &str) -> Result<(), JobError> {
        lock(&self.dispatcher).unlink_file(path)
    }

    pub fn state(&self) -> ProviderState {
        lock(&self.state).clone()
    }

    pub fn is_exporting(&self) -> bool {
        lock(&self.state).is_exporting
    }

    pub fn is_rendering(&self) -> bool {
        lock(&self.state).is_rendering
    }

    pub fn log(&self) -> Vec<String> {
        lock(&self.state).log.clone()
    }

    pub fn preview_file(&self) -> Option<MeshFile> {
        lock(&self.state).preview_file.clone()
    }

    pub fn reset(&self) {
        *lock(&self.state) = ProviderState::default();
    }

    pub fn reset_log(&self) {
        lock(&self.state).log.clear();
    }
}

impl<T: Transport> MeshExporter for GeometryProvider<T> {
    fn exec_export(&self, code: &str) -> Result<Option<MeshFile>, JobError> {
        let _busy = BusyFlag::raise(&self.state, exporting);
        let result = self.run(JobType::Export, code)?;
        Ok(result.output.map(|bytes| MeshFile {
            name: OUTPUT_FILE_NAME.to_string(),
            bytes,
        }))
    }
}
