//! Job Dispatcher
//!
//! Sends one request across the boundary and waits for the response that
//! carries the same id. `submit` takes `&mut self`, so a dispatcher never
//! has more than one job in flight.

use thiserror::Error;
use tracing::{debug, warn};

use crate::protocol::{
    self, CompileLog, CompileResult, JobId, JobMessage, JobResponse, JobType, ResponseData, TransportError,
};
use crate::vfs::VirtualFile;
use crate::worker::{spawn_worker, ChannelTransport, Transport, WorkerHandle};
use crate::wrapper::CompilerWrapper;

#[derive(Debug, Clone, Error)]
pub enum JobError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Job {id} failed: {message}")]
    Dispatch {
        id: JobId,
        message: String,
        /// Empty unless the job was a compile
        log: CompileLog,
    },

    #[error("Job {id} returned an unexpected {job_type} response")]
    UnexpectedResponse { id: JobId, job_type: JobType },
}

impl JobError {
    /// Engine output captured before the failure, if any
    pub fn log(&self) -> Option<&CompileLog> {
        match self {
            JobError::Dispatch { log, .. } => Some(log),
            _ => None,
        }
    }
}

pub struct Dispatcher<T: Transport> {
    transport: T,
    worker: Option<WorkerHandle>,
    next_id: u64,
    discarded: usize,
}

impl Dispatcher<ChannelTransport> {
    /// Start a worker thread for `wrapper` and connect to it
    pub fn spawn(wrapper: CompilerWrapper) -> Result<Self, TransportError> {
        let (transport, worker) = spawn_worker(wrapper)?;
        let mut dispatcher = Self::new(transport);
        dispatcher.worker = Some(worker);
        Ok(dispatcher)
    }
}

impl<T: Transport> Dispatcher<T> {
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            worker: None,
            next_id: 1,
            discarded: 0,
        }
    }

    /// Responses dropped because their id matched no pending job
    pub fn discarded(&self) -> usize {
        self.discarded
    }

    fn allocate_id(&mut self) -> JobId {
        let id = JobId::Number(self.next_id);
        self.next_id += 1;
        id
    }

    /// Send `message` and wait for its correlated response.
    ///
    /// A message without an id gets one. Responses for other ids are
    /// discarded; an `err` in the matching response becomes
    /// [`JobError::Dispatch`]. No retries.
    pub fn submit(&mut self, mut message: JobMessage) -> Result<JobResponse, JobError> {
        let id = match message.id.clone() {
            Some(id) => id,
            None => {
                let id = self.allocate_id();
                message.id = Some(id.clone());
                id
            }
        };

        debug!(job_id = %id, job_type = %message.job_type, "Submitting job");
        self.transport.send(protocol::encode(&message)?)?;

        loop {
            let frame = self.transport.recv()?;
            let response: JobResponse = protocol::decode(&frame)?;

            if response.id.as_ref() != Some(&id) {
                self.discarded += 1;
                warn!(
                    expected = %id,
                    received = ?response.id,
                    "Discarding response for another job"
                );
                continue;
            }

            if let Some(message) = response.err {
                return Err(JobError::Dispatch {
                    id,
                    message,
                    log: response.log.unwrap_or_default(),
                });
            }
            return Ok(response);
        }
    }

    pub fn compile(&mut self, job_type: JobType, code: &str) -> Result<CompileResult, JobError> {
        let response = self.submit(JobMessage::compile(job_type, code))?;
        match response.data {
            Some(ResponseData::Compile(result)) => Ok(result),
            _ => Err(unexpected(response.id, job_type)),
        }
    }

    pub fn write_file(&mut self, path: &str, file: VirtualFile) -> Result<(), JobError> {
        self.submit(JobMessage::fs_write(path, file)).map(|_| ())
    }

    pub fn read_file(&mut self, path: &str) -> Result<Option<VirtualFile>, JobError> {
        let response = self.submit(JobMessage::fs_read(path))?;
        match response.data {
            Some(ResponseData::Fs(payload)) => Ok(payload.content),
            _ => Err(unexpected(response.id, JobType::FsRead)),
        }
    }

    pub fn unlink_file(&mut self, path: &str) -> Result<(), JobError> {
        self.submit(JobMessage::fs_unlink(path)).map(|_| ())
    }

    /// Close the boundary and wait for the worker, if this dispatcher owns one
    pub fn shutdown(self) -> Result<(), TransportError> {
        let Dispatcher { transport, worker, .. } = self;
        drop(transport);
        match worker {
            Some(worker) => worker.join(),
            None => Ok(()),
        }
    }
}

fn unexpected(id: Option<JobId>, job_type: JobType) -> JobError {
    JobError::UnexpectedResponse {
        id: id.unwrap_or(JobId::Number(0)),
        job_type,
    }
}
