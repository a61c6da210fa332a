//! Execution Context
//!
//! The compiler wrapper lives on its own thread and talks to callers only
//! through text frames. It handles one job at a time, in arrival order.

use std::sync::mpsc::{channel, Receiver, Sender};
use std::thread::{self, JoinHandle};

use tracing::{debug, info, warn};

use crate::protocol::{self, JobMessage, JobPayload, JobResponse, JobType, ResponseData, TransportError};
use crate::wrapper::CompilerWrapper;

/// Duplex frame channel across the execution boundary
pub trait Transport: Send {
    fn send(&self, frame: String) -> Result<(), TransportError>;

    /// Blocks until a frame arrives or the peer goes away
    fn recv(&self) -> Result<String, TransportError>;
}

pub struct ChannelTransport {
    tx: Sender<String>,
    rx: Receiver<String>,
}

/// Two connected ends
pub fn channel_pair() -> (ChannelTransport, ChannelTransport) {
    let (a_tx, b_rx) = channel();
    let (b_tx, a_rx) = channel();
    (
        ChannelTransport { tx: a_tx, rx: a_rx },
        ChannelTransport { tx: b_tx, rx: b_rx },
    )
}

impl Transport for ChannelTransport {
    fn send(&self, frame: String) -> Result<(), TransportError> {
        self.tx.send(frame).map_err(|_| TransportError::Disconnected)
    }

    fn recv(&self) -> Result<String, TransportError> {
        self.rx.recv().map_err(|_| TransportError::Disconnected)
    }
}

pub struct WorkerHandle {
    handle: JoinHandle<()>,
}

impl WorkerHandle {
    /// Wait for the worker to exit; it does so once its peer is dropped
    pub fn join(self) -> Result<(), TransportError> {
        self.handle
            .join()
            .map_err(|_| TransportError::Unavailable("worker thread panicked".to_string()))
    }
}

/// Start the execution context on a dedicated thread
pub fn spawn_worker(wrapper: CompilerWrapper) -> Result<(ChannelTransport, WorkerHandle), TransportError> {
    let (caller_end, worker_end) = channel_pair();
    let handle = thread::Builder::new()
        .name("keycap-engine".to_string())
        .spawn(move || serve(&worker_end, wrapper))
        .map_err(|e| TransportError::Unavailable(e.to_string()))?;

    Ok((caller_end, WorkerHandle { handle }))
}

/// Answer frames until the transport closes
pub fn serve<T: Transport + ?Sized>(transport: &T, mut wrapper: CompilerWrapper) {
    info!("Execution context started");
    loop {
        let frame = match transport.recv() {
            Ok(frame) => frame,
            Err(_) => break,
        };

        let response = match protocol::decode::<JobMessage>(&frame) {
            Ok(message) => handle_message(&mut wrapper, message),
            Err(e) => {
                warn!(error = %e, "Rejecting malformed job frame");
                reject_malformed(&frame, &e)
            }
        };

        let reply = match protocol::encode(&response) {
            Ok(reply) => reply,
            Err(e) => {
                warn!(error = %e, "Failed to encode job response");
                continue;
            }
        };
        if transport.send(reply).is_err() {
            break;
        }
    }
    info!("Execution context stopped");
}

/// Best effort: echo whatever id and type the frame carried
fn reject_malformed(frame: &str, error: &TransportError) -> JobResponse {
    let raw: serde_json::Value = serde_json::from_str(frame).unwrap_or_default();
    let id = raw.get("id").cloned().and_then(|v| serde_json::from_value(v).ok());
    let job_type = raw
        .get("type")
        .cloned()
        .and_then(|v| serde_json::from_value(v).ok())
        .unwrap_or(JobType::Export);
    JobResponse::failed(id, job_type, error.to_string())
}

/// Run one job and build exactly one response for it
pub fn handle_message(wrapper: &mut CompilerWrapper, message: JobMessage) -> JobResponse {
    let id = message.id.clone();
    let job_type = message.job_type;
    debug!(job_id = ?id, job_type = %job_type, "Handling job");

    match run_job(wrapper, job_type, message.data) {
        Ok(data) => JobResponse::ok(id, job_type, data),
        Err(err) => {
            warn!(job_id = ?id, job_type = %job_type, error = %err, "Job failed");
            let response = JobResponse::failed(id, job_type, err);
            if job_type.is_compile() {
                response.with_log(wrapper.last_log())
            } else {
                response
            }
        }
    }
}

fn run_job(wrapper: &mut CompilerWrapper, job_type: JobType, data: JobPayload) -> Result<ResponseData, String> {
    match (job_type, data) {
        (JobType::Preview, JobPayload::Compile(payload)) => wrapper
            .preview(&payload.code)
            .map(ResponseData::Compile)
            .map_err(|e| e.to_string()),
        (JobType::Export, JobPayload::Compile(payload)) => wrapper
            .export_file(&payload.code)
            .map(ResponseData::Compile)
            .map_err(|e| e.to_string()),
        (JobType::FsRead, JobPayload::Fs(payload)) => Ok(ResponseData::Fs(wrapper.read_file(&payload.path))),
        (JobType::FsWrite, JobPayload::Fs(payload)) => match payload.content {
            Some(file) => {
                wrapper.write_file(&payload.path, file);
                Ok(ResponseData::Ack(true))
            }
            None => Err(format!("{} requires content", job_type)),
        },
        (JobType::FsUnlink, JobPayload::Fs(payload)) => {
            wrapper.unlink_file(&payload.path);
            Ok(ResponseData::Ack(true))
        }
        (job_type, _) => Err(format!("Payload does not match job type {}", job_type)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assets::{AssetCache, AssetSource, MemoryAssetSource, FONT_ASSET};
    use crate::engine::ScriptedEngine;
    use crate::protocol::{CompilePayload, JobId};
    use crate::vfs::VirtualFile;
    use std::sync::Arc;

    static CACHE: AssetCache = AssetCache::new();

    fn wrapper() -> CompilerWrapper {
        let source: Arc<dyn AssetSource> = Arc::new(
            MemoryAssetSource::new()
                .with(FONT_ASSET, b"f".to_vec())
                .with("Cap_U.stl", b"u".to_vec())
                .with("Cap_O.stl", b"o".to_vec())
                .with("Cap_Flat.stl", b"x".to_vec()),
        );
        let engine = ScriptedEngine::new(|fs, args, _| {
            let code = fs.read_file(&args[0])?;
            fs.write_file(&args[2], &code)?;
            Ok(0)
        });
        CompilerWrapper::with_cache(Box::new(engine), source, &CACHE)
    }

    #[test]
    fn test_response_echoes_id_and_type() {
        let mut w = wrapper();
        let msg = JobMessage::preview("cube();").with_id(JobId::Number(3));
        let response = handle_message(&mut w, msg);

        assert_eq!(response.id, Some(JobId::Number(3)));
        assert_eq!(response.job_type, JobType::Preview);
        assert!(response.err.is_none());
    }

    #[test]
    fn test_mismatched_payload_rejected() {
        let mut w = wrapper();
        let msg = JobMessage {
            id: Some(JobId::Number(1)),
            job_type: JobType::FsRead,
            data: JobPayload::Compile(CompilePayload { code: "x".into() }),
        };
        let response = handle_message(&mut w, msg);
        assert!(response.err.unwrap().contains("fs.read"));
    }

    #[test]
    fn test_engine_fault_keeps_log() {
        let source: Arc<dyn AssetSource> = Arc::new(
            MemoryAssetSource::new()
                .with(FONT_ASSET, b"f".to_vec())
                .with("Cap_U.stl", b"u".to_vec())
                .with("Cap_O.stl", b"o".to_vec())
                .with("Cap_Flat.stl", b"x".to_vec()),
        );
        let engine = ScriptedEngine::new(|_, _, log| {
            log.err("WARNING: about to crash");
            Err(crate::engine::EngineFault::new("boom"))
        });
        let mut w = CompilerWrapper::with_cache(Box::new(engine), source, &CACHE);

        let response = handle_message(&mut w, JobMessage::export("cube();"));
        assert!(response.err.is_some());
        assert_eq!(response.log.unwrap().std_err, vec!["WARNING: about to crash"]);

        let response = handle_message(&mut w, JobMessage::fs_unlink("missing"));
        assert!(response.log.is_none());
    }

    #[test]
    fn test_write_without_content_rejected() {
        let mut w = wrapper();
        let response = handle_message(&mut w, JobMessage::fs_unlink("a"));
        assert!(response.err.is_none());

        let mut msg = JobMessage::fs_write("a", VirtualFile::new("a", "a", vec![1]));
        if let JobPayload::Fs(payload) = &mut msg.data {
            payload.content = None;
        }
        let response = handle_message(&mut w, msg);
        assert!(response.err.is_some());
    }

    #[test]
    fn test_serve_over_channel() {
        let (caller, handle) = spawn_worker(wrapper()).unwrap();

        let frame = protocol::encode(&JobMessage::export("abc").with_id(JobId::Text("j1".into()))).unwrap();
        caller.send(frame).unwrap();
        let response: JobResponse = protocol::decode(&caller.recv().unwrap()).unwrap();
        assert_eq!(response.id, Some(JobId::Text("j1".into())));

        caller.send("garbage".to_string()).unwrap();
        let response: JobResponse = protocol::decode(&caller.recv().unwrap()).unwrap();
        assert!(response.err.unwrap().starts_with("Malformed frame"));

        drop(caller);
        handle.join().unwrap();
    }
}
