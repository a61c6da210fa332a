//! Job Message Protocol
//!
//! Requests and responses cross the execution boundary as JSON text
//! frames. Byte payloads travel base64-encoded. A response echoes the
//! request's `type` and `id`; a present `err` marks failure.

use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::vfs::VirtualFile;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("Execution context disconnected")]
    Disconnected,

    #[error("Execution context unavailable: {0}")]
    Unavailable(String),

    #[error("Malformed frame: {0}")]
    Malformed(String),
}

/// Base64 serde adapter for byte buffers
pub mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        STANDARD.decode(text).map_err(serde::de::Error::custom)
    }

    pub mod option {
        use super::*;

        pub fn serialize<S: Serializer>(bytes: &Option<Vec<u8>>, serializer: S) -> Result<S::Ok, S::Error> {
            match bytes {
                Some(bytes) => serializer.serialize_some(&STANDARD.encode(bytes)),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Vec<u8>>, D::Error> {
            let text = Option::<String>::deserialize(deserializer)?;
            text.map(|t| STANDARD.decode(t).map_err(serde::de::Error::custom))
                .transpose()
        }
    }
}

/// Correlation token; the boundary accepts text or numbers
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum JobId {
    Number(u64),
    Text(String),
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobId::Number(n) => write!(f, "{}", n),
            JobId::Text(s) => f.write_str(s),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobType {
    #[serde(rename = "preview")]
    Preview,
    #[serde(rename = "export")]
    Export,
    #[serde(rename = "fs.read")]
    FsRead,
    #[serde(rename = "fs.write")]
    FsWrite,
    #[serde(rename = "fs.unlink")]
    FsUnlink,
}

impl JobType {
    pub fn as_str(self) -> &'static str {
        match self {
            JobType::Preview => "preview",
            JobType::Export => "export",
            JobType::FsRead => "fs.read",
            JobType::FsWrite => "fs.write",
            JobType::FsUnlink => "fs.unlink",
        }
    }

    pub fn is_compile(self) -> bool {
        matches!(self, JobType::Preview | JobType::Export)
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompilePayload {
    pub code: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FsPayload {
    pub path: String,
    /// Only meaningful for writes and read results
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<VirtualFile>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum JobPayload {
    Compile(CompilePayload),
    Fs(FsPayload),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<JobId>,
    #[serde(rename = "type")]
    pub job_type: JobType,
    pub data: JobPayload,
}

impl JobMessage {
    pub fn compile(job_type: JobType, code: &str) -> Self {
        Self {
            id: None,
            job_type,
            data: JobPayload::Compile(CompilePayload { code: code.to_string() }),
        }
    }

    pub fn preview(code: &str) -> Self {
        Self::compile(JobType::Preview, code)
    }

    pub fn export(code: &str) -> Self {
        Self::compile(JobType::Export, code)
    }

    fn fs(job_type: JobType, path: &str, content: Option<VirtualFile>) -> Self {
        Self {
            id: None,
            job_type,
            data: JobPayload::Fs(FsPayload {
                path: path.to_string(),
                content,
            }),
        }
    }

    pub fn fs_read(path: &str) -> Self {
        Self::fs(JobType::FsRead, path, None)
    }

    pub fn fs_write(path: &str, file: VirtualFile) -> Self {
        Self::fs(JobType::FsWrite, path, Some(file))
    }

    pub fn fs_unlink(path: &str) -> Self {
        Self::fs(JobType::FsUnlink, path, None)
    }

    pub fn with_id(mut self, id: JobId) -> Self {
        self.id = Some(id);
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompileLog {
    pub std_err: Vec<String>,
    pub std_out: Vec<String>,
}

impl CompileLog {
    /// stderr lines first, then stdout
    pub fn lines(&self) -> impl Iterator<Item = &String> {
        self.std_err.iter().chain(self.std_out.iter())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompileResult {
    pub log: CompileLog,
    /// Present only when the engine exited with 0
    #[serde(default, skip_serializing_if = "Option::is_none", with = "base64_bytes::option")]
    pub output: Option<Vec<u8>>,
    pub exit_code: i32,
    /// Wall-clock milliseconds
    pub duration: u64,
}

impl CompileResult {
    pub fn succeeded(&self) -> bool {
        self.exit_code == 0 && self.output.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ResponseData {
    Compile(CompileResult),
    Fs(FsPayload),
    Ack(bool),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<JobId>,
    #[serde(rename = "type")]
    pub job_type: JobType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<ResponseData>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub err: Option<String>,
    /// Console output captured before a compile job failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log: Option<CompileLog>,
}

impl JobResponse {
    pub fn ok(id: Option<JobId>, job_type: JobType, data: ResponseData) -> Self {
        Self {
            id,
            job_type,
            data: Some(data),
            err: None,
            log: None,
        }
    }

    pub fn failed(id: Option<JobId>, job_type: JobType, err: impl Into<String>) -> Self {
        Self {
            id,
            job_type,
            data: None,
            err: Some(err.into()),
            log: None,
        }
    }

    pub fn with_log(mut self, log: CompileLog) -> Self {
        self.log = Some(log);
        self
    }
}

pub fn encode<T: Serialize>(value: &T) -> Result<String, TransportError> {
    serde_json::to_string(value).map_err(|e| TransportError::Malformed(e.to_string()))
}

pub fn decode<T: DeserializeOwned>(frame: &str) -> Result<T, TransportError> {
    serde_json::from_str(frame).map_err(|e| TransportError::Malformed(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_wire_shape() {
        let msg = JobMessage::export("cube();").with_id(JobId::Number(7));
        let frame = encode(&msg).unwrap();
        assert_eq!(frame, r#"{"id":7,"type":"export","data":{"code":"cube();"}}"#);
    }

    #[test]
    fn test_fs_payload_not_mistaken_for_compile() {
        let frame = r#"{"type":"fs.read","data":{"path":"lib.scad"}}"#;
        let msg: JobMessage = decode(frame).unwrap();
        assert!(msg.id.is_none());
        assert_eq!(
            msg.data,
            JobPayload::Fs(FsPayload {
                path: "lib.scad".to_string(),
                content: None
            })
        );
    }

    #[test]
    fn test_compile_result_output_base64() {
        let response = JobResponse::ok(
            Some(JobId::Text("a".into())),
            JobType::Preview,
            ResponseData::Compile(CompileResult {
                log: CompileLog::default(),
                output: Some(vec![0, 255, 1]),
                exit_code: 0,
                duration: 12,
            }),
        );
        let frame = encode(&response).unwrap();
        assert!(frame.contains(r#""output":"AP8B""#));
        assert!(frame.contains(r#""exitCode":0"#));

        let back: JobResponse = decode(&frame).unwrap();
        assert_eq!(back, response);
    }

    #[test]
    fn test_failed_response_has_no_data() {
        let frame = encode(&JobResponse::failed(None, JobType::Export, "boom")).unwrap();
        assert_eq!(frame, r#"{"type":"export","err":"boom"}"#);
    }

    #[test]
    fn test_failed_response_carries_log() {
        let log = CompileLog {
            std_err: vec!["WARNING: font not found".into()],
            std_out: vec![],
        };
        let response = JobResponse::failed(Some(JobId::Number(4)), JobType::Export, "boom").with_log(log.clone());
        let frame = encode(&response).unwrap();
        assert!(frame.contains(r#""log":{"stdErr":["WARNING: font not found"],"stdOut":[]}"#));

        let back: JobResponse = decode(&frame).unwrap();
        assert_eq!(back.log, Some(log));
        assert!(back.data.is_none());
    }

    #[test]
    fn test_ack_response() {
        let back: JobResponse = decode(r#"{"id":"x","type":"fs.write","data":true}"#).unwrap();
        assert_eq!(back.data, Some(ResponseData::Ack(true)));
    }

    #[test]
    fn test_garbage_frame_is_malformed() {
        assert!(matches!(
            decode::<JobMessage>("{not json"),
            Err(TransportError::Malformed(_))
        ));
    }

    #[test]
    fn test_log_lines_stderr_first() {
        let log = CompileLog {
            std_err: vec!["e".into()],
            std_out: vec!["o".into()],
        };
        let lines: Vec<_> = log.lines().cloned().collect();
        assert_eq!(lines, vec!["e", "o"]);
    }
}
