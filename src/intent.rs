//! Intents: the closed set of commands a signed document may carry.
//!
//! A document is `{type, originator, manifest: {version, ...}, metadata?}`.
//! It is validated against `intent.<type>.<version>.json` before any typed
//! parsing happens, so typed manifests only ever see schema-clean input.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::artifact::{ArtifactQuery, ArtifactUpdate, UploadOptions};
use crate::now_ms;
use crate::schema::{SchemaCache, ValidationError};

pub const DEFAULT_TIMEOUT_SECONDS: u64 = 30;
pub const MAX_CODE_TIMEOUT_SECONDS: u64 = 3600;
pub const MAX_COMMAND_TIMEOUT_SECONDS: u64 = 300;
pub const MAX_CODE_CHARS: usize = 10_000;
pub const MAX_COMMAND_CHARS: usize = 1_000;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum IntentKind {
    RunCode,
    RunCommand,
    StoreArtifact,
    RetrieveArtifact,
    DeleteArtifact,
    UpdateArtifact,
    QueryArtifacts,
    JobStatus,
}

impl IntentKind {
    pub const ALL: [IntentKind; 8] = [
        IntentKind::RunCode,
        IntentKind::RunCommand,
        IntentKind::StoreArtifact,
        IntentKind::RetrieveArtifact,
        IntentKind::DeleteArtifact,
        IntentKind::UpdateArtifact,
        IntentKind::QueryArtifacts,
        IntentKind::JobStatus,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            IntentKind::RunCode => "runCode",
            IntentKind::RunCommand => "runCommand",
            IntentKind::StoreArtifact => "storeArtifact",
            IntentKind::RetrieveArtifact => "retrieveArtifact",
            IntentKind::DeleteArtifact => "deleteArtifact",
            IntentKind::UpdateArtifact => "updateArtifact",
            IntentKind::QueryArtifacts => "queryArtifacts",
            IntentKind::JobStatus => "jobStatus",
        }
    }

    /// Whether the intent becomes a tracked job.
    pub fn is_execution(self) -> bool {
        matches!(self, IntentKind::RunCode | IntentKind::RunCommand)
    }
}

impl fmt::Display for IntentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IntentKind {
    type Err = ValidationError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        IntentKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == value)
            .ok_or_else(|| ValidationError::Invalid {
                path: "/type".to_string(),
                message: format!("unsupported intent type '{value}'"),
            })
    }
}

pub fn schema_key(kind: IntentKind, version: &str) -> String {
    format!("intent.{kind}.{version}.json")
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunCodeManifest {
    pub code: String,
    #[serde(default = "default_language")]
    pub language: String,
    #[serde(default = "default_timeout")]
    pub timeout_seconds: u64,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    #[serde(default)]
    pub stream_logs: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunCommandManifest {
    pub command: String,
    #[serde(default = "default_timeout")]
    pub timeout_seconds: u64,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    #[serde(default)]
    pub stream_logs: bool,
}

fn default_language() -> String {
    "python".to_string()
}

fn default_timeout() -> u64 {
    DEFAULT_TIMEOUT_SECONDS
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
struct ArtifactRef {
    artifact_id: Uuid,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
struct JobRef {
    job_id: Uuid,
}

/// Typed parameters, one variant per [`IntentKind`].
#[derive(Clone, Debug, PartialEq)]
pub enum IntentParams {
    RunCode(RunCodeManifest),
    RunCommand(RunCommandManifest),
    StoreArtifact(UploadOptions),
    RetrieveArtifact { artifact_id: Uuid },
    DeleteArtifact { artifact_id: Uuid },
    UpdateArtifact { artifact_id: Uuid, changes: ArtifactUpdate },
    QueryArtifacts(ArtifactQuery),
    JobStatus { job_id: Uuid },
}

#[derive(Clone, Debug, PartialEq)]
pub struct Intent {
    pub intent_id: Uuid,
    pub originator: String,
    pub version: String,
    pub params: IntentParams,
    pub metadata: Option<Value>,
    pub submitted_at_ms: u64,
}

impl Intent {
    /// Validates `document` against its schema and builds the typed intent.
    pub fn parse(document: &[u8], schemas: &SchemaCache) -> Result<Intent, ValidationError> {
        let value: Value = serde_json::from_slice(document)
            .map_err(|err| ValidationError::Malformed(format!("document is not JSON: {err}")))?;
        let kind: IntentKind = value
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| ValidationError::Invalid {
                path: "/type".to_string(),
                message: "type must be a string".to_string(),
            })?
            .parse()?;
        let version = value
            .pointer("/manifest/version")
            .and_then(Value::as_str)
            .ok_or_else(|| ValidationError::Invalid {
                path: "/manifest/version".to_string(),
                message: "manifest.version must be a string".to_string(),
            })?
            .to_string();

        schemas.validate(&value, &schema_key(kind, &version))?;

        let originator = value
            .get("originator")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let manifest = value.get("manifest").cloned().unwrap_or(Value::Null);
        let params = match kind {
            IntentKind::RunCode => {
                let manifest: RunCodeManifest = typed(&manifest)?;
                check_run_code(&manifest)?;
                IntentParams::RunCode(manifest)
            }
            IntentKind::RunCommand => {
                let manifest: RunCommandManifest = typed(&manifest)?;
                check_run_command(&manifest)?;
                IntentParams::RunCommand(manifest)
            }
            IntentKind::StoreArtifact => {
                let options: UploadOptions = typed(&manifest)?;
                check_store_artifact(&options)?;
                IntentParams::StoreArtifact(options)
            }
            IntentKind::RetrieveArtifact => IntentParams::RetrieveArtifact {
                artifact_id: typed::<ArtifactRef>(&manifest)?.artifact_id,
            },
            IntentKind::DeleteArtifact => IntentParams::DeleteArtifact {
                artifact_id: typed::<ArtifactRef>(&manifest)?.artifact_id,
            },
            IntentKind::UpdateArtifact => IntentParams::UpdateArtifact {
                artifact_id: typed::<ArtifactRef>(&manifest)?.artifact_id,
                changes: typed(&manifest)?,
            },
            IntentKind::QueryArtifacts => IntentParams::QueryArtifacts(typed(&manifest)?),
            IntentKind::JobStatus => IntentParams::JobStatus {
                job_id: typed::<JobRef>(&manifest)?.job_id,
            },
        };

        Ok(Intent {
            intent_id: Uuid::new_v4(),
            originator,
            version,
            params,
            metadata: value.get("metadata").cloned(),
            submitted_at_ms: now_ms(),
        })
    }

    pub fn kind(&self) -> IntentKind {
        match &self.params {
            IntentParams::RunCode(_) => IntentKind::RunCode,
            IntentParams::RunCommand(_) => IntentKind::RunCommand,
            IntentParams::StoreArtifact(_) => IntentKind::StoreArtifact,
            IntentParams::RetrieveArtifact { .. } => IntentKind::RetrieveArtifact,
            IntentParams::DeleteArtifact { .. } => IntentKind::DeleteArtifact,
            IntentParams::UpdateArtifact { .. } => IntentKind::UpdateArtifact,
            IntentParams::QueryArtifacts(_) => IntentKind::QueryArtifacts,
            IntentParams::JobStatus { .. } => IntentKind::JobStatus,
        }
    }

    /// `stream_logs` for execution intents, `false` otherwise.
    pub fn streams_logs(&self) -> bool {
        match &self.params {
            IntentParams::RunCode(manifest) => manifest.stream_logs,
            IntentParams::RunCommand(manifest) => manifest.stream_logs,
            _ => false,
        }
    }
}

fn typed<T: DeserializeOwned>(manifest: &Value) -> Result<T, ValidationError> {
    T::deserialize(manifest).map_err(|err| ValidationError::Invalid {
        path: "/manifest".to_string(),
        message: err.to_string(),
    })
}

// Schemas are operator-editable; the bounds the sandbox relies on are
// enforced here as well.
fn check_run_code(manifest: &RunCodeManifest) -> Result<(), ValidationError> {
    if manifest.language != "python" {
        return Err(invalid("/manifest/language", "only python is supported"));
    }
    if manifest.code.is_empty() || manifest.code.chars().count() > MAX_CODE_CHARS {
        return Err(invalid("/manifest/code", "code must be 1..=10000 characters"));
    }
    if !(1..=MAX_CODE_TIMEOUT_SECONDS).contains(&manifest.timeout_seconds) {
        return Err(invalid(
            "/manifest/timeout_seconds",
            "timeout_seconds must be 1..=3600",
        ));
    }
    Ok(())
}

fn check_run_command(manifest: &RunCommandManifest) -> Result<(), ValidationError> {
    if manifest.command.is_empty() || manifest.command.chars().count() > MAX_COMMAND_CHARS {
        return Err(invalid("/manifest/command", "command must be 1..=1000 characters"));
    }
    if !(1..=MAX_COMMAND_TIMEOUT_SECONDS).contains(&manifest.timeout_seconds) {
        return Err(invalid(
            "/manifest/timeout_seconds",
            "timeout_seconds must be 1..=300",
        ));
    }
    Ok(())
}

/// The body of an upload is not covered by the signature, so the signed
/// manifest has to pin its size and digest.
fn check_store_artifact(options: &UploadOptions) -> Result<(), ValidationError> {
    if options.expected_size.is_none() {
        return Err(invalid("/manifest/expected_size", "expected_size is required"));
    }
    match options.expected_sha256.as_deref() {
        Some(digest) if digest.len() == 64 && digest.bytes().all(|b| b.is_ascii_hexdigit()) => {
            Ok(())
        }
        Some(_) => Err(invalid(
            "/manifest/expected_sha256",
            "expected_sha256 must be 64 hex characters",
        )),
        None => Err(invalid("/manifest/expected_sha256", "expected_sha256 is required")),
    }
}

fn invalid(path: &str, message: &str) -> ValidationError {
    ValidationError::Invalid {
        path: path.to_string(),
        message: message.to_string(),
    }
}
