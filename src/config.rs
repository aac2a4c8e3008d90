//! Project configuration persisted as ProjectModel.json in the project root.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{AnonymizerError, Result};

pub const PROJECT_MODEL_FILENAME: &str = "ProjectModel.json";
pub const PRIVATE_DIR: &str = "private";
pub const QUARANTINE_DIR: &str = "quarantine";
pub const PHI_EXPORT_DIR: &str = "phi_export";

/// Verification SOP Class ("echo").
pub const VERIFICATION_CLASS: &str = "1.2.840.10008.1.1";
/// Study Root Query/Retrieve Information Model - FIND.
pub const STUDY_ROOT_FIND: &str = "1.2.840.10008.5.1.4.1.2.2.1";
/// Study Root Query/Retrieve Information Model - MOVE.
pub const STUDY_ROOT_MOVE: &str = "1.2.840.10008.5.1.4.1.2.2.2";

/// A DICOM Application Entity endpoint: host, port and AE title.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DicomNode {
    pub host: String,
    pub port: u16,
    pub aet: String,
}

impl DicomNode {
    pub fn socket_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl std::fmt::Display for DicomNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "AET '{}' on {}:{}", self.aet, self.host, self.port)
    }
}

/// The four network timeouts, all in seconds. Every blocking network
/// operation is bounded by the smallest applicable one.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct NetworkTimeouts {
    /// Max time to wait for the TCP connection to be established.
    pub tcp_connect: u64,
    /// Max time to wait for association (ACSE) messages.
    pub acse: u64,
    /// Max time to wait for DIMSE messages.
    pub dimse: u64,
    /// Outer timeout: max time to wait for network activity before an
    /// association or pending import is considered dead.
    pub network: u64,
}

impl Default for NetworkTimeouts {
    fn default() -> Self {
        Self {
            tcp_connect: 5,
            acse: 30,
            dimse: 30,
            network: 60,
        }
    }
}

/// Per-component log levels, applied through the tracing env-filter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingLevels {
    pub anonymizer: String,
    pub network: String,
}

impl Default for LoggingLevels {
    fn default() -> Self {
        Self {
            anonymizer: "info".into(),
            network: "warn".into(),
        }
    }
}

impl LoggingLevels {
    /// Env-filter directive string for tracing-subscriber.
    pub fn filter_directives(&self) -> String {
        format!(
            "dicom_anonymizer={},dicom_anonymizer::dimse={},dicom_anonymizer::scp={}",
            self.anonymizer, self.network, self.network
        )
    }
}

/// AWS Cognito identity-pool settings for the S3 export path.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AwsCognito {
    pub account_id: String,
    pub region_name: String,
    pub app_client_id: String,
    pub user_pool_id: String,
    pub identity_pool_id: String,
    pub s3_bucket: String,
    pub s3_prefix: String,
    pub username: String,
    pub password: String,
}

/// Ingest tuning knobs. The memory threshold consults OS-level available
/// memory (sysinfo), not process RSS.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct IngestSettings {
    pub queue_capacity: usize,
    pub worker_count: usize,
    /// Back off while available memory is below this many bytes.
    pub memory_backoff_threshold: u64,
    /// Sleep per backoff retry, in milliseconds.
    pub backoff_slice_millis: u64,
    /// Backoff retries before answering OutOfResources (0xA700).
    pub backoff_retries: u32,
    pub autosave_interval_secs: u64,
}

impl Default for IngestSettings {
    fn default() -> Self {
        Self {
            queue_capacity: 4096,
            worker_count: 4,
            memory_backoff_threshold: 1 << 30,
            backoff_slice_millis: 100,
            backoff_retries: 10,
            autosave_interval_secs: 30,
        }
    }
}

/// Export tuning knobs.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ExportSettings {
    pub worker_count: usize,
    /// Files sent between progress events.
    pub batch_size: usize,
}

impl Default for ExportSettings {
    fn default() -> Self {
        Self {
            worker_count: 4,
            batch_size: 10,
        }
    }
}

/// The project data model: everything a headless run needs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectModel {
    pub version: u32,
    pub project_name: String,
    pub site_id: String,
    pub uid_root: String,
    pub storage_dir: PathBuf,
    pub modalities: Vec<String>,
    pub storage_classes: Vec<String>,
    pub transfer_syntaxes: Vec<String>,
    /// The local AE: bound by the SCP, named as move destination.
    pub local: DicomNode,
    /// Named remote peers (query source, export destination).
    pub remote_nodes: BTreeMap<String, DicomNode>,
    pub network_timeouts: NetworkTimeouts,
    pub logging_levels: LoggingLevels,
    pub ingest: IngestSettings,
    pub export: ExportSettings,
    pub export_to_aws: bool,
    pub aws_cognito: AwsCognito,
    pub anonymizer_script_path: Option<PathBuf>,
}

impl ProjectModel {
    pub const MODEL_VERSION: u32 = 1;

    pub fn new(project_name: &str, site_id: &str, uid_root: &str, storage_dir: &Path) -> Self {
        Self {
            version: Self::MODEL_VERSION,
            project_name: project_name.to_string(),
            site_id: site_id.to_string(),
            uid_root: uid_root.to_string(),
            storage_dir: storage_dir.to_path_buf(),
            modalities: vec!["CR".into(), "DX".into(), "CT".into(), "MR".into()],
            storage_classes: Vec::new(),
            transfer_syntaxes: vec![
                "1.2.840.10008.1.2".into(),    // Implicit VR Little Endian
                "1.2.840.10008.1.2.1".into(),  // Explicit VR Little Endian
            ],
            local: DicomNode {
                host: "0.0.0.0".into(),
                port: 1045,
                aet: "ANONYMIZER".into(),
            },
            remote_nodes: BTreeMap::new(),
            network_timeouts: NetworkTimeouts::default(),
            logging_levels: LoggingLevels::default(),
            ingest: IngestSettings::default(),
            export: ExportSettings::default(),
            export_to_aws: false,
            aws_cognito: AwsCognito::default(),
            anonymizer_script_path: None,
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path).map_err(|e| AnonymizerError::io(path, e))?;
        let model: ProjectModel =
            serde_json::from_str(&raw).map_err(|e| AnonymizerError::Config(e.to_string()))?;
        model.validate()?;
        Ok(model)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let raw = serde_json::to_string_pretty(self)
            .map_err(|e| AnonymizerError::Config(e.to_string()))?;
        fs::write(path, raw).map_err(|e| AnonymizerError::io(path, e))
    }

    pub fn validate(&self) -> Result<()> {
        if self.site_id.is_empty() {
            return Err(AnonymizerError::Config("site_id cannot be empty".into()));
        }
        if self.uid_root.is_empty() {
            return Err(AnonymizerError::Config("uid_root cannot be empty".into()));
        }
        if !self
            .uid_root
            .chars()
            .all(|c| c.is_ascii_digit() || c == '.')
        {
            return Err(AnonymizerError::Config(format!(
                "uid_root '{}' must be a dotted numeric string",
                self.uid_root
            )));
        }
        if self.storage_classes.is_empty() {
            return Err(AnonymizerError::Config(
                "at least one storage class must be configured".into(),
            ));
        }
        Ok(())
    }

    pub fn remote(&self, name: &str) -> Result<&DicomNode> {
        self.remote_nodes
            .get(name)
            .ok_or_else(|| AnonymizerError::Config(format!("remote node '{name}' not configured")))
    }

    pub fn private_dir(&self) -> PathBuf {
        self.storage_dir.join(PRIVATE_DIR)
    }

    pub fn quarantine_dir(&self) -> PathBuf {
        self.private_dir().join(QUARANTINE_DIR)
    }

    pub fn phi_export_dir(&self) -> PathBuf {
        self.private_dir().join(PHI_EXPORT_DIR)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn model() -> ProjectModel {
        let mut m = ProjectModel::new(
            "TRIAL",
            "RSNA-0001",
            "1.2.826.0.1.3680043.10.474",
            Path::new("/tmp/trial"),
        );
        m.storage_classes = vec!["1.2.840.10008.5.1.4.1.1.1".into()];
        m
    }

    #[test]
    fn json_round_trip_preserves_model() {
        let m = model();
        let json = serde_json::to_string(&m).unwrap();
        let back: ProjectModel = serde_json::from_str(&json).unwrap();
        assert_eq!(back.site_id, m.site_id);
        assert_eq!(back.local, m.local);
        assert_eq!(back.storage_classes, m.storage_classes);
    }

    #[test]
    fn empty_site_id_is_rejected() {
        let mut m = model();
        m.site_id.clear();
        assert!(m.validate().is_err());
    }

    #[test]
    fn non_numeric_uid_root_is_rejected() {
        let mut m = model();
        m.uid_root = "1.2.bad".into();
        assert!(m.validate().is_err());
    }
}
