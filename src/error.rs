use std::path::PathBuf;

use thiserror::Error;

/// Unified error type for the anonymizer core.
///
/// Ingest-side variants map one-to-one onto quarantine categories; network
/// variants are surfaced on request response channels rather than panicking
/// worker threads.
#[derive(Error, Debug)]
pub enum AnonymizerError {
    #[error("invalid DICOM stream: {0}")]
    InvalidDicom(String),

    #[error("DICOM read error: {0}")]
    DicomReadError(String),

    #[error("dataset missing required attributes: {}", .0.join(", "))]
    MissingAttributes(Vec<String>),

    #[error("storage class {0} is not in the project allow-list")]
    InvalidStorageClass(String),

    #[error("PHI capture failed: {0}")]
    CapturePhiError(String),

    #[error("storage error: {0}")]
    StorageError(String),

    /// Silent success: the instance was already anonymized and stored.
    #[error("instance already present")]
    AlreadyPresent,

    #[error("patient capacity exceeded (maximum {0})")]
    CapacityExceeded(usize),

    #[error("anonymizer model version mismatch: file has {found}, expected {expected}")]
    ModelVersionMismatch { found: u32, expected: u32 },

    #[error("network timeout during {0}")]
    NetworkTimeout(String),

    #[error("association rejected by {0}")]
    AssociationRejected(String),

    #[error("association aborted by peer {0}")]
    PeerAbort(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("object store credentials expired or missing: {0}")]
    CredentialsExpired(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("script error: {0}")]
    Script(String),

    #[error("DIMSE protocol error: {0}")]
    Dimse(String),

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl AnonymizerError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        AnonymizerError::Io {
            path: path.into(),
            source,
        }
    }

    /// Quarantine sub-directory for ingest-side failures, `None` for error
    /// kinds that never route a file to quarantine.
    pub fn quarantine_category(&self) -> Option<&'static str> {
        match self {
            AnonymizerError::InvalidDicom(_) => Some("Invalid_DICOM"),
            AnonymizerError::DicomReadError(_) => Some("DICOM_Read_Error"),
            AnonymizerError::MissingAttributes(_) => Some("Missing_Attributes"),
            AnonymizerError::InvalidStorageClass(_) => Some("Invalid_Storage_Class"),
            AnonymizerError::CapturePhiError(_) => Some("Capture_PHI_Error"),
            AnonymizerError::StorageError(_) => Some("Storage_Error"),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, AnonymizerError>;
