use std::fs;
use std::path::{Path, PathBuf};

use tracing::{error, warn};

use crate::config::ProjectModel;
use crate::dicom_access::{Dataset, ElementAccess, FileDataset};
use crate::error::{AnonymizerError, Result};
use dicom::dictionary_std::tags;
use dicom::encoding::TransferSyntaxIndex;
use dicom::transfer_syntax::TransferSyntaxRegistry;

pub const DICOM_FILE_SUFFIX: &str = ".dcm";

#[derive(Clone)]
pub struct FileStore {
    storage_dir: PathBuf,
    quarantine_dir: PathBuf,
}

impl FileStore {
    pub fn new(model: &ProjectModel) -> Result<Self> {
        let store = Self {
            storage_dir: model.storage_dir.clone(),
            quarantine_dir: model.quarantine_dir(),
        };
        fs::create_dir_all(&store.storage_dir)
            .map_err(|e| AnonymizerError::io(&store.storage_dir, e))?;
        fs::create_dir_all(model.private_dir())
            .map_err(|e| AnonymizerError::io(model.private_dir(), e))?;
        Ok(store)
    }

    pub fn storage_dir(&self) -> &Path {
        &self.storage_dir
    }

    pub fn patient_dir(&self, anon_patient_id: &str) -> PathBuf {
        self.storage_dir.join(anon_patient_id)
    }

    /// `{storage_dir}/{ptid}/{study}/{series}/{sop}.dcm` from anonymized
    /// identifiers only.
    pub fn instance_path(
        &self,
        anon_patient_id: &str,
        anon_study_uid: &str,
        anon_series_uid: &str,
        anon_sop_instance_uid: &str,
    ) -> PathBuf {
        self.storage_dir
            .join(anon_patient_id)
            .join(anon_study_uid)
            .join(anon_series_uid)
            .join(format!("{anon_sop_instance_uid}{DICOM_FILE_SUFFIX}"))
    }

    /// Writes an anonymized dataset to its storage path: temp name first,
    /// then rename. An existing file at the target is a collision and fails
    /// with a storage error.
    pub fn write_instance(&self, obj: &FileDataset, path: &Path) -> Result<()> {
        if path.exists() {
            return Err(AnonymizerError::StorageError(format!(
                "path collision at {}",
                path.display()
            )));
        }
        let parent = path.parent().ok_or_else(|| {
            AnonymizerError::StorageError(format!("no parent for {}", path.display()))
        })?;
        fs::create_dir_all(parent).map_err(|e| AnonymizerError::io(parent, e))?;

        let tmp = path.with_extension("dcm.tmp");
        obj.write_to_file(&tmp)
            .map_err(|e| AnonymizerError::StorageError(e.to_string()))?;
        fs::rename(&tmp, path).map_err(|e| AnonymizerError::io(path, e))
    }

    /// Writes the bytes of a failed dataset into the category's quarantine
    /// sub-directory. Quarantine failures are logged, never propagated: the
    /// pipeline must keep running.
    pub fn quarantine_dataset(&self, obj: &FileDataset, category: &str) {
        let sop_uid = obj
            .element_trimmed(tags::SOP_INSTANCE_UID)
            .unwrap_or_else(|| "unknown".to_string());
        let dir = self.quarantine_dir.join(category);
        if let Err(e) = fs::create_dir_all(&dir) {
            error!(category, error = %e, "cannot create quarantine directory");
            return;
        }
        let path = dir.join(format!("{sop_uid}{DICOM_FILE_SUFFIX}"));
        warn!(category, path = %path.display(), "quarantining dataset");
        if let Err(e) = obj.write_to_file(&path) {
            error!(category, error = %e, "failed writing dataset to quarantine");
        }
    }

    /// Writes a bare dataset (no file meta) to quarantine using the
    /// transfer syntax it arrived with, falling back to Implicit VR LE.
    pub fn quarantine_dataset_raw(&self, ds: &Dataset, ts_uid: &str, category: &str) {
        let sop_uid = ds
            .element_trimmed(tags::SOP_INSTANCE_UID)
            .unwrap_or_else(|| "unknown".to_string());
        let dir = self.quarantine_dir.join(category);
        if let Err(e) = fs::create_dir_all(&dir) {
            error!(category, error = %e, "cannot create quarantine directory");
            return;
        }
        let path = dir.join(format!("{sop_uid}{DICOM_FILE_SUFFIX}"));
        warn!(category, path = %path.display(), "quarantining dataset");

        let implicit = dicom::transfer_syntax::entries::IMPLICIT_VR_LITTLE_ENDIAN.erased();
        let ts = TransferSyntaxRegistry.get(ts_uid).unwrap_or(&implicit);
        let file = match fs::File::create(&path) {
            Ok(f) => f,
            Err(e) => {
                error!(category, error = %e, "failed creating quarantine file");
                return;
            }
        };
        let mut writer = std::io::BufWriter::new(file);
        if let Err(e) = ds.write_dataset_with_ts(&mut writer, ts) {
            error!(category, error = %e, "failed writing dataset to quarantine");
        }
    }

    /// Copies a source file into the category's quarantine sub-directory.
    pub fn quarantine_file(&self, file: &Path, category: &str) {
        let dir = self.quarantine_dir.join(category);
        if let Err(e) = fs::create_dir_all(&dir) {
            error!(category, error = %e, "cannot create quarantine directory");
            return;
        }
        let name = file
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "unnamed.dcm".to_string());
        let dest = dir.join(name);
        warn!(category, path = %dest.display(), "quarantining file");
        if let Err(e) = fs::copy(file, &dest) {
            error!(category, error = %e, "failed copying file to quarantine");
        }
    }

    pub fn quarantine_path(&self, category: &str) -> PathBuf {
        self.quarantine_dir.join(category)
    }

    /// All stored instance files below the given anon patient directory.
    pub fn patient_files(&self, anon_patient_id: &str) -> Vec<PathBuf> {
        let root = self.patient_dir(anon_patient_id);
        walkdir::WalkDir::new(root)
            .into_iter()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().is_file())
            .filter(|entry| {
                entry
                    .path()
                    .extension()
                    .is_some_and(|ext| ext.eq_ignore_ascii_case("dcm"))
            })
            .map(|entry| entry.into_path())
            .collect()
    }
}
