//! PHI CSV export: one row per imported study, written under
//! private/phi_export/.

use std::fs;
use std::path::PathBuf;

use tracing::info;

use crate::config::ProjectModel;
use crate::error::{AnonymizerError, Result};
use crate::phi_index::PhiIndex;

pub const PHI_CSV_COLUMNS: [&str; 13] = [
    "ANON_PatientID",
    "ANON_PatientName",
    "PHI_PatientID",
    "PHI_PatientName",
    "DateOffset",
    "ANON_Accession",
    "PHI_Accession",
    "ANON_StudyInstanceUID",
    "PHI_StudyInstanceUID",
    "ANON_StudyDate",
    "PHI_StudyDate",
    "NumberOfSeries",
    "NumberOfInstances",
];

/// Writes the PHI lookup index as a CSV and returns its path.
pub fn create_phi_csv(model: &ProjectModel, index: &PhiIndex) -> Result<PathBuf> {
    let records = index.phi_index_records();
    if records.is_empty() {
        return Err(AnonymizerError::StorageError(
            "no studies in the anonymizer model".into(),
        ));
    }

    let export_dir = model.phi_export_dir();
    fs::create_dir_all(&export_dir).map_err(|e| AnonymizerError::io(&export_dir, e))?;
    let filename = format!(
        "{}_{}_PHI_{}.csv",
        model.site_id,
        model.project_name,
        records.len()
    );
    let path = export_dir.join(filename);

    let mut writer = csv::Writer::from_path(&path)
        .map_err(|e| AnonymizerError::StorageError(e.to_string()))?;
    writer
        .write_record(PHI_CSV_COLUMNS)
        .map_err(|e| AnonymizerError::StorageError(e.to_string()))?;
    for record in &records {
        writer
            .write_record([
                record.anon_patient_id.as_str(),
                record.anon_patient_name.as_str(),
                record.phi_patient_id.as_str(),
                record.phi_patient_name.as_str(),
                &record.date_offset.to_string(),
                record.anon_accession.as_str(),
                record.phi_accession.as_str(),
                record.anon_study_uid.as_str(),
                record.phi_study_uid.as_str(),
                record.anon_study_date.as_str(),
                record.phi_study_date.as_str(),
                &record.num_series.to_string(),
                &record.num_instances.to_string(),
            ])
            .map_err(|e| AnonymizerError::StorageError(e.to_string()))?;
    }
    writer
        .flush()
        .map_err(|e| AnonymizerError::StorageError(e.to_string()))?;

    info!(path = %path.display(), rows = records.len(), "PHI CSV written");
    Ok(path)
}
