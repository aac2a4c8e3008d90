//! Reader for the patient index workbook exported by the legacy Java
//! anonymizer, used to seed the PHI index of a new installation.

use std::path::Path;

use calamine::{open_workbook_auto, Data, Reader};

use crate::error::{AnonymizerError, Result};

/// One study row from the Java Anonymizer exported index sheet.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JavaIndexedStudy {
    pub anon_patient_name: String,
    pub anon_patient_id: String,
    pub phi_patient_name: String,
    pub phi_patient_id: String,
    pub date_offset: i64,
    pub anon_study_date: String,
    pub phi_study_date: String,
    pub anon_accession: String,
    pub phi_accession: String,
    pub anon_study_uid: String,
    pub phi_study_uid: String,
}

fn cell_string(row: &[Data], index: usize) -> String {
    match row.get(index) {
        Some(Data::Empty) | None => String::new(),
        // Integer-typed cells (accessions, offsets) must not pick up a
        // floating point suffix.
        Some(Data::Float(f)) if f.fract() == 0.0 => format!("{}", *f as i64),
        Some(value) => value.to_string().trim().to_string(),
    }
}

/// Reads the first sheet of the Java Anonymizer index workbook. The header
/// row is skipped; blank rows are ignored.
pub fn read_java_index(path: &Path) -> Result<Vec<JavaIndexedStudy>> {
    let mut workbook = open_workbook_auto(path)
        .map_err(|e| AnonymizerError::Config(format!("cannot open index workbook: {e}")))?;
    let sheet_name = workbook
        .sheet_names()
        .first()
        .cloned()
        .ok_or_else(|| AnonymizerError::Config("index workbook has no sheets".into()))?;
    let range = workbook
        .worksheet_range(&sheet_name)
        .map_err(|e| AnonymizerError::Config(format!("cannot read sheet {sheet_name}: {e}")))?;

    let mut studies = Vec::new();
    for row in range.rows().skip(1) {
        let anon_patient_id = cell_string(row, 1);
        let phi_study_uid = cell_string(row, 10);
        if anon_patient_id.is_empty() || phi_study_uid.is_empty() {
            continue;
        }
        studies.push(JavaIndexedStudy {
            anon_patient_name: cell_string(row, 0),
            anon_patient_id,
            phi_patient_name: cell_string(row, 2),
            phi_patient_id: cell_string(row, 3),
            date_offset: cell_string(row, 4).parse().unwrap_or(0),
            anon_study_date: cell_string(row, 5),
            phi_study_date: cell_string(row, 6),
            anon_accession: cell_string(row, 7),
            phi_accession: cell_string(row, 8),
            anon_study_uid: cell_string(row, 9),
            phi_study_uid,
        });
    }
    Ok(studies)
}
