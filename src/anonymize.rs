//
// anonymize.rs
// dicom-anonymizer
//
// The anonymizer engine: validates a dataset, captures PHI into the
// index, rewrites every element according to the script and the group
// sweep rules, stamps the de-identification attributes, and stores the
// result.
//

use std::path::{Path, PathBuf};
use std::sync::Arc;

use dicom::core::header::Header;
use dicom::core::value::DataSetSequence;
use dicom::core::{DataElement, PrimitiveValue, Tag, VR};
use dicom::dictionary_std::tags;
use dicom::object::{open_file, FileMetaTableBuilder};
use md5::{Digest, Md5};
use tracing::{debug, info};

use crate::config::ProjectModel;
use crate::dicom_access::{missing_attributes, Dataset, ElementAccess, FileDataset};
use crate::error::{AnonymizerError, Result};
use crate::phi_index::{shift_date, PhiIndex};
use crate::script::{AnonymizerScript, ScriptOp};
use crate::storage::FileStore;

/// Value of DeIdentificationMethod (0012,0063).
pub const DEIDENTIFICATION_METHOD: &str = "RSNA DICOM ANONYMIZER";
/// Creator string of the private block in group 0013.
const PRIVATE_BLOCK_CREATOR: &str = "RSNA";
/// Anon date substituted when the source date is invalid or the patient id
/// is empty.
pub const DEFAULT_ANON_DATE: &str = "20000101";

/// `YYYYMMDD`, parseable, not before 1900-01-01.
pub fn valid_date(date: &str) -> bool {
    match chrono::NaiveDate::parse_from_str(date, "%Y%m%d") {
        Ok(d) => d >= chrono::NaiveDate::from_ymd_opt(1900, 1, 1).unwrap(),
        Err(_) => false,
    }
}

/// Derives the per-patient date shift: MD5 of the patient id read as a
/// big-endian integer, modulo ten years of days. Returns the shift and the
/// shifted date. Invalid dates and empty patient ids yield the default
/// anon date with a zero shift.
pub fn hash_date(date: &str, patient_id: &str) -> (i64, String) {
    if !valid_date(date) || patient_id.is_empty() {
        return (0, DEFAULT_ANON_DATE.to_string());
    }
    let digest: [u8; 16] = Md5::digest(patient_id.as_bytes()).into();
    let delta = (u128::from_be_bytes(digest) % 3652) as i64;
    (delta, shift_date(date, delta))
}

/// The date shift alone, for capture before the rewrite pass.
pub fn date_delta_for_patient(patient_id: &str) -> i64 {
    if patient_id.is_empty() {
        return 0;
    }
    let digest: [u8; 16] = Md5::digest(patient_id.as_bytes()).into();
    (u128::from_be_bytes(digest) % 3652) as i64
}

/// Rounds an age string of the form `NNN[DWMY]` to the nearest multiple of
/// `width` (half-up), preserving the unit suffix and padding the result to
/// an even length. Unparseable values pass through unchanged.
pub fn round_age(age: &str, width: u32) -> String {
    let age = age.trim();
    if age.is_empty() || width == 0 {
        return age.to_string();
    }
    let digits: String = age.chars().filter(|c| c.is_ascii_digit()).collect();
    let suffix: String = age.chars().filter(|c| c.is_ascii_alphabetic()).collect();
    let Ok(value) = digits.parse::<u64>() else {
        return age.to_string();
    };
    let width = u64::from(width);
    let rounded = (value + width / 2) / width * width;
    let mut result = format!("{rounded}{suffix}");
    if result.len() % 2 != 0 {
        result.insert(0, '0');
    }
    result
}

enum Rewrite {
    Remove,
    Set(VR, String),
    Clear(VR),
}

/// The anonymizer engine. One instance is shared by all worker threads;
/// identifier allocation is serialized by the PHI index writer lock while
/// the element rewrite runs lock-free on the private dataset.
pub struct Anonymizer {
    index: Arc<PhiIndex>,
    script: AnonymizerScript,
    store: FileStore,
    storage_classes: Vec<String>,
    site_id: String,
    project_name: String,
}

impl Anonymizer {
    pub fn new(model: &ProjectModel, index: Arc<PhiIndex>, store: FileStore) -> Result<Self> {
        let script = match &model.anonymizer_script_path {
            Some(path) => AnonymizerScript::load(path)?,
            None => AnonymizerScript::default_script(),
        };
        Ok(Self {
            index,
            script,
            store,
            storage_classes: model.storage_classes.clone(),
            site_id: model.site_id.clone(),
            project_name: model.project_name.clone(),
        })
    }

    pub fn index(&self) -> &Arc<PhiIndex> {
        &self.index
    }

    pub fn store(&self) -> &FileStore {
        &self.store
    }

    /// Anonymizes one dataset and writes it to local storage, returning the
    /// storage path. `ts_uid` is the transfer syntax the dataset arrived
    /// with; the output keeps it.
    ///
    /// Validation failures and unexpected errors route the source dataset
    /// to the matching quarantine sub-directory; the error is returned
    /// either way. A dataset seen before returns `AlreadyPresent` without
    /// touching the index.
    pub fn anonymize(&self, source: &str, mut ds: Dataset, ts_uid: &str) -> Result<PathBuf> {
        // 1. Validation.
        let missing = missing_attributes(&ds);
        if !missing.is_empty() {
            let err = AnonymizerError::MissingAttributes(missing);
            self.quarantine(&ds, ts_uid, &err);
            return Err(err);
        }

        let sop_class = ds.element_trimmed(tags::SOP_CLASS_UID).unwrap_or_default();
        if !self.storage_classes.contains(&sop_class) {
            let err = AnonymizerError::InvalidStorageClass(sop_class);
            self.quarantine(&ds, ts_uid, &err);
            return Err(err);
        }

        let phi_sop_uid = ds.element_trimmed(tags::SOP_INSTANCE_UID).unwrap_or_default();
        let phi_ptid = ds.element_trimmed(tags::PATIENT_ID).unwrap_or_default();
        let date_delta = date_delta_for_patient(&phi_ptid);

        // 2. Capture PHI and allocate identifiers under the index writer
        // lock. AlreadyPresent is silent idempotence for the caller.
        match self.index.capture_phi(source, &ds, date_delta) {
            Ok(()) => {}
            Err(AnonymizerError::AlreadyPresent) => {
                debug!(sop_uid = %phi_sop_uid, "instance already present, skipping");
                return Err(AnonymizerError::AlreadyPresent);
            }
            Err(e) => {
                let err = AnonymizerError::CapturePhiError(e.to_string());
                self.quarantine(&ds, ts_uid, &err);
                return Err(err);
            }
        }

        // 3..6. Rewrite and store; on failure give the instance UID back so
        // the dataset can be re-imported. The rewrite path quarantines its
        // own failures under Storage_Error.
        match self.rewrite_and_store(ds, ts_uid, &phi_ptid, date_delta) {
            Ok(path) => {
                info!(source, path = %path.display(), "anonymized instance stored");
                Ok(path)
            }
            Err(e) => {
                self.index.remove_uid(&phi_sop_uid);
                match e {
                    e @ AnonymizerError::StorageError(_) => Err(e),
                    other => Err(AnonymizerError::StorageError(other.to_string())),
                }
            }
        }
    }

    /// Reads a DICOM file and anonymizes it, quarantining unreadable files.
    pub fn anonymize_file(&self, file: &Path) -> Result<PathBuf> {
        let obj = match open_file(file) {
            Ok(obj) => obj,
            Err(e) => {
                let err = AnonymizerError::DicomReadError(e.to_string());
                self.store
                    .quarantine_file(file, err.quarantine_category().unwrap());
                return Err(err);
            }
        };
        let ts_uid = obj.meta().transfer_syntax().to_string();
        let ds = obj.into_inner();
        self.anonymize(&file.display().to_string(), ds, &ts_uid)
    }

    fn quarantine(&self, ds: &Dataset, ts_uid: &str, err: &AnonymizerError) {
        if let Some(category) = err.quarantine_category() {
            self.store.quarantine_dataset_raw(ds, ts_uid, category);
        }
    }

    fn rewrite_and_store(
        &self,
        mut ds: Dataset,
        ts_uid: &str,
        phi_ptid: &str,
        date_delta: i64,
    ) -> Result<PathBuf> {
        let anon_ptid = match self.index.get_anon_patient_id(phi_ptid) {
            Some(id) => id,
            // capture_phi allocates this; fall back to the sentinel rather
            // than losing the instance.
            None => self.index.default_anon_patient_id(),
        };

        // Single pass: collect the rewrite for every element, then apply.
        let mut rewrites: Vec<(Tag, Rewrite)> = Vec::new();
        for elem in ds.iter() {
            let tag = elem.tag();
            let vr = elem.vr();
            match self.script.lookup(tag) {
                Some(ScriptOp::Keep) => {}
                Some(ScriptOp::Remove) => rewrites.push((tag, Rewrite::Remove)),
                Some(ScriptOp::Empty) => rewrites.push((tag, Rewrite::Clear(vr))),
                Some(ScriptOp::HashDate(_)) => {
                    let value = elem.to_str().map(|s| s.into_owned()).unwrap_or_default();
                    let shifted = if valid_date(value.trim()) && !phi_ptid.is_empty() {
                        shift_date(value.trim(), date_delta)
                    } else {
                        DEFAULT_ANON_DATE.to_string()
                    };
                    rewrites.push((tag, Rewrite::Set(vr, shifted)));
                }
                Some(ScriptOp::Round(width)) => {
                    let value = elem.to_str().map(|s| s.into_owned()).unwrap_or_default();
                    rewrites.push((tag, Rewrite::Set(vr, round_age(&value, width))));
                }
                Some(ScriptOp::PatientId) => {
                    rewrites.push((tag, Rewrite::Set(vr, anon_ptid.clone())));
                }
                Some(ScriptOp::Accession) => {
                    let value = elem
                        .to_str()
                        .map(|s| s.trim().to_string())
                        .unwrap_or_default();
                    if value.is_empty() {
                        rewrites.push((tag, Rewrite::Clear(vr)));
                    } else {
                        let anon = self.index.get_next_anon_acc_no(&value);
                        rewrites.push((tag, Rewrite::Set(vr, anon)));
                    }
                }
                Some(ScriptOp::Uid) => {
                    let value = elem
                        .to_str()
                        .map(|s| s.trim().to_string())
                        .unwrap_or_default();
                    if value.is_empty() {
                        rewrites.push((tag, Rewrite::Remove));
                    } else {
                        let anon = self.index.get_next_anon_uid(&value);
                        rewrites.push((tag, Rewrite::Set(vr, anon)));
                    }
                }
                None => {
                    if sweep_removes(tag) {
                        rewrites.push((tag, Rewrite::Remove));
                    }
                }
            }
        }

        for (tag, rewrite) in rewrites {
            match rewrite {
                Rewrite::Remove => {
                    ds.remove_element(tag);
                }
                Rewrite::Set(vr, value) => {
                    ds.put(DataElement::new(tag, vr, PrimitiveValue::from(value)));
                }
                Rewrite::Clear(vr) => {
                    ds.put(DataElement::new(tag, vr, PrimitiveValue::Empty));
                }
            }
        }

        // The patient identity elements always carry the anon patient id.
        ds.put(DataElement::new(
            tags::PATIENT_ID,
            VR::LO,
            PrimitiveValue::from(anon_ptid.clone()),
        ));
        ds.put(DataElement::new(
            tags::PATIENT_NAME,
            VR::PN,
            PrimitiveValue::from(anon_ptid.clone()),
        ));

        if let Err(e) = self.stamp_deidentification(&mut ds) {
            self.store
                .quarantine_dataset_raw(&ds, ts_uid, "Storage_Error");
            return Err(e);
        }

        // 6. Storage path from anonymized identifiers only.
        let (path, meta) = match self.output_location(&ds, ts_uid) {
            Ok(out) => out,
            Err(e) => {
                self.store
                    .quarantine_dataset_raw(&ds, ts_uid, "Storage_Error");
                return Err(e);
            }
        };

        let file_obj: FileDataset = ds.with_exact_meta(meta);
        if let Err(e) = self.store.write_instance(&file_obj, &path) {
            self.store.quarantine_dataset(&file_obj, "Storage_Error");
            return Err(e);
        }
        Ok(path)
    }

    fn output_location(
        &self,
        ds: &Dataset,
        ts_uid: &str,
    ) -> Result<(PathBuf, dicom::object::meta::FileMetaTable)> {
        let anon_ptid = ds
            .element_trimmed(tags::PATIENT_ID)
            .ok_or_else(|| AnonymizerError::StorageError("anonymized PatientID missing".into()))?;
        let anon_study = ds.element_trimmed(tags::STUDY_INSTANCE_UID).ok_or_else(|| {
            AnonymizerError::StorageError("anonymized StudyInstanceUID missing".into())
        })?;
        let anon_series = ds.element_trimmed(tags::SERIES_INSTANCE_UID).ok_or_else(|| {
            AnonymizerError::StorageError("anonymized SeriesInstanceUID missing".into())
        })?;
        let anon_sop = ds.element_trimmed(tags::SOP_INSTANCE_UID).ok_or_else(|| {
            AnonymizerError::StorageError("anonymized SOPInstanceUID missing".into())
        })?;
        let sop_class = ds
            .element_trimmed(tags::SOP_CLASS_UID)
            .ok_or_else(|| AnonymizerError::StorageError("SOPClassUID missing".into()))?;

        let path = self
            .store
            .instance_path(&anon_ptid, &anon_study, &anon_series, &anon_sop);
        let meta = FileMetaTableBuilder::new()
            .transfer_syntax(ts_uid)
            .media_storage_sop_class_uid(sop_class)
            .media_storage_sop_instance_uid(anon_sop)
            .build()
            .map_err(|e| AnonymizerError::StorageError(e.to_string()))?;
        Ok((path, meta))
    }

    /// De-identification bookkeeping: (0012,0062/0063/0064) and the private
    /// block carrying the project provenance.
    fn stamp_deidentification(&self, ds: &mut Dataset) -> Result<()> {
        ds.put(DataElement::new(
            tags::PATIENT_IDENTITY_REMOVED,
            VR::CS,
            PrimitiveValue::from("YES"),
        ));
        ds.put(DataElement::new(
            tags::DEIDENTIFICATION_METHOD,
            VR::LO,
            PrimitiveValue::from(DEIDENTIFICATION_METHOD),
        ));

        let items: Vec<Dataset> = self
            .deidentification_codes()
            .into_iter()
            .map(|(code, meaning)| {
                Dataset::from_element_iter([
                    DataElement::new(tags::CODE_VALUE, VR::SH, PrimitiveValue::from(code)),
                    DataElement::new(
                        tags::CODING_SCHEME_DESIGNATOR,
                        VR::SH,
                        PrimitiveValue::from("DCM"),
                    ),
                    DataElement::new(tags::CODE_MEANING, VR::LO, PrimitiveValue::from(meaning)),
                ])
            })
            .collect();
        ds.put(DataElement::new(
            tags::DEIDENTIFICATION_METHOD_CODE_SEQUENCE,
            VR::SQ,
            DataSetSequence::from(items),
        ));

        ds.put_private_element(
            0x0013,
            PRIVATE_BLOCK_CREATOR,
            0x01,
            VR::SH,
            PrimitiveValue::from(self.site_id.clone()),
        )
        .map_err(|e| AnonymizerError::StorageError(e.to_string()))?;
        ds.put_private_element(
            0x0013,
            PRIVATE_BLOCK_CREATOR,
            0x03,
            VR::SH,
            PrimitiveValue::from(self.project_name.clone()),
        )
        .map_err(|e| AnonymizerError::StorageError(e.to_string()))?;
        Ok(())
    }

    /// Codes for (0012,0064), in numeric order. 113100 always applies; the
    /// retention options depend on what the script preserves.
    fn deidentification_codes(&self) -> Vec<(&'static str, &'static str)> {
        let mut codes = vec![("113100", "Basic Application Confidentiality Profile")];
        let has_hashdate = [
            Tag(0x0008, 0x0020),
            Tag(0x0008, 0x0021),
            Tag(0x0008, 0x0022),
            Tag(0x0008, 0x0023),
        ]
        .iter()
        .any(|t| matches!(self.script.lookup(*t), Some(ScriptOp::HashDate(_))));
        if has_hashdate {
            codes.push((
                "113107",
                "Retain Longitudinal Temporal Information Modified Dates Option",
            ));
        }
        let keeps_characteristics = matches!(
            self.script.lookup(Tag(0x0010, 0x0040)),
            Some(ScriptOp::Keep)
        ) || matches!(
            self.script.lookup(Tag(0x0010, 0x1010)),
            Some(ScriptOp::Round(_))
        );
        if keeps_characteristics {
            codes.push(("113108", "Retain Patient Characteristics Option"));
        }
        let keeps_device = matches!(
            self.script.lookup(Tag(0x0008, 0x0070)),
            Some(ScriptOp::Keep)
        ) || matches!(
            self.script.lookup(Tag(0x0008, 0x1090)),
            Some(ScriptOp::Keep)
        );
        if keeps_device {
            codes.push(("113109", "Retain Device Identity Option"));
        }
        codes
    }
}

/// Group sweep for unscripted tags: curves, overlays, private groups and
/// the identifying mid-range groups are deleted; everything else is kept.
fn sweep_removes(tag: Tag) -> bool {
    let group = tag.group();
    if group % 2 == 1 {
        return true;
    }
    if (0x5000..=0x5FFF).contains(&group) || (0x6000..=0x6FFF).contains(&group) {
        return true;
    }
    (0x0032..=0x4008).contains(&group)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn date_delta_is_md5_mod_ten_years() {
        let (delta, shifted) = hash_date("20200115", "X123");
        assert!((0..3652).contains(&delta));
        assert_eq!(delta, date_delta_for_patient("X123"));
        assert_eq!(shifted, shift_date("20200115", delta));
        // Deterministic across calls.
        assert_eq!(hash_date("20200115", "X123").0, delta);
    }

    #[test]
    fn invalid_date_or_empty_patient_yields_default() {
        assert_eq!(hash_date("18991231", "X123"), (0, DEFAULT_ANON_DATE.into()));
        assert_eq!(hash_date("not-a-date", "X123"), (0, DEFAULT_ANON_DATE.into()));
        assert_eq!(hash_date("20200115", ""), (0, DEFAULT_ANON_DATE.into()));
    }

    #[test]
    fn ages_round_half_up_keeping_unit() {
        assert_eq!(round_age("012Y", 5), "10Y");
        assert_eq!(round_age("013Y", 5), "15Y");
        assert_eq!(round_age("017Y", 5), "15Y");
        assert_eq!(round_age("018Y", 5), "20Y");
        assert_eq!(round_age("063M", 10), "60M");
        // Padded to even length.
        assert_eq!(round_age("7Y", 5), "05Y");
        // Unparseable values pass through.
        assert_eq!(round_age("unknown", 5), "unknown");
        assert_eq!(round_age("", 5), "");
    }

    #[test]
    fn sweep_removes_private_curve_overlay_and_midrange_groups() {
        assert!(sweep_removes(Tag(0x0009, 0x0010)));
        assert!(sweep_removes(Tag(0x5000, 0x0000)));
        assert!(sweep_removes(Tag(0x6000, 0x3000)));
        assert!(sweep_removes(Tag(0x0032, 0x1030)));
        assert!(sweep_removes(Tag(0x4008, 0x0114)));
        assert!(!sweep_removes(Tag(0x0008, 0x0060)));
        assert!(!sweep_removes(Tag(0x0028, 0x0010)));
        assert!(!sweep_removes(Tag(0x7FE0, 0x0010)));
    }
}
