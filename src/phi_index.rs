//! The PHI index store: bijective PHI <-> pseudonym lookup tables plus the
//! aggregate PHI tree (patients -> studies -> series -> instances). The
//! only shared mutable state of the core; single-writer, multi-reader
//! discipline.

use std::collections::BTreeMap;
use std::fs;
use std::io::{Read, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::dicom_access::{missing_attributes, Dataset, ElementAccess};
use crate::error::{AnonymizerError, Result};
use crate::java_index::JavaIndexedStudy;
use dicom::dictionary_std::tags;

pub const MODEL_VERSION: u32 = 1;
pub const MAX_PATIENTS: usize = 1_000_000;
pub const MODEL_FILENAME: &str = "AnonymizerModel.bin";
const SNAPSHOT_MAGIC: &[u8; 4] = b"ANON";
/// Study date recorded in PHI when the source dataset has none.
pub const DEFAULT_PHI_STUDY_DATE: &str = "19000101";

/// One acquisition run inside a study. Instance membership is kept in the
/// UID lookup table; the series only carries the count.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SeriesRecord {
    pub series_uid: String,
    pub series_desc: String,
    pub modality: String,
    pub instance_count: u32,
}

/// One imaging exam belonging to a PHI patient.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StudyRecord {
    pub source: String,
    pub study_uid: String,
    pub study_date: String,
    pub anon_date_delta: i64,
    pub accession_number: String,
    pub study_desc: String,
    pub target_instance_count: u32,
    pub series: Vec<SeriesRecord>,
}

impl StudyRecord {
    pub fn stored_instance_count(&self) -> u32 {
        self.series.iter().map(|s| s.instance_count).sum()
    }
}

/// Protected health information captured for one patient.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Phi {
    pub patient_name: String,
    pub patient_id: String,
    pub sex: String,
    pub dob: String,
    pub ethnic_group: String,
    pub studies: Vec<StudyRecord>,
}

/// O(1) view of the index cardinalities.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Totals {
    pub patients: u64,
    pub studies: u64,
    pub series: u64,
    pub instances: u64,
}

/// One flattened study row for the PHI CSV export.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhiIndexRecord {
    pub anon_patient_id: String,
    pub anon_patient_name: String,
    pub phi_patient_id: String,
    pub phi_patient_name: String,
    pub date_offset: i64,
    pub anon_accession: String,
    pub phi_accession: String,
    pub anon_study_uid: String,
    pub phi_study_uid: String,
    pub anon_study_date: String,
    pub phi_study_date: String,
    pub num_series: u32,
    pub num_instances: u32,
}

/// Everything behind the writer lock. BTreeMaps keep snapshot serialization
/// deterministic, which makes save/load/save byte-identical.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct IndexState {
    site_id: String,
    uid_root: String,
    patient_id_lookup: BTreeMap<String, String>,
    uid_lookup: BTreeMap<String, String>,
    acc_no_lookup: BTreeMap<String, String>,
    phi_lookup: BTreeMap<String, Phi>,
    patient_counter: u64,
    uid_counter: u64,
    acc_no_counter: u64,
    patients: u64,
    studies: u64,
    series: u64,
    instances: u64,
}

impl IndexState {
    fn new(site_id: &str, uid_root: &str) -> Self {
        let mut state = Self {
            site_id: site_id.to_string(),
            uid_root: uid_root.trim_end_matches('.').to_string(),
            patient_id_lookup: BTreeMap::new(),
            uid_lookup: BTreeMap::new(),
            acc_no_lookup: BTreeMap::new(),
            phi_lookup: BTreeMap::new(),
            patient_counter: 0,
            uid_counter: 0,
            acc_no_counter: 0,
            patients: 0,
            studies: 0,
            series: 0,
            instances: 0,
        };
        // Sentinel patient for empty/missing PatientID: all such instances
        // collapse into "{site_id}-000000".
        let default_id = state.format_anon_patient_id(0);
        state
            .patient_id_lookup
            .insert(String::new(), default_id.clone());
        state.phi_lookup.insert(default_id, Phi::default());
        state
    }

    fn format_anon_patient_id(&self, index: u64) -> String {
        format!("{}-{:06}", self.site_id, index)
    }

    fn next_anon_uid(&mut self, phi_uid: &str) -> String {
        self.uid_counter += 1;
        let anon = format!("{}.{}.{}", self.uid_root, self.site_id, self.uid_counter);
        self.uid_lookup.insert(phi_uid.to_string(), anon.clone());
        anon
    }

    fn next_anon_patient_id(&mut self, phi_patient_id: &str) -> Result<String> {
        if self.patient_id_lookup.len() >= MAX_PATIENTS {
            return Err(AnonymizerError::CapacityExceeded(MAX_PATIENTS));
        }
        self.patient_counter += 1;
        let anon = self.format_anon_patient_id(self.patient_counter);
        self.patient_id_lookup
            .insert(phi_patient_id.to_string(), anon.clone());
        Ok(anon)
    }

    fn next_anon_acc_no(&mut self, phi_acc_no: &str) -> String {
        self.acc_no_counter += 1;
        let anon = self.acc_no_counter.to_string();
        self.acc_no_lookup.insert(phi_acc_no.to_string(), anon.clone());
        anon
    }
}

/// The PHI index store. All operations are thread-safe; identifier
/// allocation is strictly monotonic under the writer lock.
pub struct PhiIndex {
    state: RwLock<IndexState>,
    dirty: AtomicBool,
}

impl PhiIndex {
    pub fn new(site_id: &str, uid_root: &str) -> Self {
        Self {
            state: RwLock::new(IndexState::new(site_id, uid_root)),
            dirty: AtomicBool::new(false),
        }
    }

    /// The reserved anon patient id for instances without a PatientID.
    pub fn default_anon_patient_id(&self) -> String {
        let state = self.state.read().unwrap();
        state.format_anon_patient_id(0)
    }

    pub fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Release);
    }

    /// Clears and returns the dirty flag; the autosave task snapshots when
    /// this was set.
    pub fn take_dirty(&self) -> bool {
        self.dirty.swap(false, Ordering::AcqRel)
    }

    // --- lookup tables ---

    pub fn get_anon_patient_id(&self, phi_patient_id: &str) -> Option<String> {
        self.state
            .read()
            .unwrap()
            .patient_id_lookup
            .get(phi_patient_id)
            .cloned()
    }

    /// Returns the existing mapping or allocates the next anon patient id.
    pub fn get_next_anon_patient_id(&self, phi_patient_id: &str) -> Result<String> {
        let mut state = self.state.write().unwrap();
        if let Some(existing) = state.patient_id_lookup.get(phi_patient_id) {
            return Ok(existing.clone());
        }
        self.mark_dirty();
        state.next_anon_patient_id(phi_patient_id)
    }

    pub fn get_anon_uid(&self, phi_uid: &str) -> Option<String> {
        self.state.read().unwrap().uid_lookup.get(phi_uid).cloned()
    }

    pub fn get_next_anon_uid(&self, phi_uid: &str) -> String {
        let mut state = self.state.write().unwrap();
        if let Some(existing) = state.uid_lookup.get(phi_uid) {
            return existing.clone();
        }
        self.mark_dirty();
        state.next_anon_uid(phi_uid)
    }

    pub fn get_anon_acc_no(&self, phi_acc_no: &str) -> Option<String> {
        self.state
            .read()
            .unwrap()
            .acc_no_lookup
            .get(phi_acc_no)
            .cloned()
    }

    pub fn get_next_anon_acc_no(&self, phi_acc_no: &str) -> String {
        let mut state = self.state.write().unwrap();
        if let Some(existing) = state.acc_no_lookup.get(phi_acc_no) {
            return existing.clone();
        }
        self.mark_dirty();
        state.next_anon_acc_no(phi_acc_no)
    }

    pub fn uid_received(&self, phi_uid: &str) -> bool {
        self.state.read().unwrap().uid_lookup.contains_key(phi_uid)
    }

    /// Drops a UID mapping after a failed anonymization so the instance can
    /// be re-imported later. Leaves the rest of the patient's PHI intact.
    pub fn remove_uid(&self, phi_uid: &str) {
        let mut state = self.state.write().unwrap();
        if state.uid_lookup.remove(phi_uid).is_some() {
            self.mark_dirty();
            debug!(phi_uid, "removed uid mapping");
        }
    }

    pub fn patient_id_count(&self) -> usize {
        self.state.read().unwrap().patient_id_lookup.len()
    }

    pub fn uid_count(&self) -> usize {
        self.state.read().unwrap().uid_lookup.len()
    }

    pub fn acc_no_count(&self) -> usize {
        self.state.read().unwrap().acc_no_lookup.len()
    }

    // --- PHI tree ---

    pub fn get_totals(&self) -> Totals {
        let state = self.state.read().unwrap();
        Totals {
            patients: state.patients,
            studies: state.studies,
            series: state.series,
            instances: state.instances,
        }
    }

    pub fn get_phi(&self, anon_patient_id: &str) -> Option<Phi> {
        self.state
            .read()
            .unwrap()
            .phi_lookup
            .get(anon_patient_id)
            .cloned()
    }

    pub fn get_phi_name(&self, anon_patient_id: &str) -> Option<String> {
        self.state
            .read()
            .unwrap()
            .phi_lookup
            .get(anon_patient_id)
            .map(|phi| phi.patient_name.clone())
    }

    /// Walks the dataset once and upserts the PHI -> Study -> Series ->
    /// Instance path, allocating the instance UID mapping. No-op with
    /// `AlreadyPresent` when the SOP instance UID is already known.
    pub fn capture_phi(&self, source: &str, ds: &Dataset, date_delta: i64) -> Result<()> {
        let missing = missing_attributes(ds);
        if !missing.is_empty() {
            return Err(AnonymizerError::MissingAttributes(missing));
        }

        let required = |tag| {
            ds.element_trimmed(tag)
                .ok_or_else(|| AnonymizerError::CapturePhiError("required attribute vanished".into()))
        };
        let study_uid = required(tags::STUDY_INSTANCE_UID)?;
        let series_uid = required(tags::SERIES_INSTANCE_UID)?;
        let sop_uid = required(tags::SOP_INSTANCE_UID)?;
        let phi_ptid = ds.element_trimmed(tags::PATIENT_ID).unwrap_or_default();

        let mut state = self.state.write().unwrap();

        if state.uid_lookup.contains_key(&sop_uid) {
            return Err(AnonymizerError::AlreadyPresent);
        }

        // Resolve or allocate the anon patient id.
        let anon_ptid = match state.patient_id_lookup.get(&phi_ptid) {
            Some(existing) => existing.clone(),
            None => {
                let anon = state.next_anon_patient_id(&phi_ptid)?;
                state.phi_lookup.insert(
                    anon.clone(),
                    Phi {
                        patient_name: ds
                            .element_trimmed(tags::PATIENT_NAME)
                            .unwrap_or_default(),
                        patient_id: phi_ptid.clone(),
                        sex: ds.element_trimmed(tags::PATIENT_SEX).unwrap_or_default(),
                        dob: ds
                            .element_trimmed(tags::PATIENT_BIRTH_DATE)
                            .unwrap_or_default(),
                        ethnic_group: ds
                            .element_trimmed(tags::ETHNIC_GROUP)
                            .unwrap_or_default(),
                        studies: Vec::new(),
                    },
                );
                state.patients += 1;
                anon
            }
        };

        // Allocate hierarchy UID mappings before borrowing the PHI record.
        let new_study = !state.uid_lookup.contains_key(&study_uid);
        if new_study {
            state.next_anon_uid(&study_uid);
        }
        let new_series = !state.uid_lookup.contains_key(&series_uid);
        if new_series {
            state.next_anon_uid(&series_uid);
        }
        state.next_anon_uid(&sop_uid);

        let study_date = ds
            .element_trimmed(tags::STUDY_DATE)
            .unwrap_or_else(|| DEFAULT_PHI_STUDY_DATE.to_string());
        let accession = ds
            .element_trimmed(tags::ACCESSION_NUMBER)
            .unwrap_or_default();
        let study_desc = ds
            .element_trimmed(tags::STUDY_DESCRIPTION)
            .unwrap_or_default();
        let series_desc = ds
            .element_trimmed(tags::SERIES_DESCRIPTION)
            .unwrap_or_default();
        let modality = ds.element_trimmed(tags::MODALITY).unwrap_or_default();

        let (new_study_added, new_series_added) = {
            let phi = state.phi_lookup.get_mut(&anon_ptid).ok_or_else(|| {
                AnonymizerError::CapturePhiError(format!(
                    "anon patient id {anon_ptid} missing from phi lookup"
                ))
            })?;

            match phi.studies.iter_mut().find(|s| s.study_uid == study_uid) {
                None => {
                    phi.studies.push(StudyRecord {
                        source: source.to_string(),
                        study_uid: study_uid.clone(),
                        study_date,
                        anon_date_delta: date_delta,
                        accession_number: accession,
                        study_desc,
                        target_instance_count: 0,
                        series: vec![SeriesRecord {
                            series_uid,
                            series_desc,
                            modality,
                            instance_count: 1,
                        }],
                    });
                    (true, true)
                }
                Some(study) => {
                    match study.series.iter_mut().find(|s| s.series_uid == series_uid) {
                        None => {
                            study.series.push(SeriesRecord {
                                series_uid,
                                series_desc,
                                modality,
                                instance_count: 1,
                            });
                            (false, true)
                        }
                        Some(series) => {
                            series.instance_count += 1;
                            (false, false)
                        }
                    }
                }
            }
        };
        if new_study_added {
            state.studies += 1;
        }
        if new_series_added {
            state.series += 1;
        }
        state.instances += 1;

        self.mark_dirty();
        Ok(())
    }

    // --- reconciliation queries ---

    fn with_study<R>(
        &self,
        phi_patient_id: &str,
        study_uid: &str,
        f: impl FnOnce(&StudyRecord) -> R,
    ) -> Option<R> {
        let state = self.state.read().unwrap();
        let anon = state.patient_id_lookup.get(phi_patient_id)?;
        let phi = state.phi_lookup.get(anon)?;
        phi.studies.iter().find(|s| s.study_uid == study_uid).map(f)
    }

    pub fn get_stored_instance_count(&self, phi_patient_id: &str, study_uid: &str) -> u32 {
        self.with_study(phi_patient_id, study_uid, |s| s.stored_instance_count())
            .unwrap_or(0)
    }

    /// Difference between the target and the stored instance count for a
    /// study. Latches `target_instance_count` on the study record so a later
    /// `study_imported` check can detect completion.
    pub fn get_pending_instance_count(
        &self,
        phi_patient_id: &str,
        study_uid: &str,
        target_count: u32,
    ) -> u32 {
        let mut state = self.state.write().unwrap();
        let Some(anon) = state.patient_id_lookup.get(phi_patient_id).cloned() else {
            return target_count;
        };
        let Some(phi) = state.phi_lookup.get_mut(&anon) else {
            return target_count;
        };
        match phi.studies.iter_mut().find(|s| s.study_uid == study_uid) {
            Some(study) => {
                study.target_instance_count = target_count;
                target_count.saturating_sub(study.stored_instance_count())
            }
            None => target_count,
        }
    }

    pub fn series_complete(
        &self,
        phi_patient_id: &str,
        study_uid: &str,
        series_uid: &str,
        target_count: u32,
    ) -> bool {
        self.with_study(phi_patient_id, study_uid, |study| {
            study
                .series
                .iter()
                .find(|s| s.series_uid == series_uid)
                .is_some_and(|s| s.instance_count >= target_count)
        })
        .unwrap_or(false)
    }

    /// True once a study's stored instances reach the latched target count.
    /// False while the target has not been set by an import process.
    pub fn study_imported(&self, phi_patient_id: &str, study_uid: &str) -> bool {
        self.with_study(phi_patient_id, study_uid, |study| {
            study.target_instance_count != 0
                && study.stored_instance_count() >= study.target_instance_count
        })
        .unwrap_or(false)
    }

    // --- bulk import of a prior site's index ---

    /// Seeds all three lookup tables from a Java Anonymizer index export,
    /// then advances each counter past the largest imported suffix so later
    /// allocations can never collide with imported identifiers.
    pub fn process_java_phi_studies(&self, rows: &[JavaIndexedStudy]) {
        info!(count = rows.len(), "processing prior Java index studies");
        let mut state = self.state.write().unwrap();

        for row in rows {
            if !row.phi_accession.is_empty() {
                state
                    .acc_no_lookup
                    .insert(row.phi_accession.clone(), row.anon_accession.clone());
            }
            state
                .uid_lookup
                .insert(row.phi_study_uid.clone(), row.anon_study_uid.clone());

            let study = StudyRecord {
                source: "Java Index File".to_string(),
                study_uid: row.phi_study_uid.clone(),
                study_date: row.phi_study_date.clone(),
                anon_date_delta: row.date_offset,
                accession_number: row.phi_accession.clone(),
                study_desc: String::new(),
                target_instance_count: 0,
                series: Vec::new(),
            };

            match state.phi_lookup.get_mut(&row.anon_patient_id) {
                Some(phi) => phi.studies.push(study),
                None => {
                    state
                        .patient_id_lookup
                        .insert(row.phi_patient_id.clone(), row.anon_patient_id.clone());
                    state.phi_lookup.insert(
                        row.anon_patient_id.clone(),
                        Phi {
                            patient_name: row.phi_patient_name.clone(),
                            patient_id: row.phi_patient_id.clone(),
                            studies: vec![study],
                            ..Phi::default()
                        },
                    );
                    state.patients += 1;
                }
            }
            state.studies += 1;
        }

        // Advance counters past every imported numeric suffix.
        let max_patient = state
            .patient_id_lookup
            .values()
            .filter_map(|anon| anon.rsplit('-').next()?.parse::<u64>().ok())
            .max()
            .unwrap_or(0);
        let max_uid = state
            .uid_lookup
            .values()
            .filter_map(|anon| anon.rsplit('.').next()?.parse::<u64>().ok())
            .max()
            .unwrap_or(0);
        let max_acc = state
            .acc_no_lookup
            .values()
            .filter_map(|anon| anon.parse::<u64>().ok())
            .max()
            .unwrap_or(0);
        state.patient_counter = state.patient_counter.max(max_patient);
        state.uid_counter = state.uid_counter.max(max_uid);
        state.acc_no_counter = state.acc_no_counter.max(max_acc);

        self.mark_dirty();
    }

    // --- CSV view ---

    /// One row per imported study, ordered by anon patient id.
    pub fn phi_index_records(&self) -> Vec<PhiIndexRecord> {
        let state = self.state.read().unwrap();
        let mut records = Vec::new();
        for (anon_ptid, phi) in &state.phi_lookup {
            for study in &phi.studies {
                let anon_study_uid = state
                    .uid_lookup
                    .get(&study.study_uid)
                    .cloned()
                    .unwrap_or_default();
                let anon_accession = state
                    .acc_no_lookup
                    .get(&study.accession_number)
                    .cloned()
                    .unwrap_or_default();
                records.push(PhiIndexRecord {
                    anon_patient_id: anon_ptid.clone(),
                    anon_patient_name: anon_ptid.clone(),
                    phi_patient_id: phi.patient_id.clone(),
                    phi_patient_name: phi.patient_name.clone(),
                    date_offset: study.anon_date_delta,
                    anon_accession,
                    phi_accession: study.accession_number.clone(),
                    anon_study_uid,
                    phi_study_uid: study.study_uid.clone(),
                    anon_study_date: shift_date(&study.study_date, study.anon_date_delta),
                    phi_study_date: study.study_date.clone(),
                    num_series: study.series.len() as u32,
                    num_instances: study.stored_instance_count(),
                });
            }
        }
        records
    }

    // --- snapshot ---

    /// Serializes the index to `path`: magic, version header, then the
    /// bincode-encoded state. Write is atomic (temp file + rename).
    pub fn save(&self, path: &Path) -> Result<()> {
        let state = self.state.read().unwrap();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| AnonymizerError::io(parent, e))?;
        }
        let tmp = path.with_extension("bin.tmp");
        {
            let mut file = fs::File::create(&tmp).map_err(|e| AnonymizerError::io(&tmp, e))?;
            file.write_all(SNAPSHOT_MAGIC)
                .map_err(|e| AnonymizerError::io(&tmp, e))?;
            bincode::serialize_into(&mut file, &MODEL_VERSION)
                .map_err(|e| AnonymizerError::StorageError(e.to_string()))?;
            bincode::serialize_into(&mut file, &*state)
                .map_err(|e| AnonymizerError::StorageError(e.to_string()))?;
        }
        fs::rename(&tmp, path).map_err(|e| AnonymizerError::io(path, e))?;
        debug!(path = %path.display(), "anonymizer model saved");
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let mut file = fs::File::open(path).map_err(|e| AnonymizerError::io(path, e))?;
        let mut magic = [0u8; 4];
        file.read_exact(&mut magic)
            .map_err(|e| AnonymizerError::io(path, e))?;
        if &magic != SNAPSHOT_MAGIC {
            return Err(AnonymizerError::InvalidDicom(format!(
                "{} is not an anonymizer model snapshot",
                path.display()
            )));
        }
        let version: u32 = bincode::deserialize_from(&mut file)
            .map_err(|e| AnonymizerError::StorageError(e.to_string()))?;
        if version != MODEL_VERSION {
            return Err(AnonymizerError::ModelVersionMismatch {
                found: version,
                expected: MODEL_VERSION,
            });
        }
        let state: IndexState = bincode::deserialize_from(&mut file)
            .map_err(|e| AnonymizerError::StorageError(e.to_string()))?;
        info!(
            path = %path.display(),
            patients = state.patients,
            instances = state.instances,
            "anonymizer model loaded"
        );
        Ok(Self {
            state: RwLock::new(state),
            dirty: AtomicBool::new(false),
        })
    }

    /// Loads an existing snapshot or creates a fresh index.
    pub fn load_or_new(path: &Path, site_id: &str, uid_root: &str) -> Result<Self> {
        if path.exists() {
            PhiIndex::load(path)
        } else {
            warn!(path = %path.display(), "no model snapshot found, starting empty");
            Ok(PhiIndex::new(site_id, uid_root))
        }
    }
}

/// Shifts a `YYYYMMDD` date by `delta` days; passes invalid input through.
pub fn shift_date(date: &str, delta: i64) -> String {
    match chrono::NaiveDate::parse_from_str(date, "%Y%m%d") {
        Ok(d) => d
            .checked_add_signed(chrono::Duration::days(delta))
            .map(|d| d.format("%Y%m%d").to_string())
            .unwrap_or_else(|| date.to_string()),
        Err(_) => date.to_string(),
    }
}
