//! The retrieval orchestrator: queries a remote peer for study structure,
//! drives C-MOVE at study, series or instance level, reconciles what
//! actually arrived against the PHI index, and retries the gaps at
//! instance level. Handles asynchronous, slow and partially compliant
//! peers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::unbounded;
use dicom::core::{DataElement, PrimitiveValue, VR};
use dicom::dictionary_std::tags;
use tracing::{debug, info, warn};

use crate::config::{ProjectModel, STUDY_ROOT_FIND, STUDY_ROOT_MOVE};
use crate::dicom_access::{Dataset, ElementAccess};
use crate::dimse::{self, DicomClient};
use crate::error::{AnonymizerError, Result};
use crate::hierarchy::{
    status_is_pending, InstanceUidHierarchy, SeriesUidHierarchy, StudyUidHierarchy, C_SUCCESS,
    C_WARNING,
};
use crate::ingest::IngestQueue;
use crate::phi_index::PhiIndex;

/// Concurrent study moves per request.
const STUDY_MOVE_POOL_SIZE: usize = 2;

/// Query/retrieve level of a bulk move.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MoveLevel {
    Study,
    Series,
    Instance,
}

impl MoveLevel {
    /// The level used for the single automatic retry: gaps are re-fetched
    /// as individual instances so only the missing parts travel again.
    fn retry_level(self) -> Option<MoveLevel> {
        match self {
            MoveLevel::Study | MoveLevel::Series => Some(MoveLevel::Instance),
            MoveLevel::Instance => None,
        }
    }
}

/// One study selected for import: its UID and the patient it belongs to,
/// as reported by the peer.
#[derive(Debug, Clone)]
pub struct StudySelection {
    pub study_uid: String,
    pub patient_id: String,
}

pub struct MoveStudiesRequest {
    /// Name of the remote node to move from.
    pub source: String,
    /// AE title of the move destination (normally the local SCP).
    pub dest_aet: String,
    pub level: MoveLevel,
    pub studies: Vec<StudySelection>,
}

/// A study-level query match carrying the attributes an importable study
/// must report.
#[derive(Debug, Clone)]
pub struct StudyMatch {
    pub patient_id: String,
    pub patient_name: String,
    pub study_uid: String,
    pub study_date: String,
    pub accession_number: String,
    pub study_description: String,
    pub modalities_in_study: String,
    pub num_instances: u32,
}

/// Search parameters for a study-level C-FIND.
#[derive(Debug, Clone, Default)]
pub struct StudyQuery {
    pub patient_name: String,
    pub patient_id: String,
    pub accession_number: String,
    pub study_date: String,
    pub modality: String,
}

pub struct Retriever {
    model: Arc<ProjectModel>,
    client: DicomClient,
    index: Arc<PhiIndex>,
    queue: IngestQueue,
    abort: Arc<AtomicBool>,
}

impl Retriever {
    pub fn new(
        model: Arc<ProjectModel>,
        index: Arc<PhiIndex>,
        queue: IngestQueue,
    ) -> Self {
        let client = DicomClient::new(&model.local.aet, model.network_timeouts);
        Self {
            model,
            client,
            index,
            queue,
            abort: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Cooperative cancellation: in-flight associations are aborted and
    /// pending studies are not dispatched.
    pub fn abort_move(&self) {
        info!("move abort requested");
        self.abort.store(true, Ordering::Release);
    }

    fn find_contexts() -> Vec<(String, Vec<String>)> {
        vec![(STUDY_ROOT_FIND.to_string(), Vec::new())]
    }

    fn move_contexts() -> Vec<(String, Vec<String>)> {
        vec![(STUDY_ROOT_MOVE.to_string(), Vec::new())]
    }

    /// Study-level C-FIND against a named remote. Matches missing the
    /// required result attributes are dropped.
    pub fn find_studies(&self, source: &str, query: &StudyQuery) -> Result<Vec<StudyMatch>> {
        let node = self.model.remote(source)?.clone();
        let mut assoc = self.client.connect(&node, &Self::find_contexts())?;
        let pc_id = dimse::accepted_context(&assoc)?;

        let identifier = study_query_identifier(query);
        let results = dimse::find(
            &mut assoc,
            pc_id,
            STUDY_ROOT_FIND,
            &identifier,
            1,
            &self.abort,
        );
        let _ = assoc.release();
        let results = results?;

        let mut matches = Vec::new();
        for ds in results {
            let required = [
                tags::PATIENT_ID,
                tags::PATIENT_NAME,
                tags::STUDY_DATE,
                tags::MODALITIES_IN_STUDY,
                tags::NUMBER_OF_STUDY_RELATED_INSTANCES,
                tags::STUDY_INSTANCE_UID,
            ];
            if required.iter().any(|t| ds.element_trimmed(*t).is_none()) {
                warn!("study query result missing required attributes, skipped");
                continue;
            }
            matches.push(StudyMatch {
                patient_id: ds.element_trimmed(tags::PATIENT_ID).unwrap(),
                patient_name: ds.element_trimmed(tags::PATIENT_NAME).unwrap(),
                study_uid: ds.element_trimmed(tags::STUDY_INSTANCE_UID).unwrap(),
                study_date: ds.element_trimmed(tags::STUDY_DATE).unwrap(),
                accession_number: ds
                    .element_trimmed(tags::ACCESSION_NUMBER)
                    .unwrap_or_default(),
                study_description: ds
                    .element_trimmed(tags::STUDY_DESCRIPTION)
                    .unwrap_or_default(),
                modalities_in_study: ds.element_trimmed(tags::MODALITIES_IN_STUDY).unwrap(),
                num_instances: ds
                    .element_u32(tags::NUMBER_OF_STUDY_RELATED_INSTANCES)
                    .unwrap_or(0),
            });
        }
        info!(count = matches.len(), source, "study query complete");
        Ok(matches)
    }

    /// Probes the peer for the series (and optionally instance) structure
    /// of one study. Series outside the configured modalities or storage
    /// classes are skipped.
    pub fn probe_study_hierarchy(
        &self,
        source: &str,
        selection: &StudySelection,
        instance_level: bool,
    ) -> Result<StudyUidHierarchy> {
        let node = self.model.remote(source)?.clone();
        let mut study = StudyUidHierarchy::new(&selection.study_uid, &selection.patient_id);

        let mut assoc = self.client.connect(&node, &Self::find_contexts())?;
        let pc_id = dimse::accepted_context(&assoc)?;

        let result = self.probe_into(&mut assoc, pc_id, &mut study, instance_level);
        match &result {
            Err(AnonymizerError::Cancelled) => {
                let _ = assoc.abort();
            }
            _ => {
                let _ = assoc.release();
            }
        }
        if let Err(e) = result {
            study.last_error_msg = Some(e.to_string());
            return Err(e);
        }

        study.pending_instances = study.instance_count();
        Ok(study)
    }

    fn probe_into(
        &self,
        assoc: &mut dicom_ul::ClientAssociation<std::net::TcpStream>,
        pc_id: u8,
        study: &mut StudyUidHierarchy,
        instance_level: bool,
    ) -> Result<()> {
        let mut message_id = 1u16;
        // Series-level query first.
        let identifier = series_query_identifier(&study.uid);
        let results =
            dimse::find(assoc, pc_id, STUDY_ROOT_FIND, &identifier, message_id, &self.abort)?;

        for ds in results {
            let Some(series_uid) = ds.element_trimmed(tags::SERIES_INSTANCE_UID) else {
                warn!(study = %study.uid, "series result without SeriesInstanceUID, skipped");
                continue;
            };
            if ds.element_trimmed(tags::STUDY_INSTANCE_UID).as_deref() != Some(study.uid.as_str())
            {
                warn!(series = %series_uid, "series result for a different study, skipped");
                continue;
            }
            let modality = ds.element_trimmed(tags::MODALITY);
            if let Some(modality) = &modality {
                if !self.model.modalities.contains(modality) {
                    debug!(series = %series_uid, %modality, "series modality filtered out");
                    continue;
                }
            }
            // Some peers report SOPClassUID at series level when uniform.
            let sop_class = ds.element_trimmed(tags::SOP_CLASS_UID);
            if let Some(sop_class) = &sop_class {
                if !self.model.storage_classes.contains(sop_class) {
                    debug!(series = %series_uid, "series storage class filtered out");
                    continue;
                }
            }
            let instance_count = ds
                .element_u32(tags::NUMBER_OF_SERIES_RELATED_INSTANCES)
                .unwrap_or(0);
            if !instance_level && instance_count == 0 {
                // Without per-series counts a study/series level move has
                // no completion criterion.
                return Err(AnonymizerError::Dimse(format!(
                    "peer did not return NumberOfSeriesRelatedInstances for series {series_uid}"
                )));
            }
            let mut series = SeriesUidHierarchy::new(&series_uid);
            series.number = ds.element_u32(tags::SERIES_NUMBER);
            series.modality = modality;
            series.sop_class_uid = sop_class;
            series.description = ds.element_trimmed(tags::SERIES_DESCRIPTION);
            series.instance_count = instance_count;
            study.series.insert(series_uid, series);
        }

        if study.series.is_empty() {
            return Err(AnonymizerError::Dimse(
                "no series in study matching the project modalities".into(),
            ));
        }

        if instance_level {
            let series_uids: Vec<String> = study.series.keys().cloned().collect();
            for series_uid in series_uids {
                message_id = message_id.wrapping_add(1);
                let identifier = instance_query_identifier(&study.uid, &series_uid);
                let results = dimse::find(
                    assoc,
                    pc_id,
                    STUDY_ROOT_FIND,
                    &identifier,
                    message_id,
                    &self.abort,
                )?;
                let series = study.series.get_mut(&series_uid).unwrap();
                for ds in results {
                    let Some(sop_uid) = ds.element_trimmed(tags::SOP_INSTANCE_UID) else {
                        continue;
                    };
                    if ds.element_trimmed(tags::SERIES_INSTANCE_UID).as_deref()
                        != Some(series_uid.as_str())
                    {
                        continue;
                    }
                    series.instances.insert(
                        sop_uid.clone(),
                        InstanceUidHierarchy {
                            uid: sop_uid,
                            number: ds.element_u32(tags::INSTANCE_NUMBER),
                        },
                    );
                }
                // The actual instance list overrules the series-level count.
                series.instance_count = series.instances.len() as u32;
            }
        }
        Ok(())
    }

    /// Moves the selected studies from the peer to `dest_aet`, at the
    /// requested level, with up to one automatic step-down retry for
    /// whatever did not arrive. Returns the final per-study hierarchies
    /// with counters and error messages.
    pub fn move_studies(&self, request: &MoveStudiesRequest) -> Vec<StudyUidHierarchy> {
        self.abort.store(false, Ordering::Release);
        info!(
            source = %request.source,
            dest = %request.dest_aet,
            level = ?request.level,
            studies = request.studies.len(),
            "bulk move started"
        );

        let (task_tx, task_rx) = unbounded::<StudySelection>();
        let (done_tx, done_rx) = unbounded::<StudyUidHierarchy>();
        for selection in &request.studies {
            let _ = task_tx.send(selection.clone());
        }
        drop(task_tx);

        thread::scope(|scope| {
            for _ in 0..STUDY_MOVE_POOL_SIZE {
                let task_rx = task_rx.clone();
                let done_tx = done_tx.clone();
                scope.spawn(move || {
                    while let Ok(selection) = task_rx.recv() {
                        let study = if self.abort.load(Ordering::Acquire) {
                            let mut study =
                                StudyUidHierarchy::new(&selection.study_uid, &selection.patient_id);
                            study.last_error_msg = Some(AnonymizerError::Cancelled.to_string());
                            study
                        } else {
                            self.move_one_study(request, &selection)
                        };
                        let _ = done_tx.send(study);
                    }
                });
            }
            drop(done_tx);
        });

        let results: Vec<StudyUidHierarchy> = done_rx.iter().collect();
        info!("bulk move finished");
        results
    }

    fn move_one_study(
        &self,
        request: &MoveStudiesRequest,
        selection: &StudySelection,
    ) -> StudyUidHierarchy {
        let instance_level = request.level == MoveLevel::Instance;
        let mut study = match self.probe_study_hierarchy(&request.source, selection, instance_level)
        {
            Ok(study) => study,
            Err(e) => {
                let mut study =
                    StudyUidHierarchy::new(&selection.study_uid, &selection.patient_id);
                study.last_error_msg = Some(e.to_string());
                return study;
            }
        };

        let mut level = request.level;
        let mut step_downs_left = 1;
        loop {
            match self.move_study_at_level(request, &mut study, level) {
                Ok(()) => {}
                Err(e) => {
                    study.last_error_msg = Some(e.to_string());
                    if matches!(e, AnonymizerError::Cancelled) {
                        return study;
                    }
                }
            }

            if study.pending_instances == 0 || step_downs_left == 0 {
                break;
            }
            let Some(next) = level.retry_level() else {
                break;
            };
            step_downs_left -= 1;

            // The residue needs instance identities before an
            // instance-level retry can target it.
            if next == MoveLevel::Instance && study.instances().next().is_none() {
                match self.probe_study_hierarchy(&request.source, selection, true) {
                    Ok(probed) => {
                        study.series = probed.series;
                    }
                    Err(e) => {
                        study.last_error_msg = Some(e.to_string());
                        break;
                    }
                }
            }
            info!(study = %study.uid, from = ?level, to = ?next, "stepping move level down");
            level = next;
        }

        if study.pending_instances == 0 {
            study.last_error_msg = None;
        }
        study
    }

    fn move_study_at_level(
        &self,
        request: &MoveStudiesRequest,
        study: &mut StudyUidHierarchy,
        level: MoveLevel,
    ) -> Result<()> {
        let node = self.model.remote(&request.source)?.clone();
        let target_count = study.instance_count();
        if target_count == 0 {
            return Err(AnonymizerError::Dimse("no instances in study".into()));
        }

        // Pre-reconciliation: skip what local storage already holds.
        study.pending_instances =
            self.index
                .get_pending_instance_count(&study.patient_id, &study.uid, target_count);
        if study.pending_instances == 0 {
            debug!(study = %study.uid, "all instances already imported");
            return Ok(());
        }

        let mut assoc = self.client.connect(&node, &Self::move_contexts())?;
        let pc_id = dimse::accepted_context(&assoc)?;
        let mut message_id = 1u16;

        let result = (|| -> Result<()> {
            match level {
                MoveLevel::Study => {
                    let identifier = move_identifier_study(&study.uid);
                    self.issue_move(&mut assoc, pc_id, &identifier, request, study, &mut message_id)?;
                }
                MoveLevel::Series => {
                    let series_uids: Vec<String> = study.series.keys().cloned().collect();
                    for series_uid in series_uids {
                        let (count, complete) = {
                            let series = &study.series[&series_uid];
                            (
                                series.instance_count,
                                self.index.series_complete(
                                    &study.patient_id,
                                    &study.uid,
                                    &series_uid,
                                    series.instance_count,
                                ),
                            )
                        };
                        if count == 0 || complete {
                            debug!(series = %series_uid, "series skipped (empty or complete)");
                            continue;
                        }
                        let identifier = move_identifier_series(&study.uid, &series_uid);
                        self.issue_move(
                            &mut assoc,
                            pc_id,
                            &identifier,
                            request,
                            study,
                            &mut message_id,
                        )?;
                    }
                }
                MoveLevel::Instance => {
                    let instance_uids: Vec<(String, String)> = study
                        .series
                        .values()
                        .flat_map(|s| {
                            s.instances
                                .keys()
                                .map(|uid| (s.uid.clone(), uid.clone()))
                                .collect::<Vec<_>>()
                        })
                        .collect();
                    for (series_uid, sop_uid) in instance_uids {
                        if self.index.uid_received(&sop_uid) {
                            continue;
                        }
                        let identifier =
                            move_identifier_instance(&study.uid, &series_uid, &sop_uid);
                        self.issue_single_instance_move(
                            &mut assoc,
                            pc_id,
                            &identifier,
                            request,
                            study,
                            &mut message_id,
                        )?;
                    }
                }
            }
            Ok(())
        })();

        match &result {
            Err(AnonymizerError::Cancelled) => {
                let _ = assoc.abort();
            }
            _ => {
                let _ = assoc.release();
            }
        }
        result?;

        // Post-reconciliation: wait for the ingest pipeline to drain this
        // study's instances, with a grace period that resets on progress.
        self.await_import(study, target_count)
    }

    fn issue_move(
        &self,
        assoc: &mut dicom_ul::ClientAssociation<std::net::TcpStream>,
        pc_id: u8,
        identifier: &Dataset,
        request: &MoveStudiesRequest,
        study: &mut StudyUidHierarchy,
        message_id: &mut u16,
    ) -> Result<()> {
        let id = *message_id;
        *message_id = message_id.wrapping_add(1);
        let sub_ops = &mut study.sub_ops;
        let status = dimse::move_request(
            assoc,
            pc_id,
            STUDY_ROOT_MOVE,
            identifier,
            &request.dest_aet,
            id,
            &self.abort,
            |_status, command| {
                sub_ops.update_from_status(command);
            },
        )?;
        check_move_status(status)
    }

    /// Single-instance moves report one sub-operation each; their counters
    /// accumulate onto the study instead of replacing it.
    fn issue_single_instance_move(
        &self,
        assoc: &mut dicom_ul::ClientAssociation<std::net::TcpStream>,
        pc_id: u8,
        identifier: &Dataset,
        request: &MoveStudiesRequest,
        study: &mut StudyUidHierarchy,
        message_id: &mut u16,
    ) -> Result<()> {
        let id = *message_id;
        *message_id = message_id.wrapping_add(1);
        let sub_ops = &mut study.sub_ops;
        let status = dimse::move_request(
            assoc,
            pc_id,
            STUDY_ROOT_MOVE,
            identifier,
            &request.dest_aet,
            id,
            &self.abort,
            |status, command| {
                if !status_is_pending(status) {
                    sub_ops.accumulate_single(command, status);
                }
            },
        )?;
        check_move_status(status)
    }

    /// Waits until every pending instance of the study has been imported,
    /// the ingest queue is idle, or the network grace period elapses with
    /// no progress.
    fn await_import(&self, study: &mut StudyUidHierarchy, target_count: u32) -> Result<()> {
        let grace = Duration::from_secs(self.model.network_timeouts.network);
        let mut last_progress = Instant::now();
        let mut prev_pending = study.pending_instances;

        loop {
            if self.abort.load(Ordering::Acquire) {
                return Err(AnonymizerError::Cancelled);
            }
            study.pending_instances = self.index.get_pending_instance_count(
                &study.patient_id,
                &study.uid,
                target_count,
            );
            if study.pending_instances == 0 {
                info!(study = %study.uid, "all instances imported");
                return Ok(());
            }
            if study.pending_instances != prev_pending {
                prev_pending = study.pending_instances;
                last_progress = Instant::now();
            }
            if last_progress.elapsed() > grace && self.queue.is_empty() {
                return Err(AnonymizerError::NetworkTimeout(format!(
                    "study {} import stalled with {} pending",
                    study.uid, study.pending_instances
                )));
            }
            thread::sleep(Duration::from_secs(1));
        }
    }
}

fn check_move_status(status: u16) -> Result<()> {
    if status != C_SUCCESS && status != C_WARNING && !status_is_pending(status) {
        return Err(AnonymizerError::Dimse(format!(
            "C-MOVE failed with status 0x{status:04X}"
        )));
    }
    Ok(())
}

fn study_query_identifier(query: &StudyQuery) -> Dataset {
    Dataset::from_element_iter([
        DataElement::new(
            tags::QUERY_RETRIEVE_LEVEL,
            VR::CS,
            PrimitiveValue::from("STUDY"),
        ),
        DataElement::new(
            tags::PATIENT_NAME,
            VR::PN,
            PrimitiveValue::from(query.patient_name.as_str()),
        ),
        DataElement::new(
            tags::PATIENT_ID,
            VR::LO,
            PrimitiveValue::from(query.patient_id.as_str()),
        ),
        DataElement::new(
            tags::ACCESSION_NUMBER,
            VR::SH,
            PrimitiveValue::from(query.accession_number.as_str()),
        ),
        DataElement::new(
            tags::STUDY_DATE,
            VR::DA,
            PrimitiveValue::from(query.study_date.as_str()),
        ),
        DataElement::new(
            tags::MODALITIES_IN_STUDY,
            VR::CS,
            PrimitiveValue::from(query.modality.as_str()),
        ),
        DataElement::new(tags::STUDY_DESCRIPTION, VR::LO, PrimitiveValue::Empty),
        DataElement::new(tags::NUMBER_OF_STUDY_RELATED_SERIES, VR::IS, PrimitiveValue::Empty),
        DataElement::new(tags::NUMBER_OF_STUDY_RELATED_INSTANCES, VR::IS, PrimitiveValue::Empty),
        DataElement::new(tags::STUDY_INSTANCE_UID, VR::UI, PrimitiveValue::Empty),
    ])
}

fn series_query_identifier(study_uid: &str) -> Dataset {
    Dataset::from_element_iter([
        DataElement::new(
            tags::QUERY_RETRIEVE_LEVEL,
            VR::CS,
            PrimitiveValue::from("SERIES"),
        ),
        DataElement::new(
            tags::STUDY_INSTANCE_UID,
            VR::UI,
            PrimitiveValue::from(study_uid),
        ),
        DataElement::new(tags::SERIES_INSTANCE_UID, VR::UI, PrimitiveValue::Empty),
        DataElement::new(tags::SERIES_NUMBER, VR::IS, PrimitiveValue::Empty),
        DataElement::new(tags::SERIES_DESCRIPTION, VR::LO, PrimitiveValue::Empty),
        DataElement::new(tags::MODALITY, VR::CS, PrimitiveValue::Empty),
        DataElement::new(tags::SOP_CLASS_UID, VR::UI, PrimitiveValue::Empty),
        DataElement::new(tags::NUMBER_OF_SERIES_RELATED_INSTANCES, VR::IS, PrimitiveValue::Empty),
    ])
}

fn instance_query_identifier(study_uid: &str, series_uid: &str) -> Dataset {
    Dataset::from_element_iter([
        DataElement::new(
            tags::QUERY_RETRIEVE_LEVEL,
            VR::CS,
            PrimitiveValue::from("IMAGE"),
        ),
        DataElement::new(
            tags::STUDY_INSTANCE_UID,
            VR::UI,
            PrimitiveValue::from(study_uid),
        ),
        DataElement::new(
            tags::SERIES_INSTANCE_UID,
            VR::UI,
            PrimitiveValue::from(series_uid),
        ),
        DataElement::new(tags::SOP_INSTANCE_UID, VR::UI, PrimitiveValue::Empty),
        DataElement::new(tags::INSTANCE_NUMBER, VR::IS, PrimitiveValue::Empty),
    ])
}

fn move_identifier_study(study_uid: &str) -> Dataset {
    Dataset::from_element_iter([
        DataElement::new(
            tags::QUERY_RETRIEVE_LEVEL,
            VR::CS,
            PrimitiveValue::from("STUDY"),
        ),
        DataElement::new(
            tags::STUDY_INSTANCE_UID,
            VR::UI,
            PrimitiveValue::from(study_uid),
        ),
    ])
}

fn move_identifier_series(study_uid: &str, series_uid: &str) -> Dataset {
    Dataset::from_element_iter([
        DataElement::new(
            tags::QUERY_RETRIEVE_LEVEL,
            VR::CS,
            PrimitiveValue::from("SERIES"),
        ),
        DataElement::new(
            tags::STUDY_INSTANCE_UID,
            VR::UI,
            PrimitiveValue::from(study_uid),
        ),
        DataElement::new(
            tags::SERIES_INSTANCE_UID,
            VR::UI,
            PrimitiveValue::from(series_uid),
        ),
    ])
}

fn move_identifier_instance(study_uid: &str, series_uid: &str, sop_uid: &str) -> Dataset {
    Dataset::from_element_iter([
        DataElement::new(
            tags::QUERY_RETRIEVE_LEVEL,
            VR::CS,
            PrimitiveValue::from("IMAGE"),
        ),
        DataElement::new(
            tags::STUDY_INSTANCE_UID,
            VR::UI,
            PrimitiveValue::from(study_uid),
        ),
        DataElement::new(
            tags::SERIES_INSTANCE_UID,
            VR::UI,
            PrimitiveValue::from(series_uid),
        ),
        DataElement::new(
            tags::SOP_INSTANCE_UID,
            VR::UI,
            PrimitiveValue::from(sop_uid),
        ),
    ])
}
