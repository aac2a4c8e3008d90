//! The export orchestrator: sends a patient's anonymized files to a remote
//! SCP or to the S3 bucket, with a pre-flight existence check so repeated
//! exports only transfer what the destination is missing.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use crossbeam_channel::{unbounded, Sender};
use dicom::dictionary_std::tags;
use dicom::object::open_file;
use tracing::{debug, info, warn};

use dicom::core::{DataElement, PrimitiveValue, VR};
use dicom::encoding::TransferSyntaxIndex;

use crate::aws::AwsClient;
use crate::config::{ProjectModel, STUDY_ROOT_FIND};
use crate::dicom_access::{Dataset, ElementAccess};
use crate::dimse::{self, DicomClient};
use crate::error::{AnonymizerError, Result};
use crate::hierarchy::C_SUCCESS;
use crate::storage::FileStore;

pub struct ExportPatientsRequest {
    /// Remote node name for a DICOM destination; ignored for S3 projects.
    pub destination: String,
    pub patient_ids: Vec<String>,
}

/// Progress event for one patient's export.
#[derive(Debug, Clone)]
pub struct ExportPatientResponse {
    pub patient_id: String,
    pub files_sent: u32,
    pub error: Option<String>,
    pub complete: bool,
}

pub struct Exporter {
    model: Arc<ProjectModel>,
    client: DicomClient,
    store: FileStore,
    aws: Option<Arc<AwsClient>>,
    abort: Arc<AtomicBool>,
}

impl Exporter {
    pub fn new(model: Arc<ProjectModel>, store: FileStore) -> Result<Self> {
        let client = DicomClient::new(&model.local.aet, model.network_timeouts);
        let aws = if model.export_to_aws {
            Some(Arc::new(AwsClient::new(model.aws_cognito.clone())?))
        } else {
            None
        };
        Ok(Self {
            model,
            client,
            store,
            aws,
            abort: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Halts new batches; in-flight batches complete before workers exit.
    pub fn abort_export(&self) {
        info!("export abort requested");
        self.abort.store(true, Ordering::Release);
    }

    /// Exports every requested patient concurrently (bounded pool),
    /// publishing progress events on `events`.
    pub fn export_patients(
        &self,
        request: &ExportPatientsRequest,
        events: &Sender<ExportPatientResponse>,
    ) {
        self.abort.store(false, Ordering::Release);
        info!(
            patients = request.patient_ids.len(),
            destination = %request.destination,
            aws = self.model.export_to_aws,
            "bulk export started"
        );

        let (task_tx, task_rx) = unbounded::<String>();
        for patient_id in &request.patient_ids {
            let _ = task_tx.send(patient_id.clone());
        }
        drop(task_tx);

        thread::scope(|scope| {
            for _ in 0..self.model.export.worker_count {
                let task_rx = task_rx.clone();
                let events = events.clone();
                scope.spawn(move || {
                    while let Ok(patient_id) = task_rx.recv() {
                        if self.abort.load(Ordering::Acquire) {
                            let _ = events.send(ExportPatientResponse {
                                patient_id,
                                files_sent: 0,
                                error: Some(AnonymizerError::Cancelled.to_string()),
                                complete: false,
                            });
                            continue;
                        }
                        self.export_patient(&request.destination, &patient_id, &events);
                    }
                });
            }
        });
        info!("bulk export finished");
    }

    fn export_patient(
        &self,
        destination: &str,
        patient_id: &str,
        events: &Sender<ExportPatientResponse>,
    ) {
        let files = self.store.patient_files(patient_id);
        if files.is_empty() {
            let _ = events.send(ExportPatientResponse {
                patient_id: patient_id.to_string(),
                files_sent: 0,
                error: Some(format!("no stored files for patient {patient_id}")),
                complete: false,
            });
            return;
        }

        let result = if self.model.export_to_aws {
            self.export_patient_s3(patient_id, files, events)
        } else {
            self.export_patient_dicom(destination, patient_id, files, events)
        };

        match result {
            Ok((files_sent, errors)) => {
                let _ = events.send(ExportPatientResponse {
                    patient_id: patient_id.to_string(),
                    files_sent,
                    error: errors.last().cloned(),
                    complete: errors.is_empty(),
                });
            }
            Err(e) => {
                let _ = events.send(ExportPatientResponse {
                    patient_id: patient_id.to_string(),
                    files_sent: 0,
                    error: Some(e.to_string()),
                    complete: false,
                });
            }
        }
    }

    /// S3 export: head each object key, upload the absent ones.
    fn export_patient_s3(
        &self,
        patient_id: &str,
        files: Vec<PathBuf>,
        events: &Sender<ExportPatientResponse>,
    ) -> Result<(u32, Vec<String>)> {
        let aws = self
            .aws
            .as_ref()
            .ok_or_else(|| AnonymizerError::Config("AWS export not configured".into()))?;
        let user_directory = aws.authenticate()?;

        let mut files_sent = 0u32;
        let mut errors = Vec::new();
        let mut in_batch = 0usize;

        for file in files {
            if self.abort.load(Ordering::Acquire) {
                return Err(AnonymizerError::Cancelled);
            }
            let key = self.object_key(&user_directory, &file)?;

            // Pre-flight: skip objects the bucket already holds.
            match aws.object_exists(&key) {
                Ok(true) => {
                    debug!(%key, "object already exported");
                    continue;
                }
                Ok(false) => {}
                Err(e) => {
                    errors.push(e.to_string());
                    continue;
                }
            }

            let bytes = match fs::read(&file) {
                Ok(bytes) => bytes,
                Err(e) => {
                    errors.push(format!("{}: {e}", file.display()));
                    continue;
                }
            };
            match aws.put_object(&key, bytes) {
                Ok(()) => {
                    files_sent += 1;
                    in_batch += 1;
                    if in_batch >= self.model.export.batch_size {
                        in_batch = 0;
                        let _ = events.send(ExportPatientResponse {
                            patient_id: patient_id.to_string(),
                            files_sent,
                            error: None,
                            complete: false,
                        });
                    }
                }
                Err(e) => {
                    warn!(%key, error = %e, "S3 upload failed");
                    errors.push(e.to_string());
                }
            }
        }
        Ok((files_sent, errors))
    }

    /// `{s3_prefix}/{user_directory}/{ptid}/{study}/{series}/{sop}.dcm`
    fn object_key(&self, user_directory: &str, file: &Path) -> Result<String> {
        let relative = file.strip_prefix(self.store.storage_dir()).map_err(|_| {
            AnonymizerError::StorageError(format!("{} outside store", file.display()))
        })?;
        let mut key = PathBuf::from(&self.model.aws_cognito.s3_prefix);
        key.push(user_directory);
        key.push(relative);
        Ok(key.to_string_lossy().replace('\\', "/"))
    }

    /// DICOM export: instance-level C-FIND pre-flight per study, then
    /// C-STORE of the missing files, re-associating when the storage class
    /// or transfer syntax changes.
    fn export_patient_dicom(
        &self,
        destination: &str,
        patient_id: &str,
        files: Vec<PathBuf>,
        events: &Sender<ExportPatientResponse>,
    ) -> Result<(u32, Vec<String>)> {
        let node = self.model.remote(destination)?.clone();
        let present = self.destination_instances(destination, patient_id, &files);

        let mut files_sent = 0u32;
        let mut errors = Vec::new();
        let mut in_batch = 0usize;

        let mut assoc: Option<dicom_ul::ClientAssociation<std::net::TcpStream>> = None;
        let mut current_context: Option<(String, String)> = None;
        let mut message_id = 1u16;

        for file in files {
            if self.abort.load(Ordering::Acquire) {
                if let Some(assoc) = assoc.take() {
                    let _ = assoc.abort();
                }
                return Err(AnonymizerError::Cancelled);
            }

            let stem = file
                .file_stem()
                .map(|s| s.to_string_lossy().to_string())
                .unwrap_or_default();
            if present.contains(&stem) {
                debug!(sop = %stem, "instance already on destination");
                continue;
            }

            let result = (|| -> Result<()> {
                let obj = open_file(&file)
                    .map_err(|e| AnonymizerError::DicomReadError(e.to_string()))?;
                let sop_class = obj
                    .element_trimmed(tags::SOP_CLASS_UID)
                    .ok_or_else(|| AnonymizerError::InvalidDicom("no SOPClassUID".into()))?;
                let sop_instance = obj
                    .element_trimmed(tags::SOP_INSTANCE_UID)
                    .ok_or_else(|| AnonymizerError::InvalidDicom("no SOPInstanceUID".into()))?;
                let ts_uid = obj.meta().transfer_syntax().to_string();

                // Re-associate on a storage class or transfer syntax change.
                let context = (sop_class.clone(), ts_uid.clone());
                if current_context.as_ref() != Some(&context) {
                    if let Some(old) = assoc.take() {
                        let _ = old.release();
                    }
                    let contexts = vec![(sop_class.clone(), vec![ts_uid.clone()])];
                    assoc = Some(self.client.connect(&node, &contexts)?);
                    current_context = Some(context);
                }
                let assoc = assoc.as_mut().unwrap();
                let pc_id = dimse::accepted_context(assoc)?;

                let ts = dicom::transfer_syntax::TransferSyntaxRegistry
                    .get(&ts_uid)
                    .ok_or_else(|| {
                        AnonymizerError::Dimse(format!("unsupported transfer syntax {ts_uid}"))
                    })?;
                let mut bytes = Vec::new();
                obj.write_dataset_with_ts(&mut bytes, ts)
                    .map_err(|e| AnonymizerError::Dimse(format!("cannot encode data set: {e}")))?;

                let id = message_id;
                message_id = message_id.wrapping_add(1);
                let status =
                    dimse::store(assoc, pc_id, &sop_class, &sop_instance, &bytes, id)?;
                if status != C_SUCCESS {
                    return Err(AnonymizerError::Dimse(format!(
                        "C-STORE failed with status 0x{status:04X}"
                    )));
                }
                Ok(())
            })();

            match result {
                Ok(()) => {
                    files_sent += 1;
                    in_batch += 1;
                    if in_batch >= self.model.export.batch_size {
                        in_batch = 0;
                        let _ = events.send(ExportPatientResponse {
                            patient_id: patient_id.to_string(),
                            files_sent,
                            error: None,
                            complete: false,
                        });
                    }
                }
                Err(e) => {
                    warn!(file = %file.display(), error = %e, "export of file failed");
                    errors.push(e.to_string());
                    // A broken association is not reusable.
                    if let Some(old) = assoc.take() {
                        let _ = old.abort();
                    }
                    current_context = None;
                }
            }
        }

        if let Some(assoc) = assoc.take() {
            let _ = assoc.release();
        }
        Ok((files_sent, errors))
    }

    /// Pre-flight: the SOP instance UIDs the destination already has for
    /// this patient's studies. Best effort; a peer that cannot answer just
    /// yields an empty set and everything is sent.
    fn destination_instances(
        &self,
        destination: &str,
        patient_id: &str,
        files: &[PathBuf],
    ) -> BTreeSet<String> {
        let mut study_uids = BTreeSet::new();
        for file in files {
            // .../{ptid}/{study}/{series}/{sop}.dcm
            if let Some(study) = file
                .parent()
                .and_then(|p| p.parent())
                .and_then(|p| p.file_name())
            {
                study_uids.insert(study.to_string_lossy().to_string());
            }
        }

        let mut present = BTreeSet::new();
        let Ok(node) = self.model.remote(destination) else {
            return present;
        };
        let node = node.clone();
        let contexts = vec![(STUDY_ROOT_FIND.to_string(), Vec::new())];
        let Ok(mut assoc) = self.client.connect(&node, &contexts) else {
            return present;
        };
        let Ok(pc_id) = dimse::accepted_context(&assoc) else {
            let _ = assoc.release();
            return present;
        };

        let abort = AtomicBool::new(false);
        let mut message_id = 1u16;
        for study_uid in study_uids {
            let identifier = preflight_identifier(&study_uid);
            match dimse::find(
                &mut assoc,
                pc_id,
                STUDY_ROOT_FIND,
                &identifier,
                message_id,
                &abort,
            ) {
                Ok(results) => {
                    for ds in results {
                        if let Some(uid) = ds.element_trimmed(tags::SOP_INSTANCE_UID) {
                            present.insert(uid);
                        }
                    }
                }
                Err(e) => {
                    debug!(study = %study_uid, patient_id, error = %e, "pre-flight query failed");
                }
            }
            message_id = message_id.wrapping_add(1);
        }
        let _ = assoc.release();
        present
    }
}

/// Instance-level identifier listing every SOP instance of a study.
fn preflight_identifier(study_uid: &str) -> Dataset {
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
        DataElement::new(tags::SERIES_INSTANCE_UID, VR::UI, PrimitiveValue::Empty),
        DataElement::new(tags::SOP_INSTANCE_UID, VR::UI, PrimitiveValue::Empty),
    ])
}
