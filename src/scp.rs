//! The local Application Entity as a Service Class Provider: accepts
//! associations, answers C-ECHO, and admits C-STORE datasets into the
//! ingest queue under memory backpressure.

use std::net::TcpListener;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use dicom::core::{DataElement, PrimitiveValue, VR};
use dicom::dictionary_std::tags;
use dicom::encoding::TransferSyntaxIndex;
use dicom::transfer_syntax::TransferSyntaxRegistry;
use dicom_ul::association::server::ServerAssociationOptions;
use dicom_ul::pdu::{PDataValue, PDataValueType, Pdu};
use sysinfo::System;
use tracing::{debug, error, info, warn};

use crate::config::{ProjectModel, STUDY_ROOT_FIND, STUDY_ROOT_MOVE, VERIFICATION_CLASS};
use crate::dicom_access::{missing_attributes, Dataset, ElementAccess};
use crate::dimse::{
    C_ECHO_RQ, C_ECHO_RSP, C_FIND_RQ, C_MOVE_RQ, C_STORE_RQ, C_STORE_RSP, MAX_PDU_LENGTH,
    NO_DATA_SET,
};
use crate::error::{AnonymizerError, Result};
use crate::hierarchy::{C_OUT_OF_RESOURCES, C_SUCCESS};
use crate::ingest::{join_until, IngestItem, IngestQueue};
use crate::phi_index::PhiIndex;

/// Status for an undecodable incoming data set.
const C_STORE_DECODE_ERROR: u16 = 0xC210;
/// Status for a data set missing required attributes.
const C_STORE_DATASET_ERROR: u16 = 0xA900;
/// Status for a DIMSE operation this SCP does not service.
const C_UNRECOGNIZED_OPERATION: u16 = 0x0211;

/// The running SCP: accept loop plus one handler thread per association.
/// Handler threads are tracked so `stop` can join them under a bound.
pub struct ScpServer {
    active: Arc<AtomicBool>,
    listener_thread: Option<JoinHandle<()>>,
    handlers: Arc<Mutex<Vec<JoinHandle<()>>>>,
    /// Bound on joining association handlers at stop; handlers exit on
    /// their own once the stream read timeout fires.
    join_timeout: Duration,
    local_addr: String,
}

impl ScpServer {
    /// Binds the local AE and starts accepting associations. A bind
    /// failure is reported as a storage-level error for the exit code
    /// mapping at the binary edge.
    pub fn start(
        model: &ProjectModel,
        queue: IngestQueue,
        index: Arc<PhiIndex>,
    ) -> Result<Self> {
        let addr = model.local.socket_addr();
        let listener = TcpListener::bind(&addr).map_err(|e| {
            AnonymizerError::Config(format!("cannot bind {}: {e}", model.local))
        })?;
        // The configured port may be 0; report the port actually bound.
        let addr = listener
            .local_addr()
            .map(|a| a.to_string())
            .unwrap_or(addr);
        listener
            .set_nonblocking(true)
            .map_err(|e| AnonymizerError::Config(format!("cannot configure listener: {e}")))?;

        let active = Arc::new(AtomicBool::new(true));
        let accept_active = Arc::clone(&active);
        let accept_model = model.clone();
        let local_addr = addr.clone();
        let handlers: Arc<Mutex<Vec<JoinHandle<()>>>> = Arc::new(Mutex::new(Vec::new()));
        let accept_handlers = Arc::clone(&handlers);

        let listener_thread = thread::Builder::new()
            .name("scp-accept".into())
            .spawn(move || {
                info!(addr = %local_addr, aet = %accept_model.local.aet, "SCP listening");
                while accept_active.load(Ordering::Acquire) {
                    match listener.accept() {
                        Ok((stream, peer)) => {
                            debug!(%peer, "incoming association");
                            if stream.set_nonblocking(false).is_err() {
                                continue;
                            }
                            let _ = stream
                                .set_read_timeout(Some(Duration::from_secs(
                                    accept_model.network_timeouts.network,
                                )));
                            let handler_model = accept_model.clone();
                            let handler_queue = queue.clone();
                            let handler_index = Arc::clone(&index);
                            let handler_active = Arc::clone(&accept_active);
                            let spawned = thread::Builder::new()
                                .name(format!("scp-assoc-{peer}"))
                                .spawn(move || {
                                    if let Err(e) = handle_association(
                                        stream,
                                        &handler_model,
                                        &handler_queue,
                                        &handler_index,
                                        &handler_active,
                                    ) {
                                        warn!(%peer, error = %e, "association ended with error");
                                    }
                                });
                            match spawned {
                                Ok(handle) => {
                                    let mut guard = accept_handlers.lock().unwrap();
                                    // Reap finished handlers so the list
                                    // stays bounded on long runs.
                                    guard.retain(|h| !h.is_finished());
                                    guard.push(handle);
                                }
                                Err(e) => {
                                    error!(%peer, error = %e, "cannot spawn association handler");
                                }
                            }
                        }
                        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                            thread::sleep(Duration::from_millis(100));
                        }
                        Err(e) => {
                            error!(error = %e, "accept failed");
                            thread::sleep(Duration::from_millis(100));
                        }
                    }
                }
                info!("SCP accept loop stopped");
            })
            .map_err(|e| AnonymizerError::Config(format!("cannot spawn accept loop: {e}")))?;

        Ok(Self {
            active,
            listener_thread: Some(listener_thread),
            handlers,
            // Handlers exit once the peer releases or the stream read
            // timeout fires; allow for one full timeout plus margin.
            join_timeout: Duration::from_secs(model.network_timeouts.network + 5),
            local_addr: addr,
        })
    }

    pub fn local_addr(&self) -> &str {
        &self.local_addr
    }

    /// Stops accepting new associations, then joins every association
    /// handler under a finite deadline. In-flight stores were already
    /// queued; a handler stuck past its read timeout is abandoned rather
    /// than wedging shutdown.
    pub fn stop(mut self) {
        self.active.store(false, Ordering::Release);
        let deadline = Instant::now() + self.join_timeout;
        if let Some(handle) = self.listener_thread.take() {
            join_until(handle, deadline, "scp accept loop");
        }
        let handlers: Vec<JoinHandle<()>> = std::mem::take(&mut *self.handlers.lock().unwrap());
        for handle in handlers {
            join_until(handle, deadline, "scp association handler");
        }
    }
}

/// Services one association until release or abort.
fn handle_association(
    stream: std::net::TcpStream,
    model: &ProjectModel,
    queue: &IngestQueue,
    index: &Arc<PhiIndex>,
    active: &AtomicBool,
) -> Result<()> {
    let mut options = ServerAssociationOptions::new()
        .accept_any()
        .ae_title(model.local.aet.clone())
        .max_pdu_length(MAX_PDU_LENGTH)
        .with_abstract_syntax(VERIFICATION_CLASS)
        .with_abstract_syntax(STUDY_ROOT_FIND)
        .with_abstract_syntax(STUDY_ROOT_MOVE);
    for sop_class in &model.storage_classes {
        options = options.with_abstract_syntax(sop_class.clone());
    }
    for ts in &model.transfer_syntaxes {
        options = options.with_transfer_syntax(ts.clone());
    }

    let mut assoc = options
        .establish(stream)
        .map_err(|e| AnonymizerError::AssociationRejected(e.to_string()))?;
    let peer_aet = assoc.client_ae_title().to_string();
    debug!(%peer_aet, "association established");

    let mut memory = System::new();
    let mut command_buffer: Vec<u8> = Vec::new();
    let mut instance_buffer: Vec<u8> = Vec::new();
    let mut pending_store: Option<StoreRequest> = None;

    loop {
        let pdu = match assoc.receive() {
            Ok(pdu) => pdu,
            Err(e) => {
                debug!(%peer_aet, error = %e, "association receive ended");
                return Ok(());
            }
        };
        match pdu {
            Pdu::PData { data } => {
                for value in data {
                    match value.value_type {
                        PDataValueType::Command => {
                            command_buffer.extend_from_slice(&value.data);
                            if !value.is_last {
                                continue;
                            }
                            let command = Dataset::read_dataset_with_ts(
                                command_buffer.as_slice(),
                                &dicom::transfer_syntax::entries::IMPLICIT_VR_LITTLE_ENDIAN
                                    .erased(),
                            )
                            .map_err(|e| {
                                AnonymizerError::Dimse(format!("bad command set: {e}"))
                            })?;
                            command_buffer.clear();

                            let field = command
                                .element(tags::COMMAND_FIELD)
                                .ok()
                                .and_then(|e| e.to_int::<u16>().ok())
                                .unwrap_or(0);
                            let message_id = command
                                .element(tags::MESSAGE_ID)
                                .ok()
                                .and_then(|e| e.to_int::<u16>().ok())
                                .unwrap_or(0);

                            match field {
                                C_ECHO_RQ => {
                                    debug!(%peer_aet, "C-ECHO");
                                    let rsp = echo_response(message_id);
                                    send_command_response(
                                        &mut assoc,
                                        value.presentation_context_id,
                                        &rsp,
                                    )?;
                                }
                                C_STORE_RQ => {
                                    pending_store = Some(StoreRequest {
                                        message_id,
                                        sop_class_uid: command
                                            .element_trimmed(tags::AFFECTED_SOP_CLASS_UID)
                                            .unwrap_or_default(),
                                        sop_instance_uid: command
                                            .element_trimmed(tags::AFFECTED_SOP_INSTANCE_UID)
                                            .unwrap_or_default(),
                                    });
                                    instance_buffer.clear();
                                }
                                C_FIND_RQ | C_MOVE_RQ => {
                                    warn!(%peer_aet, field, "query service not provided here");
                                    let rsp = command_response(
                                        field | 0x8000,
                                        message_id,
                                        C_UNRECOGNIZED_OPERATION,
                                    );
                                    send_command_response(
                                        &mut assoc,
                                        value.presentation_context_id,
                                        &rsp,
                                    )?;
                                }
                                other => {
                                    warn!(%peer_aet, field = other, "unsupported DIMSE command");
                                    let rsp = command_response(
                                        other | 0x8000,
                                        message_id,
                                        C_UNRECOGNIZED_OPERATION,
                                    );
                                    send_command_response(
                                        &mut assoc,
                                        value.presentation_context_id,
                                        &rsp,
                                    )?;
                                }
                            }
                        }
                        PDataValueType::Data => {
                            instance_buffer.extend_from_slice(&value.data);
                            if !value.is_last {
                                continue;
                            }
                            let Some(request) = pending_store.take() else {
                                warn!(%peer_aet, "data set without a pending C-STORE");
                                instance_buffer.clear();
                                continue;
                            };
                            let status = handle_store(
                                model,
                                queue,
                                index,
                                active,
                                &mut memory,
                                &assoc,
                                value.presentation_context_id,
                                &peer_aet,
                                &request,
                                std::mem::take(&mut instance_buffer),
                            );
                            let rsp = store_response(&request, status);
                            send_command_response(
                                &mut assoc,
                                value.presentation_context_id,
                                &rsp,
                            )?;
                        }
                    }
                }
            }
            Pdu::ReleaseRQ => {
                let _ = assoc.send(&Pdu::ReleaseRP);
                debug!(%peer_aet, "association released");
                return Ok(());
            }
            Pdu::AbortRQ { source } => {
                debug!(%peer_aet, ?source, "association aborted by peer");
                return Ok(());
            }
            other => {
                warn!(%peer_aet, ?other, "unexpected PDU");
                return Ok(());
            }
        }
    }
}

struct StoreRequest {
    message_id: u16,
    sop_class_uid: String,
    sop_instance_uid: String,
}

/// Admits one C-STORE data set: memory backpressure first, then decode,
/// integrity checks, duplicate suppression, and finally the queue.
#[allow(clippy::too_many_arguments)]
fn handle_store(
    model: &ProjectModel,
    queue: &IngestQueue,
    index: &Arc<PhiIndex>,
    active: &AtomicBool,
    memory: &mut System,
    assoc: &dicom_ul::ServerAssociation<std::net::TcpStream>,
    pc_id: u8,
    peer_aet: &str,
    request: &StoreRequest,
    payload: Vec<u8>,
) -> u16 {
    if !active.load(Ordering::Acquire) {
        return C_OUT_OF_RESOURCES;
    }

    // Backpressure: consult OS-level available memory and give the workers
    // a bounded number of time slices to catch up before refusing.
    let settings = model.ingest;
    let mut retries = settings.backoff_retries;
    loop {
        memory.refresh_memory();
        if memory.available_memory() >= settings.memory_backoff_threshold {
            break;
        }
        if retries == 0 {
            warn!(%peer_aet, "available memory exhausted, refusing store");
            return C_OUT_OF_RESOURCES;
        }
        retries -= 1;
        thread::sleep(Duration::from_millis(settings.backoff_slice_millis));
    }

    let ts_uid = assoc
        .presentation_contexts()
        .iter()
        .find(|pc| pc.id == pc_id)
        .map(|pc| pc.transfer_syntax.to_string())
        .unwrap_or_else(|| "1.2.840.10008.1.2".to_string());
    let Some(ts) = TransferSyntaxRegistry.get(&ts_uid) else {
        return C_STORE_DECODE_ERROR;
    };
    let dataset = match Dataset::read_dataset_with_ts(payload.as_slice(), ts) {
        Ok(ds) => ds,
        Err(e) => {
            warn!(%peer_aet, error = %e, "cannot decode incoming data set");
            return C_STORE_DECODE_ERROR;
        }
    };

    let missing = missing_attributes(&dataset);
    if !missing.is_empty() {
        warn!(%peer_aet, ?missing, "incoming data set missing attributes");
        return C_STORE_DATASET_ERROR;
    }

    // Idempotence on the wire: a duplicate is acknowledged without work.
    if index.uid_received(&request.sop_instance_uid) {
        debug!(%peer_aet, sop = %request.sop_instance_uid, "duplicate instance acknowledged");
        return C_SUCCESS;
    }

    let item = IngestItem {
        source: peer_aet.to_string(),
        dataset,
        ts_uid,
    };
    match queue.enqueue(item) {
        Ok(()) => C_SUCCESS,
        Err(_) => C_OUT_OF_RESOURCES,
    }
}

fn echo_response(message_id: u16) -> Dataset {
    Dataset::command_from_element_iter([
        DataElement::new(
            tags::AFFECTED_SOP_CLASS_UID,
            VR::UI,
            PrimitiveValue::from(VERIFICATION_CLASS),
        ),
        DataElement::new(tags::COMMAND_FIELD, VR::US, PrimitiveValue::from(C_ECHO_RSP)),
        DataElement::new(
            tags::MESSAGE_ID_BEING_RESPONDED_TO,
            VR::US,
            PrimitiveValue::from(message_id),
        ),
        DataElement::new(
            tags::COMMAND_DATA_SET_TYPE,
            VR::US,
            PrimitiveValue::from(NO_DATA_SET),
        ),
        DataElement::new(tags::STATUS, VR::US, PrimitiveValue::from(C_SUCCESS)),
    ])
}

fn store_response(request: &StoreRequest, status: u16) -> Dataset {
    Dataset::command_from_element_iter([
        DataElement::new(
            tags::AFFECTED_SOP_CLASS_UID,
            VR::UI,
            PrimitiveValue::from(request.sop_class_uid.as_str()),
        ),
        DataElement::new(tags::COMMAND_FIELD, VR::US, PrimitiveValue::from(C_STORE_RSP)),
        DataElement::new(
            tags::MESSAGE_ID_BEING_RESPONDED_TO,
            VR::US,
            PrimitiveValue::from(request.message_id),
        ),
        DataElement::new(
            tags::COMMAND_DATA_SET_TYPE,
            VR::US,
            PrimitiveValue::from(NO_DATA_SET),
        ),
        DataElement::new(tags::STATUS, VR::US, PrimitiveValue::from(status)),
        DataElement::new(
            tags::AFFECTED_SOP_INSTANCE_UID,
            VR::UI,
            PrimitiveValue::from(request.sop_instance_uid.as_str()),
        ),
    ])
}

fn command_response(field: u16, message_id: u16, status: u16) -> Dataset {
    Dataset::command_from_element_iter([
        DataElement::new(tags::COMMAND_FIELD, VR::US, PrimitiveValue::from(field)),
        DataElement::new(
            tags::MESSAGE_ID_BEING_RESPONDED_TO,
            VR::US,
            PrimitiveValue::from(message_id),
        ),
        DataElement::new(
            tags::COMMAND_DATA_SET_TYPE,
            VR::US,
            PrimitiveValue::from(NO_DATA_SET),
        ),
        DataElement::new(tags::STATUS, VR::US, PrimitiveValue::from(status)),
    ])
}

fn send_command_response(
    assoc: &mut dicom_ul::ServerAssociation<std::net::TcpStream>,
    pc_id: u8,
    command: &Dataset,
) -> Result<()> {
    let mut data = Vec::new();
    command
        .write_dataset_with_ts(
            &mut data,
            &dicom::transfer_syntax::entries::IMPLICIT_VR_LITTLE_ENDIAN.erased(),
        )
        .map_err(|e| AnonymizerError::Dimse(format!("cannot encode response: {e}")))?;
    assoc
        .send(&Pdu::PData {
            data: vec![PDataValue {
                presentation_context_id: pc_id,
                value_type: PDataValueType::Command,
                is_last: true,
                data,
            }],
        })
        .map_err(|e| AnonymizerError::Dimse(format!("cannot send response: {e}")))
}
