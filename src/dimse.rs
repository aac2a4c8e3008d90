//! SCU primitives over the dicom-ul association layer: C-ECHO, C-STORE,
//! C-FIND and C-MOVE as request/response exchanges. Command sets travel in
//! Implicit VR Little Endian; datasets in the negotiated transfer syntax.

use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use dicom::core::{DataElement, PrimitiveValue, VR};
use dicom::dictionary_std::tags;
use dicom::encoding::TransferSyntaxIndex;
use dicom::transfer_syntax::TransferSyntaxRegistry;
use dicom_ul::association::client::ClientAssociationOptions;
use dicom_ul::pdu::{PDataValue, PDataValueType, Pdu, PresentationContextResultReason};
use dicom_ul::ClientAssociation;
use tracing::{debug, warn};

use crate::config::{DicomNode, NetworkTimeouts};
use crate::dicom_access::{Dataset, ElementAccess};
use crate::error::{AnonymizerError, Result};
use crate::hierarchy::{status_is_pending, C_SUCCESS};

pub const MAX_PDU_LENGTH: u32 = 16384;

// DIMSE command field values.
pub const C_STORE_RQ: u16 = 0x0001;
pub const C_STORE_RSP: u16 = 0x8001;
pub const C_FIND_RQ: u16 = 0x0020;
pub const C_FIND_RSP: u16 = 0x8020;
pub const C_MOVE_RQ: u16 = 0x0021;
pub const C_MOVE_RSP: u16 = 0x8021;
pub const C_ECHO_RQ: u16 = 0x0030;
pub const C_ECHO_RSP: u16 = 0x8030;

/// Command data set type value meaning "no data set present".
pub const NO_DATA_SET: u16 = 0x0101;
/// Any value other than 0x0101 means a data set follows.
pub const DATA_SET_PRESENT: u16 = 0x0000;

/// One decoded DIMSE message: the command set, the raw data set bytes (in
/// the presentation context's transfer syntax) when one was present, and
/// the presentation context it arrived on.
pub struct DimseMessage {
    pub command: Dataset,
    pub data: Option<Vec<u8>>,
    pub pc_id: u8,
}

impl DimseMessage {
    pub fn status(&self) -> Result<u16> {
        self.command
            .element(tags::STATUS)
            .ok()
            .and_then(|e| e.to_int::<u16>().ok())
            .ok_or_else(|| AnonymizerError::Dimse("response carries no status".into()))
    }

    pub fn command_field(&self) -> Result<u16> {
        self.command
            .element(tags::COMMAND_FIELD)
            .ok()
            .and_then(|e| e.to_int::<u16>().ok())
            .ok_or_else(|| AnonymizerError::Dimse("message carries no command field".into()))
    }
}

/// Factory for outbound associations carrying this project's calling AE
/// title and network timeouts.
#[derive(Clone)]
pub struct DicomClient {
    calling_aet: String,
    timeouts: NetworkTimeouts,
}

impl DicomClient {
    pub fn new(calling_aet: &str, timeouts: NetworkTimeouts) -> Self {
        Self {
            calling_aet: calling_aet.to_string(),
            timeouts,
        }
    }

    /// Opens an association proposing the given presentation contexts:
    /// `(abstract_syntax, transfer_syntaxes)` pairs.
    pub fn connect(
        &self,
        node: &DicomNode,
        contexts: &[(String, Vec<String>)],
    ) -> Result<ClientAssociation<std::net::TcpStream>> {
        let mut options = ClientAssociationOptions::new()
            .calling_ae_title(&self.calling_aet)
            .called_ae_title(&node.aet)
            .max_pdu_length(MAX_PDU_LENGTH)
            .connection_timeout(Duration::from_secs(self.timeouts.tcp_connect))
            .read_timeout(Duration::from_secs(self.timeouts.dimse))
            .write_timeout(Duration::from_secs(self.timeouts.network));
        for (abstract_syntax, transfer_syntaxes) in contexts {
            if transfer_syntaxes.is_empty() {
                options = options.with_abstract_syntax(abstract_syntax.clone());
            } else {
                options = options.with_presentation_context(
                    abstract_syntax.clone(),
                    transfer_syntaxes.clone(),
                );
            }
        }
        debug!(peer = %node, "requesting association");
        options
            .establish_with(&node.socket_addr())
            .map_err(|e| AnonymizerError::AssociationRejected(format!("{node}: {e}")))
    }

    /// Opens an association for verification only.
    pub fn connect_verification(&self, node: &DicomNode) -> Result<ClientAssociation<std::net::TcpStream>> {
        self.connect(
            node,
            &[(crate::config::VERIFICATION_CLASS.to_string(), Vec::new())],
        )
    }

    /// C-ECHO round trip; returns the response status.
    pub fn echo(&self, node: &DicomNode) -> Result<u16> {
        let mut assoc = self.connect_verification(node)?;
        let pc_id = accepted_context(&assoc)?;
        let command = Dataset::command_from_element_iter([
            DataElement::new(
                tags::AFFECTED_SOP_CLASS_UID,
                VR::UI,
                PrimitiveValue::from(crate::config::VERIFICATION_CLASS),
            ),
            DataElement::new(tags::COMMAND_FIELD, VR::US, PrimitiveValue::from(C_ECHO_RQ)),
            DataElement::new(tags::MESSAGE_ID, VR::US, PrimitiveValue::from(1_u16)),
            DataElement::new(
                tags::COMMAND_DATA_SET_TYPE,
                VR::US,
                PrimitiveValue::from(NO_DATA_SET),
            ),
        ]);
        send_command(&mut assoc, pc_id, &command)?;
        let message = receive_message(&mut assoc)?;
        let status = message.status()?;
        let _ = assoc.release();
        Ok(status)
    }
}

/// The id of the first accepted presentation context. Associations opened
/// by this module propose a single abstract syntax, so the first accepted
/// context is the negotiated one.
pub fn accepted_context(assoc: &ClientAssociation<std::net::TcpStream>) -> Result<u8> {
    accepted_context_with_ts(assoc).map(|(id, _)| id)
}

/// First accepted presentation context id and its negotiated transfer
/// syntax.
pub fn accepted_context_with_ts(assoc: &ClientAssociation<std::net::TcpStream>) -> Result<(u8, String)> {
    assoc
        .presentation_contexts()
        .iter()
        .find(|pc| pc.reason == PresentationContextResultReason::Acceptance)
        .map(|pc| (pc.id, pc.transfer_syntax.to_string()))
        .ok_or_else(|| {
            AnonymizerError::AssociationRejected(
                "peer accepted no usable presentation context".into(),
            )
        })
}

/// Encodes an identifier data set with the transfer syntax negotiated for
/// the presentation context.
fn encode_identifier(
    assoc: &ClientAssociation<std::net::TcpStream>,
    pc_id: u8,
    identifier: &Dataset,
) -> Result<Vec<u8>> {
    let ts_uid = assoc
        .presentation_contexts()
        .iter()
        .find(|pc| pc.id == pc_id)
        .map(|pc| pc.transfer_syntax.to_string())
        .ok_or_else(|| AnonymizerError::Dimse(format!("unknown presentation context {pc_id}")))?;
    let ts = TransferSyntaxRegistry
        .get(&ts_uid)
        .ok_or_else(|| AnonymizerError::Dimse(format!("unsupported transfer syntax {ts_uid}")))?;
    let mut bytes = Vec::new();
    identifier
        .write_dataset_with_ts(&mut bytes, ts)
        .map_err(|e| AnonymizerError::Dimse(format!("cannot encode identifier: {e}")))?;
    Ok(bytes)
}

/// Sends a command set on the given presentation context.
pub fn send_command(assoc: &mut ClientAssociation<std::net::TcpStream>, pc_id: u8, command: &Dataset) -> Result<()> {
    let mut data = Vec::new();
    command
        .write_dataset_with_ts(
            &mut data,
            &dicom::transfer_syntax::entries::IMPLICIT_VR_LITTLE_ENDIAN.erased(),
        )
        .map_err(|e| AnonymizerError::Dimse(format!("cannot encode command: {e}")))?;
    assoc
        .send(&Pdu::PData {
            data: vec![PDataValue {
                presentation_context_id: pc_id,
                value_type: PDataValueType::Command,
                is_last: true,
                data,
            }],
        })
        .map_err(|e| AnonymizerError::Dimse(format!("cannot send command: {e}")))
}

/// Sends a data set, fragmenting to the peer's maximum PDU length.
pub fn send_dataset(assoc: &mut ClientAssociation<std::net::TcpStream>, pc_id: u8, bytes: &[u8]) -> Result<()> {
    let max = MAX_PDU_LENGTH as usize;
    if bytes.len() + 1024 < max {
        assoc
            .send(&Pdu::PData {
                data: vec![PDataValue {
                    presentation_context_id: pc_id,
                    value_type: PDataValueType::Data,
                    is_last: true,
                    data: bytes.to_vec(),
                }],
            })
            .map_err(|e| AnonymizerError::Dimse(format!("cannot send data set: {e}")))
    } else {
        let mut writer = assoc.send_pdata(pc_id);
        writer
            .write_all(bytes)
            .map_err(|e| AnonymizerError::Dimse(format!("cannot send data set: {e}")))?;
        Ok(())
    }
}

/// Receives one full DIMSE message: the command set and, when the command
/// announces one, the complete data set bytes.
pub fn receive_message(assoc: &mut ClientAssociation<std::net::TcpStream>) -> Result<DimseMessage> {
    let mut command_bytes: Vec<u8> = Vec::new();
    let mut data_bytes: Vec<u8> = Vec::new();
    let mut command: Option<Dataset> = None;
    let mut expect_data = false;
    let mut pc_id = 0u8;

    loop {
        let pdu = assoc
            .receive()
            .map_err(|e| AnonymizerError::NetworkTimeout(format!("DIMSE receive: {e}")))?;
        match pdu {
            Pdu::PData { data } => {
                for value in data {
                    pc_id = value.presentation_context_id;
                    match value.value_type {
                        PDataValueType::Command => {
                            command_bytes.extend_from_slice(&value.data);
                            if value.is_last {
                                let obj = Dataset::read_dataset_with_ts(
                                    command_bytes.as_slice(),
                                    &dicom::transfer_syntax::entries::IMPLICIT_VR_LITTLE_ENDIAN
                                        .erased(),
                                )
                                .map_err(|e| {
                                    AnonymizerError::Dimse(format!("cannot decode command: {e}"))
                                })?;
                                let ds_type = obj
                                    .element(tags::COMMAND_DATA_SET_TYPE)
                                    .ok()
                                    .and_then(|e| e.to_int::<u16>().ok())
                                    .unwrap_or(NO_DATA_SET);
                                expect_data = ds_type != NO_DATA_SET;
                                command = Some(obj);
                                if !expect_data {
                                    return Ok(DimseMessage {
                                        command: command.unwrap(),
                                        data: None,
                                        pc_id,
                                    });
                                }
                            }
                        }
                        PDataValueType::Data => {
                            data_bytes.extend_from_slice(&value.data);
                            if value.is_last {
                                let command = command.ok_or_else(|| {
                                    AnonymizerError::Dimse(
                                        "data set arrived before its command".into(),
                                    )
                                })?;
                                return Ok(DimseMessage {
                                    command,
                                    data: Some(data_bytes),
                                    pc_id,
                                });
                            }
                        }
                    }
                }
            }
            Pdu::AbortRQ { source } => {
                return Err(AnonymizerError::PeerAbort(format!("{source:?}")));
            }
            Pdu::ReleaseRQ => {
                let _ = assoc.send(&Pdu::ReleaseRP);
                return Err(AnonymizerError::Dimse(
                    "peer released the association mid-message".into(),
                ));
            }
            other => {
                warn!(?other, "unexpected PDU while awaiting DIMSE message");
                return Err(AnonymizerError::Dimse("unexpected PDU".into()));
            }
        }
    }
}

/// Decodes a data set with the transfer syntax negotiated for the given
/// presentation context.
pub fn decode_dataset(assoc: &ClientAssociation<std::net::TcpStream>, pc_id: u8, bytes: &[u8]) -> Result<Dataset> {
    let ts_uid = assoc
        .presentation_contexts()
        .iter()
        .find(|pc| pc.id == pc_id)
        .map(|pc| pc.transfer_syntax.to_string())
        .ok_or_else(|| AnonymizerError::Dimse(format!("unknown presentation context {pc_id}")))?;
    let ts = TransferSyntaxRegistry
        .get(&ts_uid)
        .ok_or_else(|| AnonymizerError::Dimse(format!("unsupported transfer syntax {ts_uid}")))?;
    Dataset::read_dataset_with_ts(bytes, ts)
        .map_err(|e| AnonymizerError::Dimse(format!("cannot decode data set: {e}")))
}

/// Issues a C-FIND and collects every pending identifier. The abort flag is
/// honored between responses; aborting sends A-ABORT to the peer.
pub fn find(
    assoc: &mut ClientAssociation<std::net::TcpStream>,
    pc_id: u8,
    sop_class_uid: &str,
    identifier: &Dataset,
    message_id: u16,
    abort: &AtomicBool,
) -> Result<Vec<Dataset>> {
    let command = Dataset::command_from_element_iter([
        DataElement::new(
            tags::AFFECTED_SOP_CLASS_UID,
            VR::UI,
            PrimitiveValue::from(sop_class_uid),
        ),
        DataElement::new(tags::COMMAND_FIELD, VR::US, PrimitiveValue::from(C_FIND_RQ)),
        DataElement::new(tags::MESSAGE_ID, VR::US, PrimitiveValue::from(message_id)),
        DataElement::new(tags::PRIORITY, VR::US, PrimitiveValue::from(0x0001_u16)),
        DataElement::new(
            tags::COMMAND_DATA_SET_TYPE,
            VR::US,
            PrimitiveValue::from(DATA_SET_PRESENT),
        ),
    ]);
    send_command(assoc, pc_id, &command)?;
    let bytes = encode_identifier(assoc, pc_id, identifier)?;
    send_dataset(assoc, pc_id, &bytes)?;

    let mut results = Vec::new();
    loop {
        if abort.load(Ordering::Acquire) {
            return Err(AnonymizerError::Cancelled);
        }
        let message = receive_message(assoc)?;
        let status = message.status()?;
        if status_is_pending(status) {
            if let Some(data) = message.data {
                results.push(decode_dataset(assoc, message.pc_id, &data)?);
            }
            continue;
        }
        if status == C_SUCCESS {
            return Ok(results);
        }
        return Err(AnonymizerError::Dimse(format!(
            "C-FIND failed with status 0x{status:04X}"
        )));
    }
}

/// Issues a C-MOVE towards `dest_aet` and streams every status command set
/// to `on_status`. Returns the terminal status.
pub fn move_request(
    assoc: &mut ClientAssociation<std::net::TcpStream>,
    pc_id: u8,
    sop_class_uid: &str,
    identifier: &Dataset,
    dest_aet: &str,
    message_id: u16,
    abort: &AtomicBool,
    mut on_status: impl FnMut(u16, &Dataset),
) -> Result<u16> {
    let command = Dataset::command_from_element_iter([
        DataElement::new(
            tags::AFFECTED_SOP_CLASS_UID,
            VR::UI,
            PrimitiveValue::from(sop_class_uid),
        ),
        DataElement::new(tags::COMMAND_FIELD, VR::US, PrimitiveValue::from(C_MOVE_RQ)),
        DataElement::new(tags::MESSAGE_ID, VR::US, PrimitiveValue::from(message_id)),
        DataElement::new(tags::PRIORITY, VR::US, PrimitiveValue::from(0x0001_u16)),
        DataElement::new(
            tags::COMMAND_DATA_SET_TYPE,
            VR::US,
            PrimitiveValue::from(DATA_SET_PRESENT),
        ),
        DataElement::new(tags::MOVE_DESTINATION, VR::AE, PrimitiveValue::from(dest_aet)),
    ]);
    send_command(assoc, pc_id, &command)?;
    let bytes = encode_identifier(assoc, pc_id, identifier)?;
    send_dataset(assoc, pc_id, &bytes)?;

    loop {
        if abort.load(Ordering::Acquire) {
            return Err(AnonymizerError::Cancelled);
        }
        let message = receive_message(assoc)?;
        let status = message.status()?;
        on_status(status, &message.command);
        if status_is_pending(status) {
            continue;
        }
        return Ok(status);
    }
}

/// Sends one C-STORE request for an already-encoded data set.
pub fn store(
    assoc: &mut ClientAssociation<std::net::TcpStream>,
    pc_id: u8,
    sop_class_uid: &str,
    sop_instance_uid: &str,
    dataset_bytes: &[u8],
    message_id: u16,
) -> Result<u16> {
    let command = Dataset::command_from_element_iter([
        DataElement::new(
            tags::AFFECTED_SOP_CLASS_UID,
            VR::UI,
            PrimitiveValue::from(sop_class_uid),
        ),
        DataElement::new(tags::COMMAND_FIELD, VR::US, PrimitiveValue::from(C_STORE_RQ)),
        DataElement::new(tags::MESSAGE_ID, VR::US, PrimitiveValue::from(message_id)),
        DataElement::new(tags::PRIORITY, VR::US, PrimitiveValue::from(0x0000_u16)),
        DataElement::new(
            tags::COMMAND_DATA_SET_TYPE,
            VR::US,
            PrimitiveValue::from(DATA_SET_PRESENT),
        ),
        DataElement::new(
            tags::AFFECTED_SOP_INSTANCE_UID,
            VR::UI,
            PrimitiveValue::from(sop_instance_uid),
        ),
    ]);
    send_command(assoc, pc_id, &command)?;
    send_dataset(assoc, pc_id, dataset_bytes)?;

    let message = receive_message(assoc)?;
    message.status()
}
