//! Shared fixtures: a scripted in-process DICOM peer that answers C-FIND
//! from a fixed single-series study, pushes instances on C-MOVE, and
//! counts the C-STOREs it receives as an export destination.
#![allow(dead_code)]

use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use dicom::core::{DataElement, PrimitiveValue, VR};
use dicom::dictionary_std::{tags, StandardDataDictionary};
use dicom::encoding::TransferSyntaxIndex;
use dicom::object::InMemDicomObject;
use dicom::transfer_syntax::TransferSyntaxRegistry;
use dicom_ul::association::server::ServerAssociationOptions;
use dicom_ul::pdu::{PDataValue, PDataValueType, Pdu};
use dicom_ul::ServerAssociation;

use dicom_anonymizer::config::{
    DicomNode, NetworkTimeouts, STUDY_ROOT_FIND, STUDY_ROOT_MOVE, VERIFICATION_CLASS,
};
use dicom_anonymizer::dicom_access::{Dataset, ElementAccess};
use dicom_anonymizer::dimse::{self, DicomClient};

pub const SITE_ID: &str = "RSNA-0001";
pub const UID_ROOT: &str = "1.2.826.0.1.3680043.10.474";
pub const SECONDARY_CAPTURE: &str = "1.2.840.10008.5.1.4.1.1.7";
pub const EXPLICIT_VR_LE: &str = "1.2.840.10008.1.2.1";
pub const IMPLICIT_VR_LE: &str = "1.2.840.10008.1.2";

const C_STORE_RQ: u16 = 0x0001;
const C_FIND_RQ: u16 = 0x0020;
const C_MOVE_RQ: u16 = 0x0021;
const C_ECHO_RQ: u16 = 0x0030;
const C_SUCCESS: u16 = 0x0000;
const C_PENDING: u16 = 0xFF00;
const NO_DATA_SET: u16 = 0x0101;
const DATA_SET_PRESENT: u16 = 0x0000;

/// Builds a complete storable instance dataset.
pub fn instance_dataset(patient_id: &str, study: &str, series: &str, sop: &str) -> Dataset {
    let mut ds = InMemDicomObject::new_empty_with_dict(StandardDataDictionary);
    for (tag, vr, value) in [
        (tags::SOP_CLASS_UID, VR::UI, SECONDARY_CAPTURE),
        (tags::SOP_INSTANCE_UID, VR::UI, sop),
        (tags::STUDY_INSTANCE_UID, VR::UI, study),
        (tags::SERIES_INSTANCE_UID, VR::UI, series),
        (tags::PATIENT_ID, VR::LO, patient_id),
        (tags::PATIENT_NAME, VR::PN, "MOVED^PATIENT"),
        (tags::STUDY_DATE, VR::DA, "20230501"),
        (tags::MODALITY, VR::CS, "CT"),
    ] {
        ds.put(DataElement::new(tag, vr, PrimitiveValue::from(value)));
    }
    ds
}

/// One scripted remote peer serving a single-series study.
pub struct PeerFixture {
    pub aet: String,
    pub patient_id: String,
    pub study_uid: String,
    pub series_uid: String,
    /// Every SOP instance UID the peer reports at IMAGE level.
    pub instance_uids: Vec<String>,
    /// How many instances a STUDY-level C-MOVE actually delivers (a prefix
    /// of `instance_uids`); IMAGE-level moves always deliver.
    pub study_move_deliveries: usize,
    /// Where C-MOVE pushes instances; `None` for pure query/store peers.
    pub move_dest: Option<DicomNode>,
    /// C-STOREs received by this peer as an export destination.
    pub stores_received: Arc<AtomicUsize>,
}

/// Serves associations on the listener until the test process exits.
pub fn spawn_peer(listener: TcpListener, fixture: PeerFixture) -> JoinHandle<()> {
    thread::Builder::new()
        .name(format!("peer-{}", fixture.aet))
        .spawn(move || {
            for stream in listener.incoming() {
                let Ok(stream) = stream else { break };
                // A failed association must not kill the peer.
                let _ = serve_association(stream, &fixture);
            }
        })
        .expect("spawn test peer")
}

type PeerResult<T> = std::result::Result<T, Box<dyn std::error::Error>>;

fn serve_association(stream: TcpStream, fixture: &PeerFixture) -> PeerResult<()> {
    let options = ServerAssociationOptions::new()
        .accept_any()
        .ae_title(fixture.aet.clone())
        .with_abstract_syntax(VERIFICATION_CLASS)
        .with_abstract_syntax(STUDY_ROOT_FIND)
        .with_abstract_syntax(STUDY_ROOT_MOVE)
        .with_abstract_syntax(SECONDARY_CAPTURE)
        .with_transfer_syntax(IMPLICIT_VR_LE)
        .with_transfer_syntax(EXPLICIT_VR_LE);
    let mut assoc = options.establish(stream)?;

    let mut command_buffer: Vec<u8> = Vec::new();
    let mut data_buffer: Vec<u8> = Vec::new();
    let mut pending: Option<(u16, u16, String)> = None;

    loop {
        let pdu = match assoc.receive() {
            Ok(pdu) => pdu,
            Err(_) => return Ok(()),
        };
        match pdu {
            Pdu::PData { data } => {
                for value in data {
                    let pc_id = value.presentation_context_id;
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
                            )?;
                            command_buffer.clear();
                            let field = command.element(tags::COMMAND_FIELD)?.to_int::<u16>()?;
                            let msg_id = command.element(tags::MESSAGE_ID)?.to_int::<u16>()?;
                            let sop_class = command
                                .element_trimmed(tags::AFFECTED_SOP_CLASS_UID)
                                .unwrap_or_default();
                            if field == C_ECHO_RQ {
                                send_command(
                                    &mut assoc,
                                    pc_id,
                                    &response_command(0x8030, msg_id, C_SUCCESS, &sop_class),
                                )?;
                            } else {
                                pending = Some((field, msg_id, sop_class));
                                data_buffer.clear();
                            }
                        }
                        PDataValueType::Data => {
                            data_buffer.extend_from_slice(&value.data);
                            if !value.is_last {
                                continue;
                            }
                            let Some((field, msg_id, sop_class)) = pending.take() else {
                                data_buffer.clear();
                                continue;
                            };
                            let identifier = decode(&assoc, pc_id, &data_buffer)?;
                            data_buffer.clear();
                            match field {
                                C_FIND_RQ => {
                                    handle_find(
                                        &mut assoc, pc_id, msg_id, &sop_class, &identifier,
                                        fixture,
                                    )?;
                                }
                                C_MOVE_RQ => {
                                    handle_move(
                                        &mut assoc, pc_id, msg_id, &sop_class, &identifier,
                                        fixture,
                                    )?;
                                }
                                C_STORE_RQ => {
                                    fixture.stores_received.fetch_add(1, Ordering::SeqCst);
                                    send_command(
                                        &mut assoc,
                                        pc_id,
                                        &response_command(0x8001, msg_id, C_SUCCESS, &sop_class),
                                    )?;
                                }
                                _ => {
                                    send_command(
                                        &mut assoc,
                                        pc_id,
                                        &response_command(
                                            field | 0x8000,
                                            msg_id,
                                            0x0211,
                                            &sop_class,
                                        ),
                                    )?;
                                }
                            }
                        }
                    }
                }
            }
            Pdu::ReleaseRQ => {
                let _ = assoc.send(&Pdu::ReleaseRP);
                return Ok(());
            }
            Pdu::AbortRQ { .. } => return Ok(()),
            _ => return Ok(()),
        }
    }
}

fn handle_find(
    assoc: &mut ServerAssociation<std::net::TcpStream>,
    pc_id: u8,
    msg_id: u16,
    sop_class: &str,
    identifier: &Dataset,
    fixture: &PeerFixture,
) -> PeerResult<()> {
    let level = identifier
        .element_trimmed(tags::QUERY_RETRIEVE_LEVEL)
        .unwrap_or_default();
    let results: Vec<Dataset> = if level == "SERIES" {
        vec![Dataset::from_element_iter([
            DataElement::new(
                tags::STUDY_INSTANCE_UID,
                VR::UI,
                PrimitiveValue::from(fixture.study_uid.as_str()),
            ),
            DataElement::new(
                tags::SERIES_INSTANCE_UID,
                VR::UI,
                PrimitiveValue::from(fixture.series_uid.as_str()),
            ),
            DataElement::new(tags::SERIES_NUMBER, VR::IS, PrimitiveValue::from("1")),
            DataElement::new(
                tags::SERIES_DESCRIPTION,
                VR::LO,
                PrimitiveValue::from("axial"),
            ),
            DataElement::new(tags::MODALITY, VR::CS, PrimitiveValue::from("CT")),
            DataElement::new(
                tags::SOP_CLASS_UID,
                VR::UI,
                PrimitiveValue::from(SECONDARY_CAPTURE),
            ),
            DataElement::new(
                tags::NUMBER_OF_SERIES_RELATED_INSTANCES,
                VR::IS,
                PrimitiveValue::from(fixture.instance_uids.len().to_string()),
            ),
        ])]
    } else {
        fixture
            .instance_uids
            .iter()
            .enumerate()
            .map(|(i, uid)| {
                Dataset::from_element_iter([
                    DataElement::new(
                        tags::STUDY_INSTANCE_UID,
                        VR::UI,
                        PrimitiveValue::from(fixture.study_uid.as_str()),
                    ),
                    DataElement::new(
                        tags::SERIES_INSTANCE_UID,
                        VR::UI,
                        PrimitiveValue::from(fixture.series_uid.as_str()),
                    ),
                    DataElement::new(
                        tags::SOP_INSTANCE_UID,
                        VR::UI,
                        PrimitiveValue::from(uid.as_str()),
                    ),
                    DataElement::new(
                        tags::INSTANCE_NUMBER,
                        VR::IS,
                        PrimitiveValue::from((i + 1).to_string()),
                    ),
                ])
            })
            .collect()
    };

    for result in &results {
        send_command(
            assoc,
            pc_id,
            &pending_find_response(msg_id, sop_class),
        )?;
        send_data(assoc, pc_id, result)?;
    }
    send_command(assoc, pc_id, &response_command(0x8020, msg_id, C_SUCCESS, sop_class))
}

fn handle_move(
    assoc: &mut ServerAssociation<std::net::TcpStream>,
    pc_id: u8,
    msg_id: u16,
    sop_class: &str,
    identifier: &Dataset,
    fixture: &PeerFixture,
) -> PeerResult<()> {
    let level = identifier
        .element_trimmed(tags::QUERY_RETRIEVE_LEVEL)
        .unwrap_or_default();
    let to_send: Vec<String> = if level == "IMAGE" {
        identifier
            .element_trimmed(tags::SOP_INSTANCE_UID)
            .into_iter()
            .collect()
    } else {
        fixture
            .instance_uids
            .iter()
            .take(fixture.study_move_deliveries)
            .cloned()
            .collect()
    };
    let delivered = deliver(fixture, &to_send);
    send_command(
        assoc,
        pc_id,
        &move_response(msg_id, sop_class, delivered),
    )
}

/// Pushes the given instances to the move destination over a fresh
/// association, returning how many C-STOREs succeeded.
fn deliver(fixture: &PeerFixture, sop_uids: &[String]) -> u16 {
    let Some(dest) = &fixture.move_dest else {
        return 0;
    };
    let client = DicomClient::new(&fixture.aet, NetworkTimeouts::default());
    let contexts = vec![(
        SECONDARY_CAPTURE.to_string(),
        vec![EXPLICIT_VR_LE.to_string()],
    )];
    let Ok(mut assoc) = client.connect(dest, &contexts) else {
        return 0;
    };
    let Ok((pc_id, ts_uid)) = dimse::accepted_context_with_ts(&assoc) else {
        return 0;
    };
    let Some(ts) = TransferSyntaxRegistry.get(&ts_uid) else {
        return 0;
    };

    let mut sent = 0u16;
    for (i, sop_uid) in sop_uids.iter().enumerate() {
        let ds = instance_dataset(
            &fixture.patient_id,
            &fixture.study_uid,
            &fixture.series_uid,
            sop_uid,
        );
        let mut bytes = Vec::new();
        if ds.write_dataset_with_ts(&mut bytes, ts).is_err() {
            continue;
        }
        if let Ok(C_SUCCESS) =
            dimse::store(&mut assoc, pc_id, SECONDARY_CAPTURE, sop_uid, &bytes, (i + 1) as u16)
        {
            sent += 1;
        }
    }
    let _ = assoc.release();
    sent
}

fn response_command(field: u16, msg_id: u16, status: u16, sop_class: &str) -> Dataset {
    let mut elements = vec![
        DataElement::new(tags::COMMAND_FIELD, VR::US, PrimitiveValue::from(field)),
        DataElement::new(
            tags::MESSAGE_ID_BEING_RESPONDED_TO,
            VR::US,
            PrimitiveValue::from(msg_id),
        ),
        DataElement::new(
            tags::COMMAND_DATA_SET_TYPE,
            VR::US,
            PrimitiveValue::from(NO_DATA_SET),
        ),
        DataElement::new(tags::STATUS, VR::US, PrimitiveValue::from(status)),
    ];
    if !sop_class.is_empty() {
        elements.push(DataElement::new(
            tags::AFFECTED_SOP_CLASS_UID,
            VR::UI,
            PrimitiveValue::from(sop_class),
        ));
    }
    Dataset::command_from_element_iter(elements)
}

fn pending_find_response(msg_id: u16, sop_class: &str) -> Dataset {
    Dataset::command_from_element_iter([
        DataElement::new(
            tags::AFFECTED_SOP_CLASS_UID,
            VR::UI,
            PrimitiveValue::from(sop_class),
        ),
        DataElement::new(tags::COMMAND_FIELD, VR::US, PrimitiveValue::from(0x8020_u16)),
        DataElement::new(
            tags::MESSAGE_ID_BEING_RESPONDED_TO,
            VR::US,
            PrimitiveValue::from(msg_id),
        ),
        DataElement::new(
            tags::COMMAND_DATA_SET_TYPE,
            VR::US,
            PrimitiveValue::from(DATA_SET_PRESENT),
        ),
        DataElement::new(tags::STATUS, VR::US, PrimitiveValue::from(C_PENDING)),
    ])
}

fn move_response(msg_id: u16, sop_class: &str, completed: u16) -> Dataset {
    Dataset::command_from_element_iter([
        DataElement::new(
            tags::AFFECTED_SOP_CLASS_UID,
            VR::UI,
            PrimitiveValue::from(sop_class),
        ),
        DataElement::new(tags::COMMAND_FIELD, VR::US, PrimitiveValue::from(0x8021_u16)),
        DataElement::new(
            tags::MESSAGE_ID_BEING_RESPONDED_TO,
            VR::US,
            PrimitiveValue::from(msg_id),
        ),
        DataElement::new(
            tags::COMMAND_DATA_SET_TYPE,
            VR::US,
            PrimitiveValue::from(NO_DATA_SET),
        ),
        DataElement::new(tags::STATUS, VR::US, PrimitiveValue::from(C_SUCCESS)),
        DataElement::new(
            tags::NUMBER_OF_COMPLETED_SUBOPERATIONS,
            VR::US,
            PrimitiveValue::from(completed),
        ),
        DataElement::new(
            tags::NUMBER_OF_FAILED_SUBOPERATIONS,
            VR::US,
            PrimitiveValue::from(0_u16),
        ),
        DataElement::new(
            tags::NUMBER_OF_WARNING_SUBOPERATIONS,
            VR::US,
            PrimitiveValue::from(0_u16),
        ),
    ])
}

fn decode(assoc: &ServerAssociation<std::net::TcpStream>, pc_id: u8, bytes: &[u8]) -> PeerResult<Dataset> {
    let ts_uid = assoc
        .presentation_contexts()
        .iter()
        .find(|pc| pc.id == pc_id)
        .map(|pc| pc.transfer_syntax.to_string())
        .ok_or("unknown presentation context")?;
    let ts = TransferSyntaxRegistry
        .get(&ts_uid)
        .ok_or("unsupported transfer syntax")?;
    Ok(Dataset::read_dataset_with_ts(bytes, ts)?)
}

fn send_command(assoc: &mut ServerAssociation<std::net::TcpStream>, pc_id: u8, command: &Dataset) -> PeerResult<()> {
    let mut data = Vec::new();
    command.write_dataset_with_ts(
        &mut data,
        &dicom::transfer_syntax::entries::IMPLICIT_VR_LITTLE_ENDIAN.erased(),
    )?;
    assoc.send(&Pdu::PData {
        data: vec![PDataValue {
            presentation_context_id: pc_id,
            value_type: PDataValueType::Command,
            is_last: true,
            data,
        }],
    })?;
    Ok(())
}

fn send_data(assoc: &mut ServerAssociation<std::net::TcpStream>, pc_id: u8, ds: &Dataset) -> PeerResult<()> {
    let ts_uid = assoc
        .presentation_contexts()
        .iter()
        .find(|pc| pc.id == pc_id)
        .map(|pc| pc.transfer_syntax.to_string())
        .ok_or("unknown presentation context")?;
    let ts = TransferSyntaxRegistry
        .get(&ts_uid)
        .ok_or("unsupported transfer syntax")?;
    let mut bytes = Vec::new();
    ds.write_dataset_with_ts(&mut bytes, ts)?;
    assoc.send(&Pdu::PData {
        data: vec![PDataValue {
            presentation_context_id: pc_id,
            value_type: PDataValueType::Data,
            is_last: true,
            data: bytes,
        }],
    })?;
    Ok(())
}
