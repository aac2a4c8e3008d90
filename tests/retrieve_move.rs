mod common;

use std::net::TcpListener;
use std::sync::atomic::AtomicUsize;
use std::sync::Arc;

use tempfile::TempDir;

use common::{spawn_peer, PeerFixture, SECONDARY_CAPTURE, SITE_ID, UID_ROOT};
use dicom_anonymizer::config::{DicomNode, NetworkTimeouts, ProjectModel};
use dicom_anonymizer::retrieve::{MoveLevel, MoveStudiesRequest, StudySelection};
use dicom_anonymizer::service::ProjectService;

/// A peer that reports five instances at series level but only delivers
/// three on a STUDY-level C-MOVE. The orchestrator must notice the gap,
/// probe the instance hierarchy, and re-issue C-MOVE at instance level for
/// exactly the missing two, ending with all five stored and counted.
#[test]
fn study_move_steps_down_to_instance_level_for_missing_instances() {
    let dir = TempDir::new().unwrap();
    let peer_listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let peer_port = peer_listener.local_addr().unwrap().port();

    let mut model = ProjectModel::new("TRIAL", SITE_ID, UID_ROOT, dir.path());
    model.storage_classes = vec![SECONDARY_CAPTURE.to_string()];
    model.modalities = vec!["CT".to_string()];
    model.local = DicomNode {
        host: "127.0.0.1".into(),
        port: 0,
        aet: "ANONYMIZER".into(),
    };
    model.remote_nodes.insert(
        "QUERY".into(),
        DicomNode {
            host: "127.0.0.1".into(),
            port: peer_port,
            aet: "TESTPACS".into(),
        },
    );
    // Short grace period so the study-level gap is noticed quickly.
    model.network_timeouts = NetworkTimeouts {
        tcp_connect: 5,
        acse: 10,
        dimse: 10,
        network: 2,
    };

    let service = ProjectService::open(model).expect("open project");
    let scp_addr = service.scp_addr().expect("SCP bound");
    let scp_port: u16 = scp_addr.rsplit(':').next().unwrap().parse().unwrap();

    let instance_uids: Vec<String> = (1..=5).map(|i| format!("1.2.3.1.{i}")).collect();
    let _peer = spawn_peer(
        peer_listener,
        PeerFixture {
            aet: "TESTPACS".into(),
            patient_id: "PT-5".into(),
            study_uid: "1.2.3".into(),
            series_uid: "1.2.3.1".into(),
            instance_uids: instance_uids.clone(),
            study_move_deliveries: 3,
            move_dest: Some(DicomNode {
                host: "127.0.0.1".into(),
                port: scp_port,
                aet: "ANONYMIZER".into(),
            }),
            stores_received: Arc::new(AtomicUsize::new(0)),
        },
    );

    let request = MoveStudiesRequest {
        source: "QUERY".into(),
        dest_aet: "ANONYMIZER".into(),
        level: MoveLevel::Study,
        studies: vec![StudySelection {
            study_uid: "1.2.3".into(),
            patient_id: "PT-5".into(),
        }],
    };
    let results = service.move_studies(&request);

    assert_eq!(results.len(), 1);
    let study = &results[0];
    assert_eq!(
        study.pending_instances, 0,
        "instances still missing after step-down: {:?}",
        study.last_error_msg
    );
    assert!(study.last_error_msg.is_none());
    // Three sub-operations from the study-level move, two accumulated by
    // the instance-level retries.
    assert_eq!(study.sub_ops.completed, 5);
    assert_eq!(study.sub_ops.failed, 0);
    assert_eq!(study.sub_ops.remaining, 0);

    // Everything the peer reported at series level is now stored locally.
    let totals = service.index().get_totals();
    assert_eq!(totals.instances as usize, instance_uids.len());
    assert_eq!(
        service.index().get_stored_instance_count("PT-5", "1.2.3") as usize,
        instance_uids.len()
    );
    assert!(service.index().study_imported("PT-5", "1.2.3"));
    for uid in &instance_uids {
        assert!(service.index().uid_received(uid));
    }

    service.shutdown();
}

/// An INSTANCE-level move request probes the full hierarchy up front and
/// issues one C-MOVE per instance; nothing is left pending and already
/// stored instances are not re-requested on a second run.
#[test]
fn instance_level_move_is_idempotent_across_runs() {
    let dir = TempDir::new().unwrap();
    let peer_listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let peer_port = peer_listener.local_addr().unwrap().port();

    let mut model = ProjectModel::new("TRIAL", SITE_ID, UID_ROOT, dir.path());
    model.storage_classes = vec![SECONDARY_CAPTURE.to_string()];
    model.modalities = vec!["CT".to_string()];
    model.local = DicomNode {
        host: "127.0.0.1".into(),
        port: 0,
        aet: "ANONYMIZER".into(),
    };
    model.remote_nodes.insert(
        "QUERY".into(),
        DicomNode {
            host: "127.0.0.1".into(),
            port: peer_port,
            aet: "TESTPACS".into(),
        },
    );
    model.network_timeouts = NetworkTimeouts {
        tcp_connect: 5,
        acse: 10,
        dimse: 10,
        network: 2,
    };

    let service = ProjectService::open(model).expect("open project");
    let scp_port: u16 = service
        .scp_addr()
        .unwrap()
        .rsplit(':')
        .next()
        .unwrap()
        .parse()
        .unwrap();

    let instance_uids: Vec<String> = (1..=3).map(|i| format!("1.2.7.1.{i}")).collect();
    let _peer = spawn_peer(
        peer_listener,
        PeerFixture {
            aet: "TESTPACS".into(),
            patient_id: "PT-7".into(),
            study_uid: "1.2.7".into(),
            series_uid: "1.2.7.1".into(),
            instance_uids,
            study_move_deliveries: 0,
            move_dest: Some(DicomNode {
                host: "127.0.0.1".into(),
                port: scp_port,
                aet: "ANONYMIZER".into(),
            }),
            stores_received: Arc::new(AtomicUsize::new(0)),
        },
    );

    let request = MoveStudiesRequest {
        source: "QUERY".into(),
        dest_aet: "ANONYMIZER".into(),
        level: MoveLevel::Instance,
        studies: vec![StudySelection {
            study_uid: "1.2.7".into(),
            patient_id: "PT-7".into(),
        }],
    };

    let first = service.move_studies(&request);
    assert_eq!(first[0].pending_instances, 0);
    assert_eq!(first[0].sub_ops.completed, 3);
    assert_eq!(service.index().get_totals().instances, 3);

    // Second run: pre-reconciliation finds everything stored and no
    // C-MOVE is issued at all.
    let second = service.move_studies(&request);
    assert_eq!(second[0].pending_instances, 0);
    assert!(second[0].last_error_msg.is_none());
    assert_eq!(second[0].sub_ops.completed, 0);
    assert_eq!(service.index().get_totals().instances, 3);

    service.shutdown();
}
