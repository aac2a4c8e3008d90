use dicom::core::{DataElement, PrimitiveValue, VR};
use dicom::dictionary_std::{tags, StandardDataDictionary};
use dicom::object::InMemDicomObject;
use tempfile::TempDir;

use dicom_anonymizer::dicom_access::Dataset;
use dicom_anonymizer::error::AnonymizerError;
use dicom_anonymizer::java_index::JavaIndexedStudy;
use dicom_anonymizer::phi_index::PhiIndex;

const SITE_ID: &str = "RSNA-0001";
const UID_ROOT: &str = "1.2.826.0.1.3680043.10.474";

fn dataset(patient_id: &str, study: &str, series: &str, instance: &str) -> Dataset {
    let mut ds = InMemDicomObject::new_empty_with_dict(StandardDataDictionary);
    ds.put(DataElement::new(
        tags::SOP_CLASS_UID,
        VR::UI,
        PrimitiveValue::from("1.2.840.10008.5.1.4.1.1.7"),
    ));
    ds.put(DataElement::new(
        tags::PATIENT_ID,
        VR::LO,
        PrimitiveValue::from(patient_id),
    ));
    ds.put(DataElement::new(
        tags::PATIENT_NAME,
        VR::PN,
        PrimitiveValue::from("DOE^JANE"),
    ));
    ds.put(DataElement::new(
        tags::STUDY_INSTANCE_UID,
        VR::UI,
        PrimitiveValue::from(study),
    ));
    ds.put(DataElement::new(
        tags::SERIES_INSTANCE_UID,
        VR::UI,
        PrimitiveValue::from(series),
    ));
    ds.put(DataElement::new(
        tags::SOP_INSTANCE_UID,
        VR::UI,
        PrimitiveValue::from(instance),
    ));
    ds.put(DataElement::new(
        tags::STUDY_DATE,
        VR::DA,
        PrimitiveValue::from("20210304"),
    ));
    ds.put(DataElement::new(
        tags::MODALITY,
        VR::CS,
        PrimitiveValue::from("CT"),
    ));
    ds
}

#[test]
fn lookup_tables_round_trip_and_stay_unique() {
    let index = PhiIndex::new(SITE_ID, UID_ROOT);

    let a = index.get_next_anon_patient_id("P1").unwrap();
    let b = index.get_next_anon_patient_id("P2").unwrap();
    assert_eq!(a, "RSNA-0001-000001");
    assert_eq!(b, "RSNA-0001-000002");
    // Same key yields the same mapping, not a fresh allocation.
    assert_eq!(index.get_next_anon_patient_id("P1").unwrap(), a);
    assert_eq!(index.get_anon_patient_id("P1"), Some(a.clone()));

    let u1 = index.get_next_anon_uid("1.2.3");
    let u2 = index.get_next_anon_uid("1.2.4");
    assert_eq!(u1, format!("{UID_ROOT}.{SITE_ID}.1"));
    assert_eq!(u2, format!("{UID_ROOT}.{SITE_ID}.2"));
    assert_eq!(index.get_next_anon_uid("1.2.3"), u1);
    assert!(index.uid_received("1.2.3"));

    let acc1 = index.get_next_anon_acc_no("A1");
    let acc2 = index.get_next_anon_acc_no("A2");
    assert_eq!(acc1, "1");
    assert_eq!(acc2, "2");
    assert_eq!(index.get_anon_acc_no("A1"), Some(acc1));
}

#[test]
fn capture_phi_maintains_totals_and_tree() {
    let index = PhiIndex::new(SITE_ID, UID_ROOT);

    index
        .capture_phi("src", &dataset("P1", "1.2.3", "1.2.3.1", "1.2.3.1.1"), 42)
        .unwrap();
    index
        .capture_phi("src", &dataset("P1", "1.2.3", "1.2.3.1", "1.2.3.1.2"), 42)
        .unwrap();
    index
        .capture_phi("src", &dataset("P1", "1.2.3", "1.2.3.2", "1.2.3.2.1"), 42)
        .unwrap();
    index
        .capture_phi("src", &dataset("P2", "1.2.9", "1.2.9.1", "1.2.9.1.1"), 7)
        .unwrap();

    let totals = index.get_totals();
    assert_eq!(
        (totals.patients, totals.studies, totals.series, totals.instances),
        (2, 2, 3, 4)
    );

    let anon = index.get_anon_patient_id("P1").unwrap();
    let phi = index.get_phi(&anon).unwrap();
    assert_eq!(phi.patient_id, "P1");
    assert_eq!(phi.patient_name, "DOE^JANE");
    assert_eq!(phi.studies.len(), 1);
    assert_eq!(phi.studies[0].series.len(), 2);
    assert_eq!(phi.studies[0].stored_instance_count(), 3);
    assert_eq!(index.get_phi_name(&anon).as_deref(), Some("DOE^JANE"));

    // Duplicate instances are rejected without counter movement.
    let dup = index.capture_phi("src", &dataset("P1", "1.2.3", "1.2.3.1", "1.2.3.1.1"), 42);
    assert!(matches!(dup, Err(AnonymizerError::AlreadyPresent)));
    assert_eq!(index.get_totals().instances, 4);
}

#[test]
fn reconciliation_queries_track_import_progress() {
    let index = PhiIndex::new(SITE_ID, UID_ROOT);
    index
        .capture_phi("src", &dataset("P1", "1.2.3", "1.2.3.1", "1.2.3.1.1"), 0)
        .unwrap();
    index
        .capture_phi("src", &dataset("P1", "1.2.3", "1.2.3.1", "1.2.3.1.2"), 0)
        .unwrap();

    assert_eq!(index.get_stored_instance_count("P1", "1.2.3"), 2);
    // Unknown patients and studies report the full target as pending.
    assert_eq!(index.get_pending_instance_count("NOPE", "1.2.3", 5), 5);
    assert_eq!(index.get_pending_instance_count("P1", "9.9.9", 5), 5);

    // Latching the target makes study_imported meaningful.
    assert!(!index.study_imported("P1", "1.2.3"));
    assert_eq!(index.get_pending_instance_count("P1", "1.2.3", 3), 1);
    assert!(!index.study_imported("P1", "1.2.3"));
    index
        .capture_phi("src", &dataset("P1", "1.2.3", "1.2.3.1", "1.2.3.1.3"), 0)
        .unwrap();
    assert!(index.study_imported("P1", "1.2.3"));

    assert!(index.series_complete("P1", "1.2.3", "1.2.3.1", 3));
    assert!(!index.series_complete("P1", "1.2.3", "1.2.3.1", 4));
}

#[test]
fn failed_instances_can_be_reimported_after_uid_removal() {
    let index = PhiIndex::new(SITE_ID, UID_ROOT);
    index
        .capture_phi("src", &dataset("P1", "1.2.3", "1.2.3.1", "1.2.3.1.1"), 0)
        .unwrap();
    assert!(index.uid_received("1.2.3.1.1"));

    index.remove_uid("1.2.3.1.1");
    assert!(!index.uid_received("1.2.3.1.1"));
}

#[test]
fn java_index_import_seeds_tables_and_advances_counters() {
    let index = PhiIndex::new(SITE_ID, UID_ROOT);
    let rows = vec![
        JavaIndexedStudy {
            anon_patient_name: "RSNA-0001-000017".into(),
            anon_patient_id: "RSNA-0001-000017".into(),
            phi_patient_name: "OLD^PATIENT".into(),
            phi_patient_id: "LEGACY-1".into(),
            date_offset: 123,
            anon_study_date: "20190506".into(),
            phi_study_date: "20190101".into(),
            anon_accession: "41".into(),
            phi_accession: "OLD-ACC".into(),
            anon_study_uid: format!("{UID_ROOT}.{SITE_ID}.90"),
            phi_study_uid: "9.8.7".into(),
        },
        JavaIndexedStudy {
            anon_patient_name: "RSNA-0001-000017".into(),
            anon_patient_id: "RSNA-0001-000017".into(),
            phi_patient_name: "OLD^PATIENT".into(),
            phi_patient_id: "LEGACY-1".into(),
            date_offset: 123,
            anon_study_date: "20191106".into(),
            phi_study_date: "20190701".into(),
            anon_accession: "42".into(),
            phi_accession: "OLD-ACC-2".into(),
            anon_study_uid: format!("{UID_ROOT}.{SITE_ID}.91"),
            phi_study_uid: "9.8.8".into(),
        },
    ];

    index.process_java_phi_studies(&rows);

    // Imported mappings resolve verbatim.
    assert_eq!(
        index.get_anon_patient_id("LEGACY-1").as_deref(),
        Some("RSNA-0001-000017")
    );
    assert_eq!(index.get_anon_acc_no("OLD-ACC").as_deref(), Some("41"));
    assert_eq!(
        index.get_anon_uid("9.8.7").as_deref(),
        Some(format!("{UID_ROOT}.{SITE_ID}.90").as_str())
    );
    let totals = index.get_totals();
    assert_eq!((totals.patients, totals.studies), (1, 2));

    // Counters were advanced past the imported maxima: fresh allocations
    // cannot collide in either direction.
    assert_eq!(
        index.get_next_anon_patient_id("NEW-PT").unwrap(),
        "RSNA-0001-000018"
    );
    assert_eq!(
        index.get_next_anon_uid("5.5.5"),
        format!("{UID_ROOT}.{SITE_ID}.92")
    );
    assert_eq!(index.get_next_anon_acc_no("NEW-ACC"), "43");
}

#[test]
fn snapshot_round_trip_is_byte_identical() {
    let dir = TempDir::new().unwrap();
    let index = PhiIndex::new(SITE_ID, UID_ROOT);
    index
        .capture_phi("src", &dataset("P1", "1.2.3", "1.2.3.1", "1.2.3.1.1"), 11)
        .unwrap();
    index
        .capture_phi("src", &dataset("P2", "1.2.9", "1.2.9.1", "1.2.9.1.1"), 22)
        .unwrap();

    let first = dir.path().join("AnonymizerModel.bin");
    let second = dir.path().join("AnonymizerModel2.bin");
    index.save(&first).unwrap();

    let loaded = PhiIndex::load(&first).unwrap();
    loaded.save(&second).unwrap();

    let bytes_a = std::fs::read(&first).unwrap();
    let bytes_b = std::fs::read(&second).unwrap();
    assert_eq!(bytes_a, bytes_b);

    assert_eq!(loaded.get_totals(), index.get_totals());
    assert_eq!(loaded.get_anon_patient_id("P1"), index.get_anon_patient_id("P1"));
}

#[test]
fn incompatible_snapshot_version_is_refused() {
    let dir = TempDir::new().unwrap();
    let index = PhiIndex::new(SITE_ID, UID_ROOT);
    let path = dir.path().join("AnonymizerModel.bin");
    index.save(&path).unwrap();

    // The version header follows the 4-byte magic.
    let mut bytes = std::fs::read(&path).unwrap();
    bytes[4] = 0xFF;
    std::fs::write(&path, bytes).unwrap();

    match PhiIndex::load(&path) {
        Err(AnonymizerError::ModelVersionMismatch { found, expected }) => {
            assert_ne!(found, expected);
        }
        Err(other) => panic!("expected version mismatch, got {other:?}"),
        Ok(_) => panic!("expected version mismatch, load succeeded"),
    }
}

#[test]
fn dirty_flag_is_set_by_writes_and_taken_once() {
    let index = PhiIndex::new(SITE_ID, UID_ROOT);
    assert!(!index.take_dirty());

    index.get_next_anon_uid("1.2.3");
    assert!(index.take_dirty());
    assert!(!index.take_dirty());
}
