//! In-memory study -> series -> instance UID tree populated from C-FIND
//! responses and updated from C-MOVE status reports.

use std::collections::BTreeMap;

use dicom::dictionary_std::tags;

use crate::dicom_access::{Dataset, ElementAccess};

/// DIMSE status: success.
pub const C_SUCCESS: u16 = 0x0000;
/// DIMSE status: pending (with identifier).
pub const C_PENDING_A: u16 = 0xFF00;
/// DIMSE status: pending (identifier optional).
pub const C_PENDING_B: u16 = 0xFF01;
/// DIMSE status: warning (sub-operations completed, one or more failed).
pub const C_WARNING: u16 = 0xB000;
/// DIMSE status: refused, out of resources.
pub const C_OUT_OF_RESOURCES: u16 = 0xA700;
/// DIMSE status: cancelled.
pub const C_CANCEL: u16 = 0xFE00;

pub fn status_is_pending(status: u16) -> bool {
    status == C_PENDING_A || status == C_PENDING_B
}

/// Aggregate C-MOVE sub-operation counters. Asynchronous peers may report
/// regressing numbers; observed values never lower a counter, and
/// `remaining` clamps at zero.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubOpCounters {
    pub completed: u16,
    pub failed: u16,
    pub remaining: u16,
    pub warning: u16,
}

impl SubOpCounters {
    /// Updates from a C-MOVE response command set. A missing remaining
    /// count (terminal statuses) clamps remaining to zero.
    pub fn update_from_status(&mut self, status: &Dataset) {
        // Remaining tracks the latest report and can only shrink to zero;
        // the other counters are monotone and ignore stale regressions.
        self.remaining = status
            .element_u32(tags::NUMBER_OF_REMAINING_SUBOPERATIONS)
            .map(|remaining| remaining.min(u32::from(u16::MAX)) as u16)
            .unwrap_or(0);
        if let Some(completed) = status.element_u32(tags::NUMBER_OF_COMPLETED_SUBOPERATIONS) {
            self.completed = self.completed.max(completed as u16);
        }
        if let Some(failed) = status.element_u32(tags::NUMBER_OF_FAILED_SUBOPERATIONS) {
            self.failed = self.failed.max(failed as u16);
        }
        if let Some(warning) = status.element_u32(tags::NUMBER_OF_WARNING_SUBOPERATIONS) {
            self.warning = self.warning.max(warning as u16);
        }
    }

    /// Per-instance moves report one sub-operation at a time; counters are
    /// accumulated instead of replaced.
    pub fn accumulate_single(&mut self, status: &Dataset, status_code: u16) {
        if status_code == C_SUCCESS {
            self.completed += 1;
        }
        if let Some(failed) = status.element_u32(tags::NUMBER_OF_FAILED_SUBOPERATIONS) {
            self.failed = self.failed.saturating_add(failed as u16);
        }
        if let Some(warning) = status.element_u32(tags::NUMBER_OF_WARNING_SUBOPERATIONS) {
            self.warning = self.warning.saturating_add(warning as u16);
        }
    }
}

#[derive(Debug, Clone)]
pub struct InstanceUidHierarchy {
    pub uid: String,
    pub number: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct SeriesUidHierarchy {
    pub uid: String,
    pub number: Option<u32>,
    pub modality: Option<String>,
    pub sop_class_uid: Option<String>,
    pub description: Option<String>,
    /// From NumberOfSeriesRelatedInstances, overwritten by the actual count
    /// after an instance-level probe.
    pub instance_count: u32,
    pub instances: BTreeMap<String, InstanceUidHierarchy>,
    pub sub_ops: SubOpCounters,
}

impl SeriesUidHierarchy {
    pub fn new(uid: &str) -> Self {
        Self {
            uid: uid.to_string(),
            number: None,
            modality: None,
            sop_class_uid: None,
            description: None,
            instance_count: 0,
            instances: BTreeMap::new(),
            sub_ops: SubOpCounters::default(),
        }
    }

    pub fn find_instance(&self, instance_uid: &str) -> Option<&InstanceUidHierarchy> {
        self.instances.get(instance_uid)
    }
}

/// One study known to a remote peer, with the patient id it belongs to and
/// the running state of its retrieval.
#[derive(Debug, Clone)]
pub struct StudyUidHierarchy {
    pub uid: String,
    pub patient_id: String,
    pub last_error_msg: Option<String>,
    pub pending_instances: u32,
    pub series: BTreeMap<String, SeriesUidHierarchy>,
    pub sub_ops: SubOpCounters,
}

impl StudyUidHierarchy {
    pub fn new(uid: &str, patient_id: &str) -> Self {
        Self {
            uid: uid.to_string(),
            patient_id: patient_id.to_string(),
            last_error_msg: None,
            pending_instances: 0,
            series: BTreeMap::new(),
            sub_ops: SubOpCounters::default(),
        }
    }

    /// Total instances known across all series.
    pub fn instance_count(&self) -> u32 {
        self.series.values().map(|s| s.instance_count).sum()
    }

    pub fn instances(&self) -> impl Iterator<Item = &InstanceUidHierarchy> {
        self.series.values().flat_map(|s| s.instances.values())
    }

    pub fn update_move_states(&mut self, status: &Dataset) {
        self.sub_ops.update_from_status(status);
    }

    /// O(series) search for an instance UID.
    pub fn find_instance(&self, instance_uid: &str) -> Option<&InstanceUidHierarchy> {
        self.series
            .values()
            .find_map(|s| s.find_instance(instance_uid))
    }
}
