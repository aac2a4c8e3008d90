//
// dicom_access.rs
// dicom-anonymizer
//
// Small helpers to pull typed values from DICOM object representations
// uniformly, and to check datasets for required attributes.
//

use dicom::core::Tag;
use dicom::dictionary_std::{tags, StandardDataDictionary};
use dicom::object::{FileDicomObject, InMemDicomObject};

/// The in-memory dataset shape used throughout the pipeline.
pub type Dataset = InMemDicomObject<StandardDataDictionary>;
/// A dataset with file meta attached, ready for file I/O.
pub type FileDataset = FileDicomObject<Dataset>;

/// Attributes every ingested instance must carry.
pub const REQUIRED_ATTRIBUTES: [(Tag, &str); 4] = [
    (tags::SOP_CLASS_UID, "SOPClassUID"),
    (tags::STUDY_INSTANCE_UID, "StudyInstanceUID"),
    (tags::SERIES_INSTANCE_UID, "SeriesInstanceUID"),
    (tags::SOP_INSTANCE_UID, "SOPInstanceUID"),
];

/// Small helper trait to pull string values from different DICOM object shapes.
pub trait ElementAccess {
    fn element_str(&self, tag: Tag) -> Option<String>;

    /// Trimmed string value, with empty values collapsed to `None`.
    fn element_trimmed(&self, tag: Tag) -> Option<String> {
        self.element_str(tag)
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    }

    fn element_u32(&self, tag: Tag) -> Option<u32> {
        self.element_str(tag)
            .and_then(|s| s.trim().parse::<u32>().ok())
    }

    fn has_element(&self, tag: Tag) -> bool {
        self.element_str(tag).is_some()
    }
}

impl ElementAccess for Dataset {
    fn element_str(&self, tag: Tag) -> Option<String> {
        // Many tags are optional; convert missing values into clean Option<String>.
        self.element(tag)
            .ok()
            .and_then(|e| e.to_str().ok())
            .map(|s| s.into_owned())
    }
}

impl ElementAccess for FileDataset {
    fn element_str(&self, tag: Tag) -> Option<String> {
        self.element(tag)
            .ok()
            .and_then(|e| e.to_str().ok())
            .map(|s| s.into_owned())
    }
}

/// Names of the required attributes absent from (or empty in) the dataset.
pub fn missing_attributes<T: ElementAccess>(obj: &T) -> Vec<String> {
    REQUIRED_ATTRIBUTES
        .iter()
        .filter(|(tag, _)| obj.element_trimmed(*tag).is_none())
        .map(|(_, name)| name.to_string())
        .collect()
}
