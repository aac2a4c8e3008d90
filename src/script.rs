//! Parser for the CTP-style XML anonymizer script. Each `<e>` element
//! names a tag to keep together with the operation applied to its value;
//! tags not listed fall through to the engine's group sweep rules.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use dicom::core::Tag;
use quick_xml::events::Event;
use quick_xml::Reader;
use tracing::info;

use crate::error::{AnonymizerError, Result};

/// Tag of PatientID, the default hash source for `@hashdate`.
const PATIENT_ID_TAG: Tag = Tag(0x0010, 0x0020);

/// The scripted per-element operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptOp {
    /// Retain the element as-is.
    Keep,
    /// Delete the element from the dataset.
    Remove,
    /// Clear the value, retain the element.
    Empty,
    /// Shift the date value by the patient's date delta; the tag names the
    /// element the delta is derived from.
    HashDate(Tag),
    /// Round numeric age strings (NNN[DWMY]) to the nearest multiple of the
    /// width, preserving the unit suffix.
    Round(u32),
    /// Replace with the anonymized patient id.
    PatientId,
    /// Replace with the anonymized accession number.
    Accession,
    /// Replace with the anonymized UID.
    Uid,
}

/// A parsed anonymizer script: ordered tag -> operation entries.
#[derive(Debug, Clone, Default)]
pub struct AnonymizerScript {
    entries: BTreeMap<Tag, ScriptOp>,
}

impl AnonymizerScript {
    pub fn lookup(&self, tag: Tag) -> Option<ScriptOp> {
        self.entries.get(&tag).copied()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Parses the XML script text.
    pub fn parse(text: &str) -> Result<Self> {
        let mut reader = Reader::from_str(text);
        reader.config_mut().trim_text(true);

        let mut entries = BTreeMap::new();
        let mut current_tag: Option<Tag> = None;
        let mut current_text = String::new();

        loop {
            match reader.read_event() {
                Ok(Event::Start(ref e)) if e.name().as_ref() == b"e" => {
                    current_text.clear();
                    current_tag = None;
                    for attr in e.attributes().flatten() {
                        if attr.key.as_ref() == b"t" {
                            let raw = String::from_utf8_lossy(&attr.value).to_string();
                            current_tag = parse_tag(&raw);
                        }
                    }
                }
                Ok(Event::Text(ref t)) => {
                    if current_tag.is_some() {
                        current_text.push_str(
                            &t.unescape()
                                .map_err(|e| AnonymizerError::Script(e.to_string()))?,
                        );
                    }
                }
                Ok(Event::End(ref e)) if e.name().as_ref() == b"e" => {
                    if let Some(tag) = current_tag.take() {
                        entries.insert(tag, parse_operation(&current_text));
                    }
                }
                Ok(Event::Empty(ref e)) if e.name().as_ref() == b"e" => {
                    for attr in e.attributes().flatten() {
                        if attr.key.as_ref() == b"t" {
                            let raw = String::from_utf8_lossy(&attr.value).to_string();
                            if let Some(tag) = parse_tag(&raw) {
                                entries.insert(tag, ScriptOp::Keep);
                            }
                        }
                    }
                }
                Ok(Event::Eof) => break,
                Ok(_) => {}
                Err(e) => {
                    return Err(AnonymizerError::Script(format!(
                        "script parse error at byte {}: {e}",
                        reader.buffer_position()
                    )))
                }
            }
        }

        if entries.is_empty() {
            return Err(AnonymizerError::Script(
                "script contains no tag entries".into(),
            ));
        }

        let scripted = entries.values().filter(|op| **op != ScriptOp::Keep).count();
        info!(
            entries = entries.len(),
            operations = scripted,
            "anonymizer script loaded"
        );
        Ok(Self { entries })
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).map_err(|e| AnonymizerError::io(path, e))?;
        Self::parse(&text)
    }

    /// The script shipped with the crate, applied when the project does not
    /// configure its own.
    pub fn default_script() -> Self {
        Self::parse(DEFAULT_SCRIPT).expect("embedded default script parses")
    }
}

/// Parses a `GGGGEEEE` hex tag attribute.
fn parse_tag(raw: &str) -> Option<Tag> {
    let cleaned: String = raw.chars().filter(|c| c.is_ascii_hexdigit()).collect();
    if cleaned.len() != 8 {
        return None;
    }
    let group = u16::from_str_radix(&cleaned[..4], 16).ok()?;
    let element = u16::from_str_radix(&cleaned[4..], 16).ok()?;
    Some(Tag(group, element))
}

fn parse_operation(text: &str) -> ScriptOp {
    let op = text.trim();
    if op.is_empty() || op.contains("@keep") {
        ScriptOp::Keep
    } else if op.contains("@remove") {
        ScriptOp::Remove
    } else if op.contains("@empty") {
        ScriptOp::Empty
    } else if op.contains("@hashdate") {
        ScriptOp::HashDate(argument(op).and_then(|a| parse_tag(&a)).unwrap_or(PATIENT_ID_TAG))
    } else if op.contains("@round") {
        ScriptOp::Round(
            argument(op)
                .and_then(|a| a.trim().parse().ok())
                .unwrap_or(5),
        )
    } else if op.contains("@ptid") {
        ScriptOp::PatientId
    } else if op.contains("@acc") {
        ScriptOp::Accession
    } else if op.contains("@uid") {
        ScriptOp::Uid
    } else {
        // Unknown operation text keeps the element untouched.
        ScriptOp::Keep
    }
}

/// Extracts the last parenthesized argument, e.g. `@hashdate(this,00100020)`.
fn argument(op: &str) -> Option<String> {
    let open = op.find('(')?;
    let close = op[open..].find(')')? + open;
    let inner = &op[open + 1..close];
    inner.rsplit(',').next().map(|s| s.trim().to_string())
}

/// Default de-identification script covering the basic confidentiality
/// profile for the supported modalities.
const DEFAULT_SCRIPT: &str = r#"<script>
  <e en="T" t="00080016">@keep</e>
  <e en="T" t="00080018">@uid</e>
  <e en="T" t="00080020">@hashdate(this,00100020)</e>
  <e en="T" t="00080021">@hashdate(this,00100020)</e>
  <e en="T" t="00080022">@hashdate(this,00100020)</e>
  <e en="T" t="00080023">@hashdate(this,00100020)</e>
  <e en="T" t="00080030">@keep</e>
  <e en="T" t="00080050">@acc</e>
  <e en="T" t="00080060">@keep</e>
  <e en="T" t="00080070">@keep</e>
  <e en="T" t="00080080">@remove</e>
  <e en="T" t="00080090">@empty</e>
  <e en="T" t="00081030">@keep</e>
  <e en="T" t="0008103E">@keep</e>
  <e en="T" t="00081090">@keep</e>
  <e en="T" t="00100010">@ptid</e>
  <e en="T" t="00100020">@ptid</e>
  <e en="T" t="00100030">@empty</e>
  <e en="T" t="00100040">@keep</e>
  <e en="T" t="00101010">@round(5)</e>
  <e en="T" t="00102160">@empty</e>
  <e en="T" t="0020000D">@uid</e>
  <e en="T" t="0020000E">@uid</e>
  <e en="T" t="00200010">@empty</e>
  <e en="T" t="00200011">@keep</e>
  <e en="T" t="00200013">@keep</e>
  <e en="T" t="00200052">@uid</e>
  <e en="T" t="00200200">@uid</e>
  <e en="T" t="00280010">@keep</e>
  <e en="T" t="00280011">@keep</e>
  <e en="T" t="00280100">@keep</e>
  <e en="T" t="00280101">@keep</e>
  <e en="T" t="00280102">@keep</e>
  <e en="T" t="00280103">@keep</e>
  <e en="T" t="00280002">@keep</e>
  <e en="T" t="00280004">@keep</e>
  <e en="T" t="00280030">@keep</e>
  <e en="T" t="00281050">@keep</e>
  <e en="T" t="00281051">@keep</e>
  <e en="T" t="00281052">@keep</e>
  <e en="T" t="00281053">@keep</e>
</script>
"#;
