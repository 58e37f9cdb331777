use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Kind of material submitted for interpretation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DomainType {
    Blood,
    Urine,
    Image,
    #[default]
    Other,
}

impl DomainType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DomainType::Blood => "blood",
            DomainType::Urine => "urine",
            DomainType::Image => "image",
            DomainType::Other => "other",
        }
    }
}

impl fmt::Display for DomainType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DomainType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "blood" => Ok(DomainType::Blood),
            "urine" => Ok(DomainType::Urine),
            "image" => Ok(DomainType::Image),
            "other" => Ok(DomainType::Other),
            other => Err(format!(
                "Unsupported analysis type '{other}', expected one of blood, urine, image, other"
            )),
        }
    }
}

/// Durable pointer to an uploaded blob
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileRef {
    pub filename: String,
    pub content_type: String,
    pub size_bytes: u64,
    pub location: String,
}

impl FileRef {
    pub fn is_image(&self) -> bool {
        self.content_type.starts_with("image/")
    }
}

/// One raw file as received from the transport
#[derive(Debug, Clone)]
pub struct UploadBlob {
    pub filename: String,
    pub content_type: Option<String>,
    pub bytes: Vec<u8>,
}

/// Everything one submission asks the pipeline to interpret
#[derive(Debug, Clone, Default)]
pub struct AnalysisRequest {
    pub domain_type: DomainType,
    pub title: Option<String>,
    pub free_text: Option<String>,
    pub vitals: BTreeMap<String, String>,
    pub image_references: Vec<String>,
    pub uploaded_files: Vec<FileRef>,
}

/// Structured part of an interpretation reply.
///
/// The completion service gives no schema guarantee, so the structured block is
/// either a parsed JSON object or the untouched completion text.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Findings {
    Parsed(Map<String, Value>),
    RawFallback { raw: String },
}

impl Findings {
    pub fn empty() -> Self {
        Findings::Parsed(Map::new())
    }

    /// Candidate entries of `measurements`, empty unless it is a parsed array
    pub fn measurement_candidates(&self) -> &[Value] {
        match self {
            Findings::Parsed(map) => match map.get("measurements") {
                Some(Value::Array(entries)) => entries.as_slice(),
                _ => &[],
            },
            Findings::RawFallback { .. } => &[],
        }
    }

}

impl From<Value> for Findings {
    fn from(value: Value) -> Self {
        match value {
            Value::Object(mut map) => {
                if map.len() == 1 && map.get("raw").is_some_and(Value::is_string) {
                    if let Some(Value::String(raw)) = map.remove("raw") {
                        return Findings::RawFallback { raw };
                    }
                }
                Findings::Parsed(map)
            }
            other => Findings::RawFallback {
                raw: other.to_string(),
            },
        }
    }
}

impl<'de> Deserialize<'de> for Findings {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        Value::deserialize(deserializer).map(Findings::from)
    }
}

/// Normalized output of the interpretation service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterpretationReply {
    pub summary: String,
    pub findings: Findings,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MeasurementStatus {
    Normal,
    Warning,
    Critical,
    Unknown,
}

impl MeasurementStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MeasurementStatus::Normal => "normal",
            MeasurementStatus::Warning => "warning",
            MeasurementStatus::Critical => "critical",
            MeasurementStatus::Unknown => "unknown",
        }
    }

    /// Maps any label onto a status; unrecognized labels become `Unknown`
    pub fn from_label(label: &str) -> Self {
        match label.trim().to_ascii_lowercase().as_str() {
            "normal" => MeasurementStatus::Normal,
            "warning" => MeasurementStatus::Warning,
            "critical" => MeasurementStatus::Critical,
            _ => MeasurementStatus::Unknown,
        }
    }
}

/// Typed clinical data point promoted from a finding
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Measurement {
    pub name: String,
    pub value: f64,
    pub unit: Option<String>,
    pub reference_low: Option<f64>,
    pub reference_high: Option<f64>,
    pub status: Option<MeasurementStatus>,
}

/// Fields of an analysis known before the store assigns identity
#[derive(Debug, Clone)]
pub struct AnalysisDraft {
    pub owner_id: Option<String>,
    pub domain_type: DomainType,
    pub title: Option<String>,
    pub raw_text: Option<String>,
    pub summary: String,
    pub findings: Findings,
}

/// Root aggregate of one interpretation run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Analysis {
    pub id: Uuid,
    pub owner_id: Option<String>,
    pub domain_type: DomainType,
    pub title: Option<String>,
    pub raw_text: Option<String>,
    pub summary: String,
    pub findings: Findings,
    pub measurements: Vec<Measurement>,
    pub files: Vec<FileRef>,
    pub created_at: DateTime<Utc>,
}
