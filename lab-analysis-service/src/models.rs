use analysis_flow::intake::DEFAULT_CONTENT_TYPE;
use analysis_flow::{Analysis, AnalysisRequest, DomainType, FileRef};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};

/// Body of `POST /api/analysis`
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct SubmitAnalysisRequest {
    #[serde(rename = "type")]
    pub domain_type: Option<String>,
    pub text: Option<String>,
    pub vitals: Option<HashMap<String, Value>>,
    pub title: Option<String>,
    pub images: Option<Vec<String>>,
    pub uploaded: Option<Vec<UploadedFile>>,
}

impl SubmitAnalysisRequest {
    /// Convert the wire shape into a pipeline request; only the type can be invalid
    pub fn into_analysis_request(self) -> Result<AnalysisRequest, String> {
        let domain_type = match self.domain_type.as_deref().map(str::trim) {
            None | Some("") => DomainType::default(),
            Some(raw) => raw.parse()?,
        };

        let vitals: BTreeMap<String, String> = self
            .vitals
            .unwrap_or_default()
            .into_iter()
            .filter_map(|(key, value)| vital_to_string(value).map(|value| (key, value)))
            .collect();

        Ok(AnalysisRequest {
            domain_type,
            title: self.title,
            free_text: self.text,
            vitals,
            image_references: self.images.unwrap_or_default(),
            uploaded_files: self
                .uploaded
                .unwrap_or_default()
                .into_iter()
                .map(FileRef::from)
                .collect(),
        })
    }
}

fn vital_to_string(value: Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(text) => Some(text),
        other => Some(other.to_string()),
    }
}

/// File reference as exchanged with clients
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UploadedFile {
    pub filename: Option<String>,
    pub url: Option<String>,
    pub size: Option<u64>,
    #[serde(rename = "type")]
    pub content_type: Option<String>,
}

impl From<UploadedFile> for FileRef {
    fn from(file: UploadedFile) -> Self {
        FileRef {
            filename: file.filename.unwrap_or_else(|| "file".to_string()),
            content_type: file
                .content_type
                .unwrap_or_else(|| DEFAULT_CONTENT_TYPE.to_string()),
            size_bytes: file.size.unwrap_or_default(),
            location: file.url.unwrap_or_default(),
        }
    }
}

impl From<FileRef> for UploadedFile {
    fn from(file: FileRef) -> Self {
        UploadedFile {
            filename: Some(file.filename),
            url: Some(file.location),
            size: Some(file.size_bytes),
            content_type: Some(file.content_type),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AnalysisResponse {
    pub ok: bool,
    pub analysis: Analysis,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AnalysisListResponse {
    pub ok: bool,
    pub analyses: Vec<Analysis>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct UploadResponse {
    pub ok: bool,
    pub files: Vec<UploadedFile>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn missing_type_defaults_to_other() {
        let request: SubmitAnalysisRequest = serde_json::from_value(json!({})).unwrap();
        let request = request.into_analysis_request().unwrap();
        assert_eq!(request.domain_type, DomainType::Other);
        assert!(request.vitals.is_empty());
    }

    #[test]
    fn unknown_type_is_rejected() {
        let request: SubmitAnalysisRequest =
            serde_json::from_value(json!({ "type": "mri" })).unwrap();
        assert!(request.into_analysis_request().is_err());
    }

    #[test]
    fn numeric_vitals_are_stringified() {
        let request: SubmitAnalysisRequest = serde_json::from_value(json!({
            "type": "blood",
            "vitals": { "age": 30, "sex": "f", "weight": 61.5, "note": null }
        }))
        .unwrap();
        let request = request.into_analysis_request().unwrap();

        assert_eq!(request.vitals.get("age").map(String::as_str), Some("30"));
        assert_eq!(request.vitals.get("weight").map(String::as_str), Some("61.5"));
        assert_eq!(request.vitals.get("sex").map(String::as_str), Some("f"));
        assert!(!request.vitals.contains_key("note"));
    }

    #[test]
    fn uploaded_files_get_defaults() {
        let request: SubmitAnalysisRequest = serde_json::from_value(json!({
            "uploaded": [{ "url": "http://host/uploads/x.pdf" }]
        }))
        .unwrap();
        let request = request.into_analysis_request().unwrap();

        let file = &request.uploaded_files[0];
        assert_eq!(file.filename, "file");
        assert_eq!(file.content_type, DEFAULT_CONTENT_TYPE);
        assert_eq!(file.size_bytes, 0);
        assert_eq!(file.location, "http://host/uploads/x.pdf");
    }
}
