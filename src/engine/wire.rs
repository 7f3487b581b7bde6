//! Upload wire protocol payloads
//!
//! Three server endpoints: dedup precheck, chunk upload (multipart), and
//! merge. Field names are part of the server contract.

use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize)]
pub struct CheckRequest {
    pub hash: String,
}

#[derive(Debug, Deserialize)]
pub struct CheckResponse {
    pub exists: bool,
    #[serde(default)]
    pub url: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ChunkResponse {
    #[serde(default)]
    pub success: bool,
    #[serde(rename = "chunkIndex", default)]
    pub chunk_index: Option<u32>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeRequest {
    pub file_id: String,
    pub file_name: String,
    pub file_size: u64,
    pub file_type: String,
    pub hash: String,
    pub chunk_count: u32,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeResponse {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub file_id: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn merge_request_uses_camel_case_fields() {
        let request = MergeRequest {
            file_id: "abc".to_string(),
            file_name: "f.bin".to_string(),
            file_size: 42,
            file_type: "application/octet-stream".to_string(),
            hash: "abc".to_string(),
            chunk_count: 3,
        };
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(
            value,
            json!({
                "fileId": "abc",
                "fileName": "f.bin",
                "fileSize": 42,
                "fileType": "application/octet-stream",
                "hash": "abc",
                "chunkCount": 3,
            })
        );
    }

    #[test]
    fn check_response_tolerates_missing_url() {
        let response: CheckResponse = serde_json::from_str(r#"{"exists": false}"#).unwrap();
        assert!(!response.exists);
        assert!(response.url.is_none());
    }
}
