use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OtaError {
    #[error("url cannot be empty")]
    EmptyUrl,
    #[error("url must start with http:// or https://")]
    UnsupportedScheme,
    #[error("sha256 must be 64 hex characters")]
    InvalidDigest,
    #[error("OTA update already in progress")]
    AlreadyInProgress,
    #[error("OTA is not supported: {0}")]
    Unsupported(String),
    #[error("OTA transfer failed: {0}")]
    Transfer(String),
    #[error("sha256 mismatch (expected {expected}, got {actual})")]
    DigestMismatch { expected: String, actual: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OtaRequest {
    pub url: String,
    #[serde(default)]
    pub sha256: Option<String>,
}

impl OtaRequest {
    pub fn new(url: impl Into<String>, sha256: Option<String>) -> Self {
        Self {
            url: url.into(),
            sha256,
        }
    }

    pub fn validate(&self) -> Result<(), OtaError> {
        let url = self.url.trim();
        if url.is_empty() {
            return Err(OtaError::EmptyUrl);
        }
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(OtaError::UnsupportedScheme);
        }

        if let Some(value) = self
            .sha256
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
        {
            if value.len() != 64 || !value.chars().all(|c| c.is_ascii_hexdigit()) {
                return Err(OtaError::InvalidDigest);
            }
        }
        Ok(())
    }

    pub fn expected_sha256(&self) -> Option<String> {
        self.sha256
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_ascii_lowercase)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OtaEvent {
    Started {
        source_url: String,
        total_bytes: Option<u64>,
    },
    Progress {
        written: u64,
        total: Option<u64>,
    },
    Finished {
        bytes: u64,
        sha256: String,
    },
    Failed(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct OtaStatus {
    pub supported: bool,
    #[serde(rename = "inProgress")]
    pub in_progress: bool,
    #[serde(rename = "bytesWritten")]
    pub bytes_written: u64,
    #[serde(rename = "totalBytes")]
    pub total_bytes: Option<u64>,
    #[serde(rename = "progressPct")]
    pub progress_pct: Option<u8>,
    #[serde(rename = "lastError")]
    pub last_error: Option<String>,
    #[serde(rename = "lastSha256")]
    pub last_sha256: Option<String>,
    #[serde(rename = "lastSourceUrl")]
    pub last_source_url: Option<String>,
}

impl OtaStatus {
    pub fn new(supported: bool) -> Self {
        Self {
            supported,
            ..Self::default()
        }
    }

    pub fn mark_started(&mut self, source_url: &str) {
        self.in_progress = true;
        self.bytes_written = 0;
        self.total_bytes = None;
        self.progress_pct = None;
        self.last_error = None;
        self.last_sha256 = None;
        self.last_source_url = Some(source_url.to_string());
    }

    pub fn apply(&mut self, event: &OtaEvent) {
        match event {
            OtaEvent::Started {
                source_url,
                total_bytes,
            } => {
                self.in_progress = true;
                self.bytes_written = 0;
                self.total_bytes = *total_bytes;
                self.progress_pct = None;
                self.last_error = None;
                self.last_sha256 = None;
                self.last_source_url = Some(source_url.clone());
            }
            OtaEvent::Progress { written, total } => {
                self.bytes_written = *written;
                if total.is_some() {
                    self.total_bytes = *total;
                }
                self.progress_pct = self
                    .total_bytes
                    .filter(|total| *total > 0)
                    .map(|total| (written.saturating_mul(100) / total).min(100) as u8);
            }
            OtaEvent::Finished { bytes, sha256 } => {
                self.in_progress = false;
                self.bytes_written = *bytes;
                self.progress_pct = Some(100);
                self.last_error = None;
                self.last_sha256 = Some(sha256.clone());
            }
            OtaEvent::Failed(message) => {
                self.in_progress = false;
                self.last_error = Some(message.clone());
            }
        }
    }
}

pub trait OtaService {
    fn supported(&self) -> bool;

    fn begin(&mut self, request: OtaRequest) -> Result<(), OtaError>;

    fn poll(&mut self) -> Vec<OtaEvent>;
}


#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    const DIGEST: &str = "9F86D081884C7D659A2FEAA0C55AD015A3BF4F1B2B0B822CD15D6C15B0F00A08";

    #[test]
    fn validates_url_and_digest() {
        assert_eq!(OtaRequest::new("  ", None).validate(), Err(OtaError::EmptyUrl));
        assert_eq!(
            OtaRequest::new("ftp://host/fw.bin", None).validate(),
            Err(OtaError::UnsupportedScheme)
        );
        assert_eq!(
            OtaRequest::new("http://host/fw.bin", Some("abc".into())).validate(),
            Err(OtaError::InvalidDigest)
        );
        assert_eq!(
            OtaRequest::new("https://host/fw.bin", Some(DIGEST.into())).validate(),
            Ok(())
        );
    }

    #[test]
    fn blank_digest_is_treated_as_absent() {
        for blank in ["", "   "] {
            let request = OtaRequest::new("http://host/fw.bin", Some(blank.to_string()));
            assert_eq!(request.validate(), Ok(()));
            assert_eq!(request.expected_sha256(), None);
        }
    }

    #[test]
    fn accepted_request_counts_as_in_progress() {
        let mut status = OtaStatus::new(true);
        status.last_error = Some("previous".into());
        status.mark_started("http://host/fw.bin");

        assert!(status.in_progress);
        assert_eq!(status.last_error, None);
        assert_eq!(status.last_source_url.as_deref(), Some("http://host/fw.bin"));
    }

    #[test]
    fn expected_digest_is_lowercased() {
        let request = OtaRequest::new("http://host/fw.bin", Some(format!(" {DIGEST} ")));
        assert_eq!(request.expected_sha256(), Some(DIGEST.to_ascii_lowercase()));
        assert_eq!(
            OtaRequest::new("http://host/fw.bin", Some(String::new())).expected_sha256(),
            None
        );
    }

    #[test]
    fn folds_lifecycle_into_status() {
        let mut status = OtaStatus::new(true);
        status.last_error = Some("previous".into());

        status.apply(&OtaEvent::Started {
            source_url: "http://host/fw.bin".into(),
            total_bytes: Some(2000),
        });
        assert!(status.in_progress);
        assert_eq!(status.last_error, None);

        status.apply(&OtaEvent::Progress {
            written: 500,
            total: None,
        });
        assert_eq!(status.progress_pct, Some(25));

        status.apply(&OtaEvent::Finished {
            bytes: 2000,
            sha256: "ab".into(),
        });
        assert!(!status.in_progress);
        assert_eq!(status.progress_pct, Some(100));
        assert_eq!(status.last_sha256.as_deref(), Some("ab"));
        assert_eq!(status.last_source_url.as_deref(), Some("http://host/fw.bin"));
    }

    #[test]
    fn failure_keeps_counters_and_records_error() {
        let mut status = OtaStatus::new(true);
        status.apply(&OtaEvent::Started {
            source_url: "http://host/fw.bin".into(),
            total_bytes: None,
        });
        status.apply(&OtaEvent::Progress {
            written: 10,
            total: None,
        });
        status.apply(&OtaEvent::Failed("connection reset".into()));

        assert!(!status.in_progress);
        assert_eq!(status.bytes_written, 10);
        assert_eq!(status.progress_pct, None);
        assert_eq!(status.last_error.as_deref(), Some("connection reset"));
    }

    #[test]
    fn status_serializes_with_camel_case_keys() {
        let json = serde_json::to_value(OtaStatus::new(false)).unwrap();
        assert_eq!(json["supported"], false);
        assert_eq!(json["inProgress"], false);
        assert!(json["lastError"].is_null());
    }
}
