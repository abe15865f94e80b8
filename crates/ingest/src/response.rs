use blotter_booking::ResponseOutcome;
use blotter_types::SystemCode;
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::IngestError;

/// Extensions of files still being written by the booking system
const IN_PROGRESS_EXTENSIONS: [&str; 2] = ["tmp", "part"];

/// One response document dropped into the inbound folder:
///
/// ```json
/// {"trade_id":42,"system_code":"MX3","outcome":"success","external_trade_id":"DEAL123"}
/// {"trade_id":42,"system_code":"MX3","outcome":"failure","error":"counterparty not mapped"}
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseFile {
    pub trade_id: i64,
    pub system_code: SystemCode,
    #[serde(flatten)]
    pub outcome: ResponseOutcome,
}

impl ResponseFile {
    pub fn parse(bytes: &[u8]) -> Result<Self, IngestError> {
        let response: ResponseFile = serde_json::from_slice(bytes)?;
        if response.trade_id <= 0 {
            return Err(IngestError::Parse(format!(
                "invalid trade id {}",
                response.trade_id
            )));
        }
        Ok(response)
    }
}

/// Whether a directory entry looks like a finished response file
pub fn is_candidate(path: &Path) -> bool {
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return false;
    };
    if name.starts_with('.') {
        return false;
    }
    match path.extension().and_then(|e| e.to_str()) {
        Some(ext) => !IN_PROGRESS_EXTENSIONS
            .iter()
            .any(|skip| ext.eq_ignore_ascii_case(skip)),
        None => true,
    }
}
