//! Protocol letters and their envelope wire format
//!
//! Every control message travels as `{"tag":"<tag>","fields":{...}}`.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const TAG_CONFIRMED: &str = "confirmed";
pub const TAG_REJECTED: &str = "rejected";
pub const TAG_CLOSE: &str = "close";
pub const TAG_UPLOAD_REQUEST: &str = "upload-request";
pub const TAG_DOWNLOAD_REQUEST: &str = "download-request";
pub const TAG_DOWNLOAD_CONFIRMATION: &str = "download-confirmation";

#[derive(Debug, Clone, PartialEq)]
pub enum Letter {
    /// Proceed, or acknowledge the previous frame.
    Confirmation,
    Rejection(Rejection),
    /// Orderly end of the logical exchange (not of the transport).
    ConnectionClose,
    UploadRequest(UploadRequest),
    DownloadRequest(DownloadRequest),
    DownloadConfirmation(DownloadConfirmation),
    /// A letter with a tag this build does not know.
    Opaque(OpaqueLetter),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Rejection {
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UploadRequest {
    pub file_size: u64,
    pub destination_path: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DownloadRequest {
    pub download_path: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DownloadConfirmation {
    pub file_size: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OpaqueLetter {
    pub tag: String,
    pub fields: Map<String, Value>,
}

/// Field payload of the letters that carry none.
#[derive(Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct NoFields {}

#[derive(Serialize)]
struct OutgoingEnvelope<'a, T> {
    tag: &'a str,
    fields: &'a T,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct IncomingEnvelope {
    tag: String,
    fields: Map<String, Value>,
}

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("failed to encode `{tag}` letter: {source}")]
    Encode {
        tag: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("communication decode error ({reason}): {}", String::from_utf8_lossy(.bytes))]
    Decode { bytes: Vec<u8>, reason: String },
}

impl Letter {
    pub fn rejection(reason: impl Into<String>) -> Self {
        Letter::Rejection(Rejection { reason: reason.into() })
    }

    pub fn upload_request(file_size: u64, destination_path: impl Into<String>) -> Self {
        Letter::UploadRequest(UploadRequest {
            file_size,
            destination_path: destination_path.into(),
        })
    }

    pub fn download_request(download_path: impl Into<String>) -> Self {
        Letter::DownloadRequest(DownloadRequest {
            download_path: download_path.into(),
        })
    }

    pub fn download_confirmation(file_size: u64) -> Self {
        Letter::DownloadConfirmation(DownloadConfirmation { file_size })
    }

    /// Wire tag of this letter.
    pub fn tag(&self) -> &str {
        match self {
            Letter::Confirmation => TAG_CONFIRMED,
            Letter::Rejection(_) => TAG_REJECTED,
            Letter::ConnectionClose => TAG_CLOSE,
            Letter::UploadRequest(_) => TAG_UPLOAD_REQUEST,
            Letter::DownloadRequest(_) => TAG_DOWNLOAD_REQUEST,
            Letter::DownloadConfirmation(_) => TAG_DOWNLOAD_CONFIRMATION,
            Letter::Opaque(opaque) => &opaque.tag,
        }
    }
}

/// Serialize a letter into its compact envelope.
pub fn encode(letter: &Letter) -> Result<Vec<u8>, CodecError> {
    let tag = letter.tag();
    match letter {
        Letter::Confirmation | Letter::ConnectionClose => seal(tag, &NoFields {}),
        Letter::Rejection(fields) => seal(tag, fields),
        Letter::UploadRequest(fields) => seal(tag, fields),
        Letter::DownloadRequest(fields) => seal(tag, fields),
        Letter::DownloadConfirmation(fields) => seal(tag, fields),
        Letter::Opaque(opaque) => seal(tag, &opaque.fields),
    }
}

fn seal<T: Serialize>(tag: &str, fields: &T) -> Result<Vec<u8>, CodecError> {
    serde_json::to_vec(&OutgoingEnvelope { tag, fields }).map_err(|source| CodecError::Encode {
        tag: tag.to_string(),
        source,
    })
}

/// Parse an envelope back into a letter.
///
/// Unknown tags decode into [`Letter::Opaque`]; anything that is not a
/// well-formed envelope, or a known tag with the wrong fields, is an error.
pub fn decode(bytes: &[u8]) -> Result<Letter, CodecError> {
    let envelope: IncomingEnvelope =
        serde_json::from_slice(bytes).map_err(|e| decode_error(bytes, e.to_string()))?;

    let IncomingEnvelope { tag, fields } = envelope;
    let letter = match tag.as_str() {
        TAG_CONFIRMED => open::<NoFields>(bytes, fields).map(|_| Letter::Confirmation)?,
        TAG_CLOSE => open::<NoFields>(bytes, fields).map(|_| Letter::ConnectionClose)?,
        TAG_REJECTED => Letter::Rejection(open(bytes, fields)?),
        TAG_UPLOAD_REQUEST => Letter::UploadRequest(open(bytes, fields)?),
        TAG_DOWNLOAD_REQUEST => Letter::DownloadRequest(open(bytes, fields)?),
        TAG_DOWNLOAD_CONFIRMATION => Letter::DownloadConfirmation(open(bytes, fields)?),
        _ => Letter::Opaque(OpaqueLetter { tag, fields }),
    };
    Ok(letter)
}

fn open<T: DeserializeOwned>(bytes: &[u8], fields: Map<String, Value>) -> Result<T, CodecError> {
    serde_json::from_value(Value::Object(fields))
        .map_err(|e| decode_error(bytes, format!("fields do not match tag: {}", e)))
}

fn decode_error(bytes: &[u8], reason: String) -> CodecError {
    CodecError::Decode {
        bytes: bytes.to_vec(),
        reason,
    }
}
