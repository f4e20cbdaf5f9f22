//! Error taxonomy. Variants map to the categories in the error handling
//! design: transient I/O, malformed input, calibration breach, persistence
//! breach. None of these ever escape the orchestrator — `pipeline::handle_frame`
//! logs and swallows every one of them.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("no binding for topic {0}")]
    UnknownTopic(String),

    #[error("payload failed utf-8/decrypt decode")]
    UndecodablePayload,

    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    #[error("persistence error: {0}")]
    Persistence(#[from] sqlx::Error),
}

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("base64 decode failed")]
    Base64,
    #[error("AES/PKCS7 decrypt failed")]
    Decrypt,
    #[error("decrypted payload is not valid utf-8")]
    Utf8,
}
