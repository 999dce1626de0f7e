use crate::app::aws::TemporaryCredentials;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The only `Version` the AWS SDKs accept from a `credential_process`.
pub const CREDENTIAL_PROCESS_VERSION: u8 = 1;

/// Output document of an AWS `credential_process` helper.
#[derive(Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct CredentialProcessOutput {
    pub version: u8,
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: String,
    pub expiration: String,
}

#[derive(Error, Debug)]
pub enum FormatError {
    #[error("Failed to serialize AWS credentials: {source}")]
    FailedToSerializeCredentials { source: serde_json::Error },
}

impl From<&TemporaryCredentials> for CredentialProcessOutput {
    fn from(credentials: &TemporaryCredentials) -> Self {
        Self {
            version: CREDENTIAL_PROCESS_VERSION,
            access_key_id: credentials.access_key_id.clone(),
            secret_access_key: credentials.secret_access_key.clone(),
            session_token: credentials.session_token.clone(),
            expiration: credentials
                .expiration
                .to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
        }
    }
}

/// Renders the credentials as one newline-terminated JSON document.
pub fn format_credentials(credentials: &TemporaryCredentials) -> Result<String, FormatError> {
    let mut document = serde_json::to_string(&CredentialProcessOutput::from(credentials))
        .map_err(|source| FormatError::FailedToSerializeCredentials { source })?;
    document.push('\n');
    Ok(document)
}
