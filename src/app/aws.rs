use crate::app::gcp::{IdentityToken, SessionLabel};
use aws_config::environment::region::EnvironmentVariableRegionProvider;
use aws_config::meta::region::RegionProviderChain;
use aws_config::profile::ProfileFileRegionProvider;
use aws_config::{BehaviorVersion, Region};
use aws_sdk_sts::error::DisplayErrorContext;
use chrono::{DateTime, Utc};
use std::future::Future;
use thiserror::Error;
use tracing::{debug, info};

/// Region used for STS when neither the command line nor the AWS config name one.
pub const DEFAULT_AWS_REGION: &str = "us-east-1";

/// Temporary credentials handed out by STS.
#[derive(Clone, PartialEq, Eq)]
pub struct TemporaryCredentials {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: String,
    pub expiration: DateTime<Utc>,
}

impl std::fmt::Debug for TemporaryCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TemporaryCredentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"<redacted>")
            .field("session_token", &"<redacted>")
            .field("expiration", &self.expiration)
            .finish()
    }
}

#[derive(Debug)]
pub struct WebIdentityRequest<'a> {
    pub role_arn: &'a str,
    pub token: &'a IdentityToken,
    pub session_label: &'a SessionLabel,
    pub duration_seconds: Option<i32>,
}

#[derive(Error, Debug)]
pub enum FederationError {
    #[error("AWS STS refused AssumeRoleWithWebIdentity for {role_arn}: {message}")]
    AssumeRole { role_arn: String, message: String },

    #[error("AWS STS returned no credentials for {role_arn}")]
    NoCredentials { role_arn: String },

    #[error("AWS STS returned an expiration that cannot be represented: {secs} seconds since the epoch")]
    InvalidExpiration { secs: i64 },
}

/// A security token service able to trade a web identity for role credentials.
pub trait FederationService {
    fn assume_role_with_web_identity(
        &self,
        request: &WebIdentityRequest<'_>,
    ) -> impl Future<Output = Result<TemporaryCredentials, FederationError>>;
}

/// STS client built on first use, once there is an identity token to trade.
pub struct StsFederation {
    region: Option<String>,
}

impl StsFederation {
    pub fn new(region: Option<String>) -> Self {
        Self { region }
    }

    /// Builds an STS client that signs nothing. AssumeRoleWithWebIdentity is an
    /// unauthenticated call and we have no AWS credentials yet.
    async fn client(&self) -> aws_sdk_sts::Client {
        let config = aws_config::defaults(BehaviorVersion::latest())
            .region(region_provider(self.region.clone()))
            .no_credentials()
            .load()
            .await;

        if let Some(region) = config.region() {
            info!("Using region: {}", region);
        }

        aws_sdk_sts::Client::new(&config)
    }
}

/// Command line, then environment, then profile, then [`DEFAULT_AWS_REGION`].
/// IMDS is left out: on GCE its address is the Google metadata server.
fn region_provider(region: Option<String>) -> RegionProviderChain {
    RegionProviderChain::first_try(region.map(Region::new))
        .or_else(EnvironmentVariableRegionProvider::new())
        .or_else(ProfileFileRegionProvider::new())
        .or_else(Region::new(DEFAULT_AWS_REGION))
}

impl FederationService for StsFederation {
    async fn assume_role_with_web_identity(
        &self,
        request: &WebIdentityRequest<'_>,
    ) -> Result<TemporaryCredentials, FederationError> {
        info!("Calling AWS STS AssumeRoleWithWebIdentity");
        debug!("Role ARN: {}", request.role_arn);
        debug!("Session name: {}", request.session_label);

        let response = self
            .client()
            .await
            .assume_role_with_web_identity()
            .role_arn(request.role_arn)
            .role_session_name(request.session_label.as_str())
            .web_identity_token(request.token.as_str())
            .set_duration_seconds(request.duration_seconds)
            .send()
            .await
            .map_err(|e| FederationError::AssumeRole {
                role_arn: request.role_arn.to_string(),
                message: DisplayErrorContext(e).to_string(),
            })?;

        let credentials = response
            .credentials()
            .ok_or_else(|| FederationError::NoCredentials {
                role_arn: request.role_arn.to_string(),
            })?;

        let credentials = temporary_credentials(credentials)?;
        info!(
            "Successfully obtained AWS credentials expiring at {}",
            credentials.expiration
        );
        Ok(credentials)
    }
}

fn temporary_credentials(
    credentials: &aws_sdk_sts::types::Credentials,
) -> Result<TemporaryCredentials, FederationError> {
    let expiration = credentials.expiration();
    let expiration = DateTime::from_timestamp(expiration.secs(), expiration.subsec_nanos())
        .ok_or(FederationError::InvalidExpiration {
            secs: expiration.secs(),
        })?;

    Ok(TemporaryCredentials {
        access_key_id: credentials.access_key_id().to_string(),
        secret_access_key: credentials.secret_access_key().to_string(),
        session_token: credentials.session_token().to_string(),
        expiration,
    })
}
