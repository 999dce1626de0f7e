use serde::Deserialize;
use std::fmt;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Audience the Google identity token is minted for unless overridden.
pub const DEFAULT_AUDIENCE: &str = "gcp";

/// Host of the GCE metadata server. `GCE_METADATA_HOST` takes precedence.
pub const DEFAULT_METADATA_HOST: &str = "metadata.google.internal";

/// Instance identifier used when the metadata server cannot tell us our hostname.
pub const UNKNOWN_INSTANCE: &str = "unknown";

/// STS rejects role session names longer than this.
pub const MAX_SESSION_LABEL_LEN: usize = 64;

const HOSTNAME_PATH: &str = "instance/hostname";
const PROJECT_ID_PATH: &str = "project/project-id";
const IDENTITY_PATH: &str = "instance/service-accounts/default/identity";

#[derive(Error, Debug)]
pub enum MetadataError {
    #[error("Failed to build the metadata HTTP client: {source}")]
    Client { source: reqwest::Error },

    #[error("Failed to query the GCE metadata server for {path}: {source}")]
    Request {
        path: String,
        source: reqwest::Error,
    },

    #[error("GCE metadata server answered {status} for {path}")]
    Status {
        path: String,
        status: reqwest::StatusCode,
    },
}

#[derive(Error, Debug)]
pub enum IdentityError {
    #[error("Failed to read {what} from the GCE metadata server: {source}")]
    Metadata {
        what: &'static str,
        source: MetadataError,
    },

    #[error("Failed to run `{command}`: {source}")]
    GcloudSpawn {
        command: String,
        source: std::io::Error,
    },

    #[error("`{command}` exited with {status}")]
    GcloudFailed { command: String, status: ExitStatus },

    #[error("`{command}` printed output that is not valid UTF-8: {source}")]
    GcloudOutput {
        command: String,
        source: std::string::FromUtf8Error,
    },

    #[error("Failed to parse the active gcloud configuration: {source}")]
    GcloudConfig { source: serde_json::Error },

    #[error("The active gcloud configuration has no account to impersonate. Set auth/impersonate_service_account or core/account.")]
    NoAccount,

    #[error("The active gcloud configuration has no project. Set core/project.")]
    NoProject,

    #[error("The local hostname is not valid UTF-8")]
    InvalidHostname,

    #[error("{origin} returned an empty identity token")]
    EmptyToken { origin: &'static str },
}

/// A Google-signed OIDC token. Never printed or logged.
#[derive(Clone, PartialEq, Eq)]
pub struct IdentityToken(String);

impl IdentityToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for IdentityToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("IdentityToken(<redacted>)")
    }
}

/// Role session name attached to the assumed role for auditing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionLabel(String);

impl SessionLabel {
    /// Builds a label, truncating it to [`MAX_SESSION_LABEL_LEN`] characters.
    pub fn new(label: impl Into<String>) -> Self {
        let label = label.into();
        if label.chars().count() <= MAX_SESSION_LABEL_LEN {
            return Self(label);
        }
        Self(label.chars().take(MAX_SESSION_LABEL_LEN).collect())
    }

    pub fn for_instance(project: &str, instance: &str) -> Self {
        Self::new(format!("{project}.{instance}"))
    }

    pub fn for_workstation(project: &str, hostname: &str) -> Self {
        Self::new(format!("{project}-local-{hostname}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedIdentity {
    pub token: IdentityToken,
    pub session_label: SessionLabel,
}

/// Read access to the GCE metadata server.
pub trait MetadataSource {
    /// Fetches `computeMetadata/v1/{path}` and returns the trimmed body.
    fn get(
        &self,
        path: &str,
        query: &[(&str, &str)],
    ) -> impl Future<Output = Result<String, MetadataError>>;
}

/// The operator's machine: the gcloud CLI and the local hostname.
pub trait Workstation {
    /// Runs gcloud with `args` and returns its stdout. Stderr is discarded.
    fn gcloud(&self, args: &[&str]) -> impl Future<Output = Result<String, IdentityError>>;

    fn hostname(&self) -> Result<String, IdentityError>;
}

pub struct MetadataClient {
    client: reqwest::Client,
    base_url: String,
}

impl MetadataClient {
    /// The metadata server is link-local, so HTTP proxies from the environment are ignored.
    pub fn new(host: &str) -> Result<Self, MetadataError> {
        let client = reqwest::Client::builder()
            .no_proxy()
            .build()
            .map_err(|source| MetadataError::Client { source })?;

        Ok(Self {
            client,
            base_url: format!("http://{host}/computeMetadata/v1"),
        })
    }

    pub fn from_env() -> Result<Self, MetadataError> {
        let host = std::env::var("GCE_METADATA_HOST")
            .unwrap_or_else(|_| DEFAULT_METADATA_HOST.to_string());
        Self::new(&host)
    }
}

impl MetadataSource for MetadataClient {
    async fn get(&self, path: &str, query: &[(&str, &str)]) -> Result<String, MetadataError> {
        let url = format!("{}/{}", self.base_url, path);
        debug!("GET {}", url);

        let response = self
            .client
            .get(&url)
            .header("Metadata-Flavor", "Google")
            .query(query)
            .send()
            .await
            .map_err(|source| MetadataError::Request {
                path: path.to_string(),
                source,
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(MetadataError::Status {
                path: path.to_string(),
                status,
            });
        }

        let body = response
            .text()
            .await
            .map_err(|source| MetadataError::Request {
                path: path.to_string(),
                source,
            })?;

        Ok(body.trim().to_string())
    }
}

pub struct LocalWorkstation {
    gcloud: PathBuf,
}

impl LocalWorkstation {
    pub fn new(gcloud: impl AsRef<Path>) -> Self {
        Self {
            gcloud: gcloud.as_ref().to_path_buf(),
        }
    }
}

impl Workstation for LocalWorkstation {
    async fn gcloud(&self, args: &[&str]) -> Result<String, IdentityError> {
        let command = format!("{} {}", self.gcloud.display(), args.join(" "));
        debug!("Running {}", command);

        let output = tokio::process::Command::new(&self.gcloud)
            .args(args)
            .stdin(Stdio::null())
            .stderr(Stdio::null())
            .output()
            .await
            .map_err(|source| IdentityError::GcloudSpawn {
                command: command.clone(),
                source,
            })?;

        if !output.status.success() {
            return Err(IdentityError::GcloudFailed {
                command,
                status: output.status,
            });
        }

        String::from_utf8(output.stdout)
            .map_err(|source| IdentityError::GcloudOutput { command, source })
    }

    fn hostname(&self) -> Result<String, IdentityError> {
        gethostname::gethostname()
            .into_string()
            .map_err(|_| IdentityError::InvalidHostname)
    }
}

/// Subset of `gcloud config list --format=json`.
#[derive(Debug, Default, Deserialize)]
struct GcloudConfig {
    #[serde(default)]
    auth: GcloudAuthSection,
    #[serde(default)]
    core: GcloudCoreSection,
}

#[derive(Debug, Default, Deserialize)]
struct GcloudAuthSection {
    impersonate_service_account: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct GcloudCoreSection {
    account: Option<String>,
    project: Option<String>,
}

impl GcloudConfig {
    fn impersonated_account(&self) -> Option<&str> {
        let non_empty = |account: &&str| !account.is_empty();
        self.auth
            .impersonate_service_account
            .as_deref()
            .filter(non_empty)
            .or(self.core.account.as_deref().filter(non_empty))
    }

    fn project(&self) -> Option<&str> {
        self.core.project.as_deref().filter(|p| !p.is_empty())
    }
}

/// How the Google identity token is obtained. Chosen once per run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentityStrategy {
    /// Ask the metadata server of the GCE instance, Cloud Run service, etc. we run on.
    Metadata,
    /// Have the local gcloud CLI mint a token impersonating a service account.
    LocalImpersonation,
}

impl IdentityStrategy {
    pub async fn resolve<M, W>(
        self,
        audience: &str,
        metadata: &M,
        workstation: &W,
    ) -> Result<ResolvedIdentity, IdentityError>
    where
        M: MetadataSource,
        W: Workstation,
    {
        match self {
            IdentityStrategy::Metadata => resolve_from_metadata(audience, metadata).await,
            IdentityStrategy::LocalImpersonation => {
                resolve_from_workstation(audience, workstation).await
            }
        }
    }
}

async fn resolve_from_metadata<M: MetadataSource>(
    audience: &str,
    metadata: &M,
) -> Result<ResolvedIdentity, IdentityError> {
    info!("Resolving identity from the GCE metadata server");

    let instance = match metadata.get(HOSTNAME_PATH, &[]).await {
        Ok(hostname) => hostname,
        Err(e) => {
            warn!("Could not read instance hostname, using {}: {}", UNKNOWN_INSTANCE, e);
            UNKNOWN_INSTANCE.to_string()
        }
    };

    let project = metadata
        .get(PROJECT_ID_PATH, &[])
        .await
        .map_err(|source| IdentityError::Metadata {
            what: "project id",
            source,
        })?;

    let token = metadata
        .get(IDENTITY_PATH, &[("format", "standard"), ("audience", audience)])
        .await
        .map_err(|source| IdentityError::Metadata {
            what: "identity token",
            source,
        })?;

    if token.is_empty() {
        return Err(IdentityError::EmptyToken {
            origin: "The GCE metadata server",
        });
    }

    let session_label = SessionLabel::for_instance(&project, &instance);
    debug!("Session label: {}", session_label);

    Ok(ResolvedIdentity {
        token: IdentityToken::new(token),
        session_label,
    })
}

async fn resolve_from_workstation<W: Workstation>(
    audience: &str,
    workstation: &W,
) -> Result<ResolvedIdentity, IdentityError> {
    info!("Resolving identity through local gcloud impersonation");

    let raw_config = workstation
        .gcloud(&["config", "list", "--format=json"])
        .await?;
    let config: GcloudConfig = serde_json::from_str(&raw_config)
        .map_err(|source| IdentityError::GcloudConfig { source })?;

    let account = config.impersonated_account().ok_or(IdentityError::NoAccount)?;
    let project = config.project().ok_or(IdentityError::NoProject)?;
    let hostname = workstation.hostname()?;
    debug!("Impersonating {} in project {}", account, project);

    let impersonate = format!("--impersonate-service-account={account}");
    let audiences = format!("--audiences={audience}");
    let token = workstation
        .gcloud(&[
            "auth",
            "print-identity-token",
            &impersonate,
            &audiences,
            "--verbosity=error",
        ])
        .await?;

    let token = token.trim();
    if token.is_empty() {
        return Err(IdentityError::EmptyToken { origin: "gcloud" });
    }

    let session_label = SessionLabel::for_workstation(project, hostname.trim());
    debug!("Session label: {}", session_label);

    Ok(ResolvedIdentity {
        token: IdentityToken::new(token),
        session_label,
    })
}
