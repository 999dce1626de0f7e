use super::aws::{FederationService, StsFederation, WebIdentityRequest};
use super::credentials::format_credentials;
use super::gcp::{IdentityStrategy, LocalWorkstation, MetadataClient, MetadataSource, Workstation};
use crate::app::cli::{usage, CliArgs};
use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::{info, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Everything one credential exchange needs.
#[derive(Debug, Clone)]
pub struct ExchangeInput {
    pub role_arn: String,
    pub strategy: IdentityStrategy,
    pub audience: String,
    pub region: Option<String>,
    pub duration_seconds: Option<i32>,
    pub gcloud: PathBuf,
}

pub async fn run() -> Result<()> {
    let args = CliArgs::parse();
    init_logging(args.verbose)?;

    let input = match ExchangeInput::try_from(args) {
        Ok(input) => input,
        Err(missing) => {
            let program = std::env::args().next().unwrap_or_else(|| "janus".to_string());
            eprintln!("{missing}\n{}", usage(&program));
            return Ok(());
        }
    };

    let metadata = MetadataClient::from_env()?;
    let workstation = LocalWorkstation::new(&input.gcloud);
    let federation = StsFederation::new(input.region.clone());

    exchange(
        &input,
        &metadata,
        &workstation,
        &federation,
        &mut tokio::io::stdout(),
    )
    .await
}

/// Resolves an identity, trades it for AWS credentials and writes them to `out`.
/// Nothing is written unless every step succeeds.
pub async fn exchange<M, W, F, O>(
    input: &ExchangeInput,
    metadata: &M,
    workstation: &W,
    federation: &F,
    out: &mut O,
) -> Result<()>
where
    M: MetadataSource,
    W: Workstation,
    F: FederationService,
    O: AsyncWrite + Unpin,
{
    let identity = input
        .strategy
        .resolve(&input.audience, metadata, workstation)
        .await
        .context("Failed to obtain a Google identity token")?;

    info!(
        "Assuming {} as session {}",
        input.role_arn, identity.session_label
    );

    let credentials = federation
        .assume_role_with_web_identity(&WebIdentityRequest {
            role_arn: &input.role_arn,
            token: &identity.token,
            session_label: &identity.session_label,
            duration_seconds: input.duration_seconds,
        })
        .await
        .context("Failed to exchange the identity token for AWS credentials")?;

    let document = format_credentials(&credentials)?;
    out.write_all(document.as_bytes()).await?;
    out.flush().await?;
    Ok(())
}

fn init_logging(verbose: u8) -> Result<()> {
    let level = match verbose {
        0 => Level::WARN,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    };

    // RUST_LOG wins over -v
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.to_string()));

    // stdout belongs to the credential document
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(verbose >= 2)
        .compact()
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}
