use crate::app::application::ExchangeInput;
use crate::app::gcp::{IdentityStrategy, DEFAULT_AUDIENCE};
use clap::{ArgAction, Parser, ValueEnum};
use std::path::PathBuf;
use thiserror::Error;

/// Where the Google identity token comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum IdentityMode {
    /// GCE metadata server of the machine we run on
    Metadata,
    /// Local gcloud CLI, impersonating the configured service account
    Local,
}

impl From<IdentityMode> for IdentityStrategy {
    fn from(mode: IdentityMode) -> Self {
        match mode {
            IdentityMode::Metadata => IdentityStrategy::Metadata,
            IdentityMode::Local => IdentityStrategy::LocalImpersonation,
        }
    }
}

#[derive(Parser, Debug)]
#[clap(author, version, about = "Trade a Google Cloud identity token for temporary AWS credentials", long_about = None)]
pub struct CliArgs {
    /// ARN of the AWS IAM role to assume
    #[clap(env = ROLE_ARN_ENV)]
    pub role_arn: Option<String>,

    /// Where to obtain the Google identity token
    #[clap(value_enum, default_value_t = IdentityMode::Metadata)]
    pub mode: IdentityMode,

    /// AWS region of the STS endpoint
    #[clap(short, long, env = "AWS_REGION", default_value = None)]
    pub region: Option<String>,

    /// Audience of the Google identity token
    #[clap(short, long, env = "JANUS_AUDIENCE", default_value = DEFAULT_AUDIENCE)]
    pub audience: String,

    /// Requested lifetime of the AWS session in seconds
    #[clap(short, long, default_value = None)]
    pub duration_seconds: Option<i32>,

    /// gcloud executable used in local mode
    #[clap(long, env = "JANUS_GCLOUD", default_value = "gcloud")]
    pub gcloud: PathBuf,

    /// Increase log verbosity on stderr (-v info, -vv debug, -vvv trace)
    #[clap(short, long, action = ArgAction::Count)]
    pub verbose: u8,
}

#[derive(Error, Debug)]
#[error("No AWS role ARN given. Pass it as the first argument or set AWS_ROLE_ARN.")]
pub struct MissingRoleArn;

/// Environment variable naming the role when no ARN is passed on the command line.
pub const ROLE_ARN_ENV: &str = "AWS_ROLE_ARN";

impl TryFrom<CliArgs> for ExchangeInput {
    type Error = MissingRoleArn;

    fn try_from(args: CliArgs) -> Result<Self, Self::Error> {
        let env_role_arn = std::env::var(ROLE_ARN_ENV).ok();
        ExchangeInput::from_args(args, env_role_arn)
    }
}

impl ExchangeInput {
    /// `janus local` with the ARN in the environment puts the mode literal in the
    /// role slot. A role equal to a mode literal is read as the mode.
    fn from_args(args: CliArgs, env_role_arn: Option<String>) -> Result<Self, MissingRoleArn> {
        let (role_arn, mode) = match args.role_arn {
            Some(role) => match IdentityMode::from_str(role.trim(), false) {
                Ok(mode) => (env_role_arn, mode),
                Err(_) => (Some(role), args.mode),
            },
            None => (None, args.mode),
        };

        let role_arn = role_arn
            .filter(|arn| !arn.trim().is_empty())
            .ok_or(MissingRoleArn)?;

        Ok(ExchangeInput {
            role_arn,
            strategy: mode.into(),
            audience: args.audience,
            region: args.region,
            duration_seconds: args.duration_seconds,
            gcloud: args.gcloud,
        })
    }
}

/// Usage line printed when no role ARN is configured.
pub fn usage(program: &str) -> String {
    format!(
        "Usage:\n  {program} arn:aws:iam::<account-id>:role/<role-name> [local]\n\
         The role ARN may also be supplied through the {ROLE_ARN_ENV} environment variable."
    )
}
