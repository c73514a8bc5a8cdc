use std::process::ExitCode;

use clap::Parser;
use redsocial_init::{
    conf::{self, ConfError, DatabaseConfig},
    db::{Backend, MongoBackend},
    provision::{ProvisionError, provision, verify},
    schema::{AdminUser, Schema},
    utils::o11y::{build_subscriber, log_error},
};
use tracing::{info, warn};

#[derive(Parser)]
#[command(about = "Bring the redsocial MongoDB database to its declared initial state")]
struct Cli {
    #[arg(
        long,
        value_name = "FILE",
        default_value = conf::DEFAULT_CONFIG_FILE,
        help = "Path to the configuration file (skipped when missing)"
    )]
    config: String,

    #[arg(
        long,
        help = "Only compare the database with the declared schema, change nothing"
    )]
    check: bool,
}

#[derive(thiserror::Error, Debug)]
enum RunError {
    #[error("configuration error")]
    Conf(#[from] ConfError),
    #[error("provisioning error")]
    Provision(#[from] ProvisionError),
    #[error("database differs from the declared schema in {0} places")]
    Drift(usize),
}

impl RunError {
    fn exit_code(&self) -> u8 {
        match self {
            RunError::Conf(_) => 2,
            RunError::Provision(error) => error.exit_code(),
            RunError::Drift(_) => 1,
        }
    }
}

async fn run(args: Cli) -> Result<(), RunError> {
    let config = conf::load_config(&args.config)?;
    let db_conf = DatabaseConfig::from_config(&config)?;
    let mut credentials = AdminUser::from_env()?;
    if let Some(auth_database) = &db_conf.auth_database {
        credentials = credentials.with_auth_database(auth_database);
    }
    let schema = Schema::redsocial();

    let client = conf::build_client(&db_conf).await?;
    let backend = MongoBackend::new(client);
    backend.ping().await.map_err(ProvisionError::connect)?;

    if args.check {
        let drift = verify(&backend, &credentials, &schema).await?;
        for item in &drift {
            warn!("{}", item);
        }
        if !drift.is_empty() {
            return Err(RunError::Drift(drift.len()));
        }
        info!("database matches the declared schema");
        return Ok(());
    }

    let report = provision(&backend, &credentials, &schema).await?;
    info!(?report, "database provisioned");
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    match build_subscriber() {
        Ok(subscriber) => {
            if let Err(error) = tracing::subscriber::set_global_default(subscriber) {
                eprintln!("failed to install the tracing subscriber: {}", error);
                return ExitCode::FAILURE;
            }
        }
        Err(error) => {
            eprintln!("failed to build the tracing subscriber: {}", error);
            return ExitCode::FAILURE;
        }
    }

    let args = Cli::parse();
    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            log_error!(error, "redsocial-init failed");
            ExitCode::from(error.exit_code())
        }
    }
}
