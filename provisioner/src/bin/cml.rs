//! Provisioner runner. Run as a command-line tool.

use clap::{Args as ClapArgs, Parser, Subcommand};
use cml_provisioner::openstack::rest::RestOpenstackFactory;
use cml_provisioner::openstack::ClientCache;
use cml_provisioner::serve::{self, ServeCommand};
use cumulus_rs::api::FormValidationKind;
use miette::{IntoDiagnostic, WrapErr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Parser)]
#[command(version, about)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,
}
#[derive(Debug, Subcommand)]
#[command(about)]
pub enum Command {
    /// Run the HTTP API.
    Serve(ServeCommand),
    /// Load the cloud configuration, migrating and rewriting it if it uses the version 1 layout.
    Migrate(MigrateCommand),
    /// Check that an OpenStack endpoint accepts the given credentials.
    TestConnection(TestConnectionCommand),
}

#[derive(Debug, ClapArgs)]
pub struct MigrateCommand {
    #[arg(short = 'c', long = "config", env = "CML_CFG_FILE")]
    config: PathBuf,
}

#[derive(Debug, ClapArgs)]
pub struct TestConnectionCommand {
    #[arg(long)]
    endpoint: Option<String>,
    #[arg(long)]
    identity: Option<String>,
    #[arg(long, env = "CML_CREDENTIAL", hide_env_values = true)]
    credential: Option<String>,
    #[arg(long)]
    region: Option<String>,
    /// Timeout of each OpenStack request, in seconds.
    #[arg(long, default_value_t = 60)]
    timeout: u64,
}

async fn migrate(cmd: MigrateCommand) -> miette::Result<()> {
    let xdg_basedirs = serve::xdg_basedirs()?;
    let config = cml_provisioner::config::load_configuration(Some(cmd.config.as_path()), &xdg_basedirs)?;
    serve::init_tracing(config.log.filter.as_deref());

    let (store, _, _) = serve::open_stores(&config.store).await?;
    let configuration = store.snapshot().await;
    println!(
        "'{}' holds {} clouds in the current layout",
        store.path().display(),
        configuration.clouds.len()
    );
    Ok(())
}

async fn test_connection(cmd: TestConnectionCommand) -> miette::Result<()> {
    serve::init_tracing(None);

    let factory = RestOpenstackFactory::new(Duration::from_secs(cmd.timeout))
        .into_diagnostic()
        .wrap_err("Failed to build OpenStack HTTP client")?;
    let clients = ClientCache::new(Arc::new(factory), None);
    let validation = cml_provisioner::provision::test_connection(
        &clients,
        cmd.region.as_deref(),
        cmd.endpoint.as_deref(),
        cmd.identity.as_deref(),
        cmd.credential.as_deref(),
    )
    .await;

    println!("{:?}: {}", validation.kind, validation.message());
    match validation.kind {
        FormValidationKind::Error => Err(miette::miette!("connection test failed")),
        FormValidationKind::Ok | FormValidationKind::Warning => Ok(()),
    }
}

impl Command {
    async fn run(self) -> miette::Result<()> {
        match self {
            Command::Serve(serve_cmd) => serve::serve(serve_cmd).await,
            Command::Migrate(cmd) => migrate(cmd).await,
            Command::TestConnection(cmd) => test_connection(cmd).await,
        }
    }
}

#[tokio::main]
async fn main() {
    let cli_args = Args::parse();

    if let Err(e) = cli_args.command.run().await {
        eprintln!("Failed to run command:\n{e:?}");
        std::process::exit(1);
    }
}
