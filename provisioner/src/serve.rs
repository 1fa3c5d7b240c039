use crate::auth::token::TokenAcl;
use crate::auth::Acl;
use crate::config::{ProvisionerConfig, StoreConfig};
use crate::openstack::rest::RestOpenstackFactory;
use crate::openstack::ClientCache;
use crate::provision::Provisioner;
use crate::store::credentials::{CredentialsStore, FileCredentialsStore};
use crate::store::legacy::MigrationContext;
use crate::store::user_data::{DirUserDataStore, UserDataStore};
use crate::store::ConfigStore;
use chrono::Utc;
use miette::{IntoDiagnostic, WrapErr};
use std::net::SocketAddr;
use std::ops::Deref;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

pub struct AppStateInner {
    config: ProvisionerConfig,
    tokens: Arc<TokenAcl>,
    provisioner: Arc<Provisioner>,
}
impl AppStateInner {
    pub fn config(&self) -> &ProvisionerConfig {
        &self.config
    }
    pub fn tokens(&self) -> &TokenAcl {
        &self.tokens
    }
    pub fn acl(&self) -> Arc<dyn Acl> {
        Arc::clone(&self.tokens) as Arc<dyn Acl>
    }
    pub fn provisioner(&self) -> &Arc<Provisioner> {
        &self.provisioner
    }
}

#[derive(Clone)]
pub struct AppState(Arc<AppStateInner>);
impl AppState {
    pub fn new(config: ProvisionerConfig, tokens: TokenAcl, provisioner: Arc<Provisioner>) -> Self {
        Self(Arc::new(AppStateInner {
            config,
            tokens: Arc::new(tokens),
            provisioner,
        }))
    }
}
impl Deref for AppState {
    type Target = AppStateInner;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

#[derive(clap::Args, Debug)]
pub struct ServeCommand {
    #[arg(short = 'c', long = "config", env = "CML_CFG_FILE")]
    config: Option<PathBuf>,
}

/// Install the global `tracing` subscriber. `RUST_LOG` wins over the configured filter.
pub fn init_tracing(filter: Option<&str>) {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(filter.unwrap_or("info")))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    // Fails only if a subscriber is already installed, which is fine.
    let _ = tracing_subscriber::fmt().with_env_filter(env_filter).try_init();
}

pub fn xdg_basedirs() -> miette::Result<xdg::BaseDirectories> {
    xdg::BaseDirectories::with_prefix("cml_provisioner")
        .into_diagnostic()
        .wrap_err("Failed to determine XDG base directories")
}

/// Open the cloud store (migrating it if needed) along with its collaborators.
pub async fn open_stores(
    store_config: &StoreConfig,
) -> miette::Result<(
    Arc<ConfigStore>,
    Arc<dyn UserDataStore>,
    Arc<dyn CredentialsStore>,
)> {
    let user_data: Arc<dyn UserDataStore> =
        Arc::new(DirUserDataStore::new(&store_config.user_data_dir));
    let credentials: Arc<dyn CredentialsStore> =
        Arc::new(FileCredentialsStore::new(&store_config.credentials_file));
    let ctx = MigrationContext {
        now: Utc::now(),
        user_data: user_data.as_ref(),
        credentials: credentials.as_ref(),
    };
    let store = ConfigStore::open(store_config.clouds_file.clone(), &ctx)
        .await
        .into_diagnostic()
        .wrap_err_with(|| {
            format!(
                "Failed to open cloud configuration '{}'",
                store_config.clouds_file.display()
            )
        })?;
    Ok((Arc::new(store), user_data, credentials))
}

pub async fn serve(serve_command: ServeCommand) -> miette::Result<()> {
    let xdg_basedirs = xdg_basedirs()?;
    let config =
        crate::config::load_configuration(serve_command.config.as_deref(), &xdg_basedirs)?;

    init_tracing(config.log.filter.as_deref());

    let (store, user_data, credentials) = open_stores(&config.store).await?;
    let factory = RestOpenstackFactory::new(config.openstack.request_timeout)
        .into_diagnostic()
        .wrap_err("Failed to build OpenStack HTTP client")?;
    let clients = Arc::new(ClientCache::new(
        Arc::new(factory),
        Some(config.openstack.client_ttl),
    ));
    let provisioner = Arc::new(Provisioner::new(
        store,
        clients,
        user_data,
        credentials,
        config.openstack.poll_interval,
    ));

    let bind_address = config.server.bind_address;
    let tls_config = config.server.testing_only_tls_config.clone();
    let tokens = TokenAcl::new(config.auth.tokens.clone());
    if config.auth.tokens.is_empty() {
        tracing::warn!("No API tokens configured; every request will be rejected");
    }

    let app_state = AppState::new(config, tokens, provisioner);
    let router = super::routes::build_router(app_state);

    enum Server {
        PlainHttp(axum_server::Server),
        Tls(axum_server::Server<axum_server::tls_rustls::RustlsAcceptor>),
    }

    let server = match tls_config {
        None => Server::PlainHttp(axum_server::bind(bind_address)),
        Some(tls) => {
            let rustls_config =
                axum_server::tls_rustls::RustlsConfig::from_pem_file(&tls.cert, &tls.key)
                    .await
                    .into_diagnostic()
                    .wrap_err("Failed to load RusTls configuration for public server")?;
            let server = axum_server::bind_rustls(bind_address, rustls_config);

            tracing::warn!(
                "-- WARNING -- DEVELOPMENT-ONLY TLS MODE IS ENABLED. PLEASE DO NOT USE THIS IN PRODUCTION."
            );

            Server::Tls(server)
        }
    };
    tracing::info!("Bound server to {bind_address}");

    match server {
        Server::PlainHttp(server) => {
            server
                .serve(router.into_make_service_with_connect_info::<SocketAddr>())
                .await
        }
        Server::Tls(server) => {
            server
                .serve(router.into_make_service_with_connect_info::<SocketAddr>())
                .await
        }
    }
    .into_diagnostic()
    .wrap_err("(server exited)")
}
