//! Launching, listing and retiring workers.

use crate::auth::{AuthorizationError, AuthorizationSource};
use crate::openstack::{
    ClientCache, ClientKey, Openstack, OpenstackError, Server, ServerSpec, ServerStatus,
};
use crate::perms;
use crate::store::credentials::CredentialsStore;
use crate::store::user_data::UserDataStore;
use crate::store::{ConfigStore, StoreError};
use chrono::Utc;
use cumulus_rs::api::{
    CloudSummary, FormValidation, TemplateSummary, WorkerDescriptor, WorkerLauncher, WorkerServer,
};
use cumulus_rs::cloud::{Cloud, Template};
use cumulus_rs::label::LabelExpression;
use cumulus_rs::options::{LauncherFactory, SlaveOptions};
use cumulus_rs::util::non_blank_str;
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;

/// Metadata key naming the cloud a server was launched by.
pub const CLOUD_TAG: &str = "cumulus-cloud-instance";
/// Metadata key naming the template a server was launched from.
pub const TEMPLATE_TAG: &str = "cumulus-template";

#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error(transparent)]
    Unauthorized(#[from] AuthorizationError),
    #[error("no such cloud '{0}'")]
    NoSuchCloud(String),
    #[error("cloud '{cloud}' has no template '{template}'")]
    NoSuchTemplate { cloud: String, template: String },
    #[error("cloud '{cloud}' has no template for label '{label}'")]
    NoTemplateForLabel { cloud: String, label: String },
    #[error("no worker '{server_id}' on cloud '{cloud}'")]
    NoSuchWorker { cloud: String, server_id: String },
    #[error("cloud '{cloud}' reached its instance cap of {cap}")]
    CloudCapReached { cloud: String, cap: u32 },
    #[error("template '{template}' reached its instance cap of {cap}")]
    TemplateCapReached { template: String, cap: u32 },
    #[error("template '{template}': {message}")]
    Invalid { template: String, message: String },
    #[error("failed to launch server: {0}")]
    Launch(#[source] OpenstackError),
    #[error("server {server_id} did not become active within {timeout_ms} ms")]
    Timeout { server_id: String, timeout_ms: u64 },
    #[error("server {server_id} failed: {message}")]
    ServerFailed { server_id: String, message: String },
    #[error(transparent)]
    Openstack(#[from] OpenstackError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Everything a launch needs that does not involve OpenStack.
struct LaunchPlan {
    spec: ServerSpec,
    options: SlaveOptions,
    launcher: PlannedLauncher,
}

enum PlannedLauncher {
    Jnlp,
    Ssh {
        credentials_id: String,
        username: String,
    },
}

/// Deletes a freshly booted server when dropped while still armed, so a launch
/// abandoned half way does not leave the server running.
struct LaunchGuard {
    client: Arc<dyn Openstack>,
    server_id: Option<String>,
}

impl LaunchGuard {
    fn new(client: Arc<dyn Openstack>, server_id: &str) -> Self {
        Self {
            client,
            server_id: Some(server_id.to_string()),
        }
    }

    fn disarm(&mut self) {
        self.server_id = None;
    }
}

impl Drop for LaunchGuard {
    fn drop(&mut self) {
        let Some(server_id) = self.server_id.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                tracing::warn!("Launch of server {server_id} was abandoned, deleting it");
                let client = Arc::clone(&self.client);
                handle.spawn(async move { discard(client.as_ref(), &server_id).await });
            }
            Err(_) => tracing::error!(
                "Launch of server {server_id} was abandoned outside a runtime, it is left running"
            ),
        }
    }
}

pub struct Provisioner {
    store: Arc<ConfigStore>,
    clients: Arc<ClientCache>,
    user_data: Arc<dyn UserDataStore>,
    credentials: Arc<dyn CredentialsStore>,
    poll_interval: Duration,
    /// Serializes cap check and boot per cloud.
    launch_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl Provisioner {
    pub fn new(
        store: Arc<ConfigStore>,
        clients: Arc<ClientCache>,
        user_data: Arc<dyn UserDataStore>,
        credentials: Arc<dyn CredentialsStore>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            store,
            clients,
            user_data,
            credentials,
            poll_interval,
            launch_locks: DashMap::new(),
        }
    }

    pub fn store(&self) -> &Arc<ConfigStore> {
        &self.store
    }

    pub fn clients(&self) -> &Arc<ClientCache> {
        &self.clients
    }

    /// Every cloud with its effective options.
    pub async fn list_clouds<AS: AuthorizationSource>(
        &self,
        auth: &AS,
    ) -> Result<Vec<CloudSummary>, AuthorizationError> {
        let _list = auth.authorize(perms::ListClouds)?;
        let configuration = self.store.snapshot().await;
        Ok(configuration
            .clouds
            .iter()
            .map(|cloud| CloudSummary {
                name: cloud.name.clone(),
                endpoint_url: cloud.endpoint_url.clone(),
                region: cloud.region.clone(),
                effective_options: cloud.effective_options(),
                templates: cloud
                    .templates
                    .iter()
                    .map(|t| TemplateSummary {
                        name: t.name.clone(),
                        labels: t.label_expression.clone(),
                        effective_options: cloud.effective_template_options(t),
                    })
                    .collect(),
            })
            .collect())
    }

    /// Launch one worker from `template_name` of `cloud_name`.
    ///
    /// Nothing is created unless the caller may provision on the cloud, the template exists and
    /// is launchable, and no instance cap is reached. Once a server exists, any failure deletes
    /// it again (best effort) before being reported, and so does dropping the returned future.
    #[tracing::instrument(skip(self, auth))]
    pub async fn provision<AS: AuthorizationSource>(
        &self,
        auth: &AS,
        cloud_name: &str,
        template_name: &str,
    ) -> Result<WorkerDescriptor, ProvisionError> {
        let privilege = auth.authorize(perms::ProvisionWorker {
            cloud: cloud_name.to_string(),
        })?;

        let configuration = self.store.snapshot().await;
        let cloud = configuration
            .cloud(cloud_name)
            .ok_or_else(|| ProvisionError::NoSuchCloud(cloud_name.to_string()))?;
        let template =
            cloud
                .template(template_name)
                .ok_or_else(|| ProvisionError::NoSuchTemplate {
                    cloud: cloud_name.to_string(),
                    template: template_name.to_string(),
                })?;

        self.launch(privilege.subject().sid(), cloud, template).await
    }

    /// Launch one worker able to serve `label` on `cloud_name`.
    ///
    /// Matching templates are tried in configuration order; a template at its own instance cap
    /// is skipped in favour of the next one. Without a label only unlabeled templates qualify.
    #[tracing::instrument(skip(self, auth))]
    pub async fn provision_for_label<AS: AuthorizationSource>(
        &self,
        auth: &AS,
        cloud_name: &str,
        label: Option<&LabelExpression>,
    ) -> Result<WorkerDescriptor, ProvisionError> {
        let privilege = auth.authorize(perms::ProvisionWorker {
            cloud: cloud_name.to_string(),
        })?;

        let configuration = self.store.snapshot().await;
        let cloud = configuration
            .cloud(cloud_name)
            .ok_or_else(|| ProvisionError::NoSuchCloud(cloud_name.to_string()))?;

        let mut capped = None;
        for template in cloud.templates_for(label) {
            match self.launch(privilege.subject().sid(), cloud, template).await {
                Err(e @ ProvisionError::TemplateCapReached { .. }) => {
                    tracing::debug!("{e}, trying the next template");
                    capped = Some(e);
                }
                result => return result,
            }
        }
        Err(capped.unwrap_or_else(|| ProvisionError::NoTemplateForLabel {
            cloud: cloud_name.to_string(),
            label: label.map(ToString::to_string).unwrap_or_default(),
        }))
    }

    fn launch_lock(&self, cloud_name: &str) -> Arc<Mutex<()>> {
        Arc::clone(
            self.launch_locks
                .entry(cloud_name.to_string())
                .or_default()
                .value(),
        )
    }

    async fn launch(
        &self,
        sid: &str,
        cloud: &Cloud,
        template: &Template,
    ) -> Result<WorkerDescriptor, ProvisionError> {
        let plan = self.plan(cloud, template).await?;

        let client = self.clients.get_openstack(&ClientKey::for_cloud(cloud)).await?;
        let server = {
            let lock = self.launch_lock(&cloud.name);
            let _launching = lock.lock().await;
            self.check_caps(client.as_ref(), cloud, template).await?;

            tracing::info!("{sid} launches '{}' on cloud '{}'", plan.spec.name, cloud.name);
            client
                .boot_server(&plan.spec)
                .await
                .map_err(ProvisionError::Launch)?
        };
        let mut guard = LaunchGuard::new(Arc::clone(&client), &server.id);

        let usable = self.await_usable(client.as_ref(), &server, &plan.options).await;
        guard.disarm();
        match usable {
            Ok(address) => Ok(self.describe(cloud, template, &server, address, plan)),
            Err(e) => {
                tracing::error!("Provisioning {} failed: {e}", server.id);
                discard(client.as_ref(), &server.id).await;
                Err(e)
            }
        }
    }

    /// Resolve options, user data and credentials; fails on anything missing.
    async fn plan(&self, cloud: &Cloud, template: &Template) -> Result<LaunchPlan, ProvisionError> {
        let options = cloud.effective_template_options(template);
        let invalid = |message: &str| ProvisionError::Invalid {
            template: template.name.clone(),
            message: message.to_string(),
        };

        let boot_source = options
            .boot_source
            .clone()
            .ok_or_else(|| invalid("no image or volume snapshot configured"))?;
        let flavor_id = non_blank_str(options.hardware_id.as_deref())
            .ok_or_else(|| invalid("no hardware (flavor) configured"))?
            .to_string();

        let launcher = match &options.launcher_factory {
            Some(LauncherFactory::Ssh { credentials_id }) => {
                let record = self
                    .credentials
                    .lookup(credentials_id)
                    .await?
                    .ok_or_else(|| invalid(&format!("no credentials record '{credentials_id}'")))?;
                PlannedLauncher::Ssh {
                    credentials_id: credentials_id.clone(),
                    username: record.username,
                }
            }
            Some(LauncherFactory::Jnlp) | None => PlannedLauncher::Jnlp,
        };

        let user_data = match non_blank_str(options.user_data_id.as_deref()) {
            Some(id) => {
                let content = self.user_data.get(id).await?;
                if content.is_none() {
                    tracing::warn!(
                        "Template '{}' refers to missing user data '{id}', booting without it",
                        template.name
                    );
                }
                content
            }
            None => None,
        };

        let suffix = uuid::Uuid::new_v4().simple().to_string();
        let spec = ServerSpec {
            name: format!("{}-{}", template.name, &suffix[..8]),
            boot_source,
            flavor_id,
            network_id: non_blank_str(options.network_id.as_deref()).map(String::from),
            user_data,
            key_pair_name: non_blank_str(options.key_pair_name.as_deref()).map(String::from),
            security_groups: options.security_group_list(),
            availability_zone: non_blank_str(options.availability_zone.as_deref())
                .map(String::from),
            metadata: BTreeMap::from([
                (CLOUD_TAG.to_string(), cloud.name.clone()),
                (TEMPLATE_TAG.to_string(), template.name.clone()),
            ]),
        };

        Ok(LaunchPlan {
            spec,
            options,
            launcher,
        })
    }

    async fn check_caps(
        &self,
        client: &dyn Openstack,
        cloud: &Cloud,
        template: &Template,
    ) -> Result<(), ProvisionError> {
        let running: Vec<Server> = client
            .servers_tagged(CLOUD_TAG, &cloud.name)
            .await?
            .into_iter()
            .filter(|s| s.status != ServerStatus::Deleted)
            .collect();

        if let Some(cap) = cloud.effective_options().instance_cap {
            if running.len() >= cap as usize {
                return Err(ProvisionError::CloudCapReached {
                    cloud: cloud.name.clone(),
                    cap,
                });
            }
        }
        if let Some(cap) = cloud.effective_template_options(template).instance_cap {
            let from_template = running
                .iter()
                .filter(|s| s.metadata.get(TEMPLATE_TAG) == Some(&template.name))
                .count();
            if from_template >= cap as usize {
                return Err(ProvisionError::TemplateCapReached {
                    template: template.name.clone(),
                    cap,
                });
            }
        }
        Ok(())
    }

    /// Wait for the server to be `ACTIVE`, then attach a floating IP if configured. Returns the
    /// address the worker should be reached at.
    async fn await_usable(
        &self,
        client: &dyn Openstack,
        server: &Server,
        options: &SlaveOptions,
    ) -> Result<Option<String>, ProvisionError> {
        let timeout_ms = options.start_timeout.unwrap_or_default();
        let active = tokio::time::timeout(
            Duration::from_millis(timeout_ms),
            self.poll_until_active(client, &server.id),
        )
        .await
        .map_err(|_| ProvisionError::Timeout {
            server_id: server.id.clone(),
            timeout_ms,
        })??;

        if let Some(pool) = non_blank_str(options.floating_ip_pool.as_deref()) {
            let ip = client.assign_floating_ip(&active.id, pool).await?;
            tracing::info!("Assigned floating IP {ip} from '{pool}' to {}", active.id);
            return Ok(Some(ip));
        }
        Ok(active.addresses.first().cloned())
    }

    async fn poll_until_active(
        &self,
        client: &dyn Openstack,
        server_id: &str,
    ) -> Result<Server, ProvisionError> {
        loop {
            let server = client.get_server(server_id).await?;
            match &server.status {
                ServerStatus::Active => return Ok(server),
                ServerStatus::Error | ServerStatus::Deleted => {
                    return Err(ProvisionError::ServerFailed {
                        server_id: server_id.to_string(),
                        message: server
                            .fault
                            .clone()
                            .unwrap_or_else(|| format!("status {}", server.status)),
                    })
                }
                status => tracing::debug!("Server {server_id} is {status}, waiting"),
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    fn describe(
        &self,
        cloud: &Cloud,
        template: &Template,
        server: &Server,
        address: Option<String>,
        plan: LaunchPlan,
    ) -> WorkerDescriptor {
        let options = plan.options;
        let launcher = match plan.launcher {
            PlannedLauncher::Jnlp => WorkerLauncher::Jnlp,
            PlannedLauncher::Ssh {
                credentials_id,
                username,
            } => WorkerLauncher::Ssh {
                credentials_id,
                username,
                host: address.clone(),
            },
        };
        WorkerDescriptor {
            name: plan.spec.name,
            server_id: server.id.clone(),
            cloud: cloud.name.clone(),
            template: template.name.clone(),
            labels: template.label_expression.clone(),
            num_executors: options.num_executors.unwrap_or(NonZeroU32::MIN),
            fs_root: options.fs_root.unwrap_or_default(),
            jvm_options: options.jvm_options,
            launcher,
            retention_time: options.retention_time.unwrap_or_default(),
            address,
            provisioned_at: Utc::now(),
        }
    }

    /// Servers launched by `cloud_name`.
    #[tracing::instrument(skip(self, auth))]
    pub async fn workers<AS: AuthorizationSource>(
        &self,
        auth: &AS,
        cloud_name: &str,
    ) -> Result<Vec<WorkerServer>, ProvisionError> {
        let _read = auth.authorize(perms::ReadWorkers {
            cloud: cloud_name.to_string(),
        })?;
        let configuration = self.store.snapshot().await;
        let cloud = configuration
            .cloud(cloud_name)
            .ok_or_else(|| ProvisionError::NoSuchCloud(cloud_name.to_string()))?;
        let client = self.clients.get_openstack(&ClientKey::for_cloud(cloud)).await?;
        Ok(client
            .servers_tagged(CLOUD_TAG, cloud_name)
            .await?
            .into_iter()
            .map(|s| WorkerServer {
                template: s.metadata.get(TEMPLATE_TAG).cloned(),
                server_id: s.id,
                name: s.name,
                status: s.status.to_string(),
                addresses: s.addresses,
            })
            .collect())
    }

    /// Delete a server launched by `cloud_name`. Servers of other clouds are not touched.
    #[tracing::instrument(skip(self, auth))]
    pub async fn terminate<AS: AuthorizationSource>(
        &self,
        auth: &AS,
        cloud_name: &str,
        server_id: &str,
    ) -> Result<(), ProvisionError> {
        let privilege = auth.authorize(perms::TerminateWorker {
            cloud: cloud_name.to_string(),
        })?;
        let configuration = self.store.snapshot().await;
        let cloud = configuration
            .cloud(cloud_name)
            .ok_or_else(|| ProvisionError::NoSuchCloud(cloud_name.to_string()))?;
        let client = self.clients.get_openstack(&ClientKey::for_cloud(cloud)).await?;

        let no_such_worker = || ProvisionError::NoSuchWorker {
            cloud: cloud_name.to_string(),
            server_id: server_id.to_string(),
        };
        let server = match client.get_server(server_id).await {
            Ok(server) => server,
            Err(OpenstackError::NoSuchServer(_)) => return Err(no_such_worker()),
            Err(e) => return Err(e.into()),
        };
        if server.metadata.get(CLOUD_TAG).map(String::as_str) != Some(cloud_name) {
            return Err(no_such_worker());
        }
        client.destroy_server(server_id).await?;
        tracing::info!(
            "{} terminated {server_id} ({}) on cloud '{cloud_name}'",
            privilege.subject().sid(),
            server.name
        );
        Ok(())
    }

    /// Check connection parameters without saving them. See [`test_connection`].
    pub async fn test_connection(
        &self,
        region: Option<&str>,
        endpoint: Option<&str>,
        identity: Option<&str>,
        credential: Option<&str>,
    ) -> FormValidation {
        test_connection(&self.clients, region, endpoint, identity, credential).await
    }

    /// Drop every cached session; the next use of any cloud connects anew.
    pub fn invalidate_clients<AS: AuthorizationSource>(
        &self,
        auth: &AS,
    ) -> Result<(), AuthorizationError> {
        let _admin = auth.authorize(perms::InvalidateClients)?;
        self.clients.invalidate_all();
        Ok(())
    }
}

async fn discard(client: &dyn Openstack, server_id: &str) {
    match client.destroy_server(server_id).await {
        Ok(()) => tracing::info!("Deleted server {server_id}"),
        Err(e) => tracing::warn!("Failed to delete server {server_id}: {e}"),
    }
}

/// Validate connection parameters: required fields first, then a fresh session (bypassing the
/// cache) and its sanity check. Blank values count as missing.
#[tracing::instrument(skip(clients, credential))]
pub async fn test_connection(
    clients: &ClientCache,
    region: Option<&str>,
    endpoint: Option<&str>,
    identity: Option<&str>,
    credential: Option<&str>,
) -> FormValidation {
    let Some(endpoint) = non_blank_str(endpoint) else {
        return FormValidation::error("Endpoint URL is required");
    };
    let Some(identity) = non_blank_str(identity) else {
        return FormValidation::error("Identity is required");
    };
    let Some(credential) = non_blank_str(credential) else {
        return FormValidation::error("Credential is required");
    };

    let key = ClientKey::new(
        endpoint,
        identity,
        credential,
        non_blank_str(region).map(String::from),
    );
    let client = match clients.connect_uncached(&key).await {
        Ok(client) => client,
        Err(e) => return FormValidation::error(format!("Cannot connect to specified cloud: {e}")),
    };
    match client.sanity_check().await {
        Ok(()) => FormValidation::ok_with("Connection succeeded"),
        Err(e) => FormValidation::warning(format!(
            "Connection established, but the cloud is not usable: {e}"
        )),
    }
}
