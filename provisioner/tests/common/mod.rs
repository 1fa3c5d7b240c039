#![allow(dead_code)]

use async_trait::async_trait;
use chrono::Utc;
use cml_provisioner::auth::token::{Grant, TokenAcl, TokenEntry};
use cml_provisioner::auth::{AclAuth, Permission, Subject};
use cml_provisioner::openstack::{
    ClientCache, ClientKey, Openstack, OpenstackError, OpenstackFactory, Server, ServerSpec,
    ServerStatus,
};
use cml_provisioner::provision::Provisioner;
use cml_provisioner::store::credentials::MemoryCredentialsStore;
use cml_provisioner::store::legacy::MigrationContext;
use cml_provisioner::store::user_data::MemoryUserDataStore;
use cml_provisioner::store::ConfigStore;
use cumulus_rs::cloud::{Cloud, Configuration, Template};
use cumulus_rs::options::{BootSource, SlaveOptions};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

pub const CLOUD: &str = "openstack";

#[derive(Debug, Default)]
struct FakeState {
    servers: BTreeMap<String, Server>,
    booted: Vec<ServerSpec>,
    destroyed: Vec<String>,
    next_id: usize,
}

/// In-memory OpenStack. Servers boot into `BUILD` and report `settle_to` from their first
/// inspection on.
#[derive(Debug)]
pub struct FakeOpenstack {
    state: Mutex<FakeState>,
    settle_to: ServerStatus,
    sanity_error: Option<String>,
    boot_error: Option<String>,
    floating_ip_error: Option<String>,
}

impl Default for FakeOpenstack {
    fn default() -> Self {
        Self {
            state: Mutex::default(),
            settle_to: ServerStatus::Active,
            sanity_error: None,
            boot_error: None,
            floating_ip_error: None,
        }
    }
}

impl FakeOpenstack {
    pub fn settling_to(status: ServerStatus) -> Self {
        Self {
            settle_to: status,
            ..Default::default()
        }
    }

    pub fn insane(message: &str) -> Self {
        Self {
            sanity_error: Some(message.to_string()),
            ..Default::default()
        }
    }

    pub fn failing_boot(message: &str) -> Self {
        Self {
            boot_error: Some(message.to_string()),
            ..Default::default()
        }
    }

    pub fn failing_floating_ip(message: &str) -> Self {
        Self {
            floating_ip_error: Some(message.to_string()),
            ..Default::default()
        }
    }

    /// Pretend a server was started earlier.
    pub fn add_running(&self, id: &str, cloud: &str, template: &str) {
        let server = Server {
            id: id.to_string(),
            name: format!("{template}-existing"),
            status: ServerStatus::Active,
            metadata: BTreeMap::from([
                ("cumulus-cloud-instance".to_string(), cloud.to_string()),
                ("cumulus-template".to_string(), template.to_string()),
            ]),
            addresses: vec!["10.0.0.250".to_string()],
            fault: None,
        };
        self.state.lock().unwrap().servers.insert(id.to_string(), server);
    }

    pub fn booted(&self) -> Vec<ServerSpec> {
        self.state.lock().unwrap().booted.clone()
    }

    pub fn destroyed(&self) -> Vec<String> {
        self.state.lock().unwrap().destroyed.clone()
    }

    pub fn server_ids(&self) -> Vec<String> {
        self.state.lock().unwrap().servers.keys().cloned().collect()
    }
}

#[async_trait]
impl Openstack for FakeOpenstack {
    async fn sanity_check(&self) -> Result<(), OpenstackError> {
        match &self.sanity_error {
            Some(message) => Err(OpenstackError::Other(message.clone())),
            None => Ok(()),
        }
    }

    async fn boot_server(&self, spec: &ServerSpec) -> Result<Server, OpenstackError> {
        if let Some(message) = &self.boot_error {
            return Err(OpenstackError::Api {
                status: 400,
                message: message.clone(),
            });
        }
        let mut state = self.state.lock().unwrap();
        state.next_id += 1;
        let server = Server {
            id: format!("srv-{}", state.next_id),
            name: spec.name.clone(),
            status: ServerStatus::Build,
            metadata: spec.metadata.clone(),
            addresses: vec![format!("10.0.0.{}", state.next_id)],
            fault: None,
        };
        state.booted.push(spec.clone());
        state.servers.insert(server.id.clone(), server.clone());
        Ok(server)
    }

    async fn get_server(&self, server_id: &str) -> Result<Server, OpenstackError> {
        let mut state = self.state.lock().unwrap();
        let server = state
            .servers
            .get_mut(server_id)
            .ok_or_else(|| OpenstackError::NoSuchServer(server_id.to_string()))?;
        if server.status == ServerStatus::Build {
            server.status = self.settle_to.clone();
            if server.status == ServerStatus::Error {
                server.fault = Some("No valid host was found".to_string());
            }
        }
        Ok(server.clone())
    }

    async fn destroy_server(&self, server_id: &str) -> Result<(), OpenstackError> {
        let mut state = self.state.lock().unwrap();
        state
            .servers
            .remove(server_id)
            .ok_or_else(|| OpenstackError::NoSuchServer(server_id.to_string()))?;
        state.destroyed.push(server_id.to_string());
        Ok(())
    }

    async fn servers_tagged(&self, key: &str, value: &str) -> Result<Vec<Server>, OpenstackError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .servers
            .values()
            .filter(|s| s.metadata.get(key).map(String::as_str) == Some(value))
            .cloned()
            .collect())
    }

    async fn assign_floating_ip(&self, server_id: &str, pool: &str) -> Result<String, OpenstackError> {
        if let Some(message) = &self.floating_ip_error {
            return Err(OpenstackError::Api {
                status: 404,
                message: message.clone(),
            });
        }
        let mut state = self.state.lock().unwrap();
        let server = state
            .servers
            .get_mut(server_id)
            .ok_or_else(|| OpenstackError::NoSuchServer(server_id.to_string()))?;
        let ip = format!("172.24.4.{}", server.addresses.len() + 100);
        server.addresses.insert(0, ip.clone());
        tracing::debug!("assigned {ip} from {pool}");
        Ok(ip)
    }
}

/// Hands out the same [`FakeOpenstack`] on every connect, or fails every connect.
pub struct FakeFactory {
    openstack: Arc<FakeOpenstack>,
    connect_error: Option<String>,
    pub calls: AtomicUsize,
}

impl FakeFactory {
    pub fn new(openstack: Arc<FakeOpenstack>) -> Self {
        Self {
            openstack,
            connect_error: None,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn failing(message: &str) -> Self {
        Self {
            openstack: Arc::new(FakeOpenstack::default()),
            connect_error: Some(message.to_string()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl OpenstackFactory for FakeFactory {
    async fn connect(&self, _key: &ClientKey) -> Result<Arc<dyn Openstack>, OpenstackError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match &self.connect_error {
            Some(message) => Err(OpenstackError::Authentication(message.clone())),
            None => Ok(Arc::clone(&self.openstack) as Arc<dyn Openstack>),
        }
    }
}

/// Options every launchable template needs.
pub fn launchable() -> SlaveOptions {
    SlaveOptions::builder()
        .boot_source(BootSource::Image { id: "img".into() })
        .hardware_id("m1.small")
        .start_timeout(2_000)
        .build()
}

pub fn cloud(options: SlaveOptions, templates: Vec<Template>) -> Cloud {
    Cloud::new(
        CLOUD,
        "tenant:user",
        "secret",
        "http://keystone:5000/v2.0",
        None,
        options,
        templates,
    )
    .unwrap()
}

/// A caller holding exactly `grants`.
pub fn caller(grants: Vec<Grant>) -> AclAuth {
    let acl = TokenAcl::new(vec![TokenEntry {
        sid: "alice".into(),
        token: "alice-token".into(),
        grants,
    }]);
    AclAuth::new(Arc::new(acl), Subject::authenticated("alice"))
}

pub fn on_cloud(permission: Permission) -> Grant {
    Grant {
        permission,
        cloud: Some(CLOUD.to_string()),
    }
}

pub fn global(permission: Permission) -> Grant {
    Grant {
        permission,
        cloud: None,
    }
}

pub struct Harness {
    pub provisioner: Arc<Provisioner>,
    pub openstack: Arc<FakeOpenstack>,
    pub factory: Arc<FakeFactory>,
    pub user_data: Arc<MemoryUserDataStore>,
    pub credentials: Arc<MemoryCredentialsStore>,
    pub dir: TempDir,
}

impl Harness {
    pub async fn new(configuration: Configuration, openstack: FakeOpenstack) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let user_data = Arc::new(MemoryUserDataStore::new());
        let credentials = Arc::new(MemoryCredentialsStore::new());
        let ctx = MigrationContext {
            now: Utc::now(),
            user_data: user_data.as_ref(),
            credentials: credentials.as_ref(),
        };
        let store = ConfigStore::open(dir.path().join("clouds.json"), &ctx).await.unwrap();
        store.save(configuration).await.unwrap();

        let openstack = Arc::new(openstack);
        let factory = Arc::new(FakeFactory::new(Arc::clone(&openstack)));
        let clients = Arc::new(ClientCache::new(factory.clone(), None));
        let provisioner = Arc::new(Provisioner::new(
            Arc::new(store),
            clients,
            user_data.clone(),
            credentials.clone(),
            Duration::from_millis(5),
        ));
        Self {
            provisioner,
            openstack,
            factory,
            user_data,
            credentials,
            dir,
        }
    }

    pub async fn single(cloud: Cloud, openstack: FakeOpenstack) -> Self {
        Self::new(Configuration::new(vec![cloud]).unwrap(), openstack).await
    }
}
