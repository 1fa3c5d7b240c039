//! [`Openstack`] over the Keystone v2.0 and Nova v2 REST APIs.

use super::{ClientKey, Openstack, OpenstackError, OpenstackFactory, Server, ServerSpec};
use async_trait::async_trait;
use base64::Engine;
use cumulus_rs::options::BootSource;
use reqwest::{Method, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::fmt::{Debug, Formatter};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

/// Factory producing [`RestOpenstack`] sessions.
pub struct RestOpenstackFactory {
    http: reqwest::Client,
}

impl RestOpenstackFactory {
    pub fn new(request_timeout: Duration) -> Result<Self, OpenstackError> {
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()?;
        Ok(Self { http })
    }
}

#[async_trait]
impl OpenstackFactory for RestOpenstackFactory {
    async fn connect(&self, key: &ClientKey) -> Result<Arc<dyn Openstack>, OpenstackError> {
        let session = authenticate(&self.http, key).await?;
        tracing::debug!(compute = %session.compute_url, "Authenticated against Keystone");
        Ok(Arc::new(RestOpenstack {
            http: self.http.clone(),
            key: key.clone(),
            session: RwLock::new(session),
        }))
    }
}

struct Session {
    token: String,
    compute_url: String,
}

pub struct RestOpenstack {
    http: reqwest::Client,
    key: ClientKey,
    session: RwLock<Session>,
}
impl Debug for RestOpenstack {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RestOpenstack")
            .field("key", &self.key)
            .finish_non_exhaustive()
    }
}

// -- Keystone

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access: Access,
}
#[derive(Debug, Deserialize)]
struct Access {
    token: Token,
    #[serde(rename = "serviceCatalog", default)]
    service_catalog: Vec<CatalogEntry>,
}
#[derive(Debug, Deserialize)]
struct Token {
    id: String,
}
#[derive(Debug, Deserialize)]
struct CatalogEntry {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    endpoints: Vec<CatalogEndpoint>,
}
#[derive(Debug, Deserialize)]
struct CatalogEndpoint {
    #[serde(default)]
    region: Option<String>,
    #[serde(rename = "publicURL")]
    public_url: String,
}

fn split_identity(identity: &str) -> Result<(&str, &str), OpenstackError> {
    match identity.split_once(':') {
        Some((tenant, user)) if !tenant.is_empty() && !user.is_empty() => Ok((tenant, user)),
        _ => Err(OpenstackError::InvalidIdentity(identity.to_string())),
    }
}

fn select_compute_endpoint(catalog: &[CatalogEntry], region: Option<&str>) -> Option<String> {
    catalog
        .iter()
        .filter(|entry| entry.kind == "compute")
        .flat_map(|entry| entry.endpoints.iter())
        .find(|ep| region.is_none() || ep.region.as_deref() == region)
        .map(|ep| ep.public_url.trim_end_matches('/').to_string())
}

async fn authenticate(http: &reqwest::Client, key: &ClientKey) -> Result<Session, OpenstackError> {
    let endpoint = key.endpoint.trim_end_matches('/');
    if !(endpoint.starts_with("http://") || endpoint.starts_with("https://")) {
        return Err(OpenstackError::InvalidEndpoint(key.endpoint.clone()));
    }
    let (tenant, user) = split_identity(&key.identity)?;

    let response = http
        .post(format!("{endpoint}/tokens"))
        .json(&json!({
            "auth": {
                "tenantName": tenant,
                "passwordCredentials": { "username": user, "password": key.credential },
            }
        }))
        .send()
        .await?;
    if response.status() == StatusCode::UNAUTHORIZED {
        return Err(OpenstackError::Authentication(format!(
            "Keystone rejected credentials for '{}'",
            key.identity
        )));
    }
    let TokenResponse { access } = checked(response).await?.json().await?;

    let compute_url = select_compute_endpoint(&access.service_catalog, key.region.as_deref())
        .ok_or_else(|| OpenstackError::NoComputeEndpoint {
            region: key.region.clone(),
        })?;
    Ok(Session {
        token: access.token.id,
        compute_url,
    })
}

/// Turn non-2xx responses into [`OpenstackError::Api`].
async fn checked(response: reqwest::Response) -> Result<reqwest::Response, OpenstackError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(OpenstackError::Api {
        status: status.as_u16(),
        message: api_error_message(&body),
    })
}

/// OpenStack wraps errors as `{"<kind>": {"message": ...}}`.
fn api_error_message(body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| {
            v.as_object()?
                .values()
                .find_map(|inner| inner.get("message")?.as_str().map(String::from))
        })
        .unwrap_or_else(|| body.trim().to_string())
}

// -- Nova

#[derive(Debug, Deserialize)]
struct NovaServerEnvelope {
    server: NovaServer,
}
#[derive(Debug, Deserialize)]
struct NovaServersEnvelope {
    servers: Vec<NovaServer>,
}
#[derive(Debug, Deserialize)]
struct NovaServer {
    id: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    metadata: BTreeMap<String, String>,
    #[serde(default)]
    addresses: BTreeMap<String, Vec<NovaAddress>>,
    #[serde(default)]
    fault: Option<NovaFault>,
}
#[derive(Debug, Deserialize)]
struct NovaAddress {
    addr: String,
    #[serde(rename = "OS-EXT-IPS:type", default)]
    kind: Option<String>,
}
#[derive(Debug, Deserialize)]
struct NovaFault {
    message: String,
}
#[derive(Debug, Deserialize)]
struct FloatingIpEnvelope {
    floating_ip: FloatingIp,
}
#[derive(Debug, Deserialize)]
struct FloatingIpsEnvelope {
    floating_ips: Vec<FloatingIp>,
}
#[derive(Debug, Deserialize)]
struct FloatingIp {
    id: String,
    ip: String,
    #[serde(default)]
    instance_id: Option<String>,
}

impl From<NovaServer> for Server {
    fn from(s: NovaServer) -> Self {
        // floating addresses first, those are what callers want to reach
        let (floating, fixed): (Vec<_>, Vec<_>) = s
            .addresses
            .into_values()
            .flatten()
            .partition(|a| a.kind.as_deref() == Some("floating"));
        Server {
            id: s.id,
            name: s.name,
            status: s.status.as_deref().unwrap_or("BUILD").into(),
            metadata: s.metadata,
            addresses: floating.into_iter().chain(fixed).map(|a| a.addr).collect(),
            fault: s.fault.map(|f| f.message),
        }
    }
}

fn server_request_body(spec: &ServerSpec) -> Value {
    let mut server = json!({
        "name": spec.name,
        "flavorRef": spec.flavor_id,
        "metadata": spec.metadata,
    });
    match &spec.boot_source {
        BootSource::Image { id } => {
            server["imageRef"] = json!(id);
        }
        BootSource::VolumeSnapshot { id } => {
            server["imageRef"] = json!("");
            server["block_device_mapping_v2"] = json!([{
                "source_type": "snapshot",
                "uuid": id,
                "destination_type": "volume",
                "boot_index": 0,
                "delete_on_termination": true,
            }]);
        }
    }
    if let Some(network_id) = &spec.network_id {
        server["networks"] = json!([{ "uuid": network_id }]);
    }
    if let Some(user_data) = &spec.user_data {
        server["user_data"] = json!(base64::prelude::BASE64_STANDARD.encode(user_data));
    }
    if let Some(key_name) = &spec.key_pair_name {
        server["key_name"] = json!(key_name);
    }
    if !spec.security_groups.is_empty() {
        let groups: Vec<_> = spec
            .security_groups
            .iter()
            .map(|name| json!({ "name": name }))
            .collect();
        server["security_groups"] = json!(groups);
    }
    if let Some(zone) = &spec.availability_zone {
        server["availability_zone"] = json!(zone);
    }
    json!({ "server": server })
}

/// `base` followed by `segments`, each percent-encoded as a single path
/// segment.
fn compute_url(
    base: &str,
    segments: &[&str],
    query: Option<&str>,
) -> Result<reqwest::Url, OpenstackError> {
    let invalid = || OpenstackError::InvalidEndpoint(base.to_string());
    let mut url = reqwest::Url::parse(base).map_err(|_| invalid())?;
    url.path_segments_mut()
        .map_err(|()| invalid())?
        .pop_if_empty()
        .extend(segments);
    url.set_query(query);
    Ok(url)
}

impl RestOpenstack {
    /// Send a request to the compute API, re-authenticating once if the token
    /// was rejected.
    async fn send(
        &self,
        method: Method,
        segments: &[&str],
        query: Option<&str>,
        body: Option<&Value>,
    ) -> Result<reqwest::Response, OpenstackError> {
        let mut reauthenticated = false;
        loop {
            let (token, base) = {
                let session = self.session.read().await;
                (session.token.clone(), session.compute_url.clone())
            };
            let url = compute_url(&base, segments, query)?;
            let mut request = self
                .http
                .request(method.clone(), url)
                .header("X-Auth-Token", token);
            if let Some(body) = body {
                request = request.json(body);
            }
            let response = request.send().await?;
            if response.status() == StatusCode::UNAUTHORIZED && !reauthenticated {
                tracing::debug!("Token rejected by Nova, re-authenticating");
                let fresh = authenticate(&self.http, &self.key).await?;
                *self.session.write().await = fresh;
                reauthenticated = true;
                continue;
            }
            return Ok(response);
        }
    }

    async fn floating_ips(&self) -> Result<Vec<FloatingIp>, OpenstackError> {
        let response = checked(self.send(Method::GET, &["os-floating-ips"], None, None).await?).await?;
        let FloatingIpsEnvelope { floating_ips } = response.json().await?;
        Ok(floating_ips)
    }

    async fn release_floating_ip(&self, floating_ip_id: &str) -> Result<(), OpenstackError> {
        checked(
            self.send(
                Method::DELETE,
                &["os-floating-ips", floating_ip_id],
                None,
                None,
            )
            .await?,
        )
        .await?;
        Ok(())
    }
}

#[async_trait]
impl Openstack for RestOpenstack {
    async fn sanity_check(&self) -> Result<(), OpenstackError> {
        checked(self.send(Method::GET, &["servers"], Some("limit=1"), None).await?).await?;
        Ok(())
    }

    #[tracing::instrument(skip(self, spec), fields(name = %spec.name))]
    async fn boot_server(&self, spec: &ServerSpec) -> Result<Server, OpenstackError> {
        let body = server_request_body(spec);
        let response = checked(self.send(Method::POST, &["servers"], None, Some(&body)).await?).await?;
        let created: Value = response.json().await?;
        let id = created["server"]["id"]
            .as_str()
            .ok_or_else(|| OpenstackError::Other("Nova did not return a server id".into()))?;
        Ok(Server {
            id: id.to_string(),
            name: spec.name.clone(),
            status: super::ServerStatus::Build,
            metadata: spec.metadata.clone(),
            addresses: vec![],
            fault: None,
        })
    }

    async fn get_server(&self, server_id: &str) -> Result<Server, OpenstackError> {
        let response = self
            .send(Method::GET, &["servers", server_id], None, None)
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(OpenstackError::NoSuchServer(server_id.to_string()));
        }
        let NovaServerEnvelope { server } = checked(response).await?.json().await?;
        Ok(server.into())
    }

    #[tracing::instrument(skip(self))]
    async fn destroy_server(&self, server_id: &str) -> Result<(), OpenstackError> {
        match self.floating_ips().await {
            Ok(ips) => {
                for ip in ips
                    .iter()
                    .filter(|ip| ip.instance_id.as_deref() == Some(server_id))
                {
                    if let Err(e) = self.release_floating_ip(&ip.id).await {
                        tracing::warn!("Failed to release floating IP {}: {e}", ip.ip);
                    }
                }
            }
            Err(e) => tracing::warn!("Failed to list floating IPs: {e}"),
        }

        let response = self
            .send(Method::DELETE, &["servers", server_id], None, None)
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(OpenstackError::NoSuchServer(server_id.to_string()));
        }
        checked(response).await?;
        Ok(())
    }

    async fn servers_tagged(&self, key: &str, value: &str) -> Result<Vec<Server>, OpenstackError> {
        let response = checked(self.send(Method::GET, &["servers", "detail"], None, None).await?).await?;
        let NovaServersEnvelope { servers } = response.json().await?;
        Ok(servers
            .into_iter()
            .filter(|s| s.metadata.get(key).map(String::as_str) == Some(value))
            .map(Server::from)
            .collect())
    }

    #[tracing::instrument(skip(self))]
    async fn assign_floating_ip(
        &self,
        server_id: &str,
        pool: &str,
    ) -> Result<String, OpenstackError> {
        let body = json!({ "pool": pool });
        let response =
            checked(self.send(Method::POST, &["os-floating-ips"], None, Some(&body)).await?).await?;
        let FloatingIpEnvelope { floating_ip } = response.json().await?;

        let action = json!({ "addFloatingIp": { "address": floating_ip.ip } });
        let attached = match self
            .send(
                Method::POST,
                &["servers", server_id, "action"],
                None,
                Some(&action),
            )
            .await
        {
            Ok(response) => checked(response).await.map(|_| ()),
            Err(e) => Err(e),
        };
        if let Err(e) = attached {
            if let Err(release) = self.release_floating_ip(&floating_ip.id).await {
                tracing::warn!("Failed to release floating IP {}: {release}", floating_ip.ip);
            }
            return Err(e);
        }
        Ok(floating_ip.ip)
    }
}
