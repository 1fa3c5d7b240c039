//! Version 1 layout, and its migration to the current model.
//!
//! Version 1 documents keep every option as a flat field on the cloud or the template, embed
//! user data inline and carry an SSH private key on the cloud. Migration moves the options into
//! [`SlaveOptions`], and moves user data and private keys into their stores.

use super::credentials::CredentialsStore;
use super::user_data::UserDataStore;
use super::StoreError;
use chrono::{DateTime, Utc};
use cumulus_rs::cloud::{Cloud, Configuration, Template};
use cumulus_rs::options::{BootSource, LauncherFactory, SlaveOptions};
use cumulus_rs::util::non_blank;
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::num::NonZeroU32;

/// Prefix of ids generated for user data extracted from version 1 templates.
pub const USER_DATA_ID_PREFIX: &str = "jenkins.plugins.openstack.compute.UserDataConfig.";

/// Username of credentials records created from a cloud's private key.
pub const LEGACY_SSH_USERNAME: &str = "jenkins";

#[derive(Debug, Deserialize)]
pub struct LegacyDocument {
    #[serde(default)]
    pub version: Option<u64>,
    #[serde(default)]
    pub clouds: Vec<LegacyCloud>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LegacyCloud {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub end_point_url: String,
    #[serde(default)]
    pub identity: String,
    #[serde(default)]
    pub credential: String,
    #[serde(default)]
    pub zone: Option<String>,
    #[serde(default)]
    pub instance_cap: Option<Value>,
    #[serde(default)]
    pub retention_time: Option<Value>,
    #[serde(default)]
    pub start_timeout: Option<Value>,
    #[serde(default)]
    pub floating_ip_pool: Option<String>,
    #[serde(default)]
    pub private_key: Option<String>,
    #[serde(default)]
    pub templates: Vec<LegacyTemplate>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LegacyTemplate {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub label_string: Option<String>,
    #[serde(default)]
    pub image_id: Option<String>,
    #[serde(default)]
    pub volume_snapshot_id: Option<String>,
    #[serde(default)]
    pub hardware_id: Option<String>,
    #[serde(default)]
    pub network_id: Option<String>,
    #[serde(default)]
    pub user_data: Option<String>,
    #[serde(default)]
    pub user_data_id: Option<String>,
    #[serde(default)]
    pub num_executors: Option<Value>,
    #[serde(default)]
    pub override_retention_time: Option<Value>,
    #[serde(default)]
    pub instance_cap: Option<Value>,
    #[serde(default)]
    pub fs_root: Option<String>,
    #[serde(default)]
    pub key_pair_name: Option<String>,
    #[serde(default)]
    pub jvm_options: Option<String>,
    #[serde(default)]
    pub slave_type: Option<String>,
    #[serde(default)]
    pub credentials_id: Option<String>,
    #[serde(default)]
    pub security_groups: Option<String>,
    #[serde(default)]
    pub availability_zone: Option<String>,
    #[serde(default)]
    pub floating_ip_pool: Option<String>,
    #[serde(default)]
    pub start_timeout: Option<Value>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// Version 1 writers stored numbers either as JSON numbers or as (possibly empty) strings.
/// Anything else is dropped with a warning.
fn number(context: &str, field: &str, value: Option<Value>) -> Option<u64> {
    let parsed = match &value {
        None | Some(Value::Null) => return None,
        Some(Value::String(s)) if s.trim().is_empty() => return None,
        Some(Value::Number(n)) => n.as_u64(),
        Some(Value::String(s)) => s.trim().parse().ok(),
        Some(_) => None,
    };
    if parsed.is_none() {
        if let Some(v) = value {
            tracing::warn!("{context}: {field} = {v} is not a non-negative integer, dropping it");
        }
    }
    parsed
}

/// Collaborators and inputs of a migration.
pub struct MigrationContext<'a> {
    /// Time used to derive generated user-data ids.
    pub now: DateTime<Utc>,
    pub user_data: &'a dyn UserDataStore,
    pub credentials: &'a dyn CredentialsStore,
}

fn warn_unknown(context: &str, extra: &BTreeMap<String, Value>) {
    for field in extra.keys() {
        tracing::warn!("{context}: ignoring version 1 field '{field}' with no current equivalent");
    }
}

fn narrow_u32(context: &str, field: &str, value: Option<Value>) -> Option<u32> {
    number(context, field, value).and_then(|v| match u32::try_from(v) {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!("{context}: {field} = {v} is out of range, dropping it");
            None
        }
    })
}

/// Pick an id under [`USER_DATA_ID_PREFIX`] that is not taken yet, starting from `now`.
async fn fresh_user_data_id(ctx: &MigrationContext<'_>) -> Result<String, StoreError> {
    let mut millis = ctx.now.timestamp_millis();
    loop {
        let id = format!("{USER_DATA_ID_PREFIX}{millis}");
        if ctx.user_data.get(&id).await?.is_none() {
            return Ok(id);
        }
        millis += 1;
    }
}

async fn migrate_template(
    cloud_name: &str,
    legacy: LegacyTemplate,
    cloud_credentials_id: Option<&str>,
    ctx: &MigrationContext<'_>,
) -> Result<Template, StoreError> {
    let context = format!("cloud '{cloud_name}', template '{}'", legacy.name);
    warn_unknown(&context, &legacy.extra);

    let mut options = SlaveOptions::builder();

    let image_id = non_blank(legacy.image_id);
    let snapshot_id = non_blank(legacy.volume_snapshot_id);
    match (image_id, snapshot_id) {
        (Some(id), snapshot) => {
            if snapshot.is_some() {
                tracing::warn!("{context}: both imageId and volumeSnapshotId are set, using the image");
            }
            options = options.boot_source(BootSource::Image { id });
        }
        (None, Some(id)) => options = options.boot_source(BootSource::VolumeSnapshot { id }),
        (None, None) => (),
    }

    if let Some(v) = non_blank(legacy.hardware_id) {
        options = options.hardware_id(v);
    }
    if let Some(v) = non_blank(legacy.network_id) {
        options = options.network_id(v);
    }

    let inline_user_data = legacy.user_data.filter(|u| !u.is_empty());
    let user_data_id = non_blank(legacy.user_data_id);
    match (inline_user_data, user_data_id) {
        (Some(content), existing) => {
            if let Some(existing) = existing {
                tracing::warn!(
                    "{context}: both inline userData and userDataId '{existing}' are set, \
                     extracting the inline user data"
                );
            }
            let id = fresh_user_data_id(ctx).await?;
            ctx.user_data.put(&id, &content).await?;
            tracing::info!("{context}: extracted inline user data as '{id}'");
            options = options.user_data_id(id);
        }
        (None, Some(id)) => options = options.user_data_id(id),
        (None, None) => (),
    }

    if let Some(n) = number(&context, "numExecutors", legacy.num_executors) {
        match u32::try_from(n).ok().and_then(NonZeroU32::new) {
            Some(n) => options = options.num_executors(n),
            None => tracing::warn!("{context}: numExecutors = {n} is not usable, dropping it"),
        }
    }
    // Deprecated, but still honored; 0 is a meaningful value.
    if let Some(v) = narrow_u32(&context, "overrideRetentionTime", legacy.override_retention_time) {
        options = options.retention_time(v);
    }
    if let Some(v) = narrow_u32(&context, "instanceCap", legacy.instance_cap) {
        options = options.instance_cap(v);
    }
    if let Some(v) = non_blank(legacy.fs_root) {
        options = options.fs_root(v);
    }
    if let Some(v) = non_blank(legacy.key_pair_name) {
        options = options.key_pair_name(v);
    }
    if let Some(v) = non_blank(legacy.jvm_options) {
        options = options.jvm_options(v);
    }
    if let Some(v) = non_blank(legacy.security_groups) {
        options = options.security_groups(v);
    }
    if let Some(v) = non_blank(legacy.availability_zone) {
        options = options.availability_zone(v);
    }
    if let Some(v) = non_blank(legacy.floating_ip_pool) {
        options = options.floating_ip_pool(v);
    }
    if let Some(v) = number(&context, "startTimeout", legacy.start_timeout) {
        options = options.start_timeout(v);
    }

    match non_blank(legacy.slave_type).as_deref() {
        None => (),
        Some("JNLP") => options = options.launcher_factory(LauncherFactory::Jnlp),
        Some("SSH") => {
            let credentials_id = non_blank(legacy.credentials_id)
                .or_else(|| cloud_credentials_id.map(String::from));
            match credentials_id {
                Some(credentials_id) => {
                    options = options.launcher_factory(LauncherFactory::Ssh { credentials_id })
                }
                None => tracing::warn!(
                    "{context}: SSH launcher without credentialsId or cloud privateKey, \
                     leaving the launcher unset"
                ),
            }
        }
        Some(other) => tracing::warn!("{context}: unknown slaveType '{other}', ignoring it"),
    }

    Ok(Template::new(
        legacy.name,
        legacy.label_string.unwrap_or_default(),
        options.build(),
    ))
}

async fn migrate_cloud(legacy: LegacyCloud, ctx: &MigrationContext<'_>) -> Result<Cloud, StoreError> {
    let context = format!("cloud '{}'", legacy.name);
    warn_unknown(&context, &legacy.extra);

    let mut options = SlaveOptions::builder();
    if let Some(v) = narrow_u32(&context, "instanceCap", legacy.instance_cap) {
        options = options.instance_cap(v);
    }
    if let Some(v) = narrow_u32(&context, "retentionTime", legacy.retention_time) {
        options = options.retention_time(v);
    }
    if let Some(v) = number(&context, "startTimeout", legacy.start_timeout) {
        options = options.start_timeout(v);
    }
    if let Some(v) = non_blank(legacy.floating_ip_pool) {
        options = options.floating_ip_pool(v);
    }

    let credentials_id = match legacy.private_key.filter(|k| !k.trim().is_empty()) {
        Some(key) => {
            let id = ctx
                .credentials
                .add_ssh_private_key(LEGACY_SSH_USERNAME, &key)
                .await?;
            tracing::info!("{context}: moved private key to credentials record {id}");
            Some(id)
        }
        None => None,
    };

    let mut templates = Vec::with_capacity(legacy.templates.len());
    for template in legacy.templates {
        templates.push(migrate_template(&legacy.name, template, credentials_id.as_deref(), ctx).await?);
    }

    Ok(Cloud::new(
        legacy.name,
        legacy.identity,
        legacy.credential,
        legacy.end_point_url,
        legacy.zone,
        options.build(),
        templates,
    )?)
}

/// Translate a version 1 document. Side effects on the user-data and credentials stores happen
/// as the document is walked, so a failed migration may leave entries behind.
pub async fn migrate(
    document: LegacyDocument,
    ctx: &MigrationContext<'_>,
) -> Result<Configuration, StoreError> {
    tracing::info!("Migrating {} clouds from version 1 layout", document.clouds.len());
    let mut clouds = Vec::with_capacity(document.clouds.len());
    for cloud in document.clouds {
        clouds.push(migrate_cloud(cloud, ctx).await?);
    }
    Ok(Configuration::new(clouds)?)
}
