//! Provisioning options ("slave options") and their layering.
//!
//! Every knob is independently optional; an unset field means "inherit from
//! the layer below". Options are layered as `DEFAULTS <- cloud <- template`
//! through [`SlaveOptions::override_with`].

use serde::{Deserialize, Serialize};
use std::num::NonZeroU32;
use std::sync::LazyLock;

/// What disk image seeds a new server.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BootSource {
    /// Boot from a named Glance image.
    Image { id: String },
    /// Boot from a new volume created out of a Cinder volume snapshot.
    VolumeSnapshot { id: String },
}

impl BootSource {
    pub fn id(&self) -> &str {
        match self {
            BootSource::Image { id } | BootSource::VolumeSnapshot { id } => id,
        }
    }
}

/// How the worker process gets started on a booted server.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum LauncherFactory {
    /// The server calls back into the controller (user data is expected to
    /// start the agent).
    #[serde(rename = "JNLP")]
    Jnlp,
    /// The controller connects out to the server over SSH using the
    /// referenced credentials record.
    #[serde(rename = "SSH", rename_all = "camelCase")]
    Ssh { credentials_id: String },
}

/// Bag of provisioning knobs. See module docs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SlaveOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub boot_source: Option<BootSource>,
    /// Flavor id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hardware_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_id: Option<String>,
    /// Identifier of an entry in the user-data store.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_data_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_cap: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub floating_ip_pool: Option<String>,
    /// Comma separated list of security group names.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub security_groups: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub availability_zone: Option<String>,
    /// Milliseconds to wait for a server to become usable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_timeout: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_pair_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_executors: Option<NonZeroU32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jvm_options: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fs_root: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub launcher_factory: Option<LauncherFactory>,
    /// Idle minutes before a worker is retired; `0` retires it right after
    /// its first build.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retention_time: Option<u32>,
}

/// Built-in defaults, the bottom layer of every effective value.
///
/// Identifier-like fields (image, flavor, network, ...) have no sensible
/// default and are left unset.
pub static DEFAULTS: LazyLock<SlaveOptions> = LazyLock::new(|| {
    SlaveOptions::builder()
        .instance_cap(10)
        .start_timeout(600_000)
        .num_executors(NonZeroU32::MIN)
        .fs_root("/jenkins")
        .launcher_factory(LauncherFactory::Jnlp)
        .retention_time(30)
        .build()
});

fn overlay<T: Clone>(base: &Option<T>, top: &Option<T>) -> Option<T> {
    top.as_ref().or(base.as_ref()).cloned()
}

fn erase<T: Clone + PartialEq>(value: &Option<T>, default: &Option<T>) -> Option<T> {
    if value == default {
        None
    } else {
        value.clone()
    }
}

impl SlaveOptions {
    pub fn builder() -> SlaveOptionsBuilder {
        SlaveOptionsBuilder::default()
    }

    /// Builder pre-populated with every field of `self`.
    pub fn to_builder(&self) -> SlaveOptionsBuilder {
        SlaveOptionsBuilder(self.clone())
    }

    /// Returns `self` with every field that is set in `top` replaced by the
    /// value from `top`.
    pub fn override_with(&self, top: &SlaveOptions) -> SlaveOptions {
        SlaveOptions {
            boot_source: overlay(&self.boot_source, &top.boot_source),
            hardware_id: overlay(&self.hardware_id, &top.hardware_id),
            network_id: overlay(&self.network_id, &top.network_id),
            user_data_id: overlay(&self.user_data_id, &top.user_data_id),
            instance_cap: overlay(&self.instance_cap, &top.instance_cap),
            floating_ip_pool: overlay(&self.floating_ip_pool, &top.floating_ip_pool),
            security_groups: overlay(&self.security_groups, &top.security_groups),
            availability_zone: overlay(&self.availability_zone, &top.availability_zone),
            start_timeout: overlay(&self.start_timeout, &top.start_timeout),
            key_pair_name: overlay(&self.key_pair_name, &top.key_pair_name),
            num_executors: overlay(&self.num_executors, &top.num_executors),
            jvm_options: overlay(&self.jvm_options, &top.jvm_options),
            fs_root: overlay(&self.fs_root, &top.fs_root),
            launcher_factory: overlay(&self.launcher_factory, &top.launcher_factory),
            retention_time: overlay(&self.retention_time, &top.retention_time),
        }
    }

    /// Returns `self` with every field equal to the same field of `defaults`
    /// unset, so that only deviations remain.
    pub fn erase_defaults(&self, defaults: &SlaveOptions) -> SlaveOptions {
        SlaveOptions {
            boot_source: erase(&self.boot_source, &defaults.boot_source),
            hardware_id: erase(&self.hardware_id, &defaults.hardware_id),
            network_id: erase(&self.network_id, &defaults.network_id),
            user_data_id: erase(&self.user_data_id, &defaults.user_data_id),
            instance_cap: erase(&self.instance_cap, &defaults.instance_cap),
            floating_ip_pool: erase(&self.floating_ip_pool, &defaults.floating_ip_pool),
            security_groups: erase(&self.security_groups, &defaults.security_groups),
            availability_zone: erase(&self.availability_zone, &defaults.availability_zone),
            start_timeout: erase(&self.start_timeout, &defaults.start_timeout),
            key_pair_name: erase(&self.key_pair_name, &defaults.key_pair_name),
            num_executors: erase(&self.num_executors, &defaults.num_executors),
            jvm_options: erase(&self.jvm_options, &defaults.jvm_options),
            fs_root: erase(&self.fs_root, &defaults.fs_root),
            launcher_factory: erase(&self.launcher_factory, &defaults.launcher_factory),
            retention_time: erase(&self.retention_time, &defaults.retention_time),
        }
    }

    /// Whether no field is set.
    pub fn is_empty(&self) -> bool {
        *self == SlaveOptions::default()
    }

    /// Security group names, with surrounding whitespace and empty entries
    /// removed.
    pub fn security_group_list(&self) -> Vec<String> {
        self.security_groups
            .as_deref()
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect()
    }
}

/// Builder for [`SlaveOptions`]; the result has exactly the fields that were
/// set on the builder.
#[derive(Debug, Clone, Default)]
pub struct SlaveOptionsBuilder(SlaveOptions);

impl SlaveOptionsBuilder {
    pub fn boot_source(mut self, boot_source: BootSource) -> Self {
        self.0.boot_source = Some(boot_source);
        self
    }
    pub fn hardware_id(mut self, hardware_id: impl Into<String>) -> Self {
        self.0.hardware_id = Some(hardware_id.into());
        self
    }
    pub fn network_id(mut self, network_id: impl Into<String>) -> Self {
        self.0.network_id = Some(network_id.into());
        self
    }
    pub fn user_data_id(mut self, user_data_id: impl Into<String>) -> Self {
        self.0.user_data_id = Some(user_data_id.into());
        self
    }
    pub fn instance_cap(mut self, instance_cap: u32) -> Self {
        self.0.instance_cap = Some(instance_cap);
        self
    }
    pub fn floating_ip_pool(mut self, floating_ip_pool: impl Into<String>) -> Self {
        self.0.floating_ip_pool = Some(floating_ip_pool.into());
        self
    }
    pub fn security_groups(mut self, security_groups: impl Into<String>) -> Self {
        self.0.security_groups = Some(security_groups.into());
        self
    }
    pub fn availability_zone(mut self, availability_zone: impl Into<String>) -> Self {
        self.0.availability_zone = Some(availability_zone.into());
        self
    }
    pub fn start_timeout(mut self, start_timeout_ms: u64) -> Self {
        self.0.start_timeout = Some(start_timeout_ms);
        self
    }
    pub fn key_pair_name(mut self, key_pair_name: impl Into<String>) -> Self {
        self.0.key_pair_name = Some(key_pair_name.into());
        self
    }
    pub fn num_executors(mut self, num_executors: NonZeroU32) -> Self {
        self.0.num_executors = Some(num_executors);
        self
    }
    pub fn jvm_options(mut self, jvm_options: impl Into<String>) -> Self {
        self.0.jvm_options = Some(jvm_options.into());
        self
    }
    pub fn fs_root(mut self, fs_root: impl Into<String>) -> Self {
        self.0.fs_root = Some(fs_root.into());
        self
    }
    pub fn launcher_factory(mut self, launcher_factory: LauncherFactory) -> Self {
        self.0.launcher_factory = Some(launcher_factory);
        self
    }
    pub fn retention_time(mut self, retention_time_minutes: u32) -> Self {
        self.0.retention_time = Some(retention_time_minutes);
        self
    }

    pub fn build(self) -> SlaveOptions {
        self.0
    }
}
