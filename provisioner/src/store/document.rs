//! Current (version 2) persisted layout.

use cumulus_rs::cloud::{Cloud, Configuration, ModelError, Template};
use cumulus_rs::options::SlaveOptions;
use serde::{Deserialize, Serialize};

pub const CURRENT_VERSION: u64 = 2;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    pub version: u64,
    #[serde(default)]
    pub clouds: Vec<CloudRecord>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloudRecord {
    pub name: String,
    pub identity: String,
    pub credential: String,
    pub end_point_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub zone: Option<String>,
    #[serde(default)]
    pub slave_options: SlaveOptions,
    #[serde(default)]
    pub templates: Vec<TemplateRecord>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplateRecord {
    pub name: String,
    #[serde(default)]
    pub labels: String,
    #[serde(default)]
    pub slave_options: SlaveOptions,
}

impl Document {
    /// Persisted form: each layer keeps only what differs from the layer below it.
    pub fn from_configuration(configuration: &Configuration) -> Self {
        let clouds = configuration
            .clouds
            .iter()
            .map(|cloud| {
                let effective = cloud.effective_options();
                CloudRecord {
                    name: cloud.name.clone(),
                    identity: cloud.identity.clone(),
                    credential: cloud.credential.clone(),
                    end_point_url: cloud.endpoint_url.clone(),
                    zone: cloud.region.clone(),
                    slave_options: cloud.raw_options(),
                    templates: cloud
                        .templates
                        .iter()
                        .map(|t| TemplateRecord {
                            name: t.name.clone(),
                            labels: t.label_expression.clone(),
                            slave_options: t.options.erase_defaults(&effective),
                        })
                        .collect(),
                }
            })
            .collect();
        Self {
            version: CURRENT_VERSION,
            clouds,
        }
    }

    pub fn into_configuration(self) -> Result<Configuration, ModelError> {
        let clouds = self
            .clouds
            .into_iter()
            .map(|record| {
                let templates = record
                    .templates
                    .into_iter()
                    .map(|t| Template::new(t.name, t.labels, t.slave_options))
                    .collect();
                Cloud::new(
                    record.name,
                    record.identity,
                    record.credential,
                    record.end_point_url,
                    record.zone,
                    record.slave_options,
                    templates,
                )
            })
            .collect::<Result<Vec<_>, _>>()?;
        Configuration::new(clouds)
    }
}
