//! Clouds, their templates, and effective option resolution.
//!
//! A [`Cloud`] owns its [`Template`]s. Templates do not point back at their
//! cloud; anything that needs both (like option resolution) goes through the
//! cloud.

use crate::label::{parse_label_set, LabelExpression, LabelMatcher};
use crate::options::{SlaveOptions, DEFAULTS};
use std::collections::{BTreeSet, HashSet};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ModelError {
    #[error("cloud name must not be empty")]
    EmptyCloudName,
    #[error("cloud '{cloud}': {field} is required")]
    MissingField { cloud: String, field: &'static str },
    #[error("cloud '{cloud}': template name must not be empty")]
    EmptyTemplateName { cloud: String },
    #[error("cloud '{cloud}': duplicate template name '{template}'")]
    DuplicateTemplate { cloud: String, template: String },
    #[error("duplicate cloud name '{0}'")]
    DuplicateCloud(String),
}

/// One worker recipe under a cloud.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Template {
    pub name: String,
    /// Whitespace separated labels this template's workers carry. May be
    /// empty.
    pub label_expression: String,
    pub options: SlaveOptions,
}

impl Template {
    pub fn new(
        name: impl Into<String>,
        label_expression: impl Into<String>,
        options: SlaveOptions,
    ) -> Self {
        Self {
            name: name.into(),
            label_expression: label_expression.into(),
            options,
        }
    }

    pub fn labels(&self) -> BTreeSet<String> {
        parse_label_set(&self.label_expression)
    }

    /// Whether workers of this template can satisfy a demand for `label`.
    ///
    /// Unlabeled demand is only served by unlabeled templates.
    pub fn serves(&self, label: Option<&LabelExpression>) -> bool {
        let labels = self.labels();
        match label {
            None => labels.is_empty(),
            Some(expr) => expr.matches(&labels),
        }
    }
}

/// A configured OpenStack target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cloud {
    pub name: String,
    pub endpoint_url: String,
    /// Usually `tenant:user`.
    pub identity: String,
    pub credential: String,
    pub region: Option<String>,
    /// Cloud level options as configured. Use [`Cloud::raw_options`] for the
    /// form that is persisted.
    pub options: SlaveOptions,
    pub templates: Vec<Template>,
}

fn required(cloud: &str, field: &'static str, value: &str) -> Result<(), ModelError> {
    if value.trim().is_empty() {
        Err(ModelError::MissingField {
            cloud: cloud.to_string(),
            field,
        })
    } else {
        Ok(())
    }
}

impl Cloud {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: impl Into<String>,
        identity: impl Into<String>,
        credential: impl Into<String>,
        endpoint_url: impl Into<String>,
        region: Option<String>,
        options: SlaveOptions,
        templates: Vec<Template>,
    ) -> Result<Self, ModelError> {
        let cloud = Self {
            name: name.into(),
            endpoint_url: endpoint_url.into(),
            identity: identity.into(),
            credential: credential.into(),
            region: crate::util::non_blank(region),
            options,
            templates,
        };
        cloud.validate()?;
        Ok(cloud)
    }

    pub fn validate(&self) -> Result<(), ModelError> {
        if self.name.trim().is_empty() {
            return Err(ModelError::EmptyCloudName);
        }
        required(&self.name, "endpoint URL", &self.endpoint_url)?;
        required(&self.name, "identity", &self.identity)?;
        required(&self.name, "credential", &self.credential)?;

        let mut seen = HashSet::new();
        for template in &self.templates {
            if template.name.trim().is_empty() {
                return Err(ModelError::EmptyTemplateName {
                    cloud: self.name.clone(),
                });
            }
            if !seen.insert(template.name.as_str()) {
                return Err(ModelError::DuplicateTemplate {
                    cloud: self.name.clone(),
                    template: template.name.clone(),
                });
            }
        }
        Ok(())
    }

    /// Built-in defaults overlaid with this cloud's options.
    pub fn effective_options(&self) -> SlaveOptions {
        DEFAULTS.override_with(&self.options)
    }

    /// This cloud's options with every value equal to the built-in default
    /// removed.
    pub fn raw_options(&self) -> SlaveOptions {
        self.options.erase_defaults(&DEFAULTS)
    }

    /// Built-in defaults, overlaid with this cloud's options, overlaid with
    /// the template's options.
    pub fn effective_template_options(&self, template: &Template) -> SlaveOptions {
        self.effective_options().override_with(&template.options)
    }

    pub fn template(&self, name: &str) -> Option<&Template> {
        self.templates.iter().find(|t| t.name == name)
    }

    /// Templates able to serve a demand for `label`, in configuration order.
    pub fn templates_for<'a>(
        &'a self,
        label: Option<&'a LabelExpression>,
    ) -> impl Iterator<Item = &'a Template> + 'a {
        self.templates.iter().filter(move |t| t.serves(label))
    }
}

/// All configured clouds.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Configuration {
    pub clouds: Vec<Cloud>,
}

impl Configuration {
    pub fn new(clouds: Vec<Cloud>) -> Result<Self, ModelError> {
        let configuration = Self { clouds };
        configuration.validate()?;
        Ok(configuration)
    }

    pub fn validate(&self) -> Result<(), ModelError> {
        let mut seen = HashSet::new();
        for cloud in &self.clouds {
            cloud.validate()?;
            if !seen.insert(cloud.name.as_str()) {
                return Err(ModelError::DuplicateCloud(cloud.name.clone()));
            }
        }
        Ok(())
    }

    pub fn cloud(&self, name: &str) -> Option<&Cloud> {
        self.clouds.iter().find(|c| c.name == name)
    }
}
