use std::{borrow::Cow, fmt::Display, str::FromStr};

use kube::CustomResource;
use schemars::{json_schema, JsonSchema, Schema, SchemaGenerator};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// AddOnTemplate describes how to deploy the addon agent and how the agent
/// registers back to the hub. It is cluster scoped and only used on the hub.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[kube(
    kind = "AddOnTemplate",
    group = "addon.open-cluster-management.io",
    version = "v1alpha1",
    plural = "addontemplates",
    printcolumn = r#"{"name":"ADDON NAME", "type":"string", "jsonPath":".spec.addonName"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct AddOnTemplateSpec {
    /// Name of the addon which the template belongs to.
    pub addon_name: String,

    /// Kubernetes resources of the addon agent, in deployment order.
    pub agent_manifests: Vec<Manifest>,

    /// Registration configuration for the addon.
    pub registration: Vec<RegistrationSpec>,
}

/// Opaque resource deployed on the managed cluster. Never inspected here.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(transparent)]
pub struct Manifest(pub Value);

impl JsonSchema for Manifest {
    fn schema_name() -> Cow<'static, str> {
        "Manifest".into()
    }

    fn json_schema(_: &mut SchemaGenerator) -> Schema {
        json_schema!({
            "type": "object",
            "x-kubernetes-embedded-resource": true,
            "x-kubernetes-preserve-unknown-fields": true,
        })
    }
}

/// RegistrationSpec as authored. `type` and `approveStrategy` stay strings here so an
/// unknown value is reported per registration instead of failing the whole template.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RegistrationSpec {
    /// KubeClient or CustomSigner
    #[serde(rename = "type")]
    pub type_: String,

    /// Auto or None
    pub approve_strategy: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kube_client: Option<KubeClientRegistrationConfig>,

    /// Required when the type is CustomSigner
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_signer: Option<CustomSignerRegistrationConfig>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct KubeClientRegistrationConfig {
    /// Permission of the addon agent on the hub cluster
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permission: Option<HubPermissionConfig>,
}

/// Binds the given ClusterRole and/or Role to the addon group in the namespace of the
/// ManagedClusterAddOn.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct HubPermissionConfig {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub cluster_role_name: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub role_name: String,
}

impl HubPermissionConfig {
    pub fn is_empty(&self) -> bool {
        self.cluster_role_name.is_empty() && self.role_name.is_empty()
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CustomSignerRegistrationConfig {
    /// Name of the signer
    #[schemars(length(min = 5, max = 571))]
    pub name: String,

    /// Secret holding the CA used to sign requests of this signer
    #[serde(rename = "signingCA")]
    pub signing_ca: SigningCaRef,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq, Hash, JsonSchema)]
pub struct SigningCaRef {
    pub namespace: String,
    pub name: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RegistrationType {
    KubeClient,
    CustomSigner,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ApproveStrategy {
    Auto,
    None,
}

#[derive(Error, Debug, PartialEq, Eq)]
#[error("unknown {kind} `{value}`")]
pub struct UnknownVariant {
    kind: &'static str,
    value: String,
}

impl FromStr for RegistrationType {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "KubeClient" => Ok(Self::KubeClient),
            "CustomSigner" => Ok(Self::CustomSigner),
            other => Err(UnknownVariant {
                kind: "registration type",
                value: other.to_string(),
            }),
        }
    }
}

impl Display for RegistrationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::KubeClient => f.write_str("KubeClient"),
            Self::CustomSigner => f.write_str("CustomSigner"),
        }
    }
}

impl FromStr for ApproveStrategy {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Auto" => Ok(Self::Auto),
            "None" => Ok(Self::None),
            other => Err(UnknownVariant {
                kind: "approve strategy",
                value: other.to_string(),
            }),
        }
    }
}

impl Display for ApproveStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Auto => f.write_str("Auto"),
            Self::None => f.write_str("None"),
        }
    }
}

pub type TemplateResult<T> = std::result::Result<T, TemplateError>;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum TemplateError {
    #[error("addonName must not be empty")]
    EmptyAddonName,

    #[error("agentManifests must not be empty")]
    EmptyManifests,
}

impl AddOnTemplateSpec {
    /// Template level checks. Individual registrations are validated separately so one
    /// broken entry does not block the others.
    pub fn validate(&self) -> TemplateResult<()> {
        if self.addon_name.is_empty() {
            return Err(TemplateError::EmptyAddonName);
        }
        if self.agent_manifests.is_empty() {
            return Err(TemplateError::EmptyManifests);
        }
        Ok(())
    }
}
