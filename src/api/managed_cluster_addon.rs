use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub static DEFAULT_INSTALL_NAMESPACE: &str = "open-cluster-management-agent-addon";

/// ManagedClusterAddOn is the addon instance for one managed cluster. It lives in the
/// cluster namespace on the hub and is named after the addon.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[kube(
    kind = "ManagedClusterAddOn",
    group = "addon.open-cluster-management.io",
    version = "v1alpha1",
    plural = "managedclusteraddons",
    namespaced,
    status = "ManagedClusterAddOnStatus",
    printcolumn = r#"{"name":"PHASE", "type":"string", "jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"MESSAGE", "type":"string", "jsonPath":".status.message"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ManagedClusterAddOnSpec {
    /// Namespace on the managed cluster where the agent and its credentials live
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub install_namespace: Option<String>,
}

impl ManagedClusterAddOnSpec {
    pub fn install_namespace(&self) -> &str {
        self.install_namespace
            .as_deref()
            .filter(|ns| !ns.is_empty())
            .unwrap_or(DEFAULT_INSTALL_NAMESPACE)
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ManagedClusterAddOnStatus {
    pub phase: AddonPhase,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    #[serde(default)]
    pub registrations: Vec<RegistrationStatus>,
}

impl ManagedClusterAddOnStatus {
    pub fn registration(&self, index: usize) -> Option<&RegistrationStatus> {
        self.registrations.iter().find(|r| r.index == index)
    }
}

/// Aggregated addon level phase
#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq, JsonSchema)]
pub enum AddonPhase {
    #[default]
    Progressing,
    Degraded,
    Available,
}

/// Per registration phase
#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq, Hash, JsonSchema)]
pub enum RegistrationPhase {
    #[default]
    Progressing,
    AwaitingManualApproval,
    Denied,
    InvalidConfig,
    Complete,
}

impl RegistrationPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Progressing => "Progressing",
            Self::AwaitingManualApproval => "AwaitingManualApproval",
            Self::Denied => "Denied",
            Self::InvalidConfig => "InvalidConfig",
            Self::Complete => "Complete",
        }
    }

    /// Terminal until the registration spec changes
    pub fn is_terminal(&self) -> bool {
        match self {
            Self::Denied | Self::InvalidConfig => true,
            Self::Progressing | Self::AwaitingManualApproval | Self::Complete => false,
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RegistrationStatus {
    /// Position of the registration in the template
    pub index: usize,

    #[serde(rename = "type")]
    pub type_: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signer_name: Option<String>,

    pub phase: RegistrationPhase,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub csr_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Consecutive transient failures, reset on success
    #[serde(default)]
    pub consecutive_failures: u32,

    /// Fingerprint of the identity the phase was reached for
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity_hash: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn install_namespace_defaults() {
        let spec = ManagedClusterAddOnSpec::default();
        assert_eq!(spec.install_namespace(), DEFAULT_INSTALL_NAMESPACE);

        let spec = ManagedClusterAddOnSpec {
            install_namespace: Some(String::new()),
        };
        assert_eq!(spec.install_namespace(), DEFAULT_INSTALL_NAMESPACE);

        let spec = ManagedClusterAddOnSpec {
            install_namespace: Some("agents".into()),
        };
        assert_eq!(spec.install_namespace(), "agents");
    }

    #[test]
    fn status_serializes_for_printing() {
        let status = ManagedClusterAddOnStatus {
            phase: AddonPhase::Progressing,
            registrations: vec![RegistrationStatus {
                index: 0,
                type_: "CustomSigner".into(),
                signer_name: Some("my-signer".into()),
                phase: RegistrationPhase::AwaitingManualApproval,
                ..Default::default()
            }],
            ..Default::default()
        };

        let value = serde_json::to_value(&status).unwrap();
        assert_eq!(value["phase"], "Progressing");
        assert_eq!(value["registrations"][0]["phase"], "AwaitingManualApproval");
        assert_eq!(value["registrations"][0]["type"], "CustomSigner");
        assert_eq!(value["registrations"][0]["signerName"], "my-signer");
    }
}
