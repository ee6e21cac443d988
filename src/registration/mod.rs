//! Registration and credential issuance for addon agents.
//!
//! Each `RegistrationSpec` of an addon template is turned into an identity
//! ([`identity::describe`]), driven through a CSR ([`csr::CsrManager`]) whose
//! approval is decided by an [`approval::ApprovalPolicy`], and finally
//! materialized into a secret ([`secret`]) and, for KubeClient registrations,
//! bound to hub permissions ([`permission`]).

use std::collections::BTreeMap;

use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::api::addon_template::{
    ApproveStrategy, HubPermissionConfig, RegistrationType, SigningCaRef,
};
use crate::controllers::hub::HubError;

pub mod approval;
pub mod csr;
pub mod identity;
pub mod permission;
pub mod pki;
pub mod secret;

#[cfg(test)]
pub(crate) mod testing;

use pki::PkiError;

pub static CLUSTER_NAME_LABEL: &str = "open-cluster-management.io/cluster-name";
pub static ADDON_NAME_LABEL: &str = "open-cluster-management.io/addon-name";
pub static REGISTRATION_INDEX_LABEL: &str = "addon.open-cluster-management.io/registration-index";
pub static IDENTITY_HASH_ANNOTATION: &str = "addon.open-cluster-management.io/identity-hash";
/// Tells staged private keys apart from agent credentials sharing the cluster namespace
pub static SECRET_ROLE_LABEL: &str = "addon.open-cluster-management.io/secret-role";

/// Signer used by every KubeClient registration
pub static KUBE_APISERVER_CLIENT_SIGNER: &str = "kubernetes.io/kube-apiserver-client";

pub type RegistrationResult<T> = std::result::Result<T, RegistrationError>;

#[derive(Error, Debug)]
pub enum RegistrationError {
    #[error("Invalid registration config: {0}")]
    InvalidConfig(String),

    #[error("Hub request failed: {0}")]
    Hub(#[from] HubError),

    #[error("Key material error: {0}")]
    Pki(#[from] PkiError),

    #[error("Hub endpoint unavailable: {0}")]
    HubEndpoint(String),
}

impl RegistrationError {
    /// `InvalidConfig` needs a spec edit; everything else is retried with backoff.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::InvalidConfig(_) => false,
            Self::Hub(_) | Self::Pki(_) | Self::HubEndpoint(_) => true,
        }
    }
}

/// Partition key of all registration state
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RegistrationKey {
    pub cluster: String,
    pub addon: String,
    pub index: usize,
}

impl RegistrationKey {
    pub fn new(cluster: impl Into<String>, addon: impl Into<String>, index: usize) -> Self {
        Self {
            cluster: cluster.into(),
            addon: addon.into(),
            index,
        }
    }

    pub fn labels(&self) -> BTreeMap<String, String> {
        let mut labels = owner_labels(&self.cluster, &self.addon);
        labels.insert(REGISTRATION_INDEX_LABEL.to_string(), self.index.to_string());
        labels
    }
}

/// Validated registration, one payload per type
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Registration {
    KubeClient {
        permission: Option<HubPermissionConfig>,
    },
    CustomSigner {
        signer_name: String,
        signing_ca: SigningCaRef,
    },
}

impl Registration {
    pub fn registration_type(&self) -> RegistrationType {
        match self {
            Self::KubeClient { .. } => RegistrationType::KubeClient,
            Self::CustomSigner { .. } => RegistrationType::CustomSigner,
        }
    }

    pub fn signer_name(&self) -> &str {
        match self {
            Self::KubeClient { .. } => KUBE_APISERVER_CLIENT_SIGNER,
            Self::CustomSigner { signer_name, .. } => signer_name,
        }
    }

    /// Effective permission block; empty blocks count as absent
    pub fn permission(&self) -> Option<&HubPermissionConfig> {
        match self {
            Self::KubeClient { permission } => permission.as_ref().filter(|p| !p.is_empty()),
            Self::CustomSigner { .. } => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Subject {
    pub common_name: String,
    pub organization: String,
}

/// Everything needed to request a credential for one registration
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IdentityRequest {
    pub key: RegistrationKey,
    pub registration: Registration,
    pub subject: Subject,
    pub approve_strategy: ApproveStrategy,
}

impl IdentityRequest {
    pub fn signer_name(&self) -> &str {
        self.registration.signer_name()
    }

    /// Stable digest of the identity. Permission changes do not alter it.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.registration.registration_type().to_string());
        hasher.update([0u8]);
        hasher.update(self.signer_name());
        hasher.update([0u8]);
        if let Registration::CustomSigner { signing_ca, .. } = &self.registration {
            hasher.update(&signing_ca.namespace);
            hasher.update([0u8]);
            hasher.update(&signing_ca.name);
        }
        hasher.update([0u8]);
        hasher.update(&self.subject.common_name);
        hasher.update([0u8]);
        hasher.update(&self.subject.organization);
        hasher.update([0u8]);
        hasher.update(self.approve_strategy.to_string());
        hex_prefix(&hasher.finalize(), 16)
    }
}

/// Group every credential of the addon on that cluster belongs to
pub fn addon_group(cluster: &str, addon: &str) -> String {
    format!("system:open-cluster-management:cluster:{cluster}:addon:{addon}")
}

pub fn owner_labels(cluster: &str, addon: &str) -> BTreeMap<String, String> {
    [
        (CLUSTER_NAME_LABEL.to_string(), cluster.to_string()),
        (ADDON_NAME_LABEL.to_string(), addon.to_string()),
    ]
    .into()
}

pub fn owner_selector(cluster: &str, addon: &str) -> String {
    format!("{CLUSTER_NAME_LABEL}={cluster},{ADDON_NAME_LABEL}={addon}")
}

pub fn role_selector(cluster: &str, addon: &str, role: &str) -> String {
    format!("{},{SECRET_ROLE_LABEL}={role}", owner_selector(cluster, addon))
}

pub(crate) fn hex_prefix(digest: &[u8], len: usize) -> String {
    digest
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect::<String>()
        .chars()
        .take(len)
        .collect()
}
