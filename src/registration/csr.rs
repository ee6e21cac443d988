//! CertificateSigningRequest lifecycle of a registration.
//!
//! A CSR is named deterministically after the registration and its signer, so a
//! reconcile that is interrupted at any point finds the same request again. The
//! private key never leaves the hub: it is staged in a secret in the cluster
//! namespace, tied to the request it was generated with, until the signed
//! certificate is materialized.

use std::time::Duration;

use chrono::{DateTime, Utc};
use k8s_openapi::api::certificates::v1::{
    CertificateSigningRequest, CertificateSigningRequestCondition, CertificateSigningRequestSpec,
};
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use k8s_openapi::ByteString;
use kube::api::ObjectMeta;
use kube::ResourceExt;
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::api::registration_config::RegistrationSettings;
use crate::controllers::hub::HubClient;

use super::approval::{ApprovalPolicy, CsrMetadata, Decision};
use super::pki::CertRequest;
use super::{
    hex_prefix, IdentityRequest, RegistrationKey, RegistrationResult, IDENTITY_HASH_ANNOTATION,
    SECRET_ROLE_LABEL,
};

pub static APPROVED: &str = "Approved";
pub static DENIED: &str = "Denied";
pub static FAILED: &str = "Failed";

pub static APPROVE_REASON: &str = "AddonRegistrationAutoApprove";
pub static DENY_REASON: &str = "AddonRegistrationDenied";

pub static STAGING_KEY_ROLE: &str = "staging-key";
pub static REQUEST_HASH_ANNOTATION: &str = "addon.open-cluster-management.io/request-hash";
pub static PRIVATE_KEY: &str = "tls.key";

pub const USAGES: [&str; 3] = ["digital signature", "key encipherment", "client auth"];

/// Observed state of a registration CSR
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CsrState {
    NotRequested,
    Requested,
    Approved,
    /// Denied or failed; terminal for this identity
    Denied,
    Issued(Vec<u8>),
    /// Pending for longer than the approval timeout
    Expired,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Issuance {
    Issued(Vec<u8>),
    NotYetIssued,
}

#[derive(Clone, Debug)]
pub struct EnsuredCsr {
    pub csr: CertificateSigningRequest,
    /// The request did not exist before this call
    pub created: bool,
}

/// CSR state after the approval policy had its say
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Evaluation {
    pub state: CsrState,
    /// Set when the policy ran on a pending request
    pub decision: Option<Decision>,
}

pub fn csr_name(key: &RegistrationKey, signer_name: &str) -> String {
    let digest = Sha256::digest(signer_name.as_bytes());
    format!(
        "addon-{}-{}-{}-{}",
        key.cluster,
        key.addon,
        key.index,
        hex_prefix(&digest, 8)
    )
}

pub fn staging_key_name(csr_name: &str) -> String {
    format!("{csr_name}-key")
}

fn request_hash(request: &[u8]) -> String {
    hex_prefix(&Sha256::digest(request), 16)
}

fn has_condition(csr: &CertificateSigningRequest, type_: &str) -> bool {
    csr.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .is_some_and(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == type_ && c.status == "True")
        })
}

pub fn check_issued(csr: &CertificateSigningRequest) -> Issuance {
    match csr
        .status
        .as_ref()
        .and_then(|s| s.certificate.as_ref())
        .filter(|cert| !cert.0.is_empty())
    {
        Some(cert) => Issuance::Issued(cert.0.clone()),
        None => Issuance::NotYetIssued,
    }
}

pub fn csr_state(
    csr: &CertificateSigningRequest,
    now: DateTime<Utc>,
    approval_timeout: Duration,
) -> CsrState {
    if has_condition(csr, DENIED) || has_condition(csr, FAILED) {
        return CsrState::Denied;
    }
    if has_condition(csr, APPROVED) {
        if let Issuance::Issued(cert) = check_issued(csr) {
            return CsrState::Issued(cert);
        }
    }

    let expired = match (
        csr.metadata.creation_timestamp.as_ref(),
        chrono::Duration::from_std(approval_timeout),
    ) {
        (Some(created), Ok(timeout)) => created
            .0
            .checked_add_signed(timeout)
            .is_some_and(|deadline| deadline < now),
        _ => false,
    };
    if expired {
        return CsrState::Expired;
    }

    if has_condition(csr, APPROVED) {
        CsrState::Approved
    } else {
        CsrState::Requested
    }
}

fn decision_condition(approved: bool) -> CertificateSigningRequestCondition {
    let (type_, reason, message) = if approved {
        (APPROVED, APPROVE_REASON, "Auto approving addon agent registration")
    } else {
        (DENIED, DENY_REASON, "Addon agent registration denied by policy")
    };
    CertificateSigningRequestCondition {
        type_: type_.to_string(),
        status: "True".to_string(),
        reason: Some(reason.to_string()),
        message: Some(message.to_string()),
        last_update_time: Some(Time(Utc::now())),
        ..Default::default()
    }
}

pub struct CsrManager<'a, H: ?Sized> {
    hub: &'a H,
    settings: &'a RegistrationSettings,
}

impl<'a, H: HubClient + ?Sized> CsrManager<'a, H> {
    pub fn new(hub: &'a H, settings: &'a RegistrationSettings) -> Self {
        Self { hub, settings }
    }

    pub fn name(identity: &IdentityRequest) -> String {
        csr_name(&identity.key, identity.signer_name())
    }

    /// Make sure a CSR for the identity exists. Idempotent: an existing request for the
    /// same identity is returned as is, a stale one is replaced.
    pub async fn ensure_requested(
        &self,
        identity: &IdentityRequest,
    ) -> RegistrationResult<EnsuredCsr> {
        let name = Self::name(identity);
        if let Some(existing) = self.hub.get_csr(&name).await? {
            if self.reusable(identity, &existing).await? {
                return Ok(EnsuredCsr {
                    csr: existing,
                    created: false,
                });
            }
            info!(csr = name, "replacing stale registration CSR");
            self.discard(identity).await?;
        }
        Ok(EnsuredCsr {
            csr: self.create(identity, &name).await?,
            created: true,
        })
    }

    async fn reusable(
        &self,
        identity: &IdentityRequest,
        csr: &CertificateSigningRequest,
    ) -> RegistrationResult<bool> {
        let fingerprint = identity.fingerprint();
        if csr.annotations().get(IDENTITY_HASH_ANNOTATION) != Some(&fingerprint) {
            debug!(csr = csr.name_any(), "identity changed");
            return Ok(false);
        }

        match csr_state(csr, Utc::now(), self.settings.approval_timeout) {
            CsrState::Denied => Ok(true),
            CsrState::Expired => Ok(false),
            _ => {
                let staged = self.staged_key_for(identity, csr).await?;
                Ok(staged.is_some())
            }
        }
    }

    async fn create(
        &self,
        identity: &IdentityRequest,
        name: &str,
    ) -> RegistrationResult<CertificateSigningRequest> {
        let request = CertRequest::generate(&identity.subject)?;
        let csr = self.build(identity, name, request.csr_pem());

        // The key goes first so an issued certificate never lacks it
        self.hub
            .apply_secret(&staging_secret(
                identity,
                name,
                request.private_key_pem(),
                &csr.spec.request.0,
            ))
            .await?;
        let created = self.hub.create_csr(&csr).await?;
        info!(
            csr = name,
            signer = identity.signer_name(),
            "created registration CSR"
        );
        Ok(created)
    }

    fn build(
        &self,
        identity: &IdentityRequest,
        name: &str,
        csr_pem: &str,
    ) -> CertificateSigningRequest {
        CertificateSigningRequest {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                labels: Some(identity.key.labels()),
                annotations: Some(
                    [(IDENTITY_HASH_ANNOTATION.to_string(), identity.fingerprint())].into(),
                ),
                ..Default::default()
            },
            spec: CertificateSigningRequestSpec {
                request: ByteString(csr_pem.as_bytes().to_vec()),
                signer_name: identity.signer_name().to_string(),
                usages: Some(USAGES.iter().map(|u| u.to_string()).collect()),
                expiration_seconds: self.settings.certificate_expiration_seconds,
                ..Default::default()
            },
            status: None,
        }
    }

    /// Apply the approval policy to a pending CSR
    pub async fn evaluate(
        &self,
        identity: &IdentityRequest,
        csr: &CertificateSigningRequest,
        policy: &dyn ApprovalPolicy,
    ) -> RegistrationResult<Evaluation> {
        let state = csr_state(csr, Utc::now(), self.settings.approval_timeout);
        if state != CsrState::Requested {
            return Ok(Evaluation {
                state,
                decision: None,
            });
        }

        let decision = policy.decide(identity.approve_strategy, &CsrMetadata::from(csr));
        let state = match decision {
            Decision::Approve => {
                self.hub
                    .decide_csr(&csr.name_any(), &decision_condition(true))
                    .await?;
                info!(csr = csr.name_any(), "approved registration CSR");
                CsrState::Approved
            }
            Decision::Deny => {
                self.hub
                    .decide_csr(&csr.name_any(), &decision_condition(false))
                    .await?;
                info!(csr = csr.name_any(), "denied registration CSR");
                CsrState::Denied
            }
            Decision::Hold => CsrState::Requested,
        };

        Ok(Evaluation {
            state,
            decision: Some(decision),
        })
    }

    /// Private key staged for the given CSR, if it still matches the request
    pub async fn staged_key_for(
        &self,
        identity: &IdentityRequest,
        csr: &CertificateSigningRequest,
    ) -> RegistrationResult<Option<String>> {
        let name = staging_key_name(&csr.name_any());
        let Some(secret) = self.hub.get_secret(&identity.key.cluster, &name).await? else {
            return Ok(None);
        };

        if secret.annotations().get(REQUEST_HASH_ANNOTATION)
            != Some(&request_hash(&csr.spec.request.0))
        {
            return Ok(None);
        }

        Ok(secret
            .data
            .as_ref()
            .and_then(|data| data.get(PRIVATE_KEY))
            .and_then(|key| String::from_utf8(key.0.clone()).ok()))
    }

    /// Drop the staged key once the credential has been materialized
    pub async fn release_key(&self, identity: &IdentityRequest) -> RegistrationResult<()> {
        let name = staging_key_name(&Self::name(identity));
        self.hub.delete_secret(&identity.key.cluster, &name).await?;
        Ok(())
    }

    /// Delete the CSR and its staged key
    pub async fn discard(&self, identity: &IdentityRequest) -> RegistrationResult<()> {
        let name = Self::name(identity);
        self.hub.delete_csr(&name).await?;
        self.release_key(identity).await
    }
}

fn staging_secret(
    identity: &IdentityRequest,
    csr_name: &str,
    key_pem: &str,
    request: &[u8],
) -> Secret {
    let mut labels = identity.key.labels();
    labels.insert(SECRET_ROLE_LABEL.to_string(), STAGING_KEY_ROLE.to_string());

    Secret {
        metadata: ObjectMeta {
            name: Some(staging_key_name(csr_name)),
            namespace: Some(identity.key.cluster.clone()),
            labels: Some(labels),
            annotations: Some([(REQUEST_HASH_ANNOTATION.to_string(), request_hash(request))].into()),
            ..Default::default()
        },
        type_: Some("Opaque".to_string()),
        data: Some([(PRIVATE_KEY.to_string(), ByteString(key_pem.as_bytes().to_vec()))].into()),
        ..Default::default()
    }
}
