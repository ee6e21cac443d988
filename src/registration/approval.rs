use k8s_openapi::api::certificates::v1::CertificateSigningRequest;
use kube::ResourceExt;

use crate::api::addon_template::ApproveStrategy;

/// Outcome of an approval policy
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Decision {
    Approve,
    Deny,
    /// Leave the request for a human or an external policy
    Hold,
}

/// The parts of a CSR a policy may look at
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CsrMetadata {
    pub name: String,
    pub signer_name: String,
    pub username: Option<String>,
    pub groups: Vec<String>,
}

impl From<&CertificateSigningRequest> for CsrMetadata {
    fn from(csr: &CertificateSigningRequest) -> Self {
        Self {
            name: csr.name_any(),
            signer_name: csr.spec.signer_name.clone(),
            username: csr.spec.username.clone(),
            groups: csr.spec.groups.clone().unwrap_or_default(),
        }
    }
}

/// Pluggable approval decision for registration CSRs
pub trait ApprovalPolicy: Send + Sync {
    fn decide(&self, strategy: ApproveStrategy, csr: &CsrMetadata) -> Decision;
}

/// Approval driven purely by the registration's approve strategy
#[derive(Clone, Copy, Debug, Default)]
pub struct StrategyPolicy;

impl ApprovalPolicy for StrategyPolicy {
    fn decide(&self, strategy: ApproveStrategy, csr: &CsrMetadata) -> Decision {
        decide(strategy, csr)
    }
}

/// `Auto` always approves, `None` always holds. Neither strategy denies; `Deny` is left
/// to other policies.
pub fn decide(strategy: ApproveStrategy, _csr: &CsrMetadata) -> Decision {
    match strategy {
        ApproveStrategy::Auto => Decision::Approve,
        ApproveStrategy::None => Decision::Hold,
    }
}
