//! Drives every registration of a ManagedClusterAddOn and aggregates the result.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use chrono::Utc;
use kube::ResourceExt;
use tracing::{debug, info, warn};

use crate::api::addon_template::{HubPermissionConfig, RegistrationSpec};
use crate::api::managed_cluster_addon::{
    AddonPhase, ManagedClusterAddOn, ManagedClusterAddOnStatus, RegistrationPhase,
    RegistrationStatus,
};
use crate::api::registration_config::RegistrationSettings;
use crate::controllers::hub::{HubClient, HubEndpoint};
use crate::registration::approval::{ApprovalPolicy, Decision};
use crate::registration::csr::{self, CsrManager, CsrState, Issuance, STAGING_KEY_ROLE};
use crate::registration::identity::describe;
use crate::registration::permission::{self, desired_bindings};
use crate::registration::pki::CertificateInfo;
use crate::registration::secret::{self, IssuedCredential, AGENT_CREDENTIAL_ROLE};
use crate::registration::{
    owner_selector, role_selector, IdentityRequest, Registration, RegistrationError,
    RegistrationResult,
};

const BACKOFF_BASE: Duration = Duration::from_secs(5);
const BACKOFF_MAX: Duration = Duration::from_secs(300);
const ROTATION_CHECK_MAX: Duration = Duration::from_secs(3600);
const MANUAL_APPROVAL_POLL_FACTOR: u32 = 3;

/// Delay before retrying after `failures` consecutive transient failures
pub fn backoff(failures: u32) -> Duration {
    let exponent = failures.saturating_sub(1).min(16);
    BACKOFF_BASE
        .saturating_mul(1u32 << exponent)
        .min(BACKOFF_MAX)
}

/// Addon phase from its registrations
pub fn aggregate(registrations: &[RegistrationStatus], failure_threshold: u32) -> AddonPhase {
    if registrations
        .iter()
        .any(|r| r.phase.is_terminal() || r.consecutive_failures >= failure_threshold)
    {
        AddonPhase::Degraded
    } else if registrations
        .iter()
        .all(|r| r.phase == RegistrationPhase::Complete)
    {
        AddonPhase::Available
    } else {
        AddonPhase::Progressing
    }
}

/// Only the first registration resolving to a secret name may own it
fn reject_shared_secrets(
    addon: &str,
    identities: Vec<RegistrationResult<IdentityRequest>>,
) -> Vec<RegistrationResult<IdentityRequest>> {
    let mut owners = BTreeMap::new();
    identities
        .into_iter()
        .map(|identity| {
            let identity = identity?;
            let name = secret::secret_name(addon, &identity.registration);
            match owners.get(&name).copied() {
                Some(owner) => Err(RegistrationError::InvalidConfig(format!(
                    "duplicate registration for secret {name}, already used by registration {owner}"
                ))),
                None => {
                    owners.insert(name, identity.key.index);
                    Ok(identity)
                }
            }
        })
        .collect()
}

/// A denial stays in force for the same identity even once the CSR is gone
fn still_denied<'s>(
    prior: Option<&'s RegistrationStatus>,
    identity: &IdentityRequest,
) -> Option<&'s RegistrationStatus> {
    prior.filter(|r| {
        r.phase == RegistrationPhase::Denied
            && r.identity_hash.as_deref() == Some(identity.fingerprint().as_str())
    })
}

fn earliest(a: Option<Duration>, b: Option<Duration>) -> Option<Duration> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RegistrationEvent {
    pub warning: bool,
    pub reason: &'static str,
    pub note: String,
}

impl RegistrationEvent {
    fn normal(reason: &'static str, note: String) -> Self {
        Self {
            warning: false,
            reason,
            note,
        }
    }

    fn warning(reason: &'static str, note: String) -> Self {
        Self {
            warning: true,
            reason,
            note,
        }
    }
}

/// Result of one reconciliation of an addon
#[derive(Clone, Debug, PartialEq)]
pub struct Outcome {
    pub status: ManagedClusterAddOnStatus,
    /// `None` waits for the next change
    pub requeue_after: Option<Duration>,
    pub events: Vec<RegistrationEvent>,
}

struct Progress {
    phase: RegistrationPhase,
    message: Option<String>,
    next: Option<Duration>,
    events: Vec<RegistrationEvent>,
}

impl Progress {
    fn new(phase: RegistrationPhase, message: impl Into<String>, next: Option<Duration>) -> Self {
        Self {
            phase,
            message: Some(message.into()),
            next,
            events: vec![],
        }
    }

    fn with_event(mut self, event: RegistrationEvent) -> Self {
        self.events.push(event);
        self
    }
}

#[derive(Default)]
struct EndpointCache {
    resolved: bool,
    endpoint: Option<HubEndpoint>,
}

pub struct Orchestrator<'a, H: ?Sized> {
    hub: &'a H,
    policy: &'a dyn ApprovalPolicy,
    settings: &'a RegistrationSettings,
}

impl<'a, H: HubClient + ?Sized> Orchestrator<'a, H> {
    pub fn new(
        hub: &'a H,
        policy: &'a dyn ApprovalPolicy,
        settings: &'a RegistrationSettings,
    ) -> Self {
        Self {
            hub,
            policy,
            settings,
        }
    }

    pub async fn reconcile(&self, addon: &ManagedClusterAddOn) -> RegistrationResult<Outcome> {
        let cluster = addon.namespace().unwrap_or_default();
        let name = addon.name_any();
        let previous = addon.status.clone().unwrap_or_default();

        let Some(template) = self.hub.get_template(&name).await? else {
            debug!("no template, removing registration artifacts");
            self.cleanup(&cluster, &name).await?;
            return Ok(Outcome {
                status: ManagedClusterAddOnStatus {
                    phase: AddonPhase::Progressing,
                    message: Some(format!("no AddOnTemplate found for addon {name}")),
                    observed_generation: addon.metadata.generation,
                    registrations: vec![],
                },
                requeue_after: None,
                events: vec![],
            });
        };

        if let Err(e) = template.spec.validate() {
            let mut events = vec![];
            if previous.phase != AddonPhase::Degraded {
                events.push(RegistrationEvent::warning(
                    "InvalidTemplate",
                    format!("AddOnTemplate {}: {e}", template.name_any()),
                ));
            }
            return Ok(Outcome {
                status: ManagedClusterAddOnStatus {
                    phase: AddonPhase::Degraded,
                    message: Some(format!("invalid AddOnTemplate {}: {e}", template.name_any())),
                    observed_generation: addon.metadata.generation,
                    registrations: previous.registrations,
                },
                requeue_after: None,
                events,
            });
        }

        let identities = reject_shared_secrets(
            &name,
            template
                .spec
                .registration
                .iter()
                .enumerate()
                .map(|(index, spec)| describe(spec, &cluster, &name, index))
                .collect(),
        );

        // The first KubeClient registration declaring permissions owns the bindings
        let permission = identities
            .iter()
            .flatten()
            .find_map(|identity| identity.registration.permission())
            .cloned();

        let install_namespace = addon.spec.install_namespace();
        let mut endpoint = EndpointCache::default();
        let mut registrations = Vec::with_capacity(identities.len());
        let mut requeue_after = None;
        let mut events = vec![];

        for ((index, spec), identity) in template
            .spec
            .registration
            .iter()
            .enumerate()
            .zip(&identities)
        {
            let prior = previous
                .registration(index)
                .filter(|r| r.type_ == spec.type_);
            let (status, next, mut registration_events) = match identity {
                Ok(identity) => {
                    let result = match still_denied(prior, identity) {
                        Some(denied) => Ok(Progress::new(
                            RegistrationPhase::Denied,
                            denied.message.clone().unwrap_or_else(|| "CSR was denied".into()),
                            None,
                        )),
                        None => {
                            self.drive(identity, install_namespace, permission.as_ref(), &mut endpoint)
                                .await
                        }
                    };
                    self.record(index, spec, identity, prior, result)
                }
                Err(e) => self.invalid(index, spec, prior, e),
            };
            requeue_after = earliest(requeue_after, next);
            events.append(&mut registration_events);
            registrations.push(status);
        }

        if let Err(e) = self
            .prune(&cluster, &name, install_namespace, &identities, permission.as_ref())
            .await
        {
            warn!(error = %e, "failed to remove orphaned registration artifacts");
            requeue_after = earliest(requeue_after, Some(self.settings.poll_interval));
        }

        let phase = aggregate(&registrations, self.settings.transient_failure_threshold);
        let message = summarize(phase, &registrations);
        if phase != previous.phase {
            info!(phase = ?phase, "addon phase changed");
        }

        Ok(Outcome {
            status: ManagedClusterAddOnStatus {
                phase,
                message: Some(message),
                observed_generation: addon.metadata.generation,
                registrations,
            },
            requeue_after,
            events,
        })
    }

    fn record(
        &self,
        index: usize,
        spec: &RegistrationSpec,
        identity: &IdentityRequest,
        prior: Option<&RegistrationStatus>,
        result: RegistrationResult<Progress>,
    ) -> (RegistrationStatus, Option<Duration>, Vec<RegistrationEvent>) {
        let mut status = RegistrationStatus {
            index,
            type_: spec.type_.clone(),
            signer_name: Some(identity.signer_name().to_string()),
            csr_name: Some(CsrManager::<H>::name(identity)),
            secret_name: Some(secret::secret_name(&identity.key.addon, &identity.registration)),
            identity_hash: Some(identity.fingerprint()),
            ..Default::default()
        };

        match result {
            Ok(progress) => {
                status.phase = progress.phase;
                status.message = progress.message;
                (status, progress.next, progress.events)
            }
            Err(e) if e.is_retryable() => {
                let failures = prior.map_or(0, |r| r.consecutive_failures).saturating_add(1);
                warn!(index, failures, error = %e, "registration step failed, retrying");
                status.phase = RegistrationPhase::Progressing;
                status.message = Some(e.to_string());
                status.consecutive_failures = failures;
                let mut events = vec![];
                if failures == self.settings.transient_failure_threshold {
                    events.push(RegistrationEvent::warning(
                        "RegistrationFailing",
                        format!("registration {index} failed {failures} times in a row: {e}"),
                    ));
                }
                (status, Some(backoff(failures)), events)
            }
            Err(e) => self.invalid(index, spec, prior, &e),
        }
    }

    fn invalid(
        &self,
        index: usize,
        spec: &RegistrationSpec,
        prior: Option<&RegistrationStatus>,
        error: &RegistrationError,
    ) -> (RegistrationStatus, Option<Duration>, Vec<RegistrationEvent>) {
        let mut events = vec![];
        if prior.map(|r| r.phase) != Some(RegistrationPhase::InvalidConfig) {
            events.push(RegistrationEvent::warning(
                "InvalidRegistration",
                format!("registration {index}: {error}"),
            ));
        }
        let status = RegistrationStatus {
            index,
            type_: spec.type_.clone(),
            phase: RegistrationPhase::InvalidConfig,
            message: Some(error.to_string()),
            ..Default::default()
        };
        (status, None, events)
    }

    async fn drive(
        &self,
        identity: &IdentityRequest,
        install_namespace: &str,
        permission: Option<&HubPermissionConfig>,
        endpoint: &mut EndpointCache,
    ) -> RegistrationResult<Progress> {
        let key = &identity.key;
        let manager = CsrManager::new(self.hub, self.settings);
        let secret_name = secret::secret_name(&key.addon, &identity.registration);
        let now = Utc::now().timestamp();
        let threshold = self.settings.rotation_threshold;

        let current = self
            .hub
            .get_agent_secret(&key.cluster, install_namespace, &secret_name)
            .await?
            .filter(|s| secret::is_current(s, identity))
            .and_then(|s| {
                let cert = secret::certificate(&s)?.to_vec();
                let info = CertificateInfo::from_pem(&cert).ok()?;
                Some((cert, info))
            });

        if let Some((current_cert, info)) = &current {
            if !info.needs_rotation(now, threshold) {
                self.bind(identity, permission).await?;
                let due = Duration::from_secs(info.rotation_due_in(now, threshold).max(1) as u64);
                return Ok(Progress::new(
                    RegistrationPhase::Complete,
                    format!("credential stored in secret {secret_name}"),
                    Some(due.min(ROTATION_CHECK_MAX)),
                ));
            }

            // The issued request behind the current credential cannot be reused
            if let Some(spent) = self.hub.get_csr(&CsrManager::<H>::name(identity)).await? {
                if csr::check_issued(&spent) == Issuance::Issued(current_cert.clone()) {
                    info!(index = key.index, "certificate due for rotation");
                    manager.discard(identity).await?;
                }
            }
        }

        let ensured = manager.ensure_requested(identity).await?;
        let csr_name = ensured.csr.name_any();
        let mut events = vec![];
        if ensured.created {
            events.push(RegistrationEvent::normal(
                "CsrCreated",
                format!("created CSR {csr_name} for signer {}", identity.signer_name()),
            ));
        }

        let evaluation = manager.evaluate(identity, &ensured.csr, self.policy).await?;
        let renewing = if current.is_some() {
            ", current credential still in place"
        } else {
            ""
        };

        let progress = match evaluation.state {
            CsrState::Denied => {
                let progress = Progress::new(
                    RegistrationPhase::Denied,
                    format!("CSR {csr_name} was denied"),
                    None,
                );
                if evaluation.decision == Some(Decision::Deny) {
                    progress.with_event(RegistrationEvent::warning(
                        "CsrDenied",
                        format!("denied CSR {csr_name}"),
                    ))
                } else {
                    progress
                }
            }
            CsrState::Requested if evaluation.decision == Some(Decision::Hold) => Progress::new(
                RegistrationPhase::AwaitingManualApproval,
                format!("CSR {csr_name} is waiting for manual approval{renewing}"),
                Some(
                    self.settings
                        .poll_interval
                        .saturating_mul(MANUAL_APPROVAL_POLL_FACTOR),
                ),
            ),
            CsrState::Issued(cert) => {
                self.complete(identity, &manager, &ensured.csr, &cert, install_namespace, endpoint)
                    .await?
            }
            CsrState::Approved if evaluation.decision == Some(Decision::Approve) => Progress::new(
                RegistrationPhase::Progressing,
                format!("CSR {csr_name} approved, waiting for signer{renewing}"),
                Some(self.settings.poll_interval),
            )
            .with_event(RegistrationEvent::normal(
                "CsrApproved",
                format!("approved CSR {csr_name}"),
            )),
            CsrState::Approved => Progress::new(
                RegistrationPhase::Progressing,
                format!("CSR {csr_name} approved, waiting for signer{renewing}"),
                Some(self.settings.poll_interval),
            ),
            CsrState::NotRequested | CsrState::Requested | CsrState::Expired => Progress::new(
                RegistrationPhase::Progressing,
                format!("CSR {csr_name} is pending{renewing}"),
                Some(self.settings.poll_interval),
            ),
        };

        if progress.phase == RegistrationPhase::Complete {
            self.bind(identity, permission).await?;
        }

        events.extend(progress.events);
        Ok(Progress { events, ..progress })
    }

    async fn complete(
        &self,
        identity: &IdentityRequest,
        manager: &CsrManager<'_, H>,
        csr: &k8s_openapi::api::certificates::v1::CertificateSigningRequest,
        cert: &[u8],
        install_namespace: &str,
        endpoint: &mut EndpointCache,
    ) -> RegistrationResult<Progress> {
        let Some(key_pem) = manager.staged_key_for(identity, csr).await? else {
            warn!(csr = csr.name_any(), "staged key lost, requesting a new certificate");
            manager.discard(identity).await?;
            return Ok(Progress::new(
                RegistrationPhase::Progressing,
                "private key lost, requesting a new certificate",
                Some(self.settings.poll_interval),
            ));
        };

        let info = CertificateInfo::from_pem(cert)?;
        let hub = match identity.registration {
            Registration::KubeClient { .. } => self.endpoint(endpoint).await?,
            Registration::CustomSigner { .. } => None,
        };
        let secret = secret::materialize(
            identity,
            &IssuedCredential {
                key_pem: &key_pem,
                cert_pem: cert,
            },
            install_namespace,
            hub.as_ref(),
        )?;
        let secret_name = secret.name_any();
        self.hub.apply_agent_secret(&identity.key.cluster, &secret).await?;
        manager.release_key(identity).await?;
        info!(secret = secret_name, "materialized registration credential");

        let now = Utc::now().timestamp();
        let due = info.rotation_due_in(now, self.settings.rotation_threshold).max(1) as u64;
        Ok(Progress::new(
            RegistrationPhase::Complete,
            format!("credential stored in secret {secret_name}"),
            Some(Duration::from_secs(due).min(ROTATION_CHECK_MAX)),
        )
        .with_event(RegistrationEvent::normal(
            "CredentialIssued",
            format!(
                "stored certificate for registration {} in secret {install_namespace}/{secret_name}",
                identity.key.index
            ),
        )))
    }

    async fn endpoint(&self, cache: &mut EndpointCache) -> RegistrationResult<Option<HubEndpoint>> {
        if !cache.resolved {
            cache.endpoint = self.hub.hub_endpoint(&self.settings.server).await?;
            cache.resolved = true;
        }
        Ok(cache.endpoint.clone())
    }

    async fn bind(
        &self,
        identity: &IdentityRequest,
        permission: Option<&HubPermissionConfig>,
    ) -> RegistrationResult<()> {
        if identity.registration.permission().is_none() {
            return Ok(());
        }
        let key = &identity.key;
        permission::ensure_binding(self.hub, permission, &key.cluster, &key.addon, &key.cluster)
            .await
    }

    /// Remove labelled artifacts that no current registration accounts for
    async fn prune(
        &self,
        cluster: &str,
        addon: &str,
        install_namespace: &str,
        identities: &[RegistrationResult<IdentityRequest>],
        permission: Option<&HubPermissionConfig>,
    ) -> RegistrationResult<()> {
        let valid: Vec<&IdentityRequest> = identities.iter().flatten().collect();
        let csr_names: BTreeSet<String> =
            valid.iter().map(|i| CsrManager::<H>::name(i)).collect();
        let key_names: BTreeSet<String> =
            csr_names.iter().map(|n| csr::staging_key_name(n)).collect();
        let secret_names: BTreeSet<String> = valid
            .iter()
            .map(|i| secret::secret_name(addon, &i.registration))
            .collect();

        for csr in self.hub.list_csrs(&owner_selector(cluster, addon)).await? {
            if !csr_names.contains(&csr.name_any()) {
                info!(csr = csr.name_any(), "removing orphaned CSR");
                self.hub.delete_csr(&csr.name_any()).await?;
            }
        }

        for staged in self
            .hub
            .list_secrets(cluster, &role_selector(cluster, addon, STAGING_KEY_ROLE))
            .await?
        {
            if !key_names.contains(&staged.name_any()) {
                self.hub.delete_secret(cluster, &staged.name_any()).await?;
            }
        }

        for agent in self
            .hub
            .list_agent_secrets(cluster, &role_selector(cluster, addon, AGENT_CREDENTIAL_ROLE))
            .await?
        {
            let namespace = agent.namespace().unwrap_or_default();
            if !secret_names.contains(&agent.name_any()) || namespace != install_namespace {
                info!(secret = agent.name_any(), "removing orphaned agent credential");
                self.hub
                    .delete_agent_secret(cluster, &namespace, &agent.name_any())
                    .await?;
            }
        }

        let keep: Vec<String> = permission
            .map(|p| desired_bindings(p, cluster, addon, cluster))
            .unwrap_or_default()
            .iter()
            .map(|b| b.name_any())
            .collect();
        permission::prune_bindings(self.hub, cluster, addon, cluster, &keep).await
    }

    /// Delete every artifact of the addon on the cluster
    pub async fn cleanup(&self, cluster: &str, addon: &str) -> RegistrationResult<()> {
        let selector = owner_selector(cluster, addon);
        for csr in self.hub.list_csrs(&selector).await? {
            self.hub.delete_csr(&csr.name_any()).await?;
        }
        for staged in self.hub.list_secrets(cluster, &selector).await? {
            self.hub.delete_secret(cluster, &staged.name_any()).await?;
        }
        for agent in self.hub.list_agent_secrets(cluster, &selector).await? {
            self.hub
                .delete_agent_secret(cluster, &agent.namespace().unwrap_or_default(), &agent.name_any())
                .await?;
        }
        permission::prune_bindings(self.hub, cluster, addon, cluster, &[]).await?;
        info!(cluster, addon, "removed registration artifacts");
        Ok(())
    }
}

fn summarize(phase: AddonPhase, registrations: &[RegistrationStatus]) -> String {
    if phase == AddonPhase::Available {
        return format!("{} registrations complete", registrations.len());
    }

    let complete = registrations
        .iter()
        .filter(|r| r.phase == RegistrationPhase::Complete)
        .count();
    let blocking = registrations
        .iter()
        .filter(|r| r.phase != RegistrationPhase::Complete)
        .min_by_key(|r| match r.phase {
            RegistrationPhase::InvalidConfig | RegistrationPhase::Denied => 0,
            _ if r.consecutive_failures > 0 => 1,
            _ => 2,
        });

    match blocking {
        Some(r) => format!(
            "{complete}/{} registrations complete; registration {} is {}: {}",
            registrations.len(),
            r.index,
            r.phase.as_str(),
            r.message.as_deref().unwrap_or_default()
        ),
        None => format!("{complete}/{} registrations complete", registrations.len()),
    }
}
