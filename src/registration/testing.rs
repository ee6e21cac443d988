//! In-memory hub for exercising the registration flow.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::api::certificates::v1::{
    CertificateSigningRequest, CertificateSigningRequestCondition, CertificateSigningRequestStatus,
};
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::api::rbac::v1::RoleBinding;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use k8s_openapi::ByteString;
use kube::ResourceExt;
use rcgen::{CertificateParams, DnType, DnValue, KeyPair};

use crate::api::addon_template::{AddOnTemplate, AddOnTemplateSpec};
use crate::api::managed_cluster_addon::ManagedClusterAddOnStatus;
use crate::api::registration_config::Server;
use crate::controllers::hub::{HubClient, HubEndpoint, HubError, HubResult};

#[derive(Default)]
pub(crate) struct FakeState {
    pub templates: Vec<AddOnTemplate>,
    pub csrs: BTreeMap<String, CertificateSigningRequest>,
    /// (namespace, name)
    pub secrets: BTreeMap<(String, String), Secret>,
    /// (cluster, namespace, name)
    pub agent_secrets: BTreeMap<(String, String, String), Secret>,
    /// (namespace, name)
    pub role_bindings: BTreeMap<(String, String), RoleBinding>,
    /// (namespace, name)
    pub statuses: BTreeMap<(String, String), ManagedClusterAddOnStatus>,
    pub endpoint: Option<HubEndpoint>,

    pub csr_creates: usize,
    pub csr_deletes: usize,
    pub role_binding_writes: usize,
    pub role_binding_deletes: usize,
    /// Number of upcoming `create_csr` calls that fail
    pub failing_csr_creates: usize,
    /// Every role binding write fails while set
    pub fail_role_bindings: bool,
}

#[derive(Default)]
pub(crate) struct FakeHub {
    state: Mutex<FakeState>,
}

impl FakeHub {
    pub fn new() -> Self {
        let hub = Self::default();
        hub.state().endpoint = Some(HubEndpoint {
            server: "https://hub.example.com:6443".into(),
            ca_pem: Some("-----BEGIN CERTIFICATE-----\nhub\n-----END CERTIFICATE-----\n".into()),
        });
        hub
    }

    pub fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }

    pub fn add_template(&self, name: &str, spec: AddOnTemplateSpec) {
        self.state().templates.push(AddOnTemplate::new(name, spec));
    }

    pub fn csr(&self, name: &str) -> Option<CertificateSigningRequest> {
        self.state().csrs.get(name).cloned()
    }

    pub fn csr_names(&self) -> Vec<String> {
        self.state().csrs.keys().cloned().collect()
    }

    /// Issue a long-lived certificate for the named CSR
    pub fn sign(&self, name: &str) {
        let cert = issue_certificate(None);
        self.set_certificate(name, cert);
    }

    /// Issue a certificate valid between the given years
    pub fn sign_between(&self, name: &str, from_year: i32, to_year: i32) {
        let cert = issue_certificate(Some((from_year, to_year)));
        self.set_certificate(name, cert);
    }

    pub fn approve_manually(&self, name: &str) {
        self.add_condition(name, "Approved", "ManualApproval");
    }

    pub fn deny(&self, name: &str) {
        self.add_condition(name, "Denied", "ManualDenial");
    }

    /// Pretend the CSR was created `seconds` ago
    pub fn age_csr(&self, name: &str, seconds: i64) {
        if let Some(csr) = self.state().csrs.get_mut(name) {
            csr.metadata.creation_timestamp =
                Some(Time(Utc::now() - chrono::Duration::seconds(seconds)));
        }
    }

    fn add_condition(&self, name: &str, type_: &str, reason: &str) {
        if let Some(csr) = self.state().csrs.get_mut(name) {
            let status = csr.status.get_or_insert_with(Default::default);
            status
                .conditions
                .get_or_insert_with(Vec::new)
                .push(CertificateSigningRequestCondition {
                    type_: type_.into(),
                    status: "True".into(),
                    reason: Some(reason.into()),
                    ..Default::default()
                });
        }
    }

    fn set_certificate(&self, name: &str, cert: String) {
        if let Some(csr) = self.state().csrs.get_mut(name) {
            let status = csr
                .status
                .get_or_insert_with(CertificateSigningRequestStatus::default);
            status.certificate = Some(ByteString(cert.into_bytes()));
        }
    }
}

pub(crate) fn issue_certificate(validity: Option<(i32, i32)>) -> String {
    let key = KeyPair::generate().unwrap();
    let mut params = CertificateParams::default();
    if let Some((from, to)) = validity {
        params.not_before = rcgen::date_time_ymd(from, 1, 1);
        params.not_after = rcgen::date_time_ymd(to, 1, 1);
    }
    params
        .distinguished_name
        .push(DnType::CommonName, DnValue::Utf8String("addon-agent".into()));
    params.self_signed(&key).unwrap().pem()
}

pub(crate) fn matches_selector(labels: &BTreeMap<String, String>, selector: &str) -> bool {
    selector
        .split(',')
        .filter(|term| !term.is_empty())
        .all(|term| match term.split_once('=') {
            Some((k, v)) => labels.get(k).map(String::as_str) == Some(v),
            None => labels.contains_key(term),
        })
}

#[async_trait]
impl HubClient for FakeHub {
    async fn get_template(&self, addon: &str) -> HubResult<Option<AddOnTemplate>> {
        Ok(self
            .state()
            .templates
            .iter()
            .find(|t| t.spec.addon_name == addon)
            .cloned())
    }

    async fn get_csr(&self, name: &str) -> HubResult<Option<CertificateSigningRequest>> {
        Ok(self.csr(name))
    }

    async fn list_csrs(&self, selector: &str) -> HubResult<Vec<CertificateSigningRequest>> {
        Ok(self
            .state()
            .csrs
            .values()
            .filter(|c| matches_selector(c.labels(), selector))
            .cloned()
            .collect())
    }

    async fn create_csr(
        &self,
        csr: &CertificateSigningRequest,
    ) -> HubResult<CertificateSigningRequest> {
        let mut state = self.state();
        if state.failing_csr_creates > 0 {
            state.failing_csr_creates -= 1;
            return Err(HubError::Unavailable("injected failure".into()));
        }
        let name = csr.name_any();
        if state.csrs.contains_key(&name) {
            return Err(HubError::AlreadyExists {
                kind: "CertificateSigningRequest",
                name,
            });
        }
        let mut created = csr.clone();
        created.metadata.creation_timestamp = Some(Time(Utc::now()));
        created.metadata.uid = Some(format!("uid-{}", state.csr_creates));
        state.csr_creates += 1;
        state.csrs.insert(name, created.clone());
        Ok(created)
    }

    async fn delete_csr(&self, name: &str) -> HubResult<()> {
        let mut state = self.state();
        if state.csrs.remove(name).is_some() {
            state.csr_deletes += 1;
        }
        Ok(())
    }

    async fn decide_csr(
        &self,
        name: &str,
        condition: &CertificateSigningRequestCondition,
    ) -> HubResult<()> {
        let mut state = self.state();
        let csr = state
            .csrs
            .get_mut(name)
            .ok_or_else(|| HubError::Unavailable(format!("csr {name} not found")))?;
        csr.status
            .get_or_insert_with(Default::default)
            .conditions
            .get_or_insert_with(Vec::new)
            .push(condition.clone());
        Ok(())
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> HubResult<Option<Secret>> {
        Ok(self
            .state()
            .secrets
            .get(&(namespace.to_string(), name.to_string()))
            .cloned())
    }

    async fn apply_secret(&self, secret: &Secret) -> HubResult<()> {
        let key = (secret.namespace().unwrap_or_default(), secret.name_any());
        self.state().secrets.insert(key, secret.clone());
        Ok(())
    }

    async fn delete_secret(&self, namespace: &str, name: &str) -> HubResult<()> {
        self.state()
            .secrets
            .remove(&(namespace.to_string(), name.to_string()));
        Ok(())
    }

    async fn list_secrets(&self, namespace: &str, selector: &str) -> HubResult<Vec<Secret>> {
        Ok(self
            .state()
            .secrets
            .iter()
            .filter(|((ns, _), s)| ns == namespace && matches_selector(s.labels(), selector))
            .map(|(_, s)| s.clone())
            .collect())
    }

    async fn get_agent_secret(
        &self,
        cluster: &str,
        namespace: &str,
        name: &str,
    ) -> HubResult<Option<Secret>> {
        Ok(self
            .state()
            .agent_secrets
            .get(&(cluster.to_string(), namespace.to_string(), name.to_string()))
            .cloned())
    }

    async fn apply_agent_secret(&self, cluster: &str, secret: &Secret) -> HubResult<()> {
        let key = (
            cluster.to_string(),
            secret.namespace().unwrap_or_default(),
            secret.name_any(),
        );
        self.state().agent_secrets.insert(key, secret.clone());
        Ok(())
    }

    async fn delete_agent_secret(
        &self,
        cluster: &str,
        namespace: &str,
        name: &str,
    ) -> HubResult<()> {
        self.state().agent_secrets.remove(&(
            cluster.to_string(),
            namespace.to_string(),
            name.to_string(),
        ));
        Ok(())
    }

    async fn list_agent_secrets(&self, cluster: &str, selector: &str) -> HubResult<Vec<Secret>> {
        Ok(self
            .state()
            .agent_secrets
            .iter()
            .filter(|((c, _, _), s)| c == cluster && matches_selector(s.labels(), selector))
            .map(|(_, s)| s.clone())
            .collect())
    }

    async fn get_role_binding(
        &self,
        namespace: &str,
        name: &str,
    ) -> HubResult<Option<RoleBinding>> {
        Ok(self
            .state()
            .role_bindings
            .get(&(namespace.to_string(), name.to_string()))
            .cloned())
    }

    async fn apply_role_binding(&self, binding: &RoleBinding) -> HubResult<()> {
        let mut state = self.state();
        if state.fail_role_bindings {
            return Err(HubError::Unavailable("injected failure".into()));
        }
        state.role_binding_writes += 1;
        let key = (binding.namespace().unwrap_or_default(), binding.name_any());
        state.role_bindings.insert(key, binding.clone());
        Ok(())
    }

    async fn delete_role_binding(&self, namespace: &str, name: &str) -> HubResult<()> {
        let mut state = self.state();
        if state
            .role_bindings
            .remove(&(namespace.to_string(), name.to_string()))
            .is_some()
        {
            state.role_binding_deletes += 1;
        }
        Ok(())
    }

    async fn list_role_bindings(
        &self,
        namespace: &str,
        selector: &str,
    ) -> HubResult<Vec<RoleBinding>> {
        Ok(self
            .state()
            .role_bindings
            .iter()
            .filter(|((ns, _), b)| ns == namespace && matches_selector(b.labels(), selector))
            .map(|(_, b)| b.clone())
            .collect())
    }

    async fn hub_endpoint(&self, _server: &Server) -> HubResult<Option<HubEndpoint>> {
        Ok(self.state().endpoint.clone())
    }

    async fn patch_addon_status(
        &self,
        namespace: &str,
        name: &str,
        status: &ManagedClusterAddOnStatus,
    ) -> HubResult<()> {
        self.state()
            .statuses
            .insert((namespace.to_string(), name.to_string()), status.clone());
        Ok(())
    }
}
