//! Hub cluster access used by the registration components.
//!
//! Every read and write of CSRs, secrets, RoleBindings and addon status goes
//! through [`HubClient`], so the state machines can be exercised without a
//! live API server.

use async_trait::async_trait;
use k8s_openapi::api::certificates::v1::{
    CertificateSigningRequest, CertificateSigningRequestCondition,
};
use k8s_openapi::api::core::v1::{ConfigMap, Endpoints, Secret};
use k8s_openapi::api::rbac::v1::RoleBinding;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::runtime::reflector::Store;
use kube::{Client, ResourceExt};
use serde_json::json;
use thiserror::Error;
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use crate::api::addon_template::AddOnTemplate;
use crate::api::managed_cluster_addon::{ManagedClusterAddOn, ManagedClusterAddOnStatus};
use crate::api::registration_config::{HubServerOptions, Server};

pub static FIELD_MANAGER: &str = "addon-registration-controller";

/// Agent secrets are staged in the cluster namespace; this records where the sync
/// engine must place them on the managed cluster.
pub static TARGET_NAMESPACE_ANNOTATION: &str = "addon.open-cluster-management.io/target-namespace";

pub type HubResult<T> = std::result::Result<T, HubError>;

#[derive(Error, Debug)]
pub enum HubError {
    #[error("Kube error: {0}")]
    Kube(#[from] kube::Error),

    #[error("{kind} `{name}` already exists")]
    AlreadyExists { kind: &'static str, name: String },

    #[error("Hub unavailable: {0}")]
    Unavailable(String),
}

/// Hub API server as seen by agents
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HubEndpoint {
    pub server: String,
    pub ca_pem: Option<String>,
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait HubClient: Send + Sync {
    /// AddOnTemplate whose `spec.addonName` matches
    async fn get_template(&self, addon: &str) -> HubResult<Option<AddOnTemplate>>;

    async fn get_csr(&self, name: &str) -> HubResult<Option<CertificateSigningRequest>>;

    async fn list_csrs(&self, selector: &str) -> HubResult<Vec<CertificateSigningRequest>>;

    /// Fails with `AlreadyExists` on name collision
    async fn create_csr(
        &self,
        csr: &CertificateSigningRequest,
    ) -> HubResult<CertificateSigningRequest>;

    async fn delete_csr(&self, name: &str) -> HubResult<()>;

    /// Set the approval condition through the approval subresource
    async fn decide_csr(
        &self,
        name: &str,
        condition: &CertificateSigningRequestCondition,
    ) -> HubResult<()>;

    async fn get_secret(&self, namespace: &str, name: &str) -> HubResult<Option<Secret>>;

    async fn apply_secret(&self, secret: &Secret) -> HubResult<()>;

    async fn delete_secret(&self, namespace: &str, name: &str) -> HubResult<()>;

    async fn list_secrets(&self, namespace: &str, selector: &str) -> HubResult<Vec<Secret>>;

    /// Secret as it will appear in the install namespace of the managed cluster
    async fn get_agent_secret(
        &self,
        cluster: &str,
        namespace: &str,
        name: &str,
    ) -> HubResult<Option<Secret>>;

    async fn apply_agent_secret(&self, cluster: &str, secret: &Secret) -> HubResult<()>;

    async fn delete_agent_secret(&self, cluster: &str, namespace: &str, name: &str)
        -> HubResult<()>;

    async fn list_agent_secrets(&self, cluster: &str, selector: &str) -> HubResult<Vec<Secret>>;

    async fn get_role_binding(&self, namespace: &str, name: &str)
        -> HubResult<Option<RoleBinding>>;

    async fn apply_role_binding(&self, binding: &RoleBinding) -> HubResult<()>;

    async fn delete_role_binding(&self, namespace: &str, name: &str) -> HubResult<()>;

    async fn list_role_bindings(
        &self,
        namespace: &str,
        selector: &str,
    ) -> HubResult<Vec<RoleBinding>>;

    /// `None` when the endpoint cannot be determined yet
    async fn hub_endpoint(&self, server: &Server) -> HubResult<Option<HubEndpoint>>;

    async fn patch_addon_status(
        &self,
        namespace: &str,
        name: &str,
        status: &ManagedClusterAddOnStatus,
    ) -> HubResult<()>;
}

/// [`HubClient`] backed by the hub API server
#[derive(Clone)]
pub struct KubeHubClient {
    client: Client,
    /// AddOnTemplates cached by the controller's template watch
    templates: Store<AddOnTemplate>,
}

impl KubeHubClient {
    pub fn new(client: Client, templates: Store<AddOnTemplate>) -> Self {
        Self { client, templates }
    }

    fn csrs(&self) -> Api<CertificateSigningRequest> {
        Api::all(self.client.clone())
    }

    fn secrets(&self, namespace: &str) -> Api<Secret> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn role_bindings(&self, namespace: &str) -> Api<RoleBinding> {
        Api::namespaced(self.client.clone(), namespace)
    }

    async fn local_endpoint(&self) -> HubResult<Option<HubEndpoint>> {
        let endpoints: Api<Endpoints> = Api::namespaced(self.client.clone(), "default");
        let Some(server) = endpoints
            .get_opt("kubernetes")
            .await?
            .and_then(default_endpoint_lookup)
        else {
            return Ok(None);
        };

        let config_maps: Api<ConfigMap> = Api::namespaced(self.client.clone(), "default");
        let ca_pem = config_maps
            .get_opt("kube-root-ca.crt")
            .await?
            .and_then(|cm| cm.data?.get("ca.crt").cloned());

        Ok(Some(HubEndpoint { server, ca_pem }))
    }

    async fn custom_endpoint(&self, options: &HubServerOptions) -> HubResult<Option<HubEndpoint>> {
        let Some(server) = options.api_server_url.clone() else {
            return Ok(None);
        };

        let ca_pem = match &options.api_server_ca_config_ref {
            Some(config_ref) => {
                let namespace = config_ref.namespace.as_deref().unwrap_or("default");
                let name = config_ref.name.as_deref().unwrap_or_default();
                let config_maps: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
                config_maps
                    .get_opt(name)
                    .await?
                    .and_then(|cm| cm.data?.get("ca.crt").cloned())
            }
            None => None,
        };

        Ok(Some(HubEndpoint { server, ca_pem }))
    }
}

fn default_endpoint_lookup(endpoints: Endpoints) -> Option<String> {
    let subsets = endpoints.subsets?;
    let subset = subsets.first()?.clone();
    let address = subset.addresses?.first()?.clone();
    let port = subset.ports?.first()?.clone();

    let host = address.hostname.unwrap_or(address.ip);
    Some(format!("https://{host}:{}", port.port))
}

fn ignore_not_found(result: kube::Result<impl Sized>) -> HubResult<()> {
    match result {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Template of `addon` from the reflector cache, once the initial list has landed
async fn cached_template(
    templates: &Store<AddOnTemplate>,
    addon: &str,
) -> HubResult<Option<AddOnTemplate>> {
    // An unsynced cache would read as a deleted template
    templates
        .wait_until_ready()
        .await
        .map_err(|e| HubError::Unavailable(format!("template cache: {e}")))?;
    Ok(templates
        .state()
        .into_iter()
        .find(|t| t.spec.addon_name == addon)
        .map(|t| t.as_ref().clone()))
}

#[async_trait]
impl HubClient for KubeHubClient {
    async fn get_template(&self, addon: &str) -> HubResult<Option<AddOnTemplate>> {
        cached_template(&self.templates, addon).await
    }

    async fn get_csr(&self, name: &str) -> HubResult<Option<CertificateSigningRequest>> {
        Ok(self.csrs().get_opt(name).await?)
    }

    async fn list_csrs(&self, selector: &str) -> HubResult<Vec<CertificateSigningRequest>> {
        Ok(self
            .csrs()
            .list(&ListParams::default().labels(selector))
            .await?
            .items)
    }

    async fn create_csr(
        &self,
        csr: &CertificateSigningRequest,
    ) -> HubResult<CertificateSigningRequest> {
        match self.csrs().create(&PostParams::default(), csr).await {
            Ok(created) => Ok(created),
            Err(kube::Error::Api(ae)) if ae.code == 409 => Err(HubError::AlreadyExists {
                kind: "CertificateSigningRequest",
                name: csr.name_any(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete_csr(&self, name: &str) -> HubResult<()> {
        ignore_not_found(self.csrs().delete(name, &DeleteParams::default()).await)
    }

    async fn decide_csr(
        &self,
        name: &str,
        condition: &CertificateSigningRequestCondition,
    ) -> HubResult<()> {
        let patch = json!({ "status": { "conditions": [condition] } });
        self.csrs()
            .patch_approval(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> HubResult<Option<Secret>> {
        Ok(self.secrets(namespace).get_opt(name).await?)
    }

    async fn apply_secret(&self, secret: &Secret) -> HubResult<()> {
        let namespace = secret.namespace().unwrap_or_default();
        let mut secret = secret.clone();
        secret.metadata.managed_fields = None;
        self.secrets(&namespace)
            .patch(
                &secret.name_any(),
                &PatchParams::apply(FIELD_MANAGER).force(),
                &Patch::Apply(&secret),
            )
            .await?;
        Ok(())
    }

    async fn delete_secret(&self, namespace: &str, name: &str) -> HubResult<()> {
        ignore_not_found(
            self.secrets(namespace)
                .delete(name, &DeleteParams::default())
                .await,
        )
    }

    async fn list_secrets(&self, namespace: &str, selector: &str) -> HubResult<Vec<Secret>> {
        Ok(self
            .secrets(namespace)
            .list(&ListParams::default().labels(selector))
            .await?
            .items)
    }

    async fn get_agent_secret(
        &self,
        cluster: &str,
        namespace: &str,
        name: &str,
    ) -> HubResult<Option<Secret>> {
        let staged = self.secrets(cluster).get_opt(name).await?;
        Ok(staged
            .filter(|s| {
                s.annotations().get(TARGET_NAMESPACE_ANNOTATION).map(String::as_str)
                    == Some(namespace)
            })
            .map(|mut s| {
                s.metadata.namespace = Some(namespace.to_string());
                s
            }))
    }

    async fn apply_agent_secret(&self, cluster: &str, secret: &Secret) -> HubResult<()> {
        let mut staged = secret.clone();
        staged.annotations_mut().insert(
            TARGET_NAMESPACE_ANNOTATION.to_string(),
            secret.namespace().unwrap_or_default(),
        );
        staged.metadata.namespace = Some(cluster.to_string());
        debug!(cluster, name = staged.name_any(), "staging agent secret");
        self.apply_secret(&staged).await
    }

    async fn delete_agent_secret(
        &self,
        cluster: &str,
        _namespace: &str,
        name: &str,
    ) -> HubResult<()> {
        self.delete_secret(cluster, name).await
    }

    async fn list_agent_secrets(&self, cluster: &str, selector: &str) -> HubResult<Vec<Secret>> {
        Ok(self
            .list_secrets(cluster, selector)
            .await?
            .into_iter()
            .map(|mut s| {
                s.metadata.namespace = s.annotations().get(TARGET_NAMESPACE_ANNOTATION).cloned();
                s
            })
            .collect())
    }

    async fn get_role_binding(
        &self,
        namespace: &str,
        name: &str,
    ) -> HubResult<Option<RoleBinding>> {
        Ok(self.role_bindings(namespace).get_opt(name).await?)
    }

    async fn apply_role_binding(&self, binding: &RoleBinding) -> HubResult<()> {
        let namespace = binding.namespace().unwrap_or_default();
        let mut binding = binding.clone();
        binding.metadata.managed_fields = None;
        self.role_bindings(&namespace)
            .patch(
                &binding.name_any(),
                &PatchParams::apply(FIELD_MANAGER).force(),
                &Patch::Apply(&binding),
            )
            .await?;
        Ok(())
    }

    async fn delete_role_binding(&self, namespace: &str, name: &str) -> HubResult<()> {
        ignore_not_found(
            self.role_bindings(namespace)
                .delete(name, &DeleteParams::default())
                .await,
        )
    }

    async fn list_role_bindings(
        &self,
        namespace: &str,
        selector: &str,
    ) -> HubResult<Vec<RoleBinding>> {
        Ok(self
            .role_bindings(namespace)
            .list(&ListParams::default().labels(selector))
            .await?
            .items)
    }

    async fn hub_endpoint(&self, server: &Server) -> HubResult<Option<HubEndpoint>> {
        match server {
            Server::InferLocal(true) => self.local_endpoint().await,
            Server::InferLocal(false) => Ok(None),
            Server::Custom(options) => self.custom_endpoint(options).await,
        }
    }

    async fn patch_addon_status(
        &self,
        namespace: &str,
        name: &str,
        status: &ManagedClusterAddOnStatus,
    ) -> HubResult<()> {
        let api: Api<ManagedClusterAddOn> = Api::namespaced(self.client.clone(), namespace);
        let patch = json!({ "status": status });
        api.patch_status(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }
}
