use crate::api::addon_template::AddOnTemplate;
use crate::api::managed_cluster_addon::ManagedClusterAddOn;
use crate::controllers::controller::Context;
use crate::controllers::hub::KubeHubClient;
use crate::metrics::Diagnostics;
use crate::registration::approval::StrategyPolicy;
use crate::registration::{ADDON_NAME_LABEL, CLUSTER_NAME_LABEL};
use crate::{Error, Metrics, Result};
use futures::StreamExt;
use k8s_openapi::api::certificates::v1::CertificateSigningRequest;
use kube::{
    api::{Api, ListParams, ResourceExt},
    client::Client,
    runtime::controller::{Action, Controller},
    runtime::reflector::{ObjectRef, Store},
    runtime::watcher::Config,
    runtime::{reflector, watcher, WatchStreamExt},
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::*;

fn error_policy(addon: Arc<ManagedClusterAddOn>, error: &Error, ctx: Arc<Context>) -> Action {
    warn!("reconcile failed: {:?}", error);
    ctx.metrics.reconcile_failure(&addon, error);
    Action::requeue(Duration::from_secs(60))
}

/// Owning addon of a registration CSR, from its labels
fn csr_owner(csr: CertificateSigningRequest) -> Option<ObjectRef<ManagedClusterAddOn>> {
    let labels = csr.labels();
    let cluster = labels.get(CLUSTER_NAME_LABEL)?;
    let addon = labels.get(ADDON_NAME_LABEL)?;
    Some(ObjectRef::new(addon).within(cluster))
}

/// State shared between the controller and the web server
#[derive(Clone, Default)]
pub struct State {
    /// Diagnostics populated by the reconciler
    diagnostics: Arc<RwLock<Diagnostics>>,
    /// Metrics registry
    registry: prometheus::Registry,
}

/// State wrapper around the controller outputs for the web server
impl State {
    pub fn new() -> Self {
        Self::default()
    }

    /// Metrics getter
    pub fn metrics(&self) -> Vec<prometheus::proto::MetricFamily> {
        self.registry.gather()
    }

    /// State getter
    pub async fn diagnostics(&self) -> Diagnostics {
        self.diagnostics.read().await.clone()
    }

    // Create a Controller Context that can update State
    pub fn to_context(
        &self,
        client: Client,
        templates: Store<AddOnTemplate>,
    ) -> Result<Arc<Context>> {
        Ok(Arc::new(Context {
            hub: Arc::new(KubeHubClient::new(client.clone(), templates)),
            policy: Arc::new(StrategyPolicy),
            client,
            metrics: Metrics::new()?.register(&self.registry)?,
            diagnostics: self.diagnostics.clone(),
        }))
    }
}

/// Initialize the addon registration controller (given the CRDs are installed)
pub async fn run_addon_registration_controller(state: State) -> Result<()> {
    let client = Client::try_default().await?;

    let addons = Api::<ManagedClusterAddOn>::all(client.clone());
    if let Err(e) = addons.list(&ListParams::default().limit(1)).await {
        error!("ManagedClusterAddOns are not queryable; {e:?}. Is the CRD installed?");
        return Err(e.into());
    }

    let controller = Controller::new(addons, Config::default().any_semantic());
    let store = controller.store();

    // Templates are read from this cache instead of listed on every reconcile
    let (templates, writer) = reflector::store();
    let template_reflector = reflector(
        writer,
        watcher(Api::<AddOnTemplate>::all(client.clone()), Config::default()),
    )
    .touched_objects()
    .default_backoff();

    controller
        .watches(
            Api::<CertificateSigningRequest>::all(client.clone()),
            Config::default().labels(ADDON_NAME_LABEL),
            csr_owner,
        )
        .watches_stream(template_reflector, move |template: AddOnTemplate| {
            store
                .state()
                .into_iter()
                .filter(|addon| addon.name_any() == template.spec.addon_name)
                .map(|addon| ObjectRef::from_obj(addon.as_ref()))
                .collect::<Vec<_>>()
        })
        .shutdown_on_signal()
        .run(
            ManagedClusterAddOn::reconcile,
            error_policy,
            state.to_context(client, templates)?,
        )
        .for_each(|_| futures::future::ready(()))
        .await;

    Ok(())
}
