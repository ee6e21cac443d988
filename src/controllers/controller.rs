use crate::api::managed_cluster_addon::ManagedClusterAddOn;
use crate::api::registration_config::{AddonRegistrationConfig, RegistrationSettings, CONFIG_NAME};
use crate::controllers::addon::{Orchestrator, RegistrationEvent};
use crate::controllers::hub::HubClient;
use crate::metrics::Diagnostics;
use crate::registration::approval::ApprovalPolicy;
use crate::{telemetry, Error, Metrics};
use chrono::Utc;

use kube::runtime::events::{Event, EventType};
use kube::runtime::finalizer;

use kube::{api::Api, client::Client, runtime::controller::Action, Resource, ResourceExt};

use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{self, debug, instrument};

pub static REGISTRATION_FINALIZER: &str = "addon.open-cluster-management.io/registration-cleanup";

// Context for the reconciler
#[derive(Clone)]
pub struct Context {
    /// Kubernetes client
    pub client: Client,
    /// Hub access for the registration flow
    pub hub: Arc<dyn HubClient>,
    /// Decides on pending CSRs
    pub policy: Arc<dyn ApprovalPolicy>,
    /// Diagnostics read by the web server
    pub diagnostics: Arc<RwLock<Diagnostics>>,
    /// Prom metrics
    pub metrics: Metrics,
}

pub(crate) async fn fetch_config(client: Client) -> kube::Result<RegistrationSettings> {
    Ok(Api::<AddonRegistrationConfig>::all(client)
        .get_opt(CONFIG_NAME)
        .await?
        .unwrap_or_default()
        .settings())
}

impl ManagedClusterAddOn {
    #[instrument(skip_all, fields(trace_id = display(telemetry::get_trace_id()), name = self.name_any(), namespace = self.namespace()), err)]
    pub async fn reconcile(self: Arc<Self>, ctx: Arc<Context>) -> crate::Result<Action> {
        let _timer = ctx.metrics.count_and_measure();
        ctx.diagnostics.write().await.last_event = Utc::now();

        let namespace = self.namespace().unwrap_or_default();
        let api = Api::namespaced(ctx.client.clone(), namespace.as_str());
        debug!("Reconciling");

        finalizer(&api, REGISTRATION_FINALIZER, self, |event| async {
            match event {
                finalizer::Event::Apply(addon) => addon.sync(ctx.clone()).await,
                finalizer::Event::Cleanup(addon) => addon.cleanup(ctx.clone()).await,
            }
        })
        .await
        .map_err(|e| Error::FinalizerError(Box::new(e)))
    }

    async fn sync(&self, ctx: Arc<Context>) -> crate::Result<Action> {
        let settings = fetch_config(ctx.client.clone())
            .await
            .map_err(Error::ConfigFetch)?;

        let outcome = Orchestrator::new(ctx.hub.as_ref(), ctx.policy.as_ref(), &settings)
            .reconcile(self)
            .await?;

        if self.status.as_ref() != Some(&outcome.status) {
            ctx.hub
                .patch_addon_status(
                    &self.namespace().unwrap_or_default(),
                    &self.name_any(),
                    &outcome.status,
                )
                .await?;
        }
        ctx.metrics.set_registrations(self, &outcome.status);

        for event in &outcome.events {
            self.publish(&ctx, event).await?;
        }

        Ok(outcome
            .requeue_after
            .map_or_else(Action::await_change, Action::requeue))
    }

    async fn publish(&self, ctx: &Context, event: &RegistrationEvent) -> crate::Result<()> {
        ctx.diagnostics
            .read()
            .await
            .recorder(ctx.client.clone())
            .publish(
                &Event {
                    type_: if event.warning {
                        EventType::Warning
                    } else {
                        EventType::Normal
                    },
                    reason: event.reason.into(),
                    note: Some(event.note.clone()),
                    action: "Registering".into(),
                    secondary: None,
                },
                &self.object_ref(&()),
            )
            .await?;
        Ok(())
    }

    async fn cleanup(&self, ctx: Arc<Context>) -> crate::Result<Action> {
        ctx.diagnostics
            .read()
            .await
            .recorder(ctx.client.clone())
            .publish(
                &Event {
                    type_: EventType::Normal,
                    reason: "DeleteRequested".into(),
                    note: Some(format!(
                        "Removing registration artifacts of `{}`",
                        self.name_any()
                    )),
                    action: "Deleting".into(),
                    secondary: None,
                },
                &self.object_ref(&()),
            )
            .await?;

        let settings = fetch_config(ctx.client.clone())
            .await
            .map_err(Error::ConfigFetch)?;
        Orchestrator::new(ctx.hub.as_ref(), ctx.policy.as_ref(), &settings)
            .cleanup(&self.namespace().unwrap_or_default(), &self.name_any())
            .await?;
        ctx.metrics.forget(self);

        Ok(Action::await_change())
    }
}
