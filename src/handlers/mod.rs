pub mod group;
pub mod kanidm;
pub mod oauth2_client;
pub mod user;

pub(super) use std::error::Error as StdError;
pub(super) use std::fmt::Debug;
pub(super) use std::sync::Arc;
pub(super) use std::time::Duration;

pub(super) use async_trait::async_trait;
pub(super) use kube::discovery::ApiResource;
pub(super) use kube::runtime::controller::Action;
pub(super) use kube::{Resource, ResourceExt as _};
pub(super) use serde::Serialize;
pub(super) use serde::de::DeserializeOwned;
pub(super) use serde_json::{Value, json};

pub(super) use crate::Error;
pub(super) use crate::cli::CommandRunner;
pub(super) use crate::cluster::ClusterApi;
pub(super) use crate::crds::*;
pub(super) use crate::directory::{DirectoryClient, IDM_ADMIN, MissingInstance};
pub(super) use crate::helper::ResourceExt as _;

#[derive(Debug, Clone)]
pub struct OperatorConfig {
    pub pod_poll_interval: Duration,
    /// `None` waits for the instance pod indefinitely
    pub pod_poll_attempts: Option<u32>,
    pub recovery_backoff: Duration,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            pod_poll_interval: Duration::from_secs(5),
            pod_poll_attempts: None,
            recovery_backoff: Duration::from_secs(2),
        }
    }
}

/// Shared by every controller.
pub struct Context {
    pub cluster: Arc<dyn ClusterApi>,
    pub cli: Arc<dyn CommandRunner>,
    pub config: OperatorConfig,
}

impl Context {
    /// Logs into the instance a user, group or OAuth2 client belongs to.
    pub(super) async fn directory(
        &self,
        kanidm_name: &str,
        namespace: &str,
        missing: MissingInstance,
    ) -> Result<DirectoryClient<'_>, Error> {
        DirectoryClient::connect(
            self.cluster.as_ref(),
            self.cli.as_ref(),
            kanidm_name,
            namespace,
            IDM_ADMIN,
            missing,
        )
        .await
    }
}

#[async_trait]
pub trait Reconcile:
    Resource<DynamicType = ()> + Clone + Debug + DeserializeOwned + Serialize + Send + Sync + 'static
{
    /// Finalizer held while the resource has directory state to clean up.
    const FINALIZER: Option<&'static str>;

    /// Converges external state towards the resource. Runs for creates and updates.
    async fn apply(&self, ctx: &Context) -> Result<(), Error>;

    async fn cleanup(&self, _ctx: &Context) -> Result<(), Error> {
        Ok(())
    }
}

async fn patch_metadata<K: Reconcile>(ctx: &Context, object: &K, metadata: Value) -> Result<(), Error> {
    ctx.cluster
        .patch(
            &ApiResource::erase::<K>(&()),
            &object.namespace_any(),
            &object.name_any(),
            &json!({ "metadata": metadata }),
        )
        .await?;
    Ok(())
}

pub(super) async fn patch_status<K: Reconcile>(ctx: &Context, object: &K, status: Value) -> Result<(), Error> {
    ctx.cluster
        .patch_status(
            &ApiResource::erase::<K>(&()),
            &object.namespace_any(),
            &object.name_any(),
            &json!({ "status": status }),
        )
        .await?;
    Ok(())
}

/// Refuses to act when `name` or `kanidm_name` differ from what was applied last.
pub(super) fn check_identity(
    kind: &str,
    status: Option<&IdentityStatus>,
    name: &str,
    kanidm_name: &str,
) -> Result<(), Error> {
    let Some(status) = status else {
        return Ok(());
    };

    if let Some(applied) = status.name.as_deref().filter(|applied| *applied != name) {
        return Err(Error::permanent(format!(
            "{kind} name cannot be changed (applied {applied}, declared {name})"
        )));
    }

    if let Some(applied) = status.kanidm_name.as_deref().filter(|applied| *applied != kanidm_name) {
        return Err(Error::permanent(format!(
            "{kind} kanidmName cannot be changed (applied {applied}, declared {kanidm_name})"
        )));
    }

    Ok(())
}

/// The identity to clean up: the applied one if any, else the declared one.
pub(super) fn applied_identity<'a>(
    status: Option<&'a IdentityStatus>,
    name: &'a str,
    kanidm_name: &'a str,
) -> (&'a str, &'a str) {
    let applied_name = status.and_then(|status| status.name.as_deref());
    let applied_kanidm = status.and_then(|status| status.kanidm_name.as_deref());
    (applied_name.unwrap_or(name), applied_kanidm.unwrap_or(kanidm_name))
}

pub(super) async fn record_identity<K: Reconcile>(
    ctx: &Context,
    object: &K,
    name: &str,
    kanidm_name: &str,
) -> Result<(), Error> {
    let status = json!({ "name": name, "kanidmName": kanidm_name, "message": null });
    patch_status(ctx, object, status).await
}

pub async fn reconcile<K: Reconcile>(object: Arc<K>, ctx: Arc<Context>) -> Result<Action, Error> {
    let kind = K::kind(&());
    let name = object.name_any();
    let namespace = object.namespace_any();
    let finalizers = object.finalizers();
    let has_finalizer = |finalizer: &str| finalizers.iter().any(|f| f == finalizer);

    if object.meta().deletion_timestamp.is_some() {
        let Some(finalizer) = K::FINALIZER.filter(|finalizer| has_finalizer(finalizer)) else {
            return Ok(Action::await_change());
        };

        tracing::info!({ kind = %kind, name = &name, namespace = &namespace }, "cleaning up");
        object.cleanup(&ctx).await?;

        let remaining: Vec<&String> = finalizers.iter().filter(|f| *f != finalizer).collect();
        let metadata = json!({ "finalizers": remaining, "resourceVersion": object.resource_version() });
        patch_metadata(&ctx, object.as_ref(), metadata).await?;
        return Ok(Action::await_change());
    }

    if let Some(finalizer) = K::FINALIZER.filter(|finalizer| !has_finalizer(finalizer)) {
        tracing::debug!({ kind = %kind, name = &name, finalizer }, "adding finalizer");
        let mut updated = finalizers.to_vec();
        updated.push(finalizer.to_string());
        let metadata = json!({ "finalizers": updated, "resourceVersion": object.resource_version() });
        patch_metadata(&ctx, object.as_ref(), metadata).await?;
        // the patch is observed as a new event
        return Ok(Action::await_change());
    }

    match object.apply(&ctx).await {
        Ok(()) => {
            if object.annotation(PROCESSED_ANNOTATION) != Some("true") {
                let metadata = json!({ "annotations": { PROCESSED_ANNOTATION: "true" } });
                patch_metadata(&ctx, object.as_ref(), metadata).await?;
            }
            Ok(Action::await_change())
        }

        Err(err) if err.retry_after().is_none() => {
            tracing::error!(
                { kind = %kind, name = &name, namespace = &namespace, err = &err as &dyn StdError },
                "reconciliation failed permanently, waiting for a spec change"
            );
            patch_status(&ctx, object.as_ref(), json!({ "message": err.to_string() })).await?;
            Ok(Action::await_change())
        }

        Err(err) => Err(err),
    }
}

pub fn error_policy<K: Reconcile>(object: Arc<K>, err: &Error, _ctx: Arc<Context>) -> Action {
    let delay = err.retry_after().unwrap_or(Error::RETRY_DELAY);
    tracing::warn!(
        { kind = %K::kind(&()), name = %object.name_any(), ?delay, err = err as &dyn StdError },
        "reconciliation failed, requeueing"
    );
    Action::requeue(delay)
}
