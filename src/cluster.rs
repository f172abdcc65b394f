use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Pod, Secret};
use kube::api::{Api, DynamicObject, ListParams, Patch, PatchParams, PostParams};
use kube::discovery::ApiResource;
use kube::Client;
use serde_json::Value;

use crate::crds::Kanidm;
use crate::helper::{ExecError, ExecuteExt};

/// Every call the operator makes against the Kubernetes API.
///
/// Implemented for [`kube::Client`]; tests use an in-memory fake.
#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// All Kanidm instances, across namespaces.
    async fn list_instances(&self) -> kube::Result<Vec<Kanidm>>;

    async fn list_secrets(&self, namespace: &str, labels: &str) -> kube::Result<Vec<Secret>>;

    async fn list_pods(&self, namespace: &str, labels: &str) -> kube::Result<Vec<Pod>>;

    /// Runs `command` in `container` of `pod` and returns its stdout.
    async fn exec(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        command: Vec<String>,
    ) -> Result<String, ExecError>;

    async fn create(
        &self,
        resource: &ApiResource,
        namespace: &str,
        object: &DynamicObject,
    ) -> kube::Result<DynamicObject>;

    /// JSON merge patch of the main resource.
    async fn patch(
        &self,
        resource: &ApiResource,
        namespace: &str,
        name: &str,
        patch: &Value,
    ) -> kube::Result<DynamicObject>;

    /// JSON merge patch of the status subresource.
    async fn patch_status(
        &self,
        resource: &ApiResource,
        namespace: &str,
        name: &str,
        patch: &Value,
    ) -> kube::Result<DynamicObject>;
}

fn dynamic_api(client: &Client, resource: &ApiResource, namespace: &str) -> Api<DynamicObject> {
    Api::namespaced_with(client.clone(), namespace, resource)
}

#[async_trait]
impl ClusterApi for Client {
    async fn list_instances(&self) -> kube::Result<Vec<Kanidm>> {
        let api = Api::<Kanidm>::all(self.clone());
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn list_secrets(&self, namespace: &str, labels: &str) -> kube::Result<Vec<Secret>> {
        let api = Api::<Secret>::namespaced(self.clone(), namespace);
        let list_params = ListParams::default().labels(labels);
        Ok(api.list(&list_params).await?.items)
    }

    async fn list_pods(&self, namespace: &str, labels: &str) -> kube::Result<Vec<Pod>> {
        let api = Api::<Pod>::namespaced(self.clone(), namespace);
        let list_params = ListParams::default().labels(labels);
        Ok(api.list(&list_params).await?.items)
    }

    async fn exec(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        command: Vec<String>,
    ) -> Result<String, ExecError> {
        let api = Api::<Pod>::namespaced(self.clone(), namespace);
        api.exec_with_output(pod, container, command).await
    }

    async fn create(
        &self,
        resource: &ApiResource,
        namespace: &str,
        object: &DynamicObject,
    ) -> kube::Result<DynamicObject> {
        dynamic_api(self, resource, namespace)
            .create(&PostParams::default(), object)
            .await
    }

    async fn patch(
        &self,
        resource: &ApiResource,
        namespace: &str,
        name: &str,
        patch: &Value,
    ) -> kube::Result<DynamicObject> {
        dynamic_api(self, resource, namespace)
            .patch(name, &PatchParams::default(), &Patch::Merge(patch))
            .await
    }

    async fn patch_status(
        &self,
        resource: &ApiResource,
        namespace: &str,
        name: &str,
        patch: &Value,
    ) -> kube::Result<DynamicObject> {
        dynamic_api(self, resource, namespace)
            .patch_status(name, &PatchParams::default(), &Patch::Merge(patch))
            .await
    }
}
