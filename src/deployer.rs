//! Renders the manifest templates under `templates/` and applies them with
//! create-or-patch semantics.

use std::sync::LazyLock;

use base64::{Engine as _, engine::general_purpose::STANDARD};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::DynamicObject;
use kube::discovery::ApiResource;
use kube::{Resource, ResourceExt as _};
use minijinja::{AutoEscape, Environment, ErrorKind, UndefinedBehavior};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::cluster::ClusterApi;
use crate::helper::slugify;

const SOURCES: &[(&str, &str)] = &[
    ("certificate.yaml", include_str!("../templates/certificate.yaml")),
    ("pvc.yaml", include_str!("../templates/pvc.yaml")),
    ("service.yaml", include_str!("../templates/service.yaml")),
    ("server-config.yaml", include_str!("../templates/server-config.yaml")),
    ("deployment.yaml", include_str!("../templates/deployment.yaml")),
    ("ingress.yaml", include_str!("../templates/ingress.yaml")),
    ("usersecret.yaml", include_str!("../templates/usersecret.yaml")),
    ("oauth2secret.yaml", include_str!("../templates/oauth2secret.yaml")),
];

fn b64enc(value: &str) -> String {
    STANDARD.encode(value.as_bytes())
}

fn slugify_filter(value: &str) -> String {
    slugify(value)
}

static TEMPLATES: LazyLock<Environment<'static>> = LazyLock::new(|| {
    let mut env = Environment::new();
    env.set_undefined_behavior(UndefinedBehavior::Strict);
    env.set_auto_escape_callback(|_| AutoEscape::None);
    env.add_filter("b64enc", b64enc);
    env.add_filter("slugify", slugify_filter);

    for &(name, source) in SOURCES {
        if let Err(err) = env.add_template(name, source) {
            tracing::error!({ template = name, err = %err }, "failed to compile template");
        }
    }

    env
});

#[derive(Debug, Error)]
pub enum DeployError {
    #[error("unknown template {0}")]
    UnknownTemplate(String),
    #[error("failed to render {template}: {source}")]
    Render {
        template: String,
        #[source]
        source: minijinja::Error,
    },
    #[error("{template} did not render to a valid manifest: {reason}")]
    Manifest { template: String, reason: String },
    #[error("no handler for manifest kind {api_version}/{kind}")]
    UnknownKind { api_version: String, kind: String },
    #[error("{0} cannot own generated resources, it has no name or uid")]
    MissingOwner(String),
    #[error("failed to apply {kind} {name}: {source}")]
    Apply {
        kind: String,
        name: String,
        #[source]
        source: kube::Error,
    },
}

impl DeployError {
    /// Everything except API failures comes from the templates or the
    /// declared spec and will not change by retrying.
    pub fn is_permanent(&self) -> bool {
        !matches!(self, Self::Apply { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnConflict {
    /// merge-patch the existing object with the rendered one
    Patch,
    /// leave the existing object untouched
    Skip,
}

/// How a manifest kind is submitted to the API server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KindSpec {
    pub kind: &'static str,
    pub group: &'static str,
    pub version: &'static str,
    pub plural: &'static str,
    pub on_conflict: OnConflict,
}

impl KindSpec {
    const fn new(
        kind: &'static str,
        group: &'static str,
        version: &'static str,
        plural: &'static str,
        on_conflict: OnConflict,
    ) -> Self {
        Self {
            kind,
            group,
            version,
            plural,
            on_conflict,
        }
    }

    pub fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.to_string()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }

    pub fn api_resource(&self) -> ApiResource {
        ApiResource {
            group: self.group.to_string(),
            version: self.version.to_string(),
            api_version: self.api_version(),
            kind: self.kind.to_string(),
            plural: self.plural.to_string(),
        }
    }
}

pub const KINDS: &[KindSpec] = &[
    KindSpec::new("Secret", "", "v1", "secrets", OnConflict::Patch),
    KindSpec::new("ConfigMap", "", "v1", "configmaps", OnConflict::Patch),
    KindSpec::new("Service", "", "v1", "services", OnConflict::Patch),
    KindSpec::new("ServiceAccount", "", "v1", "serviceaccounts", OnConflict::Patch),
    // recreating a claim would swap the data volume underneath the instance
    KindSpec::new(
        "PersistentVolumeClaim",
        "",
        "v1",
        "persistentvolumeclaims",
        OnConflict::Skip,
    ),
    KindSpec::new("Deployment", "apps", "v1", "deployments", OnConflict::Patch),
    KindSpec::new("Job", "batch", "v1", "jobs", OnConflict::Patch),
    KindSpec::new("Ingress", "networking.k8s.io", "v1", "ingresses", OnConflict::Patch),
    KindSpec::new("Role", "rbac.authorization.k8s.io", "v1", "roles", OnConflict::Patch),
    KindSpec::new(
        "RoleBinding",
        "rbac.authorization.k8s.io",
        "v1",
        "rolebindings",
        OnConflict::Patch,
    ),
    KindSpec::new("Certificate", "cert-manager.io", "v1", "certificates", OnConflict::Patch),
];

pub fn lookup_kind(api_version: &str, kind: &str) -> Result<&'static KindSpec, DeployError> {
    KINDS
        .iter()
        .find(|spec| spec.kind == kind && spec.api_version() == api_version)
        .ok_or_else(|| DeployError::UnknownKind {
            api_version: api_version.to_string(),
            kind: kind.to_string(),
        })
}

pub struct Deployer<'a> {
    cluster: &'a dyn ClusterApi,
    namespace: String,
    globals: Map<String, Value>,
    owner: OwnerReference,
}

impl<'a> Deployer<'a> {
    /// Deployer whose resources are owned by `owner` and land in its namespace.
    ///
    /// `name`, `namespace` and `version` are available to every template and
    /// can be overridden per deploy.
    pub fn new<K>(
        cluster: &'a dyn ClusterApi,
        owner: &K,
        version: Option<&str>,
    ) -> Result<Self, DeployError>
    where
        K: Resource<DynamicType = ()>,
    {
        let name = owner.name_any();
        let owner_ref = owner
            .controller_owner_ref(&())
            .ok_or_else(|| DeployError::MissingOwner(name.clone()))?;
        let namespace = owner.namespace().unwrap_or_else(|| "default".to_string());

        let mut globals = Map::new();
        globals.insert("name".into(), name.into());
        globals.insert("namespace".into(), namespace.clone().into());
        globals.insert("version".into(), version.map(Into::into).unwrap_or(Value::Null));

        Ok(Self {
            cluster,
            namespace,
            globals,
            owner: owner_ref,
        })
    }

    pub fn render(&self, template: &str, variables: Value) -> Result<Value, DeployError> {
        let tmpl = TEMPLATES.get_template(template).map_err(|err| match err.kind() {
            ErrorKind::TemplateNotFound => DeployError::UnknownTemplate(template.to_string()),
            _ => DeployError::Render {
                template: template.to_string(),
                source: err,
            },
        })?;

        let mut context = self.globals.clone();
        if let Value::Object(variables) = variables {
            context.extend(variables);
        }

        let rendered = tmpl
            .render(minijinja::Value::from_serialize(&context))
            .map_err(|source| DeployError::Render {
                template: template.to_string(),
                source,
            })?;

        serde_yaml::from_str(&rendered).map_err(|err| DeployError::Manifest {
            template: template.to_string(),
            reason: err.to_string(),
        })
    }

    /// Links `object` to the owner and defaults its namespace.
    fn adopt(&self, object: &mut DynamicObject) {
        let meta = &mut object.metadata;
        if meta.namespace.is_none() {
            meta.namespace = Some(self.namespace.clone());
        }

        let owners = meta.owner_references.get_or_insert_with(Vec::new);
        if !owners.iter().any(|owner| owner.uid == self.owner.uid) {
            owners.push(self.owner.clone());
        }
    }

    /// Renders `template` and creates the result, falling back to the kind's
    /// conflict policy when it already exists.
    ///
    /// Returns `None` when an existing object was left untouched.
    pub async fn deploy(
        &self,
        template: &str,
        variables: Value,
    ) -> Result<Option<DynamicObject>, DeployError> {
        let manifest = self.render(template, variables)?;

        let field = |name: &str| {
            manifest
                .get(name)
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or_else(|| DeployError::Manifest {
                    template: template.to_string(),
                    reason: format!("missing {name}"),
                })
        };
        let spec = lookup_kind(&field("apiVersion")?, &field("kind")?)?;

        let mut object: DynamicObject =
            serde_json::from_value(manifest).map_err(|err| DeployError::Manifest {
                template: template.to_string(),
                reason: err.to_string(),
            })?;
        self.adopt(&mut object);

        let name = object.name_any();
        let namespace = object.namespace().unwrap_or_else(|| self.namespace.clone());
        let resource = spec.api_resource();
        let apply_err = |source| DeployError::Apply {
            kind: spec.kind.to_string(),
            name: name.clone(),
            source,
        };

        match self.cluster.create(&resource, &namespace, &object).await {
            Ok(created) => {
                tracing::debug!({ kind = spec.kind, name = &name, template }, "created resource");
                Ok(Some(created))
            }

            Err(kube::Error::Api(response)) if response.code == 409 => match spec.on_conflict {
                OnConflict::Patch => {
                    tracing::debug!(
                        { kind = spec.kind, name = &name },
                        "resource already exists, patching"
                    );
                    let patch = serde_json::to_value(&object).map_err(|err| {
                        DeployError::Manifest {
                            template: template.to_string(),
                            reason: err.to_string(),
                        }
                    })?;
                    let patched = self
                        .cluster
                        .patch(&resource, &namespace, &name, &patch)
                        .await
                        .map_err(apply_err)?;
                    Ok(Some(patched))
                }

                OnConflict::Skip => {
                    tracing::warn!(
                        { kind = spec.kind, name = &name },
                        "resource already exists, leaving it untouched"
                    );
                    Ok(None)
                }
            },

            Err(source) => Err(apply_err(source)),
        }
    }
}
