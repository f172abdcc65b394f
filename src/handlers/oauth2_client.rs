use std::collections::BTreeMap;

use crate::deployer::Deployer;

use super::*;

/// How the client joins multiple values of a mapped claim.
const CLAIM_JOIN: &str = "array";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScopeMap {
    pub group: String,
    pub scopes: Vec<String>,
}

impl ScopeMap {
    pub fn parse(value: &Value) -> Result<Self, Error> {
        let group = value
            .get("group")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::permanent("scopeMap must contain a group entry"))?;

        let scopes = value
            .get("scopes")
            .and_then(Value::as_array)
            .filter(|scopes| !scopes.is_empty())
            .ok_or_else(|| {
                Error::permanent("scopeMap must contain a scopes entry which is a non-empty list")
            })?
            .iter()
            .map(|scope| {
                scope
                    .as_str()
                    .map(str::to_string)
                    .ok_or_else(|| Error::permanent(format!("scope {scope} is not a string")))
            })
            .collect::<Result<_, _>>()?;

        Ok(Self {
            group: group.to_string(),
            scopes,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimMap {
    pub claim: String,
    /// group name to the claim value its members receive
    pub groups: BTreeMap<String, String>,
}

impl ClaimMap {
    pub fn parse(value: &Value) -> Result<Self, Error> {
        let claim = value
            .get("claim")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::permanent("claimMap must contain a claim entry"))?;

        let groups = value
            .get("groups")
            .and_then(Value::as_object)
            .ok_or_else(|| Error::permanent("claimMap must contain a groups entry which is a map"))?
            .iter()
            .map(|(group, claim_value)| match claim_value.as_str() {
                Some(claim_value) => Ok((group.clone(), claim_value.to_string())),
                None => Err(Error::permanent(format!(
                    "claim value for group {group} is not a string"
                ))),
            })
            .collect::<Result<_, _>>()?;

        Ok(Self {
            claim: claim.to_string(),
            groups,
        })
    }
}

async fn require_group(directory: &DirectoryClient<'_>, group: &str) -> Result<(), Error> {
    match directory.get_group(group).await? {
        Some(_) => Ok(()),
        None => Err(Error::temporary(format!("group {group} does not exist"))),
    }
}

impl OAuth2Client {
    async fn persist_secret(&self, ctx: &Context, secret: &str) -> Result<(), Error> {
        let spec = &self.spec;
        let deployer = Deployer::new(ctx.cluster.as_ref(), self, None)?;
        deployer
            .deploy(
                "oauth2secret.yaml",
                json!({
                    "client_name": spec.name,
                    "client_id": spec.name,
                    "secret": secret,
                    "extra_labels": spec.secret.labels,
                    "extra_annotations": spec.secret.annotations,
                }),
            )
            .await?;
        Ok(())
    }
}

#[async_trait]
impl Reconcile for OAuth2Client {
    const FINALIZER: Option<&'static str> = Some("kanidm.github.io/oauth2-client-finalizer");

    async fn apply(&self, ctx: &Context) -> Result<(), Error> {
        let spec = &self.spec;
        let name = spec.name.as_str();
        check_identity("oauth2 client", self.status.as_ref(), name, &spec.kanidm_name)?;

        let scope_map = spec.scope_map.as_ref().map(ScopeMap::parse).transpose()?;
        let claim_map = spec.claim_map.as_ref().map(ClaimMap::parse).transpose()?;

        tracing::info!({ client = name, kanidm = &spec.kanidm_name }, "reconciling oauth2 client");

        let directory = ctx
            .directory(&spec.kanidm_name, &self.namespace_any(), MissingInstance::Fail)
            .await?;
        let secret = directory
            .create_oauth2_client(name, &spec.display_name, &spec.origin)
            .await?;
        self.persist_secret(ctx, &secret).await?;

        // needed by clients matching accounts on the short name, e.g. forgejo
        if spec.prefer_short_username == Some(true) {
            directory.prefer_short_username(name).await?;
        }

        directory.set_pkce(name, spec.pkce_enabled()).await?;

        if let Some(url) = &spec.callback_url {
            directory.set_landing_url(name, url).await?;
        }

        if let Some(scope_map) = scope_map {
            require_group(&directory, &scope_map.group).await?;
            directory
                .update_scope_map(name, &scope_map.group, &scope_map.scopes)
                .await?;
        }

        if let Some(claim_map) = claim_map {
            directory
                .update_claim_map_join(name, &claim_map.claim, CLAIM_JOIN)
                .await?;
            for (group, value) in &claim_map.groups {
                require_group(&directory, group).await?;
                directory
                    .update_claim_map(name, &claim_map.claim, group, std::slice::from_ref(value))
                    .await?;
            }
        }

        record_identity(ctx, self, name, &spec.kanidm_name).await
    }

    async fn cleanup(&self, ctx: &Context) -> Result<(), Error> {
        let (name, kanidm_name) =
            applied_identity(self.status.as_ref(), &self.spec.name, &self.spec.kanidm_name);

        let directory = ctx
            .directory(kanidm_name, &self.namespace_any(), MissingInstance::Ignore)
            .await?;
        if !directory.is_connected() {
            tracing::info!({ client = name, kanidm = kanidm_name }, "instance is gone, nothing to delete");
            return Ok(());
        }

        directory.delete_oauth2_client(name).await
    }
}
