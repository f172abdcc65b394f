use std::collections::BTreeMap;

use super::*;

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(default, rename_all = "camelCase")]
pub struct SecretOptions {
    pub annotations: BTreeMap<String, String>,
    pub labels: BTreeMap<String, String>,
}

#[skip_serializing_none]
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[kube(
    group = "kanidm.github.io",
    version = "v1alpha1",
    kind = "OAuth2Client",
    plural = "oauth2-clients",
    namespaced,
    status = "IdentityStatus"
)]
#[kube(
    printcolumn = r#"{"name": "Client", "type": "string", "jsonPath": ".spec.name"}"#,
    printcolumn = r#"{"name": "Origin", "type": "string", "jsonPath": ".spec.origin"}"#,
    printcolumn = r#"{"name": "Message", "type": "string", "jsonPath": ".status.message"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct OAuth2ClientSpec {
    pub kanidm_name: String,
    pub name: String,
    pub display_name: String,
    pub origin: String,
    pub prefer_short_username: Option<bool>,
    /// PKCE stays enforced unless this is explicitly `false`
    pub enable_pkce: Option<bool>,
    pub callback_url: Option<String>,
    /// `{ group, scopes }`, validated at reconciliation time
    #[schemars(schema_with = "preserve_unknown_fields")]
    pub scope_map: Option<serde_json::Value>,
    /// `{ claim, groups: { <group>: <value> } }`, validated at reconciliation time
    #[schemars(schema_with = "preserve_unknown_fields")]
    pub claim_map: Option<serde_json::Value>,
    #[serde(default)]
    pub secret: SecretOptions,
}

impl OAuth2ClientSpec {
    pub fn pkce_enabled(&self) -> bool {
        self.enable_pkce.unwrap_or(true)
    }
}
