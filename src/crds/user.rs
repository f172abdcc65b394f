use super::*;

#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[kube(
    group = "kanidm.github.io",
    version = "v1alpha1",
    kind = "User",
    namespaced,
    status = "IdentityStatus"
)]
#[kube(
    printcolumn = r#"{"name": "Account", "type": "string", "jsonPath": ".spec.name"}"#,
    printcolumn = r#"{"name": "Kanidm", "type": "string", "jsonPath": ".spec.kanidmName"}"#,
    printcolumn = r#"{"name": "Message", "type": "string", "jsonPath": ".status.message"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct UserSpec {
    pub kanidm_name: String,
    pub name: String,
    pub display_name: String,
    #[serde(default)]
    pub emails: Vec<String>,
}
