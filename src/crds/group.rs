use super::*;

#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[kube(
    group = "kanidm.github.io",
    version = "v1alpha1",
    kind = "Group",
    namespaced,
    status = "IdentityStatus"
)]
#[kube(
    printcolumn = r#"{"name": "Group", "type": "string", "jsonPath": ".spec.name"}"#,
    printcolumn = r#"{"name": "Kanidm", "type": "string", "jsonPath": ".spec.kanidmName"}"#,
    printcolumn = r#"{"name": "Message", "type": "string", "jsonPath": ".status.message"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct GroupSpec {
    pub kanidm_name: String,
    pub name: String,
    #[serde(default)]
    pub members: Vec<String>,
}
