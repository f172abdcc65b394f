use std::collections::BTreeMap;

use super::*;

fn default_web_port() -> u16 {
    8443
}

fn default_ldap_port() -> u16 {
    3890
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_fs_type() -> String {
    "other".to_string()
}

fn default_arc_size() -> u32 {
    2048
}

fn default_backup_schedule() -> String {
    "00 22 * * *".to_string()
}

fn default_backup_versions() -> u32 {
    7
}

fn default_storage_size() -> String {
    "1Gi".to_string()
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CertificateOptions {
    /// name of the cert-manager ClusterIssuer signing the instance certificate
    pub issuer: String,
}

#[skip_serializing_none]
#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BackupOptions {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_backup_schedule")]
    pub schedule: String,
    #[serde(default = "default_backup_versions")]
    pub versions: u32,
    pub storage_class: Option<String>,
    #[serde(default = "default_storage_size")]
    pub storage_size: String,
    #[serde(default)]
    pub storage_annotations: BTreeMap<String, String>,
}

#[skip_serializing_none]
#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseOptions {
    pub storage_class: Option<String>,
    #[serde(default = "default_storage_size")]
    pub storage_size: String,
    #[serde(default)]
    pub storage_annotations: BTreeMap<String, String>,
    #[serde(default = "default_fs_type")]
    pub fs_type: String,
    #[serde(default = "default_arc_size")]
    pub arc_size: u32,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(default, rename_all = "camelCase")]
pub struct HighAvailabilityOptions {
    pub enabled: bool,
    pub replicas: u32,
}

#[skip_serializing_none]
#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(default, rename_all = "camelCase")]
pub struct IngressOptions {
    pub enabled: bool,
    pub class_name: Option<String>,
    pub annotations: BTreeMap<String, String>,
    pub trust_x_forwarded_for: bool,
}

#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[kube(
    group = "kanidm.github.io",
    version = "v1alpha1",
    kind = "Kanidm",
    namespaced,
    status = "KanidmStatus"
)]
#[kube(
    printcolumn = r#"{"name": "Domain", "type": "string", "jsonPath": ".spec.domain"}"#,
    printcolumn = r#"{"name": "Step", "type": "string", "jsonPath": ".status.step"}"#,
    printcolumn = r#"{"name": "Message", "type": "string", "jsonPath": ".status.message"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct KanidmSpec {
    pub domain: String,
    pub version: String,
    pub certificate: CertificateOptions,
    pub backup: BackupOptions,
    pub database: DatabaseOptions,
    #[serde(default = "default_web_port")]
    pub web_port: u16,
    #[serde(default = "default_ldap_port")]
    pub ldap_port: u16,
    #[serde(default)]
    pub high_availability: HighAvailabilityOptions,
    #[serde(default)]
    pub ingress: IngressOptions,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// Bootstrap progress of an instance, in the order the steps run.
#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
pub enum BootstrapStep {
    RenderInfra,
    WaitPodCreated,
    WaitPodRunning,
    RecoverAdminPassword,
    RecoverIdmAdminPassword,
    PersistSecrets,
    Done,
}

#[skip_serializing_none]
#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct KanidmStatus {
    pub step: Option<BootstrapStep>,
    pub message: Option<String>,
}

impl Kanidm {
    pub fn origin(&self) -> String {
        format!("https://{}", self.spec.domain)
    }

    pub fn image(&self) -> String {
        format!("kanidm/server:{}", self.spec.version)
    }
}
