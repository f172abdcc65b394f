pub use kube::CustomResource;
pub use schemars::JsonSchema;
pub use serde::{Deserialize, Serialize};
pub use serde_with::skip_serializing_none;

pub mod group;
pub mod kanidm;
pub mod oauth2_client;
pub mod user;

pub use group::Group;
pub use kanidm::Kanidm;
pub use oauth2_client::OAuth2Client;
pub use user::User;

pub const GROUP: &str = "kanidm.github.io";

/// annotation set once the first reconciliation of a resource went through
pub const PROCESSED_ANNOTATION: &str = "kanidm.github.io/processed";

/// label carried by every credential secret, valued with the slugified principal
pub const CREDENTIALS_LABEL: &str = "kanidm.github.io/credentials-for";

pub fn preserve_unknown_fields(
    _gen: &mut schemars::r#gen::SchemaGenerator,
) -> schemars::schema::Schema {
    let mut schema = schemars::schema::SchemaObject::default();
    schema.extensions.insert(
        "x-kubernetes-preserve-unknown-fields".to_string(),
        serde_json::Value::Bool(true),
    );
    schemars::schema::Schema::Object(schema)
}

/// What was last applied to the directory for a user, group or OAuth2 client.
///
/// `name` and `kanidm_name` are only written after a successful reconciliation
/// and are what later updates are compared against.
#[skip_serializing_none]
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct IdentityStatus {
    pub name: Option<String>,
    pub kanidm_name: Option<String>,
    pub message: Option<String>,
}

impl IdentityStatus {
    pub fn applied(name: impl ToString, kanidm_name: impl ToString) -> Self {
        Self {
            name: Some(name.to_string()),
            kanidm_name: Some(kanidm_name.to_string()),
            message: None,
        }
    }
}
