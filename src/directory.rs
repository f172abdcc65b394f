//! Session against one Kanidm instance, driven through the `kanidm` CLI.

use std::collections::BTreeMap;

use kube::ResourceExt as _;
use serde::Deserialize;

use crate::Error;
use crate::cli::{CommandOutput, CommandRunner};
use crate::cluster::ClusterApi;
use crate::crds::CREDENTIALS_LABEL;
use crate::helper::{CmdBuilder, slugify};

/// Principal the operator authenticates as for directory changes.
pub const IDM_ADMIN: &str = "idm_admin";

const NOT_FOUND_MARKERS: [&str; 2] = ["No matching entries", "No matching group"];

/// What to do when the named instance does not exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MissingInstance {
    Fail,
    /// build a disconnected client, used when tearing down
    Ignore,
}

/// A directory entry, every attribute holding one or more values.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Entry {
    #[serde(default)]
    pub attrs: BTreeMap<String, Vec<String>>,
}

impl Entry {
    pub fn first(&self, key: &str) -> Option<&str> {
        self.attrs
            .get(key)
            .and_then(|values| values.first())
            .map(String::as_str)
    }

    pub fn values(&self, key: &str) -> &[String] {
        self.attrs.get(key).map(Vec::as_slice).unwrap_or_default()
    }
}

fn not_found(output: &CommandOutput) -> bool {
    NOT_FOUND_MARKERS
        .iter()
        .any(|marker| output.stdout.contains(marker) || output.stderr.contains(marker))
}

/// Parses the `key: value` listing printed by `system oauth2 get`.
///
/// The scope map attribute is printed in a form that is not valid YAML and
/// is dropped; repeated keys accumulate.
pub fn parse_oauth2_listing(output: &str) -> Result<Entry, Error> {
    let mut entry = Entry::default();

    for line in output.lines().map(str::trim) {
        if line.is_empty() || line.starts_with("oauth2_rs_scope_map") {
            continue;
        }

        let pair: BTreeMap<String, serde_yaml::Value> =
            serde_yaml::from_str(line).map_err(|err| {
                Error::temporary(format!("unparsable oauth2 client attribute {line:?}: {err}"))
            })?;

        for (key, value) in pair {
            let value = match value {
                serde_yaml::Value::String(value) => value,
                serde_yaml::Value::Bool(value) => value.to_string(),
                serde_yaml::Value::Number(value) => value.to_string(),
                serde_yaml::Value::Null => continue,
                _ => {
                    return Err(Error::temporary(format!(
                        "unexpected value for oauth2 client attribute {key}"
                    )));
                }
            };
            entry.attrs.entry(key).or_default().push(value);
        }
    }

    Ok(entry)
}

async fn credential_password(
    cluster: &dyn ClusterApi,
    namespace: &str,
    principal: &str,
) -> Result<String, Error> {
    let selector = format!("{CREDENTIALS_LABEL}={}", slugify(principal));
    let secrets = cluster.list_secrets(namespace, &selector).await?;

    let secret = match secrets.as_slice() {
        [secret] => secret,
        [] => {
            return Err(Error::temporary(format!(
                "no secret found for {principal} in namespace {namespace}"
            )));
        }
        _ => {
            return Err(Error::temporary(format!(
                "multiple secrets for {principal} found in namespace {namespace}"
            )));
        }
    };

    let password = secret
        .data
        .as_ref()
        .and_then(|data| data.get("password"))
        .ok_or_else(|| {
            Error::temporary(format!(
                "secret {} for {principal} does not contain a password",
                secret.name_any()
            ))
        })?;

    String::from_utf8(password.0.clone()).map_err(|_| {
        Error::temporary(format!(
            "password of {principal} in secret {} is not valid UTF-8",
            secret.name_any()
        ))
    })
}

pub struct DirectoryClient<'a> {
    cli: &'a dyn CommandRunner,
    instance: String,
    /// `None` when the instance was missing and ignored
    session: Option<Vec<(String, String)>>,
}

impl<'a> DirectoryClient<'a> {
    /// Finds the instance named `kanidm_name`, loads the credential of
    /// `principal` from `namespace` and logs in.
    pub async fn connect(
        cluster: &dyn ClusterApi,
        cli: &'a dyn CommandRunner,
        kanidm_name: &str,
        namespace: &str,
        principal: &str,
        missing: MissingInstance,
    ) -> Result<Self, Error> {
        let instance = cluster
            .list_instances()
            .await?
            .into_iter()
            .find(|instance| instance.name_any() == kanidm_name);

        let Some(instance) = instance else {
            return match missing {
                MissingInstance::Ignore => {
                    tracing::debug!({ kanidm = kanidm_name }, "instance not found, continuing disconnected");
                    Ok(Self {
                        cli,
                        instance: kanidm_name.to_string(),
                        session: None,
                    })
                }
                MissingInstance::Fail => Err(Error::temporary(format!(
                    "no Kanidm instance named {kanidm_name} found for namespace {namespace}"
                ))),
            };
        };

        let password = credential_password(cluster, namespace, principal).await?;
        let session = vec![
            ("KANIDM_URL".to_string(), instance.origin()),
            ("KANIDM_NAME".to_string(), principal.to_string()),
            ("KANIDM_PASSWORD".to_string(), password),
        ];

        let client = Self {
            cli,
            instance: kanidm_name.to_string(),
            session: Some(session),
        };
        client.login().await?;

        Ok(client)
    }

    pub fn is_connected(&self) -> bool {
        self.session.is_some()
    }

    async fn command(&self, args: Vec<String>) -> Result<CommandOutput, Error> {
        let Some(ref env) = self.session else {
            return Err(Error::temporary(format!(
                "not connected to Kanidm instance {}",
                self.instance
            )));
        };

        tracing::trace!({ kanidm = &self.instance, ?args }, "running kanidm cli");
        Ok(self.cli.run(env, args).await?)
    }

    /// Runs `args` and turns a non-zero exit into a transient error.
    async fn checked(&self, what: &str, args: Vec<String>) -> Result<CommandOutput, Error> {
        let output = self.command(args).await?;
        if !output.success() {
            return Err(Error::temporary(format!(
                "failed to {what} ({}), stdout={}, stderr={}",
                output.code,
                output.stdout.trim(),
                output.stderr.trim()
            )));
        }
        Ok(output)
    }

    async fn login(&self) -> Result<(), Error> {
        let cmd = CmdBuilder::default().arg("login").collect();
        self.checked("login to kanidm", cmd).await?;
        tracing::debug!({ kanidm = &self.instance }, "logged in");
        Ok(())
    }

    async fn get_json(&self, what: &str, args: Vec<String>) -> Result<Option<Entry>, Error> {
        let output = self.command(args).await?;
        if not_found(&output) {
            return Ok(None);
        }
        if !output.success() {
            return Err(Error::temporary(format!(
                "failed to get {what} ({}), stdout={}, stderr={}",
                output.code,
                output.stdout.trim(),
                output.stderr.trim()
            )));
        }

        serde_json::from_str(output.stdout.trim())
            .map(Some)
            .map_err(|err| Error::temporary(format!("failed to parse {what} data from kanidm cli: {err}")))
    }

    /// Deletes, treating an already absent entity as deleted.
    async fn delete(&self, what: &str, args: Vec<String>) -> Result<(), Error> {
        let output = self.command(args).await?;
        if output.success() {
            tracing::info!({ kanidm = &self.instance }, "deleted {what}");
            return Ok(());
        }
        if not_found(&output) {
            tracing::debug!({ kanidm = &self.instance }, "{what} already gone");
            return Ok(());
        }

        Err(Error::temporary(format!(
            "failed to delete {what} ({}), stdout={}, stderr={}",
            output.code,
            output.stdout.trim(),
            output.stderr.trim()
        )))
    }

    pub async fn get_person(&self, name: &str) -> Result<Option<Entry>, Error> {
        let cmd = CmdBuilder::default()
            .args(["person", "get", "-o", "json", name])
            .collect();
        self.get_json(&format!("person {name}"), cmd).await
    }

    pub async fn get_group(&self, name: &str) -> Result<Option<Entry>, Error> {
        let cmd = CmdBuilder::default()
            .args(["group", "get", "-o", "json", name])
            .collect();
        self.get_json(&format!("group {name}"), cmd).await
    }

    pub async fn get_oauth2_client(&self, name: &str) -> Result<Option<Entry>, Error> {
        let cmd = CmdBuilder::default()
            .args(["system", "oauth2", "get", name])
            .collect();
        let output = self.command(cmd).await?;
        if not_found(&output) {
            return Ok(None);
        }
        if !output.success() {
            return Err(Error::temporary(format!(
                "failed to get oauth2 client {name} ({}), stderr={}",
                output.code,
                output.stderr.trim()
            )));
        }

        parse_oauth2_listing(&output.stdout).map(Some)
    }

    /// Creates the person, or brings the display name of an existing one in line.
    pub async fn create_person(&self, name: &str, display_name: &str) -> Result<(), Error> {
        let Some(existing) = self.get_person(name).await? else {
            let cmd = CmdBuilder::default()
                .args(["person", "create", name, display_name])
                .collect();
            self.checked(&format!("create person {name}"), cmd).await?;
            tracing::info!({ person = name }, "person created");
            return Ok(());
        };

        if existing.first("displayname") == Some(display_name) {
            tracing::debug!({ person = name }, "person already exists");
            return Ok(());
        }

        let cmd = CmdBuilder::default()
            .args(["person", "update", name, "--displayname", display_name])
            .collect();
        self.checked(&format!("update display name of {name}"), cmd)
            .await?;
        tracing::info!({ person = name, display_name }, "display name updated");

        Ok(())
    }

    /// Replaces every mail address of the person with `emails`.
    pub async fn set_person_emails(&self, name: &str, emails: &[String]) -> Result<(), Error> {
        // `person update` without any `-m` is rejected, the attribute is purged instead
        if emails.is_empty() {
            let cmd = CmdBuilder::default()
                .args(["person", "purge-attr", name, "mail"])
                .collect();
            self.checked(&format!("clear emails of {name}"), cmd).await?;
            tracing::info!({ person = name }, "emails cleared");
            return Ok(());
        }

        let cmd = CmdBuilder::default()
            .args(["person", "update", name])
            .repeated_arg("-m", emails)
            .collect();
        self.checked(&format!("update emails of {name}"), cmd).await?;

        Ok(())
    }

    pub async fn delete_person(&self, name: &str) -> Result<(), Error> {
        let cmd = CmdBuilder::default().args(["person", "delete", name]).collect();
        self.delete(&format!("person {name}"), cmd).await
    }

    pub async fn create_group(&self, name: &str) -> Result<(), Error> {
        if self.get_group(name).await?.is_some() {
            tracing::info!({ group = name }, "group already exists, not creating");
            return Ok(());
        }

        let cmd = CmdBuilder::default().args(["group", "create", name]).collect();
        self.checked(&format!("create group {name}"), cmd).await?;
        tracing::info!({ group = name }, "group created");

        Ok(())
    }

    /// Replaces the membership of the group with exactly `members`.
    pub async fn set_group_members(&self, name: &str, members: &[String]) -> Result<(), Error> {
        let cmd = if members.is_empty() {
            CmdBuilder::default().args(["group", "purge-members", name])
        } else {
            CmdBuilder::default()
                .args(["group", "set-members", name])
                .args(members)
        };
        self.checked(&format!("update members of group {name}"), cmd.collect())
            .await?;

        Ok(())
    }

    pub async fn delete_group(&self, name: &str) -> Result<(), Error> {
        let cmd = CmdBuilder::default().args(["group", "delete", name]).collect();
        self.delete(&format!("group {name}"), cmd).await
    }

    /// Creates the client if it is missing and returns its basic secret.
    pub async fn create_oauth2_client(
        &self,
        name: &str,
        display_name: &str,
        origin: &str,
    ) -> Result<String, Error> {
        if self.get_oauth2_client(name).await?.is_none() {
            let cmd = CmdBuilder::default()
                .args(["system", "oauth2", "create", name, display_name, origin])
                .collect();
            self.checked(&format!("create oauth2 client {name}"), cmd)
                .await?;
            tracing::info!({ client = name }, "oauth2 client created");
        } else {
            tracing::debug!({ client = name }, "oauth2 client already exists");
        }

        let cmd = CmdBuilder::default()
            .args(["system", "oauth2", "show-basic-secret", name])
            .collect();
        let output = self
            .checked(&format!("read the secret of oauth2 client {name}"), cmd)
            .await?;

        let secret = output.stdout.trim();
        if secret.is_empty() {
            return Err(Error::temporary(format!(
                "kanidm returned an empty secret for oauth2 client {name}"
            )));
        }

        Ok(secret.to_string())
    }

    pub async fn prefer_short_username(&self, name: &str) -> Result<(), Error> {
        let cmd = CmdBuilder::default()
            .args(["system", "oauth2", "prefer-short-username", name])
            .collect();
        self.checked(&format!("set prefer-short-username for {name}"), cmd)
            .await?;
        Ok(())
    }

    pub async fn set_pkce(&self, name: &str, enabled: bool) -> Result<(), Error> {
        let subcommand = if enabled {
            "enable-pkce"
        } else {
            "warning-insecure-client-disable-pkce"
        };
        let cmd = CmdBuilder::default()
            .args(["system", "oauth2", subcommand, name])
            .collect();
        self.checked(&format!("{subcommand} for {name}"), cmd).await?;
        Ok(())
    }

    pub async fn set_landing_url(&self, name: &str, url: &str) -> Result<(), Error> {
        let cmd = CmdBuilder::default()
            .args(["system", "oauth2", "set-landing-url", name, url])
            .collect();
        self.checked(&format!("set the landing url of {name}"), cmd)
            .await?;
        Ok(())
    }

    pub async fn update_scope_map(
        &self,
        name: &str,
        group: &str,
        scopes: &[String],
    ) -> Result<(), Error> {
        let cmd = CmdBuilder::default()
            .args(["system", "oauth2", "update-scope-map", name, group])
            .args(scopes)
            .collect();
        self.checked(&format!("update the scope map of {name}"), cmd)
            .await?;
        Ok(())
    }

    /// Sets how multiple values of `claim` are joined, e.g. `array`.
    pub async fn update_claim_map_join(&self, name: &str, claim: &str, join: &str) -> Result<(), Error> {
        let cmd = CmdBuilder::default()
            .args(["system", "oauth2", "update-claim-map-join", name, claim, join])
            .collect();
        self.checked(&format!("set the {claim} claim join of {name} to {join}"), cmd)
            .await?;
        Ok(())
    }

    pub async fn update_claim_map(
        &self,
        name: &str,
        claim: &str,
        group: &str,
        values: &[String],
    ) -> Result<(), Error> {
        let cmd = CmdBuilder::default()
            .args(["system", "oauth2", "update-claim-map", name, claim, group])
            .args(values)
            .collect();
        self.checked(&format!("map {group} to the {claim} claim of {name}"), cmd)
            .await?;
        Ok(())
    }

    pub async fn delete_oauth2_client(&self, name: &str) -> Result<(), Error> {
        let cmd = CmdBuilder::default()
            .args(["system", "oauth2", "delete", name])
            .collect();
        self.delete(&format!("oauth2 client {name}"), cmd).await
    }
}
