//! In-memory stand-ins for the cluster and the kanidm CLI.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use k8s_openapi::ByteString;
use k8s_openapi::api::core::v1::{Pod, PodStatus, Secret};
use kube::api::{DynamicObject, ObjectMeta};
use kube::core::ErrorResponse;
use kube::discovery::ApiResource;
use kube::{Resource, ResourceExt as _};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};

use crate::cli::{CommandOutput, CommandRunner};
use crate::cluster::ClusterApi;
use crate::crds::group::GroupSpec;
use crate::crds::kanidm::KanidmSpec;
use crate::crds::oauth2_client::OAuth2ClientSpec;
use crate::crds::user::UserSpec;
use crate::crds::*;
use crate::handlers::{Context, OperatorConfig};
use crate::helper::ExecError;

type Key = (String, String, String);

fn api_error(code: u16, reason: &str, message: String) -> kube::Error {
    kube::Error::Api(ErrorResponse {
        status: "Failure".into(),
        message,
        reason: reason.into(),
        code,
    })
}

fn matches_labels(object: &Value, selector: &str) -> bool {
    let labels = &object["metadata"]["labels"];
    selector
        .split(',')
        .filter(|term| !term.is_empty())
        .all(|term| match term.split_once('=') {
            Some((key, value)) => labels[key].as_str() == Some(value),
            None => !labels[term].is_null(),
        })
}

#[derive(Default)]
struct ClusterState {
    objects: BTreeMap<Key, Value>,
    patches: BTreeMap<String, usize>,
    exec_results: VecDeque<Result<String, ExecError>>,
    exec_calls: Vec<Vec<String>>,
    next_uid: u64,
}

/// Object store keyed by kind, namespace and name. Creates conflict with 409,
/// patches are JSON merge patches and exec answers come from a script.
#[derive(Default)]
pub struct FakeCluster {
    state: Mutex<ClusterState>,
}

impl FakeCluster {
    pub fn insert<K>(&self, object: &K)
    where
        K: Resource<DynamicType = ()> + Serialize,
    {
        let key = (
            K::kind(&()).to_string(),
            object.namespace().unwrap_or_default(),
            object.name_any(),
        );
        let value = serde_json::to_value(object).unwrap();
        self.state.lock().unwrap().objects.insert(key, value);
    }

    pub fn get<K>(&self, namespace: &str, name: &str) -> Option<K>
    where
        K: Resource<DynamicType = ()> + DeserializeOwned,
    {
        let key = (K::kind(&()).to_string(), namespace.into(), name.into());
        let state = self.state.lock().unwrap();
        state
            .objects
            .get(&key)
            .map(|value| serde_json::from_value(value.clone()).unwrap())
    }

    pub fn object(&self, kind: &str, namespace: &str, name: &str) -> Option<DynamicObject> {
        let key = (kind.into(), namespace.into(), name.into());
        let state = self.state.lock().unwrap();
        state
            .objects
            .get(&key)
            .map(|value| serde_json::from_value(value.clone()).unwrap())
    }

    pub fn count(&self, kind: &str) -> usize {
        let state = self.state.lock().unwrap();
        state.objects.keys().filter(|(k, _, _)| k == kind).count()
    }

    pub fn patch_count(&self, kind: &str) -> usize {
        let state = self.state.lock().unwrap();
        state.patches.get(kind).copied().unwrap_or_default()
    }

    /// Queues the results of upcoming exec calls, in order.
    pub fn script_exec(&self, results: impl IntoIterator<Item = Result<String, ExecError>>) {
        self.state.lock().unwrap().exec_results.extend(results);
    }

    pub fn exec_calls(&self) -> Vec<Vec<String>> {
        self.state.lock().unwrap().exec_calls.clone()
    }

    fn list<K: DeserializeOwned>(&self, kind: &str, namespace: Option<&str>, labels: &str) -> Vec<K> {
        let state = self.state.lock().unwrap();
        state
            .objects
            .iter()
            .filter(|((k, ns, _), _)| k == kind && namespace.is_none_or(|namespace| ns == namespace))
            .filter(|(_, value)| matches_labels(value, labels))
            .map(|(_, value)| serde_json::from_value(value.clone()).unwrap())
            .collect()
    }

    fn merge(&self, resource: &ApiResource, namespace: &str, name: &str, patch: &Value) -> kube::Result<DynamicObject> {
        let key = (resource.kind.clone(), namespace.into(), name.into());
        let mut state = self.state.lock().unwrap();
        *state.patches.entry(resource.kind.clone()).or_default() += 1;

        let Some(object) = state.objects.get_mut(&key) else {
            return Err(api_error(404, "NotFound", format!("{} {name} not found", resource.kind)));
        };

        let expected = patch["metadata"]["resourceVersion"].as_str();
        let current = object["metadata"]["resourceVersion"].as_str();
        if expected.is_some() && current.is_some() && expected != current {
            return Err(api_error(409, "Conflict", format!("{name} was modified")));
        }

        json_patch::merge(object, patch);
        Ok(serde_json::from_value(object.clone()).unwrap())
    }
}

#[async_trait]
impl ClusterApi for FakeCluster {
    async fn list_instances(&self) -> kube::Result<Vec<Kanidm>> {
        Ok(self.list("Kanidm", None, ""))
    }

    async fn list_secrets(&self, namespace: &str, labels: &str) -> kube::Result<Vec<Secret>> {
        Ok(self.list("Secret", Some(namespace), labels))
    }

    async fn list_pods(&self, namespace: &str, labels: &str) -> kube::Result<Vec<Pod>> {
        Ok(self.list("Pod", Some(namespace), labels))
    }

    async fn exec(
        &self,
        _namespace: &str,
        _pod: &str,
        _container: &str,
        command: Vec<String>,
    ) -> Result<String, ExecError> {
        let mut state = self.state.lock().unwrap();
        state.exec_calls.push(command);
        state
            .exec_results
            .pop_front()
            .unwrap_or_else(|| Err(ExecError::Exit(1, "no scripted exec result".into())))
    }

    async fn create(
        &self,
        resource: &ApiResource,
        namespace: &str,
        object: &DynamicObject,
    ) -> kube::Result<DynamicObject> {
        let name = object.name_any();
        let key = (resource.kind.clone(), namespace.to_string(), name.clone());
        let mut state = self.state.lock().unwrap();
        if state.objects.contains_key(&key) {
            return Err(api_error(409, "AlreadyExists", format!("{} {name} already exists", resource.kind)));
        }

        state.next_uid += 1;
        let mut stored = object.clone();
        stored.metadata.namespace = Some(namespace.to_string());
        stored.metadata.uid = Some(format!("uid-{}", state.next_uid));
        stored.metadata.resource_version = Some("1".into());
        state.objects.insert(key, serde_json::to_value(&stored).unwrap());
        Ok(stored)
    }

    async fn patch(
        &self,
        resource: &ApiResource,
        namespace: &str,
        name: &str,
        patch: &Value,
    ) -> kube::Result<DynamicObject> {
        self.merge(resource, namespace, name, patch)
    }

    async fn patch_status(
        &self,
        resource: &ApiResource,
        namespace: &str,
        name: &str,
        patch: &Value,
    ) -> kube::Result<DynamicObject> {
        self.merge(resource, namespace, name, patch)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FakeOAuth2Client {
    pub display_name: String,
    pub origin: String,
    pub secret: String,
    pub prefer_short_username: bool,
    pub pkce: bool,
    pub landing_url: Option<String>,
    pub scope_maps: BTreeMap<String, Vec<String>>,
    pub claim_joins: BTreeMap<String, String>,
    pub claim_maps: BTreeMap<(String, String), Vec<String>>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FakePerson {
    pub display_name: String,
    pub emails: Vec<String>,
}

#[derive(Default)]
struct Directory {
    password: Option<String>,
    persons: BTreeMap<String, FakePerson>,
    groups: BTreeMap<String, Vec<String>>,
    clients: BTreeMap<String, FakeOAuth2Client>,
    failing: Vec<Vec<String>>,
    calls: Vec<Vec<String>>,
}

fn ok(stdout: impl Into<String>) -> CommandOutput {
    CommandOutput {
        code: 0,
        stdout: stdout.into(),
        stderr: String::new(),
    }
}

fn fail(stderr: impl Into<String>) -> CommandOutput {
    CommandOutput {
        code: 1,
        stdout: String::new(),
        stderr: stderr.into(),
    }
}

/// A directory that answers the kanidm CLI's subcommands from memory.
#[derive(Default)]
pub struct FakeKanidm {
    state: Mutex<Directory>,
}

impl FakeKanidm {
    /// Only logins with `password` succeed.
    pub fn with_password(password: &str) -> Self {
        let kanidm = Self::default();
        kanidm.state.lock().unwrap().password = Some(password.into());
        kanidm
    }

    /// Commands starting with `prefix` exit non-zero.
    pub fn fail_on(&self, prefix: &[&str]) {
        let prefix = prefix.iter().map(|arg| arg.to_string()).collect();
        self.state.lock().unwrap().failing.push(prefix);
    }

    pub fn insert_person(&self, name: &str, display_name: &str) {
        let person = FakePerson {
            display_name: display_name.into(),
            emails: Vec::new(),
        };
        self.state.lock().unwrap().persons.insert(name.into(), person);
    }

    pub fn insert_group(&self, name: &str, members: &[&str]) {
        let members = members.iter().map(|member| member.to_string()).collect();
        self.state.lock().unwrap().groups.insert(name.into(), members);
    }

    pub fn person(&self, name: &str) -> Option<FakePerson> {
        self.state.lock().unwrap().persons.get(name).cloned()
    }

    pub fn group(&self, name: &str) -> Option<Vec<String>> {
        self.state.lock().unwrap().groups.get(name).cloned()
    }

    pub fn client(&self, name: &str) -> Option<FakeOAuth2Client> {
        self.state.lock().unwrap().clients.get(name).cloned()
    }

    pub fn calls(&self) -> Vec<Vec<String>> {
        self.state.lock().unwrap().calls.clone()
    }

    /// Calls whose first arguments are `prefix`.
    pub fn calls_to(&self, prefix: &[&str]) -> usize {
        self.calls()
            .iter()
            .filter(|call| call.len() >= prefix.len() && call.iter().zip(prefix).all(|(a, b)| a == b))
            .count()
    }
}

fn entry_json(attrs: Value) -> String {
    json!({ "attrs": attrs }).to_string()
}

fn oauth2_listing(name: &str, client: &FakeOAuth2Client) -> String {
    let mut out = format!(
        "class: oauth2_resource_server\nclass: object\noauth2_rs_name: {name}\ndisplayname: {}\noauth2_rs_origin: {}\n",
        client.display_name, client.origin
    );
    for (group, scopes) in &client.scope_maps {
        // the CLI prints this attribute in a form no YAML parser accepts
        out.push_str(&format!("oauth2_rs_scope_map: {group}: {{\"{}\"}}\n", scopes.join("\", \"")));
    }
    if client.prefer_short_username {
        out.push_str("oauth2_prefer_short_username: true\n");
    }
    out
}

impl Directory {
    fn dispatch(&mut self, env: &[(String, String)], args: &[&str]) -> CommandOutput {
        match args {
            ["login"] => {
                let given = env
                    .iter()
                    .find(|(key, _)| key == "KANIDM_PASSWORD")
                    .map(|(_, value)| value.as_str());
                match &self.password {
                    Some(expected) if given != Some(expected.as_str()) => fail("authentication failed"),
                    _ => ok("Login Success for idm_admin"),
                }
            }

            ["person", "get", "-o", "json", name] => match self.persons.get(*name) {
                Some(person) => ok(entry_json(json!({
                    "name": [name],
                    "displayname": [person.display_name],
                    "mail": person.emails,
                }))),
                None => ok("No matching entries"),
            },
            ["person", "create", name, display_name] => {
                if self.persons.contains_key(*name) {
                    return fail("duplicate entry");
                }
                let person = FakePerson {
                    display_name: display_name.to_string(),
                    emails: Vec::new(),
                };
                self.persons.insert(name.to_string(), person);
                ok("Successfully created person")
            }
            ["person", "update", name, rest @ ..] => {
                let Some(person) = self.persons.get_mut(*name) else {
                    return fail("No matching entries");
                };
                let mut emails = Vec::new();
                for pair in rest.chunks(2) {
                    match pair {
                        ["--displayname", value] => person.display_name = value.to_string(),
                        ["-m", value] => emails.push(value.to_string()),
                        _ => return fail(format!("unexpected arguments {pair:?}")),
                    }
                }
                if !emails.is_empty() {
                    person.emails = emails;
                }
                ok("Success")
            }
            ["person", "purge-attr", name, "mail"] => match self.persons.get_mut(*name) {
                Some(person) => {
                    person.emails.clear();
                    ok("Success")
                }
                None => fail("No matching entries"),
            },
            ["person", "delete", name] => match self.persons.remove(*name) {
                Some(_) => ok("Success"),
                None => fail("No matching entries"),
            },

            ["group", "get", "-o", "json", name] => match self.groups.get(*name) {
                Some(members) => ok(entry_json(json!({ "name": [name], "member": members }))),
                None => ok("No matching group"),
            },
            ["group", "create", name] => {
                if self.groups.contains_key(*name) {
                    return fail("duplicate entry");
                }
                self.groups.insert(name.to_string(), Vec::new());
                ok("Successfully created group")
            }
            ["group", "set-members", name, members @ ..] => match self.groups.get_mut(*name) {
                Some(group) => {
                    *group = members.iter().map(|member| member.to_string()).collect();
                    ok("Success")
                }
                None => fail("No matching group"),
            },
            ["group", "purge-members", name] => match self.groups.get_mut(*name) {
                Some(group) => {
                    group.clear();
                    ok("Success")
                }
                None => fail("No matching group"),
            },
            ["group", "delete", name] => match self.groups.remove(*name) {
                Some(_) => ok("Success"),
                None => fail("No matching group"),
            },

            ["system", "oauth2", "get", name] => match self.clients.get(*name) {
                Some(client) => ok(oauth2_listing(name, client)),
                None => ok("No matching entries"),
            },
            ["system", "oauth2", "create", name, display_name, origin] => {
                if self.clients.contains_key(*name) {
                    return fail("duplicate entry");
                }
                let client = FakeOAuth2Client {
                    display_name: display_name.to_string(),
                    origin: origin.to_string(),
                    secret: format!("secret-for-{name}"),
                    pkce: true,
                    ..Default::default()
                };
                self.clients.insert(name.to_string(), client);
                ok("Success")
            }
            ["system", "oauth2", "show-basic-secret", name] => match self.clients.get(*name) {
                Some(client) => ok(format!("{}\n", client.secret)),
                None => fail("No matching entries"),
            },
            ["system", "oauth2", "delete", name] => match self.clients.remove(*name) {
                Some(_) => ok("Success"),
                None => fail("No matching entries"),
            },
            ["system", "oauth2", command, name, rest @ ..] => {
                let groups = &self.groups;
                let Some(client) = self.clients.get_mut(*name) else {
                    return fail("No matching entries");
                };
                match (*command, rest) {
                    ("prefer-short-username", []) => client.prefer_short_username = true,
                    ("enable-pkce", []) => client.pkce = true,
                    ("warning-insecure-client-disable-pkce", []) => client.pkce = false,
                    ("set-landing-url", [url]) => client.landing_url = Some(url.to_string()),
                    ("update-scope-map", [group, scopes @ ..]) => {
                        if !groups.contains_key(*group) {
                            return fail("No matching group");
                        }
                        let scopes = scopes.iter().map(|scope| scope.to_string()).collect();
                        client.scope_maps.insert(group.to_string(), scopes);
                    }
                    ("update-claim-map-join", [claim, join]) => {
                        client.claim_joins.insert(claim.to_string(), join.to_string());
                    }
                    ("update-claim-map", [claim, group, values @ ..]) => {
                        let values = values.iter().map(|value| value.to_string()).collect();
                        client
                            .claim_maps
                            .insert((claim.to_string(), group.to_string()), values);
                    }
                    _ => return fail(format!("unknown oauth2 command {command}")),
                }
                ok("Success")
            }

            _ => CommandOutput {
                code: 2,
                stdout: String::new(),
                stderr: format!("unrecognized arguments {args:?}"),
            },
        }
    }
}

#[async_trait]
impl CommandRunner for FakeKanidm {
    async fn run(
        &self,
        env: &[(String, String)],
        args: Vec<String>,
    ) -> std::io::Result<CommandOutput> {
        let mut directory = self.state.lock().unwrap();
        directory.calls.push(args.clone());

        let failing = directory
            .failing
            .iter()
            .any(|prefix| args.len() >= prefix.len() && args.iter().zip(prefix).all(|(a, b)| a == b));
        if failing {
            return Ok(fail("internal error"));
        }

        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        Ok(directory.dispatch(env, &args))
    }
}

pub fn kanidm_fixture(name: &str, namespace: &str) -> Kanidm {
    let spec: KanidmSpec = serde_json::from_value(json!({
        "domain": "idm.example.com",
        "version": "1.4.0",
        "certificate": { "issuer": "letsencrypt" },
        "backup": {},
        "database": {},
    }))
    .unwrap();

    let mut kanidm = Kanidm::new(name, spec);
    kanidm.metadata.namespace = Some(namespace.into());
    kanidm.metadata.uid = Some(format!("uid-{name}"));
    kanidm.metadata.resource_version = Some("1".into());
    kanidm
}

fn identity_meta(name: &str, namespace: &str) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.into()),
        namespace: Some(namespace.into()),
        uid: Some(format!("uid-{name}")),
        resource_version: Some("1".into()),
        ..Default::default()
    }
}

pub fn user_fixture(name: &str, display_name: &str, emails: &[&str]) -> User {
    let spec = UserSpec {
        kanidm_name: "kanidm-instance".into(),
        name: name.into(),
        display_name: display_name.into(),
        emails: emails.iter().map(|email| email.to_string()).collect(),
    };
    let mut user = User::new(name, spec);
    user.metadata = identity_meta(name, "kanidm");
    user
}

pub fn group_fixture(name: &str, members: &[&str]) -> Group {
    let spec = GroupSpec {
        kanidm_name: "kanidm-instance".into(),
        name: name.into(),
        members: members.iter().map(|member| member.to_string()).collect(),
    };
    let mut group = Group::new(name, spec);
    group.metadata = identity_meta(name, "kanidm");
    group
}

pub fn oauth2_fixture(name: &str, extra: Value) -> OAuth2Client {
    let mut spec = json!({
        "kanidmName": "kanidm-instance",
        "name": name,
        "displayName": "Grafana",
        "origin": "https://grafana.example.com",
    });
    json_patch::merge(&mut spec, &extra);
    let spec: OAuth2ClientSpec = serde_json::from_value(spec).unwrap();

    let mut client = OAuth2Client::new(name, spec);
    client.metadata = identity_meta(name, "kanidm");
    client
}

pub fn credential_secret(name: &str, namespace: &str, principal: &str, password: Option<&str>) -> Secret {
    let labels = BTreeMap::from([(CREDENTIALS_LABEL.to_string(), principal.to_string())]);
    let mut data = BTreeMap::from([("username".to_string(), ByteString(principal.as_bytes().to_vec()))]);
    if let Some(password) = password {
        data.insert("password".into(), ByteString(password.as_bytes().to_vec()));
    }

    Secret {
        metadata: ObjectMeta {
            name: Some(name.into()),
            namespace: Some(namespace.into()),
            labels: Some(labels),
            ..Default::default()
        },
        data: Some(data),
        ..Default::default()
    }
}

pub fn pod_fixture(instance: &str, namespace: &str, phase: &str) -> Pod {
    let labels = BTreeMap::from([
        ("app.kubernetes.io/name".to_string(), "kanidm".to_string()),
        ("app.kubernetes.io/instance".to_string(), instance.to_string()),
    ]);

    Pod {
        metadata: ObjectMeta {
            name: Some(format!("{instance}-7d9f8")),
            namespace: Some(namespace.into()),
            labels: Some(labels),
            ..Default::default()
        },
        status: Some(PodStatus {
            phase: Some(phase.into()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// A cluster holding `kanidm-instance` in namespace `kanidm` with an
/// `idm_admin` credential secret, and a directory accepting that credential.
pub fn connected_fakes() -> (FakeCluster, FakeKanidm) {
    let cluster = FakeCluster::default();
    cluster.insert(&kanidm_fixture("kanidm-instance", "kanidm"));
    cluster.insert(&credential_secret(
        "kanidm-instance-idm-admin-credentials",
        "kanidm",
        "idm-admin",
        Some("s3cret"),
    ));
    (cluster, FakeKanidm::with_password("s3cret"))
}

pub fn context(cluster: &Arc<FakeCluster>, kanidm: &Arc<FakeKanidm>) -> Arc<Context> {
    Arc::new(Context {
        cluster: cluster.clone(),
        cli: kanidm.clone(),
        config: OperatorConfig::default(),
    })
}
