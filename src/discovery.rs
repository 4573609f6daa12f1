//! Discovery of the pods scheduled on this node.
//!
//! The collector only needs a thin slice of the cluster API: the pods of
//! one namespace filtered to one node, and for each pod its uid, name,
//! namespace and container statuses. Those fields are deserialized from
//! the API's JSON; everything else is ignored.
//!
//! Credentials come from a kubeconfig file: the cluster server of the
//! current context and, when present, the user's bearer token. TLS server
//! verification is skipped, as the CA bundle in the kubeconfig is not
//! interpreted.

use std::path::Path;

use reqwest::header;
use serde::Deserialize;

use crate::errors::CollectError;

/// One pod as returned by the cluster API, reduced to the fields the
/// collector consumes.
#[derive(Clone, Debug, Deserialize)]
pub struct Pod {
    pub metadata: PodMeta,
    #[serde(default)]
    pub status: PodStatus,
}

/// Identity of a pod.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct PodMeta {
    #[serde(default)]
    pub uid: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub namespace: String,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct PodStatus {
    #[serde(default, rename = "containerStatuses")]
    pub container_statuses: Vec<ContainerStatus>,
}

/// Status of one container in a pod.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct ContainerStatus {
    #[serde(default)]
    pub name: String,
    /// Qualified id in `<runtime>://<hash>` form. Empty until the
    /// container has actually been created by the runtime.
    #[serde(default, rename = "containerID")]
    pub container_id: String,
}

#[derive(Debug, Deserialize)]
struct PodList {
    #[serde(default)]
    items: Vec<Pod>,
}

/// A client for the pod-listing slice of the cluster API.
pub struct ApiClient {
    http: reqwest::Client,
    server: String,
}

impl ApiClient {
    /// Build a client from a kubeconfig file: server of the current
    /// context plus the user's bearer token when one is present.
    pub fn from_kubeconfig(path: &Path) -> Result<ApiClient, CollectError> {
        let raw = std::fs::read_to_string(path).map_err(|err| CollectError::Kubeconfig {
            reason: format!("cannot read {}: {err}", path.display()),
        })?;
        let config: Kubeconfig =
            serde_yaml::from_str(&raw).map_err(|err| CollectError::Kubeconfig {
                reason: format!("cannot parse {}: {err}", path.display()),
            })?;

        let (server, token) = config.resolve()?;
        ApiClient::new(server, token)
    }

    /// Build a client for `server` directly, with an optional bearer
    /// token.
    pub fn new(server: String, token: Option<String>) -> Result<ApiClient, CollectError> {
        let mut headers = header::HeaderMap::new();
        if let Some(token) = token {
            let value = format!("Bearer {token}")
                .parse()
                .map_err(|_| CollectError::Kubeconfig {
                    reason: "token is not a valid header value".to_owned(),
                })?;
            headers.insert(header::AUTHORIZATION, value);
        }

        let http = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .default_headers(headers)
            .build()?;

        Ok(ApiClient {
            http,
            server: server.trim_end_matches('/').to_owned(),
        })
    }

    /// List the pods of `namespace` that are scheduled on `node`.
    pub async fn list_pods(&self, node: &str, namespace: &str) -> Result<Vec<Pod>, CollectError> {
        let url = format!(
            "{}/api/v1/namespaces/{namespace}/pods?fieldSelector=spec.nodeName%3D{node}",
            self.server
        );
        let list: PodList = self
            .http
            .get(url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(list.items)
    }
}

/// The slice of a kubeconfig needed to reach one cluster.
#[derive(Debug, Default, Deserialize)]
struct Kubeconfig {
    #[serde(default, rename = "current-context")]
    current_context: String,
    #[serde(default)]
    contexts: Vec<NamedContext>,
    #[serde(default)]
    clusters: Vec<NamedCluster>,
    #[serde(default)]
    users: Vec<NamedUser>,
}

#[derive(Debug, Default, Deserialize)]
struct NamedContext {
    #[serde(default)]
    name: String,
    #[serde(default)]
    context: Context,
}

#[derive(Debug, Default, Deserialize)]
struct Context {
    #[serde(default)]
    cluster: String,
    #[serde(default)]
    user: String,
}

#[derive(Debug, Default, Deserialize)]
struct NamedCluster {
    #[serde(default)]
    name: String,
    #[serde(default)]
    cluster: Cluster,
}

#[derive(Debug, Default, Deserialize)]
struct Cluster {
    #[serde(default)]
    server: String,
}

#[derive(Debug, Default, Deserialize)]
struct NamedUser {
    #[serde(default)]
    name: String,
    #[serde(default)]
    user: User,
}

#[derive(Debug, Default, Deserialize)]
struct User {
    #[serde(default)]
    token: Option<String>,
}

impl Kubeconfig {
    /// Pick the cluster and user of the current context, falling back to
    /// the first entries when no context is named.
    fn resolve(&self) -> Result<(String, Option<String>), CollectError> {
        let context = self
            .contexts
            .iter()
            .find(|c| c.name == self.current_context)
            .map(|c| &c.context);

        let cluster = match context {
            Some(ctx) => self.clusters.iter().find(|c| c.name == ctx.cluster),
            None => self.clusters.first(),
        }
        .ok_or_else(|| CollectError::Kubeconfig {
            reason: "no cluster entry".to_owned(),
        })?;
        if cluster.cluster.server.is_empty() {
            return Err(CollectError::Kubeconfig {
                reason: format!("cluster {:?} has no server", cluster.name),
            });
        }

        let user = match context {
            Some(ctx) => self.users.iter().find(|u| u.name == ctx.user),
            None => self.users.first(),
        };

        Ok((
            cluster.cluster.server.clone(),
            user.and_then(|u| u.user.token.clone()),
        ))
    }
}

/// Drop pods with no usable containers and containers that have not been
/// created yet (empty container id).
pub fn running_containers(pods: Vec<Pod>) -> Vec<(Pod, Vec<ContainerStatus>)> {
    pods.into_iter()
        .filter_map(|pod| {
            let containers: Vec<ContainerStatus> = pod
                .status
                .container_statuses
                .iter()
                .filter(|c| !c.container_id.is_empty())
                .cloned()
                .collect();
            if containers.is_empty() {
                None
            } else {
                Some((pod, containers))
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const KUBECONFIG: &str = r#"
apiVersion: v1
kind: Config
current-context: bench
contexts:
  - name: bench
    context:
      cluster: west
      user: admin
clusters:
  - name: east
    cluster:
      server: https://10.0.0.1:6443
  - name: west
    cluster:
      server: https://10.0.0.2:6443
users:
  - name: admin
    user:
      token: sekrit
"#;

    #[test]
    fn kubeconfig_resolves_current_context() {
        let config: Kubeconfig = serde_yaml::from_str(KUBECONFIG).unwrap();
        let (server, token) = config.resolve().unwrap();
        assert_eq!(server, "https://10.0.0.2:6443");
        assert_eq!(token.as_deref(), Some("sekrit"));
    }

    #[test]
    fn kubeconfig_without_clusters_is_rejected() {
        let config: Kubeconfig = serde_yaml::from_str("apiVersion: v1").unwrap();
        assert!(config.resolve().is_err());
    }

    #[tokio::test]
    async fn lists_pods_scheduled_on_the_node() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock(
                "GET",
                "/api/v1/namespaces/default/pods?fieldSelector=spec.nodeName%3Dworker-1",
            )
            .with_status(200)
            .with_header("Content-Type", "application/json")
            .with_body(
                serde_json::json!({
                    "items": [
                        {
                            "metadata": {
                                "uid": "8e97aaf0-3461-45cd-902b-0922dd6af6e0",
                                "name": "nginx-1",
                                "namespace": "default"
                            },
                            "status": {
                                "containerStatuses": [
                                    {
                                        "name": "nginx",
                                        "containerID": "containerd://7f7ccf05e97b"
                                    },
                                    {
                                        "name": "warming-up",
                                        "containerID": ""
                                    }
                                ]
                            }
                        },
                        {
                            "metadata": {
                                "uid": "11111111-2222-3333-4444-555555555555",
                                "name": "pending",
                                "namespace": "default"
                            },
                            "status": {}
                        }
                    ]
                })
                .to_string(),
            )
            .create_async()
            .await;

        let client = ApiClient::new(server.url(), None).unwrap();
        let pods = client.list_pods("worker-1", "default").await.unwrap();
        assert_eq!(pods.len(), 2);
        assert_eq!(pods[0].metadata.name, "nginx-1");

        let running = running_containers(pods);
        assert_eq!(running.len(), 1);
        let (pod, containers) = &running[0];
        assert_eq!(pod.metadata.name, "nginx-1");
        assert_eq!(containers.len(), 1);
        assert_eq!(containers[0].name, "nginx");
    }

    #[tokio::test]
    async fn discovery_errors_surface_as_such() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock(
                "GET",
                "/api/v1/namespaces/default/pods?fieldSelector=spec.nodeName%3Dworker-1",
            )
            .with_status(500)
            .create_async()
            .await;

        let client = ApiClient::new(server.url(), None).unwrap();
        let err = client.list_pods("worker-1", "default").await.unwrap_err();
        assert!(matches!(err, CollectError::Discovery(_)));
    }
}
