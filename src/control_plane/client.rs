//! GraphQL-over-HTTP client for the remote platform.

use super::{ControlPlane, CpResult, Deployment, ServiceInstanceSettings};
use crate::compiler::SecretEnv;
use crate::error::ControlPlaneError;

use async_trait::async_trait;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use std::time::Duration;

pub const DEFAULT_ENDPOINT: &str = "https://backboard.railway.com/graphql/v2";

#[derive(Debug, Clone)]
pub struct ControlPlaneClient {
    client: reqwest::Client,
    endpoint: String,
    token: String,
    project_id: String,
    environment_id: String,
}

impl ControlPlaneClient {
    pub fn new(
        endpoint: impl Into<String>,
        token: impl Into<String>,
        project_id: impl Into<String>,
        environment_id: impl Into<String>,
    ) -> CpResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|error| ControlPlaneError::Request(error.to_string()))?;

        Ok(Self {
            client,
            endpoint: endpoint.into(),
            token: token.into(),
            project_id: project_id.into(),
            environment_id: environment_id.into(),
        })
    }

    /// Execute one GraphQL document and decode its `data` member.
    ///
    /// Non-2xx responses and a non-empty `errors` array are both raised with
    /// the platform's own message.
    async fn execute<T: DeserializeOwned>(&self, query: &str, variables: Value) -> CpResult<T> {
        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.token)
            .json(&json!({ "query": query, "variables": variables }))
            .send()
            .await
            .map_err(|error| ControlPlaneError::Request(error.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|error| ControlPlaneError::Request(error.to_string()))?;

        if !status.is_success() {
            return Err(ControlPlaneError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let envelope: GraphqlEnvelope<T> = serde_json::from_str(&body)
            .map_err(|error| ControlPlaneError::Decode(format!("{error}: {body}")))?;

        if let Some(errors) = envelope.errors.filter(|errors| !errors.is_empty()) {
            let message = errors
                .into_iter()
                .map(|error| error.message)
                .collect::<Vec<_>>()
                .join("; ");
            return Err(ControlPlaneError::Api(message));
        }

        envelope
            .data
            .ok_or_else(|| ControlPlaneError::Decode("response carried no data".into()))
    }
}

#[derive(Debug, Deserialize)]
struct GraphqlEnvelope<T> {
    data: Option<T>,
    #[serde(default)]
    errors: Option<Vec<GraphqlError>>,
}

#[derive(Debug, Deserialize)]
struct GraphqlError {
    message: String,
}

#[derive(Debug, Deserialize)]
struct IdNode {
    id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServiceCreateData {
    service_create: IdNode,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DomainCreateData {
    service_domain_create: DomainNode,
}

#[derive(Debug, Deserialize)]
struct DomainNode {
    domain: String,
}

#[derive(Debug, Deserialize)]
struct Connection<T> {
    edges: Vec<Edge<T>>,
}

#[derive(Debug, Deserialize)]
struct Edge<T> {
    node: T,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeploymentNode {
    id: String,
    status: String,
    #[serde(default)]
    static_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DeploymentsData {
    deployments: Connection<DeploymentNode>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeploymentLogsData {
    deployment_logs: Vec<LogLine>,
}

#[derive(Debug, Deserialize)]
struct LogLine {
    message: String,
}

#[derive(Debug, Deserialize)]
struct ProjectData {
    project: ProjectNode,
}

#[derive(Debug, Deserialize)]
struct ProjectNode {
    services: Connection<ServiceNode>,
}

#[derive(Debug, Deserialize)]
struct ServiceNode {
    id: String,
    name: String,
}

const SERVICE_CREATE: &str = "mutation serviceCreate($input: ServiceCreateInput!) { serviceCreate(input: $input) { id } }";
const SERVICE_INSTANCE_UPDATE: &str = "mutation serviceInstanceUpdate($serviceId: String!, $environmentId: String, $input: ServiceInstanceUpdateInput!) { serviceInstanceUpdate(serviceId: $serviceId, environmentId: $environmentId, input: $input) }";
const SERVICE_DOMAIN_CREATE: &str = "mutation serviceDomainCreate($input: ServiceDomainCreateInput!) { serviceDomainCreate(input: $input) { domain } }";
const SERVICE_INSTANCE_REDEPLOY: &str = "mutation serviceInstanceDeploy($serviceId: String!, $environmentId: String!) { serviceInstanceDeployV2(serviceId: $serviceId, environmentId: $environmentId) }";
const DEPLOYMENT_REMOVE: &str =
    "mutation deploymentRemove($id: String!) { deploymentRemove(id: $id) }";
const DEPLOYMENT_RESTART: &str =
    "mutation deploymentRestart($id: String!) { deploymentRestart(id: $id) }";
const SERVICE_DELETE: &str = "mutation serviceDelete($id: String!, $environmentId: String) { serviceDelete(id: $id, environmentId: $environmentId) }";
const LATEST_DEPLOYMENT: &str = "query deployments($input: DeploymentListInput!) { deployments(first: 1, input: $input) { edges { node { id status staticUrl } } } }";
const DEPLOYMENT_LOGS: &str = "query deploymentLogs($deploymentId: String!, $limit: Int) { deploymentLogs(deploymentId: $deploymentId, limit: $limit) { message } }";
const VARIABLES_UPSERT: &str = "mutation variableCollectionUpsert($input: VariableCollectionUpsertInput!) { variableCollectionUpsert(input: $input) }";
const PROJECT_SERVICES: &str =
    "query project($id: String!) { project(id: $id) { services { edges { node { id name } } } } }";

#[async_trait]
impl ControlPlane for ControlPlaneClient {
    async fn create_service(
        &self,
        name: &str,
        image: &str,
        variables: &SecretEnv,
    ) -> CpResult<String> {
        let data: ServiceCreateData = self
            .execute(
                SERVICE_CREATE,
                json!({
                    "input": {
                        "projectId": self.project_id,
                        "environmentId": self.environment_id,
                        "name": name,
                        "source": { "image": image },
                        "variables": variables,
                    }
                }),
            )
            .await?;
        Ok(data.service_create.id)
    }

    async fn update_service_instance(
        &self,
        service_id: &str,
        settings: &ServiceInstanceSettings,
    ) -> CpResult<()> {
        let _: Value = self
            .execute(
                SERVICE_INSTANCE_UPDATE,
                json!({
                    "serviceId": service_id,
                    "environmentId": self.environment_id,
                    "input": {
                        "startCommand": settings.start_command,
                        "restartPolicyType": settings.restart_policy.as_str(),
                        "restartPolicyMaxRetries": settings.max_restarts,
                    }
                }),
            )
            .await?;
        Ok(())
    }

    async fn create_service_domain(&self, service_id: &str) -> CpResult<String> {
        let data: DomainCreateData = self
            .execute(
                SERVICE_DOMAIN_CREATE,
                json!({
                    "input": {
                        "serviceId": service_id,
                        "environmentId": self.environment_id,
                    }
                }),
            )
            .await?;
        Ok(data.service_domain_create.domain)
    }

    async fn redeploy_service(&self, service_id: &str) -> CpResult<()> {
        let _: Value = self
            .execute(
                SERVICE_INSTANCE_REDEPLOY,
                json!({ "serviceId": service_id, "environmentId": self.environment_id }),
            )
            .await?;
        Ok(())
    }

    async fn remove_deployment(&self, deployment_id: &str) -> CpResult<()> {
        let _: Value = self
            .execute(DEPLOYMENT_REMOVE, json!({ "id": deployment_id }))
            .await?;
        Ok(())
    }

    async fn restart_deployment(&self, deployment_id: &str) -> CpResult<()> {
        let _: Value = self
            .execute(DEPLOYMENT_RESTART, json!({ "id": deployment_id }))
            .await?;
        Ok(())
    }

    async fn delete_service(&self, service_id: &str) -> CpResult<()> {
        let _: Value = self
            .execute(
                SERVICE_DELETE,
                json!({ "id": service_id, "environmentId": self.environment_id }),
            )
            .await?;
        Ok(())
    }

    async fn latest_deployment(&self, service_id: &str) -> CpResult<Option<Deployment>> {
        let data: DeploymentsData = self
            .execute(
                LATEST_DEPLOYMENT,
                json!({
                    "input": {
                        "projectId": self.project_id,
                        "environmentId": self.environment_id,
                        "serviceId": service_id,
                    }
                }),
            )
            .await?;

        Ok(data
            .deployments
            .edges
            .into_iter()
            .next()
            .map(|edge| Deployment {
                id: edge.node.id,
                status: edge.node.status,
                static_url: edge.node.static_url.filter(|url| !url.is_empty()),
            }))
    }

    async fn deployment_logs(&self, deployment_id: &str, limit: usize) -> CpResult<Vec<String>> {
        let data: DeploymentLogsData = self
            .execute(
                DEPLOYMENT_LOGS,
                json!({ "deploymentId": deployment_id, "limit": limit }),
            )
            .await?;

        let mut lines: Vec<String> = data
            .deployment_logs
            .into_iter()
            .map(|line| line.message)
            .collect();
        if lines.len() > limit {
            lines.drain(..lines.len() - limit);
        }
        Ok(lines)
    }

    async fn upsert_variables(&self, service_id: &str, variables: &SecretEnv) -> CpResult<()> {
        let _: Value = self
            .execute(
                VARIABLES_UPSERT,
                json!({
                    "input": {
                        "projectId": self.project_id,
                        "environmentId": self.environment_id,
                        "serviceId": service_id,
                        "variables": variables,
                    }
                }),
            )
            .await?;
        Ok(())
    }

    async fn find_service_by_name(&self, name: &str) -> CpResult<Option<String>> {
        let data: ProjectData = self
            .execute(PROJECT_SERVICES, json!({ "id": self.project_id }))
            .await?;

        Ok(data
            .project
            .services
            .edges
            .into_iter()
            .map(|edge| edge.node)
            .find(|service| service.name == name)
            .map(|service| service.id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::spawn_one_shot_server;

    fn test_client(base_url: String) -> ControlPlaneClient {
        ControlPlaneClient::new(format!("{base_url}/graphql"), "cp-token", "proj-1", "env-1")
            .expect("client builds")
    }

    #[tokio::test]
    async fn create_service_request_shape() {
        let (base_url, rx) =
            spawn_one_shot_server("200 OK", r#"{"data":{"serviceCreate":{"id":"svc-123"}}}"#);
        let client = test_client(base_url);

        let mut variables = SecretEnv::new();
        variables.insert("GATEWAY_TOKEN".into(), "tok".into());

        let id = client
            .create_service("berth-alice", "ghcr.io/berth/agent:latest", &variables)
            .await
            .expect("create service succeeds");
        assert_eq!(id, "svc-123");

        let req = rx
            .recv_timeout(Duration::from_secs(2))
            .expect("captured request");
        assert_eq!(req.method, "POST");
        assert_eq!(req.path, "/graphql");
        assert_eq!(
            req.headers.get("authorization").map(String::as_str),
            Some("Bearer cp-token")
        );

        let body: Value = serde_json::from_str(&req.body).expect("parse json body");
        assert!(body["query"].as_str().unwrap().contains("serviceCreate"));
        let input = &body["variables"]["input"];
        assert_eq!(input["projectId"], "proj-1");
        assert_eq!(input["environmentId"], "env-1");
        assert_eq!(input["name"], "berth-alice");
        assert_eq!(input["source"]["image"], "ghcr.io/berth/agent:latest");
        assert_eq!(input["variables"]["GATEWAY_TOKEN"], "tok");
    }

    #[tokio::test]
    async fn graphql_errors_are_raised_with_their_message() {
        let (base_url, _rx) = spawn_one_shot_server(
            "200 OK",
            r#"{"data":null,"errors":[{"message":"Service was updated too recently"}]}"#,
        );
        let client = test_client(base_url);

        let error = client
            .redeploy_service("svc-1")
            .await
            .expect_err("errors field must fail");
        assert!(matches!(error, ControlPlaneError::Api(ref message) if message == "Service was updated too recently"));
    }

    #[tokio::test]
    async fn http_failures_keep_status_and_body() {
        let (base_url, _rx) = spawn_one_shot_server("429 Too Many Requests", "slow down");
        let client = test_client(base_url);

        let error = client
            .delete_service("svc-1")
            .await
            .expect_err("429 must fail");
        assert_eq!(error.status_code(), Some(429));
        assert!(error.to_string().contains("slow down"));
    }

    #[tokio::test]
    async fn latest_deployment_is_none_without_edges() {
        let (base_url, _rx) =
            spawn_one_shot_server("200 OK", r#"{"data":{"deployments":{"edges":[]}}}"#);
        let client = test_client(base_url);
        assert_eq!(client.latest_deployment("svc-1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn find_service_by_name_matches_exactly() {
        let (base_url, _rx) = spawn_one_shot_server(
            "200 OK",
            r#"{"data":{"project":{"services":{"edges":[
                {"node":{"id":"svc-a","name":"berth-alice-old"}},
                {"node":{"id":"svc-b","name":"berth-alice"}}
            ]}}}}"#,
        );
        let client = test_client(base_url);
        assert_eq!(
            client.find_service_by_name("berth-alice").await.unwrap(),
            Some("svc-b".to_string())
        );
    }
}
