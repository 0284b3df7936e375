//! Databricks REST API 2.0 client

use crate::{ClientConfig, ClientError, ClientResult, DatabricksClient};
use async_trait::async_trait;
use databricks_api::{
    ClusterId, ClusterInfo, ClusterSpec, IdempotencyKey, JobId, JobInfo, JobSpec, RunId, RunOutput,
    RunSpec,
};
use reqwest::{Client, Response, StatusCode};
use serde::de::{DeserializeOwned, IgnoredAny};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

/// Client for one Databricks workspace
pub struct RestClient {
    config: ClientConfig,
    client: Client,
    base_url: String,
}

impl RestClient {
    pub fn new(config: ClientConfig) -> ClientResult<Self> {
        let host = config.host.trim().trim_end_matches('/');
        if host.is_empty() {
            return Err(ClientError::Config("Databricks host is not set".to_string()));
        }
        if !host.starts_with("http://") && !host.starts_with("https://") {
            return Err(ClientError::Config(format!(
                "Databricks host must be an http(s) URL, got {host:?}"
            )));
        }

        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()?;

        Ok(Self {
            base_url: format!("{host}/api/2.0"),
            config,
            client,
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.config.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn get<R: DeserializeOwned>(&self, path: &str, query: &[(&str, String)]) -> ClientResult<R> {
        debug!(path, "GET");
        let response = self
            .authorize(self.client.get(self.url(path)))
            .query(query)
            .send()
            .await?;
        decode(response).await
    }

    async fn post<B, R>(&self, path: &str, body: &B) -> ClientResult<R>
    where
        B: Serialize + ?Sized + Sync,
        R: DeserializeOwned,
    {
        debug!(path, "POST");
        let response = self
            .authorize(self.client.post(self.url(path)))
            .json(body)
            .send()
            .await?;
        decode(response).await
    }
}

/// Databricks error body, e.g. `{"error_code": "INVALID_PARAMETER_VALUE", "message": "..."}`
#[derive(Debug, Default, Deserialize)]
struct ApiErrorBody {
    #[serde(default)]
    error_code: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

async fn decode<R: DeserializeOwned>(response: Response) -> ClientResult<R> {
    let status = response.status();
    let bytes = response.bytes().await?;

    if status.is_success() {
        // Some endpoints answer with an empty body instead of `{}`
        let body: &[u8] = if bytes.is_empty() { b"{}" } else { &bytes };
        return serde_json::from_slice(body)
            .map_err(|e| ClientError::Unavailable(format!("undecodable response: {e}")));
    }

    let body: ApiErrorBody = serde_json::from_slice(&bytes).unwrap_or_default();
    let error_code = body.error_code.unwrap_or_default();
    let message = body
        .message
        .unwrap_or_else(|| String::from_utf8_lossy(&bytes).into_owned());

    Err(classify(status, error_code, message))
}

fn classify(status: StatusCode, error_code: String, message: String) -> ClientError {
    if status == StatusCode::NOT_FOUND || error_code == "RESOURCE_DOES_NOT_EXIST" {
        return ClientError::NotFound(message);
    }
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        return ClientError::Unavailable(format!("{} {}: {}", status.as_u16(), error_code, message));
    }
    ClientError::Rejected {
        status: status.as_u16(),
        error_code,
        message,
    }
}

#[derive(Serialize)]
struct CreateClusterRequest<'a> {
    cluster_name: &'a str,
    #[serde(flatten)]
    spec: &'a ClusterSpec,
    idempotency_token: &'a str,
}

#[derive(Serialize)]
struct EditClusterRequest<'a> {
    cluster_id: &'a ClusterId,
    cluster_name: &'a str,
    #[serde(flatten)]
    spec: &'a ClusterSpec,
}

#[derive(Serialize)]
struct ClusterIdRequest<'a> {
    cluster_id: &'a ClusterId,
}

#[derive(Deserialize)]
struct ClusterIdResponse {
    cluster_id: ClusterId,
}

#[derive(Deserialize)]
struct ListClustersResponse {
    #[serde(default)]
    clusters: Vec<ClusterInfo>,
}

#[derive(Serialize)]
struct JobSettings<'a> {
    name: &'a str,
    #[serde(flatten)]
    spec: &'a JobSpec,
}

#[derive(Serialize)]
struct CreateJobRequest<'a> {
    #[serde(flatten)]
    settings: JobSettings<'a>,
    idempotency_token: &'a str,
}

#[derive(Serialize)]
struct ResetJobRequest<'a> {
    job_id: JobId,
    new_settings: JobSettings<'a>,
}

#[derive(Serialize)]
struct JobIdRequest {
    job_id: JobId,
}

#[derive(Deserialize)]
struct JobIdResponse {
    job_id: JobId,
}

#[derive(Serialize)]
struct SubmitRunRequest<'a> {
    run_name: &'a str,
    #[serde(flatten)]
    spec: &'a RunSpec,
    idempotency_token: &'a str,
}

#[derive(Serialize)]
struct RunNowRequest<'a> {
    job_id: JobId,
    idempotency_token: &'a str,
}

#[derive(Serialize)]
struct RunIdRequest {
    run_id: RunId,
}

#[derive(Deserialize)]
struct RunIdResponse {
    run_id: RunId,
}

#[async_trait]
impl DatabricksClient for RestClient {
    async fn create_cluster(
        &self,
        cluster_name: &str,
        spec: &ClusterSpec,
        token: &IdempotencyKey,
    ) -> ClientResult<ClusterId> {
        let request = CreateClusterRequest {
            cluster_name,
            spec,
            idempotency_token: token.as_str(),
        };
        let response: ClusterIdResponse = self.post("clusters/create", &request).await?;
        Ok(response.cluster_id)
    }

    async fn get_cluster(&self, id: &ClusterId) -> ClientResult<ClusterInfo> {
        self.get("clusters/get", &[("cluster_id", id.to_string())]).await
    }

    async fn edit_cluster(
        &self,
        id: &ClusterId,
        cluster_name: &str,
        spec: &ClusterSpec,
    ) -> ClientResult<()> {
        let request = EditClusterRequest {
            cluster_id: id,
            cluster_name,
            spec,
        };
        let _: IgnoredAny = self.post("clusters/edit", &request).await?;
        Ok(())
    }

    async fn delete_cluster(&self, id: &ClusterId) -> ClientResult<()> {
        let _: IgnoredAny = self
            .post("clusters/permanent-delete", &ClusterIdRequest { cluster_id: id })
            .await?;
        Ok(())
    }

    async fn list_clusters(&self) -> ClientResult<Vec<ClusterInfo>> {
        let response: ListClustersResponse = self.get("clusters/list", &[]).await?;
        Ok(response.clusters)
    }

    async fn create_job(
        &self,
        job_name: &str,
        spec: &JobSpec,
        token: &IdempotencyKey,
    ) -> ClientResult<JobId> {
        let request = CreateJobRequest {
            settings: JobSettings { name: job_name, spec },
            idempotency_token: token.as_str(),
        };
        let response: JobIdResponse = self.post("jobs/create", &request).await?;
        Ok(response.job_id)
    }

    async fn get_job(&self, id: JobId) -> ClientResult<JobInfo> {
        self.get("jobs/get", &[("job_id", id.to_string())]).await
    }

    async fn reset_job(&self, id: JobId, job_name: &str, spec: &JobSpec) -> ClientResult<()> {
        let request = ResetJobRequest {
            job_id: id,
            new_settings: JobSettings { name: job_name, spec },
        };
        let _: IgnoredAny = self.post("jobs/reset", &request).await?;
        Ok(())
    }

    async fn delete_job(&self, id: JobId) -> ClientResult<()> {
        let _: IgnoredAny = self.post("jobs/delete", &JobIdRequest { job_id: id }).await?;
        Ok(())
    }

    async fn submit_run(
        &self,
        run_name: &str,
        spec: &RunSpec,
        token: &IdempotencyKey,
    ) -> ClientResult<RunId> {
        if let Some(job_name) = spec.job_name() {
            return Err(ClientError::rejected(
                400,
                "INVALID_PARAMETER_VALUE",
                &format!("run {run_name:?} targets job {job_name:?}; trigger it with run-now"),
            ));
        }
        let request = SubmitRunRequest {
            run_name,
            spec,
            idempotency_token: token.as_str(),
        };
        let response: RunIdResponse = self.post("jobs/runs/submit", &request).await?;
        Ok(response.run_id)
    }

    async fn run_now(&self, job_id: JobId, token: &IdempotencyKey) -> ClientResult<RunId> {
        let request = RunNowRequest {
            job_id,
            idempotency_token: token.as_str(),
        };
        let response: RunIdResponse = self.post("jobs/run-now", &request).await?;
        Ok(response.run_id)
    }

    async fn get_run(&self, id: RunId) -> ClientResult<RunOutput> {
        self.get("jobs/runs/get-output", &[("run_id", id.to_string())]).await
    }

    async fn cancel_run(&self, id: RunId) -> ClientResult<()> {
        let _: IgnoredAny = self.post("jobs/runs/cancel", &RunIdRequest { run_id: id }).await?;
        Ok(())
    }

    async fn delete_run(&self, id: RunId) -> ClientResult<()> {
        let _: IgnoredAny = self.post("jobs/runs/delete", &RunIdRequest { run_id: id }).await?;
        Ok(())
    }

    async fn health_check(&self) -> ClientResult<bool> {
        let response = self
            .authorize(self.client.get(self.url("clusters/spark-versions")))
            .send()
            .await?;

        Ok(response.status().is_success())
    }
}
