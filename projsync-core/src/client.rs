use reqwest::{Client, RequestBuilder, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use crate::entry::FileEntry;

#[derive(Debug, Error)]
pub enum ProjsyncError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    #[error("base url cannot carry path segments")]
    BaseUrl,
    #[error("api returned {status}: {body}")]
    Api { status: StatusCode, body: String },
    #[error("file content is not valid base64: {0}")]
    Decode(#[from] base64::DecodeError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiErrorClass {
    Auth,
    RateLimit,
    Transient,
    Permanent,
}

#[derive(Clone)]
pub struct StoreClient {
    http: Client,
    base_url: Url,
    token: Option<String>,
}

impl StoreClient {
    pub fn new(base_url: &str) -> Result<Self, ProjsyncError> {
        Ok(Self {
            http: Client::new(),
            base_url: Url::parse(base_url)?,
            token: None,
        })
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub async fn get_project(&self, project_id: &str) -> Result<ProjectMetadata, ProjsyncError> {
        let url = self.project_endpoint(project_id, &[])?;
        let response = self.authorize(self.http.get(url)).send().await?;
        Self::handle_response(response).await
    }

    pub async fn list_paths(&self, project_id: &str) -> Result<Vec<String>, ProjsyncError> {
        let url = self.project_endpoint(project_id, &["files"])?;
        let response = self.authorize(self.http.get(url)).send().await?;
        let payload: PathList = Self::handle_response(response).await?;
        Ok(payload.paths)
    }

    pub async fn read_file(&self, project_id: &str, path: &str) -> Result<FileEntry, ProjsyncError> {
        let mut url = self.project_endpoint(project_id, &["files", "content"])?;
        url.query_pairs_mut().append_pair("path", path);
        let response = self.authorize(self.http.get(url)).send().await?;
        Self::handle_response(response).await
    }

    pub async fn write_file(&self, project_id: &str, entry: &FileEntry) -> Result<(), ProjsyncError> {
        let mut url = self.project_endpoint(project_id, &["files", "content"])?;
        url.query_pairs_mut().append_pair("path", &entry.path);
        let response = self
            .authorize(self.http.put(url))
            .json(entry)
            .send()
            .await?;
        Self::expect_success(response).await
    }

    pub async fn delete_file(&self, project_id: &str, path: &str) -> Result<(), ProjsyncError> {
        let mut url = self.project_endpoint(project_id, &["files", "content"])?;
        url.query_pairs_mut().append_pair("path", path);
        let response = self.authorize(self.http.delete(url)).send().await?;
        Self::expect_success(response).await
    }

    /// Writes every entry in one request. The server writes files
    /// independently, so a failed response may still have persisted some.
    pub async fn batch_write(
        &self,
        project_id: &str,
        files: &[FileEntry],
    ) -> Result<(), ProjsyncError> {
        let url = self.project_endpoint(project_id, &["files", "batch"])?;
        let response = self
            .authorize(self.http.post(url))
            .json(&BatchRequest { files })
            .send()
            .await?;
        Self::expect_success(response).await
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    fn project_endpoint(&self, project_id: &str, tail: &[&str]) -> Result<Url, ProjsyncError> {
        let mut url = self.base_url.clone();
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|_| ProjsyncError::BaseUrl)?;
            segments
                .pop_if_empty()
                .extend(["api", "projects", project_id])
                .extend(tail);
        }
        Ok(url)
    }

    async fn handle_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, ProjsyncError> {
        if response.status().is_success() {
            Ok(response.json::<T>().await?)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(ProjsyncError::Api { status, body })
        }
    }

    async fn expect_success(response: reqwest::Response) -> Result<(), ProjsyncError> {
        if response.status().is_success() {
            Ok(())
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(ProjsyncError::Api { status, body })
        }
    }
}

impl ProjsyncError {
    pub fn classification(&self) -> Option<ApiErrorClass> {
        match self {
            ProjsyncError::Api { status, .. } => Some(classify_api_status(*status)),
            _ => None,
        }
    }

    /// Failures that will not go away by sending the same request again.
    pub fn is_permanent(&self) -> bool {
        match self {
            ProjsyncError::Decode(_) | ProjsyncError::BaseUrl | ProjsyncError::Url(_) => true,
            _ => self.classification() == Some(ApiErrorClass::Permanent),
        }
    }
}

fn classify_api_status(status: StatusCode) -> ApiErrorClass {
    if matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) {
        ApiErrorClass::Auth
    } else if status == StatusCode::TOO_MANY_REQUESTS {
        ApiErrorClass::RateLimit
    } else if status.is_server_error()
        || matches!(
            status,
            StatusCode::REQUEST_TIMEOUT | StatusCode::CONFLICT | StatusCode::TOO_EARLY
        )
    {
        ApiErrorClass::Transient
    } else {
        ApiErrorClass::Permanent
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ProjectMetadata {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
}

impl ProjectMetadata {
    pub fn named(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: None,
            created_at: None,
            updated_at: None,
        }
    }
}

#[derive(Debug, Deserialize, Serialize)]
struct PathList {
    #[serde(default)]
    paths: Vec<String>,
}

#[derive(Debug, Serialize)]
struct BatchRequest<'a> {
    files: &'a [FileEntry],
}
