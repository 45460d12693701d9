use std::io;

use projsync_core::{FileEntry, ProjectMetadata, ProjsyncError, StoreClient};
use thiserror::Error;

use super::paths::PathError;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store api error: {0}")]
    Api(#[from] ProjsyncError),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("path error: {0}")]
    Path(#[from] PathError),
    #[error("project metadata error: {0}")]
    Metadata(#[from] serde_json::Error),
    #[error("project not found: {0}")]
    ProjectNotFound(String),
    #[error("file not found: {0}")]
    FileNotFound(String),
}

impl StoreError {
    /// Failures that repeating the same call cannot fix.
    pub fn is_permanent(&self) -> bool {
        match self {
            StoreError::Api(err) => err.is_permanent(),
            StoreError::Io(_) => false,
            StoreError::Path(_)
            | StoreError::Metadata(_)
            | StoreError::ProjectNotFound(_)
            | StoreError::FileNotFound(_) => true,
        }
    }
}

/// Durable per-project file storage.
///
/// Batch writes are not atomic across files: an error may leave part of
/// the batch persisted. Callers resend whole files, so a retry converges.
pub trait DurableStore: Send + Sync + 'static {
    fn project(
        &self,
        project_id: &str,
    ) -> impl Future<Output = Result<ProjectMetadata, StoreError>> + Send;

    fn list_paths(
        &self,
        project_id: &str,
    ) -> impl Future<Output = Result<Vec<String>, StoreError>> + Send;

    fn read_file(
        &self,
        project_id: &str,
        path: &str,
    ) -> impl Future<Output = Result<Vec<u8>, StoreError>> + Send;

    fn write_file(
        &self,
        project_id: &str,
        entry: &FileEntry,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    fn delete_file(
        &self,
        project_id: &str,
        path: &str,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    fn batch_write(
        &self,
        project_id: &str,
        entries: &[FileEntry],
    ) -> impl Future<Output = Result<(), StoreError>> + Send;
}

impl DurableStore for StoreClient {
    async fn project(&self, project_id: &str) -> Result<ProjectMetadata, StoreError> {
        Ok(self.get_project(project_id).await?)
    }

    async fn list_paths(&self, project_id: &str) -> Result<Vec<String>, StoreError> {
        Ok(StoreClient::list_paths(self, project_id).await?)
    }

    async fn read_file(&self, project_id: &str, path: &str) -> Result<Vec<u8>, StoreError> {
        let entry = StoreClient::read_file(self, project_id, path).await?;
        Ok(entry.decode()?)
    }

    async fn write_file(&self, project_id: &str, entry: &FileEntry) -> Result<(), StoreError> {
        Ok(StoreClient::write_file(self, project_id, entry).await?)
    }

    async fn delete_file(&self, project_id: &str, path: &str) -> Result<(), StoreError> {
        Ok(StoreClient::delete_file(self, project_id, path).await?)
    }

    async fn batch_write(&self, project_id: &str, entries: &[FileEntry]) -> Result<(), StoreError> {
        Ok(StoreClient::batch_write(self, project_id, entries).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn classifies_permanent_failures() {
        assert!(StoreError::ProjectNotFound("p1".into()).is_permanent());
        assert!(StoreError::Path(PathError::UnsupportedComponent).is_permanent());
        assert!(!StoreError::Io(io::Error::other("disk busy")).is_permanent());
    }

    #[tokio::test]
    async fn http_store_decodes_binary_files() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/projects/p1/files/content"))
            .and(query_param("path", "/logo.png"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "path": "/logo.png",
                "content": "AQID",
                "isBinary": true
            })))
            .mount(&server)
            .await;

        let client = StoreClient::new(&server.uri()).unwrap();
        let bytes = DurableStore::read_file(&client, "p1", "/logo.png")
            .await
            .unwrap();
        assert_eq!(bytes, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn http_store_maps_missing_project_to_permanent_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/projects/gone/files/batch"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let client = StoreClient::new(&server.uri()).unwrap();
        let err = DurableStore::batch_write(&client, "gone", &[FileEntry::text("/a.txt", "1")])
            .await
            .unwrap_err();
        assert!(err.is_permanent());
    }
}
