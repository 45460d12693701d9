use serde_json::json;
use wiremock::matchers::{body_json, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};
use projsync_core::{ApiErrorClass, FileEntry, ProjsyncError, StoreClient};

#[tokio::test]
async fn get_project_sends_bearer_token() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/api/projects/p1"))
        .and(header("authorization", "Bearer test-token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "p1",
            "name": "Playground",
            "createdAt": "2024-01-01T00:00:00Z"
        })))
        .mount(&server)
        .await;

    let client = StoreClient::new(&server.uri())
        .unwrap()
        .with_token("test-token");
    let project = client.get_project("p1").await.unwrap();

    assert_eq!(project.id, "p1");
    assert_eq!(project.name, "Playground");
    assert_eq!(project.created_at.as_deref(), Some("2024-01-01T00:00:00Z"));
    assert_eq!(project.description, None);
}

#[tokio::test]
async fn list_paths_returns_remote_paths() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/api/projects/p1/files"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "paths": ["/main.py", "/assets/logo.png"]
        })))
        .mount(&server)
        .await;

    let client = StoreClient::new(&server.uri()).unwrap();
    let paths = client.list_paths("p1").await.unwrap();

    assert_eq!(paths, vec!["/main.py", "/assets/logo.png"]);
}

#[tokio::test]
async fn read_file_encodes_path_and_decodes_binary() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/api/projects/p1/files/content"))
        .and(query_param("path", "/assets/my logo.png"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "path": "/assets/my logo.png",
            "content": "AAEC",
            "isBinary": true
        })))
        .mount(&server)
        .await;

    let client = StoreClient::new(&server.uri()).unwrap();
    let entry = client.read_file("p1", "/assets/my logo.png").await.unwrap();

    assert!(entry.is_binary);
    assert_eq!(entry.decode().unwrap(), vec![0, 1, 2]);
}

#[tokio::test]
async fn write_file_puts_entry_body() {
    let server = MockServer::start().await;

    Mock::given(method("PUT"))
        .and(path("/api/projects/p1/files/content"))
        .and(query_param("path", "/a.txt"))
        .and(body_json(json!({
            "path": "/a.txt",
            "content": "hello",
            "isBinary": false
        })))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    let client = StoreClient::new(&server.uri()).unwrap();
    client
        .write_file("p1", &FileEntry::text("/a.txt", "hello"))
        .await
        .unwrap();
}

#[tokio::test]
async fn delete_file_reports_missing_file_as_permanent() {
    let server = MockServer::start().await;

    Mock::given(method("DELETE"))
        .and(path("/api/projects/p1/files/content"))
        .and(query_param("path", "/gone.txt"))
        .respond_with(ResponseTemplate::new(404).set_body_string("no such file"))
        .mount(&server)
        .await;

    let client = StoreClient::new(&server.uri()).unwrap();
    let err = client.delete_file("p1", "/gone.txt").await.unwrap_err();

    match &err {
        ProjsyncError::Api { status, body } => {
            assert_eq!(status.as_u16(), 404);
            assert_eq!(body, "no such file");
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(err.classification(), Some(ApiErrorClass::Permanent));
    assert!(err.is_permanent());
}

#[tokio::test]
async fn batch_write_posts_all_files() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/api/projects/p1/files/batch"))
        .and(body_json(json!({
            "files": [
                {"path": "/a.txt", "content": "2", "isBinary": false},
                {"path": "/b.bin", "content": "AP8=", "isBinary": true}
            ]
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"written": 2})))
        .expect(1)
        .mount(&server)
        .await;

    let client = StoreClient::new(&server.uri()).unwrap();
    client
        .batch_write(
            "p1",
            &[
                FileEntry::text("/a.txt", "2"),
                FileEntry::from_bytes("/b.bin", &[0x00, 0xff], true),
            ],
        )
        .await
        .unwrap();
}

#[tokio::test]
async fn batch_write_server_error_is_transient() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/api/projects/p1/files/batch"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let client = StoreClient::new(&server.uri()).unwrap();
    let err = client
        .batch_write("p1", &[FileEntry::text("/a.txt", "1")])
        .await
        .unwrap_err();

    assert_eq!(err.classification(), Some(ApiErrorClass::Transient));
    assert!(!err.is_permanent());
}
