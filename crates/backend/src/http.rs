//! HTTP backend for a Bot-API-shaped messaging service.
//!
//! Chunks are posted as documents to a single chat; the document's file id
//! is the content handle. Each method performs one request and never
//! retries; see [`crate::ResilientTransport`].

use std::time::Duration;

use reqwest::header::RETRY_AFTER;
use reqwest::multipart::{Form, Part};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tracing::trace;

use crate::backend::{BackendFuture, StorageBackend, UploadReceipt};
use crate::error::BackendError;

const DEFAULT_API_BASE: &str = "https://api.telegram.org";

/// Connection settings for [`HttpBackend`].
#[derive(Debug, Clone)]
pub struct HttpConfig {
    /// API root, without trailing slash.
    pub api_base: String,
    pub bot_token: String,
    /// Chat that receives the chunk documents.
    pub chat_id: String,
}

impl HttpConfig {
    pub fn new(bot_token: impl Into<String>, chat_id: impl Into<String>) -> Self {
        Self {
            api_base: DEFAULT_API_BASE.to_string(),
            bot_token: bot_token.into(),
            chat_id: chat_id.into(),
        }
    }
}

/// Envelope of every API reply.
#[derive(Debug, Deserialize)]
struct ApiReply<T> {
    ok: bool,
    result: Option<T>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    error_code: Option<u16>,
    #[serde(default)]
    parameters: Option<ReplyParameters>,
}

#[derive(Debug, Deserialize)]
struct ReplyParameters {
    #[serde(default)]
    retry_after: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct SentMessage {
    message_id: i64,
    #[serde(default)]
    document: Option<SentDocument>,
}

#[derive(Debug, Deserialize)]
struct SentDocument {
    file_id: String,
}

#[derive(Debug, Deserialize)]
struct RemoteFile {
    #[serde(default)]
    file_path: Option<String>,
}

/// `reqwest`-based [`StorageBackend`].
pub struct HttpBackend {
    http: reqwest::Client,
    config: HttpConfig,
}

impl HttpBackend {
    /// Creates a backend. Timeouts are applied per attempt by the transport,
    /// so the client itself has none.
    pub fn new(config: HttpConfig) -> Result<Self, BackendError> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("relaybox/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { http, config })
    }

    fn method_url(&self, method: &str) -> String {
        format!(
            "{}/bot{}/{method}",
            self.config.api_base, self.config.bot_token
        )
    }

    fn file_url(&self, path: &str) -> String {
        format!(
            "{}/file/bot{}/{}",
            self.config.api_base,
            self.config.bot_token,
            path.trim_start_matches('/')
        )
    }

    async fn send_document(&self, filename: &str, data: &[u8]) -> Result<UploadReceipt, BackendError> {
        let part = Part::bytes(data.to_vec())
            .file_name(filename.to_string())
            .mime_str("application/octet-stream")?;
        let form = Form::new()
            .text("chat_id", self.config.chat_id.clone())
            .part("document", part);

        trace!(filename, bytes = data.len(), "sendDocument");
        let resp = self
            .http
            .post(self.method_url("sendDocument"))
            .multipart(form)
            .send()
            .await?;
        let body = checked_body(resp).await?;
        let message: SentMessage = parse_reply(&body)?;
        let document = message
            .document
            .ok_or_else(|| BackendError::Protocol("reply has no document".into()))?;

        Ok(UploadReceipt {
            message_ref: message.message_id.to_string(),
            file_ref: document.file_id,
        })
    }

    async fn get_file(&self, file_ref: &str) -> Result<String, BackendError> {
        trace!(file_ref, "getFile");
        let resp = self
            .http
            .get(self.method_url("getFile"))
            .query(&[("file_id", file_ref)])
            .send()
            .await?;
        let body = checked_body(resp).await?;
        let file: RemoteFile = parse_reply(&body)?;
        file.file_path
            .filter(|p| !p.is_empty())
            .ok_or_else(|| BackendError::Protocol(format!("no file path for {file_ref}")))
    }

    async fn fetch(&self, path: &str) -> Result<Vec<u8>, BackendError> {
        trace!(path, "download");
        let resp = self.http.get(self.file_url(path)).send().await?;
        checked_body(resp).await
    }
}

impl StorageBackend for HttpBackend {
    fn upload_document<'a>(
        &'a self,
        filename: &'a str,
        data: &'a [u8],
    ) -> BackendFuture<'a, UploadReceipt> {
        Box::pin(self.send_document(filename, data))
    }

    fn resolve_file<'a>(&'a self, file_ref: &'a str) -> BackendFuture<'a, String> {
        Box::pin(self.get_file(file_ref))
    }

    fn download<'a>(&'a self, path: &'a str) -> BackendFuture<'a, Vec<u8>> {
        Box::pin(self.fetch(path))
    }

    fn name(&self) -> &str {
        "http"
    }
}

/// Returns the body of a successful response, or a status error carrying the
/// body text and any Retry-After hint.
async fn checked_body(resp: reqwest::Response) -> Result<Vec<u8>, BackendError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp.bytes().await?.to_vec());
    }

    let header_hint = resp
        .headers()
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs);
    let body = resp.text().await.unwrap_or_default();
    let retry_after = header_hint.or_else(|| body_retry_after(&body));

    Err(BackendError::Status {
        status: status.as_u16(),
        body,
        retry_after,
    })
}

/// Extracts `parameters.retry_after` from an error reply body.
fn body_retry_after(body: &str) -> Option<Duration> {
    let reply: ApiReply<serde_json::Value> = serde_json::from_str(body).ok()?;
    reply
        .parameters
        .and_then(|p| p.retry_after)
        .map(Duration::from_secs)
}

/// Decodes an `{ok, result}` envelope.
fn parse_reply<T: DeserializeOwned>(body: &[u8]) -> Result<T, BackendError> {
    let reply: ApiReply<T> =
        serde_json::from_slice(body).map_err(|e| BackendError::Protocol(e.to_string()))?;
    if !reply.ok {
        return Err(BackendError::Status {
            status: reply.error_code.unwrap_or(500),
            body: reply.description.unwrap_or_default(),
            retry_after: reply
                .parameters
                .and_then(|p| p.retry_after)
                .map(Duration::from_secs),
        });
    }
    reply
        .result
        .ok_or_else(|| BackendError::Protocol("reply has no result".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    /// Reads one HTTP request (headers plus body) from `stream`.
    async fn read_request(stream: &mut TcpStream) -> String {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 4096];
        loop {
            let n = stream.read(&mut chunk).await.unwrap_or(0);
            if n == 0 {
                break;
            }
            buf.extend_from_slice(&chunk[..n]);
            let text = String::from_utf8_lossy(&buf).to_string();
            if let Some(header_end) = text.find("\r\n\r\n") {
                let headers = text[..header_end].to_ascii_lowercase();
                let body_len = buf.len() - (header_end + 4);
                let content_length = headers
                    .lines()
                    .find_map(|l| l.strip_prefix("content-length:"))
                    .and_then(|v| v.trim().parse::<usize>().ok());
                match content_length {
                    Some(len) if body_len >= len => break,
                    Some(_) => {}
                    None if headers.contains("transfer-encoding: chunked") => {
                        if text.ends_with("0\r\n\r\n") {
                            break;
                        }
                    }
                    None => break,
                }
            }
        }
        String::from_utf8_lossy(&buf).to_string()
    }

    /// Starts a one-shot mock server. The request text is sent back through
    /// the join handle.
    async fn mock_server(
        status_line: &'static str,
        extra_headers: &'static str,
        body: Vec<u8>,
    ) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let url = format!("http://127.0.0.1:{port}");

        let handle = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let request = read_request(&mut stream).await;
            let head = format!(
                "HTTP/1.1 {status_line}\r\nContent-Length: {}\r\n{extra_headers}Connection: close\r\n\r\n",
                body.len()
            );
            let _ = stream.write_all(head.as_bytes()).await;
            let _ = stream.write_all(&body).await;
            let _ = stream.shutdown().await;
            request
        });

        (url, handle)
    }

    fn backend(url: String) -> HttpBackend {
        HttpBackend::new(HttpConfig {
            api_base: url,
            bot_token: "TOKEN".into(),
            chat_id: "-100".into(),
        })
        .unwrap()
    }

    #[tokio::test]
    async fn upload_parses_receipt() {
        let body = br#"{"ok":true,"result":{"message_id":77,"document":{"file_id":"DOC-1"}}}"#;
        let (url, handle) = mock_server("200 OK", "", body.to_vec()).await;

        let receipt = backend(url)
            .upload_document("movie.mp4.part0000", b"sealed-bytes")
            .await
            .unwrap();
        assert_eq!(receipt.message_ref, "77");
        assert_eq!(receipt.file_ref, "DOC-1");

        let request = handle.await.unwrap();
        assert!(request.starts_with("POST /botTOKEN/sendDocument"));
        assert!(request.contains("movie.mp4.part0000"));
        assert!(request.contains("sealed-bytes"));
    }

    #[tokio::test]
    async fn rate_limit_carries_retry_after_header() {
        let body = br#"{"ok":false,"error_code":429,"description":"Too Many Requests"}"#;
        let (url, _handle) =
            mock_server("429 Too Many Requests", "Retry-After: 3\r\n", body.to_vec()).await;

        let err = backend(url)
            .upload_document("a.part0000", b"x")
            .await
            .unwrap_err();
        match err {
            BackendError::Status {
                status,
                body,
                retry_after,
            } => {
                assert_eq!(status, 429);
                assert!(body.contains("Too Many Requests"));
                assert_eq!(retry_after, Some(Duration::from_secs(3)));
            }
            other => panic!("expected status error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn resolve_returns_file_path() {
        let body = br#"{"ok":true,"result":{"file_id":"DOC-1","file_path":"documents/file_9.bin"}}"#;
        let (url, handle) = mock_server("200 OK", "", body.to_vec()).await;

        let path = backend(url).resolve_file("DOC-1").await.unwrap();
        assert_eq!(path, "documents/file_9.bin");

        let request = handle.await.unwrap();
        assert!(request.starts_with("GET /botTOKEN/getFile?file_id=DOC-1"));
    }

    #[tokio::test]
    async fn download_returns_raw_bytes() {
        let payload = vec![0u8, 1, 2, 255, 254];
        let (url, handle) = mock_server("200 OK", "", payload.clone()).await;

        let bytes = backend(url).download("documents/file_9.bin").await.unwrap();
        assert_eq!(bytes, payload);

        let request = handle.await.unwrap();
        assert!(request.starts_with("GET /file/botTOKEN/documents/file_9.bin"));
    }

    #[tokio::test]
    async fn not_found_is_permanent_status() {
        let (url, _handle) = mock_server("404 Not Found", "", b"not found".to_vec()).await;
        let err = backend(url).download("missing").await.unwrap_err();
        assert_eq!(err.status(), Some(404));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn connection_errors_do_not_leak_the_token() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let backend = HttpBackend::new(HttpConfig {
            api_base: format!("http://127.0.0.1:{port}"),
            bot_token: "SECRET123:TOKEN".into(),
            chat_id: "-100".into(),
        })
        .unwrap();

        let errors = [
            backend.upload_document("a.part0000", b"x").await.unwrap_err(),
            backend.resolve_file("DOC-1").await.unwrap_err(),
            backend.download("documents/a").await.unwrap_err(),
        ];
        for err in errors {
            assert!(matches!(err, BackendError::Connection(_)), "{err}");
            let text = format!("{err} {err:?}");
            assert!(!text.contains("SECRET123"), "token leaked: {text}");
        }
    }

    #[test]
    fn retry_after_from_body_parameters() {
        let body = r#"{"ok":false,"error_code":429,"description":"Too Many Requests: retry after 12","parameters":{"retry_after":12}}"#;
        assert_eq!(body_retry_after(body), Some(Duration::from_secs(12)));
        assert_eq!(body_retry_after("not json"), None);
    }

    #[test]
    fn not_ok_reply_maps_to_status() {
        let body = br#"{"ok":false,"error_code":400,"description":"Bad Request: file is too big"}"#;
        let err = parse_reply::<RemoteFile>(body).unwrap_err();
        assert_eq!(err.status(), Some(400));
    }

    #[test]
    fn garbage_reply_is_protocol_error() {
        let err = parse_reply::<RemoteFile>(b"<html>").unwrap_err();
        assert!(matches!(err, BackendError::Protocol(_)));
    }
}
