use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures_util::StreamExt;

use super::public::CompareRequest;
use crate::compare::catalog::ModelCatalogEntry;

pub type ByteStream = BoxStream<'static, Result<Vec<u8>, BackendError>>;

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("backend responded with {status}: {body}")]
    Status { status: u16, body: String },
    #[error("unexpected response body: {0}")]
    Body(String),
}

/// Everything the comparison core needs from the service that owns
/// model invocation and remote session state.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    /// The model catalog, in display order.
    async fn models(&self) -> Result<Vec<ModelCatalogEntry>, BackendError>;

    /// Open a `text/event-stream` response for one prompt. Only the
    /// status is checked here, the body is returned unread.
    async fn compare(&self, request: &CompareRequest) -> Result<ByteStream, BackendError>;

    /// Tear down the remote context for a session.
    async fn delete_session(&self, chat_id: &str) -> Result<(), BackendError>;

    /// Reset the remote transcript for a session.
    async fn clear_session(&self, chat_id: &str) -> Result<(), BackendError>;

    /// Bind a remote context to `model` by sending an empty prompt and
    /// draining whatever comes back.
    async fn init_session(
        &self,
        chat_id: &str,
        model: &str,
        system_prompt: Option<&str>,
    ) -> Result<(), BackendError> {
        let request = CompareRequest::init(chat_id, model, system_prompt);
        let mut stream = self.compare(&request).await?;
        while let Some(chunk) = stream.next().await {
            chunk?;
        }
        Ok(())
    }
}

/// `ChatBackend` over HTTP.
#[derive(Clone, Debug)]
pub struct HttpBackend {
    client: reqwest::Client,
    base_url: String,
}

impl HttpBackend {
    pub fn new(base_url: &str) -> Result<Self, BackendError> {
        // No overall timeout, streams stay open for as long as the model
        // keeps generating. Idle streams are handled by the dispatcher.
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn ensure_success(response: reqwest::Response) -> Result<reqwest::Response, BackendError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(BackendError::Status {
            status: status.as_u16(),
            body,
        })
    }
}

#[async_trait]
impl ChatBackend for HttpBackend {
    async fn models(&self) -> Result<Vec<ModelCatalogEntry>, BackendError> {
        let response = self
            .client
            .get(self.url("/api/models"))
            .header("Content-Type", "application/json")
            .send()
            .await?;
        let body = Self::ensure_success(response).await?.text().await?;
        serde_json::from_str(&body).map_err(|e| {
            tracing::error!("Parsing model catalog failed for {}\nError:{}", body, e);
            BackendError::Body(e.to_string())
        })
    }

    async fn compare(&self, request: &CompareRequest) -> Result<ByteStream, BackendError> {
        tracing::debug!(
            "Opening stream for chat {} with model {}",
            request.chat_id,
            request.model
        );
        let response = self
            .client
            .post(self.url("/api/chat/compare"))
            .header("Content-Type", "application/json")
            .header("Accept", "text/event-stream")
            .json(request)
            .send()
            .await?;
        let response = Self::ensure_success(response).await?;

        let stream = response
            .bytes_stream()
            .map(|chunk| chunk.map(|bytes| bytes.to_vec()).map_err(BackendError::from));
        Ok(stream.boxed())
    }

    async fn delete_session(&self, chat_id: &str) -> Result<(), BackendError> {
        let response = self
            .client
            .delete(self.url(&format!("/api/chat/{}", chat_id)))
            .send()
            .await?;
        Self::ensure_success(response).await?;
        Ok(())
    }

    async fn clear_session(&self, chat_id: &str) -> Result<(), BackendError> {
        let response = self
            .client
            .post(self.url(&format!("/api/chat/{}/clear", chat_id)))
            .send()
            .await?;
        Self::ensure_success(response).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;
    use serde_json::json;

    #[tokio::test]
    async fn test_models() {
        let mut server = mockito::Server::new_async().await;

        let response_body = r#"[{
            "id": "anthropic.claude-3-haiku-20240307-v1:0",
            "name": "Claude 3 Haiku",
            "provider": "anthropic",
            "provider_name": "Anthropic",
            "icon_url": "",
            "provider_icon_url": "",
            "capabilities": {"text": true, "image": true, "code": false}
        }]"#;

        let mock = server
            .mock("GET", "/api/models")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(response_body)
            .create_async()
            .await;

        let backend = HttpBackend::new(&server.url()).unwrap();
        let models = backend.models().await.unwrap();

        mock.assert_async().await;
        assert_eq!(models.len(), 1);
        assert_eq!(models[0].name, "Claude 3 Haiku");
        assert!(models[0].capabilities.image);
    }

    #[tokio::test]
    async fn test_models_bad_body() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/api/models")
            .with_status(200)
            .with_body(r#"{"error": "Internal Server Error"}"#)
            .create_async()
            .await;

        let backend = HttpBackend::new(&server.url()).unwrap();
        let result = backend.models().await;
        assert!(matches!(result, Err(BackendError::Body(_))));
    }

    #[tokio::test]
    async fn test_compare_streams_body() {
        let mut server = mockito::Server::new_async().await;

        let sse_response = r#"data: {"chunk": "Hello", "chatId": "abc"}

data: {"chunk": " World", "chatId": "abc"}

"#;

        let mock = server
            .mock("POST", "/api/chat/compare")
            .match_header("accept", "text/event-stream")
            .match_body(Matcher::PartialJson(json!({
                "prompt": "Say hello",
                "model": "gpt",
                "chatId": "abc",
                "image": null
            })))
            .with_status(200)
            .with_header("content-type", "text/event-stream")
            .with_body(sse_response)
            .create_async()
            .await;

        let backend = HttpBackend::new(&server.url()).unwrap();
        let request = CompareRequest::new("Say hello", None, "gpt", "abc", None);
        let mut stream = backend.compare(&request).await.unwrap();

        let mut body = Vec::new();
        while let Some(chunk) = stream.next().await {
            body.extend(chunk.unwrap());
        }

        mock.assert_async().await;
        assert_eq!(String::from_utf8(body).unwrap(), sse_response);
    }

    #[tokio::test]
    async fn test_compare_non_success_status() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/api/chat/compare")
            .with_status(500)
            .with_body(r#"{"detail": "boom"}"#)
            .create_async()
            .await;

        let backend = HttpBackend::new(&server.url()).unwrap();
        let request = CompareRequest::new("Hi", None, "gpt", "abc", None);
        match backend.compare(&request).await {
            Err(BackendError::Status { status, body }) => {
                assert_eq!(status, 500);
                assert!(body.contains("boom"));
            }
            Err(e) => panic!("Expected status error, got {}", e),
            Ok(_) => panic!("Expected status error"),
        }
    }

    #[tokio::test]
    async fn test_init_session_sends_empty_prompt() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/api/chat/compare")
            .match_body(Matcher::PartialJson(json!({
                "prompt": "",
                "model": "gpt",
                "chatId": "abc",
                "system_prompt": "Be brief"
            })))
            .with_status(200)
            .with_body("data: {\"chunk\": \"\", \"chatId\": \"abc\"}\n\n")
            .create_async()
            .await;

        let backend = HttpBackend::new(&server.url()).unwrap();
        backend
            .init_session("abc", "gpt", Some("Be brief"))
            .await
            .unwrap();
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_delete_and_clear() {
        let mut server = mockito::Server::new_async().await;
        let delete = server
            .mock("DELETE", "/api/chat/abc")
            .with_status(200)
            .with_body(r#"{"status": "success"}"#)
            .create_async()
            .await;
        let clear = server
            .mock("POST", "/api/chat/abc/clear")
            .with_status(200)
            .with_body(r#"{"status": "success"}"#)
            .create_async()
            .await;

        let backend = HttpBackend::new(&format!("{}/", server.url())).unwrap();
        backend.delete_session("abc").await.unwrap();
        backend.clear_session("abc").await.unwrap();

        delete.assert_async().await;
        clear.assert_async().await;
    }

    #[tokio::test]
    async fn test_clear_failure_is_reported() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/api/chat/abc/clear")
            .with_status(404)
            .create_async()
            .await;

        let backend = HttpBackend::new(&server.url()).unwrap();
        let result = backend.clear_session("abc").await;
        assert!(matches!(result, Err(BackendError::Status { status: 404, .. })));
    }
}
