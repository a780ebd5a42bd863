use super::{AssistantApi, AssistantError};
use crate::config::AssistantConfig;
use anyhow::Context;
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TopicResponse {
    topic_id: Option<String>,
}

/// HTTP client for the docs assistant (`/v1/chat/topic`, `/v1/chat/message`).
///
/// The bearer credential is injected at construction; nothing is compiled in.
pub struct AssistantClient {
    http: reqwest::Client,
    api_base: String,
    api_key: String,
}

impl AssistantClient {
    pub fn new(api_base: &str, api_key: &str, timeout: Duration) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build assistant HTTP client")?;

        Ok(Self {
            http,
            api_base: api_base.trim().trim_end_matches('/').to_string(),
            api_key: api_key.trim().to_string(),
        })
    }

    pub fn from_config(config: &AssistantConfig) -> anyhow::Result<Self> {
        Self::new(
            &config.api_base,
            &config.api_key,
            Duration::from_secs(config.request_timeout_secs.max(1)),
        )
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.api_base, path.trim_start_matches('/'))
    }

    async fn failure(resp: reqwest::Response) -> AssistantError {
        let status = resp.status().as_u16();
        let body = resp
            .text()
            .await
            .unwrap_or_else(|e| format!("<failed to read response body: {e}>"));
        AssistantError::Http { status, body }
    }
}

#[async_trait]
impl AssistantApi for AssistantClient {
    async fn create_topic(&self) -> Result<String, AssistantError> {
        let resp = self
            .http
            .post(self.endpoint("v1/chat/topic"))
            .bearer_auth(&self.api_key)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(Self::failure(resp).await);
        }

        let body = resp.text().await?;
        let parsed: TopicResponse = serde_json::from_str(&body)
            .map_err(|e| AssistantError::InvalidResponse(format!("topic response: {e}")))?;

        parsed
            .topic_id
            .filter(|id| !id.trim().is_empty())
            .ok_or_else(|| AssistantError::InvalidResponse("topic response has no topicId".into()))
    }

    async fn send_message(&self, topic_id: &str, message: &str) -> Result<String, AssistantError> {
        let body = serde_json::json!({
            "topicId": topic_id,
            "message": message,
        });

        let resp = self
            .http
            .post(self.endpoint("v1/chat/message"))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(Self::failure(resp).await);
        }

        Ok(resp.text().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client_for(server: &MockServer) -> AssistantClient {
        AssistantClient::new(&server.uri(), "test-key", Duration::from_secs(5)).unwrap()
    }

    #[tokio::test]
    async fn create_topic_returns_topic_id() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/topic"))
            .and(header("authorization", "Bearer test-key"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({"topicId": "t-1"})),
            )
            .expect(1)
            .mount(&server)
            .await;

        let topic = client_for(&server).create_topic().await.unwrap();
        assert_eq!(topic, "t-1");
    }

    #[tokio::test]
    async fn create_topic_maps_non_success_to_http_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/topic"))
            .respond_with(ResponseTemplate::new(401).set_body_string("bad key"))
            .mount(&server)
            .await;

        let err = client_for(&server).create_topic().await.unwrap_err();
        match err {
            AssistantError::Http { status, body } => {
                assert_eq!(status, 401);
                assert_eq!(body, "bad key");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn create_topic_without_id_is_invalid_response() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/topic"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({})))
            .mount(&server)
            .await;

        let err = client_for(&server).create_topic().await.unwrap_err();
        assert!(matches!(err, AssistantError::InvalidResponse(_)));
    }

    #[tokio::test]
    async fn send_message_posts_json_and_returns_raw_text() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/message"))
            .and(header("authorization", "Bearer test-key"))
            .and(body_json(
                serde_json::json!({"topicId": "t-1", "message": "How do I log in?"}),
            ))
            .respond_with(
                ResponseTemplate::new(200).set_body_string(r#"Use SSO.||[{"link":"auth/sso"}]"#),
            )
            .expect(1)
            .mount(&server)
            .await;

        let raw = client_for(&server)
            .send_message("t-1", "How do I log in?")
            .await
            .unwrap();
        assert_eq!(raw, r#"Use SSO.||[{"link":"auth/sso"}]"#);
    }

    #[tokio::test]
    async fn send_message_failure_carries_status_and_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/message"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .mount(&server)
            .await;

        let err = client_for(&server)
            .send_message("t-1", "hi")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            AssistantError::Http { status: 500, ref body } if body == "boom"
        ));
    }

    #[test]
    fn endpoint_tolerates_trailing_slash_in_base() {
        let client =
            AssistantClient::new("https://api.example.com/", "k", Duration::from_secs(1)).unwrap();
        assert_eq!(
            client.endpoint("/v1/chat/topic"),
            "https://api.example.com/v1/chat/topic"
        );
    }
}
