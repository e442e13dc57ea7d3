//! OneBot v11 HTTP transport.

use std::time::Duration;

use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64_STANDARD};
use postwatch_scheduler::{MessageShape, OneBotConfig, OutgoingMessage, Transport, TransportError};
use reqwest::Client;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::debug;

/// Display name on forwarded message nodes.
const FORWARD_SENDER_NAME: &str = "postwatch";
const FORWARD_SENDER_UIN: &str = "10000";

#[derive(Debug, Deserialize)]
struct ApiResponse {
    #[serde(default)]
    status: String,
    #[serde(default)]
    retcode: i64,
    #[serde(default)]
    msg: Option<String>,
    #[serde(default)]
    wording: Option<String>,
}

/// Sends pushes through a OneBot implementation's HTTP API.
pub struct OneBotTransport {
    http: Client,
    base_url: String,
    access_token: Option<String>,
}

impl OneBotTransport {
    pub fn new(config: &OneBotConfig) -> Result<Self, TransportError> {
        let http = Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|e| TransportError::Request(e.to_string()))?;
        Ok(Self {
            http,
            base_url: config.url.trim_end_matches('/').to_string(),
            access_token: (!config.access_token.is_empty()).then(|| config.access_token.clone()),
        })
    }

    async fn call(&self, action: &str, body: Value) -> Result<(), TransportError> {
        let url = format!("{}/{}", self.base_url, action);
        let mut request = self.http.post(&url).json(&body);
        if let Some(token) = &self.access_token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| TransportError::Request(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(TransportError::Rejected {
                status: i64::from(status.as_u16()),
                message: text,
            });
        }

        let reply: ApiResponse = response
            .json()
            .await
            .map_err(|e| TransportError::Request(e.to_string()))?;
        if reply.status == "failed" || reply.retcode != 0 {
            return Err(TransportError::Rejected {
                status: reply.retcode,
                message: reply.wording.or(reply.msg).unwrap_or(reply.status),
            });
        }

        debug!(action, "onebot call succeeded");
        Ok(())
    }

    async fn send(&self, kind: ChatKind, chat_id: &str, message: &OutgoingMessage) -> Result<(), TransportError> {
        let id = chat_id_value(chat_id);
        match message.shape {
            MessageShape::Plain => {
                let (action, id_field) = match kind {
                    ChatKind::Group => ("send_group_msg", "group_id"),
                    ChatKind::Direct => ("send_private_msg", "user_id"),
                };
                self.call(action, json!({ id_field: id, "message": segments(message) }))
                    .await
            }
            MessageShape::Forward => {
                let (action, id_field) = match kind {
                    ChatKind::Group => ("send_group_forward_msg", "group_id"),
                    ChatKind::Direct => ("send_private_forward_msg", "user_id"),
                };
                self.call(action, json!({ id_field: id, "messages": forward_nodes(message) }))
                    .await
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum ChatKind {
    Group,
    Direct,
}

#[async_trait]
impl Transport for OneBotTransport {
    async fn send_group(&self, chat_id: &str, message: &OutgoingMessage) -> Result<(), TransportError> {
        self.send(ChatKind::Group, chat_id, message).await
    }

    async fn send_direct(&self, chat_id: &str, message: &OutgoingMessage) -> Result<(), TransportError> {
        self.send(ChatKind::Direct, chat_id, message).await
    }
}

/// Numeric ids go out as numbers, anything else verbatim.
fn chat_id_value(chat_id: &str) -> Value {
    chat_id
        .parse::<i64>()
        .map(Value::from)
        .unwrap_or_else(|_| Value::from(chat_id))
}

fn image_segment(image: &[u8]) -> Value {
    json!({
        "type": "image",
        "data": { "file": format!("base64://{}", BASE64_STANDARD.encode(image)) }
    })
}

fn text_segment(text: &str) -> Value {
    json!({ "type": "text", "data": { "text": text } })
}

fn segments(message: &OutgoingMessage) -> Vec<Value> {
    let mut segments = Vec::with_capacity(2);
    if !message.image.is_empty() {
        segments.push(image_segment(&message.image));
    }
    segments.push(text_segment(&message.text));
    segments
}

fn node(content: Vec<Value>) -> Value {
    json!({
        "type": "node",
        "data": {
            "name": FORWARD_SENDER_NAME,
            "uin": FORWARD_SENDER_UIN,
            "content": content
        }
    })
}

// One node for the post, one per extra link so each can be copied on its own.
fn forward_nodes(message: &OutgoingMessage) -> Vec<Value> {
    std::iter::once(node(segments(message)))
        .chain(
            message
                .aux_links
                .iter()
                .map(|link| node(vec![text_segment(link)])),
        )
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn message(shape: MessageShape, aux_links: Vec<String>) -> OutgoingMessage {
        OutgoingMessage {
            image: b"png".to_vec(),
            text: "hello".to_string(),
            aux_links,
            shape,
        }
    }

    fn transport(server: &MockServer, token: &str) -> OneBotTransport {
        OneBotTransport::new(&OneBotConfig {
            url: server.uri(),
            access_token: token.to_string(),
        })
        .unwrap()
    }

    fn ok() -> ResponseTemplate {
        ResponseTemplate::new(200).set_body_json(json!({ "status": "ok", "retcode": 0, "data": { "message_id": 1 } }))
    }

    #[tokio::test]
    async fn test_plain_group_message() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/send_group_msg"))
            .and(header("authorization", "Bearer secret"))
            .and(body_partial_json(json!({
                "group_id": 1001,
                "message": [
                    { "type": "image", "data": { "file": "base64://cG5n" } },
                    { "type": "text", "data": { "text": "hello" } }
                ]
            })))
            .respond_with(ok())
            .expect(1)
            .mount(&server)
            .await;

        transport(&server, "secret")
            .send_group("1001", &message(MessageShape::Plain, vec![]))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_forward_direct_message() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/send_private_forward_msg"))
            .and(body_partial_json(json!({ "user_id": 42 })))
            .respond_with(ok())
            .expect(1)
            .mount(&server)
            .await;

        let msg = message(MessageShape::Forward, vec!["https://cdk.linux.do/x".to_string()]);
        transport(&server, "")
            .send_direct("42", &msg)
            .await
            .unwrap();

        let requests = server.received_requests().await.unwrap();
        let body: Value = serde_json::from_slice(&requests[0].body).unwrap();
        let nodes = body["messages"].as_array().unwrap();
        assert_eq!(nodes.len(), 2);
        assert_eq!(nodes[1]["data"]["content"][0]["data"]["text"], "https://cdk.linux.do/x");
    }

    #[tokio::test]
    async fn test_failed_status_is_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/send_group_msg"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "status": "failed",
                "retcode": 1200,
                "wording": "bot is not in group"
            })))
            .mount(&server)
            .await;

        let err = transport(&server, "")
            .send_group("7", &message(MessageShape::Plain, vec![]))
            .await
            .unwrap_err();
        match err {
            TransportError::Rejected { status, message } => {
                assert_eq!(status, 1200);
                assert_eq!(message, "bot is not in group");
            }
            other => panic!("expected rejection, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_http_error_is_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401).set_body_string("unauthorized"))
            .mount(&server)
            .await;

        let err = transport(&server, "wrong")
            .send_group("7", &message(MessageShape::Plain, vec![]))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Rejected { status: 401, .. }));
    }

    #[test]
    fn test_non_numeric_chat_id_kept_as_string() {
        assert_eq!(chat_id_value("123"), json!(123));
        assert_eq!(chat_id_value("abc"), json!("abc"));
    }
}
