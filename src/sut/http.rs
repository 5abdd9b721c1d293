use super::{AuthSession, ChatApi, Credentials, NewRoom, RoomId, RoomInfo, RoomListing};
use crate::error::ApiError;
use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder};
use serde_json::{json, Value};
use std::time::Duration;
use tracing::debug;

/// Room creation runs under a longer deadline than the other calls.
const ROOM_CREATE_TIMEOUT: Duration = Duration::from_secs(10);

/// REST client for the chat service.
pub struct HttpChatApi {
    client: Client,
    base_url: String,
}

impl HttpChatApi {
    /// Create a client rooted at `base_url` with a per-request timeout.
    pub fn new(base_url: &str, request_timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(request_timeout)
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Attach the per-user auth headers.
    fn user_request(&self, builder: RequestBuilder, session: &AuthSession) -> RequestBuilder {
        builder
            .header("x-auth-token", &session.token)
            .header("x-session-id", &session.session_id)
            .header("Content-Type", "application/json")
    }

    async fn execute(builder: RequestBuilder) -> Result<Value, ApiError> {
        let response = builder.send().await.map_err(map_reqwest_error)?;
        let status = response.status();
        let body = response.bytes().await.map_err(map_reqwest_error)?;

        if !status.is_success() {
            let text = String::from_utf8_lossy(&body);
            return Err(ApiError::Status {
                status: status.as_u16(),
                message: error_message(&text),
            });
        }

        if body.is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_slice(&body).map_err(|e| ApiError::Decode(e.to_string()))
    }
}

fn map_reqwest_error(err: reqwest::Error) -> ApiError {
    if err.is_timeout() {
        ApiError::Timeout
    } else {
        ApiError::Transport(err.to_string())
    }
}

/// Pull the `message` field out of an error body, or fall back to the text.
fn error_message(body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .as_ref()
        .and_then(|v| v.get("message"))
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| body.chars().take(200).collect())
}

fn parse_session(body: &Value) -> Result<AuthSession, ApiError> {
    let token = body
        .get("token")
        .and_then(Value::as_str)
        .ok_or_else(|| ApiError::Decode("login response has no token".into()))?;

    Ok(AuthSession {
        token: token.to_string(),
        session_id: body
            .get("sessionId")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        user_name: body
            .pointer("/user/name")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
    })
}

fn parse_created_room(body: &Value) -> Result<RoomId, ApiError> {
    body.pointer("/data/_id")
        .or_else(|| body.get("_id"))
        .and_then(Value::as_str)
        .map(RoomId::from)
        .ok_or_else(|| ApiError::Decode("room creation response has no id".into()))
}

fn parse_room_info(room: &RoomId, body: &Value) -> RoomInfo {
    let name = body
        .pointer("/data/name")
        .or_else(|| body.get("name"))
        .and_then(Value::as_str)
        .map(str::to_string);
    RoomInfo {
        id: room.clone(),
        name,
    }
}

#[async_trait]
impl ChatApi for HttpChatApi {
    async fn login(&self, credentials: &Credentials) -> Result<AuthSession, ApiError> {
        let request = self.client.post(self.url("/api/auth/login")).json(&json!({
            "email": credentials.email,
            "password": credentials.password,
        }));
        let body = Self::execute(request).await?;
        parse_session(&body)
    }

    async fn register(&self, credentials: &Credentials) -> Result<(), ApiError> {
        let request = self
            .client
            .post(self.url("/api/auth/register"))
            .json(credentials);
        Self::execute(request).await?;
        Ok(())
    }

    async fn list_rooms(
        &self,
        admin: &AuthSession,
        page: u32,
        page_size: u32,
    ) -> Result<RoomListing, ApiError> {
        let request = self
            .client
            .get(self.url("/api/rooms"))
            .bearer_auth(&admin.token)
            .query(&[("page", page), ("pageSize", page_size)]);
        let body = Self::execute(request).await?;
        Ok(RoomListing {
            total: body
                .pointer("/metadata/total")
                .and_then(Value::as_u64)
                .unwrap_or(0),
        })
    }

    async fn create_room(&self, admin: &AuthSession, room: &NewRoom) -> Result<RoomId, ApiError> {
        let request = self
            .client
            .post(self.url("/api/rooms"))
            .bearer_auth(&admin.token)
            .timeout(ROOM_CREATE_TIMEOUT)
            .json(&json!({
                "name": room.name,
                "description": room.description,
                "participants": [],
            }));
        let body = Self::execute(request).await?;
        let id = parse_created_room(&body)?;
        debug!("Created room {} ({})", id, room.name);
        Ok(id)
    }

    async fn join_room(&self, session: &AuthSession, room: &RoomId) -> Result<(), ApiError> {
        let path = format!("/api/rooms/{}/join", room);
        let request = self
            .user_request(self.client.post(self.url(&path)), session)
            .json(&json!({}));
        Self::execute(request).await?;
        Ok(())
    }

    async fn room_info(&self, session: &AuthSession, room: &RoomId) -> Result<RoomInfo, ApiError> {
        let path = format!("/api/rooms/{}", room);
        let request = self.user_request(self.client.get(self.url(&path)), session);
        let body = Self::execute(request).await?;
        Ok(parse_room_info(room, &body))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_session() {
        let body = json!({
            "success": true,
            "token": "jwt",
            "sessionId": "s-1",
            "user": { "_id": "u1", "name": "RampUp User abc" }
        });
        let session = parse_session(&body).unwrap();
        assert_eq!(session.token, "jwt");
        assert_eq!(session.session_id, "s-1");
        assert_eq!(session.user_name, "RampUp User abc");

        assert!(matches!(
            parse_session(&json!({ "success": false })),
            Err(ApiError::Decode(_))
        ));
    }

    #[test]
    fn test_parse_created_room() {
        let nested = json!({ "success": true, "data": { "_id": "room-9", "name": "x" } });
        assert_eq!(parse_created_room(&nested).unwrap(), RoomId::from("room-9"));

        let flat = json!({ "_id": "room-10" });
        assert_eq!(parse_created_room(&flat).unwrap(), RoomId::from("room-10"));

        assert!(parse_created_room(&json!({})).is_err());
    }

    #[test]
    fn test_parse_room_info_name_is_optional() {
        let room = RoomId::from("r");
        assert_eq!(
            parse_room_info(&room, &json!({ "data": { "name": "Lobby" } })).name,
            Some("Lobby".to_string())
        );
        assert_eq!(parse_room_info(&room, &Value::Null).name, None);
    }

    #[test]
    fn test_error_message_extraction() {
        assert_eq!(error_message(r#"{"message":"Invalid token"}"#), "Invalid token");
        assert_eq!(error_message("Bad Gateway"), "Bad Gateway");
    }

    #[test]
    fn test_base_url_trailing_slash_is_trimmed() {
        let api = HttpChatApi::new("http://localhost:5001/", Duration::from_secs(5)).unwrap();
        assert_eq!(api.url("/api/rooms"), "http://localhost:5001/api/rooms");
    }
}
