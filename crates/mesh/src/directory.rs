//! Room directory: the HTTP service that creates and looks up room codes
//!
//! Every endpoint answers with the same envelope,
//! `{"success": bool, "data"?: T, "error"?: string, "message"?: string}`.

use crate::room_code::RoomCode;
use crate::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, instrument, warn};

/// Request timeout for directory calls
const REQUEST_TIMEOUT_SECS: u64 = 10;

/// A room as stored by the directory
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Meeting {
    /// Directory id (used for deletion)
    pub id: String,
    /// Room code participants type in
    pub meeting_code: String,
    /// Account that created the room
    pub created_by_id: String,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Expiry time
    pub expires_at: DateTime<Utc>,
    /// Whether the room can still be joined
    pub is_active: bool,
}

impl Meeting {
    /// Whether the room can be joined at `now`
    pub fn is_joinable(&self, now: DateTime<Utc>) -> bool {
        self.is_active && self.expires_at > now
    }
}

/// Response envelope shared by every endpoint
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(bound(deserialize = "T: Deserialize<'de>"))]
pub struct ApiResponse<T> {
    /// Whether the call succeeded
    pub success: bool,
    /// Payload
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    /// Failure description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Informational message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl<T> ApiResponse<T> {
    /// Unwrap the envelope into its payload
    ///
    /// # Errors
    ///
    /// `Error::RoomService` carrying the server's error text when `success`
    /// is false or the payload is missing.
    pub fn into_data(self, what: &str) -> Result<T> {
        if !self.success {
            return Err(Error::RoomService(
                self.error
                    .unwrap_or_else(|| format!("Failed to {}", what)),
            ));
        }
        self.data
            .ok_or_else(|| Error::RoomService(format!("Empty response to {}", what)))
    }
}

/// Operations on the room directory
#[async_trait]
pub trait RoomDirectory: Send + Sync {
    /// Create a new room owned by the caller
    async fn create_room(&self) -> Result<Meeting>;

    /// Look a room up by code
    ///
    /// Returns `Error::RoomNotFound` when the directory does not know it.
    async fn get_room(&self, code: &RoomCode) -> Result<Meeting>;

    /// Rooms created by the caller
    async fn list_rooms(&self) -> Result<Vec<Meeting>>;

    /// Delete a room by directory id
    async fn delete_room(&self, id: &str) -> Result<()>;
}

/// Caller credentials attached to directory requests
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credentials {
    /// Anonymous
    None,
    /// Session cookie, sent verbatim in the `Cookie` header
    Cookie(String),
    /// Bearer token
    Bearer(String),
}

/// Directory client over HTTP
#[derive(Clone)]
pub struct HttpRoomDirectory {
    client: Client,
    base_url: String,
    credentials: Credentials,
}

impl HttpRoomDirectory {
    /// Create a client for the directory at `base_url`
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidConfig` for a non-HTTP URL, or
    /// `Error::RoomService` if the HTTP client cannot be built.
    pub fn new(base_url: &str, credentials: Credentials) -> Result<Self> {
        let parsed = url::Url::parse(base_url)
            .map_err(|e| Error::InvalidConfig(format!("Invalid room service URL: {}", e)))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(Error::InvalidConfig(format!(
                "Room service URL must be http(s), got {}",
                parsed.scheme()
            )));
        }

        let client = Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .connect_timeout(Duration::from_secs(5))
            .build()
            .map_err(|e| Error::RoomService(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            credentials,
        })
    }

    /// Base URL without trailing slash
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/api/meetings{}", self.base_url, path)
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.credentials {
            Credentials::None => request,
            Credentials::Cookie(cookie) => request.header(reqwest::header::COOKIE, cookie),
            Credentials::Bearer(token) => request.bearer_auth(token),
        }
    }

    async fn call<T: DeserializeOwned>(&self, request: RequestBuilder, what: &str) -> Result<ApiResponse<T>> {
        let response = self.authorize(request).send().await.map_err(|e| {
            warn!(error = %e, "Room service request failed");
            Error::RoomService(format!("Room service unavailable: {}", e))
        })?;

        let status = response.status();
        let body = response.text().await.map_err(|e| {
            Error::RoomService(format!("Failed to read room service response: {}", e))
        })?;
        debug!(status = %status, "Room service answered {}", what);

        parse_envelope(status, &body, what)
    }
}

/// Interpret a directory response body
///
/// Error statuses with an unreadable body still produce an envelope so the
/// caller sees a uniform failure.
fn parse_envelope<T: DeserializeOwned>(status: StatusCode, body: &str, what: &str) -> Result<ApiResponse<T>> {
    match serde_json::from_str::<ApiResponse<T>>(body) {
        Ok(mut envelope) => {
            if !status.is_success() {
                envelope.success = false;
                envelope.data = None;
                if envelope.error.is_none() {
                    envelope.error = Some(format!("Failed to {} ({})", what, status));
                }
            }
            Ok(envelope)
        }
        Err(_) if !status.is_success() => Ok(ApiResponse {
            success: false,
            data: None,
            error: Some(format!("Failed to {} ({})", what, status)),
            message: None,
        }),
        Err(e) => Err(Error::SerializationError(format!(
            "Invalid room service response: {}",
            e
        ))),
    }
}

#[async_trait]
impl RoomDirectory for HttpRoomDirectory {
    #[instrument(skip(self))]
    async fn create_room(&self) -> Result<Meeting> {
        let request = self.client.post(self.endpoint("/create")).json(&serde_json::json!({}));
        self.call::<Meeting>(request, "create meeting")
            .await?
            .into_data("create meeting")
    }

    #[instrument(skip_all, fields(code = %code))]
    async fn get_room(&self, code: &RoomCode) -> Result<Meeting> {
        let request = self.client.get(self.endpoint(&format!("/{}", code)));
        let envelope = self.call::<Meeting>(request, "fetch meeting").await?;
        if !envelope.success {
            debug!("Room {} unknown: {:?}", code, envelope.error);
            return Err(Error::RoomNotFound(code.to_string()));
        }
        envelope.into_data("fetch meeting")
    }

    #[instrument(skip(self))]
    async fn list_rooms(&self) -> Result<Vec<Meeting>> {
        let request = self.client.get(self.endpoint(""));
        self.call::<Vec<Meeting>>(request, "fetch meetings")
            .await?
            .into_data("fetch meetings")
    }

    #[instrument(skip(self))]
    async fn delete_room(&self, id: &str) -> Result<()> {
        let request = self.client.delete(self.endpoint(&format!("/{}", id)));
        let envelope = self
            .call::<serde_json::Value>(request, "delete meeting")
            .await?;
        if envelope.success {
            Ok(())
        } else {
            Err(Error::RoomService(
                envelope
                    .error
                    .unwrap_or_else(|| "Failed to delete meeting".to_string()),
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MEETING: &str = r#"{
        "success": true,
        "data": {
            "id": "m-1",
            "meetingCode": "abc-1234-xyz",
            "createdById": "u-1",
            "createdAt": "2024-05-01T10:00:00Z",
            "expiresAt": "2024-05-02T10:00:00Z",
            "isActive": true
        }
    }"#;

    #[test]
    fn test_parse_meeting_envelope() {
        let envelope: ApiResponse<Meeting> =
            parse_envelope(StatusCode::OK, MEETING, "fetch meeting").unwrap();
        let meeting = envelope.into_data("fetch meeting").unwrap();

        assert_eq!(meeting.meeting_code, "abc-1234-xyz");
        assert!(meeting.is_active);
        let before_expiry = "2024-05-01T12:00:00Z".parse().unwrap();
        let after_expiry = "2024-05-03T00:00:00Z".parse().unwrap();
        assert!(meeting.is_joinable(before_expiry));
        assert!(!meeting.is_joinable(after_expiry));
    }

    #[test]
    fn test_error_status_keeps_server_message() {
        let body = r#"{"success": false, "error": "Meeting not found"}"#;
        let envelope: ApiResponse<Meeting> =
            parse_envelope(StatusCode::NOT_FOUND, body, "fetch meeting").unwrap();

        assert!(!envelope.success);
        match envelope.into_data("fetch meeting") {
            Err(Error::RoomService(msg)) => assert_eq!(msg, "Meeting not found"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_error_status_with_html_body() {
        let envelope: ApiResponse<Meeting> =
            parse_envelope(StatusCode::BAD_GATEWAY, "<html>", "fetch meeting").unwrap();
        assert!(!envelope.success);
        assert!(envelope.error.unwrap().contains("502"));
    }

    #[test]
    fn test_garbage_success_body_is_an_error() {
        let result: Result<ApiResponse<Meeting>> =
            parse_envelope(StatusCode::OK, "not json", "fetch meeting");
        assert!(matches!(result, Err(Error::SerializationError(_))));
    }

    #[test]
    fn test_endpoints() {
        let dir = HttpRoomDirectory::new("https://api.example.com/", Credentials::None).unwrap();
        assert_eq!(dir.base_url(), "https://api.example.com");
        assert_eq!(dir.endpoint("/create"), "https://api.example.com/api/meetings/create");
        assert_eq!(dir.endpoint(""), "https://api.example.com/api/meetings");
    }

    #[test]
    fn test_rejects_non_http_url() {
        assert!(matches!(
            HttpRoomDirectory::new("ws://api.example.com", Credentials::None),
            Err(Error::InvalidConfig(_))
        ));
    }
}
