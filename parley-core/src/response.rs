//! JSON envelope shared by every non-streaming API response.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ApiResponse {
    pub status: String,
    pub data: Option<serde_json::Value>,
    pub error: Option<String>,
    pub version: String,
}

impl ApiResponse {
    pub fn ok(data: serde_json::Value) -> Self {
        Self {
            status: "ok".to_string(),
            data: Some(data),
            error: None,
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    pub fn err(msg: impl Into<String>) -> Self {
        Self {
            status: "error".to_string(),
            data: None,
            error: Some(msg.into()),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == "ok"
    }

    /// Body value of an ok response, or the error message.
    pub fn into_result(self) -> Result<serde_json::Value, String> {
        if self.is_ok() {
            Ok(self.data.unwrap_or(serde_json::json!({})))
        } else {
            Err(self.error.unwrap_or_else(|| "unknown error".to_string()))
        }
    }
}

impl From<ApiResponse> for serde_json::Value {
    fn from(resp: ApiResponse) -> Self {
        serde_json::json!({
            "status": resp.status,
            "data": resp.data,
            "error": resp.error,
            "version": resp.version,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ok_envelope_shape() {
        let value: serde_json::Value = ApiResponse::ok(serde_json::json!({"id": 1})).into();
        assert_eq!(value["status"], "ok");
        assert_eq!(value["data"]["id"], 1);
        assert!(value["error"].is_null());
        assert_eq!(value["version"], env!("CARGO_PKG_VERSION"));
    }

    #[test]
    fn test_into_result() {
        assert_eq!(
            ApiResponse::ok(serde_json::json!({"count": 0})).into_result().unwrap()["count"],
            0
        );
        assert_eq!(ApiResponse::err("boom").into_result().unwrap_err(), "boom");

        let mut resp = ApiResponse::err("x");
        resp.error = None;
        assert_eq!(resp.into_result().unwrap_err(), "unknown error");
    }
}
