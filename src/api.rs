//! Backend contract for device and order state.
//!
//! The orchestrator only sees [`DeviceApi`]. With the `http` feature enabled,
//! [`HttpDeviceApi`] implements it over the JSON REST backend.

use async_trait::async_trait;
use serde::Deserialize;

use crate::{
    error::{BridgeError, Result},
    types::{DeviceStatusReport, HandshakePurpose, OrderState, OrderTicket},
};

/// Device and order operations the orchestrator depends on
#[async_trait]
pub trait DeviceApi: Send + Sync {
    /// Current cellular reachability and BLE address of a device
    async fn device_status(&self, device_no: &str) -> Result<DeviceStatusReport>;

    /// Ask the backend to start the device over cellular
    async fn start_consumption(&self, device_no: &str) -> Result<OrderTicket>;

    /// Ask the backend to stop the device over cellular
    async fn stop_consumption(&self, device_no: &str, order_id: Option<&str>)
        -> Result<OrderTicket>;

    /// State of an order
    async fn order_status(&self, order_id: &str) -> Result<OrderState>;

    /// Next queued notice for the module, or `None` once none remain
    ///
    /// `ack` carries the module's reply to the previous notice, as hex.
    async fn pending_notice(&self, device_no: &str, ack: Option<&str>) -> Result<Option<String>>;

    /// Fresh challenge payload for a handshake
    async fn random_challenge(&self, device_no: &str, purpose: HandshakePurpose)
        -> Result<String>;
}

/// Response wrapper used by every backend endpoint
#[derive(Debug, Clone, Deserialize)]
pub struct ApiEnvelope<T> {
    /// Business status code; `0` and `200` mean success
    #[serde(default)]
    pub code: i64,
    /// Message for the user
    #[serde(default)]
    pub message: Option<String>,
    /// Payload
    pub data: Option<T>,
    /// Explicit success flag, when the endpoint sends one
    #[serde(default)]
    pub success: Option<bool>,
}

impl<T> ApiEnvelope<T> {
    /// Whether the backend accepted the request
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self.code, 0 | 200) && self.success != Some(false)
    }

    /// Unwrap the payload
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::Business`] when the backend rejected the request.
    pub fn into_data(self) -> Result<Option<T>> {
        if self.is_success() {
            return Ok(self.data);
        }
        Err(BridgeError::Business {
            code: self.code,
            message: self
                .message
                .unwrap_or_else(|| "Request failed".to_string()),
        })
    }

    /// Unwrap a payload that must be present
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::Business`] when the backend rejected the request
    /// or sent no payload.
    pub fn into_required(self) -> Result<T> {
        let code = self.code;
        self.into_data()?.ok_or_else(|| BridgeError::Business {
            code,
            message: "Response carried no data".to_string(),
        })
    }
}

#[cfg(feature = "http")]
pub use http::HttpDeviceApi;

#[cfg(feature = "http")]
mod http {
    use async_trait::async_trait;
    use reqwest::{Client, RequestBuilder};
    use serde::{de::DeserializeOwned, Deserialize, Serialize};
    use std::time::Duration;
    use tracing::{debug, warn};

    use super::{ApiEnvelope, DeviceApi};
    use crate::{
        config::ApiConfig,
        error::Result,
        types::{DeviceStatusReport, HandshakePurpose, OrderState, OrderTicket},
    };

    #[derive(Serialize)]
    #[serde(rename_all = "camelCase")]
    struct ConsumeRequest<'a> {
        device_no: &'a str,
        #[serde(skip_serializing_if = "Option::is_none")]
        order_id: Option<&'a str>,
    }

    #[derive(Serialize)]
    #[serde(rename_all = "camelCase")]
    struct NoticeRequest<'a> {
        device_no: &'a str,
        #[serde(skip_serializing_if = "Option::is_none")]
        ack: Option<&'a str>,
    }

    #[derive(Deserialize)]
    #[serde(rename_all = "camelCase")]
    struct OrderStatusBody {
        state: OrderState,
    }

    #[derive(Deserialize)]
    #[serde(rename_all = "camelCase")]
    struct PayloadBody {
        payload: String,
    }

    /// [`DeviceApi`] over the JSON REST backend
    #[derive(Debug, Clone)]
    pub struct HttpDeviceApi {
        client: Client,
        base_url: String,
        token: Option<String>,
    }

    impl HttpDeviceApi {
        /// Build a client from configuration
        ///
        /// # Errors
        ///
        /// Returns [`crate::BridgeError::Http`] if the HTTP client cannot be
        /// built.
        pub fn new(config: &ApiConfig) -> Result<Self> {
            let client = Client::builder()
                .timeout(Duration::from_millis(config.request_timeout_ms))
                .build()?;

            Ok(Self {
                client,
                base_url: config.base_url.trim_end_matches('/').to_string(),
                token: config.token.clone(),
            })
        }

        /// Replace the bearer token, e.g. after a fresh login
        #[must_use]
        pub fn with_token(mut self, token: impl Into<String>) -> Self {
            self.token = Some(token.into());
            self
        }

        fn url(&self, path: &str) -> String {
            format!("{}{}", self.base_url, path)
        }

        async fn send<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<ApiEnvelope<T>> {
            let request = match &self.token {
                Some(token) => request.bearer_auth(token),
                None => request,
            };

            let response = request.send().await?.error_for_status()?;
            let envelope: ApiEnvelope<T> = response.json().await?;

            if !envelope.is_success() {
                warn!(
                    "Backend rejected request ({}): {}",
                    envelope.code,
                    envelope.message.as_deref().unwrap_or("no message")
                );
            }
            Ok(envelope)
        }
    }

    #[async_trait]
    impl DeviceApi for HttpDeviceApi {
        async fn device_status(&self, device_no: &str) -> Result<DeviceStatusReport> {
            debug!("Querying status of device {}", device_no);
            let request = self.client.get(self.url(&format!("/device/status/{device_no}")));
            self.send(request).await?.into_required()
        }

        async fn start_consumption(&self, device_no: &str) -> Result<OrderTicket> {
            let body = ConsumeRequest {
                device_no,
                order_id: None,
            };
            let request = self.client.post(self.url("/consume/start")).json(&body);
            self.send(request).await?.into_required()
        }

        async fn stop_consumption(
            &self,
            device_no: &str,
            order_id: Option<&str>,
        ) -> Result<OrderTicket> {
            let body = ConsumeRequest {
                device_no,
                order_id,
            };
            let request = self.client.post(self.url("/consume/stop")).json(&body);
            self.send(request).await?.into_required()
        }

        async fn order_status(&self, order_id: &str) -> Result<OrderState> {
            let request = self.client.get(self.url(&format!("/order/status/{order_id}")));
            let body: OrderStatusBody = self.send(request).await?.into_required()?;
            Ok(body.state)
        }

        async fn pending_notice(
            &self,
            device_no: &str,
            ack: Option<&str>,
        ) -> Result<Option<String>> {
            let body = NoticeRequest { device_no, ack };
            let request = self.client.post(self.url("/device/notice")).json(&body);
            let notice: Option<PayloadBody> = self.send(request).await?.into_data()?;
            Ok(notice
                .map(|n| n.payload)
                .filter(|payload| !payload.is_empty()))
        }

        async fn random_challenge(
            &self,
            device_no: &str,
            purpose: HandshakePurpose,
        ) -> Result<String> {
            let request = self
                .client
                .get(self.url(&format!("/device/random/{device_no}")))
                .query(&[("purpose", purpose.to_string())]);
            let body: PayloadBody = self.send(request).await?.into_required()?;
            Ok(body.payload)
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn test_client_from_config() {
            let config = ApiConfig {
                base_url: "https://wash.example.net/api/".to_string(),
                ..ApiConfig::default()
            };
            let api = HttpDeviceApi::new(&config).unwrap().with_token("abc");
            assert_eq!(api.url("/order/status/42"), "https://wash.example.net/api/order/status/42");
            assert_eq!(api.token.as_deref(), Some("abc"));
        }

        #[test]
        fn test_request_bodies() {
            let body = ConsumeRequest {
                device_no: "D-1001",
                order_id: None,
            };
            assert_eq!(serde_json::to_string(&body).unwrap(), r#"{"deviceNo":"D-1001"}"#);

            let body = NoticeRequest {
                device_no: "D-1001",
                ack: Some("7b7d01e1207d"),
            };
            assert_eq!(
                serde_json::to_string(&body).unwrap(),
                r#"{"deviceNo":"D-1001","ack":"7b7d01e1207d"}"#
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DeviceReachability;

    #[test]
    fn test_envelope_success() {
        let envelope: ApiEnvelope<DeviceStatusReport> = serde_json::from_str(
            r#"{"code":200,"message":"ok","data":{"state":1,"mac":"A1B2C3D4E5F6"},"success":true}"#,
        )
        .unwrap();
        assert!(envelope.is_success());

        let report = envelope.into_required().unwrap();
        assert_eq!(report.state, DeviceReachability::Reachable);
    }

    #[test]
    fn test_envelope_business_error() {
        let envelope: ApiEnvelope<OrderTicket> =
            serde_json::from_str(r#"{"code":401,"message":"login expired","success":false}"#)
                .unwrap();
        assert!(!envelope.is_success());

        let err = envelope.into_data().unwrap_err();
        assert!(err.is_auth_error());
        assert_eq!(err.user_message(), "login expired");
    }

    #[test]
    fn test_envelope_success_flag_overrides_code() {
        let envelope: ApiEnvelope<OrderTicket> =
            serde_json::from_str(r#"{"code":0,"message":"device busy","success":false}"#).unwrap();
        assert!(matches!(
            envelope.into_data(),
            Err(BridgeError::Business { code: 0, .. })
        ));
    }

    #[test]
    fn test_envelope_missing_data() {
        let envelope: ApiEnvelope<OrderTicket> = serde_json::from_str(r#"{"code":0}"#).unwrap();
        assert!(envelope.into_data().unwrap().is_none());

        let envelope: ApiEnvelope<OrderTicket> = serde_json::from_str(r#"{"code":0}"#).unwrap();
        assert!(envelope.into_required().is_err());
    }
}
