//! Apparatus client
//!
//! An apparatus is an HTTP service attached to a plug or socket. It is asked
//! for extra config with `POST <endpoint>/config` and told about lifecycle
//! events with `POST <endpoint>/<event>`.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use kube::ResourceExt;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info};

#[cfg(test)]
use mockall::automock;

use integration_common::kube_utils::value_to_string;
use integration_common::Error;

use crate::bus::Topic;

/// Protocol version sent with every request
pub const APPARATUS_PROTOCOL_VERSION: &str = "1";

/// Timeout of a `/config` request
pub const CONFIG_TIMEOUT: Duration = Duration::from_secs(3);

/// Timeout of an event notification
pub const EVENT_TIMEOUT: Duration = Duration::from_secs(30);

/// Identity of an object sent alongside its body
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct ObjectMeta {
    /// Object name
    pub name: String,
    /// Object namespace
    pub namespace: String,
    /// Object UID
    pub uid: String,
}

impl ObjectMeta {
    /// Identity of a cluster object
    pub fn of<K: ResourceExt>(object: &K) -> Self {
        Self {
            name: object.name_any(),
            namespace: object.namespace().unwrap_or_default(),
            uid: object.uid().unwrap_or_default(),
        }
    }
}

/// Body of every apparatus request
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApparatusRequest {
    /// Protocol version
    pub version: String,
    /// The plug object
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plug: Option<Value>,
    /// The socket object
    #[serde(skip_serializing_if = "Option::is_none")]
    pub socket: Option<Value>,
    /// Resolved plug config
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plug_config: Option<BTreeMap<String, String>>,
    /// Resolved socket config
    #[serde(skip_serializing_if = "Option::is_none")]
    pub socket_config: Option<BTreeMap<String, String>>,
    /// Plug identity
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plug_meta: Option<ObjectMeta>,
    /// Socket identity
    #[serde(skip_serializing_if = "Option::is_none")]
    pub socket_meta: Option<ObjectMeta>,
    /// Data of the side asking for config
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<BTreeMap<String, String>>,
    /// Vars of the side asking for config
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vars: Option<BTreeMap<String, String>>,
}

impl Default for ApparatusRequest {
    fn default() -> Self {
        Self {
            version: APPARATUS_PROTOCOL_VERSION.to_string(),
            plug: None,
            socket: None,
            plug_config: None,
            socket_config: None,
            plug_meta: None,
            socket_meta: None,
            data: None,
            vars: None,
        }
    }
}

/// Client for apparatus endpoints
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Apparatus: Send + Sync {
    /// Ask the apparatus for config; values are stringified
    async fn get_config(
        &self,
        endpoint: &str,
        request: ApparatusRequest,
    ) -> Result<BTreeMap<String, String>, Error>;

    /// Notify the apparatus of a lifecycle event
    async fn notify(&self, endpoint: &str, topic: Topic, request: ApparatusRequest)
        -> Result<(), Error>;
}

/// Normalize an endpoint: assume `http://` and drop trailing slashes
pub fn normalize_endpoint(endpoint: &str) -> String {
    let trimmed = endpoint.trim().trim_end_matches('/');
    if trimmed.contains("://") {
        trimmed.to_string()
    } else {
        format!("http://{}", trimmed)
    }
}

/// Apparatus client over HTTP
pub struct HttpApparatus {
    client: reqwest::Client,
}

impl HttpApparatus {
    /// Create a client
    pub fn new() -> Result<Self, Error> {
        let client = reqwest::Client::builder()
            .connect_timeout(CONFIG_TIMEOUT)
            .build()
            .map_err(|e| Error::internal_with_context("apparatus", e.to_string()))?;
        Ok(Self { client })
    }

    /// Create a client from an existing HTTP client
    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }

    async fn post(
        &self,
        url: &str,
        request: &ApparatusRequest,
        timeout: Duration,
    ) -> Result<reqwest::Response, Error> {
        let response = self
            .client
            .post(url)
            .timeout(timeout)
            .json(request)
            .send()
            .await
            .map_err(|e| Error::apparatus(url, format!("request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::apparatus_status(url, status.as_u16(), body));
        }
        Ok(response)
    }
}

#[async_trait]
impl Apparatus for HttpApparatus {
    async fn get_config(
        &self,
        endpoint: &str,
        request: ApparatusRequest,
    ) -> Result<BTreeMap<String, String>, Error> {
        let url = format!("{}/config", normalize_endpoint(endpoint));
        debug!(url = %url, "requesting apparatus config");

        let body: Value = self
            .post(&url, &request, CONFIG_TIMEOUT)
            .await?
            .json()
            .await
            .map_err(|e| Error::apparatus(&url, format!("invalid JSON: {}", e)))?;

        match body {
            Value::Object(map) => Ok(map
                .iter()
                .map(|(k, v)| (k.clone(), value_to_string(v)))
                .collect()),
            Value::Null => Ok(BTreeMap::new()),
            _ => Err(Error::apparatus(&url, "config response is not a JSON object")),
        }
    }

    async fn notify(
        &self,
        endpoint: &str,
        topic: Topic,
        request: ApparatusRequest,
    ) -> Result<(), Error> {
        let url = format!("{}/{}", normalize_endpoint(endpoint), topic);
        self.post(&url, &request, EVENT_TIMEOUT).await?;
        info!(url = %url, event = %topic, "notified apparatus");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;
    use serde_json::json;

    #[test]
    fn test_normalize_endpoint() {
        assert_eq!(normalize_endpoint("db-apparatus:8080/"), "http://db-apparatus:8080");
        assert_eq!(normalize_endpoint("https://db.example.com"), "https://db.example.com");
        assert_eq!(normalize_endpoint("http://db//"), "http://db");
    }

    #[test]
    fn test_request_serialization_omits_empty_fields() {
        let request = ApparatusRequest {
            plug_meta: Some(ObjectMeta {
                name: "app".to_string(),
                namespace: "apps".to_string(),
                uid: "u1".to_string(),
            }),
            ..Default::default()
        };
        let body = serde_json::to_value(&request).unwrap();
        assert_eq!(
            body,
            json!({
                "version": "1",
                "plugMeta": { "name": "app", "namespace": "apps", "uid": "u1" }
            })
        );
    }

    #[tokio::test]
    async fn test_config_values_are_stringified() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/config")
            .match_body(Matcher::PartialJson(json!({ "version": "1" })))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"host":"10.0.0.5","port":5432,"tls":true}"#)
            .create_async()
            .await;

        let apparatus = HttpApparatus::new().unwrap();
        let config = apparatus
            .get_config(&format!("{}/", server.url()), ApparatusRequest::default())
            .await
            .unwrap();

        mock.assert_async().await;
        assert_eq!(config["host"], "10.0.0.5");
        assert_eq!(config["port"], "5432");
        assert_eq!(config["tls"], "true");
    }

    #[tokio::test]
    async fn test_non_success_is_an_error() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/config")
            .with_status(500)
            .with_body("boom")
            .create_async()
            .await;

        let apparatus = HttpApparatus::new().unwrap();
        let err = apparatus
            .get_config(&server.url(), ApparatusRequest::default())
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Apparatus { status: Some(500), .. }));
    }

    #[tokio::test]
    async fn test_non_object_config_is_rejected() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/config")
            .with_status(200)
            .with_body(r#"["host"]"#)
            .create_async()
            .await;

        let apparatus = HttpApparatus::new().unwrap();
        assert!(apparatus
            .get_config(&server.url(), ApparatusRequest::default())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_notify_posts_to_event_path() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/coupled")
            .match_body(Matcher::PartialJson(json!({
                "version": "1",
                "socketConfig": { "host": "10.0.0.5" }
            })))
            .with_status(204)
            .create_async()
            .await;

        let apparatus = HttpApparatus::new().unwrap();
        let request = ApparatusRequest {
            socket_config: Some(BTreeMap::from([("host".to_string(), "10.0.0.5".to_string())])),
            ..Default::default()
        };
        apparatus
            .notify(&server.url(), Topic::Coupled, request)
            .await
            .unwrap();

        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_is_an_error() {
        let apparatus = HttpApparatus::new().unwrap();
        let err = apparatus
            .notify("127.0.0.1:1", Topic::Created, ApparatusRequest::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Apparatus { status: None, .. }));
    }
}
