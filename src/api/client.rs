// 媒体平台客户端实现

use crate::api::types::{
    ApiEnvelope, FinalizeData, FinalizeRequest, InitiateRequest, InitiateResponse,
};
use crate::api::SessionApi;
use crate::config::ApiConfig;
use crate::error::ApiError;
use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, info};

/// 媒体平台客户端
#[derive(Debug, Clone)]
pub struct MediaApiClient {
    /// HTTP客户端
    client: Client,
    /// 接口配置
    config: ApiConfig,
}

impl MediaApiClient {
    /// 创建新的客户端
    pub fn new(config: &ApiConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.request_timeout())
            .build()
            .context("Failed to create HTTP client")?;

        info!("初始化媒体平台客户端: base_url={}", config.base_url);

        Ok(Self::with_client(client, config))
    }

    pub fn with_client(client: Client, config: &ApiConfig) -> Self {
        Self {
            client,
            config: config.clone(),
        }
    }

    /// POST JSON 并解析 `{success, message?, data?}` 响应
    async fn post_json<B, T>(&self, path: &str, body: &B) -> Result<T, ApiError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let url = self.config.endpoint(path);
        let mut request = self.client.post(&url).json(body);
        if let Some(api_key) = &self.config.api_key {
            request = request.bearer_auth(api_key);
        }

        let response = request.send().await?;
        let status = response.status();
        let response_text = response.text().await?;

        debug!("接口响应: url={}, status={}, body={}", url, status, response_text);

        if !status.is_success() {
            return Err(ApiError::Status {
                status: status.as_u16(),
                body: response_text,
            });
        }

        let envelope: ApiEnvelope<T> = serde_json::from_str(&response_text).map_err(|e| {
            ApiError::Malformed(format!("{}: body={}", e, response_text))
        })?;

        if !envelope.success {
            return Err(ApiError::Rejected(
                envelope
                    .message
                    .unwrap_or_else(|| "success=false".to_string()),
            ));
        }

        envelope
            .data
            .ok_or_else(|| ApiError::Malformed(format!("响应缺少 data 字段: {}", response_text)))
    }
}

#[async_trait]
impl SessionApi for MediaApiClient {
    async fn initiate(&self, request: &InitiateRequest) -> Result<InitiateResponse, ApiError> {
        self.post_json(&self.config.initiate_path, request).await
    }

    async fn finalize(&self, request: &FinalizeRequest) -> Result<FinalizeData, ApiError> {
        self.post_json(&self.config.complete_path, request).await
    }

    fn proxy_part_url(&self) -> String {
        self.config.endpoint(&self.config.part_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{TransferMode, VideoMetadata};
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::post;
    use axum::{Json, Router};
    use parking_lot::Mutex;
    use serde_json::{json, Value};
    use std::sync::Arc;

    async fn serve(router: Router) -> ApiConfig {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        ApiConfig {
            base_url: format!("http://{}/api", addr),
            api_key: Some("token-1".to_string()),
            ..Default::default()
        }
    }

    fn initiate_request() -> InitiateRequest {
        InitiateRequest {
            session_id: "client-id".to_string(),
            file_name: "a.mp4".to_string(),
            file_size: 100,
            content_type: "video/mp4".to_string(),
            mode: TransferMode::Direct,
            part_size: 50,
            total_parts: 2,
            metadata: VideoMetadata::new("A"),
        }
    }

    fn finalize_request() -> FinalizeRequest {
        FinalizeRequest {
            session_id: "s1".to_string(),
            file_name: "a.mp4".to_string(),
            total_parts: 2,
            metadata: VideoMetadata::new("A"),
            parts: None,
        }
    }

    #[tokio::test]
    async fn test_initiate_sends_camel_case_with_auth() {
        let seen: Arc<Mutex<Option<(Value, String)>>> = Arc::default();
        let sink = seen.clone();
        let config = serve(Router::new().route(
            "/api/uploads/initiate",
            post(move |headers: HeaderMap, Json(body): Json<Value>| {
                let sink = sink.clone();
                async move {
                    let auth = headers
                        .get("authorization")
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or_default()
                        .to_string();
                    *sink.lock() = Some((body, auth));
                    Json(json!({
                        "success": true,
                        "data": {
                            "sessionId": "srv-1",
                            "partSize": 50,
                            "targets": [
                                { "partNumber": 1, "url": "https://s3/1" },
                                { "partNumber": 2, "url": "https://s3/2" }
                            ]
                        }
                    }))
                }
            }),
        ))
        .await;

        let client = MediaApiClient::new(&config).unwrap();
        let response = client.initiate(&initiate_request()).await.unwrap();

        assert_eq!(response.session_id.as_deref(), Some("srv-1"));
        assert_eq!(response.part_size, Some(50));
        assert_eq!(response.targets.len(), 2);

        let (body, auth) = seen.lock().clone().unwrap();
        assert_eq!(auth, "Bearer token-1");
        assert_eq!(body["sessionId"], "client-id");
        assert_eq!(body["fileSize"], 100);
        assert_eq!(body["mode"], "direct");
        assert_eq!(body["metadata"]["title"], "A");
    }

    #[tokio::test]
    async fn test_finalize_success_false_on_http_200() {
        let config = serve(Router::new().route(
            "/api/uploads/complete",
            post(|| async { Json(json!({ "success": false, "message": "missing parts" })) }),
        ))
        .await;

        let client = MediaApiClient::new(&config).unwrap();
        let err = client.finalize(&finalize_request()).await.unwrap_err();
        assert!(matches!(err, ApiError::Rejected(ref m) if m == "missing parts"));
    }

    #[tokio::test]
    async fn test_finalize_returns_resource() {
        let config = serve(Router::new().route(
            "/api/uploads/complete",
            post(|| async {
                Json(json!({ "success": true, "data": { "resourceId": "vid_9", "url": "/v/9" } }))
            }),
        ))
        .await;

        let client = MediaApiClient::new(&config).unwrap();
        let data = client.finalize(&finalize_request()).await.unwrap();
        assert_eq!(data.resource_id, "vid_9");
        assert_eq!(data.extra["url"], "/v/9");
    }

    #[tokio::test]
    async fn test_status_and_malformed_errors() {
        let config = serve(
            Router::new()
                .route(
                    "/api/uploads/initiate",
                    post(|| async { (StatusCode::UNAUTHORIZED, "no token") }),
                )
                .route("/api/uploads/complete", post(|| async { "not json" })),
        )
        .await;

        let client = MediaApiClient::new(&config).unwrap();
        let err = client.initiate(&initiate_request()).await.unwrap_err();
        assert!(matches!(err, ApiError::Status { status: 401, .. }));

        let err = client.finalize(&finalize_request()).await.unwrap_err();
        assert!(matches!(err, ApiError::Malformed(_)));
    }

    #[test]
    fn test_proxy_part_url() {
        let config = ApiConfig {
            base_url: "https://media.example.com/api/".to_string(),
            ..Default::default()
        };
        let client = MediaApiClient::new(&config).unwrap();
        assert_eq!(
            client.proxy_part_url(),
            "https://media.example.com/api/uploads/part"
        );
    }
}
