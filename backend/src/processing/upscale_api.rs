//! Client for the third-party super-resolution API.
//!
//! The API is synchronous: one `POST` carries the base64 image and returns
//! the upscaled image in the response body. The request is spawned at submit
//! time and tracked through [`InflightTasks`], so the submitter still returns
//! immediately.

use crate::processing::backend::{
    BackendError, DispatchRequest, InflightTasks, ProcessingBackend, RemoteStatus, RemoteTicket,
};
use async_trait::async_trait;
use base64::engine::general_purpose;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Serialize)]
struct UpscaleRequest<'a> {
    image: String,
    scale_factor: u32,
    model: &'a str,
    format: &'static str,
}

#[derive(Debug, Deserialize)]
struct UpscaleResponse {
    success: bool,
    #[serde(default)]
    result_image: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

pub struct UpscaleApiBackend {
    client: reqwest::Client,
    api_url: String,
    api_key: String,
    timeout: Duration,
    tasks: InflightTasks,
}

impl UpscaleApiBackend {
    pub fn new(api_url: String, api_key: String, timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_url,
            api_key,
            timeout,
            tasks: InflightTasks::default(),
        }
    }
}

async fn call_api(
    client: reqwest::Client,
    api_url: String,
    api_key: String,
    timeout: Duration,
    request: DispatchRequest,
) -> Result<Vec<u8>, BackendError> {
    let attachment = request
        .payload
        .attachments
        .first()
        .ok_or_else(|| BackendError::Rejected("no image attached".into()))?;

    let body = UpscaleRequest {
        image: general_purpose::STANDARD.encode(&attachment.bytes),
        scale_factor: request.payload.scale_factor(),
        model: request.payload.model(),
        format: "png",
    };

    let response = client
        .post(&api_url)
        .bearer_auth(&api_key)
        .timeout(timeout)
        .json(&body)
        .send()
        .await?;

    let status = response.status();
    if status.is_server_error() {
        return Err(BackendError::Unavailable(format!(
            "upscale API returned HTTP {}",
            status.as_u16()
        )));
    }
    if !status.is_success() {
        return Err(BackendError::Rejected(format!(
            "upscale API request failed: HTTP {}",
            status.as_u16()
        )));
    }

    decode_response(response.json().await?)
}

fn decode_response(parsed: UpscaleResponse) -> Result<Vec<u8>, BackendError> {
    if !parsed.success {
        return Err(BackendError::Rejected(
            parsed
                .message
                .unwrap_or_else(|| "upscale API reported an unknown error".into()),
        ));
    }
    let encoded = parsed
        .result_image
        .ok_or_else(|| BackendError::Protocol("success without result_image".into()))?;
    general_purpose::STANDARD
        .decode(encoded.as_bytes())
        .map_err(|e| BackendError::Protocol(format!("result_image is not base64: {}", e)))
}

#[async_trait]
impl ProcessingBackend for UpscaleApiBackend {
    fn name(&self) -> &'static str {
        "upscale-api"
    }

    async fn submit(&self, request: &DispatchRequest) -> Result<RemoteTicket, BackendError> {
        let ticket = RemoteTicket(format!("upscale-{}", request.job_id));
        self.tasks.spawn(
            ticket,
            call_api(
                self.client.clone(),
                self.api_url.clone(),
                self.api_key.clone(),
                self.timeout,
                request.clone(),
            ),
        )
    }

    async fn poll(&self, ticket: &RemoteTicket) -> Result<RemoteStatus, BackendError> {
        self.tasks.poll(ticket).await
    }

    async fn fetch_result(&self, ticket: &RemoteTicket) -> Result<Vec<u8>, BackendError> {
        self.tasks.take(ticket)
    }

    async fn release(&self, ticket: &RemoteTicket) {
        self.tasks.release(ticket);
    }
}
