//! REST client driving a ComfyUI server.
//!
//! Each generative kind maps to a workflow JSON file. Workflows carry
//! `{{placeholder}}` strings which are filled at submit time with the
//! uploaded image names, the prompt, a seed and the scale factor. The filled
//! graph is queued with `POST /prompt`; progress comes from `/history` and
//! `/queue`, and the first output image is fetched through `/view`.

use crate::config::Settings;
use crate::processing::backend::{
    BackendError, DispatchRequest, ProcessingBackend, RemoteStatus, RemoteTicket,
};
use crate::processing::Attachment;
use async_trait::async_trait;
use common::jobs::JobKind;
use log::debug;
use reqwest::multipart::{Form, Part};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::PathBuf;
use uuid::Uuid;

/// Response returned by `POST /prompt`.
#[derive(Debug, Deserialize)]
struct SubmitResponse {
    prompt_id: String,
}

/// Response returned by `POST /upload/image`.
#[derive(Debug, Deserialize)]
struct UploadResponse {
    name: String,
    #[serde(default)]
    subfolder: String,
}

/// One entry of a history node's `images` list.
#[derive(Debug, Clone, PartialEq, Deserialize)]
struct OutputImage {
    filename: String,
    #[serde(default)]
    subfolder: String,
    #[serde(rename = "type", default = "default_output_type")]
    kind: String,
}

fn default_output_type() -> String {
    "output".to_string()
}

pub struct ComfyUiBackend {
    client: reqwest::Client,
    api_url: String,
    token: Option<String>,
    workflows: HashMap<JobKind, PathBuf>,
}

impl ComfyUiBackend {
    /// * `address` - `host:port` or a full base URL.
    pub fn new(address: &str, token: Option<String>, workflows: HashMap<JobKind, PathBuf>) -> Self {
        let address = address.trim_end_matches('/');
        let api_url = if address.starts_with("http://") || address.starts_with("https://") {
            address.to_string()
        } else {
            format!("http://{}", address)
        };
        Self {
            client: reqwest::Client::new(),
            api_url,
            token,
            workflows,
        }
    }

    /// `None` when no server address is configured.
    pub fn from_settings(settings: &Settings) -> Option<Self> {
        let address = settings.comfyui_server_address.as_deref()?;
        let workflows = HashMap::from([
            (JobKind::StyleTransfer, settings.comfyui_style_workflow.clone()),
            (JobKind::TextToImage, settings.comfyui_text_to_image_workflow.clone()),
            (JobKind::FaceSwap, settings.comfyui_face_swap_workflow.clone()),
            (
                JobKind::CreativeUpscale,
                settings.comfyui_creative_upscale_workflow.clone(),
            ),
        ]);
        Some(Self::new(address, settings.comfyui_token.clone(), workflows))
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let builder = self
            .client
            .request(method, format!("{}{}", self.api_url, path));
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn load_workflow(&self, kind: JobKind) -> Result<Value, BackendError> {
        let path = self
            .workflows
            .get(&kind)
            .ok_or_else(|| BackendError::Rejected(format!("no workflow configured for {}", kind)))?;
        let raw = tokio::fs::read_to_string(path).await.map_err(|e| {
            BackendError::Rejected(format!("cannot read workflow {}: {}", path.display(), e))
        })?;
        serde_json::from_str(&raw).map_err(|e| {
            BackendError::Rejected(format!("workflow {} is not valid JSON: {}", path.display(), e))
        })
    }

    /// Uploads one attachment and returns the name workflows refer to it by.
    async fn upload_image(
        &self,
        job_id: &str,
        attachment: &Attachment,
    ) -> Result<String, BackendError> {
        let extension = attachment
            .filename
            .as_deref()
            .and_then(|name| name.rsplit_once('.'))
            .map(|(_, ext)| ext.to_lowercase())
            .unwrap_or_else(|| "png".to_string());
        let upload_name = format!("{}_{}.{}", job_id, attachment.field, extension);

        let form = Form::new()
            .part("image", Part::bytes(attachment.bytes.clone()).file_name(upload_name))
            .text("overwrite", "true");
        let response = self
            .request(reqwest::Method::POST, "/upload/image")
            .multipart(form)
            .send()
            .await?;
        let uploaded: UploadResponse = ensure_success(response).await?.json().await?;

        Ok(if uploaded.subfolder.is_empty() {
            uploaded.name
        } else {
            format!("{}/{}", uploaded.subfolder, uploaded.name)
        })
    }

    async fn history(&self, prompt_id: &str) -> Result<Value, BackendError> {
        let response = self
            .request(reqwest::Method::GET, &format!("/history/{}", prompt_id))
            .send()
            .await?;
        Ok(ensure_success(response).await?.json().await?)
    }

    async fn queue(&self) -> Result<Value, BackendError> {
        let response = self.request(reqwest::Method::GET, "/queue").send().await?;
        Ok(ensure_success(response).await?.json().await?)
    }
}

/// Maps an HTTP status onto the engine error taxonomy: 5xx means the engine
/// is unavailable, any other non-2xx means it refused the request.
async fn ensure_success(response: reqwest::Response) -> Result<reqwest::Response, BackendError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response
        .text()
        .await
        .unwrap_or_else(|_| "<unreadable body>".to_string());
    let message = format!("ComfyUI API error ({}): {}", status.as_u16(), body);
    if status.is_server_error() {
        Err(BackendError::Unavailable(message))
    } else {
        Err(BackendError::Rejected(message))
    }
}

/// Values substituted into a workflow, keyed by placeholder name.
fn bindings_for(
    request: &DispatchRequest,
    uploaded: &[(String, String)],
    seed: u64,
) -> HashMap<&'static str, Value> {
    let mut bindings = HashMap::new();
    bindings.insert("seed", json!(seed));
    bindings.insert("scale_factor", json!(request.payload.scale_factor()));
    if let Some(prompt) = request.payload.trimmed_prompt() {
        bindings.insert("prompt", json!(prompt));
    }

    let by_field = |field: &str| {
        uploaded
            .iter()
            .find(|(name, _)| name == field)
            .map(|(_, stored)| stored.clone())
    };
    let by_position = |index: usize| uploaded.get(index).map(|(_, stored)| stored.clone());

    if let Some(first) = by_position(0) {
        bindings.insert("image", json!(first));
    }
    if let Some(source) = by_field("source").or_else(|| by_position(0)) {
        bindings.insert("source_image", json!(source));
    }
    if let Some(target) = by_field("target").or_else(|| by_position(1)) {
        bindings.insert("target_image", json!(target));
    }
    bindings
}

/// Replaces `{{name}}` placeholders throughout a workflow graph.
///
/// A string consisting solely of one placeholder takes the bound value with
/// its JSON type (so `"{{seed}}"` becomes a number). Placeholders embedded in
/// longer strings are substituted textually.
fn fill_placeholders(value: &mut Value, bindings: &HashMap<&'static str, Value>) {
    match value {
        Value::String(text) => {
            let whole = text
                .trim()
                .strip_prefix("{{")
                .and_then(|rest| rest.strip_suffix("}}"))
                .map(str::trim)
                .and_then(|name| bindings.get(name));
            if let Some(bound) = whole {
                *value = bound.clone();
                return;
            }
            for (name, bound) in bindings {
                let token = format!("{{{{{}}}}}", name);
                if text.contains(&token) {
                    let replacement = match bound {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    };
                    *text = text.replace(&token, &replacement);
                }
            }
        }
        Value::Array(items) => items
            .iter_mut()
            .for_each(|item| fill_placeholders(item, bindings)),
        Value::Object(map) => map
            .values_mut()
            .for_each(|item| fill_placeholders(item, bindings)),
        _ => {}
    }
}

/// Reads a history entry. `None` means the prompt is not in history yet.
fn status_from_history(history: &Value, prompt_id: &str) -> Option<RemoteStatus> {
    let entry = history.get(prompt_id)?;
    let status = entry.get("status");

    if status.and_then(|s| s.get("status_str")).and_then(Value::as_str) == Some("error") {
        let detail = status
            .and_then(|s| s.get("messages"))
            .and_then(Value::as_array)
            .and_then(|messages| {
                messages.iter().find_map(|message| {
                    if message.get(0)?.as_str()? != "execution_error" {
                        return None;
                    }
                    message
                        .get(1)?
                        .get("exception_message")?
                        .as_str()
                        .map(str::to_string)
                })
            })
            .unwrap_or_else(|| "workflow execution failed".to_string());
        return Some(RemoteStatus::Failed(detail));
    }

    if first_output_image(entry).is_some() {
        return Some(RemoteStatus::Done);
    }

    let completed = status
        .and_then(|s| s.get("completed"))
        .and_then(Value::as_bool)
        .unwrap_or(false);
    if completed {
        Some(RemoteStatus::Failed("workflow produced no images".to_string()))
    } else {
        None
    }
}

/// Position of the prompt in `/queue`. Entries are `[number, prompt_id, ...]`.
fn status_from_queue(queue: &Value, prompt_id: &str) -> RemoteStatus {
    let contains = |list: &str| -> Option<usize> {
        queue
            .get(list)?
            .as_array()?
            .iter()
            .position(|entry| entry.get(1).and_then(Value::as_str) == Some(prompt_id))
    };

    if contains("queue_running").is_some() {
        RemoteStatus::Running {
            percent: None,
            message: "generating".to_string(),
        }
    } else if let Some(index) = contains("queue_pending") {
        RemoteStatus::Queued {
            position: Some(index as u32 + 1),
        }
    } else {
        // Finished between the history and queue requests.
        RemoteStatus::Running {
            percent: None,
            message: "collecting results".to_string(),
        }
    }
}

fn first_output_image(entry: &Value) -> Option<OutputImage> {
    entry
        .get("outputs")?
        .as_object()?
        .values()
        .filter_map(|node| node.get("images")?.as_array())
        .flatten()
        .find_map(|image| serde_json::from_value(image.clone()).ok())
}

#[async_trait]
impl ProcessingBackend for ComfyUiBackend {
    fn name(&self) -> &'static str {
        "comfyui"
    }

    async fn submit(&self, request: &DispatchRequest) -> Result<RemoteTicket, BackendError> {
        let mut workflow = self.load_workflow(request.kind).await?;

        let mut uploaded = Vec::with_capacity(request.payload.attachments.len());
        for attachment in &request.payload.attachments {
            let stored = self.upload_image(&request.job_id, attachment).await?;
            uploaded.push((attachment.field.clone(), stored));
        }

        let seed = (Uuid::new_v4().as_u128() as u64) >> 1;
        fill_placeholders(&mut workflow, &bindings_for(request, &uploaded, seed));

        let body = json!({
            "prompt": workflow,
            "client_id": request.job_id,
        });
        let response = self
            .request(reqwest::Method::POST, "/prompt")
            .json(&body)
            .send()
            .await?;
        let submitted: SubmitResponse = ensure_success(response).await?.json().await?;
        debug!(
            "Queued {} workflow for job {} as prompt {}",
            request.kind, request.job_id, submitted.prompt_id
        );
        Ok(RemoteTicket(submitted.prompt_id))
    }

    async fn poll(&self, ticket: &RemoteTicket) -> Result<RemoteStatus, BackendError> {
        let history = self.history(&ticket.0).await?;
        if let Some(status) = status_from_history(&history, &ticket.0) {
            return Ok(status);
        }
        let queue = self.queue().await?;
        Ok(status_from_queue(&queue, &ticket.0))
    }

    async fn fetch_result(&self, ticket: &RemoteTicket) -> Result<Vec<u8>, BackendError> {
        let history = self.history(&ticket.0).await?;
        let image = history
            .get(&ticket.0)
            .and_then(first_output_image)
            .ok_or_else(|| {
                BackendError::Protocol(format!("no output image for prompt {}", ticket.0))
            })?;

        let response = self
            .request(reqwest::Method::GET, "/view")
            .query(&[
                ("filename", image.filename.as_str()),
                ("subfolder", image.subfolder.as_str()),
                ("type", image.kind.as_str()),
            ])
            .send()
            .await?;
        let bytes = ensure_success(response).await?.bytes().await?;
        Ok(bytes.to_vec())
    }

    /// Deletes the prompt from the queue. A prompt already executing keeps
    /// running; its result is never fetched.
    async fn release(&self, ticket: &RemoteTicket) {
        let outcome = match self
            .request(reqwest::Method::POST, "/queue")
            .json(&json!({ "delete": [ticket.0] }))
            .send()
            .await
        {
            Ok(response) => ensure_success(response).await.map(|_| ()),
            Err(e) => Err(e.into()),
        };
        if let Err(e) = outcome {
            debug!("Could not drop prompt {} from the queue: {}", ticket.0, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processing::test_support::png_attachment;
    use crate::processing::JobPayload;
    use assert_matches::assert_matches;

    fn request(kind: JobKind, payload: JobPayload) -> DispatchRequest {
        DispatchRequest {
            job_id: "job-7".into(),
            kind,
            payload,
        }
    }

    #[test]
    fn address_without_scheme_gets_http() {
        let backend = ComfyUiBackend::new("127.0.0.1:8188/", None, HashMap::new());
        assert_eq!(backend.api_url, "http://127.0.0.1:8188");
        let backend = ComfyUiBackend::new("https://comfy.example", None, HashMap::new());
        assert_eq!(backend.api_url, "https://comfy.example");
    }

    #[test]
    fn placeholders_keep_json_types() {
        let payload = JobPayload {
            prompt: Some("  a flying castle ".into()),
            ..JobPayload::default()
        };
        let bindings = bindings_for(&request(JobKind::TextToImage, payload), &[], 42);
        let mut workflow = json!({
            "3": {"inputs": {"seed": "{{seed}}", "text": "{{prompt}}"}},
            "6": {"inputs": {"text": "ghibli style, {{prompt}}, detailed"}},
            "9": {"inputs": {"filename_prefix": "{{unknown}}"}}
        });

        fill_placeholders(&mut workflow, &bindings);

        assert_eq!(workflow["3"]["inputs"]["seed"], json!(42));
        assert_eq!(workflow["3"]["inputs"]["text"], json!("a flying castle"));
        assert_eq!(
            workflow["6"]["inputs"]["text"],
            json!("ghibli style, a flying castle, detailed")
        );
        assert_eq!(workflow["9"]["inputs"]["filename_prefix"], json!("{{unknown}}"));
    }

    #[test]
    fn face_swap_binds_source_and_target_by_field() {
        let payload = JobPayload {
            attachments: vec![png_attachment("target"), png_attachment("source")],
            ..JobPayload::default()
        };
        let uploaded = vec![
            ("target".to_string(), "job-7_target.png".to_string()),
            ("source".to_string(), "job-7_source.png".to_string()),
        ];
        let bindings = bindings_for(&request(JobKind::FaceSwap, payload), &uploaded, 1);
        assert_eq!(bindings["source_image"], json!("job-7_source.png"));
        assert_eq!(bindings["target_image"], json!("job-7_target.png"));
        assert_eq!(bindings["image"], json!("job-7_target.png"));
    }

    #[test]
    fn history_with_images_is_done() {
        let history = json!({
            "p-1": {
                "status": {"status_str": "success", "completed": true, "messages": []},
                "outputs": {"9": {"images": [
                    {"filename": "out_0001.png", "subfolder": "", "type": "output"}
                ]}}
            }
        });
        assert_eq!(status_from_history(&history, "p-1"), Some(RemoteStatus::Done));
        assert_eq!(
            first_output_image(&history["p-1"]),
            Some(OutputImage {
                filename: "out_0001.png".into(),
                subfolder: String::new(),
                kind: "output".into(),
            })
        );
    }

    #[test]
    fn history_error_carries_exception_message() {
        let history = json!({
            "p-2": {
                "status": {
                    "status_str": "error",
                    "completed": false,
                    "messages": [
                        ["execution_start", {"prompt_id": "p-2"}],
                        ["execution_error", {"exception_message": "CUDA out of memory"}]
                    ]
                },
                "outputs": {}
            }
        });
        assert_matches!(
            status_from_history(&history, "p-2"),
            Some(RemoteStatus::Failed(msg)) if msg == "CUDA out of memory"
        );
    }

    #[test]
    fn completed_without_images_fails() {
        let history = json!({
            "p-3": {"status": {"status_str": "success", "completed": true}, "outputs": {}}
        });
        assert_matches!(
            status_from_history(&history, "p-3"),
            Some(RemoteStatus::Failed(_))
        );
    }

    #[test]
    fn absent_from_history_defers_to_queue() {
        assert_eq!(status_from_history(&json!({}), "p-4"), None);

        let queue = json!({
            "queue_running": [[10, "p-5", {}, {}, []]],
            "queue_pending": [[11, "p-6", {}, {}, []], [12, "p-4", {}, {}, []]]
        });
        assert_eq!(
            status_from_queue(&queue, "p-4"),
            RemoteStatus::Queued { position: Some(2) }
        );
        assert_matches!(status_from_queue(&queue, "p-5"), RemoteStatus::Running { .. });
    }

    #[tokio::test]
    async fn missing_workflow_file_is_rejected() {
        let workflows = HashMap::from([(
            JobKind::StyleTransfer,
            PathBuf::from("/nonexistent/ghibli.json"),
        )]);
        let backend = ComfyUiBackend::new("127.0.0.1:1", None, workflows);
        assert_matches!(
            backend.load_workflow(JobKind::StyleTransfer).await,
            Err(BackendError::Rejected(msg)) if msg.contains("cannot read workflow")
        );
        assert_matches!(
            backend.load_workflow(JobKind::Grayscale).await,
            Err(BackendError::Rejected(_))
        );
    }
}
