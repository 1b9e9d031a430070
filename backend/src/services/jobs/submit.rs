use crate::error::{CoreError, CoreResult};
use crate::identity::Caller;
use crate::job_controller::submit::JobSubmitter;
use crate::processing::{Attachment, JobPayload, KindCatalog};
use actix_multipart::{Field, Multipart};
use actix_web::{web, HttpResponse};
use common::jobs::JobKind;
use futures_util::StreamExt;
use serde_json::Value;

/// Upper bound for the text fields of a submission.
const TEXT_FIELD_LIMIT: usize = 64 * 1024;

pub(crate) async fn process(
    caller: Caller,
    payload: Multipart,
    catalog: web::Data<KindCatalog>,
    submitter: web::Data<JobSubmitter>,
) -> Result<HttpResponse, CoreError> {
    let (kind, job_payload) = read_submission(payload, catalog.limits().max_file_size).await?;
    let handle = submitter.submit(caller.id(), kind, job_payload).await?;
    Ok(HttpResponse::Accepted().json(handle))
}

/// Collects the multipart fields into a kind and a payload.
///
/// Any field carrying a filename is an image attachment, kept in arrival
/// order under its field name. Unknown text fields are ignored.
async fn read_submission(
    mut multipart: Multipart,
    max_file_size: usize,
) -> CoreResult<(JobKind, JobPayload)> {
    let mut kind: Option<JobKind> = None;
    let mut payload = JobPayload::default();

    while let Some(item) = multipart.next().await {
        let mut field = item
            .map_err(|e| CoreError::Validation(format!("malformed multipart body: {}", e)))?;
        let disposition = field.content_disposition();
        let name = disposition
            .and_then(|cd| cd.get_name())
            .unwrap_or_default()
            .to_string();
        let filename = disposition
            .and_then(|cd| cd.get_filename())
            .map(|f| f.to_string());

        match (name.as_str(), filename) {
            ("kind", None) => {
                let raw = read_text(&mut field, &name).await?;
                kind = Some(raw.parse().map_err(CoreError::Validation)?);
            }
            ("prompt", None) => {
                payload.prompt = Some(read_text(&mut field, &name).await?);
            }
            ("parameters", None) => {
                let raw = read_text(&mut field, &name).await?;
                if !raw.trim().is_empty() {
                    payload.parameters = match serde_json::from_str(&raw) {
                        Ok(Value::Object(map)) => map,
                        Ok(_) => {
                            return Err(CoreError::Validation(
                                "parameters must be a JSON object".into(),
                            ))
                        }
                        Err(e) => {
                            return Err(CoreError::Validation(format!(
                                "parameters is not valid JSON: {}",
                                e
                            )))
                        }
                    };
                }
            }
            (_, Some(filename)) => {
                let label = filename.clone();
                let bytes = read_bytes(&mut field, max_file_size, &label).await?;
                payload.attachments.push(Attachment {
                    field: name,
                    filename: Some(filename),
                    bytes,
                });
            }
            (_, None) => {
                read_bytes(&mut field, TEXT_FIELD_LIMIT, &name).await?;
            }
        }
    }

    let kind = kind.ok_or_else(|| CoreError::Validation("missing field: kind".into()))?;
    Ok((kind, payload))
}

async fn read_bytes(field: &mut Field, limit: usize, label: &str) -> CoreResult<Vec<u8>> {
    let mut bytes = Vec::new();
    while let Some(chunk) = field.next().await {
        let chunk = chunk.map_err(|e| {
            CoreError::Validation(format!("{}: upload interrupted: {}", label, e))
        })?;
        if bytes.len() + chunk.len() > limit {
            return Err(CoreError::Validation(format!(
                "{}: file exceeds the {} byte limit",
                label, limit
            )));
        }
        bytes.extend_from_slice(&chunk);
    }
    Ok(bytes)
}

async fn read_text(field: &mut Field, label: &str) -> CoreResult<String> {
    let bytes = read_bytes(field, TEXT_FIELD_LIMIT, label).await?;
    String::from_utf8(bytes)
        .map_err(|_| CoreError::Validation(format!("{} is not valid UTF-8", label)))
}
