//! In-process image transforms.
//!
//! Serves `grayscale` directly and stands in for the upscale engines when
//! they are unreachable (plain Lanczos interpolation, no AI detail).
//! Decoding and encoding are CPU-bound, so every transform runs under
//! `spawn_blocking`.

use crate::processing::backend::{
    BackendError, DispatchRequest, InflightTasks, ProcessingBackend, RemoteStatus, RemoteTicket,
};
use async_trait::async_trait;
use common::jobs::JobKind;
use image::imageops::FilterType;
use image::{DynamicImage, ImageFormat};
use std::io::Cursor;

/// Largest width or height an upscale may produce.
const MAX_OUTPUT_SIDE: u32 = 16_384;

/// Kinds the local engine can approximate when their own engine is down.
pub fn supports_fallback(kind: JobKind) -> bool {
    matches!(kind, JobKind::Upscale | JobKind::CreativeUpscale)
}

fn decode(bytes: &[u8]) -> Result<DynamicImage, String> {
    image::load_from_memory(bytes).map_err(|e| format!("cannot decode image: {}", e))
}

fn encode_png(img: &DynamicImage) -> Result<Vec<u8>, String> {
    let mut buf = Cursor::new(Vec::new());
    img.write_to(&mut buf, ImageFormat::Png)
        .map_err(|e| format!("cannot encode png: {}", e))?;
    Ok(buf.into_inner())
}

pub fn grayscale(bytes: &[u8]) -> Result<Vec<u8>, String> {
    encode_png(&decode(bytes)?.grayscale())
}

/// Enlarges by `factor` in both dimensions with Lanczos3 resampling.
pub fn upscale_interpolated(bytes: &[u8], factor: u32) -> Result<Vec<u8>, String> {
    let img = decode(bytes)?;
    let (width, height) = (img.width(), img.height());
    let target = width
        .checked_mul(factor)
        .zip(height.checked_mul(factor))
        .filter(|(w, h)| *w <= MAX_OUTPUT_SIDE && *h <= MAX_OUTPUT_SIDE);
    let Some((new_width, new_height)) = target else {
        return Err(format!(
            "{}x{} scaled by {} exceeds the {} pixel limit",
            width, height, factor, MAX_OUTPUT_SIDE
        ));
    };
    encode_png(&img.resize_exact(new_width, new_height, FilterType::Lanczos3))
}

/// Returns `bytes` unchanged if they are already PNG, otherwise re-encodes.
pub fn ensure_png(bytes: Vec<u8>) -> Result<Vec<u8>, String> {
    if matches!(image::guess_format(&bytes), Ok(ImageFormat::Png)) {
        return Ok(bytes);
    }
    encode_png(&decode(&bytes)?)
}

fn run(request: &DispatchRequest) -> Result<Vec<u8>, BackendError> {
    let first = request
        .payload
        .attachments
        .first()
        .ok_or_else(|| BackendError::Rejected("no image attached".into()))?;

    let output = match request.kind {
        JobKind::Grayscale => grayscale(&first.bytes),
        JobKind::Upscale | JobKind::CreativeUpscale => {
            upscale_interpolated(&first.bytes, request.payload.scale_factor())
        }
        other => Err(format!("{} is not available locally", other)),
    };
    output.map_err(BackendError::Rejected)
}

#[derive(Default)]
pub struct LocalEngine {
    tasks: InflightTasks,
}

impl LocalEngine {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ProcessingBackend for LocalEngine {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn submit(&self, request: &DispatchRequest) -> Result<RemoteTicket, BackendError> {
        let request = request.clone();
        let ticket = RemoteTicket(format!("local-{}", request.job_id));
        self.tasks.spawn(ticket, async move {
            tokio::task::spawn_blocking(move || run(&request))
                .await
                .map_err(|e| BackendError::Rejected(format!("task join error: {}", e)))?
        })
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
