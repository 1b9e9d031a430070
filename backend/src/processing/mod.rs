//! # Processing kinds
//!
//! The dispatch table mapping each [`JobKind`] to what a submission must
//! contain, what it costs, which engine runs it, and whether a degraded local
//! transform may stand in when that engine is down.
//!
//! ## Sub-modules:
//! - `backend`: the submit/poll/result contract every engine implements.
//! - `local`: in-process transforms built on the `image` crate.
//! - `comfyui`: workflow-driven engine for the generative kinds.
//! - `upscale_api`: the third-party super-resolution HTTP API.

pub mod backend;
pub mod comfyui;
pub mod local;
pub mod upscale_api;

use self::backend::Engines;
use self::comfyui::ComfyUiBackend;
use self::local::LocalEngine;
use self::upscale_api::UpscaleApiBackend;
use crate::config::Settings;
use crate::error::{CoreError, CoreResult};
use common::jobs::{JobKind, ProcessingKindInfo};
use log::info;
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::sync::Arc;

pub const DEFAULT_SCALE_FACTOR: u32 = 2;
pub const DEFAULT_UPSCALE_MODEL: &str = "real-esrgan";
const SCALE_FACTORS: [u32; 3] = [2, 4, 8];

/// One uploaded image.
#[derive(Clone, Debug)]
pub struct Attachment {
    /// Multipart field name (`file`, `source`, `target`, ...).
    pub field: String,
    pub filename: Option<String>,
    pub bytes: Vec<u8>,
}

/// Everything a client sent alongside the kind.
#[derive(Clone, Debug, Default)]
pub struct JobPayload {
    pub attachments: Vec<Attachment>,
    pub prompt: Option<String>,
    pub parameters: Map<String, Value>,
}

impl JobPayload {
    pub fn scale_factor(&self) -> u32 {
        self.parameters
            .get("scale_factor")
            .and_then(Value::as_u64)
            .and_then(|factor| u32::try_from(factor).ok())
            .unwrap_or(DEFAULT_SCALE_FACTOR)
    }

    pub fn model(&self) -> &str {
        self.parameters
            .get("model")
            .and_then(Value::as_str)
            .unwrap_or(DEFAULT_UPSCALE_MODEL)
    }

    pub fn trimmed_prompt(&self) -> Option<&str> {
        self.prompt
            .as_deref()
            .map(str::trim)
            .filter(|prompt| !prompt.is_empty())
    }
}

/// Which engine serves a kind.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EngineRoute {
    Local,
    ComfyUi,
    UpscaleApi,
}

/// Row of the dispatch table.
#[derive(Clone, Debug)]
pub struct KindSpec {
    pub kind: JobKind,
    pub description: &'static str,
    pub cost: i64,
    pub min_attachments: usize,
    pub max_attachments: usize,
    pub requires_prompt: bool,
    pub route: EngineRoute,
    pub fallback: bool,
    validate_parameters: fn(&JobPayload) -> Result<(), String>,
}

fn no_parameters(_: &JobPayload) -> Result<(), String> {
    Ok(())
}

fn upscale_parameters(payload: &JobPayload) -> Result<(), String> {
    if let Some(raw) = payload.parameters.get("scale_factor") {
        let factor = raw
            .as_u64()
            .ok_or_else(|| "scale_factor must be an integer".to_string())?;
        let supported = u32::try_from(factor)
            .map(|factor| SCALE_FACTORS.contains(&factor))
            .unwrap_or(false);
        if !supported {
            return Err(format!("scale_factor must be one of 2, 4, 8 (got {})", factor));
        }
    }
    if let Some(model) = payload.parameters.get("model") {
        if !model.is_string() {
            return Err("model must be a string".into());
        }
    }
    Ok(())
}

/// Upload constraints applied to every image attachment.
#[derive(Clone, Debug)]
pub struct UploadLimits {
    pub max_file_size: usize,
    pub allowed_extensions: Vec<String>,
}

impl UploadLimits {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            max_file_size: settings.max_file_size,
            allowed_extensions: settings.allowed_extensions.clone(),
        }
    }

    fn check(&self, attachment: &Attachment) -> Result<(), String> {
        let label = attachment
            .filename
            .clone()
            .unwrap_or_else(|| attachment.field.clone());

        if let Some(filename) = &attachment.filename {
            let extension = filename
                .rsplit_once('.')
                .map(|(_, ext)| ext.to_lowercase())
                .unwrap_or_default();
            if !self.allowed_extensions.contains(&extension) {
                return Err(format!(
                    "{}: extension must be one of {}",
                    label,
                    self.allowed_extensions.join(", ")
                ));
            }
        }
        if attachment.bytes.is_empty() {
            return Err(format!("{}: file is empty", label));
        }
        if attachment.bytes.len() > self.max_file_size {
            return Err(format!(
                "{}: file exceeds the {} byte limit",
                label, self.max_file_size
            ));
        }
        image::guess_format(&attachment.bytes)
            .map_err(|_| format!("{}: not a recognised image", label))?;
        Ok(())
    }
}

/// The dispatch table plus upload limits.
#[derive(Clone, Debug)]
pub struct KindCatalog {
    specs: Vec<KindSpec>,
    limits: UploadLimits,
}

impl KindCatalog {
    /// Builds the table. `fallback_kinds` only takes effect for kinds the
    /// local engine can approximate.
    pub fn new(limits: UploadLimits, fallback_kinds: &HashSet<JobKind>) -> Self {
        let with_fallback = |kind: JobKind| {
            fallback_kinds.contains(&kind) && local::supports_fallback(kind)
        };
        let image_kind = |kind: JobKind,
                          description: &'static str,
                          cost: i64,
                          route: EngineRoute,
                          validate: fn(&JobPayload) -> Result<(), String>| KindSpec {
            kind,
            description,
            cost,
            min_attachments: 1,
            max_attachments: 1,
            requires_prompt: false,
            route,
            fallback: with_fallback(kind),
            validate_parameters: validate,
        };

        let specs = vec![
            image_kind(
                JobKind::Grayscale,
                "Convert a colour image to grayscale",
                10,
                EngineRoute::Local,
                no_parameters,
            ),
            image_kind(
                JobKind::StyleTransfer,
                "Repaint an image in a Ghibli-inspired animation style",
                10,
                EngineRoute::ComfyUi,
                no_parameters,
            ),
            image_kind(
                JobKind::Upscale,
                "Increase resolution with an AI super-resolution model",
                10,
                EngineRoute::UpscaleApi,
                upscale_parameters,
            ),
            image_kind(
                JobKind::CreativeUpscale,
                "Upscale while letting the model invent fine detail",
                15,
                EngineRoute::ComfyUi,
                upscale_parameters,
            ),
            KindSpec {
                kind: JobKind::TextToImage,
                description: "Generate an image from a text prompt",
                cost: 10,
                min_attachments: 0,
                max_attachments: 0,
                requires_prompt: true,
                route: EngineRoute::ComfyUi,
                fallback: with_fallback(JobKind::TextToImage),
                validate_parameters: no_parameters,
            },
            KindSpec {
                kind: JobKind::FaceSwap,
                description: "Place the face from the source image onto the target image",
                cost: 15,
                min_attachments: 2,
                max_attachments: 2,
                requires_prompt: false,
                route: EngineRoute::ComfyUi,
                fallback: with_fallback(JobKind::FaceSwap),
                validate_parameters: no_parameters,
            },
        ];

        Self { specs, limits }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(UploadLimits::from_settings(settings), &settings.fallback_kinds)
    }

    pub fn spec(&self, kind: JobKind) -> CoreResult<&KindSpec> {
        self.specs
            .iter()
            .find(|spec| spec.kind == kind)
            .ok_or_else(|| CoreError::Validation(format!("unsupported processing kind: {}", kind)))
    }

    pub fn limits(&self) -> &UploadLimits {
        &self.limits
    }

    /// Checks a payload against the kind's row of the table.
    pub fn validate(&self, kind: JobKind, payload: &JobPayload) -> CoreResult<&KindSpec> {
        let spec = self.spec(kind)?;
        let count = payload.attachments.len();
        if count < spec.min_attachments || count > spec.max_attachments {
            return Err(CoreError::Validation(match spec.max_attachments {
                0 => format!("{} does not take image attachments", kind),
                max if max == spec.min_attachments => {
                    format!("{} requires exactly {} image attachment(s), got {}", kind, max, count)
                }
                max => format!(
                    "{} requires between {} and {} image attachments, got {}",
                    kind, spec.min_attachments, max, count
                ),
            }));
        }
        if spec.requires_prompt && payload.trimmed_prompt().is_none() {
            return Err(CoreError::Validation(format!(
                "{} requires a non-empty prompt",
                kind
            )));
        }
        for attachment in &payload.attachments {
            self.limits.check(attachment).map_err(CoreError::Validation)?;
        }
        (spec.validate_parameters)(payload).map_err(CoreError::Validation)?;
        Ok(spec)
    }

    pub fn describe(&self) -> Vec<ProcessingKindInfo> {
        self.specs
            .iter()
            .map(|spec| ProcessingKindInfo {
                kind: spec.kind,
                description: spec.description.to_string(),
                cost: spec.cost,
                min_attachments: spec.min_attachments,
                max_attachments: spec.max_attachments,
                requires_prompt: spec.requires_prompt,
                fallback: spec.fallback,
            })
            .collect()
    }
}

/// Builds the engine table. The local engine is always present; the remote
/// engines only when their address is configured.
pub fn engines_from_settings(settings: &Settings) -> Engines {
    let mut engines = Engines::new().with(EngineRoute::Local, Arc::new(LocalEngine::new()));

    match ComfyUiBackend::from_settings(settings) {
        Some(comfyui) => {
            engines = engines.with(EngineRoute::ComfyUi, Arc::new(comfyui));
        }
        None => info!("COMFYUI_SERVER_ADDRESS not set; generative kinds are unavailable"),
    }

    match &settings.upscale_api_url {
        Some(url) => {
            let upscaler = UpscaleApiBackend::new(
                url.clone(),
                settings.upscale_api_key.clone(),
                settings.upscale_api_timeout,
            );
            engines = engines.with(EngineRoute::UpscaleApi, Arc::new(upscaler));
        }
        None => info!("UPSCALE_API_URL not set; upscale jobs run on the local fallback"),
    }
    engines
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::Attachment;
    use image::{ImageFormat, Rgb, RgbImage};
    use std::io::Cursor;

    pub fn png_bytes(width: u32, height: u32) -> Vec<u8> {
        let img = RgbImage::from_fn(width, height, |x, y| {
            Rgb([(x * 40) as u8, (y * 40) as u8, 200])
        });
        let mut buf = Cursor::new(Vec::new());
        img.write_to(&mut buf, ImageFormat::Png).unwrap();
        buf.into_inner()
    }

    pub fn png_attachment(field: &str) -> Attachment {
        Attachment {
            field: field.to_string(),
            filename: Some(format!("{}.png", field)),
            bytes: png_bytes(4, 3),
        }
    }
}
