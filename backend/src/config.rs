use common::jobs::JobKind;
use log::warn;
use std::collections::HashSet;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Server configuration loaded from environment variables.
///
/// Every field has a default suitable for local development; `from_env`
/// overrides them from the process environment (and `.env`, if present).
#[derive(Debug, Clone)]
pub struct Settings {
    pub host: String,
    pub port: u16,
    pub database_path: PathBuf,
    pub upload_dir: PathBuf,
    pub max_file_size: usize,
    pub allowed_extensions: Vec<String>,

    pub upscale_api_url: Option<String>,
    pub upscale_api_key: String,
    pub upscale_api_timeout: Duration,

    pub comfyui_server_address: Option<String>,
    pub comfyui_token: Option<String>,
    pub comfyui_style_workflow: PathBuf,
    pub comfyui_text_to_image_workflow: PathBuf,
    pub comfyui_face_swap_workflow: PathBuf,
    pub comfyui_creative_upscale_workflow: PathBuf,

    pub submit_timeout: Duration,
    pub backend_run_timeout: Duration,
    pub backend_poll_interval: Duration,

    pub job_retention: Duration,
    pub sweep_interval: Duration,
    pub max_active_jobs_per_user: usize,
    pub fallback_kinds: HashSet<JobKind>,
    pub default_credits: i64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 8080,
            database_path: PathBuf::from("ghibli.sqlite"),
            upload_dir: PathBuf::from("./uploads"),
            max_file_size: 10 * 1024 * 1024,
            allowed_extensions: ["jpg", "jpeg", "png", "webp"]
                .iter()
                .map(|ext| ext.to_string())
                .collect(),
            upscale_api_url: None,
            upscale_api_key: String::new(),
            upscale_api_timeout: Duration::from_secs(30),
            comfyui_server_address: None,
            comfyui_token: None,
            comfyui_style_workflow: PathBuf::from("workflow/ghibli.json"),
            comfyui_text_to_image_workflow: PathBuf::from("workflow/text_to_image_workflow.json"),
            comfyui_face_swap_workflow: PathBuf::from("workflow/face_swap_workflow.json"),
            comfyui_creative_upscale_workflow: PathBuf::from("workflow/upscale_workflow.json"),
            submit_timeout: Duration::from_secs(10),
            backend_run_timeout: Duration::from_secs(120),
            backend_poll_interval: Duration::from_millis(1000),
            job_retention: Duration::from_secs(24 * 60 * 60),
            sweep_interval: Duration::from_secs(10 * 60),
            max_active_jobs_per_user: 3,
            fallback_kinds: [JobKind::Upscale, JobKind::CreativeUpscale]
                .into_iter()
                .collect(),
            default_credits: 50,
        }
    }
}

impl Settings {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                     | Default                    |
    /// |-----------------------------|----------------------------|
    /// | `HOST`                      | `127.0.0.1`                |
    /// | `PORT`                      | `8080`                     |
    /// | `DATABASE_PATH`             | `ghibli.sqlite`            |
    /// | `UPLOAD_DIR`                | `./uploads`                |
    /// | `MAX_FILE_SIZE`             | `10485760`                 |
    /// | `ALLOWED_EXTENSIONS`        | `jpg,jpeg,png,webp`        |
    /// | `UPSCALE_API_URL`           | unset (engine disabled)    |
    /// | `COMFYUI_SERVER_ADDRESS`    | unset (engine disabled)    |
    /// | `SUBMIT_TIMEOUT_SECS`       | `10`                       |
    /// | `BACKEND_RUN_TIMEOUT_SECS`  | `120`                      |
    /// | `JOB_RETENTION_SECS`        | `86400`                    |
    /// | `MAX_ACTIVE_JOBS_PER_USER`  | `3`                        |
    /// | `FALLBACK_KINDS`            | `upscale,creative_upscale` |
    /// | `DEFAULT_CREDITS`           | `50`                       |
    pub fn from_env() -> Self {
        let defaults = Self::default();

        Self {
            host: env_or("HOST", defaults.host),
            port: env_or("PORT", defaults.port),
            database_path: env_or("DATABASE_PATH", defaults.database_path),
            upload_dir: env_or("UPLOAD_DIR", defaults.upload_dir),
            max_file_size: env_or("MAX_FILE_SIZE", defaults.max_file_size),
            allowed_extensions: std::env::var("ALLOWED_EXTENSIONS")
                .map(|raw| split_list(&raw).map(|ext| ext.to_lowercase()).collect())
                .unwrap_or(defaults.allowed_extensions),
            upscale_api_url: env_opt("UPSCALE_API_URL"),
            upscale_api_key: env_or("UPSCALE_API_KEY", defaults.upscale_api_key),
            upscale_api_timeout: env_secs("UPSCALE_API_TIMEOUT_SECS", defaults.upscale_api_timeout),
            comfyui_server_address: env_opt("COMFYUI_SERVER_ADDRESS"),
            comfyui_token: env_opt("COMFYUI_TOKEN"),
            comfyui_style_workflow: env_or(
                "COMFYUI_STYLE_WORKFLOW",
                defaults.comfyui_style_workflow,
            ),
            comfyui_text_to_image_workflow: env_or(
                "COMFYUI_TEXT_TO_IMAGE_WORKFLOW",
                defaults.comfyui_text_to_image_workflow,
            ),
            comfyui_face_swap_workflow: env_or(
                "COMFYUI_FACE_SWAP_WORKFLOW",
                defaults.comfyui_face_swap_workflow,
            ),
            comfyui_creative_upscale_workflow: env_or(
                "COMFYUI_CREATIVE_UPSCALE_WORKFLOW",
                defaults.comfyui_creative_upscale_workflow,
            ),
            submit_timeout: env_secs("SUBMIT_TIMEOUT_SECS", defaults.submit_timeout),
            backend_run_timeout: env_secs("BACKEND_RUN_TIMEOUT_SECS", defaults.backend_run_timeout),
            backend_poll_interval: env_duration(
                "BACKEND_POLL_INTERVAL_MS",
                Duration::from_millis,
                defaults.backend_poll_interval,
            ),
            job_retention: env_secs("JOB_RETENTION_SECS", defaults.job_retention),
            sweep_interval: env_secs("SWEEP_INTERVAL_SECS", defaults.sweep_interval),
            max_active_jobs_per_user: env_or(
                "MAX_ACTIVE_JOBS_PER_USER",
                defaults.max_active_jobs_per_user,
            ),
            fallback_kinds: std::env::var("FALLBACK_KINDS")
                .map(|raw| parse_kinds(&raw))
                .unwrap_or(defaults.fallback_kinds),
            default_credits: env_or("DEFAULT_CREDITS", defaults.default_credits),
        }
    }

    pub fn bind_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }
}

fn env_opt(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(raw) => parse_or_warn(key, &raw).unwrap_or(default),
        Err(_) => default,
    }
}

fn env_secs(key: &str, default: Duration) -> Duration {
    env_duration(key, Duration::from_secs, default)
}

fn env_duration(key: &str, unit: fn(u64) -> Duration, default: Duration) -> Duration {
    std::env::var(key)
        .ok()
        .and_then(|raw| parse_duration(key, &raw, unit))
        .unwrap_or(default)
}

/// Durations must be positive: a zero interval would spin or panic a timer.
fn parse_duration(key: &str, raw: &str, unit: fn(u64) -> Duration) -> Option<Duration> {
    match parse_or_warn::<u64>(key, raw)? {
        0 => {
            warn!("Ignoring zero value for {}", key);
            None
        }
        value => Some(unit(value)),
    }
}

fn parse_or_warn<T: FromStr>(key: &str, raw: &str) -> Option<T> {
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!("Ignoring invalid value {:?} for {}", raw, key);
            None
        }
    }
}

fn split_list(raw: &str) -> impl Iterator<Item = &str> {
    raw.split(',').map(str::trim).filter(|item| !item.is_empty())
}

/// Parses a comma-separated list of kind names, skipping unknown entries.
fn parse_kinds(raw: &str) -> HashSet<JobKind> {
    split_list(raw)
        .filter_map(|name| match name.parse::<JobKind>() {
            Ok(kind) => Some(kind),
            Err(e) => {
                warn!("FALLBACK_KINDS: {}", e);
                None
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fallback_kinds_skip_unknown_names() {
        let kinds = parse_kinds("upscale, blur ,grayscale,");
        assert_eq!(kinds.len(), 2);
        assert!(kinds.contains(&JobKind::Upscale));
        assert!(kinds.contains(&JobKind::Grayscale));
    }

    #[test]
    fn empty_fallback_list_disables_fallback() {
        assert!(parse_kinds("").is_empty());
    }

    #[test]
    fn invalid_numbers_are_ignored() {
        assert_eq!(parse_or_warn::<u16>("PORT", "eighty"), None);
        assert_eq!(parse_or_warn::<u16>("PORT", " 9000 "), Some(9000));
    }

    #[test]
    fn zero_durations_fall_back_to_defaults() {
        assert_eq!(
            parse_duration("SWEEP_INTERVAL_SECS", "0", Duration::from_secs),
            None
        );
        assert_eq!(
            parse_duration("BACKEND_POLL_INTERVAL_MS", " 0 ", Duration::from_millis),
            None
        );
        assert_eq!(
            parse_duration("BACKEND_POLL_INTERVAL_MS", "250", Duration::from_millis),
            Some(Duration::from_millis(250))
        );
        assert_eq!(
            parse_duration("SWEEP_INTERVAL_SECS", "-5", Duration::from_secs),
            None
        );
    }
}
