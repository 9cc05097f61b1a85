use std::{path::PathBuf, time::Duration};

use anyhow::{Context, Result, anyhow};

const ENV_PREFIX: &str = "FACE_CAPTURE_";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Background {
    Transparent,
    Solid([u8; 4]),
}

impl Background {
    pub fn rgba(&self) -> [u8; 4] {
        match self {
            Background::Transparent => [0, 0, 0, 0],
            Background::Solid(color) => *color,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct FaceAnalyzerConfig {
    /// Minimum face presence probability.
    pub presence_threshold: f32,
    /// Eye aspect ratio at or below which an eye counts as closed.
    pub eye_closed_ratio: f32,
    /// Mouth width over outer eye corner distance at or above which the
    /// subject counts as smiling.
    pub smile_ratio: f32,
}

impl Default for FaceAnalyzerConfig {
    fn default() -> Self {
        Self {
            presence_threshold: 0.5,
            eye_closed_ratio: 0.18,
            smile_ratio: 0.58,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum UploadTarget {
    Directory(PathBuf),
    Http {
        base_url: String,
        token: Option<String>,
    },
}

#[derive(Clone, Debug, PartialEq)]
pub struct CaptureConfig {
    pub camera_index: u32,
    pub mirror_preview: bool,
    pub model_dir: PathBuf,
    pub model_base_url: Option<String>,
    pub face: FaceAnalyzerConfig,
    pub background: Background,
    pub jpeg_quality: u8,
    pub recapture_delay: Duration,
    pub finish_settle: Duration,
    pub upload: UploadTarget,
    pub user_id: String,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            camera_index: 0,
            mirror_preview: true,
            model_dir: PathBuf::from("models"),
            model_base_url: None,
            face: FaceAnalyzerConfig::default(),
            background: Background::Transparent,
            jpeg_quality: 85,
            recapture_delay: Duration::from_millis(1_500),
            finish_settle: Duration::from_millis(500),
            upload: UploadTarget::Directory(PathBuf::from("captures")),
            user_id: "me".to_string(),
        }
    }
}

impl CaptureConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Applies `FACE_CAPTURE_*` overrides on top of the defaults. `lookup`
    /// receives the full variable name.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(&format!("{ENV_PREFIX}{name}")).filter(|v| !v.is_empty());
        let mut config = Self::default();

        if let Some(raw) = get("CAMERA") {
            config.camera_index = raw
                .parse()
                .with_context(|| format!("invalid camera index {raw:?}"))?;
        }
        if let Some(raw) = get("MIRROR") {
            config.mirror_preview = parse_bool(&raw)?;
        }
        if let Some(dir) = get("MODEL_DIR") {
            config.model_dir = PathBuf::from(dir);
        }
        config.model_base_url = get("MODEL_URL");
        if let Some(raw) = get("EYE_CLOSED_RATIO") {
            config.face.eye_closed_ratio = raw
                .parse()
                .with_context(|| format!("invalid eye closed ratio {raw:?}"))?;
        }
        if let Some(raw) = get("PRESENCE_THRESHOLD") {
            config.face.presence_threshold = raw
                .parse()
                .with_context(|| format!("invalid presence threshold {raw:?}"))?;
        }
        if let Some(raw) = get("SMILE_RATIO") {
            config.face.smile_ratio = raw
                .parse()
                .with_context(|| format!("invalid smile ratio {raw:?}"))?;
        }
        if let Some(raw) = get("BACKGROUND") {
            config.background = parse_background(&raw)?;
        }
        if let Some(raw) = get("JPEG_QUALITY") {
            let quality: u8 = raw
                .parse()
                .with_context(|| format!("invalid jpeg quality {raw:?}"))?;
            config.jpeg_quality = quality.clamp(1, 100);
        }
        if let Some(raw) = get("RECAPTURE_MS") {
            let millis: u64 = raw
                .parse()
                .with_context(|| format!("invalid recapture delay {raw:?}"))?;
            config.recapture_delay = Duration::from_millis(millis);
        }
        if let Some(raw) = get("SETTLE_MS") {
            let millis: u64 = raw
                .parse()
                .with_context(|| format!("invalid settle delay {raw:?}"))?;
            config.finish_settle = Duration::from_millis(millis);
        }
        if let Some(user) = get("USER") {
            config.user_id = user;
        }

        // An upload URL wins over the output directory.
        if let Some(base_url) = get("UPLOAD_URL") {
            config.upload = UploadTarget::Http {
                base_url: base_url.trim_end_matches('/').to_string(),
                token: get("UPLOAD_TOKEN"),
            };
        } else if let Some(dir) = get("OUTPUT_DIR") {
            config.upload = UploadTarget::Directory(PathBuf::from(dir));
        }

        Ok(config)
    }
}

fn parse_bool(raw: &str) -> Result<bool> {
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(anyhow!("invalid boolean {other:?}")),
    }
}

fn parse_background(raw: &str) -> Result<Background> {
    if raw.eq_ignore_ascii_case("transparent") {
        return Ok(Background::Transparent);
    }

    let hex = raw.trim_start_matches('#');
    if hex.len() != 6 {
        return Err(anyhow!("background must be `transparent` or #rrggbb, got {raw:?}"));
    }
    let value = u32::from_str_radix(hex, 16)
        .with_context(|| format!("invalid background color {raw:?}"))?;
    Ok(Background::Solid([
        (value >> 16) as u8,
        (value >> 8) as u8,
        value as u8,
        255,
    ]))
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn empty_environment_yields_defaults() {
        let config = CaptureConfig::from_lookup(|_| None).unwrap();
        assert_eq!(config, CaptureConfig::default());
    }

    #[test]
    fn upload_url_takes_precedence_over_output_dir() {
        let config = CaptureConfig::from_lookup(lookup_from(&[
            ("FACE_CAPTURE_UPLOAD_URL", "https://api.example.test/v1/"),
            ("FACE_CAPTURE_UPLOAD_TOKEN", "secret"),
            ("FACE_CAPTURE_OUTPUT_DIR", "/tmp/out"),
        ]))
        .unwrap();

        assert_eq!(
            config.upload,
            UploadTarget::Http {
                base_url: "https://api.example.test/v1".to_string(),
                token: Some("secret".to_string()),
            }
        );
    }

    #[test]
    fn parses_solid_background_and_quality() {
        let config = CaptureConfig::from_lookup(lookup_from(&[
            ("FACE_CAPTURE_BACKGROUND", "#102030"),
            ("FACE_CAPTURE_JPEG_QUALITY", "250"),
        ]));
        // 250 does not fit in a u8.
        assert!(config.is_err());

        let config = CaptureConfig::from_lookup(lookup_from(&[
            ("FACE_CAPTURE_BACKGROUND", "#102030"),
            ("FACE_CAPTURE_JPEG_QUALITY", "0"),
            ("FACE_CAPTURE_MIRROR", "off"),
        ]))
        .unwrap();
        assert_eq!(config.background, Background::Solid([0x10, 0x20, 0x30, 255]));
        assert_eq!(config.jpeg_quality, 1);
        assert!(!config.mirror_preview);
    }

    #[test]
    fn rejects_malformed_values() {
        assert!(
            CaptureConfig::from_lookup(lookup_from(&[("FACE_CAPTURE_CAMERA", "front")])).is_err()
        );
        assert!(
            CaptureConfig::from_lookup(lookup_from(&[("FACE_CAPTURE_BACKGROUND", "#12")]))
                .is_err()
        );
    }

    #[test]
    fn face_thresholds_and_delays_are_overridable() {
        let config = CaptureConfig::from_lookup(lookup_from(&[
            ("FACE_CAPTURE_PRESENCE_THRESHOLD", "0.7"),
            ("FACE_CAPTURE_SMILE_RATIO", "0.62"),
            ("FACE_CAPTURE_EYE_CLOSED_RATIO", "0.2"),
            ("FACE_CAPTURE_RECAPTURE_MS", "2000"),
            ("FACE_CAPTURE_SETTLE_MS", "0"),
        ]))
        .unwrap();

        assert_eq!(
            config.face,
            FaceAnalyzerConfig {
                presence_threshold: 0.7,
                eye_closed_ratio: 0.2,
                smile_ratio: 0.62,
            }
        );
        assert_eq!(config.recapture_delay, Duration::from_millis(2_000));
        assert_eq!(config.finish_settle, Duration::ZERO);

        assert!(
            CaptureConfig::from_lookup(lookup_from(&[("FACE_CAPTURE_SETTLE_MS", "soon")]))
                .is_err()
        );
    }
}
