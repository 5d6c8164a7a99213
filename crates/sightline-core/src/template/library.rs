//! On-disk template library.
//!
//! A template is `<name>.png` plus an optional `<name>.json` sidecar:
//!
//! ```json
//! {
//!   "created_date": "2024-03-01T09:30:00Z",
//!   "usage_count": 42,
//!   "success_rate": 0.93,
//!   "confidence_threshold": 0.8,
//!   "scale_factors": [0.9, 1.0, 1.1],
//!   "description": "OK button on the login dialog"
//! }
//! ```
//!
//! Missing sidecar fields fall back to the template configuration. Usage
//! statistics are written back after every lookup via a temp file and a
//! rename, so a crash never leaves a truncated sidecar.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use image::GrayImage;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::TemplateConfig;
use crate::error::{EngineError, Result};
use crate::frame::Frame;
use crate::geometry::Rect;

/// Sidecar metadata for one template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemplateMeta {
    pub created_date: DateTime<Utc>,
    #[serde(default)]
    pub usage_count: u64,
    #[serde(default)]
    pub success_rate: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence_threshold: Option<f32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub scale_factors: Vec<f32>,
    #[serde(default)]
    pub description: String,
}

impl TemplateMeta {
    fn fresh(description: impl Into<String>) -> Self {
        Self {
            created_date: Utc::now(),
            usage_count: 0,
            success_rate: 0.0,
            confidence_threshold: None,
            scale_factors: Vec::new(),
            description: description.into(),
        }
    }

    /// Fold one outcome into the rolling success rate.
    pub fn record(&mut self, success: bool) {
        self.usage_count += 1;
        let n = self.usage_count as f64;
        let s = if success { 1.0 } else { 0.0 };
        self.success_rate = (self.success_rate * (n - 1.0) + s) / n;
    }
}

/// A loaded template image with its metadata.
#[derive(Debug, Clone)]
pub struct Template {
    pub name: String,
    pub image: GrayImage,
    pub meta: TemplateMeta,
    /// Effective threshold (sidecar value or configured default).
    pub confidence_threshold: f32,
    /// Effective scales (sidecar value or configured default).
    pub scale_factors: Vec<f32>,
}

/// Summary row for listings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemplateInfo {
    pub name: String,
    pub width: u32,
    pub height: u32,
    pub confidence_threshold: f32,
    pub scale_factors: Vec<f32>,
    pub usage_count: u64,
    pub success_rate: f64,
    pub description: String,
}

#[derive(Debug)]
pub struct TemplateLibrary {
    directory: PathBuf,
    default_threshold: f32,
    default_scales: Vec<f32>,
    templates: BTreeMap<String, Template>,
}

impl TemplateLibrary {
    /// Load every `*.png` in the configured directory.
    ///
    /// A missing directory yields an empty library. Unreadable images are
    /// skipped with a warning.
    pub fn load(config: &TemplateConfig) -> Result<Self> {
        let mut library = Self {
            directory: config.template_directory.clone(),
            default_threshold: config.confidence_threshold,
            default_scales: config.default_scale_factors.clone(),
            templates: BTreeMap::new(),
        };
        library.reload()?;
        Ok(library)
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Re-read the template directory.
    pub fn reload(&mut self) -> Result<()> {
        self.templates.clear();

        if !self.directory.exists() {
            warn!(dir = %self.directory.display(), "template directory does not exist");
            return Ok(());
        }

        let entries = std::fs::read_dir(&self.directory).map_err(|e| {
            EngineError::TemplateDetector(format!(
                "cannot read template directory {}: {}",
                self.directory.display(),
                e
            ))
        })?;

        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("png") {
                continue;
            }
            let Some(name) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            match self.load_one(name, &path) {
                Ok(template) => {
                    self.templates.insert(name.to_string(), template);
                }
                Err(e) => warn!(template = name, error = %e, "skipping template"),
            }
        }

        info!(
            dir = %self.directory.display(),
            count = self.templates.len(),
            "template library loaded"
        );
        Ok(())
    }

    fn load_one(&self, name: &str, path: &Path) -> Result<Template> {
        let image = image::open(path)
            .map_err(|e| EngineError::TemplateDetector(format!("{}: {}", path.display(), e)))?
            .to_luma8();

        let sidecar = self.sidecar_path(name);
        let meta = if sidecar.exists() {
            let text = std::fs::read_to_string(&sidecar)?;
            serde_json::from_str(&text).map_err(|e| {
                EngineError::TemplateDetector(format!("{}: {}", sidecar.display(), e))
            })?
        } else {
            TemplateMeta::fresh("")
        };

        Ok(self.build(name, image, meta))
    }

    fn build(&self, name: &str, image: GrayImage, meta: TemplateMeta) -> Template {
        let confidence_threshold = meta.confidence_threshold.unwrap_or(self.default_threshold);
        let scale_factors = if meta.scale_factors.is_empty() {
            self.default_scales.clone()
        } else {
            meta.scale_factors.clone()
        };
        Template {
            name: name.to_string(),
            image,
            meta,
            confidence_threshold,
            scale_factors,
        }
    }

    fn sidecar_path(&self, name: &str) -> PathBuf {
        self.directory.join(format!("{}.json", name))
    }

    pub fn get(&self, name: &str) -> Option<&Template> {
        self.templates.get(name)
    }

    pub fn len(&self) -> usize {
        self.templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }

    pub fn list(&self) -> Vec<TemplateInfo> {
        self.templates
            .values()
            .map(|t| TemplateInfo {
                name: t.name.clone(),
                width: t.image.width(),
                height: t.image.height(),
                confidence_threshold: t.confidence_threshold,
                scale_factors: t.scale_factors.clone(),
                usage_count: t.meta.usage_count,
                success_rate: t.meta.success_rate,
                description: t.meta.description.clone(),
            })
            .collect()
    }

    /// Update usage statistics and persist the sidecar.
    ///
    /// Persistence failures are logged and otherwise ignored.
    pub fn record_usage(&mut self, name: &str, success: bool) {
        let Some(template) = self.templates.get_mut(name) else {
            return;
        };
        template.meta.record(success);
        let meta = template.meta.clone();
        if let Err(e) = self.write_sidecar(name, &meta) {
            warn!(template = name, error = %e, "failed to persist template statistics");
        }
    }

    fn write_sidecar(&self, name: &str, meta: &TemplateMeta) -> Result<()> {
        let path = self.sidecar_path(name);
        let tmp = self.directory.join(format!(".{}.json.tmp", name));
        std::fs::write(&tmp, serde_json::to_vec_pretty(meta)?)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }

    /// Crop `region` (frame-local) out of `frame` and store it as a new
    /// template, replacing any template with the same name.
    pub fn capture(
        &mut self,
        name: &str,
        frame: &Frame,
        region: &Rect,
        description: &str,
    ) -> Result<TemplateInfo> {
        validate_name(name)?;

        let crop = frame.crop(region)?;
        std::fs::create_dir_all(&self.directory)?;
        let png = self.directory.join(format!("{}.png", name));
        crop.image().save(&png)?;

        let meta = TemplateMeta::fresh(description);
        self.write_sidecar(name, &meta)?;

        let template = self.build(name, crop.to_luma(), meta);
        debug!(
            template = name,
            width = template.image.width(),
            height = template.image.height(),
            "captured template"
        );
        self.templates.insert(name.to_string(), template);

        self.list()
            .into_iter()
            .find(|t| t.name == name)
            .ok_or_else(|| EngineError::TemplateDetector(format!("template '{}' vanished", name)))
    }
}

/// A template name must stay a single file name inside the library
/// directory on every platform.
fn validate_name(name: &str) -> Result<()> {
    let path_like = name.is_empty()
        || name.starts_with('.')
        || name.contains("..")
        || name.contains(['/', '\\', ':'])
        || name.chars().any(char::is_control);
    if path_like {
        return Err(EngineError::Config(format!(
            "invalid template name '{}': expected a plain file name",
            name
        )));
    }
    Ok(())
}
