//! Settings for the external tools and the standard templates, loaded from TOML.
//!
//! ```toml
//! fsl_dir = "/opt/fsl"
//! timeout_secs = 7200
//! search_range = 90
//! interpolation = "trilinear"
//!
//! [template]
//! std_head = "/data/templates/custom_2mm"
//! # ...
//! ```

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::Result;

/// Interpolation used when resampling images.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Interpolation {
    Trilinear,
    NearestNeighbour,
    Spline,
    Sinc,
}

impl Interpolation {
    /// The name `flirt` and `applywarp` take.
    pub fn fsl_name(&self) -> &'static str {
        match self {
            Interpolation::Trilinear => "trilinear",
            Interpolation::NearestNeighbour => "nearestneighbour",
            Interpolation::Spline => "spline",
            Interpolation::Sinc => "sinc",
        }
    }
}

impl Interpolation {
    /// The name `applywarp --interp` takes.
    pub fn applywarp_name(&self) -> &'static str {
        match self {
            Interpolation::NearestNeighbour => "nn",
            other => other.fsl_name(),
        }
    }
}

impl Default for Interpolation {
    fn default() -> Interpolation {
        Interpolation::Trilinear
    }
}


/// The 2mm and 4mm standard images. Each path may omit the image extension.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TemplateConfig {
    pub std_head: PathBuf,
    pub std_brain: PathBuf,
    pub std_mask_dil: PathBuf,
    pub std4_head: PathBuf,
    pub std4_brain: PathBuf,
    pub std4_mask_dil: PathBuf,
}

impl TemplateConfig {
    /// The MNI152 templates shipped in `<fsl_dir>/data/standard`.
    pub fn mni152<P: AsRef<Path>>(fsl_dir: P) -> TemplateConfig {
        let std = fsl_dir.as_ref().join("data").join("standard");
        TemplateConfig {
            std_head: std.join("MNI152_T1_2mm"),
            std_brain: std.join("MNI152_T1_2mm_brain"),
            std_mask_dil: std.join("MNI152_T1_2mm_brain_mask_dil"),
            std4_head: std.join("MNI152_T1_4mm"),
            std4_brain: std.join("MNI152_T1_4mm_brain"),
            std4_mask_dil: std.join("MNI152_T1_4mm_brain_mask"),
        }
    }
}


#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct TransformConfig {
    /// FSL installation; tools are taken from its `bin` folder.
    pub fsl_dir: PathBuf,
    /// Per-invocation timeout. `None` waits forever.
    pub timeout_secs: Option<u64>,
    /// Every command line and its output are appended here when set.
    pub log_file: Option<PathBuf>,
    /// Rotation search range in degrees, applied symmetrically on all three axes.
    pub search_range: u32,
    pub interpolation: Interpolation,
    /// `fnirt --config` used for HR to standard.
    pub fnirt_config: String,
    /// `fnirt --warpres`, in mm.
    pub warp_resolution: [u32; 3],
    /// Replaces the MNI152 templates when set.
    pub template: Option<TemplateConfig>,
}

impl Default for TransformConfig {
    fn default() -> TransformConfig {
        let fsl_dir = env::var_os("FSLDIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("/usr/local/fsl"));
        TransformConfig {
            fsl_dir,
            timeout_secs: None,
            log_file: None,
            search_range: 90,
            interpolation: Interpolation::Trilinear,
            fnirt_config: String::from("T1_2_MNI152_2mm"),
            warp_resolution: [10, 10, 10],
            template: None,
        }
    }
}

impl TransformConfig {
    /// Read a configuration file. Missing keys take their default value.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<TransformConfig> {
        let text = fs::read_to_string(path)?;
        TransformConfig::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> Result<TransformConfig> {
        Ok(toml::from_str(text)?)
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }

    /// The custom template if one is configured, the MNI152 ones otherwise.
    pub fn templates(&self) -> TemplateConfig {
        self.template
            .clone()
            .unwrap_or_else(|| TemplateConfig::mni152(&self.fsl_dir))
    }

    /// The identity matrix FSL ships, used to initialise isotropic resampling.
    pub fn identity_matrix(&self) -> PathBuf {
        self.fsl_dir.join("etc").join("flirtsch").join("ident.mat")
    }
}
