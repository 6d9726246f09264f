//! Detection strategies
//!
//! Provides interchangeable text region detectors behind one contract.
//!
//! ## Architecture
//!
//! ```text
//! TextDetector
//!   ├── MserDetector      (stable blobs → filter → score → merge)
//!   ├── SwtDetector       (edges → stroke widths → components → group → merge)
//!   └── AdaptiveDetector  (templates → proposals → history weighting)
//! ```
//!
//! ## Usage
//!
//! ```rust,ignore
//! use text_region_engine::detection::{MserDetector, TextDetector};
//!
//! let detector = MserDetector::with_defaults();
//! let regions = detector.detect(&frame, &CancellationToken::new())?;
//! ```

pub mod adaptive;
pub mod mser;
pub mod swt;

use std::collections::BTreeMap;
use std::fmt;

use image::RgbaImage;

use crate::cancel::CancellationToken;
use crate::error::{DetectionError, ParameterError, ProfileError};
use crate::params::ParamValue;
use crate::profile::DetectorProfile;
use crate::region::TextRegion;

pub use adaptive::{AdaptiveDetector, AdaptiveStatistics, DetectionHistoryEntry, RegionTemplate};
pub use mser::MserDetector;
pub use swt::SwtDetector;

/// Algorithm family of a detector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DetectionMethod {
    Mser,
    Swt,
    Adaptive,
    Custom,
}

impl DetectionMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            DetectionMethod::Mser => "Mser",
            DetectionMethod::Swt => "Swt",
            DetectionMethod::Adaptive => "Adaptive",
            DetectionMethod::Custom => "Custom",
        }
    }
}

impl fmt::Display for DetectionMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Detector contract
///
/// Detectors are shared between threads and may be called concurrently.
/// Cancellation surfaces as `DetectionError::Cancelled`; every other error is
/// turned into an empty result by the manager.
pub trait TextDetector: Send + Sync {
    /// Registry key and log name
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    fn method(&self) -> DetectionMethod;

    /// Regions ordered by descending confidence
    fn detect(
        &self,
        image: &RgbaImage,
        cancel: &CancellationToken,
    ) -> Result<Vec<TextRegion>, DetectionError>;

    fn get_parameter(&self, name: &str) -> Option<ParamValue>;

    fn set_parameter(&self, name: &str, value: ParamValue) -> Result<(), ParameterError>;

    /// Snapshot of every tunable parameter
    fn parameters(&self) -> BTreeMap<String, ParamValue>;

    /// Apply several parameters at once; nothing changes on error
    fn apply_parameters(&self, values: &BTreeMap<String, ParamValue>) -> Result<(), ParameterError>;

    /// Persistable state of this detector
    fn export_profile(&self) -> DetectorProfile {
        DetectorProfile::new(self.name(), self.parameters())
    }

    /// Restore state exported by `export_profile`
    fn import_profile(&self, profile: &DetectorProfile) -> Result<(), ProfileError> {
        profile.ensure_detector(self.name())?;
        self.apply_parameters(&profile.parameters)?;
        Ok(())
    }
}

/// Reject images a detector cannot work on
pub(crate) fn validate_image(image: &RgbaImage) -> Result<(), DetectionError> {
    let (width, height) = image.dimensions();
    if width == 0 || height == 0 {
        return Err(DetectionError::InvalidImage { width, height });
    }
    Ok(())
}

/// Fraction of `value` inside [lo, hi], mapped to a 0..1 score that falls off outside
pub(crate) fn band_score(value: f64, lo: f64, hi: f64) -> f64 {
    if value >= lo && value <= hi {
        1.0
    } else if value < lo {
        if lo <= 0.0 {
            0.0
        } else {
            (value / lo).clamp(0.0, 1.0)
        }
    } else if value <= 0.0 {
        0.0
    } else {
        (hi / value).clamp(0.0, 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_method_names() {
        assert_eq!(DetectionMethod::Mser.as_str(), "Mser");
        assert_eq!(DetectionMethod::Adaptive.to_string(), "Adaptive");
    }

    #[test]
    fn test_validate_image() {
        assert!(validate_image(&RgbaImage::new(4, 4)).is_ok());
        assert!(matches!(
            validate_image(&RgbaImage::new(0, 4)),
            Err(DetectionError::InvalidImage { width: 0, height: 4 })
        ));
    }

    #[test]
    fn test_band_score() {
        assert_eq!(band_score(5.0, 2.0, 10.0), 1.0);
        assert_eq!(band_score(1.0, 2.0, 10.0), 0.5);
        assert_eq!(band_score(20.0, 2.0, 10.0), 0.5);
    }
}
