//! Text region detection and fusion engine
//!
//! Locates candidate text regions in screen captures using interchangeable
//! detectors (MSER, stroke width transform, and an adaptive template/proposal
//! detector), and fuses, ranks and tracks their output.
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use text_region_engine::{CancellationToken, DetectorManager, EngineConfig, ImageprocPrimitives};
//!
//! let config = EngineConfig::load()?;
//! let (manager, adaptive) =
//!     DetectorManager::from_config(&config, Arc::new(ImageprocPrimitives::new()), None);
//! let manager = Arc::new(manager);
//! let _ranking = manager.start_ranking()?;
//! let _tuning = adaptive.start_adaptation()?;
//!
//! let regions = manager.detect_optimal(&frame, &CancellationToken::new())?;
//! ```

pub mod aggregator;
pub mod background;
pub mod cancel;
pub mod config;
pub mod detection;
pub mod error;
pub mod logging;
pub mod manager;
pub mod params;
pub mod primitives;
pub mod profile;
pub mod proposal;
pub mod region;

pub use aggregator::{merge_overlapping, RegionAggregator};
pub use background::BackgroundTask;
pub use cancel::CancellationToken;
pub use config::{
    AdaptiveConfig, AggregatorConfig, EngineConfig, ManagerConfig, MserConfig, SwtConfig,
};
pub use detection::{
    AdaptiveDetector, DetectionMethod, MserDetector, RegionTemplate, SwtDetector, TextDetector,
};
pub use error::{Cancelled, ConfigError, DetectionError, ParameterError, ProfileError};
pub use manager::{
    DetectorManager, DetectorPerformanceMetrics, EnsembleSettings, WeightingMode,
};
pub use params::{ParamValue, TunableConfig};
pub use primitives::{ImagePrimitives, ImageprocPrimitives};
pub use profile::{DetectorProfile, ProfileStore};
pub use proposal::{ProposalBatch, ProposalFormat, RawProposal, RegionProposalService};
pub use region::{Point, Rect, RegionType, TextRegion};
