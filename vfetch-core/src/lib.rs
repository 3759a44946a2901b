pub mod acquire;
pub mod artifact;
pub mod catalog;
pub mod config;
pub mod error;
pub mod fetch;
pub mod pipeline;
pub mod process;
pub mod selector;

pub use acquire::{AcquireError, AcquisitionEngine, AcquisitionJob, JobStatus};
pub use artifact::{sweep_stale, Artifact, ArtifactPaths, SweepReport};
pub use catalog::{
    normalize_renditions, CatalogLookup, JsonCatalog, LookupError, RawRendition, Rendition,
    SourceManifest,
};
pub use config::{load_vfetch_config, VfetchConfig};
pub use error::{ConfigError, Result};
pub use fetch::{FetchError, HttpStreamFetcher, StreamFetcher};
pub use pipeline::{Pipeline, PipelineError, PipelineResult};
pub use process::{
    Coordinator, EngineProcess, FfmpegEngine, ProcessError, ProcessingEngine, ProcessingSpec,
};
pub use selector::{select, OutputKind, OutputRequest, QualityPreference, SelectionPlan};
