pub mod config;
pub mod error;
pub mod logging;
pub mod types;

pub mod core {
    pub mod audio;
    pub mod denoise;
    pub mod dsp;
    pub mod engine;
    pub mod percent;
    pub mod splitter;
}

pub mod model {
    pub mod backend;
    pub mod model_manager;
    pub mod registry;
}

pub mod io {
    pub mod crypto;
    pub mod ffmpeg;
    pub mod net;
    pub mod paths;
    pub mod process;
    pub mod progress;
    pub mod ytdlp;
}

pub mod pipeline {
    pub mod acquisition;
    pub mod observer;
    pub mod orchestrator;
    pub mod refiner;
    pub mod tracker;
}

// Public API
pub use crate::config::PipelineOptions;
pub use crate::core::splitter::{Separation, Separator, Stem, StemSet};
pub use crate::error::{ErrorPayload, Result, StemError};
pub use crate::io::progress::{NoProgress, ProgressSink, ScaledSink};
pub use crate::model::backend::{load_separation_model, SeparationModel};
pub use crate::model::model_manager::{ensure_model, load_model_from_path, ModelHandle};
pub use crate::pipeline::{
    acquisition::{Acquisition, AcquisitionStrategy},
    observer::{ProgressEvent, ProgressStream},
    orchestrator::Pipeline,
    refiner::Refiner,
    tracker::{ProgressTracker, StageWindow},
};
pub use crate::types::{
    AcquiredAudio, AudioData, ModelManifest, RefineRequest, RefineResponse, SeparateRequest,
    SeparateResponse,
};

/// Resolve and load the configured model once, ahead of the first job.
pub fn prepare_model(opts: &config::ModelOptions) -> Result<()> {
    let model = load_separation_model(opts)?;
    tracing::info!(
        "model ready: {} Hz, stems {:?}",
        model.sample_rate(),
        model.stem_names()
    );
    Ok(())
}
