use crate::{
    config::PipelineOptions,
    core::splitter::{Separator, Stem},
    error::{Result, StemError},
    io::{
        ffmpeg::{Ffmpeg, Transcoder},
        paths::job_dir_name,
        ytdlp::{Downloader, YtDlp},
    },
    model::backend::load_separation_model,
    pipeline::{
        acquisition::Acquisition,
        observer::ProgressStream,
        refiner::Refiner,
        tracker::{ProgressTracker, StageWindow},
    },
    types::{RefineRequest, RefineResponse, SeparateRequest, SeparateResponse},
};

use std::{path::Path, sync::Arc};
use tracing::{error, info, info_span};

/// Marks the job terminal when dropped, whatever path the job took.
struct JobGuard<'a> {
    tracker: &'a ProgressTracker,
    key: &'a str,
}

impl Drop for JobGuard<'_> {
    fn drop(&mut self) {
        self.tracker.finish(self.key);
    }
}

/// Runs acquisition, separation and optional refinement for one job at a
/// time per key, reporting into a shared [`ProgressTracker`].
pub struct Pipeline {
    options: PipelineOptions,
    tracker: Arc<ProgressTracker>,
    acquisition: Acquisition,
    separator: Separator,
    refiner: Refiner,
}

impl Pipeline {
    /// Load the configured model and wire the external tools.
    pub fn new(options: PipelineOptions, tracker: Arc<ProgressTracker>) -> Result<Self> {
        let model = load_separation_model(&options.model)?;
        let ffmpeg: Arc<dyn Transcoder> = Arc::new(Ffmpeg::new(
            options.tools.ffmpeg.clone(),
            options.tools.transcode_timeout(),
            options.tools.refine_timeout(),
        ));
        let ytdlp: Arc<dyn Downloader> = Arc::new(YtDlp::new(options.tools.ytdlp.clone()));

        let acquisition = Acquisition::standard(options.staging_dir.clone(), ytdlp, ffmpeg.clone());
        let separator = Separator::new(model, options.output_dir.clone()).with_transcoder(ffmpeg.clone());
        let refiner = Refiner::new(ffmpeg, &options.refine);

        Ok(Self::with_components(options, tracker, acquisition, separator, refiner))
    }

    pub fn with_components(
        options: PipelineOptions,
        tracker: Arc<ProgressTracker>,
        acquisition: Acquisition,
        separator: Separator,
        refiner: Refiner,
    ) -> Self {
        Self {
            options,
            tracker,
            acquisition,
            separator,
            refiner,
        }
    }

    pub fn tracker(&self) -> &Arc<ProgressTracker> {
        &self.tracker
    }

    pub fn options(&self) -> &PipelineOptions {
        &self.options
    }

    /// Requested key, or the configured default.
    pub fn job_key(&self, requested: Option<&str>) -> String {
        match requested {
            Some(k) if !k.trim().is_empty() => k.to_string(),
            _ => self.options.progress.default_job_key.clone(),
        }
    }

    /// Progress stream for `key` at the configured poll interval.
    pub fn observe(&self, key: &str) -> ProgressStream {
        ProgressStream::new(
            self.tracker.clone(),
            key,
            self.options.progress.poll_interval(),
        )
    }

    pub fn separate(&self, req: &SeparateRequest) -> Result<SeparateResponse> {
        let key = self.job_key(req.job_key.as_deref());
        self.tracker.begin(&key)?;
        let _guard = JobGuard {
            tracker: &self.tracker,
            key: &key,
        };
        let _span = info_span!("separate", job = %key).entered();

        let locator = req.url.trim();
        if locator.is_empty() {
            return Err(StemError::InvalidRequest("missing media locator".into()));
        }

        let acquired = self
            .acquisition
            .acquire(
                locator,
                &key,
                &self.tracker.stage_sink(&key, StageWindow::ACQUISITION),
            )
            .ok_or_else(|| {
                error!("every acquisition strategy failed");
                StemError::Acquisition {
                    locator: locator.to_string(),
                }
            })?;

        let output_dir = self.separator.output_dir().join(job_dir_name(&key));
        let separation = self
            .separator
            .separate_into(
                &acquired,
                &output_dir,
                &self.tracker.stage_sink(&key, StageWindow::SEPARATION),
            )
            .map_err(|e| {
                error!("separation failed: {}", e);
                e
            })?;

        let mut stems = separation.stems;
        let raw_vocals = stems
            .get(Stem::Vocals)
            .ok_or_else(|| StemError::NotFound("vocals stem".into()))?
            .to_path_buf();

        let vocals = if req.refine {
            let target = self.options.refine.stem;
            let source = stems
                .get(target)
                .ok_or_else(|| StemError::NotFound(format!("{target} stem")))?
                .to_path_buf();
            let refined = self.refiner.refine(
                &source,
                None,
                &self.tracker.stage_sink(&key, StageWindow::REFINEMENT),
            );
            stems.set_refined(target, refined.clone());
            refined
        } else {
            raw_vocals
        };

        info!("job complete: {} stems", stems.len());
        Ok(SeparateResponse {
            original: acquired.path.display().to_string(),
            separated: stems.to_map(),
            vocals: vocals.display().to_string(),
            instrumental: separation.instrumental.display().to_string(),
        })
    }

    pub fn refine(&self, req: &RefineRequest) -> Result<RefineResponse> {
        let key = self.job_key(req.job_key.as_deref());
        self.tracker.begin(&key)?;
        let _guard = JobGuard {
            tracker: &self.tracker,
            key: &key,
        };
        let _span = info_span!("refine", job = %key).entered();

        if req.path.trim().is_empty() {
            return Err(StemError::InvalidRequest("missing path".into()));
        }
        let input = Path::new(&req.path);
        if !input.is_file() {
            return Err(StemError::NotFound(req.path.clone()));
        }

        let refined = self.refiner.refine(
            input,
            None,
            &self.tracker.stage_sink(&key, StageWindow::STANDALONE),
        );
        Ok(RefineResponse {
            original: req.path.clone(),
            refined: refined.display().to_string(),
        })
    }
}
