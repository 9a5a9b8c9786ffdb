use std::{
    io::Write,
    path::{Path, PathBuf},
    process::ExitCode,
    sync::Arc,
    thread,
};

use clap::{Parser, Subcommand};
use stem_pipeline::{
    config::PipelineOptions, logging::init_logging, prepare_model, ErrorPayload, Pipeline,
    ProgressTracker, RefineRequest, SeparateRequest, StemError,
};

#[derive(Parser)]
#[command(name = "stem-pipeline", version, about = "Download, separate and refine audio stems")]
struct Cli {
    /// TOML configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Download a remote track and split it into stems
    Separate {
        /// Remote media locator
        locator: String,

        /// Also refine the vocal stem
        #[arg(long)]
        refine: bool,

        /// Identifier for progress tracking
        #[arg(long)]
        job_key: Option<String>,

        /// Overrides the configured output directory
        #[arg(short, long)]
        output_dir: Option<PathBuf>,

        /// Stream progress events to stderr
        #[arg(long)]
        progress: bool,
    },
    /// Refine an existing vocal track
    Refine {
        path: PathBuf,

        #[arg(long)]
        job_key: Option<String>,

        #[arg(long)]
        progress: bool,
    },
    /// Download, verify and load the separation model
    PrepareModel,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let options = match PipelineOptions::load(cli.config.as_deref()) {
        Ok(o) => o,
        Err(e) => {
            eprintln!("error: {e}");
            return ExitCode::FAILURE;
        }
    };
    init_logging(&options.log_level);

    match run(cli.command, options) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{}", e);
            let payload = ErrorPayload::from(&e);
            eprintln!("error: {}", payload.error);
            ExitCode::FAILURE
        }
    }
}

fn run(command: Command, mut options: PipelineOptions) -> Result<(), StemError> {
    match command {
        Command::PrepareModel => prepare_model(&options.model),
        Command::Separate {
            locator,
            refine,
            job_key,
            output_dir,
            progress,
        } => {
            if let Some(dir) = output_dir {
                options.output_dir = dir;
            }
            let pipeline = build_pipeline(options)?;
            let key = pipeline.job_key(job_key.as_deref());
            let req = SeparateRequest {
                url: locator,
                refine,
                job_key: Some(key.clone()),
            };
            let res = with_progress(&pipeline, &key, progress, || pipeline.separate(&req))?;

            println!("original: {}", res.original);
            for (name, path) in &res.separated {
                println!("{name}: {path}");
            }
            println!("vocals: {}", res.vocals);
            println!("instrumental: {}", res.instrumental);
            Ok(())
        }
        Command::Refine {
            path,
            job_key,
            progress,
        } => {
            let pipeline = build_pipeline(options)?;
            let key = pipeline.job_key(job_key.as_deref());
            let req = RefineRequest {
                path: path_string(&path),
                job_key: Some(key.clone()),
            };
            let res = with_progress(&pipeline, &key, progress, || pipeline.refine(&req))?;
            println!("original: {}", res.original);
            println!("refined: {}", res.refined);
            Ok(())
        }
    }
}

fn build_pipeline(options: PipelineOptions) -> Result<Pipeline, StemError> {
    let tracker = Arc::new(ProgressTracker::with_duplicate_rejection(
        options.progress.reject_duplicate_jobs,
    ));
    Pipeline::new(options, tracker)
}

/// Run `job`, printing the progress stream for `key` from a scoped thread.
fn with_progress<T>(
    pipeline: &Pipeline,
    key: &str,
    enabled: bool,
    job: impl FnOnce() -> Result<T, StemError>,
) -> Result<T, StemError> {
    if !enabled {
        return job();
    }
    thread::scope(|s| {
        let stream = pipeline.observe(key);
        s.spawn(move || {
            let mut err = std::io::stderr().lock();
            for event in stream {
                let _ = write!(err, "{}", event.to_sse());
            }
        });
        job()
    })
}

fn path_string(p: &Path) -> String {
    p.to_string_lossy().into_owned()
}
