//! Sheet Grader - Handwritten answer sheet grading
//!
//! Reads a photographed answer sheet line by line with a TrOCR model and
//! scores every line against an answer key by character n-gram similarity.

mod config;
mod errors;
mod grading;
mod pipeline;
mod server;
mod storage;
mod vision;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use crate::config::AppConfig;
use crate::grading::{AnswerKey, GradingRecord, SimilarityMatcher, Status, Threshold};
use crate::pipeline::GradingPipeline;
use crate::server::AppState;
use crate::vision::{ModelFile, ModelManager, TrOcrRecognizer};

/// Sheet Grader - grade handwritten answer sheets
#[derive(Parser, Debug)]
#[command(name = "sheet-grader")]
#[command(about = "Grade handwritten answer sheets against an answer key")]
struct Args {
    /// Configuration file (defaults to the platform config directory)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Grade one answer sheet
    Grade {
        /// Photo or scan of the answer sheet
        #[arg(short, long)]
        image: PathBuf,

        /// Expected answers, in question order
        #[arg(short, long, num_args = 1.., conflicts_with = "answer_file")]
        answers: Vec<String>,

        /// JSON answer key (a list, or an object with an "answers" list)
        #[arg(long)]
        answer_file: Option<PathBuf>,

        /// Pass threshold (0.0 - 1.0), overrides the config
        #[arg(short, long)]
        threshold: Option<f64>,

        /// Write the grading record to this JSON file
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Only print the final score
        #[arg(short, long)]
        quiet: bool,
    },

    /// Score one typed answer against the key (no model needed)
    Score {
        /// Candidate answer text
        text: String,

        /// Expected answers, in question order
        #[arg(short, long, num_args = 1.., required = true)]
        answers: Vec<String>,

        /// Pass threshold (0.0 - 1.0), overrides the config
        #[arg(short, long)]
        threshold: Option<f64>,
    },

    /// Print the detected line regions of a sheet
    Lines {
        #[arg(short, long)]
        image: PathBuf,
    },

    /// Show recognition model status
    Models {
        /// Download missing model files
        #[arg(long)]
        download: bool,
    },

    /// Start the REST server
    Serve {
        #[arg(long)]
        host: Option<String>,

        #[arg(short, long)]
        port: Option<u16>,
    },
}

fn main() -> Result<()> {
    let args = Args::parse();

    // RUST_LOG wins over --verbose
    let default_level = if args.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let subscriber = FmtSubscriber::builder().with_env_filter(filter).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = load_or_create_config(args.config.as_deref())?;

    match args.command {
        Command::Grade {
            image,
            answers,
            answer_file,
            threshold,
            output,
            quiet,
        } => {
            let key = match answer_file {
                Some(path) => AnswerKey::load(&path)
                    .with_context(|| format!("Failed to load answer key {:?}", path))?,
                None if !answers.is_empty() => AnswerKey::new(answers)?,
                None => bail!("Provide --answers or --answer-file"),
            };
            let threshold = Threshold::new(threshold.unwrap_or(config.grading.threshold))?;
            let output = output.or_else(|| config.output.path.clone());

            run_grade(&config, &image, &key, threshold, output.as_deref(), quiet)
        }
        Command::Score {
            text,
            answers,
            threshold,
        } => {
            let key = AnswerKey::new(answers)?;
            let threshold = Threshold::new(threshold.unwrap_or(config.grading.threshold))?;
            run_score(&text, key, threshold)
        }
        Command::Lines { image } => run_lines(&config, &image),
        Command::Models { download } => run_models(&config, download),
        Command::Serve { host, port } => {
            let host = host.unwrap_or_else(|| config.server.host.clone());
            let port = port.unwrap_or(config.server.port);
            run_server(&config, &host, port)
        }
    }
}

/// Load configuration from `--config`, the config directory, or defaults
fn load_or_create_config(explicit: Option<&Path>) -> Result<AppConfig> {
    if let Some(path) = explicit {
        let config = config::load_config(path)
            .with_context(|| format!("Failed to load configuration {:?}", path))?;
        info!("Loaded configuration from {:?}", path);
        return Ok(config);
    }

    if let Ok(config_dir) = storage::get_config_dir() {
        let config_path = config_dir.join("config.toml");
        if config_path.exists() {
            match config::load_config(&config_path) {
                Ok(config) => {
                    info!("Loaded configuration from {:?}", config_path);
                    return Ok(config);
                }
                Err(e) => warn!("Ignoring invalid configuration {:?}: {:#}", config_path, e),
            }
        }
    }

    info!("Using default configuration");
    Ok(AppConfig::default())
}

fn build_pipeline(config: &AppConfig) -> Result<GradingPipeline> {
    let manager = ModelManager::new(&config.recognizer)?;
    let recognizer = TrOcrRecognizer::load(&config.recognizer, &manager)?;
    Ok(GradingPipeline::new(config, Arc::new(recognizer)))
}

fn run_grade(
    config: &AppConfig,
    image: &Path,
    key: &AnswerKey,
    threshold: Threshold,
    output: Option<&Path>,
    quiet: bool,
) -> Result<()> {
    let pipeline = build_pipeline(config)?;
    let record = pipeline.grade_path(image, key, threshold)?;

    if !quiet {
        print_record(&record);
    }
    if let Some(summary) = &record.summary {
        println!(
            "Final score: {}/{} ({:.1}%)",
            summary.passed, summary.total_questions, summary.percentage
        );
    }

    if let Some(path) = output {
        match storage::results::write_json(path, &record) {
            Ok(()) => info!("Saved grading record to {:?}", path),
            Err(e) => warn!("Could not save grading record: {}", e),
        }
    }

    Ok(())
}

fn print_record(record: &GradingRecord) {
    println!("{}", "=".repeat(60));
    for result in &record.results {
        println!("Question {}: {}", result.question, result.status);
        println!("  Expected: {}", result.expected);
        println!("  Student:  {}", result.student);
        println!("  Similarity: {:.2}", result.similarity);
        if let Some(note) = &result.note {
            println!("  Note: {}", note);
        }
    }
    println!("{}", "=".repeat(60));
}

fn run_score(text: &str, key: AnswerKey, threshold: Threshold) -> Result<()> {
    let matcher = SimilarityMatcher::new(key.clone(), threshold);

    for (i, expected) in key.answers().iter().enumerate() {
        println!(
            "  Q{} {:.2}  {}",
            i + 1,
            matcher.score_against(text, i),
            expected
        );
    }
    if let Some(note) = matcher.evaluate(text).note() {
        println!("Note: {}", note);
    }

    let status = if matcher.is_correct(text) { Status::Pass } else { Status::Fail };
    println!("Best: {:.2} ({}, threshold {})", matcher.score(text), status, threshold);

    Ok(())
}

fn run_lines(config: &AppConfig, image: &Path) -> Result<()> {
    let image = GradingPipeline::load_image(image)?;
    let segmentation = pipeline::detect_regions(config, &image)?;

    if segmentation.used_fallback {
        println!("No text lines found; using {} equal bands", segmentation.regions.len());
    }
    for (i, region) in segmentation.regions.iter().enumerate() {
        println!(
            "Line {}: rows {}..{} ({} px)",
            i + 1,
            region.start,
            region.end,
            region.height()
        );
    }

    Ok(())
}

fn run_models(config: &AppConfig, download: bool) -> Result<()> {
    let manager = ModelManager::new(&config.recognizer)?;

    if download {
        manager.download_all_with_progress(|file: ModelFile, downloaded, total| match total {
            Some(total) if total > 0 => debug!(
                "{}: {:.1}%",
                file.display_name(),
                downloaded as f64 / total as f64 * 100.0
            ),
            _ => debug!("{}: {} bytes", file.display_name(), downloaded),
        })?;
    }

    let ready = if manager.are_models_ready() { "ready" } else { "incomplete" };
    println!("Model {} in {:?} ({})", manager.model_id(), manager.models_dir(), ready);
    for status in manager.get_model_status() {
        let state = match (status.available, status.verified) {
            (false, _) => "missing",
            (true, Some(false)) => "checksum mismatch",
            (true, Some(true)) => "ok (verified)",
            (true, None) => "ok",
        };
        let size = status
            .size_bytes
            .map(|b| format!("{:.1} MB", b as f64 / (1024.0 * 1024.0)))
            .unwrap_or_else(|| "-".to_string());
        println!("  {:<12} {:<20} {}", status.file.display_name(), state, size);
    }

    Ok(())
}

fn run_server(config: &AppConfig, host: &str, port: u16) -> Result<()> {
    let pipeline = build_pipeline(config)?;
    let state = AppState::from_config(config, pipeline)?;

    tokio::runtime::Runtime::new()?.block_on(server::run(config, state, host, port))
}
