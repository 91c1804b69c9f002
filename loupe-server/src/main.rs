//! Loupe caption server: CLIPtion image captioning over a JSON CLI or a
//! JSON-line stdin/stdout loop.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tracing::info;
use tracing_subscriber::EnvFilter;

use loupe_backend_cpu::CpuBackend;
use loupe_core::{CaptionModel, CaptionTokenizer, GenerationConfig};
use loupe_loader::{CaptionerFileConfig, SafeTensorsLoader};
use loupe_model_cliption::{load_cliption_model, CliptionModel};
use loupe_runtime::SelectionPolicy;
use loupe_server::protocol::serve_lines;
use loupe_server::service::{
    CaptionRequest, CaptionService, ErrorResponse, Reply, RequestHandler, ServiceDefaults,
};
use loupe_server::tokenizer::ClipTokenizer;
use loupe_server::vision::FeatureFileExtractor;

type Service = CaptionService<CliptionModel<CpuBackend>, CpuBackend>;

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Selection {
    /// First sampled row
    First,
    /// Highest cumulative log-probability
    Likelihood,
    /// Highest log-probability per token
    Normalized,
}

impl From<Selection> for SelectionPolicy {
    fn from(s: Selection) -> Self {
        match s {
            Selection::First => SelectionPolicy::First,
            Selection::Likelihood => SelectionPolicy::HighestLikelihood,
            Selection::Normalized => SelectionPolicy::LengthNormalized,
        }
    }
}

#[derive(Parser)]
#[command(name = "loupe-caption", about = "CLIPtion image captioning")]
struct Cli {
    /// CLIPtion checkpoint: a .safetensors file or the folder holding it
    #[arg(long)]
    model_path: PathBuf,

    /// CLIP text-encoder weights providing the token and position tables
    #[arg(long)]
    clip_path: PathBuf,

    /// CLIP tokenizer.json (defaults to the one next to --clip-path)
    #[arg(long)]
    tokenizer: Option<PathBuf>,

    /// Image to caption in single-shot mode
    #[arg(long, required_unless_present = "interactive")]
    image_path: Option<String>,

    /// Read JSON requests line by line from stdin
    #[arg(long)]
    interactive: bool,

    /// Use beam search decoding
    #[arg(long)]
    beam_search: bool,

    /// Beam width for beam search
    #[arg(long, default_value = "5")]
    beam_width: usize,

    /// Number of sampled candidates per image
    #[arg(long, default_value = "5")]
    best_of: usize,

    /// Sampling temperature
    #[arg(long, default_value = "1.0")]
    temperature: f32,

    /// Base seed; row r of an image uses seed + r
    #[arg(long, default_value = "42")]
    seed: u64,

    /// Token buffer length (defaults to the model's)
    #[arg(long)]
    max_length: Option<usize>,

    /// Suppress EOS so captions run to the full buffer
    #[arg(long)]
    ramble: bool,

    /// How to choose among best-of candidates
    #[arg(long, value_enum, default_value = "likelihood")]
    selection: Selection,
}

impl Cli {
    fn tokenizer_path(&self) -> PathBuf {
        if let Some(path) = &self.tokenizer {
            return path.clone();
        }
        let dir = if self.clip_path.is_dir() {
            self.clip_path.as_path()
        } else {
            self.clip_path.parent().unwrap_or(Path::new("."))
        };
        dir.join("tokenizer.json")
    }

    fn defaults(&self) -> ServiceDefaults {
        ServiceDefaults {
            beam_search: self.beam_search,
            generation: GenerationConfig {
                temperature: self.temperature,
                best_of: self.best_of,
                beam_width: self.beam_width,
                ramble: self.ramble,
                max_length: self.max_length,
                seed: self.seed,
                ..Default::default()
            },
            selection: self.selection.into(),
        }
    }
}

fn load_service(cli: &Cli) -> anyhow::Result<Service> {
    let backend = CpuBackend::new();

    let tokenizer_path = cli.tokenizer_path();
    let tokenizer = ClipTokenizer::from_file(&tokenizer_path)?;
    let special = tokenizer.special_tokens();
    info!(
        path = %tokenizer_path.display(),
        vocab = tokenizer.vocab_size(),
        bos = special.bos,
        eos = special.eos,
        "tokenizer loaded"
    );

    let config = CaptionerFileConfig::load_or_default(&cli.model_path)?
        .to_captioner_config(tokenizer.vocab_size())?;

    info!("Loading CLIPtion from {}...", cli.model_path.display());
    let checkpoint = SafeTensorsLoader::new(&cli.model_path)?;
    let text_encoder = SafeTensorsLoader::new(&cli.clip_path)?;
    let model = load_cliption_model(&checkpoint, &text_encoder, config, &backend)?;

    let defaults = cli.defaults();
    defaults.generation.validate(model.config().max_length)?;

    Ok(CaptionService::new(
        Arc::new(model),
        backend,
        Arc::new(FeatureFileExtractor::new()),
        Arc::new(tokenizer),
        defaults,
    ))
}

fn fail(error: impl std::fmt::Display) -> ! {
    let payload = ErrorResponse {
        error: error.to_string(),
    };
    match serde_json::to_string(&payload) {
        Ok(json) => println!("{json}"),
        Err(_) => println!("{{\"error\": \"unknown error\"}}"),
    }
    std::process::exit(1);
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // stdout carries protocol JSON only.
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let service = match tokio::task::block_in_place(|| load_service(&cli)) {
        Ok(service) => Arc::new(service),
        Err(e) => fail(format!("{e:#}")),
    };

    if cli.interactive {
        let stdin = tokio::io::BufReader::new(tokio::io::stdin());
        serve_lines(stdin, tokio::io::stdout(), service).await?;
        return Ok(());
    }

    let Some(image) = cli.image_path.clone() else {
        fail("--image-path is required without --interactive");
    };
    let request = CaptionRequest {
        image,
        ..Default::default()
    };
    let reply = tokio::task::spawn_blocking(move || service.handle(&request)).await?;
    match reply {
        Reply::Caption(response) => {
            println!("{}", serde_json::to_string_pretty(&response)?);
            Ok(())
        }
        Reply::Error(e) => fail(e.error),
    }
}
