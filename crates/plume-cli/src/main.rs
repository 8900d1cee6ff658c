use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use plume_contracts::{ClientConfig, GeneratedImage, GenerationRequest};
use plume_engine::{CancelToken, ErrorClass, GenerationError, ImageEngine};
use serde_json::json;
use tracing::debug;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "plume-rs", version, about = "Generate images through Gemini, Vertex AI or Bedrock")]
struct Cli {
    /// JSON config file; environment variables take precedence over its credentials.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Log debug output to stderr. RUST_LOG overrides this.
    #[arg(long, short, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Generate(GenerateArgs),
    Models(ModelsArgs),
}

#[derive(Debug, Parser)]
struct GenerateArgs {
    #[arg(long)]
    prompt: String,
    /// Model id or alias. Defaults to the config's default_model, then the
    /// highest-priority model with credentials.
    #[arg(long)]
    model: Option<String>,
    #[arg(long, default_value = "")]
    size: String,
    #[arg(long)]
    aspect_ratio: Option<String>,
    #[arg(long)]
    style: Option<String>,
    #[arg(long)]
    negative_prompt: Option<String>,
    #[arg(long, allow_negative_numbers = true)]
    seed: Option<i64>,
    /// Output file, or a directory to write `<request_id>.<ext>` into.
    #[arg(long, default_value = ".")]
    out: PathBuf,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Parser)]
struct ModelsArgs {
    #[arg(long)]
    json: bool,
}

fn main() {
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("plume-rs error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    let config = match cli.config.as_deref() {
        Some(path) => ClientConfig::load(path)?,
        None => ClientConfig::default(),
    };
    debug!(?config, "loaded config");
    let engine = ImageEngine::new(config);
    match cli.command {
        Command::Generate(args) => run_generate(&engine, args),
        Command::Models(args) => run_models(&engine, args),
    }
}

fn init_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .try_init();
}

fn run_generate(engine: &ImageEngine, args: GenerateArgs) -> Result<i32> {
    let request = build_request(&args);
    let image = match engine.generate(&request, &CancelToken::new()) {
        Ok(image) => image,
        Err(err) => {
            eprintln!("plume-rs error: {err}");
            return Ok(exit_code(&err));
        }
    };

    let path = output_path(&args.out, &image);
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed creating {}", parent.display()))?;
    }
    fs::write(&path, &image.data).with_context(|| format!("failed to write {}", path.display()))?;

    let mut stdout = io::stdout().lock();
    if args.json {
        let summary = json!({
            "path": path.display().to_string(),
            "format": image.format,
            "width": image.width,
            "height": image.height,
            "bytes": image.data.len(),
            "metadata": image.metadata,
        });
        writeln!(stdout, "{}", serde_json::to_string_pretty(&summary)?)?;
    } else {
        writeln!(
            stdout,
            "{} ({}x{} {}, model {})",
            path.display(),
            image.width,
            image.height,
            image.format,
            image.metadata("model").unwrap_or("unknown")
        )?;
    }
    Ok(0)
}

fn run_models(engine: &ImageEngine, args: ModelsArgs) -> Result<i32> {
    let models = engine.models();
    let mut stdout = io::stdout().lock();
    if args.json {
        let rows = models
            .iter()
            .map(|status| {
                json!({
                    "id": status.spec.id,
                    "display_name": status.spec.display_name,
                    "aliases": status.spec.aliases,
                    "family": status.spec.family,
                    "priority": status.spec.priority,
                    "required_credentials": status.spec.required_credentials,
                    "usd_per_image": status.spec.pricing.usd_per_image,
                    "has_credentials": status.has_credentials,
                })
            })
            .collect::<Vec<_>>();
        writeln!(stdout, "{}", serde_json::to_string_pretty(&rows)?)?;
        return Ok(0);
    }
    for status in &models {
        writeln!(
            stdout,
            "{:<36} {:<8} {:<5} {}",
            status.spec.id,
            status.spec.family.as_str(),
            if status.has_credentials { "ready" } else { "-" },
            status.spec.aliases.join(", ")
        )?;
    }
    Ok(0)
}

fn build_request(args: &GenerateArgs) -> GenerationRequest {
    let mut request = GenerationRequest::new(args.prompt.clone()).with_size(args.size.clone());
    request.model = args.model.clone();
    request.options.aspect_ratio = args.aspect_ratio.clone();
    request.options.style = args.style.clone();
    request.options.negative_prompt = args.negative_prompt.clone();
    request.options.seed = args.seed;
    request
}

fn output_path(out: &Path, image: &GeneratedImage) -> PathBuf {
    if out.is_dir() {
        let stem = image.metadata("request_id").unwrap_or("image");
        return out.join(format!("{stem}.{}", image.format.extension()));
    }
    out.to_path_buf()
}

fn exit_code(err: &GenerationError) -> i32 {
    match err.class() {
        ErrorClass::Validation => 2,
        ErrorClass::Authentication => 3,
        ErrorClass::CircuitOpen => 4,
        ErrorClass::RateLimited | ErrorClass::Transient | ErrorClass::Permanent => 1,
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use plume_contracts::ImageFormat;

    use super::*;

    fn image() -> GeneratedImage {
        GeneratedImage {
            data: vec![1, 2, 3],
            format: ImageFormat::Webp,
            width: 1024,
            height: 1024,
            metadata: BTreeMap::from([("request_id".to_string(), "abc".to_string())]),
        }
    }

    #[test]
    fn generate_args_map_onto_request() -> anyhow::Result<()> {
        let cli = Cli::try_parse_from([
            "plume-rs",
            "generate",
            "--prompt",
            "a red fox",
            "--model",
            "nova-canvas",
            "--size",
            "1024x1024",
            "--seed",
            "42",
            "--style",
            "premium",
        ])?;
        let Command::Generate(args) = cli.command else {
            panic!("expected generate");
        };
        let request = build_request(&args);
        assert_eq!(request.model(), Some("nova-canvas"));
        assert_eq!(request.options.size, "1024x1024");
        assert_eq!(request.options.seed, Some(42));
        assert_eq!(request.options.style(), Some("premium"));
        assert!(request.options.negative_prompt.is_none());
        Ok(())
    }

    #[test]
    fn global_flags_work_after_subcommand() -> anyhow::Result<()> {
        let cli = Cli::try_parse_from(["plume-rs", "models", "--json", "--verbose", "--config", "plume.json"])?;
        assert!(cli.verbose);
        assert_eq!(cli.config, Some(PathBuf::from("plume.json")));
        assert!(matches!(cli.command, Command::Models(ModelsArgs { json: true })));
        Ok(())
    }

    #[test]
    fn directory_output_uses_request_id_and_format() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        assert_eq!(output_path(temp.path(), &image()), temp.path().join("abc.webp"));
        let file = temp.path().join("fox.png");
        assert_eq!(output_path(&file, &image()), file);
        Ok(())
    }

    #[test]
    fn exit_codes_follow_error_class() {
        assert_eq!(exit_code(&GenerationError::validation("bedrock", "bad width")), 2);
        assert_eq!(
            exit_code(&GenerationError::MissingCredentials {
                backend: "gemini".to_string(),
                keys: vec!["GEMINI_API_KEY".to_string()],
                one_of: Vec::new(),
            }),
            3
        );
        assert_eq!(
            exit_code(&GenerationError::Http {
                backend: "gemini".to_string(),
                status: 503,
                body: String::new(),
            }),
            1
        );
    }
}
