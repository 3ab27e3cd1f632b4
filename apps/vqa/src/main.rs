use anyhow::{anyhow, bail};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;
use vlm::{
    image::DynamicImage,
    qwen2_vl::{Qwen2VL, Qwen2VLLoader, MODEL_ID},
    ContentBlock, ImageQueryModel, ImageQueryPair, Message, ModelAdapter, Processor,
    QuantizationMode, Query, Settings,
};

/// Ask Qwen2-VL questions about images.
#[derive(Parser, Debug)]
#[command(name = "vqa", version, about)]
struct Cli {
    /// Hub model id or a local directory with the same files
    #[arg(long, default_value = MODEL_ID)]
    model: String,

    /// none, 8 or 4
    #[arg(long, default_value_t = QuantizationMode::None)]
    quantization: QuantizationMode,

    /// Write logs to <LOG_DIR>/vlm.log instead of stderr
    #[arg(long)]
    log_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Answer one query per image, briefly
    Ask {
        #[arg(long = "image", required = true)]
        images: Vec<PathBuf>,
        /// English query, one per --image
        #[arg(long = "query", required = true)]
        queries: Vec<String>,
    },
    /// Free-form generation on a prompt, optionally about images
    Generate {
        #[arg(long)]
        prompt: String,
        #[arg(long = "image")]
        images: Vec<PathBuf>,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    match cli.log_dir {
        Some(ref dir) => vlm_tracing::init_tracing_to_file(dir.clone()),
        None => vlm_tracing::init_tracing_to_stderr(),
    }

    let loader: Qwen2VLLoader = Qwen2VLLoader::new(&cli.model, Settings::from_env()?);
    info!("loading {} with quantization {}", loader.model_id(), cli.quantization);
    let mut model = Qwen2VL::with_loader(&loader, cli.quantization)?;

    let answers = match cli.command {
        Command::Ask { images, queries } => {
            if images.len() != queries.len() {
                bail!("{} images but {} queries", images.len(), queries.len());
            }
            let pairs = images
                .into_iter()
                .zip(queries)
                .map(|(image, query)| ImageQueryPair::new(vec![image.into()], Query::en(query)))
                .collect();
            let (images, queries) = ImageQueryPair::unzip(pairs);
            model.process_image_queries(&images, &queries)?
        }
        Command::Generate { prompt, images } => {
            let mut content: Vec<ContentBlock> = images
                .iter()
                .map(|path| ContentBlock::image(path.clone()))
                .collect();
            content.push(ContentBlock::text(prompt));
            let text = model
                .get_processor()
                .apply_chat_template(&[Message::user(content)], true)?;
            let images = images
                .iter()
                .map(|path| {
                    vlm::image::open(path)
                        .map_err(|e| anyhow!("failed to open image {}: {}", path.display(), e))
                })
                .collect::<anyhow::Result<Vec<DynamicImage>>>()?;
            model.generate(&[text], &images)?
        }
    };

    for answer in answers {
        println!("{}", answer);
    }
    Ok(())
}
