//! KMMLU RAG Eval CLI
//!
//! Builds the retrieval index, prepares and submits batch requests, and
//! scores the returned completions.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use kmmlu_rag_eval::{
    config::Config,
    eval::{self, BatchBuilder, BuilderConfig, CanonicalItem, RunDir, dataset},
    llm::{BatchClient, BatchStatus, CONTEXT_CHAR_BUDGET, LlmClient, Prompts},
    persistence::IndexSource,
    rag::{ConfiguredEmbedder, VectorIndex},
};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing_subscriber::EnvFilter;

/// KMMLU RAG Eval - retrieval-augmented batch evaluation of legal exam questions
#[derive(Parser)]
#[command(name = "kmmlu-rag")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load the vector index, building it if needed
    Index {
        /// Rebuild even if a usable index exists
        #[arg(long)]
        rebuild: bool,
    },

    /// Show the passages retrieved for a query
    Retrieve {
        /// The search query
        query: String,

        /// Number of passages to return
        #[arg(short = 'k', long, default_value_t = eval::CONTEXT_TOP_K)]
        top_k: usize,
    },

    /// Normalize a dataset and write batch requests into a new run directory
    BuildBatch {
        /// Dataset file (.jsonl or .json)
        #[arg(short, long)]
        dataset: PathBuf,
    },

    /// Upload a run's batch input and create the batch job
    Submit {
        /// Run directory (defaults to the latest run)
        #[arg(long)]
        out_dir: Option<PathBuf>,
    },

    /// Wait for a run's batch to finish and download its output
    Wait {
        /// Run directory (defaults to the latest run)
        #[arg(long)]
        out_dir: Option<PathBuf>,
    },

    /// Check a batch once by id and download its output if complete
    Fetch {
        /// Batch job id
        #[arg(long)]
        batch_id: String,

        /// Run directory (defaults to the latest run)
        #[arg(long)]
        out_dir: Option<PathBuf>,
    },

    /// Score a run's completions against its gold ledger
    Score {
        /// Run directory (defaults to the latest run)
        #[arg(long)]
        out_dir: Option<PathBuf>,
    },

    /// Index, build, submit, wait and score in one go
    Run {
        /// Dataset file (.jsonl or .json)
        #[arg(short, long)]
        dataset: PathBuf,
    },

    /// Download the configured dataset split as JSONL
    Download {
        /// Output path (defaults to data/kmmlu_<category>_<split>.jsonl)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Answer a single question online with retrieved context
    Ask {
        /// The question text
        question: String,

        /// Answer choices, in A-D order
        #[arg(short, long, num_args = 2..=4, required = true)]
        choices: Vec<String>,
    },

    /// Test LLM connection
    Test,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose {
        "kmmlu_rag_eval=debug"
    } else {
        "kmmlu_rag_eval=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    match cli.command {
        Commands::Index { rebuild } => cmd_index(rebuild).await,
        Commands::Retrieve { query, top_k } => cmd_retrieve(query, top_k).await,
        Commands::BuildBatch { dataset } => cmd_build_batch(dataset).await.map(|_| ()),
        Commands::Submit { out_dir } => cmd_submit(out_dir).await,
        Commands::Wait { out_dir } => cmd_wait(out_dir).await.map(|_| ()),
        Commands::Fetch { batch_id, out_dir } => cmd_fetch(batch_id, out_dir).await,
        Commands::Score { out_dir } => cmd_score(out_dir),
        Commands::Run { dataset } => cmd_run(dataset).await,
        Commands::Download { output } => cmd_download(output).await,
        Commands::Ask { question, choices } => cmd_ask(question, choices).await,
        Commands::Test => cmd_test().await,
    }
}

fn load_config() -> Result<Config> {
    Config::load().context("Failed to load configuration")
}

/// Embedder and index for commands that retrieve.
async fn open_index(config: &Config, rebuild: bool) -> Result<(ConfiguredEmbedder, VectorIndex)> {
    config
        .validate_embedding()
        .context("Invalid embedding configuration")?;
    let embedder = ConfiguredEmbedder::from_config(&config.llm, &config.embedding)
        .context("Failed to create embedder")?;
    let source = IndexSource::from_config(config);

    let index = if rebuild {
        source.build(&embedder).await
    } else {
        source.load_or_build(&embedder).await
    }
    .context("Failed to load or build vector index")?;

    Ok((embedder, index))
}

fn run_prefix(category: &str) -> String {
    format!("kmmlu_{}", category.to_lowercase().replace(['-', ' '], "_"))
}

async fn cmd_index(rebuild: bool) -> Result<()> {
    let config = load_config()?;
    println!("Embedding model: {}", config.embedding.model);

    let start = Instant::now();
    let (_, index) = open_index(&config, rebuild).await?;

    println!("\nVector Index:");
    println!("  Chunks:      {}", index.len());
    println!("  Dimension:   {}", index.dim());
    println!("  Location:    {}", config.paths.vector_dir.display());
    println!("  Time:        {:.2?}", start.elapsed());
    Ok(())
}

async fn cmd_retrieve(query: String, top_k: usize) -> Result<()> {
    let config = load_config()?;
    let (embedder, index) = open_index(&config, false).await?;

    let passages = index
        .query(&embedder, &query, top_k)
        .await
        .context("Retrieval failed")?;

    if passages.is_empty() {
        println!("No passages found.");
        return Ok(());
    }

    println!("{}", "─".repeat(60));
    for (i, passage) in passages.iter().enumerate() {
        let preview: String = passage.chars().take(200).collect();
        println!("{:>2}. {}", i + 1, preview);
        if passage.chars().count() > 200 {
            println!("    ...");
        }
        println!();
    }
    println!("{}", "─".repeat(60));
    Ok(())
}

async fn build_batch(config: &Config, dataset_path: &Path) -> Result<RunDir> {
    let items: Vec<CanonicalItem> = dataset::load_items(dataset_path, &config.dataset.category)
        .with_context(|| format!("Failed to load dataset '{}'", dataset_path.display()))?;
    println!("Loaded {} items ({})", items.len(), config.dataset.category);

    let (embedder, index) = open_index(config, false).await?;

    let mut builder_config = BuilderConfig::new(&config.llm.model, &config.batch.endpoint);
    builder_config.embed_batch_size = config.embedding.batch_size;
    let rows = BatchBuilder::new(&index, &embedder, builder_config)
        .build(&items)
        .await
        .context("Failed to build batch input")?;

    let run = RunDir::create(&config.paths.outputs_dir, &run_prefix(&config.dataset.category))
        .context("Failed to create run directory")?;
    run.write_batch_input(&items, &rows)
        .context("Failed to write batch input")?;

    println!("Batch input saved to: {}", run.input_path().display());
    println!("Gold ledger saved to: {}", run.gold_path().display());
    Ok(run)
}

async fn cmd_build_batch(dataset_path: PathBuf) -> Result<RunDir> {
    let config = load_config()?;
    build_batch(&config, &dataset_path).await
}

async fn cmd_submit(out_dir: Option<PathBuf>) -> Result<()> {
    let config = load_config()?;
    config.validate().context("Invalid configuration")?;
    let run = RunDir::resolve(out_dir.as_deref(), &config.paths.outputs_dir)?;

    let client = BatchClient::new(&config.llm);
    let meta = eval::submit(&run, &client, &config.batch, &config.llm.model)
        .await
        .context("Failed to submit batch")?;

    println!("Submitted batch: {}", meta.batch_id);
    println!("  Status:  {:?}", meta.status);
    println!("  Run:     {}", run.path().display());
    Ok(())
}

async fn wait_run(config: &Config, run: &RunDir) -> Result<BatchStatus> {
    let client = BatchClient::new(&config.llm);
    let status = eval::wait_and_fetch(run, &client, eval::POLL_INTERVAL)
        .await
        .context("Failed while waiting for batch")?;

    if status == BatchStatus::Completed {
        println!("Batch output saved to: {}", run.output_path().display());
    } else {
        println!("Batch ended with status {:?}; no output to score.", status);
    }
    Ok(status)
}

async fn cmd_wait(out_dir: Option<PathBuf>) -> Result<BatchStatus> {
    let config = load_config()?;
    config.validate().context("Invalid configuration")?;
    let run = RunDir::resolve(out_dir.as_deref(), &config.paths.outputs_dir)?;
    wait_run(&config, &run).await
}

async fn cmd_fetch(batch_id: String, out_dir: Option<PathBuf>) -> Result<()> {
    let config = load_config()?;
    config.validate().context("Invalid configuration")?;
    let run = RunDir::resolve(out_dir.as_deref(), &config.paths.outputs_dir)?;

    let client = BatchClient::new(&config.llm);
    let status = eval::fetch(&run, &client, &batch_id)
        .await
        .context("Failed to fetch batch")?;

    println!("Batch {}: {:?}", batch_id, status);
    if status == BatchStatus::Completed {
        println!("Batch output saved to: {}", run.output_path().display());
    }
    Ok(())
}

fn score(run: &RunDir) -> Result<()> {
    let report = eval::score_run(run).context("Failed to score run")?;

    println!("\nResults:");
    println!("{}", "─".repeat(40));
    println!("  Accuracy:    {:.4}", report.result.accuracy);
    println!("  Correct:     {}", report.result.correct);
    println!("  Total:       {}", report.result.total);
    println!("  Missing:     {}", report.missing);
    println!("  Unparsed:    {}", report.unparsed);
    println!("{}", "─".repeat(40));
    println!("Metrics saved to: {}", run.metrics_path().display());
    Ok(())
}

fn cmd_score(out_dir: Option<PathBuf>) -> Result<()> {
    let config = load_config()?;
    let run = RunDir::resolve(out_dir.as_deref(), &config.paths.outputs_dir)?;
    score(&run)
}

async fn cmd_run(dataset_path: PathBuf) -> Result<()> {
    let config = load_config()?;
    config.validate().context("Invalid configuration")?;
    let start = Instant::now();

    let run = build_batch(&config, &dataset_path).await?;

    let client = BatchClient::new(&config.llm);
    let meta = eval::submit(&run, &client, &config.batch, &config.llm.model)
        .await
        .context("Failed to submit batch")?;
    println!("Submitted batch: {}", meta.batch_id);

    let status = wait_run(&config, &run).await?;
    if status != BatchStatus::Completed {
        anyhow::bail!("Batch {} ended with status {:?}", meta.batch_id, status);
    }

    score(&run)?;
    println!("Total time: {:.2?}", start.elapsed());
    Ok(())
}

async fn cmd_download(output: Option<PathBuf>) -> Result<()> {
    let config = load_config()?;
    let output = output.unwrap_or_else(|| {
        PathBuf::from("data").join(format!(
            "kmmlu_{}_{}.jsonl",
            config.dataset.category, config.dataset.split
        ))
    });

    println!(
        "Downloading {} ({}/{})...",
        config.dataset.name, config.dataset.category, config.dataset.split
    );
    let rows = dataset::download_rows(&reqwest::Client::new(), &config.dataset)
        .await
        .context("Failed to download dataset")?;

    dataset::save_records_jsonl(&rows, &output).context("Failed to save dataset")?;
    println!("Saved {} rows to: {}", rows.len(), output.display());
    Ok(())
}

async fn cmd_ask(question: String, choices: Vec<String>) -> Result<()> {
    let config = load_config()?;
    config.validate().context("Invalid configuration")?;
    let (embedder, index) = open_index(&config, false).await?;

    let contexts = index
        .query(&embedder, &question, eval::CONTEXT_TOP_K)
        .await
        .context("Retrieval failed")?;
    let user = Prompts::answer_user(&question, &choices, &contexts, CONTEXT_CHAR_BUDGET);

    let client = LlmClient::new(config.llm.clone());
    let reply = client
        .ask(Prompts::answer_system(), &user)
        .await
        .context("Chat request failed")?;

    println!("Model reply: {}", reply.trim());
    match eval::extract_answer(&reply) {
        Some(letter) => println!("Answer: {}", letter),
        None => println!("Answer: (no letter found)"),
    }
    Ok(())
}

async fn cmd_test() -> Result<()> {
    println!("Testing LLM connection...\n");

    let config = load_config()?;

    println!("Configuration:");
    println!("  API Base:  {}", config.llm.api_base);
    println!("  Model:     {}", config.llm.model);
    println!("  Embedding: {}", config.embedding.model);
    println!(
        "  API Key:   {}...",
        config.llm.api_key.chars().take(8).collect::<String>()
    );
    println!();

    if let Err(e) = config.validate() {
        println!("Configuration error: {}", e);
        return Ok(());
    }

    let client = LlmClient::new(config.llm);

    println!("Sending test request...");
    match client.test_connection().await {
        Ok(()) => {
            println!("Connection successful!");
        }
        Err(e) => {
            println!("Connection failed: {}", e);
        }
    }

    Ok(())
}
