//! text-cnn 命令行
//!
//! - `train`：在正负两个语料文件（或内置语料）上训练，输出到 `<out_dir>/runs/<run_id>`
//! - `eval`：从检查点恢复模型，评估数据集并写出 `predictions.csv`

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use std::fs;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use text_cnn::{
    batch_iter, encode_samples, load_polarity_files, max_document_length, sentiment_corpus, split_dev,
    CheckpointManager, ClassificationMetrics, ConfusionMatrix, ExecutionContext, FanoutSink,
    MetricsHistory, ModelConfig, TextCnn, TextSample, TracingSink, Trainer, TrainerConfig, Vocabulary,
};
use tracing::info;

const NUM_CLASSES: usize = 2;

#[derive(Parser, Debug)]
#[command(name = "text-cnn", version, about = "Train and evaluate a convolutional sentence classifier.")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Train a model and write checkpoints into a run directory
    Train(TrainArgs),
    /// Evaluate a checkpoint and write predictions.csv
    Eval(EvalArgs),
}

#[derive(Args, Debug)]
struct DataArgs {
    /// Positive sentences, one per line (uses the built-in corpus when omitted)
    #[arg(long, requires = "negative_file")]
    positive_file: Option<PathBuf>,

    /// Negative sentences, one per line
    #[arg(long, requires = "positive_file")]
    negative_file: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct TrainArgs {
    #[command(flatten)]
    data: DataArgs,

    /// Fraction of the data held out for evaluation
    #[arg(long, default_value_t = 0.1)]
    dev_sample_percentage: f32,

    /// Dimensionality of the token embeddings
    #[arg(long, default_value_t = 128)]
    embedding_dim: usize,

    /// Comma-separated filter widths
    #[arg(long, value_delimiter = ',', default_value = "3,4,5")]
    filter_sizes: Vec<usize>,

    /// Number of filters per width
    #[arg(long, default_value_t = 128)]
    num_filters: usize,

    /// Dropout keep probability during training
    #[arg(long, default_value_t = 0.5)]
    dropout_keep_prob: f32,

    /// L2 penalty on the output layer
    #[arg(long, default_value_t = 0.0)]
    l2_reg_lambda: f32,

    #[arg(long, default_value_t = 1e-3)]
    learning_rate: f32,

    #[arg(long, default_value_t = 64)]
    batch_size: usize,

    #[arg(long, default_value_t = 200)]
    num_epochs: usize,

    /// Evaluate on the dev set after this many steps
    #[arg(long, default_value_t = 100)]
    evaluate_every: u64,

    /// Save a checkpoint after this many steps
    #[arg(long, default_value_t = 100)]
    checkpoint_every: u64,

    /// Number of checkpoints to keep
    #[arg(long, default_value_t = 5)]
    num_checkpoints: usize,

    #[arg(long, default_value_t = 10)]
    seed: u64,

    /// Root directory for run outputs
    #[arg(long, default_value = "runs")]
    out_dir: PathBuf,

    /// Run identifier (defaults to the current UNIX timestamp with a random suffix)
    #[arg(long)]
    run_id: Option<String>,

    /// Resume from the latest checkpoint of the run
    #[arg(long)]
    resume: bool,

    /// Compute filter widths one after another instead of in parallel
    #[arg(long)]
    sequential_filters: bool,

    /// Trainer configuration JSON; replaces the trainer flags above
    #[arg(long)]
    config: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct EvalArgs {
    #[command(flatten)]
    data: DataArgs,

    /// Run directory written by `train`
    #[arg(long)]
    run_dir: PathBuf,

    /// Checkpoint to evaluate (defaults to the latest one)
    #[arg(long)]
    checkpoint: Option<PathBuf>,

    #[arg(long, default_value_t = 64)]
    batch_size: usize,

    /// Where to write predictions (defaults to <run_dir>/predictions.csv)
    #[arg(long)]
    output: Option<PathBuf>,
}

impl TrainArgs {
    fn trainer_config(&self) -> Result<TrainerConfig> {
        if let Some(path) = &self.config {
            // load_json 会校验，缺少 run_id 的 resume 在这里报错
            return TrainerConfig::load_json(path)
                .with_context(|| format!("failed to load trainer config {}", path.display()));
        }

        let mut config = TrainerConfig::default()
            .with_learning_rate(self.learning_rate)
            .with_batch_size(self.batch_size)
            .with_num_epochs(self.num_epochs)
            .with_evaluate_every(self.evaluate_every)
            .with_checkpoint_every(self.checkpoint_every)
            .with_dropout_keep_prob(self.dropout_keep_prob)
            .with_l2_reg_lambda(self.l2_reg_lambda)
            .with_seed(self.seed)
            .with_out_dir(&self.out_dir)
            .with_resume(self.resume);
        config.num_checkpoints = self.num_checkpoints;
        config.parallel_filters = !self.sequential_filters;
        if let Some(run_id) = &self.run_id {
            config = config.with_run_id(run_id);
        }
        if config.resume && config.run_id.is_none() {
            bail!("--resume needs --run-id to pick the run to continue");
        }
        config.validate()?;
        Ok(config)
    }
}

fn load_samples(data: &DataArgs) -> Result<Vec<TextSample>> {
    match (&data.positive_file, &data.negative_file) {
        (Some(pos), Some(neg)) => load_polarity_files(pos, neg)
            .with_context(|| format!("failed to load {} / {}", pos.display(), neg.display())),
        _ => Ok(sentiment_corpus()),
    }
}

fn run_train(args: TrainArgs) -> Result<()> {
    let mut trainer_config = args.trainer_config()?;
    let samples = load_samples(&args.data)?;
    if samples.is_empty() {
        bail!("no training sentences found");
    }

    // 恢复训练时沿用已保存的词汇表和模型配置，保证 token id 不变
    let resume_dir = trainer_config
        .run_id
        .as_ref()
        .map(|id| trainer_config.out_dir.join("runs").join(id))
        .filter(|dir| trainer_config.resume && dir.join("vocab.json").exists());
    let (vocab, model_config) = match &resume_dir {
        Some(dir) => (
            Vocabulary::load_json(dir.join("vocab.json")).context("failed to load vocab.json")?,
            ModelConfig::load_json(dir.join("model_config.json")).context("failed to load model_config.json")?,
        ),
        None => {
            let texts: Vec<&str> = samples.iter().map(|s| s.text.as_str()).collect();
            let vocab = Vocabulary::build(&texts, 1);
            let sequence_length = max_document_length(&samples).max(args.filter_sizes.iter().copied().max().unwrap_or(1));
            let config = ModelConfig::new(sequence_length, NUM_CLASSES, vocab.len())
                .with_embedding_size(args.embedding_dim)
                .with_filter_sizes(args.filter_sizes.clone())
                .with_num_filters(args.num_filters);
            (vocab, config)
        }
    };
    info!(
        vocab_size = vocab.len(),
        sequence_length = model_config.sequence_length,
        sentences = samples.len(),
        "data loaded"
    );

    let data = encode_samples(&vocab, &samples, model_config.sequence_length, NUM_CLASSES)?;
    let (train, dev) = split_dev(&data, args.dev_sample_percentage, trainer_config.seed)?;
    info!(train = train.len(), dev = dev.len(), "train/dev split");

    let context = ExecutionContext::cpu().with_parallel_filters(trainer_config.parallel_filters);
    let model = TextCnn::new(model_config.clone(), &context).context("invalid model configuration")?;

    let mut trainer = Trainer::new(model, trainer_config.clone())?;
    trainer_config.run_id = Some(trainer.run_id().to_string());
    let run_dir = trainer.run_dir();
    fs::create_dir_all(&run_dir).with_context(|| format!("failed to create {}", run_dir.display()))?;
    vocab.save_json(run_dir.join("vocab.json"))?;
    model_config.save_json(run_dir.join("model_config.json"))?;
    trainer_config.save_json(run_dir.join("trainer_config.json"))?;
    println!("Writing to {}", run_dir.display());

    let mut state = trainer.init_state()?;
    let batches = batch_iter(
        &train,
        trainer_config.batch_size,
        trainer_config.num_epochs,
        trainer_config.shuffle,
        trainer_config.seed,
    )
    .skip(state.step() as usize);

    let mut history = match MetricsHistory::load(run_dir.join("metrics.json")) {
        Ok(history) if state.step() > 0 => history,
        _ => MetricsHistory::new(),
    };
    let mut logger = TracingSink;
    let summary = {
        let mut sink = FanoutSink::new().with(&mut history).with(&mut logger);
        trainer.run(&mut state, batches, Some(&dev), &mut sink)?
    };
    history.save(run_dir.join("metrics.json"))?;

    println!("{}", history.summary());
    if let Some(dev) = summary.last_dev {
        println!("Last dev evaluation: loss {:.4}, acc {:.2}% (step {})", dev.loss, dev.accuracy * 100.0, dev.step);
    }
    for path in &summary.checkpoints {
        println!("Saved model checkpoint to {}", path.display());
    }
    if summary.nonfinite_steps > 0 {
        println!("Warning: {} steps had a non-finite loss", summary.nonfinite_steps);
    }
    Ok(())
}

fn run_eval(args: EvalArgs) -> Result<()> {
    let vocab = Vocabulary::load_json(args.run_dir.join("vocab.json")).context("failed to load vocab.json")?;
    let model_config =
        ModelConfig::load_json(args.run_dir.join("model_config.json")).context("failed to load model_config.json")?;
    let model = TextCnn::new(model_config.clone(), &ExecutionContext::cpu())?;

    let checkpoint = match args.checkpoint {
        Some(path) => path,
        None => CheckpointManager::find_latest(args.run_dir.join("checkpoints"))?
            .with_context(|| format!("no checkpoint found in {}", args.run_dir.display()))?,
    };
    let state = CheckpointManager::restore(&checkpoint, &model_config)
        .with_context(|| format!("failed to restore {}", checkpoint.display()))?;
    println!("Evaluating {} (step {})", checkpoint.display(), state.step());

    let samples = load_samples(&args.data)?;
    let data = encode_samples(&vocab, &samples, model_config.sequence_length, NUM_CLASSES)?;
    let eval = model.evaluate_chunked(state.params(), &data, Some(args.batch_size))?;

    let targets = data.label_indices();
    let metrics = ClassificationMetrics::compute(&eval.predictions, &targets, NUM_CLASSES);
    println!("Total number of test examples: {}", samples.len());
    println!("Loss: {:.4}", eval.loss);
    println!("{}", metrics.summary());
    println!("{}", ConfusionMatrix::compute(&eval.predictions, &targets, NUM_CLASSES).display());

    let output = args.output.unwrap_or_else(|| args.run_dir.join("predictions.csv"));
    write_predictions(&output, &samples, &eval.predictions)?;
    println!("Saving evaluation to {}", output.display());
    Ok(())
}

fn write_predictions(path: &Path, samples: &[TextSample], predictions: &[usize]) -> Result<()> {
    let file = fs::File::create(path).with_context(|| format!("failed to create {}", path.display()))?;
    let mut writer = BufWriter::new(file);
    writeln!(writer, "text,prediction")?;
    for (sample, prediction) in samples.iter().zip(predictions) {
        writeln!(writer, "\"{}\",{}", sample.text.replace('"', "\"\""), prediction)?;
    }
    writer.flush()?;
    Ok(())
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("text_cnn=info")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Train(args) => run_train(args),
        Commands::Eval(args) => run_eval(args),
    }
}
