//! 情感分类训练示例
//!
//! 在内置语料上训练一个小型 Text-CNN，保存检查点后恢复并预测

use text_cnn::{
    batch_iter, configs, encode_samples, max_document_length, sentiment_corpus, split_dev,
    CheckpointManager, ClassificationMetrics, ExecutionContext, FanoutSink, MetricsHistory,
    TextCnn, TracingSink, Trainer, Vocabulary,
};

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("text_cnn=info")),
        )
        .init();

    println!("╔════════════════════════════════════════════════╗");
    println!("║   Text-CNN 情感分类训练                        ║");
    println!("╚════════════════════════════════════════════════╝\n");

    println!("📊 加载情感分析数据集...");
    let samples = sentiment_corpus();
    let texts: Vec<&str> = samples.iter().map(|s| s.text.as_str()).collect();
    let vocab = Vocabulary::build(&texts, 1);
    let seq_len = max_document_length(&samples);
    let data = encode_samples(&vocab, &samples, seq_len, 2)?;
    let (train, dev) = split_dev(&data, 0.2, 42)?;

    println!("  词汇表大小: {}", vocab.len());
    println!("  句子长度: {}", seq_len);
    println!("  训练样本: {}", train.len());
    println!("  验证样本: {}\n", dev.len());

    let out_dir = std::env::temp_dir().join("text-cnn-demo");
    let model_config = configs::mini(seq_len, 2, vocab.len());
    let trainer_config = configs::quick_training()
        .with_dropout_keep_prob(0.8)
        .with_seed(42)
        .with_out_dir(&out_dir);

    println!("🏗️  模型配置:");
    println!("  嵌入维度: {}", model_config.embedding_size);
    println!("  卷积宽度: {:?}", model_config.filter_sizes);
    println!("  每种宽度的卷积核: {}", model_config.num_filters);
    println!("  特征维度: {}\n", model_config.num_features());

    let model = TextCnn::new(model_config.clone(), &ExecutionContext::cpu())?;
    let mut trainer = Trainer::new(model, trainer_config.clone())?;
    let mut state = trainer.init_state()?;

    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    println!("开始训练");
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━\n");

    let batches = batch_iter(
        &train,
        trainer_config.batch_size,
        trainer_config.num_epochs,
        trainer_config.shuffle,
        trainer_config.seed,
    );
    let mut history = MetricsHistory::new();
    let mut logger = TracingSink;
    let summary = {
        let mut sink = FanoutSink::new().with(&mut history).with(&mut logger);
        trainer.run(&mut state, batches, Some(&dev), &mut sink)?
    };

    println!("\n{}", history.summary());
    println!("  检查点目录: {}", trainer.checkpoint_dir().display());
    println!("  保存的检查点: {}\n", summary.checkpoints.len());

    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    println!("从检查点恢复并预测");
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━\n");

    let latest = CheckpointManager::find_latest(trainer.checkpoint_dir())?
        .ok_or_else(|| anyhow::anyhow!("no checkpoint was written"))?;
    let restored = CheckpointManager::restore(&latest, &model_config)?;
    println!("  恢复: {} (step {})", latest.display(), restored.step());

    let model = trainer.model();
    let predictions = model.predict(restored.params(), &dev.inputs, 64)?;
    let metrics = ClassificationMetrics::compute(&predictions, &dev.label_indices(), 2);
    println!("  {}\n", metrics.summary());

    let sentences = ["this movie is great", "terrible and boring film"];
    let samples: Vec<_> = sentences
        .iter()
        .map(|text| text_cnn::TextSample {
            text: text.to_string(),
            label: 0,
        })
        .collect();
    let batch = encode_samples(&vocab, &samples, seq_len, 2)?;
    let labels = model.predict(restored.params(), &batch.inputs, 64)?;
    for (text, label) in sentences.iter().zip(labels) {
        let sentiment = if label == 1 { "积极 😊" } else { "消极 😞" };
        println!("  \"{}\" → {}", text, sentiment);
    }

    Ok(())
}
