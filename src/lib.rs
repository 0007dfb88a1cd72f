//! # Text-CNN
//!
//! 一个从零实现的卷积神经网络句子分类器。
//!
//! ## 架构概览
//!
//! ```text
//! Tokens → Embedding →
//!     [Conv(f) → ReLU → Max-Pool]  f ∈ filter_sizes
//!     → Concat → Dropout → Linear → Softmax
//! ```
//!
//! 参数集中在 [`Parameters`] 中，训练状态（步数 + 参数 + Adam 矩估计）在
//! [`TrainingState`] 中，由 [`Trainer`] 驱动并通过 [`CheckpointManager`] 持久化。

pub mod checkpoint;
pub mod classifier;
pub mod config;
pub mod conv;
pub mod data;
pub mod embedding;
pub mod error;
pub mod execution;
pub mod layers;
pub mod loss;
pub mod metrics;
pub mod model;
pub mod optimizer;
pub mod params;
pub mod state;
pub mod tensor;
pub mod trainer;

pub use checkpoint::{Checkpoint, CheckpointIndex, CheckpointManager, SerializableArray};
pub use classifier::{ClassifierHead, HeadOutput};
pub use config::{ModelConfig, TrainerConfig};
pub use conv::{FilterBank, FilterCache};
pub use data::{
    batch_iter, encode_samples, load_polarity_files, max_document_length, one_hot, sentiment_corpus,
    split_dev, Batch, BatchIter, TextCleaner, TextSample, Vocabulary,
};
pub use embedding::Embedding;
pub use error::{Result, TextCnnError};
pub use execution::{Backend, ExecutionContext, Placement};
pub use layers::{Dropout, FeatureConcat};
pub use loss::{Accuracy, LossFunction, SoftmaxCrossEntropy};
pub use metrics::{
    ClassificationMetrics, ConfusionMatrix, FanoutSink, MetricsHistory, MetricsSink, NullSink,
    Observation, TracingSink,
};
pub use model::{Evaluation, ForwardCache, TextCnn};
pub use optimizer::{Adam, AdamState, Optimizer};
pub use params::{FilterParams, GradRef, Gradients, Parameters, SparseRows};
pub use state::{step_rng, StepOutput, TrainingState};
pub use tensor::TensorExt;
pub use trainer::{Phase, StepMetrics, Trainer, TrainingSummary};

/// 预设配置
pub mod configs {
    use super::{ModelConfig, TrainerConfig};

    /// 经典配置：128 维嵌入，宽度 3/4/5 各 128 个卷积核
    pub fn classic(sequence_length: usize, num_classes: usize, vocab_size: usize) -> ModelConfig {
        ModelConfig::new(sequence_length, num_classes, vocab_size)
            .with_embedding_size(128)
            .with_filter_sizes(vec![3, 4, 5])
            .with_num_filters(128)
    }

    /// 小型模型（用于快速测试）
    pub fn mini(sequence_length: usize, num_classes: usize, vocab_size: usize) -> ModelConfig {
        let widths: Vec<usize> = [2, 3, 4].into_iter().filter(|&w| w <= sequence_length).collect();
        ModelConfig::new(sequence_length, num_classes, vocab_size)
            .with_embedding_size(16)
            .with_filter_sizes(if widths.is_empty() { vec![1] } else { widths })
            .with_num_filters(8)
    }

    /// 小数据集的训练配置：更大的学习率，更频繁的评估
    pub fn quick_training() -> TrainerConfig {
        TrainerConfig::default()
            .with_learning_rate(1e-2)
            .with_batch_size(8)
            .with_num_epochs(30)
            .with_evaluate_every(20)
            .with_checkpoint_every(50)
    }
}
