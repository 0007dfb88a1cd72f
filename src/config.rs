//! 模型与训练配置
//!
//! 超参数在使用前统一校验，不合法的配置在构建模型时立即报错，不做静默修正。

use crate::error::{Result, TextCnnError};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};

/// 模型超参数
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelConfig {
    /// 句子长度（所有句子相同）
    pub sequence_length: usize,
    /// 类别数
    pub num_classes: usize,
    /// 词表大小
    pub vocab_size: usize,
    /// 词向量维度
    pub embedding_size: usize,
    /// 卷积核宽度（顺序决定特征拼接顺序）
    pub filter_sizes: Vec<usize>,
    /// 每种宽度的卷积核数量
    pub num_filters: usize,
}

impl ModelConfig {
    /// 创建配置，其余超参数取默认值（128 维嵌入，宽度 3/4/5，每种 128 个卷积核）
    pub fn new(sequence_length: usize, num_classes: usize, vocab_size: usize) -> Self {
        Self {
            sequence_length,
            num_classes,
            vocab_size,
            embedding_size: 128,
            filter_sizes: vec![3, 4, 5],
            num_filters: 128,
        }
    }

    pub fn with_embedding_size(mut self, embedding_size: usize) -> Self {
        self.embedding_size = embedding_size;
        self
    }

    pub fn with_filter_sizes(mut self, filter_sizes: Vec<usize>) -> Self {
        self.filter_sizes = filter_sizes;
        self
    }

    pub fn with_num_filters(mut self, num_filters: usize) -> Self {
        self.num_filters = num_filters;
        self
    }

    /// 拼接后特征向量的长度
    pub fn num_features(&self) -> usize {
        self.num_filters * self.filter_sizes.len()
    }

    /// 校验超参数
    pub fn validate(&self) -> Result<()> {
        if self.sequence_length == 0 {
            return Err(TextCnnError::InvalidConfig("sequence_length must be positive".into()));
        }
        if self.num_classes < 2 {
            return Err(TextCnnError::InvalidConfig(format!(
                "num_classes must be at least 2, got {}",
                self.num_classes
            )));
        }
        if self.vocab_size == 0 {
            return Err(TextCnnError::InvalidConfig("vocab_size must be positive".into()));
        }
        if self.embedding_size == 0 {
            return Err(TextCnnError::InvalidConfig("embedding_size must be positive".into()));
        }
        if self.num_filters == 0 {
            return Err(TextCnnError::InvalidConfig("num_filters must be positive".into()));
        }
        if self.filter_sizes.is_empty() {
            return Err(TextCnnError::InvalidConfig("filter_sizes must not be empty".into()));
        }
        for (i, &width) in self.filter_sizes.iter().enumerate() {
            if width == 0 {
                return Err(TextCnnError::InvalidConfig("filter sizes must be positive".into()));
            }
            if width > self.sequence_length {
                return Err(TextCnnError::FilterTooWide {
                    width,
                    sequence_length: self.sequence_length,
                });
            }
            if self.filter_sizes[..i].contains(&width) {
                return Err(TextCnnError::InvalidConfig(format!(
                    "duplicate filter size {}",
                    width
                )));
            }
        }
        Ok(())
    }

    /// 保存为 JSON
    pub fn save_json<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        save_json(self, path)
    }

    /// 从 JSON 加载并校验
    pub fn load_json<P: AsRef<Path>>(path: P) -> Result<Self> {
        let config: Self = load_json(path)?;
        config.validate()?;
        Ok(config)
    }
}

/// 训练配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainerConfig {
    /// 学习率
    pub learning_rate: f32,
    /// 批大小
    pub batch_size: usize,
    /// 训练轮数
    pub num_epochs: usize,
    /// 每 evaluate_every 步在验证集上评估一次（0 表示不评估）
    pub evaluate_every: u64,
    /// 每 checkpoint_every 步保存一次检查点（0 表示只在结束时保存）
    pub checkpoint_every: u64,
    /// 保留的检查点数量
    pub num_checkpoints: usize,
    /// 训练时 dropout 的保留概率
    pub dropout_keep_prob: f32,
    /// 输出层 L2 正则系数（0 表示关闭）
    pub l2_reg_lambda: f32,
    /// 随机种子
    pub seed: u64,
    /// 每个 epoch 是否打乱数据
    pub shuffle: bool,
    /// 输出根目录
    pub out_dir: PathBuf,
    /// 运行 ID（默认取启动时的时间戳）
    pub run_id: Option<String>,
    /// 是否从最新检查点恢复
    pub resume: bool,
    /// 恢复失败时是否允许重新初始化
    pub allow_fresh_start: bool,
    /// 检查点写入失败时是否终止训练
    pub abort_on_checkpoint_error: bool,
    /// 检查点写入失败后的重试次数
    pub checkpoint_retries: usize,
    /// 验证集分块大小（None 表示整体作为一个 batch）
    pub eval_batch_size: Option<usize>,
    /// 不同宽度的卷积并行计算
    pub parallel_filters: bool,
}

impl Default for TrainerConfig {
    fn default() -> Self {
        Self {
            learning_rate: 1e-3,
            batch_size: 64,
            num_epochs: 200,
            evaluate_every: 100,
            checkpoint_every: 100,
            num_checkpoints: 5,
            dropout_keep_prob: 0.5,
            l2_reg_lambda: 0.0,
            seed: 10,
            shuffle: true,
            out_dir: PathBuf::from("runs"),
            run_id: None,
            resume: false,
            allow_fresh_start: true,
            abort_on_checkpoint_error: false,
            checkpoint_retries: 2,
            eval_batch_size: None,
            parallel_filters: true,
        }
    }
}

impl TrainerConfig {
    pub fn with_learning_rate(mut self, learning_rate: f32) -> Self {
        self.learning_rate = learning_rate;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_num_epochs(mut self, num_epochs: usize) -> Self {
        self.num_epochs = num_epochs;
        self
    }

    pub fn with_evaluate_every(mut self, evaluate_every: u64) -> Self {
        self.evaluate_every = evaluate_every;
        self
    }

    pub fn with_checkpoint_every(mut self, checkpoint_every: u64) -> Self {
        self.checkpoint_every = checkpoint_every;
        self
    }

    pub fn with_dropout_keep_prob(mut self, keep_prob: f32) -> Self {
        self.dropout_keep_prob = keep_prob;
        self
    }

    pub fn with_l2_reg_lambda(mut self, l2_reg_lambda: f32) -> Self {
        self.l2_reg_lambda = l2_reg_lambda;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_out_dir(mut self, out_dir: impl Into<PathBuf>) -> Self {
        self.out_dir = out_dir.into();
        self
    }

    pub fn with_run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = Some(run_id.into());
        self
    }

    pub fn with_resume(mut self, resume: bool) -> Self {
        self.resume = resume;
        self
    }

    /// 校验训练配置
    pub fn validate(&self) -> Result<()> {
        if !(self.learning_rate > 0.0 && self.learning_rate.is_finite()) {
            return Err(TextCnnError::InvalidConfig(format!(
                "learning_rate must be positive, got {}",
                self.learning_rate
            )));
        }
        if self.batch_size == 0 {
            return Err(TextCnnError::InvalidConfig("batch_size must be positive".into()));
        }
        if !(self.dropout_keep_prob > 0.0 && self.dropout_keep_prob <= 1.0) {
            return Err(TextCnnError::InvalidKeepProb(self.dropout_keep_prob));
        }
        if !(self.l2_reg_lambda >= 0.0 && self.l2_reg_lambda.is_finite()) {
            return Err(TextCnnError::InvalidConfig(format!(
                "l2_reg_lambda must be non-negative, got {}",
                self.l2_reg_lambda
            )));
        }
        if self.num_checkpoints == 0 {
            return Err(TextCnnError::InvalidConfig("num_checkpoints must be positive".into()));
        }
        if self.eval_batch_size == Some(0) {
            return Err(TextCnnError::InvalidConfig("eval_batch_size must be positive".into()));
        }
        if self.resume && self.run_id.is_none() {
            return Err(TextCnnError::InvalidConfig(
                "resume needs the run_id of the run to continue".into(),
            ));
        }
        Ok(())
    }

    /// 保存为 JSON
    pub fn save_json<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        save_json(self, path)
    }

    /// 从 JSON 加载并校验，缺失的字段取默认值
    pub fn load_json<P: AsRef<Path>>(path: P) -> Result<Self> {
        let config: Self = load_json(path)?;
        config.validate()?;
        Ok(config)
    }
}

pub(crate) fn save_json<T: Serialize, P: AsRef<Path>>(value: &T, path: P) -> Result<()> {
    let file = File::create(path)?;
    let writer = BufWriter::new(file);
    serde_json::to_writer_pretty(writer, value)?;
    Ok(())
}

pub(crate) fn load_json<T: for<'de> Deserialize<'de>, P: AsRef<Path>>(path: P) -> Result<T> {
    let file = File::open(path)?;
    let reader = BufReader::new(file);
    Ok(serde_json::from_reader(reader)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small() -> ModelConfig {
        ModelConfig::new(5, 2, 10)
            .with_embedding_size(4)
            .with_filter_sizes(vec![2, 3])
            .with_num_filters(2)
    }

    #[test]
    fn test_valid_config() {
        let config = small();
        assert!(config.validate().is_ok());
        assert_eq!(config.num_features(), 4);
    }

    #[test]
    fn test_filter_equal_to_sequence_length_is_valid() {
        let config = small().with_filter_sizes(vec![5]);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_filter_wider_than_sequence() {
        let config = small().with_filter_sizes(vec![2, 6]);
        match config.validate() {
            Err(TextCnnError::FilterTooWide { width, sequence_length }) => {
                assert_eq!(width, 6);
                assert_eq!(sequence_length, 5);
            }
            other => panic!("expected FilterTooWide, got {:?}", other),
        }
    }

    #[test]
    fn test_invalid_dimensions() {
        assert!(ModelConfig::new(0, 2, 10).validate().is_err());
        assert!(ModelConfig::new(5, 1, 10).validate().is_err());
        assert!(small().with_filter_sizes(vec![]).validate().is_err());
        assert!(small().with_filter_sizes(vec![0]).validate().is_err());
        assert!(small().with_filter_sizes(vec![2, 2]).validate().is_err());
        assert!(small().with_num_filters(0).validate().is_err());
        assert!(small().with_embedding_size(0).validate().is_err());
    }

    #[test]
    fn test_trainer_config_defaults() {
        let config = TrainerConfig::default();
        assert_eq!(config.batch_size, 64);
        assert_eq!(config.num_epochs, 200);
        assert_eq!(config.evaluate_every, 100);
        assert_eq!(config.checkpoint_every, 100);
        assert_eq!(config.num_checkpoints, 5);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_trainer_config_rejects_keep_prob() {
        let config = TrainerConfig::default().with_dropout_keep_prob(0.0);
        assert!(matches!(config.validate(), Err(TextCnnError::InvalidKeepProb(_))));

        let config = TrainerConfig::default().with_dropout_keep_prob(1.5);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_resume_requires_run_id() {
        let config = TrainerConfig::default().with_resume(true);
        assert!(matches!(config.validate(), Err(TextCnnError::InvalidConfig(_))));
        assert!(config.with_run_id("1700000000").validate().is_ok());
    }

    #[test]
    fn test_config_json_roundtrip() {
        let dir = tempfile::tempdir().unwrap();

        let model = small();
        model.save_json(dir.path().join("model.json")).unwrap();
        assert_eq!(ModelConfig::load_json(dir.path().join("model.json")).unwrap(), model);

        std::fs::write(dir.path().join("trainer.json"), r#"{ "batch_size": 8 }"#).unwrap();
        let trainer = TrainerConfig::load_json(dir.path().join("trainer.json")).unwrap();
        assert_eq!(trainer.batch_size, 8);
        assert_eq!(trainer.num_epochs, 200);
    }
}
