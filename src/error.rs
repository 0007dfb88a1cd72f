//! 错误类型
//!
//! 配置、形状、持久化三类错误统一到 [`TextCnnError`]。

use std::path::PathBuf;
use thiserror::Error;

/// text-cnn 的错误
#[derive(Debug, Error)]
pub enum TextCnnError {
    /// 超参数不合法
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// 卷积核宽度超过序列长度
    #[error("Filter width {width} exceeds sequence length {sequence_length}")]
    FilterTooWide { width: usize, sequence_length: usize },

    /// keep_prob 不在 (0, 1] 内
    #[error("Invalid keep_prob: {0} (must be in (0, 1])")]
    InvalidKeepProb(f32),

    /// 没有可用的执行后端
    #[error("Component `{component}` requires backend {required:?}, available: {available:?}")]
    UnsupportedBackend {
        component: String,
        required: crate::execution::Backend,
        available: Vec<crate::execution::Backend>,
    },

    /// 张量形状不匹配
    #[error("Shape mismatch for {what}: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        what: String,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    /// token id 越界
    #[error("Token id {id} at row {row} is out of range for vocabulary of size {vocab_size}")]
    InvalidTokenId { id: usize, row: usize, vocab_size: usize },

    /// 标签不是 one-hot
    #[error("Label row {0} is not one-hot")]
    InvalidLabel(usize),

    /// 空 batch
    #[error("Batch is empty")]
    EmptyBatch,

    /// 梯度与优化器登记的参数不一致
    #[error("Gradient for `{name}` does not match registered parameter: {reason}")]
    GradientMismatch { name: String, reason: String },

    /// 检查点不存在
    #[error("No checkpoint found at {0}")]
    CheckpointNotFound(PathBuf),

    /// 检查点损坏
    #[error("Corrupt checkpoint {path}: {reason}")]
    CorruptCheckpoint { path: PathBuf, reason: String },

    /// 检查点的模型配置与当前模型不一致
    #[error("Checkpoint {path} was written for a different model: {reason}")]
    CheckpointMismatch { path: PathBuf, reason: String },

    /// 拒绝覆盖已存在的检查点
    #[error("Refusing to overwrite existing checkpoint {0}")]
    CheckpointExists(PathBuf),

    /// I/O 错误
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON 序列化错误
    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// 二进制序列化错误
    #[error("Binary serialization error: {0}")]
    Bincode(#[from] bincode::Error),

    /// 文本清洗的正则表达式无效
    #[error("Invalid pattern: {0}")]
    Pattern(#[from] regex::Error),
}

impl TextCnnError {
    /// 构造形状错误
    pub fn shape(what: impl Into<String>, expected: &[usize], actual: &[usize]) -> Self {
        Self::ShapeMismatch {
            what: what.into(),
            expected: expected.to_vec(),
            actual: actual.to_vec(),
        }
    }

    /// 是否为持久化相关错误（训练循环可以跳过后继续）
    pub fn is_persistence(&self) -> bool {
        matches!(
            self,
            Self::CheckpointNotFound(_)
                | Self::CorruptCheckpoint { .. }
                | Self::CheckpointMismatch { .. }
                | Self::CheckpointExists(_)
                | Self::Io(_)
                | Self::Json(_)
                | Self::Bincode(_)
        )
    }
}

/// text-cnn 的 Result 类型
pub type Result<T> = std::result::Result<T, TextCnnError>;
