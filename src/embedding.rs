//! 词嵌入层
//!
//! 将离散的 token ID 转换为连续的向量表示。

use crate::error::{Result, TextCnnError};
use crate::execution::{Backend, Placement};
use crate::params::SparseRows;
use ndarray::{Array2, Array3};
use std::collections::BTreeMap;

/// 词嵌入层
///
/// 本身不持有权重，嵌入矩阵 `E: [vocab_size, embedding_size]` 由 [`crate::Parameters`] 提供。
#[derive(Debug, Clone)]
pub struct Embedding {
    vocab_size: usize,
    embedding_size: usize,
}

impl Embedding {
    /// 创建新的嵌入层
    ///
    /// # 参数
    /// - `vocab_size`: 词表大小
    /// - `embedding_size`: 嵌入维度
    pub fn new(vocab_size: usize, embedding_size: usize) -> Self {
        Self {
            vocab_size,
            embedding_size,
        }
    }

    /// 前向传播：按行查表
    ///
    /// # 输入
    /// - `weights`: [vocab_size, embedding_size]
    /// - `input`: [batch_size, seq_len] token IDs
    ///
    /// # 输出
    /// - [batch_size, seq_len, embedding_size]
    pub fn forward(&self, weights: &Array2<f32>, input: &Array2<usize>) -> Result<Array3<f32>> {
        self.check_ids(input)?;

        let (batch_size, seq_len) = input.dim();
        let mut embedded = Array3::zeros((batch_size, seq_len, self.embedding_size));

        for ((b, t), &token_id) in input.indexed_iter() {
            embedded
                .slice_mut(ndarray::s![b, t, ..])
                .assign(&weights.row(token_id));
        }

        Ok(embedded)
    }

    /// 反向传播：只有 batch 中出现过的行有梯度
    ///
    /// 同一个 token 在 batch 中出现多次时梯度累加。
    pub fn backward(&self, input: &Array2<usize>, grad_output: &Array3<f32>) -> SparseRows {
        let mut rows: BTreeMap<usize, Vec<(usize, usize)>> = BTreeMap::new();
        for ((b, t), &token_id) in input.indexed_iter() {
            rows.entry(token_id).or_default().push((b, t));
        }

        let mut values = Array2::zeros((rows.len(), self.embedding_size));
        let mut indices = Vec::with_capacity(rows.len());

        for (k, (token_id, positions)) in rows.into_iter().enumerate() {
            let mut row = values.row_mut(k);
            for (b, t) in positions {
                row += &grad_output.slice(ndarray::s![b, t, ..]);
            }
            indices.push(token_id);
        }

        SparseRows {
            indices,
            values,
            dense_shape: (self.vocab_size, self.embedding_size),
        }
    }

    fn check_ids(&self, input: &Array2<usize>) -> Result<()> {
        for ((row, _), &id) in input.indexed_iter() {
            if id >= self.vocab_size {
                return Err(TextCnnError::InvalidTokenId {
                    id,
                    row,
                    vocab_size: self.vocab_size,
                });
            }
        }
        Ok(())
    }

    /// 获取嵌入维度
    pub fn embedding_size(&self) -> usize {
        self.embedding_size
    }

    /// 获取词表大小
    pub fn vocab_size(&self) -> usize {
        self.vocab_size
    }
}

impl Placement for Embedding {
    fn component_name(&self) -> String {
        "embedding".to_string()
    }

    // 查表固定在 CPU 上执行
    fn required_backend(&self) -> Option<Backend> {
        Some(Backend::Cpu)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::arr2;

    fn table() -> Array2<f32> {
        Array2::from_shape_fn((5, 3), |(i, j)| (i * 10 + j) as f32)
    }

    #[test]
    fn test_embedding_gather() {
        let embedding = Embedding::new(5, 3);
        let input = arr2(&[[0, 4, 2], [1, 1, 0]]);
        let output = embedding.forward(&table(), &input).unwrap();

        assert_eq!(output.shape(), &[2, 3, 3]);
        assert_eq!(output.slice(ndarray::s![0, 1, ..]).to_vec(), vec![40.0, 41.0, 42.0]);
        assert_eq!(output.slice(ndarray::s![1, 0, ..]).to_vec(), vec![10.0, 11.0, 12.0]);
    }

    #[test]
    fn test_out_of_range_id() {
        let embedding = Embedding::new(5, 3);
        let input = arr2(&[[0, 1, 2], [3, 5, 0]]);
        match embedding.forward(&table(), &input) {
            Err(TextCnnError::InvalidTokenId { id, row, vocab_size }) => {
                assert_eq!((id, row, vocab_size), (5, 1, 5));
            }
            other => panic!("expected InvalidTokenId, got {:?}", other),
        }
    }

    #[test]
    fn test_sparse_gradient() {
        let embedding = Embedding::new(5, 3);
        let input = arr2(&[[3, 1], [1, 3]]);
        let grad = Array3::ones((2, 2, 3));

        let sparse = embedding.backward(&input, &grad);

        // 只有第 1、3 行有梯度，重复出现的 token 梯度累加
        assert_eq!(sparse.indices, vec![1, 3]);
        assert_eq!(sparse.values.row(0).to_vec(), vec![2.0, 2.0, 2.0]);
        assert_eq!(sparse.dense_shape, (5, 3));

        let dense = sparse.to_dense();
        assert_eq!(dense.row(0).sum(), 0.0);
        assert_eq!(dense.row(2).sum(), 0.0);
        assert_eq!(dense.row(4).sum(), 0.0);
    }
}
