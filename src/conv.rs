//! 卷积 + 最大池化
//!
//! 每种卷积宽度对应一个 [`FilterBank`]：
//!
//! ```text
//! [B, L, E, 1] --conv(valid, stride 1)--> [B, L-f+1, 1, F]
//!              --+bias, ReLU-->           [B, L-f+1, 1, F]
//!              --max-pool(全长)-->        [B, 1, 1, F]
//! ```

use crate::error::{Result, TextCnnError};
use crate::execution::Placement;
use crate::params::FilterParams;
use ndarray::{s, Array1, Array2, Array3, Array4, ArrayView2, Axis};

/// 单一宽度的卷积核组
#[derive(Debug, Clone)]
pub struct FilterBank {
    width: usize,
    sequence_length: usize,
    embedding_size: usize,
    num_filters: usize,
}

/// 前向传播保存的中间值
#[derive(Debug, Clone)]
pub struct FilterCache {
    /// 每个 (样本, 卷积核) 最大值所在位置: [B, F]
    argmax: Array2<usize>,
    /// 该位置的激活前值是否为正（ReLU 导数）: [B, F]
    active: Array2<bool>,
}

impl FilterBank {
    /// 创建卷积核组
    ///
    /// 卷积核宽度为 0 或超过序列长度时直接报错，而不是等到第一个 batch。
    pub fn new(
        width: usize,
        sequence_length: usize,
        embedding_size: usize,
        num_filters: usize,
    ) -> Result<Self> {
        if width == 0 {
            return Err(TextCnnError::InvalidConfig("filter width must be positive".into()));
        }
        if width > sequence_length {
            return Err(TextCnnError::FilterTooWide {
                width,
                sequence_length,
            });
        }
        Ok(Self {
            width,
            sequence_length,
            embedding_size,
            num_filters,
        })
    }

    /// 卷积输出长度 `L - f + 1`
    pub fn conv_output_len(&self) -> usize {
        self.sequence_length - self.width + 1
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn num_filters(&self) -> usize {
        self.num_filters
    }

    /// 卷积核展开成矩阵: [f * E, F]
    fn kernel_matrix(&self, params: &FilterParams) -> Array2<f32> {
        let e = self.embedding_size;
        Array2::from_shape_fn((self.width * e, self.num_filters), |(j, k)| {
            params.weight[[j / e, j % e, 0, k]]
        })
    }

    /// 第 b 个样本的所有滑动窗口: [L-f+1, f * E]
    fn windows(&self, embedded: &Array4<f32>, b: usize) -> Array2<f32> {
        let e = self.embedding_size;
        Array2::from_shape_fn((self.conv_output_len(), self.width * e), |(t, j)| {
            embedded[[b, t + j / e, j % e, 0]]
        })
    }

    /// 有效卷积（加偏置，未激活）
    ///
    /// 输入: [B, L, E, 1]
    /// 输出: [B, L-f+1, 1, F]
    pub fn convolve(&self, params: &FilterParams, embedded: &Array4<f32>) -> Array4<f32> {
        let batch_size = embedded.len_of(Axis(0));
        let kernel = self.kernel_matrix(params);
        let mut output = Array4::zeros((batch_size, self.conv_output_len(), 1, self.num_filters));

        for b in 0..batch_size {
            let z = self.windows(embedded, b).dot(&kernel) + &params.bias;
            output.slice_mut(s![b, .., 0, ..]).assign(&z);
        }

        output
    }

    /// 前向传播：卷积、ReLU、全长最大池化
    ///
    /// 输入: [B, L, E, 1]
    /// 输出: [B, 1, 1, F]
    pub fn forward(&self, params: &FilterParams, embedded: &Array4<f32>) -> (Array4<f32>, FilterCache) {
        let conv = self.convolve(params, embedded);
        let batch_size = conv.len_of(Axis(0));

        let mut pooled = Array4::zeros((batch_size, 1, 1, self.num_filters));
        let mut argmax = Array2::zeros((batch_size, self.num_filters));
        let mut active = Array2::from_elem((batch_size, self.num_filters), false);

        for b in 0..batch_size {
            for k in 0..self.num_filters {
                // ReLU 后取最大值，相同时取最靠前的位置
                let mut best_t = 0;
                let mut best = conv[[b, 0, 0, k]].max(0.0);
                for t in 1..self.conv_output_len() {
                    let h = conv[[b, t, 0, k]].max(0.0);
                    if h > best {
                        best = h;
                        best_t = t;
                    }
                }
                pooled[[b, 0, 0, k]] = best;
                argmax[[b, k]] = best_t;
                active[[b, k]] = conv[[b, best_t, 0, k]] > 0.0;
            }
        }

        (pooled, FilterCache { argmax, active })
    }

    /// 反向传播
    ///
    /// 梯度只经过每个 (样本, 卷积核) 的最大值位置，并且只在激活前值为正时传递。
    ///
    /// 返回: (参数梯度, 对嵌入输入的梯度 [B, L, E])
    pub fn backward(
        &self,
        params: &FilterParams,
        embedded: &Array4<f32>,
        cache: &FilterCache,
        grad_pooled: ArrayView2<'_, f32>,
    ) -> (FilterParams, Array3<f32>) {
        let batch_size = embedded.len_of(Axis(0));
        let e = self.embedding_size;

        let mut grad_weight = Array4::zeros((self.width, e, 1, self.num_filters));
        let mut grad_bias = Array1::zeros(self.num_filters);
        let mut grad_input = Array3::zeros((batch_size, self.sequence_length, e));

        for b in 0..batch_size {
            for k in 0..self.num_filters {
                if !cache.active[[b, k]] {
                    continue;
                }
                let g = grad_pooled[[b, k]];
                let t = cache.argmax[[b, k]];

                grad_bias[k] += g;
                for i in 0..self.width {
                    for j in 0..e {
                        grad_weight[[i, j, 0, k]] += g * embedded[[b, t + i, j, 0]];
                        grad_input[[b, t + i, j]] += g * params.weight[[i, j, 0, k]];
                    }
                }
            }
        }

        (
            FilterParams {
                weight: grad_weight,
                bias: grad_bias,
            },
            grad_input,
        )
    }
}

impl Placement for FilterBank {
    fn component_name(&self) -> String {
        format!("conv-maxpool-{}", self.width)
    }
}
