//! 模型参数与梯度
//!
//! 所有可训练张量集中在 [`Parameters`] 中，按固定顺序枚举：
//!
//! ```text
//! embedding/W
//! conv-maxpool-{f}/W, conv-maxpool-{f}/b   （按 filter_sizes 声明顺序）
//! output/W, output/b
//! ```
//!
//! 优化器和检查点都依赖这个顺序。

use crate::config::ModelConfig;
use crate::error::{Result, TextCnnError};
use crate::tensor::{glorot_uniform, random_uniform, truncated_normal};
use ndarray::{Array1, Array2, Array4, ArrayViewD, ArrayViewMutD};
use rand::Rng;

/// 单个卷积宽度的参数（梯度也使用同样的结构）
#[derive(Debug, Clone, PartialEq)]
pub struct FilterParams {
    /// 卷积核: [filter_size, embedding_size, 1, num_filters]
    pub weight: Array4<f32>,
    /// 偏置: [num_filters]
    pub bias: Array1<f32>,
}

/// 全部可训练参数
#[derive(Debug, Clone, PartialEq)]
pub struct Parameters {
    /// 词嵌入矩阵: [vocab_size, embedding_size]
    pub embedding: Array2<f32>,
    /// 每种卷积宽度的参数（与 filter_sizes 顺序一致）
    pub filters: Vec<FilterParams>,
    /// 输出层权重: [num_filters * num_filter_widths, num_classes]
    pub output_weight: Array2<f32>,
    /// 输出层偏置: [num_classes]
    pub output_bias: Array1<f32>,
    filter_sizes: Vec<usize>,
}

impl Parameters {
    /// 随机初始化
    ///
    /// - 嵌入：均匀分布 [-1, 1)
    /// - 卷积核：截断正态，标准差 0.1；偏置常数 0.1
    /// - 输出层：Xavier 均匀；偏置常数 0.1
    pub fn init<R: Rng>(config: &ModelConfig, rng: &mut R) -> Self {
        let embedding = random_uniform((config.vocab_size, config.embedding_size), -1.0, 1.0, rng);

        let filters = config
            .filter_sizes
            .iter()
            .map(|&width| FilterParams {
                weight: truncated_normal(
                    (width, config.embedding_size, 1, config.num_filters),
                    0.1,
                    rng,
                ),
                bias: Array1::from_elem(config.num_filters, 0.1),
            })
            .collect();

        let output_weight = glorot_uniform((config.num_features(), config.num_classes), rng);
        let output_bias = Array1::from_elem(config.num_classes, 0.1);

        Self {
            embedding,
            filters,
            output_weight,
            output_bias,
            filter_sizes: config.filter_sizes.clone(),
        }
    }

    /// 由已有张量组装参数并校验形状
    pub fn from_parts(
        config: &ModelConfig,
        embedding: Array2<f32>,
        filters: Vec<FilterParams>,
        output_weight: Array2<f32>,
        output_bias: Array1<f32>,
    ) -> Result<Self> {
        let params = Self {
            embedding,
            filters,
            output_weight,
            output_bias,
            filter_sizes: config.filter_sizes.clone(),
        };
        params.check_shapes(config)?;
        Ok(params)
    }

    /// 按枚举顺序返回参数名
    pub fn names(&self) -> Vec<String> {
        param_names(&self.filter_sizes)
    }

    /// 按枚举顺序返回所有张量的只读视图
    pub fn tensors(&self) -> Vec<ArrayViewD<'_, f32>> {
        let mut out = Vec::with_capacity(3 + 2 * self.filters.len());
        out.push(self.embedding.view().into_dyn());
        for filter in &self.filters {
            out.push(filter.weight.view().into_dyn());
            out.push(filter.bias.view().into_dyn());
        }
        out.push(self.output_weight.view().into_dyn());
        out.push(self.output_bias.view().into_dyn());
        out
    }

    /// 按枚举顺序返回所有张量的可变视图（仅供优化器使用）
    pub(crate) fn tensors_mut(&mut self) -> Vec<ArrayViewMutD<'_, f32>> {
        let mut out = Vec::with_capacity(3 + 2 * self.filters.len());
        out.push(self.embedding.view_mut().into_dyn());
        for filter in &mut self.filters {
            out.push(filter.weight.view_mut().into_dyn());
            out.push(filter.bias.view_mut().into_dyn());
        }
        out.push(self.output_weight.view_mut().into_dyn());
        out.push(self.output_bias.view_mut().into_dyn());
        out
    }

    /// 校验每个张量的形状与配置一致
    pub fn check_shapes(&self, config: &ModelConfig) -> Result<()> {
        if self.filter_sizes != config.filter_sizes || self.filters.len() != config.filter_sizes.len() {
            return Err(TextCnnError::shape(
                "filter banks",
                &config.filter_sizes,
                &self.filter_sizes,
            ));
        }
        let expected = expected_shapes(config);
        for ((name, shape), tensor) in self.names().iter().zip(expected.iter()).zip(self.tensors()) {
            if tensor.shape() != shape.as_slice() {
                return Err(TextCnnError::shape(name.as_str(), shape, tensor.shape()));
            }
        }
        Ok(())
    }

    /// 参数总数
    pub fn param_count(&self) -> usize {
        self.tensors().iter().map(|t| t.len()).sum()
    }

    pub fn filter_sizes(&self) -> &[usize] {
        &self.filter_sizes
    }
}

/// 参数名（枚举顺序）
pub fn param_names(filter_sizes: &[usize]) -> Vec<String> {
    let mut names = vec!["embedding/W".to_string()];
    for width in filter_sizes {
        names.push(format!("conv-maxpool-{}/W", width));
        names.push(format!("conv-maxpool-{}/b", width));
    }
    names.push("output/W".to_string());
    names.push("output/b".to_string());
    names
}

/// 各参数的期望形状（枚举顺序）
pub fn expected_shapes(config: &ModelConfig) -> Vec<Vec<usize>> {
    let mut shapes = vec![vec![config.vocab_size, config.embedding_size]];
    for &width in &config.filter_sizes {
        shapes.push(vec![width, config.embedding_size, 1, config.num_filters]);
        shapes.push(vec![config.num_filters]);
    }
    shapes.push(vec![config.num_features(), config.num_classes]);
    shapes.push(vec![config.num_classes]);
    shapes
}

/// 稀疏行梯度
///
/// 只记录 batch 中出现过的行，`indices` 升序且不重复。
#[derive(Debug, Clone, PartialEq)]
pub struct SparseRows {
    /// 行号
    pub indices: Vec<usize>,
    /// 对应行的梯度: [indices.len(), cols]
    pub values: Array2<f32>,
    /// 稠密矩阵的形状 (rows, cols)
    pub dense_shape: (usize, usize),
}

impl SparseRows {
    /// 展开为稠密矩阵
    pub fn to_dense(&self) -> Array2<f32> {
        let mut dense = Array2::zeros(self.dense_shape);
        for (k, &row) in self.indices.iter().enumerate() {
            dense.row_mut(row).assign(&self.values.row(k));
        }
        dense
    }
}

/// 梯度张量的引用
#[derive(Debug)]
pub enum GradRef<'a> {
    /// 稠密梯度
    Dense(ArrayViewD<'a, f32>),
    /// 稀疏行梯度（嵌入矩阵）
    Sparse(&'a SparseRows),
}

impl GradRef<'_> {
    /// 对应参数的形状
    pub fn shape(&self) -> Vec<usize> {
        match self {
            GradRef::Dense(view) => view.shape().to_vec(),
            GradRef::Sparse(rows) => vec![rows.dense_shape.0, rows.dense_shape.1],
        }
    }

    /// 所有元素是否有限
    pub fn is_finite(&self) -> bool {
        match self {
            GradRef::Dense(view) => view.iter().all(|v| v.is_finite()),
            GradRef::Sparse(rows) => rows.values.iter().all(|v| v.is_finite()),
        }
    }
}

/// 一次反向传播得到的全部梯度
#[derive(Debug, Clone)]
pub struct Gradients {
    /// 嵌入矩阵的稀疏梯度
    pub embedding: SparseRows,
    /// 卷积参数的梯度
    pub filters: Vec<FilterParams>,
    /// 输出层权重梯度
    pub output_weight: Array2<f32>,
    /// 输出层偏置梯度
    pub output_bias: Array1<f32>,
}

impl Gradients {
    /// 按参数枚举顺序返回梯度
    pub fn entries(&self) -> Vec<GradRef<'_>> {
        let mut out = Vec::with_capacity(3 + 2 * self.filters.len());
        out.push(GradRef::Sparse(&self.embedding));
        for filter in &self.filters {
            out.push(GradRef::Dense(filter.weight.view().into_dyn()));
            out.push(GradRef::Dense(filter.bias.view().into_dyn()));
        }
        out.push(GradRef::Dense(self.output_weight.view().into_dyn()));
        out.push(GradRef::Dense(self.output_bias.view().into_dyn()));
        out
    }
}
