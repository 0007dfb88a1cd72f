//! Text-CNN 模型
//!
//! 组件在构建时静态组合：
//!
//! ```text
//! tokens [B, L]
//!   → Embedding          [B, L, E, 1]
//!   → FilterBank × n     [B, 1, 1, F]   （各宽度相互独立，可并行）
//!   → FeatureConcat      [B, F * n]
//!   → Dropout            [B, F * n]
//!   → ClassifierHead     [B, C]
//! ```
//!
//! 模型本身不持有参数，参数在 [`Parameters`] 中，由调用方显式传入。

use crate::classifier::{ClassifierHead, HeadOutput};
use crate::config::ModelConfig;
use crate::conv::{FilterBank, FilterCache};
use crate::data::Batch;
use crate::embedding::Embedding;
use crate::error::{Result, TextCnnError};
use crate::execution::{Backend, ExecutionContext, Placement};
use crate::layers::{Dropout, FeatureConcat};
use crate::params::{FilterParams, Gradients, Parameters};
use crate::tensor::TensorExt;
use ndarray::{Array2, Array3, Array4, Axis};
use rand::Rng;
use rayon::prelude::*;
use tracing::debug;

/// 前向传播保存的中间值，供反向传播使用
#[derive(Debug, Clone)]
pub struct ForwardCache {
    /// 嵌入输出: [B, L, E, 1]
    embedded: Array4<f32>,
    /// 每个卷积核组的最大池化位置
    filter_caches: Vec<FilterCache>,
    /// dropout 之后的特征: [B, F * n]
    dropped: Array2<f32>,
    dropout: Dropout,
    mask: Option<Array2<f32>>,
    /// 类别分数: [B, C]
    scores: Array2<f32>,
}

/// 分块评估的结果
#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
    /// 按样本数加权的平均损失
    pub loss: f32,
    /// 准确率
    pub accuracy: f32,
    /// 每个样本的预测类别
    pub predictions: Vec<usize>,
}

/// 卷积句子分类模型
#[derive(Debug, Clone)]
pub struct TextCnn {
    config: ModelConfig,
    embedding: Embedding,
    banks: Vec<FilterBank>,
    concat: FeatureConcat,
    head: ClassifierHead,
    backend: Backend,
    parallel_filters: bool,
}

impl TextCnn {
    /// 校验超参数，组装组件，并一次性确定执行后端
    pub fn new(config: ModelConfig, context: &ExecutionContext) -> Result<Self> {
        config.validate()?;

        let embedding = Embedding::new(config.vocab_size, config.embedding_size);
        let banks = config
            .filter_sizes
            .iter()
            .map(|&width| {
                FilterBank::new(
                    width,
                    config.sequence_length,
                    config.embedding_size,
                    config.num_filters,
                )
            })
            .collect::<Result<Vec<_>>>()?;
        let concat = FeatureConcat::new(banks.len(), config.num_filters);
        let head = ClassifierHead::new(config.num_features(), config.num_classes);

        let mut components: Vec<&dyn Placement> = vec![&embedding];
        components.extend(banks.iter().map(|b| b as &dyn Placement));
        components.push(&concat);
        components.push(&head);
        let backend = context.resolve(&components)?;

        debug!(
            backend = ?backend,
            filter_sizes = ?config.filter_sizes,
            features = config.num_features(),
            "model assembled"
        );

        Ok(Self {
            config,
            embedding,
            banks,
            concat,
            head,
            backend,
            parallel_filters: context.parallel_filters(),
        })
    }

    /// 开启输出层 L2 正则
    pub fn with_l2_reg_lambda(mut self, l2_reg_lambda: f32) -> Self {
        self.head = self.head.with_l2_reg_lambda(l2_reg_lambda);
        self
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub fn backend(&self) -> Backend {
        self.backend
    }

    pub fn l2_reg_lambda(&self) -> f32 {
        self.head.l2_reg_lambda()
    }

    /// 随机初始化一组参数
    pub fn init_parameters<R: Rng>(&self, rng: &mut R) -> Parameters {
        Parameters::init(&self.config, rng)
    }

    /// 校验 token 矩阵的宽度
    fn check_inputs(&self, inputs: &Array2<usize>) -> Result<()> {
        if inputs.nrows() == 0 {
            return Err(TextCnnError::EmptyBatch);
        }
        if inputs.ncols() != self.config.sequence_length {
            return Err(TextCnnError::shape(
                "batch inputs",
                &[inputs.nrows(), self.config.sequence_length],
                inputs.shape(),
            ));
        }
        Ok(())
    }

    /// 校验 batch：形状、标签 one-hot
    pub fn validate_batch(&self, batch: &Batch) -> Result<()> {
        self.check_inputs(&batch.inputs)?;
        let expected = [batch.inputs.nrows(), self.config.num_classes];
        if batch.labels.shape() != expected {
            return Err(TextCnnError::shape("batch labels", &expected, batch.labels.shape()));
        }
        for (i, row) in batch.labels.rows().into_iter().enumerate() {
            let ones = row.iter().filter(|&&v| v == 1.0).count();
            let zeros = row.iter().filter(|&&v| v == 0.0).count();
            if ones != 1 || ones + zeros != row.len() {
                return Err(TextCnnError::InvalidLabel(i));
            }
        }
        Ok(())
    }

    /// 嵌入 + 各卷积核组 + 拼接
    fn extract_features(
        &self,
        params: &Parameters,
        inputs: &Array2<usize>,
    ) -> Result<(Array4<f32>, Vec<FilterCache>, Array2<f32>)> {
        params.check_shapes(&self.config)?;

        let embedded = self
            .embedding
            .forward(&params.embedding, inputs)?
            .insert_axis(Axis(3));

        let outputs: Vec<(Array4<f32>, FilterCache)> = if self.parallel_filters {
            self.banks
                .par_iter()
                .zip(params.filters.par_iter())
                .map(|(bank, p)| bank.forward(p, &embedded))
                .collect()
        } else {
            self.banks
                .iter()
                .zip(&params.filters)
                .map(|(bank, p)| bank.forward(p, &embedded))
                .collect()
        };

        let (pooled, caches): (Vec<_>, Vec<_>) = outputs.into_iter().unzip();
        let features = self.concat.forward(&pooled)?;
        Ok((embedded, caches, features))
    }

    /// 训练模式的前向传播
    ///
    /// `keep_prob == 1` 时 dropout 为恒等映射，不消耗随机数。
    pub fn forward<R: Rng>(
        &self,
        params: &Parameters,
        batch: &Batch,
        keep_prob: f32,
        rng: &mut R,
    ) -> Result<(HeadOutput, ForwardCache)> {
        let dropout = Dropout::new(keep_prob)?;
        self.validate_batch(batch)?;

        let (embedded, filter_caches, features) = self.extract_features(params, &batch.inputs)?;
        let (dropped, mask) = dropout.forward(&features, rng);
        let output = self
            .head
            .forward(&params.output_weight, &params.output_bias, &dropped, &batch.labels);

        let cache = ForwardCache {
            embedded,
            filter_caches,
            dropped,
            dropout,
            mask,
            scores: output.scores.clone(),
        };
        Ok((output, cache))
    }

    /// 反向传播，得到所有参数的梯度（不修改参数）
    pub fn backward(&self, params: &Parameters, batch: &Batch, cache: &ForwardCache) -> Result<Gradients> {
        self.validate_batch(batch)?;
        params.check_shapes(&self.config)?;

        let (grad_dropped, output_weight, output_bias) = self.head.backward(
            &params.output_weight,
            &params.output_bias,
            &cache.dropped,
            &cache.scores,
            &batch.labels,
        );
        let grad_features = cache.dropout.backward(&grad_dropped, cache.mask.as_ref());
        let grad_pooled = self.concat.backward(&grad_features);

        let bank_grads: Vec<(FilterParams, Array3<f32>)> = if self.parallel_filters {
            self.banks
                .par_iter()
                .zip(params.filters.par_iter())
                .zip(cache.filter_caches.par_iter())
                .zip(grad_pooled.par_iter())
                .map(|(((bank, p), c), g)| bank.backward(p, &cache.embedded, c, g.view()))
                .collect()
        } else {
            self.banks
                .iter()
                .zip(&params.filters)
                .zip(&cache.filter_caches)
                .zip(&grad_pooled)
                .map(|(((bank, p), c), g)| bank.backward(p, &cache.embedded, c, g.view()))
                .collect()
        };

        let (batch_size, seq_len, emb) = (
            batch.inputs.nrows(),
            self.config.sequence_length,
            self.config.embedding_size,
        );
        let mut grad_embedded = Array3::zeros((batch_size, seq_len, emb));
        let mut filters = Vec::with_capacity(bank_grads.len());
        for (grads, grad_input) in bank_grads {
            grad_embedded += &grad_input;
            filters.push(grads);
        }

        Ok(Gradients {
            embedding: self.embedding.backward(&batch.inputs, &grad_embedded),
            filters,
            output_weight,
            output_bias,
        })
    }

    /// 评估模式的前向传播（keep_prob = 1）
    pub fn evaluate(&self, params: &Parameters, batch: &Batch) -> Result<HeadOutput> {
        self.validate_batch(batch)?;
        let (_, _, features) = self.extract_features(params, &batch.inputs)?;
        Ok(self
            .head
            .forward(&params.output_weight, &params.output_bias, &features, &batch.labels))
    }

    /// 分块评估
    ///
    /// `chunk_size` 为 None 时整个数据集作为一个 batch。
    pub fn evaluate_chunked(
        &self,
        params: &Parameters,
        batch: &Batch,
        chunk_size: Option<usize>,
    ) -> Result<Evaluation> {
        let total = batch.len();
        let chunk = chunk_size.unwrap_or(total).max(1);

        let mut loss_sum = 0.0;
        let mut predictions = Vec::with_capacity(total);
        let mut start = 0;
        while start < total {
            let end = (start + chunk).min(total);
            let output = self.evaluate(params, &batch.slice(start, end))?;
            loss_sum += output.loss * (end - start) as f32;
            predictions.extend(output.predictions);
            start = end;
        }
        if predictions.is_empty() {
            return Err(TextCnnError::EmptyBatch);
        }

        let correct = predictions
            .iter()
            .zip(batch.label_indices())
            .filter(|(p, t)| **p == *t)
            .count();

        Ok(Evaluation {
            loss: loss_sum / total as f32,
            accuracy: correct as f32 / total as f32,
            predictions,
        })
    }

    /// 只计算分数（无标签）
    pub fn scores(&self, params: &Parameters, inputs: &Array2<usize>) -> Result<Array2<f32>> {
        self.check_inputs(inputs)?;
        let (_, _, features) = self.extract_features(params, inputs)?;
        Ok(self.head.scores(&params.output_weight, &params.output_bias, &features))
    }

    /// 分块预测类别
    pub fn predict(&self, params: &Parameters, inputs: &Array2<usize>, chunk_size: usize) -> Result<Vec<usize>> {
        let chunk = chunk_size.max(1);
        let mut predictions = Vec::with_capacity(inputs.nrows());
        for rows in inputs.axis_chunks_iter(Axis(0), chunk) {
            predictions.extend(self.scores(params, &rows.to_owned())?.argmax_rows());
        }
        Ok(predictions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::one_hot;
    use approx::assert_abs_diff_eq;
    use ndarray::arr2;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn small_config() -> ModelConfig {
        ModelConfig::new(5, 2, 10)
            .with_embedding_size(4)
            .with_filter_sizes(vec![2, 3])
            .with_num_filters(2)
    }

    fn model(parallel: bool) -> TextCnn {
        TextCnn::new(small_config(), &ExecutionContext::cpu().with_parallel_filters(parallel)).unwrap()
    }

    fn batch() -> Batch {
        Batch::new(
            arr2(&[[1, 2, 3, 4, 0], [5, 5, 6, 0, 0], [9, 8, 7, 2, 1]]),
            one_hot(&[0, 1, 1], 2),
        )
    }

    #[test]
    fn test_single_sentence_scenario() {
        let model = model(true);
        let params = model.init_parameters(&mut StdRng::seed_from_u64(10));
        let batch = Batch::new(arr2(&[[1, 2, 3, 4, 0]]), arr2(&[[1.0, 0.0]]));

        let (output, _) = model
            .forward(&params, &batch, 0.5, &mut StdRng::seed_from_u64(0))
            .unwrap();

        assert_eq!(output.scores.shape(), &[1, 2]);
        assert!(output.loss.is_finite() && output.loss >= 0.0);
        assert!(output.accuracy == 0.0 || output.accuracy == 1.0);
    }

    #[test]
    fn test_deterministic_evaluation() {
        let model = model(true);
        let params = model.init_parameters(&mut StdRng::seed_from_u64(3));

        let a = model.evaluate(&params, &batch()).unwrap();
        let b = model.evaluate(&params, &batch()).unwrap();
        assert_eq!(a, b);

        // keep_prob = 1 的训练前向与评估一致
        let (c, _) = model
            .forward(&params, &batch(), 1.0, &mut StdRng::seed_from_u64(99))
            .unwrap();
        assert_eq!(a, c);
    }

    #[test]
    fn test_parallel_matches_sequential() {
        let params = model(false).init_parameters(&mut StdRng::seed_from_u64(5));
        let batch = batch();

        let run = |m: &TextCnn| {
            let (out, cache) = m
                .forward(&params, &batch, 0.5, &mut StdRng::seed_from_u64(1))
                .unwrap();
            let grads = m.backward(&params, &batch, &cache).unwrap();
            (out, grads)
        };
        let (out_seq, grads_seq) = run(&model(false));
        let (out_par, grads_par) = run(&model(true));

        assert_eq!(out_seq, out_par);
        assert_eq!(grads_seq.filters, grads_par.filters);
        assert_eq!(grads_seq.embedding, grads_par.embedding);
    }

    #[test]
    fn test_embedding_gradient_is_sparse() {
        let model = model(true);
        let params = model.init_parameters(&mut StdRng::seed_from_u64(2));
        let batch = batch();

        let (_, cache) = model
            .forward(&params, &batch, 1.0, &mut StdRng::seed_from_u64(0))
            .unwrap();
        let grads = model.backward(&params, &batch, &cache).unwrap();

        assert_eq!(grads.embedding.indices, vec![0, 1, 2, 3, 4, 5, 6, 7, 8, 9]);
        let batch = Batch::new(arr2(&[[3, 3, 7, 7, 3]]), arr2(&[[0.0, 1.0]]));
        let (_, cache) = model
            .forward(&params, &batch, 1.0, &mut StdRng::seed_from_u64(0))
            .unwrap();
        let grads = model.backward(&params, &batch, &cache).unwrap();
        assert_eq!(grads.embedding.indices, vec![3, 7]);
        assert_eq!(grads.embedding.values.shape(), &[2, 4]);
    }

    /// 用中心差分检查反向传播
    #[test]
    fn test_gradients_match_finite_differences() {
        let model = model(false).with_l2_reg_lambda(0.05);
        let params = model.init_parameters(&mut StdRng::seed_from_u64(7));
        let batch = batch();

        let (_, cache) = model
            .forward(&params, &batch, 1.0, &mut StdRng::seed_from_u64(0))
            .unwrap();
        let grads = model.backward(&params, &batch, &cache).unwrap();
        let dense_embedding = grads.embedding.to_dense();

        let eps = 1e-3;
        let loss_at = |p: &Parameters| model.evaluate(p, &batch).unwrap().loss;
        let numeric = |edit: &dyn Fn(&mut Parameters, f32)| {
            let mut plus = params.clone();
            edit(&mut plus, eps);
            let mut minus = params.clone();
            edit(&mut minus, -eps);
            (loss_at(&plus) - loss_at(&minus)) / (2.0 * eps)
        };

        let g = numeric(&|p, d| p.output_bias[1] += d);
        assert_abs_diff_eq!(g, grads.output_bias[1], epsilon = 1e-2);

        let g = numeric(&|p, d| p.output_weight[[2, 0]] += d);
        assert_abs_diff_eq!(g, grads.output_weight[[2, 0]], epsilon = 1e-2);

        let g = numeric(&|p, d| p.filters[0].bias[1] += d);
        assert_abs_diff_eq!(g, grads.filters[0].bias[1], epsilon = 1e-2);

        let g = numeric(&|p, d| p.filters[1].weight[[1, 2, 0, 0]] += d);
        assert_abs_diff_eq!(g, grads.filters[1].weight[[1, 2, 0, 0]], epsilon = 1e-2);

        let g = numeric(&|p, d| p.embedding[[5, 1]] += d);
        assert_abs_diff_eq!(g, dense_embedding[[5, 1]], epsilon = 1e-2);
    }

    #[test]
    fn test_shape_errors() {
        let model = model(true);
        let params = model.init_parameters(&mut StdRng::seed_from_u64(0));
        let mut rng = StdRng::seed_from_u64(0);

        let wide = Batch::new(arr2(&[[1, 2, 3, 4, 0, 0]]), arr2(&[[1.0, 0.0]]));
        assert!(matches!(
            model.forward(&params, &wide, 1.0, &mut rng),
            Err(TextCnnError::ShapeMismatch { .. })
        ));

        let labels = Batch::new(arr2(&[[1, 2, 3, 4, 0]]), arr2(&[[1.0, 0.0, 0.0]]));
        assert!(matches!(
            model.evaluate(&params, &labels),
            Err(TextCnnError::ShapeMismatch { .. })
        ));

        let not_one_hot = Batch::new(arr2(&[[1, 2, 3, 4, 0]]), arr2(&[[0.5, 0.5]]));
        assert!(matches!(
            model.evaluate(&params, &not_one_hot),
            Err(TextCnnError::InvalidLabel(0))
        ));

        let bad_id = Batch::new(arr2(&[[1, 2, 3, 4, 10]]), arr2(&[[1.0, 0.0]]));
        assert!(matches!(
            model.evaluate(&params, &bad_id),
            Err(TextCnnError::InvalidTokenId { id: 10, .. })
        ));

        let empty = Batch::new(Array2::zeros((0, 5)), Array2::zeros((0, 2)));
        assert!(matches!(model.evaluate(&params, &empty), Err(TextCnnError::EmptyBatch)));

        assert!(matches!(
            model.forward(&params, &batch(), 0.0, &mut rng),
            Err(TextCnnError::InvalidKeepProb(_))
        ));
    }

    #[test]
    fn test_construction_rejects_wide_filter() {
        let config = small_config().with_filter_sizes(vec![2, 6]);
        assert!(matches!(
            TextCnn::new(config, &ExecutionContext::cpu()),
            Err(TextCnnError::FilterTooWide { width: 6, .. })
        ));
    }

    #[test]
    fn test_chunked_evaluation_matches_single_batch() {
        let model = model(true);
        let params = model.init_parameters(&mut StdRng::seed_from_u64(4));
        let batch = batch();

        let whole = model.evaluate(&params, &batch).unwrap();
        let chunked = model.evaluate_chunked(&params, &batch, Some(2)).unwrap();

        assert_eq!(chunked.predictions, whole.predictions);
        assert_eq!(chunked.accuracy, whole.accuracy);
        assert_abs_diff_eq!(chunked.loss, whole.loss, epsilon = 1e-5);

        let predicted = model.predict(&params, &batch.inputs, 2).unwrap();
        assert_eq!(predicted, whole.predictions);
    }
}
