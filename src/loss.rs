//! 损失函数和准确率
//!
//! 分类器输出未归一化的分数（logits），softmax 与交叉熵合并计算。

use crate::tensor::TensorExt;
use ndarray::Array2;

/// 损失函数 trait
pub trait LossFunction {
    /// 计算 batch 平均损失
    fn compute(&self, scores: &Array2<f32>, targets: &Array2<f32>) -> f32;

    /// 计算梯度（关于分数）
    fn grad(&self, scores: &Array2<f32>, targets: &Array2<f32>) -> Array2<f32>;

    /// 损失函数名称
    fn name(&self) -> &str;
}

/// Softmax 交叉熵损失
///
/// ```text
/// L_i = log Σ_j exp(s_ij - m_i) - (s_iy - m_i),   m_i = max_j s_ij
/// L   = (1/B) Σ_i L_i
/// ```
///
/// 先减去每行最大值再取指数，分数很大时也不会溢出。
#[derive(Debug, Clone, Copy, Default)]
pub struct SoftmaxCrossEntropy;

impl SoftmaxCrossEntropy {
    pub fn new() -> Self {
        Self
    }

    /// 每个样本的损失
    pub fn per_example(&self, scores: &Array2<f32>, targets: &Array2<f32>) -> Vec<f32> {
        let lse = scores.log_sum_exp_rows();
        scores
            .rows()
            .into_iter()
            .zip(targets.rows())
            .zip(lse)
            .map(|((s, t), lse)| {
                // one-hot 标签下等价于 lse - s_y；对软标签同样成立
                s.iter().zip(t.iter()).map(|(&s, &t)| t * (lse - s)).sum::<f32>()
            })
            .collect()
    }
}

impl LossFunction for SoftmaxCrossEntropy {
    fn compute(&self, scores: &Array2<f32>, targets: &Array2<f32>) -> f32 {
        let losses = self.per_example(scores, targets);
        if losses.is_empty() {
            return 0.0;
        }
        losses.iter().sum::<f32>() / losses.len() as f32
    }

    fn grad(&self, scores: &Array2<f32>, targets: &Array2<f32>) -> Array2<f32> {
        // Softmax + 交叉熵的梯度简化为 (softmax - target) / B
        let n = scores.nrows().max(1) as f32;
        (scores.softmax(1) - targets) / n
    }

    fn name(&self) -> &str {
        "SoftmaxCrossEntropy"
    }
}

/// 准确率（用于评估，不是真正的损失函数）
#[derive(Debug, Clone, Copy, Default)]
pub struct Accuracy;

impl Accuracy {
    pub fn new() -> Self {
        Self
    }

    /// 计算分类准确率
    ///
    /// # 参数
    /// - `predictions`: [batch_size] 预测类别
    /// - `targets`: [batch_size, n_classes] one-hot 标签
    pub fn compute(&self, predictions: &[usize], targets: &Array2<f32>) -> f32 {
        if predictions.is_empty() {
            return 0.0;
        }
        let correct = predictions
            .iter()
            .zip(targets.argmax_rows())
            .filter(|(pred, target)| **pred == *target)
            .count();

        correct as f32 / predictions.len() as f32
    }

    pub fn name(&self) -> &str {
        "Accuracy"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::arr2;

    #[test]
    fn test_cross_entropy_loss() {
        let loss_fn = SoftmaxCrossEntropy::new();

        // 均匀分数：损失为 ln(C)
        let scores = arr2(&[[0.0, 0.0, 0.0]]);
        let targets = arr2(&[[0.0, 1.0, 0.0]]);
        assert_abs_diff_eq!(loss_fn.compute(&scores, &targets), 3.0f32.ln(), epsilon = 1e-6);

        // 正确类别分数很高：损失接近 0
        let scores = arr2(&[[0.0, 20.0, 0.0]]);
        assert!(loss_fn.compute(&scores, &targets) < 1e-6);

        // 完全错误：损失很大
        let scores = arr2(&[[20.0, 0.0, 0.0]]);
        assert!(loss_fn.compute(&scores, &targets) > 10.0);
    }

    #[test]
    fn test_cross_entropy_large_scores() {
        let loss_fn = SoftmaxCrossEntropy::new();
        let scores = arr2(&[[1e4, -1e4], [-1e4, 1e4]]);
        let targets = arr2(&[[0.0, 1.0], [0.0, 1.0]]);

        let loss = loss_fn.compute(&scores, &targets);
        assert!(loss.is_finite());
        assert_abs_diff_eq!(loss, 1e4, epsilon = 1.0);
    }

    #[test]
    fn test_cross_entropy_grad() {
        let loss_fn = SoftmaxCrossEntropy::new();
        let scores = arr2(&[[0.0, 0.0], [0.0, 0.0]]);
        let targets = arr2(&[[1.0, 0.0], [0.0, 1.0]]);

        let grad = loss_fn.grad(&scores, &targets);
        assert_abs_diff_eq!(grad[[0, 0]], -0.25, epsilon = 1e-6);
        assert_abs_diff_eq!(grad[[0, 1]], 0.25, epsilon = 1e-6);
        // 每行梯度之和为 0
        assert_abs_diff_eq!(grad.row(1).sum(), 0.0, epsilon = 1e-6);
    }

    #[test]
    fn test_accuracy() {
        let acc_fn = Accuracy::new();
        let targets = arr2(&[[0.0, 1.0, 0.0], [1.0, 0.0, 0.0], [0.0, 0.0, 1.0]]);

        assert_eq!(acc_fn.compute(&[1, 0, 2], &targets), 1.0);

        let acc = acc_fn.compute(&[1, 1, 2], &targets);
        assert_abs_diff_eq!(acc, 2.0 / 3.0, epsilon = 1e-6);
    }
}
