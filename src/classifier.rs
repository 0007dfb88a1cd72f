//! 输出层
//!
//! 仿射变换得到类别分数，附带预测、损失和准确率。

use crate::execution::Placement;
use crate::loss::{Accuracy, LossFunction, SoftmaxCrossEntropy};
use crate::tensor::TensorExt;
use ndarray::{Array1, Array2, Axis};

/// 分类头
#[derive(Debug, Clone)]
pub struct ClassifierHead {
    in_features: usize,
    num_classes: usize,
    /// 输出层 L2 正则系数
    l2_reg_lambda: f32,
    loss_fn: SoftmaxCrossEntropy,
}

/// 分类头的输出
#[derive(Debug, Clone, PartialEq)]
pub struct HeadOutput {
    /// 类别分数: [B, num_classes]
    pub scores: Array2<f32>,
    /// 预测类别: [B]
    pub predictions: Vec<usize>,
    /// batch 平均损失（含 L2 项）
    pub loss: f32,
    /// 准确率
    pub accuracy: f32,
}

impl ClassifierHead {
    pub fn new(in_features: usize, num_classes: usize) -> Self {
        Self {
            in_features,
            num_classes,
            l2_reg_lambda: 0.0,
            loss_fn: SoftmaxCrossEntropy::new(),
        }
    }

    /// 开启输出层 L2 正则：loss += λ * (½‖W‖² + ½‖b‖²)
    pub fn with_l2_reg_lambda(mut self, l2_reg_lambda: f32) -> Self {
        self.l2_reg_lambda = l2_reg_lambda;
        self
    }

    pub fn l2_reg_lambda(&self) -> f32 {
        self.l2_reg_lambda
    }

    pub fn in_features(&self) -> usize {
        self.in_features
    }

    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    /// 分数: scores = features · W + b
    ///
    /// 输入: [B, in_features]
    /// 输出: [B, num_classes]
    pub fn scores(&self, weight: &Array2<f32>, bias: &Array1<f32>, features: &Array2<f32>) -> Array2<f32> {
        features.matmul(weight) + bias
    }

    /// 计算分数、预测、损失和准确率
    pub fn forward(
        &self,
        weight: &Array2<f32>,
        bias: &Array1<f32>,
        features: &Array2<f32>,
        labels: &Array2<f32>,
    ) -> HeadOutput {
        let scores = self.scores(weight, bias, features);
        let predictions = scores.argmax_rows();

        let mut loss = self.loss_fn.compute(&scores, labels);
        if self.l2_reg_lambda > 0.0 {
            let l2 = 0.5 * weight.iter().map(|w| w * w).sum::<f32>()
                + 0.5 * bias.iter().map(|b| b * b).sum::<f32>();
            loss += self.l2_reg_lambda * l2;
        }
        let accuracy = Accuracy::new().compute(&predictions, labels);

        HeadOutput {
            scores,
            predictions,
            loss,
            accuracy,
        }
    }

    /// 反向传播
    ///
    /// 返回: (d_features, d_weight, d_bias)
    pub fn backward(
        &self,
        weight: &Array2<f32>,
        bias: &Array1<f32>,
        features: &Array2<f32>,
        scores: &Array2<f32>,
        labels: &Array2<f32>,
    ) -> (Array2<f32>, Array2<f32>, Array1<f32>) {
        let grad_scores = self.loss_fn.grad(scores, labels);

        // d_weight = features^T · d_scores
        let mut grad_weight = features.t().dot(&grad_scores);
        // d_bias = sum(d_scores, axis=0)
        let mut grad_bias = grad_scores.sum_axis(Axis(0));

        if self.l2_reg_lambda > 0.0 {
            grad_weight.scaled_add(self.l2_reg_lambda, weight);
            grad_bias.scaled_add(self.l2_reg_lambda, bias);
        }

        // d_features = d_scores · W^T
        let grad_features = grad_scores.dot(&weight.t());

        (grad_features, grad_weight, grad_bias)
    }
}

impl Placement for ClassifierHead {
    fn component_name(&self) -> String {
        "output".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::{arr1, arr2};

    #[test]
    fn test_scores_shape_and_values() {
        let head = ClassifierHead::new(3, 2);
        let weight = arr2(&[[1.0, 0.0], [0.0, 1.0], [1.0, 1.0]]);
        let bias = arr1(&[0.5, -0.5]);
        let features = arr2(&[[1.0, 2.0, 3.0]]);

        let scores = head.scores(&weight, &bias, &features);
        assert_eq!(scores, arr2(&[[4.5, 4.5]]));
    }

    #[test]
    fn test_accuracy_matches_predictions() {
        let head = ClassifierHead::new(2, 3);
        let weight = arr2(&[[1.0, 0.0, 0.0], [0.0, 1.0, 0.0]]);
        let bias = arr1(&[0.0, 0.0, 0.0]);
        let features = arr2(&[[2.0, 1.0], [0.0, 3.0], [1.0, 1.0], [0.0, 0.0]]);
        let labels = arr2(&[
            [1.0, 0.0, 0.0],
            [0.0, 0.0, 1.0],
            [1.0, 0.0, 0.0],
            [0.0, 0.0, 1.0],
        ]);

        let out = head.forward(&weight, &bias, &features, &labels);

        // 第 3 行平局取下标 0；第 4 行全零取下标 0
        assert_eq!(out.predictions, vec![0, 1, 0, 0]);
        let correct = out
            .predictions
            .iter()
            .zip(labels.argmax_rows())
            .filter(|(p, t)| **p == *t)
            .count();
        assert_eq!(out.accuracy, correct as f32 / 4.0);
        assert_eq!(out.accuracy, 0.5);
        assert!(out.loss.is_finite() && out.loss >= 0.0);
    }

    #[test]
    fn test_l2_penalty() {
        let weight = arr2(&[[1.0, 2.0]]);
        let bias = arr1(&[0.0, 2.0]);
        let features = arr2(&[[0.0]]);
        let labels = arr2(&[[1.0, 0.0]]);

        let plain = ClassifierHead::new(1, 2).forward(&weight, &bias, &features, &labels);
        let head = ClassifierHead::new(1, 2).with_l2_reg_lambda(0.1);
        let penalized = head.forward(&weight, &bias, &features, &labels);

        // λ * ½ (1 + 4 + 4) = 0.45
        assert_abs_diff_eq!(penalized.loss - plain.loss, 0.45, epsilon = 1e-5);

        let (_, grad_w, grad_b) = head.backward(&weight, &bias, &features, &penalized.scores, &labels);
        assert_abs_diff_eq!(grad_w[[0, 1]], 0.2, epsilon = 1e-6);
        assert!(grad_b[1] > 0.2);
    }

    #[test]
    fn test_backward_shapes() {
        let head = ClassifierHead::new(4, 3);
        let weight = Array2::from_elem((4, 3), 0.1);
        let bias = Array1::zeros(3);
        let features = Array2::from_elem((5, 4), 1.0);
        let labels = Array2::from_shape_fn((5, 3), |(i, j)| if i % 3 == j { 1.0 } else { 0.0 });

        let out = head.forward(&weight, &bias, &features, &labels);
        let (grad_features, grad_weight, grad_bias) =
            head.backward(&weight, &bias, &features, &out.scores, &labels);

        assert_eq!(grad_features.shape(), &[5, 4]);
        assert_eq!(grad_weight.shape(), &[4, 3]);
        assert_eq!(grad_bias.len(), 3);
    }
}
