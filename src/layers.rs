//! 特征拼接和 Dropout
//!
//! 这两层都没有可训练参数。

use crate::error::{Result, TextCnnError};
use crate::execution::Placement;
use ndarray::{concatenate, s, Array2, Array4, ArrayView2, Axis};
use rand::Rng;

/// 特征拼接层
///
/// 将各卷积核组的 [B, 1, 1, F] 输出沿卷积核维度拼接，再展平为 [B, F * n]。
/// 拼接顺序就是 filter_sizes 的声明顺序，输出层权重按同样的顺序排列。
#[derive(Debug, Clone)]
pub struct FeatureConcat {
    num_banks: usize,
    num_filters: usize,
}

impl FeatureConcat {
    pub fn new(num_banks: usize, num_filters: usize) -> Self {
        Self {
            num_banks,
            num_filters,
        }
    }

    /// 拼接后的特征数
    pub fn num_features(&self) -> usize {
        self.num_banks * self.num_filters
    }

    /// 前向传播
    pub fn forward(&self, pooled: &[Array4<f32>]) -> Result<Array2<f32>> {
        if pooled.len() != self.num_banks {
            return Err(TextCnnError::shape(
                "pooled outputs",
                &[self.num_banks],
                &[pooled.len()],
            ));
        }
        let batch_size = pooled.first().map(|p| p.len_of(Axis(0))).unwrap_or(0);
        for p in pooled {
            let expected = [batch_size, 1, 1, self.num_filters];
            if p.shape() != expected {
                return Err(TextCnnError::shape("pooled output", &expected, p.shape()));
            }
        }

        let views: Vec<_> = pooled.iter().map(|p| p.view()).collect();
        let joined = concatenate(Axis(3), &views)
            .map_err(|e| TextCnnError::InvalidConfig(format!("concatenate failed: {}", e)))?;

        joined
            .into_shape((batch_size, self.num_features()))
            .map_err(|_| {
                TextCnnError::shape(
                    "flattened features",
                    &[batch_size, self.num_features()],
                    &[batch_size, 1, 1, self.num_features()],
                )
            })
    }

    /// 反向传播：按拼接顺序切回每个卷积核组的梯度 [B, F]
    pub fn backward<'a>(&self, grad: &'a Array2<f32>) -> Vec<ArrayView2<'a, f32>> {
        (0..self.num_banks)
            .map(|i| grad.slice(s![.., i * self.num_filters..(i + 1) * self.num_filters]))
            .collect()
    }
}

impl Placement for FeatureConcat {
    fn component_name(&self) -> String {
        "concat".to_string()
    }
}

/// Dropout 层（inverted dropout）
///
/// 训练时每个特征以 `1 - keep_prob` 的概率置零，保留的特征除以 `keep_prob`，
/// 使激活的期望不变。`keep_prob == 1` 时为恒等映射，不消耗随机数。
#[derive(Debug, Clone, Copy)]
pub struct Dropout {
    keep_prob: f32,
}

impl Dropout {
    /// `keep_prob` 必须在 (0, 1] 内
    pub fn new(keep_prob: f32) -> Result<Self> {
        if !(keep_prob > 0.0 && keep_prob <= 1.0) {
            return Err(TextCnnError::InvalidKeepProb(keep_prob));
        }
        Ok(Self { keep_prob })
    }

    pub fn keep_prob(&self) -> f32 {
        self.keep_prob
    }

    /// 是否为恒等映射
    pub fn is_identity(&self) -> bool {
        self.keep_prob >= 1.0
    }

    /// 前向传播
    ///
    /// 返回输出和掩码（掩码元素为 0 或 1/keep_prob；恒等映射时为 None）。
    pub fn forward<R: Rng>(&self, x: &Array2<f32>, rng: &mut R) -> (Array2<f32>, Option<Array2<f32>>) {
        if self.is_identity() {
            return (x.clone(), None);
        }

        let scale = 1.0 / self.keep_prob;
        let mask = Array2::from_shape_simple_fn(x.dim(), || {
            if rng.gen::<f32>() < self.keep_prob {
                scale
            } else {
                0.0
            }
        });

        (x * &mask, Some(mask))
    }

    /// 反向传播
    pub fn backward(&self, grad: &Array2<f32>, mask: Option<&Array2<f32>>) -> Array2<f32> {
        match mask {
            Some(mask) => grad * mask,
            None => grad.clone(),
        }
    }
}

impl Placement for Dropout {
    fn component_name(&self) -> String {
        "dropout".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_concat_order() {
        let concat = FeatureConcat::new(2, 3);
        let a = Array4::from_shape_vec((2, 1, 1, 3), vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();
        let b = Array4::from_shape_vec((2, 1, 1, 3), vec![7.0, 8.0, 9.0, 10.0, 11.0, 12.0]).unwrap();

        let features = concat.forward(&[a, b]).unwrap();
        assert_eq!(features.shape(), &[2, 6]);
        assert_eq!(features.row(0).to_vec(), vec![1.0, 2.0, 3.0, 7.0, 8.0, 9.0]);
        assert_eq!(features.row(1).to_vec(), vec![4.0, 5.0, 6.0, 10.0, 11.0, 12.0]);

        let parts = concat.backward(&features);
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[1].row(0).to_vec(), vec![7.0, 8.0, 9.0]);
    }

    #[test]
    fn test_concat_rejects_wrong_count() {
        let concat = FeatureConcat::new(2, 3);
        let a = Array4::zeros((1, 1, 1, 3));
        assert!(concat.forward(&[a]).is_err());
    }

    #[test]
    fn test_dropout_identity() {
        let dropout = Dropout::new(1.0).unwrap();
        let x = Array2::from_shape_fn((4, 5), |(i, j)| (i as f32 - 2.0) * (j as f32 + 0.5));

        let mut rng = StdRng::seed_from_u64(0);
        let (y, mask) = dropout.forward(&x, &mut rng);
        assert_eq!(y, x);
        assert!(mask.is_none());
        assert_eq!(dropout.backward(&x, None), x);
    }

    #[test]
    fn test_dropout_scales_survivors() {
        let dropout = Dropout::new(0.5).unwrap();
        let x = Array2::ones((50, 40));

        let mut rng = StdRng::seed_from_u64(42);
        let (y, mask) = dropout.forward(&x, &mut rng);
        let mask = mask.unwrap();

        assert!(y.iter().all(|&v| v == 0.0 || v == 2.0));
        assert_eq!(y, mask);

        // 期望保持不变
        let mean = y.mean().unwrap();
        assert_abs_diff_eq!(mean, 1.0, epsilon = 0.1);

        let grad = dropout.backward(&x, Some(&mask));
        assert_eq!(grad, mask);
    }

    #[test]
    fn test_dropout_is_seeded() {
        let dropout = Dropout::new(0.7).unwrap();
        let x = Array2::ones((3, 8));
        let (a, _) = dropout.forward(&x, &mut StdRng::seed_from_u64(9));
        let (b, _) = dropout.forward(&x, &mut StdRng::seed_from_u64(9));
        assert_eq!(a, b);
    }

    #[test]
    fn test_invalid_keep_prob() {
        assert!(Dropout::new(0.0).is_err());
        assert!(Dropout::new(-0.5).is_err());
        assert!(Dropout::new(1.01).is_err());
        assert!(Dropout::new(f32::NAN).is_err());
    }
}
