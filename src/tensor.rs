//! 张量操作扩展和初始化工具
//!
//! 基于 ndarray 实现卷积分类器所需的张量操作。

use ndarray::{Array, Array2, Axis, Dimension, ShapeBuilder};
use rand::Rng;
use rand_distr::{Distribution, StandardNormal};

/// 张量扩展 trait
pub trait TensorExt {
    /// 矩阵乘法
    fn matmul(&self, other: &Array2<f32>) -> Array2<f32>;

    /// 沿指定维度做 softmax（先减最大值）
    fn softmax(&self, axis: usize) -> Array2<f32>;

    /// 每行的 log-sum-exp（先减最大值）
    fn log_sum_exp_rows(&self) -> Vec<f32>;

    /// 每行最大值的下标，相同时取最小下标
    fn argmax_rows(&self) -> Vec<usize>;
}

impl TensorExt for Array2<f32> {
    fn matmul(&self, other: &Array2<f32>) -> Array2<f32> {
        self.dot(other)
    }

    fn softmax(&self, axis: usize) -> Array2<f32> {
        // 减去最大值以提高数值稳定性
        let max = self.fold_axis(Axis(axis), f32::NEG_INFINITY, |a, &b| a.max(b));
        let max_view = max.insert_axis(Axis(axis));

        let exp = (self - &max_view).mapv(|x: f32| x.exp());
        let sum = exp.sum_axis(Axis(axis));
        let sum_view = sum.insert_axis(Axis(axis));

        exp / sum_view
    }

    fn log_sum_exp_rows(&self) -> Vec<f32> {
        self.rows()
            .into_iter()
            .map(|row| {
                let max = row.fold(f32::NEG_INFINITY, |a, &b| a.max(b));
                let sum: f32 = row.iter().map(|&x| (x - max).exp()).sum();
                max + sum.ln()
            })
            .collect()
    }

    fn argmax_rows(&self) -> Vec<usize> {
        self.rows()
            .into_iter()
            .map(|row| {
                let mut best = 0;
                for (j, &value) in row.iter().enumerate() {
                    // 严格大于：相同的最大值保留最先出现的下标
                    if value > row[best] {
                        best = j;
                    }
                }
                best
            })
            .collect()
    }
}

/// 均匀分布初始化 `[low, high)`
pub fn random_uniform<Sh, D, R>(shape: Sh, low: f32, high: f32, rng: &mut R) -> Array<f32, D>
where
    Sh: ShapeBuilder<Dim = D>,
    D: Dimension,
    R: Rng,
{
    Array::from_shape_simple_fn(shape, || rng.gen_range(low..high))
}

/// 截断正态分布初始化：超出两倍标准差的样本重新采样
pub fn truncated_normal<Sh, D, R>(shape: Sh, stddev: f32, rng: &mut R) -> Array<f32, D>
where
    Sh: ShapeBuilder<Dim = D>,
    D: Dimension,
    R: Rng,
{
    Array::from_shape_simple_fn(shape, || loop {
        let z: f32 = StandardNormal.sample(&mut *rng);
        if z.abs() <= 2.0 {
            break z * stddev;
        }
    })
}

/// Xavier（Glorot）均匀初始化
pub fn glorot_uniform<R: Rng>(shape: (usize, usize), rng: &mut R) -> Array2<f32> {
    let limit = (6.0 / (shape.0 + shape.1) as f32).sqrt();
    random_uniform(shape, -limit, limit, rng)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::{arr2, Array4};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_matmul() {
        let a = Array2::from_shape_vec((2, 3), vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();
        let b = Array2::from_shape_vec((3, 2), vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();
        let c = a.matmul(&b);

        assert_eq!(c.shape(), &[2, 2]);
        assert_abs_diff_eq!(c[[0, 0]], 22.0, epsilon = 1e-6);
    }

    #[test]
    fn test_softmax_is_stable() {
        let x = arr2(&[[1000.0f32, 1001.0, 1002.0]]);
        let s = x.softmax(1);

        let sum: f32 = s.iter().sum();
        assert_abs_diff_eq!(sum, 1.0, epsilon = 1e-6);
        assert!(s.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_log_sum_exp() {
        let x = arr2(&[[0.0f32, 0.0], [1000.0, 1000.0]]);
        let lse = x.log_sum_exp_rows();
        assert_abs_diff_eq!(lse[0], 2.0f32.ln(), epsilon = 1e-6);
        assert_abs_diff_eq!(lse[1], 1000.0 + 2.0f32.ln(), epsilon = 1e-3);
    }

    #[test]
    fn test_argmax_ties_pick_lowest_index() {
        let x = arr2(&[[0.5f32, 0.5, 0.1], [0.1, 0.3, 0.3], [2.0, 1.0, 3.0]]);
        assert_eq!(x.argmax_rows(), vec![0, 1, 2]);
    }

    #[test]
    fn test_initializers() {
        let mut rng = StdRng::seed_from_u64(7);

        let u: Array2<f32> = random_uniform((10, 4), -1.0, 1.0, &mut rng);
        assert!(u.iter().all(|&v| (-1.0..1.0).contains(&v)));

        let t: Array4<f32> = truncated_normal((3, 4, 1, 2), 0.1, &mut rng);
        assert_eq!(t.shape(), &[3, 4, 1, 2]);
        assert!(t.iter().all(|&v| v.abs() <= 0.2));

        let g = glorot_uniform((6, 2), &mut rng);
        let limit = (6.0f32 / 8.0).sqrt();
        assert!(g.iter().all(|&v| v.abs() <= limit));
    }
}
