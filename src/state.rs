//! 训练状态
//!
//! [`TrainingState`] 持有步数计数器、参数和优化器状态。一次训练步要么完整提交，
//! 要么不留下任何痕迹：所有梯度先算完并校验，之后才修改参数和步数。

use crate::classifier::HeadOutput;
use crate::data::Batch;
use crate::error::Result;
use crate::model::TextCnn;
use crate::optimizer::{Adam, Optimizer};
use crate::params::Parameters;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// 一次训练步的结果
#[derive(Debug, Clone)]
pub struct StepOutput {
    /// 提交后的步数
    pub step: u64,
    /// batch 损失（更新前的参数）
    pub loss: f32,
    /// batch 准确率（更新前的参数）
    pub accuracy: f32,
    /// 梯度是否全部有限
    pub grads_finite: bool,
}

/// 训练状态
#[derive(Debug, Clone, PartialEq)]
pub struct TrainingState {
    step: u64,
    params: Parameters,
    optimizer: Adam,
}

impl TrainingState {
    /// 随机初始化的新状态，步数为 0
    pub fn fresh(model: &TextCnn, learning_rate: f32, seed: u64) -> Self {
        let params = model.init_parameters(&mut StdRng::seed_from_u64(seed));
        let optimizer = Adam::new(learning_rate, &params);
        Self {
            step: 0,
            params,
            optimizer,
        }
    }

    pub(crate) fn from_parts(step: u64, params: Parameters, optimizer: Adam) -> Self {
        Self {
            step,
            params,
            optimizer,
        }
    }

    /// 已提交的训练步数
    pub fn step(&self) -> u64 {
        self.step
    }

    pub fn params(&self) -> &Parameters {
        &self.params
    }

    pub fn optimizer(&self) -> &Adam {
        &self.optimizer
    }

    /// 修改之后各步使用的学习率（矩估计和步数不变）
    pub fn set_learning_rate(&mut self, learning_rate: f32) {
        self.optimizer.set_lr(learning_rate);
    }

    /// 执行一次训练步：前向、反向、优化器更新
    ///
    /// 出错时参数、优化器和步数都保持不变。
    pub fn train_step<R: Rng>(
        &mut self,
        model: &TextCnn,
        batch: &Batch,
        keep_prob: f32,
        rng: &mut R,
    ) -> Result<StepOutput> {
        let (HeadOutput { loss, accuracy, .. }, cache) = model.forward(&self.params, batch, keep_prob, rng)?;
        let grads = model.backward(&self.params, batch, &cache)?;
        let grads_finite = grads.entries().iter().all(|g| g.is_finite());

        self.optimizer.step(&mut self.params, &grads)?;
        self.step += 1;

        Ok(StepOutput {
            step: self.step,
            loss,
            accuracy,
            grads_finite,
        })
    }
}

/// 第 `step` 步的 dropout 随机数生成器
///
/// 只由 (seed, step) 决定，从检查点恢复后抽到的掩码与不中断的训练一致。
pub fn step_rng(seed: u64, step: u64) -> StdRng {
    StdRng::seed_from_u64(seed ^ step.wrapping_add(1).wrapping_mul(0x9E37_79B9_7F4A_7C15))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModelConfig;
    use crate::data::one_hot;
    use crate::execution::ExecutionContext;
    use ndarray::arr2;
    use rand::RngCore;

    fn model() -> TextCnn {
        let config = ModelConfig::new(4, 2, 8)
            .with_embedding_size(3)
            .with_filter_sizes(vec![1, 2])
            .with_num_filters(3);
        TextCnn::new(config, &ExecutionContext::cpu()).unwrap()
    }

    #[test]
    fn test_step_increments_by_one() {
        let model = model();
        let mut state = TrainingState::fresh(&model, 1e-3, 10);
        let batch = Batch::new(arr2(&[[1, 2, 3, 0], [4, 5, 0, 0]]), one_hot(&[0, 1], 2));

        for expected in 1..=3 {
            let out = state
                .train_step(&model, &batch, 0.5, &mut step_rng(10, state.step()))
                .unwrap();
            assert_eq!(out.step, expected);
            assert_eq!(state.step(), expected);
            assert_eq!(state.optimizer().timestep(), expected);
            assert!(out.grads_finite);
        }
    }

    #[test]
    fn test_failed_step_is_not_observed() {
        let model = model();
        let mut state = TrainingState::fresh(&model, 1e-3, 10);
        let before = state.clone();

        let bad = Batch::new(arr2(&[[1, 2, 3, 9]]), one_hot(&[0], 2));
        assert!(state.train_step(&model, &bad, 0.5, &mut step_rng(0, 0)).is_err());
        assert_eq!(state, before);

        let wrong_width = Batch::new(arr2(&[[1, 2, 3]]), one_hot(&[0], 2));
        assert!(state.train_step(&model, &wrong_width, 0.5, &mut step_rng(0, 0)).is_err());
        assert_eq!(state, before);
    }

    #[test]
    fn test_fresh_is_seeded() {
        let model = model();
        assert_eq!(TrainingState::fresh(&model, 1e-3, 1), TrainingState::fresh(&model, 1e-3, 1));
        assert_ne!(TrainingState::fresh(&model, 1e-3, 1), TrainingState::fresh(&model, 1e-3, 2));
    }

    #[test]
    fn test_set_learning_rate_keeps_moments() {
        let model = model();
        let mut state = TrainingState::fresh(&model, 1e-3, 10);
        let batch = Batch::new(arr2(&[[1, 2, 3, 0]]), one_hot(&[1], 2));
        state.train_step(&model, &batch, 1.0, &mut step_rng(10, 0)).unwrap();
        let slots = state.optimizer().slots().to_vec();

        state.set_learning_rate(5e-2);
        assert_eq!(state.optimizer().lr(), 5e-2);
        assert_eq!(state.optimizer().timestep(), 1);
        assert_eq!(state.optimizer().slots(), &slots[..]);
        assert_eq!(state.step(), 1);
    }

    #[test]
    fn test_step_rng() {
        assert_eq!(step_rng(3, 7).next_u64(), step_rng(3, 7).next_u64());
        assert_ne!(step_rng(3, 7).next_u64(), step_rng(3, 8).next_u64());
    }
}
