//! 优化器
//!
//! Adam：一阶、二阶矩的滑动平均，带偏差修正，固定学习率。
//!
//! 参数在构建时显式登记（名称 + 形状 + 矩估计），之后每一步都按登记顺序更新，
//! 不会隐式发现新参数。

use crate::checkpoint::SerializableArray;
use crate::error::{Result, TextCnnError};
use crate::params::{GradRef, Gradients, Parameters};
use ndarray::{ArrayD, Axis, Zip};
use serde::{Deserialize, Serialize};

/// 优化器 trait
pub trait Optimizer {
    /// 用一组梯度更新全部参数
    ///
    /// 梯度与登记的参数不一致时返回错误，且不修改任何参数。
    fn step(&mut self, params: &mut Parameters, grads: &Gradients) -> Result<()>;

    /// 获取当前学习率
    fn lr(&self) -> f32;

    /// 设置学习率
    fn set_lr(&mut self, lr: f32);

    /// 优化器名称
    fn name(&self) -> &str;
}

/// 一个登记的参数槽
#[derive(Debug, Clone, PartialEq)]
pub struct AdamSlot {
    /// 参数名
    pub name: String,
    /// 一阶矩估计
    pub m: ArrayD<f32>,
    /// 二阶矩估计
    pub v: ArrayD<f32>,
}

/// Adam 优化器
///
/// ```text
/// m = β1 * m + (1 - β1) * grad
/// v = β2 * v + (1 - β2) * grad²
/// m_hat = m / (1 - β1^t)
/// v_hat = v / (1 - β2^t)
/// param = param - lr * m_hat / (√v_hat + ε)
/// ```
///
/// 嵌入矩阵的梯度是稀疏的：所有行的矩估计照常衰减，只有出现过的行加上梯度项。
#[derive(Debug, Clone, PartialEq)]
pub struct Adam {
    /// 学习率
    lr: f32,
    /// β1：一阶矩估计的指数衰减率
    beta1: f32,
    /// β2：二阶矩估计的指数衰减率
    beta2: f32,
    /// ε：数值稳定性常数
    eps: f32,
    /// 时间步
    timestep: u64,
    /// 登记的参数
    slots: Vec<AdamSlot>,
}

impl Adam {
    /// 按参数的枚举顺序登记所有参数
    pub fn new(lr: f32, params: &Parameters) -> Self {
        let slots = params
            .names()
            .into_iter()
            .zip(params.tensors())
            .map(|(name, tensor)| AdamSlot {
                name,
                m: ArrayD::zeros(tensor.raw_dim()),
                v: ArrayD::zeros(tensor.raw_dim()),
            })
            .collect();

        Self {
            lr,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
            timestep: 0,
            slots,
        }
    }

    pub fn with_betas(mut self, beta1: f32, beta2: f32) -> Self {
        self.beta1 = beta1;
        self.beta2 = beta2;
        self
    }

    pub fn with_eps(mut self, eps: f32) -> Self {
        self.eps = eps;
        self
    }

    /// 已执行的更新次数
    pub fn timestep(&self) -> u64 {
        self.timestep
    }

    pub fn slots(&self) -> &[AdamSlot] {
        &self.slots
    }

    /// 检查梯度与登记的参数一致（名称、数量、形状、稀疏行号）
    fn validate(&self, params: &Parameters, grads: &[GradRef<'_>]) -> Result<()> {
        let names = params.names();
        if names.len() != self.slots.len() || grads.len() != self.slots.len() {
            return Err(TextCnnError::GradientMismatch {
                name: "*".to_string(),
                reason: format!(
                    "{} slots registered, got {} parameters and {} gradients",
                    self.slots.len(),
                    names.len(),
                    grads.len()
                ),
            });
        }

        for ((slot, name), grad) in self.slots.iter().zip(&names).zip(grads) {
            if &slot.name != name {
                return Err(TextCnnError::GradientMismatch {
                    name: name.clone(),
                    reason: format!("registered as `{}`", slot.name),
                });
            }
            let shape = grad.shape();
            if slot.m.shape() != shape.as_slice() {
                return Err(TextCnnError::GradientMismatch {
                    name: name.clone(),
                    reason: format!("expected shape {:?}, got {:?}", slot.m.shape(), shape),
                });
            }
            if let GradRef::Sparse(rows) = grad {
                if rows.values.nrows() != rows.indices.len() {
                    return Err(TextCnnError::GradientMismatch {
                        name: name.clone(),
                        reason: "sparse values and indices differ in length".to_string(),
                    });
                }
                if let Some(&bad) = rows.indices.iter().find(|&&i| i >= rows.dense_shape.0) {
                    return Err(TextCnnError::GradientMismatch {
                        name: name.clone(),
                        reason: format!("row index {} out of range", bad),
                    });
                }
            }
        }
        Ok(())
    }

    /// 导出可序列化的状态
    pub fn state(&self) -> AdamState {
        AdamState {
            learning_rate: self.lr,
            beta1: self.beta1,
            beta2: self.beta2,
            eps: self.eps,
            timestep: self.timestep,
            names: self.slots.iter().map(|s| s.name.clone()).collect(),
            moments: self.slots.iter().map(|s| SerializableArray::from_array(&s.m)).collect(),
            variances: self.slots.iter().map(|s| SerializableArray::from_array(&s.v)).collect(),
        }
    }

    /// 从保存的状态恢复，并校验与参数一致
    pub fn from_state(state: AdamState, params: &Parameters) -> Result<Self> {
        let names = params.names();
        let tensors = params.tensors();
        if state.names != names
            || state.moments.len() != names.len()
            || state.variances.len() != names.len()
        {
            return Err(TextCnnError::GradientMismatch {
                name: "*".to_string(),
                reason: "optimizer state does not match parameter list".to_string(),
            });
        }

        let mut slots = Vec::with_capacity(names.len());
        for (((name, m), v), tensor) in names
            .into_iter()
            .zip(state.moments)
            .zip(state.variances)
            .zip(tensors)
        {
            let m = m.to_array()?;
            let v = v.to_array()?;
            if m.shape() != tensor.shape() || v.shape() != tensor.shape() {
                return Err(TextCnnError::shape(format!("adam slot {}", name), tensor.shape(), m.shape()));
            }
            slots.push(AdamSlot { name, m, v });
        }

        Ok(Self {
            lr: state.learning_rate,
            beta1: state.beta1,
            beta2: state.beta2,
            eps: state.eps,
            timestep: state.timestep,
            slots,
        })
    }
}

impl Optimizer for Adam {
    fn step(&mut self, params: &mut Parameters, grads: &Gradients) -> Result<()> {
        let entries = grads.entries();
        self.validate(params, &entries)?;

        self.timestep += 1;
        let t = self.timestep.min(i32::MAX as u64) as i32;
        let bias1 = 1.0 - self.beta1.powi(t);
        let bias2 = 1.0 - self.beta2.powi(t);
        let (beta1, beta2, eps, lr) = (self.beta1, self.beta2, self.eps, self.lr);

        for ((slot, mut param), grad) in self.slots.iter_mut().zip(params.tensors_mut()).zip(entries) {
            match grad {
                GradRef::Dense(grad) => {
                    Zip::from(&mut slot.m).and(&mut slot.v).and(&grad).for_each(|m, v, &g| {
                        *m = beta1 * *m + (1.0 - beta1) * g;
                        *v = beta2 * *v + (1.0 - beta2) * g * g;
                    });
                }
                GradRef::Sparse(rows) => {
                    slot.m.mapv_inplace(|m| beta1 * m);
                    slot.v.mapv_inplace(|v| beta2 * v);
                    for (k, &row) in rows.indices.iter().enumerate() {
                        let g = rows.values.row(k).into_dyn();
                        let mut m_row = slot.m.index_axis_mut(Axis(0), row);
                        Zip::from(&mut m_row).and(&g).for_each(|m, &g| *m += (1.0 - beta1) * g);
                        let mut v_row = slot.v.index_axis_mut(Axis(0), row);
                        Zip::from(&mut v_row).and(&g).for_each(|v, &g| *v += (1.0 - beta2) * g * g);
                    }
                }
            }

            // 参数更新
            Zip::from(&mut param).and(&slot.m).and(&slot.v).for_each(|p, &m, &v| {
                let m_hat = m / bias1;
                let v_hat = v / bias2;
                *p -= lr * m_hat / (v_hat.sqrt() + eps);
            });
        }

        Ok(())
    }

    fn lr(&self) -> f32 {
        self.lr
    }

    fn set_lr(&mut self, lr: f32) {
        self.lr = lr;
    }

    fn name(&self) -> &str {
        "Adam"
    }
}

/// 优化器状态（Adam），随检查点保存
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdamState {
    /// 学习率
    pub learning_rate: f32,
    pub beta1: f32,
    pub beta2: f32,
    pub eps: f32,
    /// 时间步
    pub timestep: u64,
    /// 参数名（登记顺序）
    pub names: Vec<String>,
    /// 一阶矩估计（m）
    pub moments: Vec<SerializableArray>,
    /// 二阶矩估计（v）
    pub variances: Vec<SerializableArray>,
}
