//! 训练器
//!
//! 训练循环是一个严格顺序的状态机：
//!
//! ```text
//! Init → Running → (Evaluating) → (Checkpointing) → Running → … → Done
//! ```
//!
//! 评估和保存检查点只在两个训练步之间进行，不会与参数更新重叠。
//! 停止请求同样只在步与步之间检查。

use crate::checkpoint::CheckpointManager;
use crate::config::TrainerConfig;
use crate::data::Batch;
use crate::error::{Result, TextCnnError};
use crate::metrics::MetricsSink;
use crate::model::{Evaluation, TextCnn};
use crate::optimizer::Optimizer;
use crate::state::{step_rng, TrainingState};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

/// 训练循环所处的阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Init,
    Running,
    Evaluating,
    Checkpointing,
    Done,
}

/// 某一步的损失和准确率
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepMetrics {
    pub step: u64,
    pub loss: f32,
    pub accuracy: f32,
}

/// 一次训练运行的总结
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrainingSummary {
    /// 结束时的步数
    pub final_step: u64,
    /// 最后一个训练 batch 的指标
    pub last_train: Option<StepMetrics>,
    /// 最后一次验证的指标
    pub last_dev: Option<StepMetrics>,
    /// 本次运行写入的检查点
    pub checkpoints: Vec<PathBuf>,
    /// 损失非有限的步数
    pub nonfinite_steps: u64,
    /// 是否因停止请求提前结束
    pub stopped_early: bool,
}

/// 训练器
pub struct Trainer {
    model: TextCnn,
    config: TrainerConfig,
    run_id: String,
    manager: Option<CheckpointManager>,
    last_checkpoint: Option<u64>,
    stop: Arc<AtomicBool>,
    phase: Phase,
}

impl Trainer {
    /// 创建训练器
    ///
    /// 输出层 L2 系数取自训练配置。
    pub fn new(model: TextCnn, config: TrainerConfig) -> Result<Self> {
        config.validate()?;
        let run_id = config.run_id.clone().unwrap_or_else(timestamp_run_id);
        let model = model.with_l2_reg_lambda(config.l2_reg_lambda);

        Ok(Self {
            model,
            config,
            run_id,
            manager: None,
            last_checkpoint: None,
            stop: Arc::new(AtomicBool::new(false)),
            phase: Phase::Init,
        })
    }

    pub fn model(&self) -> &TextCnn {
        &self.model
    }

    pub fn config(&self) -> &TrainerConfig {
        &self.config
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// 本次运行的目录 `<out_dir>/runs/<run_id>`
    pub fn run_dir(&self) -> PathBuf {
        self.config.out_dir.join("runs").join(&self.run_id)
    }

    /// 检查点目录
    pub fn checkpoint_dir(&self) -> PathBuf {
        self.run_dir().join("checkpoints")
    }

    /// 停止标志，置位后训练在当前步结束后停止
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    /// 构建或恢复训练状态
    ///
    /// `resume` 时恢复最新检查点；找不到检查点时从头开始。
    /// 检查点损坏或不匹配时，只有 `allow_fresh_start` 才回退到重新初始化。
    pub fn init_state(&mut self) -> Result<TrainingState> {
        self.phase = Phase::Init;

        if self.config.resume {
            match self.restore_latest() {
                Ok(Some(mut state)) => {
                    self.last_checkpoint = Some(state.step());
                    let restored_lr = state.optimizer().lr();
                    if restored_lr != self.config.learning_rate {
                        info!(
                            restored = restored_lr,
                            configured = self.config.learning_rate,
                            "using configured learning rate instead of the checkpointed one"
                        );
                        state.set_learning_rate(self.config.learning_rate);
                    }
                    return Ok(state);
                }
                Ok(None) => info!(dir = %self.checkpoint_dir().display(), "no checkpoint found, starting fresh"),
                Err(e) if self.config.allow_fresh_start && e.is_persistence() => {
                    warn!(error = %e, "could not restore checkpoint, starting fresh")
                }
                Err(e) => return Err(e),
            }
        }

        let state = TrainingState::fresh(&self.model, self.config.learning_rate, self.config.seed);
        info!(
            run_id = %self.run_id,
            params = state.params().param_count(),
            "initialized fresh training state"
        );
        Ok(state)
    }

    fn restore_latest(&self) -> Result<Option<TrainingState>> {
        match CheckpointManager::find_latest(self.checkpoint_dir())? {
            Some(path) => CheckpointManager::restore(path, self.model.config()).map(Some),
            None => Ok(None),
        }
    }

    /// 在验证集上评估（keep_prob = 1，不更新参数）
    pub fn evaluate(&self, state: &TrainingState, dev: &Batch) -> Result<Evaluation> {
        self.model
            .evaluate_chunked(state.params(), dev, self.config.eval_batch_size)
    }

    /// 运行训练循环直到 batch 耗尽或收到停止请求
    ///
    /// 配置错误和形状错误直接返回；检查点写入失败按配置重试或跳过。
    pub fn run<I>(
        &mut self,
        state: &mut TrainingState,
        batches: I,
        dev: Option<&Batch>,
        sink: &mut dyn MetricsSink,
    ) -> Result<TrainingSummary>
    where
        I: IntoIterator<Item = Batch>,
    {
        let mut summary = TrainingSummary::default();
        let start = Instant::now();
        let start_step = state.step();

        for batch in batches {
            if self.stop.load(Ordering::SeqCst) {
                info!(step = state.step(), "stop requested");
                summary.stopped_early = true;
                break;
            }

            self.phase = Phase::Running;
            let mut rng = step_rng(self.config.seed, state.step());
            let out = state.train_step(&self.model, &batch, self.config.dropout_keep_prob, &mut rng)?;
            let step = out.step;

            sink.record("train/loss", out.loss, step);
            sink.record("train/accuracy", out.accuracy, step);
            debug!(step, loss = out.loss, acc = out.accuracy, "train step");
            summary.last_train = Some(StepMetrics {
                step,
                loss: out.loss,
                accuracy: out.accuracy,
            });

            if !out.loss.is_finite() || !out.grads_finite {
                summary.nonfinite_steps += 1;
                sink.record("nonfinite_loss", 1.0, step);
                warn!(step, loss = out.loss, "non-finite loss or gradient");
            }

            if let Some(dev) = dev {
                if self.config.evaluate_every > 0 && step % self.config.evaluate_every == 0 {
                    self.phase = Phase::Evaluating;
                    summary.last_dev = Some(self.evaluate_and_record(state, dev, sink)?);
                }
            }

            if self.config.checkpoint_every > 0 && step % self.config.checkpoint_every == 0 {
                self.phase = Phase::Checkpointing;
                self.checkpoint(state, &mut summary, sink)?;
            }
        }

        if state.step() > 0 && self.last_checkpoint != Some(state.step()) {
            self.phase = Phase::Checkpointing;
            self.checkpoint(state, &mut summary, sink)?;
        }

        self.phase = Phase::Done;
        summary.final_step = state.step();

        let elapsed = start.elapsed().as_secs_f32();
        info!(
            steps = state.step() - start_step,
            final_step = state.step(),
            elapsed_secs = elapsed,
            stopped_early = summary.stopped_early,
            "training finished"
        );
        Ok(summary)
    }

    fn evaluate_and_record(
        &self,
        state: &TrainingState,
        dev: &Batch,
        sink: &mut dyn MetricsSink,
    ) -> Result<StepMetrics> {
        let eval = self.evaluate(state, dev)?;
        let step = state.step();
        sink.record("dev/loss", eval.loss, step);
        sink.record("dev/accuracy", eval.accuracy, step);
        info!(step, loss = eval.loss, acc = eval.accuracy, "evaluation");

        Ok(StepMetrics {
            step,
            loss: eval.loss,
            accuracy: eval.accuracy,
        })
    }

    fn try_save(&mut self, state: &TrainingState) -> Result<PathBuf> {
        let mut manager = match self.manager.take() {
            Some(manager) => manager,
            None => CheckpointManager::new(self.checkpoint_dir(), self.config.num_checkpoints)?,
        };
        let result = manager.save(self.model.config(), state);
        self.manager = Some(manager);
        result
    }

    /// 保存检查点，失败时重试；重试耗尽后按配置终止或跳过
    fn checkpoint(
        &mut self,
        state: &TrainingState,
        summary: &mut TrainingSummary,
        sink: &mut dyn MetricsSink,
    ) -> Result<()> {
        let step = state.step();
        let attempts = self.config.checkpoint_retries + 1;
        let mut failure = None;

        for attempt in 1..=attempts {
            match self.try_save(state) {
                Ok(path) => {
                    self.last_checkpoint = Some(step);
                    summary.checkpoints.push(path);
                    return Ok(());
                }
                // 同一位置重试不会成功
                Err(e @ TextCnnError::CheckpointExists(_)) => {
                    warn!(step, error = %e, "checkpoint location already used");
                    failure = Some(e);
                    break;
                }
                Err(e) => {
                    warn!(step, attempt, attempts, error = %e, "checkpoint write failed");
                    failure = Some(e);
                }
            }
        }

        sink.record("checkpoint_failed", 1.0, step);
        match failure {
            Some(e) if self.config.abort_on_checkpoint_error => Err(e),
            _ => {
                warn!(step, "skipping checkpoint, training continues");
                Ok(())
            }
        }
    }
}

/// `<UNIX 秒>-<微秒>-<随机后缀>`，同一秒内启动的运行不会共用目录
fn timestamp_run_id() -> String {
    let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default();
    format!(
        "{}-{:06}-{:04x}",
        now.as_secs(),
        now.subsec_micros(),
        rand::random::<u16>()
    )
}
