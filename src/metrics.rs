//! 训练观测和评估指标
//!
//! 训练循环把标量观测（损失、准确率等）推送给 [`MetricsSink`]，
//! 如何展示或保存由接收方决定。

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::info;

/// 标量观测的接收方
pub trait MetricsSink {
    /// 记录第 `step` 步名为 `name` 的观测值
    fn record(&mut self, name: &str, value: f32, step: u64);
}

/// 丢弃所有观测
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl MetricsSink for NullSink {
    fn record(&mut self, _name: &str, _value: f32, _step: u64) {}
}

/// 以结构化日志输出观测
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl MetricsSink for TracingSink {
    fn record(&mut self, name: &str, value: f32, step: u64) {
        info!(target: "text_cnn::metrics", metric = name, value, step);
    }
}

/// 一个观测点
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub step: u64,
    pub value: f32,
}

/// 训练历史记录
///
/// 每个名称一条按记录顺序排列的序列。
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsHistory {
    series: BTreeMap<String, Vec<Observation>>,
}

impl MetricsHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// 某个名称的全部观测
    pub fn series(&self, name: &str) -> &[Observation] {
        self.series.get(name).map(Vec::as_slice).unwrap_or(&[])
    }

    /// 已记录的名称
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.series.keys().map(String::as_str)
    }

    /// 最近一次观测
    pub fn last(&self, name: &str) -> Option<Observation> {
        self.series(name).last().copied()
    }

    /// 最大值（准确率一类越大越好的指标）
    pub fn best_max(&self, name: &str) -> Option<Observation> {
        self.series(name)
            .iter()
            .copied()
            .filter(|o| o.value.is_finite())
            .fold(None, |best: Option<Observation>, o| match best {
                Some(b) if b.value >= o.value => Some(b),
                _ => Some(o),
            })
    }

    /// 最小值（损失一类越小越好的指标）
    pub fn best_min(&self, name: &str) -> Option<Observation> {
        self.series(name)
            .iter()
            .copied()
            .filter(|o| o.value.is_finite())
            .fold(None, |best: Option<Observation>, o| match best {
                Some(b) if b.value <= o.value => Some(b),
                _ => Some(o),
            })
    }

    /// 保存训练历史
    pub fn save<P: AsRef<Path>>(&self, path: P) -> crate::Result<()> {
        crate::config::save_json(self, path)
    }

    /// 加载训练历史
    pub fn load<P: AsRef<Path>>(path: P) -> crate::Result<Self> {
        crate::config::load_json(path)
    }

    /// 训练历史摘要
    pub fn summary(&self) -> String {
        let fmt = |o: Option<Observation>| match o {
            Some(o) => format!("{:.4} (step {})", o.value, o.step),
            None => "n/a".to_string(),
        };
        format!(
            "Training Summary:\n  Steps: {}\n  Final Train Loss: {}\n  Best Dev Acc: {}\n  Best Dev Loss: {}",
            self.last("train/loss").map(|o| o.step).unwrap_or(0),
            fmt(self.last("train/loss")),
            fmt(self.best_max("dev/accuracy")),
            fmt(self.best_min("dev/loss")),
        )
    }
}

impl MetricsSink for MetricsHistory {
    fn record(&mut self, name: &str, value: f32, step: u64) {
        self.series
            .entry(name.to_string())
            .or_default()
            .push(Observation { step, value });
    }
}

/// 把观测转发给多个接收方
#[derive(Default)]
pub struct FanoutSink<'a> {
    sinks: Vec<&'a mut dyn MetricsSink>,
}

impl<'a> FanoutSink<'a> {
    pub fn new() -> Self {
        Self { sinks: Vec::new() }
    }

    pub fn with(mut self, sink: &'a mut dyn MetricsSink) -> Self {
        self.sinks.push(sink);
        self
    }
}

impl MetricsSink for FanoutSink<'_> {
    fn record(&mut self, name: &str, value: f32, step: u64) {
        for sink in self.sinks.iter_mut() {
            sink.record(name, value, step);
        }
    }
}

/// 分类指标
///
/// 包含准确率、精确率、召回率和 F1 分数（宏平均）
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClassificationMetrics {
    /// 准确率
    pub accuracy: f32,
    /// 精确率
    pub precision: f32,
    /// 召回率
    pub recall: f32,
    /// F1 分数
    pub f1_score: f32,
}

impl ClassificationMetrics {
    /// 计算分类指标
    ///
    /// 超出类别范围的样本只计入准确率的分母。
    pub fn compute(predictions: &[usize], targets: &[usize], n_classes: usize) -> Self {
        let cm = ConfusionMatrix::compute(predictions, targets, n_classes);
        let total = predictions.len().min(targets.len());
        let correct: usize = (0..n_classes).map(|i| cm.matrix[i][i]).sum();
        let accuracy = if total > 0 { correct as f32 / total as f32 } else { 0.0 };

        let mean = |values: Vec<f32>| {
            if values.is_empty() {
                0.0
            } else {
                values.iter().sum::<f32>() / values.len() as f32
            }
        };

        // 只对出现过的类别求平均
        let precision = mean(
            (0..n_classes)
                .filter_map(|i| {
                    let predicted: usize = (0..n_classes).map(|t| cm.matrix[t][i]).sum();
                    (predicted > 0).then(|| cm.matrix[i][i] as f32 / predicted as f32)
                })
                .collect(),
        );
        let recall = mean(
            (0..n_classes)
                .filter_map(|i| {
                    let actual: usize = cm.matrix[i].iter().sum();
                    (actual > 0).then(|| cm.matrix[i][i] as f32 / actual as f32)
                })
                .collect(),
        );

        let f1_score = if precision + recall > 0.0 {
            2.0 * precision * recall / (precision + recall)
        } else {
            0.0
        };

        Self {
            accuracy,
            precision,
            recall,
            f1_score,
        }
    }

    /// 打印指标摘要
    pub fn summary(&self) -> String {
        format!(
            "Accuracy: {:.2}% | Precision: {:.2}% | Recall: {:.2}% | F1 Score: {:.4}",
            self.accuracy * 100.0,
            self.precision * 100.0,
            self.recall * 100.0,
            self.f1_score
        )
    }
}

/// 混淆矩阵（行为真实类别，列为预测类别）
#[derive(Debug, Clone, PartialEq)]
pub struct ConfusionMatrix {
    matrix: Vec<Vec<usize>>,
    n_classes: usize,
}

impl ConfusionMatrix {
    pub fn compute(predictions: &[usize], targets: &[usize], n_classes: usize) -> Self {
        let mut matrix = vec![vec![0; n_classes]; n_classes];
        for (&pred, &target) in predictions.iter().zip(targets) {
            if pred < n_classes && target < n_classes {
                matrix[target][pred] += 1;
            }
        }
        Self { matrix, n_classes }
    }

    pub fn matrix(&self) -> &[Vec<usize>] {
        &self.matrix
    }

    /// 打印混淆矩阵
    pub fn display(&self) -> String {
        let mut output = String::from("Confusion Matrix:\n");
        output.push_str("     Pred →\n");

        output.push_str("True │");
        for i in 0..self.n_classes {
            output.push_str(&format!("{:5}", i));
        }
        output.push('\n');

        output.push_str("─────┼");
        for _ in 0..self.n_classes {
            output.push_str("─────");
        }
        output.push('\n');

        for (i, row) in self.matrix.iter().enumerate() {
            output.push_str(&format!("{:5}│", i));
            for count in row {
                output.push_str(&format!("{:5}", count));
            }
            output.push('\n');
        }

        output
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_history_records_series() {
        let mut history = MetricsHistory::new();
        history.record("dev/accuracy", 0.6, 100);
        history.record("dev/accuracy", 0.8, 200);
        history.record("dev/accuracy", 0.7, 300);
        history.record("dev/loss", 0.9, 100);
        history.record("dev/loss", 0.5, 200);

        assert_eq!(history.series("dev/accuracy").len(), 3);
        assert_eq!(history.last("dev/accuracy"), Some(Observation { step: 300, value: 0.7 }));
        assert_eq!(history.best_max("dev/accuracy").map(|o| o.step), Some(200));
        assert_eq!(history.best_min("dev/loss").map(|o| o.step), Some(200));
        assert!(history.series("missing").is_empty());
        assert_eq!(history.names().collect::<Vec<_>>(), vec!["dev/accuracy", "dev/loss"]);
    }

    #[test]
    fn test_history_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metrics.json");

        let mut history = MetricsHistory::new();
        history.record("train/loss", 0.25, 1);
        history.save(&path).unwrap();

        assert_eq!(MetricsHistory::load(&path).unwrap(), history);
    }

    #[test]
    fn test_fanout() {
        let mut a = MetricsHistory::new();
        let mut b = MetricsHistory::new();
        {
            let mut fanout = FanoutSink::new().with(&mut a).with(&mut b);
            fanout.record("train/loss", 1.0, 1);
        }
        assert_eq!(a, b);
        assert_eq!(a.series("train/loss").len(), 1);
    }

    #[test]
    fn test_classification_metrics() {
        let predictions = vec![0, 1, 2, 1, 0];
        let targets = vec![0, 1, 1, 1, 0];

        let metrics = ClassificationMetrics::compute(&predictions, &targets, 3);
        assert_abs_diff_eq!(metrics.accuracy, 0.8, epsilon = 1e-6);
        // 精确率: (1 + 1 + 0) / 3，召回率: (1 + 2/3) / 2
        assert_abs_diff_eq!(metrics.precision, 2.0 / 3.0, epsilon = 1e-6);
        assert_abs_diff_eq!(metrics.recall, 5.0 / 6.0, epsilon = 1e-6);

        let empty = ClassificationMetrics::compute(&[], &[], 2);
        assert_eq!(empty.accuracy, 0.0);
    }

    #[test]
    fn test_confusion_matrix() {
        let cm = ConfusionMatrix::compute(&[0, 1, 2, 1, 0], &[0, 1, 1, 1, 0], 3);
        assert_eq!(cm.matrix()[0][0], 2);
        assert_eq!(cm.matrix()[1][1], 2);
        assert_eq!(cm.matrix()[1][2], 1);
        assert!(cm.display().contains("Confusion Matrix"));
    }
}
