//! 模型检查点保存和加载
//!
//! 检查点包含模型超参数、步数、全部参数和优化器状态，用 bincode 编码：
//!
//! ```text
//! <dir>/ckpt-<step>.bin     每个快照一个文件，写入后不再修改
//! <dir>/checkpoint.json     最新快照和保留的快照列表
//! ```

use crate::config::ModelConfig;
use crate::error::{Result, TextCnnError};
use crate::optimizer::{Adam, AdamState};
use crate::params::{expected_shapes, param_names, FilterParams, Parameters};
use crate::state::TrainingState;
use bincode::Options;
use ndarray::{ArrayBase, ArrayD, Data, Dimension, Ix1, Ix2, Ix4};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

const MAGIC: [u8; 8] = *b"TEXTCNN1";
const FORMAT_VERSION: u32 = 1;
const INDEX_FILE: &str = "checkpoint.json";

/// 可序列化的张量（行优先）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SerializableArray {
    /// 数据（行优先）
    pub data: Vec<f32>,
    /// 形状
    pub shape: Vec<usize>,
}

impl SerializableArray {
    /// 从任意维度的数组创建
    pub fn from_array<S, D>(arr: &ArrayBase<S, D>) -> Self
    where
        S: Data<Elem = f32>,
        D: Dimension,
    {
        Self {
            data: arr.iter().copied().collect(),
            shape: arr.shape().to_vec(),
        }
    }

    /// 转换为动态维度数组
    pub fn to_array(&self) -> Result<ArrayD<f32>> {
        ArrayD::from_shape_vec(self.shape.clone(), self.data.clone()).map_err(|_| {
            TextCnnError::shape("serialized tensor", &self.shape, &[self.data.len()])
        })
    }

    fn into_dim<D: Dimension>(self, name: &str) -> Result<ndarray::Array<f32, D>> {
        self.to_array()?
            .into_dimensionality::<D>()
            .map_err(|_| TextCnnError::InvalidConfig(format!("tensor {} has wrong rank", name)))
    }
}

/// 训练检查点
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    magic: [u8; 8],
    version: u32,
    /// 模型超参数
    pub config: ModelConfig,
    /// 全局步数
    pub step: u64,
    /// 参数名（枚举顺序）
    pub names: Vec<String>,
    /// 参数张量（枚举顺序）
    pub tensors: Vec<SerializableArray>,
    /// 优化器状态
    pub optimizer: AdamState,
}

impl Checkpoint {
    /// 记录当前训练状态
    pub fn capture(config: &ModelConfig, state: &TrainingState) -> Self {
        let params = state.params();
        Self {
            magic: MAGIC,
            version: FORMAT_VERSION,
            config: config.clone(),
            step: state.step(),
            names: params.names(),
            tensors: params.tensors().iter().map(SerializableArray::from_array).collect(),
            optimizer: state.optimizer().state(),
        }
    }

    fn codec() -> impl Options {
        bincode::DefaultOptions::new().with_fixint_encoding()
    }

    /// 编码为字节
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(Self::codec().serialize(self)?)
    }

    /// 从字节解码（只校验格式，不校验内容）
    ///
    /// 解码的总大小不超过输入长度，损坏的长度字段不会触发巨大的分配。
    pub fn from_bytes(bytes: &[u8]) -> std::result::Result<Self, String> {
        if bytes.len() < MAGIC.len() || bytes[..MAGIC.len()] != MAGIC {
            return Err("bad magic header".to_string());
        }
        let checkpoint: Checkpoint = Self::codec()
            .with_limit(bytes.len() as u64)
            .deserialize(bytes)
            .map_err(|e| e.to_string())?;
        if checkpoint.version != FORMAT_VERSION {
            return Err(format!("unsupported format version {}", checkpoint.version));
        }
        Ok(checkpoint)
    }

    /// 校验并重建训练状态
    fn into_state(self, path: &Path, expected: &ModelConfig) -> Result<TrainingState> {
        let corrupt = |reason: String| TextCnnError::CorruptCheckpoint {
            path: path.to_path_buf(),
            reason,
        };

        self.config
            .validate()
            .map_err(|e| corrupt(format!("stored hyperparameters are invalid: {}", e)))?;
        if self.names != param_names(&self.config.filter_sizes) {
            return Err(corrupt("parameter names do not match stored hyperparameters".into()));
        }
        let shapes = expected_shapes(&self.config);
        if self.tensors.len() != shapes.len() {
            return Err(corrupt(format!("expected {} tensors, found {}", shapes.len(), self.tensors.len())));
        }
        for ((name, tensor), shape) in self.names.iter().zip(&self.tensors).zip(&shapes) {
            if &tensor.shape != shape || tensor.data.len() != shape.iter().product::<usize>() {
                return Err(corrupt(format!(
                    "tensor {} has shape {:?}, expected {:?}",
                    name, tensor.shape, shape
                )));
            }
        }

        if &self.config != expected {
            return Err(TextCnnError::CheckpointMismatch {
                path: path.to_path_buf(),
                reason: format!("stored {:?}, expected {:?}", self.config, expected),
            });
        }

        let params = rebuild_params(&self.config, self.tensors).map_err(|e| corrupt(e.to_string()))?;
        let optimizer = Adam::from_state(self.optimizer, &params).map_err(|e| corrupt(e.to_string()))?;
        Ok(TrainingState::from_parts(self.step, params, optimizer))
    }
}

/// 按枚举顺序把张量装回 [`Parameters`]
fn rebuild_params(config: &ModelConfig, tensors: Vec<SerializableArray>) -> Result<Parameters> {
    let mut tensors = tensors.into_iter();
    let mut next = |name: &str| {
        tensors
            .next()
            .ok_or_else(|| TextCnnError::InvalidConfig(format!("missing tensor {}", name)))
    };

    let embedding = next("embedding/W")?.into_dim::<Ix2>("embedding/W")?;
    let mut filters = Vec::with_capacity(config.filter_sizes.len());
    for width in &config.filter_sizes {
        let weight_name = format!("conv-maxpool-{}/W", width);
        let bias_name = format!("conv-maxpool-{}/b", width);
        filters.push(FilterParams {
            weight: next(&weight_name)?.into_dim::<Ix4>(&weight_name)?,
            bias: next(&bias_name)?.into_dim::<Ix1>(&bias_name)?,
        });
    }
    let output_weight = next("output/W")?.into_dim::<Ix2>("output/W")?;
    let output_bias = next("output/b")?.into_dim::<Ix1>("output/b")?;

    Parameters::from_parts(config, embedding, filters, output_weight, output_bias)
}

/// 检查点索引
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CheckpointIndex {
    /// 最新的检查点文件名
    pub latest: Option<String>,
    /// 保留的检查点文件名（从旧到新）
    pub retained: Vec<String>,
}

/// 检查点管理器
///
/// 管理一个目录下的步数编号快照，只保留最新的 `max_to_keep` 个。
#[derive(Debug)]
pub struct CheckpointManager {
    /// 保存目录
    dir: PathBuf,
    /// 保留的检查点数量
    max_to_keep: usize,
    index: CheckpointIndex,
}

impl CheckpointManager {
    /// 打开（必要时创建）检查点目录
    pub fn new<P: AsRef<Path>>(dir: P, max_to_keep: usize) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        // 索引只是派生数据，损坏时按磁盘上的快照重建
        let index = match read_index(&dir) {
            Ok(index) => index.unwrap_or_default(),
            Err(e @ TextCnnError::CorruptCheckpoint { .. }) => {
                let index = scan_index(&dir)?;
                warn!(error = %e, retained = index.retained.len(), "checkpoint index unreadable, rebuilt from disk");
                index
            }
            Err(e) => return Err(e),
        };

        Ok(Self {
            dir,
            max_to_keep: max_to_keep.max(1),
            index,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// 第 `step` 步的检查点路径
    pub fn path_for(&self, step: u64) -> PathBuf {
        self.dir.join(format!("ckpt-{}.bin", step))
    }

    /// 保存快照
    ///
    /// 先写入临时文件并落盘，再重命名到最终位置。目标文件已存在时拒绝写入。
    pub fn save(&mut self, config: &ModelConfig, state: &TrainingState) -> Result<PathBuf> {
        let path = self.path_for(state.step());
        if path.exists() {
            return Err(TextCnnError::CheckpointExists(path));
        }

        let bytes = Checkpoint::capture(config, state).to_bytes()?;
        write_atomic(&path, &bytes)?;

        let name = file_name(&path);
        self.index.retained.retain(|n| n != &name);
        self.index.retained.push(name.clone());
        self.index.latest = Some(name);
        self.prune();

        let index_bytes = serde_json::to_vec_pretty(&self.index)?;
        write_atomic(&self.dir.join(INDEX_FILE), &index_bytes)?;

        info!(step = state.step(), path = %path.display(), bytes = bytes.len(), "checkpoint saved");
        Ok(path)
    }

    /// 删除超出保留数量的旧快照
    fn prune(&mut self) {
        while self.index.retained.len() > self.max_to_keep {
            let old = self.index.retained.remove(0);
            let path = self.dir.join(&old);
            match fs::remove_file(&path) {
                Ok(()) => debug!(path = %path.display(), "old checkpoint removed"),
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => warn!(path = %path.display(), error = %e, "could not remove old checkpoint"),
            }
        }
    }

    /// 保留的检查点（从旧到新）
    pub fn checkpoints(&self) -> Vec<PathBuf> {
        self.index.retained.iter().map(|n| self.dir.join(n)).collect()
    }

    /// 最新的检查点，没有时返回 None
    pub fn latest(&self) -> Option<PathBuf> {
        self.index.latest.as_ref().map(|n| self.dir.join(n))
    }

    /// 读取目录中最新的检查点位置
    ///
    /// 目录或索引不存在表示全新开始，返回 `Ok(None)`。
    pub fn find_latest<P: AsRef<Path>>(dir: P) -> Result<Option<PathBuf>> {
        let dir = dir.as_ref();
        Ok(read_index(dir)?.and_then(|index| index.latest).map(|n| dir.join(n)))
    }

    /// 从检查点恢复训练状态
    pub fn restore<P: AsRef<Path>>(path: P, expected: &ModelConfig) -> Result<TrainingState> {
        let path = path.as_ref();
        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(TextCnnError::CheckpointNotFound(path.to_path_buf()))
            }
            Err(e) => return Err(e.into()),
        };

        let checkpoint = Checkpoint::from_bytes(&bytes).map_err(|reason| TextCnnError::CorruptCheckpoint {
            path: path.to_path_buf(),
            reason,
        })?;
        let state = checkpoint.into_state(path, expected)?;

        info!(step = state.step(), path = %path.display(), "checkpoint restored");
        Ok(state)
    }

    /// 恢复最新的检查点
    pub fn restore_latest(&self, expected: &ModelConfig) -> Result<Option<(PathBuf, TrainingState)>> {
        match self.latest() {
            Some(path) => {
                let state = Self::restore(&path, expected)?;
                Ok(Some((path, state)))
            }
            None => Ok(None),
        }
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// 写临时文件、落盘、重命名
fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp = path.with_file_name(format!(".{}.tmp", file_name(path)));
    {
        let mut file = File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    Ok(())
}

fn read_index(dir: &Path) -> Result<Option<CheckpointIndex>> {
    let path = dir.join(INDEX_FILE);
    let bytes = match fs::read(&path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    serde_json::from_slice(&bytes)
        .map(Some)
        .map_err(|e| TextCnnError::CorruptCheckpoint {
            path,
            reason: e.to_string(),
        })
}

/// 扫描目录中的 `ckpt-<step>.bin`，按步数排序生成索引
fn scan_index(dir: &Path) -> Result<CheckpointIndex> {
    let mut found: Vec<(u64, String)> = Vec::new();
    for entry in fs::read_dir(dir)? {
        let name = entry?.file_name().to_string_lossy().into_owned();
        let step = name
            .strip_prefix("ckpt-")
            .and_then(|rest| rest.strip_suffix(".bin"))
            .and_then(|step| step.parse().ok());
        if let Some(step) = step {
            found.push((step, name));
        }
    }
    found.sort();

    let retained: Vec<String> = found.into_iter().map(|(_, name)| name).collect();
    Ok(CheckpointIndex {
        latest: retained.last().cloned(),
        retained,
    })
}
