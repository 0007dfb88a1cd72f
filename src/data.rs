//! 数据集和数据处理
//!
//! 文本清洗、词汇表、情感语料、训练/验证划分和按 epoch 的 batch 迭代。

use crate::error::{Result, TextCnnError};
use crate::tensor::TensorExt;
use ndarray::{s, Array2, Axis};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;

/// 一个 batch：token 矩阵和 one-hot 标签
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    /// [B, sequence_length]
    pub inputs: Array2<usize>,
    /// [B, num_classes]
    pub labels: Array2<f32>,
}

impl Batch {
    pub fn new(inputs: Array2<usize>, labels: Array2<f32>) -> Self {
        Self { inputs, labels }
    }

    /// 样本数
    pub fn len(&self) -> usize {
        self.inputs.nrows()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 连续切片 [start, end)
    pub fn slice(&self, start: usize, end: usize) -> Batch {
        Batch {
            inputs: self.inputs.slice(s![start..end, ..]).to_owned(),
            labels: self.labels.slice(s![start..end, ..]).to_owned(),
        }
    }

    /// 按下标取样本
    pub fn select(&self, indices: &[usize]) -> Batch {
        Batch {
            inputs: self.inputs.select(Axis(0), indices),
            labels: self.labels.select(Axis(0), indices),
        }
    }

    /// 每个样本的类别下标
    pub fn label_indices(&self) -> Vec<usize> {
        self.labels.argmax_rows()
    }
}

/// 类别下标转 one-hot
pub fn one_hot(labels: &[usize], num_classes: usize) -> Array2<f32> {
    let mut out = Array2::zeros((labels.len(), num_classes));
    for (i, &label) in labels.iter().enumerate() {
        if label < num_classes {
            out[[i, label]] = 1.0;
        }
    }
    out
}

/// 文本分类样本
#[derive(Debug, Clone, PartialEq)]
pub struct TextSample {
    /// 文本内容
    pub text: String,
    /// 类别标签
    pub label: usize,
}

/// 文本清洗
///
/// 只保留字母、数字和少量标点，把缩写和标点拆成独立的 token，统一小写。
#[derive(Debug, Clone)]
pub struct TextCleaner {
    disallowed: Regex,
    contractions: Vec<(Regex, &'static str)>,
    punctuation: Regex,
    spaces: Regex,
}

impl TextCleaner {
    pub fn new() -> Result<Self> {
        let contractions = [
            (r"'s", " 's"),
            (r"'ve", " 've"),
            (r"n't", " n't"),
            (r"'re", " 're"),
            (r"'d", " 'd"),
            (r"'ll", " 'll"),
        ]
        .into_iter()
        .map(|(pattern, replacement)| -> Result<(Regex, &'static str)> {
            Ok((Regex::new(pattern)?, replacement))
        })
        .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            disallowed: Regex::new(r"[^A-Za-z0-9(),!?'`]")?,
            contractions,
            punctuation: Regex::new(r"([,!?()])")?,
            spaces: Regex::new(r"\s{2,}")?,
        })
    }

    /// 清洗一句文本
    pub fn clean(&self, text: &str) -> String {
        let mut out = self.disallowed.replace_all(text, " ").into_owned();
        for (pattern, replacement) in &self.contractions {
            out = pattern.replace_all(&out, *replacement).into_owned();
        }
        out = self.punctuation.replace_all(&out, " $1 ").into_owned();
        out = self.spaces.replace_all(&out, " ").into_owned();
        out.trim().to_lowercase()
    }
}

/// 加载正负两个语料文件（每行一句）
///
/// 负面样本标签为 0，正面为 1，先负后正。
pub fn load_polarity_files<P: AsRef<Path>>(positive: P, negative: P) -> Result<Vec<TextSample>> {
    let cleaner = TextCleaner::new()?;
    let read = |path: &Path, label: usize| -> Result<Vec<TextSample>> {
        let content = fs::read_to_string(path)?;
        Ok(content
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(|line| TextSample {
                text: cleaner.clean(line),
                label,
            })
            .collect())
    };

    let mut samples = read(negative.as_ref(), 0)?;
    samples.extend(read(positive.as_ref(), 1)?);
    Ok(samples)
}

/// 内置的小型情感语料
///
/// 1 = 积极, 0 = 消极
pub fn sentiment_corpus() -> Vec<TextSample> {
    let positive = [
        "this movie is great and wonderful",
        "i love this film it is amazing",
        "excellent performance and great story",
        "best movie ever highly recommended",
        "fantastic acting and brilliant direction",
        "really enjoyed this masterpiece",
        "outstanding film with great characters",
        "superb storytelling and amazing visuals",
        "perfect movie loved every moment",
        "incredible film must watch",
        "great entertainment and fun",
        "wonderful experience and joy",
        "this film is fantastic",
        "amazing movie and excellent",
        "brilliant and outstanding work",
        "this is great love it",
        "best film ever seen",
        "excellent and wonderful",
        "fantastic amazing movie",
        "superb and perfect",
    ];
    let negative = [
        "this movie is terrible and boring",
        "i hate this film it is awful",
        "poor performance and bad story",
        "worst movie ever not recommended",
        "disappointing acting and terrible direction",
        "really disliked this disaster",
        "awful film with bad characters",
        "boring storytelling and poor visuals",
        "horrible movie hated every moment",
        "terrible film avoid it",
        "bad entertainment and dull",
        "awful experience and waste",
        "this film is horrible",
        "boring movie and terrible",
        "poor and awful work",
        "this is bad hate it",
        "worst film ever seen",
        "terrible and awful",
        "horrible bad movie",
        "boring and poor",
    ];

    negative
        .iter()
        .map(|text| (text, 0))
        .chain(positive.iter().map(|text| (text, 1)))
        .map(|(text, label)| TextSample {
            text: text.to_string(),
            label,
        })
        .collect()
}

/// 词汇表
///
/// id 0 为填充，id 1 为未知词；其余按词频降序排列，频率相同时按首次出现的顺序。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Vocabulary {
    /// ID 到 token 的映射
    tokens: Vec<String>,
    /// token 到 ID 的映射
    #[serde(skip)]
    index: HashMap<String, usize>,
}

impl Default for Vocabulary {
    fn default() -> Self {
        Self::new()
    }
}

impl Vocabulary {
    pub const PAD: usize = 0;
    pub const UNK: usize = 1;
    const PAD_TOKEN: &'static str = "<PAD>";
    const UNK_TOKEN: &'static str = "<UNK>";

    /// 只含特殊标记的词汇表
    pub fn new() -> Self {
        Self::from_tokens(vec![Self::PAD_TOKEN.to_string(), Self::UNK_TOKEN.to_string()])
    }

    fn from_tokens(tokens: Vec<String>) -> Self {
        let index = tokens
            .iter()
            .enumerate()
            .map(|(i, t)| (t.clone(), i))
            .collect();
        Self { tokens, index }
    }

    /// 从文本列表构建词汇表
    pub fn build<S: AsRef<str>>(texts: &[S], min_freq: usize) -> Self {
        // token -> (频率, 首次出现位置)
        let mut freq: HashMap<&str, (usize, usize)> = HashMap::new();
        let mut seen = 0;
        for text in texts {
            for token in text.as_ref().split_whitespace() {
                let entry = freq.entry(token).or_insert((0, seen));
                entry.0 += 1;
                seen += 1;
            }
        }

        let mut words: Vec<_> = freq
            .into_iter()
            .filter(|(_, (count, _))| *count >= min_freq)
            .collect();
        words.sort_by(|a, b| b.1 .0.cmp(&a.1 .0).then(a.1 .1.cmp(&b.1 .1)));

        let mut tokens = vec![Self::PAD_TOKEN.to_string(), Self::UNK_TOKEN.to_string()];
        tokens.extend(
            words
                .into_iter()
                .map(|(word, _)| word.to_string())
                .filter(|w| w != Self::PAD_TOKEN && w != Self::UNK_TOKEN),
        );
        Self::from_tokens(tokens)
    }

    /// 将文本转换为定长 token IDs（截断或用 PAD 填充）
    pub fn encode(&self, text: &str, max_len: usize) -> Vec<usize> {
        let mut ids: Vec<usize> = text
            .split_whitespace()
            .take(max_len)
            .map(|token| self.index.get(token).copied().unwrap_or(Self::UNK))
            .collect();
        ids.resize(max_len, Self::PAD);
        ids
    }

    /// 将 token IDs 转换回文本（跳过 PAD）
    pub fn decode(&self, ids: &[usize]) -> String {
        ids.iter()
            .filter(|&&id| id != Self::PAD)
            .filter_map(|&id| self.tokens.get(id).map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// 词汇表大小
    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    pub fn save_json<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        crate::config::save_json(self, path)
    }

    pub fn load_json<P: AsRef<Path>>(path: P) -> Result<Self> {
        let loaded: Vocabulary = crate::config::load_json(path)?;
        if loaded.tokens.len() < 2 || loaded.tokens[Self::PAD] != Self::PAD_TOKEN {
            return Err(TextCnnError::InvalidConfig(
                "vocabulary file is missing the special tokens".to_string(),
            ));
        }
        Ok(Self::from_tokens(loaded.tokens))
    }
}

/// 最长文档的 token 数
pub fn max_document_length(samples: &[TextSample]) -> usize {
    samples
        .iter()
        .map(|s| s.text.split_whitespace().count())
        .max()
        .unwrap_or(0)
}

/// 编码样本为一个 batch
pub fn encode_samples(
    vocab: &Vocabulary,
    samples: &[TextSample],
    sequence_length: usize,
    num_classes: usize,
) -> Result<Batch> {
    if let Some(bad) = samples.iter().find(|s| s.label >= num_classes) {
        return Err(TextCnnError::InvalidConfig(format!(
            "label {} out of range for {} classes",
            bad.label, num_classes
        )));
    }

    let ids: Vec<usize> = samples
        .iter()
        .flat_map(|s| vocab.encode(&s.text, sequence_length))
        .collect();
    let inputs = Array2::from_shape_vec((samples.len(), sequence_length), ids)
        .map_err(|e| TextCnnError::InvalidConfig(format!("encoding failed: {}", e)))?;
    let labels: Vec<usize> = samples.iter().map(|s| s.label).collect();

    Ok(Batch::new(inputs, one_hot(&labels, num_classes)))
}

/// 打乱后切出验证集
///
/// 验证集取打乱后的最后 `dev_fraction` 部分（至少一条），训练集不能为空。
pub fn split_dev(data: &Batch, dev_fraction: f32, seed: u64) -> Result<(Batch, Batch)> {
    if !(0.0..1.0).contains(&dev_fraction) || dev_fraction == 0.0 {
        return Err(TextCnnError::InvalidConfig(format!(
            "dev fraction must be in (0, 1), got {}",
            dev_fraction
        )));
    }
    let n = data.len();
    let dev_len = ((n as f32 * dev_fraction) as usize).max(1);
    if dev_len >= n {
        return Err(TextCnnError::InvalidConfig(format!(
            "{} samples are too few for a dev split of {}",
            n, dev_fraction
        )));
    }

    let mut indices: Vec<usize> = (0..n).collect();
    indices.shuffle(&mut StdRng::seed_from_u64(seed));
    let (train, dev) = indices.split_at(n - dev_len);

    Ok((data.select(train), data.select(dev)))
}

/// 按 epoch 产生 batch 的迭代器
///
/// 每个 epoch 用 `seed + epoch` 重新打乱；最后一个 batch 可能较小。
#[derive(Debug, Clone)]
pub struct BatchIter<'a> {
    data: &'a Batch,
    batch_size: usize,
    num_epochs: usize,
    shuffle: bool,
    seed: u64,
    epoch: usize,
    order: Vec<usize>,
    position: usize,
}

/// 创建 batch 迭代器
pub fn batch_iter(data: &Batch, batch_size: usize, num_epochs: usize, shuffle: bool, seed: u64) -> BatchIter<'_> {
    let mut iter = BatchIter {
        data,
        batch_size: batch_size.max(1),
        num_epochs,
        shuffle,
        seed,
        epoch: 0,
        order: Vec::new(),
        position: 0,
    };
    iter.reorder();
    iter
}

impl BatchIter<'_> {
    fn reorder(&mut self) {
        self.order = (0..self.data.len()).collect();
        if self.shuffle {
            let mut rng = StdRng::seed_from_u64(self.seed.wrapping_add(self.epoch as u64));
            self.order.shuffle(&mut rng);
        }
        self.position = 0;
    }

    /// 每个 epoch 的 batch 数
    pub fn batches_per_epoch(&self) -> usize {
        (self.data.len() + self.batch_size - 1) / self.batch_size
    }

    /// 总 batch 数
    pub fn total_batches(&self) -> usize {
        self.batches_per_epoch() * self.num_epochs
    }

    /// 当前 epoch（从 0 开始）
    pub fn epoch(&self) -> usize {
        self.epoch
    }
}

impl Iterator for BatchIter<'_> {
    type Item = Batch;

    fn next(&mut self) -> Option<Batch> {
        if self.data.is_empty() {
            return None;
        }
        if self.position >= self.order.len() {
            self.epoch += 1;
            if self.epoch >= self.num_epochs {
                return None;
            }
            self.reorder();
        }
        if self.epoch >= self.num_epochs {
            return None;
        }

        let end = (self.position + self.batch_size).min(self.order.len());
        let batch = self.data.select(&self.order[self.position..end]);
        self.position = end;
        Some(batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::arr2;

    #[test]
    fn test_clean_str() {
        let cleaner = TextCleaner::new().unwrap();
        assert_eq!(
            cleaner.clean("It's a GREAT movie, isn't it?!"),
            "it 's a great movie , is n't it ? !"
        );
        assert_eq!(cleaner.clean("  what   a <b>mess</b>  "), "what a b mess b");
        assert_eq!(cleaner.clean("we'll (maybe) go"), "we 'll ( maybe ) go");
    }

    #[test]
    fn test_vocabulary_ids() {
        let vocab = Vocabulary::build(&["b a b", "c a b"], 1);
        // b:3, a:2, c:1
        assert_eq!(vocab.len(), 5);
        assert_eq!(vocab.encode("b a c", 3), vec![2, 3, 4]);
        assert_eq!(vocab.encode("a zzz", 4), vec![3, Vocabulary::UNK, Vocabulary::PAD, Vocabulary::PAD]);
        assert_eq!(vocab.encode("a b c a b", 2), vec![3, 2]);
        assert_eq!(vocab.decode(&[2, 3, 1, 0, 0]), "b a <UNK>");
    }

    #[test]
    fn test_vocabulary_is_deterministic() {
        let texts = ["x y z", "z y x", "w"];
        assert_eq!(Vocabulary::build(&texts, 1), Vocabulary::build(&texts, 1));
        assert_eq!(Vocabulary::build(&texts, 2).len(), 5);
    }

    #[test]
    fn test_vocabulary_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vocab.json");
        let vocab = Vocabulary::build(&["hello world", "hello rust"], 1);

        vocab.save_json(&path).unwrap();
        let loaded = Vocabulary::load_json(&path).unwrap();
        assert_eq!(loaded, vocab);
        assert_eq!(loaded.encode("hello rust", 3), vocab.encode("hello rust", 3));
    }

    #[test]
    fn test_sentiment_corpus() {
        let corpus = sentiment_corpus();
        assert_eq!(corpus.len(), 40);
        assert_eq!(corpus.iter().filter(|s| s.label == 1).count(), 20);
        assert!(max_document_length(&corpus) <= 8);
    }

    #[test]
    fn test_load_polarity_files() {
        let dir = tempfile::tempdir().unwrap();
        let pos = dir.path().join("rt-polarity.pos");
        let neg = dir.path().join("rt-polarity.neg");
        fs::write(&pos, "A fine film!\n\nLoved it.\n").unwrap();
        fs::write(&neg, "Dull, dull.\n").unwrap();

        let samples = load_polarity_files(&pos, &neg).unwrap();
        assert_eq!(samples.len(), 3);
        assert_eq!(samples[0], TextSample { text: "dull , dull".to_string(), label: 0 });
        assert_eq!(samples[1].label, 1);
        assert_eq!(samples[1].text, "a fine film !");

        assert!(load_polarity_files(dir.path().join("missing"), neg).is_err());
    }

    #[test]
    fn test_encode_and_split() {
        let corpus = sentiment_corpus();
        let vocab = Vocabulary::build(&corpus.iter().map(|s| s.text.as_str()).collect::<Vec<_>>(), 1);
        let data = encode_samples(&vocab, &corpus, 8, 2).unwrap();
        assert_eq!(data.inputs.shape(), &[40, 8]);
        assert_eq!(data.labels.shape(), &[40, 2]);

        let (train, dev) = split_dev(&data, 0.1, 10).unwrap();
        assert_eq!(train.len(), 36);
        assert_eq!(dev.len(), 4);
        assert_eq!(split_dev(&data, 0.1, 10).unwrap(), (train, dev));

        assert!(split_dev(&data, 0.0, 10).is_err());
        assert!(split_dev(&data.slice(0, 1), 0.5, 10).is_err());
    }

    #[test]
    fn test_batch_iter_epochs() {
        let data = Batch::new(
            Array2::from_shape_fn((5, 2), |(i, _)| i),
            one_hot(&[0, 1, 0, 1, 0], 2),
        );

        let iter = batch_iter(&data, 2, 3, true, 7);
        assert_eq!(iter.batches_per_epoch(), 3);
        assert_eq!(iter.total_batches(), 9);

        let batches: Vec<Batch> = iter.collect();
        assert_eq!(batches.len(), 9);
        assert_eq!(batches[2].len(), 1);

        // 每个 epoch 覆盖所有样本
        let mut seen: Vec<usize> = batches[..3].iter().flat_map(|b| b.inputs.column(0).to_vec()).collect();
        seen.sort_unstable();
        assert_eq!(seen, vec![0, 1, 2, 3, 4]);

        let ordered: Vec<Batch> = batch_iter(&data, 2, 1, false, 7).collect();
        assert_eq!(ordered[0].inputs, arr2(&[[0, 0], [1, 1]]));
    }

    #[test]
    fn test_one_hot() {
        assert_eq!(one_hot(&[1, 0], 3), arr2(&[[0.0, 1.0, 0.0], [1.0, 0.0, 0.0]]));
    }
}
