// N 元马尔可夫链, 从群聊句子中学习, 按出现次数加权随机生成新句子
use crate::models::SnapshotError;

use std::{
    collections::{BTreeMap, HashMap},
    fs,
    io::ErrorKind,
    path::Path
};

use rand::{Rng, distr::{Distribution, weighted::WeightedIndex}};
use serde::{Deserialize, Serialize};
use tracing::debug;

// 单句最多生成的词数, 保证一定会停下来
pub const MAX_GENERATED_TOKENS: usize = 512;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Token {
    Bos,
    Eos,
    Word(String)
}

// 上文 -> (下一个词 -> 次数)
// 出现过的上文都至少有一个后继, 次数都是正数
type Transitions = HashMap<Vec<Token>, BTreeMap<Token, u64>>;

#[derive(Serialize, Deserialize)]
struct Snapshot {
    order: usize,
    transitions: Vec<SnapshotEntry>
}

#[derive(Serialize, Deserialize)]
struct SnapshotEntry {
    context: Vec<Token>,
    next: Vec<(Token, u64)>
}

#[derive(Debug, Clone, PartialEq)]
pub struct MarkovChain {
    order: usize,
    transitions: Transitions
}

impl MarkovChain {
    /// 新模型自带 (BOS, ..., BOS) -> EOS, 空模型也能生成
    pub fn new(order: usize) -> Self {
        let order = order.max(1);
        let mut transitions = Transitions::new();
        transitions
            .entry(vec![Token::Bos; order])
            .or_default()
            .insert(Token::Eos, 1);

        Self { order, transitions }
    }

    pub fn order(&self) -> usize {
        self.order
    }

    /// 记录过的上文数量
    pub fn context_count(&self) -> usize {
        self.transitions.len()
    }

    pub fn count(&self, context: &[Token], next: &Token) -> u64 {
        self.transitions
            .get(context)
            .and_then(|n| n.get(next))
            .copied()
            .unwrap_or(0)
    }

    fn start_context(&self) -> Vec<Token> {
        vec![Token::Bos; self.order]
    }

    /// 学习一句分好词的句子: 前面补 order 个 BOS, 末尾补 EOS, 统计每个窗口
    pub fn observe<I, S>(&mut self, sentence: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>
    {
        let mut padded = self.start_context();
        padded.extend(sentence.into_iter().map(|w| Token::Word(w.into())));
        padded.push(Token::Eos);

        for window in padded.windows(self.order + 1) {
            let (context, next) = window.split_at(self.order);
            *self.transitions
                .entry(context.to_vec())
                .or_default()
                .entry(next[0].clone())
                .or_insert(0) += 1;
        }
    }

    fn sample<R: Rng + ?Sized>(&self, context: &[Token], rng: &mut R) -> Option<Token> {
        let next = self.transitions.get(context)?;
        let (tokens, weights): (Vec<&Token>, Vec<u64>) = next.iter().map(|(t, c)| (t, *c)).unzip();
        let index = WeightedIndex::new(&weights).ok()?;
        Some(tokens[index.sample(rng)].clone())
    }

    pub fn generate(&self, seed: &[String]) -> Vec<String> {
        self.generate_with(seed, &mut rand::rng())
    }

    /// 从种子开始随机游走直到抽到 EOS, 种子原样作为输出的开头
    /// 种子的最后 order 个词作为初始上文, 不够则左侧补 BOS
    pub fn generate_with<R: Rng + ?Sized>(&self, seed: &[String], rng: &mut R) -> Vec<String> {
        let mut output: Vec<String> = seed.to_vec();

        let tail = &seed[seed.len().saturating_sub(self.order)..];
        let mut context = vec![Token::Bos; self.order - tail.len()];
        context.extend(tail.iter().cloned().map(Token::Word));

        for _ in 0..MAX_GENERATED_TOKENS {
            let next = match self.sample(&context, rng) {
                Some(token) => token,
                None => {
                    // 上文没有记录, 回到句首重新开始
                    debug!(?context, "上文没有后继, 回到句首");
                    context = self.start_context();
                    match self.sample(&context, rng) {
                        Some(token) => token,
                        None => break
                    }
                }
            };

            match &next {
                Token::Eos => break,
                Token::Bos => {}
                Token::Word(word) => output.push(word.clone())
            }

            context.remove(0);
            context.push(next);
        }

        output
    }

    /// 合并另一份转移表: 同一 (上文, 词) 以传入的次数为准, 其余保留
    /// 长度不对的上文、次数为 0 的条目会被丢弃
    fn merge(&mut self, entries: Vec<SnapshotEntry>) {
        for entry in entries {
            if entry.context.len() != self.order { continue }

            let next: BTreeMap<Token, u64> = entry.next.into_iter().filter(|(_, count)| *count > 0).collect();
            if next.is_empty() { continue }

            self.transitions.entry(entry.context).or_default().extend(next);
        }
    }

    /// 序列化成快照 JSON, 只需要读锁, 落盘交给 [`write_snapshot`]
    pub fn to_json(&self) -> Result<String, SnapshotError> {
        let snapshot = Snapshot {
            order: self.order,
            transitions: self.transitions
                .iter()
                .map(|(context, next)| SnapshotEntry {
                    context: context.clone(),
                    next: next.iter().map(|(t, c)| (t.clone(), *c)).collect()
                })
                .collect()
        };
        Ok(serde_json::to_string(&snapshot)?)
    }

    pub async fn persist(&self, path: &Path) -> Result<(), SnapshotError> {
        let content = self.to_json()?;
        write_snapshot(path, content).await?;
        debug!(contexts = self.transitions.len(), path = %path.display(), "马尔可夫链已保存");
        Ok(())
    }

    /// 读取快照并合并进当前模型, 快照不存在时返回 Ok(false)
    pub fn load(&mut self, path: &Path) -> Result<bool, SnapshotError> {
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e.into())
        };

        let snapshot: Snapshot = serde_json::from_str(&content)?;
        if snapshot.order != self.order {
            return Err(SnapshotError::Format(format!("快照的阶数为 {}, 当前为 {}", snapshot.order, self.order)))
        }

        self.merge(snapshot.transitions);
        Ok(true)
    }
}

/// 写入快照, 先写临时文件再改名
pub async fn write_snapshot(path: &Path, content: String) -> Result<(), SnapshotError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }
    let tmp_path = path.with_extension("tmp");
    tokio::fs::write(&tmp_path, content).await?;
    tokio::fs::rename(&tmp_path, path).await?;
    Ok(())
}
