// 群聊文本的预处理与生成结果的拼接
use crate::markov::MarkovChain;

use jieba_rs::Jieba;
use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    static ref CQ_CODE: Regex = Regex::new(r"\[.*?\]").expect("CQ 码正则有误");
    static ref ESCAPED: Regex = Regex::new(r"&#[0-9]{1,3};").expect("转义字符正则有误");
    static ref SENTENCE_END: Regex = Regex::new(r"\.|。|\?|!|？|！").expect("断句正则有误");
}

// 生成的句子以句号结尾
pub const SENTENCE_MARK: &str = "。";

/// 去掉 CQ 码和转义字符后按换行与标点断句, 空句与单个空格会被丢弃
pub fn split_sentences(plain: &str) -> Vec<String> {
    let cleaned = CQ_CODE.replace_all(plain, "");
    let cleaned = ESCAPED.replace_all(&cleaned, "");

    cleaned
        .split('\n')
        .flat_map(|segment| SENTENCE_END.split(segment))
        .filter(|s| !s.is_empty() && *s != " ")
        .map(str::to_string)
        .collect()
}

/// 生成结果直接拼接, 句末补句号
pub fn render(tokens: &[String]) -> String {
    let mut text = tokens.concat();
    text.push_str(SENTENCE_MARK);
    text
}

// 复读命令的前缀
pub const ECHO_KEYWORD: &str = "说话！";

/// 去掉前缀, 你我互换, 把反问改成肯定, 再加一个感叹号
pub fn echo(message: &str) -> String {
    let text = message.trim_start().trim_start_matches(ECHO_KEYWORD).replace("是不是", "就是");

    let mut reply: String = text
        .chars()
        .map(|c| match c {
            '我' => '你',
            '你' => '我',
            other => other
        })
        .collect();
    reply.push('!');
    reply
}

// jieba 词典加载较慢, 进程内只建一个
pub struct ChatTokenizer {
    jieba: Jieba
}

impl Default for ChatTokenizer {
    fn default() -> Self {
        Self::new()
    }
}

impl ChatTokenizer {
    pub fn new() -> Self {
        Self { jieba: Jieba::new() }
    }

    pub fn tokenize(&self, sentence: &str) -> Vec<String> {
        self.jieba
            .cut(sentence, false)
            .into_iter()
            .map(str::to_string)
            .collect()
    }

    /// 学习一条消息中的每一句, 返回学到的句数
    pub fn learn(&self, chain: &mut MarkovChain, message: &str) -> usize {
        let sentences = split_sentences(message);
        for sentence in &sentences {
            chain.observe(self.tokenize(sentence));
        }
        sentences.len()
    }
}
