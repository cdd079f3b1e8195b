// 命令处理器, 把聊天命令转成对爬虫与马尔可夫链的调用, 回复纯文本
use crate::{
    business::{calculate_gpa, round_3decimal, upcoming_exams},
    chat::{ChatTokenizer, echo, render},
    config::AppConfig,
    markov::{MarkovChain, write_snapshot},
    models::WebError,
    scraping::SchoolFetcher
};

use std::sync::Arc;

use axum::{
    Json,
    extract::{Form, Query, State}
};
use chrono::Local;
use futures::TryStreamExt;
use serde::Deserialize;
use serde_json::json;
use tera::Tera;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};

pub type SharedState = Arc<AppState>;

// 进程内共享的状态, 启动时构造并注入
pub struct AppState {
    pub tera: Tera,
    pub config: AppConfig,
    pub markov: RwLock<MarkovChain>,    // 学习时写锁, 生成时读锁
    pub tokenizer: ChatTokenizer,
    snapshot_writer: Mutex<()>          // 快照按学习的先后顺序落盘
}

impl AppState {
    pub fn new(tera: Tera, config: AppConfig, markov: MarkovChain, tokenizer: ChatTokenizer) -> SharedState {
        Arc::new(Self { tera, config, markov: RwLock::new(markov), tokenizer, snapshot_writer: Mutex::new(()) })
    }

    fn render(&self, template: &str, context: &tera::Context) -> Result<String, WebError> {
        self.tera.render(template, context).map_err(|e| WebError::TemplateError(e.to_string()))
    }

    // 密码可以不填, 此时只能依靠快照中的登录状态
    fn fetcher(&self, account: &str, password: Option<&str>) -> Result<SchoolFetcher, WebError> {
        let fetcher = SchoolFetcher::new(&self.config.portal, account)?;
        Ok(match password.filter(|p| !p.is_empty()) {
            Some(p) => fetcher.with_password(p),
            None => fetcher
        })
    }
}

// 账号与可选的密码
#[derive(Debug, Deserialize)]
pub struct AccountForm {
    account: String,
    password: Option<String>
}

#[derive(Debug, Deserialize)]
pub struct ExamForm {
    account: String,
    password: Option<String>,
    year: Option<String>,   // 为空表示全部学年
    term: Option<String>    // 为空表示全部学期
}

#[derive(Debug, Deserialize)]
pub struct ObserveForm {
    group_id: String,
    text: String
}

#[derive(Debug, Deserialize)]
pub struct EchoForm {
    text: String
}

#[derive(Debug, Deserialize)]
pub struct SayQuery {
    seed: Option<String>
}

fn non_blank(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

// 查看绩点
pub async fn gpa_handler(State(state): State<SharedState>, Form(form): Form<AccountForm>) -> Result<String, WebError> {
    debug!(account = %form.account, "收到 GPA 命令");

    let mut fetcher = state.fetcher(&form.account, form.password.as_deref())?;
    let gpa = fetcher.get_gpa().await?;

    let mut context = tera::Context::new();
    context.insert("username", &form.account);
    context.insert("gpa", &format!("{:.3}", round_3decimal(gpa)));
    state.render("gpa.txt", &context)
}

// 查看各科成绩
pub async fn grades_handler(State(state): State<SharedState>, Form(form): Form<AccountForm>) -> Result<String, WebError> {
    let mut fetcher = state.fetcher(&form.account, form.password.as_deref())?;
    let courses = fetcher.get_grades().await?;
    let gpa = calculate_gpa(&courses);

    let mut context = tera::Context::new();
    context.insert("username", &form.account);
    context.insert("courses", &courses);
    context.insert("gpa", &format!("{:.3}", round_3decimal(gpa)));
    state.render("grades.txt", &context)
}

// 查看还没考完的考试
pub async fn exams_handler(State(state): State<SharedState>, Form(form): Form<ExamForm>) -> Result<String, WebError> {
    let mut fetcher = state.fetcher(&form.account, form.password.as_deref())?;
    let exams = fetcher
        .get_exams(non_blank(&form.year), non_blank(&form.term))
        .await?
        .try_collect::<Vec<_>>()
        .await?;

    let upcoming = upcoming_exams(exams, Local::now().naive_local());
    debug!(account = %form.account, count = upcoming.len(), "筛选出未结束的考试");

    let mut context = tera::Context::new();
    context.insert("exams", &upcoming);
    state.render("exams.txt", &context)
}

// 学习群消息, 只处理配置中跟踪的群, 每条消息学完落盘一次
// 写锁内只做序列化, 写文件时已经放开了写锁
pub async fn observe_handler(State(state): State<SharedState>, Form(form): Form<ObserveForm>) -> Result<Json<serde_json::Value>, WebError> {
    if !state.config.markov.is_tracked(&form.group_id) {
        return Ok(Json(json!({"learned": 0})))
    }

    let (learned, pending) = {
        let mut chain = state.markov.write().await;
        let learned = state.tokenizer.learn(&mut chain, &form.text);
        if learned == 0 {
            (0, None)
        } else {
            let content = chain.to_json()?;
            // 先拿到写文件的锁再放开写锁, 旧快照不会盖掉新快照
            let writer = state.snapshot_writer.lock().await;
            (learned, Some((writer, content)))
        }
    };

    if let Some((_writer, content)) = pending {
        write_snapshot(&state.config.markov.snapshot, content).await?;
    }
    debug!(group = %form.group_id, learned, "学习了群消息");

    Ok(Json(json!({"learned": learned})))
}

// 随机说一句话, 可以给出开头
pub async fn say_handler(State(state): State<SharedState>, Query(query): Query<SayQuery>) -> Result<String, WebError> {
    let seed = non_blank(&query.seed)
        .map(|s| state.tokenizer.tokenize(s))
        .unwrap_or_default();

    let tokens = state.markov.read().await.generate(&seed);
    let sentence = render(&tokens);
    info!(sentence = %sentence, "生成了一句话");
    Ok(sentence)
}

// 复读: 你我互换, 是不是 换成 就是, 末尾加感叹号
pub async fn echo_handler(Form(form): Form<EchoForm>) -> String {
    echo(&form.text)
}
