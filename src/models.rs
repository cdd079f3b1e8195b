// 结构体与自定义异常
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response}
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

// 成绩单中的一行
// 成绩、学分、绩点都保留原文, 成绩可能是 "合格" 之类的非数字文本
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Course {
    pub code: String,               // 选课课号
    pub name: String,               // 课程名称
    pub score: String,              // 成绩
    pub credit: String,             // 学分
    pub grade_point: String,        // 绩点
    pub makeup_score: Option<String> // 补考成绩, 没有补考则为 None
}

impl Course {
    pub fn score_value(&self) -> Option<Decimal> {
        parse_number(&self.score)
    }

    pub fn credit_value(&self) -> Option<Decimal> {
        parse_number(&self.credit)
    }

    pub fn grade_point_value(&self) -> Option<Decimal> {
        parse_number(&self.grade_point)
    }

    /// 成绩、学分、绩点都是数字时才参与 GPA 计算
    pub fn is_gpa_eligible(&self) -> bool {
        self.score_value().is_some() && self.credit_value().is_some() && self.grade_point_value().is_some()
    }
}

fn parse_number(text: &str) -> Option<Decimal> {
    text.trim().parse::<Decimal>().ok()
}

// 一场考试的安排(期末或期中)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExamSlot {
    pub time: String,       // 形如 2024年01月15日(14:00-16:00)
    pub location: String,   // 考试地点
    pub seat: String        // 座位号
}

// 考试查询中的一行
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Exam {
    pub code: String,
    pub name: String,
    pub term: String,
    pub credit: String,
    pub retake: bool,               // 重修标记
    pub final_exam: Option<ExamSlot>,
    pub midterm: Option<ExamSlot>,
    pub remark: String
}

impl Exam {
    /// 期末和期中都没有时间的记录不值得展示
    pub fn is_scheduled(&self) -> bool {
        self.final_exam.is_some() || self.midterm.is_some()
    }
}

// 教务网爬取异常
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("登录失败: {0}")]
    LoginFailed(String),

    #[error("登录状态已过期")]
    SessionExpired,

    #[error("尚未登录, 也没有可用的密码")]
    NotLoggedIn,

    #[error("网络或读写异常: {0}")]
    Io(String),

    #[error("解析异常: {0}")]
    ParseError(String)
}

// 超时与连接失败都归为 Io, 响应体无法解码归为 ParseError
impl From<reqwest::Error> for FetchError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            FetchError::Io(format!("请求超时: {}", err))
        } else if err.is_decode() {
            FetchError::ParseError(err.to_string())
        } else {
            FetchError::Io(err.to_string())
        }
    }
}

// 马尔可夫链快照异常
#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("快照读写失败: {0}")]
    Io(#[from] std::io::Error),

    #[error("快照格式错误: {0}")]
    Format(String)
}

impl From<serde_json::Error> for SnapshotError {
    fn from(err: serde_json::Error) -> Self {
        SnapshotError::Format(err.to_string())
    }
}

// 命令服务异常
#[derive(Debug, Error)]
pub enum WebError {
    #[error("模板渲染失败: {0}")]
    TemplateError(String),

    #[error("教务网错误: {0}")]
    FetchError(#[from] FetchError),

    #[error("快照错误: {0}")]
    SnapshotError(#[from] SnapshotError),

    #[error("内部错误: {0}")]
    InternalError(String)
}

// 根据 Axum 库的要求, 需要实现 IntoResponse
impl IntoResponse for WebError {
    fn into_response(self) -> Response {
        let status = match &self {
            WebError::FetchError(FetchError::LoginFailed(_) | FetchError::NotLoggedIn) => StatusCode::UNAUTHORIZED,
            WebError::FetchError(FetchError::SessionExpired) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR
        };

        (status, self.to_string()).into_response()
    }
}
