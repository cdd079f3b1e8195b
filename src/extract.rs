// 从教务网页面中提取数据
// 页面结构固定, 隐藏字段与成绩行用正则, 下拉框与考试表格用 scraper
use crate::models::{Course, Exam, ExamSlot, FetchError};

use lazy_static::lazy_static;
use regex::Regex;
use scraper::{ElementRef, Html, Selector};

// 会话过期时教务网返回的重定向页
pub const LOGIN_EXPIRED_KEYWORD: &str = "<title>Object moved</title>";

lazy_static! {
    static ref EXECUTION: Regex = Regex::new(r#"name="execution" value="(.*?)""#).expect("execution 正则有误");

    // 选课课号 | 课程名称 | 成绩 | 学分 | 绩点 | 补考成绩
    static ref GRADE_ROW: Regex = Regex::new(concat!(
        r"<td>(?P<code>[^<]*)</td>\s*",
        r"<td>(?P<name>[^<]*)</td>\s*",
        r"<td>(?P<score>[^<]*)</td>\s*",
        r"<td>(?P<credit>[^<]*)</td>\s*",
        r"<td>(?P<grade_point>[^<]*)</td>\s*",
        r"<td>(?P<makeup>[^<]*)</td>"
    )).expect("成绩正则有误");
}

const GRADE_HEADER_CODE: &str = "选课课号";

// 考试表格各列的位置
const EXAM_CODE: usize = 0;
const EXAM_NAME: usize = 1;
const EXAM_CREDIT: usize = 2;
const EXAM_RETAKE: usize = 3;
const EXAM_TERM: usize = 5;
const EXAM_FINAL: usize = 6;    // 时间、地点、座位号连续三列
const EXAM_MID: usize = 9;      // 同上
const EXAM_REMARK: usize = 12;
const EXAM_COLUMNS: usize = 13;

pub fn is_session_expired(html: &str) -> bool {
    html.contains(LOGIN_EXPIRED_KEYWORD)
}

/// 统一认证登录页中的一次性 execution 令牌
pub fn extract_execution(html: &str) -> Result<String, FetchError> {
    EXECUTION
        .captures(html)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
        .ok_or_else(|| FetchError::ParseError("登录页中找不到 execution".to_string()))
}

/// 取出 `name="..." value="..."` 形式的表单字段, 如 __VIEWSTATE
pub fn extract_field(html: &str, name: &str) -> Result<String, FetchError> {
    let pattern = format!(r#"name="{}" value="(.*?)""#, regex::escape(name));
    let re = Regex::new(&pattern).map_err(|e| FetchError::ParseError(e.to_string()))?;

    re.captures(html)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
        .ok_or_else(|| FetchError::ParseError(format!("页面中找不到字段 {}", name)))
}

/// 下拉框中所有非空的 option 值
pub fn extract_select_options(html: &str, select_name: &str) -> Result<Vec<String>, FetchError> {
    let document = Html::parse_document(html);
    let select_selector = Selector::parse(&format!(r#"select[name="{}"]"#, select_name))
        .map_err(|e| FetchError::ParseError(e.to_string()))?;
    let option_selector = Selector::parse("option").map_err(|e| FetchError::ParseError(e.to_string()))?;

    let select = document
        .select(&select_selector)
        .next()
        .ok_or_else(|| FetchError::ParseError(format!("页面中找不到下拉框 {}", select_name)))?;

    Ok(select
        .select(&option_selector)
        .filter_map(|option| option.value().attr("value"))
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .collect())
}

fn blank_to_none(text: &str) -> Option<String> {
    let text = text.replace("&nbsp;", " ");
    let text = text.trim();
    if text.is_empty() { None } else { Some(text.to_string()) }
}

/// 按固定的六列格式解析成绩表
pub fn parse_grades(html: &str) -> Vec<Course> {
    GRADE_ROW
        .captures_iter(html)
        .filter(|caps| caps["code"].trim() != GRADE_HEADER_CODE)
        .map(|caps| Course {
            code: caps["code"].trim().to_string(),
            name: caps["name"].trim().to_string(),
            score: caps["score"].trim().to_string(),
            credit: caps["credit"].trim().to_string(),
            grade_point: caps["grade_point"].trim().to_string(),
            makeup_score: blank_to_none(&caps["makeup"])
        })
        .collect()
}

fn cell_text(cell: &ElementRef) -> String {
    // &nbsp; 会被解析成 \u{a0}, trim 可以去掉
    cell.text().collect::<String>().trim().to_string()
}

fn exam_slot(cells: &[ElementRef], start: usize) -> Option<ExamSlot> {
    let time = cell_text(&cells[start]);
    if time.is_empty() {
        return None
    }
    Some(ExamSlot {
        time,
        location: cell_text(&cells[start + 1]),
        seat: cell_text(&cells[start + 2])
    })
}

/// 解析考试查询结果表格, 表头与列数不足的行会被跳过
pub fn parse_exams(html: &str) -> Result<Vec<Exam>, FetchError> {
    let document = Html::parse_document(html);
    let tr_selector = Selector::parse("table#DataGrid1 tr").map_err(|e| FetchError::ParseError(e.to_string()))?;
    let td_selector = Selector::parse("td").map_err(|e| FetchError::ParseError(e.to_string()))?;

    let mut exams = Vec::new();
    for tr in document.select(&tr_selector).skip(1) {
        let cells: Vec<_> = tr.select(&td_selector).collect();
        if cells.len() < EXAM_COLUMNS { continue }

        exams.push(Exam {
            code: cell_text(&cells[EXAM_CODE]),
            name: cell_text(&cells[EXAM_NAME]),
            term: cell_text(&cells[EXAM_TERM]),
            credit: cell_text(&cells[EXAM_CREDIT]),
            retake: cell_text(&cells[EXAM_RETAKE]) == "是",
            final_exam: exam_slot(&cells, EXAM_FINAL),
            midterm: exam_slot(&cells, EXAM_MID),
            remark: cell_text(&cells[EXAM_REMARK])
        });
    }

    Ok(exams)
}
