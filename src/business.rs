// 业务逻辑层 - 处理获取到的数据
use crate::models::{Course, Exam, ExamSlot};

use chrono::{NaiveDate, NaiveDateTime};
use lazy_static::lazy_static;
use regex::Regex;
use rust_decimal::Decimal;

lazy_static! {
    // 2024年01月15日(14:00-16:00)
    static ref EXAM_TIME: Regex = Regex::new(
        r"(\d{4})年(\d{1,2})月(\d{1,2})日\s*[(（](\d{1,2}):(\d{2})\s*-\s*(\d{1,2}):(\d{2})[)）]"
    ).expect("考试时间正则有误");
}

/// 按学分加权的平均绩点
/// 只有成绩、学分、绩点都是数字的课程参与计算, 总学分为 0 时返回 0
pub fn calculate_gpa(courses: &[Course]) -> Decimal {
    let mut total_credits = Decimal::ZERO;
    let mut total_weighted = Decimal::ZERO;

    for course in courses.iter().filter(|c| c.is_gpa_eligible()) {
        // is_gpa_eligible 已经保证能解析
        let (Some(credit), Some(grade_point)) = (course.credit_value(), course.grade_point_value()) else {
            continue
        };
        total_credits += credit;
        total_weighted += credit * grade_point;
    }

    if total_credits > Decimal::ZERO {
        total_weighted / total_credits
    } else {
        Decimal::ZERO
    }
}

/// 保留小数点后3位, 用于回复展示
pub fn round_3decimal(d: Decimal) -> Decimal {
    d.round_dp(3)
}

/// 解析考试时间, 返回开始与结束时刻
pub fn parse_exam_time(text: &str) -> Option<(NaiveDateTime, NaiveDateTime)> {
    let caps = EXAM_TIME.captures(text)?;
    let num = |i: usize| caps.get(i).and_then(|m| m.as_str().parse::<u32>().ok());

    let year = caps.get(1)?.as_str().parse::<i32>().ok()?;
    let date = NaiveDate::from_ymd_opt(year, num(2)?, num(3)?)?;
    let start = date.and_hms_opt(num(4)?, num(5)?, 0)?;
    let end = date.and_hms_opt(num(6)?, num(7)?, 0)?;

    Some((start, end))
}

// 无法解析的时间视为尚未结束, 宁可多展示
fn slot_is_upcoming(slot: &ExamSlot, now: NaiveDateTime) -> bool {
    match parse_exam_time(&slot.time) {
        Some((_, end)) => end > now,
        None => true
    }
}

fn earliest_start(exam: &Exam) -> Option<NaiveDateTime> {
    [&exam.final_exam, &exam.midterm]
        .into_iter()
        .flatten()
        .filter_map(|slot| parse_exam_time(&slot.time).map(|(start, _)| start))
        .min()
}

/// 筛选出还没考完的考试, 按最早开考时间排序, 时间无法解析的排在最后
pub fn upcoming_exams<I>(exams: I, now: NaiveDateTime) -> Vec<Exam>
where
    I: IntoIterator<Item = Exam>
{
    let mut upcoming: Vec<Exam> = exams
        .into_iter()
        .filter(|e| e.is_scheduled())
        .filter(|e| [&e.final_exam, &e.midterm].into_iter().flatten().any(|slot| slot_is_upcoming(slot, now)))
        .collect();

    // Option 中 None 比 Some 小, 所以先按 is_none 排
    upcoming.sort_by_key(|e| {
        let start = earliest_start(e);
        (start.is_none(), start)
    });

    upcoming
}
