#![allow(dead_code)]

use axum::{
    Form, Json, Router,
    extract::State,
    http::{HeaderMap, StatusCode, header},
    response::{Html, IntoResponse, Response},
    routing::get
};
use serde_json::json;
use std::{
    collections::{BTreeMap, HashMap},
    path::Path,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering}
    },
    time::Duration
};
use tokio::{net::TcpListener, task::JoinHandle};
use zjuer_bot::{config::PortalConfig, cookies::parse_header_string, crypto::encrypt_password};

pub const USERNAME: &str = "3220100001";
pub const PASSWORD: &str = "correct-horse-42";

const MODULUS: &str = "c5f3a9e1d7b24f6085c3e9a1b7d2f4e3b1a9c7e5d3f1a2b4c6d8e0f1a3b5c7d9";
const EXPONENT: &str = "10001";
const EXECUTION: &str = "e1s1";
const PRE_SESSION: &str = "pv-challenge";
const GRADES_VIEW_STATE: &str = "dDwtMTIzNDU2Nzg5Ozs+";
const GRADES_BUTTON: &str = "在校成绩查询";

const EXPIRED_PAGE: &str = "<html><head><title>Object moved</title></head><body><h2>Object moved to <a href=\"/default2.aspx\">here</a>.</h2></body></html>";

pub const YEARS: [&str; 2] = ["2022-2023", "2023-2024"];
pub const TERMS: [&str; 2] = ["1|秋、冬", "2|春、夏"];

/// 计数器与开关, 测试通过它观察和操纵模拟教务网
#[derive(Default)]
pub struct PortalState {
    pub logins: AtomicUsize,
    pub grade_pages: AtomicUsize,
    pub exam_posts: AtomicUsize,
    pub always_expired: AtomicBool,
    pub slow_pubkey: AtomicBool,
    valid_token: Mutex<Option<String>>,
    exam_view_state: Mutex<String>
}

impl PortalState {
    /// 让所有已发出的 iPlanetDirectoryPro 失效
    pub fn expire_sessions(&self) {
        *self.valid_token.lock().unwrap() = None;
    }

    pub fn logins(&self) -> usize {
        self.logins.load(Ordering::SeqCst)
    }

    fn alive(&self, headers: &HeaderMap) -> bool {
        if self.always_expired.load(Ordering::SeqCst) {
            return false
        }
        let cookies = cookies_of(headers);
        let valid = self.valid_token.lock().unwrap();
        matches!((cookies.get("iPlanetDirectoryPro"), valid.as_ref()), (Some(sent), Some(valid)) if sent == valid)
    }
}

fn cookies_of(headers: &HeaderMap) -> BTreeMap<String, String> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| parse_header_string(v))
        .collect()
}

fn field<'a>(form: &'a HashMap<String, String>, name: &str) -> &'a str {
    form.get(name).map(String::as_str).unwrap_or("")
}

/// 本地模拟的统一认证 + 教务网, 不需要外网
pub struct MockPortal {
    pub base_url: String,
    pub state: Arc<PortalState>,
    _task: JoinHandle<()>
}

impl MockPortal {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("failed to bind mock portal");
        let base_url = format!("http://{}", listener.local_addr().unwrap());
        let state = Arc::new(PortalState::default());

        let app = Router::new()
            .route("/cas/v2/getPubKey", get(pubkey))
            .route("/cas/login", get(login_page).post(login_submit))
            .route("/default2.aspx", get(init_page))
            .route("/xscj.aspx", get(grades_page).post(grades_report))
            .route("/xskscx.aspx", get(exams_page).post(exams_report))
            .with_state(Arc::clone(&state));

        let task = tokio::spawn(async move {
            axum::serve(listener, app).await.expect("mock portal failed");
        });

        Self { base_url, state, _task: task }
    }

    pub fn config(&self, cache_dir: &Path) -> PortalConfig {
        PortalConfig {
            cas_base: self.base_url.clone(),
            portal_base: self.base_url.clone(),
            timeout_secs: 1,
            cache_dir: cache_dir.to_path_buf()
        }
    }
}

async fn pubkey(State(state): State<Arc<PortalState>>) -> impl IntoResponse {
    if state.slow_pubkey.load(Ordering::SeqCst) {
        tokio::time::sleep(Duration::from_secs(3)).await;
    }
    (
        [(header::SET_COOKIE, format!("_pv0={}; Path=/", PRE_SESSION))],
        Json(json!({"modulus": MODULUS, "exponent": EXPONENT}))
    )
}

fn cas_form(error: &str) -> String {
    format!(
        r#"<html><body><form id="fm1" method="post"><span class="error">{}</span>
<input type="hidden" name="execution" value="{}"/><input type="hidden" name="_eventId" value="submit"/></form></body></html>"#,
        error, EXECUTION
    )
}

async fn login_page() -> impl IntoResponse {
    ([(header::SET_COOKIE, "JSESSIONID=cas-session; Path=/")], Html(cas_form("")))
}

async fn login_submit(
    State(state): State<Arc<PortalState>>,
    headers: HeaderMap,
    Form(form): Form<HashMap<String, String>>
) -> Response {
    let cookies = cookies_of(&headers);
    let expected = encrypt_password(PASSWORD, EXPONENT, MODULUS).unwrap();

    // 公钥与登录页的 Cookie 都必须带上, 否则挑战对不上
    let handshake_ok = cookies.get("_pv0").map(String::as_str) == Some(PRE_SESSION)
        && cookies.contains_key("JSESSIONID")
        && field(&form, "execution") == EXECUTION
        && field(&form, "_eventId") == "submit";
    let credentials_ok = field(&form, "username") == USERNAME && field(&form, "password") == expected;

    if !(handshake_ok && credentials_ok) {
        return Html(cas_form("用户名或密码错误")).into_response()
    }

    let n = state.logins.fetch_add(1, Ordering::SeqCst) + 1;
    let token = format!("AQIC-token-{}", n);
    *state.valid_token.lock().unwrap() = Some(token.clone());

    (
        StatusCode::FOUND,
        [
            (header::LOCATION, "/default2.aspx".to_string()),
            (header::SET_COOKIE, format!("iPlanetDirectoryPro={}; Path=/", token))
        ]
    ).into_response()
}

async fn init_page() -> impl IntoResponse {
    ([(header::SET_COOKIE, "ASP.NET_SessionId=asp-session; Path=/")], Html("<html><title>现代教学管理信息系统</title></html>"))
}

async fn grades_page(State(state): State<Arc<PortalState>>, headers: HeaderMap) -> Response {
    state.grade_pages.fetch_add(1, Ordering::SeqCst);
    if !state.alive(&headers) {
        return Html(EXPIRED_PAGE).into_response()
    }

    Html(format!(
        r#"<html><body><form name="Form1" method="post" action="xscj.aspx?xh={}">
<input type="hidden" name="__VIEWSTATE" value="{}" />
<select name="ddlXN"><option value=""></option></select>
<input type="submit" name="Button2" value="{}" id="Button2" /></form></body></html>"#,
        USERNAME, GRADES_VIEW_STATE, GRADES_BUTTON
    )).into_response()
}

async fn grades_report(
    State(state): State<Arc<PortalState>>,
    headers: HeaderMap,
    Form(form): Form<HashMap<String, String>>
) -> Response {
    if !state.alive(&headers) {
        return Html(EXPIRED_PAGE).into_response()
    }
    if field(&form, "__VIEWSTATE") != GRADES_VIEW_STATE
        || field(&form, "Button2") != GRADES_BUTTON
        || !cookies_of(&headers).contains_key("ASP.NET_SessionId")
    {
        return (StatusCode::BAD_REQUEST, "view state mismatch").into_response()
    }

    Html(r#"<html><body><table class="datelist" id="DataGrid1">
<tr class="datelisthead"><td>选课课号</td><td>课程名称</td><td>成绩</td><td>学分</td><td>绩点</td><td>补考成绩</td></tr>
<tr><td>(2022-2023-1)-211G0200-0094154-1</td><td>微积分（甲）Ⅰ</td><td>95</td><td>4.0</td><td>4.0</td><td>&nbsp;</td></tr>
<tr><td>(2022-2023-1)-061B9090-0093006-1</td><td>线性代数</td><td>85</td><td>2.0</td><td>3.0</td><td>&nbsp;</td></tr>
<tr><td>(2022-2023-1)-031E0010-0096177-2</td><td>思想道德与法治</td><td>合格</td><td>1.0</td><td>4.0</td><td>&nbsp;</td></tr>
</table></body></html>"#).into_response()
}

fn exam_form(view_state: &str, rows: &str) -> String {
    let years: String = YEARS.iter().map(|y| format!(r#"<option value="{0}">{0}</option>"#, y)).collect();
    let terms: String = TERMS.iter().map(|t| format!(r#"<option value="{}">{}</option>"#, t, &t[2..])).collect();
    format!(
        r#"<html><body><form name="Form1" method="post" action="xskscx.aspx?xh={}">
<input type="hidden" name="__VIEWSTATE" value="{}" />
<select name="xnd" id="xnd">{}</select>
<select name="xqd" id="xqd">{}</select>
<table class="datelist" id="DataGrid1">
<tr class="datelisthead"><td>选课课号</td><td>课程名称</td><td>学分</td><td>重修标记</td><td>姓名</td><td>学期</td><td>考试时间</td><td>考试地点</td><td>考试座位号</td><td>期中考试时间</td><td>期中考试地点</td><td>期中座位号</td><td>备注</td></tr>
{}
</table></form></body></html>"#,
        USERNAME, view_state, years, terms, rows
    )
}

async fn exams_page(State(state): State<Arc<PortalState>>, headers: HeaderMap) -> Response {
    if !state.alive(&headers) {
        return Html(EXPIRED_PAGE).into_response()
    }
    *state.exam_view_state.lock().unwrap() = "vs-0".to_string();
    Html(exam_form("vs-0", "")).into_response()
}

async fn exams_report(
    State(state): State<Arc<PortalState>>,
    headers: HeaderMap,
    Form(form): Form<HashMap<String, String>>
) -> Response {
    if !state.alive(&headers) {
        return Html(EXPIRED_PAGE).into_response()
    }

    // 必须带上一次响应中的 __VIEWSTATE
    let mut view_state = state.exam_view_state.lock().unwrap();
    if field(&form, "__VIEWSTATE") != view_state.as_str() || field(&form, "__EVENTTARGET") != "xqd" {
        return (StatusCode::BAD_REQUEST, "view state mismatch").into_response()
    }

    let n = state.exam_posts.fetch_add(1, Ordering::SeqCst) + 1;
    *view_state = format!("vs-{}", n);

    let year = field(&form, "xnd");
    let term = field(&form, "xqd");
    let row = format!(
        "<tr><td>({0})-EXAM-{1}</td><td>{0} {1} 考试</td><td>2.0</td><td>否</td><td>张三</td><td>{2}</td><td>2099年01月15日(14:00-16:00)</td><td>紫金港东1A-101</td><td>{1}</td><td>&nbsp;</td><td>&nbsp;</td><td>&nbsp;</td><td>&nbsp;</td></tr>",
        year, n, term
    );
    Html(exam_form(&view_state, &row)).into_response()
}
