// 获取数据层
// 统一认证登录, 保存会话 Cookie, 然后在教务网的旧式 ASP.NET 页面上逐页查询
use crate::{
    business::calculate_gpa,
    config::PortalConfig,
    cookies::{self, CookieMap},
    crypto::PublicKey,
    extract,
    models::{Course, Exam, FetchError}
};

use std::{
    collections::VecDeque,
    io::ErrorKind,
    path::PathBuf,
    sync::Arc,
    time::Duration
};

use fake_user_agent::get_rua;
use futures::{
    FutureExt,
    future::BoxFuture,
    stream::{self, BoxStream, StreamExt}
};
use lazy_static::lazy_static;
use reqwest::{Client, RequestBuilder, Url, cookie::Jar};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{debug, info, warn};

// 每次程序启动都随机加载一个 UA
lazy_static! {
    pub static ref USER_AGENT: &'static str = get_rua();
}

// 统一认证成功后才会下发的 Cookie
pub const SESSION_MARKER_COOKIE: &str = "iPlanetDirectoryPro";

// 惰性的考试记录流, 只能遍历一次, 遍历期间借用着爬虫
pub type ExamStream<'a> = BoxStream<'a, Result<Exam, FetchError>>;

// 快照中的密码用 base64 存, 避免明文
mod b64_password {
    use base64::{Engine as _, engine::general_purpose::STANDARD};
    use serde::{Deserialize, Deserializer, Serializer, de::Error};

    pub fn serialize<S: Serializer>(password: &Option<String>, serializer: S) -> Result<S::Ok, S::Error> {
        match password {
            Some(p) => serializer.serialize_some(&STANDARD.encode(p)),
            None => serializer.serialize_none()
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<String>, D::Error> {
        let encoded: Option<String> = Option::deserialize(deserializer)?;
        encoded
            .map(|e| {
                let bytes = STANDARD.decode(e).map_err(D::Error::custom)?;
                String::from_utf8(bytes).map_err(D::Error::custom)
            })
            .transpose()
    }
}

/// 一个用户与教务网之间的会话
/// logged 为 true 时 cookies 中一定有 iPlanetDirectoryPro
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PortalSession {
    pub username: String,
    #[serde(with = "b64_password", default)]
    pub password: Option<String>,
    pub cookies: CookieMap,
    pub logged: bool
}

impl PortalSession {
    pub fn new(username: &str) -> Self {
        Self { username: username.to_string(), ..Self::default() }
    }
}

// 发送请求并读出页面, 非 2xx 视为网络异常
async fn read_page(request: RequestBuilder) -> Result<String, FetchError> {
    let response = request.send().await?;
    let status = response.status();
    if !status.is_success() {
        return Err(FetchError::Io(format!("{} 返回 HTTP {}", response.url(), status)))
    }
    Ok(response.text().await?)
}

fn ensure_alive(page: &str) -> Result<(), FetchError> {
    if extract::is_session_expired(page) {
        return Err(FetchError::SessionExpired)
    }
    Ok(())
}

fn parse_site(base: &str) -> Result<(String, Url), FetchError> {
    let trimmed = base.trim_end_matches('/').to_string();
    let site = Url::parse(&format!("{}/", trimmed)).map_err(|e| FetchError::ParseError(format!("地址 {} 无效: {}", base, e)))?;
    Ok((trimmed, site))
}

/// 统一认证与教务网的各个页面, 本身不保存会话
#[derive(Debug, Clone)]
pub struct Portal {
    cas_base: String,
    cas_site: Url,
    portal_base: String,
    portal_site: Url,
    timeout: Duration
}

impl Portal {
    pub fn new(config: &PortalConfig) -> Result<Self, FetchError> {
        let (cas_base, cas_site) = parse_site(&config.cas_base)?;
        let (portal_base, portal_site) = parse_site(&config.portal_base)?;

        Ok(Self {
            cas_base,
            cas_site,
            portal_base,
            portal_site,
            timeout: Duration::from_secs(config.timeout_secs)
        })
    }

    fn pubkey_url(&self) -> String {
        format!("{}/cas/v2/getPubKey", self.cas_base)
    }

    fn login_url(&self) -> String {
        format!("{}/cas/login?service={}", self.cas_base, self.init_url())
    }

    fn init_url(&self) -> String {
        format!("{}/default2.aspx", self.portal_base)
    }

    fn grades_url(&self, username: &str) -> String {
        format!("{}/xscj.aspx?xh={}", self.portal_base, username)
    }

    fn exams_url(&self, username: &str) -> String {
        format!("{}/xskscx.aspx?xh={}", self.portal_base, username)
    }

    // 每个流程一个客户端, Cookie 罐里预先放好会话已有的 Cookie
    fn client_with_jar(&self, cookies: &CookieMap) -> Result<(Client, Arc<Jar>), FetchError> {
        let jar = Arc::new(Jar::default());
        cookies::seed_jar(&jar, cookies, &[&self.cas_site, &self.portal_site]);

        let client = Client::builder()
            .user_agent(*USER_AGENT)
            .cookie_provider(Arc::clone(&jar))
            .timeout(self.timeout)
            .build()?;

        Ok((client, jar))
    }

    /// 统一认证登录, 三次请求必须共用同一个 Cookie 罐:
    /// 公钥与 _pv0 Cookie 绑定, execution 与登录页的会话绑定
    pub async fn authenticate(&self, username: &str, password: &str) -> Result<CookieMap, FetchError> {
        let (client, jar) = self.client_with_jar(&CookieMap::new())?;

        let key: PublicKey = client
            .get(self.pubkey_url())
            .send().await?
            .error_for_status()?
            .json().await?;
        let encrypted = key.encrypt(password)?;
        debug!("已取得公钥并加密密码");

        let login_url = self.login_url();
        let login_page = read_page(client.get(&login_url)).await?;
        let execution = extract::extract_execution(&login_page)?;

        let form = [
            ("username", username),
            ("password", encrypted.as_str()),
            ("authcode", ""),
            ("execution", execution.as_str()),
            ("_eventId", "submit")
        ];
        // 账号密码错误时服务端照样返回登录页, 只能靠 Cookie 判断
        let response = client.post(&login_url).form(&form).send().await?;
        let status = response.status();

        let cookies = cookies::harvest_jar(&jar, &self.cas_site);
        if !cookies.contains_key(SESSION_MARKER_COOKIE) {
            return Err(FetchError::LoginFailed(format!("账号或密码错误 (HTTP {})", status)))
        }

        Ok(cookies)
    }

    /// 查询成绩: GET 拿 __VIEWSTATE, 再 POST 触发成绩报表
    pub async fn fetch_grades(&self, session: &mut PortalSession) -> Result<Vec<Course>, FetchError> {
        let (client, jar) = self.client_with_jar(&session.cookies)?;

        // 首页会下发 ASP.NET_SessionId
        read_page(client.get(self.init_url())).await?;

        let url = self.grades_url(&session.username);
        let page = read_page(client.get(&url)).await?;
        ensure_alive(&page)?;

        let view_state = extract::extract_field(&page, "__VIEWSTATE")?;
        let button = extract::extract_field(&page, "Button2")?;
        let form = [
            ("__VIEWSTATE", view_state.as_str()),
            ("ddlXN", ""),
            ("ddlXQ", ""),
            ("txtQSCJ", ""),
            ("txtZZCJ", ""),
            ("Button2", button.as_str())
        ];
        let report = read_page(client.post(&url).form(&form)).await?;
        ensure_alive(&report)?;

        session.cookies.extend(cookies::harvest_jar(&jar, &self.portal_site));

        let courses = extract::parse_grades(&report);
        info!(username = %session.username, count = courses.len(), "成绩获取完成");
        Ok(courses)
    }

    /// 打开考试查询页, 得到第一个 __VIEWSTATE 与要遍历的学年 × 学期
    /// 学年或学期为 None 时从页面的下拉框中取全部选项
    pub async fn open_exam_query(
        &self,
        session: &mut PortalSession,
        year: Option<&str>,
        term: Option<&str>
    ) -> Result<ExamQuery, FetchError> {
        let (client, jar) = self.client_with_jar(&session.cookies)?;

        read_page(client.get(self.init_url())).await?;

        let url = self.exams_url(&session.username);
        let page = read_page(client.get(&url)).await?;
        ensure_alive(&page)?;

        let view_state = extract::extract_field(&page, "__VIEWSTATE")?;
        let years = match year {
            Some(y) => vec![y.to_string()],
            None => extract::extract_select_options(&page, "xnd")?
        };
        let terms = match term {
            Some(t) => vec![t.to_string()],
            None => extract::extract_select_options(&page, "xqd")?
        };

        let combos: VecDeque<(String, String)> = years
            .iter()
            .flat_map(|y| terms.iter().map(move |t| (y.clone(), t.clone())))
            .collect();
        debug!(combos = combos.len(), "考试查询页已打开");

        session.cookies.extend(cookies::harvest_jar(&jar, &self.portal_site));

        Ok(ExamQuery { client, url, view_state, combos })
    }
}

/// 进行中的考试查询, 每个学年 × 学期提交一次表单
/// 每次响应中的 __VIEWSTATE 要带到下一次提交, 所以只能顺序进行
pub struct ExamQuery {
    client: Client,
    url: String,
    view_state: String,
    combos: VecDeque<(String, String)>
}

impl ExamQuery {
    pub fn remaining(&self) -> usize {
        self.combos.len()
    }

    // 重新登录后换上新会话的客户端和 __VIEWSTATE, 剩下的学年 × 学期不变
    fn resume(&mut self, fresh: ExamQuery) {
        self.client = fresh.client;
        self.url = fresh.url;
        self.view_state = fresh.view_state;
    }

    async fn fetch_page(&mut self, year: &str, term: &str) -> Result<Vec<Exam>, FetchError> {
        let form = [
            ("__EVENTTARGET", "xqd"),
            ("__EVENTARGUMENT", ""),
            ("__VIEWSTATE", self.view_state.as_str()),
            ("xnd", year),
            ("xqd", term)
        ];
        let page = read_page(self.client.post(&self.url).form(&form)).await?;
        ensure_alive(&page)?;

        // 新页面没有 __VIEWSTATE 时沿用旧的
        if let Ok(view_state) = extract::extract_field(&page, "__VIEWSTATE") {
            self.view_state = view_state;
        }

        let exams = extract::parse_exams(&page)?;
        debug!(year, term, count = exams.len(), "考试页解析完成");
        Ok(exams)
    }
}

// 考试流的状态: 爬虫本身要留在流里, 中途过期时才能重新登录
struct ExamWalk<'a> {
    fetcher: &'a mut SchoolFetcher,
    query: ExamQuery
}

/// 带登录状态缓存的教务网爬虫
pub struct SchoolFetcher {
    portal: Portal,
    session: PortalSession,
    cache_dir: PathBuf
}

impl SchoolFetcher {
    pub fn new(config: &PortalConfig, username: &str) -> Result<Self, FetchError> {
        Ok(Self {
            portal: Portal::new(config)?,
            session: PortalSession::new(username),
            cache_dir: config.cache_dir.clone()
        })
    }

    /// 仅保存在内存中, 登录成功后才会写入快照
    pub fn with_password(mut self, password: &str) -> Self {
        self.session.password = Some(password.to_string());
        self
    }

    pub fn session(&self) -> &PortalSession {
        &self.session
    }

    pub fn is_logged(&self) -> bool {
        self.session.logged
    }

    // 学号只会有字母数字, 其他字符一律丢掉, 防止拼出奇怪的路径
    fn snapshot_path(&self) -> PathBuf {
        let safe_name: String = self.session.username
            .chars()
            .filter(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '-')
            .collect();
        self.cache_dir.join(format!("{}.cache", safe_name))
    }

    /// 覆盖写入该用户的会话快照
    pub async fn save_snapshot(&self) -> Result<(), FetchError> {
        let content = serde_json::to_string(&self.session).map_err(|e| FetchError::ParseError(e.to_string()))?;
        fs::create_dir_all(&self.cache_dir).await.map_err(|e| FetchError::Io(e.to_string()))?;
        fs::write(self.snapshot_path(), content).await.map_err(|e| FetchError::Io(e.to_string()))?;
        Ok(())
    }

    // 看到过期页后立即标记, 快照也一起更新, 写不进去只记日志
    async fn mark_expired(&mut self) {
        self.session.logged = false;
        if let Err(e) = self.save_snapshot().await {
            warn!(username = %self.session.username, error = %e, "无法更新会话快照");
        }
    }

    /// 从快照恢复会话, 快照不存在时返回 Ok(false)
    /// 内存中已有的密码优先于快照中的密码
    pub async fn restore_snapshot(&mut self) -> Result<bool, FetchError> {
        let content = match fs::read_to_string(self.snapshot_path()).await {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(FetchError::Io(e.to_string()))
        };

        let saved: PortalSession = serde_json::from_str(&content).map_err(|e| FetchError::ParseError(format!("快照已损坏: {}", e)))?;
        if saved.username != self.session.username {
            return Err(FetchError::ParseError(format!("快照属于 {}, 不是 {}", saved.username, self.session.username)))
        }

        // 没有 iPlanetDirectoryPro 的快照不能算已登录
        let logged = saved.logged && saved.cookies.contains_key(SESSION_MARKER_COOKIE);
        self.session = PortalSession {
            password: self.session.password.take().or(saved.password),
            username: saved.username,
            cookies: saved.cookies,
            logged
        };
        Ok(self.session.logged)
    }

    /// 登录并写入快照, 会覆盖该用户之前的快照
    pub async fn login(&mut self, username: &str, password: &str) -> Result<(), FetchError> {
        info!(username, "正在登录统一认证");
        let cookies = self.portal.authenticate(username, password).await?;

        self.session = PortalSession {
            username: username.to_string(),
            password: Some(password.to_string()),
            cookies,
            logged: true
        };
        self.save_snapshot().await?;

        info!(username, "登录成功");
        Ok(())
    }

    // 过期后用已知的账号密码重新登录, 没有密码就只能放弃
    async fn relogin(&mut self) -> Result<(), FetchError> {
        let Some(password) = self.session.password.clone() else {
            return Err(FetchError::SessionExpired)
        };
        let username = self.session.username.clone();
        self.login(&username, &password).await
    }

    /// 保证已登录后执行 op, 遇到会话过期时重新登录并且只重试一次
    pub async fn login_acquired<T, F>(&mut self, op: F) -> Result<T, FetchError>
    where
        F: for<'a> Fn(&'a Portal, &'a mut PortalSession) -> BoxFuture<'a, Result<T, FetchError>>
    {
        if !self.session.logged {
            match self.restore_snapshot().await {
                Ok(true) => debug!(username = %self.session.username, "已从快照恢复登录状态"),
                Ok(false) => {}
                Err(e) => warn!(username = %self.session.username, error = %e, "无法从快照恢复登录状态, 已忽略")
            }
        }

        if !self.session.logged && self.session.password.is_some() {
            self.relogin().await?;
        }

        if !self.session.logged {
            return Err(FetchError::NotLoggedIn)
        }

        match op(&self.portal, &mut self.session).await {
            Err(FetchError::SessionExpired) => {
                warn!(username = %self.session.username, "登录状态已过期, 重新登录后重试");
                self.mark_expired().await;
                self.relogin().await?;

                let result = op(&self.portal, &mut self.session).await;
                if matches!(result, Err(FetchError::SessionExpired)) {
                    self.mark_expired().await;
                }
                result
            }
            result => result
        }
    }

    pub async fn get_grades(&mut self) -> Result<Vec<Course>, FetchError> {
        self.login_acquired(|portal, session| portal.fetch_grades(session).boxed()).await
    }

    /// 遍历学年 × 学期的考试安排, 不做去重
    /// 流是惰性的, 每次取到新的一页才提交一次表单
    pub async fn get_exams(&mut self, year: Option<&str>, term: Option<&str>) -> Result<ExamStream<'_>, FetchError> {
        let year = year.map(str::to_string);
        let term = term.map(str::to_string);
        let query = self.login_acquired(move |portal, session| {
            let (year, term) = (year.clone(), term.clone());
            async move {
                portal.open_exam_query(session, year.as_deref(), term.as_deref()).await
            }.boxed()
        }).await?;

        info!(username = %self.session.username, pages = query.remaining(), "开始查询考试");

        let walk = ExamWalk { fetcher: self, query };
        let pages = stream::unfold(Some(walk), |state| async move {
            let mut walk = state?;
            let (year, term) = walk.query.combos.pop_front()?;
            match walk.fetcher.exam_page(&mut walk.query, &year, &term).await {
                Ok(exams) => Some((Ok(exams), Some(walk))),
                Err(e) => Some((Err(e), None))     // 出错后流结束
            }
        });

        Ok(pages
            .flat_map(|page| {
                let items: Vec<Result<Exam, FetchError>> = match page {
                    Ok(exams) => exams.into_iter().map(Ok).collect(),
                    Err(e) => vec![Err(e)]
                };
                stream::iter(items)
            })
            .boxed())
    }

    // 查询一页, 过期时重新登录并重新打开查询页, 再提交同一个学年 × 学期, 只重试一次
    async fn exam_page(&mut self, query: &mut ExamQuery, year: &str, term: &str) -> Result<Vec<Exam>, FetchError> {
        match query.fetch_page(year, term).await {
            Err(FetchError::SessionExpired) => {
                warn!(username = %self.session.username, year, term, "查询考试时登录状态过期, 重新登录后重试");
                self.mark_expired().await;
                self.relogin().await?;

                let result = match self.portal.open_exam_query(&mut self.session, Some(year), Some(term)).await {
                    Ok(fresh) => {
                        query.resume(fresh);
                        query.fetch_page(year, term).await
                    }
                    Err(e) => Err(e)
                };
                if matches!(result, Err(FetchError::SessionExpired)) {
                    self.mark_expired().await;
                }
                result
            }
            result => result
        }
    }

    pub async fn get_gpa(&mut self) -> Result<Decimal, FetchError> {
        let courses = self.get_grades().await?;
        Ok(calculate_gpa(&courses))
    }
}
