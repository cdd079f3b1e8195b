// 会话 Cookie 的扁平表示, 以及与 reqwest Cookie 罐之间的转换
use std::collections::BTreeMap;

use reqwest::{
    Url,
    cookie::{CookieStore, Jar}
};

// 名字 -> 值, 不区分域名, 和教务网的用法一致
pub type CookieMap = BTreeMap<String, String>;

/// 解析 "a=1; b=2" 形式的 Cookie 头, 可以带 "Cookie:" 前缀
pub fn parse_header_string(input: &str) -> CookieMap {
    let trimmed = input.trim();
    let cookie_str = match trimmed.get(..7) {
        Some(prefix) if prefix.eq_ignore_ascii_case("cookie:") => trimmed[7..].trim(),
        _ => trimmed
    };

    let mut cookies = CookieMap::new();
    for pair in cookie_str.split(';') {
        if let Some((name, value)) = pair.split_once('=') {
            let name = name.trim();
            if !name.is_empty() {
                cookies.insert(name.to_string(), value.trim().to_string());
            }
        }
    }
    cookies
}

/// 把已有的 Cookie 放进罐子, 每个站点各放一份
pub fn seed_jar(jar: &Jar, cookies: &CookieMap, sites: &[&Url]) {
    for site in sites {
        for (name, value) in cookies {
            jar.add_cookie_str(&format!("{}={}; Path=/", name, value), site);
        }
    }
}

/// 取出罐子中会发往该站点的 Cookie
pub fn harvest_jar(jar: &Jar, site: &Url) -> CookieMap {
    jar.cookies(site)
        .and_then(|header| header.to_str().ok().map(parse_header_string))
        .unwrap_or_default()
}
