// 配置文件, 所有字段都有默认值, 找不到配置文件时直接使用默认配置
use std::{net::SocketAddr, path::{Path, PathBuf}};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

pub const CONFIG_ENV: &str = "ZJUER_BOT_CONFIG";
pub const DEFAULT_CONFIG_FILE: &str = "config.toml";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub portal: PortalConfig,
    pub markov: MarkovConfig
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: SocketAddr
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { bind: SocketAddr::from(([127, 0, 0, 1], 8080)) }
    }
}

// 统一认证与教务网
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PortalConfig {
    pub cas_base: String,
    pub portal_base: String,
    pub timeout_secs: u64,
    pub cache_dir: PathBuf      // 登录状态快照目录
}

impl Default for PortalConfig {
    fn default() -> Self {
        Self {
            cas_base: "https://zjuam.zju.edu.cn".to_string(),
            portal_base: "http://jwbinfosys.zju.edu.cn".to_string(),
            timeout_secs: 15,
            cache_dir: PathBuf::from("cache")
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MarkovConfig {
    pub order: usize,
    pub snapshot: PathBuf,
    pub tracking_groups: Vec<String>    // 只学习这些群的消息
}

impl Default for MarkovConfig {
    fn default() -> Self {
        Self {
            order: 2,
            snapshot: PathBuf::from("diagram.cache.json"),
            tracking_groups: Vec::new()
        }
    }
}

impl MarkovConfig {
    pub fn is_tracked(&self, group_id: &str) -> bool {
        self.tracking_groups.iter().any(|g| g == group_id)
    }
}

impl AppConfig {
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).context("配置文件格式错误")
    }

    /// 读取配置文件, 文件不存在时返回默认配置
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default())
        }
        let content = std::fs::read_to_string(path).with_context(|| format!("无法读取配置文件 {}", path.display()))?;
        Self::from_toml(&content)
    }

    /// 优先使用环境变量指定的路径
    pub fn load_from_env() -> Result<Self> {
        let path = std::env::var(CONFIG_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_FILE.to_string());
        Self::load(Path::new(&path))
    }
}
