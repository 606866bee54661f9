//! 最小化的 SIP URI 模型
//!
//! 只覆盖会议地址分配需要的部分：scheme、user、host、port 与 URI 参数。
//! `sip:user@host:port;key=value;flag` 形式的解析与格式化。

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum UriParseError {
    #[error("unknown SIP scheme in [{0}]")]
    UnknownScheme(String),
    #[error("missing host in [{0}]")]
    MissingHost(String),
    #[error("invalid port in [{0}]")]
    InvalidPort(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SipScheme {
    Sip,
    Sips,
}

impl fmt::Display for SipScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SipScheme::Sip => f.write_str("sip"),
            SipScheme::Sips => f.write_str("sips"),
        }
    }
}

/// 拥有所有权的 SIP URI
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SipUri {
    pub scheme: SipScheme,
    pub user: Option<String>,
    pub host: String,
    pub port: Option<u16>,
    /// URI 参数，值为 None 的是布尔参数（如 `;lr`）
    pub params: Vec<(String, Option<String>)>,
}

impl SipUri {
    pub fn new(scheme: SipScheme, user: Option<String>, host: impl Into<String>) -> Self {
        Self {
            scheme,
            user,
            host: host.into(),
            port: None,
            params: Vec::new(),
        }
    }

    /// 替换 user 部分
    pub fn set_user(&mut self, user: impl Into<String>) {
        self.user = Some(user.into());
    }

    pub fn user(&self) -> Option<&str> {
        self.user.as_deref()
    }

    /// 按键查参数值
    pub fn param(&self, key: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(k, _)| k == key)
            .and_then(|(_, v)| v.as_deref())
    }
}

impl FromStr for SipUri {
    type Err = UriParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (scheme, rest) = if let Some(rest) = s.strip_prefix("sips:") {
            (SipScheme::Sips, rest)
        } else if let Some(rest) = s.strip_prefix("sip:") {
            (SipScheme::Sip, rest)
        } else {
            return Err(UriParseError::UnknownScheme(s.to_string()));
        };

        let mut parts = rest.split(';');
        let authority = parts.next().unwrap_or("");
        let params = parts
            .map(|param| match param.split_once('=') {
                Some((key, value)) => (key.to_string(), Some(value.to_string())),
                None => (param.to_string(), None),
            })
            .collect();

        let (user, host_port) = match authority.split_once('@') {
            Some((user, host_port)) => (Some(user.to_string()), host_port),
            None => (None, authority),
        };

        let (host, port) = match host_port.split_once(':') {
            Some((host, port)) => {
                let port = port
                    .parse::<u16>()
                    .map_err(|_| UriParseError::InvalidPort(s.to_string()))?;
                (host, Some(port))
            }
            None => (host_port, None),
        };
        if host.is_empty() {
            return Err(UriParseError::MissingHost(s.to_string()));
        }

        Ok(Self {
            scheme,
            user,
            host: host.to_string(),
            port,
            params,
        })
    }
}

impl fmt::Display for SipUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:", self.scheme)?;
        if let Some(user) = &self.user {
            write!(f, "{user}@")?;
        }
        f.write_str(&self.host)?;
        if let Some(port) = self.port {
            write!(f, ":{port}")?;
        }
        for (key, value) in &self.params {
            match value {
                Some(value) => write!(f, ";{key}={value}")?,
                None => write!(f, ";{key}")?,
            }
        }
        Ok(())
    }
}
