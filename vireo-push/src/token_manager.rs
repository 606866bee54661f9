//! FCM v1 access token 管理
//!
//! 每个 service account 一个实例。token 由进程外的辅助脚本换取
//! （脚本用 service account 私钥签 JWT 并向 OAuth2 端点换 access token），
//! 本模块负责：
//! - 解析 service account JSON（加载失败是构造期的终态错误）
//! - 在 token 过期前按提前量主动刷新，刷新频率有下限
//! - 单航道刷新：并发需求合并到同一次进行中的刷新
//! - 刷新失败指数退避；旧 token 过期后绝不返回过期 token

use std::path::PathBuf;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokio::process::Command;
use tokio::sync::{Mutex, watch};
use tracing::{debug, info, warn};

use crate::error::PushError;

/// 刷新失败退避的封顶值
const MAX_REFRESH_BACKOFF: Duration = Duration::from_secs(3600);

/// 带绝对过期时间的 OAuth2 bearer token
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessToken {
    pub token: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl AccessToken {
    /// 在提前量窗口内仍然可用
    pub fn is_usable(&self, anticipation: chrono::Duration) -> bool {
        Utc::now() + anticipation < self.expires_at
    }
}

#[derive(Debug, Deserialize)]
struct ServiceAccount {
    project_id: String,
}

#[derive(Debug, Deserialize)]
struct HelperOutput {
    access_token: String,
    expires_in: i64,
}

struct RefreshGate {
    last_attempt: Option<Instant>,
    consecutive_failures: u32,
}

/// access token 管理器
///
/// 状态推进：Uninitialized →（后台任务或首个请求触发）Refreshing → Ready →
/// Refreshing → …；仅当 service account 文件无法加载时构造失败。
pub struct TokenManager {
    project_id: String,
    script_path: PathBuf,
    account_path: PathBuf,
    refresh_floor: Duration,
    anticipation: chrono::Duration,
    current: watch::Sender<Option<AccessToken>>,
    gate: Mutex<RefreshGate>,
}

impl TokenManager {
    /// 加载 service account 并启动后台预刷新任务
    ///
    /// 必须在 tokio runtime 内调用。
    pub fn new(
        script_path: PathBuf,
        account_path: PathBuf,
        refresh_floor: Duration,
        anticipation: Duration,
    ) -> Result<Arc<Self>, PushError> {
        let raw = std::fs::read_to_string(&account_path).map_err(|err| {
            PushError::InvalidServiceAccount(format!(
                "cannot read [{}]: {err}",
                account_path.display()
            ))
        })?;
        let account: ServiceAccount = serde_json::from_str(&raw).map_err(|err| {
            PushError::InvalidServiceAccount(format!(
                "cannot parse [{}]: {err}",
                account_path.display()
            ))
        })?;

        let (current, _) = watch::channel(None);
        let manager = Arc::new(Self {
            project_id: account.project_id,
            script_path,
            account_path,
            refresh_floor,
            anticipation: chrono::Duration::seconds(anticipation.as_secs() as i64),
            current,
            gate: Mutex::new(RefreshGate {
                last_attempt: None,
                consecutive_failures: 0,
            }),
        });

        tokio::spawn(refresh_loop(Arc::downgrade(&manager)));
        Ok(manager)
    }

    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    /// 订阅 token 发布
    pub fn subscribe(&self) -> watch::Receiver<Option<AccessToken>> {
        self.current.subscribe()
    }

    /// 当前仍在可用窗口内的 token
    pub fn usable_token(&self) -> Option<AccessToken> {
        self.current
            .borrow()
            .clone()
            .filter(|token| token.is_usable(self.anticipation))
    }

    /// 获取一个可用 token，必要时触发刷新并等待
    ///
    /// 超过 `wait_timeout` 仍未拿到 → [`PushError::TokenUnavailable`]。
    pub async fn token(&self, wait_timeout: Duration) -> Result<AccessToken, PushError> {
        if let Some(token) = self.usable_token() {
            return Ok(token);
        }
        match tokio::time::timeout(wait_timeout, self.refresh()).await {
            Ok(result) => result,
            Err(_) => Err(PushError::TokenUnavailable),
        }
    }

    /// 单航道刷新
    ///
    /// 先到者执行刷新，其余调用者在锁上排队；拿到锁后重查当前 token，
    /// 等待期间已完成的刷新直接复用，保证并发需求观察到同一个 token。
    async fn refresh(&self) -> Result<AccessToken, PushError> {
        let mut gate = self.gate.lock().await;
        if let Some(token) = self.usable_token() {
            return Ok(token);
        }

        // 刷新频率下限与失败退避：还在静默窗口内时不再调起辅助进程
        if let Some(last) = gate.last_attempt {
            let quiet = self.refresh_backoff(gate.consecutive_failures);
            if last.elapsed() < quiet {
                return Err(PushError::TokenUnavailable);
            }
        }

        debug!(project_id = %self.project_id, "refreshing access token");
        gate.last_attempt = Some(Instant::now());
        match self.invoke_helper().await {
            Ok(token) => {
                gate.consecutive_failures = 0;
                self.current.send_replace(Some(token.clone()));
                info!(
                    project_id = %self.project_id,
                    expires_at = %token.expires_at,
                    "access token refreshed"
                );
                Ok(token)
            }
            Err(err) => {
                gate.consecutive_failures = gate.consecutive_failures.saturating_add(1);
                warn!(
                    project_id = %self.project_id,
                    failures = gate.consecutive_failures,
                    error = %err,
                    "access token refresh failed"
                );
                Err(err)
            }
        }
    }

    async fn invoke_helper(&self) -> Result<AccessToken, PushError> {
        let output = Command::new(&self.script_path)
            .arg(&self.account_path)
            .output()
            .await
            .map_err(|err| {
                PushError::TokenRefreshFailed(format!(
                    "cannot spawn helper [{}]: {err}",
                    self.script_path.display()
                ))
            })?;
        if !output.status.success() {
            return Err(PushError::TokenRefreshFailed(format!(
                "helper exited with status {}",
                output.status
            )));
        }
        let parsed: HelperOutput = serde_json::from_slice(&output.stdout)
            .map_err(|err| PushError::TokenRefreshFailed(format!("malformed helper output: {err}")))?;

        let issued_at = Utc::now();
        Ok(AccessToken {
            token: parsed.access_token,
            issued_at,
            expires_at: issued_at + chrono::Duration::seconds(parsed.expires_in),
        })
    }

    /// 两次辅助进程调用之间的静默窗口
    fn refresh_backoff(&self, failures: u32) -> Duration {
        if failures == 0 {
            return self.refresh_floor;
        }
        let base = self.refresh_floor.max(Duration::from_secs(1));
        let factor = 2u32.saturating_pow(failures.min(5));
        base.saturating_mul(factor)
            .min(MAX_REFRESH_BACKOFF.max(self.refresh_floor))
    }

    /// 下一次主动刷新前的休眠时长
    fn next_refresh_delay(&self) -> Duration {
        let floor = self.refresh_floor.max(Duration::from_secs(1));
        match self.current.borrow().as_ref() {
            Some(token) => {
                let refresh_at = token.expires_at - self.anticipation;
                let until = (refresh_at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
                until.max(floor)
            }
            None => floor,
        }
    }
}

/// 后台预刷新循环：在过期前（提前量窗口）主动换新 token
async fn refresh_loop(manager: Weak<TokenManager>) {
    loop {
        let Some(manager) = manager.upgrade() else {
            return;
        };
        // usable 的 token 会让 refresh 直接返回，不会穿透频率下限
        let _ = manager.refresh().await;
        let delay = manager.next_refresh_delay();
        drop(manager);
        tokio::time::sleep(delay).await;
    }
}
