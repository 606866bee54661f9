//! 推送请求及其状态机

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use tokio::sync::watch;

use crate::push_info::{PushInfo, PushType};

/// 请求状态，单调推进：Created → Queued → InProgress → {Successful, Failed}
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestState {
    Created,
    Queued,
    InProgress,
    Successful,
    Failed(String),
}

impl RequestState {
    fn rank(&self) -> u8 {
        match self {
            RequestState::Created => 0,
            RequestState::Queued => 1,
            RequestState::InProgress => 2,
            RequestState::Successful | RequestState::Failed(_) => 3,
        }
    }

    /// 是否为终态
    pub fn is_terminal(&self) -> bool {
        matches!(self, RequestState::Successful | RequestState::Failed(_))
    }
}

/// 一次推送投递工作单元
///
/// 由客户端的 `make_request` 产生，入队后由该客户端独占驱动；
/// 完成（成功、终态拒绝或重试耗尽）通过状态通道通知观察者。
pub struct PushRequest {
    app_identifier: String,
    push_type: PushType,
    info: Arc<PushInfo>,
    body: Vec<u8>,
    attempts: AtomicU32,
    state: watch::Sender<RequestState>,
}

impl PushRequest {
    pub fn new(
        app_identifier: impl Into<String>,
        push_type: PushType,
        info: Arc<PushInfo>,
        body: Vec<u8>,
    ) -> Arc<Self> {
        let (state, _) = watch::channel(RequestState::Created);
        Arc::new(Self {
            app_identifier: app_identifier.into(),
            push_type,
            info,
            body,
            attempts: AtomicU32::new(0),
            state,
        })
    }

    /// 归属客户端的注册名
    pub fn app_identifier(&self) -> &str {
        &self.app_identifier
    }

    pub fn push_type(&self) -> PushType {
        self.push_type
    }

    pub fn info(&self) -> &PushInfo {
        &self.info
    }

    /// provider 序列化后的请求体
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// 当前状态快照
    pub fn state(&self) -> RequestState {
        self.state.borrow().clone()
    }

    /// 订阅状态变更
    pub fn subscribe(&self) -> watch::Receiver<RequestState> {
        self.state.subscribe()
    }

    /// 等待请求进入终态
    pub async fn completed(&self) -> RequestState {
        let mut rx = self.state.subscribe();
        loop {
            {
                let current = rx.borrow();
                if current.is_terminal() {
                    return current.clone();
                }
            }
            if rx.changed().await.is_err() {
                return self.state();
            }
        }
    }

    /// 状态只允许前进，回退转换被忽略
    pub(crate) fn set_state(&self, next: RequestState) {
        let mut advanced = false;
        self.state.send_if_modified(|current| {
            if next.rank() > current.rank() {
                *current = next.clone();
                advanced = true;
                true
            } else {
                false
            }
        });
        if !advanced {
            tracing::debug!(
                app_id = %self.app_identifier,
                state = ?next,
                "ignoring backward request state transition"
            );
        }
    }

    pub(crate) fn succeed(&self) {
        self.set_state(RequestState::Successful);
    }

    pub(crate) fn fail(&self, reason: impl Into<String>) {
        self.set_state(RequestState::Failed(reason.into()));
    }

    /// 返回当前尝试序号（从 0 开始）并自增
    pub(crate) fn next_attempt(&self) -> u32 {
        self.attempts.fetch_add(1, Ordering::SeqCst)
    }

    /// 已经历的投递尝试次数
    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }
}
