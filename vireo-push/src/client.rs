//! 推送客户端公共契约与共享投递机制
//!
//! 所有 provider 客户端共享同一套排队/重试机制：
//! - 有界 FIFO 队列，满时入队同步失败
//! - 每客户端一个后台分发任务，按 provider 特性单发或并发投递
//! - 传输层失败指数退避重试，provider 终态拒绝不重试

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Semaphore, mpsc};
use tracing::{debug, warn};

use vireo_sip_core::metrics::PushClientMetrics;

use crate::error::PushError;
use crate::hook::TokenInvalidationHook;
use crate::push_info::{PushInfo, PushType};
use crate::request::{PushRequest, RequestState};

/// 推送客户端契约
///
/// `send_push` 只负责入队，立即返回；投递完成通过请求上的状态通道通知。
pub trait PushClient: Send + Sync {
    /// 注册名，同时作为请求的归属标识
    fn name(&self) -> &str;

    /// 构造绑定到本客户端的请求（含 provider 序列化的请求体）
    fn make_request(
        &self,
        push_type: PushType,
        info: &Arc<PushInfo>,
    ) -> Result<Arc<PushRequest>, PushError>;

    /// 入队；队列满时同步返回 [`PushError::QueueFull`]
    fn send_push(&self, request: Arc<PushRequest>) -> Result<(), PushError>;

    /// 队列为空且没有进行中的请求
    fn is_idle(&self) -> bool;
}

/// 重试策略配置（指数退避）
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// 每请求最大尝试次数
    pub max_attempts: u32,
    /// 初始延迟（毫秒）
    pub initial_delay_ms: u64,
    /// 最大延迟（毫秒）
    pub max_delay_ms: u64,
    /// 退避倍数
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 500,
            max_delay_ms: 30_000,
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    pub fn from_config(
        max_attempts: u32,
        initial_delay_ms: u64,
        max_delay_ms: u64,
        backoff_multiplier: f64,
    ) -> Self {
        Self {
            max_attempts,
            initial_delay_ms,
            max_delay_ms,
            backoff_multiplier,
        }
    }

    /// 计算第 `attempt` 次失败后的重试延迟
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        let delay_ms = (self.initial_delay_ms as f64
            * self.backoff_multiplier.powi(attempt as i32))
        .min(self.max_delay_ms as f64) as u64;
        Duration::from_millis(delay_ms)
    }
}

/// 单次投递结果
#[derive(Debug)]
pub(crate) enum DeliveryOutcome {
    /// provider 已接受
    Delivered,
    /// provider 终态拒绝，不重试；`unregistered_token` 非空时上报失效回调
    Rejected {
        reason: String,
        unregistered_token: Option<String>,
    },
    /// 传输层失败或 provider 暂时不可用，按退避策略重试
    Retry { reason: String },
}

/// provider 专属的单请求投递实现
#[async_trait]
pub(crate) trait DeliveryTransport: Send + Sync + 'static {
    async fn deliver(&self, request: &PushRequest) -> DeliveryOutcome;
}

/// 客户端共享的队列与分发机制
///
/// `max_in_flight == 1` 时严格按入队顺序逐个投递（HTTP/1 通道）；
/// 大于 1 时并发投递，信号量限制在途流数（HTTP/2 通道）。
pub(crate) struct ClientChannel {
    name: String,
    capacity: usize,
    tx: mpsc::Sender<Arc<PushRequest>>,
    pending: Arc<AtomicUsize>,
    metrics: Arc<PushClientMetrics>,
}

impl ClientChannel {
    pub(crate) fn spawn(
        name: impl Into<String>,
        capacity: usize,
        max_in_flight: usize,
        retry: RetryPolicy,
        transport: Arc<dyn DeliveryTransport>,
        hook: Arc<dyn TokenInvalidationHook>,
        metrics: Arc<PushClientMetrics>,
    ) -> Self {
        let name = name.into();
        let capacity = capacity.max(1);
        let (tx, rx) = mpsc::channel(capacity);
        let pending = Arc::new(AtomicUsize::new(0));

        tokio::spawn(dispatch_loop(
            name.clone(),
            rx,
            Arc::clone(&pending),
            max_in_flight.max(1),
            retry,
            transport,
            hook,
            Arc::clone(&metrics),
        ));

        Self {
            name,
            capacity,
            tx,
            pending,
            metrics,
        }
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn enqueue(&self, request: Arc<PushRequest>) -> Result<(), PushError> {
        match self.tx.try_send(Arc::clone(&request)) {
            Ok(()) => {
                self.pending.fetch_add(1, Ordering::SeqCst);
                request.set_state(RequestState::Queued);
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.metrics
                    .queue_rejected_total
                    .with_label_values(&[&self.name])
                    .inc();
                Err(PushError::QueueFull {
                    client: self.name.clone(),
                    capacity: self.capacity,
                })
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(PushError::Transport(format!(
                "dispatch task of client [{}] terminated",
                self.name
            ))),
        }
    }

    pub(crate) fn is_idle(&self) -> bool {
        self.pending.load(Ordering::SeqCst) == 0
    }
}

#[allow(clippy::too_many_arguments)]
async fn dispatch_loop(
    name: String,
    mut rx: mpsc::Receiver<Arc<PushRequest>>,
    pending: Arc<AtomicUsize>,
    max_in_flight: usize,
    retry: RetryPolicy,
    transport: Arc<dyn DeliveryTransport>,
    hook: Arc<dyn TokenInvalidationHook>,
    metrics: Arc<PushClientMetrics>,
) {
    let streams = Arc::new(Semaphore::new(max_in_flight));

    while let Some(request) = rx.recv().await {
        if max_in_flight == 1 {
            // HTTP/1 通道：严格按入队顺序完成
            process_request(&name, request, &retry, transport.as_ref(), hook.as_ref(), &metrics)
                .await;
            pending.fetch_sub(1, Ordering::SeqCst);
        } else {
            let permit = match Arc::clone(&streams).acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };
            let name = name.clone();
            let retry = retry.clone();
            let transport = Arc::clone(&transport);
            let hook = Arc::clone(&hook);
            let metrics = Arc::clone(&metrics);
            let pending = Arc::clone(&pending);
            tokio::spawn(async move {
                process_request(
                    &name,
                    request,
                    &retry,
                    transport.as_ref(),
                    hook.as_ref(),
                    &metrics,
                )
                .await;
                pending.fetch_sub(1, Ordering::SeqCst);
                drop(permit);
            });
        }
    }
    debug!(client = %name, "dispatch loop stopped");
}

/// 驱动单个请求直至终态
async fn process_request(
    name: &str,
    request: Arc<PushRequest>,
    retry: &RetryPolicy,
    transport: &dyn DeliveryTransport,
    hook: &dyn TokenInvalidationHook,
    metrics: &PushClientMetrics,
) {
    request.set_state(RequestState::InProgress);
    let start = std::time::Instant::now();

    loop {
        let attempt = request.next_attempt();
        metrics.sent_total.with_label_values(&[name]).inc();

        match transport.deliver(&request).await {
            DeliveryOutcome::Delivered => {
                metrics.succeeded_total.with_label_values(&[name]).inc();
                debug!(client = %name, attempts = attempt + 1, "push notification delivered");
                request.succeed();
                break;
            }
            DeliveryOutcome::Rejected {
                reason,
                unregistered_token,
            } => {
                metrics
                    .failed_total
                    .with_label_values(&[name, reason.as_str()])
                    .inc();
                warn!(client = %name, reason = %reason, "push notification rejected by provider");
                if let Some(token) = unregistered_token {
                    hook.on_unregistered(request.app_identifier(), &token).await;
                }
                request.fail(reason);
                break;
            }
            DeliveryOutcome::Retry { reason } => {
                if attempt + 1 >= retry.max_attempts {
                    metrics
                        .failed_total
                        .with_label_values(&[name, "retries-exhausted"])
                        .inc();
                    warn!(
                        client = %name,
                        attempts = attempt + 1,
                        reason = %reason,
                        "push notification failed after retries"
                    );
                    request.fail(reason);
                    break;
                }
                let delay = retry.calculate_delay(attempt);
                warn!(
                    client = %name,
                    attempt = attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    reason = %reason,
                    "push delivery failed, retrying"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }

    metrics
        .push_duration_seconds
        .with_label_values(&[name])
        .observe(start.elapsed().as_secs_f64());
}
