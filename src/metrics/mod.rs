//! # Prometheus 指标收集模块
//!
//! 为推送与会议子系统提供统一的 Prometheus 指标收集能力。

use once_cell::sync::Lazy;
use prometheus::{HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts, Registry};

/// 全局指标注册表
pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

/// 推送客户端指标
pub struct PushClientMetrics {
    /// 推送发送总数
    pub sent_total: IntCounterVec,
    /// 推送成功总数
    pub succeeded_total: IntCounterVec,
    /// 推送失败总数（按原因）
    pub failed_total: IntCounterVec,
    /// 队列拒绝总数
    pub queue_rejected_total: IntCounterVec,
    /// 推送耗时（秒）
    pub push_duration_seconds: HistogramVec,
}

impl PushClientMetrics {
    pub fn new() -> Self {
        let sent_total = IntCounterVec::new(
            Opts::new("push_sent_total", "Total number of push notifications sent"),
            &["client"],
        )
        .expect("Failed to create push_sent_total metric");

        let succeeded_total = IntCounterVec::new(
            Opts::new(
                "push_succeeded_total",
                "Total number of push notifications accepted by the provider",
            ),
            &["client"],
        )
        .expect("Failed to create push_succeeded_total metric");

        let failed_total = IntCounterVec::new(
            Opts::new(
                "push_failed_total",
                "Total number of push notifications that terminally failed",
            ),
            &["client", "reason"],
        )
        .expect("Failed to create push_failed_total metric");

        let queue_rejected_total = IntCounterVec::new(
            Opts::new(
                "push_queue_rejected_total",
                "Total number of enqueue attempts rejected because the queue was full",
            ),
            &["client"],
        )
        .expect("Failed to create push_queue_rejected_total metric");

        let push_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "push_duration_seconds",
                "Push notification delivery duration in seconds",
            )
            .buckets(vec![0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0]),
            &["client"],
        )
        .expect("Failed to create push_duration_seconds metric");

        // 注册指标，忽略重复注册错误（测试中可能会重复创建）
        let _ = REGISTRY.register(Box::new(sent_total.clone()));
        let _ = REGISTRY.register(Box::new(succeeded_total.clone()));
        let _ = REGISTRY.register(Box::new(failed_total.clone()));
        let _ = REGISTRY.register(Box::new(queue_rejected_total.clone()));
        let _ = REGISTRY.register(Box::new(push_duration_seconds.clone()));

        Self {
            sent_total,
            succeeded_total,
            failed_total,
            queue_rejected_total,
            push_duration_seconds,
        }
    }
}

impl Default for PushClientMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// 会议地址分配指标
pub struct ConferenceMetrics {
    /// 会议地址冲突总数
    pub address_collisions_total: IntCounter,
    /// 聊天室绑定失败总数
    pub bind_failures_total: IntCounter,
    /// 会议地址分配成功总数
    pub addresses_allocated_total: IntCounter,
}

impl ConferenceMetrics {
    pub fn new() -> Self {
        let address_collisions_total = IntCounter::new(
            "conference_address_collisions_total",
            "Total number of conference address collisions detected",
        )
        .expect("Failed to create conference_address_collisions_total metric");

        let bind_failures_total = IntCounter::new(
            "conference_bind_failures_total",
            "Total number of chat room bind failures",
        )
        .expect("Failed to create conference_bind_failures_total metric");

        let addresses_allocated_total = IntCounter::new(
            "conference_addresses_allocated_total",
            "Total number of conference addresses successfully allocated",
        )
        .expect("Failed to create conference_addresses_allocated_total metric");

        let _ = REGISTRY.register(Box::new(address_collisions_total.clone()));
        let _ = REGISTRY.register(Box::new(bind_failures_total.clone()));
        let _ = REGISTRY.register(Box::new(addresses_allocated_total.clone()));

        Self {
            address_collisions_total,
            bind_failures_total,
            addresses_allocated_total,
        }
    }
}

impl Default for ConferenceMetrics {
    fn default() -> Self {
        Self::new()
    }
}
