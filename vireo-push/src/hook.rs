//! 设备 token 失效回调

use async_trait::async_trait;

/// 设备 token 失效通知接口
///
/// provider 返回终态的"设备未注册"（APNs 410 / FCM NotRegistered）时回调，
/// 上游据此清理对应联系人的推送参数。
#[async_trait]
pub trait TokenInvalidationHook: Send + Sync {
    async fn on_unregistered(&self, app_id: &str, device_token: &str);
}

/// 默认空实现
pub struct NoopInvalidationHook;

#[async_trait]
impl TokenInvalidationHook for NoopInvalidationHook {
    async fn on_unregistered(&self, app_id: &str, device_token: &str) {
        tracing::debug!(
            app_id = %app_id,
            device_token = %device_token,
            "unregistered device token reported, no invalidation hook installed"
        );
    }
}
