//! 统一异常处理模块

use thiserror::Error;

/// 会议地址分配错误类型
#[derive(Debug, Error)]
pub enum ConferenceError {
    /// registrar 绑定后记录里没有任何联系人
    #[error("conference address bind failed: record carries no contact")]
    BindFailed,

    /// 最新联系人没有公共 GRUU
    #[error("conference does not have a gruu address")]
    NoGruu,

    /// 连续冲突达到迭代上限
    #[error("conference address space exhausted after {attempts} collisions")]
    AddressExhaustion { attempts: usize },

    /// 与 registrar 或会议服务器交互的传输层错误
    #[error(transparent)]
    Registrar(#[from] anyhow::Error),
}
