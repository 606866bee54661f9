//! Vireo 会议地址分配库
//!
//! 聊天室创建握手期间，为新聊天室向共享 registrar 申请一个全局唯一的
//! 会议 SIP 地址并完成绑定，最终发布 registrar 返回的 GRUU 作为
//! 聊天室的持久会议地址。

pub mod allocator;
pub mod error;
pub mod registrar;
pub mod uri;

pub use allocator::{CHATROOM_PREFIX, ConferenceAddressAllocator};
pub use error::ConferenceError;
pub use registrar::{ChatRoomBinder, ChatRoomHandle, ExtendedContact, Record, Registrar};
pub use uri::{SipScheme, SipUri, UriParseError};
