//! Push notifications from the engine.

mod notification;
mod push;
mod registry;

pub use notification::{PushKind, ServerNotification, TIMEOUT_ERROR_TYPE};
pub use push::{bind_local, NotificationCallback, PushListener};
pub use registry::{CommandChannel, ListenerRegistry, ListenerSlot};
