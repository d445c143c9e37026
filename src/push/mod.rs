//! Background push message handling: whether to surface a system
//! notification and where a click on it should lead.

mod handler;
mod policy;

pub use handler::{ClientHost, NotificationSurface, PushError, PushHandler};
pub use policy::{
    build_notification, decide_click_route, decide_push_display, ClickRoute, PushDecision,
    ACTION_DISMISS, ACTION_OPEN, DEFAULT_TITLE, DEFAULT_URL,
};
