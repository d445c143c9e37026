use crate::types::{
    NotificationAction, NotificationClick, NotificationData, NotificationSpec, PushMessage,
    WindowClient,
};
use reqwest::Url;
use time::OffsetDateTime;

pub const DEFAULT_TITLE: &str = "FLearn Notification";
pub const DEFAULT_URL: &str = "/";
pub const NOTIFICATION_ICON: &str = "/logo.png";
pub const ACTION_OPEN: &str = "open";
pub const ACTION_DISMISS: &str = "close";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushDecision {
    /// A window is focused; the foreground app handles the message itself.
    Suppress,
    Show(NotificationSpec),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClickRoute {
    Dismiss,
    FocusExisting {
        client_id: String,
        /// `None` when the target is the app root.
        navigate_to: Option<String>,
    },
    OpenWindow(String),
}

fn notification_tag(arrived_at: OffsetDateTime) -> String {
    let millis = arrived_at.unix_timestamp_nanos() / 1_000_000;
    format!("flearn-{millis}")
}

pub fn build_notification(message: &PushMessage, arrived_at: OffsetDateTime) -> NotificationSpec {
    NotificationSpec {
        title: message.title().unwrap_or(DEFAULT_TITLE).to_string(),
        body: message.body().unwrap_or_default().to_string(),
        tag: notification_tag(arrived_at),
        icon: NOTIFICATION_ICON.to_string(),
        badge: NOTIFICATION_ICON.to_string(),
        require_interaction: true,
        actions: vec![
            NotificationAction {
                action: ACTION_OPEN.to_string(),
                title: "Open".to_string(),
            },
            NotificationAction {
                action: ACTION_DISMISS.to_string(),
                title: "Dismiss".to_string(),
            },
        ],
        data: NotificationData {
            url: message.url().unwrap_or(DEFAULT_URL).to_string(),
        },
    }
}

pub fn decide_push_display(
    clients: &[WindowClient],
    message: &PushMessage,
    arrived_at: OffsetDateTime,
) -> PushDecision {
    if clients.iter().any(|c| c.focused) {
        return PushDecision::Suppress;
    }
    PushDecision::Show(build_notification(message, arrived_at))
}

fn same_origin(a: &Url, b: &Url) -> bool {
    a.origin() == b.origin()
}

fn is_default_target(target: &str) -> bool {
    target.trim().is_empty() || target.trim() == DEFAULT_URL
}

/// Routes a notification click to an existing app window or a new one.
/// `app_origin` must be an absolute URL; relative targets resolve against it.
pub fn decide_click_route(
    click: &NotificationClick,
    app_origin: &Url,
    clients: &[WindowClient],
) -> ClickRoute {
    if click.action.as_deref() == Some(ACTION_DISMISS) {
        return ClickRoute::Dismiss;
    }

    let target = click
        .url
        .as_deref()
        .map(str::trim)
        .filter(|u| !u.is_empty())
        .unwrap_or(DEFAULT_URL);
    let absolute = app_origin
        .join(target)
        .map(String::from)
        .unwrap_or_else(|_| app_origin.to_string());

    let existing = clients.iter().find(|c| {
        Url::parse(&c.url)
            .map(|u| same_origin(&u, app_origin))
            .unwrap_or(false)
    });

    match existing {
        Some(client) => ClickRoute::FocusExisting {
            client_id: client.id.clone(),
            navigate_to: (!is_default_target(target)).then_some(absolute),
        },
        None => ClickRoute::OpenWindow(absolute),
    }
}
