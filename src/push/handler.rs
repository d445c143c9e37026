use super::policy::{decide_click_route, decide_push_display, ClickRoute, PushDecision};
use crate::types::{NotificationClick, NotificationSpec, PushMessage, WindowClient};
use async_trait::async_trait;
use reqwest::Url;
use thiserror::Error;
use time::OffsetDateTime;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum PushError {
    #[error("invalid app origin {0}")]
    InvalidOrigin(String),
    #[error("window operation failed: {0}")]
    Window(String),
    #[error("notification could not be shown: {0}")]
    Notification(String),
}

/// Open application windows as seen by the background context.
#[async_trait]
pub trait ClientHost: Send + Sync {
    async fn match_all(&self) -> Vec<WindowClient>;
    async fn focus(&self, client_id: &str) -> Result<(), PushError>;
    async fn navigate(&self, client_id: &str, url: &str) -> Result<(), PushError>;

    fn can_open_windows(&self) -> bool {
        true
    }

    async fn open_window(&self, url: &str) -> Result<(), PushError>;
}

#[async_trait]
pub trait NotificationSurface: Send + Sync {
    async fn show(&self, spec: &NotificationSpec) -> Result<(), PushError>;
    async fn close(&self, tag: &str);
}

pub struct PushHandler<H, S> {
    host: H,
    surface: S,
    app_origin: Url,
}

impl<H: ClientHost, S: NotificationSurface> PushHandler<H, S> {
    pub fn new(host: H, surface: S, app_origin: &str) -> Result<Self, PushError> {
        let app_origin =
            Url::parse(app_origin).map_err(|_| PushError::InvalidOrigin(app_origin.to_string()))?;
        Ok(Self {
            host,
            surface,
            app_origin,
        })
    }

    pub fn host(&self) -> &H {
        &self.host
    }

    pub fn surface(&self) -> &S {
        &self.surface
    }

    /// Handles a background push message. Returns the notification that was
    /// shown, if any.
    pub async fn on_push(
        &self,
        message: &PushMessage,
    ) -> Result<Option<NotificationSpec>, PushError> {
        self.on_push_at(message, OffsetDateTime::now_utc()).await
    }

    pub async fn on_push_at(
        &self,
        message: &PushMessage,
        arrived_at: OffsetDateTime,
    ) -> Result<Option<NotificationSpec>, PushError> {
        let clients = self.host.match_all().await;
        match decide_push_display(&clients, message, arrived_at) {
            PushDecision::Suppress => {
                debug!("app window focused, leaving push message to the foreground");
                Ok(None)
            }
            PushDecision::Show(spec) => {
                self.surface.show(&spec).await?;
                info!(tag = %spec.tag, title = %spec.title, "notification shown");
                Ok(Some(spec))
            }
        }
    }

    pub async fn on_notification_click(
        &self,
        click: &NotificationClick,
    ) -> Result<ClickRoute, PushError> {
        self.surface.close(&click.tag).await;

        let clients = self.host.match_all().await;
        let route = decide_click_route(click, &self.app_origin, &clients);
        match &route {
            ClickRoute::Dismiss => {
                debug!(tag = %click.tag, "notification dismissed");
            }
            ClickRoute::FocusExisting {
                client_id,
                navigate_to,
            } => {
                self.host.focus(client_id).await?;
                if let Some(url) = navigate_to {
                    self.host.navigate(client_id, url).await?;
                }
                info!(client_id = %client_id, "notification routed to open window");
            }
            ClickRoute::OpenWindow(url) => {
                if self.host.can_open_windows() {
                    self.host.open_window(url).await?;
                    info!(url = %url, "notification opened new window");
                } else {
                    warn!(url = %url, "host cannot open windows, ignoring click");
                }
            }
        }
        Ok(route)
    }
}
