//! Side effects fired once a mutation reaches a terminal state.
//!
//! Callers attach an [`EffectDescriptor`] to each mutation. The dispatcher
//! consumes it by value, so a descriptor can only ever run once.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::application::adapter::Verb;
use crate::application::error::DataError;
use crate::cache::{CacheStore, Invalidation};
use crate::domain::types::{Identifier, Resource};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationKind {
    Info,
    Success,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub kind: NotificationKind,
    /// Message or translation key, rendered by the view layer.
    pub message: String,
    /// Whether the view should offer an undo action next to it.
    pub undoable: bool,
}

impl Notification {
    pub fn new(kind: NotificationKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            undoable: false,
        }
    }

    pub fn info(message: impl Into<String>) -> Self {
        Self::new(NotificationKind::Info, message)
    }

    pub fn success(message: impl Into<String>) -> Self {
        Self::new(NotificationKind::Success, message)
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Self::new(NotificationKind::Warning, message)
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(NotificationKind::Error, message)
    }

    pub fn with_undo(mut self, undoable: bool) -> Self {
        self.undoable = undoable;
        self
    }
}

/// Where to send the user after a successful mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Redirect {
    List,
    Create,
    /// Edit view of the affected record.
    Edit,
    /// Show view of the affected record.
    Show,
    Path(String),
}

impl Redirect {
    /// Resolve to a path. Record-scoped targets fall back to the list when the
    /// mutation produced no single record.
    pub fn resolve(&self, resource: &Resource, id: Option<&Identifier>) -> String {
        match (self, id) {
            (Redirect::List, _) | (Redirect::Edit | Redirect::Show, None) => format!("/{resource}"),
            (Redirect::Create, _) => format!("/{resource}/create"),
            (Redirect::Edit, Some(id)) => format!("/{resource}/{id}"),
            (Redirect::Show, Some(id)) => format!("/{resource}/{id}/show"),
            (Redirect::Path(path), _) => path.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SuccessEffects {
    pub notification: Option<Notification>,
    pub redirect: Option<Redirect>,
    pub refresh: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum FailureNotification {
    /// Error notification carrying the failure's message.
    #[default]
    Default,
    Custom(Notification),
    Suppressed,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FailureEffects {
    pub notification: FailureNotification,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EffectDescriptor {
    pub on_success: SuccessEffects,
    pub on_failure: FailureEffects,
}

impl EffectDescriptor {
    /// Defaults used when the caller attaches nothing: a per-verb success
    /// notification and the standard failure notification.
    pub fn for_verb(verb: Verb) -> Self {
        let message = match verb {
            Verb::Create => Some("notification.created"),
            Verb::Update | Verb::UpdateMany => Some("notification.updated"),
            Verb::Delete | Verb::DeleteMany => Some("notification.deleted"),
            _ => None,
        };
        Self {
            on_success: SuccessEffects {
                notification: message.map(Notification::info),
                ..Default::default()
            },
            on_failure: FailureEffects::default(),
        }
    }

    pub fn with_success_notification(mut self, notification: Notification) -> Self {
        self.on_success.notification = Some(notification);
        self
    }

    pub fn without_success_notification(mut self) -> Self {
        self.on_success.notification = None;
        self
    }

    pub fn with_redirect(mut self, redirect: Redirect) -> Self {
        self.on_success.redirect = Some(redirect);
        self
    }

    pub fn with_refresh(mut self) -> Self {
        self.on_success.refresh = true;
        self
    }

    pub fn with_failure_notification(mut self, notification: Notification) -> Self {
        self.on_failure.notification = FailureNotification::Custom(notification);
        self
    }

    pub fn suppress_failure_notification(mut self) -> Self {
        self.on_failure.notification = FailureNotification::Suppressed;
        self
    }

    pub(crate) fn mark_undoable(mut self, undoable: bool) -> Self {
        if let Some(notification) = self.on_success.notification.as_mut() {
            notification.undoable = undoable;
        }
        self
    }
}

/// Receives the effects; rendering them is up to the view layer.
pub trait EffectSink: Send + Sync {
    fn notify(&self, notification: &Notification);
    fn redirect(&self, path: &str);
    /// Views should re-run their queries.
    fn refresh(&self);
    /// The session is no longer trustworthy; drop credentials and log out.
    fn invalidate_session(&self);
}

/// Sink that only logs. Used by the CLI.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EffectSink for TracingSink {
    fn notify(&self, notification: &Notification) {
        match notification.kind {
            NotificationKind::Error | NotificationKind::Warning => warn!(
                kind = ?notification.kind,
                undoable = notification.undoable,
                "{}",
                notification.message
            ),
            _ => info!(
                kind = ?notification.kind,
                undoable = notification.undoable,
                "{}",
                notification.message
            ),
        }
    }

    fn redirect(&self, path: &str) {
        info!(path, "redirect");
    }

    fn refresh(&self) {
        info!("refresh requested");
    }

    fn invalidate_session(&self) {
        warn!("session invalidated");
    }
}

#[derive(Clone)]
pub struct EffectDispatcher {
    pub(crate) sink: Arc<dyn EffectSink>,
    pub(crate) cache: CacheStore,
}

impl EffectDispatcher {
    pub fn new(sink: Arc<dyn EffectSink>, cache: CacheStore) -> Self {
        Self { sink, cache }
    }

    pub fn on_success(
        &self,
        resource: &Resource,
        verb: Verb,
        id: Option<&Identifier>,
        effects: EffectDescriptor,
    ) {
        let SuccessEffects {
            notification,
            redirect,
            refresh,
        } = effects.on_success;
        debug!(resource = %resource, verb = %verb, "dispatching success effects");

        if let Some(notification) = notification {
            self.sink.notify(&notification);
        }
        if let Some(redirect) = redirect {
            self.sink.redirect(&redirect.resolve(resource, id));
        }
        if refresh {
            self.refresh();
        }
    }

    pub fn on_failure(
        &self,
        resource: &Resource,
        verb: Verb,
        error: &DataError,
        effects: EffectDescriptor,
    ) {
        debug!(resource = %resource, verb = %verb, error = %error, "dispatching failure effects");
        self.notify_failure(error, effects.on_failure.notification);
    }

    /// Clear every cache entry, invalidate the session and send one notification.
    ///
    /// `generation` is the cache generation observed when the failed request
    /// started. Failures from requests issued before an earlier clear were
    /// already handled by it and are ignored; returns whether this call acted.
    pub fn on_auth_failure(
        &self,
        error: &DataError,
        notification: FailureNotification,
        generation: u64,
    ) -> bool {
        if !self.cache.clear_since(generation) {
            debug!(error = %error, "authentication failure already handled");
            return false;
        }
        warn!(error = %error, "authentication rejected; cache cleared");
        self.sink.invalidate_session();
        self.notify_failure(error, notification);
        true
    }

    /// Mark every cached entry stale and ask views to re-run their queries.
    pub fn refresh(&self) {
        let stale = self.cache.invalidate(&Invalidation::All);
        debug!(stale, "refresh");
        self.sink.refresh();
    }

    fn notify_failure(&self, error: &DataError, notification: FailureNotification) {
        match notification {
            FailureNotification::Default => self.sink.notify(&default_failure(error)),
            FailureNotification::Custom(notification) => self.sink.notify(&notification),
            FailureNotification::Suppressed => {}
        }
    }
}

fn default_failure(error: &DataError) -> Notification {
    match error {
        DataError::Validation { message, .. } => Notification::warning(message.clone()),
        DataError::Auth { .. } => Notification::warning("notification.logged_out"),
        other => Notification::error(other.to_string()),
    }
}
