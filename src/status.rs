use std::{fmt, sync::Arc};
use tokio::sync::{broadcast, watch};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusDetail {
    None,
    CommunicationError,
    ConfigurationError,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ThingStatus {
    Initializing,
    Online,
    Offline { detail: StatusDetail, message: String },
}

impl ThingStatus {
    pub fn is_online(&self) -> bool {
        matches!(self, ThingStatus::Online)
    }

    pub fn is_offline(&self) -> bool {
        matches!(self, ThingStatus::Offline { .. })
    }

    pub fn detail(&self) -> StatusDetail {
        match self {
            ThingStatus::Offline { detail, .. } => *detail,
            _ => StatusDetail::None,
        }
    }
}

impl fmt::Display for ThingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ThingStatus::Initializing => f.write_str("INITIALIZING"),
            ThingStatus::Online => f.write_str("ONLINE"),
            ThingStatus::Offline {
                detail: StatusDetail::None,
                ..
            } => f.write_str("OFFLINE"),
            ThingStatus::Offline { detail, message } => write!(f, "OFFLINE({:?}): {}", detail, message),
        }
    }
}

struct Inner {
    id: String,
    current: watch::Sender<ThingStatus>,
    events: broadcast::Sender<ThingStatus>,
}

/// Status of one Thing, shared by its connection worker and channel handlers.
/// Every actual transition is published once to subscribers.
#[derive(Clone)]
pub struct StatusHandle {
    inner: Arc<Inner>,
}

impl StatusHandle {
    pub fn new(id: &str) -> Self {
        let (current, _) = watch::channel(ThingStatus::Initializing);
        let (events, _) = broadcast::channel(16);
        Self {
            inner: Arc::new(Inner {
                id: id.to_string(),
                current,
                events,
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn current(&self) -> ThingStatus {
        self.inner.current.borrow().clone()
    }

    pub fn is_online(&self) -> bool {
        self.inner.current.borrow().is_online()
    }

    pub fn watch(&self) -> watch::Receiver<ThingStatus> {
        self.inner.current.subscribe()
    }

    /// Receive every status transition from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<ThingStatus> {
        self.inner.events.subscribe()
    }

    fn transition<F: FnOnce(&ThingStatus) -> Option<ThingStatus>>(&self, f: F) -> bool {
        let mut changed = None;
        self.inner.current.send_if_modified(|status| match f(status) {
            Some(next) => {
                log::debug!("Changing status of {} from {} to {}", self.inner.id, status, next);
                *status = next.clone();
                changed = Some(next);
                true
            }
            None => false,
        });
        match changed {
            Some(next) => {
                let _ = self.inner.events.send(next);
                true
            }
            None => false,
        }
    }

    pub fn mark_online(&self) -> bool {
        self.transition(|s| (!s.is_online()).then_some(ThingStatus::Online))
    }

    pub fn mark_offline(&self) -> bool {
        self.transition(|s| {
            (!s.is_offline()).then(|| ThingStatus::Offline {
                detail: StatusDetail::None,
                message: String::new(),
            })
        })
    }

    /// Offline with a reason. A Thing that is already offline for a reason keeps the first one.
    pub fn mark_offline_with_error(&self, detail: StatusDetail, message: &str) -> bool {
        self.transition(|s| {
            (!s.is_offline() || s.detail() == StatusDetail::None).then(|| ThingStatus::Offline {
                detail,
                message: message.to_string(),
            })
        })
    }
}
