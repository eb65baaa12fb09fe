use tokio::sync::watch;

/// Last known value of a channel. Stays `None` until the first successful
/// read, later failures leave the previous value in place.
pub struct ChannelState<T> {
    value: watch::Sender<Option<T>>,
}

impl<T: Clone + PartialEq> Default for ChannelState<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + PartialEq> ChannelState<T> {
    pub fn new() -> Self {
        let (value, _) = watch::channel(None);
        Self { value }
    }

    pub fn get(&self) -> Option<T> {
        self.value.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<Option<T>> {
        self.value.subscribe()
    }

    /// Store a new value. Returns `true` if it differs from the last one.
    pub fn set(&self, value: T) -> bool {
        self.value.send_if_modified(|last| {
            if last.as_ref() == Some(&value) {
                false
            } else {
                last.replace(value);
                true
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reports_changes() {
        let state = ChannelState::<u32>::new();
        assert_eq!(state.get(), None);
        assert!(state.set(1));
        assert_eq!(state.get(), Some(1));
        assert!(!state.set(1));
        assert!(state.set(2));
    }

    #[tokio::test]
    async fn watchers_see_changes() {
        let state = ChannelState::new();
        let mut rx = state.watch();
        state.set("on".to_string());
        rx.changed().await.unwrap();
        assert_eq!(rx.borrow().as_deref(), Some("on"));
    }
}
