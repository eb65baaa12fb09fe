use super::{on_feedback, Thing};
use crate::{command::ChannelClass, status::ThingStatus};
use futures::FutureExt;
use std::{
    sync::{Arc, Weak},
    time::Duration,
};
use tokio::{
    select,
    sync::{broadcast, watch},
    task::JoinHandle,
    time::sleep,
};

/// Run `$code` repeatedly while the status satisfies `$cond`, park otherwise.
/// Returns once the status sender is gone or `$code` yields `false`.
macro_rules! loop_if {
    ($status:expr, $cond:expr, $code:block) => {
        async move {
            let mut status: watch::Receiver<ThingStatus> = $status;
            loop {
                let active = $cond(&*status.borrow_and_update());
                if active {
                    loop {
                        select! {
                            biased;
                            closed = status.changed().map(|r| r.is_err()) => {
                                if closed {
                                    return;
                                }
                                break;
                            }
                            keep = async { $code } => {
                                if !keep {
                                    return;
                                }
                            }
                        }
                    }
                } else if status.changed().await.is_err() {
                    return;
                }
            }
        }
    };
}

/// Poll contact closure state while the Thing is online.
pub(super) fn spawn_refresh(thing: &Arc<Thing>, period: Duration) -> JoinHandle<()> {
    let weak = Arc::downgrade(thing);
    let status = thing.status().watch();
    let id = thing.id().to_string();
    tokio::spawn(async move {
        log::debug!("Polling of thing {} every {:?}: RUNNING", id, period);
        loop_if!(status, ThingStatus::is_online, {
            match weak.upgrade() {
                Some(thing) => thing.refresh_all().await,
                None => return false,
            }
            sleep(period).await;
            true
        })
        .await;
        log::debug!("Polling of thing {}: STOPPING", id);
    })
}

/// Mirror serial feedback of one port into the Thing's received state.
pub(super) fn spawn_feedback(
    thing: &Arc<Thing>,
    class: ChannelClass,
    mut messages: broadcast::Receiver<Vec<u8>>,
) -> JoinHandle<()> {
    let weak: Weak<Thing> = Arc::downgrade(thing);
    tokio::spawn(async move {
        loop {
            let msg = messages.recv().await;
            let keep = match weak.upgrade() {
                Some(thing) => on_feedback(&thing, class, msg),
                None => false,
            };
            if !keep {
                break;
            }
        }
    })
}
