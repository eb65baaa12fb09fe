use super::Error;
use crate::command::RequestEnvelope;
use tokio::sync::mpsc::{
    self,
    error::{TryRecvError, TrySendError},
};

#[derive(Clone)]
enum Tx {
    Unbounded(mpsc::UnboundedSender<RequestEnvelope>),
    Bounded(mpsc::Sender<RequestEnvelope>),
}

enum Rx {
    Unbounded(mpsc::UnboundedReceiver<RequestEnvelope>),
    Bounded(mpsc::Receiver<RequestEnvelope>),
}

/// Producer side of the dispatch queue. Cloned into every caller.
#[derive(Clone)]
pub struct QueueSender {
    tx: Tx,
}

/// Consumer side of the dispatch queue, owned by the connection worker.
pub struct QueueReceiver {
    rx: Rx,
}

/// FIFO of requests for one device. `depth == 0` makes it unbounded.
pub fn dispatch_queue(depth: usize) -> (QueueSender, QueueReceiver) {
    if depth == 0 {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            QueueSender {
                tx: Tx::Unbounded(tx),
            },
            QueueReceiver {
                rx: Rx::Unbounded(rx),
            },
        )
    } else {
        let (tx, rx) = mpsc::channel(depth);
        (
            QueueSender { tx: Tx::Bounded(tx) },
            QueueReceiver { rx: Rx::Bounded(rx) },
        )
    }
}

impl QueueSender {
    /// Append to the queue without waiting.
    pub fn enqueue(&self, envelope: RequestEnvelope) -> Result<(), Error> {
        match &self.tx {
            Tx::Unbounded(tx) => tx.send(envelope).map_err(|_| Error::Stopped),
            Tx::Bounded(tx) => tx.try_send(envelope).map_err(|err| match err {
                TrySendError::Full(..) => Error::QueueFull,
                TrySendError::Closed(..) => Error::Stopped,
            }),
        }
    }
}

impl QueueReceiver {
    /// Wait for the oldest request. `None` once every sender is gone.
    pub async fn take_next(&mut self) -> Option<RequestEnvelope> {
        match &mut self.rx {
            Rx::Unbounded(rx) => rx.recv().await,
            Rx::Bounded(rx) => rx.recv().await,
        }
    }

    pub fn try_take(&mut self) -> Option<RequestEnvelope> {
        let res = match &mut self.rx {
            Rx::Unbounded(rx) => rx.try_recv(),
            Rx::Bounded(rx) => rx.try_recv(),
        };
        match res {
            Ok(envelope) => Some(envelope),
            Err(TryRecvError::Empty | TryRecvError::Disconnected) => None,
        }
    }

    /// Stop accepting requests. Queued ones can still be taken.
    pub fn close(&mut self) {
        match &mut self.rx {
            Rx::Unbounded(rx) => rx.close(),
            Rx::Bounded(rx) => rx.close(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{Address, CommandDescriptor};
    use std::thread;

    fn request(connector: u8) -> RequestEnvelope {
        let addr = Address::new(1, connector).unwrap();
        RequestEnvelope::new(CommandDescriptor::get_state(&addr)).0
    }

    #[tokio::test]
    async fn fifo_across_threads() {
        let (tx, mut rx) = dispatch_queue(0);
        for connector in 1..=3 {
            let tx = tx.clone();
            thread::spawn(move || tx.enqueue(request(connector)).unwrap())
                .join()
                .unwrap();
        }
        for connector in 1..=3 {
            let env = rx.take_next().await.unwrap();
            assert_eq!(env.descriptor().connector(), connector.to_string());
        }
        assert!(rx.try_take().is_none());
    }

    #[tokio::test]
    async fn per_producer_order_is_kept() {
        let (tx, mut rx) = dispatch_queue(0);
        let producers = (0..3u8)
            .map(|module| {
                let tx = tx.clone();
                thread::spawn(move || {
                    for connector in 1..=9 {
                        let addr = Address::new(module, connector).unwrap();
                        tx.enqueue(RequestEnvelope::new(CommandDescriptor::get_state(&addr)).0)
                            .unwrap();
                    }
                })
            })
            .collect::<Vec<_>>();
        for p in producers {
            p.join().unwrap();
        }
        let mut last = [0u8; 3];
        for _ in 0..27 {
            let env = rx.take_next().await.unwrap();
            let module: usize = env.descriptor().module().parse().unwrap();
            let connector: u8 = env.descriptor().connector().parse().unwrap();
            assert_eq!(connector, last[module] + 1);
            last[module] = connector;
        }
    }

    #[tokio::test]
    async fn bounded_queue_is_full() {
        let (tx, mut rx) = dispatch_queue(2);
        tx.enqueue(request(1)).unwrap();
        tx.enqueue(request(2)).unwrap();
        assert!(matches!(tx.enqueue(request(3)), Err(Error::QueueFull)));
        rx.take_next().await.unwrap();
        tx.enqueue(request(3)).unwrap();
    }

    #[tokio::test]
    async fn closed_queue() {
        let (tx, mut rx) = dispatch_queue(0);
        tx.enqueue(request(1)).unwrap();
        rx.close();
        assert!(matches!(tx.enqueue(request(2)), Err(Error::Stopped)));
        assert!(rx.try_take().is_some());
        drop(tx);
        assert!(rx.take_next().await.is_none());
    }
}
