use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, never, Receiver};

use crate::error::{CrnnError, Result};

/// Runs a producer on its own thread, one item ahead of the consumer.
///
/// The channel holds a single item, so at most one finished item waits while
/// the consumer works on the previous one. Dropping the iterator closes the
/// channel and joins the producer once it fails its next send, so nothing it
/// owns outlives the iterator.
pub struct PrefetchIterator<T> {
    receiver: Receiver<T>,
    producer: Option<JoinHandle<()>>,
}

impl<T: Send + 'static> PrefetchIterator<T> {
    pub fn spawn<F>(mut produce: F) -> Self
    where
        F: FnMut() -> Option<T> + Send + 'static,
    {
        let (sender, receiver) = bounded(1);

        let producer = thread::spawn(move || {
            while let Some(item) = produce() {
                if sender.send(item).is_err() {
                    break;
                }
            }
        });

        PrefetchIterator {
            receiver,
            producer: Some(producer),
        }
    }

    /// Blocks for the next item; an exhausted or crashed producer is an error.
    pub fn recv(&self) -> Result<T> {
        self.receiver.recv().map_err(|_| CrnnError::ProducerDisconnected)
    }
}

impl<T> Iterator for PrefetchIterator<T> {
    type Item = T;

    fn next(&mut self) -> Option<Self::Item> {
        self.receiver.recv().ok()
    }
}

impl<T> Drop for PrefetchIterator<T> {
    fn drop(&mut self) {
        // Disconnect first so a producer blocked on send can return
        drop(std::mem::replace(&mut self.receiver, never()));
        if let Some(producer) = self.producer.take() {
            if producer.join().is_err() {
                tracing::warn!("batch producer panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn yields_items_in_order_then_stops() {
        let mut n = 0;
        let iter = PrefetchIterator::spawn(move || {
            n += 1;
            (n <= 5).then_some(n)
        });
        assert_eq!(iter.collect::<Vec<_>>(), vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn exhausted_producer_reports_disconnect() {
        let iter = PrefetchIterator::spawn(|| None::<u8>);
        assert!(matches!(iter.recv(), Err(CrnnError::ProducerDisconnected)));
    }

    #[test]
    fn dropping_stops_an_infinite_producer() {
        let mut iter = PrefetchIterator::spawn(|| Some(1u32));
        assert_eq!(iter.next(), Some(1));
        drop(iter);
    }

    #[test]
    fn drop_releases_what_the_producer_owns() {
        let shared = std::sync::Arc::new(());
        let held = shared.clone();
        let mut iter = PrefetchIterator::spawn(move || Some(std::sync::Arc::strong_count(&held)));
        assert!(iter.next().is_some());
        drop(iter);
        assert_eq!(std::sync::Arc::strong_count(&shared), 1);
    }
}
