//! The global FIFO gate that admits one car at a time into negotiation.
//!
//! Cars enqueue once, park in [`NegotiationQueue::wait_for_turn`] until they
//! are the head, negotiate, and then [`advance`](NegotiationQueue::advance)
//! exactly once. Waiting cars are woken through a [`Notify`] rather than by
//! polling. [`close`](NegotiationQueue::close) turns away every car still
//! waiting behind the head.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use spotnet_types::CarId;
use tokio::sync::{Mutex, Notify};
use tracing::debug;

use crate::error::QueueError;

/// FIFO of cars waiting to negotiate.
#[derive(Debug, Default)]
pub struct NegotiationQueue {
    order: Mutex<VecDeque<CarId>>,
    turn_changed: Notify,
    advances: AtomicU64,
    closed: AtomicBool,
}

impl NegotiationQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `car_id` to the back of the queue.
    pub async fn enqueue(&self, car_id: CarId) -> Result<(), QueueError> {
        let mut order = self.order.lock().await;
        if self.is_closed() {
            return Err(QueueError::Closed { car_id });
        }
        if order.contains(&car_id) {
            return Err(QueueError::AlreadyQueued { car_id });
        }
        order.push_back(car_id);
        debug!(car_id = %car_id, position = order.len(), "Car enqueued");
        Ok(())
    }

    /// The car currently allowed to negotiate.
    pub async fn head(&self) -> Option<CarId> {
        self.order.lock().await.front().copied()
    }

    /// Number of cars still queued, the negotiating one included.
    pub async fn len(&self) -> usize {
        self.order.lock().await.len()
    }

    /// Whether the queue is idle.
    pub async fn is_empty(&self) -> bool {
        self.order.lock().await.is_empty()
    }

    /// Park until `car_id` is at the head of the queue.
    ///
    /// Fails if the car is not queued at all, since it would otherwise
    /// wait forever.
    pub async fn wait_for_turn(&self, car_id: CarId) -> Result<(), QueueError> {
        loop {
            // Registered before the check so an advance in between is not missed.
            let turn_changed = self.turn_changed.notified();
            {
                let order = self.order.lock().await;
                if order.front() == Some(&car_id) {
                    return Ok(());
                }
                if !order.contains(&car_id) {
                    if self.is_closed() {
                        return Err(QueueError::Closed { car_id });
                    }
                    return Err(QueueError::NotQueued { car_id });
                }
            }
            turn_changed.await;
        }
    }

    /// Remove the head, which must be `car_id`, and wake every waiter.
    pub async fn advance(&self, car_id: CarId) -> Result<(), QueueError> {
        let next = {
            let mut order = self.order.lock().await;
            let head = order.front().copied();
            if head != Some(car_id) {
                return Err(QueueError::NotHead { car_id, head });
            }
            order.pop_front();
            order.front().copied()
        };
        self.advances.fetch_add(1, Ordering::AcqRel);
        debug!(
            car_id = %car_id,
            next = ?next,
            "Queue advanced"
        );
        self.turn_changed.notify_waiters();
        Ok(())
    }

    /// Stop admitting rounds.
    ///
    /// The head keeps its turn and may still advance; every car behind it
    /// is dropped and its [`wait_for_turn`](Self::wait_for_turn) fails with
    /// [`QueueError::Closed`]. Returns how many cars were turned away.
    pub async fn close(&self) -> usize {
        let turned_away = {
            let mut order = self.order.lock().await;
            self.closed.store(true, Ordering::Release);
            let keep = usize::from(!order.is_empty());
            order.split_off(keep).len()
        };
        debug!(turned_away, "Queue closed");
        self.turn_changed.notify_waiters();
        turned_away
    }

    /// Whether [`close`](Self::close) was called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// How many times the queue has advanced.
    pub fn advances(&self) -> u64 {
        self.advances.load(Ordering::Acquire)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn first_enqueued_car_is_head() {
        let queue = NegotiationQueue::new();
        let a = CarId::new();
        let b = CarId::new();
        queue.enqueue(a).await.unwrap();
        queue.enqueue(b).await.unwrap();
        assert_eq!(queue.head().await, Some(a));
        assert_eq!(queue.len().await, 2);
    }

    #[tokio::test]
    async fn duplicate_enqueue_is_rejected() {
        let queue = NegotiationQueue::new();
        let a = CarId::new();
        queue.enqueue(a).await.unwrap();
        assert!(matches!(
            queue.enqueue(a).await,
            Err(QueueError::AlreadyQueued { .. })
        ));
    }

    #[tokio::test]
    async fn only_the_head_may_advance() {
        let queue = NegotiationQueue::new();
        let a = CarId::new();
        let b = CarId::new();
        queue.enqueue(a).await.unwrap();
        queue.enqueue(b).await.unwrap();
        let err = queue.advance(b).await.unwrap_err();
        assert!(matches!(err, QueueError::NotHead { head: Some(h), .. } if h == a));
        assert_eq!(queue.advances(), 0);
    }

    #[tokio::test]
    async fn empty_queue_is_idle_not_an_error() {
        let queue = NegotiationQueue::new();
        assert!(queue.is_empty().await);
        assert_eq!(queue.head().await, None);
    }

    #[tokio::test]
    async fn waiting_for_an_unknown_car_fails() {
        let queue = NegotiationQueue::new();
        assert!(matches!(
            queue.wait_for_turn(CarId::new()).await,
            Err(QueueError::NotQueued { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn closing_turns_away_waiters_but_not_the_head() {
        let queue = Arc::new(NegotiationQueue::new());
        let head = CarId::new();
        let behind = CarId::new();
        queue.enqueue(head).await.unwrap();
        queue.enqueue(behind).await.unwrap();

        let waiter = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.wait_for_turn(behind).await })
        };
        tokio::time::sleep(Duration::from_millis(1)).await;

        assert_eq!(queue.close().await, 1);
        assert!(queue.is_closed());
        assert!(matches!(
            waiter.await.unwrap(),
            Err(QueueError::Closed { car_id }) if car_id == behind
        ));

        // The head still finishes its round normally.
        queue.wait_for_turn(head).await.unwrap();
        queue.advance(head).await.unwrap();
        assert!(queue.is_empty().await);
        assert!(matches!(
            queue.enqueue(CarId::new()).await,
            Err(QueueError::Closed { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn waiters_are_admitted_in_fifo_order() {
        let queue = Arc::new(NegotiationQueue::new());
        let cars: Vec<CarId> = (0..4).map(|_| CarId::new()).collect();
        for &car in &cars {
            queue.enqueue(car).await.unwrap();
        }

        let admitted = Arc::new(Mutex::new(Vec::new()));
        let mut tasks = Vec::new();
        // Spawn in reverse so task start order cannot explain the result.
        for &car in cars.iter().rev() {
            let queue = Arc::clone(&queue);
            let admitted = Arc::clone(&admitted);
            tasks.push(tokio::spawn(async move {
                queue.wait_for_turn(car).await.unwrap();
                admitted.lock().await.push(car);
                tokio::time::sleep(Duration::from_millis(10)).await;
                queue.advance(car).await.unwrap();
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(*admitted.lock().await, cars);
        assert_eq!(queue.advances(), 4);
        assert!(queue.is_empty().await);
    }

    #[tokio::test(start_paused = true)]
    async fn at_most_one_car_is_admitted_at_a_time() {
        let queue = Arc::new(NegotiationQueue::new());
        let active = Arc::new(AtomicU64::new(0));
        let peak = Arc::new(AtomicU64::new(0));
        let mut tasks = Vec::new();

        for _ in 0..5 {
            let car = CarId::new();
            queue.enqueue(car).await.unwrap();
            let queue = Arc::clone(&queue);
            let active = Arc::clone(&active);
            let peak = Arc::clone(&peak);
            tasks.push(tokio::spawn(async move {
                queue.wait_for_turn(car).await.unwrap();
                let now = active.fetch_add(1, Ordering::AcqRel).saturating_add(1);
                peak.fetch_max(now, Ordering::AcqRel);
                tokio::time::sleep(Duration::from_millis(5)).await;
                active.fetch_sub(1, Ordering::AcqRel);
                queue.advance(car).await.unwrap();
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(peak.load(Ordering::Acquire), 1);
    }
}
