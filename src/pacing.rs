use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;

/// Spaces out deliveries to the UI so fast streams still read like typing.
///
/// A delivery that comes too soon after the previous one waits out the rest of
/// the interval. Nothing is dropped or merged and order is kept.
#[derive(Debug)]
pub struct PacingScheduler {
    interval: Duration,
    last_delivery: Option<Instant>,
}

impl PacingScheduler {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_delivery: None,
        }
    }

    pub async fn schedule<T, F, Fut>(&mut self, item: T, deliver: F) -> Fut::Output
    where
        F: FnOnce(T) -> Fut,
        Fut: Future,
    {
        if let Some(last) = self.last_delivery {
            let elapsed = last.elapsed();
            if elapsed < self.interval {
                tokio::time::sleep(self.interval - elapsed).await;
            }
        }
        self.last_delivery = Some(Instant::now());
        deliver(item).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[tokio::test(start_paused = true)]
    async fn bursts_are_spread_by_interval() {
        let mut pacer = PacingScheduler::new(Duration::from_millis(20));
        let log = Arc::new(Mutex::new(Vec::new()));

        for i in 0..5 {
            let log = log.clone();
            pacer
                .schedule(i, |i| async move {
                    log.lock().unwrap().push((i, Instant::now()));
                })
                .await;
        }

        let log = log.lock().unwrap();
        let order: Vec<i32> = log.iter().map(|(i, _)| *i).collect();
        assert_eq!(order, vec![0, 1, 2, 3, 4]);
        for pair in log.windows(2) {
            assert!(pair[1].1 - pair[0].1 >= Duration::from_millis(20));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn late_delivery_is_not_delayed() {
        let mut pacer = PacingScheduler::new(Duration::from_millis(20));
        pacer.schedule((), |_| async {}).await;

        tokio::time::sleep(Duration::from_millis(50)).await;
        let before = Instant::now();
        let delivered_at = pacer.schedule((), |_| async { Instant::now() }).await;
        assert_eq!(delivered_at, before);
    }

    #[tokio::test(start_paused = true)]
    async fn early_delivery_waits_only_the_remainder() {
        let mut pacer = PacingScheduler::new(Duration::from_millis(20));
        let first = pacer.schedule((), |_| async { Instant::now() }).await;

        tokio::time::sleep(Duration::from_millis(15)).await;
        let second = pacer.schedule((), |_| async { Instant::now() }).await;
        assert_eq!(second - first, Duration::from_millis(20));
    }
}
