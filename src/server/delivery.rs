//! Fixed-cadence delivery of the latest sample to one client.

use std::time::Duration;

use tokio::time::{self, MissedTickBehavior};

use super::ShutdownSignal;
use crate::{error::ChannelError, error::SendError, pipeline::SampleReceiver};

/// Transport seen by the delivery loop: one text message per send.
#[allow(async_fn_in_trait)]
pub trait ClientConnection: Send {
    async fn send_text(&mut self, text: String) -> Result<(), SendError>;

    /// Resolves once the peer has gone away. Must be cancel safe, it is
    /// raced against the tick timer on every iteration.
    async fn closed(&mut self);

    /// Best-effort close handshake.
    async fn close(&mut self);
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeliveryEnd {
    ClientDisconnected,
    ChannelTerminated(ChannelError),
    Shutdown,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DeliveryReport {
    pub sent: u64,
    pub failed: u64,
    pub end: DeliveryEnd,
}

/// Forwards at most one sample per tick until the client leaves, the channel
/// terminates or shutdown is signalled.
///
/// Idle ticks send nothing. Missed ticks are skipped rather than replayed, and
/// a failed send is never retried: the next tick carries a newer sample.
pub async fn run_delivery<C: ClientConnection>(
    conn: &mut C,
    samples: &SampleReceiver,
    interval: Duration,
    shutdown: &mut ShutdownSignal,
) -> DeliveryReport {
    let mut ticker = time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let mut sent = 0u64;
    let mut failed = 0u64;

    let end = loop {
        tokio::select! {
            biased;
            _ = shutdown.wait() => break DeliveryEnd::Shutdown,
            _ = conn.closed() => break DeliveryEnd::ClientDisconnected,
            _ = ticker.tick() => {}
        }

        let sample = match samples.try_recv() {
            Ok(Some(sample)) => sample,
            Ok(None) => continue,
            Err(err) => break DeliveryEnd::ChannelTerminated(err),
        };

        let payload = match serde_json::to_string(&sample) {
            Ok(payload) => payload,
            Err(err) => {
                failed += 1;
                log::warn!("failed to serialize sample: {err}");
                continue;
            }
        };

        let outcome = tokio::select! {
            biased;
            _ = shutdown.wait() => break DeliveryEnd::Shutdown,
            outcome = conn.send_text(payload) => outcome,
        };

        match outcome {
            Ok(()) => sent += 1,
            Err(SendError::Disconnected) => break DeliveryEnd::ClientDisconnected,
            Err(err @ SendError::Transient(_)) => {
                failed += 1;
                log::warn!("{err}");
            }
        }
    };

    DeliveryReport { sent, failed, end }
}

#[cfg(test)]
mod tests {
    use tokio::{
        sync::{oneshot, watch},
        time::Instant,
    };

    use super::*;
    use crate::{pipeline::sample_channel, types::Sample};

    #[derive(Default)]
    struct MockConnection {
        sent: Vec<(Instant, String)>,
        failures: Vec<SendError>,
        disconnect_rx: Option<oneshot::Receiver<()>>,
    }

    impl MockConnection {
        fn with_disconnect() -> (Self, oneshot::Sender<()>) {
            let (tx, rx) = oneshot::channel();
            let conn = Self {
                disconnect_rx: Some(rx),
                ..Default::default()
            };
            (conn, tx)
        }

        fn payloads(&self) -> Vec<Vec<f32>> {
            self.sent
                .iter()
                .map(|(_, text)| serde_json::from_str(text).unwrap())
                .collect()
        }
    }

    impl ClientConnection for MockConnection {
        async fn send_text(&mut self, text: String) -> Result<(), SendError> {
            if !self.failures.is_empty() {
                return Err(self.failures.remove(0));
            }
            self.sent.push((Instant::now(), text));
            Ok(())
        }

        async fn closed(&mut self) {
            match self.disconnect_rx.as_mut() {
                Some(rx) => {
                    let _ = rx.await;
                }
                None => std::future::pending::<()>().await,
            }
        }

        async fn close(&mut self) {}
    }

    fn idle_shutdown() -> (watch::Sender<bool>, ShutdownSignal) {
        let (tx, rx) = watch::channel(false);
        (tx, ShutdownSignal::new(rx))
    }

    #[tokio::test(start_paused = true)]
    async fn forwards_latest_sample_per_tick_without_backlog() {
        let (sender, receiver) = sample_channel();
        let (_shutdown_tx, mut shutdown) = idle_shutdown();
        let mut conn = MockConnection::default();
        let start = Instant::now();

        // Ten samples, one every 50ms starting at 5ms, then the writer leaves.
        let writer = tokio::spawn(async move {
            time::sleep(Duration::from_millis(5)).await;
            for i in 0..10 {
                sender.send(Sample(vec![i as f32])).unwrap();
                time::sleep(Duration::from_millis(50)).await;
            }
        });

        let report = run_delivery(
            &mut conn,
            &receiver,
            Duration::from_millis(100),
            &mut shutdown,
        )
        .await;
        writer.await.unwrap();

        assert_eq!(
            report.end,
            DeliveryEnd::ChannelTerminated(ChannelError::EndOfStream)
        );
        assert_eq!(report.sent, 5);
        assert_eq!(
            conn.payloads(),
            vec![vec![1.0], vec![3.0], vec![5.0], vec![7.0], vec![9.0]]
        );

        // Never more than one message per tick.
        let ticks: Vec<u128> = conn
            .sent
            .iter()
            .map(|(at, _)| (*at - start).as_millis() / 100)
            .collect();
        assert_eq!(ticks, vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_ticks_send_nothing() {
        let (_sender, receiver) = sample_channel();
        let (shutdown_tx, mut shutdown) = idle_shutdown();
        let mut conn = MockConnection::default();

        tokio::spawn(async move {
            time::sleep(Duration::from_secs(1)).await;
            shutdown_tx.send_replace(true);
        });

        let report =
            run_delivery(&mut conn, &receiver, Duration::from_millis(10), &mut shutdown).await;

        assert_eq!(report.end, DeliveryEnd::Shutdown);
        assert_eq!(report.sent, 0);
        assert!(conn.sent.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_ends_loop_within_one_tick() {
        let (sender, receiver) = sample_channel();
        let (_shutdown_tx, mut shutdown) = idle_shutdown();
        let (mut conn, disconnect) = MockConnection::with_disconnect();
        sender.send(Sample(vec![0.5])).unwrap();

        let start = Instant::now();
        tokio::spawn(async move {
            time::sleep(Duration::from_millis(250)).await;
            let _ = disconnect.send(());
        });

        let report =
            run_delivery(&mut conn, &receiver, Duration::from_millis(100), &mut shutdown).await;

        assert_eq!(report.end, DeliveryEnd::ClientDisconnected);
        assert!(start.elapsed() <= Duration::from_millis(350));
        assert_eq!(report.sent, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn writer_exit_terminates_cleanly() {
        let (sender, receiver) = sample_channel();
        let (_shutdown_tx, mut shutdown) = idle_shutdown();
        let mut conn = MockConnection::default();
        sender.close();

        let report =
            run_delivery(&mut conn, &receiver, Duration::from_millis(10), &mut shutdown).await;

        assert_eq!(
            report.end,
            DeliveryEnd::ChannelTerminated(ChannelError::EndOfStream)
        );
        assert_eq!(report.sent, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failure_is_skipped_not_retried() {
        let (sender, receiver) = sample_channel();
        let (_shutdown_tx, mut shutdown) = idle_shutdown();
        let mut conn = MockConnection {
            failures: vec![SendError::Transient("buffer full".into())],
            ..Default::default()
        };

        let writer = tokio::spawn(async move {
            sender.send(Sample(vec![1.0])).unwrap();
            time::sleep(Duration::from_millis(15)).await;
            sender.send(Sample(vec![2.0])).unwrap();
            time::sleep(Duration::from_millis(10)).await;
        });

        let report =
            run_delivery(&mut conn, &receiver, Duration::from_millis(10), &mut shutdown).await;
        writer.await.unwrap();

        assert_eq!(report.failed, 1);
        assert_eq!(report.sent, 1);
        assert_eq!(conn.payloads(), vec![vec![2.0]]);
    }

    #[tokio::test(start_paused = true)]
    async fn send_disconnect_ends_loop() {
        let (sender, receiver) = sample_channel();
        let (_shutdown_tx, mut shutdown) = idle_shutdown();
        let mut conn = MockConnection {
            failures: vec![SendError::Disconnected],
            ..Default::default()
        };
        sender.send(Sample(vec![1.0])).unwrap();

        let report =
            run_delivery(&mut conn, &receiver, Duration::from_millis(10), &mut shutdown).await;

        assert_eq!(report.end, DeliveryEnd::ClientDisconnected);
        assert_eq!(report.sent, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn sample_reaches_the_wire_unchanged() {
        let (sender, receiver) = sample_channel();
        let (_shutdown_tx, mut shutdown) = idle_shutdown();
        let mut conn = MockConnection::default();
        sender.send(Sample(vec![0.1, 0.9, 0.0])).unwrap();
        sender.close();

        run_delivery(&mut conn, &receiver, Duration::from_millis(10), &mut shutdown).await;

        assert_eq!(conn.payloads(), vec![vec![0.1, 0.9, 0.0]]);
    }
}
