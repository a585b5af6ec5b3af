//! Termination and interrupt signals destined for the sandboxed child.

use nix::sys::signal::Signal;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// A queue of signals received by the launcher.
///
/// Once installed, `SIGINT` and `SIGTERM` no longer terminate the launcher;
/// they are queued here for the orchestrator to forward.
#[derive(Debug)]
pub struct ForwardedSignals {
    rx: mpsc::UnboundedReceiver<Signal>,
    listener: Option<JoinHandle<()>>,
}

impl ForwardedSignals {
    /// Starts listening for `SIGINT` and `SIGTERM`. Must run inside a tokio runtime.
    pub fn install() -> std::io::Result<Self> {
        use tokio::signal::unix::{signal, SignalKind};

        let mut term_signal = signal(SignalKind::terminate())?;
        let mut int_signal = signal(SignalKind::interrupt())?;
        let (tx, rx) = mpsc::unbounded_channel();

        let listener = tokio::spawn(async move {
            loop {
                let received = tokio::select! {
                    Some(()) = int_signal.recv() => Signal::SIGINT,
                    Some(()) = term_signal.recv() => Signal::SIGTERM,
                    else => break,
                };
                tracing::debug!("Received {}", received);
                if tx.send(received).is_err() {
                    break;
                }
            }
        });

        Ok(Self {
            rx,
            listener: Some(listener),
        })
    }

    /// A queue fed by hand instead of by the OS.
    pub fn channel() -> (mpsc::UnboundedSender<Signal>, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            tx,
            Self {
                rx,
                listener: None,
            },
        )
    }

    /// Takes a queued signal without waiting.
    pub fn pending(&mut self) -> Option<Signal> {
        self.rx.try_recv().ok()
    }

    /// Waits for the next signal. Returns `None` once no more can arrive.
    pub async fn recv(&mut self) -> Option<Signal> {
        self.rx.recv().await
    }
}

impl Drop for ForwardedSignals {
    fn drop(&mut self) {
        if let Some(listener) = self.listener.take() {
            listener.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_channel_queues_signals() {
        let (tx, mut signals) = ForwardedSignals::channel();
        assert_eq!(signals.pending(), None);

        tx.send(Signal::SIGTERM).unwrap();
        assert_eq!(signals.pending(), Some(Signal::SIGTERM));

        tx.send(Signal::SIGINT).unwrap();
        drop(tx);
        assert_eq!(signals.recv().await, Some(Signal::SIGINT));
        assert_eq!(signals.recv().await, None);
    }
}
