use snafu::{ResultExt, Snafu};
use tokio::{
    signal::unix::{SignalKind, signal},
    sync::watch,
};

#[derive(Debug, Snafu)]
#[snafu(display("failed to register {signal} handler"))]
pub struct SignalError {
    source: std::io::Error,
    signal: &'static str,
}

/// Broadcasts process shutdown to every controller loop and server.
///
/// Each consumer takes its own [`SignalWatcher::handle`], all of them
/// complete together once the watched future resolves.
#[derive(Clone, Debug)]
pub struct SignalWatcher {
    fired: watch::Receiver<bool>,
}

impl SignalWatcher {
    /// Fires once `trigger` completes.
    pub fn new(trigger: impl Future<Output = ()> + Send + 'static) -> Self {
        let (fired_tx, fired) = watch::channel(false);

        tokio::spawn(async move {
            trigger.await;
            fired_tx.send_replace(true);
        });

        Self { fired }
    }

    /// Fires on the first `SIGTERM` or `SIGINT`.
    pub fn termination() -> Result<Self, SignalError> {
        // Registered up front so a failure is reported before any controller
        // starts.
        let mut sigterm =
            signal(SignalKind::terminate()).context(SignalSnafu { signal: "SIGTERM" })?;
        let mut sigint =
            signal(SignalKind::interrupt()).context(SignalSnafu { signal: "SIGINT" })?;

        Ok(Self::new(async move {
            tokio::select! {
                _ = sigterm.recv() => tracing::info!("received SIGTERM, shutting down"),
                _ = sigint.recv() => tracing::info!("received SIGINT, shutting down"),
            }
        }))
    }

    /// A future completing once the signal fired, also when it fired before
    /// the handle was taken.
    pub fn handle(&self) -> impl Future<Output = ()> + Send + 'static {
        let mut fired = self.fired.clone();

        async move {
            // An error means the sender is gone without firing, which only
            // happens when the runtime shuts down.
            fired.wait_for(|fired| *fired).await.ok();
        }
    }
}
