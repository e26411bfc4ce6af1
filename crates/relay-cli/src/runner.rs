//! Process supervisor: runs the long-lived processes until one fails or a
//! shutdown signal arrives, then runs the closers under a timeout.

use std::future::Future;
use std::pin::Pin;
use std::process::ExitCode;
use std::time::Duration;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

pub type AppProcess = Box<
    dyn FnOnce(CancellationToken) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>
        + Send,
>;

pub type Closer = Box<dyn FnOnce() -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>> + Send>;

/// How a `Runner` finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// Every process returned `Ok` without a signal.
    Completed,
    /// A process failed or panicked.
    Failed,
    /// SIGINT or SIGTERM stopped the processes.
    Signalled,
}

impl RunOutcome {
    /// A relay that stops on its own is not expected, so only `Completed`
    /// maps to success.
    pub fn exit_code(self) -> ExitCode {
        match self {
            RunOutcome::Completed => ExitCode::SUCCESS,
            RunOutcome::Failed | RunOutcome::Signalled => ExitCode::FAILURE,
        }
    }
}

pub struct Runner {
    processes: Vec<(&'static str, AppProcess)>,
    closers: Vec<Closer>,
    closer_timeout: Duration,
    token: CancellationToken,
}

impl Runner {
    pub fn new() -> Self {
        Self {
            processes: Vec::new(),
            closers: Vec::new(),
            closer_timeout: Duration::from_secs(10),
            token: CancellationToken::new(),
        }
    }

    /// Processes share one token. A process returning an error cancels it.
    pub fn with_process<F, Fut>(mut self, name: &'static str, process: F) -> Self
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.processes
            .push((name, Box::new(|token| Box::pin(process(token)))));
        self
    }

    /// Closers run after every process has stopped, whatever the reason.
    pub fn with_closer<F, Fut>(mut self, closer: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.closers.push(Box::new(|| Box::pin(closer())));
        self
    }

    pub fn with_closer_timeout(mut self, timeout: Duration) -> Self {
        self.closer_timeout = timeout;
        self
    }

    /// Run every process to completion, then the closers.
    pub async fn run(self) -> RunOutcome {
        let token = self.token;
        let mut join_set = JoinSet::new();

        for (name, process) in self.processes {
            let process_token = token.clone();
            join_set.spawn(async move { (name, process(process_token).await) });
        }

        let signalled = CancellationToken::new();
        tokio::spawn(wait_for_signal(token.clone(), signalled.clone()));

        let mut failed = false;
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((name, Ok(()))) => {
                    tracing::info!(process = name, "process stopped");
                }
                Ok((name, Err(err))) => {
                    tracing::error!(process = name, error = %format!("{err:#}"), "process failed");
                    failed = true;
                }
                Err(err) => {
                    tracing::error!(error = %err, "process panicked");
                    failed = true;
                }
            }
            // The remaining processes observe the token and drain.
            token.cancel();
        }

        if !self.closers.is_empty() {
            tracing::info!(timeout = ?self.closer_timeout, "running closers");
            match tokio::time::timeout(self.closer_timeout, run_closers(self.closers)).await {
                Ok(()) => tracing::info!("all closers completed"),
                Err(_) => tracing::error!(timeout = ?self.closer_timeout, "closers timed out"),
            }
        }

        let outcome = if failed {
            RunOutcome::Failed
        } else if signalled.is_cancelled() {
            RunOutcome::Signalled
        } else {
            RunOutcome::Completed
        };
        tracing::info!(outcome = ?outcome, "relay exiting");
        outcome
    }
}

async fn wait_for_signal(token: CancellationToken, signalled: CancellationToken) {
    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                tracing::error!(error = %err, "cannot install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = token.cancelled() => return,
        result = tokio::signal::ctrl_c() => {
            if let Err(err) = result {
                tracing::error!(error = %err, "cannot install SIGINT handler");
                return;
            }
            tracing::info!("received SIGINT");
        }
        _ = terminate => {
            tracing::info!("received SIGTERM");
        }
    }

    signalled.cancel();
    token.cancel();
}

async fn run_closers(closers: Vec<Closer>) {
    let mut closer_set = JoinSet::new();
    for closer in closers {
        closer_set.spawn(closer());
    }

    while let Some(result) = closer_set.join_next().await {
        match result {
            Ok(Ok(())) => tracing::debug!("closer completed"),
            Ok(Err(err)) => tracing::error!(error = %format!("{err:#}"), "closer failed"),
            Err(err) => tracing::error!(error = %err, "closer panicked"),
        }
    }
}
