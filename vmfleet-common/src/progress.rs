//! Terminal progress spinner.
//!
//! A [`Spinner`] owns a background task that redraws a single status line
//! on stderr every 100ms. Stopping it (when the wrapped operation ends or the
//! guard is dropped) always clears the line before anything else is printed.

use std::future::Future;
use std::io::{IsTerminal, Write};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;

const FRAMES: [char; 4] = ['|', '/', '-', '\\'];
const TICK: Duration = Duration::from_millis(100);

/// Returned by [`Spinner::wrap`] when the user pressed Ctrl-C before the
/// wrapped operation finished.
#[derive(Debug, Error)]
#[error("interrupted while {0}")]
pub struct Interrupted(pub String);

/// Owned handle to a running spinner.
pub struct Spinner {
    stop: Option<watch::Sender<bool>>,
    task: Option<JoinHandle<()>>,
}

impl Spinner {
    /// Start a spinner with the given message.
    ///
    /// Nothing is drawn when stderr is not a terminal, but the guard behaves
    /// the same way.
    fn start(message: impl Into<String>) -> Self {
        Self::spawn(message.into(), std::io::stderr().is_terminal())
    }

    fn spawn(message: String, draw: bool) -> Self {
        let (stop, mut stopped) = watch::channel(false);

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(TICK);
            let mut frame = 0usize;
            loop {
                tokio::select! {
                    _ = stopped.changed() => break,
                    _ = ticker.tick() => {
                        if draw {
                            let mut err = std::io::stderr().lock();
                            let _ = write!(err, "\r{} {}", FRAMES[frame % FRAMES.len()], message);
                            let _ = err.flush();
                        }
                        frame = frame.wrapping_add(1);
                    }
                }
            }
            if draw {
                let mut err = std::io::stderr().lock();
                let _ = write!(err, "\r\x1b[2K");
                let _ = err.flush();
            }
        });

        Self {
            stop: Some(stop),
            task: Some(task),
        }
    }

    /// Stop the spinner, wait for its line to be cleared, then print `line`
    /// (if non-empty) on stderr.
    async fn finish(mut self, line: &str) {
        self.shutdown().await;
        if !line.is_empty() {
            eprintln!("{}", line);
        }
    }

    /// Run `operation` under a spinner.
    ///
    /// Ctrl-C cancels the operation by dropping its future, tears the spinner
    /// down, prints a one-line notice and returns [`Interrupted`] so the
    /// caller can unwind normally.
    pub async fn wrap<F>(message: &str, operation: F) -> Result<F::Output, Interrupted>
    where
        F: Future,
    {
        let spinner = Self::start(message);
        tokio::pin!(operation);
        let outcome = tokio::select! {
            output = &mut operation => Some(Ok(output)),
            signal = tokio::signal::ctrl_c() => {
                signal.is_ok().then(|| Err(Interrupted(message.to_string())))
            }
        };
        // Without a usable signal handler the operation simply runs to completion.
        let result = match outcome {
            Some(result) => result,
            None => Ok(operation.await),
        };
        let notice = match &result {
            Err(interrupted) => interrupted.to_string(),
            Ok(_) => String::new(),
        };
        spinner.finish(&notice).await;
        result
    }

    async fn shutdown(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(true);
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for Spinner {
    fn drop(&mut self) {
        // The task observes the closed channel and clears its line on its own.
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(true);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_finish_joins_task() {
        let spinner = Spinner::spawn("working".to_string(), false);
        tokio::time::sleep(Duration::from_millis(250)).await;

        tokio::time::timeout(Duration::from_secs(1), spinner.finish(""))
            .await
            .expect("spinner did not stop");
    }

    #[tokio::test]
    async fn test_drop_stops_task() {
        let mut spinner = Spinner::spawn("working".to_string(), false);
        let task = spinner.task.take().unwrap();
        drop(spinner);

        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("spinner task outlived its guard")
            .unwrap();
    }

    #[tokio::test]
    async fn test_wrap_returns_operation_output() {
        let value = Spinner::wrap("computing", async { 40 + 2 }).await.unwrap();
        assert_eq!(value, 42);
    }
}
