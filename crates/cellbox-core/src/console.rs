//! Guest console watcher: tails the VM console socket into the host log
//! while debug consoles are enabled.

use std::path::PathBuf;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::UnixStream;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Background task tailing the guest console.
pub struct ConsoleWatcher {
    task: Option<JoinHandle<()>>,
}

impl ConsoleWatcher {
    /// Starts tailing the console at `path`. Only the `unix` protocol is
    /// supported; anything else is logged and ignored.
    #[must_use]
    pub fn start(sandbox_id: &str, protocol: &str, path: PathBuf) -> Self {
        if protocol != "unix" {
            debug!(sandbox = sandbox_id, protocol, "unsupported console protocol, not tailing");
            return Self { task: None };
        }
        let sandbox_id = sandbox_id.to_string();
        let task = tokio::spawn(async move {
            let stream = match UnixStream::connect(&path).await {
                Ok(stream) => stream,
                Err(e) => {
                    warn!(sandbox = %sandbox_id, path = %path.display(), error = %e,
                        "cannot open console socket");
                    return;
                }
            };
            let mut lines = BufReader::new(stream).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => debug!(sandbox = %sandbox_id, console = %line),
                    Ok(None) => break,
                    Err(e) => {
                        warn!(sandbox = %sandbox_id, error = %e, "console read failed");
                        break;
                    }
                }
            }
            debug!(sandbox = %sandbox_id, "console closed");
        });
        Self { task: Some(task) }
    }

    /// Stops tailing.
    pub fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for ConsoleWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}
