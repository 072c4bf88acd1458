use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, oneshot};

use crate::{ExecRequest, ExecResult};

/// A nested process request plus the slot its result goes back through.
#[derive(Debug)]
pub struct SpawnMsg {
    pub request: ExecRequest,
    pub reply: oneshot::Sender<ExecResult>,
}

pub type SpawnInbox = mpsc::UnboundedReceiver<SpawnMsg>;

/// An error that ends the whole top-level execution, not just one process.
pub type FatalError = Box<dyn std::error::Error + Send + Sync>;

/// Holds the first fatal error a running sandbox reported. Shared between a
/// [`Spawner`] and whoever launched the sandbox.
#[derive(Clone, Debug, Default)]
pub struct FatalSlot(Arc<Mutex<Option<FatalError>>>);

impl FatalSlot {
    /// Later reports are logged and dropped; the first one wins.
    pub fn set(&self, err: FatalError) {
        let mut slot = self.0.lock().expect("fatal slot poisoned");
        match &*slot {
            Some(first) => tracing::debug!(first = %first, dropped = %err, "fatal error already reported"),
            None => *slot = Some(err),
        }
    }

    pub fn take(&self) -> Option<FatalError> {
        self.0.lock().expect("fatal slot poisoned").take()
    }
}

/// Handle a running sandbox uses to start another logical process.
///
/// The receiving side belongs to whoever launched the sandbox; requests are
/// answered in submission order.
#[derive(Clone, Debug)]
pub struct Spawner {
    tx: Option<mpsc::UnboundedSender<SpawnMsg>>,
    fatal: FatalSlot,
}

impl Spawner {
    pub fn channel() -> (Spawner, SpawnInbox) {
        let (tx, rx) = mpsc::unbounded_channel();
        let spawner = Spawner {
            tx: Some(tx),
            fatal: FatalSlot::default(),
        };
        (spawner, rx)
    }

    /// A spawner that answers every request with a failure.
    pub fn detached() -> Spawner {
        Spawner {
            tx: None,
            fatal: FatalSlot::default(),
        }
    }

    /// The slot [`Spawner::report_fatal`] writes to.
    pub fn fatal_slot(&self) -> FatalSlot {
        self.fatal.clone()
    }

    /// Report an error the sandbox cannot turn into an exit code, such as a
    /// failed fetch. The launcher fails the execution once the sandbox returns.
    pub fn report_fatal(&self, err: impl Into<FatalError>) {
        let err = err.into();
        tracing::warn!(error = %err, "sandbox reported a fatal error");
        self.fatal.set(err);
    }

    pub async fn spawn(&self, request: ExecRequest) -> ExecResult {
        match self.submit(request) {
            Ok(rx) => rx.await.unwrap_or_else(|_| unavailable(&"request dropped")),
            Err(result) => result,
        }
    }

    /// Blocking variant for code running outside the async runtime (e.g. a
    /// wasm instance on a blocking thread). Panics if called from async context.
    pub fn spawn_blocking(&self, request: ExecRequest) -> ExecResult {
        match self.submit(request) {
            Ok(rx) => rx
                .blocking_recv()
                .unwrap_or_else(|_| unavailable(&"request dropped")),
            Err(result) => result,
        }
    }

    fn submit(&self, request: ExecRequest) -> Result<oneshot::Receiver<ExecResult>, ExecResult> {
        let Some(tx) = &self.tx else {
            return Err(unavailable(&"no dispatcher attached"));
        };
        let (reply, rx) = oneshot::channel();
        tx.send(SpawnMsg { request, reply })
            .map_err(|_| unavailable(&"dispatcher gone"))?;
        Ok(rx)
    }
}

fn unavailable(reason: &dyn std::fmt::Display) -> ExecResult {
    ExecResult::failure(1, format!("process spawning unavailable: {reason}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn detached_spawner_fails_softly() {
        let result = Spawner::detached().spawn(ExecRequest::new(["/bin/true"])).await;
        assert_eq!(result.returncode, 1);
        assert!(result.stderr.contains("no dispatcher attached"));
    }

    #[tokio::test]
    async fn requests_round_trip_through_inbox() {
        let (spawner, mut inbox) = Spawner::channel();
        let server = tokio::spawn(async move {
            while let Some(msg) = inbox.recv().await {
                let argv = msg.request.argv.join(" ");
                let _ = msg.reply.send(ExecResult::success(argv));
            }
        });

        let result = spawner.spawn(ExecRequest::new(["echo", "hi"])).await;
        assert_eq!(result, ExecResult::success("echo hi"));

        let blocking = spawner.clone();
        let result = tokio::task::spawn_blocking(move || {
            blocking.spawn_blocking(ExecRequest::new(["cc", "-c"]))
        })
        .await
        .unwrap();
        assert_eq!(result.stdout, "cc -c");

        drop(spawner);
        server.await.unwrap();
    }

    #[test]
    fn first_fatal_report_is_kept() {
        let (spawner, _inbox) = Spawner::channel();
        let slot = spawner.fatal_slot();
        assert!(slot.take().is_none());

        let clone = spawner.clone();
        clone.report_fatal("fetch failed");
        spawner.report_fatal("second");
        assert_eq!(slot.take().unwrap().to_string(), "fetch failed");
        assert!(slot.take().is_none());
    }

    #[tokio::test]
    async fn closed_inbox_reports_failure() {
        let (spawner, inbox) = Spawner::channel();
        drop(inbox);
        let result = spawner.spawn(ExecRequest::new(["x"])).await;
        assert!(result.stderr.contains("dispatcher gone"));
    }
}
