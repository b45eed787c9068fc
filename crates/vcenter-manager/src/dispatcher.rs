//! Routes property changes to the handlers watching them.

use tracing::{debug, error, warn};
use vcm_common::{ChangeBatch, VcmResult};

use crate::handlers::{default_handlers, ChangeHandler};
use crate::reconciler::Reconciler;

/// Dispatch table of change handlers, in registration order.
pub struct Dispatcher {
    handlers: Vec<Box<dyn ChangeHandler>>,
}

impl Dispatcher {
    /// An empty dispatcher.
    pub fn new() -> Self {
        Self {
            handlers: Vec::new(),
        }
    }

    pub fn with_default_handlers() -> Self {
        Self {
            handlers: default_handlers(),
        }
    }

    /// Appends a handler; it runs after every handler registered before it.
    pub fn register(&mut self, handler: Box<dyn ChangeHandler>) {
        self.handlers.push(handler);
    }

    pub fn handler_names(&self) -> Vec<&'static str> {
        self.handlers.iter().map(|h| h.name()).collect()
    }

    /// Applies a batch of changes.
    ///
    /// Every change goes to each handler whose watched property is a
    /// prefix of the change's property name. A lost connection aborts the
    /// batch; any other failure is logged and the batch continues.
    pub async fn dispatch(&self, reconciler: &mut Reconciler, batch: &ChangeBatch) -> VcmResult<()> {
        for update in &batch.updates {
            for change in &update.changes {
                let mut matched = false;
                for handler in self
                    .handlers
                    .iter()
                    .filter(|h| change.name.starts_with(h.watched()))
                {
                    matched = true;
                    match handler.handle(reconciler, &update.object, change).await {
                        Ok(()) => {}
                        Err(e) if e.is_connection_lost() => return Err(e),
                        Err(e) if e.is_stale() => warn!(
                            handler = handler.name(),
                            object = %update.object,
                            error = %e,
                            "Object vanished while handling change"
                        ),
                        Err(e) => error!(
                            handler = handler.name(),
                            object = %update.object,
                            property = %change.name,
                            error = %e,
                            "Change handler failed"
                        ),
                    }
                }
                if !matched {
                    debug!(property = %change.name, "no handler for property");
                }
            }
        }
        Ok(())
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::with_default_handlers()
    }
}
