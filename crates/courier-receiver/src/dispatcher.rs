// Push-delivery worker.
//
// One task per receiver. It parks on the gate until either a handler is
// installed (Run) or termination closes the gate first (Stop), so a receiver
// used only through `receive_message` never spins a consumer. Once running it
// drains the buffer into whatever handler is current; the handler cell is an
// `ArcSwapOption`, so `receive_async` can replace it between deliveries.
use arc_swap::ArcSwapOption;
use courier_transport::Transport;
use parking_lot::Mutex;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::buffer::{InboundBuffer, OnceSignal};
use crate::message::{MessageHandler, into_message};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DispatchGate {
    Waiting,
    Run,
    Stop,
}

pub(crate) struct Dispatcher {
    gate: watch::Sender<DispatchGate>,
    handler: Arc<ArcSwapOption<MessageHandler>>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Dispatcher {
    pub(crate) fn new() -> Self {
        Self {
            gate: watch::Sender::new(DispatchGate::Waiting),
            handler: Arc::new(ArcSwapOption::empty()),
            cancel: CancellationToken::new(),
            task: Mutex::new(None),
        }
    }

    pub(crate) fn spawn(
        &self,
        runtime: &Handle,
        buffer: Arc<InboundBuffer>,
        drained: Arc<OnceSignal>,
        transport: Arc<dyn Transport>,
    ) {
        let worker = DispatchWorker {
            gate: self.gate.subscribe(),
            handler: Arc::clone(&self.handler),
            cancel: self.cancel.clone(),
            buffer,
            drained,
            transport,
        };
        *self.task.lock() = Some(runtime.spawn(worker.run()));
    }

    /// Installs or replaces the push handler; the first one opens the gate.
    pub(crate) fn set_handler(&self, handler: MessageHandler) {
        self.handler.store(Some(Arc::new(handler)));
        self.open_gate(DispatchGate::Run);
    }

    /// Closes the gate if no handler ever opened it.
    pub(crate) fn stop_gate(&self) {
        self.open_gate(DispatchGate::Stop);
    }

    fn open_gate(&self, to: DispatchGate) {
        self.gate.send_if_modified(|gate| {
            if *gate == DispatchGate::Waiting {
                *gate = to;
                true
            } else {
                false
            }
        });
    }

    /// Interrupts the next buffer pop. An in-flight handler call is left to finish.
    pub(crate) fn cancel(&self) {
        self.cancel.cancel();
    }

    pub(crate) async fn join(&self) {
        let task = self.task.lock().take();
        if let Some(task) = task
            && let Err(err) = task.await
        {
            warn!(error = %err, "dispatcher task failed");
        }
    }
}

struct DispatchWorker {
    gate: watch::Receiver<DispatchGate>,
    handler: Arc<ArcSwapOption<MessageHandler>>,
    cancel: CancellationToken,
    buffer: Arc<InboundBuffer>,
    drained: Arc<OnceSignal>,
    transport: Arc<dyn Transport>,
}

impl DispatchWorker {
    async fn run(mut self) {
        let opened = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => DispatchGate::Stop,
            gate = self.gate.wait_for(|gate| *gate != DispatchGate::Waiting) => match gate {
                Ok(gate) => *gate,
                Err(_) => DispatchGate::Stop,
            },
        };
        if opened != DispatchGate::Run {
            debug!("dispatcher stopped before a handler was installed");
            return;
        }
        loop {
            // Checked first so pending data cannot starve a force-stop.
            if self.cancel.is_cancelled() {
                debug!("dispatcher cancelled");
                return;
            }
            let envelope = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    debug!("dispatcher cancelled");
                    return;
                }
                envelope = self.buffer.pop() => envelope,
            };
            let Some(envelope) = envelope else {
                if self.drained.fire() {
                    debug!("inbound buffer drained");
                }
                return;
            };
            let message = into_message(envelope, self.transport.as_ref());
            let Some(handler) = self.handler.load_full() else {
                continue;
            };
            if catch_unwind(AssertUnwindSafe(|| (*handler)(message))).is_err() {
                metrics::counter!("courier_receiver_callback_panics_total").increment(1);
                warn!("message handler panicked; delivery continues");
            }
        }
    }
}
