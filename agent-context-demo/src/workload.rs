//! Interleaved transactions that check, after every scheduler hop, whether the
//! ambient segment still belongs to them.

use std::cell::Cell;
use std::fmt::{Display, Formatter, Result as FmtResult};
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

use agent_context::{Context, ContextManager, ContextStrategy};
use anyhow::{Context as _, Error as AnyError};
use futures::future::join_all;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::datastore::{InstrumentedKv, KvClient};
use crate::tracer::{Segment, Tracer};

#[derive(Debug, Clone)]
pub struct WorkloadOptions {
    pub transactions: usize,
    /// Re-enter the transaction explicitly after every hop, the way
    /// instrumentation has to when the strategy does not propagate.
    pub rebind: bool,
    pub capture_attributes: bool,
    pub datastore_latency: Duration,
}

impl Default for WorkloadOptions {
    fn default() -> WorkloadOptions {
        WorkloadOptions {
            transactions: 8,
            rebind: false,
            capture_attributes: false,
            datastore_latency: Duration::from_millis(3),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkloadReport {
    pub strategy: ContextStrategy,
    pub transactions: usize,
    pub checkpoints: usize,
    pub misattributed: usize,
    pub segments: usize,
    pub datastore_segments: usize,
}

impl Display for WorkloadReport {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        writeln!(f, "strategy:           {}", self.strategy)?;
        writeln!(f, "transactions:       {}", self.transactions)?;
        writeln!(f, "checkpoints:        {}", self.checkpoints)?;
        writeln!(f, "misattributed:      {}", self.misattributed)?;
        writeln!(f, "segments:           {}", self.segments)?;
        write!(f, "datastore segments: {}", self.datastore_segments)
    }
}

#[derive(Default)]
struct Tally {
    checkpoints: Cell<usize>,
    misattributed: Cell<usize>,
}

impl Tally {
    fn check(&self, label: &str, expected: u64, observed: Option<u64>) {
        self.checkpoints.set(self.checkpoints.get() + 1);

        if observed != Some(expected) {
            self.misattributed.set(self.misattributed.get() + 1);
            warn!(expected, ?observed, "{label}: ambient segment belongs elsewhere");
        }
    }
}

/// Runs the workload to completion. Must be polled within a `LocalSet`.
pub async fn run_workload(
    tracer: Rc<Tracer>,
    options: &WorkloadOptions,
) -> Result<WorkloadReport, AnyError> {
    let kv = Rc::new(InstrumentedKv::new(
        KvClient::connect(options.datastore_latency),
        tracer.clone(),
        options.capture_attributes,
    ));
    let tally = Rc::new(Tally::default());

    let mut handles = Vec::with_capacity(options.transactions);
    for index in 0..options.transactions {
        let name = format!("WebTransaction/demo/{index}");
        let handle = tracer.start_transaction(&name, |root| {
            let flow = Flow {
                tracer: tracer.clone(),
                kv: kv.clone(),
                tally: tally.clone(),
                root,
                rebind: options.rebind,
            };

            tracer.manager().spawn_local(flow.run(index))
        });

        handles.push(handle);
    }

    for result in join_all(handles).await {
        result.context("transaction task panicked")??;
    }

    let segments = tracer.segments();
    let datastore_segments = segments
        .iter()
        .filter(|segment| segment.name.starts_with("Datastore/"))
        .count();

    Ok(WorkloadReport {
        strategy: tracer.manager().strategy(),
        transactions: options.transactions,
        checkpoints: tally.checkpoints.get(),
        misattributed: tally.misattributed.get(),
        segments: segments.len(),
        datastore_segments,
    })
}

struct Flow {
    tracer: Rc<Tracer>,
    kv: Rc<InstrumentedKv>,
    tally: Rc<Tally>,
    root: Arc<Segment>,
    rebind: bool,
}

impl Flow {
    /// Calls `f` with the transaction re-entered if rebinding, or with
    /// whatever happens to be ambient otherwise.
    fn enter<F: FnOnce() -> R, R>(&self, f: F) -> R {
        if self.rebind {
            let context = Context::with_segment(self.root.clone());
            self.tracer.manager().run_with_context(context, f)
        } else {
            f()
        }
    }

    fn checkpoint(&self, label: &str) {
        let observed = self.enter(|| self.tracer.current_transaction_id());
        self.tally.check(label, self.root.transaction_id, observed);
    }

    async fn run(self, index: usize) -> Result<(), AnyError> {
        self.checkpoint("first poll");

        // stagger the transactions so their hops interleave
        let jitter = Duration::from_millis((index as u64 * 7) % 5);
        tokio::time::sleep(jitter).await;
        self.checkpoint("after timer");

        let key = format!("session:{index}");
        let reply = self.enter(|| self.kv.send_command(&["SET", key.as_str(), "active"]));
        reply.await?;
        self.checkpoint("after set");

        let reply = self.enter(|| self.kv.send_command(&["GET", key.as_str()]));
        let value = reply.await?;
        self.checkpoint("after get");

        self.enter(|| match self.tracer.create_segment("render") {
            Some(segment) => debug!(segment = segment.id, "rendering {value:?}"),
            None => debug!("rendering {value:?} outside of a transaction"),
        });

        let (sender, receiver) = oneshot::channel();
        let in_callback = self.tracer.clone();
        let callback = move || {
            let _ = sender.send(in_callback.current_transaction_id());
        };

        let manager = self.tracer.manager();
        let deferred = if self.rebind {
            manager.defer(self.tracer.bind_function(Some(self.root.clone()), callback))
        } else {
            manager.defer(callback)
        };

        let observed = receiver.await.context("deferred callback was dropped")?;
        deferred.await.context("deferred callback panicked")?;
        self.tally
            .check("deferred callback", self.root.transaction_id, observed);

        let (sender, receiver) = oneshot::channel();
        let in_timer = self.tracer.clone();
        let timer = manager.set_timeout(Duration::from_millis(1), move || {
            let _ = sender.send(in_timer.current_transaction_id());
        });

        // a timer scheduled without rebinding shows what the strategy does
        // on its own
        let observed = receiver.await.context("timer callback was dropped")?;
        timer.await.context("timer callback panicked")?;
        if !self.rebind {
            self.tally
                .check("timer callback", self.root.transaction_id, observed);
        }

        Ok(())
    }
}
