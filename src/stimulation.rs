//! The stimulation driver: owns one cascade from a root signal (or signals)
//! through to completion.
//!
//! All dispatcher-state mutation — the deque, `activeOperations`,
//! `scheduledCount`, `visits`, `failedTasks`, the dedup set — lives behind a
//! single short-held `parking_lot::Mutex<DriverState>`. On a cooperative,
//! single-threaded event loop (the shape this driver is modeled on) that
//! state needs no lock at all; on tokio, many activation tasks run
//! concurrently, so the mutex is this implementation's single serialization
//! point — the "single worker task + channel" redesign a preemptive runtime
//! calls for, expressed as mutual exclusion around state transitions rather
//! than as an explicit channel-fed worker loop. No task ever holds the lock
//! across an `.await`.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info_span, warn, Instrument};

use crate::abort::AbortHandle;
use crate::collateral::{ReactionOutput, Signal};
use crate::context::{ContextStore, ContextValue};
use crate::error::{NeuronError, Result};
use crate::facade::Cns;
use crate::graph::ActiveSccCounts;
use crate::neuron::{BoxFuture, LocalContext};
use crate::pump::{run_activation, ActivationOutcome};

/// A unit of work that will invoke one dendrite with one input signal.
/// Deleted (in the sense of no longer tracked) once its handler terminates
/// and the result has been dispatched.
#[derive(Clone)]
pub struct ActivationTask {
    pub stimulation_id: Arc<str>,
    pub neuron_name: String,
    pub dendrite_collateral_name: String,
    pub dendrite_index: usize,
    pub input_signal: Option<Signal>,
    pub hop: u32,
}

impl fmt::Debug for ActivationTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActivationTask")
            .field("stimulation_id", &self.stimulation_id)
            .field("neuron_name", &self.neuron_name)
            .field("dendrite_collateral_name", &self.dendrite_collateral_name)
            .field("hop", &self.hop)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct FailedTask {
    pub task: ActivationTask,
    pub error: NeuronError,
    pub aborted: bool,
}

/// Observation delivered to the trace callback once per dispatched output
/// (or once with `output_signal = None` when a handler returns nothing or
/// fails).
#[derive(Clone)]
pub struct ResponseRecord {
    pub input_signal: Option<Signal>,
    pub output_signal: Option<Signal>,
    pub context_snapshot: HashMap<String, ContextValue>,
    pub queue_length: usize,
    pub stimulation_id: Arc<str>,
    pub hops: Option<u32>,
    pub error: Option<NeuronError>,
}

impl fmt::Debug for ResponseRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseRecord")
            .field("input_signal", &self.input_signal)
            .field("output_signal", &self.output_signal)
            .field("context_keys", &self.context_snapshot.keys().collect::<Vec<_>>())
            .field("queue_length", &self.queue_length)
            .field("stimulation_id", &self.stimulation_id)
            .field("hops", &self.hops)
            .field("error", &self.error)
            .finish()
    }
}

pub type OnResponseFuture = BoxFuture<'static, anyhow::Result<()>>;
pub type OnResponseFn = Arc<dyn Fn(ResponseRecord) -> OnResponseFuture + Send + Sync>;

/// The serializable subset of a stimulation's tunables. Split out from
/// [`StimulationOptions`] because a `ctx`/`abortSignal`/`onResponse` cannot
/// meaningfully round-trip through serde — a host application that loads its
/// concurrency/hop-cap defaults from a config file only needs this part.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct StimulationConfig {
    pub concurrency: Option<usize>,
    pub max_neuron_hops: Option<u32>,
}

impl Default for StimulationConfig {
    fn default() -> Self {
        Self { concurrency: None, max_neuron_hops: None }
    }
}

#[derive(Default)]
pub struct StimulationOptions {
    pub config: StimulationConfig,
    pub ctx: Option<Arc<ContextStore>>,
    pub context_values: Option<HashMap<String, ContextValue>>,
    pub stimulation_id: Option<String>,
    pub abort_signal: Option<AbortHandle>,
    pub on_response: Option<OnResponseFn>,
}

#[derive(Default)]
struct DriverState {
    deque: crate::deque::SignalDeque<ActivationTask>,
    failed_tasks: Vec<FailedTask>,
    visits: HashMap<String, u32>,
    dispatched: HashSet<(String, String, u32)>,
    scheduled_count: usize,
    active_operations: usize,
    onresponse_error: Option<NeuronError>,
    completed: bool,
}

impl DriverState {
    fn outstanding(&self) -> usize {
        self.deque.len() + self.scheduled_count
    }
}

struct Shared {
    cns: Cns,
    context: Arc<ContextStore>,
    stimulation_id: Arc<str>,
    abort_signal: AbortHandle,
    concurrency_limit: usize,
    max_neuron_hops: Option<u32>,
    on_response: Option<OnResponseFn>,
    active_scc: Option<ActiveSccCounts>,
    state: Mutex<DriverState>,
    completion_tx: watch::Sender<Option<Result<()>>>,
}

/// Returned immediately by [`Cns::stimulate`]; the cascade itself runs on a
/// spawned task.
pub struct StimulationHandle {
    shared: Arc<Shared>,
    completion_rx: watch::Receiver<Option<Result<()>>>,
    extra_tx: mpsc::UnboundedSender<ActivationTask>,
}

impl StimulationHandle {
    pub async fn wait_until_complete(&self) -> Result<()> {
        let mut rx = self.completion_rx.clone();
        loop {
            if let Some(result) = rx.borrow().clone() {
                return result;
            }
            if rx.changed().await.is_err() {
                return Ok(());
            }
        }
    }

    pub fn get_all_activation_tasks(&self) -> Vec<ActivationTask> {
        self.shared.state.lock().deque.snapshot()
    }

    pub fn get_failed_tasks(&self) -> Vec<FailedTask> {
        self.shared.state.lock().failed_tasks.clone()
    }

    pub fn get_context(&self) -> Arc<ContextStore> {
        Arc::clone(&self.shared.context)
    }

    /// Enqueue externally-constructed tasks into the running cascade, e.g.
    /// to replay a previously recorded seed.
    pub fn enqueue_tasks(&self, tasks: Vec<ActivationTask>) {
        for task in tasks {
            let _ = self.extra_tx.send(task);
        }
    }
}

pub struct StimulationDriver;

impl StimulationDriver {
    pub(crate) fn start(cns: Cns, signals: Vec<Signal>, options: StimulationOptions) -> StimulationHandle {
        let stimulation_id: Arc<str> =
            Arc::from(options.stimulation_id.clone().unwrap_or_else(short_id));

        let context = options.ctx.unwrap_or_else(|| {
            Arc::new(match options.context_values {
                Some(values) => ContextStore::seeded(values),
                None => ContextStore::new(),
            })
        });

        let abort_signal = options.abort_signal.unwrap_or_default();
        let active_scc = cns.graph().map(|g| ActiveSccCounts::new(g.scc_count()));
        let (completion_tx, completion_rx) = watch::channel::<Option<Result<()>>>(None);
        let (extra_tx, extra_rx) = mpsc::unbounded_channel();

        let shared = Arc::new(Shared {
            cns,
            context,
            stimulation_id: Arc::clone(&stimulation_id),
            abort_signal,
            concurrency_limit: options.config.concurrency.unwrap_or(usize::MAX),
            max_neuron_hops: options.config.max_neuron_hops,
            on_response: options.on_response,
            active_scc,
            state: Mutex::new(DriverState::default()),
            completion_tx,
        });

        let span = info_span!("stimulation", id = %stimulation_id);
        tokio::spawn(run(Arc::clone(&shared), signals, extra_rx).instrument(span));

        StimulationHandle { shared, completion_rx, extra_tx }
    }
}

async fn run(shared: Arc<Shared>, root_signals: Vec<Signal>, mut extra_rx: mpsc::UnboundedReceiver<ActivationTask>) {
    let (outcome_tx, mut outcome_rx) = mpsc::unbounded_channel::<ActivationOutcome>();

    for signal in root_signals {
        mark_root_owner_transiently_active(&shared, &signal);
        seed_root_signal(&shared, &signal);
    }

    dispatch(&shared, &outcome_tx);
    if maybe_finalize(&shared) {
        return;
    }

    loop {
        tokio::select! {
            biased;
            Some(task) = extra_rx.recv() => {
                shared.state.lock().deque.push(task);
            }
            Some(outcome) = outcome_rx.recv() => {
                apply_outcome(&shared, outcome).await;
            }
            else => break,
        }
        dispatch(&shared, &outcome_tx);
        if maybe_finalize(&shared) {
            break;
        }
    }
}

/// The root signal's "owner" never actually ran a dendrite inside this
/// cascade — it was produced upstream, outside the driver's view. We still
/// bracket it active-then-inactive in the SCC counter so `processResponse`'s
/// context-cleanup check sees consistent accounting for a neuron whose only
/// activity in this stimulation is emitting the seed.
fn mark_root_owner_transiently_active(shared: &Shared, signal: &Signal) {
    let (Some(graph), Some(active)) = (shared.cns.graph(), &shared.active_scc) else { return };
    if let Some(owner) = shared.cns.topology().owner_neuron(signal.collateral_name()) {
        if let Some(scc) = graph.scc_of(owner) {
            active.increment(scc);
            active.decrement(scc);
        }
    }
}

/// A root signal is an output of an unknown upstream, not of a dendrite
/// invocation in this cascade (§3's "Produced once per dispatched output …
/// or once with undefined output when a handler … fails" — a root is
/// neither), so seeding must not itself fire a trace. It still runs the
/// owner's cleanup check and constructs/enqueues one child task per
/// subscriber, exactly as `process_response` would for a real output — it
/// just skips the `ResponseRecord`/`onResponse` step.
fn seed_root_signal(shared: &Arc<Shared>, signal: &Signal) {
    if let Some(owner) = shared.cns.topology().owner_neuron(signal.collateral_name()).map(str::to_string) {
        cleanup_context_if_safe(shared, &owner);
    }
    let children = build_children(shared, signal, 0);
    let mut state = shared.state.lock();
    for child in children {
        state.deque.push(child);
    }
}

fn dispatch(shared: &Arc<Shared>, outcome_tx: &mpsc::UnboundedSender<ActivationOutcome>) {
    loop {
        let task = {
            let mut state = shared.state.lock();
            if shared.abort_signal.is_aborted() {
                return;
            }
            if state.active_operations >= shared.concurrency_limit {
                return;
            }
            let Some(task) = state.deque.pop() else { return };
            state.active_operations += 1;
            task
        };

        let shared = Arc::clone(shared);
        let outcome_tx = outcome_tx.clone();
        tokio::spawn(async move {
            let outcome = run_one(&shared, task).await;
            let _ = outcome_tx.send(outcome);
        });
    }
}

async fn run_one(shared: &Arc<Shared>, task: ActivationTask) -> ActivationOutcome {
    let Some(neuron) = shared.cns.neuron_by_name(&task.neuron_name) else {
        return ActivationOutcome {
            aborted: shared.abort_signal.is_aborted(),
            result: Err(NeuronError::SubscriberMissing(task.neuron_name.clone())),
            task,
        };
    };

    let scc = shared.cns.graph().and_then(|g| g.scc_of(neuron.name()));
    if let (Some(scc), Some(active)) = (scc, &shared.active_scc) {
        active.increment(scc);
    }

    let ctx = LocalContext::new(
        Arc::from(neuron.name()),
        Arc::clone(&shared.context),
        shared.abort_signal.clone(),
        shared.cns.clone(),
        Arc::clone(&shared.stimulation_id),
    );
    debug!(neuron = neuron.name(), hop = task.hop, "activating");
    let outcome = run_activation(&neuron, shared.cns.gates(), task, ctx).await;

    if let (Some(scc), Some(active)) = (scc, &shared.active_scc) {
        active.decrement(scc);
    }
    outcome
}

async fn apply_outcome(shared: &Arc<Shared>, outcome: ActivationOutcome) {
    {
        let mut state = shared.state.lock();
        state.active_operations -= 1;
    }

    let ActivationOutcome { task, result, aborted } = outcome;
    match result {
        Ok(output) => {
            process_response_or_responses(shared, task, output).await;
        }
        Err(error) => {
            warn!(neuron = %task.neuron_name, error = %error, "activation failed");
            process_failed_response(shared, &task, &error).await;
            shared.state.lock().failed_tasks.push(FailedTask { task, error, aborted });
        }
    }
}

/// §3 ("once with undefined output when a handler … fails") / glossary
/// ("onResponse invoked once per dispatched handler outcome … and optional
/// error"): a sync throw, async rejection, timeout, or subscriber-missing
/// outcome still fires exactly one trace, with `output_signal = None` and
/// `error` populated. Per §7 no children are built and no context cleanup
/// runs for the failing branch — there is no output collateral to clean up
/// after.
async fn process_failed_response(shared: &Arc<Shared>, task: &ActivationTask, error: &NeuronError) {
    let record = ResponseRecord {
        input_signal: task.input_signal.clone(),
        output_signal: None,
        context_snapshot: shared.context.snapshot(),
        queue_length: shared.state.lock().outstanding(),
        stimulation_id: Arc::clone(&shared.stimulation_id),
        hops: Some(task.hop),
        error: Some(error.clone()),
    };

    if let Some(local_error) = fire_response(shared, record).await {
        let mut state = shared.state.lock();
        if state.onresponse_error.is_none() {
            state.onresponse_error = Some(local_error);
        }
    }
}

/// §4.6 step 6: normalize a handler's output into zero or more responses,
/// firing exactly one `processResponse` per element — an empty sequence
/// still produces one `processResponse(None)` so the trace fires once.
async fn process_response_or_responses(shared: &Arc<Shared>, task: ActivationTask, output: ReactionOutput) {
    let signals = output.into_signals();
    if signals.is_empty() {
        process_response(shared, task.input_signal.clone(), None, Some(task.hop)).await;
        return;
    }
    for signal in signals {
        process_response(shared, task.input_signal.clone(), Some(signal), Some(task.hop)).await;
    }
}

/// §4.6 step 7-8: look up the output's owner, clean up its context if safe,
/// construct child tasks for every subscriber, fire the trace/`onResponse`
/// callback, and enqueue the children (immediately for a synchronous
/// `onResponse`, after it settles for an asynchronous one).
async fn process_response(
    shared: &Arc<Shared>,
    input_signal: Option<Signal>,
    output_signal: Option<Signal>,
    hops: Option<u32>,
) {
    let mut children = Vec::new();

    if let Some(signal) = &output_signal {
        if let Some(owner) = shared.cns.topology().owner_neuron(signal.collateral_name()).map(str::to_string) {
            cleanup_context_if_safe(shared, &owner);
        }
        children = build_children(shared, signal, hops.unwrap_or(0));
    }

    let record = ResponseRecord {
        input_signal,
        output_signal,
        context_snapshot: shared.context.snapshot(),
        queue_length: shared.state.lock().outstanding() + children.len(),
        stimulation_id: Arc::clone(&shared.stimulation_id),
        hops,
        error: None,
    };

    {
        let mut state = shared.state.lock();
        state.scheduled_count += children.len();
    }

    let local_error = fire_response(shared, record).await;
    if let Some(error) = local_error {
        let mut state = shared.state.lock();
        if state.onresponse_error.is_none() {
            state.onresponse_error = Some(error);
        }
    }

    let mut state = shared.state.lock();
    state.scheduled_count -= children.len();
    for child in children {
        state.deque.push(child);
    }
    drop(state);
    // New work may have just become dispatchable; `run`'s main loop re-runs
    // `dispatch` right after this returns, so we don't need to trigger it
    // from here.
}

fn build_children(shared: &Shared, signal: &Signal, current_hop: u32) -> Vec<ActivationTask> {
    let mut children = Vec::new();
    for subscriber in shared.cns.topology().subscribers(signal.collateral_name()) {
        let hop = current_hop + 1;
        let identity = (subscriber.neuron_name.clone(), signal.collateral_name().to_string(), hop);

        let mut state = shared.state.lock();
        if !state.dispatched.insert(identity) {
            continue; // already processed this exact (neuron, collateral, hop) in this stimulation
        }

        if let Some(limit) = shared.max_neuron_hops {
            let visits = state.visits.entry(subscriber.neuron_name.clone()).or_insert(0);
            if *visits >= limit {
                let task = ActivationTask {
                    stimulation_id: Arc::clone(&shared.stimulation_id),
                    neuron_name: subscriber.neuron_name.clone(),
                    dendrite_collateral_name: signal.collateral_name().to_string(),
                    dendrite_index: subscriber.dendrite_index,
                    input_signal: Some(signal.clone()),
                    hop,
                };
                state.failed_tasks.push(FailedTask {
                    task,
                    error: NeuronError::HopLimitExceeded { neuron: subscriber.neuron_name.clone(), limit },
                    aborted: false,
                });
                continue;
            }
            *visits += 1;
        }
        drop(state);

        children.push(ActivationTask {
            stimulation_id: Arc::clone(&shared.stimulation_id),
            neuron_name: subscriber.neuron_name.clone(),
            dendrite_collateral_name: signal.collateral_name().to_string(),
            dendrite_index: subscriber.dendrite_index,
            input_signal: Some(signal.clone()),
            hop,
        });
    }
    children
}

fn cleanup_context_if_safe(shared: &Shared, owner: &str) {
    let Some(graph) = shared.cns.graph() else { return };
    let Some(active) = &shared.active_scc else { return };
    if graph.can_neuron_be_guaranteed_done(owner, active) {
        shared.context.delete(owner);
    }
}

async fn fire_response(shared: &Shared, record: ResponseRecord) -> Option<NeuronError> {
    let local_error = match &shared.on_response {
        Some(callback) => {
            let fut = callback(record.clone());
            match fut.await {
                Ok(()) => None,
                Err(err) => Some(NeuronError::listener(err)),
            }
        }
        None => None,
    };
    shared.cns.notify_listeners(&record);
    local_error
}

/// §4.6 step 11. `(queue.length + scheduledCount == 0) && activeOperations
/// == 0`, or the abort variant where leftover queued work is converted into
/// aborted failed tasks first.
fn maybe_finalize(shared: &Arc<Shared>) -> bool {
    let mut state = shared.state.lock();
    if state.completed {
        return true;
    }

    if shared.abort_signal.is_aborted() && state.active_operations == 0 && state.outstanding() > 0 {
        while let Some(task) = state.deque.pop() {
            state.failed_tasks.push(FailedTask { task, error: NeuronError::Aborted, aborted: true });
        }
    }

    let done = state.outstanding() == 0 && state.active_operations == 0;
    if !done {
        return false;
    }

    state.completed = true;
    let result = if let Some(error) = state.onresponse_error.take() {
        Err(error)
    } else if shared.abort_signal.is_aborted() && !state.failed_tasks.is_empty() {
        Err(NeuronError::Aborted)
    } else if !state.failed_tasks.is_empty() {
        error!(failed = state.failed_tasks.len(), "stimulation completed with failed tasks");
        Err(NeuronError::Aggregate(state.failed_tasks.len()))
    } else {
        Ok(())
    };
    drop(state);

    let _ = shared.completion_tx.send(Some(result));
    true
}

pub(crate) fn short_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..12].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collateral::Collateral;
    use crate::facade::FacadeOptions;
    use crate::neuron::{Axon, Dendrite, Neuron};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn linear_chain_completes_and_records_one_trace() {
        let x = Collateral::<u32>::new("x");
        let y = Collateral::<u32>::new("y");
        let a = Neuron::new("A", Axon::builder().with("x", &x).build()).build();
        let y2 = y.clone();
        let b = Neuron::new("B", Axon::builder().with("y", &y).build())
            .dendrite(Dendrite::sync(&x, move |p, _axon, _ctx| {
                Ok(ReactionOutput::One(y2.create_signal(*p + 1)))
            }))
            .build();
        let cns = Cns::new(vec![a, b], FacadeOptions::default()).unwrap();

        let traces = Arc::new(Mutex::new(Vec::new()));
        let traces_for_cb = Arc::clone(&traces);
        let handle = cns.stimulate(
            vec![x.create_signal(1)],
            StimulationOptions {
                on_response: Some(Arc::new(move |record| {
                    traces_for_cb.lock().push(record);
                    Box::pin(std::future::ready(Ok(())))
                })),
                ..Default::default()
            },
        );

        handle.wait_until_complete().await.unwrap();
        assert!(handle.get_failed_tasks().is_empty());
        let traces = traces.lock();
        assert_eq!(traces.len(), 1);
        assert_eq!(*traces[0].output_signal.as_ref().unwrap().payload::<u32>().unwrap(), 2);
    }

    #[tokio::test]
    async fn fan_out_dispatches_in_declaration_order_under_serial_concurrency() {
        let x = Collateral::<u32>::new("x");
        let order = Arc::new(Mutex::new(Vec::new()));

        let mut neurons = Vec::new();
        for name in ["B", "C", "D"] {
            let order = Arc::clone(&order);
            let name_owned = name.to_string();
            neurons.push(
                Neuron::new(name, Axon::default())
                    .dendrite(Dendrite::sync(&x, move |_p, _axon, _ctx| {
                        order.lock().push(name_owned.clone());
                        Ok(ReactionOutput::Empty)
                    }))
                    .build(),
            );
        }
        let cns = Cns::new(neurons, FacadeOptions::default()).unwrap();
        let handle = cns.stimulate(
            vec![x.create_signal(1)],
            StimulationOptions { config: StimulationConfig { concurrency: Some(1), ..Default::default() }, ..Default::default() },
        );
        handle.wait_until_complete().await.unwrap();
        assert_eq!(*order.lock(), vec!["B", "C", "D"]);
    }

    #[tokio::test]
    async fn hop_cap_fails_branches_past_the_limit_without_aborting_others() {
        let a_out = Collateral::<u32>::new("a");
        let b_out = Collateral::<u32>::new("b");
        let b_out2 = b_out.clone();
        let a = Neuron::new("A", Axon::builder().with("a", &a_out).build())
            .dendrite(Dendrite::sync(&b_out, move |p, _axon, _ctx| {
                Ok(ReactionOutput::One(b_out2.create_signal(*p)))
            }))
            .build();
        let a_out2 = a_out.clone();
        let b = Neuron::new("B", Axon::builder().with("b", &b_out).build())
            .dendrite(Dendrite::sync(&a_out, move |p, _axon, _ctx| {
                Ok(ReactionOutput::One(a_out2.create_signal(*p)))
            }))
            .build();
        let cns = Cns::new(vec![a, b], FacadeOptions { auto_cleanup_contexts: true }).unwrap();

        let handle = cns.stimulate(
            vec![a_out.create_signal(1)],
            StimulationOptions {
                config: StimulationConfig { max_neuron_hops: Some(3), ..Default::default() },
                ..Default::default()
            },
        );
        let result = handle.wait_until_complete().await;
        assert!(result.is_err());
        assert!(!handle.get_failed_tasks().is_empty());
        for failed in handle.get_failed_tasks() {
            assert!(matches!(failed.error, NeuronError::HopLimitExceeded { .. }));
        }
        assert!(handle.get_context().is_empty());
    }

    #[tokio::test]
    async fn per_neuron_concurrency_never_exceeds_its_limit() {
        let t = Collateral::<u32>::new("t");
        let peak = Arc::new(AtomicUsize::new(0));
        let current = Arc::new(AtomicUsize::new(0));
        let peak_cb = Arc::clone(&peak);
        let current_cb = Arc::clone(&current);
        let w = Neuron::new("W", Axon::default())
            .concurrency(2)
            .dendrite(Dendrite::new(&t, move |_p, _axon, _ctx| {
                let peak = Arc::clone(&peak_cb);
                let current = Arc::clone(&current_cb);
                async move {
                    let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    current.fetch_sub(1, Ordering::SeqCst);
                    Ok(ReactionOutput::Empty)
                }
            }))
            .build();
        let cns = Cns::new(vec![w], FacadeOptions::default()).unwrap();

        let signals: Vec<_> = (0..5).map(|i| t.create_signal(i)).collect();
        let handle = cns.stimulate(signals, StimulationOptions::default());
        handle.wait_until_complete().await.unwrap();
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn timeout_fails_just_that_task() {
        let s = Collateral::<u32>::new("s");
        let neuron = Neuron::new("S", Axon::default())
            .max_duration(50)
            .dendrite(Dendrite::new(&s, |_p, _axon, _ctx| async move {
                std::future::pending::<()>().await;
                unreachable!()
            }))
            .build();
        let cns = Cns::new(vec![neuron], FacadeOptions::default()).unwrap();

        let traces = Arc::new(Mutex::new(Vec::new()));
        let traces_for_cb = Arc::clone(&traces);
        let handle = cns.stimulate(
            vec![s.create_signal(1)],
            StimulationOptions {
                on_response: Some(Arc::new(move |record| {
                    traces_for_cb.lock().push(record);
                    Box::pin(std::future::ready(Ok(())))
                })),
                ..Default::default()
            },
        );
        let result = handle.wait_until_complete().await;
        assert!(result.is_err());
        let failed = handle.get_failed_tasks();
        assert_eq!(failed.len(), 1);
        match &failed[0].error {
            NeuronError::Timeout { neuron, max_duration_ms } => {
                assert_eq!(neuron, "S");
                assert_eq!(*max_duration_ms, 50);
            }
            other => panic!("unexpected error: {other:?}"),
        }

        // The failed handler invocation still produces exactly one trace,
        // with no output and the error attached.
        let traces = traces.lock();
        assert_eq!(traces.len(), 1);
        assert!(traces[0].output_signal.is_none());
        assert!(matches!(traces[0].error, Some(NeuronError::Timeout { .. })));
    }

    #[tokio::test]
    async fn abort_marks_queued_work_as_aborted_failures() {
        let x = Collateral::<u32>::new("x");
        let mut neurons = Vec::new();
        for i in 0..20 {
            neurons.push(
                Neuron::new(format!("n{i}"), Axon::default())
                    .dendrite(Dendrite::new(&x, |_p, _axon, _ctx| async move {
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        Ok(ReactionOutput::Empty)
                    }))
                    .build(),
            );
        }
        let cns = Cns::new(neurons, FacadeOptions::default()).unwrap();
        let abort = AbortHandle::new();
        let handle = cns.stimulate(
            vec![x.create_signal(1)],
            StimulationOptions {
                config: StimulationConfig { concurrency: Some(4), ..Default::default() },
                abort_signal: Some(abort.clone()),
                ..Default::default()
            },
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
        abort.abort();
        let result = handle.wait_until_complete().await;
        assert!(matches!(result, Err(NeuronError::Aborted)));
        assert!(handle.get_failed_tasks().iter().any(|f| f.aborted));
    }
}
