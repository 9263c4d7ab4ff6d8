//! Workflow definition and execution engine.
//!
//! A [`Workflow`] is an immutable routing table of steps plus run
//! options. Each call to [`Workflow::run`] starts an independent run on
//! its own task with a fresh state store, event queue, status stream and
//! fan-in buffers.
//!
//! The run is driven by a single control loop that owns the event queue.
//! Every ready event is dispatched to each subscribed step; invocations
//! run concurrently, bounded by each step's worker pool, and their
//! results are fed back into the queue. The run ends at the first
//! [`StopEvent`], at the first step error, on timeout, or when the queue
//! is empty with nothing left in flight.

use std::any::Any;
use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use serde_json::Value as JsonValue;
use tokio::sync::{broadcast, mpsc, watch, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::collector::EventCollector;
use crate::context::RunShared;
use crate::event::{AnyEvent, Event, StopEvent};
use crate::handler::{RunOutput, WorkflowHandler};
use crate::registry::{RegisteredStep, StepRegistry};
use crate::status::{RunPhase, RunSummary, StatusEvent, StepSummary, WorkflowEvent};
use crate::{Context, HeddleError, Result, RunState, StateStore, Step, StepOutcome};

/// Default capacity for the lifecycle broadcast channel.
const DEFAULT_EVENT_CHANNEL_CAPACITY: usize = 256;

/// An immutable, validated workflow.
///
/// # Example
///
/// ```
/// use heddle::{async_trait, AnyEvent, Context, EventKind, Result, StartEvent, Step, StepOutcome, Workflow};
///
/// #[derive(Debug)]
/// struct Hello;
///
/// #[async_trait]
/// impl Step<()> for Hello {
///     fn name(&self) -> &str { "hello" }
///     fn accepts(&self) -> Vec<EventKind> { vec![EventKind::of::<StartEvent>()] }
///     async fn execute(&self, _event: AnyEvent, _ctx: &Context<()>) -> Result<StepOutcome> {
///         Ok(StepOutcome::stop(serde_json::json!("hello")))
///     }
/// }
///
/// # async fn example() -> Result<()> {
/// let workflow = Workflow::<()>::builder("greeting").step(Hello).build()?;
/// let result = workflow.run(StartEvent).result().await?;
/// assert_eq!(result, serde_json::json!("hello"));
/// # Ok(())
/// # }
/// ```
///
/// # Thread Safety
///
/// `Workflow` is cheap to clone, `Send + Sync`, and may start any number
/// of concurrent runs.
pub struct Workflow<S> {
    inner: Arc<WorkflowInner<S>>,
}

struct WorkflowInner<S> {
    name: String,
    registry: StepRegistry<S>,
    timeout: Option<Duration>,
    event_tx: broadcast::Sender<WorkflowEvent>,
}

impl<S> WorkflowInner<S> {
    /// Ignores send errors (no subscribers or channel full).
    fn emit(&self, event: WorkflowEvent) {
        let _ = self.event_tx.send(event);
    }
}

impl<S> Clone for Workflow<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S: RunState> Workflow<S> {
    /// Creates a new workflow builder.
    pub fn builder(name: impl Into<String>) -> WorkflowBuilder<S> {
        WorkflowBuilder::new(name)
    }

    /// The workflow's name.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// The configured run deadline, if any.
    pub fn timeout(&self) -> Option<Duration> {
        self.inner.timeout
    }

    /// Names of the registered steps, in registration order.
    pub fn steps(&self) -> Vec<&str> {
        self.inner.registry.steps().map(|(_, r)| r.name()).collect()
    }

    /// Names of the steps fed by `step`'s declared outputs, or `None` if
    /// no such step exists.
    pub fn successors(&self, step: &str) -> Option<Vec<&str>> {
        self.inner.registry.successors(step)
    }

    /// Subscribes to lifecycle events of every run of this workflow.
    ///
    /// Events are not persisted; if the receiver is too slow, events may
    /// be dropped. Runs never wait for subscribers.
    pub fn subscribe(&self) -> broadcast::Receiver<WorkflowEvent> {
        self.inner.event_tx.subscribe()
    }

    /// Starts a run with default state.
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime.
    pub fn run<E: Event>(&self, start: E) -> WorkflowHandler<S> {
        self.run_with_state(start, S::default())
    }

    /// Starts a run with the given initial state.
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime.
    pub fn run_with_state<E: Event>(&self, start: E, state: S) -> WorkflowHandler<S> {
        self.run_any(AnyEvent::new(start), state)
    }

    /// Starts a run from an already-erased start event.
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime.
    pub fn run_any(&self, start: AnyEvent, state: S) -> WorkflowHandler<S> {
        let run_id = Uuid::new_v4().to_string();
        let (status_tx, status_rx) = mpsc::unbounded_channel();
        let (phase_tx, phase_rx) = watch::channel(RunPhase::Idle);

        let span = info_span!("run", workflow = %self.inner.name, run_id = %run_id);
        let join = tokio::spawn(
            drive(
                Arc::clone(&self.inner),
                run_id.clone(),
                start,
                StateStore::new(state),
                status_tx,
                phase_tx,
            )
            .instrument(span),
        );

        WorkflowHandler::new(run_id, status_rx, phase_rx, join)
    }
}

impl<S> std::fmt::Debug for Workflow<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Workflow")
            .field("name", &self.inner.name)
            .field("registry", &self.inner.registry)
            .field("timeout", &self.inner.timeout)
            .finish()
    }
}

/// Runs one workflow execution to completion.
async fn drive<S: RunState>(
    inner: Arc<WorkflowInner<S>>,
    run_id: String,
    start: AnyEvent,
    store: StateStore<S>,
    status_tx: mpsc::UnboundedSender<StatusEvent>,
    phase_tx: watch::Sender<RunPhase>,
) -> Result<RunOutput<S>> {
    let (queue_tx, mut queue_rx) = mpsc::unbounded_channel();
    let shared = Arc::new(RunShared {
        run_id: run_id.clone(),
        store,
        queue: queue_tx,
        status: status_tx,
        collector: EventCollector::new(),
    });

    let mut summaries: Vec<StepSummary> = inner
        .registry
        .steps()
        .map(|(_, r)| StepSummary::new(r.name(), r.workers))
        .collect();

    phase_tx.send_replace(RunPhase::Running);
    inner.emit(WorkflowEvent::RunStarted {
        run_id: run_id.clone(),
        workflow: inner.name.clone(),
    });
    info!(start = %start.kind(), "run started");

    let control = control_loop(&inner, &shared, start, &mut queue_rx, &mut summaries);
    let outcome: Result<(JsonValue, S)> = match inner.timeout {
        Some(limit) => match tokio::time::timeout(limit, control).await {
            Ok(outcome) => outcome,
            Err(_) => Err(HeddleError::Timeout(limit)),
        },
        None => control.await,
    };

    phase_tx.send_replace(if outcome.is_ok() {
        RunPhase::Completed
    } else {
        RunPhase::Failed
    });
    // Close the status stream once the last context is gone.
    drop(shared);

    match outcome {
        Ok((result, state)) => {
            info!("run completed");
            inner.emit(WorkflowEvent::RunCompleted {
                run_id: run_id.clone(),
            });
            Ok(RunOutput {
                result,
                state,
                steps: RunSummary {
                    run_id,
                    workflow: inner.name.clone(),
                    steps: summaries,
                },
            })
        }
        Err(e) => {
            error!(error = %e, "run failed");
            inner.emit(WorkflowEvent::RunFailed {
                run_id,
                error: e.to_string(),
            });
            Err(e)
        }
    }
}

type Invocation = (petgraph::graph::NodeIndex, Result<StepOutcome>);

/// Dispatches events until a stop event, a step error, or a stall.
///
/// On a stop event, returns its payload with the state as it was when
/// the stop event was taken off the queue.
///
/// Dropping this future (on timeout) drops the join set, which abandons
/// every in-flight invocation.
async fn control_loop<S: RunState>(
    inner: &WorkflowInner<S>,
    shared: &Arc<RunShared<S>>,
    start: AnyEvent,
    queue_rx: &mut mpsc::UnboundedReceiver<AnyEvent>,
    summaries: &mut [StepSummary],
) -> Result<(JsonValue, S)> {
    let pools: Vec<Arc<Semaphore>> = inner
        .registry
        .steps()
        .map(|(_, r)| Arc::new(Semaphore::new(r.workers)))
        .collect();
    let mut in_flight: JoinSet<Invocation> = JoinSet::new();
    let mut ready: VecDeque<AnyEvent> = VecDeque::from([start]);

    loop {
        while let Ok(event) = queue_rx.try_recv() {
            ready.push_back(event);
        }

        while let Some(event) = ready.pop_front() {
            let event = match event.downcast::<StopEvent>() {
                Ok(stop) => {
                    let state = shared.store.get_state().await;
                    let abandoned = in_flight.len();
                    in_flight.shutdown().await;
                    if abandoned > 0 {
                        debug!(abandoned, "stop event cancelled in-flight invocations");
                    }
                    return Ok((stop.result().clone(), state));
                }
                Err(event) => event,
            };

            let routes = inner.registry.routes(&event.kind());
            if routes.is_empty() {
                in_flight.shutdown().await;
                return Err(HeddleError::UnroutableEvent(event.kind().name().to_string()));
            }

            for &index in routes {
                let registered = inner.registry.get(index);
                summaries[index.index()].record_dispatch();
                spawn_invocation(
                    &mut in_flight,
                    inner,
                    shared,
                    index,
                    registered,
                    Arc::clone(&pools[index.index()]),
                    event.clone(),
                );
            }
        }

        if in_flight.is_empty() {
            let pending = shared.collector.pending().await;
            let detail = if pending.is_empty() {
                "no events left to dispatch".to_string()
            } else {
                pending.join("; ")
            };
            warn!(%detail, "run stalled");
            return Err(HeddleError::Stalled(detail));
        }

        tokio::select! {
            Some(joined) = in_flight.join_next() => {
                let (index, result) = match joined {
                    Ok(invocation) => invocation,
                    Err(e) => {
                        in_flight.shutdown().await;
                        return Err(HeddleError::StepPanicked(e.to_string()));
                    }
                };
                let name = inner.registry.get(index).name();

                match result {
                    Ok(StepOutcome::Emit(next)) => {
                        summaries[index.index()].record_completion(true);
                        debug!(step = name, emitted = %next.kind(), "step completed");
                        inner.emit(WorkflowEvent::StepCompleted {
                            run_id: shared.run_id.clone(),
                            step: name.to_string(),
                            emitted: Some(next.kind().name().to_string()),
                        });
                        ready.push_back(next);
                    }
                    Ok(StepOutcome::Continue) => {
                        summaries[index.index()].record_completion(false);
                        debug!(step = name, "step completed without event");
                        inner.emit(WorkflowEvent::StepCompleted {
                            run_id: shared.run_id.clone(),
                            step: name.to_string(),
                            emitted: None,
                        });
                    }
                    Err(e) => {
                        error!(step = name, error = %e, "step failed");
                        inner.emit(WorkflowEvent::StepFailed {
                            run_id: shared.run_id.clone(),
                            step: name.to_string(),
                            error: e.to_string(),
                        });
                        in_flight.shutdown().await;
                        return Err(e.in_step(name));
                    }
                }
            }
            Some(event) = queue_rx.recv() => {
                ready.push_back(event);
            }
        }
    }
}

/// Spawns one invocation of `registered` for `event`.
///
/// The invocation first waits for a worker permit, so an invocation
/// beyond the pool size is queued rather than rejected.
fn spawn_invocation<S: RunState>(
    in_flight: &mut JoinSet<Invocation>,
    inner: &WorkflowInner<S>,
    shared: &Arc<RunShared<S>>,
    index: petgraph::graph::NodeIndex,
    registered: &RegisteredStep<S>,
    pool: Arc<Semaphore>,
    event: AnyEvent,
) {
    let step: Arc<dyn Step<S>> = Arc::clone(&registered.step);
    let ctx = Context::new(Arc::clone(shared), step.name());
    let lifecycle = inner.event_tx.clone();
    let span = info_span!("step", step = %step.name(), event = %event.kind());

    in_flight.spawn(
        async move {
            let _permit = match pool.acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => {
                    return (
                        index,
                        Err(HeddleError::RunAborted("worker pool closed".into())),
                    )
                }
            };

            let _ = lifecycle.send(WorkflowEvent::StepStarted {
                run_id: ctx.run_id().to_string(),
                step: step.name().to_string(),
                event: event.kind().name().to_string(),
            });
            debug!("step started");

            let result = AssertUnwindSafe(step.execute(event, &ctx))
                .catch_unwind()
                .await
                .unwrap_or_else(|panic| Err(HeddleError::StepPanicked(panic_message(&*panic))));

            (index, result)
        }
        .instrument(span),
    );
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Builder for constructing [`Workflow`] instances.
///
/// Steps subscribe to events through [`Step::accepts`]; there are no
/// explicit edges. Validation happens in [`build`](Self::build).
pub struct WorkflowBuilder<S> {
    name: String,
    steps: Vec<RegisteredStep<S>>,
    timeout: Option<Duration>,
}

impl<S: RunState> WorkflowBuilder<S> {
    /// Creates a new, empty workflow builder.
    fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            steps: Vec::new(),
            timeout: None,
        }
    }

    /// Adds a step with a single worker (invocations are serialized).
    pub fn step(self, step: impl Step<S> + 'static) -> Self {
        self.step_with_workers(step, 1)
    }

    /// Adds a step that may run up to `workers` invocations at once.
    pub fn step_with_workers(mut self, step: impl Step<S> + 'static, workers: usize) -> Self {
        self.steps.push(RegisteredStep {
            step: Arc::new(step),
            workers,
        });
        self
    }

    /// Adds an already shared step.
    pub fn shared_step(mut self, step: Arc<dyn Step<S>>, workers: usize) -> Self {
        self.steps.push(RegisteredStep { step, workers });
        self
    }

    /// Sets an overall deadline for each run.
    pub fn timeout(mut self, limit: Duration) -> Self {
        self.timeout = Some(limit);
        self
    }

    /// Sets or clears the run deadline.
    pub fn maybe_timeout(mut self, limit: Option<Duration>) -> Self {
        self.timeout = limit;
        self
    }

    /// Builds the workflow, validating the step table.
    ///
    /// # Errors
    ///
    /// - [`HeddleError::DuplicateStep`] if two steps share a name
    /// - [`HeddleError::InvalidWorkflow`] if there are no steps, a step
    ///   has zero workers or accepts nothing, a step consumes
    ///   [`StopEvent`], a declared output has no consumer, or a step
    ///   with declared outputs cannot reach a stop-producing step
    pub fn build(self) -> Result<Workflow<S>> {
        let registry = StepRegistry::build(self.steps)?;
        let (event_tx, _) = broadcast::channel(DEFAULT_EVENT_CHANNEL_CAPACITY);

        Ok(Workflow {
            inner: Arc::new(WorkflowInner {
                name: self.name,
                registry,
                timeout: self.timeout,
                event_tx,
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{EventKind, StartEvent};
    use async_trait::async_trait;
    use serde::{Deserialize, Serialize};
    use serde_json::json;

    #[derive(Debug)]
    struct Numbered(u32);
    impl Event for Numbered {}

    #[derive(Debug, Clone, Default, Serialize, Deserialize)]
    struct Trail {
        visited: Vec<String>,
    }

    #[derive(Debug)]
    struct Begin;

    #[async_trait]
    impl Step<Trail> for Begin {
        fn name(&self) -> &str {
            "begin"
        }

        fn accepts(&self) -> Vec<EventKind> {
            vec![EventKind::of::<StartEvent>()]
        }

        async fn execute(&self, _event: AnyEvent, ctx: &Context<Trail>) -> Result<StepOutcome> {
            ctx.store()
                .edit_state(|s| {
                    s.visited.push("begin".into());
                    Ok::<_, HeddleError>(())
                })
                .await?;
            ctx.write_event_to_stream(StatusEvent::info("begun"));
            Ok(StepOutcome::emit(Numbered(41)))
        }
    }

    #[derive(Debug)]
    struct Finish;

    #[async_trait]
    impl Step<Trail> for Finish {
        fn name(&self) -> &str {
            "finish"
        }

        fn accepts(&self) -> Vec<EventKind> {
            vec![EventKind::of::<Numbered>()]
        }

        async fn execute(&self, event: AnyEvent, ctx: &Context<Trail>) -> Result<StepOutcome> {
            let n = event.expect::<Numbered>(self.name())?;
            ctx.store()
                .edit_state(|s| {
                    s.visited.push("finish".into());
                    Ok::<_, HeddleError>(())
                })
                .await?;
            Ok(StepOutcome::stop(json!({"answer": n.0 + 1})))
        }
    }

    fn two_step() -> Workflow<Trail> {
        Workflow::builder("two-step")
            .step(Begin)
            .step(Finish)
            .build()
            .unwrap()
    }

    #[test]
    fn test_builder_records_steps() {
        let workflow = two_step();
        assert_eq!(workflow.name(), "two-step");
        assert_eq!(workflow.steps(), vec!["begin", "finish"]);
        assert!(workflow.timeout().is_none());
        assert!(format!("{:?}", workflow).contains("two-step"));
    }

    #[tokio::test]
    async fn test_linear_run_returns_stop_payload_and_state() {
        let mut handler = two_step().run(StartEvent);
        let status = handler.next_status().await.unwrap();
        assert_eq!(status.message, "begun");

        let output = handler.finish().await.unwrap();
        assert_eq!(output.result, json!({"answer": 42}));
        assert_eq!(output.state.visited, vec!["begin", "finish"]);
        assert_eq!(output.steps.total_invocations(), 2);
    }

    #[tokio::test]
    async fn test_status_stream_closes_after_run() {
        let mut handler = two_step().run(StartEvent);
        assert_eq!(handler.wait_for_terminal().await, RunPhase::Completed);
        assert!(handler.next_status().await.is_some());
        assert!(handler.next_status().await.is_none());
    }

    #[tokio::test]
    async fn test_any_routable_event_can_start_a_run() {
        let result = two_step().run(Numbered(9)).result().await.unwrap();
        assert_eq!(result, json!({"answer": 10}));
    }

    #[tokio::test]
    async fn test_unroutable_start_fails() {
        #[derive(Debug)]
        struct Unknown;
        impl Event for Unknown {}

        let err = two_step().run(Unknown).result().await.unwrap_err();
        assert!(matches!(err, HeddleError::UnroutableEvent(kind) if kind == "Unknown"));
    }

    #[tokio::test]
    async fn test_lifecycle_events_broadcast() {
        let workflow = two_step();
        let mut events = workflow.subscribe();

        workflow.run(StartEvent).finish().await.unwrap();

        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            seen.push(event);
        }
        assert!(matches!(seen.first(), Some(WorkflowEvent::RunStarted { .. })));
        assert!(matches!(seen.last(), Some(WorkflowEvent::RunCompleted { .. })));
        assert!(seen.iter().any(|e| matches!(
            e,
            WorkflowEvent::StepCompleted { step, emitted: Some(kind), .. }
                if step == "begin" && kind == "Numbered"
        )));
    }

    #[tokio::test]
    async fn test_panicking_step_fails_run() {
        #[derive(Debug)]
        struct Explodes;

        #[async_trait]
        impl Step<()> for Explodes {
            fn name(&self) -> &str {
                "explodes"
            }
            fn accepts(&self) -> Vec<EventKind> {
                vec![EventKind::of::<StartEvent>()]
            }
            async fn execute(&self, _event: AnyEvent, _ctx: &Context<()>) -> Result<StepOutcome> {
                panic!("kaboom");
            }
        }

        let workflow = Workflow::<()>::builder("panics").step(Explodes).build().unwrap();
        let err = workflow.run(StartEvent).result().await.unwrap_err();
        match err {
            HeddleError::StepFailed { step, source } => {
                assert_eq!(step, "explodes");
                assert!(matches!(*source, HeddleError::StepPanicked(ref m) if m == "kaboom"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_abort_reports_failure() {
        #[derive(Debug)]
        struct Sleeps;

        #[async_trait]
        impl Step<()> for Sleeps {
            fn name(&self) -> &str {
                "sleeps"
            }
            fn accepts(&self) -> Vec<EventKind> {
                vec![EventKind::of::<StartEvent>()]
            }
            async fn execute(&self, _event: AnyEvent, _ctx: &Context<()>) -> Result<StepOutcome> {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(StepOutcome::Continue)
            }
        }

        let workflow = Workflow::<()>::builder("sleepy").step(Sleeps).build().unwrap();
        let handler = workflow.run(StartEvent);
        handler.abort();
        let err = handler.finish().await.unwrap_err();
        assert!(matches!(err, HeddleError::RunAborted(_)));

        let mut handler = workflow.run(StartEvent);
        tokio::task::yield_now().await;
        handler.abort();
        assert_eq!(handler.wait_for_terminal().await, RunPhase::Failed);
        assert_eq!(handler.phase(), RunPhase::Failed);
    }
}
