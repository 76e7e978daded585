// SPDX-License-Identifier: Apache-2.0
//! Discrete-event scheduler runtime (component F): a single-threaded,
//! cooperative priority queue of scheduled work items, dispatched through
//! registered driver/trigger pairs, with per-tick deterministic RNG and
//! cooperative cancellation.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

use rand_pcg::Pcg32;
use tracing::instrument;

use crate::event_store::{AppendError, AppendOptions, EventDraft, EventStore};
use crate::ident::seed_rng;
use crate::materializer::{MaterializeError, TopologyMaterializer, TopologyState};
use crate::stream::StreamIdentity;

/// A named sphere of activity a work item belongs to. Open `u32` newtype
/// with well-known constants, rather than a closed enum, so a host can
/// register additional spheres without a breaking change (`spec.md` §4.F).
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Sphere(pub u32);

impl Sphere {
    /// Tectonic and other solid-earth processes.
    pub const GEOSPHERE: Sphere = Sphere(100);
    /// Biological and ecological processes.
    pub const BIOSPHERE: Sphere = Sphere(200);
    /// Cognitive/civilizational processes.
    pub const NOOSPHERE: Sphere = Sphere(300);
    /// Fallback priority for any sphere without a fixed assignment.
    pub const DEFAULT: Sphere = Sphere(999);

    /// The sphere's priority for canonical ordering: its own value if it is
    /// one of the well-known constants or any other explicit value, so
    /// `Sphere` sorts purely by its raw `u32` (`spec.md` §4.F already pins
    /// `Geosphere=100 < Biosphere=200 < Noosphere=300 < default=999`, which
    /// falls out of sorting the raw value directly).
    #[must_use]
    pub fn priority(self) -> u32 {
        self.0
    }
}

/// The kind of work a scheduled item represents. Open `u32` newtype with a
/// registry of well-known constants used by the topology domain.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Kind(pub u32);

impl Kind {
    /// Invokes the plate-motion/boundary solver for a tick.
    pub const RUN_PLATE_SOLVER: Kind = Kind(1);
    /// Invokes junction-diagnostic reconciliation for a tick.
    pub const RUN_JUNCTION_DIAGNOSTICS: Kind = Kind(2);
}

/// A scheduled work item's canonical ordering key.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct OrderKey {
    when: i64,
    sphere: Sphere,
    kind: Kind,
    tie_break: u64,
}

impl OrderKey {
    fn cmp_ascending(&self, other: &Self) -> Ordering {
        self.when
            .cmp(&other.when)
            .then_with(|| self.sphere.cmp(&other.sphere))
            .then_with(|| self.kind.cmp(&other.kind))
            .then_with(|| self.tie_break.cmp(&other.tie_break))
    }
}

/// An opaque payload attached to a scheduled work item.
pub type WorkItemPayload = Vec<u8>;

/// A work item in the scheduler's queue.
#[derive(Clone, Debug)]
pub struct ScheduledWorkItem {
    order: OrderKey,
    /// Caller-supplied payload, opaque to the scheduler itself.
    pub payload: Option<WorkItemPayload>,
}

impl ScheduledWorkItem {
    /// The tick at which this item becomes eligible for dispatch.
    #[must_use]
    pub fn when(&self) -> i64 {
        self.order.when
    }

    /// The item's sphere.
    #[must_use]
    pub fn sphere(&self) -> Sphere {
        self.order.sphere
    }

    /// The item's kind.
    #[must_use]
    pub fn kind(&self) -> Kind {
        self.order.kind
    }

    /// The monotonic tie-break assigned by the scheduler at enqueue time.
    #[must_use]
    pub fn tie_break(&self) -> u64 {
        self.order.tie_break
    }
}

impl PartialEq for ScheduledWorkItem {
    fn eq(&self, other: &Self) -> bool {
        self.order == other.order
    }
}
impl Eq for ScheduledWorkItem {}

impl PartialOrd for ScheduledWorkItem {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ScheduledWorkItem {
    // `BinaryHeap` is a max-heap; the canonical order is ascending, so this
    // reverses the comparison to make the *lowest* `(When, Sphere, Kind,
    // TieBreak)` item the one `BinaryHeap::pop` returns.
    fn cmp(&self, other: &Self) -> Ordering {
        other.order.cmp_ascending(&self.order)
    }
}

/// A token a caller can flip to cooperatively cancel an in-progress run.
/// Every suspension point in the tick-step state machine observes it.
#[derive(Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    /// Creates a fresh, not-yet-cancelled token.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation. Idempotent.
    pub fn cancel(&self) {
        self.0.store(true, AtomicOrdering::SeqCst);
    }

    /// Returns `true` if cancellation has been requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(AtomicOrdering::SeqCst)
    }
}

/// The scheduler's enqueue surface, handed to drivers so they can schedule
/// future work while running.
pub struct Scheduler {
    queue: BinaryHeap<ScheduledWorkItem>,
    next_tie_break: AtomicU64,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler {
    /// Creates an empty scheduler.
    #[must_use]
    pub fn new() -> Self {
        Self {
            queue: BinaryHeap::new(),
            next_tie_break: AtomicU64::new(0),
        }
    }

    /// Schedules a work item. `TieBreak` is assigned by the scheduler,
    /// monotonically increasing; callers never supply it. This is what
    /// makes scheduling insertion-ordered among items sharing
    /// `(When, Sphere, Kind)` (`spec.md` §8 invariant 6).
    pub fn schedule(
        &mut self,
        when: i64,
        sphere: Sphere,
        kind: Kind,
        payload: Option<WorkItemPayload>,
    ) {
        let tie_break = self.next_tie_break.fetch_add(1, AtomicOrdering::SeqCst);
        self.queue.push(ScheduledWorkItem {
            order: OrderKey {
                when,
                sphere,
                kind,
                tie_break,
            },
            payload,
        });
    }

    /// Borrows the head of the queue without removing it.
    #[must_use]
    pub fn peek(&self) -> Option<&ScheduledWorkItem> {
        self.queue.peek()
    }

    fn dequeue(&mut self) -> Option<ScheduledWorkItem> {
        self.queue.pop()
    }

    /// Returns `true` if no work remains.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

/// Context handed to a registered driver for one dispatch.
pub struct DesContext<'a> {
    /// The stream this tick step is operating on.
    pub stream: &'a StreamIdentity,
    /// The current tick.
    pub current_tick: i64,
    /// Read-only materialized state for `stream` at `current_tick`.
    pub state: &'a TopologyState,
    /// The scheduler, for enqueueing future work.
    pub scheduler: &'a mut Scheduler,
    /// The per-tick deterministic RNG.
    pub rng: &'a mut Pcg32,
}

/// The output of a driver invocation, consumed by its paired trigger.
#[derive(Clone, Debug, Default)]
pub struct DriverOutput {
    /// An opaque signal the driver hands its trigger.
    pub signal: Vec<u8>,
}

/// Implemented by a domain-specific driver: reads state, may schedule
/// future work, and returns a signal for its trigger.
pub trait Driver: Send + Sync {
    /// Runs the driver for one dispatch.
    fn run(&self, ctx: &mut DesContext<'_>) -> DriverOutput;
}

/// Implemented by a domain-specific trigger: turns a driver's output into
/// zero or more event drafts, appended within the same tick step.
pub trait Trigger: Send + Sync {
    /// Runs the trigger for one dispatch.
    fn run(&self, output: &DriverOutput, current_tick: i64, rng: &mut Pcg32) -> Vec<EventDraft>;
}

/// Errors raised while dispatching a dequeued work item.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// No `(Driver, Trigger)` pair is registered for the item's `Kind`.
    #[error("no handler registered for kind {0:?}")]
    NoHandler(Kind),
    /// Materializing state for the dispatch failed.
    #[error(transparent)]
    Materialize(#[from] MaterializeError),
    /// Appending the trigger's event drafts failed.
    #[error(transparent)]
    Append(#[from] AppendError),
    /// The run observed a cancellation request at a suspension point.
    #[error("run cancelled")]
    Cancelled,
}

/// Counts accumulated over a [`DesRuntime::run`] call.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RunCounts {
    /// Work items successfully dispatched.
    pub items_processed: u64,
    /// Events appended across all dispatched items.
    pub events_appended: u64,
}

/// Bounds and identity inputs for a single [`DesRuntime::run`] call
/// (`spec.md` §9: explicit config struct, no ambient context).
#[derive(Clone, Debug)]
pub struct DesRunOptions {
    /// The scenario seed mixed into every per-tick RNG derivation.
    pub scenario_seed: u64,
    /// Ticks `> EndTick` are never dispatched; the run stops when the head
    /// of the queue exceeds this bound.
    pub end_tick: i64,
    /// Stop after this many items have been dispatched, if `Some`.
    pub max_items_processed: Option<u64>,
    /// Stop after this many events have been appended, if `Some`.
    pub max_events_appended: Option<u64>,
    /// Tick policy applied to every append performed by dispatched triggers.
    pub append_options: AppendOptions,
}

/// The single-threaded, cooperative DES runtime (component F).
///
/// Owns the scheduler, the registered driver/trigger pairs, and the
/// materializer + event store it dispatches against. One tick step runs to
/// completion before the next begins; there is no preemption.
pub struct DesRuntime {
    materializer: TopologyMaterializer,
    events: EventStore,
    handlers: HashMap<Kind, (Arc<dyn Driver>, Arc<dyn Trigger>)>,
    scheduler: Scheduler,
}

impl DesRuntime {
    /// Builds a runtime over the given materializer and event store.
    #[must_use]
    pub fn new(materializer: TopologyMaterializer, events: EventStore) -> Self {
        Self {
            materializer,
            events,
            handlers: HashMap::new(),
            scheduler: Scheduler::new(),
        }
    }

    /// Registers the `(driver, trigger)` pair that handles `kind`.
    pub fn register(&mut self, kind: Kind, driver: Arc<dyn Driver>, trigger: Arc<dyn Trigger>) {
        self.handlers.insert(kind, (driver, trigger));
    }

    /// Exposes the scheduler for pre-seeding work before a run.
    pub fn scheduler_mut(&mut self) -> &mut Scheduler {
        &mut self.scheduler
    }

    /// Runs the tick-step state machine until the queue empties, the head
    /// exceeds `options.end_tick`, or either bound in `options` is reached.
    ///
    /// State machine per item: `Peek -> bound checks -> Dequeue ->
    /// Materialize -> Derive RNG -> Dispatch -> Append Drafts -> Increment
    /// counters`. Any fault aborts the step; the dequeued item is *not*
    /// re-enqueued. Cancellation is checked at every suspension point.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError`] if a step faults: an unregistered kind, a
    /// materialization or append failure, or observed cancellation.
    #[instrument(skip(self, stream, options, cancellation))]
    #[allow(clippy::expect_used)] // the preceding peek() confirms an item is present
    pub fn run(
        &mut self,
        stream: &StreamIdentity,
        options: &DesRunOptions,
        cancellation: &CancellationToken,
    ) -> Result<RunCounts, DispatchError> {
        let mut counts = RunCounts::default();
        loop {
            if cancellation.is_cancelled() {
                return Err(DispatchError::Cancelled);
            }
            let Some(head) = self.scheduler.peek() else {
                break;
            };
            if head.when() > options.end_tick {
                break;
            }
            if let Some(max) = options.max_items_processed {
                if counts.items_processed >= max {
                    break;
                }
            }
            if let Some(max) = options.max_events_appended {
                if counts.events_appended >= max {
                    break;
                }
            }

            let item = self
                .scheduler
                .dequeue()
                .expect("peek just confirmed an item exists");

            if cancellation.is_cancelled() {
                return Err(DispatchError::Cancelled);
            }
            let state = self
                .materializer
                .materialize_at_tick(stream, item.when(), crate::materializer::TickMaterializationMode::Auto)?;

            if cancellation.is_cancelled() {
                return Err(DispatchError::Cancelled);
            }
            let mut rng = seed_rng(&[
                options.scenario_seed.to_le_bytes().as_slice(),
                stream.stream_key().as_bytes(),
                item.when().to_le_bytes().as_slice(),
            ]);

            let Some((driver, trigger)) = self.handlers.get(&item.kind()).cloned() else {
                return Err(DispatchError::NoHandler(item.kind()));
            };

            if cancellation.is_cancelled() {
                return Err(DispatchError::Cancelled);
            }
            let mut ctx = DesContext {
                stream,
                current_tick: item.when(),
                state: &state,
                scheduler: &mut self.scheduler,
                rng: &mut rng,
            };
            let output = driver.run(&mut ctx);
            let drafts = trigger.run(&output, item.when(), &mut rng);

            if cancellation.is_cancelled() {
                return Err(DispatchError::Cancelled);
            }
            if !drafts.is_empty() {
                let appended = u64::try_from(drafts.len()).unwrap_or(u64::MAX);
                self.events.append(stream, drafts, &options.append_options)?;
                counts.events_appended += appended;
            }

            counts.items_processed += 1;
        }
        Ok(counts)
    }
}
