// SPDX-License-Identifier: Apache-2.0
//! End-to-end coverage of the six scenarios a conforming implementation must
//! satisfy: genesis+replay, tamper detection, scheduler tie-break ordering,
//! deterministic ids from a scenario seed, cache miss→hit, and cache
//! invalidation on topology change. Each module's own unit tests already
//! cover these properties in isolation; this suite drives them through the
//! crate's public surface the way an external caller would.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;

use fantasim_core::{
    seed_rng, AppendOptions, ArtifactGenerationContext, ArtifactGenerator, CacheKey, EventDraft,
    EventId, EventStore, GenerationFailure, Kind, KvStore, MemoryKv, PlateId, ReadError,
    Sphere, StreamIdentity, TickMaterializationMode, TopologyEventKind, TopologyMaterializer,
};

fn test_stream() -> StreamIdentity {
    StreamIdentity::new("V1", "main", 0, "geo.plates", "0").unwrap()
}

// ── E1: genesis + replay ─────────────────────────────────────────────────

#[test]
fn e1_genesis_and_replay() {
    let kv: Arc<dyn KvStore> = Arc::new(MemoryKv::new());
    let events = EventStore::new(kv.clone());
    let materializer = TopologyMaterializer::new(kv);
    let stream = test_stream();

    let mut rng = seed_rng(&[b"e1"]);
    let plate = PlateId::from_rng(&mut rng);
    events
        .append(
            &stream,
            vec![EventDraft {
                event_id: EventId::from_rng(&mut rng),
                tick: 0,
                kind: TopologyEventKind::PlateCreated { plate },
            }],
            &AppendOptions::default(),
        )
        .unwrap();

    assert_eq!(events.last_sequence(&stream).unwrap(), Some(0));

    let at_tick_one = materializer
        .materialize_at_tick(&stream, 1, TickMaterializationMode::Auto)
        .unwrap();
    assert_eq!(at_tick_one.plates.len(), 1);
    assert!(at_tick_one.plates.contains_key(&plate));

    let before_genesis = materializer
        .materialize_at_tick(&stream, -1, TickMaterializationMode::Auto)
        .unwrap();
    assert!(before_genesis.plates.is_empty());
    assert_eq!(before_genesis.last_event_sequence, -1);
}

// ── E2: tamper detection ─────────────────────────────────────────────────

#[test]
fn e2_tampering_breaks_the_hash_chain_on_read() {
    let kv: Arc<dyn KvStore> = Arc::new(MemoryKv::new());
    let events = EventStore::new(kv.clone());
    let stream = test_stream();
    let mut rng = seed_rng(&[b"e2"]);
    events
        .append(
            &stream,
            vec![EventDraft {
                event_id: EventId::from_rng(&mut rng),
                tick: 0,
                kind: TopologyEventKind::PlateCreated {
                    plate: PlateId::from_rng(&mut rng),
                },
            }],
            &AppendOptions::default(),
        )
        .unwrap();

    let key = stream.event_key(0);
    let mut raw = kv.get(&key).unwrap().unwrap();
    let last = raw.len() - 1;
    raw[last] ^= 0xFF;
    kv.put(&key, &raw).unwrap();

    let err = events.read(&stream, 0).unwrap_err();
    assert!(matches!(err, ReadError::HashChainBroken { .. }));
}

// ── E3: scheduler tie-break preserves insertion order ───────────────────

#[test]
fn e3_tied_keys_dispatch_in_schedule_order() {
    use fantasim_core::{CancellationToken, DesContext, DesRunOptions, DesRuntime, Driver, DriverOutput, Trigger};
    use rand_pcg::Pcg32;
    use std::sync::Mutex;

    struct NoopDriver;
    impl Driver for NoopDriver {
        fn run(&self, _ctx: &mut DesContext<'_>) -> DriverOutput {
            DriverOutput::default()
        }
    }

    struct RecordingTrigger(Arc<Mutex<Vec<u8>>>, u8);
    impl Trigger for RecordingTrigger {
        fn run(&self, _output: &DriverOutput, _tick: i64, _rng: &mut Pcg32) -> Vec<EventDraft> {
            self.0.lock().unwrap().push(self.1);
            Vec::new()
        }
    }

    let kv: Arc<dyn KvStore> = Arc::new(MemoryKv::new());
    let materializer = TopologyMaterializer::new(kv.clone());
    let events = EventStore::new(kv);
    let mut runtime = DesRuntime::new(materializer, events);
    let order = Arc::new(Mutex::new(Vec::new()));
    runtime.register(
        Kind::RUN_PLATE_SOLVER,
        Arc::new(NoopDriver),
        Arc::new(RecordingTrigger(order.clone(), 7)),
    );
    let stream = test_stream();
    for _ in 0..3 {
        runtime
            .scheduler_mut()
            .schedule(10, Sphere::GEOSPHERE, Kind::RUN_PLATE_SOLVER, None);
    }
    let counts = runtime
        .run(
            &stream,
            &DesRunOptions {
                scenario_seed: 42,
                end_tick: 100,
                max_items_processed: None,
                max_events_appended: None,
                append_options: AppendOptions::default(),
            },
            &CancellationToken::new(),
        )
        .unwrap();
    assert_eq!(counts.items_processed, 3);
    assert_eq!(*order.lock().unwrap(), vec![7, 7, 7]);
}

// ── E4: deterministic ids from a scenario seed ──────────────────────────

#[test]
fn e4_same_scenario_seed_reproduces_the_same_event_stream_hash() {
    fn run_scenario(seed: u64) -> Vec<fantasim_core::Sha256Hash> {
        let kv: Arc<dyn KvStore> = Arc::new(MemoryKv::new());
        let events = EventStore::new(kv);
        let stream = test_stream();
        let mut rng = seed_rng(&[&seed.to_le_bytes()]);
        let drafts: Vec<EventDraft> = (0..100)
            .map(|tick| EventDraft {
                event_id: EventId::from_rng(&mut rng),
                tick,
                kind: TopologyEventKind::PlateCreated {
                    plate: PlateId::from_rng(&mut rng),
                },
            })
            .collect();
        events
            .append(&stream, drafts, &AppendOptions::default())
            .unwrap();
        events
            .read(&stream, 0)
            .unwrap()
            .iter()
            .map(|envelope| envelope.hash)
            .collect()
    }

    let first_run = run_scenario(42);
    let second_run = run_scenario(42);
    assert_eq!(first_run, second_run);
    assert_eq!(first_run.len(), 100);

    let different_seed = run_scenario(43);
    assert_ne!(first_run, different_seed);
}

// ── E5 / E6: cache miss→hit, then invalidation on topology change ───────

struct FixedPayloadGenerator(Vec<u8>, std::sync::atomic::AtomicU64);

impl ArtifactGenerator for FixedPayloadGenerator {
    type Output = Vec<u8>;

    fn generate(
        &self,
        _ctx: &ArtifactGenerationContext<'_>,
    ) -> Result<Self::Output, GenerationFailure> {
        self.1.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        Ok(self.0.clone())
    }

    fn serialize(&self, output: &Self::Output) -> Vec<u8> {
        output.clone()
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<Self::Output, GenerationFailure> {
        Ok(bytes.to_vec())
    }
}

#[test]
fn e5_e6_cache_miss_then_hit_then_invalidation_forces_a_fresh_miss() {
    use fantasim_core::{CanonicalMap, CanonicalValue, DerivedArtifactCache};

    let kv: Arc<dyn KvStore> = Arc::new(MemoryKv::new());
    let cache = DerivedArtifactCache::new(kv);
    let stream = test_stream();
    let generator = FixedPayloadGenerator(vec![1, 2, 3], std::sync::atomic::AtomicU64::new(0));

    let key = |topology_stream_hash: &'static str| CacheKey {
        stream: &stream,
        product_type: "TopologySnapshot",
        last_sequence: 5,
        generator_id: "snapshot-gen",
        generator_version: "1",
        params: CanonicalValue::Map(CanonicalMap::new()),
        topology_stream_hash,
    };

    // E5: first call is a miss and invokes the generator.
    let (output_a, provenance_a) = cache.get_or_compute(key("hash-v1"), &generator).unwrap();
    assert_eq!(output_a, vec![1, 2, 3]);
    assert_eq!(
        generator.1.load(std::sync::atomic::Ordering::SeqCst),
        1,
        "first request must invoke the generator"
    );

    // E5: second call with identical inputs is a hit; the generator is not
    // invoked again and the same product instance id comes back.
    let (output_b, provenance_b) = cache.get_or_compute(key("hash-v1"), &generator).unwrap();
    assert_eq!(output_b, vec![1, 2, 3]);
    assert_eq!(
        generator.1.load(std::sync::atomic::Ordering::SeqCst),
        1,
        "second request must reuse the cached payload"
    );
    assert_eq!(
        provenance_a.product_instance_id,
        provenance_b.product_instance_id
    );

    // E6: invalidate on topology change, then the same logical request
    // (new topology_stream_hash) is a miss again.
    cache
        .invalidate_on_topology_change(&stream, "hash-v2")
        .unwrap();
    let (_output_c, _provenance_c) = cache.get_or_compute(key("hash-v2"), &generator).unwrap();
    assert_eq!(
        generator.1.load(std::sync::atomic::Ordering::SeqCst),
        2,
        "post-invalidation request under the new topology hash must miss"
    );
}
