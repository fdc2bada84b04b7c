use std::sync::Arc;
use std::time::Instant;

use criterion::{criterion_group, criterion_main, Criterion, Throughput};
use crossbeam_channel::unbounded;
use serde_json::json;

use stardust::fragment::{diff, flatten};
use stardust::source::SelectorMatcherFactory;
use stardust::{
    activate, AppState, ChangeEvent, DataSource, Declaration, MemoryCollection, MemoryTransport, QueryDescriptor,
    Rule, RuleEngine, RuleOp,
};

const RULES: usize = 32;

fn counter_rule(i: usize) -> Rule {
    Rule::new()
        .named(format!("counter-{i}"))
        .param("bucket", Declaration::constant(json!(i % 4)))
        .query(
            "items",
            Declaration::computed(["bucket"], |s| {
                Ok(Some(QueryDescriptor::find("items", json!({"bucket": s.get("bucket")}))))
            }),
        )
        .mount(Declaration::constant(true))
        .fragment(Declaration::computed(["bucket", "items"], |s| {
            let count = s.get("items").as_array().map_or(0, Vec::len);
            let mut buckets = serde_json::Map::new();
            buckets.insert(s.get("bucket").to_string(), json!({"count": count}));
            Ok(json!({"buckets": buckets}))
        }))
}

/// Engine with `RULES` rules sharing four queries over one collection.
fn make_engine() -> (RuleEngine, Arc<MemoryCollection>) {
    let (ready_tx, _ready_rx) = unbounded();
    let mut engine = RuleEngine::new(
        Arc::new(MemoryTransport::immediate()),
        Arc::new(SelectorMatcherFactory),
        ready_tx,
    );
    let items = Arc::new(MemoryCollection::new("items"));
    engine
        .register_source(Arc::clone(&items) as Arc<dyn DataSource>, None)
        .unwrap();

    for i in 0..RULES {
        engine
            .process_rule(RuleOp::Add(activate(counter_rule(i)).unwrap()))
            .unwrap();
    }
    (engine, items)
}

fn bench_transaction_fan_out(c: &mut Criterion) {
    let mut group = c.benchmark_group("propagation");
    group.throughput(Throughput::Elements(1));

    group.bench_function("transaction_fan_out", |b| {
        b.iter_custom(|iters| {
            // Fresh engine per sample so query results do not grow across samples.
            let (mut engine, _items) = make_engine();
            let mut state = AppState::new();

            let start = Instant::now();
            for n in 0..iters {
                let doc = json!({"_id": n.to_string(), "bucket": n % 4});
                let outcome = engine.process_transactions(vec![ChangeEvent::added("items", doc)]);
                state = state.apply(&outcome.delta);
            }
            start.elapsed()
        });
    });

    group.finish();
}

fn bench_rule_activation(c: &mut Criterion) {
    c.bench_function("propagation/rule_add_remove", |b| {
        let (mut engine, _items) = make_engine();
        b.iter(|| {
            let rule = activate(counter_rule(RULES)).unwrap();
            engine.process_rule(RuleOp::Add(rule)).unwrap();
            engine
                .process_rule(RuleOp::Remove {
                    name: format!("counter-{RULES}"),
                })
                .unwrap();
        });
    });
}

fn bench_fragment_diff(c: &mut Criterion) {
    let old = json!({"a": {"b": 1, "c": [1, 2, 3]}, "d": "x", "e": {"f": {"g": true}}});
    let new = json!({"a": {"b": 2, "c": [1, 2, 3]}, "d": "y", "h": 7});
    let (old_flat, new_flat) = (flatten(&old), flatten(&new));
    let state = AppState::from_value(&old);

    c.bench_function("propagation/diff_apply", |b| {
        b.iter(|| {
            let delta = diff(&new_flat, &old_flat);
            state.apply(&delta)
        });
    });
}

criterion_group!(
    propagation,
    bench_transaction_fan_out,
    bench_rule_activation,
    bench_fragment_diff
);
criterion_main!(propagation);
