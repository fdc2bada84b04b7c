//! Query sharing and incremental maintenance.

use std::sync::Arc;

use crossbeam_channel::unbounded;
use serde_json::json;

use stardust::registry::{QueryData, QueryRegistry};
use stardust::source::SelectorMatcherFactory;
use stardust::{
    activate, ChangeEvent, ChangeSink, DataSource, Declaration, MemoryCollection, MemoryTransport, Projection,
    QueryDescriptor, Rule, RuleEngine, RuleOp, Value, VarRef,
};

fn registry_with(collection: &Arc<MemoryCollection>) -> QueryRegistry {
    let mut registry = QueryRegistry::new(Arc::new(SelectorMatcherFactory));
    registry
        .add_source(Arc::clone(collection) as Arc<dyn DataSource>, None)
        .unwrap();
    registry
}

fn engine_with(collection: &Arc<MemoryCollection>) -> RuleEngine {
    let (ready_tx, _ready_rx) = unbounded();
    let mut engine = RuleEngine::new(
        Arc::new(MemoryTransport::immediate()),
        Arc::new(SelectorMatcherFactory),
        ready_tx,
    );
    engine
        .register_source(Arc::clone(collection) as Arc<dyn DataSource>, None)
        .unwrap();
    engine
}

fn first_user_rule(name: &str) -> Rule {
    Rule::new()
        .named(name)
        .mount(Declaration::constant(true))
        .query(
            "user",
            Declaration::constant(Some(QueryDescriptor::find_one("users", json!({"role": "admin"})))),
        )
        .fragment(Declaration::computed(["user"], |s| {
            Ok(json!({"admin": s.get("user").get("_id").cloned().unwrap_or_default()}))
        }))
}

#[test]
fn structurally_equal_queries_share_one_execution() {
    let users = Arc::new(MemoryCollection::new("users"));
    users.insert(json!({"_id": "a", "role": "admin"})).unwrap();
    let mut engine = engine_with(&users);

    engine
        .process_rule(RuleOp::Add(activate(first_user_rule("one")).unwrap()))
        .unwrap();
    engine
        .process_rule(RuleOp::Add(activate(first_user_rule("two")).unwrap()))
        .unwrap();

    assert_eq!(users.executions(), 1);
    assert_eq!(engine.queries().len(), 1);

    let descriptor = QueryDescriptor::find_one("users", json!({"role": "admin"}));
    assert_eq!(engine.queries().get(&descriptor).unwrap().clients().len(), 2);

    engine
        .process_rule(RuleOp::Remove { name: "one".to_string() })
        .unwrap();
    let entry = engine.queries().get(&descriptor).unwrap();
    assert_eq!(entry.clients(), &[VarRef::new("two", "user")]);
    assert_eq!(users.executions(), 1);

    engine
        .process_rule(RuleOp::Remove { name: "two".to_string() })
        .unwrap();
    assert!(engine.queries().is_empty());
}

#[test]
fn selector_key_order_does_not_matter() {
    let a = QueryDescriptor::find("c", json!({"x": 1, "y": {"z": 2}}));
    let b = QueryDescriptor::find("c", json!({"y": {"z": 2}, "x": 1}));
    assert_eq!(a.key(), b.key());
    assert_ne!(a.key(), QueryDescriptor::find_one("c", json!({"x": 1, "y": {"z": 2}})).key());
}

#[test]
fn nested_and_dotted_selectors_keep_separate_entries() {
    let docs = Arc::new(MemoryCollection::new("c"));
    docs.insert(json!({"_id": 1, "a": {"b": 1, "c": 2}})).unwrap();
    docs.insert(json!({"_id": 2, "a": 5, "b": 1})).unwrap();
    let mut registry = registry_with(&docs);

    let dotted = QueryDescriptor::find("c", json!({"a.b": 1}));
    let nested = QueryDescriptor::find("c", json!({"a": {"b": 1}}));
    assert_ne!(dotted.key(), nested.key());
    assert_eq!(registry.register(&dotted, &VarRef::new("r", "dotted")).unwrap().len(), 1);
    assert!(registry.register(&nested, &VarRef::new("r", "nested")).unwrap().is_empty());

    let plain = QueryDescriptor::find("c", json!({"b": 1}));
    let with_empty = QueryDescriptor::find("c", json!({"a": {}, "b": 1}));
    assert_ne!(plain.key(), with_empty.key());
    assert_eq!(registry.register(&plain, &VarRef::new("r", "plain")).unwrap().len(), 1);
    assert!(registry.register(&with_empty, &VarRef::new("r", "empty")).unwrap().is_empty());

    assert_eq!(registry.len(), 4);
    assert_eq!(docs.executions(), 4);
}

#[test]
fn find_results_track_added_changed_and_removed_documents() {
    let todos = Arc::new(MemoryCollection::new("todos"));
    let (tx, rx) = unbounded();
    todos.observe(ChangeSink::new("todos", tx)).unwrap();

    let mut registry = registry_with(&todos);
    let open = QueryDescriptor::find("todos", json!({"done": false}));
    let client = VarRef::new("r", "open");
    let initial = registry.register(&open, &client).unwrap();
    assert!(initial.is_empty());

    let mut errors = Vec::new();
    let mut apply = |registry: &mut QueryRegistry| {
        let events: Vec<ChangeEvent> = rx.try_iter().collect();
        let mut touched = Vec::new();
        for event in &events {
            touched.extend(registry.apply_change(event, &mut errors));
        }
        touched
    };

    todos.insert(json!({"_id": "x", "done": false})).unwrap();
    assert_eq!(apply(&mut registry), vec![client.clone()]);
    assert_eq!(registry.get(&open).unwrap().data().len(), 1);

    todos.insert(json!({"_id": "y", "done": true})).unwrap();
    assert!(apply(&mut registry).is_empty());

    todos.update(json!({"_id": "y", "done": false})).unwrap();
    todos.update(json!({"_id": "x", "done": true})).unwrap();
    apply(&mut registry);
    let data = registry.get(&open).unwrap().data();
    assert!(matches!(data.as_ref(), QueryData::Many(docs) if docs.len() == 1));
    assert_eq!(data.to_value(), json!([{"_id": "y", "done": false}]));

    todos.remove(&json!("y")).unwrap();
    apply(&mut registry);
    assert!(registry.get(&open).unwrap().data().is_empty());

    // The first snapshot handed out is never mutated by later patches.
    assert!(initial.is_empty());
    assert!(errors.is_empty());
}

#[test]
fn find_one_keeps_its_winner_until_it_leaves() {
    let users = Arc::new(MemoryCollection::new("users"));
    let (tx, rx) = unbounded();
    users.observe(ChangeSink::new("users", tx)).unwrap();
    users.insert(json!({"_id": "a", "role": "admin"})).unwrap();
    rx.try_iter().for_each(drop);

    let mut registry = registry_with(&users);
    let admin = QueryDescriptor::find_one("users", json!({"role": "admin"}));
    let client = VarRef::new("r", "admin");
    registry.register(&admin, &client).unwrap();
    assert_eq!(users.executions(), 1);

    let mut errors = Vec::new();
    let mut drain = |registry: &mut QueryRegistry| {
        for event in rx.try_iter() {
            registry.apply_change(&event, &mut errors);
        }
    };

    users.insert(json!({"_id": "b", "role": "admin"})).unwrap();
    drain(&mut registry);
    let winner = registry.get(&admin).unwrap().data().to_value();
    assert_eq!(winner["_id"], json!("a"));
    assert_eq!(users.executions(), 1);

    users.remove(&json!("a")).unwrap();
    drain(&mut registry);
    let winner = registry.get(&admin).unwrap().data().to_value();
    assert_eq!(winner["_id"], json!("b"));
    assert_eq!(users.executions(), 2);

    users.update(json!({"_id": "b", "role": "guest"})).unwrap();
    drain(&mut registry);
    assert!(registry.get(&admin).unwrap().data().to_value().is_null());
    assert_eq!(users.executions(), 3);
}

#[test]
fn projections_apply_to_initial_and_incremental_results() {
    let items = Arc::new(MemoryCollection::new("items"));
    let (tx, rx) = unbounded();
    items.observe(ChangeSink::new("items", tx)).unwrap();
    items
        .insert(json!({"_id": "1", "name": "pen", "secret": "s1"}))
        .unwrap();
    rx.try_iter().for_each(drop);

    let mut registry = registry_with(&items);
    let descriptor = QueryDescriptor::find("items", json!({})).with_projection(Projection::exclude(["secret"]));
    let data = registry.register(&descriptor, &VarRef::new("r", "items")).unwrap();
    assert_eq!(data.to_value(), json!([{"_id": "1", "name": "pen"}]));

    items
        .insert(json!({"_id": "2", "name": "ink", "secret": "s2"}))
        .unwrap();
    let mut errors = Vec::new();
    for event in rx.try_iter() {
        registry.apply_change(&event, &mut errors);
    }
    assert_eq!(
        registry.get(&descriptor).unwrap().data().to_value(),
        json!([{"_id": "1", "name": "pen"}, {"_id": "2", "name": "ink"}])
    );
}

#[test]
fn mixed_projection_is_rejected() {
    let err = QueryDescriptor::find("c", json!({}))
        .with_projection_value(&json!({"a": 1, "b": 0}))
        .unwrap_err();
    assert!(matches!(err, stardust::ValidationError::InvalidProjection { .. }));
}

#[test]
fn query_changes_fan_out_to_every_client_rule() {
    let users = Arc::new(MemoryCollection::new("users"));
    let (tx, rx) = unbounded();
    users.observe(ChangeSink::new("users", tx)).unwrap();
    let mut engine = engine_with(&users);

    engine
        .process_rule(RuleOp::Add(activate(first_user_rule("one")).unwrap()))
        .unwrap();
    engine
        .process_rule(RuleOp::Add(activate(first_user_rule("two")).unwrap()))
        .unwrap();

    users.insert(json!({"_id": "z", "role": "admin"})).unwrap();
    let outcome = engine.process_transactions(rx.try_iter().collect());
    assert_eq!(outcome.delta.set.get("admin"), Some(&json!("z")));
    for name in ["one", "two"] {
        let rule = engine.rule(name).unwrap();
        assert_eq!(rule.value("user").unwrap()["_id"], json!("z"));
    }
}

fn color_picker() -> Rule {
    Rule::new()
        .named("picker")
        .mount(Declaration::constant(true))
        .query(
            "settings",
            Declaration::constant(Some(QueryDescriptor::find_one("things", json!({"_id": "s"})))),
        )
        .param(
            "color",
            Declaration::computed(["settings"], |s| {
                Ok(s.get("settings").get("color").cloned().unwrap_or_default())
            }),
        )
        .query(
            "items",
            Declaration::computed(["color"], |s| {
                let color = s.get("color");
                Ok((!color.is_null()).then(|| QueryDescriptor::find("things", json!({"kind": "item", "color": color}))))
            }),
        )
}

#[test]
fn changed_query_descriptor_moves_the_client_between_entries() {
    let things = Arc::new(MemoryCollection::new("things"));
    let (tx, rx) = unbounded();
    things.observe(ChangeSink::new("things", tx)).unwrap();
    things.insert(json!({"_id": "s", "color": "red"})).unwrap();
    things.insert(json!({"_id": "i1", "kind": "item", "color": "red"})).unwrap();
    things.insert(json!({"_id": "i2", "kind": "item", "color": "blue"})).unwrap();
    rx.try_iter().for_each(drop);
    let mut engine = engine_with(&things);

    let red = QueryDescriptor::find("things", json!({"kind": "item", "color": "red"}));
    let blue = QueryDescriptor::find("things", json!({"kind": "item", "color": "blue"}));
    let reds = Rule::new()
        .named("reds")
        .mount(Declaration::constant(true))
        .query("items", Declaration::constant(Some(red.clone())));
    engine.process_rule(RuleOp::Add(activate(reds).unwrap())).unwrap();
    engine
        .process_rule(RuleOp::Add(activate(color_picker()).unwrap()))
        .unwrap();
    assert_eq!(engine.queries().get(&red).unwrap().clients().len(), 2);

    things.update(json!({"_id": "s", "color": "blue"})).unwrap();
    engine.process_transactions(rx.try_iter().collect());

    let picker = engine.rule("picker").unwrap();
    assert_eq!(picker.value("items").unwrap()[0]["_id"], json!("i2"));
    assert_eq!(picker.var("items").unwrap().query(), Some(&blue));
    assert_eq!(
        engine.queries().get(&blue).unwrap().clients(),
        &[VarRef::new("picker", "items")]
    );
    assert_eq!(
        engine.queries().get(&red).unwrap().clients(),
        &[VarRef::new("reds", "items")]
    );
}

#[test]
fn query_descriptor_cleared_releases_the_entry() {
    let things = Arc::new(MemoryCollection::new("things"));
    let (tx, rx) = unbounded();
    things.observe(ChangeSink::new("things", tx)).unwrap();
    things.insert(json!({"_id": "s", "color": "red"})).unwrap();
    things.insert(json!({"_id": "i1", "kind": "item", "color": "red"})).unwrap();
    rx.try_iter().for_each(drop);
    let mut engine = engine_with(&things);

    engine
        .process_rule(RuleOp::Add(activate(color_picker()).unwrap()))
        .unwrap();
    let red = QueryDescriptor::find("things", json!({"kind": "item", "color": "red"}));
    assert!(engine.queries().get(&red).is_some());

    things.remove(&json!("s")).unwrap();
    engine.process_transactions(rx.try_iter().collect());

    let picker = engine.rule("picker").unwrap();
    assert_eq!(picker.value("items"), Some(&Value::Null));
    assert!(picker.var("items").unwrap().query().is_none());
    assert!(engine.queries().get(&red).is_none());
    assert_eq!(engine.queries().len(), 1);
}
