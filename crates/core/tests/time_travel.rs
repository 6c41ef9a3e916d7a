use revgraph::{
    Entity, GraphKind, KeyFilter, Position, RevgraphError, StoreConfig, Value, VersionedGraph,
    MASTER,
};
use tempfile::tempdir;

/// Graph `G` with node `n1` red at master 0, blue at master 1, and branch
/// `alt` forked at 1 that turns it green at 2.
fn scenario(db: &VersionedGraph) -> Entity {
    db.new_graph("G", GraphKind::Graph).unwrap();
    db.add_node("G", "n1").unwrap();
    let n1 = Entity::node("G", "n1");
    db.set(&n1, "color", &Value::from("red")).unwrap();
    db.set_revision(1).unwrap();
    db.set(&n1, "color", &Value::from("blue")).unwrap();
    db.set_branch("alt").unwrap();
    db.set_revision(2).unwrap();
    db.set(&n1, "color", &Value::from("green")).unwrap();
    n1
}

#[test]
fn end_to_end_branch_and_time_travel() {
    let db = VersionedGraph::open_in_memory().unwrap();
    let n1 = scenario(&db);

    let color = |branch: &str, rev: u64| db.get_at(&n1, "color", &Position::new(branch, rev)).unwrap();
    assert_eq!(color(MASTER, 1), Some(Value::from("blue")));
    assert_eq!(color("alt", 2), Some(Value::from("green")));
    assert_eq!(color(MASTER, 0), Some(Value::from("red")));
    // alt at its fork point still sees master's value.
    assert_eq!(color("alt", 1), Some(Value::from("blue")));
    // master never sees alt's write.
    assert_eq!(color(MASTER, 2), Some(Value::from("blue")));

    let w = db
        .window(&n1, KeyFilter::Keys(vec!["color".into()]), MASTER, 0, 1)
        .unwrap();
    assert_eq!(
        w.series["color"],
        vec![Some(Value::from("red")), Some(Value::from("blue"))]
    );
}

#[test]
fn diff_across_the_fork() {
    let db = VersionedGraph::open_in_memory().unwrap();
    let n1 = scenario(&db);

    let changes = db.diff(&n1, "alt", 1, 2).unwrap();
    assert_eq!(changes.len(), 1);
    assert_eq!(changes[0].key, "color");
    assert_eq!(changes[0].before, Some(Value::from("blue")));
    assert_eq!(changes[0].after, Some(Value::from("green")));

    assert!(db.diff(&n1, MASTER, 1, 2).unwrap().is_empty());
}

#[test]
fn nested_branches_resolve_through_every_ancestor() {
    let db = VersionedGraph::open_in_memory().unwrap();
    let n1 = scenario(&db);
    db.new_branch("alt2", "alt", 3).unwrap();
    db.set_at(&n1, "size", &Value::Int(9), &Position::new(MASTER, 0)).unwrap();

    assert_eq!(db.lineage("alt2").unwrap(), vec!["alt2", "alt", MASTER]);
    let at = Position::new("alt2", 7);
    assert_eq!(db.get_at(&n1, "color", &at).unwrap(), Some(Value::from("green")));
    assert_eq!(db.get_at(&n1, "size", &at).unwrap(), Some(Value::Int(9)));
    assert_eq!(db.keys_at(&n1, &at).unwrap(), vec!["color", "size"]);
}

#[test]
fn structured_values_survive_reopen() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("world.revgraph");
    let path = path.to_str().unwrap();
    let pos = Value::Tuple(vec![Value::Int(3), Value::Int(4)]);
    let path_points = Value::List(vec![pos.clone(), Value::List(vec![])]);

    {
        let db = VersionedGraph::open(path).unwrap();
        db.new_graph("G", GraphKind::Graph).unwrap();
        db.set(&Entity::graph("G"), "route", &path_points).unwrap();
        db.close().unwrap();
    }

    let db = VersionedGraph::open_with(path, &StoreConfig::default().with_interchange_cache_limit(8))
        .unwrap();
    let route = db.get(&Entity::graph("G"), "route").unwrap().unwrap();
    assert_eq!(route, path_points);
    match route {
        Value::List(items) => assert!(matches!(items[0], Value::Tuple(_)), "tuple kept its kind"),
        other => panic!("expected a list, got {other}"),
    }
}

#[test]
fn views_edit_history_not_the_past() {
    let db = VersionedGraph::open_in_memory().unwrap();
    let n1 = scenario(&db);
    db.set(&n1, "inventory", &Value::List(vec![Value::from("sword")])).unwrap();
    db.set_revision(3).unwrap();

    let inventory = db.view(&n1, "inventory").unwrap().unwrap().into_view().unwrap();
    inventory.push(Value::from("shield")).unwrap();

    assert_eq!(
        db.get_at(&n1, "inventory", &Position::new("alt", 2)).unwrap(),
        Some(Value::List(vec![Value::from("sword")]))
    );
    assert_eq!(inventory.len().unwrap(), 2);
    assert!(matches!(
        db.get_at(&n1, "inventory", &Position::new(MASTER, 3)).unwrap(),
        None
    ));
}

#[test]
fn memory_flavor_is_selected_by_config() {
    let config = StoreConfig::default().with_flavor("memory");
    let db = VersionedGraph::open_with("ignored", &config).unwrap();
    db.new_graph("G", GraphKind::MultiGraph).unwrap();
    assert_eq!(db.graph_kind("G").unwrap(), GraphKind::MultiGraph);

    let err = VersionedGraph::open_with("ignored", &StoreConfig::default().with_flavor("sqlite"));
    assert!(matches!(err, Err(RevgraphError::UnknownFlavor(_))));
}
