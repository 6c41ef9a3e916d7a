use proptest::prelude::*;
use revgraph::{
    Entity, GraphKind, InterchangeCache, Position, StoredValue, Tag, Value, ValueCodec,
    VersionedGraph, MASTER,
};
use std::collections::{BTreeMap, HashMap};

fn structured_value() -> impl Strategy<Value = Value> {
    let leaf = prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::Bool),
        any::<i64>().prop_map(Value::Int),
        any::<f64>()
            .prop_filter("finite", |f| f.is_finite())
            .prop_map(Value::Float),
        ".{0,8}".prop_map(Value::Text),
    ];
    leaf.prop_recursive(4, 48, 6, |inner| {
        prop_oneof![
            prop::collection::vec(inner.clone(), 0..6).prop_map(Value::List),
            prop::collection::vec(inner.clone(), 0..6).prop_map(Value::Tuple),
            prop::collection::btree_map(inner.clone(), inner, 0..6).prop_map(Value::Map),
        ]
    })
}

/// A branch tree built in creation order: every entry is
/// `(name, parent, parent_rev)`.
#[derive(Debug, Clone)]
struct Tree {
    branches: Vec<(String, String, u64)>,
}

impl Tree {
    fn start(&self, branch: &str) -> u64 {
        self.branches
            .iter()
            .find(|(name, _, _)| name == branch)
            .map(|(_, _, rev)| *rev)
            .unwrap_or(0)
    }

    fn parent(&self, branch: &str) -> Option<&str> {
        self.branches
            .iter()
            .find(|(name, _, _)| name == branch)
            .map(|(_, parent, _)| parent.as_str())
    }

    fn names(&self) -> Vec<String> {
        std::iter::once(MASTER.to_string())
            .chain(self.branches.iter().map(|(name, _, _)| name.clone()))
            .collect()
    }
}

fn tree() -> impl Strategy<Value = Tree> {
    prop::collection::vec((any::<prop::sample::Index>(), 0u64..4), 0..5).prop_map(|forks| {
        let mut tree = Tree { branches: Vec::new() };
        for (i, (parent, offset)) in forks.into_iter().enumerate() {
            let names = tree.names();
            let parent = parent.get(&names).clone();
            let parent_rev = tree.start(&parent) + offset;
            tree.branches.push((format!("b{i}"), parent, parent_rev));
        }
        tree
    })
}

/// Brute force: every row on the bounded lineage, greatest revision first,
/// nearest branch on ties.
fn expected(tree: &Tree, rows: &HashMap<(String, u64), i64>, branch: &str, rev: u64) -> Option<i64> {
    let mut best: Option<(u64, usize, i64)> = None;
    let mut current = branch.to_string();
    let mut ceiling = rev;
    let mut distance = 0;
    loop {
        for ((b, r), v) in rows {
            if *b == current && *r <= ceiling {
                let better = match best {
                    None => true,
                    Some((br, bd, _)) => *r > br || (*r == br && distance < bd),
                };
                if better {
                    best = Some((*r, distance, *v));
                }
            }
        }
        match tree.parent(&current) {
            Some(parent) => {
                ceiling = tree.start(&current);
                current = parent.to_string();
                distance += 1;
            }
            None => break,
        }
    }
    best.map(|(_, _, v)| v)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn codec_round_trips_structured_values(value in structured_value()) {
        let codec = ValueCodec::new(InterchangeCache::new(), false);
        let stored = codec.encode(&value).unwrap();
        prop_assert_ne!(stored.tag, Tag::Blob);
        prop_assert_eq!(codec.decode(&stored).unwrap(), Some(value.clone()));

        // A second codec with a cold cache reads the same text identically.
        let fresh = ValueCodec::new(InterchangeCache::new(), false);
        let copy = StoredValue { value: stored.value.clone(), tag: stored.tag };
        prop_assert_eq!(fresh.decode(&copy).unwrap(), Some(value));
    }

    #[test]
    fn resolution_matches_brute_force(
        tree in tree(),
        writes in prop::collection::vec((any::<prop::sample::Index>(), 0u64..6, any::<i64>()), 0..16),
        queries in prop::collection::vec((any::<prop::sample::Index>(), 0u64..8), 1..8),
    ) {
        let db = VersionedGraph::open_in_memory().unwrap();
        db.new_graph("G", GraphKind::Graph).unwrap();
        db.add_node("G", "n").unwrap();
        for (name, parent, parent_rev) in &tree.branches {
            db.new_branch(name, parent, *parent_rev).unwrap();
        }

        let n = Entity::node("G", "n");
        let names = tree.names();
        let mut rows = HashMap::new();
        for (branch, offset, v) in writes {
            let branch = branch.get(&names);
            let rev = tree.start(branch) + offset;
            db.set_at(&n, "k", &Value::Int(v), &Position::new(branch.as_str(), rev)).unwrap();
            rows.insert((branch.clone(), rev), v);
        }

        for (branch, offset) in queries {
            let branch = branch.get(&names);
            let rev = tree.start(branch) + offset;
            let got = db
                .get_at(&n, "k", &Position::new(branch.as_str(), rev))
                .unwrap()
                .and_then(|v| v.as_int());
            prop_assert_eq!(got, expected(&tree, &rows, branch, rev), "{}@{}", branch, rev);
        }
    }

    #[test]
    fn window_agrees_with_point_reads(
        writes in prop::collection::vec((0u64..10, prop::option::of(any::<i64>())), 0..10),
        from in 0u64..5,
        span in 0u64..6,
    ) {
        let db = VersionedGraph::open_in_memory().unwrap();
        db.new_graph("G", GraphKind::Graph).unwrap();
        let g = Entity::graph("G");
        for (rev, v) in &writes {
            let at = Position::new(MASTER, *rev);
            match v {
                Some(v) => db.set_at(&g, "k", &Value::Int(*v), &at).unwrap(),
                None => db.delete_at(&g, "k", &at).unwrap(),
            }
        }

        let to = from + span;
        let w = db
            .window(&g, revgraph::KeyFilter::Keys(vec!["k".into()]), MASTER, from, to)
            .unwrap();
        let series = &w.series["k"];
        prop_assert_eq!(series.len() as u64, span + 1);
        for (i, got) in series.iter().enumerate() {
            let want = db.get_at(&g, "k", &Position::new(MASTER, from + i as u64)).unwrap();
            prop_assert_eq!(got, &want);
        }
    }
}

#[test]
fn map_keys_that_look_like_json_stay_text() {
    let codec = ValueCodec::new(InterchangeCache::new(), false);
    let mut map = BTreeMap::new();
    map.insert(Value::from("null"), Value::Int(1));
    map.insert(Value::Null, Value::Int(2));
    map.insert(Value::from("[\"list\"]"), Value::Int(3));
    map.insert(Value::List(vec![]), Value::Int(4));
    let value = Value::Map(map);
    let stored = codec.encode(&value).unwrap();
    assert_eq!(codec.decode(&stored).unwrap(), Some(value));
}
