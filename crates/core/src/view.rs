//! In-place editing of stored lists and maps.
//!
//! A [`MutableView`] holds no data, only the way back to it: the entity, the
//! attribute key, and the path of indices from the stored root down to the
//! viewed container. Every read fetches the root again at the store's
//! current position; every mutation fetches the root, edits the copy and
//! writes the whole root back with a single `set`.

use crate::value::Value;
use crate::{Entity, Result, RevgraphError, VersionedGraph};

/// A value read through a view: containers come back as nested views,
/// everything else (tuples included) as a plain value.
#[derive(Debug, Clone)]
pub enum ViewItem<'g> {
    Value(Value),
    View(MutableView<'g>),
}

impl<'g> ViewItem<'g> {
    pub(crate) fn wrap(
        graph: &'g VersionedGraph,
        entity: &Entity,
        key: &str,
        path: Vec<Value>,
        value: Value,
    ) -> Self {
        if value.is_container() {
            ViewItem::View(MutableView {
                graph,
                entity: entity.clone(),
                key: key.to_string(),
                path,
            })
        } else {
            ViewItem::Value(value)
        }
    }

    /// The underlying value, resolving a view if needed.
    pub fn resolve(&self) -> Result<Value> {
        match self {
            ViewItem::Value(v) => Ok(v.clone()),
            ViewItem::View(view) => view.resolve(),
        }
    }

    pub fn as_view(&self) -> Option<&MutableView<'g>> {
        match self {
            ViewItem::View(view) => Some(view),
            ViewItem::Value(_) => None,
        }
    }

    pub fn into_view(self) -> Option<MutableView<'g>> {
        match self {
            ViewItem::View(view) => Some(view),
            ViewItem::Value(_) => None,
        }
    }
}

/// Live handle on a list or map stored under one attribute.
#[derive(Debug, Clone)]
pub struct MutableView<'g> {
    graph: &'g VersionedGraph,
    entity: Entity,
    key: String,
    path: Vec<Value>,
}

impl<'g> MutableView<'g> {
    pub fn entity(&self) -> &Entity {
        &self.entity
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Indices from the stored root to this container.
    pub fn path(&self) -> &[Value] {
        &self.path
    }

    /// Current value of the viewed container.
    pub fn resolve(&self) -> Result<Value> {
        let root = self.root()?;
        descend(&root, &self.path).cloned()
    }

    /// The element at `index` (a list position or a map key).
    pub fn get(&self, index: impl Into<Value>) -> Result<ViewItem<'g>> {
        let index = index.into();
        let container = self.resolve()?;
        let value = child(&container, &index)?
            .cloned()
            .ok_or_else(|| RevgraphError::NotFound(format!("{index} in {}", self.describe())))?;
        let mut path = self.path.clone();
        path.push(index);
        Ok(ViewItem::wrap(self.graph, &self.entity, &self.key, path, value))
    }

    /// Replace a list element, or insert or replace a map entry.
    pub fn set(&self, index: impl Into<Value>, value: Value) -> Result<()> {
        let index = index.into();
        self.modify(|container| match container {
            Value::List(items) => {
                let slot = writable_position(items.len(), &index)?;
                items[slot] = value;
                Ok(())
            }
            Value::Map(map) => {
                map.insert(index, value);
                Ok(())
            }
            other => Err(not_a_container(other)),
        })
    }

    /// Remove and return the element at `index`.
    pub fn remove(&self, index: impl Into<Value>) -> Result<Value> {
        let index = index.into();
        let describe = self.describe();
        self.modify(|container| match container {
            Value::List(items) => {
                let slot = list_position(items.len(), &index)?;
                Ok(items.remove(slot))
            }
            Value::Map(map) => map
                .remove(&index)
                .ok_or_else(|| RevgraphError::NotFound(format!("{index} in {describe}"))),
            other => Err(not_a_container(other)),
        })
    }

    /// Append to a list.
    pub fn push(&self, value: Value) -> Result<()> {
        self.modify(|container| match container {
            Value::List(items) => {
                items.push(value);
                Ok(())
            }
            other => Err(RevgraphError::InvalidView(format!(
                "push needs a list, found {}",
                other.kind()
            ))),
        })
    }

    /// Insert into a list before `index`; `index == len` appends.
    pub fn insert(&self, index: usize, value: Value) -> Result<()> {
        self.modify(|container| match container {
            Value::List(items) if index <= items.len() => {
                items.insert(index, value);
                Ok(())
            }
            Value::List(items) => Err(RevgraphError::InvalidView(format!(
                "insert position {index} past end of list of {}",
                items.len()
            ))),
            other => Err(RevgraphError::InvalidView(format!(
                "insert needs a list, found {}",
                other.kind()
            ))),
        })
    }

    pub fn len(&self) -> Result<usize> {
        match self.resolve()? {
            Value::List(items) => Ok(items.len()),
            Value::Map(map) => Ok(map.len()),
            other => Err(not_a_container(&other)),
        }
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Membership: an element of a list, a key of a map.
    pub fn contains(&self, item: &Value) -> Result<bool> {
        match self.resolve()? {
            Value::List(items) => Ok(items.contains(item)),
            Value::Map(map) => Ok(map.contains_key(item)),
            other => Err(not_a_container(&other)),
        }
    }

    /// Index/element pairs, elements wrapped like [`get`](Self::get).
    pub fn items(&self) -> Result<Vec<(Value, ViewItem<'g>)>> {
        let entries: Vec<(Value, Value)> = match self.resolve()? {
            Value::List(items) => items
                .into_iter()
                .enumerate()
                .map(|(i, v)| (Value::Int(i as i64), v))
                .collect(),
            Value::Map(map) => map.into_iter().collect(),
            other => return Err(not_a_container(&other)),
        };
        Ok(entries
            .into_iter()
            .map(|(index, value)| {
                let mut path = self.path.clone();
                path.push(index.clone());
                let item = ViewItem::wrap(self.graph, &self.entity, &self.key, path, value);
                (index, item)
            })
            .collect())
    }

    fn root(&self) -> Result<Value> {
        self.graph
            .get(&self.entity, &self.key)?
            .ok_or_else(|| RevgraphError::NotFound(self.describe()))
    }

    fn modify<T>(&self, edit: impl FnOnce(&mut Value) -> Result<T>) -> Result<T> {
        let mut root = self.root()?;
        let out = edit(descend_mut(&mut root, &self.path)?)?;
        self.graph.set(&self.entity, &self.key, &root)?;
        Ok(out)
    }

    fn describe(&self) -> String {
        format!("{} key {:?}", self.entity, self.key)
    }
}

impl PartialEq<Value> for MutableView<'_> {
    fn eq(&self, other: &Value) -> bool {
        self.resolve().is_ok_and(|v| v == *other)
    }
}

fn not_a_container(value: &Value) -> RevgraphError {
    RevgraphError::InvalidView(format!("{} is not a list or map", value.kind()))
}

fn list_position(len: usize, index: &Value) -> Result<usize> {
    let i = index
        .as_int()
        .ok_or_else(|| RevgraphError::InvalidView(format!("list index must be an int, got {index}")))?;
    usize::try_from(i)
        .ok()
        .filter(|&i| i < len)
        .ok_or_else(|| RevgraphError::NotFound(format!("index {i} in list of {len}")))
}

/// Like [`list_position`], but a slot outside the list is a misuse of the
/// view rather than a missing element.
fn writable_position(len: usize, index: &Value) -> Result<usize> {
    list_position(len, index).map_err(|e| match e {
        RevgraphError::NotFound(msg) => RevgraphError::InvalidView(msg),
        other => other,
    })
}

fn child<'v>(container: &'v Value, index: &Value) -> Result<Option<&'v Value>> {
    match container {
        Value::List(items) => Ok(list_position(items.len(), index).ok().map(|i| &items[i])),
        Value::Map(map) => Ok(map.get(index)),
        other => Err(not_a_container(other)),
    }
}

fn descend<'v>(root: &'v Value, path: &[Value]) -> Result<&'v Value> {
    let mut node = root;
    for index in path {
        node = child(node, index)?
            .ok_or_else(|| RevgraphError::NotFound(format!("path element {index} no longer exists")))?;
    }
    if !node.is_container() {
        return Err(not_a_container(node));
    }
    Ok(node)
}

fn descend_mut<'v>(node: &'v mut Value, path: &[Value]) -> Result<&'v mut Value> {
    let Some((index, rest)) = path.split_first() else {
        if !node.is_container() {
            return Err(not_a_container(node));
        }
        return Ok(node);
    };
    let next = match node {
        Value::List(items) => {
            let slot = list_position(items.len(), index)?;
            &mut items[slot]
        }
        Value::Map(map) => map.get_mut(index).ok_or_else(|| {
            RevgraphError::NotFound(format!("path element {index} no longer exists"))
        })?,
        other => return Err(not_a_container(other)),
    };
    descend_mut(next, rest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{GraphKind, Position, MASTER};
    use std::collections::BTreeMap;

    fn store() -> (VersionedGraph, Entity) {
        let db = VersionedGraph::open_in_memory().unwrap();
        db.new_graph("G", GraphKind::Graph).unwrap();
        db.add_node("G", "n1").unwrap();
        (db, Entity::node("G", "n1"))
    }

    fn view<'g>(db: &'g VersionedGraph, e: &Entity, key: &str) -> MutableView<'g> {
        db.view(e, key).unwrap().unwrap().into_view().unwrap()
    }

    #[test]
    fn scalars_and_tuples_are_not_wrapped() {
        let (db, n1) = store();
        db.set(&n1, "hp", &Value::Int(3)).unwrap();
        db.set(&n1, "pos", &Value::Tuple(vec![Value::Int(1), Value::Int(2)])).unwrap();
        assert!(matches!(db.view(&n1, "hp").unwrap(), Some(ViewItem::Value(Value::Int(3)))));
        assert!(matches!(db.view(&n1, "pos").unwrap(), Some(ViewItem::Value(Value::Tuple(_)))));
        assert!(db.view(&n1, "missing").unwrap().is_none());
    }

    #[test]
    fn nested_edit_writes_back_through_root() {
        let (db, n1) = store();
        let mut inner = BTreeMap::new();
        inner.insert(Value::from("xs"), Value::List(vec![Value::Int(1)]));
        db.set(&n1, "data", &Value::Map(inner)).unwrap();

        let data = view(&db, &n1, "data");
        let xs = data.get("xs").unwrap().into_view().unwrap();
        xs.push(Value::Int(2)).unwrap();
        xs.insert(0, Value::Int(0)).unwrap();

        let stored = db.get(&n1, "data").unwrap().unwrap();
        let mut expected = BTreeMap::new();
        expected.insert(
            Value::from("xs"),
            Value::List(vec![Value::Int(0), Value::Int(1), Value::Int(2)]),
        );
        assert_eq!(stored, Value::Map(expected));
        assert_eq!(xs.len().unwrap(), 3);
        assert!(xs.contains(&Value::Int(2)).unwrap());
    }

    #[test]
    fn edits_land_at_the_current_position() {
        let (db, n1) = store();
        db.set(&n1, "tags", &Value::List(vec![Value::from("a")])).unwrap();
        db.set_revision(1).unwrap();
        view(&db, &n1, "tags").push(Value::from("b")).unwrap();

        let old = db.get_at(&n1, "tags", &Position::new(MASTER, 0)).unwrap();
        assert_eq!(old, Some(Value::List(vec![Value::from("a")])));
        assert_eq!(
            db.get(&n1, "tags").unwrap(),
            Some(Value::List(vec![Value::from("a"), Value::from("b")]))
        );
    }

    #[test]
    fn set_and_remove_on_lists_and_maps() {
        let (db, n1) = store();
        db.set(&n1, "xs", &Value::List(vec![Value::Int(1), Value::Int(2)])).unwrap();
        db.set(&n1, "m", &Value::Map(BTreeMap::new())).unwrap();

        let xs = view(&db, &n1, "xs");
        xs.set(1, Value::Int(20)).unwrap();
        assert_eq!(xs.remove(0).unwrap(), Value::Int(1));
        assert!(xs == Value::List(vec![Value::Int(20)]));
        assert!(matches!(xs.set(5, Value::Null).unwrap_err(), RevgraphError::InvalidView(_)));
        assert!(matches!(xs.insert(3, Value::Null).unwrap_err(), RevgraphError::InvalidView(_)));
        assert!(matches!(xs.get(5).unwrap_err(), RevgraphError::NotFound(_)));
        assert!(matches!(xs.remove(5).unwrap_err(), RevgraphError::NotFound(_)));
        assert!(matches!(xs.set("a", Value::Null).unwrap_err(), RevgraphError::InvalidView(_)));

        let m = view(&db, &n1, "m");
        assert!(m.is_empty().unwrap());
        m.set(Value::Int(7), Value::from("seven")).unwrap();
        assert!(m.contains(&Value::Int(7)).unwrap());
        let items = m.items().unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].0, Value::Int(7));
        assert_eq!(m.remove(Value::Int(7)).unwrap(), Value::from("seven"));
        assert!(matches!(m.push(Value::Null).unwrap_err(), RevgraphError::InvalidView(_)));
    }

    #[test]
    fn view_of_deleted_root_is_not_found() {
        let (db, n1) = store();
        db.set(&n1, "xs", &Value::List(vec![])).unwrap();
        let xs = view(&db, &n1, "xs");
        db.delete(&n1, "xs").unwrap();
        assert!(matches!(xs.len().unwrap_err(), RevgraphError::NotFound(_)));
        assert!(matches!(xs.push(Value::Int(1)).unwrap_err(), RevgraphError::NotFound(_)));
    }
}
