//! A tiny in-memory `Repo` fixture shared by the relational-source tests.
//! Not meant to demonstrate a real query layer (that part is explicitly
//! out of scope) -- just enough predicate tracking to assert on how many
//! times, and with what filter, the engine actually dispatched.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use coalesce::{Association, AssociationKind, EntitySchema, FieldValue, IdKind, Record, Repo, RepoOpts};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Widget {
    pub id: i64,
    pub owner_id: i64,
    pub name: String,
}

impl Record for Widget {
    fn field(&self, name: &str) -> Option<FieldValue> {
        match name {
            "id" => Some(FieldValue::Int(self.id)),
            "owner_id" => Some(FieldValue::Int(self.owner_id)),
            "name" => Some(FieldValue::Str(self.name.clone())),
            _ => None,
        }
    }
}

#[derive(Clone, Debug)]
pub enum Predicate {
    None,
    IdIn(Vec<FieldValue>),
    ColumnIn(String, Vec<FieldValue>),
}

impl Default for Predicate {
    fn default() -> Self {
        Predicate::None
    }
}

impl Predicate {
    fn matches(&self, widget: &Widget) -> bool {
        match self {
            Predicate::None => false,
            Predicate::IdIn(ids) => ids.contains(&FieldValue::Int(widget.id)),
            Predicate::ColumnIn(column, values) => widget
                .field(column)
                .map(|value| values.contains(&value))
                .unwrap_or(false),
        }
    }
}

pub struct WidgetRepo {
    widgets: Vec<Widget>,
    pub calls: Arc<AtomicUsize>,
}

impl WidgetRepo {
    pub fn new(widgets: Vec<Widget>) -> Self {
        WidgetRepo {
            widgets,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Repo for WidgetRepo {
    type Query = Predicate;
    type Row = Widget;
    type Error = String;

    async fn execute(&self, query: Predicate, _repo_opts: &RepoOpts) -> Result<Vec<Widget>, String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .widgets
            .iter()
            .filter(|widget| query.matches(widget))
            .cloned()
            .collect())
    }

    fn with_id_in(&self, _query: Predicate, ids: &[FieldValue]) -> Predicate {
        Predicate::IdIn(ids.to_vec())
    }

    fn with_column_in(&self, _query: Predicate, column: &str, values: &[FieldValue]) -> Predicate {
        Predicate::ColumnIn(column.to_string(), values.to_vec())
    }

    fn with_foreign_key_in(&self, _query: Predicate, foreign_key: &str, parent_ids: &[FieldValue]) -> Predicate {
        Predicate::ColumnIn(foreign_key.to_string(), parent_ids.to_vec())
    }
}

pub fn widget_schema() -> EntitySchema {
    EntitySchema::new("widgets", "id", IdKind::Integer)
}

/// An "owner" entity with a has-many association to widgets it owns,
/// joined on `widgets.owner_id`.
pub fn owner_schema() -> EntitySchema {
    EntitySchema::new("owners", "id", IdKind::Integer).with_association(
        "widgets",
        Association {
            kind: AssociationKind::HasMany,
            foreign_key: "owner_id",
            target_entity: "widgets",
        },
    )
}

pub fn sample_widgets() -> Vec<Widget> {
    vec![
        Widget { id: 1, owner_id: 10, name: "alpha".into() },
        Widget { id: 2, owner_id: 10, name: "beta".into() },
        Widget { id: 3, owner_id: 20, name: "gamma".into() },
    ]
}
