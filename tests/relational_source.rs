mod support;

use std::sync::atomic::Ordering;

use coalesce::{association_batch, column_batch, item_key, Cardinality, Loader, LoaderOptions, Params, RelationalSource};
use support::{owner_schema, sample_widgets, widget_schema, Widget, WidgetRepo};

fn build_loader(repo: WidgetRepo) -> Loader {
    let source = RelationalSource::build(repo, [widget_schema(), owner_schema()]).finish();
    let mut loader = Loader::new(LoaderOptions::new());
    loader.add_source("widgets", source);
    loader
}

#[tokio::test]
async fn column_load_with_one_cardinality_matches_a_single_row() {
    let repo = WidgetRepo::new(sample_widgets());
    let loader = build_loader(repo);

    let batch = column_batch(Cardinality::One, "widgets", Params::new(), "name");
    loader.load("widgets", batch.clone(), item_key("alpha")).unwrap();
    loader.run().await;

    let found: Option<Widget> = loader.get("widgets", batch, item_key("alpha")).await.unwrap();
    assert_eq!(found.unwrap().id, 1);
}

#[tokio::test]
async fn column_load_with_one_cardinality_reports_multiple_results() {
    let mut widgets = sample_widgets();
    widgets.push(Widget { id: 4, owner_id: 30, name: "alpha".into() });
    let repo = WidgetRepo::new(widgets);
    let loader = build_loader(repo);

    let batch = column_batch(Cardinality::One, "widgets", Params::new(), "name");
    loader.load("widgets", batch.clone(), item_key("alpha")).unwrap();
    loader.run().await;

    let result: Result<Option<Widget>, _> = loader.get("widgets", batch, item_key("alpha")).await;
    assert!(result.is_err(), "two rows sharing a `one`-cardinality column must raise, not pick one silently");
}

#[tokio::test]
async fn column_load_with_many_cardinality_returns_every_match_including_empty() {
    let repo = WidgetRepo::new(sample_widgets());
    let loader = build_loader(repo);

    let batch = column_batch(Cardinality::Many, "widgets", Params::new(), "owner_id");
    loader.load("widgets", batch.clone(), item_key(10i64)).unwrap();
    loader.load("widgets", batch.clone(), item_key(999i64)).unwrap();
    loader.run().await;

    let owned_by_10: Option<Vec<Widget>> = loader.get("widgets", batch.clone(), item_key(10i64)).await.unwrap();
    let names: Vec<_> = owned_by_10.unwrap().into_iter().map(|w| w.name).collect();
    assert_eq!(names, vec!["alpha".to_string(), "beta".to_string()]);

    let owned_by_nobody: Option<Vec<Widget>> = loader.get("widgets", batch, item_key(999i64)).await.unwrap();
    assert_eq!(owned_by_nobody, Some(Vec::new()));
}

#[tokio::test]
async fn has_many_association_load_batches_across_parents() {
    let repo = WidgetRepo::new(sample_widgets());
    let calls = repo.calls.clone();
    let loader = build_loader(repo);

    let batch = association_batch("owners", "widgets", Params::new());
    loader.load("widgets", batch.clone(), item_key(10i64)).unwrap();
    loader.load("widgets", batch.clone(), item_key(20i64)).unwrap();
    loader.run().await;

    assert_eq!(calls.load(Ordering::SeqCst), 1, "both parents' widgets must come from one dispatch");

    let owner_10: Option<Vec<Widget>> = loader.get("widgets", batch.clone(), item_key(10i64)).await.unwrap();
    assert_eq!(owner_10.unwrap().len(), 2);

    let owner_20: Option<Vec<Widget>> = loader.get("widgets", batch, item_key(20i64)).await.unwrap();
    assert_eq!(owner_20.unwrap().len(), 1);
}

#[tokio::test]
async fn a_custom_run_batch_override_replaces_the_default_dispatch() {
    use coalesce::Outcome;

    let repo = WidgetRepo::new(sample_widgets());
    let calls = repo.calls.clone();
    let source = RelationalSource::build(repo, [widget_schema()])
        .run_batch(|_entity, _query, _column, ids, _opts| async move {
            // Bypasses the repo entirely -- a stand-in for dispatch logic
            // backed by something the default `Repo::with_id_in` path can't
            // express (e.g. a batched stored procedure).
            Ok(ids
                .into_iter()
                .map(|id| match id {
                    coalesce::FieldValue::Int(1) => Outcome::ok(Widget { id: 1, owner_id: 10, name: "override".into() }),
                    _ => Outcome::NotFound,
                })
                .collect::<Vec<_>>())
        })
        .finish();
    let mut loader = Loader::new(LoaderOptions::new());
    loader.add_source("widgets", source);

    let batch = coalesce::primary_key_batch("widgets", Params::new());
    loader.load("widgets", batch.clone(), item_key(1i64)).unwrap();
    loader.load("widgets", batch.clone(), item_key(2i64)).unwrap();
    loader.run().await;

    assert_eq!(calls.load(Ordering::SeqCst), 0, "the repo must never be consulted once run_batch is set");

    let found: Option<Widget> = loader.get("widgets", batch.clone(), item_key(1i64)).await.unwrap();
    assert_eq!(found.unwrap().name, "override");

    let missing: Option<Widget> = loader.get("widgets", batch, item_key(2i64)).await.unwrap();
    assert!(missing.is_none());
}

#[tokio::test]
async fn a_run_batch_override_returning_the_wrong_count_is_a_protocol_violation() {
    let repo = WidgetRepo::new(sample_widgets());
    let source = RelationalSource::build(repo, [widget_schema()])
        .run_batch(|_entity, _query, _column, _ids, _opts| async move {
            Ok(vec![coalesce::Outcome::NotFound])
        })
        .finish();
    let mut loader = Loader::new(LoaderOptions::new());
    loader.add_source("widgets", source);

    let batch = coalesce::primary_key_batch("widgets", Params::new());
    loader.load("widgets", batch.clone(), item_key(1i64)).unwrap();
    loader.load("widgets", batch.clone(), item_key(2i64)).unwrap();
    loader.run().await;

    let result: Result<Option<Widget>, _> = loader.get("widgets", batch, item_key(1i64)).await;
    assert!(result.is_err(), "returning 1 outcome for 2 pending items must surface as a protocol violation");
}

#[tokio::test]
async fn many_to_many_association_without_a_run_batch_override_fails_clearly() {
    use coalesce::{Association, AssociationKind, EntitySchema};

    let repo = WidgetRepo::new(sample_widgets());
    let schema = EntitySchema::new("owners", "id", coalesce::IdKind::Integer).with_association(
        "tags",
        Association {
            kind: AssociationKind::ManyToMany { join_entity: "owner_tags" },
            foreign_key: "owner_id",
            target_entity: "widgets",
        },
    );
    let source = RelationalSource::build(repo, [widget_schema(), schema]).finish();
    let mut loader = Loader::new(LoaderOptions::new());
    loader.add_source("widgets", source);

    let batch = association_batch("owners", "tags", Params::new());
    loader.load("widgets", batch.clone(), item_key(10i64)).unwrap();
    loader.run().await;

    let result: Result<Option<Vec<Widget>>, _> = loader.get("widgets", batch, item_key(10i64)).await;
    assert!(result.is_err());
}
