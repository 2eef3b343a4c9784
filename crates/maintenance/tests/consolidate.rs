use analytics_maintenance::IndexConsolidator;
use analytics_migrations::classify::KIBANA_INDEX;
use analytics_storage::{Document, SearchStore};
use serde_json::{Value, json};

fn doc(value: Value) -> Document {
    value.as_object().cloned().unwrap_or_default()
}

fn trace(parent: &str, activity: &str, timestamp: u64) -> Document {
    doc(json!({ "glpId": parent, "activityId": activity, "timestamp": timestamp, "event": "completed" }))
}

fn visualization(index: &str) -> Document {
    let search_source = json!({ "index": index, "query": { "query_string": { "query": "*" } } });
    doc(json!({
        "title": "Completions",
        "visState": "{}",
        "kibanaSavedObjectMeta": { "searchSourceJSON": search_source.to_string() },
    }))
}

async fn fragmented() -> SearchStore {
    let search = SearchStore::in_memory();
    search
        .bulk_index(
            "idx1",
            vec![
                ("t1".to_owned(), trace("idx2", "idx1", 1)),
                ("t2".to_owned(), trace("idx2", "idx1", 2)),
            ],
        )
        .await
        .expect("seed idx1");
    search
        .bulk_index("idx2", vec![("t0".to_owned(), trace("idx2", "idx2", 0))])
        .await
        .expect("seed idx2");
    search
        .bulk_index(
            "results-idx1",
            vec![
                ("p1".to_owned(), doc(json!({ "score": 3 }))),
                ("p2".to_owned(), doc(json!({ "level": 5 }))),
            ],
        )
        .await
        .expect("seed results");
    search
        .create_index("opaque-values-idx1")
        .await
        .expect("seed opaque values");
    search
        .bulk_index(
            KIBANA_INDEX,
            vec![
                ("vis-idx1".to_owned(), visualization("idx1")),
                ("vis-other".to_owned(), visualization("idx3")),
            ],
        )
        .await
        .expect("seed visualizations");
    search
}

#[tokio::test]
async fn traces_move_into_the_parent_and_the_source_is_deleted() {
    let search = fragmented().await;
    let consolidator = IndexConsolidator::new(search.clone()).with_batch_size(1);

    let report = consolidator.run(&["idx1".to_owned()]).await.expect("consolidate");

    let outcome = &report.indices[0];
    assert_eq!(outcome.root.as_deref(), Some("idx2"));
    assert_eq!(outcome.traces_moved, 2);
    assert!(outcome.failures.is_empty(), "{:?}", outcome.failures);
    assert_eq!(search.count("idx2").await.expect("count"), 3);
    assert!(search.get("idx2", "t1").await.expect("get").is_some());
    for gone in ["idx1", "results-idx1", "opaque-values-idx1"] {
        assert!(!search.index_exists(gone).await.expect("exists"), "{gone} kept");
    }
}

#[tokio::test]
async fn results_are_copied_under_composite_keys() {
    let search = fragmented().await;
    IndexConsolidator::new(search.clone())
        .consolidate("idx1")
        .await
        .expect("consolidate");

    let plain = search.get("results-idx2", "idx1_p1").await.expect("get");
    assert_eq!(plain.expect("copied").source["score"], json!(3));
    assert!(search.get("results-idx2", "p1").await.expect("get").is_none());
    let second = search.get("results-idx2", "idx1_p2").await.expect("get");
    assert_eq!(second.expect("copied").source["level"], json!(5));
}

#[tokio::test]
async fn field_limit_is_raised_for_wide_results() {
    let search = fragmented().await;
    search
        .bulk_index("results-idx2", vec![("own".to_owned(), doc(json!({ "a": 1 })))])
        .await
        .expect("seed root results");
    search
        .set_field_limit("results-idx2", 1)
        .await
        .expect("tight limit");

    let outcome = IndexConsolidator::new(search.clone())
        .consolidate("idx1")
        .await
        .expect("consolidate");

    assert_eq!(outcome.results_copied, 2);
    assert!(search.field_limit("results-idx2").await.expect("limit") > 1);
}

#[tokio::test]
async fn visualizations_follow_the_merge() {
    let search = fragmented().await;
    let outcome = IndexConsolidator::new(search.clone())
        .consolidate("idx1")
        .await
        .expect("consolidate");
    assert_eq!(outcome.visualizations_rewritten, 1);

    let hit = search
        .get(KIBANA_INDEX, "vis-idx1")
        .await
        .expect("get")
        .expect("visualization");
    let source: Value = serde_json::from_str(
        hit.source["kibanaSavedObjectMeta"]["searchSourceJSON"]
            .as_str()
            .unwrap_or_default(),
    )
    .expect("json");
    assert_eq!(source["index"], "idx2");
    assert_eq!(source["query"]["query_string"]["query"], "activityId:idx1");

    let untouched = search
        .get(KIBANA_INDEX, "vis-other")
        .await
        .expect("get")
        .expect("visualization");
    assert_eq!(untouched.source, visualization("idx3"));
}

#[tokio::test]
async fn root_sources_and_standalone_indices_are_kept() {
    let search = fragmented().await;
    search
        .create_index("analytics-idx1")
        .await
        .expect("root marker");
    search
        .bulk_index("solo", vec![("s1".to_owned(), trace("solo", "solo", 1))])
        .await
        .expect("seed standalone");

    let report = IndexConsolidator::new(search.clone())
        .run(&["idx1".to_owned(), "solo".to_owned()])
        .await
        .expect("consolidate");

    assert!(report.indices[0].is_root);
    assert!(report.indices[0].deleted.is_empty());
    assert!(search.index_exists("idx1").await.expect("exists"));
    assert_eq!(search.count("idx1").await.expect("count"), 0);
    assert!(report.indices[1].skipped());
    assert_eq!(search.count("solo").await.expect("count"), 1);
}

#[tokio::test]
async fn candidates_exclude_system_indices() {
    let search = fragmented().await;
    let candidates = IndexConsolidator::new(search)
        .candidate_indices()
        .await
        .expect("candidates");
    assert_eq!(candidates, vec!["idx1".to_owned(), "idx2".to_owned()]);
}
