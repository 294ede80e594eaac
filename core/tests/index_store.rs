//! Integration tests for component G (spec §4.7) against a real on-disk
//! SQLite file, exercising the public `IndexStore` surface the way
//! `discovery`/`http` actually call it rather than the schema internals.

use media_core::index::{IndexStore, QueryOptions};
use media_core::model::FileRecord;

async fn open_store() -> (IndexStore, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("index.db");
    let media_root = dir.path().join("media");
    let store = IndexStore::open(db_path, media_root).await.unwrap();
    (store, dir)
}

#[tokio::test]
async fn insert_bare_paths_then_get_round_trips() {
    let (store, _dir) = open_store().await;

    let inserted = store
        .insert_bare_paths(vec![
            ("/".to_string(), "a.jpg".to_string(), Some("image/jpeg".to_string())),
            ("/".to_string(), "b.mp4".to_string(), Some("video/mp4".to_string())),
        ])
        .await
        .unwrap();
    assert_eq!(inserted, 2);

    let record = store.get("a.jpg".to_string()).await.unwrap().expect("row exists");
    assert_eq!(record.file_name, "a.jpg");
    assert_eq!(record.mime_type.as_deref(), Some("image/jpeg"));
    assert!(record.info_processed_at.is_none());
}

#[tokio::test]
async fn insert_bare_paths_ignores_existing_rows() {
    let (store, _dir) = open_store().await;

    store
        .insert_bare_paths(vec![("/".to_string(), "a.jpg".to_string(), None)])
        .await
        .unwrap();
    store
        .add_or_update_file_data(
            "a.jpg".to_string(),
            FileRecord { rating: Some(5), ..Default::default() },
        )
        .await
        .unwrap();

    let reinserted = store
        .insert_bare_paths(vec![("/".to_string(), "a.jpg".to_string(), None)])
        .await
        .unwrap();
    assert_eq!(reinserted, 0, "pre-existing row must be left untouched");

    let record = store.get("a.jpg".to_string()).await.unwrap().unwrap();
    assert_eq!(record.rating, Some(5));
}

#[tokio::test]
async fn add_or_update_merges_without_clobbering_other_fields() {
    let (store, _dir) = open_store().await;

    store
        .add_or_update_file_data(
            "photo.jpg".to_string(),
            FileRecord {
                mime_type: Some("image/jpeg".to_string()),
                rating: Some(3),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    store
        .add_or_update_file_data(
            "photo.jpg".to_string(),
            FileRecord { info_processed_at: Some(1_000), ..Default::default() },
        )
        .await
        .unwrap();

    let record = store.get("photo.jpg".to_string()).await.unwrap().unwrap();
    assert_eq!(record.rating, Some(3), "earlier field must survive a later partial update");
    assert_eq!(record.info_processed_at, Some(1_000));
}

#[tokio::test]
async fn clear_watermarks_resets_all_three_stages_without_touching_other_fields() {
    let (store, _dir) = open_store().await;

    store
        .add_or_update_file_data(
            "changed.jpg".to_string(),
            FileRecord {
                rating: Some(4),
                info_processed_at: Some(1),
                exif_processed_at: Some(2),
                hls_processed_at: Some(3),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    store.clear_watermarks("changed.jpg".to_string()).await.unwrap();

    let record = store.get("changed.jpg".to_string()).await.unwrap().unwrap();
    assert_eq!(record.info_processed_at, None);
    assert_eq!(record.exif_processed_at, None);
    assert_eq!(record.hls_processed_at, None);
    assert_eq!(record.rating, Some(4), "non-watermark fields must be untouched");

    assert_eq!(store.batch_missing_info(10).await.unwrap().len(), 1, "row must be revisited by enrichment");
}

#[tokio::test]
async fn move_file_preserves_watermarks_under_new_identity() {
    let (store, _dir) = open_store().await;

    store
        .add_or_update_file_data(
            "old/name.jpg".to_string(),
            FileRecord { exif_processed_at: Some(42), ..Default::default() },
        )
        .await
        .unwrap();

    store.move_file("old/name.jpg".to_string(), "new/name.jpg".to_string()).await.unwrap();

    assert!(store.get("old/name.jpg".to_string()).await.unwrap().is_none());
    let moved = store.get("new/name.jpg".to_string()).await.unwrap().expect("row moved");
    assert_eq!(moved.exif_processed_at, Some(42));
}

#[tokio::test]
async fn delete_file_removes_the_row() {
    let (store, _dir) = open_store().await;

    store.add_or_update_file_data("gone.jpg".to_string(), FileRecord::default()).await.unwrap();
    store.delete_file("gone.jpg".to_string()).await.unwrap();

    assert!(store.get("gone.jpg".to_string()).await.unwrap().is_none());
}

#[tokio::test]
async fn folders_lists_only_direct_children() {
    let (store, _dir) = open_store().await;

    store
        .insert_bare_paths(vec![
            ("/a/".to_string(), "x.jpg".to_string(), None),
            ("/a/b/".to_string(), "y.jpg".to_string(), None),
            ("/c/".to_string(), "z.jpg".to_string(), None),
        ])
        .await
        .unwrap();

    let mut root_children = store.folders("/".to_string()).await.unwrap();
    root_children.sort();
    assert_eq!(root_children, vec!["a".to_string(), "c".to_string()]);

    let a_children = store.folders("/a".to_string()).await.unwrap();
    assert_eq!(a_children, vec!["b".to_string()]);
}

#[tokio::test]
async fn query_paginates_and_counts() {
    let (store, _dir) = open_store().await;

    for i in 0..5 {
        store
            .add_or_update_file_data(format!("img{i}.jpg"), FileRecord::default())
            .await
            .unwrap();
    }

    let page1 = store.query(QueryOptions { filter: None, page: 1, page_size: 2 }).await.unwrap();
    assert_eq!(page1.items.len(), 2);
    assert_eq!(page1.total, 5);

    let total = store.count(None).await.unwrap();
    assert_eq!(total, 5);
}

#[tokio::test]
async fn batch_watermark_queries_drive_the_enrichment_stages() {
    let (store, _dir) = open_store().await;

    store
        .insert_bare_paths(vec![
            ("/".to_string(), "needs-info.jpg".to_string(), Some("image/jpeg".to_string())),
        ])
        .await
        .unwrap();
    store
        .add_or_update_file_data(
            "needs-info.jpg".to_string(),
            FileRecord { mime_type: Some("image/jpeg".to_string()), ..Default::default() },
        )
        .await
        .unwrap();

    let pending_info = store.batch_missing_info(10).await.unwrap();
    assert_eq!(pending_info.len(), 1);

    store
        .add_or_update_file_data(
            "needs-info.jpg".to_string(),
            FileRecord { info_processed_at: Some(1), ..Default::default() },
        )
        .await
        .unwrap();
    assert!(store.batch_missing_info(10).await.unwrap().is_empty());

    let pending_exif = store.batch_missing_exif(10).await.unwrap();
    assert_eq!(pending_exif.len(), 1);
}

#[tokio::test]
async fn video_exif_done_batch_excludes_rows_already_hls_processed() {
    let (store, _dir) = open_store().await;

    store
        .add_or_update_file_data(
            "clip.mp4".to_string(),
            FileRecord {
                mime_type: Some("video/mp4".to_string()),
                info_processed_at: Some(1),
                exif_processed_at: Some(1),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let pending = store.batch_video_exif_done(10).await.unwrap();
    assert_eq!(pending.len(), 1);

    store
        .add_or_update_file_data(
            "clip.mp4".to_string(),
            FileRecord { hls_processed_at: Some(99), ..Default::default() },
        )
        .await
        .unwrap();
    assert!(store.batch_video_exif_done(10).await.unwrap().is_empty());
}

#[tokio::test]
async fn pending_counts_and_recent_watermark_track_status_endpoint_fields() {
    let (store, _dir) = open_store().await;

    store
        .add_or_update_file_data(
            "v.mp4".to_string(),
            FileRecord {
                mime_type: Some("video/mp4".to_string()),
                exif_processed_at: Some(5),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    store
        .add_or_update_file_data(
            "p.jpg".to_string(),
            FileRecord { mime_type: Some("image/jpeg".to_string()), ..Default::default() },
        )
        .await
        .unwrap();

    let pending = store.pending_counts().await.unwrap();
    assert_eq!(pending.info, 2);
    assert_eq!(pending.thumbnails, 1, "only the exif-done video is awaiting HLS");

    assert_eq!(store.video_count().await.unwrap(), 1);

    store
        .add_or_update_file_data(
            "v.mp4".to_string(),
            FileRecord { hls_processed_at: Some(123), ..Default::default() },
        )
        .await
        .unwrap();

    let recent = store.most_recent_by_watermark("hls_processed_at").await.unwrap().expect("row");
    assert_eq!(recent.file_name, "v.mp4");
    assert_eq!(store.pending_counts().await.unwrap().thumbnails, 0);
}

#[tokio::test]
async fn reopening_the_same_media_root_keeps_the_index() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("index.db");
    let media_root = dir.path().join("media");

    {
        let store = IndexStore::open(db_path.clone(), media_root.clone()).await.unwrap();
        store.add_or_update_file_data("a.jpg".to_string(), FileRecord::default()).await.unwrap();
    }

    let reopened = IndexStore::open(db_path, media_root).await.unwrap();
    assert!(reopened.get("a.jpg".to_string()).await.unwrap().is_some());
}

#[tokio::test]
async fn changing_media_root_clears_the_index() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("index.db");

    {
        let store = IndexStore::open(db_path.clone(), dir.path().join("media-a")).await.unwrap();
        store.add_or_update_file_data("a.jpg".to_string(), FileRecord::default()).await.unwrap();
    }

    let repinned = IndexStore::open(db_path, dir.path().join("media-b")).await.unwrap();
    assert_eq!(repinned.row_count().await.unwrap(), 0, "repinning to a new root clears stale rows");
}
