use std::sync::Arc;

use memoizer_service::caching::MemoizingCache;

use crate::{Asset, AssetResolver, Unavailable};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_clones_share_entries() {
    memoizer_test::setup();
    let cache = MemoizingCache::new("assets", AssetResolver::default());

    let tasks: Vec<_> = (0..32)
        .map(|i| {
            let cache = cache.clone();
            let name = if i % 2 == 0 { "intro.mp4" } else { "outro.mp4" };
            tokio::spawn(async move { cache.get_or_add(name.to_owned()).await })
        })
        .collect();

    cache.factory().gate.open();
    let assets = futures::future::join_all(tasks).await;

    for asset in assets {
        let asset = asset.unwrap().unwrap();
        assert!(asset.name == "intro.mp4" || asset.name == "outro.mp4");
    }
    assert_eq!(cache.factory().resolutions.get(), 2);
    assert_eq!(cache.len(), 2);
}

#[tokio::test]
async fn test_values_are_shared_not_recomputed() {
    let cache = MemoizingCache::new("assets", AssetResolver::open());

    let first = cache.get_or_add("intro.mp4".into()).await.unwrap();
    let second = cache.get_or_add("intro.mp4".into()).await.unwrap();

    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(
        *first,
        Asset {
            name: "intro.mp4".into(),
            revision: 1
        }
    );
}

#[tokio::test]
async fn test_unavailable_asset_is_retried() {
    memoizer_test::setup();
    let cache = MemoizingCache::new("assets", AssetResolver::open());
    cache.factory().set_unavailable("intro.mp4", true);

    let err = cache.get_or_add("intro.mp4".into()).await.unwrap_err();
    assert_eq!(err, Unavailable("intro.mp4".into()));

    // Still unavailable: every access tries again.
    assert!(cache.get_or_add("intro.mp4".into()).await.is_err());
    assert_eq!(cache.factory().resolutions.get(), 2);

    cache.factory().set_unavailable("intro.mp4", false);
    let asset = cache.get_or_add("intro.mp4".into()).await.unwrap();
    assert_eq!(asset.revision, 3);

    // Once resolved, the asset stays cached even if it becomes unavailable again.
    cache.factory().set_unavailable("intro.mp4", true);
    let asset = cache.get_or_add("intro.mp4".into()).await.unwrap();
    assert_eq!(asset.revision, 3);
    assert_eq!(cache.factory().resolutions.get(), 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_batch_with_unavailable_asset() {
    memoizer_test::setup();
    let cache = MemoizingCache::new("assets", AssetResolver::open());
    cache.factory().set_unavailable("b.mp4", true);

    let keys = ["a.mp4", "b.mp4", "c.mp4"].map(String::from);
    let err = cache.get_or_add_all(keys.clone()).unwrap().await.unwrap_err();
    assert_eq!(err, Unavailable("b.mp4".into()));

    cache.factory().set_unavailable("b.mp4", false);
    let assets = cache.get_or_add_all(keys).unwrap().await.unwrap();
    let names: Vec<_> = assets.iter().map(|asset| asset.name.as_str()).collect();
    assert_eq!(names, ["a.mp4", "b.mp4", "c.mp4"]);

    // Only the failed asset has been resolved a second time.
    assert_eq!(cache.factory().resolutions.get(), 4);
}
