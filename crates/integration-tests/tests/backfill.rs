//! Backfill linking against a recorded store.

use std::sync::Arc;

use comanda_core::{Email, UserId};
use comanda_integration_tests::{ManualStore, OrderDoc};
use comanda_sync::{BackfillLinker, LinkGuard, SessionMarkers};

#[tokio::test]
async fn test_patch_sets_only_owner_key_and_timestamp() {
    let store = Arc::new(ManualStore::new());
    store.set_read(
        "orders",
        "userEmail",
        "ana@example.com",
        vec![
            OrderDoc::new("guest", 10).email("ana@example.com").doc(),
            OrderDoc::new("stale-owner", 20)
                .email("ana@example.com")
                .user_id("uid-old")
                .doc(),
            OrderDoc::new("linked", 30)
                .email("ana@example.com")
                .user_id("uid-ana")
                .doc(),
        ],
    );
    let markers = Arc::new(SessionMarkers::new());
    let linker = BackfillLinker::new(store.clone(), markers.clone(), "orders");
    let user = UserId::new("uid-ana");
    let email = Email::parse("ana@example.com").expect("valid email");

    let patched = linker.link_once(&user, &email).await.expect("backfill runs");
    assert_eq!(patched, 2);
    assert!(markers.has_linked(&user));

    let writes = store.writes();
    let ids: Vec<&str> = writes.iter().map(|w| w.id.as_str()).collect();
    assert_eq!(ids, vec!["guest", "stale-owner"]);
    for write in &writes {
        assert!(!write.whole, "backfill must patch, not replace");
        let mut keys: Vec<&str> = write.fields.keys().map(String::as_str).collect();
        keys.sort_unstable();
        assert_eq!(keys, vec!["updatedAt", "userId"]);
        assert_eq!(write.fields["userId"], "uid-ana");
    }

    // The guard short-circuits before any read.
    assert_eq!(linker.link_once(&user, &email).await.expect("no-op"), 0);
    assert_eq!(store.writes().len(), 2);
}
