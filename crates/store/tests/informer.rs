#![forbid(unsafe_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use kube::api::ObjectMeta;
use kube::core::DynamicObject;
use kube::runtime::watcher::Event;
use recon_core::{deletion_key_for, key_for, DeletedObject, EventHandler};
use recon_store::{run_informer, wait_for_cache_sync, Informer, Lister};
use tokio::sync::watch;

fn obj(ns: &str, name: &str, rv: &str) -> DynamicObject {
    DynamicObject {
        types: None,
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(ns.to_string()),
            resource_version: Some(rv.to_string()),
            ..Default::default()
        },
        data: serde_json::json!({ "spec": { "cronSpec": "* * * * */5" } }),
    }
}

fn nameless() -> DynamicObject {
    DynamicObject { types: None, metadata: ObjectMeta::default(), data: serde_json::json!({}) }
}

fn rv(o: &DynamicObject) -> String { o.metadata.resource_version.clone().unwrap_or_default() }

#[derive(Default)]
struct Recorder {
    seen: Mutex<Vec<String>>,
}

impl Recorder {
    fn take(&self) -> Vec<String> { std::mem::take(&mut *self.seen.lock().unwrap()) }
}

impl EventHandler<DynamicObject> for Recorder {
    fn on_add(&self, obj: Arc<DynamicObject>) {
        self.seen.lock().unwrap().push(format!("add {}", key_for(&*obj).unwrap()));
    }

    fn on_update(&self, old: Arc<DynamicObject>, new: Arc<DynamicObject>) {
        self.seen.lock().unwrap().push(format!("update {} {}->{}", key_for(&*new).unwrap(), rv(&old), rv(&new)));
    }

    fn on_delete(&self, obj: DeletedObject<DynamicObject>) {
        let tag = if matches!(obj, DeletedObject::Tombstone(_)) { "tombstone" } else { "live" };
        self.seen.lock().unwrap().push(format!("delete {} {}", deletion_key_for(&obj).unwrap(), tag));
    }
}

fn informer_with_recorder() -> (Informer, Arc<Recorder>) {
    let informer = Informer::new();
    let rec = Arc::new(Recorder::default());
    informer.add_event_handler(rec.clone());
    (informer, rec)
}

#[test]
fn first_list_adds_everything_and_marks_synced() {
    let (informer, rec) = informer_with_recorder();
    assert!(!informer.has_synced());

    informer.apply(Event::Restarted(vec![obj("ns", "a", "1"), obj("ns", "b", "1")]));

    assert!(informer.has_synced());
    assert_eq!(rec.take(), vec!["add ns/a", "add ns/b"]);
    assert_eq!(informer.mirror().len(), 2);
}

#[test]
fn applied_and_deleted_events_update_the_mirror() {
    let (informer, rec) = informer_with_recorder();
    informer.apply(Event::Applied(obj("ns", "a", "1")));
    informer.apply(Event::Applied(obj("ns", "a", "2")));
    informer.apply(Event::Deleted(obj("ns", "a", "3")));

    assert_eq!(rec.take(), vec!["add ns/a", "update ns/a 1->2", "delete ns/a live"]);
    assert!(informer.mirror().is_empty());
}

#[test]
fn relist_diffs_against_the_mirror_and_tombstones_vanished_objects() {
    let (informer, rec) = informer_with_recorder();
    informer.apply(Event::Restarted(vec![obj("ns", "a", "1"), obj("ns", "gone", "1")]));
    rec.take();

    informer.apply(Event::Restarted(vec![obj("ns", "a", "2"), obj("ns", "c", "1")]));

    assert_eq!(rec.take(), vec!["update ns/a 1->2", "add ns/c", "delete ns/gone tombstone"]);
    let keys: Vec<String> = informer.mirror().keys().iter().map(|k| k.to_string()).collect();
    assert_eq!(keys, vec!["ns/a", "ns/c"]);
}

#[test]
fn objects_without_identity_are_dropped() {
    let (informer, rec) = informer_with_recorder();
    informer.apply(Event::Applied(nameless()));
    informer.apply(Event::Restarted(vec![nameless(), obj("ns", "ok", "1")]));
    assert_eq!(rec.take(), vec!["add ns/ok"]);
    assert_eq!(informer.mirror().len(), 1);
}

#[test]
fn resync_replays_objects_as_unchanged_updates() {
    let (informer, rec) = informer_with_recorder();
    informer.apply(Event::Restarted(vec![obj("ns", "a", "5")]));
    rec.take();
    informer.resync();
    assert_eq!(rec.take(), vec!["update ns/a 5->5"]);
}

#[test]
fn late_handler_receives_existing_objects_as_adds() {
    let informer = Informer::new();
    informer.apply(Event::Restarted(vec![obj("ns", "b", "1"), obj("ns", "a", "1")]));
    let rec = Arc::new(Recorder::default());
    informer.add_event_handler(rec.clone());
    assert_eq!(rec.take(), vec!["add ns/a", "add ns/b"]);
}

#[test]
fn lister_reads_from_the_mirror() {
    let informer = Informer::new();
    informer.apply(Event::Applied(obj("ns", "foo", "1")));
    let mirror = informer.mirror();
    let found = Lister::get(&mirror, Some("ns"), "foo").unwrap();
    assert_eq!(found.and_then(|o| o.metadata.name.clone()).as_deref(), Some("foo"));
    assert!(Lister::get(&mirror, Some("ns"), "missing").unwrap().is_none());
    assert!(Lister::get(&mirror, Some("other"), "foo").unwrap().is_none());
}

#[tokio::test]
async fn run_informer_skips_stream_errors_and_stops_at_end() {
    let informer = Arc::new(Informer::new());
    let rec = Arc::new(Recorder::default());
    informer.add_event_handler(rec.clone());
    let events: Vec<Result<Event<DynamicObject>, String>> = vec![
        Ok(Event::Restarted(vec![obj("ns", "a", "1")])),
        Err("connection reset".to_string()),
        Ok(Event::Applied(obj("ns", "b", "1"))),
    ];
    let (_stop_tx, stop_rx) = watch::channel(false);

    run_informer(futures::stream::iter(events), Arc::clone(&informer), None, stop_rx).await;

    assert!(informer.has_synced());
    assert_eq!(rec.take(), vec!["add ns/a", "add ns/b"]);
}

#[tokio::test(start_paused = true)]
async fn run_informer_resyncs_periodically_until_stopped() {
    let informer = Arc::new(Informer::new());
    informer.apply(Event::Restarted(vec![obj("ns", "a", "1")]));
    let rec = Arc::new(Recorder::default());
    informer.add_event_handler(rec.clone());
    rec.take();

    let (stop_tx, stop_rx) = watch::channel(false);
    let stream = futures::stream::pending::<Result<Event<DynamicObject>, String>>();
    let task = tokio::spawn(run_informer(stream, Arc::clone(&informer), Some(Duration::from_secs(30)), stop_rx));

    tokio::time::sleep(Duration::from_secs(61)).await;
    stop_tx.send(true).unwrap();
    task.await.unwrap();

    assert_eq!(rec.take(), vec!["update ns/a 1->1", "update ns/a 1->1"]);
}

#[tokio::test(start_paused = true)]
async fn cache_sync_wait_is_bounded() {
    let informer = Informer::new();
    assert!(!wait_for_cache_sync(informer.subscribe_synced(), Duration::from_secs(5)).await);

    let waiter = tokio::spawn(wait_for_cache_sync(informer.subscribe_synced(), Duration::from_secs(5)));
    tokio::task::yield_now().await;
    informer.apply(Event::Restarted(Vec::new()));
    assert!(waiter.await.unwrap());
}
