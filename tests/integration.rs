//! Integration tests for the message relay.

use courier::{
    ChannelSource, ClauseSpec, MemorySink, Messenger, MessengerConfig, NewMessage, Notice,
    StaticPreferences, SubscriptionManager, Timestamp,
};
use serde_json::json;
use std::collections::HashSet;
use std::sync::Arc;

fn clause(pairs: &[(&str, serde_json::Value)]) -> ClauseSpec {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

struct Relay {
    messenger: Arc<Messenger>,
    injector: courier::NoticeInjector,
    sink: Arc<MemorySink>,
}

fn relay_with_starred(starred: &[&str]) -> Relay {
    let source = Arc::new(ChannelSource::new());
    let injector = source.injector();
    let sink = Arc::new(MemorySink::new());
    let messenger = Messenger::new(
        MessengerConfig::new("me"),
        Arc::new(SubscriptionManager::ephemeral("me")),
        source,
        Arc::clone(&sink) as Arc<dyn courier::NoticeSink>,
        Arc::new(StaticPreferences {
            signature: "Me".into(),
            starred: starred.iter().map(|s| s.to_string()).collect(),
        }),
    )
    .unwrap();
    Relay {
        messenger: Arc::new(messenger),
        injector,
        sink,
    }
}

fn relay() -> Relay {
    relay_with_starred(&[])
}

/// Store a message with an explicit timestamp, bypassing the transport.
fn seed(
    messenger: &Messenger,
    sender: &str,
    class: &str,
    instance: &str,
    body: &str,
    at: i64,
) -> courier::MessageId {
    messenger
        .store()
        .insert(&NewMessage {
            sender: sender.into(),
            authenticated: true,
            body: body.into(),
            class: class.into(),
            instance: instance.into(),
            timestamp: Some(Timestamp(at)),
            ..Default::default()
        })
        .unwrap()
}

// --- End-To-End Receiver Workflow ---

#[test]
fn test_receive_filter_mark_delete_workflow() {
    let relay = relay();
    relay.messenger.start().unwrap();

    for (sender, body) in [("alice", "first"), ("bob", "second"), ("alice", "third")] {
        relay.injector.push(Notice {
            sender: sender.into(),
            authenticated: true,
            opcode: String::new(),
            class: "help".into(),
            instance: "linux".into(),
            recipient: String::new(),
            time: None,
            fields: vec![body.into()],
        });
    }
    relay.messenger.stop();

    let from_alice = relay
        .messenger
        .filter_messages(&[clause(&[("sender", json!("alice"))])])
        .unwrap();
    let page = relay.messenger.get(from_alice, 0, -1).unwrap();
    assert_eq!(page.messages.len(), 2);
    assert!(page.messages.iter().all(|m| m.sender == "alice"));

    let marked = relay.messenger.mark_filter("read", from_alice, 0, -1).unwrap();
    assert_eq!(marked, 2);

    let deleted = relay.messenger.delete_filter(from_alice, 0, -1).unwrap();
    assert_eq!(deleted, 2);
    assert_eq!(relay.messenger.get_count(None).unwrap(), 1);
}

// --- Round-Trip ---

#[test]
fn test_stored_message_roundtrips_through_matching_filter() {
    let relay = relay();
    let mut notice = Notice {
        sender: "alice".into(),
        authenticated: false,
        opcode: String::new(),
        class: "help".into(),
        instance: "linux".into(),
        recipient: "me".into(),
        time: Some(Timestamp(42_000_000)),
        fields: vec!["Alice L".into(), "which kernel?".into()],
    };
    relay.messenger.store_incoming(notice.clone()).unwrap();
    // A second, non-matching message.
    notice.class = "offtopic".into();
    notice.recipient = String::new();
    relay.messenger.store_incoming(notice).unwrap();

    let fid = relay
        .messenger
        .filter_messages(&[clause(&[
            ("cls", json!("help")),
            ("instance", json!("linux")),
            ("sender", json!("alice")),
            ("user", json!("me")),
            ("read", json!(false)),
            ("message", json!("kernel")),
        ])])
        .unwrap();

    let page = relay.messenger.get(fid, 0, -1).unwrap();
    assert_eq!(page.messages.len(), 1);
    let message = &page.messages[0];
    assert_eq!(message.sender, "alice");
    assert!(!message.authenticated);
    assert_eq!(message.signature, "Alice L");
    assert_eq!(message.body, "which kernel?");
    assert_eq!(message.class, "help");
    assert_eq!(message.instance, "linux");
    assert_eq!(message.recipient.as_deref(), Some("me"));
    assert_eq!(message.timestamp, Timestamp(42_000_000));
    assert!(!message.read);
}

// --- Pagination & Ordering ---

#[test]
fn test_results_order_by_timestamp_not_id() {
    let relay = relay();
    // Backfilled: later insert carries an earlier origin time.
    let newer = seed(&relay.messenger, "alice", "help", "linux", "newer", 2_000);
    let older = seed(&relay.messenger, "bob", "help", "linux", "older", 1_000);

    let fid = relay.messenger.filter_messages(&[]).unwrap();
    let ids = relay.messenger.get_ids(fid, 0, -1).unwrap();
    assert_eq!(ids, vec![older, newer]);
}

#[test]
fn test_pagination_and_negative_perpage() {
    let relay = relay();
    for i in 0..5 {
        seed(&relay.messenger, "alice", "help", "linux", "m", 1_000 + i);
    }
    let fid = relay.messenger.filter_messages(&[]).unwrap();

    assert_eq!(relay.messenger.get(fid, 0, 2).unwrap().messages.len(), 2);
    assert_eq!(relay.messenger.get(fid, 4, 2).unwrap().messages.len(), 1);
    // Negative perpage means all remaining.
    assert_eq!(relay.messenger.get(fid, 1, -1).unwrap().messages.len(), 4);
}

#[test]
fn test_paged_mark_touches_only_the_page() {
    let relay = relay();
    let first = seed(&relay.messenger, "a", "help", "linux", "t0", 1_000);
    let middle = seed(&relay.messenger, "b", "help", "linux", "t1", 2_000);
    let last = seed(&relay.messenger, "c", "help", "linux", "t2", 3_000);

    let fid = relay.messenger.filter_messages(&[]).unwrap();
    let marked = relay.messenger.mark_filter("read", fid, 1, 1).unwrap();
    assert_eq!(marked, 1);

    let page = relay.messenger.get(fid, 0, -1).unwrap();
    let by_id = |id| page.messages.iter().find(|m| m.id == id).unwrap();
    assert!(!by_id(first).read);
    assert!(by_id(middle).read);
    assert!(!by_id(last).read);
}

#[test]
fn test_paged_delete_resolves_ids_first() {
    let relay = relay();
    let first = seed(&relay.messenger, "a", "help", "linux", "t0", 1_000);
    let _middle = seed(&relay.messenger, "b", "help", "linux", "t1", 2_000);
    let last = seed(&relay.messenger, "c", "help", "linux", "t2", 3_000);

    let fid = relay.messenger.filter_messages(&[]).unwrap();
    assert_eq!(relay.messenger.delete_filter(fid, 1, 1).unwrap(), 1);

    let remaining = relay.messenger.get_ids(fid, 0, -1).unwrap();
    assert_eq!(remaining, vec![first, last]);
}

// --- Oldest Unread Offset ---

#[test]
fn test_oldest_unread_offset_scenario() {
    let relay = relay();
    let t0 = seed(&relay.messenger, "a", "help", "linux", "t0", 1_000);
    let _t1 = seed(&relay.messenger, "b", "help", "linux", "t1", 2_000);
    let t2 = seed(&relay.messenger, "c", "help", "linux", "t2", 3_000);

    let fid = relay.messenger.filter_messages(&[]).unwrap();

    // Only t1 unread: one message is ordered before it.
    relay.messenger.mark("read", &[t0, t2]).unwrap();
    assert_eq!(
        relay.messenger.get_oldest_unread_offset(fid).unwrap(),
        (1, 3)
    );

    // Nothing unread.
    relay.messenger.mark_filter("read", fid, 0, -1).unwrap();
    assert_eq!(
        relay.messenger.get_oldest_unread_offset(fid).unwrap(),
        (-1, 3)
    );
}

#[test]
fn test_oldest_unread_offset_respects_filter() {
    let relay = relay();
    seed(&relay.messenger, "a", "offtopic", "x", "noise", 500);
    let t0 = seed(&relay.messenger, "a", "help", "linux", "t0", 1_000);
    let _t1 = seed(&relay.messenger, "b", "help", "linux", "t1", 2_000);

    let fid = relay
        .messenger
        .filter_messages(&[clause(&[("cls", json!("help"))])])
        .unwrap();
    relay.messenger.mark("read", &[t0]).unwrap();

    // The offtopic message doesn't shift the offset.
    assert_eq!(
        relay.messenger.get_oldest_unread_offset(fid).unwrap(),
        (1, 2)
    );
}

// --- Aggregate Views ---

#[test]
fn test_class_aggregation_with_starred() {
    let relay = relay_with_starred(&["offtopic"]);
    seed(&relay.messenger, "a", "help", "linux", "m1", 1_000);
    seed(&relay.messenger, "b", "help", "linux", "m2", 2_000);
    seed(&relay.messenger, "c", "help", "other", "m3", 3_000);
    seed(&relay.messenger, "d", "offtopic", "x", "m4", 2_500);

    let classes = relay.messenger.get_classes(0, -1).unwrap();
    assert_eq!(classes.len(), 2);

    // Starred groups sort first even though help has the latest activity.
    assert_eq!(classes[0].class, "offtopic");
    assert!(classes[0].starred);
    assert_eq!(classes[0].total, 1);
    assert_eq!(classes[0].unread, 1);

    assert_eq!(classes[1].class, "help");
    assert!(!classes[1].starred);
    assert_eq!(classes[1].total, 3);
    assert_eq!(classes[1].unread, 3);
}

#[test]
fn test_unread_classes_drop_fully_read_groups() {
    let relay = relay();
    let read_one = seed(&relay.messenger, "a", "help", "linux", "m1", 1_000);
    seed(&relay.messenger, "b", "offtopic", "x", "m2", 2_000);
    relay.messenger.mark("read", &[read_one]).unwrap();

    let classes = relay.messenger.get_unread_classes(0, -1).unwrap();
    assert_eq!(classes.len(), 1);
    assert_eq!(classes[0].class, "offtopic");
}

#[test]
fn test_instance_aggregation_orders_by_activity() {
    let relay = relay();
    seed(&relay.messenger, "a", "help", "linux", "m1", 1_000);
    seed(&relay.messenger, "b", "help", "bsd", "m2", 2_000);
    let read_one = seed(&relay.messenger, "c", "help", "linux", "m3", 3_000);
    relay.messenger.mark("read", &[read_one]).unwrap();

    let instances = relay.messenger.get_instances("help", 0, -1).unwrap();
    assert_eq!(instances.len(), 2);
    // linux has the most recent activity.
    assert_eq!(instances[0].instance, "linux");
    assert_eq!(instances[0].total, 2);
    assert_eq!(instances[0].unread, 1);
    assert_eq!(instances[1].instance, "bsd");

    let unread = relay.messenger.get_unread_instances("help", 0, -1).unwrap();
    assert_eq!(unread.len(), 2);
    assert_eq!(unread.iter().find(|i| i.instance == "linux").unwrap().total, 1);
}

#[test]
fn test_personals_group_by_sender() {
    let relay = relay();
    relay
        .messenger
        .store()
        .insert(&NewMessage {
            sender: "alice".into(),
            body: "hi".into(),
            recipient: Some("me".into()),
            timestamp: Some(Timestamp(1_000)),
            ..Default::default()
        })
        .unwrap();
    relay
        .messenger
        .store()
        .insert(&NewMessage {
            sender: "alice".into(),
            body: "again".into(),
            recipient: Some("me".into()),
            timestamp: Some(Timestamp(2_000)),
            ..Default::default()
        })
        .unwrap();
    // Broadcast: not a personal.
    seed(&relay.messenger, "bob", "help", "linux", "m", 3_000);

    let personals = relay.messenger.get_personals(0, -1).unwrap();
    assert_eq!(personals.len(), 1);
    assert_eq!(personals[0].sender, "alice");
    assert_eq!(personals[0].total, 2);
    assert_eq!(personals[0].unread, 2);
}

// --- hasNew ---

#[test]
fn test_has_new_with_and_without_filter() {
    let relay = relay();
    let first = seed(&relay.messenger, "alice", "help", "linux", "m1", 1_000);
    assert!(!relay.messenger.has_new(first, None).unwrap());

    seed(&relay.messenger, "bob", "offtopic", "x", "m2", 2_000);
    assert!(relay.messenger.has_new(first, None).unwrap());

    let help_only = relay
        .messenger
        .filter_messages(&[clause(&[("cls", json!("help"))])])
        .unwrap();
    assert!(!relay.messenger.has_new(first, Some(help_only)).unwrap());
}

// --- Sending ---

#[test]
fn test_send_prefixes_signature_and_stores_personals() {
    let relay = relay();
    assert!(relay.messenger.send("see you there", "help", "linux", None));
    assert!(relay.messenger.send("lunch?", "", "", Some("bob")));

    let sent = relay.sink.sent();
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[0].fields[0], "Me");
    assert_eq!(sent[1].recipient, "bob");

    // Only the personal went into local history.
    assert_eq!(relay.messenger.get_count(None).unwrap(), 1);
    let personals = relay.messenger.get_personals(0, -1).unwrap();
    assert_eq!(personals[0].sender, "me");
    assert_eq!(personals[0].unread, 0);
}

// --- Subscriptions End-To-End ---

#[test]
fn test_subscription_surface() {
    let relay = relay();
    let subs = relay.messenger.subscriptions();

    subs.add(courier::Triplet::new("help", "*", "*")).unwrap();
    assert!(subs.match_triplet(Some("help"), Some("linux"), Some("anyone")));
    assert!(subs.is_subscribed(&courier::Triplet::new("help", "*", "*")));

    let listed: HashSet<_> = subs.get().into_iter().collect();
    assert!(listed.contains(&courier::Triplet::new("help", "*", "*")));
}
