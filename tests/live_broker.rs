use serde_json::json;

use ragchat::live::{Channel, LiveBroker};

#[test]
fn transient_publishes_are_last_write_wins_per_key() {
    let live = LiveBroker::new();
    let channel = Channel::chat("c1");

    live.publish_transient(channel.clone(), "m1", json!({"text": "He"}));
    live.publish_transient(channel.clone(), "m1", json!({"text": "Hello"}));
    live.publish_transient(channel.clone(), "m2", json!({"text": "other"}));

    let latest = live.latest_transient(&channel, "m1").unwrap();
    assert_eq!(latest.payload["text"], "Hello");
    assert!(latest.event_id.is_none());

    let other = live.latest_transient(&channel, "m2").unwrap();
    assert_eq!(other.payload["text"], "other");

    assert!(live.latest_transient(&channel, "m3").is_none());
    assert!(live
        .latest_transient(&Channel::chat("c2"), "m1")
        .is_none());
}

#[test]
fn final_event_ids_are_monotonic_per_channel() {
    let live = LiveBroker::new();
    let c1 = Channel::chat("c1");
    let c2 = Channel::nav("alice");

    assert_eq!(live.publish_final(c1.clone(), "a", json!(1)), 1);
    assert_eq!(live.publish_final(c1.clone(), "b", json!(2)), 2);
    assert_eq!(live.publish_final(c2.clone(), "a", json!(3)), 1);
    assert_eq!(live.publish_final(c1.clone(), "c", json!(4)), 3);

    assert_eq!(live.last_event_id(&c1), 3);
    assert_eq!(live.last_event_id(&c2), 1);
    assert_eq!(live.last_event_id(&Channel::chat("quiet")), 0);
}

#[test]
fn catch_up_returns_only_events_after_the_cursor() {
    let live = LiveBroker::new();
    let channel = Channel::chat("c1");
    for n in 1..=4 {
        live.publish_final(channel.clone(), "k", json!(n));
    }

    let tail = live.catch_up(&channel, 2);
    assert_eq!(tail.len(), 2);
    assert_eq!(tail[0].event_id, Some(3));
    assert_eq!(tail[1].event_id, Some(4));

    assert_eq!(live.catch_up(&channel, 0).len(), 4);
    assert!(live.catch_up(&channel, 4).is_empty());
    assert!(live.catch_up(&Channel::chat("quiet"), 0).is_empty());
}

#[test]
fn transients_never_enter_durable_history() {
    let live = LiveBroker::new();
    let channel = Channel::chat("c1");

    live.publish_transient(channel.clone(), "m1", json!({"text": "burst"}));
    assert_eq!(live.last_event_id(&channel), 0);
    assert!(live.catch_up(&channel, 0).is_empty());
}

#[test]
fn chat_and_nav_channels_with_the_same_topic_are_distinct() {
    let live = LiveBroker::new();
    live.publish_final(Channel::chat("x"), "k", json!(1));
    assert_eq!(live.last_event_id(&Channel::chat("x")), 1);
    assert_eq!(live.last_event_id(&Channel::nav("x")), 0);
}
