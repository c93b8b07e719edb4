/// End-to-end messaging scenarios through the sync engine
extern crate huddle_core;

use chrono::{Duration as ChronoDuration, Utc};
use huddle_core::config::Config;
use huddle_core::error::{ErrorClass, MessagingError};
use huddle_core::messaging_types::{
    Caller, ConversationKind, MessageType, NewConversation, NewMessage, UserId, DELETED_PLACEHOLDER,
};
use huddle_core::poller::{PollOutcome, PollSchedule, PollTarget};
use huddle_core::storage::Storage;
use huddle_core::sync_engine::{SyncEngine, SyncSettings};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tempfile::TempDir;

fn engine() -> (TempDir, SyncEngine) {
    let dir = TempDir::new().unwrap();
    let storage = Storage::open(dir.path()).unwrap();
    (dir, SyncEngine::new(storage, SyncSettings::default()))
}

fn group(title: &str, ids: &[u64]) -> NewConversation {
    NewConversation {
        kind: ConversationKind::Group,
        participant_ids: ids.iter().map(|i| UserId(*i)).collect(),
        title: Some(title.to_string()),
        description: None,
        guest_id: None,
    }
}

fn direct(other: u64) -> NewConversation {
    NewConversation {
        kind: ConversationKind::Direct,
        participant_ids: vec![UserId(other)],
        title: None,
        description: None,
        guest_id: None,
    }
}

#[test]
fn test_shift_handover_reply_survives_delete() {
    let (_dir, engine) = engine();
    let (a, b, c) = (Caller::agent(1), Caller::agent(2), Caller::agent(3));

    let conv = engine
        .create_conversation(&a, group("Shift Handover", &[1, 2, 3]))
        .unwrap()
        .conversation;
    let towels = engine
        .send_message(&a, conv.id, NewMessage::text("Room 204 needs towels"))
        .unwrap();
    assert_eq!(towels.message.sequence, 1);
    let on_it = engine
        .send_message(&b, conv.id, NewMessage::reply("On it", towels.message.id))
        .unwrap();
    assert_eq!(on_it.message.sequence, 2);
    assert_eq!(on_it.reply_to.as_ref().unwrap().content, "Room 204 needs towels");

    engine.delete_message(&a, towels.message.id).unwrap();

    let page = engine.list_messages(&c, conv.id, None, None).unwrap();
    assert_eq!(page.messages.len(), 2);
    let first = &page.messages[0];
    assert_eq!(first.message.sequence, 1);
    assert!(first.message.is_deleted());
    assert!(first.message.content.is_empty());

    let second = &page.messages[1];
    assert_eq!(second.message.sequence, 2);
    let preview = second.reply_to.as_ref().expect("reply preview");
    assert!(preview.is_deleted);
    assert_eq!(preview.content, DELETED_PLACEHOLDER);
    assert_eq!(page.next_since, 2);
}

#[test]
fn test_like_reaction_toggles() {
    let (_dir, engine) = engine();
    let (a, b) = (Caller::agent(1), Caller::agent(2));
    let conv = engine.create_conversation(&a, group("Front desk", &[2])).unwrap().conversation;
    engine.send_message(&a, conv.id, NewMessage::text("Check-in rush at 3")).unwrap();
    let target = engine.send_message(&b, conv.id, NewMessage::text("Adding a second desk")).unwrap();
    assert_eq!(target.message.sequence, 2);

    engine.react(&a, target.message.id, "like").unwrap();
    let view = engine.react(&b, target.message.id, "like").unwrap();
    assert_eq!(view.reactions.len(), 1);
    assert_eq!(view.reactions[0].reaction_type, "like");
    assert_eq!(view.reactions[0].count, 2);
    assert_eq!(view.reactions[0].users, vec![UserId(1), UserId(2)]);

    let view = engine.react(&b, target.message.id, "like").unwrap();
    assert_eq!(view.reactions[0].count, 1);
    assert_eq!(view.reactions[0].users, vec![UserId(1)]);
}

#[test]
fn test_deleted_message_rejects_edit_and_react() {
    let (_dir, engine) = engine();
    let a = Caller::agent(1);
    let conv = engine.create_conversation(&a, group("Valet", &[2])).unwrap().conversation;
    let m = engine.send_message(&a, conv.id, NewMessage::text("Car 12 ready")).unwrap();
    engine.delete_message(&a, m.message.id).unwrap();

    let err = engine.edit_message(&a, m.message.id, "Car 14 ready").unwrap_err();
    assert!(matches!(err, MessagingError::MessageDeleted(_)));
    assert_eq!(err.class(), ErrorClass::Permanent);
    let err = engine.react(&Caller::agent(2), m.message.id, "like").unwrap_err();
    assert!(matches!(err, MessagingError::MessageDeleted(_)));

    // second delete is a no-op
    let again = engine.delete_message(&a, m.message.id).unwrap();
    assert!(again.message.is_deleted());
}

#[test]
fn test_purged_reply_target_keeps_placeholder() {
    let (_dir, engine) = engine();
    let a = Caller::agent(1);
    let conv = engine.create_conversation(&a, group("Maintenance", &[2])).unwrap().conversation;
    let leak = engine.send_message(&a, conv.id, NewMessage::text("Leak in 310")).unwrap();
    let reply = engine
        .send_message(&Caller::agent(2), conv.id, NewMessage::reply("Plumber called", leak.message.id))
        .unwrap();
    engine.delete_message(&a, leak.message.id).unwrap();

    // nothing is old enough yet
    assert_eq!(engine.purge_expired_tombstones(Utc::now()).unwrap(), 0);
    let later = Utc::now() + ChronoDuration::days(31);
    assert_eq!(engine.purge_expired_tombstones(later).unwrap(), 1);

    let page = engine.list_messages(&a, conv.id, None, None).unwrap();
    assert_eq!(page.messages.len(), 1);
    assert_eq!(page.messages[0].message.id, reply.message.id);
    let preview = page.messages[0].reply_to.as_ref().unwrap();
    assert_eq!(preview.content, DELETED_PLACEHOLDER);
    assert_eq!(preview.sequence, None);
}

#[test]
fn test_concurrent_appends_are_gap_free() {
    let (_dir, engine) = engine();
    let writers: Vec<u64> = (1..=4).collect();
    let conv = engine
        .create_conversation(&Caller::agent(1), group("Night audit", &writers))
        .unwrap()
        .conversation;

    let engine = Arc::new(engine);
    let handles: Vec<_> = writers
        .iter()
        .map(|w| {
            let engine = engine.clone();
            let caller = Caller::agent(*w);
            thread::spawn(move || {
                for i in 0..25 {
                    engine
                        .send_message(&caller, conv.id, NewMessage::text(format!("{}-{}", caller.user_id, i)))
                        .unwrap();
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    let page = engine.list_messages(&Caller::agent(1), conv.id, Some(0), Some(200)).unwrap();
    let sequences: Vec<u64> = page.messages.iter().map(|v| v.message.sequence).collect();
    assert_eq!(sequences, (1..=100).collect::<Vec<_>>());
}

#[test]
fn test_concurrent_reactions_lose_no_updates() {
    let (_dir, engine) = engine();
    let staff: Vec<u64> = (1..=8).collect();
    let conv = engine
        .create_conversation(&Caller::agent(1), group("All hands", &staff))
        .unwrap()
        .conversation;
    let m = engine
        .send_message(&Caller::agent(1), conv.id, NewMessage::text("Fire drill at noon"))
        .unwrap();

    let engine = Arc::new(engine);
    let handles: Vec<_> = staff
        .iter()
        .map(|u| {
            let engine = engine.clone();
            let caller = Caller::agent(*u);
            let id = m.message.id;
            thread::spawn(move || engine.react(&caller, id, "acknowledge").unwrap())
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    let view = engine.react(&Caller::agent(1), m.message.id, "like").unwrap();
    let ack = view
        .reactions
        .iter()
        .find(|r| r.reaction_type == "acknowledge")
        .unwrap();
    assert_eq!(ack.count, 8);
    assert_eq!(ack.users, staff.iter().map(|u| UserId(*u)).collect::<Vec<_>>());
}

#[test]
fn test_concurrent_direct_creation_yields_one_conversation() {
    let (_dir, engine) = engine();
    let engine = Arc::new(engine);
    let handles: Vec<_> = (0..6)
        .map(|i| {
            let engine = engine.clone();
            thread::spawn(move || {
                // alternate which side initiates
                let (me, other) = if i % 2 == 0 { (10, 20) } else { (20, 10) };
                engine
                    .create_conversation(&Caller::agent(me), direct(other))
                    .unwrap()
                    .conversation
                    .id
            })
        })
        .collect();
    let ids: BTreeSet<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    assert_eq!(ids.len(), 1);
}

#[test]
fn test_file_message_and_priority_flag() {
    let (_dir, engine) = engine();
    let a = Caller::agent(1);
    let conv = engine.create_conversation(&a, group("Events", &[2])).unwrap().conversation;
    let msg: NewMessage = serde_json::from_value(serde_json::json!({
        "message_type": "file",
        "attachment": { "url": "https://files.example/floorplan.pdf", "name": "floorplan.pdf", "size": 48213 },
        "is_priority": true
    }))
    .unwrap();
    let view = engine.send_message(&a, conv.id, msg).unwrap();
    assert_eq!(view.message.message_type, MessageType::File);
    assert!(view.message.is_priority);
    assert_eq!(view.message.attachment.as_ref().unwrap().name, "floorplan.pdf");
}

#[test]
fn test_polling_client_converges() {
    let (_dir, engine) = engine();
    let (a, b) = (Caller::agent(1), Caller::agent(2));
    let conv = engine.create_conversation(&a, group("Concierge", &[2])).unwrap().conversation;

    let t0 = Instant::now();
    let mut schedule = PollSchedule::from_config(&Config::default(), t0).without_jitter();
    schedule.open_conversation(conv.id, t0);

    let mut list_cursor: Option<String> = None;
    let mut message_cursor: Option<String> = None;
    let mut seen = BTreeSet::new();
    let mut now = t0;

    for step in 0..6 {
        engine
            .send_message(&a, conv.id, NewMessage::text(format!("update {}", step)))
            .unwrap();
        while let Some(target) = schedule.next_due(now) {
            assert!(schedule.begin(target));
            match target {
                PollTarget::List => {
                    let delta = engine.sync_conversations(&b, list_cursor.as_deref()).unwrap();
                    assert_eq!(delta.member_of, vec![conv.id]);
                    list_cursor = Some(delta.cursor);
                }
                PollTarget::Messages(id) => {
                    let delta = engine.sync_messages(&b, id, message_cursor.as_deref()).unwrap();
                    seen.extend(delta.messages.iter().map(|v| v.message.sequence));
                    message_cursor = Some(delta.cursor);
                }
            }
            schedule.complete(target, PollOutcome::Success, now);
        }
        now += Duration::from_secs(10);
    }

    // one more message poll picks up the tail
    now += Duration::from_secs(10);
    let target = schedule.next_due(now).unwrap();
    assert_eq!(target, PollTarget::Messages(conv.id));
    let delta = engine.sync_messages(&b, conv.id, message_cursor.as_deref()).unwrap();
    seen.extend(delta.messages.iter().map(|v| v.message.sequence));

    assert_eq!(seen, (1..=6).collect::<BTreeSet<_>>());
    assert_eq!(delta.unread_count, 6);
}
