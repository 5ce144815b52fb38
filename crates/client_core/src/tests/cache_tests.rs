use super::*;

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
};

use chrono::Duration;
use shared::domain::{ChannelKind, MessageKind, Role};

use crate::error::ClientError;

struct World {
    cache: EntityCache,
    me: UserId,
    server_id: ServerId,
    channel_id: ChannelId,
    stream: StreamKey,
}

fn base_time() -> DateTime<Utc> {
    "2024-05-01T12:00:00Z".parse().expect("timestamp")
}

fn message_at(stream: StreamKey, content: &str, offset_secs: i64) -> MessagePayload {
    let created_at = base_time() + Duration::seconds(offset_secs);
    let scope = match stream {
        StreamKey::Channel {
            server_id,
            channel_id,
        } => MessageScope::Channel {
            server_id,
            channel_id,
        },
        StreamKey::Conversation(conversation_id) => MessageScope::Conversation { conversation_id },
    };
    MessagePayload {
        message_id: MessageId::new(),
        author_id: UserId::new(),
        content: content.into(),
        kind: MessageKind::Text,
        created_at,
        updated_at: created_at,
        edited: false,
        scope,
    }
}

fn member(server_id: ServerId, user_id: UserId, role: Role) -> MemberSummary {
    MemberSummary {
        server_id,
        user_id,
        username: format!("user-{}", &user_id.to_string()[..8]),
        role,
    }
}

fn world() -> World {
    let cache = EntityCache::new();
    let me = UserId::new();
    let server_id = ServerId::new();
    let channel_id = ChannelId::new();
    cache.set_local_user(Some(me));
    cache.load_servers(vec![ServerSummary {
        server_id,
        name: "guild".into(),
        owner_id: me,
        image_url: None,
    }]);
    cache.load_channels(
        server_id,
        vec![ChannelSummary {
            channel_id,
            server_id,
            name: "general".into(),
            kind: ChannelKind::Text,
        }],
    );
    let stream = StreamKey::Channel {
        server_id,
        channel_id,
    };
    cache.begin_stream(stream);
    cache.complete_stream(stream, Vec::new());
    World {
        cache,
        me,
        server_id,
        channel_id,
        stream,
    }
}

fn contents(cache: &EntityCache, stream: StreamKey) -> Vec<String> {
    cache
        .messages(stream)
        .expect("stream open")
        .into_iter()
        .map(|cached| cached.message.content)
        .collect()
}

#[test]
fn echo_of_optimistic_message_leaves_one_copy() {
    let w = world();
    let mut local = message_at(w.stream, "hi", 0);
    local.author_id = w.me;
    assert!(w.cache.insert_optimistic(local.clone()));

    let mut echo = local.clone();
    echo.created_at = base_time() + Duration::milliseconds(200);
    echo.updated_at = echo.created_at;
    let effect = w.cache.apply_push(&PushEvent::MessageCreated {
        message: echo.clone(),
    });
    assert_eq!(effect, CacheEffect::Applied);

    let cached = w.cache.messages(w.stream).expect("stream");
    assert_eq!(cached.len(), 1);
    assert_eq!(cached[0].message, echo);
    assert!(!cached[0].pending);

    assert_eq!(
        w.cache.apply_push(&PushEvent::MessageCreated { message: echo }),
        CacheEffect::Ignored
    );
    assert_eq!(w.cache.messages(w.stream).expect("stream").len(), 1);
}

#[test]
fn acknowledged_copy_then_echo_stays_single() {
    let w = world();
    let local = message_at(w.stream, "ack first", 0);
    w.cache.insert_optimistic(local.clone());

    assert!(w.cache.confirm_message(local.clone()));
    w.cache.apply_push(&PushEvent::MessageCreated {
        message: local.clone(),
    });

    assert_eq!(contents(&w.cache, w.stream), vec!["ack first"]);
    assert!(!w.cache.rollback_message(w.stream, local.message_id));
}

#[test]
fn stream_is_ordered_by_creation_time_then_id() {
    let w = world();
    let late = message_at(w.stream, "late", 30);
    let early = message_at(w.stream, "early", 10);
    let mut tie_a = message_at(w.stream, "tie-a", 20);
    let mut tie_b = message_at(w.stream, "tie-b", 20);
    if tie_b.message_id < tie_a.message_id {
        std::mem::swap(&mut tie_a.message_id, &mut tie_b.message_id);
    }

    for message in [late, tie_b, early, tie_a] {
        w.cache.apply_push(&PushEvent::MessageCreated { message });
    }

    assert_eq!(
        contents(&w.cache, w.stream),
        vec!["early", "tie-a", "tie-b", "late"]
    );
}

#[test]
fn edits_and_deletes_are_idempotent_and_ignore_unknown_ids() {
    let w = world();
    let original = message_at(w.stream, "v1", 0);
    w.cache.apply_push(&PushEvent::MessageCreated {
        message: original.clone(),
    });

    let stranger = message_at(w.stream, "never loaded", 5);
    assert_eq!(
        w.cache.apply_push(&PushEvent::MessageUpdated { message: stranger }),
        CacheEffect::Ignored
    );

    let delete = PushEvent::MessageDeleted {
        server_id: w.server_id,
        channel_id: w.channel_id,
        message_id: original.message_id,
    };
    assert_eq!(w.cache.apply_push(&delete), CacheEffect::Applied);
    assert_eq!(w.cache.apply_push(&delete), CacheEffect::Ignored);
    assert!(w.cache.messages(w.stream).expect("stream").is_empty());
}

#[test]
fn older_edit_never_overwrites_newer() {
    let w = world();
    let original = message_at(w.stream, "v1", 0);
    w.cache.apply_push(&PushEvent::MessageCreated {
        message: original.clone(),
    });

    let mut newer = original.clone();
    newer.content = "v3".into();
    newer.edited = true;
    newer.updated_at = original.created_at + Duration::seconds(20);
    let mut older = original.clone();
    older.content = "v2".into();
    older.edited = true;
    older.updated_at = original.created_at + Duration::seconds(10);

    w.cache.apply_push(&PushEvent::MessageUpdated { message: newer });
    assert_eq!(
        w.cache.apply_push(&PushEvent::MessageUpdated { message: older }),
        CacheEffect::Ignored
    );
    assert_eq!(contents(&w.cache, w.stream), vec!["v3"]);
}

#[test]
fn push_for_unopened_stream_is_dropped() {
    let w = world();
    let elsewhere = StreamKey::Channel {
        server_id: w.server_id,
        channel_id: ChannelId::new(),
    };
    let effect = w.cache.apply_push(&PushEvent::MessageCreated {
        message: message_at(elsewhere, "lost", 0),
    });

    assert_eq!(effect, CacheEffect::Ignored);
    assert!(w.cache.messages(elsewhere).is_none());
}

#[test]
fn pushes_during_initial_fetch_are_replayed_once() {
    let cache = EntityCache::new();
    let stream = StreamKey::Conversation(ConversationId::new());
    cache.begin_stream(stream);

    let fetched = message_at(stream, "from fetch", 0);
    let fresh = message_at(stream, "arrived while loading", 5);
    assert_eq!(
        cache.apply_push(&PushEvent::PrivateMessageCreated {
            message: fetched.clone(),
        }),
        CacheEffect::Buffered
    );
    cache.apply_push(&PushEvent::PrivateMessageCreated {
        message: fresh.clone(),
    });
    assert_eq!(cache.stream_state(stream), Some(StreamState::Loading));

    cache.complete_stream(stream, vec![fetched]);

    assert_eq!(cache.stream_state(stream), Some(StreamState::Open));
    assert_eq!(
        contents(&cache, stream),
        vec!["from fetch", "arrived while loading"]
    );
}

#[test]
fn delete_buffered_during_fetch_removes_fetched_message() {
    let cache = EntityCache::new();
    let conversation_id = ConversationId::new();
    let stream = StreamKey::Conversation(conversation_id);
    cache.begin_stream(stream);
    let doomed = message_at(stream, "doomed", 0);

    cache.apply_push(&PushEvent::PrivateMessageDeleted {
        conversation_id,
        message_id: doomed.message_id,
    });
    cache.complete_stream(stream, vec![doomed]);

    assert!(contents(&cache, stream).is_empty());
}

#[test]
fn unconfirmed_local_message_survives_refetch() {
    let w = world();
    let local = message_at(w.stream, "still sending", 50);
    w.cache.insert_optimistic(local.clone());

    w.cache.begin_stream(w.stream);
    w.cache
        .complete_stream(w.stream, vec![message_at(w.stream, "history", 0)]);

    let cached = w.cache.messages(w.stream).expect("stream");
    assert_eq!(cached.len(), 2);
    assert!(cached[1].pending);
    assert!(w.cache.rollback_message(w.stream, local.message_id));
    assert_eq!(contents(&w.cache, w.stream), vec!["history"]);
}

#[test]
fn local_edit_and_delete_can_be_restored() {
    let w = world();
    let original = message_at(w.stream, "draft", 0);
    w.cache.apply_push(&PushEvent::MessageCreated {
        message: original.clone(),
    });

    let previous = w
        .cache
        .apply_local_edit(w.stream, original.message_id, "edited")
        .expect("edit");
    assert_eq!(contents(&w.cache, w.stream), vec!["edited"]);
    w.cache.restore_message(previous);
    assert_eq!(contents(&w.cache, w.stream), vec!["draft"]);

    let removed = w
        .cache
        .apply_local_delete(w.stream, original.message_id)
        .expect("delete");
    assert!(contents(&w.cache, w.stream).is_empty());
    w.cache.restore_message(removed);
    assert_eq!(contents(&w.cache, w.stream), vec!["draft"]);
}

#[test]
fn restoring_an_unconfirmed_message_keeps_it_pending() {
    let w = world();
    let local = message_at(w.stream, "still sending", 0);
    w.cache.insert_optimistic(local.clone());

    let removed = w
        .cache
        .apply_local_delete(w.stream, local.message_id)
        .expect("delete");
    w.cache.restore_message(removed);

    assert!(w.cache.message(w.stream, local.message_id).is_some_and(|m| m.pending));
    assert!(w.cache.rollback_message(w.stream, local.message_id));
    assert!(contents(&w.cache, w.stream).is_empty());
}

#[test]
fn resync_marks_queries_stale_and_reloads_open_streams() {
    let w = world();
    let mut events = w.cache.subscribe();

    let streams = w.cache.begin_resync();

    assert_eq!(streams, vec![w.stream]);
    assert_eq!(w.cache.query_state(QueryKey::ServerList), Some(QueryState::Stale));
    assert_eq!(
        w.cache.query_state(QueryKey::ChannelList(w.server_id)),
        Some(QueryState::Stale)
    );
    assert_eq!(w.cache.stream_state(w.stream), Some(StreamState::Loading));
    let mut invalidated = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let CacheEvent::Invalidated(key) = event {
            invalidated.push(key);
        }
    }
    assert_eq!(invalidated.len(), 2);

    let missed = message_at(w.stream, "sent while offline", 0);
    let live = message_at(w.stream, "after reconnect", 10);
    assert_eq!(
        w.cache.apply_push(&PushEvent::MessageCreated {
            message: live.clone()
        }),
        CacheEffect::Buffered
    );
    let dropped = w
        .cache
        .complete_resync(w.stream, vec![missed], &HashSet::new());

    assert!(dropped.is_empty());
    assert_eq!(w.cache.stream_state(w.stream), Some(StreamState::Open));
    assert_eq!(
        contents(&w.cache, w.stream),
        vec!["sent while offline", "after reconnect"]
    );
}

#[test]
fn resync_drops_unconfirmed_messages_whose_send_was_lost() {
    let w = world();
    let lost = message_at(w.stream, "lost", 0);
    let in_flight = message_at(w.stream, "in flight", 5);
    let stored = message_at(w.stream, "stored", 10);
    for message in [&lost, &in_flight, &stored] {
        w.cache.insert_optimistic(message.clone());
    }

    w.cache.begin_resync();
    let dropped = w.cache.complete_resync(
        w.stream,
        vec![stored.clone()],
        &HashSet::from([in_flight.message_id]),
    );

    assert_eq!(dropped, vec![lost.message_id]);
    let cached = w.cache.messages(w.stream).expect("stream");
    assert_eq!(cached.len(), 2);
    assert_eq!(cached[0].message.content, "in flight");
    assert!(cached[0].pending);
    assert_eq!(cached[1].message.content, "stored");
    assert!(!cached[1].pending);
}

#[test]
fn ownership_change_is_never_observed_half_applied() {
    let w = world();
    let other = UserId::new();
    w.cache
        .load_members(
            w.server_id,
            vec![
                member(w.server_id, w.me, Role::Owner),
                member(w.server_id, other, Role::Admin),
            ],
        )
        .expect("members");

    let cache = Arc::new(w.cache);
    let done = Arc::new(AtomicBool::new(false));
    let readers: Vec<_> = (0..4)
        .map(|_| {
            let cache = Arc::clone(&cache);
            let done = Arc::clone(&done);
            let server_id = w.server_id;
            thread::spawn(move || {
                let mut reads = 0u64;
                while !done.load(Ordering::Acquire) {
                    let members = cache.members(server_id).expect("members");
                    let owners = members
                        .iter()
                        .filter(|member| member.role == Role::Owner)
                        .count();
                    assert_eq!(owners, 1, "observed {owners} owners");
                    reads += 1;
                }
                reads
            })
        })
        .collect();

    let (mut from, mut to) = (w.me, other);
    for _ in 0..500 {
        let effect = cache.apply_push(&PushEvent::ServerOwnerChanged {
            server_id: w.server_id,
            previous_owner_id: from,
            new_owner_id: to,
        });
        assert_eq!(effect, CacheEffect::Applied);
        std::mem::swap(&mut from, &mut to);
    }
    done.store(true, Ordering::Release);
    for reader in readers {
        reader.join().expect("reader thread");
    }

    assert_eq!(cache.server(w.server_id).expect("server").owner_id, w.me);
    let roster = cache.roster(w.server_id).expect("roster");
    assert_eq!(roster.role_of(w.me), Some(Role::Owner));
    assert_eq!(roster.role_of(other), Some(Role::Admin));
}

#[test]
fn self_ban_drops_server_and_reports_its_channels() {
    let w = world();
    let mut events = w.cache.subscribe();

    let effect = w.cache.apply_push(&PushEvent::MemberBanned {
        ban: BanSummary {
            server_id: w.server_id,
            user_id: w.me,
            reason: Some("spam".into()),
            banned_at: Utc::now(),
            banned_by: UserId::new(),
        },
    });

    assert_eq!(
        effect,
        CacheEffect::LeftServer {
            server_id: w.server_id,
            channels: vec![w.channel_id],
        }
    );
    assert!(w.cache.server(w.server_id).is_none());
    assert!(w.cache.channels(w.server_id).is_none());
    assert!(w.cache.messages(w.stream).is_none());
    assert_eq!(w.cache.query_state(QueryKey::ServerList), Some(QueryState::Stale));
    assert_eq!(
        events.try_recv().expect("event"),
        CacheEvent::ServerRemoved(w.server_id)
    );
}

#[test]
fn self_kick_also_leaves_the_server() {
    let w = world();
    let effect = w.cache.apply_push(&PushEvent::MemberKicked {
        server_id: w.server_id,
        user_id: w.me,
    });
    assert!(matches!(effect, CacheEffect::LeftServer { .. }));
    assert!(w.cache.servers().is_empty());
}

#[test]
fn banning_someone_else_removes_membership_and_invalidates_lists() {
    let w = world();
    let target = UserId::new();
    w.cache
        .load_members(
            w.server_id,
            vec![
                member(w.server_id, w.me, Role::Owner),
                member(w.server_id, target, Role::Member),
            ],
        )
        .expect("members");
    w.cache.load_bans(w.server_id, Vec::new());

    w.cache.apply_push(&PushEvent::MemberBanned {
        ban: BanSummary {
            server_id: w.server_id,
            user_id: target,
            reason: None,
            banned_at: Utc::now(),
            banned_by: w.me,
        },
    });

    let members = w.cache.members(w.server_id).expect("members");
    let bans = w.cache.bans(w.server_id).expect("bans");
    assert!(members.iter().all(|member| member.user_id != target));
    assert!(bans.iter().any(|ban| ban.user_id == target));
    assert_eq!(
        w.cache.query_state(QueryKey::MemberList(w.server_id)),
        Some(QueryState::Stale)
    );
    assert_eq!(
        w.cache.query_state(QueryKey::BanList(w.server_id)),
        Some(QueryState::Stale)
    );
}

#[test]
fn structural_pushes_invalidate_rather_than_patch() {
    let w = world();
    let mut events = w.cache.subscribe();
    let new_channel = ChannelSummary {
        channel_id: ChannelId::new(),
        server_id: w.server_id,
        name: "random".into(),
        kind: ChannelKind::Text,
    };

    w.cache.apply_push(&PushEvent::ChannelCreated {
        channel: new_channel,
    });

    assert_eq!(w.cache.channels(w.server_id).expect("channels").len(), 1);
    assert_eq!(
        w.cache.query_state(QueryKey::ChannelList(w.server_id)),
        Some(QueryState::Stale)
    );
    assert_eq!(
        events.try_recv().expect("event"),
        CacheEvent::Invalidated(QueryKey::ChannelList(w.server_id))
    );

    let unloaded = ServerId::new();
    w.cache.apply_push(&PushEvent::MemberJoined {
        member: member(unloaded, UserId::new(), Role::Member),
    });
    assert_eq!(w.cache.query_state(QueryKey::MemberList(unloaded)), None);
}

#[test]
fn invalidation_during_fetch_keeps_query_stale() {
    let w = world();
    w.cache.begin_load(QueryKey::ChannelList(w.server_id));
    w.cache.apply_push(&PushEvent::ChannelDeleted {
        server_id: w.server_id,
        channel_id: w.channel_id,
    });
    w.cache.load_channels(w.server_id, Vec::new());

    assert_eq!(
        w.cache.query_state(QueryKey::ChannelList(w.server_id)),
        Some(QueryState::Stale)
    );
    assert!(w.cache.stale_queries().contains(&QueryKey::ChannelList(w.server_id)));
}

#[test]
fn inconsistent_member_list_is_rejected() {
    let w = world();
    let err = w
        .cache
        .load_members(
            w.server_id,
            vec![
                member(w.server_id, w.me, Role::Owner),
                member(w.server_id, UserId::new(), Role::Owner),
            ],
        )
        .expect_err("two owners");

    assert!(matches!(err, ClientError::Conflict(_)));
    assert!(w.cache.members(w.server_id).is_none());
    assert_eq!(
        w.cache.query_state(QueryKey::MemberList(w.server_id)),
        Some(QueryState::Stale)
    );
}

#[test]
fn conversations_are_unique_and_scoped_to_local_user() {
    let w = world();
    let friend = UserId::new();
    let conversation = ConversationSummary {
        conversation_id: ConversationId::new(),
        user1: w.me,
        user2: friend,
    };

    let push = PushEvent::ConversationCreated {
        conversation: conversation.clone(),
    };
    assert_eq!(w.cache.apply_push(&push), CacheEffect::Applied);
    assert_eq!(w.cache.apply_push(&push), CacheEffect::Ignored);

    let foreign = PushEvent::ConversationCreated {
        conversation: ConversationSummary {
            conversation_id: ConversationId::new(),
            user1: UserId::new(),
            user2: friend,
        },
    };
    assert_eq!(w.cache.apply_push(&foreign), CacheEffect::Ignored);
    assert_eq!(w.cache.conversations(), vec![conversation.clone()]);
    assert_eq!(w.cache.conversation_with(friend, w.me), Some(conversation));
}

#[test]
fn presence_tracks_online_users() {
    let w = world();
    let friend = UserId::new();

    w.cache.apply_push(&PushEvent::PresenceOnline { user_id: friend });
    assert!(w.cache.is_online(friend));
    w.cache.apply_push(&PushEvent::PresenceOffline { user_id: friend });
    assert!(!w.cache.is_online(friend));
    assert_eq!(
        w.cache
            .apply_push(&PushEvent::PresenceOffline { user_id: friend }),
        CacheEffect::Ignored
    );
}

#[test]
fn clear_forgets_everything() {
    let w = world();
    w.cache.clear();

    assert!(w.cache.servers().is_empty());
    assert!(w.cache.local_user().is_none());
    assert!(w.cache.messages(w.stream).is_none());
    assert_eq!(w.cache.query_state(QueryKey::ServerList), None);
}
