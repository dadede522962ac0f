use std::net;
use std::{thread, time};

use qcheck_macros::quickcheck;

use crate::prelude::*;
use crate::runtime::Runtime;
use crate::service::events;
use crate::service::message::NodeList;
use crate::service::RESERVATION_TIMEOUT;
use crate::{LocalDuration, LocalTime};

// NOTE
//
// To see the logs of a running test, add the following line to it and run
// with `cargo test -- --nocapture`:
//
//      crate::logger::init(log::Level::Debug).ok();

/// How long to wait for the network to do something observable.
const TIMEOUT: time::Duration = time::Duration::from_secs(8);
/// How long to wait for contending proposers to fight it out.
const CONVERGENCE_TIMEOUT: time::Duration = time::Duration::from_secs(30);

fn addr(port: u16) -> net::SocketAddr {
    ([127, 0, 0, 1], port).into()
}

fn localhost() -> net::IpAddr {
    net::Ipv4Addr::LOCALHOST.into()
}

fn entry(index: u64, sender: &str, message: &str) -> Entry {
    Entry {
        index,
        sender: sender.to_owned(),
        message: message.to_owned(),
    }
}

/// A service under direct control, without sockets or threads.
fn fixture(nickname: &str) -> (Service, Events) {
    let (emitter, events) = events::channel();
    let config = Config {
        nickname: nickname.to_owned(),
        ..Config::default()
    };
    let service = Service::new(
        config,
        addr(7777),
        LocalTime::now(),
        fastrand::Rng::with_seed(42),
        emitter,
    );
    (service, events)
}

/// Every committed log must be dense: entry `i` at position `i`.
fn assert_dense(history: &[Entry]) {
    for (i, entry) in history.iter().enumerate() {
        assert_eq!(entry.index, i as u64, "log entry out of place");
    }
}

#[test]
fn test_quiescent_slot_acks_proposal() {
    let (mut service, _events) = fixture("eve");

    let reply = service.received(
        localhost(),
        Request::Propose {
            index: 0,
            message: "hi".to_owned(),
            sender: "fred".to_owned(),
        },
    );
    assert_eq!(
        reply,
        Some(Reply::Response(Response::Vote {
            value: Vote::Ack,
            index: 0,
            sender: "eve".to_owned(),
        }))
    );
    assert_eq!(service.reserved_slot(), Some(0));
}

#[test]
fn test_stale_proposal_is_rejected() {
    let (mut service, _events) = fixture("eve");
    for i in 0..5 {
        service.received(
            localhost(),
            Request::Commit {
                index: i,
                message: format!("m{i}"),
                sender: "fred".to_owned(),
            },
        );
    }
    assert_eq!(service.next_index(), 5);

    let reply = service.received(
        localhost(),
        Request::Propose {
            index: 4,
            message: "late".to_owned(),
            sender: "gail".to_owned(),
        },
    );
    assert_eq!(
        reply,
        Some(Reply::Response(Response::Vote {
            value: Vote::Reject,
            index: 4,
            sender: "eve".to_owned(),
        }))
    );
    assert_eq!(service.reserved_slot(), None, "a reject must not mutate state");
    assert_eq!(service.next_index(), 5);
    assert_dense(service.history());
}

#[test]
fn test_reserved_slot_rejects_competing_proposal() {
    let (mut service, _events) = fixture("eve");

    service.received(
        localhost(),
        Request::Propose {
            index: 0,
            message: "first".to_owned(),
            sender: "fred".to_owned(),
        },
    );
    let reply = service.received(
        localhost(),
        Request::Propose {
            index: 0,
            message: "second".to_owned(),
            sender: "gail".to_owned(),
        },
    );
    assert_eq!(
        reply,
        Some(Reply::Response(Response::Vote {
            value: Vote::Reject,
            index: 0,
            sender: "eve".to_owned(),
        }))
    );
}

#[test]
fn test_reservation_expires() {
    let (mut service, _events) = fixture("eve");
    let t0 = LocalTime::now();
    service.tick(t0);

    service.received(
        localhost(),
        Request::Propose {
            index: 0,
            message: "hi".to_owned(),
            sender: "fred".to_owned(),
        },
    );
    assert_eq!(service.reserved_slot(), Some(0));

    // The slot stays held right until the deadline..
    service.tick(t0 + RESERVATION_TIMEOUT - LocalDuration::from_millis(1));
    service.wake();
    assert_eq!(service.reserved_slot(), Some(0));

    // ..and is released once it passes, with the log untouched.
    service.tick(t0 + RESERVATION_TIMEOUT);
    service.wake();
    assert_eq!(service.reserved_slot(), None);
    assert_eq!(service.next_index(), 0);
    assert!(service.history().is_empty());

    // The proposer crashed; someone else can now claim the same slot.
    let reply = service.received(
        localhost(),
        Request::Propose {
            index: 0,
            message: "me instead".to_owned(),
            sender: "gail".to_owned(),
        },
    );
    assert!(matches!(
        reply,
        Some(Reply::Response(Response::Vote {
            value: Vote::Ack,
            ..
        }))
    ));
}

#[test]
fn test_commit_appends_and_advances() {
    let (mut service, events) = fixture("eve");

    let reply = service.received(
        localhost(),
        Request::Commit {
            index: 0,
            message: "hello".to_owned(),
            sender: "fred".to_owned(),
        },
    );
    assert_eq!(
        reply,
        Some(Reply::Response(Response::AckCommit {
            message: "hello".to_owned(),
            sender: "eve".to_owned(),
        }))
    );
    assert_eq!(service.history(), vec![entry(0, "fred", "hello")]);
    assert_eq!(service.next_index(), 1);
    assert_eq!(
        events.try_recv(),
        Ok(Event::Message {
            sender: "fred".to_owned(),
            content: "hello".to_owned(),
        })
    );
}

#[test]
fn test_commit_releases_reservation() {
    let (mut service, _events) = fixture("eve");

    service.received(
        localhost(),
        Request::Propose {
            index: 0,
            message: "hi".to_owned(),
            sender: "fred".to_owned(),
        },
    );
    service.received(
        localhost(),
        Request::Commit {
            index: 0,
            message: "hi".to_owned(),
            sender: "fred".to_owned(),
        },
    );
    assert_eq!(service.reserved_slot(), None);
    assert_eq!(service.history(), vec![entry(0, "fred", "hi")]);
}

#[test]
fn test_stale_commit_is_ignored() {
    let (mut service, _events) = fixture("eve");
    let commit = Request::Commit {
        index: 0,
        message: "hello".to_owned(),
        sender: "fred".to_owned(),
    };

    service.received(localhost(), commit.clone());
    let reply = service.received(localhost(), commit);

    // The duplicate is acknowledged but the log doesn't regress.
    assert!(matches!(
        reply,
        Some(Reply::Response(Response::AckCommit { .. }))
    ));
    assert_eq!(service.history().len(), 1);
    assert_eq!(service.next_index(), 1);
}

#[test]
fn test_own_commit_emits_no_message_event() {
    let (mut service, events) = fixture("eve");

    service.received(
        localhost(),
        Request::Commit {
            index: 0,
            message: "mine".to_owned(),
            sender: "eve".to_owned(),
        },
    );
    assert_eq!(service.history().len(), 1);
    assert!(events.try_recv().is_err(), "own messages are not echoed");
}

#[test]
fn test_commit_gap_without_reachable_committer() {
    let (mut service, events) = fixture("eve");

    // A commit for slot 2 arrives out of the blue. The committer can't be
    // reached for recovery, so the entry lands anyway and the gap is
    // surfaced.
    let reply = service.received(
        localhost(),
        Request::Commit {
            index: 2,
            message: "late".to_owned(),
            sender: "fred".to_owned(),
        },
    );
    assert!(matches!(
        reply,
        Some(Reply::Response(Response::AckCommit { .. }))
    ));
    assert_eq!(service.next_index(), 3);

    let events: Vec<_> = events.try_iter().collect();
    assert!(events.iter().any(|e| matches!(e, Event::Error(_))));
}

#[test]
fn test_submit_with_no_peers_commits_directly() {
    let (mut service, events) = fixture("solo");

    service.submit("hi".to_owned());

    assert_eq!(service.history(), vec![entry(0, "solo", "hi")]);
    assert_eq!(service.next_index(), 1);
    assert_eq!(
        events.try_recv(),
        Ok(Event::Message {
            sender: "solo".to_owned(),
            content: "hi".to_owned(),
        })
    );
}

#[quickcheck]
fn prop_submissions_drain_in_order(lines: Vec<String>) {
    let (mut service, _events) = fixture("solo");

    for line in &lines {
        service.submit(line.clone());
    }
    assert_eq!(service.history().len(), lines.len());
    assert!(service.history().iter().map(|e| &e.message).eq(lines.iter()));
    assert_dense(service.history());
}

#[test]
fn test_get_nodes_replies_before_registering_caller() {
    let (mut service, events) = fixture("alice");

    let reply = service.received(
        localhost(),
        Request::GetNodes {
            nickname: "bob".to_owned(),
            port: Some(9001),
        },
    );
    assert_eq!(
        reply,
        Some(Reply::Nodes(NodeList { nodes: vec![] })),
        "a node must not discover itself"
    );
    assert!(service.peers().contains(&addr(9001)));

    let reply = service.received(
        localhost(),
        Request::GetNodes {
            nickname: "carol".to_owned(),
            port: Some(9002),
        },
    );
    assert_eq!(
        reply,
        Some(Reply::Nodes(NodeList {
            nodes: vec![("127.0.0.1:9001".to_owned(), "bob".to_owned())],
        }))
    );
    assert!(events.try_iter().any(|e| matches!(e, Event::Info(_))));
}

#[test]
fn test_new_node_returns_next_index() {
    let (mut service, _events) = fixture("alice");
    for i in 0..2 {
        service.received(
            localhost(),
            Request::Commit {
                index: i,
                message: format!("m{i}"),
                sender: "fred".to_owned(),
            },
        );
    }

    let reply = service.received(
        localhost(),
        Request::NewNode {
            nickname: "bob".to_owned(),
            port: Some(9001),
        },
    );
    assert_eq!(
        reply,
        Some(Reply::Response(Response::SystemIndex { index: 2 }))
    );
    assert!(service.peers().contains(&addr(9001)));
}

#[test]
fn test_nickname_change_replaces_entry() {
    let (mut service, _events) = fixture("alice");

    service.received(
        localhost(),
        Request::NewNode {
            nickname: "bob".to_owned(),
            port: Some(9001),
        },
    );
    service.received(
        localhost(),
        Request::NewNode {
            nickname: "bobby".to_owned(),
            port: Some(9001),
        },
    );
    assert_eq!(service.peers().len(), 1);
    assert_eq!(service.peers().find("bobby"), Some(addr(9001)));
    assert_eq!(service.peers().find("bob"), None);
}

#[test]
fn test_get_history_returns_full_log() {
    let (mut service, _events) = fixture("alice");
    for i in 0..3 {
        service.received(
            localhost(),
            Request::Commit {
                index: i,
                message: format!("m{i}"),
                sender: "fred".to_owned(),
            },
        );
    }

    let reply = service.received(localhost(), Request::GetHistory);
    assert_eq!(
        reply,
        Some(Reply::Response(Response::History {
            history: vec![
                entry(0, "fred", "m0"),
                entry(1, "fred", "m1"),
                entry(2, "fred", "m2"),
            ],
        }))
    );
}

#[test]
fn test_unknown_request_is_ignored() {
    let (mut service, events) = fixture("alice");

    let reply = service.received(localhost(), Request::Unknown);

    assert_eq!(reply, None);
    assert_eq!(service.next_index(), 0);
    assert!(service.peers().is_empty());
    assert!(events.try_recv().is_err());
}

mod e2e {
    use super::*;

    /// Spawn a node listening on an ephemeral localhost port.
    fn node(nickname: &str, connect: &[net::SocketAddr]) -> Runtime {
        let config = Config {
            nickname: nickname.to_owned(),
            connect: connect.to_vec(),
            listen: addr(0),
            external: None,
        };
        Runtime::init(config).expect("the node starts")
    }

    /// Poll until the condition holds or a deadline passes.
    fn converge(timeout: time::Duration, f: impl Fn() -> bool) {
        let start = time::Instant::now();
        while !f() {
            if start.elapsed() > timeout {
                panic!("nodes failed to converge in {timeout:?}");
            }
            thread::sleep(time::Duration::from_millis(50));
        }
    }

    fn shutdown(nodes: impl IntoIterator<Item = Runtime>) {
        for node in nodes {
            node.handle.shutdown().ok();
            node.join().expect("the node shuts down");
        }
    }

    #[test]
    fn test_single_proposer_happy_path() {
        let alice = node("alice", &[]);
        let bob = node("bob", &[alice.local_addr]);

        bob.handle.submit("hi").unwrap();

        // The proposer sees its own message once it commits..
        bob.events
            .wait(
                |e| matches!(e, Event::Message { sender, .. } if sender == "bob"),
                TIMEOUT,
            )
            .unwrap();
        // ..and the peer observes the commit.
        alice
            .events
            .wait(
                |e| {
                    matches!(
                        e,
                        Event::Message { sender, content } if sender == "bob" && content == "hi"
                    )
                },
                TIMEOUT,
            )
            .unwrap();

        let expected = vec![entry(0, "bob", "hi")];
        assert_eq!(alice.handle.history().unwrap(), expected);
        assert_eq!(bob.handle.history().unwrap(), expected);

        shutdown([alice, bob]);
    }

    #[test]
    fn test_late_joiner_catches_up() {
        let alice = node("alice", &[]);
        let bob = node("bob", &[alice.local_addr]);

        for line in ["one", "two", "three"] {
            alice.handle.submit(line).unwrap();
        }
        bob.events
            .wait(
                |e| matches!(e, Event::Message { content, .. } if content == "three"),
                TIMEOUT,
            )
            .unwrap();

        // Carol joins after the fact and replays the log.
        let carol = node("carol", &[alice.local_addr]);
        carol
            .events
            .wait(
                |e| matches!(e, Event::Message { content, .. } if content == "three"),
                TIMEOUT,
            )
            .unwrap();
        assert_eq!(
            carol.handle.history().unwrap(),
            alice.handle.history().unwrap()
        );

        // From here on she takes part in new commits.
        alice.handle.submit("four").unwrap();
        carol
            .events
            .wait(
                |e| matches!(e, Event::Message { content, .. } if content == "four"),
                TIMEOUT,
            )
            .unwrap();

        let history = alice.handle.history().unwrap();
        assert_eq!(history.len(), 4);
        assert_dense(&history);
        assert_eq!(carol.handle.history().unwrap(), history);
        assert_eq!(bob.handle.history().unwrap(), history);

        shutdown([alice, bob, carol]);
    }

    #[test]
    fn test_departed_peer_is_dropped_from_the_round() {
        let alice = node("alice", &[]);
        let bob = node("bob", &[alice.local_addr]);
        let carol = node("carol", &[alice.local_addr]);

        // Bob learns about carol through her announcement.
        converge(TIMEOUT, || {
            bob.handle
                .peers()
                .unwrap()
                .iter()
                .any(|p| p.nickname == "carol")
        });

        carol.handle.shutdown().unwrap();
        carol.join().unwrap();

        bob.handle.submit("still here").unwrap();

        // The round goes through without her, and she is reaped.
        bob.events
            .wait(|e| *e == Event::Info("carol has left.".to_owned()), TIMEOUT)
            .unwrap();
        bob.events
            .wait(
                |e| matches!(e, Event::Message { content, .. } if content == "still here"),
                TIMEOUT,
            )
            .unwrap();
        alice
            .events
            .wait(
                |e| matches!(e, Event::Message { content, .. } if content == "still here"),
                TIMEOUT,
            )
            .unwrap();

        assert!(bob
            .handle
            .peers()
            .unwrap()
            .iter()
            .all(|p| p.nickname != "carol"));
        assert_eq!(
            alice.handle.history().unwrap(),
            bob.handle.history().unwrap()
        );

        shutdown([alice, bob]);
    }

    #[test]
    fn test_contending_proposers_converge() {
        let alice = node("alice", &[]);
        let bob = node("bob", &[alice.local_addr]);
        let carol = node("carol", &[alice.local_addr]);

        converge(TIMEOUT, || {
            bob.handle
                .peers()
                .unwrap()
                .iter()
                .any(|p| p.nickname == "carol")
        });

        bob.handle.submit("one").unwrap();
        carol.handle.submit("two").unwrap();

        // Both messages commit everywhere, in the same order, without
        // duplicates; the random retry delays break the tie.
        converge(CONVERGENCE_TIMEOUT, || {
            let a = alice.handle.history().unwrap();
            let b = bob.handle.history().unwrap();
            let c = carol.handle.history().unwrap();

            a.len() == 2 && a == b && a == c
        });

        let history = alice.handle.history().unwrap();
        let mut messages: Vec<_> = history.iter().map(|e| e.message.as_str()).collect();
        messages.sort_unstable();
        assert_eq!(messages, vec!["one", "two"]);
        assert_dense(&history);

        shutdown([alice, bob, carol]);
    }
}
