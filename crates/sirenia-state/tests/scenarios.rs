//! End-to-end peer scenarios driven through the simulator.

#![allow(clippy::unwrap_used)]

mod common;

use common::{expect_peer, frozen_at, node, pos, singleton_state, zero, DbExpect, Harness};
use sirenia_core::{DiscoverdState, FreezeDetails, Role, State};

/// Unassigned to async to sync to primary, then deposed.
#[tokio::test]
async fn basic_chain_lifecycle() {
    let mut h = Harness::new();
    let gen1 = State {
        generation: 1,
        primary: node(2, 1),
        sync: Some(node(3, 2)),
        asyncs: vec![node(1, 3)],
        init_wal: zero(),
        ..State::default()
    };
    let peers = vec![node(2, 1), node(3, 2), node(1, 3)];

    let info = h.discoverd().await;
    assert_eq!(info.state, DiscoverdState::default());
    assert!(info.peers.is_empty());

    h.run_all(&["addpeer", "addpeer", "addpeer node1"]).await;
    assert_eq!(h.discoverd().await.peers, peers);

    h.run("bootstrap node2 node3").await;
    let info = h.discoverd().await;
    assert_eq!(info.state.index, 1);
    assert_eq!(info.state.state.as_ref(), Some(&gen1));

    // Before start the peer knows nothing.
    let info = h.peer().await;
    assert_eq!(info.peer.id, "node1");
    assert_eq!(info.peer.role, Role::Unknown);
    assert!(info.postgres.config.is_none());
    assert_eq!(info.postgres.xlog, zero());

    h.run("startPeer").await;
    let info = h.peer().await;
    expect_peer(&info, Role::Async, peers.clone(), Some(gen1));
    DbExpect::new(Role::Async)
        .upstream(node(3, 2))
        .check(&info.postgres);

    // Depose the primary: our peer becomes the sync and waits to catch up.
    h.run("depose").await;
    let gen2_0 = State {
        generation: 2,
        init_wal: pos("0/0000000A"),
        primary: node(3, 2),
        sync: Some(node(1, 3)),
        deposed: vec![node(2, 1)],
        ..State::default()
    };
    let info = h.peer().await;
    expect_peer(&info, Role::Sync, peers.clone(), Some(gen2_0));
    DbExpect::new(Role::Sync)
        .upstream(node(3, 2))
        .waiting("0/0000000A")
        .check(&info.postgres);

    // Rebuilding the old primary makes it our downstream.
    h.run("rebuild node2").await;
    let gen2_1 = State {
        generation: 2,
        init_wal: pos("0/0000000A"),
        primary: node(3, 2),
        sync: Some(node(1, 3)),
        asyncs: vec![node(2, 1)],
        ..State::default()
    };
    let sync_db = DbExpect::new(Role::Sync)
        .upstream(node(3, 2))
        .downstream(node(2, 1))
        .waiting("0/0000000A");
    let info = h.peer().await;
    expect_peer(&info, Role::Sync, peers.clone(), Some(gen2_1.clone()));
    sync_db.check(&info.postgres);

    // Not caught up: losing the primary must not cause a takeover.
    h.run("rmpeer node3 retrylater").await;
    let info = h.peer().await;
    expect_peer(
        &info,
        Role::Sync,
        vec![node(2, 1), node(1, 3)],
        Some(gen2_1.clone()),
    );
    sync_db.check(&info.postgres);

    h.run("addpeer node3").await;
    let info = h.peer().await;
    expect_peer(
        &info,
        Role::Sync,
        vec![node(2, 1), node(1, 3), node(3, 4)],
        Some(gen2_1),
    );
    sync_db.check(&info.postgres);

    // Caught up: now the takeover goes through.
    h.run("catchUp").await;
    h.run("rmpeer node3").await;
    let gen3 = State {
        generation: 3,
        init_wal: pos("0/00000014"),
        primary: node(1, 3),
        sync: Some(node(2, 1)),
        deposed: vec![node(3, 2)],
        ..State::default()
    };
    let primary_db = DbExpect::new(Role::Primary)
        .downstream(node(2, 1))
        .xlog("0/0000001E");
    let info = h.peer().await;
    expect_peer(
        &info,
        Role::Primary,
        vec![node(2, 1), node(1, 3)],
        Some(gen3.clone()),
    );
    primary_db.check(&info.postgres);

    // A rebuilt peer is picked up as an async once it is present.
    h.run_all(&["rebuild node3", "addpeer node3"]).await;
    let info = h.peer().await;
    expect_peer(
        &info,
        Role::Primary,
        vec![node(2, 1), node(1, 3), node(3, 4)],
        Some(State {
            asyncs: vec![node(3, 4)],
            deposed: Vec::new(),
            ..gen3
        }),
    );
    primary_db.check(&info.postgres);

    // Sync failure promotes the async.
    h.run("rmpeer node2").await;
    let gen4 = State {
        generation: 4,
        init_wal: pos("0/0000001E"),
        primary: node(1, 3),
        sync: Some(node(3, 4)),
        ..State::default()
    };
    let primary_db = DbExpect::new(Role::Primary)
        .downstream(node(3, 4))
        .xlog("0/00000028");
    let info = h.peer().await;
    expect_peer(
        &info,
        Role::Primary,
        vec![node(1, 3), node(3, 4)],
        Some(gen4.clone()),
    );
    primary_db.check(&info.postgres);

    h.run("addpeer node2").await;
    h.run("addpeer node4").await;
    let info = h.peer().await;
    expect_peer(
        &info,
        Role::Primary,
        vec![node(1, 3), node(3, 4), node(2, 5), node(4, 6)],
        Some(State {
            asyncs: vec![node(2, 5), node(4, 6)],
            ..gen4.clone()
        }),
    );
    primary_db.check(&info.postgres);

    h.run("rmpeer node4").await;
    let info = h.peer().await;
    expect_peer(
        &info,
        Role::Primary,
        vec![node(1, 3), node(3, 4), node(2, 5)],
        Some(State {
            asyncs: vec![node(2, 5)],
            ..gen4
        }),
    );
    primary_db.check(&info.postgres);

    // Someone else deposes us; the database is stopped.
    h.run("depose").await;
    let info = h.peer().await;
    expect_peer(
        &info,
        Role::Deposed,
        vec![node(1, 3), node(3, 4), node(2, 5)],
        Some(State {
            generation: 5,
            init_wal: pos("0/00000028"),
            primary: node(3, 4),
            sync: Some(node(2, 5)),
            deposed: vec![node(1, 3)],
            ..State::default()
        }),
    );
    DbExpect::offline()
        .xlog("0/00000028")
        .check(&info.postgres);
}

#[tokio::test]
async fn setup_waits_for_a_second_peer() {
    let mut h = Harness::new();
    h.run("startPeer").await;
    let info = h.peer().await;
    expect_peer(&info, Role::Unassigned, vec![node(1, 1)], None);
    DbExpect::offline().check(&info.postgres);

    h.run("addpeer").await;
    let info = h.peer().await;
    expect_peer(
        &info,
        Role::Primary,
        vec![node(1, 1), node(2, 2)],
        Some(State {
            generation: 1,
            primary: node(1, 1),
            sync: Some(node(2, 2)),
            init_wal: zero(),
            ..State::default()
        }),
    );
    DbExpect::new(Role::Primary)
        .downstream(node(2, 2))
        .xlog("0/0000000A")
        .check(&info.postgres);
}

#[tokio::test]
async fn first_peer_sets_up_immediately() {
    let mut h = Harness::new();
    h.run_all(&["addpeer node1", "addpeer", "startPeer"]).await;
    let info = h.peer().await;
    expect_peer(
        &info,
        Role::Primary,
        vec![node(1, 1), node(2, 2)],
        Some(State {
            generation: 1,
            primary: node(1, 1),
            sync: Some(node(2, 2)),
            init_wal: zero(),
            ..State::default()
        }),
    );
    DbExpect::new(Role::Primary)
        .downstream(node(2, 2))
        .xlog("0/0000000A")
        .check(&info.postgres);
}

#[tokio::test]
async fn singleton_sets_up_alone_and_frozen() {
    let mut h = Harness::singleton();
    h.run("startPeer").await;
    let info = h.peer().await;
    expect_peer(
        &info,
        Role::Primary,
        vec![node(1, 1)],
        Some(singleton_state(node(1, 1))),
    );
    DbExpect::new(Role::Primary)
        .xlog("0/0000000A")
        .check(&info.postgres);
}

#[tokio::test]
async fn second_peer_waits_for_setup() {
    let mut h = Harness::new();
    h.run_all(&["addpeer", "startPeer"]).await;
    let info = h.peer().await;
    expect_peer(&info, Role::Unassigned, vec![node(2, 1), node(1, 2)], None);
    DbExpect::offline().check(&info.postgres);

    h.run("bootstrap").await;
    let info = h.peer().await;
    expect_peer(
        &info,
        Role::Sync,
        vec![node(2, 1), node(1, 2)],
        Some(State {
            generation: 1,
            primary: node(2, 1),
            sync: Some(node(1, 2)),
            init_wal: zero(),
            ..State::default()
        }),
    );
    DbExpect::new(Role::Sync)
        .upstream(node(2, 1))
        .waiting("0/00000000")
        .check(&info.postgres);
}

#[tokio::test]
async fn no_takeover_without_asyncs() {
    let mut h = Harness::new();
    h.run_all(&["addpeer", "addpeer node1", "bootstrap node2 node1", "startPeer"])
        .await;
    let gen1 = State {
        generation: 1,
        primary: node(2, 1),
        sync: Some(node(1, 2)),
        init_wal: zero(),
        ..State::default()
    };
    let sync_db = DbExpect::new(Role::Sync)
        .upstream(node(2, 1))
        .waiting("0/00000000");

    h.run("rmpeer node2").await;
    let info = h.peer().await;
    expect_peer(&info, Role::Sync, vec![node(1, 2)], Some(gen1));
    sync_db.check(&info.postgres);

    // A new async (added to the state by the simulated primary) unblocks it.
    h.run("addpeer").await;
    let gen2 = State {
        generation: 2,
        primary: node(1, 2),
        sync: Some(node(3, 3)),
        init_wal: zero(),
        ..State::default()
    };
    let primary_db = DbExpect::new(Role::Primary)
        .downstream(node(3, 3))
        .xlog("0/0000000A");
    let info = h.peer().await;
    expect_peer(
        &info,
        Role::Primary,
        vec![node(1, 2), node(3, 3)],
        Some(State {
            deposed: vec![node(2, 1)],
            ..gen2.clone()
        }),
    );
    primary_db.check(&info.postgres);

    h.run("rebuild node2").await;
    let info = h.peer().await;
    expect_peer(
        &info,
        Role::Primary,
        vec![node(1, 2), node(3, 3)],
        Some(gen2.clone()),
    );

    // Losing the sync with nobody to promote changes nothing.
    h.run("rmpeer node3").await;
    let info = h.peer().await;
    expect_peer(&info, Role::Primary, vec![node(1, 2)], Some(gen2));
    primary_db.check(&info.postgres);
}

#[tokio::test]
async fn singleton_ignores_other_peers() {
    let mut h = Harness::singleton();
    let gen1 = singleton_state(node(1, 1));
    h.set_state(&gen1).await;
    h.run("startPeer").await;

    let primary_db = DbExpect::new(Role::Primary).xlog("0/0000000A");
    let info = h.peer().await;
    expect_peer(&info, Role::Primary, vec![node(1, 1)], Some(gen1.clone()));
    primary_db.check(&info.postgres);

    h.run("addpeer").await;
    let info = h.peer().await;
    expect_peer(
        &info,
        Role::Primary,
        vec![node(1, 1), node(2, 2)],
        Some(gen1.clone()),
    );

    h.run("rmpeer node2").await;
    let info = h.peer().await;
    expect_peer(&info, Role::Primary, vec![node(1, 1)], Some(gen1));
    primary_db.check(&info.postgres);
}

#[tokio::test]
async fn singleton_second_peer_stays_unassigned() {
    let mut h = Harness::singleton();
    let gen1 = singleton_state(node(2, 1));
    h.run("addpeer").await;
    h.set_state(&gen1).await;
    h.run("startpeer").await;

    let info = h.peer().await;
    expect_peer(
        &info,
        Role::Unassigned,
        vec![node(2, 1), node(1, 2)],
        Some(gen1.clone()),
    );
    DbExpect::offline().check(&info.postgres);

    h.run("rmpeer node2").await;
    let info = h.peer().await;
    expect_peer(&info, Role::Unassigned, vec![node(1, 2)], Some(gen1));
}

#[tokio::test]
async fn singleton_upgrades_to_normal_mode() {
    let mut h = Harness::new();
    let gen1 = singleton_state(node(1, 1));
    h.set_state(&gen1).await;
    h.run("startpeer").await;

    let info = h.peer().await;
    expect_peer(&info, Role::Primary, vec![node(1, 1)], Some(gen1.clone()));
    DbExpect::new(Role::Primary)
        .xlog("0/0000000A")
        .check(&info.postgres);

    // Unfrozen but alone: nothing to do yet.
    h.run("unfreeze").await;
    let info = h.peer().await;
    expect_peer(
        &info,
        Role::Primary,
        vec![node(1, 1)],
        Some(State {
            freeze: None,
            ..gen1
        }),
    );

    h.run("addpeer").await;
    let info = h.peer().await;
    expect_peer(
        &info,
        Role::Primary,
        vec![node(1, 1), node(2, 2)],
        Some(State {
            generation: 2,
            primary: node(1, 1),
            sync: Some(node(2, 2)),
            init_wal: pos("0/0000000A"),
            ..State::default()
        }),
    );
    DbExpect::new(Role::Primary)
        .downstream(node(2, 2))
        .xlog("0/00000014")
        .check(&info.postgres);

    h.run_all(&["addpeer", "rmpeer node2"]).await;
    let gen3 = State {
        generation: 3,
        primary: node(1, 1),
        sync: Some(node(3, 3)),
        init_wal: pos("0/00000014"),
        ..State::default()
    };
    let primary_db = DbExpect::new(Role::Primary)
        .downstream(node(3, 3))
        .xlog("0/0000001E");
    let info = h.peer().await;
    expect_peer(
        &info,
        Role::Primary,
        vec![node(1, 1), node(3, 3)],
        Some(gen3.clone()),
    );
    primary_db.check(&info.postgres);

    // The old sync rejoins as an async without a generation bump.
    h.run("addpeer node2").await;
    let info = h.peer().await;
    expect_peer(
        &info,
        Role::Primary,
        vec![node(1, 1), node(3, 3), node(2, 4)],
        Some(State {
            asyncs: vec![node(2, 4)],
            ..gen3
        }),
    );
    primary_db.check(&info.postgres);
}

#[tokio::test]
async fn starts_deposed() {
    let mut h = Harness::new();
    h.run_all(&["addpeer node1", "addpeer", "addpeer", "bootstrap", "depose"])
        .await;
    let gen2 = State {
        generation: 2,
        primary: node(2, 2),
        sync: Some(node(3, 3)),
        deposed: vec![node(1, 1)],
        init_wal: pos("0/0000000A"),
        ..State::default()
    };
    let peers = vec![node(1, 1), node(2, 2), node(3, 3)];
    let info = h.discoverd().await;
    assert_eq!(info.state.index, 2);
    assert_eq!(info.state.state.as_ref(), Some(&gen2));
    assert_eq!(info.peers, peers);

    h.run("startPeer").await;
    let info = h.peer().await;
    expect_peer(&info, Role::Deposed, peers.clone(), Some(gen2.clone()));
    DbExpect::offline().check(&info.postgres);

    // Once rebuilt the peer rejoins at the tail of the chain.
    h.run("rebuild node1").await;
    let rebuilt = State {
        deposed: vec![],
        asyncs: vec![node(1, 1)],
        ..gen2
    };
    assert_eq!(h.cluster_state().state.as_ref(), Some(&rebuilt));
    let info = h.peer().await;
    expect_peer(&info, Role::Async, peers, Some(rebuilt));
    DbExpect::new(Role::Async)
        .upstream(node(3, 3))
        .check(&info.postgres);
}

#[tokio::test]
async fn deposed_peer_dropped_from_state_becomes_unassigned() {
    let mut h = Harness::new();
    h.run_all(&[
        "addpeer node1",
        "addpeer",
        "addpeer",
        "bootstrap",
        "depose",
        "startPeer",
    ])
    .await;
    assert_eq!(h.peer().await.peer.role, Role::Deposed);

    let mut state = h.cluster_state().state.unwrap();
    state.deposed.clear();
    h.set_state(&state).await;

    let info = h.peer().await;
    expect_peer(
        &info,
        Role::Unassigned,
        vec![node(1, 1), node(2, 2), node(3, 3)],
        Some(state),
    );
    DbExpect::offline().check(&info.postgres);
}

#[tokio::test]
async fn freeze_blocks_takeover_until_unfrozen() {
    let mut h = Harness::new();
    h.run_all(&[
        "addpeer",
        "addpeer node1",
        "addpeer",
        "bootstrap node2 node1",
        "freeze",
        "startPeer",
        "catchUp",
    ])
    .await;
    let gen1 = State {
        generation: 1,
        primary: node(2, 1),
        sync: Some(node(1, 2)),
        asyncs: vec![node(3, 3)],
        init_wal: zero(),
        freeze: Some(FreezeDetails::new("frozen by simulator", frozen_at())),
        ..State::default()
    };
    let sync_db = DbExpect::new(Role::Sync)
        .upstream(node(2, 1))
        .downstream(node(3, 3))
        .xlog("0/0000000A");
    let info = h.peer().await;
    expect_peer(
        &info,
        Role::Sync,
        vec![node(2, 1), node(1, 2), node(3, 3)],
        Some(gen1.clone()),
    );
    sync_db.check(&info.postgres);

    h.run("rmpeer node2").await;
    let info = h.peer().await;
    expect_peer(
        &info,
        Role::Sync,
        vec![node(1, 2), node(3, 3)],
        Some(gen1),
    );
    sync_db.check(&info.postgres);

    h.run("unfreeze").await;
    let info = h.peer().await;
    expect_peer(
        &info,
        Role::Primary,
        vec![node(1, 2), node(3, 3)],
        Some(State {
            generation: 2,
            primary: node(1, 2),
            sync: Some(node(3, 3)),
            deposed: vec![node(2, 1)],
            init_wal: pos("0/0000000A"),
            ..State::default()
        }),
    );
    DbExpect::new(Role::Primary)
        .downstream(node(3, 3))
        .xlog("0/00000014")
        .check(&info.postgres);
}

#[tokio::test]
async fn async_follows_upstream_changes() {
    let mut h = Harness::new();
    h.run_all(&[
        "addpeer",
        "addpeer",
        "addpeer",
        "addpeer",
        "addpeer node1",
        "bootstrap node2 node3",
        "startPeer",
    ])
    .await;
    let gen1 = State {
        generation: 1,
        primary: node(2, 1),
        sync: Some(node(3, 2)),
        asyncs: vec![node(4, 3), node(5, 4), node(1, 5)],
        init_wal: zero(),
        ..State::default()
    };
    let info = h.peer().await;
    expect_peer(
        &info,
        Role::Async,
        vec![node(2, 1), node(3, 2), node(4, 3), node(5, 4), node(1, 5)],
        Some(gen1.clone()),
    );
    DbExpect::new(Role::Async)
        .upstream(node(5, 4))
        .check(&info.postgres);

    h.run("rmpeer node5").await;
    let info = h.peer().await;
    expect_peer(
        &info,
        Role::Async,
        vec![node(2, 1), node(3, 2), node(4, 3), node(1, 5)],
        Some(State {
            asyncs: vec![node(4, 3), node(1, 5)],
            ..gen1.clone()
        }),
    );
    DbExpect::new(Role::Async)
        .upstream(node(4, 3))
        .check(&info.postgres);

    h.run("rmpeer node4").await;
    let info = h.peer().await;
    expect_peer(
        &info,
        Role::Async,
        vec![node(2, 1), node(3, 2), node(1, 5)],
        Some(State {
            asyncs: vec![node(1, 5)],
            ..gen1
        }),
    );
    DbExpect::new(Role::Async)
        .upstream(node(3, 2))
        .check(&info.postgres);
}

#[tokio::test]
async fn async_removed_from_state_becomes_unassigned() {
    let mut h = Harness::new();
    h.run_all(&[
        "addpeer",
        "addpeer",
        "addpeer node1",
        "bootstrap node2 node3",
        "startPeer",
    ])
    .await;
    assert_eq!(h.peer().await.peer.role, Role::Async);

    h.run("rmpeer node1").await;
    let info = h.peer().await;
    expect_peer(
        &info,
        Role::Unassigned,
        vec![node(2, 1), node(3, 2), node(1, 3)],
        Some(State {
            generation: 1,
            primary: node(2, 1),
            sync: Some(node(3, 2)),
            init_wal: zero(),
            ..State::default()
        }),
    );
    DbExpect::offline().check(&info.postgres);
}

#[tokio::test]
async fn sync_removed_from_state_becomes_unassigned() {
    let mut h = Harness::new();
    h.run_all(&[
        "addpeer",
        "addpeer node1",
        "addpeer",
        "bootstrap node2 node1",
        "startPeer",
    ])
    .await;
    let info = h.peer().await;
    assert_eq!(info.peer.role, Role::Sync);
    DbExpect::new(Role::Sync)
        .upstream(node(2, 1))
        .downstream(node(3, 3))
        .waiting("0/00000000")
        .check(&info.postgres);

    h.run("rmpeer node1").await;
    let info = h.peer().await;
    expect_peer(
        &info,
        Role::Unassigned,
        vec![node(2, 1), node(1, 2), node(3, 3)],
        Some(State {
            generation: 2,
            primary: node(2, 1),
            sync: Some(node(3, 3)),
            init_wal: zero(),
            ..State::default()
        }),
    );
    DbExpect::offline().check(&info.postgres);
}

#[tokio::test]
async fn primary_adopts_new_instance_id() {
    let mut h = Harness::new();
    // The state names node1 under a stale instance id.
    let mut stale = node(1, 1);
    stale.id = "stale".to_owned();
    h.run("addpeer").await;
    h.set_state(&State {
        generation: 1,
        primary: stale,
        sync: Some(node(2, 1)),
        init_wal: zero(),
        ..State::default()
    })
    .await;
    h.run("startPeer").await;

    let info = h.peer().await;
    assert_eq!(info.peer.role, Role::Primary);
    let state = h.cluster_state().state.unwrap();
    assert_eq!(state.primary, node(1, 2));
    assert_eq!(state.generation, 1);
}

#[tokio::test]
async fn rejected_commands_leave_state_untouched() {
    let mut h = Harness::new();
    assert!(h.sim.run_command("depose").await.is_err());
    assert!(h.sim.run_command("rebuild node2").await.is_err());
    assert!(h.sim.run_command("freeze").await.is_err());
    assert!(h.sim.run_command("rmpeer").await.is_err());
    assert!(h.sim.run_command("setClusterState {not json").await.is_err());
    assert_eq!(h.cluster_state(), DiscoverdState::default());
}
