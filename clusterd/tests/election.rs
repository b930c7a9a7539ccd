mod common;

use clusterd::raft::Role;
use clusterd::TermId;

use common::*;

#[test]
fn three_nodes_elect_a_single_leader() {
    let mut cluster = SimCluster::new(3);
    cluster.init();

    cluster.run_for(ms(1000));

    let leader = cluster.single_leader();
    let term = cluster.status(leader).term;
    assert!(TermId(0) < term);

    for i in 0..3 {
        let status = cluster.status(i);
        assert_eq!(status.term, term);
        assert_eq!(status.leader, Some(peer_id(leader)));
        if i != leader {
            assert_eq!(status.role, Role::Follower);
        }
    }
    cluster.assert_terms_monotonic();
}

#[test]
fn heartbeats_keep_the_leader_in_place() {
    let mut cluster = SimCluster::new(5);
    cluster.init();
    cluster.run_for(ms(1000));

    let leader = cluster.single_leader();
    let term = cluster.status(leader).term;

    cluster.run_for(ms(10_000));

    assert_eq!(cluster.single_leader(), leader);
    for i in 0..5 {
        assert_eq!(cluster.status(i).term, term);
    }
}

#[test]
fn leader_sees_its_followers() {
    let mut cluster = SimCluster::new(3);
    cluster.init();
    cluster.run_for(ms(1000));

    let leader = cluster.single_leader();
    let follower = (leader + 1) % 3;
    cluster.engine(follower).set_committed_index(42);

    cluster.run_for(ms(200));

    let status = cluster.status(leader);
    let node = status
        .peers
        .iter()
        .find(|n| n.fqdn == peer_id(follower))
        .unwrap();
    assert_eq!(node.role, Role::Follower);
    assert_eq!(node.last_log_index, 42);

    let status = cluster.status(follower);
    let node = status
        .peers
        .iter()
        .find(|n| n.fqdn == peer_id(leader))
        .unwrap();
    assert_eq!(node.role, Role::Leader);
}

#[test]
fn isolated_leader_is_replaced_and_steps_down_after_heal() {
    let mut cluster = SimCluster::new(3);
    cluster.init();
    cluster.run_for(ms(1000));

    let old_leader = cluster.single_leader();
    let old_term = cluster.status(old_leader).term;

    cluster.network.isolate(&peer_id(old_leader));
    cluster.run_for(ms(1000));

    // the old leader doesn't know yet; the rest elected a new one
    let leaders = cluster.leaders();
    assert_eq!(leaders.len(), 2);
    let new_leader = *leaders.iter().find(|i| **i != old_leader).unwrap();
    let new_term = cluster.status(new_leader).term;
    assert!(old_term < new_term);
    assert_eq!(cluster.status(old_leader).term, old_term);

    cluster.network.heal();
    cluster.run_for(ms(1000));

    assert_eq!(cluster.single_leader(), new_leader);
    let status = cluster.status(old_leader);
    assert_eq!(status.role, Role::Follower);
    assert_eq!(status.term, new_term);
    assert_eq!(status.leader, Some(peer_id(new_leader)));
    cluster.assert_terms_monotonic();
}

#[test]
fn minority_partition_never_elects() {
    let mut cluster = SimCluster::new(5);
    cluster.init();
    cluster.run_for(ms(1000));
    let leader = cluster.single_leader();

    // two followers cut off from everyone else
    let minority: Vec<usize> = (0..5).filter(|i| *i != leader).take(2).collect();
    for a in &minority {
        for b in 0..5 {
            if !minority.contains(&b) {
                cluster.network.cut_link(&peer_id(*a), &peer_id(b));
                cluster.network.cut_link(&peer_id(b), &peer_id(*a));
            }
        }
    }

    cluster.run_for(ms(5000));

    assert_eq!(cluster.single_leader(), leader);
    for i in &minority {
        assert_ne!(cluster.status(*i).role, Role::Leader);
    }
    cluster.assert_terms_monotonic();
}

#[test]
fn at_most_one_leader_per_term() {
    let mut cluster = SimCluster::new(5);
    cluster.init();

    // churn: repeatedly isolate whoever leads
    let mut leaders_by_term = std::collections::BTreeMap::new();
    for _ in 0..5 {
        cluster.run_for(ms(1000));
        for i in cluster.leaders() {
            let term = cluster.status(i).term;
            let prev = leaders_by_term.insert(term, i);
            assert!(
                prev.is_none() || prev == Some(i),
                "two leaders in {term}: {prev:?} and {i}"
            );
        }
        cluster.network.heal();
        let leader = cluster.leaders()[0];
        cluster.network.isolate(&peer_id(leader));
    }
    cluster.assert_terms_monotonic();
}

#[test]
fn split_vote_backs_off_then_resolves() {
    let mut cluster = SimCluster::new(4);
    cluster.init();
    cluster.clock.advance(ms(150));

    // everyone else already voted for n1 in term 1
    for i in 1..4 {
        cluster.engine(i).receive_vote(TermId(1), peer_id(1)).unwrap();
    }

    let wait = cluster.engine(0).step();
    let status = cluster.status(0);
    assert_eq!(status.role, Role::Candidate);
    assert_eq!(status.term, TermId(1));
    assert!(wait < sim_config().ping_interval);

    cluster.clock.advance(wait);
    cluster.engine(0).step();
    let status = cluster.status(0);
    assert_eq!(status.role, Role::Leader);
    assert_eq!(status.term, TermId(2));
}

#[test]
fn single_node_cluster_stays_follower() {
    let mut cluster = SimCluster::new(1);
    cluster.init();
    cluster.run_for(ms(5000));

    let status = cluster.status(0);
    assert_eq!(status.role, Role::Follower);
    assert_eq!(status.term, TermId(0));
    assert_eq!(status.cluster_size, 1);
}
