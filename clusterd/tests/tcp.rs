mod common;

use std::io::{Cursor, Read, Write};
use std::net::TcpStream;
use std::thread;
use std::time::{Duration, Instant};

use binrw::BinRead;
use clusterd::api::{
    ConnectionHello, FrameHeader, PeerName, Request, Response, VoteRequest, VoteResponse,
};
use clusterd::config::RaftConfig;
use clusterd::TermId;
use clusterd::peers::PeerDescriptor;
use clusterd::raft::Role;

use common::*;

fn tcp_config() -> RaftConfig {
    RaftConfig::builder()
        .election_timeout(ms(300))
        .ping_interval(ms(100))
        .election_retry_delay(ms(100))
        .rpc_timeout(ms(500))
        .connect_timeout(ms(500))
        .reconnect_interval(ms(200))
        .build()
}

fn wait_for(deadline: Duration, mut f: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < deadline {
        if f() {
            return true;
        }
        thread::sleep(ms(50));
    }
    false
}

#[test]
fn three_nodes_over_tcp() -> anyhow::Result<()> {
    let nodes = (0..3)
        .map(|i| TestClusterd::new(peer_id(i), tcp_config()))
        .collect::<anyhow::Result<Vec<_>>>()?;

    // addresses are only known after binding
    let members: Vec<PeerDescriptor> = nodes
        .iter()
        .enumerate()
        .map(|(i, node)| PeerDescriptor::new(peer_id(i).as_str(), node.local_addr().to_string()))
        .collect();
    for node in &nodes {
        node.node().get_ctrl().set_peers(members.clone());
    }

    let leaders = || {
        nodes
            .iter()
            .enumerate()
            .filter(|(_, n)| n.node().get_ctrl().status().role == Role::Leader)
            .map(|(i, _)| i)
            .collect::<Vec<_>>()
    };

    assert!(
        wait_for(Duration::from_secs(20), || leaders().len() == 1),
        "no leader elected"
    );
    let leader = leaders()[0];
    let term = nodes[leader].node().get_ctrl().status().term;

    assert!(
        wait_for(Duration::from_secs(10), || {
            nodes.iter().all(|n| {
                let status = n.node().get_ctrl().status();
                status.term == term && status.leader == Some(peer_id(leader))
            })
        }),
        "followers did not catch up with the leader"
    );

    Ok(())
}

#[test]
fn stopped_leader_is_replaced() -> anyhow::Result<()> {
    let mut nodes = (0..3)
        .map(|i| TestClusterd::new(peer_id(i), tcp_config()).map(Some))
        .collect::<anyhow::Result<Vec<_>>>()?;

    let members: Vec<PeerDescriptor> = nodes
        .iter()
        .flatten()
        .enumerate()
        .map(|(i, node)| PeerDescriptor::new(peer_id(i).as_str(), node.local_addr().to_string()))
        .collect();
    for node in nodes.iter().flatten() {
        node.node().get_ctrl().set_peers(members.clone());
    }

    let leader = |nodes: &[Option<TestClusterd>]| {
        nodes
            .iter()
            .enumerate()
            .filter_map(|(i, n)| n.as_ref().map(|n| (i, n.node().get_ctrl().status())))
            .find(|(_, status)| status.role == Role::Leader)
    };

    assert!(
        wait_for(Duration::from_secs(20), || leader(&nodes).is_some()),
        "no leader elected"
    );
    let (old_leader, old_status) = leader(&nodes).unwrap();

    nodes[old_leader] = None;

    assert!(
        wait_for(Duration::from_secs(20), || {
            leader(&nodes).map_or(false, |(i, status)| {
                i != old_leader && old_status.term < status.term
            })
        }),
        "no new leader after the old one stopped"
    );

    Ok(())
}

#[test]
fn request_header_split_across_idle_polls_is_served() -> anyhow::Result<()> {
    let node = TestClusterd::new(peer_id(0), tcp_config())?;

    let mut stream = TcpStream::connect(node.local_addr())?;
    stream.set_read_timeout(Some(Duration::from_secs(5)))?;
    let mut hello = [0u8; ConnectionHello::BYTE_SIZE];
    stream.read_exact(&mut hello)?;

    let frame = Request::Vote(VoteRequest {
        term: TermId(1),
        candidate: PeerName::from("n1.test"),
    })
    .to_frame()?;

    // part of the header, then silence longer than the server's shutdown poll
    stream.write_all(&frame[..2])?;
    thread::sleep(ms(1200));
    stream.write_all(&frame[2..])?;

    let mut header = [0u8; FrameHeader::BYTE_SIZE];
    stream.read_exact(&mut header)?;
    let header = FrameHeader::read(&mut Cursor::new(&header))?;
    let mut body = vec![0u8; usize::try_from(header.len)?];
    stream.read_exact(&mut body)?;

    match Response::from_frame_body(&body)? {
        Response::Vote(VoteResponse::Decided { .. } | VoteResponse::Unwilling) => {}
        other => panic!("unexpected response: {other:?}"),
    }

    Ok(())
}
