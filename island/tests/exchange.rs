//! End-to-end exchange tests: real rendezvous server, real islands, real TCP
//! on loopback ephemeral ports.

use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, BufMut, BytesMut};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};

use archipelago_island::{
    ExchangeClient, IslandConfig, RandomSelection, REASON_FOUND_LOCALLY, REASON_GOODBYE,
};
use archipelago_protocol::codec::{Codec, CodecError};
use archipelago_protocol::wire::{self, ControlToken};
use archipelago_protocol::{Population, Slot};
use archipelago_server::{IslandSpec, RendezvousServer, Topology, TopologyFile};

struct U32Codec;

impl Codec<u32> for U32Codec {
    fn encode(&self, individual: &u32, buf: &mut BytesMut) -> Result<(), CodecError> {
        buf.put_u32(*individual);
        Ok(())
    }

    fn decode(&self, buf: &mut &[u8]) -> Result<u32, CodecError> {
        if buf.len() < 4 {
            return Err(CodecError::new("truncated individual"));
        }
        Ok(buf.get_u32())
    }
}

fn island(id: &str, size: usize, destinations: &[&str]) -> IslandSpec {
    IslandSpec {
        id: id.to_string(),
        modulo: 1,
        offset: 0,
        size,
        mailbox_capacity: 8,
        destinations: destinations.iter().map(|d| d.to_string()).collect(),
    }
}

async fn start_server(file: TopologyFile) -> (String, JoinHandle<anyhow::Result<()>>) {
    let topology = Topology::build(file).unwrap();
    let server = RendezvousServer::bind(topology, "127.0.0.1:0").await.unwrap();
    let addr = server.local_addr().unwrap().to_string();
    (addr, tokio::spawn(server.run()))
}

fn client(id: &str, server_addr: &str, seed: u64) -> ExchangeClient<u32> {
    let mut config = IslandConfig::new(id, server_addr);
    config.retry_delay = Duration::from_millis(50);
    config.seed = Some(seed);
    ExchangeClient::new(
        config,
        Arc::new(U32Codec),
        Box::new(RandomSelection::new()),
        Box::new(RandomSelection::new()),
    )
}

fn pop(values: std::ops::Range<u32>) -> Population<u32> {
    Population::new(vec![values.map(Slot::evaluated).collect()])
}

#[tokio::test]
async fn emigrants_travel_and_replace_distinct_residents() {
    let (addr, server) = start_server(TopologyFile {
        islands: vec![island("a", 3, &["b"]), island("b", 3, &[])],
        ..Default::default()
    })
    .await;

    let mut a = client("a", &addr, 1);
    let mut b = client("b", &addr, 2);
    let (ra, rb) = timeout(Duration::from_secs(10), async {
        tokio::join!(a.initialize_contacts(1), b.initialize_contacts(1))
    })
    .await
    .expect("initialization timed out");
    ra.unwrap();
    rb.unwrap();
    assert_eq!(a.live_destinations(), 1);

    let pop_a = pop(100..110);
    let mut pop_b = pop(0..6);
    a.pre_breeding_exchange(&pop_a, 0).await.unwrap();

    // Arrival is asynchronous; poll the mailbox.
    let mut arrived = false;
    for _ in 0..200 {
        if b.mailbox_counts() == vec![3] {
            arrived = true;
            break;
        }
        sleep(Duration::from_millis(10)).await;
    }
    assert!(arrived, "emigrants never reached b's mailbox");

    b.post_breeding_exchange(&mut pop_b, 0).await.unwrap();
    assert_eq!(b.mailbox_counts(), vec![0], "drain must reset the buffer");

    let replaced: Vec<u32> = pop_b.subpops[0]
        .iter()
        .filter(|slot| !slot.evaluated)
        .map(|slot| slot.individual)
        .collect();
    assert_eq!(replaced.len(), 3, "exactly three distinct slots replaced");
    assert!(replaced.iter().all(|&v| (100..110).contains(&v)));

    a.close_contacts(false).await.unwrap();
    b.close_contacts(false).await.unwrap();
    timeout(Duration::from_secs(5), server)
        .await
        .expect("server did not shut down")
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn synchronous_barrier_holds_until_every_island_arrives() {
    let (addr, server) = start_server(TopologyFile {
        islands: vec![
            island("a", 1, &["b"]),
            island("b", 1, &["c"]),
            island("c", 1, &["a"]),
        ],
        synchronous: true,
        sync_modulo: Some(1),
        sync_offset: Some(0),
    })
    .await;

    let mut a = client("a", &addr, 1);
    let mut b = client("b", &addr, 2);
    let mut c = client("c", &addr, 3);
    let (ra, rb, rc) = timeout(Duration::from_secs(10), async {
        tokio::join!(
            a.initialize_contacts(1),
            b.initialize_contacts(1),
            c.initialize_contacts(1),
        )
    })
    .await
    .expect("initialization timed out");
    ra.unwrap();
    rb.unwrap();
    rc.unwrap();

    let ha = tokio::spawn(async move {
        let mut p = pop(0..4);
        a.post_breeding_exchange(&mut p, 0).await.unwrap();
        a
    });
    let hb = tokio::spawn(async move {
        let mut p = pop(0..4);
        b.post_breeding_exchange(&mut p, 0).await.unwrap();
        b
    });
    sleep(Duration::from_millis(200)).await;
    assert!(!ha.is_finished(), "a released before c reached the barrier");
    assert!(!hb.is_finished(), "b released before c reached the barrier");

    let hc = tokio::spawn(async move {
        let mut p = pop(0..4);
        c.post_breeding_exchange(&mut p, 0).await.unwrap();
        c
    });
    let (a, b, c) = timeout(Duration::from_secs(10), async {
        tokio::join!(ha, hb, hc)
    })
    .await
    .expect("barrier never released");
    let (mut a, mut b, mut c) = (a.unwrap(), b.unwrap(), c.unwrap());

    a.close_contacts(false).await.unwrap();
    b.close_contacts(false).await.unwrap();
    c.close_contacts(false).await.unwrap();
    timeout(Duration::from_secs(5), server)
        .await
        .expect("server did not shut down")
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn dead_destination_is_skipped_and_parameters_round_trip() {
    let (addr, server) = start_server(TopologyFile {
        islands: vec![island("a", 3, &["b"]), island("b", 3, &[])],
        ..Default::default()
    })
    .await;

    // A port that refuses connections: bind, note the port, drop.
    let dead_port = {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    };

    // Island b is a bare socket speaking the registration protocol; it
    // advertises the dead port as its mailbox and checks every parameter the
    // server hands back against the topology.
    let server_addr = addr.clone();
    let fake_b = tokio::spawn(async move {
        let mut s = TcpStream::connect(&server_addr).await.unwrap();
        wire::write_string(&mut s, "b").await.unwrap();
        s.flush().await.unwrap();
        assert_eq!(wire::read_count(&mut s).await.unwrap(), 1, "inbound links");
        assert_eq!(wire::read_count(&mut s).await.unwrap(), 8, "mailbox capacity");
        wire::write_string(&mut s, "127.0.0.1").await.unwrap();
        wire::write_i32(&mut s, i32::from(dead_port)).await.unwrap();
        s.flush().await.unwrap();

        assert_eq!(wire::read_i32(&mut s).await.unwrap(), 0, "synchronous flag");
        assert_eq!(wire::read_count(&mut s).await.unwrap(), 1, "modulo");
        assert_eq!(wire::read_count(&mut s).await.unwrap(), 0, "offset");
        assert_eq!(wire::read_count(&mut s).await.unwrap(), 3, "size");
        assert_eq!(wire::read_count(&mut s).await.unwrap(), 0, "destinations");
        wire::write_token(&mut s, ControlToken::Okay).await.unwrap();
        assert_eq!(
            wire::read_token(&mut s).await.unwrap(),
            ControlToken::Run
        );
        s
    });

    let mut a = client("a", &addr, 7);
    timeout(Duration::from_secs(10), a.initialize_contacts(1))
        .await
        .expect("initialization timed out")
        .unwrap();
    assert_eq!(a.live_destinations(), 0, "dead destination must be skipped");

    // Sending toward a dead destination is a silent no-op.
    let population = pop(0..5);
    a.pre_breeding_exchange(&population, 0).await.unwrap();
    assert_eq!(a.live_destinations(), 0);

    let fake_stream = fake_b.await.unwrap();
    drop(fake_stream);
    a.close_contacts(false).await.unwrap();
    timeout(Duration::from_secs(5), server)
        .await
        .expect("server did not shut down")
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn found_on_one_island_says_goodbye_to_all() {
    let (addr, server) = start_server(TopologyFile {
        islands: vec![island("a", 1, &[]), island("b", 1, &[]), island("c", 1, &[])],
        ..Default::default()
    })
    .await;

    let mut a = client("a", &addr, 1);
    let mut b = client("b", &addr, 2);
    let mut c = client("c", &addr, 3);
    let (ra, rb, rc) = timeout(Duration::from_secs(10), async {
        tokio::join!(
            a.initialize_contacts(1),
            b.initialize_contacts(1),
            c.initialize_contacts(1),
        )
    })
    .await
    .expect("initialization timed out");
    ra.unwrap();
    rb.unwrap();
    rc.unwrap();

    assert_eq!(a.run_complete(false).await, None);

    let reason = c.run_complete(true).await;
    assert_eq!(reason.as_deref(), Some(REASON_FOUND_LOCALLY));
    // Sticky: later calls repeat the first reason, whatever is passed in.
    assert_eq!(
        c.run_complete(false).await.as_deref(),
        Some(REASON_FOUND_LOCALLY)
    );

    for island in [&mut a, &mut b] {
        let mut reason = None;
        for _ in 0..200 {
            if let Some(r) = island.run_complete(false).await {
                reason = Some(r);
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(reason.as_deref(), Some(REASON_GOODBYE));
        assert_eq!(
            island.run_complete(false).await.as_deref(),
            Some(REASON_GOODBYE)
        );
    }

    a.close_contacts(false).await.unwrap();
    b.close_contacts(false).await.unwrap();
    c.close_contacts(true).await.unwrap();
    timeout(Duration::from_secs(5), server)
        .await
        .expect("server did not shut down")
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn reinitialization_discards_buffered_migrants_and_reconnects() {
    let file = TopologyFile {
        islands: vec![island("a", 3, &["b"]), island("b", 3, &[])],
        ..Default::default()
    };
    let (addr, server) = start_server(file.clone()).await;

    let mut a = client("a", &addr, 1);
    let mut b = client("b", &addr, 2);
    let (ra, rb) = timeout(Duration::from_secs(10), async {
        tokio::join!(a.initialize_contacts(1), b.initialize_contacts(1))
    })
    .await
    .expect("initialization timed out");
    ra.unwrap();
    rb.unwrap();

    // Leave three migrants sitting in b's mailbox, undrained.
    a.pre_breeding_exchange(&pop(100..110), 0).await.unwrap();
    let mut arrived = false;
    for _ in 0..200 {
        if b.mailbox_counts() == vec![3] {
            arrived = true;
            break;
        }
        sleep(Duration::from_millis(10)).await;
    }
    assert!(arrived, "emigrants never reached b's mailbox");

    // End the first run so its server releases the port.
    assert_eq!(
        a.run_complete(true).await.as_deref(),
        Some(REASON_FOUND_LOCALLY)
    );
    timeout(Duration::from_secs(5), server)
        .await
        .expect("first server did not shut down")
        .unwrap()
        .unwrap();

    // Fresh server on the same address, as after a checkpoint restore.
    let server = RendezvousServer::bind(Topology::build(file).unwrap(), &addr)
        .await
        .unwrap();
    let server = tokio::spawn(server.run());

    let ha = tokio::spawn(async move {
        a.reinitialize_contacts(1).await.unwrap();
        a
    });
    let hb = tokio::spawn(async move {
        b.reinitialize_contacts(1).await.unwrap();
        b
    });
    let (a, b) = timeout(Duration::from_secs(10), async { tokio::join!(ha, hb) })
        .await
        .expect("reinitialization timed out");
    let (mut a, mut b) = (a.unwrap(), b.unwrap());

    // Migrants buffered at restore time are lost, not carried over.
    assert_eq!(b.mailbox_counts(), vec![0]);
    assert_eq!(a.live_destinations(), 1);
    assert_eq!(
        a.run_complete(false).await,
        None,
        "old termination reason must not survive reinitialization"
    );

    // The rebuilt links carry traffic.
    a.pre_breeding_exchange(&pop(200..210), 0).await.unwrap();
    let mut arrived = false;
    for _ in 0..200 {
        if b.mailbox_counts() == vec![3] {
            arrived = true;
            break;
        }
        sleep(Duration::from_millis(10)).await;
    }
    assert!(arrived, "emigrants never reached b's rebuilt mailbox");

    a.close_contacts(false).await.unwrap();
    b.close_contacts(false).await.unwrap();
    timeout(Duration::from_secs(5), server)
        .await
        .expect("server did not shut down")
        .unwrap()
        .unwrap();
}
