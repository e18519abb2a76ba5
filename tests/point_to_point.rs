//! End-to-end protocol tests: eager and rendezvous paths, completion
//! semantics, and landing-buffer backpressure, all through the
//! deterministic simulation harness.

use bytes::{Bytes, BytesMut};
use rand::Rng;

use courier::{
    Completion, CourierConfig, CourierError, DataType, SimWorld, SourceMatch, TagMatch,
};

/// Threshold of 128 bytes so tests can sit on either side of it.
fn test_config() -> CourierConfig {
    CourierConfig {
        short_msg_length: 128,
        recv_buffer_count: 4,
        ..CourierConfig::default()
    }
}

fn random_payload(len: usize) -> Vec<u8> {
    let mut rng = rand::thread_rng();
    (0..len).map(|_| rng.gen()).collect()
}

fn trace_init() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

fn expect_recv(completion: Completion) -> (courier::RecvStatus, BytesMut) {
    match completion {
        Completion::Recv { status, data } => (status, data),
        Completion::Send => panic!("expected a receive completion"),
    }
}

#[test]
fn test_eager_round_trip_fidelity() {
    trace_init();
    let mut world = SimWorld::bootstrap(2, test_config()).unwrap();
    let payload = random_payload(64);

    let send = world
        .engine_mut(0)
        .isend(Bytes::from(payload.clone()), 64, DataType::U8, 1, 7, 0)
        .unwrap();
    let recv = world
        .engine_mut(1)
        .irecv(
            BytesMut::zeroed(64),
            64,
            DataType::U8,
            SourceMatch::Exact(0),
            TagMatch::Exact(7),
            0,
        )
        .unwrap();

    let (status, data) = expect_recv(world.wait(1, recv).unwrap());
    assert_eq!(&data[..], &payload[..]);
    assert_eq!(status.source, 0);
    assert_eq!(status.tag, 7);
    assert_eq!(status.count, 64);
    assert!(matches!(world.wait(0, send).unwrap(), Completion::Send));
}

#[test]
fn test_rendezvous_round_trip_fidelity() {
    trace_init();
    let mut world = SimWorld::bootstrap(2, test_config()).unwrap();
    // 512 f64 elements = 4096 bytes, well past the 128-byte threshold.
    let payload = random_payload(4096);

    let send = world
        .engine_mut(0)
        .isend(Bytes::from(payload.clone()), 512, DataType::F64, 1, 9, 0)
        .unwrap();
    let recv = world
        .engine_mut(1)
        .irecv(
            BytesMut::zeroed(4096),
            512,
            DataType::F64,
            SourceMatch::Exact(0),
            TagMatch::Exact(9),
            0,
        )
        .unwrap();

    let (status, data) = expect_recv(world.wait(1, recv).unwrap());
    assert_eq!(&data[..], &payload[..]);
    assert_eq!(status.count, 512);
    assert!(matches!(world.wait(0, send).unwrap(), Completion::Send));
}

#[test]
fn test_eager_shape_one_envelope_no_ack() {
    // 64 bytes under a 128-byte threshold: eager path only.
    let mut world = SimWorld::bootstrap(2, test_config()).unwrap();
    let send = world
        .engine_mut(0)
        .isend(Bytes::from(vec![3u8; 64]), 64, DataType::U8, 1, 0, 0)
        .unwrap();
    let recv = world
        .engine_mut(1)
        .irecv(
            BytesMut::zeroed(64),
            64,
            DataType::U8,
            SourceMatch::Exact(0),
            TagMatch::Exact(0),
            0,
        )
        .unwrap();
    world.wait(1, recv).unwrap();
    world.wait(0, send).unwrap();
    world.run_until_idle().unwrap();

    let stats = world.stats();
    assert_eq!(stats.match_envelopes, 1);
    assert_eq!(stats.ack_envelopes, 0);
    assert_eq!(stats.rdma_reads, 0);
    assert_eq!(stats.registrations, 0);
}

#[test]
fn test_rendezvous_shape_registration_match_read_ack() {
    // 4096 bytes over a 128-byte threshold: one registration, one Match,
    // one one-sided read, exactly one Ack.
    let mut world = SimWorld::bootstrap(2, test_config()).unwrap();
    let send = world
        .engine_mut(0)
        .isend(Bytes::from(vec![5u8; 4096]), 4096, DataType::U8, 1, 0, 0)
        .unwrap();
    let recv = world
        .engine_mut(1)
        .irecv(
            BytesMut::zeroed(4096),
            4096,
            DataType::U8,
            SourceMatch::Exact(0),
            TagMatch::Exact(0),
            0,
        )
        .unwrap();
    world.wait(1, recv).unwrap();
    world.wait(0, send).unwrap();
    world.run_until_idle().unwrap();

    let stats = world.stats();
    assert_eq!(stats.registrations, 1);
    assert_eq!(stats.match_envelopes, 1);
    assert_eq!(stats.rdma_reads, 1);
    assert_eq!(stats.ack_envelopes, 1);
}

#[test]
fn test_receive_does_not_complete_before_send() {
    let mut world = SimWorld::bootstrap(2, test_config()).unwrap();
    let recv = world
        .engine_mut(1)
        .irecv(
            BytesMut::zeroed(16),
            16,
            DataType::U8,
            SourceMatch::Any,
            TagMatch::Any,
            0,
        )
        .unwrap();
    world.run_until_idle().unwrap();
    assert!(world.engine_mut(1).test(recv).unwrap().is_none());

    // Only after the send is issued may the receive complete.
    world
        .engine_mut(0)
        .isend(Bytes::from(vec![1u8; 16]), 16, DataType::U8, 1, 0, 0)
        .unwrap();
    let (status, data) = expect_recv(world.wait(1, recv).unwrap());
    assert_eq!(status.source, 0);
    assert_eq!(&data[..], &[1u8; 16]);
}

#[test]
fn test_rendezvous_send_not_done_until_ack() {
    let mut world = SimWorld::bootstrap(2, test_config()).unwrap();
    let payload = random_payload(2048);
    let send = world
        .engine_mut(0)
        .isend(Bytes::from(payload.clone()), 2048, DataType::U8, 1, 3, 0)
        .unwrap();

    // The Match has gone out and sits unexpected at rank 1, but no receive
    // exists, so no read and no Ack: the send must still be pending.
    world.run_until_idle().unwrap();
    assert!(world.engine_mut(0).test(send).unwrap().is_none());
    world.engine_mut(1).poll().unwrap();
    assert_eq!(world.engine(1).unexpected_messages(), 1);

    let recv = world
        .engine_mut(1)
        .irecv(
            BytesMut::zeroed(2048),
            2048,
            DataType::U8,
            SourceMatch::Exact(0),
            TagMatch::Exact(3),
            0,
        )
        .unwrap();
    let (_, data) = expect_recv(world.wait(1, recv).unwrap());
    assert_eq!(&data[..], &payload[..]);
    assert!(matches!(world.wait(0, send).unwrap(), Completion::Send));
}

#[test]
fn test_unexpected_path_returns_identical_data() {
    // Same payload through the posted path and the unexpected path must
    // land identically.
    let mut world = SimWorld::bootstrap(2, test_config()).unwrap();
    let payload = random_payload(100);

    world
        .engine_mut(0)
        .isend(Bytes::from(payload.clone()), 100, DataType::U8, 1, 11, 0)
        .unwrap();
    world.run_until_idle().unwrap();
    world.engine_mut(1).poll().unwrap();
    assert_eq!(world.engine(1).unexpected_messages(), 1);

    let recv = world
        .engine_mut(1)
        .irecv(
            BytesMut::zeroed(100),
            100,
            DataType::U8,
            SourceMatch::Exact(0),
            TagMatch::Exact(11),
            0,
        )
        .unwrap();
    let (status, data) = expect_recv(world.wait(1, recv).unwrap());
    assert_eq!(&data[..], &payload[..]);
    assert_eq!(status.source, 0);
    assert_eq!(status.tag, 11);
    assert_eq!(world.engine(1).unexpected_messages(), 0);
}

#[test]
fn test_landing_pool_backpressure_three_messages_two_buffers() {
    // Two landing buffers, three back-to-back eager messages: the third
    // waits at the NIC until a buffer is reposted, and all three still
    // arrive intact and in order.
    let cfg = CourierConfig {
        recv_buffer_count: 2,
        ..test_config()
    };
    let mut world = SimWorld::bootstrap(2, cfg).unwrap();

    let payloads: Vec<Vec<u8>> = (0..3).map(|i| vec![0x10 + i as u8; 96]).collect();
    for (tag, payload) in payloads.iter().enumerate() {
        world
            .engine_mut(0)
            .isend(
                Bytes::from(payload.clone()),
                96,
                DataType::U8,
                1,
                tag as u32,
                0,
            )
            .unwrap();
    }
    world.run_until_idle().unwrap();
    assert!(world.stats().stalled_arrivals >= 1);

    // Drain the two landed messages into the unexpected queue; the third
    // is still parked at the NIC.
    world.engine_mut(1).poll().unwrap();
    world.engine_mut(1).poll().unwrap();
    assert_eq!(world.engine(1).unexpected_messages(), 2);

    for (tag, payload) in payloads.iter().enumerate() {
        let recv = world
            .engine_mut(1)
            .irecv(
                BytesMut::zeroed(96),
                96,
                DataType::U8,
                SourceMatch::Exact(0),
                TagMatch::Exact(tag as u32),
                0,
            )
            .unwrap();
        let (_, data) = expect_recv(world.wait(1, recv).unwrap());
        assert_eq!(&data[..], &payload[..]);
    }
}

#[test]
fn test_rendezvous_through_unexpected_queue() {
    let mut world = SimWorld::bootstrap(2, test_config()).unwrap();
    let payload = random_payload(8192);

    let send = world
        .engine_mut(0)
        .isend(Bytes::from(payload.clone()), 8192, DataType::U8, 1, 2, 0)
        .unwrap();
    world.run_until_idle().unwrap();
    world.engine_mut(1).poll().unwrap();
    assert_eq!(world.engine(1).unexpected_messages(), 1);

    let recv = world
        .engine_mut(1)
        .irecv(
            BytesMut::zeroed(8192),
            8192,
            DataType::U8,
            SourceMatch::Any,
            TagMatch::Any,
            0,
        )
        .unwrap();
    let (status, data) = expect_recv(world.wait(1, recv).unwrap());
    assert_eq!(&data[..], &payload[..]);
    assert_eq!(status.count, 8192);
    assert!(matches!(world.wait(0, send).unwrap(), Completion::Send));

    let stats = world.stats();
    assert_eq!(stats.rdma_reads, 1);
    assert_eq!(stats.ack_envelopes, 1);
}

#[test]
fn test_mixed_eager_and_rendezvous_between_same_pair() {
    let mut world = SimWorld::bootstrap(2, test_config()).unwrap();
    let small = random_payload(32);
    let large = random_payload(4096);

    let s1 = world
        .engine_mut(0)
        .isend(Bytes::from(small.clone()), 32, DataType::U8, 1, 1, 0)
        .unwrap();
    let s2 = world
        .engine_mut(0)
        .isend(Bytes::from(large.clone()), 4096, DataType::U8, 1, 2, 0)
        .unwrap();

    let r1 = world
        .engine_mut(1)
        .irecv(
            BytesMut::zeroed(32),
            32,
            DataType::U8,
            SourceMatch::Exact(0),
            TagMatch::Exact(1),
            0,
        )
        .unwrap();
    let r2 = world
        .engine_mut(1)
        .irecv(
            BytesMut::zeroed(4096),
            4096,
            DataType::U8,
            SourceMatch::Exact(0),
            TagMatch::Exact(2),
            0,
        )
        .unwrap();

    let (_, d1) = expect_recv(world.wait(1, r1).unwrap());
    let (_, d2) = expect_recv(world.wait(1, r2).unwrap());
    assert_eq!(&d1[..], &small[..]);
    assert_eq!(&d2[..], &large[..]);
    world.wait(0, s1).unwrap();
    world.wait(0, s2).unwrap();
}

#[test]
fn test_reaped_handle_is_stale() {
    let mut world = SimWorld::bootstrap(2, test_config()).unwrap();
    let send = world
        .engine_mut(0)
        .isend(Bytes::from(vec![0u8; 8]), 8, DataType::U8, 1, 0, 0)
        .unwrap();
    world
        .engine_mut(1)
        .irecv(
            BytesMut::zeroed(8),
            8,
            DataType::U8,
            SourceMatch::Any,
            TagMatch::Any,
            0,
        )
        .unwrap();
    world.wait(0, send).unwrap();
    // The slot generation was bumped at reap; the handle must not resolve.
    assert!(matches!(
        world.engine_mut(0).test(send),
        Err(CourierError::StaleRequest { .. })
    ));
}

#[test]
fn test_count_buffer_mismatch_is_fatal() {
    let mut world = SimWorld::bootstrap(2, test_config()).unwrap();
    let err = world
        .engine_mut(0)
        .isend(Bytes::from(vec![0u8; 7]), 8, DataType::U8, 1, 0, 0)
        .unwrap_err();
    assert!(matches!(err, CourierError::CountMismatch { .. }));

    let err = world
        .engine_mut(1)
        .irecv(
            BytesMut::zeroed(16),
            8,
            DataType::U32,
            SourceMatch::Any,
            TagMatch::Any,
            0,
        )
        .unwrap_err();
    assert!(matches!(err, CourierError::CountMismatch { .. }));
}

#[test]
fn test_truncating_receive_is_fatal() {
    // Receiver posts room for 8 bytes, sender declares 16: a contract
    // violation, surfaced when the match is processed.
    let mut world = SimWorld::bootstrap(2, test_config()).unwrap();
    let recv = world
        .engine_mut(1)
        .irecv(
            BytesMut::zeroed(8),
            8,
            DataType::U8,
            SourceMatch::Any,
            TagMatch::Any,
            0,
        )
        .unwrap();
    world
        .engine_mut(0)
        .isend(Bytes::from(vec![0u8; 16]), 16, DataType::U8, 1, 0, 0)
        .unwrap();
    assert!(matches!(
        world.wait(1, recv),
        Err(CourierError::ReceiveTruncation {
            incoming: 16,
            capacity: 8
        })
    ));
}

#[test]
fn test_send_to_unknown_rank_is_fatal() {
    let mut world = SimWorld::bootstrap(2, test_config()).unwrap();
    let err = world
        .engine_mut(0)
        .isend(Bytes::from(vec![0u8; 8]), 8, DataType::U8, 5, 0, 0)
        .unwrap_err();
    assert!(matches!(
        err,
        CourierError::InvalidRank {
            rank: 5,
            world_size: 2
        }
    ));
}

#[test]
fn test_blocking_test_or_wait_drives_rendezvous() {
    // test_or_wait(blocking) arms the readiness wait; the engine then
    // finishes the rendezvous on its own as events arrive.
    let mut world = SimWorld::bootstrap(2, test_config()).unwrap();
    let payload = random_payload(1024);
    let send = world
        .engine_mut(0)
        .isend(Bytes::from(payload.clone()), 1024, DataType::U8, 1, 0, 0)
        .unwrap();
    let recv = world
        .engine_mut(1)
        .irecv(
            BytesMut::zeroed(1024),
            1024,
            DataType::U8,
            SourceMatch::Exact(0),
            TagMatch::Exact(0),
            0,
        )
        .unwrap();

    assert!(world
        .engine_mut(1)
        .test_or_wait(recv, true)
        .unwrap()
        .is_none());
    world.run_until_idle().unwrap();

    let (_, data) = expect_recv(world.engine_mut(1).test(recv).unwrap().unwrap());
    assert_eq!(&data[..], &payload[..]);
    assert!(world.engine_mut(0).test(send).unwrap().is_some());
}
