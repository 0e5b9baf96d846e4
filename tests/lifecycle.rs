//! End-to-end lifecycle tests: a resolver driven by a hand-cranked event
//! loop against loopback stand-ins for upstream servers.

mod common;

use common::*;
use redns::{
    Error, Housekeeping, Rcode, RecordData, RecordType, Reply, ReplyEntry,
    RequestState, Resolver,
};
use std::io::Write;
use std::net::Ipv4Addr;
use std::rc::Rc;
use std::time::Duration;

/// A resolver wired to a mock loop and one fake upstream.
fn setup(upstream: &FakeServer) -> (Rc<Resolver>, Rc<MockLoop>) {
    let mock = MockLoop::new();
    let resolver = Resolver::new();
    resolver.bind_event_loop(mock.clone());
    resolver
        .add_server("127.0.0.1", upstream.port(), 0, 1)
        .unwrap();
    resolver.init().unwrap();
    (resolver, mock)
}

#[test]
fn resolves_a_single_a_record() {
    let upstream = FakeServer::start();
    let (resolver, mock) = setup(&upstream);

    let (slot, callback) = capture();
    let handle = resolver
        .request()
        .question("example.com", RecordType::A)
        .timeout(Duration::from_secs(1))
        .submit(callback)
        .unwrap();
    assert_eq!(handle.state(), RequestState::WaitReply);

    let (query, peer) = upstream.recv_query();
    let reply = reply_from_query(&query, QR, 1, &a_answer(3600, [93, 184, 216, 34]));
    upstream.udp.send_to(&reply, peer).unwrap();

    resolver.on_read(&mock.read_ctx(0));

    let reply = slot.borrow_mut().take().expect("callback did not fire");
    assert_eq!(reply.rcode, Rcode::NoError);
    assert!(!reply.truncated);
    assert!(!reply.authenticated);
    assert_eq!(reply.entries.len(), 1);
    assert_eq!(reply.entries[0].ttl, 3600);
    assert_eq!(
        reply.entries[0].data,
        RecordData::A(Ipv4Addr::new(93, 184, 216, 34))
    );
    assert_eq!(handle.state(), RequestState::Replied);
    // Delivery cancelled the request's timer.
    assert_eq!(mock.active_timers(), 0);
}

#[test]
fn truncated_udp_reply_is_retried_over_tcp() {
    let upstream = FakeServer::start();
    let (resolver, mock) = setup(&upstream);

    let (slot, callback) = capture();
    let handle = resolver
        .request()
        .question("example.com", RecordType::A)
        .timeout(Duration::from_secs(1))
        .submit(callback)
        .unwrap();

    // The UDP attempt comes back truncated and empty.
    let (query, peer) = upstream.recv_query();
    let udp_id = u16::from_be_bytes([query[0], query[1]]);
    let truncated = reply_from_query(&query, QR | TC, 0, &[]);
    upstream.udp.send_to(&truncated, peer).unwrap();
    resolver.on_read(&mock.read_ctx(0));

    // Not delivered; rescheduled over TCP instead.
    assert!(slot.borrow().is_none());
    assert_eq!(handle.state(), RequestState::Tcp);

    let mut stream = upstream.accept();
    resolver.on_write(&mock.last_write_ctx());

    let tcp_query = read_frame(&mut stream);
    let tcp_id = u16::from_be_bytes([tcp_query[0], tcp_query[1]]);
    assert_ne!(tcp_id, udp_id);

    let full = reply_from_query(&tcp_query, QR, 1, &a_answer(300, [93, 184, 216, 34]));
    stream.write_all(&frame(&full)).unwrap();
    resolver.on_read(&mock.read_ctx(1));

    let reply = slot.borrow_mut().take().expect("callback did not fire");
    assert_eq!(reply.rcode, Rcode::NoError);
    assert!(!reply.truncated);
    assert_eq!(
        reply.entries[0].data,
        RecordData::A(Ipv4Addr::new(93, 184, 216, 34))
    );
    // The flushed output chain dropped its writable interest.
    assert_eq!(mock.active_writes(), 0);
}

#[test]
fn truncated_reply_is_delivered_when_no_tcp_channel_exists() {
    let upstream = FakeServer::start();
    let mock = MockLoop::new();
    let resolver = Resolver::new();
    resolver.bind_event_loop(mock.clone());
    let server = resolver
        .add_server("127.0.0.1", upstream.port(), 0, 1)
        .unwrap();
    server.set_tcp_channel_count(0);
    resolver.init().unwrap();

    let (slot, callback) = capture();
    let handle = resolver
        .request()
        .question("example.com", RecordType::A)
        .submit(callback)
        .unwrap();

    let (query, peer) = upstream.recv_query();
    let truncated = reply_from_query(&query, QR | TC, 0, &[]);
    upstream.udp.send_to(&truncated, peer).unwrap();
    resolver.on_read(&mock.read_ctx(0));

    let reply = slot.borrow_mut().take().expect("callback did not fire");
    assert!(reply.truncated);
    assert_eq!(handle.state(), RequestState::Replied);
}

#[test]
fn silent_server_fails_over_to_the_second() {
    let server_a = FakeServer::start();
    let server_b = FakeServer::start();
    let mock = MockLoop::new();
    let resolver = Resolver::new();
    resolver.bind_event_loop(mock.clone());
    resolver
        .add_server("127.0.0.1", server_a.port(), 0, 1)
        .unwrap();
    resolver
        .add_server("127.0.0.1", server_b.port(), 0, 1)
        .unwrap();
    resolver.init().unwrap();

    let (slot, callback) = capture();
    resolver
        .request()
        .question("example.com", RecordType::A)
        .timeout(Duration::from_millis(100))
        .retransmits(2)
        .submit(callback)
        .unwrap();

    // Server A sees the query and stays silent.
    let (query_a, _) = server_a.recv_query();

    // The timer fires: the request moves to server B under a new ID.
    resolver.on_timer(&mock.last_timer_ctx());
    let (query_b, peer_b) = server_b.recv_query();
    assert_ne!(query_a[..2], query_b[..2]);

    let reply = reply_from_query(&query_b, QR, 1, &a_answer(60, [10, 0, 0, 7]));
    server_b.udp.send_to(&reply, peer_b).unwrap();
    resolver.on_read(&mock.read_ctx(1));

    let reply = slot.borrow_mut().take().expect("callback did not fire");
    assert_eq!(reply.rcode, Rcode::NoError);
    assert_eq!(reply.entries[0].data, RecordData::A(Ipv4Addr::new(10, 0, 0, 7)));
}

#[test]
fn exhausted_retransmits_time_out() {
    let server_a = FakeServer::start();
    let server_b = FakeServer::start();
    let mock = MockLoop::new();
    let resolver = Resolver::new();
    resolver.bind_event_loop(mock.clone());
    resolver
        .add_server("127.0.0.1", server_a.port(), 0, 1)
        .unwrap();
    resolver
        .add_server("127.0.0.1", server_b.port(), 0, 1)
        .unwrap();
    resolver.init().unwrap();

    let (slot, callback) = capture();
    resolver
        .request()
        .question("example.com", RecordType::A)
        .timeout(Duration::from_millis(100))
        .retransmits(2)
        .submit(callback)
        .unwrap();

    server_a.recv_query();
    resolver.on_timer(&mock.last_timer_ctx());
    server_b.recv_query();
    resolver.on_timer(&mock.last_timer_ctx());

    let reply = slot.borrow_mut().take().expect("callback did not fire");
    assert_eq!(reply.rcode, Rcode::Timeout);
    assert!(reply.entries.is_empty());
    assert_eq!(mock.active_timers(), 0);
}

#[test]
fn fake_reply_is_delivered_without_socket_traffic() {
    let upstream = FakeServer::start();
    let (resolver, mock) = setup(&upstream);
    resolver
        .set_fake_reply(
            "localhost.",
            RecordType::A,
            Rcode::NoError,
            vec![ReplyEntry::new(0, RecordData::A(Ipv4Addr::new(127, 0, 0, 1)))],
        )
        .unwrap();

    let (slot, callback) = capture();
    let handle = resolver
        .request()
        .question("localhost", RecordType::A)
        .submit(callback)
        .unwrap();
    assert_eq!(handle.state(), RequestState::Fake);

    // Nothing went out on the wire.
    assert!(upstream.try_recv_query(Duration::from_millis(100)).is_none());

    // The reply arrives on the next writable tick.
    resolver.on_write(&mock.last_write_ctx());
    let reply = slot.borrow_mut().take().expect("callback did not fire");
    assert_eq!(reply.rcode, Rcode::NoError);
    assert_eq!(
        reply.entries[0].data,
        RecordData::A(Ipv4Addr::new(127, 0, 0, 1))
    );
    assert!(upstream.try_recv_query(Duration::from_millis(50)).is_none());
}

#[test]
fn multi_question_requests_round_trip_with_compression() {
    let upstream = FakeServer::start();
    let (resolver, mock) = setup(&upstream);

    let (slot, callback) = capture();
    resolver
        .request()
        .question("example.com", RecordType::A)
        .question("www.example.com", RecordType::A)
        .submit(callback)
        .unwrap();

    let (query, peer) = upstream.recv_query();
    assert_eq!(u16::from_be_bytes([query[4], query[5]]), 2);
    let reply = reply_from_query(&query, QR, 1, &a_answer(60, [192, 0, 2, 1]));
    upstream.udp.send_to(&reply, peer).unwrap();
    resolver.on_read(&mock.read_ctx(0));

    let reply = slot.borrow_mut().take().expect("callback did not fire");
    assert_eq!(reply.rcode, Rcode::NoError);
    assert_eq!(reply.entries.len(), 1);
}

#[test]
fn dot_only_names_are_rejected() {
    let upstream = FakeServer::start();
    let (resolver, _mock) = setup(&upstream);

    let result = resolver
        .request()
        .question(".", RecordType::A)
        .submit(|_: Reply| {});
    assert!(matches!(result, Err(Error::InvalidName)));

    let result = resolver
        .request()
        .question("...", RecordType::A)
        .submit(|_: Reply| {});
    assert!(matches!(result, Err(Error::InvalidName)));
}

#[test]
fn requests_without_questions_are_rejected() {
    let upstream = FakeServer::start();
    let (resolver, _mock) = setup(&upstream);
    let result = resolver.request().submit(|_: Reply| {});
    assert!(matches!(result, Err(Error::NoQuestions)));
}

#[test]
fn uninitialized_resolvers_reject_requests() {
    let resolver = Resolver::new();
    let result = resolver
        .request()
        .question("example.com", RecordType::A)
        .submit(|_: Reply| {});
    assert!(matches!(result, Err(Error::NotInitialized)));
}

#[test]
fn short_tcp_length_prefix_resets_the_channel() {
    let upstream = FakeServer::start();
    let (resolver, mock) = setup(&upstream);

    let (slot, callback) = capture();
    resolver
        .request()
        .question("example.com", RecordType::A)
        .timeout(Duration::from_millis(100))
        .submit(callback)
        .unwrap();

    let (query, peer) = upstream.recv_query();
    let truncated = reply_from_query(&query, QR | TC, 0, &[]);
    upstream.udp.send_to(&truncated, peer).unwrap();
    resolver.on_read(&mock.read_ctx(0));

    let mut stream = upstream.accept();
    resolver.on_write(&mock.last_write_ctx());
    read_frame(&mut stream);

    // A frame shorter than a DNS header kills the channel.
    stream.write_all(&[0, 5, 1, 2, 3, 4, 5]).unwrap();
    let reads_before = mock.active_reads();
    resolver.on_read(&mock.read_ctx(1));
    assert_eq!(mock.active_reads(), reads_before - 1);

    // No partial parse surfaced; the request only times out.
    assert!(slot.borrow().is_none());
    resolver.on_timer(&mock.last_timer_ctx());
    let reply = slot.borrow_mut().take().expect("callback did not fire");
    assert_eq!(reply.rcode, Rcode::Timeout);
}

#[test]
fn overused_channels_are_replaced_but_still_drain() {
    let upstream = FakeServer::start();
    let mock = MockLoop::new();
    let resolver = Resolver::new();
    resolver.bind_event_loop(mock.clone());
    resolver
        .add_server("127.0.0.1", upstream.port(), 0, 1)
        .unwrap();
    resolver.set_max_io_uses(1, Duration::from_secs(10));
    resolver.init().unwrap();
    assert_eq!(mock.active_periodics(), 2);

    let (slot_a, callback_a) = capture();
    let (slot_b, callback_b) = capture();
    resolver
        .request()
        .question("one.example.com", RecordType::A)
        .submit(callback_a)
        .unwrap();
    resolver
        .request()
        .question("two.example.com", RecordType::A)
        .submit(callback_b)
        .unwrap();

    // Two uses exceed the ceiling of one: the channel is replaced.
    let reads_before = mock.reads_total();
    resolver.on_periodic(Housekeeping::ChannelRefresh);
    assert_eq!(mock.reads_total(), reads_before + 1);

    // Both in-flight requests still get their replies on the old channel.
    for _ in 0..2 {
        let (query, peer) = upstream.recv_query();
        let reply = reply_from_query(&query, QR, 1, &a_answer(60, [192, 0, 2, 9]));
        upstream.udp.send_to(&reply, peer).unwrap();
    }
    resolver.on_read(&mock.read_ctx(0));

    assert!(slot_a.borrow().is_some());
    assert!(slot_b.borrow().is_some());
}

#[test]
fn authenticated_replies_surface_the_ad_bit() {
    let upstream = FakeServer::start();
    let (resolver, mock) = setup(&upstream);

    let (slot, callback) = capture();
    resolver
        .request()
        .question("example.com", RecordType::A)
        .submit(callback)
        .unwrap();

    let (query, peer) = upstream.recv_query();
    let reply = reply_from_query(&query, QR | AD, 1, &a_answer(60, [192, 0, 2, 2]));
    upstream.udp.send_to(&reply, peer).unwrap();
    resolver.on_read(&mock.read_ctx(0));

    let reply = slot.borrow_mut().take().expect("callback did not fire");
    assert!(reply.authenticated);
}

#[test]
fn callbacks_may_submit_new_requests() {
    let upstream = FakeServer::start();
    let (resolver, mock) = setup(&upstream);

    let resolver_again = resolver.clone();
    let (slot, callback) = capture();
    resolver
        .request()
        .question("first.example.com", RecordType::A)
        .submit(move |_| {
            resolver_again
                .request()
                .question("second.example.com", RecordType::A)
                .submit(callback)
                .unwrap();
        })
        .unwrap();

    let (query, peer) = upstream.recv_query();
    let reply = reply_from_query(&query, QR, 1, &a_answer(60, [192, 0, 2, 3]));
    upstream.udp.send_to(&reply, peer).unwrap();
    resolver.on_read(&mock.read_ctx(0));

    // The nested request went out on the wire.
    let (query, peer) = upstream.recv_query();
    let reply = reply_from_query(&query, QR, 1, &a_answer(60, [192, 0, 2, 4]));
    upstream.udp.send_to(&reply, peer).unwrap();
    resolver.on_read(&mock.read_ctx(0));

    let reply = slot.borrow_mut().take().expect("nested callback did not fire");
    assert_eq!(reply.rcode, Rcode::NoError);
}

#[test]
fn shutdown_releases_registrations() {
    let upstream = FakeServer::start();
    let (resolver, mock) = setup(&upstream);

    resolver
        .request()
        .question("example.com", RecordType::A)
        .submit(|_: Reply| {})
        .unwrap();
    upstream.recv_query();

    drop(resolver);
    assert_eq!(mock.active_reads(), 0);
    assert_eq!(mock.active_writes(), 0);
    assert_eq!(mock.active_periodics(), 0);
}
