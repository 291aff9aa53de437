use std::{
    panic,
    sync::atomic::{AtomicUsize, Ordering},
    time::Duration,
};

use bytes::{BufMut, BytesMut};
use nfw_filter::{Action, FilterRule, IpProtocol, RuleSet, Verdict};
use nfw_queue::{Firewall, FirewallConfig, QueueRegistration};
use nfw_wire::{
    netlink::{Header, NLMSG_ERROR, NLMSG_HDRLEN},
    Packet,
};

use crate::mock::{tcp, Call, MockBackend, Reports, EPERM};

fn config() -> FirewallConfig {
    FirewallConfig::new().poll_timeout(Duration::from_millis(20))
}

fn port_filter() -> RuleSet {
    RuleSet::new(vec![FilterRule::new(Action::Drop).protocol(IpProtocol::TCP).dst_port(1337)])
}

#[test]
fn drops_blocked_port_end_to_end() {
    let _ = tracing_subscriber::fmt::try_init();

    let backend = MockBackend::new();
    let firewall =
        Firewall::new(backend.clone(), config().queue(QueueRegistration::new(0, port_filter())));
    firewall.start().unwrap();

    let mut kernel = backend.kernel();
    kernel.send(&[Packet::new(0, 1, tcp(1337, b"")), Packet::new(0, 2, tcp(80, b""))]);

    assert_eq!(
        backend.wait_for_verdicts(2),
        vec![(0, 1, Verdict::Drop), (0, 2, Verdict::Accept)]
    );

    firewall.stop();
}

#[test]
fn every_packet_gets_exactly_one_verdict() {
    let backend = MockBackend::new();
    let firewall = Firewall::new(
        backend.clone(),
        config()
            .queue(QueueRegistration::new(0, RuleSet::default()))
            .queue(QueueRegistration::new(1, port_filter())),
    );
    firewall.start().unwrap();

    let headerless = Packet { queue: 1, payload: tcp(1337, b"").into(), ..Default::default() };

    let mut kernel = backend.kernel();
    kernel.send(&[
        // Not IPv4 at all.
        Packet::new(0, 10, &b"\x00\x01"[..]),
        // Copy mode without payload.
        Packet::new(1, 11, &b""[..]),
        // Nobody registered queue 9.
        Packet::new(9, 12, tcp(1337, b"")),
    ]);
    kernel.send(&[headerless]);

    let verdicts = backend.wait_for_verdicts(4);
    assert_eq!(
        verdicts,
        vec![
            (0, 10, Verdict::Accept),
            (1, 11, Verdict::Accept),
            (9, 12, Verdict::Accept),
            (1, 0, Verdict::Drop),
        ]
    );

    // Nothing else trickles in.
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(backend.verdicts().len(), 4);

    firewall.stop();
}

#[test]
fn routes_packets_to_their_queue() {
    let backend = MockBackend::new();
    let firewall = Firewall::new(
        backend.clone(),
        config()
            .queue(QueueRegistration::new(1, |_: &[u8]| Verdict::Drop))
            .queue(QueueRegistration::new(2, |_: &[u8]| Verdict::Accept)),
    );
    firewall.start().unwrap();

    let mut kernel = backend.kernel();
    kernel.send(&[Packet::new(2, 1, tcp(80, b"")), Packet::new(1, 2, tcp(80, b""))]);
    kernel.send(&[Packet::new(2, 3, tcp(80, b""))]);

    assert_eq!(
        backend.wait_for_verdicts(3),
        vec![(2, 1, Verdict::Accept), (1, 2, Verdict::Drop), (2, 3, Verdict::Accept)]
    );

    firewall.stop();
}

#[test]
fn packets_are_handled_in_arrival_order() {
    let seen = std::sync::Arc::new(AtomicUsize::new(0));
    let counter = std::sync::Arc::clone(&seen);

    let backend = MockBackend::new();
    let firewall = Firewall::new(
        backend.clone(),
        config().queue(QueueRegistration::new(0, move |packet: &[u8]| {
            counter.fetch_add(1, Ordering::SeqCst);
            if packet.len() % 2 == 0 {
                Verdict::Accept
            } else {
                Verdict::Drop
            }
        })),
    );
    firewall.start().unwrap();

    let mut kernel = backend.kernel();
    for id in 0..32u32 {
        let payload = vec![0u8; 40 + id as usize];
        kernel.send(&[Packet::new(0, id, payload)]);
    }

    let verdicts = backend.wait_for_verdicts(32);
    let expected: Vec<_> = (0..32u32)
        .map(|id| (0, id, if id % 2 == 0 { Verdict::Accept } else { Verdict::Drop }))
        .collect();
    assert_eq!(verdicts, expected);
    assert_eq!(seen.load(Ordering::SeqCst), 32);

    firewall.stop();
}

#[test]
fn panicking_handler_accepts_and_reports() {
    let reports = Reports::default();
    let backend = MockBackend::new();
    let firewall = Firewall::new(
        backend.clone(),
        config().queue(QueueRegistration::new(0, |_: &[u8]| -> Verdict { panic!("boom") })),
    )
    .with_reporter(reports.clone());

    // Keep the expected panic out of the test output.
    let hook = panic::take_hook();
    panic::set_hook(Box::new(|_| {}));

    firewall.start().unwrap();
    let mut kernel = backend.kernel();
    kernel.send(&[Packet::new(0, 5, tcp(80, b"")), Packet::new(0, 6, tcp(80, b""))]);

    let verdicts = backend.wait_for_verdicts(2);
    panic::set_hook(hook);

    assert_eq!(verdicts, vec![(0, 5, Verdict::Accept), (0, 6, Verdict::Accept)]);
    assert_eq!(reports.operations(), vec!["handler", "handler"]);

    firewall.stop();
}

#[test]
fn failed_verdicts_are_reported_not_retried() {
    let reports = Reports::default();
    let backend = MockBackend::new().failing(|f| f.verdict = true);
    let firewall =
        Firewall::new(backend.clone(), config().queue(QueueRegistration::new(0, port_filter())))
            .with_reporter(reports.clone());
    firewall.start().unwrap();

    let mut kernel = backend.kernel();
    kernel.send(&[Packet::new(0, 1, tcp(1337, b""))]);
    kernel.send(&[Packet::new(0, 2, tcp(80, b""))]);

    assert_eq!(backend.wait_for_verdicts(2).len(), 2);
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(backend.verdicts().len(), 2);

    let all = reports.all();
    assert_eq!(all.len(), 2);
    assert!(all.iter().all(|(op, _, code)| op == "verdict" && *code == EPERM));

    // The worker kept running through the failures.
    assert!(firewall.is_running());
    firewall.stop();
}

#[test]
fn kernel_errors_and_garbage_do_not_stop_the_worker() {
    let reports = Reports::default();
    let backend = MockBackend::new();
    let firewall =
        Firewall::new(backend.clone(), config().queue(QueueRegistration::new(0, port_filter())))
            .with_reporter(reports.clone());
    firewall.start().unwrap();

    let mut kernel = backend.kernel();

    let mut error = BytesMut::new();
    Header { len: (NLMSG_HDRLEN + 4 + NLMSG_HDRLEN) as u32, ty: NLMSG_ERROR, flags: 0, seq: 7, pid: 0 }
        .put(&mut error);
    error.put_i32_ne(-EPERM);
    Header { len: NLMSG_HDRLEN as u32, ty: 0, flags: 0, seq: 7, pid: 0 }.put(&mut error);
    kernel.send_raw(&error);

    // Claims to be longer than the datagram.
    let mut garbage = BytesMut::new();
    Header { len: 4096, ty: 0x0300, flags: 0, seq: 0, pid: 0 }.put(&mut garbage);
    garbage.put_slice(&[0xaa; 16]);
    kernel.send_raw(&garbage);

    kernel.send(&[Packet::new(0, 3, tcp(1337, b""))]);

    assert_eq!(backend.wait_for_verdicts(1), vec![(0, 3, Verdict::Drop)]);
    let all = reports.all();
    assert_eq!(all.len(), 1);
    assert_eq!((all[0].0.as_str(), all[0].2), ("kernel", EPERM));
    assert!(!backend.calls().contains(&Call::Close));

    firewall.stop();
}

#[test]
fn packets_cut_short_by_the_receive_buffer_are_accepted() {
    let backend = MockBackend::new();
    let firewall = Firewall::new(
        backend.clone(),
        config().recv_buffer_size(512).queue(QueueRegistration::new(0, |_: &[u8]| Verdict::Drop)),
    );
    firewall.start().unwrap();

    let mut kernel = backend.kernel();
    kernel.send(&[Packet::new(0, 77, tcp(80, &[b'a'; 1400]))]);
    kernel.send(&[Packet::new(0, 78, tcp(80, b""))]);

    // The cut packet can't be classified, the next one is handled normally.
    assert_eq!(
        backend.wait_for_verdicts(2),
        vec![(0, 77, Verdict::Accept), (0, 78, Verdict::Drop)]
    );

    firewall.stop();
}

#[test]
fn packets_after_a_broken_frame_are_still_answered() {
    let backend = MockBackend::new();
    let firewall =
        Firewall::new(backend.clone(), config().queue(QueueRegistration::new(0, port_filter())));
    firewall.start().unwrap();

    let mut datagram = BytesMut::new();
    // A packet message too short to hold its nfgenmsg, padded to alignment.
    Header { len: NLMSG_HDRLEN as u32 + 2, ty: 0x0300, flags: 0, seq: 1, pid: 0 }.put(&mut datagram);
    datagram.put_bytes(0, 4);
    Packet::new(0, 9, tcp(1337, b"")).encode(2, &mut datagram);
    Packet::new(0, 10, tcp(80, b"")).encode(3, &mut datagram);

    let kernel = backend.kernel();
    kernel.send_raw(&datagram);

    assert_eq!(
        backend.wait_for_verdicts(2),
        vec![(0, 9, Verdict::Drop), (0, 10, Verdict::Accept)]
    );

    firewall.stop();
}
