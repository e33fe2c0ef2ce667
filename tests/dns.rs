use std::cell::RefCell;
use std::net::{IpAddr, UdpSocket};
use std::rc::Rc;
use std::thread;
use std::time::Duration;

use evio::dns::{DnsConfig, DnsOutcome, DnsResolver, QueryType};
use evio::{EventLoop, SockAddr};

mod util;
use util::{arm_watchdog, init};

/// Minimal wire helpers for the mock nameserver side; the crate is the
/// implementation under test, so the fixtures are built by hand.
mod fixture {
    pub fn id(query: &[u8]) -> [u8; 2] {
        [query[0], query[1]]
    }

    /// Offset just past the question section of a single-question query.
    pub fn question_end(query: &[u8]) -> usize {
        let mut pos = 12;
        while query[pos] != 0 {
            pos += query[pos] as usize + 1;
        }
        pos + 1 + 4
    }

    pub fn qtype(query: &[u8]) -> u16 {
        let pos = question_end(query) - 4;
        u16::from_be_bytes([query[pos], query[pos + 1]])
    }

    /// Reply header plus the echoed question, rcode/ancount as given.
    pub fn reply_base(query: &[u8], rcode: u8, ancount: u16) -> Vec<u8> {
        let mut reply = Vec::new();
        reply.extend_from_slice(&id(query));
        reply.extend_from_slice(&[0x81, 0x80 | rcode]); // QR | RD | RA | rcode
        reply.extend_from_slice(&1u16.to_be_bytes()); // qdcount
        reply.extend_from_slice(&ancount.to_be_bytes());
        reply.extend_from_slice(&[0, 0, 0, 0]); // nscount, arcount
        reply.extend_from_slice(&query[12..question_end(query)]);
        reply
    }

    /// One answer record whose name is a pointer to the question name.
    pub fn answer(reply: &mut Vec<u8>, rtype: u16, ttl: u32, rdata: &[u8]) {
        reply.extend_from_slice(&[0xc0, 12]);
        reply.extend_from_slice(&rtype.to_be_bytes());
        reply.extend_from_slice(&1u16.to_be_bytes()); // class IN
        reply.extend_from_slice(&ttl.to_be_bytes());
        reply.extend_from_slice(&(rdata.len() as u16).to_be_bytes());
        reply.extend_from_slice(rdata);
    }

    /// Uncompressed wire form of a dotted name.
    pub fn wire_name(name: &str) -> Vec<u8> {
        let mut out = Vec::new();
        for label in name.split('.').filter(|l| !l.is_empty()) {
            out.push(label.len() as u8);
            out.extend_from_slice(label.as_bytes());
        }
        out.push(0);
        out
    }
}

/// Starts a mock nameserver answering `exchanges` queries through `serve`.
fn mock_nameserver<F>(exchanges: usize, serve: F) -> (SockAddr, thread::JoinHandle<()>)
where
    F: Fn(&[u8]) -> Vec<u8> + Send + 'static,
{
    let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
    let addr = SockAddr::from_std(socket.local_addr().unwrap());
    socket
        .set_read_timeout(Some(Duration::from_secs(10)))
        .unwrap();

    let handle = thread::spawn(move || {
        let mut buf = [0u8; 1536];
        for _ in 0..exchanges {
            let (len, peer) = socket.recv_from(&mut buf).expect("no query arrived");
            let reply = serve(&buf[..len]);
            socket.send_to(&reply, peer).unwrap();
        }
    });
    (addr, handle)
}

fn resolver_for(evloop: &mut EventLoop, nameserver: SockAddr) -> DnsResolver {
    let config = DnsConfig {
        nameservers: vec![nameserver],
        domain: None,
        resolv_conf: None,
    };
    DnsResolver::with_config(evloop, config).unwrap()
}

#[test]
fn nxdomain_is_delivered_once() {
    init();
    let mut evloop = EventLoop::new().unwrap();
    arm_watchdog(&mut evloop, Duration::from_secs(10));

    let (ns_addr, server) = mock_nameserver(1, |query| fixture::reply_base(query, 3, 0));
    let resolver = resolver_for(&mut evloop, ns_addr);

    let outcomes: Rc<RefCell<Vec<DnsOutcome>>> = Rc::new(RefCell::new(Vec::new()));
    let seen = outcomes.clone();
    resolver
        .resolve(&mut evloop, "example.invalid", QueryType::A, move |el, outcome| {
            seen.borrow_mut().push(outcome);
            el.break_loop();
        })
        .unwrap();

    evloop.run();
    server.join().unwrap();

    assert_eq!(*outcomes.borrow(), vec![DnsOutcome::NxDomain]);
    assert_eq!(resolver.pending(), 0);
}

#[test]
fn bad_rcode_is_invalid() {
    init();
    let mut evloop = EventLoop::new().unwrap();
    arm_watchdog(&mut evloop, Duration::from_secs(10));

    // SERVFAIL: no retries are granted, the query fails immediately.
    let (ns_addr, server) = mock_nameserver(1, |query| fixture::reply_base(query, 2, 0));
    let resolver = resolver_for(&mut evloop, ns_addr);

    let outcomes: Rc<RefCell<Vec<DnsOutcome>>> = Rc::new(RefCell::new(Vec::new()));
    let seen = outcomes.clone();
    resolver
        .resolve(&mut evloop, "example.com", QueryType::A, move |el, outcome| {
            seen.borrow_mut().push(outcome);
            el.break_loop();
        })
        .unwrap();

    evloop.run();
    server.join().unwrap();

    assert_eq!(*outcomes.borrow(), vec![DnsOutcome::Invalid]);
}

#[test]
fn forward_lookup_fills_address() {
    init();
    let mut evloop = EventLoop::new().unwrap();
    arm_watchdog(&mut evloop, Duration::from_secs(10));

    let (ns_addr, server) = mock_nameserver(1, |query| {
        assert_eq!(fixture::qtype(query), 1);
        let mut reply = fixture::reply_base(query, 0, 1);
        fixture::answer(&mut reply, 1, 300, &[192, 0, 2, 7]);
        reply
    });
    let resolver = resolver_for(&mut evloop, ns_addr);

    let outcomes: Rc<RefCell<Vec<DnsOutcome>>> = Rc::new(RefCell::new(Vec::new()));
    let seen = outcomes.clone();
    resolver
        .resolve(&mut evloop, "www.example.com", QueryType::A, move |el, outcome| {
            seen.borrow_mut().push(outcome);
            el.break_loop();
        })
        .unwrap();

    evloop.run();
    server.join().unwrap();

    let outcomes = outcomes.borrow();
    assert_eq!(outcomes.len(), 1);
    match &outcomes[0] {
        DnsOutcome::Success(reply) => {
            assert_eq!(reply.name, "www.example.com");
            assert_eq!(reply.addr, Some("192.0.2.7".parse::<IpAddr>().unwrap()));
            assert_eq!(reply.ttl, 300);
        }
        other => panic!("unexpected outcome: {:?}", other),
    }
}

#[test]
fn reverse_lookup_chains_into_forward() {
    init();
    let mut evloop = EventLoop::new().unwrap();
    arm_watchdog(&mut evloop, Duration::from_secs(10));

    // First exchange: PTR for 1.0.0.127.in-addr.arpa -> "localhost.".
    // Second: the chained A query for "localhost" -> 127.0.0.1.
    let (ns_addr, server) = mock_nameserver(2, |query| match fixture::qtype(query) {
        12 => {
            let mut reply = fixture::reply_base(query, 0, 1);
            fixture::answer(&mut reply, 12, 600, &fixture::wire_name("localhost."));
            reply
        }
        1 => {
            let mut reply = fixture::reply_base(query, 0, 1);
            fixture::answer(&mut reply, 1, 600, &[127, 0, 0, 1]);
            reply
        }
        other => panic!("unexpected qtype {}", other),
    });
    let resolver = resolver_for(&mut evloop, ns_addr);

    let outcomes: Rc<RefCell<Vec<DnsOutcome>>> = Rc::new(RefCell::new(Vec::new()));
    let seen = outcomes.clone();
    resolver
        .resolve_ptr(&mut evloop, "127.0.0.1".parse().unwrap(), move |el, outcome| {
            seen.borrow_mut().push(outcome);
            el.break_loop();
        })
        .unwrap();

    evloop.run();
    server.join().unwrap();

    let outcomes = outcomes.borrow();
    assert_eq!(outcomes.len(), 1, "callback must fire exactly once");
    match &outcomes[0] {
        DnsOutcome::Success(reply) => {
            assert_eq!(reply.name, "localhost");
            assert_eq!(reply.addr, Some("127.0.0.1".parse::<IpAddr>().unwrap()));
        }
        other => panic!("unexpected outcome: {:?}", other),
    }
}

#[test]
fn cancel_prevents_delivery() {
    init();
    let mut evloop = EventLoop::new().unwrap();
    arm_watchdog(&mut evloop, Duration::from_millis(500));

    let (ns_addr, server) = mock_nameserver(1, |query| fixture::reply_base(query, 3, 0));
    let resolver = resolver_for(&mut evloop, ns_addr);

    let fired = Rc::new(RefCell::new(false));
    let flag = fired.clone();
    let handle = resolver
        .resolve(&mut evloop, "example.org", QueryType::A, move |_, _| {
            *flag.borrow_mut() = true;
        })
        .unwrap();
    resolver.cancel(handle);
    assert_eq!(resolver.pending(), 0);

    // Run until the watchdog breaks; the reply that arrives for the
    // cancelled id must be ignored.
    evloop.run();
    server.join().unwrap();
    assert!(!*fired.borrow());
}
