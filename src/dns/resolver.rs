use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;
use std::rc::Rc;
use std::time::Duration;

use log::{debug, warn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::addr::SockAddr;
use crate::dns::wire::{self, Header};
use crate::dns::{DnsConfig, DnsError, DnsOutcome, DnsReply, QueryType};
use crate::pollable::{Direction, IoCallback, PollableId};
use crate::timer::TimerId;
use crate::vio::{SockType, Vio};
use crate::EventLoop;

/// First-try timeout; doubles on every retry.
const INITIAL_TIMEOUT_MS: u64 = 4_000;
const INITIAL_RETRIES: u8 = 3;
/// Sweep cadence when no query is in flight.
const IDLE_SWEEP_MS: u64 = 600_000;
const FIRST_SWEEP_MS: u64 = 1_000;

/// Handle for cancelling an in-flight query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueryHandle(u16);

type QueryCallback = Box<dyn FnOnce(&mut EventLoop, DnsOutcome)>;

struct Request {
    id: u16,
    qtype: u16,
    /// Name on the wire (domain suffix applied, or the synthesized
    /// reverse-zone name).
    queryname: String,
    /// Canonical name for the reply; PTR queries fill it from the answer.
    name: String,
    /// Original address of a reverse lookup.
    ptr_addr: Option<IpAddr>,
    retries: u8,
    sends: u32,
    last_ns: usize,
    sent_at_ms: u64,
    timeout_ms: u64,
    addr: Option<IpAddr>,
    ttl: u32,
    callback: Option<QueryCallback>,
}

struct Inner {
    config: DnsConfig,
    /// Consecutive timeouts per nameserver; reset by any valid reply.
    timeout_count: Vec<u32>,
    retrycnt: u64,
    requests: HashMap<u16, Request>,
    vio: Vio,
    pollable: Option<PollableId>,
    sweep_timer: Option<TimerId>,
    sweep_deadline_ms: u64,
    rng: StdRng,
}

/// Asynchronous stub resolver bound to one event loop.
pub struct DnsResolver {
    inner: Rc<RefCell<Inner>>,
}

impl DnsResolver {
    /// Builds a resolver from the system resolv.conf.
    pub fn new(evloop: &mut EventLoop) -> Result<DnsResolver, DnsError> {
        DnsResolver::with_config(evloop, DnsConfig::system()?)
    }

    /// Builds a resolver from an explicit configuration.
    pub fn with_config(evloop: &mut EventLoop, config: DnsConfig) -> Result<DnsResolver, DnsError> {
        let mut config = config;
        if config.nameservers.is_empty() {
            config.add_nameserver("127.0.0.1");
        }
        let server_count = config.nameservers.len();
        let resolver = DnsResolver {
            inner: Rc::new(RefCell::new(Inner {
                config,
                timeout_count: vec![0; server_count],
                retrycnt: 0,
                requests: HashMap::new(),
                vio: Vio::new(),
                pollable: None,
                sweep_timer: None,
                sweep_deadline_ms: u64::MAX,
                rng: StdRng::from_entropy(),
            })),
        };
        open_socket(evloop, &resolver.inner)?;
        Ok(resolver)
    }

    /// Issues a forward query. Single-label names get the configured
    /// default domain appended. The callback fires exactly once.
    pub fn resolve<F>(
        &self,
        evloop: &mut EventLoop,
        name: &str,
        qtype: QueryType,
        cb: F,
    ) -> Result<QueryHandle, DnsError>
    where
        F: FnOnce(&mut EventLoop, DnsOutcome) + 'static,
    {
        resolve_forward(
            evloop,
            &self.inner,
            name,
            qtype.to_wire(),
            Box::new(cb),
        )
        .map(QueryHandle)
    }

    /// Issues a reverse (PTR) query for `addr`. A successful PTR answer
    /// chains into a forward query for the returned name, reusing the same
    /// callback, so the final reply carries both name and address.
    pub fn resolve_ptr<F>(
        &self,
        evloop: &mut EventLoop,
        addr: IpAddr,
        cb: F,
    ) -> Result<QueryHandle, DnsError>
    where
        F: FnOnce(&mut EventLoop, DnsOutcome) + 'static,
    {
        let request = Request {
            id: 0,
            qtype: wire::T_PTR,
            queryname: reverse_query_name(addr),
            name: String::new(),
            ptr_addr: Some(addr),
            retries: INITIAL_RETRIES,
            sends: 0,
            last_ns: 0,
            sent_at_ms: evloop.now_ms(),
            timeout_ms: INITIAL_TIMEOUT_MS,
            addr: None,
            ttl: 0,
            callback: Some(Box::new(cb)),
        };
        start_request(evloop, &self.inner, request).map(QueryHandle)
    }

    /// Forgets an in-flight query without firing its callback.
    pub fn cancel(&self, handle: QueryHandle) {
        self.inner.borrow_mut().requests.remove(&handle.0);
    }

    /// Number of queries currently in flight.
    pub fn pending(&self) -> usize {
        self.inner.borrow().requests.len()
    }

    /// Re-reads the configuration (when it came from a file) and reopens
    /// the resolver socket. Outstanding queries are answered with
    /// [`DnsOutcome::Invalid`] rather than silently dropped.
    pub fn restart(&self, evloop: &mut EventLoop) -> Result<(), DnsError> {
        self.shutdown(evloop);

        {
            let mut inner = self.inner.borrow_mut();
            if let Some(path) = inner.config.resolv_conf.clone() {
                inner.config = DnsConfig::from_resolv_conf(path)?;
            }
            let server_count = inner.config.nameservers.len();
            inner.timeout_count = vec![0; server_count];
            inner.retrycnt = 0;
            inner.vio = Vio::new();
        }
        open_socket(evloop, &self.inner)
    }

    /// Tears the resolver down, answering outstanding queries with
    /// [`DnsOutcome::Invalid`].
    pub fn destroy(self, evloop: &mut EventLoop) {
        self.shutdown(evloop);
    }

    fn shutdown(&self, evloop: &mut EventLoop) {
        let callbacks: Vec<QueryCallback> = {
            let mut inner = self.inner.borrow_mut();
            if let Some(timer) = inner.sweep_timer.take() {
                evloop.timer_destroy(timer);
            }
            inner.sweep_deadline_ms = u64::MAX;
            inner.vio.detach(evloop);
            inner.vio.close();
            inner.pollable = None;
            let ids: Vec<u16> = inner.requests.keys().copied().collect();
            ids.into_iter()
                .filter_map(|id| inner.requests.remove(&id).and_then(|r| r.callback))
                .collect()
        };
        for cb in callbacks {
            cb(evloop, DnsOutcome::Invalid);
        }
    }
}

impl fmt::Debug for DnsResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.borrow();
        f.debug_struct("DnsResolver")
            .field("nameservers", &inner.config.nameservers)
            .field("pending", &inner.requests.len())
            .finish()
    }
}

fn open_socket(evloop: &mut EventLoop, rc: &Rc<RefCell<Inner>>) -> Result<(), DnsError> {
    let pollable = {
        let mut inner = rc.borrow_mut();
        let family = inner.config.nameservers[0].family();
        inner.vio.socket(family, SockType::Datagram)?;
        let id = inner.vio.attach(evloop)?;
        inner.pollable = Some(id);
        id
    };

    let weak = Rc::downgrade(rc);
    evloop.set_select(
        pollable,
        Direction::Read,
        Some(IoCallback::new(move |el, _, _| {
            if let Some(rc) = weak.upgrade() {
                read_replies(el, &rc);
            }
        })),
    );

    schedule_sweep(evloop, rc, FIRST_SWEEP_MS);
    Ok(())
}

fn schedule_sweep(evloop: &mut EventLoop, rc: &Rc<RefCell<Inner>>, delay_ms: u64) {
    let mut inner = rc.borrow_mut();
    if let Some(timer) = inner.sweep_timer.take() {
        evloop.timer_destroy(timer);
    }
    let weak = Rc::downgrade(rc);
    let timer = evloop.timer_add_once(
        "dns-timeout-sweep",
        Duration::from_millis(delay_ms),
        move |el| {
            if let Some(rc) = weak.upgrade() {
                sweep(el, &rc);
            }
        },
    );
    inner.sweep_timer = Some(timer);
    inner.sweep_deadline_ms = evloop.now_ms() + delay_ms;
}

/// Times out overdue requests: resend with a doubled timeout while retries
/// remain, otherwise deliver TIMEOUT. Reschedules itself for the soonest
/// surviving deadline.
fn sweep(evloop: &mut EventLoop, rc: &Rc<RefCell<Inner>>) {
    let now = evloop.now_ms();
    let mut expired: Vec<QueryCallback> = Vec::new();
    let mut resend: Vec<u16> = Vec::new();

    {
        let mut guard = rc.borrow_mut();
        let inner = &mut *guard;
        let overdue: Vec<u16> = inner
            .requests
            .iter()
            .filter(|(_, r)| now >= r.sent_at_ms + r.timeout_ms)
            .map(|(id, _)| *id)
            .collect();

        for id in overdue {
            let Some(request) = inner.requests.get_mut(&id) else {
                continue;
            };
            request.retries -= 1;
            if request.retries == 0 {
                let mut request = inner.requests.remove(&id).unwrap();
                if let Some(cb) = request.callback.take() {
                    expired.push(cb);
                }
            } else {
                inner.timeout_count[request.last_ns] += 1;
                request.sent_at_ms = now;
                request.timeout_ms *= 2;
                resend.push(id);
            }
        }
    }

    {
        let mut inner = rc.borrow_mut();
        for id in resend {
            send_query(&mut inner, id);
        }
    }

    for cb in expired {
        cb(evloop, DnsOutcome::Timeout);
    }

    let delay = match next_request_deadline(rc) {
        Some(deadline) if deadline > now => deadline - now,
        Some(_) => FIRST_SWEEP_MS,
        None => IDLE_SWEEP_MS,
    };
    schedule_sweep(evloop, rc, delay);
}

fn next_request_deadline(rc: &Rc<RefCell<Inner>>) -> Option<u64> {
    rc.borrow()
        .requests
        .values()
        .map(|r| r.sent_at_ms + r.timeout_ms)
        .min()
}

fn resolve_forward(
    evloop: &mut EventLoop,
    rc: &Rc<RefCell<Inner>>,
    name: &str,
    qtype: u16,
    cb: QueryCallback,
) -> Result<u16, DnsError> {
    let queryname = {
        let inner = rc.borrow();
        qualify(name, inner.config.domain.as_deref())
    };
    let request = Request {
        id: 0,
        qtype,
        name: queryname.clone(),
        queryname,
        ptr_addr: None,
        retries: INITIAL_RETRIES,
        sends: 0,
        last_ns: 0,
        sent_at_ms: evloop.now_ms(),
        timeout_ms: INITIAL_TIMEOUT_MS,
        addr: None,
        ttl: 0,
        callback: Some(cb),
    };
    start_request(evloop, rc, request)
}

/// Appends the default domain to unqualified single-label names.
fn qualify(name: &str, domain: Option<&str>) -> String {
    match domain {
        Some(domain) if !name.contains('.') => format!("{}.{}", name, domain),
        _ => name.to_owned(),
    }
}

fn start_request(
    evloop: &mut EventLoop,
    rc: &Rc<RefCell<Inner>>,
    mut request: Request,
) -> Result<u16, DnsError> {
    // Validate the name up front so the caller hears about it immediately
    // rather than through a TIMEOUT three retries later.
    let mut probe = [0u8; wire::MAX_PACKET];
    wire::mkquery(&request.queryname, wire::CLASS_IN, request.qtype, &mut probe)?;

    let (id, deadline) = {
        let mut inner = rc.borrow_mut();
        // Ids are random and must be unique over the in-flight set.
        let id = loop {
            let candidate: u16 = inner.rng.gen();
            if !inner.requests.contains_key(&candidate) {
                break candidate;
            }
        };
        request.id = id;
        let deadline = request.sent_at_ms + request.timeout_ms;
        inner.requests.insert(id, request);
        send_query(&mut inner, id);
        (id, deadline)
    };

    // Pull the sweep forward if this request times out before it runs.
    if deadline < rc.borrow().sweep_deadline_ms {
        let now = evloop.now_ms();
        schedule_sweep(evloop, rc, deadline.saturating_sub(now).max(1));
    }
    Ok(id)
}

/// Encodes and transmits the request's question, rotating across
/// nameservers with backoff against the broken ones.
fn send_query(inner: &mut Inner, id: u16) {
    let Some(mut request) = inner.requests.remove(&id) else {
        return;
    };

    let mut buf = [0u8; wire::MAX_PACKET];
    match wire::mkquery(&request.queryname, wire::CLASS_IN, request.qtype, &mut buf) {
        Ok(len) => {
            wire::put16(request.id, &mut buf[0..]);
            request.sends += 1;
            if let Some(ns) = send_to_nameserver(inner, &buf[..len], request.sends) {
                request.last_ns = ns;
            }
        }
        Err(err) => {
            // Leave the request in place; the sweep will retire it.
            warn!("could not encode query for {}: {}", request.queryname, err);
        }
    }
    inner.requests.insert(id, request);
}

/// `retryfreq` of the original: how many send rounds to skip for a server
/// with `timeouts` consecutive timeouts.
fn retry_frequency(timeouts: u32) -> u64 {
    3u64.pow(timeouts.min(5))
}

/// Tries the configured nameservers starting at a rotating base. Servers
/// that keep timing out are skipped most rounds; if no healthy server
/// takes the packet, the broken ones get a chance.
fn send_to_nameserver(inner: &mut Inner, msg: &[u8], rcount: u32) -> Option<usize> {
    inner.retrycnt += 1;
    let count = inner.config.nameservers.len();

    for i in 0..count {
        let ns = (i + rcount as usize - 1) % count;
        let timeouts = inner.timeout_count[ns];
        if timeouts != 0 && inner.retrycnt % retry_frequency(timeouts) != 0 {
            continue;
        }
        let addr = inner.config.nameservers[ns];
        if matches!(inner.vio.sendto(msg, addr), Ok(n) if n == msg.len()) {
            return Some(ns);
        }
    }

    // No known-working nameserver took it; try the broken ones.
    for i in 0..count {
        let ns = (i + rcount as usize - 1) % count;
        if inner.timeout_count[ns] == 0 {
            continue;
        }
        let addr = inner.config.nameservers[ns];
        if matches!(inner.vio.sendto(msg, addr), Ok(n) if n == msg.len()) {
            return Some(ns);
        }
    }
    None
}

/// Synthesizes the reverse-zone name for `addr`.
fn reverse_query_name(addr: IpAddr) -> String {
    match addr {
        IpAddr::V4(v4) => {
            let o = v4.octets();
            format!("{}.{}.{}.{}.in-addr.arpa", o[3], o[2], o[1], o[0])
        }
        IpAddr::V6(v6) => {
            let mut name = String::with_capacity(72);
            for octet in v6.octets().iter().rev() {
                name.push_str(&format!("{:x}.{:x}.", octet & 0xf, octet >> 4));
            }
            name.push_str("ip6.arpa");
            name
        }
    }
}

enum Delivery {
    Outcome(QueryCallback, DnsOutcome),
    Chain {
        name: String,
        qtype: u16,
        cb: QueryCallback,
    },
}

fn read_replies(evloop: &mut EventLoop, rc: &Rc<RefCell<Inner>>) {
    loop {
        let mut deliveries: Vec<Delivery> = Vec::new();
        let got_packet = {
            let mut inner = rc.borrow_mut();
            let mut buf = [0u8; wire::HEADER_SIZE + wire::MAX_PACKET];
            match inner.vio.recvfrom(&mut buf) {
                Ok((0, _)) | Err(_) => false,
                Ok((len, src)) => {
                    process_packet(&mut inner, &buf[..len], src, &mut deliveries);
                    true
                }
            }
        };

        for delivery in deliveries {
            match delivery {
                Delivery::Outcome(cb, outcome) => cb(evloop, outcome),
                Delivery::Chain { name, qtype, cb } => {
                    // Reverse-then-forward verification: look up the name
                    // the PTR answer handed us.
                    if let Err(err) = resolve_forward(evloop, rc, &name, qtype, cb) {
                        warn!("could not chain PTR result {}: {}", name, err);
                    }
                }
            }
        }

        if !got_packet {
            return;
        }
    }
}

/// Validates and dispatches one reply datagram.
fn process_packet(
    inner: &mut Inner,
    pkt: &[u8],
    src: Option<SockAddr>,
    deliveries: &mut Vec<Delivery>,
) {
    if pkt.len() <= wire::HEADER_SIZE {
        return;
    }
    let Ok(header) = Header::decode(pkt) else {
        return;
    };
    if !inner.requests.contains_key(&header.id) {
        // A reply for a query already answered (or never ours).
        return;
    }

    // Guard against fake replies: the source must be a configured server.
    let Some(src) = src else { return };
    let Some(ns) = inner
        .config
        .nameservers
        .iter()
        .position(|s| s.ip() == src.ip() && s.port() == src.port())
    else {
        return;
    };
    inner.timeout_count[ns] = 0;

    // The reply must echo the question we asked; late replies from a
    // previous holder of the same id do not.
    if header.qdcount != 1 || !header.is_response() {
        return;
    }
    let Ok((qname, _)) = wire::expand_name(pkt, wire::HEADER_SIZE) else {
        return;
    };
    {
        let request = &inner.requests[&header.id];
        if !qname.eq_ignore_ascii_case(&request.queryname) {
            return;
        }
    }

    let mut request = inner.requests.remove(&header.id).unwrap();
    let Some(cb) = request.callback.take() else {
        return;
    };

    if header.rcode() != wire::RCODE_NO_ERROR || header.ancount == 0 || header.is_truncated() {
        let outcome = if header.rcode() == wire::RCODE_NXDOMAIN {
            DnsOutcome::NxDomain
        } else {
            // A hard error means no retries; truncated single-packet
            // replies are unusable too.
            DnsOutcome::Invalid
        };
        deliveries.push(Delivery::Outcome(cb, outcome));
        return;
    }

    if !parse_answers(pkt, &header, &mut request) {
        deliveries.push(Delivery::Outcome(cb, DnsOutcome::Invalid));
        return;
    }

    if request.qtype == wire::T_PTR {
        if request.name.is_empty() {
            // A PTR response with no name: the address does not resolve.
            deliveries.push(Delivery::Outcome(cb, DnsOutcome::Invalid));
            return;
        }
        let qtype = match request.ptr_addr {
            Some(IpAddr::V6(_)) => wire::T_AAAA,
            _ => wire::T_A,
        };
        deliveries.push(Delivery::Chain {
            name: request.name,
            qtype,
            cb,
        });
    } else {
        deliveries.push(Delivery::Outcome(
            cb,
            DnsOutcome::Success(DnsReply {
                name: request.name,
                addr: request.addr,
                ttl: request.ttl,
            }),
        ));
    }
}

/// Walks the answer section, filling the request from the first usable
/// record. CNAMEs are skipped in transit; a type the request did not ask
/// for fails the parse.
fn parse_answers(pkt: &[u8], header: &Header, request: &mut Request) -> bool {
    let mut pos = wire::HEADER_SIZE;
    for _ in 0..header.qdcount {
        match wire::skip_name(pkt, pos) {
            Ok(next) => pos = next + wire::QUESTION_FIXED_SIZE,
            Err(_) => return false,
        }
    }

    let mut remaining = header.ancount;
    while remaining > 0 && pos < pkt.len() {
        remaining -= 1;

        let Ok((_, used)) = wire::expand_name(pkt, pos) else {
            return false;
        };
        pos += used;
        if pos + wire::ANSWER_FIXED_SIZE > pkt.len() {
            break;
        }

        let rtype = wire::get16(&pkt[pos..]);
        let _class = wire::get16(&pkt[pos + 2..]);
        let ttl = wire::get32(&pkt[pos + 4..]);
        let rd_length = wire::get16(&pkt[pos + 8..]) as usize;
        pos += wire::ANSWER_FIXED_SIZE;
        if pos + rd_length > pkt.len() {
            return false;
        }

        match rtype {
            wire::T_A => {
                if request.qtype != wire::T_A || rd_length != 4 {
                    return false;
                }
                let octets: [u8; 4] = pkt[pos..pos + 4].try_into().unwrap();
                request.addr = Some(IpAddr::from(octets));
                request.ttl = ttl;
                return true;
            }
            wire::T_AAAA => {
                if request.qtype != wire::T_AAAA || rd_length != 16 {
                    return false;
                }
                let octets: [u8; 16] = pkt[pos..pos + 16].try_into().unwrap();
                request.addr = Some(IpAddr::from(octets));
                request.ttl = ttl;
                return true;
            }
            wire::T_PTR => {
                if request.qtype != wire::T_PTR {
                    return false;
                }
                let Ok((name, _)) = wire::expand_name(pkt, pos) else {
                    return false;
                };
                request.name = name;
                request.ttl = ttl;
                return true;
            }
            wire::T_CNAME => {
                // The real answer follows.
                pos += rd_length;
            }
            other => {
                // Possibly a broken nameserver with valid answers further
                // on; note it and keep walking.
                debug!("skipping answer record of unexpected type {}", other);
                pos += rd_length;
            }
        }
    }

    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reverse_names() {
        assert_eq!(
            reverse_query_name("127.0.0.1".parse().unwrap()),
            "1.0.0.127.in-addr.arpa"
        );
        let v6 = reverse_query_name("2001:db8::1".parse().unwrap());
        assert!(v6.starts_with("1.0.0.0."));
        assert!(v6.ends_with("8.b.d.0.1.0.0.2.ip6.arpa"));
        assert_eq!(v6.split('.').count(), 34);
    }

    #[test]
    fn qualify_appends_domain_to_single_labels() {
        assert_eq!(qualify("db", Some("example.org")), "db.example.org");
        assert_eq!(qualify("db.example.org", Some("example.org")), "db.example.org");
        assert_eq!(qualify("db", None), "db");
    }

    #[test]
    fn backoff_schedule() {
        assert_eq!(retry_frequency(0), 1);
        assert_eq!(retry_frequency(1), 3);
        assert_eq!(retry_frequency(4), 81);
        assert_eq!(retry_frequency(5), 243);
        // Capped at 3^5.
        assert_eq!(retry_frequency(50), 243);
    }
}
