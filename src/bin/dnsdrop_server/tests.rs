use super::*;
use crate::dns_handler::{
    DNS_HEADER_LEN, EventLog, build_poll_response, build_upload_ack, handle_datagram,
    parse_header, parse_question, read_u16, write_u16,
};
use crate::mailbox::{AckOutcome, ChunkOutcome, PollReply, Relay, RelayCfg};
use dnsdrop::{
    AckUpload, ChunkUpload, EndpointId, parse_ack_label, parse_chunk_label, unpack_slots,
    validate_zone_and_labels,
};
use std::net::UdpSocket;
use std::time::Duration;

fn id(s: &str) -> EndpointId {
    EndpointId::parse(s).expect("valid id")
}

fn chunk(label: &str) -> ChunkUpload {
    parse_chunk_label(label, dnsdrop::MAX_CHUNKS).expect("valid chunk label")
}

fn ack(label: &str) -> AckUpload {
    parse_ack_label(label).expect("valid ack label")
}

fn relay_cfg() -> RelayCfg {
    RelayCfg {
        message_ttl_ms: 86_400_000,
        ack_ttl_ms: 86_400_000,
        backoff_start: 16,
        backoff_min_ms: 100,
        backoff_max_ms: 1000,
    }
}

fn test_relay() -> Relay {
    Relay::with_seed(relay_cfg(), 7)
}

fn build_query(domain: &str, qtype: u16, qclass: u16, qid: u16) -> Vec<u8> {
    let mut q = Vec::new();
    write_u16(&mut q, qid);
    write_u16(&mut q, 0x0100); // RD
    write_u16(&mut q, 1);
    write_u16(&mut q, 0);
    write_u16(&mut q, 0);
    write_u16(&mut q, 0);
    for label in domain.split('.') {
        let b = label.as_bytes();
        q.push(b.len() as u8);
        q.extend_from_slice(b);
    }
    q.push(0);
    write_u16(&mut q, qtype);
    write_u16(&mut q, qclass);
    q
}

fn answer_rdatas(resp: &[u8]) -> Vec<Vec<u8>> {
    let an = read_u16(&resp[6..8]) as usize;
    let mut off = DNS_HEADER_LEN;
    while resp[off] != 0 {
        off += resp[off] as usize + 1;
    }
    off += 1 + 4; // root byte + QTYPE + QCLASS
    let mut out = Vec::new();
    for _ in 0..an {
        off += 2; // compression pointer back to QNAME
        off += 2 + 2 + 4; // TYPE, CLASS, TTL
        let rdlen = read_u16(&resp[off..off + 2]) as usize;
        off += 2;
        out.push(resp[off..off + rdlen].to_vec());
        off += rdlen;
    }
    out
}

// --- codec ---

#[test]
fn question_parse_lowercases_and_reports_offsets() {
    let req = build_query("V1.Sync.CCCCC.Q1.P99.Example", 28, 1, 0xBEEF);
    let hdr = parse_header(&req).unwrap();
    assert_eq!(hdr.id, 0xBEEF);
    let (labels, q_end, qtype, qclass) = parse_question(&req).unwrap();
    assert_eq!(labels[0], "v1");
    assert_eq!(labels[2], "ccccc");
    assert_eq!(labels[5], "example");
    assert_eq!(q_end, req.len());
    assert_eq!(qtype, 28);
    assert_eq!(qclass, 1);
}

#[test]
fn question_parse_rejects_bad_input() {
    // short datagram
    assert!(parse_header(&[0u8; 5]).is_err());
    assert!(parse_question(&build_query("a.b", 1, 1, 1)[..14]).is_err());
    // oversize label (64 bytes)
    let mut req = Vec::new();
    write_u16(&mut req, 1);
    write_u16(&mut req, 0x0100);
    write_u16(&mut req, 1);
    write_u16(&mut req, 0);
    write_u16(&mut req, 0);
    write_u16(&mut req, 0);
    req.push(64);
    req.extend_from_slice(&[b'a'; 64]);
    req.push(0);
    write_u16(&mut req, 1);
    write_u16(&mut req, 1);
    assert!(parse_question(&req).is_err());
    // compression pointer in QNAME
    let mut ptr = req[..DNS_HEADER_LEN].to_vec();
    ptr.extend_from_slice(&[0xC0, 0x0C]);
    ptr.extend_from_slice(&[0, 1, 0, 1]);
    assert!(parse_question(&ptr).is_err());
}

#[test]
fn upload_ack_is_fixed_a_record() {
    let req = build_query("1-1-aaaaa-bbbbb-ccccc-hi.p99.example", 28, 1, 0x0A0B);
    let hdr = parse_header(&req).unwrap();
    let (_, q_end, _, _) = parse_question(&req).unwrap();
    let resp = build_upload_ack(&req, hdr, q_end);
    assert_eq!(read_u16(&resp[0..2]), 0x0A0B);
    assert_eq!(read_u16(&resp[2..4]), 0x8400); // QR + AA, RCODE 0
    assert_eq!(read_u16(&resp[4..6]), 1); // QD
    assert_eq!(read_u16(&resp[6..8]), 1); // AN
    assert_eq!(read_u16(&resp[8..10]), 0); // NS
    assert_eq!(read_u16(&resp[10..12]), 0); // AR
    // question is echoed verbatim
    assert_eq!(&resp[DNS_HEADER_LEN..q_end], &req[DNS_HEADER_LEN..q_end]);
    // answer: pointer, A, IN, TTL 30, 4-byte RDATA 3.4.0.0
    let mut off = q_end;
    assert_eq!(&resp[off..off + 2], &[0xC0, 0x0C]);
    off += 2;
    assert_eq!(read_u16(&resp[off..off + 2]), 1);
    assert_eq!(read_u16(&resp[off + 2..off + 4]), 1);
    let ttl = u32::from_be_bytes([resp[off + 4], resp[off + 5], resp[off + 6], resp[off + 7]]);
    assert_eq!(ttl, 30);
    assert_eq!(read_u16(&resp[off + 8..off + 10]), 4);
    assert_eq!(&resp[off + 10..off + 14], &[3, 4, 0, 0]);
}

#[test]
fn poll_response_packs_aaaa_slots() {
    let req = build_query("v1.sync.ccccc.q1.p99.example", 28, 1, 0x0102);
    let hdr = parse_header(&req).unwrap();
    let (_, q_end, qtype, _) = parse_question(&req).unwrap();
    let text = "1-1-aaaaa-bbbbb-ccccc-hello";
    let resp = build_poll_response(&req, hdr, q_end, qtype, text);
    let rdatas = answer_rdatas(&resp);
    assert_eq!(rdatas.len(), text.len().div_ceil(15));
    for rd in &rdatas {
        assert_eq!(rd.len(), 16);
    }
    // TTL of the first answer is 0
    let off = q_end + 2 + 2 + 2;
    let ttl = u32::from_be_bytes([resp[off], resp[off + 1], resp[off + 2], resp[off + 3]]);
    assert_eq!(ttl, 0);
    assert_eq!(unpack_slots(&rdatas), text.as_bytes());
}

#[test]
fn poll_response_packs_a_slots_for_a_questions() {
    let req = build_query("v1.sync.ccccc.q1.p99.example", 1, 1, 0x0103);
    let hdr = parse_header(&req).unwrap();
    let (_, q_end, qtype, _) = parse_question(&req).unwrap();
    let resp = build_poll_response(&req, hdr, q_end, qtype, "NOP");
    let rdatas = answer_rdatas(&resp);
    assert_eq!(rdatas.len(), 1);
    assert_eq!(rdatas[0].len(), 4);
    assert_eq!(unpack_slots(&rdatas), b"NOP");
}

// --- relay state machine ---

#[test]
fn single_chunk_upload_then_poll_round_trips() {
    let relay = test_relay();
    let out = relay.ingest_chunk(chunk("1-1-aaaaa-bbbbb-ccccc-hello"), 1_000);
    assert!(matches!(out, ChunkOutcome::Completed { .. }));
    let reply = relay.poll(id("ccccc"), 1_100);
    assert_eq!(
        reply,
        PollReply::Chunk {
            text: "1-1-aaaaa-bbbbb-ccccc-hello".to_string()
        }
    );
}

#[test]
fn ack_reaches_sender_and_silences_receiver() {
    let relay = test_relay();
    relay.ingest_chunk(chunk("1-1-aaaaa-bbbbb-ccccc-hello"), 1_000);
    assert_eq!(
        relay.ingest_ack(ack("ack2-bbbbb-1-aaaaa"), 1_200),
        AckOutcome::Queued { purged: 1 }
    );
    // the sender drains exactly one token
    assert_eq!(
        relay.poll(id("bbbbb"), 1_300),
        PollReply::Ack("ACK2-bbbbb-1-aaaaa".to_string())
    );
    assert_eq!(relay.poll(id("bbbbb"), 1_400), PollReply::Nop);
    // the receiver has nothing left
    assert_eq!(relay.poll(id("ccccc"), 1_500), PollReply::Nop);
}

#[test]
fn two_chunks_emit_round_robin_until_acked() {
    let relay = test_relay();
    assert_eq!(
        relay.ingest_chunk(chunk("1-2-mmmmm-sssss-rrrrr-aa"), 0),
        ChunkOutcome::Stored { have: 1 }
    );
    assert!(matches!(
        relay.ingest_chunk(chunk("2-2-mmmmm-sssss-rrrrr-bb"), 10),
        ChunkOutcome::Completed { latency_ms: 10 }
    ));
    let texts: Vec<String> = (0..4)
        .map(|i| match relay.poll(id("rrrrr"), 100 + i) {
            PollReply::Chunk { text } => text,
            other => panic!("expected chunk, got {:?}", other),
        })
        .collect();
    assert_eq!(texts[0], "1-2-mmmmm-sssss-rrrrr-aa");
    assert_eq!(texts[1], "2-2-mmmmm-sssss-rrrrr-bb");
    // cursor wraps back to 1
    assert_eq!(texts[2], texts[0]);
    assert_eq!(texts[3], texts[1]);
}

#[test]
fn duplicate_chunk_stores_once_and_counts_once() {
    let relay = test_relay();
    relay.ingest_chunk(chunk("1-2-mmmmm-sssss-rrrrr-aa"), 0);
    assert_eq!(
        relay.ingest_chunk(chunk("1-2-mmmmm-sssss-rrrrr-aa"), 5),
        ChunkOutcome::Duplicate
    );
    let c = relay.counters.snapshot();
    assert_eq!(c.chunks, 1);
    assert_eq!(c.chunk_dup, 1);
    assert_eq!(relay.gauges().chunks, 1);
    assert_eq!(
        relay.poll(id("rrrrr"), 10),
        PollReply::Chunk {
            text: "1-2-mmmmm-sssss-rrrrr-aa".to_string()
        }
    );
}

#[test]
fn chunk_after_ack_is_suppressed() {
    let relay = test_relay();
    relay.ingest_ack(ack("ack2-sssss-2-mmmmm"), 0);
    assert_eq!(
        relay.ingest_chunk(chunk("1-2-mmmmm-sssss-rrrrr-aa"), 100),
        ChunkOutcome::Suppressed
    );
    assert_eq!(relay.gauges().chunks, 0);
    assert_eq!(relay.counters.snapshot().chunk_late, 1);
    assert_eq!(relay.poll(id("rrrrr"), 200), PollReply::Nop);
}

#[test]
fn seventeenth_poll_is_deferred_by_backoff() {
    let relay = test_relay();
    relay.ingest_chunk(chunk("1-1-mmmmm-sssss-rrrrr-pp"), 0);
    let now = 10_000;
    for i in 0..16 {
        assert!(
            matches!(relay.poll(id("rrrrr"), now), PollReply::Chunk { .. }),
            "poll {} should emit immediately",
            i + 1
        );
    }
    // 17th falls inside the backoff window...
    assert_eq!(relay.poll(id("rrrrr"), now), PollReply::Nop);
    // ...which is at most max_delay + max_jitter past the 16th emission
    assert!(matches!(
        relay.poll(id("rrrrr"), now + 2_000),
        PollReply::Chunk { .. }
    ));
}

#[test]
fn poll_never_returns_other_receivers_chunks() {
    let relay = test_relay();
    relay.ingest_chunk(chunk("1-1-mmmmm-sssss-rrrrr-pp"), 0);
    assert_eq!(relay.poll(id("zzzzz"), 10), PollReply::Nop);
    match relay.poll(id("rrrrr"), 20) {
        PollReply::Chunk { text } => {
            assert_eq!(chunk(&text).rid, id("rrrrr"));
        }
        other => panic!("expected chunk, got {:?}", other),
    }
}

#[test]
fn ack_purges_every_receiver_holding_the_message() {
    let relay = test_relay();
    relay.ingest_chunk(chunk("1-1-mmmmm-sssss-raaaa-pp"), 0);
    relay.ingest_chunk(chunk("1-1-mmmmm-sssss-rbbbb-pp"), 0);
    assert_eq!(
        relay.ingest_ack(ack("ack2-sssss-1-mmmmm"), 10),
        AckOutcome::Queued { purged: 2 }
    );
    assert_eq!(relay.gauges().chunks, 0);
    assert_eq!(relay.poll(id("raaaa"), 20), PollReply::Nop);
    assert_eq!(relay.poll(id("rbbbb"), 30), PollReply::Nop);
}

#[test]
fn replayed_acks_yield_a_single_token() {
    let relay = test_relay();
    relay.ingest_chunk(chunk("1-1-mmmmm-sssss-rrrrr-pp"), 0);
    assert_eq!(
        relay.ingest_ack(ack("ack2-sssss-1-mmmmm"), 10),
        AckOutcome::Queued { purged: 1 }
    );
    for t in [20, 30, 40] {
        assert_eq!(
            relay.ingest_ack(ack("ack2-sssss-1-mmmmm"), t),
            AckOutcome::Duplicate { purged: 0 }
        );
    }
    assert!(matches!(relay.poll(id("sssss"), 50), PollReply::Ack(_)));
    assert_eq!(relay.poll(id("sssss"), 60), PollReply::Nop);
    let c = relay.counters.snapshot();
    assert_eq!(c.acks, 1);
    assert_eq!(c.ack_dup, 3);
}

#[test]
fn full_message_drains_in_index_order() {
    // high backoff threshold so the drain is never throttled
    let relay = Relay::with_seed(
        RelayCfg {
            backoff_start: 1_000,
            ..relay_cfg()
        },
        1,
    );
    let payloads = ["p2p2", "p3p3", "p1p1"];
    relay.ingest_chunk(chunk(&format!("2-3-mmmmm-sssss-rrrrr-{}", payloads[0])), 0);
    relay.ingest_chunk(chunk(&format!("3-3-mmmmm-sssss-rrrrr-{}", payloads[1])), 1);
    relay.ingest_chunk(chunk(&format!("1-3-mmmmm-sssss-rrrrr-{}", payloads[2])), 2);
    let mut got = Vec::new();
    for t in 0..3 {
        match relay.poll(id("rrrrr"), 100 + t) {
            PollReply::Chunk { text } => got.push(chunk(&text)),
            other => panic!("expected chunk, got {:?}", other),
        }
    }
    let idxs: Vec<u16> = got.iter().map(|c| c.idx).collect();
    assert_eq!(idxs, vec![1, 2, 3]);
    let joined: String = got.iter().map(|c| c.payload.as_str()).collect();
    assert_eq!(joined, "p1p1p2p2p3p3");
}

#[test]
fn cursor_gap_falls_back_to_lowest_stored_index() {
    let relay = Relay::with_seed(
        RelayCfg {
            backoff_start: 1_000,
            ..relay_cfg()
        },
        1,
    );
    relay.ingest_chunk(chunk("2-3-mmmmm-sssss-rrrrr-pp"), 0);
    for t in [10, 20, 30] {
        match relay.poll(id("rrrrr"), t) {
            PollReply::Chunk { text } => assert_eq!(chunk(&text).idx, 2),
            other => panic!("expected chunk, got {:?}", other),
        }
    }
}

#[test]
fn sweep_expires_messages_and_ack_suppression() {
    let relay = Relay::with_seed(
        RelayCfg {
            message_ttl_ms: 1_000,
            ack_ttl_ms: 1_000,
            ..relay_cfg()
        },
        1,
    );
    relay.ingest_chunk(chunk("1-2-mmmmm-sssss-rrrrr-aa"), 0);
    assert!(relay.sweep(500).is_noop());
    let st = relay.sweep(2_000);
    assert_eq!(st.expired_chunks, 1);
    assert_eq!(st.removed_keys, 1);
    assert_eq!(st.removed_receivers, 1);
    assert_eq!(relay.poll(id("rrrrr"), 2_100), PollReply::Nop);

    // suppression lapses with the ack-seen entry
    relay.ingest_ack(ack("ack2-sssss-2-mmmmm"), 3_000);
    assert_eq!(
        relay.ingest_chunk(chunk("1-2-mmmmm-sssss-rrrrr-aa"), 3_500),
        ChunkOutcome::Suppressed
    );
    let st = relay.sweep(5_000);
    assert_eq!(st.expired_acks, 1);
    assert_eq!(
        relay.ingest_chunk(chunk("1-2-mmmmm-sssss-rrrrr-aa"), 5_100),
        ChunkOutcome::Stored { have: 1 }
    );
}

#[test]
fn unacked_backlog_only_shrinks_without_new_uploads() {
    let relay = test_relay();
    relay.ingest_chunk(chunk("1-1-maaaa-sssss-rrrrr-pp"), 0);
    relay.ingest_chunk(chunk("1-1-mbbbb-sssss-rrrrr-qq"), 0);
    let mut last = relay.gauges().messages;
    assert_eq!(last, 2);
    for (t, label) in [(10, "ack2-sssss-1-maaaa"), (20, "ack2-sssss-1-mbbbb")] {
        relay.ingest_ack(ack(label), t);
        let now = relay.gauges().messages;
        assert!(now <= last);
        last = now;
    }
    assert_eq!(last, 0);
}

// --- dispatcher over a real socket pair ---

struct Harness {
    server: UdpSocket,
    client: UdpSocket,
    cfg: ServerCfg,
    relay: Relay,
    log: EventLog,
}

impl Harness {
    fn new() -> Self {
        let server = UdpSocket::bind("127.0.0.1:0").expect("bind server");
        let client = UdpSocket::bind("127.0.0.1:0").expect("bind client");
        client
            .set_read_timeout(Some(Duration::from_millis(300)))
            .expect("timeout");
        Self {
            server,
            client,
            cfg: ServerCfg {
                zone_labels: validate_zone_and_labels("p99.example").unwrap(),
                max_chunks: dnsdrop::MAX_CHUNKS,
                pretty_stdout: false,
            },
            relay: Relay::with_seed(relay_cfg(), 3),
            log: EventLog::open(None).expect("no-op log"),
        }
    }

    fn exchange(&self, query: &[u8], now: u128) -> Option<Vec<u8>> {
        let peer = self.client.local_addr().expect("client addr");
        handle_datagram(&self.server, &self.cfg, &self.relay, &self.log, query, peer, now);
        let mut buf = [0u8; 512];
        match self.client.recv_from(&mut buf) {
            Ok((n, _)) => Some(buf[..n].to_vec()),
            Err(_) => None,
        }
    }
}

#[test]
fn dispatcher_acks_uploads_and_serves_polls() {
    let h = Harness::new();
    let up = build_query("1-1-aaaaa-bbbbb-ccccc-hello.p99.example", 28, 1, 0x1111);
    let resp = h.exchange(&up, 1_000).expect("upload ack");
    let rdatas = answer_rdatas(&resp);
    assert_eq!(rdatas, vec![vec![3u8, 4, 0, 0]]);

    let poll = build_query("v1.sync.ccccc.q1.p99.example", 28, 1, 0x2222);
    let resp = h.exchange(&poll, 1_100).expect("poll answer");
    assert_eq!(read_u16(&resp[0..2]), 0x2222);
    let text = unpack_slots(&answer_rdatas(&resp));
    assert_eq!(text, b"1-1-aaaaa-bbbbb-ccccc-hello");

    // delivery ack: sender sees the token, receiver sees NOP
    let ackq = build_query("ack2-bbbbb-1-aaaaa.n1.p99.example", 28, 1, 0x3333);
    let resp = h.exchange(&ackq, 1_200).expect("ack upload ack");
    assert_eq!(answer_rdatas(&resp), vec![vec![3u8, 4, 0, 0]]);

    let sender_poll = build_query("v1.sync.bbbbb.q2.p99.example", 28, 1, 0x4444);
    let resp = h.exchange(&sender_poll, 1_300).expect("sender poll");
    assert_eq!(unpack_slots(&answer_rdatas(&resp)), b"ACK2-bbbbb-1-aaaaa");

    let receiver_poll = build_query("v1.sync.ccccc.q3.p99.example", 28, 1, 0x5555);
    let resp = h.exchange(&receiver_poll, 1_400).expect("receiver poll");
    assert_eq!(unpack_slots(&answer_rdatas(&resp)), b"NOP");
}

#[test]
fn dispatcher_polls_answer_with_a_records_on_a_questions() {
    let h = Harness::new();
    let poll = build_query("v1.sync.ccccc.q1.p99.example", 1, 1, 0x0007);
    let resp = h.exchange(&poll, 500).expect("poll answer");
    let rdatas = answer_rdatas(&resp);
    assert_eq!(rdatas[0].len(), 4);
    assert_eq!(unpack_slots(&rdatas), b"NOP");
}

#[test]
fn dispatcher_drops_malformed_chunks_without_answering() {
    let h = Harness::new();
    // reaches label parsing, fails the grammar: no ACK at all
    let bad = build_query("9-2-mmmmm-sssss-rrrrr-x.p99.example", 28, 1, 0x0001);
    assert!(h.exchange(&bad, 100).is_none());
    assert_eq!(h.relay.counters.snapshot().parse_fail, 1);
}

#[test]
fn dispatcher_ignores_foreign_zones_and_qtypes() {
    let h = Harness::new();
    assert!(h.exchange(&build_query("www.example.com", 1, 1, 1), 10).is_none());
    // TXT and CHAOS-class queries are not part of the protocol
    assert!(
        h.exchange(&build_query("v1.sync.ccccc.q1.p99.example", 16, 1, 2), 20)
            .is_none()
    );
    assert!(
        h.exchange(&build_query("v1.sync.ccccc.q1.p99.example", 1, 3, 3), 30)
            .is_none()
    );
    assert_eq!(h.relay.counters.snapshot().ignored, 3);
    // bare zone name is outside the grammar too
    assert!(h.exchange(&build_query("p99.example", 1, 1, 4), 40).is_none());
}

#[test]
fn dispatcher_rejects_legacy_three_field_acks() {
    let h = Harness::new();
    h.relay.ingest_chunk(chunk("1-1-aaaaa-bbbbb-ccccc-hello"), 0);
    let legacy = build_query("ack2-bbbbb-1.n1.p99.example", 28, 1, 0x0009);
    assert!(h.exchange(&legacy, 100).is_none());
    assert_eq!(h.relay.counters.snapshot().parse_fail, 1);
    // the mailbox is untouched
    assert_eq!(h.relay.gauges().chunks, 1);
}

#[test]
fn job_queue_bounds_and_delivers_in_order() {
    let q = JobQueue::new(2);
    let peer: std::net::SocketAddr = "127.0.0.1:1".parse().unwrap();
    assert!(q.push(Job { pkt: vec![1], peer, ts: 1 }));
    assert!(q.push(Job { pkt: vec![2], peer, ts: 2 }));
    assert!(!q.push(Job { pkt: vec![3], peer, ts: 3 }));
    assert_eq!(q.pop().pkt, vec![1]);
    assert_eq!(q.pop().pkt, vec![2]);
}
