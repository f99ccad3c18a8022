use console::style;
use dnsdrop::{
    A_SLOT_DATA, AAAA_SLOT_DATA, POLL_TEXT_MAX, pack_slots, parse_ack_label, parse_chunk_label,
    parse_poll_labels, strip_zone,
};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::net::{SocketAddr, UdpSocket};
use std::path::Path;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::mailbox::{AckOutcome, ChunkOutcome, Counters, PollReply, Relay};

pub(crate) const DNS_HEADER_LEN: usize = 12;

pub(crate) const QTYPE_A: u16 = 1;
pub(crate) const QTYPE_AAAA: u16 = 28;
pub(crate) const QCLASS_IN: u16 = 1;

/// Flags on every response: QR=1, AA=1, RCODE=0.
const RESPONSE_FLAGS: u16 = 0x8400;

/// Fixed answer acknowledging chunk and delivery-ack uploads.
pub(crate) const UPLOAD_ACK_RDATA: [u8; 4] = [3, 4, 0, 0];
pub(crate) const UPLOAD_ACK_TTL: u32 = 30;

#[derive(Debug, Clone, Copy)]
pub(crate) struct DnsHeader {
    pub(crate) id: u16,
}

pub(crate) fn read_u16(be: &[u8]) -> u16 {
    u16::from_be_bytes([be[0], be[1]])
}

pub(crate) fn write_u16(buf: &mut Vec<u8>, v: u16) {
    buf.extend_from_slice(&v.to_be_bytes());
}

pub(crate) fn parse_header(pkt: &[u8]) -> Result<DnsHeader, ()> {
    if pkt.len() < DNS_HEADER_LEN {
        return Err(());
    }
    Ok(DnsHeader {
        id: read_u16(&pkt[0..2]),
    })
}

/// Parses the single question starting at offset 12: a QNAME of plain
/// length-prefixed labels (no pointer compression), then QTYPE and QCLASS.
/// Labels are lowercased here so all later matching is case-blind. Returns
/// `(labels, q_end, qtype, qclass)` where `q_end` points just past QCLASS.
pub(crate) fn parse_question(pkt: &[u8]) -> Result<(Vec<String>, usize, u16, u16), ()> {
    if pkt.len() < DNS_HEADER_LEN + 5 {
        return Err(());
    }
    let mut off = DNS_HEADER_LEN;
    let mut labels: Vec<String> = Vec::new();
    loop {
        if off >= pkt.len() {
            return Err(());
        }
        let len = pkt[off] as usize;
        off += 1;
        if len == 0 {
            break;
        }
        // 64..=255 covers both oversize labels and compression pointers.
        if len > 63 || off + len > pkt.len() {
            return Err(());
        }
        let label = std::str::from_utf8(&pkt[off..off + len]).map_err(|_| ())?;
        labels.push(label.to_ascii_lowercase());
        off += len;
    }
    if labels.is_empty() || off + 4 > pkt.len() {
        return Err(());
    }
    let qtype = read_u16(&pkt[off..off + 2]);
    let qclass = read_u16(&pkt[off + 2..off + 4]);
    off += 4;
    Ok((labels, off, qtype, qclass))
}

/// Response header + echoed question. The answer count is patched in by the
/// callers once they know how many RRs they appended.
fn begin_response(req: &[u8], hdr: DnsHeader, q_end: usize) -> (Vec<u8>, usize) {
    let mut resp = Vec::with_capacity(512);
    write_u16(&mut resp, hdr.id);
    write_u16(&mut resp, RESPONSE_FLAGS);
    write_u16(&mut resp, 1); // QDCOUNT
    let an_idx = resp.len();
    write_u16(&mut resp, 0); // ANCOUNT, patched later
    write_u16(&mut resp, 0); // NSCOUNT
    write_u16(&mut resp, 0); // ARCOUNT
    resp.extend_from_slice(&req[DNS_HEADER_LEN..q_end]);
    (resp, an_idx)
}

fn patch_ancount(resp: &mut Vec<u8>, an_idx: usize, count: u16) {
    resp[an_idx..an_idx + 2].copy_from_slice(&count.to_be_bytes());
}

/// The fixed `3.4.0.0` A answer confirming an upload.
pub(crate) fn build_upload_ack(req: &[u8], hdr: DnsHeader, q_end: usize) -> Vec<u8> {
    let (mut resp, an_idx) = begin_response(req, hdr, q_end);
    resp.extend_from_slice(&[0xC0, 0x0C]);
    write_u16(&mut resp, QTYPE_A);
    write_u16(&mut resp, QCLASS_IN);
    resp.extend_from_slice(&UPLOAD_ACK_TTL.to_be_bytes());
    write_u16(&mut resp, 4);
    resp.extend_from_slice(&UPLOAD_ACK_RDATA);
    patch_ancount(&mut resp, an_idx, 1);
    resp
}

/// Poll answer: the payload text packed into one RR per slot, A or AAAA to
/// mirror the question, TTL 0 so resolvers do not cache it.
pub(crate) fn build_poll_response(
    req: &[u8],
    hdr: DnsHeader,
    q_end: usize,
    qtype: u16,
    text: &str,
) -> Vec<u8> {
    let data_len = if qtype == QTYPE_AAAA {
        AAAA_SLOT_DATA
    } else {
        A_SLOT_DATA
    };
    let bytes = text.as_bytes();
    let capped = &bytes[..bytes.len().min(POLL_TEXT_MAX)];
    let slots = pack_slots(capped, data_len);
    let (mut resp, an_idx) = begin_response(req, hdr, q_end);
    for slot in &slots {
        resp.extend_from_slice(&[0xC0, 0x0C]);
        write_u16(&mut resp, qtype);
        write_u16(&mut resp, QCLASS_IN);
        resp.extend_from_slice(&0u32.to_be_bytes());
        write_u16(&mut resp, slot.len() as u16);
        resp.extend_from_slice(slot);
    }
    patch_ancount(&mut resp, an_idx, slots.len() as u16);
    resp
}

pub(crate) fn now_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0)
}

pub(crate) fn json_escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 8);
    for ch in s.chars() {
        match ch {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if c.is_control() => out.push_str(&format!("\\u{:04x}", c as u32)),
            c => out.push(c),
        }
    }
    out
}

pub(crate) fn format_socket(addr: SocketAddr) -> String {
    match addr {
        SocketAddr::V4(v4) => format!("{}:{}", v4.ip(), v4.port()),
        SocketAddr::V6(v6) => format!("[{}]:{}", v6.ip(), v6.port()),
    }
}

/// Optional JSON event log. Handlers run on worker threads, so the writer
/// sits behind a mutex; stdout tagging stays lock-free via `println!`.
pub(crate) struct EventLog {
    file: Option<Mutex<BufWriter<File>>>,
}

impl EventLog {
    pub(crate) fn open(path: Option<&Path>) -> std::io::Result<Self> {
        let file = match path {
            Some(p) => {
                let f = std::fs::OpenOptions::new().create(true).append(true).open(p)?;
                Some(Mutex::new(BufWriter::new(f)))
            }
            None => None,
        };
        Ok(Self { file })
    }

    /// `rest_fields` must be empty or start with a comma, e.g. `,"rid":"x"`.
    pub(crate) fn event(&self, ts: u128, event: &str, rest_fields: &str) {
        if let Some(file) = &self.file
            && let Ok(mut w) = file.lock()
        {
            let _ = writeln!(w, "{{\"ts\":{},\"event\":\"{}\"{}}}", ts, event, rest_fields);
            let _ = w.flush();
        }
    }
}

/// Parses one datagram, routes it to the poll / delivery-ack / chunk-upload
/// flow and sends whatever answer that flow produces. Malformed input is
/// dropped without a response and counted.
pub(crate) fn handle_datagram(
    socket: &UdpSocket,
    cfg: &crate::ServerCfg,
    relay: &Relay,
    log: &EventLog,
    pkt: &[u8],
    peer: SocketAddr,
    now: u128,
) {
    Counters::bump(&relay.counters.queries);

    let Ok(hdr) = parse_header(pkt) else {
        Counters::bump(&relay.counters.parse_fail);
        if cfg.pretty_stdout {
            println!(
                "{}",
                style(format!(
                    "[ERR] parse_error short_header len={} peer={}",
                    pkt.len(),
                    format_socket(peer)
                ))
                .red()
                .bold()
            );
        }
        log.event(
            now,
            "parse_error",
            &format!(
                ",\"why\":\"short_header\",\"len\":{},\"peer\":\"{}\"",
                pkt.len(),
                json_escape(&format_socket(peer))
            ),
        );
        return;
    };
    let Ok((labels, q_end, qtype, qclass)) = parse_question(pkt) else {
        Counters::bump(&relay.counters.parse_fail);
        if cfg.pretty_stdout {
            println!(
                "{}",
                style(format!(
                    "[ERR] parse_error bad_question peer={}",
                    format_socket(peer)
                ))
                .red()
                .bold()
            );
        }
        log.event(
            now,
            "parse_error",
            &format!(
                ",\"why\":\"bad_question\",\"peer\":\"{}\"",
                json_escape(&format_socket(peer))
            ),
        );
        return;
    };

    if qclass != QCLASS_IN || (qtype != QTYPE_A && qtype != QTYPE_AAAA) {
        Counters::bump(&relay.counters.ignored);
        return;
    }
    let Some(in_zone) = strip_zone(&labels, &cfg.zone_labels) else {
        Counters::bump(&relay.counters.ignored);
        return;
    };

    // Flow 1: receiver poll.
    if let Some(rid) = parse_poll_labels(in_zone) {
        let reply = relay.poll(rid, now);
        if cfg.pretty_stdout {
            println!(
                "{} rid={} {} peer={}",
                style("[POLL]").cyan().bold(),
                style(rid.as_str()).yellow(),
                match &reply {
                    PollReply::Ack(tok) => style(tok.clone()).blue().to_string(),
                    PollReply::Chunk { text } => style(text.clone()).green().to_string(),
                    PollReply::Nop => style("nop").dim().to_string(),
                },
                style(format_socket(peer)).magenta()
            );
        }
        log.event(
            now,
            "poll",
            &format!(",\"rid\":\"{}\",\"kind\":\"{}\"", rid, reply.kind()),
        );
        let resp = build_poll_response(pkt, hdr, q_end, qtype, reply.text());
        if socket.send_to(&resp, peer).is_err() {
            Counters::bump(&relay.counters.send_fail);
        }
        return;
    }

    let first = &in_zone[0];

    // Flow 2: delivery-ack upload.
    if first.starts_with("ack2-") {
        let Some(ack) = parse_ack_label(first) else {
            Counters::bump(&relay.counters.parse_fail);
            if cfg.pretty_stdout {
                println!(
                    "{}",
                    style(format!(
                        "[ERR] parse_error ack label='{}' peer={}",
                        first,
                        format_socket(peer)
                    ))
                    .red()
                    .bold()
                );
            }
            log.event(
                now,
                "parse_error",
                &format!(",\"label\":\"{}\"", json_escape(first)),
            );
            return;
        };
        let outcome = relay.ingest_ack(ack, now);
        if cfg.pretty_stdout {
            let (tag, purged) = match &outcome {
                AckOutcome::Queued { purged } => (style("[ACK2]").blue().bold(), *purged),
                AckOutcome::Duplicate { purged } => (style("[ACK2-DUP]").yellow().bold(), *purged),
            };
            println!(
                "{} key={} purged={} peer={}",
                tag,
                style(ack.key.to_string()).yellow(),
                purged,
                style(format_socket(peer)).magenta()
            );
        }
        let (event, purged) = match &outcome {
            AckOutcome::Queued { purged } => ("ack", *purged),
            AckOutcome::Duplicate { purged } => ("ack_dup", *purged),
        };
        log.event(
            now,
            event,
            &format!(",\"key\":\"{}\",\"purged\":{}", ack.key, purged),
        );
        let resp = build_upload_ack(pkt, hdr, q_end);
        if socket.send_to(&resp, peer).is_err() {
            Counters::bump(&relay.counters.send_fail);
        }
        return;
    }

    // Flow 3: chunk upload. A label that fails the grammar gets no answer.
    let Some(up) = parse_chunk_label(first, cfg.max_chunks) else {
        Counters::bump(&relay.counters.parse_fail);
        if cfg.pretty_stdout {
            println!(
                "{}",
                style(format!(
                    "[ERR] parse_error chunk label='{}' peer={}",
                    first,
                    format_socket(peer)
                ))
                .red()
                .bold()
            );
        }
        log.event(
            now,
            "parse_error",
            &format!(",\"label\":\"{}\"", json_escape(first)),
        );
        return;
    };
    let (rid, key, idx, tot) = (up.rid, up.key, up.idx, up.key.tot);
    let outcome = relay.ingest_chunk(up, now);
    if cfg.pretty_stdout {
        match &outcome {
            ChunkOutcome::Stored { have } => println!(
                "{} {}/{} key={} rid={} have={} peer={}",
                style("[CHUNK]").green().bold(),
                idx,
                tot,
                style(key.to_string()).yellow(),
                rid,
                have,
                style(format_socket(peer)).magenta()
            ),
            ChunkOutcome::Completed { latency_ms } => println!(
                "{} key={} rid={} chunks={} latency_ms={}",
                style("[COMPLETE]").cyan().bold(),
                style(key.to_string()).yellow(),
                rid,
                tot,
                latency_ms
            ),
            ChunkOutcome::Duplicate => println!(
                "{} {}/{} key={} rid={}",
                style("[DUP]").yellow().bold(),
                idx,
                tot,
                style(key.to_string()).yellow(),
                rid
            ),
            ChunkOutcome::Suppressed => println!(
                "{} {}/{} key={} already acked",
                style("[LATE]").yellow().bold(),
                idx,
                tot,
                style(key.to_string()).yellow()
            ),
        }
    }
    let event = match &outcome {
        ChunkOutcome::Stored { .. } => "chunk",
        ChunkOutcome::Completed { .. } => "complete",
        ChunkOutcome::Duplicate => "chunk_dup",
        ChunkOutcome::Suppressed => "chunk_late",
    };
    log.event(
        now,
        event,
        &format!(",\"key\":\"{}\",\"rid\":\"{}\",\"idx\":{}", key, rid, idx),
    );
    let resp = build_upload_ack(pkt, hdr, q_end);
    if socket.send_to(&resp, peer).is_err() {
        Counters::bump(&relay.counters.send_fail);
    }
}
