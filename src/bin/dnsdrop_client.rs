use clap::{ArgAction, Parser};
use console::style;
use dnsdrop::{
    ChunkUpload, EndpointId, MessageKey, base32_nopad_decode, base32_nopad_encode, build_ack_name,
    build_chunk_names, build_poll_name, parse_chunk_label, random_id, unpack_slots,
    validate_zone_and_labels,
};
use std::collections::{BTreeMap, HashMap};
use std::io::{self, BufRead};
use std::net::{Ipv6Addr, UdpSocket};
use std::str::FromStr;
use std::time::{Duration, Instant};

const QTYPE_A: u16 = 1;
const QTYPE_AAAA: u16 = 28;

/// How long a finished message key keeps re-triggering acks for stray
/// resends before it is forgotten.
const ACKED_MEMORY: Duration = Duration::from_secs(600);

#[derive(Debug, Clone, Parser)]
#[command(
    name = "dnsdrop-client",
    about = "Endpoint simulator: send and receive messages through the relay",
    long_about = "Reads lines from stdin and uploads each as a chunked message to the\n\
                  relay, while a background poller pulls pending chunks and delivery\n\
                  acks for this endpoint and acknowledges completed messages.\n\
                  \n\
                  Examples:\n\
                  \n\
                  - dnsdrop-client p99.example --id a3akc --peer simul\n\
                  - dnsdrop-client p99.example --resolver-ip 127.0.0.1:5353 --peer simul\n\
                  - echo hi | dnsdrop-client p99.example --peer simul --dont-query",
    disable_help_subcommand = true
)]
struct ClientArgs {
    /// Base zone of the relay
    #[arg(value_name = "ZONE")]
    zone: String,

    /// This endpoint's 5-char id (random if omitted)
    #[arg(long = "id", value_name = "ID", value_parser = parse_id_arg)]
    id: Option<EndpointId>,

    /// Receiver id for outgoing messages; without it the client only polls
    #[arg(long = "peer", value_name = "ID", value_parser = parse_id_arg)]
    peer: Option<EndpointId>,

    /// Send to this resolver (default: first nameserver in /etc/resolv.conf)
    #[arg(long = "resolver-ip", value_name = "HOST[:PORT]")]
    resolver_ip: Option<String>,

    /// Poll interval while traffic is flowing
    #[arg(long = "poll-ms", value_name = "MS", default_value_t = 350)]
    poll_ms: u64,

    /// Idle poll interval ceiling
    #[arg(long = "poll-max-ms", value_name = "MS", default_value_t = 5000)]
    poll_max_ms: u64,

    /// Sleep between chunk uploads
    #[arg(long = "delay-ms", value_name = "MS", default_value_t = 200)]
    delay_ms: u64,

    /// Wait up to this many ms for the upload ack of each chunk (0 disables)
    #[arg(long = "await-reply-ms", value_name = "MS", default_value_t = 1500)]
    await_reply_ms: u64,

    /// Retry polls as A questions when AAAA gets no answer through
    #[arg(long = "a-fallback", action = ArgAction::SetTrue)]
    a_fallback: bool,

    /// Do not send; print the chunk query names (one per line)
    #[arg(short = 'n', long = "dont-query", action = ArgAction::SetTrue)]
    dont_query: bool,

    /// Disable ANSI colors
    #[arg(long = "no-color", action = ArgAction::SetTrue)]
    no_color: bool,
}

fn parse_id_arg(v: &str) -> Result<EndpointId, String> {
    EndpointId::parse(v)
        .ok_or_else(|| format!("invalid id '{}': expected 5 chars of [a-z2-7]", v))
}

fn build_query_from_name(name: &str, qtype: u16) -> Vec<u8> {
    fn write_u16(buf: &mut Vec<u8>, v: u16) {
        buf.extend_from_slice(&v.to_be_bytes());
    }
    let mut q = Vec::new();
    write_u16(&mut q, fastrand::u16(..));
    write_u16(&mut q, 0x0100); // RD
    write_u16(&mut q, 1); // QD
    write_u16(&mut q, 0); // AN
    write_u16(&mut q, 0); // NS
    write_u16(&mut q, 0); // AR
    for lab in name.split('.') {
        q.push(lab.len() as u8);
        q.extend_from_slice(lab.as_bytes());
    }
    q.push(0);
    write_u16(&mut q, qtype);
    write_u16(&mut q, 1); // CLASS IN
    q
}

/// Collects the A/AAAA RDATA of every answer in a response. The question
/// section is skipped label by label; answer names may be either pointers
/// or plain labels.
fn answer_rdatas(resp: &[u8]) -> Vec<Vec<u8>> {
    let mut out = Vec::new();
    if resp.len() < 12 {
        return out;
    }
    let ancount = u16::from_be_bytes([resp[6], resp[7]]) as usize;
    let mut i = 12;
    while i < resp.len() && resp[i] != 0 {
        if resp[i] & 0xC0 == 0xC0 {
            i += 1;
            break;
        }
        i += resp[i] as usize + 1;
    }
    i += 1; // terminator (or second pointer byte)
    i += 4; // QTYPE + QCLASS
    for _ in 0..ancount {
        if i >= resp.len() {
            break;
        }
        if resp[i] & 0xC0 == 0xC0 {
            i += 2;
        } else {
            while i < resp.len() && resp[i] != 0 {
                i += resp[i] as usize + 1;
            }
            i += 1;
        }
        if i + 10 > resp.len() {
            break;
        }
        let rtype = u16::from_be_bytes([resp[i], resp[i + 1]]);
        let rdlen = u16::from_be_bytes([resp[i + 8], resp[i + 9]]) as usize;
        i += 10;
        if i + rdlen > resp.len() {
            break;
        }
        if rtype == QTYPE_A || rtype == QTYPE_AAAA {
            out.push(resp[i..i + rdlen].to_vec());
        }
        i += rdlen;
    }
    out
}

fn parse_system_resolver() -> Option<String> {
    // Smallest possible parser: first 'nameserver' entry wins.
    let contents = std::fs::read_to_string("/etc/resolv.conf").ok()?;
    for line in contents.lines() {
        let line = line.trim();
        if line.starts_with('#') || line.is_empty() {
            continue;
        }
        if let Some(rest) = line.strip_prefix("nameserver") {
            let mut parts = rest.trim().split_whitespace();
            if let Some(host) = parts.next() {
                return Some(host.to_string());
            }
        }
    }
    None
}

fn to_target_addr(host_or_ip: &str) -> String {
    if host_or_ip.starts_with('[') {
        if let Some(idx) = host_or_ip.find(']') {
            if host_or_ip[idx..].starts_with("]:") {
                host_or_ip.to_string()
            } else {
                format!("{}:53", host_or_ip)
            }
        } else {
            format!("{}:53", host_or_ip)
        }
    } else if Ipv6Addr::from_str(host_or_ip).is_ok() {
        format!("[{}]:53", host_or_ip)
    } else if host_or_ip.contains(':') {
        host_or_ip.to_string()
    } else {
        format!("{}:53", host_or_ip)
    }
}

/// One query, one response; returns the reassembled slot text, if any.
fn query_payload(sock: &UdpSocket, name: &str, qtype: u16) -> Option<String> {
    let q = build_query_from_name(name, qtype);
    let txid = u16::from_be_bytes([q[0], q[1]]);
    sock.send(&q).ok()?;
    let mut buf = [0u8; 512];
    let n = sock.recv(&mut buf).ok()?;
    if n < 12 || u16::from_be_bytes([buf[0], buf[1]]) != txid {
        return None;
    }
    let text = unpack_slots(&answer_rdatas(&buf[..n]));
    if text.is_empty() {
        return None;
    }
    String::from_utf8(text).ok()
}

/// Fire-and-forget query on a throwaway socket; used for delivery acks.
fn fire_query(target: &str, name: &str) {
    if let Ok(sock) = UdpSocket::bind("0.0.0.0:0")
        && sock.connect(target).is_ok()
    {
        let _ = sock.set_read_timeout(Some(Duration::from_millis(800)));
        let _ = sock.send(&build_query_from_name(name, QTYPE_AAAA));
        let mut buf = [0u8; 512];
        let _ = sock.recv(&mut buf);
    }
}

fn send_ack_burst(target: &str, key: &MessageKey, zone: &str) {
    // DNS may drop any single query; three tries is plenty in practice.
    for _ in 0..3 {
        let name = build_ack_name(key, random_id(), zone);
        fire_query(target, &name);
        std::thread::sleep(Duration::from_millis(350));
    }
    println!(
        "{} key={} sent",
        style("[ACK2-TX]").blue().bold(),
        style(key.to_string()).yellow()
    );
}

struct Poller {
    target: String,
    zone: String,
    my_id: EndpointId,
    poll_ms: u64,
    poll_max_ms: u64,
    a_fallback: bool,
    rx: HashMap<MessageKey, BTreeMap<u16, String>>,
    acked: HashMap<MessageKey, Instant>,
}

impl Poller {
    fn run(mut self) {
        let sock = match UdpSocket::bind("0.0.0.0:0").and_then(|s| {
            s.connect(&self.target)?;
            s.set_read_timeout(Some(Duration::from_millis(1500)))?;
            Ok(s)
        }) {
            Ok(s) => s,
            Err(e) => {
                eprintln!("dnsdrop-client: poller cannot reach {}: {}", self.target, e);
                return;
            }
        };

        let mut interval = self.poll_ms;
        loop {
            let name = build_poll_name(self.my_id, random_id(), &self.zone);
            let mut txt = query_payload(&sock, &name, QTYPE_AAAA);
            if txt.is_none() && self.a_fallback {
                txt = query_payload(&sock, &name, QTYPE_A);
            }
            match txt.as_deref() {
                None | Some("") | Some(dnsdrop::POLL_NOP) => {
                    std::thread::sleep(Duration::from_millis(interval));
                    interval = (interval.saturating_mul(3) / 2).min(self.poll_max_ms);
                    continue;
                }
                Some(text) => {
                    interval = self.poll_ms;
                    if let Some(token) = text.strip_prefix("ACK2-") {
                        println!(
                            "{} {}",
                            style("[ACK2]").blue().bold(),
                            style(format!("ACK2-{}", token)).blue()
                        );
                    } else if let Some(up) = parse_chunk_label(text, dnsdrop::MAX_CHUNKS) {
                        self.handle_chunk(up);
                    } else {
                        println!("{} unparseable payload: {}", style("[ERR]").red().bold(), text);
                    }
                }
            }
            std::thread::sleep(Duration::from_millis(self.poll_ms));
        }
    }

    fn handle_chunk(&mut self, up: ChunkUpload) {
        if up.rid != self.my_id {
            return;
        }
        self.acked.retain(|_, t| t.elapsed() < ACKED_MEMORY);
        if self.acked.contains_key(&up.key) {
            // The relay keeps resending until the ack lands; help it stop.
            let name = build_ack_name(&up.key, random_id(), &self.zone);
            fire_query(&self.target, &name);
            return;
        }
        let key = up.key;
        let buf = self.rx.entry(key).or_default();
        buf.insert(up.idx, up.payload);
        println!(
            "{} {}/{} from {} (have {}/{})",
            style("[RX]").green().bold(),
            up.idx,
            key.tot,
            style(key.sid.as_str()).yellow(),
            buf.len(),
            key.tot
        );
        if buf.len() == key.tot as usize {
            let joined: String = buf.values().map(String::as_str).collect();
            match base32_nopad_decode(&joined) {
                Some(bytes) => println!(
                    "{} [{}] {}",
                    style("[MSG]").green().bold(),
                    style(key.sid.as_str()).yellow(),
                    String::from_utf8_lossy(&bytes)
                ),
                None => println!(
                    "{} [{}] undecodable payload ({} chars)",
                    style("[MSG]").red().bold(),
                    style(key.sid.as_str()).yellow(),
                    joined.len()
                ),
            }
            self.rx.remove(&key);
            self.acked.insert(key, Instant::now());
            send_ack_burst(&self.target, &key, &self.zone);
        }
    }
}

fn send_message(
    target: &str,
    zone: &str,
    my_id: EndpointId,
    peer: EndpointId,
    msg: &str,
    delay_ms: u64,
    await_reply_ms: u64,
) -> io::Result<()> {
    let encoded = base32_nopad_encode(msg.as_bytes());
    let mid = random_id();
    let names = match build_chunk_names(&encoded, mid, my_id, peer, zone, dnsdrop::MAX_CHUNKS) {
        Ok(v) => v,
        Err(e) => {
            eprintln!("dnsdrop-client: {}", e);
            return Ok(());
        }
    };
    let sock = UdpSocket::bind("0.0.0.0:0")?;
    sock.connect(target)?;
    if await_reply_ms > 0 {
        sock.set_read_timeout(Some(Duration::from_millis(await_reply_ms)))?;
    }
    let tot = names.len();
    for (i, name) in names.iter().enumerate() {
        let q = build_query_from_name(name, QTYPE_AAAA);
        let txid = u16::from_be_bytes([q[0], q[1]]);
        let started = Instant::now();
        sock.send(&q)?;
        let mut ack_ok = false;
        if await_reply_ms > 0 {
            let mut buf = [0u8; 512];
            if let Ok(n) = sock.recv(&mut buf)
                && n >= 2
                && u16::from_be_bytes([buf[0], buf[1]]) == txid
            {
                ack_ok = true;
            }
        }
        if ack_ok {
            println!(
                "{} {}/{} rtt={}ms",
                style("[TX]").green().bold(),
                i + 1,
                tot,
                started.elapsed().as_millis()
            );
        } else {
            println!(
                "{} {}/{} no upload ack after {}ms",
                style("[TX-TIMEOUT]").yellow().bold(),
                i + 1,
                tot,
                await_reply_ms
            );
        }
        if delay_ms > 0 {
            std::thread::sleep(Duration::from_millis(delay_ms));
        }
    }
    println!(
        "{} mid={} chunks={}",
        style("[SENT]").green().bold(),
        style(mid.as_str()).yellow(),
        tot
    );
    Ok(())
}

fn main() -> io::Result<()> {
    let args = ClientArgs::parse();

    if args.no_color {
        console::set_colors_enabled(false);
        console::set_colors_enabled_stderr(false);
    }
    if let Err(e) = validate_zone_and_labels(&args.zone) {
        eprintln!("invalid ZONE: {}", e);
        std::process::exit(2);
    }

    let my_id = args.id.unwrap_or_else(random_id);

    if args.dont_query {
        let peer = args.peer.unwrap_or_else(random_id);
        let stdin = io::stdin();
        for line in stdin.lock().lines() {
            let line = line?;
            let msg = line.trim();
            if msg.is_empty() {
                continue;
            }
            let encoded = base32_nopad_encode(msg.as_bytes());
            match build_chunk_names(&encoded, random_id(), my_id, peer, &args.zone, dnsdrop::MAX_CHUNKS)
            {
                Ok(names) => {
                    for name in names {
                        println!("{}", name);
                    }
                }
                Err(e) => eprintln!("dnsdrop-client: {}", e),
            }
        }
        return Ok(());
    }

    let host = match args.resolver_ip.clone().or_else(parse_system_resolver) {
        Some(h) => h,
        None => {
            eprintln!("dnsdrop-client: no --resolver-ip and could not parse /etc/resolv.conf");
            std::process::exit(2);
        }
    };
    let target = to_target_addr(&host);

    println!(
        "{} id={} zone={} resolver={}{}",
        style("[INFO]").cyan().bold(),
        style(my_id.as_str()).yellow(),
        style(&args.zone).yellow(),
        style(&target).magenta(),
        match args.peer {
            Some(p) => format!(" peer={}", p),
            None => " (receive-only)".to_string(),
        }
    );

    let poller = Poller {
        target: target.clone(),
        zone: args.zone.clone(),
        my_id,
        poll_ms: args.poll_ms,
        poll_max_ms: args.poll_max_ms.max(args.poll_ms),
        a_fallback: args.a_fallback,
        rx: HashMap::new(),
        acked: HashMap::new(),
    };
    std::thread::Builder::new()
        .name("dnsdrop-poller".into())
        .spawn(move || poller.run())?;

    let stdin = io::stdin();
    for line in stdin.lock().lines() {
        let line = line?;
        let msg = line.trim();
        if msg.is_empty() {
            continue;
        }
        match args.peer {
            Some(peer) => send_message(
                &target,
                &args.zone,
                my_id,
                peer,
                msg,
                args.delay_ms,
                args.await_reply_ms,
            )?,
            None => eprintln!("dnsdrop-client: --peer not set; running receive-only"),
        }
    }
    Ok(())
}
