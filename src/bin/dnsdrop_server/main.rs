use clap::Parser;
use console::style;
use dnsdrop::validate_zone_and_labels;
use std::collections::VecDeque;
use std::net::{SocketAddr, UdpSocket};
use std::path::PathBuf;
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::Builder;
use std::time::Duration;

mod dns_handler;
mod mailbox;

use dns_handler::EventLog;
use mailbox::{Relay, RelayCfg};

#[derive(Debug, Clone, Parser)]
#[command(
    name = "dnsdrop-server",
    about = "Store-and-forward relay speaking recursive DNS over UDP",
    long_about = "Accepts chunk uploads, delivery acks and receiver polls encoded as\n\
                  A/AAAA questions under a configured base zone, and answers polls\n\
                  with payload bytes packed into pseudo-address records. All state\n\
                  is in memory; nothing survives a restart.\n\
                  \n\
                  Every flag can also be set through its DNSDROP_* environment\n\
                  variable.\n\
                  \n\
                  Examples:\n\
                  \n\
                  - dnsdrop-server p99.example\n\
                  - dnsdrop-server p99.example --bind 127.0.0.1 --port 5353\n\
                  - DNSDROP_ZONE=p99.example DNSDROP_PORT=5353 dnsdrop-server",
    disable_help_subcommand = true
)]
struct ServerArgs {
    /// Base zone the relay is authoritative for; everything else is ignored
    #[arg(value_name = "ZONE", env = "DNSDROP_ZONE")]
    zone: String,

    /// IP address to bind the UDP socket on
    #[arg(long = "bind", value_name = "IP", default_value = "0.0.0.0", env = "DNSDROP_BIND")]
    bind_ip: String,

    /// UDP port
    #[arg(long = "port", value_name = "PORT", default_value_t = 53, env = "DNSDROP_PORT")]
    port: u16,

    /// How long unacked envelopes live
    #[arg(
        long = "message-ttl-secs",
        value_name = "SEC",
        default_value_t = 86_400,
        env = "DNSDROP_MESSAGE_TTL_SECS"
    )]
    message_ttl_secs: u64,

    /// How long ack suppression and ack dedup last
    #[arg(
        long = "ack-ttl-secs",
        value_name = "SEC",
        default_value_t = 86_400,
        env = "DNSDROP_ACK_TTL_SECS"
    )]
    ack_ttl_secs: u64,

    /// Period of the TTL sweep
    #[arg(long = "gc-secs", value_name = "SEC", default_value_t = 20, env = "DNSDROP_GC_SECS")]
    gc_secs: u64,

    /// Emissions of one key before resend backoff engages
    #[arg(
        long = "backoff-start",
        value_name = "N",
        default_value_t = 16,
        env = "DNSDROP_BACKOFF_START"
    )]
    backoff_start: u32,

    /// Lower clamp of the backoff window
    #[arg(
        long = "backoff-min-ms",
        value_name = "MS",
        default_value_t = 100,
        env = "DNSDROP_BACKOFF_MIN_MS"
    )]
    backoff_min_ms: u64,

    /// Upper clamp of the backoff window
    #[arg(
        long = "backoff-max-ms",
        value_name = "MS",
        default_value_t = 1000,
        env = "DNSDROP_BACKOFF_MAX_MS"
    )]
    backoff_max_ms: u64,

    /// Worker threads handling datagrams
    #[arg(
        long = "workers",
        value_name = "N",
        default_value_t = 10,
        value_parser = clap::value_parser!(u16).range(1..=256),
        env = "DNSDROP_WORKERS"
    )]
    workers: u16,

    /// Bound of the job queue; datagrams beyond it are dropped
    #[arg(
        long = "queue-depth",
        value_name = "N",
        default_value_t = 1000,
        value_parser = clap::value_parser!(u32).range(1..),
        env = "DNSDROP_QUEUE_DEPTH"
    )]
    queue_depth: u32,

    /// Upper bound on chunks per message
    #[arg(
        long = "max-chunks",
        value_name = "N",
        default_value_t = dnsdrop::MAX_CHUNKS,
        value_parser = clap::value_parser!(u16).range(1..=250),
        env = "DNSDROP_MAX_CHUNKS"
    )]
    max_chunks: u16,

    /// Append one JSON object per event to this file
    #[arg(long = "log", value_name = "PATH", env = "DNSDROP_LOG")]
    log_path: Option<PathBuf>,

    /// Disable ANSI colors in stdout
    #[arg(long = "no-color")]
    no_color: bool,
}

#[derive(Debug, Clone)]
pub(crate) struct ServerCfg {
    pub(crate) zone_labels: Vec<String>,
    pub(crate) max_chunks: u16,
    pub(crate) pretty_stdout: bool,
}

struct Job {
    pkt: Vec<u8>,
    peer: SocketAddr,
    ts: u128,
}

/// Bounded job queue between the read loop and the worker pool. A full
/// queue rejects the push; the caller drops the datagram and counts it.
struct JobQueue {
    jobs: Mutex<VecDeque<Job>>,
    cond: Condvar,
    depth: usize,
}

impl JobQueue {
    fn new(depth: usize) -> Self {
        Self {
            jobs: Mutex::new(VecDeque::with_capacity(depth.min(1024))),
            cond: Condvar::new(),
            depth,
        }
    }

    fn push(&self, job: Job) -> bool {
        let mut q = self.jobs.lock().unwrap_or_else(PoisonError::into_inner);
        if q.len() >= self.depth {
            return false;
        }
        q.push_back(job);
        self.cond.notify_one();
        true
    }

    fn pop(&self) -> Job {
        let mut q = self.jobs.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            if let Some(job) = q.pop_front() {
                return job;
            }
            q = self
                .cond
                .wait(q)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }
}

fn main() -> std::io::Result<()> {
    let args = ServerArgs::parse();

    if args.no_color {
        console::set_colors_enabled(false);
        console::set_colors_enabled_stderr(false);
    }
    if args.backoff_min_ms > args.backoff_max_ms {
        eprintln!(
            "--backoff-min-ms ({}) must not exceed --backoff-max-ms ({})",
            args.backoff_min_ms, args.backoff_max_ms
        );
        std::process::exit(2);
    }

    let zone_labels = match validate_zone_and_labels(&args.zone) {
        Ok(v) => v,
        Err(e) => {
            eprintln!("invalid ZONE: {}", e);
            std::process::exit(2);
        }
    };

    let bind_addr = format!("{}:{}", args.bind_ip, args.port);
    let socket = match UdpSocket::bind(&bind_addr) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("cannot bind {}: {}", bind_addr, e);
            std::process::exit(2);
        }
    };
    socket.set_read_timeout(None)?;

    let log = match EventLog::open(args.log_path.as_deref()) {
        Ok(l) => Arc::new(l),
        Err(e) => {
            eprintln!(
                "cannot open --log {}: {}",
                args.log_path
                    .as_deref()
                    .map(|p| p.to_string_lossy().into_owned())
                    .unwrap_or_default(),
                e
            );
            std::process::exit(2);
        }
    };

    let cfg = Arc::new(ServerCfg {
        zone_labels,
        max_chunks: args.max_chunks,
        pretty_stdout: true,
    });
    let relay = Arc::new(Relay::new(RelayCfg {
        message_ttl_ms: Duration::from_secs(args.message_ttl_secs).as_millis(),
        ack_ttl_ms: Duration::from_secs(args.ack_ttl_secs).as_millis(),
        backoff_start: args.backoff_start,
        backoff_min_ms: args.backoff_min_ms,
        backoff_max_ms: args.backoff_max_ms,
    }));
    let queue = Arc::new(JobQueue::new(args.queue_depth as usize));

    println!(
        "{} zone={} bind={} workers={} queue={} max_chunks={}",
        style("[LISTEN]").green().bold(),
        style(cfg.zone_labels.join(".")).yellow(),
        style(&bind_addr).magenta(),
        args.workers,
        args.queue_depth,
        args.max_chunks
    );
    log.event(
        dns_handler::now_millis(),
        "listen",
        &format!(
            ",\"zone\":\"{}\",\"bind\":\"{}\"",
            cfg.zone_labels.join("."),
            bind_addr
        ),
    );

    for i in 0..args.workers {
        let worker_socket = socket.try_clone()?;
        let cfg = cfg.clone();
        let relay = relay.clone();
        let log = log.clone();
        let queue = queue.clone();
        Builder::new()
            .name(format!("dnsdrop-worker-{}", i))
            .spawn(move || {
                loop {
                    let job = queue.pop();
                    dns_handler::handle_datagram(
                        &worker_socket,
                        &cfg,
                        &relay,
                        &log,
                        &job.pkt,
                        job.peer,
                        job.ts,
                    );
                }
            })?;
    }

    {
        let relay = relay.clone();
        let log = log.clone();
        let pretty = cfg.pretty_stdout;
        let every = Duration::from_secs(args.gc_secs.max(1));
        Builder::new().name("dnsdrop-gc".into()).spawn(move || {
            loop {
                std::thread::sleep(every);
                let now = dns_handler::now_millis();
                let st = relay.sweep(now);
                if !st.is_noop() {
                    if pretty {
                        println!(
                            "{} chunks={} keys={} receivers={} acks={}",
                            style("[GC]").magenta().bold(),
                            st.expired_chunks,
                            st.removed_keys,
                            st.removed_receivers,
                            st.expired_acks
                        );
                    }
                    log.event(
                        now,
                        "gc",
                        &format!(
                            ",\"chunks\":{},\"keys\":{},\"receivers\":{},\"acks\":{}",
                            st.expired_chunks, st.removed_keys, st.removed_receivers, st.expired_acks
                        ),
                    );
                }
                let c = relay.counters.snapshot();
                let g = relay.gauges();
                if pretty {
                    println!(
                        "{} q={} poll={} nop={} chunk={} dup={} late={} done={} ack={} ackdup={} ignored={} badparse={} qdrop={} sendfail={} | rx={} msg={} chunks={} ackq={} seen={}",
                        style("[STATS]").cyan().bold(),
                        c.queries,
                        c.polls,
                        c.polls_nop,
                        c.chunks,
                        c.chunk_dup,
                        c.chunk_late,
                        c.completed,
                        c.acks,
                        c.ack_dup,
                        c.ignored,
                        c.parse_fail,
                        c.queue_drop,
                        c.send_fail,
                        g.receivers,
                        g.messages,
                        g.chunks,
                        g.acks_queued,
                        g.ack_seen
                    );
                }
                log.event(
                    now,
                    "stats",
                    &format!(
                        ",\"queries\":{},\"polls\":{},\"chunks\":{},\"completed\":{},\"acks\":{},\"queue_drop\":{}",
                        c.queries, c.polls, c.chunks, c.completed, c.acks, c.queue_drop
                    ),
                );
            }
        })?;
    }

    // Conventional UDP DNS payload ceiling.
    let mut buf = [0u8; 512];
    loop {
        let (len, peer) = match socket.recv_from(&mut buf) {
            Ok(v) => v,
            Err(e) => {
                eprintln!("recv error: {}", e);
                continue;
            }
        };
        let job = Job {
            pkt: buf[..len].to_vec(),
            peer,
            ts: dns_handler::now_millis(),
        };
        if !queue.push(job) {
            mailbox::Counters::bump(&relay.counters.queue_drop);
        }
    }
}

#[cfg(test)]
mod tests;
