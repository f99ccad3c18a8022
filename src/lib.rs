#![allow(clippy::missing_errors_doc)]

use std::fmt;

/// Endpoint identifiers are exactly five characters of the lowercase
/// base32 alphabet.
pub const ID_LEN: usize = 5;

/// Hard ceiling on chunks per message; the server may configure a lower one.
pub const MAX_CHUNKS: u16 = 250;

/// Payload characters carried per chunk-upload query.
pub const CHUNK_TEXT_LEN: usize = 30;

/// Sentinel poll answer when nothing is pending.
pub const POLL_NOP: &str = "NOP";

/// Cap on the serialised poll text so the response stays inside the
/// conventional 512-byte UDP envelope.
pub const POLL_TEXT_MAX: usize = 480;

/// Data bytes per AAAA answer slot (16-byte RDATA minus the index byte).
pub const AAAA_SLOT_DATA: usize = 15;

/// Data bytes per A answer slot (4-byte RDATA minus the index byte).
pub const A_SLOT_DATA: usize = 3;

/// The slot index is a single 1-based byte.
pub const MAX_SLOTS: usize = 255;

/// A validated 5-character endpoint identifier, canonically lowercase.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EndpointId([u8; ID_LEN]);

impl EndpointId {
    /// Accepts exactly [`ID_LEN`] characters of `[a-zA-Z2-7]` and
    /// canonicalises to lowercase.
    pub fn parse(s: &str) -> Option<Self> {
        let b = s.as_bytes();
        if b.len() != ID_LEN {
            return None;
        }
        let mut out = [0u8; ID_LEN];
        for (i, &c) in b.iter().enumerate() {
            out[i] = match c {
                b'a'..=b'z' | b'2'..=b'7' => c,
                b'A'..=b'Z' => c.to_ascii_lowercase(),
                _ => return None,
            };
        }
        Some(Self(out))
    }

    pub fn as_str(&self) -> &str {
        // Constructed from validated ASCII only.
        std::str::from_utf8(&self.0).unwrap_or("?????")
    }
}

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Debug for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EndpointId({})", self.as_str())
    }
}

/// The relay's view of one logical message: `sid:mid:tot`.
///
/// Mailboxes are keyed by receiver, so the full locator of a stored chunk
/// is `(rid, MessageKey)`.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct MessageKey {
    pub sid: EndpointId,
    pub mid: EndpointId,
    pub tot: u16,
}

impl MessageKey {
    /// The token handed back to the original sender on its next poll.
    pub fn ack_token(&self) -> String {
        format!("ACK2-{}-{}-{}", self.sid, self.tot, self.mid)
    }
}

impl fmt::Display for MessageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.sid, self.mid, self.tot)
    }
}

/// One parsed chunk-upload label.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct ChunkUpload {
    pub rid: EndpointId,
    pub key: MessageKey,
    pub idx: u16,
    pub payload: String,
}

impl ChunkUpload {
    /// Re-serialises the label text emitted to a polling receiver.
    pub fn to_label(&self) -> String {
        format!(
            "{}-{}-{}-{}-{}-{}",
            self.idx, self.key.tot, self.key.mid, self.key.sid, self.rid, self.payload
        )
    }
}

/// One parsed delivery-ack label (`ack2-sid-tot-mid`).
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct AckUpload {
    pub key: MessageKey,
}

fn parse_decimal_u16(s: &str) -> Option<u16> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    s.parse().ok()
}

/// Parses a chunk-upload label `idx-tot-mid-sid-rid-payload…`.
///
/// The payload may itself contain hyphens; every field past `rid` is kept
/// whole. Accepts only `1 <= idx <= tot <= max_tot` and a non-empty payload.
pub fn parse_chunk_label(label: &str, max_tot: u16) -> Option<ChunkUpload> {
    let mut parts = label.splitn(6, '-');
    let idx = parse_decimal_u16(parts.next()?)?;
    let tot = parse_decimal_u16(parts.next()?)?;
    let mid = EndpointId::parse(parts.next()?)?;
    let sid = EndpointId::parse(parts.next()?)?;
    let rid = EndpointId::parse(parts.next()?)?;
    let payload = parts.next()?;
    if idx == 0 || idx > tot || tot > max_tot || payload.is_empty() {
        return None;
    }
    Some(ChunkUpload {
        rid,
        key: MessageKey { sid, mid, tot },
        idx,
        payload: payload.to_string(),
    })
}

/// Parses a delivery-ack label. Only the four-field `ack2-sid-tot-mid`
/// form is valid; the transitional three-field dialect is rejected.
pub fn parse_ack_label(label: &str) -> Option<AckUpload> {
    let parts: Vec<&str> = label.split('-').collect();
    if parts.len() != 4 || parts[0] != "ack2" {
        return None;
    }
    let sid = EndpointId::parse(parts[1])?;
    let tot = parse_decimal_u16(parts[2])?;
    let mid = EndpointId::parse(parts[3])?;
    if tot == 0 {
        return None;
    }
    Some(AckUpload {
        key: MessageKey { sid, mid, tot },
    })
}

/// Recognises a poll name: the in-zone labels of `v1.sync.<rid>.<nonce>`.
/// Trailing nonce labels are cache busters and carry no meaning.
pub fn parse_poll_labels(labels: &[String]) -> Option<EndpointId> {
    if labels.len() < 3 || labels[0] != "v1" || labels[1] != "sync" {
        return None;
    }
    EndpointId::parse(&labels[2])
}

/// Packs payload bytes into fixed-width answer slots of `1 + data_len`
/// bytes: a 1-based index byte followed by `data_len` payload bytes, the
/// final slot right-zero-padded. An empty payload yields one all-zero slot.
///
/// AAAA answers use a `data_len` of 15, the A fallback 3; the algorithm is
/// the same over the slot width.
pub fn pack_slots(payload: &[u8], data_len: usize) -> Vec<Vec<u8>> {
    if payload.is_empty() {
        return vec![vec![0u8; 1 + data_len]];
    }
    let mut out = Vec::with_capacity(payload.len().div_ceil(data_len));
    for (i, part) in payload.chunks(data_len).enumerate().take(MAX_SLOTS) {
        let mut slot = Vec::with_capacity(1 + data_len);
        slot.push((i + 1) as u8);
        slot.extend_from_slice(part);
        slot.resize(1 + data_len, 0);
        out.push(slot);
    }
    out
}

/// Inverse of [`pack_slots`]: orders slots by their index byte, strips the
/// index, concatenates the data and trims trailing zero padding. Slots with
/// a zero index byte are ignored; duplicate indices keep the first copy.
pub fn unpack_slots(slots: &[Vec<u8>]) -> Vec<u8> {
    let mut indexed: Vec<(u8, &[u8])> = Vec::with_capacity(slots.len());
    for slot in slots {
        if slot.len() < 2 || slot[0] == 0 {
            continue;
        }
        if indexed.iter().any(|(i, _)| *i == slot[0]) {
            continue;
        }
        indexed.push((slot[0], &slot[1..]));
    }
    indexed.sort_by_key(|(i, _)| *i);
    let mut out = Vec::new();
    for (_, data) in indexed {
        out.extend_from_slice(data);
    }
    while out.last() == Some(&0) {
        out.pop();
    }
    out
}

/// Splits a name into lowercase labels, dropping the trailing root dot.
pub fn to_lower_labels(name: &str) -> Vec<String> {
    name.trim_end_matches('.')
        .split('.')
        .filter(|s| !s.is_empty())
        .map(|s| s.to_ascii_lowercase())
        .collect()
}

/// Validates a zone string into its lowercase labels.
pub fn validate_zone_and_labels(zone: &str) -> Result<Vec<String>, String> {
    let labels = to_lower_labels(zone.trim());
    if labels.is_empty() {
        return Err("missing or empty <zone>".to_string());
    }
    for (i, lab) in labels.iter().enumerate() {
        let len = lab.len();
        if len == 0 || len > 63 {
            return Err(format!(
                "zone label {} has invalid length {} (1..=63)",
                i + 1,
                len
            ));
        }
        if !lab
            .chars()
            .all(|c| matches!(c, 'a'..='z' | '0'..='9' | '-' | '_'))
        {
            return Err(format!(
                "zone label {} contains invalid characters: '{}'",
                i + 1,
                lab
            ));
        }
        if lab.starts_with('-') || lab.ends_with('-') {
            return Err(format!(
                "zone label {} must not start or end with '-' (got '{}')",
                i + 1,
                lab
            ));
        }
    }
    Ok(labels)
}

/// Strips the zone suffix off already-lowercased labels, returning the
/// leading in-zone labels. Names equal to the bare zone yield `None`.
pub fn strip_zone<'a>(labels: &'a [String], zone: &[String]) -> Option<&'a [String]> {
    if labels.len() <= zone.len() {
        return None;
    }
    let tail = &labels[labels.len() - zone.len()..];
    if tail == zone {
        Some(&labels[..labels.len() - zone.len()])
    } else {
        None
    }
}

pub fn base32_nopad_encode(data: &[u8]) -> String {
    const ALPH: &[u8; 32] = b"abcdefghijklmnopqrstuvwxyz234567";
    let mut out = Vec::with_capacity((data.len() * 8).div_ceil(5));
    let mut acc: u64 = 0;
    let mut acc_bits: u32 = 0;
    for &b in data {
        acc = (acc << 8) | (b as u64);
        acc_bits += 8;
        while acc_bits >= 5 {
            let shift = acc_bits - 5;
            out.push(ALPH[((acc >> shift) & 0x1F) as usize]);
            acc &= (1u64 << shift) - 1;
            acc_bits -= 5;
        }
    }
    if acc_bits > 0 {
        out.push(ALPH[((acc << (5 - acc_bits)) & 0x1F) as usize]);
    }
    String::from_utf8(out).unwrap_or_default()
}

pub fn base32_nopad_decode(s: &str) -> Option<Vec<u8>> {
    const MAX_BASE32_INPUT: usize = 8192;

    if s.len() > MAX_BASE32_INPUT {
        return None;
    }
    let mut acc: u64 = 0;
    let mut acc_bits: u32 = 0;
    let mut out: Vec<u8> = Vec::with_capacity(s.len() * 5 / 8);
    for ch in s.bytes() {
        let v: u64 = match ch {
            b'A'..=b'Z' => (ch - b'A') as u64,
            b'a'..=b'z' => (ch - b'a') as u64,
            b'2'..=b'7' => 26 + (ch - b'2') as u64,
            b'=' => continue,
            _ => return None,
        };
        if v >= 32 {
            return None;
        }
        acc = (acc << 5) | v;
        acc_bits += 5;
        while acc_bits >= 8 {
            let shift = acc_bits - 8;
            out.push(((acc >> shift) & 0xFF) as u8);
            acc &= (1u64 << shift) - 1;
            acc_bits -= 8;
        }
    }
    Some(out)
}

/// A random endpoint-shaped identifier, also used for message ids and
/// cache-busting nonces.
pub fn random_id() -> EndpointId {
    const ALPH: &[u8; 32] = b"abcdefghijklmnopqrstuvwxyz234567";
    let mut out = [0u8; ID_LEN];
    for b in &mut out {
        *b = ALPH[fastrand::usize(..ALPH.len())];
    }
    EndpointId(out)
}

/// Builds the chunk-upload query names for one encoded message, splitting
/// the text into [`CHUNK_TEXT_LEN`]-character slices.
pub fn build_chunk_names(
    encoded: &str,
    mid: EndpointId,
    sid: EndpointId,
    rid: EndpointId,
    zone: &str,
    max_tot: u16,
) -> Result<Vec<String>, String> {
    let zone_labels = validate_zone_and_labels(zone)?;
    if encoded.is_empty() {
        return Err("empty payload".to_string());
    }
    if !encoded.is_ascii() {
        return Err("payload text must be ASCII".to_string());
    }
    let tot = encoded.len().div_ceil(CHUNK_TEXT_LEN);
    if tot > max_tot as usize {
        return Err(format!("message needs {} chunks, limit is {}", tot, max_tot));
    }
    let suffix = zone_labels.join(".");
    let mut out = Vec::with_capacity(tot);
    for (i, part) in encoded.as_bytes().chunks(CHUNK_TEXT_LEN).enumerate() {
        // Split points are byte offsets; ASCII was checked above.
        let part = std::str::from_utf8(part).map_err(|_| "payload text must be ASCII")?;
        out.push(format!(
            "{}-{}-{}-{}-{}-{}.{}",
            i + 1,
            tot,
            mid,
            sid,
            rid,
            part,
            suffix
        ));
    }
    Ok(out)
}

/// Builds a poll query name `v1.sync.<rid>.<nonce>.<zone>`.
pub fn build_poll_name(rid: EndpointId, nonce: EndpointId, zone: &str) -> String {
    format!("v1.sync.{}.{}.{}", rid, nonce, zone)
}

/// Builds a delivery-ack query name `ack2-sid-tot-mid.<nonce>.<zone>`.
pub fn build_ack_name(key: &MessageKey, nonce: EndpointId, zone: &str) -> String {
    format!("ack2-{}-{}-{}.{}.{}", key.sid, key.tot, key.mid, nonce, zone)
}
