//! A minimal multicast DNS client: one `A` question sent to the mDNS group
//! from an ephemeral port ("legacy unicast"), answered directly to us.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;

use tokio::net::UdpSocket;

use crate::error::{Error, Result};

/// The mDNS IPv4 link-local multicast group.
pub const MDNS_GROUP: Ipv4Addr = Ipv4Addr::new(224, 0, 0, 251);
/// The mDNS port.
pub const MDNS_PORT: u16 = 5353;

const TYPE_A: u16 = 1;
const CLASS_IN: u16 = 1;
const FLAG_QR: u16 = 0x8000;
const FLAG_RD: u16 = 0x0100;
const HEADER_LEN: usize = 12;
const MAX_LABEL: usize = 63;
const MAX_POINTERS: usize = 32;

fn malformed(detail: impl Into<String>) -> Error {
    Error::Malformed {
        what: "DNS message",
        detail: detail.into(),
    }
}

/// Encode a query for the `A` record of `name`.
pub fn encode_query(id: u16, name: &str) -> Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(HEADER_LEN + name.len() + 6);
    for v in [id, FLAG_RD, 1, 0, 0, 0] {
        buf.extend_from_slice(&v.to_be_bytes());
    }
    for label in name.trim_end_matches('.').split('.') {
        if label.is_empty() || label.len() > MAX_LABEL {
            return Err(Error::Resolution(format!("invalid host name \"{name}\"")));
        }
        buf.push(label.len() as u8);
        buf.extend_from_slice(label.as_bytes());
    }
    buf.push(0);
    buf.extend_from_slice(&TYPE_A.to_be_bytes());
    buf.extend_from_slice(&CLASS_IN.to_be_bytes());
    Ok(buf)
}

fn read_u16(buf: &[u8], pos: usize) -> Result<u16> {
    buf.get(pos..pos + 2)
        .map(|b| u16::from_be_bytes([b[0], b[1]]))
        .ok_or_else(|| malformed("truncated"))
}

/// Read a possibly compressed name at `pos`, returning it and the offset
/// just past it.
fn read_name(buf: &[u8], mut pos: usize) -> Result<(String, usize)> {
    let mut labels = Vec::new();
    let mut end = None;
    let mut jumps = 0;
    loop {
        let len = *buf.get(pos).ok_or_else(|| malformed("truncated name"))? as usize;
        match len & 0xc0 {
            0x00 if len == 0 => {
                let end = end.unwrap_or(pos + 1);
                return Ok((labels.join("."), end));
            }
            0x00 => {
                let label = buf
                    .get(pos + 1..pos + 1 + len)
                    .ok_or_else(|| malformed("truncated label"))?;
                labels.push(String::from_utf8_lossy(label).into_owned());
                pos += 1 + len;
            }
            0xc0 => {
                let lo = *buf.get(pos + 1).ok_or_else(|| malformed("truncated pointer"))?;
                jumps += 1;
                if jumps > MAX_POINTERS {
                    return Err(malformed("compression loop"));
                }
                end.get_or_insert(pos + 2);
                pos = ((len & 0x3f) << 8) | lo as usize;
            }
            _ => return Err(malformed("unsupported label type")),
        }
    }
}

/// Extract the first `A` record for `name` from a response to query `id`.
///
/// Returns `Ok(None)` for messages that are not a response to our query.
pub fn decode_response(buf: &[u8], id: u16, name: &str) -> Result<Option<Ipv4Addr>> {
    if buf.len() < HEADER_LEN {
        return Err(malformed("short header"));
    }
    let flags = read_u16(buf, 2)?;
    // mDNS responders may zero the id of legacy unicast replies
    let rid = read_u16(buf, 0)?;
    if flags & FLAG_QR == 0 || (rid != id && rid != 0) {
        return Ok(None);
    }
    let qdcount = read_u16(buf, 4)?;
    let ancount = read_u16(buf, 6)?;
    let mut pos = HEADER_LEN;
    for _ in 0..qdcount {
        let (_, next) = read_name(buf, pos)?;
        pos = next + 4;
    }
    let wanted = name.trim_end_matches('.');
    for _ in 0..ancount {
        let (rname, next) = read_name(buf, pos)?;
        let rtype = read_u16(buf, next)?;
        // Top bit of the class is the mDNS cache-flush bit
        let rclass = read_u16(buf, next + 2)? & 0x7fff;
        let rdlen = read_u16(buf, next + 8)? as usize;
        let rdata = buf
            .get(next + 10..next + 10 + rdlen)
            .ok_or_else(|| malformed("truncated record"))?;
        pos = next + 10 + rdlen;
        if rtype == TYPE_A
            && rclass == CLASS_IN
            && rdlen == 4
            && rname.eq_ignore_ascii_case(wanted)
        {
            return Ok(Some(Ipv4Addr::new(rdata[0], rdata[1], rdata[2], rdata[3])));
        }
    }
    Ok(None)
}

/// Ask the local network for the address of `name`, optionally sending from
/// the `source` address to pick the interface on multi-homed hosts.
pub async fn query_a(
    name: &str,
    source: Option<Ipv4Addr>,
    timeout: Duration,
) -> Result<Ipv4Addr> {
    let id = std::process::id() as u16 ^ 0x5a5a;
    let query = encode_query(id, name)?;
    let bind = SocketAddrV4::new(source.unwrap_or(Ipv4Addr::UNSPECIFIED), 0);
    let sock = UdpSocket::bind(bind).await?;
    let group = SocketAddr::V4(SocketAddrV4::new(MDNS_GROUP, MDNS_PORT));
    tracing::debug!("Querying {name} via mDNS from {}", sock.local_addr()?);

    let exchange = async {
        sock.send_to(&query, group).await?;
        let mut buf = [0u8; 1500];
        loop {
            let (n, from) = sock.recv_from(&mut buf).await?;
            match decode_response(&buf[..n], id, name) {
                Ok(Some(addr)) => return Ok::<_, Error>(addr),
                Ok(None) => {}
                Err(e) => tracing::debug!("Ignoring reply from {from}: {e}"),
            }
        }
    };
    match tokio::time::timeout(timeout, exchange).await {
        Ok(r) => r,
        Err(_) => Err(Error::Resolution(format!(
            "Resolving hostname \"{name}\" using mDNS failed."
        ))),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// A response to `query` carrying one `A` record per address, the
    /// record name compressed against the question.
    pub(crate) fn build_response(query: &[u8], addrs: &[Ipv4Addr]) -> Vec<u8> {
        let mut r = query.to_vec();
        r[2..4].copy_from_slice(&(FLAG_QR | 0x0400).to_be_bytes());
        r[6..8].copy_from_slice(&(addrs.len() as u16).to_be_bytes());
        for a in addrs {
            r.extend_from_slice(&[0xc0, HEADER_LEN as u8]);
            r.extend_from_slice(&TYPE_A.to_be_bytes());
            r.extend_from_slice(&(CLASS_IN | 0x8000).to_be_bytes());
            r.extend_from_slice(&120u32.to_be_bytes());
            r.extend_from_slice(&4u16.to_be_bytes());
            r.extend_from_slice(&a.octets());
        }
        r
    }

    #[test]
    fn test_encode_query() {
        let q = encode_query(0x1234, "verdin.local").unwrap();
        let expected: &[u8] = &[
            0x12, 0x34, 0x01, 0x00, 0, 1, 0, 0, 0, 0, 0, 0, 6, b'v', b'e', b'r', b'd', b'i',
            b'n', 5, b'l', b'o', b'c', b'a', b'l', 0, 0, 1, 0, 1,
        ];
        assert_eq!(q, expected);
        assert!(encode_query(1, "a..local").is_err());
    }

    #[test]
    fn test_decode_response() {
        let q = encode_query(7, "verdin.local").unwrap();
        let addr = Ipv4Addr::new(192, 168, 1, 42);
        let r = build_response(&q, &[addr]);
        assert_eq!(decode_response(&r, 7, "verdin.local").unwrap(), Some(addr));
        assert_eq!(decode_response(&r, 7, "VERDIN.local.").unwrap(), Some(addr));
        // Not ours
        assert_eq!(decode_response(&r, 8, "verdin.local").unwrap(), None);
        assert_eq!(decode_response(&r, 7, "other.local").unwrap(), None);
        // Our own query echoed back by multicast loopback
        assert_eq!(decode_response(&q, 7, "verdin.local").unwrap(), None);
    }

    #[test]
    fn test_decode_malformed() {
        let q = encode_query(7, "verdin.local").unwrap();
        let mut r = build_response(&q, &[Ipv4Addr::LOCALHOST]);
        r.truncate(r.len() - 2);
        assert!(decode_response(&r, 7, "verdin.local").is_err());
        // A pointer to itself
        let mut looped = q.clone();
        looped[2..4].copy_from_slice(&FLAG_QR.to_be_bytes());
        looped[12] = 0xc0;
        looped[13] = 12;
        assert!(decode_response(&looped, 7, "verdin.local").is_err());
    }
}
