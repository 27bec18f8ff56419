//! TLS ClientHello SNI reading and rewriting.
//!
//! A plain length-checked walk over one handshake record — enough to
//! extract the server name for routing, rewrite it for the SNI
//! connector, and synthesize a minimal hello for tests.

use rand::RngCore;

/// TLS record header length.
pub const RECORD_HEADER_LEN: usize = 5;
/// Handshake record content type.
pub const CONTENT_HANDSHAKE: u8 = 0x16;

const HELLO_CLIENT: u8 = 0x01;
const EXT_SERVER_NAME: u16 = 0x0000;

/// Absolute offsets of every field the rewrite has to patch.
struct SniLocation {
    name_start: usize,
    name_end: usize,
    // 2-byte fields, absolute offset of the first byte
    record_len_at: usize,
    extensions_len_at: usize,
    ext_len_at: usize,
    list_len_at: usize,
    name_len_at: usize,
    // 3-byte handshake length
    handshake_len_at: usize,
}

fn locate_sni(record: &[u8]) -> Option<SniLocation> {
    if record.len() < RECORD_HEADER_LEN || record[0] != CONTENT_HANDSHAKE {
        return None;
    }
    let payload_len = u16::from_be_bytes([record[3], record[4]]) as usize;
    let payload = record.get(RECORD_HEADER_LEN..RECORD_HEADER_LEN + payload_len)?;

    if *payload.first()? != HELLO_CLIENT {
        return None;
    }
    let base = RECORD_HEADER_LEN;

    // handshake type(1) + len(3) + version(2) + random(32)
    let mut idx = 38;
    let session_len = *payload.get(idx)? as usize;
    idx += 1 + session_len;

    let suites_len =
        u16::from_be_bytes([*payload.get(idx)?, *payload.get(idx + 1)?]) as usize;
    idx += 2 + suites_len;

    let compression_len = *payload.get(idx)? as usize;
    idx += 1 + compression_len;

    let extensions_len_at = base + idx;
    let extensions_len =
        u16::from_be_bytes([*payload.get(idx)?, *payload.get(idx + 1)?]) as usize;
    idx += 2;
    let extensions_end = idx + extensions_len;

    while idx + 4 <= extensions_end {
        let ext_type = u16::from_be_bytes([*payload.get(idx)?, *payload.get(idx + 1)?]);
        let ext_len =
            u16::from_be_bytes([*payload.get(idx + 2)?, *payload.get(idx + 3)?]) as usize;
        if ext_type == EXT_SERVER_NAME {
            // server_name_list len(2) | type(1) | name len(2) | name
            let list_at = idx + 4;
            if *payload.get(list_at + 2)? != 0x00 {
                return None;
            }
            let name_len =
                u16::from_be_bytes([*payload.get(list_at + 3)?, *payload.get(list_at + 4)?])
                    as usize;
            let name_start = list_at + 5;
            payload.get(name_start..name_start + name_len)?;
            return Some(SniLocation {
                name_start: base + name_start,
                name_end: base + name_start + name_len,
                record_len_at: 3,
                extensions_len_at,
                ext_len_at: base + idx + 2,
                list_len_at: base + list_at,
                name_len_at: base + list_at + 3,
                handshake_len_at: base + 1,
            });
        }
        idx += 4 + ext_len;
    }
    None
}

/// Extract the server name from one handshake record (header included).
pub fn parse_sni(record: &[u8]) -> Option<String> {
    let loc = locate_sni(record)?;
    String::from_utf8(record[loc.name_start..loc.name_end].to_vec()).ok()
}

/// Replace the server name, fixing every length field on the way out.
/// `None` when the record does not carry an SNI extension.
pub fn rewrite_sni(record: &[u8], host: &str) -> Option<Vec<u8>> {
    let loc = locate_sni(record)?;
    let old_len = loc.name_end - loc.name_start;
    let delta = host.len() as i64 - old_len as i64;

    let mut out = Vec::with_capacity((record.len() as i64 + delta) as usize);
    out.extend_from_slice(&record[..loc.name_start]);
    out.extend_from_slice(host.as_bytes());
    out.extend_from_slice(&record[loc.name_end..]);

    let patch_u16 = |out: &mut [u8], at: usize| {
        let old = u16::from_be_bytes([out[at], out[at + 1]]);
        let new = (old as i64 + delta) as u16;
        out[at..at + 2].copy_from_slice(&new.to_be_bytes());
    };
    patch_u16(&mut out, loc.record_len_at);
    patch_u16(&mut out, loc.extensions_len_at);
    patch_u16(&mut out, loc.ext_len_at);
    patch_u16(&mut out, loc.list_len_at);
    patch_u16(&mut out, loc.name_len_at);

    let hs_at = loc.handshake_len_at;
    let old = u32::from_be_bytes([0, out[hs_at], out[hs_at + 1], out[hs_at + 2]]);
    let new = (old as i64 + delta) as u32;
    out[hs_at] = (new >> 16) as u8;
    out[hs_at + 1] = (new >> 8) as u8;
    out[hs_at + 2] = new as u8;

    Some(out)
}

/// Build a minimal ClientHello carrying only an SNI extension.
pub fn synthesize(host: &str) -> Vec<u8> {
    let mut random = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut random);

    // extension block
    let name = host.as_bytes();
    let mut ext = Vec::new();
    ext.extend_from_slice(&EXT_SERVER_NAME.to_be_bytes());
    ext.extend_from_slice(&((name.len() + 5) as u16).to_be_bytes()); // ext len
    ext.extend_from_slice(&((name.len() + 3) as u16).to_be_bytes()); // list len
    ext.push(0x00); // host_name
    ext.extend_from_slice(&(name.len() as u16).to_be_bytes());
    ext.extend_from_slice(name);

    let mut body = Vec::new();
    body.extend_from_slice(&[0x03, 0x03]); // TLS 1.2
    body.extend_from_slice(&random);
    body.push(0x00); // empty session id
    body.extend_from_slice(&[0x00, 0x04, 0x13, 0x01, 0x13, 0x02]); // two suites
    body.extend_from_slice(&[0x01, 0x00]); // null compression
    body.extend_from_slice(&(ext.len() as u16).to_be_bytes());
    body.extend_from_slice(&ext);

    let mut handshake = vec![HELLO_CLIENT];
    handshake.push(0x00);
    handshake.extend_from_slice(&(body.len() as u16).to_be_bytes());
    handshake.extend_from_slice(&body);

    let mut record = vec![CONTENT_HANDSHAKE, 0x03, 0x01];
    record.extend_from_slice(&(handshake.len() as u16).to_be_bytes());
    record.extend_from_slice(&handshake);
    record
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn synthesized_hello_parses_back() {
        let record = synthesize("inner.example.com");
        assert_eq!(parse_sni(&record).as_deref(), Some("inner.example.com"));
    }

    #[test]
    fn rewrite_replaces_the_name_and_stays_parseable() {
        let record = synthesize("original.example.com");
        let longer = rewrite_sni(&record, "much-longer-name.example.net").unwrap();
        assert_eq!(
            parse_sni(&longer).as_deref(),
            Some("much-longer-name.example.net")
        );
        let shorter = rewrite_sni(&longer, "a.io").unwrap();
        assert_eq!(parse_sni(&shorter).as_deref(), Some("a.io"));

        // record length field stays consistent with the body
        let len = u16::from_be_bytes([shorter[3], shorter[4]]) as usize;
        assert_eq!(shorter.len(), RECORD_HEADER_LEN + len);
    }

    #[test]
    fn non_handshake_records_are_rejected() {
        assert!(parse_sni(b"GET / HTTP/1.1\r\n").is_none());
        assert!(parse_sni(&[0x17, 0x03, 0x03, 0x00, 0x01, 0x00]).is_none());
    }

    #[test]
    fn truncated_hello_is_rejected() {
        let mut record = synthesize("host.example.com");
        record.truncate(record.len() - 4);
        // lengths now point past the end
        assert!(parse_sni(&record).is_none());
    }
}
