//! Decoder for "packed" `(rd, fn)` pairs (`SPEC_FULL.md` §3 data model: a
//! leading `//` sentinel marks a directory/filename pair that could not be
//! stored as plain UTF-8 by the upload/scanner collaborator).
//!
//! The collaborator that writes these rows is out of scope (§1 Non-goals);
//! this module only needs to be able to reverse whatever reversible mapping
//! it used. We map each byte outside the ASCII range into the private-use
//! codepoints `U+F780..=U+F7FF`, which keeps the packed string valid UTF-8
//! (so it survives a TEXT column round-trip) while staying losslessly
//! reversible — the same scheme `encode_packed` below produces, used only
//! by this module's own tests since the real encoder lives upstream of this
//! crate.

const PACK_SENTINEL: &str = "//";
const PACK_BASE: u32 = 0xF780;

/// Encodes raw bytes into the packed text form. Exposed for tests; the real
/// upload/scanner collaborator is the one producing packed rows in
/// production.
#[cfg(test)]
pub fn encode_packed(raw: &[u8]) -> String {
    let mut out = String::from(PACK_SENTINEL);
    for &b in raw {
        if b.is_ascii() && b != b'\n' {
            out.push(b as char);
        } else {
            out.push(char::from_u32(PACK_BASE + b as u32).expect("byte maps into private-use range"));
        }
    }
    out
}

/// Decodes a packed string back to raw bytes, dropping the `//` sentinel.
fn decode_one(packed: &str) -> Vec<u8> {
    let body = packed.strip_prefix(PACK_SENTINEL).unwrap_or(packed);
    let mut out = Vec::with_capacity(body.len());
    for c in body.chars() {
        let cp = c as u32;
        if (PACK_BASE..=PACK_BASE + 0xFF).contains(&cp) {
            out.push((cp - PACK_BASE) as u8);
        } else {
            let mut buf = [0u8; 4];
            out.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
        }
    }
    out
}

/// Best-effort decode of packed bytes back to a displayable `String`. Bytes
/// that don't round-trip to valid UTF-8 are replaced (`U+FFFD`) rather than
/// failing the whole row — a single mis-encoded filename must not take down
/// an entire search.
fn decode_lossy(packed: &str) -> String {
    String::from_utf8_lossy(&decode_one(packed)).into_owned()
}

/// Decodes a catalog row's `(rd, fn)` pair if either half is packed
/// (`SPEC_FULL.md` §3). Unpacked pairs pass through unchanged.
pub fn decode_rd_fn(rd: &str, fn_: &str) -> (String, String) {
    let rd = if rd.starts_with(PACK_SENTINEL) { decode_lossy(rd) } else { rd.to_string() };
    let fn_ = if fn_.starts_with(PACK_SENTINEL) { decode_lossy(fn_) } else { fn_.to_string() };
    (rd, fn_)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unpacked_pairs_pass_through() {
        assert_eq!(decode_rd_fn("dir", "file.bin"), ("dir".to_string(), "file.bin".to_string()));
    }

    #[test]
    fn packed_round_trips_through_encode_decode() {
        let raw = b"na\xefve.txt";
        let packed = encode_packed(raw);
        assert!(packed.starts_with("//"));
        let (_, fn_) = decode_rd_fn("", &packed);
        assert_eq!(fn_, String::from_utf8_lossy(raw));
    }

    #[test]
    fn only_the_packed_half_is_decoded() {
        let packed_fn = encode_packed(b"plain.txt");
        let (rd, fn_) = decode_rd_fn("normal-dir", &packed_fn);
        assert_eq!(rd, "normal-dir");
        assert_eq!(fn_, "plain.txt");
    }
}
