//! Text record framing: each payload is terminated by `0x1E`.

use bytes::{BufMut, BytesMut};

/// ASCII record separator terminating every text frame.
pub const RECORD_SEPARATOR: u8 = 0x1e;

/// Append `payload` followed by the record separator.
pub fn write_record(payload: &[u8], out: &mut BytesMut) {
    out.reserve(payload.len() + 1);
    out.put_slice(payload);
    out.put_u8(RECORD_SEPARATOR);
}

/// Split the next complete record off the front of `buf`.
///
/// Returns the payload without its separator, or `None` if `buf` does not
/// yet contain a full record. Incomplete data is left in place.
pub fn try_split_record(buf: &mut BytesMut) -> Option<BytesMut> {
    let pos = buf.iter().position(|b| *b == RECORD_SEPARATOR)?;
    let mut record = buf.split_to(pos + 1);
    record.truncate(pos);
    Some(record)
}
