//! Table codec: the key and value layout of records and index entries.
//!
//! Layout (all integers order-preserving big-endian with the sign bit
//! flipped, so byte order equals numeric order):
//!
//! ```text
//! record key:  t | table id | _r | handle
//! index key:   t | table id | _i | index id | indexed value | handle
//! index value: partition id | handle
//! row value:   (column id | value len | value bytes)*
//! ```

use anyhow::{
    bail,
    Context,
    Result,
};

use crate::key::Key;

const TABLE_PREFIX: u8 = b't';
const RECORD_SEP: &[u8] = b"_r";
const INDEX_SEP: &[u8] = b"_i";
const ID_LEN: usize = 8;
const RECORD_PREFIX_LEN: usize = 1 + ID_LEN + 2;
const RECORD_KEY_LEN: usize = RECORD_PREFIX_LEN + ID_LEN;

const SIGN_MASK: u64 = 1 << 63;

fn encode_i64(buf: &mut Vec<u8>, v: i64) {
    buf.extend_from_slice(&((v as u64) ^ SIGN_MASK).to_be_bytes());
}

fn decode_i64(b: &[u8]) -> Result<i64> {
    let raw: [u8; ID_LEN] = b
        .get(..ID_LEN)
        .context("key too short for an encoded integer")?
        .try_into()?;
    Ok((u64::from_be_bytes(raw) ^ SIGN_MASK) as i64)
}

pub fn table_prefix(table_id: i64) -> Key {
    let mut buf = Vec::with_capacity(1 + ID_LEN);
    buf.push(TABLE_PREFIX);
    encode_i64(&mut buf, table_id);
    Key::new(buf)
}

pub fn record_prefix(table_id: i64) -> Key {
    let mut buf = table_prefix(table_id).into_bytes();
    buf.extend_from_slice(RECORD_SEP);
    Key::new(buf)
}

/// Prefix covering every index of the table.
pub fn index_root_prefix(table_id: i64) -> Key {
    let mut buf = table_prefix(table_id).into_bytes();
    buf.extend_from_slice(INDEX_SEP);
    Key::new(buf)
}

pub fn index_prefix(table_id: i64, index_id: i64) -> Key {
    let mut buf = index_root_prefix(table_id).into_bytes();
    encode_i64(&mut buf, index_id);
    Key::new(buf)
}

pub fn encode_record_key(table_id: i64, handle: i64) -> Key {
    let mut buf = record_prefix(table_id).into_bytes();
    encode_i64(&mut buf, handle);
    Key::new(buf)
}

pub fn is_record_key(key: &Key) -> bool {
    let b = key.as_bytes();
    b.len() >= RECORD_PREFIX_LEN
        && b[0] == TABLE_PREFIX
        && &b[1 + ID_LEN..RECORD_PREFIX_LEN] == RECORD_SEP
}

pub fn decode_record_handle(key: &Key) -> Result<i64> {
    if !is_record_key(key) || key.len() < RECORD_KEY_LEN {
        bail!("not a record key: {key}");
    }
    decode_i64(&key.as_bytes()[RECORD_PREFIX_LEN..])
}

pub fn encode_index_key(table_id: i64, index_id: i64, value: &[u8], handle: i64) -> Key {
    let mut buf = index_prefix(table_id, index_id).into_bytes();
    buf.extend_from_slice(value);
    encode_i64(&mut buf, handle);
    Key::new(buf)
}

/// The part of an index key after its index prefix: indexed value + handle.
pub fn index_key_suffix<'a>(key: &'a Key, prefix: &Key) -> Result<&'a [u8]> {
    if !key.has_prefix(prefix) {
        bail!("key {key} is not under index prefix {prefix}");
    }
    Ok(&key.as_bytes()[prefix.len()..])
}

pub fn encode_index_value(partition_id: i64, handle: i64) -> Vec<u8> {
    let mut buf = Vec::with_capacity(2 * ID_LEN);
    encode_i64(&mut buf, partition_id);
    encode_i64(&mut buf, handle);
    buf
}

pub fn decode_index_value(raw: &[u8]) -> Result<(i64, i64)> {
    if raw.len() != 2 * ID_LEN {
        bail!("malformed index value of {} bytes", raw.len());
    }
    Ok((decode_i64(&raw[..ID_LEN])?, decode_i64(&raw[ID_LEN..])?))
}

pub fn encode_row(columns: &[(i64, Vec<u8>)]) -> Vec<u8> {
    let mut buf = Vec::new();
    for (column_id, value) in columns {
        encode_i64(&mut buf, *column_id);
        buf.extend_from_slice(&(value.len() as u32).to_be_bytes());
        buf.extend_from_slice(value);
    }
    buf
}

pub fn decode_row(raw: &[u8]) -> Result<Vec<(i64, Vec<u8>)>> {
    let mut columns = Vec::new();
    let mut rest = raw;
    while !rest.is_empty() {
        let column_id = decode_i64(rest)?;
        rest = &rest[ID_LEN..];
        let len: [u8; 4] = rest
            .get(..4)
            .context("truncated column length")?
            .try_into()?;
        let len = u32::from_be_bytes(len) as usize;
        rest = &rest[4..];
        let value = rest.get(..len).context("truncated column value")?;
        columns.push((column_id, value.to_vec()));
        rest = &rest[len..];
    }
    Ok(columns)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_record_key_shape() {
        let key = encode_record_key(5, 42);
        assert!(is_record_key(&key));
        assert!(key.has_prefix(&record_prefix(5)));
        assert_eq!(decode_record_handle(&key).unwrap(), 42);
        assert!(!is_record_key(&index_prefix(5, 1)));
    }

    #[test]
    fn test_handle_order_matches_key_order() {
        let negative = encode_record_key(5, -3);
        let zero = encode_record_key(5, 0);
        let positive = encode_record_key(5, 7);
        assert!(negative < zero);
        assert!(zero < positive);
    }

    #[test]
    fn test_row_codec() {
        let columns = vec![(1, b"abc".to_vec()), (2, vec![]), (9, vec![0xff; 4])];
        assert_eq!(decode_row(&encode_row(&columns)).unwrap(), columns);
        assert!(decode_row(&[1, 2, 3]).is_err());
    }

    #[test]
    fn test_index_value_carries_partition() {
        let raw = encode_index_value(100, 7);
        assert_eq!(decode_index_value(&raw).unwrap(), (100, 7));
    }
}
