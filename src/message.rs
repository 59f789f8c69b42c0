//! Commit log record codec.
//!
//! Record layout (little-endian):
//!
//! ```text
//! 0   total size      u32
//! 4   magic           u32
//! 8   body crc32      u32
//! 12  queue id        u32
//! 16  flag            i32
//! 20  queue offset    u64
//! 28  physical offset u64
//! 36  sys flag        i32
//! 40  born timestamp  u64
//! 48  born host       ipv4 (4) + port (4)
//! 56  store timestamp u64
//! 64  store host      ipv4 (4) + port (4)
//! 72  reconsume times i32
//! 76  prepared tx off u64
//! 84  body            u32 len + bytes
//!     topic           u8 len + bytes
//!     properties      u16 len + bytes
//! ```
//!
//! A blank record (`BLANK_MAGIC`) pads the tail of a segment; its total size
//! spans the rest of the file.

use std::collections::BTreeMap;
use std::net::{Ipv4Addr, SocketAddrV4};

use crate::dispatch::DispatchRequest;
use crate::{Error, Result};

pub const MESSAGE_MAGIC: u32 = 0xdaa3_20a7;
pub const BLANK_MAGIC: u32 = 0xcbd4_3194;

/// Smallest blank record: total size + magic.
pub const END_FILE_MIN_BLANK_LENGTH: usize = 8;
pub const MAX_TOPIC_LENGTH: usize = i8::MAX as usize;
pub const MAX_PROPERTIES_LENGTH: usize = i16::MAX as usize;

const QUEUE_OFFSET_POSITION: usize = 20;
const PHYSICAL_OFFSET_POSITION: usize = 28;
pub const STORE_TIMESTAMP_POSITION: usize = 56;
const BODY_POSITION: usize = 84;
const FIXED_LENGTH: usize = BODY_POSITION + 4 + 1 + 2;

pub const PROPERTY_TAGS: &str = "TAGS";
pub const PROPERTY_KEYS: &str = "KEYS";
pub const PROPERTY_UNIQ_KEY: &str = "UNIQ_KEY";
pub const KEY_SEPARATOR: char = ' ';
const NAME_VALUE_SEPARATOR: char = '\u{1}';
const PROPERTY_SEPARATOR: char = '\u{2}';

pub mod sys_flag {
    pub const COMPRESSED: i32 = 1;
    pub const MULTI_TAGS: i32 = 1 << 1;
    pub const TRANSACTION_NOT_TYPE: i32 = 0;
    pub const TRANSACTION_PREPARED_TYPE: i32 = 1 << 2;
    pub const TRANSACTION_COMMIT_TYPE: i32 = 2 << 2;
    pub const TRANSACTION_ROLLBACK_TYPE: i32 = 3 << 2;

    pub fn transaction_value(flag: i32) -> i32 {
        flag & TRANSACTION_ROLLBACK_TYPE
    }

    pub fn reset_transaction_value(flag: i32, ty: i32) -> i32 {
        (flag & !TRANSACTION_ROLLBACK_TYPE) | ty
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionType {
    NotType,
    Prepared,
    Commit,
    Rollback,
}

impl TransactionType {
    pub fn from_sys_flag(flag: i32) -> Self {
        match sys_flag::transaction_value(flag) {
            sys_flag::TRANSACTION_PREPARED_TYPE => TransactionType::Prepared,
            sys_flag::TRANSACTION_COMMIT_TYPE => TransactionType::Commit,
            sys_flag::TRANSACTION_ROLLBACK_TYPE => TransactionType::Rollback,
            _ => TransactionType::NotType,
        }
    }

    /// Prepared and rollback markers take no queue slot.
    pub fn is_dispatched(self) -> bool {
        matches!(self, TransactionType::NotType | TransactionType::Commit)
    }
}

/// A message as handed to `put_message`.
#[derive(Debug, Clone)]
pub struct Message {
    pub topic: String,
    pub queue_id: u32,
    pub flag: i32,
    pub body: Vec<u8>,
    pub properties: BTreeMap<String, String>,
    pub sys_flag: i32,
    pub born_timestamp: u64,
    pub born_host: SocketAddrV4,
    pub reconsume_times: i32,
    pub prepared_transaction_offset: u64,
}

impl Message {
    pub fn new(topic: impl Into<String>, queue_id: u32, body: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            queue_id,
            flag: 0,
            body: body.into(),
            properties: BTreeMap::new(),
            sys_flag: 0,
            born_timestamp: crate::clock::wall_ms(),
            born_host: SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0),
            reconsume_times: 0,
            prepared_transaction_offset: 0,
        }
    }

    pub fn with_tags(mut self, tags: impl Into<String>) -> Self {
        self.properties.insert(PROPERTY_TAGS.to_string(), tags.into());
        self
    }

    /// Sets the space separated lookup keys.
    pub fn with_keys<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let joined = keys
            .into_iter()
            .map(|k| k.as_ref().to_string())
            .collect::<Vec<_>>()
            .join(" ");
        self.properties.insert(PROPERTY_KEYS.to_string(), joined);
        self
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub fn with_transaction(mut self, ty: i32) -> Self {
        self.sys_flag = sys_flag::reset_transaction_value(self.sys_flag, ty);
        self
    }

    pub fn tags(&self) -> Option<&str> {
        self.properties.get(PROPERTY_TAGS).map(String::as_str)
    }

    pub fn keys(&self) -> Option<&str> {
        self.properties.get(PROPERTY_KEYS).map(String::as_str)
    }

    pub fn transaction_type(&self) -> TransactionType {
        TransactionType::from_sys_flag(self.sys_flag)
    }
}

/// A record decoded from the commit log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageExt {
    pub store_size: u32,
    pub body_crc: u32,
    pub topic: String,
    pub queue_id: u32,
    pub flag: i32,
    pub queue_offset: u64,
    pub commit_log_offset: u64,
    pub sys_flag: i32,
    pub born_timestamp: u64,
    pub born_host: SocketAddrV4,
    pub store_timestamp: u64,
    pub store_host: SocketAddrV4,
    pub reconsume_times: i32,
    pub prepared_transaction_offset: u64,
    pub body: Vec<u8>,
    pub properties: BTreeMap<String, String>,
    pub msg_id: String,
}

impl MessageExt {
    pub fn tags(&self) -> Option<&str> {
        self.properties.get(PROPERTY_TAGS).map(String::as_str)
    }

    pub fn keys(&self) -> Option<&str> {
        self.properties.get(PROPERTY_KEYS).map(String::as_str)
    }
}

pub fn properties_to_string(properties: &BTreeMap<String, String>) -> String {
    let mut out = String::new();
    for (key, value) in properties {
        out.push_str(key);
        out.push(NAME_VALUE_SEPARATOR);
        out.push_str(value);
        out.push(PROPERTY_SEPARATOR);
    }
    out
}

pub fn string_to_properties(text: &str) -> BTreeMap<String, String> {
    text.split(PROPERTY_SEPARATOR)
        .filter_map(|item| {
            let (key, value) = item.split_once(NAME_VALUE_SEPARATOR)?;
            Some((key.to_string(), value.to_string()))
        })
        .collect()
}

/// Hash stored in the consume queue for a tag. Matches the 32-bit string hash
/// used by clients to build subscriptions.
pub fn tags_string_to_tags_code(tags: &str) -> i64 {
    if tags.is_empty() {
        return 0;
    }
    string_hash_code(tags) as i64
}

/// 32-bit polynomial string hash over UTF-16 code units (`h = 31 * h + c`).
pub fn string_hash_code(s: &str) -> i32 {
    s.encode_utf16()
        .fold(0i32, |h, c| h.wrapping_mul(31).wrapping_add(c as i32))
}

/// `STORE_HOST(8) + PHYSICAL_OFFSET(8)` rendered as 32 uppercase hex digits.
pub fn create_message_id(store_host: SocketAddrV4, physical_offset: u64) -> String {
    format!(
        "{:08X}{:08X}{:016X}",
        u32::from(*store_host.ip()),
        store_host.port() as u32,
        physical_offset
    )
}

pub fn calc_msg_length(body_len: usize, topic_len: usize, properties_len: usize) -> usize {
    FIXED_LENGTH + body_len + topic_len + properties_len
}

/// Store-assigned fields written alongside the producer's message.
#[derive(Debug, Clone, Copy)]
pub struct RecordStamp {
    pub queue_offset: u64,
    pub physical_offset: u64,
    pub store_timestamp: u64,
    pub store_host: SocketAddrV4,
}

/// Serializes `msg` into `buf` (cleared first). `properties` is the already
/// serialized property string so the caller can validate its length once.
pub fn encode_record(buf: &mut Vec<u8>, msg: &Message, properties: &[u8], stamp: RecordStamp) {
    let total = calc_msg_length(msg.body.len(), msg.topic.len(), properties.len());
    buf.clear();
    buf.reserve(total);
    buf.extend_from_slice(&(total as u32).to_le_bytes());
    buf.extend_from_slice(&MESSAGE_MAGIC.to_le_bytes());
    buf.extend_from_slice(&crc32fast::hash(&msg.body).to_le_bytes());
    buf.extend_from_slice(&msg.queue_id.to_le_bytes());
    buf.extend_from_slice(&msg.flag.to_le_bytes());
    buf.extend_from_slice(&stamp.queue_offset.to_le_bytes());
    buf.extend_from_slice(&stamp.physical_offset.to_le_bytes());
    buf.extend_from_slice(&msg.sys_flag.to_le_bytes());
    buf.extend_from_slice(&msg.born_timestamp.to_le_bytes());
    put_host(buf, msg.born_host);
    buf.extend_from_slice(&stamp.store_timestamp.to_le_bytes());
    put_host(buf, stamp.store_host);
    buf.extend_from_slice(&msg.reconsume_times.to_le_bytes());
    buf.extend_from_slice(&msg.prepared_transaction_offset.to_le_bytes());
    buf.extend_from_slice(&(msg.body.len() as u32).to_le_bytes());
    buf.extend_from_slice(&msg.body);
    buf.push(msg.topic.len() as u8);
    buf.extend_from_slice(msg.topic.as_bytes());
    buf.extend_from_slice(&(properties.len() as u16).to_le_bytes());
    buf.extend_from_slice(properties);
    debug_assert_eq!(buf.len(), total);
}

/// Blank record header for the `remaining` bytes at the end of a segment.
pub fn encode_blank(remaining: usize) -> [u8; END_FILE_MIN_BLANK_LENGTH] {
    let mut out = [0u8; END_FILE_MIN_BLANK_LENGTH];
    out[..4].copy_from_slice(&(remaining as u32).to_le_bytes());
    out[4..].copy_from_slice(&BLANK_MAGIC.to_le_bytes());
    out
}

fn put_host(buf: &mut Vec<u8>, host: SocketAddrV4) {
    buf.extend_from_slice(&host.ip().octets());
    buf.extend_from_slice(&(host.port() as u32).to_le_bytes());
}

pub(crate) fn read_u32(bytes: &[u8], pos: usize) -> Option<u32> {
    let raw = bytes.get(pos..pos + 4)?;
    Some(u32::from_le_bytes(raw.try_into().ok()?))
}

pub(crate) fn read_u64(bytes: &[u8], pos: usize) -> Option<u64> {
    let raw = bytes.get(pos..pos + 8)?;
    Some(u64::from_le_bytes(raw.try_into().ok()?))
}

fn read_i32(bytes: &[u8], pos: usize) -> Option<i32> {
    read_u32(bytes, pos).map(|v| v as i32)
}

fn read_host(bytes: &[u8], pos: usize) -> Option<SocketAddrV4> {
    let ip: [u8; 4] = bytes.get(pos..pos + 4)?.try_into().ok()?;
    let port = read_u32(bytes, pos + 4)?;
    Some(SocketAddrV4::new(Ipv4Addr::from(ip), port as u16))
}

/// Outcome of validating the bytes at a read position.
#[derive(Debug)]
pub enum RecordCheck {
    /// A complete record of `request.msg_size` bytes.
    Valid(DispatchRequest),
    /// End-of-segment padding; continue at the next segment.
    Blank,
    /// Truncated, torn or unknown bytes.
    Invalid,
}

/// Validates the record at the start of `bytes` and extracts what dispatch
/// needs from it.
pub fn check_message_and_return_size(bytes: &[u8], check_crc: bool) -> RecordCheck {
    match parse_record(bytes, check_crc) {
        Some(check) => check,
        None => RecordCheck::Invalid,
    }
}

fn parse_record(bytes: &[u8], check_crc: bool) -> Option<RecordCheck> {
    let total = read_u32(bytes, 0)? as usize;
    match read_u32(bytes, 4)? {
        MESSAGE_MAGIC => {}
        BLANK_MAGIC => return Some(RecordCheck::Blank),
        _ => return Some(RecordCheck::Invalid),
    }
    if total < FIXED_LENGTH || total > bytes.len() {
        return Some(RecordCheck::Invalid);
    }
    let record = &bytes[..total];
    let body_crc = read_u32(record, 8)?;
    let queue_id = read_u32(record, 12)?;
    let queue_offset = read_u64(record, QUEUE_OFFSET_POSITION)?;
    let physical_offset = read_u64(record, PHYSICAL_OFFSET_POSITION)?;
    let sys_flag = read_i32(record, 36)?;
    let store_timestamp = read_u64(record, STORE_TIMESTAMP_POSITION)?;
    let prepared_transaction_offset = read_u64(record, 76)?;

    let body_len = read_u32(record, BODY_POSITION)? as usize;
    let body_start = BODY_POSITION + 4;
    let body = record.get(body_start..body_start.checked_add(body_len)?)?;
    if check_crc && crc32fast::hash(body) != body_crc {
        return Some(RecordCheck::Invalid);
    }
    let topic_pos = body_start + body_len;
    let topic_len = *record.get(topic_pos)? as usize;
    let topic = std::str::from_utf8(record.get(topic_pos + 1..topic_pos + 1 + topic_len)?).ok()?;
    let props_pos = topic_pos + 1 + topic_len;
    let props_len = u16::from_le_bytes(record.get(props_pos..props_pos + 2)?.try_into().ok()?) as usize;
    let props = std::str::from_utf8(record.get(props_pos + 2..props_pos + 2 + props_len)?).ok()?;
    if calc_msg_length(body_len, topic_len, props_len) != total {
        return Some(RecordCheck::Invalid);
    }

    let properties = string_to_properties(props);
    let tags_code = properties
        .get(PROPERTY_TAGS)
        .map(|t| tags_string_to_tags_code(t))
        .unwrap_or(0);
    let keys = properties.get(PROPERTY_KEYS).cloned().unwrap_or_default();
    let uniq_key = properties.get(PROPERTY_UNIQ_KEY).cloned();
    Some(RecordCheck::Valid(DispatchRequest {
        topic: topic.to_string(),
        queue_id,
        commit_log_offset: physical_offset,
        msg_size: total as u32,
        tags_code,
        store_timestamp,
        consume_queue_offset: queue_offset,
        keys,
        uniq_key,
        sys_flag,
        prepared_transaction_offset,
    }))
}

/// Decodes a full record. Fails on blank or malformed bytes.
pub fn decode(bytes: &[u8], read_body: bool) -> Result<MessageExt> {
    let total = read_u32(bytes, 0).ok_or(Error::Corrupt("record header truncated"))? as usize;
    if read_u32(bytes, 4) != Some(MESSAGE_MAGIC) {
        return Err(Error::Corrupt("bad record magic"));
    }
    if total < FIXED_LENGTH || total > bytes.len() {
        return Err(Error::Corrupt("record truncated"));
    }
    let record = &bytes[..total];
    let field = |v: Option<u64>| v.ok_or(Error::Corrupt("record field truncated"));
    let body_len = field(read_u32(record, BODY_POSITION).map(u64::from))? as usize;
    let body_start = BODY_POSITION + 4;
    let topic_pos = body_start + body_len;
    let topic_len = *record.get(topic_pos).ok_or(Error::Corrupt("record topic truncated"))? as usize;
    let topic = record
        .get(topic_pos + 1..topic_pos + 1 + topic_len)
        .and_then(|t| std::str::from_utf8(t).ok())
        .ok_or(Error::Corrupt("record topic invalid"))?;
    let props_pos = topic_pos + 1 + topic_len;
    let props_len = record
        .get(props_pos..props_pos + 2)
        .map(|raw| u16::from_le_bytes([raw[0], raw[1]]) as usize)
        .ok_or(Error::Corrupt("record properties truncated"))?;
    let props = record
        .get(props_pos + 2..props_pos + 2 + props_len)
        .and_then(|p| std::str::from_utf8(p).ok())
        .ok_or(Error::Corrupt("record properties invalid"))?;

    let host = |pos| read_host(record, pos).ok_or(Error::Corrupt("record host truncated"));
    let commit_log_offset = field(read_u64(record, PHYSICAL_OFFSET_POSITION))?;
    let store_host = host(64)?;
    Ok(MessageExt {
        store_size: total as u32,
        body_crc: field(read_u32(record, 8).map(u64::from))? as u32,
        topic: topic.to_string(),
        queue_id: field(read_u32(record, 12).map(u64::from))? as u32,
        flag: field(read_u32(record, 16).map(u64::from))? as i32,
        queue_offset: field(read_u64(record, QUEUE_OFFSET_POSITION))?,
        commit_log_offset,
        sys_flag: field(read_u32(record, 36).map(u64::from))? as i32,
        born_timestamp: field(read_u64(record, 40))?,
        born_host: host(48)?,
        store_timestamp: field(read_u64(record, STORE_TIMESTAMP_POSITION))?,
        store_host,
        reconsume_times: field(read_u32(record, 72).map(u64::from))? as i32,
        prepared_transaction_offset: field(read_u64(record, 76))?,
        body: if read_body {
            record[body_start..topic_pos].to_vec()
        } else {
            Vec::new()
        },
        properties: string_to_properties(props),
        msg_id: create_message_id(store_host, commit_log_offset),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stamp(queue_offset: u64, physical_offset: u64) -> RecordStamp {
        RecordStamp {
            queue_offset,
            physical_offset,
            store_timestamp: 1_700_000_000_000,
            store_host: "10.0.0.1:10911".parse().expect("addr"),
        }
    }

    #[test]
    fn encoded_record_decodes_with_store_fields() -> Result<()> {
        let msg = Message::new("orders", 3, b"payload".to_vec())
            .with_tags("TagA")
            .with_keys(["k1", "k2"]);
        let props = properties_to_string(&msg.properties);
        let mut buf = Vec::new();
        encode_record(&mut buf, &msg, props.as_bytes(), stamp(7, 4096));
        assert_eq!(buf.len(), calc_msg_length(7, 6, props.len()));

        let ext = decode(&buf, true)?;
        assert_eq!(ext.topic, "orders");
        assert_eq!(ext.queue_id, 3);
        assert_eq!(ext.queue_offset, 7);
        assert_eq!(ext.commit_log_offset, 4096);
        assert_eq!(ext.body, b"payload");
        assert_eq!(ext.tags(), Some("TagA"));
        assert_eq!(ext.keys(), Some("k1 k2"));
        assert_eq!(ext.msg_id, "0A00000100002A9F0000000000001000");
        Ok(())
    }

    #[test]
    fn check_detects_crc_mismatch_and_truncation() {
        let msg = Message::new("t", 0, b"abc".to_vec()).with_tags("x");
        let props = properties_to_string(&msg.properties);
        let mut buf = Vec::new();
        encode_record(&mut buf, &msg, props.as_bytes(), stamp(0, 0));

        match check_message_and_return_size(&buf, true) {
            RecordCheck::Valid(req) => {
                assert_eq!(req.msg_size as usize, buf.len());
                assert_eq!(req.tags_code, tags_string_to_tags_code("x"));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(
            check_message_and_return_size(&buf[..buf.len() - 1], true),
            RecordCheck::Invalid
        ));
        let body_at = BODY_POSITION + 4;
        buf[body_at] ^= 0xff;
        assert!(matches!(check_message_and_return_size(&buf, true), RecordCheck::Invalid));
        assert!(matches!(check_message_and_return_size(&buf, false), RecordCheck::Valid(_)));
    }

    #[test]
    fn blank_marker_is_recognised() {
        let blank = encode_blank(100);
        assert!(matches!(check_message_and_return_size(&blank, true), RecordCheck::Blank));
    }

    #[test]
    fn tags_code_matches_string_hash() {
        assert_eq!(tags_string_to_tags_code("TagA"), 2_598_919);
        assert_eq!(tags_string_to_tags_code(""), 0);
    }

    #[test]
    fn transaction_markers_are_not_dispatched() {
        let prepared = Message::new("t", 0, Vec::new())
            .with_transaction(sys_flag::TRANSACTION_PREPARED_TYPE);
        assert_eq!(prepared.transaction_type(), TransactionType::Prepared);
        assert!(!prepared.transaction_type().is_dispatched());
        assert!(TransactionType::Commit.is_dispatched());
    }
}
