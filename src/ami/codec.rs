use super::action::AmiAction;
use bytes::{BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Substring of the single line the manager interface sends on accept.
pub const GREETING: &str = "Asterisk Call Manager";

/// Ordered `Key: Value` pairs of one block. Keys may repeat (`Variable`),
/// lookups are case-insensitive and return the first match.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Fields(Vec<(String, String)>);

impl Fields {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn push(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.push((key.into(), value.into()));
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }

    /// Value of `key`, or an empty string when absent.
    pub fn value(&self, key: &str) -> String {
        self.get(key).unwrap_or_default().to_string()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Fields {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AmiResponse {
    pub fields: Fields,
}

impl AmiResponse {
    pub fn action_id(&self) -> Option<&str> {
        self.fields.get("ActionID")
    }

    pub fn outcome(&self) -> &str {
        self.fields.get("Response").unwrap_or_default()
    }

    pub fn is_success(&self) -> bool {
        self.outcome().eq_ignore_ascii_case("Success")
    }

    pub fn message(&self) -> Option<&str> {
        self.fields.get("Message")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AmiEvent {
    pub fields: Fields,
}

impl AmiEvent {
    pub fn name(&self) -> &str {
        self.fields.get("Event").unwrap_or_default()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields.get(key)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AmiMessage {
    Response(AmiResponse),
    Event(AmiEvent),
}

impl AmiMessage {
    /// Classify a parsed block; blocks that are neither are dropped.
    pub fn from_fields(fields: Fields) -> Option<Self> {
        if fields.contains("Response") {
            Some(AmiMessage::Response(AmiResponse { fields }))
        } else if fields.contains("Event") {
            Some(AmiMessage::Event(AmiEvent { fields }))
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AmiFrame {
    Greeting(String),
    Message(AmiMessage),
}

pub fn parse_block(block: &[u8]) -> Fields {
    String::from_utf8_lossy(block)
        .lines()
        .filter_map(|line| {
            let (key, value) = line.split_once(':')?;
            let key = key.trim();
            if key.is_empty() {
                return None;
            }
            Some((key.to_string(), value.trim().to_string()))
        })
        .collect()
}

/// Position and length of the earliest blank-line delimiter at or after `from`.
fn find_delimiter(buf: &[u8], from: usize) -> Option<(usize, usize)> {
    for i in from..buf.len() {
        if buf[i..].starts_with(b"\r\n\r\n") {
            return Some((i, 4));
        }
        if buf[i..].starts_with(b"\n\n") {
            return Some((i, 2));
        }
    }
    None
}

/// Stream codec for the manager interface. The first line received is
/// checked for the greeting, everything after is split into blocks.
#[derive(Debug, Default)]
pub struct AmiCodec {
    greeted: bool,
    /// Bytes of the pending block already searched for a delimiter
    scanned: usize,
}

impl AmiCodec {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Decoder for AmiCodec {
    type Item = AmiFrame;
    type Error = std::io::Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<AmiFrame>, Self::Error> {
        if !self.greeted {
            let Some(pos) = buf.iter().position(|b| *b == b'\n') else {
                return Ok(None);
            };
            self.greeted = true;
            let line = String::from_utf8_lossy(&buf[..pos]).trim().to_string();
            if line.contains(GREETING) {
                let _ = buf.split_to(pos + 1);
                return Ok(Some(AmiFrame::Greeting(line)));
            }
        }

        loop {
            // a delimiter may straddle two reads, so back up three bytes
            let from = self.scanned.saturating_sub(3);
            let Some((end, len)) = find_delimiter(buf, from) else {
                self.scanned = buf.len();
                return Ok(None);
            };
            self.scanned = 0;
            let block = buf.split_to(end + len);
            if let Some(message) = AmiMessage::from_fields(parse_block(&block[..end])) {
                return Ok(Some(AmiFrame::Message(message)));
            }
        }
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<AmiFrame>, Self::Error> {
        match self.decode(buf)? {
            Some(frame) => Ok(Some(frame)),
            None => {
                buf.clear();
                self.scanned = 0;
                Ok(None)
            }
        }
    }
}

impl Encoder<AmiAction> for AmiCodec {
    type Error = std::io::Error;

    fn encode(&mut self, action: AmiAction, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let wire = action.to_wire();
        dst.reserve(wire.len());
        dst.put_slice(wire.as_bytes());
        Ok(())
    }
}
