//! HPACK header compression (RFC 7541): static/dynamic tables, the
//! prefix-integer codec, and the four header representations.
use crate::error::H2Error;
use crate::huffman;
use crate::types::HeaderList;
use bytes::{BufMut, Bytes, BytesMut};
use std::collections::{HashSet, VecDeque};

#[derive(Debug, Clone)]
struct TableEntry {
    pub size: usize,
    pub name: Bytes,
    pub value: Bytes,
}

impl TableEntry {
    pub fn new(name: Bytes, value: Bytes) -> Self {
        Self {
            size: name.len() + value.len() + 32,
            name,
            value,
        }
    }
}

macro_rules! static_table {
    ( $( $name:expr => $value:expr ),+ ) => {
        [
            $(
                TableEntry {
                    size: $name.len() + $value.len() + 32,
                    name: Bytes::from_static($name),
                    value: Bytes::from_static($value),
                }
            ),+
        ]
    };
}

/// https://httpwg.org/specs/rfc7541.html#static.table.definition
static STATIC_TABLE: [TableEntry; 61] = static_table![
    b":authority" => b"",
    b":method" => b"GET",
    b":method" => b"POST",
    b":path" => b"/",
    b":path" => b"/index.html",
    b":scheme" => b"http",
    b":scheme" => b"https",
    b":status" => b"200",
    b":status" => b"204",
    b":status" => b"206",
    b":status" => b"304",
    b":status" => b"400",
    b":status" => b"404",
    b":status" => b"500",
    b"accept-charset" => b"",
    b"accept-encoding" => b"gzip, deflate",
    b"accept-language" => b"",
    b"accept-ranges" => b"",
    b"accept" => b"",
    b"access-control-allow-origin" => b"",
    b"age" => b"",
    b"allow" => b"",
    b"authorization" => b"",
    b"cache-control" => b"",
    b"content-disposition" => b"",
    b"content-encoding" => b"",
    b"content-language" => b"",
    b"content-length" => b"",
    b"content-location" => b"",
    b"content-range" => b"",
    b"content-type" => b"",
    b"cookie" => b"",
    b"date" => b"",
    b"etag" => b"",
    b"expect" => b"",
    b"expires" => b"",
    b"from" => b"",
    b"host" => b"",
    b"if-match" => b"",
    b"if-modified-since" => b"",
    b"if-none-match" => b"",
    b"if-range" => b"",
    b"if-unmodified-since" => b"",
    b"last-modified" => b"",
    b"link" => b"",
    b"location" => b"",
    b"max-forwards" => b"",
    b"proxy-authenticate" => b"",
    b"proxy-authorization" => b"",
    b"range" => b"",
    b"referer" => b"",
    b"refresh" => b"",
    b"retry-after" => b"",
    b"server" => b"",
    b"set-cookie" => b"",
    b"strict-transport-security" => b"",
    b"transfer-encoding" => b"",
    b"user-agent" => b"",
    b"vary" => b"",
    b"via" => b"",
    b"www-authenticate" => b""
];

const SENSITIVE_NAMES: &[&str] = &["authorization", "cookie"];

fn is_sensitive(name: &str) -> bool {
    SENSITIVE_NAMES.contains(&name)
}

#[derive(Debug, Clone)]
struct Table {
    max_size: usize,
    current_size: usize,
    table: VecDeque<TableEntry>,
}

impl Table {
    pub fn new(max_size: usize) -> Self {
        Self {
            max_size,
            current_size: 0,
            table: VecDeque::new(),
        }
    }

    /// 1-based index across static then dynamic, per RFC 7541 §2.3.3.
    pub fn get(&self, index: usize) -> Option<&TableEntry> {
        if index == 0 {
            return None;
        }
        if index <= STATIC_TABLE.len() {
            return STATIC_TABLE.get(index - 1);
        }
        self.table.get(index - STATIC_TABLE.len() - 1)
    }

    /// Returns `(index, exact_value_match)` for the closest match, searching
    /// the static table before the dynamic one.
    pub fn find(&self, name: &[u8], value: &[u8]) -> Option<(usize, bool)> {
        let mut name_only = None;
        for (i, entry) in STATIC_TABLE.iter().enumerate() {
            if entry.name.as_ref() == name {
                if entry.value.as_ref() == value {
                    return Some((i + 1, true));
                }
                name_only.get_or_insert(i + 1);
            }
        }
        for (i, entry) in self.table.iter().enumerate() {
            if entry.name.as_ref() == name {
                let idx = STATIC_TABLE.len() + 1 + i;
                if entry.value.as_ref() == value {
                    return Some((idx, true));
                }
                name_only.get_or_insert(idx);
            }
        }
        name_only.map(|i| (i, false))
    }

    pub fn push(&mut self, name: Bytes, value: Bytes) {
        let entry = TableEntry::new(name, value);
        if entry.size > self.max_size {
            // Per RFC 7541 §4.4, an entry larger than the bound empties the
            // table instead of being stored.
            self.table.clear();
            self.current_size = 0;
            return;
        }
        self.current_size += entry.size;
        self.table.push_front(entry);
        self.evict();
    }

    pub fn resize(&mut self, size: usize) {
        self.max_size = size;
        self.evict();
    }

    fn evict(&mut self) {
        while self.current_size > self.max_size {
            match self.table.pop_back() {
                Some(popped) => self.current_size -= popped.size,
                None => break,
            }
        }
    }
}

fn encode_integer(out: &mut BytesMut, prefix_bits: u8, top_bits: u8, mut value: usize) {
    let max_prefix = (1usize << prefix_bits) - 1;
    if value < max_prefix {
        out.put_u8(top_bits | value as u8);
        return;
    }
    out.put_u8(top_bits | max_prefix as u8);
    value -= max_prefix;
    while value >= 128 {
        out.put_u8(((value % 128) + 128) as u8);
        value /= 128;
    }
    out.put_u8(value as u8);
}

/// Returns `(value, bytes_consumed)`.
fn decode_integer(data: &[u8], prefix_bits: u8) -> Result<(usize, usize), H2Error> {
    let first = *data
        .first()
        .ok_or(H2Error::Compression("truncated integer"))?;
    let mask = (1u8 << prefix_bits) - 1;
    let mut value = (first & mask) as usize;
    if value < mask as usize {
        return Ok((value, 1));
    }
    let mut shift = 0u32;
    let mut consumed = 1;
    loop {
        let byte = *data
            .get(consumed)
            .ok_or(H2Error::Compression("truncated integer"))?;
        if shift > 56 {
            return Err(H2Error::Compression("integer too large"));
        }
        value = value
            .checked_add(((byte & 0x7f) as usize) << shift)
            .ok_or(H2Error::Compression("integer overflow"))?;
        consumed += 1;
        shift += 7;
        if byte & 0x80 == 0 {
            break;
        }
    }
    Ok((value, consumed))
}

fn encode_string(out: &mut BytesMut, data: &[u8]) {
    let huffman_len = huffman::encoded_len(data);
    if huffman_len < data.len() {
        encode_integer(out, 7, 0x80, huffman_len);
        out.extend_from_slice(&huffman::encode(data));
    } else {
        encode_integer(out, 7, 0x00, data.len());
        out.extend_from_slice(data);
    }
}

fn decode_string(data: &[u8]) -> Result<(Bytes, usize), H2Error> {
    let first = *data
        .first()
        .ok_or(H2Error::Compression("truncated string"))?;
    let huffman_coded = first & 0x80 != 0;
    let (len, prefix_len) = decode_integer(data, 7)?;
    let start = prefix_len;
    let end = start
        .checked_add(len)
        .ok_or(H2Error::Compression("string length overflow"))?;
    let raw = data
        .get(start..end)
        .ok_or(H2Error::Compression("truncated string"))?;
    let value = if huffman_coded {
        huffman::decode(raw)?
    } else {
        Bytes::copy_from_slice(raw)
    };
    Ok((value, end))
}

#[derive(Debug, Clone)]
pub struct Encoder {
    table: Table,
    pending_size_update: Option<usize>,
}

impl Encoder {
    pub fn with_size(dynamic_table_size: usize) -> Self {
        Self {
            table: Table::new(dynamic_table_size),
            pending_size_update: None,
        }
    }

    /// Applies a new bound received via the peer's `SETTINGS_HEADER_TABLE_SIZE`.
    /// The next encoded block carries a dynamic-table size-update opcode.
    pub fn set_peer_bound(&mut self, bound: usize) {
        self.table.resize(bound);
        self.pending_size_update = Some(bound);
    }

    pub fn encode(&mut self, headers: &HeaderList) -> Result<Bytes, H2Error> {
        let mut out = BytesMut::new();
        if let Some(bound) = self.pending_size_update.take() {
            encode_integer(&mut out, 5, 0x20, bound);
        }
        for (name, value) in headers {
            if name.chars().any(|c| c.is_ascii_uppercase()) {
                return Err(H2Error::Compression("header name must be lowercase"));
            }
            let name_bytes = name.as_bytes();
            let value_bytes = value.as_bytes();
            let sensitive = is_sensitive(name);

            if sensitive {
                let name_index = self.table.find(name_bytes, value_bytes).map(|(i, _)| i);
                self.encode_literal(&mut out, 4, 0x10, name_index, name_bytes, value_bytes);
                continue;
            }

            match self.table.find(name_bytes, value_bytes) {
                Some((index, true)) => {
                    encode_integer(&mut out, 7, 0x80, index);
                }
                Some((index, false)) => {
                    self.encode_literal(&mut out, 6, 0x40, Some(index), name_bytes, value_bytes);
                    self.table
                        .push(Bytes::copy_from_slice(name_bytes), Bytes::copy_from_slice(value_bytes));
                }
                None => {
                    self.encode_literal(&mut out, 6, 0x40, None, name_bytes, value_bytes);
                    self.table
                        .push(Bytes::copy_from_slice(name_bytes), Bytes::copy_from_slice(value_bytes));
                }
            }
        }
        Ok(out.freeze())
    }

    fn encode_literal(
        &self,
        out: &mut BytesMut,
        prefix_bits: u8,
        top_bits: u8,
        name_index: Option<usize>,
        name: &[u8],
        value: &[u8],
    ) {
        match name_index {
            Some(index) => encode_integer(out, prefix_bits, top_bits, index),
            None => {
                out.put_u8(top_bits);
                encode_string(out, name);
            }
        }
        encode_string(out, value);
    }
}

impl Default for Encoder {
    fn default() -> Self {
        Self::with_size(crate::types::DEFAULT_HEADER_TABLE_SIZE as usize)
    }
}

#[derive(Debug, Clone)]
pub struct Decoder {
    table: Table,
    bound: usize,
}

impl Decoder {
    pub fn with_size(dynamic_table_size: usize) -> Self {
        Self {
            table: Table::new(dynamic_table_size),
            bound: dynamic_table_size,
        }
    }

    /// Updates the cap we advertised via our own `SETTINGS_HEADER_TABLE_SIZE`;
    /// a size-update command from the peer exceeding this is a protocol error.
    pub fn set_bound(&mut self, bound: usize) {
        self.bound = bound;
        let shrunk = self.table.max_size.min(bound);
        self.table.resize(shrunk);
    }

    pub fn decode(
        &mut self,
        data: &[u8],
        max_header_list_size: usize,
        max_header_count: usize,
    ) -> Result<HeaderList, H2Error> {
        let mut headers = HeaderList::new();
        let mut pos = 0;
        let mut total_size = 0usize;
        let mut seen_regular = false;
        let mut seen_pseudo: HashSet<String> = HashSet::new();
        let mut header_count = 0usize;
        let mut saw_entry = false;

        while pos < data.len() {
            let byte = data[pos];
            if byte & 0x80 != 0 {
                let (index, consumed) = decode_integer(&data[pos..], 7)?;
                pos += consumed;
                if index == 0 {
                    return Err(H2Error::Compression("indexed representation with index 0"));
                }
                let entry = self
                    .table
                    .get(index)
                    .ok_or(H2Error::Compression("header index out of range"))?;
                let (name, value) = (entry.name.clone(), entry.value.clone());
                self.push_header(
                    &mut headers,
                    &mut total_size,
                    &mut header_count,
                    &mut seen_regular,
                    &mut seen_pseudo,
                    name,
                    value,
                    max_header_list_size,
                    max_header_count,
                )?;
                saw_entry = true;
            } else if byte & 0xe0 == 0x20 {
                if saw_entry {
                    return Err(H2Error::Compression(
                        "dynamic table size update must precede all header fields",
                    ));
                }
                let (new_size, consumed) = decode_integer(&data[pos..], 5)?;
                pos += consumed;
                if new_size > self.bound {
                    return Err(H2Error::Compression("dynamic table size update exceeds bound"));
                }
                self.table.resize(new_size);
            } else {
                let incremental = byte & 0xc0 == 0x40;
                let prefix_bits = if incremental { 6 } else { 4 };
                let (index, consumed) = decode_integer(&data[pos..], prefix_bits)?;
                pos += consumed;
                let name = if index == 0 {
                    let (name, consumed) = decode_string(&data[pos..])?;
                    pos += consumed;
                    name
                } else {
                    self.table
                        .get(index)
                        .ok_or(H2Error::Compression("header index out of range"))?
                        .name
                        .clone()
                };
                let (value, consumed) = decode_string(&data[pos..])?;
                pos += consumed;
                if incremental {
                    self.table.push(name.clone(), value.clone());
                }
                self.push_header(
                    &mut headers,
                    &mut total_size,
                    &mut header_count,
                    &mut seen_regular,
                    &mut seen_pseudo,
                    name,
                    value,
                    max_header_list_size,
                    max_header_count,
                )?;
                saw_entry = true;
            }
        }
        Ok(headers)
    }

    #[allow(clippy::too_many_arguments)]
    fn push_header(
        &self,
        headers: &mut HeaderList,
        total_size: &mut usize,
        header_count: &mut usize,
        seen_regular: &mut bool,
        seen_pseudo: &mut HashSet<String>,
        name: Bytes,
        value: Bytes,
        max_header_list_size: usize,
        max_header_count: usize,
    ) -> Result<(), H2Error> {
        *header_count += 1;
        if *header_count > max_header_count {
            return Err(H2Error::Compression("header count exceeds configured limit"));
        }
        *total_size += name.len() + value.len() + 32;
        if *total_size > max_header_list_size {
            return Err(H2Error::Compression("header list size exceeds configured limit"));
        }
        let name = String::from_utf8(name.to_vec())
            .map_err(|_| H2Error::Compression("header name is not valid utf-8"))?;
        let value = String::from_utf8(value.to_vec())
            .map_err(|_| H2Error::Compression("header value is not valid utf-8"))?;
        validate_name(&name)?;
        validate_value(&value)?;

        if let Some(stripped) = name.strip_prefix(':') {
            if *seen_regular {
                return Err(H2Error::Compression("pseudo-header after regular header"));
            }
            if !seen_pseudo.insert(stripped.to_string()) {
                return Err(H2Error::Compression("duplicate pseudo-header"));
            }
        } else {
            *seen_regular = true;
        }
        headers.push((name, value));
        Ok(())
    }
}

impl Default for Decoder {
    fn default() -> Self {
        Self::with_size(crate::types::DEFAULT_HEADER_TABLE_SIZE as usize)
    }
}

fn validate_name(name: &str) -> Result<(), H2Error> {
    if name.is_empty() {
        return Err(H2Error::Compression("empty header name"));
    }
    let body = name.strip_prefix(':').unwrap_or(name);
    if body.is_empty() {
        return Err(H2Error::Compression("empty pseudo-header name"));
    }
    let valid = body
        .bytes()
        .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b"!#$%&'*+-.^_`|~".contains(&b));
    if !valid {
        return Err(H2Error::Compression(
            "header name has invalid or uppercase characters",
        ));
    }
    Ok(())
}

fn validate_value(value: &str) -> Result<(), H2Error> {
    if value.bytes().any(|b| b == b'\0' || b == b'\r' || b == b'\n') {
        return Err(H2Error::Compression("header value contains NUL/CR/LF"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&str, &str)]) -> HeaderList {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn roundtrip_static_only() {
        let mut enc = Encoder::default();
        let mut dec = Decoder::default();
        let input = headers(&[(":method", "GET"), (":scheme", "https"), (":path", "/")]);
        let wire = enc.encode(&input).unwrap();
        let out = dec.decode(&wire, 1 << 20, 100).unwrap();
        assert_eq!(out, input);
    }

    #[test]
    fn repeated_header_uses_dynamic_table() {
        let mut enc = Encoder::default();
        let mut dec = Decoder::default();
        let input = headers(&[(":authority", "example.com")]);
        let first = enc.encode(&input).unwrap();
        let second = enc.encode(&input).unwrap();
        assert!(second.len() <= first.len());
        assert_eq!(dec.decode(&first, 1 << 20, 100).unwrap(), input);
        assert_eq!(dec.decode(&second, 1 << 20, 100).unwrap(), input);
    }

    #[test]
    fn sensitive_header_never_indexed() {
        let mut enc = Encoder::default();
        let wire = enc
            .encode(&headers(&[("authorization", "Bearer xyz")]))
            .unwrap();
        // 0001xxxx opcode, never added to the dynamic table.
        assert_eq!(wire[0] & 0xf0, 0x10);
        assert_eq!(enc.table.current_size, 0);
    }

    #[test]
    fn dynamic_table_evicts_oldest() {
        let mut table = Table::new(64);
        table.push(Bytes::from_static(b"a"), Bytes::from_static(b"1"));
        table.push(Bytes::from_static(b"b"), Bytes::from_static(b"2"));
        // each entry costs 32 + 1 + 1 = 34 bytes; bound 64 only fits one.
        assert_eq!(table.table.len(), 1);
        assert_eq!(table.table.front().unwrap().name.as_ref(), b"b");
    }

    #[test]
    fn size_update_must_be_first() {
        let mut dec = Decoder::with_size(4096);
        let mut out = BytesMut::new();
        encode_integer(&mut out, 7, 0x80, 2); // indexed entry first
        encode_integer(&mut out, 5, 0x20, 100); // then a size update
        assert!(dec.decode(&out, 1 << 20, 100).is_err());
    }

    #[test]
    fn size_update_over_bound_rejected() {
        let mut dec = Decoder::with_size(100);
        let mut out = BytesMut::new();
        encode_integer(&mut out, 5, 0x20, 200);
        assert!(dec.decode(&out, 1 << 20, 100).is_err());
    }

    #[test]
    fn rejects_uppercase_name() {
        let mut enc = Encoder::default();
        assert!(enc
            .encode(&headers(&[("Content-Type", "text/plain")]))
            .is_err());
    }

    #[test]
    fn header_count_limit_enforced() {
        let mut enc = Encoder::default();
        let mut dec = Decoder::default();
        let input: HeaderList = (0..5).map(|i| (format!("x-{i}"), "v".to_string())).collect();
        let wire = enc.encode(&input).unwrap();
        assert!(dec.decode(&wire, 1 << 20, 3).is_err());
    }

    #[test]
    fn header_list_size_limit_enforced() {
        let mut enc = Encoder::default();
        let mut dec = Decoder::default();
        let input = headers(&[("x-big", &"a".repeat(1000))]);
        let wire = enc.encode(&input).unwrap();
        assert!(dec.decode(&wire, 100, 100).is_err());
    }

    #[test]
    fn integer_prefix_examples() {
        // RFC 7541 C.1.1 / C.1.2 / C.1.3
        let mut out = BytesMut::new();
        encode_integer(&mut out, 5, 0, 10);
        assert_eq!(out.as_ref(), &[10]);

        let mut out = BytesMut::new();
        encode_integer(&mut out, 5, 0, 1337);
        assert_eq!(out.as_ref(), &[31, 154, 10]);
        let (value, consumed) = decode_integer(&out, 5).unwrap();
        assert_eq!(value, 1337);
        assert_eq!(consumed, 3);
    }
}
