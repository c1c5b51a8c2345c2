//! The packet byte-buffer model: prepend/append, polymorphic headers and
//! trailers, byte-range tags, per-packet tags, and printable metadata.
//!
//! Every [`Packet`] carries a process-wide unique id so that test and log
//! code can correlate a frame across layers without re-inspecting its bytes.

mod buffer;
mod header;
mod tags;

pub use header::{Header, Trailer};
pub use tags::{ByteTag, PacketTag};

use buffer::ByteBuffer;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_PACKET_ID: AtomicU64 = AtomicU64::new(1);

/// One recorded (de)serialization step, kept so a packet can be printed as
/// a stack of headers/trailers even after their bytes have been consumed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetadataItem {
    Header { type_name: String, size: usize },
    Trailer { type_name: String, size: usize },
}

/// A logically-owned byte sequence plus the tag and metadata side-tables
/// that travel with it.
#[derive(Debug, Clone)]
pub struct Packet {
    id: u64,
    buffer: ByteBuffer,
    byte_tags: Vec<ByteTag>,
    packet_tags: Vec<PacketTag>,
    metadata: Vec<MetadataItem>,
}

impl Packet {
    pub fn new() -> Self {
        Packet {
            id: NEXT_PACKET_ID.fetch_add(1, Ordering::Relaxed),
            buffer: ByteBuffer::new(),
            byte_tags: Vec::new(),
            packet_tags: Vec::new(),
            metadata: Vec::new(),
        }
    }

    pub fn new_with_size(n: usize) -> Self {
        let mut p = Self::new();
        p.buffer = ByteBuffer::zeroed(n);
        p
    }

    pub fn new_from_bytes(bytes: &[u8]) -> Self {
        let mut p = Self::new();
        p.buffer = ByteBuffer::from_slice(bytes);
        p
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn size(&self) -> usize {
        self.buffer.len()
    }

    pub fn metadata(&self) -> &[MetadataItem] {
        &self.metadata
    }

    /// Serializes `header` and prepends it, shifting every byte tag forward
    /// by the header's wire size.
    pub fn add_header<H: Header>(&mut self, header: &H) {
        let size = header.serialized_size();
        let mut bytes = vec![0u8; size];
        header.serialize(&mut bytes);
        self.buffer.prepend(&bytes);
        for tag in &mut self.byte_tags {
            tag.shift(size as isize);
        }
        self.metadata.insert(
            0,
            MetadataItem::Header {
                type_name: std::any::type_name::<H>().to_string(),
                size,
            },
        );
    }

    /// Deserializes and strips a header of type `H` from the front of the
    /// buffer, returning it. Panics if fewer bytes remain than the header's
    /// declared size — callers that must tolerate malformed input should
    /// check `self.size()` first.
    pub fn remove_header<H: Header>(&mut self) -> H {
        let size = H::serialized_size_hint();
        let header_bytes = self.buffer.peek_front(size);
        let header = H::deserialize(&header_bytes);
        self.buffer.remove_front(size);
        for tag in &mut self.byte_tags {
            tag.shift(-(size as isize));
        }
        self.byte_tags.retain(|t| t.end > 0);
        if matches!(self.metadata.first(), Some(MetadataItem::Header { .. })) {
            self.metadata.remove(0);
        }
        header
    }

    pub fn peek_header<H: Header>(&self) -> H {
        let size = H::serialized_size_hint();
        let header_bytes = self.buffer.peek_front(size);
        H::deserialize(&header_bytes)
    }

    pub fn add_trailer<T: Trailer>(&mut self, trailer: &T) {
        let size = trailer.serialized_size();
        let mut bytes = vec![0u8; size];
        trailer.serialize(&mut bytes);
        self.buffer.append(&bytes);
        self.metadata.push(MetadataItem::Trailer {
            type_name: std::any::type_name::<T>().to_string(),
            size,
        });
    }

    pub fn remove_trailer<T: Trailer>(&mut self) -> T {
        let size = T::serialized_size_hint();
        let trailer_bytes = self.buffer.peek_back(size);
        let trailer = T::deserialize(&trailer_bytes);
        self.buffer.remove_back(size);
        let new_len = self.buffer.len();
        for tag in &mut self.byte_tags {
            tag.clip(new_len);
        }
        if matches!(self.metadata.last(), Some(MetadataItem::Trailer { .. })) {
            self.metadata.pop();
        }
        trailer
    }

    pub fn peek_trailer<T: Trailer>(&self) -> T {
        let size = T::serialized_size_hint();
        let trailer_bytes = self.buffer.peek_back(size);
        T::deserialize(&trailer_bytes)
    }

    /// Logical concatenation: `other`'s bytes, byte tags (shifted by the
    /// current size), and metadata are appended in place.
    pub fn add_at_end(&mut self, other: &Packet) {
        let shift = self.size();
        self.buffer.append(other.buffer.as_slice());
        for tag in &other.byte_tags {
            let mut shifted = tag.clone();
            shifted.shift(shift as isize);
            self.byte_tags.push(shifted);
        }
        self.metadata.extend(other.metadata.clone());
    }

    pub fn add_padding_at_end(&mut self, n: usize) {
        self.buffer.append(&vec![0u8; n]);
    }

    pub fn remove_at_end(&mut self, n: usize) {
        self.buffer.remove_back(n);
        let new_len = self.buffer.len();
        self.byte_tags.retain_mut(|t| {
            t.clip(new_len);
            t.start < t.end
        });
    }

    pub fn remove_at_start(&mut self, n: usize) {
        self.buffer.remove_front(n);
        for tag in &mut self.byte_tags {
            tag.shift(-(n as isize));
        }
        self.byte_tags.retain(|t| t.end > 0);
    }

    /// Produces a new packet holding the slice `[start, start+len)`. Byte
    /// tags are intersected with the fragment range and re-based to it.
    pub fn fragment(&self, start: usize, len: usize) -> Packet {
        let mut fragment = Packet::new();
        fragment.buffer = ByteBuffer::from_slice(&self.buffer.as_slice()[start..start + len]);
        let end = start + len;
        for tag in &self.byte_tags {
            if tag.start < end && tag.end > start {
                let mut clipped = tag.clone();
                clipped.start = clipped.start.max(start) - start;
                clipped.end = clipped.end.min(end) - start;
                fragment.byte_tags.push(clipped);
            }
        }
        if start == 0 && len == self.size() {
            fragment.metadata = self.metadata.clone();
        }
        fragment
    }

    pub fn copy_data(&self, out: &mut [u8]) -> usize {
        let n = out.len().min(self.size());
        out[..n].copy_from_slice(&self.buffer.as_slice()[..n]);
        n
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.buffer.as_slice()
    }

    pub fn add_byte_tag(&mut self, tag_id: &str, payload: Vec<u8>) {
        let end = self.size();
        self.byte_tags.push(ByteTag {
            type_id: tag_id.to_string(),
            start: 0,
            end,
            payload,
        });
    }

    pub fn add_byte_tag_range(&mut self, tag_id: &str, start: usize, end: usize, payload: Vec<u8>) {
        self.byte_tags.push(ByteTag {
            type_id: tag_id.to_string(),
            start,
            end,
            payload,
        });
    }

    pub fn byte_tags(&self) -> impl Iterator<Item = &ByteTag> {
        self.byte_tags.iter()
    }

    pub fn add_packet_tag(&mut self, tag: PacketTag) {
        self.packet_tags.retain(|t| t.type_id != tag.type_id);
        self.packet_tags.push(tag);
    }

    pub fn replace_packet_tag(&mut self, tag: PacketTag) {
        self.add_packet_tag(tag);
    }

    pub fn peek_packet_tag(&self, type_id: &str) -> Option<&PacketTag> {
        self.packet_tags.iter().find(|t| t.type_id == type_id)
    }

    pub fn remove_packet_tag(&mut self, type_id: &str) -> Option<PacketTag> {
        let idx = self.packet_tags.iter().position(|t| t.type_id == type_id)?;
        Some(self.packet_tags.remove(idx))
    }

    pub fn remove_all_packet_tags(&mut self) {
        self.packet_tags.clear();
    }

    /// Whole-packet wire serialization (§4.2 "stable on-wire layout"):
    /// `[nix-vector][byte-tags][packet-tags][metadata][buffer]`, each
    /// section a 4-byte length (including itself) followed by its payload,
    /// padded out to a 4-byte boundary. The nix-vector section is always
    /// empty: nothing in this crate populates one.
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::new();
        write_section(&mut out, &[]);
        write_section(&mut out, &encode_byte_tags(&self.byte_tags));
        write_section(&mut out, &encode_packet_tags(&self.packet_tags));
        write_section(&mut out, &encode_metadata(&self.metadata));
        write_section(&mut out, self.buffer.as_slice());
        out
    }

    /// Inverse of [`Packet::serialize`]. Returns `None` (§7 "deserialization
    /// failure") on truncated or malformed input rather than panicking.
    pub fn deserialize(bytes: &[u8]) -> Option<Packet> {
        let mut cursor = 0usize;
        let _nix_vector = read_section(bytes, &mut cursor)?;
        let byte_tags_bytes = read_section(bytes, &mut cursor)?;
        let packet_tags_bytes = read_section(bytes, &mut cursor)?;
        let metadata_bytes = read_section(bytes, &mut cursor)?;
        let buffer_bytes = read_section(bytes, &mut cursor)?;

        Some(Packet {
            id: NEXT_PACKET_ID.fetch_add(1, Ordering::Relaxed),
            buffer: ByteBuffer::from_slice(&buffer_bytes),
            byte_tags: decode_byte_tags(&byte_tags_bytes)?,
            packet_tags: decode_packet_tags(&packet_tags_bytes)?,
            metadata: decode_metadata(&metadata_bytes)?,
        })
    }
}

fn pad_len(payload_len: usize) -> usize {
    let total = 4 + payload_len;
    total + ((4 - total % 4) % 4)
}

fn write_section(out: &mut Vec<u8>, payload: &[u8]) {
    let len = pad_len(payload.len()) as u32;
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(payload);
    out.resize(out.len() + (len as usize - 4 - payload.len()), 0);
}

fn read_section(bytes: &[u8], cursor: &mut usize) -> Option<Vec<u8>> {
    if bytes.len() < *cursor + 4 {
        return None;
    }
    let len = u32::from_be_bytes(bytes[*cursor..*cursor + 4].try_into().ok()?) as usize;
    if len < 4 || bytes.len() < *cursor + len {
        return None;
    }
    let payload_end = *cursor + len;
    let payload = bytes[*cursor + 4..payload_end].to_vec();
    *cursor = payload_end;
    Some(payload)
}

fn write_u32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_be_bytes());
}

fn write_str(out: &mut Vec<u8>, s: &str) {
    write_u32(out, s.len() as u32);
    out.extend_from_slice(s.as_bytes());
}

fn read_u32(bytes: &[u8], cursor: &mut usize) -> Option<u32> {
    let v = u32::from_be_bytes(bytes.get(*cursor..*cursor + 4)?.try_into().ok()?);
    *cursor += 4;
    Some(v)
}

fn read_str(bytes: &[u8], cursor: &mut usize) -> Option<String> {
    let len = read_u32(bytes, cursor)? as usize;
    let s = std::str::from_utf8(bytes.get(*cursor..*cursor + len)?).ok()?.to_owned();
    *cursor += len;
    Some(s)
}

fn encode_byte_tags(tags: &[ByteTag]) -> Vec<u8> {
    let mut out = Vec::new();
    write_u32(&mut out, tags.len() as u32);
    for tag in tags {
        write_str(&mut out, &tag.type_id);
        write_u32(&mut out, tag.start as u32);
        write_u32(&mut out, tag.end as u32);
        write_u32(&mut out, tag.payload.len() as u32);
        out.extend_from_slice(&tag.payload);
    }
    out
}

fn decode_byte_tags(bytes: &[u8]) -> Option<Vec<ByteTag>> {
    let mut cursor = 0;
    let count = read_u32(bytes, &mut cursor)?;
    let mut tags = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let type_id = read_str(bytes, &mut cursor)?;
        let start = read_u32(bytes, &mut cursor)? as usize;
        let end = read_u32(bytes, &mut cursor)? as usize;
        let payload_len = read_u32(bytes, &mut cursor)? as usize;
        let payload = bytes.get(cursor..cursor + payload_len)?.to_vec();
        cursor += payload_len;
        tags.push(ByteTag { type_id, start, end, payload });
    }
    Some(tags)
}

fn encode_packet_tags(tags: &[PacketTag]) -> Vec<u8> {
    let mut out = Vec::new();
    write_u32(&mut out, tags.len() as u32);
    for tag in tags {
        write_str(&mut out, &tag.type_id);
        write_u32(&mut out, tag.payload.len() as u32);
        out.extend_from_slice(&tag.payload);
    }
    out
}

fn decode_packet_tags(bytes: &[u8]) -> Option<Vec<PacketTag>> {
    let mut cursor = 0;
    let count = read_u32(bytes, &mut cursor)?;
    let mut tags = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let type_id = read_str(bytes, &mut cursor)?;
        let payload_len = read_u32(bytes, &mut cursor)? as usize;
        let payload = bytes.get(cursor..cursor + payload_len)?.to_vec();
        cursor += payload_len;
        tags.push(PacketTag { type_id, payload });
    }
    Some(tags)
}

fn encode_metadata(items: &[MetadataItem]) -> Vec<u8> {
    let mut out = Vec::new();
    write_u32(&mut out, items.len() as u32);
    for item in items {
        match item {
            MetadataItem::Header { type_name, size } => {
                out.push(0);
                write_str(&mut out, type_name);
                write_u32(&mut out, *size as u32);
            }
            MetadataItem::Trailer { type_name, size } => {
                out.push(1);
                write_str(&mut out, type_name);
                write_u32(&mut out, *size as u32);
            }
        }
    }
    out
}

fn decode_metadata(bytes: &[u8]) -> Option<Vec<MetadataItem>> {
    let mut cursor = 0;
    let count = read_u32(bytes, &mut cursor)?;
    let mut items = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let kind = *bytes.get(cursor)?;
        cursor += 1;
        let type_name = read_str(bytes, &mut cursor)?;
        let size = read_u32(bytes, &mut cursor)? as usize;
        items.push(match kind {
            0 => MetadataItem::Header { type_name, size },
            _ => MetadataItem::Trailer { type_name, size },
        });
    }
    Some(items)
}

impl Default for Packet {
    fn default() -> Self {
        Self::new()
    }
}
