//! The raw byte storage behind a [`super::Packet`].
//!
//! A plain `Vec<u8>` is enough here: the spec only requires that mutations
//! behave as if the buffer were copy-on-write, not that they literally be
//! implemented that way, and `Packet::clone` already gives full independence
//! because `Vec<u8>: Clone` deep-copies.

#[derive(Debug, Clone, Default)]
pub(crate) struct ByteBuffer {
    data: Vec<u8>,
}

impl ByteBuffer {
    pub(crate) fn new() -> Self {
        ByteBuffer { data: Vec::new() }
    }

    pub(crate) fn zeroed(n: usize) -> Self {
        ByteBuffer { data: vec![0u8; n] }
    }

    pub(crate) fn from_slice(bytes: &[u8]) -> Self {
        ByteBuffer {
            data: bytes.to_vec(),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.data.len()
    }

    pub(crate) fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub(crate) fn prepend(&mut self, bytes: &[u8]) {
        let mut new_data = Vec::with_capacity(bytes.len() + self.data.len());
        new_data.extend_from_slice(bytes);
        new_data.extend_from_slice(&self.data);
        self.data = new_data;
    }

    pub(crate) fn append(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    pub(crate) fn peek_front(&self, n: usize) -> Vec<u8> {
        self.data[..n].to_vec()
    }

    pub(crate) fn peek_back(&self, n: usize) -> Vec<u8> {
        let len = self.data.len();
        self.data[len - n..].to_vec()
    }

    pub(crate) fn remove_front(&mut self, n: usize) {
        self.data.drain(..n);
    }

    pub(crate) fn remove_back(&mut self, n: usize) {
        let new_len = self.data.len() - n;
        self.data.truncate(new_len);
    }
}
