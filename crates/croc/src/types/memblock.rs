//! The memblock kind: a byte buffer, owned or borrowed-from-host.

#[derive(Debug)]
pub(crate) struct Memblock {
    data: Vec<u8>,
    /// Owning memblocks may resize; views (created over host-supplied bytes)
    /// may not.
    owned: bool,
}

impl Memblock {
    pub fn with_len(len: usize) -> Self {
        Self {
            data: vec![0; len],
            owned: true,
        }
    }

    pub fn from_bytes(data: Vec<u8>) -> Self {
        Self { data, owned: true }
    }

    /// A view over host data. The bytes are captured at creation; the
    /// distinguishing property the language observes is that views refuse to
    /// resize.
    pub fn view(data: Vec<u8>) -> Self {
        Self { data, owned: false }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_owned(&self) -> bool {
        self.owned
    }

    pub fn get(&self, idx: usize) -> u8 {
        self.data[idx]
    }

    pub fn set(&mut self, idx: usize, byte: u8) {
        self.data[idx] = byte;
    }

    /// Fails (returns `false`) on view memblocks.
    pub fn resize(&mut self, new_len: usize) -> bool {
        if !self.owned {
            return false;
        }
        self.data.resize(new_len, 0);
        true
    }

    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn slice(&self, lo: usize, hi: usize) -> Vec<u8> {
        self.data[lo..hi].to_vec()
    }
}
