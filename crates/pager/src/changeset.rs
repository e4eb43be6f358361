use common::Address;

/// The set of pages dirtied by the operation in flight.
///
/// Members are protected from eviction until the environment flushes
/// them together with the write-ahead log and clears the set. Kept in
/// insertion order so flushes replay the operation's program order.
#[derive(Debug, Default)]
pub struct Changeset {
    addresses: Vec<Address>,
}

impl Changeset {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, address: Address) {
        if !self.addresses.contains(&address) {
            self.addresses.push(address);
        }
    }

    pub fn contains(&self, address: Address) -> bool {
        self.addresses.contains(&address)
    }

    pub fn is_empty(&self) -> bool {
        self.addresses.is_empty()
    }

    pub fn len(&self) -> usize {
        self.addresses.len()
    }

    pub fn addresses(&self) -> &[Address] {
        &self.addresses
    }

    pub fn clear(&mut self) {
        self.addresses.clear();
    }
}
