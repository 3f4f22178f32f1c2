use std::collections::BTreeSet;

/// Presence bitmap over `[0, nr_components)`.
///
/// Bits are numbered from the high bit of the first byte.
#[derive(Debug, Clone)]
pub struct ComponentTracker {
    bits: Vec<u8>,
    nr_components: u32,
    present: u32,
}

impl ComponentTracker {
    /// Creates a tracker with every component missing.
    pub fn new(nr_components: u32) -> Self {
        Self {
            bits: vec![0; (nr_components as usize).div_ceil(8)],
            nr_components,
            present: 0,
        }
    }

    /// Creates a tracker with every component present.
    pub fn full(nr_components: u32) -> Self {
        let mut t = Self::new(nr_components);
        for i in 0..nr_components {
            t.add_component(i);
        }
        t
    }

    pub fn nr_components(&self) -> u32 {
        self.nr_components
    }

    pub fn has_component(&self, index: u32) -> bool {
        if index >= self.nr_components {
            return false;
        }
        let byte = index as usize / 8;
        let bit = 7 - (index % 8);
        (self.bits[byte] >> bit) & 1 == 1
    }

    /// Marks `index` present. Returns false if it was already present or out of range.
    pub fn add_component(&mut self, index: u32) -> bool {
        if index >= self.nr_components || self.has_component(index) {
            return false;
        }
        self.bits[index as usize / 8] |= 1 << (7 - (index % 8));
        self.present += 1;
        true
    }

    /// Marks `index` missing again.
    pub fn remove_component(&mut self, index: u32) -> bool {
        if !self.has_component(index) {
            return false;
        }
        self.bits[index as usize / 8] &= !(1 << (7 - (index % 8)));
        self.present -= 1;
        true
    }

    /// Up to `count` missing indices at or after `from`, skipping those in `except`.
    pub fn next_component_missing(&self, from: u32, count: usize, except: &BTreeSet<u32>) -> Vec<u32> {
        (from..self.nr_components)
            .filter(|i| !self.has_component(*i) && !except.contains(i))
            .take(count)
            .collect()
    }

    pub fn present(&self) -> u32 {
        self.present
    }

    pub fn is_complete(&self) -> bool {
        self.present == self.nr_components
    }
}
