//! Code image access.
//!
//! Both patch targets (the main binary and overlay binaries) expose the same
//! capability set: typed little-endian reads and writes at absolute RAM
//! addresses, bulk byte writes, and access to the raw buffer for wholesale
//! resizes. The trait keeps the applier generic over the two.
//!
//! Addressing is `addr - ram_base`; a write outside the current image is a
//! bug in the caller and panics rather than being reported as a run error.

/// Mutable view over one loaded binary, addressed by RAM address.
pub trait CodeImage {
    /// RAM address the image is loaded at.
    fn ram_base(&self) -> u32;

    fn data(&self) -> &[u8];

    /// Mutable access to the backing buffer. Marks the image dirty.
    fn data_mut(&mut self) -> &mut Vec<u8>;

    /// Whether any mutating call has touched the image since load.
    fn dirty(&self) -> bool;

    fn offset_of(&self, addr: u32) -> usize {
        addr.checked_sub(self.ram_base())
            .expect("address below image base") as usize
    }

    fn read_u8(&self, addr: u32) -> u8 {
        self.data()[self.offset_of(addr)]
    }

    fn read_u16(&self, addr: u32) -> u16 {
        let o = self.offset_of(addr);
        let d = self.data();
        u16::from_le_bytes([d[o], d[o + 1]])
    }

    fn read_u32(&self, addr: u32) -> u32 {
        let o = self.offset_of(addr);
        let d = self.data();
        u32::from_le_bytes([d[o], d[o + 1], d[o + 2], d[o + 3]])
    }

    fn write_u8(&mut self, addr: u32, value: u8) {
        let o = self.offset_of(addr);
        self.data_mut()[o] = value;
    }

    fn write_u16(&mut self, addr: u32, value: u16) {
        let o = self.offset_of(addr);
        self.data_mut()[o..o + 2].copy_from_slice(&value.to_le_bytes());
    }

    fn write_u32(&mut self, addr: u32, value: u32) {
        let o = self.offset_of(addr);
        self.data_mut()[o..o + 4].copy_from_slice(&value.to_le_bytes());
    }

    fn write_bytes(&mut self, addr: u32, src: &[u8]) {
        let o = self.offset_of(addr);
        self.data_mut()[o..o + src.len()].copy_from_slice(src);
    }
}
