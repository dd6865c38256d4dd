//! The site-id filter mask: a bit-set over `[0, fa_entry_count)` used both
//! as the archive mask (ids actually persisted, fixed at archive init) and
//! as a read mask (subset requested by a client). See spec.md section 3
//! ("Filter mask") and section 6 ("Mask grammar").

use raw::MAX_FA_ENTRY_COUNT;

const WORDS: usize = MAX_FA_ENTRY_COUNT / 64;

/// A fixed-capacity bit-set over up to `MAX_FA_ENTRY_COUNT` site ids.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct FilterMask {
    words: [u64; WORDS],
}

impl FilterMask {
    pub fn empty() -> Self {
        FilterMask { words: [0; WORDS] }
    }

    pub fn set(&mut self, id: usize) {
        debug_assert!(id < MAX_FA_ENTRY_COUNT);
        self.words[id / 64] |= 1 << (id % 64);
    }

    pub fn is_set(&self, id: usize) -> bool {
        id < MAX_FA_ENTRY_COUNT && (self.words[id / 64] >> (id % 64)) & 1 == 1
    }

    /// Number of set bits, i.e. `archive_mask_count` for an archive mask or
    /// the requested id count for a read mask.
    pub fn count(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    /// Ids in ascending order.
    pub fn ids(&self, fa_entry_count: usize) -> impl Iterator<Item = usize> + '_ {
        (0..fa_entry_count).filter(move |&id| self.is_set(id))
    }

    /// True if every bit set in `self` is also set in `other` — used to
    /// validate that a read mask is a subset of the archive mask.
    pub fn is_subset_of(&self, other: &FilterMask) -> bool {
        self.words.iter().zip(other.words.iter()).all(|(a, b)| a & !b == 0)
    }

    /// Parses the request-line mask grammar:
    /// `mask = id [ "-" id ] [ "," mask ]`, inclusive ranges.
    pub fn parse(s: &str, fa_entry_count: usize) -> ::std::result::Result<Self, String> {
        let mut mask = FilterMask::empty();
        if s.is_empty() {
            return Err("empty mask".into());
        }
        for range in s.split(',') {
            let mut parts = range.splitn(2, '-');
            let lo: usize = parts
                .next()
                .unwrap()
                .parse()
                .map_err(|_| format!("invalid id in mask: {:?}", range))?;
            let hi: usize = match parts.next() {
                Some(hi) => hi
                    .parse()
                    .map_err(|_| format!("invalid id in mask: {:?}", range))?,
                None => lo,
            };
            if lo > hi || hi >= fa_entry_count {
                return Err(format!("id range {}-{} out of bounds", lo, hi));
            }
            for id in lo..=hi {
                mask.set(id);
            }
        }
        Ok(mask)
    }

    /// Decodes the wire form: `fa_entry_count / 4` lowercase hex nibbles,
    /// i.e. `fa_entry_count / 8` bytes, with bit `id` living in byte
    /// `id / 8` at bit position `id % 8` — the archive mask bytes are
    /// little-endian in the sense that low ids occupy the first byte, not
    /// reversed nibble order within a byte.
    pub fn from_hex(hex: &str, fa_entry_count: usize) -> ::std::result::Result<Self, String> {
        let expected_nibbles = fa_entry_count / 4;
        if hex.len() != expected_nibbles {
            return Err(format!(
                "expected {} hex nibbles, got {}",
                expected_nibbles,
                hex.len()
            ));
        }
        let bytes = hex_to_bytes(hex)?;
        Ok(Self::from_le_bytes(&bytes, fa_entry_count))
    }

    pub fn to_hex(&self, fa_entry_count: usize) -> String {
        let bytes = self.to_le_bytes(fa_entry_count);
        bytes.iter().map(|b| format!("{:02x}", b)).collect()
    }

    pub fn from_le_bytes(bytes: &[u8], fa_entry_count: usize) -> Self {
        let mut mask = FilterMask::empty();
        for id in 0..fa_entry_count.min(MAX_FA_ENTRY_COUNT) {
            let byte = bytes.get(id / 8).copied().unwrap_or(0);
            if (byte >> (id % 8)) & 1 == 1 {
                mask.set(id);
            }
        }
        mask
    }

    pub fn to_le_bytes(&self, fa_entry_count: usize) -> Vec<u8> {
        let nbytes = fa_entry_count / 8;
        let mut out = vec![0u8; nbytes];
        for id in 0..fa_entry_count {
            if self.is_set(id) {
                out[id / 8] |= 1 << (id % 8);
            }
        }
        out
    }
}

fn hex_to_bytes(hex: &str) -> ::std::result::Result<Vec<u8>, String> {
    if hex.len() % 2 != 0 {
        return Err("odd-length hex string".into());
    }
    let mut out = Vec::with_capacity(hex.len() / 2);
    let chars: Vec<char> = hex.chars().collect();
    for pair in chars.chunks(2) {
        let byte_str: String = pair.iter().collect();
        let byte = u8::from_str_radix(&byte_str, 16).map_err(|_| format!("bad hex byte: {}", byte_str))?;
        out.push(byte);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_simple_ranges() {
        let mask = FilterMask::parse("0-3,5,7", 8).unwrap();
        for id in &[0, 1, 2, 3, 5, 7] {
            assert!(mask.is_set(*id), "id {} should be set", id);
        }
        assert!(!mask.is_set(4));
        assert!(!mask.is_set(6));
        assert_eq!(mask.count(), 6);
    }

    #[test]
    fn rejects_out_of_range() {
        assert!(FilterMask::parse("0-9", 8).is_err());
    }

    #[test]
    fn hex_round_trips() {
        let mask = FilterMask::parse("0-3", 8).unwrap();
        let hex = mask.to_hex(8);
        assert_eq!(hex.len(), 8 / 4);
        let back = FilterMask::from_hex(&hex, 8).unwrap();
        assert_eq!(mask, back);
    }

    #[test]
    fn subset_check() {
        let archive = FilterMask::parse("0-3", 8).unwrap();
        let read = FilterMask::parse("1-2", 8).unwrap();
        assert!(read.is_subset_of(&archive));
        let not_subset = FilterMask::parse("0-7", 8).unwrap();
        assert!(!not_subset.is_subset_of(&archive));
    }
}
