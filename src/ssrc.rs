//! Process-wide endpoint identity (§3).
//!
//! Deterministic from the endpoint's display name so a restart yields the same
//! SSRC. The reference implementation hashes with SHA-1 and keeps the low 32 bits;
//! this core uses `DefaultHasher` instead (see DESIGN.md, Open Question 4) since the
//! invariant that matters is stability across restarts of *this* process, not
//! cross-implementation bit-compatibility.
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

/// Derives a stable SSRC from a display name.
pub fn derive_ssrc(name: &str) -> u32 {
    let mut hasher = DefaultHasher::new();
    name.hash(&mut hasher);
    (hasher.finish() & 0xFFFF_FFFF) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_name_same_ssrc() {
        let a = derive_ssrc("My Session - ALSA SEQ");
        let b = derive_ssrc("My Session - ALSA SEQ");
        assert_eq!(a, b);
    }

    #[test]
    fn different_name_different_ssrc() {
        let a = derive_ssrc("Piano");
        let b = derive_ssrc("Drum Machine");
        assert_ne!(a, b);
    }
}
