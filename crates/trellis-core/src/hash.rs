//! Stable shard selection.

use std::io::Cursor;

/// murmur3 (32-bit, seed 0) of the given key.
pub fn murmur3_32(key: &str) -> u32 {
    // Reading from an in-memory cursor cannot fail.
    murmur3::murmur3_32(&mut Cursor::new(key.as_bytes()), 0).unwrap_or(0)
}

/// Shard index for `key` among `n` workers. `n == 0` maps to 0.
pub fn slot_index(key: &str, n: usize) -> usize {
    if n == 0 {
        return 0;
    }
    murmur3_32(key) as usize % n
}

/// Canonical hash key of a session: `app:user:session`.
pub fn session_hash_key(app_name: &str, user_id: &str, session_id: &str) -> String {
    format!("{}:{}:{}", app_name, user_id, session_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_key_same_slot() {
        let key = session_hash_key("app", "user", "s1");
        assert_eq!(slot_index(&key, 10), slot_index(&key, 10));
        assert!(slot_index(&key, 10) < 10);
        assert_eq!(slot_index(&key, 0), 0);
    }

    #[test]
    fn known_vector() {
        // Reference value for murmur3_x86_32("hello", 0).
        assert_eq!(murmur3_32("hello"), 0x248b_fa47);
    }
}
