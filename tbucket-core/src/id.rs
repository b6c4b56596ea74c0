//! Namespace id generation: an 11-character URL-safe token, generated once
//! at registration and never reused.

use rand::Rng;

const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789-_";
const NAMESPACE_ID_LEN: usize = 11;

/// Generates a fresh 11-character URL-safe namespace id.
///
/// Collision with an existing id is possible in principle (11 chars from a
/// 64-symbol alphabet is ~2^65 of entropy, so in practice it never happens)
/// but callers must still check `namespace_id_key` existence before
/// committing a new namespace, since this function has no way to consult
/// the store itself.
#[must_use]
pub fn generate_namespace_id() -> String {
    let mut rng = rand::rng();
    (0..NAMESPACE_ID_LEN)
        .map(|_| ALPHABET[rng.random_range(0..ALPHABET.len())] as char)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generates_exactly_eleven_chars() {
        let id = generate_namespace_id();
        assert_eq!(id.chars().count(), 11);
    }

    #[test]
    fn generates_only_url_safe_characters() {
        let id = generate_namespace_id();
        assert!(id.bytes().all(|b| ALPHABET.contains(&b)));
    }

    #[test]
    fn two_generated_ids_are_very_unlikely_to_collide() {
        let a = generate_namespace_id();
        let b = generate_namespace_id();
        assert_ne!(a, b);
    }
}
