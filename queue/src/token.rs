use rand::RngCore;

/// Mint a fresh 128-bit random ack token, hex-encoded to 32 characters.
///
/// Required to `ping` or `ack` a message claimed by `get`.
pub fn new_ack_token() -> String {
    let mut bytes = [0u8; 16];
    rand::rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn is_32_lowercase_hex_chars() {
        let token = new_ack_token();
        assert_eq!(token.len(), 32);
        assert!(token.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn successive_tokens_do_not_collide() {
        let a = new_ack_token();
        let b = new_ack_token();
        assert_ne!(a, b);
    }
}
