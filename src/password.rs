use sha2::{Digest, Sha256};
use uuid::Uuid;

const SCHEME: &str = "sha256i";
const ITERATIONS: u32 = 20_000;
pub const MIN_PASSWORD_LEN: usize = 6;

/// Salted, iterated SHA-256. Stored as `sha256i$<iterations>$<salt_hex>$<hash_hex>`.
pub fn hash_password(password: &str) -> String {
    let salt = Uuid::new_v4();
    let digest = derive(password.as_bytes(), salt.as_bytes(), ITERATIONS);
    format!(
        "{}${}${}${}",
        SCHEME,
        ITERATIONS,
        hex::encode(salt.as_bytes()),
        hex::encode(digest)
    )
}

pub fn verify_password(password: &str, stored: &str) -> bool {
    let mut parts = stored.split('$');
    let (Some(scheme), Some(iterations), Some(salt_hex), Some(hash_hex), None) = (
        parts.next(),
        parts.next(),
        parts.next(),
        parts.next(),
        parts.next(),
    ) else {
        return false;
    };
    if scheme != SCHEME {
        return false;
    }
    let Ok(iterations) = iterations.parse::<u32>() else {
        return false;
    };
    let (Ok(salt), Ok(expected)) = (hex::decode(salt_hex), hex::decode(hash_hex)) else {
        return false;
    };
    let actual = derive(password.as_bytes(), &salt, iterations.max(1));
    constant_time_eq(&actual, &expected)
}

fn derive(password: &[u8], salt: &[u8], iterations: u32) -> Vec<u8> {
    let mut digest = Sha256::new()
        .chain_update(salt)
        .chain_update(password)
        .finalize();
    for _ in 1..iterations {
        digest = Sha256::new()
            .chain_update(digest)
            .chain_update(password)
            .finalize();
    }
    digest.to_vec()
}

pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_then_verify() {
        let stored = hash_password("s3cret-pass");
        assert!(stored.starts_with("sha256i$"));
        assert!(verify_password("s3cret-pass", &stored));
        assert!(!verify_password("s3cret-pasS", &stored));
    }

    #[test]
    fn same_password_gets_distinct_salts() {
        assert_ne!(hash_password("abc123"), hash_password("abc123"));
    }

    #[test]
    fn malformed_hashes_never_verify() {
        assert!(!verify_password("x", ""));
        assert!(!verify_password("x", "plain"));
        assert!(!verify_password("x", "md5$1$00$00"));
        assert!(!verify_password("x", "sha256i$many$00$00"));
        assert!(!verify_password("x", "sha256i$1$zz$00"));
    }
}
