use rand::distributions::Alphanumeric;
use rand::rngs::OsRng;
use rand::Rng;
use sha2::{Digest, Sha256};

use crate::error::Error;

/// External password hashing interface.
pub trait PasswordHasher: Send + Sync {
    fn hash(&self, plaintext: &str) -> Result<String, Error>;
    fn verify(&self, plaintext: &str, hash: &str) -> Result<bool, Error>;
}

/// Length of generated one-time secrets (personal access tokens,
/// verification codes are shorter, see [`generate_numeric_code`]).
const SECRET_LENGTH: usize = 40;

/// Generates a random alphanumeric secret.
///
/// Returned once to the caller; only its digest is stored.
pub fn generate_secret() -> String {
    OsRng
        .sample_iter(&Alphanumeric)
        .take(SECRET_LENGTH)
        .map(char::from)
        .collect()
}

/// Generates a short numeric verification code.
pub fn generate_numeric_code(digits: usize) -> String {
    let mut rng = OsRng;
    (0..digits).map(|_| char::from(b'0' + rng.gen_range(0..10u8))).collect()
}

/// Hex-encoded SHA-256 digest, used to store secrets at rest.
pub fn digest(secret: &str) -> String {
    hex::encode(Sha256::digest(secret.as_bytes()))
}

/// Constant shape check plus digest comparison for presented secrets.
pub fn digest_matches(presented: &str, stored_digest: &str) -> bool {
    digest(presented) == stored_digest
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::PasswordHasher;
    use crate::error::Error;

    /// Reversible test hasher, never use outside tests.
    pub struct PlainHasher;

    impl PasswordHasher for PlainHasher {
        fn hash(&self, plaintext: &str) -> Result<String, Error> {
            Ok(format!("plain:{plaintext}"))
        }

        fn verify(&self, plaintext: &str, hash: &str) -> Result<bool, Error> {
            Ok(hash == format!("plain:{plaintext}"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{digest, digest_matches, generate_numeric_code, generate_secret};

    #[test]
    fn secrets_are_random_and_sized() {
        let a = generate_secret();
        let b = generate_secret();
        assert_eq!(a.len(), 40);
        assert_ne!(a, b);
    }

    #[test]
    fn numeric_codes_have_requested_digits() {
        let code = generate_numeric_code(6);
        assert_eq!(code.len(), 6);
        assert!(code.chars().all(|c| c.is_ascii_digit()));
    }

    #[test]
    fn digest_round_trip() {
        let secret = generate_secret();
        let stored = digest(&secret);
        assert!(digest_matches(&secret, &stored));
        assert!(!digest_matches("wrong", &stored));
    }
}
