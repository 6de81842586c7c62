//! Server greeting and the chap-sha1 scramble.
//!
//! Upon accept the server sends a fixed 128-byte banner: two 64-byte
//! newline-terminated lines, the first carrying the product name and
//! version, the second a base64-encoded per-connection salt.

use sha1::{Digest, Sha1};

use crate::error::Error;

pub const GREETING_SIZE: usize = 128;
pub const GREETING_LINE1_SIZE: usize = 64;
pub const GREETING_MAX_SALT_SIZE: usize = 44;
pub const MAX_SALT_SIZE: usize = 32;
pub const SCRAMBLE_SIZE: usize = 20;

const GREETING_PREFIX: &str = "Tarantool ";

/// Parsed greeting. The salt is not null-terminated; only the first
/// `salt_size` bytes are meaningful.
#[derive(Debug, Clone, Copy)]
pub struct Greeting {
    pub version_id: u32,
    pub salt_size: usize,
    pub salt: [u8; MAX_SALT_SIZE],
}

impl Greeting {
    #[inline]
    pub fn salt(&self) -> &[u8] {
        &self.salt[..self.salt_size]
    }
}

#[inline]
pub const fn version_id(major: u32, minor: u32, patch: u32) -> u32 {
    (((major << 8) | minor) << 8) | patch
}

/// Parse the leading `M.m.p` triple of a version string, ignoring
/// whatever follows the patch number (build metadata, instance uuid).
fn parse_version(s: &str) -> Option<u32> {
    let mut parts = [0u32; 3];
    let mut rest = s;
    for (i, part) in parts.iter_mut().enumerate() {
        let digits = rest.len() - rest.trim_start_matches(|c: char| c.is_ascii_digit()).len();
        if digits == 0 {
            return None;
        }
        *part = rest[..digits].parse().ok()?;
        rest = &rest[digits..];
        if i < 2 {
            rest = rest.strip_prefix('.')?;
        }
    }
    Some(version_id(parts[0], parts[1], parts[2]))
}

/// Parse the raw 128-byte greeting.
pub fn parse_greeting(raw: &[u8]) -> Result<Greeting, Error> {
    if raw.len() != GREETING_SIZE {
        return Err(Error::Greeting("greeting must be exactly 128 bytes"));
    }
    let (line1, line2) = raw.split_at(GREETING_LINE1_SIZE);
    if line1[GREETING_LINE1_SIZE - 1] != b'\n' || line2[GREETING_LINE1_SIZE - 1] != b'\n' {
        return Err(Error::Greeting("greeting lines must end with a newline"));
    }

    let line1 = std::str::from_utf8(line1)?;
    let version_etc = line1
        .strip_prefix(GREETING_PREFIX)
        .ok_or(Error::Greeting("unexpected product name"))?;
    let version_id =
        parse_version(version_etc).ok_or(Error::Greeting("unparsable version triple"))?;

    let salt_encoded = &line2[..GREETING_MAX_SALT_SIZE];
    let end = salt_encoded
        .iter()
        .position(|&b| b == b'\n' || b == b' ')
        .unwrap_or(GREETING_MAX_SALT_SIZE);
    let decoded = base64::decode(&salt_encoded[..end])
        .map_err(|_| Error::Greeting("salt is not valid base64"))?;
    if decoded.len() < SCRAMBLE_SIZE {
        return Err(Error::Greeting("salt is too short to scramble with"));
    }

    let salt_size = decoded.len().min(MAX_SALT_SIZE);
    let mut salt = [0u8; MAX_SALT_SIZE];
    salt[..salt_size].copy_from_slice(&decoded[..salt_size]);
    Ok(Greeting {
        version_id,
        salt_size,
        salt,
    })
}

/// Compute the chap-sha1 scramble:
///
/// ```text
/// step_1 = sha1(password)
/// step_2 = sha1(step_1)
/// step_3 = sha1(first_20_bytes_of_salt, step_2)
/// scramble = xor(step_1, step_3)
/// ```
///
/// The salt must hold at least [`SCRAMBLE_SIZE`] bytes, which the
/// greeting parser guarantees.
pub fn scramble(password: &str, salt: &[u8]) -> [u8; SCRAMBLE_SIZE] {
    let mut hasher = Sha1::new();
    hasher.update(password.as_bytes());
    let mut step_1_and_scramble = hasher.finalize();

    let mut hasher = Sha1::new();
    hasher.update(step_1_and_scramble);
    let step_2 = hasher.finalize();

    let mut hasher = Sha1::new();
    hasher.update(&salt[0..SCRAMBLE_SIZE]);
    hasher.update(step_2);
    let step_3 = hasher.finalize();

    step_1_and_scramble
        .iter_mut()
        .zip(step_3.iter())
        .for_each(|(a, b)| *a ^= *b);

    step_1_and_scramble.into()
}

/// Well-formed greeting bytes for codec tests.
#[cfg(test)]
pub(crate) fn fake_greeting_with(version: &str, salt: &[u8]) -> Vec<u8> {
    let mut greeting = Vec::with_capacity(GREETING_SIZE);
    greeting.extend_from_slice(format!("Tarantool {} (Binary) <uuid>", version).as_bytes());
    greeting.resize(GREETING_LINE1_SIZE - 1, b' ');
    greeting.push(b'\n');
    greeting.extend_from_slice(base64::encode(salt).as_bytes());
    greeting.resize(GREETING_SIZE - 1, b' ');
    greeting.push(b'\n');
    greeting
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_regular_greeting() {
        let salt: Vec<u8> = (0..32).collect();
        let raw = fake_greeting_with("2.10.0", &salt);
        let greeting = parse_greeting(&raw).unwrap();
        assert_eq!(greeting.version_id, version_id(2, 10, 0));
        assert_eq!(greeting.version_id, (2 << 16) | (10 << 8));
        assert_eq!(greeting.salt(), &salt[..]);
    }

    #[test]
    fn ignores_trailing_garbage_after_version() {
        let raw = fake_greeting_with("3.0.1-entrypoint-42-gdeadbeef", &[1u8; 24]);
        let greeting = parse_greeting(&raw).unwrap();
        assert_eq!(greeting.version_id, version_id(3, 0, 1));
        assert_eq!(greeting.salt_size, 24);
    }

    #[test]
    fn rejects_malformed_greetings() {
        let salt = [9u8; 32];
        let good = fake_greeting_with("2.10.0", &salt);

        assert!(parse_greeting(&good[..100]).is_err());

        let mut bad_prefix = good.clone();
        bad_prefix[0] = b'X';
        assert!(parse_greeting(&bad_prefix).is_err());

        let mut no_newline = good.clone();
        no_newline[GREETING_LINE1_SIZE - 1] = b' ';
        assert!(parse_greeting(&no_newline).is_err());

        let mut no_version = good.clone();
        no_version[10] = b'v';
        assert!(parse_greeting(&no_version).is_err());

        // 12 decoded bytes are not enough to scramble with
        let short_salt = fake_greeting_with("2.10.0", &[1u8; 12]);
        assert!(parse_greeting(&short_salt).is_err());
    }

    #[test]
    fn scramble_matches_the_literal_composition() {
        let salt: Vec<u8> = (100..132).collect();
        let password = "s3cret";

        let s1: [u8; 20] = Sha1::digest(password.as_bytes()).into();
        let s2: [u8; 20] = Sha1::digest(&s1).into();
        let mut hasher = Sha1::new();
        hasher.update(&salt[..20]);
        hasher.update(s2);
        let s3: [u8; 20] = hasher.finalize().into();
        let mut expected = [0u8; 20];
        for i in 0..20 {
            expected[i] = s1[i] ^ s3[i];
        }

        assert_eq!(scramble(password, &salt), expected);
    }

    #[test]
    fn empty_password_scramble_against_parsed_salt() {
        let salt: Vec<u8> = (0..32).rev().collect();
        let raw = fake_greeting_with("2.10.0", &salt);
        let greeting = parse_greeting(&raw).unwrap();
        assert_eq!(greeting.salt(), &salt[..]);

        let scram = scramble("", greeting.salt());
        assert_eq!(scram.len(), SCRAMBLE_SIZE);
        assert_eq!(scram, scramble("", &salt));
        assert_ne!(scram, scramble("x", &salt));
    }

    #[test]
    fn base64_round_trip() {
        for len in 0..=192usize {
            let data: Vec<u8> = (0..len as u32).map(|i| (i * 31 % 251) as u8).collect();
            let encoded = base64::encode(&data);
            assert_eq!(encoded.len(), (len + 2) / 3 * 4);
            assert_eq!(base64::decode(&encoded).unwrap(), data);
        }
    }
}
