//! Pre-shared-key derivation.
//!
//! IEEE 802.11 derives the 32-byte PSK from the passphrase with
//! PBKDF2-HMAC-SHA1 over the SSID, 4096 iterations. With the
//! `no-plain-psk` feature the bridge applies this before handing the key
//! to the supplicant, so the plaintext passphrase never reaches the
//! supplicant's config file.

use std::fmt::Write;
use std::num::NonZeroU32;

use ring::pbkdf2;

const ITERATIONS: NonZeroU32 = match NonZeroU32::new(4096) {
    Some(n) => n,
    None => unreachable!(),
};

/// PBKDF2-HMAC-SHA1(passphrase, ssid, 4096, 32) as 64 hex digits.
pub fn derive_psk(passphrase: &str, ssid: &str) -> String {
    let mut key = [0u8; 32];
    pbkdf2::derive(
        pbkdf2::PBKDF2_HMAC_SHA1,
        ITERATIONS,
        ssid.as_bytes(),
        passphrase.as_bytes(),
        &mut key,
    );
    key.iter().fold(String::with_capacity(64), |mut s, b| {
        let _ = write!(s, "{b:02x}");
        s
    })
}

/// Replace a quoted plaintext passphrase by its derived key; anything
/// unquoted is already a raw key and passes through verbatim.
pub fn hash_if_quoted(psk: &str, ssid: &str) -> String {
    match psk
        .strip_prefix('"')
        .and_then(|rest| rest.strip_suffix('"'))
    {
        Some(plain) if !plain.is_empty() => derive_psk(plain, ssid),
        _ => psk.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // IEEE 802.11i D7.0 annex test vectors.
    #[test]
    fn known_vectors() {
        assert_eq!(
            derive_psk("password", "IEEE"),
            "f42c6fc52df0ebef9ebb4b90b38a5f902e83fe1b135a70e23aed762e9710a12e"
        );
        assert_eq!(
            derive_psk("ThisIsAPassword", "ThisIsASSID"),
            "0dc0d6eb90555ed6419756b9a15ec3e3209b63df707dd508d14581f8982721af"
        );
    }

    #[test]
    fn quoted_psk_is_hashed() {
        let hashed = hash_if_quoted("\"password\"", "IEEE");
        assert_eq!(hashed.len(), 64);
        assert_eq!(hashed, derive_psk("password", "IEEE"));
    }

    #[test]
    fn raw_psk_passes_through() {
        let raw = "f42c6fc52df0ebef9ebb4b90b38a5f902e83fe1b135a70e23aed762e9710a12e";
        assert_eq!(hash_if_quoted(raw, "IEEE"), raw);
    }
}
