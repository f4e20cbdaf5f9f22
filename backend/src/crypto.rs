//! Payload confidentiality: `$GNGGA`-prefixed frames are plaintext NMEA;
//! everything else is AES-128-CBC/PKCS7 ciphertext, base64-encoded.
//! Mirrors `original_source/backend/app/modules/decrypt.py`.

use aes::Aes128;
use base64::Engine as _;
use cbc::cipher::{BlockDecryptMut, KeyIvInit};

use crate::error::CryptoError;

type Aes128CbcDec = cbc::Decryptor<Aes128>;

/// True if the raw payload is plaintext NMEA and should not be decrypted.
pub fn is_plaintext(payload: &[u8]) -> bool {
    payload.starts_with(b"$GNGGA")
}

/// Decrypts a base64-encoded AES-128-CBC/PKCS7 ciphertext and returns the
/// UTF-8 plaintext. Any failure (bad base64, bad padding, bad UTF-8) is
/// reported as a single `CryptoError` — the caller treats it like any other
/// malformed frame and drops it.
pub fn decrypt_aes(ciphertext_b64: &str, key: &[u8; 16], iv: &[u8; 16]) -> Result<String, CryptoError> {
    let ciphertext = base64::engine::general_purpose::STANDARD
        .decode(ciphertext_b64.trim())
        .map_err(|_| CryptoError::Base64)?;

    let mut buf = ciphertext;
    let decrypted = Aes128CbcDec::new(key.into(), iv.into())
        .decrypt_padded_mut::<cbc::cipher::block_padding::Pkcs7>(&mut buf)
        .map_err(|_| CryptoError::Decrypt)?;

    String::from_utf8(decrypted.to_vec()).map_err(|_| CryptoError::Utf8)
}

#[cfg(test)]
mod tests {
    use super::*;
    use cbc::cipher::BlockEncryptMut;

    fn encrypt_for_test(plaintext: &str, key: &[u8; 16], iv: &[u8; 16]) -> String {
        type Enc = cbc::Encryptor<Aes128>;
        let mut buf = plaintext.as_bytes().to_vec();
        buf.resize(buf.len() + 16, 0);
        let pt_len = plaintext.len();
        let ct = Enc::new(key.into(), iv.into())
            .encrypt_padded_mut::<cbc::cipher::block_padding::Pkcs7>(&mut buf, pt_len)
            .unwrap();
        base64::engine::general_purpose::STANDARD.encode(ct)
    }

    #[test]
    fn plaintext_prefix_is_detected() {
        assert!(is_plaintext(b"$GNGGA,123456,..."));
        assert!(!is_plaintext(b"aGVsbG8="));
    }

    #[test]
    fn round_trips_through_cbc_pkcs7() {
        let key = [7u8; 16];
        let iv = [3u8; 16];
        let payload = r#"{"rainfall_mm": 10.0}"#;
        let b64 = encrypt_for_test(payload, &key, &iv);
        let decrypted = decrypt_aes(&b64, &key, &iv).unwrap();
        assert_eq!(decrypted, payload);
    }

    #[test]
    fn rejects_bad_base64() {
        let key = [1u8; 16];
        let iv = [2u8; 16];
        assert!(decrypt_aes("not base64 !!", &key, &iv).is_err());
    }
}
