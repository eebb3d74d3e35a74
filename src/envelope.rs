use std::path::Path;

use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, KeyIvInit};
use hmac::{Hmac, Mac};
use rsa::{pkcs1::DecodeRsaPrivateKey, pkcs8::DecodePrivateKey, Oaep, RsaPrivateKey};
use sha1::Sha1;
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::{error::EnvelopeError, models::EncryptedContent};

const IV_LEN: usize = 16;

type HmacSha256 = Hmac<Sha256>;

pub struct EnvelopeDecoder {
    private_key: RsaPrivateKey,
}

impl EnvelopeDecoder {
    pub fn new(private_key: RsaPrivateKey) -> Self {
        Self { private_key }
    }

    pub fn from_pem(pem: &str) -> anyhow::Result<Self> {
        let private_key = match RsaPrivateKey::from_pkcs8_pem(pem) {
            Ok(key) => key,
            Err(_) => RsaPrivateKey::from_pkcs1_pem(pem)
                .map_err(|err| anyhow::anyhow!("invalid RSA private key: {err}"))?,
        };
        Ok(Self::new(private_key))
    }

    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let pem = std::fs::read_to_string(path)
            .map_err(|err| anyhow::anyhow!("cannot read {}: {err}", path.display()))?;
        Self::from_pem(&pem)
    }

    // The ciphertext is only decrypted after the signature matched.
    pub fn decode(&self, content: &EncryptedContent) -> Result<String, EnvelopeError> {
        let wrapped_key = decode_b64(&content.data_key, "dataKey")?;
        let symmetric_key = self
            .private_key
            .decrypt(Oaep::new::<Sha1>(), &wrapped_key)
            .map_err(|err| EnvelopeError::Crypto(format!("key unwrap failed: {err}")))?;

        let ciphertext = decode_b64(&content.data, "data")?;
        let signature = calculate_signature(&symmetric_key, &ciphertext)?;
        if !bool::from(
            signature
                .as_bytes()
                .ct_eq(content.data_signature.as_bytes()),
        ) {
            return Err(EnvelopeError::Integrity);
        }

        let plaintext = decrypt_payload(&symmetric_key, &ciphertext)?;
        String::from_utf8(plaintext)
            .map_err(|err| EnvelopeError::Crypto(format!("payload is not UTF-8: {err}")))
    }
}

fn decode_b64(value: &str, field: &str) -> Result<Vec<u8>, EnvelopeError> {
    base64::decode(value).map_err(|err| EnvelopeError::Decode(format!("{field}: {err}")))
}

fn calculate_signature(key: &[u8], ciphertext: &[u8]) -> Result<String, EnvelopeError> {
    let mut mac = HmacSha256::new_from_slice(key)
        .map_err(|err| EnvelopeError::Crypto(err.to_string()))?;
    mac.update(ciphertext);
    Ok(base64::encode(mac.finalize().into_bytes()))
}

fn decrypt_payload(key: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>, EnvelopeError> {
    if key.len() < IV_LEN {
        return Err(EnvelopeError::Crypto(format!(
            "symmetric key too short ({} bytes)",
            key.len()
        )));
    }
    let iv = &key[..IV_LEN];
    let invalid_length = |err: aes::cipher::InvalidLength| EnvelopeError::Crypto(err.to_string());

    let result = match key.len() {
        16 => cbc::Decryptor::<aes::Aes128>::new_from_slices(key, iv)
            .map_err(invalid_length)?
            .decrypt_padded_vec_mut::<Pkcs7>(ciphertext),
        24 => cbc::Decryptor::<aes::Aes192>::new_from_slices(key, iv)
            .map_err(invalid_length)?
            .decrypt_padded_vec_mut::<Pkcs7>(ciphertext),
        32 => cbc::Decryptor::<aes::Aes256>::new_from_slices(key, iv)
            .map_err(invalid_length)?
            .decrypt_padded_vec_mut::<Pkcs7>(ciphertext),
        other => {
            return Err(EnvelopeError::Crypto(format!(
                "unsupported symmetric key length {other}"
            )));
        }
    };

    result.map_err(|_| EnvelopeError::Crypto("invalid padding".to_string()))
}
