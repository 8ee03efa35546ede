//! Cipher and hash primitives used by the standard security handler.
//!
//! RC4 is implemented here; AES-CBC comes from the `aes`/`cbc` crates and the
//! digests from `md5`/`sha2`.

use super::error::{PDFError, PDFResult};
use aes::cipher::block_padding::NoPadding;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use sha2::{Digest, Sha256, Sha384, Sha512};

type Aes128CbcDec = cbc::Decryptor<aes::Aes128>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;
type Aes128CbcEnc = cbc::Encryptor<aes::Aes128>;
type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;

pub fn md5(data: &[u8]) -> [u8; 16] {
    md5::compute(data).0
}

pub fn sha256(data: &[u8]) -> Vec<u8> {
    Sha256::digest(data).to_vec()
}

pub fn sha384(data: &[u8]) -> Vec<u8> {
    Sha384::digest(data).to_vec()
}

pub fn sha512(data: &[u8]) -> Vec<u8> {
    Sha512::digest(data).to_vec()
}

/// RC4 stream cipher. Encryption and decryption are the same operation.
#[derive(Clone)]
pub struct Rc4 {
    s: [u8; 256],
    i: u8,
    j: u8,
}

impl Rc4 {
    /// Creates the cipher. An empty key yields an identity keystream-free
    /// state; callers always pass at least 5 bytes.
    pub fn new(key: &[u8]) -> Self {
        let mut s: [u8; 256] = std::array::from_fn(|i| i as u8);
        if !key.is_empty() {
            let mut j: u8 = 0;
            for i in 0..256 {
                j = j.wrapping_add(s[i]).wrapping_add(key[i % key.len()]);
                s.swap(i, j as usize);
            }
        }
        Rc4 { s, i: 0, j: 0 }
    }

    pub fn process(&mut self, input: &[u8]) -> Vec<u8> {
        input.iter().map(|&byte| byte ^ self.next_key_byte()).collect()
    }

    fn next_key_byte(&mut self) -> u8 {
        self.i = self.i.wrapping_add(1);
        self.j = self.j.wrapping_add(self.s[self.i as usize]);
        self.s.swap(self.i as usize, self.j as usize);
        let idx = self.s[self.i as usize].wrapping_add(self.s[self.j as usize]);
        self.s[idx as usize]
    }
}

/// One-shot RC4.
pub fn rc4(key: &[u8], data: &[u8]) -> Vec<u8> {
    Rc4::new(key).process(data)
}

/// AES-CBC decryption without padding removal. Trailing bytes that do not
/// form a whole block are dropped.
pub fn aes_cbc_decrypt(key: &[u8], iv: &[u8], data: &[u8]) -> PDFResult<Vec<u8>> {
    let mut buf = data[..data.len() - data.len() % 16].to_vec();
    let invalid = |e| PDFError::Generic(format!("AES key/IV: {}", e));
    let decrypted_len = match key.len() {
        16 => Aes128CbcDec::new_from_slices(key, iv)
            .map_err(invalid)?
            .decrypt_padded_mut::<NoPadding>(&mut buf)
            .map_err(|e| PDFError::Generic(format!("AES decrypt: {}", e)))?
            .len(),
        32 => Aes256CbcDec::new_from_slices(key, iv)
            .map_err(invalid)?
            .decrypt_padded_mut::<NoPadding>(&mut buf)
            .map_err(|e| PDFError::Generic(format!("AES decrypt: {}", e)))?
            .len(),
        n => {
            return Err(PDFError::Generic(format!(
                "AES key must be 16 or 32 bytes, got {}",
                n
            )));
        }
    };
    buf.truncate(decrypted_len);
    Ok(buf)
}

/// AES-CBC encryption of whole blocks, no padding. The key selects
/// AES-128 or AES-256.
pub fn aes_cbc_encrypt(key: &[u8], iv: &[u8], data: &[u8]) -> PDFResult<Vec<u8>> {
    let mut buf = data.to_vec();
    let len = buf.len();
    let invalid = |e| PDFError::Generic(format!("AES key/IV: {}", e));
    let encrypted_len = match key.len() {
        16 => Aes128CbcEnc::new_from_slices(key, iv)
            .map_err(invalid)?
            .encrypt_padded_mut::<NoPadding>(&mut buf, len)
            .map_err(|e| PDFError::Generic(format!("AES encrypt: {}", e)))?
            .len(),
        32 => Aes256CbcEnc::new_from_slices(key, iv)
            .map_err(invalid)?
            .encrypt_padded_mut::<NoPadding>(&mut buf, len)
            .map_err(|e| PDFError::Generic(format!("AES encrypt: {}", e)))?
            .len(),
        n => {
            return Err(PDFError::Generic(format!(
                "AES key must be 16 or 32 bytes, got {}",
                n
            )));
        }
    };
    buf.truncate(encrypted_len);
    Ok(buf)
}

/// Appends PKCS#7 padding up to the next 16-byte boundary.
pub fn pad_pkcs7(data: &[u8]) -> Vec<u8> {
    let pad = 16 - data.len() % 16;
    let mut out = Vec::with_capacity(data.len() + pad);
    out.extend_from_slice(data);
    out.resize(data.len() + pad, pad as u8);
    out
}

/// Strips PKCS#7 padding; invalid padding leaves the data unchanged.
pub fn unpad_pkcs7(data: &[u8]) -> &[u8] {
    let Some(&last) = data.last() else {
        return data;
    };
    let pad = last as usize;
    if pad == 0 || pad > 16 || pad > data.len() {
        return data;
    }
    let start = data.len() - pad;
    if data[start..].iter().all(|&b| b == last) {
        &data[..start]
    } else {
        data
    }
}

/// Hash of the revision 6 handler (ISO 32000-2, algorithm 2.B).
///
/// `user_bytes` is the 48-byte `/U` value when checking the owner password,
/// empty otherwise.
pub fn hash_revision6(password: &[u8], salt: &[u8], user_bytes: &[u8]) -> PDFResult<Vec<u8>> {
    let mut input = Vec::with_capacity(password.len() + salt.len() + user_bytes.len());
    input.extend_from_slice(password);
    input.extend_from_slice(salt);
    input.extend_from_slice(user_bytes);
    let mut k = sha256(&input);

    let mut round: u32 = 0;
    loop {
        let mut block = Vec::with_capacity(password.len() + k.len() + user_bytes.len());
        block.extend_from_slice(password);
        block.extend_from_slice(&k);
        block.extend_from_slice(user_bytes);
        let k1 = block.repeat(64);

        let e = aes_cbc_encrypt(&k[..16], &k[16..32], &k1)?;
        // 256 % 3 == 1, so the big-endian value mod 3 is the byte sum mod 3
        let remainder = e[..16].iter().map(|&b| b as u32).sum::<u32>() % 3;
        k = match remainder {
            0 => sha256(&e),
            1 => sha384(&e),
            _ => sha512(&e),
        };

        round += 1;
        let last = e.last().copied().unwrap_or(0) as u32;
        if round >= 64 && last <= round - 32 {
            break;
        }
    }

    k.truncate(32);
    Ok(k)
}
