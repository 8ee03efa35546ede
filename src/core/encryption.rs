//! Standard security handler.
//!
//! Supports `/V` 1, 2, 4 and 5 with revisions 2 through 6 (RC4, AESV2,
//! AESV3 and Identity crypt filters). The password is checked once when the
//! document is opened; afterwards [`CipherTransformFactory`] hands out a
//! [`CipherTransform`] per indirect object.

use super::crypto::{self, Rc4};
use super::error::{PDFError, PDFResult};
use super::primitives::{Dict, PDFObject};
use log::debug;
use serde::{Deserialize, Serialize};

/// Password padding string (ISO 32000-1, 7.6.3.3).
pub const PASSWORD_PADDING: [u8; 32] = [
    0x28, 0xBF, 0x4E, 0x5E, 0x4E, 0x75, 0x8A, 0x41, 0x64, 0x00, 0x4E, 0x56, 0xFF, 0xFA, 0x01, 0x08,
    0x2E, 0x2E, 0x00, 0xB6, 0xD0, 0x68, 0x3E, 0x80, 0x2F, 0x0C, 0xA9, 0xFE, 0x64, 0x53, 0x69, 0x7A,
];

/// Document permissions from `/P`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Permissions {
    pub print: bool,
    pub modify: bool,
    pub copy: bool,
    pub annotate: bool,
    pub fill_form: bool,
    pub extract: bool,
    pub assemble: bool,
    pub print_high_quality: bool,
    pub raw_value: i32,
}

impl Permissions {
    pub fn from_p_value(p: i32) -> Self {
        Permissions {
            print: p & 0x0004 != 0,
            modify: p & 0x0008 != 0,
            copy: p & 0x0010 != 0,
            annotate: p & 0x0020 != 0,
            fill_form: p & 0x0100 != 0,
            extract: p & 0x0200 != 0,
            assemble: p & 0x0400 != 0,
            print_high_quality: p & 0x0800 != 0,
            raw_value: p,
        }
    }
}

/// Cipher selected by a crypt filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CryptMethod {
    Identity,
    Rc4,
    AesV2,
    AesV3,
}

impl CryptMethod {
    fn from_cfm(name: &str) -> PDFResult<Self> {
        match name {
            "None" | "Identity" => Ok(CryptMethod::Identity),
            "V2" => Ok(CryptMethod::Rc4),
            "AESV2" => Ok(CryptMethod::AesV2),
            "AESV3" => Ok(CryptMethod::AesV3),
            other => Err(PDFError::InvalidDocument(format!(
                "unknown crypt filter method /{}",
                other
            ))),
        }
    }
}

/// The parsed `/Encrypt` dictionary.
#[derive(Debug, Clone)]
pub struct EncryptDict {
    pub version: i64,
    pub revision: i64,
    /// File key length in bytes.
    pub key_length: usize,
    pub o: Vec<u8>,
    pub u: Vec<u8>,
    pub oe: Option<Vec<u8>>,
    pub ue: Option<Vec<u8>>,
    pub p: i32,
    pub encrypt_metadata: bool,
    pub string_method: CryptMethod,
    pub stream_method: CryptMethod,
}

impl EncryptDict {
    pub fn from_dict(dict: &Dict) -> PDFResult<Self> {
        let filter = dict.get("Filter").and_then(PDFObject::as_name);
        if filter != Some("Standard") {
            return Err(PDFError::InvalidDocument(format!(
                "unsupported security handler {:?}",
                filter.unwrap_or("<none>")
            )));
        }

        let version = dict.get("V").and_then(PDFObject::as_i64).unwrap_or(0);
        let revision = dict
            .get("R")
            .and_then(PDFObject::as_i64)
            .ok_or_else(|| PDFError::InvalidDocument("/Encrypt without /R".into()))?;
        if !(2..=6).contains(&revision) {
            return Err(PDFError::InvalidDocument(format!(
                "unsupported security handler revision {}",
                revision
            )));
        }

        let bytes_of = |key: &str| dict.get(key).and_then(PDFObject::as_bytes).map(<[u8]>::to_vec);
        let o = bytes_of("O").ok_or_else(|| PDFError::InvalidDocument("/Encrypt without /O".into()))?;
        let u = bytes_of("U").ok_or_else(|| PDFError::InvalidDocument("/Encrypt without /U".into()))?;
        let p = dict.get("P").and_then(PDFObject::as_i64).unwrap_or(-1) as i32;
        let encrypt_metadata = dict
            .get("EncryptMetadata")
            .and_then(PDFObject::as_bool)
            .unwrap_or(true);

        let (string_method, stream_method) = match version {
            1 | 2 => (CryptMethod::Rc4, CryptMethod::Rc4),
            4 | 5 => {
                let cf = dict.get("CF").and_then(PDFObject::as_dict);
                let method_for = |key: &str| -> PDFResult<CryptMethod> {
                    let name = dict
                        .get(key)
                        .and_then(PDFObject::as_name)
                        .unwrap_or("Identity");
                    if name == "Identity" {
                        return Ok(CryptMethod::Identity);
                    }
                    let cfm = cf
                        .and_then(|cf| cf.get(name))
                        .and_then(|filter| filter.get("CFM"))
                        .and_then(PDFObject::as_name)
                        .unwrap_or("None");
                    CryptMethod::from_cfm(cfm)
                };
                (method_for("StrF")?, method_for("StmF")?)
            }
            other => {
                return Err(PDFError::InvalidDocument(format!(
                    "unsupported encryption version {}",
                    other
                )));
            }
        };

        let uses = |m: CryptMethod| string_method == m || stream_method == m;
        let key_length = if version == 5 || uses(CryptMethod::AesV3) {
            32
        } else if version == 1 {
            5
        } else if uses(CryptMethod::AesV2) {
            16
        } else {
            let bits = dict
                .get("Length")
                .and_then(PDFObject::as_usize)
                .unwrap_or(40);
            // some writers store the length in bytes
            let bytes = if bits <= 16 { bits } else { bits / 8 };
            bytes.clamp(5, 16)
        };

        Ok(EncryptDict {
            version,
            revision,
            key_length,
            o,
            u,
            oe: bytes_of("OE"),
            ue: bytes_of("UE"),
            p,
            encrypt_metadata,
            string_method,
            stream_method,
        })
    }

    pub fn permissions(&self) -> Permissions {
        Permissions::from_p_value(self.p)
    }
}

/// Pads or truncates a password to 32 bytes (algorithm 2, step a).
pub fn pad_password(password: &[u8]) -> [u8; 32] {
    let mut out = PASSWORD_PADDING;
    let n = password.len().min(32);
    out[..n].copy_from_slice(&password[..n]);
    out[n..].copy_from_slice(&PASSWORD_PADDING[..32 - n]);
    out
}

/// Computes the file key from a user password for revisions 2 to 4
/// (algorithm 2).
pub fn compute_file_key(
    password: &[u8],
    o: &[u8],
    p: i32,
    file_id: &[u8],
    revision: i64,
    key_length: usize,
    encrypt_metadata: bool,
) -> Vec<u8> {
    let mut input = Vec::with_capacity(32 + o.len() + 4 + file_id.len() + 4);
    input.extend_from_slice(&pad_password(password));
    input.extend_from_slice(&o[..o.len().min(32)]);
    input.extend_from_slice(&p.to_le_bytes());
    input.extend_from_slice(file_id);
    if revision >= 4 && !encrypt_metadata {
        input.extend_from_slice(&[0xFF; 4]);
    }

    let mut hash = crypto::md5(&input);
    let n = key_length.min(16);
    if revision >= 3 {
        for _ in 0..50 {
            hash = crypto::md5(&hash[..n]);
        }
    }
    hash[..n].to_vec()
}

/// Computes the `/U` value for a file key (algorithms 4 and 5).
pub fn compute_user_value(file_key: &[u8], file_id: &[u8], revision: i64) -> Vec<u8> {
    if revision == 2 {
        return crypto::rc4(file_key, &PASSWORD_PADDING);
    }
    let mut input = PASSWORD_PADDING.to_vec();
    input.extend_from_slice(file_id);
    let mut value = crypto::rc4(file_key, &crypto::md5(&input));
    for i in 1..=19u8 {
        value = crypto::rc4(&xor_key(file_key, i), &value);
    }
    // the last 16 bytes are arbitrary
    value.extend_from_slice(&PASSWORD_PADDING[..16]);
    value
}

/// Computes the `/O` value (algorithm 3).
pub fn compute_owner_value(owner: &[u8], user: &[u8], revision: i64, key_length: usize) -> Vec<u8> {
    let owner = if owner.is_empty() { user } else { owner };
    let key = owner_rc4_key(owner, revision, key_length);
    let mut value = crypto::rc4(&key, &pad_password(user));
    if revision >= 3 {
        for i in 1..=19u8 {
            value = crypto::rc4(&xor_key(&key, i), &value);
        }
    }
    value
}

fn owner_rc4_key(owner: &[u8], revision: i64, key_length: usize) -> Vec<u8> {
    let mut hash = crypto::md5(&pad_password(owner));
    if revision >= 3 {
        for _ in 0..50 {
            hash = crypto::md5(&hash);
        }
    }
    let n = if revision == 2 { 5 } else { key_length.min(16) };
    hash[..n].to_vec()
}

fn xor_key(key: &[u8], value: u8) -> Vec<u8> {
    key.iter().map(|b| b ^ value).collect()
}

/// Produces the per-object [`CipherTransform`] once the password has been
/// accepted.
#[derive(Debug, Clone)]
pub struct CipherTransformFactory {
    dict: EncryptDict,
    file_key: Vec<u8>,
    /// True when the owner password unlocked the document.
    owner_authenticated: bool,
}

impl CipherTransformFactory {
    /// Validates `password` against the `/Encrypt` dictionary and derives
    /// the file key.
    ///
    /// Without a password the empty user password is tried; if that fails
    /// the result is [`PDFError::PasswordRequired`]. A supplied password that
    /// matches neither the user nor the owner password gives
    /// [`PDFError::PasswordIncorrect`].
    pub fn new(encrypt: &Dict, file_id: &[u8], password: Option<&[u8]>) -> PDFResult<Self> {
        let dict = EncryptDict::from_dict(encrypt)?;
        let attempt = password.unwrap_or(b"");

        let unlocked = if dict.revision >= 5 {
            unlock_aes256(&dict, attempt)?
        } else {
            unlock_rc4_family(&dict, file_id, attempt)
        };

        match unlocked {
            Some((file_key, owner_authenticated)) => {
                debug!(
                    "Encryption V{} R{}: unlocked with {} password",
                    dict.version,
                    dict.revision,
                    if owner_authenticated { "owner" } else { "user" }
                );
                Ok(CipherTransformFactory {
                    dict,
                    file_key,
                    owner_authenticated,
                })
            }
            None if password.is_none() => Err(PDFError::PasswordRequired),
            None => Err(PDFError::PasswordIncorrect),
        }
    }

    pub fn encrypt_dict(&self) -> &EncryptDict {
        &self.dict
    }

    pub fn encrypt_metadata(&self) -> bool {
        self.dict.encrypt_metadata
    }

    pub fn owner_authenticated(&self) -> bool {
        self.owner_authenticated
    }

    pub fn file_key(&self) -> &[u8] {
        &self.file_key
    }

    /// Builds the cipher for indirect object `num generation`.
    pub fn create_cipher_transform(&self, num: u32, generation: u32) -> CipherTransform {
        CipherTransform {
            string: self.object_cipher(self.dict.string_method, num, generation),
            stream: self.object_cipher(self.dict.stream_method, num, generation),
        }
    }

    fn object_cipher(&self, method: CryptMethod, num: u32, generation: u32) -> ObjectCipher {
        match method {
            CryptMethod::Identity => ObjectCipher::Identity,
            CryptMethod::AesV3 => ObjectCipher::Aes(self.file_key.clone()),
            CryptMethod::Rc4 => ObjectCipher::Rc4(self.object_key(num, generation, false)),
            CryptMethod::AesV2 => ObjectCipher::Aes(self.object_key(num, generation, true)),
        }
    }

    /// Algorithm 1: file key extended with the object number and generation.
    fn object_key(&self, num: u32, generation: u32, aes: bool) -> Vec<u8> {
        let mut input = Vec::with_capacity(self.file_key.len() + 9);
        input.extend_from_slice(&self.file_key);
        input.extend_from_slice(&num.to_le_bytes()[..3]);
        input.extend_from_slice(&generation.to_le_bytes()[..2]);
        if aes {
            input.extend_from_slice(b"sAlT");
        }
        let hash = crypto::md5(&input);
        hash[..(self.file_key.len() + 5).min(16)].to_vec()
    }
}

/// Returns the file key and whether the owner password matched.
fn unlock_rc4_family(dict: &EncryptDict, file_id: &[u8], password: &[u8]) -> Option<(Vec<u8>, bool)> {
    if let Some(key) = check_user_password(dict, file_id, password) {
        return Some((key, false));
    }

    // The owner password decrypts /O to the user password.
    let owner_key = owner_rc4_key(password, dict.revision, dict.key_length);
    let o = &dict.o[..dict.o.len().min(32)];
    let user_password = if dict.revision == 2 {
        crypto::rc4(&owner_key, o)
    } else {
        let mut value = o.to_vec();
        for i in (0..=19u8).rev() {
            value = crypto::rc4(&xor_key(&owner_key, i), &value);
        }
        value
    };
    check_user_password(dict, file_id, &user_password).map(|key| (key, true))
}

fn check_user_password(dict: &EncryptDict, file_id: &[u8], password: &[u8]) -> Option<Vec<u8>> {
    let key = compute_file_key(
        password,
        &dict.o,
        dict.p,
        file_id,
        dict.revision,
        dict.key_length,
        dict.encrypt_metadata,
    );
    let expected = compute_user_value(&key, file_id, dict.revision);
    let compared = if dict.revision == 2 { 32 } else { 16 };
    let matches = dict.u.len() >= compared && expected[..compared] == dict.u[..compared];
    matches.then_some(key)
}

/// Revisions 5 and 6: SHA-256 based validation plus `/OE` or `/UE`
/// unwrapping.
fn unlock_aes256(dict: &EncryptDict, password: &[u8]) -> PDFResult<Option<(Vec<u8>, bool)>> {
    if dict.o.len() < 48 || dict.u.len() < 48 {
        return Err(PDFError::InvalidDocument(
            "/O and /U must be 48 bytes for AES-256 encryption".into(),
        ));
    }
    let password = &password[..password.len().min(127)];
    let hash = |salt: &[u8], user: &[u8]| -> PDFResult<Vec<u8>> {
        if dict.revision == 6 {
            crypto::hash_revision6(password, salt, user)
        } else {
            let mut input = password.to_vec();
            input.extend_from_slice(salt);
            input.extend_from_slice(user);
            Ok(crypto::sha256(&input))
        }
    };
    let u48 = &dict.u[..48];
    let zero_iv = [0u8; 16];

    if hash(&dict.o[32..40], u48)? == dict.o[..32] {
        let oe = dict
            .oe
            .as_deref()
            .ok_or_else(|| PDFError::InvalidDocument("/Encrypt without /OE".into()))?;
        let intermediate = hash(&dict.o[40..48], u48)?;
        let key = crypto::aes_cbc_decrypt(&intermediate, &zero_iv, &oe[..oe.len().min(32)])?;
        return Ok(Some((key, true)));
    }

    if hash(&dict.u[32..40], &[])? == dict.u[..32] {
        let ue = dict
            .ue
            .as_deref()
            .ok_or_else(|| PDFError::InvalidDocument("/Encrypt without /UE".into()))?;
        let intermediate = hash(&dict.u[40..48], &[])?;
        let key = crypto::aes_cbc_decrypt(&intermediate, &zero_iv, &ue[..ue.len().min(32)])?;
        return Ok(Some((key, false)));
    }

    Ok(None)
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum ObjectCipher {
    Identity,
    Rc4(Vec<u8>),
    /// AES-CBC with the IV in the first 16 bytes of the data.
    Aes(Vec<u8>),
}

impl ObjectCipher {
    fn decrypt(&self, data: &[u8]) -> Vec<u8> {
        match self {
            ObjectCipher::Identity => data.to_vec(),
            ObjectCipher::Rc4(key) => Rc4::new(key).process(data),
            ObjectCipher::Aes(key) => {
                if data.len() < 16 {
                    return Vec::new();
                }
                let (iv, body) = data.split_at(16);
                match crypto::aes_cbc_decrypt(key, iv, body) {
                    Ok(plain) => crypto::unpad_pkcs7(&plain).to_vec(),
                    Err(e) => {
                        debug!("AES decryption failed: {}", e);
                        Vec::new()
                    }
                }
            }
        }
    }
}

/// Decrypts the strings and streams of one indirect object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CipherTransform {
    string: ObjectCipher,
    stream: ObjectCipher,
}

impl CipherTransform {
    pub fn decrypt_string(&self, data: &[u8]) -> Vec<u8> {
        self.string.decrypt(data)
    }

    pub fn decrypt_stream(&self, data: &[u8]) -> Vec<u8> {
        self.stream.decrypt(data)
    }

    pub fn is_identity(&self) -> bool {
        self.string == ObjectCipher::Identity && self.stream == ObjectCipher::Identity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FILE_ID: &[u8] = b"0123456789abcdef";

    fn rc4_dict(revision: i64, user: &[u8], owner: &[u8]) -> (Dict, Vec<u8>) {
        let key_length = if revision == 2 { 5 } else { 16 };
        let o = compute_owner_value(owner, user, revision, key_length);
        let key = compute_file_key(user, &o, -4, FILE_ID, revision, key_length, true);
        let u = compute_user_value(&key, FILE_ID, revision);

        let mut dict = Dict::new();
        dict.insert("Filter".into(), PDFObject::Name("Standard".into()));
        dict.insert("V".into(), PDFObject::Number(if revision == 2 { 1.0 } else { 2.0 }));
        dict.insert("R".into(), PDFObject::Number(revision as f64));
        dict.insert("Length".into(), PDFObject::Number((key_length * 8) as f64));
        dict.insert("O".into(), PDFObject::String(o));
        dict.insert("U".into(), PDFObject::String(u));
        dict.insert("P".into(), PDFObject::Number(-4.0));
        (dict, key)
    }

    #[test]
    fn test_rc4_user_and_owner_passwords() {
        for revision in [2, 3] {
            let (dict, key) = rc4_dict(revision, b"user", b"owner");

            let factory = CipherTransformFactory::new(&dict, FILE_ID, Some(b"user")).unwrap();
            assert_eq!(factory.file_key(), key.as_slice());
            assert!(!factory.owner_authenticated());

            let factory = CipherTransformFactory::new(&dict, FILE_ID, Some(b"owner")).unwrap();
            assert_eq!(factory.file_key(), key.as_slice());
            assert!(factory.owner_authenticated());
        }
    }

    #[test]
    fn test_password_errors() {
        let (dict, _) = rc4_dict(3, b"user", b"owner");
        assert_eq!(
            CipherTransformFactory::new(&dict, FILE_ID, None).unwrap_err(),
            PDFError::PasswordRequired
        );
        assert_eq!(
            CipherTransformFactory::new(&dict, FILE_ID, Some(b"wrong")).unwrap_err(),
            PDFError::PasswordIncorrect
        );
    }

    #[test]
    fn test_empty_user_password_opens_without_password() {
        let (dict, _) = rc4_dict(3, b"", b"owner");
        assert!(CipherTransformFactory::new(&dict, FILE_ID, None).is_ok());
    }

    #[test]
    fn test_rc4_object_round_trip() {
        let (dict, _) = rc4_dict(3, b"", b"owner");
        let factory = CipherTransformFactory::new(&dict, FILE_ID, None).unwrap();
        let key = factory.object_key(12, 0, false);
        let encrypted = crypto::rc4(&key, b"Hello");

        let transform = factory.create_cipher_transform(12, 0);
        assert_eq!(transform.decrypt_string(&encrypted), b"Hello");
        assert_eq!(transform.decrypt_stream(&encrypted), b"Hello");
        // a different object gets a different key
        let other = factory.create_cipher_transform(13, 0);
        assert_ne!(other.decrypt_string(&encrypted), b"Hello");
    }

    #[test]
    fn test_aesv2_crypt_filter() {
        let (mut dict, _) = rc4_dict(3, b"", b"owner");
        let mut std_cf = Dict::new();
        std_cf.insert("CFM".into(), PDFObject::Name("AESV2".into()));
        let mut cf = Dict::new();
        cf.insert("StdCF".into(), PDFObject::Dictionary(std_cf));
        dict.insert("V".into(), PDFObject::Number(4.0));
        dict.insert("CF".into(), PDFObject::Dictionary(cf));
        dict.insert("StmF".into(), PDFObject::Name("StdCF".into()));
        dict.insert("StrF".into(), PDFObject::Name("Identity".into()));

        let parsed = EncryptDict::from_dict(&dict).unwrap();
        assert_eq!(parsed.stream_method, CryptMethod::AesV2);
        assert_eq!(parsed.string_method, CryptMethod::Identity);

        let factory = CipherTransformFactory::new(&dict, FILE_ID, None).unwrap();
        let key = factory.object_key(5, 0, true);
        let iv = [9u8; 16];
        let mut payload = iv.to_vec();
        payload.extend(crypto::aes_cbc_encrypt(&key, &iv, &crypto::pad_pkcs7(b"BT ET")).unwrap());

        let transform = factory.create_cipher_transform(5, 0);
        assert_eq!(transform.decrypt_stream(&payload), b"BT ET");
        assert_eq!(transform.decrypt_string(b"plain"), b"plain");
    }

    #[test]
    fn test_aes256_revision6() {
        let file_key = [0x42u8; 32];
        let validation_salt = *b"vsaltvsa";
        let key_salt = *b"ksaltksa";
        let password = b"secret";

        let mut u = crypto::hash_revision6(password, &validation_salt, &[]).unwrap();
        u.extend_from_slice(&validation_salt);
        u.extend_from_slice(&key_salt);
        let intermediate = crypto::hash_revision6(password, &key_salt, &[]).unwrap();
        let ue = crypto::aes_cbc_encrypt(&intermediate, &[0u8; 16], &file_key).unwrap();

        let mut dict = Dict::new();
        dict.insert("Filter".into(), PDFObject::Name("Standard".into()));
        dict.insert("V".into(), PDFObject::Number(5.0));
        dict.insert("R".into(), PDFObject::Number(6.0));
        dict.insert("O".into(), PDFObject::String(vec![0u8; 48]));
        dict.insert("U".into(), PDFObject::String(u));
        dict.insert("OE".into(), PDFObject::String(vec![0u8; 32]));
        dict.insert("UE".into(), PDFObject::String(ue));
        dict.insert("P".into(), PDFObject::Number(-4.0));

        let factory = CipherTransformFactory::new(&dict, b"", Some(password)).unwrap();
        assert_eq!(factory.file_key(), &file_key);
        assert_eq!(
            CipherTransformFactory::new(&dict, b"", Some(b"nope")).unwrap_err(),
            PDFError::PasswordIncorrect
        );
    }

    #[test]
    fn test_unsupported_handler() {
        let mut dict = Dict::new();
        dict.insert("Filter".into(), PDFObject::Name("Adobe.PubSec".into()));
        assert!(matches!(
            EncryptDict::from_dict(&dict),
            Err(PDFError::InvalidDocument(_))
        ));
    }

    #[test]
    fn test_permissions() {
        let perms = Permissions::from_p_value(0x104);
        assert!(perms.print);
        assert!(!perms.modify);
        assert!(!perms.copy);
        assert!(perms.fill_form);
    }
}
