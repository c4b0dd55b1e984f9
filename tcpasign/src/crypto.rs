// SPDX-FileCopyrightText: 2023-2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    ffi::OsString,
    fs::{self, File, OpenOptions},
    io::{self, Read, Write},
    path::{Path, PathBuf},
    process::{Command, ExitStatus, Stdio},
};

use pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey, LineEnding};
use rsa::{
    BigUint, RsaPrivateKey, RsaPublicKey,
    hazmat::{rsa_decrypt_and_check, rsa_encrypt},
    pkcs1::DecodeRsaPrivateKey,
    traits::PublicKeyParts,
};
use sha1::{Digest, Sha1};
use tempfile::TempDir;
use thiserror::Error;
use tracing::debug;

use crate::util::DebugString;

/// Key size used by the firmware.
pub const KEY_BITS: usize = 1024;

/// Public exponent used by the firmware.
pub const KEY_EXPONENT: u32 = 3;

#[derive(Debug, Error)]
pub enum Error {
    #[error("RSA key size ({}) not supported", .0 * 8)]
    UnsupportedKeySize(usize),
    #[error("RSA public key exponent not supported: {0}")]
    UnsupportedExponent(BigUint),
    #[error("Message length ({0}) does not match key size ({1})")]
    InvalidMessageLength(usize, usize),
    #[error("Signature length ({0}) does not match key size ({1})")]
    InvalidSignatureLength(usize, usize),
    #[error("Encrypted private keys are not supported: {0:?}")]
    EncryptedKey(PathBuf),
    #[error("Failed to run command: {0:?}")]
    CommandSpawn(DebugString, #[source] io::Error),
    #[error("Command failed with status: {1}: {0:?}")]
    CommandExecution(DebugString, ExitStatus),
    #[error("Failed to create temporary directory")]
    TempDir(#[source] io::Error),
    #[error("Failed to load RSA private key")]
    LoadKey(#[source] pkcs8::Error),
    #[error("Failed to save RSA private key")]
    SaveKey(#[source] pkcs8::Error),
    #[error("Failed to load RSA public key")]
    LoadPubKey(#[source] pkcs8::spki::Error),
    #[error("Failed to save RSA public key")]
    SavePubKey(#[source] pkcs8::spki::Error),
    #[error("Failed to generate RSA key")]
    RsaGenerate(#[source] Box<rsa::Error>),
    #[error("Failed to apply raw RSA private key operation")]
    RsaSign(#[source] Box<rsa::Error>),
    #[error("Failed to apply raw RSA public key operation")]
    RsaVerify(#[source] Box<rsa::Error>),
    #[error("Failed to read file: {0:?}")]
    ReadFile(PathBuf, #[source] io::Error),
    #[error("Failed to write file: {0:?}")]
    WriteFile(PathBuf, #[source] io::Error),
}

impl Error {
    /// Whether the public key operation ran and rejected the key or signature.
    /// Other errors mean the operation could not be attempted at all.
    pub fn is_verification_failure(&self) -> bool {
        matches!(
            self,
            Self::LoadPubKey(_)
                | Self::InvalidSignatureLength(..)
                | Self::RsaVerify(_)
                | Self::CommandExecution(..)
        )
    }
}

type Result<T> = std::result::Result<T, Error>;

/// Compute the SHA-1 digest of the specified data.
pub fn sha1(data: &[u8]) -> [u8; 20] {
    Sha1::digest(data).into()
}

/// Left-pad a big-endian integer to the key size.
fn to_padded_bytes(value: &BigUint, size: usize) -> Vec<u8> {
    let raw = value.to_bytes_be();

    let mut data = vec![0u8; size.saturating_sub(raw.len())];
    data.extend_from_slice(&raw);

    data
}

/// RSA operations needed to sign and verify the TCPA block. Both signing and
/// verification are unpadded: the input is treated as a big-endian integer and
/// the output is encoded to the key size.
pub trait CryptoProvider {
    type PrivateKey;

    /// Generate a new keypair. This may take a while.
    fn generate_keypair(&self, bits: usize, exponent: u32) -> Result<Self::PrivateKey>;

    /// Get the DER-encoded SubjectPublicKeyInfo for the key.
    fn export_public_key_der(&self, key: &Self::PrivateKey) -> Result<Vec<u8>>;

    /// Apply the private key operation to `message`.
    fn raw_sign(&self, message: &[u8], key: &Self::PrivateKey) -> Result<Vec<u8>>;

    /// Apply the public key operation to `signature` using a DER-encoded
    /// SubjectPublicKeyInfo.
    fn raw_verify(&self, signature: &[u8], public_key_der: &[u8]) -> Result<Vec<u8>>;

    fn load_private_key(&self, path: &Path) -> Result<Self::PrivateKey>;

    fn save_private_key(&self, key: &Self::PrivateKey, path: &Path) -> Result<()>;
}

/// Performs all operations in-process with the `rsa` crate.
#[derive(Clone, Copy, Debug, Default)]
pub struct RustCryptoProvider;

impl RustCryptoProvider {
    fn check_key(key: &impl PublicKeyParts) -> Result<()> {
        if key.size() != KEY_BITS / 8 {
            return Err(Error::UnsupportedKeySize(key.size()));
        } else if key.e() != &BigUint::from(KEY_EXPONENT) {
            return Err(Error::UnsupportedExponent(key.e().clone()));
        }

        Ok(())
    }
}

impl CryptoProvider for RustCryptoProvider {
    type PrivateKey = RsaPrivateKey;

    fn generate_keypair(&self, bits: usize, exponent: u32) -> Result<Self::PrivateKey> {
        let mut rng = rand::thread_rng();

        RsaPrivateKey::new_with_exp(&mut rng, bits, &BigUint::from(exponent))
            .map_err(|e| Error::RsaGenerate(Box::new(e)))
    }

    fn export_public_key_der(&self, key: &Self::PrivateKey) -> Result<Vec<u8>> {
        let der = key
            .to_public_key()
            .to_public_key_der()
            .map_err(Error::SavePubKey)?;

        Ok(der.into_vec())
    }

    fn raw_sign(&self, message: &[u8], key: &Self::PrivateKey) -> Result<Vec<u8>> {
        if message.len() != key.size() {
            return Err(Error::InvalidMessageLength(message.len(), key.size()));
        }

        let mut rng = rand::thread_rng();
        let m = BigUint::from_bytes_be(message);
        let c = rsa_decrypt_and_check(key, Some(&mut rng), &m)
            .map_err(|e| Error::RsaSign(Box::new(e)))?;

        Ok(to_padded_bytes(&c, key.size()))
    }

    fn raw_verify(&self, signature: &[u8], public_key_der: &[u8]) -> Result<Vec<u8>> {
        let key = RsaPublicKey::from_public_key_der(public_key_der).map_err(Error::LoadPubKey)?;

        if signature.len() != key.size() {
            return Err(Error::InvalidSignatureLength(signature.len(), key.size()));
        }

        let s = BigUint::from_bytes_be(signature);
        let m = rsa_encrypt(&key, &s).map_err(|e| Error::RsaVerify(Box::new(e)))?;

        Ok(to_padded_bytes(&m, key.size()))
    }

    fn load_private_key(&self, path: &Path) -> Result<Self::PrivateKey> {
        let key = read_pem_key_file(path)?;
        Self::check_key(&key)?;

        Ok(key)
    }

    fn save_private_key(&self, key: &Self::PrivateKey, path: &Path) -> Result<()> {
        write_pem_key_file(path, key)
    }
}

/// Performs all operations by running the `openssl` command line tool. Private
/// keys are PEM files inside a temporary directory owned by the provider.
pub struct OpensslProvider {
    program: PathBuf,
    work_dir: TempDir,
}

impl OpensslProvider {
    pub fn new(program: impl Into<PathBuf>) -> Result<Self> {
        let work_dir = tempfile::Builder::new()
            .prefix("tcpasign")
            .tempdir()
            .map_err(Error::TempDir)?;

        Ok(Self {
            program: program.into(),
            work_dir,
        })
    }

    fn run(&self, args: &[OsString], stdin: Option<&[u8]>) -> Result<Vec<u8>> {
        let mut command = Command::new(&self.program);
        command.args(args);
        command.stdin(if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        });
        command.stdout(Stdio::piped());
        command.stderr(Stdio::inherit());

        debug!("Running: {command:?}");

        let mut child = command
            .spawn()
            .map_err(|e| Error::CommandSpawn(DebugString::new(&command), e))?;

        // Input is a single RSA block and fits in the pipe buffer. The child
        // must be reaped even if the write fails.
        let write_result = match (stdin, child.stdin.take()) {
            (Some(data), Some(mut pipe)) => pipe.write_all(data),
            _ => Ok(()),
        };

        let output = child
            .wait_with_output()
            .map_err(|e| Error::CommandSpawn(DebugString::new(&command), e))?;

        if !output.status.success() {
            return Err(Error::CommandExecution(
                DebugString::new(&command),
                output.status,
            ));
        }

        write_result.map_err(|e| Error::WriteFile("<openssl stdin>".into(), e))?;

        Ok(output.stdout)
    }

    fn new_key_path(&self) -> PathBuf {
        let index = fs::read_dir(self.work_dir.path()).map_or(0, |d| d.count());
        self.work_dir.path().join(format!("key{index}.pem"))
    }
}

impl CryptoProvider for OpensslProvider {
    /// Path to a PEM-encoded private key.
    type PrivateKey = PathBuf;

    fn generate_keypair(&self, bits: usize, exponent: u32) -> Result<Self::PrivateKey> {
        let path = self.new_key_path();

        self.run(
            &[
                "genpkey".into(),
                "-algorithm".into(),
                "RSA".into(),
                "-pkeyopt".into(),
                format!("rsa_keygen_bits:{bits}").into(),
                "-pkeyopt".into(),
                format!("rsa_keygen_pubexp:{exponent}").into(),
                "-out".into(),
                path.clone().into(),
            ],
            None,
        )?;

        Ok(path)
    }

    fn export_public_key_der(&self, key: &Self::PrivateKey) -> Result<Vec<u8>> {
        self.run(
            &[
                "pkey".into(),
                "-in".into(),
                key.into(),
                "-pubout".into(),
                "-outform".into(),
                "DER".into(),
            ],
            None,
        )
    }

    fn raw_sign(&self, message: &[u8], key: &Self::PrivateKey) -> Result<Vec<u8>> {
        // OpenSSL 3 only accepts digests for -sign. Unpadded decryption is the
        // same private key operation.
        let signature = self.run(
            &[
                "pkeyutl".into(),
                "-decrypt".into(),
                "-inkey".into(),
                key.into(),
                "-pkeyopt".into(),
                "rsa_padding_mode:none".into(),
            ],
            Some(message),
        )?;

        if signature.len() != message.len() {
            return Err(Error::InvalidSignatureLength(signature.len(), message.len()));
        }

        Ok(signature)
    }

    fn raw_verify(&self, signature: &[u8], public_key_der: &[u8]) -> Result<Vec<u8>> {
        let key_path = self.work_dir.path().join("pub_key.der");
        fs::write(&key_path, public_key_der).map_err(|e| Error::WriteFile(key_path.clone(), e))?;

        self.run(
            &[
                "pkeyutl".into(),
                "-verifyrecover".into(),
                "-pubin".into(),
                "-keyform".into(),
                "DER".into(),
                "-inkey".into(),
                key_path.into(),
                "-pkeyopt".into(),
                "rsa_padding_mode:none".into(),
            ],
            Some(signature),
        )
    }

    fn load_private_key(&self, path: &Path) -> Result<Self::PrivateKey> {
        // Make sure openssl can actually parse it before signing anything.
        self.export_public_key_der(&path.to_owned())?;

        Ok(path.to_owned())
    }

    fn save_private_key(&self, key: &Self::PrivateKey, path: &Path) -> Result<()> {
        fs::copy(key, path).map_err(|e| Error::WriteFile(path.to_owned(), e))?;

        Ok(())
    }
}

/// Read PEM-encoded private key from a reader. Both PKCS8 and the traditional
/// PKCS1 format written by older versions of openssl are accepted.
pub fn read_pem_key(path: &Path, mut reader: impl Read) -> Result<RsaPrivateKey> {
    let mut data = String::new();
    reader
        .read_to_string(&mut data)
        .map_err(|e| Error::ReadFile(path.to_owned(), e))?;

    if data.contains("ENCRYPTED") {
        return Err(Error::EncryptedKey(path.to_owned()));
    }

    match RsaPrivateKey::from_pkcs8_pem(&data) {
        Ok(key) => Ok(key),
        Err(e) => RsaPrivateKey::from_pkcs1_pem(&data).map_err(|_| Error::LoadKey(e)),
    }
}

/// Write PEM-encoded PKCS8 private key to a writer.
pub fn write_pem_key(path: &Path, mut writer: impl Write, key: &RsaPrivateKey) -> Result<()> {
    let data = key.to_pkcs8_pem(LineEnding::LF).map_err(Error::SaveKey)?;

    writer
        .write_all(data.as_bytes())
        .map_err(|e| Error::WriteFile(path.to_owned(), e))?;

    Ok(())
}

/// Read PEM-encoded private key from a file.
pub fn read_pem_key_file(path: &Path) -> Result<RsaPrivateKey> {
    let reader = File::open(path).map_err(|e| Error::ReadFile(path.to_owned(), e))?;

    read_pem_key(path, reader)
}

/// Save PEM-encoded PKCS8 private key to a file.
pub fn write_pem_key_file(path: &Path, key: &RsaPrivateKey) -> Result<()> {
    let mut options = OpenOptions::new();
    options.write(true);
    options.create(true);
    options.truncate(true);

    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }

    let writer = options
        .open(path)
        .map_err(|e| Error::WriteFile(path.to_owned(), e))?;

    write_pem_key(path, writer, key)
}
