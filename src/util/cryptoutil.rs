//! AES-128-CCM primitives backing the `Session` capability's encrypt/decrypt.
//! Key derivation, certificates and PEM handling lived here in the teacher's
//! original crypto stack; none of that survives, since key agreement is an
//! out-of-scope external collaborator here.

use aes::cipher::crypto_common;
use anyhow::Result;

type Aes128Ccm = ccm::Ccm<aes::Aes128, ccm::consts::U16, ccm::consts::U13>;

pub fn aes128_ccm_encrypt(
    key: &crypto_common::Key<Aes128Ccm>,
    nonce: &[u8],
    aad: &[u8],
    msg: &[u8],
) -> Result<Vec<u8>> {
    let cipher = <Aes128Ccm as ccm::KeyInit>::new(key);
    ccm::aead::Aead::encrypt(
        &cipher,
        crypto_common::generic_array::GenericArray::from_slice(nonce),
        ccm::aead::Payload { msg, aad },
    )
    .map_err(|e| anyhow::anyhow!("encrypt error {:?}", e))
}

pub fn aes128_ccm_decrypt(
    key: &crypto_common::Key<Aes128Ccm>,
    nonce: &[u8],
    aad: &[u8],
    msg: &[u8],
) -> Result<Vec<u8>> {
    let cipher = <Aes128Ccm as ccm::KeyInit>::new(key);
    ccm::aead::Aead::decrypt(
        &cipher,
        crypto_common::generic_array::GenericArray::from_slice(nonce),
        ccm::aead::Payload { msg, aad },
    )
    .map_err(|e| anyhow::anyhow!("decrypt error {:?}", e))
}
