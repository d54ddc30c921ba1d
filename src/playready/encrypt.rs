// SPDX-License-Identifier: GPL-2.0-or-later

use aes::Aes128;
use ctr::{
    cipher::{KeyIvInit, StreamCipher},
    Ctr128BE,
};
use isom::Fragment;
use thiserror::Error;

type Aes128Ctr = Ctr128BE<Aes128>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EncryptError {
    #[error("fragment has no sample encryption table")]
    NoSampleEncryption,

    #[error("sample encryption table has {got} entries for {want} samples")]
    SampleCountMismatch { want: usize, got: usize },

    #[error("mdat too short: sample at {offset}..{end} outside buffer of {len}")]
    MdatTooShort { offset: u64, end: u64, len: usize },
}

/// Encrypt a fragment's samples in place. `mdat_data` is the
/// full mdat box including its 8-byte header; sample bytes
/// follow it back to back in trun order.
///
/// Each sample restarts the counter at `iv << 64`. Samples
/// with subsample entries only encrypt the cipher spans, and
/// the keystream continues across the spans of one sample so
/// the output matches encrypting the concatenated spans.
pub fn encrypt_samples(
    fragment: &Fragment,
    mdat_data: &mut [u8],
    content_key: &[u8; 16],
) -> Result<(), EncryptError> {
    use EncryptError::*;

    let table = fragment.sample_encryption.as_ref().ok_or(NoSampleEncryption)?;
    if table.samples.len() != fragment.samples.len() {
        return Err(SampleCountMismatch {
            want: fragment.samples.len(),
            got: table.samples.len(),
        });
    }

    let mut sample_offset: u64 = 8;
    for (sample, enc) in fragment.samples.iter().zip(&table.samples) {
        let mut iv = [0; 16];
        iv[..8].copy_from_slice(&enc.iv.to_be_bytes());
        let mut cipher = Aes128Ctr::new(content_key.into(), &iv.into());

        if enc.subsamples.is_empty() {
            let span = span_mut(mdat_data, sample_offset, u64::from(sample.size))?;
            cipher.apply_keystream(span);
        } else {
            let mut offset = sample_offset;
            for entry in &enc.subsamples {
                offset += u64::from(entry.bytes_of_clear_data);
                let span = span_mut(mdat_data, offset, u64::from(entry.bytes_of_encrypted_data))?;
                cipher.apply_keystream(span);
                offset += u64::from(entry.bytes_of_encrypted_data);
            }
        }
        sample_offset += u64::from(sample.size);
    }
    Ok(())
}

/// CTR mode is an XOR with the keystream, so decryption is the
/// same operation.
pub fn decrypt_samples(
    fragment: &Fragment,
    mdat_data: &mut [u8],
    content_key: &[u8; 16],
) -> Result<(), EncryptError> {
    encrypt_samples(fragment, mdat_data, content_key)
}

fn span_mut(data: &mut [u8], offset: u64, size: u64) -> Result<&mut [u8], EncryptError> {
    let end = offset + size;
    let len = data.len();
    let in_bounds = usize::try_from(end).map_or(false, |end| end <= len);
    if !in_bounds {
        return Err(EncryptError::MdatTooShort { offset, end, len });
    }
    let offset = usize::try_from(offset).expect("bounded by len");
    let end = usize::try_from(end).expect("bounded by len");
    Ok(&mut data[offset..end])
}
