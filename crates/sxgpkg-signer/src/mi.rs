//! `mi-sha256-03` Merkle Integrity content encoding.
//!
//! The payload is split into fixed-size records. Each record is followed by
//! the proof of the next one, so a client can verify the stream
//! incrementally against a single digest.

use sha2::{Digest, Sha256};

use crate::error::ExchangeError;

/// Record size used for every exchange we produce.
pub const RECORD_SIZE: usize = 4096;

/// Name of the encoding, as used in headers.
pub const ENCODING: &str = "mi-sha256-03";

const PROOF_LEN: usize = 32;

/// An encoded payload and its top-level proof.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MiEncoded {
    pub body: Vec<u8>,
    pub digest: [u8; 32],
}

impl MiEncoded {
    /// Value of the `digest` header.
    pub fn digest_header(&self) -> String {
        use base64::Engine;
        format!(
            "{}={}",
            ENCODING,
            base64::engine::general_purpose::STANDARD.encode(self.digest)
        )
    }
}

fn proof(record: &[u8], next: Option<&[u8; 32]>) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(record);
    match next {
        Some(next) => {
            hasher.update(next);
            hasher.update([1u8]);
        }
        None => hasher.update([0u8]),
    }
    hasher.finalize().into()
}

/// Encodes `payload` with the given record size.
pub fn encode(payload: &[u8], record_size: usize) -> MiEncoded {
    let mut body = Vec::with_capacity(8 + payload.len() + payload.len() / record_size.max(1) * PROOF_LEN);
    body.extend_from_slice(&(record_size as u64).to_be_bytes());

    if payload.is_empty() {
        return MiEncoded {
            body,
            digest: Sha256::digest([0u8]).into(),
        };
    }

    let records: Vec<&[u8]> = payload.chunks(record_size).collect();
    let mut proofs = vec![[0u8; 32]; records.len()];
    for i in (0..records.len()).rev() {
        let next = proofs.get(i + 1).copied();
        proofs[i] = proof(records[i], next.as_ref());
    }

    for (i, record) in records.iter().enumerate() {
        body.extend_from_slice(record);
        if let Some(next) = proofs.get(i + 1) {
            body.extend_from_slice(next);
        }
    }
    MiEncoded {
        body,
        digest: proofs[0],
    }
}

/// Decodes an encoded body, verifying every record against `digest`.
pub fn decode(encoded: &[u8], digest: &[u8; 32]) -> Result<Vec<u8>, ExchangeError> {
    let size_bytes: [u8; 8] = encoded
        .get(..8)
        .and_then(|b| b.try_into().ok())
        .ok_or(ExchangeError::Truncated("mi record size"))?;
    let record_size = usize::try_from(u64::from_be_bytes(size_bytes))
        .map_err(|_| ExchangeError::Integrity("record size overflows".to_string()))?;
    if record_size == 0 {
        return Err(ExchangeError::Integrity("record size is zero".to_string()));
    }

    let mut rest = &encoded[8..];
    if rest.is_empty() {
        let empty: [u8; 32] = Sha256::digest([0u8]).into();
        return if &empty == digest {
            Ok(Vec::new())
        } else {
            Err(ExchangeError::Integrity("empty payload digest mismatch".to_string()))
        };
    }

    let mut expected = *digest;
    let mut out = Vec::with_capacity(rest.len());
    let mut index = 0usize;
    while rest.len() > record_size {
        if rest.len() < record_size + PROOF_LEN {
            return Err(ExchangeError::Truncated("mi proof"));
        }
        let (record, tail) = rest.split_at(record_size);
        let (next, tail) = tail.split_at(PROOF_LEN);
        let mut next_proof = [0u8; 32];
        next_proof.copy_from_slice(next);
        if proof(record, Some(&next_proof)) != expected {
            return Err(ExchangeError::Integrity(format!("record {} does not match", index)));
        }
        out.extend_from_slice(record);
        expected = next_proof;
        rest = tail;
        index += 1;
    }
    if proof(rest, None) != expected {
        return Err(ExchangeError::Integrity(format!("record {} does not match", index)));
    }
    out.extend_from_slice(rest);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_payload() {
        let encoded = encode(b"", RECORD_SIZE);
        assert_eq!(encoded.body, 4096u64.to_be_bytes().to_vec());
        let expected: [u8; 32] = Sha256::digest([0u8]).into();
        assert_eq!(encoded.digest, expected);
        assert_eq!(decode(&encoded.body, &encoded.digest).unwrap(), b"");
    }

    #[test]
    fn single_record() {
        let encoded = encode(b"hello", RECORD_SIZE);
        assert_eq!(&encoded.body[8..], b"hello");
        let expected: [u8; 32] = Sha256::digest(b"hello\x00").into();
        assert_eq!(encoded.digest, expected);
    }

    #[test]
    fn multi_record_layout_and_proofs() {
        // Three records of size 4: "abcd", "efgh", "ij".
        let encoded = encode(b"abcdefghij", 4);
        let p2: [u8; 32] = Sha256::digest(b"ij\x00").into();
        let mut h = Sha256::new();
        h.update(b"efgh");
        h.update(p2);
        h.update([1u8]);
        let p1: [u8; 32] = h.finalize().into();
        let mut h = Sha256::new();
        h.update(b"abcd");
        h.update(p1);
        h.update([1u8]);
        let p0: [u8; 32] = h.finalize().into();

        let mut expected = 4u64.to_be_bytes().to_vec();
        expected.extend_from_slice(b"abcd");
        expected.extend_from_slice(&p1);
        expected.extend_from_slice(b"efgh");
        expected.extend_from_slice(&p2);
        expected.extend_from_slice(b"ij");
        assert_eq!(encoded.body, expected);
        assert_eq!(encoded.digest, p0);
        assert_eq!(decode(&encoded.body, &encoded.digest).unwrap(), b"abcdefghij");
    }

    #[test]
    fn exact_multiple_of_record_size() {
        let payload = vec![7u8; 8192];
        let encoded = encode(&payload, RECORD_SIZE);
        assert_eq!(encoded.body.len(), 8 + 8192 + 32);
        assert_eq!(decode(&encoded.body, &encoded.digest).unwrap(), payload);
    }

    #[test]
    fn tampering_is_detected() {
        let mut encoded = encode(b"abcdefghij", 4);
        let last = encoded.body.len() - 1;
        encoded.body[last] ^= 0xff;
        assert!(matches!(
            decode(&encoded.body, &encoded.digest),
            Err(ExchangeError::Integrity(_))
        ));
    }

    #[test]
    fn digest_header_format() {
        let encoded = encode(b"", RECORD_SIZE);
        assert_eq!(
            encoded.digest_header(),
            "mi-sha256-03=bjQLnP+zepicpUTmu3gKLHiQHT+zNzh2hRGjBhevoB0="
        );
    }
}
