//! Verification of signed challenge responses.

use crate::identity::ClientIdentity;
use p256::ecdsa::signature::hazmat::PrehashVerifier;
use p256::ecdsa::Signature;
use sha2::{Digest, Sha256};

const SCALAR_LEN: usize = 32;

/// Minimum length of a signature: 32-byte `r` followed by 32-byte `s`, both big-endian.
pub const SIGNATURE_LEN: usize = 2 * SCALAR_LEN;

/// What a client claims to have signed, and the signature it produced.
#[derive(Debug, Clone)]
pub struct ChallengeResponseClaim {
    pub plaintext: Vec<u8>,
    pub signature: Vec<u8>,
}

/// Check that `claim.signature` is a valid ECDSA P-256 signature by `identity`'s key over
/// `SHA-256(claim.plaintext)`.
///
/// This says nothing about freshness: callers must separately check that the plaintext is the
/// challenge they issued.
pub fn verify(identity: &ClientIdentity, claim: &ChallengeResponseClaim) -> bool {
    let Some(signature) = parse_signature(&claim.signature) else {
        return false;
    };
    let digest = Sha256::digest(&claim.plaintext);
    identity
        .verifying_key()
        .verify_prehash(&digest, &signature)
        .is_ok()
}

/// Split `r || s` into a signature. Anything past the first 32 bytes is `s`, so longer inputs are
/// accepted as long as the excess is leading zeros.
fn parse_signature(raw: &[u8]) -> Option<Signature> {
    if raw.len() < SIGNATURE_LEN {
        return None;
    }
    let (r, s) = raw.split_at(SCALAR_LEN);
    let (excess, s) = s.split_at(s.len() - SCALAR_LEN);
    if excess.iter().any(|b| *b != 0) {
        return None;
    }

    let mut rs = [0u8; SIGNATURE_LEN];
    rs[..SCALAR_LEN].copy_from_slice(r);
    rs[SCALAR_LEN..].copy_from_slice(s);
    Signature::from_slice(&rs).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::challenge;
    use p256::ecdsa::signature::Signer;
    use p256::ecdsa::{SigningKey, VerifyingKey};
    use rand::rngs::OsRng;

    fn signed_claim() -> (ClientIdentity, ChallengeResponseClaim) {
        let signing_key = SigningKey::random(&mut OsRng);
        let identity = ClientIdentity::from_verifying_key(VerifyingKey::from(&signing_key));
        let plaintext = challenge::generate().unwrap().payload().to_vec();
        let signature: Signature = signing_key.sign(&plaintext);
        let claim = ChallengeResponseClaim {
            plaintext,
            signature: signature.to_bytes().to_vec(),
        };
        (identity, claim)
    }

    #[test]
    fn accepts_valid_signature() {
        let (identity, claim) = signed_claim();
        assert!(verify(&identity, &claim));
    }

    #[test]
    fn rejects_signature_from_other_key() {
        let (_, claim) = signed_claim();
        let (other_identity, _) = signed_claim();
        assert!(!verify(&other_identity, &claim));
    }

    #[test]
    fn rejects_short_signature() {
        let (identity, mut claim) = signed_claim();
        claim.signature.truncate(SIGNATURE_LEN - 1);
        assert!(!verify(&identity, &claim));
        claim.signature.clear();
        assert!(!verify(&identity, &claim));
    }

    #[test]
    fn tolerates_zero_extended_s() {
        let (identity, mut claim) = signed_claim();
        let s = claim.signature.split_off(SCALAR_LEN);
        claim.signature.extend_from_slice(&[0, 0]);
        claim.signature.extend_from_slice(&s);
        assert!(verify(&identity, &claim));

        claim.signature[SCALAR_LEN] = 1;
        assert!(!verify(&identity, &claim));
    }

    #[test]
    fn any_plaintext_bit_flip_fails() {
        let (identity, claim) = signed_claim();
        for byte in [0, 1, 63, 64, 127] {
            for bit in 0..8 {
                let mut tampered = claim.clone();
                tampered.plaintext[byte] ^= 1 << bit;
                assert!(!verify(&identity, &tampered), "byte {byte} bit {bit}");
            }
        }
    }

    #[test]
    fn any_signature_bit_flip_fails() {
        let (identity, claim) = signed_claim();
        for byte in 0..SIGNATURE_LEN {
            for bit in 0..8 {
                let mut tampered = claim.clone();
                tampered.signature[byte] ^= 1 << bit;
                assert!(!verify(&identity, &tampered), "byte {byte} bit {bit}");
            }
        }
    }

    #[test]
    fn hashes_the_plaintext_directly() {
        // A signature over SHA-256(plaintext || SHA-256("")) must not verify.
        let signing_key = SigningKey::random(&mut OsRng);
        let identity = ClientIdentity::from_verifying_key(VerifyingKey::from(&signing_key));
        let plaintext = b"challenge".to_vec();
        let mut appended = plaintext.clone();
        appended.extend_from_slice(&Sha256::digest(b""));
        let signature: Signature = signing_key.sign(&appended);

        let claim = ChallengeResponseClaim {
            plaintext,
            signature: signature.to_bytes().to_vec(),
        };
        assert!(!verify(&identity, &claim));
    }
}
