//! Property-based tests for digest and signature handling

use proptest::prelude::*;
use switchfw_crypto::prelude::*;

fn arb_hash_type() -> impl Strategy<Value = SignatureType> {
    prop_oneof![
        Just(SignatureType::Md5),
        Just(SignatureType::Sha256),
        Just(SignatureType::Sha512),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    #[test]
    fn prop_split_point_does_not_change_digest(
        kind in arb_hash_type(),
        data in proptest::collection::vec(any::<u8>(), 0..512),
        split in 0usize..512,
    ) {
        let split = split.min(data.len());
        let (head, tail) = data.split_at(split);
        let whole = digest_fragments(kind, &[data.as_slice()]);
        let parts = digest_fragments(kind, &[head, tail]);
        prop_assert!(whole.is_ok());
        prop_assert_eq!(whole.ok(), parts.ok());
    }

    #[test]
    fn prop_unknown_raw_types_rejected(raw in 4u32..) {
        prop_assert!(SignatureType::from_raw(raw).is_none());
    }

    #[test]
    fn prop_signature_len_check(kind in arb_hash_type(), len in 0usize..128) {
        let expected = kind.signature_len().unwrap_or(0);
        prop_assert_eq!(kind.check_signature_len(len).is_ok(), len == expected);
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn prop_sign_verify(
        seed in any::<[u8; 32]>(),
        data in proptest::collection::vec(any::<u8>(), 0..256),
        sha512 in any::<bool>(),
    ) {
        let kind = if sha512 { SignatureType::Sha512 } else { SignatureType::Sha256 };
        let keypair = KeyPair::from_bytes(&seed, "prop")
            .map_err(|e| TestCaseError::fail(e.to_string()))?;
        let digest = digest_fragments(kind, &[data.as_slice()])
            .map_err(|e| TestCaseError::fail(e.to_string()))?;
        let signature = DigestSigner::sign(&digest, &keypair);
        prop_assert!(DigestVerifier::verify(&digest, signature.as_bytes(), &keypair.public_key).is_ok());
    }
}
