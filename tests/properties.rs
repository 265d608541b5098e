// Property-based laws for derivation, domain separation, and rate limiting.

use std::sync::Arc;

use chrono::{Duration, TimeZone, Utc};
use p256::ecdsa::signature::hazmat::PrehashVerifier;
use p256::ecdsa::Signature;
use proptest::prelude::*;

use tee_signer::clock::ManualClock;
use tee_signer::crypto;
use tee_signer::domain::{self, DomainSeparatedRequest, Purpose};
use tee_signer::rate_limit::RateLimiter;

fn arb_seed() -> impl Strategy<Value = Vec<u8>> {
    proptest::collection::vec(any::<u8>(), 16..64)
}

fn arb_version() -> impl Strategy<Value = String> {
    "[0-9A-Za-z_-]{1,16}".prop_map(|suffix| format!("v{}", suffix))
}

fn arb_field() -> impl Strategy<Value = String> {
    "[a-z0-9-]{1,12}"
}

fn arb_purpose() -> impl Strategy<Value = Purpose> {
    prop_oneof![
        Just(Purpose::Oracle),
        Just(Purpose::Vrf),
        Just(Purpose::Automation),
        Just(Purpose::Privacy),
        Just(Purpose::Registry),
        Just(Purpose::AccountPool),
    ]
}

prop_compose! {
    fn arb_domain_request()(
        purpose in arb_purpose(),
        service_id in arb_field(),
        chain_id in arb_field(),
        request_id in arb_field(),
        payload_hash in any::<[u8; 32]>(),
        expiry_unix in 1u64..=u64::from(u32::MAX),
    ) -> DomainSeparatedRequest {
        DomainSeparatedRequest {
            purpose,
            service_id,
            chain_id,
            request_id,
            payload_hash,
            expiry_unix,
        }
    }
}

proptest! {
    #[test]
    fn prop_derivation_is_deterministic(seed in arb_seed(), version in arb_version()) {
        let first = crypto::derive_p256(&seed, &version).unwrap();
        let second = crypto::derive_p256(&seed, &version).unwrap();
        prop_assert_eq!(first.to_bytes(), second.to_bytes());
    }

    #[test]
    fn prop_distinct_versions_derive_distinct_keys(
        seed in arb_seed(),
        v1 in arb_version(),
        v2 in arb_version(),
    ) {
        prop_assume!(v1 != v2);
        let k1 = crypto::derive_p256(&seed, &v1).unwrap();
        let k2 = crypto::derive_p256(&seed, &v2).unwrap();
        prop_assert_ne!(k1.to_bytes(), k2.to_bytes());
    }

    #[test]
    fn prop_signatures_verify_under_derived_public_key(
        seed in arb_seed(),
        version in arb_version(),
        hash in any::<[u8; 32]>(),
    ) {
        let key = crypto::derive_p256(&seed, &version).unwrap();
        let signature = crypto::sign_hash_p256(&mut rand::rngs::OsRng, &key, &hash).unwrap();
        let parsed = Signature::from_slice(&signature).unwrap();
        prop_assert!(key.verifying_key().verify_prehash(&hash, &parsed).is_ok());
    }

    #[test]
    fn prop_any_field_change_separates_domains(
        a in arb_domain_request(),
        b in arb_domain_request(),
    ) {
        prop_assume!(a != b);
        let message_a = domain::signing_message(&domain::domain_hash(&a));
        let message_b = domain::signing_message(&domain::domain_hash(&b));
        prop_assert_ne!(message_a, message_b);
    }

    #[test]
    fn prop_identical_requests_sign_the_same_message(request in arb_domain_request()) {
        // expiry is the only time binding: recomputing later changes nothing
        let first = domain::signing_message(&domain::domain_hash(&request));
        let second = domain::signing_message(&domain::domain_hash(&request.clone()));
        prop_assert_eq!(first, second);
    }

    #[test]
    fn prop_rate_limit_is_bounded_within_a_second(
        rate in 1u32..=50,
        burst in 1u32..=50,
        steps in proptest::collection::vec(1u64..100, 1..40),
    ) {
        let start = Utc.timestamp_opt(1_700_000_000, 0).single().unwrap();
        let clock = Arc::new(ManualClock::new(start));
        let limiter = RateLimiter::new(f64::from(rate), burst, clock.clone());

        let mut successes = 0u32;
        let mut elapsed_ms = 0u64;
        for step_ms in steps {
            if limiter.allow("client-a") {
                successes += 1;
            }
            if elapsed_ms + step_ms > 1000 {
                break;
            }
            clock.advance(Duration::milliseconds(step_ms as i64));
            elapsed_ms += step_ms;
        }
        // drain whatever is left at the end of the window
        while limiter.allow("client-a") {
            successes += 1;
            prop_assert!(successes <= burst + rate + 1);
        }

        // within one second at most burst + rate tokens can exist
        prop_assert!(successes <= burst + rate);
    }

    #[test]
    fn prop_version_labels_from_time_are_valid(secs in 0i64..=4_102_444_800) {
        let t = Utc.timestamp_opt(secs, 0).single().unwrap();
        let label = crypto::key_version_from_time(t);
        prop_assert!(crypto::is_valid_key_version(&label));
    }
}
