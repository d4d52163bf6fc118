// Copyright (c) Kanari Network
// SPDX-License-Identifier: Apache-2.0

use std::collections::BTreeMap;

use bytes::Bytes;
use more_asserts::assert_le;
use proptest::prelude::*;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::prover::BatchAVLProver;
use super::storage::{InMemoryVersionedStore, PersistentBatchAVLProver, VersionedAVLStore};
use super::test_helper::*;
use super::verifier::BatchAVLVerifier;
use super::{hash, proof};
use crate::operation::{KeyValue, Modification, ModificationError, counter_to_value, value_to_counter};
use crate::{ADKey, ADValue, DEFAULT_KEY_LENGTH, DEFAULT_VALUE_LENGTH};

#[test]
fn test_empty_batch_verifies() {
    let mut prover = new_prover();
    let digest = prover.digest();
    assert_eq!(digest.len(), hash::DIGEST_LENGTH);
    assert_eq!(digest[hash::LABEL_LENGTH], 0);
    let proof = prover.generate_proof();
    replay_and_check(&digest, &proof, &[], Some(0), Some(0), &digest);
    prover.check_tree(true).unwrap();
}

#[test]
fn test_insert_then_verify() {
    let mut prover = new_prover();
    let starting = prover.digest();
    let modification = Modification::Insert(KeyValue {
        key: key_from_byte(0x01),
        value: Bytes::copy_from_slice(&[0, 1, 2, 3, 4, 5, 6, 7]),
    });
    prover.perform_one_modification(&modification).unwrap();
    prover.check_tree(false).unwrap();
    let ending = prover.digest();
    assert_ne!(starting, ending);
    assert_eq!(ending[hash::LABEL_LENGTH], 1);

    let proof = prover.generate_proof();
    prover.check_tree(true).unwrap();
    replay_and_check(&starting, &proof, &[modification], Some(1), Some(0), &ending);

    // flipping the low bit of the final proof byte must not verify
    let mut corrupted = proof.to_vec();
    *corrupted.last_mut().unwrap() ^= 0x01;
    let corrupted = Bytes::from(corrupted);
    assert!(
        BatchAVLVerifier::new(
            &starting,
            &corrupted,
            DEFAULT_KEY_LENGTH,
            DEFAULT_VALUE_LENGTH,
            Some(1),
            Some(0),
        )
        .is_err()
    );
}

#[test]
fn test_lookups() {
    let mut prover = new_prover();
    let mut rng = StdRng::seed_from_u64(11);
    let kv = random_kv(&mut rng);
    prover
        .perform_one_modification(&Modification::Insert(kv.clone()))
        .unwrap();
    assert_eq!(
        prover.unauthenticated_lookup(&kv.key),
        Some(kv.value.clone())
    );
    assert_eq!(prover.unauthenticated_lookup(&random_key(&mut rng)), None);
    let found = prover
        .perform_one_modification(&Modification::Lookup(kv.key.clone()))
        .unwrap();
    assert_eq!(found, Some(kv.value));
}

#[test]
fn test_failures_leave_the_tree_alone() {
    let mut prover = new_prover();
    let mut rng = StdRng::seed_from_u64(7);
    let starting = prover.digest();
    let kv = random_kv(&mut rng);
    prover
        .perform_one_modification(&Modification::Insert(kv.clone()))
        .unwrap();
    let digest = prover.digest();

    let err = prover
        .perform_one_modification(&Modification::Insert(kv.clone()))
        .unwrap_err();
    assert_eq!(
        err.downcast_ref::<ModificationError>(),
        Some(&ModificationError::DuplicateKey)
    );
    assert_eq!(prover.digest(), digest);

    let missing = random_kv(&mut rng);
    let err = prover
        .perform_one_modification(&Modification::Update(missing.clone()))
        .unwrap_err();
    assert_eq!(
        err.downcast_ref::<ModificationError>(),
        Some(&ModificationError::MissingKey)
    );
    let err = prover
        .perform_one_modification(&Modification::Remove(missing.key.clone()))
        .unwrap_err();
    assert_eq!(
        err.downcast_ref::<ModificationError>(),
        Some(&ModificationError::MissingKey)
    );
    assert_eq!(prover.digest(), digest);

    // absent key: silent success, digest untouched, still part of the batch
    let silent = Modification::RemoveIfExists(missing.key.clone());
    assert_eq!(prover.perform_one_modification(&silent).unwrap(), None);
    assert_eq!(prover.digest(), digest);

    let err = prover
        .perform_one_modification(&Modification::Insert(KeyValue {
            key: Bytes::from(vec![0u8; DEFAULT_KEY_LENGTH]),
            value: random_value(&mut rng),
        }))
        .unwrap_err();
    assert_eq!(
        err.downcast_ref::<ModificationError>(),
        Some(&ModificationError::ReservedKey)
    );
    let err = prover
        .perform_one_modification(&Modification::Insert(KeyValue {
            key: Bytes::from(vec![1u8; 16]),
            value: random_value(&mut rng),
        }))
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<ModificationError>(),
        Some(&ModificationError::KeyLength { .. })
    ));
    let err = prover
        .perform_one_modification(&Modification::Insert(KeyValue {
            key: random_key(&mut rng),
            value: Bytes::from(vec![0u8; 3]),
        }))
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<ModificationError>(),
        Some(&ModificationError::ValueLength { .. })
    ));
    assert_eq!(prover.digest(), digest);

    // the failed calls left no trace in the proof stream
    let proof = prover.generate_proof();
    replay_and_check(
        &starting,
        &proof,
        &[Modification::Insert(kv), silent],
        Some(1),
        Some(0),
        &digest,
    );
}

#[test]
fn test_counter_updates() {
    let mut prover = new_prover();
    let starting = prover.digest();
    let key = key_from_byte(0x21);
    let mut applied = vec![
        Modification::Insert(KeyValue {
            key: key.clone(),
            value: counter_to_value(5),
        }),
        Modification::UpdateLongBy {
            key: key.clone(),
            delta: 3,
        },
    ];
    for modification in &applied {
        prover.perform_one_modification(modification).unwrap();
    }
    let value = prover.unauthenticated_lookup(&key).unwrap();
    assert_eq!(value_to_counter(&value).unwrap(), 8);

    // negative deltas are fine on live counters
    let step = Modification::UpdateLongBy {
        key: key.clone(),
        delta: -10,
    };
    prover.perform_one_modification(&step).unwrap();
    applied.push(step);
    let value = prover.unauthenticated_lookup(&key).unwrap();
    assert_eq!(value_to_counter(&value).unwrap(), -2);

    // seeding an absent counter with a negative delta is not
    let err = prover
        .perform_one_modification(&Modification::UpdateLongBy {
            key: key_from_byte(0x22),
            delta: -1,
        })
        .unwrap_err();
    assert_eq!(
        err.downcast_ref::<ModificationError>(),
        Some(&ModificationError::NegativeDelta)
    );

    // overflow fails and leaves the value alone
    let seeded = Modification::UpdateLongBy {
        key: key_from_byte(0x23),
        delta: i64::MAX,
    };
    prover.perform_one_modification(&seeded).unwrap();
    applied.push(seeded);
    let digest = prover.digest();
    let err = prover
        .perform_one_modification(&Modification::UpdateLongBy {
            key: key_from_byte(0x23),
            delta: 1,
        })
        .unwrap_err();
    assert_eq!(
        err.downcast_ref::<ModificationError>(),
        Some(&ModificationError::ArithmeticOverflow)
    );
    assert_eq!(prover.digest(), digest);

    let ending = prover.digest();
    let proof = prover.generate_proof();
    replay_and_check(&starting, &proof, &applied, None, None, &ending);
}

#[test]
fn test_removals_keep_the_chain() {
    let mut prover = new_prover();
    let starting = prover.digest();
    let mut applied: Vec<Modification> = (1..=8)
        .map(|i| {
            Modification::Insert(KeyValue {
                key: key_from_byte(i),
                value: value_from_u64(i as u64),
            })
        })
        .collect();
    for modification in &applied {
        prover.perform_one_modification(modification).unwrap();
        prover.check_tree(false).unwrap();
    }
    for removal in [
        Modification::Remove(key_from_byte(3)),
        Modification::Remove(key_from_byte(1)),
        Modification::Remove(key_from_byte(8)),
        Modification::RemoveIfExists(key_from_byte(5)),
    ] {
        prover.perform_one_modification(&removal).unwrap();
        prover.check_tree(false).unwrap();
        applied.push(removal);
    }
    for gone in [3u8, 1, 8, 5] {
        assert_eq!(prover.unauthenticated_lookup(&key_from_byte(gone)), None);
    }
    for alive in [2u8, 4, 6, 7] {
        assert_eq!(
            prover.unauthenticated_lookup(&key_from_byte(alive)),
            Some(value_from_u64(alive as u64))
        );
    }
    let ending = prover.digest();
    let proof = prover.generate_proof();
    prover.check_tree(true).unwrap();
    replay_and_check(&starting, &proof, &applied, Some(8), Some(4), &ending);
}

#[test]
fn test_over_envelope_yields_none() {
    let mut prover = new_prover();
    let starting = prover.digest();
    let mut rng = StdRng::seed_from_u64(3);
    let modifications: Vec<Modification> = (0..50)
        .map(|_| Modification::Insert(random_kv(&mut rng)))
        .collect();
    for modification in &modifications {
        prover.perform_one_modification(modification).unwrap();
    }
    let proof = prover.generate_proof();

    let digest = match BatchAVLVerifier::new(
        &starting,
        &proof,
        DEFAULT_KEY_LENGTH,
        DEFAULT_VALUE_LENGTH,
        Some(2),
        Some(0),
    ) {
        Ok(mut verifier) => {
            for modification in &modifications {
                if verifier.perform_one_modification(modification).is_err() {
                    break;
                }
            }
            verifier.digest()
        }
        Err(_) => None,
    };
    assert_eq!(digest, None);
}

#[test]
fn test_wrong_starting_digest_rejected() {
    let mut prover = new_prover();
    let mut rng = StdRng::seed_from_u64(4);
    for _ in 0..10 {
        prover
            .perform_one_modification(&Modification::Insert(random_kv(&mut rng)))
            .unwrap();
    }
    let proof = prover.generate_proof();
    let mut fake = vec![0u8; hash::DIGEST_LENGTH];
    rng.fill(&mut fake[..]);
    assert!(
        BatchAVLVerifier::new(
            &Bytes::from(fake),
            &proof,
            DEFAULT_KEY_LENGTH,
            DEFAULT_VALUE_LENGTH,
            Some(10),
            Some(0),
        )
        .is_err()
    );
}

#[test]
fn test_proof_size_fits_the_envelope() {
    let mut prover = new_prover();
    let mut rng = StdRng::seed_from_u64(5);
    let mut keys = Vec::new();
    for _ in 0..200 {
        let kv = random_kv(&mut rng);
        keys.push(kv.key.clone());
        prover
            .perform_one_modification(&Modification::Insert(kv))
            .unwrap();
    }
    prover.generate_proof();

    let starting = prover.digest();
    let height = starting[hash::LABEL_LENGTH] as usize;
    let applied = vec![
        Modification::Insert(random_kv(&mut rng)),
        Modification::Insert(random_kv(&mut rng)),
        Modification::Insert(random_kv(&mut rng)),
        Modification::Remove(keys[17].clone()),
        Modification::Remove(keys[91].clone()),
    ];
    for modification in &applied {
        prover.perform_one_modification(modification).unwrap();
    }
    let ending = prover.digest();
    let proof = prover.generate_proof();
    assert_le!(
        proof.len(),
        proof::length_bound(height, 3, 2, DEFAULT_KEY_LENGTH, DEFAULT_VALUE_LENGTH)
    );
    replay_and_check(&starting, &proof, &applied, Some(3), Some(2), &ending);
}

#[test]
fn test_same_batch_same_labels() {
    let mut rng = StdRng::seed_from_u64(6);
    let modifications: Vec<Modification> = (0..64)
        .map(|i| {
            let kv = random_kv(&mut rng);
            if i % 5 == 4 {
                Modification::InsertOrUpdate(kv)
            } else {
                Modification::Insert(kv)
            }
        })
        .collect();
    let mut first = new_prover();
    let mut second = new_prover();
    for modification in &modifications {
        first.perform_one_modification(modification).unwrap();
        second.perform_one_modification(modification).unwrap();
        assert_eq!(first.digest(), second.digest());
    }
    assert_eq!(first.generate_proof(), second.generate_proof());
}

#[test]
fn test_sequential_inserts_stay_balanced() {
    let mut prover = new_prover();
    for seed in 1..=100u64 {
        prover
            .perform_one_modification(&Modification::Insert(KeyValue {
                key: key_from_u64(seed),
                value: value_from_u64(seed),
            }))
            .unwrap();
    }
    prover.check_tree(false).unwrap();
    assert_le!(prover.height(), 10);
}

fn existing_key(rng: &mut StdRng, model: &BTreeMap<ADKey, ADValue>) -> Option<ADKey> {
    if model.is_empty() {
        return None;
    }
    let n = rng.gen_range(0..model.len());
    model.keys().nth(n).cloned()
}

fn run_soak(seed: u64, batches: usize, batch_size: usize) {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut prover = new_prover();
    let mut model: BTreeMap<ADKey, ADValue> = BTreeMap::new();
    let mut seen_keys: Vec<ADKey> = Vec::new();

    for _ in 0..batches {
        let starting = prover.digest();
        let mut applied = Vec::new();
        let mut inserts = 0usize;
        let mut deletes = 0usize;
        for _ in 0..batch_size {
            let modification = match rng.gen_range(0..10) {
                0..=3 => {
                    let kv = random_kv(&mut rng);
                    seen_keys.push(kv.key.clone());
                    Modification::Insert(kv)
                }
                4 => match existing_key(&mut rng, &model) {
                    // roughly a tenth of the batch is meant to fail
                    Some(key) => Modification::Insert(KeyValue {
                        key,
                        value: random_value(&mut rng),
                    }),
                    None => Modification::Update(random_kv(&mut rng)),
                },
                5 => match existing_key(&mut rng, &model) {
                    Some(key) => Modification::Update(KeyValue {
                        key,
                        value: random_value(&mut rng),
                    }),
                    None => Modification::Update(random_kv(&mut rng)),
                },
                6 => {
                    let kv = random_kv(&mut rng);
                    seen_keys.push(kv.key.clone());
                    Modification::InsertOrUpdate(kv)
                }
                7 => match existing_key(&mut rng, &model) {
                    Some(key) => Modification::Remove(key),
                    None => Modification::Remove(random_key(&mut rng)),
                },
                8 => match existing_key(&mut rng, &model) {
                    Some(key) => Modification::RemoveIfExists(key),
                    None => Modification::RemoveIfExists(random_key(&mut rng)),
                },
                _ => match existing_key(&mut rng, &model) {
                    Some(key) => Modification::Lookup(key),
                    None => Modification::Lookup(random_key(&mut rng)),
                },
            };
            match prover.perform_one_modification(&modification) {
                Ok(found) => {
                    assert_eq!(found.as_ref(), model.get(modification.key()));
                    match &modification {
                        Modification::Insert(kv) => {
                            inserts += 1;
                            model.insert(kv.key.clone(), kv.value.clone());
                        }
                        Modification::InsertOrUpdate(kv) => {
                            if found.is_none() {
                                inserts += 1;
                            }
                            model.insert(kv.key.clone(), kv.value.clone());
                        }
                        Modification::Update(kv) => {
                            model.insert(kv.key.clone(), kv.value.clone());
                        }
                        Modification::Remove(key) => {
                            deletes += 1;
                            model.remove(key);
                        }
                        Modification::RemoveIfExists(key) => {
                            if found.is_some() {
                                deletes += 1;
                            }
                            model.remove(key);
                        }
                        _ => {}
                    }
                    applied.push(modification);
                }
                Err(err) => {
                    // every planned failure is a per-key error, never a
                    // structural one
                    assert!(err.downcast_ref::<ModificationError>().is_some());
                }
            }
        }
        prover.check_tree(false).unwrap();
        let ending = prover.digest();
        let proof = prover.generate_proof();
        prover.check_tree(true).unwrap();
        replay_and_check(
            &starting,
            &proof,
            &applied,
            Some(inserts),
            Some(deletes),
            &ending,
        );
    }

    for (key, value) in &model {
        assert_eq!(prover.unauthenticated_lookup(key), Some(value.clone()));
    }
    for key in &seen_keys {
        if !model.contains_key(key) {
            assert_eq!(prover.unauthenticated_lookup(key), None);
        }
    }
}

#[test]
fn test_bulk_soak() {
    run_soak(0x5eed, 10, 500);
}

#[test]
fn test_rollback_and_reopen() {
    let store = InMemoryVersionedStore::new();
    let mut persistent = PersistentBatchAVLProver::new(
        BatchAVLProver::new(DEFAULT_KEY_LENGTH, DEFAULT_VALUE_LENGTH),
        store.clone(),
    )
    .unwrap();
    let mut rng = StdRng::seed_from_u64(42);

    let kv1 = random_kv(&mut rng);
    persistent
        .perform_one_modification(&Modification::Insert(kv1.clone()))
        .unwrap();
    persistent.generate_proof().unwrap();
    let committed = persistent.digest();
    assert_eq!(store.version(), Some(committed.clone()));

    // an abandoned batch disappears on rollback
    let kv2 = random_kv(&mut rng);
    persistent
        .perform_one_modification(&Modification::Insert(kv2.clone()))
        .unwrap();
    assert_ne!(persistent.digest(), committed);
    persistent.rollback(&committed).unwrap();
    assert_eq!(persistent.digest(), committed);
    assert_eq!(persistent.prover().unauthenticated_lookup(&kv2.key), None);
    assert_eq!(
        persistent.prover().unauthenticated_lookup(&kv1.key),
        Some(kv1.value.clone())
    );

    // a fresh prover over the same store resumes at the committed version
    let reopened = PersistentBatchAVLProver::new(
        BatchAVLProver::new(DEFAULT_KEY_LENGTH, DEFAULT_VALUE_LENGTH),
        store.clone(),
    )
    .unwrap();
    assert_eq!(reopened.digest(), committed);
}

#[test]
fn test_rollback_is_idempotent_across_versions() {
    let store = InMemoryVersionedStore::new();
    let mut persistent = PersistentBatchAVLProver::new(
        BatchAVLProver::new(DEFAULT_KEY_LENGTH, DEFAULT_VALUE_LENGTH),
        store,
    )
    .unwrap();
    let mut rng = StdRng::seed_from_u64(43);

    let mut versions = Vec::new();
    for _ in 0..4 {
        for _ in 0..5 {
            persistent
                .perform_one_modification(&Modification::Insert(random_kv(&mut rng)))
                .unwrap();
        }
        persistent.generate_proof().unwrap();
        versions.push(persistent.digest());
    }
    for version in versions.iter().rev() {
        persistent.rollback(version).unwrap();
        assert_eq!(persistent.digest(), *version);
        persistent.rollback(version).unwrap();
        assert_eq!(persistent.digest(), *version);
        persistent.prover().check_tree(false).unwrap();
    }
    // rolling forward again also works: every version stays durable
    persistent.rollback(&versions[3]).unwrap();
    assert_eq!(persistent.digest(), versions[3]);

    let unknown = Bytes::from(vec![0x7fu8; hash::DIGEST_LENGTH]);
    assert!(persistent.rollback(&unknown).is_err());
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn prover_and_verifier_agree(seed in any::<u64>()) {
        run_soak(seed, 2, 60);
    }

    #[test]
    fn inserted_batches_replay(kvs in proptest::collection::vec(any::<KeyValue>(), 1..24)) {
        let mut prover = new_prover();
        let starting = prover.digest();
        let mut seen = std::collections::BTreeSet::new();
        let mut applied = Vec::new();
        for kv in kvs {
            // duplicate generated keys would be rejected as inserts
            if !seen.insert(kv.key.clone()) {
                continue;
            }
            let modification = Modification::Insert(kv);
            prover.perform_one_modification(&modification).unwrap();
            applied.push(modification);
        }
        prover.check_tree(false).unwrap();
        let inserts = applied.len();
        let ending = prover.digest();
        let proof = prover.generate_proof();
        replay_and_check(&starting, &proof, &applied, Some(inserts), Some(0), &ending);
    }
}
