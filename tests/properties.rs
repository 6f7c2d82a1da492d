//! Property tests for the invariants the wallet core relies on.
//!
//! Properties verified:
//! - **Ring size**: accepted sizes are powers of two in range, large sizes clamp
//! - **Staging**: every staged transfer has a legal ring size, moves value,
//!   and fits the comment and payload limits; integrated addresses override
//!   the intent
//! - **Datashards**: committed versions stay readable through snapshots;
//!   encrypted values read back through the cipher only
//! - **Contacts**: one entry per counterparty, carrying its latest message
//! - **Money**: formatting is exact and parses back
//! - **Registration target**: leading zero bytes decide a winner

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use proptest::prelude::*;

use engram::address::Address;
use engram::args::{self, Argument, Arguments};
use engram::config::Network;
use engram::constants;
use engram::datashard::{Datashard, DatashardError, ValueCipher};
use engram::events::EventSink;
use engram::messaging::{contact_list, Message};
use engram::registrar::meets_target;
use engram::transfer::{select_ring_size, TransferBuilder, TransferError, TransferIntent};
use engram::wallet::{
    BackendError, Balance, Entry, PaymentQuery, Transaction, Transfer, WalletBackend,
};
use engram::{format_money, parse_money, Scid};

// ── Helpers ─────────────────────────────────────────────────────────────

/// Keyed XOR with a one-byte tag so a wrong key is detected.
struct Keyed(u8);

impl ValueCipher for Keyed {
    fn seal(&self, plaintext: &[u8]) -> Vec<u8> {
        let mut out = vec![self.0];
        out.extend(plaintext.iter().map(|b| b ^ self.0));
        out
    }

    fn unseal(&self, sealed: &[u8]) -> Option<Vec<u8>> {
        let (tag, body) = sealed.split_first()?;
        (*tag == self.0).then(|| body.iter().map(|b| b ^ self.0).collect())
    }
}

/// Funded wallet that never sends; staging only reads the balance.
struct Funded(Address);

impl WalletBackend for Funded {
    fn address(&self) -> Address {
        self.0.clone()
    }
    fn is_registered(&self) -> bool {
        true
    }
    fn wallet_height(&self) -> u64 {
        1
    }
    fn wallet_topoheight(&self) -> u64 {
        1
    }
    fn daemon_height(&self) -> Result<u64, BackendError> {
        Ok(1)
    }
    fn balance(&self, _scid: &Scid) -> Result<Balance, BackendError> {
        Ok(Balance {
            mature: u64::MAX / 2,
            locked: 0,
        })
    }
    fn payments(&self, _query: &PaymentQuery) -> Result<Vec<Entry>, BackendError> {
        Ok(Vec::new())
    }
    fn build_transaction(
        &self,
        _transfers: &[Transfer],
        _ring_size: u64,
        _sc_args: &Arguments,
        _gas_storage: u64,
    ) -> Result<Transaction, BackendError> {
        Err(BackendError::Unreachable("staging only".into()))
    }
    fn send(&self, _tx: &Transaction) -> Result<(), BackendError> {
        Err(BackendError::Unreachable("staging only".into()))
    }
    fn registration_candidate(&self) -> Result<Transaction, BackendError> {
        Err(BackendError::Unreachable("staging only".into()))
    }
    fn set_scan_window(&self, _blocks: u64) {}
    fn close(&self) {}
}

/// Arguments embedded in an integrated destination.
#[derive(Clone, Debug)]
struct Embedded {
    port: Option<u64>,
    value: Option<u64>,
    comment: Option<String>,
}

impl Embedded {
    fn arguments(&self) -> Arguments {
        let mut out = Arguments::new();
        if let Some(port) = self.port {
            out.set(Argument::uint64(args::DESTINATION_PORT, port));
        }
        if let Some(value) = self.value {
            out.set(Argument::uint64(args::VALUE_TRANSFER, value));
        }
        if let Some(comment) = &self.comment {
            out.set(Argument::string(args::COMMENT, comment.clone()));
        }
        out
    }
}

fn amount() -> impl Strategy<Value = u64> {
    prop_oneof![Just(0u64), 1u64..1_000_000_000]
}

fn intents() -> impl Strategy<Value = (TransferIntent, Option<Embedded>)> {
    let intent = (
        amount(),
        prop_oneof![Just(0u64), 1u64..1_000],
        prop::option::of("[a-z ]{0,200}"),
        prop::option::of(any::<u64>()),
        prop::option::of(0u64..300),
    )
        .prop_map(|(amount, burn, comment, port, ring_size)| TransferIntent {
            amount,
            burn,
            comment,
            port,
            ring_size,
            ..Default::default()
        });
    let embedded = prop::option::of(
        (
            prop::option::of(any::<u64>()),
            prop::option::of(amount()),
            prop::option::of("[a-z]{0,160}"),
        )
            .prop_map(|(port, value, comment)| Embedded {
                port,
                value,
                comment,
            }),
    );
    (intent, embedded)
}

fn entries() -> impl Strategy<Value = BTreeMap<String, Vec<u8>>> {
    prop::collection::btree_map("[a-z]{1,12}", prop::collection::vec(any::<u8>(), 0..64), 1..12)
}

fn message(counterparty: usize, height: u64) -> Message {
    Message {
        txid: format!("{:064x}", height),
        height,
        time: height * 18,
        incoming: height % 2 == 0,
        counterparty: Some(format!("party{}", counterparty)),
        name: Some(format!("name-{}-{}", counterparty, height)),
        text: "gm".into(),
        amount: constants::MESSAGE_DEFAULT_AMOUNT,
    }
}

// ── Ring size ───────────────────────────────────────────────────────────

proptest! {
    #[test]
    fn ring_size_policy(requested in 1u64..10_000) {
        match select_ring_size(Some(requested)) {
            Ok(size) if requested > constants::MAX_RING_SIZE => {
                prop_assert_eq!(size, constants::MAX_RING_SIZE);
            }
            Ok(size) => {
                prop_assert_eq!(size, requested);
                prop_assert!(size.is_power_of_two());
                prop_assert!(size >= constants::MIN_RING_SIZE);
            }
            Err(_) => {
                prop_assert!(requested < constants::MIN_RING_SIZE || !requested.is_power_of_two());
            }
        }
    }
}

// ── Staging ─────────────────────────────────────────────────────────────

proptest! {
    #![proptest_config(ProptestConfig::with_cases(512))]

    #[test]
    fn staged_transfers_respect_limits((intent, embedded) in intents()) {
        let mut intent = intent;
        let sender = Address::new(Network::Testnet, [3; 32]);
        let receiver = Address::new(Network::Testnet, [4; 32]);
        let builder = TransferBuilder::new(
            Arc::new(Funded(sender.clone())),
            Network::Testnet,
            EventSink::detached(),
        );
        let embedded_args = embedded.as_ref().map(Embedded::arguments).unwrap_or_default();
        let integrated = !embedded_args.is_empty();
        intent.destination = receiver.integrated(embedded_args.clone()).to_string();

        let (amount, comment) = if integrated {
            (
                embedded_args.uint64(args::VALUE_TRANSFER).unwrap_or(intent.amount),
                embedded_args
                    .string(args::COMMENT)
                    .map(str::to_owned)
                    .or_else(|| intent.comment.clone()),
            )
        } else {
            (intent.amount, intent.comment.clone())
        };
        let comment_len = comment.as_ref().map_or(0, |c| c.len());
        let requested_ring = intent.ring_size;
        let burn = intent.burn;

        match builder.stage(intent) {
            Ok(staged) => {
                prop_assert!(staged.ring_size.is_power_of_two());
                prop_assert!(staged.ring_size >= constants::MIN_RING_SIZE);
                prop_assert!(staged.ring_size <= constants::MAX_RING_SIZE);
                prop_assert!(staged.amount() > 0 || staged.transfer.burn > 0);
                prop_assert_eq!(staged.amount(), amount);
                prop_assert_eq!(staged.transfer.burn, burn);
                prop_assert!(staged.comment().map_or(0, str::len) <= constants::COMMENT_LIMIT);
                prop_assert!(staged.transfer.payload.check_size(constants::PAYLOAD0_LIMIT).is_ok());
                prop_assert_eq!(&staged.transfer.destination, &receiver.to_string());
                if integrated {
                    prop_assert!(staged.port().is_some());
                    prop_assert_eq!(staged.comment(), comment.as_deref());
                }
                prop_assert_eq!(builder.batch().len(), 1);
            }
            Err(TransferError::InvalidRingSize(r)) => {
                prop_assert_eq!(Some(r), requested_ring);
                prop_assert!(r < constants::MIN_RING_SIZE || !r.is_power_of_two());
            }
            Err(TransferError::MissingPort) => {
                prop_assert!(integrated);
                prop_assert!(!embedded_args.contains(args::DESTINATION_PORT));
            }
            Err(TransferError::CommentTooLong(len)) => {
                prop_assert_eq!(len, comment_len);
                prop_assert!(len > constants::COMMENT_LIMIT);
            }
            Err(TransferError::ZeroAmount) => {
                prop_assert_eq!(amount, 0);
                prop_assert_eq!(burn, 0);
            }
            Err(TransferError::PayloadTooLarge { size, limit }) => {
                prop_assert_eq!(limit, constants::PAYLOAD0_LIMIT);
                prop_assert!(size > limit);
            }
            Err(other) => prop_assert!(false, "unexpected staging error: {}", other),
        }
    }
}

// ── Datashards ──────────────────────────────────────────────────────────

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn snapshots_keep_committed_versions(first in entries(), second in entries()) {
        let shard = Datashard::open_temporary(None).unwrap();
        for (k, v) in &first {
            shard.put("pads", k, v).unwrap();
        }
        let v1 = shard.commit("pads").unwrap();
        for (k, v) in &second {
            shard.put("pads", k, v).unwrap();
        }
        let v2 = shard.commit("pads").unwrap();
        prop_assert_eq!(v2, v1 + 1);

        let old = shard.snapshot("pads", v1).unwrap();
        for (k, v) in &first {
            let got = old.get(k).unwrap();
            prop_assert_eq!(got.as_deref(), Some(v.as_slice()));
        }
        for (k, v) in &second {
            let got = shard.get("pads", k).unwrap();
            prop_assert_eq!(got.as_deref(), Some(v.as_slice()));
        }
        let mut merged = first.clone();
        merged.extend(second.clone());
        prop_assert_eq!(shard.entries("pads").unwrap(), merged);
    }

    #[test]
    fn encrypted_values_need_the_key(values in entries(), key in 1u8..=255) {
        let shard = Datashard::open_temporary(Some(Arc::new(Keyed(key)))).unwrap();
        for (k, v) in &values {
            shard.put_encrypted("settings", k, v).unwrap();
        }
        shard.commit("settings").unwrap();
        for (k, v) in &values {
            let got = shard.get_encrypted("settings", k).unwrap();
            prop_assert_eq!(got.as_deref(), Some(v.as_slice()));
            let raw = shard.get("settings", k).unwrap().unwrap();
            prop_assert!(Keyed(key.wrapping_add(1)).unseal(&raw).is_none());
        }

        let plain = Datashard::open_temporary(None).unwrap();
        let (k, v) = values.iter().next().unwrap();
        prop_assert!(matches!(
            plain.put_encrypted("settings", k, v),
            Err(DatashardError::NoActiveAccount)
        ));
    }
}

// ── Contacts ────────────────────────────────────────────────────────────

proptest! {
    #[test]
    fn contacts_are_unique_and_latest(
        pairs in prop::collection::vec((0usize..6, 1u64..10_000), 0..40)
    ) {
        let mut seen_heights = HashSet::new();
        let messages: Vec<Message> = pairs
            .into_iter()
            .filter(|(_, h)| seen_heights.insert(*h))
            .map(|(c, h)| message(c, h))
            .collect();
        let contacts = contact_list(&messages);

        let addresses: HashSet<&str> = contacts.iter().map(|c| c.address.as_str()).collect();
        prop_assert_eq!(addresses.len(), contacts.len());
        let expected: HashSet<&str> = messages
            .iter()
            .filter_map(|m| m.counterparty.as_deref())
            .collect();
        prop_assert_eq!(&addresses, &expected);

        for contact in &contacts {
            let latest = messages
                .iter()
                .filter(|m| m.counterparty.as_deref() == Some(contact.address.as_str()))
                .max_by_key(|m| m.height)
                .unwrap();
            prop_assert_eq!(contact.height, latest.height);
            prop_assert_eq!(&contact.name, &latest.name);
        }
        prop_assert!(contacts.windows(2).all(|w| w[0].height >= w[1].height));
    }
}

// ── Money and registration ──────────────────────────────────────────────

proptest! {
    #[test]
    fn money_formats_exactly(atomic in any::<u64>()) {
        let text = format_money(atomic);
        let (_, frac) = text.split_once('.').unwrap();
        prop_assert_eq!(frac.len(), constants::MONEY_DECIMALS);
        prop_assert_eq!(parse_money(&text), Some(atomic));
    }

    #[test]
    fn registration_target(txid in any::<[u8; 32]>()) {
        let zeros = txid.iter().take_while(|b| **b == 0).count();
        prop_assert_eq!(meets_target(&txid), zeros >= constants::REGISTRATION_ZERO_BYTES);
    }
}
