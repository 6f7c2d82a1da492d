//! Chat-style messages carried on destination port 1337.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;

use crate::address::Address;
use crate::args::{self, ArgValue, Argument, Arguments};
use crate::indexer::Indexer;
use crate::node_client::{NodeClient, NodeError};
use crate::transfer::{StagedTransfer, TransferBuilder, TransferError, TransferIntent};
use crate::wallet::{BackendError, Entry, PaymentQuery, WalletBackend};
use crate::{constants, Scid};

#[derive(Debug, thiserror::Error)]
pub enum MessagingError {
    #[error(transparent)]
    Node(#[from] NodeError),
    #[error(transparent)]
    Wallet(#[from] BackendError),
    #[error(transparent)]
    Transfer(#[from] TransferError),
    #[error("message is empty")]
    Empty,
}

/// Reverse name lookups (address to name).
pub trait NameDirectory: Send + Sync {
    fn name_of(&self, address: &str, height: u64) -> Option<String>;
}

impl NameDirectory for Indexer {
    fn name_of(&self, address: &str, height: u64) -> Option<String> {
        let mut names = self
            .keys_by_value(&Scid::name_service(), address, height)
            .ok()?;
        names.sort();
        names.into_iter().next()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Message {
    pub txid: String,
    pub height: u64,
    pub time: u64,
    pub incoming: bool,
    /// Base address of the other party, if known.
    pub counterparty: Option<String>,
    pub name: Option<String>,
    pub text: String,
    pub amount: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Contact {
    pub address: String,
    pub name: Option<String>,
    /// Height of the most recent message with this contact.
    pub height: u64,
}

/// Normalize an address string to its base form; unparsable strings pass
/// through unchanged.
fn canonical(address: &str) -> String {
    address
        .parse::<Address>()
        .map(|a| a.base().to_string())
        .unwrap_or_else(|_| address.to_string())
}

fn counterparty(entry: &Entry) -> Option<String> {
    if entry.incoming {
        entry.replyback().map(|a| a.base().to_string())
    } else {
        entry.destination.as_deref().map(canonical)
    }
}

/// One contact per address, named by that address's highest-height message.
/// Sorted most recent first.
pub fn contact_list(messages: &[Message]) -> Vec<Contact> {
    let mut latest: HashMap<&str, &Message> = HashMap::new();
    for m in messages {
        let Some(address) = m.counterparty.as_deref() else {
            continue;
        };
        match latest.get(address) {
            Some(prev) if prev.height > m.height => {}
            _ => {
                latest.insert(address, m);
            }
        }
    }
    let mut contacts: Vec<Contact> = latest
        .into_iter()
        .map(|(address, m)| Contact {
            address: address.to_string(),
            name: m.name.clone(),
            height: m.height,
        })
        .collect();
    contacts.sort_by(|a, b| b.height.cmp(&a.height).then_with(|| a.address.cmp(&b.address)));
    contacts
}

pub struct Messaging {
    wallet: Arc<dyn WalletBackend>,
    node: NodeClient,
    names: Option<Arc<dyn NameDirectory>>,
}

impl Messaging {
    pub fn new(
        wallet: Arc<dyn WalletBackend>,
        node: NodeClient,
        names: Option<Arc<dyn NameDirectory>>,
    ) -> Self {
        Messaging {
            wallet,
            node,
            names,
        }
    }

    /// Every message above `height_floor`, oldest first.
    pub async fn messages(&self, height_floor: u64) -> Result<Vec<Message>, MessagingError> {
        let wallet = self.wallet.clone();
        let query = PaymentQuery::all(Scid::NATIVE)
            .port(constants::MESSAGE_PORT)
            .above(height_floor);
        let mut entries = tokio::task::spawn_blocking(move || wallet.payments(&query))
            .await
            .map_err(|e| BackendError::Other(e.to_string()))??;
        entries.sort_by_key(|e| (e.height, e.time));

        let strict = self.node.runtime().snapshot().strict_messages;
        let mut out = Vec::with_capacity(entries.len());
        for entry in entries {
            let counterparty = counterparty(&entry);
            if strict && entry.incoming && !self.sender_in_ring(&entry, counterparty.as_deref()).await {
                tracing::debug!(txid = %entry.txid_hex(), "Dropping message with unverified sender");
                continue;
            }
            let name = match (&counterparty, &self.names) {
                (Some(address), Some(names)) => names.name_of(address, entry.height),
                _ => None,
            };
            out.push(Message {
                txid: entry.txid_hex(),
                height: entry.height,
                time: entry.time,
                incoming: entry.incoming,
                counterparty,
                name,
                text: entry.comment().unwrap_or_default().to_string(),
                amount: entry.amount,
            });
        }
        Ok(out)
    }

    /// The declared sender must be a ring member of the transaction.
    async fn sender_in_ring(&self, entry: &Entry, sender: Option<&str>) -> bool {
        let Some(sender) = sender else {
            return false;
        };
        match self.node.get_transaction(&entry.txid_hex()).await {
            Ok(info) => info.ring_contains(sender),
            Err(e) => {
                tracing::warn!(error = %e, txid = %entry.txid_hex(), "Ring lookup failed");
                false
            }
        }
    }

    pub async fn contacts(&self, height_floor: u64) -> Result<Vec<Contact>, MessagingError> {
        Ok(contact_list(&self.messages(height_floor).await?))
    }

    /// Messages exchanged with `counterparty`, given as a name or an address.
    pub async fn conversation(
        &self,
        counterparty: &str,
        height_floor: u64,
    ) -> Result<Vec<Message>, MessagingError> {
        let target = self.resolve(counterparty).await?;
        Ok(self
            .messages(height_floor)
            .await?
            .into_iter()
            .filter(|m| m.counterparty.as_deref() == Some(target.as_str()))
            .collect())
    }

    async fn resolve(&self, who: &str) -> Result<String, MessagingError> {
        match who.parse::<Address>() {
            Ok(address) => Ok(address.base().to_string()),
            Err(_) => {
                let address = self.node.name_to_address(who.trim(), -1).await?;
                Ok(canonical(&address))
            }
        }
    }

    /// Stage a message to `to` (name or address). Dispatch with the builder.
    pub async fn send(
        &self,
        builder: &TransferBuilder,
        to: &str,
        text: &str,
        amount: Option<u64>,
    ) -> Result<StagedTransfer, MessagingError> {
        if text.trim().is_empty() {
            return Err(MessagingError::Empty);
        }
        let recipient: Address = self
            .resolve(to)
            .await?
            .parse()
            .map_err(|e: crate::address::AddressError| TransferError::InvalidAddress(e.to_string()))?;
        let amount = amount.unwrap_or(constants::MESSAGE_DEFAULT_AMOUNT);
        let integrated = recipient.integrated(message_arguments(text, amount, crate::unix_now()));
        Ok(builder.stage(TransferIntent::new(integrated.to_string(), amount))?)
    }
}

/// Arguments of an outgoing message. The builder swaps the replyback
/// request for the sender's address.
pub fn message_arguments(text: &str, amount: u64, now: u64) -> Arguments {
    Arguments::new()
        .with(Argument::uint64(args::DESTINATION_PORT, constants::MESSAGE_PORT))
        .with(Argument::uint64(args::VALUE_TRANSFER, amount))
        .with(Argument::new(
            args::EXPIRY,
            ArgValue::Time(now + constants::MESSAGE_EXPIRY_SECS),
        ))
        .with(Argument::string(args::COMMENT, text))
        .with(Argument::uint64(args::NEEDS_REPLYBACK_ADDRESS, 1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Network;
    use crate::events::EventSink;
    use crate::settings::RuntimeConfig;
    use crate::wallet::mock::{entry, MockWallet};

    struct Directory(HashMap<String, String>);

    impl NameDirectory for Directory {
        fn name_of(&self, address: &str, _height: u64) -> Option<String> {
            self.0.get(address).cloned()
        }
    }

    fn msg(height: u64, counterparty: &str, name: Option<&str>) -> Message {
        Message {
            txid: height.to_string(),
            height,
            time: height,
            incoming: true,
            counterparty: Some(counterparty.to_string()),
            name: name.map(str::to_string),
            text: String::new(),
            amount: 2,
        }
    }

    #[test]
    fn contacts_keep_latest_binding() {
        let messages = vec![
            msg(5, "a", Some("old")),
            msg(9, "b", None),
            msg(12, "a", Some("new")),
            msg(7, "a", Some("middle")),
        ];
        let contacts = contact_list(&messages);
        assert_eq!(contacts.len(), 2);
        assert_eq!(contacts[0].address, "a");
        assert_eq!(contacts[0].name.as_deref(), Some("new"));
        assert_eq!(contacts[0].height, 12);
        assert_eq!(contacts[1].address, "b");
    }

    #[test]
    fn message_arguments_shape() {
        let a = message_arguments("hello", 2, 1_000);
        assert_eq!(a.uint64(args::DESTINATION_PORT), Some(1337));
        assert_eq!(a.uint64(args::VALUE_TRANSFER), Some(2));
        assert_eq!(a.time(args::EXPIRY), Some(4_600));
        assert_eq!(a.string(args::COMMENT), Some("hello"));
        assert!(a.contains(args::NEEDS_REPLYBACK_ADDRESS));
    }

    fn runtime() -> RuntimeConfig {
        let runtime = RuntimeConfig::default();
        runtime.update(|s| s.network = Network::Testnet);
        runtime
    }

    fn incoming_from(height: u64, sender: &Address, text: &str) -> Entry {
        entry(
            height,
            true,
            Arguments::new()
                .with(Argument::uint64(args::DESTINATION_PORT, 1337))
                .with(Argument::string(args::COMMENT, text))
                .with(Argument::new(args::REPLYBACK_ADDRESS, ArgValue::Address(sender.clone()))),
        )
    }

    #[tokio::test]
    async fn inbox_resolves_names_and_filters_port() {
        let wallet = Arc::new(MockWallet::new(Network::Testnet, 1));
        let alice = Address::new(Network::Testnet, [0xa1; 32]);
        let bob = Address::new(Network::Testnet, [0xb0; 32]);
        wallet.push_entry(incoming_from(10, &alice, "hi"));
        wallet.push_entry(incoming_from(20, &bob, "yo"));
        wallet.push_entry(incoming_from(30, &alice, "again"));
        wallet.push_entry(entry(
            40,
            true,
            Arguments::new().with(Argument::uint64(args::DESTINATION_PORT, 7)),
        ));
        let mut outgoing = entry(
            50,
            false,
            Arguments::new()
                .with(Argument::uint64(args::DESTINATION_PORT, 1337))
                .with(Argument::string(args::COMMENT, "reply")),
        );
        outgoing.destination = Some(alice.to_string());
        wallet.push_entry(outgoing);

        let directory: Arc<dyn NameDirectory> = Arc::new(Directory(HashMap::from([(
            alice.to_string(),
            "alice1".to_string(),
        )])));
        let messaging = Messaging::new(wallet, NodeClient::new(runtime()), Some(directory));

        let all = messaging.messages(0).await.unwrap();
        assert_eq!(all.len(), 4);
        assert_eq!(all[0].text, "hi");
        assert_eq!(all[0].name.as_deref(), Some("alice1"));
        assert!(!all[3].incoming);

        let recent = messaging.messages(20).await.unwrap();
        assert_eq!(recent.len(), 2);

        let contacts = messaging.contacts(0).await.unwrap();
        assert_eq!(contacts.len(), 2);
        assert_eq!(contacts[0].address, alice.to_string());
        assert_eq!(contacts[0].height, 50);

        let thread = messaging.conversation(&alice.to_string(), 0).await.unwrap();
        let texts: Vec<&str> = thread.iter().map(|m| m.text.as_str()).collect();
        assert_eq!(texts, vec!["hi", "again", "reply"]);
    }

    #[tokio::test]
    async fn strict_mode_drops_unverifiable_senders() {
        let wallet = Arc::new(MockWallet::new(Network::Testnet, 1));
        let alice = Address::new(Network::Testnet, [0xa1; 32]);
        wallet.push_entry(incoming_from(10, &alice, "hi"));
        let runtime = runtime();
        runtime.update(|s| {
            s.strict_messages = true;
            s.offline = true;
        });
        let messaging = Messaging::new(wallet, NodeClient::new(runtime), None);
        assert!(messaging.messages(0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn send_stages_message_with_replyback() {
        let wallet = Arc::new(MockWallet::new(Network::Testnet, 1));
        wallet.fund(Scid::NATIVE, 1_000);
        let builder = TransferBuilder::new(wallet.clone(), Network::Testnet, EventSink::detached());
        let messaging = Messaging::new(wallet.clone(), NodeClient::new(runtime()), None);
        let bob = Address::new(Network::Testnet, [0xb0; 32]);

        let staged = messaging.send(&builder, &bob.to_string(), "ping", None).await.unwrap();
        assert_eq!(staged.amount(), constants::MESSAGE_DEFAULT_AMOUNT);
        assert_eq!(staged.port(), Some(1337));
        assert_eq!(staged.comment(), Some("ping"));
        assert_eq!(
            staged.transfer.payload.address(args::REPLYBACK_ADDRESS),
            Some(&wallet.address)
        );
        assert_eq!(staged.transfer.destination, bob.to_string());
        assert!(matches!(
            messaging.send(&builder, &bob.to_string(), "  ", None).await,
            Err(MessagingError::Empty)
        ));
    }
}
