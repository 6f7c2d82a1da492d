//! Human-encodable payment destinations.
//!
//! String form: `<prefix>[i]1<hex(public_key || packed_args || checksum)>`.
//! The prefix is `dero` on mainnet and `deto` elsewhere; an `i` marks an
//! integrated address carrying embedded arguments. The 4-byte checksum is a
//! domain-separated BLAKE3 hash of the prefix and payload.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::args::{Arguments, ArgsError};
use crate::config::Network;

const CHECKSUM_LEN: usize = 4;
const KEY_LEN: usize = 32;

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum AddressError {
    #[error("address is missing the separator")]
    MissingSeparator,
    #[error("unknown address prefix: {0}")]
    UnknownPrefix(String),
    #[error("address payload is not hex")]
    NotHex,
    #[error("address payload too short")]
    Truncated,
    #[error("address checksum mismatch")]
    Checksum,
    #[error("plain address carries arguments")]
    UnexpectedArguments,
    #[error("address arguments: {0}")]
    Arguments(#[from] ArgsError),
}

/// A public key on a given network, optionally with embedded arguments.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Address {
    network: Network,
    key: [u8; KEY_LEN],
    arguments: Arguments,
}

impl Address {
    pub fn new(network: Network, key: [u8; KEY_LEN]) -> Self {
        Address {
            network,
            key,
            arguments: Arguments::new(),
        }
    }

    /// Integrated form of this address carrying `arguments`.
    pub fn integrated(&self, arguments: Arguments) -> Self {
        Address {
            network: self.network,
            key: self.key,
            arguments,
        }
    }

    /// The same account without embedded arguments.
    pub fn base(&self) -> Self {
        Address::new(self.network, self.key)
    }

    pub fn network(&self) -> Network {
        self.network
    }

    pub fn public_key(&self) -> [u8; KEY_LEN] {
        self.key
    }

    pub fn arguments(&self) -> &Arguments {
        &self.arguments
    }

    pub fn is_integrated(&self) -> bool {
        !self.arguments.is_empty()
    }

    pub fn is_mainnet(&self) -> bool {
        self.network.is_mainnet()
    }

    /// True if both addresses name the same account, ignoring arguments.
    pub fn same_account(&self, other: &Address) -> bool {
        self.key == other.key && self.network.is_mainnet() == other.network.is_mainnet()
    }

    /// 33-byte form used inside packed arguments.
    pub fn to_compact(&self) -> [u8; KEY_LEN + 1] {
        let mut out = [0u8; KEY_LEN + 1];
        out[0] = match self.network {
            Network::Mainnet => 0,
            Network::Testnet => 1,
            Network::Simulator => 2,
        };
        out[1..].copy_from_slice(&self.key);
        out
    }

    pub fn from_compact(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != KEY_LEN + 1 {
            return None;
        }
        let network = match bytes[0] {
            0 => Network::Mainnet,
            1 => Network::Testnet,
            2 => Network::Simulator,
            _ => return None,
        };
        let key: [u8; KEY_LEN] = bytes[1..].try_into().ok()?;
        Some(Address::new(network, key))
    }

    fn hrp(&self) -> String {
        let mut hrp = self.network.address_prefix().to_string();
        if self.is_integrated() {
            hrp.push('i');
        }
        hrp
    }

    /// Parse and require the address to belong to `network`.
    pub fn parse_for(s: &str, network: Network) -> Result<Self, AddressError> {
        let mut addr: Address = s.parse()?;
        if addr.network.is_mainnet() != network.is_mainnet() {
            return Err(AddressError::UnknownPrefix(s.chars().take(5).collect()));
        }
        addr.network = network;
        Ok(addr)
    }
}

fn checksum(hrp: &str, payload: &[u8]) -> [u8; CHECKSUM_LEN] {
    let mut input = Vec::with_capacity(hrp.len() + payload.len());
    input.extend_from_slice(hrp.as_bytes());
    input.extend_from_slice(payload);
    let digest = crate::hash_domain(b"engram.address.checksum", &input);
    let mut out = [0u8; CHECKSUM_LEN];
    out.copy_from_slice(&digest[..CHECKSUM_LEN]);
    out
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hrp = self.hrp();
        let mut payload = self.key.to_vec();
        // Arguments were validated when the integrated address was built or
        // parsed; an invalid set renders as the plain address.
        if let Ok(packed) = self.arguments.pack() {
            payload.extend_from_slice(&packed);
        }
        let sum = checksum(&hrp, &payload);
        payload.extend_from_slice(&sum);
        write!(f, "{}1{}", hrp, hex::encode(payload))
    }
}

impl FromStr for Address {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (hrp, data) = s.split_once('1').ok_or(AddressError::MissingSeparator)?;
        let (network, integrated) = match hrp {
            "dero" => (Network::Mainnet, false),
            "deroi" => (Network::Mainnet, true),
            "deto" => (Network::Testnet, false),
            "detoi" => (Network::Testnet, true),
            other => return Err(AddressError::UnknownPrefix(other.to_string())),
        };
        let raw = hex::decode(data).map_err(|_| AddressError::NotHex)?;
        if raw.len() < KEY_LEN + CHECKSUM_LEN {
            return Err(AddressError::Truncated);
        }
        let (payload, sum) = raw.split_at(raw.len() - CHECKSUM_LEN);
        if !crate::constant_time_eq(&checksum(hrp, payload), sum) {
            return Err(AddressError::Checksum);
        }
        let mut key = [0u8; KEY_LEN];
        key.copy_from_slice(&payload[..KEY_LEN]);
        let arguments = Arguments::unpack(&payload[KEY_LEN..])?;
        if !integrated && !arguments.is_empty() {
            return Err(AddressError::UnexpectedArguments);
        }
        Ok(Address {
            network,
            key,
            arguments,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::args::{self, Argument};

    fn alice() -> Address {
        Address::new(Network::Mainnet, [0xa1; 32])
    }

    #[test]
    fn plain_address_roundtrip() {
        let addr = alice();
        let s = addr.to_string();
        assert!(s.starts_with("dero1"));
        assert_eq!(s.parse::<Address>().unwrap(), addr);
    }

    #[test]
    fn testnet_prefix() {
        let addr = Address::new(Network::Testnet, [3; 32]);
        assert!(addr.to_string().starts_with("deto1"));
    }

    #[test]
    fn integrated_address_carries_arguments() {
        let integrated = alice().integrated(
            Arguments::new()
                .with(Argument::uint64(args::DESTINATION_PORT, 42))
                .with(Argument::uint64(args::VALUE_TRANSFER, 50_000))
                .with(Argument::string(args::COMMENT, "inv")),
        );
        let s = integrated.to_string();
        assert!(s.starts_with("deroi1"));
        let parsed: Address = s.parse().unwrap();
        assert!(parsed.is_integrated());
        assert_eq!(parsed.arguments().uint64(args::DESTINATION_PORT), Some(42));
        assert_eq!(parsed.arguments().uint64(args::VALUE_TRANSFER), Some(50_000));
        assert_eq!(parsed.arguments().string(args::COMMENT), Some("inv"));
        assert!(parsed.same_account(&alice()));
        assert_eq!(parsed.base(), alice());
    }

    #[test]
    fn corrupted_checksum_rejected() {
        let mut s = alice().to_string();
        let last = s.pop().unwrap();
        s.push(if last == '0' { '1' } else { '0' });
        assert_eq!(s.parse::<Address>(), Err(AddressError::Checksum));
    }

    #[test]
    fn garbage_rejected() {
        assert_eq!("nonsense".parse::<Address>(), Err(AddressError::MissingSeparator));
        assert!(matches!(
            "btc1abcd".parse::<Address>(),
            Err(AddressError::UnknownPrefix(_))
        ));
        assert_eq!("dero1zz".parse::<Address>(), Err(AddressError::NotHex));
        assert_eq!("dero1abcd".parse::<Address>(), Err(AddressError::Truncated));
    }

    #[test]
    fn parse_for_rejects_wrong_network() {
        let s = alice().to_string();
        assert!(Address::parse_for(&s, Network::Testnet).is_err());
        assert!(Address::parse_for(&s, Network::Mainnet).is_ok());
    }

    #[test]
    fn compact_roundtrip() {
        let addr = Address::new(Network::Simulator, [9; 32]);
        assert_eq!(Address::from_compact(&addr.to_compact()), Some(addr));
        assert_eq!(Address::from_compact(&[7u8; 33]), None);
    }
}
