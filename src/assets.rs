//! Per-asset operations: transfers, contract invocation and installation.

use crate::args::{Argument, Arguments};
use crate::dvm::{self, DvmError, Function, ParamType};
use crate::names::fee_address;
use crate::node_client::{NodeClient, NodeError, ScQuery};
use crate::transfer::{ContractCall, StagedTransfer, TransferBuilder, TransferError, TransferIntent};
use crate::wallet::{Transaction, Transfer};
use crate::Scid;

#[derive(Debug, thiserror::Error)]
pub enum AssetError {
    #[error(transparent)]
    Transfer(#[from] TransferError),
    #[error(transparent)]
    Node(#[from] NodeError),
    #[error(transparent)]
    Dvm(#[from] DvmError),
    #[error("contract {0} has no code")]
    NoCode(Scid),
    #[error("contract code has no Initialize or InitializePrivate function")]
    NoInitializer,
    #[error("{0} is not an exported function")]
    UnknownFunction(String),
    #[error("missing value for parameter {0}")]
    MissingParam(String),
    #[error("invalid value for parameter {name}: {value:?}")]
    InvalidParam { name: String, value: String },
    #[error("{0} does not accept a burn")]
    UnexpectedBurn(String),
}

/// User input for one invocation.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Invocation {
    pub function: String,
    /// Parameter values as typed by the user, by parameter name.
    pub values: Vec<(String, String)>,
    /// Native amount burned into the contract (`DEROVALUE`).
    pub dero_burn: u64,
    /// Asset amount burned into the contract (`ASSETVALUE`).
    pub asset_burn: u64,
}

impl Invocation {
    pub fn new(function: impl Into<String>) -> Self {
        Invocation {
            function: function.into(),
            ..Default::default()
        }
    }

    pub fn value(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.values.push((name.into(), value.into()));
        self
    }

    fn lookup(&self, name: &str) -> Option<&str> {
        self.values
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }
}

/// Bind user input to `function` and assemble the call.
pub fn build_call(
    scid: Scid,
    function: &Function,
    input: &Invocation,
    fee_destination: &str,
) -> Result<ContractCall, AssetError> {
    let mut params = Arguments::new();
    for p in &function.params {
        let raw = input
            .lookup(&p.name)
            .ok_or_else(|| AssetError::MissingParam(p.name.clone()))?;
        let arg = match p.ty {
            ParamType::String => Argument::string(p.name.clone(), raw),
            ParamType::Uint64 => {
                let v = raw.trim().parse().map_err(|_| AssetError::InvalidParam {
                    name: p.name.clone(),
                    value: raw.to_string(),
                })?;
                Argument::uint64(p.name.clone(), v)
            }
        };
        params.set(arg);
    }
    if input.dero_burn > 0 && !function.uses_dero_value {
        return Err(AssetError::UnexpectedBurn(function.name.clone()));
    }
    if input.asset_burn > 0 && !function.uses_asset_value {
        return Err(AssetError::UnexpectedBurn(function.name.clone()));
    }

    let mut call = ContractCall::new(scid, function.name.clone());
    call.params = params;
    let carrier = |asset: Scid, burn: u64| Transfer {
        scid: asset,
        destination: fee_destination.to_string(),
        amount: 0,
        burn,
        payload: Arguments::new(),
    };
    if input.dero_burn > 0 || input.asset_burn == 0 {
        call = call.transfer(carrier(Scid::NATIVE, input.dero_burn));
    }
    if input.asset_burn > 0 {
        call = call.transfer(carrier(scid, input.asset_burn));
    }
    Ok(call)
}

pub struct AssetOps {
    node: NodeClient,
}

impl AssetOps {
    pub fn new(node: NodeClient) -> Self {
        AssetOps { node }
    }

    /// Stage a plain asset transfer at the account's ring size.
    pub fn transfer(
        &self,
        builder: &TransferBuilder,
        scid: Scid,
        destination: &str,
        amount: u64,
        ring_size: u64,
    ) -> Result<StagedTransfer, AssetError> {
        let intent = TransferIntent::new(destination, amount)
            .asset(scid)
            .ring_size(ring_size);
        Ok(builder.stage(intent)?)
    }

    /// Exported functions of the contract, read from the daemon.
    pub async fn functions(&self, scid: &Scid) -> Result<Vec<Function>, AssetError> {
        let state = self.node.get_sc(scid, &ScQuery::code_only()).await?;
        if state.code.trim().is_empty() {
            return Err(AssetError::NoCode(*scid));
        }
        Ok(dvm::exported_functions(&state.code)?)
    }

    pub async fn invoke(
        &self,
        builder: &TransferBuilder,
        scid: Scid,
        input: &Invocation,
    ) -> Result<Transaction, AssetError> {
        let function = self
            .functions(&scid)
            .await?
            .into_iter()
            .find(|f| f.name == input.function)
            .ok_or_else(|| AssetError::UnknownFunction(input.function.clone()))?;
        let fee = fee_address(self.node.runtime().network()).to_string();
        let call = build_call(scid, &function, input, &fee)?;
        let tx = builder.invoke(&self.node, &call).await?;
        tracing::info!(scid = %scid, function = %function.name, txid = %tx.txid_hex(), "Asset function invoked");
        Ok(tx)
    }

    /// Check the code parses and has an initializer, then install it.
    /// Returns the installing txid, which is also the new SCID.
    pub async fn install(&self, code: &str) -> Result<String, AssetError> {
        let functions = dvm::parse(code)?;
        if !functions
            .iter()
            .any(|f| f.name == dvm::INITIALIZE || f.name == dvm::INITIALIZE_PRIVATE)
        {
            return Err(AssetError::NoInitializer);
        }
        Ok(self.node.install_sc(code).await?)
    }
}
