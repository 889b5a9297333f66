//! EIP-712 signing of `UpdatePriceData`
//!
//! The price oracle contract accepts a price update from any `updater`
//! presenting a payload signed by the oracle owner, replay-protected by the
//! per-updater nonce.

use std::collections::BTreeMap;

use ethers::signers::{LocalWallet, Signer};
use ethers::types::transaction::eip712::{EIP712Domain, Eip712DomainType, TypedData, Types};
use ethers::types::{Address, Signature, U256};
use ethers::utils::to_checksum;
use serde::Serialize;
use serde_json::Value;

use crate::error::{OracleError, OracleResult};
use crate::types::TabCode;

const PRICE_ORACLE_DOMAIN: &str = "PriceOracle";
const DOMAIN_VERSION: &str = "1";
const UPDATE_PRICE_DATA: &str = "UpdatePriceData";

/// Message fields of one price update
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdatePriceData {
    pub owner: Address,
    pub updater: Address,
    pub tab: TabCode,
    pub price: U256,
    /// Milliseconds
    pub timestamp: U256,
    pub nonce: U256,
}

/// Signed payload as returned to the updater
#[derive(Debug, Clone, Serialize)]
pub struct SignedPrice {
    pub owner: String,
    pub updater: String,
    /// `bytes3` hex of the tab code
    pub tab: String,
    pub price: String,
    pub timestamp: u64,
    pub nonce: String,
    pub signature: String,
    pub v: u64,
    pub r: String,
    pub s: String,
}

fn field(name: &str, kind: &str) -> Eip712DomainType {
    Eip712DomainType {
        name: name.to_string(),
        r#type: kind.to_string(),
    }
}

pub fn update_price_typed_data(
    data: &UpdatePriceData,
    chain_id: u64,
    price_oracle: Address,
) -> TypedData {
    let domain = EIP712Domain {
        name: Some(PRICE_ORACLE_DOMAIN.to_string()),
        version: Some(DOMAIN_VERSION.to_string()),
        chain_id: Some(chain_id.into()),
        verifying_contract: Some(price_oracle),
        salt: None,
    };

    let mut types: Types = BTreeMap::new();
    types.insert(
        UPDATE_PRICE_DATA.to_string(),
        vec![
            field("owner", "address"),
            field("updater", "address"),
            field("tab", "bytes3"),
            field("price", "uint256"),
            field("timestamp", "uint256"),
            field("nonce", "uint256"),
        ],
    );

    let mut message = BTreeMap::<String, Value>::new();
    message.insert("owner".to_string(), Value::String(format!("{:#x}", data.owner)));
    message.insert(
        "updater".to_string(),
        Value::String(format!("{:#x}", data.updater)),
    );
    message.insert("tab".to_string(), Value::String(data.tab.to_hex()));
    message.insert("price".to_string(), Value::String(data.price.to_string()));
    message.insert(
        "timestamp".to_string(),
        Value::String(data.timestamp.to_string()),
    );
    message.insert("nonce".to_string(), Value::String(data.nonce.to_string()));

    TypedData {
        domain,
        types,
        primary_type: UPDATE_PRICE_DATA.to_string(),
        message,
    }
}

fn word_hex(value: U256) -> String {
    let mut buf = [0u8; 32];
    value.to_big_endian(&mut buf);
    format!("0x{}", hex::encode(buf))
}

fn signature_hex(signature: &Signature) -> String {
    let sig = signature.to_string();
    if sig.starts_with("0x") {
        sig
    } else {
        format!("0x{}", sig)
    }
}

/// Sign an update with the oracle owner's wallet
pub async fn sign_update_price(
    wallet: &LocalWallet,
    data: &UpdatePriceData,
    chain_id: u64,
    price_oracle: Address,
) -> OracleResult<SignedPrice> {
    let typed = update_price_typed_data(data, chain_id, price_oracle);
    let signature = wallet
        .sign_typed_data(&typed)
        .await
        .map_err(|e| OracleError::Signing(e.to_string()))?;

    Ok(SignedPrice {
        owner: to_checksum(&data.owner, None),
        updater: to_checksum(&data.updater, None),
        tab: data.tab.to_hex(),
        price: data.price.to_string(),
        timestamp: data.timestamp.low_u64(),
        nonce: data.nonce.to_string(),
        signature: signature_hex(&signature),
        v: signature.v,
        r: word_hex(signature.r),
        s: word_hex(signature.s),
    })
}
