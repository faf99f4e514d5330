/// Transaction, envelope and receipt types
use crate::error::{LedgerError, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Numeric transaction type as carried on the wire and in the `transactions.type` column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "i64")]
pub enum TransactionType {
    AddWallet,
    CreateToken,
    ContractCall,
    TwoWayTransfer,
    OneWayTransfer,
    TrustScoreUpdate,
}

impl TransactionType {
    pub fn code(self) -> i64 {
        match self {
            TransactionType::AddWallet => 1,
            TransactionType::CreateToken => 2,
            TransactionType::ContractCall => 3,
            TransactionType::TwoWayTransfer => 4,
            TransactionType::OneWayTransfer => 5,
            TransactionType::TrustScoreUpdate => 6,
        }
    }

    pub fn from_code(code: i64) -> Result<Self> {
        match code {
            1 => Ok(TransactionType::AddWallet),
            2 => Ok(TransactionType::CreateToken),
            3 => Ok(TransactionType::ContractCall),
            4 => Ok(TransactionType::TwoWayTransfer),
            5 => Ok(TransactionType::OneWayTransfer),
            6 => Ok(TransactionType::TrustScoreUpdate),
            other => Err(LedgerError::InvalidTransaction(format!(
                "Unknown transaction type {}",
                other
            ))),
        }
    }
}

impl TryFrom<i64> for TransactionType {
    type Error = LedgerError;

    fn try_from(code: i64) -> Result<Self> {
        TransactionType::from_code(code)
    }
}

impl From<TransactionType> for i64 {
    fn from(kind: TransactionType) -> i64 {
        kind.code()
    }
}

impl fmt::Display for TransactionType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// An immutable ledger transaction. Never mutated once finalized.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    #[serde(alias = "trans_code")]
    pub transaction_code: String,
    /// Target block index. Required on the wire: receipts are filed under it.
    pub block_index: u64,
    pub timestamp: String,
    #[serde(rename = "type")]
    pub kind: TransactionType,
    #[serde(default)]
    pub currency: String,
    #[serde(default)]
    pub fee: f64,
    #[serde(alias = "descr", default)]
    pub description: String,
    #[serde(default = "default_valid")]
    pub valid: i64,
    /// Type-tagged payload; see [`SpecificData`].
    pub specific_data: Value,
}

fn default_valid() -> i64 {
    1
}

impl Transaction {
    pub fn specific(&self) -> Result<SpecificData> {
        SpecificData::parse(self.kind, &self.specific_data)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionSignature {
    pub wallet_address: String,
    pub msgsign: String,
}

/// The body exchanged between peers on `/validate-transaction`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignedTransaction {
    pub transaction: Transaction,
    #[serde(default)]
    pub signatures: Vec<TransactionSignature>,
}

/// One peer's submission of a transaction toward a target block.
///
/// Deduplication identity is `public_key` within a target block index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Receipt {
    pub public_key: String,
    pub data: ReceiptData,
    /// Signature or any other provenance field a signer attached.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReceiptData {
    pub block_index: u64,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl Receipt {
    pub fn for_transaction(public_key: impl Into<String>, tx: &Transaction) -> Result<Self> {
        let mut fields = match serde_json::to_value(tx)? {
            Value::Object(map) => map,
            _ => {
                return Err(LedgerError::InvalidTransaction(
                    "Transaction did not serialize to an object".to_string(),
                ))
            }
        };
        fields.remove("block_index");

        Ok(Receipt {
            public_key: public_key.into(),
            data: ReceiptData {
                block_index: tx.block_index,
                fields,
            },
            extra: Map::new(),
        })
    }

    pub fn block_index(&self) -> u64 {
        self.data.block_index
    }

    /// Rebuilds the transaction carried in the payload.
    pub fn transaction(&self) -> Result<Transaction> {
        let mut map = self.data.fields.clone();
        map.insert("block_index".to_string(), Value::from(self.data.block_index));
        Ok(serde_json::from_value(Value::Object(map))?)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WalletPayload {
    pub wallet_address: String,
    #[serde(default)]
    pub wallet_public: Option<String>,
    #[serde(default)]
    pub custodian_wallet: Option<String>,
    #[serde(default)]
    pub kyc_docs: Value,
    #[serde(default, alias = "ownertype")]
    pub owner_type: Option<i64>,
    #[serde(default)]
    pub jurisdiction: Option<i64>,
    #[serde(default)]
    pub specific_data: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenPayload {
    pub tokencode: String,
    #[serde(default)]
    pub tokenname: Option<String>,
    #[serde(default)]
    pub tokentype: Option<i64>,
    #[serde(default)]
    pub first_owner: Option<String>,
    #[serde(default)]
    pub custodian: Option<String>,
    #[serde(default)]
    pub legaldochash: Option<String>,
    #[serde(default)]
    pub amount_created: f64,
    #[serde(default)]
    pub value_created: Option<f64>,
    #[serde(default)]
    pub sc_flag: bool,
    #[serde(default)]
    pub disallowed: Value,
    #[serde(default)]
    pub tokendecimal: Option<i64>,
    #[serde(default, alias = "tokenattributes")]
    pub token_attributes: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferPayload {
    pub asset1_code: String,
    #[serde(default)]
    pub asset2_code: Option<String>,
    pub wallet1: String,
    pub wallet2: String,
    pub asset1_number: f64,
    #[serde(default)]
    pub asset2_number: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContractCallPayload {
    pub address: String,
    pub function: String,
    #[serde(default)]
    pub signers: Vec<String>,
    #[serde(default)]
    pub params: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrustScorePayload {
    pub address1: String,
    pub address2: String,
    pub new_score: f64,
}

/// `specific_data` interpreted according to the transaction type.
#[derive(Debug, Clone, PartialEq)]
pub enum SpecificData {
    AddWallet(WalletPayload),
    CreateToken(TokenPayload),
    ContractCall(ContractCallPayload),
    Transfer { two_way: bool, payload: TransferPayload },
    TrustScore(TrustScorePayload),
}

impl SpecificData {
    pub fn parse(kind: TransactionType, value: &Value) -> Result<Self> {
        let invalid = |e: serde_json::Error| {
            LedgerError::InvalidTransaction(format!("Malformed type {} payload: {}", kind, e))
        };
        let data = match kind {
            TransactionType::AddWallet => {
                SpecificData::AddWallet(WalletPayload::deserialize(value).map_err(invalid)?)
            }
            TransactionType::CreateToken => {
                SpecificData::CreateToken(TokenPayload::deserialize(value).map_err(invalid)?)
            }
            TransactionType::ContractCall => {
                SpecificData::ContractCall(ContractCallPayload::deserialize(value).map_err(invalid)?)
            }
            TransactionType::TwoWayTransfer | TransactionType::OneWayTransfer => {
                SpecificData::Transfer {
                    two_way: kind == TransactionType::TwoWayTransfer,
                    payload: TransferPayload::deserialize(value).map_err(invalid)?,
                }
            }
            TransactionType::TrustScoreUpdate => {
                SpecificData::TrustScore(TrustScorePayload::deserialize(value).map_err(invalid)?)
            }
        };
        Ok(data)
    }
}
