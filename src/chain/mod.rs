//! Solana plumbing for SPL payouts: address parsing, associated token
//! accounts, the payout instruction set and the fee-payer signer.

use std::str::FromStr;

use ed25519_dalek::{Signer as _, SigningKey};
use solana_compute_budget_interface::ComputeBudgetInstruction;
use solana_instruction::Instruction;
use solana_signature::Signature;
use solana_signer::{Signer, SignerError};
use spl_associated_token_account_client::{
    address::get_associated_token_address_with_program_id,
    instruction::create_associated_token_account_idempotent,
};

mod payer;

pub use payer::{PayerConfig, PayoutError, PayoutReceipt, RpcPayer, TokenPayer};
pub use solana_pubkey::Pubkey;

#[derive(Debug, thiserror::Error)]
pub enum ChainError {
    #[error("invalid address {0:?}")]
    InvalidAddress(String),
    #[error("invalid keypair: {0}")]
    InvalidKeypair(String),
    #[error("cannot build instruction: {0}")]
    Instruction(String),
}

pub fn parse_address(address: &str) -> Result<Pubkey, ChainError> {
    Pubkey::from_str(address.trim()).map_err(|_| ChainError::InvalidAddress(address.to_string()))
}

/// Associated token account of `wallet` for `mint` under the classic token program.
pub fn associated_token_address(wallet: &Pubkey, mint: &Pubkey) -> Pubkey {
    get_associated_token_address_with_program_id(wallet, mint, &spl_token::id())
}

#[derive(Clone, Copy, Debug)]
pub struct ComputeBudget {
    pub unit_limit: u32,
    /// Micro-lamports per compute unit.
    pub unit_price: u64,
}

/// Compute budget, an idempotent recipient account create when asked for,
/// then the transfer from the payer's own token account.
pub fn payout_instructions(
    payer: &Pubkey,
    recipient: &Pubkey,
    mint: &Pubkey,
    amount: u64,
    create_recipient_account: bool,
    budget: ComputeBudget,
) -> Result<Vec<Instruction>, ChainError> {
    let token_program = spl_token::id();
    let source = associated_token_address(payer, mint);
    let destination = associated_token_address(recipient, mint);

    let mut instructions = vec![
        ComputeBudgetInstruction::set_compute_unit_limit(budget.unit_limit),
        ComputeBudgetInstruction::set_compute_unit_price(budget.unit_price),
    ];
    if create_recipient_account {
        instructions.push(create_associated_token_account_idempotent(
            payer,
            recipient,
            mint,
            &token_program,
        ));
    }
    let transfer = spl_token::instruction::transfer(
        &token_program,
        &source,
        &destination,
        payer,
        &[],
        amount,
    )
    .map_err(|e| ChainError::Instruction(e.to_string()))?;
    instructions.push(transfer);
    Ok(instructions)
}

/// The configured ed25519 key acting as fee payer and token authority.
pub struct PayerKey(SigningKey);

impl PayerKey {
    /// Base58 of the 64-byte secret+public keypair; the halves must agree.
    pub fn from_base58(encoded: &str) -> Result<Self, ChainError> {
        let bytes = bs58::decode(encoded.trim())
            .into_vec()
            .map_err(|e| ChainError::InvalidKeypair(e.to_string()))?;
        let bytes: [u8; 64] = bytes.try_into().map_err(|b: Vec<u8>| {
            ChainError::InvalidKeypair(format!("expected 64 bytes, got {}", b.len()))
        })?;
        SigningKey::from_keypair_bytes(&bytes)
            .map(PayerKey)
            .map_err(|e| ChainError::InvalidKeypair(e.to_string()))
    }
}

impl From<SigningKey> for PayerKey {
    fn from(key: SigningKey) -> Self {
        PayerKey(key)
    }
}

impl Signer for PayerKey {
    fn try_pubkey(&self) -> Result<Pubkey, SignerError> {
        Ok(Pubkey::new_from_array(self.0.verifying_key().to_bytes()))
    }

    fn try_sign_message(&self, message: &[u8]) -> Result<Signature, SignerError> {
        Ok(Signature::from(self.0.sign(message).to_bytes()))
    }

    fn is_interactive(&self) -> bool {
        false
    }
}
