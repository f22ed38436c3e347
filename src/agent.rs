use crate::consts::{FEATURE_COUNT, HIDDEN_LAYER_CHOICES, HIDDEN_LAYER_WEIGHTS, HIDDEN_WIDTH_CHOICES, OUTPUT_WIDTH};
use crate::market::MarketFeatures;
use crate::model::{DecisionModel, ModelError, SerializedModel};
use chrono::NaiveDate;
use rand::distributions::WeightedIndex;
use rand::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum TradeError {
    #[error("Cannot trade at non-positive or non-finite price {price} on {date}")]
    InvalidPrice { price: f64, date: NaiveDate },
}

#[derive(Error, Debug, PartialEq)]
pub enum AgentError {
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error("Wallet field `{field}` must be finite and non-negative, got {value}")]
    InvalidWallet { field: &'static str, value: f64 },
}

/// One executed (or held) decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeRecord {
    pub date: NaiveDate,
    pub action: f64,
    pub price: f64,
    pub wealth_change: f64,
}

/// Persisted agent. Trade history is transient and never stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SerializedAgent {
    #[serde(rename = "network")]
    pub model: SerializedModel,
    #[serde(rename = "fiat")]
    pub fiat_balance: f64,
    #[serde(rename = "btc")]
    pub crypto_balance: f64,
    #[serde(rename = "wealth")]
    pub total_wealth: f64,
}

/// An evolved trader: a decision model plus the wallet it trades with.
#[derive(Debug, Clone)]
pub struct Agent {
    model: DecisionModel,
    fiat_balance: f64,
    crypto_balance: f64,
    total_wealth: f64,
    trade_history: Vec<TradeRecord>,
}

/// Draws a random layer layout: 8 inputs, 0-2 hidden layers of width 4/8/16, 1 output.
pub fn random_architecture<R: Rng + ?Sized>(rng: &mut R) -> Vec<usize> {
    let hidden_layers = WeightedIndex::new(HIDDEN_LAYER_WEIGHTS)
        .map(|dist| HIDDEN_LAYER_CHOICES[dist.sample(rng)])
        .unwrap_or(1);

    let mut layer_sizes = Vec::with_capacity(hidden_layers + 2);
    layer_sizes.push(FEATURE_COUNT);
    for _ in 0..hidden_layers {
        layer_sizes.push(*HIDDEN_WIDTH_CHOICES.choose(rng).unwrap_or(&HIDDEN_WIDTH_CHOICES[0]));
    }
    layer_sizes.push(OUTPUT_WIDTH);
    layer_sizes
}

impl Agent {
    pub fn new(model: DecisionModel, initial_fiat: f64) -> Self {
        Agent {
            model,
            fiat_balance: initial_fiat,
            crypto_balance: 0.0,
            total_wealth: initial_fiat,
            trade_history: Vec::new(),
        }
    }

    /// Agent with a freshly drawn architecture and small random weights.
    pub fn random<R: Rng + ?Sized>(initial_fiat: f64, rng: &mut R) -> Result<Self, ModelError> {
        let layer_sizes = random_architecture(rng);
        let model = DecisionModel::new(&layer_sizes, rng)?;
        Ok(Agent::new(model, initial_fiat))
    }

    pub fn model(&self) -> &DecisionModel {
        &self.model
    }

    pub fn model_mut(&mut self) -> &mut DecisionModel {
        &mut self.model
    }

    pub fn fiat_balance(&self) -> f64 {
        self.fiat_balance
    }

    pub fn crypto_balance(&self) -> f64 {
        self.crypto_balance
    }

    pub fn total_wealth(&self) -> f64 {
        self.total_wealth
    }

    pub fn trade_history(&self) -> &[TradeRecord] {
        &self.trade_history
    }

    /// Puts the wallet back to its start-of-generation state.
    pub fn reset_wallet(&mut self, initial_fiat: f64) {
        self.fiat_balance = initial_fiat;
        self.crypto_balance = 0.0;
        self.total_wealth = initial_fiat;
        self.trade_history.clear();
    }

    /// Deep copy of the model with a fresh wallet and empty history.
    pub fn offspring(&self, initial_fiat: f64) -> Self {
        Agent::new(self.model.clone(), initial_fiat)
    }

    pub fn decide(&self, features: &MarketFeatures) -> f64 {
        self.model.predict(&features.to_vector())
    }

    /// Applies `action` as a fraction of the wallet: positive spends that share
    /// of fiat on crypto, negative sells that share of crypto, zero holds.
    ///
    /// Non-finite actions are treated as a hold. The price must be strictly
    /// positive since buying divides by it.
    pub fn execute_trade(&mut self, action: f64, price: f64, date: NaiveDate) -> Result<(), TradeError> {
        if !(price.is_finite() && price > 0.0) {
            return Err(TradeError::InvalidPrice { price, date });
        }
        let action = if action.is_finite() {
            action.clamp(-1.0, 1.0)
        } else {
            0.0
        };
        let previous_wealth = self.total_wealth;

        if action > 0.0 {
            let fiat_spent = self.fiat_balance * action;
            self.fiat_balance -= fiat_spent;
            self.crypto_balance += fiat_spent / price;
        } else if action < 0.0 {
            let crypto_sold = self.crypto_balance * -action;
            self.crypto_balance -= crypto_sold;
            self.fiat_balance += crypto_sold * price;
        }

        self.total_wealth = self.fiat_balance + self.crypto_balance * price;
        self.trade_history.push(TradeRecord {
            date,
            action,
            price,
            wealth_change: self.total_wealth - previous_wealth,
        });
        Ok(())
    }

    /// Liquidates every crypto holding so the agent is scored on fiat alone.
    pub fn sell_all(&mut self, price: f64, date: NaiveDate) -> Result<(), TradeError> {
        self.execute_trade(-1.0, price, date)
    }

    pub fn serialize(&self) -> SerializedAgent {
        SerializedAgent {
            model: self.model.serialize(),
            fiat_balance: self.fiat_balance,
            crypto_balance: self.crypto_balance,
            total_wealth: self.total_wealth,
        }
    }

    pub fn deserialize(data: &SerializedAgent) -> Result<Self, AgentError> {
        let model = DecisionModel::deserialize(&data.model)?;
        for (field, value) in [
            ("fiat", data.fiat_balance),
            ("btc", data.crypto_balance),
            ("wealth", data.total_wealth),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(AgentError::InvalidWallet { field, value });
            }
        }
        Ok(Agent {
            model,
            fiat_balance: data.fiat_balance,
            crypto_balance: data.crypto_balance,
            total_wealth: data.total_wealth,
            trade_history: Vec::new(),
        })
    }
}

impl std::fmt::Display for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Agent: ${:.2} + BTC {:.4} (Total: ${:.2})",
            self.fiat_balance, self.crypto_balance, self.total_wealth
        )
    }
}
