//! Spend budget for one slot.
//!
//! Two independent spend checks exist and are never assumed to agree:
//! a sessions-per-dollar heuristic and token accounting.

/// Spend policy for one slot.
#[derive(Debug, Clone, PartialEq)]
pub struct BudgetPolicy {
    /// Spend cap in dollars for the active mode.
    pub cap_usd: f64,
    /// Rough number of sessions one dollar buys.
    pub sessions_per_dollar: f64,
    /// Price per 1K input tokens.
    pub input_per_1k_usd: f64,
    /// Price per 1K output tokens.
    pub output_per_1k_usd: f64,
}

/// Why the budget gate stopped a slot.
#[derive(Debug, Clone, PartialEq)]
pub enum BudgetVerdict {
    Within,
    /// The heuristic session count reached `max_sessions`.
    SessionsExhausted { sessions: u64, max_sessions: u64 },
    /// Accounted token spend reached the cap.
    TokenSpendExceeded { spent_usd: f64, cap_usd: f64 },
}

impl BudgetVerdict {
    pub fn is_exceeded(&self) -> bool {
        !matches!(self, BudgetVerdict::Within)
    }

    pub fn summary(&self) -> String {
        match self {
            BudgetVerdict::Within => "within budget".to_string(),
            BudgetVerdict::SessionsExhausted {
                sessions,
                max_sessions,
            } => format!("budget exceeded: {sessions} sessions of {max_sessions} allowed"),
            BudgetVerdict::TokenSpendExceeded { spent_usd, cap_usd } => {
                format!("budget exceeded: ${spent_usd:.2} spent of ${cap_usd:.2} cap")
            }
        }
    }
}

impl BudgetPolicy {
    /// Heuristic session allowance: `floor(cap × sessions_per_dollar)`.
    pub fn max_sessions(&self) -> u64 {
        (self.cap_usd * self.sessions_per_dollar).floor().max(0.0) as u64
    }

    /// Estimated dollars spent after `sessions` sessions, by heuristic.
    pub fn estimated_spend(&self, sessions: u64) -> f64 {
        if self.sessions_per_dollar <= 0.0 {
            return 0.0;
        }
        sessions as f64 / self.sessions_per_dollar
    }

    /// Dollars spent according to token accounting.
    pub fn token_spend(&self, tokens_in: u64, tokens_out: u64) -> f64 {
        tokens_in as f64 / 1000.0 * self.input_per_1k_usd
            + tokens_out as f64 / 1000.0 * self.output_per_1k_usd
    }

    /// Decide whether another session may start after `sessions` completed ones.
    pub fn check(&self, sessions: u64, tokens_in: u64, tokens_out: u64) -> BudgetVerdict {
        let max_sessions = self.max_sessions();
        if sessions >= max_sessions {
            return BudgetVerdict::SessionsExhausted {
                sessions,
                max_sessions,
            };
        }
        let spent_usd = self.token_spend(tokens_in, tokens_out);
        if spent_usd >= self.cap_usd {
            return BudgetVerdict::TokenSpendExceeded {
                spent_usd,
                cap_usd: self.cap_usd,
            };
        }
        BudgetVerdict::Within
    }
}
