/// Model options.
///
/// `order` and `sanitize_tokens` are fixed when a model is created; the rest
/// can be changed at any time through [`OptionsUpdate`].
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::Duration;

use crate::error::{ChainError, ChainResult};
use crate::history::EventKind;

/// Options stored with every model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelOptions {
    /// Number of preceding tokens that select the next-token distribution
    pub order: usize,

    /// Run context tokens through [`crate::types::sanitize`] while training
    pub sanitize_tokens: bool,

    /// Apply the probability shifter during generation
    pub shift_probabilities: bool,

    /// Approximate number of links per partition before resharding
    pub partition_size: u64,

    /// Close a partition after this long without reads or writes
    pub partition_idle_timeout: Duration,

    /// Event kinds written to the audit log
    pub store_history: BTreeSet<EventKind>,
}

impl Default for ModelOptions {
    fn default() -> Self {
        Self {
            order: 2,
            sanitize_tokens: true,
            shift_probabilities: false,
            partition_size: 250_000,
            partition_idle_timeout: Duration::from_secs(300),
            store_history: BTreeSet::new(),
        }
    }
}

impl ModelOptions {
    /// Options for a chain of the given order, everything else default.
    pub fn with_order(order: usize) -> Self {
        Self {
            order,
            ..Self::default()
        }
    }

    /// Builder: set the partition size.
    pub fn partition_size(mut self, size: u64) -> Self {
        self.partition_size = size;
        self
    }

    /// Builder: set the idle timeout.
    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.partition_idle_timeout = timeout;
        self
    }

    /// Builder: enable or disable sanitization.
    pub fn sanitize(mut self, enabled: bool) -> Self {
        self.sanitize_tokens = enabled;
        self
    }

    /// Builder: enable or disable probability shifting.
    pub fn shift(mut self, enabled: bool) -> Self {
        self.shift_probabilities = enabled;
        self
    }

    /// Builder: log the given event kinds.
    pub fn history(mut self, kinds: impl IntoIterator<Item = EventKind>) -> Self {
        self.store_history = kinds.into_iter().collect();
        self
    }

    /// Reject options a model cannot be created with.
    pub fn validate(&self) -> ChainResult<()> {
        if self.order == 0 {
            return Err(ChainError::InvalidOptions {
                reason: "order must be at least 1".to_string(),
            });
        }
        if self.partition_size == 0 {
            return Err(ChainError::InvalidOptions {
                reason: "partition_size must be at least 1".to_string(),
            });
        }
        Ok(())
    }

    /// Apply an update, leaving `self` untouched on conflict.
    pub fn apply(&self, update: &OptionsUpdate) -> ChainResult<ModelOptions> {
        if let Some(order) = update.order {
            if order != self.order {
                return Err(ChainError::ConfigurationConflict {
                    option: "order",
                    current: self.order.to_string(),
                    requested: order.to_string(),
                });
            }
        }
        if let Some(sanitize) = update.sanitize_tokens {
            if sanitize != self.sanitize_tokens {
                return Err(ChainError::ConfigurationConflict {
                    option: "sanitize_tokens",
                    current: self.sanitize_tokens.to_string(),
                    requested: sanitize.to_string(),
                });
            }
        }

        let mut next = self.clone();
        if let Some(shift) = update.shift_probabilities {
            next.shift_probabilities = shift;
        }
        if let Some(size) = update.partition_size {
            next.partition_size = size.max(1);
        }
        if let Some(timeout) = update.partition_idle_timeout {
            next.partition_idle_timeout = timeout;
        }
        if let Some(kinds) = &update.store_history {
            next.store_history = kinds.clone();
        }
        Ok(next)
    }

    /// Check that creation options agree with a model loaded from disk.
    pub fn check_compatible(&self, requested: &ModelOptions) -> ChainResult<()> {
        self.apply(&OptionsUpdate {
            order: Some(requested.order),
            sanitize_tokens: Some(requested.sanitize_tokens),
            ..OptionsUpdate::default()
        })
        .map(|_| ())
    }
}

/// Partial options for `configure`. `None` leaves a field unchanged.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OptionsUpdate {
    pub order: Option<usize>,
    pub sanitize_tokens: Option<bool>,
    pub shift_probabilities: Option<bool>,
    pub partition_size: Option<u64>,
    pub partition_idle_timeout: Option<Duration>,
    pub store_history: Option<BTreeSet<EventKind>>,
}
