/// Normalised worker pool bounds.
///
/// The resident count is at least one and the maximum never falls below the
/// resident count. Adjustments made while normalising are recorded so the
/// daemon can log them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolLimits {
    resident: usize,
    max: usize,
    adjustments: Vec<LimitAdjustment>,
}

/// A correction applied to configured pool bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitAdjustment {
    /// A resident count of zero was raised to one.
    ResidentRaised,
    /// The maximum was below the resident count and was raised to match.
    MaxRaised {
        /// Maximum as configured.
        configured: usize,
    },
}

impl PoolLimits {
    /// Normalises configured bounds. An absent maximum equals the resident count.
    #[must_use]
    pub fn normalise(resident: usize, max: Option<usize>) -> Self {
        let mut adjustments = Vec::new();
        let resident = if resident == 0 {
            adjustments.push(LimitAdjustment::ResidentRaised);
            1
        } else {
            resident
        };
        let max = match max {
            None => resident,
            Some(configured) if configured < resident => {
                adjustments.push(LimitAdjustment::MaxRaised { configured });
                resident
            }
            Some(configured) => configured,
        };
        Self {
            resident,
            max,
            adjustments,
        }
    }

    /// Workers spawned at start-up.
    #[must_use]
    pub fn resident(&self) -> usize {
        self.resident
    }

    /// Ceiling on concurrently live workers.
    #[must_use]
    pub fn max(&self) -> usize {
        self.max
    }

    /// Corrections applied while normalising.
    #[must_use]
    pub fn adjustments(&self) -> &[LimitAdjustment] {
        &self.adjustments
    }
}
