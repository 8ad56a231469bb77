#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Handoffs allowed in one job.
    pub max_handoffs: u32,
    /// Handoffs allowed between the same two agents, either direction.
    pub max_bounces_per_pair: u32,
    /// Router delegations allowed in one job.
    pub max_delegations: u32,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            max_handoffs: 8,
            max_bounces_per_pair: 3,
            max_delegations: 16,
        }
    }
}

impl CoordinatorConfig {
    pub fn with_max_handoffs(mut self, max_handoffs: u32) -> Self {
        self.max_handoffs = max_handoffs;
        self
    }

    pub fn with_max_bounces_per_pair(mut self, max_bounces: u32) -> Self {
        self.max_bounces_per_pair = max_bounces;
        self
    }

    pub fn with_max_delegations(mut self, max_delegations: u32) -> Self {
        self.max_delegations = max_delegations;
        self
    }
}
