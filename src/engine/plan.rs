//! The bounded (tier × round × credential) search for one job.

/// One cell of the search matrix. Indices refer to the planner's tier list
/// and credential pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlanStep {
    pub tier: usize,
    /// 1-based round within the tier.
    pub round: u32,
    pub credential: usize,
}

/// Iterator over the attempt matrix: tiers in order, `rounds` rounds per tier,
/// and every credential per round in rotation order starting at `offset`.
///
/// The consumer steers it with [`AttemptPlan::end_round`] and
/// [`AttemptPlan::end_tier`]; it never yields more than
/// `tiers × rounds × credentials` steps.
#[derive(Debug, Clone)]
pub struct AttemptPlan {
    tiers: usize,
    rounds: u32,
    rotation: Vec<usize>,
    tier: usize,
    round: u32,
    position: usize,
}

impl AttemptPlan {
    pub fn new(tiers: usize, rounds: u32, credentials: usize, offset: usize) -> Self {
        let start = offset.checked_rem(credentials).unwrap_or(0);
        let rotation = (0..credentials)
            .map(|i| (start + i) % credentials)
            .collect();
        Self {
            tiers,
            rounds,
            rotation,
            tier: 0,
            round: 1,
            position: 0,
        }
    }

    /// Skip the remaining credentials of the current round.
    pub fn end_round(&mut self) {
        self.position = self.rotation.len();
    }

    /// Skip the remaining rounds of the current tier.
    pub fn end_tier(&mut self) {
        self.round = self.rounds;
        self.position = self.rotation.len();
    }

    pub fn max_steps(&self) -> usize {
        self.tiers * self.rounds as usize * self.rotation.len()
    }
}

impl Iterator for AttemptPlan {
    type Item = PlanStep;

    fn next(&mut self) -> Option<PlanStep> {
        if self.rotation.is_empty() || self.rounds == 0 {
            return None;
        }

        while self.tier < self.tiers {
            if let Some(&credential) = self.rotation.get(self.position) {
                self.position += 1;
                return Some(PlanStep {
                    tier: self.tier,
                    round: self.round,
                    credential,
                });
            }

            self.position = 0;
            if self.round < self.rounds {
                self.round += 1;
            } else {
                self.tier += 1;
                self.round = 1;
            }
        }

        None
    }
}
