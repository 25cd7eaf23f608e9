use std::collections::BTreeSet;

use crate::config::FlowConfig;

/// The ordered sequence of form steps and the gating rule between them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepPlan {
    first_step: u32,
    last_step: u32,
    optional: BTreeSet<u32>,
}

impl StepPlan {
    pub fn from_config(config: &FlowConfig) -> Self {
        config
            .optional_steps
            .iter()
            .fold(
                StepPlanBuilder::new(config.total_steps).first_step(config.first_step),
                |builder, step| builder.optional_step(*step),
            )
            .build()
    }

    pub fn first_step(&self) -> u32 {
        self.first_step
    }

    pub fn last_step(&self) -> u32 {
        self.last_step
    }

    pub fn step_count(&self) -> usize {
        (self.last_step - self.first_step + 1) as usize
    }

    pub fn contains(&self, step: u32) -> bool {
        (self.first_step..=self.last_step).contains(&step)
    }

    pub fn is_required(&self, step: u32) -> bool {
        self.contains(step) && !self.optional.contains(&step)
    }

    pub fn steps(&self) -> impl Iterator<Item = u32> + '_ {
        self.first_step..=self.last_step
    }

    pub fn clamp(&self, step: u32) -> u32 {
        step.clamp(self.first_step, self.last_step)
    }

    /// Step that follows `step`, never past the last one.
    pub fn next_step(&self, step: u32) -> u32 {
        self.clamp(step.saturating_add(1))
    }

    /// Required steps strictly before `target`.
    pub fn required_before(&self, target: u32) -> impl Iterator<Item = u32> + '_ {
        let end = target.min(self.last_step.saturating_add(1));
        (self.first_step..end).filter(|step| self.is_required(*step))
    }

    /// Required steps before `target` that are not yet completed.
    pub fn missing_before(&self, target: u32, completed: &BTreeSet<u32>) -> Vec<u32> {
        self.required_before(target)
            .filter(|step| !completed.contains(step))
            .collect()
    }

    /// Gating rule: the first step is always reachable, any later step only
    /// once every required step before it is completed.
    pub fn can_access(&self, target: u32, completed: &BTreeSet<u32>) -> bool {
        if target <= self.first_step {
            return true;
        }
        self.required_before(target)
            .all(|step| completed.contains(&step))
    }

    /// Furthest step at or before `step` that `completed` unlocks.
    pub fn furthest_reachable(&self, step: u32, completed: &BTreeSet<u32>) -> u32 {
        let mut step = self.clamp(step);
        while !self.can_access(step, completed) {
            step -= 1;
        }
        step
    }

    /// Whether every required step of the form is completed.
    pub fn is_complete(&self, completed: &BTreeSet<u32>) -> bool {
        self.steps()
            .filter(|step| self.is_required(*step))
            .all(|step| completed.contains(&step))
    }
}

/// Builder for [`StepPlan`].
pub struct StepPlanBuilder {
    first_step: u32,
    last_step: u32,
    optional: BTreeSet<u32>,
}

impl StepPlanBuilder {
    pub fn new(total_steps: u32) -> Self {
        Self {
            first_step: 1,
            last_step: total_steps.max(1),
            optional: BTreeSet::new(),
        }
    }

    pub fn first_step(mut self, first_step: u32) -> Self {
        self.first_step = first_step.min(1);
        self
    }

    pub fn optional_step(mut self, step: u32) -> Self {
        self.optional.insert(step);
        self
    }

    /// Step 0, when present, is the review step and never gates the others.
    pub fn build(mut self) -> StepPlan {
        let last_step = self.last_step.max(self.first_step);
        if self.first_step == 0 {
            self.optional.insert(0);
        }
        let optional = self
            .optional
            .into_iter()
            .filter(|step| (self.first_step..=last_step).contains(step))
            .collect();
        StepPlan {
            first_step: self.first_step,
            last_step,
            optional,
        }
    }
}
