//! Execution scheduler - determines which steps to run next

use crate::execution::resolver::StepGraph;
use std::collections::BTreeSet;

/// Strategy for scheduling step execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SchedulingStrategy {
    /// Execute steps in dependency order, one at a time
    #[default]
    Sequential,

    /// Execute all ready steps in parallel
    Parallel,

    /// Limited parallelism (max N concurrent steps)
    LimitedParallel(usize),
}

impl SchedulingStrategy {
    /// Maximum number of steps in flight at once
    pub fn capacity(&self) -> usize {
        match self {
            SchedulingStrategy::Sequential => 1,
            SchedulingStrategy::Parallel => usize::MAX,
            SchedulingStrategy::LimitedParallel(max) => (*max).max(1),
        }
    }
}

/// Ready-set bookkeeping over a resolved graph
///
/// A step becomes ready once every step it depends on finished satisfied. Steps behind a
/// failure never become ready. Ready steps are handed out in execution order.
pub struct ExecutionScheduler {
    strategy: SchedulingStrategy,
    /// (position, index) so the set iterates in execution order
    ready: BTreeSet<(usize, usize)>,
    waiting_on: Vec<usize>,
    running: usize,
}

impl ExecutionScheduler {
    pub fn new(strategy: SchedulingStrategy, graph: &StepGraph) -> Self {
        let waiting_on: Vec<usize> = (0..graph.len()).map(|i| graph.dependencies(i).len()).collect();
        let ready = waiting_on
            .iter()
            .enumerate()
            .filter(|(_, waiting)| **waiting == 0)
            .map(|(i, _)| (graph.position(i), i))
            .collect();

        Self {
            strategy,
            ready,
            waiting_on,
            running: 0,
        }
    }

    pub fn strategy(&self) -> SchedulingStrategy {
        self.strategy
    }

    /// Get the next batch of steps to execute and count them as running
    pub fn next_steps(&mut self) -> Vec<usize> {
        let remaining = self.strategy.capacity().saturating_sub(self.running);
        let mut next = Vec::new();
        while next.len() < remaining {
            match self.ready.pop_first() {
                Some((_, index)) => next.push(index),
                None => break,
            }
        }
        self.running += next.len();
        next
    }

    /// Record a finished step; satisfied steps release their dependents
    pub fn complete(&mut self, graph: &StepGraph, index: usize, satisfied: bool) {
        self.running = self.running.saturating_sub(1);
        if !satisfied {
            return;
        }
        for &dependent in graph.dependents(index) {
            self.waiting_on[dependent] -= 1;
            if self.waiting_on[dependent] == 0 {
                self.ready.insert((graph.position(dependent), dependent));
            }
        }
    }

    /// Steps currently counted as running
    pub fn running(&self) -> usize {
        self.running
    }

    pub fn has_ready(&self) -> bool {
        !self.ready.is_empty()
    }

    /// Check if there are more steps to run or wait for
    pub fn has_more(&self) -> bool {
        self.running > 0 || self.has_ready()
    }
}
