//! Run state machine
//!
//! `RunTracker` correlates launch results with liveness callbacks. It does no
//! I/O; the control loop feeds it events and acts on what it returns.

use std::collections::{BTreeMap, BTreeSet};

use super::types::{Machine, OutstandingEntry, ProgressSnapshot};

/// What the control loop should do with a launched machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LaunchDisposition {
    /// Now waiting for its callback
    Outstanding,
    /// Its callback arrived before the launch result; it is already confirmed
    ConfirmedEarly(Machine),
    /// A launch for this index was already recorded
    Duplicate,
    /// Index outside `0..count`
    OutOfRange,
}

/// What the control loop should do with a liveness callback
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallbackDisposition {
    /// Matched an outstanding machine, which is removed from the set
    Confirmed(Machine),
    /// Valid index that has not launched yet; buffered until it does
    Early,
    /// Index already confirmed or already buffered
    Duplicate,
    /// Index whose launch gave up
    Abandoned,
    /// Index outside `0..count`
    Unknown,
}

/// Outstanding set and counters for one run
#[derive(Debug, Clone)]
pub struct RunTracker {
    count: usize,
    outstanding: BTreeMap<usize, Machine>,
    /// Indices whose launch resolved, successfully or not
    resolved: BTreeSet<usize>,
    gave_up: BTreeSet<usize>,
    confirmed: BTreeSet<usize>,
    early: BTreeSet<usize>,
    started: usize,
    callbacks: usize,
    failed_launches: usize,
}

impl RunTracker {
    pub fn new(count: usize) -> Self {
        Self {
            count,
            outstanding: BTreeMap::new(),
            resolved: BTreeSet::new(),
            gave_up: BTreeSet::new(),
            confirmed: BTreeSet::new(),
            early: BTreeSet::new(),
            started: 0,
            callbacks: 0,
            failed_launches: 0,
        }
    }

    pub fn on_launched(&mut self, machine: Machine) -> LaunchDisposition {
        let index = machine.index;
        if index >= self.count {
            return LaunchDisposition::OutOfRange;
        }
        if !self.resolved.insert(index) {
            return LaunchDisposition::Duplicate;
        }
        self.started += 1;

        if self.early.remove(&index) {
            self.confirmed.insert(index);
            LaunchDisposition::ConfirmedEarly(machine)
        } else {
            self.outstanding.insert(index, machine);
            LaunchDisposition::Outstanding
        }
    }

    /// Record a launch that exhausted its retries. Returns false if ignored.
    pub fn on_gave_up(&mut self, index: usize) -> bool {
        if index >= self.count || !self.resolved.insert(index) {
            return false;
        }
        self.gave_up.insert(index);
        self.early.remove(&index);
        self.failed_launches += 1;
        true
    }

    pub fn on_callback(&mut self, index: usize) -> CallbackDisposition {
        if index >= self.count {
            return CallbackDisposition::Unknown;
        }
        if self.confirmed.contains(&index) || self.early.contains(&index) {
            return CallbackDisposition::Duplicate;
        }
        if self.gave_up.contains(&index) {
            return CallbackDisposition::Abandoned;
        }

        self.callbacks += 1;
        match self.outstanding.remove(&index) {
            Some(machine) => {
                self.confirmed.insert(index);
                CallbackDisposition::Confirmed(machine)
            }
            None => {
                self.early.insert(index);
                CallbackDisposition::Early
            }
        }
    }

    /// Every launch resolved and nothing is left waiting
    pub fn is_complete(&self) -> bool {
        self.started + self.failed_launches == self.count && self.outstanding.is_empty()
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn started(&self) -> usize {
        self.started
    }

    pub fn callbacks(&self) -> usize {
        self.callbacks
    }

    pub fn failed_launches(&self) -> usize {
        self.failed_launches
    }

    pub fn outstanding_len(&self) -> usize {
        self.outstanding.len()
    }

    pub fn is_outstanding(&self, index: usize) -> bool {
        self.outstanding.contains_key(&index)
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        ProgressSnapshot {
            started: self.started,
            callbacks: self.callbacks,
            failed_launches: self.failed_launches,
            outstanding: self
                .outstanding
                .values()
                .map(|m| OutstandingEntry {
                    index: m.index,
                    instance_id: m.instance_id.clone(),
                    node: m.node.clone(),
                })
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn machine(index: usize) -> Machine {
        Machine {
            index,
            instance_id: format!("uuid-{index}"),
            node: Some("sf-1".to_string()),
            console_port: None,
        }
    }

    #[test]
    fn test_launch_then_callback_in_any_order() {
        let mut tracker = RunTracker::new(3);
        for i in 0..3 {
            assert_eq!(tracker.on_launched(machine(i)), LaunchDisposition::Outstanding);
        }
        assert_eq!(tracker.outstanding_len(), 3);

        assert!(matches!(tracker.on_callback(1), CallbackDisposition::Confirmed(_)));
        assert!(!tracker.is_complete());
        assert!(matches!(tracker.on_callback(0), CallbackDisposition::Confirmed(_)));
        assert!(!tracker.is_complete());
        assert!(matches!(tracker.on_callback(2), CallbackDisposition::Confirmed(_)));
        assert!(tracker.is_complete());

        assert_eq!(tracker.started(), 3);
        assert_eq!(tracker.callbacks(), 3);
    }

    #[test]
    fn test_early_callback_confirms_on_launch() {
        let mut tracker = RunTracker::new(2);
        tracker.on_launched(machine(0));

        assert_eq!(tracker.on_callback(1), CallbackDisposition::Early);
        assert_eq!(tracker.callbacks(), 1);
        assert!(!tracker.is_outstanding(1));

        assert_eq!(
            tracker.on_launched(machine(1)),
            LaunchDisposition::ConfirmedEarly(machine(1))
        );
        assert!(!tracker.is_outstanding(1));
        assert_eq!(tracker.started(), 2);

        tracker.on_callback(0);
        assert!(tracker.is_complete());
        assert_eq!(tracker.callbacks(), 2);
    }

    #[test]
    fn test_early_callbacks_do_not_complete_before_launches() {
        let mut tracker = RunTracker::new(2);
        tracker.on_launched(machine(0));
        tracker.on_callback(0);
        tracker.on_callback(1);

        assert_eq!(tracker.outstanding_len(), 0);
        assert!(!tracker.is_complete());
    }

    #[test]
    fn test_duplicate_and_unknown_callbacks_leave_counters_alone() {
        let mut tracker = RunTracker::new(2);
        tracker.on_launched(machine(0));
        tracker.on_callback(0);

        assert_eq!(tracker.on_callback(0), CallbackDisposition::Duplicate);
        assert_eq!(tracker.on_callback(7), CallbackDisposition::Unknown);
        assert_eq!(tracker.callbacks(), 1);

        assert_eq!(tracker.on_callback(1), CallbackDisposition::Early);
        assert_eq!(tracker.on_callback(1), CallbackDisposition::Duplicate);
        assert_eq!(tracker.callbacks(), 2);
    }

    #[test]
    fn test_duplicate_launch_is_ignored() {
        let mut tracker = RunTracker::new(1);
        tracker.on_launched(machine(0));
        assert_eq!(tracker.on_launched(machine(0)), LaunchDisposition::Duplicate);
        assert_eq!(tracker.on_launched(machine(5)), LaunchDisposition::OutOfRange);
        assert_eq!(tracker.started(), 1);
        assert_eq!(tracker.outstanding_len(), 1);
    }

    #[test]
    fn test_gave_up_counts_toward_completion() {
        let mut tracker = RunTracker::new(2);
        tracker.on_launched(machine(0));
        assert!(tracker.on_gave_up(1));
        assert!(!tracker.on_gave_up(1));
        assert!(!tracker.is_complete());

        assert_eq!(tracker.on_callback(1), CallbackDisposition::Abandoned);
        tracker.on_callback(0);
        assert!(tracker.is_complete());
        assert_eq!(tracker.failed_launches(), 1);
        assert_eq!(tracker.callbacks(), 1);
    }

    #[test]
    fn test_snapshot_is_ordered_by_index() {
        let mut tracker = RunTracker::new(3);
        tracker.on_launched(machine(2));
        tracker.on_launched(machine(0));

        let snapshot = tracker.snapshot();
        let indices: Vec<usize> = snapshot.outstanding.iter().map(|e| e.index).collect();
        assert_eq!(indices, vec![0, 2]);
        assert_eq!(snapshot.started, 2);
    }

    mod proptest_tests {
        use super::*;
        use proptest::prelude::*;

        #[derive(Debug, Clone)]
        enum Step {
            Launch(usize),
            Callback(usize),
        }

        /// Every index launched once and called back at least once, plus
        /// noise callbacks (duplicates and out-of-range), in random order.
        fn run_strategy() -> impl Strategy<Value = (usize, Vec<Step>)> {
            (1usize..16)
                .prop_flat_map(|count| {
                    let launches = Just((0..count).collect::<Vec<_>>()).prop_shuffle();
                    let callbacks = prop::collection::vec(0..count * 2, 0..count)
                        .prop_map(move |noise| {
                            let mut all: Vec<usize> = (0..count).collect();
                            all.extend(noise);
                            all
                        })
                        .prop_shuffle();
                    let picks = prop::collection::vec(any::<bool>(), count * 3);
                    (Just(count), launches, callbacks, picks)
                })
                .prop_map(|(count, launches, callbacks, picks)| {
                    let mut launches = launches.into_iter();
                    let mut callbacks = callbacks.into_iter();
                    let mut steps = Vec::new();
                    for pick in picks {
                        let next = if pick {
                            launches.next().map(Step::Launch)
                        } else {
                            callbacks.next().map(Step::Callback)
                        };
                        steps.extend(next);
                    }
                    steps.extend(launches.map(Step::Launch));
                    steps.extend(callbacks.map(Step::Callback));
                    (count, steps)
                })
        }

        fn apply(tracker: &mut RunTracker, step: &Step) {
            match *step {
                Step::Launch(i) => {
                    tracker.on_launched(Machine {
                        index: i,
                        instance_id: format!("uuid-{i}"),
                        node: None,
                        console_port: None,
                    });
                }
                Step::Callback(i) => {
                    tracker.on_callback(i);
                }
            }
        }

        proptest! {
            /// Any interleaving where every index launches and phones home ends complete
            #[test]
            fn every_interleaving_completes((count, steps) in run_strategy()) {
                let mut tracker = RunTracker::new(count);
                for step in &steps {
                    apply(&mut tracker, step);
                }
                prop_assert!(tracker.is_complete());
                prop_assert_eq!(tracker.started(), count);
                prop_assert_eq!(tracker.callbacks(), count);
                prop_assert_eq!(tracker.outstanding_len(), 0);
            }

            /// Counters never exceed count and the outstanding set never exceeds started
            #[test]
            fn counters_stay_bounded((count, steps) in run_strategy()) {
                let mut tracker = RunTracker::new(count);
                let mut last = (0, 0);
                for step in &steps {
                    apply(&mut tracker, step);
                    prop_assert!(tracker.started() <= count);
                    prop_assert!(tracker.callbacks() <= count);
                    prop_assert!(tracker.outstanding_len() <= tracker.started());
                    prop_assert!(tracker.started() >= last.0);
                    prop_assert!(tracker.callbacks() >= last.1);
                    last = (tracker.started(), tracker.callbacks());
                }
            }

            /// Once complete, further callbacks cannot undo completion
            #[test]
            fn completion_is_stable(
                (count, steps) in run_strategy(),
                extra in prop::collection::vec(0usize..64, 0..16)
            ) {
                let mut tracker = RunTracker::new(count);
                for step in &steps {
                    apply(&mut tracker, step);
                }
                for i in extra {
                    tracker.on_callback(i);
                    prop_assert!(tracker.is_complete());
                }
            }
        }
    }
}
