use std::time::{Duration, Instant};

/// Nested, named stopwatch.
///
/// A timer has at most one running child at a time; starting a new child stops
/// the running one first. Children may have children of their own, which is how
/// job payloads record sub-steps of a phase.
#[derive(Debug)]
pub struct PhaseTimer {
    name: String,
    started: Instant,
    stopped: Option<Instant>,
    children: Vec<PhaseTimer>,
    current: Option<usize>,
}

impl PhaseTimer {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            started: Instant::now(),
            stopped: None,
            children: Vec::new(),
            current: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn started_at(&self) -> Instant {
        self.started
    }

    pub fn is_running(&self) -> bool {
        self.stopped.is_none()
    }

    /// time since start, frozen once the timer is stopped
    pub fn elapsed(&self) -> Duration {
        match self.stopped {
            Some(stopped) => stopped.duration_since(self.started),
            None => self.started.elapsed(),
        }
    }

    /// start a named child, stopping the currently running one
    pub fn start_child(&mut self, name: impl Into<String>) -> &mut PhaseTimer {
        self.stop_child();

        self.children.push(PhaseTimer::new(name));
        let index = self.children.len() - 1;
        self.current = Some(index);

        &mut self.children[index]
    }

    /// stop the running child (and everything below it), no-op if there is none
    pub fn stop_child(&mut self) {
        if let Some(index) = self.current.take() {
            self.children[index].stop();
        }
    }

    pub fn stop(&mut self) {
        self.stop_child();

        if self.stopped.is_none() {
            self.stopped = Some(Instant::now());
        }
    }

    pub fn current_child(&self) -> Option<&PhaseTimer> {
        self.current.map(|index| &self.children[index])
    }

    pub fn current_child_mut(&mut self) -> Option<&mut PhaseTimer> {
        match self.current {
            Some(index) => Some(&mut self.children[index]),
            None => None,
        }
    }

    /// the running child, or the timer itself when no child runs
    pub fn active_mut(&mut self) -> &mut PhaseTimer {
        match self.current {
            Some(index) => &mut self.children[index],
            None => self,
        }
    }

    /// elapsed time of the running child, zero if no child runs
    pub fn current_child_elapsed(&self) -> Duration {
        self.current_child()
            .map(PhaseTimer::elapsed)
            .unwrap_or_default()
    }

    pub fn children(&self) -> impl Iterator<Item = &PhaseTimer> {
        self.children.iter()
    }

    /// immutable copy of the timer tree as of now
    pub fn snapshot(&self) -> TimerSnapshot {
        TimerSnapshot {
            name: self.name.clone(),
            elapsed: self.elapsed(),
            running: self.is_running(),
            children: self.children.iter().map(PhaseTimer::snapshot).collect(),
        }
    }
}

/// Point-in-time view of a `PhaseTimer`, safe to hand out to callers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimerSnapshot {
    pub name: String,
    pub elapsed: Duration,
    pub running: bool,
    pub children: Vec<TimerSnapshot>,
}

impl TimerSnapshot {
    /// first direct child with the given name
    pub fn phase(&self, name: &str) -> Option<&TimerSnapshot> {
        self.children.iter().find(|child| child.name == name)
    }

    /// names of the direct children in the order they were started
    pub fn phase_names(&self) -> Vec<&str> {
        self.children.iter().map(|child| child.name.as_str()).collect()
    }
}
