use std::{
    sync::{
        atomic::{AtomicU8, Ordering},
        Arc,
    },
    time::Duration,
};

use crate::config::TimerPeriods;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Task {
    Ota,
    Network,
    Button,
}

impl Task {
    pub const ALL: [Task; 3] = [Task::Ota, Task::Network, Task::Button];

    fn bit(self) -> u8 {
        match self {
            Self::Ota => 0b001,
            Self::Network => 0b010,
            Self::Button => 0b100,
        }
    }

    pub fn period(self, periods: &TimerPeriods) -> Duration {
        let ms = match self {
            Self::Ota => periods.ota_ms,
            Self::Network => periods.network_ms,
            Self::Button => periods.button_ms,
        };
        Duration::from_millis(ms.max(1))
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ota => "ota",
            Self::Network => "network",
            Self::Button => "button",
        }
    }
}

// Timers only raise bits. The tick is the only place they are cleared.
#[derive(Debug, Default)]
pub struct ReadinessFlags {
    bits: AtomicU8,
}

impl ReadinessFlags {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, task: Task) {
        self.bits.fetch_or(task.bit(), Ordering::Release);
    }

    pub fn take(&self, task: Task) -> bool {
        self.bits.fetch_and(!task.bit(), Ordering::AcqRel) & task.bit() != 0
    }

    pub fn is_set(&self, task: Task) -> bool {
        self.bits.load(Ordering::Acquire) & task.bit() != 0
    }
}

pub fn flag_raiser(flags: &Arc<ReadinessFlags>, task: Task) -> impl Fn() + Send + Sync + 'static {
    let flags = Arc::clone(flags);
    move || flags.set(task)
}

pub trait Workload {
    fn poll_ota(&mut self);
    fn poll_network(&mut self);
    fn poll_button(&mut self);
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub ota: bool,
    pub network: bool,
    pub button: bool,
}

impl TickReport {
    pub fn ran(&self, task: Task) -> bool {
        match task {
            Task::Ota => self.ota,
            Task::Network => self.network,
            Task::Button => self.button,
        }
    }

    pub fn is_idle(&self) -> bool {
        !(self.ota || self.network || self.button)
    }
}

#[derive(Debug, Clone)]
pub struct Scheduler {
    flags: Arc<ReadinessFlags>,
    tick: Duration,
    periods: TimerPeriods,
}

impl Scheduler {
    pub fn new(tick: Duration, periods: TimerPeriods) -> Self {
        Self {
            flags: Arc::new(ReadinessFlags::new()),
            tick,
            periods,
        }
    }

    pub fn flags(&self) -> &Arc<ReadinessFlags> {
        &self.flags
    }

    pub fn tick_period(&self) -> Duration {
        self.tick
    }

    pub fn period(&self, task: Task) -> Duration {
        task.period(&self.periods)
    }

    // Runs one tick. Flags raised while work is running wait for the next tick.
    pub fn tick<W: Workload + ?Sized>(&self, workload: &mut W) -> TickReport {
        let mut report = TickReport::default();
        for task in Task::ALL {
            if !self.flags.take(task) {
                continue;
            }
            match task {
                Task::Ota => {
                    workload.poll_ota();
                    report.ota = true;
                }
                Task::Network => {
                    workload.poll_network();
                    report.network = true;
                }
                Task::Button => {
                    workload.poll_button();
                    report.button = true;
                }
            }
        }
        report
    }
}
